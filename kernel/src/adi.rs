//! ADI -- Axle Driver Interface.
//!
//! Userland drivers adopt a hardware interrupt vector: registration maps
//! the vector to the calling task and elevates it to the driver priority
//! class. When the IRQ fires, the dispatch stub counts it pending and
//! wakes the driver; the driver services the hardware and acknowledges
//! with an end-of-interrupt.

use alloc::string::String;

use crate::{
    arch::x86_64::{apic, idt},
    error::{AdiError, KernelResult},
    sched::{self, BlockReason, PriorityClass, TaskPtr, UnblockReason},
    sync::IrqSpinlock,
};

/// Lowest vector a driver may adopt (the timer vector below it belongs to
/// the scheduler).
const FIRST_DELEGATED_VECTOR: u32 = apic::IRQ_VECTOR_BASE as u32 + 1;

/// One past the highest delegatable vector.
const VECTOR_LIMIT: u32 = idt::IRQ_VECTOR_LIMIT as u32;

/// A driver's claim on an interrupt vector.
struct AdiDriver {
    name: String,
    task: TaskPtr,
    /// IRQs that have arrived and not yet been acknowledged. A driver's own
    /// I/O can re-raise its line while it is still running, so this is a
    /// counter, not a flag.
    pending_irq_count: u32,
}

/// Vector-indexed driver table (slot 0 is vector `FIRST_DELEGATED_VECTOR`).
static DRIVERS: IrqSpinlock<[Option<AdiDriver>; (VECTOR_LIMIT - FIRST_DELEGATED_VECTOR) as usize]> =
    IrqSpinlock::new([const { None }; (VECTOR_LIMIT - FIRST_DELEGATED_VECTOR) as usize]);

fn slot_of(vector: u32) -> Option<usize> {
    if (FIRST_DELEGATED_VECTOR..VECTOR_LIMIT).contains(&vector) {
        Some((vector - FIRST_DELEGATED_VECTOR) as usize)
    } else {
        None
    }
}

/// Claim `vector` for the calling task and elevate it to driver priority.
/// The corresponding IRQ line is routed and unmasked at the I/O APIC.
pub fn register_driver(name: &str, vector: u32) -> KernelResult<()> {
    let slot = slot_of(vector).ok_or(AdiError::InvalidVector)?;
    let task = sched::current_task();

    {
        let mut drivers = DRIVERS.lock();
        if drivers[slot].is_some() {
            return Err(AdiError::VectorInUse.into());
        }
        drivers[slot] = Some(AdiDriver {
            name: String::from(name),
            task,
            pending_irq_count: 0,
        });
        // SAFETY: mutating our own TCB; the scheduler requeues us into the
        // driver class on the next transition.
        unsafe {
            task.get().priority = PriorityClass::Driver;
        }
    }

    apic::route_irq((vector - apic::IRQ_VECTOR_BASE as u32) as u8);
    log::info!("adi: {} adopted vector {}", name, vector);
    Ok(())
}

/// Block until the driver's IRQ fires or an AMC message arrives.
///
/// Returns true for an IRQ (the caller must service the hardware and call
/// `send_eoi`), false for a message. If IRQs are already pending, returns
/// true without blocking.
pub fn event_await(vector: u32) -> KernelResult<bool> {
    use x86_64::instructions::interrupts;

    let slot = slot_of(vector).ok_or(AdiError::InvalidVector)?;
    let task = sched::current_task();

    // Interrupts stay off from the pending-count check to the block, so an
    // IRQ arriving in between cannot fire its unblock before we are
    // actually blocked.
    let were_enabled = interrupts::are_enabled();
    let result = loop {
        interrupts::disable();
        {
            let mut drivers = DRIVERS.lock();
            let driver = match drivers[slot].as_mut() {
                Some(d) => d,
                None => break Err(AdiError::InvalidVector.into()),
            };
            if driver.task != task {
                break Err(AdiError::NotOwner.into());
            }
            if driver.pending_irq_count > 0 {
                break Ok(true);
            }
        }
        if crate::amc::has_message() {
            break Ok(false);
        }

        match sched::block_current(BlockReason::IRQ_WAIT | BlockReason::AMC_AWAIT) {
            UnblockReason::Irq => break Ok(true),
            UnblockReason::AmcMessage => break Ok(false),
            // Spurious wake (e.g. killed mid-await); re-check
            _ => {}
        }
    };
    if were_enabled {
        interrupts::enable();
    }
    result
}

/// Acknowledge one IRQ: decrement the pending counter and signal the
/// interrupt controller.
pub fn send_eoi(vector: u32) -> KernelResult<()> {
    let slot = slot_of(vector).ok_or(AdiError::InvalidVector)?;
    {
        let mut drivers = DRIVERS.lock();
        let driver = drivers[slot].as_mut().ok_or(AdiError::InvalidVector)?;
        driver.pending_irq_count = driver.pending_irq_count.saturating_sub(1);
    }
    apic::send_eoi();
    Ok(())
}

/// Called from the interrupt stub when `vector` fires. Returns whether a
/// driver owns the vector (if not, the stub EOIs and drops it).
pub fn interrupt_dispatch(vector: u32) -> bool {
    let Some(slot) = slot_of(vector) else {
        return false;
    };
    let task = {
        let mut drivers = DRIVERS.lock();
        match drivers[slot].as_mut() {
            Some(driver) => {
                driver.pending_irq_count += 1;
                Some(driver.task)
            }
            None => None,
        }
    };
    match task {
        Some(task) => {
            sched::unblock_task(task, UnblockReason::Irq);
            true
        }
        None => false,
    }
}

/// Drop every vector claim a dying task holds and mask the lines.
pub fn release_for_task(task: TaskPtr) {
    let mut drivers = DRIVERS.lock();
    for (slot, entry) in drivers.iter_mut().enumerate() {
        if let Some(driver) = entry {
            if driver.task == task {
                let vector = FIRST_DELEGATED_VECTOR + slot as u32;
                apic::mask_irq((vector - apic::IRQ_VECTOR_BASE as u32) as u8);
                log::info!("adi: {} released vector {}", driver.name, vector);
                *entry = None;
            }
        }
    }
}
