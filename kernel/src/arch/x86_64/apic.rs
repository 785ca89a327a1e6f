//! Local APIC and I/O APIC support.
//!
//! Interrupt delivery goes through the APIC: the I/O APIC routes ISA IRQ
//! lines to fixed vectors (line N -> vector 32+N) and the Local APIC
//! delivers them to the (single) CPU and takes the EOI. The legacy 8259
//! pair is remapped away from the CPU exception range and fully masked
//! before the APIC is enabled.
//!
//! Both units are memory-mapped (LAPIC at 0xFEE0_0000, I/O APIC at
//! 0xFEC0_0000) and reached through the kernel's physical-map window.

use core::ptr;

use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::PhysAddr;

use crate::mm::phys_to_virt;

/// Physical base of the Local APIC registers.
const LAPIC_BASE: u64 = 0xFEE0_0000;
/// Physical base of the I/O APIC registers.
const IOAPIC_BASE: u64 = 0xFEC0_0000;

/// End-Of-Interrupt register -- write 0 to signal completion.
const LAPIC_EOI: u32 = 0x0B0;
/// Spurious Interrupt Vector register -- also holds the software enable bit.
const LAPIC_SVR: u32 = 0x0F0;
/// Task Priority Register -- 0 accepts all interrupt priorities.
const LAPIC_TPR: u32 = 0x080;

/// Software-enable bit in the SVR.
const LAPIC_SVR_ENABLE: u32 = 1 << 8;
/// Vector for spurious interrupts.
const SPURIOUS_VECTOR: u32 = 0xFF;

/// I/O APIC register-select and window offsets.
const IOAPIC_IOREGSEL: u64 = 0x00;
const IOAPIC_IOWIN: u64 = 0x10;
/// First redirection-table register; each entry is two 32-bit registers.
const IOAPIC_REDTBL_BASE: u32 = 0x10;
/// Mask bit in a redirection entry's low word.
const IOAPIC_MASKED: u32 = 1 << 16;

/// Vector that ISA IRQ line 0 maps to; line N -> vector IRQ_VECTOR_BASE + N.
pub const IRQ_VECTOR_BASE: u8 = 32;

fn lapic_read(reg: u32) -> u32 {
    let addr = phys_to_virt(PhysAddr::new(LAPIC_BASE + reg as u64));
    // SAFETY: LAPIC registers are 4-byte aligned MMIO within the physical
    // window; volatile access has no side effects beyond the device's.
    unsafe { ptr::read_volatile(addr.as_ptr::<u32>()) }
}

fn lapic_write(reg: u32, value: u32) {
    let addr = phys_to_virt(PhysAddr::new(LAPIC_BASE + reg as u64));
    // SAFETY: as above; writes are the architecturally defined way to
    // program the LAPIC.
    unsafe { ptr::write_volatile(addr.as_mut_ptr::<u32>(), value) }
}

fn ioapic_read(reg: u32) -> u32 {
    let sel = phys_to_virt(PhysAddr::new(IOAPIC_BASE + IOAPIC_IOREGSEL));
    let win = phys_to_virt(PhysAddr::new(IOAPIC_BASE + IOAPIC_IOWIN));
    // SAFETY: IOREGSEL/IOWIN indirect access per the I/O APIC datasheet.
    unsafe {
        ptr::write_volatile(sel.as_mut_ptr::<u32>(), reg);
        ptr::read_volatile(win.as_ptr::<u32>())
    }
}

fn ioapic_write(reg: u32, value: u32) {
    let sel = phys_to_virt(PhysAddr::new(IOAPIC_BASE + IOAPIC_IOREGSEL));
    let win = phys_to_virt(PhysAddr::new(IOAPIC_BASE + IOAPIC_IOWIN));
    // SAFETY: as above.
    unsafe {
        ptr::write_volatile(sel.as_mut_ptr::<u32>(), reg);
        ptr::write_volatile(win.as_mut_ptr::<u32>(), value);
    }
}

/// The legacy 8259 pair, remapped clear of the exception vectors before
/// being masked. Spurious legacy interrupts would otherwise land on
/// vectors 8..15.
// SAFETY: 32/40 are free vector offsets above the CPU exceptions.
static LEGACY_PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(IRQ_VECTOR_BASE, IRQ_VECTOR_BASE + 8) });

/// Remap the legacy 8259 pair, then mask every line. The I/O APIC delivers
/// external interrupts from here on.
fn disable_legacy_pic() {
    let mut pics = LEGACY_PICS.lock();
    // SAFETY: the init sequence writes only the PICs' own ports, and no
    // handler relies on legacy delivery at this point in boot.
    unsafe {
        pics.initialize();
        pics.disable();
    }
}

/// Enable the Local APIC and quiesce the legacy PICs.
pub fn init() {
    disable_legacy_pic();

    // Accept all priorities, software-enable with the spurious vector.
    lapic_write(LAPIC_TPR, 0);
    lapic_write(LAPIC_SVR, LAPIC_SVR_ENABLE | SPURIOUS_VECTOR);

    log::info!("apic: local apic enabled, legacy pic masked");
}

/// Signal end-of-interrupt to the Local APIC.
pub fn send_eoi() {
    lapic_write(LAPIC_EOI, 0);
}

/// Route an ISA IRQ line to its fixed vector and unmask it.
pub fn route_irq(line: u8) {
    let vector = IRQ_VECTOR_BASE + line;
    let reg = IOAPIC_REDTBL_BASE + 2 * line as u32;
    // Destination: physical APIC id 0 (single bootstrap processor).
    ioapic_write(reg + 1, 0);
    ioapic_write(reg, vector as u32);
}

/// Mask an ISA IRQ line at the I/O APIC.
#[allow(dead_code)]
pub fn mask_irq(line: u8) {
    let reg = IOAPIC_REDTBL_BASE + 2 * line as u32;
    let low = ioapic_read(reg);
    ioapic_write(reg, low | IOAPIC_MASKED);
}
