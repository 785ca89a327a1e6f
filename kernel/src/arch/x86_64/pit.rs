//! Programmable Interval Timer.
//!
//! Channel 0 is programmed for a 1 ms periodic tick that drives preemption
//! and the monotonic millisecond clock. The tick arrives on IRQ line 0
//! (vector 32) via the I/O APIC.

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::instructions::port::Port;

use super::apic;

/// PIT input clock in Hz.
const PIT_INPUT_HZ: u32 = 1_193_182;

/// Tick rate: one interrupt per millisecond.
pub const TICK_HZ: u32 = 1000;

/// IRQ line the PIT fires on.
pub const PIT_IRQ_LINE: u8 = 0;

/// Milliseconds since the PIT was started.
static TICKS_MS: AtomicU64 = AtomicU64::new(0);

/// Program channel 0 for the periodic tick and unmask its line.
pub fn init() {
    let divisor = (PIT_INPUT_HZ / TICK_HZ) as u16;

    let mut command: Port<u8> = Port::new(0x43);
    let mut channel0: Port<u8> = Port::new(0x40);

    // SAFETY: ports 0x43/0x40 are the PIT's command and channel-0 data
    // ports; 0x36 selects channel 0, lobyte/hibyte access, mode 3.
    unsafe {
        command.write(0x36u8);
        channel0.write((divisor & 0xFF) as u8);
        channel0.write((divisor >> 8) as u8);
    }

    apic::route_irq(PIT_IRQ_LINE);

    log::info!("pit: {} Hz tick on irq {}", TICK_HZ, PIT_IRQ_LINE);
}

/// Called from the timer interrupt handler, once per tick.
pub fn record_tick() -> u64 {
    TICKS_MS.fetch_add(1, Ordering::Relaxed) + 1
}

/// Monotonic milliseconds since boot.
pub fn ms_since_boot() -> u64 {
    TICKS_MS.load(Ordering::Relaxed)
}
