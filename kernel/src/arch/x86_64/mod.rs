//! x86_64 CPU structures and platform devices.

pub mod apic;
pub mod context;
pub mod gdt;
pub mod idt;
pub mod pit;
pub mod usermode;

/// Bring up the CPU tables and interrupt plumbing, in dependency order.
pub fn init() {
    gdt::init();
    idt::init();
    apic::init();
    pit::init();
}
