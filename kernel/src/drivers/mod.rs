//! Kernel-side device bring-up.
//!
//! Real device driving happens in userland through ADI; the kernel only
//! owns the controller initialization that must happen before those
//! drivers can adopt their IRQ lines.

pub mod ps2;
