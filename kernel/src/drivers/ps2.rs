//! PS/2 controller bring-up.
//!
//! Scancode and packet decoding live in the userland `kb_driver` and
//! `mouse_driver` services; the kernel's job ends at putting the 8042 in a
//! known state with both ports enabled and their interrupt lines routed
//! (keyboard on IRQ 1, mouse on IRQ 12).

use x86_64::instructions::port::Port;

use crate::arch::x86_64::apic;

const DATA_PORT: u16 = 0x60;
const STATUS_PORT: u16 = 0x64;

const STATUS_OUTPUT_FULL: u8 = 1 << 0;
const STATUS_INPUT_FULL: u8 = 1 << 1;

/// IRQ lines the two PS/2 ports fire on.
pub const KEYBOARD_IRQ_LINE: u8 = 1;
pub const MOUSE_IRQ_LINE: u8 = 12;

fn wait_input_clear(status: &mut Port<u8>) {
    // SAFETY: status-register read of the 8042.
    while unsafe { status.read() } & STATUS_INPUT_FULL != 0 {
        core::hint::spin_loop();
    }
}

fn controller_command(status: &mut Port<u8>, command: u8) {
    wait_input_clear(status);
    // SAFETY: port 0x64 write is the 8042 command interface.
    unsafe {
        let mut cmd: Port<u8> = Port::new(STATUS_PORT);
        cmd.write(command);
    }
}

/// Put the 8042 in a known state: flush stale output, enable both ports,
/// enable their interrupts in the controller config byte, and route the
/// IRQ lines.
pub fn init() {
    let mut status: Port<u8> = Port::new(STATUS_PORT);
    let mut data: Port<u8> = Port::new(DATA_PORT);

    // Drain anything a previous owner left in the output buffer.
    // SAFETY: reads of the 8042 data/status ports.
    unsafe {
        while status.read() & STATUS_OUTPUT_FULL != 0 {
            let _ = data.read();
        }
    }

    // Read config byte (command 0x20 -> data port)
    controller_command(&mut status, 0x20);
    // SAFETY: the controller answers the 0x20 command on the data port.
    let mut config = unsafe {
        while status.read() & STATUS_OUTPUT_FULL == 0 {
            core::hint::spin_loop();
        }
        data.read()
    };

    // Enable IRQ generation for both ports, keep translation off for the
    // userland drivers.
    config |= 0b0000_0011;
    config &= !(1 << 6);

    // Write config byte back (command 0x60, then the byte)
    controller_command(&mut status, 0x60);
    wait_input_clear(&mut status);
    // SAFETY: data write completing the 0x60 command.
    unsafe {
        data.write(config);
    }

    // Enable both device ports
    controller_command(&mut status, 0xAE); // port 1 (keyboard)
    controller_command(&mut status, 0xA8); // port 2 (mouse)

    apic::route_irq(KEYBOARD_IRQ_LINE);
    apic::route_irq(MOUSE_IRQ_LINE);

    log::info!(
        "ps2: controller up, keyboard on irq {}, mouse on irq {}",
        KEYBOARD_IRQ_LINE,
        MOUSE_IRQ_LINE
    );
}
