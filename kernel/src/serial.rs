// COM1 serial output, the kernel's diagnostic channel

use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

/// I/O port base of COM1.
const COM1_BASE: u16 = 0x3F8;

lazy_static! {
    static ref COM1: Mutex<SerialPort> = {
        // SAFETY: 0x3F8 is the standard COM1 port base. SerialPort::new only
        // records the base; no I/O happens until init() below.
        let mut port = unsafe { SerialPort::new(COM1_BASE) };
        port.init();
        Mutex::new(port)
    };
}

/// Write formatted output to COM1.
///
/// Interrupts are disabled around the lock so an interrupt handler that
/// prints cannot deadlock against a half-finished line.
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;

    x86_64::instructions::interrupts::without_interrupts(|| {
        COM1.lock().write_fmt(args).expect("serial write failed");
    });
}
