//! Serial port mirror of the console, on the first UART.
//! Test output and kernel diagnostics go through here so they reach the
//! host even with the display disabled.

use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;
use x86_64::instructions::interrupts;

const COM1_PORT: u16 = 0x3F8;

lazy_static! {
    /// The first serial port, initialized on first use.
    pub static ref SERIAL1: Mutex<SerialPort> = {
        // SAFETY:
        // COM1 is a standard port known to exist on the emulated machine.
        let mut serial_port = unsafe { SerialPort::new(COM1_PORT) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    use core::fmt::Write;

    interrupts::without_interrupts(|| {
        #[expect(
            clippy::expect_used,
            reason = "Serial port should be correctly initialized."
        )]
        SERIAL1
            .lock()
            .write_fmt(args)
            .expect("Failed to print on serial port.");
    });
}

/// Send raw bytes down the serial line.
pub fn write_bytes(bytes: &[u8]) {
    interrupts::without_interrupts(|| {
        let mut serial = SERIAL1.lock();
        for &byte in bytes {
            serial.send(byte);
        }
    });
}

/// Print to host machine through serial port interface.
#[macro_export]
macro_rules! serial_print {
    ($($args:tt)*) => {
        $crate::serial::_print(format_args!($($args)*));
    };
}

/// Print to host machine through serial port interface a line.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($fmt:expr) => ($crate::serial_print!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => ($crate::serial_print!(
        concat!($fmt, "\n"), $($arg)*));
}
