// Serial port output over the primary 16550 UART

use core::fmt;

/// I/O port base of COM1.
#[cfg(target_os = "none")]
const COM1: u16 = 0x3F8;

/// Print to the serial port, suppressing interrupts for the duration of
/// the write so a record is never torn by a handler printing too.
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_serial_print(format_args!($($arg)*))
    };
}

/// Print to the serial port with a trailing newline.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => {
        $crate::serial_print!("{}\n", format_args!($($arg)*))
    };
}

#[doc(hidden)]
#[cfg(target_os = "none")]
pub fn _serial_print(args: fmt::Arguments) {
    use core::fmt::Write;

    use uart_16550::SerialPort;
    use x86_64::instructions::interrupts;

    interrupts::without_interrupts(|| {
        // SAFETY: COM1 is the standard primary UART port base; constructing
        // the port does not touch hardware until a write happens, and
        // writes to an absent UART are harmless.
        let mut port = unsafe { SerialPort::new(COM1) };
        let _ = port.write_fmt(args);
    });
}

// Host target (unit tests): route serial output to stderr so failing
// tests still show kernel log lines.
#[doc(hidden)]
#[cfg(not(target_os = "none"))]
pub fn _serial_print(args: fmt::Arguments) {
    std::eprint!("{}", args);
}
