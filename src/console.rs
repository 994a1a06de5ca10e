//! VGA text console.
//!
//! The console is the sink behind file descriptors 1 and 2, so its core
//! write path is byte oriented with no UTF-8 requirement: the writer
//! consumes raw byte streams, expands tabs, honors carriage returns,
//! substitutes unprintable bytes, and scrolls once the cursor runs past
//! the bottom row. `print!`/`println!` and the file layer share that one
//! path, and everything printed is mirrored to the serial port so the
//! log survives outside the emulator window.

use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;
use volatile::Volatile;
use x86_64::instructions::interrupts;

const BUFFER_HEIGHT: usize = 25;
const BUFFER_WIDTH: usize = 80;

/// Columns per tab stop.
const TAB_WIDTH: usize = 8;

/// Glyph shown for bytes outside the printable ASCII range.
const REPLACEMENT_GLYPH: u8 = b'?';

/// The hardware text palette.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    Black = 0,
    Blue = 1,
    Green = 2,
    Cyan = 3,
    Red = 4,
    Magenta = 5,
    Brown = 6,
    LightGray = 7,
    DarkGray = 8,
    LightBlue = 9,
    LightGreen = 10,
    LightCyan = 11,
    LightRed = 12,
    Pink = 13,
    Yellow = 14,
    White = 15,
}

/// Foreground/background attribute byte of a text cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct Attribute(u8);

impl Attribute {
    const fn new(foreground: Color, background: Color) -> Self {
        Self((background as u8) << 4 | (foreground as u8))
    }
}

/// The memory-mapped text buffer at `0xb8000`. Each cell is one `u16`:
/// the glyph in the low byte, the attribute in the high byte.
#[repr(transparent)]
struct Buffer {
    cells: [[Volatile<u16>; BUFFER_WIDTH]; BUFFER_HEIGHT],
}

/// Cursor-tracked writer over the text buffer. Output flows top to
/// bottom; the screen scrolls only when the cursor passes the last row.
pub struct Writer {
    row: usize,
    column: usize,
    attribute: Attribute,
    buffer: &'static mut Buffer,
}

lazy_static! {
    /// Global instance of the VGA console writer. The screen is cleared
    /// on first use so boot loader leftovers do not interleave with
    /// kernel output.
    pub static ref WRITER: Mutex<Writer> = {
        let mut writer = Writer {
            row: 0,
            column: 0,
            attribute: Attribute::new(Color::LightGray, Color::Black),

            // SAFETY:
            // The VGA text buffer is identity mapped by the bootloader and
            // nothing else in the kernel aliases it.
            buffer: unsafe { &mut *(0xb8000 as *mut Buffer) },
        };
        writer.clear();
        Mutex::new(writer)
    };
}

impl Writer {
    /// Write a raw byte stream at the cursor. This is the core path:
    /// both the `fmt::Write` impl and the console file descriptors feed
    /// through here.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.put_byte(byte);
        }
    }

    fn put_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.newline(),
            b'\r' => self.column = 0,
            b'\t' => {
                let stop = ((self.column / TAB_WIDTH) + 1) * TAB_WIDTH;
                while self.column < stop.min(BUFFER_WIDTH) {
                    self.put_glyph(b' ');
                }
            }
            0x20..=0x7e => self.put_glyph(byte),
            _ => self.put_glyph(REPLACEMENT_GLYPH),
        }
    }

    fn put_glyph(&mut self, glyph: u8) {
        if self.column >= BUFFER_WIDTH {
            self.newline();
        }
        let cell = u16::from(self.attribute.0) << 8 | u16::from(glyph);
        self.buffer.cells[self.row][self.column].write(cell);
        self.column += 1;
    }

    fn newline(&mut self) {
        self.column = 0;
        if self.row + 1 < BUFFER_HEIGHT {
            self.row += 1;
        } else {
            self.scroll_up();
        }
    }

    /// Move every row up by one and blank the bottom row; the cursor
    /// stays on the (now empty) last row.
    fn scroll_up(&mut self) {
        for row in 1..BUFFER_HEIGHT {
            for col in 0..BUFFER_WIDTH {
                let cell = self.buffer.cells[row][col].read();
                self.buffer.cells[row - 1][col].write(cell);
            }
        }
        self.blank_row(BUFFER_HEIGHT - 1);
        self.row = BUFFER_HEIGHT - 1;
    }

    fn blank_row(&mut self, row: usize) {
        let blank = u16::from(self.attribute.0) << 8 | u16::from(b' ');
        for col in 0..BUFFER_WIDTH {
            self.buffer.cells[row][col].write(blank);
        }
    }

    /// Blank the whole screen and park the cursor at the top left.
    pub fn clear(&mut self) {
        for row in 0..BUFFER_HEIGHT {
            self.blank_row(row);
        }
        self.row = 0;
        self.column = 0;
    }
}

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_bytes(s.as_bytes());
        Ok(())
    }
}

/// Write raw bytes to the console and the serial mirror.
///
/// This is the sink behind file descriptors 1 and 2: the byte stream of a
/// user `write` lands here without any UTF-8 requirement.
pub fn write_bytes(bytes: &[u8]) {
    interrupts::without_interrupts(|| {
        WRITER.lock().write_bytes(bytes);
    });
    crate::serial::write_bytes(bytes);
}

/// Copy of the std print! macro that redirect our internal _print function.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::console::_print(format_args!($($arg)*)));
}

/// Copy of the std println! macro that redirect our internal _print function.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    // Interrupt handlers print diagnostics through the same writer, so the
    // lock must never be held with interrupts enabled.
    interrupts::without_interrupts(|| {
        #[expect(
            clippy::unwrap_used,
            reason = "We should be able to write inside the vga frame buffer"
        )]
        WRITER.lock().write_fmt(args).unwrap();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::fmt::Write;

    fn glyph_at(writer: &Writer, row: usize, col: usize) -> u8 {
        (writer.buffer.cells[row][col].read() & 0xFF) as u8
    }

    /// Test that printing many lines will not panic.
    #[test_case]
    fn test_when_printing_many_lines_should_not_panic() {
        for _ in 0..200 {
            println!("test many print output.");
        }
    }

    /// Test that a printed line lands on the row above the cursor.
    #[test_case]
    fn test_when_printing_a_line_should_appear_in_vga_buffer() {
        let line = "Some line that fits on a single line";

        interrupts::without_interrupts(|| {
            let mut writer = WRITER.lock();

            writeln!(writer, "\n{line}").expect("Failed to write line to vga buffer.");
            // The trailing newline moved the cursor one row past the line,
            // scroll or not.
            let line_row = writer.row - 1;
            for (i, c) in line.chars().enumerate() {
                assert_eq!(
                    char::from(glyph_at(&writer, line_row, i)),
                    c,
                    "Printed characters must appear on the row above the cursor.",
                );
            }
        });
    }

    /// Carriage return rewinds the column; tab advances to the next stop.
    #[test_case]
    fn test_control_bytes_move_the_cursor() {
        interrupts::without_interrupts(|| {
            let mut writer = WRITER.lock();

            writer.write_bytes(b"\nabc\rX");
            let row = writer.row;
            assert_eq!(glyph_at(&writer, row, 0), b'X', "\\r must rewind to column 0.");
            assert_eq!(glyph_at(&writer, row, 1), b'b', "Unwritten cells keep their glyph.");

            writer.write_bytes(b"\n\ty");
            let row = writer.row;
            assert_eq!(writer.column, TAB_WIDTH + 1, "Tab advances to the next stop.");
            assert_eq!(glyph_at(&writer, row, TAB_WIDTH), b'y');
        });
    }

    /// Bytes outside the printable range come out as the replacement glyph.
    #[test_case]
    fn test_unprintable_bytes_are_substituted() {
        interrupts::without_interrupts(|| {
            let mut writer = WRITER.lock();

            writer.write_bytes(b"\n\x01\xfb");
            let row = writer.row;
            assert_eq!(glyph_at(&writer, row, 0), REPLACEMENT_GLYPH);
            assert_eq!(glyph_at(&writer, row, 1), REPLACEMENT_GLYPH);
        });
    }
}
