//! Keyboard input path.
//! The keyboard interrupt handler pushes raw scancodes into a fixed ring
//! buffer and wakes processes blocked on console input; decoding to
//! characters happens at read time, outside interrupt context.

use conquer_once::spin::OnceCell;
use crossbeam_queue::ArrayQueue;
use lazy_static::lazy_static;
use pc_keyboard::{layouts, DecodedKey, HandleControl, Keyboard, ScancodeSet1};
use spin::Mutex;

use crate::{process, serial_println};

/// Capacity of the scancode ring buffer.
const SCANCODE_QUEUE_SIZE: usize = 128;

static SCANCODE_QUEUE: OnceCell<ArrayQueue<u8>> = OnceCell::uninit();

lazy_static! {
    static ref KEYBOARD: Mutex<Keyboard<layouts::Us104Key, ScancodeSet1>> =
        Mutex::new(Keyboard::new(
            ScancodeSet1::new(),
            layouts::Us104Key,
            HandleControl::Ignore,
        ));
}

/// Allocate the scancode ring buffer.
pub fn init() {
    SCANCODE_QUEUE
        .try_init_once(|| ArrayQueue::new(SCANCODE_QUEUE_SIZE))
        .ok();
}

/// Push a scancode from the keyboard interrupt handler.
///
/// Drops the scancode with a diagnostic when the ring buffer is full;
/// interrupt context must never block.
pub(crate) fn add_scancode(scancode: u8) {
    if let Ok(queue) = SCANCODE_QUEUE.try_get() {
        if queue.push(scancode).is_err() {
            serial_println!("[keyboard] scancode queue full; dropping input");
        }
        process::notify_keyboard();
    } else {
        serial_println!("[keyboard] scancode queue uninitialized");
    }
}

/// Pop one raw scancode, if any is buffered.
pub fn pop_scancode() -> Option<u8> {
    SCANCODE_QUEUE.try_get().ok().and_then(ArrayQueue::pop)
}

/// Decode buffered scancodes until one printable character is available.
/// Returns `None` when the buffer runs dry first.
fn poll_char() -> Option<u8> {
    let mut keyboard = KEYBOARD.lock();
    while let Some(scancode) = pop_scancode() {
        let Ok(Some(event)) = keyboard.add_byte(scancode) else {
            continue;
        };
        if let Some(DecodedKey::Unicode(character)) = keyboard.process_keyevent(event) {
            if character.is_ascii() {
                return Some(character as u8);
            }
        }
    }
    None
}

/// One decoded character if any scancodes are pending, without blocking.
pub fn try_read_char() -> Option<u8> {
    poll_char()
}

/// Read one decoded character, blocking the current process until a key
/// arrives. This is the backing read for file descriptor 0.
pub fn read_char_blocking() -> u8 {
    loop {
        if let Some(byte) = poll_char() {
            return byte;
        }
        process::wait_for_keyboard();
    }
}
