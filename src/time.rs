//! Timekeeping from the programmable interval timer.
//! The PIT is programmed to a fixed 100 Hz rate; one tick is the unit of
//! scheduling and sleeping everywhere in the kernel.

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::instructions::port::Port;

/// Timer interrupts per second.
pub const TICK_HZ: u64 = 100;

/// Base frequency of the PIT oscillator in Hz.
const PIT_BASE_HZ: u64 = 1_193_182;

const PIT_CHANNEL_0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;

/// Channel 0, lobyte/hibyte access, rate generator mode.
const PIT_MODE_RATE_GENERATOR: u8 = 0x36;

/// Ticks elapsed since boot. Bumped by the timer interrupt handler.
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Program PIT channel 0 to fire at [`TICK_HZ`].
pub fn init() {
    let divisor = (PIT_BASE_HZ / TICK_HZ) as u16;

    // SAFETY:
    // Standard PIT programming sequence: mode to the command port, then the
    // divisor low byte and high byte to channel 0.
    unsafe {
        let mut command: Port<u8> = Port::new(PIT_COMMAND);
        let mut channel0: Port<u8> = Port::new(PIT_CHANNEL_0);

        command.write(PIT_MODE_RATE_GENERATOR);
        channel0.write((divisor & 0xFF) as u8);
        channel0.write((divisor >> 8) as u8);
    }
}

/// Record one timer tick. Called from the timer interrupt only.
pub(crate) fn on_tick() -> u64 {
    TICKS.fetch_add(1, Ordering::Relaxed) + 1
}

/// Ticks elapsed since boot.
#[must_use]
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Convert a duration in milliseconds to ticks, rounding up to the next
/// tick boundary. A non-zero duration always yields at least one tick.
#[must_use]
pub fn ms_to_ticks(ms: u64) -> u64 {
    ms.saturating_mul(TICK_HZ).div_ceil(1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_ms_to_ticks_rounds_up_to_tick_boundary() {
        assert_eq!(ms_to_ticks(0), 0, "Zero sleeps for zero ticks.");
        assert_eq!(ms_to_ticks(1), 1, "Sub-tick sleeps round up to one tick.");
        assert_eq!(ms_to_ticks(10), 1, "10 ms is exactly one tick at 100 Hz.");
        assert_eq!(ms_to_ticks(15), 2, "15 ms rounds up to two ticks.");
        assert_eq!(ms_to_ticks(1000), 100, "One second is 100 ticks.");
    }
}
