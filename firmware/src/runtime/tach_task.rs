//! Software tach capture on an EXTI line.
//!
//! Edges are stamped with the low 16 bits of the embassy tick counter, which
//! the fan driver treats as a free-running capture timer.

use ec_core::fan::{FanConfig, TachCapture};
use embassy_stm32::exti::ExtiInput;

const COUNTER_MASK: u64 = 0xFFFF;

/// Fan timing matching the capture above: one count per embassy tick and a
/// capture on every edge.
pub const TACH_TIMING: FanConfig = FanConfig {
    readjust_band: FanConfig::new().readjust_band,
    tach_clock_hz: tick_hz(),
    tach_prescaler: 0,
    capture_divider: 1,
    pulses_per_rev: FanConfig::new().pulses_per_rev,
};

#[allow(clippy::cast_possible_truncation)]
const fn tick_hz() -> u32 {
    embassy_time::TICK_HZ as u32
}

#[embassy_executor::task(pool_size = 2)]
pub async fn run(mut pin: ExtiInput<'static>, capture: &'static TachCapture) -> ! {
    let mut last_edge = 0u64;
    loop {
        pin.wait_for_falling_edge().await;
        let ticks = embassy_time::Instant::now().as_ticks();
        if ticks.wrapping_sub(last_edge) > COUNTER_MASK {
            // The counter wrapped more than once since the previous edge.
            capture.record_overflow();
        }
        last_edge = ticks;
        #[allow(clippy::cast_possible_truncation)]
        let counter = (ticks & COUNTER_MASK) as u16;
        capture.record_capture(counter, u16::MAX);
    }
}
