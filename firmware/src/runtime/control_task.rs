//! The single task that owns the orchestrator.
//!
//! Power sequencing suspends this task while rails ramp; the input and tach
//! tasks keep running and queue events, which are applied here between power
//! steps.

use ec_core::boards::reference;
use ec_core::config::ControllerConfig;
use ec_core::fan::TachCapture;
use ec_core::hal::{Clock, EmptyConfigStore};
use ec_core::orchestrator::Orchestrator;
use ec_core::power::ResetFlags;
use embassy_futures::select::{Either3, select3};
use embassy_futures::yield_now;
use embassy_time::{Duration, Instant, Ticker, Timer};

use super::tach_task::TACH_TIMING;
use crate::events::{self, EventReceiver};
use crate::hw::Stm32Board;
use crate::telemetry;

/// Seconds between status dumps on the log.
const STATUS_PERIOD_SECS: u32 = 30;

fn controller_config() -> ControllerConfig {
    let mut config = ControllerConfig::new();
    config.fan = TACH_TIMING;
    config
}

#[embassy_executor::task]
pub async fn run(
    mut board: Stm32Board<'static>,
    receiver: EventReceiver<'static>,
    tach: &'static [TachCapture],
    reset: ResetFlags,
) -> ! {
    let layout = match reference::layout() {
        Ok(layout) => layout,
        Err(err) => {
            defmt::error!("board layout rejected: {}", err);
            loop {
                core::future::pending::<()>().await;
            }
        }
    };
    let mut orchestrator = Orchestrator::new(layout, tach, controller_config());
    let state = orchestrator.init(&mut board, &EmptyConfigStore, reset);
    defmt::info!(
        "boot power state {} (soft={} watchdog={})",
        state,
        reset.soft,
        reset.watchdog
    );

    let mut ticker = Ticker::every(Duration::from_secs(1));
    let mut seconds = 0u32;
    loop {
        while let Ok(event) = receiver.try_receive() {
            events::apply(&mut orchestrator, event, board.now());
        }
        orchestrator.poll_deferred(&mut board).await;
        orchestrator.step_power(&mut board).await;
        if !orchestrator.is_power_steady() {
            yield_now().await;
            continue;
        }

        let deadline = orchestrator
            .next_deadline()
            .map_or(Instant::MAX, |at| Instant::from_micros(at.as_micros()));
        match select3(receiver.receive(), ticker.next(), Timer::at(deadline)).await {
            Either3::First(event) => events::apply(&mut orchestrator, event, board.now()),
            Either3::Second(()) => {
                orchestrator.tick_second(&mut board).await;
                seconds = seconds.wrapping_add(1);
                if seconds % STATUS_PERIOD_SECS == 0 {
                    telemetry::log_status(&orchestrator.snapshot(&mut board));
                    let dropped = events::dropped_events();
                    if dropped > 0 {
                        defmt::warn!("{} input events dropped since boot", dropped);
                    }
                }
            }
            Either3::Third(()) => {}
        }
    }
}
