//! Button and fault-line edges, debounced and forwarded to the control task.

use embassy_stm32::exti::ExtiInput;
use embassy_time::{Duration, Timer};

use crate::events::{self, ControlEvent, EventSender};

const DEBOUNCE: Duration = Duration::from_millis(10);

/// Buttons are active low; `event` builds the message for a level.
#[embassy_executor::task(pool_size = 2)]
pub async fn button(
    mut pin: ExtiInput<'static>,
    sender: EventSender<'static>,
    event: fn(bool) -> ControlEvent,
) -> ! {
    let mut pressed = pin.is_low();
    loop {
        pin.wait_for_any_edge().await;
        Timer::after(DEBOUNCE).await;
        let level = pin.is_low();
        if level == pressed {
            continue;
        }
        pressed = level;
        post(&sender, event(pressed));
    }
}

/// Wired-OR power-good fault line shared by the monitored rails.
#[embassy_executor::task]
pub async fn supply_fault(mut pin: ExtiInput<'static>, sender: EventSender<'static>) -> ! {
    loop {
        pin.wait_for_any_edge().await;
        post(&sender, ControlEvent::SupplyFeedback);
    }
}

fn post(sender: &EventSender<'static>, event: ControlEvent) {
    if !events::post(sender, event) {
        defmt::warn!("event queue full, dropped {}", event);
    }
}
