//! Events raised by the input tasks and consumed by the control task.
//!
//! Interrupt-driven tasks never touch the orchestrator directly; they post a
//! [`ControlEvent`] and the control task applies it between power steps.

#![cfg_attr(not(target_os = "none"), allow(dead_code))]

#[cfg(not(target_os = "none"))]
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
#[cfg(target_os = "none")]
use embassy_sync::blocking_mutex::raw::ThreadModeRawMutex;
use embassy_sync::channel::{Channel, Receiver, Sender};

use ec_core::orchestrator::Orchestrator;
use ec_core::time::Instant;
use portable_atomic::{AtomicU32, Ordering};

/// Depth of the event queue; edges beyond it are dropped by the producers.
pub const EVENT_QUEUE_DEPTH: usize = 8;

#[cfg(target_os = "none")]
type EventMutex = ThreadModeRawMutex;
#[cfg(not(target_os = "none"))]
type EventMutex = NoopRawMutex;

/// Something the control task must react to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(target_os = "none", derive(defmt::Format))]
pub enum ControlEvent {
    /// Front-panel power button edge; `true` when pressed.
    PowerButton(bool),
    /// Reset button edge; `true` when pressed.
    ResetButton(bool),
    /// The shared power-good fault line toggled.
    SupplyFeedback,
}

pub type EventQueue = Channel<EventMutex, ControlEvent, EVENT_QUEUE_DEPTH>;

pub type EventSender<'a> = Sender<'a, EventMutex, ControlEvent, EVENT_QUEUE_DEPTH>;

pub type EventReceiver<'a> = Receiver<'a, EventMutex, ControlEvent, EVENT_QUEUE_DEPTH>;

static DROPPED_EVENTS: AtomicU32 = AtomicU32::new(0);

/// Queues `event`, counting it as dropped when the queue is full.
pub fn post(sender: &EventSender<'_>, event: ControlEvent) -> bool {
    if sender.try_send(event).is_ok() {
        return true;
    }
    DROPPED_EVENTS.fetch_add(1, Ordering::Relaxed);
    false
}

/// Events lost to a full queue since boot.
pub fn dropped_events() -> u32 {
    DROPPED_EVENTS.load(Ordering::Relaxed)
}

/// Hands `event` to the orchestrator.
pub fn apply(orchestrator: &mut Orchestrator<'_>, event: ControlEvent, now: Instant) {
    match event {
        ControlEvent::PowerButton(pressed) => orchestrator.power_button_changed(pressed, now),
        ControlEvent::ResetButton(pressed) => orchestrator.reset_button_changed(pressed, now),
        ControlEvent::SupplyFeedback => orchestrator.supply_feedback_changed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ec_core::boards::reference;
    use ec_core::config::ControllerConfig;
    use ec_core::deferred::DeferredAction;
    use ec_core::fan::TachCapture;

    fn orchestrator(tach: &[TachCapture]) -> Orchestrator<'_> {
        Orchestrator::new(
            reference::layout().unwrap(),
            tach,
            ControllerConfig::new(),
        )
    }

    #[test]
    fn short_power_press_does_not_force_shutdown() {
        let tach = [TachCapture::new()];
        let mut orchestrator = orchestrator(&tach);

        apply(&mut orchestrator, ControlEvent::PowerButton(true), Instant::ZERO);
        assert!(
            orchestrator
                .deferred()
                .is_pending(DeferredAction::ForceShutdown)
        );
        assert!(!orchestrator.is_power_steady());

        apply(
            &mut orchestrator,
            ControlEvent::PowerButton(false),
            Instant::from_millis(300),
        );
        assert!(
            !orchestrator
                .deferred()
                .is_pending(DeferredAction::ForceShutdown)
        );
    }

    #[test]
    fn reset_press_arms_the_debounced_reset() {
        let tach = [TachCapture::new()];
        let mut orchestrator = orchestrator(&tach);

        apply(&mut orchestrator, ControlEvent::ResetButton(true), Instant::ZERO);
        assert_eq!(
            orchestrator.deferred().deadline(DeferredAction::ForceReset),
            Some(Instant::from_millis(50))
        );
    }

    #[test]
    fn full_queue_counts_dropped_events() {
        let queue = EventQueue::new();
        let sender = queue.sender();
        let before = dropped_events();

        for _ in 0..EVENT_QUEUE_DEPTH {
            assert!(post(&sender, ControlEvent::SupplyFeedback));
        }
        assert!(!post(&sender, ControlEvent::PowerButton(true)));
        assert!(dropped_events() > before);
        assert_eq!(queue.receiver().try_receive(), Ok(ControlEvent::SupplyFeedback));
    }

    #[test]
    fn feedback_edge_wakes_the_power_task() {
        let tach = [TachCapture::new()];
        let mut orchestrator = orchestrator(&tach);
        assert!(orchestrator.is_power_steady());

        apply(&mut orchestrator, ControlEvent::SupplyFeedback, Instant::ZERO);
        assert!(!orchestrator.is_power_steady());
    }
}
