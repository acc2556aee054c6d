//! Cancellable one-shot timers for delayed power actions.

use core::time::Duration;

use crate::time::Instant;

/// Actions that run some time after being armed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeferredAction {
    /// Power button held long enough to force the AP off.
    ForceShutdown,
    /// Reset button or watchdog reset of the AP.
    ForceReset,
    /// AP ignored the thermal shutdown request.
    ThermalForceShutdown,
    /// Fans switch to fixed duty after a thermal shutdown.
    ThermalFanOverride,
}

const ACTION_COUNT: usize = 4;

const ALL_ACTIONS: [DeferredAction; ACTION_COUNT] = [
    DeferredAction::ForceShutdown,
    DeferredAction::ForceReset,
    DeferredAction::ThermalForceShutdown,
    DeferredAction::ThermalFanOverride,
];

const fn action_index(action: DeferredAction) -> usize {
    match action {
        DeferredAction::ForceShutdown => 0,
        DeferredAction::ForceReset => 1,
        DeferredAction::ThermalForceShutdown => 2,
        DeferredAction::ThermalFanOverride => 3,
    }
}

/// Tracks the deadline of each [`DeferredAction`].
///
/// Arming an action that is already pending replaces its deadline. The
/// owning task polls [`DeferredTracker::take_expired`] and runs whatever it
/// returns; the firmware uses [`DeferredTracker::next_deadline`] to size its
/// sleep.
#[derive(Clone, Debug)]
pub struct DeferredTracker {
    deadlines: [Option<Instant>; ACTION_COUNT],
}

impl DeferredTracker {
    /// Creates a tracker with nothing armed.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            deadlines: [None; ACTION_COUNT],
        }
    }

    /// Arms `action` to fire `delay` after `now`.
    pub fn schedule(&mut self, action: DeferredAction, now: Instant, delay: Duration) {
        self.deadlines[action_index(action)] = Some(now + delay);
    }

    /// Moves the deadline of a pending action; does nothing when it is not armed.
    pub fn reschedule(&mut self, action: DeferredAction, now: Instant, delay: Duration) {
        if self.is_pending(action) {
            self.schedule(action, now, delay);
        }
    }

    /// Disarms `action`. Returns `true` when it was pending.
    pub fn cancel(&mut self, action: DeferredAction) -> bool {
        self.deadlines[action_index(action)].take().is_some()
    }

    #[must_use]
    pub fn deadline(&self, action: DeferredAction) -> Option<Instant> {
        self.deadlines[action_index(action)]
    }

    #[must_use]
    pub fn is_pending(&self, action: DeferredAction) -> bool {
        self.deadline(action).is_some()
    }

    /// Earliest armed deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.iter().flatten().copied().min()
    }

    /// Disarms and returns the earliest action due at `now`.
    pub fn take_expired(&mut self, now: Instant) -> Option<DeferredAction> {
        let action = ALL_ACTIONS
            .iter()
            .copied()
            .filter(|action| self.deadline(*action).is_some_and(|deadline| deadline <= now))
            .min_by_key(|action| self.deadline(*action))?;
        self.cancel(action);
        Some(action)
    }
}

impl Default for DeferredTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_after_delay() {
        let mut tracker = DeferredTracker::new();
        let start = Instant::from_millis(100);
        tracker.schedule(DeferredAction::ForceReset, start, Duration::from_millis(50));

        assert_eq!(tracker.take_expired(Instant::from_millis(149)), None);
        assert_eq!(
            tracker.take_expired(Instant::from_millis(150)),
            Some(DeferredAction::ForceReset)
        );
        assert_eq!(tracker.take_expired(Instant::from_millis(200)), None);
    }

    #[test]
    fn cancel_and_rearm_replace_the_deadline() {
        let mut tracker = DeferredTracker::new();
        tracker.schedule(DeferredAction::ForceShutdown, Instant::ZERO, Duration::from_secs(8));
        assert!(tracker.cancel(DeferredAction::ForceShutdown));
        assert!(!tracker.cancel(DeferredAction::ForceShutdown));

        tracker.reschedule(DeferredAction::ForceShutdown, Instant::ZERO, Duration::ZERO);
        assert!(!tracker.is_pending(DeferredAction::ForceShutdown));

        tracker.schedule(
            DeferredAction::ThermalForceShutdown,
            Instant::ZERO,
            Duration::from_secs(2),
        );
        tracker.reschedule(
            DeferredAction::ThermalForceShutdown,
            Instant::from_millis(500),
            Duration::ZERO,
        );
        assert_eq!(
            tracker.deadline(DeferredAction::ThermalForceShutdown),
            Some(Instant::from_millis(500))
        );
    }

    #[test]
    fn expired_actions_come_out_in_deadline_order() {
        let mut tracker = DeferredTracker::new();
        tracker.schedule(
            DeferredAction::ThermalFanOverride,
            Instant::ZERO,
            Duration::from_millis(2_100),
        );
        tracker.schedule(
            DeferredAction::ThermalForceShutdown,
            Instant::ZERO,
            Duration::from_secs(2),
        );
        assert_eq!(tracker.next_deadline(), Some(Instant::from_millis(2_000)));

        let now = Instant::from_millis(3_000);
        assert_eq!(
            tracker.take_expired(now),
            Some(DeferredAction::ThermalForceShutdown)
        );
        assert_eq!(
            tracker.take_expired(now),
            Some(DeferredAction::ThermalFanOverride)
        );
        assert_eq!(tracker.next_deadline(), None);
    }
}
