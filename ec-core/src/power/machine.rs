//! G3/S5/S3/S0 state machine.
//!
//! [`PowerStateMachine::handle_state`] performs exactly one state handler
//! per call and returns the new state. Handlers that wait on rails or the AP
//! await the board clock, so other tasks keep running meanwhile. The power
//! task calls it in a loop and blocks whenever
//! [`PowerStateMachine::is_steady`] reports nothing to do.
//!
//! Every failure on the way up sets the forced-shutdown latch, so the machine
//! unwinds through the same down-path transitions as a normal shutdown and
//! never retries on its own. The latch clears only in G3->S5, which needs a
//! fresh power-on request.

use core::time::Duration;

use super::{PowerPlan, PowerState, PowerTimings, ResetReason, ShutdownReason};
use crate::hal::{BoardIo, ChipsetEvent, Clock, HostInterface};
use crate::supply::{Sequence, SupplySupervisor};
use crate::telemetry::{TelemetryEventKind, TelemetryRecorder};
use crate::time::Instant;

/// Controller reset cause, as reported by the platform at boot.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[allow(clippy::struct_excessive_bools)]
pub struct ResetFlags {
    /// Running after a jump between firmware images; the rails may be live.
    pub jumped: bool,
    /// The previous image asked for the AP to stay off.
    pub ap_off: bool,
    /// Software-requested controller reset.
    pub soft: bool,
    /// Controller watchdog reset.
    pub watchdog: bool,
}

/// Drives the AP through its power states.
pub struct PowerStateMachine {
    state: PowerState,
    plan: PowerPlan,
    timings: PowerTimings,
    forcing_shutdown: bool,
    exit_hard_off_requested: bool,
    power_button_held: bool,
    last_shutdown: Option<ShutdownReason>,
    last_reset: Option<ResetReason>,
}

impl PowerStateMachine {
    #[must_use]
    pub fn new(plan: PowerPlan, timings: PowerTimings) -> Self {
        Self {
            state: PowerState::G3,
            plan,
            timings,
            forcing_shutdown: false,
            exit_hard_off_requested: false,
            power_button_held: false,
            last_shutdown: None,
            last_reset: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> PowerState {
        self.state
    }

    #[must_use]
    pub fn plan(&self) -> &PowerPlan {
        &self.plan
    }

    #[must_use]
    pub fn timings(&self) -> PowerTimings {
        self.timings
    }

    /// Installs or removes the daughterboard rail group.
    pub fn set_daughterboard(&mut self, sequence: Option<Sequence>) {
        self.plan.daughterboard = sequence;
    }

    #[must_use]
    pub fn is_forcing_shutdown(&self) -> bool {
        self.forcing_shutdown
    }

    #[must_use]
    pub fn last_shutdown_reason(&self) -> Option<ShutdownReason> {
        self.last_shutdown
    }

    #[must_use]
    pub fn last_reset_reason(&self) -> Option<ResetReason> {
        self.last_reset
    }

    /// Returns `true` when the next handler call would leave the state unchanged
    /// without any new input, so the power task may block.
    #[must_use]
    pub fn is_steady(&self) -> bool {
        match self.state {
            PowerState::G3 => !self.exit_hard_off_requested,
            PowerState::S0 => !self.forcing_shutdown,
            _ => false,
        }
    }

    /// Tracks the physical power button so S0->S3 can turn a held press into
    /// a shutdown.
    pub fn set_power_button_held(&mut self, held: bool) {
        self.power_button_held = held;
    }

    /// Requests a power-on from G3. Returns `false` when not hard off.
    pub fn exit_hard_off(&mut self) -> bool {
        if matches!(self.state, PowerState::G3 | PowerState::S5G3) {
            self.exit_hard_off_requested = true;
            true
        } else {
            false
        }
    }

    /// Sets the forced-shutdown latch; the machine unwinds on its next steps.
    pub fn force_shutdown<const N: usize>(
        &mut self,
        reason: ShutdownReason,
        telemetry: &mut TelemetryRecorder<N>,
        now: Instant,
    ) {
        if !self.forcing_shutdown {
            telemetry.note(TelemetryEventKind::ForcedShutdown(reason), now);
            self.last_shutdown = Some(reason);
        }
        self.forcing_shutdown = true;
    }

    /// Pulses the AP reset line. Returns `false` when the AP is not running.
    pub async fn reset<B: HostInterface + Clock, const N: usize>(
        &mut self,
        board: &mut B,
        reason: ResetReason,
        telemetry: &mut TelemetryRecorder<N>,
    ) -> bool {
        if !matches!(self.state, PowerState::S0 | PowerState::S3S0) {
            return false;
        }
        telemetry.note(TelemetryEventKind::ChipsetReset(reason), board.now());
        self.last_reset = Some(reason);
        board.set_ap_reset(true);
        board.sleep(self.timings.reset_pulse).await;
        board.set_ap_reset(false);
        true
    }

    /// Picks the boot state from live signals and the controller reset cause.
    pub fn chipset_init<B: BoardIo + HostInterface>(
        &mut self,
        board: &mut B,
        supplies: &SupplySupervisor<'_>,
        flags: ResetFlags,
        autoboot: bool,
    ) -> PowerState {
        self.state = PowerState::G3;
        if flags.jumped {
            if self.composite_power_good(board, supplies) {
                board.set_idle_sleep(false);
                self.state = PowerState::S0;
            }
        } else if !flags.ap_off && (autoboot || flags.soft || flags.watchdog) {
            self.exit_hard_off_requested = true;
        }
        self.state
    }

    /// All rails of every group on, and the AP reporting alive.
    pub fn composite_power_good<B: BoardIo>(
        &self,
        board: &mut B,
        supplies: &SupplySupervisor<'_>,
    ) -> bool {
        if !supplies.check_supplies(board, &self.plan.primary) {
            return false;
        }
        if !self
            .plan
            .upper_groups()
            .all(|group| supplies.check_supplies(board, group))
        {
            return false;
        }
        match self.plan.ap_alive {
            Some(signal) => board.read_digital(signal).unwrap_or(false),
            None => true,
        }
    }

    async fn wait_composite<B: BoardIo + Clock>(
        &self,
        board: &mut B,
        supplies: &SupplySupervisor<'_>,
        timeout: Duration,
    ) -> bool {
        let deadline = board.now() + timeout;
        loop {
            if self.composite_power_good(board, supplies) {
                return true;
            }
            if board.now() >= deadline {
                return false;
            }
            board.sleep(self.timings.poll_interval).await;
        }
    }

    fn power_off_upper_groups<B: BoardIo>(&self, board: &mut B, supplies: &mut SupplySupervisor<'_>) {
        for group in self.plan.upper_groups().rev() {
            // Teardown releases every rail; a failed write is already logged
            // by the rail that stays up and shows as a fault later.
            let _ = supplies.sequence_power_off(board, group);
        }
    }

    /// Runs the handler for the current state and moves to the state it picks.
    pub async fn handle_state<B, const N: usize>(
        &mut self,
        board: &mut B,
        supplies: &mut SupplySupervisor<'_>,
        telemetry: &mut TelemetryRecorder<N>,
    ) -> PowerState
    where
        B: BoardIo + Clock + HostInterface,
    {
        let from = self.state;
        let next = self.next_state(board, supplies, telemetry).await;
        if next != from {
            telemetry.record_transition(from, next, board.now());
            self.state = next;
        }
        next
    }

    async fn next_state<B, const N: usize>(
        &mut self,
        board: &mut B,
        supplies: &mut SupplySupervisor<'_>,
        telemetry: &mut TelemetryRecorder<N>,
    ) -> PowerState
    where
        B: BoardIo + Clock + HostInterface,
    {
        match self.state {
            PowerState::G3 => {
                if self.exit_hard_off_requested {
                    self.exit_hard_off_requested = false;
                    PowerState::G3S5
                } else {
                    PowerState::G3
                }
            }
            PowerState::G3S5 => {
                self.forcing_shutdown = false;
                PowerState::S5
            }
            PowerState::S5 => {
                if self.forcing_shutdown {
                    PowerState::S5G3
                } else {
                    PowerState::S5S3
                }
            }
            PowerState::S5S3 => {
                board.set_ap_reset(true);
                if supplies
                    .sequence_power_on(board, telemetry, &self.plan.primary)
                    .await
                    .is_err()
                {
                    self.force_shutdown(ShutdownReason::SequenceFailure, telemetry, board.now());
                    return PowerState::S0S3;
                }
                board.notify(ChipsetEvent::PreInit);
                board.notify(ChipsetEvent::Startup);
                PowerState::S3
            }
            PowerState::S3 => {
                if self.forcing_shutdown {
                    return PowerState::S3S5;
                }
                if !supplies.check_supplies(board, &self.plan.primary) {
                    self.force_shutdown(ShutdownReason::PowerGoodLost, telemetry, board.now());
                    return PowerState::S3S5;
                }

                let timeout = self.timings.s3_rail_timeout;
                let mut failed = false;
                for group in self.plan.upper_groups() {
                    if supplies
                        .sequence_power_on_within(board, telemetry, group, timeout)
                        .await
                        .is_err()
                    {
                        failed = true;
                        break;
                    }
                }
                if failed {
                    self.force_shutdown(ShutdownReason::SequenceFailure, telemetry, board.now());
                    self.power_off_upper_groups(board, supplies);
                    return PowerState::S3S5;
                }

                board.set_ap_reset(false);
                PowerState::S3S0
            }
            PowerState::S3S0 => {
                let alive = self
                    .wait_composite(board, supplies, self.timings.ap_first_timeout)
                    .await;
                if !alive {
                    self.force_shutdown(ShutdownReason::PowerGoodLost, telemetry, board.now());
                    return PowerState::S0S3;
                }
                board.notify(ChipsetEvent::Resume);
                board.set_idle_sleep(false);
                PowerState::S0
            }
            PowerState::S0 => {
                if self.forcing_shutdown {
                    return PowerState::S0S3;
                }
                let alive = self
                    .wait_composite(board, supplies, self.timings.ap_debounce)
                    .await;
                if !alive {
                    self.force_shutdown(ShutdownReason::PowerGoodLost, telemetry, board.now());
                    return PowerState::S0S3;
                }
                // The wait may have slept through a shutdown request.
                if self.forcing_shutdown {
                    PowerState::S0S3
                } else {
                    PowerState::S0
                }
            }
            PowerState::S0S3 => {
                board.notify(ChipsetEvent::Suspend);
                board.set_ap_reset(true);
                self.power_off_upper_groups(board, supplies);
                board.set_idle_sleep(true);
                if self.power_button_held {
                    self.force_shutdown(ShutdownReason::PowerButton, telemetry, board.now());
                }
                PowerState::S3
            }
            PowerState::S3S5 => {
                board.notify(ChipsetEvent::Shutdown);
                let _ = supplies.sequence_power_off(board, &self.plan.primary);
                PowerState::S5
            }
            PowerState::S5G3 => PowerState::G3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::SignalId;
    use crate::supply::{
        EnableControl, Feedback, SequenceStep, SupervisorConfig, Supply, SupplyId, SupplyState,
        sequence_from,
    };
    use crate::testing::MockBoard;
    use embassy_futures::block_on;

    const MAIN_EN: SignalId = SignalId(0);
    const IO_EN: SignalId = SignalId(1);
    const IO_PG: SignalId = SignalId(2);
    const AP_ALIVE: SignalId = SignalId(3);

    static TABLE: [Supply; 2] = [
        Supply::new(
            "main",
            SupplyId(0),
            EnableControl::active_high(MAIN_EN),
            Feedback::None,
        ),
        Supply::new(
            "io",
            SupplyId(0),
            EnableControl::active_high(IO_EN),
            Feedback::PowerGood(IO_PG),
        ),
    ];

    fn machine() -> PowerStateMachine {
        let mut plan =
            PowerPlan::new(sequence_from(&[SequenceStep::new(SupplyId(0), 1)]).unwrap());
        plan.secondary
            .push(sequence_from(&[SequenceStep::new(SupplyId(1), 1)]).unwrap())
            .unwrap();
        plan.ap_alive = Some(AP_ALIVE);
        PowerStateMachine::new(plan, PowerTimings::new())
    }

    fn board() -> MockBoard {
        let mut board = MockBoard::new();
        board.follow(IO_EN, IO_PG, Duration::from_millis(2));
        board.follow(IO_EN, AP_ALIVE, Duration::from_millis(20));
        board
    }

    fn run_until<B: BoardIo + Clock + HostInterface>(
        machine: &mut PowerStateMachine,
        board: &mut B,
        supplies: &mut SupplySupervisor<'_>,
        telemetry: &mut TelemetryRecorder<64>,
        target: PowerState,
    ) -> heapless::Vec<PowerState, 16> {
        let mut visited = heapless::Vec::new();
        for _ in 0..16 {
            let state = block_on(machine.handle_state(board, supplies, telemetry));
            visited.push(state).unwrap();
            if state == target {
                break;
            }
        }
        visited
    }

    #[test]
    fn g3_holds_until_power_on_request() {
        let mut board = board();
        let mut supplies = SupplySupervisor::new(&TABLE, SupervisorConfig::new());
        let mut telemetry = TelemetryRecorder::<64>::new();
        let mut machine = machine();

        assert!(machine.is_steady());
        assert_eq!(
            block_on(machine.handle_state(&mut board, &mut supplies, &mut telemetry)),
            PowerState::G3
        );
        assert!(telemetry.is_empty());
        assert!(machine.exit_hard_off());
        assert!(!machine.is_steady());
    }

    #[test]
    fn boots_to_s0_and_unwinds_to_g3() {
        let mut board = board();
        let mut supplies = SupplySupervisor::new(&TABLE, SupervisorConfig::new());
        let mut telemetry = TelemetryRecorder::<64>::new();
        let mut machine = machine();

        machine.exit_hard_off();
        let up = run_until(&mut machine, &mut board, &mut supplies, &mut telemetry, PowerState::S0);
        assert_eq!(
            up.as_slice(),
            &[
                PowerState::G3S5,
                PowerState::S5,
                PowerState::S5S3,
                PowerState::S3,
                PowerState::S3S0,
                PowerState::S0
            ]
        );
        assert!(!board.ap_reset);
        assert!(!board.idle_sleep);
        assert_eq!(
            board.events.as_slice(),
            &[ChipsetEvent::PreInit, ChipsetEvent::Startup, ChipsetEvent::Resume]
        );

        machine.force_shutdown(ShutdownReason::Host, &mut telemetry, board.now());
        let down = run_until(&mut machine, &mut board, &mut supplies, &mut telemetry, PowerState::G3);
        assert_eq!(
            down.as_slice(),
            &[
                PowerState::S0S3,
                PowerState::S3,
                PowerState::S3S5,
                PowerState::S5,
                PowerState::S5G3,
                PowerState::G3
            ]
        );
        assert!(!board.level(MAIN_EN));
        assert!(!board.level(IO_EN));
        assert_eq!(supplies.state(SupplyId(1)), Ok(SupplyState::Off));
        assert_eq!(machine.last_shutdown_reason(), Some(ShutdownReason::Host));
    }

    #[test]
    fn secondary_timeout_unwinds_without_retry() {
        let mut board = board();
        board.follow(IO_EN, IO_PG, Duration::from_secs(5));
        let mut supplies = SupplySupervisor::new(&TABLE, SupervisorConfig::new());
        let mut telemetry = TelemetryRecorder::<64>::new();
        let mut machine = machine();

        machine.exit_hard_off();
        let visited =
            run_until(&mut machine, &mut board, &mut supplies, &mut telemetry, PowerState::G3);
        assert_eq!(
            visited.as_slice(),
            &[
                PowerState::G3S5,
                PowerState::S5,
                PowerState::S5S3,
                PowerState::S3,
                PowerState::S3S5,
                PowerState::S5,
                PowerState::S5G3,
                PowerState::G3
            ]
        );
        assert!(!board.level(IO_EN));
        assert!(!board.level(MAIN_EN));
        assert_eq!(
            machine.last_shutdown_reason(),
            Some(ShutdownReason::SequenceFailure)
        );
        assert!(machine.is_steady());
    }

    #[test]
    fn lost_ap_power_good_in_s0_forces_shutdown() {
        let mut board = board();
        let mut supplies = SupplySupervisor::new(&TABLE, SupervisorConfig::new());
        let mut telemetry = TelemetryRecorder::<64>::new();
        let mut machine = machine();
        machine.exit_hard_off();
        run_until(&mut machine, &mut board, &mut supplies, &mut telemetry, PowerState::S0);

        board.follow(IO_EN, AP_ALIVE, Duration::from_secs(3_600));
        let started = board.now();
        assert_eq!(
            block_on(machine.handle_state(&mut board, &mut supplies, &mut telemetry)),
            PowerState::S0S3
        );
        assert!(board.now().saturating_duration_since(started) >= Duration::from_secs(1));
        assert_eq!(
            machine.last_shutdown_reason(),
            Some(ShutdownReason::PowerGoodLost)
        );
    }

    #[test]
    fn chipset_init_honours_reset_cause() {
        let mut board = board();
        let supplies = SupplySupervisor::new(&TABLE, SupervisorConfig::new());

        let mut machine = machine();
        let flags = ResetFlags {
            watchdog: true,
            ..ResetFlags::default()
        };
        assert_eq!(
            machine.chipset_init(&mut board, &supplies, flags, false),
            PowerState::G3
        );
        assert!(!machine.is_steady());

        let mut machine = self::machine();
        let flags = ResetFlags {
            ap_off: true,
            soft: true,
            ..ResetFlags::default()
        };
        machine.chipset_init(&mut board, &supplies, flags, true);
        assert!(machine.is_steady());
    }

    #[test]
    fn reset_only_pulses_a_running_ap() {
        let mut board = board();
        let mut supplies = SupplySupervisor::new(&TABLE, SupervisorConfig::new());
        let mut telemetry = TelemetryRecorder::<64>::new();
        let mut machine = machine();

        assert!(!block_on(machine.reset(&mut board, ResetReason::Host, &mut telemetry)));
        machine.exit_hard_off();
        run_until(&mut machine, &mut board, &mut supplies, &mut telemetry, PowerState::S0);

        let before = board.now();
        assert!(block_on(machine.reset(&mut board, ResetReason::Watchdog, &mut telemetry)));
        assert!(!board.ap_reset);
        assert_eq!(board.now().saturating_duration_since(before), Duration::from_millis(1));
        assert_eq!(machine.last_reset_reason(), Some(ResetReason::Watchdog));
    }
}
