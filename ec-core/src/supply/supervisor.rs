//! Rail supervisor: power-on with power-good polling, ordered sequencing and
//! the deferred fault monitor.

use core::fmt;
use core::time::Duration;

use heapless::Vec;

use super::{
    MAX_SUPPLIES, Feedback, SequenceStep, Supply, SupplyId, SupplyState, SupplyStatus,
    dependency_order,
};
use crate::hal::{BoardIo, Clock};
use crate::telemetry::{TelemetryEventKind, TelemetryPayload, TelemetryRecorder};

/// Errors reported while controlling rails.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SupplyError {
    /// The id does not name a rail in the registry.
    UnknownSupply(SupplyId),
    /// The parent rail is not on.
    ParentNotReady(SupplyId),
    /// Writing the enable signal failed.
    ControlFailed(SupplyId),
    /// Feedback did not confirm the rail within the timeout.
    PowerGoodTimeout(SupplyId),
    /// A rail fell out of regulation after its step completed.
    Regressed(SupplyId),
    /// A sequence does not fit into the step buffer.
    SequenceTooLong,
}

impl SupplyError {
    /// Rail the error refers to, if any.
    #[must_use]
    pub const fn supply(self) -> Option<SupplyId> {
        match self {
            SupplyError::UnknownSupply(id)
            | SupplyError::ParentNotReady(id)
            | SupplyError::ControlFailed(id)
            | SupplyError::PowerGoodTimeout(id)
            | SupplyError::Regressed(id) => Some(id),
            SupplyError::SequenceTooLong => None,
        }
    }
}

impl fmt::Display for SupplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Timing used by the supervisor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SupervisorConfig {
    /// Power-good timeout applied to each sequence step.
    pub step_timeout: Duration,
    /// Interval between feedback polls.
    pub poll_interval: Duration,
}

impl SupervisorConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            step_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(1),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the per-rail state for one registry.
pub struct SupplySupervisor<'t> {
    table: &'t [Supply],
    states: Vec<SupplyState, MAX_SUPPLIES>,
    config: SupervisorConfig,
    fault_check_pending: bool,
}

impl<'t> SupplySupervisor<'t> {
    /// Creates a supervisor with every rail marked off.
    ///
    /// Registries longer than [`MAX_SUPPLIES`] are truncated.
    #[must_use]
    pub fn new(table: &'t [Supply], config: SupervisorConfig) -> Self {
        let table = &table[..table.len().min(MAX_SUPPLIES)];
        let mut states = Vec::new();
        for _ in table {
            let _ = states.push(SupplyState::Off);
        }
        Self {
            table,
            states,
            config,
            fault_check_pending: false,
        }
    }

    #[must_use]
    pub fn table(&self) -> &'t [Supply] {
        self.table
    }

    #[must_use]
    pub fn config(&self) -> SupervisorConfig {
        self.config
    }

    /// Looks a rail up by name, ignoring ASCII case.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<SupplyId> {
        self.table
            .iter()
            .position(|supply| supply.name.eq_ignore_ascii_case(name))
            .and_then(|index| u8::try_from(index).ok())
            .map(SupplyId)
    }

    /// Returns the bookkeeping state of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`SupplyError::UnknownSupply`] for ids outside the registry.
    pub fn state(&self, id: SupplyId) -> Result<SupplyState, SupplyError> {
        self.states
            .get(id.index())
            .copied()
            .ok_or(SupplyError::UnknownSupply(id))
    }

    fn supply(&self, id: SupplyId) -> Result<&'t Supply, SupplyError> {
        self.table
            .get(id.index())
            .ok_or(SupplyError::UnknownSupply(id))
    }

    fn set_state(&mut self, id: SupplyId, state: SupplyState) {
        if let Some(slot) = self.states.get_mut(id.index()) {
            *slot = state;
        }
    }

    /// Reads back whether the enable line of `id` is asserted.
    fn powered_on<B: BoardIo>(&self, board: &mut B, id: SupplyId) -> Result<bool, SupplyError> {
        let supply = self.supply(id)?;
        let level = board
            .read_digital(supply.enable.signal)
            .map_err(|_| SupplyError::ControlFailed(id))?;
        Ok(level != supply.enable.active_low)
    }

    /// Samples the rail voltage when it has analog feedback.
    pub fn voltage<B: BoardIo>(&self, board: &mut B, id: SupplyId) -> Option<u16> {
        match self.supply(id).ok()?.feedback {
            Feedback::Analog { channel, .. } => board.read_analog(channel).ok(),
            Feedback::None | Feedback::PowerGood(_) => None,
        }
    }

    /// Live status of a rail.
    ///
    /// An enable line that cannot be read counts as off; feedback that cannot
    /// be read counts as a fault.
    pub fn status<B: BoardIo>(&self, board: &mut B, id: SupplyId) -> SupplyStatus {
        let Ok(supply) = self.supply(id) else {
            return SupplyStatus::Off;
        };
        if !self.powered_on(board, id).unwrap_or(false) {
            return SupplyStatus::Off;
        }

        match supply.feedback {
            Feedback::None => SupplyStatus::On,
            Feedback::Analog { channel, min_mv } => match board.read_analog(channel) {
                Ok(mv) if mv >= min_mv => SupplyStatus::On,
                _ => SupplyStatus::Fault,
            },
            Feedback::PowerGood(signal) => match board.read_digital(signal) {
                Ok(true) => SupplyStatus::On,
                _ => SupplyStatus::Fault,
            },
        }
    }

    fn control<B: BoardIo>(
        &self,
        board: &mut B,
        id: SupplyId,
        on: bool,
    ) -> Result<(), SupplyError> {
        let supply = self.supply(id)?;
        if on && !supply.is_root(id) && self.status(board, supply.parent) != SupplyStatus::On {
            return Err(SupplyError::ParentNotReady(id));
        }
        board
            .set_digital(supply.enable.signal, supply.enable.level_for(on))
            .map_err(|_| SupplyError::ControlFailed(id))
    }

    /// Enables `id` and waits for its feedback to confirm it.
    ///
    /// # Errors
    ///
    /// * [`SupplyError::ParentNotReady`] or [`SupplyError::ControlFailed`] when
    ///   the rail could not be enabled; the rail is marked `TurnOnFailed`.
    /// * [`SupplyError::PowerGoodTimeout`] when feedback stays bad past
    ///   `timeout`; the rail is marked `PgTimeout`.
    pub async fn power_on<B: BoardIo + Clock, const N: usize>(
        &mut self,
        board: &mut B,
        telemetry: &mut TelemetryRecorder<N>,
        id: SupplyId,
        settle: Duration,
        timeout: Duration,
    ) -> Result<(), SupplyError> {
        if self.state(id)? == SupplyState::On {
            return Ok(());
        }

        self.set_state(id, SupplyState::TurningOn);

        if let Err(err) = self.control(board, id, true) {
            self.set_state(id, SupplyState::TurnOnFailed);
            let event = match err {
                SupplyError::ParentNotReady(_) => TelemetryEventKind::SupplyParentOff(id),
                _ => TelemetryEventKind::SupplyFailed(id),
            };
            telemetry.record(
                event,
                TelemetryPayload::Supply {
                    state: SupplyState::TurnOnFailed,
                    millivolts: None,
                },
                board.now(),
            );
            return Err(err);
        }

        if !settle.is_zero() {
            board.sleep(settle).await;
        }

        let deadline = board.now() + timeout;
        while self.status(board, id) != SupplyStatus::On && board.now() < deadline {
            board.sleep(self.config.poll_interval).await;
        }

        if self.status(board, id) != SupplyStatus::On {
            self.set_state(id, SupplyState::PgTimeout);
            let millivolts = self.voltage(board, id);
            telemetry.record(
                TelemetryEventKind::SupplyFailed(id),
                TelemetryPayload::Supply {
                    state: SupplyState::PgTimeout,
                    millivolts,
                },
                board.now(),
            );
            return Err(SupplyError::PowerGoodTimeout(id));
        }

        self.set_state(id, SupplyState::On);
        telemetry.note(TelemetryEventKind::SupplyOn(id), board.now());
        Ok(())
    }

    /// Marks `id` off and releases its enable line without checking feedback.
    ///
    /// # Errors
    ///
    /// Returns [`SupplyError::ControlFailed`] when the enable write fails; the
    /// rail is still recorded as off.
    pub fn power_off<B: BoardIo>(&mut self, board: &mut B, id: SupplyId) -> Result<(), SupplyError> {
        self.supply(id)?;
        self.set_state(id, SupplyState::Off);
        self.control(board, id, false)
    }

    /// Powers every step on in order, then re-verifies the whole group.
    ///
    /// A rail that dropped out by the time the group is re-verified is marked
    /// `Fault`.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error, or [`SupplyError::Regressed`]
    /// when a rail dropped out while a later step settled.
    pub async fn sequence_power_on<B: BoardIo + Clock, const N: usize>(
        &mut self,
        board: &mut B,
        telemetry: &mut TelemetryRecorder<N>,
        steps: &[SequenceStep],
    ) -> Result<(), SupplyError> {
        let timeout = self.config.step_timeout;
        self.sequence_power_on_within(board, telemetry, steps, timeout)
            .await
    }

    /// [`Self::sequence_power_on`] with a per-step power-good timeout.
    ///
    /// # Errors
    ///
    /// Same as [`Self::sequence_power_on`].
    pub async fn sequence_power_on_within<B: BoardIo + Clock, const N: usize>(
        &mut self,
        board: &mut B,
        telemetry: &mut TelemetryRecorder<N>,
        steps: &[SequenceStep],
        timeout: Duration,
    ) -> Result<(), SupplyError> {
        for step in steps {
            let powered = self
                .power_on(board, telemetry, step.supply, step.delay, timeout)
                .await;
            if let Err(err) = powered {
                telemetry.note(TelemetryEventKind::SequenceFailed(step.supply), board.now());
                return Err(err);
            }
        }

        let mut result = Ok(());
        for step in steps {
            if self.status(board, step.supply) != SupplyStatus::On {
                self.set_state(step.supply, SupplyState::Fault);
                telemetry.note(TelemetryEventKind::SequenceFailed(step.supply), board.now());
                if result.is_ok() {
                    result = Err(SupplyError::Regressed(step.supply));
                }
            }
        }
        result
    }

    /// Powers every step off in reverse order.
    ///
    /// Every rail is released even when an earlier write fails; the first
    /// failure is reported.
    ///
    /// # Errors
    ///
    /// Returns the first [`SupplyError`] raised while releasing a rail.
    pub fn sequence_power_off<B: BoardIo>(
        &mut self,
        board: &mut B,
        steps: &[SequenceStep],
    ) -> Result<(), SupplyError> {
        let mut result = Ok(());
        for step in steps.iter().rev() {
            let outcome = self.power_off(board, step.supply);
            if result.is_ok() {
                result = outcome;
            }
        }
        result
    }

    /// Returns `true` when every rail in `steps` reports on.
    pub fn check_supplies<B: BoardIo>(&self, board: &mut B, steps: &[SequenceStep]) -> bool {
        steps
            .iter()
            .all(|step| self.status(board, step.supply) == SupplyStatus::On)
    }

    /// Seeds the bookkeeping state from live rail status.
    pub fn init_from_live<B: BoardIo>(&mut self, board: &mut B) {
        for index in 0..self.states.len() {
            let Ok(raw) = u8::try_from(index) else {
                break;
            };
            let id = SupplyId(raw);
            let state = match self.status(board, id) {
                SupplyStatus::On => SupplyState::On,
                SupplyStatus::Off => SupplyState::Off,
                SupplyStatus::Fault => SupplyState::Fault,
            };
            self.set_state(id, state);
        }
    }

    /// Flags that a feedback line changed; the check runs later in task context.
    pub fn request_fault_check(&mut self) {
        self.fault_check_pending = true;
    }

    #[must_use]
    pub fn fault_check_pending(&self) -> bool {
        self.fault_check_pending
    }

    /// Re-evaluates every rail marked on and demotes the ones gone bad.
    ///
    /// Demoted rails are released and returned so the caller can wake the
    /// power task.
    pub fn run_fault_check<B: BoardIo + Clock, const N: usize>(
        &mut self,
        board: &mut B,
        telemetry: &mut TelemetryRecorder<N>,
    ) -> Vec<SupplyId, MAX_SUPPLIES> {
        self.fault_check_pending = false;
        let mut demoted = Vec::new();

        for index in 0..self.states.len() {
            let Ok(raw) = u8::try_from(index) else {
                break;
            };
            let id = SupplyId(raw);
            if self.states[index] != SupplyState::On {
                continue;
            }
            if self.status(board, id) != SupplyStatus::Fault {
                continue;
            }

            self.set_state(id, SupplyState::Fault);
            let millivolts = self.voltage(board, id);
            telemetry.record(
                TelemetryEventKind::SupplyFault(id),
                TelemetryPayload::Supply {
                    state: SupplyState::Fault,
                    millivolts,
                },
                board.now(),
            );
            // The rail stays marked as faulted even if the release fails.
            let _ = self.control(board, id, false);
            let _ = demoted.push(id);
        }

        demoted
    }

    /// Writes the dependency-ordered rail report, one rail per line.
    ///
    /// # Errors
    ///
    /// Propagates formatter errors from `writer`.
    pub fn write_report<B: BoardIo, W: fmt::Write>(
        &self,
        board: &mut B,
        writer: &mut W,
    ) -> fmt::Result {
        writeln!(writer, "{:<20}{:<16}voltage", "supply", "state")?;
        for (id, depth) in dependency_order(self.table) {
            let Ok(supply) = self.supply(id) else {
                continue;
            };
            let state = self.states.get(id.index()).copied().unwrap_or(SupplyState::Off);
            let indent = depth * 2;
            let pad = 20usize.saturating_sub(indent + supply.name.len());
            write!(writer, "{:indent$}{}{:pad$}{:<16}", "", supply.name, "", state.as_str())?;
            match self.voltage(board, id) {
                Some(mv) if self.powered_on(board, id).unwrap_or(false) => {
                    writeln!(writer, "{mv:>6} mV")?;
                }
                _ => writeln!(writer)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{AnalogChannel, SignalId};
    use crate::supply::EnableControl;
    use crate::testing::MockBoard;
    use crate::time::Instant;
    use embassy_futures::block_on;

    const ROOT_EN: SignalId = SignalId(0);
    const CHILD_EN: SignalId = SignalId(1);
    const CHILD_PG: SignalId = SignalId(2);
    const ANALOG_EN: SignalId = SignalId(3);

    static TABLE: [Supply; 3] = [
        Supply::new(
            "12V",
            SupplyId(0),
            EnableControl::active_low(ROOT_EN),
            Feedback::None,
        ),
        Supply::new(
            "3V3",
            SupplyId(0),
            EnableControl::active_high(CHILD_EN),
            Feedback::PowerGood(CHILD_PG),
        ),
        Supply::new(
            "1V8",
            SupplyId(1),
            EnableControl::active_high(ANALOG_EN),
            Feedback::Analog {
                channel: AnalogChannel(0),
                min_mv: 1_700,
            },
        ),
    ];

    fn board() -> MockBoard {
        let mut board = MockBoard::new();
        board.set_level(ROOT_EN, true);
        board.follow(CHILD_EN, CHILD_PG, Duration::from_millis(3));
        board.set_analog(AnalogChannel(0), 1_800);
        board
    }

    #[test]
    fn inverted_enable_turns_root_on() {
        let mut board = board();
        let mut telemetry = TelemetryRecorder::<16>::new();
        let mut supervisor = SupplySupervisor::new(&TABLE, SupervisorConfig::new());

        assert_eq!(supervisor.status(&mut board, SupplyId(0)), SupplyStatus::Off);
        block_on(supervisor.power_on(
            &mut board,
            &mut telemetry,
            SupplyId(0),
            Duration::ZERO,
            Duration::from_millis(10),
        ))
        .unwrap();
        assert!(!board.level(ROOT_EN));
        assert_eq!(supervisor.state(SupplyId(0)), Ok(SupplyState::On));
    }

    #[test]
    fn refuses_child_while_parent_is_off() {
        let mut board = board();
        let mut telemetry = TelemetryRecorder::<16>::new();
        let mut supervisor = SupplySupervisor::new(&TABLE, SupervisorConfig::new());

        let err = block_on(supervisor.power_on(
            &mut board,
            &mut telemetry,
            SupplyId(1),
            Duration::ZERO,
            Duration::from_millis(10),
        ))
        .unwrap_err();
        assert_eq!(err, SupplyError::ParentNotReady(SupplyId(1)));
        assert_eq!(supervisor.state(SupplyId(1)), Ok(SupplyState::TurnOnFailed));
        assert!(!board.level(CHILD_EN));
    }

    #[test]
    fn times_out_when_power_good_never_rises() {
        let mut board = board();
        board.follow(CHILD_EN, CHILD_PG, Duration::from_secs(1));
        let mut telemetry = TelemetryRecorder::<16>::new();
        let mut supervisor = SupplySupervisor::new(&TABLE, SupervisorConfig::new());
        let steps = [SequenceStep::new(SupplyId(0), 0), SequenceStep::new(SupplyId(1), 0)];

        let err = block_on(supervisor.sequence_power_on(&mut board, &mut telemetry, &steps))
            .unwrap_err();
        assert_eq!(err, SupplyError::PowerGoodTimeout(SupplyId(1)));
        assert_eq!(supervisor.state(SupplyId(1)), Ok(SupplyState::PgTimeout));
        assert!(telemetry.contains(TelemetryEventKind::SequenceFailed(SupplyId(1))));
        // Bounded by the 50 ms step timeout plus one poll.
        assert!(board.now().as_millis() <= 52);
    }

    #[test]
    fn analog_rail_below_minimum_reports_fault() {
        let mut board = board();
        let mut telemetry = TelemetryRecorder::<16>::new();
        let mut supervisor = SupplySupervisor::new(&TABLE, SupervisorConfig::new());
        let steps = [
            SequenceStep::new(SupplyId(0), 0),
            SequenceStep::new(SupplyId(1), 1),
            SequenceStep::new(SupplyId(2), 1),
        ];
        block_on(supervisor.sequence_power_on(&mut board, &mut telemetry, &steps)).unwrap();

        board.set_analog(AnalogChannel(0), 1_200);
        assert_eq!(supervisor.status(&mut board, SupplyId(2)), SupplyStatus::Fault);

        supervisor.request_fault_check();
        assert!(supervisor.fault_check_pending());
        let demoted = supervisor.run_fault_check(&mut board, &mut telemetry);
        assert_eq!(demoted.as_slice(), &[SupplyId(2)]);
        assert_eq!(supervisor.state(SupplyId(2)), Ok(SupplyState::Fault));
        assert!(!board.level(ANALOG_EN));
        assert!(!supervisor.fault_check_pending());
    }

    #[test]
    fn rail_lost_while_a_later_step_settles_is_marked_faulted() {
        let mut board = board();
        board.drop_out(CHILD_PG, Instant::from_millis(8));
        let mut telemetry = TelemetryRecorder::<16>::new();
        let mut supervisor = SupplySupervisor::new(&TABLE, SupervisorConfig::new());
        let steps = [
            SequenceStep::new(SupplyId(0), 0),
            SequenceStep::new(SupplyId(1), 1),
            SequenceStep::new(SupplyId(2), 10),
        ];

        let err = block_on(supervisor.sequence_power_on(&mut board, &mut telemetry, &steps))
            .unwrap_err();
        assert_eq!(err, SupplyError::Regressed(SupplyId(1)));
        assert_eq!(supervisor.state(SupplyId(1)), Ok(SupplyState::Fault));
        assert_eq!(supervisor.state(SupplyId(2)), Ok(SupplyState::On));
        assert_eq!(supervisor.status(&mut board, SupplyId(1)), SupplyStatus::Fault);
    }

    #[test]
    fn power_off_after_partial_power_on_leaves_every_rail_off() {
        let mut board = board();
        board.follow(CHILD_EN, CHILD_PG, Duration::from_secs(1));
        let mut telemetry = TelemetryRecorder::<16>::new();
        let mut supervisor = SupplySupervisor::new(&TABLE, SupervisorConfig::new());
        let steps = [
            SequenceStep::new(SupplyId(0), 0),
            SequenceStep::new(SupplyId(1), 0),
            SequenceStep::new(SupplyId(2), 0),
        ];

        assert!(block_on(supervisor.sequence_power_on(&mut board, &mut telemetry, &steps)).is_err());
        assert_eq!(supervisor.state(SupplyId(0)), Ok(SupplyState::On));
        assert_eq!(supervisor.state(SupplyId(1)), Ok(SupplyState::PgTimeout));
        assert_eq!(supervisor.state(SupplyId(2)), Ok(SupplyState::Off));

        supervisor.sequence_power_off(&mut board, &steps).unwrap();
        for step in &steps {
            assert_eq!(supervisor.state(step.supply), Ok(SupplyState::Off));
            assert_eq!(supervisor.status(&mut board, step.supply), SupplyStatus::Off);
        }
        assert!(board.level(ROOT_EN));
        assert!(!board.level(CHILD_EN));
        assert!(!board.level(ANALOG_EN));
    }

    #[test]
    fn init_from_live_reflects_enabled_rails() {
        let mut board = board();
        board.set_level(ROOT_EN, false);
        let mut supervisor = SupplySupervisor::new(&TABLE, SupervisorConfig::new());

        supervisor.init_from_live(&mut board);
        assert_eq!(supervisor.state(SupplyId(0)), Ok(SupplyState::On));
        assert_eq!(supervisor.state(SupplyId(1)), Ok(SupplyState::Off));
        assert_eq!(supervisor.lookup("3v3"), Some(SupplyId(1)));
    }

    #[test]
    fn report_indents_children() {
        let mut board = board();
        let supervisor = SupplySupervisor::new(&TABLE, SupervisorConfig::new());
        let mut out: heapless::String<256> = heapless::String::new();
        supervisor.write_report(&mut board, &mut out).unwrap();

        let mut lines = out.lines().skip(1);
        assert!(lines.next().unwrap().starts_with("12V"));
        assert!(lines.next().unwrap().starts_with("  3V3"));
        assert!(lines.next().unwrap().starts_with("    1V8"));
    }
}
