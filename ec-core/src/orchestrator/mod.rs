//! Glue between the supply supervisor, power machine, thermal controller and
//! fan driver.
//!
//! [`Orchestrator`] owns every component plus the deferred-action timers and
//! the telemetry ring. Firmware and the emulator feed it events (buttons,
//! watchdog, feedback edges), call [`Orchestrator::step_power`] from the
//! power task, [`Orchestrator::tick_second`] once per second and
//! [`Orchestrator::poll_deferred`] whenever the next deadline passes.

use core::time::Duration;

use crate::config::persisted::{
    ConfigRecord, ConfigTag, ConfigUnit, DB_SUPPLY_COUNT, McuFlags,
};
use crate::config::ControllerConfig;
use crate::deferred::{DeferredAction, DeferredTracker};
use crate::fan::{FanDriver, FanMode, TachCapture};
use crate::hal::{Board, BoardIo, Clock, ConfigStore, FanId, FanPwm, HostInterface};
use crate::power::{PowerPlan, PowerState, PowerStateMachine, ResetFlags, ResetReason, ShutdownReason};
use crate::status::{StatusSnapshot, ZoneSnapshot};
use crate::supply::{Supply, SupplyId, SupplyStatus, SupplySupervisor};
use crate::telemetry::{TelemetryEventKind, TelemetryRecorder};
use crate::thermal::{
    ThermalController, ThermalInputs, ThermalRecovery, ThermalTick, ZoneDefinition,
};
use crate::time::Instant;

/// Rails a daughterboard sequence record switches, indexed by mask bit.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DaughterboardRails {
    pub slot: u8,
    pub rails: [SupplyId; DB_SUPPLY_COUNT],
}

/// Static description of a board.
#[derive(Clone, Debug)]
pub struct BoardLayout<'t> {
    pub supplies: &'t [Supply],
    pub plan: PowerPlan,
    pub zones: &'t [ZoneDefinition],
    /// Rail feeding the fans; fans are driven only while it is on.
    pub fan_supply: Option<SupplyId>,
    pub daughterboard: Option<DaughterboardRails>,
}

fn fan_ids(count: usize) -> impl Iterator<Item = FanId> {
    (0..count).filter_map(|index| u8::try_from(index).ok().map(FanId))
}

/// Owns the power and thermal core of one board.
pub struct Orchestrator<'t> {
    supplies: SupplySupervisor<'t>,
    power: PowerStateMachine,
    thermal: ThermalController,
    fans: FanDriver<'t>,
    deferred: DeferredTracker,
    telemetry: TelemetryRecorder,
    config: ControllerConfig,
    flags: McuFlags,
    fan_supply: Option<SupplyId>,
    daughterboard: Option<DaughterboardRails>,
    watchdog_reset: bool,
}

impl<'t> Orchestrator<'t> {
    #[must_use]
    pub fn new(layout: BoardLayout<'t>, tach: &'t [TachCapture], config: ControllerConfig) -> Self {
        Self {
            supplies: SupplySupervisor::new(layout.supplies, config.supervisor),
            power: PowerStateMachine::new(layout.plan, config.power),
            thermal: ThermalController::new(layout.zones, config.thermal),
            fans: FanDriver::new(tach, config.fan_limits, config.fan),
            deferred: DeferredTracker::new(),
            telemetry: TelemetryRecorder::new(),
            config,
            flags: McuFlags::DEFAULT,
            fan_supply: layout.fan_supply,
            daughterboard: layout.daughterboard,
            watchdog_reset: false,
        }
    }

    /// Loads persisted configuration, seeds rail state from the hardware and
    /// picks the boot power state.
    pub fn init<B: Board, S: ConfigStore>(
        &mut self,
        board: &mut B,
        store: &S,
        reset: ResetFlags,
    ) -> PowerState {
        let now = board.now();
        self.supplies.init_from_live(board);
        self.flags = self.load_flags(store, now);
        self.load_daughterboard(store, now);
        self.thermal.load_config(store, &mut self.telemetry, now);
        self.fans.load_limits(store, &mut self.telemetry, now);

        let state = self
            .power
            .chipset_init(board, &self.supplies, reset, self.flags.autoboot);
        if state == PowerState::S0 {
            self.enable_fans(board);
        }
        state
    }

    fn load_flags<S: ConfigStore>(&mut self, store: &S, now: Instant) -> McuFlags {
        match store.lookup(ConfigUnit::Motherboard, ConfigTag::McuFlags) {
            Some(ConfigRecord::McuFlags(flags)) => flags,
            Some(_) => {
                self.telemetry
                    .note(TelemetryEventKind::ConfigRejected(ConfigTag::McuFlags), now);
                McuFlags::DEFAULT
            }
            None => {
                self.telemetry
                    .note(TelemetryEventKind::ConfigDefaulted(ConfigTag::McuFlags), now);
                McuFlags::DEFAULT
            }
        }
    }

    fn load_daughterboard<S: ConfigStore>(&mut self, store: &S, now: Instant) {
        let Some(layout) = self.daughterboard else {
            return;
        };
        let tag = ConfigTag::DbPowerSequence;
        let sequence = match store.lookup(ConfigUnit::Daughterboard(layout.slot), tag) {
            Some(ConfigRecord::DbPowerSequence(record)) => record.to_sequence(&layout.rails).ok(),
            Some(_) => None,
            None => return,
        };
        if sequence.is_none() {
            self.telemetry.note(TelemetryEventKind::ConfigRejected(tag), now);
        }
        self.power.set_daughterboard(sequence);
    }

    #[must_use]
    pub fn power_state(&self) -> PowerState {
        self.power.state()
    }

    #[must_use]
    pub fn power(&self) -> &PowerStateMachine {
        &self.power
    }

    #[must_use]
    pub fn supplies(&self) -> &SupplySupervisor<'t> {
        &self.supplies
    }

    #[must_use]
    pub fn thermal(&self) -> &ThermalController {
        &self.thermal
    }

    #[must_use]
    pub fn fans(&self) -> &FanDriver<'t> {
        &self.fans
    }

    pub fn fans_mut(&mut self) -> &mut FanDriver<'t> {
        &mut self.fans
    }

    #[must_use]
    pub fn telemetry(&self) -> &TelemetryRecorder {
        &self.telemetry
    }

    #[must_use]
    pub fn deferred(&self) -> &DeferredTracker {
        &self.deferred
    }

    #[must_use]
    pub fn mcu_flags(&self) -> McuFlags {
        self.flags
    }

    /// Earliest pending deferred deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deferred.next_deadline()
    }

    /// Returns `true` when the power task may block until the next event.
    #[must_use]
    pub fn is_power_steady(&self) -> bool {
        self.power.is_steady() && !self.supplies.fault_check_pending()
    }

    /// Requests a power-on from hard off.
    pub fn request_power_on(&mut self) -> bool {
        self.power.exit_hard_off()
    }

    pub fn force_shutdown(&mut self, reason: ShutdownReason, now: Instant) {
        self.power.force_shutdown(reason, &mut self.telemetry, now);
    }

    pub async fn reset<B: HostInterface + Clock>(
        &mut self,
        board: &mut B,
        reason: ResetReason,
    ) -> bool {
        self.power.reset(board, reason, &mut self.telemetry).await
    }

    /// Physical power button edge.
    ///
    /// A press powers the system on when it is off and arms the forced
    /// shutdown; releasing the button before the hold time cancels it.
    pub fn power_button_changed(&mut self, pressed: bool, now: Instant) {
        self.power.set_power_button_held(pressed);
        if pressed {
            if self.power.state().is_any_off() {
                self.power.exit_hard_off();
            }
            self.deferred.schedule(
                DeferredAction::ForceShutdown,
                now,
                self.config.power.forced_shutdown_hold,
            );
        } else {
            self.deferred.cancel(DeferredAction::ForceShutdown);
        }
    }

    /// Reset button edge; a press held past the debounce resets the AP.
    pub fn reset_button_changed(&mut self, pressed: bool, now: Instant) {
        if pressed {
            self.deferred.schedule(
                DeferredAction::ForceReset,
                now,
                self.config.power.reset_button_delay,
            );
        } else {
            self.deferred.cancel(DeferredAction::ForceReset);
        }
    }

    /// AP watchdog expired; the AP is reset and brought back up.
    pub fn watchdog_expired(&mut self, now: Instant) {
        self.watchdog_reset = true;
        self.deferred.schedule(
            DeferredAction::ForceReset,
            now,
            self.config.power.watchdog_reset_delay,
        );
    }

    /// A rail feedback line changed. Safe to call from the wake path; the
    /// check itself runs in [`Self::service_faults`].
    pub fn supply_feedback_changed(&mut self) {
        self.supplies.request_fault_check();
    }

    /// Runs a pending fault check. Returns `true` when a rail was demoted and
    /// a shutdown was forced.
    pub fn service_faults<B: BoardIo + Clock>(&mut self, board: &mut B) -> bool {
        if !self.supplies.fault_check_pending() {
            return false;
        }
        let demoted = self.supplies.run_fault_check(board, &mut self.telemetry);
        if demoted.is_empty() {
            return false;
        }
        self.power
            .force_shutdown(ShutdownReason::SupplyFault, &mut self.telemetry, board.now());
        true
    }

    /// Services faults, then runs one power state handler.
    pub async fn step_power<B: Board>(&mut self, board: &mut B) -> PowerState {
        self.service_faults(board);
        let from = self.power.state();
        let state = self
            .power
            .handle_state(board, &mut self.supplies, &mut self.telemetry)
            .await;

        if state == PowerState::G3 && self.deferred.is_pending(DeferredAction::ThermalForceShutdown) {
            // The AP shut down on its own; finish the thermal shutdown now and
            // keep the fan override the same distance behind it.
            let now = board.now();
            self.deferred
                .reschedule(DeferredAction::ThermalForceShutdown, now, Duration::ZERO);
            self.deferred.reschedule(
                DeferredAction::ThermalFanOverride,
                now,
                self.config.thermal.fan_override_offset,
            );
        }
        if from != state {
            match state {
                PowerState::S0 => self.enable_fans(board),
                PowerState::S5 if from == PowerState::S3S5 => self.disable_fans(board),
                _ => {}
            }
        }
        state
    }

    fn enable_fans<B: FanPwm>(&mut self, board: &mut B) {
        for fan in fan_ids(self.fans.len()) {
            self.fans.set_enabled(board, fan, true);
        }
    }

    fn disable_fans<B: FanPwm>(&mut self, board: &mut B) {
        if self.deferred.is_pending(DeferredAction::ThermalFanOverride) {
            return;
        }
        for fan in fan_ids(self.fans.len()) {
            self.fans.set_enabled(board, fan, false);
        }
    }

    /// Runs every deferred action that is due. Returns `true` when any ran.
    pub async fn poll_deferred<B: Board>(&mut self, board: &mut B) -> bool {
        let mut ran = false;
        while let Some(action) = self.deferred.take_expired(board.now()) {
            ran = true;
            match action {
                DeferredAction::ForceShutdown => {
                    self.force_shutdown(ShutdownReason::PowerButton, board.now());
                }
                DeferredAction::ForceReset => {
                    let reason = if self.watchdog_reset {
                        ResetReason::Watchdog
                    } else {
                        ResetReason::ResetButton
                    };
                    self.power.reset(board, reason, &mut self.telemetry).await;
                    if core::mem::take(&mut self.watchdog_reset) {
                        self.power.exit_hard_off();
                    }
                }
                DeferredAction::ThermalForceShutdown => {
                    self.force_shutdown(ShutdownReason::Thermal, board.now());
                }
                DeferredAction::ThermalFanOverride => self.run_fan_override(board).await,
            }
        }
        ran
    }

    fn fan_power_good<B: BoardIo>(&self, board: &mut B) -> bool {
        self.fan_supply
            .is_none_or(|id| self.supplies.status(board, id) == SupplyStatus::On)
    }

    /// Once-per-second thermal and fan work.
    pub async fn tick_second<B: Board>(&mut self, board: &mut B) -> ThermalTick {
        let now = board.now();
        let state = self.power.state();
        let inputs = ThermalInputs {
            control_enabled: self.fans.thermal_control_enabled(),
            chipset_on: state == PowerState::S0,
            chipset_hard_off: state == PowerState::G3,
            recovery_allowed: self.flags.thermal_recovery,
        };
        let tick = self.thermal.tick(board, inputs, &mut self.telemetry, now);

        if let Some(demand) = tick.demand {
            self.fans.apply_demand(demand);
        }
        if tick.critical.is_some() {
            self.start_thermal_shutdown(board).await;
        }
        if let Some(recovery) = tick.recovery {
            self.restore_fan_control();
            if recovery == ThermalRecovery::RestartAp {
                self.power.exit_hard_off();
            }
        }

        let fan_power_good = self.fan_power_good(board);
        self.fans.health_tick(fan_power_good, &mut self.telemetry, now);
        self.fans
            .control_tick(board, fan_power_good, &mut self.telemetry, now);
        tick
    }

    /// Asks the AP to shut down, then arms the forced shutdown and the fan
    /// override in case it does not.
    async fn start_thermal_shutdown<B: HostInterface + Clock>(&mut self, board: &mut B) {
        let thermal = self.config.thermal;
        board.set_power_button(true);
        board.sleep(thermal.shutdown_button_pulse).await;
        board.set_power_button(false);

        let now = board.now();
        self.deferred.schedule(
            DeferredAction::ThermalForceShutdown,
            now,
            thermal.force_shutdown_delay,
        );
        self.deferred.schedule(
            DeferredAction::ThermalFanOverride,
            now,
            thermal.force_shutdown_delay + thermal.fan_override_offset,
        );
    }

    /// Powers the fan rail and runs every fan at the fixed override duty.
    async fn run_fan_override<B: Board>(&mut self, board: &mut B) {
        let thermal = self.config.thermal;
        if let Some(id) = self.fan_supply {
            let powered = self
                .supplies
                .power_on(
                    board,
                    &mut self.telemetry,
                    id,
                    Duration::ZERO,
                    thermal.fan_supply_timeout,
                )
                .await;
            if powered.is_err() {
                return;
            }
        }
        for fan in fan_ids(self.fans.len()) {
            self.fans.set_mode(fan, FanMode::Manual);
            self.fans.set_enabled(board, fan, true);
            self.fans.set_duty(board, fan, thermal.fan_override_duty);
        }
    }

    fn restore_fan_control(&mut self) {
        for fan in fan_ids(self.fans.len()) {
            self.fans.set_mode(fan, FanMode::Rpm);
        }
    }

    /// Captures the state shown by the status surface.
    pub fn snapshot<B: BoardIo>(&self, board: &mut B) -> StatusSnapshot {
        let mut snapshot = StatusSnapshot::new(self.power.state());
        snapshot.forcing_shutdown = self.power.is_forcing_shutdown();
        snapshot.last_shutdown = self.power.last_shutdown_reason();
        snapshot.last_reset = self.power.last_reset_reason();

        for index in 0..self.supplies.table().len() {
            let Ok(raw) = u8::try_from(index) else {
                break;
            };
            match self.supplies.status(board, SupplyId(raw)) {
                SupplyStatus::On => snapshot.supplies_on += 1,
                SupplyStatus::Off => snapshot.supplies_off += 1,
                SupplyStatus::Fault => snapshot.supplies_fault += 1,
            }
        }

        snapshot.thermal_shutdown = self.thermal.in_thermal_shutdown();
        snapshot.thermal_control = self.fans.thermal_control_enabled();
        snapshot.demand = self.thermal.aggregate_demand();
        for (index, zone) in self.thermal.zones().iter().enumerate() {
            let _ = snapshot.zones.push(ZoneSnapshot {
                index,
                name: zone.definition().name,
                cooling: zone.is_cooling(),
                celsius: zone.last_temperature(),
                requirement: zone.requirement(),
                tending_to_critical: zone.is_tending_to_critical(),
            });
        }
        for fan in self.fans.fans() {
            if let Some(status) = self.fans.status(fan) {
                let _ = snapshot.fans.push(status);
            }
        }
        snapshot.events = self.telemetry.len();
        snapshot
    }
}
