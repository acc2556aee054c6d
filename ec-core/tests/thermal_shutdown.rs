mod common;

use core::time::Duration;

use common::{BenchBoard, RecordStore};
use ec_core::boards::reference::{self, signals};
use ec_core::config::ControllerConfig;
use ec_core::deferred::DeferredAction;
use ec_core::fan::{FanMode, TachCapture};
use ec_core::hal::{Clock, FanId, SensorId};
use ec_core::orchestrator::Orchestrator;
use ec_core::power::{PowerState, ResetFlags, ShutdownReason};
use ec_core::telemetry::TelemetryEventKind;
use ec_core::thermal::ThermalRecovery;
use embassy_futures::block_on;

const AP_SENSOR: SensorId = SensorId(0);

fn step_until(orchestrator: &mut Orchestrator<'_>, board: &mut BenchBoard, target: PowerState) {
    for _ in 0..16 {
        if block_on(orchestrator.step_power(board)) == target {
            return;
        }
    }
    panic!("never reached {target}, stuck in {}", orchestrator.power_state());
}

fn running<'t>(tach: &'t [TachCapture], board: &mut BenchBoard) -> Orchestrator<'t> {
    let mut orchestrator = Orchestrator::new(
        reference::layout().expect("layout"),
        tach,
        ControllerConfig::new(),
    );
    orchestrator.init(board, &RecordStore::default(), ResetFlags::default());
    orchestrator.request_power_on();
    step_until(&mut orchestrator, board, PowerState::S0);
    orchestrator
}

#[test]
fn critical_zone_shuts_down_even_without_thermal_control() {
    let tach = [TachCapture::new(), TachCapture::new()];
    let mut board = BenchBoard::reference();
    let mut orchestrator = running(&tach, &mut board);
    for fan in [FanId(0), FanId(1)] {
        orchestrator.fans_mut().set_thermal_control(fan, false);
    }

    board.set_celsius(AP_SENSOR, 90);
    let tick = block_on(orchestrator.tick_second(&mut board));

    assert_eq!(tick.critical, Some(0));
    assert_eq!(tick.demand, None);
    assert!(orchestrator.thermal().in_thermal_shutdown());
    assert!(
        orchestrator
            .telemetry()
            .contains(TelemetryEventKind::ThermalCritical(0))
    );

    // The AP sees one short press asking it to shut down.
    assert_eq!(board.button_presses, 1);
    assert!(!board.power_button);
    let pulse_end = board.now();
    assert_eq!(
        orchestrator
            .deferred()
            .deadline(DeferredAction::ThermalForceShutdown),
        Some(pulse_end + Duration::from_secs(2))
    );
    assert_eq!(
        orchestrator
            .deferred()
            .deadline(DeferredAction::ThermalFanOverride),
        Some(pulse_end + Duration::from_millis(2_100))
    );

    // The AP ignores the request; the forced shutdown follows.
    board.advance(Duration::from_secs(2));
    assert!(block_on(orchestrator.poll_deferred(&mut board)));
    assert_eq!(
        orchestrator.power().last_shutdown_reason(),
        Some(ShutdownReason::Thermal)
    );
    step_until(&mut orchestrator, &mut board, PowerState::G3);

    // Fans keep cooling at the fixed duty with their rail re-enabled.
    board.advance(Duration::from_millis(100));
    assert!(block_on(orchestrator.poll_deferred(&mut board)));
    assert!(board.level(signals::FAN_EN));
    assert_eq!(board.duty[..reference::FAN_COUNT], [40, 40]);
    let snapshot = orchestrator.fans().status(FanId(1)).expect("fan 1");
    assert_eq!(snapshot.mode, FanMode::Manual);
    assert!(snapshot.enabled);

    // Still hot: no second shutdown and the override holds.
    board.advance(Duration::from_secs(1));
    let tick = block_on(orchestrator.tick_second(&mut board));
    assert_eq!(tick.critical, None);
    assert_eq!(tick.recovery, None);
    assert_eq!(board.duty[0], 40);
    assert_eq!(board.button_presses, 1);
}

#[test]
fn early_ap_shutdown_pulls_the_fan_override_forward() {
    let tach = [TachCapture::new(), TachCapture::new()];
    let mut board = BenchBoard::reference();
    let mut orchestrator = running(&tach, &mut board);

    board.set_celsius(AP_SENSOR, 90);
    block_on(orchestrator.tick_second(&mut board));

    // The AP honours the button press well before the forced shutdown.
    board.advance(Duration::from_millis(500));
    orchestrator.force_shutdown(ShutdownReason::Host, board.now());
    step_until(&mut orchestrator, &mut board, PowerState::G3);

    let reached = board.now();
    let deferred = orchestrator.deferred();
    assert_eq!(
        deferred.deadline(DeferredAction::ThermalForceShutdown),
        Some(reached)
    );
    assert_eq!(
        deferred.deadline(DeferredAction::ThermalFanOverride),
        Some(reached + Duration::from_millis(100))
    );

    board.advance(Duration::from_millis(100));
    assert!(block_on(orchestrator.poll_deferred(&mut board)));
    assert!(!orchestrator.deferred().is_pending(DeferredAction::ThermalFanOverride));
    assert!(board.level(signals::FAN_EN));
    assert_eq!(board.duty[..reference::FAN_COUNT], [40, 40]);
}

#[test]
fn critical_demand_drives_fans_to_full_speed() {
    let tach = [TachCapture::new(), TachCapture::new()];
    let mut board = BenchBoard::reference();
    let mut orchestrator = running(&tach, &mut board);

    board.set_celsius(AP_SENSOR, 86);
    let tick = block_on(orchestrator.tick_second(&mut board));

    assert_eq!(tick.critical, Some(0));
    assert_eq!(tick.demand, Some(100));
    let fan = orchestrator.fans().status(FanId(0)).expect("fan 0");
    assert_eq!(fan.target_rpm, ControllerConfig::new().fan_limits.max_rpm);
}

#[test]
fn cooled_system_restarts_the_ap_after_a_thermal_shutdown() {
    let tach = [TachCapture::new(), TachCapture::new()];
    let mut board = BenchBoard::reference();
    let mut orchestrator = running(&tach, &mut board);

    board.set_celsius(AP_SENSOR, 95);
    block_on(orchestrator.tick_second(&mut board));
    board.advance(Duration::from_secs(3));
    block_on(orchestrator.poll_deferred(&mut board));
    step_until(&mut orchestrator, &mut board, PowerState::G3);

    board.set_celsius(AP_SENSOR, 79);
    board.advance(Duration::from_secs(1));
    let tick = block_on(orchestrator.tick_second(&mut board));
    assert_eq!(tick.recovery, Some(ThermalRecovery::RestartAp));
    assert!(!orchestrator.thermal().in_thermal_shutdown());
    assert!(
        orchestrator
            .telemetry()
            .contains(TelemetryEventKind::ThermalRecovered)
    );
    let fan = orchestrator.fans().status(FanId(0)).expect("fan 0");
    assert_eq!(fan.mode, FanMode::Rpm);

    step_until(&mut orchestrator, &mut board, PowerState::S0);
    assert_eq!(board.button_presses, 1);
}

#[test]
fn warm_zone_raises_demand_without_shutdown() {
    let tach = [TachCapture::new(), TachCapture::new()];
    let mut board = BenchBoard::reference();
    let mut orchestrator = running(&tach, &mut board);

    board.set_celsius(AP_SENSOR, 81);
    let tick = block_on(orchestrator.tick_second(&mut board));

    assert_eq!(tick.critical, None);
    assert_eq!(tick.demand, Some(100));
    assert!(orchestrator.thermal().zones()[0].is_tending_to_critical());
    assert!(
        orchestrator
            .telemetry()
            .contains(TelemetryEventKind::ThermalWarning(0))
    );
    assert_eq!(board.button_presses, 0);
    assert_eq!(orchestrator.power_state(), PowerState::S0);
}
