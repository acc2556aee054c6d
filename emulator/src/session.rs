use std::fmt::Write as _;
use std::time::Duration;

use ec_core::boards::reference;
use ec_core::config::ControllerConfig;
use ec_core::fan::{FanMode, TachCapture};
use ec_core::hal::{Clock, EmptyConfigStore, FanId, SensorId, SignalId};
use ec_core::orchestrator::Orchestrator;
use ec_core::power::{PowerState, ResetFlags};
use ec_core::status::StatusFormatter;
use ec_core::supply::{Feedback, SupplyError};
use ec_core::telemetry::EventId;
use ec_core::time::Instant;
use embassy_futures::block_on;

use crate::sim::SimBoard;

const TICK: Duration = Duration::from_secs(1);
/// Simulated time a button is held by `power` and `reset`.
const BUTTON_TAP: Duration = Duration::from_millis(100);
/// Time advanced when the power task makes no progress on its own.
const IDLE_STEP: Duration = Duration::from_millis(1);

pub const HELP_TOPICS: &[(&str, &str)] = &[
    ("power", "power [hold <seconds>]        - tap or hold the power button"),
    ("reset", "reset                         - tap the reset button"),
    ("watchdog", "watchdog                      - expire the AP watchdog"),
    ("temp", "temp <sensor> <celsius|none>   - set or remove a sensor reading"),
    ("fault", "fault <rail> | clear <rail>    - pull a rail's feedback low or release it"),
    ("fan", "fan <n> rpm <rpm> | fan <n> auto - pin a fan speed or return it to thermal control"),
    ("run", "run <seconds> | run <n>ms      - advance simulated time"),
    ("status", "status                        - display power, thermal and fan state"),
    ("supplies", "supplies                      - dependency-ordered rail report"),
    ("log", "log                           - telemetry recorded since the last `log`"),
    ("help", "help [topic]                  - show help for a command"),
];

/// One emulated controller and its board.
pub struct Session {
    board: SimBoard,
    orchestrator: Orchestrator<'static>,
    tach: &'static [TachCapture],
    next_tick: Instant,
    next_log_id: EventId,
}

impl Session {
    /// Boots the reference board with built-in configuration.
    pub fn reference() -> Result<Self, SupplyError> {
        let tach: &'static [TachCapture] = Box::leak(Box::new(
            [TachCapture::new(), TachCapture::new()],
        ));
        let mut board = SimBoard::reference();
        let mut orchestrator = Orchestrator::new(reference::layout()?, tach, ControllerConfig::new());
        orchestrator.init(&mut board, &EmptyConfigStore, ResetFlags::default());
        let next_tick = board.now() + TICK;
        Ok(Self {
            board,
            orchestrator,
            tach,
            next_tick,
            next_log_id: 0,
        })
    }

    pub fn power_state(&self) -> PowerState {
        self.orchestrator.power_state()
    }

    pub fn handle_command(&mut self, line: &str) -> Vec<String> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let mut output = match words.as_slice() {
            ["help"] => vec![help_topic_list()],
            ["help", topic] => vec![help_for(topic)],
            ["power"] => self.tap_power(BUTTON_TAP),
            ["power", "hold", seconds] => match parse_duration(seconds) {
                Ok(hold) => self.tap_power(hold),
                Err(err) => vec![err],
            },
            ["reset"] => self.tap_reset(),
            ["watchdog"] => {
                let now = self.board.now();
                self.orchestrator.watchdog_expired(now);
                self.run_for(BUTTON_TAP);
                vec!["watchdog expired".to_string()]
            }
            ["temp", sensor, value] => self.set_temperature(sensor, value),
            ["fault", rail] => self.inject_fault(rail, true),
            ["clear", rail] => self.inject_fault(rail, false),
            ["fan", fan, "rpm", rpm] => self.pin_fan(fan, Some(rpm)),
            ["fan", fan, "auto"] => self.pin_fan(fan, None),
            ["run", amount] => match parse_duration(amount) {
                Ok(duration) => {
                    self.run_for(duration);
                    vec![format!("t={} state={}", self.board.now(), self.power_state())]
                }
                Err(err) => vec![err],
            },
            ["status"] => self.status_lines(),
            ["supplies"] => self.supply_report(),
            ["log"] => Vec::new(),
            _ => vec![format!("unknown command `{line}`; try `help`")],
        };
        output.extend(self.drain_log());
        output
    }

    /// Runs the control loop until `duration` of simulated time has passed.
    pub fn run_for(&mut self, duration: Duration) {
        let end = self.board.now() + duration;
        loop {
            let before = self.board.now();
            block_on(self.orchestrator.poll_deferred(&mut self.board));
            block_on(self.orchestrator.step_power(&mut self.board));
            let now = self.board.now();
            if now >= end {
                break;
            }
            if !self.orchestrator.is_power_steady() {
                if now == before {
                    self.board.advance_to(now + IDLE_STEP);
                }
                continue;
            }

            let mut wake = self.next_tick.min(end);
            if let Some(deadline) = self.orchestrator.next_deadline() {
                wake = wake.min(deadline.max(now));
            }
            self.board.advance_to(wake);
            if self.board.now() >= self.next_tick {
                self.board.spin_fans(self.tach);
                block_on(self.orchestrator.tick_second(&mut self.board));
                self.next_tick = self.next_tick + TICK;
            }
            if wake == end && self.board.now() >= end {
                break;
            }
        }
    }

    fn tap_power(&mut self, hold: Duration) -> Vec<String> {
        let now = self.board.now();
        self.orchestrator.power_button_changed(true, now);
        self.run_for(hold);
        let now = self.board.now();
        self.orchestrator.power_button_changed(false, now);
        self.run_for(IDLE_STEP);
        vec![format!("power button released, state={}", self.power_state())]
    }

    fn tap_reset(&mut self) -> Vec<String> {
        let now = self.board.now();
        self.orchestrator.reset_button_changed(true, now);
        self.run_for(BUTTON_TAP);
        let now = self.board.now();
        self.orchestrator.reset_button_changed(false, now);
        vec![format!(
            "reset button released, ap-reset={}",
            if self.board.ap_reset() { "asserted" } else { "released" }
        )]
    }

    fn set_temperature(&mut self, sensor: &str, value: &str) -> Vec<String> {
        let Ok(sensor) = sensor.parse::<u8>() else {
            return vec![format!("invalid sensor `{sensor}`")];
        };
        let celsius = if value.eq_ignore_ascii_case("none") {
            None
        } else {
            match value.parse::<i16>() {
                Ok(celsius) => Some(celsius),
                Err(_) => return vec![format!("invalid temperature `{value}`")],
            }
        };
        if self.board.set_celsius(SensorId(sensor), celsius) {
            vec![format!("sensor {sensor} set")]
        } else {
            vec![format!("no sensor {sensor}")]
        }
    }

    fn inject_fault(&mut self, rail: &str, faulted: bool) -> Vec<String> {
        let supplies = self.orchestrator.supplies();
        let Some(id) = supplies.lookup(rail) else {
            return vec![format!("unknown rail `{rail}`")];
        };
        let Some(supply) = supplies.table().get(id.index()) else {
            return vec![format!("unknown rail `{rail}`")];
        };
        let line: SignalId = match supply.feedback {
            Feedback::PowerGood(signal) => signal,
            Feedback::Analog { .. } => supply.enable.signal,
            Feedback::None => return vec![format!("{rail} has no feedback to fault")],
        };
        if faulted {
            self.board.stick_low(line);
        } else {
            self.board.release(line);
        }
        self.orchestrator.supply_feedback_changed();
        self.run_for(IDLE_STEP);
        vec![format!(
            "{rail} feedback {}, state={}",
            if faulted { "pulled low" } else { "released" },
            self.power_state()
        )]
    }

    fn pin_fan(&mut self, fan: &str, rpm: Option<&str>) -> Vec<String> {
        let Ok(index) = fan.parse::<u8>() else {
            return vec![format!("invalid fan `{fan}`")];
        };
        let fan = FanId(index);
        let fans = self.orchestrator.fans_mut();
        if fans.status(fan).is_none() {
            return vec![format!("no {fan}")];
        }
        match rpm {
            Some(rpm) => {
                let Ok(rpm) = rpm.parse::<u32>() else {
                    return vec![format!("invalid rpm `{rpm}`")];
                };
                fans.set_thermal_control(fan, false);
                fans.set_mode(fan, FanMode::Rpm);
                fans.set_rpm_target(fan, rpm);
                let target = fans.status(fan).map_or(0, |status| status.target_rpm);
                vec![format!("{fan} pinned at {target} rpm")]
            }
            None => {
                fans.set_thermal_control(fan, true);
                vec![format!("{fan} follows thermal demand")]
            }
        }
    }

    fn status_lines(&mut self) -> Vec<String> {
        let snapshot = self.orchestrator.snapshot(&mut self.board);
        let mut text = String::new();
        let _ = StatusFormatter::new(&snapshot).write_all(&mut text);
        let _ = writeln!(
            text,
            "board t={} ap-reset={} power-button={}",
            self.board.now(),
            yes_no(self.board.ap_reset()),
            yes_no(self.board.power_button())
        );
        text.lines().map(str::to_string).collect()
    }

    fn supply_report(&mut self) -> Vec<String> {
        let mut text = String::new();
        let _ = self
            .orchestrator
            .supplies()
            .write_report(&mut self.board, &mut text);
        text.lines().map(str::to_string).collect()
    }

    /// Telemetry and chipset notifications not shown yet.
    fn drain_log(&mut self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .board
            .notifications
            .drain(..)
            .map(|event| format!("chipset {event:?}"))
            .collect();
        let mut next = self.next_log_id;
        for record in self.orchestrator.telemetry().oldest_first() {
            if record.id >= self.next_log_id {
                lines.push(record.to_string());
                next = record.id + 1;
            }
        }
        self.next_log_id = next;
        lines
    }
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

fn help_topic_list() -> String {
    let mut text = String::from("commands:");
    for (name, _) in HELP_TOPICS {
        text.push(' ');
        text.push_str(name);
    }
    text
}

fn help_for(topic: &str) -> String {
    HELP_TOPICS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(topic))
        .map_or_else(
            || format!("no help for `{topic}`"),
            |(_, text)| (*text).to_string(),
        )
}

/// Accepts whole seconds (`5`) or milliseconds (`250ms`).
fn parse_duration(text: &str) -> Result<Duration, String> {
    if let Some(millis) = text.strip_suffix("ms") {
        return millis
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| format!("invalid duration `{text}`"));
    }
    text.trim_end_matches('s')
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| format!("invalid duration `{text}`"))
}
