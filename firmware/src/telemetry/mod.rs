//! Console mirroring for the status surface and chipset notifications.
//!
//! Lines go to defmt on the MCU and to stdout on the host so the same
//! formatting is exercised by the unit tests.

#![cfg_attr(not(target_os = "none"), allow(dead_code))]

use core::fmt::Write as _;

use ec_core::hal::ChipsetEvent;
use ec_core::status::{StatusFormatter, StatusSnapshot};
use heapless::String;

/// Room for the power, supply and thermal lines plus a few zones and fans.
pub const STATUS_TEXT_CAPACITY: usize = 768;

/// Renders `snapshot` into a fixed buffer.
///
/// Returns `false` when the text did not fit; whatever was written is kept.
pub fn render_status(snapshot: &StatusSnapshot, text: &mut String<STATUS_TEXT_CAPACITY>) -> bool {
    StatusFormatter::new(snapshot).write_all(text).is_ok()
}

/// Logs every status line.
pub fn log_status(snapshot: &StatusSnapshot) {
    let mut text = String::new();
    let complete = render_status(snapshot, &mut text);
    for line in text.lines() {
        emit_line(line);
    }
    if !complete {
        emit_line("status truncated");
    }
}

pub fn log_chipset_event(event: ChipsetEvent) {
    let mut line: String<32> = String::new();
    if write!(line, "chipset {}", chipset_label(event)).is_ok() {
        emit_line(&line);
    }
}

#[cfg(target_os = "none")]
fn emit_line(line: &str) {
    defmt::info!("{=str}", line);
}

#[cfg(not(target_os = "none"))]
fn emit_line(line: &str) {
    println!("{line}");
}

const fn chipset_label(event: ChipsetEvent) -> &'static str {
    match event {
        ChipsetEvent::PreInit => "pre-init",
        ChipsetEvent::Startup => "startup",
        ChipsetEvent::Resume => "resume",
        ChipsetEvent::Suspend => "suspend",
        ChipsetEvent::Shutdown => "shutdown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ec_core::power::PowerState;

    #[test]
    fn renders_the_power_line_first() {
        let snapshot = StatusSnapshot::new(PowerState::G3);
        let mut text = String::new();

        assert!(render_status(&snapshot, &mut text));
        let first = text.lines().next().unwrap();
        assert!(first.starts_with("power state=G3"), "{first}");
    }

    #[test]
    fn chipset_labels_are_short_enough_for_the_line_buffer() {
        for event in [
            ChipsetEvent::PreInit,
            ChipsetEvent::Startup,
            ChipsetEvent::Resume,
            ChipsetEvent::Suspend,
            ChipsetEvent::Shutdown,
        ] {
            assert!(chipset_label(event).len() + "chipset ".len() <= 32);
        }
    }
}
