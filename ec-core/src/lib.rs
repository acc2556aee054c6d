#![no_std]

// Power sequencing and thermal control core shared by the controller
// firmware and the host emulator.
//
// This crate stays portable across MCU firmware and host tooling by avoiding
// the Rust standard library. Hardware access goes through the traits in
// `hal`; every state machine here is driven by explicit calls from the
// owning task.

pub mod boards;
pub mod config;
pub mod deferred;
pub mod fan;
pub mod hal;
pub mod orchestrator;
pub mod power;
pub mod status;
pub mod supply;
pub mod telemetry;
pub mod thermal;
pub mod time;

#[cfg(test)]
mod testing;
