//! Board descriptions shared by firmware and host targets.
//!
//! Everything here is plain `const` data plus small builders, so the same
//! tables back the STM32 firmware, the host emulator and the integration
//! tests.

pub mod reference;
