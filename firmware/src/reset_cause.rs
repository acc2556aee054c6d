//! Controller reset cause as latched in `RCC_CSR`.

#![cfg_attr(not(target_os = "none"), allow(dead_code))]

use ec_core::power::ResetFlags;

/// Clears every latched reset flag when written.
const RMVF: u32 = 1 << 23;
const SFTRSTF: u32 = 1 << 28;
const IWDGRSTF: u32 = 1 << 29;
const WWDGRSTF: u32 = 1 << 30;

/// Maps the latched `RCC_CSR` bits onto the flags the power machine boots
/// from. Pin, brown-out and power-on resets map to a cold boot.
pub fn decode(csr: u32) -> ResetFlags {
    ResetFlags {
        soft: csr & SFTRSTF != 0,
        watchdog: csr & (IWDGRSTF | WWDGRSTF) != 0,
        ..ResetFlags::default()
    }
}

/// Reads the cause of the last controller reset and clears the latch so the
/// next boot starts fresh.
#[cfg(target_os = "none")]
pub fn take() -> ResetFlags {
    use embassy_stm32::pac;

    let flags = decode(pac::RCC.csr().read().0);
    pac::RCC.csr().modify(|w| w.0 |= RMVF);
    flags
}
