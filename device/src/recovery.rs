//! Escalation ladder for the Error state.
//!
//! Cheap restarts come first. The reset counter is bumped at boot on every
//! pin reset, so a counter that keeps climbing means restarts are not
//! getting the node back to a working main loop, and the next step is a
//! reset of the radio stack itself.

use chrono::{DateTime, Duration, Utc};

/// Highest reset count that still earns a plain restart.
pub const SIMPLE_RESTART_LIMIT: u8 = 3;

/// With no acknowledged report for this long the session is treated as lost.
pub const SESSION_LOST_SECS: u64 = 7200;

/// Boot-time reset count at which the node is assumed to be looping.
pub const BOOT_LOOP_THRESHOLD: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    SimpleRestart,
    FullReset,
}

pub fn decide(reset_count: u8, seconds_since_last_success: u64) -> RecoveryAction {
    if reset_count <= SIMPLE_RESTART_LIMIT {
        RecoveryAction::SimpleRestart
    } else if seconds_since_last_success > SESSION_LOST_SECS {
        RecoveryAction::FullReset
    } else {
        // Recent success but restarts still failing: modem-level fault.
        RecoveryAction::FullReset
    }
}

/// Whether the node has dwelt in Error long enough to act.
pub fn settled(entered_at: DateTime<Utc>, now: DateTime<Utc>, settle_secs: u64) -> bool {
    now - entered_at >= Duration::seconds(settle_secs as i64)
}

/// True when the boot sequence must force a full reset before continuing.
pub fn boot_loop_detected(reset_count: u8) -> bool {
    reset_count >= BOOT_LOOP_THRESHOLD
}
