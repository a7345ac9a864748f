//! Duty-cycle controller for a battery-powered field sensor node.
//!
//! The node wakes, measures, reports over an unreliable link, waits for the
//! collector's acknowledgment and goes back to sleep, keeping its reset and
//! report bookkeeping in a small non-volatile record.

pub mod clock;
pub mod commands;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod errors;
pub mod net;
pub mod node;
pub mod records;
pub mod recovery;
pub mod reporter;
pub mod simulate;
pub mod sleep;
pub mod storage;
pub mod types;

#[cfg(test)]
mod testing;
