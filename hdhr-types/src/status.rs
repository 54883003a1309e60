//! Tuner status snapshots and CableCard readiness.

use serde::{Deserialize, Serialize};

use crate::programs::ProgramsList;

/// Snapshot of the tuner front-end state, produced by each poll cycle.
///
/// Snapshots are compared structurally: observers are notified only when
/// a snapshot differs from its predecessor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunerStatus {
    /// Channel descriptor (`modulation:number`, or `none` when untuned).
    pub channel: String,
    /// Modulation lock string (`8vsb`, `qam256`, or `none`).
    pub lock: String,
    /// Whether any signal is present on the tuned frequency.
    pub signal_present: bool,
    /// Signal strength, percent.
    pub signal_strength: u32,
    /// Signal-to-noise quality, percent.
    pub signal_to_noise_quality: u32,
    /// Symbol error quality, percent.
    pub symbol_error_quality: u32,
    /// Raw status code the driver returned for the refresh call.
    pub return_status: i32,
}

impl TunerStatus {
    /// True when the tuner has achieved a modulation lock.
    pub fn is_locked(&self) -> bool {
        self.lock != "none" && !self.lock.is_empty()
    }
}

impl Default for TunerStatus {
    fn default() -> Self {
        Self {
            channel: "none".to_string(),
            lock: "none".to_string(),
            signal_present: false,
            signal_strength: 0,
            signal_to_noise_quality: 0,
            symbol_error_quality: 0,
            return_status: 0,
        }
    }
}

/// Channel, program, and program list read together in one poll cycle
/// while the lease is held.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentChannelAndProgram {
    /// Channel descriptor at the time of the read.
    pub channel: String,
    /// Currently selected program number, zero when none.
    pub program_number: u32,
    /// Programs present in the tuned stream.
    pub programs: ProgramsList,
}

/// CableCard card state: readiness string.
pub const CARD_READY: &str = "ready";

/// CableCard auth/oob success string.
pub const CARD_SUCCESS: &str = "success";

/// Degraded but acceptable out-of-band signal.
pub const CARD_OOB_WEAK: &str = "weak";

/// CableCard slot status, only meaningful on CableCard devices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CableCardStatus {
    /// Card readiness (`ready` when inserted and initialized).
    pub card: String,
    /// Card authentication result.
    pub auth: String,
    /// Out-of-band channel result.
    pub oob: String,
}

impl CableCardStatus {
    /// True when the card is ready, authenticated, and has a usable
    /// out-of-band channel — the precondition for lineup-driven scans
    /// and virtual tuning.
    pub fn is_operational(&self) -> bool {
        self.card == CARD_READY
            && self.auth == CARD_SUCCESS
            && (self.oob == CARD_SUCCESS || self.oob == CARD_OOB_WEAK)
    }
}
