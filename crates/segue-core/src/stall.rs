//! Stall detection for ad creatives
//!
//! One inspection runs a bounded time after creative load. It looks for two
//! conditions: an empty buffer, or media that is buffered but whose play head
//! never advanced.

use crate::{
    config::{AdConfig, StallHandling},
    error::VastErrorCode,
    events::SkipReason,
    types::BufferRange,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// Play-head movement below this is treated as no movement
const ADVANCE_EPSILON: f64 = 0.1;

/// Observed stall condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StallKind {
    /// Nothing buffered
    NoBuffer,
    /// Buffered, but the play head has not moved
    PlayheadStuck,
}

impl StallKind {
    pub fn skip_reason(&self) -> SkipReason {
        match self {
            StallKind::NoBuffer => SkipReason::StallNoBuffer,
            StallKind::PlayheadStuck => SkipReason::StallPlayheadStuck,
        }
    }

    pub fn vast_code(&self) -> VastErrorCode {
        match self {
            StallKind::NoBuffer => VastErrorCode::MediaTimeout,
            StallKind::PlayheadStuck => VastErrorCode::DisplayProblem,
        }
    }
}

/// What to do about a stall
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallDecision {
    /// Reload the same creative; carries the retry number (1-based)
    Retry(u32),
    Skip,
}

/// Creative state at inspection time
#[derive(Debug, Clone, PartialEq)]
pub struct StallSnapshot {
    pub buffered: BufferRange,
    /// Position when the creative was loaded
    pub start_position: f64,
    pub position: f64,
    /// Playback has been reported as started
    pub started: bool,
}

/// Applies the configured stall policy
#[derive(Debug, Clone)]
pub struct StallManager {
    handling: StallHandling,
    max_retries: u32,
    timeout: Duration,
}

impl StallManager {
    pub fn new(handling: StallHandling, max_retries: u32, timeout: Duration) -> Self {
        Self {
            handling,
            max_retries,
            timeout,
        }
    }

    pub fn from_config(config: &AdConfig) -> Self {
        Self::new(config.stall_handling, config.max_stall_retries, config.stall_timeout())
    }

    /// Delay between creative load and inspection
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn inspect(&self, snapshot: &StallSnapshot) -> Option<StallKind> {
        if snapshot.buffered.is_empty() {
            return Some(StallKind::NoBuffer);
        }
        let advanced = snapshot.position - snapshot.start_position > ADVANCE_EPSILON;
        if advanced {
            return None;
        }
        if !snapshot.started {
            info!("Creative loaded but never started");
        }
        Some(StallKind::PlayheadStuck)
    }

    /// Decide given the retries already spent on this creative
    pub fn decide(&self, kind: StallKind, retries_so_far: u32) -> StallDecision {
        match self.handling {
            StallHandling::Retry if retries_so_far < self.max_retries => {
                StallDecision::Retry(retries_so_far + 1)
            }
            StallHandling::Retry => {
                warn!(?kind, retries_so_far, "Stall retries exhausted, skipping");
                StallDecision::Skip
            }
            StallHandling::Skip => StallDecision::Skip,
        }
    }
}
