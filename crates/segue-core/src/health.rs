//! Ad playback health scoring
//!
//! Sampled once per interval while the creative is not paused. Each sample
//! combines:
//! - time-update cadence (ticks seen vs. ideal ticks)
//! - play-head advancement vs. wall time
//! - buffer growth
//! - a penalty for frequent pauses
//!
//! The instantaneous score is blended 30/70 with the mean of the last
//! [`HISTORY_LEN`] samples.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, warn};

pub const HISTORY_LEN: usize = 10;

/// Time-update events expected per second of playback
const IDEAL_TICKS_PER_SEC: f64 = 4.0;
const WEIGHT_TIME_UPDATE: f64 = 0.35;
const WEIGHT_CURRENT_TIME: f64 = 0.5;
const WEIGHT_BUFFER_GROWTH: f64 = 0.15;
const PAUSE_PENALTY: f64 = 0.1;
const PAUSE_ALLOWANCE: u32 = 3;
/// Buffered end this close to the media end counts as fully grown
const BUFFER_COMPLETE_SLACK: f64 = 1.0;

/// One scored interval
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthSample {
    pub time_update: f64,
    pub current_time: f64,
    pub buffer_growth: f64,
    pub pause_penalty: f64,
    /// Weighted score of this interval alone
    pub instant: f64,
    /// Score blended with history; compared against the threshold
    pub blended: f64,
}

/// Playback observation at sampling time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackProbe {
    pub position: f64,
    pub buffered_end: f64,
    pub duration: Option<f64>,
}

/// Outcome of a sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthVerdict {
    pub sample: HealthSample,
    /// True exactly once per drop below the threshold
    pub report_low: bool,
}

/// Rolling health scorer for one creative
#[derive(Debug)]
pub struct HealthChecker {
    threshold: f64,
    interval: Duration,
    history: VecDeque<f64>,
    samples: usize,
    ticks: u32,
    pauses: u32,
    last_position: f64,
    last_buffered_end: f64,
    low_reported: bool,
}

impl HealthChecker {
    pub fn new(threshold: f64, interval: Duration) -> Self {
        Self {
            threshold,
            interval,
            history: VecDeque::with_capacity(HISTORY_LEN),
            samples: 0,
            ticks: 0,
            pauses: 0,
            last_position: 0.0,
            last_buffered_end: 0.0,
            low_reported: false,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Count a time-update event
    pub fn record_tick(&mut self) {
        self.ticks += 1;
    }

    pub fn record_pause(&mut self) {
        self.pauses += 1;
    }

    /// Restart the current interval from `probe`, e.g. after a pause
    pub fn rebase(&mut self, probe: PlaybackProbe) {
        self.ticks = 0;
        self.last_position = probe.position;
        self.last_buffered_end = probe.buffered_end;
    }

    pub fn samples_taken(&self) -> usize {
        self.samples
    }

    fn ideal_ticks(&self) -> f64 {
        (IDEAL_TICKS_PER_SEC * self.interval.as_secs_f64()).max(1.0)
    }

    /// Score raw sub-scores into a sample and update history
    pub fn score(&mut self, time_update: f64, current_time: f64, buffer_growth: f64) -> HealthVerdict {
        let pause_penalty = PAUSE_PENALTY * f64::from(self.pauses.saturating_sub(PAUSE_ALLOWANCE));
        let instant = (WEIGHT_TIME_UPDATE * time_update
            + WEIGHT_CURRENT_TIME * current_time
            + WEIGHT_BUFFER_GROWTH * buffer_growth
            - pause_penalty)
            .clamp(0.0, 1.0);

        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(instant);
        let average = self.history.iter().sum::<f64>() / self.history.len() as f64;
        let blended = 0.3 * average + 0.7 * instant;
        self.samples += 1;

        let sample = HealthSample {
            time_update,
            current_time,
            buffer_growth,
            pause_penalty,
            instant,
            blended,
        };

        let low = blended < self.threshold
            && time_update < self.threshold
            && current_time < self.threshold;
        // First sample is biased by first-frame latency
        let eligible = self.samples > 1;
        let report_low = low && eligible && !self.low_reported;
        if report_low {
            self.low_reported = true;
            warn!(blended, time_update, current_time, "Ad health score low");
        } else if !low {
            self.low_reported = false;
        }
        debug!(
            sample = self.samples,
            instant, blended, time_update, current_time, buffer_growth, "Health sample"
        );

        HealthVerdict { sample, report_low }
    }

    /// Sample the interval that just ended
    pub fn sample(&mut self, probe: PlaybackProbe) -> HealthVerdict {
        let interval = self.interval.as_secs_f64();

        let time_update = (f64::from(self.ticks) / self.ideal_ticks()).min(1.0);

        let expected = self.last_position + interval;
        let current_time = (1.0 - (expected - probe.position) / interval).clamp(0.0, 1.0);

        let buffer_growth = match probe.duration {
            Some(duration) if duration - probe.buffered_end <= BUFFER_COMPLETE_SLACK => 1.0,
            _ => ((probe.buffered_end - self.last_buffered_end).max(0.0) / interval).min(1.0),
        };

        self.rebase(probe);
        self.score(time_update, current_time, buffer_growth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker() -> HealthChecker {
        HealthChecker::new(0.6, Duration::from_secs(5))
    }

    #[test]
    fn test_healthy_playback_scores_high() {
        let mut health = checker();
        for _ in 0..20 {
            health.record_tick();
        }
        let verdict = health.sample(PlaybackProbe {
            position: 5.0,
            buffered_end: 30.0,
            duration: Some(30.0),
        });
        assert!((verdict.sample.instant - 1.0).abs() < 1e-9);
        assert!(!verdict.report_low);
    }

    #[test]
    fn test_low_reported_once_until_recovery() {
        let mut health = checker();
        // First sample never triggers
        let first = health.score(0.0, 0.1, 1.0);
        assert!(!first.report_low);

        let second = health.score(0.0, 0.1, 1.0);
        let third = health.score(0.0, 0.1, 1.0);
        assert!(second.sample.blended < 0.6);
        assert!(second.report_low);
        assert!(!third.report_low);

        for _ in 0..HISTORY_LEN {
            health.score(1.0, 1.0, 1.0);
        }
        let dropped = health.score(0.0, 0.1, 1.0);
        assert!(dropped.report_low);
    }

    #[test]
    fn test_low_requires_both_sub_scores() {
        let mut health = checker();
        health.score(1.0, 1.0, 1.0);
        // Ticks arrive but play head is stuck: blended low, cadence fine
        let verdict = health.score(1.0, 0.0, 0.0);
        assert!(!verdict.report_low);
    }

    #[test]
    fn test_stuck_play_head() {
        let mut health = checker();
        let verdict = health.sample(PlaybackProbe {
            position: 0.0,
            buffered_end: 0.0,
            duration: Some(30.0),
        });
        assert_eq!(verdict.sample.time_update, 0.0);
        assert_eq!(verdict.sample.current_time, 0.0);
        assert_eq!(verdict.sample.buffer_growth, 0.0);
    }

    #[test]
    fn test_pause_penalty() {
        let mut health = checker();
        for _ in 0..5 {
            health.record_pause();
        }
        let verdict = health.score(1.0, 1.0, 1.0);
        assert!((verdict.sample.pause_penalty - 0.2).abs() < 1e-9);
        assert!((verdict.sample.instant - 0.8).abs() < 1e-9);
    }
}
