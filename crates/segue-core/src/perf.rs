//! Startup performance timeline
//!
//! Correlates backend lifecycle events (media element events, native bridge
//! events, ad break boundaries) into one startup timeline, reported once per
//! session and once more per retry.

use crate::{ad::NativeEvent, host::MediaEvent, types::StartLoadType};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Point on the startup path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Milestone {
    Setup,
    AdPodFetchStart,
    AdPodFetchEnd,
    AdBreakStart,
    AdBreakEnd,
    ContentLoadStart,
    LoadedMetadata,
    CanPlay,
    FirstFrame,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineMark {
    pub milestone: Milestone,
    /// Milliseconds since setup
    pub at_ms: f64,
}

/// Startup latency breakdown for one attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartupTimeline {
    pub load_type: StartLoadType,
    /// 1 for the first attempt, incremented per retry
    pub attempt: u32,
    /// Milestones in the order they were reached
    pub marks: Vec<TimelineMark>,
    /// Setup to first frame
    pub total_ms: f64,
    /// Time spent in ad breaks before first frame
    pub ad_ms: f64,
    /// `total_ms` minus `ad_ms`
    pub content_ms: f64,
}

impl StartupTimeline {
    pub fn mark(&self, milestone: Milestone) -> Option<f64> {
        self.marks
            .iter()
            .find(|m| m.milestone == milestone)
            .map(|m| m.at_ms)
    }
}

/// Collects milestones for the current attempt
#[derive(Debug)]
pub struct PerformanceCollector {
    origin: Instant,
    load_type: StartLoadType,
    attempt: u32,
    marks: Vec<(Milestone, Duration)>,
    ad_break_started: Option<Instant>,
    ad_time: Duration,
    reported: bool,
}

impl Default for PerformanceCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceCollector {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            load_type: StartLoadType::Initial,
            attempt: 0,
            marks: Vec::new(),
            ad_break_started: None,
            ad_time: Duration::ZERO,
            reported: false,
        }
    }

    /// Begin a new attempt; the previous one is discarded
    pub fn start(&mut self, load_type: StartLoadType) {
        self.origin = Instant::now();
        self.load_type = load_type;
        self.attempt += 1;
        self.marks.clear();
        self.ad_break_started = None;
        self.ad_time = Duration::ZERO;
        self.reported = false;
        self.mark(Milestone::Setup);
    }

    pub fn is_reported(&self) -> bool {
        self.reported
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record a milestone; only the first occurrence per attempt counts
    pub fn mark(&mut self, milestone: Milestone) -> bool {
        if self.reported || self.attempt == 0 || self.marks.iter().any(|(m, _)| *m == milestone) {
            return false;
        }
        let at = self.origin.elapsed();
        debug!(?milestone, at_ms = at.as_millis() as u64, "Startup milestone");
        self.marks.push((milestone, at));

        match milestone {
            Milestone::AdBreakStart => self.ad_break_started = Some(Instant::now()),
            Milestone::AdBreakEnd => {
                if let Some(started) = self.ad_break_started.take() {
                    self.ad_time += started.elapsed();
                }
            }
            _ => {}
        }
        true
    }

    /// Map a media element event onto the timeline
    pub fn observe_media(&mut self, event: &MediaEvent) {
        match event {
            MediaEvent::LoadedMetadata { .. } => {
                self.mark(Milestone::LoadedMetadata);
            }
            MediaEvent::CanPlay => {
                self.mark(Milestone::CanPlay);
            }
            MediaEvent::Playing => {
                self.mark(Milestone::FirstFrame);
            }
            _ => {}
        }
    }

    /// Map a native bridge event onto the timeline
    pub fn observe_native(&mut self, event: &NativeEvent) {
        match event {
            NativeEvent::CanPlay => {
                self.mark(Milestone::CanPlay);
            }
            NativeEvent::Playing => {
                self.mark(Milestone::FirstFrame);
            }
            _ => {}
        }
    }

    /// Build the timeline once first frame is reached; `None` if already
    /// reported for this attempt or not yet complete
    pub fn finish(&mut self) -> Option<StartupTimeline> {
        if self.reported {
            return None;
        }
        let (_, first_frame) = self
            .marks
            .iter()
            .find(|(m, _)| *m == Milestone::FirstFrame)?;
        let total_ms = first_frame.as_secs_f64() * 1000.0;
        let ad_ms = self.ad_time.as_secs_f64() * 1000.0;
        self.reported = true;

        let timeline = StartupTimeline {
            load_type: self.load_type,
            attempt: self.attempt,
            marks: self
                .marks
                .iter()
                .map(|(milestone, at)| TimelineMark {
                    milestone: *milestone,
                    at_ms: at.as_secs_f64() * 1000.0,
                })
                .collect(),
            total_ms,
            ad_ms,
            content_ms: (total_ms - ad_ms).max(0.0),
        };
        info!(
            attempt = timeline.attempt,
            total_ms = timeline.total_ms,
            ad_ms = timeline.ad_ms,
            "Startup timeline"
        );
        Some(timeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_reports_once_per_attempt() {
        let mut perf = PerformanceCollector::new();
        perf.start(StartLoadType::Initial);
        tokio::time::sleep(Duration::from_millis(200)).await;
        perf.observe_media(&MediaEvent::CanPlay);
        tokio::time::sleep(Duration::from_millis(100)).await;
        perf.observe_media(&MediaEvent::Playing);

        let timeline = perf.finish().unwrap();
        assert_eq!(timeline.attempt, 1);
        assert!((timeline.total_ms - 300.0).abs() < 1.0);
        assert!((timeline.mark(Milestone::CanPlay).unwrap() - 200.0).abs() < 1.0);
        assert!(perf.finish().is_none());

        perf.start(StartLoadType::Retry);
        perf.observe_media(&MediaEvent::Playing);
        let retry = perf.finish().unwrap();
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.load_type, StartLoadType::Retry);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ad_time_excluded() {
        let mut perf = PerformanceCollector::new();
        perf.start(StartLoadType::Initial);
        perf.mark(Milestone::AdBreakStart);
        tokio::time::sleep(Duration::from_secs(15)).await;
        perf.mark(Milestone::AdBreakEnd);
        tokio::time::sleep(Duration::from_millis(500)).await;
        perf.observe_native(&NativeEvent::Playing);

        let timeline = perf.finish().unwrap();
        assert!((timeline.ad_ms - 15_000.0).abs() < 1.0);
        assert!((timeline.content_ms - 500.0).abs() < 1.0);
    }

    #[test]
    fn test_marks_ignored_before_start() {
        let mut perf = PerformanceCollector::new();
        assert!(!perf.mark(Milestone::CanPlay));
        assert!(perf.finish().is_none());
    }
}
