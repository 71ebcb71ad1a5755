//! Ad response model and per-pod playback state
//!
//! Ad-decision responses are JSON:
//!
//! ```json
//! {
//!   "items": [{
//!     "id": "creative-1",
//!     "media_url": "https://ads.example/c1/master.m3u8",
//!     "duration": 15.0,
//!     "impressions": ["https://t.example/imp?c=1"],
//!     "tracking": { "tracking_0": ["..."], "tracking_50": ["..."] },
//!     "click_through": "https://brand.example/",
//!     "click_tracking": ["https://t.example/click?c=1"],
//!     "error_beacon": "https://t.example/err?code=[ERRORCODE]",
//!     "icon": { "url": "https://ads.example/icon.png", "width": 64, "height": 64 }
//!   }]
//! }
//! ```

use crate::{
    error::VastErrorCode,
    events::{PodSummary, Quartile, SkipReason},
    Error, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

/// Token replaced with the 3-digit VAST code in error beacons
pub const ERROR_CODE_TOKEN: &str = "[ERRORCODE]";

/// Companion icon shown alongside a creative
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanionIcon {
    pub url: Url,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub click_through: Option<Url>,
}

/// One ad creative as returned by the ad server. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ad {
    pub id: String,
    pub media_url: Url,
    /// Declared duration in seconds
    pub duration: f64,
    #[serde(default)]
    pub impressions: Vec<Url>,
    /// Quartile beacons keyed `tracking_0` .. `tracking_100`
    #[serde(default)]
    pub tracking: BTreeMap<String, Vec<Url>>,
    #[serde(default)]
    pub click_through: Option<Url>,
    #[serde(default)]
    pub click_tracking: Vec<Url>,
    /// URL template containing [`ERROR_CODE_TOKEN`]
    #[serde(default)]
    pub error_beacon: Option<String>,
    #[serde(default)]
    pub icon: Option<CompanionIcon>,
}

impl Ad {
    pub fn tracking_urls(&self, quartile: Quartile) -> &[Url] {
        self.tracking
            .get(quartile.tracking_key())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Error beacon with the code substituted, if the ad carries a template
    pub fn error_beacon_url(&self, code: VastErrorCode) -> Option<Url> {
        let template = self.error_beacon.as_deref()?;
        let expanded = template.replace(ERROR_CODE_TOKEN, &format!("{:03}", code.code()));
        match Url::parse(&expanded) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(ad_id = %self.id, error = %e, "Invalid error beacon template");
                None
            }
        }
    }

    /// Click-through needs both a destination and something to track it with
    pub fn click_enabled(&self) -> bool {
        self.click_through.is_some() && !self.click_tracking.is_empty()
    }

    /// Media is an HLS manifest rather than a progressive file
    pub fn is_hls(&self) -> bool {
        self.media_url.path().to_ascii_lowercase().ends_with(".m3u8")
    }
}

/// Ad-decision response body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdResponse {
    #[serde(default)]
    pub items: Vec<Ad>,
}

impl AdResponse {
    pub fn parse(json: &str) -> Result<Vec<Ad>> {
        let response: AdResponse =
            serde_json::from_str(json).map_err(|e| Error::AdResponse(e.to_string()))?;
        for ad in &response.items {
            if !ad.duration.is_finite() || ad.duration < 0.0 {
                return Err(Error::AdResponse(format!(
                    "ad {} has invalid duration {}",
                    ad.id, ad.duration
                )));
            }
        }
        debug!(count = response.items.len(), "Parsed ad response");
        Ok(response.items)
    }
}

/// Mutable playback bookkeeping for one ad, owned by the ad player
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdPlaybackState {
    pub played: bool,
    pub finished: bool,
    pub failed: Option<SkipReason>,
    pub ad_start_fired: bool,
    pub video_started: bool,
    /// Length of the run of identical skip reasons leading into this ad
    pub consecutive_code_skips: u32,
    /// Skip reason of the previous ad, when it failed
    pub last_skip_reason: Option<SkipReason>,
    pub stall_retry_count: u32,
    pub health_score_retry_count: u32,
    pub pause_duration: Duration,
    pub start_time: Option<Instant>,
}

impl AdPlaybackState {
    pub fn mark_started(&mut self) {
        self.played = true;
        if self.start_time.is_none() {
            self.start_time = Some(Instant::now());
        }
    }

    pub fn mark_finished(&mut self) {
        self.played = true;
        self.finished = true;
    }

    pub fn mark_failed(&mut self, reason: SkipReason) {
        self.failed = Some(reason);
    }

    pub fn is_settled(&self) -> bool {
        self.finished || self.failed.is_some()
    }
}

/// Ordered creatives of one ad break
#[derive(Debug)]
pub struct AdPod {
    entries: Vec<(Ad, AdPlaybackState)>,
    /// 1-based position of the current creative
    sequence: usize,
    remaining_duration: f64,
}

impl AdPod {
    pub fn new(ads: Vec<Ad>) -> Self {
        let remaining_duration = ads.iter().map(|a| a.duration).sum();
        Self {
            entries: ads
                .into_iter()
                .map(|ad| (ad, AdPlaybackState::default()))
                .collect(),
            sequence: 1,
            remaining_duration,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn sequence(&self) -> usize {
        self.sequence
    }

    /// True once the sequence pointer is past the last creative
    pub fn is_done(&self) -> bool {
        self.sequence > self.entries.len()
    }

    /// Declared duration of creatives not yet settled
    pub fn remaining_duration(&self) -> f64 {
        self.remaining_duration
    }

    pub fn current(&self) -> Option<&Ad> {
        self.entries.get(self.sequence.checked_sub(1)?).map(|(ad, _)| ad)
    }

    pub fn current_state_mut(&mut self) -> Option<&mut AdPlaybackState> {
        let index = self.sequence.checked_sub(1)?;
        self.entries.get_mut(index).map(|(_, state)| state)
    }

    pub fn state(&self, index: usize) -> Option<&AdPlaybackState> {
        self.entries.get(index).map(|(_, state)| state)
    }

    pub fn states(&self) -> impl Iterator<Item = &AdPlaybackState> {
        self.entries.iter().map(|(_, state)| state)
    }

    /// Settle the current creative as played to the end and advance
    pub fn complete_current(&mut self) {
        let Some(index) = self.sequence.checked_sub(1) else {
            return;
        };
        if let Some((_, state)) = self.entries.get_mut(index) {
            state.mark_finished();
        }
        if let Some((_, next)) = self.entries.get_mut(index + 1) {
            next.consecutive_code_skips = 0;
            next.last_skip_reason = None;
        }
        self.advance(index);
    }

    /// Settle the current creative as skipped and advance
    pub fn fail_current(&mut self, reason: SkipReason) {
        let Some(index) = self.sequence.checked_sub(1) else {
            return;
        };
        let Some((_, state)) = self.entries.get_mut(index) else {
            return;
        };
        state.mark_failed(reason);
        let carried = if state.last_skip_reason == Some(reason) {
            state.consecutive_code_skips + 1
        } else {
            1
        };
        if let Some((_, next)) = self.entries.get_mut(index + 1) {
            next.consecutive_code_skips = carried;
            next.last_skip_reason = Some(reason);
        }
        self.advance(index);
    }

    /// Settle the current creative as removed and end the pod
    pub fn abandon(&mut self) {
        if let Some(state) = self.current_state_mut() {
            state.mark_failed(SkipReason::Removed);
        }
        self.sequence = self.entries.len() + 1;
    }

    fn advance(&mut self, index: usize) {
        let duration = self.entries.get(index).map(|(ad, _)| ad.duration).unwrap_or(0.0);
        self.remaining_duration = (self.remaining_duration - duration).max(0.0);
        self.sequence += 1;
    }

    pub fn success_count(&self) -> usize {
        self.states().filter(|s| s.finished).count()
    }

    pub fn failure_count(&self) -> usize {
        self.states().filter(|s| s.failed.is_some()).count()
    }

    pub fn summary(&self, total: Duration, paused: Duration) -> PodSummary {
        PodSummary {
            pod_size: self.len(),
            success_count: self.success_count(),
            failure_count: self.failure_count(),
            total_duration: total.as_secs_f64(),
            total_duration_excluding_pause: total.saturating_sub(paused).as_secs_f64(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn ad(id: &str, media: &str, duration: f64) -> Ad {
        Ad {
            id: id.to_string(),
            media_url: Url::parse(media).unwrap(),
            duration,
            impressions: Vec::new(),
            tracking: BTreeMap::new(),
            click_through: None,
            click_tracking: Vec::new(),
            error_beacon: None,
            icon: None,
        }
    }

    fn pod(n: usize) -> AdPod {
        AdPod::new(
            (0..n)
                .map(|i| ad(&format!("ad{i}"), "https://ads.test/a.mp4", 10.0))
                .collect(),
        )
    }

    #[test]
    fn test_parse_response() {
        let json = r#"{"items": [{
            "id": "c1",
            "media_url": "https://ads.test/c1/master.m3u8",
            "duration": 15.0,
            "tracking": {"tracking_50": ["https://t.test/mid"]},
            "click_through": "https://brand.test/",
            "click_tracking": ["https://t.test/click"],
            "error_beacon": "https://t.test/err?code=[ERRORCODE]"
        }]}"#;
        let ads = AdResponse::parse(json).unwrap();
        assert_eq!(ads.len(), 1);
        assert!(ads[0].is_hls());
        assert!(ads[0].click_enabled());
        assert_eq!(ads[0].tracking_urls(Quartile::Midpoint).len(), 1);
        assert!(ads[0].tracking_urls(Quartile::Complete).is_empty());
        assert_eq!(
            ads[0].error_beacon_url(VastErrorCode::MediaTimeout).unwrap().as_str(),
            "https://t.test/err?code=402"
        );
    }

    #[test]
    fn test_empty_and_invalid_responses() {
        assert!(AdResponse::parse("{}").unwrap().is_empty());
        let err = AdResponse::parse(r#"{"items": [{"id": "x"}]}"#).unwrap_err();
        assert!(matches!(err, Error::AdResponse(_)));
    }

    #[test]
    fn test_click_needs_tracking() {
        let mut creative = ad("c", "https://ads.test/a.mp4", 5.0);
        creative.click_through = Some(Url::parse("https://brand.test/").unwrap());
        assert!(!creative.click_enabled());
    }

    #[test]
    fn test_skip_chain() {
        let mut pod = pod(4);
        pod.fail_current(SkipReason::Error);
        assert_eq!(pod.state(1).unwrap().consecutive_code_skips, 1);
        pod.fail_current(SkipReason::Error);
        assert_eq!(pod.state(2).unwrap().consecutive_code_skips, 2);
        pod.fail_current(SkipReason::StallNoBuffer);
        assert_eq!(pod.state(3).unwrap().consecutive_code_skips, 1);
        assert_eq!(pod.state(3).unwrap().last_skip_reason, Some(SkipReason::StallNoBuffer));
        pod.complete_current();
        assert!(pod.is_done());
        assert_eq!(pod.success_count() + pod.failure_count(), 4);
    }

    #[test]
    fn test_success_resets_chain() {
        let mut pod = pod(3);
        pod.fail_current(SkipReason::Error);
        pod.complete_current();
        assert_eq!(pod.state(2).unwrap().consecutive_code_skips, 0);
        assert!(pod.state(1).unwrap().played);
    }

    #[test]
    fn test_remaining_duration_only_decreases() {
        let mut pod = pod(3);
        assert_eq!(pod.remaining_duration(), 30.0);
        pod.complete_current();
        assert_eq!(pod.remaining_duration(), 20.0);
        pod.abandon();
        assert!(pod.is_done());
        assert_eq!(pod.remaining_duration(), 20.0);
        assert_eq!(pod.failure_count(), 1);
    }
}
