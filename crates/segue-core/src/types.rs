//! Core types shared across the engine

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;
use uuid::Uuid;

/// Unique identifier for a content session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns quality tier name
    pub fn quality_name(&self) -> &'static str {
        match self.height {
            0..=240 => "240p",
            241..=360 => "360p",
            361..=480 => "480p",
            481..=720 => "720p",
            721..=1080 => "1080p",
            1081..=1440 => "1440p",
            _ => "4K",
        }
    }

    pub const SD_480P: Resolution = Resolution { width: 854, height: 480 };
    pub const HD_720P: Resolution = Resolution { width: 1280, height: 720 };
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One bitrate/resolution variant of a streamed asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Level {
    /// Position in the manifest (0-based, manifest order)
    pub index: usize,
    /// Bandwidth in bits per second
    pub bandwidth: u64,
    /// Video resolution, when advertised
    pub resolution: Option<Resolution>,
    /// Raw CODECS attribute
    pub codecs: Option<String>,
    /// Media playlist URI
    pub uri: Url,
}

impl Level {
    /// Vertical resolution, 0 when unknown
    pub fn height(&self) -> u32 {
        self.resolution.map(|r| r.height).unwrap_or(0)
    }
}

/// Alternate audio rendition from `#EXT-X-MEDIA:TYPE=AUDIO`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioRendition {
    pub group_id: String,
    pub name: String,
    pub language: Option<String>,
    pub default: bool,
    pub uri: Url,
}

/// One independently fetched media segment of a level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Ordinal position within the level (media sequence based)
    pub number: u64,
    /// URI to fetch the segment
    pub uri: Url,
    /// Duration of this segment
    pub duration: Duration,
    /// Start time on the level timeline, in seconds
    pub start: f64,
    /// Initialization segment URI (`EXT-X-MAP`), when the level is fMP4
    pub init_uri: Option<Url>,
}

impl Segment {
    /// End time on the level timeline, in seconds
    pub fn end(&self) -> f64 {
        self.start + self.duration.as_secs_f64()
    }
}

/// Elementary track type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackType {
    Main,
    Video,
    Audio,
}

impl std::fmt::Display for TrackType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackType::Main => write!(f, "main"),
            TrackType::Video => write!(f, "video"),
            TrackType::Audio => write!(f, "audio"),
        }
    }
}

/// Playback state of a single session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Idle,
    Playing,
    Paused,
    Completed,
    Errored,
    Destroyed,
}

impl PlaybackState {
    /// Check if transition to target state is valid
    pub fn can_transition_to(&self, target: PlaybackState) -> bool {
        use PlaybackState::*;
        matches!(
            (self, target),
            // Anything but a destroyed session can be torn down
            (Idle | Playing | Paused | Completed | Errored, Destroyed) |
            // From Idle
            (Idle, Playing) | (Idle, Paused) | (Idle, Errored) |
            // From Playing
            (Playing, Paused) | (Playing, Completed) | (Playing, Errored) | (Playing, Idle) |
            // From Paused
            (Paused, Playing) | (Paused, Completed) | (Paused, Errored) | (Paused, Idle) |
            // From Completed
            (Completed, Playing) | (Completed, Idle) |
            // From Errored
            (Errored, Idle)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PlaybackState::Destroyed)
    }
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackState::Idle => write!(f, "idle"),
            PlaybackState::Playing => write!(f, "playing"),
            PlaybackState::Paused => write!(f, "paused"),
            PlaybackState::Completed => write!(f, "completed"),
            PlaybackState::Errored => write!(f, "errored"),
            PlaybackState::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Buffered time ranges, always read fresh from the platform sink
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferRange {
    ranges: Vec<(f64, f64)>,
}

impl BufferRange {
    /// Build from raw intervals; sorts and merges touching ranges
    pub fn new(mut ranges: Vec<(f64, f64)>) -> Self {
        ranges.retain(|(s, e)| e > s);
        ranges.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut merged: Vec<(f64, f64)> = Vec::with_capacity(ranges.len());
        for (start, end) in ranges {
            match merged.last_mut() {
                Some(last) if start <= last.1 + 0.1 => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }
        Self { ranges: merged }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn ranges(&self) -> &[(f64, f64)] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// End of the last buffered range
    pub fn end(&self) -> Option<f64> {
        self.ranges.last().map(|r| r.1)
    }

    pub fn contains(&self, position: f64) -> bool {
        self.ranges.iter().any(|(s, e)| position >= *s && position < *e)
    }

    /// Seconds of contiguous media buffered ahead of `position`
    pub fn length_ahead(&self, position: f64) -> f64 {
        self.ranges
            .iter()
            .find(|(s, e)| position >= *s - 0.1 && position < *e)
            .map(|(_, e)| e - position.max(0.0))
            .unwrap_or(0.0)
    }

    /// Sum of all buffered durations
    pub fn total(&self) -> f64 {
        self.ranges.iter().map(|(s, e)| e - s).sum()
    }
}

/// Reason the session entered buffering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferReason {
    /// Initial load before first frame
    Startup,
    /// Buffer starved during playback
    Rebuffer,
    /// User seek into unbuffered range
    Seek,
    /// Content reload after an ad break
    AdResume,
}

/// Reason a seek was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeekReason {
    User,
    Resume,
    Snapback,
    Recovery,
}

/// How content was (re)loaded, recorded on the startup timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartLoadType {
    /// First load of the session
    Initial,
    /// Existing element re-attached after ads
    Reattach,
    /// Fresh load after ads
    Reload,
    /// Reload after a fatal-error retry
    Retry,
}

/// Caption / subtitle track exposed by the content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextTrack {
    pub id: String,
    pub language: String,
    pub label: String,
    pub url: Option<Url>,
}

/// Audio track exposed by the content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioTrack {
    pub id: usize,
    pub language: Option<String>,
    pub name: String,
    pub default: bool,
}

/// Scheduled ad break position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CuePoint {
    /// Position in content seconds (0 = preroll)
    pub position: f64,
}

impl CuePoint {
    pub fn is_preroll(&self) -> bool {
        self.position <= 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_range_merges() {
        let range = BufferRange::new(vec![(4.0, 8.0), (0.0, 4.0), (10.0, 12.0)]);
        assert_eq!(range.ranges(), &[(0.0, 8.0), (10.0, 12.0)]);
        assert_eq!(range.end(), Some(12.0));
        assert!((range.length_ahead(2.0) - 6.0).abs() < 1e-9);
        assert_eq!(range.length_ahead(9.0), 0.0);
        assert!((range.total() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_playback_transitions() {
        assert!(PlaybackState::Idle.can_transition_to(PlaybackState::Playing));
        assert!(PlaybackState::Playing.can_transition_to(PlaybackState::Paused));
        assert!(PlaybackState::Errored.can_transition_to(PlaybackState::Destroyed));
        assert!(!PlaybackState::Destroyed.can_transition_to(PlaybackState::Idle));
        assert!(!PlaybackState::Destroyed.can_transition_to(PlaybackState::Destroyed));
        assert!(!PlaybackState::Errored.can_transition_to(PlaybackState::Playing));
    }

    #[test]
    fn test_resolution_quality_name() {
        assert_eq!(Resolution::SD_480P.quality_name(), "480p");
        assert_eq!(Resolution::HD_720P.quality_name(), "720p");
    }
}
