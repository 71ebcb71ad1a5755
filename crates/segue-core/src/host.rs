//! Host platform seams
//!
//! The engine never touches a real video element or the external adaptive
//! streaming engine directly. Hosts implement these traits; the headless
//! implementations in [`crate::headless`] back the CLI and tests.

use crate::{
    cache::CacheEntry,
    error::ErrorKind,
    pipeline::BufferSink,
    types::{AudioTrack, BufferRange, Level},
    Error, Result,
};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use url::Url;

/// Handle returned when a source is attached to an element (an object URL on the web)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceHandle(pub u64);

/// What an element plays from
#[derive(Clone)]
pub enum MediaSource {
    /// Progressive file or engine-managed URL. `duration` is the declared
    /// length when known up front (ad creatives).
    Url { url: Url, duration: Option<f64> },
    /// Buffer sink fed by a segment pipeline
    Sink(Arc<dyn BufferSink>),
}

impl fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaSource::Url { url, duration } => f
                .debug_struct("Url")
                .field("url", &url.as_str())
                .field("duration", duration)
                .finish(),
            MediaSource::Sink(_) => f.write_str("Sink"),
        }
    }
}

/// Events raised by a media element
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    LoadedMetadata { duration: f64 },
    CanPlay,
    Playing,
    Pause,
    Waiting,
    Seeked { position: f64 },
    TimeUpdate { position: f64 },
    Progress,
    Ended,
    Error { code: u16, message: String },
}

/// Generic buffered-media element
#[async_trait]
pub trait MediaElement: Send + Sync {
    fn attach(&self, source: MediaSource) -> Result<SourceHandle>;

    /// Release a handle from [`MediaElement::attach`]
    fn revoke(&self, handle: SourceHandle);

    async fn play(&self) -> Result<()>;

    fn pause(&self);

    fn seek(&self, position: f64);

    fn set_playback_rate(&self, rate: f64);

    fn playback_rate(&self) -> f64;

    fn current_time(&self) -> f64;

    fn duration(&self) -> Option<f64>;

    /// Buffered ranges, read fresh on every call
    fn buffered(&self) -> BufferRange;

    fn is_paused(&self) -> bool;

    /// Show a caption track, or none
    fn set_text_track(&self, id: Option<&str>);

    /// Drop the current source
    fn detach(&self);

    fn subscribe(&self) -> broadcast::Receiver<MediaEvent>;
}

/// Content load request handed to the streaming engine
#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    pub url: Url,
    pub start_position: f64,
    /// Rendition to load first, when known
    pub start_level: Option<usize>,
}

/// Failure class reported by the streaming engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineErrorDetails {
    ManifestTimeout,
    ManifestLoad(String),
    FragmentLoad(String),
    /// Recoverable gap in the buffer that playback can skip over
    BufferHole,
    Media(String),
    KeySystem(String),
}

impl EngineErrorDetails {
    /// Equivalent engine error
    pub fn to_error(&self, url: &str) -> Error {
        match self {
            EngineErrorDetails::ManifestTimeout => Error::RequestTimeout {
                url: url.to_string(),
            },
            EngineErrorDetails::ManifestLoad(reason) => Error::ManifestFetch(reason.clone()),
            EngineErrorDetails::FragmentLoad(reason) => Error::SegmentFetch {
                url: url.to_string(),
                reason: reason.clone(),
            },
            EngineErrorDetails::BufferHole => Error::media(0, "buffer hole"),
            EngineErrorDetails::Media(message) => Error::media(3, message.clone()),
            EngineErrorDetails::KeySystem(message) => Error::Drm(message.clone()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.to_error("").kind()
    }
}

/// Events raised by the streaming engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    ManifestLoaded { levels: Vec<Level> },
    /// A content fragment finished downloading
    FragmentLoaded(CacheEntry),
    LevelSwitched { level: usize },
    Error { details: EngineErrorDetails, fatal: bool },
}

/// External adaptive streaming engine used for primary content
#[async_trait]
pub trait StreamingEngine: Send + Sync {
    async fn load(&self, request: LoadRequest) -> Result<()>;

    fn levels(&self) -> Vec<Level>;

    fn next_load_level(&self) -> Option<usize>;

    fn set_next_load_level(&self, level: usize);

    fn bandwidth_estimate(&self) -> Option<u64>;

    /// Attempt in-place recovery from a media error
    fn recover_media_error(&self);

    fn audio_tracks(&self) -> Vec<AudioTrack>;

    fn set_audio_track(&self, id: usize) -> Result<()>;

    /// Stop loading and release the element
    fn detach(&self);

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
}
