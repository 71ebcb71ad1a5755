//! Segue Core - Ad-insertion playback engine
//!
//! This crate provides the core of a playback engine that interleaves
//! long-form content with dynamically inserted ad breaks:
//! - Content session state machine with buffer-level gating
//! - Ad pod playback over progressive, HLS and native-player creatives
//! - A minimal HLS client for ad creatives (manifest, level selection,
//!   pipelined segment download, transmux, buffer-sink append)
//! - Fragment cache for instant content resume after ad breaks
//! - Ad health scoring and stall detection
//! - Startup performance timeline and a typed per-session event bus
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Playback Adapter                         │
//! │      buffering gate · cue points · resume · captions/audio       │
//! └───────┬───────────────────────┬───────────────────────┬──────────┘
//!         │                       │                       │
//!  ┌──────┴───────┐       ┌───────┴───────┐       ┌───────┴───────┐
//!  │  Streaming   │       │   Ad Player   │       │  Performance  │
//!  │ Engine (host)│       │  pod sequence │       │   Collector   │
//!  └──────┬───────┘       └───────┬───────┘       └───────────────┘
//!         │              ┌────────┼─────────┐
//!  ┌──────┴───────┐ ┌────┴────┐ ┌─┴──────┐ ┌┴──────────────┐
//!  │   Fragment   │ │ Segment │ │ Native │ │ Health / Stall│
//!  │    Cache     │ │Pipeline │ │ Bridge │ │   checkers    │
//!  └──────────────┘ └────┬────┘ └────────┘ └───────────────┘
//!                        │
//!                 ┌──────┴───────┐
//!                 │  Transport   │
//!                 └──────────────┘
//! ```

pub mod error;
pub mod types;
pub mod config;
pub mod events;
pub mod transport;
pub mod cache;
pub mod manifest;
pub mod pipeline;
pub mod host;
pub mod headless;
pub mod perf;
pub mod health;
pub mod stall;
pub mod ad;
pub mod adapter;

pub use error::{Error, ErrorKind, Result, VastErrorCode};
pub use types::*;
pub use config::{EngineConfig, StallHandling};
pub use events::{EventBus, EventRecord, PlayerEvent, PodSummary, Quartile, SkipReason, Subscription};
pub use transport::{AbortToken, HttpClient, Transport};
pub use cache::{CacheEntry, FragmentCache, FragmentMeta, FragmentSn};
pub use manifest::{select_level_to_load, HlsLoader, HlsParser};
pub use pipeline::{BufferSink, MemorySink, PipelineReport, SegmentPipeline};
pub use host::{MediaElement, MediaEvent, MediaSource, StreamingEngine};
pub use headless::HeadlessElement;
pub use perf::{PerformanceCollector, StartupTimeline};
pub use health::HealthChecker;
pub use stall::StallManager;
pub use ad::{Ad, AdPlayer, AdPlayerHandle, NativeBridge};
pub use adapter::{AdapterDeps, AdapterHandle, PlaybackAdapter, SessionOptions};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the engine library
pub fn init() {
    tracing::info!(version = VERSION, "Segue Core initialized");
}
