//! Typed per-session event bus
//!
//! Every lifecycle event the engine surfaces to the host goes through
//! [`EventBus`]. Subscribers hold a [`Subscription`]; dropping it (or calling
//! [`Subscription::dispose`]) unregisters the listener.

use crate::{
    error::ErrorKind,
    perf::StartupTimeline,
    types::*,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Ad quartile milestones, named after their tracking keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quartile {
    Start,
    FirstQuartile,
    Midpoint,
    ThirdQuartile,
    Complete,
}

impl Quartile {
    pub const ALL: [Quartile; 5] = [
        Quartile::Start,
        Quartile::FirstQuartile,
        Quartile::Midpoint,
        Quartile::ThirdQuartile,
        Quartile::Complete,
    ];

    /// Fraction of the creative duration at which the milestone fires
    pub fn fraction(&self) -> f64 {
        match self {
            Quartile::Start => 0.0,
            Quartile::FirstQuartile => 0.25,
            Quartile::Midpoint => 0.5,
            Quartile::ThirdQuartile => 0.75,
            Quartile::Complete => 1.0,
        }
    }

    /// Key in the ad response tracking map
    pub fn tracking_key(&self) -> &'static str {
        match self {
            Quartile::Start => "tracking_0",
            Quartile::FirstQuartile => "tracking_25",
            Quartile::Midpoint => "tracking_50",
            Quartile::ThirdQuartile => "tracking_75",
            Quartile::Complete => "tracking_100",
        }
    }
}

/// Why a creative stopped before completing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Creative failed with an error
    Error,
    /// Stall inspection found an empty buffer
    StallNoBuffer,
    /// Stall inspection found the play head not moving
    StallPlayheadStuck,
    /// Health checker reported low health
    LowHealth,
    /// Pod was removed by the host
    Removed,
}

/// Aggregate outcome of an ad pod
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodSummary {
    pub pod_size: usize,
    pub success_count: usize,
    pub failure_count: usize,
    /// Wall-clock seconds from pod start to completion
    pub total_duration: f64,
    /// Same, minus time spent paused
    pub total_duration_excluding_pause: f64,
}

/// Events emitted by a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlayerEvent {
    // Content lifecycle
    Ready,
    Play,
    Pause,
    Seek { from: f64, to: f64, reason: SeekReason },
    Seeked { position: f64 },
    Time { position: f64, duration: Option<f64> },
    BufferStart { reason: BufferReason },
    BufferEnd { reason: BufferReason },
    PlaybackRate { rate: f64 },
    Complete,
    Error { kind: ErrorKind, code: String, message: String, fatal: bool },
    StateChanged { from: PlaybackState, to: PlaybackState },
    CaptionsChanged { track: Option<String> },
    AudioTrackChanged { track: usize },
    ContentResume { after_ad: bool, from_preroll: bool, load_type: StartLoadType },
    StartupTimeline(StartupTimeline),
    Destroyed,

    // Ad lifecycle
    AdPodFetch { position: f64 },
    AdPodFetchSuccess { count: usize },
    AdPodFetchError { message: String },
    AdPodEmpty,
    AdStart { ad_id: String, sequence: usize, count: usize },
    AdPlay { ad_id: String },
    AdPause { ad_id: String },
    AdTime { ad_id: String, position: f64, duration: f64 },
    AdBufferStart { ad_id: String },
    AdBufferEnd { ad_id: String },
    AdQuartile { ad_id: String, quartile: Quartile },
    AdClick { ad_id: String, url: String },
    AdComplete { ad_id: String },
    AdError { ad_id: String, code: String, message: String },
    AdDiscontinue { ad_id: String, reason: SkipReason },
    AdHealthScoreLow { ad_id: String, score: f64 },
    AdStall { ad_id: String, no_buffer: bool, retry: u32 },
    AdPodComplete(PodSummary),
}

impl PlayerEvent {
    /// Event name as seen by listeners
    pub fn name(&self) -> &'static str {
        match self {
            PlayerEvent::Ready => "ready",
            PlayerEvent::Play => "play",
            PlayerEvent::Pause => "pause",
            PlayerEvent::Seek { .. } => "seek",
            PlayerEvent::Seeked { .. } => "seeked",
            PlayerEvent::Time { .. } => "time",
            PlayerEvent::BufferStart { .. } => "bufferStart",
            PlayerEvent::BufferEnd { .. } => "bufferEnd",
            PlayerEvent::PlaybackRate { .. } => "playbackRate",
            PlayerEvent::Complete => "complete",
            PlayerEvent::Error { .. } => "error",
            PlayerEvent::StateChanged { .. } => "stateChanged",
            PlayerEvent::CaptionsChanged { .. } => "captionsChanged",
            PlayerEvent::AudioTrackChanged { .. } => "audioTrackChanged",
            PlayerEvent::ContentResume { .. } => "contentResume",
            PlayerEvent::StartupTimeline(_) => "startupTimeline",
            PlayerEvent::Destroyed => "destroyed",
            PlayerEvent::AdPodFetch { .. } => "adPodFetch",
            PlayerEvent::AdPodFetchSuccess { .. } => "adPodFetchSuccess",
            PlayerEvent::AdPodFetchError { .. } => "adPodFetchError",
            PlayerEvent::AdPodEmpty => "adPodEmpty",
            PlayerEvent::AdStart { .. } => "adStart",
            PlayerEvent::AdPlay { .. } => "adPlay",
            PlayerEvent::AdPause { .. } => "adPause",
            PlayerEvent::AdTime { .. } => "adTime",
            PlayerEvent::AdBufferStart { .. } => "adBufferStart",
            PlayerEvent::AdBufferEnd { .. } => "adBufferEnd",
            PlayerEvent::AdQuartile { .. } => "adQuartile",
            PlayerEvent::AdClick { .. } => "adClick",
            PlayerEvent::AdComplete { .. } => "adComplete",
            PlayerEvent::AdError { .. } => "adError",
            PlayerEvent::AdDiscontinue { .. } => "adDiscontinue",
            PlayerEvent::AdHealthScoreLow { .. } => "adHealthScoreLow",
            PlayerEvent::AdStall { .. } => "adStall",
            PlayerEvent::AdPodComplete(_) => "adPodComplete",
        }
    }
}

/// Event with delivery metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Session that emitted the event
    pub session_id: SessionId,
    /// Monotonic sequence number within the session
    pub sequence: u64,
    /// Wall-clock emission time
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: PlayerEvent,
}

/// Per-session fan-out of [`PlayerEvent`]s
#[derive(Clone)]
pub struct EventBus {
    session_id: SessionId,
    sequence: Arc<AtomicU64>,
    tx: broadcast::Sender<EventRecord>,
}

impl EventBus {
    /// Queue depth per subscriber before the slowest one starts lagging
    const CAPACITY: usize = 1024;

    pub fn new(session_id: SessionId) -> Self {
        let (tx, _) = broadcast::channel(Self::CAPACITY);
        Self {
            session_id,
            sequence: Arc::new(AtomicU64::new(0)),
            tx,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Emit an event to all current subscribers, returning its sequence number
    pub fn emit(&self, event: PlayerEvent) -> u64 {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(session_id = %self.session_id, sequence, event = event.name(), "Event");

        let record = EventRecord {
            session_id: self.session_id,
            sequence,
            timestamp: Utc::now(),
            event,
        };
        // No subscribers is fine
        let _ = self.tx.send(record);
        sequence
    }

    /// Register a listener
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: Some(self.tx.subscribe()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Handle to a bus registration; unregisters on drop
pub struct Subscription {
    rx: Option<broadcast::Receiver<EventRecord>>,
}

impl Subscription {
    /// Wait for the next event. Returns `None` once disposed or the bus is gone.
    pub async fn recv(&mut self) -> Option<EventRecord> {
        loop {
            let rx = self.rx.as_mut()?;
            match rx.recv().await {
                Ok(record) => return Some(record),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-delivered event, without waiting
    pub fn try_recv(&mut self) -> Option<EventRecord> {
        loop {
            let rx = self.rx.as_mut()?;
            match rx.try_recv() {
                Ok(record) => return Some(record),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }

    /// All already-delivered events
    pub fn drain(&mut self) -> Vec<PlayerEvent> {
        std::iter::from_fn(|| self.try_recv()).map(|r| r.event).collect()
    }

    /// Unregister; further receives return `None`. Idempotent.
    pub fn dispose(&mut self) {
        self.rx = None;
    }

    pub fn is_disposed(&self) -> bool {
        self.rx.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::new(SessionId::new());
        let mut sub = bus.subscribe();

        assert_eq!(bus.emit(PlayerEvent::Ready), 1);
        assert_eq!(bus.emit(PlayerEvent::Play), 2);

        let first = sub.recv().await.unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(first.event, PlayerEvent::Ready);
        assert_eq!(sub.drain(), vec![PlayerEvent::Play]);
    }

    #[test]
    fn test_recv_waits_for_emit() {
        let bus = EventBus::new(SessionId::new());
        let mut sub = bus.subscribe();
        let mut recv = task::spawn(sub.recv());
        assert_pending!(recv.poll());

        assert_eq!(bus.emit(PlayerEvent::Ready), 1);
        assert!(recv.is_woken());
        let record = assert_ready!(recv.poll());
        assert_eq!(record.map(|r| r.event), Some(PlayerEvent::Ready));
    }

    #[test]
    fn test_dispose_unregisters() {
        let bus = EventBus::new(SessionId::new());
        let mut sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        sub.dispose();
        sub.dispose();
        assert_eq!(bus.subscriber_count(), 0);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_string(&PlayerEvent::AdQuartile {
            ad_id: "a1".into(),
            quartile: Quartile::Midpoint,
        })
        .unwrap();
        assert!(json.contains("\"event\":\"ad_quartile\""));
        assert!(json.contains("midpoint"));
    }
}
