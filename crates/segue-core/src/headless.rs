//! Headless media element
//!
//! Plays in virtual time: nothing is decoded, the play head simply advances on
//! [`HeadlessElement::tick`] as far as the buffered ranges allow.

use crate::{
    host::{MediaElement, MediaEvent, MediaSource, SourceHandle},
    pipeline::BufferSink,
    types::BufferRange,
    Error, Result,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Tolerance when comparing the play head against the end of media
const END_EPSILON: f64 = 0.05;

enum ActiveSource {
    /// Progressive file with a declared duration; treated as fully buffered
    Declared { duration: f64 },
    /// Engine-managed URL; buffered ranges and duration come from the host
    Managed,
    Sink(Arc<dyn BufferSink>),
}

struct ElementState {
    source: Option<ActiveSource>,
    next_handle: u64,
    live_handles: HashSet<u64>,
    position: f64,
    paused: bool,
    rate: f64,
    waiting: bool,
    ended: bool,
    metadata_sent: bool,
    can_play_sent: bool,
    managed_duration: Option<f64>,
    managed_buffered: Vec<(f64, f64)>,
    text_track: Option<String>,
}

impl Default for ElementState {
    fn default() -> Self {
        Self {
            source: None,
            next_handle: 1,
            live_handles: HashSet::new(),
            position: 0.0,
            paused: true,
            rate: 1.0,
            waiting: false,
            ended: false,
            metadata_sent: false,
            can_play_sent: false,
            managed_duration: None,
            managed_buffered: Vec::new(),
            text_track: None,
        }
    }
}

impl ElementState {
    fn buffered(&self) -> BufferRange {
        match &self.source {
            None => BufferRange::empty(),
            Some(ActiveSource::Declared { duration }) => BufferRange::new(vec![(0.0, *duration)]),
            Some(ActiveSource::Managed) => BufferRange::new(self.managed_buffered.clone()),
            Some(ActiveSource::Sink(sink)) => sink.buffered(),
        }
    }

    fn duration(&self) -> Option<f64> {
        match &self.source {
            None => None,
            Some(ActiveSource::Declared { duration }) => Some(*duration),
            Some(ActiveSource::Managed) => self.managed_duration,
            Some(ActiveSource::Sink(sink)) => sink.duration(),
        }
    }

    /// True once no more media can arrive
    fn stream_complete(&self) -> bool {
        match &self.source {
            Some(ActiveSource::Sink(sink)) => sink.is_ended(),
            Some(_) => true,
            None => false,
        }
    }

    fn at_end(&self) -> bool {
        matches!(self.duration(), Some(d) if self.position >= d - END_EPSILON)
            && self.stream_complete()
    }

    fn reset_playback(&mut self) {
        self.position = 0.0;
        self.paused = true;
        self.waiting = false;
        self.ended = false;
        self.metadata_sent = false;
        self.can_play_sent = false;
        self.managed_duration = None;
        self.managed_buffered.clear();
    }
}

/// [`MediaElement`] advancing in virtual time
pub struct HeadlessElement {
    state: Mutex<ElementState>,
    events: broadcast::Sender<MediaEvent>,
}

impl Default for HeadlessElement {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessElement {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(ElementState::default()),
            events,
        }
    }

    fn send_all(&self, events: Vec<MediaEvent>) {
        for event in events {
            trace!(?event, "Element event");
            let _ = self.events.send(event);
        }
    }

    /// Advance the play head by `elapsed` of wall time
    pub fn tick(&self, elapsed: Duration) {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            if state.source.is_none() {
                return;
            }
            let buffered = state.buffered();

            if !state.metadata_sent {
                if let Some(duration) = state.duration() {
                    state.metadata_sent = true;
                    events.push(MediaEvent::LoadedMetadata { duration });
                }
            }
            if !buffered.is_empty() {
                events.push(MediaEvent::Progress);
                if !state.can_play_sent && buffered.length_ahead(state.position) > 0.0 {
                    state.can_play_sent = true;
                    events.push(MediaEvent::CanPlay);
                }
            }

            if !state.paused && !state.ended && state.rate > 0.0 {
                let ahead = buffered.length_ahead(state.position);
                if ahead <= 0.0 {
                    if state.at_end() {
                        state.ended = true;
                        state.paused = true;
                        events.push(MediaEvent::Ended);
                    } else if !state.waiting {
                        state.waiting = true;
                        events.push(MediaEvent::Waiting);
                    }
                } else {
                    if state.waiting {
                        state.waiting = false;
                        events.push(MediaEvent::Playing);
                    }
                    state.position += (elapsed.as_secs_f64() * state.rate).min(ahead);
                    events.push(MediaEvent::TimeUpdate {
                        position: state.position,
                    });
                    if state.at_end() {
                        state.ended = true;
                        state.paused = true;
                        events.push(MediaEvent::Ended);
                    }
                }
            }
        }
        self.send_all(events);
    }

    /// Tick every `step` on a background task until the handle is aborted
    pub fn drive(self: &Arc<Self>, step: Duration) -> JoinHandle<()> {
        let element = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(step);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                element.tick(step);
            }
        })
    }

    /// Buffered ranges for an engine-managed source
    pub fn set_buffered(&self, ranges: Vec<(f64, f64)>) {
        self.state.lock().managed_buffered = ranges;
    }

    /// Duration for an engine-managed source
    pub fn set_duration(&self, duration: f64) {
        self.state.lock().managed_duration = Some(duration);
    }

    /// Raise a media error
    pub fn fail(&self, code: u16, message: impl Into<String>) {
        self.send_all(vec![MediaEvent::Error {
            code,
            message: message.into(),
        }]);
    }

    pub fn has_source(&self) -> bool {
        self.state.lock().source.is_some()
    }

    /// Handles attached and not yet revoked
    pub fn live_handles(&self) -> usize {
        self.state.lock().live_handles.len()
    }

    pub fn text_track(&self) -> Option<String> {
        self.state.lock().text_track.clone()
    }
}

#[async_trait]
impl MediaElement for HeadlessElement {
    fn attach(&self, source: MediaSource) -> Result<SourceHandle> {
        let mut state = self.state.lock();
        state.reset_playback();
        state.source = Some(match source {
            MediaSource::Url {
                duration: Some(duration),
                ..
            } if duration > 0.0 => ActiveSource::Declared { duration },
            MediaSource::Url { .. } => ActiveSource::Managed,
            MediaSource::Sink(sink) => ActiveSource::Sink(sink),
        });
        let handle = state.next_handle;
        state.next_handle += 1;
        state.live_handles.insert(handle);
        debug!(handle, "Source attached");
        Ok(SourceHandle(handle))
    }

    fn revoke(&self, handle: SourceHandle) {
        self.state.lock().live_handles.remove(&handle.0);
    }

    async fn play(&self) -> Result<()> {
        let event = {
            let mut state = self.state.lock();
            if state.source.is_none() {
                return Err(Error::media(4, "play() without a source"));
            }
            if !state.paused {
                return Ok(());
            }
            state.paused = false;
            state.ended = false;
            if state.buffered().length_ahead(state.position) > 0.0 {
                state.waiting = false;
                MediaEvent::Playing
            } else {
                state.waiting = true;
                MediaEvent::Waiting
            }
        };
        self.send_all(vec![event]);
        Ok(())
    }

    fn pause(&self) {
        let changed = {
            let mut state = self.state.lock();
            let changed = !state.paused;
            state.paused = true;
            changed
        };
        if changed {
            self.send_all(vec![MediaEvent::Pause]);
        }
    }

    fn seek(&self, position: f64) {
        let position = {
            let mut state = self.state.lock();
            let max = state.duration().unwrap_or(f64::MAX);
            state.position = position.clamp(0.0, max);
            state.ended = false;
            state.position
        };
        self.send_all(vec![MediaEvent::Seeked { position }]);
    }

    fn set_playback_rate(&self, rate: f64) {
        self.state.lock().rate = rate.max(0.0);
    }

    fn playback_rate(&self) -> f64 {
        self.state.lock().rate
    }

    fn current_time(&self) -> f64 {
        self.state.lock().position
    }

    fn duration(&self) -> Option<f64> {
        self.state.lock().duration()
    }

    fn buffered(&self) -> BufferRange {
        self.state.lock().buffered()
    }

    fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    fn set_text_track(&self, id: Option<&str>) {
        self.state.lock().text_track = id.map(str::to_string);
    }

    fn detach(&self) {
        let mut state = self.state.lock();
        state.source = None;
        state.reset_playback();
    }

    fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.events.subscribe()
    }
}
