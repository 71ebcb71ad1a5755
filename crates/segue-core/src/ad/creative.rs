//! Per-creative players
//!
//! One interface over three backends, chosen once per ad:
//! - progressive file on a media element
//! - HLS through a [`SegmentPipeline`] into a buffer sink attached to a media element
//! - native player through a [`NativeBridge`]
//!
//! Backend signals are normalised into [`CreativeEvent`]s on one channel.

use super::bridge::{invoke, BridgeCall, NativeBridge, NativeEvent};
use super::model::Ad;
use crate::{
    config::RedundancyConfig,
    host::{MediaElement, MediaEvent, MediaSource, SourceHandle},
    pipeline::{BufferSink, PipelineReport, SegmentPipeline},
    transport::{AbortToken, HttpClient},
    types::BufferRange,
    Error, Result,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Upper bound on a native bridge round trip
const BRIDGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates a fresh buffer sink for each HLS creative
pub type SinkFactory = Arc<dyn Fn() -> Arc<dyn BufferSink> + Send + Sync>;

/// Host resources available to ad creatives
#[derive(Clone)]
pub struct AdBackend {
    pub client: HttpClient,
    pub redundancy: RedundancyConfig,
    pub element: Arc<dyn MediaElement>,
    pub bridge: Option<Arc<dyn NativeBridge>>,
    pub sink_factory: SinkFactory,
}

/// Which player a creative runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreativeKind {
    Progressive,
    Hls,
    Native,
}

impl CreativeKind {
    pub fn for_ad(ad: &Ad, backend: &AdBackend) -> Self {
        if backend.bridge.is_some() {
            CreativeKind::Native
        } else if ad.is_hls() {
            CreativeKind::Hls
        } else {
            CreativeKind::Progressive
        }
    }

    /// Plays on the shared media element
    pub fn uses_element(&self) -> bool {
        !matches!(self, CreativeKind::Native)
    }
}

/// Normalised creative signal
#[derive(Debug)]
pub enum CreativeEvent {
    CanPlay,
    Playing,
    Paused,
    Buffering,
    TimeUpdate { position: f64 },
    Ended,
    Failed(Error),
}

#[derive(Debug, Default)]
struct NativeState {
    position: f64,
    duration: Option<f64>,
    can_play: bool,
    buffering: bool,
}

enum Backend {
    Element {
        element: Arc<dyn MediaElement>,
        handle: Option<SourceHandle>,
    },
    Hls {
        element: Arc<dyn MediaElement>,
        handle: Option<SourceHandle>,
        pipeline: Option<Arc<SegmentPipeline>>,
        report: Arc<Mutex<Option<PipelineReport>>>,
    },
    Native {
        bridge: Arc<dyn NativeBridge>,
        state: Arc<Mutex<NativeState>>,
    },
}

/// Player for one load of one creative
pub struct CreativePlayer {
    ad: Ad,
    kind: CreativeKind,
    backend: Backend,
    client: HttpClient,
    redundancy: RedundancyConfig,
    sink_factory: SinkFactory,
    abort: AbortToken,
    tx: mpsc::UnboundedSender<CreativeEvent>,
    rx: mpsc::UnboundedReceiver<CreativeEvent>,
    tasks: Vec<JoinHandle<()>>,
    removed: bool,
}

impl CreativePlayer {
    pub fn new(ad: &Ad, backend: &AdBackend, abort: AbortToken) -> Self {
        let kind = CreativeKind::for_ad(ad, backend);
        let inner = match (kind, &backend.bridge) {
            (CreativeKind::Native, Some(bridge)) => Backend::Native {
                bridge: Arc::clone(bridge),
                state: Arc::new(Mutex::new(NativeState {
                    duration: (ad.duration > 0.0).then_some(ad.duration),
                    ..NativeState::default()
                })),
            },
            (CreativeKind::Hls, _) => Backend::Hls {
                element: Arc::clone(&backend.element),
                handle: None,
                pipeline: None,
                report: Arc::new(Mutex::new(None)),
            },
            _ => Backend::Element {
                element: Arc::clone(&backend.element),
                handle: None,
            },
        };
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            ad: ad.clone(),
            kind,
            backend: inner,
            client: backend.client.clone(),
            redundancy: backend.redundancy.clone(),
            sink_factory: Arc::clone(&backend.sink_factory),
            abort,
            tx,
            rx,
            tasks: Vec::new(),
            removed: false,
        }
    }

    pub fn kind(&self) -> CreativeKind {
        self.kind
    }

    /// Start loading the creative's media
    pub async fn load(&mut self, bandwidth_estimate: Option<u64>) -> Result<()> {
        info!(ad_id = %self.ad.id, kind = ?self.kind, url = %self.ad.media_url, "Loading creative");
        match &mut self.backend {
            Backend::Element { element, handle } => {
                let events = element.subscribe();
                *handle = Some(element.attach(MediaSource::Url {
                    url: self.ad.media_url.clone(),
                    duration: Some(self.ad.duration),
                })?);
                self.tasks
                    .push(spawn_element_forwarder(events, self.tx.clone(), self.abort.clone()));
            }
            Backend::Hls {
                element,
                handle,
                pipeline,
                report,
            } => {
                let events = element.subscribe();
                let sink = (self.sink_factory)();
                *handle = Some(element.attach(MediaSource::Sink(Arc::clone(&sink)))?);
                self.tasks
                    .push(spawn_element_forwarder(events, self.tx.clone(), self.abort.clone()));

                let hls = Arc::new(SegmentPipeline::new(
                    self.client.clone(),
                    self.redundancy.clone(),
                    sink,
                    self.abort.clone(),
                ));
                *pipeline = Some(Arc::clone(&hls));

                let url = self.ad.media_url.clone();
                let tx = self.tx.clone();
                let report = Arc::clone(report);
                self.tasks.push(tokio::spawn(async move {
                    match hls.run(&url, bandwidth_estimate).await {
                        Ok(done) => *report.lock() = Some(done),
                        Err(Error::Aborted) => debug!("Creative pipeline aborted"),
                        Err(e) => {
                            let _ = tx.send(CreativeEvent::Failed(e));
                        }
                    }
                }));
            }
            Backend::Native { bridge, state } => {
                let events = bridge.subscribe();
                self.tasks.push(spawn_native_forwarder(
                    events,
                    Arc::clone(state),
                    self.tx.clone(),
                    self.abort.clone(),
                ));
                invoke(
                    bridge.as_ref(),
                    BridgeCall::Setup {
                        ad_id: self.ad.id.clone(),
                    },
                    BRIDGE_TIMEOUT,
                )
                .await?;
                invoke(
                    bridge.as_ref(),
                    BridgeCall::Preload {
                        url: self.ad.media_url.clone(),
                    },
                    BRIDGE_TIMEOUT,
                )
                .await?;
            }
        }
        Ok(())
    }

    pub async fn play(&self) -> Result<()> {
        match &self.backend {
            Backend::Element { element, .. } | Backend::Hls { element, .. } => element.play().await,
            Backend::Native { bridge, .. } => {
                invoke(bridge.as_ref(), BridgeCall::Play, BRIDGE_TIMEOUT).await
            }
        }
    }

    pub async fn pause(&self) -> Result<()> {
        match &self.backend {
            Backend::Element { element, .. } | Backend::Hls { element, .. } => {
                element.pause();
                Ok(())
            }
            Backend::Native { bridge, .. } => {
                invoke(bridge.as_ref(), BridgeCall::Pause, BRIDGE_TIMEOUT).await
            }
        }
    }

    pub fn buffered(&self) -> BufferRange {
        match &self.backend {
            Backend::Element { element, .. } | Backend::Hls { element, .. } => element.buffered(),
            Backend::Native { state, .. } => {
                let state = state.lock();
                match state.duration {
                    Some(duration) if state.can_play && !state.buffering => {
                        BufferRange::new(vec![(0.0, duration)])
                    }
                    _ => BufferRange::empty(),
                }
            }
        }
    }

    pub fn position(&self) -> f64 {
        match &self.backend {
            Backend::Element { element, .. } | Backend::Hls { element, .. } => element.current_time(),
            Backend::Native { state, .. } => state.lock().position,
        }
    }

    /// Media duration as reported by the backend
    pub fn duration(&self) -> Option<f64> {
        match &self.backend {
            Backend::Element { element, .. } | Backend::Hls { element, .. } => element.duration(),
            Backend::Native { state, .. } => state.lock().duration,
        }
    }

    /// Pipeline outcome of a finished HLS load
    pub fn pipeline_report(&self) -> Option<PipelineReport> {
        match &self.backend {
            Backend::Hls { report, .. } => report.lock().clone(),
            _ => None,
        }
    }

    pub async fn next_event(&mut self) -> Option<CreativeEvent> {
        self.rx.recv().await
    }

    /// Tear down: abort requests, wait for background work, release handles.
    /// Idempotent.
    pub async fn remove(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;
        self.abort.abort();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Creative task failed");
            }
        }

        match &mut self.backend {
            Backend::Element { element, handle } => {
                element.pause();
                if let Some(handle) = handle.take() {
                    element.revoke(handle);
                }
                element.detach();
            }
            Backend::Hls {
                element,
                handle,
                pipeline,
                ..
            } => {
                if let Some(pipeline) = pipeline.take() {
                    pipeline.teardown();
                }
                element.pause();
                if let Some(handle) = handle.take() {
                    element.revoke(handle);
                }
                element.detach();
            }
            Backend::Native { bridge, .. } => {
                if let Err(e) = invoke(bridge.as_ref(), BridgeCall::Destroy, BRIDGE_TIMEOUT).await {
                    warn!(ad_id = %self.ad.id, error = %e, "Native destroy failed");
                }
            }
        }
        debug!(ad_id = %self.ad.id, "Creative removed");
    }
}

fn spawn_element_forwarder(
    mut events: broadcast::Receiver<MediaEvent>,
    tx: mpsc::UnboundedSender<CreativeEvent>,
    abort: AbortToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                _ = abort.aborted() => break,
                event = events.recv() => event,
            };
            let mapped = match event {
                Ok(MediaEvent::CanPlay) => CreativeEvent::CanPlay,
                Ok(MediaEvent::Playing) => CreativeEvent::Playing,
                Ok(MediaEvent::Pause) => CreativeEvent::Paused,
                Ok(MediaEvent::Waiting) => CreativeEvent::Buffering,
                Ok(MediaEvent::TimeUpdate { position }) => CreativeEvent::TimeUpdate { position },
                Ok(MediaEvent::Ended) => CreativeEvent::Ended,
                Ok(MediaEvent::Error { code, message }) => {
                    CreativeEvent::Failed(Error::media(code, message))
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Creative lagged behind element events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if tx.send(mapped).is_err() {
                break;
            }
        }
    })
}

fn spawn_native_forwarder(
    mut events: broadcast::Receiver<NativeEvent>,
    state: Arc<Mutex<NativeState>>,
    tx: mpsc::UnboundedSender<CreativeEvent>,
    abort: AbortToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                _ = abort.aborted() => break,
                event = events.recv() => event,
            };
            let event = match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let mapped = {
                let mut state = state.lock();
                match event {
                    NativeEvent::CanPlay => {
                        state.can_play = true;
                        CreativeEvent::CanPlay
                    }
                    NativeEvent::Buffering => {
                        state.buffering = true;
                        CreativeEvent::Buffering
                    }
                    NativeEvent::Playing => {
                        state.buffering = false;
                        state.can_play = true;
                        CreativeEvent::Playing
                    }
                    NativeEvent::Pause => CreativeEvent::Paused,
                    NativeEvent::TimeUpdate { position, duration } => {
                        state.position = position;
                        state.duration = Some(duration);
                        CreativeEvent::TimeUpdate { position }
                    }
                    NativeEvent::End => CreativeEvent::Ended,
                    NativeEvent::Error { message } => {
                        CreativeEvent::Failed(Error::bridge("event", message))
                    }
                }
            };
            if tx.send(mapped).is_err() {
                break;
            }
        }
    })
}
