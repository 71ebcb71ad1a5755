//! Content session state machine
//!
//! A [`PlaybackAdapter`] owns one content session: it loads content through the
//! streaming engine, gates startup and rebuffer recovery on buffer level, hands
//! the element to an [`AdPlayer`] at cue points, and resumes content after the
//! break. All mutation happens on the task that drives [`PlaybackAdapter::step`];
//! background work (ad fetches, pods) reports back over a completion channel.

use crate::{
    ad::{Ad, AdBackend, AdDecisionClient, AdPlayer, AdPlayerHandle, NativeBridge, NativeEvent, SinkFactory},
    cache::FragmentCache,
    config::EngineConfig,
    events::{EventBus, PlayerEvent, PodSummary},
    host::{EngineErrorDetails, EngineEvent, LoadRequest, MediaElement, MediaEvent, StreamingEngine},
    perf::{Milestone, PerformanceCollector},
    transport::{AbortToken, HttpClient},
    types::{
        AudioTrack, BufferReason, CuePoint, PlaybackState, SeekReason, StartLoadType, TextTrack,
        TrackType,
    },
    Error, Result,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};
use url::Url;

/// Track types consulted when reconciling the resume level
const CONTENT_TRACKS: [TrackType; 2] = [TrackType::Main, TrackType::Video];

/// Host collaborators of a session
#[derive(Clone)]
pub struct AdapterDeps {
    pub config: EngineConfig,
    /// Content element
    pub element: Arc<dyn MediaElement>,
    /// Dedicated ad element; ads share the content element when absent
    pub ad_element: Option<Arc<dyn MediaElement>>,
    pub engine: Arc<dyn StreamingEngine>,
    pub cache: Arc<FragmentCache>,
    pub client: HttpClient,
    /// Native player for ads, when the host has one
    pub bridge: Option<Arc<dyn NativeBridge>>,
    pub sink_factory: SinkFactory,
}

/// What a session plays
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub content_url: Option<Url>,
    pub cue_points: Vec<CuePoint>,
    pub start_position: f64,
    pub text_tracks: Vec<TextTrack>,
}

/// Host command delivered through an [`AdapterHandle`]
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterCommand {
    Play,
    Pause,
    Seek { position: f64, reason: SeekReason },
    SetCaptions(Option<String>),
    SetAudioTrack(usize),
    Destroy,
}

/// Sends commands to a running adapter
#[derive(Clone)]
pub struct AdapterHandle {
    tx: mpsc::UnboundedSender<AdapterCommand>,
}

impl AdapterHandle {
    fn send(&self, command: AdapterCommand) {
        if self.tx.send(command).is_err() {
            debug!("Adapter no longer running");
        }
    }

    pub fn play(&self) {
        self.send(AdapterCommand::Play);
    }

    pub fn pause(&self) {
        self.send(AdapterCommand::Pause);
    }

    pub fn seek(&self, position: f64) {
        self.send(AdapterCommand::Seek {
            position,
            reason: SeekReason::User,
        });
    }

    pub fn set_captions(&self, track: Option<String>) {
        self.send(AdapterCommand::SetCaptions(track));
    }

    pub fn set_audio_track(&self, id: usize) {
        self.send(AdapterCommand::SetAudioTrack(id));
    }

    pub fn destroy(&self) {
        self.send(AdapterCommand::Destroy);
    }
}

/// Background work finishing
enum Completion {
    AdPodFetched(Result<Vec<Ad>>),
    AdPodFinished {
        summary: PodSummary,
        bandwidth_estimate: Option<u64>,
    },
}

enum AdPhase {
    Idle,
    Fetching {
        abort: AbortToken,
        from_preroll: bool,
    },
    Playing {
        handle: AdPlayerHandle,
        task: JoinHandle<()>,
        from_preroll: bool,
    },
}

/// Pending exit from buffering, waiting for enough media ahead
#[derive(Debug, Clone, Copy)]
struct BufferGate {
    threshold: f64,
    deadline: Instant,
}

enum Input {
    Completion(Completion),
    Command(AdapterCommand),
    GateTimeout,
    Media(Option<MediaEvent>),
    Engine(Option<EngineEvent>),
    Native(Option<NativeEvent>),
}

/// Next event of an optional broadcast subscription; pending forever when absent
async fn next_broadcast<T: Clone>(rx: &mut Option<broadcast::Receiver<T>>) -> Option<T> {
    let Some(rx) = rx.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(value) => return Some(value),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Adapter lagged behind host events");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

/// Top-level state machine of one content session
pub struct PlaybackAdapter {
    config: EngineConfig,
    element: Arc<dyn MediaElement>,
    ad_element: Option<Arc<dyn MediaElement>>,
    engine: Arc<dyn StreamingEngine>,
    cache: Arc<FragmentCache>,
    client: HttpClient,
    bridge: Option<Arc<dyn NativeBridge>>,
    sink_factory: SinkFactory,
    ad_decision: Option<AdDecisionClient>,
    options: SessionOptions,
    bus: EventBus,

    state: PlaybackState,
    state_tx: watch::Sender<PlaybackState>,
    ad: AdPhase,
    pending_cues: Vec<CuePoint>,
    buffering: Option<BufferReason>,
    buffer_gate: Option<BufferGate>,
    perf: PerformanceCollector,
    ready: bool,
    content_loaded: bool,
    /// Ads replaced the content source on the shared element
    element_consumed: bool,
    resume_position: f64,
    captions: Option<String>,
    bandwidth_estimate: Option<u64>,
    media_error_recoveries: u32,
    manifest_timeout_retries: u32,
    destroyed: bool,
    abort: AbortToken,

    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
    command_tx: mpsc::UnboundedSender<AdapterCommand>,
    command_rx: mpsc::UnboundedReceiver<AdapterCommand>,
    media_events: Option<broadcast::Receiver<MediaEvent>>,
    engine_events: Option<broadcast::Receiver<EngineEvent>>,
    native_events: Option<broadcast::Receiver<NativeEvent>>,
}

impl PlaybackAdapter {
    pub fn new(deps: AdapterDeps, options: SessionOptions, bus: EventBus) -> Result<Self> {
        deps.config.validate()?;
        let ad_decision = match deps.config.ads.ad_decision_url.as_deref() {
            Some(raw) => {
                let endpoint = Url::parse(raw)
                    .map_err(|e| Error::InvalidConfig(format!("ads.ad_decision_url: {e}")))?;
                Some(AdDecisionClient::new(
                    deps.client.clone(),
                    endpoint,
                    Duration::from_millis(deps.config.ads.ad_fetch_timeout_ms),
                ))
            }
            None => None,
        };

        let mut pending_cues: Vec<CuePoint> = options
            .cue_points
            .iter()
            .copied()
            .filter(|c| c.is_preroll() || c.position > options.start_position)
            .collect();
        pending_cues.sort_by(|a, b| a.position.total_cmp(&b.position));
        pending_cues.dedup_by(|a, b| a.position == b.position);

        let (state_tx, _) = watch::channel(PlaybackState::Idle);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config: deps.config,
            element: deps.element,
            ad_element: deps.ad_element,
            engine: deps.engine,
            cache: deps.cache,
            client: deps.client,
            bridge: deps.bridge,
            sink_factory: deps.sink_factory,
            ad_decision,
            resume_position: options.start_position,
            options,
            bus,
            state: PlaybackState::Idle,
            state_tx,
            ad: AdPhase::Idle,
            pending_cues,
            buffering: None,
            buffer_gate: None,
            perf: PerformanceCollector::new(),
            ready: false,
            content_loaded: false,
            element_consumed: false,
            captions: None,
            bandwidth_estimate: None,
            media_error_recoveries: 0,
            manifest_timeout_retries: 0,
            destroyed: false,
            abort: AbortToken::new(),
            completion_tx,
            completion_rx,
            command_tx,
            command_rx,
            media_events: None,
            engine_events: None,
            native_events: None,
        })
    }

    pub fn handle(&self) -> AdapterHandle {
        AdapterHandle {
            tx: self.command_tx.clone(),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PlaybackState> {
        self.state_tx.subscribe()
    }

    pub fn is_ad_active(&self) -> bool {
        !matches!(self.ad, AdPhase::Idle)
    }

    pub fn is_buffering(&self) -> bool {
        self.buffering.is_some()
    }

    /// Content position the next resume starts from
    pub fn resume_position(&self) -> f64 {
        self.resume_position
    }

    pub fn text_tracks(&self) -> &[TextTrack] {
        &self.options.text_tracks
    }

    pub fn audio_tracks(&self) -> Vec<AudioTrack> {
        self.engine.audio_tracks()
    }

    /// Transition to new state
    fn set_state(&mut self, new_state: PlaybackState) -> Result<()> {
        let current = self.state;
        if current == new_state {
            return Ok(());
        }
        if !current.can_transition_to(new_state) {
            return Err(Error::InvalidStateTransition {
                from: current.to_string(),
                to: new_state.to_string(),
            });
        }
        self.state = new_state;
        self.state_tx.send_replace(new_state);
        self.bus.emit(PlayerEvent::StateChanged {
            from: current,
            to: new_state,
        });
        info!(from = %current, to = %new_state, "State transition");
        Ok(())
    }

    fn transition(&mut self, new_state: PlaybackState) {
        if let Err(e) = self.set_state(new_state) {
            debug!(error = %e, "Ignoring state change");
        }
    }

    /// Ads play on the content element
    fn ads_share_element(&self) -> bool {
        self.ad_element.is_none() && self.bridge.is_none()
    }

    /// Start the session: a preroll pod when one is scheduled, otherwise content.
    /// A session without content (and not in ad-player mode) surfaces a setup
    /// error event rather than failing the call.
    #[instrument(skip(self), fields(session_id = %self.bus.session_id()))]
    pub async fn setup(&mut self) -> Result<()> {
        if self.destroyed {
            return Err(Error::Setup("session destroyed".into()));
        }
        info!(url = ?self.options.content_url.as_ref().map(Url::as_str), "Setting up session");
        self.perf.start(StartLoadType::Initial);
        self.media_events = Some(self.element.subscribe());
        self.engine_events = Some(self.engine.subscribe());
        if self.config.playback.ad_player_mode {
            self.native_events = self.bridge.as_ref().map(|b| b.subscribe());
        }

        let preroll = self.pending_cues.first().copied().filter(CuePoint::is_preroll);
        if let Some(cue) = preroll {
            self.pending_cues.remove(0);
            if self.ad_decision.is_some() {
                self.start_ad_break(cue);
                return Ok(());
            }
            warn!("Preroll scheduled without an ad decision endpoint");
        }

        if self.options.content_url.is_some() {
            if let Err(e) = self.load_content(false).await {
                self.fail(&e);
            }
        } else if self.config.playback.ad_player_mode {
            debug!("Ad player session waiting for ads");
        } else {
            self.fail(&Error::Setup("no media url".into()));
        }
        Ok(())
    }

    /// Load content at the resume position through the streaming engine
    async fn load_content(&mut self, after_ad: bool) -> Result<()> {
        let url = self
            .options
            .content_url
            .clone()
            .ok_or_else(|| Error::Setup("no media url".into()))?;
        self.perf.mark(Milestone::ContentLoadStart);
        let start_level = self.reconcile_level();
        self.start_buffering(if after_ad {
            BufferReason::AdResume
        } else {
            BufferReason::Startup
        });

        self.engine
            .load(LoadRequest {
                url,
                start_position: self.resume_position,
                start_level,
            })
            .await?;
        self.content_loaded = true;
        self.element_consumed = false;
        self.element.set_text_track(self.captions.as_deref());
        Ok(())
    }

    /// Point the engine's next load at the level the cache was filled from
    fn reconcile_level(&self) -> Option<usize> {
        let position = self.resume_position;
        let level = CONTENT_TRACKS
            .iter()
            .find_map(|track| self.cache.covering(*track, position).map(|m| m.level))
            .or_else(|| CONTENT_TRACKS.iter().find_map(|track| self.cache.last_level(*track)))?;
        if self.engine.next_load_level() != Some(level) {
            debug!(level, position, "Reconciling next load level with cached fragments");
            self.engine.set_next_load_level(level);
        }
        Some(level)
    }

    #[instrument(skip(self))]
    pub async fn play(&mut self) -> Result<()> {
        match &self.ad {
            AdPhase::Playing { handle, .. } => {
                handle.play();
                self.transition(PlaybackState::Playing);
                return Ok(());
            }
            AdPhase::Fetching { .. } => {
                self.transition(PlaybackState::Playing);
                return Ok(());
            }
            AdPhase::Idle => {}
        }
        if !self.content_loaded {
            debug!("Play before content is loaded");
            return Ok(());
        }
        if self.state == PlaybackState::Completed {
            self.element.seek(0.0);
        }
        self.element.play().await?;
        self.set_state(PlaybackState::Playing)?;
        self.bus.emit(PlayerEvent::Play);
        Ok(())
    }

    pub fn pause(&mut self) {
        match &self.ad {
            AdPhase::Playing { handle, .. } => handle.pause(),
            AdPhase::Fetching { .. } => {}
            AdPhase::Idle => {
                self.element.pause();
                if self.state == PlaybackState::Playing {
                    self.bus.emit(PlayerEvent::Pause);
                }
            }
        }
        self.transition(PlaybackState::Paused);
    }

    /// Seek content. Returns false when the seek was not applied: rejected
    /// while an ad pod is being fetched, ignored during an ad break.
    pub fn seek(&mut self, position: f64, reason: SeekReason) -> bool {
        match self.ad {
            AdPhase::Fetching { .. } => {
                info!(position, "Seek rejected while fetching an ad pod");
                return false;
            }
            AdPhase::Playing { .. } => {
                debug!(position, "Seek ignored during ad break");
                return false;
            }
            AdPhase::Idle => {}
        }
        if !self.content_loaded {
            return false;
        }

        let from = self.element.current_time();
        let to = match self.element.duration() {
            Some(duration) => position.clamp(0.0, duration),
            None => position.max(0.0),
        };
        info!(from, to, ?reason, "Seeking");
        self.bus.emit(PlayerEvent::Seek { from, to, reason });
        self.element.seek(to);

        // Jumping over cue points plays the last one skipped
        if reason == SeekReason::User && to > from {
            let crossed = self
                .pending_cues
                .iter()
                .take_while(|c| c.position <= to)
                .count();
            let skipped = self.pending_cues.drain(..crossed).last();
            if let Some(cue) = skipped {
                info!(cue = cue.position, "Seek crossed a cue point");
                self.start_ad_break(cue);
                return true;
            }
        }

        if !self.element.buffered().contains(to) {
            self.start_buffering(BufferReason::Seek);
        }
        true
    }

    /// Enter buffering. Repeated calls while buffering are no-ops.
    pub fn start_buffering(&mut self, reason: BufferReason) {
        if self.buffering.is_some() {
            return;
        }
        self.buffering = Some(reason);
        debug!(?reason, "Buffering started");
        self.bus.emit(PlayerEvent::BufferStart { reason });

        let threshold = match reason {
            BufferReason::Startup | BufferReason::AdResume => self.config.buffering.startup_min_buffer,
            BufferReason::Rebuffer | BufferReason::Seek => self.config.buffering.rebuffer_min_buffer,
        };
        if let Some(threshold) = threshold {
            self.buffer_gate = Some(BufferGate {
                threshold,
                deadline: Instant::now() + self.config.buffering.buffer_level_timeout(),
            });
            self.element.set_playback_rate(0.0);
            self.bus.emit(PlayerEvent::PlaybackRate { rate: 0.0 });
            self.check_buffer_level();
        }
    }

    /// Leave buffering. No-op when not buffering or while a buffer-level gate
    /// is still pending.
    pub fn stop_buffering(&mut self) {
        if self.buffer_gate.is_some() {
            return;
        }
        if let Some(reason) = self.buffering.take() {
            debug!(?reason, "Buffering ended");
            self.bus.emit(PlayerEvent::BufferEnd { reason });
        }
    }

    /// Release a pending buffer-level gate once enough media is buffered ahead
    /// or its timeout has passed. Returns true when this call released it.
    pub fn check_buffer_level(&mut self) -> bool {
        let Some(gate) = self.buffer_gate else {
            return false;
        };
        let ahead = self
            .element
            .buffered()
            .length_ahead(self.element.current_time());
        let timed_out = Instant::now() >= gate.deadline;
        if ahead < gate.threshold && !timed_out {
            trace!(ahead, threshold = gate.threshold, "Waiting for buffer level");
            return false;
        }

        self.buffer_gate = None;
        info!(ahead, threshold = gate.threshold, timed_out, "Buffer level reached");
        self.element.set_playback_rate(1.0);
        self.bus.emit(PlayerEvent::PlaybackRate { rate: 1.0 });
        self.stop_buffering();
        true
    }

    fn resume_load_type(&self) -> StartLoadType {
        if !self.content_loaded {
            StartLoadType::Initial
        } else if self.config.playback.reuse_element_after_ads && !self.element_consumed {
            StartLoadType::Reattach
        } else {
            StartLoadType::Reload
        }
    }

    /// Bring content back after an ad pod ends, empties or fails to fetch.
    /// Re-attaches the existing element when it still holds content (and
    /// reuse is enabled), otherwise reloads through the engine. A requested
    /// re-attach that is not possible becomes a reload.
    #[instrument(skip(self), fields(session_id = %self.bus.session_id()))]
    pub async fn resume(
        &mut self,
        after_ad: bool,
        from_preroll: bool,
        load_type: StartLoadType,
        force_discontinue: bool,
    ) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        let reusable = self.content_loaded
            && !self.element_consumed
            && !force_discontinue
            && self.config.playback.reuse_element_after_ads;
        let load_type = match load_type {
            StartLoadType::Reattach if !reusable => StartLoadType::Reload,
            other => other,
        };
        info!(after_ad, from_preroll, ?load_type, position = self.resume_position, "Resuming content");
        self.bus.emit(PlayerEvent::ContentResume {
            after_ad,
            from_preroll,
            load_type,
        });

        if self.options.content_url.is_none() {
            info!("Ad-only session finished");
            self.transition(PlaybackState::Completed);
            self.bus.emit(PlayerEvent::Complete);
            return Ok(());
        }

        if load_type == StartLoadType::Retry {
            self.perf.start(StartLoadType::Retry);
        }
        if load_type == StartLoadType::Reattach {
            self.reconcile_level();
        } else {
            self.load_content(after_ad).await?;
        }

        if self.state != PlaybackState::Paused {
            self.element.play().await?;
            self.transition(PlaybackState::Playing);
        }
        Ok(())
    }

    async fn resume_or_fail(&mut self, after_ad: bool, from_preroll: bool) {
        let load_type = self.resume_load_type();
        if let Err(e) = self.resume(after_ad, from_preroll, load_type, false).await {
            self.fail(&e);
        }
    }

    /// Fetch the pod for `cue` in the background
    fn start_ad_break(&mut self, cue: CuePoint) {
        let Some(decision) = self.ad_decision.clone() else {
            warn!(cue = cue.position, "No ad decision endpoint, skipping cue point");
            return;
        };
        let from_preroll = cue.is_preroll();
        if self.content_loaded {
            self.resume_position = self.element.current_time();
            self.element.pause();
        }

        info!(cue = cue.position, "Fetching ad pod");
        self.bus.emit(PlayerEvent::AdPodFetch {
            position: cue.position,
        });
        self.perf.mark(Milestone::AdPodFetchStart);

        let abort = self.abort.child();
        let fetch_abort = abort.clone();
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = decision.fetch_pod(cue.position, &fetch_abort).await;
            let _ = tx.send(Completion::AdPodFetched(result));
        });
        self.ad = AdPhase::Fetching {
            abort,
            from_preroll,
        };
    }

    async fn on_pod_fetched(&mut self, result: Result<Vec<Ad>>) {
        let AdPhase::Fetching { from_preroll, .. } = self.ad else {
            debug!("Dropping stale ad pod fetch");
            return;
        };
        self.ad = AdPhase::Idle;
        self.perf.mark(Milestone::AdPodFetchEnd);
        match result {
            Ok(ads) => {
                self.bus
                    .emit(PlayerEvent::AdPodFetchSuccess { count: ads.len() });
                self.begin_ad_pod(ads, from_preroll);
            }
            Err(e) => {
                warn!(error = %e, "Ad pod fetch failed, resuming content");
                self.bus.emit(PlayerEvent::AdPodFetchError {
                    message: e.to_string(),
                });
                self.resume_or_fail(false, from_preroll).await;
            }
        }
    }

    /// Play a pod the host already holds. Returns false while another break
    /// is in progress.
    pub fn play_ads(&mut self, ads: Vec<Ad>) -> bool {
        if self.destroyed || self.is_ad_active() {
            return false;
        }
        if self.content_loaded {
            self.resume_position = self.element.current_time();
            self.element.pause();
        }
        let from_preroll = !self.content_loaded;
        self.begin_ad_pod(ads, from_preroll);
        true
    }

    fn begin_ad_pod(&mut self, ads: Vec<Ad>, from_preroll: bool) {
        self.perf.mark(Milestone::AdBreakStart);
        self.cache.purge_before(self.resume_position);
        if self.ads_share_element() && self.content_loaded {
            debug!("Detaching content for ads on the shared element");
            self.engine.detach();
            self.element_consumed = true;
        }

        let backend = AdBackend {
            client: self.client.clone(),
            redundancy: self.config.redundancy.clone(),
            element: self
                .ad_element
                .clone()
                .unwrap_or_else(|| Arc::clone(&self.element)),
            bridge: self.bridge.clone(),
            sink_factory: Arc::clone(&self.sink_factory),
        };
        let mut player = AdPlayer::new(self.config.ads.clone(), backend, self.bus.clone())
            .with_bandwidth_estimate(self.engine.bandwidth_estimate().or(self.bandwidth_estimate));
        let handle = player.handle();
        if self.state == PlaybackState::Paused {
            handle.pause();
        }

        let tx = self.completion_tx.clone();
        let task = tokio::spawn(async move {
            let summary = player.play_ad_response(ads).await;
            let _ = tx.send(Completion::AdPodFinished {
                summary,
                bandwidth_estimate: player.bandwidth_estimate(),
            });
        });
        if self.state == PlaybackState::Idle {
            self.transition(PlaybackState::Playing);
        }
        self.ad = AdPhase::Playing {
            handle,
            task,
            from_preroll,
        };
    }

    async fn on_pod_finished(&mut self, summary: PodSummary, bandwidth_estimate: Option<u64>) {
        let AdPhase::Playing { from_preroll, .. } = self.ad else {
            return;
        };
        self.ad = AdPhase::Idle;
        self.perf.mark(Milestone::AdBreakEnd);
        if self.ads_share_element() {
            // Drop element events still queued from the break
            self.media_events = Some(self.element.subscribe());
        }
        if bandwidth_estimate.is_some() {
            self.bandwidth_estimate = bandwidth_estimate;
        }
        self.resume_or_fail(summary.pod_size > 0, from_preroll).await;
    }

    fn check_cue_points(&mut self, position: f64) {
        if self.is_ad_active() {
            return;
        }
        let due = self
            .pending_cues
            .iter()
            .take_while(|c| c.position <= position)
            .count();
        let cue = self.pending_cues.drain(..due).last();
        if let Some(cue) = cue {
            self.start_ad_break(cue);
        }
    }

    fn report_startup(&mut self) {
        if let Some(timeline) = self.perf.finish() {
            self.bus.emit(PlayerEvent::StartupTimeline(timeline));
        }
    }

    async fn on_media_event(&mut self, event: MediaEvent) {
        if matches!(self.ad, AdPhase::Playing { .. }) && self.ads_share_element() {
            trace!(?event, "Element event belongs to the ad break");
            return;
        }
        self.perf.observe_media(&event);
        self.report_startup();

        match event {
            MediaEvent::LoadedMetadata { duration } => debug!(duration, "Content metadata loaded"),
            MediaEvent::CanPlay => {
                if !self.ready {
                    self.ready = true;
                    self.bus.emit(PlayerEvent::Ready);
                }
                self.check_buffer_level();
            }
            MediaEvent::Playing => {
                self.stop_buffering();
                if self.state != PlaybackState::Paused {
                    self.transition(PlaybackState::Playing);
                }
            }
            MediaEvent::Waiting => {
                if self.state == PlaybackState::Playing {
                    self.start_buffering(BufferReason::Rebuffer);
                }
            }
            MediaEvent::Progress => {
                self.check_buffer_level();
            }
            MediaEvent::TimeUpdate { position } => {
                self.bus.emit(PlayerEvent::Time {
                    position,
                    duration: self.element.duration(),
                });
                self.check_buffer_level();
                self.check_cue_points(position);
            }
            MediaEvent::Seeked { position } => {
                self.bus.emit(PlayerEvent::Seeked { position });
                if self.element.buffered().contains(position) {
                    self.stop_buffering();
                }
            }
            MediaEvent::Pause => {}
            MediaEvent::Ended => {
                self.stop_buffering();
                self.transition(PlaybackState::Completed);
                self.bus.emit(PlayerEvent::Complete);
            }
            MediaEvent::Error { code, message } => {
                warn!(code, message = %message, "Content element error");
                self.on_engine_error(EngineErrorDetails::Media(message), true)
                    .await;
            }
        }
    }

    async fn on_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::ManifestLoaded { levels } => {
                debug!(levels = levels.len(), "Content manifest loaded");
            }
            EngineEvent::FragmentLoaded(entry) => {
                trace!(level = entry.meta.level, sn = ?entry.meta.sn, "Caching content fragment");
                self.cache.append(entry);
            }
            EngineEvent::LevelSwitched { level } => debug!(level, "Content level switched"),
            EngineEvent::Error { details, fatal } => self.on_engine_error(details, fatal).await,
        }
    }

    fn emit_error(&self, error: &Error, fatal: bool) {
        self.bus.emit(PlayerEvent::Error {
            kind: error.kind(),
            code: error.error_code().to_string(),
            message: error.to_string(),
            fatal,
        });
    }

    /// Bounded recovery per failure class; anything past its bound is fatal
    async fn on_engine_error(&mut self, details: EngineErrorDetails, fatal: bool) {
        let url = self
            .options
            .content_url
            .as_ref()
            .map(Url::to_string)
            .unwrap_or_default();
        let error = details.to_error(&url);
        if !fatal || details == EngineErrorDetails::BufferHole {
            warn!(error = %error, "Non-fatal content error");
            self.emit_error(&error, false);
            return;
        }

        let max_recoveries = self.config.playback.max_media_error_recoveries;
        let max_timeout_retries = self.config.playback.max_manifest_timeout_retries;
        match details {
            EngineErrorDetails::Media(_) if self.media_error_recoveries < max_recoveries =>
            {
                self.media_error_recoveries += 1;
                warn!(attempt = self.media_error_recoveries, error = %error, "Recovering from media error");
                self.emit_error(&error, false);
                self.engine.recover_media_error();
            }
            EngineErrorDetails::ManifestTimeout
                if self.manifest_timeout_retries < max_timeout_retries =>
            {
                self.manifest_timeout_retries += 1;
                warn!(attempt = self.manifest_timeout_retries, "Retrying content after manifest timeout");
                self.emit_error(&error, false);
                if let Err(e) = self
                    .resume(false, false, StartLoadType::Retry, true)
                    .await
                {
                    self.fail(&e);
                }
            }
            _ => self.fail(&error),
        }
    }

    fn fail(&mut self, error: &Error) {
        error!(error = %error, kind = %error.kind(), "Fatal session error");
        self.buffer_gate = None;
        self.emit_error(error, true);
        self.transition(PlaybackState::Errored);
    }

    /// Show a caption track by id, or hide captions
    pub fn set_captions(&mut self, track: Option<&str>) -> Result<()> {
        if let Some(id) = track {
            if !self.options.text_tracks.iter().any(|t| t.id == id) {
                return Err(Error::UnknownTrack {
                    kind: "text",
                    id: id.to_string(),
                });
            }
        }
        self.captions = track.map(str::to_string);
        self.element.set_text_track(track);
        self.bus.emit(PlayerEvent::CaptionsChanged {
            track: self.captions.clone(),
        });
        Ok(())
    }

    pub fn set_audio_track(&mut self, id: usize) -> Result<()> {
        if !self.engine.audio_tracks().iter().any(|t| t.id == id) {
            return Err(Error::UnknownTrack {
                kind: "audio",
                id: id.to_string(),
            });
        }
        self.engine.set_audio_track(id)?;
        self.bus.emit(PlayerEvent::AudioTrackChanged { track: id });
        Ok(())
    }

    /// Tear the session down. Idempotent.
    #[instrument(skip(self), fields(session_id = %self.bus.session_id()))]
    pub async fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        info!("Destroying session");
        self.abort.abort();
        match std::mem::replace(&mut self.ad, AdPhase::Idle) {
            AdPhase::Playing { handle, task, .. } => {
                handle.remove();
                if let Err(e) = task.await {
                    warn!(error = %e, "Ad pod task failed");
                }
            }
            AdPhase::Fetching { abort, .. } => abort.abort(),
            AdPhase::Idle => {}
        }

        self.buffer_gate = None;
        self.engine.detach();
        self.element.pause();
        self.element.detach();
        self.media_events = None;
        self.engine_events = None;
        self.native_events = None;
        self.transition(PlaybackState::Destroyed);
        self.bus.emit(PlayerEvent::Destroyed);
    }

    async fn on_command(&mut self, command: AdapterCommand) {
        match command {
            AdapterCommand::Play => {
                if let Err(e) = self.play().await {
                    warn!(error = %e, "Play failed");
                }
            }
            AdapterCommand::Pause => self.pause(),
            AdapterCommand::Seek { position, reason } => {
                self.seek(position, reason);
            }
            AdapterCommand::SetCaptions(track) => {
                if let Err(e) = self.set_captions(track.as_deref()) {
                    warn!(error = %e, "Caption change rejected");
                }
            }
            AdapterCommand::SetAudioTrack(id) => {
                if let Err(e) = self.set_audio_track(id) {
                    warn!(error = %e, "Audio track change rejected");
                }
            }
            AdapterCommand::Destroy => self.destroy().await,
        }
    }

    /// Handle one input. Returns false once the session is destroyed.
    pub async fn step(&mut self) -> bool {
        if self.destroyed {
            return false;
        }
        let gate_deadline = self.buffer_gate.map(|g| g.deadline);
        let input = tokio::select! {
            biased;
            Some(done) = self.completion_rx.recv() => Input::Completion(done),
            Some(command) = self.command_rx.recv() => Input::Command(command),
            _ = tokio::time::sleep_until(gate_deadline.unwrap_or_else(Instant::now)), if gate_deadline.is_some() => Input::GateTimeout,
            event = next_broadcast(&mut self.media_events) => Input::Media(event),
            event = next_broadcast(&mut self.engine_events) => Input::Engine(event),
            event = next_broadcast(&mut self.native_events) => Input::Native(event),
            else => return false,
        };

        match input {
            Input::Completion(Completion::AdPodFetched(result)) => self.on_pod_fetched(result).await,
            Input::Completion(Completion::AdPodFinished {
                summary,
                bandwidth_estimate,
            }) => self.on_pod_finished(summary, bandwidth_estimate).await,
            Input::Command(command) => self.on_command(command).await,
            Input::GateTimeout => {
                self.check_buffer_level();
            }
            Input::Media(Some(event)) => self.on_media_event(event).await,
            Input::Media(None) => self.media_events = None,
            Input::Engine(Some(event)) => self.on_engine_event(event).await,
            Input::Engine(None) => self.engine_events = None,
            Input::Native(Some(event)) => {
                self.perf.observe_native(&event);
                self.report_startup();
            }
            Input::Native(None) => self.native_events = None,
        }
        !self.destroyed
    }

    /// Drive the session until it is destroyed
    pub async fn run(&mut self) {
        while self.step().await {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::TransportConfig,
        headless::HeadlessElement,
        host::MediaSource,
        pipeline::{BufferSink, MemorySink},
        transport::Transport,
        types::{Level, SessionId},
    };
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Attaches content to the element with a fixed duration; buffers nothing
    struct BareEngine {
        element: Arc<HeadlessElement>,
        events: broadcast::Sender<EngineEvent>,
        loads: AtomicUsize,
        recoveries: AtomicUsize,
    }

    #[async_trait]
    impl StreamingEngine for BareEngine {
        async fn load(&self, request: LoadRequest) -> Result<()> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.element.attach(MediaSource::Url {
                url: request.url,
                duration: None,
            })?;
            self.element.set_duration(60.0);
            Ok(())
        }
        fn levels(&self) -> Vec<Level> {
            Vec::new()
        }
        fn next_load_level(&self) -> Option<usize> {
            None
        }
        fn set_next_load_level(&self, _level: usize) {}
        fn bandwidth_estimate(&self) -> Option<u64> {
            None
        }
        fn recover_media_error(&self) {
            self.recoveries.fetch_add(1, Ordering::SeqCst);
        }
        fn audio_tracks(&self) -> Vec<AudioTrack> {
            vec![AudioTrack {
                id: 0,
                language: Some("en".into()),
                name: "English".into(),
                default: true,
            }]
        }
        fn set_audio_track(&self, _id: usize) -> Result<()> {
            Ok(())
        }
        fn detach(&self) {
            self.element.detach();
        }
        fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
            self.events.subscribe()
        }
    }

    /// Never answers
    struct SilentTransport;

    #[async_trait]
    impl Transport for SilentTransport {
        async fn send(&self, _url: &Url) -> Result<(u16, Bytes)> {
            std::future::pending().await
        }
    }

    fn adapter(config: EngineConfig, options: SessionOptions) -> (PlaybackAdapter, Arc<HeadlessElement>) {
        let (adapter, element, _) = adapter_with_engine(config, options);
        (adapter, element)
    }

    fn adapter_with_engine(
        config: EngineConfig,
        options: SessionOptions,
    ) -> (PlaybackAdapter, Arc<HeadlessElement>, Arc<BareEngine>) {
        let element = Arc::new(HeadlessElement::new());
        let engine = Arc::new(BareEngine {
            element: element.clone(),
            events: broadcast::channel(16).0,
            loads: AtomicUsize::new(0),
            recoveries: AtomicUsize::new(0),
        });
        let deps = AdapterDeps {
            client: HttpClient::new(Arc::new(SilentTransport), &TransportConfig::default()),
            cache: Arc::new(FragmentCache::new(config.fragment_cache.clone())),
            config,
            element: element.clone(),
            ad_element: None,
            engine: engine.clone(),
            bridge: None,
            sink_factory: Arc::new(|| Arc::new(MemorySink::new()) as Arc<dyn BufferSink>),
        };
        let adapter =
            PlaybackAdapter::new(deps, options, EventBus::new(SessionId::new())).unwrap();
        (adapter, element, engine)
    }

    fn content() -> SessionOptions {
        SessionOptions {
            content_url: Some(Url::parse("https://cdn.test/content/master.m3u8").unwrap()),
            ..SessionOptions::default()
        }
    }

    fn gated(seconds: f64) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.buffering.startup_min_buffer = Some(seconds);
        config
    }

    fn rates(events: &[PlayerEvent]) -> Vec<f64> {
        events
            .iter()
            .filter_map(|e| match e {
                PlayerEvent::PlaybackRate { rate } => Some(*rate),
                _ => None,
            })
            .collect()
    }

    /// `fatal` flag of every error event, in order
    fn error_fatality(events: &[PlayerEvent]) -> Vec<bool> {
        events
            .iter()
            .filter_map(|e| match e {
                PlayerEvent::Error { fatal, .. } => Some(*fatal),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_media_error_recovery_is_bounded() {
        let (mut adapter, _, engine) = adapter_with_engine(EngineConfig::default(), content());
        adapter.setup().await.unwrap();
        let mut sub = adapter.bus().subscribe();

        for _ in 0..3 {
            adapter
                .on_engine_error(EngineErrorDetails::Media("decode".into()), true)
                .await;
            assert_ne!(adapter.state(), PlaybackState::Errored);
        }
        assert_eq!(engine.recoveries.load(Ordering::SeqCst), 3);

        adapter
            .on_engine_error(EngineErrorDetails::Media("decode".into()), true)
            .await;
        assert_eq!(engine.recoveries.load(Ordering::SeqCst), 3);
        assert_eq!(adapter.state(), PlaybackState::Errored);
        assert_eq!(error_fatality(&sub.drain()), vec![false, false, false, true]);
    }

    #[tokio::test]
    async fn test_manifest_timeout_retried_once() {
        let (mut adapter, _, engine) = adapter_with_engine(EngineConfig::default(), content());
        adapter.setup().await.unwrap();
        let mut sub = adapter.bus().subscribe();
        assert_eq!(engine.loads.load(Ordering::SeqCst), 1);
        let attempt = adapter.perf.attempt();

        adapter
            .on_engine_error(EngineErrorDetails::ManifestTimeout, true)
            .await;
        assert_eq!(engine.loads.load(Ordering::SeqCst), 2);
        assert_eq!(adapter.perf.attempt(), attempt + 1);
        assert_eq!(adapter.state(), PlaybackState::Playing);
        let events = sub.drain();
        assert!(events.contains(&PlayerEvent::ContentResume {
            after_ad: false,
            from_preroll: false,
            load_type: StartLoadType::Retry,
        }));
        assert_eq!(error_fatality(&events), vec![false]);

        adapter
            .on_engine_error(EngineErrorDetails::ManifestTimeout, true)
            .await;
        assert_eq!(engine.loads.load(Ordering::SeqCst), 2);
        assert_eq!(adapter.state(), PlaybackState::Errored);
        assert_eq!(error_fatality(&sub.drain()), vec![true]);
    }

    #[tokio::test]
    async fn test_buffer_hole_never_fatal() {
        let (mut adapter, _, engine) = adapter_with_engine(EngineConfig::default(), content());
        adapter.setup().await.unwrap();
        let mut sub = adapter.bus().subscribe();

        for _ in 0..5 {
            adapter
                .on_engine_error(EngineErrorDetails::BufferHole, true)
                .await;
        }
        assert_ne!(adapter.state(), PlaybackState::Errored);
        assert_eq!(engine.recoveries.load(Ordering::SeqCst), 0);
        assert_eq!(error_fatality(&sub.drain()), vec![false; 5]);
    }

    #[tokio::test]
    async fn test_buffer_gate_releases_once() {
        let (mut adapter, element) = adapter(gated(4.0), content());
        let mut sub = adapter.bus().subscribe();
        adapter.setup().await.unwrap();
        assert_eq!(element.playback_rate(), 0.0);
        assert!(adapter.is_buffering());

        element.set_buffered(vec![(0.0, 2.0)]);
        assert!(!adapter.check_buffer_level());
        assert_eq!(element.playback_rate(), 0.0);

        element.set_buffered(vec![(0.0, 4.0)]);
        assert!(adapter.check_buffer_level());
        element.set_buffered(vec![(0.0, 6.0)]);
        assert!(!adapter.check_buffer_level());

        assert_eq!(element.playback_rate(), 1.0);
        let events = sub.drain();
        assert_eq!(rates(&events), vec![0.0, 1.0]);
        assert_eq!(events.iter().filter(|e| e.name() == "bufferEnd").count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_gate_times_out() {
        let (mut adapter, element) = adapter(gated(4.0), content());
        let mut sub = adapter.bus().subscribe();
        adapter.setup().await.unwrap();

        let _ = tokio::time::timeout(Duration::from_secs(6), adapter.run()).await;
        assert_eq!(element.playback_rate(), 1.0);
        assert!(!adapter.is_buffering());
        assert_eq!(rates(&sub.drain()), vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn test_buffering_is_idempotent() {
        let (mut adapter, _) = adapter(EngineConfig::default(), content());
        let mut sub = adapter.bus().subscribe();
        adapter.start_buffering(BufferReason::Rebuffer);
        adapter.start_buffering(BufferReason::Rebuffer);
        adapter.stop_buffering();
        adapter.stop_buffering();
        let names: Vec<_> = sub.drain().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["bufferStart", "bufferEnd"]);
    }

    #[tokio::test]
    async fn test_setup_without_url_reports_error() {
        let (mut adapter, _) = adapter(EngineConfig::default(), SessionOptions::default());
        let mut sub = adapter.bus().subscribe();
        adapter.setup().await.unwrap();
        assert_eq!(adapter.state(), PlaybackState::Errored);
        assert!(sub.drain().iter().any(|e| matches!(
            e,
            PlayerEvent::Error {
                kind: crate::ErrorKind::SetupError,
                fatal: true,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_seek_rejected_while_fetching_pod() {
        let mut config = EngineConfig::default();
        config.ads.ad_decision_url = Some("https://ads.test/pod".into());
        let mut options = content();
        options.cue_points = vec![CuePoint { position: 0.0 }];
        let (mut adapter, _) = adapter(config, options);

        adapter.setup().await.unwrap();
        assert!(adapter.is_ad_active());
        assert!(!adapter.seek(30.0, SeekReason::User));
    }

    #[tokio::test]
    async fn test_tracks() {
        let mut options = content();
        options.text_tracks = vec![TextTrack {
            id: "en".into(),
            language: "en".into(),
            label: "English".into(),
            url: None,
        }];
        let (mut adapter, element) = adapter(EngineConfig::default(), options);
        adapter.setup().await.unwrap();

        assert!(adapter.set_captions(Some("fr")).is_err());
        adapter.set_captions(Some("en")).unwrap();
        assert_eq!(element.text_track().as_deref(), Some("en"));
        adapter.set_captions(None).unwrap();
        assert_eq!(element.text_track(), None);

        assert!(adapter.set_audio_track(0).is_ok());
        assert!(matches!(
            adapter.set_audio_track(7),
            Err(Error::UnknownTrack { kind: "audio", .. })
        ));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (mut adapter, element) = adapter(EngineConfig::default(), content());
        let mut sub = adapter.bus().subscribe();
        adapter.setup().await.unwrap();
        adapter.destroy().await;
        adapter.destroy().await;

        assert_eq!(adapter.state(), PlaybackState::Destroyed);
        assert!(!element.has_source());
        assert!(!adapter.step().await);
        let events = sub.drain();
        assert_eq!(events.iter().filter(|e| e.name() == "destroyed").count(), 1);
    }
}
