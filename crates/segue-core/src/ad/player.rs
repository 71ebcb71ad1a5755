//! Ad pod player
//!
//! Plays the creatives of one pod in order. Each creative is loaded, watched by
//! the stall manager and the health checker, and settles as completed or
//! skipped. A pod always terminates: errors skip and advance, stall retries are
//! bounded, and exactly one `AdPodComplete` (or `AdPodEmpty`) is emitted.

use super::creative::{AdBackend, CreativeEvent, CreativePlayer};
use super::model::{Ad, AdPlaybackState, AdPod};
use super::tracking::{AdTracker, QuartileTracker};
use crate::{
    config::AdConfig,
    error::VastErrorCode,
    events::{EventBus, PlayerEvent, PodSummary, Quartile, SkipReason},
    health::{HealthChecker, PlaybackProbe},
    stall::{StallDecision, StallKind, StallManager, StallSnapshot},
    transport::AbortToken,
    Error,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

/// Host command for a running pod
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdCommand {
    Play,
    Pause,
    Click,
    Remove,
}

/// Controls a running [`AdPlayer`] from outside its task
#[derive(Clone)]
pub struct AdPlayerHandle {
    tx: mpsc::UnboundedSender<AdCommand>,
    removed: Arc<AtomicBool>,
}

impl AdPlayerHandle {
    fn send(&self, command: AdCommand) {
        if self.tx.send(command).is_err() {
            debug!(?command, "Ad player already finished");
        }
    }

    pub fn play(&self) {
        self.send(AdCommand::Play);
    }

    pub fn pause(&self) {
        self.send(AdCommand::Pause);
    }

    pub fn click(&self) {
        self.send(AdCommand::Click);
    }

    /// Discontinue the pod. Only the first call has an effect.
    pub fn remove(&self) {
        if !self.removed.swap(true, Ordering::SeqCst) {
            self.send(AdCommand::Remove);
        }
    }
}

/// How one creative settled
#[derive(Debug)]
enum CreativeOutcome {
    Completed,
    Skipped {
        reason: SkipReason,
        code: VastErrorCode,
        error: Option<Error>,
    },
    Removed,
}

impl CreativeOutcome {
    fn failed(error: Error) -> Self {
        CreativeOutcome::Skipped {
            reason: SkipReason::Error,
            code: error.vast_code(),
            error: Some(error),
        }
    }
}

/// Result of one load of a creative
enum Attempt {
    Settled(CreativeOutcome),
    /// Reload the same creative
    Reload,
}

enum Input {
    Command(Option<AdCommand>),
    Creative(Option<CreativeEvent>),
    StallCheck,
    HealthSample,
}

/// Plays ad pods
pub struct AdPlayer {
    config: AdConfig,
    backend: AdBackend,
    bus: EventBus,
    tracker: AdTracker,
    stall: StallManager,
    tx: mpsc::UnboundedSender<AdCommand>,
    commands: mpsc::UnboundedReceiver<AdCommand>,
    removed_flag: Arc<AtomicBool>,
    abort: AbortToken,
    /// Child of `abort`, replaced at the start of every pod
    pod_abort: AbortToken,
    bandwidth_estimate: Option<u64>,
    removed: bool,
    paused: bool,
    paused_since: Option<Instant>,
    paused_total: Duration,
    last_pod: Option<AdPod>,
}

impl AdPlayer {
    pub fn new(config: AdConfig, backend: AdBackend, bus: EventBus) -> Self {
        let (tx, commands) = mpsc::unbounded_channel();
        Self {
            stall: StallManager::from_config(&config),
            tracker: AdTracker::new(backend.client.clone()),
            config,
            backend,
            bus,
            tx,
            commands,
            removed_flag: Arc::new(AtomicBool::new(false)),
            pod_abort: AbortToken::new(),
            abort: AbortToken::new(),
            bandwidth_estimate: None,
            removed: false,
            paused: false,
            paused_since: None,
            paused_total: Duration::ZERO,
            last_pod: None,
        }
    }

    /// Seed level selection for HLS creatives
    pub fn with_bandwidth_estimate(mut self, estimate: Option<u64>) -> Self {
        self.bandwidth_estimate = estimate;
        self
    }

    pub fn handle(&self) -> AdPlayerHandle {
        AdPlayerHandle {
            tx: self.tx.clone(),
            removed: Arc::clone(&self.removed_flag),
        }
    }

    /// Latest estimate, updated from HLS creative downloads
    pub fn bandwidth_estimate(&self) -> Option<u64> {
        self.bandwidth_estimate
    }

    /// The most recently played pod
    pub fn pod(&self) -> Option<&AdPod> {
        self.last_pod.as_ref()
    }

    /// Play every creative of `ads` and report the pod outcome
    #[instrument(skip_all, fields(session_id = %self.bus.session_id(), pod_size = ads.len()))]
    pub async fn play_ad_response(&mut self, ads: Vec<Ad>) -> PodSummary {
        let started = Instant::now();
        self.begin_pod();
        if ads.is_empty() {
            info!("Empty ad pod");
            self.bus.emit(PlayerEvent::AdPodEmpty);
            return PodSummary::default();
        }

        let mut pod = AdPod::new(ads);
        while !pod.is_done() {
            if self.removed {
                pod.abandon();
                break;
            }
            let Some(ad) = pod.current().cloned() else {
                break;
            };
            let sequence = pod.sequence();
            let count = pod.len();
            let outcome = match pod.current_state_mut() {
                Some(state) => self.play_creative(&ad, state, sequence, count).await,
                None => break,
            };

            match outcome {
                CreativeOutcome::Completed => pod.complete_current(),
                CreativeOutcome::Skipped {
                    reason,
                    code,
                    error,
                } => {
                    if let Some(error) = error {
                        warn!(ad_id = %ad.id, error = %error, "Creative failed");
                        self.bus.emit(PlayerEvent::AdError {
                            ad_id: ad.id.clone(),
                            code: error.error_code().to_string(),
                            message: error.to_string(),
                        });
                    }
                    self.tracker.error(&ad, code);
                    self.bus.emit(PlayerEvent::AdDiscontinue {
                        ad_id: ad.id.clone(),
                        reason,
                    });
                    pod.fail_current(reason);
                }
                CreativeOutcome::Removed => {
                    self.bus.emit(PlayerEvent::AdDiscontinue {
                        ad_id: ad.id.clone(),
                        reason: SkipReason::Removed,
                    });
                    pod.abandon();
                }
            }
        }

        if let Some(since) = self.paused_since.take() {
            self.paused_total += since.elapsed();
        }
        let summary = pod.summary(started.elapsed(), self.paused_total);
        info!(
            success = summary.success_count,
            failure = summary.failure_count,
            total = summary.total_duration,
            "Ad pod complete"
        );
        self.bus.emit(PlayerEvent::AdPodComplete(summary.clone()));
        self.pod_abort.abort();
        self.last_pod = Some(pod);
        summary
    }

    /// Clear what the previous pod left behind
    fn begin_pod(&mut self) {
        self.pod_abort = self.abort.child();
        self.removed = false;
        self.removed_flag.store(false, Ordering::SeqCst);
        self.paused = false;
        self.paused_since = None;
        self.paused_total = Duration::ZERO;
        while let Ok(command) = self.commands.try_recv() {
            debug!(?command, "Dropping command left from previous pod");
        }
    }

    async fn play_creative(
        &mut self,
        ad: &Ad,
        state: &mut AdPlaybackState,
        sequence: usize,
        count: usize,
    ) -> CreativeOutcome {
        let mut quartiles = QuartileTracker::new();
        loop {
            let mut creative = CreativePlayer::new(ad, &self.backend, self.pod_abort.child());
            let attempt = self
                .run_attempt(&mut creative, ad, state, &mut quartiles, sequence, count)
                .await;
            creative.remove().await;

            if let Some(bps) = creative.pipeline_report().and_then(|r| r.throughput_bps()) {
                debug!(bps, "Updated bandwidth estimate from creative");
                self.bandwidth_estimate = Some(bps);
            }

            match attempt {
                Attempt::Settled(outcome) => return outcome,
                Attempt::Reload => info!(ad_id = %ad.id, "Reloading creative"),
            }
        }
    }

    fn probe(creative: &CreativePlayer, ad: &Ad) -> PlaybackProbe {
        PlaybackProbe {
            position: creative.position(),
            buffered_end: creative.buffered().end().unwrap_or(0.0),
            duration: creative.duration().filter(|d| *d > 0.0).or(Some(ad.duration)),
        }
    }

    fn fire_quartiles(&self, ad: &Ad, fired: Vec<Quartile>) {
        for quartile in fired {
            self.tracker.quartile(ad, quartile);
            self.bus.emit(PlayerEvent::AdQuartile {
                ad_id: ad.id.clone(),
                quartile,
            });
        }
    }

    async fn run_attempt(
        &mut self,
        creative: &mut CreativePlayer,
        ad: &Ad,
        state: &mut AdPlaybackState,
        quartiles: &mut QuartileTracker,
        sequence: usize,
        count: usize,
    ) -> Attempt {
        if let Err(e) = creative.load(self.bandwidth_estimate).await {
            return Attempt::Settled(CreativeOutcome::failed(e));
        }
        if !state.ad_start_fired {
            state.ad_start_fired = true;
            self.bus.emit(PlayerEvent::AdStart {
                ad_id: ad.id.clone(),
                sequence,
                count,
            });
        }
        if !self.paused {
            if let Err(e) = creative.play().await {
                return Attempt::Settled(CreativeOutcome::failed(e));
            }
        }

        let start_position = creative.position();
        let interval = self.config.health_interval();
        let mut health = HealthChecker::new(self.config.health_score_threshold, interval);
        let mut health_timer = tokio::time::interval_at(Instant::now() + interval, interval);
        health_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stall_deadline = Instant::now() + self.stall.timeout();
        let mut stall_checked = false;
        let mut buffering = false;

        loop {
            let input = tokio::select! {
                biased;
                command = self.commands.recv() => Input::Command(command),
                event = creative.next_event() => Input::Creative(event),
                _ = tokio::time::sleep_until(stall_deadline), if !stall_checked => Input::StallCheck,
                _ = health_timer.tick(), if self.config.health_enabled && !self.paused => Input::HealthSample,
            };

            match input {
                Input::Command(Some(AdCommand::Play)) => {
                    if !self.paused {
                        continue;
                    }
                    self.paused = false;
                    if let Some(since) = self.paused_since.take() {
                        let paused_for = since.elapsed();
                        self.paused_total += paused_for;
                        state.pause_duration += paused_for;
                    }
                    if let Err(e) = creative.play().await {
                        return Attempt::Settled(CreativeOutcome::failed(e));
                    }
                    health.rebase(Self::probe(creative, ad));
                    health_timer.reset();
                }
                Input::Command(Some(AdCommand::Pause)) => {
                    if self.paused {
                        continue;
                    }
                    self.paused = true;
                    self.paused_since = Some(Instant::now());
                    health.record_pause();
                    if let Err(e) = creative.pause().await {
                        return Attempt::Settled(CreativeOutcome::failed(e));
                    }
                }
                Input::Command(Some(AdCommand::Click)) => match &ad.click_through {
                    Some(url) if ad.click_enabled() => {
                        self.tracker.click(ad);
                        self.bus.emit(PlayerEvent::AdClick {
                            ad_id: ad.id.clone(),
                            url: url.to_string(),
                        });
                    }
                    _ => debug!(ad_id = %ad.id, "Click-through not wired for creative"),
                },
                Input::Command(Some(AdCommand::Remove)) | Input::Command(None) => {
                    self.removed = true;
                    return Attempt::Settled(CreativeOutcome::Removed);
                }
                Input::Creative(Some(event)) => {
                    if let Some(outcome) = self.on_creative_event(event, creative, ad, state, quartiles, &mut health, &mut buffering) {
                        return Attempt::Settled(outcome);
                    }
                }
                Input::Creative(None) => {
                    return Attempt::Settled(CreativeOutcome::failed(Error::Internal(
                        "creative event channel closed".into(),
                    )));
                }
                Input::StallCheck => {
                    if self.paused {
                        stall_deadline = Instant::now() + self.stall.timeout();
                        continue;
                    }
                    stall_checked = true;
                    let snapshot = StallSnapshot {
                        buffered: creative.buffered(),
                        start_position,
                        position: creative.position(),
                        started: state.video_started,
                    };
                    let Some(kind) = self.stall.inspect(&snapshot) else {
                        continue;
                    };
                    let decision = self.stall.decide(kind, state.stall_retry_count);
                    if let StallDecision::Retry(retry) = decision {
                        state.stall_retry_count = retry;
                    }
                    warn!(ad_id = %ad.id, ?kind, ?decision, "Creative stalled");
                    self.bus.emit(PlayerEvent::AdStall {
                        ad_id: ad.id.clone(),
                        no_buffer: kind == StallKind::NoBuffer,
                        retry: state.stall_retry_count,
                    });
                    return match decision {
                        StallDecision::Retry(_) => Attempt::Reload,
                        StallDecision::Skip => Attempt::Settled(CreativeOutcome::Skipped {
                            reason: kind.skip_reason(),
                            code: kind.vast_code(),
                            error: None,
                        }),
                    };
                }
                Input::HealthSample => {
                    let verdict = health.sample(Self::probe(creative, ad));
                    if !verdict.report_low {
                        continue;
                    }
                    self.bus.emit(PlayerEvent::AdHealthScoreLow {
                        ad_id: ad.id.clone(),
                        score: verdict.sample.blended,
                    });
                    if state.health_score_retry_count < self.config.max_health_retries {
                        state.health_score_retry_count += 1;
                        return Attempt::Reload;
                    }
                    return Attempt::Settled(CreativeOutcome::Skipped {
                        reason: SkipReason::LowHealth,
                        code: VastErrorCode::DisplayProblem,
                        error: None,
                    });
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_creative_event(
        &self,
        event: CreativeEvent,
        creative: &CreativePlayer,
        ad: &Ad,
        state: &mut AdPlaybackState,
        quartiles: &mut QuartileTracker,
        health: &mut HealthChecker,
        buffering: &mut bool,
    ) -> Option<CreativeOutcome> {
        let ad_id = || ad.id.clone();
        match event {
            CreativeEvent::CanPlay => {
                if std::mem::take(buffering) {
                    self.bus.emit(PlayerEvent::AdBufferEnd { ad_id: ad_id() });
                }
            }
            CreativeEvent::Buffering => {
                if !*buffering {
                    *buffering = true;
                    self.bus.emit(PlayerEvent::AdBufferStart { ad_id: ad_id() });
                }
            }
            CreativeEvent::Playing => {
                if std::mem::take(buffering) {
                    self.bus.emit(PlayerEvent::AdBufferEnd { ad_id: ad_id() });
                } else {
                    self.bus.emit(PlayerEvent::AdPlay { ad_id: ad_id() });
                }
                if !state.video_started {
                    state.video_started = true;
                    state.mark_started();
                    self.tracker.impressions(ad);
                }
            }
            CreativeEvent::Paused => {
                self.bus.emit(PlayerEvent::AdPause { ad_id: ad_id() });
            }
            CreativeEvent::TimeUpdate { position } => {
                health.record_tick();
                let duration = creative
                    .duration()
                    .filter(|d| *d > 0.0)
                    .unwrap_or(ad.duration);
                self.bus.emit(PlayerEvent::AdTime {
                    ad_id: ad_id(),
                    position,
                    duration,
                });
                self.fire_quartiles(ad, quartiles.update(position, duration));
            }
            CreativeEvent::Ended => {
                self.fire_quartiles(ad, quartiles.finish());
                self.bus.emit(PlayerEvent::AdComplete { ad_id: ad_id() });
                return Some(CreativeOutcome::Completed);
            }
            CreativeEvent::Failed(error) => return Some(CreativeOutcome::failed(error)),
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ad::{
            bridge::{BridgeCall, BridgeReply, NativeBridge, NativeEvent},
            model::tests::ad,
        },
        config::{RedundancyConfig, StallHandling, TransportConfig},
        headless::HeadlessElement,
        host::MediaElement,
        pipeline::{BufferSink, MemorySink},
        transport::{HttpClient, Transport},
        types::SessionId,
        Result,
    };
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use tokio::sync::broadcast;
    use url::Url;

    /// Serves a one-level manifest whose segments never arrive; everything else 404s
    struct AdServer;

    #[async_trait]
    impl Transport for AdServer {
        async fn send(&self, url: &Url) -> Result<(u16, Bytes)> {
            match url.path() {
                "/slow/master.m3u8" => Ok((
                    200,
                    Bytes::from_static(b"#EXTM3U\n#EXT-X-TARGETDURATION:5\n#EXTINF:5,\ns1.ts\n#EXT-X-ENDLIST\n"),
                )),
                "/slow/s1.ts" => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok((200, Bytes::new()))
                }
                _ => Ok((404, Bytes::new())),
            }
        }
    }

    /// Records every request and answers 200
    #[derive(Default)]
    struct Beacons {
        hits: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for Beacons {
        async fn send(&self, url: &Url) -> Result<(u16, Bytes)> {
            self.hits.lock().push(url.to_string());
            Ok((200, Bytes::new()))
        }
    }

    fn backend(element: Arc<HeadlessElement>, bridge: Option<Arc<dyn NativeBridge>>) -> AdBackend {
        backend_over(Arc::new(AdServer), element, bridge)
    }

    fn backend_over(
        transport: Arc<dyn Transport>,
        element: Arc<HeadlessElement>,
        bridge: Option<Arc<dyn NativeBridge>>,
    ) -> AdBackend {
        AdBackend {
            client: HttpClient::new(transport, &TransportConfig::default()),
            redundancy: RedundancyConfig::default(),
            element,
            bridge,
            sink_factory: Arc::new(|| Arc::new(MemorySink::new()) as Arc<dyn BufferSink>),
        }
    }

    fn player(config: AdConfig) -> (AdPlayer, EventBus, Arc<HeadlessElement>) {
        let element = Arc::new(HeadlessElement::new());
        element.drive(Duration::from_millis(250));
        let bus = EventBus::new(SessionId::new());
        let player = AdPlayer::new(config, backend(Arc::clone(&element), None), bus.clone());
        (player, bus, element)
    }

    fn progressive(id: &str, seconds: f64) -> Ad {
        ad(id, &format!("https://ads.test/{id}.mp4"), seconds)
    }

    fn count(events: &[PlayerEvent], name: &str) -> usize {
        events.iter().filter(|e| e.name() == name).count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_pod() {
        let (mut player, bus, _) = player(AdConfig::default());
        let mut sub = bus.subscribe();
        let summary = player.play_ad_response(Vec::new()).await;
        assert_eq!(summary.pod_size, 0);
        assert_eq!(sub.drain(), vec![PlayerEvent::AdPodEmpty]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_plays_pod_to_completion() {
        let (mut player, bus, element) = player(AdConfig::default());
        let mut sub = bus.subscribe();
        let summary = player
            .play_ad_response(vec![progressive("a", 2.0), progressive("b", 3.0)])
            .await;

        assert_eq!(summary.success_count, 2);
        assert_eq!(summary.failure_count, 0);
        assert!(summary.total_duration >= 5.0);

        let events = sub.drain();
        assert_eq!(count(&events, "adStart"), 2);
        assert_eq!(count(&events, "adQuartile"), 10);
        assert_eq!(count(&events, "adComplete"), 2);
        assert_eq!(count(&events, "adPodComplete"), 1);
        assert!(matches!(
            events.iter().find(|e| e.name() == "adStart"),
            Some(PlayerEvent::AdStart { sequence: 1, count: 2, .. })
        ));
        assert_eq!(element.live_handles(), 0);
        assert!(!element.has_source());
    }

    #[tokio::test(start_paused = true)]
    async fn test_player_reused_across_pods() {
        let (mut player, bus, element) = player(AdConfig::default());
        let handle = player.handle();
        let pauser = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            pauser.pause();
            tokio::time::sleep(Duration::from_secs(1)).await;
            pauser.play();
        });
        let first = player.play_ad_response(vec![progressive("a", 2.0)]).await;
        assert!(first.total_duration_excluding_pause < first.total_duration);
        // Arrives after the pod settled; must not reach the next one
        handle.remove();

        let mut sub = bus.subscribe();
        let second = player.play_ad_response(vec![progressive("b", 2.0)]).await;

        assert_eq!(first.success_count, 1);
        assert_eq!(second.success_count, 1);
        assert_eq!(second.failure_count, 0);
        assert!(second.total_duration < 5.0);
        assert_eq!(second.total_duration, second.total_duration_excluding_pause);

        let events = sub.drain();
        assert_eq!(count(&events, "adComplete"), 1);
        assert_eq!(count(&events, "adDiscontinue"), 0);
        assert_eq!(count(&events, "adStall"), 0);
        assert_eq!(element.live_handles(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_health_reloads_then_skips() {
        let beacons = Arc::new(Beacons::default());
        let element = Arc::new(HeadlessElement::new());
        element.drive(Duration::from_millis(250));
        // Fully buffered, but the play head never moves and no time updates arrive
        element.set_playback_rate(0.0);

        let bus = EventBus::new(SessionId::new());
        let mut sub = bus.subscribe();
        let config = AdConfig {
            health_interval_ms: 1000,
            max_health_retries: 1,
            stall_timeout_ms: 60_000,
            ..AdConfig::default()
        };
        let mut player = AdPlayer::new(
            config,
            backend_over(beacons.clone(), element, None),
            bus,
        );
        let mut stuck = progressive("stuck", 10.0);
        stuck.error_beacon = Some("https://t.test/error?code=[ERRORCODE]".into());

        let summary = player.play_ad_response(vec![stuck]).await;
        // Let the spawned beacon land
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(summary.failure_count, 1);
        let events = sub.drain();
        assert_eq!(count(&events, "adHealthScoreLow"), 2);
        assert_eq!(count(&events, "adStart"), 1);
        assert_eq!(count(&events, "adStall"), 0);
        assert!(events.contains(&PlayerEvent::AdDiscontinue {
            ad_id: "stuck".into(),
            reason: SkipReason::LowHealth,
        }));

        let state = player.pod().unwrap().state(0).unwrap();
        assert_eq!(state.health_score_retry_count, 1);
        assert_eq!(state.failed, Some(SkipReason::LowHealth));
        assert_eq!(
            *beacons.hits.lock(),
            vec!["https://t.test/error?code=405".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_skip_and_chain() {
        let (mut player, bus, _) = player(AdConfig::default());
        let mut sub = bus.subscribe();
        let ads = vec![
            ad("m1", "https://ads.test/missing/1.m3u8", 5.0),
            ad("m2", "https://ads.test/missing/2.m3u8", 5.0),
            progressive("ok", 1.0),
        ];
        let summary = player.play_ad_response(ads).await;

        assert_eq!(summary.success_count, 1);
        assert_eq!(summary.failure_count, 2);
        let pod = player.pod().unwrap();
        assert_eq!(pod.state(1).unwrap().consecutive_code_skips, 1);
        assert_eq!(pod.state(2).unwrap().consecutive_code_skips, 2);
        assert_eq!(pod.state(2).unwrap().last_skip_reason, Some(SkipReason::Error));

        let events = sub.drain();
        assert_eq!(count(&events, "adError"), 2);
        assert_eq!(count(&events, "adPodComplete"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_retries_then_skips() {
        let config = AdConfig {
            max_stall_retries: 1,
            health_enabled: false,
            ..AdConfig::default()
        };
        let (mut player, bus, _) = player(config);
        let mut sub = bus.subscribe();
        let summary = player
            .play_ad_response(vec![ad("slow", "https://ads.test/slow/master.m3u8", 5.0)])
            .await;

        assert_eq!(summary.failure_count, 1);
        let events = sub.drain();
        let stalls: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                PlayerEvent::AdStall { no_buffer, retry, .. } => Some((*no_buffer, *retry)),
                _ => None,
            })
            .collect();
        assert_eq!(stalls, vec![(true, 1), (true, 1)]);
        assert!(events.contains(&PlayerEvent::AdDiscontinue {
            ad_id: "slow".into(),
            reason: SkipReason::StallNoBuffer,
        }));
        assert_eq!(count(&events, "adStart"), 1);
        assert_eq!(player.pod().unwrap().state(0).unwrap().stall_retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_policy_skips_on_first_stall() {
        let config = AdConfig {
            stall_handling: StallHandling::Skip,
            ..AdConfig::default()
        };
        let (mut player, bus, _) = player(config);
        let mut sub = bus.subscribe();
        player
            .play_ad_response(vec![ad("slow", "https://ads.test/slow/master.m3u8", 5.0)])
            .await;
        assert_eq!(count(&sub.drain(), "adStall"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_is_idempotent() {
        let (mut player, bus, _) = player(AdConfig::default());
        let mut sub = bus.subscribe();
        let handle = player.handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            handle.remove();
            handle.remove();
        });
        let summary = player
            .play_ad_response(vec![progressive("a", 30.0), progressive("b", 30.0)])
            .await;

        assert!(summary.success_count + summary.failure_count <= 2);
        let events = sub.drain();
        assert_eq!(count(&events, "adPodComplete"), 1);
        assert_eq!(count(&events, "adDiscontinue"), 1);
        assert_eq!(count(&events, "adStart"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_excluded_from_duration() {
        let (mut player, bus, _) = player(AdConfig::default());
        let mut sub = bus.subscribe();
        let handle = player.handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            handle.pause();
            tokio::time::sleep(Duration::from_secs(4)).await;
            handle.play();
        });
        let summary = player.play_ad_response(vec![progressive("a", 2.0)]).await;

        assert_eq!(summary.success_count, 1);
        let paused = summary.total_duration - summary.total_duration_excluding_pause;
        assert!((paused - 4.0).abs() < 0.5);
        let events = sub.drain();
        assert_eq!(count(&events, "adPause"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_click_requires_tracking() {
        let (mut player, bus, _) = player(AdConfig::default());
        let mut sub = bus.subscribe();
        let mut clickable = progressive("a", 2.0);
        clickable.click_through = Some(Url::parse("https://brand.test/").unwrap());
        clickable.click_tracking = vec![Url::parse("https://t.test/click").unwrap()];
        let mut bare = progressive("b", 2.0);
        bare.click_through = Some(Url::parse("https://brand.test/").unwrap());

        let handle = player.handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            handle.click();
            tokio::time::sleep(Duration::from_secs(2)).await;
            handle.click();
        });
        player.play_ad_response(vec![clickable, bare]).await;

        let clicks: Vec<_> = sub
            .drain()
            .into_iter()
            .filter(|e| e.name() == "adClick")
            .collect();
        assert_eq!(
            clicks,
            vec![PlayerEvent::AdClick {
                ad_id: "a".into(),
                url: "https://brand.test/".into()
            }]
        );
    }

    /// Native player that plays any creative instantly on `Play`
    struct InstantNative {
        events: broadcast::Sender<NativeEvent>,
        calls: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl NativeBridge for InstantNative {
        async fn call(&self, call: BridgeCall) -> Result<BridgeReply> {
            self.calls.lock().push(call.name());
            if call == BridgeCall::Play {
                let _ = self.events.send(NativeEvent::CanPlay);
                let _ = self.events.send(NativeEvent::Playing);
                let _ = self.events.send(NativeEvent::TimeUpdate {
                    position: 4.0,
                    duration: 4.0,
                });
                let _ = self.events.send(NativeEvent::End);
            }
            Ok(BridgeReply::ok())
        }

        fn subscribe(&self) -> broadcast::Receiver<NativeEvent> {
            self.events.subscribe()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_native_creative() {
        let native = Arc::new(InstantNative {
            events: broadcast::channel(16).0,
            calls: Mutex::new(Vec::new()),
        });
        let element = Arc::new(HeadlessElement::new());
        let bus = EventBus::new(SessionId::new());
        let mut sub = bus.subscribe();
        let mut player = AdPlayer::new(
            AdConfig::default(),
            backend(element, Some(native.clone() as Arc<dyn NativeBridge>)),
            bus,
        );
        let summary = player.play_ad_response(vec![progressive("n", 4.0)]).await;

        assert_eq!(summary.success_count, 1);
        assert_eq!(
            *native.calls.lock(),
            vec!["Setup", "Preload", "Play", "Destroy"]
        );
        assert_eq!(count(&sub.drain(), "adQuartile"), 5);
    }
}
