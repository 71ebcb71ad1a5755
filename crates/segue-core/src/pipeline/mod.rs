//! Segment pipeline: a minimal HLS client for one ad creative
//!
//! Manifest fetch, level selection, segment download, transmux and append into
//! a [`BufferSink`], without the external streaming engine.
//!
//! With redundancy enabled, segment n+1 downloads while segment n is
//! transmuxed and appended. Appends are always strictly sequential.

mod sink;
mod transmux;

pub use sink::{BufferSink, MemorySink, SinkChunk};
pub use transmux::{transmuxer_for, Fmp4Passthrough, TransmuxOutput, Transmuxer, TsRemuxer};

use crate::{
    config::RedundancyConfig,
    manifest::{HlsLoader, LoadedLevel},
    transport::{AbortToken, HttpClient, Request},
    types::{Level, Segment},
    Error, Result,
};
use bytes::Bytes;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Progress notifications from a running pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineProgress {
    /// Sink opened for the selected level
    Opened { duration: f64, segments: usize },
    /// A media segment finished appending
    Appended { sequence: u64, buffered_end: f64 },
    /// End-of-stream signalled after the final append
    Ended,
}

/// Per-segment download timing
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentTiming {
    pub number: u64,
    pub bytes: usize,
    pub download: Duration,
}

/// Outcome of a completed pipeline run
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub level: Level,
    pub segments: usize,
    /// Sum of segment durations, in seconds
    pub duration: f64,
    pub bytes: usize,
    pub elapsed: Duration,
    pub timings: Vec<SegmentTiming>,
}

impl PipelineReport {
    /// Mean download throughput in bits per second
    pub fn throughput_bps(&self) -> Option<u64> {
        let secs: f64 = self.timings.iter().map(|t| t.download.as_secs_f64()).sum();
        (secs > 0.0).then(|| ((self.bytes as f64 * 8.0) / secs) as u64)
    }
}

struct Downloaded {
    segment: Segment,
    data: Bytes,
    timing: SegmentTiming,
}

/// An append issued to the sink; resolves to the media sequence it carried
type PendingAppend<'a> = Pin<Box<dyn Future<Output = Result<Option<u64>>> + Send + 'a>>;

/// Appends waiting for the sink, issued in order one at a time
#[derive(Default)]
struct AppendQueue {
    pending: VecDeque<SinkChunk>,
}

impl AppendQueue {
    fn push(&mut self, chunk: SinkChunk) {
        self.pending.push_back(chunk);
    }

    fn len(&self) -> usize {
        self.pending.len()
    }

    /// Issue the oldest queued chunk, if any
    fn start_next<'a>(
        &mut self,
        sink: &'a dyn BufferSink,
        abort: &'a AbortToken,
    ) -> Option<PendingAppend<'a>> {
        let chunk = self.pending.pop_front()?;
        let sequence = chunk.sequence;
        Some(Box::pin(async move {
            abort.run(sink.append(chunk)).await?;
            Ok(sequence)
        }))
    }
}

/// Plays one HLS creative into a buffer sink
pub struct SegmentPipeline {
    loader: HlsLoader,
    client: HttpClient,
    config: RedundancyConfig,
    sink: Arc<dyn BufferSink>,
    abort: AbortToken,
    progress: Option<mpsc::UnboundedSender<PipelineProgress>>,
}

impl SegmentPipeline {
    pub fn new(
        client: HttpClient,
        config: RedundancyConfig,
        sink: Arc<dyn BufferSink>,
        abort: AbortToken,
    ) -> Self {
        let loader = HlsLoader::new(
            client.clone(),
            Duration::from_millis(config.manifest_timeout_ms),
            config.retry_count,
        );
        Self {
            loader,
            client,
            config,
            sink,
            abort,
            progress: None,
        }
    }

    /// Report progress on `tx`
    pub fn with_progress(mut self, tx: mpsc::UnboundedSender<PipelineProgress>) -> Self {
        self.progress = Some(tx);
        self
    }

    pub fn sink(&self) -> &Arc<dyn BufferSink> {
        &self.sink
    }

    pub fn abort_token(&self) -> &AbortToken {
        &self.abort
    }

    fn notify(&self, progress: PipelineProgress) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(progress);
        }
    }

    /// Load the manifest and play every segment of the selected level
    #[instrument(skip(self), fields(url = %url))]
    pub async fn run(&self, url: &Url, bandwidth_estimate: Option<u64>) -> Result<PipelineReport> {
        let started = Instant::now();
        let loaded = self.loader.load(url, bandwidth_estimate, &self.abort).await?;
        self.play_level(loaded, started).await
    }

    async fn play_level(&self, loaded: LoadedLevel, started: Instant) -> Result<PipelineReport> {
        let LoadedLevel { level, playlist, .. } = loaded;
        let segments = playlist.segments;
        let duration: f64 = segments.iter().map(|s| s.duration.as_secs_f64()).sum();

        let first = segments
            .first()
            .ok_or_else(|| Error::InvalidManifest("level lists no segments".into()))?;
        let mut transmuxer = transmuxer_for(first, level.codecs.as_deref());
        if let Some(init_uri) = &first.init_uri {
            let init = self.fetch_segment_bytes(init_uri).await?;
            transmuxer.set_init(init.0);
        }

        self.abort
            .run(self.sink.open(duration, transmuxer.mime_type()))
            .await?;
        self.notify(PipelineProgress::Opened {
            duration,
            segments: segments.len(),
        });
        info!(
            level = level.index,
            segments = segments.len(),
            duration,
            redundancy = self.config.enabled,
            "Pipeline started"
        );

        let timings = if self.config.enabled {
            self.run_pipelined(&segments, transmuxer.as_mut()).await?
        } else {
            self.run_sequential(&segments, transmuxer.as_mut()).await?
        };

        self.abort.run(self.sink.end_of_stream()).await?;
        self.notify(PipelineProgress::Ended);

        let report = PipelineReport {
            level,
            segments: segments.len(),
            duration,
            bytes: timings.iter().map(|t| t.bytes).sum(),
            elapsed: started.elapsed(),
            timings,
        };
        info!(
            bytes = report.bytes,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Pipeline complete"
        );
        Ok(report)
    }

    /// Download, transmux and append one segment at a time
    async fn run_sequential(
        &self,
        segments: &[Segment],
        transmuxer: &mut dyn Transmuxer,
    ) -> Result<Vec<SegmentTiming>> {
        let mut queue = AppendQueue::default();
        let mut timings = Vec::with_capacity(segments.len());
        for segment in segments {
            let downloaded = self.download(segment).await?;
            timings.push(downloaded.timing.clone());
            self.enqueue(downloaded, transmuxer, &mut queue)?;
            while let Some(append) = queue.start_next(self.sink.as_ref(), &self.abort) {
                self.appended(append.await?);
            }
        }
        Ok(timings)
    }

    /// Download ahead of transmux/append over a one-slot channel.
    ///
    /// Segments that arrive while the sink is mid-append are transmuxed and
    /// queued; the queue drains one append at a time as each completes.
    async fn run_pipelined(
        &self,
        segments: &[Segment],
        transmuxer: &mut dyn Transmuxer,
    ) -> Result<Vec<SegmentTiming>> {
        let (tx, mut rx) = mpsc::channel::<Downloaded>(1);

        let download = async move {
            for segment in segments {
                let downloaded = self.download(segment).await?;
                if tx.send(downloaded).await.is_err() {
                    break;
                }
            }
            Ok::<_, Error>(())
        };

        let process = async {
            let mut queue = AppendQueue::default();
            let mut timings = Vec::with_capacity(segments.len());
            let mut in_flight: Option<PendingAppend<'_>> = None;
            let mut receiving = true;
            loop {
                if in_flight.is_none() {
                    in_flight = queue.start_next(self.sink.as_ref(), &self.abort);
                }
                if in_flight.is_none() && !receiving {
                    break;
                }
                tokio::select! {
                    biased;
                    appended = async {
                        match in_flight.as_mut() {
                            Some(append) => append.await,
                            None => std::future::pending().await,
                        }
                    }, if in_flight.is_some() => {
                        in_flight = None;
                        self.appended(appended?);
                    }
                    downloaded = rx.recv(), if receiving => match downloaded {
                        Some(downloaded) => {
                            timings.push(downloaded.timing.clone());
                            self.enqueue(downloaded, transmuxer, &mut queue)?;
                            if in_flight.is_some() {
                                debug!(queued = queue.len(), "Sink mid-append, segment queued");
                            }
                        }
                        None => receiving = false,
                    },
                }
            }
            Ok::<_, Error>(timings)
        };

        let ((), timings) = tokio::try_join!(download, process)?;
        if timings.len() != segments.len() {
            return Err(Error::Internal(format!(
                "appended {} of {} segments",
                timings.len(),
                segments.len()
            )));
        }
        Ok(timings)
    }

    /// Transmux a downloaded segment and queue its chunks
    fn enqueue(
        &self,
        downloaded: Downloaded,
        transmuxer: &mut dyn Transmuxer,
        queue: &mut AppendQueue,
    ) -> Result<()> {
        let Downloaded { segment, data, .. } = downloaded;
        let output = transmuxer.push(&segment, data)?;
        if let Some(init) = output.init {
            queue.push(SinkChunk::init(init));
        }
        queue.push(SinkChunk::media(
            output.data,
            segment.number,
            segment.start,
            segment.duration.as_secs_f64(),
        ));
        Ok(())
    }

    /// Report a completed append; init chunks carry no sequence
    fn appended(&self, sequence: Option<u64>) {
        let Some(sequence) = sequence else {
            return;
        };
        let buffered_end = self.sink.buffered().end().unwrap_or(0.0);
        debug!(sequence, buffered_end, "Segment appended");
        self.notify(PipelineProgress::Appended {
            sequence,
            buffered_end,
        });
    }

    async fn download(&self, segment: &Segment) -> Result<Downloaded> {
        let (data, download) = self.fetch_segment_bytes(&segment.uri).await?;
        Ok(Downloaded {
            timing: SegmentTiming {
                number: segment.number,
                bytes: data.len(),
                download,
            },
            segment: segment.clone(),
            data,
        })
    }

    async fn fetch_segment_bytes(&self, url: &Url) -> Result<(Bytes, Duration)> {
        let request = Request::get(url.clone())
            .with_timeout(Duration::from_millis(self.config.segment_timeout_ms))
            .with_retries(self.config.retry_count);
        match self.client.fetch(&request, &self.abort).await {
            Ok(response) => Ok((response.body, response.elapsed)),
            Err(Error::HttpStatus { url, status }) => {
                warn!(%url, status, "Segment request failed");
                Err(Error::SegmentFetch {
                    url,
                    reason: format!("HTTP {status}"),
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Abort in-flight requests and release the sink. Idempotent.
    pub fn teardown(&self) {
        if !self.abort.is_aborted() {
            debug!("Pipeline teardown");
        }
        self.abort.abort();
        self.sink.destroy();
    }
}
