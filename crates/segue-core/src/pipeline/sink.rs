//! Platform buffer sink abstraction
//!
//! A sink accepts appended media and reports what is buffered. It is owned by
//! exactly one writer at a time; ownership moves only after [`BufferSink::destroy`].

use crate::{types::BufferRange, Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::time::Duration;
use tracing::debug;

/// One append unit
#[derive(Debug, Clone, PartialEq)]
pub struct SinkChunk {
    pub data: Bytes,
    /// Start on the sink timeline, in seconds
    pub start: f64,
    /// Media duration carried by the chunk (0 for init segments)
    pub duration: f64,
    pub is_init: bool,
    /// Originating segment number
    pub sequence: Option<u64>,
}

impl SinkChunk {
    pub fn init(data: Bytes) -> Self {
        Self {
            data,
            start: 0.0,
            duration: 0.0,
            is_init: true,
            sequence: None,
        }
    }

    pub fn media(data: Bytes, sequence: u64, start: f64, duration: f64) -> Self {
        Self {
            data,
            start,
            duration,
            is_init: false,
            sequence: Some(sequence),
        }
    }

    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Platform object that accepts appended media for playback
#[async_trait]
pub trait BufferSink: Send + Sync {
    /// Prepare for a stream of `duration` seconds of `mime_type`
    async fn open(&self, duration: f64, mime_type: &str) -> Result<()>;

    /// Append one chunk; resolves on the sink's update-complete signal
    async fn append(&self, chunk: SinkChunk) -> Result<()>;

    /// True while an append is in progress
    fn is_updating(&self) -> bool;

    /// Currently buffered ranges
    fn buffered(&self) -> BufferRange;

    /// Duration declared at open
    fn duration(&self) -> Option<f64>;

    /// Signal that no more data will be appended
    async fn end_of_stream(&self) -> Result<()>;

    fn is_ended(&self) -> bool;

    /// Release the sink; later appends fail. Idempotent.
    fn destroy(&self);
}

#[derive(Debug, Default)]
struct MemorySinkState {
    opened: bool,
    ended: bool,
    destroyed: bool,
    updating: bool,
    duration: Option<f64>,
    mime_type: Option<String>,
    init_appends: usize,
    media: Vec<(u64, f64, f64)>,
    bytes: usize,
}

/// In-memory [`BufferSink`] for headless playback
#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<MemorySinkState>,
    append_latency: Duration,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink whose appends take `latency` to complete
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            state: Mutex::new(MemorySinkState::default()),
            append_latency: latency,
        }
    }

    pub fn init_appends(&self) -> usize {
        self.state.lock().init_appends
    }

    /// Sequence numbers of appended media, in append order
    pub fn appended_sequences(&self) -> Vec<u64> {
        self.state.lock().media.iter().map(|(sn, _, _)| *sn).collect()
    }

    pub fn bytes(&self) -> usize {
        self.state.lock().bytes
    }

    pub fn mime_type(&self) -> Option<String> {
        self.state.lock().mime_type.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }
}

#[async_trait]
impl BufferSink for MemorySink {
    async fn open(&self, duration: f64, mime_type: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(Error::Sink("sink destroyed".into()));
        }
        state.opened = true;
        state.duration = Some(duration);
        state.mime_type = Some(mime_type.to_string());
        Ok(())
    }

    async fn append(&self, chunk: SinkChunk) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return Err(Error::Sink("append after destroy".into()));
            }
            if !state.opened || state.ended {
                return Err(Error::Sink("sink not open for appends".into()));
            }
            if state.updating {
                return Err(Error::Sink("append while updating".into()));
            }
            state.updating = true;
        }

        if !self.append_latency.is_zero() {
            tokio::time::sleep(self.append_latency).await;
        }

        let mut state = self.state.lock();
        state.updating = false;
        if state.destroyed {
            return Err(Error::Sink("destroyed during append".into()));
        }
        state.bytes += chunk.data.len();
        if chunk.is_init {
            state.init_appends += 1;
        } else {
            let sequence = chunk.sequence.unwrap_or(state.media.len() as u64);
            state.media.push((sequence, chunk.start, chunk.end()));
        }
        debug!(
            sequence = ?chunk.sequence,
            init = chunk.is_init,
            bytes = chunk.data.len(),
            "Sink append complete"
        );
        Ok(())
    }

    fn is_updating(&self) -> bool {
        self.state.lock().updating
    }

    fn buffered(&self) -> BufferRange {
        let state = self.state.lock();
        BufferRange::new(state.media.iter().map(|(_, s, e)| (*s, *e)).collect())
    }

    fn duration(&self) -> Option<f64> {
        self.state.lock().duration
    }

    async fn end_of_stream(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(Error::Sink("sink destroyed".into()));
        }
        state.ended = true;
        Ok(())
    }

    fn is_ended(&self) -> bool {
        self.state.lock().ended
    }

    fn destroy(&self) {
        let mut state = self.state.lock();
        if !state.destroyed {
            state.destroyed = true;
            debug!(bytes = state.bytes, "Sink destroyed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_buffered_tracks_appends() {
        let sink = MemorySink::new();
        sink.open(20.0, "video/mp4").await.unwrap();
        sink.append(SinkChunk::init(Bytes::from_static(b"init"))).await.unwrap();
        sink.append(SinkChunk::media(Bytes::from_static(b"a"), 0, 0.0, 10.0))
            .await
            .unwrap();
        sink.append(SinkChunk::media(Bytes::from_static(b"b"), 1, 10.0, 10.0))
            .await
            .unwrap();

        assert_eq!(sink.buffered().ranges(), &[(0.0, 20.0)]);
        assert_eq!(sink.init_appends(), 1);
        assert_eq!(sink.appended_sequences(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_append_after_destroy_fails() {
        let sink = MemorySink::new();
        sink.open(10.0, "video/mp4").await.unwrap();
        sink.destroy();
        sink.destroy();
        let err = sink
            .append(SinkChunk::media(Bytes::new(), 0, 0.0, 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Sink(_)));
    }
}
