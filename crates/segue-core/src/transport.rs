//! Transport client
//!
//! Resilient HTTP GET used by every other component:
//! - per-attempt timeout
//! - exponential backoff with random jitter between attempts
//! - abort through an [`AbortToken`] threaded into every await

use crate::{config::TransportConfig, Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use reqwest::Client;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

/// Cancellation handle for in-flight work.
///
/// Cloning shares the same cancellation state; [`AbortToken::child`] creates a
/// token that is cancelled along with its parent but can also be cancelled alone.
#[derive(Debug, Clone, Default)]
pub struct AbortToken {
    inner: CancellationToken,
}

impl AbortToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Child token cancelled when this one is
    pub fn child(&self) -> Self {
        Self {
            inner: self.inner.child_token(),
        }
    }

    /// Cancel; calling more than once has no further effect
    pub fn abort(&self) {
        self.inner.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Resolves once aborted
    pub async fn aborted(&self) {
        self.inner.cancelled().await
    }

    /// Run `fut` unless aborted first
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_aborted() {
            return Err(Error::Aborted);
        }
        tokio::select! {
            biased;
            _ = self.inner.cancelled() => Err(Error::Aborted),
            result = fut => result,
        }
    }
}

/// GET request description
#[derive(Debug, Clone)]
pub struct Request {
    pub url: Url,
    /// Per-attempt timeout; falls back to the client default
    pub timeout: Option<Duration>,
    /// Attempts after the first; falls back to the client default
    pub retries: Option<u32>,
}

impl Request {
    pub fn get(url: Url) -> Self {
        Self {
            url,
            timeout: None,
            retries: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

/// Completed response
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: u16,
    pub body: Bytes,
    /// Time from send to full body
    pub elapsed: Duration,
}

impl Response {
    pub fn text(&self) -> Result<String> {
        String::from_utf8(self.body.to_vec())
            .map_err(|e| Error::ManifestParse(format!("Response from {} is not UTF-8: {}", self.url, e)))
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Throughput of this response in bits per second
    pub fn throughput_bps(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            ((self.body.len() as f64 * 8.0) / secs) as u64
        } else {
            0
        }
    }
}

/// Single-attempt HTTP backend
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one GET; status codes are returned, not mapped to errors
    async fn send(&self, url: &Url) -> Result<(u16, Bytes)>;
}

/// [`Transport`] backed by `reqwest`
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, url: &Url) -> Result<(u16, Bytes)> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        Ok((status, body))
    }
}

/// Backoff between attempts
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the first
    pub max_retries: u32,
    /// Delay = base * 2^attempt + jitter
    pub base_delay: Duration,
    /// Cap on the computed delay
    pub max_delay: Duration,
    /// Add random jitter in [0, base/2)
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            max_retries: config.retry_attempts,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            jitter: true,
        }
    }

    /// Delay before retry number `attempt` (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let capped = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        let jitter_range_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        let remaining_ms =
            u64::try_from(self.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let limit = jitter_range_ms.min(remaining_ms);
        if limit == 0 {
            return capped;
        }
        capped + Duration::from_millis(rand::rng().random_range(0..limit))
    }
}

/// HTTP client shared by all components of a session
#[derive(Clone)]
pub struct HttpClient {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    default_timeout: Duration,
}

impl HttpClient {
    pub fn new(transport: Arc<dyn Transport>, config: &TransportConfig) -> Self {
        Self {
            transport,
            policy: RetryPolicy::from_config(config),
            default_timeout: Duration::from_millis(config.request_timeout_ms),
        }
    }

    /// Client over `reqwest`
    pub fn reqwest(config: &TransportConfig) -> Result<Self> {
        Ok(Self::new(Arc::new(ReqwestTransport::new(config)?), config))
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// One attempt, bounded by the request timeout and the abort token
    #[instrument(skip(self, abort), fields(url = %request.url))]
    pub async fn fetch_once(&self, request: &Request, abort: &AbortToken) -> Result<Response> {
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let started = Instant::now();

        let attempt = async {
            match tokio::time::timeout(timeout, self.transport.send(&request.url)).await {
                Ok(result) => result,
                Err(_) => Err(Error::RequestTimeout {
                    url: request.url.to_string(),
                }),
            }
        };
        let (status, body) = abort.run(attempt).await?;

        if !(200..300).contains(&status) {
            return Err(Error::HttpStatus {
                url: request.url.to_string(),
                status,
            });
        }

        let response = Response {
            url: request.url.clone(),
            status,
            body,
            elapsed: started.elapsed(),
        };
        debug!(
            status,
            bytes = response.body.len(),
            elapsed_ms = response.elapsed.as_millis() as u64,
            "Fetched"
        );
        Ok(response)
    }

    /// Fetch with retry on recoverable failures
    pub async fn fetch(&self, request: &Request, abort: &AbortToken) -> Result<Response> {
        let max_retries = request.retries.unwrap_or(self.policy.max_retries);

        let mut attempt = 0;
        loop {
            match self.fetch_once(request, abort).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_recoverable() && attempt < max_retries => {
                    let delay = self.policy.delay_for_attempt(attempt);
                    warn!(
                        url = %request.url,
                        attempt = attempt + 1,
                        max = max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying after transient error"
                    );
                    abort.run(async {
                        tokio::time::sleep(delay).await;
                        Ok(())
                    })
                    .await?;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Fetch and decode as UTF-8 text
    pub async fn fetch_text(&self, request: &Request, abort: &AbortToken) -> Result<String> {
        self.fetch(request, abort).await?.text()
    }

    /// Fire-and-forget tracking request; failures are only logged
    pub fn fire_beacon(&self, url: Url) {
        let client = self.clone();
        tokio::spawn(async move {
            let request = Request::get(url).with_retries(0);
            if let Err(e) = client.fetch_once(&request, &AbortToken::new()).await {
                warn!(url = %request.url, error = %e, "Beacon failed");
            }
        });
    }
}
