//! Ad-decision requests

use super::model::{Ad, AdResponse};
use crate::{
    transport::{AbortToken, HttpClient, Request},
    Result,
};
use std::time::Duration;
use tracing::{info, instrument};
use url::Url;

/// Fetches ad pods from the ad-decision endpoint
#[derive(Clone)]
pub struct AdDecisionClient {
    client: HttpClient,
    endpoint: Url,
    timeout: Duration,
}

impl AdDecisionClient {
    pub fn new(client: HttpClient, endpoint: Url, timeout: Duration) -> Self {
        Self {
            client,
            endpoint,
            timeout,
        }
    }

    /// Request URL for the cue point at `position`
    pub fn request_url(&self, position: f64) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("position", &format!("{}", position.max(0.0).round() as u64));
        url
    }

    /// Fetch the pod scheduled at `position`. Not retried: a failed fetch
    /// resumes content instead.
    #[instrument(skip(self, abort))]
    pub async fn fetch_pod(&self, position: f64, abort: &AbortToken) -> Result<Vec<Ad>> {
        let request = Request::get(self.request_url(position))
            .with_timeout(self.timeout)
            .with_retries(0);
        let body = self.client.fetch_text(&request, abort).await?;
        let ads = AdResponse::parse(&body)?;
        info!(count = ads.len(), "Ad pod fetched");
        Ok(ads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::transport::Transport;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Arc;

    struct OneBody(&'static str);

    #[async_trait]
    impl Transport for OneBody {
        async fn send(&self, url: &Url) -> Result<(u16, Bytes)> {
            assert_eq!(url.query(), Some("position=30"));
            Ok((200, Bytes::from_static(self.0.as_bytes())))
        }
    }

    #[tokio::test]
    async fn test_fetch_pod() {
        let client = HttpClient::new(
            Arc::new(OneBody(
                r#"{"items":[{"id":"a","media_url":"https://ads.test/a.mp4","duration":15}]}"#,
            )),
            &TransportConfig::default(),
        );
        let decision = AdDecisionClient::new(
            client,
            Url::parse("https://adserver.test/pod").unwrap(),
            Duration::from_secs(8),
        );
        let ads = decision.fetch_pod(30.0, &AbortToken::new()).await.unwrap();
        assert_eq!(ads[0].id, "a");
    }
}
