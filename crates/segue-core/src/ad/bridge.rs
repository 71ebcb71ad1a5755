//! Native player message bridge
//!
//! Named events flow from the native player to the engine; named handler
//! calls flow the other way and each resolves to a [`BridgeReply`].

use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, instrument};
use url::Url;

/// Handler call from engine to native
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "PascalCase")]
pub enum BridgeCall {
    Setup { ad_id: String },
    Preload { url: Url },
    Play,
    Pause,
    SetVolume { volume: f64 },
    Destroy,
}

impl BridgeCall {
    pub fn name(&self) -> &'static str {
        match self {
            BridgeCall::Setup { .. } => "Setup",
            BridgeCall::Preload { .. } => "Preload",
            BridgeCall::Play => "Play",
            BridgeCall::Pause => "Pause",
            BridgeCall::SetVolume { .. } => "SetVolume",
            BridgeCall::Destroy => "Destroy",
        }
    }
}

/// Native answer to a handler call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeReply {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl BridgeReply {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Event from native to engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "PascalCase")]
pub enum NativeEvent {
    CanPlay,
    Buffering,
    Playing,
    Pause,
    TimeUpdate { position: f64, duration: f64 },
    End,
    Error { message: String },
}

/// Asynchronous message bridge to a native player
#[async_trait]
pub trait NativeBridge: Send + Sync {
    /// Send a handler call and wait for its reply
    async fn call(&self, call: BridgeCall) -> Result<BridgeReply>;

    fn subscribe(&self) -> broadcast::Receiver<NativeEvent>;
}

/// Round-trip `call`, treating an unsuccessful reply or no reply within
/// `timeout` as an error
#[instrument(skip(bridge, call), fields(call = call.name()))]
pub async fn invoke(bridge: &dyn NativeBridge, call: BridgeCall, timeout: Duration) -> Result<()> {
    let name = call.name();
    let reply = tokio::time::timeout(timeout, bridge.call(call))
        .await
        .map_err(|_| Error::bridge(name, format!("no reply within {}ms", timeout.as_millis())))??;
    if reply.success {
        debug!("Bridge call succeeded");
        Ok(())
    } else {
        Err(Error::bridge(
            name,
            reply.error.unwrap_or_else(|| "unspecified failure".into()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted {
        reply: BridgeReply,
        delay: Duration,
        events: broadcast::Sender<NativeEvent>,
    }

    #[async_trait]
    impl NativeBridge for Scripted {
        async fn call(&self, _call: BridgeCall) -> Result<BridgeReply> {
            tokio::time::sleep(self.delay).await;
            Ok(self.reply.clone())
        }

        fn subscribe(&self) -> broadcast::Receiver<NativeEvent> {
            self.events.subscribe()
        }
    }

    fn bridge(reply: BridgeReply, delay: Duration) -> Scripted {
        Scripted {
            reply,
            delay,
            events: broadcast::channel(4).0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reply_is_error() {
        let bridge = bridge(BridgeReply::failed("decoder busy"), Duration::ZERO);
        let err = invoke(&bridge, BridgeCall::Play, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Bridge { ref call, .. } if call == "Play"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_reply_times_out() {
        let bridge = bridge(BridgeReply::ok(), Duration::from_secs(10));
        let err = invoke(&bridge, BridgeCall::Destroy, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no reply"));
    }

    #[test]
    fn test_wire_names() {
        let json = serde_json::to_string(&BridgeCall::SetVolume { volume: 0.5 }).unwrap();
        assert_eq!(json, r#"{"call":"SetVolume","volume":0.5}"#);
        let event: NativeEvent =
            serde_json::from_str(r#"{"event":"TimeUpdate","position":1.5,"duration":15.0}"#).unwrap();
        assert_eq!(
            event,
            NativeEvent::TimeUpdate {
                position: 1.5,
                duration: 15.0
            }
        );
    }
}
