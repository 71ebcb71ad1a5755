//! Ad breaks: decision requests, creative players and pod sequencing

pub mod bridge;
pub mod creative;
pub mod decision;
pub mod model;
pub mod player;
pub mod tracking;

pub use bridge::{invoke, BridgeCall, BridgeReply, NativeBridge, NativeEvent};
pub use creative::{AdBackend, CreativeEvent, CreativeKind, CreativePlayer, SinkFactory};
pub use decision::AdDecisionClient;
pub use model::{Ad, AdPlaybackState, AdPod, AdResponse, CompanionIcon, ERROR_CODE_TOKEN};
pub use player::{AdCommand, AdPlayer, AdPlayerHandle};
pub use tracking::{AdTracker, QuartileTracker};
