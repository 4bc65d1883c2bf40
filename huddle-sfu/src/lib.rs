//! Huddle SFU (Selective Forwarding Unit)
//!
//! Session orchestration for multi-party calls. Media itself is routed by an
//! external media engine; this crate drives it. It runs the per-peer
//! signaling state machine, keeps rooms consistent while peers come and go,
//! and tears everything down in the right order when they leave.
//!
//! ## Architecture
//!
//! - **`SfuManager`**: Owns the rooms and the pool of media workers
//! - **`SfuRoom`**: One group of peers sharing a router
//! - **`SfuPeer`**: One participant's signaling session
//! - **`Inspector`**: Optional diagnostic subprocess fed with every video track
//! - **`FrameTag`**: VP8 frame header parser used for diagnostics
//!
//! The media engine is reached through the traits in [`engine`]; signaling
//! connections through [`signaling::SignalingChannel`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use huddle_sfu::{SfuConfig, SfuManager};
//!
//! let manager = SfuManager::new(SfuConfig::default(), workers);
//! let room_id = manager.create_room(serde_json::json!({ "title": "standup" })).await?;
//! let peer_id = manager.join_room(connection, &room_id).await?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod inspector;
mod manager;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
mod peer;
mod room;
pub mod signaling;
mod types;
pub mod vp8;

pub use config::{InspectorConfig, RouterConfig, SfuConfig, WebRtcTransportConfig};
pub use error::{ErrorPayload, Result, SfuError};
pub use inspector::{FailureReason, Inspector};
pub use manager::SfuManager;
pub use peer::SfuPeer;
pub use room::{RoomInfo, SfuRoom, TrackInfo, UserInfo};
pub use signaling::{Ack, Connection, InboundRequest, ServerEvent, SignalingChannel};
pub use types::{PeerId, RoomId, TrackId};
pub use vp8::{FrameTag, Resolution};
