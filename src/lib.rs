//! # Relay Realtime Client
//!
//! Client-side connection and matchmaking engine for a multiplayer relay
//! service.
//!
//! A client hops between three server roles: the directory server hands out
//! regions and a matchmaker address, the matchmaker finds or creates a room,
//! and the relay server hosts it. [`RealtimeClient`] is the state machine
//! driving those hops; [`AsyncClient`] wraps every call in an awaitable
//! operation.
//!
//! ## Features
//!
//! - **Peer-agnostic**: implement the [`Peer`] trait for any wire codec
//! - **Region selection**: concurrent pinging with stickiness to a cached best region
//! - **Intent replay**: room entry found on the matchmaker is replayed on the relay
//! - **Awaitable operations**: exactly-once settlement with deadline and cancellation
//! - **Workflows**: [`workflow::connect_to_room`] and [`workflow::reconnect_to_room`]
//!
//! ## Quick Start
//!
//! ```ignore
//! use relay_realtime_client::{AppSettings, AsyncClient, RealtimeClient};
//! use relay_realtime_client::intent::EnterRoomArgs;
//!
//! # async fn run(peer: impl relay_realtime_client::Peer) -> relay_realtime_client::Result<()> {
//! let client = AsyncClient::new(RealtimeClient::new(peer));
//! client.connect_using_settings_async(AppSettings::new("my-app-id")).await?;
//! client
//!     .join_or_create_room_async(EnterRoomArgs::new().with_room_name("lobby-1"), true)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod callbacks;
pub mod client;
pub mod error;
pub mod error_codes;
pub mod event;
pub mod heartbeat;
pub mod intent;
mod matchmaking;
pub mod pingers;
pub mod protocol;
pub mod region;
pub mod room;
pub mod settings;
pub mod state;
pub mod transport;
pub mod workflow;

// Re-export primary types for ergonomic imports.
pub use bridge::{AsyncClient, PendingOperation};
pub use callbacks::{ListenerId, Subscriber};
pub use client::RealtimeClient;
pub use error::{RealtimeError, Result};
pub use error_codes::{DisconnectCause, ErrorCode, OK};
pub use event::{ClientEvent, EventCategory};
pub use heartbeat::KeepAlive;
pub use protocol::PeerMessage;
pub use region::{Pinger, Region};
pub use settings::{AppSettings, AsyncConfig, AuthMode, AuthValues, ConnectionProtocol};
pub use state::{ClientState, ServerRole};
pub use transport::Peer;
pub use workflow::{MatchmakingArguments, ReconnectInformation};
