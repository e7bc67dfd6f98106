//! Concrete [`Pinger`](crate::region::Pinger) implementations.
//!
//! | Feature                | Pinger              |
//! |------------------------|---------------------|
//! | (always)               | [`UdpPinger`]       |
//! | `transport-websocket`  | [`WebSocketPinger`] |

pub mod udp;
#[cfg(feature = "transport-websocket")]
pub mod websocket;

pub use udp::UdpPinger;
#[cfg(feature = "transport-websocket")]
pub use websocket::WebSocketPinger;
