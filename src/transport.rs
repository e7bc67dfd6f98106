//! Peer abstraction consumed by the connection state machine.
//!
//! A [`Peer`] owns one connection at a time and the byte-level codec of the
//! relay protocol. The state machine never blocks on it: every call returns
//! immediately, and everything the servers sent is collected by the next
//! [`service`](Peer::service) call, in delivery order.
//!
//! # Implementing a Custom Peer
//!
//! ```rust,no_run
//! use relay_realtime_client::protocol::{OperationRequest, PeerMessage};
//! use relay_realtime_client::settings::ConnectionProtocol;
//! use relay_realtime_client::transport::Peer;
//! use relay_realtime_client::RealtimeError;
//!
//! struct MyPeer { /* socket, codec, inbox ... */ }
//!
//! impl Peer for MyPeer {
//!     fn connect(&mut self, address: &str, app_id: &str, token: Option<&str>) -> bool {
//!         // Start connecting; report `StatusCode::Connect` from `service` later.
//!         todo!()
//!     }
//!
//!     fn disconnect(&mut self) {
//!         // Start closing; report `StatusCode::Disconnect` from `service` later.
//!         todo!()
//!     }
//!
//!     fn send_operation(&mut self, request: &OperationRequest, reliable: bool) -> bool {
//!         todo!()
//!     }
//!
//!     fn establish_encryption(&mut self) -> bool {
//!         // Return false when the link is already secure (e.g. wss).
//!         false
//!     }
//!
//!     fn service(&mut self) -> Result<Vec<PeerMessage>, RealtimeError> {
//!         todo!()
//!     }
//!
//!     fn send_acks(&mut self) {}
//!
//!     fn set_protocol(&mut self, protocol: ConnectionProtocol) {}
//! }
//! ```

use crate::error::RealtimeError;
use crate::protocol::{OperationRequest, PeerMessage};
use crate::settings::ConnectionProtocol;

/// One connection to a directory, matchmaking or relay server.
///
/// # Object Safety
///
/// This trait is object-safe, so `Box<dyn Peer>` works for dynamic dispatch.
/// The client is generic over `P: Peer` for the common case.
pub trait Peer: Send + 'static {
    /// Start connecting to `address`.
    ///
    /// `token` is the authentication token presented on connect when the
    /// client authenticates once. Returns `false` if the attempt could not
    /// be started; the outcome is reported later as a status message.
    fn connect(&mut self, address: &str, app_id: &str, token: Option<&str>) -> bool;

    /// Start closing the current connection.
    fn disconnect(&mut self);

    /// Queue an operation. Returns `false` if it could not be queued.
    fn send_operation(&mut self, request: &OperationRequest, reliable: bool) -> bool;

    /// Start the encryption handshake.
    ///
    /// Returns `false` when the connection is already secure and no
    /// handshake takes place; the client then proceeds as if encryption was
    /// established.
    fn establish_encryption(&mut self) -> bool;

    /// Run one send/receive cycle and return everything received.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::Transport`] if the peer failed irrecoverably.
    fn service(&mut self) -> Result<Vec<PeerMessage>, RealtimeError>;

    /// Send acknowledgements only, keeping the connection alive without
    /// dispatching anything.
    fn send_acks(&mut self);

    /// Switch the protocol used by the next [`connect`](Peer::connect).
    fn set_protocol(&mut self, protocol: ConnectionProtocol);
}

impl<P: Peer + ?Sized> Peer for Box<P> {
    fn connect(&mut self, address: &str, app_id: &str, token: Option<&str>) -> bool {
        (**self).connect(address, app_id, token)
    }

    fn disconnect(&mut self) {
        (**self).disconnect();
    }

    fn send_operation(&mut self, request: &OperationRequest, reliable: bool) -> bool {
        (**self).send_operation(request, reliable)
    }

    fn establish_encryption(&mut self) -> bool {
        (**self).establish_encryption()
    }

    fn service(&mut self) -> Result<Vec<PeerMessage>, RealtimeError> {
        (**self).service()
    }

    fn send_acks(&mut self) {
        (**self).send_acks();
    }

    fn set_protocol(&mut self, protocol: ConnectionProtocol) {
        (**self).set_protocol(protocol);
    }
}
