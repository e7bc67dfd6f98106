//! WebSocket pinger using `tokio-tungstenite`.
//!
//! Connects once per region and measures ping/pong frames on that
//! connection. The pong payload must echo the one-byte id of the ping.
//!
//! # Feature gate
//!
//! This module is only available when the `transport-websocket` feature is
//! enabled (it is enabled by default).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::error::{RealtimeError, Result};
use crate::region::Pinger;

/// Type alias for the underlying WebSocket stream.
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`Pinger`] measuring WebSocket ping/pong round trips.
#[derive(Default)]
pub struct WebSocketPinger {
    connections: Mutex<HashMap<String, WsStream>>,
}

impl std::fmt::Debug for WebSocketPinger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketPinger").finish_non_exhaustive()
    }
}

/// `target` with a `ws://` scheme added when it has none.
pub fn ws_url(target: &str) -> String {
    if target.contains("://") {
        target.to_string()
    } else {
        format!("ws://{target}")
    }
}

impl WebSocketPinger {
    pub fn new() -> Self {
        Self::default()
    }

    async fn connect(url: &str) -> Result<WsStream> {
        tracing::debug!(url = %url, "connecting WebSocket pinger");
        let (stream, _response) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
            let kind = match &e {
                tokio_tungstenite::tungstenite::Error::Io(io) => io.kind(),
                _ => std::io::ErrorKind::Other,
            };
            RealtimeError::Io(std::io::Error::new(kind, e))
        })?;
        Ok(stream)
    }

    async fn round_trip(&self, url: &str) -> Result<Duration> {
        let cached = self.connections.lock().await.remove(url);
        let mut stream = match cached {
            Some(stream) => stream,
            None => Self::connect(url).await?,
        };

        let id = uuid::Uuid::new_v4().as_bytes().first().copied().unwrap_or(0);
        let started = Instant::now();
        stream
            .send(Message::Ping(vec![id].into()))
            .await
            .map_err(|e| RealtimeError::Transport(e.to_string()))?;

        loop {
            match stream.next().await {
                Some(Ok(Message::Pong(payload))) if payload.iter().copied().eq([id]) => {
                    let rtt = started.elapsed();
                    self.connections.lock().await.insert(url.to_string(), stream);
                    return Ok(rtt);
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(RealtimeError::Transport("ping connection closed".into()));
                }
                Some(Err(e)) => return Err(RealtimeError::Transport(e.to_string())),
                Some(Ok(_)) => {}
            }
        }
    }
}

#[async_trait]
impl Pinger for WebSocketPinger {
    async fn ping(&self, target: &str, timeout: Duration) -> Result<Duration> {
        let url = ws_url(target);
        tokio::time::timeout(timeout, self.round_trip(&url))
            .await
            .map_err(|_| RealtimeError::Timeout)?
    }

    fn keeps_scheme(&self) -> bool {
        true
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn pinger_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<WebSocketPinger>();
    }

    #[test]
    fn scheme_is_added_when_missing() {
        assert_eq!(ws_url("eu.example"), "ws://eu.example");
        assert_eq!(ws_url("wss://eu.example"), "wss://eu.example");
    }

    /// Local WebSocket server answering pings on one connection.
    async fn start_pong_server() -> (String, tokio::task::JoinHandle<usize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut accepted = 0;
            while let Ok((tcp, _)) = listener.accept().await {
                accepted += 1;
                let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                tokio::spawn(async move {
                    // tungstenite answers pings while the stream is read.
                    while let Some(Ok(_)) = ws.next().await {}
                });
                if accepted == 2 {
                    break;
                }
            }
            accepted
        });
        (format!("ws://{addr}"), handle)
    }

    #[tokio::test]
    async fn measures_pong_and_reuses_connection() {
        let (url, server) = start_pong_server().await;
        let pinger = WebSocketPinger::new();

        pinger.ping(&url, Duration::from_secs(2)).await.unwrap();
        pinger.ping(&url, Duration::from_secs(2)).await.unwrap();

        assert_eq!(pinger.connections.lock().await.len(), 1);
        server.abort();
    }

    #[tokio::test]
    async fn unreachable_host_fails() {
        let pinger = WebSocketPinger::new();
        let err = pinger
            .ping("ws://127.0.0.1:1", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, RealtimeError::Io(_) | RealtimeError::Timeout));
    }
}
