//! UDP echo pinger.
//!
//! Sends a 13-byte datagram (`0x7d` twelve times, then a random id byte) and
//! waits for the server to echo it. Replies with another length or id are
//! ignored.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::error::{RealtimeError, Result};
use crate::region::Pinger;

/// Default port of the region ping service.
pub const DEFAULT_PING_PORT: u16 = 5056;

const PING_LEN: usize = 13;
const PING_FILL: u8 = 0x7d;

/// Builds a ping datagram carrying `id` in its last byte.
pub fn ping_packet(id: u8) -> [u8; PING_LEN] {
    let mut packet = [PING_FILL; PING_LEN];
    if let Some(last) = packet.last_mut() {
        *last = id;
    }
    packet
}

/// Whether `reply` answers the ping with `id`.
pub fn is_reply(reply: &[u8], id: u8) -> bool {
    reply.len() == PING_LEN && reply.last() == Some(&id)
}

#[derive(Debug, Clone)]
pub struct UdpPinger {
    port: u16,
}

impl Default for UdpPinger {
    fn default() -> Self {
        Self::new(DEFAULT_PING_PORT)
    }
}

impl UdpPinger {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    async fn round_trip(&self, host: &str) -> Result<Duration> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((host, self.port)).await?;

        let id = uuid::Uuid::new_v4().as_bytes().first().copied().unwrap_or(0);
        let packet = ping_packet(id);
        let started = Instant::now();
        socket.send(&packet).await?;

        let mut buf = [0u8; 64];
        loop {
            let n = socket.recv(&mut buf).await?;
            if buf.get(..n).is_some_and(|reply| is_reply(reply, id)) {
                return Ok(started.elapsed());
            }
            tracing::debug!(host = %host, len = n, "ignoring unrelated ping reply");
        }
    }
}

#[async_trait]
impl Pinger for UdpPinger {
    async fn ping(&self, target: &str, timeout: Duration) -> Result<Duration> {
        tokio::time::timeout(timeout, self.round_trip(target))
            .await
            .map_err(|_| RealtimeError::Timeout)?
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
    use super::*;

    #[test]
    fn packet_layout() {
        let packet = ping_packet(0x42);
        assert_eq!(packet.len(), 13);
        assert!(packet[..12].iter().all(|b| *b == 0x7d));
        assert_eq!(packet[12], 0x42);
    }

    #[test]
    fn reply_must_match_length_and_id() {
        assert!(is_reply(&ping_packet(7), 7));
        assert!(!is_reply(&ping_packet(7), 8));
        assert!(!is_reply(&[0x7d, 7], 7));
    }

    #[tokio::test]
    async fn echo_server_round_trip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            // A stray datagram first, then the echo.
            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            server.send_to(&[1, 2, 3], from).await.unwrap();
            server.send_to(&buf[..n], from).await.unwrap();
        });

        let pinger = UdpPinger::new(port);
        let rtt = pinger.ping("127.0.0.1", Duration::from_secs(2)).await.unwrap();
        assert!(rtt < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();

        let pinger = UdpPinger::new(port);
        let err = pinger
            .ping("127.0.0.1", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RealtimeError::Timeout));
        drop(server);
    }
}
