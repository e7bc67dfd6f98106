//! Keep-alive while the host cannot call `service()`.
//!
//! A backgrounded host keeps its connection by calling
//! [`RealtimeClient::heartbeat`], which only sends acknowledgements. Once the
//! last `service()` is older than the keep-alive window the client
//! disconnects with [`DisconnectCause::ClientServiceInactivity`].
//! [`KeepAlive`] is a host-owned timer task doing this on an interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::client::RealtimeClient;
use crate::error_codes::DisconnectCause;
use crate::state::ClientState;
use crate::transport::Peer;

impl<P: Peer> RealtimeClient<P> {
    /// Sends acknowledgements without dispatching anything.
    ///
    /// Returns `false` when nothing was sent: the client is not connected,
    /// or the keep-alive window elapsed and the client started disconnecting.
    pub fn heartbeat(&mut self) -> bool {
        if matches!(
            self.state,
            ClientState::PeerCreated | ClientState::Disconnected | ClientState::Disconnecting
        ) {
            return false;
        }
        let idle = self.last_service.elapsed();
        if idle > self.keep_alive_in_background {
            warn!(idle = ?idle, "service not called within keep-alive window");
            self.disconnect_with(DisconnectCause::ClientServiceInactivity);
            return false;
        }
        self.peer.send_acks();
        true
    }
}

/// Timer task calling [`RealtimeClient::heartbeat`] on a shared client.
///
/// Stops on [`stop`](Self::stop) or when dropped.
#[derive(Debug)]
pub struct KeepAlive {
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl KeepAlive {
    /// Spawns the timer on the current tokio runtime.
    pub fn spawn<P: Peer>(client: Arc<Mutex<RealtimeClient<P>>>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let sent = client.lock().await.heartbeat();
                        debug!(sent, "keep-alive tick");
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("keep-alive stopped");
                            break;
                        }
                    }
                }
            }
        });
        Self {
            shutdown_tx,
            handle: Some(handle),
        }
    }

    /// Stops the timer and waits for the task to finish.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
