//! # Connect To Room Example
//!
//! Walks the whole client lifecycle against an in-process peer that answers
//! like the directory, matchmaker and relay servers:
//!
//! 1. Load matchmaking arguments (JSON from `RELAY_ARGS`, or defaults)
//! 2. Connect, pick a region and enter a room with `connect_to_room`
//! 3. Keep the connection alive with a `KeepAlive` timer
//! 4. Leave the room and disconnect
//!
//! A real application plugs its own [`Peer`] implementation, which owns the
//! socket and the wire codec, in place of `LoopbackPeer`.
//!
//! ## Running
//!
//! ```sh
//! cargo run --example connect_to_room
//!
//! # Verbose state machine logs:
//! RUST_LOG=debug cargo run --example connect_to_room
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_realtime_client::protocol::{
    param, EventCode, EventData, OperationCode, OperationRequest, OperationResponse, ParamValue,
    PeerMessage, StatusCode,
};
use relay_realtime_client::region::Pinger;
use relay_realtime_client::settings::{AppSettings, ConnectionProtocol};
use relay_realtime_client::workflow::connect_to_room;
use relay_realtime_client::{
    AsyncClient, ClientEvent, KeepAlive, MatchmakingArguments, Peer, RealtimeClient, RealtimeError,
};

// ── Loopback peer ───────────────────────────────────────────────────

/// Answers every request immediately, choosing the server role by address.
#[derive(Default)]
struct LoopbackPeer {
    connected_to: Option<String>,
    inbox: VecDeque<PeerMessage>,
}

impl LoopbackPeer {
    fn answer(&mut self, address: &str, request: &OperationRequest) {
        let op = request.code;
        let room = request
            .get(param::ROOM_NAME)
            .and_then(ParamValue::as_str)
            .unwrap_or("demo-room")
            .to_string();
        let response = match (address.split(':').next().unwrap_or_default(), op) {
            ("directory", OperationCode::GetRegions) => OperationResponse::ok(op)
                .with(param::REGION, ParamValue::StringArray(vec!["eu".into(), "us".into()]))
                .with(
                    param::ADDRESS,
                    ParamValue::StringArray(vec!["eu.local:5055".into(), "us.local:5055".into()]),
                ),
            ("directory", _) => OperationResponse::ok(op)
                .with(param::ADDRESS, "matchmaker:5055")
                .with(param::TOKEN, "demo-token")
                .with(param::USER_ID, "demo-user"),
            ("matchmaker", OperationCode::CreateRoom | OperationCode::JoinRoom | OperationCode::JoinRandomRoom) => {
                OperationResponse::ok(op)
                    .with(param::ADDRESS, "relay:5056")
                    .with(param::ROOM_NAME, room)
            }
            ("relay", OperationCode::CreateRoom | OperationCode::JoinRoom) => {
                self.inbox.push_back(PeerMessage::OperationResponse(
                    OperationResponse::ok(op)
                        .with(param::ROOM_NAME, room)
                        .with(param::ACTOR_NR, 1),
                ));
                self.inbox
                    .push_back(PeerMessage::Event(EventData::new(EventCode::Join).with(param::ACTOR_NR, 1)));
                return;
            }
            _ => OperationResponse::ok(op),
        };
        self.inbox.push_back(PeerMessage::OperationResponse(response));
    }
}

impl Peer for LoopbackPeer {
    fn connect(&mut self, address: &str, _app_id: &str, _token: Option<&str>) -> bool {
        self.connected_to = Some(address.to_string());
        self.inbox.push_back(PeerMessage::Status(StatusCode::Connect));
        true
    }

    fn disconnect(&mut self) {
        if self.connected_to.take().is_some() {
            self.inbox.push_back(PeerMessage::Status(StatusCode::Disconnect));
        }
    }

    fn send_operation(&mut self, request: &OperationRequest, _reliable: bool) -> bool {
        let Some(address) = self.connected_to.clone() else {
            return false;
        };
        self.answer(&address, request);
        true
    }

    fn establish_encryption(&mut self) -> bool {
        false
    }

    fn service(&mut self) -> Result<Vec<PeerMessage>, RealtimeError> {
        Ok(self.inbox.drain(..).collect())
    }

    fn send_acks(&mut self) {}

    fn set_protocol(&mut self, _protocol: ConnectionProtocol) {}
}

/// Pretends `eu` is closer than `us`.
struct LoopbackPinger;

#[async_trait]
impl Pinger for LoopbackPinger {
    async fn ping(&self, target: &str, _timeout: Duration) -> Result<Duration, RealtimeError> {
        let ms = if target.starts_with("eu") { 25 } else { 90 };
        Ok(Duration::from_millis(ms))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let mut args = match std::env::var("RELAY_ARGS") {
        Ok(json) => serde_json::from_str::<MatchmakingArguments>(&json)?,
        Err(_) => MatchmakingArguments::new(
            AppSettings::new("demo-app")
                .with_app_version("1.0")
                .with_directory("directory", 27000),
        )
        .with_room_name("demo-room")
        .with_max_players(4)
        .with_player_ttl_secs(10),
    };

    // ── Connect ─────────────────────────────────────────────────────
    let client = AsyncClient::new(RealtimeClient::with_pinger(
        LoopbackPeer::default(),
        Arc::new(LoopbackPinger),
    ));
    let (_listener, mut events) = client.lock().await.subscriber().channel(64);
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::StateChanged { current, .. } => tracing::debug!(state = ?current, "state"),
                other => tracing::info!(event = ?other, "event"),
            }
        }
    });

    connect_to_room(&client, &mut args).await?;
    {
        let c = client.lock().await;
        tracing::info!(
            region = ?c.current_region(),
            room = ?c.room().map(|r| r.name.as_str()),
            "in room"
        );
    }
    if let Some(info) = &args.reconnect_info {
        tracing::info!(reconnect = %serde_json::to_string(info)?, "persist this to rejoin later");
    }

    // ── Background keep-alive ───────────────────────────────────────
    let keep_alive = KeepAlive::spawn(client.shared(), Duration::from_millis(500));
    tokio::time::sleep(Duration::from_secs(1)).await;
    keep_alive.stop().await;

    // ── Shutdown ────────────────────────────────────────────────────
    client.leave_room_async(false).await?;
    client.disconnect_async().await?;
    drop(client);
    let _ = printer.await;
    tracing::info!("done");
    Ok(())
}
