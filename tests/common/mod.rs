#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for relay client integration tests.
//!
//! Provides [`FakeServerPeer`], a scripted in-memory stand-in for the
//! directory, matchmaker and relay servers, and [`MockPinger`] with fixed
//! round-trip times per host.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use relay_realtime_client::error_codes::OK;
use relay_realtime_client::protocol::{
    param, EventCode, EventData, OperationCode, OperationRequest, OperationResponse, ParamValue,
    PeerMessage, StatusCode,
};
use relay_realtime_client::region::Pinger;
use relay_realtime_client::settings::{AppSettings, AsyncConfig, ConnectionProtocol};
use relay_realtime_client::{AsyncClient, RealtimeClient, RealtimeError};

pub const DIRECTORY_HOST: &str = "directory";
pub const MATCHMAKER_ADDRESS: &str = "matchmaker:5055";
pub const RELAY_ADDRESS: &str = "relay:5056";

// ── Script ──────────────────────────────────────────────────────────

/// How the fake servers answer.
#[derive(Debug, Clone)]
pub struct Script {
    /// `(code, address)` pairs returned by `GetRegions`.
    pub regions: Vec<(String, String)>,
    /// Return code of directory authentication.
    pub auth_code: i16,
    /// Return codes of room entry on the matchmaker, consumed in order;
    /// `OK` once exhausted.
    pub matchmaker_entry: VecDeque<i16>,
    /// Return codes of room entry on the relay, consumed in order; `OK`
    /// once exhausted.
    pub relay_entry: VecDeque<i16>,
    /// Actor number assigned on the relay.
    pub actor_number: i32,
    /// Answer room entry on the relay with a join event for the local actor.
    pub send_join_event: bool,
    /// Directory connects failing with `ExceptionOnConnect` before one succeeds.
    pub directory_connect_failures: usize,
    /// Return code of `JoinLobby` on the matchmaker.
    pub lobby_code: i16,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            regions: vec![
                ("eu".into(), "eu-host:5055".into()),
                ("us".into(), "us-host:5055".into()),
            ],
            auth_code: OK,
            matchmaker_entry: VecDeque::new(),
            relay_entry: VecDeque::new(),
            actor_number: 1,
            send_join_event: true,
            directory_connect_failures: 0,
            lobby_code: OK,
        }
    }
}

// ── FakeServerPeer ──────────────────────────────────────────────────

/// What the fake servers observed.
#[derive(Debug, Clone, Default)]
pub struct ServerLog {
    /// Addresses connected to, in order.
    pub connects: Vec<String>,
    /// Token presented with each connect.
    pub connect_tokens: Vec<Option<String>>,
    /// `(address, request)` for every operation sent.
    pub sent: Vec<(String, OperationRequest)>,
    pub disconnects: usize,
    pub acks: usize,
    pub protocols: Vec<ConnectionProtocol>,
}

impl ServerLog {
    pub fn ops_to(&self, address_prefix: &str) -> Vec<OperationCode> {
        self.sent
            .iter()
            .filter(|(address, _)| address.starts_with(address_prefix))
            .map(|(_, request)| request.code)
            .collect()
    }

    pub fn last_request(&self, op: OperationCode) -> Option<&OperationRequest> {
        self.sent
            .iter()
            .rev()
            .map(|(_, request)| request)
            .find(|request| request.code == op)
    }
}

#[derive(Debug, Default)]
struct Inner {
    script: Script,
    log: ServerLog,
    connected_to: Option<String>,
    inbox: VecDeque<PeerMessage>,
    fail_service: bool,
}

/// In-memory peer answering like the three server roles, chosen by the
/// connected address.
///
/// Every connect is followed by exactly one `Disconnect` status, reported
/// after [`Peer::disconnect`](relay_realtime_client::Peer::disconnect) or
/// [`FakeServerPeer::drop_connection`].
#[derive(Debug, Clone, Default)]
pub struct FakeServerPeer {
    inner: Arc<StdMutex<Inner>>,
}

impl FakeServerPeer {
    pub fn new(script: Script) -> Self {
        let peer = Self::default();
        peer.lock().script = script;
        peer
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Snapshot of what the servers observed so far.
    pub fn log(&self) -> ServerLog {
        self.lock().log.clone()
    }

    /// Changes the script mid-test.
    pub fn edit_script(&self, edit: impl FnOnce(&mut Script)) {
        edit(&mut self.lock().script);
    }

    pub fn connected_to(&self) -> Option<String> {
        self.lock().connected_to.clone()
    }

    /// Queues a message for the next `service` call.
    pub fn push(&self, message: PeerMessage) {
        self.lock().inbox.push_back(message);
    }

    /// Server-side connection loss reported with `status`.
    pub fn drop_connection(&self, status: StatusCode) {
        let mut inner = self.lock();
        if inner.connected_to.take().is_some() {
            inner.inbox.push_back(PeerMessage::Status(status));
            inner.inbox.push_back(PeerMessage::Status(StatusCode::Disconnect));
        }
    }

    /// Makes the next `service` call fail.
    pub fn fail_next_service(&self) {
        self.lock().fail_service = true;
    }
}

impl Inner {
    fn respond(&mut self, response: OperationResponse) {
        self.inbox.push_back(PeerMessage::OperationResponse(response));
    }

    fn handle(&mut self, address: &str, request: &OperationRequest) {
        let op = request.code;
        if address.starts_with(DIRECTORY_HOST) {
            self.handle_directory(request);
        } else if address.starts_with("matchmaker") {
            self.handle_matchmaker(request);
        } else if address.starts_with("relay") {
            self.handle_relay(request);
        } else {
            self.respond(OperationResponse::failed(op, -2, "unknown server"));
        }
    }

    fn handle_directory(&mut self, request: &OperationRequest) {
        let op = request.code;
        match op {
            OperationCode::GetRegions => {
                let (codes, addresses): (Vec<String>, Vec<String>) =
                    self.script.regions.iter().cloned().unzip();
                self.respond(
                    OperationResponse::ok(op)
                        .with(param::REGION, ParamValue::StringArray(codes))
                        .with(param::ADDRESS, ParamValue::StringArray(addresses)),
                );
            }
            OperationCode::Authenticate | OperationCode::AuthenticateOnce => {
                if self.script.auth_code != OK {
                    let code = self.script.auth_code;
                    self.respond(OperationResponse::failed(op, code, "authentication rejected"));
                    return;
                }
                let user_id = request
                    .get(param::USER_ID)
                    .and_then(ParamValue::as_str)
                    .unwrap_or("server-assigned")
                    .to_string();
                self.respond(
                    OperationResponse::ok(op)
                        .with(param::ADDRESS, MATCHMAKER_ADDRESS)
                        .with(param::TOKEN, "token-1")
                        .with(param::USER_ID, user_id)
                        .with(param::CLUSTER, "default"),
                );
            }
            _ => self.respond(OperationResponse::failed(op, -2, "not on the directory")),
        }
    }

    fn handle_matchmaker(&mut self, request: &OperationRequest) {
        let op = request.code;
        match op {
            OperationCode::Authenticate | OperationCode::AuthenticateOnce => {
                self.respond(OperationResponse::ok(op).with(param::TOKEN, "token-2"));
            }
            OperationCode::CreateRoom | OperationCode::JoinRoom | OperationCode::JoinRandomRoom => {
                let code = self.script.matchmaker_entry.pop_front().unwrap_or(OK);
                if code != OK {
                    self.respond(OperationResponse::failed(op, code, "no match"));
                    return;
                }
                let name = room_name(request);
                self.respond(
                    OperationResponse::ok(op)
                        .with(param::ADDRESS, RELAY_ADDRESS)
                        .with(param::ROOM_NAME, name),
                );
            }
            OperationCode::JoinLobby if self.script.lobby_code != OK => {
                let code = self.script.lobby_code;
                self.respond(OperationResponse::failed(op, code, "lobby refused"));
            }
            _ => self.respond(OperationResponse::ok(op)),
        }
    }

    fn handle_relay(&mut self, request: &OperationRequest) {
        let op = request.code;
        match op {
            OperationCode::Authenticate | OperationCode::AuthenticateOnce => {
                self.respond(OperationResponse::ok(op).with(param::TOKEN, "token-3"));
            }
            OperationCode::CreateRoom | OperationCode::JoinRoom => {
                let code = self.script.relay_entry.pop_front().unwrap_or(OK);
                if code != OK {
                    self.respond(OperationResponse::failed(op, code, "relay refused entry"));
                    return;
                }
                let actor = self.script.actor_number;
                self.respond(
                    OperationResponse::ok(op)
                        .with(param::ROOM_NAME, room_name(request))
                        .with(param::ACTOR_NR, actor)
                        .with(param::MASTER_CLIENT_ID, 1)
                        .with(param::ACTOR_LIST, ParamValue::IntArray(vec![actor])),
                );
                if self.script.send_join_event {
                    self.inbox.push_back(PeerMessage::Event(
                        EventData::new(EventCode::Join)
                            .with(param::ACTOR_NR, actor)
                            .with(param::ACTOR_LIST, ParamValue::IntArray(vec![actor])),
                    ));
                }
            }
            _ => self.respond(OperationResponse::ok(op)),
        }
    }
}

fn room_name(request: &OperationRequest) -> String {
    request
        .get(param::ROOM_NAME)
        .and_then(ParamValue::as_str)
        .unwrap_or("random-room")
        .to_string()
}

impl relay_realtime_client::Peer for FakeServerPeer {
    fn connect(&mut self, address: &str, _app_id: &str, token: Option<&str>) -> bool {
        let mut inner = self.lock();
        if inner.connected_to.is_some() {
            return false;
        }
        inner.log.connects.push(address.to_string());
        inner.log.connect_tokens.push(token.map(str::to_string));
        if address.starts_with(DIRECTORY_HOST) && inner.script.directory_connect_failures > 0 {
            inner.script.directory_connect_failures -= 1;
            inner.inbox.push_back(PeerMessage::Status(StatusCode::ExceptionOnConnect));
            inner.inbox.push_back(PeerMessage::Status(StatusCode::Disconnect));
            return true;
        }
        inner.connected_to = Some(address.to_string());
        inner.inbox.push_back(PeerMessage::Status(StatusCode::Connect));
        // A token on connect authenticates right away.
        if token.is_some() && !address.starts_with(DIRECTORY_HOST) {
            inner.respond(
                OperationResponse::ok(OperationCode::Authenticate).with(param::TOKEN, "token-once"),
            );
        }
        true
    }

    fn disconnect(&mut self) {
        let mut inner = self.lock();
        if inner.connected_to.take().is_some() {
            inner.log.disconnects += 1;
            inner.inbox.push_back(PeerMessage::Status(StatusCode::Disconnect));
        }
    }

    fn send_operation(&mut self, request: &OperationRequest, _reliable: bool) -> bool {
        let mut inner = self.lock();
        let Some(address) = inner.connected_to.clone() else {
            return false;
        };
        inner.log.sent.push((address.clone(), request.clone()));
        inner.handle(&address, request);
        true
    }

    fn establish_encryption(&mut self) -> bool {
        false
    }

    fn service(&mut self) -> Result<Vec<PeerMessage>, RealtimeError> {
        let mut inner = self.lock();
        if std::mem::take(&mut inner.fail_service) {
            return Err(RealtimeError::Transport("socket closed".into()));
        }
        Ok(inner.inbox.drain(..).collect())
    }

    fn send_acks(&mut self) {
        self.lock().log.acks += 1;
    }

    fn set_protocol(&mut self, protocol: ConnectionProtocol) {
        self.lock().log.protocols.push(protocol);
    }
}

// ── MockPinger ──────────────────────────────────────────────────────

/// Pinger answering with a fixed round trip per host; unknown hosts fail.
#[derive(Debug, Default)]
pub struct MockPinger {
    rtts: HashMap<String, Duration>,
    /// Sleep for the round trip before answering.
    delayed: bool,
}

impl MockPinger {
    pub fn new(rtts: &[(&str, u64)]) -> Self {
        Self {
            rtts: rtts
                .iter()
                .map(|(host, ms)| ((*host).to_string(), Duration::from_millis(*ms)))
                .collect(),
            delayed: false,
        }
    }

    /// Answers only after the round trip elapsed on the tokio clock.
    #[must_use]
    pub fn delayed(mut self) -> Self {
        self.delayed = true;
        self
    }
}

#[async_trait]
impl Pinger for MockPinger {
    async fn ping(&self, target: &str, _timeout: Duration) -> Result<Duration, RealtimeError> {
        let rtt = self
            .rtts
            .get(target)
            .copied()
            .ok_or_else(|| RealtimeError::Transport(format!("no route to {target}")))?;
        if self.delayed {
            tokio::time::sleep(rtt).await;
        }
        Ok(rtt)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Settings pointing at the fake directory.
pub fn settings() -> AppSettings {
    AppSettings::new("test-app")
        .with_app_version("1.0")
        .with_directory(DIRECTORY_HOST, 27000)
}

/// Routes client logs to the test harness; filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Async client over `peer`, pinging `eu` at 20 ms and `us` at 80 ms.
pub fn async_client(peer: &FakeServerPeer) -> AsyncClient<FakeServerPeer> {
    init_tracing();
    let pinger = MockPinger::new(&[("eu-host", 20), ("us-host", 80)]);
    let client = RealtimeClient::with_pinger(peer.clone(), Arc::new(pinger));
    AsyncClient::new(client).with_config(
        AsyncConfig::new()
            .with_service_interval(Duration::from_millis(1))
            .with_operation_timeout(Duration::from_secs(5)),
    )
}
