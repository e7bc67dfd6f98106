//! Connection state machine for the directory, matchmaker and relay hops.
//!
//! [`RealtimeClient`] is driven from one context: the host calls operations
//! (which return whether the request was accepted for sending) and calls
//! [`service`](RealtimeClient::service) regularly. Everything the peer
//! received is handled inside `service`, which is the only place state and
//! server role change in response to the servers.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut client = RealtimeClient::new(peer);
//! let sub = client.subscriber();
//! sub.subscribe(EventCategory::Connection, |event| println!("{event:?}"));
//!
//! client.connect_using_settings(AppSettings::new("app-id").with_app_version("1.0"));
//! loop {
//!     client.service()?;
//!     if client.state() == ClientState::ConnectedToMatchmaker {
//!         client.op_join_random_room(JoinRandomArgs::new());
//!     }
//!     tokio::time::sleep(Duration::from_millis(10)).await;
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::callbacks::{CallbackRegistry, Subscriber};
use crate::error::{RealtimeError, Result};
use crate::error_codes::{DisconnectCause, ErrorCode};
use crate::event::ClientEvent;
use crate::intent::{EnterRoomArgs, JoinIntent};
use crate::pingers::UdpPinger;
use crate::protocol::{
    actor_key, custom_keys_valid, param, EventCode, EventData, OperationCode, OperationRequest,
    OperationResponse, ParamValue, PeerMessage, PropertyKey, PropertyMap, StatusCode,
};
use crate::region::{PingOutcome, Pinger, Region, RegionSelector};
use crate::room::{Lobby, Room, RoomInfo};
use crate::settings::{AppSettings, AuthMode, AuthValues, ConnectionProtocol, CustomAuthType};
use crate::state::{ClientState, ServerRole};
use crate::transport::Peer;

/// Default time without `service()` after which
/// [`heartbeat`](RealtimeClient::heartbeat) disconnects.
pub const DEFAULT_KEEP_ALIVE_IN_BACKGROUND: Duration = Duration::from_secs(60);

/// Client for the relay service.
pub struct RealtimeClient<P: Peer> {
    pub(crate) peer: P,
    pub(crate) settings: AppSettings,
    pub(crate) auth_values: AuthValues,
    pub(crate) state: ClientState,
    pub(crate) role: ServerRole,
    pub(crate) disconnect_cause: DisconnectCause,
    pub(crate) protocol: ConnectionProtocol,
    pub(crate) fallback_used: bool,
    /// `Connected` fires once per session.
    pub(crate) session_connected: bool,

    pub(crate) directory_address: String,
    pub(crate) matchmaker_address: Option<String>,
    pub(crate) relay_address: Option<String>,
    pub(crate) cluster: Option<String>,
    pub(crate) current_region: Option<String>,
    pub(crate) regions: RegionSelector,

    pub(crate) callbacks: CallbackRegistry,

    pub(crate) nick_name: String,
    pub(crate) local_properties: PropertyMap,
    pub(crate) intent: Option<JoinIntent>,
    /// Relay-side entry failure, reported once back on the matchmaker.
    pub(crate) failed_entry: Option<OperationResponse>,
    /// Relay entry succeeded; waiting for the local actor's join event.
    /// Holds whether this client created the room.
    pub(crate) pending_join: Option<bool>,
    /// Room last entered, for rejoining after a connection loss.
    pub(crate) last_room: Option<EnterRoomArgs>,
    pub(crate) room: Option<Room>,
    pub(crate) in_lobby: bool,
    pub(crate) current_lobby: Lobby,
    pub(crate) room_list: BTreeMap<String, RoomInfo>,

    pub(crate) last_service: Instant,
    pub(crate) keep_alive_in_background: Duration,
}

impl<P: Peer> std::fmt::Debug for RealtimeClient<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("state", &self.state)
            .field("role", &self.role)
            .field("region", &self.current_region)
            .field("room", &self.room.as_ref().map(|r| r.name.as_str()))
            .finish_non_exhaustive()
    }
}

impl<P: Peer> RealtimeClient<P> {
    /// Client pinging regions over UDP.
    pub fn new(peer: P) -> Self {
        Self::with_pinger(peer, Arc::new(UdpPinger::default()))
    }

    /// Client measuring region latency with `pinger`.
    pub fn with_pinger(peer: P, pinger: Arc<dyn Pinger>) -> Self {
        let settings = AppSettings::default();
        let regions = RegionSelector::new(pinger, settings.region_ping.clone());
        Self {
            peer,
            protocol: settings.protocol,
            settings,
            auth_values: AuthValues::default(),
            state: ClientState::PeerCreated,
            role: ServerRole::Directory,
            disconnect_cause: DisconnectCause::None,
            fallback_used: false,
            session_connected: false,
            directory_address: String::new(),
            matchmaker_address: None,
            relay_address: None,
            cluster: None,
            current_region: None,
            regions,
            callbacks: CallbackRegistry::new(),
            nick_name: String::new(),
            local_properties: PropertyMap::new(),
            intent: None,
            failed_entry: None,
            pending_join: None,
            last_room: None,
            room: None,
            in_lobby: false,
            current_lobby: Lobby::default(),
            room_list: BTreeMap::new(),
            last_service: Instant::now(),
            keep_alive_in_background: DEFAULT_KEEP_ALIVE_IN_BACKGROUND,
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    /// Current connection state.
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Role of the server the client is talking to.
    pub fn server_role(&self) -> ServerRole {
        self.role
    }

    /// Why the last connection ended.
    pub fn disconnect_cause(&self) -> DisconnectCause {
        self.disconnect_cause
    }

    /// Whether a connection is up, ready or not.
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Whether the connected server accepts operations.
    pub fn is_connected_and_ready(&self) -> bool {
        self.state.is_connected_and_ready()
    }

    /// Whether the client is inside a room.
    pub fn in_room(&self) -> bool {
        self.state.in_room()
    }

    /// Whether the client has joined a lobby.
    pub fn in_lobby(&self) -> bool {
        self.in_lobby
    }

    /// The room the client is in or entering.
    pub fn room(&self) -> Option<&Room> {
        self.room.as_ref()
    }

    /// Lobby joined last, or the default lobby.
    pub fn lobby(&self) -> &Lobby {
        &self.current_lobby
    }

    /// Rooms listed in the current lobby.
    pub fn room_list(&self) -> impl Iterator<Item = &RoomInfo> {
        self.room_list.values()
    }

    /// Settings of the current session.
    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    /// Transport protocol of the current connection.
    pub fn protocol(&self) -> ConnectionProtocol {
        self.protocol
    }

    /// Authentication values sent on connect.
    pub fn auth_values(&self) -> &AuthValues {
        &self.auth_values
    }

    /// Replaces the authentication values sent on the next connect.
    pub fn set_auth_values(&mut self, values: AuthValues) {
        self.auth_values = values;
    }

    /// User id assigned by the server or set by the host.
    pub fn user_id(&self) -> Option<&str> {
        self.auth_values.user_id.as_deref()
    }

    /// Local nick name.
    pub fn nick_name(&self) -> &str {
        &self.nick_name
    }

    /// Nick name published as the local player's property.
    pub fn set_nick_name(&mut self, nick_name: impl Into<String>) {
        self.nick_name = nick_name.into();
    }

    /// Custom properties sent for the local player when entering a room.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::InvalidArgument`] if a key is a reserved
    /// byte key.
    pub fn set_local_player_properties(&mut self, properties: PropertyMap) -> Result<()> {
        if !custom_keys_valid(&properties) {
            return Err(RealtimeError::InvalidArgument(
                "player properties must use string or integer keys".into(),
            ));
        }
        self.local_properties = properties;
        Ok(())
    }

    /// Region the client connected to.
    pub fn current_region(&self) -> Option<&str> {
        self.current_region.as_deref()
    }

    /// Cluster within the region, if the server reported one.
    pub fn cluster(&self) -> Option<&str> {
        self.cluster.as_deref()
    }

    /// Snapshot of the region list.
    pub fn regions(&self) -> &[Region] {
        self.regions.regions()
    }

    /// Region with the lowest measured round trip.
    ///
    /// Remeasured lazily, hence `&mut self`.
    pub fn best_region(&mut self) -> Option<&Region> {
        self.regions.best_region()
    }

    /// Summary of the last region selection, for the host to persist.
    pub fn best_region_summary(&self) -> Option<&str> {
        self.settings.best_region_summary.as_deref()
    }

    /// Matchmaker address handed out by the directory.
    pub fn matchmaker_address(&self) -> Option<&str> {
        self.matchmaker_address.as_deref()
    }

    /// Relay address of the room being entered or played in.
    pub fn relay_address(&self) -> Option<&str> {
        self.relay_address.as_deref()
    }

    /// Pending room entry, if any.
    pub fn intent(&self) -> Option<&JoinIntent> {
        self.intent.as_ref()
    }

    /// Handle for registering listeners.
    pub fn subscriber(&self) -> Subscriber {
        self.callbacks.subscriber()
    }

    /// The underlying peer.
    pub fn peer(&self) -> &P {
        &self.peer
    }

    /// The underlying peer, mutably.
    pub fn peer_mut(&mut self) -> &mut P {
        &mut self.peer
    }

    /// How long [`KeepAlive`](crate::heartbeat::KeepAlive) keeps the connection
    /// alive while the host is backgrounded. Zero disables the limit.
    pub fn set_keep_alive_in_background(&mut self, limit: Duration) {
        self.keep_alive_in_background = limit;
    }

    // ── Internals shared with the matchmaking and heartbeat modules ──

    pub(crate) fn set_state(&mut self, next: ClientState) {
        let previous = self.state;
        if previous == next {
            return;
        }
        if !previous.can_transition_to(next) {
            error!(from = ?previous, to = ?next, "illegal state transition");
        }
        debug!(from = ?previous, to = ?next, role = ?self.role, "state changed");
        self.state = next;
        self.emit(ClientEvent::StateChanged {
            previous,
            current: next,
        });
    }

    pub(crate) fn emit(&mut self, event: ClientEvent) {
        self.callbacks.dispatch(&event);
    }

    /// Sends `request` if the current server and state allow it.
    pub(crate) fn send(&mut self, request: &OperationRequest) -> bool {
        let op = request.code;
        if !self.role.allows(op) {
            error!(op = ?op, role = ?self.role, "operation not available on this server");
            return false;
        }
        if !self.state.is_ready_for(op) {
            error!(op = ?op, state = ?self.state, "operation not allowed in this state");
            return false;
        }
        let sent = self.peer.send_operation(request, true);
        if sent {
            debug!(op = ?op, params = request.parameters.len(), "operation sent");
        } else {
            error!(op = ?op, "peer refused operation");
        }
        sent
    }

    /// Local player properties including the nick name.
    pub(crate) fn player_properties(&self) -> PropertyMap {
        let mut props = self.local_properties.clone();
        if !self.nick_name.is_empty() {
            props.insert(
                PropertyKey::Byte(actor_key::NICK_NAME),
                self.nick_name.as_str().into(),
            );
        }
        props
    }

    // ── Connect / disconnect ────────────────────────────────────────

    /// Starts a session with `settings`.
    ///
    /// Returns `false` unless the client is in `PeerCreated` or
    /// `Disconnected`, or if the app id is missing.
    pub fn connect_using_settings(&mut self, settings: AppSettings) -> bool {
        if !matches!(self.state, ClientState::PeerCreated | ClientState::Disconnected) {
            warn!(state = ?self.state, "connect refused: client is not disconnected");
            return false;
        }
        if settings.app_id.is_empty() {
            error!("connect refused: app id missing");
            return false;
        }

        // A run left over from the last session must not pick this one's region.
        self.regions.abort();
        self.protocol = settings.protocol;
        self.peer.set_protocol(self.protocol);
        self.regions.set_config(settings.region_ping.clone());
        self.current_region = settings.fixed_region().map(str::to_lowercase);
        self.settings = settings;
        self.fallback_used = false;
        self.session_connected = false;
        self.disconnect_cause = DisconnectCause::None;
        self.auth_values.token = None;
        self.matchmaker_address = None;
        self.relay_address = None;
        self.cluster = None;
        self.intent = None;
        self.failed_entry = None;
        self.last_room = None;

        if self.settings.use_directory {
            self.directory_address = self.settings.directory_address();
            self.call_connect(ServerRole::Directory)
        } else {
            let Some(address) = self.settings.matchmaker_address() else {
                error!("connect refused: no matchmaker address configured");
                return false;
            };
            self.matchmaker_address = Some(address);
            self.call_connect(ServerRole::Matchmaker)
        }
    }

    /// Disconnects with [`DisconnectCause::DisconnectByClientLogic`].
    pub fn disconnect(&mut self) {
        self.disconnect_with(DisconnectCause::DisconnectByClientLogic);
    }

    /// Starts disconnecting with `cause`. No-op while disconnecting,
    /// disconnected or before the first connect.
    pub fn disconnect_with(&mut self, cause: DisconnectCause) {
        if matches!(
            self.state,
            ClientState::Disconnecting | ClientState::Disconnected | ClientState::PeerCreated
        ) {
            return;
        }
        info!(cause = ?cause, state = ?self.state, "disconnecting");
        if cause.is_local() {
            self.regions.abort();
        }
        self.disconnect_cause = cause;
        self.set_state(ClientState::Disconnecting);
        self.peer.disconnect();
    }

    /// Reconnects to the last matchmaker using the cached token.
    pub fn reconnect_to_matchmaker(&mut self) -> bool {
        if self.state != ClientState::Disconnected {
            warn!(state = ?self.state, "reconnect refused: client is not disconnected");
            return false;
        }
        if self.matchmaker_address.is_none() || self.auth_values.token.is_none() {
            error!("reconnect refused: no matchmaker address or token cached");
            return false;
        }
        self.disconnect_cause = DisconnectCause::None;
        self.session_connected = false;
        self.intent = None;
        self.call_connect(ServerRole::Matchmaker)
    }

    /// Reconnects straight to the last relay and rejoins the last room.
    pub fn reconnect_and_rejoin(&mut self) -> bool {
        if self.state != ClientState::Disconnected {
            warn!(state = ?self.state, "rejoin refused: client is not disconnected");
            return false;
        }
        let Some(room) = self.last_room.clone() else {
            error!("rejoin refused: no room to rejoin");
            return false;
        };
        if self.relay_address.is_none() || self.auth_values.token.is_none() {
            error!("rejoin refused: no relay address or token cached");
            return false;
        }
        self.disconnect_cause = DisconnectCause::None;
        self.session_connected = false;
        self.intent = Some(JoinIntent::JoinRoom(room).as_rejoin());
        self.call_connect(ServerRole::Relay)
    }

    /// Connects to the server in `role` using the cached address.
    pub(crate) fn call_connect(&mut self, role: ServerRole) -> bool {
        if self.state == ClientState::Disconnecting {
            error!(role = ?role, "connect refused while disconnecting");
            return false;
        }
        let (address, next) = match role {
            ServerRole::Directory => (
                Some(self.directory_address.clone()),
                ClientState::ConnectingToDirectory,
            ),
            ServerRole::Matchmaker => (
                self.matchmaker_address.clone(),
                ClientState::ConnectingToMatchmaker,
            ),
            ServerRole::Relay => (self.relay_address.clone(), ClientState::ConnectingToRelay),
        };
        let Some(address) = address.filter(|a| !a.is_empty()) else {
            error!(role = ?role, "connect refused: no address");
            return false;
        };

        let token = match role {
            ServerRole::Directory => {
                self.auth_values.token = None;
                None
            }
            _ if self.settings.auth_mode == AuthMode::AuthOnce => {
                match self.auth_values.token.clone() {
                    Some(token) => Some(token),
                    None => {
                        error!(role = ?role, "connect refused: authenticating once requires a token");
                        return false;
                    }
                }
            }
            _ => None,
        };

        if !self
            .peer
            .connect(&address, &self.settings.app_id, token.as_deref())
        {
            error!(address = %address, "peer could not start connecting");
            return false;
        }
        info!(address = %address, role = ?role, protocol = ?self.protocol, "connecting");
        self.set_state(next);
        true
    }

    // ── Authentication ──────────────────────────────────────────────

    /// Sends the authentication request for the current server.
    pub(crate) fn call_authenticate(&mut self) -> bool {
        let token = self.auth_values.token.clone();
        if token.is_none() && self.role != ServerRole::Directory {
            error!(role = ?self.role, "authenticate refused: no token");
            return false;
        }

        let op = if self.role == ServerRole::Directory && self.settings.auth_mode == AuthMode::AuthOnce {
            OperationCode::AuthenticateOnce
        } else {
            OperationCode::Authenticate
        };
        let mut request = OperationRequest::new(op);
        match token {
            Some(token) => {
                request = request.with(param::TOKEN, token);
            }
            None => {
                request = request
                    .with(param::APP_VERSION, self.settings.app_version.as_str())
                    .with(param::APPLICATION_ID, self.settings.app_id.as_str());
                if let Some(region) = &self.current_region {
                    request = request.with(param::REGION, region.as_str());
                }
                if let Some(user_id) = &self.auth_values.user_id {
                    request = request.with(param::USER_ID, user_id.as_str());
                }
                let auth_type = self.auth_values.auth_type;
                if auth_type != CustomAuthType::None {
                    request = request.with(
                        param::CLIENT_AUTHENTICATION_TYPE,
                        ParamValue::Byte(auth_type.code()),
                    );
                    if let Some(params) = &self.auth_values.auth_parameters {
                        request = request.with(param::CLIENT_AUTHENTICATION_PARAMS, params.as_str());
                    }
                    if let Some(data) = &self.auth_values.auth_data {
                        request = request.with(param::CLIENT_AUTHENTICATION_DATA, data.clone());
                    }
                }
            }
        }

        if !self.send(&request) {
            return false;
        }
        self.set_state(ClientState::Authenticating);
        true
    }

    fn on_authentication_response(&mut self, response: &OperationResponse) {
        if !response.is_ok() {
            let cause = DisconnectCause::from_authentication_failure(response.return_code);
            let message = response.debug_message.clone().unwrap_or_default();
            error!(code = response.return_code, cause = ?cause, message = %message, "authentication failed");
            if cause == DisconnectCause::CustomAuthenticationFailed {
                self.emit(ClientEvent::CustomAuthenticationFailed { message });
            }
            self.disconnect_with(cause);
            return;
        }

        if let Some(user_id) = response.get_str(param::USER_ID) {
            self.auth_values.user_id = Some(user_id.to_string());
        }
        if let Some(nick) = response.get_str(param::NICK_NAME) {
            self.nick_name = nick.to_string();
        }
        if response.get(param::DATA).is_some() {
            self.emit(ClientEvent::CustomAuthenticationResponse {
                data: response.parameters.clone(),
            });
        }

        match self.role {
            ServerRole::Directory => {
                self.cluster = response.get_str(param::CLUSTER).map(str::to_string);
                let Some(address) = response.get_str(param::ADDRESS) else {
                    error!("directory authentication carried no matchmaker address");
                    self.disconnect_with(DisconnectCause::DisconnectByServerReasonUnknown);
                    return;
                };
                self.matchmaker_address = Some(address.to_string());
                info!(address = %address, region = ?self.current_region, "authenticated on directory");
                self.set_state(ClientState::DisconnectingFromDirectory);
                self.peer.disconnect();
            }
            ServerRole::Matchmaker => {
                info!("authenticated on matchmaker");
                self.set_state(ClientState::ConnectedToMatchmaker);
                match self.failed_entry.take() {
                    Some(failed) => {
                        let event = entry_failure_event(&failed);
                        self.emit(event);
                    }
                    None => self.emit(ClientEvent::ConnectedToMatchmaker),
                }
            }
            ServerRole::Relay => {
                info!("authenticated on relay");
                match self.intent.clone() {
                    Some(intent) => {
                        let request = intent.relay_request(&self.player_properties());
                        self.set_state(ClientState::Joining);
                        if !self.peer.send_operation(&request, true) {
                            error!(op = ?request.code, "peer refused room entry on relay");
                        }
                    }
                    None => self.set_state(ClientState::ConnectedToRelay),
                }
            }
        }
    }

    // ── Regions ─────────────────────────────────────────────────────

    fn on_regions_response(&mut self, response: &OperationResponse) {
        if !response.is_ok() {
            error!(code = response.return_code, "region list request failed");
            if ErrorCode::from_code(response.return_code) == Some(ErrorCode::InvalidAuthentication) {
                self.disconnect_with(DisconnectCause::InvalidAuthentication);
            }
            return;
        }

        let codes = response
            .get(param::REGION)
            .and_then(ParamValue::as_string_array)
            .unwrap_or_default();
        let addresses = response
            .get(param::ADDRESS)
            .and_then(ParamValue::as_string_array)
            .unwrap_or_default();
        let regions: Vec<Region> = codes
            .iter()
            .zip(addresses)
            .map(|(code, address)| Region::new(code, address.as_str()))
            .collect();
        info!(count = regions.len(), "region list received");

        self.regions.set_regions(regions.clone());
        self.emit(ClientEvent::RegionListReceived {
            regions: regions.clone(),
        });

        if self.state == ClientState::ConnectedToDirectory && self.current_region.is_none() {
            if self.regions.is_pinging() {
                debug!("region pinging already running; its outcome authenticates");
                return;
            }
            let summary = self.settings.best_region_summary.clone();
            if !self.regions.ping_minimum_of_regions(regions, summary.as_deref()) {
                warn!("region pinging did not start; using first listed region");
                self.current_region = self.regions.best_region().map(|r| r.code.clone());
                self.call_authenticate();
            }
        }
    }

    /// Adopts the best region of a finished pinging run.
    pub(crate) fn on_region_ping_completed(&mut self, outcome: PingOutcome) {
        let Some(best) = outcome.best else {
            error!("region pinging produced no region");
            self.disconnect_with(DisconnectCause::InvalidRegion);
            return;
        };
        info!(region = %best.code, ping = best.ping, summary = %outcome.summary, "best region selected");
        self.current_region = Some(best.code);
        self.settings.best_region_summary = Some(outcome.summary.to_string());

        match self.state {
            ClientState::ConnectedToDirectory => {
                self.call_authenticate();
            }
            ClientState::Disconnected if !self.disconnect_cause.is_local() => {
                info!(cause = ?self.disconnect_cause, "directory connection lost while pinging, reconnecting");
                self.call_connect(ServerRole::Directory);
            }
            other => debug!(state = ?other, "region selected while not on the directory"),
        }
    }

    // ── Service ─────────────────────────────────────────────────────

    /// Drives the peer once and handles everything it received.
    ///
    /// # Errors
    ///
    /// Returns the peer's error if it failed irrecoverably.
    pub fn service(&mut self) -> Result<()> {
        self.last_service = Instant::now();
        let messages = self.peer.service()?;
        for message in messages {
            self.handle_message(message);
        }
        if let Some(outcome) = self.regions.poll_completed() {
            self.on_region_ping_completed(outcome);
        }
        self.callbacks.apply_pending();
        Ok(())
    }

    fn handle_message(&mut self, message: PeerMessage) {
        match message {
            PeerMessage::OperationResponse(response) => self.on_operation_response(&response),
            PeerMessage::Event(event) => self.on_event(&event),
            PeerMessage::Status(status) => self.on_status_changed(status),
            PeerMessage::DisconnectMessage {
                code,
                debug_message,
            } => self.on_disconnect_message(code, debug_message.as_deref()),
        }
    }

    pub(crate) fn on_operation_response(&mut self, response: &OperationResponse) {
        debug!(op = ?response.code, code = response.return_code, "operation response");
        if let Some(token) = response.get_str(param::TOKEN) {
            self.auth_values.token = Some(token.to_string());
        }
        if matches!(self.state, ClientState::Disconnecting | ClientState::Disconnected) {
            debug!(op = ?response.code, "response ignored while disconnecting");
            return;
        }
        if ErrorCode::from_code(response.return_code) == Some(ErrorCode::OperationLimitReached) {
            error!(op = ?response.code, "operation limit reached");
            self.disconnect_with(DisconnectCause::DisconnectByOperationLimit);
            return;
        }

        match response.code {
            OperationCode::Authenticate | OperationCode::AuthenticateOnce => {
                self.on_authentication_response(response);
            }
            OperationCode::GetRegions => self.on_regions_response(response),
            OperationCode::CreateRoom | OperationCode::JoinRoom | OperationCode::JoinRandomRoom => {
                self.on_room_entry_response(response);
            }
            OperationCode::JoinLobby => self.on_join_lobby_response(response),
            OperationCode::LeaveLobby => self.on_leave_lobby_response(response),
            OperationCode::Leave => self.on_leave_response(response),
            OperationCode::GetLobbyStats if response.is_ok() => {
                self.on_lobby_stats(&response.parameters);
            }
            other => {
                if !response.is_ok() {
                    warn!(op = ?other, code = response.return_code, "operation failed");
                }
            }
        }
    }

    pub(crate) fn on_event(&mut self, event: &EventData) {
        match event.kind() {
            Some(EventCode::AuthEvent) => {
                if let Some(token) = event.get(param::TOKEN).and_then(ParamValue::as_str) {
                    debug!("authentication token refreshed");
                    self.auth_values.token = Some(token.to_string());
                }
            }
            Some(EventCode::Join) => self.on_join_event(event),
            Some(EventCode::Leave) => self.on_leave_event(event),
            Some(EventCode::PropertiesChanged) => self.on_properties_changed_event(event),
            Some(EventCode::ErrorInfo) => {
                let info = event
                    .get(param::INFO)
                    .and_then(ParamValue::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.emit(ClientEvent::ErrorInfo { info });
            }
            Some(EventCode::RoomList) => self.on_room_list_event(event, true),
            Some(EventCode::RoomListUpdate) => self.on_room_list_event(event, false),
            Some(EventCode::LobbyStats) => self.on_lobby_stats_event(event),
            Some(EventCode::AppStats) => debug!("app stats received"),
            _ => self.emit(ClientEvent::Custom(event.clone())),
        }
    }

    pub(crate) fn on_disconnect_message(&mut self, code: i16, message: Option<&str>) {
        warn!(code, message = message.unwrap_or_default(), "server sent disconnect message");
        self.disconnect_with(DisconnectCause::DisconnectByDisconnectMessage);
    }

    // ── Status ──────────────────────────────────────────────────────

    pub(crate) fn on_status_changed(&mut self, status: StatusCode) {
        debug!(status = ?status, state = ?self.state, "peer status");
        match status {
            StatusCode::Connect => self.on_connected(),
            StatusCode::EncryptionEstablished => self.on_encryption_established(),
            StatusCode::Disconnect => self.on_peer_disconnected(),
            StatusCode::DisconnectByServerUserLimit => {
                self.on_connection_error(DisconnectCause::MaxCcuReached, false);
            }
            StatusCode::DnsExceptionOnConnect => {
                self.on_connection_error(DisconnectCause::DnsExceptionOnConnect, false);
            }
            StatusCode::ServerAddressInvalid => {
                self.on_connection_error(DisconnectCause::ServerAddressInvalid, false);
            }
            StatusCode::ExceptionOnConnect
            | StatusCode::SecurityExceptionOnConnect
            | StatusCode::EncryptionFailedToEstablish => {
                self.on_connection_error(DisconnectCause::ExceptionOnConnect, true);
            }
            StatusCode::Exception | StatusCode::ExceptionOnReceive | StatusCode::SendError => {
                self.on_connection_error(DisconnectCause::Exception, false);
            }
            StatusCode::DisconnectByServerTimeout => {
                self.on_connection_error(DisconnectCause::ServerTimeout, false);
            }
            StatusCode::DisconnectByServerLogic => {
                self.on_connection_error(DisconnectCause::DisconnectByServerLogic, false);
            }
            StatusCode::DisconnectByServerReasonUnknown => {
                self.on_connection_error(DisconnectCause::DisconnectByServerReasonUnknown, false);
            }
            StatusCode::TimeoutDisconnect => {
                self.on_connection_error(DisconnectCause::ClientTimeout, true);
            }
        }
    }

    fn on_connected(&mut self) {
        self.role = match self.state {
            ClientState::ConnectingToDirectory => ServerRole::Directory,
            ClientState::ConnectingToMatchmaker => ServerRole::Matchmaker,
            ClientState::ConnectingToRelay => ServerRole::Relay,
            other => {
                warn!(state = ?other, "connect status outside a connecting state");
                return;
            }
        };
        info!(role = ?self.role, "connected");
        if !self.session_connected && self.role != ServerRole::Relay {
            self.session_connected = true;
            self.emit(ClientEvent::Connected);
        }

        let handshake =
            self.role == ServerRole::Directory || self.settings.auth_mode == AuthMode::Auth;
        if !handshake || !self.peer.establish_encryption() {
            self.on_encryption_established();
        }
    }

    fn on_encryption_established(&mut self) {
        match self.role {
            ServerRole::Directory => {
                self.set_state(ClientState::ConnectedToDirectory);
                if self.current_region.is_some() {
                    self.call_authenticate();
                } else if !self.send(&OperationRequest::new(OperationCode::GetRegions)) {
                    error!("could not request the region list");
                }
            }
            ServerRole::Matchmaker | ServerRole::Relay => {
                if self.settings.auth_mode == AuthMode::AuthOnce {
                    // The token went out with the connect request.
                    self.set_state(ClientState::Authenticating);
                } else {
                    self.call_authenticate();
                }
            }
        }
    }

    fn on_connection_error(&mut self, cause: DisconnectCause, may_fall_back: bool) {
        if self.state == ClientState::Disconnected {
            return;
        }
        let fallback = self.protocol.fallback();
        if may_fall_back
            && self.settings.enable_protocol_fallback
            && !self.fallback_used
            && self.state == ClientState::ConnectingToDirectory
            && fallback.is_some()
        {
            warn!(cause = ?cause, protocol = ?self.protocol, "directory connect failed, retrying with fallback protocol");
            self.disconnect_cause = cause;
            self.set_state(ClientState::ConnectWithFallbackProtocol);
            self.peer.disconnect();
            return;
        }
        warn!(cause = ?cause, state = ?self.state, "connection error");
        self.disconnect_cause = cause;
        if self.state != ClientState::Disconnecting {
            self.set_state(ClientState::Disconnecting);
            self.peer.disconnect();
        }
    }

    fn on_peer_disconnected(&mut self) {
        let was_in_room = self.role == ServerRole::Relay && self.room.is_some();
        self.room = None;
        self.pending_join = None;
        self.in_lobby = false;
        self.room_list.clear();
        if was_in_room {
            self.emit(ClientEvent::LeftRoom);
        }

        match self.state {
            ClientState::ConnectWithFallbackProtocol => {
                if let Some(next) = self.protocol.fallback() {
                    self.protocol = next;
                    self.peer.set_protocol(next);
                    self.fallback_used = true;
                    self.settings.protocol = next;
                    self.directory_address = self.settings.directory_address();
                }
                if !self.call_connect(ServerRole::Directory) {
                    self.finish_disconnect();
                }
            }
            ClientState::PeerCreated | ClientState::Disconnecting => self.finish_disconnect(),
            ClientState::DisconnectingFromDirectory | ClientState::DisconnectingFromRelay => {
                if !self.call_connect(ServerRole::Matchmaker) {
                    self.finish_disconnect();
                }
            }
            ClientState::DisconnectingFromMatchmaker => {
                if !self.call_connect(ServerRole::Relay) {
                    self.finish_disconnect();
                }
            }
            ClientState::Disconnected => {}
            other => {
                warn!(state = ?other, cause = ?self.disconnect_cause, "unexpected disconnect");
                if self.disconnect_cause == DisconnectCause::None {
                    self.disconnect_cause = DisconnectCause::DisconnectByServerReasonUnknown;
                }
                self.finish_disconnect();
            }
        }
    }

    fn finish_disconnect(&mut self) {
        self.intent = None;
        self.failed_entry = None;
        self.set_state(ClientState::Disconnected);
        info!(cause = ?self.disconnect_cause, "disconnected");
        self.emit(ClientEvent::Disconnected {
            cause: self.disconnect_cause,
        });
    }
}

/// Failure event matching the operation of a failed room entry.
pub(crate) fn entry_failure_event(response: &OperationResponse) -> ClientEvent {
    let return_code = response.return_code;
    let message = response.debug_message.clone().unwrap_or_default();
    match response.code {
        OperationCode::CreateRoom => ClientEvent::CreateRoomFailed {
            return_code,
            message,
        },
        OperationCode::JoinRandomRoom => ClientEvent::JoinRandomFailed {
            return_code,
            message,
        },
        _ => ClientEvent::JoinRoomFailed {
            return_code,
            message,
        },
    }
}
