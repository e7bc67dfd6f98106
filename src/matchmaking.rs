//! Room entry, lobby and in-room operations of [`RealtimeClient`].
//!
//! Room entry runs over two servers: the matchmaker picks or allocates the
//! room and names a relay, the client hops there and replays its cached
//! [`JoinIntent`]. A failure on the relay is carried back to the matchmaker
//! and reported once the client is ready again there.

use tracing::{debug, error, info, warn};

use crate::client::{entry_failure_event, RealtimeClient};
use crate::error_codes::DisconnectCause;
use crate::event::ClientEvent;
use crate::intent::{EnterRoomArgs, JoinIntent, JoinIntentKind, JoinMode, JoinRandomArgs};
use crate::protocol::{
    custom_keys_valid, param, room_flag, EventData, OperationCode, OperationRequest,
    OperationResponse, ParamValue, ParameterMap, PropertyKey, PropertyMap,
};
use crate::room::{Lobby, LobbyStats, LobbyType, Room, RoomInfo};
use crate::state::{ClientState, ServerRole};
use crate::transport::Peer;

impl<P: Peer> RealtimeClient<P> {
    // ── Room entry ──────────────────────────────────────────────────

    /// Creates a room. Without a name the server assigns one.
    pub fn op_create_room(&mut self, args: EnterRoomArgs) -> bool {
        if let Err(e) = args.validate(true) {
            error!(error = %e, "create room refused");
            return false;
        }
        self.enter_room(JoinIntent::CreateRoom(args))
    }

    /// Joins an existing room by name.
    pub fn op_join_room(&mut self, args: EnterRoomArgs) -> bool {
        if let Err(e) = args.validate(false) {
            error!(error = %e, "join room refused");
            return false;
        }
        self.enter_room(JoinIntent::JoinRoom(args))
    }

    /// Joins the named room, creating it if it does not exist.
    pub fn op_join_or_create_room(&mut self, args: EnterRoomArgs) -> bool {
        if let Err(e) = args.validate(false) {
            error!(error = %e, "join or create room refused");
            return false;
        }
        let args = args.with_join_mode(JoinMode::CreateIfNotExists);
        self.enter_room(JoinIntent::JoinOrCreateRoom(args))
    }

    /// Joins a random room matching `filter`.
    pub fn op_join_random_room(&mut self, filter: JoinRandomArgs) -> bool {
        if let Err(e) = filter.validate() {
            error!(error = %e, "join random room refused");
            return false;
        }
        let enter = EnterRoomArgs::new().with_lobby(filter.lobby.clone());
        self.enter_room(JoinIntent::JoinRandomRoom { filter, enter })
    }

    /// Joins a random room matching `filter`, creating one from `create`
    /// when none matches.
    pub fn op_join_random_or_create_room(
        &mut self,
        filter: JoinRandomArgs,
        create: EnterRoomArgs,
    ) -> bool {
        if let Err(e) = filter.validate().and_then(|()| create.validate(true)) {
            error!(error = %e, "join random or create room refused");
            return false;
        }
        self.enter_room(JoinIntent::JoinRandomOrCreateRoom {
            filter,
            enter: create,
        })
    }

    /// Returns to a room this user was in as an inactive player.
    pub fn op_rejoin_room(&mut self, room_name: &str) -> bool {
        let args = EnterRoomArgs::named(room_name).with_join_mode(JoinMode::RejoinOnly);
        if let Err(e) = args.validate(false) {
            error!(error = %e, "rejoin refused");
            return false;
        }
        self.enter_room(JoinIntent::JoinRoom(args))
    }

    /// Starts a room entry on the matchmaker.
    ///
    /// The relay also accepts `JoinRoom` and `CreateRoom`, but only as the
    /// replay of the cached intent right after relay authentication. A caller
    /// already on a relay has to leave the room first.
    fn enter_room(&mut self, intent: JoinIntent) -> bool {
        if self.role != ServerRole::Matchmaker {
            error!(role = ?self.role, kind = ?intent.kind(), "room entry requires the matchmaker");
            return false;
        }
        if self.intent.is_some() {
            error!(kind = ?intent.kind(), "room entry already pending");
            return false;
        }
        let request = intent.matchmaker_request(&self.player_properties());
        if !self.send(&request) {
            return false;
        }
        info!(kind = ?intent.kind(), room = ?intent.args().room_name, "entering room");
        self.failed_entry = None;
        self.intent = Some(intent);
        self.set_state(ClientState::Joining);
        true
    }

    pub(crate) fn on_room_entry_response(&mut self, response: &OperationResponse) {
        match self.role {
            ServerRole::Matchmaker => self.on_matchmaker_entry_response(response),
            ServerRole::Relay => self.on_relay_entry_response(response),
            ServerRole::Directory => {
                warn!(op = ?response.code, "room entry response on the directory");
            }
        }
    }

    fn on_matchmaker_entry_response(&mut self, response: &OperationResponse) {
        if !response.is_ok() {
            warn!(
                op = ?response.code,
                code = response.return_code,
                message = response.debug_message.as_deref().unwrap_or_default(),
                "room entry failed on matchmaker"
            );
            self.intent = None;
            let next = if self.in_lobby {
                ClientState::JoinedLobby
            } else {
                ClientState::ConnectedToMatchmaker
            };
            self.set_state(next);
            let event = entry_failure_event(response);
            self.emit(event);
            return;
        }

        let Some(intent) = self.intent.take() else {
            warn!(op = ?response.code, "room entry response without a pending entry");
            return;
        };
        let Some(address) = response.get_str(param::ADDRESS) else {
            error!("matchmaker assigned no relay address");
            self.disconnect_with(DisconnectCause::DisconnectByServerReasonUnknown);
            return;
        };
        let room_name = response
            .get_str(param::ROOM_NAME)
            .map(str::to_string)
            .or_else(|| intent.args().room_name.clone())
            .unwrap_or_default();

        info!(relay = %address, room = %room_name, "room assigned, moving to relay");
        self.relay_address = Some(address.to_string());
        self.intent = Some(intent.with_room_name(&room_name));
        self.set_state(ClientState::DisconnectingFromMatchmaker);
        self.peer.disconnect();
    }

    fn on_relay_entry_response(&mut self, response: &OperationResponse) {
        if !response.is_ok() {
            warn!(
                op = ?response.code,
                code = response.return_code,
                "room entry failed on relay, returning to matchmaker"
            );
            self.failed_entry = Some(response.clone());
            self.relay_address = None;
            self.intent = None;
            self.set_state(ClientState::DisconnectingFromRelay);
            self.peer.disconnect();
            return;
        }

        let Some(intent) = self.intent.take() else {
            warn!(op = ?response.code, "room entry response without a pending entry");
            return;
        };
        let args = intent.args();
        let name = response
            .get_str(param::ROOM_NAME)
            .map(str::to_string)
            .or_else(|| args.room_name.clone())
            .unwrap_or_default();

        let mut room = match &args.room_options {
            Some(options) if intent.may_create() => Room::from_options(name.as_str(), options),
            _ => Room::new(name.as_str()),
        };
        room.local_actor = response
            .get(param::ACTOR_NR)
            .and_then(ParamValue::as_i32)
            .unwrap_or(-1);
        if let Some(props) = response
            .get(param::ROOM_PROPERTIES)
            .and_then(ParamValue::as_properties)
        {
            room.apply_properties(props);
        }
        if let Some(master) = response
            .get(param::MASTER_CLIENT_ID)
            .and_then(ParamValue::as_i32)
        {
            room.master_client_id = master;
        }
        if let Some(flags) = response
            .get(param::ROOM_OPTION_FLAGS)
            .and_then(ParamValue::as_i32)
        {
            room.suppress_room_events = flags & room_flag::SUPPRESS_ROOM_EVENTS != 0;
        }
        hydrate_roster(&mut room, response);
        let local_actor = room.local_actor;
        let local_props = self.player_properties();
        room.store_player(local_actor, Some(&local_props));
        if let Some(player) = room.player_mut(local_actor) {
            player.user_id = self.auth_values.user_id.clone();
            player.is_inactive = false;
        }

        let created = intent.kind() == JoinIntentKind::CreateRoom
            || (intent.may_create() && local_actor == 1);
        info!(room = %room.name, actor = local_actor, created, "entered room on relay");

        self.last_room = Some(args.clone().with_room_name(name));
        let suppress = room.suppress_room_events;
        self.room = Some(room);
        if suppress {
            self.complete_entry(created);
        } else {
            self.pending_join = Some(created);
        }
    }

    fn complete_entry(&mut self, created: bool) {
        self.set_state(ClientState::Joined);
        if created {
            self.emit(ClientEvent::CreatedRoom);
        }
        self.emit(ClientEvent::JoinedRoom);
    }

    // ── Leave ───────────────────────────────────────────────────────

    /// Leaves the room and returns to the matchmaker. With
    /// `become_inactive` the server keeps the player for a later rejoin.
    pub fn op_leave_room(&mut self, become_inactive: bool) -> bool {
        let mut request = OperationRequest::new(OperationCode::Leave);
        if become_inactive {
            request = request.with(param::IS_INACTIVE, true);
        }
        if !self.send(&request) {
            return false;
        }
        info!(become_inactive, "leaving room");
        self.intent = None;
        self.relay_address = None;
        if !become_inactive {
            self.last_room = None;
        }
        self.set_state(ClientState::Leaving);
        true
    }

    pub(crate) fn on_leave_response(&mut self, response: &OperationResponse) {
        if !response.is_ok() {
            warn!(code = response.return_code, "leave failed, disconnecting from relay anyway");
        }
        if self.state != ClientState::Leaving {
            debug!(state = ?self.state, "leave response outside leaving state");
            return;
        }
        self.set_state(ClientState::DisconnectingFromRelay);
        self.peer.disconnect();
    }

    // ── Lobby ───────────────────────────────────────────────────────

    /// Joins `lobby`, or the default lobby when `None`.
    pub fn op_join_lobby(&mut self, lobby: Option<Lobby>) -> bool {
        let lobby = lobby.unwrap_or_default();
        let mut request = OperationRequest::new(OperationCode::JoinLobby);
        if !lobby.is_default() {
            if let Some(name) = &lobby.name {
                request = request.with(param::LOBBY_NAME, name.as_str());
            }
            request = request.with(param::LOBBY_TYPE, ParamValue::Byte(lobby.lobby_type.code()));
        }
        if !self.send(&request) {
            return false;
        }
        debug!(lobby = ?lobby.name, "joining lobby");
        self.current_lobby = lobby;
        self.set_state(ClientState::JoiningLobby);
        true
    }

    pub fn op_leave_lobby(&mut self) -> bool {
        self.send(&OperationRequest::new(OperationCode::LeaveLobby))
    }

    /// Requests statistics of every lobby.
    pub fn op_get_lobby_stats(&mut self) -> bool {
        self.send(&OperationRequest::new(OperationCode::GetLobbyStats))
    }

    pub(crate) fn on_join_lobby_response(&mut self, response: &OperationResponse) {
        if !response.is_ok() {
            warn!(code = response.return_code, "join lobby failed");
            self.current_lobby = Lobby::default();
            self.set_state(ClientState::ConnectedToMatchmaker);
            self.emit(ClientEvent::JoinLobbyFailed {
                return_code: response.return_code,
                message: response.debug_message.clone().unwrap_or_default(),
            });
            return;
        }
        self.in_lobby = true;
        self.set_state(ClientState::JoinedLobby);
        self.emit(ClientEvent::JoinedLobby);
    }

    pub(crate) fn on_leave_lobby_response(&mut self, response: &OperationResponse) {
        if !response.is_ok() {
            warn!(code = response.return_code, "leave lobby failed");
            return;
        }
        self.in_lobby = false;
        self.current_lobby = Lobby::default();
        self.room_list.clear();
        self.set_state(ClientState::ConnectedToMatchmaker);
        self.emit(ClientEvent::LeftLobby);
    }

    pub(crate) fn on_room_list_event(&mut self, event: &EventData, full: bool) {
        if full {
            self.room_list.clear();
        }
        let Some(list) = event.get(param::ROOM_LIST).and_then(ParamValue::as_properties) else {
            return;
        };
        let empty = PropertyMap::new();
        let mut rooms = Vec::with_capacity(list.len());
        for (key, value) in list {
            let PropertyKey::Str(name) = key else {
                continue;
            };
            let info = RoomInfo::from_properties(name.as_str(), value.as_properties().unwrap_or(&empty));
            if info.removed {
                self.room_list.remove(name);
            } else {
                self.room_list.insert(name.clone(), info.clone());
            }
            rooms.push(info);
        }
        debug!(changed = rooms.len(), listed = self.room_list.len(), "room list updated");
        self.emit(ClientEvent::RoomListUpdate { rooms });
    }

    pub(crate) fn on_lobby_stats(&mut self, parameters: &ParameterMap) {
        let names = parameters
            .get(&param::LOBBY_NAME)
            .and_then(ParamValue::as_string_array)
            .unwrap_or_default();
        let types = int_list(parameters.get(&param::LOBBY_TYPE));
        let peers = int_list(parameters.get(&param::PEER_COUNT));
        let rooms = int_list(parameters.get(&param::ROOM_COUNT));

        let lobbies = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let lobby_type = LobbyType::from_code(types.get(i).copied().unwrap_or(0));
                LobbyStats {
                    lobby: Lobby::new(name.as_str(), lobby_type),
                    player_count: peers.get(i).copied().unwrap_or(0),
                    room_count: rooms.get(i).copied().unwrap_or(0),
                }
            })
            .collect();
        self.emit(ClientEvent::LobbyStatisticsUpdate { lobbies });
    }

    pub(crate) fn on_lobby_stats_event(&mut self, event: &EventData) {
        self.on_lobby_stats(&event.parameters);
    }

    // ── In room ─────────────────────────────────────────────────────

    /// Sends an event to the other players of the room.
    pub fn op_raise_event(&mut self, event_code: u8, data: impl Into<ParamValue>) -> bool {
        let request = OperationRequest::new(OperationCode::RaiseEvent)
            .with(param::CODE, ParamValue::Byte(event_code))
            .with(param::DATA, data);
        self.send(&request)
    }

    /// Sets custom room properties. Keys must be strings or integers.
    pub fn op_set_room_properties(&mut self, properties: PropertyMap) -> bool {
        self.set_properties(0, properties)
    }

    /// Sets custom properties of a player in the room.
    pub fn op_set_player_properties(&mut self, actor_number: i32, properties: PropertyMap) -> bool {
        if actor_number <= 0 {
            error!(actor = actor_number, "set player properties refused: invalid actor");
            return false;
        }
        self.set_properties(actor_number, properties)
    }

    fn set_properties(&mut self, target: i32, properties: PropertyMap) -> bool {
        if properties.is_empty() || !custom_keys_valid(&properties) {
            error!(actor = target, "set properties refused: keys must be strings or integers");
            return false;
        }
        let mut request = OperationRequest::new(OperationCode::SetProperties)
            .with(param::PROPERTIES, ParamValue::Properties(properties))
            .with(param::BROADCAST, true);
        if target != 0 {
            request = request.with(param::ACTOR_NR, target);
        }
        self.send(&request)
    }

    pub(crate) fn on_join_event(&mut self, event: &EventData) {
        let Some(actor) = event.get(param::ACTOR_NR).and_then(ParamValue::as_i32) else {
            return;
        };
        let props = event
            .get(param::PLAYER_PROPERTIES)
            .and_then(ParamValue::as_properties);
        let actors = event.get(param::ACTOR_LIST).and_then(ParamValue::as_int_array);
        let Some(room) = self.room.as_mut() else {
            debug!(actor, "join event outside a room");
            return;
        };

        let is_local = actor == room.local_actor;
        let was_active = room.player(actor).is_some_and(|p| !p.is_inactive);
        room.store_player(actor, props);
        if let Some(player) = room.player_mut(actor) {
            player.is_inactive = false;
        }
        for other in actors.unwrap_or_default() {
            room.store_player(*other, None);
        }
        let player = room.player(actor).cloned();

        if is_local {
            if let Some(created) = self.pending_join.take() {
                self.complete_entry(created);
            }
        } else if !was_active {
            if let Some(player) = player {
                debug!(actor, "player entered room");
                self.emit(ClientEvent::PlayerEnteredRoom { player });
            }
        }
    }

    pub(crate) fn on_leave_event(&mut self, event: &EventData) {
        let Some(actor) = event.get(param::ACTOR_NR).and_then(ParamValue::as_i32) else {
            return;
        };
        let inactive = event
            .get(param::IS_INACTIVE)
            .and_then(ParamValue::as_bool)
            .unwrap_or(false);
        let announced_master = event
            .get(param::MASTER_CLIENT_ID)
            .and_then(ParamValue::as_i32);
        let Some(room) = self.room.as_mut() else {
            return;
        };

        let player = if inactive {
            room.player_mut(actor).map(|p| {
                p.is_inactive = true;
                p.clone()
            })
        } else {
            room.remove_player(actor)
        };
        let Some(player) = player else {
            debug!(actor, "leave event for unknown player");
            return;
        };

        let next_master = match announced_master {
            Some(master) if master != room.master_client_id => Some(master),
            _ if room.master_client_id == actor => room.next_master(actor),
            _ => None,
        };
        if let Some(master) = next_master {
            room.master_client_id = master;
        }

        debug!(actor, inactive, "player left room");
        self.emit(ClientEvent::PlayerLeftRoom { player });
        if let Some(actor_number) = next_master {
            self.emit(ClientEvent::MasterClientSwitched { actor_number });
        }
    }

    pub(crate) fn on_properties_changed_event(&mut self, event: &EventData) {
        let target = event
            .get(param::TARGET_ACTOR_NR)
            .and_then(ParamValue::as_i32)
            .unwrap_or(0);
        let Some(changed) = event
            .get(param::PROPERTIES)
            .and_then(ParamValue::as_properties)
            .cloned()
        else {
            return;
        };
        let Some(room) = self.room.as_mut() else {
            return;
        };

        if target == 0 {
            room.apply_properties(&changed);
            self.emit(ClientEvent::RoomPropertiesUpdate { changed });
        } else {
            room.store_player(target, Some(&changed));
            self.emit(ClientEvent::PlayerPropertiesUpdate {
                actor_number: target,
                changed,
            });
        }
    }
}

/// Players listed in a relay entry response.
fn hydrate_roster(room: &mut Room, response: &OperationResponse) {
    if let Some(players) = response
        .get(param::PLAYER_PROPERTIES)
        .and_then(ParamValue::as_properties)
    {
        for (key, value) in players {
            if let PropertyKey::Int(actor) = key {
                room.store_player(*actor, value.as_properties());
            }
        }
    }
    if let Some(actors) = response
        .get(param::ACTOR_LIST)
        .and_then(ParamValue::as_int_array)
    {
        for actor in actors {
            room.store_player(*actor, None);
        }
    }
}

/// Integer list sent as an int array or as raw bytes.
fn int_list(value: Option<&ParamValue>) -> Vec<i32> {
    match value {
        Some(ParamValue::IntArray(values)) => values.clone(),
        Some(ParamValue::Bytes(bytes)) => bytes.iter().map(|b| i32::from(*b)).collect(),
        Some(ParamValue::Array(values)) => values.iter().filter_map(ParamValue::as_i32).collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::error::RealtimeError;
    use crate::protocol::PeerMessage;
    use crate::settings::ConnectionProtocol;

    /// Records the codes of sent operations and receives nothing.
    #[derive(Clone, Default)]
    struct RecordingPeer {
        sent: Arc<Mutex<Vec<OperationCode>>>,
    }

    impl Peer for RecordingPeer {
        fn connect(&mut self, _address: &str, _app_id: &str, _token: Option<&str>) -> bool {
            true
        }

        fn disconnect(&mut self) {}

        fn send_operation(&mut self, request: &OperationRequest, _reliable: bool) -> bool {
            self.sent.lock().unwrap().push(request.code);
            true
        }

        fn establish_encryption(&mut self) -> bool {
            false
        }

        fn service(&mut self) -> Result<Vec<PeerMessage>, RealtimeError> {
            Ok(Vec::new())
        }

        fn send_acks(&mut self) {}

        fn set_protocol(&mut self, _protocol: ConnectionProtocol) {}
    }

    fn client_on(
        role: ServerRole,
        state: ClientState,
    ) -> (RealtimeClient<RecordingPeer>, RecordingPeer) {
        let peer = RecordingPeer::default();
        let mut client = RealtimeClient::new(peer.clone());
        client.role = role;
        client.state = state;
        (client, peer)
    }

    #[test]
    fn room_entry_is_refused_on_the_relay() {
        let (mut client, peer) = client_on(ServerRole::Relay, ClientState::ConnectedToRelay);
        assert!(ServerRole::Relay.allows(OperationCode::JoinRoom));

        assert!(!client.op_join_room(EnterRoomArgs::named("arena")));
        assert!(!client.op_create_room(EnterRoomArgs::named("arena")));

        assert!(peer.sent.lock().unwrap().is_empty());
        assert!(client.intent.is_none());
        assert_eq!(client.state, ClientState::ConnectedToRelay);
    }

    #[test]
    fn room_entry_starts_on_the_matchmaker() {
        let (mut client, peer) =
            client_on(ServerRole::Matchmaker, ClientState::ConnectedToMatchmaker);

        assert!(client.op_join_room(EnterRoomArgs::named("arena")));

        assert_eq!(*peer.sent.lock().unwrap(), vec![OperationCode::JoinRoom]);
        assert_eq!(client.state, ClientState::Joining);
        assert!(!client.op_create_room(EnterRoomArgs::named("other")));
    }
}
