//! Room entry arguments and the cached join intent.
//!
//! A [`JoinIntent`] is built once per attempt and never mutated. When the
//! matchmaker assigns a relay, the client replaces the cached intent with a
//! copy carrying the assigned room name and replays it there.

use serde::{Deserialize, Serialize};

use crate::error::{RealtimeError, Result};
use crate::protocol::{
    custom_keys_valid, param, room_key, OperationCode, OperationRequest, ParamValue, PropertyKey,
    PropertyMap,
};
use crate::room::{Lobby, RoomOptions};

/// How a join request treats missing rooms and returning players.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinMode {
    #[default]
    Default,
    CreateIfNotExists,
    JoinOrRejoin,
    RejoinOnly,
}

impl JoinMode {
    pub fn code(self) -> u8 {
        match self {
            Self::Default => 0,
            Self::CreateIfNotExists => 1,
            Self::JoinOrRejoin => 2,
            Self::RejoinOnly => 3,
        }
    }
}

/// How join-random picks among matching rooms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchmakingMode {
    #[default]
    FillRoom,
    SerialMatching,
    RandomMatching,
}

impl MatchmakingMode {
    pub fn code(self) -> u8 {
        match self {
            Self::FillRoom => 0,
            Self::SerialMatching => 1,
            Self::RandomMatching => 2,
        }
    }
}

/// Legacy byte field of a player count: `0` above 255.
fn max_players_byte(max: u32) -> ParamValue {
    ParamValue::Byte(u8::try_from(max).unwrap_or(0))
}

fn max_players_int(max: u32) -> ParamValue {
    ParamValue::Int(i32::try_from(max).unwrap_or(i32::MAX))
}

fn check_custom_keys(properties: &PropertyMap, what: &str) -> Result<()> {
    if custom_keys_valid(properties) {
        Ok(())
    } else {
        Err(RealtimeError::InvalidArgument(format!(
            "{what} must use string or integer keys"
        )))
    }
}

// ── EnterRoomArgs ───────────────────────────────────────────────────

/// Arguments of create, join and rejoin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnterRoomArgs {
    pub room_name: Option<String>,
    /// Options used if the room gets created.
    pub room_options: Option<RoomOptions>,
    pub lobby: Lobby,
    pub ticket: Option<String>,
    /// Users for whom a slot is reserved.
    pub expected_users: Vec<String>,
    pub join_mode: JoinMode,
}

impl EnterRoomArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(room_name: impl Into<String>) -> Self {
        Self::new().with_room_name(room_name)
    }

    #[must_use]
    pub fn with_room_name(mut self, room_name: impl Into<String>) -> Self {
        self.room_name = Some(room_name.into());
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: RoomOptions) -> Self {
        self.room_options = Some(options);
        self
    }

    #[must_use]
    pub fn with_lobby(mut self, lobby: Lobby) -> Self {
        self.lobby = lobby;
        self
    }

    #[must_use]
    pub fn with_ticket(mut self, ticket: impl Into<String>) -> Self {
        self.ticket = Some(ticket.into());
        self
    }

    #[must_use]
    pub fn with_expected_users(mut self, users: Vec<String>) -> Self {
        self.expected_users = users;
        self
    }

    #[must_use]
    pub fn with_join_mode(mut self, mode: JoinMode) -> Self {
        self.join_mode = mode;
        self
    }

    /// Room names may be omitted only when creating.
    pub fn validate(&self, creating: bool) -> Result<()> {
        if !creating && self.room_name.as_deref().is_none_or(str::is_empty) {
            return Err(RealtimeError::InvalidArgument("room name is required".into()));
        }
        if let Some(options) = &self.room_options {
            check_custom_keys(&options.custom_properties, "room properties")?;
        }
        Ok(())
    }

    fn add_common(&self, mut request: OperationRequest) -> OperationRequest {
        if let Some(name) = self.room_name.as_deref().filter(|n| !n.is_empty()) {
            request = request.with(param::ROOM_NAME, name);
        }
        if !self.lobby.is_default() {
            if let Some(name) = &self.lobby.name {
                request = request.with(param::LOBBY_NAME, name.as_str());
            }
            request = request.with(param::LOBBY_TYPE, ParamValue::Byte(self.lobby.lobby_type.code()));
        }
        if !self.expected_users.is_empty() {
            request = request.with(param::ADD, ParamValue::StringArray(self.expected_users.clone()));
        }
        if let Some(ticket) = &self.ticket {
            request = request.with(param::TICKET, ticket.as_str());
        }
        request
    }

    /// `CreateRoom` request. Room options and player properties are only
    /// sent to the relay.
    pub fn create_request(&self, on_relay: bool, player_properties: &PropertyMap) -> OperationRequest {
        let mut request = self.add_common(OperationRequest::new(OperationCode::CreateRoom));
        if on_relay {
            request = add_player_properties(request, player_properties);
            request = add_room_options(request, &self.room_options.clone().unwrap_or_default());
        }
        request
    }

    /// `JoinRoom` request. A rejoin never sends player properties.
    pub fn join_request(&self, on_relay: bool, player_properties: &PropertyMap) -> OperationRequest {
        let mut request = self.add_common(OperationRequest::new(OperationCode::JoinRoom));
        if self.join_mode != JoinMode::Default {
            request = request.with(param::JOIN_MODE, ParamValue::Byte(self.join_mode.code()));
        }
        if on_relay {
            if self.join_mode != JoinMode::RejoinOnly {
                request = add_player_properties(request, player_properties);
            }
            if self.join_mode == JoinMode::CreateIfNotExists {
                request = add_room_options(request, &self.room_options.clone().unwrap_or_default());
            }
        }
        request
    }
}

fn add_player_properties(request: OperationRequest, properties: &PropertyMap) -> OperationRequest {
    request
        .with(param::PLAYER_PROPERTIES, ParamValue::Properties(properties.clone()))
        .with(param::BROADCAST, true)
}

fn add_room_options(mut request: OperationRequest, options: &RoomOptions) -> OperationRequest {
    let mut props = options.custom_properties.clone();
    props.insert(PropertyKey::Byte(room_key::IS_OPEN), options.is_open.into());
    props.insert(PropertyKey::Byte(room_key::IS_VISIBLE), options.is_visible.into());
    props.insert(
        PropertyKey::Byte(room_key::PROPS_LISTED_IN_LOBBY),
        ParamValue::StringArray(options.properties_listed_in_lobby.clone()),
    );
    if options.max_players > 0 {
        props.insert(PropertyKey::Byte(room_key::MAX_PLAYERS), max_players_byte(options.max_players));
        props.insert(PropertyKey::Byte(room_key::MAX_PLAYERS_INT), max_players_int(options.max_players));
    }

    request = request
        .with(param::ROOM_PROPERTIES, ParamValue::Properties(props))
        .with(param::CLEANUP_CACHE_ON_LEAVE, options.cleanup_cache_on_leave)
        .with(param::CHECK_USER_ON_JOIN, options.check_user_on_join)
        .with(param::ROOM_OPTION_FLAGS, options.flags());
    if options.player_ttl != 0 {
        request = request.with(param::PLAYER_TTL, options.player_ttl);
    }
    if options.empty_room_ttl != 0 {
        request = request.with(param::EMPTY_ROOM_TTL, options.empty_room_ttl);
    }
    if options.suppress_room_events {
        request = request.with(param::SUPPRESS_ROOM_EVENTS, true);
    }
    if options.publish_user_id {
        request = request.with(param::PUBLISH_USER_ID, true);
    }
    if let Some(plugins) = &options.plugins {
        request = request.with(param::PLUGINS, ParamValue::StringArray(plugins.clone()));
    }
    request
}

// ── JoinRandomArgs ──────────────────────────────────────────────────

/// Filter of join-random.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinRandomArgs {
    /// Custom room properties a room must match.
    #[serde(with = "crate::protocol::property_pairs")]
    pub expected_properties: PropertyMap,
    /// `0` matches any room size.
    pub expected_max_players: u32,
    pub matchmaking_mode: MatchmakingMode,
    pub lobby: Lobby,
    /// Filter expression for SQL lobbies.
    pub sql_filter: Option<String>,
    pub expected_users: Vec<String>,
    pub ticket: Option<String>,
}

impl JoinRandomArgs {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_expected_property(mut self, key: impl Into<PropertyKey>, value: impl Into<ParamValue>) -> Self {
        self.expected_properties.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_expected_max_players(mut self, max: u32) -> Self {
        self.expected_max_players = max;
        self
    }

    #[must_use]
    pub fn with_matchmaking_mode(mut self, mode: MatchmakingMode) -> Self {
        self.matchmaking_mode = mode;
        self
    }

    #[must_use]
    pub fn with_lobby(mut self, lobby: Lobby) -> Self {
        self.lobby = lobby;
        self
    }

    #[must_use]
    pub fn with_sql_filter(mut self, filter: impl Into<String>) -> Self {
        self.sql_filter = Some(filter.into());
        self
    }

    #[must_use]
    pub fn with_ticket(mut self, ticket: impl Into<String>) -> Self {
        self.ticket = Some(ticket.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        check_custom_keys(&self.expected_properties, "expected room properties")
    }

    /// `JoinRandomRoom` request, optionally creating a room from `create`.
    pub fn request(&self, create: Option<&EnterRoomArgs>) -> OperationRequest {
        let mut expected = self.expected_properties.clone();
        if self.expected_max_players > 0 {
            expected.insert(
                PropertyKey::Byte(room_key::MAX_PLAYERS),
                max_players_byte(self.expected_max_players),
            );
            expected.insert(
                PropertyKey::Byte(room_key::MAX_PLAYERS_INT),
                max_players_int(self.expected_max_players),
            );
        }

        let mut request = OperationRequest::new(OperationCode::JoinRandomRoom)
            .with(param::ALLOW_REPEATS, true);
        if !expected.is_empty() {
            request = request.with(param::ROOM_PROPERTIES, ParamValue::Properties(expected));
        }
        if self.matchmaking_mode != MatchmakingMode::FillRoom {
            request = request.with(
                param::MATCHMAKING_TYPE,
                ParamValue::Byte(self.matchmaking_mode.code()),
            );
        }
        if !self.lobby.is_default() {
            if let Some(name) = &self.lobby.name {
                request = request.with(param::LOBBY_NAME, name.as_str());
            }
            request = request.with(param::LOBBY_TYPE, ParamValue::Byte(self.lobby.lobby_type.code()));
        }
        if let Some(filter) = &self.sql_filter {
            request = request.with(param::DATA, filter.as_str());
        }
        if !self.expected_users.is_empty() {
            request = request.with(param::ADD, ParamValue::StringArray(self.expected_users.clone()));
        }
        if let Some(ticket) = &self.ticket {
            request = request.with(param::TICKET, ticket.as_str());
        }
        if let Some(create) = create {
            request = request.with(param::JOIN_MODE, ParamValue::Byte(JoinMode::CreateIfNotExists.code()));
            if let Some(name) = create.room_name.as_deref().filter(|n| !n.is_empty()) {
                request = request.with(param::ROOM_NAME, name);
            }
        }
        request
    }
}

// ── JoinIntent ──────────────────────────────────────────────────────

/// Kind of a room entry attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinIntentKind {
    CreateRoom,
    JoinRoom,
    JoinRandomRoom,
    JoinRandomOrCreateRoom,
    JoinOrCreateRoom,
}

/// A cached room entry attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinIntent {
    CreateRoom(EnterRoomArgs),
    /// Join by name; a rejoin carries [`JoinMode::RejoinOnly`].
    JoinRoom(EnterRoomArgs),
    JoinOrCreateRoom(EnterRoomArgs),
    JoinRandomRoom {
        filter: JoinRandomArgs,
        enter: EnterRoomArgs,
    },
    JoinRandomOrCreateRoom {
        filter: JoinRandomArgs,
        enter: EnterRoomArgs,
    },
}

impl JoinIntent {
    pub fn kind(&self) -> JoinIntentKind {
        match self {
            Self::CreateRoom(_) => JoinIntentKind::CreateRoom,
            Self::JoinRoom(_) => JoinIntentKind::JoinRoom,
            Self::JoinOrCreateRoom(_) => JoinIntentKind::JoinOrCreateRoom,
            Self::JoinRandomRoom { .. } => JoinIntentKind::JoinRandomRoom,
            Self::JoinRandomOrCreateRoom { .. } => JoinIntentKind::JoinRandomOrCreateRoom,
        }
    }

    /// Arguments used when entering the room on the relay.
    pub fn args(&self) -> &EnterRoomArgs {
        match self {
            Self::CreateRoom(args) | Self::JoinRoom(args) | Self::JoinOrCreateRoom(args) => args,
            Self::JoinRandomRoom { enter, .. } | Self::JoinRandomOrCreateRoom { enter, .. } => enter,
        }
    }

    /// Whether a successful entry on the relay may have created the room.
    pub fn may_create(&self) -> bool {
        matches!(
            self.kind(),
            JoinIntentKind::CreateRoom
                | JoinIntentKind::JoinOrCreateRoom
                | JoinIntentKind::JoinRandomOrCreateRoom
        )
    }

    /// Copy carrying the room name assigned by the matchmaker.
    #[must_use]
    pub fn with_room_name(&self, room_name: &str) -> Self {
        let rename = |args: &EnterRoomArgs| args.clone().with_room_name(room_name);
        match self {
            Self::CreateRoom(args) => Self::CreateRoom(rename(args)),
            Self::JoinRoom(args) => Self::JoinRoom(rename(args)),
            Self::JoinOrCreateRoom(args) => Self::JoinOrCreateRoom(rename(args)),
            Self::JoinRandomRoom { filter, enter } => Self::JoinRandomRoom {
                filter: filter.clone(),
                enter: rename(enter),
            },
            Self::JoinRandomOrCreateRoom { filter, enter } => Self::JoinRandomOrCreateRoom {
                filter: filter.clone(),
                enter: rename(enter),
            },
        }
    }

    /// Request sent to the matchmaker.
    pub fn matchmaker_request(&self, player_properties: &PropertyMap) -> OperationRequest {
        match self {
            Self::CreateRoom(args) => args.create_request(false, player_properties),
            Self::JoinRoom(args) | Self::JoinOrCreateRoom(args) => args.join_request(false, player_properties),
            Self::JoinRandomRoom { filter, .. } => filter.request(None),
            Self::JoinRandomOrCreateRoom { filter, enter } => filter.request(Some(enter)),
        }
    }

    /// Request replayed on the relay: creates stay creates, every join
    /// variant becomes a join by name.
    pub fn relay_request(&self, player_properties: &PropertyMap) -> OperationRequest {
        match self {
            Self::CreateRoom(args) => args.create_request(true, player_properties),
            Self::JoinRoom(args) => args.join_request(true, player_properties),
            Self::JoinRandomRoom { enter, .. } => enter
                .clone()
                .with_join_mode(JoinMode::Default)
                .join_request(true, player_properties),
            Self::JoinOrCreateRoom(args) | Self::JoinRandomOrCreateRoom { enter: args, .. } => args
                .clone()
                .with_join_mode(JoinMode::CreateIfNotExists)
                .join_request(true, player_properties),
        }
    }

    /// The same room entered again as a rejoin.
    #[must_use]
    pub fn as_rejoin(&self) -> Self {
        Self::JoinRoom(self.args().clone().with_join_mode(JoinMode::RejoinOnly))
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

    fn player_props() -> PropertyMap {
        let mut props = PropertyMap::new();
        props.insert("skill".into(), ParamValue::Int(7));
        props
    }

    #[test]
    fn create_sends_options_only_on_relay() {
        let args = EnterRoomArgs::named("r1").with_options(RoomOptions::new().with_max_players(300));

        let mm = args.create_request(false, &player_props());
        assert_eq!(mm.code, OperationCode::CreateRoom);
        assert_eq!(mm.get(param::ROOM_NAME).and_then(ParamValue::as_str), Some("r1"));
        assert!(mm.get(param::ROOM_PROPERTIES).is_none());
        assert!(mm.get(param::PLAYER_PROPERTIES).is_none());

        let relay = args.create_request(true, &player_props());
        let props = relay.get(param::ROOM_PROPERTIES).and_then(ParamValue::as_properties).unwrap();
        assert_eq!(props.get(&PropertyKey::Byte(room_key::MAX_PLAYERS)), Some(&ParamValue::Byte(0)));
        assert_eq!(props.get(&PropertyKey::Byte(room_key::MAX_PLAYERS_INT)), Some(&ParamValue::Int(300)));
        assert!(relay.get(param::PLAYER_PROPERTIES).is_some());
        assert_eq!(relay.get(param::BROADCAST), Some(&ParamValue::Bool(true)));
    }

    #[test]
    fn rejoin_sends_no_player_properties() {
        let intent = JoinIntent::JoinRoom(EnterRoomArgs::named("r1")).as_rejoin();
        let relay = intent.relay_request(&player_props());
        assert_eq!(relay.get(param::JOIN_MODE), Some(&ParamValue::Byte(3)));
        assert!(relay.get(param::PLAYER_PROPERTIES).is_none());
    }

    #[test]
    fn join_random_always_allows_repeats() {
        let filter = JoinRandomArgs::new().with_expected_max_players(4);
        let request = filter.request(None);
        assert_eq!(request.code, OperationCode::JoinRandomRoom);
        assert_eq!(request.get(param::ALLOW_REPEATS), Some(&ParamValue::Bool(true)));
        assert!(request.get(param::JOIN_MODE).is_none());

        let or_create = filter.request(Some(&EnterRoomArgs::named("fallback")));
        assert_eq!(or_create.get(param::JOIN_MODE), Some(&ParamValue::Byte(1)));
        assert_eq!(or_create.get(param::ROOM_NAME).and_then(ParamValue::as_str), Some("fallback"));
    }

    #[test]
    fn relay_replay_turns_joins_into_join_by_name() {
        let random = JoinIntent::JoinRandomRoom {
            filter: JoinRandomArgs::new(),
            enter: EnterRoomArgs::new(),
        }
        .with_room_name("assigned");
        let request = random.relay_request(&PropertyMap::new());
        assert_eq!(request.code, OperationCode::JoinRoom);
        assert_eq!(request.get(param::ROOM_NAME).and_then(ParamValue::as_str), Some("assigned"));
        assert!(request.get(param::JOIN_MODE).is_none());

        let or_create = JoinIntent::JoinRandomOrCreateRoom {
            filter: JoinRandomArgs::new(),
            enter: EnterRoomArgs::new().with_options(RoomOptions::new()),
        }
        .with_room_name("assigned");
        let request = or_create.relay_request(&PropertyMap::new());
        assert_eq!(request.code, OperationCode::JoinRoom);
        assert_eq!(request.get(param::JOIN_MODE), Some(&ParamValue::Byte(1)));
        assert!(request.get(param::ROOM_PROPERTIES).is_some());

        let create = JoinIntent::CreateRoom(EnterRoomArgs::new()).with_room_name("assigned");
        assert_eq!(create.relay_request(&PropertyMap::new()).code, OperationCode::CreateRoom);
    }

    #[test]
    fn with_room_name_leaves_original_untouched() {
        let original = JoinIntent::CreateRoom(EnterRoomArgs::new());
        let renamed = original.with_room_name("x");
        assert_eq!(original.args().room_name, None);
        assert_eq!(renamed.args().room_name.as_deref(), Some("x"));
        assert_eq!(renamed.kind(), JoinIntentKind::CreateRoom);
    }

    #[test]
    fn validation() {
        assert!(EnterRoomArgs::new().validate(true).is_ok());
        assert!(EnterRoomArgs::new().validate(false).is_err());

        let mut options = RoomOptions::new();
        options
            .custom_properties
            .insert(PropertyKey::Byte(1), ParamValue::Int(1));
        assert!(EnterRoomArgs::named("r").with_options(options).validate(true).is_err());

        let mut filter = JoinRandomArgs::new();
        filter.expected_properties.insert(PropertyKey::Byte(9), ParamValue::Null);
        assert!(filter.validate().is_err());
    }

    #[test]
    fn may_create() {
        assert!(JoinIntent::CreateRoom(EnterRoomArgs::new()).may_create());
        assert!(!JoinIntent::JoinRoom(EnterRoomArgs::named("r")).may_create());
        assert!(JoinIntent::JoinOrCreateRoom(EnterRoomArgs::named("r")).may_create());
    }
}
