//! Rooms, players and lobbies.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::protocol::{actor_key, room_flag, room_key, ParamValue, PropertyKey, PropertyMap};

// ── Lobby ───────────────────────────────────────────────────────────

/// Matchmaking behavior of a lobby.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LobbyType {
    #[default]
    Default,
    /// Rooms are filtered with SQL-like expressions.
    Sql,
    AsyncRandom,
}

impl LobbyType {
    /// Wire code of the lobby type.
    pub fn code(self) -> u8 {
        match self {
            Self::Default => 0,
            Self::Sql => 2,
            Self::AsyncRandom => 3,
        }
    }

    /// Unknown codes fall back to [`LobbyType::Default`].
    pub fn from_code(code: i32) -> Self {
        match code {
            2 => Self::Sql,
            3 => Self::AsyncRandom,
            _ => Self::Default,
        }
    }
}

/// A named, typed lobby. The unnamed default lobby is [`Lobby::default`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lobby {
    pub name: Option<String>,
    pub lobby_type: LobbyType,
}

impl Lobby {
    /// Named lobby of type `lobby_type`.
    pub fn new(name: impl Into<String>, lobby_type: LobbyType) -> Self {
        Self {
            name: Some(name.into()),
            lobby_type,
        }
    }

    /// Whether this names the default lobby.
    pub fn is_default(&self) -> bool {
        self.name.as_deref().is_none_or(str::is_empty) && self.lobby_type == LobbyType::Default
    }
}

/// Statistics of one lobby.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobbyStats {
    pub lobby: Lobby,
    pub player_count: i32,
    pub room_count: i32,
}

// ── RoomOptions ─────────────────────────────────────────────────────

/// Options applied when a room is created.
///
/// # Example
///
/// ```
/// use relay_realtime_client::room::RoomOptions;
///
/// let options = RoomOptions::new().with_max_players(4).with_player_ttl(30_000);
/// assert_eq!(options.max_players, 4);
/// assert!(options.is_open);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomOptions {
    pub is_visible: bool,
    pub is_open: bool,
    /// `0` means unlimited.
    pub max_players: u32,
    /// Milliseconds a player stays inactive before being removed. `-1` keeps
    /// players forever.
    pub player_ttl: i32,
    /// Milliseconds an empty room is kept alive.
    pub empty_room_ttl: i32,
    pub cleanup_cache_on_leave: bool,
    #[serde(with = "crate::protocol::property_pairs")]
    pub custom_properties: PropertyMap,
    /// Custom property names listed in the lobby.
    pub properties_listed_in_lobby: Vec<String>,
    pub plugins: Option<Vec<String>>,
    pub suppress_room_events: bool,
    pub suppress_player_info: bool,
    pub publish_user_id: bool,
    pub delete_null_properties: bool,
    pub broadcast_props_change_to_all: bool,
    pub check_user_on_join: bool,
}

impl Default for RoomOptions {
    fn default() -> Self {
        Self {
            is_visible: true,
            is_open: true,
            max_players: 0,
            player_ttl: 0,
            empty_room_ttl: 0,
            cleanup_cache_on_leave: true,
            custom_properties: PropertyMap::new(),
            properties_listed_in_lobby: Vec::new(),
            plugins: None,
            suppress_room_events: false,
            suppress_player_info: false,
            publish_user_id: false,
            delete_null_properties: false,
            broadcast_props_change_to_all: true,
            check_user_on_join: false,
        }
    }
}

impl RoomOptions {
    /// Options with the server defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Player limit; zero means unlimited.
    #[must_use]
    pub fn with_max_players(mut self, max_players: u32) -> Self {
        self.max_players = max_players;
        self
    }

    /// How long, in milliseconds, a dropped player keeps their slot.
    /// `-1` keeps it for the room's lifetime.
    #[must_use]
    pub fn with_player_ttl(mut self, ttl_ms: i32) -> Self {
        self.player_ttl = ttl_ms;
        self
    }

    /// How long, in milliseconds, the room outlives its last player.
    #[must_use]
    pub fn with_empty_room_ttl(mut self, ttl_ms: i32) -> Self {
        self.empty_room_ttl = ttl_ms;
        self
    }

    /// Whether the room shows up in lobby listings.
    #[must_use]
    pub fn with_visibility(mut self, visible: bool) -> Self {
        self.is_visible = visible;
        self
    }

    /// Whether the room accepts new players.
    #[must_use]
    pub fn with_open(mut self, open: bool) -> Self {
        self.is_open = open;
        self
    }

    /// Adds a custom room property.
    #[must_use]
    pub fn with_custom_property(
        mut self,
        key: impl Into<PropertyKey>,
        value: impl Into<ParamValue>,
    ) -> Self {
        self.custom_properties.insert(key.into(), value.into());
        self
    }

    /// Lists the custom property `name` in lobby room listings.
    #[must_use]
    pub fn with_lobby_property(mut self, name: impl Into<String>) -> Self {
        self.properties_listed_in_lobby.push(name.into());
        self
    }

    /// Server plugins to load for the room.
    #[must_use]
    pub fn with_plugins(mut self, plugins: Vec<String>) -> Self {
        self.plugins = Some(plugins);
        self
    }

    /// Stops the server from raising join and leave events.
    #[must_use]
    pub fn with_suppress_room_events(mut self, suppress: bool) -> Self {
        self.suppress_room_events = suppress;
        self
    }

    /// Shares user ids with the other players.
    #[must_use]
    pub fn with_publish_user_id(mut self, publish: bool) -> Self {
        self.publish_user_id = publish;
        self
    }

    /// Bit set sent as the room option flags parameter.
    pub fn flags(&self) -> i32 {
        let mut flags = 0;
        for (enabled, bit) in [
            (self.check_user_on_join, room_flag::CHECK_USER_ON_JOIN),
            (self.cleanup_cache_on_leave, room_flag::DELETE_CACHE_ON_LEAVE),
            (self.suppress_room_events, room_flag::SUPPRESS_ROOM_EVENTS),
            (self.publish_user_id, room_flag::PUBLISH_USER_ID),
            (self.delete_null_properties, room_flag::DELETE_NULL_PROPS),
            (self.broadcast_props_change_to_all, room_flag::BROADCAST_PROPS_CHANGE_TO_ALL),
            (self.suppress_player_info, room_flag::SUPPRESS_PLAYER_INFO),
        ] {
            if enabled {
                flags |= bit;
            }
        }
        flags
    }
}

// ── Player ──────────────────────────────────────────────────────────

/// A member of a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub actor_number: i32,
    pub user_id: Option<String>,
    pub nick_name: String,
    pub is_inactive: bool,
    pub is_local: bool,
    /// Custom properties only.
    #[serde(with = "crate::protocol::property_pairs")]
    pub properties: PropertyMap,
}

impl Player {
    /// Player with no properties yet.
    pub fn new(actor_number: i32, is_local: bool) -> Self {
        Self {
            actor_number,
            user_id: None,
            nick_name: String::new(),
            is_inactive: false,
            is_local,
            properties: PropertyMap::new(),
        }
    }

    /// Merges a property table. Well-known keys update fields; a `Null`
    /// value removes a custom property.
    pub fn apply_properties(&mut self, properties: &PropertyMap) {
        for (key, value) in properties {
            match key {
                PropertyKey::Byte(actor_key::NICK_NAME) => {
                    if let Some(name) = value.as_str() {
                        self.nick_name = name.to_string();
                    }
                }
                PropertyKey::Byte(actor_key::USER_ID) => {
                    self.user_id = value.as_str().map(str::to_string);
                }
                PropertyKey::Byte(actor_key::IS_INACTIVE) => {
                    self.is_inactive = value.as_bool().unwrap_or(false);
                }
                PropertyKey::Byte(_) => {}
                custom => merge_custom(&mut self.properties, custom, value),
            }
        }
    }
}

fn max_players_int(properties: &PropertyMap) -> Option<u32> {
    properties
        .get(&PropertyKey::Byte(room_key::MAX_PLAYERS_INT))
        .and_then(ParamValue::as_i32)
        .and_then(|v| u32::try_from(v).ok())
}

fn merge_custom(target: &mut PropertyMap, key: &PropertyKey, value: &ParamValue) {
    if *value == ParamValue::Null {
        target.remove(key);
    } else {
        target.insert(key.clone(), value.clone());
    }
}

// ── Room ────────────────────────────────────────────────────────────

/// The room the client is in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub name: String,
    /// Actor number of the local player; `-1` until joined.
    pub local_actor: i32,
    pub players: BTreeMap<i32, Player>,
    /// Custom properties only.
    #[serde(with = "crate::protocol::property_pairs")]
    pub properties: PropertyMap,
    pub master_client_id: i32,
    pub is_open: bool,
    pub is_visible: bool,
    pub max_players: u32,
    pub player_ttl: i32,
    pub empty_room_ttl: i32,
    pub expected_users: Vec<String>,
    pub properties_listed_in_lobby: Vec<String>,
    pub suppress_room_events: bool,
}

impl Room {
    /// Empty room with no local actor yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            local_actor: -1,
            players: BTreeMap::new(),
            properties: PropertyMap::new(),
            master_client_id: 0,
            is_open: true,
            is_visible: true,
            max_players: 0,
            player_ttl: 0,
            empty_room_ttl: 0,
            expected_users: Vec::new(),
            properties_listed_in_lobby: Vec::new(),
            suppress_room_events: false,
        }
    }

    /// Room seeded from the options used to create it.
    pub fn from_options(name: impl Into<String>, options: &RoomOptions) -> Self {
        let mut room = Self::new(name);
        room.is_open = options.is_open;
        room.is_visible = options.is_visible;
        room.max_players = options.max_players;
        room.player_ttl = options.player_ttl;
        room.empty_room_ttl = options.empty_room_ttl;
        room.properties = options.custom_properties.clone();
        room.properties_listed_in_lobby = options.properties_listed_in_lobby.clone();
        room.suppress_room_events = options.suppress_room_events;
        room
    }

    /// Merges a room property table.
    pub fn apply_properties(&mut self, properties: &PropertyMap) {
        for (key, value) in properties {
            match key {
                PropertyKey::Byte(room_key::MAX_PLAYERS) => {
                    // The byte field reads 0 above 255 players; the int field wins.
                    if max_players_int(properties).is_none() {
                        if let Some(max) = value.as_i32().and_then(|v| u32::try_from(v).ok()) {
                            self.max_players = max;
                        }
                    }
                }
                PropertyKey::Byte(room_key::MAX_PLAYERS_INT) => {
                    if let Some(max) = max_players_int(properties) {
                        self.max_players = max;
                    }
                }
                PropertyKey::Byte(room_key::IS_OPEN) => {
                    self.is_open = value.as_bool().unwrap_or(self.is_open);
                }
                PropertyKey::Byte(room_key::IS_VISIBLE) => {
                    self.is_visible = value.as_bool().unwrap_or(self.is_visible);
                }
                PropertyKey::Byte(room_key::MASTER_CLIENT_ID) => {
                    if let Some(id) = value.as_i32() {
                        self.master_client_id = id;
                    }
                }
                PropertyKey::Byte(room_key::PLAYER_TTL) => {
                    self.player_ttl = value.as_i32().unwrap_or(self.player_ttl);
                }
                PropertyKey::Byte(room_key::EMPTY_ROOM_TTL) => {
                    self.empty_room_ttl = value.as_i32().unwrap_or(self.empty_room_ttl);
                }
                PropertyKey::Byte(room_key::EXPECTED_USERS) => {
                    self.expected_users = value.as_string_array().map(<[String]>::to_vec).unwrap_or_default();
                }
                PropertyKey::Byte(room_key::PROPS_LISTED_IN_LOBBY) => {
                    if let Some(names) = value.as_string_array() {
                        self.properties_listed_in_lobby = names.to_vec();
                    }
                }
                PropertyKey::Byte(_) => {}
                custom => merge_custom(&mut self.properties, custom, value),
            }
        }
    }

    /// Player by actor number, inactive ones included.
    pub fn player(&self, actor_number: i32) -> Option<&Player> {
        self.players.get(&actor_number)
    }

    /// Mutable access to a player by actor number.
    pub fn player_mut(&mut self, actor_number: i32) -> Option<&mut Player> {
        self.players.get_mut(&actor_number)
    }

    /// The local player, once the server assigned an actor number.
    pub fn local_player(&self) -> Option<&Player> {
        self.players.get(&self.local_actor)
    }

    /// Inserts or updates a player from its property table.
    pub fn store_player(&mut self, actor_number: i32, properties: Option<&PropertyMap>) -> &Player {
        let is_local = actor_number == self.local_actor;
        let player = self
            .players
            .entry(actor_number)
            .or_insert_with(|| Player::new(actor_number, is_local));
        if let Some(props) = properties {
            player.apply_properties(props);
        }
        player
    }

    /// Drops a player from the room.
    pub fn remove_player(&mut self, actor_number: i32) -> Option<Player> {
        self.players.remove(&actor_number)
    }

    /// Number of active players.
    pub fn player_count(&self) -> usize {
        self.players.values().filter(|p| !p.is_inactive).count()
    }

    /// Lowest active actor number other than `excluding`.
    pub fn next_master(&self, excluding: i32) -> Option<i32> {
        self.players
            .values()
            .filter(|p| p.actor_number != excluding && !p.is_inactive)
            .map(|p| p.actor_number)
            .min()
    }
}

/// A room as listed in a lobby.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub name: String,
    pub removed: bool,
    pub is_open: bool,
    pub is_visible: bool,
    pub max_players: u32,
    pub player_count: u32,
    #[serde(with = "crate::protocol::property_pairs")]
    pub properties: PropertyMap,
}

impl RoomInfo {
    /// Builds a listing from the room properties of a room list entry.
    pub fn from_properties(name: impl Into<String>, properties: &PropertyMap) -> Self {
        let byte = |key: u8| properties.get(&PropertyKey::Byte(key));
        let int = |key: u8| {
            byte(key)
                .and_then(ParamValue::as_i32)
                .and_then(|v| u32::try_from(v).ok())
        };
        let max_players = max_players_int(properties)
            .or_else(|| int(room_key::MAX_PLAYERS))
            .unwrap_or(0);
        Self {
            name: name.into(),
            removed: byte(room_key::REMOVED).and_then(ParamValue::as_bool).unwrap_or(false),
            is_open: byte(room_key::IS_OPEN).and_then(ParamValue::as_bool).unwrap_or(true),
            is_visible: byte(room_key::IS_VISIBLE).and_then(ParamValue::as_bool).unwrap_or(true),
            max_players,
            player_count: int(room_key::PLAYER_COUNT).unwrap_or(0),
            properties: properties
                .iter()
                .filter(|(k, _)| k.is_custom())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
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

    fn props(pairs: Vec<(PropertyKey, ParamValue)>) -> PropertyMap {
        pairs.into_iter().collect()
    }

    #[test]
    fn default_flags() {
        let flags = RoomOptions::default().flags();
        assert_eq!(
            flags,
            room_flag::DELETE_CACHE_ON_LEAVE | room_flag::BROADCAST_PROPS_CHANGE_TO_ALL
        );
        let flags = RoomOptions::default().with_suppress_room_events(true).flags();
        assert_ne!(flags & room_flag::SUPPRESS_ROOM_EVENTS, 0);
    }

    #[test]
    fn room_reads_well_known_properties() {
        let mut room = Room::new("r");
        room.apply_properties(&props(vec![
            (PropertyKey::Byte(room_key::MAX_PLAYERS), ParamValue::Byte(0)),
            (PropertyKey::Byte(room_key::MAX_PLAYERS_INT), ParamValue::Int(300)),
            (PropertyKey::Byte(room_key::IS_OPEN), ParamValue::Bool(false)),
            (PropertyKey::Byte(room_key::MASTER_CLIENT_ID), ParamValue::Int(2)),
            ("map".into(), "forest".into()),
        ]));
        assert_eq!(room.max_players, 300);
        assert!(!room.is_open);
        assert_eq!(room.master_client_id, 2);
        assert_eq!(room.properties.len(), 1);
    }

    #[test]
    fn null_removes_custom_property() {
        let mut room = Room::new("r");
        room.apply_properties(&props(vec![("map".into(), "forest".into())]));
        room.apply_properties(&props(vec![("map".into(), ParamValue::Null)]));
        assert!(room.properties.is_empty());
    }

    #[test]
    fn player_properties_update_fields() {
        let mut room = Room::new("r");
        room.local_actor = 1;
        let player = room.store_player(
            1,
            Some(&props(vec![
                (PropertyKey::Byte(actor_key::NICK_NAME), "alice".into()),
                (PropertyKey::Byte(actor_key::USER_ID), "u1".into()),
                ("score".into(), ParamValue::Int(3)),
            ])),
        );
        assert!(player.is_local);
        assert_eq!(player.nick_name, "alice");
        assert_eq!(player.user_id.as_deref(), Some("u1"));
        assert_eq!(player.properties.len(), 1);
    }

    #[test]
    fn next_master_skips_inactive_players() {
        let mut room = Room::new("r");
        room.store_player(1, None);
        room.store_player(2, None);
        room.store_player(3, None);
        room.player_mut(2).unwrap().is_inactive = true;
        assert_eq!(room.next_master(1), Some(3));
        assert_eq!(room.player_count(), 2);
    }

    #[test]
    fn room_info_prefers_int_max_players() {
        let info = RoomInfo::from_properties(
            "big",
            &props(vec![
                (PropertyKey::Byte(room_key::MAX_PLAYERS), ParamValue::Byte(0)),
                (PropertyKey::Byte(room_key::MAX_PLAYERS_INT), ParamValue::Int(512)),
                (PropertyKey::Byte(room_key::PLAYER_COUNT), ParamValue::Byte(3)),
            ]),
        );
        assert_eq!(info.max_players, 512);
        assert_eq!(info.player_count, 3);
        assert!(info.is_open);
        assert!(!info.removed);
    }

    #[test]
    fn default_lobby() {
        assert!(Lobby::default().is_default());
        assert!(!Lobby::new("ranked", LobbyType::Sql).is_default());
        assert_eq!(LobbyType::from_code(2), LobbyType::Sql);
    }
}
