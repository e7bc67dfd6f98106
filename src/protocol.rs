//! Typed model of the messages exchanged with the directory, matchmaking and
//! relay servers.
//!
//! The byte-level codec belongs to the [`Peer`](crate::transport::Peer)
//! implementation. This module only fixes the shapes: operation, event and
//! parameter codes, dynamic parameter values, and the [`PeerMessage`] union a
//! peer hands back from [`service`](crate::transport::Peer::service).
//!
//! All types derive serde so fixtures and diagnostics can use JSON:
//!
//! - [`ParamValue`] is externally tagged (`{"int": 4}`)
//! - [`PropertyMap`] serializes as a list of `[key, value]` pairs because
//!   property keys mix integers and strings
//! - byte payloads use `serde_bytes`

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ── Codes ───────────────────────────────────────────────────────────

/// Operations the client sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationCode {
    AuthenticateOnce,
    Authenticate,
    JoinLobby,
    LeaveLobby,
    CreateRoom,
    JoinRoom,
    JoinRandomRoom,
    Leave,
    RaiseEvent,
    SetProperties,
    GetProperties,
    ChangeGroups,
    FindFriends,
    GetLobbyStats,
    GetRegions,
    ServerSettings,
    GetRoomList,
}

impl OperationCode {
    /// Wire value of the operation.
    pub fn code(self) -> u8 {
        match self {
            Self::AuthenticateOnce => 231,
            Self::Authenticate => 230,
            Self::JoinLobby => 229,
            Self::LeaveLobby => 228,
            Self::CreateRoom => 227,
            Self::JoinRoom => 226,
            Self::JoinRandomRoom => 225,
            Self::Leave => 254,
            Self::RaiseEvent => 253,
            Self::SetProperties => 252,
            Self::GetProperties => 251,
            Self::ChangeGroups => 248,
            Self::FindFriends => 222,
            Self::GetLobbyStats => 221,
            Self::GetRegions => 220,
            Self::ServerSettings => 218,
            Self::GetRoomList => 217,
        }
    }

    /// Looks up an operation by wire value.
    pub fn from_code(code: u8) -> Option<Self> {
        let op = match code {
            231 => Self::AuthenticateOnce,
            230 => Self::Authenticate,
            229 => Self::JoinLobby,
            228 => Self::LeaveLobby,
            227 => Self::CreateRoom,
            226 => Self::JoinRoom,
            225 => Self::JoinRandomRoom,
            254 => Self::Leave,
            253 => Self::RaiseEvent,
            252 => Self::SetProperties,
            251 => Self::GetProperties,
            248 => Self::ChangeGroups,
            222 => Self::FindFriends,
            221 => Self::GetLobbyStats,
            220 => Self::GetRegions,
            218 => Self::ServerSettings,
            217 => Self::GetRoomList,
            _ => return None,
        };
        Some(op)
    }

    /// `true` for [`Authenticate`](Self::Authenticate) and
    /// [`AuthenticateOnce`](Self::AuthenticateOnce).
    pub fn is_authentication(self) -> bool {
        matches!(self, Self::Authenticate | Self::AuthenticateOnce)
    }

    /// `true` for the operations that enter a room.
    pub fn is_room_entry(self) -> bool {
        matches!(self, Self::CreateRoom | Self::JoinRoom | Self::JoinRandomRoom)
    }
}

/// Events raised by the servers. Custom application events use other values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCode {
    Join,
    Leave,
    PropertiesChanged,
    ErrorInfo,
    CacheSliceChanged,
    RoomList,
    RoomListUpdate,
    QueueState,
    Match,
    AppStats,
    LobbyStats,
    AuthEvent,
}

impl EventCode {
    /// Wire value of the event.
    pub fn code(self) -> u8 {
        match self {
            Self::Join => 255,
            Self::Leave => 254,
            Self::PropertiesChanged => 253,
            Self::ErrorInfo => 251,
            Self::CacheSliceChanged => 250,
            Self::RoomList => 230,
            Self::RoomListUpdate => 229,
            Self::QueueState => 228,
            Self::Match => 227,
            Self::AppStats => 226,
            Self::LobbyStats => 224,
            Self::AuthEvent => 223,
        }
    }

    /// Looks up an event by wire value.
    pub fn from_code(code: u8) -> Option<Self> {
        let event = match code {
            255 => Self::Join,
            254 => Self::Leave,
            253 => Self::PropertiesChanged,
            251 => Self::ErrorInfo,
            250 => Self::CacheSliceChanged,
            230 => Self::RoomList,
            229 => Self::RoomListUpdate,
            228 => Self::QueueState,
            227 => Self::Match,
            226 => Self::AppStats,
            224 => Self::LobbyStats,
            223 => Self::AuthEvent,
            _ => return None,
        };
        Some(event)
    }
}

/// Parameter keys of operations, responses and events.
pub mod param {
    pub const ROOM_NAME: u8 = 255;
    pub const ACTOR_NR: u8 = 254;
    pub const TARGET_ACTOR_NR: u8 = 253;
    pub const ACTOR_LIST: u8 = 252;
    pub const PROPERTIES: u8 = 251;
    pub const BROADCAST: u8 = 250;
    pub const PLAYER_PROPERTIES: u8 = 249;
    pub const ROOM_PROPERTIES: u8 = 248;
    pub const DATA: u8 = 245;
    pub const CODE: u8 = 244;
    pub const CLEANUP_CACHE_ON_LEAVE: u8 = 241;
    pub const PUBLISH_USER_ID: u8 = 239;
    pub const ADD: u8 = 238;
    pub const SUPPRESS_ROOM_EVENTS: u8 = 237;
    pub const EMPTY_ROOM_TTL: u8 = 236;
    pub const PLAYER_TTL: u8 = 235;
    pub const IS_INACTIVE: u8 = 233;
    pub const CHECK_USER_ON_JOIN: u8 = 232;
    pub const ADDRESS: u8 = 230;
    pub const PEER_COUNT: u8 = 229;
    pub const ROOM_COUNT: u8 = 228;
    pub const MATCHMAKING_TYPE: u8 = 223;
    pub const USER_ID: u8 = 225;
    pub const APPLICATION_ID: u8 = 224;
    pub const ROOM_LIST: u8 = 222;
    pub const TOKEN: u8 = 221;
    pub const APP_VERSION: u8 = 220;
    pub const INFO: u8 = 218;
    pub const CLIENT_AUTHENTICATION_TYPE: u8 = 217;
    pub const CLIENT_AUTHENTICATION_PARAMS: u8 = 216;
    pub const JOIN_MODE: u8 = 215;
    pub const CLIENT_AUTHENTICATION_DATA: u8 = 214;
    pub const LOBBY_NAME: u8 = 213;
    pub const LOBBY_TYPE: u8 = 212;
    pub const LOBBY_STATS: u8 = 211;
    pub const REGION: u8 = 210;
    pub const PLUGINS: u8 = 204;
    pub const MASTER_CLIENT_ID: u8 = 203;
    pub const NICK_NAME: u8 = 202;
    pub const CLUSTER: u8 = 196;
    pub const ROOM_OPTION_FLAGS: u8 = 191;
    pub const TICKET: u8 = 190;
    /// Opaque flag letting the matchmaker queue join-random requests while few users are online.
    pub const ALLOW_REPEATS: u8 = 188;
}

/// Well-known room property keys (byte keyed, reserved).
pub mod room_key {
    pub const MAX_PLAYERS: u8 = 255;
    pub const IS_VISIBLE: u8 = 254;
    pub const IS_OPEN: u8 = 253;
    pub const PLAYER_COUNT: u8 = 252;
    pub const REMOVED: u8 = 251;
    pub const PROPS_LISTED_IN_LOBBY: u8 = 250;
    pub const CLEANUP_CACHE_ON_LEAVE: u8 = 249;
    pub const MASTER_CLIENT_ID: u8 = 248;
    pub const EXPECTED_USERS: u8 = 247;
    pub const PLAYER_TTL: u8 = 246;
    pub const EMPTY_ROOM_TTL: u8 = 245;
    pub const MAX_PLAYERS_INT: u8 = 243;
}

/// Well-known player property keys (byte keyed, reserved).
pub mod actor_key {
    pub const NICK_NAME: u8 = 255;
    pub const IS_INACTIVE: u8 = 254;
    pub const USER_ID: u8 = 253;
}

/// Bit flags sent in [`param::ROOM_OPTION_FLAGS`].
pub mod room_flag {
    pub const CHECK_USER_ON_JOIN: i32 = 0x01;
    pub const DELETE_CACHE_ON_LEAVE: i32 = 0x02;
    pub const SUPPRESS_ROOM_EVENTS: i32 = 0x04;
    pub const PUBLISH_USER_ID: i32 = 0x08;
    pub const DELETE_NULL_PROPS: i32 = 0x10;
    pub const BROADCAST_PROPS_CHANGE_TO_ALL: i32 = 0x20;
    pub const SUPPRESS_PLAYER_INFO: i32 = 0x40;
}

// ── Values ──────────────────────────────────────────────────────────

/// Key of a room or player property.
///
/// Byte keys are reserved for the well-known properties in [`room_key`] and
/// [`actor_key`]. Custom properties must use integer or string keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKey {
    Byte(u8),
    Int(i32),
    Str(String),
}

impl PropertyKey {
    /// `true` for keys an application may use for custom properties.
    pub fn is_custom(&self) -> bool {
        !matches!(self, Self::Byte(_))
    }
}

impl From<&str> for PropertyKey {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for PropertyKey {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i32> for PropertyKey {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

/// A property table.
pub type PropertyMap = BTreeMap<PropertyKey, ParamValue>;

/// Parameters of an operation, response or event.
pub type ParameterMap = BTreeMap<u8, ParamValue>;

/// Returns `true` if every key of `properties` is a valid custom-property key.
pub fn custom_keys_valid(properties: &PropertyMap) -> bool {
    properties.keys().all(PropertyKey::is_custom)
}

/// A dynamically typed parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamValue {
    Null,
    Bool(bool),
    Byte(u8),
    Short(i16),
    Int(i32),
    Long(i64),
    String(String),
    StringArray(Vec<String>),
    IntArray(Vec<i32>),
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    Properties(#[serde(with = "property_pairs")] PropertyMap),
    Array(Vec<ParamValue>),
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view; byte and short values widen.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Byte(v) => Some(i32::from(*v)),
            Self::Short(v) => Some(i32::from(*v)),
            Self::Int(v) => Some(*v),
            Self::Long(v) => i32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_properties(&self) -> Option<&PropertyMap> {
        match self {
            Self::Properties(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_string_array(&self) -> Option<&[String]> {
        match self {
            Self::StringArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_int_array(&self) -> Option<&[i32]> {
        match self {
            Self::IntArray(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<PropertyMap> for ParamValue {
    fn from(value: PropertyMap) -> Self {
        Self::Properties(value)
    }
}

/// Serializes a [`PropertyMap`] as a sequence of `[key, value]` pairs, for
/// formats whose map keys must be strings.
pub mod property_pairs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::{ParamValue, PropertyKey, PropertyMap};

    pub fn serialize<S: Serializer>(map: &PropertyMap, serializer: S) -> Result<S::Ok, S::Error> {
        let pairs: Vec<(&PropertyKey, &ParamValue)> = map.iter().collect();
        pairs.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<PropertyMap, D::Error> {
        let pairs = Vec::<(PropertyKey, ParamValue)>::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

// ── Messages ────────────────────────────────────────────────────────

/// An operation sent to the current server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub code: OperationCode,
    #[serde(default)]
    pub parameters: ParameterMap,
}

impl OperationRequest {
    pub fn new(code: OperationCode) -> Self {
        Self {
            code,
            parameters: ParameterMap::new(),
        }
    }

    /// Adds a parameter.
    #[must_use]
    pub fn with(mut self, key: u8, value: impl Into<ParamValue>) -> Self {
        self.parameters.insert(key, value.into());
        self
    }

    pub fn get(&self, key: u8) -> Option<&ParamValue> {
        self.parameters.get(&key)
    }
}

/// The server's answer to an [`OperationRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResponse {
    pub code: OperationCode,
    pub return_code: i16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_message: Option<String>,
    #[serde(default)]
    pub parameters: ParameterMap,
}

impl OperationResponse {
    /// A successful response without parameters.
    pub fn ok(code: OperationCode) -> Self {
        Self {
            code,
            return_code: crate::error_codes::OK,
            debug_message: None,
            parameters: ParameterMap::new(),
        }
    }

    /// A failed response.
    pub fn failed(code: OperationCode, return_code: i16, message: impl Into<String>) -> Self {
        Self {
            code,
            return_code,
            debug_message: Some(message.into()),
            parameters: ParameterMap::new(),
        }
    }

    /// Adds a parameter.
    #[must_use]
    pub fn with(mut self, key: u8, value: impl Into<ParamValue>) -> Self {
        self.parameters.insert(key, value.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.return_code == crate::error_codes::OK
    }

    pub fn get(&self, key: u8) -> Option<&ParamValue> {
        self.parameters.get(&key)
    }

    pub fn get_str(&self, key: u8) -> Option<&str> {
        self.get(key).and_then(ParamValue::as_str)
    }
}

/// An event pushed by a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    /// Raw event code; see [`EventCode`].
    pub code: u8,
    /// Actor number of the sender, for in-room events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<i32>,
    #[serde(default)]
    pub parameters: ParameterMap,
}

impl EventData {
    pub fn new(code: EventCode) -> Self {
        Self {
            code: code.code(),
            sender: None,
            parameters: ParameterMap::new(),
        }
    }

    /// Adds a parameter.
    #[must_use]
    pub fn with(mut self, key: u8, value: impl Into<ParamValue>) -> Self {
        self.parameters.insert(key, value.into());
        self
    }

    pub fn kind(&self) -> Option<EventCode> {
        EventCode::from_code(self.code)
    }

    pub fn get(&self, key: u8) -> Option<&ParamValue> {
        self.parameters.get(&key)
    }
}

/// Low-level connection status reported by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Connect,
    Disconnect,
    EncryptionEstablished,
    EncryptionFailedToEstablish,
    ExceptionOnConnect,
    SecurityExceptionOnConnect,
    DnsExceptionOnConnect,
    ServerAddressInvalid,
    Exception,
    ExceptionOnReceive,
    SendError,
    TimeoutDisconnect,
    DisconnectByServerTimeout,
    DisconnectByServerLogic,
    DisconnectByServerReasonUnknown,
    DisconnectByServerUserLimit,
}

/// Everything a peer can deliver from one [`service`](crate::transport::Peer::service) call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PeerMessage {
    OperationResponse(OperationResponse),
    Event(EventData),
    Status(StatusCode),
    DisconnectMessage {
        code: i16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        debug_message: Option<String>,
    },
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
    fn operation_codes_round_trip_through_wire_values() {
        for code in [
            OperationCode::AuthenticateOnce,
            OperationCode::Authenticate,
            OperationCode::JoinLobby,
            OperationCode::LeaveLobby,
            OperationCode::CreateRoom,
            OperationCode::JoinRoom,
            OperationCode::JoinRandomRoom,
            OperationCode::Leave,
            OperationCode::RaiseEvent,
            OperationCode::SetProperties,
            OperationCode::GetProperties,
            OperationCode::ChangeGroups,
            OperationCode::FindFriends,
            OperationCode::GetLobbyStats,
            OperationCode::GetRegions,
            OperationCode::ServerSettings,
            OperationCode::GetRoomList,
        ] {
            assert_eq!(OperationCode::from_code(code.code()), Some(code));
        }
        assert_eq!(OperationCode::from_code(0), None);
    }

    #[test]
    fn custom_event_codes_are_unknown() {
        let event = EventData {
            code: 7,
            sender: Some(2),
            parameters: ParameterMap::new(),
        };
        assert_eq!(event.kind(), None);
        assert_eq!(EventData::new(EventCode::Join).kind(), Some(EventCode::Join));
    }

    #[test]
    fn byte_keys_are_not_custom() {
        let mut props = PropertyMap::new();
        props.insert("map".into(), "forest".into());
        props.insert(7.into(), ParamValue::Int(1));
        assert!(custom_keys_valid(&props));

        props.insert(PropertyKey::Byte(room_key::IS_OPEN), true.into());
        assert!(!custom_keys_valid(&props));
    }

    #[test]
    fn integer_views_widen() {
        assert_eq!(ParamValue::Byte(4).as_i32(), Some(4));
        assert_eq!(ParamValue::Short(-2).as_i32(), Some(-2));
        assert_eq!(ParamValue::Long(i64::MAX).as_i32(), None);
        assert_eq!(ParamValue::String("4".into()).as_i32(), None);
    }

    #[test]
    fn peer_message_json_shape() {
        let msg = PeerMessage::OperationResponse(
            OperationResponse::ok(OperationCode::JoinRoom).with(param::ROOM_NAME, "room1"),
        );
        let text = serde_json::to_string(&msg).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["type"], "operation_response");
        assert_eq!(json["data"]["code"], "join_room");
        assert_eq!(json["data"]["parameters"]["255"]["string"], "room1");

        // Integer map keys only parse back from text.
        let back: PeerMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn property_maps_serialize_as_pairs() {
        let mut props = PropertyMap::new();
        props.insert(PropertyKey::Byte(room_key::MAX_PLAYERS), ParamValue::Byte(4));
        props.insert("mode".into(), "ranked".into());
        let value = ParamValue::Properties(props.clone());

        let text = serde_json::to_string(&value).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(json["properties"].is_array());
        let back: ParamValue = serde_json::from_str(&text).unwrap();
        assert_eq!(back.as_properties(), Some(&props));
    }

    #[test]
    fn status_message_parses() {
        let msg: PeerMessage =
            serde_json::from_str(r#"{"type":"status","data":"timeout_disconnect"}"#).unwrap();
        assert_eq!(msg, PeerMessage::Status(StatusCode::TimeoutDisconnect));
    }
}
