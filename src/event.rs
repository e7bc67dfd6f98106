//! Typed events dispatched by the [`RealtimeClient`](crate::client::RealtimeClient).

use crate::error_codes::DisconnectCause;
use crate::protocol::{EventData, ParameterMap, PropertyMap};
use crate::region::Region;
use crate::room::{LobbyStats, Player, RoomInfo};
use crate::state::ClientState;

/// Group of listeners an event is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    Connection,
    Matchmaking,
    InRoom,
    Lobby,
}

/// Everything the client reports to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    // ── Connection ──────────────────────────────────────────────────
    /// The client moved between states.
    StateChanged {
        previous: ClientState,
        current: ClientState,
    },
    /// Connected to the first server, before authentication.
    Connected,
    /// Authenticated on the matchmaker and ready for matchmaking.
    ConnectedToMatchmaker,
    Disconnected { cause: DisconnectCause },
    RegionListReceived { regions: Vec<Region> },
    /// Data returned by the custom authentication provider.
    CustomAuthenticationResponse { data: ParameterMap },
    CustomAuthenticationFailed { message: String },

    // ── Matchmaking ─────────────────────────────────────────────────
    CreatedRoom,
    CreateRoomFailed { return_code: i16, message: String },
    JoinedRoom,
    JoinRoomFailed { return_code: i16, message: String },
    JoinRandomFailed { return_code: i16, message: String },
    LeftRoom,

    // ── Lobby ───────────────────────────────────────────────────────
    JoinedLobby,
    /// The matchmaker refused the lobby; the client stays on the matchmaker.
    JoinLobbyFailed { return_code: i16, message: String },
    LeftLobby,
    RoomListUpdate { rooms: Vec<RoomInfo> },
    LobbyStatisticsUpdate { lobbies: Vec<LobbyStats> },

    // ── In room ─────────────────────────────────────────────────────
    PlayerEnteredRoom { player: Player },
    PlayerLeftRoom { player: Player },
    RoomPropertiesUpdate { changed: PropertyMap },
    PlayerPropertiesUpdate { actor_number: i32, changed: PropertyMap },
    MasterClientSwitched { actor_number: i32 },
    ErrorInfo { info: String },
    /// Any event the client does not handle itself.
    Custom(EventData),
}

impl ClientEvent {
    pub fn category(&self) -> EventCategory {
        match self {
            Self::StateChanged { .. }
            | Self::Connected
            | Self::ConnectedToMatchmaker
            | Self::Disconnected { .. }
            | Self::RegionListReceived { .. }
            | Self::CustomAuthenticationResponse { .. }
            | Self::CustomAuthenticationFailed { .. } => EventCategory::Connection,
            Self::CreatedRoom
            | Self::CreateRoomFailed { .. }
            | Self::JoinedRoom
            | Self::JoinRoomFailed { .. }
            | Self::JoinRandomFailed { .. }
            | Self::LeftRoom => EventCategory::Matchmaking,
            Self::JoinedLobby
            | Self::JoinLobbyFailed { .. }
            | Self::LeftLobby
            | Self::RoomListUpdate { .. }
            | Self::LobbyStatisticsUpdate { .. } => EventCategory::Lobby,
            Self::PlayerEnteredRoom { .. }
            | Self::PlayerLeftRoom { .. }
            | Self::RoomPropertiesUpdate { .. }
            | Self::PlayerPropertiesUpdate { .. }
            | Self::MasterClientSwitched { .. }
            | Self::ErrorInfo { .. }
            | Self::Custom(_) => EventCategory::InRoom,
        }
    }

    /// Return code of a room entry or lobby failure.
    pub fn failure_code(&self) -> Option<i16> {
        match self {
            Self::CreateRoomFailed { return_code, .. }
            | Self::JoinRoomFailed { return_code, .. }
            | Self::JoinRandomFailed { return_code, .. }
            | Self::JoinLobbyFailed { return_code, .. } => Some(*return_code),
            _ => None,
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

    #[test]
    fn categories() {
        assert_eq!(ClientEvent::Connected.category(), EventCategory::Connection);
        assert_eq!(ClientEvent::LeftRoom.category(), EventCategory::Matchmaking);
        assert_eq!(ClientEvent::LeftLobby.category(), EventCategory::Lobby);
        assert_eq!(
            ClientEvent::MasterClientSwitched { actor_number: 2 }.category(),
            EventCategory::InRoom
        );
    }

    #[test]
    fn failure_code_only_for_failures() {
        let failed = ClientEvent::JoinRoomFailed {
            return_code: 32758,
            message: String::new(),
        };
        assert_eq!(failed.failure_code(), Some(32758));
        assert_eq!(ClientEvent::JoinedRoom.failure_code(), None);

        let lobby = ClientEvent::JoinLobbyFailed {
            return_code: -3,
            message: "refused".into(),
        };
        assert_eq!(lobby.failure_code(), Some(-3));
        assert_eq!(lobby.category(), EventCategory::Lobby);
        assert_eq!(ClientEvent::JoinedLobby.failure_code(), None);
    }
}
