//! Client states, server roles and the operation legality gate.

use serde::{Deserialize, Serialize};

use crate::protocol::OperationCode;

/// State of a [`RealtimeClient`](crate::client::RealtimeClient).
///
/// Exactly one state is current. The legal edges are enumerated by
/// [`can_transition_to`](Self::can_transition_to).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    #[default]
    PeerCreated,
    ConnectingToDirectory,
    ConnectedToDirectory,
    DisconnectingFromDirectory,
    Authenticating,
    ConnectingToMatchmaker,
    ConnectedToMatchmaker,
    JoiningLobby,
    JoinedLobby,
    DisconnectingFromMatchmaker,
    ConnectingToRelay,
    ConnectedToRelay,
    Joining,
    Joined,
    Leaving,
    DisconnectingFromRelay,
    Disconnecting,
    Disconnected,
    ConnectWithFallbackProtocol,
}

impl ClientState {
    /// `true` while a connection exists or is being set up.
    pub fn is_connected(self) -> bool {
        !matches!(self, Self::PeerCreated | Self::Disconnected | Self::Disconnecting)
    }

    /// `true` when operations other than authentication may be sent.
    pub fn is_connected_and_ready(self) -> bool {
        !matches!(
            self,
            Self::PeerCreated
                | Self::Disconnected
                | Self::Disconnecting
                | Self::DisconnectingFromDirectory
                | Self::DisconnectingFromMatchmaker
                | Self::DisconnectingFromRelay
                | Self::ConnectingToDirectory
                | Self::ConnectingToMatchmaker
                | Self::ConnectingToRelay
                | Self::Authenticating
                | Self::Joining
                | Self::Leaving
                | Self::ConnectWithFallbackProtocol
        )
    }

    pub fn in_room(self) -> bool {
        self == Self::Joined
    }

    pub fn in_lobby(self) -> bool {
        self == Self::JoinedLobby
    }

    pub fn is_connecting(self) -> bool {
        matches!(
            self,
            Self::ConnectingToDirectory | Self::ConnectingToMatchmaker | Self::ConnectingToRelay
        )
    }

    pub fn is_disconnecting(self) -> bool {
        matches!(
            self,
            Self::Disconnecting
                | Self::DisconnectingFromDirectory
                | Self::DisconnectingFromMatchmaker
                | Self::DisconnectingFromRelay
        )
    }

    /// Whether `self -> next` is a legal edge.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ClientState::*;

        if self == next {
            return false;
        }
        // Termination is reachable from everywhere a connection may exist.
        if next == Disconnected {
            return self != Disconnected;
        }
        if next == Disconnecting {
            return !matches!(self, PeerCreated | Disconnected);
        }

        match self {
            PeerCreated | Disconnected => {
                matches!(next, ConnectingToDirectory | ConnectingToMatchmaker | ConnectingToRelay)
            }
            ConnectingToDirectory => {
                matches!(next, ConnectedToDirectory | ConnectWithFallbackProtocol)
            }
            ConnectedToDirectory => matches!(next, Authenticating | DisconnectingFromDirectory),
            Authenticating => matches!(
                next,
                DisconnectingFromDirectory | ConnectedToMatchmaker | ConnectedToRelay | Joining
            ),
            DisconnectingFromDirectory | DisconnectingFromRelay => next == ConnectingToMatchmaker,
            ConnectingToMatchmaker | ConnectingToRelay => next == Authenticating,
            ConnectedToMatchmaker => matches!(next, JoiningLobby | Joining),
            JoiningLobby => matches!(next, JoinedLobby | ConnectedToMatchmaker),
            JoinedLobby => matches!(next, Joining | JoiningLobby | ConnectedToMatchmaker),
            Joining => matches!(
                next,
                Joined
                    | DisconnectingFromMatchmaker
                    | DisconnectingFromRelay
                    | ConnectedToMatchmaker
                    | JoinedLobby
            ),
            DisconnectingFromMatchmaker => next == ConnectingToRelay,
            ConnectedToRelay => matches!(next, Joining | DisconnectingFromRelay),
            Joined => next == Leaving,
            Leaving => next == DisconnectingFromRelay,
            ConnectWithFallbackProtocol => next == ConnectingToDirectory,
            Disconnecting => false,
        }
    }

    /// Whether `op` may be sent while in this state.
    pub fn is_ready_for(self, op: OperationCode) -> bool {
        use OperationCode::*;

        match op {
            Authenticate | AuthenticateOnce => self.is_connected_and_ready() || self.is_connecting(),
            ChangeGroups | GetProperties | SetProperties | RaiseEvent | Leave => self.in_room(),
            CreateRoom | JoinRoom => matches!(
                self,
                Self::ConnectedToMatchmaker | Self::JoinedLobby | Self::ConnectedToRelay
            ),
            LeaveLobby => self.in_lobby(),
            JoinRandomRoom | FindFriends | GetRoomList | GetLobbyStats | JoinLobby => {
                self == Self::ConnectedToMatchmaker
            }
            GetRegions => self == Self::ConnectedToDirectory,
            ServerSettings => self.is_connected(),
        }
    }
}

/// Server the client is currently talking to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerRole {
    #[default]
    Directory,
    Matchmaker,
    Relay,
}

impl ServerRole {
    /// Whether the server in this role accepts `op`.
    pub fn allows(self, op: OperationCode) -> bool {
        use OperationCode::*;

        match self {
            Self::Matchmaker => matches!(
                op,
                CreateRoom
                    | Authenticate
                    | AuthenticateOnce
                    | FindFriends
                    | GetRoomList
                    | GetLobbyStats
                    | JoinRoom
                    | JoinLobby
                    | LeaveLobby
                    | ServerSettings
                    | JoinRandomRoom
            ),
            Self::Relay => matches!(
                op,
                CreateRoom
                    | Authenticate
                    | AuthenticateOnce
                    | ChangeGroups
                    | GetProperties
                    | JoinRoom
                    | Leave
                    | ServerSettings
                    | SetProperties
                    | RaiseEvent
            ),
            Self::Directory => matches!(
                op,
                Authenticate | AuthenticateOnce | GetRegions | ServerSettings
            ),
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

    const ALL: [ClientState; 19] = [
        ClientState::PeerCreated,
        ClientState::ConnectingToDirectory,
        ClientState::ConnectedToDirectory,
        ClientState::DisconnectingFromDirectory,
        ClientState::Authenticating,
        ClientState::ConnectingToMatchmaker,
        ClientState::ConnectedToMatchmaker,
        ClientState::JoiningLobby,
        ClientState::JoinedLobby,
        ClientState::DisconnectingFromMatchmaker,
        ClientState::ConnectingToRelay,
        ClientState::ConnectedToRelay,
        ClientState::Joining,
        ClientState::Joined,
        ClientState::Leaving,
        ClientState::DisconnectingFromRelay,
        ClientState::Disconnecting,
        ClientState::Disconnected,
        ClientState::ConnectWithFallbackProtocol,
    ];

    #[test]
    fn full_hop_path_is_legal() {
        use ClientState::*;
        let path = [
            PeerCreated,
            ConnectingToDirectory,
            ConnectedToDirectory,
            Authenticating,
            DisconnectingFromDirectory,
            ConnectingToMatchmaker,
            Authenticating,
            ConnectedToMatchmaker,
            Joining,
            DisconnectingFromMatchmaker,
            ConnectingToRelay,
            Authenticating,
            Joining,
            Joined,
            Leaving,
            DisconnectingFromRelay,
            ConnectingToMatchmaker,
            Authenticating,
            ConnectedToMatchmaker,
            Disconnecting,
            Disconnected,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn disconnected_reachable_from_every_other_state() {
        for state in ALL {
            assert_eq!(
                state.can_transition_to(ClientState::Disconnected),
                state != ClientState::Disconnected
            );
        }
    }

    #[test]
    fn illegal_edges_are_rejected() {
        use ClientState::*;
        assert!(!PeerCreated.can_transition_to(Joined));
        assert!(!ConnectedToMatchmaker.can_transition_to(ConnectedToDirectory));
        assert!(!Disconnecting.can_transition_to(ConnectingToMatchmaker));
        assert!(!Joined.can_transition_to(Joining));
        assert!(!Disconnected.can_transition_to(Disconnecting));
    }

    #[test]
    fn nothing_but_auth_while_connecting_or_disconnecting() {
        let ops = [
            OperationCode::CreateRoom,
            OperationCode::JoinRoom,
            OperationCode::JoinRandomRoom,
            OperationCode::JoinLobby,
            OperationCode::GetRegions,
            OperationCode::RaiseEvent,
            OperationCode::Leave,
        ];
        for state in ALL.into_iter().filter(|s| s.is_connecting() || s.is_disconnecting()) {
            for op in ops {
                assert!(!state.is_ready_for(op), "{op:?} in {state:?}");
            }
            assert!(!state.is_disconnecting() || !state.is_ready_for(OperationCode::Authenticate));
        }
        assert!(ClientState::ConnectingToRelay.is_ready_for(OperationCode::Authenticate));
    }

    #[test]
    fn readiness_predicates() {
        assert!(!ClientState::Authenticating.is_connected_and_ready());
        assert!(ClientState::Authenticating.is_connected());
        assert!(ClientState::JoinedLobby.is_connected_and_ready());
        assert!(ClientState::Joined.in_room());
        assert!(!ClientState::Disconnecting.is_connected());
    }

    #[test]
    fn role_gate() {
        assert!(ServerRole::Directory.allows(OperationCode::GetRegions));
        assert!(!ServerRole::Directory.allows(OperationCode::JoinRoom));
        assert!(ServerRole::Matchmaker.allows(OperationCode::JoinRandomRoom));
        assert!(!ServerRole::Relay.allows(OperationCode::JoinRandomRoom));
        assert!(ServerRole::Relay.allows(OperationCode::RaiseEvent));
        assert!(!ServerRole::Matchmaker.allows(OperationCode::Leave));
    }
}
