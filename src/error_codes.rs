//! Return codes and disconnect causes used by the relay service.
//!
//! Servers answer every operation with a signed 16-bit return code. `0` means
//! success; everything else is mapped onto [`ErrorCode`] when the value is
//! known. Disconnects are classified by [`DisconnectCause`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Return code signalling success.
pub const OK: i16 = 0;

/// Known non-zero return codes sent by the directory, matchmaking and relay servers.
///
/// Use [`ErrorCode::from_code`] to classify a raw return code and
/// [`description()`](ErrorCode::description) for a human-readable explanation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Generic operation errors
    OperationNotAllowedInCurrentState,
    InvalidOperation,
    InternalServerError,

    // Authentication errors
    InvalidAuthentication,
    MaxCcuReached,
    InvalidRegion,
    CustomAuthenticationFailed,
    AuthenticationTicketExpired,
    InvalidEncryptionParameters,

    // Room entry errors
    RoomAlreadyExists,
    RoomFull,
    RoomClosed,
    ServerFull,
    UserBlocked,
    NoRandomMatchFound,
    RoomDoesNotExist,
    PeerAlreadyJoined,
    InactiveJoinerFound,
    RejoinerNotFound,
    ExcludedUserIdFound,
    ActiveJoinerConflict,
    SlotError,

    // Plugin and webhook errors
    PluginReportedError,
    PluginMismatch,
    HttpLimitReached,
    ExternalHttpCallFailed,

    // Rate limiting
    OperationLimitReached,
}

impl ErrorCode {
    /// Classifies a raw return code. Returns `None` for [`OK`] and unknown values.
    pub fn from_code(code: i16) -> Option<Self> {
        let known = match code {
            -3 => Self::OperationNotAllowedInCurrentState,
            -2 => Self::InvalidOperation,
            -1 => Self::InternalServerError,
            32767 => Self::InvalidAuthentication,
            32766 => Self::RoomAlreadyExists,
            32765 => Self::RoomFull,
            32764 => Self::RoomClosed,
            32762 => Self::ServerFull,
            32761 => Self::UserBlocked,
            32760 => Self::NoRandomMatchFound,
            32758 => Self::RoomDoesNotExist,
            32757 => Self::MaxCcuReached,
            32756 => Self::InvalidRegion,
            32755 => Self::CustomAuthenticationFailed,
            32753 => Self::AuthenticationTicketExpired,
            32752 => Self::PluginReportedError,
            32751 => Self::PluginMismatch,
            32750 => Self::PeerAlreadyJoined,
            32749 => Self::InactiveJoinerFound,
            32748 => Self::RejoinerNotFound,
            32747 => Self::ExcludedUserIdFound,
            32746 => Self::ActiveJoinerConflict,
            32745 => Self::HttpLimitReached,
            32744 => Self::ExternalHttpCallFailed,
            32743 => Self::OperationLimitReached,
            32742 => Self::SlotError,
            32741 => Self::InvalidEncryptionParameters,
            _ => return None,
        };
        Some(known)
    }

    /// The raw return code for this error.
    pub fn code(self) -> i16 {
        match self {
            Self::OperationNotAllowedInCurrentState => -3,
            Self::InvalidOperation => -2,
            Self::InternalServerError => -1,
            Self::InvalidAuthentication => 32767,
            Self::RoomAlreadyExists => 32766,
            Self::RoomFull => 32765,
            Self::RoomClosed => 32764,
            Self::ServerFull => 32762,
            Self::UserBlocked => 32761,
            Self::NoRandomMatchFound => 32760,
            Self::RoomDoesNotExist => 32758,
            Self::MaxCcuReached => 32757,
            Self::InvalidRegion => 32756,
            Self::CustomAuthenticationFailed => 32755,
            Self::AuthenticationTicketExpired => 32753,
            Self::PluginReportedError => 32752,
            Self::PluginMismatch => 32751,
            Self::PeerAlreadyJoined => 32750,
            Self::InactiveJoinerFound => 32749,
            Self::RejoinerNotFound => 32748,
            Self::ExcludedUserIdFound => 32747,
            Self::ActiveJoinerConflict => 32746,
            Self::HttpLimitReached => 32745,
            Self::ExternalHttpCallFailed => 32744,
            Self::OperationLimitReached => 32743,
            Self::SlotError => 32742,
            Self::InvalidEncryptionParameters => 32741,
        }
    }

    /// Returns `true` for failures reported when entering a room.
    pub fn is_room_entry_failure(self) -> bool {
        matches!(
            self,
            Self::RoomAlreadyExists
                | Self::RoomFull
                | Self::RoomClosed
                | Self::ServerFull
                | Self::UserBlocked
                | Self::NoRandomMatchFound
                | Self::RoomDoesNotExist
                | Self::PeerAlreadyJoined
                | Self::InactiveJoinerFound
                | Self::RejoinerNotFound
                | Self::ExcludedUserIdFound
                | Self::ActiveJoinerConflict
                | Self::SlotError
                | Self::PluginReportedError
                | Self::PluginMismatch
        )
    }

    /// Returns `true` for failures of the authentication step.
    pub fn is_authentication_failure(self) -> bool {
        matches!(
            self,
            Self::InvalidAuthentication
                | Self::MaxCcuReached
                | Self::InvalidRegion
                | Self::CustomAuthenticationFailed
                | Self::AuthenticationTicketExpired
                | Self::InvalidEncryptionParameters
        )
    }

    /// Returns `true` if retrying the same request later may succeed.
    ///
    /// Only [`ActiveJoinerConflict`](Self::ActiveJoinerConflict) qualifies: the
    /// previous connection of the same user is released by the server within
    /// roughly ten seconds.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::ActiveJoinerConflict)
    }

    /// Returns a human-readable description of this error code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::OperationNotAllowedInCurrentState => {
                "The operation is not allowed on this server or in the current state."
            }
            Self::InvalidOperation => "The server does not know this operation.",
            Self::InternalServerError => "The server failed to process the operation.",

            Self::InvalidAuthentication => {
                "Authentication failed. The app id is unknown or the credentials were rejected."
            }
            Self::MaxCcuReached => {
                "The application reached its concurrent user limit. Try again later."
            }
            Self::InvalidRegion => "The requested region is not available for this application.",
            Self::CustomAuthenticationFailed => {
                "The custom authentication provider rejected the credentials."
            }
            Self::AuthenticationTicketExpired => {
                "The authentication token expired. A fresh authentication is required."
            }
            Self::InvalidEncryptionParameters => "The encryption parameters were rejected.",

            Self::RoomAlreadyExists => "A room with this name already exists.",
            Self::RoomFull => "The room is full.",
            Self::RoomClosed => "The room is closed for new members.",
            Self::ServerFull => "The server has no capacity for more rooms.",
            Self::UserBlocked => "The user is blocked from this application.",
            Self::NoRandomMatchFound => "No open room matched the random-join filter.",
            Self::RoomDoesNotExist => "The room does not exist (anymore).",
            Self::PeerAlreadyJoined => "This connection already joined the room.",
            Self::InactiveJoinerFound => {
                "An inactive member with the same user id exists. Rejoin instead of joining."
            }
            Self::RejoinerNotFound => {
                "No inactive member with this user id exists. The reserved slot expired."
            }
            Self::ExcludedUserIdFound => "The user id is excluded from this room.",
            Self::ActiveJoinerConflict => {
                "Another connection with the same user id is still active in the room."
            }
            Self::SlotError => "The reserved slots of the room are inconsistent.",

            Self::PluginReportedError => "A server plugin rejected the operation.",
            Self::PluginMismatch => "The room runs a different plugin than requested.",
            Self::HttpLimitReached => "The server-side HTTP call limit was reached.",
            Self::ExternalHttpCallFailed => "A server-side HTTP call failed.",

            Self::OperationLimitReached => {
                "Too many operations were sent. The server no longer accepts operations."
            }
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}

/// Why the client ended up disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectCause {
    /// No disconnect happened (yet).
    #[default]
    None,
    ExceptionOnConnect,
    DnsExceptionOnConnect,
    ServerAddressInvalid,
    Exception,
    ServerTimeout,
    ClientTimeout,
    DisconnectByServerLogic,
    DisconnectByServerReasonUnknown,
    InvalidAuthentication,
    CustomAuthenticationFailed,
    AuthenticationTicketExpired,
    MaxCcuReached,
    InvalidRegion,
    OperationNotAllowedInCurrentState,
    DisconnectByClientLogic,
    /// The server reported an exceeded operation limit; the client disconnected itself.
    DisconnectByOperationLimit,
    /// The server sent an explicit disconnect message.
    DisconnectByDisconnectMessage,
    ApplicationQuit,
    /// The host stopped calling `service()` for longer than the keep-alive window.
    ClientServiceInactivity,
}

impl DisconnectCause {
    /// Maps a failed authentication return code to the disconnect it causes.
    pub fn from_authentication_failure(code: i16) -> Self {
        match ErrorCode::from_code(code) {
            Some(ErrorCode::InvalidAuthentication) => Self::InvalidAuthentication,
            Some(ErrorCode::CustomAuthenticationFailed) => Self::CustomAuthenticationFailed,
            Some(ErrorCode::InvalidRegion) => Self::InvalidRegion,
            Some(ErrorCode::MaxCcuReached) => Self::MaxCcuReached,
            Some(ErrorCode::OperationNotAllowedInCurrentState) => {
                Self::OperationNotAllowedInCurrentState
            }
            Some(ErrorCode::AuthenticationTicketExpired) => Self::AuthenticationTicketExpired,
            _ => Self::DisconnectByServerReasonUnknown,
        }
    }

    /// Returns `true` when the disconnect was requested locally.
    pub fn is_local(self) -> bool {
        matches!(
            self,
            Self::DisconnectByClientLogic
                | Self::DisconnectByOperationLimit
                | Self::ApplicationQuit
                | Self::ClientServiceInactivity
        )
    }
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
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

    const ALL: &[ErrorCode] = &[
        ErrorCode::OperationNotAllowedInCurrentState,
        ErrorCode::InvalidOperation,
        ErrorCode::InternalServerError,
        ErrorCode::InvalidAuthentication,
        ErrorCode::MaxCcuReached,
        ErrorCode::InvalidRegion,
        ErrorCode::CustomAuthenticationFailed,
        ErrorCode::AuthenticationTicketExpired,
        ErrorCode::InvalidEncryptionParameters,
        ErrorCode::RoomAlreadyExists,
        ErrorCode::RoomFull,
        ErrorCode::RoomClosed,
        ErrorCode::ServerFull,
        ErrorCode::UserBlocked,
        ErrorCode::NoRandomMatchFound,
        ErrorCode::RoomDoesNotExist,
        ErrorCode::PeerAlreadyJoined,
        ErrorCode::InactiveJoinerFound,
        ErrorCode::RejoinerNotFound,
        ErrorCode::ExcludedUserIdFound,
        ErrorCode::ActiveJoinerConflict,
        ErrorCode::SlotError,
        ErrorCode::PluginReportedError,
        ErrorCode::PluginMismatch,
        ErrorCode::HttpLimitReached,
        ErrorCode::ExternalHttpCallFailed,
        ErrorCode::OperationLimitReached,
    ];

    #[test]
    fn every_code_maps_back_to_itself() {
        for code in ALL {
            assert_eq!(ErrorCode::from_code(code.code()), Some(*code), "{code:?}");
        }
    }

    #[test]
    fn ok_and_unknown_codes_are_not_errors() {
        assert_eq!(ErrorCode::from_code(OK), None);
        assert_eq!(ErrorCode::from_code(12345), None);
    }

    #[test]
    fn room_does_not_exist_is_32758() {
        assert_eq!(ErrorCode::RoomDoesNotExist.code(), 32758);
        assert!(ErrorCode::RoomDoesNotExist.is_room_entry_failure());
        assert!(!ErrorCode::RoomDoesNotExist.is_transient());
    }

    #[test]
    fn only_active_joiner_conflict_is_transient() {
        let transient: Vec<_> = ALL.iter().filter(|c| c.is_transient()).collect();
        assert_eq!(transient, vec![&ErrorCode::ActiveJoinerConflict]);
    }

    #[test]
    fn authentication_codes_map_to_causes() {
        assert_eq!(
            DisconnectCause::from_authentication_failure(32767),
            DisconnectCause::InvalidAuthentication
        );
        assert_eq!(
            DisconnectCause::from_authentication_failure(32753),
            DisconnectCause::AuthenticationTicketExpired
        );
        assert_eq!(
            DisconnectCause::from_authentication_failure(-3),
            DisconnectCause::OperationNotAllowedInCurrentState
        );
        assert_eq!(
            DisconnectCause::from_authentication_failure(1),
            DisconnectCause::DisconnectByServerReasonUnknown
        );
    }

    #[test]
    fn descriptions_are_not_empty() {
        for code in ALL {
            assert!(!code.description().is_empty());
            assert!(code.to_string().contains(&code.code().to_string()));
        }
    }

    #[test]
    fn serde_uses_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::ActiveJoinerConflict).unwrap();
        assert_eq!(json, "\"ACTIVE_JOINER_CONFLICT\"");
        let cause: DisconnectCause = serde_json::from_str("\"client_timeout\"").unwrap();
        assert_eq!(cause, DisconnectCause::ClientTimeout);
    }
}
