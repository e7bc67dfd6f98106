//! One-call matchmaking: connect and enter a room, or get back into the
//! last room after losing the connection.

use std::future::Future;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bridge::AsyncClient;
use crate::client::RealtimeClient;
use crate::error::{RealtimeError, Result};
use crate::error_codes::{ErrorCode, OK};
use crate::intent::{EnterRoomArgs, JoinRandomArgs, MatchmakingMode};
use crate::protocol::PropertyMap;
use crate::room::{Lobby, RoomOptions};
use crate::settings::{AppSettings, AuthValues};
use crate::state::ClientState;
use crate::transport::Peer;

/// Validity of [`ReconnectInformation`] after it was recorded.
pub const DEFAULT_RECONNECT_VALIDITY: Duration = Duration::from_secs(20);

// ── Arguments ───────────────────────────────────────────────────────

/// Everything [`connect_to_room`] and [`reconnect_to_room`] need.
///
/// Without a room name a random room is joined. Unless `can_only_join` is
/// set, a room is created when none is found.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchmakingArguments {
    pub settings: AppSettings,
    /// Seconds a disconnected player is kept in the room. Rejoining is only
    /// possible when this is positive.
    pub player_ttl_secs: i32,
    pub empty_room_ttl_secs: i32,
    pub room_name: Option<String>,
    /// `0` means unlimited; at most 255.
    pub max_players: u32,
    pub can_only_join: bool,
    pub auth_values: Option<AuthValues>,
    pub plugin_name: Option<String>,
    #[serde(with = "crate::protocol::property_pairs")]
    pub custom_properties: PropertyMap,
    pub expected_users: Vec<String>,
    pub lobby: Lobby,
    /// Custom room properties listed in the lobby.
    pub lobby_properties: Vec<String>,
    pub sql_filter: Option<String>,
    pub ticket: Option<String>,
    pub matching_type: MatchmakingMode,
    /// Replaces the options built from the fields above.
    pub room_options: Option<RoomOptions>,
    pub is_room_visible: Option<bool>,
    pub is_room_open: Option<bool>,
    pub reconnect_info: Option<ReconnectInformation>,
}

impl MatchmakingArguments {
    pub fn new(settings: AppSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_room_name(mut self, name: impl Into<String>) -> Self {
        self.room_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_max_players(mut self, max_players: u32) -> Self {
        self.max_players = max_players;
        self
    }

    #[must_use]
    pub fn with_player_ttl_secs(mut self, secs: i32) -> Self {
        self.player_ttl_secs = secs;
        self
    }

    #[must_use]
    pub fn with_can_only_join(mut self, can_only_join: bool) -> Self {
        self.can_only_join = can_only_join;
        self
    }

    #[must_use]
    pub fn with_auth_values(mut self, values: AuthValues) -> Self {
        self.auth_values = Some(values);
        self
    }

    #[must_use]
    pub fn with_reconnect_info(mut self, info: ReconnectInformation) -> Self {
        self.reconnect_info = Some(info);
        self
    }

    /// # Errors
    ///
    /// [`RealtimeError::InvalidArgument`] for more than 255 players or a
    /// missing app id.
    pub fn validate(&self) -> Result<()> {
        if self.max_players > 255 {
            return Err(RealtimeError::InvalidArgument(format!(
                "max players must be at most 255, got {}",
                self.max_players
            )));
        }
        if self.settings.app_id.is_empty() {
            return Err(RealtimeError::InvalidArgument("app id is required".into()));
        }
        Ok(())
    }

    pub fn can_rejoin(&self) -> bool {
        self.player_ttl_secs > 0
    }

    pub fn enter_room_args(&self) -> EnterRoomArgs {
        let options = self.room_options.clone().unwrap_or_else(|| RoomOptions {
            max_players: self.max_players,
            is_open: self.is_room_open.unwrap_or(true),
            is_visible: self.is_room_visible.unwrap_or(true),
            delete_null_properties: true,
            player_ttl: self.player_ttl_secs.saturating_mul(1000),
            empty_room_ttl: self.empty_room_ttl_secs.saturating_mul(1000),
            plugins: self.plugin_name.clone().map(|name| vec![name]),
            publish_user_id: true,
            custom_properties: self.custom_properties.clone(),
            properties_listed_in_lobby: self.lobby_properties.clone(),
            ..RoomOptions::default()
        });
        EnterRoomArgs {
            room_name: self.room_name.clone(),
            room_options: Some(options),
            lobby: self.lobby.clone(),
            ticket: self.ticket.clone(),
            expected_users: self.expected_users.clone(),
            ..EnterRoomArgs::default()
        }
    }

    pub fn join_random_args(&self) -> JoinRandomArgs {
        JoinRandomArgs {
            expected_properties: self.custom_properties.clone(),
            expected_max_players: self.max_players,
            matchmaking_mode: self.matching_type,
            lobby: self.lobby.clone(),
            sql_filter: self.sql_filter.clone(),
            expected_users: self.expected_users.clone(),
            ticket: self.ticket.clone(),
        }
    }
}

// ── Reconnect information ───────────────────────────────────────────

/// Where the client last was, for getting back in after a restart or a
/// lost connection. Hosts may persist it with serde.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectInformation {
    pub room: String,
    pub region: Option<String>,
    pub app_version: String,
    pub user_id: Option<String>,
    pub expires_at: SystemTime,
}

impl ReconnectInformation {
    /// Records the room the client is in, valid for `validity`.
    pub fn from_client<P: Peer>(client: &RealtimeClient<P>, validity: Duration) -> Option<Self> {
        let room = client.room()?;
        Some(Self {
            room: room.name.clone(),
            region: client.current_region().map(str::to_string),
            app_version: client.settings().app_version.clone(),
            user_id: client.user_id().map(str::to_string),
            expires_at: SystemTime::now() + validity,
        })
    }

    pub fn has_expired(&self) -> bool {
        self.expires_at < SystemTime::now()
    }
}

// ── Retry ───────────────────────────────────────────────────────────

/// Bounds of the rejoin loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Defaults to **10**.
    pub max_attempts: u32,
    /// Wait after an active-joiner conflict. Defaults to **1 s**.
    pub conflict_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            conflict_backoff: Duration::from_secs(1),
        }
    }
}

/// How a successful rejoin loop went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryReport {
    /// Join or rejoin calls made by the loop.
    pub attempts: u32,
    /// Backoff waits after active-joiner conflicts.
    pub waits: u32,
    /// Whether the last call was a rejoin.
    pub rejoined: bool,
}

/// Retries entering a room until it succeeds.
///
/// `initial` is the result of an entry made before the loop, if any.
/// `attempt(rejoin)` makes one call and returns its return code. An
/// active-joiner conflict waits `conflict_backoff` and retries, a missing
/// inactive player switches from rejoin to join, any other code fails.
///
/// # Errors
///
/// [`RealtimeError::Operation`] with the failing code,
/// [`RealtimeError::Cancelled`] once `cancellation` fires, or the error of
/// a call.
pub async fn rejoin_with_retry<F, Fut>(
    policy: &RetryPolicy,
    cancellation: &CancellationToken,
    initial: Option<i16>,
    can_rejoin: bool,
    mut attempt: F,
) -> Result<RetryReport>
where
    F: FnMut(bool) -> Fut,
    Fut: Future<Output = Result<i16>>,
{
    let mut result = initial;
    let mut rejoin = can_rejoin;
    let mut report = RetryReport {
        attempts: 0,
        waits: 0,
        rejoined: rejoin,
    };

    loop {
        if let Some(code) = result {
            if code == OK {
                return Ok(report);
            }
            if report.attempts >= policy.max_attempts && report.attempts > 0 {
                warn!(attempts = report.attempts, code, "giving up on the room");
                return Err(RealtimeError::Operation {
                    return_code: code,
                    message: Some(format!(
                        "room not entered after {} attempts",
                        report.attempts
                    )),
                });
            }
            match ErrorCode::from_code(code) {
                Some(ErrorCode::ActiveJoinerConflict) => {
                    report.waits += 1;
                    tokio::select! {
                        () = tokio::time::sleep(policy.conflict_backoff) => {}
                        () = cancellation.cancelled() => return Err(RealtimeError::Cancelled),
                    }
                }
                Some(ErrorCode::RejoinerNotFound) => {
                    info!("no inactive player left in the room, joining instead");
                    rejoin = false;
                }
                _ => {
                    return Err(RealtimeError::Operation {
                        return_code: code,
                        message: Some("failed to enter the room".into()),
                    });
                }
            }
        }
        if policy.max_attempts == 0 {
            return Err(RealtimeError::InvalidArgument("retry policy allows no attempts".into()));
        }
        if cancellation.is_cancelled() {
            return Err(RealtimeError::Cancelled);
        }

        report.attempts += 1;
        report.rejoined = rejoin;
        if report.attempts > 1 {
            info!(attempt = report.attempts, max = policy.max_attempts, rejoin, "entering room again");
        }
        result = Some(attempt(rejoin).await?);
    }
}

// ── Workflows ───────────────────────────────────────────────────────

/// Connects and enters a room as described by `args`. On success the
/// reconnect information in `args` is refreshed.
///
/// # Errors
///
/// Argument validation, connection and room entry errors.
pub async fn connect_to_room<P: Peer>(
    client: &AsyncClient<P>,
    args: &mut MatchmakingArguments,
) -> Result<()> {
    args.validate()?;
    info!(app_version = %args.settings.app_version, room = ?args.room_name, "connecting to room");

    if let Some(values) = &args.auth_values {
        client.lock().await.set_auth_values(values.clone());
    }
    client
        .connect_using_settings_async(args.settings.clone())
        .await?;

    let create = !args.can_only_join;
    // Every call throws, so a refused entry has already returned.
    match (&args.room_name, create) {
        (None, true) => {
            client
                .join_random_or_create_room_async(args.join_random_args(), args.enter_room_args(), true)
                .await?
        }
        (None, false) => {
            client
                .join_random_room_async(args.join_random_args(), true)
                .await?
        }
        (Some(_), true) => {
            client
                .join_or_create_room_async(args.enter_room_args(), true)
                .await?
        }
        (Some(_), false) => client.join_room_async(args.enter_room_args(), true).await?,
    };

    record_reconnect_info(client, args).await;
    Ok(())
}

/// Gets back into the room recorded in `args.reconnect_info`.
///
/// # Errors
///
/// [`RealtimeError::InvalidArgument`] when the reconnect information is
/// missing or belongs to another app version or user, and every error of
/// the underlying calls.
pub async fn reconnect_to_room<P: Peer>(
    client: &AsyncClient<P>,
    args: &mut MatchmakingArguments,
) -> Result<RetryReport> {
    reconnect_to_room_with(client, args, &RetryPolicy::default()).await
}

/// [`reconnect_to_room`] with an explicit retry policy.
pub async fn reconnect_to_room_with<P: Peer>(
    client: &AsyncClient<P>,
    args: &mut MatchmakingArguments,
    policy: &RetryPolicy,
) -> Result<RetryReport> {
    args.validate()?;
    let info = args
        .reconnect_info
        .clone()
        .ok_or_else(|| RealtimeError::InvalidArgument("reconnect information missing".into()))?;
    if info.app_version != args.settings.app_version {
        return Err(RealtimeError::InvalidArgument("app version mismatch".into()));
    }
    let Some(user_id) = info.user_id.clone().filter(|id| !id.is_empty()) else {
        return Err(RealtimeError::InvalidArgument("user id not set".into()));
    };
    if let Some(values) = &args.auth_values {
        if values.user_id.as_deref() != Some(user_id.as_str()) {
            return Err(RealtimeError::InvalidArgument("user id mismatch".into()));
        }
    }
    if info.has_expired() {
        warn!(room = %info.room, "reconnect information expired");
    }
    info!(room = %info.room, "reconnecting to room");

    if client.state().await == ClientState::PeerCreated {
        // A fresh client has no session to rejoin; reach the same region first.
        let mut settings = args.settings.clone();
        settings.fixed_region = info.region.clone();
        client
            .lock()
            .await
            .set_auth_values(AuthValues::new().with_user_id(user_id.as_str()));
        client.connect_using_settings_async(settings).await?;
    }

    let can_rejoin = args.can_rejoin();
    let mut initial = None;
    if client.state().await != ClientState::ConnectedToMatchmaker {
        client.disconnect_async().await?;
        if can_rejoin {
            initial = Some(client.reconnect_and_rejoin_async(false).await?);
        } else {
            client.reconnect_to_matchmaker_async().await?;
        }
    }

    let cancellation = client.config().cancellation.clone();
    let join_args = args.enter_room_args().with_room_name(info.room.as_str());
    let room = info.room.clone();
    let report = rejoin_with_retry(policy, &cancellation, initial, can_rejoin, |rejoin| {
        let client = client.clone();
        let room = room.clone();
        let join_args = join_args.clone();
        async move {
            if rejoin {
                client.rejoin_room_async(&room, false).await
            } else {
                client.join_room_async(join_args, false).await
            }
        }
    })
    .await?;

    record_reconnect_info(client, args).await;
    Ok(report)
}

async fn record_reconnect_info<P: Peer>(client: &AsyncClient<P>, args: &mut MatchmakingArguments) {
    let guard = client.lock().await;
    if let Some(info) = ReconnectInformation::from_client(&guard, DEFAULT_RECONNECT_VALIDITY) {
        args.reconnect_info = Some(info);
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
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;

    fn scripted(codes: Vec<i16>) -> (Arc<Mutex<Vec<bool>>>, impl FnMut(bool) -> std::future::Ready<Result<i16>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut codes: VecDeque<i16> = codes.into();
        let log = Arc::clone(&calls);
        let attempt = move |rejoin: bool| {
            log.lock().unwrap().push(rejoin);
            std::future::ready(Ok(codes.pop_front().unwrap_or(OK)))
        };
        (calls, attempt)
    }

    #[test]
    fn validate_bounds_max_players() {
        let args = MatchmakingArguments::new(AppSettings::new("app")).with_max_players(255);
        assert!(args.validate().is_ok());
        let args = args.with_max_players(256);
        assert!(matches!(args.validate(), Err(RealtimeError::InvalidArgument(_))));
        assert!(MatchmakingArguments::default().validate().is_err());
    }

    #[test]
    fn enter_room_args_from_fields() {
        let args = MatchmakingArguments::new(AppSettings::new("app"))
            .with_room_name("arena")
            .with_max_players(8)
            .with_player_ttl_secs(30);
        let enter = args.enter_room_args();
        let options = enter.room_options.unwrap();
        assert_eq!(enter.room_name.as_deref(), Some("arena"));
        assert_eq!(options.max_players, 8);
        assert_eq!(options.player_ttl, 30_000);
        assert!(options.publish_user_id);
        assert!(args.can_rejoin());
    }

    #[test]
    fn reconnect_information_survives_json() {
        let info = ReconnectInformation {
            room: "arena".into(),
            region: Some("eu".into()),
            app_version: "1.0".into(),
            user_id: Some("u1".into()),
            expires_at: SystemTime::now() + DEFAULT_RECONNECT_VALIDITY,
        };
        let json = serde_json::to_string(&info).unwrap();
        let back: ReconnectInformation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
        assert!(!back.has_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn conflicts_back_off_then_succeed() {
        let conflict = ErrorCode::ActiveJoinerConflict.code();
        let (calls, attempt) = scripted(vec![conflict, conflict, OK]);
        let started = tokio::time::Instant::now();

        let report = rejoin_with_retry(&RetryPolicy::default(), &CancellationToken::new(), None, true, attempt)
            .await
            .unwrap();

        assert_eq!(report.attempts, 3);
        assert_eq!(report.waits, 2);
        assert_eq!(calls.lock().unwrap().len(), 3);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn missing_rejoiner_switches_to_join() {
        let (calls, attempt) = scripted(vec![OK]);
        let report = rejoin_with_retry(
            &RetryPolicy::default(),
            &CancellationToken::new(),
            Some(ErrorCode::RejoinerNotFound.code()),
            true,
            attempt,
        )
        .await
        .unwrap();
        assert_eq!(*calls.lock().unwrap(), vec![false]);
        assert!(!report.rejoined);
    }

    #[tokio::test]
    async fn other_failures_abort() {
        let closed = ErrorCode::RoomClosed.code();
        let (calls, attempt) = scripted(vec![closed]);
        let err = rejoin_with_retry(&RetryPolicy::default(), &CancellationToken::new(), None, false, attempt)
            .await
            .unwrap_err();
        assert_eq!(err.return_code(), Some(closed));
        assert!(matches!(
            err,
            RealtimeError::Operation { message: Some(ref m), .. } if m == "failed to enter the room"
        ));
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn successful_initial_result_makes_no_calls() {
        let (calls, attempt) = scripted(vec![]);
        let report = rejoin_with_retry(&RetryPolicy::default(), &CancellationToken::new(), Some(OK), true, attempt)
            .await
            .unwrap();
        assert_eq!(report.attempts, 0);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_bounded() {
        let conflict = ErrorCode::ActiveJoinerConflict.code();
        let (calls, attempt) = scripted(vec![conflict; 20]);
        let policy = RetryPolicy {
            max_attempts: 3,
            conflict_backoff: Duration::from_millis(10),
        };
        let err = rejoin_with_retry(&policy, &CancellationToken::new(), None, true, attempt)
            .await
            .unwrap_err();
        assert_eq!(err.return_code(), Some(conflict));
        assert!(matches!(
            err,
            RealtimeError::Operation { message: Some(ref m), .. } if m.contains("3 attempts")
        ));
        assert_eq!(calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn cancelled_before_first_attempt() {
        let token = CancellationToken::new();
        token.cancel();
        let (calls, attempt) = scripted(vec![]);
        let err = rejoin_with_retry(&RetryPolicy::default(), &token, None, true, attempt)
            .await
            .unwrap_err();
        assert!(matches!(err, RealtimeError::Cancelled));
        assert!(calls.lock().unwrap().is_empty());
    }
}
