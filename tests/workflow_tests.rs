#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! End-to-end tests of the connect-to-room and reconnect-to-room workflows.

mod common;

use std::time::{Duration, SystemTime};

use relay_realtime_client::protocol::{OperationCode, StatusCode};
use relay_realtime_client::settings::AuthValues;
use relay_realtime_client::workflow::{
    connect_to_room, reconnect_to_room, reconnect_to_room_with, RetryPolicy,
};
use relay_realtime_client::{
    ClientState, DisconnectCause, ErrorCode, MatchmakingArguments, RealtimeError,
    ReconnectInformation,
};

use common::{async_client, settings, FakeServerPeer, Script};

fn arguments() -> MatchmakingArguments {
    MatchmakingArguments::new(settings().with_fixed_region("eu"))
        .with_room_name("arena")
        .with_max_players(4)
        .with_player_ttl_secs(30)
}

#[tokio::test]
async fn connect_to_named_room_records_reconnect_information() {
    let peer = FakeServerPeer::default();
    let client = async_client(&peer);
    let mut args = arguments();

    connect_to_room(&client, &mut args).await.unwrap();

    assert_eq!(client.state().await, ClientState::Joined);
    let info = args.reconnect_info.clone().unwrap();
    assert_eq!(info.room, "arena");
    assert_eq!(info.region.as_deref(), Some("eu"));
    assert_eq!(info.app_version, "1.0");
    assert_eq!(info.user_id.as_deref(), Some("server-assigned"));
    assert!(!info.has_expired());
    // Named room that may be created: join with create-if-missing.
    assert_eq!(
        peer.log().ops_to("matchmaker"),
        vec![OperationCode::Authenticate, OperationCode::JoinRoom]
    );
}

#[tokio::test]
async fn connect_to_random_room_when_only_joining() {
    let peer = FakeServerPeer::default();
    let client = async_client(&peer);
    let mut args = MatchmakingArguments::new(settings().with_fixed_region("eu")).with_can_only_join(true);

    connect_to_room(&client, &mut args).await.unwrap();

    assert_eq!(client.lock().await.room().unwrap().name, "random-room");
    assert_eq!(
        peer.log().ops_to("matchmaker"),
        vec![OperationCode::Authenticate, OperationCode::JoinRandomRoom]
    );
}

#[tokio::test]
async fn connect_to_room_surfaces_entry_failure() {
    let full = ErrorCode::RoomFull.code();
    let peer = FakeServerPeer::new(Script {
        matchmaker_entry: [full].into(),
        ..Script::default()
    });
    let client = async_client(&peer);
    let mut args = arguments().with_can_only_join(true);

    let err = connect_to_room(&client, &mut args).await.unwrap_err();

    assert_eq!(err.return_code(), Some(full));
    assert!(args.reconnect_info.is_none());
    assert_eq!(client.active_pumps(), 0);
}

#[tokio::test]
async fn invalid_arguments_are_rejected_before_connecting() {
    let peer = FakeServerPeer::default();
    let client = async_client(&peer);
    let mut args = arguments().with_max_players(300);

    let err = connect_to_room(&client, &mut args).await.unwrap_err();

    assert!(matches!(err, RealtimeError::InvalidArgument(_)));
    assert!(peer.log().connects.is_empty());
}

#[tokio::test]
async fn reconnect_rejoins_after_active_joiner_conflicts() {
    let peer = FakeServerPeer::default();
    let client = async_client(&peer);
    let mut args = arguments();
    connect_to_room(&client, &mut args).await.unwrap();

    peer.drop_connection(StatusCode::TimeoutDisconnect);
    assert_eq!(
        client.wait_for_disconnect().await.unwrap(),
        DisconnectCause::ClientTimeout
    );

    let conflict = ErrorCode::ActiveJoinerConflict.code();
    peer.edit_script(|script| script.relay_entry = [conflict, conflict].into());
    let policy = RetryPolicy {
        conflict_backoff: Duration::from_millis(10),
        ..RetryPolicy::default()
    };
    let report = reconnect_to_room_with(&client, &mut args, &policy).await.unwrap();

    // The direct relay rejoin failed, then one matchmaker rejoin failed.
    assert_eq!(report.waits, 2);
    assert_eq!(report.attempts, 2);
    assert!(report.rejoined);
    assert_eq!(client.state().await, ClientState::Joined);
    assert_eq!(client.lock().await.room().unwrap().name, "arena");
    assert_eq!(client.active_pumps(), 0);
}

#[tokio::test]
async fn reconnect_of_fresh_client_uses_recorded_region_and_user() {
    let peer = FakeServerPeer::default();
    let client = async_client(&peer);
    let mut args = MatchmakingArguments::new(settings())
        .with_room_name("arena")
        .with_reconnect_info(ReconnectInformation {
            room: "arena".into(),
            region: Some("us".into()),
            app_version: "1.0".into(),
            user_id: Some("player-7".into()),
            expires_at: SystemTime::now() + Duration::from_secs(20),
        });

    let report = reconnect_to_room(&client, &mut args).await.unwrap();

    // Without a player TTL there is nothing to rejoin: plain join.
    assert!(!report.rejoined);
    let c = client.lock().await;
    assert_eq!(c.current_region(), Some("us"));
    assert_eq!(c.user_id(), Some("player-7"));
    assert_eq!(c.state(), ClientState::Joined);
}

#[tokio::test]
async fn reconnect_requires_matching_information() {
    let peer = FakeServerPeer::default();
    let client = async_client(&peer);
    let info = ReconnectInformation {
        room: "arena".into(),
        region: Some("eu".into()),
        app_version: "0.9".into(),
        user_id: Some("player-7".into()),
        expires_at: SystemTime::now(),
    };

    let mut missing = arguments();
    assert!(matches!(
        reconnect_to_room(&client, &mut missing).await,
        Err(RealtimeError::InvalidArgument(_))
    ));

    let mut old_version = arguments().with_reconnect_info(info.clone());
    assert!(matches!(
        reconnect_to_room(&client, &mut old_version).await,
        Err(RealtimeError::InvalidArgument(_))
    ));

    let mut other_user = arguments()
        .with_reconnect_info(ReconnectInformation {
            app_version: "1.0".into(),
            ..info
        })
        .with_auth_values(AuthValues::new().with_user_id("someone-else"));
    assert!(matches!(
        reconnect_to_room(&client, &mut other_user).await,
        Err(RealtimeError::InvalidArgument(_))
    ));

    assert!(peer.log().connects.is_empty());
}
