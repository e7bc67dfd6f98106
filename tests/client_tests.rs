#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Integration tests driving the client through a scripted fake server.
//!
//! Uses [`FakeServerPeer`] from `tests/common` for the directory, matchmaker
//! and relay roles and checks state transitions, the operations sent on each
//! hop, event ordering and the settlement of async operations.

mod common;

use std::sync::Arc;
use std::time::Duration;

use relay_realtime_client::error_codes::OK;
use relay_realtime_client::intent::{EnterRoomArgs, JoinRandomArgs};
use relay_realtime_client::protocol::{
    param, room_key, EventCode, EventData, OperationCode, ParamValue, PropertyKey, PropertyMap,
    StatusCode,
};
use relay_realtime_client::settings::{AsyncConfig, AuthMode, ConnectionProtocol};
use relay_realtime_client::{
    AsyncClient, ClientEvent, ClientState, DisconnectCause, ErrorCode, KeepAlive, RealtimeClient,
    RealtimeError,
};
use tokio_util::sync::CancellationToken;

use common::{
    async_client, settings, FakeServerPeer, MockPinger, Script, DIRECTORY_HOST, MATCHMAKER_ADDRESS,
    RELAY_ADDRESS,
};

/// Services a synchronous client until it reaches `state`.
fn service_until(client: &mut RealtimeClient<FakeServerPeer>, state: ClientState) {
    for _ in 0..20 {
        client.service().unwrap();
        if client.state() == state {
            return;
        }
    }
    panic!("client stuck in {:?}, expected {state:?}", client.state());
}

fn drain(rx: &mut tokio::sync::mpsc::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ════════════════════════════════════════════════════════════════════
// Connection
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn connect_join_leave_disconnect() {
    let peer = FakeServerPeer::default();
    let client = async_client(&peer);

    assert_eq!(client.connect_using_settings_async(settings()).await.unwrap(), OK);
    {
        let c = client.lock().await;
        assert_eq!(c.state(), ClientState::ConnectedToMatchmaker);
        assert_eq!(c.current_region(), Some("eu"));
        assert_eq!(c.matchmaker_address(), Some(MATCHMAKER_ADDRESS));
        assert_eq!(c.user_id(), Some("server-assigned"));
    }

    let result = client
        .join_or_create_room_async(EnterRoomArgs::new().with_room_name("arena"), true)
        .await
        .unwrap();
    assert_eq!(result, OK);
    {
        let c = client.lock().await;
        assert_eq!(c.state(), ClientState::Joined);
        let room = c.room().unwrap();
        assert_eq!(room.name, "arena");
        assert_eq!(room.local_actor, 1);
        assert_eq!(c.relay_address(), Some(RELAY_ADDRESS));
    }
    let log = peer.log();
    assert_eq!(
        log.ops_to("directory"),
        vec![OperationCode::GetRegions, OperationCode::Authenticate]
    );
    assert_eq!(
        log.ops_to("matchmaker"),
        vec![OperationCode::Authenticate, OperationCode::JoinRoom]
    );
    assert_eq!(
        log.ops_to("relay"),
        vec![OperationCode::Authenticate, OperationCode::JoinRoom]
    );

    client.leave_room_async(false).await.unwrap();
    {
        let c = client.lock().await;
        assert_eq!(c.state(), ClientState::ConnectedToMatchmaker);
        assert!(c.room().is_none());
    }

    client.disconnect_async().await.unwrap();
    assert_eq!(client.state().await, ClientState::Disconnected);
    assert_eq!(
        client.lock().await.disconnect_cause(),
        DisconnectCause::DisconnectByClientLogic
    );
    assert_eq!(client.active_pumps(), 0);
}

#[tokio::test]
async fn similar_pings_pick_alphabetically_first_region() {
    let peer = FakeServerPeer::new(Script {
        regions: vec![
            ("c".into(), "c-host:5055".into()),
            ("b".into(), "b-host:5055".into()),
            ("a".into(), "a-host:5055".into()),
        ],
        ..Script::default()
    });
    let pinger = MockPinger::new(&[("a-host", 50), ("b-host", 55), ("c-host", 120)]);
    let client = AsyncClient::new(RealtimeClient::with_pinger(peer.clone(), Arc::new(pinger)))
        .with_config(AsyncConfig::new().with_service_interval(Duration::from_millis(1)));

    client.connect_using_settings_async(settings()).await.unwrap();

    let c = client.lock().await;
    assert_eq!(c.current_region(), Some("a"));
    assert_eq!(c.best_region_summary(), Some("a;50;a,b,c"));
    let request = peer.log().last_request(OperationCode::Authenticate).cloned().unwrap();
    assert_eq!(request.get(param::REGION), Some(&ParamValue::from("a")));
}

#[tokio::test(start_paused = true)]
async fn reconnect_during_pinging_measures_regions_again() {
    let peer = FakeServerPeer::new(Script {
        regions: vec![
            ("a".into(), "a-host:5055".into()),
            ("b".into(), "b-host:5055".into()),
        ],
        ..Script::default()
    });
    let pinger = MockPinger::new(&[("a-host", 300), ("b-host", 10)]).delayed();
    let mut client = RealtimeClient::with_pinger(peer.clone(), Arc::new(pinger));

    // Region list received, pinging under way.
    assert!(client.connect_using_settings(settings()));
    service_until(&mut client, ClientState::ConnectedToDirectory);
    client.service().unwrap();

    client.disconnect();
    service_until(&mut client, ClientState::Disconnected);
    assert!(client.connect_using_settings(settings()));

    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.service().unwrap();
        if client.state() == ClientState::ConnectedToMatchmaker {
            break;
        }
    }

    assert_eq!(client.state(), ClientState::ConnectedToMatchmaker);
    assert_eq!(client.current_region(), Some("b"));
    let log = peer.log();
    let auth_regions: Vec<Option<&str>> = log
        .sent
        .iter()
        .filter(|(address, request)| {
            address.starts_with(DIRECTORY_HOST) && request.code == OperationCode::Authenticate
        })
        .map(|(_, request)| request.get(param::REGION).and_then(ParamValue::as_str))
        .collect();
    assert_eq!(auth_regions, vec![Some("b")]);
}

#[tokio::test]
async fn fixed_region_skips_region_list() {
    let peer = FakeServerPeer::default();
    let client = async_client(&peer);

    client
        .connect_using_settings_async(settings().with_fixed_region("US"))
        .await
        .unwrap();

    assert_eq!(peer.log().ops_to("directory"), vec![OperationCode::Authenticate]);
    assert_eq!(client.lock().await.current_region(), Some("us"));
}

#[tokio::test]
async fn regions_can_be_measured_without_connecting() {
    let peer = FakeServerPeer::default();
    let client = async_client(&peer);

    let regions = client
        .connect_and_wait_for_regions_async(settings().with_fixed_region("us"))
        .await
        .unwrap();

    let pings: Vec<(&str, u32)> = regions.iter().map(|r| (r.code.as_str(), r.ping)).collect();
    assert_eq!(pings, vec![("eu", 20), ("us", 80)]);
    assert_eq!(client.state().await, ClientState::Disconnected);
    assert!(peer.log().ops_to("matchmaker").is_empty());
}

#[tokio::test]
async fn authenticate_once_sends_token_on_connect() {
    let peer = FakeServerPeer::default();
    let client = async_client(&peer);

    client
        .connect_using_settings_async(
            settings()
                .with_fixed_region("eu")
                .with_auth_mode(AuthMode::AuthOnce),
        )
        .await
        .unwrap();

    let log = peer.log();
    assert_eq!(log.ops_to("directory"), vec![OperationCode::AuthenticateOnce]);
    assert!(log.ops_to("matchmaker").is_empty());
    assert_eq!(log.connect_tokens, vec![None, Some("token-1".to_string())]);
    assert_eq!(client.state().await, ClientState::ConnectedToMatchmaker);
}

#[tokio::test]
async fn rejected_authentication_disconnects() {
    let peer = FakeServerPeer::new(Script {
        auth_code: ErrorCode::InvalidAuthentication.code(),
        ..Script::default()
    });
    let client = async_client(&peer);

    let err = client
        .connect_using_settings_async(settings().with_fixed_region("eu"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RealtimeError::Disconnected(DisconnectCause::InvalidAuthentication)
    ));
    assert_eq!(client.state().await, ClientState::Disconnected);
    assert_eq!(client.active_pumps(), 0);
}

#[tokio::test]
async fn failed_directory_connect_falls_back_to_tcp() {
    let peer = FakeServerPeer::new(Script {
        directory_connect_failures: 1,
        ..Script::default()
    });
    let client = async_client(&peer);

    client
        .connect_using_settings_async(settings().with_fixed_region("eu"))
        .await
        .unwrap();

    assert_eq!(client.lock().await.protocol(), ConnectionProtocol::Tcp);
    let log = peer.log();
    assert_eq!(log.connects.len(), 3);
    assert_eq!(log.protocols.last(), Some(&ConnectionProtocol::Tcp));
}

#[tokio::test]
async fn failed_directory_connect_without_fallback_disconnects() {
    let peer = FakeServerPeer::new(Script {
        directory_connect_failures: 1,
        ..Script::default()
    });
    let client = async_client(&peer);

    let err = client
        .connect_using_settings_async(settings().with_protocol_fallback(false))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RealtimeError::Disconnected(DisconnectCause::ExceptionOnConnect)
    ));
}

#[tokio::test]
async fn connection_loss_in_room_reports_left_room_and_cause() {
    let peer = FakeServerPeer::default();
    let client = async_client(&peer);
    client
        .connect_using_settings_async(settings().with_fixed_region("eu"))
        .await
        .unwrap();
    client
        .create_room_async(EnterRoomArgs::new().with_room_name("arena"), true)
        .await
        .unwrap();
    let (_id, mut events) = client.lock().await.subscriber().channel(64);

    peer.drop_connection(StatusCode::TimeoutDisconnect);
    let cause = client.wait_for_disconnect().await.unwrap();

    assert_eq!(cause, DisconnectCause::ClientTimeout);
    let events = drain(&mut events);
    assert!(events.contains(&ClientEvent::LeftRoom));
    assert_eq!(
        events.last(),
        Some(&ClientEvent::Disconnected {
            cause: DisconnectCause::ClientTimeout
        })
    );
}

// ════════════════════════════════════════════════════════════════════
// Matchmaking
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn missing_room_fails_with_code_and_stops_pump() {
    let missing = ErrorCode::RoomDoesNotExist.code();
    let peer = FakeServerPeer::new(Script {
        matchmaker_entry: [missing, missing].into(),
        ..Script::default()
    });
    let client = async_client(&peer);
    client
        .connect_using_settings_async(settings().with_fixed_region("eu"))
        .await
        .unwrap();

    let err = client
        .join_room_async(EnterRoomArgs::new().with_room_name("nowhere"), true)
        .await
        .unwrap_err();
    assert_eq!(err.return_code(), Some(32758));
    assert_eq!(client.active_pumps(), 0);
    assert_eq!(client.state().await, ClientState::ConnectedToMatchmaker);

    let code = client
        .join_room_async(EnterRoomArgs::new().with_room_name("nowhere"), false)
        .await
        .unwrap();
    assert_eq!(code, 32758);
    assert!(client.lock().await.intent().is_none());
}

#[tokio::test]
async fn relay_create_failure_returns_to_matchmaker_before_reporting() {
    let plugin_error = ErrorCode::PluginReportedError.code();
    let peer = FakeServerPeer::new(Script {
        relay_entry: [plugin_error].into(),
        ..Script::default()
    });
    let client = async_client(&peer);
    client
        .connect_using_settings_async(settings().with_fixed_region("eu"))
        .await
        .unwrap();
    let (_id, mut events) = client.lock().await.subscriber().channel(128);

    let code = client
        .create_room_async(EnterRoomArgs::new().with_room_name("arena"), false)
        .await
        .unwrap();

    assert_eq!(code, plugin_error);
    assert_eq!(client.state().await, ClientState::ConnectedToMatchmaker);
    let events = drain(&mut events);
    let back_on_matchmaker = events
        .iter()
        .position(|e| {
            matches!(
                e,
                ClientEvent::StateChanged {
                    previous: ClientState::Authenticating,
                    current: ClientState::ConnectedToMatchmaker,
                }
            )
        })
        .unwrap();
    let failed = events
        .iter()
        .position(|e| matches!(e, ClientEvent::CreateRoomFailed { .. }))
        .unwrap();
    assert!(back_on_matchmaker < failed);
    assert!(!events.contains(&ClientEvent::ConnectedToMatchmaker));
    assert_eq!(
        peer.log().connects.last().map(String::as_str),
        Some(MATCHMAKER_ADDRESS)
    );
}

#[tokio::test]
async fn join_random_creates_when_nothing_matches() {
    let peer = FakeServerPeer::default();
    let client = async_client(&peer);
    client
        .connect_using_settings_async(settings().with_fixed_region("eu"))
        .await
        .unwrap();
    let (_id, mut events) = client.lock().await.subscriber().channel(128);

    client
        .join_random_or_create_room_async(JoinRandomArgs::new(), EnterRoomArgs::new(), true)
        .await
        .unwrap();

    assert_eq!(client.lock().await.room().unwrap().name, "random-room");
    let events = drain(&mut events);
    // Actor 1 is the first player, so this client created the room.
    let created = events.iter().position(|e| *e == ClientEvent::CreatedRoom).unwrap();
    let joined = events.iter().position(|e| *e == ClientEvent::JoinedRoom).unwrap();
    assert!(created < joined);
}

#[tokio::test]
async fn joined_room_waits_for_local_join_event() {
    let peer = FakeServerPeer::new(Script {
        actor_number: 3,
        send_join_event: false,
        ..Script::default()
    });
    let client = async_client(&peer);
    client
        .connect_using_settings_async(settings().with_fixed_region("eu"))
        .await
        .unwrap();
    let short = AsyncClient::clone(&client).with_config(
        AsyncConfig::new()
            .with_service_interval(Duration::from_millis(1))
            .with_operation_timeout(Duration::from_millis(100)),
    );

    let err = short
        .join_room_async(EnterRoomArgs::new().with_room_name("arena"), true)
        .await
        .unwrap_err();

    assert!(matches!(err, RealtimeError::Timeout));
    assert_eq!(client.state().await, ClientState::Joining);
    assert_eq!(short.active_pumps(), 0);

    peer.push(relay_realtime_client::PeerMessage::Event(
        EventData::new(EventCode::Join).with(param::ACTOR_NR, 3),
    ));
    client.lock().await.service().unwrap();
    assert_eq!(client.state().await, ClientState::Joined);
}

#[tokio::test]
async fn entry_before_connecting_is_refused() {
    let peer = FakeServerPeer::default();
    let client = async_client(&peer);

    let err = client
        .create_room_async(EnterRoomArgs::new(), true)
        .await
        .unwrap_err();

    assert!(matches!(err, RealtimeError::Start(_)));
    assert!(peer.log().sent.is_empty());
}

#[tokio::test]
async fn cancellation_settles_pending_operation() {
    let peer = FakeServerPeer::new(Script {
        send_join_event: false,
        ..Script::default()
    });
    let token = CancellationToken::new();
    let client = async_client(&peer);
    client
        .connect_using_settings_async(settings().with_fixed_region("eu"))
        .await
        .unwrap();
    let cancellable = AsyncClient::clone(&client).with_config(
        AsyncConfig::new()
            .with_service_interval(Duration::from_millis(1))
            .with_cancellation(token.clone()),
    );

    let join = tokio::spawn(async move {
        cancellable
            .join_room_async(EnterRoomArgs::new().with_room_name("arena"), true)
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    let err = join.await.unwrap().unwrap_err();
    assert!(matches!(err, RealtimeError::Cancelled));
    assert_eq!(client.active_pumps(), 0);
}

/// Waits until the relay accepted the entry and only the local join event
/// is missing.
async fn wait_for_relay_entry(client: &AsyncClient<FakeServerPeer>) {
    for _ in 0..500 {
        {
            let c = client.lock().await;
            if c.state() == ClientState::Joining && c.room().is_some() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("relay entry never completed");
}

#[tokio::test]
async fn first_outcome_in_one_batch_settles_the_operation() {
    let joined = EventData::new(EventCode::Join).with(param::ACTOR_NR, 1);

    // Join event ahead of the connection loss: success wins.
    let peer = FakeServerPeer::new(Script {
        send_join_event: false,
        ..Script::default()
    });
    let client = async_client(&peer);
    client
        .connect_using_settings_async(settings().with_fixed_region("eu"))
        .await
        .unwrap();
    let joiner = client.clone();
    let join = tokio::spawn(async move {
        joiner
            .join_room_async(EnterRoomArgs::new().with_room_name("arena"), true)
            .await
    });
    wait_for_relay_entry(&client).await;
    {
        let mut c = client.lock().await;
        peer.push(relay_realtime_client::PeerMessage::Event(joined.clone()));
        peer.drop_connection(StatusCode::TimeoutDisconnect);
        c.service().unwrap();
        assert_eq!(c.state(), ClientState::Disconnected);
    }
    assert_eq!(join.await.unwrap().unwrap(), OK);
    assert_eq!(client.active_pumps(), 0);

    // Connection loss ahead of the join event: the disconnect wins.
    let peer = FakeServerPeer::new(Script {
        send_join_event: false,
        ..Script::default()
    });
    let client = async_client(&peer);
    client
        .connect_using_settings_async(settings().with_fixed_region("eu"))
        .await
        .unwrap();
    let joiner = client.clone();
    let join = tokio::spawn(async move {
        joiner
            .join_room_async(EnterRoomArgs::new().with_room_name("arena"), true)
            .await
    });
    wait_for_relay_entry(&client).await;
    {
        let mut c = client.lock().await;
        peer.drop_connection(StatusCode::TimeoutDisconnect);
        peer.push(relay_realtime_client::PeerMessage::Event(joined));
        c.service().unwrap();
    }
    let err = join.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        RealtimeError::Disconnected(DisconnectCause::ClientTimeout)
    ));
    assert_eq!(client.active_pumps(), 0);
}

#[tokio::test]
async fn service_failure_settles_with_transport_error() {
    let peer = FakeServerPeer::default();
    let client = async_client(&peer);
    peer.fail_next_service();

    let err = client
        .connect_using_settings_async(settings().with_fixed_region("eu"))
        .await
        .unwrap_err();

    assert!(matches!(err, RealtimeError::Transport(_)));
    assert_eq!(client.active_pumps(), 0);
}

// ════════════════════════════════════════════════════════════════════
// Lobby
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn lobby_join_room_list_and_leave() {
    let peer = FakeServerPeer::default();
    let client = async_client(&peer);
    client
        .connect_using_settings_async(settings().with_fixed_region("eu"))
        .await
        .unwrap();

    client.join_lobby_async(None).await.unwrap();
    assert_eq!(client.state().await, ClientState::JoinedLobby);

    let mut room = PropertyMap::new();
    room.insert(PropertyKey::Byte(room_key::MAX_PLAYERS), ParamValue::Byte(4));
    room.insert(PropertyKey::Byte(room_key::PLAYER_COUNT), ParamValue::Byte(2));
    let mut gone = PropertyMap::new();
    gone.insert(PropertyKey::Byte(room_key::REMOVED), true.into());
    let mut list = PropertyMap::new();
    list.insert("duel".into(), room.into());
    list.insert("stale".into(), gone.into());
    peer.push(relay_realtime_client::PeerMessage::Event(
        EventData::new(EventCode::RoomList).with(param::ROOM_LIST, list),
    ));
    {
        let mut c = client.lock().await;
        c.service().unwrap();
        let names: Vec<&str> = c.room_list().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["duel"]);
    }

    client.leave_lobby_async().await.unwrap();
    let c = client.lock().await;
    assert_eq!(c.state(), ClientState::ConnectedToMatchmaker);
    assert_eq!(c.room_list().count(), 0);
}

#[tokio::test]
async fn refused_lobby_reports_server_code() {
    let refused = ErrorCode::OperationNotAllowedInCurrentState.code();
    let peer = FakeServerPeer::new(Script {
        lobby_code: refused,
        ..Script::default()
    });
    let client = async_client(&peer);
    client
        .connect_using_settings_async(settings().with_fixed_region("eu"))
        .await
        .unwrap();
    let (_listener, mut events) = client.lock().await.subscriber().channel(64);

    let err = client.join_lobby_async(None).await.unwrap_err();

    assert_eq!(err.return_code(), Some(refused));
    assert!(matches!(
        err,
        RealtimeError::Operation { message: Some(ref m), .. } if m == "lobby refused"
    ));
    assert_eq!(client.state().await, ClientState::ConnectedToMatchmaker);
    assert!(!client.lock().await.in_lobby());
    assert!(drain(&mut events).contains(&ClientEvent::JoinLobbyFailed {
        return_code: refused,
        message: "lobby refused".into(),
    }));
    assert_eq!(client.active_pumps(), 0);
}

// ════════════════════════════════════════════════════════════════════
// Keep-alive
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn heartbeat_disconnects_after_keep_alive_window() {
    let peer = FakeServerPeer::default();
    let mut client = RealtimeClient::with_pinger(peer.clone(), Arc::new(MockPinger::default()));
    assert!(!client.heartbeat());

    assert!(client.connect_using_settings(settings().with_fixed_region("eu")));
    service_until(&mut client, ClientState::ConnectedToMatchmaker);

    assert!(client.heartbeat());
    assert_eq!(peer.log().acks, 1);

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(!client.heartbeat());
    assert_eq!(client.state(), ClientState::Disconnecting);

    service_until(&mut client, ClientState::Disconnected);
    assert_eq!(client.disconnect_cause(), DisconnectCause::ClientServiceInactivity);
}

#[tokio::test(start_paused = true)]
async fn keep_alive_task_sends_acks_until_stopped() {
    let peer = FakeServerPeer::default();
    let mut client = RealtimeClient::with_pinger(peer.clone(), Arc::new(MockPinger::default()));
    assert!(client.connect_using_settings(settings().with_fixed_region("eu")));
    service_until(&mut client, ClientState::ConnectedToMatchmaker);
    let shared = Arc::new(tokio::sync::Mutex::new(client));

    let keep_alive = KeepAlive::spawn(Arc::clone(&shared), Duration::from_secs(1));
    assert!(keep_alive.is_running());
    tokio::time::sleep(Duration::from_millis(3500)).await;
    keep_alive.stop().await;

    let acks = peer.log().acks;
    assert_eq!(acks, 3);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(peer.log().acks, acks);
}
