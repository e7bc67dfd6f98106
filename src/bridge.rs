//! Awaitable wrappers around the imperative client API.
//!
//! Every wrapper follows the same shape: validate and start the operation on
//! the locked client, register a transient listener that maps events to an
//! outcome, then wait until the first of success, failure, disconnect,
//! deadline or cancellation settles a [`SettleSlot`]. While waiting, a pump
//! task calls [`RealtimeClient::service`] every
//! [`service_interval`](AsyncConfig::service_interval). The listener is
//! released and the pump is joined before the wrapper returns.
//!
//! # Example
//!
//! ```rust,ignore
//! let client = AsyncClient::new(RealtimeClient::new(peer));
//! client.connect_using_settings_async(AppSettings::new("app-id")).await?;
//! client.join_random_room_async(JoinRandomArgs::new(), true).await?;
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::{oneshot, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::callbacks::{ListenerId, Subscriber};
use crate::client::RealtimeClient;
use crate::error::{RealtimeError, Result};
use crate::error_codes::{DisconnectCause, OK};
use crate::event::ClientEvent;
use crate::intent::{EnterRoomArgs, JoinRandomArgs};
use crate::region::Region;
use crate::room::Lobby;
use crate::settings::{AppSettings, AsyncConfig};
use crate::state::ClientState;
use crate::transport::Peer;

// ── Settlement ──────────────────────────────────────────────────────

/// Result slot that accepts exactly one value.
///
/// The first [`settle`](Self::settle) wins; later calls return `false` and
/// are otherwise ignored.
#[derive(Debug, Clone)]
pub struct SettleSlot {
    tx: Arc<StdMutex<Option<oneshot::Sender<Result<i16>>>>>,
    settled: CancellationToken,
}

impl SettleSlot {
    /// Empty slot plus the receiver its value arrives on.
    pub fn new() -> (Self, oneshot::Receiver<Result<i16>>) {
        let (tx, rx) = oneshot::channel();
        let slot = Self {
            tx: Arc::new(StdMutex::new(Some(tx))),
            settled: CancellationToken::new(),
        };
        (slot, rx)
    }

    /// Stores `result` unless the slot is already settled.
    ///
    /// Returns whether this call settled the slot.
    pub fn settle(&self, result: Result<i16>) -> bool {
        let sender = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(sender) = sender else {
            return false;
        };
        let _ = sender.send(result);
        self.settled.cancel();
        true
    }

    /// Whether a value was stored.
    pub fn is_settled(&self) -> bool {
        self.settled.is_cancelled()
    }

    /// Completes once the slot holds a value.
    pub async fn settled(&self) {
        self.settled.cancelled().await;
    }
}

/// What a transient listener observed.
#[derive(Debug)]
pub(crate) enum Outcome {
    Success,
    /// The server rejected the operation with a return code.
    Failure { return_code: i16, message: String },
    Error(RealtimeError),
}

impl Outcome {
    fn into_result(self, throw_on_error: bool) -> Result<i16> {
        match self {
            Self::Success => Ok(OK),
            Self::Failure {
                return_code,
                message,
            } => {
                if throw_on_error {
                    Err(RealtimeError::Operation {
                        return_code,
                        message: (!message.is_empty()).then_some(message),
                    })
                } else {
                    Ok(return_code)
                }
            }
            Self::Error(e) => Err(e),
        }
    }
}

/// An operation that was started and is waiting to settle.
///
/// Dropping it settles the slot as cancelled and releases the listener.
pub struct PendingOperation {
    name: &'static str,
    slot: SettleSlot,
    rx: Option<oneshot::Receiver<Result<i16>>>,
    subscriber: Subscriber,
    listener: ListenerId,
    pump: Option<JoinHandle<()>>,
    cancellation: CancellationToken,
    deadline: Option<Instant>,
}

impl std::fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingOperation")
            .field("name", &self.name)
            .field("settled", &self.slot.is_settled())
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl PendingOperation {
    /// Operation name used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Slot the outcome lands in.
    pub fn slot(&self) -> &SettleSlot {
        &self.slot
    }

    /// Waits for the result, then stops the pump and releases the listener.
    pub async fn wait(mut self) -> Result<i16> {
        let deadline = self.deadline;
        let timer = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            () = self.slot.settled() => {}
            () = timer => {
                if self.slot.settle(Err(RealtimeError::Timeout)) {
                    warn!(op = self.name, "operation timed out");
                }
            }
            () = self.cancellation.cancelled() => {
                if self.slot.settle(Err(RealtimeError::Cancelled)) {
                    debug!(op = self.name, "operation cancelled");
                }
            }
        }

        let result = match self.rx.take() {
            Some(rx) => rx.await.unwrap_or(Err(RealtimeError::Cancelled)),
            None => Err(RealtimeError::Cancelled),
        };
        if let Some(pump) = self.pump.take() {
            if let Err(e) = pump.await {
                warn!(op = self.name, error = %e, "pump task failed");
            }
        }
        self.subscriber.unsubscribe(self.listener);
        debug!(op = self.name, ok = result.is_ok(), "operation settled");
        result
    }
}

impl Drop for PendingOperation {
    fn drop(&mut self) {
        self.slot.settle(Err(RealtimeError::Cancelled));
        self.subscriber.unsubscribe(self.listener);
    }
}

/// Counts a running pump for as long as it lives.
struct PumpGuard(Arc<AtomicUsize>);

impl PumpGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PumpGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// ── Event matchers ──────────────────────────────────────────────────

fn disconnected(event: &ClientEvent) -> Option<Outcome> {
    match event {
        ClientEvent::Disconnected { cause } => {
            Some(Outcome::Error(RealtimeError::Disconnected(*cause)))
        }
        _ => None,
    }
}

fn reached_matchmaker(event: &ClientEvent) -> Option<Outcome> {
    match event {
        ClientEvent::ConnectedToMatchmaker => Some(Outcome::Success),
        ClientEvent::CustomAuthenticationFailed { message } => Some(Outcome::Error(
            RealtimeError::AuthenticationFailed(message.clone()),
        )),
        other => disconnected(other),
    }
}

fn entered_room(event: &ClientEvent) -> Option<Outcome> {
    match event {
        ClientEvent::JoinedRoom => Some(Outcome::Success),
        ClientEvent::CreateRoomFailed {
            return_code,
            message,
        }
        | ClientEvent::JoinRoomFailed {
            return_code,
            message,
        }
        | ClientEvent::JoinRandomFailed {
            return_code,
            message,
        } => Some(Outcome::Failure {
            return_code: *return_code,
            message: message.clone(),
        }),
        other => disconnected(other),
    }
}

// ── AsyncClient ─────────────────────────────────────────────────────

/// A [`RealtimeClient`] shared behind an async mutex, with awaitable
/// operations.
pub struct AsyncClient<P: Peer> {
    client: Arc<Mutex<RealtimeClient<P>>>,
    config: AsyncConfig,
    active_pumps: Arc<AtomicUsize>,
}

impl<P: Peer> Clone for AsyncClient<P> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            config: self.config.clone(),
            active_pumps: Arc::clone(&self.active_pumps),
        }
    }
}

impl<P: Peer> std::fmt::Debug for AsyncClient<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncClient")
            .field("config", &self.config)
            .field("active_pumps", &self.active_pumps())
            .finish_non_exhaustive()
    }
}

impl<P: Peer> AsyncClient<P> {
    /// Wraps `client` with the default [`AsyncConfig`].
    pub fn new(client: RealtimeClient<P>) -> Self {
        Self {
            client: Arc::new(Mutex::new(client)),
            config: AsyncConfig::default(),
            active_pumps: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Replaces the deadline and service interval settings.
    #[must_use]
    pub fn with_config(mut self, config: AsyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Deadline and service interval settings.
    pub fn config(&self) -> &AsyncConfig {
        &self.config
    }

    /// The shared client, e.g. for a [`KeepAlive`](crate::heartbeat::KeepAlive).
    pub fn shared(&self) -> Arc<Mutex<RealtimeClient<P>>> {
        Arc::clone(&self.client)
    }

    /// Locks the client for direct synchronous calls.
    ///
    /// Pumps wait on this lock, so keep guards short.
    pub async fn lock(&self) -> MutexGuard<'_, RealtimeClient<P>> {
        self.client.lock().await
    }

    /// Current state of the wrapped client.
    pub async fn state(&self) -> ClientState {
        self.client.lock().await.state()
    }

    /// Number of pump tasks currently running.
    pub fn active_pumps(&self) -> usize {
        self.active_pumps.load(Ordering::SeqCst)
    }

    /// Starts an operation and arms its listener and pump.
    ///
    /// `start` runs on the locked client and returns whether the operation
    /// was accepted. `matcher` maps events to an outcome; the first outcome
    /// settles the operation.
    pub(crate) async fn start<S, M>(
        &self,
        name: &'static str,
        throw_on_error: bool,
        timeout: Option<Duration>,
        start: S,
        mut matcher: M,
    ) -> Result<PendingOperation>
    where
        S: FnOnce(&mut RealtimeClient<P>) -> bool,
        M: FnMut(&ClientEvent) -> Option<Outcome> + Send + 'static,
    {
        if self.config.cancellation.is_cancelled() {
            return Err(RealtimeError::Cancelled);
        }
        let (slot, rx) = SettleSlot::new();
        let mut client = self.client.lock().await;
        let subscriber = client.subscriber();
        let listener = {
            let slot = slot.clone();
            subscriber.subscribe_all(move |event| {
                if slot.is_settled() {
                    return;
                }
                if let Some(outcome) = matcher(event) {
                    slot.settle(outcome.into_result(throw_on_error));
                }
            })
        };

        if !start(&mut *client) {
            subscriber.unsubscribe(listener);
            warn!(op = name, state = ?client.state(), "operation could not be started");
            return Err(RealtimeError::Start(format!(
                "{name} could not be started in state {:?}",
                client.state()
            )));
        }
        drop(client);
        debug!(op = name, "operation started");

        let pump = self
            .config
            .create_pump
            .then(|| self.spawn_pump(name, slot.clone()));
        Ok(PendingOperation {
            name,
            slot,
            rx: Some(rx),
            subscriber,
            listener,
            pump,
            cancellation: self.config.cancellation.clone(),
            deadline: timeout.map(|t| Instant::now() + t),
        })
    }

    fn spawn_pump(&self, name: &'static str, slot: SettleSlot) -> JoinHandle<()> {
        let client = Arc::clone(&self.client);
        let interval = self.config.service_interval;
        let cancellation = self.config.cancellation.clone();
        let guard = PumpGuard::new(Arc::clone(&self.active_pumps));
        tokio::spawn(async move {
            let _guard = guard;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = slot.settled() => break,
                    () = cancellation.cancelled() => {
                        slot.settle(Err(RealtimeError::Cancelled));
                        break;
                    }
                    _ = ticker.tick() => {
                        let serviced = client.lock().await.service();
                        if let Err(e) = serviced {
                            warn!(op = name, error = %e, "service failed while pumping");
                            slot.settle(Err(e));
                            break;
                        }
                    }
                }
            }
            if slot.settle(Err(RealtimeError::Cancelled)) {
                debug!(op = name, "pump stopped before the operation settled");
            }
        })
    }

    async fn run<S, M>(&self, name: &'static str, throw_on_error: bool, start: S, matcher: M) -> Result<i16>
    where
        S: FnOnce(&mut RealtimeClient<P>) -> bool,
        M: FnMut(&ClientEvent) -> Option<Outcome> + Send + 'static,
    {
        let timeout = Some(self.config.operation_timeout);
        self.start(name, throw_on_error, timeout, start, matcher)
            .await?
            .wait()
            .await
    }

    // ── Connection ──────────────────────────────────────────────────

    /// Connects and completes once the matchmaker is ready.
    pub async fn connect_using_settings_async(&self, settings: AppSettings) -> Result<i16> {
        self.run(
            "connect",
            true,
            move |c| c.connect_using_settings(settings),
            reached_matchmaker,
        )
        .await
    }

    /// Reconnects to the last matchmaker and completes once it is ready.
    pub async fn reconnect_to_matchmaker_async(&self) -> Result<i16> {
        self.run(
            "reconnect",
            true,
            RealtimeClient::reconnect_to_matchmaker,
            reached_matchmaker,
        )
        .await
    }

    /// Reconnects to the last relay and rejoins the last room.
    pub async fn reconnect_and_rejoin_async(&self, throw_on_error: bool) -> Result<i16> {
        self.run(
            "reconnect and rejoin",
            throw_on_error,
            RealtimeClient::reconnect_and_rejoin,
            entered_room,
        )
        .await
    }

    /// Disconnects; completes immediately when already disconnected.
    pub async fn disconnect_async(&self) -> Result<i16> {
        if matches!(
            self.state().await,
            ClientState::Disconnected | ClientState::PeerCreated
        ) {
            return Ok(OK);
        }
        self.run(
            "disconnect",
            true,
            |c| {
                c.disconnect();
                true
            },
            |event| match event {
                ClientEvent::Disconnected { .. } => Some(Outcome::Success),
                _ => None,
            },
        )
        .await
    }

    /// Waits without a deadline until the client disconnects.
    pub async fn wait_for_disconnect(&self) -> Result<DisconnectCause> {
        {
            let client = self.client.lock().await;
            if matches!(
                client.state(),
                ClientState::Disconnected | ClientState::PeerCreated
            ) {
                return Ok(client.disconnect_cause());
            }
        }
        self.start(
            "wait for disconnect",
            true,
            None,
            |_| true,
            |event| match event {
                ClientEvent::Disconnected { .. } => Some(Outcome::Success),
                _ => None,
            },
        )
        .await?
        .wait()
        .await?;
        Ok(self.client.lock().await.disconnect_cause())
    }

    /// Connects to the directory, waits until every region was pinged,
    /// then disconnects and returns the measured regions.
    pub async fn connect_and_wait_for_regions_async(
        &self,
        settings: AppSettings,
    ) -> Result<Vec<Region>> {
        let mut settings = settings;
        settings.fixed_region = None;
        let mut seen_list = false;
        self.run(
            "wait for regions",
            true,
            move |c| match c.state() {
                ClientState::ConnectingToDirectory | ClientState::ConnectedToDirectory => true,
                ClientState::Disconnected | ClientState::PeerCreated => {
                    c.connect_using_settings(settings)
                }
                _ => false,
            },
            move |event| match event {
                ClientEvent::RegionListReceived { .. } => {
                    seen_list = true;
                    None
                }
                ClientEvent::StateChanged {
                    current: ClientState::Authenticating,
                    ..
                } if seen_list => Some(Outcome::Success),
                other => disconnected(other),
            },
        )
        .await?;
        let regions = self.client.lock().await.regions().to_vec();
        self.disconnect_async().await?;
        Ok(regions)
    }

    // ── Matchmaking ─────────────────────────────────────────────────

    /// Creates a room. With `throw_on_error == false` a server rejection
    /// returns its code instead of an error.
    pub async fn create_room_async(
        &self,
        args: EnterRoomArgs,
        throw_on_error: bool,
    ) -> Result<i16> {
        self.run(
            "create room",
            throw_on_error,
            move |c| c.op_create_room(args),
            entered_room,
        )
        .await
    }

    /// Joins a room by name. See [`create_room_async`](Self::create_room_async)
    /// for `throw_on_error`.
    pub async fn join_room_async(&self, args: EnterRoomArgs, throw_on_error: bool) -> Result<i16> {
        self.run(
            "join room",
            throw_on_error,
            move |c| c.op_join_room(args),
            entered_room,
        )
        .await
    }

    /// Joins the named room or creates it.
    pub async fn join_or_create_room_async(
        &self,
        args: EnterRoomArgs,
        throw_on_error: bool,
    ) -> Result<i16> {
        self.run(
            "join or create room",
            throw_on_error,
            move |c| c.op_join_or_create_room(args),
            entered_room,
        )
        .await
    }

    /// Joins a random room matching `filter`.
    pub async fn join_random_room_async(
        &self,
        filter: JoinRandomArgs,
        throw_on_error: bool,
    ) -> Result<i16> {
        self.run(
            "join random room",
            throw_on_error,
            move |c| c.op_join_random_room(filter),
            entered_room,
        )
        .await
    }

    /// Joins a random room or creates one from `create`.
    pub async fn join_random_or_create_room_async(
        &self,
        filter: JoinRandomArgs,
        create: EnterRoomArgs,
        throw_on_error: bool,
    ) -> Result<i16> {
        self.run(
            "join random or create room",
            throw_on_error,
            move |c| c.op_join_random_or_create_room(filter, create),
            entered_room,
        )
        .await
    }

    /// Returns to `room_name` as the same actor.
    pub async fn rejoin_room_async(&self, room_name: &str, throw_on_error: bool) -> Result<i16> {
        let room_name = room_name.to_string();
        self.run(
            "rejoin room",
            throw_on_error,
            move |c| c.op_rejoin_room(&room_name),
            entered_room,
        )
        .await
    }

    /// Leaves the room; completes back on the matchmaker.
    pub async fn leave_room_async(&self, become_inactive: bool) -> Result<i16> {
        self.run(
            "leave room",
            true,
            move |c| c.op_leave_room(become_inactive),
            reached_matchmaker,
        )
        .await
    }

    /// Joins `lobby`, or the default lobby, and completes on `JoinedLobby`.
    ///
    /// # Errors
    ///
    /// A refusal carries the matchmaker's return code.
    pub async fn join_lobby_async(&self, lobby: Option<Lobby>) -> Result<i16> {
        self.run(
            "join lobby",
            true,
            move |c| c.op_join_lobby(lobby),
            |event| match event {
                ClientEvent::JoinedLobby => Some(Outcome::Success),
                ClientEvent::JoinLobbyFailed {
                    return_code,
                    message,
                } => Some(Outcome::Failure {
                    return_code: *return_code,
                    message: message.clone(),
                }),
                other => disconnected(other),
            },
        )
        .await
    }

    /// Leaves the current lobby.
    pub async fn leave_lobby_async(&self) -> Result<i16> {
        self.run(
            "leave lobby",
            true,
            RealtimeClient::op_leave_lobby,
            |event| match event {
                ClientEvent::LeftLobby => Some(Outcome::Success),
                other => disconnected(other),
            },
        )
        .await
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

    #[tokio::test]
    async fn first_settle_wins() {
        let (slot, rx) = SettleSlot::new();
        assert!(!slot.is_settled());
        assert!(slot.settle(Ok(OK)));
        assert!(!slot.settle(Err(RealtimeError::Timeout)));
        assert!(slot.is_settled());
        assert_eq!(rx.await.unwrap().unwrap(), OK);
    }

    #[tokio::test]
    async fn concurrent_settles_deliver_one_value() {
        let (slot, rx) = SettleSlot::new();
        let handles = (0..16i16).map(|code| {
            let slot = slot.clone();
            tokio::spawn(async move { slot.settle(Ok(code)) })
        });
        let winners = futures_util::future::join_all(handles)
            .await
            .into_iter()
            .filter(|won| *won.as_ref().unwrap())
            .count();
        assert_eq!(winners, 1);
        assert!(rx.await.unwrap().is_ok());
    }

    #[test]
    fn settled_wakes_waiter() {
        let (slot, _rx) = SettleSlot::new();
        let mut waiter = tokio_test::task::spawn(slot.settled());
        tokio_test::assert_pending!(waiter.poll());

        slot.settle(Err(RealtimeError::Cancelled));

        assert!(waiter.is_woken());
        tokio_test::assert_ready!(waiter.poll());
    }

    #[test]
    fn failure_outcome_respects_throw_flag() {
        let failure = || Outcome::Failure {
            return_code: 32758,
            message: "gone".into(),
        };
        assert_eq!(failure().into_result(false).unwrap(), 32758);
        let err = failure().into_result(true).unwrap_err();
        assert_eq!(err.return_code(), Some(32758));
        assert!(matches!(
            err,
            RealtimeError::Operation { message: Some(ref m), .. } if m == "gone"
        ));

        let silent = Outcome::Failure {
            return_code: 32765,
            message: String::new(),
        };
        assert!(matches!(
            silent.into_result(true),
            Err(RealtimeError::Operation { return_code: 32765, message: None })
        ));
    }

    #[test]
    fn room_entry_matcher() {
        assert!(matches!(entered_room(&ClientEvent::JoinedRoom), Some(Outcome::Success)));
        assert!(matches!(
            entered_room(&ClientEvent::JoinRandomFailed {
                return_code: 32760,
                message: String::new()
            }),
            Some(Outcome::Failure { return_code: 32760, .. })
        ));
        assert!(entered_room(&ClientEvent::CreatedRoom).is_none());
        assert!(matches!(
            entered_room(&ClientEvent::Disconnected {
                cause: DisconnectCause::ServerTimeout
            }),
            Some(Outcome::Error(RealtimeError::Disconnected(DisconnectCause::ServerTimeout)))
        ));
    }
}
