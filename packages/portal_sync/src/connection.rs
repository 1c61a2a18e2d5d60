//! ConnectionManager: one push channel with automatic recovery.
//!
//! The policy lives in [`ConnectionFsm`], a plain state machine with no I/O or
//! timers. [`ConnectionManager`] drives it from a single background task that
//! opens the channel, pumps inbound frames into the [`Dispatcher`], and sleeps
//! out the backoff between attempts.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use reqwest::Url;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConnectionFileConfig;
use crate::dispatch::{Dispatcher, Subscription};
use crate::error::Result;
use crate::models::Message;
use crate::transport::{Channel, ChannelEvent, Connector, WsConnector, push_endpoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Status events published to status subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    /// The channel closed cleanly, or `disconnect()` was called.
    Disconnected,
    /// The channel failed to open or broke with an error.
    Error { reason: String },
    /// Retries are exhausted. Only an explicit `connect()` starts over.
    Failed { attempts: u32 },
}

/// Exponential backoff: `min(base * 2^attempt, max_delay)`, at most `max_retries` retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl ReconnectPolicy {
    pub fn from_file(fc: &ConnectionFileConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(fc.base_delay_ms),
            max_delay: Duration::from_millis(fc.max_delay_ms),
            max_retries: fc.max_retries,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_file(&ConnectionFileConfig::default())
    }
}

/// Why the channel stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Closed,
    Error(String),
}

impl CloseReason {
    fn status(&self) -> ConnectionStatus {
        match self {
            CloseReason::Closed => ConnectionStatus::Disconnected,
            CloseReason::Error(reason) => ConnectionStatus::Error {
                reason: reason.clone(),
            },
        }
    }
}

/// What the driver must do after a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Sleep for `delay`, then call `on_retry_elapsed`. `attempt` is the retry number (1-based).
    Retry { delay: Duration, attempt: u32 },
    /// Retries exhausted; the machine is now `Failed`.
    GiveUp { attempts: u32 },
}

/// Connection state machine.
///
/// ```text
/// Disconnected --connect--> Connecting --open--> Connected
/// Connecting|Connected --close--> Reconnecting --elapsed--> Connecting
///                                 (or Failed once retries are exhausted)
/// any --disconnect--> Disconnected
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionFsm {
    state: ConnectionState,
    attempt: u32,
    policy: ReconnectPolicy,
}

impl ConnectionFsm {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempt: 0,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Returns true if this call started a new connection cycle.
    /// A pending retry timer counts as an active cycle.
    pub fn connect(&mut self) -> bool {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Failed => {
                self.state = ConnectionState::Connecting;
                self.attempt = 0;
                true
            }
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Reconnecting => false,
        }
    }

    /// The channel opened. Ignored unless an open was pending.
    pub fn on_open(&mut self) -> bool {
        if self.state != ConnectionState::Connecting {
            return false;
        }
        self.state = ConnectionState::Connected;
        self.attempt = 0;
        true
    }

    /// The channel closed or failed to open. Returns `None` when no channel
    /// was live, e.g. after `disconnect()`.
    pub fn on_close(&mut self) -> Option<Transition> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {}
            _ => return None,
        }
        if self.attempt >= self.policy.max_retries {
            self.state = ConnectionState::Failed;
            return Some(Transition::GiveUp {
                attempts: self.attempt,
            });
        }
        let delay = self.policy.delay_for(self.attempt);
        self.attempt += 1;
        self.state = ConnectionState::Reconnecting;
        Some(Transition::Retry {
            delay,
            attempt: self.attempt,
        })
    }

    /// The backoff timer fired.
    pub fn on_retry_elapsed(&mut self) -> bool {
        if self.state != ConnectionState::Reconnecting {
            return false;
        }
        self.state = ConnectionState::Connecting;
        true
    }

    /// Force `Disconnected`. Returns true if the state changed.
    pub fn disconnect(&mut self) -> bool {
        let changed = self.state != ConnectionState::Disconnected;
        self.state = ConnectionState::Disconnected;
        self.attempt = 0;
        changed
    }
}

struct Shared {
    fsm: ConnectionFsm,
    outbound: Option<mpsc::Sender<String>>,
    cancel: Option<CancellationToken>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns the process-wide push channel.
///
/// Construct one at the composition root and share it by reference; every
/// open conversation and the notification bell use the same instance.
/// `connect` must be called from within a tokio runtime.
pub struct ConnectionManager<C: Connector> {
    connector: Arc<C>,
    endpoint: Url,
    dispatcher: Dispatcher,
    shared: Arc<Mutex<Shared>>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(
        connector: C,
        endpoint: Url,
        policy: ReconnectPolicy,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            connector: Arc::new(connector),
            endpoint,
            dispatcher,
            shared: Arc::new(Mutex::new(Shared {
                fsm: ConnectionFsm::new(policy),
                outbound: None,
                cancel: None,
            })),
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.shared).fsm.state()
    }

    pub fn attempt(&self) -> u32 {
        lock(&self.shared).fsm.attempt()
    }

    /// Start connecting. No-op while a cycle is already running.
    /// From `Failed` this starts over with a fresh retry budget.
    pub fn connect(&self) {
        let cancel = {
            let mut shared = lock(&self.shared);
            if !shared.fsm.connect() {
                debug!(state = ?shared.fsm.state(), "connect ignored, cycle already active");
                return;
            }
            let cancel = CancellationToken::new();
            shared.cancel = Some(cancel.clone());
            cancel
        };

        info!(endpoint = %self.endpoint, "connecting push channel");
        tokio::spawn(drive(
            self.connector.clone(),
            self.endpoint.clone(),
            self.shared.clone(),
            self.dispatcher.clone(),
            cancel,
        ));
    }

    /// Hand a frame to the open channel. Returns false if there is no open
    /// channel or its queue is full; the caller falls back to the pull path.
    pub fn send<T: Serialize>(&self, payload: &T) -> bool {
        let frame = match serde_json::to_string(payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to encode outbound frame");
                return false;
            }
        };

        let shared = lock(&self.shared);
        if shared.fsm.state() != ConnectionState::Connected {
            return false;
        }
        let Some(outbound) = shared.outbound.as_ref() else {
            return false;
        };
        match outbound.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("push channel outbound queue full, frame not sent");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn on_message<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.dispatcher.on_message(callback)
    }

    pub fn on_status_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        self.dispatcher.on_status(callback)
    }

    /// Close the channel and cancel any pending retry. Safe to call repeatedly.
    pub fn disconnect(&self) {
        let changed = {
            let mut shared = lock(&self.shared);
            if let Some(cancel) = shared.cancel.take() {
                cancel.cancel();
            }
            shared.outbound = None;
            shared.fsm.disconnect()
        };
        if changed {
            info!("push channel disconnected");
            self.dispatcher.dispatch_status(&ConnectionStatus::Disconnected);
        }
    }
}

impl ConnectionManager<WsConnector> {
    /// WebSocket-backed manager for the endpoint and policy in `[connection]`.
    pub fn from_config(fc: &ConnectionFileConfig, dispatcher: Dispatcher) -> Result<Self> {
        let endpoint = push_endpoint(&fc.base_url, &fc.push_path)?;
        Ok(Self::new(
            WsConnector::new(fc.outbound_buffer),
            endpoint,
            ReconnectPolicy::from_file(fc),
            dispatcher,
        ))
    }
}

impl<C: Connector> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        if let Some(cancel) = lock(&self.shared).cancel.take() {
            cancel.cancel();
        }
    }
}

/// One connection cycle: open, pump, back off, repeat until connected for
/// good, cancelled, or out of retries.
async fn drive<C: Connector>(
    connector: Arc<C>,
    endpoint: Url,
    shared: Arc<Mutex<Shared>>,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
) {
    loop {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            opened = connector.open(&endpoint) => opened,
        };

        let reason = match opened {
            Ok(Channel { outbound, mut inbound }) => {
                {
                    let mut shared = lock(&shared);
                    if cancel.is_cancelled() {
                        return;
                    }
                    shared.fsm.on_open();
                    shared.outbound = Some(outbound);
                }
                info!(endpoint = %endpoint, "push channel connected");
                if !publish(&dispatcher, &cancel, &ConnectionStatus::Connected) {
                    return;
                }

                match pump(&mut inbound, &dispatcher, &cancel).await {
                    Some(reason) => reason,
                    None => return,
                }
            }
            Err(e) => CloseReason::Error(e.to_string()),
        };

        let transition = {
            let mut shared = lock(&shared);
            if cancel.is_cancelled() {
                return;
            }
            shared.outbound = None;
            shared.fsm.on_close()
        };
        match &reason {
            CloseReason::Closed => info!("push channel closed"),
            CloseReason::Error(error) => warn!(error = %error, "push channel error"),
        }
        if !publish(&dispatcher, &cancel, &reason.status()) {
            return;
        }

        match transition {
            Some(Transition::Retry { delay, attempt }) => {
                info!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling reconnect"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                let mut shared = lock(&shared);
                if cancel.is_cancelled() || !shared.fsm.on_retry_elapsed() {
                    return;
                }
            }
            Some(Transition::GiveUp { attempts }) => {
                warn!(attempts, "reconnect attempts exhausted, giving up");
                publish(&dispatcher, &cancel, &ConnectionStatus::Failed { attempts });
                return;
            }
            None => return,
        }
    }
}

/// Emit a driver status unless `disconnect()` already ended this cycle.
/// `disconnect()` has published its own `Disconnected` by then.
fn publish(
    dispatcher: &Dispatcher,
    cancel: &CancellationToken,
    status: &ConnectionStatus,
) -> bool {
    if cancel.is_cancelled() {
        debug!(?status, "status suppressed after disconnect");
        return false;
    }
    dispatcher.dispatch_status(status);
    true
}

/// Forward inbound frames until the channel ends. `None` means cancelled.
async fn pump(
    inbound: &mut mpsc::Receiver<ChannelEvent>,
    dispatcher: &Dispatcher,
    cancel: &CancellationToken,
) -> Option<CloseReason> {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return None,
            event = inbound.recv() => event,
        };
        match event {
            Some(ChannelEvent::Frame(text)) => handle_frame(&text, dispatcher),
            Some(ChannelEvent::Closed) | None => return Some(CloseReason::Closed),
            Some(ChannelEvent::Error(error)) => return Some(CloseReason::Error(error)),
        }
    }
}

fn handle_frame(text: &str, dispatcher: &Dispatcher) {
    match Message::from_frame(text) {
        Ok(msg) => {
            let delivered = dispatcher.dispatch_message(&msg);
            debug!(id = ?msg.id, delivered, "dispatched push message");
        }
        Err(e) => {
            warn!(error = %e, len = text.len(), "dropping malformed push frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{
        ScriptedConnector, Step, channel_pair, message_json, scripted_manager,
    };

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy::default()
    }

    // --- ConnectionFsm ---

    #[test]
    fn backoff_schedule_then_failed() {
        let mut fsm = ConnectionFsm::new(policy());
        assert!(fsm.connect());

        let mut delays = Vec::new();
        loop {
            match fsm.on_close() {
                Some(Transition::Retry { delay, .. }) => {
                    delays.push(delay.as_millis() as u64);
                    assert_eq!(fsm.state(), ConnectionState::Reconnecting);
                    assert!(fsm.on_retry_elapsed());
                    assert_eq!(fsm.state(), ConnectionState::Connecting);
                }
                Some(Transition::GiveUp { attempts }) => {
                    assert_eq!(attempts, 5);
                    break;
                }
                None => panic!("close while connecting must transition"),
            }
        }
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
        assert_eq!(fsm.state(), ConnectionState::Failed);
        assert_eq!(fsm.on_close(), None);
        assert!(!fsm.on_retry_elapsed());
    }

    #[test]
    fn delay_is_capped() {
        let policy = ReconnectPolicy {
            max_retries: 20,
            ..policy()
        };
        assert_eq!(policy.delay_for(4), Duration::from_secs(16));
        assert_eq!(policy.delay_for(5), Duration::from_secs(30));
        assert_eq!(policy.delay_for(40), Duration::from_secs(30));
    }

    #[test]
    fn recovery_on_last_attempt_resets_counter() {
        let mut fsm = ConnectionFsm::new(policy());
        fsm.connect();
        fsm.on_open();
        fsm.attempt = 4;

        assert_eq!(fsm.state(), ConnectionState::Connected);
        assert_eq!(
            fsm.on_close(),
            Some(Transition::Retry {
                delay: Duration::from_secs(16),
                attempt: 5
            })
        );
        assert_eq!(fsm.state(), ConnectionState::Reconnecting);
        assert!(fsm.on_retry_elapsed());
        assert_eq!(fsm.state(), ConnectionState::Connecting);
        assert!(fsm.on_open());
        assert_eq!(fsm.state(), ConnectionState::Connected);
        assert_eq!(fsm.attempt(), 0);
    }

    #[test]
    fn connect_is_idempotent_while_active() {
        let mut fsm = ConnectionFsm::new(policy());
        assert!(fsm.connect());
        assert!(!fsm.connect());
        fsm.on_open();
        assert!(!fsm.connect());
        fsm.on_close();
        assert_eq!(fsm.state(), ConnectionState::Reconnecting);
        assert!(!fsm.connect());
    }

    #[test]
    fn disconnect_forces_disconnected_from_any_state() {
        let mut fsm = ConnectionFsm::new(policy());
        assert!(!fsm.disconnect());
        fsm.connect();
        fsm.on_close();
        assert!(fsm.disconnect());
        assert_eq!(fsm.state(), ConnectionState::Disconnected);
        assert_eq!(fsm.attempt(), 0);
        // A stale timer firing after disconnect does nothing
        assert!(!fsm.on_retry_elapsed());
        assert!(!fsm.on_open());
    }

    #[test]
    fn connect_after_failed_starts_fresh() {
        let mut fsm = ConnectionFsm::new(ReconnectPolicy {
            max_retries: 0,
            ..policy()
        });
        fsm.connect();
        assert_eq!(fsm.on_close(), Some(Transition::GiveUp { attempts: 0 }));
        assert!(fsm.connect());
        assert_eq!(fsm.state(), ConnectionState::Connecting);
    }

    #[test]
    fn policy_comes_from_connection_config() {
        let fc = ConnectionFileConfig {
            max_retries: 3,
            base_delay_ms: 250,
            max_delay_ms: 2_000,
            ..Default::default()
        };
        let fsm = ConnectionFsm::new(ReconnectPolicy::from_file(&fc));
        assert_eq!(fsm.policy().max_retries, 3);
        assert_eq!(fsm.policy().delay_for(0), Duration::from_millis(250));
        assert_eq!(fsm.policy().delay_for(4), Duration::from_secs(2));
    }

    #[test]
    fn from_config_derives_secure_endpoint() {
        let fc = ConnectionFileConfig {
            base_url: "https://portal.example.com".into(),
            ..Default::default()
        };
        let manager = ConnectionManager::from_config(&fc, Dispatcher::new()).unwrap();
        assert_eq!(manager.endpoint().as_str(), "wss://portal.example.com/ws");
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn no_status_is_published_once_cancelled() {
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = dispatcher.on_status(move |status| sink.lock().unwrap().push(status.clone()));

        let cancel = CancellationToken::new();
        assert!(publish(&dispatcher, &cancel, &ConnectionStatus::Connected));
        cancel.cancel();
        let stale = ConnectionStatus::Error {
            reason: "reset".into(),
        };
        assert!(!publish(&dispatcher, &cancel, &stale));
        assert!(!publish(&dispatcher, &cancel, &ConnectionStatus::Failed { attempts: 5 }));
        assert_eq!(*seen.lock().unwrap(), vec![ConnectionStatus::Connected]);
    }

    // --- ConnectionManager over a scripted connector ---

    fn manager(connector: ScriptedConnector) -> ConnectionManager<ScriptedConnector> {
        scripted_manager(connector, Dispatcher::new())
    }

    fn record_statuses(
        manager: &ConnectionManager<ScriptedConnector>,
    ) -> (Subscription, mpsc::UnboundedReceiver<ConnectionStatus>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = manager.on_status_change(move |status| {
            let _ = tx.send(status.clone());
        });
        (sub, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_retries_with_exponential_delays() {
        let connector = ScriptedConnector::with(Vec::new());
        let opens = connector.opens.clone();
        let manager = manager(connector);
        let (_sub, mut statuses) = record_statuses(&manager);

        manager.connect();
        loop {
            match statuses.recv().await.unwrap() {
                ConnectionStatus::Failed { attempts } => {
                    assert_eq!(attempts, 5);
                    break;
                }
                ConnectionStatus::Error { .. } => {}
                other => panic!("unexpected status {:?}", other),
            }
        }
        assert_eq!(manager.state(), ConnectionState::Failed);

        // No sixth retry is ever scheduled
        tokio::time::sleep(Duration::from_secs(300)).await;
        let opens = opens.lock().unwrap().clone();
        assert_eq!(opens.len(), 6);
        let gaps: Vec<u64> = opens
            .windows(2)
            .map(|w| (w[1] - w[0]).as_millis() as u64)
            .collect();
        assert_eq!(gaps, vec![1000, 2000, 4000, 8000, 16000]);
    }

    #[tokio::test(start_paused = true)]
    async fn frames_are_dispatched_and_malformed_ones_dropped() {
        let (channel, remote) = channel_pair();
        let manager = manager(ScriptedConnector::with(vec![Step::Open(channel)]));
        let (_status_sub, mut statuses) = record_statuses(&manager);

        let (msg_tx, mut messages) = mpsc::unbounded_channel();
        let _msg_sub = manager.on_message(move |msg| {
            let _ = msg_tx.send(msg.id);
        });

        manager.connect();
        assert_eq!(statuses.recv().await, Some(ConnectionStatus::Connected));

        remote.tx.send(ChannelEvent::Frame(message_json(1))).await.unwrap();
        remote.tx.send(ChannelEvent::Frame("{not json".into())).await.unwrap();
        remote.tx.send(ChannelEvent::Frame(r#"{"id": 3}"#.into())).await.unwrap();
        remote.tx.send(ChannelEvent::Frame(message_json(2))).await.unwrap();

        assert_eq!(messages.recv().await, Some(Some(1)));
        assert_eq!(messages.recv().await, Some(Some(2)));
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(statuses.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn send_only_succeeds_on_open_channel() {
        let (channel, mut remote) = channel_pair();
        let manager = manager(ScriptedConnector::with(vec![Step::Open(channel)]));
        let (_sub, mut statuses) = record_statuses(&manager);

        assert!(!manager.send(&serde_json::json!({"content": "early"})));

        manager.connect();
        assert_eq!(statuses.recv().await, Some(ConnectionStatus::Connected));
        assert!(manager.send(&serde_json::json!({"content": "hi"})));
        assert_eq!(remote.rx.recv().await.unwrap(), r#"{"content":"hi"}"#);

        manager.disconnect();
        assert_eq!(statuses.recv().await, Some(ConnectionStatus::Disconnected));
        assert!(!manager.send(&serde_json::json!({"content": "late"})));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_close_and_resets_attempts() {
        let (first, first_remote) = channel_pair();
        let (second, _second_remote) = channel_pair();
        let connector = ScriptedConnector::with(vec![Step::Open(first), Step::Open(second)]);
        let opens = connector.opens.clone();
        let manager = manager(connector);
        let (_sub, mut statuses) = record_statuses(&manager);

        manager.connect();
        assert_eq!(statuses.recv().await, Some(ConnectionStatus::Connected));

        first_remote.tx.send(ChannelEvent::Closed).await.unwrap();
        assert_eq!(statuses.recv().await, Some(ConnectionStatus::Disconnected));
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
        assert_eq!(manager.attempt(), 1);

        assert_eq!(statuses.recv().await, Some(ConnectionStatus::Connected));
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.attempt(), 0);

        let opens = opens.lock().unwrap().clone();
        assert_eq!(opens[1] - opens[0], Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn channel_error_surfaces_as_status_only() {
        let (channel, remote) = channel_pair();
        let manager = manager(ScriptedConnector::with(vec![Step::Open(channel)]));
        let (_sub, mut statuses) = record_statuses(&manager);

        manager.connect();
        assert_eq!(statuses.recv().await, Some(ConnectionStatus::Connected));
        remote.tx.send(ChannelEvent::Error("reset".into())).await.unwrap();
        assert_eq!(
            statuses.recv().await,
            Some(ConnectionStatus::Error {
                reason: "reset".into()
            })
        );
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_retry() {
        let connector = ScriptedConnector::with(vec![Step::Fail]);
        let opens = connector.opens.clone();
        let manager = manager(connector);
        let (_sub, mut statuses) = record_statuses(&manager);

        manager.connect();
        assert!(matches!(
            statuses.recv().await,
            Some(ConnectionStatus::Error { .. })
        ));
        assert_eq!(manager.state(), ConnectionState::Reconnecting);

        manager.disconnect();
        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(opens.lock().unwrap().len(), 1);
        assert_eq!(statuses.recv().await, Some(ConnectionStatus::Disconnected));
        assert!(statuses.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disconnect_is_the_last_status_while_channel_errors() {
        for _ in 0..50 {
            let (channel, remote) = channel_pair();
            remote.tx.try_send(ChannelEvent::Error("reset".into())).unwrap();
            let manager = manager(ScriptedConnector::with(vec![Step::Open(channel)]));
            let (_sub, mut statuses) = record_statuses(&manager);

            manager.connect();
            assert_eq!(statuses.recv().await, Some(ConnectionStatus::Connected));
            manager.disconnect();
            tokio::time::sleep(Duration::from_millis(5)).await;

            let mut after = Vec::new();
            while let Ok(status) = statuses.try_recv() {
                after.push(status);
            }
            assert_eq!(after.last(), Some(&ConnectionStatus::Disconnected));
            let disconnects = after
                .iter()
                .filter(|s| **s == ConnectionStatus::Disconnected)
                .count();
            assert_eq!(disconnects, 1, "statuses after connect: {:?}", after);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connect_twice_opens_once() {
        let (channel, _remote) = channel_pair();
        let connector = ScriptedConnector::with(vec![Step::Open(channel)]);
        let opens = connector.opens.clone();
        let manager = manager(connector);
        let (_sub, mut statuses) = record_statuses(&manager);

        manager.connect();
        manager.connect();
        assert_eq!(statuses.recv().await, Some(ConnectionStatus::Connected));
        manager.connect();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(opens.lock().unwrap().len(), 1);
    }
}
