//! Resilient subscriber for the live readings feed.
//!
//! A `StreamClient` owns one background task per session. The task walks the
//! state machine below and fans parsed batches out to registered observers.
//!
//! ```text
//! Disconnected -> Connecting -> Open -> Reconnecting -> Connecting -> ...
//!                     |                      |
//!                     +--> Failed            +--> Closed (disconnect)
//! ```

mod connector;
mod observer;

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::domain::{ReadingBatch, StreamMessage};

pub use connector::{Connector, FrameStream, WsConnector};
pub use observer::{ObserverId, StreamObserver};

use observer::ObserverSet;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ClientConnectionError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection closed by peer")]
    Closed,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ClientFatalError {
    #[error("gave up after {attempts} failed connection attempts: {last_error}")]
    ReconnectExhausted {
        attempts: u32,
        last_error: ClientConnectionError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Open,
    Reconnecting,
    Failed,
    Closed,
}

impl ClientState {
    /// No automatic transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }

    fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Open | Self::Reconnecting)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub state: ClientState,
    /// Consecutive failed connection attempts since the last successful open.
    pub reconnect_attempt: u32,
    pub last_error: Option<ClientConnectionError>,
    generation: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamClientConfig {
    pub url: String,
    pub max_reconnect_attempts: u32,
    pub base_delay_ms: u64,
}

impl StreamClientConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

impl Default for StreamClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080".to_string(),
            max_reconnect_attempts: 5,
            base_delay_ms: 5_000,
        }
    }
}

pub struct StreamClient {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    max_reconnect_attempts: u32,
    base_delay: Duration,
    session: watch::Sender<Session>,
    cancel: Mutex<CancellationToken>,
    observers: ObserverSet,
}

impl StreamClient {
    pub fn new<C: Connector>(connector: C, config: &StreamClientConfig) -> Self {
        let (session, _) = watch::channel(Session {
            state: ClientState::Disconnected,
            reconnect_attempt: 0,
            last_error: None,
            generation: 0,
        });

        Self {
            inner: Arc::new(Inner {
                connector: Arc::new(connector),
                max_reconnect_attempts: config.max_reconnect_attempts,
                base_delay: config.base_delay(),
                session,
                cancel: Mutex::new(CancellationToken::new()),
                observers: ObserverSet::default(),
            }),
        }
    }

    /// Client over a WebSocket connection to `config.url`.
    pub fn websocket(config: &StreamClientConfig) -> Self {
        Self::new(WsConnector::new(config.url.clone()), config)
    }

    /// Start a session in the background.
    ///
    /// Also restarts a client that has `Failed` or was `Closed`. Returns
    /// `false` when a session is already active. Must be called within a
    /// tokio runtime.
    pub fn connect(&self) -> bool {
        let mut cancel = self.inner.cancel.lock().unwrap_or_else(PoisonError::into_inner);

        let mut generation = 0;
        let started = self.inner.session.send_if_modified(|s| {
            if s.state.is_active() {
                return false;
            }
            s.generation += 1;
            s.state = ClientState::Connecting;
            s.reconnect_attempt = 0;
            s.last_error = None;
            generation = s.generation;
            true
        });
        if !started {
            return false;
        }

        let token = CancellationToken::new();
        *cancel = token.clone();
        drop(cancel);

        tokio::spawn(self.inner.clone().run(generation, token));
        true
    }

    /// Cancel any pending retry and move to `Closed`.
    ///
    /// A no-op in a terminal state.
    pub fn disconnect(&self) {
        let cancel = self.inner.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        cancel.cancel();
        let closed = self.inner.session.send_if_modified(|s| {
            if s.state.is_terminal() {
                return false;
            }
            s.state = ClientState::Closed;
            true
        });
        if closed {
            tracing::info!("stream client closed");
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn StreamObserver>) -> ObserverId {
        self.inner.observers.add(observer)
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.inner.observers.remove(id)
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.len()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Open
    }

    pub fn state(&self) -> ClientState {
        self.inner.session.borrow().state
    }

    pub fn session(&self) -> Session {
        self.inner.session.borrow().clone()
    }

    /// Receiver that observes every session change.
    pub fn watch_state(&self) -> watch::Receiver<Session> {
        self.inner.session.subscribe()
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.inner
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }
}

impl Inner {
    /// Apply `f` only if `generation` is still current and not terminal.
    fn update<R>(&self, generation: u64, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut out = None;
        self.session.send_if_modified(|s| {
            if s.generation != generation || s.state.is_terminal() {
                return false;
            }
            out = Some(f(s));
            true
        });
        out
    }

    async fn run(self: Arc<Self>, generation: u64, cancel: CancellationToken) {
        loop {
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                res = self.connector.connect() => res,
            };

            let delay = match attempt {
                Ok(frames) => {
                    let opened = self.update(generation, |s| {
                        s.state = ClientState::Open;
                        s.reconnect_attempt = 0;
                        s.last_error = None;
                    });
                    if opened.is_none() {
                        return;
                    }
                    tracing::info!("stream connected");

                    let Some(error) = self.pump(frames, &cancel).await else {
                        return;
                    };
                    tracing::warn!(error = %error, "stream connection lost");
                    let reconnecting = self.update(generation, |s| {
                        s.state = ClientState::Reconnecting;
                        s.last_error = Some(error.clone());
                    });
                    if reconnecting.is_none() {
                        return;
                    }
                    self.base_delay
                }
                Err(error) => {
                    let max = self.max_reconnect_attempts;
                    let Some(attempts) = self.update(generation, |s| {
                        s.reconnect_attempt += 1;
                        s.last_error = Some(error.clone());
                        s.state = if s.reconnect_attempt >= max {
                            ClientState::Failed
                        } else {
                            ClientState::Reconnecting
                        };
                        s.reconnect_attempt
                    }) else {
                        return;
                    };

                    if attempts >= max {
                        let fatal = ClientFatalError::ReconnectExhausted {
                            attempts,
                            last_error: error,
                        };
                        tracing::error!(error = %fatal, "stream client failed");
                        self.observers.notify_fatal(&fatal);
                        return;
                    }

                    tracing::warn!(
                        error = %error,
                        attempt = attempts,
                        max_attempts = max,
                        "stream connect failed, retrying with backoff"
                    );
                    self.base_delay * attempts
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            if self
                .update(generation, |s| s.state = ClientState::Connecting)
                .is_none()
            {
                return;
            }
        }
    }

    /// Deliver frames until the connection fails. `None` means cancelled.
    async fn pump(&self, mut frames: FrameStream, cancel: &CancellationToken) -> Option<ClientConnectionError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                next = frames.next() => next,
            };

            match next {
                Some(Ok(text)) => self.dispatch(&text),
                Some(Err(e)) => return Some(e),
                None => return Some(ClientConnectionError::Closed),
            }
        }
    }

    fn dispatch(&self, text: &str) {
        match serde_json::from_str::<StreamMessage>(text) {
            Ok(msg) => {
                let batch = ReadingBatch::from(msg);
                tracing::debug!(readings = batch.len(), "stream batch received");
                self.observers.notify_readings(&batch);
            }
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed stream frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicU32, Ordering},
    };

    const FRAME: &str = r#"{"type":"readings","timestamp":"2024-03-01T12:00:05Z","data":[{"deviceId":"D1","timestamp":"2024-03-01T12:00:05Z","consumption":750.0,"voltage":220.0,"current":3.409090909090909,"powerFactor":0.9,"location":"lab"}]}"#;

    enum Script {
        Fail,
        /// Deliver these frames, then stay open.
        Hold(Vec<Result<String, ClientConnectionError>>),
        /// Deliver these frames, then end the stream.
        Drop(Vec<Result<String, ClientConnectionError>>),
    }

    #[derive(Clone, Default)]
    struct ScriptedConnector {
        script: Arc<Mutex<VecDeque<Script>>>,
        calls: Arc<AtomicU32>,
    }

    impl ScriptedConnector {
        fn new(script: Vec<Script>) -> Self {
            Self {
                script: Arc::new(Mutex::new(script.into())),
                calls: Arc::new(AtomicU32::new(0)),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self) -> Result<FrameStream, ClientConnectionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front().unwrap_or(Script::Fail);
            match next {
                Script::Fail => Err(ClientConnectionError::Connect("refused".to_string())),
                Script::Hold(frames) => Ok(Box::pin(
                    futures::stream::iter(frames).chain(futures::stream::pending()),
                )),
                Script::Drop(frames) => Ok(Box::pin(futures::stream::iter(frames))),
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<ReadingBatch>>,
        fatals: Mutex<Vec<ClientFatalError>>,
    }

    impl Recorder {
        fn batch_count(&self) -> usize {
            self.batches.lock().unwrap().len()
        }

        fn fatal_count(&self) -> usize {
            self.fatals.lock().unwrap().len()
        }
    }

    impl StreamObserver for Recorder {
        fn on_readings(&self, batch: &ReadingBatch) {
            self.batches.lock().unwrap().push(batch.clone());
        }

        fn on_fatal(&self, error: &ClientFatalError) {
            self.fatals.lock().unwrap().push(error.clone());
        }
    }

    fn config(max_reconnect_attempts: u32) -> StreamClientConfig {
        StreamClientConfig {
            url: "ws://unused".to_string(),
            max_reconnect_attempts,
            base_delay_ms: 5_000,
        }
    }

    async fn wait_for(client: &StreamClient, pred: impl FnMut(&Session) -> bool) {
        let mut rx = client.watch_state();
        rx.wait_for(pred).await.expect("session sender dropped");
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts_and_notifies_once() {
        let connector = ScriptedConnector::new(vec![]);
        let client = StreamClient::new(connector.clone(), &config(3));
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        client.subscribe(a.clone());
        client.subscribe(b.clone());

        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(client.connect());
        wait_for(&client, |s| s.state.is_terminal()).await;

        let session = client.session();
        assert_eq!(session.state, ClientState::Failed);
        assert_eq!(session.reconnect_attempt, 3);
        assert!(session.last_error.is_some());
        assert_eq!(connector.calls(), 3);
        assert_eq!(a.fatal_count(), 1);
        assert_eq!(b.fatal_count(), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.calls(), 3);
        assert_eq!(a.fatal_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_linearly_with_attempts() {
        let connector = ScriptedConnector::new(vec![]);
        let client = StreamClient::new(connector.clone(), &config(4));
        let started = tokio::time::Instant::now();

        client.connect();
        wait_for(&client, |s| s.state.is_terminal()).await;

        // 5s + 10s + 15s between the four attempts.
        assert_eq!(connector.calls(), 4);
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(started.elapsed() < Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn open_resets_attempts_and_fans_out_to_every_observer() {
        let connector = ScriptedConnector::new(vec![
            Script::Fail,
            Script::Hold(vec![Ok(FRAME.to_string())]),
        ]);
        let client = StreamClient::new(connector.clone(), &config(5));
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        client.subscribe(a.clone());
        client.subscribe(b.clone());

        client.connect();
        wait_for(&client, |s| s.state == ClientState::Open).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(client.is_connected());
        assert_eq!(client.session().reconnect_attempt, 0);
        assert_eq!(a.batch_count(), 1);
        assert_eq!(b.batch_count(), 1);

        let batch = a.batches.lock().unwrap()[0].clone();
        assert_eq!(batch.readings[0].device_id, "D1");
        assert_eq!(batch.timestamp, time::macros::datetime!(2024-03-01 12:00:05 UTC));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_are_skipped() {
        let connector = ScriptedConnector::new(vec![Script::Hold(vec![
            Ok("not json".to_string()),
            Ok(r#"{"type":"alerts"}"#.to_string()),
            Ok(FRAME.to_string()),
        ])]);
        let client = StreamClient::new(connector, &config(5));
        let rec = Arc::new(Recorder::default());
        client.subscribe(rec.clone());

        client.connect();
        wait_for(&client, |s| s.state == ClientState::Open).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(rec.batch_count(), 1);
        assert!(client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_session_reconnects() {
        let connector = ScriptedConnector::new(vec![
            Script::Drop(vec![Ok(FRAME.to_string())]),
            Script::Hold(vec![Ok(FRAME.to_string())]),
        ]);
        let client = StreamClient::new(connector.clone(), &config(5));
        let rec = Arc::new(Recorder::default());
        client.subscribe(rec.clone());

        client.connect();
        wait_for(&client, |s| s.state == ClientState::Reconnecting).await;
        assert_eq!(client.session().last_error, Some(ClientConnectionError::Closed));

        wait_for(&client, |s| s.state == ClientState::Open).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(connector.calls(), 2);
        assert_eq!(rec.batch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_retry() {
        let connector = ScriptedConnector::new(vec![]);
        let client = StreamClient::new(connector.clone(), &config(5));
        let rec = Arc::new(Recorder::default());
        client.subscribe(rec.clone());

        client.connect();
        wait_for(&client, |s| s.state == ClientState::Reconnecting).await;
        client.disconnect();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(client.state(), ClientState::Closed);
        assert_eq!(connector.calls(), 1);
        assert_eq!(rec.fatal_count(), 0);

        // Closed is terminal; a second disconnect changes nothing.
        client.disconnect();
        assert_eq!(client.state(), ClientState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_a_no_op_while_active_and_restarts_after_failure() {
        let connector = ScriptedConnector::new(vec![Script::Fail, Script::Hold(vec![])]);
        let client = StreamClient::new(connector.clone(), &config(1));

        assert!(client.connect());
        wait_for(&client, |s| s.state == ClientState::Failed).await;

        assert!(client.connect());
        assert!(!client.connect());
        wait_for(&client, |s| s.state == ClientState::Open).await;
        assert_eq!(connector.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribed_observer_stops_receiving() {
        let connector = ScriptedConnector::new(vec![Script::Hold(vec![Ok(FRAME.to_string())])]);
        let client = StreamClient::new(connector, &config(5));
        let kept = Arc::new(Recorder::default());
        let removed = Arc::new(Recorder::default());
        client.subscribe(kept.clone());
        let id = client.subscribe(removed.clone());

        assert!(client.unsubscribe(id));
        assert!(!client.unsubscribe(id));
        assert_eq!(client.observer_count(), 1);

        client.connect();
        wait_for(&client, |s| s.state == ClientState::Open).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(kept.batch_count(), 1);
        assert_eq!(removed.batch_count(), 0);
    }

    struct Panicky;

    impl StreamObserver for Panicky {
        fn on_readings(&self, _batch: &ReadingBatch) {
            panic!("observer bug");
        }

        fn on_fatal(&self, _error: &ClientFatalError) {
            panic!("observer bug");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_observer_does_not_stall_the_session() {
        let connector = ScriptedConnector::new(vec![Script::Drop(vec![
            Ok(FRAME.to_string()),
            Ok(FRAME.to_string()),
        ])]);
        let client = StreamClient::new(connector, &config(2));
        client.subscribe(Arc::new(Panicky));
        let counted = Arc::new(Recorder::default());
        client.subscribe(counted.clone());

        client.connect();
        wait_for(&client, |s| s.state == ClientState::Reconnecting).await;
        assert_eq!(counted.batch_count(), 2);
        assert!(!client.is_connected());

        // Reconnect then fail twice; the fatal notice still reaches the second observer.
        wait_for(&client, |s| s.state == ClientState::Failed).await;
        assert_eq!(counted.fatal_count(), 1);
    }
}
