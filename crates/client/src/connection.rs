//! Connection state machine for a single terminal session.
//!
//! Wraps one WebSocket link per session with:
//! - A handshake that binds the link to a server-side session
//! - A bounded linear retry ladder for failures during establishment
//! - Freeze-on-loss semantics once a session has been acknowledged
//! - Event emission for embedding frontends

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{
    Envelope, ImagePayload, InputChunk, Message, ResizeRequest, SessionParams, SessionReady,
    DEFAULT_COLS, DEFAULT_ROWS, MAX_ENVELOPE_BYTES,
};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default timeout covering the transport dial and the handshake acknowledgment.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default spacing unit for the retry ladder; attempt N waits N units.
pub const DEFAULT_RETRY_DELAY_UNIT: Duration = Duration::from_secs(1);

/// Number of reconnect attempts before the machine gives up for good.
pub const MAX_RETRY_ATTEMPTS: u32 = 5;

/// Buffer size for the outbound message channel.
const OUTBOUND_BUFFER_SIZE: usize = 256;

/// Buffer size for the terminal output channel.
const OUTPUT_BUFFER_SIZE: usize = 256;

/// Buffer size for the event broadcast channel.
const EVENT_BUFFER_SIZE: usize = 64;

type WsLink = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsLink, WsMessage>;
type WsSource = SplitStream<WsLink>;

/// Socket limits sized to the largest legal envelope, matching the server.
fn socket_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(MAX_ENVELOPE_BYTES),
        max_frame_size: Some(MAX_ENVELOPE_BYTES),
        ..WebSocketConfig::default()
    }
}

/// Connection state for a client terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ConnectionState {
    /// No transport attempt has been made yet.
    Disconnected,
    /// Dialing the server or waiting for the handshake acknowledgment.
    Connecting,
    /// Handshake acknowledged; input and output are flowing.
    Connected,
    /// Establishment failed; a retry is pending on the ladder.
    Errored,
    /// Terminal state: disposed, frozen after loss, or out of retries.
    Closed,
}

/// Events emitted by a terminal connection for frontend notification.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ConnectionEvent {
    /// Connection state changed.
    StateChanged(ConnectionState),
    /// Handshake acknowledged; the session is attached.
    SessionReady { session_id: String, workdir: String },
    /// A reconnect attempt is scheduled after a delay.
    RetryScheduled { attempt: u32, delay_ms: u64 },
    /// The retry ladder is exhausted; only an explicit restart recovers.
    RetriesExhausted,
    /// An established link dropped; rendered output is preserved and no
    /// automatic reconnect happens.
    ConnectionFrozen,
    /// The server persisted a pasted image.
    ImageAdded { path: String, filename: String },
    /// The server-side process ended.
    ProcessExited { exit_code: Option<i32> },
    /// The server reported an error.
    Error { message: String, recoverable: bool },
}

/// Errors surfaced by [`TerminalConnection`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The operation requires an established session link.
    #[error("no active session link")]
    NotConnected,
    /// The link closed while the message was being queued.
    #[error("session link closed")]
    LinkClosed,
}

/// Timing configuration for a terminal connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Timeout covering the transport dial and handshake acknowledgment.
    pub connect_timeout: Duration,
    /// Spacing unit for the retry ladder.
    pub retry_delay_unit: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry_delay_unit: DEFAULT_RETRY_DELAY_UNIT,
        }
    }
}

impl ClientConfig {
    /// Sets the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the retry ladder spacing unit.
    pub fn retry_delay_unit(mut self, unit: Duration) -> Self {
        self.retry_delay_unit = unit;
        self
    }
}

/// State shared between the connection handle and its driver task.
#[derive(Clone)]
struct LinkShared {
    url: String,
    config: ClientConfig,
    params: Arc<RwLock<SessionParams>>,
    state: Arc<RwLock<ConnectionState>>,
    event_tx: broadcast::Sender<ConnectionEvent>,
    output_tx: mpsc::Sender<Vec<u8>>,
    /// Sender installed per established link, cleared when the link drops.
    outbound: Arc<RwLock<Option<mpsc::Sender<Message>>>>,
    /// Last known terminal dimensions, pushed on every handshake.
    dims: Arc<RwLock<(u16, u16)>>,
}

impl LinkShared {
    /// Emits an event to all subscribers.
    fn emit(&self, event: ConnectionEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.event_tx.send(event);
    }

    /// Sets the connection state and emits an event.
    async fn set_state(&self, new_state: ConnectionState) {
        {
            let mut state = self.state.write().await;
            *state = new_state;
        }
        self.emit(ConnectionEvent::StateChanged(new_state));
    }
}

/// Client-side handle for one terminal session.
///
/// Owns the WebSocket link, the handshake, and the reconnect policy. Terminal
/// output is handed out through a single-consumer channel in production order;
/// everything else surfaces as [`ConnectionEvent`]s.
pub struct TerminalConnection {
    shared: LinkShared,
    output_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    cancel: Mutex<CancellationToken>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl TerminalConnection {
    /// Creates a connection handle for one terminal session.
    ///
    /// No transport activity happens until [`connect`](Self::connect).
    pub fn new(url: impl Into<String>, params: SessionParams) -> Self {
        Self::with_config(url, params, ClientConfig::default())
    }

    /// Creates a connection handle with explicit timing configuration.
    pub fn with_config(
        url: impl Into<String>,
        params: SessionParams,
        config: ClientConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_BUFFER_SIZE);
        Self {
            shared: LinkShared {
                url: url.into(),
                config,
                params: Arc::new(RwLock::new(params)),
                state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
                event_tx,
                output_tx,
                outbound: Arc::new(RwLock::new(None)),
                dims: Arc::new(RwLock::new((DEFAULT_ROWS, DEFAULT_COLS))),
            },
            output_rx: Mutex::new(Some(output_rx)),
            cancel: Mutex::new(CancellationToken::new()),
            driver: Mutex::new(None),
        }
    }

    /// Subscribes to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Takes the terminal output receiver.
    ///
    /// Chunks arrive exactly as the process produced them, in order. There is
    /// one consumer; every call after the first returns `None`. The link
    /// applies backpressure rather than dropping output, so the receiver must
    /// be drained while the connection is live.
    pub async fn take_output_receiver(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.output_rx.lock().await.take()
    }

    /// Returns the current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Returns whether the session link is currently established.
    pub fn is_connected(&self) -> bool {
        match self.shared.state.try_read() {
            Ok(guard) => *guard == ConnectionState::Connected,
            Err(_) => false,
        }
    }

    /// Returns the session id the connection dials with.
    pub async fn session_id(&self) -> String {
        self.shared.params.read().await.session_id.clone()
    }

    /// Starts the connection driver, replacing any previous one.
    pub async fn connect(&self) {
        self.shutdown_driver().await;
        let token = CancellationToken::new();
        *self.cancel.lock().await = token.clone();
        let handle = tokio::spawn(drive(self.shared.clone(), token));
        *self.driver.lock().await = Some(handle);
    }

    /// Queues raw bytes for the process input stream.
    pub async fn send_input(&self, bytes: &[u8]) -> Result<(), ClientError> {
        self.send(Message::Input(InputChunk::new(bytes))).await
    }

    /// Queues a pasted image for persistence on the server.
    pub async fn send_image(
        &self,
        bytes: &[u8],
        filename: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.send(Message::Image(ImagePayload::from_bytes(bytes, filename)))
            .await
    }

    /// Records new terminal dimensions and pushes them to the server.
    ///
    /// Returns `Ok(true)` when a resize message was sent. Unchanged dimensions
    /// are skipped entirely; changed dimensions without a live link are only
    /// recorded, so the next handshake reports them.
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<bool, ClientError> {
        {
            let mut dims = self.shared.dims.write().await;
            if *dims == (rows, cols) {
                return Ok(false);
            }
            *dims = (rows, cols);
        }
        match self.send(Message::Resize(ResizeRequest { rows, cols })).await {
            Ok(()) => Ok(true),
            Err(ClientError::NotConnected) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Abandons the current session and dials a fresh one.
    ///
    /// Always mints a new session id: the agent CLIs track session identity
    /// themselves and reject a second attach under an id they consider live.
    pub async fn restart(&self) {
        self.shutdown_driver().await;
        {
            let mut params = self.shared.params.write().await;
            params.session_id = protocol::mint_session_id();
        }
        self.connect().await;
    }

    /// Tears the connection down and cancels every pending timer.
    pub async fn dispose(&self) {
        self.shutdown_driver().await;
        self.shared.set_state(ConnectionState::Closed).await;
    }

    async fn send(&self, message: Message) -> Result<(), ClientError> {
        let tx = { self.shared.outbound.read().await.clone() };
        let Some(tx) = tx else {
            return Err(ClientError::NotConnected);
        };
        tx.send(message).await.map_err(|_| ClientError::LinkClosed)
    }

    /// Cancels and detaches the current driver task, if any.
    async fn shutdown_driver(&self) {
        self.cancel.lock().await.cancel();
        if let Some(handle) = self.driver.lock().await.take() {
            handle.abort();
        }
        // An aborted driver never runs its cleanup.
        let mut outbound = self.shared.outbound.write().await;
        *outbound = None;
    }
}

/// Outcome of a single transport link attempt.
enum LinkOutcome {
    /// The dial or handshake failed before the session was acknowledged.
    FailedBeforeReady,
    /// The link dropped after the session was acknowledged.
    LostAfterReady,
    /// The cancellation token fired.
    Cancelled,
}

/// Runs the connection until it terminates.
///
/// Establishment failures walk a linear ladder: attempt N is retried after
/// N delay units, and after [`MAX_RETRY_ATTEMPTS`] scheduled retries the
/// machine gives up. A link that made it to ready never reconnects on its
/// own; the view freezes with its output intact until the user restarts.
async fn drive(shared: LinkShared, cancel: CancellationToken) {
    let mut retries: u32 = 0;
    loop {
        shared.set_state(ConnectionState::Connecting).await;
        match run_link(&shared, &cancel, &mut retries).await {
            LinkOutcome::Cancelled => {
                shared.set_state(ConnectionState::Closed).await;
                return;
            }
            LinkOutcome::LostAfterReady => {
                shared.emit(ConnectionEvent::ConnectionFrozen);
                shared.set_state(ConnectionState::Closed).await;
                return;
            }
            LinkOutcome::FailedBeforeReady => {
                if retries >= MAX_RETRY_ATTEMPTS {
                    warn!("giving up after {MAX_RETRY_ATTEMPTS} reconnect attempts");
                    shared.emit(ConnectionEvent::RetriesExhausted);
                    shared.set_state(ConnectionState::Closed).await;
                    return;
                }
                retries += 1;
                let delay = shared.config.retry_delay_unit * retries;
                shared.emit(ConnectionEvent::RetryScheduled {
                    attempt: retries,
                    delay_ms: delay.as_millis() as u64,
                });
                shared.set_state(ConnectionState::Errored).await;
                tokio::select! {
                    _ = cancel.cancelled() => {
                        shared.set_state(ConnectionState::Closed).await;
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Dials, performs the handshake, and bridges frames until the link drops.
async fn run_link(
    shared: &LinkShared,
    cancel: &CancellationToken,
    retries: &mut u32,
) -> LinkOutcome {
    let dial = tokio::time::timeout(
        shared.config.connect_timeout,
        connect_async_with_config(&shared.url, Some(socket_config()), false),
    );
    let ws = tokio::select! {
        _ = cancel.cancelled() => return LinkOutcome::Cancelled,
        result = dial => match result {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(err)) => {
                debug!(error = %err, "transport dial failed");
                return LinkOutcome::FailedBeforeReady;
            }
            Err(_) => {
                debug!("transport dial timed out");
                return LinkOutcome::FailedBeforeReady;
            }
        },
    };
    let (mut sink, mut stream) = ws.split();

    // The first frame on every link is the session open request.
    let params = shared.params.read().await.clone();
    let mut sequence: u64 = 0;
    if write_frame(&mut sink, &mut sequence, Message::Open(params))
        .await
        .is_err()
    {
        return LinkOutcome::FailedBeforeReady;
    }

    let acknowledged = tokio::time::timeout(shared.config.connect_timeout, await_ready(&mut stream));
    let ready = tokio::select! {
        _ = cancel.cancelled() => return LinkOutcome::Cancelled,
        result = acknowledged => match result {
            Ok(Some(ready)) => ready,
            Ok(None) => return LinkOutcome::FailedBeforeReady,
            Err(_) => {
                debug!("handshake acknowledgment timed out");
                return LinkOutcome::FailedBeforeReady;
            }
        },
    };

    *retries = 0;
    info!(session_id = %ready.session_id, agent = ready.agent.id(), "session ready");
    shared.set_state(ConnectionState::Connected).await;
    shared.emit(ConnectionEvent::SessionReady {
        session_id: ready.session_id,
        workdir: ready.workdir,
    });

    // The server cannot learn the terminal size on its own; push it now.
    let (rows, cols) = *shared.dims.read().await;
    if write_frame(
        &mut sink,
        &mut sequence,
        Message::Resize(ResizeRequest { rows, cols }),
    )
    .await
    .is_err()
    {
        return LinkOutcome::LostAfterReady;
    }

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER_SIZE);
    {
        let mut outbound = shared.outbound.write().await;
        *outbound = Some(outbound_tx);
    }

    let outcome = loop {
        tokio::select! {
            _ = cancel.cancelled() => break LinkOutcome::Cancelled,
            queued = outbound_rx.recv() => {
                let Some(message) = queued else {
                    break LinkOutcome::Cancelled;
                };
                if write_frame(&mut sink, &mut sequence, message).await.is_err() {
                    break LinkOutcome::LostAfterReady;
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Binary(bytes))) => match Envelope::from_msgpack(&bytes) {
                        Ok(envelope) => {
                            if let Some(reply) = handle_frame(shared, envelope.payload).await {
                                if write_frame(&mut sink, &mut sequence, reply).await.is_err() {
                                    break LinkOutcome::LostAfterReady;
                                }
                            }
                        }
                        Err(err) => {
                            debug!(error = %err, "dropping malformed frame");
                        }
                    },
                    Some(Ok(WsMessage::Close(_))) | None => break LinkOutcome::LostAfterReady,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(error = %err, "link read failed");
                        break LinkOutcome::LostAfterReady;
                    }
                }
            }
        }
    };

    {
        let mut outbound = shared.outbound.write().await;
        *outbound = None;
    }
    outcome
}

/// Waits for the handshake acknowledgment, tolerating interleaved frames.
async fn await_ready(stream: &mut WsSource) -> Option<SessionReady> {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Binary(bytes)) => match Envelope::from_msgpack(&bytes) {
                Ok(envelope) => match envelope.payload {
                    Message::Ready(ready) => return Some(ready),
                    Message::Error(err) => {
                        warn!(code = ?err.code, "session open rejected: {}", err.message);
                        return None;
                    }
                    other => {
                        debug!(message = ?other, "ignoring frame before ready");
                    }
                },
                Err(err) => {
                    debug!(error = %err, "dropping malformed frame");
                }
            },
            Ok(WsMessage::Close(_)) => return None,
            Ok(_) => {}
            Err(err) => {
                debug!(error = %err, "link read failed before ready");
                return None;
            }
        }
    }
    None
}

/// Applies one server frame, returning a reply when one is due.
async fn handle_frame(shared: &LinkShared, message: Message) -> Option<Message> {
    match message {
        Message::TerminalOutput(chunk) => {
            // Await capacity so chunks are never reordered or dropped.
            if shared.output_tx.send(chunk.data).await.is_err() {
                debug!("output receiver dropped; discarding chunk");
            }
            None
        }
        Message::ImageAdded(added) => {
            shared.emit(ConnectionEvent::ImageAdded {
                path: added.path,
                filename: added.filename,
            });
            None
        }
        Message::Error(err) => {
            warn!(code = ?err.code, "server error: {}", err.message);
            shared.emit(ConnectionEvent::Error {
                message: err.message,
                recoverable: err.recoverable,
            });
            None
        }
        Message::Exited(exit) => {
            shared.emit(ConnectionEvent::ProcessExited {
                exit_code: exit.exit_code,
            });
            None
        }
        Message::Ping => Some(Message::Pong),
        Message::Pong => None,
        other => {
            debug!(message = ?other, "ignoring unexpected frame");
            None
        }
    }
}

/// Encodes and writes one envelope on the link.
async fn write_frame(
    sink: &mut WsSink,
    sequence: &mut u64,
    message: Message,
) -> anyhow::Result<()> {
    let bytes = Envelope::new(*sequence, message).to_msgpack()?;
    *sequence += 1;
    sink.send(WsMessage::Binary(bytes)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{AgentKind, OutputChunk};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    type ServerLink = WebSocketStream<TcpStream>;

    fn fast_config() -> ClientConfig {
        ClientConfig::default()
            .connect_timeout(Duration::from_secs(2))
            .retry_delay_unit(Duration::from_millis(5))
    }

    fn shell_params(workdir: &tempfile::TempDir) -> SessionParams {
        SessionParams::new(workdir.path(), AgentKind::Shell)
    }

    /// Binds a port and releases it so dialing it gets refused.
    async fn refused_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{addr}")
    }

    async fn next_event(rx: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn recv_from_client(ws: &mut ServerLink) -> Option<Message> {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Binary(bytes))) => {
                    return Some(Envelope::from_msgpack(&bytes).unwrap().payload);
                }
                Some(Ok(WsMessage::Close(_))) | None => return None,
                Some(Ok(_)) => continue,
                Some(Err(_)) => return None,
            }
        }
    }

    async fn send_to_client(ws: &mut ServerLink, sequence: u64, message: Message) {
        let bytes = Envelope::new(sequence, message).to_msgpack().unwrap();
        ws.send(WsMessage::Binary(bytes)).await.unwrap();
    }

    /// Answers the open request with a ready acknowledgment and consumes the
    /// dimension push that follows it.
    async fn accept_handshake(ws: &mut ServerLink) -> SessionParams {
        let open = recv_from_client(ws).await.expect("no open request");
        let Message::Open(params) = open else {
            panic!("expected open request, got {open:?}");
        };
        let ready = SessionReady {
            session_id: params.session_id.clone(),
            agent: params.agent,
            workdir: params.workdir.display().to_string(),
        };
        send_to_client(ws, 0, Message::Ready(ready)).await;
        let resize = recv_from_client(ws).await.expect("no dimension push");
        assert!(matches!(resize, Message::Resize(_)));
        params
    }

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.retry_delay_unit, DEFAULT_RETRY_DELAY_UNIT);
    }

    #[test]
    fn test_config_builders() {
        let config = ClientConfig::default()
            .connect_timeout(Duration::from_secs(3))
            .retry_delay_unit(Duration::from_millis(250));
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.retry_delay_unit, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_initial_state_is_disconnected() {
        let workdir = tempfile::tempdir().unwrap();
        let conn = TerminalConnection::new("ws://127.0.0.1:1", shell_params(&workdir));
        assert_eq!(conn.state().await, ConnectionState::Disconnected);
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_send_input_without_connection_fails() {
        let workdir = tempfile::tempdir().unwrap();
        let conn = TerminalConnection::new("ws://127.0.0.1:1", shell_params(&workdir));
        let result = conn.send_input(b"ls\n").await;
        assert!(matches!(result, Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn test_output_receiver_is_single_use() {
        let workdir = tempfile::tempdir().unwrap();
        let conn = TerminalConnection::new("ws://127.0.0.1:1", shell_params(&workdir));
        assert!(conn.take_output_receiver().await.is_some());
        assert!(conn.take_output_receiver().await.is_none());
    }

    #[tokio::test]
    async fn test_resize_unchanged_dimensions_skipped() {
        let workdir = tempfile::tempdir().unwrap();
        let conn = TerminalConnection::new("ws://127.0.0.1:1", shell_params(&workdir));
        // The defaults are already recorded.
        assert!(!conn.resize(DEFAULT_ROWS, DEFAULT_COLS).await.unwrap());
        // Changed but offline: recorded, nothing sent.
        assert!(!conn.resize(30, 100).await.unwrap());
        // Repeating the recorded value proves it stuck.
        assert!(!conn.resize(30, 100).await.unwrap());
    }

    #[tokio::test]
    async fn test_retry_ladder_exhausts_after_five_attempts() {
        let url = refused_url().await;
        let workdir = tempfile::tempdir().unwrap();
        let params = shell_params(&workdir);
        let original_id = params.session_id.clone();
        let conn = TerminalConnection::with_config(&url, params, fast_config());
        let mut events = conn.subscribe();
        conn.connect().await;

        let mut scheduled = Vec::new();
        loop {
            match next_event(&mut events).await {
                ConnectionEvent::RetryScheduled { attempt, delay_ms } => {
                    scheduled.push((attempt, delay_ms));
                }
                ConnectionEvent::RetriesExhausted => break,
                ConnectionEvent::SessionReady { .. } => panic!("nothing to connect to"),
                _ => {}
            }
        }
        // Five attempts, linearly spaced, then nothing.
        assert_eq!(scheduled, vec![(1, 5), (2, 10), (3, 15), (4, 20), (5, 25)]);

        loop {
            match next_event(&mut events).await {
                ConnectionEvent::StateChanged(ConnectionState::Closed) => break,
                ConnectionEvent::RetryScheduled { .. } => panic!("retry after exhaustion"),
                _ => {}
            }
        }
        assert_eq!(conn.state().await, ConnectionState::Closed);
        // Every attempt on the ladder reused the same session id.
        assert_eq!(conn.session_id().await, original_id);

        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event, ConnectionEvent::RetryScheduled { .. }),
                "sixth attempt scheduled"
            );
        }
    }

    #[tokio::test]
    async fn test_connect_acknowledges_and_pushes_dimensions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let workdir = tempfile::tempdir().unwrap();
        let params = shell_params(&workdir);
        let expected_id = params.session_id.clone();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            let open = recv_from_client(&mut ws).await.unwrap();
            let Message::Open(params) = open else {
                panic!("expected open request, got {open:?}");
            };
            let ready = SessionReady {
                session_id: params.session_id.clone(),
                agent: params.agent,
                workdir: params.workdir.display().to_string(),
            };
            send_to_client(&mut ws, 0, Message::Ready(ready)).await;

            // Dimensions recorded before connecting ride along after ready.
            let resize = recv_from_client(&mut ws).await.unwrap();
            assert!(matches!(
                resize,
                Message::Resize(ResizeRequest {
                    rows: 30,
                    cols: 100
                })
            ));

            send_to_client(
                &mut ws,
                1,
                Message::TerminalOutput(OutputChunk::new(b"hello".to_vec())),
            )
            .await;

            let resize = recv_from_client(&mut ws).await.unwrap();
            assert!(matches!(
                resize,
                Message::Resize(ResizeRequest {
                    rows: 40,
                    cols: 120
                })
            ));

            let input = recv_from_client(&mut ws).await.unwrap();
            let Message::Input(chunk) = input else {
                panic!("expected input, got {input:?}");
            };
            assert_eq!(chunk.data, b"ls\n");
        });

        let conn = TerminalConnection::with_config(format!("ws://{addr}"), params, fast_config());
        let mut events = conn.subscribe();
        let mut output = conn.take_output_receiver().await.unwrap();

        assert!(!conn.resize(30, 100).await.unwrap());
        conn.connect().await;

        loop {
            match next_event(&mut events).await {
                ConnectionEvent::SessionReady { session_id, .. } => {
                    assert_eq!(session_id, expected_id);
                    break;
                }
                ConnectionEvent::RetriesExhausted | ConnectionEvent::ConnectionFrozen => {
                    panic!("connection failed");
                }
                _ => {}
            }
        }
        assert!(conn.is_connected());
        assert_eq!(conn.state().await, ConnectionState::Connected);

        let chunk = tokio::time::timeout(Duration::from_secs(5), output.recv())
            .await
            .expect("timed out waiting for output")
            .expect("output channel closed");
        assert_eq!(chunk, b"hello");

        assert!(!conn.resize(30, 100).await.unwrap());
        assert!(conn.resize(40, 120).await.unwrap());
        conn.send_input(b"ls\n").await.unwrap();

        server.await.unwrap();
        conn.dispose().await;
        assert_eq!(conn.state().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_established_loss_freezes_without_retry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        let workdir = tempfile::tempdir().unwrap();
        let params = shell_params(&workdir);

        let server_accepts = accepts.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                server_accepts.fetch_add(1, Ordering::SeqCst);
                let mut ws = accept_async(stream).await.unwrap();
                accept_handshake(&mut ws).await;
                // Drop the link abruptly.
            }
        });

        let conn = TerminalConnection::with_config(format!("ws://{addr}"), params, fast_config());
        let mut events = conn.subscribe();
        conn.connect().await;

        let mut saw_frozen = false;
        loop {
            match next_event(&mut events).await {
                ConnectionEvent::ConnectionFrozen => saw_frozen = true,
                ConnectionEvent::StateChanged(ConnectionState::Closed) => break,
                ConnectionEvent::RetryScheduled { .. } => {
                    panic!("auto-reconnect after established loss");
                }
                _ => {}
            }
        }
        assert!(saw_frozen);
        assert_eq!(conn.state().await, ConnectionState::Closed);

        // Long enough for several ladder slots; no redial may land.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(accepts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_ping_gets_pong() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let workdir = tempfile::tempdir().unwrap();
        let params = shell_params(&workdir);

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            accept_handshake(&mut ws).await;
            send_to_client(&mut ws, 1, Message::Ping).await;
            let reply = recv_from_client(&mut ws).await.unwrap();
            assert!(matches!(reply, Message::Pong));
        });

        let conn = TerminalConnection::with_config(format!("ws://{addr}"), params, fast_config());
        let mut events = conn.subscribe();
        conn.connect().await;
        loop {
            if let ConnectionEvent::SessionReady { .. } = next_event(&mut events).await {
                break;
            }
        }

        server.await.unwrap();
        conn.dispose().await;
    }

    #[tokio::test]
    async fn test_restart_mints_fresh_session_id() {
        let url = refused_url().await;
        let workdir = tempfile::tempdir().unwrap();
        let params = shell_params(&workdir);
        let original_id = params.session_id.clone();
        let conn = TerminalConnection::with_config(&url, params, fast_config());

        conn.restart().await;
        let fresh = conn.session_id().await;
        assert_ne!(fresh, original_id);
        assert_eq!(fresh.len(), 36);
        conn.dispose().await;
    }

    #[tokio::test]
    async fn test_dispose_cancels_pending_retry() {
        let url = refused_url().await;
        let workdir = tempfile::tempdir().unwrap();
        let params = shell_params(&workdir);
        let config = ClientConfig::default()
            .connect_timeout(Duration::from_secs(2))
            .retry_delay_unit(Duration::from_millis(200));
        let conn = TerminalConnection::with_config(&url, params, config);
        let mut events = conn.subscribe();
        conn.connect().await;

        loop {
            if let ConnectionEvent::RetryScheduled { .. } = next_event(&mut events).await {
                break;
            }
        }
        conn.dispose().await;
        assert_eq!(conn.state().await, ConnectionState::Closed);

        // The pending retry slot passes without any further attempt.
        tokio::time::sleep(Duration::from_millis(500)).await;
        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(
                    event,
                    ConnectionEvent::RetryScheduled { .. } | ConnectionEvent::RetriesExhausted
                ),
                "retry activity after dispose: {event:?}"
            );
        }
    }
}
