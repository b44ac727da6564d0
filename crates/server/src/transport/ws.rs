//! WebSocket transport: accept loop and per-connection session bridging.
//!
//! Every connection serves exactly one session, named in the open request
//! that must arrive as the first frame. After the handshake the connection
//! becomes the session's sole transport; a newer connection for the same
//! session displaces it. A dropped connection only detaches, the process
//! keeps running for the next transport to pick up.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{
    Envelope, ErrorCode, ErrorMessage, Message, SessionParams, SessionReady, MAX_ENVELOPE_BYTES,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{accept_async_with_config, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::router::{MessageRouter, RouterError};
use crate::session::{SessionId, SessionManager, SessionRegistry};

/// How long a fresh connection may take to present its open request.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// Socket limits sized to the largest legal envelope.
///
/// The stock 16 MiB frame cap would sever the connection on a full-size
/// image upload before the artifact store ever saw it.
fn socket_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(MAX_ENVELOPE_BYTES),
        max_frame_size: Some(MAX_ENVELOPE_BYTES),
        ..WebSocketConfig::default()
    }
}

/// Accepts WebSocket connections forever, one task per connection.
pub async fn serve(listener: TcpListener, registry: Arc<SessionRegistry>) {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "listening for session transports");
    }

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    match accept_async_with_config(stream, Some(socket_config())).await {
                        Ok(ws) => handle_connection(ws, addr, registry).await,
                        Err(e) => {
                            warn!(peer = %addr, error = %e, "websocket handshake failed");
                        }
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "accept error");
            }
        }
    }
}

/// Drives one WebSocket connection from handshake to detach.
async fn handle_connection(
    ws: WebSocketStream<TcpStream>,
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
) {
    let (mut sink, mut stream) = ws.split();
    let mut sequence: u64 = 0;

    let Some(params) = read_open(&mut stream, addr).await else {
        return;
    };
    let session_id = params.session_id.clone();

    let (info, was_existing) = match registry.open(params).await {
        Ok(opened) => opened,
        Err(e) => {
            warn!(peer = %addr, session_id = %session_id, error = %e, "open failed");
            let notice = RouterError::from(e).to_error_message();
            let _ = send_message(&mut sink, &mut sequence, Message::Error(notice)).await;
            return;
        }
    };

    let transport_id = Uuid::new_v4().to_string();
    let mut output_rx = match registry
        .attach_exclusive(&session_id, transport_id.clone())
        .await
    {
        Ok(rx) => rx,
        Err(e) => {
            // The session died between open and attach.
            warn!(peer = %addr, session_id = %session_id, error = %e, "attach failed");
            let notice = RouterError::from(e).to_error_message();
            let _ = send_message(&mut sink, &mut sequence, Message::Error(notice)).await;
            return;
        }
    };

    info!(
        peer = %addr,
        session_id = %session_id,
        transport_id = %transport_id,
        was_existing,
        "transport attached"
    );

    let ready = Message::Ready(SessionReady {
        session_id: info.id.clone(),
        agent: info.agent,
        workdir: info.workdir.clone(),
    });
    if send_message(&mut sink, &mut sequence, ready).await.is_err() {
        registry.detach(&session_id, &transport_id).await;
        return;
    }

    let router = MessageRouter::new(Arc::clone(&registry));

    loop {
        tokio::select! {
            outbound = output_rx.recv() => {
                match outbound {
                    Some(message) => {
                        if send_message(&mut sink, &mut sequence, message).await.is_err() {
                            break;
                        }
                    }
                    // Queue closed: displaced by a newer transport or the
                    // session ended.
                    None => {
                        debug!(session_id = %session_id, "output queue closed");
                        break;
                    }
                }
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        if handle_frame(&router, &session_id, &bytes, &mut sink, &mut sequence)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        if sink.send(WsMessage::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Text(_))) => {
                        let notice = ErrorMessage::new(
                            ErrorCode::Protocol,
                            "binary frames required",
                            true,
                        );
                        if send_message(&mut sink, &mut sequence, Message::Error(notice))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        debug!(peer = %addr, session_id = %session_id, "client hung up");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(peer = %addr, session_id = %session_id, error = %e, "transport error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    // Detach only. The session keeps running for the next transport.
    registry.detach(&session_id, &transport_id).await;
    info!(peer = %addr, session_id = %session_id, "transport detached");
}

/// Reads the first frame, which must be a binary-encoded open request.
async fn read_open(stream: &mut WsStream, addr: SocketAddr) -> Option<SessionParams> {
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.next()).await {
        Ok(Some(Ok(WsMessage::Binary(bytes)))) => match Envelope::from_msgpack(&bytes) {
            Ok(envelope) => match envelope.payload {
                Message::Open(params) => Some(params),
                _ => {
                    warn!(peer = %addr, "first message was not an open request");
                    None
                }
            },
            Err(e) => {
                warn!(peer = %addr, error = %e, "invalid open frame");
                None
            }
        },
        Ok(Some(Ok(_))) => {
            warn!(peer = %addr, "expected binary open frame");
            None
        }
        Ok(Some(Err(e))) => {
            warn!(peer = %addr, error = %e, "transport error during handshake");
            None
        }
        Ok(None) => {
            debug!(peer = %addr, "connection closed before handshake");
            None
        }
        Err(_) => {
            warn!(
                peer = %addr,
                timeout_secs = HANDSHAKE_TIMEOUT.as_secs(),
                "handshake timeout"
            );
            None
        }
    }
}

/// Decodes one inbound frame, routes it, and sends back whatever reply or
/// error notice results. Only a sink failure ends the connection.
async fn handle_frame(
    router: &MessageRouter<SessionRegistry>,
    session_id: &SessionId,
    bytes: &[u8],
    sink: &mut WsSink,
    sequence: &mut u64,
) -> Result<(), WsError> {
    let message = match Envelope::from_msgpack(bytes) {
        Ok(envelope) => envelope.payload,
        Err(e) => {
            debug!(session_id = %session_id, error = %e, "dropping undecodable frame");
            let notice =
                ErrorMessage::new(ErrorCode::Protocol, format!("invalid frame: {e}"), true);
            return send_message(sink, sequence, Message::Error(notice)).await;
        }
    };

    match router.route(message, session_id).await {
        Ok(Some(reply)) => send_message(sink, sequence, reply).await,
        Ok(None) => Ok(()),
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "request failed");
            send_message(sink, sequence, Message::Error(e.to_error_message())).await
        }
    }
}

/// Wraps a message in the next-numbered envelope and sends it.
async fn send_message(
    sink: &mut WsSink,
    sequence: &mut u64,
    message: Message,
) -> Result<(), WsError> {
    let envelope = Envelope::new(*sequence, message);
    *sequence += 1;
    match envelope.to_msgpack() {
        Ok(bytes) => sink.send(WsMessage::Binary(bytes)).await,
        Err(e) => {
            warn!(error = %e, "failed to encode outbound frame");
            Ok(())
        }
    }
}
