//! Wire message definitions for the AgentDeck session transport.
//!
//! Every frame on the wire is a MessagePack-encoded [`Envelope`] wrapping
//! one [`Message`]. The message enum is closed: dispatch over it is
//! exhaustiveness-checked at compile time, so a new message type cannot be
//! half-wired into a handler.

use serde::{Deserialize, Serialize};

use crate::agent::{AgentKind, SessionParams};
use crate::error::{ProtocolError, Result};

/// Current protocol version. Bumped on incompatible wire changes.
pub const PROTOCOL_VERSION: u8 = 1;

/// Ceiling for one encoded envelope on the wire, in bytes.
///
/// Transports must size their frame and message limits from this: the
/// largest legal message is an image payload carrying 70 MiB of base64,
/// which has to reach the server as a protocol message (accepted or
/// rejected with an `error` reply) rather than trip a socket-level cap.
pub const MAX_ENVELOPE_BYTES: usize = 80 * 1024 * 1024;

/// Versioned, sequenced wrapper around every message.
///
/// The sequence number is per-connection and monotonic; it exists for log
/// correlation, not for reordering (the transport already guarantees
/// in-order delivery).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version (see [`PROTOCOL_VERSION`]).
    pub version: u8,
    /// Monotonic per-connection sequence number.
    pub sequence: u64,
    /// The wrapped message.
    pub payload: Message,
}

impl Envelope {
    /// Wrap a message with the current protocol version.
    pub fn new(sequence: u64, payload: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sequence,
            payload,
        }
    }

    /// Serialize to MessagePack bytes.
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserialize from MessagePack bytes, rejecting version mismatches.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        let envelope: Envelope = rmp_serde::from_slice(bytes)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                got: envelope.version,
                expected: PROTOCOL_VERSION,
            });
        }
        Ok(envelope)
    }
}

/// All messages exchanged between client and server.
///
/// `type` carries the snake_case variant name; `data` carries the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Message {
    /// Handshake: first message on every connection, client to server.
    Open(SessionParams),
    /// Handshake acknowledgment, server to client.
    Ready(SessionReady),
    /// Raw bytes for the process input stream.
    Input(InputChunk),
    /// Terminal dimension change; ignored by the server when unchanged.
    Resize(ResizeRequest),
    /// A pasted image to persist and reference in the process input.
    Image(ImagePayload),
    /// Raw bytes produced by the process, in production order.
    TerminalOutput(OutputChunk),
    /// Acknowledgment naming a persisted artifact.
    ImageAdded(ImageAdded),
    /// Human-readable failure notice; never a stack trace or internal path.
    Error(ErrorMessage),
    /// The process ended; the session is gone.
    Exited(ProcessExit),
    /// Keepalive request.
    Ping,
    /// Keepalive response.
    Pong,
}

/// Payload of [`Message::Ready`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReady {
    /// Identifier of the session the transport is now attached to.
    pub session_id: String,
    /// Agent actually launched (may differ from the request after fallback).
    pub agent: AgentKind,
    /// Working directory the process was spawned in.
    pub workdir: String,
}

/// Payload of [`Message::Input`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputChunk {
    /// Bytes to forward verbatim to the PTY input stream.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl InputChunk {
    /// Wrap raw bytes.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }
}

/// Payload of [`Message::Resize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeRequest {
    /// Requested row count.
    pub rows: u16,
    /// Requested column count.
    pub cols: u16,
}

/// Payload of [`Message::Image`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagePayload {
    /// Base64-encoded image bytes, optionally prefixed `data:<mime>;base64,`.
    pub data: String,
    /// Suggested filename; only its extension is honored.
    pub filename: String,
}

impl ImagePayload {
    /// Encode raw bytes for transmission.
    pub fn from_bytes(bytes: &[u8], filename: impl Into<String>) -> Self {
        use base64::Engine as _;
        Self {
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
            filename: filename.into(),
        }
    }

    /// The base64 body with any data-URL prefix stripped.
    pub fn encoded_body(&self) -> &str {
        match self.data.split_once(',') {
            Some((_, body)) => body,
            None => &self.data,
        }
    }
}

/// Payload of [`Message::ImageAdded`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAdded {
    /// Path the artifact was persisted to.
    pub path: String,
    /// Filename originally suggested by the client.
    pub filename: String,
}

/// Payload of [`Message::TerminalOutput`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputChunk {
    /// Bytes exactly as the process produced them.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl OutputChunk {
    /// Wrap raw bytes.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }
}

/// Payload of [`Message::Exited`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExit {
    /// Exit code when the platform reported one.
    pub exit_code: Option<i32>,
}

/// Machine-readable error category, mirroring the server error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Executable or working directory invalid; the open call failed.
    Spawn,
    /// Network-level failure.
    Transport,
    /// Malformed message; it was dropped, the connection survives.
    Protocol,
    /// Oversized or invalid pasted artifact; the session is unaffected.
    Artifact,
    /// The operation targeted a process that already ended.
    ProcessExited,
}

/// Payload of [`Message::Error`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error category.
    pub code: ErrorCode,
    /// Human-readable description, safe to show verbatim.
    pub message: String,
    /// Whether the session remains usable after this error.
    pub recoverable: bool,
}

impl ErrorMessage {
    /// Construct an error notice.
    pub fn new(code: ErrorCode, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            recoverable,
        }
    }
}
