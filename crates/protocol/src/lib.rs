//! # AgentDeck Protocol Library
//!
//! This crate provides the wire protocol shared by the AgentDeck server and
//! client crates.
//!
//! ## Overview
//!
//! The protocol crate is the foundation of AgentDeck's communication layer,
//! providing:
//!
//! - **Message Definitions**: All session transport message types
//! - **Session Parameters**: Agent kinds, roles, and session identifiers
//! - **Envelope Codec**: Versioned MessagePack encoding for every frame
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Application Messages           │  tagged Message enum
//! ├─────────────────────────────────────────┤
//! │              Envelope                   │  version + sequence
//! ├─────────────────────────────────────────┤
//! │             MessagePack                 │  rmp-serde, named fields
//! ├─────────────────────────────────────────┤
//! │        Transport (WebSocket)            │  one envelope per frame
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{AgentKind, Envelope, Message, SessionParams};
//!
//! // Describe the session to open
//! let params = SessionParams::new("/home/dev/project", AgentKind::Claude);
//!
//! // Wrap it in a sequenced envelope
//! let envelope = Envelope::new(1, Message::Open(params));
//!
//! // Serialize to MessagePack for the wire
//! let bytes = envelope.to_msgpack().unwrap();
//! let decoded = Envelope::from_msgpack(&bytes).unwrap();
//! assert_eq!(decoded.sequence, 1);
//! ```
//!
//! ## Modules
//!
//! - [`agent`]: Agent kinds, roles, and session parameters
//! - [`messages`]: Protocol message definitions and the envelope codec
//! - [`error`]: Error types

pub mod agent;
pub mod error;
pub mod messages;

pub use agent::{
    mint_session_id, AgentKind, SessionParams, DEFAULT_COLS, DEFAULT_ROLE, DEFAULT_ROWS,
};
pub use error::{ProtocolError, Result};
pub use messages::{
    Envelope, ErrorCode, ErrorMessage, ImageAdded, ImagePayload, InputChunk, Message, OutputChunk,
    ProcessExit, ResizeRequest, SessionReady, MAX_ENVELOPE_BYTES, PROTOCOL_VERSION,
};
