//! # AgentDeck Client Library
//!
//! This crate provides the embeddable client core of AgentDeck: everything a
//! frontend needs to drive a server-side terminal session over WebSocket,
//! minus the rendering itself.
//!
//! ## Overview
//!
//! - **Connection**: Per-terminal state machine with a bounded retry ladder
//!   during establishment and freeze-on-loss once a session is live
//! - **Delivery**: Frame-aligned output coalescing that respects the user's
//!   scroll position
//! - **Automation**: Opt-in auto-continue loop for unattended agent runs
//! - **Restore**: Saved-session persistence that never reuses a session id
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                      Frontend                        │
//! └────────▲───────────────────────────┬─────────────────┘
//!          │ coalesced writes          │ input / resize
//! ┌────────┴────────┐         ┌────────▼─────────────────┐
//! │  Delivery loop  │◄────────┤    TerminalConnection    │
//! └─────────────────┘  output │  handshake + retry +     │
//!                             │  frame bridging          │
//!                             └────────┬─────────────────┘
//!                                      │ MessagePack envelopes
//!                                      ▼
//!                             AgentDeck server
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use client::{ConnectionEvent, TerminalConnection};
//! use client::protocol::{AgentKind, SessionParams};
//!
//! #[tokio::main]
//! async fn main() {
//!     let params = SessionParams::new("/home/user/project", AgentKind::Claude);
//!     let conn = TerminalConnection::new("ws://127.0.0.1:8787", params);
//!
//!     let mut events = conn.subscribe();
//!     let mut output = conn.take_output_receiver().await.unwrap();
//!     conn.connect().await;
//!
//!     tokio::spawn(async move {
//!         while let Some(chunk) = output.recv().await {
//!             print!("{}", String::from_utf8_lossy(&chunk));
//!         }
//!     });
//!
//!     while let Ok(event) = events.recv().await {
//!         if let ConnectionEvent::SessionReady { session_id, .. } = event {
//!             println!("session {session_id} is live");
//!             conn.send_input(b"hello\n").await.ok();
//!         }
//!     }
//! }
//! ```
//!
//! ## Modules
//!
//! - [`connection`]: Connection state machine, handshake, retry ladder
//! - [`delivery`]: Output coalescing and scroll-pin policy
//! - [`automation`]: Auto-continue loop with hard stop conditions
//! - [`restore`]: Saved-session persistence and restore

pub mod automation;
pub mod connection;
pub mod delivery;
pub mod restore;

// Re-export protocol for convenience
pub use protocol;

// Re-export connection types for convenience
pub use connection::{
    ClientConfig, ClientError, ConnectionEvent, ConnectionState, TerminalConnection,
};

// Re-export delivery types for convenience
pub use delivery::{deliver_output, spawn_delivery_loop, OutputSink, FLUSH_INTERVAL};

// Re-export automation types for convenience
pub use automation::{AutomationConfig, AutomationOutcome};

// Re-export restore types for convenience
pub use restore::{load_terminals, restore_terminals, save_terminals, RestoredTerminal, SavedTerminal};
