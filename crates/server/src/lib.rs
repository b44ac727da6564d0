//! # AgentDeck Server Library
//!
//! This crate provides the server side of AgentDeck, hosting PTY-backed
//! AI agent and shell sessions and exposing them to clients over WebSocket.
//!
//! ## Overview
//!
//! The server is the long-lived process that owns every terminal session.
//! It provides:
//!
//! - **Session Registry**: Spawn and track PTY-backed agent processes
//! - **Output Broadcasting**: Fan session output out to attached transports
//! - **Launch Profiles**: Command line and environment for each agent flavor
//! - **Image Artifacts**: Persist pasted images and hand their paths to agents
//! - **WebSocket Transport**: One connection drives one session
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   WebSocket Transport                    │
//! └───────────────┬──────────────────────────────────────────┘
//!                 │ MessagePack envelopes
//! ┌───────────────▼──────────────────────────────────────────┐
//! │                    Message Router                        │
//! └───────────────┬──────────────────────────────────────────┘
//!                 │ session operations
//! ┌───────────────▼──────────────────────────────────────────┐
//! │                   Session Registry                       │
//! │                                                          │
//! │  ┌────────────┐  ┌─────────────┐  ┌──────────────────┐   │
//! │  │ PTY handle │  │ Output pump │  │  Artifact store  │   │
//! │  └────────────┘  └─────────────┘  └──────────────────┘   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use server::session::SessionRegistry;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = Arc::new(SessionRegistry::new());
//!     registry.start_cleanup_task(30);
//!
//!     let listener = TcpListener::bind("127.0.0.1:8787").await?;
//!     server::transport::serve(listener, registry).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`launch`]: Agent launch profiles and command construction
//! - [`session`]: PTY session registry, output pump, image artifacts
//! - [`router`]: Message routing to session operations
//! - [`transport`]: WebSocket accept loop and connection bridging

pub mod config;
pub mod launch;
pub mod router;
pub mod session;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::Config;

// Re-export launch types for convenience
pub use launch::{AgentProfile, LaunchPlan};

// Re-export session types for convenience
pub use session::{
    ArtifactStore, OutputBroadcaster, SessionError, SessionId, SessionInfo, SessionManager,
    SessionRegistry,
};

// Re-export router types for convenience
pub use router::{MessageRouter, RouterError, RouterResult};

// Re-export transport entry point for convenience
pub use transport::serve;
