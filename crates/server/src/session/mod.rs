//! Session management module.
//!
//! This module owns process-sessions end to end: spawning agent processes
//! on PTYs, pumping their output to attached transports, persisting pasted
//! images, and reaping sessions once their process dies or nobody is
//! attached anymore.

pub mod artifacts;
pub mod broadcaster;
pub mod manager;
pub mod pty;
pub mod pump;

pub use artifacts::{cleanup_artifacts, ArtifactError, ArtifactStore};
pub use broadcaster::{OutputBroadcaster, TransportHandle, TransportId, TransportStats};
pub use manager::{SessionInfo, SessionManager, SessionRegistry, StoredArtifact};
pub use pty::{clamp_dimensions, ProcessHandle, SessionError, SessionId};
pub use pump::pump_output;
