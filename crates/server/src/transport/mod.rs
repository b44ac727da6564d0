//! Transport layer binding sessions to remote clients over WebSocket.

pub mod ws;

pub use ws::serve;
