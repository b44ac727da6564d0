//! Agent kinds and session handshake parameters.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role label applied when the client does not specify one.
pub const DEFAULT_ROLE: &str = "General";

/// Terminal dimensions used at spawn time, before the client reports
/// its real viewport with a resize message.
pub const DEFAULT_ROWS: u16 = 24;
/// See [`DEFAULT_ROWS`].
pub const DEFAULT_COLS: u16 = 80;

/// The fixed set of CLI agents a session can run, or a plain shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Anthropic Claude Code CLI.
    Claude,
    /// Google Gemini CLI.
    Gemini,
    /// OpenAI Codex CLI.
    Codex,
    /// OpenCode CLI.
    Opencode,
    /// The user's login shell.
    Shell,
}

impl AgentKind {
    /// All supported kinds, in display order.
    pub const ALL: [AgentKind; 5] = [
        AgentKind::Claude,
        AgentKind::Gemini,
        AgentKind::Codex,
        AgentKind::Opencode,
        AgentKind::Shell,
    ];

    /// The lowercase identifier used on the wire and in launch profiles.
    pub fn id(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Gemini => "gemini",
            AgentKind::Codex => "codex",
            AgentKind::Opencode => "opencode",
            AgentKind::Shell => "shell",
        }
    }

    /// Parse an identifier, falling back to [`AgentKind::Claude`] for
    /// anything unknown. A stale client build must not be locked out by
    /// an enum mismatch.
    pub fn from_str_lossy(s: &str) -> AgentKind {
        s.parse().unwrap_or(AgentKind::Claude)
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for AgentKind {
    type Err = UnknownAgentKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "claude" => Ok(AgentKind::Claude),
            "gemini" => Ok(AgentKind::Gemini),
            "codex" => Ok(AgentKind::Codex),
            "opencode" => Ok(AgentKind::Opencode),
            "shell" => Ok(AgentKind::Shell),
            _ => Err(UnknownAgentKind(s.to_string())),
        }
    }
}

/// Error returned when parsing an unrecognized agent identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown agent kind: {0}")]
pub struct UnknownAgentKind(pub String);

/// Handshake parameters carried in the first message of every connection.
///
/// The session identifier is an opaque unique token; clients mint a fresh
/// UUID v4 per logical terminal and never reuse one across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionParams {
    /// Opaque session identifier.
    pub session_id: String,
    /// Absolute working directory for the spawned process.
    pub workdir: PathBuf,
    /// Which CLI agent (or shell) to run. An unrecognized or missing
    /// identifier opens a claude session instead of failing the
    /// handshake, so a stale client build is never locked out.
    #[serde(default = "default_agent", deserialize_with = "agent_kind_lossy")]
    pub agent: AgentKind,
    /// Free-form persona label; `"General"` means no persona.
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_agent() -> AgentKind {
    AgentKind::Claude
}

fn default_role() -> String {
    DEFAULT_ROLE.to_string()
}

fn agent_kind_lossy<'de, D>(deserializer: D) -> Result<AgentKind, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(AgentKind::from_str_lossy(&raw))
}

impl SessionParams {
    /// Create parameters with a freshly minted session identifier and the
    /// default role.
    pub fn new(workdir: impl Into<PathBuf>, agent: AgentKind) -> Self {
        Self {
            session_id: mint_session_id(),
            workdir: workdir.into(),
            agent,
            role: DEFAULT_ROLE.to_string(),
        }
    }

    /// Set the persona label.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Whether the session identifier is a well-formed UUID v4.
    ///
    /// Agents with native session tracking (Claude) receive their session
    /// argument only for valid v4 identifiers; anything else still opens a
    /// session but skips that argument.
    pub fn has_valid_session_uuid(&self) -> bool {
        matches!(
            Uuid::parse_str(&self.session_id).map(|u| u.get_version_num()),
            Ok(4)
        )
    }
}

/// Mint a new globally unique session identifier.
pub fn mint_session_id() -> String {
    Uuid::new_v4().to_string()
}
