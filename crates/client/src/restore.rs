//! Saved-session restore.
//!
//! Frontends persist the terminals a user had open and bring them back on
//! the next launch. A persisted session id is never dialed again: the agent
//! CLIs reject a connection under an id they consider live, so restore mints
//! a fresh id per terminal and only reports the old one back for bookkeeping.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use protocol::{AgentKind, SessionParams};
use serde::{Deserialize, Serialize};

/// One persisted terminal, as written to the saved-sessions file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedTerminal {
    /// Session id the terminal ran under when it was saved.
    pub session_id: String,
    /// Working directory the terminal was opened in.
    pub workdir: PathBuf,
    /// Agent the terminal was running.
    pub agent: AgentKind,
    /// Persona role attached to the terminal.
    pub role: String,
}

impl SavedTerminal {
    /// Snapshots the parameters of a live terminal for persistence.
    pub fn from_params(params: &SessionParams) -> Self {
        Self {
            session_id: params.session_id.clone(),
            workdir: params.workdir.clone(),
            agent: params.agent,
            role: params.role.clone(),
        }
    }
}

/// A terminal ready to be reopened after restore.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredTerminal {
    /// Id the terminal ran under before; only for caller bookkeeping.
    pub previous_session_id: String,
    /// Connection parameters carrying a freshly minted session id.
    pub params: SessionParams,
}

/// Builds connection parameters for every saved terminal, in order.
///
/// Every restored terminal gets a brand-new session id.
pub fn restore_terminals(saved: &[SavedTerminal]) -> Vec<RestoredTerminal> {
    saved
        .iter()
        .map(|terminal| RestoredTerminal {
            previous_session_id: terminal.session_id.clone(),
            params: SessionParams::new(terminal.workdir.clone(), terminal.agent)
                .with_role(terminal.role.clone()),
        })
        .collect()
}

/// Reads the saved-sessions file; a missing file means nothing was saved.
pub fn load_terminals<P: AsRef<Path>>(path: P) -> Result<Vec<SavedTerminal>> {
    let path = path.as_ref();

    if !path.exists() {
        tracing::debug!("Saved-sessions file not found at {:?}", path);
        return Ok(Vec::new());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read saved-sessions file: {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Invalid saved-sessions file: {}", path.display()))
}

/// Writes the saved-sessions file, creating parent directories as needed.
pub fn save_terminals<P: AsRef<Path>>(path: P, terminals: &[SavedTerminal]) -> Result<()> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create sessions directory: {}", parent.display())
        })?;
    }

    let contents = serde_json::to_string_pretty(terminals)?;
    fs::write(path, contents)
        .with_context(|| format!("Failed to write saved-sessions file: {}", path.display()))?;

    tracing::debug!("Saved {} terminal(s) to {:?}", terminals.len(), path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn saved(session_id: &str, role: &str) -> SavedTerminal {
        SavedTerminal {
            session_id: session_id.to_string(),
            workdir: PathBuf::from("/tmp/project"),
            agent: AgentKind::Claude,
            role: role.to_string(),
        }
    }

    #[test]
    fn test_restore_mints_fresh_session_ids() {
        let old = "11111111-2222-3333-4444-555555555555";
        let restored = restore_terminals(&[saved(old, "Dev")]);
        assert_eq!(restored.len(), 1);

        let terminal = &restored[0];
        assert_eq!(terminal.previous_session_id, old);
        assert_ne!(terminal.params.session_id, old);
        assert!(terminal.params.has_valid_session_uuid());
        assert_eq!(terminal.params.workdir, PathBuf::from("/tmp/project"));
        assert_eq!(terminal.params.agent, AgentKind::Claude);
        assert_eq!(terminal.params.role, "Dev");
    }

    #[test]
    fn test_restored_terminals_get_distinct_ids() {
        let restored = restore_terminals(&[saved("old-a", "PM"), saved("old-b", "QA")]);
        assert_eq!(restored.len(), 2);
        assert_ne!(restored[0].params.session_id, restored[1].params.session_id);
        assert_eq!(restored[0].previous_session_id, "old-a");
        assert_eq!(restored[1].previous_session_id, "old-b");
    }

    #[test]
    fn test_from_params_snapshots_current_state() {
        let params = SessionParams::new("/work", AgentKind::Shell).with_role("QA");
        let snapshot = SavedTerminal::from_params(&params);
        assert_eq!(snapshot.session_id, params.session_id);
        assert_eq!(snapshot.workdir, PathBuf::from("/work"));
        assert_eq!(snapshot.agent, AgentKind::Shell);
        assert_eq!(snapshot.role, "QA");
    }

    #[test]
    fn test_saved_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let terminals = vec![saved("id-one", "General"), saved("id-two", "Dev")];

        save_terminals(&path, &terminals).unwrap();
        let loaded = load_terminals(&path).unwrap();
        assert_eq!(loaded, terminals);
    }

    #[test]
    fn test_save_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state").join("sessions.json");

        save_terminals(&path, &[saved("id", "General")]).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_load_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_terminals(dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_load_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        fs::write(&path, "not json").unwrap();
        assert!(load_terminals(&path).is_err());
    }
}
