//! Pasted-image artifact store.
//!
//! Images arrive base64-encoded over the wire and are persisted to the OS
//! temp directory so an agent can reference them by path. Every check
//! happens before any disk write: size caps (pre- and post-decode), strict
//! base64, and an extension allow-list. A rejected image never disturbs
//! the session.

use std::path::{Path, PathBuf};

use base64::Engine as _;
use protocol::ImagePayload;
use thiserror::Error;

/// Cap on the base64 body before decoding. Base64 is ~33% larger than
/// binary, so this bounds the decode work for a ~50 MB image.
pub const MAX_ENCODED_BYTES: usize = 70 * 1024 * 1024;

/// Default cap on the decoded image.
pub const DEFAULT_MAX_DECODED_BYTES: usize = 50 * 1024 * 1024;

/// Extensions persisted as-is; anything else becomes `.png`.
const ALLOWED_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "gif", "webp"];

/// Errors from the artifact pipeline. Messages are user-facing.
#[derive(Error, Debug)]
pub enum ArtifactError {
    /// The base64 body exceeds the pre-decode cap.
    #[error("image data too large (max ~{0} MB)")]
    EncodedTooLarge(usize),

    /// The payload is not valid base64.
    #[error("invalid image data: {0}")]
    InvalidEncoding(String),

    /// The decoded image exceeds the configured cap.
    #[error("image too large (max {0} MB)")]
    DecodedTooLarge(usize),

    /// The target agent has no artifact command.
    #[error("agent does not support images")]
    Unsupported,

    /// Writing the image to disk failed.
    #[error("failed to persist image: {0}")]
    Persist(#[from] std::io::Error),
}

/// Persists pasted images into a temp directory.
pub struct ArtifactStore {
    /// Directory artifacts are written to.
    temp_dir: PathBuf,
    /// Cap on the decoded image size.
    max_decoded_bytes: usize,
}

impl ArtifactStore {
    /// Store writing to the OS temp directory with the default size cap.
    pub fn new() -> Self {
        Self::with_limits(std::env::temp_dir(), DEFAULT_MAX_DECODED_BYTES)
    }

    /// Store with an explicit directory and decoded-size cap.
    pub fn with_limits(temp_dir: PathBuf, max_decoded_bytes: usize) -> Self {
        Self {
            temp_dir,
            max_decoded_bytes,
        }
    }

    /// Validates and persists one pasted image, returning its path.
    ///
    /// The filename is named after the session (first eight id characters)
    /// plus a fresh unique suffix, so concurrent pastes never collide and a
    /// leaked file is attributable to its session.
    pub fn persist(
        &self,
        session_id: &str,
        payload: &ImagePayload,
    ) -> Result<PathBuf, ArtifactError> {
        let body = payload.encoded_body();

        if body.len() > MAX_ENCODED_BYTES {
            return Err(ArtifactError::EncodedTooLarge(
                self.max_decoded_bytes / (1024 * 1024),
            ));
        }

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(body)
            .map_err(|e| ArtifactError::InvalidEncoding(e.to_string()))?;

        if bytes.len() > self.max_decoded_bytes {
            return Err(ArtifactError::DecodedTooLarge(
                self.max_decoded_bytes / (1024 * 1024),
            ));
        }

        let ext = normalized_extension(&payload.filename);
        let sid: String = session_id.chars().take(8).collect();
        let unique: String = uuid::Uuid::new_v4().to_string().chars().take(8).collect();
        let path = self.temp_dir.join(format!("ai_image_{sid}_{unique}{ext}"));

        std::fs::write(&path, &bytes)?;
        tracing::debug!(
            session_id = %session_id,
            path = %path.display(),
            bytes = bytes.len(),
            "persisted pasted image"
        );
        Ok(path)
    }
}

impl Default for ArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Deletes session artifacts. Failures are logged and swallowed; cleanup
/// must never turn a session close into an error.
pub fn cleanup_artifacts(paths: Vec<PathBuf>) {
    for path in paths {
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed session artifact"),
            Err(e) => tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to remove session artifact"
            ),
        }
    }
}

/// The extension to persist under, dot included.
///
/// Extensions outside the allow-list (checked case-insensitively) and
/// missing extensions are coerced to `.png`.
fn normalized_extension(filename: &str) -> String {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    if !ext.is_empty() && ALLOWED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
        format!(".{ext}")
    } else {
        ".png".to_string()
    }
}
