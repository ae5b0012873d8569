//! Where downloaded videos live.

use std::path::{Path, PathBuf};

use super::TransferError;

/// Final file extension of a downloaded video.
const VIDEO_EXTENSION: &str = "mp4";

/// Suffix of an in-progress file.
const PARTIAL_SUFFIX: &str = ".part";

/// Layout of the download directory: `<dir>/<user_id>/<media_item_id>.mp4`
/// with a `.part` sibling while the transfer runs.
///
/// Each user owns a subdirectory, so deleting one user's copy of an item never
/// touches another user's file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadPaths {
    dir: PathBuf,
}

impl DownloadPaths {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory holding `user_id`'s videos.
    #[must_use]
    pub fn user_dir(&self, user_id: &str) -> PathBuf {
        self.dir.join(file_stem(user_id))
    }

    /// Path of `user_id`'s completed video for `media_item_id`.
    #[must_use]
    pub fn final_path(&self, user_id: &str, media_item_id: &str) -> PathBuf {
        self.user_dir(user_id)
            .join(format!("{}.{VIDEO_EXTENSION}", file_stem(media_item_id)))
    }

    /// Path of the partial file written while transferring `media_item_id` for `user_id`.
    #[must_use]
    pub fn partial_path(&self, user_id: &str, media_item_id: &str) -> PathBuf {
        self.user_dir(user_id).join(format!(
            "{}.{VIDEO_EXTENSION}{PARTIAL_SUFFIX}",
            file_stem(media_item_id)
        ))
    }

    /// Creates the download directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Io`] if the directory cannot be created.
    pub async fn ensure_dir(&self) -> Result<(), TransferError> {
        create_dir(&self.dir).await
    }

    /// Creates `user_id`'s subdirectory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Io`] if the directory cannot be created.
    pub async fn ensure_user_dir(&self, user_id: &str) -> Result<(), TransferError> {
        create_dir(&self.user_dir(user_id)).await
    }
}

async fn create_dir(dir: &Path) -> Result<(), TransferError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| TransferError::io(dir, e))
}

/// Maps a content id to a safe file stem; ids are opaque and may contain separators.
fn file_stem(media_item_id: &str) -> String {
    let sanitized: String = media_item_id
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = sanitized.trim_matches(|c: char| c == '.' || c.is_whitespace());
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Removes a file, ignoring a file that is already gone.
pub(crate) async fn remove_if_exists(path: &Path) -> Result<(), TransferError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(TransferError::io(path, e)),
    }
}
