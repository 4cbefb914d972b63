//! # Screenshot Store
//!
//! Proctoring captures are written to
//! `<root>/<interview_id>/<user_id>/screenshot-<timestamp>.png`. Each capture
//! gets its own timestamp-qualified file, so concurrent writers for the same
//! room never touch the same path.

use crate::error::ScreenshotError;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;

const FILE_PREFIX: &str = "screenshot-";
const FILE_EXTENSION: &str = ".png";

/// A screenshot ready to be written.
#[derive(Debug, Clone)]
pub struct Screenshot {
    /// Room directory the capture goes into.
    pub interview_id: String,

    /// Participant directory under the room.
    pub user_id: String,

    /// Raw timestamp; sanitized into the filename.
    pub timestamp: String,

    /// PNG bytes.
    pub data: Vec<u8>,
}

/// Listing entry returned by the screenshot API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotEntry {
    /// Participant the capture belongs to.
    pub user_id: String,

    /// File name, e.g. `screenshot-2024-01-01T10-00-00-000Z.png`.
    pub filename: String,

    /// Download path under `/api/interviews/...`.
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct ScreenshotStore {
    root: PathBuf,
}

impl ScreenshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where a capture for `(interview_id, user_id, timestamp)` lives.
    pub fn path_for(
        &self,
        interview_id: &str,
        user_id: &str,
        timestamp: &str,
    ) -> Result<PathBuf, ScreenshotError> {
        let filename = filename_for(timestamp);
        Ok(self
            .root
            .join(check_component(interview_id)?)
            .join(check_component(user_id)?)
            .join(check_component(&filename)?))
    }

    /// Writes a capture, creating missing parent directories first.
    pub async fn save(&self, shot: &Screenshot) -> Result<PathBuf, ScreenshotError> {
        let path = self.path_for(&shot.interview_id, &shot.user_id, &shot.timestamp)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, &shot.data).await?;
        Ok(path)
    }

    /// Lists every stored capture of an interview, sorted by user then
    /// filename. An interview without captures yields an empty list.
    pub async fn list(&self, interview_id: &str) -> Result<Vec<ScreenshotEntry>, ScreenshotError> {
        let interview_dir = self.root.join(check_component(interview_id)?);
        let mut entries = Vec::new();

        let mut users = match fs::read_dir(&interview_dir).await {
            Ok(users) => users,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };

        while let Some(user_dir) = users.next_entry().await? {
            if !user_dir.file_type().await?.is_dir() {
                continue;
            }
            let Ok(user_id) = user_dir.file_name().into_string() else {
                continue;
            };

            let mut files = fs::read_dir(user_dir.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let Ok(filename) = file.file_name().into_string() else {
                    continue;
                };
                if !filename.ends_with(FILE_EXTENSION) {
                    continue;
                }
                entries.push(ScreenshotEntry {
                    url: format!("/api/interviews/{interview_id}/screenshots/{user_id}/{filename}"),
                    user_id: user_id.clone(),
                    filename,
                });
            }
        }

        entries.sort_by(|a, b| (&a.user_id, &a.filename).cmp(&(&b.user_id, &b.filename)));
        Ok(entries)
    }

    /// Reads one stored capture.
    pub async fn read(
        &self,
        interview_id: &str,
        user_id: &str,
        filename: &str,
    ) -> Result<Vec<u8>, ScreenshotError> {
        if !filename.ends_with(FILE_EXTENSION) {
            return Err(ScreenshotError::InvalidComponent(filename.to_string()));
        }
        let path = self
            .root
            .join(check_component(interview_id)?)
            .join(check_component(user_id)?)
            .join(check_component(filename)?);
        Ok(fs::read(path).await?)
    }
}

/// `2024-01-01T10:00:00.000Z` becomes `screenshot-2024-01-01T10-00-00-000Z.png`.
pub fn filename_for(timestamp: &str) -> String {
    format!(
        "{FILE_PREFIX}{}{FILE_EXTENSION}",
        timestamp.trim().replace([':', '.'], "-")
    )
}

/// Rejects anything that could escape its directory.
fn check_component(value: &str) -> Result<&str, ScreenshotError> {
    let invalid = value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\', '\0']);
    if invalid {
        Err(ScreenshotError::InvalidComponent(value.to_string()))
    } else {
        Ok(value)
    }
}
