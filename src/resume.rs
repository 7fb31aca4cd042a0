//! Checkpoints for conversations that ended partial.
//!
//! A checkpoint holds the messages fetched so far together with the
//! cursor to continue from. Both are written as one file, replaced
//! atomically, so a crash never leaves messages without their cursor or
//! the other way round.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::model::{Conversation, ExportResult, Message, Timestamp};
use crate::output::{read_json, write_json_atomic};
use crate::{AppError, Result};

/// Where a partial conversation export stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePoint {
    /// Cursor of the first history page not yet delivered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_cursor: Option<String>,
    /// History reached its terminal page; only threads are left.
    #[serde(default)]
    pub history_done: bool,
    /// Thread parents whose replies could not be fetched.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_threads: Vec<Timestamp>,
}

impl ResumePoint {
    /// Nothing fetched yet; resuming equals starting over.
    pub fn is_start(&self) -> bool {
        self.history_cursor.is_none() && !self.history_done && self.pending_threads.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub conversation: Conversation,
    pub display_name: String,
    pub resume: ResumePoint,
    pub reason: String,
    pub saved_at: DateTime<Utc>,
    pub messages: Vec<Message>,
}

impl Checkpoint {
    pub fn new(result: &ExportResult, resume: ResumePoint, reason: impl Into<String>) -> Self {
        Self {
            conversation: result.conversation.clone(),
            display_name: result.display_name.clone(),
            resume,
            reason: reason.into(),
            saved_at: Utc::now(),
            messages: result.messages().cloned().collect(),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation.id
    }
}

/// One JSON file per conversation under a workspace directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, conversation_id: &str) -> PathBuf {
        self.dir.join(format!("{conversation_id}.json"))
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.path(checkpoint.conversation_id());
        write_json_atomic(&path, checkpoint)?;
        debug!(
            conversation = checkpoint.conversation_id(),
            messages = checkpoint.messages.len(),
            "checkpoint saved"
        );
        Ok(())
    }

    pub fn load(&self, conversation_id: &str) -> Result<Option<Checkpoint>> {
        let path = self.path(conversation_id);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    pub fn remove(&self, conversation_id: &str) -> Result<()> {
        let path = self.path(conversation_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::WriteFile {
                path: path.display().to_string(),
                source: e,
            }),
        }
    }

    /// Every readable checkpoint, oldest first. Unreadable files are
    /// skipped with a warning.
    pub fn list(&self) -> Result<Vec<Checkpoint>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut checkpoints = Vec::new();
        for entry in WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| AppError::Io(e.into()))?;
            let path = entry.path();
            let is_checkpoint = entry.file_type().is_file()
                && path.extension().is_some_and(|ext| ext == "json")
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_checkpoint {
                continue;
            }
            match read_json::<Checkpoint>(path) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable checkpoint"),
            }
        }
        checkpoints.sort_by(|a, b| a.saved_at.cmp(&b.saved_at));
        Ok(checkpoints)
    }
}
