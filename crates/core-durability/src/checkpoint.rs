//! Write-ahead checkpoint log for crash recovery
//!
//! Pattern:
//! 1. Write a checkpoint before starting an operation
//! 2. Execute the operation
//! 3. Write a checkpoint after completing it
//! 4. On startup, find incomplete checkpoints and resume
//!
//! One append-only JSONL file per logical domain (`jobs.jsonl`,
//! `pipelines.jsonl`). A sidecar `<name>.index.json` stores the latest entry
//! per id for O(1) lookup; it is rebuilt from the log when missing or
//! corrupt. Appends are flushed and fsynced before returning; a write that
//! hasn't hit the disk didn't happen.
//!
//! # Example
//!
//! ```no_run
//! use lumen_core_durability::CheckpointManager;
//!
//! # fn example() -> std::io::Result<()> {
//! let mut checkpoint = CheckpointManager::new("jobs", ".checkpoints")?;
//!
//! checkpoint.write("job-1", "started", 0, None, None, serde_json::json!({"model": "kling"}))?;
//! // ... do the work ...
//! checkpoint.mark_complete("job-1", Some(serde_json::json!({"video_url": "https://…"})))?;
//!
//! // On startup
//! for entry in checkpoint.read_incomplete() {
//!     // requeue entry.id
//! }
//! # Ok(())
//! # }
//! ```

use crate::file_lock::FileLock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Bounded wait for the append lock when multi-writer mode is on
const APPEND_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Statuses that mean the operation was interrupted mid-flight
const INCOMPLETE_STATUSES: [&str; 3] = ["started", "running", "in_progress"];

/// A single checkpoint entry. One JSON object per line in the log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointEntry {
    pub id: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub step: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub context: Value,
}

/// Append-only JSONL checkpoint log with an in-memory latest-per-id index.
pub struct CheckpointManager {
    name: String,
    checkpoint_file: PathBuf,
    index_file: PathBuf,
    index: HashMap<String, CheckpointEntry>,
    append_lock: Option<FileLock>,
}

impl CheckpointManager {
    /// Open (or create) the checkpoint set `<dir>/<name>.jsonl`.
    ///
    /// Loads the cached index when present, otherwise rebuilds it by
    /// scanning the log.
    pub fn new(name: impl Into<String>, dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let name = name.into();
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let mut manager = Self {
            checkpoint_file: dir.join(format!("{}.jsonl", name)),
            index_file: dir.join(format!("{}.index.json", name)),
            name,
            index: HashMap::new(),
            append_lock: None,
        };
        manager.load_index();
        Ok(manager)
    }

    /// Guard appends with a cross-process file lock under `lock_dir`.
    ///
    /// Needed only when several processes write the same checkpoint set
    /// (e.g. the worker and an out-of-band recovery job).
    pub fn with_locking(mut self, lock_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let lock = FileLock::new(format!("checkpoint_{}", self.name), lock_dir)
            .map_err(std::io::Error::other)?;
        self.append_lock = Some(lock);
        Ok(self)
    }

    fn load_index(&mut self) {
        if self.index_file.exists() {
            match std::fs::read_to_string(&self.index_file) {
                Ok(raw) => match serde_json::from_str::<HashMap<String, CheckpointEntry>>(&raw) {
                    Ok(map) => {
                        self.index = map;
                        debug!(name = %self.name, count = self.index.len(), "loaded checkpoint index");
                        return;
                    }
                    Err(e) => warn!(name = %self.name, error = %e, "failed to parse index, rebuilding"),
                },
                Err(e) => warn!(name = %self.name, error = %e, "failed to read index, rebuilding"),
            }
        }
        self.rebuild_index();
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        let Ok(file) = File::open(&self.checkpoint_file) else {
            return;
        };

        for line in BufReader::new(file).lines() {
            let Ok(line) = line else { break };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<CheckpointEntry>(line) {
                Ok(entry) => {
                    self.index.insert(entry.id.clone(), entry);
                }
                Err(e) => warn!(name = %self.name, error = %e, "skipping corrupt checkpoint line"),
            }
        }

        self.save_index();
        info!(name = %self.name, count = self.index.len(), "rebuilt checkpoint index");
    }

    fn save_index(&self) {
        match serde_json::to_string(&self.index) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.index_file, json) {
                    warn!(name = %self.name, error = %e, "failed to save checkpoint index");
                }
            }
            Err(e) => warn!(name = %self.name, error = %e, "failed to serialize checkpoint index"),
        }
    }


    /// Write a checkpoint entry and update the index.
    pub fn write(
        &mut self,
        id: impl Into<String>,
        status: impl Into<String>,
        step: u32,
        result: Option<Value>,
        error: Option<String>,
        context: Value,
    ) -> std::io::Result<CheckpointEntry> {
        let entry = CheckpointEntry {
            id: id.into(),
            status: status.into(),
            timestamp: Utc::now(),
            step,
            result,
            error,
            context,
        };

        let line = serde_json::to_string(&entry).map_err(std::io::Error::other)?;

        let append_result = match self.append_lock.as_mut() {
            Some(lock) => {
                lock.acquire(APPEND_LOCK_TIMEOUT).map_err(std::io::Error::other)?;
                let result = append_line(&self.checkpoint_file, &line);
                lock.release();
                result
            }
            None => append_line(&self.checkpoint_file, &line),
        };
        if let Err(e) = append_result {
            error!(name = %self.name, id = %entry.id, error = %e, "failed to write checkpoint");
            return Err(e);
        }

        debug!(
            name = %self.name,
            id = %entry.id,
            status = %entry.status,
            step = entry.step,
            "checkpoint written"
        );

        self.index.insert(entry.id.clone(), entry.clone());
        // Keep the sidecar current so a restart can trust it; the log scan
        // remains the fallback when it is missing or corrupt.
        self.save_index();
        Ok(entry)
    }

    /// Latest checkpoint for an id
    pub fn read(&self, id: &str) -> Option<&CheckpointEntry> {
        self.index.get(id)
    }

    /// Latest checkpoint per id, all of them
    pub fn read_all(&self) -> &HashMap<String, CheckpointEntry> {
        &self.index
    }

    /// Entries whose latest status matches exactly
    pub fn read_by_status(&self, status: &str) -> Vec<&CheckpointEntry> {
        self.index.values().filter(|e| e.status == status).collect()
    }

    /// Entries whose operation was interrupted (status started/running/in_progress)
    pub fn read_incomplete(&self) -> Vec<CheckpointEntry> {
        let incomplete: Vec<CheckpointEntry> = self
            .index
            .values()
            .filter(|e| INCOMPLETE_STATUSES.contains(&e.status.as_str()))
            .cloned()
            .collect();

        info!(name = %self.name, count = incomplete.len(), "found incomplete checkpoints");
        incomplete
    }

    /// Mark every incomplete entry as `recovering` and return their ids for replay.
    pub fn recover(&mut self) -> std::io::Result<Vec<String>> {
        let incomplete = self.read_incomplete();
        let mut ids = Vec::with_capacity(incomplete.len());

        for entry in incomplete {
            self.write(
                entry.id.clone(),
                "recovering",
                entry.step,
                None,
                None,
                entry.context.clone(),
            )?;
            ids.push(entry.id);
        }

        info!(name = %self.name, count = ids.len(), "marked entries for recovery");
        Ok(ids)
    }

    /// Convenience: write `completed` with the next step number
    pub fn mark_complete(
        &mut self,
        id: &str,
        result: Option<Value>,
    ) -> std::io::Result<CheckpointEntry> {
        let step = self.read(id).map(|e| e.step + 1).unwrap_or(1);
        self.write(id, "completed", step, result, None, Value::Null)
    }

    /// Convenience: write `failed` with the next step number
    pub fn mark_failed(&mut self, id: &str, error: impl Into<String>) -> std::io::Result<CheckpointEntry> {
        let step = self.read(id).map(|e| e.step + 1).unwrap_or(1);
        self.write(id, "failed", step, None, Some(error.into()), Value::Null)
    }

    /// Rewrite the log keeping only the latest entry per id.
    ///
    /// Returns the number of superseded lines removed.
    pub fn compact(&mut self) -> std::io::Result<usize> {
        if !self.checkpoint_file.exists() {
            return Ok(0);
        }

        let mut total_lines = 0usize;
        {
            let file = File::open(&self.checkpoint_file)?;
            for line in BufReader::new(file).lines() {
                let line = line?;
                if !line.trim().is_empty() {
                    total_lines += 1;
                }
            }
        }

        let removed = total_lines.saturating_sub(self.index.len());
        if removed == 0 {
            return Ok(0);
        }

        let mut file = File::create(&self.checkpoint_file)?;
        for entry in self.index.values() {
            let line = serde_json::to_string(entry).map_err(std::io::Error::other)?;
            writeln!(file, "{}", line)?;
        }
        file.sync_data()?;
        self.save_index();

        info!(name = %self.name, removed, remaining = self.index.len(), "compacted checkpoint file");
        Ok(removed)
    }

    /// Delete the log and index. Use with caution.
    pub fn clear(&mut self) -> std::io::Result<()> {
        if self.checkpoint_file.exists() {
            std::fs::remove_file(&self.checkpoint_file)?;
        }
        if self.index_file.exists() {
            std::fs::remove_file(&self.index_file)?;
        }
        self.index.clear();
        warn!(name = %self.name, "cleared all checkpoints");
        Ok(())
    }

    /// All historical entries for an id, oldest first
    pub fn history(&self, id: &str) -> std::io::Result<Vec<CheckpointEntry>> {
        let mut entries = Vec::new();
        let Ok(file) = File::open(&self.checkpoint_file) else {
            return Ok(entries);
        };

        for line in BufReader::new(file).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Ok(entry) = serde_json::from_str::<CheckpointEntry>(line) {
                if entry.id == id {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }
}

/// Flushed, fsynced append of a single line
fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    file.flush()?;
    file.sync_data()?;
    Ok(())
}
