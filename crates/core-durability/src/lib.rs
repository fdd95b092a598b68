//! Lumen Core Durability: Crash-safety primitives
//!
//! # Overview
//!
//! The orchestrator must survive process crashes without double-charging,
//! double-submitting, or losing progress. This crate provides the three
//! building blocks that make that possible:
//!
//! - **File Lock**: OS-advisory exclusive locks under `.locks/` for
//!   cross-process critical sections (job claiming, pipeline execution,
//!   checkpoint appends)
//! - **Checkpoint Manager**: append-only JSONL write-ahead log with a
//!   latest-per-id index for O(1) lookup and startup recovery
//! - **Flow Logger**: per-operation JSONL trace (start → steps → end) for
//!   post-hoc debugging
//!
//! If it's not persisted, it didn't happen: checkpoints are written before
//! external effects and again after them, and the newest entry per id is the
//! truth.

pub mod checkpoint;
pub mod file_lock;
pub mod flow_log;

pub use checkpoint::{CheckpointEntry, CheckpointManager};
pub use file_lock::{FileLock, JobLock, LockError, PipelineLock};
pub use flow_log::FlowLogger;
