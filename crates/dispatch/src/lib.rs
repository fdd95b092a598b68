//! Lumen Dispatch: durable batch-job engine
//!
//! # Overview
//!
//! Dispatch owns everything between "a tenant asked for N generations" and
//! "N result URLs are in the database":
//!
//! - **Store**: SQLite (WAL mode) persistence for users, the credit ledger,
//!   batch jobs and their items, legacy single jobs, and the upload cache
//! - **Ledger**: atomic credit mutation with an append-only transaction log
//! - **Batch Queue**: the scheduler: fan-out, concurrency, progress, ETA,
//!   cancellation with pro-rated refunds, crash recovery
//! - **Orchestrator**: the hardened single-item path (validate → cooldown →
//!   checkpoint → rate limit → retry → poll)
//! - **Adapters**: uniform submit/poll contract over remote generation
//!   backends, dispatched by model key through a registry
//! - **Object Cache**: content-addressed copies of result URLs in
//!   S3-compatible storage
//!
//! # Example
//!
//! ```no_run
//! use lumen_dispatch::pricing::{JobConfig, OutputKind};
//! use lumen_dispatch::queue::{BatchQueue, QueueConfig};
//! use lumen_dispatch::store::SqliteStore;
//! use std::sync::Arc;
//!
//! # async fn example(generator: Arc<dyn lumen_dispatch::adapters::ItemGenerator>) -> anyhow::Result<()> {
//! let store = SqliteStore::open("lumen.db").await?;
//! let queue = BatchQueue::new(store, generator, QueueConfig::default());
//!
//! let config: JobConfig = serde_json::from_str(
//!     r#"{"type": "video", "model": "kling", "duration_sec": 5, "image_url": "https://example.com/src.jpg"}"#,
//! )?;
//! let job_id = queue.submit(1, OutputKind::Video, 3, config, None).await?;
//! queue.wait(&job_id).await;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod adapters;
pub mod cache;
pub mod ledger;
pub mod orchestrator;
pub mod pricing;
pub mod queue;
pub mod store;
pub mod validator;
pub mod worker;

pub use queue::{BatchQueue, QueueConfig, QueueError};
pub use store::SqliteStore;

/// Batch job lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    /// Accepted and charged, coordinator not yet running
    Queued,
    /// Coordinator is fanning out items
    Running,
    /// All items settled, at least one succeeded
    Completed,
    /// Every item failed
    Failed,
    /// Canceled by the owner; incomplete items refunded
    Canceled,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Canceled
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchStatus::Queued => write!(f, "queued"),
            BatchStatus::Running => write!(f, "running"),
            BatchStatus::Completed => write!(f, "completed"),
            BatchStatus::Failed => write!(f, "failed"),
            BatchStatus::Canceled => write!(f, "canceled"),
        }
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(BatchStatus::Queued),
            "running" => Ok(BatchStatus::Running),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            "canceled" => Ok(BatchStatus::Canceled),
            _ => Err(anyhow::anyhow!("Invalid batch status: {}", s)),
        }
    }
}

/// Batch item lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemStatus::Pending => write!(f, "pending"),
            ItemStatus::Running => write!(f, "running"),
            ItemStatus::Completed => write!(f, "completed"),
            ItemStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ItemStatus::Pending),
            "running" => Ok(ItemStatus::Running),
            "completed" => Ok(ItemStatus::Completed),
            "failed" => Ok(ItemStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid item status: {}", s)),
        }
    }
}

/// Status of a legacy single-video job driven by the worker loop
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SingleJobStatus {
    Pending,
    Claimed,
    Submitted,
    Completed,
    Failed,
}

impl fmt::Display for SingleJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SingleJobStatus::Pending => write!(f, "pending"),
            SingleJobStatus::Claimed => write!(f, "claimed"),
            SingleJobStatus::Submitted => write!(f, "submitted"),
            SingleJobStatus::Completed => write!(f, "completed"),
            SingleJobStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for SingleJobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(SingleJobStatus::Pending),
            "claimed" => Ok(SingleJobStatus::Claimed),
            "submitted" => Ok(SingleJobStatus::Submitted),
            "completed" => Ok(SingleJobStatus::Completed),
            "failed" => Ok(SingleJobStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid job status: {}", s)),
        }
    }
}

/// Subscription tier selecting admission limits
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Starter,
    Pro,
    Agency,
}

impl Tier {
    /// Maximum jobs a tenant may have in {queued, running} at once
    pub fn max_concurrent_jobs(&self) -> i64 {
        match self {
            Tier::Free => 1,
            Tier::Starter => 2,
            Tier::Pro => 5,
            Tier::Agency => 10,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Free => write!(f, "free"),
            Tier::Starter => write!(f, "starter"),
            Tier::Pro => write!(f, "pro"),
            Tier::Agency => write!(f, "agency"),
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "starter" => Ok(Tier::Starter),
            "pro" => Ok(Tier::Pro),
            "agency" => Ok(Tier::Agency),
            _ => Err(anyhow::anyhow!("Invalid tier: {}", s)),
        }
    }
}

/// Per-item overrides supplied at submit time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemSpec {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub variation_params: Option<serde_json::Value>,
}

/// In-memory state for fast status reads.
///
/// The database row is the source of truth; this mirror exists so status
/// polling doesn't hit the store. Callers must fall back to the row when the
/// state is absent (e.g. after a restart, before recovery re-registers it).
#[derive(Debug, Clone)]
pub struct JobState {
    pub job_id: String,
    pub status: BatchStatus,
    pub quantity: u32,
    pub completed: u32,
    pub failed: u32,
    pub pending: u32,
    pub eta_seconds: Option<i64>,
    pub avg_duration_ms: Option<u64>,
    pub last_update: DateTime<Utc>,
}

impl JobState {
    pub fn new(job_id: impl Into<String>, status: BatchStatus, quantity: u32) -> Self {
        Self {
            job_id: job_id.into(),
            status,
            quantity,
            completed: 0,
            failed: 0,
            pending: quantity,
            eta_seconds: None,
            avg_duration_ms: None,
            last_update: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_batch_status_round_trip() {
        for status in [
            BatchStatus::Queued,
            BatchStatus::Running,
            BatchStatus::Completed,
            BatchStatus::Failed,
            BatchStatus::Canceled,
        ] {
            assert_eq!(BatchStatus::from_str(&status.to_string()).unwrap(), status);
        }
        assert!(BatchStatus::from_str("bogus").is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!BatchStatus::Queued.is_terminal());
        assert!(!BatchStatus::Running.is_terminal());
        assert!(BatchStatus::Completed.is_terminal());
        assert!(BatchStatus::Failed.is_terminal());
        assert!(BatchStatus::Canceled.is_terminal());
    }

    #[test]
    fn test_tier_limits() {
        assert_eq!(Tier::Free.max_concurrent_jobs(), 1);
        assert_eq!(Tier::Starter.max_concurrent_jobs(), 2);
        assert_eq!(Tier::Pro.max_concurrent_jobs(), 5);
        assert_eq!(Tier::Agency.max_concurrent_jobs(), 10);
    }

    #[test]
    fn test_job_state_new() {
        let state = JobState::new("abc", BatchStatus::Queued, 10);
        assert_eq!(state.pending, 10);
        assert_eq!(state.completed, 0);
        assert_eq!(state.failed, 0);
    }
}
