//! Claim-under-lock worker loop for the legacy single-job path
//!
//! The race this exists to prevent: two workers query pending rows, both
//! see the same jobs, both submit them. Claiming therefore happens under
//! the cross-process job lock (the only critical section), and every
//! later write lands on a row this worker owns.
//!
//! Note on crash behavior: a claim writes `status = 'claimed'` but no
//! worker lease or expiry, so a worker that dies between claim and submit
//! orphans the row until an operator requeues it. The claim checkpoint
//! records the worker id for that purpose.

use crate::orchestrator::{JobOrchestrator, JobOutcome, SubmitRequest};
use crate::store::{SingleJobRow, SqliteStore};
use anyhow::{Context, Result};
use lumen_core_durability::{FlowLogger, JobLock};
use lumen_core_resilience::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Worker tuning
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Bounded wait for the job lock
    pub lock_timeout: Duration,
    /// Jobs to claim and submit per cycle
    pub submit_limit: i64,
    /// Submitted jobs to poll per cycle
    pub poll_limit: i64,
    /// Sleep between cycles
    pub poll_interval: Duration,
    /// Directory holding the `.locks/` files
    pub lock_dir: PathBuf,
    /// Directory for worker flow logs
    pub flow_log_dir: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(30),
            submit_limit: 5,
            poll_limit: 10,
            poll_interval: Duration::from_secs(10),
            lock_dir: PathBuf::from(".locks"),
            flow_log_dir: PathBuf::from("flow_logs"),
        }
    }
}

/// Worker lifetime counters
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub jobs_claimed: AtomicU64,
    pub jobs_completed: AtomicU64,
    pub jobs_failed: AtomicU64,
}

/// Summary of one worker cycle
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleReport {
    pub submitted: usize,
    pub submit_success: usize,
    pub polled: usize,
    pub poll_complete: usize,
}

/// A single worker instance.
///
/// Safe to run several per host: the job lock serializes claiming.
pub struct JobWorker {
    worker_id: String,
    store: SqliteStore,
    orchestrator: Arc<JobOrchestrator>,
    config: WorkerConfig,
    running: AtomicBool,
    pub stats: WorkerStats,
}

impl JobWorker {
    pub fn new(
        store: SqliteStore,
        orchestrator: Arc<JobOrchestrator>,
        config: WorkerConfig,
        worker_id: Option<String>,
    ) -> Self {
        let worker_id =
            worker_id.unwrap_or_else(|| format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8]));
        info!(worker_id = %worker_id, "job worker initialized");

        Self {
            worker_id,
            store,
            orchestrator,
            config,
            running: AtomicBool::new(false),
            stats: WorkerStats::default(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim up to `limit` pending jobs under the job lock.
    ///
    /// Pending rows are over-fetched so that cooldown filtering still
    /// leaves enough eligible work; rows in cooldown stay pending for a
    /// later cycle.
    pub async fn claim_jobs(&self, limit: i64) -> Result<Vec<SingleJobRow>> {
        let lock_dir = self.config.lock_dir.clone();
        let lock_timeout = self.config.lock_timeout;

        // The lock wait polls on a blocking thread; the handle keeps the
        // lock held while we touch the database.
        let lock = tokio::task::spawn_blocking(move || -> Result<JobLock> {
            let mut lock = JobLock::new(&lock_dir)?;
            lock.acquire(lock_timeout)?;
            Ok(lock)
        })
        .await
        .context("lock task panicked")?;

        let mut lock = match lock {
            Ok(lock) => lock,
            Err(e) => {
                warn!(worker_id = %self.worker_id, error = %e, "could not acquire job lock");
                return Ok(Vec::new());
            }
        };

        let pending = self.store.pending_single_jobs(limit * 2).await?;
        let ids: Vec<String> = pending.iter().map(|job| job.id.to_string()).collect();
        let eligible = self.orchestrator.cooldown().get_eligible(&ids);

        let mut claimed = Vec::new();
        for job in pending {
            if claimed.len() as i64 >= limit {
                break;
            }
            if !eligible.contains(&job.id.to_string()) {
                debug!(worker_id = %self.worker_id, job_id = job.id, "job in cooldown, skipping");
                continue;
            }

            self.store.claim_single_job(job.id, &self.worker_id).await?;
            self.stats.jobs_claimed.fetch_add(1, Ordering::Relaxed);
            claimed.push(job);
        }

        lock.release();

        if !claimed.is_empty() {
            info!(
                worker_id = %self.worker_id,
                count = claimed.len(),
                "jobs claimed"
            );
        }
        Ok(claimed)
    }

    /// Submit one claimed job through the orchestrator
    pub async fn process_job(&self, job: &SingleJobRow) -> Result<JobOutcome> {
        let mut flow = FlowLogger::new(
            "worker",
            format!("{}-{}", self.worker_id, job.id),
            &self.config.flow_log_dir,
        );
        flow.start();
        flow.log_step(
            "process_start",
            "running",
            serde_json::json!({ "job_id": job.id, "model": job.model }),
        );

        let outcome = self
            .orchestrator
            .submit_job(SubmitRequest {
                job_id: Some(job.id.to_string()),
                model: job.model.clone(),
                image_url: job.image_url.clone(),
                motion_prompt: job.motion_prompt.clone(),
                resolution: job.resolution.clone(),
                duration_sec: job.duration_sec as u32,
                negative_prompt: job.negative_prompt.clone(),
            })
            .await;

        if outcome.success {
            let request_id = outcome.request_id.as_deref().unwrap_or_default();
            self.store.single_job_submitted(job.id, request_id).await?;
            self.stats.jobs_completed.fetch_add(1, Ordering::Relaxed);

            flow.log_step(
                "submit_success",
                "submitted",
                serde_json::json!({ "request_id": request_id }),
            );
            flow.end("completed");
        } else {
            let message = outcome.error_message.as_deref().unwrap_or("unknown error");
            self.store.single_job_failed(job.id, message).await?;
            self.stats.jobs_failed.fetch_add(1, Ordering::Relaxed);

            flow.log_step("submit_failed", "failed", serde_json::json!({ "error": message }));
            flow.end("failed");
            warn!(worker_id = %self.worker_id, job_id = job.id, error = message, "job failed");
        }

        Ok(outcome)
    }

    /// One polling pass over submitted jobs: a single poll each.
    ///
    /// Permanent failures mark the row failed; transient outcomes leave it
    /// submitted for the next cycle.
    pub async fn poll_submitted(&self) -> Result<Vec<JobOutcome>> {
        let submitted = self.store.submitted_single_jobs(self.config.poll_limit).await?;
        let mut outcomes = Vec::with_capacity(submitted.len());

        for job in submitted {
            let request_id = match job.request_id.as_deref() {
                Some(id) => id,
                None => continue,
            };

            let outcome = self
                .orchestrator
                .poll_job(&job.id.to_string(), request_id, &job.model, 1, Duration::ZERO)
                .await;

            if outcome.success {
                let url = outcome.result_url.as_deref().unwrap_or_default();
                self.store.single_job_completed(job.id, url).await?;
            } else if outcome.error_kind == Some(ErrorKind::Permanent) {
                let message = outcome.error_message.as_deref().unwrap_or("job failed");
                self.store.single_job_failed(job.id, message).await?;
            }
            // Transient outcomes (still running, poll budget spent): keep polling

            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    /// Run one claim → submit → poll cycle
    pub async fn run_once(&self) -> Result<CycleReport> {
        let claimed = self.claim_jobs(self.config.submit_limit).await?;
        let mut report = CycleReport {
            submitted: claimed.len(),
            ..CycleReport::default()
        };

        for job in &claimed {
            match self.process_job(job).await {
                Ok(outcome) if outcome.success => report.submit_success += 1,
                Ok(_) => {}
                Err(e) => error!(worker_id = %self.worker_id, job_id = job.id, error = %e, "job processing error"),
            }
        }

        let polled = self.poll_submitted().await?;
        report.polled = polled.len();
        report.poll_complete = polled.iter().filter(|o| o.success).count();

        Ok(report)
    }

    /// Run cycles until [`JobWorker::stop`] is called
    pub async fn run_forever(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!(
            worker_id = %self.worker_id,
            poll_interval_s = self.config.poll_interval.as_secs(),
            "worker starting"
        );

        while self.running.load(Ordering::SeqCst) {
            match self.run_once().await {
                Ok(report) => {
                    if report.submitted > 0 || report.polled > 0 {
                        debug!(
                            worker_id = %self.worker_id,
                            submitted = report.submitted,
                            polled = report.polled,
                            "worker cycle completed"
                        );
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.worker_id, error = %e, "worker cycle error");
                }
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }

        info!(worker_id = %self.worker_id, "worker stopped");
    }

    /// Signal the worker loop to exit after the current cycle
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{BackendRegistry, GenerationBackend, GenerationRequest, PollStatus};
    use crate::orchestrator::OrchestratorConfig;
    use async_trait::async_trait;
    use lumen_core_resilience::BackendFailure;
    use tempfile::TempDir;

    struct InstantBackend;

    #[async_trait]
    impl GenerationBackend for InstantBackend {
        fn name(&self) -> &str {
            "instant"
        }
        async fn submit(&self, _r: &GenerationRequest) -> Result<String, BackendFailure> {
            Ok("req-42".to_string())
        }
        async fn poll(&self, _m: &str, _r: &str) -> Result<PollStatus, BackendFailure> {
            Ok(PollStatus::Completed {
                result_url: "https://cdn/out.mp4".to_string(),
            })
        }
    }

    async fn worker_fixture(dir: &TempDir) -> (SqliteStore, JobWorker) {
        let store = SqliteStore::open(dir.path().join("worker.db").to_str().unwrap())
            .await
            .unwrap();

        let mut registry = BackendRegistry::new();
        registry.register("kling", Arc::new(InstantBackend));
        let orchestrator = Arc::new(
            JobOrchestrator::new(
                Arc::new(registry),
                OrchestratorConfig {
                    state_dir: dir.path().to_path_buf(),
                    flow_log_dir: dir.path().join("flow_logs"),
                    ..OrchestratorConfig::default()
                },
            )
            .unwrap(),
        );

        let worker = JobWorker::new(
            store.clone(),
            orchestrator,
            WorkerConfig {
                lock_dir: dir.path().join(".locks"),
                flow_log_dir: dir.path().join("flow_logs"),
                ..WorkerConfig::default()
            },
            Some("worker-test".to_string()),
        );

        (store, worker)
    }

    #[tokio::test]
    async fn test_claim_respects_limit() {
        let dir = TempDir::new().unwrap();
        let (store, worker) = worker_fixture(&dir).await;

        for _ in 0..8 {
            store
                .create_single_job("kling", "https://cdn.example.com/src.jpg", "pan", "1080p", 5, None)
                .await
                .unwrap();
        }

        let claimed = worker.claim_jobs(5).await.unwrap();
        assert_eq!(claimed.len(), 5);
        assert_eq!(store.pending_single_jobs(100).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_claim_skips_cooled_jobs() {
        let dir = TempDir::new().unwrap();
        let (store, worker) = worker_fixture(&dir).await;

        let hot = store
            .create_single_job("kling", "https://cdn.example.com/a.jpg", "pan", "1080p", 5, None)
            .await
            .unwrap();
        let cold = store
            .create_single_job("kling", "https://cdn.example.com/b.jpg", "pan", "1080p", 5, None)
            .await
            .unwrap();
        worker
            .orchestrator
            .cooldown()
            .record_failure(&cold.to_string(), Some("earlier failure"));

        let claimed = worker.claim_jobs(5).await.unwrap();
        let ids: Vec<i64> = claimed.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![hot]);
    }

    #[tokio::test]
    async fn test_full_cycle_submits_and_completes() {
        let dir = TempDir::new().unwrap();
        let (store, worker) = worker_fixture(&dir).await;

        let id = store
            .create_single_job(
                "kling",
                "https://cdn.example.com/src.jpg",
                "a gentle breeze",
                "1080p",
                5,
                None,
            )
            .await
            .unwrap();

        // Cycle 1: claim + submit
        let report = worker.run_once().await.unwrap();
        assert_eq!(report.submitted, 1);
        assert_eq!(report.submit_success, 1);

        // Cycle 2: poll to completion
        let report = worker.run_once().await.unwrap();
        assert_eq!(report.polled, 1);
        assert_eq!(report.poll_complete, 1);

        let row = sqlx::query("SELECT status, video_url FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_one(store.pool())
            .await
            .unwrap();
        use sqlx::Row;
        assert_eq!(row.get::<String, _>("status"), "completed");
        assert_eq!(row.get::<String, _>("video_url"), "https://cdn/out.mp4");
    }

    #[tokio::test]
    async fn test_invalid_job_marked_failed_once() {
        let dir = TempDir::new().unwrap();
        let (store, worker) = worker_fixture(&dir).await;

        // veo2 only supports 720p: validation rejects before any backend call
        let id = store
            .create_single_job("veo2", "https://cdn.example.com/src.jpg", "pan", "1080p", 6, None)
            .await
            .unwrap();

        let report = worker.run_once().await.unwrap();
        assert_eq!(report.submitted, 1);
        assert_eq!(report.submit_success, 0);

        let row = sqlx::query("SELECT status FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_one(store.pool())
            .await
            .unwrap();
        use sqlx::Row;
        assert_eq!(row.get::<String, _>("status"), "failed");
    }
}
