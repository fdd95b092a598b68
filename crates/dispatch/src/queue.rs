//! The batch queue: the only component that owns scheduling decisions
//!
//! A submit charges the user and persists the job and its items in one
//! transaction, then hands the job to a background **coordinator** task.
//! The coordinator fans items out through a global semaphore, reflects
//! every counter change into both the database and an in-memory
//! [`JobState`] mirror, and finalizes the job when all items settle.
//!
//! Cancellation is cooperative: the coordinator stops admitting items,
//! in-flight generations are allowed to finish (they are committed work),
//! and the refund is computed from what is still pending after settlement.
//!
//! Crash recovery re-reads every job in {queued, running} on startup and
//! re-spawns coordinators over only the unfinished items; item result
//! writes are idempotent, so a row caught mid-flight is simply re-run.

use crate::adapters::ItemGenerator;
use crate::ledger::{self, LedgerError};
use crate::pricing::{self, JobConfig, OutputKind};
use crate::store::{BatchCounters, BatchItemRow, SqliteStore};
use crate::validator::{InputValidator, ValidationError};
use crate::{BatchStatus, ItemSpec, JobState};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Hard cap on items per job
pub const MAX_JOB_QUANTITY: u32 = 500;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Insufficient credits: need {required}, have {available}")]
    InsufficientCredits { required: i64, available: i64 },

    #[error("Max concurrent jobs ({limit}) reached for tier")]
    TierLimitExceeded { limit: i64 },

    #[error("Quantity {quantity} exceeds the per-job limit of {limit}")]
    QuantityLimitExceeded { quantity: u32, limit: u32 },

    #[error("User {0} not found")]
    UserNotFound(i64),

    #[error("User {0} is not active")]
    UserInactive(i64),

    #[error("Cannot cancel another user's job")]
    PermissionDenied,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<LedgerError> for QueueError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientCredits { required, available } => {
                QueueError::InsufficientCredits { required, available }
            }
            LedgerError::UserNotFound(id) => QueueError::UserNotFound(id),
            LedgerError::Database(e) => QueueError::Database(e),
            other => QueueError::Storage(anyhow::anyhow!(other)),
        }
    }
}

/// Tuning knobs for the queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Simultaneous item executions across all jobs in the process
    pub max_concurrency: usize,
    /// Samples retained per model for the moving-average duration
    pub duration_window: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            duration_window: 50,
        }
    }
}

struct JobHandle {
    cancel: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    settled: Arc<Notify>,
}

/// Wait for a coordinator to settle without losing a wakeup: the waiter is
/// registered before the finished flag is checked.
async fn await_settled(finished: &AtomicBool, settled: &Notify) {
    let notified = settled.notified();
    tokio::pin!(notified);
    notified.as_mut().enable();
    if finished.load(Ordering::SeqCst) {
        return;
    }
    notified.await;
}

struct QueueInner {
    store: SqliteStore,
    generator: Arc<dyn ItemGenerator>,
    config: QueueConfig,
    semaphore: Arc<Semaphore>,
    states: RwLock<HashMap<String, JobState>>,
    durations: StdMutex<HashMap<String, VecDeque<u64>>>,
    handles: Mutex<HashMap<String, JobHandle>>,
    validator: InputValidator,
}

impl QueueInner {
    fn update_moving_average(&self, model: &str, duration_ms: u64) -> i64 {
        let mut durations = self.durations.lock().expect("durations lock poisoned");
        let window = durations.entry(model.to_string()).or_default();
        window.push_back(duration_ms);
        while window.len() > self.config.duration_window {
            window.pop_front();
        }
        (window.iter().sum::<u64>() / window.len() as u64) as i64
    }

    fn reflect_counters(&self, job_id: &str, counters: &BatchCounters) {
        let mut states = self.states.write().expect("states lock poisoned");
        if let Some(state) = states.get_mut(job_id) {
            state.completed = counters.completed as u32;
            state.failed = counters.failed as u32;
            state.pending = counters.pending as u32;
            state.avg_duration_ms = counters.avg_item_duration_ms.map(|v| v as u64);
            state.eta_seconds = counters.eta_seconds;
            state.last_update = chrono::Utc::now();
        }
    }

    fn set_state_status(&self, job_id: &str, status: BatchStatus) {
        let mut states = self.states.write().expect("states lock poisoned");
        if let Some(state) = states.get_mut(job_id) {
            state.status = status;
            state.last_update = chrono::Utc::now();
        }
    }

    async fn process_item(
        inner: &Arc<QueueInner>,
        job_id: &str,
        item: BatchItemRow,
        config: &JobConfig,
    ) {
        if let Err(e) = inner.store.mark_item_running(item.id).await {
            error!(job_id, item_id = item.id, error = %e, "failed to mark item running");
            return;
        }

        let started = Instant::now();
        match inner.generator.generate(&item, config).await {
            Ok(result_url) => {
                let duration_ms = started.elapsed().as_millis() as i64;
                let avg = inner.update_moving_average(config.model(), duration_ms.max(0) as u64);

                match inner
                    .store
                    .record_item_success(job_id, item.id, &result_url, duration_ms, Some(avg))
                    .await
                {
                    Ok(counters) => inner.reflect_counters(job_id, &counters),
                    Err(e) => {
                        error!(job_id, item_id = item.id, error = %e, "failed to record item success")
                    }
                }
            }
            Err(failure) => {
                warn!(
                    job_id,
                    item_index = item.item_index,
                    error = %failure,
                    "item generation failed"
                );
                match inner
                    .store
                    .record_item_failure(job_id, item.id, &failure.to_string())
                    .await
                {
                    Ok(counters) => inner.reflect_counters(job_id, &counters),
                    Err(e) => {
                        error!(job_id, item_id = item.id, error = %e, "failed to record item failure")
                    }
                }
            }
        }
    }

    /// The per-job coordinator body: fan out, settle, finalize.
    async fn process_job(
        inner: &Arc<QueueInner>,
        job_id: &str,
        cancel: &Arc<AtomicBool>,
    ) -> anyhow::Result<()> {
        let Some(job) = inner.store.get_job(job_id).await? else {
            warn!(job_id, "job not found for processing");
            return Ok(());
        };
        if job.status.is_terminal() {
            return Ok(());
        }

        if job.status == BatchStatus::Queued {
            inner.store.mark_job_running(job_id).await?;
        }
        inner.set_state_status(job_id, BatchStatus::Running);

        let config = job.config.clone();
        let items = inner.store.unfinished_items(job.id).await?;
        debug!(job_id, count = items.len(), "fanning out items");

        let mut tasks = JoinSet::new();
        for item in items {
            if cancel.load(Ordering::SeqCst) {
                debug!(job_id, "cancellation observed, not admitting further items");
                break;
            }

            let inner = inner.clone();
            let job_id = job_id.to_string();
            let config = config.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                // Only the item task holds the global permit
                let Ok(_permit) = inner.semaphore.clone().acquire_owned().await else {
                    return;
                };
                // An item admitted after cancel stays pending and is refunded
                if cancel.load(Ordering::SeqCst) {
                    return;
                }
                QueueInner::process_item(&inner, &job_id, item, &config).await;
            });
        }

        while tasks.join_next().await.is_some() {}

        if cancel.load(Ordering::SeqCst) {
            info!(job_id, "coordinator exiting after cancel, finalize skipped");
            return Ok(());
        }

        let Some(job) = inner.store.get_job(job_id).await? else {
            return Ok(());
        };
        let (status, error) = if job.failed_items == job.quantity {
            (BatchStatus::Failed, Some("all items failed"))
        } else {
            (BatchStatus::Completed, None)
        };
        inner.store.finalize_job(job_id, status, error).await?;

        // Item reflections can land out of order; the finalize snapshot is
        // authoritative for the in-memory mirror.
        {
            let mut states = inner.states.write().expect("states lock poisoned");
            if let Some(state) = states.get_mut(job_id) {
                state.status = status;
                state.completed = job.completed_items as u32;
                state.failed = job.failed_items as u32;
                state.pending = job.pending_items as u32;
                state.avg_duration_ms = job.avg_item_duration_ms.map(|v| v as u64);
                state.eta_seconds = None;
                state.last_update = chrono::Utc::now();
            }
        }

        info!(
            job_id,
            status = %status,
            completed = job.completed_items,
            failed = job.failed_items,
            "batch job finalized"
        );
        Ok(())
    }
}

/// Async batch job queue with in-memory state tracking.
///
/// Cheap to clone; all clones share the same scheduler state.
#[derive(Clone)]
pub struct BatchQueue {
    inner: Arc<QueueInner>,
}

impl BatchQueue {
    pub fn new(store: SqliteStore, generator: Arc<dyn ItemGenerator>, config: QueueConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        info!(max_concurrency = config.max_concurrency, "batch queue started");

        Self {
            inner: Arc::new(QueueInner {
                store,
                generator,
                config,
                semaphore,
                states: RwLock::new(HashMap::new()),
                durations: StdMutex::new(HashMap::new()),
                handles: Mutex::new(HashMap::new()),
                validator: InputValidator::new(),
            }),
        }
    }

    /// In-memory state for a job (fast read).
    ///
    /// `None` after a restart until recovery re-registers the job; callers
    /// fall back to the database row.
    pub fn get_state(&self, job_id: &str) -> Option<JobState> {
        self.inner
            .states
            .read()
            .expect("states lock poisoned")
            .get(job_id)
            .cloned()
    }

    /// All in-memory job states
    pub fn get_all_states(&self) -> HashMap<String, JobState> {
        self.inner.states.read().expect("states lock poisoned").clone()
    }

    /// Submit a new batch job.
    ///
    /// In one transaction: verifies the user is active and under the tier's
    /// concurrent-job limit, charges `price(config) × quantity` against the
    /// balance with a `source=job` ledger row, and inserts the job plus its
    /// N pending items. After commit the coordinator starts in the
    /// background; the returned uuid is immediately pollable.
    pub async fn submit(
        &self,
        user_id: i64,
        output_type: OutputKind,
        quantity: u32,
        config: JobConfig,
        item_specs: Option<Vec<ItemSpec>>,
    ) -> Result<String, QueueError> {
        if quantity == 0 || quantity > MAX_JOB_QUANTITY {
            return Err(QueueError::QuantityLimitExceeded {
                quantity,
                limit: MAX_JOB_QUANTITY,
            });
        }
        if config.output_kind() != output_type {
            return Err(ValidationError::new(
                "config",
                format!(
                    "Config type {} does not match output type {}",
                    config.output_kind(),
                    output_type
                ),
                None,
                "incompatible",
            )
            .into());
        }
        // Defense in depth: catch impossible model/resolution/duration pairs
        // before charging anyone
        if let JobConfig::Video {
            model,
            resolution,
            duration_sec,
            ..
        } = &config
        {
            if let Some(resolution) = resolution {
                self.inner.validator.validate_model_resolution(model, resolution)?;
            }
            self.inner.validator.validate_model_duration(model, *duration_sec)?;
        }

        let job_id = Uuid::new_v4().to_string();
        let price = pricing::job_cost(&config, quantity);

        let mut tx = self.inner.store.pool().begin().await?;

        let user = SqliteStore::get_user_conn(&mut tx, user_id)
            .await?
            .ok_or(QueueError::UserNotFound(user_id))?;
        if !user.is_active {
            return Err(QueueError::UserInactive(user_id));
        }

        let active = SqliteStore::count_active_jobs_conn(&mut tx, user_id).await?;
        let limit = user.tier.max_concurrent_jobs();
        if active >= limit {
            return Err(QueueError::TierLimitExceeded { limit });
        }

        ledger::deduct_credits(
            &mut tx,
            user_id,
            price,
            &format!("Batch job: {} {}(s)", quantity, output_type),
            "job",
            Some(&job_id),
            false,
        )
        .await?;

        let db_id = SqliteStore::insert_batch_job_conn(
            &mut tx,
            &job_id,
            user_id,
            output_type,
            &config,
            quantity,
            price,
        )
        .await?;

        let specs = item_specs.unwrap_or_default();
        for index in 0..quantity {
            let spec = specs.get(index as usize).cloned().unwrap_or_default();
            SqliteStore::insert_item_conn(&mut tx, db_id, index, &spec).await?;
        }

        tx.commit().await?;

        self.inner
            .states
            .write()
            .expect("states lock poisoned")
            .insert(job_id.clone(), JobState::new(&job_id, BatchStatus::Queued, quantity));

        info!(
            job_id = %job_id,
            user_id,
            quantity,
            output_type = %output_type,
            credits_charged = price,
            "batch job submitted"
        );

        self.spawn_coordinator(job_id.clone()).await;
        Ok(job_id)
    }

    /// Cancel a queued or running job.
    ///
    /// Returns `false` when the job doesn't exist or is already terminal.
    /// The refund is `floor(credits_charged × pending / quantity)`, computed
    /// after in-flight items have settled, and is credited with
    /// `source=refund` in the same transaction that flips the status.
    pub async fn cancel(&self, job_id: &str, user_id: i64) -> Result<bool, QueueError> {
        let Some(job) = self.inner.store.get_job(job_id).await? else {
            return Ok(false);
        };
        if job.user_id != user_id {
            return Err(QueueError::PermissionDenied);
        }
        if job.status.is_terminal() {
            return Ok(false);
        }

        // Signal the coordinator, then wait for in-flight items to settle
        let waiter = {
            let handles = self.inner.handles.lock().await;
            handles.get(job_id).map(|handle| {
                handle.cancel.store(true, Ordering::SeqCst);
                (handle.finished.clone(), handle.settled.clone())
            })
        };
        if let Some((finished, settled)) = waiter {
            await_settled(&finished, &settled).await;
        }

        let mut tx = self.inner.store.pool().begin().await?;
        let Some(job) = SqliteStore::get_job_conn(&mut tx, job_id).await? else {
            return Ok(false);
        };
        // The coordinator may have finalized while we were waiting
        if job.status.is_terminal() {
            return Ok(false);
        }

        let refund = if job.pending_items > 0 && job.credits_charged > 0 {
            (job.credits_charged * job.pending_items) / job.quantity
        } else {
            0
        };

        if refund > 0 {
            let short_id: String = job_id.chars().take(8).collect();
            ledger::refund_credits(
                &mut tx,
                user_id,
                refund,
                &format!("Refund for canceled job {}", short_id),
                Some(job_id),
            )
            .await?;
        }

        SqliteStore::cancel_job_conn(&mut tx, job_id, refund).await?;
        tx.commit().await?;

        self.inner.set_state_status(job_id, BatchStatus::Canceled);
        info!(job_id, refunded = refund, "batch job canceled");
        Ok(true)
    }

    /// Block until a job's coordinator settles (terminal status reached or
    /// cancellation drained). Returns immediately when no coordinator is
    /// live.
    pub async fn wait(&self, job_id: &str) {
        let waiter = {
            let handles = self.inner.handles.lock().await;
            handles
                .get(job_id)
                .map(|handle| (handle.finished.clone(), handle.settled.clone()))
        };
        if let Some((finished, settled)) = waiter {
            await_settled(&finished, &settled).await;
        }
    }

    /// Crash recovery: re-register and re-run every job in {queued, running}.
    ///
    /// JobState is rebuilt from the row counters; coordinators re-enqueue
    /// only items in {pending, running}. No items are created and no
    /// credits are re-debited.
    pub async fn recover(&self) -> Result<usize, QueueError> {
        let jobs = self.inner.store.active_jobs().await?;
        let count = jobs.len();

        for job in jobs {
            info!(
                job_id = %job.job_id,
                completed = job.completed_items,
                failed = job.failed_items,
                pending = job.pending_items,
                "rebuilding job state for recovery"
            );

            let mut state = JobState::new(&job.job_id, job.status, job.quantity as u32);
            state.completed = job.completed_items as u32;
            state.failed = job.failed_items as u32;
            state.pending = job.pending_items as u32;
            state.avg_duration_ms = job.avg_item_duration_ms.map(|v| v as u64);

            self.inner
                .states
                .write()
                .expect("states lock poisoned")
                .insert(job.job_id.clone(), state);

            self.spawn_coordinator(job.job_id.clone()).await;
        }

        if count > 0 {
            info!(count, "recovered interrupted batch jobs");
        }
        Ok(count)
    }

    /// Stop all coordinators cooperatively and wait for them to settle
    pub async fn shutdown(&self) {
        let waiters: Vec<(Arc<AtomicBool>, Arc<Notify>)> = {
            let handles = self.inner.handles.lock().await;
            handles
                .values()
                .map(|handle| {
                    handle.cancel.store(true, Ordering::SeqCst);
                    (handle.finished.clone(), handle.settled.clone())
                })
                .collect()
        };
        for (finished, settled) in waiters {
            await_settled(&finished, &settled).await;
        }
        info!("batch queue stopped");
    }

    async fn spawn_coordinator(&self, job_id: String) {
        let cancel = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let settled = Arc::new(Notify::new());

        self.inner.handles.lock().await.insert(
            job_id.clone(),
            JobHandle {
                cancel: cancel.clone(),
                finished: finished.clone(),
                settled: settled.clone(),
            },
        );

        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(e) = QueueInner::process_job(&inner, &job_id, &cancel).await {
                // The coordinator boundary: no job is left running forever
                error!(job_id = %job_id, error = %e, "job processing failed");
                let message: String = e.to_string().chars().take(500).collect();
                if let Err(e) = inner
                    .store
                    .finalize_job(&job_id, BatchStatus::Failed, Some(&message))
                    .await
                {
                    error!(job_id = %job_id, error = %e, "failed to mark job failed");
                }
                inner.set_state_status(&job_id, BatchStatus::Failed);
            }

            finished.store(true, Ordering::SeqCst);
            settled.notify_waiters();
            inner.handles.lock().await.remove(&job_id);
        });
    }
}
