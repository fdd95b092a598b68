//! Single-item orchestration with the full reliability stack
//!
//! The orchestrator coordinates; adapters execute; the flow logger
//! observes. One submit walks through, in order:
//!
//! 1. **Validate**: URL, prompt, model/resolution, model/duration
//! 2. **Cooldown gate**: a job still cooling down is not sent out at all
//! 3. **Checkpoint**: `started` is durable before any external effect
//! 4. **Rate limit**: bounded wait for an API slot
//! 5. **Submit via retry**: classifier-driven backoff around the adapter
//! 6. **Record**: checkpoint `submitted`/`failed`, cooldown bookkeeping
//!
//! Polling is a separate entry point with the same discipline. On startup,
//! [`JobOrchestrator::recover_interrupted`] surfaces checkpoints that were
//! interrupted mid-flight.

use crate::adapters::{BackendRegistry, GenerationRequest, PollStatus};
use crate::validator::InputValidator;
use lumen_core_durability::{CheckpointManager, FlowLogger};
use lumen_core_resilience::{
    CooldownTracker, ErrorKind, RetryConfig, RetryManager, SlidingWindowLimiter,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Polling ceiling per job
pub const MAX_POLLS: u32 = 120;
/// Sleep between polls
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Bounded wait for a rate-limit slot
const RATE_LIMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Outbound submit/poll budget per minute
    pub rate_limit_per_minute: usize,
    /// Directory for checkpoint and cooldown state
    pub state_dir: PathBuf,
    /// Directory for per-job flow logs
    pub flow_log_dir: PathBuf,
    /// Disable to skip the defense-in-depth validation layer
    pub enable_validation: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_minute: 60,
            state_dir: PathBuf::from("."),
            flow_log_dir: PathBuf::from("flow_logs"),
            enable_validation: true,
        }
    }
}

/// A single-item submission request
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Internal job id; generated when absent
    pub job_id: Option<String>,
    pub model: String,
    pub image_url: String,
    pub motion_prompt: String,
    pub resolution: String,
    pub duration_sec: u32,
    pub negative_prompt: Option<String>,
}

/// Outcome of a submit or poll pass
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: String,
    pub success: bool,
    pub request_id: Option<String>,
    pub result_url: Option<String>,
    pub error_message: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub attempts: u32,
    pub elapsed: Duration,
}

impl JobOutcome {
    fn pending(job_id: String) -> Self {
        Self {
            job_id,
            success: false,
            request_id: None,
            result_url: None,
            error_message: None,
            error_kind: None,
            attempts: 0,
            elapsed: Duration::ZERO,
        }
    }
}

/// Counters across the orchestrator's lifetime
#[derive(Debug, Default)]
pub struct OrchestratorStats {
    pub jobs_submitted: AtomicU64,
    pub jobs_completed: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub total_retries: AtomicU64,
    pub total_errors: AtomicU64,
}

/// Production-hardened single-item orchestrator
pub struct JobOrchestrator {
    registry: Arc<BackendRegistry>,
    checkpoint: Mutex<CheckpointManager>,
    retry: RetryManager,
    cooldown: CooldownTracker,
    rate_limiter: SlidingWindowLimiter,
    validator: Option<InputValidator>,
    flow_log_dir: PathBuf,
    stats: OrchestratorStats,
}

impl JobOrchestrator {
    pub fn new(
        registry: Arc<BackendRegistry>,
        config: OrchestratorConfig,
    ) -> std::io::Result<Self> {
        let checkpoint = CheckpointManager::new("jobs", config.state_dir.join(".checkpoints"))?;
        let cooldown = CooldownTracker::with_persistence("jobs", config.state_dir.join(".cooldowns"));

        info!(
            rate_limit = config.rate_limit_per_minute,
            state_dir = %config.state_dir.display(),
            "job orchestrator initialized"
        );

        Ok(Self {
            registry,
            checkpoint: Mutex::new(checkpoint),
            retry: RetryManager::new(),
            cooldown,
            rate_limiter: SlidingWindowLimiter::per_minute(config.rate_limit_per_minute),
            validator: config.enable_validation.then(InputValidator::new),
            flow_log_dir: config.flow_log_dir,
            stats: OrchestratorStats::default(),
        })
    }

    /// The cooldown tracker, shared with the worker loop for claim filtering
    pub fn cooldown(&self) -> &CooldownTracker {
        &self.cooldown
    }

    /// Submit one generation job with the full reliability stack applied.
    ///
    /// Returns a [`JobOutcome`] rather than an error: every failure mode is
    /// classified and carried in the outcome so callers can persist it.
    pub async fn submit_job(&self, request: SubmitRequest) -> JobOutcome {
        let started = Instant::now();
        let job_id = request
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut flow = FlowLogger::new("job", &job_id, &self.flow_log_dir)
            .with_context("model", request.model.clone());
        flow.start();

        let mut outcome = JobOutcome::pending(job_id.clone());

        // Step 1: defense-in-depth validation
        if let Some(validator) = &self.validator {
            flow.log_step("validate", "validating", serde_json::Value::Null);
            if let Err(e) = validator.validate_submission(
                &request.image_url,
                &request.motion_prompt,
                &request.model,
                &request.resolution,
                request.duration_sec,
            ) {
                flow.log_error(&e.to_string(), Some("ValidationError"));
                flow.end("failed");
                outcome.error_message = Some(e.to_string());
                outcome.error_kind = Some(ErrorKind::InvalidInput);
                outcome.elapsed = started.elapsed();
                return outcome;
            }
        }

        // Step 2: cooldown gate: a cooling job makes no outbound calls
        if !self.cooldown.should_process(&job_id) {
            flow.log_step("cooldown_check", "in_cooldown", serde_json::Value::Null);
            flow.end("skipped");
            outcome.error_message = Some("Job is in cooldown period".to_string());
            outcome.error_kind = Some(ErrorKind::Transient);
            outcome.elapsed = started.elapsed();
            return outcome;
        }

        // Step 3: checkpoint before the external effect
        flow.log_step("checkpoint", "writing", serde_json::Value::Null);
        {
            let mut checkpoint = self.checkpoint.lock().await;
            if let Err(e) = checkpoint.write(
                &job_id,
                "started",
                0,
                None,
                None,
                json!({
                    "model": request.model,
                    "image_url": request.image_url,
                    "prompt": request.motion_prompt,
                    "resolution": request.resolution,
                }),
            ) {
                error!(job_id = %job_id, error = %e, "checkpoint write failed");
            }
        }

        // Step 4: rate limit with a bounded wait
        flow.log_step("rate_limit", "acquiring", serde_json::Value::Null);
        if !self.rate_limiter.acquire(Some(RATE_LIMIT_TIMEOUT)).await {
            flow.log_step("rate_limit", "timeout", serde_json::Value::Null);
            flow.end("failed");
            outcome.error_message = Some("Rate limit timeout".to_string());
            outcome.error_kind = Some(ErrorKind::RateLimit);
            outcome.elapsed = started.elapsed();
            return outcome;
        }

        // Step 5: resolve the backend and submit with retry
        let Some(backend) = self.registry.get(&request.model) else {
            flow.log_error("no backend registered for model", Some("INVALID_INPUT"));
            flow.end("failed");
            outcome.error_message = Some(format!("Unknown model: {}", request.model));
            outcome.error_kind = Some(ErrorKind::InvalidInput);
            outcome.elapsed = started.elapsed();
            return outcome;
        };

        flow.log_step("submit", "submitting", serde_json::Value::Null);
        let generation_request = GenerationRequest {
            model: request.model.clone(),
            prompt: request.motion_prompt.clone(),
            image_url: Some(request.image_url.clone()),
            resolution: Some(request.resolution.clone()),
            duration_sec: Some(request.duration_sec),
            negative_prompt: request.negative_prompt.clone(),
            num_outputs: 1,
            ..Default::default()
        };

        let retry_config = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            retry_on: vec![ErrorKind::Network, ErrorKind::RateLimit, ErrorKind::Transient],
            ..RetryConfig::default()
        };

        let submit_outcome = self
            .retry
            .run(&retry_config, || backend.submit(&generation_request))
            .await;

        outcome.attempts = submit_outcome.attempts;
        self.stats
            .total_retries
            .fetch_add(submit_outcome.attempts.saturating_sub(1) as u64, Ordering::Relaxed);

        match submit_outcome.into_result() {
            Ok(request_id) => {
                // Step 6: durable record of the remote handle, cooldown reset
                flow.log_submit(&request_id);
                {
                    let mut checkpoint = self.checkpoint.lock().await;
                    let _ = checkpoint.write(
                        &job_id,
                        "submitted",
                        1,
                        None,
                        None,
                        json!({ "request_id": request_id, "model": request.model }),
                    );
                }
                self.cooldown.record_success(&job_id);
                flow.log_step("complete", "success", json!({ "request_id": request_id }));
                flow.end("success");

                self.stats.jobs_submitted.fetch_add(1, Ordering::Relaxed);
                outcome.success = true;
                outcome.request_id = Some(request_id.clone());
                outcome.elapsed = started.elapsed();

                info!(
                    job_id = %job_id,
                    request_id = %request_id,
                    model = %request.model,
                    attempts = outcome.attempts,
                    "job submitted"
                );
                outcome
            }
            Err(failure) => {
                let kind = lumen_core_resilience::ErrorClassifier::new()
                    .classify(&failure)
                    .kind;
                flow.log_error(&failure.to_string(), Some(kind.as_str()));
                flow.end("failed");

                self.cooldown.record_failure(&job_id, Some(&failure.to_string()));
                {
                    let mut checkpoint = self.checkpoint.lock().await;
                    let _ = checkpoint.mark_failed(&job_id, failure.to_string());
                }

                self.stats.jobs_failed.fetch_add(1, Ordering::Relaxed);
                self.stats.total_errors.fetch_add(1, Ordering::Relaxed);
                outcome.error_message = Some(failure.to_string());
                outcome.error_kind = Some(kind);
                outcome.elapsed = started.elapsed();

                warn!(job_id = %job_id, error = %outcome.error_message.as_deref().unwrap_or(""), "job submission failed");
                outcome
            }
        }
    }

    /// Poll a submitted job until it completes, fails, or the budget runs out.
    ///
    /// Exhausting the poll budget is reported as transient; the job is not
    /// marked failed, the next cycle simply polls again.
    pub async fn poll_job(
        &self,
        job_id: &str,
        request_id: &str,
        model: &str,
        max_polls: u32,
        poll_interval: Duration,
    ) -> JobOutcome {
        let started = Instant::now();
        let mut flow = FlowLogger::new("job", job_id, &self.flow_log_dir)
            .with_context("model", model.to_string());
        flow.start();

        let mut outcome = JobOutcome::pending(job_id.to_string());
        outcome.request_id = Some(request_id.to_string());

        let Some(backend) = self.registry.get(model) else {
            flow.end("failed");
            outcome.error_message = Some(format!("Unknown model: {}", model));
            outcome.error_kind = Some(ErrorKind::InvalidInput);
            return outcome;
        };

        let retry_config = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            retry_on: vec![ErrorKind::Network, ErrorKind::Transient],
            ..RetryConfig::default()
        };

        for poll_num in 0..max_polls {
            let poll_outcome = self
                .retry
                .run(&retry_config, || backend.poll(model, request_id))
                .await;

            let status = match poll_outcome.into_result() {
                Ok(status) => status,
                // This round failed even with retry; try the next one
                Err(_) => continue,
            };

            match status {
                PollStatus::Completed { result_url } => {
                    flow.log_complete(Some(&result_url));
                    flow.end("success");

                    {
                        let mut checkpoint = self.checkpoint.lock().await;
                        let _ = checkpoint.mark_complete(
                            job_id,
                            Some(json!({ "result_url": result_url, "request_id": request_id })),
                        );
                    }
                    self.cooldown.record_success(job_id);

                    self.stats.jobs_completed.fetch_add(1, Ordering::Relaxed);
                    outcome.success = true;
                    outcome.result_url = Some(result_url);
                    outcome.elapsed = started.elapsed();
                    return outcome;
                }
                PollStatus::Failed { message } => {
                    flow.log_error(&message, Some("PERMANENT"));
                    flow.end("failed");

                    {
                        let mut checkpoint = self.checkpoint.lock().await;
                        let _ = checkpoint.mark_failed(job_id, message.clone());
                    }
                    self.cooldown.record_failure(job_id, Some(&message));

                    self.stats.jobs_failed.fetch_add(1, Ordering::Relaxed);
                    outcome.error_message = Some(message);
                    outcome.error_kind = Some(ErrorKind::Permanent);
                    outcome.elapsed = started.elapsed();
                    return outcome;
                }
                PollStatus::Queued | PollStatus::Running => {
                    flow.log_progress(
                        (poll_num as f64 / max_polls as f64) * 100.0,
                        "still generating",
                    );
                    if poll_num + 1 < max_polls {
                        tokio::time::sleep(poll_interval).await;
                    }
                }
            }
        }

        // Budget exhausted without a terminal status
        flow.log_error("polling budget exhausted", Some("TRANSIENT"));
        flow.end("timeout");

        outcome.error_message = Some(format!("Polling timeout after {} attempts", max_polls));
        outcome.error_kind = Some(ErrorKind::Transient);
        outcome.elapsed = started.elapsed();
        outcome
    }

    /// Surface interrupted checkpoints (started/running/in_progress) for
    /// replay, marking them `recovering`
    pub async fn recover_interrupted(&self) -> std::io::Result<Vec<String>> {
        let mut checkpoint = self.checkpoint.lock().await;
        let recovered = checkpoint.recover()?;
        if !recovered.is_empty() {
            warn!(
                count = recovered.len(),
                "found interrupted jobs on startup, requeue them for processing"
            );
        }
        Ok(recovered)
    }

    /// Latest checkpoint for a job id
    pub async fn job_status(&self, job_id: &str) -> Option<lumen_core_durability::CheckpointEntry> {
        self.checkpoint.lock().await.read(job_id).cloned()
    }

    pub fn stats(&self) -> &OrchestratorStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::GenerationBackend;
    use async_trait::async_trait;
    use lumen_core_resilience::BackendFailure;
    use std::sync::atomic::AtomicU32;
    use tempfile::TempDir;

    /// Backend that fails `failures` times with the given status, then succeeds
    struct FlakyBackend {
        failures: u32,
        status: u16,
        submits: AtomicU32,
        poll_rounds_until_done: u32,
        polls: AtomicU32,
    }

    impl FlakyBackend {
        fn new(failures: u32, status: u16) -> Self {
            Self {
                failures,
                status,
                submits: AtomicU32::new(0),
                poll_rounds_until_done: 1,
                polls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl GenerationBackend for FlakyBackend {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn submit(&self, _request: &GenerationRequest) -> Result<String, BackendFailure> {
            let n = self.submits.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(BackendFailure::http(self.status, "try later"))
            } else {
                Ok("req-1".to_string())
            }
        }

        async fn poll(&self, _model: &str, _request_id: &str) -> Result<PollStatus, BackendFailure> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            if n + 1 >= self.poll_rounds_until_done {
                Ok(PollStatus::Completed {
                    result_url: "https://cdn/out.mp4".to_string(),
                })
            } else {
                Ok(PollStatus::Running)
            }
        }
    }

    fn orchestrator_with(backend: Arc<dyn GenerationBackend>, dir: &TempDir) -> JobOrchestrator {
        let mut registry = BackendRegistry::new();
        registry.register("kling", backend);
        JobOrchestrator::new(
            Arc::new(registry),
            OrchestratorConfig {
                state_dir: dir.path().to_path_buf(),
                flow_log_dir: dir.path().join("flow_logs"),
                ..OrchestratorConfig::default()
            },
        )
        .unwrap()
    }

    fn request(job_id: &str) -> SubmitRequest {
        SubmitRequest {
            job_id: Some(job_id.to_string()),
            model: "kling".to_string(),
            image_url: "https://cdn.example.com/src.jpg".to_string(),
            motion_prompt: "a gentle breeze".to_string(),
            resolution: "1080p".to_string(),
            duration_sec: 5,
            negative_prompt: None,
        }
    }

    #[tokio::test]
    async fn test_submit_success_checkpoints_and_clears_cooldown() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator_with(Arc::new(FlakyBackend::new(0, 503)), &dir);

        let outcome = orchestrator.submit_job(request("job-1")).await;
        assert!(outcome.success);
        assert_eq!(outcome.request_id.as_deref(), Some("req-1"));
        assert_eq!(outcome.attempts, 1);

        let entry = orchestrator.job_status("job-1").await.unwrap();
        assert_eq!(entry.status, "submitted");
        assert_eq!(entry.context["request_id"], "req-1");
        assert!(orchestrator.cooldown().should_process("job-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flaky_backend_retried_to_success() {
        let dir = TempDir::new().unwrap();
        // 503 twice, then accepted; paused time fast-forwards the backoff
        let backend = Arc::new(FlakyBackend::new(2, 503));
        let orchestrator = orchestrator_with(backend.clone(), &dir);

        let outcome = orchestrator.submit_job(request("job-2")).await;
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 3);
        // Success clears the cooldown counter
        let cooled = orchestrator
            .cooldown()
            .status("job-2")
            .map(|s| s.consecutive_failures == 0)
            .unwrap_or(true);
        assert!(cooled);
    }

    #[tokio::test]
    async fn test_invalid_input_fails_without_backend_call() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(FlakyBackend::new(0, 503));
        let orchestrator = orchestrator_with(backend.clone(), &dir);

        let mut bad = request("job-3");
        bad.resolution = "4k".to_string();
        let outcome = orchestrator.submit_job(bad).await;

        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(ErrorKind::InvalidInput));
        assert_eq!(backend.submits.load(Ordering::SeqCst), 0);
        // No checkpoint was written for a rejected request
        assert!(orchestrator.job_status("job-3").await.is_none());
    }

    #[tokio::test]
    async fn test_permanent_failure_sets_cooldown() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(FlakyBackend::new(99, 401));
        let orchestrator = orchestrator_with(backend.clone(), &dir);

        let outcome = orchestrator.submit_job(request("job-4")).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Permanent));
        // Permanent errors are not retried
        assert_eq!(backend.submits.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.attempts, 1);

        assert!(!orchestrator.cooldown().should_process("job-4"));
        let entry = orchestrator.job_status("job-4").await.unwrap();
        assert_eq!(entry.status, "failed");
    }

    #[tokio::test]
    async fn test_cooldown_gate_short_circuits() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(FlakyBackend::new(0, 503));
        let orchestrator = orchestrator_with(backend.clone(), &dir);

        orchestrator.cooldown().record_failure("job-5", Some("earlier failure"));
        let outcome = orchestrator.submit_job(request("job-5")).await;

        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Transient));
        assert_eq!(backend.submits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_poll_completes_and_checkpoints() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator_with(Arc::new(FlakyBackend::new(0, 503)), &dir);

        let outcome = orchestrator
            .poll_job("job-6", "req-1", "kling", 5, Duration::from_millis(1))
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.result_url.as_deref(), Some("https://cdn/out.mp4"));

        let entry = orchestrator.job_status("job-6").await.unwrap();
        assert_eq!(entry.status, "completed");
        assert_eq!(entry.result.unwrap()["result_url"], "https://cdn/out.mp4");
    }

    #[tokio::test]
    async fn test_poll_exhaustion_is_transient() {
        struct NeverDone;
        #[async_trait]
        impl GenerationBackend for NeverDone {
            fn name(&self) -> &str {
                "never"
            }
            async fn submit(&self, _r: &GenerationRequest) -> Result<String, BackendFailure> {
                Ok("req".into())
            }
            async fn poll(&self, _m: &str, _r: &str) -> Result<PollStatus, BackendFailure> {
                Ok(PollStatus::Running)
            }
        }

        let dir = TempDir::new().unwrap();
        let mut registry = BackendRegistry::new();
        registry.register("kling", Arc::new(NeverDone));
        let orchestrator = JobOrchestrator::new(
            Arc::new(registry),
            OrchestratorConfig {
                state_dir: dir.path().to_path_buf(),
                flow_log_dir: dir.path().join("flow_logs"),
                ..OrchestratorConfig::default()
            },
        )
        .unwrap();

        let outcome = orchestrator
            .poll_job("job-7", "req", "kling", 3, Duration::from_millis(1))
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Transient));
        // Exhaustion does not mark the job failed
        assert!(orchestrator.job_status("job-7").await.is_none());
    }

    #[tokio::test]
    async fn test_recover_interrupted_surfaces_started_jobs() {
        let dir = TempDir::new().unwrap();

        // First process: checkpoint "started" then vanish
        {
            let orchestrator = orchestrator_with(Arc::new(FlakyBackend::new(99, 500)), &dir);
            let mut checkpoint = orchestrator.checkpoint.lock().await;
            checkpoint
                .write("job-8", "started", 0, None, None, json!({"model": "kling"}))
                .unwrap();
        }

        // Second process recovers it
        let orchestrator = orchestrator_with(Arc::new(FlakyBackend::new(0, 500)), &dir);
        let recovered = orchestrator.recover_interrupted().await.unwrap();
        assert_eq!(recovered, vec!["job-8".to_string()]);

        let entry = orchestrator.job_status("job-8").await.unwrap();
        assert_eq!(entry.status, "recovering");
    }
}
