//! Retry execution with exponential backoff and jitter
//!
//! Failed operations are retried with progressively longer delays, up to a
//! cap. Jitter is randomized to prevent thundering herds when many items hit
//! the same failing backend at once.
//!
//! Formula: `delay = min(base * multiplier^(attempt-1) * (1 ± jitter), max_delay)`
//! where `base` comes from the classified error when available.
//!
//! # Example
//!
//! ```no_run
//! use lumen_core_resilience::{BackendFailure, RetryConfig, RetryManager};
//!
//! # async fn example() {
//! let retry = RetryManager::new();
//! let outcome = retry
//!     .run(&RetryConfig::default(), || async {
//!         Err::<(), _>(BackendFailure::http(503, "unavailable"))
//!     })
//!     .await;
//!
//! assert!(!outcome.is_success());
//! assert_eq!(outcome.attempts, 3);
//! # }
//! ```

use crate::error::{BackendFailure, ClassifiedError, ErrorClassifier, ErrorKind};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
    /// Base delay before the first retry (overridden by the classified error's base)
    pub base_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
    /// Exponential growth factor per attempt
    pub multiplier: f64,
    /// Jitter fraction (0.1 = ±10%)
    pub jitter_factor: f64,
    /// Error kinds worth retrying
    pub retry_on: Vec<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter_factor: 0.1,
            retry_on: vec![ErrorKind::Network, ErrorKind::RateLimit, ErrorKind::Transient],
        }
    }
}

impl RetryConfig {
    /// Check whether an error kind should be retried under this config
    pub fn should_retry(&self, kind: ErrorKind) -> bool {
        self.retry_on.contains(&kind)
    }
}

/// Result of a retried operation
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// The successful value, if any attempt succeeded
    pub value: Option<T>,
    /// The last failure, if all attempts failed
    pub error: Option<BackendFailure>,
    /// Number of attempts made
    pub attempts: u32,
    /// Total time spent sleeping between attempts
    pub total_delay: Duration,
    /// Classification of the last failure
    pub classified: Option<ClassifiedError>,
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.value.is_some()
    }

    /// Collapse into a plain `Result`, dropping attempt bookkeeping
    pub fn into_result(self) -> Result<T, BackendFailure> {
        match self.value {
            Some(v) => Ok(v),
            None => Err(self
                .error
                .unwrap_or_else(|| BackendFailure::other("retry exhausted with no error recorded"))),
        }
    }
}

/// Executes operations with classifier-driven retry.
///
/// The manager is stateless and cheap to clone; share one per process and
/// pass a [`RetryConfig`] per call site.
#[derive(Debug, Clone, Default)]
pub struct RetryManager {
    classifier: ErrorClassifier,
}

impl RetryManager {
    pub fn new() -> Self {
        Self {
            classifier: ErrorClassifier::new(),
        }
    }

    /// Calculate the delay before the next attempt.
    ///
    /// `attempt` is 1-based (the attempt that just failed).
    pub fn delay_for(
        &self,
        attempt: u32,
        config: &RetryConfig,
        classified: Option<&ClassifiedError>,
    ) -> Duration {
        let base = classified
            .map(|c| c.base_delay)
            .filter(|d| !d.is_zero())
            .unwrap_or(config.base_delay);

        let exp = base.as_secs_f64() * config.multiplier.powi(attempt.saturating_sub(1) as i32);

        let jittered = if config.jitter_factor > 0.0 {
            let spread = exp * config.jitter_factor;
            exp + rand::rng().random_range(-spread..=spread)
        } else {
            exp
        };

        let capped = jittered.clamp(0.0, config.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Execute an async operation with retry.
    ///
    /// The operation is re-invoked for each attempt. Retry stops when it
    /// succeeds, the error class is not retryable, or attempts are exhausted.
    pub async fn run<T, F, Fut>(&self, config: &RetryConfig, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendFailure>>,
    {
        let mut attempts = 0u32;
        let mut total_delay = Duration::ZERO;
        let mut last_error: Option<BackendFailure> = None;
        let mut last_classified: Option<ClassifiedError> = None;

        while attempts < config.max_attempts {
            attempts += 1;
            debug!(attempt = attempts, max_attempts = config.max_attempts, "executing operation");

            match op().await {
                Ok(value) => {
                    debug!(
                        attempt = attempts,
                        total_delay_ms = total_delay.as_millis() as u64,
                        "operation succeeded"
                    );
                    return RetryOutcome {
                        value: Some(value),
                        error: None,
                        attempts,
                        total_delay,
                        classified: None,
                    };
                }
                Err(failure) => {
                    let classified = self.classifier.classify(&failure);
                    warn!(
                        attempt = attempts,
                        max_attempts = config.max_attempts,
                        kind = classified.kind.as_str(),
                        retryable = classified.retryable,
                        error = %failure,
                        "operation failed"
                    );

                    let retryable = config.should_retry(classified.kind);
                    last_error = Some(failure);
                    last_classified = Some(classified.clone());

                    if !retryable {
                        info!(kind = classified.kind.as_str(), "error not retryable, failing immediately");
                        break;
                    }

                    if attempts >= config.max_attempts {
                        warn!(
                            attempts,
                            total_delay_ms = total_delay.as_millis() as u64,
                            "max attempts exhausted"
                        );
                        break;
                    }

                    let delay = self.delay_for(attempts, config, Some(&classified));
                    total_delay += delay;
                    info!(
                        attempt = attempts,
                        next_attempt = attempts + 1,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after delay"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        RetryOutcome {
            value: None,
            error: last_error,
            attempts,
            total_delay,
            classified: last_classified,
        }
    }
}
