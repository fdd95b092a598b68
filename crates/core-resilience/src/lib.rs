//! Lumen Core Resilience: Pure-logic fault tolerance primitives
//!
//! # Overview
//!
//! Every outbound call Lumen makes (cloud inference APIs, self-hosted GPU
//! services behind tunnels, object storage) goes through the primitives in
//! this crate:
//!
//! - **Error Classifier**: Maps a raw failure to a retry class with per-class policy
//! - **Retry Manager**: Exponential backoff with jitter, bounded by attempts and delay caps
//! - **Rate Limiters**: Sliding-window and token-bucket admission control
//! - **Cooldown Tracker**: Per-entity consecutive-failure backoff with a stepped schedule
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Storage systems (databases, object stores)
//! - Concrete wire protocols or HTTP clients
//! - Application-specific concerns
//!
//! Callers translate their transport errors into [`BackendFailure`] and get
//! classification, retry, and backoff decisions back.
//!
//! # Usage Example
//!
//! ```no_run
//! use lumen_core_resilience::{BackendFailure, RetryConfig, RetryManager};
//!
//! # async fn example() {
//! let retry = RetryManager::new();
//! let config = RetryConfig::default();
//!
//! let outcome = retry
//!     .run(&config, || async {
//!         // Your potentially failing operation
//!         Ok::<_, BackendFailure>(42)
//!     })
//!     .await;
//!
//! assert!(outcome.is_success());
//! # }
//! ```

pub mod cooldown;
pub mod error;
pub mod rate_limiter;
pub mod retry;

// Re-export main types for convenience
pub use cooldown::{CooldownState, CooldownStats, CooldownTracker, COOLDOWN_SCHEDULE};
pub use error::{BackendFailure, ClassifiedError, ErrorClassifier, ErrorKind};
pub use rate_limiter::{
    MultiLimiter, RateLimitStats, RateLimiter, SlidingWindowLimiter, TokenBucketLimiter,
};
pub use retry::{RetryConfig, RetryManager, RetryOutcome};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use lumen_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::cooldown::CooldownTracker;
    pub use super::error::{BackendFailure, ClassifiedError, ErrorClassifier, ErrorKind};
    pub use super::rate_limiter::{SlidingWindowLimiter, TokenBucketLimiter};
    pub use super::retry::{RetryConfig, RetryManager, RetryOutcome};
}
