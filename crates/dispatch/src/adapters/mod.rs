//! Generation backend adapters
//!
//! One adapter per remote backend family, all behind the same stateless
//! contract: `submit` hands work to the backend and returns a request id,
//! `poll` reports where that request stands. Adapters raise on every
//! failure, including transient ones; classification and retry belong to
//! the orchestration layer, never to the adapter.
//!
//! Dispatch is by model key through a [`BackendRegistry`] built at startup.
//! No open inheritance: the registry is the closed set of backends this
//! process can talk to.

use crate::pricing::JobConfig;
use crate::store::BatchItemRow;
use async_trait::async_trait;
use lumen_core_resilience::{BackendFailure, ErrorKind, RetryConfig, RetryManager};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub mod relay;
pub mod tunnel;

pub use relay::RelayBackend;
pub use tunnel::TunnelBackend;

/// Interval between polls inside [`GenerationBackend::generate`]
const POLL_INTERVAL: Duration = Duration::from_secs(3);
/// Upper bound on a single generation, submit to final status
const MAX_POLL_TIME: Duration = Duration::from_secs(600);

/// Everything a backend needs to produce one artifact
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
    pub image_url: Option<String>,
    pub resolution: Option<String>,
    pub duration_sec: Option<u32>,
    pub aspect_ratio: Option<String>,
    pub negative_prompt: Option<String>,
    pub num_outputs: u32,
}

/// Where a submitted request currently stands
#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus {
    Queued,
    Running,
    Completed { result_url: String },
    Failed { message: String },
}

/// Uniform contract over remote generation backends.
///
/// Implementations are stateless: no retry, no cooldown, no persistence.
/// They translate transport errors into [`BackendFailure`] and nothing else.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Stable adapter name for logs
    fn name(&self) -> &str;

    /// Submit a generation request, returning the remote request id
    async fn submit(&self, request: &GenerationRequest) -> Result<String, BackendFailure>;

    /// Poll a previously submitted request
    async fn poll(&self, model: &str, request_id: &str) -> Result<PollStatus, BackendFailure>;

    /// Submit and poll to completion. Used by the batch path, where the
    /// caller applies retry around the whole call.
    async fn generate(&self, request: &GenerationRequest) -> Result<String, BackendFailure> {
        let request_id = self.submit(request).await?;
        debug!(backend = self.name(), model = %request.model, request_id = %request_id, "submitted");

        let mut elapsed = Duration::ZERO;
        while elapsed < MAX_POLL_TIME {
            match self.poll(&request.model, &request_id).await? {
                PollStatus::Completed { result_url } => {
                    info!(backend = self.name(), request_id = %request_id, "generation completed");
                    return Ok(result_url);
                }
                PollStatus::Failed { message } => {
                    return Err(BackendFailure::other(message));
                }
                PollStatus::Queued | PollStatus::Running => {
                    tokio::time::sleep(POLL_INTERVAL).await;
                    elapsed += POLL_INTERVAL;
                }
            }
        }

        Err(BackendFailure::Timeout(format!(
            "generation timed out after {}s",
            MAX_POLL_TIME.as_secs()
        )))
    }
}

/// Closed set of backends this process can dispatch to, keyed by model.
///
/// Backends register under the model keys they serve at startup; the queue
/// looks up `config.model` and dispatches through the trait.
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn GenerationBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend for a model key. Later registrations win.
    pub fn register(&mut self, model: impl Into<String>, backend: Arc<dyn GenerationBackend>) {
        let model = model.into();
        debug!(model = %model, backend = backend.name(), "backend registered");
        self.backends.insert(model, backend);
    }

    /// Register one backend for several model keys
    pub fn register_many(&mut self, models: &[&str], backend: Arc<dyn GenerationBackend>) {
        for model in models {
            self.register(*model, backend.clone());
        }
    }

    pub fn get(&self, model: &str) -> Option<Arc<dyn GenerationBackend>> {
        self.backends.get(model).cloned()
    }

    pub fn models(&self) -> Vec<&str> {
        self.backends.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

/// The generation function contract the batch queue depends on: one item in,
/// one result URL out, raising on any failure.
#[async_trait]
pub trait ItemGenerator: Send + Sync {
    async fn generate(
        &self,
        item: &BatchItemRow,
        config: &JobConfig,
    ) -> Result<String, BackendFailure>;
}

/// Production [`ItemGenerator`]: resolves the backend from the registry,
/// runs the request with backoff retry (chaining image → video for
/// pipelines), then copies the result into the object cache when one is
/// configured.
pub struct RegistryGenerator {
    registry: Arc<BackendRegistry>,
    retry: RetryManager,
    retry_config: RetryConfig,
    cache: Option<Arc<crate::cache::ObjectCache>>,
    store: Option<crate::store::SqliteStore>,
}

impl RegistryGenerator {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self {
            registry,
            retry: RetryManager::new(),
            retry_config: RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_secs(2),
                retry_on: vec![ErrorKind::Network, ErrorKind::RateLimit, ErrorKind::Transient],
                ..RetryConfig::default()
            },
            cache: None,
            store: None,
        }
    }

    /// Cache result URLs into object storage, recording them in the upload
    /// cache table when a store is attached
    pub fn with_cache(
        mut self,
        cache: Arc<crate::cache::ObjectCache>,
        store: Option<crate::store::SqliteStore>,
    ) -> Self {
        self.cache = Some(cache);
        self.store = store;
        self
    }

    fn backend_for(&self, model: &str) -> Result<Arc<dyn GenerationBackend>, BackendFailure> {
        self.registry
            .get(model)
            .ok_or_else(|| BackendFailure::other(format!("invalid model: no backend for '{}'", model)))
    }

    /// Run a backend request through classifier-driven retry
    async fn run_backend(
        &self,
        backend: &Arc<dyn GenerationBackend>,
        request: GenerationRequest,
    ) -> Result<String, BackendFailure> {
        self.retry
            .run(&self.retry_config, || backend.generate(&request))
            .await
            .into_result()
    }

    fn item_image_url(item: &BatchItemRow, config: &JobConfig) -> Option<String> {
        item.variation_params
            .as_ref()
            .and_then(|params| params.get("image_url"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| config.image_url().map(str::to_string))
    }

    fn item_prompt(item: &BatchItemRow) -> Result<String, BackendFailure> {
        item.prompt
            .clone()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| BackendFailure::other("invalid item: prompt is required"))
    }

    async fn cache_result(&self, source_url: String, prefix: &str) -> String {
        let Some(cache) = &self.cache else {
            return source_url;
        };

        match cache.cache_url(&source_url, prefix).await {
            Some(cached) => {
                if let Some(store) = &self.store {
                    let _ = store
                        .upload_cache_insert(&source_url, &cached.content_hash, &cached.url)
                        .await;
                }
                cached.url
            }
            None => source_url,
        }
    }
}

#[async_trait]
impl ItemGenerator for RegistryGenerator {
    async fn generate(
        &self,
        item: &BatchItemRow,
        config: &JobConfig,
    ) -> Result<String, BackendFailure> {
        let prompt = Self::item_prompt(item)?;
        let image_url = Self::item_image_url(item, config);

        match config {
            JobConfig::Image {
                model, aspect_ratio, ..
            } => {
                let backend = self.backend_for(model)?;
                let url = self
                    .run_backend(
                        &backend,
                        GenerationRequest {
                            model: model.clone(),
                            prompt,
                            image_url,
                            aspect_ratio: aspect_ratio.clone(),
                            num_outputs: 1,
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(self.cache_result(url, "images").await)
            }
            JobConfig::Video {
                model,
                resolution,
                duration_sec,
                negative_prompt,
                ..
            } => {
                let backend = self.backend_for(model)?;
                let url = self
                    .run_backend(
                        &backend,
                        GenerationRequest {
                            model: model.clone(),
                            prompt,
                            image_url,
                            resolution: resolution.clone(),
                            duration_sec: Some(*duration_sec),
                            negative_prompt: negative_prompt.clone(),
                            num_outputs: 1,
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(self.cache_result(url, "videos").await)
            }
            JobConfig::Carousel {
                model, aspect_ratio, ..
            } => {
                let backend = self.backend_for(model)?;
                let url = self
                    .run_backend(
                        &backend,
                        GenerationRequest {
                            model: model.clone(),
                            prompt,
                            image_url,
                            aspect_ratio: aspect_ratio.clone(),
                            num_outputs: 1,
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(self.cache_result(url, "images").await)
            }
            JobConfig::Pipeline {
                image_model,
                video_model,
                resolution,
                duration_sec,
                ..
            } => {
                // Stage 1: still image
                let image_backend = self.backend_for(image_model)?;
                let still_url = self
                    .run_backend(
                        &image_backend,
                        GenerationRequest {
                            model: image_model.clone(),
                            prompt: prompt.clone(),
                            image_url,
                            num_outputs: 1,
                            ..Default::default()
                        },
                    )
                    .await?;

                // Stage 2: animate the still
                let video_backend = self.backend_for(video_model)?;
                let url = self
                    .run_backend(
                        &video_backend,
                        GenerationRequest {
                            model: video_model.clone(),
                            prompt,
                            image_url: Some(still_url),
                            resolution: resolution.clone(),
                            duration_sec: Some(*duration_sec),
                            num_outputs: 1,
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(self.cache_result(url, "videos").await)
            }
        }
    }
}
