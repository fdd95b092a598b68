//! Lumen: multi-tenant media-generation orchestrator
//!
//! The binary wires the dispatch engine to its environment: SQLite store,
//! generation backends, object cache, and the reliability state directory.
//! Subcommands cover the operational surface: the worker loop, crash
//! recovery, batch submission, status, cancellation, and tenant seeding.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lumen_dispatch::adapters::{BackendRegistry, RegistryGenerator, RelayBackend, TunnelBackend};
use lumen_dispatch::cache::ObjectCache;
use lumen_dispatch::orchestrator::{JobOrchestrator, OrchestratorConfig};
use lumen_dispatch::pricing::{JobConfig, OutputKind};
use lumen_dispatch::queue::{BatchQueue, QueueConfig};
use lumen_dispatch::store::SqliteStore;
use lumen_dispatch::worker::{JobWorker, WorkerConfig};
use lumen_dispatch::{ItemSpec, Tier};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

mod config;
mod logging;

use config::Settings;

/// Model keys served by the relay (cloud inference) backend
const RELAY_MODELS: [&str; 14] = [
    "wan",
    "wan21",
    "wan22",
    "wan-pro",
    "kling",
    "kling-standard",
    "kling-master",
    "veo2",
    "veo31",
    "veo31-fast",
    "sora-2",
    "sora-2-pro",
    "kling-image",
    "nano-banana",
];

#[derive(Parser)]
#[command(name = "lumen", version, about = "Media-generation batch orchestrator")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Write logs to this file as JSON lines instead of stdout
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run recovery, then the worker loop until interrupted
    Worker {
        /// Seconds between worker cycles
        #[arg(long, default_value_t = 10)]
        interval: u64,
        /// Jobs claimed and submitted per cycle
        #[arg(long, default_value_t = 5)]
        submit_limit: i64,
        /// Submitted jobs polled per cycle
        #[arg(long, default_value_t = 10)]
        poll_limit: i64,
    },

    /// Submit a batch job and wait for it to finish
    Submit {
        /// Owning user id
        #[arg(long)]
        user: i64,
        /// Output type: image, video, carousel, pipeline
        #[arg(long)]
        output_type: String,
        /// Number of items to generate
        #[arg(long, default_value_t = 1)]
        quantity: u32,
        /// Job configuration as JSON (tagged with "type")
        #[arg(long)]
        config: String,
        /// Per-item prompt; repeat for each item
        #[arg(long = "prompt")]
        prompts: Vec<String>,
    },

    /// Show a batch job's database state
    Status {
        /// Batch job uuid
        job_id: String,
    },

    /// Cancel a batch job and refund its incomplete items
    Cancel {
        /// Batch job uuid
        job_id: String,
        /// Requesting user id (must own the job)
        #[arg(long)]
        user: i64,
    },

    /// Re-enqueue interrupted batch jobs and drain them
    Recover,

    /// Create a tenant
    CreateUser {
        /// Tier: free, starter, pro, agency
        #[arg(long, default_value = "free")]
        tier: String,
        /// Initial credit balance
        #[arg(long, default_value_t = 0)]
        credits: i64,
    },
}

fn build_registry(settings: &Settings) -> BackendRegistry {
    let mut registry = BackendRegistry::new();

    if let (Some(base_url), Some(api_key)) = (&settings.relay_base_url, &settings.relay_api_key) {
        let relay = Arc::new(RelayBackend::new(base_url.clone(), api_key.clone()));
        registry.register_many(&RELAY_MODELS, relay);
        info!(models = RELAY_MODELS.len(), "relay backend registered");
    } else {
        warn!("relay backend not configured (LUMEN_RELAY_BASE_URL / LUMEN_RELAY_API_KEY)");
    }

    if let Some(base_url) = &settings.tunnel_base_url {
        let tunnel = Arc::new(TunnelBackend::new(base_url.clone()));
        registry.register_many(&["sdxl", "sdxl-nsfw"], tunnel);
        info!("tunnel backend registered");
    }

    registry
}

struct Runtime {
    store: SqliteStore,
    queue: BatchQueue,
    orchestrator: Arc<JobOrchestrator>,
}

async fn build_runtime(settings: &Settings) -> Result<Runtime> {
    let store = SqliteStore::open(&settings.database_url)
        .await
        .with_context(|| format!("failed to open database {}", settings.database_url))?;

    let registry = Arc::new(build_registry(settings));

    let cache = match &settings.object_cache {
        Some(config) => match ObjectCache::new(config) {
            Ok(cache) => Some(Arc::new(cache)),
            Err(e) => {
                warn!(error = %e, "object cache unavailable, results keep their source URLs");
                None
            }
        },
        None => {
            warn!("object storage not configured, caching disabled");
            None
        }
    };

    let mut generator = RegistryGenerator::new(registry.clone());
    if let Some(cache) = cache {
        generator = generator.with_cache(cache, Some(store.clone()));
    }

    let queue = BatchQueue::new(
        store.clone(),
        Arc::new(generator),
        QueueConfig {
            max_concurrency: settings.max_concurrency,
            ..QueueConfig::default()
        },
    );

    let orchestrator = Arc::new(JobOrchestrator::new(
        registry,
        OrchestratorConfig {
            state_dir: settings.state_dir.clone(),
            flow_log_dir: settings.state_dir.join("flow_logs"),
            ..OrchestratorConfig::default()
        },
    )?);

    Ok(Runtime {
        store,
        queue,
        orchestrator,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose, cli.log_file.as_deref())?;

    let settings = Settings::from_env();

    match cli.command {
        Command::Worker {
            interval,
            submit_limit,
            poll_limit,
        } => run_worker(&settings, interval, submit_limit, poll_limit).await,
        Command::Submit {
            user,
            output_type,
            quantity,
            config,
            prompts,
        } => run_submit(&settings, user, &output_type, quantity, &config, prompts).await,
        Command::Status { job_id } => run_status(&settings, &job_id).await,
        Command::Cancel { job_id, user } => run_cancel(&settings, &job_id, user).await,
        Command::Recover => run_recover(&settings).await,
        Command::CreateUser { tier, credits } => run_create_user(&settings, &tier, credits).await,
    }
}

async fn run_worker(
    settings: &Settings,
    interval: u64,
    submit_limit: i64,
    poll_limit: i64,
) -> Result<()> {
    let runtime = build_runtime(settings).await?;

    // Recovery before accepting any new work
    let recovered_batches = runtime.queue.recover().await?;
    let recovered_jobs = runtime.orchestrator.recover_interrupted().await?;
    info!(
        batches = recovered_batches,
        jobs = recovered_jobs.len(),
        "startup recovery complete"
    );

    let worker = Arc::new(JobWorker::new(
        runtime.store.clone(),
        runtime.orchestrator.clone(),
        WorkerConfig {
            poll_interval: Duration::from_secs(interval),
            submit_limit,
            poll_limit,
            lock_dir: settings.state_dir.join(".locks"),
            flow_log_dir: settings.state_dir.join("flow_logs"),
            ..WorkerConfig::default()
        },
        None,
    ));

    let loop_worker = worker.clone();
    let worker_task = tokio::spawn(async move { loop_worker.run_forever().await });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");

    worker.stop();
    runtime.queue.shutdown().await;
    let _ = worker_task.await;

    Ok(())
}

async fn run_submit(
    settings: &Settings,
    user: i64,
    output_type: &str,
    quantity: u32,
    config_json: &str,
    prompts: Vec<String>,
) -> Result<()> {
    let runtime = build_runtime(settings).await?;

    let output_type = OutputKind::from_str(output_type)?;
    let config: JobConfig =
        serde_json::from_str(config_json).context("invalid --config JSON")?;

    let item_specs = if prompts.is_empty() {
        None
    } else {
        if prompts.len() != quantity as usize {
            bail!(
                "got {} prompts for {} items; pass one --prompt per item",
                prompts.len(),
                quantity
            );
        }
        Some(
            prompts
                .into_iter()
                .map(|prompt| ItemSpec {
                    prompt: Some(prompt),
                    ..Default::default()
                })
                .collect(),
        )
    };

    let job_id = runtime
        .queue
        .submit(user, output_type, quantity, config, item_specs)
        .await?;
    println!("submitted {}", job_id);

    runtime.queue.wait(&job_id).await;

    let job = runtime
        .store
        .get_job(&job_id)
        .await?
        .context("job vanished after submit")?;
    println!(
        "{}: {} ({} completed, {} failed, {} pending)",
        job_id, job.status, job.completed_items, job.failed_items, job.pending_items
    );
    Ok(())
}

async fn run_status(settings: &Settings, job_id: &str) -> Result<()> {
    let store = SqliteStore::open(&settings.database_url).await?;
    let Some(job) = store.get_job(job_id).await? else {
        bail!("job {} not found", job_id);
    };

    println!("job:       {}", job.job_id);
    println!("status:    {}", job.status);
    println!("type:      {}", job.output_type);
    println!("model:     {}", job.config.model());
    println!(
        "progress:  {}/{} completed, {} failed, {} pending",
        job.completed_items, job.quantity, job.failed_items, job.pending_items
    );
    println!(
        "credits:   {} charged, {} refunded",
        job.credits_charged, job.credits_refunded
    );
    if let Some(avg) = job.avg_item_duration_ms {
        println!("avg item:  {} ms", avg);
    }
    if let Some(eta) = job.estimated_completion {
        println!("eta:       {}", eta.to_rfc3339());
    }
    if let Some(error) = &job.error_message {
        println!("error:     {}", error);
    }
    Ok(())
}

async fn run_cancel(settings: &Settings, job_id: &str, user: i64) -> Result<()> {
    let runtime = build_runtime(settings).await?;

    if runtime.queue.cancel(job_id, user).await? {
        let job = runtime
            .store
            .get_job(job_id)
            .await?
            .context("job vanished after cancel")?;
        println!("canceled {} (refunded {} credits)", job_id, job.credits_refunded);
    } else {
        println!("{} is already finished (or unknown); nothing to cancel", job_id);
    }
    Ok(())
}

async fn run_recover(settings: &Settings) -> Result<()> {
    let runtime = build_runtime(settings).await?;

    let recovered = runtime.queue.recover().await?;
    let interrupted = runtime.orchestrator.recover_interrupted().await?;
    println!(
        "recovered {} batch job(s), {} interrupted single job(s)",
        recovered,
        interrupted.len()
    );

    // Drain the re-spawned coordinators before exiting
    for job in runtime.store.active_jobs().await? {
        runtime.queue.wait(&job.job_id).await;
    }
    Ok(())
}

async fn run_create_user(settings: &Settings, tier: &str, credits: i64) -> Result<()> {
    let store = SqliteStore::open(&settings.database_url).await?;
    let tier = Tier::from_str(tier)?;
    let user_id = store.create_user(tier, credits).await?;
    println!("created user {} ({}, {} credits)", user_id, tier, credits);
    Ok(())
}
