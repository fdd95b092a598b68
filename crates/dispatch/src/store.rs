//! SQLite persistence layer
//!
//! WAL-mode SQLite behind a connection pool, schema managed by embedded
//! migrations. Timestamps are RFC 3339 UTC strings; status fields are the
//! lowercase forms of the enums in the crate root.
//!
//! Counter updates on `batch_jobs` always run in the same transaction as the
//! item-row write, so `completed + failed + pending = quantity` holds at
//! every commit point.

use crate::pricing::{JobConfig, OutputKind};
use crate::{BatchStatus, ItemSpec, ItemStatus, SingleJobStatus, Tier};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection};
use std::str::FromStr;

/// A tenant row
#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub tier: Tier,
    pub credits_balance: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// A batch job row
#[derive(Debug, Clone)]
pub struct BatchJobRow {
    pub id: i64,
    pub job_id: String,
    pub user_id: i64,
    pub output_type: OutputKind,
    pub config: JobConfig,
    pub quantity: i64,
    pub completed_items: i64,
    pub failed_items: i64,
    pub pending_items: i64,
    pub credits_charged: i64,
    pub credits_refunded: i64,
    pub status: BatchStatus,
    pub error_message: Option<String>,
    pub avg_item_duration_ms: Option<i64>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A batch job item row
#[derive(Debug, Clone)]
pub struct BatchItemRow {
    pub id: i64,
    pub batch_job_id: i64,
    pub item_index: i64,
    pub prompt: Option<String>,
    pub caption: Option<String>,
    pub variation_params: Option<serde_json::Value>,
    pub status: ItemStatus,
    pub result_url: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

/// A legacy single-video job row
#[derive(Debug, Clone)]
pub struct SingleJobRow {
    pub id: i64,
    pub model: String,
    pub image_url: String,
    pub motion_prompt: String,
    pub resolution: String,
    pub duration_sec: i64,
    pub negative_prompt: Option<String>,
    pub status: SingleJobStatus,
    pub request_id: Option<String>,
    pub video_url: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Snapshot of a job's counters after a transactional update
#[derive(Debug, Clone, Copy)]
pub struct BatchCounters {
    pub quantity: i64,
    pub completed: i64,
    pub failed: i64,
    pub pending: i64,
    pub avg_item_duration_ms: Option<i64>,
    pub eta_seconds: Option<i64>,
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp: {}", raw))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

fn row_to_user(row: &SqliteRow) -> Result<UserRow> {
    Ok(UserRow {
        id: row.try_get("id")?,
        tier: Tier::from_str(&row.try_get::<String, _>("tier")?)?,
        credits_balance: row.try_get("credits_balance")?,
        is_active: row.try_get::<i64, _>("is_active")? != 0,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn row_to_batch_job(row: &SqliteRow) -> Result<BatchJobRow> {
    let config_raw: String = row.try_get("config")?;
    Ok(BatchJobRow {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        user_id: row.try_get("user_id")?,
        output_type: OutputKind::from_str(&row.try_get::<String, _>("output_type")?)?,
        config: serde_json::from_str(&config_raw).context("invalid job config blob")?,
        quantity: row.try_get("quantity")?,
        completed_items: row.try_get("completed_items")?,
        failed_items: row.try_get("failed_items")?,
        pending_items: row.try_get("pending_items")?,
        credits_charged: row.try_get("credits_charged")?,
        credits_refunded: row.try_get("credits_refunded")?,
        status: BatchStatus::from_str(&row.try_get::<String, _>("status")?)?,
        error_message: row.try_get("error_message")?,
        avg_item_duration_ms: row.try_get("avg_item_duration_ms")?,
        estimated_completion: parse_opt_ts(row.try_get("estimated_completion")?)?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        started_at: parse_opt_ts(row.try_get("started_at")?)?,
        finished_at: parse_opt_ts(row.try_get("finished_at")?)?,
    })
}

fn row_to_item(row: &SqliteRow) -> Result<BatchItemRow> {
    let params_raw: Option<String> = row.try_get("variation_params")?;
    Ok(BatchItemRow {
        id: row.try_get("id")?,
        batch_job_id: row.try_get("batch_job_id")?,
        item_index: row.try_get("item_index")?,
        prompt: row.try_get("prompt")?,
        caption: row.try_get("caption")?,
        variation_params: params_raw
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("invalid variation params blob")?,
        status: ItemStatus::from_str(&row.try_get::<String, _>("status")?)?,
        result_url: row.try_get("result_url")?,
        error_message: row.try_get("error_message")?,
        started_at: parse_opt_ts(row.try_get("started_at")?)?,
        finished_at: parse_opt_ts(row.try_get("finished_at")?)?,
        duration_ms: row.try_get("duration_ms")?,
    })
}

fn row_to_single_job(row: &SqliteRow) -> Result<SingleJobRow> {
    Ok(SingleJobRow {
        id: row.try_get("id")?,
        model: row.try_get("model")?,
        image_url: row.try_get("image_url")?,
        motion_prompt: row.try_get("motion_prompt")?,
        resolution: row.try_get("resolution")?,
        duration_sec: row.try_get("duration_sec")?,
        negative_prompt: row.try_get("negative_prompt")?,
        status: SingleJobStatus::from_str(&row.try_get::<String, _>("status")?)?,
        request_id: row.try_get("request_id")?,
        video_url: row.try_get("video_url")?,
        error_message: row.try_get("error_message")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

/// SQLite-backed store for the whole dispatch data model
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open or create a database at the specified path.
    ///
    /// Automatically runs migrations to set up the schema.
    pub async fn open(path: &str) -> Result<Self> {
        let db_url = if path.starts_with("sqlite://") {
            path.to_string()
        } else {
            format!("sqlite://{}", path)
        };

        if !sqlx::Sqlite::database_exists(&db_url).await.unwrap_or(false) {
            sqlx::Sqlite::create_database(&db_url)
                .await
                .context("Failed to create database")?;
        }

        // WAL mode for concurrent readers alongside the single writer
        let options = SqliteConnectOptions::from_str(&db_url)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self { pool })
    }

    /// Get the underlying pool (for transactions spanning modules)
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ── users ──

    pub async fn create_user(&self, tier: Tier, credits_balance: i64) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO users (tier, credits_balance, is_active, created_at) VALUES (?, ?, 1, ?)",
        )
        .bind(tier.to_string())
        .bind(credits_balance)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_user(&self, user_id: i64) -> Result<Option<UserRow>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_user).transpose()
    }

    pub async fn set_user_active(&self, user_id: i64, active: bool) -> Result<()> {
        sqlx::query("UPDATE users SET is_active = ? WHERE id = ?")
            .bind(active as i64)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// User lookup inside an open transaction
    pub async fn get_user_conn(
        conn: &mut SqliteConnection,
        user_id: i64,
    ) -> Result<Option<UserRow>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await?;

        row.as_ref().map(row_to_user).transpose()
    }

    /// Count of this user's jobs in {queued, running}, inside a transaction
    pub async fn count_active_jobs_conn(conn: &mut SqliteConnection, user_id: i64) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM batch_jobs
             WHERE user_id = ? AND status IN ('queued', 'running')",
        )
        .bind(user_id)
        .fetch_one(&mut *conn)
        .await?;

        Ok(row.try_get("n")?)
    }

    // ── batch jobs ──

    /// Insert a new batch job row inside a transaction, returning its db id
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_batch_job_conn(
        conn: &mut SqliteConnection,
        job_id: &str,
        user_id: i64,
        output_type: OutputKind,
        config: &JobConfig,
        quantity: u32,
        credits_charged: i64,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO batch_jobs
                 (job_id, user_id, output_type, config, quantity, pending_items,
                  credits_charged, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 'queued', ?)",
        )
        .bind(job_id)
        .bind(user_id)
        .bind(output_type.to_string())
        .bind(serde_json::to_string(config)?)
        .bind(quantity as i64)
        .bind(quantity as i64)
        .bind(credits_charged)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *conn)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Insert one item row inside a transaction
    pub async fn insert_item_conn(
        conn: &mut SqliteConnection,
        batch_job_id: i64,
        item_index: u32,
        spec: &ItemSpec,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO batch_job_items (batch_job_id, item_index, prompt, caption, variation_params, status)
             VALUES (?, ?, ?, ?, ?, 'pending')",
        )
        .bind(batch_job_id)
        .bind(item_index as i64)
        .bind(&spec.prompt)
        .bind(&spec.caption)
        .bind(
            spec.variation_params
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<BatchJobRow>> {
        let row = sqlx::query("SELECT * FROM batch_jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_batch_job).transpose()
    }

    pub async fn get_job_conn(
        conn: &mut SqliteConnection,
        job_id: &str,
    ) -> Result<Option<BatchJobRow>> {
        let row = sqlx::query("SELECT * FROM batch_jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&mut *conn)
            .await?;

        row.as_ref().map(row_to_batch_job).transpose()
    }

    /// All jobs still owed work: status in {queued, running}
    pub async fn active_jobs(&self) -> Result<Vec<BatchJobRow>> {
        let rows = sqlx::query(
            "SELECT * FROM batch_jobs WHERE status IN ('queued', 'running') ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_batch_job).collect()
    }

    pub async fn mark_job_running(&self, job_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE batch_jobs SET status = 'running', started_at = ?
             WHERE job_id = ? AND status = 'queued'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a job canceled inside an open transaction, recording the refund.
    /// The refund's ledger row must be written in the same transaction.
    pub async fn cancel_job_conn(
        conn: &mut SqliteConnection,
        job_id: &str,
        credits_refunded: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE batch_jobs SET status = 'canceled', credits_refunded = ?, finished_at = ?
             WHERE job_id = ?",
        )
        .bind(credits_refunded)
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Set the job's terminal status and finish time
    pub async fn finalize_job(
        &self,
        job_id: &str,
        status: BatchStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE batch_jobs SET status = ?, error_message = ?, finished_at = ? WHERE job_id = ?",
        )
        .bind(status.to_string())
        .bind(error_message)
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── batch job items ──

    pub async fn get_items(&self, batch_job_id: i64) -> Result<Vec<BatchItemRow>> {
        let rows = sqlx::query(
            "SELECT * FROM batch_job_items WHERE batch_job_id = ? ORDER BY item_index",
        )
        .bind(batch_job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_item).collect()
    }

    /// Items still owed work: status in {pending, running}.
    ///
    /// Running items are safe to re-run; result writes are idempotent on
    /// the result column.
    pub async fn unfinished_items(&self, batch_job_id: i64) -> Result<Vec<BatchItemRow>> {
        let rows = sqlx::query(
            "SELECT * FROM batch_job_items
             WHERE batch_job_id = ? AND status IN ('pending', 'running')
             ORDER BY item_index",
        )
        .bind(batch_job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_item).collect()
    }

    pub async fn items_by_status(
        &self,
        batch_job_id: i64,
        status: ItemStatus,
    ) -> Result<Vec<BatchItemRow>> {
        let rows = sqlx::query(
            "SELECT * FROM batch_job_items
             WHERE batch_job_id = ? AND status = ? ORDER BY item_index",
        )
        .bind(batch_job_id)
        .bind(status.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_item).collect()
    }

    pub async fn mark_item_running(&self, item_id: i64) -> Result<()> {
        sqlx::query("UPDATE batch_job_items SET status = 'running', started_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record an item success and bump the job counters in one transaction.
    ///
    /// `avg_duration_ms`, when known, is written to the job row and used for
    /// the new ETA; when `None` the previous average is kept.
    pub async fn record_item_success(
        &self,
        job_id: &str,
        item_id: i64,
        result_url: &str,
        duration_ms: i64,
        avg_duration_ms: Option<i64>,
    ) -> Result<BatchCounters> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        sqlx::query(
            "UPDATE batch_job_items
             SET status = 'completed', result_url = ?, error_message = NULL,
                 finished_at = ?, duration_ms = ?
             WHERE id = ?",
        )
        .bind(result_url)
        .bind(now.to_rfc3339())
        .bind(duration_ms)
        .bind(item_id)
        .execute(&mut *tx)
        .await?;

        let counters = Self::bump_counters(&mut tx, job_id, true, avg_duration_ms).await?;
        tx.commit().await?;
        Ok(counters)
    }

    /// Record an item failure and bump the job counters in one transaction.
    ///
    /// A sibling item's failure never affects the others.
    pub async fn record_item_failure(
        &self,
        job_id: &str,
        item_id: i64,
        error_message: &str,
    ) -> Result<BatchCounters> {
        let mut tx = self.pool.begin().await?;
        let truncated: String = error_message.chars().take(500).collect();

        sqlx::query(
            "UPDATE batch_job_items
             SET status = 'failed', error_message = ?, finished_at = ?
             WHERE id = ?",
        )
        .bind(truncated)
        .bind(Utc::now().to_rfc3339())
        .bind(item_id)
        .execute(&mut *tx)
        .await?;

        let counters = Self::bump_counters(&mut tx, job_id, false, None).await?;
        tx.commit().await?;
        Ok(counters)
    }

    async fn bump_counters(
        tx: &mut SqliteConnection,
        job_id: &str,
        success: bool,
        avg_duration_ms: Option<i64>,
    ) -> Result<BatchCounters> {
        let row = sqlx::query(
            "SELECT quantity, completed_items, failed_items, avg_item_duration_ms
             FROM batch_jobs WHERE job_id = ?",
        )
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await?;

        let quantity: i64 = row.try_get("quantity")?;
        let mut completed: i64 = row.try_get("completed_items")?;
        let mut failed: i64 = row.try_get("failed_items")?;
        let previous_avg: Option<i64> = row.try_get("avg_item_duration_ms")?;

        if success {
            completed += 1;
        } else {
            failed += 1;
        }
        let pending = quantity - completed - failed;
        let avg = avg_duration_ms.or(previous_avg);

        let eta = match avg {
            Some(avg_ms) if pending > 0 => {
                Some(Utc::now() + ChronoDuration::milliseconds(pending * avg_ms))
            }
            _ => None,
        };

        sqlx::query(
            "UPDATE batch_jobs
             SET completed_items = ?, failed_items = ?, pending_items = ?,
                 avg_item_duration_ms = COALESCE(?, avg_item_duration_ms),
                 estimated_completion = ?
             WHERE job_id = ?",
        )
        .bind(completed)
        .bind(failed)
        .bind(pending)
        .bind(avg_duration_ms)
        .bind(eta.map(|dt| dt.to_rfc3339()))
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        Ok(BatchCounters {
            quantity,
            completed,
            failed,
            pending,
            avg_item_duration_ms: avg,
            eta_seconds: eta.map(|dt| (dt - Utc::now()).num_seconds()),
        })
    }

    // ── single jobs (legacy worker path) ──

    #[allow(clippy::too_many_arguments)]
    pub async fn create_single_job(
        &self,
        model: &str,
        image_url: &str,
        motion_prompt: &str,
        resolution: &str,
        duration_sec: u32,
        negative_prompt: Option<&str>,
    ) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "INSERT INTO jobs
                 (model, image_url, motion_prompt, resolution, duration_sec, negative_prompt,
                  status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, 'pending', ?, ?)",
        )
        .bind(model)
        .bind(image_url)
        .bind(motion_prompt)
        .bind(resolution)
        .bind(duration_sec as i64)
        .bind(negative_prompt)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn pending_single_jobs(&self, limit: i64) -> Result<Vec<SingleJobRow>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE status = 'pending' ORDER BY created_at LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_single_job).collect()
    }

    pub async fn submitted_single_jobs(&self, limit: i64) -> Result<Vec<SingleJobRow>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs
             WHERE status = 'submitted' AND request_id IS NOT NULL
             ORDER BY updated_at LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_single_job).collect()
    }

    /// Mark a row claimed by a worker. No lease expiry is persisted; the
    /// caller must hold the job lock (see the worker module).
    pub async fn claim_single_job(&self, job_id: i64, worker_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'claimed', error_message = ?, updated_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(format!("Claimed by {}", worker_id))
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn single_job_submitted(&self, job_id: i64, request_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'submitted', request_id = ?, error_message = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(request_id)
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn single_job_completed(&self, job_id: i64, video_url: &str) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'completed', video_url = ?, error_message = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(video_url)
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn single_job_failed(&self, job_id: i64, error_message: &str) -> Result<()> {
        let truncated: String = error_message.chars().take(500).collect();
        sqlx::query(
            "UPDATE jobs SET status = 'failed', error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(truncated)
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── upload cache ──

    pub async fn upload_cache_insert(
        &self,
        local_path: &str,
        content_hash: &str,
        remote_url: &str,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO upload_cache (local_path, content_hash, remote_url, uploaded_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(local_path)
        .bind(content_hash)
        .bind(remote_url)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn upload_cache_by_hash(&self, content_hash: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT remote_url FROM upload_cache WHERE content_hash = ?
             ORDER BY uploaded_at DESC LIMIT 1",
        )
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get("remote_url")))
    }

    pub async fn upload_cache_by_path(&self, local_path: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT remote_url FROM upload_cache WHERE local_path = ?
             ORDER BY uploaded_at DESC LIMIT 1",
        )
        .bind(local_path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get("remote_url")))
    }
}
