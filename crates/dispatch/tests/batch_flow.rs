//! End-to-end batch queue scenarios against a temp database and a
//! scriptable in-memory generator.

use async_trait::async_trait;
use lumen_core_resilience::BackendFailure;
use lumen_dispatch::adapters::ItemGenerator;
use lumen_dispatch::ledger;
use lumen_dispatch::pricing::{JobConfig, OutputKind};
use lumen_dispatch::queue::{BatchQueue, QueueConfig, QueueError};
use lumen_dispatch::store::{BatchItemRow, SqliteStore};
use lumen_dispatch::{BatchStatus, ItemStatus, Tier};
use sqlx::Row;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Generator whose behavior is scripted per item index
struct ScriptedGenerator {
    delay: Duration,
    fail_indices: HashSet<i64>,
    calls: AtomicU64,
}

impl ScriptedGenerator {
    fn instant() -> Arc<Self> {
        Arc::new(Self {
            delay: Duration::ZERO,
            fail_indices: HashSet::new(),
            calls: AtomicU64::new(0),
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            fail_indices: HashSet::new(),
            calls: AtomicU64::new(0),
        })
    }

    fn failing(indices: impl IntoIterator<Item = i64>) -> Arc<Self> {
        Arc::new(Self {
            delay: Duration::ZERO,
            fail_indices: indices.into_iter().collect(),
            calls: AtomicU64::new(0),
        })
    }

    fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ItemGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        item: &BatchItemRow,
        _config: &JobConfig,
    ) -> Result<String, BackendFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_indices.contains(&item.item_index) {
            return Err(BackendFailure::http(500, "backend exploded"));
        }
        Ok(format!(
            "https://cdn.example.com/generated/{}/{}.mp4",
            item.batch_job_id, item.item_index
        ))
    }
}

async fn fixture_with(
    generator: Arc<dyn ItemGenerator>,
    config: QueueConfig,
) -> (TempDir, SqliteStore, BatchQueue) {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::open(dir.path().join("batch.db").to_str().unwrap())
        .await
        .unwrap();
    let queue = BatchQueue::new(store.clone(), generator, config);
    (dir, store, queue)
}

async fn fixture(generator: Arc<dyn ItemGenerator>) -> (TempDir, SqliteStore, BatchQueue) {
    fixture_with(generator, QueueConfig::default()).await
}

fn video_config() -> JobConfig {
    serde_json::from_str(
        r#"{"type": "video", "model": "kling", "resolution": "1080p", "duration_sec": 5,
            "image_url": "https://cdn.example.com/src.jpg"}"#,
    )
    .unwrap()
}

fn specs(quantity: u32) -> Vec<lumen_dispatch::ItemSpec> {
    (0..quantity)
        .map(|i| lumen_dispatch::ItemSpec {
            prompt: Some(format!("variation {}", i)),
            ..Default::default()
        })
        .collect()
}

async fn balance_of(store: &SqliteStore, user: i64) -> i64 {
    store.get_user(user).await.unwrap().unwrap().credits_balance
}

// Scenario: exact-pay submit drains the balance and completes the item
#[tokio::test]
async fn exact_pay_submit_completes() {
    let generator = ScriptedGenerator::instant();
    let (_dir, store, queue) = fixture(generator.clone()).await;
    let user = store.create_user(Tier::Starter, 5).await.unwrap();

    let job_id = queue
        .submit(user, OutputKind::Video, 1, video_config(), Some(specs(1)))
        .await
        .unwrap();
    queue.wait(&job_id).await;

    let job = store.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, BatchStatus::Completed);
    assert_eq!(job.completed_items, 1);
    assert_eq!(job.credits_charged, 5);
    assert!(job.started_at.is_some() && job.finished_at.is_some());

    let items = store.get_items(job.id).await.unwrap();
    assert_eq!(items[0].status, ItemStatus::Completed);
    assert!(items[0].result_url.as_deref().unwrap().contains("generated"));
    assert!(items[0].duration_ms.is_some());

    assert_eq!(balance_of(&store, user).await, 0);

    let mut conn = store.pool().acquire().await.unwrap();
    let rows = ledger::history(&mut conn, user, 10, 0, Some("job")).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].amount, -5);
    assert_eq!(rows[0].reference_id.as_deref(), Some(job_id.as_str()));
}

// Scenario: one credit short: nothing is created, nothing is charged
#[tokio::test]
async fn insufficient_credits_rejects_cleanly() {
    let (_dir, store, queue) = fixture(ScriptedGenerator::instant()).await;
    let user = store.create_user(Tier::Starter, 4).await.unwrap();

    let err = queue
        .submit(user, OutputKind::Video, 1, video_config(), Some(specs(1)))
        .await
        .unwrap_err();

    match err {
        QueueError::InsufficientCredits { required, available } => {
            assert_eq!(required, 5);
            assert_eq!(available, 4);
        }
        other => panic!("unexpected error: {:?}", other),
    }

    assert_eq!(balance_of(&store, user).await, 4);
    let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM batch_jobs")
        .fetch_one(store.pool())
        .await
        .unwrap()
        .get("n");
    assert_eq!(count, 0);
    let mut conn = store.pool().acquire().await.unwrap();
    assert!(ledger::history(&mut conn, user, 10, 0, None).await.unwrap().is_empty());
}

// Scenario: cancel after partial completion refunds floor(charged × pending / quantity)
#[tokio::test]
async fn cancel_refunds_pro_rata() {
    let (_dir, store, queue) = fixture(ScriptedGenerator::instant()).await;
    let user = store.create_user(Tier::Pro, 100).await.unwrap();

    // Seed a mid-run job directly: 10 items charged at 50 credits, two
    // completed, no live coordinator (as after a restart).
    let job_id = uuid::Uuid::new_v4().to_string();
    {
        let mut tx = store.pool().begin().await.unwrap();
        ledger::deduct_credits(&mut tx, user, 50, "Batch job: 10 video(s)", "job", Some(&job_id), false)
            .await
            .unwrap();
        let db_id = SqliteStore::insert_batch_job_conn(
            &mut tx,
            &job_id,
            user,
            OutputKind::Video,
            &video_config(),
            10,
            50,
        )
        .await
        .unwrap();
        for i in 0..10u32 {
            SqliteStore::insert_item_conn(&mut tx, db_id, i, &Default::default())
                .await
                .unwrap();
        }
        sqlx::query(
            "UPDATE batch_jobs SET status = 'running', completed_items = 2, pending_items = 8
             WHERE job_id = ?",
        )
        .bind(&job_id)
        .execute(&mut *tx)
        .await
        .unwrap();
        sqlx::query(
            "UPDATE batch_job_items SET status = 'completed', result_url = 'https://cdn/x.mp4'
             WHERE batch_job_id = ? AND item_index < 2",
        )
        .bind(db_id)
        .execute(&mut *tx)
        .await
        .unwrap();
        tx.commit().await.unwrap();
    }
    let before = balance_of(&store, user).await;

    let canceled = queue.cancel(&job_id, user).await.unwrap();
    assert!(canceled);

    let job = store.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, BatchStatus::Canceled);
    assert_eq!(job.credits_refunded, 40); // floor(50 * 8 / 10)
    assert!(job.finished_at.is_some());
    assert!(job.error_message.is_none());

    assert_eq!(balance_of(&store, user).await, before + 40);
    let mut conn = store.pool().acquire().await.unwrap();
    let refunds = ledger::history(&mut conn, user, 10, 0, Some("refund")).await.unwrap();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].amount, 40);
    assert_eq!(refunds[0].reference_id.as_deref(), Some(job_id.as_str()));

    // Cancel is idempotent: a second cancel refunds nothing more
    assert!(!queue.cancel(&job_id, user).await.unwrap());
    assert_eq!(balance_of(&store, user).await, before + 40);
}

#[tokio::test]
async fn cancel_mid_run_waits_for_settle() {
    let generator = ScriptedGenerator::slow(Duration::from_millis(30));
    // Two at a time so a 10-item job is still mid-run when the cancel lands
    let (_dir, store, queue) = fixture_with(
        generator,
        QueueConfig {
            max_concurrency: 2,
            ..QueueConfig::default()
        },
    )
    .await;
    let user = store.create_user(Tier::Pro, 100).await.unwrap();

    let job_id = queue
        .submit(user, OutputKind::Video, 10, video_config(), Some(specs(10)))
        .await
        .unwrap();

    // Let a couple of items through, then cancel
    tokio::time::sleep(Duration::from_millis(50)).await;
    let canceled = queue.cancel(&job_id, user).await.unwrap();
    assert!(canceled);

    let job = store.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, BatchStatus::Canceled);
    // Settled: nothing is mid-flight, the counters add up, and the refund
    // matches whatever was still pending at settlement.
    assert_eq!(job.completed_items + job.failed_items + job.pending_items, 10);
    let running = store.items_by_status(job.id, ItemStatus::Running).await.unwrap();
    assert!(running.is_empty());
    assert_eq!(job.credits_refunded, 50 * job.pending_items / 10);
    assert_eq!(balance_of(&store, user).await, 50 + job.credits_refunded);

    let state = queue.get_state(&job_id).unwrap();
    assert_eq!(state.status, BatchStatus::Canceled);
}

#[tokio::test]
async fn cancel_requires_ownership() {
    let (_dir, store, queue) = fixture(ScriptedGenerator::slow(Duration::from_millis(50))).await;
    let owner = store.create_user(Tier::Pro, 100).await.unwrap();
    let stranger = store.create_user(Tier::Pro, 100).await.unwrap();

    let job_id = queue
        .submit(owner, OutputKind::Video, 2, video_config(), Some(specs(2)))
        .await
        .unwrap();

    assert!(matches!(
        queue.cancel(&job_id, stranger).await,
        Err(QueueError::PermissionDenied)
    ));
    queue.wait(&job_id).await;
}

// Partial failure: job completes, counters expose the failures
#[tokio::test]
async fn partial_failure_still_completes() {
    let generator = ScriptedGenerator::failing([1, 3]);
    let (_dir, store, queue) = fixture(generator).await;
    let user = store.create_user(Tier::Pro, 100).await.unwrap();

    let job_id = queue
        .submit(user, OutputKind::Video, 5, video_config(), Some(specs(5)))
        .await
        .unwrap();
    queue.wait(&job_id).await;

    let job = store.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, BatchStatus::Completed);
    assert_eq!(job.completed_items, 3);
    assert_eq!(job.failed_items, 2);
    assert_eq!(job.pending_items, 0);
    // Partial failures carry no job-level error
    assert!(job.error_message.is_none());

    let failed = store.items_by_status(job.id, ItemStatus::Failed).await.unwrap();
    assert_eq!(failed.len(), 2);
    assert!(failed.iter().all(|i| i.error_message.is_some()));
    assert!(failed.iter().all(|i| i.result_url.is_none()));
}

// Total failure: job fails and carries the reason
#[tokio::test]
async fn all_items_failing_fails_job() {
    let generator = ScriptedGenerator::failing(0..3);
    let (_dir, store, queue) = fixture(generator).await;
    let user = store.create_user(Tier::Pro, 100).await.unwrap();

    let job_id = queue
        .submit(user, OutputKind::Video, 3, video_config(), Some(specs(3)))
        .await
        .unwrap();
    queue.wait(&job_id).await;

    let job = store.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, BatchStatus::Failed);
    assert_eq!(job.failed_items, 3);
    assert!(job.error_message.is_some());
}

#[tokio::test]
async fn tier_limit_bounds_concurrent_jobs() {
    let (_dir, store, queue) = fixture(ScriptedGenerator::slow(Duration::from_millis(100))).await;
    let user = store.create_user(Tier::Free, 100).await.unwrap();

    let first = queue
        .submit(user, OutputKind::Video, 1, video_config(), Some(specs(1)))
        .await
        .unwrap();

    // Free tier allows one job in {queued, running}
    let err = queue
        .submit(user, OutputKind::Video, 1, video_config(), Some(specs(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::TierLimitExceeded { limit: 1 }));

    queue.wait(&first).await;

    // After the first finishes, capacity frees up
    let second = queue
        .submit(user, OutputKind::Video, 1, video_config(), Some(specs(1)))
        .await
        .unwrap();
    queue.wait(&second).await;
}

#[tokio::test]
async fn quantity_cap_is_enforced() {
    let (_dir, store, queue) = fixture(ScriptedGenerator::instant()).await;
    let user = store.create_user(Tier::Agency, 5000).await.unwrap();

    let err = queue
        .submit(user, OutputKind::Video, 501, video_config(), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QueueError::QuantityLimitExceeded { quantity: 501, limit: 500 }
    ));

    // 500 is accepted and runs to completion
    let job_id = queue
        .submit(user, OutputKind::Video, 500, video_config(), Some(specs(500)))
        .await
        .unwrap();
    queue.wait(&job_id).await;

    let job = store.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, BatchStatus::Completed);
    assert_eq!(job.completed_items, 500);
}

#[tokio::test]
async fn inactive_user_cannot_submit() {
    let (_dir, store, queue) = fixture(ScriptedGenerator::instant()).await;
    let user = store.create_user(Tier::Pro, 100).await.unwrap();
    store.set_user_active(user, false).await.unwrap();

    assert!(matches!(
        queue
            .submit(user, OutputKind::Video, 1, video_config(), Some(specs(1)))
            .await,
        Err(QueueError::UserInactive(_))
    ));
    assert_eq!(balance_of(&store, user).await, 100);
}

// Scenario: crash after 37 completions: restart runs only the 63 left
#[tokio::test]
async fn crash_recovery_resumes_pending_items() {
    let generator = ScriptedGenerator::instant();
    let (_dir, store, queue) = fixture(generator.clone()).await;
    let user = store.create_user(Tier::Agency, 1000).await.unwrap();

    // Seed the post-crash picture directly: 100 items, 37 done before the
    // process died, job still marked running.
    let job_id = uuid::Uuid::new_v4().to_string();
    {
        let mut tx = store.pool().begin().await.unwrap();
        ledger::deduct_credits(&mut tx, user, 500, "Batch job: 100 video(s)", "job", Some(&job_id), false)
            .await
            .unwrap();
        let db_id = SqliteStore::insert_batch_job_conn(
            &mut tx,
            &job_id,
            user,
            OutputKind::Video,
            &video_config(),
            100,
            500,
        )
        .await
        .unwrap();
        for i in 0..100u32 {
            SqliteStore::insert_item_conn(
                &mut tx,
                db_id,
                i,
                &lumen_dispatch::ItemSpec {
                    prompt: Some(format!("variation {}", i)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }
        sqlx::query(
            "UPDATE batch_jobs SET status = 'running', started_at = created_at,
                 completed_items = 37, pending_items = 63
             WHERE job_id = ?",
        )
        .bind(&job_id)
        .execute(&mut *tx)
        .await
        .unwrap();
        sqlx::query(
            "UPDATE batch_job_items SET status = 'completed', result_url = 'https://cdn/pre.mp4'
             WHERE batch_job_id = ? AND item_index < 37",
        )
        .bind(db_id)
        .execute(&mut *tx)
        .await
        .unwrap();
        tx.commit().await.unwrap();
    }

    // Restart: recovery rebuilds state and re-spawns the coordinator
    let recovered = queue.recover().await.unwrap();
    assert_eq!(recovered, 1);

    let state = queue.get_state(&job_id).unwrap();
    assert_eq!(state.completed, 37);
    assert_eq!(state.pending, 63);

    queue.wait(&job_id).await;

    let job = store.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, BatchStatus::Completed);
    assert_eq!(job.completed_items, 100);
    assert_eq!(job.failed_items, 0);
    assert_eq!(job.pending_items, 0);

    // Only the 63 unfinished items ran; no credits were re-debited
    assert_eq!(generator.calls(), 63);
    assert_eq!(balance_of(&store, user).await, 500);
    let mut conn = store.pool().acquire().await.unwrap();
    assert_eq!(ledger::history(&mut conn, user, 100, 0, Some("job")).await.unwrap().len(), 1);
}

#[tokio::test]
async fn state_mirror_tracks_progress_and_eta() {
    let (_dir, store, queue) = fixture(ScriptedGenerator::slow(Duration::from_millis(10))).await;
    let user = store.create_user(Tier::Pro, 100).await.unwrap();

    let job_id = queue
        .submit(user, OutputKind::Video, 4, video_config(), Some(specs(4)))
        .await
        .unwrap();

    // Present immediately after submit
    assert!(queue.get_state(&job_id).is_some());
    queue.wait(&job_id).await;

    let state = queue.get_state(&job_id).unwrap();
    assert_eq!(state.status, BatchStatus::Completed);
    assert_eq!(state.completed, 4);
    assert_eq!(state.pending, 0);
    assert!(state.avg_duration_ms.is_some());
    // Terminal jobs surface no ETA
    assert!(state.eta_seconds.is_none());

    // Unknown jobs are a DB-fallback signal, not an error
    assert!(queue.get_state("not-a-job").is_none());
}

#[tokio::test]
async fn item_specs_flow_into_rows() {
    let (_dir, store, queue) = fixture(ScriptedGenerator::instant()).await;
    let user = store.create_user(Tier::Pro, 100).await.unwrap();

    let mut item_specs = specs(2);
    item_specs[1].caption = Some("second caption".to_string());
    item_specs[1].variation_params =
        Some(serde_json::json!({"image_url": "https://cdn.example.com/alt.jpg"}));

    let job_id = queue
        .submit(user, OutputKind::Video, 2, video_config(), Some(item_specs))
        .await
        .unwrap();
    queue.wait(&job_id).await;

    let job = store.get_job(&job_id).await.unwrap().unwrap();
    let items = store.get_items(job.id).await.unwrap();
    assert_eq!(items[0].prompt.as_deref(), Some("variation 0"));
    assert_eq!(items[1].caption.as_deref(), Some("second caption"));
    assert_eq!(
        items[1].variation_params.as_ref().unwrap()["image_url"],
        "https://cdn.example.com/alt.jpg"
    );
}
