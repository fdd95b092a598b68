//! Credit ledger: atomic balance mutation with an append-only transaction log
//!
//! Every balance change inserts a ledger row in the same transaction that
//! mutates `users.credits_balance`; both land or neither does. The ledger
//! is never rolled back after the fact; corrections are explicit new rows
//! (refunds). `balance_after` denormalizes the post-mutation balance so an
//! auditor can verify the running sum without replaying the table.
//!
//! All functions take a `&mut SqliteConnection` so callers can compose them
//! into larger transactions (the batch queue charges credits in the same
//! transaction that inserts the job and its items).

use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection};
use thiserror::Error;
use tracing::info;

/// Transaction sources accepted in the ledger
pub const SOURCES: [&str; 5] = ["payment", "job", "manual", "promo", "refund"];

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Insufficient credits: need {required}, have {available}")]
    InsufficientCredits { required: i64, available: i64 },

    #[error("User {0} not found")]
    UserNotFound(i64),

    #[error("Amount must be positive, got {0}")]
    NonPositiveAmount(i64),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// One immutable ledger row
#[derive(Debug, Clone)]
pub struct CreditTransactionRow {
    pub id: i64,
    pub user_id: i64,
    pub amount: i64,
    pub balance_after: i64,
    pub description: String,
    pub source: String,
    pub reference_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

async fn fetch_balance(conn: &mut SqliteConnection, user_id: i64) -> Result<i64, LedgerError> {
    let row = sqlx::query("SELECT credits_balance FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(LedgerError::UserNotFound(user_id))?;

    Ok(row.get("credits_balance"))
}

async fn apply(
    conn: &mut SqliteConnection,
    user_id: i64,
    signed_amount: i64,
    new_balance: i64,
    description: &str,
    source: &str,
    reference_id: Option<&str>,
) -> Result<CreditTransactionRow, LedgerError> {
    sqlx::query("UPDATE users SET credits_balance = ? WHERE id = ?")
        .bind(new_balance)
        .bind(user_id)
        .execute(&mut *conn)
        .await?;

    let created_at = Utc::now();
    let result = sqlx::query(
        "INSERT INTO credit_transactions
             (user_id, amount, balance_after, description, source, reference_id, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(signed_amount)
    .bind(new_balance)
    .bind(description)
    .bind(source)
    .bind(reference_id)
    .bind(created_at.to_rfc3339())
    .execute(&mut *conn)
    .await?;

    Ok(CreditTransactionRow {
        id: result.last_insert_rowid(),
        user_id,
        amount: signed_amount,
        balance_after: new_balance,
        description: description.to_string(),
        source: source.to_string(),
        reference_id: reference_id.map(str::to_string),
        created_at,
    })
}

/// Add credits to a user's balance. `amount` must be positive.
pub async fn add_credits(
    conn: &mut SqliteConnection,
    user_id: i64,
    amount: i64,
    description: &str,
    source: &str,
    reference_id: Option<&str>,
) -> Result<CreditTransactionRow, LedgerError> {
    if amount <= 0 {
        return Err(LedgerError::NonPositiveAmount(amount));
    }

    let balance = fetch_balance(conn, user_id).await?;
    let new_balance = balance + amount;
    let tx = apply(conn, user_id, amount, new_balance, description, source, reference_id).await?;

    info!(user_id, amount, new_balance, source, "credits added");
    Ok(tx)
}

/// Deduct credits from a user's balance. `amount` must be positive; the
/// ledger row carries the negated amount.
///
/// Fails with [`LedgerError::InsufficientCredits`] unless `allow_negative`
/// (admin override) is set.
pub async fn deduct_credits(
    conn: &mut SqliteConnection,
    user_id: i64,
    amount: i64,
    description: &str,
    source: &str,
    reference_id: Option<&str>,
    allow_negative: bool,
) -> Result<CreditTransactionRow, LedgerError> {
    if amount <= 0 {
        return Err(LedgerError::NonPositiveAmount(amount));
    }

    let balance = fetch_balance(conn, user_id).await?;
    if !allow_negative && balance < amount {
        return Err(LedgerError::InsufficientCredits {
            required: amount,
            available: balance,
        });
    }

    let new_balance = balance - amount;
    let tx = apply(conn, user_id, -amount, new_balance, description, source, reference_id).await?;

    info!(user_id, amount, new_balance, source, "credits deducted");
    Ok(tx)
}

/// Refund credits: `add_credits` with `source = "refund"`
pub async fn refund_credits(
    conn: &mut SqliteConnection,
    user_id: i64,
    amount: i64,
    description: &str,
    reference_id: Option<&str>,
) -> Result<CreditTransactionRow, LedgerError> {
    add_credits(conn, user_id, amount, description, "refund", reference_id).await
}

/// Current balance
pub async fn balance(conn: &mut SqliteConnection, user_id: i64) -> Result<i64, LedgerError> {
    fetch_balance(conn, user_id).await
}

/// Transaction history, newest first, optionally filtered by source
pub async fn history(
    conn: &mut SqliteConnection,
    user_id: i64,
    limit: i64,
    offset: i64,
    source: Option<&str>,
) -> Result<Vec<CreditTransactionRow>, LedgerError> {
    let rows = match source {
        Some(source) => {
            sqlx::query(
                "SELECT * FROM credit_transactions
                 WHERE user_id = ? AND source = ?
                 ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
            )
            .bind(user_id)
            .bind(source)
            .bind(limit)
            .bind(offset)
            .fetch_all(&mut *conn)
            .await?
        }
        None => {
            sqlx::query(
                "SELECT * FROM credit_transactions
                 WHERE user_id = ?
                 ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
            )
            .bind(user_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&mut *conn)
            .await?
        }
    };

    rows.into_iter()
        .map(|row| {
            let created_raw: String = row.get("created_at");
            let created_at = DateTime::parse_from_rfc3339(&created_raw)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            Ok(CreditTransactionRow {
                id: row.get("id"),
                user_id: row.get("user_id"),
                amount: row.get("amount"),
                balance_after: row.get("balance_after"),
                description: row.get("description"),
                source: row.get("source"),
                reference_id: row.get("reference_id"),
                created_at,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::Tier;
    use tempfile::TempDir;

    async fn store_with_user(balance: i64) -> (TempDir, SqliteStore, i64) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.db");
        let store = SqliteStore::open(path.to_str().unwrap()).await.unwrap();
        let user = store.create_user(Tier::Starter, balance).await.unwrap();
        (dir, store, user)
    }

    #[tokio::test]
    async fn test_add_credits() {
        let (_dir, store, user) = store_with_user(0).await;
        let mut conn = store.pool().acquire().await.unwrap();

        let tx = add_credits(&mut conn, user, 50, "Top-up", "payment", Some("pay-1"))
            .await
            .unwrap();

        assert_eq!(tx.amount, 50);
        assert_eq!(tx.balance_after, 50);
        assert_eq!(balance(&mut conn, user).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn test_deduct_credits() {
        let (_dir, store, user) = store_with_user(20).await;
        let mut conn = store.pool().acquire().await.unwrap();

        let tx = deduct_credits(&mut conn, user, 5, "Batch job", "job", Some("uuid"), false)
            .await
            .unwrap();

        assert_eq!(tx.amount, -5);
        assert_eq!(tx.balance_after, 15);
        assert_eq!(balance(&mut conn, user).await.unwrap(), 15);
    }

    #[tokio::test]
    async fn test_insufficient_credits() {
        let (_dir, store, user) = store_with_user(4).await;
        let mut conn = store.pool().acquire().await.unwrap();

        let err = deduct_credits(&mut conn, user, 5, "Batch job", "job", None, false)
            .await
            .unwrap_err();

        match err {
            LedgerError::InsufficientCredits { required, available } => {
                assert_eq!(required, 5);
                assert_eq!(available, 4);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        // Balance untouched, no ledger row written
        assert_eq!(balance(&mut conn, user).await.unwrap(), 4);
        assert!(history(&mut conn, user, 10, 0, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_allow_negative_override() {
        let (_dir, store, user) = store_with_user(2).await;
        let mut conn = store.pool().acquire().await.unwrap();

        let tx = deduct_credits(&mut conn, user, 5, "Admin adjustment", "manual", None, true)
            .await
            .unwrap();
        assert_eq!(tx.balance_after, -3);
    }

    #[tokio::test]
    async fn test_non_positive_amounts_rejected() {
        let (_dir, store, user) = store_with_user(10).await;
        let mut conn = store.pool().acquire().await.unwrap();

        assert!(matches!(
            add_credits(&mut conn, user, 0, "x", "manual", None).await,
            Err(LedgerError::NonPositiveAmount(0))
        ));
        assert!(matches!(
            deduct_credits(&mut conn, user, -5, "x", "job", None, false).await,
            Err(LedgerError::NonPositiveAmount(-5))
        ));
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let (_dir, store, _user) = store_with_user(10).await;
        let mut conn = store.pool().acquire().await.unwrap();

        assert!(matches!(
            add_credits(&mut conn, 999, 5, "x", "manual", None).await,
            Err(LedgerError::UserNotFound(999))
        ));
    }

    #[tokio::test]
    async fn test_refund_uses_refund_source() {
        let (_dir, store, user) = store_with_user(0).await;
        let mut conn = store.pool().acquire().await.unwrap();

        let tx = refund_credits(&mut conn, user, 40, "Refund for canceled job", Some("uuid"))
            .await
            .unwrap();
        assert_eq!(tx.source, "refund");
        assert_eq!(tx.amount, 40);
    }

    #[tokio::test]
    async fn test_running_sum_matches_balance_and_balance_after() {
        let (_dir, store, user) = store_with_user(0).await;
        let mut conn = store.pool().acquire().await.unwrap();

        add_credits(&mut conn, user, 100, "Top-up", "payment", None).await.unwrap();
        deduct_credits(&mut conn, user, 30, "Job A", "job", Some("a"), false).await.unwrap();
        deduct_credits(&mut conn, user, 20, "Job B", "job", Some("b"), false).await.unwrap();
        refund_credits(&mut conn, user, 10, "Partial refund", Some("b")).await.unwrap();

        let final_balance = balance(&mut conn, user).await.unwrap();
        assert_eq!(final_balance, 60);

        // Oldest-first replay: running sum equals each row's balance_after,
        // and the final sum equals the live balance.
        let mut rows = history(&mut conn, user, 100, 0, None).await.unwrap();
        rows.reverse();
        let mut running = 0i64;
        for row in &rows {
            running += row.amount;
            assert_eq!(running, row.balance_after, "row {:?}", row.description);
        }
        assert_eq!(running, final_balance);
    }

    #[tokio::test]
    async fn test_history_filter_and_pagination() {
        let (_dir, store, user) = store_with_user(100).await;
        let mut conn = store.pool().acquire().await.unwrap();

        deduct_credits(&mut conn, user, 1, "Job 1", "job", None, false).await.unwrap();
        deduct_credits(&mut conn, user, 2, "Job 2", "job", None, false).await.unwrap();
        add_credits(&mut conn, user, 3, "Promo", "promo", None).await.unwrap();

        let jobs_only = history(&mut conn, user, 10, 0, Some("job")).await.unwrap();
        assert_eq!(jobs_only.len(), 2);
        assert!(jobs_only.iter().all(|t| t.source == "job"));

        let page = history(&mut conn, user, 1, 1, None).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].description, "Job 2");
    }
}
