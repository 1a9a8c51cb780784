//! Database layer — connection pool, migrations, and shared queries.
//!
//! Queries that only read take any [`SqliteExecutor`] so they can run on the
//! pool or inside a caller's transaction. Writes that must commit together
//! with other writes take `&mut SqliteConnection` and are always called on an
//! open transaction.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqliteExecutor, SqlitePool};
use tracing::info;

use crate::cycle::CycleKey;
use crate::errors::{LedgerError, Result};
use crate::models::Donor;

/// How long a writer waits for a competing writer before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    // Make sure the file is created if it doesn't exist yet.
    let options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

/// Fresh in-memory database with the real schema. A single connection that
/// never expires keeps the database alive for the whole test.
#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .expect("failed to create in-memory pool");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("failed to run migrations");
    pool
}

/// File-backed database opened exactly like production: WAL, busy timeout
/// and several connections, so racing tasks contend on SQLite's write lock
/// rather than on the pool. Keep the directory alive for the test's duration.
#[cfg(test)]
pub async fn file_pool() -> (SqlitePool, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("ledger.db");
    let pool = init_pool(&path.to_string_lossy())
        .await
        .expect("failed to open file-backed pool");
    (pool, dir)
}

// ─────────────────────────────────────────────────────────
// Donors
// ─────────────────────────────────────────────────────────

/// Create the donor on first registration from the identity source, or
/// refresh its email and display name on later ones.
pub async fn upsert_donor(
    executor: impl SqliteExecutor<'_>,
    id: &str,
    email: &str,
    display_name: &str,
    now: i64,
) -> Result<Donor> {
    let donor = sqlx::query_as::<_, Donor>(
        r#"
        INSERT INTO donors (id, email, display_name, created_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(id) DO UPDATE
            SET email = excluded.email,
                display_name = excluded.display_name
        RETURNING id, email, display_name, tier, status, last_payment_at,
                  last_contribution_at, created_at
        "#,
    )
    .bind(id)
    .bind(email.trim().to_ascii_lowercase())
    .bind(display_name)
    .bind(now)
    .fetch_one(executor)
    .await;

    match donor {
        Ok(donor) => Ok(donor),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(LedgerError::Conflict(
            format!("email {email} is already registered to another donor"),
        )),
        Err(e) => Err(e.into()),
    }
}

pub async fn get_donor(executor: impl SqliteExecutor<'_>, id: &str) -> Result<Option<Donor>> {
    let donor = sqlx::query_as::<_, Donor>(
        r#"
        SELECT id, email, display_name, tier, status, last_payment_at,
               last_contribution_at, created_at
        FROM   donors
        WHERE  id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await?;
    Ok(donor)
}

pub async fn get_donor_by_email(
    executor: impl SqliteExecutor<'_>,
    email: &str,
) -> Result<Option<Donor>> {
    let donor = sqlx::query_as::<_, Donor>(
        r#"
        SELECT id, email, display_name, tier, status, last_payment_at,
               last_contribution_at, created_at
        FROM   donors
        WHERE  email = ?1
        "#,
    )
    .bind(email.trim().to_ascii_lowercase())
    .fetch_optional(executor)
    .await?;
    Ok(donor)
}

/// Every donor, oldest first.
pub async fn list_donors(executor: impl SqliteExecutor<'_>) -> Result<Vec<Donor>> {
    let donors = sqlx::query_as::<_, Donor>(
        r#"
        SELECT id, email, display_name, tier, status, last_payment_at,
               last_contribution_at, created_at
        FROM   donors
        ORDER  BY created_at ASC, id ASC
        "#,
    )
    .fetch_all(executor)
    .await?;
    Ok(donors)
}

// ─────────────────────────────────────────────────────────
// Processed billing events
// ─────────────────────────────────────────────────────────

/// Claim `event_id` for processing. Returns `false` when the id was already
/// recorded, in which case nothing else must be applied for it.
///
/// This is an insert, so calling it first in a transaction takes the write
/// lock before anything is read.
pub async fn claim_event(
    conn: &mut SqliteConnection,
    event_id: &str,
    event_type: &str,
    now: i64,
) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        INSERT OR IGNORE INTO processed_events (event_id, event_type, outcome, processed_at)
        VALUES (?1, ?2, 'pending', ?3)
        "#,
    )
    .bind(event_id)
    .bind(event_type)
    .bind(now)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

/// Record what applying a claimed event did.
pub async fn set_event_outcome(
    conn: &mut SqliteConnection,
    event_id: &str,
    outcome: &str,
) -> Result<()> {
    sqlx::query("UPDATE processed_events SET outcome = ?2 WHERE event_id = ?1")
        .bind(event_id)
        .bind(outcome)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Outcome recorded for `event_id`, if it was processed.
pub async fn event_outcome(
    executor: impl SqliteExecutor<'_>,
    event_id: &str,
) -> Result<Option<String>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT outcome FROM processed_events WHERE event_id = ?1")
            .bind(event_id)
            .fetch_optional(executor)
            .await?;
    Ok(row.map(|(v,)| v))
}

// ─────────────────────────────────────────────────────────
// Contributions (the pool)
// ─────────────────────────────────────────────────────────

pub async fn record_contribution(
    conn: &mut SqliteConnection,
    event_id: &str,
    donor_id: &str,
    amount: i64,
    kind: &str,
    at: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO contributions (event_id, donor_id, cycle_key, amount, kind, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(event_id)
    .bind(donor_id)
    .bind(CycleKey::containing(at).to_string())
    .bind(amount)
    .bind(kind)
    .bind(at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Sum of contributions received during `cycle`.
pub async fn pool_for_cycle(executor: impl SqliteExecutor<'_>, cycle: &CycleKey) -> Result<i64> {
    let (total,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(SUM(amount), 0) FROM contributions WHERE cycle_key = ?1",
    )
    .bind(cycle.to_string())
    .fetch_one(executor)
    .await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_donor_creates_then_refreshes() {
        let pool = test_pool().await;
        let created = upsert_donor(&pool, "d1", "Ana@Example.org ", "Ana", 10)
            .await
            .unwrap();
        assert_eq!(created.email, "ana@example.org");
        assert_eq!(created.created_at, 10);

        let updated = upsert_donor(&pool, "d1", "ana@new.org", "Ana B", 20)
            .await
            .unwrap();
        assert_eq!(updated.email, "ana@new.org");
        assert_eq!(updated.display_name, "Ana B");
        assert_eq!(updated.created_at, 10);

        let by_email = get_donor_by_email(&pool, "ANA@new.org").await.unwrap();
        assert_eq!(by_email.map(|d| d.id).as_deref(), Some("d1"));
        assert_eq!(list_donors(&pool).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn email_taken_by_another_donor_conflicts() {
        let pool = test_pool().await;
        upsert_donor(&pool, "d1", "ana@example.org", "Ana", 0).await.unwrap();
        let err = upsert_donor(&pool, "d2", "ANA@example.org", "Other", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));
        assert!(get_donor(&pool, "d2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn event_claim_is_single_use() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        assert!(claim_event(&mut conn, "evt_1", "invoice_paid", 1).await.unwrap());
        assert!(!claim_event(&mut conn, "evt_1", "invoice_paid", 2).await.unwrap());
        set_event_outcome(&mut conn, "evt_1", "applied").await.unwrap();
        drop(conn);
        assert_eq!(
            event_outcome(&pool, "evt_1").await.unwrap().as_deref(),
            Some("applied")
        );
    }

    #[tokio::test]
    async fn pool_sums_contributions_per_cycle() {
        let pool = test_pool().await;
        upsert_donor(&pool, "d1", "a@b.c", "A", 0).await.unwrap();
        let jan = CycleKey::new(2024, 1).unwrap();
        let feb = CycleKey::new(2024, 2).unwrap();

        let mut conn = pool.acquire().await.unwrap();
        for (id, at, amount) in [
            ("evt_a", jan.starts_at(), 1_000),
            ("evt_b", jan.ends_at() - 1, 2_500),
            ("evt_c", feb.starts_at(), 700),
        ] {
            claim_event(&mut conn, id, "invoice_paid", at).await.unwrap();
            record_contribution(&mut conn, id, "d1", amount, "subscription", at)
                .await
                .unwrap();
        }
        drop(conn);

        assert_eq!(pool_for_cycle(&pool, &jan).await.unwrap(), 3_500);
        assert_eq!(pool_for_cycle(&pool, &feb).await.unwrap(), 700);
        assert_eq!(
            pool_for_cycle(&pool, &CycleKey::new(2024, 3).unwrap())
                .await
                .unwrap(),
            0
        );
    }
}
