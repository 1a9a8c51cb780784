//! Cycle close and fund distribution.
//!
//! Closing a cycle ranks its `voting` options by tally (ties go to the
//! earlier submission), pays the top three 50% / 30% / 20% of the pool,
//! and moves every option of the cycle to `completed`.
//!
//! With fewer than three winners the missing share is split among the
//! winners in proportion to their votes. Amounts round down to the cent
//! and the leftover cents go to first place, so payouts always sum to the
//! pool.
//!
//! A `cycle_closures` row is inserted first on the closing transaction; a
//! second or concurrent close finds it and returns the existing payouts.

use serde::Serialize;
use sqlx::{SqliteExecutor, SqlitePool};
use tracing::{info, warn};

use crate::cycle::CycleKey;
use crate::db;
use crate::errors::{DistributionError, LedgerError, Result};
use crate::models::{OptionStatus, Payout, PayoutStatus};
use crate::projects;

/// Shares of the pool by rank, in basis points.
pub const RANK_SHARES_BPS: [i64; 3] = [5_000, 3_000, 2_000];

const BPS: i128 = 10_000;

const PAYOUT_COLUMNS: &str = "id, ngo_id, cycle_key, amount, rank, status, created_at, updated_at";

/// Split `pool` among up to three winners given their vote counts, in rank
/// order. `votes` must hold 1–3 positive counts.
pub fn split_pool(pool: i64, votes: &[i64]) -> Vec<i64> {
    debug_assert!((1..=RANK_SHARES_BPS.len()).contains(&votes.len()));
    debug_assert!(votes.iter().all(|v| *v > 0));

    let total_votes: i128 = votes.iter().map(|v| *v as i128).sum();
    let missing_bps: i128 = RANK_SHARES_BPS[votes.len()..]
        .iter()
        .map(|b| *b as i128)
        .sum();

    let mut amounts: Vec<i64> = votes
        .iter()
        .zip(RANK_SHARES_BPS)
        .map(|(&v, share)| {
            let weight = share as i128 * total_votes + missing_bps * v as i128;
            (pool as i128 * weight / (BPS * total_votes)) as i64
        })
        .collect();

    let remainder = pool - amounts.iter().sum::<i64>();
    amounts[0] += remainder;
    amounts
}

#[derive(Debug, Clone, Serialize)]
pub struct Winner {
    pub option_id: i64,
    pub title: String,
    pub ngo_id: Option<i64>,
    pub votes: i64,
    pub rank: i64,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseStatus {
    Closed,
    AlreadyClosed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloseOutcome {
    pub cycle_key: CycleKey,
    pub status: CloseStatus,
    pub pool_amount: i64,
    /// Empty when the cycle was already closed.
    pub winners: Vec<Winner>,
    pub payouts: Vec<Payout>,
}

/// Close `cycle`. `pool_override` replaces the contribution sum when an
/// operator supplies the amount to distribute. Safe to call repeatedly and
/// concurrently; refusals leave nothing behind and may be retried.
pub async fn close_cycle(
    pool: &SqlitePool,
    cycle: &CycleKey,
    pool_override: Option<i64>,
    now: i64,
) -> Result<CloseOutcome> {
    if now < cycle.ends_at() {
        return Err(DistributionError::CycleStillOpen(cycle.to_string()).into());
    }
    let key = cycle.to_string();

    let mut tx = pool.begin().await?;
    let claimed = sqlx::query(
        "INSERT OR IGNORE INTO cycle_closures (cycle_key, pool_amount, closed_at) VALUES (?1, 0, ?2)",
    )
    .bind(&key)
    .bind(now)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if claimed == 0 {
        drop(tx);
        let (pool_amount,): (i64,) =
            sqlx::query_as("SELECT pool_amount FROM cycle_closures WHERE cycle_key = ?1")
                .bind(&key)
                .fetch_one(pool)
                .await?;
        info!(cycle = %cycle, "Cycle already closed; nothing to do");
        return Ok(CloseOutcome {
            cycle_key: *cycle,
            status: CloseStatus::AlreadyClosed,
            pool_amount,
            winners: Vec::new(),
            payouts: payouts_for_cycle(pool, cycle).await?,
        });
    }

    let pool_amount = match pool_override {
        Some(amount) => amount,
        None => db::pool_for_cycle(&mut *tx, cycle).await?,
    };
    if pool_amount <= 0 {
        warn!(cycle = %cycle, pool_amount, "Refusing to close cycle without a pool");
        return Err(DistributionError::PoolUnresolvable(key).into());
    }

    let ranked = projects::options_for_cycle(&mut *tx, cycle, Some(OptionStatus::Voting)).await?;
    let top: Vec<_> = ranked
        .iter()
        .filter(|o| o.vote_count > 0)
        .take(RANK_SHARES_BPS.len())
        .collect();
    if top.is_empty() {
        warn!(cycle = %cycle, "Refusing to close cycle without a winner");
        return Err(DistributionError::NoEligibleWinners(key).into());
    }

    let votes: Vec<i64> = top.iter().map(|o| o.vote_count).collect();
    let amounts = split_pool(pool_amount, &votes);
    let winners: Vec<Winner> = top
        .iter()
        .zip(&amounts)
        .enumerate()
        .map(|(i, (option, &amount))| Winner {
            option_id: option.id,
            title: option.title.clone(),
            ngo_id: option.ngo_id,
            votes: option.vote_count,
            rank: i as i64 + 1,
            amount,
        })
        .collect();

    // One payout per recipient; an NGO with two winning options keeps its
    // best rank and the summed amount.
    let mut per_recipient: Vec<(Option<i64>, i64, i64)> = Vec::new();
    for w in &winners {
        match per_recipient.iter_mut().find(|(ngo, _, _)| *ngo == w.ngo_id) {
            Some((_, amount, _)) => *amount += w.amount,
            None => per_recipient.push((w.ngo_id, w.amount, w.rank)),
        }
    }

    for (ngo_id, amount, rank) in &per_recipient {
        sqlx::query(
            r#"
            INSERT INTO payouts (ngo_id, cycle_key, amount, rank, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?5)
            "#,
        )
        .bind(ngo_id)
        .bind(&key)
        .bind(amount)
        .bind(rank)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query("UPDATE cycle_closures SET pool_amount = ?2 WHERE cycle_key = ?1")
        .bind(&key)
        .bind(pool_amount)
        .execute(&mut *tx)
        .await?;

    let completed = sqlx::query(
        "UPDATE voting_options SET status = 'completed' WHERE cycle_key = ?1 AND status = 'voting'",
    )
    .bind(&key)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    tx.commit().await?;

    for w in &winners {
        info!(
            cycle = %cycle,
            rank = w.rank,
            option = w.option_id,
            votes = w.votes,
            amount = w.amount,
            "Cycle winner"
        );
    }
    info!(cycle = %cycle, pool_amount, completed, "Cycle closed");

    Ok(CloseOutcome {
        cycle_key: *cycle,
        status: CloseStatus::Closed,
        pool_amount,
        winners,
        payouts: payouts_for_cycle(pool, cycle).await?,
    })
}

pub async fn payouts_for_cycle(
    executor: impl SqliteExecutor<'_>,
    cycle: &CycleKey,
) -> Result<Vec<Payout>> {
    let sql = format!("SELECT {PAYOUT_COLUMNS} FROM payouts WHERE cycle_key = ?1 ORDER BY rank ASC");
    let payouts = sqlx::query_as::<_, Payout>(&sql)
        .bind(cycle.to_string())
        .fetch_all(executor)
        .await?;
    Ok(payouts)
}

pub async fn is_closed(executor: impl SqliteExecutor<'_>, cycle: &CycleKey) -> Result<bool> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT cycle_key FROM cycle_closures WHERE cycle_key = ?1")
            .bind(cycle.to_string())
            .fetch_optional(executor)
            .await?;
    Ok(row.is_some())
}

/// Settle a payout: `pending → completed | failed`, or `failed → pending`
/// to retry. Completed payouts never change again.
pub async fn set_payout_status(
    pool: &SqlitePool,
    id: i64,
    status: PayoutStatus,
    now: i64,
) -> Result<Payout> {
    let sql = format!(
        "UPDATE payouts SET status = ?2, updated_at = ?3 \
         WHERE id = ?1 \
           AND ((status = 'pending' AND ?2 IN ('completed', 'failed')) \
             OR (status = 'failed' AND ?2 = 'pending')) \
         RETURNING {PAYOUT_COLUMNS}"
    );
    let updated = sqlx::query_as::<_, Payout>(&sql)
        .bind(id)
        .bind(status)
        .bind(now)
        .fetch_optional(pool)
        .await?;
    if let Some(payout) = updated {
        info!(payout = id, status = ?payout.status, "Payout settled");
        return Ok(payout);
    }

    let current: Option<(PayoutStatus,)> =
        sqlx::query_as("SELECT status FROM payouts WHERE id = ?1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
    match current {
        Some((from,)) => Err(LedgerError::InvalidTransition(format!(
            "payout {id} cannot move from {from:?} to {status:?}"
        ))),
        None => Err(LedgerError::NotFound(format!("payout {id}"))),
    }
}
