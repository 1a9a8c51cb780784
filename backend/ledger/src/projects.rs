//! NGO profiles and the voting-option approval workflow.
//!
//! ```text
//! draft ──submit──► pending_approval ──approve──► voting ──close──► completed
//!   ▲                      │
//!   └──────reject──────────┘
//! ```
//!
//! Approval is the only way into `voting` and is refused unless the owning
//! NGO is verified. Platform-curated options have no NGO and need no check.

use serde::Deserialize;
use sqlx::{SqliteExecutor, SqlitePool};
use tracing::info;

use crate::cycle::CycleKey;
use crate::errors::{LedgerError, Result};
use crate::models::{NgoProfile, OptionStatus, VotingOption};

const OPTION_COLUMNS: &str = "id, title, description, category, media_ref, ngo_id, status, \
     cycle_key, vote_count, funding_goal, rejection_reason, created_at";

#[derive(Debug, Clone, Deserialize)]
pub struct NewNgo {
    pub legal_name: String,
    pub payout_ref: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewOption {
    pub title: String,
    pub description: String,
    pub category: String,
    pub media_ref: Option<String>,
    pub ngo_id: Option<i64>,
    pub funding_goal: i64,
}

// ─────────────────────────────────────────────────────────
// NGOs
// ─────────────────────────────────────────────────────────

pub async fn create_ngo(
    executor: impl SqliteExecutor<'_>,
    ngo: &NewNgo,
    now: i64,
) -> Result<NgoProfile> {
    if ngo.legal_name.trim().is_empty() {
        return Err(LedgerError::BadRequest("legal_name must not be empty".to_string()));
    }
    let created = sqlx::query_as::<_, NgoProfile>(
        r#"
        INSERT INTO ngo_profiles (legal_name, payout_ref, is_verified, created_at)
        VALUES (?1, ?2, 0, ?3)
        RETURNING id, legal_name, payout_ref, is_verified, created_at
        "#,
    )
    .bind(ngo.legal_name.trim())
    .bind(&ngo.payout_ref)
    .bind(now)
    .fetch_one(executor)
    .await?;
    Ok(created)
}

pub async fn get_ngo(executor: impl SqliteExecutor<'_>, id: i64) -> Result<Option<NgoProfile>> {
    let ngo = sqlx::query_as::<_, NgoProfile>(
        "SELECT id, legal_name, payout_ref, is_verified, created_at FROM ngo_profiles WHERE id = ?1",
    )
    .bind(id)
    .fetch_optional(executor)
    .await?;
    Ok(ngo)
}

pub async fn set_ngo_verified(
    executor: impl SqliteExecutor<'_>,
    id: i64,
    verified: bool,
) -> Result<NgoProfile> {
    sqlx::query_as::<_, NgoProfile>(
        r#"
        UPDATE ngo_profiles SET is_verified = ?2 WHERE id = ?1
        RETURNING id, legal_name, payout_ref, is_verified, created_at
        "#,
    )
    .bind(id)
    .bind(verified)
    .fetch_optional(executor)
    .await?
    .ok_or_else(|| LedgerError::NotFound(format!("NGO {id}")))
}

// ─────────────────────────────────────────────────────────
// Options
// ─────────────────────────────────────────────────────────

pub async fn create_option(pool: &SqlitePool, option: &NewOption, now: i64) -> Result<VotingOption> {
    if option.title.trim().is_empty() {
        return Err(LedgerError::BadRequest("title must not be empty".to_string()));
    }
    if option.funding_goal <= 0 {
        return Err(LedgerError::BadRequest("funding_goal must be positive".to_string()));
    }
    if let Some(ngo_id) = option.ngo_id {
        if get_ngo(pool, ngo_id).await?.is_none() {
            return Err(LedgerError::NotFound(format!("NGO {ngo_id}")));
        }
    }

    let sql = format!(
        "INSERT INTO voting_options \
            (title, description, category, media_ref, ngo_id, status, funding_goal, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, 'draft', ?6, ?7) \
         RETURNING {OPTION_COLUMNS}"
    );
    let created = sqlx::query_as::<_, VotingOption>(&sql)
        .bind(option.title.trim())
        .bind(&option.description)
        .bind(&option.category)
        .bind(&option.media_ref)
        .bind(option.ngo_id)
        .bind(option.funding_goal)
        .bind(now)
        .fetch_one(pool)
        .await?;
    Ok(created)
}

pub async fn get_option(executor: impl SqliteExecutor<'_>, id: i64) -> Result<Option<VotingOption>> {
    let sql = format!("SELECT {OPTION_COLUMNS} FROM voting_options WHERE id = ?1");
    let option = sqlx::query_as::<_, VotingOption>(&sql)
        .bind(id)
        .fetch_optional(executor)
        .await?;
    Ok(option)
}

/// Options of a cycle in ranking order: most votes first, earlier
/// submissions winning ties.
pub async fn options_for_cycle(
    executor: impl SqliteExecutor<'_>,
    cycle: &CycleKey,
    status: Option<OptionStatus>,
) -> Result<Vec<VotingOption>> {
    let sql = format!(
        "SELECT {OPTION_COLUMNS} FROM voting_options \
         WHERE cycle_key = ?1 AND (?2 IS NULL OR status = ?2) \
         ORDER BY vote_count DESC, created_at ASC, id ASC"
    );
    let options = sqlx::query_as::<_, VotingOption>(&sql)
        .bind(cycle.to_string())
        .bind(status)
        .fetch_all(executor)
        .await?;
    Ok(options)
}

/// `draft → pending_approval`.
pub async fn submit_option(pool: &SqlitePool, id: i64) -> Result<VotingOption> {
    let sql = format!(
        "UPDATE voting_options SET status = 'pending_approval' \
         WHERE id = ?1 AND status = 'draft' RETURNING {OPTION_COLUMNS}"
    );
    let updated = sqlx::query_as::<_, VotingOption>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    match updated {
        Some(option) => Ok(option),
        None => Err(refused(pool, id, "submit", "draft").await),
    }
}

/// `pending_approval → voting` for `cycle`. The NGO check and the status
/// change are one statement, so a concurrent un-verification cannot slip
/// between them.
pub async fn approve_option(pool: &SqlitePool, id: i64, cycle: &CycleKey) -> Result<VotingOption> {
    let sql = format!(
        "UPDATE voting_options \
         SET status = 'voting', cycle_key = ?2, rejection_reason = NULL \
         WHERE id = ?1 AND status = 'pending_approval' \
           AND (ngo_id IS NULL OR EXISTS ( \
                SELECT 1 FROM ngo_profiles n \
                WHERE n.id = voting_options.ngo_id AND n.is_verified = 1)) \
         RETURNING {OPTION_COLUMNS}"
    );
    let updated = sqlx::query_as::<_, VotingOption>(&sql)
        .bind(id)
        .bind(cycle.to_string())
        .fetch_optional(pool)
        .await?;

    if let Some(option) = updated {
        info!(option = id, cycle = %cycle, "Option opened for voting");
        return Ok(option);
    }

    match get_option(pool, id).await? {
        Some(option) if option.status == OptionStatus::PendingApproval => {
            Err(LedgerError::InvalidTransition(format!(
                "option {id} belongs to an unverified NGO"
            )))
        }
        _ => Err(refused(pool, id, "approve", "pending_approval").await),
    }
}

/// `pending_approval → draft`, keeping the reason for the submitter.
pub async fn reject_option(pool: &SqlitePool, id: i64, reason: &str) -> Result<VotingOption> {
    let sql = format!(
        "UPDATE voting_options SET status = 'draft', rejection_reason = ?2 \
         WHERE id = ?1 AND status = 'pending_approval' RETURNING {OPTION_COLUMNS}"
    );
    let updated = sqlx::query_as::<_, VotingOption>(&sql)
        .bind(id)
        .bind(reason)
        .fetch_optional(pool)
        .await?;
    match updated {
        Some(option) => Ok(option),
        None => Err(refused(pool, id, "reject", "pending_approval").await),
    }
}

/// Explain why a conditional transition matched no row.
async fn refused(pool: &SqlitePool, id: i64, action: &str, expected: &str) -> LedgerError {
    match get_option(pool, id).await {
        Ok(Some(option)) => LedgerError::InvalidTransition(format!(
            "cannot {action} option {id} in status {:?}; expected {expected}",
            option.status
        )),
        Ok(None) => LedgerError::NotFound(format!("option {id}")),
        Err(e) => e,
    }
}
