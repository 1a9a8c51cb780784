//! Vote tokens — one single-use capability per email per cycle.
//!
//! Tokens are addressed by email rather than donor id so they can be mailed
//! out and used without logging in. Issuance is idempotent: a unique
//! `(email, cycle_key)` constraint makes concurrent requests converge on one
//! row, and the loser of the race reads the winner's token back.
//!
//! Eligibility is checked when a token is issued, never at redemption. A
//! donor who lapses mid-cycle keeps the vote they were already given.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use sqlx::{SqliteConnection, SqliteExecutor, SqlitePool};
use tracing::{info, warn};

use crate::config::Config;
use crate::cycle::CycleKey;
use crate::db;
use crate::errors::{LedgerError, RedemptionError, Result};
use crate::models::VoteToken;
use crate::subscriptions;
use crate::tally::{self, Redemption};

/// Random bytes per token; encodes to 43 URL-safe characters.
const TOKEN_BYTES: usize = 32;

const TOKEN_COLUMNS: &str =
    "token, email, cycle_key, expires_at, redeemed_option_id, redeemed_at, created_at";

pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

/// What [`validate_token`] reports about a live token.
#[derive(Debug, Clone, Serialize)]
pub struct TokenStatus {
    pub email: String,
    pub cycle_key: String,
    pub expires_at: i64,
    pub redeemed: bool,
    pub redeemed_option_id: Option<i64>,
}

/// One line of the mailing export.
#[derive(Debug, Clone, Serialize)]
pub struct TokenExportRow {
    pub email: String,
    pub display_name: String,
    pub token: String,
    pub link: String,
}

pub async fn find_token(
    executor: impl SqliteExecutor<'_>,
    email: &str,
    cycle: &CycleKey,
) -> Result<Option<VoteToken>> {
    let sql = format!("SELECT {TOKEN_COLUMNS} FROM vote_tokens WHERE email = ?1 AND cycle_key = ?2");
    let token = sqlx::query_as::<_, VoteToken>(&sql)
        .bind(normalize_email(email))
        .bind(cycle.to_string())
        .fetch_optional(executor)
        .await?;
    Ok(token)
}

/// Return the token for `(email, cycle)`, minting it if none exists yet.
/// No eligibility check; callers decide who may receive one.
pub async fn issue_token(
    pool: &SqlitePool,
    email: &str,
    cycle: &CycleKey,
    now: i64,
) -> Result<VoteToken> {
    let mut conn = pool.acquire().await?;
    mint(&mut conn, email, cycle, now).await
}

async fn mint(
    conn: &mut SqliteConnection,
    email: &str,
    cycle: &CycleKey,
    now: i64,
) -> Result<VoteToken> {
    let email = normalize_email(email);
    let rows = sqlx::query(
        r#"
        INSERT OR IGNORE INTO vote_tokens (token, email, cycle_key, expires_at, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(generate_token())
    .bind(&email)
    .bind(cycle.to_string())
    .bind(cycle.token_expiry())
    .bind(now)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if rows == 1 {
        info!(cycle = %cycle, "Vote token issued");
    }

    // Either ours or the row a concurrent request inserted first.
    find_token(&mut *conn, &email, cycle)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("vote token for {email} in {cycle}")))
}

/// Issue a token to a registered donor, checking eligibility unless one was
/// already issued for this cycle.
pub async fn issue_for_donor(
    pool: &SqlitePool,
    email: &str,
    cycle: &CycleKey,
    now: i64,
) -> Result<VoteToken> {
    if now >= cycle.ends_at() {
        return Err(LedgerError::BadRequest(format!("cycle {cycle} has already ended")));
    }
    let mut conn = pool.acquire().await?;
    issue_checked(&mut conn, email, cycle, now).await
}

async fn issue_checked(
    conn: &mut SqliteConnection,
    email: &str,
    cycle: &CycleKey,
    now: i64,
) -> Result<VoteToken> {
    if let Some(existing) = find_token(&mut *conn, email, cycle).await? {
        return Ok(existing);
    }

    let donor = db::get_donor_by_email(&mut *conn, email)
        .await?
        .ok_or_else(|| LedgerError::Ineligible(normalize_email(email)))?;
    let eligibility = subscriptions::eligibility(conn, &donor, cycle).await?;
    if !eligibility.is_eligible() {
        return Err(LedgerError::Ineligible(donor.email));
    }

    mint(conn, email, cycle, now).await
}

/// `ValidateToken`: report a token's state, or why it is unusable.
pub async fn validate_token(
    executor: impl SqliteExecutor<'_>,
    token: &str,
    now: i64,
) -> Result<TokenStatus> {
    let sql = format!("SELECT {TOKEN_COLUMNS} FROM vote_tokens WHERE token = ?1");
    let found = sqlx::query_as::<_, VoteToken>(&sql)
        .bind(token)
        .fetch_optional(executor)
        .await?
        .ok_or(RedemptionError::NotFound)?;

    if found.is_expired(now) {
        return Err(RedemptionError::Expired.into());
    }

    Ok(TokenStatus {
        redeemed: found.is_redeemed(),
        email: found.email,
        cycle_key: found.cycle_key,
        expires_at: found.expires_at,
        redeemed_option_id: found.redeemed_option_id,
    })
}

/// `RedeemToken`: spend the token on an option.
pub async fn redeem_token(
    pool: &SqlitePool,
    token: &str,
    option_id: i64,
    now: i64,
) -> Result<Redemption> {
    tally::increment_and_redeem(pool, token, option_id, now).await
}

/// Batch issuance for the mailing system: every eligible donor gets (or
/// keeps) a token for `cycle`. Ineligible donors are skipped.
pub async fn export_tokens(
    pool: &SqlitePool,
    config: &Config,
    cycle: &CycleKey,
    now: i64,
) -> Result<Vec<TokenExportRow>> {
    if now >= cycle.ends_at() {
        return Err(LedgerError::BadRequest(format!("cycle {cycle} has already ended")));
    }

    let donors = db::list_donors(pool).await?;
    let mut rows = Vec::with_capacity(donors.len());
    let mut conn = pool.acquire().await?;

    for donor in donors {
        match issue_checked(&mut conn, &donor.email, cycle, now).await {
            Ok(token) => rows.push(TokenExportRow {
                link: config.redemption_link(&token.token),
                email: donor.email,
                display_name: donor.display_name,
                token: token.token,
            }),
            Err(LedgerError::Ineligible(_)) => {}
            Err(e) => {
                warn!(donor = %donor.id, "Token export failed for donor: {e}");
                return Err(e);
            }
        }
    }

    info!(cycle = %cycle, exported = rows.len(), "Vote tokens exported");
    Ok(rows)
}
