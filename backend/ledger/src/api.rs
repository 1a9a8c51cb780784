//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use subtle::ConstantTimeEq;
use tracing::{error, info};

use crate::billing::{BillingClient, CheckoutSession, Purchase};
use crate::config::Config;
use crate::cycle::{current_cycle, CycleKey};
use crate::db;
use crate::distribution::{self, CloseOutcome};
use crate::errors::{DistributionError, LedgerError, RedemptionError, Result};
use crate::ingest::{self, IngestOutcome};
use crate::models::{Donor, NgoProfile, OptionStatus, Payout, PayoutStatus, Subscription, VotingOption};
use crate::projects::{self, NewNgo, NewOption};
use crate::signature::SIGNATURE_HEADER;
use crate::subscriptions::{self, Eligibility};
use crate::tally::{self, Redemption};
use crate::tokens::{self, TokenExportRow, TokenStatus};

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
    pub config: Config,
    pub billing: BillingClient,
}

type AppState = State<Arc<ApiState>>;

pub fn router(state: Arc<ApiState>) -> Router {
    let admin = Router::new()
        .route("/ngos", post(create_ngo))
        .route("/ngos/:id/verify", post(verify_ngo))
        .route("/options/:id", get(audit_option))
        .route("/options/:id/approve", post(approve_option))
        .route("/options/:id/reject", post(reject_option))
        .route("/tokens", post(grant_token))
        .route("/events/:id", get(event_status))
        .route("/cycles/:key/tokens", get(export_tokens))
        .route("/cycles/:key/close", post(close_cycle))
        .route("/cycles/:key/payouts", get(cycle_payouts))
        .route("/payouts/:id/status", post(settle_payout));

    Router::new()
        .route("/health", get(health))
        .route("/webhooks/billing", post(billing_webhook))
        .route("/donors", post(register_donor))
        .route("/donors/:id", get(get_donor))
        .route("/checkout", post(create_checkout))
        .route("/tokens", post(issue_token))
        .route("/vote", get(validate_vote).post(redeem_vote))
        .route("/options", post(create_option))
        .route("/options/:id/submit", post(submit_option))
        .route("/cycles/current/options", get(current_options))
        .route("/cycles/:key/options", get(cycle_options))
        .nest("/admin", admin)
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub cycle: CycleKey,
}

#[derive(Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Serialize)]
pub struct DonorResponse {
    pub donor: Donor,
    pub subscription: Option<Subscription>,
    pub cycle: CycleKey,
    pub eligibility: Eligibility,
}

#[derive(Serialize)]
pub struct TokenResponse {
    pub token: String,
    pub cycle_key: String,
    pub expires_at: i64,
    pub link: String,
}

#[derive(Serialize)]
pub struct TokenRequestAccepted {
    pub cycle: CycleKey,
    pub delivery: &'static str,
}

#[derive(Serialize)]
pub struct OptionsResponse {
    pub cycle: CycleKey,
    pub count: usize,
    pub options: Vec<VotingOption>,
}

#[derive(Serialize)]
pub struct ExportResponse {
    pub cycle: CycleKey,
    pub count: usize,
    pub tokens: Vec<TokenExportRow>,
}

#[derive(Serialize)]
pub struct OptionAudit {
    pub option: VotingOption,
    pub redemptions: i64,
    pub consistent: bool,
}

#[derive(Serialize)]
pub struct EventStatus {
    pub event_id: String,
    pub outcome: String,
}

#[derive(Serialize)]
pub struct PayoutsResponse {
    pub cycle: CycleKey,
    pub closed: bool,
    pub payouts: Vec<Payout>,
}

// ─────────────────────────────────────────────────────────
// Request shapes
// ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RegisterDonorRequest {
    pub id: String,
    pub email: String,
    pub display_name: String,
}

#[derive(Deserialize)]
pub struct CheckoutRequest {
    pub donor_id: String,
    #[serde(flatten)]
    pub purchase: Purchase,
}

#[derive(Deserialize)]
pub struct IssueTokenRequest {
    pub email: String,
}

#[derive(Deserialize)]
pub struct TokenQuery {
    pub token: String,
}

#[derive(Deserialize)]
pub struct RedeemRequest {
    pub option_id: i64,
}

#[derive(Deserialize)]
pub struct VerifyRequest {
    #[serde(default = "default_true")]
    pub verified: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
pub struct RejectRequest {
    pub reason: String,
}

#[derive(Deserialize, Default)]
pub struct CloseRequest {
    pub pool_amount: Option<i64>,
}

#[derive(Deserialize)]
pub struct SettleRequest {
    pub status: PayoutStatus,
}

// ─────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────

impl IntoResponse for LedgerError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            LedgerError::Signature(_) => (StatusCode::BAD_REQUEST, Some("invalid_signature")),
            LedgerError::EventParse(_) => (StatusCode::BAD_REQUEST, Some("invalid_event")),
            LedgerError::BadRequest(_) | LedgerError::Json(_) => (StatusCode::BAD_REQUEST, None),
            LedgerError::Redemption(e) => {
                let status = match e {
                    RedemptionError::NotFound => StatusCode::NOT_FOUND,
                    RedemptionError::Expired => StatusCode::GONE,
                    RedemptionError::AlreadyRedeemed | RedemptionError::OptionNotVoting => {
                        StatusCode::CONFLICT
                    }
                };
                (status, Some(e.code()))
            }
            LedgerError::Distribution(e) => {
                let code = match e {
                    DistributionError::NoEligibleWinners(_) => "no_eligible_winners",
                    DistributionError::PoolUnresolvable(_) => "pool_unresolvable",
                    DistributionError::CycleStillOpen(_) => "cycle_still_open",
                };
                (StatusCode::UNPROCESSABLE_ENTITY, Some(code))
            }
            LedgerError::NotFound(_) => (StatusCode::NOT_FOUND, None),
            LedgerError::InvalidTransition(_) => (StatusCode::CONFLICT, Some("invalid_transition")),
            LedgerError::Conflict(_) => (StatusCode::CONFLICT, Some("conflict")),
            LedgerError::Ineligible(_) => (StatusCode::FORBIDDEN, Some("ineligible")),
            LedgerError::Unauthorized => (StatusCode::UNAUTHORIZED, None),
            LedgerError::Billing(_) | LedgerError::Http(_) => (StatusCode::BAD_GATEWAY, None),
            LedgerError::Database(_)
            | LedgerError::Migrate(_)
            | LedgerError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };

        if status.is_server_error() {
            error!("Request failed: {self}");
        }

        let body = ErrorResponse {
            error: self.to_string(),
            code: code.map(String::from),
        };
        (status, Json(body)).into_response()
    }
}

fn require_admin(headers: &HeaderMap, config: &Config) -> Result<()> {
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let authorized = presented.is_some_and(|key| {
        !config.admin_api_key.is_empty()
            && bool::from(key.as_bytes().ct_eq(config.admin_api_key.as_bytes()))
    });
    if authorized {
        Ok(())
    } else {
        Err(LedgerError::Unauthorized)
    }
}

fn now() -> i64 {
    Utc::now().timestamp()
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        cycle: current_cycle(),
    })
}

/// `POST /webhooks/billing`
///
/// Any 2xx tells the processor to stop retrying, including for duplicates
/// and events we ignore.
pub async fn billing_webhook(
    State(state): AppState,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IngestOutcome>> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    let outcome = ingest::ingest(&state.pool, &state.config, &body, signature, now()).await?;
    Ok(Json(outcome))
}

/// `POST /donors` — registration callback from the identity source.
pub async fn register_donor(
    State(state): AppState,
    Json(req): Json<RegisterDonorRequest>,
) -> Result<(StatusCode, Json<Donor>)> {
    if req.id.trim().is_empty() || !req.email.contains('@') {
        return Err(LedgerError::BadRequest("id and a valid email are required".to_string()));
    }
    let donor = db::upsert_donor(&state.pool, &req.id, &req.email, &req.display_name, now()).await?;
    Ok((StatusCode::CREATED, Json(donor)))
}

/// `GET /donors/:id`
pub async fn get_donor(
    State(state): AppState,
    Path(id): Path<String>,
) -> Result<Json<DonorResponse>> {
    let mut conn = state.pool.acquire().await?;
    let donor = db::get_donor(&mut *conn, &id)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("donor {id}")))?;
    let subscription = subscriptions::live_for_donor(&mut *conn, &id).await?;
    let cycle = current_cycle();
    let eligibility = subscriptions::evaluate(&donor, subscription.as_ref(), &cycle);
    Ok(Json(DonorResponse {
        donor,
        subscription,
        cycle,
        eligibility,
    }))
}

/// `POST /checkout` — returns the processor's hosted checkout URL.
pub async fn create_checkout(
    State(state): AppState,
    Json(req): Json<CheckoutRequest>,
) -> Result<Json<CheckoutSession>> {
    let donor = db::get_donor(&state.pool, &req.donor_id)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("donor {}", req.donor_id)))?;
    let session = state.billing.create_checkout(&donor, req.purchase).await?;
    Ok(Json(session))
}

/// `POST /tokens` — request this cycle's token for an email.
///
/// The token itself is never returned here; it reaches the donor through the
/// mailing export. The answer is the same whether or not the email belongs
/// to an eligible donor.
pub async fn issue_token(
    State(state): AppState,
    Json(req): Json<IssueTokenRequest>,
) -> Result<(StatusCode, Json<TokenRequestAccepted>)> {
    let cycle = current_cycle();
    match tokens::issue_for_donor(&state.pool, &req.email, &cycle, now()).await {
        Ok(_) => {}
        Err(LedgerError::Ineligible(who)) => info!(cycle = %cycle, "Token request from ineligible {who}"),
        Err(e) => return Err(e),
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(TokenRequestAccepted {
            cycle,
            delivery: "email",
        }),
    ))
}

/// `GET /vote?token=…` — what the redemption link resolves to.
pub async fn validate_vote(
    State(state): AppState,
    Query(query): Query<TokenQuery>,
) -> Result<Json<TokenStatus>> {
    let status = tokens::validate_token(&state.pool, &query.token, now()).await?;
    Ok(Json(status))
}

/// `POST /vote?token=…` — cast the vote once the voter confirms.
pub async fn redeem_vote(
    State(state): AppState,
    Query(query): Query<TokenQuery>,
    Json(req): Json<RedeemRequest>,
) -> Result<Json<Redemption>> {
    let redemption = tokens::redeem_token(&state.pool, &query.token, req.option_id, now()).await?;
    Ok(Json(redemption))
}

/// `POST /options` — an NGO drafts an option.
pub async fn create_option(
    State(state): AppState,
    Json(req): Json<NewOption>,
) -> Result<(StatusCode, Json<VotingOption>)> {
    let option = projects::create_option(&state.pool, &req, now()).await?;
    Ok((StatusCode::CREATED, Json(option)))
}

/// `POST /options/:id/submit`
pub async fn submit_option(
    State(state): AppState,
    Path(id): Path<i64>,
) -> Result<Json<VotingOption>> {
    Ok(Json(projects::submit_option(&state.pool, id).await?))
}

/// `GET /cycles/current/options`
pub async fn current_options(State(state): AppState) -> Result<Json<OptionsResponse>> {
    options_response(&state.pool, current_cycle()).await
}

/// `GET /cycles/:key/options`
pub async fn cycle_options(
    State(state): AppState,
    Path(key): Path<String>,
) -> Result<Json<OptionsResponse>> {
    options_response(&state.pool, key.parse()?).await
}

async fn options_response(pool: &SqlitePool, cycle: CycleKey) -> Result<Json<OptionsResponse>> {
    let mut options = projects::options_for_cycle(pool, &cycle, None).await?;
    options.retain(|o| matches!(o.status, OptionStatus::Voting | OptionStatus::Completed));
    Ok(Json(OptionsResponse {
        cycle,
        count: options.len(),
        options,
    }))
}

// ─────────────────────────────────────────────────────────
// Admin handlers
// ─────────────────────────────────────────────────────────

/// `POST /admin/ngos`
pub async fn create_ngo(
    State(state): AppState,
    headers: HeaderMap,
    Json(req): Json<NewNgo>,
) -> Result<(StatusCode, Json<NgoProfile>)> {
    require_admin(&headers, &state.config)?;
    let ngo = projects::create_ngo(&state.pool, &req, now()).await?;
    Ok((StatusCode::CREATED, Json(ngo)))
}

/// `POST /admin/ngos/:id/verify`
pub async fn verify_ngo(
    State(state): AppState,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<NgoProfile>> {
    require_admin(&headers, &state.config)?;
    Ok(Json(projects::set_ngo_verified(&state.pool, id, req.verified).await?))
}

/// `GET /admin/options/:id` — the option with its tally checked against
/// the redemption records.
pub async fn audit_option(
    State(state): AppState,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<OptionAudit>> {
    require_admin(&headers, &state.config)?;
    let option = projects::get_option(&state.pool, id)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("option {id}")))?;
    let redemptions = tally::redemptions_for_option(&state.pool, id).await?;
    Ok(Json(OptionAudit {
        consistent: redemptions == option.vote_count,
        option,
        redemptions,
    }))
}

/// `POST /admin/options/:id/approve` — opens the option in the current cycle.
pub async fn approve_option(
    State(state): AppState,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<VotingOption>> {
    require_admin(&headers, &state.config)?;
    Ok(Json(projects::approve_option(&state.pool, id, &current_cycle()).await?))
}

/// `POST /admin/options/:id/reject`
pub async fn reject_option(
    State(state): AppState,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<RejectRequest>,
) -> Result<Json<VotingOption>> {
    require_admin(&headers, &state.config)?;
    Ok(Json(projects::reject_option(&state.pool, id, &req.reason).await?))
}

/// `POST /admin/tokens` — operator grant for the current cycle, bypassing
/// the eligibility check (e.g. a donation made outside the processor).
pub async fn grant_token(
    State(state): AppState,
    headers: HeaderMap,
    Json(req): Json<IssueTokenRequest>,
) -> Result<Json<TokenResponse>> {
    require_admin(&headers, &state.config)?;
    if !req.email.contains('@') {
        return Err(LedgerError::BadRequest("a valid email is required".to_string()));
    }
    let token = tokens::issue_token(&state.pool, &req.email, &current_cycle(), now()).await?;
    Ok(Json(TokenResponse {
        link: state.config.redemption_link(&token.token),
        token: token.token,
        cycle_key: token.cycle_key,
        expires_at: token.expires_at,
    }))
}

/// `GET /admin/events/:id` — what a billing event delivery did.
pub async fn event_status(
    State(state): AppState,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<EventStatus>> {
    require_admin(&headers, &state.config)?;
    let outcome = db::event_outcome(&state.pool, &id)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("billing event {id}")))?;
    Ok(Json(EventStatus {
        event_id: id,
        outcome,
    }))
}

/// `GET /admin/cycles/:key/tokens` — mailing export.
pub async fn export_tokens(
    State(state): AppState,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Result<Json<ExportResponse>> {
    require_admin(&headers, &state.config)?;
    let cycle: CycleKey = key.parse()?;
    let rows = tokens::export_tokens(&state.pool, &state.config, &cycle, now()).await?;
    Ok(Json(ExportResponse {
        cycle,
        count: rows.len(),
        tokens: rows,
    }))
}

/// `POST /admin/cycles/:key/close` — body is optional.
pub async fn close_cycle(
    State(state): AppState,
    headers: HeaderMap,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<Json<CloseOutcome>> {
    require_admin(&headers, &state.config)?;
    let cycle: CycleKey = key.parse()?;
    let req: CloseRequest = if body.is_empty() {
        CloseRequest::default()
    } else {
        serde_json::from_slice(&body)?
    };
    let outcome = distribution::close_cycle(&state.pool, &cycle, req.pool_amount, now()).await?;
    Ok(Json(outcome))
}

/// `GET /admin/cycles/:key/payouts`
pub async fn cycle_payouts(
    State(state): AppState,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Result<Json<PayoutsResponse>> {
    require_admin(&headers, &state.config)?;
    let cycle: CycleKey = key.parse()?;
    Ok(Json(PayoutsResponse {
        cycle,
        closed: distribution::is_closed(&state.pool, &cycle).await?,
        payouts: distribution::payouts_for_cycle(&state.pool, &cycle).await?,
    }))
}

/// `POST /admin/payouts/:id/status`
pub async fn settle_payout(
    State(state): AppState,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<SettleRequest>,
) -> Result<Json<Payout>> {
    require_admin(&headers, &state.config)?;
    Ok(Json(distribution::set_payout_status(&state.pool, id, req.status, now()).await?))
}
