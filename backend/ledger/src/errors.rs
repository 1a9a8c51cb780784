//! Application-wide error types.

use thiserror::Error;

/// Why a vote token could not be redeemed.
///
/// Each variant is surfaced to the voter as-is: "already voted" and
/// "link expired" call for different next steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RedemptionError {
    #[error("vote token not found")]
    NotFound,

    #[error("vote token has expired")]
    Expired,

    #[error("vote token has already been redeemed")]
    AlreadyRedeemed,

    #[error("option is not open for voting in this token's cycle")]
    OptionNotVoting,
}

impl RedemptionError {
    /// Stable machine-readable code for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Expired => "expired",
            Self::AlreadyRedeemed => "already_redeemed",
            Self::OptionNotVoting => "option_not_voting",
        }
    }
}

/// Reasons the cycle closer refuses to write payouts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DistributionError {
    #[error("cycle {0} has no option with at least one vote")]
    NoEligibleWinners(String),

    #[error("pool amount for cycle {0} could not be resolved")]
    PoolUnresolvable(String),

    #[error("cycle {0} has not ended yet")]
    CycleStillOpen(String),
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Signature verification failed: {0}")]
    Signature(String),

    #[error("Event parse error: {0}")]
    EventParse(String),

    #[error(transparent)]
    Redemption(#[from] RedemptionError),

    #[error(transparent)]
    Distribution(#[from] DistributionError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Donor {0} is not eligible to vote this cycle")]
    Ineligible(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Billing processor error: {0}")]
    Billing(String),
}

pub type Result<T> = std::result::Result<T, LedgerError>;
