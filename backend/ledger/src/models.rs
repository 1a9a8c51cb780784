//! Ledger records as stored in / read from the database.

use serde::{Deserialize, Serialize};

/// The four subscription levels, ordered from smallest to largest commitment.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum Tier {
    Supporter,
    Advocate,
    Champion,
    Patron,
}

/// Billing frequency. Each tier has exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum Cadence {
    Monthly,
    Biweekly,
    Weekly,
    Every4Days,
}

impl Tier {
    pub fn cadence(&self) -> Cadence {
        match self {
            Self::Supporter => Cadence::Monthly,
            Self::Advocate => Cadence::Biweekly,
            Self::Champion => Cadence::Weekly,
            Self::Patron => Cadence::Every4Days,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "supporter" => Some(Self::Supporter),
            "advocate" => Some(Self::Advocate),
            "champion" => Some(Self::Champion),
            "patron" => Some(Self::Patron),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Supporter => "supporter",
            Self::Advocate => "advocate",
            Self::Champion => "champion",
            Self::Patron => "patron",
        }
    }
}

/// Subscription status. `None` only ever appears on a donor that has never
/// subscribed; subscription rows start at `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum SubscriptionStatus {
    None,
    Active,
    PastDue,
    Canceled,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Donor {
    pub id: String,
    pub email: String,
    pub display_name: String,
    pub tier: Option<Tier>,
    pub status: SubscriptionStatus,
    pub last_payment_at: Option<i64>,
    pub last_contribution_at: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: i64,
    pub donor_id: String,
    pub customer_ref: String,
    pub subscription_ref: Option<String>,
    pub status: SubscriptionStatus,
    pub tier: Tier,
    pub cadence: Cadence,
    /// Start of the paid period that is currently running.
    pub current_period_start: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct VoteToken {
    pub token: String,
    pub email: String,
    pub cycle_key: String,
    pub expires_at: i64,
    pub redeemed_option_id: Option<i64>,
    pub redeemed_at: Option<i64>,
    pub created_at: i64,
}

impl VoteToken {
    pub fn is_redeemed(&self) -> bool {
        self.redeemed_at.is_some()
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NgoProfile {
    pub id: i64,
    pub legal_name: String,
    pub payout_ref: String,
    pub is_verified: bool,
    pub created_at: i64,
}

/// Lifecycle of a voting option. Rejection sends a pending option back to
/// `Draft` with a reason attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum OptionStatus {
    Draft,
    PendingApproval,
    Voting,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct VotingOption {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub category: String,
    pub media_ref: Option<String>,
    pub ngo_id: Option<i64>,
    pub status: OptionStatus,
    pub cycle_key: Option<String>,
    pub vote_count: i64,
    pub funding_goal: i64,
    pub rejection_reason: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Payout {
    pub id: i64,
    pub ngo_id: Option<i64>,
    pub cycle_key: String,
    pub amount: i64,
    pub rank: i64,
    pub status: PayoutStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_tier_has_its_cadence() {
        assert_eq!(Tier::Supporter.cadence(), Cadence::Monthly);
        assert_eq!(Tier::Advocate.cadence(), Cadence::Biweekly);
        assert_eq!(Tier::Champion.cadence(), Cadence::Weekly);
        assert_eq!(Tier::Patron.cadence(), Cadence::Every4Days);
    }

    #[test]
    fn tiers_are_ordered() {
        assert!(Tier::Supporter < Tier::Advocate);
        assert!(Tier::Champion < Tier::Patron);
    }

    #[test]
    fn tier_from_name() {
        assert_eq!(Tier::from_name("Champion"), Some(Tier::Champion));
        assert_eq!(Tier::from_name(" patron "), Some(Tier::Patron));
        assert_eq!(Tier::from_name("gold"), None);
    }

    #[test]
    fn token_expiry_is_exclusive() {
        let token = VoteToken {
            token: "t".into(),
            email: "a@b.c".into(),
            cycle_key: "2024-01".into(),
            expires_at: 100,
            redeemed_option_id: None,
            redeemed_at: None,
            created_at: 0,
        };
        assert!(!token.is_expired(99));
        assert!(token.is_expired(100));
        assert!(!token.is_redeemed());
    }
}
