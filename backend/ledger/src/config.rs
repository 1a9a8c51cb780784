//! Application configuration loaded from environment variables.

use std::collections::BTreeMap;

use crate::errors::{LedgerError, Result};
use crate::models::Tier;

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Shared secret used to sign billing webhooks
    pub webhook_secret: String,
    /// Maximum accepted age (seconds) of a signed webhook timestamp
    pub webhook_tolerance_secs: i64,
    /// Bearer key guarding the `/admin` routes
    pub admin_api_key: String,
    /// Public site base used to build vote redemption links
    pub public_base_url: String,
    /// Billing processor API base (e.g. https://api.stripe.com)
    pub billing_api_url: String,
    /// Billing processor secret key; checkout is disabled when empty
    pub billing_api_key: String,
    /// Recurring price id at the processor for each tier
    pub price_ids: BTreeMap<Tier, String>,
    /// Smallest one-off payment (cents) that grants a vote for the month
    pub min_donation_cents: i64,
    /// Whether the background scheduler closes finished cycles
    pub auto_close_cycles: bool,
    /// How often (in seconds) the scheduler checks for a cycle to close
    pub scheduler_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./ledger.db".to_string()),
            api_port: env_var("API_PORT")
                .unwrap_or_else(|_| "3001".to_string())
                .parse()
                .map_err(|_| LedgerError::Config("Invalid API_PORT".to_string()))?,
            webhook_secret: env_var("WEBHOOK_SECRET").map_err(|_| {
                LedgerError::Config("WEBHOOK_SECRET environment variable is required".to_string())
            })?,
            webhook_tolerance_secs: env_var("WEBHOOK_TOLERANCE_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .map_err(|_| LedgerError::Config("Invalid WEBHOOK_TOLERANCE_SECS".to_string()))?,
            admin_api_key: env_var("ADMIN_API_KEY").map_err(|_| {
                LedgerError::Config("ADMIN_API_KEY environment variable is required".to_string())
            })?,
            public_base_url: env_var("PUBLIC_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string())
                .trim_end_matches('/')
                .to_string(),
            billing_api_url: env_var("BILLING_API_URL")
                .unwrap_or_else(|_| "https://api.stripe.com".to_string())
                .trim_end_matches('/')
                .to_string(),
            billing_api_key: env_var("BILLING_API_KEY").unwrap_or_default(),
            price_ids: parse_price_ids(&env_var("BILLING_PRICE_IDS").unwrap_or_default())?,
            min_donation_cents: env_var("MIN_DONATION_CENTS")
                .unwrap_or_else(|_| "500".to_string())
                .parse()
                .map_err(|_| LedgerError::Config("Invalid MIN_DONATION_CENTS".to_string()))?,
            auto_close_cycles: env_var("AUTO_CLOSE_CYCLES")
                .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            scheduler_interval_secs: env_var("SCHEDULER_INTERVAL_SECS")
                .unwrap_or_else(|_| "3600".to_string())
                .parse()
                .map_err(|_| LedgerError::Config("Invalid SCHEDULER_INTERVAL_SECS".to_string()))?,
        })
    }

    /// Link a donor follows to cast the vote carried by `token`.
    pub fn redemption_link(&self, token: &str) -> String {
        format!("{}/vote?token={token}", self.public_base_url)
    }
}

/// Parse `supporter=price_123,advocate=price_456,...`. Tiers may be left
/// out; checkout for them is refused.
fn parse_price_ids(raw: &str) -> Result<BTreeMap<Tier, String>> {
    let mut prices = BTreeMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let invalid = || LedgerError::Config(format!("Invalid BILLING_PRICE_IDS entry {entry:?}"));
        let (tier, price) = entry.split_once('=').ok_or_else(invalid)?;
        let tier = Tier::from_name(tier).ok_or_else(invalid)?;
        let price = price.trim();
        if price.is_empty() {
            return Err(invalid());
        }
        prices.insert(tier, price.to_string());
    }
    Ok(prices)
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| LedgerError::Config(format!("Missing env var: {key}")))
}

#[cfg(test)]
impl Config {
    /// Configuration used by unit tests; never touches the environment.
    pub fn for_tests() -> Self {
        Config {
            database_url: "sqlite::memory:".to_string(),
            api_port: 0,
            webhook_secret: "whsec_test".to_string(),
            webhook_tolerance_secs: 300,
            admin_api_key: "admin-test-key".to_string(),
            public_base_url: "https://pool.example".to_string(),
            billing_api_url: "http://127.0.0.1:9".to_string(),
            billing_api_key: String::new(),
            price_ids: BTreeMap::from([
                (Tier::Supporter, "price_supporter".to_string()),
                (Tier::Advocate, "price_advocate".to_string()),
                (Tier::Champion, "price_champion".to_string()),
                (Tier::Patron, "price_patron".to_string()),
            ]),
            min_donation_cents: 500,
            auto_close_cycles: false,
            scheduler_interval_secs: 3600,
        }
    }
}
