//! Billing processor client — creates hosted checkout sessions.
//!
//! ## Resilience
//!
//! * Exponential back-off is applied when the processor returns a 5xx or a
//!   rate-limit response, up to [`MAX_BACKOFF_SECS`] seconds and at most
//!   [`MAX_ATTEMPTS`] tries.
//! * Transient network errors (connection reset, timeout) are retried.
//! * Other 4xx responses are hard failures and are returned immediately.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::errors::{LedgerError, Result};
use crate::models::{Donor, Tier};

const MAX_BACKOFF_SECS: u64 = 8;
const INITIAL_BACKOFF_SECS: u64 = 1;
const MAX_ATTEMPTS: u32 = 4;

/// What the caller asks to buy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Purchase {
    /// A recurring subscription at `tier`.
    Subscription { tier: Tier },
    /// A one-off donation of `amount` cents.
    OneOff { amount: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct ProcessorError {
    error: ProcessorErrorBody,
}

#[derive(Debug, Deserialize)]
struct ProcessorErrorBody {
    message: String,
}

#[derive(Clone)]
pub struct BillingClient {
    client: Client,
    api_url: String,
    api_key: String,
    public_base_url: String,
    price_ids: BTreeMap<Tier, String>,
}

impl BillingClient {
    pub fn new(client: Client, config: &Config) -> Self {
        Self {
            client,
            api_url: config.billing_api_url.clone(),
            api_key: config.billing_api_key.clone(),
            public_base_url: config.public_base_url.clone(),
            price_ids: config.price_ids.clone(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// Ask the processor for a hosted checkout page. The donor id travels as
    /// `client_reference_id` and comes back on `checkout-completed`.
    pub async fn create_checkout(&self, donor: &Donor, purchase: Purchase) -> Result<CheckoutSession> {
        if !self.is_enabled() {
            return Err(LedgerError::Billing("checkout is not configured".to_string()));
        }
        let form = checkout_form(donor, purchase, &self.public_base_url, &self.price_ids)?;
        let url = format!("{}/v1/checkout/sessions", self.api_url);
        let mut backoff = INITIAL_BACKOFF_SECS;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .form(&form)
                .send()
                .await;

            let retry_reason = match response {
                Err(e) if attempt < MAX_ATTEMPTS => format!("request failed: {e}"),
                Err(e) => return Err(e.into()),
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let session: CheckoutSession = resp.json().await?;
                        debug!(session = %session.id, donor = %donor.id, "Checkout session created");
                        return Ok(session);
                    }
                    let retryable =
                        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
                    if !retryable || attempt >= MAX_ATTEMPTS {
                        let message = resp
                            .json::<ProcessorError>()
                            .await
                            .map(|e| e.error.message)
                            .unwrap_or_else(|_| status.to_string());
                        return Err(LedgerError::Billing(message));
                    }
                    format!("processor returned {status}")
                }
            };

            warn!("Checkout attempt {attempt} failed (will retry in {backoff}s): {retry_reason}");
            tokio::time::sleep(Duration::from_secs(backoff)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
        }
    }
}

/// Form fields of a checkout session request. Subscriptions reference the
/// tier's configured price id.
fn checkout_form(
    donor: &Donor,
    purchase: Purchase,
    base: &str,
    price_ids: &BTreeMap<Tier, String>,
) -> Result<Vec<(String, String)>> {
    let mut form = vec![
        ("client_reference_id".to_string(), donor.id.clone()),
        ("customer_email".to_string(), donor.email.clone()),
        ("success_url".to_string(), format!("{base}/donate/success")),
        ("cancel_url".to_string(), format!("{base}/donate/cancel")),
        ("line_items[0][quantity]".to_string(), "1".to_string()),
    ];

    match purchase {
        Purchase::Subscription { tier } => {
            let price = price_ids.get(&tier).ok_or_else(|| {
                LedgerError::Billing(format!("no price configured for tier {}", tier.as_str()))
            })?;
            form.push(("mode".to_string(), "subscription".to_string()));
            form.push(("line_items[0][price]".to_string(), price.clone()));
            form.push(("metadata[tier]".to_string(), tier.as_str().to_string()));
            form.push((
                "subscription_data[metadata][tier]".to_string(),
                tier.as_str().to_string(),
            ));
        }
        Purchase::OneOff { amount } => {
            if amount <= 0 {
                return Err(LedgerError::BadRequest("amount must be positive".to_string()));
            }
            form.push(("mode".to_string(), "payment".to_string()));
            form.push(("line_items[0][price_data][currency]".to_string(), "eur".to_string()));
            form.push((
                "line_items[0][price_data][unit_amount]".to_string(),
                amount.to_string(),
            ));
            form.push((
                "line_items[0][price_data][product_data][name]".to_string(),
                "Community pool donation".to_string(),
            ));
        }
    }
    Ok(form)
}
