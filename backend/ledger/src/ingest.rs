//! Billing webhook ingestion — verify, decode, deduplicate, apply.
//!
//! The processor retries any delivery it did not see acknowledged, possibly
//! concurrently. Claiming the event id and applying its transition happen on
//! one transaction: either both commit or neither does, so a crash can't
//! leave an applied event unrecorded or a recorded event unapplied.

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::config::Config;
use crate::db;
use crate::errors::{LedgerError, Result};
use crate::events::{BillingEvent, EventKind, EventPayload};
use crate::signature;
use crate::subscriptions::{self, Transition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    /// First delivery; the transition was applied.
    Applied,
    /// Already processed earlier; nothing re-applied.
    Duplicate,
    /// Target could not be resolved; recorded and dropped.
    Dropped,
    /// Valid event we have no handler for, or one with nothing to change.
    Ignored,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub event_id: String,
    pub kind: EventKind,
    pub status: IngestStatus,
}

/// Entry point for the webhook route: verify the signature over the raw
/// body, then decode and apply.
pub async fn ingest(
    pool: &SqlitePool,
    config: &Config,
    body: &[u8],
    signature_header: Option<&str>,
    now: i64,
) -> Result<IngestOutcome> {
    let verified = match signature_header {
        Some(header) => signature::verify(
            body,
            header,
            &config.webhook_secret,
            now,
            config.webhook_tolerance_secs,
        ),
        None => Err(LedgerError::Signature("missing signature header".to_string())),
    };
    if let Err(e) = verified {
        warn!(target: "security", "Rejected billing webhook: {e}");
        return Err(e);
    }

    let event = BillingEvent::decode(body, now)?;
    apply(pool, &event, config.min_donation_cents, now).await
}

/// Apply an already-verified event exactly once.
pub async fn apply(
    pool: &SqlitePool,
    event: &BillingEvent,
    min_donation_cents: i64,
    now: i64,
) -> Result<IngestOutcome> {
    let mut tx = pool.begin().await?;

    if !db::claim_event(&mut tx, &event.id, event.kind.as_str(), now).await? {
        info!(event_id = %event.id, "Duplicate billing event acknowledged");
        return Ok(IngestOutcome {
            event_id: event.id.clone(),
            kind: event.kind,
            status: IngestStatus::Duplicate,
        });
    }

    let at = event.created;
    let transition = match &event.payload {
        EventPayload::CheckoutCompleted(session) => {
            subscriptions::apply_checkout_completed(
                &mut tx,
                &event.id,
                at,
                session,
                min_donation_cents,
            )
            .await?
        }
        EventPayload::InvoicePaid(invoice) => {
            subscriptions::apply_invoice_paid(&mut tx, &event.id, at, invoice).await?
        }
        EventPayload::InvoicePaymentFailed(invoice) => {
            subscriptions::apply_invoice_payment_failed(&mut tx, at, invoice).await?
        }
        EventPayload::SubscriptionUpdated(object) => {
            subscriptions::apply_subscription_updated(&mut tx, at, object).await?
        }
        EventPayload::SubscriptionDeleted(object) => {
            subscriptions::apply_subscription_deleted(&mut tx, at, object).await?
        }
        EventPayload::Ignored => Transition::Skipped("unhandled event type"),
    };

    db::set_event_outcome(&mut tx, &event.id, &transition.outcome()).await?;
    tx.commit().await?;

    let status = match &transition {
        Transition::Applied(what) => {
            info!(event_id = %event.id, kind = event.kind.as_str(), "Billing event applied: {what}");
            IngestStatus::Applied
        }
        Transition::Unresolved(why) => {
            warn!(event_id = %event.id, kind = event.kind.as_str(), "Billing event dropped: {why}");
            IngestStatus::Dropped
        }
        Transition::Skipped(why) => {
            info!(event_id = %event.id, kind = event.kind.as_str(), "Billing event ignored: {why}");
            IngestStatus::Ignored
        }
    };

    Ok(IngestOutcome {
        event_id: event.id.clone(),
        kind: event.kind,
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{file_pool, test_pool, upsert_donor};
    use crate::models::SubscriptionStatus;
    use crate::signature::sign;

    const NOW: i64 = 1_717_200_000;

    fn checkout_body(event_id: &str) -> Vec<u8> {
        serde_json::json!({
            "id": event_id,
            "type": "checkout.session.completed",
            "created": NOW,
            "data": { "object": {
                "id": "cs_1",
                "customer": "cus_1",
                "mode": "subscription",
                "subscription": "sub_1",
                "client_reference_id": "d1",
                "metadata": { "tier": "champion" }
            }}
        })
        .to_string()
        .into_bytes()
    }

    fn failed_body(event_id: &str) -> Vec<u8> {
        serde_json::json!({
            "id": event_id,
            "type": "invoice.payment_failed",
            "created": NOW + 10,
            "data": { "object": { "id": "in_1", "customer": "cus_1", "subscription": "sub_1" } }
        })
        .to_string()
        .into_bytes()
    }

    async fn live_count(pool: &SqlitePool) -> i64 {
        let (n,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM subscriptions WHERE donor_id = 'd1' AND status != 'canceled'",
        )
        .fetch_one(pool)
        .await
        .unwrap();
        n
    }

    #[tokio::test]
    async fn redelivered_checkout_applies_once() {
        let pool = test_pool().await;
        let config = Config::for_tests();
        upsert_donor(&pool, "d1", "d1@x.org", "D", 0).await.unwrap();

        let body = checkout_body("evt_checkout");
        let header = sign(&body, &config.webhook_secret, NOW);

        let first = ingest(&pool, &config, &body, Some(&header), NOW).await.unwrap();
        assert_eq!(first.status, IngestStatus::Applied);
        for _ in 0..3 {
            let again = ingest(&pool, &config, &body, Some(&header), NOW).await.unwrap();
            assert_eq!(again.status, IngestStatus::Duplicate);
        }

        assert_eq!(live_count(&pool).await, 1);
        let donor = db::get_donor(&pool, "d1").await.unwrap().unwrap();
        assert_eq!(donor.status, SubscriptionStatus::Active);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_redelivery_applies_once() {
        let (pool, _dir) = file_pool().await;
        let config = Config::for_tests();
        upsert_donor(&pool, "d1", "d1@x.org", "D", 0).await.unwrap();

        let body = checkout_body("evt_race");
        let header = sign(&body, &config.webhook_secret, NOW);

        let mut handles = Vec::new();
        for _ in 0..32 {
            let (pool, config, body, header) =
                (pool.clone(), config.clone(), body.clone(), header.clone());
            handles.push(tokio::spawn(async move {
                ingest(&pool, &config, &body, Some(&header), NOW).await.unwrap().status
            }));
        }
        let mut applied = 0;
        for h in handles {
            if h.await.unwrap() == IngestStatus::Applied {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
        assert_eq!(live_count(&pool).await, 1);
    }

    #[tokio::test]
    async fn bad_signature_is_rejected_without_side_effects() {
        let pool = test_pool().await;
        let config = Config::for_tests();
        upsert_donor(&pool, "d1", "d1@x.org", "D", 0).await.unwrap();

        let body = checkout_body("evt_forged");
        let header = sign(&body, "not-the-secret", NOW);
        let err = ingest(&pool, &config, &body, Some(&header), NOW).await.unwrap_err();
        assert!(matches!(err, LedgerError::Signature(_)));

        let err = ingest(&pool, &config, &body, None, NOW).await.unwrap_err();
        assert!(matches!(err, LedgerError::Signature(_)));

        assert!(db::event_outcome(&pool, "evt_forged").await.unwrap().is_none());
        assert_eq!(live_count(&pool).await, 0);
    }

    #[tokio::test]
    async fn failed_payment_moves_to_past_due() {
        let pool = test_pool().await;
        let config = Config::for_tests();
        upsert_donor(&pool, "d1", "d1@x.org", "D", 0).await.unwrap();

        for body in [checkout_body("evt_a"), failed_body("evt_b")] {
            let header = sign(&body, &config.webhook_secret, NOW);
            ingest(&pool, &config, &body, Some(&header), NOW).await.unwrap();
        }
        let donor = db::get_donor(&pool, "d1").await.unwrap().unwrap();
        assert_eq!(donor.status, SubscriptionStatus::PastDue);
    }

    #[tokio::test]
    async fn unknown_customer_is_dropped_and_recorded() {
        let pool = test_pool().await;
        let config = Config::for_tests();

        let body = failed_body("evt_orphan");
        let header = sign(&body, &config.webhook_secret, NOW);
        let out = ingest(&pool, &config, &body, Some(&header), NOW).await.unwrap();
        assert_eq!(out.status, IngestStatus::Dropped);

        let outcome = db::event_outcome(&pool, "evt_orphan").await.unwrap().unwrap();
        assert!(outcome.starts_with("unresolved:"));

        let again = ingest(&pool, &config, &body, Some(&header), NOW).await.unwrap();
        assert_eq!(again.status, IngestStatus::Duplicate);
    }

    #[tokio::test]
    async fn unhandled_type_is_acknowledged() {
        let pool = test_pool().await;
        let config = Config::for_tests();
        let body = br#"{"id":"evt_x","type":"charge.refunded","data":{"object":{}}}"#;
        let header = sign(body, &config.webhook_secret, NOW);
        let out = ingest(&pool, &config, body, Some(&header), NOW).await.unwrap();
        assert_eq!(out.status, IngestStatus::Ignored);
        assert_eq!(out.kind, EventKind::Unknown);
    }
}
