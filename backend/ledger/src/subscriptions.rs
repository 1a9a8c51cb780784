//! Subscription state machine and vote eligibility.
//!
//! ```text
//! none ──checkout──► active ──payment failed──► past_due
//!                      ▲                           │
//!                      └───────invoice paid────────┘
//! active | past_due ──deleted──► canceled   (final for that subscription)
//! ```
//!
//! Transitions are only ever applied by the ingestor, on the transaction that
//! also records the event id as processed. A one-off payment of at least the
//! minimum donation never touches the subscription; it stamps the donor's
//! `last_contribution_at`, which grants a vote for that calendar month.

use serde::Serialize;
use sqlx::{SqliteConnection, SqliteExecutor};
use tracing::{info, warn};

use crate::cycle::CycleKey;
use crate::db;
use crate::errors::Result;
use crate::events::{CheckoutMode, CheckoutSession, Invoice, SubscriptionObject};
use crate::models::{Donor, Subscription, SubscriptionStatus, Tier};

/// What applying one event did. Stored as the event's outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Applied(&'static str),
    /// Target could not be resolved; logged and dropped, never retried.
    Unresolved(String),
    /// Event was valid but carried nothing to change.
    Skipped(&'static str),
}

impl Transition {
    pub fn outcome(&self) -> String {
        match self {
            Self::Applied(what) => format!("applied:{what}"),
            Self::Unresolved(why) => format!("unresolved:{why}"),
            Self::Skipped(why) => format!("skipped:{why}"),
        }
    }
}

const SUBSCRIPTION_COLUMNS: &str = "id, donor_id, customer_ref, subscription_ref, status, tier, \
     cadence, current_period_start, created_at, updated_at";

// ─────────────────────────────────────────────────────────
// Lookups
// ─────────────────────────────────────────────────────────

/// The donor's non-canceled subscription, if any. There is at most one.
pub async fn live_for_donor(
    executor: impl SqliteExecutor<'_>,
    donor_id: &str,
) -> Result<Option<Subscription>> {
    let sql = format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
         WHERE donor_id = ?1 AND status != 'canceled'"
    );
    let sub = sqlx::query_as::<_, Subscription>(&sql)
        .bind(donor_id)
        .fetch_optional(executor)
        .await?;
    Ok(sub)
}

/// Resolve the live subscription an event refers to. An event naming a
/// subscription reference only matches that reference, or a live row of the
/// same customer whose reference was never recorded. Without a reference,
/// the customer's latest live subscription is used.
async fn live_for_reference(
    conn: &mut SqliteConnection,
    customer_ref: &str,
    subscription_ref: Option<&str>,
) -> Result<Option<Subscription>> {
    if let Some(sub_ref) = subscription_ref {
        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE subscription_ref = ?1 AND status != 'canceled'"
        );
        let found = sqlx::query_as::<_, Subscription>(&sql)
            .bind(sub_ref)
            .fetch_optional(&mut *conn)
            .await?;
        if found.is_some() {
            return Ok(found);
        }
    }

    let sql = format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
         WHERE customer_ref = ?1 AND status != 'canceled' \
           AND (?2 = 0 OR subscription_ref IS NULL) \
         ORDER BY created_at DESC, id DESC LIMIT 1"
    );
    let found = sqlx::query_as::<_, Subscription>(&sql)
        .bind(customer_ref)
        .bind(subscription_ref.is_some())
        .fetch_optional(&mut *conn)
        .await?;
    Ok(found)
}

async fn resolve_checkout_donor(
    conn: &mut SqliteConnection,
    session: &CheckoutSession,
) -> Result<Option<Donor>> {
    if let Some(id) = session.client_reference_id.as_deref() {
        if let Some(donor) = db::get_donor(&mut *conn, id).await? {
            return Ok(Some(donor));
        }
    }
    match session.customer_email.as_deref() {
        Some(email) => db::get_donor_by_email(&mut *conn, email).await,
        None => Ok(None),
    }
}

// ─────────────────────────────────────────────────────────
// Transitions
// ─────────────────────────────────────────────────────────

/// `checkout-completed`. Subscription mode creates the subscription; payment
/// mode records a one-off contribution.
pub async fn apply_checkout_completed(
    conn: &mut SqliteConnection,
    event_id: &str,
    at: i64,
    session: &CheckoutSession,
    min_donation_cents: i64,
) -> Result<Transition> {
    let Some(donor) = resolve_checkout_donor(conn, session).await? else {
        return Ok(Transition::Unresolved(format!(
            "no donor for checkout session {}",
            session.id
        )));
    };

    match session.mode {
        CheckoutMode::Subscription => {
            let (Some(customer), Some(tier)) = (session.customer.as_deref(), session.tier()) else {
                return Ok(Transition::Unresolved(format!(
                    "checkout session {} lacks customer or tier",
                    session.id
                )));
            };
            if let Some(existing) = live_for_donor(&mut *conn, &donor.id).await? {
                warn!(
                    donor = %donor.id,
                    subscription = existing.id,
                    "Donor already has a live subscription; checkout {} dropped",
                    session.id
                );
                return Ok(Transition::Unresolved(
                    "donor already has a live subscription".to_string(),
                ));
            }
            create_subscription(
                conn,
                &donor.id,
                customer,
                session.subscription.as_deref(),
                tier,
                at,
            )
            .await?;
            info!(donor = %donor.id, tier = tier.as_str(), "Subscription activated");
            Ok(Transition::Applied("subscription_created"))
        }
        CheckoutMode::Payment => {
            let amount = session.amount_total.unwrap_or(0);
            if amount <= 0 {
                return Ok(Transition::Skipped("zero amount"));
            }
            db::record_contribution(conn, event_id, &donor.id, amount, "one_off", at).await?;
            if amount >= min_donation_cents {
                sqlx::query("UPDATE donors SET last_contribution_at = ?2 WHERE id = ?1")
                    .bind(&donor.id)
                    .bind(at)
                    .execute(&mut *conn)
                    .await?;
                info!(donor = %donor.id, amount, "One-off contribution grants a vote this month");
                Ok(Transition::Applied("one_off_contribution"))
            } else {
                Ok(Transition::Applied("one_off_below_minimum"))
            }
        }
        CheckoutMode::Other => Ok(Transition::Skipped("unsupported checkout mode")),
    }
}

/// `invoice-paid`: force the subscription back to `active` (this is how
/// `past_due` recovers) and count the payment toward the pool.
pub async fn apply_invoice_paid(
    conn: &mut SqliteConnection,
    event_id: &str,
    at: i64,
    invoice: &Invoice,
) -> Result<Transition> {
    let Some(sub) =
        live_for_reference(conn, &invoice.customer, invoice.subscription.as_deref()).await?
    else {
        return Ok(Transition::Unresolved(format!(
            "no subscription for invoice {} of customer {}",
            invoice.id, invoice.customer
        )));
    };

    sqlx::query(
        r#"
        UPDATE subscriptions
        SET    status = 'active', current_period_start = ?2, updated_at = ?2
        WHERE  id = ?1
        "#,
    )
    .bind(sub.id)
    .bind(at)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        "UPDATE donors SET status = 'active', tier = ?2, last_payment_at = ?3 WHERE id = ?1",
    )
    .bind(&sub.donor_id)
    .bind(sub.tier)
    .bind(at)
    .execute(&mut *conn)
    .await?;

    if invoice.amount_paid > 0 {
        db::record_contribution(
            conn,
            event_id,
            &sub.donor_id,
            invoice.amount_paid,
            "subscription",
            at,
        )
        .await?;
    }
    Ok(Transition::Applied("renewed"))
}

/// `invoice-payment-failed`: suspend eligibility by moving to `past_due`.
pub async fn apply_invoice_payment_failed(
    conn: &mut SqliteConnection,
    at: i64,
    invoice: &Invoice,
) -> Result<Transition> {
    let Some(sub) =
        live_for_reference(conn, &invoice.customer, invoice.subscription.as_deref()).await?
    else {
        return Ok(Transition::Unresolved(format!(
            "no subscription for invoice {} of customer {}",
            invoice.id, invoice.customer
        )));
    };
    set_status(conn, &sub, SubscriptionStatus::PastDue, at).await?;
    Ok(Transition::Applied("past_due"))
}

/// `subscription-updated`: follow the processor's status and plan.
pub async fn apply_subscription_updated(
    conn: &mut SqliteConnection,
    at: i64,
    object: &SubscriptionObject,
) -> Result<Transition> {
    let Some(sub) = live_for_reference(conn, &object.customer, Some(&object.id)).await? else {
        return Ok(Transition::Unresolved(format!(
            "no subscription {} for customer {}",
            object.id, object.customer
        )));
    };

    if object.mapped_status() == Some(SubscriptionStatus::Canceled) {
        cancel(conn, &sub, at).await?;
        return Ok(Transition::Applied("canceled"));
    }

    let mut changed = false;
    if let Some(tier) = object.tier().filter(|t| *t != sub.tier) {
        set_tier(conn, &sub, tier, at).await?;
        changed = true;
    }
    if let Some(status) = object.mapped_status().filter(|s| *s != sub.status) {
        set_status(conn, &sub, status, at).await?;
        changed = true;
    }

    Ok(if changed {
        Transition::Applied("updated")
    } else {
        Transition::Skipped("nothing changed")
    })
}

/// `subscription-deleted`: terminal for this subscription instance.
pub async fn apply_subscription_deleted(
    conn: &mut SqliteConnection,
    at: i64,
    object: &SubscriptionObject,
) -> Result<Transition> {
    let Some(sub) = live_for_reference(conn, &object.customer, Some(&object.id)).await? else {
        return Ok(Transition::Unresolved(format!(
            "no live subscription {} for customer {}",
            object.id, object.customer
        )));
    };
    cancel(conn, &sub, at).await?;
    Ok(Transition::Applied("canceled"))
}

async fn create_subscription(
    conn: &mut SqliteConnection,
    donor_id: &str,
    customer_ref: &str,
    subscription_ref: Option<&str>,
    tier: Tier,
    at: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO subscriptions
            (donor_id, customer_ref, subscription_ref, status, tier, cadence,
             current_period_start, created_at, updated_at)
        VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6, ?6, ?6)
        "#,
    )
    .bind(donor_id)
    .bind(customer_ref)
    .bind(subscription_ref)
    .bind(tier)
    .bind(tier.cadence())
    .bind(at)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        "UPDATE donors SET status = 'active', tier = ?2, last_payment_at = ?3 WHERE id = ?1",
    )
    .bind(donor_id)
    .bind(tier)
    .bind(at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn set_status(
    conn: &mut SqliteConnection,
    sub: &Subscription,
    status: SubscriptionStatus,
    at: i64,
) -> Result<()> {
    sqlx::query("UPDATE subscriptions SET status = ?2, updated_at = ?3 WHERE id = ?1")
        .bind(sub.id)
        .bind(status)
        .bind(at)
        .execute(&mut *conn)
        .await?;
    sqlx::query("UPDATE donors SET status = ?2 WHERE id = ?1")
        .bind(&sub.donor_id)
        .bind(status)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn set_tier(conn: &mut SqliteConnection, sub: &Subscription, tier: Tier, at: i64) -> Result<()> {
    sqlx::query("UPDATE subscriptions SET tier = ?2, cadence = ?3, updated_at = ?4 WHERE id = ?1")
        .bind(sub.id)
        .bind(tier)
        .bind(tier.cadence())
        .bind(at)
        .execute(&mut *conn)
        .await?;
    sqlx::query("UPDATE donors SET tier = ?2 WHERE id = ?1")
        .bind(&sub.donor_id)
        .bind(tier)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn cancel(conn: &mut SqliteConnection, sub: &Subscription, at: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE subscriptions
        SET    status = 'canceled', subscription_ref = NULL, updated_at = ?2
        WHERE  id = ?1
        "#,
    )
    .bind(sub.id)
    .bind(at)
    .execute(&mut *conn)
    .await?;
    sqlx::query("UPDATE donors SET status = 'canceled' WHERE id = ?1")
        .bind(&sub.donor_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Eligibility
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Eligibility {
    ActiveSubscription,
    OneOffContribution,
    Ineligible,
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        !matches!(self, Self::Ineligible)
    }
}

/// Whether a donor may be issued a token for `cycle`: an active subscription
/// whose paid period reaches into the cycle, or a qualifying one-off
/// contribution made during that calendar month. Checked at issuance only.
pub fn evaluate(donor: &Donor, live: Option<&Subscription>, cycle: &CycleKey) -> Eligibility {
    let subscribed = live.is_some_and(|sub| {
        sub.status == SubscriptionStatus::Active && sub.current_period_start < cycle.ends_at()
    });
    if subscribed {
        return Eligibility::ActiveSubscription;
    }
    if donor.last_contribution_at.is_some_and(|ts| cycle.contains(ts)) {
        return Eligibility::OneOffContribution;
    }
    Eligibility::Ineligible
}

pub async fn eligibility(
    conn: &mut SqliteConnection,
    donor: &Donor,
    cycle: &CycleKey,
) -> Result<Eligibility> {
    let live = live_for_donor(&mut *conn, &donor.id).await?;
    Ok(evaluate(donor, live.as_ref(), cycle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{test_pool, upsert_donor};
    use crate::models::Cadence;
    use std::collections::HashMap;

    fn session(mode: CheckoutMode, amount: Option<i64>) -> CheckoutSession {
        CheckoutSession {
            id: "cs_1".into(),
            customer: Some("cus_1".into()),
            mode,
            subscription: Some("sub_1".into()),
            client_reference_id: Some("d1".into()),
            customer_email: None,
            amount_total: amount,
            metadata: HashMap::from([("tier".to_string(), "champion".to_string())]),
        }
    }

    fn invoice() -> Invoice {
        Invoice {
            id: "in_1".into(),
            customer: "cus_1".into(),
            subscription: Some("sub_1".into()),
            amount_paid: 1_500,
        }
    }

    fn sub_object(status: &str) -> SubscriptionObject {
        SubscriptionObject {
            id: "sub_1".into(),
            customer: "cus_1".into(),
            status: status.into(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn lifecycle_active_past_due_recovered_canceled() {
        let pool = test_pool().await;
        upsert_donor(&pool, "d1", "d1@x.org", "D", 0).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();

        let t = apply_checkout_completed(&mut conn, "evt_1", 100, &session(CheckoutMode::Subscription, None), 500)
            .await
            .unwrap();
        assert_eq!(t, Transition::Applied("subscription_created"));
        let sub = live_for_donor(&mut *conn, "d1").await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.cadence, Cadence::Weekly);

        apply_invoice_payment_failed(&mut conn, 200, &invoice()).await.unwrap();
        let sub = live_for_donor(&mut *conn, "d1").await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::PastDue);

        db::claim_event(&mut conn, "evt_3", "invoice_paid", 300).await.unwrap();
        apply_invoice_paid(&mut conn, "evt_3", 300, &invoice()).await.unwrap();
        let sub = live_for_donor(&mut *conn, "d1").await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.current_period_start, 300);

        apply_subscription_deleted(&mut conn, 400, &sub_object("canceled"))
            .await
            .unwrap();
        assert!(live_for_donor(&mut *conn, "d1").await.unwrap().is_none());
        let donor = db::get_donor(&mut *conn, "d1").await.unwrap().unwrap();
        assert_eq!(donor.status, SubscriptionStatus::Canceled);

        let (sub_ref,): (Option<String>,) =
            sqlx::query_as("SELECT subscription_ref FROM subscriptions WHERE donor_id = 'd1'")
                .fetch_one(&mut *conn)
                .await
                .unwrap();
        assert!(sub_ref.is_none());

        // a later checkout starts a fresh subscription
        let mut again = session(CheckoutMode::Subscription, None);
        again.id = "cs_2".into();
        again.subscription = Some("sub_9".into());
        let t = apply_checkout_completed(&mut conn, "evt_5", 500, &again, 500)
            .await
            .unwrap();
        assert_eq!(t, Transition::Applied("subscription_created"));
        let sub = live_for_donor(&mut *conn, "d1").await.unwrap().unwrap();
        assert_eq!(sub.subscription_ref.as_deref(), Some("sub_9"));
        assert_eq!(sub.status, SubscriptionStatus::Active);
        let donor = db::get_donor(&mut *conn, "d1").await.unwrap().unwrap();
        assert_eq!(donor.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn events_for_another_subscription_ref_are_dropped() {
        let pool = test_pool().await;
        upsert_donor(&pool, "d1", "d1@x.org", "D", 0).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        apply_checkout_completed(&mut conn, "evt_1", 100, &session(CheckoutMode::Subscription, None), 500)
            .await
            .unwrap();

        let mut other = sub_object("canceled");
        other.id = "sub_2".into();
        let t = apply_subscription_deleted(&mut conn, 200, &other).await.unwrap();
        assert!(matches!(t, Transition::Unresolved(_)));
        let t = apply_subscription_updated(&mut conn, 200, &other).await.unwrap();
        assert!(matches!(t, Transition::Unresolved(_)));

        let mut failed = invoice();
        failed.subscription = Some("sub_2".into());
        let t = apply_invoice_payment_failed(&mut conn, 200, &failed).await.unwrap();
        assert!(matches!(t, Transition::Unresolved(_)));

        let sub = live_for_donor(&mut *conn, "d1").await.unwrap().unwrap();
        assert_eq!(sub.subscription_ref.as_deref(), Some("sub_1"));
        assert_eq!(sub.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn subscription_without_recorded_ref_resolves_by_customer() {
        let pool = test_pool().await;
        upsert_donor(&pool, "d1", "d1@x.org", "D", 0).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let mut checkout = session(CheckoutMode::Subscription, None);
        checkout.subscription = None;
        apply_checkout_completed(&mut conn, "evt_1", 100, &checkout, 500)
            .await
            .unwrap();

        let t = apply_invoice_payment_failed(&mut conn, 200, &invoice()).await.unwrap();
        assert_eq!(t, Transition::Applied("past_due"));
        let sub = live_for_donor(&mut *conn, "d1").await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::PastDue);
    }

    #[tokio::test]
    async fn second_live_subscription_is_refused() {
        let pool = test_pool().await;
        upsert_donor(&pool, "d1", "d1@x.org", "D", 0).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let checkout = session(CheckoutMode::Subscription, None);
        apply_checkout_completed(&mut conn, "evt_1", 100, &checkout, 500)
            .await
            .unwrap();
        let t = apply_checkout_completed(&mut conn, "evt_2", 110, &checkout, 500)
            .await
            .unwrap();
        assert!(matches!(t, Transition::Unresolved(_)));

        let (live,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM subscriptions WHERE donor_id = 'd1' AND status != 'canceled'",
        )
        .fetch_one(&mut *conn)
        .await
        .unwrap();
        assert_eq!(live, 1);
    }

    #[tokio::test]
    async fn unknown_customer_is_unresolved() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let t = apply_invoice_payment_failed(&mut conn, 1, &invoice()).await.unwrap();
        assert!(matches!(t, Transition::Unresolved(_)));
        let t = apply_checkout_completed(&mut conn, "evt", 1, &session(CheckoutMode::Payment, Some(900)), 500)
            .await
            .unwrap();
        assert!(matches!(t, Transition::Unresolved(_)));
    }

    #[tokio::test]
    async fn one_off_below_minimum_does_not_grant_vote() {
        let pool = test_pool().await;
        upsert_donor(&pool, "d1", "d1@x.org", "D", 0).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        db::claim_event(&mut conn, "evt_small", "checkout_completed", 50).await.unwrap();
        let t = apply_checkout_completed(&mut conn, "evt_small", 50, &session(CheckoutMode::Payment, Some(100)), 500)
            .await
            .unwrap();
        assert_eq!(t, Transition::Applied("one_off_below_minimum"));
        let donor = db::get_donor(&mut *conn, "d1").await.unwrap().unwrap();
        assert!(donor.last_contribution_at.is_none());
        assert_eq!(donor.status, SubscriptionStatus::None);
    }

    #[tokio::test]
    async fn subscription_updated_changes_tier_and_status() {
        let pool = test_pool().await;
        upsert_donor(&pool, "d1", "d1@x.org", "D", 0).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        apply_checkout_completed(&mut conn, "evt_1", 100, &session(CheckoutMode::Subscription, None), 500)
            .await
            .unwrap();

        let mut update = sub_object("past_due");
        update.metadata.insert("tier".into(), "patron".into());
        let t = apply_subscription_updated(&mut conn, 200, &update).await.unwrap();
        assert_eq!(t, Transition::Applied("updated"));
        let sub = live_for_donor(&mut *conn, "d1").await.unwrap().unwrap();
        assert_eq!(sub.tier, Tier::Patron);
        assert_eq!(sub.cadence, Cadence::Every4Days);
        assert_eq!(sub.status, SubscriptionStatus::PastDue);

        let t = apply_subscription_updated(&mut conn, 300, &update).await.unwrap();
        assert_eq!(t, Transition::Skipped("nothing changed"));
    }

    fn donor(last_contribution_at: Option<i64>) -> Donor {
        Donor {
            id: "d1".into(),
            email: "d1@x.org".into(),
            display_name: "D".into(),
            tier: None,
            status: SubscriptionStatus::None,
            last_payment_at: None,
            last_contribution_at,
            created_at: 0,
        }
    }

    fn subscription(status: SubscriptionStatus, period_start: i64) -> Subscription {
        Subscription {
            id: 1,
            donor_id: "d1".into(),
            customer_ref: "cus_1".into(),
            subscription_ref: Some("sub_1".into()),
            status,
            tier: Tier::Supporter,
            cadence: Cadence::Monthly,
            current_period_start: period_start,
            created_at: period_start,
            updated_at: period_start,
        }
    }

    #[test]
    fn eligibility_rule() {
        let cycle = CycleKey::new(2024, 5).unwrap();
        let mid = cycle.starts_at() + 86_400;

        let active = subscription(SubscriptionStatus::Active, mid);
        assert_eq!(
            evaluate(&donor(None), Some(&active), &cycle),
            Eligibility::ActiveSubscription
        );

        let past_due = subscription(SubscriptionStatus::PastDue, mid);
        assert_eq!(
            evaluate(&donor(None), Some(&past_due), &cycle),
            Eligibility::Ineligible
        );
        assert_eq!(
            evaluate(&donor(Some(mid)), Some(&past_due), &cycle),
            Eligibility::OneOffContribution
        );

        let last_month = cycle.previous().starts_at() + 10;
        assert_eq!(
            evaluate(&donor(Some(last_month)), None, &cycle),
            Eligibility::Ineligible
        );

        let starts_next_month = subscription(SubscriptionStatus::Active, cycle.ends_at());
        assert!(!evaluate(&donor(None), Some(&starts_next_month), &cycle).is_eligible());
    }
}
