//! Billing processor lifecycle events.
//!
//! The processor posts a JSON envelope whose `type` string selects the shape
//! of `data.object`. The envelope is decoded exactly once, at the webhook
//! boundary, into a [`BillingEvent`]; handlers never see untyped JSON.

use std::collections::HashMap;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{LedgerError, Result};
use crate::models::{SubscriptionStatus, Tier};

/// All recognised event kinds from the billing processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A hosted checkout finished (`checkout.session.completed`).
    CheckoutCompleted,
    /// A subscription invoice was paid (`invoice.paid`).
    InvoicePaid,
    /// A subscription renewal failed (`invoice.payment_failed`).
    InvoicePaymentFailed,
    /// Status or plan of a subscription changed (`customer.subscription.updated`).
    SubscriptionUpdated,
    /// A subscription ended (`customer.subscription.deleted`).
    SubscriptionDeleted,
    /// Anything else; acknowledged but not applied.
    Unknown,
}

impl EventKind {
    /// Parse the envelope `type` discriminator into an [`EventKind`].
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "checkout.session.completed" => Self::CheckoutCompleted,
            "invoice.paid" => Self::InvoicePaid,
            "invoice.payment_failed" => Self::InvoicePaymentFailed,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            _ => Self::Unknown,
        }
    }

    /// Return a short identifier string suitable for storage in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CheckoutCompleted => "checkout_completed",
            Self::InvoicePaid => "invoice_paid",
            Self::InvoicePaymentFailed => "invoice_payment_failed",
            Self::SubscriptionUpdated => "subscription_updated",
            Self::SubscriptionDeleted => "subscription_deleted",
            Self::Unknown => "unknown",
        }
    }
}

// ─────────────────────────────────────────────────────────
// Wire shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RawEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: Option<i64>,
    pub data: RawData,
}

#[derive(Debug, Deserialize)]
pub struct RawData {
    pub object: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutMode {
    Subscription,
    Payment,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub customer: Option<String>,
    pub mode: CheckoutMode,
    pub subscription: Option<String>,
    /// Donor id handed to the processor when the checkout was created.
    pub client_reference_id: Option<String>,
    pub customer_email: Option<String>,
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CheckoutSession {
    pub fn tier(&self) -> Option<Tier> {
        self.metadata.get("tier").and_then(|t| Tier::from_name(t))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub customer: String,
    pub subscription: Option<String>,
    #[serde(default)]
    pub amount_paid: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    pub customer: String,
    pub status: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl SubscriptionObject {
    /// Map the processor's status vocabulary onto ours. Statuses with no
    /// counterpart (`incomplete`, `paused`, ...) leave the record untouched.
    pub fn mapped_status(&self) -> Option<SubscriptionStatus> {
        match self.status.as_str() {
            "active" | "trialing" => Some(SubscriptionStatus::Active),
            "past_due" | "unpaid" => Some(SubscriptionStatus::PastDue),
            "canceled" => Some(SubscriptionStatus::Canceled),
            _ => None,
        }
    }

    pub fn tier(&self) -> Option<Tier> {
        self.metadata.get("tier").and_then(|t| Tier::from_name(t))
    }
}

// ─────────────────────────────────────────────────────────
// Decoded events
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum EventPayload {
    CheckoutCompleted(CheckoutSession),
    InvoicePaid(Invoice),
    InvoicePaymentFailed(Invoice),
    SubscriptionUpdated(SubscriptionObject),
    SubscriptionDeleted(SubscriptionObject),
    Ignored,
}

/// A fully decoded billing event, ready to be applied.
#[derive(Debug, Clone)]
pub struct BillingEvent {
    pub id: String,
    pub kind: EventKind,
    /// When the processor generated the event (unix seconds).
    pub created: i64,
    pub payload: EventPayload,
}

impl BillingEvent {
    /// Decode a raw webhook body. `now` stands in for a missing `created`.
    pub fn decode(body: &[u8], now: i64) -> Result<Self> {
        let raw: RawEnvelope = serde_json::from_slice(body)
            .map_err(|e| LedgerError::EventParse(format!("invalid envelope: {e}")))?;
        let kind = EventKind::from_type(&raw.event_type);
        let object = raw.data.object;

        let payload = match kind {
            EventKind::CheckoutCompleted => EventPayload::CheckoutCompleted(object_as(object, kind)?),
            EventKind::InvoicePaid => EventPayload::InvoicePaid(object_as(object, kind)?),
            EventKind::InvoicePaymentFailed => {
                EventPayload::InvoicePaymentFailed(object_as(object, kind)?)
            }
            EventKind::SubscriptionUpdated => {
                EventPayload::SubscriptionUpdated(object_as(object, kind)?)
            }
            EventKind::SubscriptionDeleted => {
                EventPayload::SubscriptionDeleted(object_as(object, kind)?)
            }
            EventKind::Unknown => EventPayload::Ignored,
        };

        Ok(BillingEvent {
            id: raw.id,
            kind,
            created: raw.created.unwrap_or(now),
            payload,
        })
    }
}

fn object_as<T: DeserializeOwned>(object: Value, kind: EventKind) -> Result<T> {
    serde_json::from_value(object)
        .map_err(|e| LedgerError::EventParse(format!("{} object: {e}", kind.as_str())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_from_type() {
        assert_eq!(
            EventKind::from_type("checkout.session.completed"),
            EventKind::CheckoutCompleted
        );
        assert_eq!(EventKind::from_type("invoice.paid"), EventKind::InvoicePaid);
        assert_eq!(
            EventKind::from_type("invoice.payment_failed"),
            EventKind::InvoicePaymentFailed
        );
        assert_eq!(
            EventKind::from_type("customer.subscription.updated"),
            EventKind::SubscriptionUpdated
        );
        assert_eq!(
            EventKind::from_type("customer.subscription.deleted"),
            EventKind::SubscriptionDeleted
        );
        assert_eq!(EventKind::from_type("charge.refunded"), EventKind::Unknown);
    }

    #[test]
    fn decode_subscription_checkout() {
        let body = serde_json::json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "created": 1_700_000_000,
            "data": { "object": {
                "id": "cs_1",
                "customer": "cus_1",
                "mode": "subscription",
                "subscription": "sub_1",
                "client_reference_id": "donor-1",
                "metadata": { "tier": "champion" }
            }}
        });
        let ev = BillingEvent::decode(body.to_string().as_bytes(), 0).unwrap();
        assert_eq!(ev.id, "evt_1");
        assert_eq!(ev.created, 1_700_000_000);
        match ev.payload {
            EventPayload::CheckoutCompleted(session) => {
                assert_eq!(session.mode, CheckoutMode::Subscription);
                assert_eq!(session.tier(), Some(Tier::Champion));
                assert_eq!(session.subscription.as_deref(), Some("sub_1"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn decode_invoice_failure() {
        let body = br#"{"id":"evt_2","type":"invoice.payment_failed",
            "data":{"object":{"id":"in_1","customer":"cus_1","subscription":"sub_1"}}}"#;
        let ev = BillingEvent::decode(body, 42).unwrap();
        assert_eq!(ev.kind, EventKind::InvoicePaymentFailed);
        assert_eq!(ev.created, 42);
        assert!(matches!(ev.payload, EventPayload::InvoicePaymentFailed(ref i) if i.amount_paid == 0));
    }

    #[test]
    fn unknown_type_is_ignored_not_rejected() {
        let body = br#"{"id":"evt_3","type":"charge.refunded","data":{"object":{"anything":1}}}"#;
        let ev = BillingEvent::decode(body, 0).unwrap();
        assert_eq!(ev.kind, EventKind::Unknown);
        assert!(matches!(ev.payload, EventPayload::Ignored));
    }

    #[test]
    fn malformed_object_is_a_parse_error() {
        let body = br#"{"id":"evt_4","type":"invoice.paid","data":{"object":{"id":"in_1"}}}"#;
        let err = BillingEvent::decode(body, 0).unwrap_err();
        assert!(matches!(err, LedgerError::EventParse(_)));
    }

    #[test]
    fn subscription_status_mapping() {
        let mut sub = SubscriptionObject {
            id: "sub_1".into(),
            customer: "cus_1".into(),
            status: "trialing".into(),
            metadata: HashMap::new(),
        };
        assert_eq!(sub.mapped_status(), Some(SubscriptionStatus::Active));
        sub.status = "unpaid".into();
        assert_eq!(sub.mapped_status(), Some(SubscriptionStatus::PastDue));
        sub.status = "canceled".into();
        assert_eq!(sub.mapped_status(), Some(SubscriptionStatus::Canceled));
        sub.status = "incomplete".into();
        assert_eq!(sub.mapped_status(), None);
    }
}
