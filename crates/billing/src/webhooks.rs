//! Stripe webhook handling
//!
//! Signature verification, parsing of event payloads into typed variants, and
//! dispatch to the subscription reconciler. Signatures are checked manually
//! against the raw payload so newer API versions don't trip async-stripe's
//! pinned event types.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{BillingError, BillingResult};
use crate::provider::{BillingProvider, RemoteSubscription};
use crate::store::{BillingStore, WebhookEventResult};
use crate::subscriptions::{ReconcileOutcome, SkipReason, SubscriptionReconciler};

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted age of a signed payload
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Verify a `Stripe-Signature` header (`t=<ts>,v1=<hex>[,v1=<hex>]`) against the raw payload
pub fn verify_signature(payload: &str, header: &str, secret: &str, now: i64) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let mut kv = part.trim().splitn(2, '=');
        match (kv.next(), kv.next()) {
            (Some("t"), Some(value)) => timestamp = value.parse().ok(),
            (Some("v1"), Some(value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;
    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("Invalid webhook secret".to_string()))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());

    let matched = signatures
        .iter()
        .any(|sig| bool::from(expected.as_bytes().ct_eq(sig.as_bytes())));
    if matched {
        Ok(())
    } else {
        tracing::warn!("Webhook signature mismatch");
        Err(BillingError::WebhookSignatureInvalid)
    }
}

/// Current unix time in seconds
pub fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

// =============================================================================
// Events
// =============================================================================

/// Invoice fields needed to find the affected subscription
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceRef {
    pub id: String,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
}

/// Recognized webhook events
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookEvent {
    SubscriptionCreated(RemoteSubscription),
    SubscriptionUpdated(RemoteSubscription),
    SubscriptionDeleted(RemoteSubscription),
    TrialWillEnd(RemoteSubscription),
    InvoicePaymentSucceeded(InvoiceRef),
    InvoicePaymentFailed(InvoiceRef),
    Unhandled(String),
}

/// A verified, parsed event
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEvent {
    pub id: String,
    pub event_type: String,
    pub created: Option<i64>,
    pub event: WebhookEvent,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    type_: String,
    created: Option<i64>,
    data: EnvelopeData,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData {
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RawInvoice {
    id: String,
    customer: Option<serde_json::Value>,
    subscription: Option<serde_json::Value>,
    parent: Option<RawInvoiceParent>,
}

#[derive(Debug, Deserialize)]
struct RawInvoiceParent {
    subscription_details: Option<RawSubscriptionDetails>,
}

#[derive(Debug, Deserialize)]
struct RawSubscriptionDetails {
    subscription: Option<serde_json::Value>,
}

/// Id of a field that is either an id string or an expanded object
fn expandable_id(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(id) => Some(id.clone()),
        serde_json::Value::Object(map) => map.get("id")?.as_str().map(str::to_string),
        _ => None,
    }
}

fn parse_invoice(object: serde_json::Value) -> BillingResult<InvoiceRef> {
    let raw: RawInvoice = serde_json::from_value(object)?;
    let subscription_id = expandable_id(raw.subscription.as_ref()).or_else(|| {
        raw.parent
            .as_ref()
            .and_then(|p| p.subscription_details.as_ref())
            .and_then(|d| expandable_id(d.subscription.as_ref()))
    });
    Ok(InvoiceRef {
        id: raw.id,
        customer_id: expandable_id(raw.customer.as_ref()),
        subscription_id,
    })
}

/// Parse a raw webhook payload into a typed event
pub fn parse_event(payload: &str) -> BillingResult<ParsedEvent> {
    let envelope: Envelope = serde_json::from_str(payload)?;
    let object = envelope.data.object;

    let event = match envelope.type_.as_str() {
        "customer.subscription.created" => {
            WebhookEvent::SubscriptionCreated(RemoteSubscription::from_json(&object)?)
        }
        "customer.subscription.updated"
        | "customer.subscription.paused"
        | "customer.subscription.resumed" => {
            WebhookEvent::SubscriptionUpdated(RemoteSubscription::from_json(&object)?)
        }
        "customer.subscription.deleted" => {
            WebhookEvent::SubscriptionDeleted(RemoteSubscription::from_json(&object)?)
        }
        "customer.subscription.trial_will_end" => {
            WebhookEvent::TrialWillEnd(RemoteSubscription::from_json(&object)?)
        }
        "invoice.payment_succeeded" | "invoice.paid" => {
            WebhookEvent::InvoicePaymentSucceeded(parse_invoice(object)?)
        }
        "invoice.payment_failed" => WebhookEvent::InvoicePaymentFailed(parse_invoice(object)?),
        other => WebhookEvent::Unhandled(other.to_string()),
    };

    Ok(ParsedEvent {
        id: envelope.id,
        event_type: envelope.type_,
        created: envelope.created,
        event,
    })
}

// =============================================================================
// Handler
// =============================================================================

/// What handling an event amounted to
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    Applied,
    Skipped(SkipReason),
    Ignored,
}

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    provider: Arc<dyn BillingProvider>,
    store: Arc<dyn BillingStore>,
    reconciler: SubscriptionReconciler,
}

impl WebhookHandler {
    pub fn new(provider: Arc<dyn BillingProvider>, store: Arc<dyn BillingStore>) -> Self {
        let reconciler = SubscriptionReconciler::new(provider.clone(), store.clone());
        Self {
            provider,
            store,
            reconciler,
        }
    }

    /// Handle a verified event and record the result in the event log.
    ///
    /// Redelivered events are processed again; reconciliation is idempotent.
    pub async fn handle_event(&self, event: &ParsedEvent) -> BillingResult<WebhookOutcome> {
        self.store
            .record_webhook_event(&event.id, &event.event_type)
            .await?;

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing Stripe webhook event"
        );

        let result = self.process(&event.event).await;

        let (status, error_message) = match &result {
            Ok(WebhookOutcome::Applied) => (WebhookEventResult::Success, None),
            Ok(WebhookOutcome::Skipped(reason)) => {
                (WebhookEventResult::Skipped, Some(reason.to_string()))
            }
            Ok(WebhookOutcome::Ignored) => (WebhookEventResult::Skipped, None),
            Err(e) => (WebhookEventResult::Error, Some(e.to_string())),
        };

        if let Err(e) = self
            .store
            .complete_webhook_event(&event.id, status, error_message.as_deref())
            .await
        {
            tracing::error!(
                event_id = %event.id,
                error = %e,
                "Failed to update webhook audit record"
            );
        }

        result
    }

    async fn process(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        match event {
            WebhookEvent::SubscriptionCreated(sub)
            | WebhookEvent::SubscriptionUpdated(sub)
            | WebhookEvent::SubscriptionDeleted(sub)
            | WebhookEvent::TrialWillEnd(sub) => self.apply(sub).await,
            WebhookEvent::InvoicePaymentSucceeded(invoice)
            | WebhookEvent::InvoicePaymentFailed(invoice) => {
                let Some(subscription_id) = invoice.subscription_id.as_deref() else {
                    tracing::debug!(invoice_id = %invoice.id, "Invoice without subscription, ignoring");
                    return Ok(WebhookOutcome::Ignored);
                };
                // Invoice payloads don't carry subscription state; read it fresh
                let sub = self.provider.retrieve_subscription(subscription_id).await?;
                self.apply(&sub).await
            }
            WebhookEvent::Unhandled(event_type) => {
                tracing::debug!(event_type = %event_type, "Unhandled webhook event type");
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    async fn apply(&self, sub: &RemoteSubscription) -> BillingResult<WebhookOutcome> {
        Ok(match self.reconciler.reconcile(sub).await? {
            ReconcileOutcome::Applied(_) => WebhookOutcome::Applied,
            ReconcileOutcome::Skipped(reason) => WebhookOutcome::Skipped(reason),
        })
    }
}
