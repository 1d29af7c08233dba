//! Provider notifications decoded into a closed set of variants.

use bigdecimal::BigDecimal;
use serde::Deserialize;
use uuid::Uuid;

use super::types::Metadata;
use crate::domain::money::from_minor_units;
use crate::error::SettlementError;

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub payment_status: String,
    pub amount_total: Option<i64>,
    pub currency: Option<String>,
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl CheckoutSessionObject {
    /// Order reference: explicit metadata first, then the client reference.
    pub fn order_id(&self) -> Option<Uuid> {
        self.metadata
            .get("order_id")
            .or(self.client_reference_id.as_ref())
            .and_then(|raw| Uuid::parse_str(raw).ok())
    }

    pub fn buyer_id(&self) -> Option<Uuid> {
        self.metadata
            .get("buyer_id")
            .and_then(|raw| Uuid::parse_str(raw).ok())
    }

    pub fn is_paid(&self) -> bool {
        self.payment_status == "paid"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefundObject {
    pub id: String,
    #[serde(default)]
    pub status: String,
    pub amount: i64,
    pub currency: String,
    pub payment_intent: Option<String>,
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl RefundObject {
    pub fn transaction_id(&self) -> Option<Uuid> {
        metadata_uuid(&self.metadata, "transaction_id")
    }

    pub fn amount(&self) -> BigDecimal {
        from_minor_units(self.amount, &self.currency)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferObject {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub destination: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl TransferObject {
    pub fn transaction_id(&self) -> Option<Uuid> {
        metadata_uuid(&self.metadata, "transaction_id")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountRequirements {
    #[serde(default)]
    pub currently_due: Vec<String>,
    pub disabled_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountObject {
    pub id: String,
    #[serde(default)]
    pub charges_enabled: bool,
    #[serde(default)]
    pub payouts_enabled: bool,
    #[serde(default)]
    pub details_submitted: bool,
    #[serde(default)]
    pub requirements: AccountRequirements,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayoutObject {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub arrival_date: Option<i64>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl PayoutObject {
    pub fn amount(&self) -> BigDecimal {
        from_minor_units(self.amount, &self.currency)
    }

    /// Our payout id, when the payout was created by this service.
    pub fn payout_id(&self) -> Option<Uuid> {
        metadata_uuid(&self.metadata, "payout_id")
    }

    pub fn seller_id(&self) -> Option<Uuid> {
        metadata_uuid(&self.metadata, "seller_id")
    }
}

fn metadata_uuid(metadata: &Metadata, key: &str) -> Option<Uuid> {
    metadata.get(key).and_then(|raw| Uuid::parse_str(raw).ok())
}

#[derive(Debug, Clone)]
pub enum EventKind {
    CheckoutCompleted(CheckoutSessionObject),
    RefundUpdated(RefundObject),
    RefundFailed(RefundObject),
    TransferCreated(TransferObject),
    /// `transfer.failed` and `transfer.reversed`.
    TransferFailed(TransferObject),
    AccountUpdated(AccountObject),
    PayoutPaid(PayoutObject),
    PayoutFailed(PayoutObject),
    PayoutUpdated(PayoutObject),
    PayoutCanceled(PayoutObject),
    Unhandled { event_type: String },
}

#[derive(Debug, Clone)]
pub struct ProviderEvent {
    pub id: String,
    pub event_type: String,
    pub created: i64,
    pub kind: EventKind,
    pub raw: serde_json::Value,
}

#[derive(Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    created: i64,
    data: EnvelopeData,
}

#[derive(Deserialize)]
struct EnvelopeData {
    object: serde_json::Value,
}

fn object<T: serde::de::DeserializeOwned>(
    event_type: &str,
    value: serde_json::Value,
) -> Result<T, SettlementError> {
    serde_json::from_value(value).map_err(|e| {
        SettlementError::InvalidPayload(format!("malformed {} object: {}", event_type, e))
    })
}

/// Decodes a raw webhook body. Unknown event types decode to
/// [`EventKind::Unhandled`]; a known type with a malformed object is an error.
pub fn decode_event(payload: &[u8]) -> Result<ProviderEvent, SettlementError> {
    let raw: serde_json::Value = serde_json::from_slice(payload)
        .map_err(|e| SettlementError::InvalidPayload(format!("body is not JSON: {}", e)))?;
    let envelope: Envelope = serde_json::from_value(raw.clone())
        .map_err(|e| SettlementError::InvalidPayload(format!("invalid event envelope: {}", e)))?;

    let event_type = envelope.event_type.as_str();
    let value = envelope.data.object;
    let kind = match event_type {
        "checkout.session.completed" => EventKind::CheckoutCompleted(object(event_type, value)?),
        "charge.refund.updated" | "refund.updated" => {
            EventKind::RefundUpdated(object(event_type, value)?)
        }
        "refund.failed" => EventKind::RefundFailed(object(event_type, value)?),
        "transfer.created" => EventKind::TransferCreated(object(event_type, value)?),
        "transfer.failed" | "transfer.reversed" => {
            EventKind::TransferFailed(object(event_type, value)?)
        }
        "account.updated" => EventKind::AccountUpdated(object(event_type, value)?),
        "payout.paid" => EventKind::PayoutPaid(object(event_type, value)?),
        "payout.failed" => EventKind::PayoutFailed(object(event_type, value)?),
        "payout.updated" => EventKind::PayoutUpdated(object(event_type, value)?),
        "payout.canceled" => EventKind::PayoutCanceled(object(event_type, value)?),
        other => EventKind::Unhandled {
            event_type: other.to_string(),
        },
    };

    Ok(ProviderEvent {
        id: envelope.id,
        event_type: envelope.event_type,
        created: envelope.created,
        kind,
        raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    fn body(event_type: &str, object: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": "evt_1",
            "type": event_type,
            "created": 1_700_000_000,
            "data": { "object": object }
        }))
        .unwrap()
    }

    #[test]
    fn test_checkout_completed_decodes_order_reference() {
        let order_id = Uuid::new_v4();
        let event = decode_event(&body(
            "checkout.session.completed",
            json!({
                "id": "cs_1",
                "payment_intent": "pi_1",
                "payment_status": "paid",
                "amount_total": 10000,
                "currency": "usd",
                "metadata": { "order_id": order_id.to_string() }
            }),
        ))
        .unwrap();

        match event.kind {
            EventKind::CheckoutCompleted(session) => {
                assert_eq!(session.order_id(), Some(order_id));
                assert!(session.is_paid());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(event.id, "evt_1");
    }

    #[test]
    fn test_transfer_reversed_maps_to_failure() {
        let event = decode_event(&body(
            "transfer.reversed",
            json!({ "id": "tr_1", "amount": 9180, "currency": "usd" }),
        ))
        .unwrap();
        assert!(matches!(event.kind, EventKind::TransferFailed(_)));
    }

    #[test]
    fn test_unknown_type_is_unhandled() {
        let event = decode_event(&body("invoice.created", json!({ "id": "in_1" }))).unwrap();
        match event.kind {
            EventKind::Unhandled { event_type } => assert_eq!(event_type, "invoice.created"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_malformed_known_object_is_rejected() {
        let err = decode_event(&body("payout.paid", json!({ "id": "po_1" }))).unwrap_err();
        assert!(matches!(err, SettlementError::InvalidPayload(_)));
    }

    #[test]
    fn test_payout_amount_in_major_units() {
        let event = decode_event(&body(
            "payout.paid",
            json!({ "id": "po_1", "amount": 9180, "currency": "usd", "status": "paid" }),
        ))
        .unwrap();
        match event.kind {
            EventKind::PayoutPaid(payout) => {
                assert_eq!(payout.amount(), BigDecimal::from_str("91.80").unwrap())
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_not_json_is_rejected() {
        assert!(decode_event(b"not json").is_err());
    }
}
