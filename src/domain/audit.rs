//! Structured audit trail entries kept on transactions and payouts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One append-only note on a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditNote {
    pub at: DateTime<Utc>,
    pub actor: String,
    pub message: String,
}

impl AuditNote {
    pub fn new(at: DateTime<Utc>, actor: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            at,
            actor: actor.into(),
            message: message.into(),
        }
    }
}

/// One entry of a payout's status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: String,
    pub at: DateTime<Utc>,
    pub note: Option<String>,
}

pub const SYSTEM_ACTOR: &str = "system";
pub const WEBHOOK_ACTOR: &str = "provider-webhook";
