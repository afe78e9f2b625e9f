//! Reconciliation log
//!
//! Compensations are best effort. When a refund, a card grant, or a
//! confirmation publish fails after money has already moved, the event is
//! written here with enough context for an operator to fix the balance by
//! hand. Filter on the `tollgate::reconcile` target to collect them.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::error;

/// Log target for reconciliation events
pub const RECONCILE_TARGET: &str = "tollgate::reconcile";

/// What could not be completed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileKind {
    /// Credits were reserved, the job was not published, and the refund failed
    RefundFailed,
    /// A card was charged but the credit grant failed
    GrantFailed,
    /// A payment submission was recorded but its confirmation job was not published
    ConfirmationUnpublished,
}

/// One reconciliation record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: ReconcileKind,
    pub account: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_number: Option<u64>,
    pub error: String,
}

impl ReconcileEvent {
    pub fn new(kind: ReconcileKind, account: &str, error: impl ToString) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            account: account.to_string(),
            amount: None,
            operation: None,
            payment_number: None,
            error: error.to_string(),
        }
    }

    pub fn with_amount(mut self, amount: Decimal) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn with_operation(mut self, operation: &str) -> Self {
        self.operation = Some(operation.to_string());
        self
    }

    pub fn with_payment_number(mut self, number: u64) -> Self {
        self.payment_number = Some(number);
        self
    }

    /// Convert to JSONL line
    pub fn to_jsonl(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Write the event to the reconciliation target
    pub fn emit(&self) {
        error!(
            target: RECONCILE_TARGET,
            kind = ?self.kind,
            account = %self.account,
            amount = ?self.amount,
            operation = ?self.operation,
            payment_number = ?self.payment_number,
            error = %self.error,
            record = %self.to_jsonl(),
            "manual reconciliation required"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jsonl_carries_context() {
        let event = ReconcileEvent::new(ReconcileKind::RefundFailed, "alice", "store offline")
            .with_amount(Decimal::new(105, 1))
            .with_operation("pin");
        let line = event.to_jsonl();
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["kind"], "refund_failed");
        assert_eq!(parsed["account"], "alice");
        assert_eq!(parsed["amount"], "10.5");
        assert_eq!(parsed["operation"], "pin");
        assert!(parsed.get("payment_number").is_none());
    }
}
