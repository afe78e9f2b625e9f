//! Credit ledger guard
//!
//! Reserves credits before a metered action and refunds them when the action
//! cannot be handed off. Reserve failures for lack of funds are ordinary
//! business outcomes (`insufficient-balance`), not system errors.
//!
//! Refunds are best effort. A refund that fails is written to the
//! reconciliation log and never retried here.

pub mod mongo;
pub mod store;

pub use mongo::MongoCreditStore;
pub use store::{from_micro, to_micro, CreditStore, InMemoryCreditStore, CREDIT_SCALE};

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info};

use crate::logging::{ReconcileEvent, ReconcileKind};
use crate::types::{Result, TollgateError};

/// Credits held for one request
#[derive(Debug, Clone, PartialEq)]
#[must_use = "a reservation must end in a published job or a refund"]
pub struct Reservation {
    pub account: String,
    pub cost: Decimal,
    /// Balance right after the debit
    pub remaining: Decimal,
}

/// Reserve/refund guard over a [`CreditStore`]
#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn CreditStore>,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn CreditStore>) -> Self {
        Self { store }
    }

    /// Atomically take `cost` credits from `account`.
    ///
    /// A zero cost touches nothing and returns the current balance.
    pub async fn reserve(&self, account: &str, cost: Decimal) -> Result<Reservation> {
        if cost.is_sign_negative() && !cost.is_zero() {
            return Err(TollgateError::BadRequest(format!("negative cost {}", cost)));
        }

        if cost.is_zero() {
            let remaining = self.store.balance(account).await?;
            return Ok(Reservation {
                account: account.to_string(),
                cost,
                remaining,
            });
        }

        match self.store.debit_if_covered(account, cost).await? {
            Some(remaining) => {
                debug!(account = %account, cost = %cost, remaining = %remaining, "credits reserved");
                Ok(Reservation {
                    account: account.to_string(),
                    cost,
                    remaining,
                })
            }
            None => {
                let available = self.store.balance(account).await.unwrap_or(Decimal::ZERO);
                info!(account = %account, cost = %cost, available = %available, "insufficient balance");
                Err(TollgateError::InsufficientBalance {
                    required: cost,
                    available,
                })
            }
        }
    }

    /// Give back credits taken by `reserve`.
    ///
    /// Never fails the caller. Returns whether the refund landed; a failed
    /// refund is recorded for manual reconciliation.
    pub async fn refund(&self, account: &str, cost: Decimal, operation: &str) -> bool {
        if cost.is_zero() {
            return true;
        }
        match self.store.credit(account, cost).await {
            Ok(balance) => {
                info!(account = %account, cost = %cost, balance = %balance, operation = %operation, "credits refunded");
                true
            }
            Err(e) => {
                ReconcileEvent::new(ReconcileKind::RefundFailed, account, &e)
                    .with_amount(cost)
                    .with_operation(operation)
                    .emit();
                false
            }
        }
    }

    /// Add purchased credits
    pub async fn grant(&self, account: &str, amount: Decimal) -> Result<Decimal> {
        if amount <= Decimal::ZERO {
            return Err(TollgateError::BadRequest(format!("grant must be positive, got {}", amount)));
        }
        let balance = self.store.credit(account, amount).await?;
        info!(account = %account, amount = %amount, balance = %balance, "credits granted");
        Ok(balance)
    }

    pub async fn balance(&self, account: &str) -> Result<Decimal> {
        self.store.balance(account).await
    }

    pub async fn is_admin(&self, account: &str) -> Result<bool> {
        self.store.is_admin(account).await
    }
}
