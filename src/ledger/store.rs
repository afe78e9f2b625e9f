//! Balance store seam
//!
//! The ledger never reads a balance and then writes it back. Every debit is a
//! single conditional decrement performed by the store, so two concurrent
//! reserves can never both pass against the same stale balance.

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::types::{Result, TollgateError};

/// Decimal places kept for credit balances
pub const CREDIT_SCALE: u32 = 6;

const MICRO: i64 = 1_000_000;

/// Convert credits to integer micro-credits, rounding to the ledger scale
pub fn to_micro(amount: Decimal) -> Result<i64> {
    (amount.round_dp(CREDIT_SCALE) * Decimal::from(MICRO))
        .to_i64()
        .ok_or_else(|| TollgateError::BadRequest(format!("credit amount {} out of range", amount)))
}

/// Convert integer micro-credits back to credits
pub fn from_micro(micro: i64) -> Decimal {
    Decimal::new(micro, CREDIT_SCALE).normalize()
}

/// Persistent account balances
#[async_trait]
pub trait CreditStore: Send + Sync {
    /// Current balance, `AccountNotFound` if the account does not exist
    async fn balance(&self, account: &str) -> Result<Decimal>;

    async fn is_admin(&self, account: &str) -> Result<bool>;

    /// Decrement by `amount` only if the balance covers it.
    ///
    /// Returns the new balance, or `None` when the balance was insufficient
    /// (nothing is changed in that case).
    async fn debit_if_covered(&self, account: &str, amount: Decimal) -> Result<Option<Decimal>>;

    /// Increment unconditionally and return the new balance
    async fn credit(&self, account: &str, amount: Decimal) -> Result<Decimal>;
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    micro: i64,
    admin: bool,
}

/// In-memory balance store for dev mode and tests
#[derive(Default)]
pub struct InMemoryCreditStore {
    accounts: DashMap<String, Entry>,
    fail_credits: AtomicBool,
    fail_debits: AtomicBool,
}

impl InMemoryCreditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or overwrite an account
    pub fn open_account(&self, account: &str, balance: Decimal, admin: bool) -> Result<()> {
        let micro = to_micro(balance)?;
        if micro < 0 {
            return Err(TollgateError::BadRequest("opening balance must not be negative".into()));
        }
        self.accounts.insert(account.to_string(), Entry { micro, admin });
        Ok(())
    }

    /// Make every subsequent `credit` fail, simulating a store outage
    pub fn fail_credits(&self, fail: bool) {
        self.fail_credits.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent debit fail
    pub fn fail_debits(&self, fail: bool) {
        self.fail_debits.store(fail, Ordering::SeqCst);
    }

    fn unavailable() -> TollgateError {
        TollgateError::Database("credit store unavailable".into())
    }
}

#[async_trait]
impl CreditStore for InMemoryCreditStore {
    async fn balance(&self, account: &str) -> Result<Decimal> {
        self.accounts
            .get(account)
            .map(|entry| from_micro(entry.micro))
            .ok_or_else(|| TollgateError::AccountNotFound(account.to_string()))
    }

    async fn is_admin(&self, account: &str) -> Result<bool> {
        self.accounts
            .get(account)
            .map(|entry| entry.admin)
            .ok_or_else(|| TollgateError::AccountNotFound(account.to_string()))
    }

    async fn debit_if_covered(&self, account: &str, amount: Decimal) -> Result<Option<Decimal>> {
        if self.fail_debits.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        let micro = to_micro(amount)?;
        // get_mut holds the shard lock, so check and decrement are one step
        let mut entry = self
            .accounts
            .get_mut(account)
            .ok_or_else(|| TollgateError::AccountNotFound(account.to_string()))?;
        if entry.micro < micro {
            return Ok(None);
        }
        entry.micro -= micro;
        Ok(Some(from_micro(entry.micro)))
    }

    async fn credit(&self, account: &str, amount: Decimal) -> Result<Decimal> {
        if self.fail_credits.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        let micro = to_micro(amount)?;
        let mut entry = self
            .accounts
            .get_mut(account)
            .ok_or_else(|| TollgateError::AccountNotFound(account.to_string()))?;
        entry.micro = entry
            .micro
            .checked_add(micro)
            .ok_or_else(|| TollgateError::BadRequest("balance overflow".into()))?;
        Ok(from_micro(entry.micro))
    }
}
