//! Payment records
//!
//! A payment is created with `tx_hash` set to the sentinel
//! `"<account>-<number>"`. Submission replaces the sentinel with the payer's
//! reference exactly once, via a single conditional update. A second
//! submission finds no sentinel and is rejected, so it can neither overwrite
//! the first reference nor trigger a second confirmation.

use async_trait::async_trait;
use bson::doc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::db::schemas::{
    PaymentCounterDoc, PaymentDoc, PAYMENT_COLLECTION, PAYMENT_COUNTER_COLLECTION,
};
use crate::db::{MongoClient, MongoCollection};
use crate::queue::JobClass;
use crate::types::{Result, TollgateError};

/// Ways to fund credits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PaymentRail {
    /// Signed message redeemed on-chain by the payer
    TokenContract,
    /// Deposit to an address from our coin wallet
    CoinWallet,
    /// Deposit to an address issued by a forwarding service
    Forwarding,
    /// Synchronous card charge
    Card,
}

impl PaymentRail {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokenContract => "token-contract",
            Self::CoinWallet => "coin-wallet",
            Self::Forwarding => "forwarding",
            Self::Card => "card",
        }
    }

    /// Queue that receives this rail's confirmation jobs
    pub fn confirmation_class(&self) -> Option<JobClass> {
        match self {
            Self::TokenContract => Some(JobClass::TokenPaymentConfirmation),
            Self::CoinWallet => Some(JobClass::WalletPaymentConfirmation),
            Self::Forwarding => Some(JobClass::ForwardPaymentConfirmation),
            Self::Card => None,
        }
    }
}

impl fmt::Display for PaymentRail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentRail {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "token-contract" => Ok(Self::TokenContract),
            "coin-wallet" => Ok(Self::CoinWallet),
            "forwarding" => Ok(Self::Forwarding),
            "card" => Ok(Self::Card),
            other => Err(TollgateError::InvalidPaymentMethod(format!("unknown rail '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentState {
    Created,
    Submitted,
    Confirmed,
}

/// Placeholder meaning "not submitted yet"
pub fn sentinel(account: &str, number: u64) -> String {
    format!("{}-{}", account, number)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Payment {
    pub account: String,
    pub number: u64,
    pub rail: PaymentRail,
    /// Asset the charge is denominated in
    pub asset: String,
    pub credit_value: Decimal,
    pub charge_amount: Decimal,
    pub deposit_address: String,
    pub tx_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_id: Option<String>,
    pub confirmed: bool,
}

impl Payment {
    pub fn state(&self) -> PaymentState {
        if self.confirmed {
            PaymentState::Confirmed
        } else if self.tx_hash == sentinel(&self.account, self.number) {
            PaymentState::Created
        } else {
            PaymentState::Submitted
        }
    }

    fn to_doc(&self) -> Result<PaymentDoc> {
        Ok(PaymentDoc {
            _id: None,
            metadata: Default::default(),
            user_name: self.account.clone(),
            number: to_i64(self.number)?,
            rail: self.rail.as_str().to_string(),
            asset: self.asset.clone(),
            credit_value: self.credit_value.to_string(),
            charge_amount: self.charge_amount.to_string(),
            deposit_address: self.deposit_address.clone(),
            tx_hash: self.tx_hash.clone(),
            forward_id: self.forward_id.clone(),
            confirmed: self.confirmed,
        })
    }

    fn from_doc(doc: PaymentDoc) -> Result<Self> {
        let decimal = |field: &str, value: &str| {
            Decimal::from_str(value)
                .map_err(|e| TollgateError::Database(format!("corrupt {} '{}': {}", field, value, e)))
        };
        Ok(Self {
            number: u64::try_from(doc.number)
                .map_err(|_| TollgateError::Database(format!("corrupt payment number {}", doc.number)))?,
            rail: doc.rail.parse()?,
            credit_value: decimal("credit_value", &doc.credit_value)?,
            charge_amount: decimal("charge_amount", &doc.charge_amount)?,
            account: doc.user_name,
            asset: doc.asset,
            deposit_address: doc.deposit_address,
            tx_hash: doc.tx_hash,
            forward_id: doc.forward_id,
            confirmed: doc.confirmed,
        })
    }
}

fn to_i64(number: u64) -> Result<i64> {
    i64::try_from(number).map_err(|_| TollgateError::BadRequest(format!("payment number {} out of range", number)))
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Atomically allocate the account's next payment number (starting at 1)
    async fn next_number(&self, account: &str) -> Result<u64>;

    /// Hand back `number` if it is still the latest one allocated.
    ///
    /// Returns `false` when another allocation has already moved past it.
    async fn release_number(&self, account: &str, number: u64) -> Result<bool>;

    async fn insert(&self, payment: &Payment) -> Result<()>;

    async fn find(&self, account: &str, number: u64) -> Result<Option<Payment>>;

    /// Replace the sentinel with `reference` if, and only if, the payment is
    /// on `rail`, still carries its sentinel, and is not confirmed.
    ///
    /// Returns the updated payment, or `None` when the guard did not match.
    async fn mark_submitted(
        &self,
        account: &str,
        number: u64,
        rail: PaymentRail,
        reference: &str,
    ) -> Result<Option<Payment>>;

    /// Set by the confirmation consumer once funds have settled
    async fn mark_confirmed(&self, account: &str, number: u64) -> Result<bool>;
}

pub struct MongoPaymentStore {
    payments: MongoCollection<PaymentDoc>,
    counters: MongoCollection<PaymentCounterDoc>,
}

impl MongoPaymentStore {
    pub async fn new(mongo: &MongoClient) -> Result<Self> {
        Ok(Self {
            payments: mongo.collection(PAYMENT_COLLECTION).await?,
            counters: mongo.collection(PAYMENT_COUNTER_COLLECTION).await?,
        })
    }
}

#[async_trait]
impl PaymentStore for MongoPaymentStore {
    async fn next_number(&self, account: &str) -> Result<u64> {
        let counter = self
            .counters
            .find_one_and_update(
                doc! { "user_name": account },
                doc! { "$inc": { "last_number": 1_i64 } },
                true,
            )
            .await?
            .ok_or_else(|| TollgateError::Database("payment counter upsert returned nothing".into()))?;
        u64::try_from(counter.last_number)
            .map_err(|_| TollgateError::Database(format!("corrupt counter for {}", account)))
    }

    async fn release_number(&self, account: &str, number: u64) -> Result<bool> {
        let result = self
            .counters
            .update_one(
                doc! { "user_name": account, "last_number": to_i64(number)? },
                doc! { "$inc": { "last_number": -1_i64 } },
            )
            .await?;
        Ok(result.modified_count == 1)
    }

    async fn insert(&self, payment: &Payment) -> Result<()> {
        self.payments.insert_one(payment.to_doc()?).await?;
        Ok(())
    }

    async fn find(&self, account: &str, number: u64) -> Result<Option<Payment>> {
        self.payments
            .find_one(doc! { "user_name": account, "number": to_i64(number)? })
            .await?
            .map(Payment::from_doc)
            .transpose()
    }

    async fn mark_submitted(
        &self,
        account: &str,
        number: u64,
        rail: PaymentRail,
        reference: &str,
    ) -> Result<Option<Payment>> {
        self.payments
            .find_one_and_update(
                doc! {
                    "user_name": account,
                    "number": to_i64(number)?,
                    "rail": rail.as_str(),
                    "tx_hash": sentinel(account, number),
                    "confirmed": false,
                },
                doc! { "$set": { "tx_hash": reference } },
                false,
            )
            .await?
            .map(Payment::from_doc)
            .transpose()
    }

    async fn mark_confirmed(&self, account: &str, number: u64) -> Result<bool> {
        let result = self
            .payments
            .update_one(
                doc! {
                    "user_name": account,
                    "number": to_i64(number)?,
                    "tx_hash": { "$ne": sentinel(account, number) },
                },
                doc! { "$set": { "confirmed": true } },
            )
            .await?;
        Ok(result.modified_count == 1)
    }
}

/// In-memory payments for dev mode and tests
#[derive(Default)]
pub struct InMemoryPaymentStore {
    payments: DashMap<(String, u64), Payment>,
    counters: DashMap<String, u64>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn next_number(&self, account: &str) -> Result<u64> {
        let mut counter = self.counters.entry(account.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn release_number(&self, account: &str, number: u64) -> Result<bool> {
        match self.counters.get_mut(account) {
            Some(mut counter) if *counter == number => {
                *counter -= 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert(&self, payment: &Payment) -> Result<()> {
        let key = (payment.account.clone(), payment.number);
        if self.payments.contains_key(&key) {
            return Err(TollgateError::Database(format!(
                "payment {} already exists for {}",
                payment.number, payment.account
            )));
        }
        self.payments.insert(key, payment.clone());
        Ok(())
    }

    async fn find(&self, account: &str, number: u64) -> Result<Option<Payment>> {
        Ok(self
            .payments
            .get(&(account.to_string(), number))
            .map(|p| p.clone()))
    }

    async fn mark_submitted(
        &self,
        account: &str,
        number: u64,
        rail: PaymentRail,
        reference: &str,
    ) -> Result<Option<Payment>> {
        let Some(mut payment) = self.payments.get_mut(&(account.to_string(), number)) else {
            return Ok(None);
        };
        if payment.rail != rail || payment.confirmed || payment.tx_hash != sentinel(account, number) {
            return Ok(None);
        }
        payment.tx_hash = reference.to_string();
        Ok(Some(payment.clone()))
    }

    async fn mark_confirmed(&self, account: &str, number: u64) -> Result<bool> {
        let Some(mut payment) = self.payments.get_mut(&(account.to_string(), number)) else {
            return Ok(false);
        };
        if payment.state() != PaymentState::Submitted {
            return Ok(false);
        }
        payment.confirmed = true;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created(number: u64) -> Payment {
        Payment {
            account: "alice".into(),
            number,
            rail: PaymentRail::TokenContract,
            asset: "token".into(),
            credit_value: Decimal::from(10),
            charge_amount: Decimal::from(80),
            deposit_address: sentinel("alice", number),
            tx_hash: sentinel("alice", number),
            forward_id: None,
            confirmed: false,
        }
    }

    #[test]
    fn test_state_follows_tx_hash() {
        let mut payment = created(5);
        assert_eq!(payment.state(), PaymentState::Created);
        payment.tx_hash = "0xabc".into();
        assert_eq!(payment.state(), PaymentState::Submitted);
        payment.confirmed = true;
        assert_eq!(payment.state(), PaymentState::Confirmed);
    }

    #[test]
    fn test_rail_names() {
        for rail in [
            PaymentRail::TokenContract,
            PaymentRail::CoinWallet,
            PaymentRail::Forwarding,
            PaymentRail::Card,
        ] {
            assert_eq!(rail.as_str().parse::<PaymentRail>().unwrap(), rail);
        }
        assert_eq!(
            "coin-a".parse::<PaymentRail>().unwrap_err().code(),
            "invalid-payment-method"
        );
    }

    #[test]
    fn test_doc_conversion_keeps_decimals() {
        let mut payment = created(3);
        payment.charge_amount = Decimal::new(12345678, 8);
        let back = Payment::from_doc(payment.to_doc().unwrap()).unwrap();
        assert_eq!(back, payment);
    }

    #[tokio::test]
    async fn test_numbers_start_at_one() {
        let store = InMemoryPaymentStore::new();
        assert_eq!(store.next_number("alice").await.unwrap(), 1);
        assert_eq!(store.next_number("alice").await.unwrap(), 2);
        assert_eq!(store.next_number("bob").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_release_only_latest_number() {
        let store = InMemoryPaymentStore::new();
        let first = store.next_number("alice").await.unwrap();
        let second = store.next_number("alice").await.unwrap();

        assert!(!store.release_number("alice", first).await.unwrap());
        assert!(store.release_number("alice", second).await.unwrap());
        assert!(!store.release_number("bob", 1).await.unwrap());
        assert_eq!(store.next_number("alice").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_submission_guard() {
        let store = InMemoryPaymentStore::new();
        store.insert(&created(5)).await.unwrap();

        let wrong_rail = store
            .mark_submitted("alice", 5, PaymentRail::CoinWallet, "0xabc")
            .await
            .unwrap();
        assert!(wrong_rail.is_none());

        let first = store
            .mark_submitted("alice", 5, PaymentRail::TokenContract, "0xabc")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.tx_hash, "0xabc");

        let second = store
            .mark_submitted("alice", 5, PaymentRail::TokenContract, "0xdef")
            .await
            .unwrap();
        assert!(second.is_none());
        assert_eq!(store.find("alice", 5).await.unwrap().unwrap().tx_hash, "0xabc");
    }

    #[tokio::test]
    async fn test_only_submitted_payments_confirm() {
        let store = InMemoryPaymentStore::new();
        store.insert(&created(1)).await.unwrap();
        assert!(!store.mark_confirmed("alice", 1).await.unwrap());
        store
            .mark_submitted("alice", 1, PaymentRail::TokenContract, "0x1")
            .await
            .unwrap();
        assert!(store.mark_confirmed("alice", 1).await.unwrap());
        assert!(store
            .mark_submitted("alice", 1, PaymentRail::TokenContract, "0x2")
            .await
            .unwrap()
            .is_none());
    }
}
