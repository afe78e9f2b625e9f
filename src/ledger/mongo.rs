//! MongoDB-backed balance store

use async_trait::async_trait;
use bson::doc;
use rust_decimal::Decimal;

use crate::db::schemas::{AccountDoc, ACCOUNT_COLLECTION};
use crate::db::{MongoClient, MongoCollection};
use crate::ledger::store::{from_micro, to_micro, CreditStore};
use crate::types::{Result, TollgateError};

pub struct MongoCreditStore {
    accounts: MongoCollection<AccountDoc>,
}

impl MongoCreditStore {
    pub async fn new(mongo: &MongoClient) -> Result<Self> {
        Ok(Self {
            accounts: mongo.collection(ACCOUNT_COLLECTION).await?,
        })
    }

    async fn load(&self, account: &str) -> Result<AccountDoc> {
        self.accounts
            .find_one(doc! { "user_name": account })
            .await?
            .ok_or_else(|| TollgateError::AccountNotFound(account.to_string()))
    }
}

#[async_trait]
impl CreditStore for MongoCreditStore {
    async fn balance(&self, account: &str) -> Result<Decimal> {
        Ok(from_micro(self.load(account).await?.credits_micro))
    }

    async fn is_admin(&self, account: &str) -> Result<bool> {
        Ok(self.load(account).await?.admin_access)
    }

    async fn debit_if_covered(&self, account: &str, amount: Decimal) -> Result<Option<Decimal>> {
        let micro = to_micro(amount)?;
        let updated = self
            .accounts
            .find_one_and_update(
                doc! { "user_name": account, "credits_micro": { "$gte": micro } },
                doc! { "$inc": { "credits_micro": -micro } },
                false,
            )
            .await?;

        match updated {
            Some(doc) => Ok(Some(from_micro(doc.credits_micro))),
            None => {
                // distinguish "too poor" from "no such account"
                self.load(account).await?;
                Ok(None)
            }
        }
    }

    async fn credit(&self, account: &str, amount: Decimal) -> Result<Decimal> {
        let micro = to_micro(amount)?;
        self.accounts
            .find_one_and_update(
                doc! { "user_name": account },
                doc! { "$inc": { "credits_micro": micro } },
                false,
            )
            .await?
            .map(|doc| from_micro(doc.credits_micro))
            .ok_or_else(|| TollgateError::AccountNotFound(account.to_string()))
    }
}
