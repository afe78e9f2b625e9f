//! Settlement rail clients
//!
//! Thin reqwest clients for the coin wallet service, the payment forwarder,
//! and the card processor, plus dev implementations that settle nothing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::types::{Result, TollgateError};

/// Forwarding address issued for one payment
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ForwardDetails {
    #[serde(rename = "payment_address")]
    pub payment_address: String,
    #[serde(rename = "paymentforward_id")]
    pub payment_forward_id: String,
    /// Forwarder's fee in the coin's smallest unit (1e-8)
    #[serde(rename = "mining_fee_duffs", default)]
    pub mining_fee_duffs: u64,
}

/// Card charge accepted by the processor
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CardCharge {
    pub id: String,
    pub paid: bool,
}

#[async_trait]
pub trait WalletService: Send + Sync {
    /// A fresh deposit address, registered under a caller-chosen unique `label`
    async fn new_deposit_address(&self, account: &str, label: &str) -> Result<String>;
}

#[async_trait]
pub trait PaymentForwarder: Send + Sync {
    async fn create_forward(&self) -> Result<ForwardDetails>;
}

#[async_trait]
pub trait CardProcessor: Send + Sync {
    async fn charge(&self, account: &str, amount_cents: u64, card_token: &str) -> Result<CardCharge>;
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(20))
        .build()
        .map_err(|e| TollgateError::Config(format!("Failed to build rail client: {}", e)))
}

async fn read_json<T: serde::de::DeserializeOwned>(rail: &str, response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TollgateError::Rail(format!("{} returned {}: {}", rail, status, body)));
    }
    response
        .json()
        .await
        .map_err(|e| TollgateError::Rail(format!("{} sent an unreadable response: {}", rail, e)))
}

/// Wallet daemon HTTP API (`POST /v1/addresses`)
pub struct HttpWalletService {
    http: reqwest::Client,
    base_url: String,
}

impl HttpWalletService {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: http_client()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Serialize)]
struct AddressRequest<'a> {
    label: &'a str,
}

#[derive(Deserialize)]
struct AddressResponse {
    address: String,
}

#[async_trait]
impl WalletService for HttpWalletService {
    async fn new_deposit_address(&self, account: &str, label: &str) -> Result<String> {
        let label = format!("{}-{}", account, label);
        let response = self
            .http
            .post(format!("{}/v1/addresses", self.base_url))
            .json(&AddressRequest { label: &label })
            .send()
            .await
            .map_err(|e| TollgateError::Rail(format!("wallet service unreachable: {}", e)))?;
        let body: AddressResponse = read_json("wallet service", response).await?;
        Ok(body.address)
    }
}

/// Payment forwarding API (`POST /v1/paymentforward`)
pub struct HttpPaymentForwarder {
    http: reqwest::Client,
    base_url: String,
    token: String,
    destination: String,
}

impl HttpPaymentForwarder {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, destination: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: http_client()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            destination: destination.into(),
        })
    }
}

#[derive(Serialize)]
struct ForwardRequest<'a> {
    destination_address: &'a str,
    token: &'a str,
}

#[async_trait]
impl PaymentForwarder for HttpPaymentForwarder {
    async fn create_forward(&self) -> Result<ForwardDetails> {
        let response = self
            .http
            .post(format!("{}/v1/paymentforward", self.base_url))
            .json(&ForwardRequest {
                destination_address: &self.destination,
                token: &self.token,
            })
            .send()
            .await
            .map_err(|e| TollgateError::Rail(format!("forwarder unreachable: {}", e)))?;
        read_json("forwarder", response).await
    }
}

/// Card processor charges API (`POST /v1/charges`, form encoded)
pub struct HttpCardProcessor {
    http: reqwest::Client,
    base_url: String,
    secret_key: String,
}

impl HttpCardProcessor {
    pub fn new(base_url: impl Into<String>, secret_key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: http_client()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
        })
    }
}

#[async_trait]
impl CardProcessor for HttpCardProcessor {
    async fn charge(&self, account: &str, amount_cents: u64, card_token: &str) -> Result<CardCharge> {
        let amount = amount_cents.to_string();
        let description = format!("credit purchase for {}", account);
        let response = self
            .http
            .post(format!("{}/v1/charges", self.base_url))
            .bearer_auth(&self.secret_key)
            .form(&[
                ("amount", amount.as_str()),
                ("currency", "usd"),
                ("source", card_token),
                ("description", description.as_str()),
            ])
            .send()
            .await
            .map_err(|e| TollgateError::Rail(format!("card processor unreachable: {}", e)))?;

        // 402 is the processor's "card declined"
        if response.status() == reqwest::StatusCode::PAYMENT_REQUIRED {
            let body = response.text().await.unwrap_or_default();
            return Err(TollgateError::InvalidPaymentMethod(format!("card declined: {}", body)));
        }

        let charge: CardCharge = read_json("card processor", response).await?;
        if !charge.paid {
            return Err(TollgateError::InvalidPaymentMethod(format!("charge {} was not paid", charge.id)));
        }
        Ok(charge)
    }
}

/// Hands out `dev-<account>-<label>` addresses
#[derive(Default)]
pub struct DevWallet;

#[async_trait]
impl WalletService for DevWallet {
    async fn new_deposit_address(&self, account: &str, label: &str) -> Result<String> {
        Ok(format!("dev-{}-{}", account, label))
    }
}

/// Issues sequential forward ids with a fixed fee
#[derive(Default)]
pub struct DevForwarder {
    next: AtomicU64,
    pub fee_duffs: u64,
}

impl DevForwarder {
    pub fn with_fee(fee_duffs: u64) -> Self {
        Self {
            next: AtomicU64::new(0),
            fee_duffs,
        }
    }
}

#[async_trait]
impl PaymentForwarder for DevForwarder {
    async fn create_forward(&self) -> Result<ForwardDetails> {
        let id = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ForwardDetails {
            payment_address: format!("dev-forward-address-{}", id),
            payment_forward_id: format!("dev-forward-{}", id),
            mining_fee_duffs: self.fee_duffs,
        })
    }
}

/// Approves every charge
#[derive(Default)]
pub struct DevCardProcessor {
    next: AtomicU64,
}

#[async_trait]
impl CardProcessor for DevCardProcessor {
    async fn charge(&self, _account: &str, _amount_cents: u64, _card_token: &str) -> Result<CardCharge> {
        let id = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CardCharge {
            id: format!("dev-charge-{}", id),
            paid: true,
        })
    }
}
