//! Payment endpoints

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::payments::{Address, PaymentMethod, PaymentRail};
use crate::routes::{ok, parse_body, JsonResponse};
use crate::server::AppState;
use crate::types::{Result, TollgateError};

#[derive(Debug, Deserialize)]
pub struct TokenPaymentBody {
    /// 0 = platform token, 1 = native coin
    pub payment_type: u8,
    pub sender_address: String,
    pub credit_value: Decimal,
}

pub async fn request_token_payment(state: &AppState, account: &str, body: &[u8]) -> Result<JsonResponse> {
    let body: TokenPaymentBody = parse_body(body)?;
    let method = PaymentMethod::from_tag(body.payment_type)?;
    let sender: Address = body.sender_address.parse()?;
    let offer = state
        .payments
        .request_token_payment(account, method, &sender, body.credit_value)
        .await?;
    Ok(ok(offer))
}

#[derive(Debug, Deserialize)]
pub struct CreatePaymentBody {
    pub credit_value: Decimal,
}

pub async fn create_payment(state: &AppState, account: &str, rail: &str, body: &[u8]) -> Result<JsonResponse> {
    let rail: PaymentRail = rail.parse()?;
    let body: CreatePaymentBody = parse_body(body)?;
    let offer = match rail {
        PaymentRail::CoinWallet => state.payments.create_wallet_payment(account, body.credit_value).await?,
        PaymentRail::Forwarding => state.payments.create_forward_payment(account, body.credit_value).await?,
        PaymentRail::TokenContract | PaymentRail::Card => {
            return Err(TollgateError::InvalidPaymentMethod(format!(
                "{} payments are not created here",
                rail
            )))
        }
    };
    Ok(ok(offer))
}

#[derive(Debug, Deserialize)]
pub struct ConfirmBody {
    pub payment_number: u64,
    pub tx_hash: String,
    #[serde(default)]
    pub rail: Option<String>,
}

pub async fn confirm(state: &AppState, account: &str, body: &[u8]) -> Result<JsonResponse> {
    let body: ConfirmBody = parse_body(body)?;
    let rail = match body.rail.as_deref() {
        Some(rail) => rail.parse()?,
        None => PaymentRail::TokenContract,
    };
    let payment = state
        .payments
        .submit_payment(account, rail, body.payment_number, &body.tx_hash)
        .await?;
    Ok(ok(payment))
}

#[derive(Debug, Deserialize)]
pub struct CardChargeBody {
    pub amount_cents: u64,
    pub card_token: String,
}

pub async fn charge_card(state: &AppState, account: &str, body: &[u8]) -> Result<JsonResponse> {
    let body: CardChargeBody = parse_body(body)?;
    let receipt = state
        .payments
        .charge_card(account, body.amount_cents, &body.card_token)
        .await?;
    Ok(ok(receipt))
}

#[derive(Debug, Serialize)]
struct DepositAddress {
    rail: PaymentRail,
    address: String,
}

pub fn deposit_address(state: &AppState, rail: &str) -> Result<JsonResponse> {
    let rail: PaymentRail = rail.parse()?;
    let address = state.payments.deposit_address(rail)?;
    Ok(ok(DepositAddress { rail, address }))
}

pub async fn status(state: &AppState, account: &str, number: &str) -> Result<JsonResponse> {
    let number: u64 = number
        .parse()
        .map_err(|_| TollgateError::BadRequest(format!("invalid payment number '{}'", number)))?;
    let payment = state.payments.payment(account, number).await?;
    Ok(ok(serde_json::json!({
        "payment": payment,
        "state": payment.state(),
    })))
}
