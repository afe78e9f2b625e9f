//! Payment lifecycle
//!
//! Creates numbered payments on each rail, hands back what the payer needs to
//! settle them, and guards the one-time `Created -> Submitted` transition.
//!
//! Numbers are allocated only after every external call (rates, wallet,
//! forwarder) has succeeded. If the record built for a number cannot be
//! written, the number is handed back so the sequence stays contiguous.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::PaymentArgs;
use crate::ledger::CreditLedger;
use crate::logging::{ReconcileEvent, ReconcileKind};
use crate::payments::rails::{CardProcessor, PaymentForwarder, WalletService};
use crate::payments::rates::RateOracle;
use crate::payments::signer::{to_base_units, Address, FormattedSignature, PaymentMethod, PaymentSigner};
use crate::payments::store::{sentinel, Payment, PaymentRail, PaymentState, PaymentStore};
use crate::queue::messages::{EmailJob, ForwardPaymentConfirmation, PaymentConfirmation};
use crate::queue::{JobClass, QueueManager};
use crate::types::{Result, TollgateError};

/// Decimals of the token and of the chain's native coin
pub const TOKEN_DECIMALS: u32 = 18;

/// Decimals of the wallet and forwarding coins
pub const COIN_DECIMALS: u32 = 8;

pub const FORWARD_FEE_NOTICE: &str =
    "please send exactly the charge amount; the forwarding fee is already included";

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub ether_slug: String,
    pub wallet_coin: String,
    pub forward_coin: String,
    pub token_deposit_address: Option<String>,
    pub wallet_deposit_address: Option<String>,
    pub forward_destination: Option<String>,
}

impl LifecycleConfig {
    pub fn from_args(args: &PaymentArgs) -> Self {
        Self {
            ether_slug: args.ether_slug.clone(),
            wallet_coin: args.wallet_coin.clone(),
            forward_coin: args.forward_coin.clone(),
            token_deposit_address: args.token_deposit_address.clone(),
            wallet_deposit_address: args.wallet_deposit_address.clone(),
            forward_destination: args.forward_destination.clone(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            ether_slug: "ethereum".into(),
            wallet_coin: "bitcoin-cash".into(),
            forward_coin: "dash".into(),
            token_deposit_address: None,
            wallet_deposit_address: None,
            forward_destination: None,
        }
    }
}

/// Rail clients; a missing client means the rail is not offered
#[derive(Clone, Default)]
pub struct Rails {
    pub wallet: Option<Arc<dyn WalletService>>,
    pub forwarder: Option<Arc<dyn PaymentForwarder>>,
    pub card: Option<Arc<dyn CardProcessor>>,
}

/// What the payer hands to the payment contract
#[derive(Debug, Clone, Serialize)]
pub struct TokenPaymentOffer {
    pub payment_number: u64,
    pub method: u8,
    /// Charge in base units, exactly as signed
    pub charge_amount: String,
    pub prefixed: bool,
    pub signature: FormattedSignature,
}

#[derive(Debug, Clone, Serialize)]
pub struct DepositOffer {
    pub payment_number: u64,
    pub deposit_address: String,
    pub charge_amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_forward_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CardReceipt {
    pub charge_id: String,
    pub credits_granted: Decimal,
    pub balance: Decimal,
}

pub struct PaymentLifecycle {
    ledger: CreditLedger,
    queues: Arc<QueueManager>,
    store: Arc<dyn PaymentStore>,
    oracle: Arc<RateOracle>,
    signer: Arc<PaymentSigner>,
    rails: Rails,
    config: LifecycleConfig,
}

impl PaymentLifecycle {
    pub fn new(
        ledger: CreditLedger,
        queues: Arc<QueueManager>,
        store: Arc<dyn PaymentStore>,
        oracle: Arc<RateOracle>,
        signer: Arc<PaymentSigner>,
        rails: Rails,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            ledger,
            queues,
            store,
            oracle,
            signer,
            rails,
            config,
        }
    }

    pub fn signer_address(&self) -> Address {
        self.signer.address()
    }

    pub async fn payment(&self, account: &str, number: u64) -> Result<Payment> {
        self.store
            .find(account, number)
            .await?
            .ok_or_else(|| TollgateError::PaymentNotFound(format!("payment {} for {}", number, account)))
    }

    /// Token-contract rail: sign a payment message the payer redeems on-chain
    pub async fn request_token_payment(
        &self,
        account: &str,
        method: PaymentMethod,
        sender: &Address,
        credit_value: Decimal,
    ) -> Result<TokenPaymentOffer> {
        check_credit_value(credit_value)?;
        let usd_price = match method {
            PaymentMethod::Token => self.oracle.token_usd_price(),
            PaymentMethod::Ether => self.oracle.usd_price(&self.config.ether_slug).await?,
        };
        let charge = charge_for(credit_value, usd_price)?
            .round_dp_with_strategy(TOKEN_DECIMALS, RoundingStrategy::ToZero);
        let base_units = to_base_units(charge, TOKEN_DECIMALS)?;

        let asset = match method {
            PaymentMethod::Token => "token".to_string(),
            PaymentMethod::Ether => self.config.ether_slug.clone(),
        };
        let (number, signed) = self
            .record(account, |number| {
                let signed = self.signer.sign(sender, number, method, base_units, true)?;
                let marker = sentinel(account, number);
                let payment = Payment {
                    account: account.to_string(),
                    number,
                    rail: PaymentRail::TokenContract,
                    asset,
                    credit_value,
                    charge_amount: charge,
                    deposit_address: marker.clone(),
                    tx_hash: marker,
                    forward_id: None,
                    confirmed: false,
                };
                Ok((payment, signed))
            })
            .await?;

        info!(
            account = %account,
            payment_number = number,
            method = ?method,
            charge = %charge,
            "token payment requested"
        );

        Ok(TokenPaymentOffer {
            payment_number: number,
            method: method.tag(),
            charge_amount: base_units.to_string(),
            prefixed: signed.prefixed,
            signature: signed.formatted(),
        })
    }

    /// Coin-wallet rail: a fresh deposit address per payment
    pub async fn create_wallet_payment(&self, account: &str, credit_value: Decimal) -> Result<DepositOffer> {
        check_credit_value(credit_value)?;
        let wallet = self
            .rails
            .wallet
            .clone()
            .ok_or_else(|| TollgateError::InvalidPaymentMethod("coin-wallet rail is not enabled".into()))?;
        let usd_price = self.oracle.usd_price(&self.config.wallet_coin).await?;
        let charge = coin_charge(credit_value, usd_price)?;

        let label = Uuid::new_v4().to_string();
        let address = wallet.new_deposit_address(account, &label).await?;

        let (number, ()) = self
            .record(account, |number| {
                let payment = Payment {
                    account: account.to_string(),
                    number,
                    rail: PaymentRail::CoinWallet,
                    asset: self.config.wallet_coin.clone(),
                    credit_value,
                    charge_amount: charge,
                    deposit_address: address.clone(),
                    tx_hash: sentinel(account, number),
                    forward_id: None,
                    confirmed: false,
                };
                Ok((payment, ()))
            })
            .await?;

        info!(account = %account, payment_number = number, charge = %charge, "wallet payment created");

        Ok(DepositOffer {
            payment_number: number,
            deposit_address: address,
            charge_amount: charge,
            payment_forward_id: None,
            status: None,
        })
    }

    /// Forwarding rail. The forwarder reports the deposit itself, so the
    /// confirmation job is queued right away.
    pub async fn create_forward_payment(&self, account: &str, credit_value: Decimal) -> Result<DepositOffer> {
        check_credit_value(credit_value)?;
        let forwarder = self
            .rails
            .forwarder
            .clone()
            .ok_or_else(|| TollgateError::InvalidPaymentMethod("forwarding rail is not enabled".into()))?;
        let usd_price = self.oracle.usd_price(&self.config.forward_coin).await?;
        let forward = forwarder.create_forward().await?;

        let fee_units = i64::try_from(forward.mining_fee_duffs)
            .map_err(|_| TollgateError::Rail(format!("forwarding fee {} out of range", forward.mining_fee_duffs)))?;
        let charge = (coin_charge(credit_value, usd_price)? + Decimal::new(fee_units, COIN_DECIMALS)).normalize();

        let (number, ()) = self
            .record(account, |number| {
                let payment = Payment {
                    account: account.to_string(),
                    number,
                    rail: PaymentRail::Forwarding,
                    asset: self.config.forward_coin.clone(),
                    credit_value,
                    charge_amount: charge,
                    deposit_address: forward.payment_address.clone(),
                    tx_hash: sentinel(account, number),
                    forward_id: Some(forward.payment_forward_id.clone()),
                    confirmed: false,
                };
                Ok((payment, ()))
            })
            .await?;

        let job = ForwardPaymentConfirmation {
            user_name: account.to_string(),
            payment_forward_id: forward.payment_forward_id.clone(),
            payment_number: number,
        };
        if let Err(e) = self.queues.publish(JobClass::ForwardPaymentConfirmation, &job).await {
            ReconcileEvent::new(ReconcileKind::ConfirmationUnpublished, account, &e)
                .with_payment_number(number)
                .with_operation(JobClass::ForwardPaymentConfirmation.as_str())
                .emit();
            return Err(e);
        }

        info!(
            account = %account,
            payment_number = number,
            forward_id = %forward.payment_forward_id,
            charge = %charge,
            "forward payment created"
        );

        Ok(DepositOffer {
            payment_number: number,
            deposit_address: forward.payment_address,
            charge_amount: charge,
            payment_forward_id: Some(forward.payment_forward_id),
            status: Some(FORWARD_FEE_NOTICE),
        })
    }

    /// Record the payer's transaction reference and queue confirmation.
    ///
    /// Succeeds once per payment. Later calls fail with
    /// `payment-already-processed` and leave the first reference in place.
    pub async fn submit_payment(
        &self,
        account: &str,
        rail: PaymentRail,
        number: u64,
        reference: &str,
    ) -> Result<Payment> {
        let class = match rail {
            PaymentRail::TokenContract | PaymentRail::CoinWallet => rail.confirmation_class(),
            PaymentRail::Forwarding | PaymentRail::Card => None,
        }
        .ok_or_else(|| TollgateError::InvalidPaymentMethod(format!("{} payments are not submitted manually", rail)))?;

        let reference = reference.trim();
        if reference.is_empty() {
            return Err(TollgateError::BadRequest("tx_hash must not be empty".into()));
        }
        if reference == sentinel(account, number) {
            return Err(TollgateError::BadRequest("tx_hash is not a transaction reference".into()));
        }

        let existing = self.payment(account, number).await?;
        if existing.rail != rail {
            return Err(TollgateError::InvalidPaymentMethod(format!(
                "payment {} is a {} payment, not {}",
                number, existing.rail, rail
            )));
        }
        if existing.state() != PaymentState::Created {
            return Err(TollgateError::PaymentAlreadyProcessed(format!("payment {}", number)));
        }

        let submitted = self
            .store
            .mark_submitted(account, number, rail, reference)
            .await?
            .ok_or_else(|| TollgateError::PaymentAlreadyProcessed(format!("payment {}", number)))?;

        let job = PaymentConfirmation {
            user_name: account.to_string(),
            payment_number: number,
        };
        if let Err(e) = self.queues.publish(class, &job).await {
            ReconcileEvent::new(ReconcileKind::ConfirmationUnpublished, account, &e)
                .with_payment_number(number)
                .with_operation(class.as_str())
                .emit();
            return Err(e);
        }

        info!(account = %account, payment_number = number, rail = %rail, "payment submitted");
        Ok(submitted)
    }

    /// Card rail: charge synchronously and grant `cents / 100` credits
    pub async fn charge_card(&self, account: &str, amount_cents: u64, card_token: &str) -> Result<CardReceipt> {
        let card = self
            .rails
            .card
            .clone()
            .ok_or_else(|| TollgateError::InvalidPaymentMethod("card rail is not enabled".into()))?;
        if amount_cents == 0 {
            return Err(TollgateError::BadRequest("amount_cents must be positive".into()));
        }
        if card_token.trim().is_empty() {
            return Err(TollgateError::BadRequest("card_token must not be empty".into()));
        }
        let cents = i64::try_from(amount_cents)
            .map_err(|_| TollgateError::BadRequest(format!("amount_cents {} out of range", amount_cents)))?;
        let credits = Decimal::new(cents, 2);

        // Fails fast on unknown accounts before the card is charged
        self.ledger.balance(account).await?;

        let charge = card.charge(account, amount_cents, card_token).await?;
        let balance = match self.ledger.grant(account, credits).await {
            Ok(balance) => balance,
            Err(e) => {
                ReconcileEvent::new(ReconcileKind::GrantFailed, account, &e)
                    .with_amount(credits)
                    .with_operation(&format!("card charge {}", charge.id))
                    .emit();
                return Err(e);
            }
        };

        let receipt = EmailJob {
            subject: "Payment Processed".to_string(),
            content: format!(
                "Your card payment of ${} was processed and {} credits were added to your account.",
                credits, credits
            ),
            content_type: "text/plain".to_string(),
            user_names: vec![account.to_string()],
            emails: Vec::new(),
        };
        if let Err(e) = self.queues.publish(JobClass::Email, &receipt).await {
            warn!(account = %account, error = %e, "failed to queue payment receipt");
        }

        info!(account = %account, charge_id = %charge.id, credits = %credits, "card payment granted");

        Ok(CardReceipt {
            charge_id: charge.id,
            credits_granted: credits,
            balance,
        })
    }

    /// Address payers send to on each rail
    /// Allocate the next number and persist the payment built for it.
    ///
    /// A failed build or write hands the number back unless a concurrent
    /// request has already taken the next one.
    async fn record<T>(
        &self,
        account: &str,
        build: impl FnOnce(u64) -> Result<(Payment, T)>,
    ) -> Result<(u64, T)> {
        let number = self.store.next_number(account).await?;
        let written = match build(number) {
            Ok((payment, extra)) => self.store.insert(&payment).await.map(|()| extra),
            Err(e) => Err(e),
        };

        match written {
            Ok(extra) => Ok((number, extra)),
            Err(e) => {
                match self.store.release_number(account, number).await {
                    Ok(true) => {}
                    Ok(false) => warn!(
                        account = %account,
                        payment_number = number,
                        "payment number could not be released, sequence has a gap"
                    ),
                    Err(release) => warn!(
                        account = %account,
                        payment_number = number,
                        error = %release,
                        "releasing payment number failed"
                    ),
                }
                Err(e)
            }
        }
    }

    pub fn deposit_address(&self, rail: PaymentRail) -> Result<String> {
        let configured = match rail {
            PaymentRail::TokenContract => self.config.token_deposit_address.clone(),
            PaymentRail::CoinWallet => self.config.wallet_deposit_address.clone(),
            PaymentRail::Forwarding => self.config.forward_destination.clone(),
            PaymentRail::Card => None,
        };
        configured.ok_or_else(|| TollgateError::InvalidPaymentMethod(format!("no deposit address for {}", rail)))
    }
}

fn check_credit_value(credit_value: Decimal) -> Result<()> {
    if credit_value <= Decimal::ZERO {
        return Err(TollgateError::BadRequest(format!(
            "credit_value must be positive, got {}",
            credit_value
        )));
    }
    Ok(())
}

fn charge_for(credit_value: Decimal, usd_price: Decimal) -> Result<Decimal> {
    if usd_price <= Decimal::ZERO {
        return Err(TollgateError::RateLookup(format!("unusable price {}", usd_price)));
    }
    credit_value
        .checked_div(usd_price)
        .ok_or_else(|| TollgateError::BadRequest(format!("credit_value {} out of range", credit_value)))
}

/// Coin charges round up to the coin's smallest unit
fn coin_charge(credit_value: Decimal, usd_price: Decimal) -> Result<Decimal> {
    Ok(charge_for(credit_value, usd_price)?
        .round_dp_with_strategy(COIN_DECIMALS, RoundingStrategy::AwayFromZero)
        .normalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryCreditStore;
    use crate::payments::rails::{DevCardProcessor, DevForwarder, DevWallet};
    use crate::payments::rates::StaticRates;
    use crate::payments::signer::{payment_hash, prefixed_hash};
    use crate::payments::store::InMemoryPaymentStore;
    use crate::queue::{HandleSpec, MemoryBroker};
    use std::time::Duration;

    const KEY_ONE: &str = "0x0000000000000000000000000000000000000000000000000000000000000001";

    struct Harness {
        lifecycle: Arc<PaymentLifecycle>,
        broker: MemoryBroker,
        credits: Arc<InMemoryCreditStore>,
        payments: Arc<InMemoryPaymentStore>,
        rates: Arc<StaticRates>,
    }

    async fn harness() -> Harness {
        harness_with(Rails {
            wallet: Some(Arc::new(DevWallet)),
            forwarder: Some(Arc::new(DevForwarder::with_fee(1000))),
            card: Some(Arc::new(DevCardProcessor::default())),
        })
        .await
    }

    async fn harness_with(rails: Rails) -> Harness {
        let credits = Arc::new(InMemoryCreditStore::new());
        credits.open_account("alice", Decimal::from(5), false).unwrap();
        let payments = Arc::new(InMemoryPaymentStore::new());
        let broker = MemoryBroker::new();
        let (queues, _faults) = QueueManager::start(Arc::new(broker.clone()), HandleSpec::all())
            .await
            .unwrap();
        let rates = Arc::new(
            StaticRates::new()
                .with_price("ethereum", Decimal::from(2000))
                .with_price("bitcoin-cash", Decimal::from(250))
                .with_price("dash", Decimal::from(30)),
        );
        let oracle = Arc::new(RateOracle::new(
            rates.clone(),
            Duration::ZERO,
            Duration::ZERO,
            Decimal::new(125, 3),
        ));
        let config = LifecycleConfig {
            token_deposit_address: Some("0x00000000000000000000000000000000000000aa".into()),
            ..LifecycleConfig::default()
        };
        let lifecycle = Arc::new(PaymentLifecycle::new(
            CreditLedger::new(credits.clone()),
            queues,
            payments.clone(),
            oracle,
            Arc::new(PaymentSigner::from_hex(KEY_ONE).unwrap()),
            rails,
            config,
        ));
        Harness {
            lifecycle,
            broker,
            credits,
            payments,
            rates,
        }
    }

    fn payer() -> Address {
        "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf".parse().unwrap()
    }

    #[tokio::test]
    async fn test_token_offer_is_signed_over_base_units() {
        let h = harness().await;
        let offer = h
            .lifecycle
            .request_token_payment("alice", PaymentMethod::Token, &payer(), Decimal::from(10))
            .await
            .unwrap();

        assert_eq!(offer.payment_number, 1);
        assert_eq!(offer.charge_amount, "80000000000000000000");
        let expected = prefixed_hash(&payment_hash(&payer(), 1, PaymentMethod::Token, 80_000_000_000_000_000_000));
        assert_eq!(offer.signature.h, format!("0x{}", hex::encode(expected)));

        let stored = h.payments.find("alice", 1).await.unwrap().unwrap();
        assert_eq!(stored.state(), PaymentState::Created);
        assert_eq!(stored.tx_hash, "alice-1");
        assert_eq!(stored.charge_amount, Decimal::from(80));
    }

    #[tokio::test]
    async fn test_ether_offer_uses_quote() {
        let h = harness().await;
        let offer = h
            .lifecycle
            .request_token_payment("alice", PaymentMethod::Ether, &payer(), Decimal::from(10))
            .await
            .unwrap();
        assert_eq!(offer.method, 1);
        assert_eq!(offer.charge_amount, "5000000000000000");
    }

    #[tokio::test]
    async fn test_rate_failure_leaves_no_gap() {
        let h = harness().await;
        h.rates.remove("ethereum");
        let err = h
            .lifecycle
            .request_token_payment("alice", PaymentMethod::Ether, &payer(), Decimal::from(10))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "rate-lookup-failed");

        let offer = h
            .lifecycle
            .request_token_payment("alice", PaymentMethod::Token, &payer(), Decimal::from(1))
            .await
            .unwrap();
        assert_eq!(offer.payment_number, 1);
    }

    #[tokio::test]
    async fn test_replayed_submission_is_rejected() {
        let h = harness().await;
        for _ in 0..5 {
            h.lifecycle
                .request_token_payment("alice", PaymentMethod::Token, &payer(), Decimal::ONE)
                .await
                .unwrap();
        }

        h.lifecycle
            .submit_payment("alice", PaymentRail::TokenContract, 5, "0xabc")
            .await
            .unwrap();
        let err = h
            .lifecycle
            .submit_payment("alice", PaymentRail::TokenContract, 5, "0xdef")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "payment-already-processed");

        let stored = h.lifecycle.payment("alice", 5).await.unwrap();
        assert_eq!(stored.tx_hash, "0xabc");
        let jobs: Vec<PaymentConfirmation> = h.broker.published_as(JobClass::TokenPaymentConfirmation);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].payment_number, 5);
    }

    #[tokio::test]
    async fn test_submission_checks() {
        let h = harness().await;
        h.lifecycle
            .request_token_payment("alice", PaymentMethod::Token, &payer(), Decimal::ONE)
            .await
            .unwrap();

        let missing = h
            .lifecycle
            .submit_payment("alice", PaymentRail::TokenContract, 9, "0xabc")
            .await
            .unwrap_err();
        assert_eq!(missing.code(), "payment-not-found");

        let wrong_rail = h
            .lifecycle
            .submit_payment("alice", PaymentRail::CoinWallet, 1, "0xabc")
            .await
            .unwrap_err();
        assert_eq!(wrong_rail.code(), "invalid-payment-method");

        let forwarded = h
            .lifecycle
            .submit_payment("alice", PaymentRail::Forwarding, 1, "0xabc")
            .await
            .unwrap_err();
        assert_eq!(forwarded.code(), "invalid-payment-method");

        h.lifecycle
            .submit_payment("alice", PaymentRail::TokenContract, 1, "0xabc")
            .await
            .unwrap();
        h.payments.mark_confirmed("alice", 1).await.unwrap();
        let confirmed = h
            .lifecycle
            .submit_payment("alice", PaymentRail::TokenContract, 1, "0xdef")
            .await
            .unwrap_err();
        assert_eq!(confirmed.code(), "payment-already-processed");
    }

    #[tokio::test]
    async fn test_unpublished_confirmation_keeps_submission() {
        let h = harness().await;
        h.lifecycle
            .request_token_payment("alice", PaymentMethod::Token, &payer(), Decimal::ONE)
            .await
            .unwrap();
        h.broker.fail_publish(JobClass::TokenPaymentConfirmation, Some("down"));

        let err = h
            .lifecycle
            .submit_payment("alice", PaymentRail::TokenContract, 1, "0xabc")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "queue-publish-failed");
        assert_eq!(h.lifecycle.payment("alice", 1).await.unwrap().tx_hash, "0xabc");
    }

    /// Fails the first address request, then behaves like `DevWallet`
    #[derive(Default)]
    struct FlakyWallet {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl WalletService for FlakyWallet {
        async fn new_deposit_address(&self, account: &str, label: &str) -> Result<String> {
            if self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                return Err(TollgateError::Rail("wallet daemon down".into()));
            }
            DevWallet.new_deposit_address(account, label).await
        }
    }

    #[tokio::test]
    async fn test_wallet_outage_keeps_numbers_contiguous() {
        let h = harness_with(Rails {
            wallet: Some(Arc::new(FlakyWallet::default())),
            ..Rails::default()
        })
        .await;

        let err = h
            .lifecycle
            .create_wallet_payment("alice", Decimal::from(10))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "rail-unavailable");

        let offer = h
            .lifecycle
            .create_wallet_payment("alice", Decimal::from(10))
            .await
            .unwrap();
        assert_eq!(offer.payment_number, 1);
    }

    #[tokio::test]
    async fn test_failed_write_releases_number() {
        let h = harness().await;

        // a stale record already holds alice's first number
        h.payments
            .insert(&Payment {
                account: "alice".into(),
                number: 1,
                rail: PaymentRail::CoinWallet,
                asset: "bitcoin-cash".into(),
                credit_value: Decimal::ONE,
                charge_amount: Decimal::ONE,
                deposit_address: "stale".into(),
                tx_hash: sentinel("alice", 1),
                forward_id: None,
                confirmed: false,
            })
            .await
            .unwrap();

        let err = h
            .lifecycle
            .request_token_payment("alice", PaymentMethod::Token, &payer(), Decimal::from(10))
            .await
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err.code(), "database-error");
        assert_eq!(h.payments.next_number("alice").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_wallet_payment() {
        let h = harness().await;
        let offer = h
            .lifecycle
            .create_wallet_payment("alice", Decimal::from(10))
            .await
            .unwrap();
        assert!(offer.deposit_address.starts_with("dev-alice-"));
        assert_eq!(offer.charge_amount, Decimal::new(4, 2));

        let stored = h.lifecycle.payment("alice", 1).await.unwrap();
        assert_eq!(stored.deposit_address, offer.deposit_address);
        assert_eq!(stored.state(), PaymentState::Created);

        h.lifecycle
            .submit_payment("alice", PaymentRail::CoinWallet, 1, "txid-1")
            .await
            .unwrap();
        let jobs: Vec<PaymentConfirmation> = h.broker.published_as(JobClass::WalletPaymentConfirmation);
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn test_forward_payment_includes_fee() {
        let h = harness().await;
        let offer = h
            .lifecycle
            .create_forward_payment("alice", Decimal::from(10))
            .await
            .unwrap();
        // 10 / 30 rounded up to 8 places, plus 1000 duffs
        assert_eq!(offer.charge_amount, Decimal::new(33_334_334, 8));
        assert_eq!(offer.status, Some(FORWARD_FEE_NOTICE));
        assert_eq!(offer.payment_forward_id.as_deref(), Some("dev-forward-1"));

        let jobs: Vec<ForwardPaymentConfirmation> = h.broker.published_as(JobClass::ForwardPaymentConfirmation);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].payment_forward_id, "dev-forward-1");
        assert_eq!(jobs[0].payment_number, 1);
    }

    #[tokio::test]
    async fn test_concurrent_numbering() {
        let h = harness().await;
        let mut tasks = Vec::new();
        for _ in 0..20 {
            let lifecycle = h.lifecycle.clone();
            tasks.push(tokio::spawn(async move {
                lifecycle
                    .request_token_payment("alice", PaymentMethod::Token, &payer(), Decimal::ONE)
                    .await
                    .unwrap()
                    .payment_number
            }));
        }
        let mut numbers = Vec::new();
        for task in tasks {
            numbers.push(task.await.unwrap());
        }
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=20).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_card_charge_grants_credits() {
        let h = harness().await;
        let receipt = h.lifecycle.charge_card("alice", 2500, "tok_visa").await.unwrap();
        assert_eq!(receipt.credits_granted, Decimal::from(25));
        assert_eq!(receipt.balance, Decimal::from(30));

        let emails: Vec<EmailJob> = h.broker.published_as(JobClass::Email);
        assert_eq!(emails.len(), 1);
        assert_eq!(emails[0].user_names, vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_card_grant_failure_is_reported() {
        let h = harness().await;
        h.credits.fail_credits(true);
        let err = h.lifecycle.charge_card("alice", 2500, "tok_visa").await.unwrap_err();
        assert_eq!(err.code(), "database-error");
        assert!(h.broker.published(JobClass::Email).is_empty());
    }

    #[tokio::test]
    async fn test_deposit_addresses() {
        let h = harness().await;
        assert_eq!(
            h.lifecycle.deposit_address(PaymentRail::TokenContract).unwrap(),
            "0x00000000000000000000000000000000000000aa"
        );
        assert_eq!(
            h.lifecycle.deposit_address(PaymentRail::Card).unwrap_err().code(),
            "invalid-payment-method"
        );
    }
}
