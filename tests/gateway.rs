//! End-to-end flows over the in-memory ledger, payment store and broker.

use bytes::Bytes;
use clap::Parser;
use http_body_util::BodyExt;
use hyper::{Method, StatusCode};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_test::{assert_err, assert_ok};

use tollgate::auth::JwtValidator;
use tollgate::config::Args;
use tollgate::dispatch::{Dispatcher, PaidOperation, PricingPolicy, StaticSizer};
use tollgate::ledger::{CreditLedger, InMemoryCreditStore};
use tollgate::payments::{
    Address, DevCardProcessor, DevForwarder, DevWallet, InMemoryPaymentStore, LifecycleConfig, PaymentLifecycle,
    PaymentMethod, PaymentRail, PaymentSigner, Rails, RateOracle, StaticRates,
};
use tollgate::queue::messages::PinJob;
use tollgate::queue::{HandleSpec, JobClass, MemoryBroker, QueueManager};
use tollgate::routes::{self, ApiRequest, JsonResponse};
use tollgate::{AppState, TollgateError};

const CID: &str = "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG";
const GIB: u64 = 1024 * 1024 * 1024;

struct Gateway {
    state: AppState,
    broker: MemoryBroker,
    token: String,
}

/// Every object is 100 GiB, so a two-month public pin costs 10 credits
async fn gateway(balance: i64) -> Gateway {
    let credits = Arc::new(InMemoryCreditStore::new());
    credits.open_account("alice", Decimal::from(balance), false).unwrap();
    let ledger = CreditLedger::new(credits);

    let broker = MemoryBroker::new();
    let (queues, _faults) = QueueManager::start(Arc::new(broker.clone()), HandleSpec::all())
        .await
        .unwrap();

    let oracle = RateOracle::new(
        Arc::new(StaticRates::new().with_price("ethereum", Decimal::from(2000))),
        Duration::from_secs(600),
        Duration::from_secs(3600),
        Decimal::new(125, 3),
    );
    let payments = PaymentLifecycle::new(
        ledger.clone(),
        queues.clone(),
        Arc::new(InMemoryPaymentStore::new()),
        Arc::new(oracle),
        Arc::new(PaymentSigner::random()),
        Rails {
            wallet: Some(Arc::new(DevWallet)),
            forwarder: Some(Arc::new(DevForwarder::with_fee(0))),
            card: Some(Arc::new(DevCardProcessor::default())),
        },
        LifecycleConfig::default(),
    );

    let auth = JwtValidator::new_dev();
    let token = auth.generate_token("alice").unwrap();
    let state = AppState {
        args: Args::parse_from(["tollgate", "--dev-mode"]),
        auth,
        ledger: ledger.clone(),
        dispatcher: Dispatcher::new(ledger, queues.clone(), PricingPolicy::default()),
        payments: Arc::new(payments),
        queues,
        sizer: Arc::new(StaticSizer::new(100 * GIB)),
        mongo: None,
        ready: Default::default(),
    };
    state.mark_ready(true);

    Gateway { state, broker, token }
}

impl Gateway {
    async fn call(&self, method: Method, path: &str, body: Value) -> (StatusCode, Value) {
        let request = ApiRequest {
            method,
            path: path.to_string(),
            authorization: Some(format!("Bearer {}", self.token)),
            body: Bytes::from(body.to_string()),
        };
        let response = routes::route(&self.state, request).await;
        (response.status(), body_json(response).await)
    }

    async fn balance(&self) -> Decimal {
        let (status, body) = self
            .call(Method::GET, "/api/v2/account/credits/available", json!({}))
            .await;
        assert_eq!(status, StatusCode::OK);
        decimal(&body["response"]["credits"])
    }
}

async fn body_json(response: JsonResponse) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn decimal(value: &Value) -> Decimal {
    match value {
        Value::String(s) => s.parse().unwrap(),
        other => other.to_string().parse().unwrap(),
    }
}

fn payer() -> Address {
    "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf".parse().unwrap()
}

#[tokio::test]
async fn test_pin_debits_and_queues_job() {
    let gw = gateway(100).await;

    let (status, body) = gw
        .call(
            Method::POST,
            &format!("/api/v2/ipfs/public/pin/{}", CID),
            json!({"hold_time": 2}),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(decimal(&body["response"]["cost"]), Decimal::from(10));
    assert_eq!(decimal(&body["response"]["remaining"]), Decimal::from(90));
    assert_eq!(gw.balance().await, Decimal::from(90));

    let jobs: Vec<PinJob> = gw.broker.published_as(JobClass::Pin);
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].user_name, "alice");
}

#[tokio::test]
async fn test_broker_outage_refunds_and_is_retryable() {
    let gw = gateway(100).await;
    gw.broker.fail_publish(JobClass::Pin, Some("stream unavailable"));

    let (status, body) = gw
        .call(
            Method::POST,
            &format!("/api/v2/ipfs/public/pin/{}", CID),
            json!({"hold_time": 2}),
        )
        .await;

    assert!(status.is_server_error());
    assert_eq!(body["code"], "queue-publish-failed");
    assert_eq!(body["retryable"], true);
    assert_eq!(gw.balance().await, Decimal::from(100));
    assert!(gw.broker.published(JobClass::Pin).is_empty());

    // the outage clears and the same request goes through
    gw.broker.fail_publish(JobClass::Pin, None);
    let (status, _) = gw
        .call(
            Method::POST,
            &format!("/api/v2/ipfs/public/pin/{}", CID),
            json!({"hold_time": 2}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(gw.balance().await, Decimal::from(90));
}

#[tokio::test]
async fn test_insufficient_balance_leaves_no_job() {
    let gw = gateway(5).await;

    let (status, body) = gw
        .call(
            Method::POST,
            &format!("/api/v2/ipfs/public/pin/{}", CID),
            json!({"hold_time": 2}),
        )
        .await;

    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["code"], "insufficient-balance");
    assert_eq!(gw.balance().await, Decimal::from(5));
    assert!(gw.broker.published(JobClass::Pin).is_empty());
}

#[tokio::test]
async fn test_replayed_submission_is_rejected() {
    let gw = gateway(0).await;
    for expected in 1..=5u64 {
        let offer = gw
            .state
            .payments
            .request_token_payment("alice", PaymentMethod::Token, &payer(), Decimal::from(10))
            .await
            .unwrap();
        assert_eq!(offer.payment_number, expected);
    }

    let (status, _) = gw
        .call(
            Method::POST,
            "/api/v2/payments/confirm",
            json!({"payment_number": 5, "tx_hash": "0xabc"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = gw
        .call(
            Method::POST,
            "/api/v2/payments/confirm",
            json!({"payment_number": 5, "tx_hash": "0xdef"}),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "payment-already-processed");
    assert_eq!(body["retryable"], false);

    let payment = gw.state.payments.payment("alice", 5).await.unwrap();
    assert_eq!(payment.tx_hash, "0xabc");
    assert_eq!(gw.broker.published(JobClass::TokenPaymentConfirmation).len(), 1);
}

#[tokio::test]
async fn test_concurrent_submissions_accept_exactly_one() {
    let gw = gateway(0).await;
    gw.state
        .payments
        .request_token_payment("alice", PaymentMethod::Token, &payer(), Decimal::from(10))
        .await
        .unwrap();

    let submissions = (0..8).map(|i| {
        let payments = gw.state.payments.clone();
        tokio::spawn(async move {
            payments
                .submit_payment("alice", PaymentRail::TokenContract, 1, &format!("0x{:03x}", i))
                .await
        })
    });
    let results = futures::future::join_all(submissions).await;

    let accepted = results.iter().filter(|r| matches!(r, Ok(Ok(_)))).count();
    let replayed = results
        .iter()
        .filter(|r| matches!(r, Ok(Err(TollgateError::PaymentAlreadyProcessed(_)))))
        .count();
    assert_eq!(accepted, 1);
    assert_eq!(replayed, 7);
    assert_eq!(gw.broker.published(JobClass::TokenPaymentConfirmation).len(), 1);
}

#[tokio::test]
async fn test_concurrent_requests_number_contiguously() {
    let gw = gateway(0).await;

    let requests = (0..16).map(|_| {
        let payments = gw.state.payments.clone();
        tokio::spawn(async move {
            payments
                .request_token_payment("alice", PaymentMethod::Token, &payer(), Decimal::from(1))
                .await
        })
    });
    let mut numbers: Vec<u64> = futures::future::join_all(requests)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap().payment_number)
        .collect();
    numbers.sort_unstable();

    assert_eq!(numbers, (1..=16).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_payment_status_moves_to_submitted() {
    let gw = gateway(0).await;
    let (status, body) = gw
        .call(
            Method::POST,
            "/api/v2/payments/request",
            json!({
                "payment_type": 0,
                "sender_address": "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf",
                "credit_value": "10",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let number = body["response"]["payment_number"].as_u64().unwrap();

    let (_, body) = gw.call(Method::GET, &format!("/api/v2/payments/{}", number), json!({})).await;
    assert_eq!(body["response"]["state"], "created");

    gw.call(
        Method::POST,
        "/api/v2/payments/confirm",
        json!({"payment_number": number, "tx_hash": "0xabc"}),
    )
    .await;

    let (_, body) = gw.call(Method::GET, &format!("/api/v2/payments/{}", number), json!({})).await;
    assert_eq!(body["response"]["state"], "submitted");
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_faulted_handle_is_rebuilt_and_keeps_publishing() {
    let broker = MemoryBroker::new();
    let (queues, faults) = QueueManager::start(Arc::new(broker.clone()), HandleSpec::all())
        .await
        .unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let resilience = tokio::spawn(queues.clone().run(faults, shutdown_rx));

    broker.trip(JobClass::Pin, "connection reset");
    wait_for(|| queues.rebuilds() == 1).await;

    let credits = Arc::new(InMemoryCreditStore::new());
    credits.open_account("alice", Decimal::from(100), false).unwrap();
    let dispatcher = Dispatcher::new(CreditLedger::new(credits), queues.clone(), PricingPolicy::default());
    let receipt = dispatcher
        .dispatch(
            "alice",
            PaidOperation::Pin {
                cid: CID.to_string(),
                network_name: "public".to_string(),
                hold_months: 2,
                size: 100 * GIB,
            },
        )
        .await;
    assert_ok!(receipt);
    assert_eq!(broker.published(JobClass::Pin).len(), 1);

    shutdown_tx.send(true).unwrap();
    assert_ok!(resilience.await.unwrap());
}

#[tokio::test]
async fn test_unrebuildable_handle_stops_the_service() {
    let broker = MemoryBroker::new();
    let (queues, faults) = QueueManager::start(Arc::new(broker.clone()), HandleSpec::all())
        .await
        .unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let resilience = tokio::spawn(queues.run(faults, shutdown_rx));

    broker.fail_open(true);
    broker.trip(JobClass::TokenPaymentConfirmation, "stream deleted");

    let result = tokio::time::timeout(Duration::from_secs(1), resilience)
        .await
        .unwrap()
        .unwrap();
    let err = assert_err!(result);
    assert!(matches!(err, TollgateError::BrokerFatal(_)));
}
