//! HTTP routes for Tollgate
//!
//! `/health`, `/ready` and `/version` are open; everything under `/api/v2`
//! needs a bearer token.
//!
//! Handlers take an already-read [`ApiRequest`] so they can be driven without
//! a socket. Successful responses are wrapped as `{"response": ...}`; failures
//! carry the stable error body from [`TollgateError::to_body`].

pub mod account;
pub mod health;
pub mod ipfs;
pub mod payments;

pub use health::{health_check, readiness_check, version_info};

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE};
use hyper::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::server::AppState;
use crate::types::{Result, TollgateError};

pub type JsonResponse = Response<Full<Bytes>>;

/// Largest request body accepted
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// A request with its body already collected
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub authorization: Option<String>,
    pub body: Bytes,
}

#[derive(Serialize)]
struct Envelope<T> {
    response: T,
}

pub fn json_response<T: Serialize + ?Sized>(status: StatusCode, body: &T) -> JsonResponse {
    let payload = serde_json::to_vec(body).unwrap_or_else(|_| {
        br#"{"error":"Serialization failed","code":"internal-error","retryable":false}"#.to_vec()
    });
    let mut response = Response::new(Full::new(Bytes::from(payload)));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

/// 200 with `{"response": value}`
pub fn ok<T: Serialize>(value: T) -> JsonResponse {
    json_response(StatusCode::OK, &Envelope { response: value })
}

pub fn error_response(err: &TollgateError) -> JsonResponse {
    if err.status_code().is_server_error() {
        warn!(code = err.code(), error = %err, "request failed");
    } else {
        debug!(code = err.code(), error = %err, "request rejected");
    }
    json_response(err.status_code(), &err.to_body())
}

pub fn not_found_response(path: &str) -> JsonResponse {
    json_response(
        StatusCode::NOT_FOUND,
        &serde_json::json!({
            "error": "Not Found",
            "path": path,
        }),
    )
}

/// Decode a JSON body; an empty body reads as `{}`
pub fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    let body: &[u8] = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}"
    } else {
        body
    };
    serde_json::from_slice(body).map_err(|e| TollgateError::BadRequest(format!("invalid request body: {}", e)))
}

/// Route a request. Everything except the health probes requires a bearer token.
pub async fn route(state: &AppState, request: ApiRequest) -> JsonResponse {
    match (&request.method, request.path.as_str()) {
        (&Method::GET, "/health") | (&Method::GET, "/healthz") => return health_check(state),
        (&Method::GET, "/ready") | (&Method::GET, "/readyz") => return readiness_check(state).await,
        (&Method::GET, "/version") => return version_info(),
        _ => {}
    }

    let result = match state.auth.authenticate(request.authorization.as_deref()) {
        Ok(account) => handle_api(state, &account, &request).await,
        Err(e) => Err(e),
    };

    result.unwrap_or_else(|e| error_response(&e))
}

async fn handle_api(state: &AppState, account: &str, request: &ApiRequest) -> Result<JsonResponse> {
    let segments: Vec<&str> = request.path.trim_matches('/').split('/').collect();
    let body = &request.body;

    match (&request.method, segments.as_slice()) {
        (&Method::POST, ["api", "v2", "ipfs", "public", "pin", cid]) => {
            ipfs::pin(state, account, cid, ipfs::PinTarget::Node, body).await
        }
        (&Method::POST, ["api", "v2", "ipfs", "cluster", "pin", cid]) => {
            ipfs::pin(state, account, cid, ipfs::PinTarget::Cluster, body).await
        }
        (&Method::POST, ["api", "v2", "ipfs", "public", "file", "add"]) => ipfs::add_file(state, account, body).await,
        (&Method::POST, ["api", "v2", "account", "key", "ipfs", "new"]) => {
            ipfs::create_key(state, account, body).await
        }
        (&Method::POST, ["api", "v2", "ipns", "public", "publish"]) => ipfs::publish_name(state, account, body).await,
        (&Method::POST, ["api", "v2", "ipfs", "public", "pubsub", "publish", topic]) => {
            ipfs::pubsub_publish(state, account, topic, body).await
        }
        (&Method::GET, ["api", "v2", "account", "credits", "available"]) => {
            account::credits_available(state, account).await
        }
        (&Method::POST, ["api", "v2", "payments", "request"]) => {
            payments::request_token_payment(state, account, body).await
        }
        (&Method::POST, ["api", "v2", "payments", "create", rail]) => {
            payments::create_payment(state, account, rail, body).await
        }
        (&Method::POST, ["api", "v2", "payments", "confirm"]) => payments::confirm(state, account, body).await,
        (&Method::POST, ["api", "v2", "payments", "card", "charge"]) => {
            payments::charge_card(state, account, body).await
        }
        (&Method::GET, ["api", "v2", "payments", "deposit", "address", rail]) => {
            payments::deposit_address(state, rail)
        }
        (&Method::GET, ["api", "v2", "payments", number]) => payments::status(state, account, number).await,
        _ => Ok(not_found_response(&request.path)),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixture for route tests

    use super::*;
    use crate::auth::JwtValidator;
    use crate::config::Args;
    use crate::dispatch::{Dispatcher, PricingPolicy, StaticSizer};
    use crate::ledger::{CreditLedger, InMemoryCreditStore};
    use crate::payments::{
        DevCardProcessor, DevForwarder, DevWallet, InMemoryPaymentStore, LifecycleConfig, PaymentLifecycle,
        PaymentSigner, Rails, RateOracle, StaticRates,
    };
    use crate::queue::{HandleSpec, MemoryBroker, QueueManager};
    use clap::Parser;
    use rust_decimal::Decimal;
    use std::sync::Arc;
    use std::time::Duration;

    pub const CID: &str = "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG";

    pub struct Fixture {
        pub state: AppState,
        pub broker: MemoryBroker,
        pub token: String,
    }

    pub async fn fixture(balance: i64) -> Fixture {
        let args = Args::parse_from(["tollgate", "--dev-mode"]);
        let credits = Arc::new(InMemoryCreditStore::new());
        credits.open_account("alice", Decimal::from(balance), false).unwrap();
        let ledger = CreditLedger::new(credits);

        let broker = MemoryBroker::new();
        let (queues, _faults) = QueueManager::start(Arc::new(broker.clone()), HandleSpec::all())
            .await
            .unwrap();

        let rates = Arc::new(StaticRates::new().with_price("dash", Decimal::from(30)));
        let oracle = Arc::new(RateOracle::new(
            rates,
            Duration::from_secs(600),
            Duration::from_secs(3600),
            Decimal::new(125, 3),
        ));
        let lifecycle = PaymentLifecycle::new(
            ledger.clone(),
            queues.clone(),
            Arc::new(InMemoryPaymentStore::new()),
            oracle,
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
            args,
            auth,
            ledger: ledger.clone(),
            dispatcher: Dispatcher::new(ledger, queues.clone(), PricingPolicy::default()),
            payments: Arc::new(lifecycle),
            queues,
            sizer: Arc::new(StaticSizer::new(10 * 1024 * 1024 * 1024)),
            mongo: None,
            ready: Default::default(),
        };
        state.mark_ready(true);

        Fixture { state, broker, token }
    }

    impl Fixture {
        pub fn request(&self, method: Method, path: &str, body: serde_json::Value) -> ApiRequest {
            ApiRequest {
                method,
                path: path.to_string(),
                authorization: Some(format!("Bearer {}", self.token)),
                body: Bytes::from(body.to_string()),
            }
        }
    }

    pub async fn body_json(response: JsonResponse) -> serde_json::Value {
        use http_body_util::BodyExt;
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }
}
