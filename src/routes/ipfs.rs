//! Metered IPFS endpoints
//!
//! Each handler turns its body into a [`PaidOperation`] and hands it to the
//! dispatcher. The response is the dispatch receipt (class, cost, remaining
//! balance) once the job has been accepted by the broker.

use serde::Deserialize;

use crate::dispatch::{KeyType, PaidOperation};
use crate::routes::{ok, parse_body, JsonResponse};
use crate::server::AppState;
use crate::types::Result;

fn default_network() -> String {
    "public".to_string()
}

fn default_life_time() -> u64 {
    24 * 60 * 60
}

fn default_ttl() -> u64 {
    60 * 60
}

fn default_true() -> bool {
    true
}

/// Where a pin is held
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinTarget {
    /// Our own IPFS nodes
    Node,
    /// Replicated across the cluster
    Cluster,
}

#[derive(Debug, Deserialize)]
pub struct PinBody {
    pub hold_time: u32,
    #[serde(default = "default_network")]
    pub network_name: String,
}

pub async fn pin(state: &AppState, account: &str, cid: &str, target: PinTarget, body: &[u8]) -> Result<JsonResponse> {
    let body: PinBody = parse_body(body)?;
    let build = |size: u64| {
        let cid = cid.to_string();
        let network_name = body.network_name.clone();
        let hold_months = body.hold_time;
        match target {
            PinTarget::Node => PaidOperation::Pin {
                cid,
                network_name,
                hold_months,
                size,
            },
            PinTarget::Cluster => PaidOperation::ClusterPin {
                cid,
                network_name,
                hold_months,
                size,
            },
        }
    };

    // Reject bad input before asking IPFS for the size
    build(0).validate(state.dispatcher.pricing())?;
    let size = state.sizer.object_size(cid).await?;

    let receipt = state.dispatcher.dispatch(account, build(size)).await?;
    Ok(ok(receipt))
}

#[derive(Debug, Deserialize)]
pub struct FileBody {
    pub object_name: String,
    pub size: u64,
    pub hold_time: u32,
    #[serde(default = "default_network")]
    pub network_name: String,
}

pub async fn add_file(state: &AppState, account: &str, body: &[u8]) -> Result<JsonResponse> {
    let body: FileBody = parse_body(body)?;
    let operation = PaidOperation::FileUpload {
        object_name: body.object_name,
        network_name: body.network_name,
        hold_months: body.hold_time,
        size: body.size,
    };
    let receipt = state.dispatcher.dispatch(account, operation).await?;
    Ok(ok(receipt))
}

#[derive(Debug, Deserialize)]
pub struct KeyBody {
    pub name: String,
    #[serde(rename = "type")]
    pub key_type: String,
    pub size: u32,
    #[serde(default = "default_network")]
    pub network_name: String,
}

pub async fn create_key(state: &AppState, account: &str, body: &[u8]) -> Result<JsonResponse> {
    let body: KeyBody = parse_body(body)?;
    let operation = PaidOperation::KeyCreation {
        name: body.name,
        key_type: body.key_type.parse::<KeyType>()?,
        bits: body.size,
        network_name: body.network_name,
    };
    let receipt = state.dispatcher.dispatch(account, operation).await?;
    Ok(ok(receipt))
}

#[derive(Debug, Deserialize)]
pub struct PublishNameBody {
    pub cid: String,
    pub key: String,
    /// Record lifetime in seconds
    #[serde(default = "default_life_time")]
    pub life_time: u64,
    #[serde(default = "default_ttl")]
    pub ttl: u64,
    #[serde(default = "default_true")]
    pub resolve: bool,
    #[serde(default = "default_network")]
    pub network_name: String,
}

pub async fn publish_name(state: &AppState, account: &str, body: &[u8]) -> Result<JsonResponse> {
    let body: PublishNameBody = parse_body(body)?;
    let operation = PaidOperation::NamePublish {
        cid: body.cid,
        key: body.key,
        life_time_secs: body.life_time,
        ttl_secs: body.ttl,
        resolve: body.resolve,
        network_name: body.network_name,
    };
    let receipt = state.dispatcher.dispatch(account, operation).await?;
    Ok(ok(receipt))
}

#[derive(Debug, Deserialize)]
pub struct PubsubBody {
    pub message: String,
    #[serde(default = "default_network")]
    pub network_name: String,
}

pub async fn pubsub_publish(state: &AppState, account: &str, topic: &str, body: &[u8]) -> Result<JsonResponse> {
    let body: PubsubBody = parse_body(body)?;
    let operation = PaidOperation::PubsubPublish {
        topic: topic.to_string(),
        message: body.message,
        network_name: body.network_name,
    };
    let receipt = state.dispatcher.dispatch(account, operation).await?;
    Ok(ok(receipt))
}

#[cfg(test)]
mod tests {
    use crate::queue::messages::{KeyCreationJob, PinJob, PubsubPublishJob};
    use crate::queue::JobClass;
    use crate::routes::route;
    use crate::routes::testing::*;
    use hyper::{Method, StatusCode};
    use rust_decimal::Decimal;
    use serde_json::json;

    #[tokio::test]
    async fn test_pin_reserves_and_publishes() {
        let fx = fixture(10).await;
        let path = format!("/api/v2/ipfs/public/pin/{}", CID);
        let response = route(&fx.state, fx.request(Method::POST, &path, json!({ "hold_time": 2 }))).await;
        assert_eq!(response.status(), StatusCode::OK);

        // 10 GiB for 2 months at 0.05
        let body = body_json(response).await;
        assert_eq!(body["response"]["cost"], "1");
        assert_eq!(body["response"]["remaining"], "9");

        let jobs: Vec<PinJob> = fx.broker.published_as(JobClass::Pin);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].size, 10 * 1024 * 1024 * 1024);
        assert_eq!(jobs[0].hold_time_in_months, 2);
    }

    #[tokio::test]
    async fn test_pin_with_bad_hold_time() {
        let fx = fixture(10).await;
        let path = format!("/api/v2/ipfs/cluster/pin/{}", CID);
        let response = route(&fx.state, fx.request(Method::POST, &path, json!({ "hold_time": 0 }))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(fx.state.ledger.balance("alice").await.unwrap(), Decimal::from(10));
    }

    #[tokio::test]
    async fn test_pin_broker_outage_refunds() {
        let fx = fixture(10).await;
        fx.broker.fail_publish(JobClass::ClusterPin, Some("stream unavailable"));
        let path = format!("/api/v2/ipfs/cluster/pin/{}", CID);
        let response = route(&fx.state, fx.request(Method::POST, &path, json!({ "hold_time": 1 }))).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["code"], "queue-publish-failed");
        assert_eq!(body["retryable"], true);
        assert_eq!(fx.state.ledger.balance("alice").await.unwrap(), Decimal::from(10));
    }

    #[tokio::test]
    async fn test_key_creation() {
        let fx = fixture(1).await;
        let response = route(
            &fx.state,
            fx.request(
                Method::POST,
                "/api/v2/account/key/ipfs/new",
                json!({ "name": "mykey", "type": "rsa", "size": 2048 }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let jobs: Vec<KeyCreationJob> = fx.broker.published_as(JobClass::KeyCreation);
        assert_eq!(jobs[0].key_type, "rsa");
        assert_eq!(jobs[0].credit_cost, Decimal::new(2, 1));
    }

    #[tokio::test]
    async fn test_key_creation_insufficient_balance() {
        let fx = fixture(0).await;
        let response = route(
            &fx.state,
            fx.request(
                Method::POST,
                "/api/v2/account/key/ipfs/new",
                json!({ "name": "mykey", "type": "ed25519", "size": 256 }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        let body = body_json(response).await;
        assert_eq!(body["code"], "insufficient-balance");
        assert!(fx.broker.published(JobClass::KeyCreation).is_empty());
    }

    #[tokio::test]
    async fn test_pubsub_topic_from_path() {
        let fx = fixture(1).await;
        let response = route(
            &fx.state,
            fx.request(
                Method::POST,
                "/api/v2/ipfs/public/pubsub/publish/news",
                json!({ "message": "hello" }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let jobs: Vec<PubsubPublishJob> = fx.broker.published_as(JobClass::PubsubPublish);
        assert_eq!(jobs[0].topic, "news");
        assert_eq!(jobs[0].message, "hello");
    }
}
