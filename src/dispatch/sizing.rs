//! Object sizing for pin pricing
//!
//! Pins are priced by the cumulative size of the object graph, which only the
//! IPFS node knows. The size is looked up before any credits are reserved.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::time::Duration;

use crate::types::{Result, TollgateError};

#[async_trait]
pub trait ObjectSizer: Send + Sync {
    /// Cumulative size in bytes of the object rooted at `cid`
    async fn object_size(&self, cid: &str) -> Result<u64>;
}

#[derive(Deserialize)]
struct ObjectStat {
    #[serde(rename = "CumulativeSize")]
    cumulative_size: u64,
}

/// Sizes objects through the IPFS HTTP API (`/api/v0/object/stat`)
pub struct IpfsObjectSizer {
    http: reqwest::Client,
    api_url: String,
}

impl IpfsObjectSizer {
    pub fn new(api_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TollgateError::Config(format!("Failed to build IPFS client: {}", e)))?;
        Ok(Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ObjectSizer for IpfsObjectSizer {
    async fn object_size(&self, cid: &str) -> Result<u64> {
        let response = self
            .http
            .post(format!("{}/api/v0/object/stat", self.api_url))
            .query(&[("arg", cid)])
            .send()
            .await
            .map_err(|e| TollgateError::Upstream(format!("IPFS object stat failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(TollgateError::Upstream(format!(
                "IPFS object stat for {} returned {}",
                cid,
                response.status()
            )));
        }

        let stat: ObjectStat = response
            .json()
            .await
            .map_err(|e| TollgateError::Upstream(format!("bad object stat response: {}", e)))?;
        Ok(stat.cumulative_size)
    }
}

/// Fixed sizes, for dev mode and tests. Unknown objects get the default size.
#[derive(Default)]
pub struct StaticSizer {
    sizes: DashMap<String, u64>,
    default_size: u64,
}

impl StaticSizer {
    pub fn new(default_size: u64) -> Self {
        Self {
            sizes: DashMap::new(),
            default_size,
        }
    }

    pub fn with_size(self, cid: &str, size: u64) -> Self {
        self.sizes.insert(cid.to_string(), size);
        self
    }
}

#[async_trait]
impl ObjectSizer for StaticSizer {
    async fn object_size(&self, cid: &str) -> Result<u64> {
        Ok(self.sizes.get(cid).map(|s| *s).unwrap_or(self.default_size))
    }
}
