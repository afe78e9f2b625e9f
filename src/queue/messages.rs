//! Job payloads, one per class
//!
//! Field names are the wire contract with the workers that consume these
//! queues. Every metered job carries the credits already reserved for it in
//! `credit_cost`, so a worker that fails the job knows what to refund.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Pin content on a network (`pin` and `cluster-pin` classes)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinJob {
    pub cid: String,
    pub network_name: String,
    pub user_name: String,
    pub hold_time_in_months: u32,
    pub size: u64,
    pub credit_cost: Decimal,
}

/// Store an uploaded object (`file` class)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileJob {
    pub object_name: String,
    pub network_name: String,
    pub user_name: String,
    pub hold_time_in_months: u32,
    pub size: u64,
    pub credit_cost: Decimal,
}

/// Create a named key on every node (`key-creation` class)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyCreationJob {
    pub user_name: String,
    pub name: String,
    #[serde(rename = "type")]
    pub key_type: String,
    pub size: u32,
    pub network_name: String,
    pub credit_cost: Decimal,
}

/// Publish a name record (`ipns-entry` class). Durations are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpnsEntryJob {
    pub cid: String,
    pub life_time: u64,
    pub ttl: u64,
    pub resolve: bool,
    pub key: String,
    pub user_name: String,
    pub network_name: String,
    pub credit_cost: Decimal,
}

/// Broadcast a message on a topic (`pubsub-publish` class)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PubsubPublishJob {
    pub topic: String,
    pub message: String,
    pub user_name: String,
    pub network_name: String,
    pub credit_cost: Decimal,
}

/// Notify accounts by email (`email` class)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailJob {
    pub subject: String,
    pub content: String,
    pub content_type: String,
    pub user_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emails: Vec<String>,
}

/// Confirm a submitted payment. The chain event or wallet carries the amount,
/// so only the account and number are needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentConfirmation {
    pub user_name: String,
    pub payment_number: u64,
}

/// Confirm a forwarded payment once the forwarder reports it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardPaymentConfirmation {
    pub user_name: String,
    pub payment_forward_id: String,
    pub payment_number: u64,
}
