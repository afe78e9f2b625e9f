//! Payment and payment-counter document schemas

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;

/// Collection name for payments
pub const PAYMENT_COLLECTION: &str = "payments";

/// Collection name for per-account payment number counters
pub const PAYMENT_COUNTER_COLLECTION: &str = "payment_counters";

/// Payment record as stored.
///
/// Decimal amounts are kept as strings to avoid float rounding.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct PaymentDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub user_name: String,

    pub number: i64,

    /// Wire name of the settlement rail
    pub rail: String,

    /// Asset the charge is denominated in (token, ether, coin ticker)
    pub asset: String,

    pub credit_value: String,

    pub charge_amount: String,

    pub deposit_address: String,

    pub tx_hash: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_id: Option<String>,

    #[serde(default)]
    pub confirmed: bool,
}

impl IntoIndexes for PaymentDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "user_name": 1, "number": 1 },
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name("user_number_unique".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for PaymentDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

/// Last payment number handed out to an account
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct PaymentCounterDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub user_name: String,

    #[serde(default)]
    pub last_number: i64,
}

impl IntoIndexes for PaymentCounterDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "user_name": 1 },
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name("counter_user_unique".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for PaymentCounterDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
