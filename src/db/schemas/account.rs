//! Account document schema
//!
//! Balances are stored as integer micro-credits so that `$inc` and the
//! conditional-decrement filter operate on exact values.

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;

/// Collection name for accounts
pub const ACCOUNT_COLLECTION: &str = "accounts";

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct AccountDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    /// Account name, also the `sub` claim of its bearer tokens
    pub user_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    /// Balance in millionths of a credit
    #[serde(default)]
    pub credits_micro: i64,

    /// Administrative accounts are never debited
    #[serde(default)]
    pub admin_access: bool,
}

impl AccountDoc {
    pub fn new(user_name: impl Into<String>, credits_micro: i64) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            user_name: user_name.into(),
            email: None,
            credits_micro,
            admin_access: false,
        }
    }
}

impl IntoIndexes for AccountDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "user_name": 1 },
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name("user_name_unique".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for AccountDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
