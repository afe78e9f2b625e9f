//! MongoDB client and collection wrapper

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::{
    options::{IndexOptions, ReturnDocument},
    results::UpdateResult,
    Client, Collection, IndexModel,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::info;

use crate::db::schemas::Metadata;
use crate::types::TollgateError;

/// Trait for schemas that provide index definitions
pub trait IntoIndexes {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)>;
}

/// Trait for schemas with mutable metadata
pub trait MutMetadata {
    fn mut_metadata(&mut self) -> &mut Metadata;
}

/// MongoDB client wrapper
#[derive(Clone)]
pub struct MongoClient {
    client: Client,
    db_name: String,
}

impl MongoClient {
    /// Connect and ping, failing fast when the server is unreachable
    pub async fn new(uri: &str, db_name: &str) -> Result<Self, TollgateError> {
        info!("Connecting to MongoDB at {}", uri);

        let timeout_uri = if uri.contains('?') {
            format!("{}&serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        } else {
            format!("{}?serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        };

        let client = Client::with_uri_str(&timeout_uri)
            .await
            .map_err(|e| TollgateError::Database(format!("Failed to connect to MongoDB: {}", e)))?;

        client
            .database(db_name)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| TollgateError::Database(format!("MongoDB ping failed: {}", e)))?;

        info!("Connected to MongoDB database '{}'", db_name);

        Ok(Self {
            client,
            db_name: db_name.to_string(),
        })
    }

    /// Get a typed collection, creating its indexes
    pub async fn collection<T>(&self, name: &str) -> Result<MongoCollection<T>, TollgateError>
    where
        T: Serialize + DeserializeOwned + Unpin + Send + Sync + IntoIndexes + MutMetadata,
    {
        MongoCollection::new(&self.client, &self.db_name, name).await
    }

    /// Round-trip ping used by the readiness probe
    pub async fn ping(&self) -> Result<(), TollgateError> {
        self.client
            .database(&self.db_name)
            .run_command(doc! { "ping": 1 })
            .await
            .map(|_| ())
            .map_err(|e| TollgateError::Database(format!("MongoDB ping failed: {}", e)))
    }
}

/// Typed MongoDB collection with automatic indexing
#[derive(Debug, Clone)]
pub struct MongoCollection<T>
where
    T: Serialize + DeserializeOwned + Unpin + Send + Sync,
{
    inner: Collection<T>,
}

impl<T> MongoCollection<T>
where
    T: Serialize + DeserializeOwned + Unpin + Send + Sync + IntoIndexes + MutMetadata,
{
    pub async fn new(
        client: &Client,
        db_name: &str,
        collection_name: &str,
    ) -> Result<Self, TollgateError> {
        let collection = client.database(db_name).collection::<T>(collection_name);
        let mongo_collection = MongoCollection { inner: collection };
        mongo_collection.apply_indexes().await?;
        Ok(mongo_collection)
    }

    async fn apply_indexes(&self) -> Result<(), TollgateError> {
        let indices: Vec<IndexModel> = T::into_indices()
            .into_iter()
            .map(|(keys, opts)| IndexModel::builder().keys(keys).options(opts).build())
            .collect();

        if indices.is_empty() {
            return Ok(());
        }

        self.inner
            .create_indexes(indices)
            .await
            .map_err(|e| TollgateError::Database(format!("Failed to create indexes: {}", e)))?;

        Ok(())
    }

    /// Insert a document, stamping its metadata
    pub async fn insert_one(&self, mut item: T) -> Result<ObjectId, TollgateError> {
        let metadata = item.mut_metadata();
        metadata.created_at = Some(DateTime::now());
        metadata.updated_at = Some(DateTime::now());

        let result = self
            .inner
            .insert_one(item)
            .await
            .map_err(|e| TollgateError::Database(format!("Insert failed: {}", e)))?;

        result
            .inserted_id
            .as_object_id()
            .ok_or_else(|| TollgateError::Database("Failed to get inserted ID".into()))
    }

    pub async fn find_one(&self, filter: Document) -> Result<Option<T>, TollgateError> {
        self.inner
            .find_one(filter)
            .await
            .map_err(|e| TollgateError::Database(format!("Find failed: {}", e)))
    }

    /// Update one document; `updated_at` is always bumped
    pub async fn update_one(
        &self,
        filter: Document,
        mut update: Document,
    ) -> Result<UpdateResult, TollgateError> {
        touch(&mut update);
        self.inner
            .update_one(filter, update)
            .await
            .map_err(|e| TollgateError::Database(format!("Update failed: {}", e)))
    }

    /// Atomically update a single matching document and return it post-update.
    ///
    /// Returns `None` when nothing matched the filter (and `upsert` is false).
    pub async fn find_one_and_update(
        &self,
        filter: Document,
        mut update: Document,
        upsert: bool,
    ) -> Result<Option<T>, TollgateError> {
        touch(&mut update);
        if upsert {
            let on_insert = doc! { "metadata.created_at": DateTime::now() };
            update.insert("$setOnInsert", on_insert);
        }
        self.inner
            .find_one_and_update(filter, update)
            .return_document(ReturnDocument::After)
            .upsert(upsert)
            .await
            .map_err(|e| TollgateError::Database(format!("Find-and-update failed: {}", e)))
    }
}

fn touch(update: &mut Document) {
    let now = DateTime::now();
    match update.get_document_mut("$set") {
        Ok(set) => {
            set.insert("metadata.updated_at", now);
        }
        Err(_) => {
            update.insert("$set", doc! { "metadata.updated_at": now });
        }
    }
}
