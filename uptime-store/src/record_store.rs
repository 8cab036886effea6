/*!
The storage seam shared by every consumer of records
*/

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::error::{StoreError, StoreResult};

/// Whole-document CRUD over named collections.
///
/// There is no partial update: callers read, modify and write back the full
/// document.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist a new record, failing with `AlreadyExists` if one is present
    async fn create(&self, collection: &str, key: &str, document: &Value) -> StoreResult<()>;

    /// Read a record, failing with `NotFound` or `Corrupt`
    async fn read(&self, collection: &str, key: &str) -> StoreResult<Value>;

    /// Replace an existing record wholesale
    async fn update(&self, collection: &str, key: &str, document: &Value) -> StoreResult<()>;

    /// Remove an existing record
    async fn delete(&self, collection: &str, key: &str) -> StoreResult<()>;

    /// Keys currently present in a collection, sorted. Empty if the
    /// collection has never been written to.
    async fn list(&self, collection: &str) -> StoreResult<Vec<String>>;
}

/// Typed helpers layered on top of any [`RecordStore`]
#[async_trait]
pub trait RecordStoreExt: RecordStore {
    async fn create_as<T>(&self, collection: &str, key: &str, document: &T) -> StoreResult<()>
    where
        T: Serialize + Sync,
    {
        let value = encode(collection, key, document)?;
        self.create(collection, key, &value).await
    }

    async fn read_as<T>(&self, collection: &str, key: &str) -> StoreResult<T>
    where
        T: DeserializeOwned + Send,
    {
        let value = self.read(collection, key).await?;
        serde_json::from_value(value).map_err(|source| StoreError::Corrupt {
            collection: collection.to_string(),
            key: key.to_string(),
            source,
        })
    }

    async fn update_as<T>(&self, collection: &str, key: &str, document: &T) -> StoreResult<()>
    where
        T: Serialize + Sync,
    {
        let value = encode(collection, key, document)?;
        self.update(collection, key, &value).await
    }
}

impl<S: RecordStore + ?Sized> RecordStoreExt for S {}

fn encode<T: Serialize>(collection: &str, key: &str, document: &T) -> StoreResult<Value> {
    serde_json::to_value(document).map_err(|source| StoreError::Encode {
        collection: collection.to_string(),
        key: key.to_string(),
        source,
    })
}
