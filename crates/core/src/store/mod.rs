//! Transactional ordered key-value storage.
//!
//! The engine never talks to a database directly. Every state change is a
//! sequence of reads and writes inside one [`KvTransaction`], committed
//! atomically or not at all. Backends only have to provide serializable
//! transactions over byte keys with prefix scans in ascending key order.

mod memory;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use memory::InMemoryKvStore;

use crate::errors::StoreError;

pub type KvPair = (Vec<u8>, Vec<u8>);

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn KvTransaction>, StoreError>;
}

/// One open transaction. Reads observe the transaction's own writes.
///
/// Dropping a transaction without calling [`KvTransaction::commit`] discards
/// every write made through it.
#[async_trait]
pub trait KvTransaction: Send {
    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    async fn put(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError>;

    async fn delete(&mut self, key: &[u8]) -> Result<(), StoreError>;

    /// Pairs whose key starts with `prefix`, ascending by key.
    async fn scan_prefix(
        &mut self,
        prefix: &[u8],
        limit: Option<usize>,
    ) -> Result<Vec<KvPair>, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

pub async fn get_json<T>(tx: &mut dyn KvTransaction, key: &[u8]) -> Result<Option<T>, StoreError>
where
    T: DeserializeOwned,
{
    match tx.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

pub async fn put_json<T>(tx: &mut dyn KvTransaction, key: &[u8], value: &T) -> Result<(), StoreError>
where
    T: Serialize + Sync + ?Sized,
{
    let bytes = serde_json::to_vec(value)?;
    tx.put(key, bytes).await
}

pub async fn scan_json<T>(
    tx: &mut dyn KvTransaction,
    prefix: &[u8],
    limit: Option<usize>,
) -> Result<Vec<T>, StoreError>
where
    T: DeserializeOwned,
{
    let pairs = tx.scan_prefix(prefix, limit).await?;
    pairs
        .into_iter()
        .map(|(_, value)| serde_json::from_slice(&value).map_err(StoreError::from))
        .collect()
}
