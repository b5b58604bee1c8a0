use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::errors::StoreError;
use crate::store::{KvPair, KvStore, KvTransaction};

type Tree = BTreeMap<Vec<u8>, Vec<u8>>;

/// Process-local store. A transaction holds the tree lock until it commits
/// or is dropped, so transactions are trivially serializable.
#[derive(Clone, Default)]
pub struct InMemoryKvStore {
    tree: Arc<Mutex<Tree>>,
    pending_conflicts: Arc<AtomicU32>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` commits with [`StoreError::Conflict`].
    pub fn inject_conflicts(&self, count: u32) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.tree.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tree.lock().await.is_empty()
    }

    fn take_injected_conflict(&self) -> bool {
        self.pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn begin(&self) -> Result<Box<dyn KvTransaction>, StoreError> {
        let guard = Arc::clone(&self.tree).lock_owned().await;
        Ok(Box::new(InMemoryTransaction {
            guard,
            writes: BTreeMap::new(),
            store: self.clone(),
        }))
    }
}

struct InMemoryTransaction {
    guard: OwnedMutexGuard<Tree>,
    /// `None` marks a staged delete.
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    store: InMemoryKvStore,
}

#[async_trait]
impl KvTransaction for InMemoryTransaction {
    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(staged) = self.writes.get(key) {
            return Ok(staged.clone());
        }
        Ok(self.guard.get(key).cloned())
    }

    async fn put(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError> {
        self.writes.insert(key.to_vec(), Some(value));
        Ok(())
    }

    async fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        self.writes.insert(key.to_vec(), None);
        Ok(())
    }

    async fn scan_prefix(
        &mut self,
        prefix: &[u8],
        limit: Option<usize>,
    ) -> Result<Vec<KvPair>, StoreError> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = self
            .guard
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        for (key, staged) in
            self.writes.range(prefix.to_vec()..).take_while(|(key, _)| key.starts_with(prefix))
        {
            match staged {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }

        let limit = limit.unwrap_or(usize::MAX);
        Ok(merged.into_iter().take(limit).collect())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let InMemoryTransaction { mut guard, writes, store } = *self;
        if store.take_injected_conflict() {
            return Err(StoreError::Conflict);
        }

        for (key, staged) in writes {
            match staged {
                Some(value) => {
                    guard.insert(key, value);
                }
                None => {
                    guard.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::InMemoryKvStore;
    use crate::errors::StoreError;
    use crate::store::KvStore;

    #[tokio::test]
    async fn committed_writes_are_visible_to_later_transactions() {
        let store = InMemoryKvStore::new();

        let mut tx = store.begin().await.unwrap();
        tx.put(b"a/1", b"one".to_vec()).await.unwrap();
        tx.put(b"a/2", b"two".to_vec()).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.get(b"a/1").await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(store_len_hint(&mut *tx).await, 2);
    }

    async fn store_len_hint(tx: &mut dyn crate::store::KvTransaction) -> usize {
        tx.scan_prefix(b"", None).await.unwrap().len()
    }

    #[tokio::test]
    async fn dropped_transaction_discards_writes() {
        let store = InMemoryKvStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.put(b"k", b"v".to_vec()).await.unwrap();
        }
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn scan_merges_staged_writes_in_key_order() {
        let store = InMemoryKvStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.put(b"q/2", b"b".to_vec()).await.unwrap();
        tx.put(b"q/3", b"c".to_vec()).await.unwrap();
        tx.put(b"r/1", b"x".to_vec()).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.put(b"q/1", b"a".to_vec()).await.unwrap();
        tx.delete(b"q/2").await.unwrap();

        let keys: Vec<Vec<u8>> =
            tx.scan_prefix(b"q/", None).await.unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"q/1".to_vec(), b"q/3".to_vec()]);

        let limited = tx.scan_prefix(b"q/", Some(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].0, b"q/1".to_vec());
    }

    #[tokio::test]
    async fn injected_conflict_fails_commit_once() {
        let store = InMemoryKvStore::new();
        store.inject_conflicts(1);

        let mut tx = store.begin().await.unwrap();
        tx.put(b"k", b"v".to_vec()).await.unwrap();
        assert_eq!(tx.commit().await, Err(StoreError::Conflict));
        assert!(store.is_empty().await);

        let mut tx = store.begin().await.unwrap();
        tx.put(b"k", b"v".to_vec()).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.len().await, 1);
    }
}
