//! Persistence of bucket accounting state to an external key-value store.
//!
//! The store itself is an external collaborator: the library only defines
//! the contract and walks the bucket chain in the right order. Exactly two
//! scalars are persisted per bucket, the last refill timestamp and the
//! remaining token count.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tracing::trace;

use crate::bucket::Bucket;
use crate::error::{CascadeError, Result};

/// Opaque scalar key-value store that bucket state is persisted to.
///
/// Implementations wrap whatever backing store the application uses.
/// Errors are surfaced verbatim through [`CascadeError::Store`].
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read a scalar, or `None` when no value was ever written.
    async fn get(&self, key: &str) -> anyhow::Result<Option<f64>>;

    /// Write a scalar.
    async fn set(&self, key: &str, value: f64) -> anyhow::Result<()>;
}

/// Storage keys for one bucket's persisted scalars.
///
/// Keys are derived from the bucket's persistence identity so that every
/// bucket in a hierarchy writes to its own slots.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey {
    id: String,
}

impl StateKey {
    /// Create a key set for the given bucket identity.
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }

    /// Key under which the remaining token count is stored.
    pub fn tokens_left(&self) -> String {
        format!("{}:tokens_left", self.id)
    }

    /// Key under which the last refill timestamp is stored.
    pub fn last_refill(&self) -> String {
        format!("{}:last_refill", self.id)
    }
}

impl std::fmt::Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// In-process [`StateStore`] backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: DashMap<String, f64>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored scalars.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the store holds no scalars.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<f64>> {
        Ok(self.values.get(key).map(|v| *v))
    }

    async fn set(&self, key: &str, value: f64) -> anyhow::Result<()> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }
}

impl Bucket {
    /// Persist this bucket's refill timestamp and token count.
    ///
    /// Ancestors with a persistence key are saved first, so a chain is
    /// always written root-to-leaf. Fails with
    /// [`CascadeError::NoPersistenceConfigured`] when this bucket has no
    /// persistence key.
    pub async fn save(&self, store: &dyn StateStore) -> Result<()> {
        self.save_chain(store).await
    }

    /// Restore this bucket's refill timestamp and token count.
    ///
    /// Ancestors with a persistence key are loaded first. A missing value
    /// for either field leaves the current value unchanged; a partial miss
    /// is not an error.
    pub async fn load(&self, store: &dyn StateStore) -> Result<()> {
        self.load_chain(store).await
    }

    fn save_chain<'a>(&'a self, store: &'a dyn StateStore) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let id = self.key().ok_or(CascadeError::NoPersistenceConfigured)?;
            if let Some(parent) = self.parent() {
                if parent.key().is_some() {
                    parent.save_chain(store).await?;
                }
            }
            let state = self.snapshot();
            let key = StateKey::new(id);
            trace!(key = %key, tokens_left = state.tokens_left, "Saving bucket state");
            store.set(&key.last_refill(), state.last_refill_ms as f64).await?;
            store.set(&key.tokens_left(), state.tokens_left).await?;
            Ok(())
        })
    }

    fn load_chain<'a>(&'a self, store: &'a dyn StateStore) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let id = self.key().ok_or(CascadeError::NoPersistenceConfigured)?;
            if let Some(parent) = self.parent() {
                if parent.key().is_some() {
                    parent.load_chain(store).await?;
                }
            }
            let key = StateKey::new(id);
            let last_refill = store.get(&key.last_refill()).await?;
            let tokens_left = store.get(&key.tokens_left()).await?;
            trace!(key = %key, "Loaded bucket state");
            let mut state = self.snapshot();
            if let Some(ms) = last_refill {
                state.last_refill_ms = ms as u64;
            }
            if let Some(tokens) = tokens_left {
                state.tokens_left = tokens;
            }
            self.restore(state);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BucketConfig;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn keyed_config(capacity: f64, key: &str) -> BucketConfig {
        BucketConfig {
            capacity,
            key: Some(key.to_string()),
            ..BucketConfig::default()
        }
    }

    /// Store that records the order of writes.
    #[derive(Default)]
    struct RecordingStore {
        writes: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StateStore for RecordingStore {
        async fn get(&self, _key: &str) -> anyhow::Result<Option<f64>> {
            Ok(None)
        }

        async fn set(&self, key: &str, _value: f64) -> anyhow::Result<()> {
            self.writes.lock().push(key.to_string());
            Ok(())
        }
    }

    /// Store whose operations always fail.
    struct FailingStore;

    #[async_trait]
    impl StateStore for FailingStore {
        async fn get(&self, _key: &str) -> anyhow::Result<Option<f64>> {
            Err(anyhow::anyhow!("backend offline"))
        }

        async fn set(&self, _key: &str, _value: f64) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("backend offline"))
        }
    }

    #[test]
    fn test_state_key_derivation() {
        let key = StateKey::new("api");
        assert_eq!(key.tokens_left(), "api:tokens_left");
        assert_eq!(key.last_refill(), "api:last_refill");
        assert_eq!(key.to_string(), "api");
    }

    #[tokio::test]
    async fn test_save_then_load_round_trips_exactly() {
        let store = MemoryStore::new();
        let bucket = Bucket::new(keyed_config(100.0, "api"));
        assert!(bucket.try_remove(37.5));
        assert_ok!(bucket.save(&store).await);

        let restored = Bucket::new(keyed_config(100.0, "api"));
        assert_ok!(restored.load(&store).await);
        assert_eq!(restored.snapshot(), bucket.snapshot());
    }

    #[tokio::test]
    async fn test_save_writes_ancestors_first() {
        let store = RecordingStore::default();
        let root = Arc::new(Bucket::new(keyed_config(100.0, "root")));
        let mid = Arc::new(Bucket::with_parent(
            keyed_config(50.0, "mid"),
            Arc::clone(&root),
        ));
        let leaf = Bucket::with_parent(keyed_config(10.0, "leaf"), Arc::clone(&mid));

        assert_ok!(leaf.save(&store).await);
        let writes = store.writes.lock();
        assert_eq!(
            *writes,
            vec![
                "root:last_refill",
                "root:tokens_left",
                "mid:last_refill",
                "mid:tokens_left",
                "leaf:last_refill",
                "leaf:tokens_left",
            ]
        );
    }

    #[tokio::test]
    async fn test_unkeyed_parent_is_skipped() {
        let store = MemoryStore::new();
        let parent = Arc::new(Bucket::new(BucketConfig {
            capacity: 100.0,
            ..BucketConfig::default()
        }));
        let child = Bucket::with_parent(keyed_config(10.0, "leaf"), parent);

        assert_ok!(child.save(&store).await);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_load_partial_miss_keeps_current_values() {
        let store = MemoryStore::new();
        store.values.insert("api:tokens_left".to_string(), 12.0);

        let bucket = Bucket::new(keyed_config(100.0, "api"));
        let before = bucket.snapshot();
        assert_ok!(bucket.load(&store).await);

        let after = bucket.snapshot();
        assert_eq!(after.tokens_left, 12.0);
        assert_eq!(after.last_refill_ms, before.last_refill_ms);
    }

    #[tokio::test]
    async fn test_missing_persistence_key_errors() {
        let store = MemoryStore::new();
        let bucket = Bucket::new(BucketConfig::default());

        let err = assert_err!(bucket.save(&store).await);
        assert!(matches!(err, CascadeError::NoPersistenceConfigured));
        let err = assert_err!(bucket.load(&store).await);
        assert!(matches!(err, CascadeError::NoPersistenceConfigured));
    }

    #[tokio::test]
    async fn test_store_errors_surface_verbatim() {
        let bucket = Bucket::new(keyed_config(100.0, "api"));

        let err = assert_err!(bucket.save(&FailingStore).await);
        assert!(matches!(err, CascadeError::Store(_)));
        assert!(err.to_string().contains("backend offline"));
    }
}
