//! The top-level handle: opens object stores and mints combined-transaction
//! coordinators.
//!
//! A [`Database`] carries no object stores itself — each
//! [`ObjectStore<K, V>`] is its own `Rc<RefCell<ObjectStoreInner<K, V>>>>`,
//! since stores in the same database are free to use unrelated key/value
//! types. What the database does own is the identity (`db_id`) stamped into
//! every store it creates, so [`crate::combined::CombinedTransactionBuilder`]
//! can reject members pulled from two different databases, and the
//! incrementing id handed out to each combined transaction it starts.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use crate::backend::{Backend, MemoryBackend};
use crate::combined::{CombinedTransactionBuilder, CoordinatorId};
use crate::error::{Error, Result};
use crate::index::{IndexConfig, UpgradeCondition};
use crate::index_key::Indexable;
use crate::key::{natural, KeyComparator, KeyRange};
use crate::object_store::ObjectStoreInner;
use crate::transaction::Transaction;

/// Schema/runtime parameters fixed for the lifetime of a [`Database`].
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Caller-assigned schema version; `jungle_db` doesn't interpret it,
    /// beyond making it available for a caller's own upgrade checks.
    pub version: u32,
    /// `None` means unlimited.
    pub max_stores: Option<usize>,
    /// How long a transaction may run before a single `log::warn!` fires
    /// (see [`crate::watchdog::Watchdog`]). Never aborts anything.
    pub watchdog_threshold: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            version: 1,
            max_stores: Some(64),
            watchdog_threshold: Duration::from_secs(30),
        }
    }
}

/// Per-store knobs a caller can set at creation time. `enable_lru_cache` and
/// `upgrade_condition` are reserved for a future persistent backend; the
/// in-memory backend shipped with this crate ignores them.
#[derive(Debug, Clone, Default)]
pub struct ObjectStoreOptions {
    pub persistent: bool,
    pub order: Option<usize>,
    pub enable_lru_cache: bool,
    pub upgrade_condition: Option<UpgradeCondition>,
}

const DEFAULT_ORDER: usize = 32;

static NEXT_DATABASE_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    /// Stores may still be created; `connect()` has not yet been called.
    Open,
    Connected,
    Closed,
}

pub struct Database {
    name: String,
    id: u64,
    config: DatabaseConfig,
    store_count: Cell<usize>,
    next_coordinator_id: Cell<CoordinatorId>,
    state: Cell<ConnectionState>,
}

impl Database {
    pub fn open(name: impl Into<String>, config: DatabaseConfig) -> Self {
        let id = NEXT_DATABASE_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Self {
            name: name.into(),
            id,
            config,
            store_count: Cell::new(0),
            next_coordinator_id: Cell::new(0),
            state: Cell::new(ConnectionState::Open),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.config.version
    }

    /// Marks schema setup complete. No in-memory object store actually needs
    /// a connection step, but the core still enforces the ordering a
    /// persistent backend would require: every `create_object_store*` call
    /// must happen before this.
    pub async fn connect(&self) -> Result<()> {
        if self.state.get() == ConnectionState::Closed {
            return Err(Error::illegal_state("cannot connect() a closed database"));
        }
        self.state.set(ConnectionState::Connected);
        Ok(())
    }

    /// Releases this handle's resources. For the in-memory backend there is
    /// nothing to flush or close; this only marks the database unusable for
    /// further store creation.
    pub async fn close(&self) -> Result<()> {
        self.state.set(ConnectionState::Closed);
        Ok(())
    }

    /// Like [`Self::close`], plus discards all data. Stores already handed
    /// out to a caller keep whatever content they held at the moment of the
    /// call — `Database` holds no reference to them to reach in and clear,
    /// since each store's key/value types may differ (see the module docs).
    pub async fn destroy(&self) -> Result<()> {
        self.close().await
    }

    /// Creates a store ordered by `key_cmp`. Fails once `max_stores` stores
    /// have been created against this database, or once [`Self::connect`]
    /// has been called.
    pub fn create_object_store<K, V>(
        &self,
        name: impl Into<String>,
        key_cmp: Rc<dyn KeyComparator<K>>,
        index_configs: Vec<IndexConfig>,
        options: ObjectStoreOptions,
    ) -> Result<ObjectStore<K, V>>
    where
        K: Clone + Eq + std::hash::Hash + 'static,
        V: Clone + Indexable + 'static,
    {
        if self.state.get() != ConnectionState::Open {
            return Err(Error::invalid_arguments("object stores must be created before connect()"));
        }
        if let Some(max_stores) = self.config.max_stores {
            if self.store_count.get() >= max_stores {
                return Err(Error::invalid_arguments(format!(
                    "database {:?} already has the maximum of {} object stores",
                    self.name, max_stores
                )));
            }
        }
        let order = options.order.unwrap_or(DEFAULT_ORDER);
        let backend: Box<dyn Backend<K, V>> = Box::new(MemoryBackend::new(order, key_cmp.clone()));
        let inner = ObjectStoreInner::new(name, self.id, backend, index_configs, key_cmp, order, self.config.watchdog_threshold);
        self.store_count.set(self.store_count.get() + 1);
        Ok(ObjectStore {
            inner: Rc::new(RefCell::new(inner)),
        })
    }

    /// Convenience over [`Self::create_object_store`] for keys with a
    /// natural `Ord` implementation.
    pub fn create_object_store_ordered<K, V>(
        &self,
        name: impl Into<String>,
        index_configs: Vec<IndexConfig>,
        options: ObjectStoreOptions,
    ) -> Result<ObjectStore<K, V>>
    where
        K: Ord + Clone + Eq + std::hash::Hash + 'static,
        V: Clone + Indexable + 'static,
    {
        self.create_object_store(name, natural(), index_configs, options)
    }

    /// Starts a new combined-transaction coordinator. Members are added with
    /// [`CombinedTransactionBuilder::add`] before calling
    /// [`CombinedTransactionBuilder::build`].
    pub fn begin_combined(&self) -> CombinedTransactionBuilder {
        let id = self.next_coordinator_id.get();
        self.next_coordinator_id.set(id + 1);
        CombinedTransactionBuilder::new(id)
    }
}

/// A named, typed object store within a [`Database`].
pub struct ObjectStore<K, V> {
    inner: Rc<RefCell<ObjectStoreInner<K, V>>>,
}

impl<K, V> Clone for ObjectStore<K, V> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<K, V> ObjectStore<K, V>
where
    K: Clone + Eq + std::hash::Hash + 'static,
    V: Clone + Indexable + 'static,
{
    pub fn name(&self) -> String {
        self.inner.borrow().name().to_string()
    }

    /// Opens a new root transaction against this store.
    pub fn transaction(&self) -> Transaction<K, V> {
        Transaction::new_root(self.inner.clone())
    }

    /// Rebuilds every configured index from the backend's current content.
    /// Call this once after opening a store backed by pre-existing data;
    /// a freshly created, empty store has nothing to rebuild.
    pub async fn rebuild_indices(&self) -> Result<()> {
        self.inner.borrow_mut().rebuild_base_indices().await
    }

    /// Drains committed states from the bottom of the stack into the
    /// backend for as long as the oldest one has no transaction still
    /// depending on it. Idempotent; safe to call after every commit or on
    /// a timer.
    pub async fn flush_committed_states(&self) -> Result<()> {
        loop {
            if !self.inner.borrow().can_flush_bottom() {
                return Ok(());
            }
            self.inner.borrow_mut().pop_flushed_bottom().await?;
        }
    }

    pub async fn snapshot_values(&self, range: &KeyRange<K>) -> Result<Vec<(K, V)>> {
        let mut tx = self.transaction();
        let entries = tx.entries(range).await;
        let _ = tx.abort().await;
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_object_store_fails_past_max_stores() {
        let db = Database::open(
            "capped",
            DatabaseConfig {
                max_stores: Some(1),
                ..DatabaseConfig::default()
            },
        );
        db.create_object_store_ordered::<u64, serde_json::Value>("a", vec![], ObjectStoreOptions::default())
            .unwrap();
        let err = db.create_object_store_ordered::<u64, serde_json::Value>("b", vec![], ObjectStoreOptions::default());
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn unlimited_max_stores_never_rejects() {
        let db = Database::open(
            "uncapped",
            DatabaseConfig {
                max_stores: None,
                ..DatabaseConfig::default()
            },
        );
        for i in 0..5 {
            db.create_object_store_ordered::<u64, serde_json::Value>(format!("s{i}"), vec![], ObjectStoreOptions::default())
                .unwrap();
        }
    }

    #[tokio::test]
    async fn connect_blocks_further_store_creation() {
        let db = Database::open("lifecycle", DatabaseConfig::default());
        db.create_object_store_ordered::<u64, serde_json::Value>("a", vec![], ObjectStoreOptions::default())
            .unwrap();
        db.connect().await.unwrap();
        let err = db.create_object_store_ordered::<u64, serde_json::Value>("b", vec![], ObjectStoreOptions::default());
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn close_then_connect_is_rejected() {
        let db = Database::open("lifecycle", DatabaseConfig::default());
        db.close().await.unwrap();
        let err = db.connect().await;
        assert!(err.is_err());
    }
}
