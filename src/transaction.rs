//! The public handle through which callers read and write one object
//! store's records inside a transaction.
//!
//! A [`Transaction`] is a thin, `Clone`-free handle: `{store, id}`. All the
//! actual delta bookkeeping lives in [`crate::object_store::ObjectStoreInner`],
//! addressed by `id`, so nesting a transaction never needs to clone or wrap
//! its parent — it just registers a new id against the same store.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::index_key::{IndexKey, Indexable};
use crate::key::KeyRange;
use crate::object_store::{Layer, ObjectStoreInner, TransactionId, TransactionSnapshot, TransactionState};

pub struct Transaction<K, V> {
    pub(crate) store: Rc<RefCell<ObjectStoreInner<K, V>>>,
    pub(crate) id: TransactionId,
    settled: bool,
}

impl<K, V> Transaction<K, V>
where
    K: Clone + Eq + std::hash::Hash + 'static,
    V: Clone + Indexable + 'static,
{
    pub(crate) fn new_root(store: Rc<RefCell<ObjectStoreInner<K, V>>>) -> Self {
        let id = store.borrow_mut().begin_root();
        Self { store, id, settled: false }
    }

    pub(crate) fn id(&self) -> TransactionId {
        self.id
    }

    pub fn store_name(&self) -> String {
        self.store.borrow().name().to_string()
    }

    pub fn db_id(&self) -> u64 {
        self.store.borrow().db_id()
    }

    /// Identity of the underlying store, for detecting two combined-
    /// transaction members that target the same store.
    pub(crate) fn store_ptr(&self) -> *const RefCell<ObjectStoreInner<K, V>> {
        Rc::as_ptr(&self.store)
    }

    pub(crate) fn is_outdated(&self) -> bool {
        self.store.borrow().is_outdated(self.id)
    }

    pub(crate) fn is_nested(&self) -> bool {
        self.store.borrow().tx(self.id).parent_tx.is_some()
    }

    /// Whether this member's backend never suspends, per the same-database
    /// construction check's in-memory exemption.
    pub(crate) fn backend_is_synchronous(&self) -> bool {
        self.store.borrow().is_backend_synchronous()
    }

    pub(crate) fn mark_conflicted(&mut self) {
        self.store.borrow_mut().mark_conflicted(self.id);
        self.settled = true;
    }

    pub(crate) fn set_dependency(&self, coordinator: u64) {
        self.store.borrow_mut().set_dependency(self.id, coordinator);
    }

    /// Consumes the handle without running its abort-on-drop, handing the
    /// bare `(store, id)` pair to a combined-transaction coordinator which
    /// takes over the commit/abort decision.
    pub(crate) fn detach(mut self) -> (Rc<RefCell<ObjectStoreInner<K, V>>>, TransactionId) {
        self.settled = true;
        (self.store.clone(), self.id)
    }

    fn layer(&self) -> Layer {
        Layer::Transaction(self.id)
    }

    fn watchdog_check(&self) {
        self.store.borrow_mut().watchdog_check(self.id);
    }

    /// Opens a child transaction nested inside this one. The parent is
    /// unusable for reads/writes of its own until the child settles (commits
    /// into the parent, or aborts).
    pub fn transaction(&self) -> Result<Transaction<K, V>> {
        let id = self.store.borrow_mut().begin_nested(self.id)?;
        Ok(Transaction {
            store: self.store.clone(),
            id,
            settled: false,
        })
    }

    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        self.watchdog_check();
        let store = self.store.borrow();
        store.get(self.layer(), key).await
    }

    pub async fn keys(&self, range: &KeyRange<K>) -> Result<Vec<K>> {
        self.watchdog_check();
        let store = self.store.borrow();
        Ok(store.range(self.layer(), range).await?.into_iter().map(|(k, _)| k).collect())
    }

    pub async fn values(&self, range: &KeyRange<K>) -> Result<Vec<V>> {
        self.watchdog_check();
        let store = self.store.borrow();
        Ok(store.range(self.layer(), range).await?.into_iter().map(|(_, v)| v).collect())
    }

    pub async fn entries(&self, range: &KeyRange<K>) -> Result<Vec<(K, V)>> {
        self.watchdog_check();
        let store = self.store.borrow();
        store.range(self.layer(), range).await
    }

    pub async fn min_key(&self, range: &KeyRange<K>) -> Result<Option<K>> {
        Ok(self.entries(range).await?.into_iter().next().map(|(k, _)| k))
    }

    pub async fn max_key(&self, range: &KeyRange<K>) -> Result<Option<K>> {
        Ok(self.entries(range).await?.into_iter().last().map(|(k, _)| k))
    }

    pub async fn count(&self, range: &KeyRange<K>) -> Result<usize> {
        Ok(self.entries(range).await?.len())
    }

    /// Ordered scan over keys visible through this transaction, composing
    /// parent results (unless truncated) with this transaction's own
    /// modified/removed deltas. Calls `cb` once per key, ascending or
    /// descending by the store's key comparator depending on `ascending`;
    /// stops at the first call that returns `false`.
    pub async fn key_stream(&self, range: &KeyRange<K>, ascending: bool, cb: &mut dyn FnMut(&K) -> bool) -> Result<()> {
        self.watchdog_check();
        let store = self.store.borrow();
        store.key_stream(self.layer(), range, ascending, cb).await
    }

    /// Like [`Self::key_stream`], but hands the callback both key and value.
    pub async fn value_stream(
        &self,
        range: &KeyRange<K>,
        ascending: bool,
        cb: &mut dyn FnMut(&K, &V) -> bool,
    ) -> Result<()> {
        self.watchdog_check();
        let store = self.store.borrow();
        store.value_stream(self.layer(), range, ascending, cb).await
    }

    /// Primary keys whose attribute on index `name` falls within `range`,
    /// as seen through this transaction's own overlay composed with its
    /// ancestry. Synchronous: index content is always resident in memory.
    pub fn index_range(&self, name: &str, range: &KeyRange<IndexKey>) -> Vec<K> {
        self.store.borrow().index_range(self.layer(), name, range)
    }

    pub fn index_get(&self, name: &str, key: IndexKey) -> Vec<K> {
        self.index_range(name, &KeyRange::exact(key))
    }

    pub fn index_min(&self, name: &str, range: &KeyRange<IndexKey>) -> Option<K> {
        self.store.borrow().index_min(self.layer(), name, range)
    }

    pub fn index_max(&self, name: &str, range: &KeyRange<IndexKey>) -> Option<K> {
        self.store.borrow().index_max(self.layer(), name, range)
    }

    pub fn index_count(&self, name: &str, range: &KeyRange<IndexKey>) -> usize {
        self.store.borrow().index_count(self.layer(), name, range)
    }

    /// Never suspends: `v_old` is resolved through `Backend::peek`, never
    /// through an awaited `get`.
    pub fn put(&mut self, key: K, value: V) -> Result<()> {
        self.store.borrow_mut().put(self.id, key, value)
    }

    pub fn remove(&mut self, key: &K) -> Result<()> {
        self.store.borrow_mut().remove(self.id, key)
    }

    pub fn truncate(&mut self) -> Result<()> {
        self.store.borrow_mut().truncate(self.id)
    }

    /// Commits this transaction. A root transaction becomes a new durable
    /// state on its store's stack and the stack's bottom is then drained for
    /// as long as it stays flushable; a nested transaction's deltas are
    /// folded into its still-open parent and nothing is flushed.
    ///
    /// Returns `Ok(true)` once committed. If a sibling transaction committed
    /// first against the same parent state, this transaction is marked
    /// `Conflicted` instead and `Ok(false)` is returned — it is not an
    /// error, just a lost race. Takes `&mut self` rather than consuming the
    /// handle so the caller can still call [`Self::state`] afterward to
    /// observe the outcome. Suspends while draining the flush.
    pub async fn commit(&mut self) -> Result<bool> {
        if self.settled {
            return Err(Error::illegal_state("transaction already settled"));
        }
        let is_nested = self.store.borrow().tx(self.id).parent_tx.is_some();
        if is_nested {
            if !self.store.borrow_mut().commit_nested(self.id)? {
                return Ok(false);
            }
        } else {
            let pushed = self.store.borrow_mut().commit_root(self.id)?;
            if pushed.is_none() {
                return Ok(false);
            }
            self.drain_flush().await?;
        }
        self.settled = true;
        Ok(true)
    }

    /// Aborts this transaction. Per the store's abort rule, if this was the
    /// last dependent on the oldest state on the stack, that state's flush is
    /// retried; idempotent, always succeeds. Takes `&mut self` for symmetry
    /// with [`Self::commit`]. Suspends while draining the flush.
    pub async fn abort(&mut self) -> Result<()> {
        if self.settled {
            return Err(Error::illegal_state("transaction already settled"));
        }
        self.store.borrow_mut().abort(self.id)?;
        self.drain_flush().await?;
        self.settled = true;
        Ok(())
    }

    /// Pops the stack's bottom state into the backend for as long as it
    /// stays flushable. Shared by `commit`/`abort`'s "attempt to flush"
    /// step; [`Drop`] cannot await this, so a dropped-without-settling
    /// transaction leaves flushing to the next explicit commit/abort or to
    /// [`crate::database::ObjectStore::flush_committed_states`].
    async fn drain_flush(&self) -> Result<()> {
        loop {
            if !self.store.borrow().can_flush_bottom() {
                return Ok(());
            }
            self.store.borrow_mut().pop_flushed_bottom().await?;
        }
    }

    pub fn state(&self) -> TransactionState {
        self.store.borrow().tx(self.id).state
    }

    /// A read-only copy of this transaction's own overlay — just what this
    /// transaction has itself written, not the composed view its reads
    /// resolve through. Useful for inspecting pending writes without
    /// touching the backend.
    pub fn snapshot(&self) -> TransactionSnapshot<K, V> {
        let store = self.store.borrow();
        let tx = store.tx(self.id);
        TransactionSnapshot {
            modified: tx.modified.clone(),
            removed: tx.removed.clone(),
            truncated: tx.truncated,
        }
    }
}

impl<K, V> Drop for Transaction<K, V>
where
    K: Clone + Eq + std::hash::Hash + 'static,
    V: Clone + Indexable + 'static,
{
    /// An unsettled transaction that is simply dropped aborts, mirroring
    /// "a transaction that goes out of scope without commit/abort rolls
    /// back" rather than leaking a half-open transaction on the store.
    fn drop(&mut self) {
        if !self.settled {
            let _ = self.store.borrow_mut().abort(self.id);
        }
    }
}
