//! The contract a storage backend (persistent or in-memory) must satisfy.
//!
//! Persistent backends, codecs, and on-disk encodings are outside this
//! crate's scope; [`MemoryBackend`] is the one concrete implementation
//! shipped alongside the core so the rest of the crate has something real
//! to drive.

mod memory;

pub use memory::MemoryBackend;

use async_trait::async_trait;

use crate::error::Result;
use crate::key::KeyRange;

/// Either a native write batch a persistent backend can apply verbatim, or
/// a deferred closure an in-memory backend runs when the coordinator says
/// every combined-transaction member is ready.
pub enum FlushPayload<K, V> {
    Deferred(Box<dyn FnOnce() -> Result<()>>),
    Entries(Vec<BackendOp<K, V>>),
}

/// One write this transaction produced, for backends that apply changes as
/// a native batch rather than through a deferred closure.
pub enum BackendOp<K, V> {
    Put(K, V),
    Remove(K),
    Truncate,
}

/// The storage component behind one object store.
///
/// `?Send` because the crate's concurrency model is single-threaded
/// cooperative scheduling, not multi-threaded async (see the crate's
/// concurrency notes) — a suspended backend call never migrates executors.
#[async_trait(?Send)]
pub trait Backend<K, V> {
    async fn get(&self, key: &K) -> Result<Option<V>>;
    async fn put(&mut self, key: K, value: V) -> Result<()>;
    async fn remove(&mut self, key: &K) -> Result<()>;

    async fn keys(&self, range: &KeyRange<K>) -> Result<Vec<K>>;
    async fn values(&self, range: &KeyRange<K>) -> Result<Vec<V>>;

    /// Ordered scan; stops at the first callback returning `false`.
    async fn key_stream(
        &self,
        range: &KeyRange<K>,
        ascending: bool,
        cb: &mut dyn FnMut(&K) -> bool,
    ) -> Result<()>;
    async fn value_stream(
        &self,
        range: &KeyRange<K>,
        ascending: bool,
        cb: &mut dyn FnMut(&K, &V) -> bool,
    ) -> Result<()>;

    async fn min_key(&self, range: &KeyRange<K>) -> Result<Option<K>>;
    async fn max_key(&self, range: &KeyRange<K>) -> Result<Option<K>>;
    async fn count(&self, range: &KeyRange<K>) -> Result<usize>;

    async fn truncate(&mut self) -> Result<()>;

    /// Produces either a native batch payload or a deferred closure
    /// applying `ops`, for the combined-transaction coordinator's atomic
    /// flush (see [`crate::combined::CombinedTransaction`]).
    async fn prepare_flush(&mut self, ops: Vec<BackendOp<K, V>>) -> Result<FlushPayload<K, V>>;

    /// Whether reads resolve without suspension, enabling preload-caching
    /// transactions that never actually await the backend.
    fn is_synchronous(&self) -> bool;

    /// Synchronous point lookup, used by `put`/`remove` to capture
    /// `originalValues` without suspending (see the crate's concurrency
    /// notes: those operations are never suspension points). `Some(_)`
    /// reports a definitive answer; `None` means this backend cannot
    /// resolve the key without suspending, and the caller must have
    /// warmed the value via a prior `get` or treat it as a structural
    /// defect. Backends with `is_synchronous() == true` must always
    /// answer with `Some`.
    fn peek(&self, _key: &K) -> Option<Option<V>> {
        None
    }
}
