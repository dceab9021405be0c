//! Per-layer index deltas, shared by both transaction overlays and
//! committed-but-unflushed object store states.
//!
//! An [`IndexOverlay`] is "derived... from the parent's indices" (per the
//! data model): it never copies the parent's content, only the bindings
//! *this* layer added or cancelled. Composing a chain of overlays down to
//! the backend is the caller's job (see [`crate::object_store`]), since
//! only the object store knows the chain's shape.

use ahash::AHashSet;

use crate::error::Result;
use crate::index::{IndexConfig, IndexKind, InMemoryIndex};
use crate::index_key::{IndexKey, Indexable};
use crate::key::{natural, KeyRange};

/// One layer's worth of additions and cancellations against a single named
/// index.
pub struct IndexOverlay<K> {
    config: IndexConfig,
    order: usize,
    added: InMemoryIndex<K>,
    removed: AHashSet<(IndexKey, K)>,
}

impl<K> IndexOverlay<K>
where
    K: Clone + PartialEq + Eq + std::hash::Hash,
{
    pub fn new(config: IndexConfig, order: usize) -> Self {
        Self {
            added: InMemoryIndex::new(config.clone(), order),
            removed: AHashSet::default(),
            config,
            order,
        }
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Drops every recorded addition and cancellation, per `truncate()`'s
    /// "clear everything" semantics. Callers still ignore the parent chain
    /// for reads once a truncate has been recorded (see
    /// [`crate::object_store`]'s composition logic), independent of this.
    pub fn clear(&mut self) {
        self.added = InMemoryIndex::new(self.config.clone(), self.order);
        self.removed.clear();
    }

    /// Applies the effect of replacing `old` with `new` for `primary` on
    /// this index, recording only the net bindings this layer gained or
    /// lost. `check_unique` is called for each newly added attribute key so
    /// the caller can validate it against the full composed view (this
    /// layer alone cannot see the parent's bindings).
    pub fn apply_change(
        &mut self,
        primary: &K,
        old: Option<&dyn Indexable>,
        new: Option<&dyn Indexable>,
        mut check_unique: impl FnMut(&IndexKey, &K) -> Result<()>,
    ) -> Result<()> {
        let old_keys = old
            .and_then(|v| v.extract(&self.config.key_path))
            .map(|a| self.added.attribute_keys_for(a))
            .unwrap_or_default();
        let new_keys = new
            .and_then(|v| v.extract(&self.config.key_path))
            .map(|a| self.added.attribute_keys_for(a))
            .unwrap_or_default();

        let dropped: Vec<IndexKey> = old_keys.iter().filter(|k| !new_keys.contains(k)).cloned().collect();
        let gained: Vec<IndexKey> = new_keys.iter().filter(|k| !old_keys.contains(k)).cloned().collect();

        if self.config.kind == IndexKind::Unique {
            for key in &gained {
                check_unique(key, primary)?;
            }
        }

        for key in dropped {
            self.added.remove_binding(&key, primary);
            self.removed.insert((key, primary.clone()));
        }
        for key in gained {
            self.removed.remove(&(key.clone(), primary.clone()));
            self.added.insert_binding(key, primary.clone());
        }
        Ok(())
    }

    /// Primary keys this layer added within `range`, paired with the
    /// attribute they matched on.
    pub fn added_in_range(&self, range: &KeyRange<IndexKey>) -> Vec<(IndexKey, K)> {
        self.added.range_with_keys(range)
    }

    pub fn is_removed(&self, key: &IndexKey, primary: &K) -> bool {
        self.removed.contains(&(key.clone(), primary.clone()))
    }

    /// Bindings this layer cancelled within `range`, paired with the
    /// attribute they were cancelled at.
    pub fn removed_in_range(&self, range: &KeyRange<IndexKey>) -> Vec<(IndexKey, K)> {
        let cmp = natural::<IndexKey>();
        self.removed
            .iter()
            .filter(|(ik, _)| range.contains(ik, cmp.as_ref()))
            .cloned()
            .collect()
    }

    /// Folds `other` (a nested layer built directly on top of this one) into
    /// this overlay, so a mention in `other` always overrides whatever this
    /// overlay already recorded for the same `(attribute, primary)` pair.
    pub fn absorb(&mut self, other: IndexOverlay<K>) {
        for (key, primary) in other.removed_in_range(&KeyRange::everything()) {
            self.added.remove_binding(&key, &primary);
            self.removed.insert((key, primary));
        }
        for (key, primary) in other.added_in_range(&KeyRange::everything()) {
            self.removed.remove(&(key.clone(), primary.clone()));
            self.added.insert_binding(key, primary);
        }
    }
}
