//! Secondary indices over an object store's primary keys.
//!
//! An [`InMemoryIndex`] wraps a [`BTree`] keyed by extracted attribute,
//! mapping each attribute value to the primary keys that carry it.
//! [`IndexKind`] dispatches the three shapes the data model allows (unique,
//! multi-entry, plain non-unique) from one type rather than three separate
//! ones, since all three share the same storage and differ only in how an
//! attribute's primary-key list is maintained and validated.

use std::fmt;
use std::rc::Rc;

use crate::btree::BTree;
use crate::error::{Error, Result};
use crate::index_key::{ExtractedAttribute, IndexKey, Indexable, KeyPath};
use crate::key::{natural, KeyRange, Near};
use crate::overlay::IndexOverlay;

/// Whether an index should be (re)built on a schema version increase: either
/// unconditionally, or decided by a predicate over `(old_version,
/// new_version)`. The core only stores and evaluates this on request — it
/// never decides on its own when a version increase has happened, since that
/// lives in `Database`'s upgrade hook and persistent backends are out of
/// scope for this crate.
#[derive(Clone)]
pub enum UpgradeCondition {
    Always(bool),
    Predicate(Rc<dyn Fn(u32, u32) -> bool>),
}

impl UpgradeCondition {
    pub fn evaluate(&self, old_version: u32, new_version: u32) -> bool {
        match self {
            Self::Always(always) => *always,
            Self::Predicate(predicate) => predicate(old_version, new_version),
        }
    }
}

impl fmt::Debug for UpgradeCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always(always) => f.debug_tuple("Always").field(always).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// How an index resolves one extracted attribute against the primary keys
/// that share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// At most one primary key per attribute value; a second distinct
    /// primary key sharing a value fails.
    Unique,
    /// A `Sequence` attribute contributes one entry per element; a `Scalar`
    /// contributes one entry. Multiple primary keys may share a value.
    MultiEntry,
    /// One entry per `(attribute, primary key)` pair; scalar attributes
    /// only. Multiple primary keys may share a value.
    PlainNonUnique,
}

/// Configuration for one secondary index on an object store. `key_encoding`
/// and `upgrade_condition` are accepted and exposed for a persistent
/// backend's benefit but never interpreted by the core itself.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub name: String,
    pub key_path: KeyPath,
    pub kind: IndexKind,
    pub key_encoding: Option<String>,
    pub upgrade_condition: Option<UpgradeCondition>,
}

impl IndexConfig {
    pub fn unique(name: impl Into<String>, key_path: impl Into<KeyPath>) -> Self {
        Self::new(name, key_path, IndexKind::Unique)
    }

    pub fn multi_entry(name: impl Into<String>, key_path: impl Into<KeyPath>) -> Self {
        Self::new(name, key_path, IndexKind::MultiEntry)
    }

    pub fn plain(name: impl Into<String>, key_path: impl Into<KeyPath>) -> Self {
        Self::new(name, key_path, IndexKind::PlainNonUnique)
    }

    fn new(name: impl Into<String>, key_path: impl Into<KeyPath>, kind: IndexKind) -> Self {
        Self {
            name: name.into(),
            key_path: key_path.into(),
            kind,
            key_encoding: None,
            upgrade_condition: None,
        }
    }

    pub fn with_key_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.key_encoding = Some(encoding.into());
        self
    }

    pub fn with_upgrade_condition(mut self, condition: UpgradeCondition) -> Self {
        self.upgrade_condition = Some(condition);
        self
    }
}

/// The attribute keys one extracted value contributes under `kind`, shared
/// by [`InMemoryIndex::put`] and the transaction-overlay uniqueness probe in
/// [`crate::object_store`] (which needs the same mapping without owning an
/// [`InMemoryIndex`]).
///
/// Only a `multiEntry` index iterates a `Sequence` element-wise; every other
/// kind treats it as a single attribute, binding the whole array as one
/// `IndexKey::Composite`.
pub(crate) fn attribute_keys_for_kind(kind: IndexKind, attr: ExtractedAttribute) -> Vec<IndexKey> {
    match (kind, attr) {
        (IndexKind::MultiEntry, ExtractedAttribute::Sequence(keys)) => keys,
        (IndexKind::MultiEntry, ExtractedAttribute::Scalar(key)) => vec![key],
        (_, ExtractedAttribute::Scalar(key)) => vec![key],
        (_, ExtractedAttribute::Sequence(keys)) => vec![IndexKey::Composite(keys)],
    }
}

/// A secondary index, keyed by extracted attribute, holding the primary
/// keys of records that carry that attribute.
pub struct InMemoryIndex<P> {
    config: IndexConfig,
    tree: BTree<IndexKey, Vec<P>>,
}

impl<P> InMemoryIndex<P>
where
    P: Clone + PartialEq,
{
    pub fn new(config: IndexConfig, order: usize) -> Self {
        Self {
            config,
            tree: BTree::new(order, natural()),
        }
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn key_path(&self) -> &KeyPath {
        &self.config.key_path
    }

    pub fn kind(&self) -> IndexKind {
        self.config.kind
    }

    pub fn count(&self) -> usize {
        self.tree.iter().map(|(_, primaries)| primaries.len()).sum()
    }

    /// Drops every indexed binding, per `truncate()`'s "clear everything"
    /// semantics when a truncated state is folded into this base index.
    pub(crate) fn clear(&mut self) {
        self.tree = BTree::new(self.tree.order(), natural());
    }

    /// Permanently applies a flushed layer's overlay to this index: its
    /// cancellations are removed, its additions inserted. Uniqueness was
    /// already validated when the overlay's bindings were recorded, so this
    /// never re-checks it.
    pub(crate) fn absorb(&mut self, overlay: IndexOverlay<P>) {
        for (key, primary) in overlay.removed_in_range(&KeyRange::everything()) {
            self.remove_binding(&key, &primary);
        }
        for (key, primary) in overlay.added_in_range(&KeyRange::everything()) {
            self.insert_binding(key, primary);
        }
    }

    /// Indexes `value` under `primary`, applying this index's uniqueness
    /// and multi-entry rules. A value with no attribute at this index's
    /// path is simply not indexed (not an error).
    pub fn put(&mut self, primary: &P, value: &dyn Indexable) -> Result<()> {
        let Some(attr) = value.extract(&self.config.key_path) else {
            return Ok(());
        };
        let attribute_keys = self.attribute_keys_for(attr);

        if self.config.kind == IndexKind::Unique {
            for key in &attribute_keys {
                self.check_unique(key, primary)?;
            }
        }
        for key in attribute_keys {
            self.insert_binding(key, primary.clone());
        }
        Ok(())
    }

    /// Removes `primary` from every attribute entry `value` maps to.
    /// `value` must be the same value that was indexed by [`Self::put`].
    pub fn remove(&mut self, primary: &P, value: &dyn Indexable) {
        let Some(attr) = value.extract(&self.config.key_path) else {
            return;
        };
        for key in self.attribute_keys_for(attr) {
            self.remove_binding(&key, primary);
        }
    }

    /// Fails if `key` already maps to a primary other than `primary` and
    /// this index is [`IndexKind::Unique`].
    pub(crate) fn check_unique(&self, key: &IndexKey, primary: &P) -> Result<()> {
        if self.config.kind != IndexKind::Unique {
            return Ok(());
        }
        if let Some(existing) = self.tree.get(key) {
            if existing.iter().any(|p| p != primary) {
                return Err(Error::UniquenessViolation {
                    index_name: self.config.name.clone(),
                    key_path: self.config.key_path.clone(),
                });
            }
        }
        Ok(())
    }

    /// Records the single binding `key -> primary`, without re-checking
    /// uniqueness (callers that need the check call [`Self::check_unique`]
    /// first).
    pub(crate) fn insert_binding(&mut self, key: IndexKey, primary: P) {
        match self.tree.get(&key) {
            Some(existing) if existing.contains(&primary) => {}
            Some(existing) => {
                let mut updated = existing.clone();
                updated.push(primary);
                self.tree.remove(&key);
                self.tree.insert(key, updated);
            }
            None => {
                self.tree.insert(key, vec![primary]);
            }
        }
    }

    pub(crate) fn remove_binding(&mut self, key: &IndexKey, primary: &P) {
        if let Some(existing) = self.tree.get(key) {
            let mut remaining = existing.clone();
            remaining.retain(|p| p != primary);
            self.tree.remove(key);
            if !remaining.is_empty() {
                self.tree.insert(key.clone(), remaining);
            }
        }
    }

    pub(crate) fn attribute_keys_for(&self, attr: ExtractedAttribute) -> Vec<IndexKey> {
        attribute_keys_for_kind(self.config.kind, attr)
    }

    /// Primary keys for the exact attribute `key`, in insertion order.
    pub fn get(&self, key: &IndexKey) -> Vec<P> {
        self.tree.get(key).cloned().unwrap_or_default()
    }

    /// Primary keys whose attribute falls within `range`, in attribute
    /// order (and, within equal attributes, the order they were indexed).
    pub fn range(&self, range: &KeyRange<IndexKey>) -> Vec<P> {
        self.range_with_keys(range).into_iter().map(|(_, p)| p).collect()
    }

    /// Like [`Self::range`], but keeps the attribute each primary key
    /// matched on — needed by transaction overlays to cancel a specific
    /// `(attribute, primary)` binding rather than every binding of a
    /// primary key.
    pub fn range_with_keys(&self, range: &KeyRange<IndexKey>) -> Vec<(IndexKey, P)> {
        let cmp = natural::<IndexKey>();
        match range.lower() {
            Some((lower, _)) => {
                let mut out = Vec::new();
                for (key, primaries) in self.tree.iter_from(lower, Near::GreaterOrEqual) {
                    if let Some((upper, _)) = range.upper() {
                        if key > upper {
                            break;
                        }
                    }
                    if range.contains(key, cmp.as_ref()) {
                        out.extend(primaries.iter().cloned().map(|p| (key.clone(), p)));
                    }
                }
                out
            }
            None => self
                .tree
                .iter()
                .filter(|(k, _)| range.contains(k, cmp.as_ref()))
                .flat_map(|(k, primaries)| primaries.iter().cloned().map(move |p| (k.clone(), p)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unique_index_rejects_conflicting_primary() {
        let mut index = InMemoryIndex::<u64>::new(IndexConfig::unique("by_email", "email"), 4);
        let a = json!({"email": "a@example.com"});
        let b = json!({"email": "a@example.com"});
        index.put(&1, &a).unwrap();
        let err = index.put(&2, &b).unwrap_err();
        assert!(matches!(err, Error::UniquenessViolation { .. }));
    }

    #[test]
    fn unique_index_allows_reindexing_same_primary() {
        let mut index = InMemoryIndex::<u64>::new(IndexConfig::unique("by_email", "email"), 4);
        let a = json!({"email": "a@example.com"});
        index.put(&1, &a).unwrap();
        index.put(&1, &a).unwrap();
        assert_eq!(index.get(&IndexKey::Text("a@example.com".into())), vec![1]);
    }

    #[test]
    fn multi_entry_index_indexes_every_array_element() {
        let mut index = InMemoryIndex::<u64>::new(IndexConfig::multi_entry("by_tag", "tags"), 4);
        index.put(&1, &json!({"tags": ["rust", "db"]})).unwrap();
        index.put(&2, &json!({"tags": ["rust"]})).unwrap();
        let mut rust_holders = index.get(&IndexKey::Text("rust".into()));
        rust_holders.sort();
        assert_eq!(rust_holders, vec![1, 2]);
        assert_eq!(index.get(&IndexKey::Text("db".into())), vec![1]);
    }

    #[test]
    fn remove_drops_primary_and_then_the_empty_entry() {
        let mut index = InMemoryIndex::<u64>::new(IndexConfig::plain("by_status", "status"), 4);
        let value = json!({"status": "open"});
        index.put(&1, &value).unwrap();
        index.put(&2, &value).unwrap();
        index.remove(&1, &value);
        assert_eq!(index.get(&IndexKey::Text("open".into())), vec![2]);
        index.remove(&2, &value);
        assert_eq!(index.get(&IndexKey::Text("open".into())), Vec::<u64>::new());
        assert_eq!(index.count(), 0);
    }

    #[test]
    fn range_query_respects_bounds() {
        let mut index = InMemoryIndex::<u64>::new(IndexConfig::plain("by_score", "score"), 4);
        for (primary, score) in [(1u64, 10i64), (2, 20), (3, 30), (4, 40)] {
            index.put(&primary, &json!({"score": score})).unwrap();
        }
        let range = KeyRange::between(IndexKey::Int(15), false, IndexKey::Int(35), false);
        let mut hits = index.range(&range);
        hits.sort();
        assert_eq!(hits, vec![2, 3]);
    }

    #[test]
    fn missing_attribute_is_not_indexed() {
        let mut index = InMemoryIndex::<u64>::new(IndexConfig::unique("by_email", "email"), 4);
        index.put(&1, &json!({"name": "no email"})).unwrap();
        assert_eq!(index.count(), 0);
    }
}
