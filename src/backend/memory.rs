//! Reference in-memory [`Backend`] implementation, storing entries in a
//! [`BTree`] directly rather than behind a generic map, so ordered scans,
//! range bounds, and min/max queries reuse the same structure the rest of
//! the crate is built on.

use std::rc::Rc;

use async_trait::async_trait;

use crate::btree::BTree;
use crate::error::Result;
use crate::key::{KeyComparator, KeyRange, Near};

use super::{Backend, BackendOp, FlushPayload};

pub struct MemoryBackend<K, V> {
    tree: BTree<K, V>,
    cmp: Rc<dyn KeyComparator<K>>,
}

impl<K, V> MemoryBackend<K, V>
where
    K: Clone,
    V: Clone,
{
    pub fn new(order: usize, cmp: Rc<dyn KeyComparator<K>>) -> Self {
        Self {
            tree: BTree::new(order, cmp.clone()),
            cmp,
        }
    }

    fn collect_range(&self, range: &KeyRange<K>) -> Vec<(K, V)> {
        let mut out = Vec::new();
        let mut iter = match range.lower() {
            Some((lower, _)) => self.tree.iter_from(lower, Near::GreaterOrEqual),
            None => self.tree.iter(),
        };
        for (k, v) in &mut iter {
            if let Some((upper, _)) = range.upper() {
                if self.cmp.compare(k, upper) == std::cmp::Ordering::Greater {
                    break;
                }
            }
            if range.contains(k, self.cmp.as_ref()) {
                out.push((k.clone(), v.clone()));
            }
        }
        out
    }
}

#[async_trait(?Send)]
impl<K, V> Backend<K, V> for MemoryBackend<K, V>
where
    K: Clone + 'static,
    V: Clone + 'static,
{
    async fn get(&self, key: &K) -> Result<Option<V>> {
        Ok(self.tree.get(key).cloned())
    }

    async fn put(&mut self, key: K, value: V) -> Result<()> {
        if self.tree.contains_key(&key) {
            self.tree.remove(&key);
        }
        self.tree.insert(key, value);
        Ok(())
    }

    async fn remove(&mut self, key: &K) -> Result<()> {
        self.tree.remove(key);
        Ok(())
    }

    async fn keys(&self, range: &KeyRange<K>) -> Result<Vec<K>> {
        Ok(self.collect_range(range).into_iter().map(|(k, _)| k).collect())
    }

    async fn values(&self, range: &KeyRange<K>) -> Result<Vec<V>> {
        Ok(self.collect_range(range).into_iter().map(|(_, v)| v).collect())
    }

    async fn key_stream(
        &self,
        range: &KeyRange<K>,
        ascending: bool,
        cb: &mut dyn FnMut(&K) -> bool,
    ) -> Result<()> {
        let mut entries = self.collect_range(range);
        if !ascending {
            entries.reverse();
        }
        for (k, _) in &entries {
            if !cb(k) {
                break;
            }
        }
        Ok(())
    }

    async fn value_stream(
        &self,
        range: &KeyRange<K>,
        ascending: bool,
        cb: &mut dyn FnMut(&K, &V) -> bool,
    ) -> Result<()> {
        let mut entries = self.collect_range(range);
        if !ascending {
            entries.reverse();
        }
        for (k, v) in &entries {
            if !cb(k, v) {
                break;
            }
        }
        Ok(())
    }

    async fn min_key(&self, range: &KeyRange<K>) -> Result<Option<K>> {
        Ok(self.collect_range(range).into_iter().next().map(|(k, _)| k))
    }

    async fn max_key(&self, range: &KeyRange<K>) -> Result<Option<K>> {
        Ok(self.collect_range(range).into_iter().last().map(|(k, _)| k))
    }

    async fn count(&self, range: &KeyRange<K>) -> Result<usize> {
        Ok(self.collect_range(range).len())
    }

    async fn truncate(&mut self) -> Result<()> {
        let keys: Vec<K> = self.tree.iter().map(|(k, _)| k.clone()).collect();
        for k in keys {
            self.tree.remove(&k);
        }
        Ok(())
    }

    async fn prepare_flush(&mut self, ops: Vec<BackendOp<K, V>>) -> Result<FlushPayload<K, V>> {
        for op in ops {
            match op {
                BackendOp::Put(k, v) => {
                    self.put(k, v).await?;
                }
                BackendOp::Remove(k) => {
                    self.remove(&k).await?;
                }
                BackendOp::Truncate => {
                    self.truncate().await?;
                }
            }
        }
        Ok(FlushPayload::Deferred(Box::new(|| Ok(()))))
    }

    fn is_synchronous(&self) -> bool {
        true
    }

    fn peek(&self, key: &K) -> Option<Option<V>> {
        Some(self.tree.get(key).cloned())
    }
}
