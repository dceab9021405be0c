//! Cross-store atomic commits.
//!
//! A [`CombinedTransaction`] owns one root transaction per participating
//! store and settles them as a single unit. Committing pushes every
//! member's deltas onto its own store's state stack exactly like a solo
//! root commit (see [`crate::object_store::ObjectStoreInner::commit_combined`]),
//! but each pushed state carries a shared readiness gate: no member's state
//! is allowed to flush into its backend until every sibling member is
//! *also* the flushable bottom of its own stack. Members may come from
//! stores with unrelated key/value types, so they're held as type-erased
//! [`CombinedMember`] trait objects rather than in one homogeneous `Vec`.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::index_key::Indexable;
use crate::object_store::{ObjectStoreInner, ReadyGate, StateId, TransactionId, TransactionState};
use crate::transaction::Transaction;

pub type CoordinatorId = u64;

#[async_trait(?Send)]
trait CombinedMember {
    fn is_outdated(&self) -> bool;
    /// Pushes this member's transaction as a new state on its own store's
    /// stack, stamped with `ready`. Takes `&self`: the pushed state id is
    /// recorded in interior-mutable storage so every member can be pushed
    /// through a single shared `Rc`, which the gate closure also needs to
    /// hold onto.
    fn commit_push(&self, ready: ReadyGate) -> Result<()>;
    /// Whether the state this member pushed is currently its own store's
    /// flushable bottom, ignoring the gate (the gate itself is built from
    /// this method across every member — it must not call back into
    /// `can_flush_bottom`, which would recurse into the gate it's deciding).
    fn state_is_flushable(&self) -> bool;
    /// Drains this member's own store for as long as it stays flushable.
    /// A no-op until every sibling member is also ready.
    async fn drain_flush(&self) -> Result<()>;
    fn mark_conflicted(&mut self);
    fn abort(&mut self) -> Result<()>;
    fn set_dependency(&mut self, coordinator: CoordinatorId);
}

struct Member<K, V> {
    store: Rc<RefCell<ObjectStoreInner<K, V>>>,
    id: TransactionId,
    pushed: Cell<Option<StateId>>,
}

#[async_trait(?Send)]
impl<K, V> CombinedMember for Member<K, V>
where
    K: Clone + Eq + std::hash::Hash + 'static,
    V: Clone + Indexable + 'static,
{
    fn is_outdated(&self) -> bool {
        self.store.borrow().is_outdated(self.id)
    }

    fn commit_push(&self, ready: ReadyGate) -> Result<()> {
        let sid = self.store.borrow_mut().commit_combined(self.id, Some(ready))?;
        self.pushed.set(Some(sid));
        Ok(())
    }

    fn state_is_flushable(&self) -> bool {
        match self.pushed.get() {
            Some(sid) => self.store.borrow().state_is_flushable(sid),
            None => false,
        }
    }

    async fn drain_flush(&self) -> Result<()> {
        loop {
            if !self.store.borrow().can_flush_bottom() {
                return Ok(());
            }
            self.store.borrow_mut().pop_flushed_bottom().await?;
        }
    }

    fn mark_conflicted(&mut self) {
        self.store.borrow_mut().mark_conflicted(self.id);
    }

    fn abort(&mut self) -> Result<()> {
        self.store.borrow_mut().abort(self.id)
    }

    fn set_dependency(&mut self, coordinator: CoordinatorId) {
        self.store.borrow_mut().set_dependency(self.id, coordinator);
    }
}

/// Accumulates member transactions and validates them against each other
/// before they can be combined: every member must be an open, non-nested
/// root transaction; no two members may target the same store; all
/// members must belong to the same database.
pub struct CombinedTransactionBuilder {
    id: CoordinatorId,
    db_id: Option<u64>,
    store_ptrs: Vec<usize>,
    members: Vec<Box<dyn CombinedMember>>,
}

impl CombinedTransactionBuilder {
    pub fn new(id: CoordinatorId) -> Self {
        Self {
            id,
            db_id: None,
            store_ptrs: Vec::new(),
            members: Vec::new(),
        }
    }

    /// Adds one store's root transaction as a member. Consumes `tx`: once
    /// added, the member is only reachable through the built
    /// [`CombinedTransaction`].
    pub fn add<K, V>(&mut self, tx: Transaction<K, V>) -> Result<()>
    where
        K: Clone + Eq + std::hash::Hash + 'static,
        V: Clone + Indexable + 'static,
    {
        if !matches!(tx.state(), TransactionState::Open) {
            return Err(Error::invalid_arguments("combined transaction members must be OPEN"));
        }
        if tx.is_nested() {
            return Err(Error::invalid_arguments("combined transaction members must not be nested"));
        }
        // In-memory-backed members never round-trip through a real commit
        // log, so two combined transactions can't actually observe each
        // other's database identity; only durable members are held to the
        // same-database rule.
        if !tx.backend_is_synchronous() {
            match self.db_id {
                Some(db_id) if db_id != tx.db_id() => {
                    return Err(Error::invalid_arguments("combined transaction members must share one database"));
                }
                _ => self.db_id = Some(tx.db_id()),
            }
        }
        let ptr = tx.store_ptr() as usize;
        if self.store_ptrs.contains(&ptr) {
            return Err(Error::invalid_arguments("combined transaction has two members on the same store"));
        }
        self.store_ptrs.push(ptr);

        tx.set_dependency(self.id);
        let (store, id) = tx.detach();
        self.members.push(Box::new(Member {
            store,
            id,
            pushed: Cell::new(None),
        }));
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn build(self) -> Result<CombinedTransaction> {
        if self.members.is_empty() {
            return Err(Error::invalid_arguments("combined transaction requires at least one member"));
        }
        Ok(CombinedTransaction {
            id: self.id,
            members: self.members,
        })
    }
}

/// A validated set of member transactions ready to be committed, or
/// aborted, atomically.
pub struct CombinedTransaction {
    id: CoordinatorId,
    members: Vec<Box<dyn CombinedMember>>,
}

impl CombinedTransaction {
    pub fn id(&self) -> CoordinatorId {
        self.id
    }

    /// Commits every member, or none: if any member's store has advanced
    /// past the state the member was built on, every member is marked
    /// `Conflicted` and `Ok(false)` is returned without touching any
    /// backend — a lost race, not an error. Otherwise every member pushes
    /// its state with a shared readiness gate, `Ok(true)` is returned, and
    /// every member's store attempts to drain its stack — a member whose
    /// push isn't yet its store's flushable bottom (an older dependent is
    /// still open) stays pushed-but-unflushed until that dependent settles
    /// and some later drain (a commit, an abort, or
    /// [`crate::database::ObjectStore::flush_committed_states`]) rechecks
    /// the gate.
    pub async fn commit(mut self) -> Result<bool> {
        if self.members.iter().any(|m| m.is_outdated()) {
            for member in self.members.iter_mut() {
                member.mark_conflicted();
            }
            return Ok(false);
        }

        let members = Rc::new(self.members);
        let gate_members = members.clone();
        let gate: ReadyGate = Rc::new(move || gate_members.iter().all(|m| m.state_is_flushable()));

        for member in members.iter() {
            member.commit_push(gate.clone())?;
        }
        for member in members.iter() {
            member.drain_flush().await?;
        }
        Ok(true)
    }

    pub fn abort(mut self) {
        for member in self.members.iter_mut() {
            let _ = member.abort();
        }
    }

    /// Unions two coordinators into one, the way a caller ends up with a
    /// single combined transaction after separately building up members
    /// from two different code paths. The surviving id is the smaller of
    /// the two — a plain union-find over coordinator ids — and every
    /// member, from both sides, is re-pointed to it.
    pub fn merge(mut self, mut other: CombinedTransaction) -> CombinedTransaction {
        let winner = self.id.min(other.id);
        for member in self.members.iter_mut().chain(other.members.iter_mut()) {
            member.set_dependency(winner);
        }
        self.members.append(&mut other.members);
        CombinedTransaction {
            id: winner,
            members: self.members,
        }
    }
}
