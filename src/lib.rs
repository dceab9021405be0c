//! An embeddable, transactional key-value store: named object stores, each
//! with its own secondary B+Tree indices, snapshot-isolated transactions
//! (including nested ones), and atomic commits spanning multiple stores at
//! once.
//!
//! Start with [`database::Database::open`] to get a database handle, create
//! one or more typed [`database::ObjectStore`]s from it, and open
//! [`transaction::Transaction`]s against them. Combine transactions from
//! several stores into one atomic unit with [`database::Database::begin_combined`].

mod backend;
mod btree;
mod combined;
mod database;
mod error;
mod index;
mod index_key;
mod key;
mod object_store;
mod overlay;
mod transaction;
mod watchdog;

pub use backend::{Backend, BackendOp, FlushPayload, MemoryBackend};
pub use btree::{BTree, ChangeSet, Cursor, NodeId, NodeSnapshot, TreeDump};
pub use combined::{CombinedTransaction, CombinedTransactionBuilder, CoordinatorId};
pub use database::{Database, DatabaseConfig, ObjectStore, ObjectStoreOptions};
pub use error::{Error, Result};
pub use index::{IndexConfig, IndexKind, InMemoryIndex, UpgradeCondition};
pub use index_key::{ExtractedAttribute, IndexKey, Indexable, KeyPath};
pub use key::{KeyComparator, KeyRange, Near, NaturalOrder};
pub use object_store::{TransactionState, TransactionSnapshot};
pub use transaction::Transaction;
