//! `lattice`: an embedded, transactional, ordered key-value storage engine
//! built around a concurrent, copy-on-write B+tree over a paged file.
//!
//! Module map: [`page`] is
//! the byte-level codec everything else builds on, [`node`] is the in-page
//! layout, [`leaf_value`] is the fragmented-value engine, [`cursor_frame`]
//! is the per-node cursor position list, [`tree`] is navigation and
//! structural operations, [`txn`] is the undo-log/lock surface, [`redo`] is
//! the replica-side replay engine, and [`hashtable`] is the small
//! long-keyed table the replay engine uses to track transactions and
//! cursors.

pub mod config;
pub mod cursor_frame;
pub mod error;
pub mod hashtable;
pub mod leaf_value;
pub mod node;
pub mod page;
pub mod redo;
pub mod tree;
pub mod txn;

pub use crate::config::{init_tracing, DatabaseConfig};
pub use crate::error::{EngineError, Result};
pub use crate::leaf_value::PageStore;
pub use crate::node::NodeId;
pub use crate::redo::{CursorId, IndexId, ReplicaEngine, ReplicationController};
pub use crate::tree::{NodeStore, TreeCursor};
pub use crate::txn::{LockManager, LockMode, LockTimeout, Transaction, TxnId};
