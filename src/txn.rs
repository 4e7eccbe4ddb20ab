//! Transaction & lock surface ("Transaction", §4.3 undo ordering,
//! §4.5 commit lock, §7 propagation policy).
//!
//! This module owns the undo log and exposes the lock-manager *surface*
//! the core needs ("the lock manager's internals" are out of
//! scope; only acquire/release and timeout semantics are modeled here).
//! The leaf value engine and tree cursor push undo records through
//! [`UndoSink`] before any destructive step, per ordering rule:
//! `unextend`, then `unalloc`, then `unwrite`.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::RwLock;

use crate::error::{EngineError, LockFailure, Result};
use crate::node::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnId(pub u64);

/// Lock wait policy ("millis/nanos; -1 = infinite, 0 = never wait").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockTimeout {
    Infinite,
    Never,
    Millis(u64),
}

impl LockTimeout {
    pub fn to_duration(self) -> Option<Duration> {
        match self {
            LockTimeout::Infinite => None,
            LockTimeout::Never => Some(Duration::ZERO),
            LockTimeout::Millis(ms) => Some(Duration::from_millis(ms)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Upgradable,
    Exclusive,
}

/// The narrow surface this crate needs from a lock manager ("the
/// lock manager's internals (only its surface is used)"). A host process
/// supplies the concrete implementation; this crate never owns deadlock
/// detection or the key-lock table itself.
pub trait LockManager: Send + Sync {
    fn lock(&self, txn: TxnId, key: &[u8], mode: LockMode, timeout: LockTimeout) -> Result<()>;
    fn unlock(&self, txn: TxnId, key: &[u8]) -> Result<()>;
    fn unlock_all(&self, txn: TxnId) -> Result<()>;
}

/// Undo records, pushed before the corresponding destructive step so that
/// rollback is always possible. Ordering within one write is fixed:
/// `unextend` (old length, before growth), `unalloc`
/// (a range had no storage), `unwrite` (exact bytes about to be
/// overwritten) -- skipped when the write lands entirely in freshly
/// allocated region already covered by `unextend`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoEntry {
    /// `uncreate`: an entry was newly created where none existed.
    Uncreate { node: NodeId, key: Vec<u8> },
    /// `unupdate`: a full value replace; carries the prior bytes.
    Unupdate {
        node: NodeId,
        key: Vec<u8>,
        old_value: Vec<u8>,
    },
    /// `unextend`: the value's logical length grew; carries the old length.
    Unextend { node: NodeId, key: Vec<u8>, old_len: u64 },
    /// `unwrite`: a byte range is about to be overwritten; carries the
    /// exact prior bytes at that range.
    Unwrite {
        node: NodeId,
        key: Vec<u8>,
        pos: u64,
        old_bytes: Vec<u8>,
    },
    /// `unalloc`: a storage slice (page pointer) is about to transition
    /// from sparse (zero) to allocated.
    Unalloc {
        node: NodeId,
        key: Vec<u8>,
        slice_index: u64,
    },
}

/// Destination for undo pushes. Implemented by [`Transaction`]; the leaf
/// value engine and tree ops are generic over this trait so they can be
/// exercised without a full transaction manager in unit tests.
pub trait UndoSink {
    fn push(&mut self, entry: UndoEntry) -> Result<()>;
}

/// One transaction's undo log and commit/rollback state, as consumed by
/// the core ("Transaction"). `lock_owner` is the identity handed
/// to the [`LockManager`] surface.
pub struct Transaction<L: LockManager> {
    pub id: TxnId,
    lock_owner: TxnId,
    locks: RwLock<Vec<Vec<u8>>>,
    undo: VecDeque<UndoEntry>,
    lock_manager: std::sync::Arc<L>,
    committed: bool,
    rolled_back: bool,
}

impl<L: LockManager> Transaction<L> {
    pub fn begin(id: TxnId, lock_manager: std::sync::Arc<L>) -> Self {
        Self {
            id,
            lock_owner: id,
            locks: RwLock::new(Vec::new()),
            undo: VecDeque::new(),
            lock_manager,
            committed: false,
            rolled_back: false,
        }
    }

    pub fn lock(&self, key: &[u8], mode: LockMode, timeout: LockTimeout) -> Result<()> {
        self.lock_manager.lock(self.lock_owner, key, mode, timeout)?;
        self.locks.write().push(key.to_vec());
        Ok(())
    }

    /// Apply the undo log in reverse, restoring pre-transaction state. The
    /// caller (tree ops) supplies `apply` to actually mutate pages; this
    /// method only owns ordering and log bookkeeping.
    pub fn rollback<F: FnMut(&UndoEntry) -> Result<()>>(&mut self, mut apply: F) -> Result<()> {
        if self.committed {
            return Err(EngineError::constraint("cannot roll back a committed transaction"));
        }
        while let Some(entry) = self.undo.pop_back() {
            apply(&entry)?;
        }
        self.rolled_back = true;
        self.lock_manager.unlock_all(self.lock_owner)
    }

    pub fn commit(&mut self) -> Result<()> {
        if self.rolled_back {
            return Err(EngineError::constraint("cannot commit a rolled-back transaction"));
        }
        self.undo.clear();
        self.committed = true;
        self.lock_manager.unlock_all(self.lock_owner)
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }
}

impl<L: LockManager> UndoSink for Transaction<L> {
    fn push(&mut self, entry: UndoEntry) -> Result<()> {
        if self.committed || self.rolled_back {
            return Err(EngineError::constraint("transaction already finished"));
        }
        self.undo.push_back(entry);
        Ok(())
    }
}

/// The global commit lock: shared by writers,
/// exclusive by the checkpointer and tree-drop.
#[derive(Default)]
pub struct CommitLock {
    inner: parking_lot::RwLock<()>,
}

pub struct CommitGuardShared<'a>(parking_lot::RwLockReadGuard<'a, ()>);
pub struct CommitGuardExclusive<'a>(parking_lot::RwLockWriteGuard<'a, ()>);

impl CommitLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire_shared(&self) -> CommitGuardShared<'_> {
        CommitGuardShared(self.inner.read())
    }

    pub fn acquire_exclusive(&self) -> CommitGuardExclusive<'_> {
        CommitGuardExclusive(self.inner.write())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct NoopLockManager;
    impl LockManager for NoopLockManager {
        fn lock(&self, _txn: TxnId, _key: &[u8], _mode: LockMode, _timeout: LockTimeout) -> Result<()> {
            Ok(())
        }
        fn unlock(&self, _txn: TxnId, _key: &[u8]) -> Result<()> {
            Ok(())
        }
        fn unlock_all(&self, _txn: TxnId) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn rollback_applies_undo_in_reverse() {
        let mgr = Arc::new(NoopLockManager);
        let mut txn = Transaction::begin(TxnId(1), mgr);
        txn.push(UndoEntry::Uncreate {
                node: NodeId::new(1),
                key: b"a".to_vec(),
        })
            .unwrap();
        txn.push(UndoEntry::Unextend {
                node: NodeId::new(1),
                key: b"a".to_vec(),
                old_len: 3,
        })
            .unwrap();

        let mut seen = Vec::new();
        txn.rollback(|e| {
                seen.push(e.clone());
                Ok(())
        })
            .unwrap();
        assert_eq!(seen.len(), 2);
        assert!(matches!(seen[0], UndoEntry::Unextend {.. }));
        assert!(matches!(seen[1], UndoEntry::Uncreate {.. }));
    }

    #[test]
    fn commit_clears_undo_and_finishes_txn() {
        let mgr = Arc::new(NoopLockManager);
        let mut txn = Transaction::begin(TxnId(2), mgr);
        txn.push(UndoEntry::Uncreate {
                node: NodeId::new(1),
                key: b"a".to_vec(),
        })
            .unwrap();
        txn.commit().unwrap();
        assert!(txn.is_committed());
        assert!(txn.push(UndoEntry::Uncreate {
                    node: NodeId::new(1),
                    key: b"b".to_vec()
            })
            .is_err());
    }
}
