//! Tree cursor and structural operations: navigation, find,
//! insert with split-propagation, merge, and the parallel separator used
//! for bulk compaction / key-range splitting.
//!
//! Latching is top-down coupling ("Latching discipline"):
//! descending acquires the child's latch before releasing the parent's;
//! any structural change acquires an exclusive latch on the affected
//! subtree. The latch table here stands in for the page cache's real
//! per-node latches (the free-list/allocator and checkpoint
//! protocol are external collaborators; this crate only needs a narrow
//! "give me a latch for this node id" surface from them).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::cursor_frame::{self, FrameArena, FrameId, NodeFrameHead};
use crate::error::{EngineError, Result};
use crate::leaf_value;
use crate::node::{Node, NodeId, NodeType, SearchResult, EXTREMITY_HIGH, EXTREMITY_LOW};
use crate::page::compare_bytes;

/// Narrow surface onto page storage and allocation the tree needs; the
/// free-list/allocator is an external collaborator, not owned here.
pub trait NodeStore: Send + Sync {
    fn page_size(&self) -> usize;
    fn root(&self) -> NodeId;
    fn set_root(&mut self, id: NodeId);
    fn alloc_node(&mut self) -> Result<NodeId>;
    fn free_node(&mut self, id: NodeId) -> Result<()>;
    fn read_node(&self, id: NodeId) -> Result<Vec<u8>>;
    fn write_node(&mut self, id: NodeId, buf: &[u8]) -> Result<()>;
}

/// Per-node reader/writer latch table. Entries are
/// created lazily and never removed -- a node id is reused only after
/// the allocator frees and reallocates the page, by which point any
/// latch held against the old identity has long since been released.
#[derive(Default)]
pub struct LatchTable {
    latches: Mutex<HashMap<u64, Arc<RwLock<()>>>>,
    frame_heads: Mutex<HashMap<u64, Arc<NodeFrameHead>>>,
}

impl LatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn latch_for(&self, id: NodeId) -> Arc<RwLock<()>> {
        self.latches.lock().entry(id.0).or_insert_with(|| Arc::new(RwLock::new(()))).clone()
    }

    pub fn frame_head(&self, id: NodeId) -> Arc<NodeFrameHead> {
        self.frame_heads
            .lock()
            .entry(id.0)
            .or_insert_with(|| Arc::new(NodeFrameHead::new()))
            .clone()
    }
}


/// A cursor's path through the tree: one frame per level, root to leaf
/// ("Cursor frame").
pub struct TreeCursor<'s, S: NodeStore> {
    store: &'s mut S,
    latches: Arc<LatchTable>,
    arena: Arc<FrameArena>,
    path: Vec<FrameId>,
}

impl<'s, S: NodeStore> TreeCursor<'s, S> {
    pub fn new(store: &'s mut S, latches: Arc<LatchTable>, arena: Arc<FrameArena>) -> Self {
        Self {
            store,
            latches,
            arena,
            path: Vec::new(),
        }
    }

    fn unbind_path(&mut self) {
        for &frame in &self.path {
            if let Some(node) = self.arena.node_of(frame) {
                let head = self.latches.frame_head(node);
                let _ = cursor_frame::unbind(&self.arena, &head, frame);
            }
        }
        self.path.clear();
    }

    /// Descend from the root under shared latches, coupling down until the
    /// leaf ("Find"). Returns the leaf node id and the search
    /// result within it.
    pub fn find(&mut self, key: &[u8]) -> Result<(NodeId, SearchResult)> {
        self.unbind_path();
        let mut node_id = self.store.root();
        loop {
            let _lock = self.latches.latch_for(node_id);
            let _guard = _lock.read();
            let mut buf = self.store.read_node(node_id)?;
            let node = Node::from_buf(&mut buf)?;
            let result = node.search(key)?;
            let frame = self.arena.new_frame(self.path.last().copied());
            let pos_units = match result {
                SearchResult::Found(i) => i as u32 * 2,
                SearchResult::NotFound(i) => i as u32 * 2,
            };
            let head = self.latches.frame_head(node_id);
            cursor_frame::bind(&self.arena, &head, node_id, frame, pos_units)?;
            self.path.push(frame);

            if node.is_leaf()? {
                return Ok((node_id, result));
            }
            let child_idx = match result {
                SearchResult::Found(i) => i + 1,
                SearchResult::NotFound(i) => i,
            };
            node_id = self.internal_child(&node, child_idx)?;
        }
    }

    fn internal_child(&self, node: &Node, idx: usize) -> Result<NodeId> {
        // Internal entries store the child id as an 8-byte raw "value"
        // beside the separator key, reusing the leaf entry encoding so
        // node-level insert/delete/split code is shared between node
        // kinds (operates uniformly on "entries").
        let off = node.entry_offset(idx)? as usize;
        let (klen, n) = crate::page::decode_u32(&node.buf[off..])?;
        let value_off = off + n + klen as usize;
        let id = crate::page::read_u48(node.buf, value_off)?;
        Ok(NodeId::new(id))
    }

    pub fn leaf_frame(&self) -> Option<FrameId> {
        self.path.last().copied()
    }

    /// Insert `raw_entry` (pre-encoded key+value) into the leaf found by
    /// the last `find`, splitting and propagating upward as needed.
    pub fn insert(&mut self, key: &[u8], raw_entry: &[u8]) -> Result<()> {
        let (leaf_id, result) = self.find(key)?;
        let idx = match result {
            SearchResult::Found(i) => i,
            SearchResult::NotFound(i) => i,
        };

        let _lock = self.latches.latch_for(leaf_id);
        let _guard = _lock.write();
        let mut buf = self.store.read_node(leaf_id)?;
        let mut node = Node::from_buf(&mut buf)?;

        let replacing = matches!(result, SearchResult::Found(_));
        if replacing {
            node.delete_at(idx)?;
        }

        match node.insert_raw(idx, raw_entry) {
            Ok(()) => {
                self.store.write_node(leaf_id, &buf)?;
                let head = self.latches.frame_head(leaf_id);
                if !replacing {
                    cursor_frame::adjust_on_insert(&self.arena, &head, leaf_id, idx as u32);
                }
                Ok(())
            }
            Err(EngineError::Capacity(_)) => {
                drop(node);
                self.split_and_propagate(leaf_id, idx, raw_entry, &mut buf)
            }
            Err(e) => Err(e),
        }
    }

    fn split_and_propagate(&mut self, leaf_id: NodeId, insert_idx: usize, raw_entry: &[u8], buf: &mut Vec<u8>) -> Result<()> {
        let mut node = Node::from_buf(buf)?;
        let outcome = node.split()?;
        let left_count = node.entry_count()?;

        // decide which half the new entry belongs in.
        let goes_right = insert_idx > left_count;
        if goes_right {
            let mut right_buf = vec![0u8; self.store.page_size()];
            {
                let mut right = Node::init(&mut right_buf, NodeType::Leaf, 0)?;
                right.bulk_append(&outcome.right_entries)?;
                let local_idx = insert_idx - left_count;
                match right.insert_raw(local_idx, raw_entry) {
                    Ok(()) => {}
                    Err(_) => return Err(EngineError::capacity("entry too large even for a fresh leaf")),
                }
            }
            let right_id = self.store.alloc_node()?;
            self.store.write_node(right_id, &right_buf)?;
            self.store.write_node(leaf_id, buf.as_slice())?;
            self.propagate_split(leaf_id, right_id, outcome.split_key)
        } else {
            let fits = node.insert_raw(insert_idx, raw_entry);
            drop(node);
            fits?;
            let mut right_buf = vec![0u8; self.store.page_size()];
            {
                let mut right = Node::init(&mut right_buf, NodeType::Leaf, 0)?;
                right.bulk_append(&outcome.right_entries)?;
            }
            let right_id = self.store.alloc_node()?;
            self.store.write_node(right_id, &right_buf)?;
            self.store.write_node(leaf_id, buf.as_slice())?;
            self.propagate_split(leaf_id, right_id, outcome.split_key)
        }
    }

    /// Apply a leaf-value mutation to `key`'s current value, composing it
    /// with the node-level delete+reinsert a size change requires.
    /// `apply` receives the entry's current owned value bytes (header +
    /// body) plus the leaf's node id (for undo-log bookkeeping) and
    /// mutates the buffer in place -- typically via
    /// `leaf_value::write`/`set_length`, which is the entry point
    /// `leaf_value`'s module doc promises the tree cursor owns.
    ///
    /// `insert` finishes any split the reinsert triggers before returning,
    /// so the common case never loops more than once. If the grown entry
    /// still doesn't fit afterward -- e.g. a concurrent writer grew it
    /// again between the snapshot read above and this commit -- the whole
    /// operation restarts from `find`, since the leaf id and index read at
    /// the top of the loop are stale once a split has run (spec §4.3.1:
    /// "finish the split and restart the outer operation from the
    /// beginning").
    pub fn update_value(
        &mut self,
        key: &[u8],
        mut apply: impl FnMut(&mut Vec<u8>, NodeId) -> Result<()>,
    ) -> Result<()> {
        let mut attempts = 0u32;
        loop {
            let (leaf_id, result) = self.find(key)?;
            let idx = match result {
                SearchResult::Found(i) => i,
                SearchResult::NotFound(_) => {
                    return Err(EngineError::corruption("update_value: key not found"))
                }
            };

            let mut raw_value = {
                let lock = self.latches.latch_for(leaf_id);
                let _guard = lock.read();
                let mut buf = self.store.read_node(leaf_id)?;
                let node = Node::from_buf(&mut buf)?;
                node.value_bytes_at(idx)?
            };

            apply(&mut raw_value, leaf_id)?;
            let new_entry = Node::encode_raw_entry(key, &raw_value);

            match self.insert(key, &new_entry) {
                Ok(()) => return Ok(()),
                Err(EngineError::Capacity(_)) if attempts < 8 => {
                    attempts += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write `src` at logical `pos` in `key`'s value ([`leaf_value::write`]
    /// composed with the node-level splice-back).
    pub fn write_value(
        &mut self,
        key: &[u8],
        pager: &mut dyn leaf_value::PageStore,
        undo: &mut dyn crate::txn::UndoSink,
        pos: u64,
        src: leaf_value::WriteSource<'_>,
        max_fragmented_entry_size: usize,
    ) -> Result<()> {
        self.update_value(key, |raw, leaf_id| {
            leaf_value::write(raw, pager, undo, leaf_id, key, pos, src, max_fragmented_entry_size)
        })
    }

    /// Truncate or extend `key`'s value ([`leaf_value::set_length`]
    /// composed with the node-level splice-back).
    pub fn set_value_length(
        &mut self,
        key: &[u8],
        pager: &mut dyn leaf_value::PageStore,
        undo: &mut dyn crate::txn::UndoSink,
        new_len: u64,
        max_fragmented_entry_size: usize,
    ) -> Result<()> {
        self.update_value(key, |raw, leaf_id| {
            leaf_value::set_length(raw, pager, undo, leaf_id, key, new_len, max_fragmented_entry_size)
        })
    }

    /// Insert `(split_key -> right_id)` into the parent frame, splitting
    /// it in turn if necessary; a split at the root creates a new root one
    /// level higher.
    fn propagate_split(&mut self, left_id: NodeId, right_id: NodeId, split_key: Vec<u8>) -> Result<()> {
        let leaf_frame = self.path.pop();
        let parent_frame = leaf_frame.and_then(|f| self.arena.parent(f));
        let parent_node = parent_frame.and_then(|f| self.arena.node_of(f));

        let Some(parent_id) = parent_node else {
            return self.new_root(left_id, right_id, split_key);
        };

        let _lock = self.latches.latch_for(parent_id);
        let _guard = _lock.write();
        let mut pbuf = self.store.read_node(parent_id)?;
        let entry = internal_entry(&split_key, right_id);
        let idx = {
            let node = Node::from_buf(&mut pbuf)?;
            match node.search(&split_key)? {
                SearchResult::Found(i) | SearchResult::NotFound(i) => i,
            }
        };
        let mut node = Node::from_buf(&mut pbuf)?;
        match node.insert_raw(idx, &entry) {
            Ok(()) => {
                drop(node);
                self.store.write_node(parent_id, &pbuf)?;
                Ok(())
            }
            Err(EngineError::Capacity(_)) => {
                drop(node);
                self.path.push(parent_frame.unwrap());
                self.split_and_propagate(parent_id, idx, &entry, &mut pbuf)
            }
            Err(e) => Err(e),
        }
    }

    fn new_root(&mut self, left_id: NodeId, right_id: NodeId, split_key: Vec<u8>) -> Result<()> {
        let new_root_id = self.store.alloc_node()?;
        let mut buf = vec![0u8; self.store.page_size()];
        {
            let mut root = Node::init(&mut buf, NodeType::Internal, EXTREMITY_LOW | EXTREMITY_HIGH)?;
            let left_entry = internal_entry(&[], left_id);
            root.insert_raw(0, &left_entry)?;
            let right_entry = internal_entry(&split_key, right_id);
            root.insert_raw(1, &right_entry)?;
        }
        self.store.write_node(new_root_id, &buf)?;
        self.store.set_root(new_root_id);
        Ok(())
    }

    /// Merge `left_id` with its right neighbor under the parent's
    /// exclusive latch ("Merge policy").
    pub fn merge(&mut self, parent_id: NodeId, left_idx: usize, left_id: NodeId, right_id: NodeId) -> Result<()> {
        let _plock = self.latches.latch_for(parent_id);
        let _pguard = _plock.write();
        let _llock = self.latches.latch_for(left_id);
        let _lguard = _llock.write();
        let _rlock = self.latches.latch_for(right_id);
        let _rguard = _rlock.write();

        let mut left_buf = self.store.read_node(left_id)?;
        let right_buf = self.store.read_node(right_id)?;
        let right_count = {
            let right = Node::from_buf(&mut right_buf.clone())?;
            right.entry_count()?
        };

        let mut left = Node::from_buf(&mut left_buf)?;
        let left_live = left_buf.len() - left.free_space()? - left.garbage()? as usize - crate::node::HEADER_SIZE;
        drop(left);
        let right_live = {
            let mut rb = right_buf.clone();
            let r = Node::from_buf(&mut rb)?;
            rb.len() - r.free_space()? - r.garbage()? as usize - crate::node::HEADER_SIZE
        };

        let mergeable = {
            let left = Node::from_buf(&mut left_buf)?;
            left.can_merge_with(right_live, right_count)?
        };
        if !mergeable {
            return Err(EngineError::capacity("siblings do not fit merged"));
        }

        let right_entries = {
            let mut rb = right_buf.clone();
            let r = Node::from_buf(&mut rb)?;
            let mut entries = Vec::with_capacity(right_count);
            for i in 0..right_count {
                let off = r.entry_offset(i)? as usize;
                let (klen, n) = crate::page::decode_u32(&rb[off..])?;
                let (body_len, hlen) = leaf_value::peek_encoded_len(&rb[off + n + klen as usize..])?;
                let full = n + klen as usize + hlen + body_len;
                entries.push(rb[off..off + full].to_vec());
            }
            entries
        };

        {
            let mut left = Node::from_buf(&mut left_buf)?;
            let base = left.entry_count()?;
            left.bulk_append(&right_entries)?;
            let head = self.latches.frame_head(right_id);
            for (i, _) in right_entries.iter().enumerate() {
                cursor_frame::adjust_on_insert(&self.arena, &head, left_id, (base + i) as u32);
            }
        }
        let _ = left_live;

        self.store.write_node(left_id, &left_buf)?;
        self.store.free_node(right_id)?;

        let mut pbuf = self.store.read_node(parent_id)?;
        let mut parent = Node::from_buf(&mut pbuf)?;
        parent.delete_at(left_idx + 1)?;
        drop(parent);
        self.store.write_node(parent_id, &pbuf)?;
        Ok(())
    }
}

fn internal_entry(key: &[u8], child: NodeId) -> Vec<u8> {
    let mut out = crate::page::encode_u32(key.len() as u32);
    out.extend_from_slice(key);
    let mut ptr = [0u8; 6];
    crate::page::write_u48(&mut ptr, 0, child.0).expect("node id fits 48 bits");
    // internal child pointers are stored as a fixed 6-byte "value" using
    // the short-form value header so the shared node insert/delete code
    // handles both leaf and internal entries uniformly.
    out.push(6);
    out.extend_from_slice(&ptr);
    out
}

// --- parallel separator --------------------------------------------------

/// One (key, value, source-ordinal) item flowing through the separator's
/// min-heap merge ("Parallel separator"). Ordering is by key
/// first (min-heap via `Reverse`), then by source ordinal descending so
/// that on duplicate keys the later-numbered source naturally surfaces
/// first and wins.
#[derive(Eq, PartialEq)]
struct HeapItem {
    key: Vec<u8>,
    value: Vec<u8>,
    source: usize,
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match compare_bytes(&other.key, &self.key) {
            std::cmp::Ordering::Equal => self.source.cmp(&other.source),
            ord => ord,
        }
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub trait SourceCursor {
    /// Pull the next `(key, value)` pair from this source, in ascending
    /// key order, or `None` when exhausted.
    fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>>;
}

/// Shared cancellation signal: the sign bit of a spawn counter doubles
/// as a stop flag.
#[derive(Clone)]
pub struct SpawnCounter(Arc<AtomicI64>);

impl Default for SpawnCounter {
    fn default() -> Self {
        Self(Arc::new(AtomicI64::new(0)))
    }
}

impl SpawnCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.fetch_or(i64::MIN, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst) < 0
    }

    /// Try to claim one more spawn slot under `limit`; returns `true` if
    /// claimed.
    pub fn try_spawn(&self, limit: i64) -> bool {
        loop {
            let cur = self.0.load(Ordering::SeqCst);
            if cur < 0 || cur >= limit {
                return false;
            }
            if self
                .0
                .compare_exchange(cur, cur + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }
}

/// Merge multiple ordered sources, by key, into one ordered output,
/// resolving duplicate keys in favor of the later-numbered source: on a
/// duplicate the earlier source's entry is marked for deletion. Returns
/// the merged pairs plus the
/// (source, key) pairs that lost a duplicate and should be deleted from
/// their origin.
pub fn merge_sources(sources: &mut [Box<dyn SourceCursor>]) -> Result<(Vec<(Vec<u8>, Vec<u8>)>, Vec<(usize, Vec<u8>)>)> {
    let mut heap = BinaryHeap::new();
    for (i, src) in sources.iter_mut().enumerate() {
        if let Some((k, v)) = src.next()? {
            heap.push(HeapItem { key: k, value: v, source: i });
        }
    }

    let mut merged = Vec::new();
    let mut losers = Vec::new();

    while let Some(top) = heap.pop() {
        // pull every other item sharing this key off the heap so we can
        // pick the winner and mark the rest as losers.
        let mut group = vec![top];
        while let Some(peek) = heap.peek() {
            if peek.key == group[0].key {
                group.push(heap.pop().unwrap());
            } else {
                break;
            }
        }
        group.sort_by_key(|i| i.source);
        let winner = group.pop().unwrap();
        for loser in group {
            losers.push((loser.source, loser.key));
        }
        merged.push((winner.key, winner.value));
        if let Some((k, v)) = sources[winner.source].next()? {
            heap.push(HeapItem { key: k, value: v, source: winner.source });
        }
    }

    Ok((merged, losers))
}

/// A worker owning one disjoint key range of the parallel separator.
/// `run` drains its sources' entries inside `[low, high)`
/// and hands the merged result to `sink`; it may split its range at a
/// pivot key to spawn a sibling worker while `counter` still has budget.
pub struct SeparatorWorker {
    pub low: Option<Vec<u8>>,
    pub high: Option<Vec<u8>>,
    pub counter: SpawnCounter,
    pub max_workers: i64,
}

impl SeparatorWorker {
    fn in_range(&self, key: &[u8]) -> bool {
        if let Some(low) = &self.low {
            if compare_bytes(key, low) == std::cmp::Ordering::Less {
                return false;
            }
        }
        if let Some(high) = &self.high {
            if compare_bytes(key, high) != std::cmp::Ordering::Less {
                return false;
            }
        }
        true
    }

    /// Randomly choose a pivot among `candidate_keys` (already filtered to
    /// this worker's range) and, if spawn budget remains, split the range
    /// there: `self` keeps `[low, pivot)`, the returned sibling covers
    /// `[pivot, high)`.
    pub fn try_split(&mut self, candidate_keys: &[Vec<u8>], pivot_choice: usize) -> Option<SeparatorWorker> {
        if candidate_keys.len() < 2 || !self.counter.try_spawn(self.max_workers) {
            return None;
        }
        let pivot = candidate_keys[pivot_choice % candidate_keys.len()].clone();
        let sibling = SeparatorWorker {
            low: Some(pivot.clone()),
            high: self.high.clone(),
            counter: self.counter.clone(),
            max_workers: self.max_workers,
        };
        self.high = Some(pivot);
        Some(sibling)
    }

    pub fn run(
        &self,
        sources: &mut [Box<dyn SourceCursor>],
        mut sink: impl FnMut(&[u8], &[u8]) -> Result<()>,
        mut mark_deleted: impl FnMut(usize, &[u8]) -> Result<()>,
    ) -> Result<()> {
        let (merged, losers) = merge_sources(sources)?;
        for (k, v) in merged {
            if self.counter.is_stopped() {
                return Ok(());
            }
            if self.in_range(&k) {
                sink(&k, &v)?;
            }
        }
        for (src, key) in losers {
            if self.in_range(&key) {
                mark_deleted(src, &key)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    struct MemStore {
        page_size: usize,
        pages: Map<u64, Vec<u8>>,
        next_id: u64,
        root: NodeId,
    }

    impl MemStore {
        fn new(page_size: usize) -> Self {
            let mut s = Self {
                page_size,
                pages: Map::new(),
                next_id: 1,
                root: NodeId::NONE,
            };
            let root = s.alloc_node().unwrap();
            let mut buf = vec![0u8; page_size];
            Node::init(&mut buf, NodeType::Leaf, EXTREMITY_LOW | EXTREMITY_HIGH).unwrap();
            s.pages.insert(root.0, buf);
            s.root = root;
            s
        }
    }

    impl NodeStore for MemStore {
        fn page_size(&self) -> usize {
            self.page_size
        }
        fn root(&self) -> NodeId {
            self.root
        }
        fn set_root(&mut self, id: NodeId) {
            self.root = id;
        }
        fn alloc_node(&mut self) -> Result<NodeId> {
            let id = self.next_id;
            self.next_id += 1;
            self.pages.insert(id, vec![0u8; self.page_size]);
            Ok(NodeId::new(id))
        }
        fn free_node(&mut self, id: NodeId) -> Result<()> {
            self.pages.remove(&id.0);
            Ok(())
        }
        fn read_node(&self, id: NodeId) -> Result<Vec<u8>> {
            self.pages
                .get(&id.0)
                .cloned()
                .ok_or_else(|| EngineError::corruption("no such page"))
        }
        fn write_node(&mut self, id: NodeId, buf: &[u8]) -> Result<()> {
            self.pages.insert(id.0, buf.to_vec());
            Ok(())
        }
    }

    #[test]
    fn insert_then_find_roundtrip() {
        let mut store = MemStore::new(4096);
        let latches = Arc::new(LatchTable::new());
        let arena = Arc::new(FrameArena::new());
        let mut cursor = TreeCursor::new(&mut store, latches, arena);
        let entry = leaf_value::encode_entry(b"hello", b"world").unwrap();
        cursor.insert(b"hello", &entry).unwrap();
        let (_leaf, result) = cursor.find(b"hello").unwrap();
        assert!(matches!(result, SearchResult::Found(_)));
    }

    #[test]
    fn many_inserts_force_split_and_stay_searchable() {
        let mut store = MemStore::new(512);
        let latches = Arc::new(LatchTable::new());
        let arena = Arc::new(FrameArena::new());
        let mut cursor = TreeCursor::new(&mut store, latches, arena);
        for i in 0..40u32 {
            let key = format!("key{:04}", i).into_bytes();
            let entry = leaf_value::encode_entry(&key, b"v").unwrap();
            cursor.insert(&key, &entry).unwrap();
        }
        for i in 0..40u32 {
            let key = format!("key{:04}", i).into_bytes();
            let (_leaf, result) = cursor.find(&key).unwrap();
            assert!(matches!(result, SearchResult::Found(_)), "missing {i}");
        }
    }

    struct VecSource {
        items: Vec<(Vec<u8>, Vec<u8>)>,
        idx: usize,
    }
    impl SourceCursor for VecSource {
        fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
            if self.idx >= self.items.len() {
                return Ok(None);
            }
            let item = self.items[self.idx].clone();
            self.idx += 1;
            Ok(Some(item))
        }
    }

    struct MemPager {
        page_size: usize,
        next_id: u64,
        pages: Map<u64, Vec<u8>>,
    }

    impl MemPager {
        fn new(page_size: usize) -> Self {
            Self { page_size, next_id: 1000, pages: Map::new() }
        }
    }

    impl leaf_value::PageStore for MemPager {
        fn page_size(&self) -> usize {
            self.page_size
        }
        fn alloc_page(&mut self) -> Result<NodeId> {
            let id = self.next_id;
            self.next_id += 1;
            self.pages.insert(id, vec![0u8; self.page_size]);
            Ok(NodeId::new(id))
        }
        fn free_page(&mut self, id: NodeId) -> Result<()> {
            self.pages.remove(&id.0);
            Ok(())
        }
        fn read_page(&self, id: NodeId) -> Result<Vec<u8>> {
            Ok(self.pages.get(&id.0).cloned().unwrap_or_else(|| vec![0u8; self.page_size]))
        }
        fn write_page(&mut self, id: NodeId, data: &[u8]) -> Result<()> {
            self.pages.insert(id.0, data.to_vec());
            Ok(())
        }
    }

    struct VecUndo(Vec<crate::txn::UndoEntry>);
    impl crate::txn::UndoSink for VecUndo {
        fn push(&mut self, e: crate::txn::UndoEntry) -> Result<()> {
            self.0.push(e);
            Ok(())
        }
    }

    #[test]
    fn write_value_in_place_updates_without_split() {
        let mut store = MemStore::new(4096);
        let latches = Arc::new(LatchTable::new());
        let arena = Arc::new(FrameArena::new());
        let mut cursor = TreeCursor::new(&mut store, latches, arena);
        let entry = leaf_value::encode_entry(b"k", b"hello").unwrap();
        cursor.insert(b"k", &entry).unwrap();

        let mut pager = MemPager::new(4096);
        let mut undo = VecUndo(Vec::new());
        cursor
            .write_value(b"k", &mut pager, &mut undo, 0, leaf_value::WriteSource::Bytes(b"HELLO"), 512)
            .unwrap();

        let (leaf_id, result) = cursor.find(b"k").unwrap();
        let idx = match result {
            SearchResult::Found(i) => i,
            other => panic!("expected Found, got {other:?}"),
        };
        let raw_value = {
            let mut buf = store_read(&cursor, leaf_id);
            Node::from_buf(&mut buf).unwrap().value_bytes_at(idx).unwrap()
        };
        let mut readback = [0u8; 5];
        leaf_value::read(&raw_value, &pager, 0, &mut readback, 0, 5).unwrap();
        assert_eq!(&readback, b"HELLO");
    }

    fn store_read<S: NodeStore>(cursor: &TreeCursor<S>, id: NodeId) -> Vec<u8> {
        cursor.store.read_node(id).unwrap()
    }

    #[test]
    fn repeated_growth_forces_split_and_restarts_to_stay_correct() {
        // Each `insert` is a delete+reinsert at a fresh tail offset; the
        // deleted copy only becomes reclaimable garbage, not free space, so
        // enough updates to one key eventually overflow an otherwise
        // near-empty leaf and force a split the update must finish and
        // restart around.
        let mut store = MemStore::new(256);
        let latches = Arc::new(LatchTable::new());
        let arena = Arc::new(FrameArena::new());
        let mut cursor = TreeCursor::new(&mut store, latches, arena);

        for k in [b"a", b"b", b"c", b"d"] {
            let entry = leaf_value::encode_entry(k, b"v").unwrap();
            cursor.insert(k, &entry).unwrap();
        }

        let mut pager = MemPager::new(256);
        let mut undo = VecUndo(Vec::new());
        let mut last_payload = Vec::new();
        for round in 0..30u8 {
            let payload = vec![round; 20];
            cursor
                .write_value(b"b", &mut pager, &mut undo, 0, leaf_value::WriteSource::Bytes(&payload), 256)
                .unwrap();
            last_payload = payload;
        }

        for k in [b"a", b"b", b"c", b"d"] {
            let (_leaf, result) = cursor.find(k).unwrap();
            assert!(matches!(result, SearchResult::Found(_)), "missing {k:?} after split");
        }

        let (leaf_id, result) = cursor.find(b"b").unwrap();
        let idx = match result {
            SearchResult::Found(i) => i,
            other => panic!("expected Found, got {other:?}"),
        };
        let raw_value = {
            let mut buf = store_read(&cursor, leaf_id);
            Node::from_buf(&mut buf).unwrap().value_bytes_at(idx).unwrap()
        };
        assert_eq!(leaf_value::length(&raw_value).unwrap(), 20);
        let mut readback = vec![0u8; 20];
        leaf_value::read(&raw_value, &pager, 0, &mut readback, 0, 20).unwrap();
        assert_eq!(readback, last_payload);
    }

    #[test]
    fn set_value_length_extends_with_zeros() {
        let mut store = MemStore::new(4096);
        let latches = Arc::new(LatchTable::new());
        let arena = Arc::new(FrameArena::new());
        let mut cursor = TreeCursor::new(&mut store, latches, arena);
        let entry = leaf_value::encode_entry(b"k", b"abc").unwrap();
        cursor.insert(b"k", &entry).unwrap();

        let mut pager = MemPager::new(4096);
        let mut undo = VecUndo(Vec::new());
        cursor.set_value_length(b"k", &mut pager, &mut undo, 6, 512).unwrap();

        let (leaf_id, result) = cursor.find(b"k").unwrap();
        let idx = match result {
            SearchResult::Found(i) => i,
            other => panic!("expected Found, got {other:?}"),
        };
        let raw_value = {
            let mut buf = store_read(&cursor, leaf_id);
            Node::from_buf(&mut buf).unwrap().value_bytes_at(idx).unwrap()
        };
        assert_eq!(leaf_value::length(&raw_value).unwrap(), 6);
        let mut readback = [0u8; 6];
        leaf_value::read(&raw_value, &pager, 0, &mut readback, 0, 6).unwrap();
        assert_eq!(&readback[..3], b"abc");
        assert_eq!(&readback[3..], &[0u8; 3]);
    }

    #[test]
    fn merge_sources_prefers_later_source_on_duplicate() {
        let mut sources: Vec<Box<dyn SourceCursor>> = vec![
            Box::new(VecSource {
                    items: vec![(b"a".to_vec(), b"old".to_vec())],
                    idx: 0,
            }),
            Box::new(VecSource {
                    items: vec![(b"a".to_vec(), b"new".to_vec())],
                    idx: 0,
            }),
        ];
        let (merged, losers) = merge_sources(&mut sources).unwrap();
        assert_eq!(merged, vec![(b"a".to_vec(), b"new".to_vec())]);
        assert_eq!(losers, vec![(0, b"a".to_vec())]);
    }
}
