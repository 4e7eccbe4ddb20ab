//! Node: the in-page layout shared by leaf and internal
//! tree nodes, plus the structural operations (search, insert/delete,
//! split, merge, compaction) that the tree cursor drives.
//!
//! Layout mirrors `LeafPage`/`InternalPage` split-header
//! design, generalized to a search-vector-plus-two-tails
//! model: a node's free region sits between `searchVecEnd` (growing toward
//! higher offsets as entries are appended) and `leftSegTail`/`rightSegTail`
//! (the two ends of the key/value tail area, growing toward lower offsets).
//!
//! Entry encoding (value header forms, ghost tombstones, fragmented bit)
//! lives in [`crate::leaf_value`]; this module only knows how to find an
//! entry's byte range within the page and how to move whole entries around
//! during split/merge/compaction.

use crate::error::{EngineError, Result};
use crate::page::{compare_bytes, mid_key, read_u16, read_u8, write_u16, write_u8};

/// 48-bit page identifier. A thin wrapper rather than a bare
/// `u64` so call sites can't accidentally pass an arbitrary integer where a
/// page id is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u64);

impl NodeId {
    pub const NONE: NodeId = NodeId(0);

    pub fn new(id: u64) -> Self {
        debug_assert!(id < (1u64 << 48), "page id exceeds 48 bits: {id}");
        Self(id)
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Node header layout, little-endian, offsets in bytes.
const HDR_TYPE: usize = 0;
const HDR_FLAGS: usize = 1;
const HDR_LEFT_SEG_TAIL: usize = 2;
const HDR_RIGHT_SEG_TAIL: usize = 4;
const HDR_SEARCH_VEC_START: usize = 6;
const HDR_SEARCH_VEC_END: usize = 8;
const HDR_GARBAGE: usize = 10;
pub(crate) const HEADER_SIZE: usize = 12;

const SLOT_SIZE: usize = 2;

pub const EXTREMITY_LOW: u8 = 0x01;
pub const EXTREMITY_HIGH: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Internal,
    Leaf,
    Stub,
    /// Sentinel marking a tree that has been dropped/closed; navigation
    /// into a stub node is always an error ("closed-tree sentinel").
    ClosedTree,
}

impl NodeType {
    fn to_byte(self) -> u8 {
        match self {
            NodeType::Internal => 0,
            NodeType::Leaf => 1,
            NodeType::Stub => 2,
            NodeType::ClosedTree => 3,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(NodeType::Internal),
            1 => Ok(NodeType::Leaf),
            2 => Ok(NodeType::Stub),
            3 => Ok(NodeType::ClosedTree),
            other => Err(EngineError::corruption(format!("bad node type byte {other}"))),
        }
    }
}

/// A tree node's page buffer, addressed by the layout in ///
/// `Node` borrows the page for the duration of an operation; the caller
/// (tree cursor) is responsible for holding the node's latch across that
/// borrow ("Latching discipline").
pub struct Node<'a> {
    pub buf: &'a mut [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot(pub u16);

/// Result of a binary search: either the exact slot holding `key`, or the
/// insertion point that keeps the search vector sorted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    Found(usize),
    NotFound(usize),
}

/// What a split produced: the new sibling's id is supplied by the caller
/// (the allocator lives outside this crate's scope); this just
/// returns the separator key and which entries moved.
pub struct SplitOutcome {
    pub split_key: Vec<u8>,
    /// Serialized entries (raw bytes, as stored in the tail area) that
    /// belong in the new right sibling, in order.
    pub right_entries: Vec<Vec<u8>>,
}

impl<'a> Node<'a> {
    pub fn init(buf: &'a mut [u8], node_type: NodeType, extremity: u8) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(EngineError::corruption("page too small for node header"));
        }
        if buf.len() > u16::MAX as usize {
            return Err(EngineError::corruption("page too large for u16 offsets"));
        }
        write_u8(buf, HDR_TYPE, node_type.to_byte())?;
        write_u8(buf, HDR_FLAGS, extremity)?;
        let len = buf.len() as u16;
        write_u16(buf, HDR_LEFT_SEG_TAIL, HEADER_SIZE as u16)?;
        write_u16(buf, HDR_RIGHT_SEG_TAIL, len)?;
        write_u16(buf, HDR_SEARCH_VEC_START, HEADER_SIZE as u16)?;
        write_u16(buf, HDR_SEARCH_VEC_END, HEADER_SIZE as u16)?;
        write_u16(buf, HDR_GARBAGE, 0)?;
        Ok(Self { buf })
    }

    pub fn from_buf(buf: &'a mut [u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(EngineError::corruption("page too small for node header"));
        }
        Ok(Self { buf })
    }

    pub fn node_type(&self) -> Result<NodeType> {
        NodeType::from_byte(read_u8(self.buf, HDR_TYPE)?)
    }

    pub fn is_leaf(&self) -> Result<bool> {
        Ok(matches!(self.node_type()?, NodeType::Leaf))
    }

    pub fn extremity(&self) -> Result<u8> {
        read_u8(self.buf, HDR_FLAGS)
    }

    pub fn is_low_extremity(&self) -> Result<bool> {
        Ok(self.extremity()? & EXTREMITY_LOW != 0)
    }

    pub fn is_high_extremity(&self) -> Result<bool> {
        Ok(self.extremity()? & EXTREMITY_HIGH != 0)
    }

    fn search_vec_start(&self) -> Result<u16> {
        read_u16(self.buf, HDR_SEARCH_VEC_START)
    }

    fn search_vec_end(&self) -> Result<u16> {
        read_u16(self.buf, HDR_SEARCH_VEC_END)
    }

    pub fn entry_count(&self) -> Result<usize> {
        Ok(((self.search_vec_end()? - self.search_vec_start()?) as usize) / SLOT_SIZE)
    }

    pub fn garbage(&self) -> Result<u16> {
        read_u16(self.buf, HDR_GARBAGE)
    }

    fn left_seg_tail(&self) -> Result<u16> {
        read_u16(self.buf, HDR_LEFT_SEG_TAIL)
    }

    fn right_seg_tail(&self) -> Result<u16> {
        read_u16(self.buf, HDR_RIGHT_SEG_TAIL)
    }

    /// Free bytes between the search vector and the tail area.
    pub fn free_space(&self) -> Result<usize> {
        let entries_end = self.search_vec_end()? as usize + SLOT_SIZE; // room for one more slot
        let tail_start = self.left_seg_tail()? as usize;
        let tail_end = self.right_seg_tail()? as usize;
        let internal_gap = tail_start.saturating_sub(entries_end.min(tail_start));
        let _ = internal_gap;
        Ok(tail_end.saturating_sub(entries_end.max(tail_start)))
    }

    fn slot_offset(&self, idx: usize) -> Result<u16> {
        let pos = self.search_vec_start()? as usize + idx * SLOT_SIZE;
        read_u16(self.buf, pos)
    }

    fn entry_key<'b>(buf: &'b [u8], entry_off: u16) -> Result<(&'b [u8], usize)> {
        let off = entry_off as usize;
        let (klen, n) = crate::page::decode_u32(&buf[off..])?;
        let klen = klen as usize;
        let key_start = off + n;
        let key_end = key_start
            .checked_add(klen)
            .ok_or_else(|| EngineError::corruption("key length overflow"))?;
        if key_end > buf.len() {
            return Err(EngineError::corruption("key runs past page end"));
        }
        Ok((&buf[key_start..key_end], key_end - off))
    }

    pub fn key_at(&self, idx: usize) -> Result<&[u8]> {
        let off = self.slot_offset(idx)?;
        Ok(Self::entry_key(self.buf, off)?.0)
    }

    pub fn entry_offset(&self, idx: usize) -> Result<u16> {
        self.slot_offset(idx)
    }

    /// Full value bytes (header + body, fragmented pointer structure
    /// included as-is) for the entry at `idx`. The tree cursor uses this to
    /// hand an owned copy to [`crate::leaf_value`]'s write/length
    /// operations, which never touch a page buffer directly.
    pub fn value_bytes_at(&self, idx: usize) -> Result<Vec<u8>> {
        let off = self.slot_offset(idx)?;
        let (_, key_region_len) = Self::entry_key(self.buf, off)?;
        let value_off = off as usize + key_region_len;
        let (body_len, header_len) = crate::leaf_value::peek_encoded_len(&self.buf[value_off..])?;
        let end = value_off + header_len + body_len;
        if end > self.buf.len() {
            return Err(EngineError::corruption("value runs past page end"));
        }
        Ok(self.buf[value_off..end].to_vec())
    }

    /// Rebuild a full raw entry (`varint keylen | key | value bytes`) from a
    /// key and an already-encoded value buffer (header + body), as produced
    /// by [`crate::leaf_value::write`]/`set_length`. Distinct from
    /// `leaf_value::encode_entry`, which always fabricates a fresh
    /// non-fragmented header rather than reusing one.
    pub fn encode_raw_entry(key: &[u8], value_bytes: &[u8]) -> Vec<u8> {
        let mut out = crate::page::encode_u32(key.len() as u32);
        out.extend_from_slice(key);
        out.extend_from_slice(value_bytes);
        out
    }

    /// Binary search the sorted search vector for `key`.
    pub fn search(&self, key: &[u8]) -> Result<SearchResult> {
        let n = self.entry_count()?;
        let (mut lo, mut hi) = (0usize, n);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let k = self.key_at(mid)?;
            match compare_bytes(key, k) {
                std::cmp::Ordering::Equal => return Ok(SearchResult::Found(mid)),
                std::cmp::Ordering::Less => hi = mid,
                std::cmp::Ordering::Greater => lo = mid + 1,
            }
        }
        Ok(SearchResult::NotFound(lo))
    }

    /// Insert a pre-encoded raw entry (key-length-prefix + key + value
    /// header + value body) at sorted position `idx`.
    pub fn insert_raw(&mut self, idx: usize, raw_entry: &[u8]) -> Result<()> {
        let needed = raw_entry.len();
        if self.free_space()? < needed {
            return Err(EngineError::capacity("node insert does not fit"));
        }
        let tail = self.left_seg_tail()?;
        let new_tail = tail
            .checked_add(needed as u16)
            .ok_or_else(|| EngineError::corruption("tail overflow"))?;
        self.buf[tail as usize..new_tail as usize].copy_from_slice(raw_entry);
        write_u16(self.buf, HDR_LEFT_SEG_TAIL, new_tail)?;

        let start = self.search_vec_start()? as usize;
        let end = self.search_vec_end()? as usize;
        let n = self.entry_count()?;
        // shift slots [idx, n) right by one slot to open a gap
        for i in (idx..n).rev() {
            let off = read_u16(self.buf, start + i * SLOT_SIZE)?;
            write_u16(self.buf, start + (i + 1) * SLOT_SIZE, off)?;
        }
        write_u16(self.buf, start + idx * SLOT_SIZE, tail)?;
        write_u16(self.buf, HDR_SEARCH_VEC_END, (end + SLOT_SIZE) as u16)?;
        Ok(())
    }

    /// Remove the entry at `idx`; its bytes become reclaimable garbage
    /// rather than being compacted immediately.
    pub fn delete_at(&mut self, idx: usize) -> Result<()> {
        let off = self.slot_offset(idx)?;
        let (_, entry_len) = Self::entry_key(self.buf, off)?;
        let entry_len = self.full_entry_len(off, entry_len)?;

        let start = self.search_vec_start()? as usize;
        let end = self.search_vec_end()? as usize;
        let n = self.entry_count()?;
        for i in idx..n - 1 {
            let next_off = read_u16(self.buf, start + (i + 1) * SLOT_SIZE)?;
            write_u16(self.buf, start + i * SLOT_SIZE, next_off)?;
        }
        write_u16(self.buf, HDR_SEARCH_VEC_END, (end - SLOT_SIZE) as u16)?;

        let garbage = self.garbage()?;
        write_u16(self.buf, HDR_GARBAGE, garbage + entry_len as u16)?;
        Ok(())
    }

    /// Total on-page length of the entry (key prefix + key + value header +
    /// value body) starting at `entry_off` whose key region consumed
    /// `key_region_len` bytes.
    fn full_entry_len(&self, entry_off: u16, key_region_len: usize) -> Result<usize> {
        let value_off = entry_off as usize + key_region_len;
        let (value_len, header_len) = crate::leaf_value::peek_encoded_len(&self.buf[value_off..])?;
        Ok(key_region_len + header_len + value_len)
    }

    /// Compact the tail area in place, reclaiming garbage by repacking live
    /// entries contiguously.
    pub fn compact(&mut self) -> Result<()> {
        let n = self.entry_count()?;
        let mut live: Vec<Vec<u8>> = Vec::with_capacity(n);
        let start = self.search_vec_start()? as usize;
        for i in 0..n {
            let off = read_u16(self.buf, start + i * SLOT_SIZE)?;
            let (_, key_region_len) = Self::entry_key(self.buf, off)?;
            let full_len = self.full_entry_len(off, key_region_len)?;
            live.push(self.buf[off as usize..off as usize + full_len].to_vec());
        }
        let mut tail = HEADER_SIZE as u16;
        for (i, entry) in live.iter().enumerate() {
            let entry_start = tail as usize;
            let entry_end = entry_start + entry.len();
            self.buf[entry_start..entry_end].copy_from_slice(entry);
            write_u16(self.buf, start + i * SLOT_SIZE, tail)?;
            tail = entry_end as u16;
        }
        write_u16(self.buf, HDR_LEFT_SEG_TAIL, tail)?;
        write_u16(self.buf, HDR_GARBAGE, 0)?;
        Ok(())
    }

    /// Split this node near the midpoint by key count ("Split
    /// policy"). Returns the entries that should move to a new right
    /// sibling plus the separator key (`midKey(low, high)`).
    pub fn split(&mut self) -> Result<SplitOutcome> {
        let n = self.entry_count()?;
        if n < 2 {
            return Err(EngineError::corruption("cannot split node with < 2 entries"));
        }
        let mid = n / 2;
        let low_last = self.key_at(mid - 1)?.to_vec();
        let high_first = self.key_at(mid)?.to_vec();
        let split_key = mid_key(&low_last, &high_first);

        let start = self.search_vec_start()? as usize;
        let mut right_entries = Vec::with_capacity(n - mid);
        for i in mid..n {
            let off = read_u16(self.buf, start + i * SLOT_SIZE)?;
            let (_, key_region_len) = Self::entry_key(self.buf, off)?;
            let full_len = self.full_entry_len(off, key_region_len)?;
            right_entries.push(self.buf[off as usize..off as usize + full_len].to_vec());
        }

        // truncate this node's search vector to keep only the left half,
        // then compact to reclaim the moved entries' space.
        write_u16(self.buf, HDR_SEARCH_VEC_END, (start + mid * SLOT_SIZE) as u16)?;
        self.compact()?;

        Ok(SplitOutcome {
                split_key,
                right_entries,
        })
    }

    /// Append pre-split raw entries into a freshly initialized sibling
    /// node (used by both tree split and merge).
    pub fn bulk_append(&mut self, entries: &[Vec<u8>]) -> Result<()> {
        for (i, e) in entries.iter().enumerate() {
            self.insert_raw(i, e)?;
        }
        Ok(())
    }

    /// Whether this node and `other` together fit in one page with slack,
    /// i.e. are eligible to merge under the parent's exclusive latch
    /// ("Merge policy").
    pub fn can_merge_with(&self, other_live_bytes: usize, other_entry_count: usize) -> Result<bool> {
        let my_live = self.buf.len() - self.free_space()? - self.garbage()? as usize - HEADER_SIZE;
        let combined_slots = (self.entry_count()? + other_entry_count) * SLOT_SIZE;
        let budget = self.buf.len() - HEADER_SIZE;
        // require slack: combined must fit with room to spare, rather than
        // merging only on an exact fit.
        Ok(my_live + other_live_bytes + combined_slots + (budget / 8) <= budget)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_page() -> Vec<u8> {
        vec![0u8; 4096]
    }

    #[test]
    fn init_then_search_vector_sorted_on_insert() {
        let mut buf = mk_page();
        let mut node = Node::init(&mut buf, NodeType::Leaf, EXTREMITY_LOW | EXTREMITY_HIGH).unwrap();
        let e1 = crate::leaf_value::encode_entry(b"b", b"v1").unwrap();
        let e2 = crate::leaf_value::encode_entry(b"a", b"v0").unwrap();
        node.insert_raw(0, &e1).unwrap();
        match node.search(b"a").unwrap() {
            SearchResult::NotFound(0) => {}
            other => panic!("unexpected {other:?}"),
        }
        node.insert_raw(0, &e2).unwrap();
        assert_eq!(node.key_at(0).unwrap(), b"a");
        assert_eq!(node.key_at(1).unwrap(), b"b");
    }

    #[test]
    fn delete_then_garbage_accounted() {
        let mut buf = mk_page();
        let mut node = Node::init(&mut buf, NodeType::Leaf, EXTREMITY_LOW | EXTREMITY_HIGH).unwrap();
        let e = crate::leaf_value::encode_entry(b"k", b"value").unwrap();
        node.insert_raw(0, &e).unwrap();
        assert_eq!(node.entry_count().unwrap(), 1);
        node.delete_at(0).unwrap();
        assert_eq!(node.entry_count().unwrap(), 0);
        assert!(node.garbage().unwrap() > 0);
    }

    #[test]
    fn split_produces_sorted_halves_and_separator() {
        let mut buf = mk_page();
        let mut node = Node::init(&mut buf, NodeType::Leaf, EXTREMITY_LOW | EXTREMITY_HIGH).unwrap();
        for k in [b'a', b'b', b'c', b'd'] {
            let key = [k];
            let entry = crate::leaf_value::encode_entry(&key, b"v").unwrap();
            if let SearchResult::NotFound(idx) = node.search(&key).unwrap() {
                node.insert_raw(idx, &entry).unwrap();
            }
        }
        let outcome = node.split().unwrap();
        assert_eq!(node.entry_count().unwrap(), 2);
        assert_eq!(outcome.right_entries.len(), 2);
        assert!(compare_bytes(node.key_at(1).unwrap(), &outcome.split_key) != std::cmp::Ordering::Greater);
    }

    #[test]
    fn value_bytes_at_roundtrips_through_encode_raw_entry() {
        let mut buf = mk_page();
        let mut node = Node::init(&mut buf, NodeType::Leaf, EXTREMITY_LOW | EXTREMITY_HIGH).unwrap();
        let entry = crate::leaf_value::encode_entry(b"k", b"hello world").unwrap();
        node.insert_raw(0, &entry).unwrap();

        let value_bytes = node.value_bytes_at(0).unwrap();
        let rebuilt = Node::encode_raw_entry(b"k", &value_bytes);
        assert_eq!(rebuilt, entry);
    }
}
