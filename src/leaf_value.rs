//! Leaf value engine: in-page value encoding, and the
//! fragmented-value format that lets one logical value span many pages.
//!
//! A leaf entry's value bytes are `[value-header | value-body]` (the key
//! portion is `node`'s concern). The header picks the narrowest of three
//! forms -- short (1 byte, 0-127), medium (2 bytes, 1-8192), large (3
//! bytes, 1-1,048,576) -- or the ghost tombstone (`0xFF`). Only the large
//! form can mark its body as *fragmented*: a pointer structure (inline
//! prefix plus direct or indirect page pointers) rather than raw bytes.
//! The header's declared length is always the on-page byte size of the
//! body that follows it; for a fragmented body that is the size of the
//! pointer structure, not the logical value length (which lives inside
//! the fragmented body's own `fLen` field and can be far larger).
//!
//! Operations here work against an owned `Vec<u8>` holding one entry's
//! full value bytes (header + body) rather than splicing directly into a
//! page buffer. The tree cursor is responsible for writing the result
//! back into the node, which may mean a plain in-place update or a
//! delete+reinsert if the entry's size changed -- mirroring why a
//! length-field promotion that splits its node must be finished and the
//! outer call restarted from the top before the caller's old offsets are
//! trusted again.

use crate::error::{EngineError, Result};
use crate::node::NodeId;
use crate::page::{read_u48, write_u48};
use crate::txn::{UndoEntry, UndoSink};

/// Marks a write as "touch": traverse storage and force pages dirty
/// without changing any bytes.
pub const TOUCH_VALUE: &[u8] = &[];

#[derive(Clone, Copy)]
pub enum WriteSource<'a> {
    Bytes(&'a [u8]),
    Touch,
}

/// External collaborator surface this module needs from the page
/// allocator/cache (out of scope beyond this narrow surface).
pub trait PageStore {
    fn page_size(&self) -> usize;
    fn alloc_page(&mut self) -> Result<NodeId>;
    fn free_page(&mut self, id: NodeId) -> Result<()>;
    fn read_page(&self, id: NodeId) -> Result<Vec<u8>>;
    fn write_page(&mut self, id: NodeId, data: &[u8]) -> Result<()>;
}

const GHOST_BYTE: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueHeader {
    pub header_len: usize,
    pub body_len: u64,
    pub fragmented: bool,
    pub ghost: bool,
}

/// Narrowest header form that can encode `body_len`. Only the
/// 3-byte "large" form may be marked fragmented.
pub fn encode_value_header(body_len: u64, fragmented: bool) -> Result<Vec<u8>> {
    if !fragmented {
        if body_len <= 127 {
            return Ok(vec![body_len as u8]);
        }
        if (1..=8192).contains(&body_len) {
            let v = body_len - 1;
            return Ok(vec![0x80 | ((v >> 8) as u8 & 0x1F), (v & 0xFF) as u8]);
        }
    }
    if (1..=1_048_576).contains(&body_len) {
        let v = body_len - 1;
        let frag_bit = if fragmented { 0x20 } else { 0x00 };
        return Ok(vec![
                0xC0 | frag_bit | ((v >> 16) as u8 & 0x0F),
                ((v >> 8) & 0xFF) as u8,
                (v & 0xFF) as u8,
        ]);
    }
    Err(EngineError::capacity(format!(
                "value body length {body_len} not representable (fragmented={fragmented})"
    )))
}

pub fn decode_value_header(buf: &[u8]) -> Result<ValueHeader> {
    let b0 = *buf
        .first()
        .ok_or_else(|| EngineError::corruption("empty value header"))?;
    if b0 == GHOST_BYTE {
        return Ok(ValueHeader {
                header_len: 1,
                body_len: 0,
                fragmented: false,
                ghost: true,
        });
    }
    if b0 & 0x80 == 0 {
        return Ok(ValueHeader {
                header_len: 1,
                body_len: (b0 & 0x7F) as u64,
                fragmented: false,
                ghost: false,
        });
    }
    if b0 & 0xC0 == 0x80 {
        let b1 = *buf.get(1).ok_or_else(|| EngineError::corruption("short medium header"))?;
        let v = (((b0 & 0x1F) as u64) << 8 | b1 as u64) + 1;
        return Ok(ValueHeader {
                header_len: 2,
                body_len: v,
                fragmented: false,
                ghost: false,
        });
    }
    // large form: 11xxxxxx, bit 0x20 = fragmented, low nibble 0x0F = length high bits
    let b1 = *buf.get(1).ok_or_else(|| EngineError::corruption("short large header"))?;
    let b2 = *buf.get(2).ok_or_else(|| EngineError::corruption("short large header"))?;
    let fragmented = b0 & 0x20 != 0;
    let v = (((b0 & 0x0F) as u64) << 16 | (b1 as u64) << 8 | b2 as u64) + 1;
    Ok(ValueHeader {
            header_len: 3,
            body_len: v,
            fragmented,
            ghost: false,
    })
}

/// On-page size of `header + body` starting at `buf`'s front, used by
/// `node` to know how many bytes an entry's value occupies without
/// interpreting a fragmented body's internals.
pub fn peek_encoded_len(buf: &[u8]) -> Result<(usize, usize)> {
    let h = decode_value_header(buf)?;
    Ok((h.body_len as usize, h.header_len))
}

/// Build a full non-fragmented entry: `[varint keylen | key | value header
/// | value bytes]`. Values over 1,048,576 bytes must go through
/// the fragmented path (`write`/`set_length`) instead.
pub fn encode_entry(key: &[u8], value: &[u8]) -> Result<Vec<u8>> {
    let mut out = crate::page::encode_u32(key.len() as u32);
    out.extend_from_slice(key);
    out.extend(encode_value_header(value.len() as u64, false)?);
    out.extend_from_slice(value);
    Ok(out)
}

// --- fragmented body -----------------------------------------------------

const FH_INDIRECT: u8 = 0x01;
const FH_INLINE: u8 = 0x02;
const FH_WIDTH_MASK: u8 = 0x0C;
const FH_WIDTH_SHIFT: u32 = 2;
const PTR_SIZE: usize = 6;

fn field_width_for(len: u64) -> (u8, usize) {
    if len <= u16::MAX as u64 {
        (0, 2)
    } else if len <= u32::MAX as u64 {
        (1, 4)
    } else if len <= 0x0000_FFFF_FFFF_FFFF {
        (2, 6)
    } else {
        (3, 8)
    }
}

fn read_len_field(buf: &[u8], width: usize) -> Result<u64> {
    if buf.len() < width {
        return Err(EngineError::corruption("fLen field truncated"));
    }
    let mut arr = [0u8; 8];
    arr[..width].copy_from_slice(&buf[..width]);
    Ok(u64::from_le_bytes(arr))
}

fn write_len_field(out: &mut Vec<u8>, len: u64, width: usize) {
    let bytes = len.to_le_bytes();
    out.extend_from_slice(&bytes[..width]);
}

struct FragmentedBody {
    indirect: bool,
    width_sel: u8,
    width: usize,
    f_len: u64,
    inline: Vec<u8>,
    /// Direct pointers, or the single indirect root pointer (len 1).
    pointers: Vec<NodeId>,
}

impl FragmentedBody {
    fn parse(body: &[u8]) -> Result<Self> {
        let fh = *body.first().ok_or_else(|| EngineError::corruption("empty fragmented body"))?;
        let indirect = fh & FH_INDIRECT != 0;
        let has_inline = fh & FH_INLINE != 0;
        let width_sel = (fh & FH_WIDTH_MASK) >> FH_WIDTH_SHIFT;
        let width = match width_sel {
            0 => 2,
            1 => 4,
            2 => 6,
            3 => 8,
            _ => unreachable!(),
        };
        let mut pos = 1usize;
        let f_len = read_len_field(&body[pos..], width)?;
        pos += width;
        let inline = if has_inline {
            let inline_len = crate::page::read_u16(body, pos)? as usize;
            pos += 2;
            let bytes = body
                .get(pos..pos + inline_len)
                .ok_or_else(|| EngineError::corruption("inline content truncated"))?
                .to_vec();
            pos += inline_len;
            bytes
        } else {
            Vec::new()
        };
        let ptr_bytes = &body[pos..];
        if ptr_bytes.len() % PTR_SIZE != 0 {
            return Err(EngineError::corruption("pointer section not a multiple of 6"));
        }
        let mut pointers = Vec::with_capacity(ptr_bytes.len() / PTR_SIZE);
        for chunk in ptr_bytes.chunks_exact(PTR_SIZE) {
            pointers.push(NodeId::new(read_u48(chunk, 0)?));
        }
        Ok(Self {
                indirect,
                width_sel,
                width,
                f_len,
                inline,
                pointers,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut fh = (self.width_sel << FH_WIDTH_SHIFT) as u8;
        if self.indirect {
            fh |= FH_INDIRECT;
        }
        if !self.inline.is_empty() {
            fh |= FH_INLINE;
        }
        let mut out = vec![fh];
        write_len_field(&mut out, self.f_len, self.width);
        if !self.inline.is_empty() {
            out.extend_from_slice(&(self.inline.len() as u16).to_le_bytes());
            out.extend_from_slice(&self.inline);
        }
        for p in &self.pointers {
            let mut ptr_buf = [0u8; 6];
            write_u48(&mut ptr_buf, 0, p.0).expect("page id fits 48 bits");
            out.extend_from_slice(&ptr_buf);
        }
        out
    }

    fn inline_len(&self) -> u64 {
        self.inline.len() as u64
    }

    fn data_len(&self) -> u64 {
        self.f_len - self.inline_len()
    }
}

fn pointers_per_inode(page_size: u64) -> u64 {
    page_size / PTR_SIZE as u64
}

fn leaf_pages_needed(data_len: u64, page_size: u64) -> u64 {
    if data_len == 0 {
        0
    } else {
        (data_len + page_size - 1) / page_size
    }
}

/// Number of indirect levels needed to cover `leaf_pages` data pages
/// ("Level count is derived from total length and page size").
fn indirect_levels(leaf_pages: u64, page_size: u64) -> u32 {
    if leaf_pages <= 1 {
        return 1;
    }
    let ppi = pointers_per_inode(page_size);
    let mut levels = 1u32;
    let mut capacity = ppi;
    while capacity < leaf_pages {
        capacity = capacity.saturating_mul(ppi);
        levels += 1;
    }
    levels
}

fn indirect_read_page(
    pager: &dyn PageStore,
    root: NodeId,
    levels: u32,
    leaf_index: u64,
) -> Result<Option<Vec<u8>>> {
    if root.is_none() {
        return Ok(None);
    }
    if levels == 1 {
        return Ok(Some(pager.read_page(root)?));
    }
    let page = pager.read_page(root)?;
    let ppi = pointers_per_inode(pager.page_size() as u64);
    let capacity_per_child = ppi.pow(levels - 1);
    let child_idx = leaf_index / capacity_per_child;
    let rem = leaf_index % capacity_per_child;
    let child_id = NodeId::new(read_u48(&page, (child_idx as usize) * PTR_SIZE)?);
    indirect_read_page(pager, child_id, levels - 1, rem)
}

/// Ensure an inode path down to `leaf_index` exists, allocating pages as
/// needed, and return the resolved data page id (allocating it too if it
/// was sparse). Mutates `root` in place when the root pointer itself had
/// to be allocated.
fn indirect_write_path(
    pager: &mut dyn PageStore,
    root: &mut NodeId,
    levels: u32,
    leaf_index: u64,
) -> Result<NodeId> {
    if root.is_none() {
        *root = pager.alloc_page()?;
        pager.write_page(*root, &vec![0u8; pager.page_size()])?;
    }
    if levels == 1 {
        return Ok(*root);
    }
    let mut page = pager.read_page(*root)?;
    let ppi = pointers_per_inode(pager.page_size() as u64);
    let capacity_per_child = ppi.pow(levels - 1);
    let child_idx = leaf_index / capacity_per_child;
    let rem = leaf_index % capacity_per_child;
    let off = (child_idx as usize) * PTR_SIZE;
    let mut child = NodeId::new(read_u48(&page, off)?);
    let resolved = indirect_write_path(pager, &mut child, levels - 1, rem)?;
    write_u48(&mut page, off, child.0)?;
    pager.write_page(*root, &page)?;
    Ok(resolved)
}

fn direct_page_for(pointers: &[NodeId], idx: u64) -> NodeId {
    pointers.get(idx as usize).copied().unwrap_or(NodeId::NONE)
}

/// Returns the logical length of the value, or `-1` for a ghost entry
/// ("reads return -1").
pub fn length(raw: &[u8]) -> Result<i64> {
    let h = decode_value_header(raw)?;
    if h.ghost {
        return Ok(-1);
    }
    if !h.fragmented {
        return Ok(h.body_len as i64);
    }
    let body = &raw[h.header_len..];
    let frag = FragmentedBody::parse(body)?;
    Ok(frag.f_len as i64)
}

/// Read up to `len` bytes at logical `pos` into `buf[off..]`. Returns the
/// number of bytes actually read (short read past end), or `-1` if the
/// entry is a ghost.
pub fn read(raw: &[u8], pager: &dyn PageStore, pos: u64, buf: &mut [u8], off: usize, len: usize) -> Result<i64> {
    let h = decode_value_header(raw)?;
    if h.ghost {
        return Ok(-1);
    }
    if !h.fragmented {
        let body = &raw[h.header_len..h.header_len + h.body_len as usize];
        if pos >= body.len() as u64 {
            return Ok(0);
        }
        let avail = (body.len() as u64 - pos) as usize;
        let n = avail.min(len);
        buf[off..off + n].copy_from_slice(&body[pos as usize..pos as usize + n]);
        return Ok(n as i64);
    }
    let frag = FragmentedBody::parse(&raw[h.header_len..])?;
    if pos >= frag.f_len {
        return Ok(0);
    }
    let end = (pos + len as u64).min(frag.f_len);
    let page_size = pager.page_size() as u64;
    let mut cur = pos;
    let mut produced = 0usize;
    while cur < end {
        if cur < frag.inline_len() {
            let take = (frag.inline_len() - cur).min(end - cur) as usize;
            buf[off + produced..off + produced + take]
                .copy_from_slice(&frag.inline[cur as usize..cur as usize + take]);
            produced += take;
            cur += take as u64;
            continue;
        }
        let data_pos = cur - frag.inline_len();
        let page_idx = data_pos / page_size;
        let page_off = (data_pos % page_size) as usize;
        let take = ((page_size as usize - page_off) as u64).min(end - cur) as usize;
        let page_id = if frag.indirect {
            let leaf_pages = leaf_pages_needed(frag.data_len(), page_size);
            let levels = indirect_levels(leaf_pages, page_size);
            let root = frag.pointers.first().copied().unwrap_or(NodeId::NONE);
            match indirect_read_page(pager, root, levels, page_idx)? {
                Some(page) => {
                    buf[off + produced..off + produced + take].copy_from_slice(&page[page_off..page_off + take]);
                    produced += take;
                    cur += take as u64;
                    continue;
                }
                None => NodeId::NONE,
            }
        } else {
            direct_page_for(&frag.pointers, page_idx)
        };
        if page_id.is_none() {
            buf[off + produced..off + produced + take].fill(0);
        } else {
            let page = pager.read_page(page_id)?;
            buf[off + produced..off + produced + take].copy_from_slice(&page[page_off..page_off + take]);
        }
        produced += take;
        cur += take as u64;
    }
    Ok(produced as i64)
}

fn push_unwrite_if_needed(
    undo: &mut dyn UndoSink,
    node: NodeId,
    key: &[u8],
    pos: u64,
    old_bytes: &[u8],
    skip: bool,
) -> Result<()> {
    if skip {
        return Ok(());
    }
    undo.push(UndoEntry::Unwrite {
            node,
            key: key.to_vec(),
            pos,
            old_bytes: old_bytes.to_vec(),
    })
}

/// Write `src` at logical `pos`, extending the value if the write runs
/// past its current end. `max_fragmented_entry_size` bounds how large the
/// on-page fragmented pointer structure may grow before a compaction
/// (inline-to-pages push, or direct-to-indirect conversion) is forced.
pub fn write(
    raw: &mut Vec<u8>,
    pager: &mut dyn PageStore,
    undo: &mut dyn UndoSink,
    node: NodeId,
    key: &[u8],
    pos: u64,
    src: WriteSource,
    max_fragmented_entry_size: usize,
) -> Result<()> {
    let src_bytes: &[u8] = match &src {
        WriteSource::Bytes(b) => b,
        WriteSource::Touch => TOUCH_VALUE,
    };
    let touch = matches!(src, WriteSource::Touch);
    let h = decode_value_header(raw)?;
    if h.ghost {
        // a write to a tombstone first materializes an empty value.
        *raw = encode_entry_body_only(&[], false)?;
        return write(raw, pager, undo, node, key, pos, src, max_fragmented_entry_size);
    }

    let cur_len = if h.fragmented {
        FragmentedBody::parse(&raw[h.header_len..])?.f_len
    } else {
        h.body_len
    };
    let new_end = pos + src_bytes.len() as u64;

    if !h.fragmented && new_end <= cur_len && new_end <= max_fragmented_entry_size as u64 {
        // in-place, non-extending write within a plain (non-fragmented)
        // value: splice the bytes directly.
        let body_start = h.header_len;
        if !touch {
            let old = raw[body_start + pos as usize..body_start + pos as usize + src_bytes.len()].to_vec();
            push_unwrite_if_needed(undo, node, key, pos, &old, false)?;
            raw[body_start + pos as usize..body_start + pos as usize + src_bytes.len()].copy_from_slice(src_bytes);
        }
        return Ok(());
    }

    // Anything else (extension, or already fragmented) goes through the
    // fragmented representation; materialize non-fragmented values first.
    if !h.fragmented {
        convert_to_fragmented(raw, cur_len)?;
    }

    let needs_extend = new_end > cur_len;
    if needs_extend {
        undo.push(UndoEntry::Unextend {
                node,
                key: key.to_vec(),
                old_len: cur_len,
        })?;
        grow_fragmented(raw, pager, new_end, max_fragmented_entry_size)?;
    }

    write_fragmented_within(raw, pager, undo, node, key, pos, src_bytes, touch, new_end > cur_len)?;
    Ok(())
}

fn encode_entry_body_only(value: &[u8], fragmented: bool) -> Result<Vec<u8>> {
    let mut out = encode_value_header(value.len() as u64, fragmented)?;
    out.extend_from_slice(value);
    Ok(out)
}

/// Rewrite a plain (non-fragmented) value's header+body as a minimal
/// fragmented body with all content inline, so the extension/promotion
/// machinery below has one representation to work against.
fn convert_to_fragmented(raw: &mut Vec<u8>, cur_len: u64) -> Result<()> {
    let h = decode_value_header(raw)?;
    let old_body = raw[h.header_len..h.header_len + cur_len as usize].to_vec();
    let (width_sel, width) = field_width_for(cur_len);
    let frag = FragmentedBody {
        indirect: false,
        width_sel,
        width,
        f_len: cur_len,
        inline: old_body,
        pointers: Vec::new(),
    };
    let body = frag.encode();
    let header = encode_value_header(body.len() as u64, true)?;
    let mut out = header;
    out.extend_from_slice(&body);
    *raw = out;
    Ok(())
}

/// §4.3.1: length-field promotion, growing the `fLen` field's width when
/// it can no longer represent the target length, falling back to
/// direct-format compaction if the resulting entry would not fit.
fn promote_length_field(raw: &mut Vec<u8>, pager: &mut dyn PageStore, new_len: u64, max_entry: usize) -> Result<()> {
    let outer = decode_value_header(raw)?;
    let mut frag = FragmentedBody::parse(&raw[outer.header_len..])?;
    let (new_sel, new_width) = field_width_for(new_len);
    if new_width <= frag.width {
        return Ok(());
    }
    let grown_body_len = raw.len() - outer.header_len - frag.width + new_width;
    if grown_body_len > max_entry {
        direct_format_compaction(raw, pager, max_entry)?;
        return promote_length_field(raw, pager, new_len, max_entry);
    }
    frag.width_sel = new_sel;
    frag.width = new_width;
    let body = frag.encode();
    let header = encode_value_header(body.len() as u64, true)?;
    let mut out = header;
    out.extend_from_slice(&body);
    *raw = out;
    Ok(())
}

/// §4.3.2: direct-extension, growing the direct pointer array in place,
/// or falling back to direct-format compaction (push inline into pages,
/// or convert to indirect) when the array can't grow further.
fn grow_fragmented(raw: &mut Vec<u8>, pager: &mut dyn PageStore, new_len: u64, max_entry: usize) -> Result<()> {
    promote_length_field(raw, pager, new_len, max_entry)?;

    let outer = decode_value_header(raw)?;
    let mut frag = FragmentedBody::parse(&raw[outer.header_len..])?;
    let page_size = pager.page_size() as u64;
    let old_data_len = frag.data_len();
    frag.f_len = new_len;
    let new_data_len = frag.data_len();

    if frag.indirect {
        let old_leaf_pages = leaf_pages_needed(old_data_len, page_size);
        let new_leaf_pages = leaf_pages_needed(new_data_len, page_size);
        let old_levels = indirect_levels(old_leaf_pages.max(1), page_size);
        let new_levels = indirect_levels(new_leaf_pages.max(1), page_size);
        if new_levels > old_levels {
            let mut root = frag.pointers.first().copied().unwrap_or(NodeId::NONE);
            for _ in old_levels..new_levels {
                let new_root = pager.alloc_page()?;
                let mut page = vec![0u8; pager.page_size()];
                write_u48(&mut page, 0, root.0)?;
                pager.write_page(new_root, &page)?;
                root = new_root;
            }
            frag.pointers = vec![root];
        }
        write_back(raw, &frag)?;
        return Ok(());
    }

    let old_pages = leaf_pages_needed(old_data_len, page_size);
    let new_pages = leaf_pages_needed(new_data_len, page_size);
    let extra = new_pages.saturating_sub(old_pages);
    if extra == 0 {
        write_back(raw, &frag)?;
        return Ok(());
    }
    let grown_body_len = raw.len() - outer.header_len + (extra as usize) * PTR_SIZE;
    if grown_body_len > max_entry {
        write_back(raw, &frag)?;
        direct_format_compaction(raw, pager, max_entry)?;
        return grow_fragmented(raw, pager, new_len, max_entry);
    }
    for _ in 0..extra {
        frag.pointers.push(NodeId::NONE);
    }
    write_back(raw, &frag)
}

fn write_back(raw: &mut Vec<u8>, frag: &FragmentedBody) -> Result<()> {
    let body = frag.encode();
    let header = encode_value_header(body.len() as u64, true)?;
    let mut out = header;
    out.extend_from_slice(&body);
    *raw = out;
    Ok(())
}

/// §4.3.2 fallback: reduce a fragmented entry's in-leaf pointer footprint
/// either by pushing inline content into fragment pages (clearing the
/// inline bit) or, if there is no inline content, by converting the
/// direct pointer array into a single indirect root.
fn direct_format_compaction(raw: &mut Vec<u8>, pager: &mut dyn PageStore, max_entry: usize) -> Result<()> {
    let outer = decode_value_header(raw)?;
    let mut frag = FragmentedBody::parse(&raw[outer.header_len..])?;
    let page_size = pager.page_size() as u64;

    if !frag.inline.is_empty() {
        let inline = std::mem::take(&mut frag.inline);
        let mut remaining = inline.as_slice();
        let mut page_idx = 0u64;
        while !remaining.is_empty() {
            let take = remaining.len().min(page_size as usize);
            let page_id = match frag.pointers.get(page_idx as usize).copied() {
                Some(id) if !id.is_none() => id,
                _ => {
                    let id = pager.alloc_page()?;
                    if (page_idx as usize) >= frag.pointers.len() {
                        frag.pointers.resize((page_idx + 1) as usize, NodeId::NONE);
                    }
                    frag.pointers[page_idx as usize] = id;
                    id
                }
            };
            let mut page = vec![0u8; pager.page_size()];
            page[..take].copy_from_slice(&remaining[..take]);
            pager.write_page(page_id, &page)?;
            remaining = &remaining[take..];
            page_idx += 1;
        }
        write_back(raw, &frag)?;
        return Ok(());
    }

    if !frag.indirect {
        let root = pager.alloc_page()?;
        let mut page = vec![0u8; pager.page_size()];
        for (i, p) in frag.pointers.iter().enumerate() {
            let off = i * PTR_SIZE;
            if off + PTR_SIZE > page.len() {
                break;
            }
            write_u48(&mut page, off, p.0)?;
        }
        pager.write_page(root, &page)?;
        frag.indirect = true;
        frag.pointers = vec![root];
        write_back(raw, &frag)?;
    }
    Ok(())
}

fn write_fragmented_within(
    raw: &mut Vec<u8>,
    pager: &mut dyn PageStore,
    undo: &mut dyn UndoSink,
    node: NodeId,
    key: &[u8],
    pos: u64,
    src: &[u8],
    touch: bool,
    in_new_region: bool,
) -> Result<()> {
    let outer = decode_value_header(raw)?;
    let mut frag = FragmentedBody::parse(&raw[outer.header_len..])?;
    let page_size = pager.page_size() as u64;
    let end = pos + src.len() as u64;
    let mut cur = pos;
    let mut consumed = 0usize;

    while cur < end {
        if cur < frag.inline_len() {
            let take = (frag.inline_len() - cur).min(end - cur) as usize;
            if !touch {
                let old = frag.inline[cur as usize..cur as usize + take].to_vec();
                push_unwrite_if_needed(undo, node, key, cur, &old, in_new_region)?;
                frag.inline[cur as usize..cur as usize + take].copy_from_slice(&src[consumed..consumed + take]);
            }
            consumed += take;
            cur += take as u64;
            continue;
        }
        let data_pos = cur - frag.inline_len();
        let page_idx = data_pos / page_size;
        let page_off = (data_pos % page_size) as usize;
        let take = ((page_size as usize - page_off) as u64).min(end - cur) as usize;

        let page_id = if frag.indirect {
            let leaf_pages = leaf_pages_needed(frag.data_len(), page_size);
            let levels = indirect_levels(leaf_pages.max(1), page_size);
            let mut root = frag.pointers.first().copied().unwrap_or(NodeId::NONE);
            let was_sparse = root.is_none();
            let id = indirect_write_path(pager, &mut root, levels, page_idx)?;
            frag.pointers = vec![root];
            if was_sparse {
                undo.push(UndoEntry::Unalloc {
                        node,
                        key: key.to_vec(),
                        slice_index: page_idx,
                })?;
            }
            id
        } else {
            if (page_idx as usize) >= frag.pointers.len() {
                frag.pointers.resize(page_idx as usize + 1, NodeId::NONE);
            }
            let existing = frag.pointers[page_idx as usize];
            if existing.is_none() {
                let id = pager.alloc_page()?;
                pager.write_page(id, &vec![0u8; pager.page_size()])?;
                frag.pointers[page_idx as usize] = id;
                if !in_new_region {
                    undo.push(UndoEntry::Unalloc {
                            node,
                            key: key.to_vec(),
                            slice_index: page_idx,
                    })?;
                }
                id
            } else {
                existing
            }
        };

        if !touch {
            let mut page = pager.read_page(page_id)?;
            let old = page[page_off..page_off + take].to_vec();
            push_unwrite_if_needed(undo, node, key, cur, &old, in_new_region)?;
            page[page_off..page_off + take].copy_from_slice(&src[consumed..consumed + take]);
            pager.write_page(page_id, &page)?;
        }
        consumed += take;
        cur += take as u64;
    }

    write_back(raw, &frag)
}

/// Truncate or extend a value, zero-filling any newly extended tail.
pub fn set_length(
    raw: &mut Vec<u8>,
    pager: &mut dyn PageStore,
    undo: &mut dyn UndoSink,
    node: NodeId,
    key: &[u8],
    new_len: u64,
    max_fragmented_entry_size: usize,
) -> Result<()> {
    let h = decode_value_header(raw)?;
    if h.ghost {
        *raw = encode_entry_body_only(&[], false)?;
        return set_length(raw, pager, undo, node, key, new_len, max_fragmented_entry_size);
    }
    let cur_len = if h.fragmented {
        FragmentedBody::parse(&raw[h.header_len..])?.f_len
    } else {
        h.body_len
    };
    if new_len == cur_len {
        return Ok(());
    }
    if new_len > cur_len {
        // extension is equivalent to writing zeros at the tail.
        let zeros = vec![0u8; (new_len - cur_len) as usize];
        return write(
            raw,
            pager,
            undo,
            node,
            key,
            cur_len,
            WriteSource::Bytes(&zeros),
            max_fragmented_entry_size,
        );
    }
    truncate(raw, pager, undo, node, key, new_len)
}

fn truncate(raw: &mut Vec<u8>, pager: &mut dyn PageStore, undo: &mut dyn UndoSink, node: NodeId, key: &[u8], new_len: u64) -> Result<()> {
    let h = decode_value_header(raw)?;
    if !h.fragmented {
        undo.push(UndoEntry::Unextend {
                node,
                key: key.to_vec(),
                old_len: h.body_len,
        })?;
        let body = raw[h.header_len..h.header_len + new_len as usize].to_vec();
        *raw = encode_entry_body_only(&body, false)?;
        return Ok(());
    }

    let mut frag = FragmentedBody::parse(&raw[h.header_len..])?;
    undo.push(UndoEntry::Unextend {
            node,
            key: key.to_vec(),
            old_len: frag.f_len,
    })?;
    let page_size = pager.page_size() as u64;
    let old_data_len = frag.data_len();

    if new_len <= frag.inline_len() {
        frag.inline.truncate(new_len as usize);
        frag.f_len = new_len;
        frag.pointers.clear();
        write_back(raw, &frag)?;
        if new_len <= 127 || new_len <= 8192 {
            // collapses cleanly back to a non-fragmented representation.
            let h2 = decode_value_header(raw)?;
            let body = raw[h2.header_len..].to_vec();
            let f = FragmentedBody::parse(&body)?;
            *raw = encode_entry_body_only(&f.inline, false)?;
        }
        return Ok(());
    }

    let new_data_len = new_len - frag.inline_len();
    let new_leaf_pages = leaf_pages_needed(new_data_len, page_size);
    let old_leaf_pages = leaf_pages_needed(old_data_len, page_size);

    if frag.indirect {
        let old_levels = indirect_levels(old_leaf_pages.max(1), page_size);
        let new_levels = indirect_levels(new_leaf_pages.max(1), page_size);
        if new_levels < old_levels {
            // collapse levels from the top, freeing now-unreachable inodes.
            let mut root = frag.pointers.first().copied().unwrap_or(NodeId::NONE);
            for _ in new_levels..old_levels {
                if root.is_none() {
                    break;
                }
                let page = pager.read_page(root)?;
                let first_child = NodeId::new(read_u48(&page, 0)?);
                pager.free_page(root)?;
                root = first_child;
            }
            frag.pointers = vec![root];
        }
    } else {
        frag.pointers.truncate(new_leaf_pages as usize);
    }
    frag.f_len = new_len;
    write_back(raw, &frag)
}

/// Zero a range without changing total length.
pub fn clear(
    raw: &mut Vec<u8>,
    pager: &mut dyn PageStore,
    undo: &mut dyn UndoSink,
    node: NodeId,
    key: &[u8],
    pos: u64,
    len: u64,
) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let zeros = vec![0u8; len as usize];
    write(
        raw,
        pager,
        undo,
        node,
        key,
        pos,
        WriteSource::Bytes(&zeros),
        usize::MAX,
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactCheck {
    PastEnd,
    AllSafe,
    SomeTooHigh,
}

/// §4.3.3: whether any storage backing the byte at `pos` lives above
/// `highest_node_id` (the compaction zone threshold).
pub fn compact_check(raw: &[u8], pager: &dyn PageStore, pos: u64, highest_node_id: NodeId) -> Result<CompactCheck> {
    let h = decode_value_header(raw)?;
    if h.ghost || (!h.fragmented && pos >= h.body_len) {
        return Ok(CompactCheck::PastEnd);
    }
    if !h.fragmented {
        return Ok(CompactCheck::AllSafe);
    }
    let frag = FragmentedBody::parse(&raw[h.header_len..])?;
    if pos >= frag.f_len {
        return Ok(CompactCheck::PastEnd);
    }
    if pos < frag.inline_len() {
        return Ok(CompactCheck::AllSafe);
    }
    let page_size = pager.page_size() as u64;
    let page_idx = (pos - frag.inline_len()) / page_size;
    let page_id = if frag.indirect {
        let leaf_pages = leaf_pages_needed(frag.data_len(), page_size);
        let levels = indirect_levels(leaf_pages.max(1), page_size);
        let root = frag.pointers.first().copied().unwrap_or(NodeId::NONE);
        resolve_indirect_id(pager, root, levels, page_idx)?
    } else {
        direct_page_for(&frag.pointers, page_idx)
    };
    if page_id.is_none() {
        return Ok(CompactCheck::AllSafe);
    }
    if page_id.0 > highest_node_id.0 {
        Ok(CompactCheck::SomeTooHigh)
    } else {
        Ok(CompactCheck::AllSafe)
    }
}

fn resolve_indirect_id(pager: &dyn PageStore, root: NodeId, levels: u32, leaf_index: u64) -> Result<NodeId> {
    if root.is_none() {
        return Ok(NodeId::NONE);
    }
    if levels == 1 {
        return Ok(root);
    }
    let page = pager.read_page(root)?;
    let ppi = pointers_per_inode(pager.page_size() as u64);
    let capacity_per_child = ppi.pow(levels - 1);
    let child_idx = leaf_index / capacity_per_child;
    let rem = leaf_index % capacity_per_child;
    let child = NodeId::new(read_u48(&page, (child_idx as usize) * PTR_SIZE)?);
    resolve_indirect_id(pager, child, levels - 1, rem)
}
