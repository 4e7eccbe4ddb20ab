use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tempfile::tempdir;

use lattice::leaf_value::{self, WriteSource};
use lattice::node::NodeId;
use lattice::txn::UndoEntry;
use lattice::{PageStore, Result};

/// A [`PageStore`] backed by a real file on disk: each page occupies a
/// fixed-size slot at `id * page_size`, with its checksum trailing the
/// payload. Exists only to exercise the engine against real file I/O in
/// integration tests; the engine itself never opens a file directly.
struct FilePageStore {
    path: PathBuf,
    page_size: usize,
    next_id: u64,
    cache: HashMap<u64, Vec<u8>>,
}

impl FilePageStore {
    fn create(path: &Path, page_size: usize) -> std::io::Result<Self> {
        OpenOptions::new().create(true).write(true).truncate(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            page_size,
            next_id: 1,
            cache: HashMap::new(),
        })
    }

    fn flush_to_disk(&self) -> std::io::Result<()> {
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        for (&id, data) in &self.cache {
            let checksum = lattice::page::page_checksum(data);
            file.seek(SeekFrom::Start(id * (self.page_size as u64 + 4)))?;
            file.write_all(data)?;
            file.write_all(&checksum.to_le_bytes())?;
        }
        Ok(())
    }

    fn reload_from_disk(&self, id: u64) -> std::io::Result<Vec<u8>> {
        let mut file = OpenOptions::new().read(true).open(&self.path)?;
        file.seek(SeekFrom::Start(id * (self.page_size as u64 + 4)))?;
        let mut data = vec![0u8; self.page_size];
        file.read_exact(&mut data)?;
        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let expected = u32::from_le_bytes(checksum_bytes);
        lattice::page::verify_checksum(&data, expected)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        Ok(data)
    }
}

impl PageStore for FilePageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }
    fn alloc_page(&mut self) -> Result<NodeId> {
        let id = self.next_id;
        self.next_id += 1;
        self.cache.insert(id, vec![0u8; self.page_size]);
        Ok(NodeId::new(id))
    }
    fn free_page(&mut self, id: NodeId) -> Result<()> {
        self.cache.remove(&id.0);
        Ok(())
    }
    fn read_page(&self, id: NodeId) -> Result<Vec<u8>> {
        Ok(self.cache.get(&id.0).cloned().unwrap_or_else(|| vec![0u8; self.page_size]))
    }
    fn write_page(&mut self, id: NodeId, data: &[u8]) -> Result<()> {
        self.cache.insert(id.0, data.to_vec());
        Ok(())
    }
}

struct DiscardUndo;
impl lattice::txn::UndoSink for DiscardUndo {
    fn push(&mut self, _entry: UndoEntry) -> Result<()> {
        Ok(())
    }
}

#[test]
fn write_then_reopen_from_disk_preserves_value() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("lattice.pages");

    let mut store = FilePageStore::create(&path, 4096).unwrap();
    let mut raw = leaf_value::encode_value_header(0, false).unwrap();
    let mut undo = DiscardUndo;
    let payload = b"hello from disk";
    leaf_value::write(
        &mut raw,
        &mut store,
        &mut undo,
        NodeId::new(1),
        b"k",
        0,
        WriteSource::Bytes(payload),
        512,
    )
    .unwrap();
    store.write_page(NodeId::new(1), &raw).unwrap();

    store.flush_to_disk().unwrap();

    let reloaded = store.reload_from_disk(1).unwrap();
    assert_eq!(&reloaded[..raw.len()], &raw[..]);

    let mut out = vec![0u8; payload.len()];
    let n = leaf_value::read(&raw, &store, 0, &mut out, 0, payload.len()).unwrap();
    assert_eq!(n as usize, payload.len());
    assert_eq!(&out, payload);
}

#[test]
fn corrupted_page_on_disk_fails_checksum_verification() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("lattice.pages");

    let mut store = FilePageStore::create(&path, 4096).unwrap();
    store.alloc_page().unwrap();
    store.flush_to_disk().unwrap();

    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(8)).unwrap();
    file.write_all(&[0xFFu8]).unwrap();

    assert!(store.reload_from_disk(1).is_err());
}
