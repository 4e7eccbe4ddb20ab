//! Throughput of the fragmented value engine's hot paths: sequential
//! in-place writes on a small value, and extending writes that force the
//! fragmented representation. One `Criterion` group per operation, with
//! `BenchmarkId` sweeping over payload sizes.

use std::collections::HashMap;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::{rngs::StdRng, RngCore, SeedableRng};

use lattice::node::NodeId;
use lattice::txn::UndoEntry;
use lattice::{PageStore, Result};

struct MemPager {
    page_size: usize,
    next_id: u64,
    pages: HashMap<u64, Vec<u8>>,
}

impl MemPager {
    fn new(page_size: usize) -> Self {
        Self {
            page_size,
            next_id: 1,
            pages: HashMap::new(),
        }
    }
}

impl PageStore for MemPager {
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

struct DiscardUndo;
impl lattice::txn::UndoSink for DiscardUndo {
    fn push(&mut self, _entry: UndoEntry) -> Result<()> {
        Ok(())
    }
}

const SIZES: &[usize] = &[64, 512, 4096, 65_536];

fn random_payload(rng: &mut StdRng, size: usize) -> Vec<u8> {
    let mut buf = vec![0u8; size];
    rng.fill_bytes(&mut buf);
    buf
}

fn bench_in_place_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("leaf_value_in_place_write");
    let mut rng = StdRng::seed_from_u64(0x5EED);
    for &size in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
                let payload = random_payload(&mut rng, size);
                b.iter(|| {
                        let mut raw = lattice::leaf_value::encode_entry(b"k", &payload).unwrap();
                        let mut pager = MemPager::new(4096);
                        let mut undo = DiscardUndo;
                        lattice::leaf_value::write(
                            &mut raw,
                            &mut pager,
                            &mut undo,
                            NodeId::new(1),
                            b"k",
                            0,
                            lattice::leaf_value::WriteSource::Bytes(&payload),
                            512,
                        )
                            .unwrap();
                });
        });
    }
    group.finish();
}

fn bench_extending_write_forces_fragmentation(c: &mut Criterion) {
    let mut group = c.benchmark_group("leaf_value_extending_write");
    let mut rng = StdRng::seed_from_u64(0xC0FFEE);
    for &size in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
                b.iter(|| {
                        let mut raw = lattice::leaf_value::encode_entry(b"k", b"").unwrap();
                        let mut pager = MemPager::new(4096);
                        let mut undo = DiscardUndo;
                        let payload = random_payload(&mut rng, size);
                        lattice::leaf_value::write(
                            &mut raw,
                            &mut pager,
                            &mut undo,
                            NodeId::new(1),
                            b"k",
                            0,
                            lattice::leaf_value::WriteSource::Bytes(&payload),
                            512,
                        )
                            .unwrap();
                });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_in_place_write, bench_extending_write_forces_fragmentation);
criterion_main!(benches);
