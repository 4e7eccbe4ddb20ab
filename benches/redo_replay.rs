//! Redo replay engine throughput: how fast a decoder plus
//! worker pool can apply a stream of `txnStore` records, both for a
//! single hot transaction (serialized onto one worker) and for many
//! independent transactions (spread across the pool). Sweeps a
//! concurrency-like parameter, measuring with `Throughput::Elements`.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use lattice::redo::{
    encode_record, CursorId, IndexCache, IndexHandle, LeaderNotifyOutcome, ReplayTarget, ReplicaEngine,
    ReplicationController, RedoRecord, IndexId,
};
use lattice::txn::{LockManager, LockMode, LockTimeout, TxnId};
use lattice::{DatabaseConfig, Result};

#[derive(Default)]
struct NullIndex;
impl IndexHandle for NullIndex {
    fn store(&self, _txn: Option<TxnId>, _key: &[u8], _value: Option<&[u8]>) -> Result<()> {
        Ok(())
    }
    fn cursor_register(&self, _cursor: CursorId) -> Result<()> {
        Ok(())
    }
    fn cursor_unregister(&self, _cursor: CursorId) -> Result<()> {
        Ok(())
    }
    fn cursor_find(&self, _cursor: CursorId, _key: &[u8]) -> Result<()> {
        Ok(())
    }
    fn cursor_store(&self, _cursor: CursorId, _txn: TxnId, _value: Option<&[u8]>) -> Result<()> {
        Ok(())
    }
    fn cursor_value_set_length(&self, _cursor: CursorId, _txn: TxnId, _len: u64) -> Result<()> {
        Ok(())
    }
    fn cursor_value_write(&self, _cursor: CursorId, _txn: TxnId, _pos: u64, _bytes: &[u8]) -> Result<()> {
        Ok(())
    }
    fn cursor_value_clear(&self, _cursor: CursorId, _txn: TxnId, _pos: u64, _len: u64) -> Result<()> {
        Ok(())
    }
    fn apply_custom(&self, _txn: TxnId, _payload: &[u8]) -> Result<()> {
        Ok(())
    }
}

struct NullTarget {
    indexes: Mutex<HashMap<u64, Arc<NullIndex>>>,
}

impl NullTarget {
    fn new() -> Arc<Self> {
        Arc::new(Self {
                indexes: Mutex::new(HashMap::new()),
        })
    }
}

impl ReplayTarget for NullTarget {
    fn open_index(&self, id: IndexId) -> Result<Arc<dyn IndexHandle>> {
        let mut indexes = self.indexes.lock().unwrap();
        let handle = indexes.entry(id.0).or_insert_with(|| Arc::new(NullIndex)).clone();
        let handle: Arc<dyn IndexHandle> = handle;
        Ok(handle)
    }
    fn rename_index(&self, _id: IndexId, _new_name: String) -> Result<()> {
        Ok(())
    }
    fn delete_index(&self, _id: IndexId) -> Result<()> {
        Ok(())
    }
    fn begin_txn(&self, _txn: TxnId) -> Result<()> {
        Ok(())
    }
    fn commit_txn(&self, _txn: TxnId) -> Result<()> {
        Ok(())
    }
    fn rollback_txn(&self, _txn: TxnId) -> Result<()> {
        Ok(())
    }
    fn push_lock(&self, _txn: TxnId, _index: IndexId, _key: &[u8], _mode: LockMode) -> Result<()> {
        Ok(())
    }
    fn apply_custom(&self, _txn: TxnId, _payload: &[u8]) -> Result<()> {
        Ok(())
    }
}

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

struct StayReplica;
impl ReplicationController for StayReplica {
    fn leader_notify(&self) -> Result<LeaderNotifyOutcome> {
        Ok(LeaderNotifyOutcome::StayReplica)
    }
}

fn build_engine(worker_count: usize) -> ReplicaEngine {
    let target = NullTarget::new();
    let target_dyn: Arc<dyn ReplayTarget> = target.clone();
    let cache = Arc::new(IndexCache::new({
                let target = target.clone();
                move |id| target.open_index(id)
    }));
    let config = DatabaseConfig::default().with_replay_workers(worker_count);
    ReplicaEngine::new(target_dyn, Arc::new(NoopLockManager), Arc::new(StayReplica), cache, &config)
}

fn stream_one_hot_transaction(ops: usize) -> Vec<u8> {
    let mut records = vec![RedoRecord::TxnEnter { txn: TxnId(1) }];
    for i in 0..ops {
        records.push(RedoRecord::TxnStore {
                txn: TxnId(1),
                index: IndexId(1),
                key: format!("k{i}").into_bytes(),
                value: Some(format!("v{i}").into_bytes()),
        });
    }
    records.push(RedoRecord::TxnCommitFinal { txn: TxnId(1) });
    records.iter().flat_map(encode_record).collect()
}

fn stream_many_independent_transactions(txns: usize) -> Vec<u8> {
    let mut records = Vec::new();
    for t in 0..txns {
        records.push(RedoRecord::TxnEnter { txn: TxnId(t as u64) });
        records.push(RedoRecord::TxnStore {
                txn: TxnId(t as u64),
                index: IndexId(1),
                key: format!("k{t}").into_bytes(),
                value: Some(format!("v{t}").into_bytes()),
        });
        records.push(RedoRecord::TxnCommitFinal { txn: TxnId(t as u64) });
    }
    records.iter().flat_map(encode_record).collect()
}

fn bench_single_transaction_serialized_on_one_worker(c: &mut Criterion) {
    let mut group = c.benchmark_group("redo_replay_single_transaction");
    for &ops in &[64usize, 512, 4096] {
        group.throughput(Throughput::Elements(ops as u64));
        group.bench_with_input(BenchmarkId::from_parameter(ops), &ops, |b, &ops| {
                let stream = stream_one_hot_transaction(ops);
                b.iter(|| {
                        let engine = build_engine(num_cpus::get().max(1));
                        let mut cursor = Cursor::new(stream.clone());
                        engine.process_stream(&mut cursor).unwrap();
                });
        });
    }
    group.finish();
}

fn bench_many_independent_transactions_spread_across_workers(c: &mut Criterion) {
    let mut group = c.benchmark_group("redo_replay_many_transactions");
    for &txns in &[16usize, 128, 1024] {
        group.throughput(Throughput::Elements(txns as u64));
        group.bench_with_input(BenchmarkId::from_parameter(txns), &txns, |b, &txns| {
                let stream = stream_many_independent_transactions(txns);
                b.iter(|| {
                        let engine = build_engine(num_cpus::get().max(1));
                        let mut cursor = Cursor::new(stream.clone());
                        engine.process_stream(&mut cursor).unwrap();
                });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_single_transaction_serialized_on_one_worker,
    bench_many_independent_transactions_spread_across_workers
);
criterion_main!(benches);
