//! Database-wide configuration knobs.
//!
//! Grounded on `Pager`/`BTree` constructor options
//! (page size, WAL-enabled flag, checkpoint threshold) generalized into one
//! builder struct, plus the redo replay engine's worker-pool defaults.

use std::time::Duration;

/// Default page size in bytes ("typically 4 KiB").
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Maximum size of a fragmented leaf entry before direct-format
/// compaction converts it to indirect pointers.
pub const DEFAULT_MAX_FRAGMENTED_ENTRY_SIZE: usize = 512;

/// Default worker pool size: CPU count.
fn default_replay_workers() -> usize {
    num_cpus::get().max(1)
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Page size in bytes. Must be a power of two and fit a 16-bit offset.
    pub page_size: usize,
    /// Page cache capacity, in pages.
    pub cache_capacity_pages: usize,
    /// Whether the write-ahead redo log is enabled. A leader always wants
    /// this on; some test fixtures and `parallel separator` scratch trees
    /// disable it.
    pub wal_enabled: bool,
    /// Sync the WAL to disk every N logged operations instead of every one.
    pub wal_sync_threshold: usize,
    /// Checkpoint automatically after this many mutations (`None` disables
    /// the automatic trigger; the caller must checkpoint explicitly).
    pub checkpoint_after_updates: Option<usize>,
    /// Largest fragmented-entry size before direct-format compaction
    /// kicks in.
    pub max_fragmented_entry_size: usize,
    /// Redo replay engine: worker pool size.
    pub replay_worker_count: usize,
    /// Redo replay engine: bounded queue depth per worker.
    pub replay_queue_depth: usize,
    /// Redo replay engine: idle timeout after which an unused worker
    /// thread exits.
    pub replay_idle_timeout: Duration,
    /// Parallel separator: maximum number of range-splitting worker
    /// spawns.
    pub parallel_separator_max_workers: usize,
    /// Bounded spin budget used by the cursor frame bind/unbind/rebind
    /// loops before yielding.
    pub cursor_spin_limit: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_capacity_pages: 1024,
            wal_enabled: true,
            wal_sync_threshold: 1,
            checkpoint_after_updates: None,
            max_fragmented_entry_size: DEFAULT_MAX_FRAGMENTED_ENTRY_SIZE,
            replay_worker_count: default_replay_workers(),
            replay_queue_depth: 100,
            replay_idle_timeout: Duration::from_secs(60),
            parallel_separator_max_workers: default_replay_workers().max(4),
            cursor_spin_limit: if default_replay_workers() > 1 { 1024 } else { 0 },
        }
    }
}

impl DatabaseConfig {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_wal_enabled(mut self, enabled: bool) -> Self {
        self.wal_enabled = enabled;
        self
    }

    pub fn with_checkpoint_after_updates(mut self, count: usize) -> Self {
        self.checkpoint_after_updates = Some(count);
        self
    }

    pub fn with_replay_workers(mut self, count: usize) -> Self {
        self.replay_worker_count = count.max(1);
        self
    }
}

/// Install a global `tracing` subscriber reading its filter from
/// `RUST_LOG` (or `"info"` if unset). Mirrors the
/// `tracing_subscriber::fmt` + `EnvFilter` combination the pack's own
/// server binaries wire up at startup; this crate has no binary of its
/// own, so an embedding application calls this once before opening a
/// [`crate::redo::ReplicaEngine`] to see its worker-panic and
/// leader-handoff log lines. The library itself never installs a
/// subscriber implicitly -- `try_init` is a no-op if the caller (or a
/// test harness) already installed one.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_tracing_does_not_panic_when_called_repeatedly() {
        init_tracing();
        init_tracing();
    }
}
