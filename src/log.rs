//! The persistent-log façade: the single object Raft talks to. Sequences
//! every read, append, commit, vote, and term operation through one async
//! reader/writer lock and routes each log index to its owning partition.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_lock::RwLock;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::entry::{Entry, NewEntry};
use crate::error::{PersistenceError, Result};
use crate::node_state::{Endpoint, NodeStateFile};
use crate::partition_table::{PartitionTable, NODE_STATE_FILE_NAME};

/// Construction parameters for [`PersistentLog::open`]. Grouped into a
/// struct purely for call-site readability; this is a plain constructor
/// argument, not a file- or environment-driven configuration system.
#[derive(Debug, Clone)]
pub struct LogOptions {
    pub location: PathBuf,
    pub records_per_partition: u64,
    pub max_record_size: u64,
}

/// Fired after a commit durably raises the commit index, before `commit`
/// returns to its own caller. `start_index` is the first newly-committed
/// index; `count` is how many indices were newly committed.
#[derive(Debug, Clone, Copy)]
pub struct CommittedEvent {
    pub start_index: i64,
    pub count: i64,
}

/// The consumer-facing contract Raft sees. Object-safe so a node can hold
/// a `dyn Log`.
#[async_trait]
pub trait Log: Send + Sync {
    fn get_last_index(&self, committed: bool) -> i64;
    async fn get_entries(&self, start_index: i64, end_index: i64) -> Result<Vec<Entry>>;
    async fn append(&self, entries: Vec<NewEntry>, start_index: Option<i64>, cancel: CancellationToken) -> Result<i64>;
    async fn commit(&self, end_index: Option<i64>, cancel: CancellationToken) -> Result<i64>;
    async fn force_compaction(&self, cancel: CancellationToken) -> Result<i64>;
    fn first(&self) -> &Entry;
    fn term(&self) -> i64;
    async fn increment_term(&self, cancel: CancellationToken) -> Result<i64>;
    async fn update_term(&self, value: i64, cancel: CancellationToken) -> Result<()>;
    async fn is_voted_for(&self, member: &Endpoint) -> Result<bool>;
    async fn update_voted_for(&self, member: Option<&Endpoint>, cancel: CancellationToken) -> Result<()>;
}

struct Inner {
    partitions: PartitionTable,
    node_state: NodeStateFile,
}

/// A durable, memory-mapped append log and hard-state store for one Raft
/// node.
pub struct PersistentLog {
    dir: PathBuf,
    records_per_partition: u64,
    inner: RwLock<Inner>,
    last_index: AtomicI64,
    commit_index: AtomicI64,
    term_cache: Arc<AtomicI64>,
    committed_tx: broadcast::Sender<CommittedEvent>,
}

/// How many of partition `p`'s slots count as committed given a global
/// commit index of `target`. Partition 0's slot 0 belongs to the sentinel,
/// never a real entry, so it's excluded from the count; every other slot
/// (and every slot of every other partition) counts once its global index
/// falls within `[0, target]`.
fn committed_in_partition(p: u64, target: i64, records_per_partition: u64) -> u64 {
    let start = p * records_per_partition;
    let end = start + records_per_partition - 1;
    let real_start = if p == 0 { start + 1 } else { start };
    if target < real_start as i64 || (end as i64) < real_start as i64 {
        return 0;
    }
    let covered_end = target.min(end as i64) as u64;
    covered_end - real_start + 1
}

impl PersistentLog {
    /// Opens (creating if absent) the log directory at `options.location`,
    /// recovering `lastIndex`, `commitIndex`, `term`, and voted-for from
    /// whatever is already on disk.
    #[instrument(skip(options), fields(location = %options.location.display()))]
    pub async fn open(options: LogOptions) -> Result<Self> {
        let LogOptions { location, records_per_partition, max_record_size } = options;

        let scan = PartitionTable::scan_startup(&location, records_per_partition, max_record_size)?;
        let node_state = NodeStateFile::open(&location.join(NODE_STATE_FILE_NAME))?;
        let term_cache = node_state.term_cache();

        info!(
            last_index = scan.last_index,
            commit_index = scan.commit_index,
            term = term_cache.load(Ordering::Acquire),
            "recovered persistent log"
        );

        let (committed_tx, _) = broadcast::channel(64);

        Ok(Self {
            dir: location,
            records_per_partition,
            inner: RwLock::new(Inner { partitions: scan.table, node_state }),
            last_index: AtomicI64::new(scan.last_index),
            commit_index: AtomicI64::new(scan.commit_index),
            term_cache,
            committed_tx,
        })
    }

    pub fn subscribe_committed(&self) -> broadcast::Receiver<CommittedEvent> {
        self.committed_tx.subscribe()
    }

    async fn write_guard(&self, cancel: &CancellationToken) -> Result<async_lock::RwLockWriteGuard<'_, Inner>> {
        tokio::select! {
            guard = self.inner.write() => Ok(guard),
            _ = cancel.cancelled() => Err(PersistenceError::Cancelled),
        }
    }

    fn entry_at(guard: &Inner, idx: i64, records_per_partition: u64) -> Result<Option<Entry>> {
        let pnum = PartitionTable::partition_of(idx as u64, records_per_partition);
        let slot = PartitionTable::slot_of(idx as u64, records_per_partition);
        let real = match guard.partitions.try_get(pnum) {
            Some(partition) => partition.read(slot)?,
            None => None,
        };
        if idx == 0 {
            Ok(Some(real.unwrap_or_else(Entry::sentinel)))
        } else {
            Ok(real)
        }
    }
}

#[async_trait]
impl Log for PersistentLog {
    fn get_last_index(&self, committed: bool) -> i64 {
        if committed {
            self.commit_index.load(Ordering::Acquire)
        } else {
            self.last_index.load(Ordering::Acquire)
        }
    }

    async fn get_entries(&self, start_index: i64, end_index: i64) -> Result<Vec<Entry>> {
        if end_index < start_index {
            return Ok(Vec::new());
        }
        let guard = self.inner.read().await;
        let last = self.last_index.load(Ordering::Acquire);
        let effective_end = end_index.min(last);

        let mut out = Vec::new();
        for idx in start_index..=effective_end {
            match Self::entry_at(&guard, idx, self.records_per_partition)? {
                Some(entry) => out.push(entry),
                None => break,
            }
        }
        Ok(out)
    }

    #[instrument(skip(self, entries, cancel), fields(count = entries.len()))]
    async fn append(&self, entries: Vec<NewEntry>, start_index: Option<i64>, cancel: CancellationToken) -> Result<i64> {
        if entries.is_empty() {
            return Err(PersistenceError::EmptyEntrySet);
        }

        let mut guard = self.write_guard(&cancel).await?;
        let last = self.last_index.load(Ordering::Acquire);
        let first_index = start_index.unwrap_or(last + 1);

        for (i, entry) in entries.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(PersistenceError::Cancelled);
            }
            let idx = first_index + i as i64;
            let pnum = PartitionTable::partition_of(idx as u64, self.records_per_partition);
            let slot = PartitionTable::slot_of(idx as u64, self.records_per_partition);
            let partition = guard.partitions.get_or_create(pnum)?;
            partition.write(slot, entry)?;
            self.last_index.fetch_max(idx, Ordering::AcqRel);
        }

        Ok(first_index)
    }

    #[instrument(skip(self, cancel))]
    async fn commit(&self, end_index: Option<i64>, cancel: CancellationToken) -> Result<i64> {
        let mut guard = self.write_guard(&cancel).await?;
        let last = self.last_index.load(Ordering::Acquire);
        let current_commit = self.commit_index.load(Ordering::Acquire);
        let target = end_index.unwrap_or(last).min(last);

        if target <= current_commit {
            return Ok(0);
        }

        let low_partition = PartitionTable::partition_of(current_commit.max(0) as u64, self.records_per_partition);
        let high_partition = PartitionTable::partition_of(target as u64, self.records_per_partition);
        for pnum in low_partition..=high_partition {
            if let Some(partition) = guard.partitions.try_get_mut(pnum) {
                let count = committed_in_partition(pnum, target, self.records_per_partition);
                partition.set_committed_entries(count);
                partition.flush_headers().map_err(|e| {
                    warn!(partition = pnum, error = %e, "commit aborted: header flush failed");
                    e
                })?;
            }
        }

        self.commit_index.store(target, Ordering::Release);
        let count = target - current_commit;
        let _ = self.committed_tx.send(CommittedEvent { start_index: current_commit + 1, count });
        Ok(count)
    }

    #[instrument(skip(self, cancel))]
    async fn force_compaction(&self, cancel: CancellationToken) -> Result<i64> {
        let mut guard = self.write_guard(&cancel).await?;
        let commit_index = self.commit_index.load(Ordering::Acquire);
        let records_per_partition = self.records_per_partition;
        let mut removed = 0i64;

        loop {
            let Some(lowest) = guard.partitions.lowest_number() else { break };
            let Some(partition) = guard.partitions.try_get(lowest) else { break };
            let occupied = partition.occupied_count()?;
            let end_index = lowest * records_per_partition + records_per_partition - 1;
            let fully_occupied = occupied == records_per_partition;
            let fully_committed = (end_index as i64) <= commit_index;

            if !(fully_occupied && fully_committed) {
                break;
            }

            let partition = guard.partitions.remove(lowest).expect("just observed present");
            partition.close();
            std::fs::remove_file(self.dir.join(lowest.to_string()))?;
            removed += if lowest == 0 { (records_per_partition - 1) as i64 } else { records_per_partition as i64 };
        }

        Ok(removed)
    }

    fn first(&self) -> &Entry {
        &crate::entry::SENTINEL
    }

    fn term(&self) -> i64 {
        self.term_cache.load(Ordering::Acquire)
    }

    async fn increment_term(&self, cancel: CancellationToken) -> Result<i64> {
        let mut guard = self.write_guard(&cancel).await?;
        guard.node_state.increment_term()
    }

    async fn update_term(&self, value: i64, cancel: CancellationToken) -> Result<()> {
        let mut guard = self.write_guard(&cancel).await?;
        guard.node_state.update_term(value)
    }

    async fn is_voted_for(&self, member: &Endpoint) -> Result<bool> {
        let guard = self.inner.read().await;
        Ok(guard.node_state.is_voted_for(member))
    }

    async fn update_voted_for(&self, member: Option<&Endpoint>, cancel: CancellationToken) -> Result<()> {
        let mut guard = self.write_guard(&cancel).await?;
        guard.node_state.update_voted_for(member)
    }
}
