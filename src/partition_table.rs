//! The in-memory directory of open partitions, plus the startup scan that
//! rebuilds `lastIndex` and `commitIndex` from whatever partition files
//! already exist on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, warn};

use crate::error::Result;
use crate::partition::Partition;

/// Fixed name of the node-state file; excluded from the startup partition
/// scan because it doesn't parse as a partition number.
pub const NODE_STATE_FILE_NAME: &str = ".state";

pub struct PartitionTable {
    dir: PathBuf,
    records_per_partition: u64,
    max_record_size: u64,
    partitions: HashMap<u64, Partition>,
}

/// Result of scanning a log directory at startup: the populated table plus
/// the `lastIndex`/`commitIndex` derived from what was found.
pub struct StartupScan {
    pub table: PartitionTable,
    pub last_index: i64,
    pub commit_index: i64,
}

impl PartitionTable {
    pub fn partition_of(index: u64, records_per_partition: u64) -> u64 {
        index / records_per_partition
    }

    pub fn slot_of(index: u64, records_per_partition: u64) -> u64 {
        index % records_per_partition
    }

    fn partition_path(&self, number: u64) -> PathBuf {
        self.dir.join(number.to_string())
    }

    /// Returns the partition for `number`, opening and registering it if
    /// this is the first reference.
    pub fn get_or_create(&mut self, number: u64) -> Result<&mut Partition> {
        if !self.partitions.contains_key(&number) {
            let path = self.partition_path(number);
            let partition = Partition::open(&path, number, self.records_per_partition, self.max_record_size)?;
            partition.flush_headers()?;
            debug!(partition = number, "opened partition on demand");
            self.partitions.insert(number, partition);
        }
        Ok(self.partitions.get_mut(&number).unwrap())
    }

    pub fn try_get(&self, number: u64) -> Option<&Partition> {
        self.partitions.get(&number)
    }

    pub fn try_get_mut(&mut self, number: u64) -> Option<&mut Partition> {
        self.partitions.get_mut(&number)
    }

    /// The lowest partition number currently present, if any.
    pub fn lowest_number(&self) -> Option<u64> {
        self.partitions.keys().copied().min()
    }

    pub fn remove(&mut self, number: u64) -> Option<Partition> {
        self.partitions.remove(&number)
    }

    pub fn contains(&self, number: u64) -> bool {
        self.partitions.contains_key(&number)
    }

    pub fn records_per_partition(&self) -> u64 {
        self.records_per_partition
    }

    /// Enumerates `dir`, opening every entry whose name parses as a
    /// non-negative integer as a partition and folding its on-disk
    /// counters into `lastIndex`/`commitIndex`. Non-integer names
    /// (notably [`NODE_STATE_FILE_NAME`]) are silently skipped.
    #[instrument(skip(dir))]
    pub fn scan_startup(dir: &Path, records_per_partition: u64, max_record_size: u64) -> Result<StartupScan> {
        std::fs::create_dir_all(dir)?;

        let mut partitions = HashMap::new();
        let mut last_index: i64 = 0;
        let mut commit_index: i64 = 0;

        let mut numbers: Vec<u64> = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name == NODE_STATE_FILE_NAME {
                continue;
            }
            if let Ok(number) = name.parse::<u64>() {
                numbers.push(number);
            } else {
                warn!(name, "skipping non-partition file during startup scan");
            }
        }
        numbers.sort_unstable();

        for number in numbers {
            let partition = Partition::open(&dir.join(number.to_string()), number, records_per_partition, max_record_size)?;
            commit_index += partition.committed_entries() as i64;
            last_index += partition.occupied_count()? as i64;
            partitions.insert(number, partition);
        }

        // Partition 0's occupied-slot count includes the sentinel's
        // virtual occupancy of global index 0; the sentinel isn't a real
        // appended entry, so it's backed out exactly once here.
        if partitions.contains_key(&0) {
            last_index -= 1;
        }

        debug!(last_index, commit_index, partitions = partitions.len(), "startup scan complete");

        Ok(StartupScan {
            table: PartitionTable { dir: dir.to_path_buf(), records_per_partition, max_record_size, partitions },
            last_index,
            commit_index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_and_slot_arithmetic() {
        assert_eq!(PartitionTable::partition_of(0, 4), 0);
        assert_eq!(PartitionTable::partition_of(3, 4), 0);
        assert_eq!(PartitionTable::partition_of(4, 4), 1);
        assert_eq!(PartitionTable::slot_of(5, 4), 1);
    }

    #[test]
    fn scan_of_empty_directory_yields_zero_indices() {
        let dir = tempfile::tempdir().unwrap();
        let scan = PartitionTable::scan_startup(dir.path(), 4, 256).unwrap();
        assert_eq!(scan.last_index, 0);
        assert_eq!(scan.commit_index, 0);
        assert!(scan.table.try_get(0).is_none());
    }

    #[test]
    fn scan_ignores_node_state_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".state"), []).unwrap();
        let scan = PartitionTable::scan_startup(dir.path(), 4, 256).unwrap();
        assert_eq!(scan.last_index, 0);
        assert!(scan.table.try_get(0).is_none());
    }

    #[test]
    fn scan_recovers_last_index_across_two_partitions() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut table = PartitionTable {
                dir: dir.path().to_path_buf(),
                records_per_partition: 4,
                max_record_size: 256,
                partitions: HashMap::new(),
            };
            let entry = crate::entry::NewEntry::new(1, "a", "text/plain", b"x".to_vec());
            table.get_or_create(0).unwrap().write(1, &entry).unwrap();
            table.get_or_create(0).unwrap().write(2, &entry).unwrap();
            table.get_or_create(0).unwrap().write(3, &entry).unwrap();
            table.get_or_create(1).unwrap().write(0, &entry).unwrap();
            table.get_or_create(1).unwrap().write(1, &entry).unwrap();
        }

        let scan = PartitionTable::scan_startup(dir.path(), 4, 256).unwrap();
        assert_eq!(scan.last_index, 5);
    }
}
