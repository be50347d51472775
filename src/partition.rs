//! Partition files: fixed-capacity, memory-mapped containers for a
//! contiguous run of log entries.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use memmap2::MmapOptions;
use tracing::{debug, instrument, warn};

use crate::entry::{decode_slot, write_slot, Entry, NewEntry};
use crate::error::{PersistenceError, Result};

/// Bytes reserved at the front of every partition file for the two header
/// counters (`indexOffset`, `committedEntries`).
pub const HEADER_LEN: u64 = 16;

const INDEX_OFFSET_OFFSET: usize = 0;
const COMMITTED_ENTRIES_OFFSET: usize = 8;

/// A single partition file: `recordsPerPartition` fixed-size slots behind a
/// pair of header counters.
pub struct Partition {
    number: u64,
    file: Arc<File>,
    header: memmap2::MmapMut,
    records_per_partition: u64,
    max_record_size: u64,
    disposed: Arc<AtomicBool>,
}

impl Partition {
    /// Opens (creating if absent) the partition file at `path`, named for
    /// partition number `number`. Newly created files are zero-filled to
    /// their full size and have their `indexOffset` header written and
    /// flushed.
    #[instrument(skip(path), fields(partition = number))]
    pub fn open(
        path: &Path,
        number: u64,
        records_per_partition: u64,
        max_record_size: u64,
    ) -> Result<Self> {
        let file_len = HEADER_LEN + records_per_partition * max_record_size;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| {
                warn!(error = %e, path = %path.display(), "failed to open partition file");
                e
            })?;

        let existing_len = file.metadata()?.len();
        let is_new = existing_len != file_len;
        if is_new {
            file.set_len(file_len).map_err(|e| {
                warn!(error = %e, path = %path.display(), "failed to size partition file");
                e
            })?;
        }

        let mut header = unsafe { MmapOptions::new().len(HEADER_LEN as usize).map_mut(&file)? };

        if is_new {
            header[INDEX_OFFSET_OFFSET..INDEX_OFFSET_OFFSET + 8]
                .copy_from_slice(&(number * records_per_partition).to_ne_bytes());
            header.flush()?;
            debug!(partition = number, "created new partition file");
        }

        Ok(Self {
            number,
            file: Arc::new(file),
            header,
            records_per_partition,
            max_record_size,
            disposed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn records_per_partition(&self) -> u64 {
        self.records_per_partition
    }

    pub fn index_offset(&self) -> u64 {
        u64::from_ne_bytes(self.header[INDEX_OFFSET_OFFSET..INDEX_OFFSET_OFFSET + 8].try_into().unwrap())
    }

    pub fn committed_entries(&self) -> u64 {
        u64::from_ne_bytes(
            self.header[COMMITTED_ENTRIES_OFFSET..COMMITTED_ENTRIES_OFFSET + 8]
                .try_into()
                .unwrap(),
        )
    }

    /// Writes the committed-entries counter. Does not flush; callers flush
    /// as part of a larger commit operation via [`Partition::flush_headers`].
    pub fn set_committed_entries(&mut self, value: u64) {
        self.header[COMMITTED_ENTRIES_OFFSET..COMMITTED_ENTRIES_OFFSET + 8]
            .copy_from_slice(&value.to_ne_bytes());
    }

    pub fn flush_headers(&self) -> Result<()> {
        self.header.flush().map_err(|e| {
            warn!(partition = self.number, error = %e, "failed to flush partition headers");
            e.into()
        })
    }

    fn slot_offset(&self, slot_index: u64) -> u64 {
        HEADER_LEN + slot_index * self.max_record_size
    }

    /// Reads the entry at `slotIndex`, or `None` if the slot is unoccupied.
    /// The returned entry's payload is a back-reference into this
    /// partition's file; it stays readable for as long as this partition
    /// remains open.
    pub fn read(&self, slot_index: u64) -> Result<Option<Entry>> {
        let offset = self.slot_offset(slot_index);
        let view = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(self.max_record_size as usize)
                .map(&*self.file)?
        };

        let Some(decoded) = decode_slot(&view)? else {
            return Ok(None);
        };

        Ok(Some(Entry::mapped(
            decoded.name,
            decoded.content_type,
            decoded.term,
            Arc::downgrade(&self.file),
            offset + decoded.content_offset_in_slot as u64,
            decoded.content_length,
            self.disposed.clone(),
        )))
    }

    /// Writes `entry` into `slotIndex`, following the crash-safe ordering:
    /// metadata and payload are written and flushed first, then the
    /// present flag is set and flushed separately. A crash between the two
    /// flushes leaves the slot reading back as empty.
    pub fn write(&self, slot_index: u64, entry: &NewEntry) -> Result<()> {
        let encoded_len = entry.encoded_len() as u64;
        if encoded_len > self.max_record_size {
            return Err(PersistenceError::EntryTooLarge {
                encoded_size: encoded_len,
                max_record_size: self.max_record_size,
            });
        }

        let offset = self.slot_offset(slot_index);
        let mut view = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(self.max_record_size as usize)
                .map_mut(&*self.file)?
        };

        write_slot(&mut view, entry);
        view.flush().map_err(|e| {
            warn!(partition = self.number, slot_index, error = %e, "failed to flush slot body");
            e
        })?;

        view[0] = 1;
        view.flush().map_err(|e| {
            warn!(partition = self.number, slot_index, error = %e, "failed to flush slot present flag");
            e.into()
        })
    }

    /// Counts occupied slots from the front until the first empty one.
    /// Partition 0's slot 0 is the sentinel's home: it counts as occupied
    /// even when nothing has physically been written there, so scanning
    /// starts from slot 1 with an implicit count of 1. A real entry later
    /// written at global index 0 still lands in that same slot and is
    /// read back normally; it just never makes the virtual count wrong.
    pub fn occupied_count(&self) -> Result<u64> {
        let data = unsafe {
            MmapOptions::new()
                .offset(HEADER_LEN)
                .len((self.records_per_partition * self.max_record_size) as usize)
                .map(&*self.file)?
        };

        let (mut count, start_slot) = if self.number == 0 { (1u64, 1u64) } else { (0u64, 0u64) };
        for slot in start_slot..self.records_per_partition {
            let start = (slot * self.max_record_size) as usize;
            if data[start] == 0 {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Disposes this partition's mappings. Outstanding entries' payload
    /// reads subsequently fail with `Disposed`.
    pub fn close(self) {
        self.disposed.store(true, Ordering::Release);
        debug!(partition = self.number, "closed partition");
    }
}
