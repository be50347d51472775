//! Log entries: the immutable records the partition format stores, plus the
//! synthetic sentinel returned at index 0 before anything real has been
//! written there.

use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use tokio_util::sync::CancellationToken;

use crate::codec::{read_prefixed_string, varint_len, write_prefixed_string};
use crate::error::{PersistenceError, Result};

/// Bytes past the payload a slot spends on framing: present flag, two
/// varint-prefixed strings at their minimum (empty) length, term, and
/// content length. Used only as a quick pre-check; the real bound is
/// computed per-entry in [`encoded_len`].
pub const MIN_SLOT_OVERHEAD: usize = 1 + 1 + 1 + 8 + 8;

/// An entry awaiting append: everything the caller supplies, before it has
/// a log index or an on-disk location.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub term: i64,
    pub name: String,
    pub content_type: String,
    pub payload: Vec<u8>,
}

impl NewEntry {
    pub fn new(term: i64, name: impl Into<String>, content_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self { term, name: name.into(), content_type: content_type.into(), payload }
    }

    /// Total bytes this entry would occupy in a slot, present flag included.
    pub fn encoded_len(&self) -> usize {
        1 + varint_len(self.name.len() as u64)
            + self.name.len()
            + varint_len(self.content_type.len() as u64)
            + self.content_type.len()
            + 8
            + 8
            + self.payload.len()
    }
}

/// Byte offsets of each field within a slot, derived from the name/type
/// lengths. All offsets are relative to the start of the slot (the present
/// flag is byte 0).
pub(crate) struct SlotLayout {
    pub name_bytes_start: usize,
    pub name_end: usize,
    pub type_bytes_start: usize,
    pub type_end: usize,
    pub term_offset: usize,
    pub length_offset: usize,
    pub content_offset: usize,
}

pub(crate) fn slot_layout(name_len: usize, type_len: usize) -> SlotLayout {
    let name_bytes_start = 1 + varint_len(name_len as u64);
    let name_end = name_bytes_start + name_len;
    let type_bytes_start = name_end + varint_len(type_len as u64);
    let type_end = type_bytes_start + type_len;
    let term_offset = type_end;
    let length_offset = term_offset + 8;
    let content_offset = length_offset + 8;
    SlotLayout { name_bytes_start, name_end, type_bytes_start, type_end, term_offset, length_offset, content_offset }
}

/// Writes `entry` into `slot` (a buffer at least `entry.encoded_len()` bytes
/// long). The present flag (byte 0) is left untouched here — callers flip it
/// to 1 only after this write and the length backpatch are both flushed, per
/// the crash-safe ordering this format requires. Returns the total encoded
/// length (including the present byte).
pub(crate) fn write_slot(slot: &mut [u8], entry: &NewEntry) -> usize {
    let layout = slot_layout(entry.name.len(), entry.content_type.len());

    let mut name_prefix = Vec::new();
    write_prefixed_string(&mut name_prefix, &entry.name);
    slot[1..layout.name_end].copy_from_slice(&name_prefix);

    let mut type_prefix = Vec::new();
    write_prefixed_string(&mut type_prefix, &entry.content_type);
    slot[layout.name_end..layout.type_end].copy_from_slice(&type_prefix);

    slot[layout.term_offset..layout.term_offset + 8].copy_from_slice(&entry.term.to_ne_bytes());

    // Placeholder length: zero until the payload is fully copied in.
    slot[layout.length_offset..layout.length_offset + 8].copy_from_slice(&0u64.to_ne_bytes());

    // Stream the payload through fixed-size chunks rather than one large
    // copy, matching the staging-buffer approach this format calls for.
    let content_end = layout.content_offset + entry.payload.len();
    let mut written = 0;
    while written < entry.payload.len() {
        let take = CHUNK.min(entry.payload.len() - written);
        let dst_start = layout.content_offset + written;
        slot[dst_start..dst_start + take].copy_from_slice(&entry.payload[written..written + take]);
        written += take;
    }

    // Backpatch the real length now that the payload has landed.
    slot[layout.length_offset..layout.length_offset + 8]
        .copy_from_slice(&(entry.payload.len() as u64).to_ne_bytes());

    content_end
}

/// Decoded slot metadata, with the payload left as a `(offset, length)`
/// back-reference rather than copied out.
pub(crate) struct DecodedSlot {
    pub name: String,
    pub content_type: String,
    pub term: i64,
    pub content_offset_in_slot: usize,
    pub content_length: u64,
}

/// Decodes a slot's metadata. Returns `None` if the present flag is unset.
pub(crate) fn decode_slot(slot: &[u8]) -> Result<Option<DecodedSlot>> {
    if slot[0] == 0 {
        return Ok(None);
    }
    let (name, name_consumed) = read_prefixed_string(&slot[1..])?;
    let after_name = 1 + name_consumed;
    let (content_type, type_consumed) = read_prefixed_string(&slot[after_name..])?;
    let after_type = after_name + type_consumed;

    let term_bytes: [u8; 8] = slot[after_type..after_type + 8]
        .try_into()
        .map_err(|_| truncated("term"))?;
    let term = i64::from_ne_bytes(term_bytes);

    let length_offset = after_type + 8;
    let length_bytes: [u8; 8] = slot[length_offset..length_offset + 8]
        .try_into()
        .map_err(|_| truncated("content length"))?;
    let content_length = u64::from_ne_bytes(length_bytes);

    Ok(Some(DecodedSlot {
        name,
        content_type,
        term,
        content_offset_in_slot: length_offset + 8,
        content_length,
    }))
}

fn truncated(field: &str) -> PersistenceError {
    PersistenceError::IoError(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("truncated slot field: {field}"),
    ))
}

/// Staging-buffer size payloads are streamed through on both the write path
/// ([`write_slot`]) and the read path ([`Entry::copy_to`]/`copy_to_async`).
const CHUNK: usize = 64 * 1024;

/// Where an entry's payload bytes actually live.
enum PayloadSource {
    /// The zero-length sentinel payload; nothing to map.
    Empty,
    /// A back-reference into an open partition file. Invalidated when the
    /// partition closes (the file handle is dropped, or `disposed` is set).
    Mapped { file: Weak<File>, offset: u64, len: u64, disposed: Arc<AtomicBool> },
}

/// An immutable log entry. Metadata is eager; the payload is read lazily
/// from the partition's backing file so holding an `Entry` doesn't require
/// holding the log's lock.
pub struct Entry {
    name: String,
    content_type: String,
    term: i64,
    source: PayloadSource,
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("name", &self.name)
            .field("content_type", &self.content_type)
            .field("term", &self.term)
            .field("len", &self.len())
            .finish()
    }
}

impl Entry {
    pub(crate) fn mapped(
        name: String,
        content_type: String,
        term: i64,
        file: Weak<File>,
        offset: u64,
        len: u64,
        disposed: Arc<AtomicBool>,
    ) -> Self {
        Self { name, content_type, term, source: PayloadSource::Mapped { file, offset, len, disposed } }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn term(&self) -> i64 {
        self.term
    }

    pub fn len(&self) -> u64 {
        match &self.source {
            PayloadSource::Empty => 0,
            PayloadSource::Mapped { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maps a fresh read-only view over the payload region and returns a
    /// copy of it. Convenience wrapper around [`Entry::copy_to`] for callers
    /// that just want the bytes.
    pub fn payload(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.len() as usize);
        self.copy_to(&mut buf)?;
        Ok(buf)
    }

    /// Copies the payload into any `std::io::Write` sink, streaming it in
    /// `CHUNK`-sized mapped windows rather than materializing the whole
    /// region at once.
    pub fn copy_to(&self, sink: &mut impl std::io::Write) -> Result<()> {
        let PayloadSource::Mapped { file, offset, len, disposed } = &self.source else {
            return Ok(());
        };
        let mut written = 0u64;
        while written < *len {
            let take = CHUNK.min((*len - written) as usize);
            let view = self.map_chunk(file, *offset + written, take, disposed)?;
            sink.write_all(&view)?;
            written += take as u64;
        }
        Ok(())
    }

    /// Copies the payload into an async sink, honoring `cancel` between
    /// staging-buffer chunks.
    pub async fn copy_to_async(
        &self,
        sink: &mut (impl tokio::io::AsyncWrite + Unpin),
        cancel: CancellationToken,
    ) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let PayloadSource::Mapped { file, offset, len, disposed } = &self.source else {
            return Ok(());
        };

        let mut written = 0u64;
        while written < *len {
            if cancel.is_cancelled() {
                return Err(PersistenceError::Cancelled);
            }
            let take = CHUNK.min((*len - written) as usize);
            let view = self.map_chunk(file, *offset + written, take, disposed)?;
            sink.write_all(&view).await?;
            written += take as u64;
        }
        Ok(())
    }

    /// Builds a fresh, independent copy of the synthetic sentinel entry.
    /// Used wherever a caller needs an owned `Entry` (e.g. in a `Vec`
    /// returned from `get_entries`) rather than a reference to the shared
    /// [`SENTINEL`] static.
    pub fn sentinel() -> Entry {
        Entry { name: String::new(), content_type: String::new(), term: 0, source: PayloadSource::Empty }
    }

    /// Maps and copies out a single `len`-byte window of the payload at
    /// `offset`, the streaming unit both `copy_to` and `copy_to_async` loop
    /// over. `len` is bounded by `CHUNK`, so this never materializes more
    /// than one staging buffer's worth of payload at a time.
    fn map_chunk(&self, file: &Weak<File>, offset: u64, len: usize, disposed: &AtomicBool) -> Result<Vec<u8>> {
        if disposed.load(Ordering::Acquire) {
            return Err(PersistenceError::Disposed);
        }
        let Some(file) = file.upgrade() else {
            return Err(PersistenceError::Disposed);
        };
        if len == 0 {
            return Ok(Vec::new());
        }
        // SAFETY: the file is owned by this process for the lifetime of the
        // mapping and is only ever mutated (not truncated) through this
        // crate's own partition-write path, which never touches bytes
        // already backpatched with a final length.
        let view = unsafe { memmap2::MmapOptions::new().offset(offset).len(len).map(&*file)? };
        Ok(view.to_vec())
    }
}

/// The zero-term, empty-payload entry implicitly occupying index 0 until a
/// real entry is written there. A single process-wide instance, since it
/// carries no partition-specific state.
pub static SENTINEL: Lazy<Entry> = Lazy::new(Entry::sentinel);
