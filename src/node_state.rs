//! The node-state file: current term and most recent vote, as a small
//! memory-mapped file whose mutations share the log's write lock.

use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, warn};

use crate::error::Result;

/// Total size of the node-state file. Comfortably larger than the fields
/// it holds (max address length 16 bytes for IPv6) to leave room to grow.
pub const NODE_STATE_FILE_LEN: u64 = 1024;

const TERM_OFFSET: usize = 0;
const PORT_OFFSET: usize = 8;
const ADDR_LEN_OFFSET: usize = 12;
const ADDR_OFFSET: usize = 16;

/// The cluster member a node votes for: an IP address and port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub address: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }

    fn address_bytes(&self) -> Vec<u8> {
        match self.address {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        }
    }

    fn from_bytes(bytes: &[u8], port: u16) -> Option<Self> {
        let address = match bytes.len() {
            4 => IpAddr::V4(std::net::Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])),
            16 => {
                let octets: [u8; 16] = bytes.try_into().ok()?;
                IpAddr::V6(std::net::Ipv6Addr::from(octets))
            }
            0 => return None,
            _ => return None,
        };
        Some(Self { address, port })
    }
}

/// Durable term and voted-for state for one node.
pub struct NodeStateFile {
    mmap: MmapMut,
    term_cache: Arc<AtomicI64>,
    voted_for_cache: Option<Endpoint>,
}

impl NodeStateFile {
    /// Opens (creating if absent) the node-state file at `path`, loading
    /// its persisted term and voted-for into in-memory caches.
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| {
                warn!(error = %e, path = %path.display(), "failed to open node-state file");
                e
            })?;

        if file.metadata()?.len() != NODE_STATE_FILE_LEN {
            file.set_len(NODE_STATE_FILE_LEN)?;
            debug!(path = %path.display(), "created new node-state file");
        }

        let mmap = unsafe { MmapOptions::new().len(NODE_STATE_FILE_LEN as usize).map_mut(&file)? };

        let term = i64::from_ne_bytes(mmap[TERM_OFFSET..TERM_OFFSET + 8].try_into().unwrap());
        let port = u32::from_ne_bytes(mmap[PORT_OFFSET..PORT_OFFSET + 4].try_into().unwrap()) as u16;
        let addr_len = u32::from_ne_bytes(mmap[ADDR_LEN_OFFSET..ADDR_LEN_OFFSET + 4].try_into().unwrap()) as usize;
        let voted_for_cache = if addr_len == 0 {
            None
        } else {
            Endpoint::from_bytes(&mmap[ADDR_OFFSET..ADDR_OFFSET + addr_len], port)
        };

        Ok(Self { mmap, term_cache: Arc::new(AtomicI64::new(term)), voted_for_cache })
    }

    /// A shareable handle for lock-free term reads, independent of whatever
    /// lock guards mutation of this struct.
    pub fn term_cache(&self) -> Arc<AtomicI64> {
        self.term_cache.clone()
    }

    pub fn term(&self) -> i64 {
        self.term_cache.load(Ordering::Acquire)
    }

    /// Writes `value` as the current term, flushes, then publishes it to
    /// the cached copy with release ordering.
    pub fn update_term(&mut self, value: i64) -> Result<()> {
        self.mmap[TERM_OFFSET..TERM_OFFSET + 8].copy_from_slice(&value.to_ne_bytes());
        self.mmap.flush().map_err(|e| {
            warn!(error = %e, "failed to flush term update");
            e
        })?;
        self.term_cache.store(value, Ordering::Release);
        Ok(())
    }

    /// Atomically bumps the cached term, persists it, and returns the new
    /// value.
    pub fn increment_term(&mut self) -> Result<i64> {
        let new_term = self.term_cache.load(Ordering::Acquire) + 1;
        self.update_term(new_term)?;
        Ok(new_term)
    }

    /// True if nothing has been voted for this term, or if `endpoint`
    /// matches the persisted vote.
    pub fn is_voted_for(&self, endpoint: &Endpoint) -> bool {
        match &self.voted_for_cache {
            None => true,
            Some(current) => current == endpoint,
        }
    }

    /// Persists `endpoint` as the current vote, or clears it when `None`.
    pub fn update_voted_for(&mut self, endpoint: Option<&Endpoint>) -> Result<()> {
        match endpoint {
            None => {
                self.mmap[PORT_OFFSET..PORT_OFFSET + 4].copy_from_slice(&0u32.to_ne_bytes());
                self.mmap[ADDR_LEN_OFFSET..ADDR_LEN_OFFSET + 4].copy_from_slice(&0u32.to_ne_bytes());
            }
            Some(endpoint) => {
                let addr_bytes = endpoint.address_bytes();
                self.mmap[PORT_OFFSET..PORT_OFFSET + 4]
                    .copy_from_slice(&(endpoint.port as u32).to_ne_bytes());
                self.mmap[ADDR_LEN_OFFSET..ADDR_LEN_OFFSET + 4]
                    .copy_from_slice(&(addr_bytes.len() as u32).to_ne_bytes());
                self.mmap[ADDR_OFFSET..ADDR_OFFSET + addr_bytes.len()].copy_from_slice(&addr_bytes);
            }
        }
        self.mmap.flush().map_err(|e| {
            warn!(error = %e, "failed to flush voted-for update");
            e
        })?;
        self.voted_for_cache = endpoint.copied();
        Ok(())
    }
}
