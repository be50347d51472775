//! A persistent, append-only replicated log for a Raft consensus node.
//!
//! Durable storage for the sequence of entries a cluster replicates and
//! for a node's hard state (current term, most recent vote), backed by
//! fixed-capacity memory-mapped partition files. See [`PersistentLog`]
//! for the entry point and [`Log`] for the trait Raft drives it through.
//!
//! This crate deliberately does not implement the Raft state machine
//! itself, cluster membership, networking, or a wire protocol — it is a
//! storage primitive consumed in-process.

mod codec;
mod entry;
mod error;
mod log;
mod node_state;
mod partition;
mod partition_table;

pub use entry::{Entry, NewEntry};
pub use error::{PersistenceError, Result};
pub use log::{CommittedEvent, Log, LogOptions, PersistentLog};
pub use node_state::Endpoint;
pub use partition_table::NODE_STATE_FILE_NAME;

pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
