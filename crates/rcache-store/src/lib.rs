//! Persistence for the record/replay cache.
//!
//! The cache core talks to storage only through [`Backend`]: put, get,
//! delete and list of opaque records per [`rcache_types::RecordKind`], plus
//! a used-key journal feeding [`purge_unused`]. [`ChunkedStore`] layers the
//! packet protocol on top so payloads larger than one record survive
//! backends with a row-size limit.

pub mod backend;
pub mod chunked;
pub mod flatfile;
pub mod lock;
pub mod memory;
pub mod packet;
pub mod purge;
pub mod sqlite;

pub use backend::Backend;
pub use chunked::{ChunkedStore, DEFAULT_MAX_PACKET_SIZE};
pub use flatfile::FlatFileBackend;
pub use lock::{LockGuard, StoreLock};
pub use memory::MemoryBackend;
pub use packet::Packet;
pub use purge::{PurgeReport, purge_unused};
pub use sqlite::SqliteBackend;
