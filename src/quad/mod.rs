//! Quad storage: the bitemporal [`Quad`] record, three B+Tree indexes
//! over its `(graph, subject, predicate, object)` permutations, a
//! write-ahead log, the composed [`store::QuadStore`], and a
//! [`pool::QuadStorePool`] of named stores.

pub mod index;
pub mod pool;
pub mod store;
pub mod types;
pub mod wal;

pub use index::{IndexError, IndexResult, Key, LeafValue, BPlusTree, PAGE_SIZE};
pub use pool::{PoolError, PoolOptions, PoolResult, QuadStorePool};
pub use store::{QuadOp, QuadStore, QuadStoreError, QuadStoreResult, StoreOptions};
pub use types::{Flags, Quad, QuadPattern, TransactionId, ValidTime, DEFAULT_GRAPH};
pub use wal::{SyncMode, Wal, WalEntry, WalError, WalResult};
