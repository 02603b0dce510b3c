//! Strata: a content-addressed chunk store.
//!
//! Strata persists opaque binary chunks keyed by the 20-byte content hash
//! of their bytes, and atomically advances a single *root* address that
//! names the current logical state of the repository built on top of it.
//!
//! # Architecture
//!
//! ```text
//!            put                      get / has
//!             |                           |
//!             v                           v
//!      +-----------+   rotate   +------------------+
//!      | Memtable  |----------->|    Table set     |
//!      | (RAM, )   |            |  novel | upstream |
//!      +-----------+            +------------------+
//!                                    |        ^
//!                          persist   v        |  open
//!                               +-----------------+
//!                               |    Persister    |  table files
//!                               |  (fs / blob)    |  (immutable)
//!                               +-----------------+
//!                                        |
//!                             commit CAS v
//!                               +-----------------+
//!                               |    Manifest     |  {lock, root, specs}
//!                               +-----------------+
//! ```
//!
//! Writes buffer in a memtable, rotate into *novel* tables, and become
//! durable when `commit` publishes them in the manifest alongside the new
//! root. Reads probe memtable, novel tables, then the *upstream* tables
//! the manifest names, newest first, stopping at the first hit. Multiple
//! writers race through an optimistic compare-and-set on the manifest's
//! lock hash; once the upstream table count crosses a threshold, commit
//! conjoins the smallest tables into one.

pub mod cache;
pub mod chunk;
pub mod config;
pub mod conjoin;
pub mod error;
pub mod flock;
pub mod hash;
pub mod manifest;
pub mod memtable;
pub mod persist;
pub mod runtime;
pub mod stats;
pub mod store;
pub mod table;
pub mod tableset;

pub use chunk::Chunk;
pub use config::StoreConfig;
pub use error::{Error, Result};
pub use hash::Addr;
pub use runtime::Runtime;
pub use store::BlockStore;
