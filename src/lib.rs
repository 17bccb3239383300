//! BurrowDB core: the storage and concurrency engine of an educational
//! relational database. It provides a fixed-capacity buffer pool with LRU-K
//! replacement, a concurrent B+ tree index built on latch crabbing, a
//! multi-granularity lock manager with deadlock detection, and a 2PL
//! transaction manager with undo-based abort.

pub mod buffer;
pub mod config;
pub mod error;
pub mod storage;
pub mod transaction;
pub mod utils;
