//! Content store for cellstore: WAL + in-memory element table.
//!
//! Data elements are write-once and named by an `ExtendedId`. Storage
//! indexes are themselves stored as data elements so every committed
//! version stays addressable by its version token. The WAL provides
//! durability; the memtable provides fast reads.

pub mod element;
pub mod engine;
pub mod fragment;
pub mod index;
pub mod memtable;
pub mod wal;

pub use element::{DataElement, DataElementKind};
pub use engine::{walk_references, Closure, ContentStore, PutOutcome, StorageError};
pub use fragment::{Fragment, FragmentAssembler, FragmentError};
pub use index::{FileHead, PartitionHead, StorageIndex};
pub use wal::{FsyncPolicy, WalEntry, WalError};
