//! Storage abstraction for blob-backed filesystems.
//!
//! The block cache talks to cloud storage only through [`StorageBackend`]:
//!
//! - **Read** - byte ranges of committed objects
//! - **Stage** - upload a block under an opaque, uncommitted id
//! - **Commit** - publish an ordered list of staged ids as the object content
//! - **List** - the committed block list of an object
//!
//! [`MemoryBackend`] is a complete in-process implementation with fault
//! injection, used by tests and local experiments.

mod error;
mod memory;
mod traits;

pub use error::StorageError;
pub use memory::{CommitRecord, MemoryBackend};
pub use traits::{CommittedBlock, ObjectAttr, StorageBackend};
