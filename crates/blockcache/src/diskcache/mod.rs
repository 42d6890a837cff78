//! Optional local-disk spill cache for blocks.
//!
//! Blocks are mirrored to `root/<path>::<index>` after a download or upload,
//! and read back before going to the network. Entries are tracked by an
//! LRU-with-timeout policy; a background evictor drops idle entries and
//! drains the cache between usage watermarks.

mod error;
mod locks;
mod policy;
mod spill;

pub use error::DiskCacheError;
pub use locks::KeyLocks;
pub use policy::{SpillEntry, SpillPolicy};
pub use spill::{spill_key, DiskSpillCache, DiskSpillStats};
