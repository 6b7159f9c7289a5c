//! Block caches.
//!
//! - `memory`: clean decoded blocks, in process
//! - `disk`: encrypted blocks on local disk, bounded by a `limiter`
//! - `kv`: the key-value stores the disk cache persists into
pub mod disk;
pub mod kv;
pub mod limiter;
pub mod memory;

pub use disk::{DiskBlockCache, DiskBlockCacheMetadata, DiskCacheStatus};
pub use kv::{FileKvStore, KvStore, MemKvStore, WriteBatch};
pub use limiter::{
    Admission, BackpressureDiskLimiter, BackpressureParams, BackpressureTracker, DiskLimiter, FreeSpaceFn,
    StaticDiskLimiter, statvfs_free_space,
};
pub use memory::BlockCache;
