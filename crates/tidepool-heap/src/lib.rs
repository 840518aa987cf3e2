//! Persistent heap: a zone/chunk/run allocator over a memory-mapped backing
//! file with write-ahead-logged transactions.
//!
//! The pool file is `PoolHeader (4 KiB) | HeapHeader (1 KiB) | zones...`.
//! Each zone carries a 64-byte header, an array of 8-byte chunk headers and
//! the 256 KiB chunk bodies. A chunk is free, used by a huge allocation, or
//! subdivided into a run of equal units tracked by a bitmap.
//!
//! All mutation goes through a redo log: entries are buffered and applied to
//! the volatile image as the transaction runs, and reach the mapped file only
//! after the commit record is durable. An aborted transaction rolls the image
//! back from captured undo words and the file never changes.

mod alloc_class;
mod bitmap;
mod heap;
mod layout;
mod wal;

pub use alloc_class::{AllocClass, ClassSet, HeaderType, CLASS_HUGE};
pub use bitmap::RunBitmap;
pub use heap::{ActionToken, Heap, HeapConfig, HeapStats};
pub use layout::{
    chunk_flags, ChunkHeader, ChunkType, CHUNK_SIZE, HEAP_HDR_SIZE, POOL_HDR_SIZE, POOL_ROOT_OFF,
    POOL_ROOT_SIZE, ZONE_HDR_SIZE, ZONE_MAX_CHUNKS, ZONE_META_SIZE,
};
pub use wal::{WalEntry, WalEntryKind};

// The chunk-header bit layout and every hashed key rely on host-native
// little-endian byte order.
#[cfg(not(target_endian = "little"))]
compile_error!("tidepool-heap requires a little-endian target");
