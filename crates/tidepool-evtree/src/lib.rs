//! Versioned extent index.
//!
//! Each entry is a byte-range `[lo, hi]` of one value stream, stamped with
//! the epoch and minor epoch that wrote it. Readers carry a [`Filter`] and
//! see the youngest stamp for every byte; older extents underneath are
//! reported covered or partial, and a punch stamp masks everything older
//! than it. The index itself is an order-fixed tree keyed directly by
//! `(lo, epoch, minor)`.

mod entry;
mod tree;


pub use entry::{EvtEntry, EVT_ENTRY_SIZE};
pub use tree::{
    register_class, iter_flags, Evtree, Filter, Segment, TaggedEntry, Visibility, EVT_CLASS_ID,
};
