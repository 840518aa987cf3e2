//! Engine-wide utility layer: hybrid logical clock, generic sort/search, and
//! the sub-array LRU cache used by the DTX table and the object cache.

pub mod hlc;
pub mod lru_array;
pub mod sort;
