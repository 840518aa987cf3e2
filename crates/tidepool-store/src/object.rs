//! Volatile object cache.
//!
//! Maps `(container, unit oid)` to the object's record offset through the
//! sub-array LRU cache. Holders are reference-counted; a handle released
//! with the evict flag (or whose entry was killed by an object punch) drops
//! out of the cache on last release.

use std::collections::HashMap;

use tidepool_common::lru_array::{LruArray, LruCallbacks};
use tidepool_error::{Result, StoreError};
use tidepool_types::{ContId, RawOff, UnitOid};

/// Hold-time behaviour flags.
pub mod obj_flags {
    /// Require the object to be visible at the hold epoch.
    pub const VISIBLE: u32 = 1 << 0;
    /// Create the object if it does not exist.
    pub const CREATE: u32 = 1 << 1;
    /// The holder intends to kill a dkey subtree.
    pub const KILL_DKEY: u32 = 1 << 2;
    /// The holder is an epoch-discard pass.
    pub const DISCARD: u32 = 1 << 3;
    /// The holder is an aggregation pass.
    pub const AGGREGATE: u32 = 1 << 4;
}

#[derive(Default)]
struct ObjSlot {
    obj_off: u64,
    refcount: u32,
    kill: bool,
}

/// A held cache entry. Must be released back to the cache.
#[derive(Debug, Clone, Copy)]
pub struct ObjHandle {
    pub oid: UnitOid,
    pub obj_off: RawOff,
    pub flags: u32,
    idx: u32,
    key: u64,
}

/// The cache proper.
pub struct ObjCache {
    lru: LruArray<ObjSlot>,
    index: HashMap<(ContId, UnitOid), (u32, u64)>,
}

fn cache_key(cont: &ContId, oid: &UnitOid) -> u64 {
    let mut buf = [0u8; 32];
    buf[0..16].copy_from_slice(cont.as_bytes());
    buf[16..32].copy_from_slice(&oid.to_bytes());
    let h = xxhash_rust::xxh3::xxh3_64(&buf);
    if h == 0 {
        1
    } else {
        h
    }
}

impl ObjCache {
    pub fn new(capacity: u32) -> Result<ObjCache> {
        Ok(ObjCache {
            lru: LruArray::new(capacity, 4, 0, LruCallbacks::default())?,
            index: HashMap::new(),
        })
    }

    /// Hold the cache entry for `oid`, seating it at `obj_off` on a miss.
    pub fn hold(
        &mut self,
        cont: ContId,
        oid: UnitOid,
        obj_off: RawOff,
        flags: u32,
    ) -> Result<ObjHandle> {
        if let Some(&(idx, key)) = self.index.get(&(cont, oid)) {
            if let Some(slot) = self.lru.lookup(idx, key) {
                slot.refcount += 1;
                slot.obj_off = obj_off.get();
                return Ok(ObjHandle {
                    oid,
                    obj_off,
                    flags,
                    idx,
                    key,
                });
            }
            // Stale mapping after a silent recycle.
            self.index.remove(&(cont, oid));
        }

        let key = cache_key(&cont, &oid);
        let (idx, slot) = match self.lru.find_free(key) {
            Ok(found) => found,
            Err(StoreError::Busy) => {
                self.evict_one_idle();
                self.lru.find_free(key)?
            }
            Err(err) => return Err(err),
        };
        *slot = ObjSlot {
            obj_off: obj_off.get(),
            refcount: 1,
            kill: false,
        };
        self.index.insert((cont, oid), (idx, key));
        Ok(ObjHandle {
            oid,
            obj_off,
            flags,
            idx,
            key,
        })
    }

    /// Drop one unheld entry to make room.
    fn evict_one_idle(&mut self) {
        let candidates: Vec<((ContId, UnitOid), u32, u64)> = self
            .index
            .iter()
            .map(|(&ck, &(idx, key))| (ck, idx, key))
            .collect();
        for (ck, idx, key) in candidates {
            let idle = self
                .lru
                .peek(idx, key)
                .is_some_and(|slot| slot.refcount == 0);
            if idle {
                self.lru.evict(idx, key);
                self.index.remove(&ck);
                return;
            }
        }
    }

    /// Release a hold; with `evict` (or a pending kill) the entry drops on
    /// last release.
    pub fn release(&mut self, cont: ContId, handle: ObjHandle, evict: bool) {
        let Some(slot) = self.lru.lookup(handle.idx, handle.key) else {
            return;
        };
        slot.refcount = slot.refcount.saturating_sub(1);
        slot.kill |= evict;
        if slot.refcount == 0 && slot.kill {
            self.lru.evict(handle.idx, handle.key);
            self.index.remove(&(cont, handle.oid));
        }
    }

    /// Mark an entry for eviction (object punch). Held entries drop on
    /// last release; idle ones drop now.
    pub fn kill(&mut self, cont: ContId, oid: UnitOid) {
        if let Some(&(idx, key)) = self.index.get(&(cont, oid)) {
            let evict_now = match self.lru.peek(idx, key) {
                Some(slot) => {
                    slot.kill = true;
                    slot.refcount == 0
                }
                None => false,
            };
            if evict_now {
                self.lru.evict(idx, key);
                self.index.remove(&(cont, oid));
            }
        }
    }

    /// `true` while the entry is cached, for tests.
    #[must_use]
    pub fn contains(&mut self, cont: ContId, oid: UnitOid) -> bool {
        match self.index.get(&(cont, oid)) {
            Some(&(idx, key)) => self.lru.peek(idx, key).is_some(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn oid(n: u64) -> UnitOid {
        UnitOid::new(n, 0, 0)
    }

    #[test]
    fn hold_release_reference_counting() {
        let cont = Uuid::new_v4();
        let mut cache = ObjCache::new(16).unwrap();
        let h1 = cache.hold(cont, oid(1), RawOff::new(4096), 0).unwrap();
        let h2 = cache.hold(cont, oid(1), RawOff::new(4096), 0).unwrap();
        assert_eq!(h1.idx, h2.idx);

        // First release with evict only marks; the entry survives until the
        // last holder lets go.
        cache.release(cont, h1, true);
        assert!(cache.contains(cont, oid(1)));
        cache.release(cont, h2, false);
        assert!(!cache.contains(cont, oid(1)));
    }

    #[test]
    fn kill_defers_until_last_release() {
        let cont = Uuid::new_v4();
        let mut cache = ObjCache::new(16).unwrap();
        let h = cache.hold(cont, oid(2), RawOff::new(8192), 0).unwrap();
        cache.kill(cont, oid(2));
        assert!(cache.contains(cont, oid(2)), "held entries linger");
        cache.release(cont, h, false);
        assert!(!cache.contains(cont, oid(2)));
    }

    #[test]
    fn full_cache_evicts_an_idle_entry() {
        let cont = Uuid::new_v4();
        let mut cache = ObjCache::new(4).unwrap();
        let mut handles = Vec::new();
        for n in 0..4 {
            handles.push(cache.hold(cont, oid(n), RawOff::new(4096 + n), 0).unwrap());
        }
        // Free one slot, keep the rest held.
        let h = handles.remove(1);
        cache.release(cont, h, false);

        cache.hold(cont, oid(99), RawOff::new(9000), 0).unwrap();
        assert!(cache.contains(cont, oid(99)));
        assert!(!cache.contains(cont, oid(1)), "idle entry was evicted");
    }
}
