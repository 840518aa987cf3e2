//! Fixed-capacity LRU cache laid out as an array of keyed slots.
//!
//! The logical array of `N = 2^k` entries is partitioned into `M = 2^j`
//! sub-arrays, each lazily allocated. A slot is addressed by a 32-bit index
//! `(sub << shift) | ent` handed back from [`LruArray::find_free`]; the
//! caller keeps both the index and the 64-bit key it stamped, because under
//! automatic eviction the slot can be silently recycled and the key is the
//! only way to notice.
//!
//! Single-sub-array caches evict the coldest entry automatically when full;
//! multi-sub-array caches never evict on their own (the flag is forced), so
//! an exhausted cache reports `Busy` and the caller must evict.

use std::collections::VecDeque;

use tidepool_error::{Result, StoreError};

/// No automatic eviction; forced on for arrays with multiple sub-arrays.
pub const LRU_FLAG_EVICT_MANUAL: u32 = 1;
/// Freed entries go to the tail of the free ring so indices are not
/// immediately recycled.
pub const LRU_FLAG_REUSE_UNIQUE: u32 = 2;

const NO_IDX: u32 = u32::MAX;

/// Per-entry lifecycle callbacks. All are plain function pointers; per-entry
/// context belongs in the payload itself.
#[derive(Clone, Copy)]
pub struct LruCallbacks<P> {
    /// Invoked when an entry's sub-array is allocated.
    pub on_init: Option<fn(&mut P, u32)>,
    /// Invoked when an entry's sub-array is released.
    pub on_fini: Option<fn(&mut P, u32)>,
    /// Invoked when an entry is evicted, manually or silently.
    pub on_evict: Option<fn(&mut P, u32)>,
}

impl<P> Default for LruCallbacks<P> {
    fn default() -> Self {
        LruCallbacks {
            on_init: None,
            on_fini: None,
            on_evict: None,
        }
    }
}

struct LruEntry {
    /// Caller key; 0 marks a free slot.
    key: u64,
    next: u32,
    prev: u32,
}

struct LruSub<P> {
    /// Head of the LRU ring: the coldest entry. MRU is its predecessor.
    lru: u32,
    /// Head of the free ring.
    free: u32,
    /// Entries currently on the LRU ring.
    used: u32,
    table: Vec<LruEntry>,
    payload: Vec<P>,
}

impl<P> LruSub<P> {
    fn is_allocated(&self) -> bool {
        !self.table.is_empty()
    }
}

// Ring primitives operate on a sub-array's entry table with explicit head
// pointers so the same code serves both the free ring and the LRU ring.

fn ring_remove(table: &mut [LruEntry], head: &mut u32, idx: u32) {
    let prev = table[idx as usize].prev;
    let next = table[idx as usize].next;
    if prev == idx {
        *head = NO_IDX;
    } else {
        table[prev as usize].next = next;
        table[next as usize].prev = prev;
        if *head == idx {
            *head = next;
        }
    }
}

fn ring_insert(table: &mut [LruEntry], head: &mut u32, idx: u32, append: bool) {
    if *head == NO_IDX {
        *head = idx;
        table[idx as usize].prev = idx;
        table[idx as usize].next = idx;
        return;
    }
    let next = *head;
    let tail = table[next as usize].prev;
    table[next as usize].prev = idx;
    table[tail as usize].next = idx;
    table[idx as usize].prev = tail;
    table[idx as usize].next = next;
    if !append {
        *head = idx;
    }
}

fn move_to_mru(table: &mut [LruEntry], lru_head: &mut u32, idx: u32) {
    if table[idx as usize].next == *lru_head {
        // Already the MRU (predecessor of the head).
        return;
    }
    if *lru_head == idx {
        // Rotating the ring is enough.
        *lru_head = table[idx as usize].next;
        return;
    }
    ring_remove(table, lru_head, idx);
    ring_insert(table, lru_head, idx, true);
}

/// Handle-based LRU cache. See the module docs for the addressing scheme.
pub struct LruArray<P> {
    count: u32,
    per_sub: u32,
    shift: u32,
    mask: u32,
    flags: u32,
    evicting: bool,
    cbs: LruCallbacks<P>,
    subs: Vec<LruSub<P>>,
    /// Sub-arrays that still hold at least one free entry (manual mode).
    free_subs: VecDeque<u32>,
    /// Sub-arrays not yet allocated.
    unused_subs: VecDeque<u32>,
}

impl<P: Default> LruArray<P> {
    /// Create an array of `capacity` entries split over `sub_count`
    /// sub-arrays. Both must be powers of two; `sub_count > 1` forces manual
    /// eviction.
    pub fn new(
        capacity: u32,
        sub_count: u32,
        mut flags: u32,
        cbs: LruCallbacks<P>,
    ) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(StoreError::invalid(format!(
                "LRU capacity {capacity} is not a power of two"
            )));
        }
        if sub_count == 0 || !sub_count.is_power_of_two() || sub_count > capacity {
            return Err(StoreError::invalid(format!(
                "LRU sub-array count {sub_count} is not a power of two within capacity"
            )));
        }
        if sub_count > 1 {
            flags |= LRU_FLAG_EVICT_MANUAL;
        }

        let per_sub = capacity / sub_count;
        let mut array = LruArray {
            count: capacity,
            per_sub,
            shift: per_sub.trailing_zeros(),
            mask: per_sub - 1,
            flags,
            evicting: false,
            cbs,
            subs: (0..sub_count)
                .map(|_| LruSub {
                    lru: NO_IDX,
                    free: NO_IDX,
                    used: 0,
                    table: Vec::new(),
                    payload: Vec::new(),
                })
                .collect(),
            free_subs: VecDeque::new(),
            unused_subs: (1..sub_count).collect(),
        };
        // The first sub-array is always materialized up front.
        array.allocate_sub(0);
        array.free_subs.push_back(0);
        Ok(array)
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.count
    }

    #[inline]
    fn manual(&self) -> bool {
        self.flags & LRU_FLAG_EVICT_MANUAL != 0
    }

    fn allocate_sub(&mut self, s: u32) {
        let per = self.per_sub;
        let shift = self.shift;
        let on_init = self.cbs.on_init;
        let sub = &mut self.subs[s as usize];
        debug_assert!(!sub.is_allocated());
        sub.table = (0..per)
            .map(|_| LruEntry {
                key: 0,
                next: NO_IDX,
                prev: NO_IDX,
            })
            .collect();
        sub.payload = (0..per).map(|_| P::default()).collect();
        sub.lru = NO_IDX;
        sub.free = NO_IDX;
        sub.used = 0;
        for e in 0..per {
            ring_insert(&mut sub.table, &mut sub.free, e, true);
        }
        if let Some(cb) = on_init {
            for e in 0..per {
                cb(&mut sub.payload[e as usize], (s << shift) | e);
            }
        }
    }

    /// Claim a free slot, stamping the caller's non-zero `key` on it.
    ///
    /// Manual mode draws from sub-arrays with free entries, materializing an
    /// unused sub-array if needed, and fails with `Busy` once every slot is
    /// live. Automatic mode silently evicts the coldest entry instead.
    pub fn find_free(&mut self, key: u64) -> Result<(u32, &mut P)> {
        if key == 0 {
            return Err(StoreError::invalid("LRU key 0 is reserved for free slots"));
        }

        if self.manual() {
            let s = if let Some(&s) = self.free_subs.front() {
                s
            } else if let Some(s) = self.unused_subs.pop_front() {
                self.allocate_sub(s);
                self.free_subs.push_back(s);
                s
            } else {
                return Err(StoreError::Busy);
            };

            let (e, now_full) = {
                let sub = &mut self.subs[s as usize];
                let e = sub.free;
                debug_assert_ne!(e, NO_IDX, "sub-array on the free list has no free entry");
                ring_remove(&mut sub.table, &mut sub.free, e);
                ring_insert(&mut sub.table, &mut sub.lru, e, true);
                sub.table[e as usize].key = key;
                sub.used += 1;
                (e, sub.free == NO_IDX)
            };
            if now_full {
                self.free_subs.retain(|&x| x != s);
            }
            let idx = (s << self.shift) | e;
            return Ok((idx, &mut self.subs[s as usize].payload[e as usize]));
        }

        // Automatic mode: a single sub-array, so the global index is the
        // entry index.
        let on_evict = self.cbs.on_evict;
        let sub = &mut self.subs[0];
        let e = if sub.free != NO_IDX {
            let e = sub.free;
            ring_remove(&mut sub.table, &mut sub.free, e);
            ring_insert(&mut sub.table, &mut sub.lru, e, true);
            sub.used += 1;
            e
        } else {
            // Silently evict the coldest entry and reuse its slot.
            let e = sub.lru;
            if e == NO_IDX {
                return Err(StoreError::Busy);
            }
            self.evicting = true;
            if let Some(cb) = on_evict {
                cb(&mut self.subs[0].payload[e as usize], e);
            }
            self.evicting = false;
            let sub = &mut self.subs[0];
            move_to_mru(&mut sub.table, &mut sub.lru, e);
            e
        };
        let sub = &mut self.subs[0];
        sub.table[e as usize].key = key;
        Ok((e, &mut sub.payload[e as usize]))
    }

    fn lookup_inner(&mut self, idx: u32, key: u64, touch: bool) -> Option<&mut P> {
        if idx >= self.count || key == 0 {
            return None;
        }
        let s = (idx >> self.shift) as usize;
        let e = idx & self.mask;
        let manual = self.manual();
        let evicting = self.evicting;
        let sub = &mut self.subs[s];
        if !sub.is_allocated() || sub.table[e as usize].key != key {
            return None;
        }
        if touch && !evicting && !manual {
            move_to_mru(&mut sub.table, &mut sub.lru, e);
        }
        Some(&mut sub.payload[e as usize])
    }

    /// Fetch the slot at `idx` if the key still matches, promoting it to MRU
    /// under automatic eviction.
    pub fn lookup(&mut self, idx: u32, key: u64) -> Option<&mut P> {
        self.lookup_inner(idx, key, true)
    }

    /// As [`LruArray::lookup`] but without the MRU promotion.
    pub fn peek(&mut self, idx: u32, key: u64) -> Option<&mut P> {
        self.lookup_inner(idx, key, false)
    }

    /// Evict the slot at `idx` if the key still matches; a stale key is a
    /// no-op.
    pub fn evict(&mut self, idx: u32, key: u64) {
        if idx >= self.count || key == 0 {
            return;
        }
        let s = (idx >> self.shift) as usize;
        let e = idx & self.mask;
        let on_evict = self.cbs.on_evict;
        let reuse_unique = self.flags & LRU_FLAG_REUSE_UNIQUE != 0;

        let newly_free = {
            let sub = &mut self.subs[s];
            if !sub.is_allocated() || sub.table[e as usize].key != key {
                return;
            }
            self.evicting = true;
            if let Some(cb) = on_evict {
                cb(&mut sub.payload[e as usize], idx);
            }
            sub.table[e as usize].key = 0;
            let had_free = sub.free != NO_IDX;
            ring_remove(&mut sub.table, &mut sub.lru, e);
            ring_insert(&mut sub.table, &mut sub.free, e, reuse_unique);
            sub.used -= 1;
            !had_free
        };
        self.evicting = false;
        if self.manual() && newly_free {
            self.free_subs.push_back(s as u32);
        }
    }

    /// Release fully-free sub-arrays after the first. Manual mode only.
    pub fn aggregate(&mut self) {
        if !self.manual() {
            return;
        }
        let on_fini = self.cbs.on_fini;
        for s in 1..self.subs.len() as u32 {
            let freed = {
                let shift = self.shift;
                let sub = &mut self.subs[s as usize];
                if !sub.is_allocated() || sub.used != 0 {
                    false
                } else {
                    if let Some(cb) = on_fini {
                        for e in 0..sub.table.len() as u32 {
                            cb(&mut sub.payload[e as usize], (s << shift) | e);
                        }
                    }
                    sub.table = Vec::new();
                    sub.payload = Vec::new();
                    sub.lru = NO_IDX;
                    sub.free = NO_IDX;
                    true
                }
            };
            if freed {
                self.free_subs.retain(|&x| x != s);
                self.unused_subs.push_back(s);
            }
        }
    }

    /// Re-seat an entry at a known index while rebuilding a previous array
    /// image. Fails with `NoPermission` when the slot is live under a
    /// different key; re-seating the same key is idempotent.
    pub fn alloc_inplace(&mut self, idx: u32, key: u64) -> Result<&mut P> {
        if key == 0 {
            return Err(StoreError::invalid("LRU key 0 is reserved for free slots"));
        }
        if idx >= self.count {
            return Err(StoreError::invalid(format!(
                "index {idx} out of range for LRU array of {}",
                self.count
            )));
        }
        let s = idx >> self.shift;
        let e = idx & self.mask;

        if !self.subs[s as usize].is_allocated() {
            self.allocate_sub(s);
            self.unused_subs.retain(|&x| x != s);
            self.free_subs.push_back(s);
        }

        let now_full = {
            let sub = &mut self.subs[s as usize];
            let held = sub.table[e as usize].key;
            if held == key {
                // Already seated by a previous pass.
                return Ok(&mut self.subs[s as usize].payload[e as usize]);
            }
            if held != 0 {
                return Err(StoreError::NoPermission {
                    detail: format!("LRU slot {idx} is live under another key"),
                });
            }
            sub.table[e as usize].key = key;
            ring_remove(&mut sub.table, &mut sub.free, e);
            ring_insert(&mut sub.table, &mut sub.lru, e, true);
            sub.used += 1;
            sub.free == NO_IDX
        };
        if now_full && self.manual() {
            self.free_subs.retain(|&x| x != s);
        }
        Ok(&mut self.subs[s as usize].payload[e as usize])
    }
}

impl<P> Drop for LruArray<P> {
    fn drop(&mut self) {
        if let Some(cb) = self.cbs.on_fini {
            let shift = self.shift;
            for (s, sub) in self.subs.iter_mut().enumerate() {
                if !sub.is_allocated() {
                    continue;
                }
                for e in 0..sub.table.len() as u32 {
                    cb(&mut sub.payload[e as usize], ((s as u32) << shift) | e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Slot {
        value: u64,
    }

    #[test]
    fn rejects_non_power_of_two_geometry() {
        assert!(LruArray::<Slot>::new(12, 2, 0, LruCallbacks::default()).is_err());
        assert!(LruArray::<Slot>::new(16, 3, 0, LruCallbacks::default()).is_err());
        assert!(LruArray::<Slot>::new(0, 1, 0, LruCallbacks::default()).is_err());
    }

    #[test]
    fn manual_mode_exhaustion_returns_busy() {
        // capacity 4 over 2 sub-arrays: eviction is forced manual.
        let mut arr = LruArray::<Slot>::new(4, 2, 0, LruCallbacks::default()).unwrap();
        let mut held = Vec::new();
        for key in 1..=4u64 {
            let (idx, slot) = arr.find_free(key).expect("room available");
            slot.value = key * 10;
            held.push((idx, key));
        }
        assert!(matches!(arr.find_free(99), Err(StoreError::Busy)));

        // Manual eviction opens a slot back up.
        let (idx, key) = held[0];
        arr.evict(idx, key);
        let (idx2, _) = arr.find_free(99).expect("slot reopened");
        assert_eq!(idx2, idx, "freed slot is reused first");
    }

    #[test]
    fn silent_eviction_is_detectable_by_key() {
        let mut arr = LruArray::<Slot>::new(4, 1, 0, LruCallbacks::default()).unwrap();
        let mut indices = Vec::new();
        for key in 1..=4u64 {
            let (idx, _) = arr.find_free(key).unwrap();
            indices.push(idx);
        }
        // A fifth insert silently evicts the coldest (key 1).
        let (idx5, _) = arr.find_free(5).unwrap();
        assert_eq!(idx5, indices[0]);
        assert!(arr.lookup(indices[0], 1).is_none(), "stale key must miss");
        assert!(arr.lookup(idx5, 5).is_some());
    }

    #[test]
    fn lookup_promotes_and_peek_does_not() {
        let mut arr = LruArray::<Slot>::new(4, 1, 0, LruCallbacks::default()).unwrap();
        let mut idx = Vec::new();
        for key in 1..=4u64 {
            idx.push(arr.find_free(key).unwrap().0);
        }
        // Touch key 1 so key 2 becomes the coldest.
        assert!(arr.lookup(idx[0], 1).is_some());
        let (evicted_idx, _) = arr.find_free(5).unwrap();
        assert_eq!(evicted_idx, idx[1], "promoted entry survived the eviction");

        // peek must not promote: key 3 is now coldest and stays so.
        assert!(arr.peek(idx[2], 3).is_some());
        let (evicted_idx, _) = arr.find_free(6).unwrap();
        assert_eq!(evicted_idx, idx[2], "peeked entry was still evicted");
    }

    #[test]
    fn stale_evict_is_a_noop() {
        let mut arr = LruArray::<Slot>::new(4, 1, 0, LruCallbacks::default()).unwrap();
        let (idx, _) = arr.find_free(7).unwrap();
        arr.evict(idx, 8); // wrong key
        assert!(arr.lookup(idx, 7).is_some());
        arr.evict(idx, 7);
        assert!(arr.lookup(idx, 7).is_none());
    }

    #[test]
    fn aggregate_releases_empty_tail_subs() {
        let mut arr = LruArray::<Slot>::new(8, 4, 0, LruCallbacks::default()).unwrap();
        // Fill enough to materialize three sub-arrays (2 entries each).
        let mut held = Vec::new();
        for key in 1..=6u64 {
            held.push((arr.find_free(key).unwrap().0, key));
        }
        // Free everything in the later sub-arrays.
        for &(idx, key) in &held[2..] {
            arr.evict(idx, key);
        }
        arr.aggregate();
        // Freed sub-arrays are reusable again.
        for key in 10..=15u64 {
            arr.find_free(key).expect("aggregate returned space");
        }
    }

    #[test]
    fn alloc_inplace_rebuilds_and_guards() {
        let mut arr = LruArray::<Slot>::new(8, 2, 0, LruCallbacks::default()).unwrap();
        let slot = arr.alloc_inplace(5, 42).unwrap();
        slot.value = 9;
        // Idempotent under the same key.
        assert_eq!(arr.alloc_inplace(5, 42).unwrap().value, 9);
        // Live under a different key: refused.
        assert!(matches!(
            arr.alloc_inplace(5, 43),
            Err(StoreError::NoPermission { .. })
        ));
        assert!(arr.lookup(5, 42).is_some());
    }

    #[test]
    fn reuse_unique_defers_index_recycling() {
        let mut arr =
            LruArray::<Slot>::new(4, 1, LRU_FLAG_REUSE_UNIQUE, LruCallbacks::default()).unwrap();
        let (a, _) = arr.find_free(1).unwrap();
        let (_b, _) = arr.find_free(2).unwrap();
        arr.evict(a, 1);
        // With two free slots, the freshly freed one sits at the tail.
        let (c, _) = arr.find_free(3).unwrap();
        assert_ne!(c, a, "freed index must not be first choice");
    }
}
