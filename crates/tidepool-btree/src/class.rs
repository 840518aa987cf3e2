//! Tree classes: value-type callback tables and the registry.

use std::cmp::Ordering;
use std::collections::HashMap;

use parking_lot::Mutex;
use tidepool_error::{Result, StoreError};
use tidepool_heap::Heap;
use tidepool_types::RawOff;

use crate::node::{HKEY_MAX, KH_INLINE_MAX};

/// Record statistics reported by `rec_stat`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecStat {
    pub key_size: u64,
    pub val_size: u64,
}

/// Class callback table. Carried by value inside every tree handle; all
/// members are plain function references.
#[derive(Clone, Copy)]
pub struct BtrClass {
    pub id: u16,
    pub name: &'static str,
    /// Generate the fixed-width hashed key. `None` selects the built-in
    /// inline-or-hash generator. Unused for uint/direct trees.
    pub hkey_gen: Option<fn(&[u8], &mut [u8; HKEY_MAX])>,
    /// Compare two stored hkeys. `None` selects bytewise order. Direct-key
    /// classes must provide this: it defines the tree order over encoded
    /// keys.
    pub hkey_cmp: Option<fn(&[u8; HKEY_MAX], &[u8; HKEY_MAX]) -> Ordering>,
    /// Tie-break equal hkeys against the record body (hashed classes that
    /// store their key bytes).
    pub key_cmp: Option<fn(&Heap, RawOff, &[u8]) -> Result<Ordering>>,
    /// Encode a caller key into its stored form (direct-key classes).
    pub key_encode: Option<fn(&[u8]) -> Vec<u8>>,
    /// Decode a stored form back into a caller key (direct-key classes).
    pub key_decode: Option<fn(&[u8]) -> Vec<u8>>,
    /// Allocate and fill a record body; returns its offset.
    pub rec_alloc: fn(&mut Heap, &[u8], &[u8]) -> Result<RawOff>,
    /// Release a record body.
    pub rec_free: fn(&mut Heap, RawOff) -> Result<()>,
    /// Read back `(key, value)` from a record body.
    pub rec_fetch: fn(&Heap, RawOff) -> Result<(Vec<u8>, Vec<u8>)>,
    /// Try an in-place value update; `Ok(false)` means the caller must
    /// fall back to free + alloc.
    pub rec_update: Option<fn(&mut Heap, RawOff, &[u8]) -> Result<bool>>,
    /// Size statistics for monitoring.
    pub rec_stat: Option<fn(&Heap, RawOff) -> Result<RecStat>>,
    /// Render a record for diagnostics.
    pub rec_string: Option<fn(&Heap, RawOff) -> String>,
    /// MVCC visibility filter; `Ok(false)` hides the record from the given
    /// intent.
    pub check_availability: Option<fn(&Heap, RawOff, u32) -> Result<bool>>,
    /// Custom node allocation; defaults to the size-matched heap class.
    pub node_alloc: Option<fn(&mut Heap, usize) -> Result<RawOff>>,
}

/// Built-in hashed-key generator: keys up to [`KH_INLINE_MAX`] bytes are
/// stored inline (length-prefixed), longer keys get a 128-bit hash with a
/// marker byte. Ordering is bytewise over the fixed field; equal fields are
/// tie-broken by `key_cmp`.
pub fn hkey_for_key(key: &[u8], out: &mut [u8; HKEY_MAX]) {
    out.fill(0);
    if key.len() <= KH_INLINE_MAX {
        out[0] = key.len() as u8;
        out[1..1 + key.len()].copy_from_slice(key);
    } else {
        out[0] = 0xff;
        let hash = xxhash_rust::xxh3::xxh3_128(key);
        out[1..17].copy_from_slice(&hash.to_le_bytes());
    }
}

/// Explicitly constructed class registry (no static initialization). One
/// registry is owned by the store runtime; the mutex covers the non-engine
/// setup path.
pub struct ClassRegistry {
    inner: Mutex<HashMap<u16, BtrClass>>,
}

impl ClassRegistry {
    #[must_use]
    pub fn new() -> Self {
        ClassRegistry {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Register a class; a live id fails with `Exists`.
    pub fn register(&self, class: BtrClass) -> Result<()> {
        let mut map = self.inner.lock();
        if map.contains_key(&class.id) {
            return Err(StoreError::Exists);
        }
        map.insert(class.id, class);
        Ok(())
    }

    pub fn get(&self, id: u16) -> Result<BtrClass> {
        self.inner
            .lock()
            .get(&id)
            .copied()
            .ok_or_else(|| StoreError::invalid(format!("unregistered tree class {id}")))
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_keys_inline_and_long_keys_hash() {
        let mut a = [0u8; HKEY_MAX];
        let mut b = [0u8; HKEY_MAX];
        hkey_for_key(b"abc", &mut a);
        assert_eq!(a[0], 3);
        assert_eq!(&a[1..4], b"abc");

        let long = vec![7u8; 64];
        hkey_for_key(&long, &mut b);
        assert_eq!(b[0], 0xff);
        assert_ne!(&b[1..17], &[0u8; 16]);
    }

    #[test]
    fn inline_keys_never_collide() {
        let mut a = [0u8; HKEY_MAX];
        let mut b = [0u8; HKEY_MAX];
        hkey_for_key(b"abc", &mut a);
        hkey_for_key(b"abd", &mut b);
        assert_ne!(a, b);
    }
}
