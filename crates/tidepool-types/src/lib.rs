//! Shared identifier, offset and epoch types.
//!
//! Every persistent cross-structure reference in tidepool is a [`RawOff`]:
//! a 64-bit byte offset from the pool base. The pool file may be mapped at
//! any address, so raw pointers never cross a persistence boundary.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Offsets
// ---------------------------------------------------------------------------

/// Byte offset from the pool base. Offset 0 is the null offset: it points at
/// the pool header, which no allocation can ever occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RawOff(u64);

impl RawOff {
    /// The null offset.
    pub const NULL: RawOff = RawOff(0);

    #[inline]
    #[must_use]
    pub const fn new(off: u64) -> Self {
        RawOff(off)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Offset `delta` bytes further into the pool.
    #[inline]
    #[must_use]
    pub const fn at(self, delta: u64) -> Self {
        RawOff(self.0 + delta)
    }
}

impl std::fmt::Display for RawOff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Epochs
// ---------------------------------------------------------------------------

/// HLC-stamped ordering coordinate.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Epoch(u64);

impl Epoch {
    pub const ZERO: Epoch = Epoch(0);
    pub const MAX: Epoch = Epoch(u64::MAX);

    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Epoch(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Epoch plus the minor tie-breaker used to order updates sharing one HLC
/// value inside a transaction.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Stamp {
    pub epoch: Epoch,
    pub minor: u16,
}

impl Stamp {
    pub const ZERO: Stamp = Stamp {
        epoch: Epoch::ZERO,
        minor: 0,
    };

    #[inline]
    #[must_use]
    pub const fn new(epoch: Epoch, minor: u16) -> Self {
        Stamp { epoch, minor }
    }
}

/// Inclusive epoch window `[lo, hi]` for visibility queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochRange {
    pub lo: Epoch,
    pub hi: Epoch,
}

impl EpochRange {
    #[inline]
    #[must_use]
    pub const fn new(lo: Epoch, hi: Epoch) -> Self {
        EpochRange { lo, hi }
    }

    /// The window covering every epoch.
    pub const ALL: EpochRange = EpochRange {
        lo: Epoch::ZERO,
        hi: Epoch::MAX,
    };

    #[inline]
    #[must_use]
    pub fn contains(&self, e: Epoch) -> bool {
        self.lo <= e && e <= self.hi
    }
}

/// A read epoch together with the epoch-uncertainty upper bound derived from
/// the HLC epsilon. A prepared transaction whose epoch falls inside
/// `(epoch, bound]` cannot be ordered against this read and forces a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochBound {
    pub epoch: Epoch,
    pub bound: Epoch,
}

impl EpochBound {
    #[inline]
    #[must_use]
    pub const fn certain(epoch: Epoch) -> Self {
        EpochBound {
            epoch,
            bound: epoch,
        }
    }

    #[inline]
    #[must_use]
    pub fn uncertain_window(&self) -> bool {
        self.bound > self.epoch
    }
}

// ---------------------------------------------------------------------------
// Extents
// ---------------------------------------------------------------------------

/// Inclusive byte-index range `[lo, hi]` inside a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub lo: u64,
    pub hi: u64,
}

impl Extent {
    #[inline]
    #[must_use]
    pub const fn new(lo: u64, hi: u64) -> Self {
        Extent { lo, hi }
    }

    /// Build from a half-open `[offset, offset + len)` request.
    #[inline]
    #[must_use]
    pub const fn from_offset_len(offset: u64, len: u64) -> Self {
        Extent {
            lo: offset,
            hi: offset + len - 1,
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.hi - self.lo + 1
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.hi < self.lo
    }

    #[inline]
    #[must_use]
    pub fn overlaps(&self, other: &Extent) -> bool {
        self.lo <= other.hi && other.lo <= self.hi
    }

    /// `true` when `self` fully contains `other`.
    #[inline]
    #[must_use]
    pub fn contains(&self, other: &Extent) -> bool {
        self.lo <= other.lo && other.hi <= self.hi
    }

    /// Intersection of two overlapping extents.
    #[must_use]
    pub fn intersect(&self, other: &Extent) -> Option<Extent> {
        if !self.overlaps(other) {
            return None;
        }
        Some(Extent {
            lo: self.lo.max(other.lo),
            hi: self.hi.min(other.hi),
        })
    }
}

// ---------------------------------------------------------------------------
// Object identity
// ---------------------------------------------------------------------------

/// Pool identifier.
pub type PoolId = Uuid;
/// Container identifier.
pub type ContId = Uuid;

/// Identity of one object shard on one target: object class, shard index and
/// the public object id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct UnitOid {
    pub pub_id: u64,
    pub class: u16,
    pub shard: u32,
}

/// Serialized size of a [`UnitOid`].
pub const UNIT_OID_SIZE: usize = 16;

impl UnitOid {
    #[must_use]
    pub const fn new(pub_id: u64, class: u16, shard: u32) -> Self {
        UnitOid {
            pub_id,
            class,
            shard,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; UNIT_OID_SIZE] {
        let mut buf = [0u8; UNIT_OID_SIZE];
        buf[0..8].copy_from_slice(&self.pub_id.to_le_bytes());
        buf[8..10].copy_from_slice(&self.class.to_le_bytes());
        buf[10..14].copy_from_slice(&self.shard.to_le_bytes());
        buf
    }

    #[must_use]
    pub fn from_bytes(buf: &[u8; UNIT_OID_SIZE]) -> Self {
        UnitOid {
            pub_id: u64::from_le_bytes(buf[0..8].try_into().expect("8-byte slice")),
            class: u16::from_le_bytes(buf[8..10].try_into().expect("2-byte slice")),
            shard: u32::from_le_bytes(buf[10..14].try_into().expect("4-byte slice")),
        }
    }

    /// Non-zero 64-bit cache key for LRU slots.
    #[must_use]
    pub fn cache_key(&self) -> u64 {
        let h = xxhash_rust::xxh3::xxh3_64(&self.to_bytes());
        // Key 0 marks a free LRU slot.
        if h == 0 {
            1
        } else {
            h
        }
    }
}

impl std::fmt::Display for UnitOid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}.{}.{}", self.pub_id, self.class, self.shard)
    }
}

// ---------------------------------------------------------------------------
// Distributed transaction identity
// ---------------------------------------------------------------------------

/// Distributed-transaction identifier: client uuid plus the HLC stamp taken
/// when the transaction started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DtxId {
    pub uuid: Uuid,
    pub hlc: Epoch,
}

/// Serialized size of a [`DtxId`].
pub const DTX_ID_SIZE: usize = 24;

impl DtxId {
    #[must_use]
    pub fn generate(hlc: Epoch) -> Self {
        DtxId {
            uuid: Uuid::new_v4(),
            hlc,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; DTX_ID_SIZE] {
        let mut buf = [0u8; DTX_ID_SIZE];
        buf[0..16].copy_from_slice(self.uuid.as_bytes());
        buf[16..24].copy_from_slice(&self.hlc.raw().to_le_bytes());
        buf
    }

    #[must_use]
    pub fn from_bytes(buf: &[u8; DTX_ID_SIZE]) -> Self {
        let mut u = [0u8; 16];
        u.copy_from_slice(&buf[0..16]);
        DtxId {
            uuid: Uuid::from_bytes(u),
            hlc: Epoch::new(u64::from_le_bytes(buf[16..24].try_into().expect("8-byte slice"))),
        }
    }

    /// Non-zero 64-bit cache key for LRU slots.
    #[must_use]
    pub fn cache_key(&self) -> u64 {
        let h = xxhash_rust::xxh3::xxh3_64(&self.to_bytes());
        if h == 0 {
            1
        } else {
            h
        }
    }
}

impl std::fmt::Display for DtxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.uuid, self.hlc)
    }
}

// ---------------------------------------------------------------------------
// Key-record bits
// ---------------------------------------------------------------------------

/// Bit flags stored on a persistent key record, describing the child index
/// hanging below the key.
pub mod krec {
    /// Child is an extent tree (array value).
    pub const EVT: u8 = 1 << 0;
    /// Child is a single-value B+tree.
    pub const BTR: u8 = 1 << 1;
    /// The key is a dkey (otherwise an akey).
    pub const DKEY: u8 = 1 << 2;
    /// The dkey holds the value directly; the akey level is skipped.
    pub const NO_AKEY: u8 = 1 << 3;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_off_null_and_math() {
        assert!(RawOff::NULL.is_null());
        let off = RawOff::new(4096).at(64);
        assert_eq!(off.get(), 4160);
        assert!(!off.is_null());
    }

    #[test]
    fn stamp_orders_epoch_then_minor() {
        let a = Stamp::new(Epoch::new(100), 2);
        let b = Stamp::new(Epoch::new(100), 3);
        let c = Stamp::new(Epoch::new(101), 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn extent_half_open_conversion() {
        // [0, 4) covers bytes 0..=3.
        let ext = Extent::from_offset_len(0, 4);
        assert_eq!(ext, Extent::new(0, 3));
        assert_eq!(ext.len(), 4);
    }

    #[test]
    fn extent_overlap_and_containment() {
        let a = Extent::new(0, 9);
        let b = Extent::new(5, 14);
        let c = Extent::new(2, 7);
        assert!(a.overlaps(&b));
        assert!(a.contains(&c));
        assert!(!c.contains(&a));
        assert_eq!(a.intersect(&b), Some(Extent::new(5, 9)));
        assert_eq!(Extent::new(0, 1).intersect(&Extent::new(3, 4)), None);
    }

    #[test]
    fn unit_oid_round_trips() {
        let oid = UnitOid::new(0xdead_beef, 7, 3);
        let bytes = oid.to_bytes();
        assert_eq!(UnitOid::from_bytes(&bytes), oid);
        assert_ne!(oid.cache_key(), 0);
    }

    #[test]
    fn dtx_id_round_trips() {
        let id = DtxId::generate(Epoch::new(42));
        let bytes = id.to_bytes();
        assert_eq!(DtxId::from_bytes(&bytes), id);
        assert_ne!(id.cache_key(), 0);
    }
}
