//! Persistent layouts of the object-layer records.
//!
//! All offsets are relative to the owning record's start. Tree roots and
//! incarnation-log roots are embedded at fixed offsets so child structures
//! are reachable from the record offset alone.

use tidepool_btree::BTR_ROOT_SIZE;
use tidepool_error::Result;
use tidepool_heap::{Heap, POOL_ROOT_OFF};
use tidepool_ilog::ILOG_ROOT_SIZE;
use tidepool_types::{ContId, Epoch, RawOff, Stamp, UnitOid, UNIT_OID_SIZE};

// ---------------------------------------------------------------------------
// Pool root area (inside the pool header)
// ---------------------------------------------------------------------------

/// Container index tree root.
pub const POOL_CONT_ROOT: u64 = POOL_ROOT_OFF;
/// Pool-level GC bins (akey, dkey, object, container).
pub const POOL_GC_BINS: u64 = POOL_CONT_ROOT + BTR_ROOT_SIZE as u64;
/// Serialized GC bin size.
pub const GC_BIN_SIZE: u64 = 24;
/// Container counter.
pub const POOL_CONT_NR: u64 = POOL_GC_BINS + 4 * GC_BIN_SIZE;

/// Offset of the pool-level bin for `tier` (0 = akey .. 3 = container).
#[must_use]
pub fn pool_bin_off(tier: usize) -> RawOff {
    RawOff::new(POOL_GC_BINS + tier as u64 * GC_BIN_SIZE)
}

// ---------------------------------------------------------------------------
// Container record
// ---------------------------------------------------------------------------

/// Container record layout:
/// `id(16) | nobjs u64 | used u64 | hae u64 | obj_root(48) |
///  dtx_table(32) | gc_bins[3](72) | newest_aggregated u64`.
pub const CONT_DF_SIZE: usize = 200;

pub const CONT_NOBJS: u64 = 16;
pub const CONT_USED: u64 = 24;
pub const CONT_HAE: u64 = 32;
pub const CONT_OBJ_ROOT: u64 = 40;
pub const CONT_DTX_TABLE: u64 = 88;
pub const CONT_GC_BINS: u64 = 120;
pub const CONT_NEWEST_AGG: u64 = 192;

/// Offset of a container-level bin for `tier` (0 = akey .. 2 = object).
#[must_use]
pub fn cont_bin_off(cont_off: RawOff, tier: usize) -> RawOff {
    cont_off.at(CONT_GC_BINS + tier as u64 * GC_BIN_SIZE)
}

pub fn cont_read_id(heap: &Heap, cont_off: RawOff) -> Result<ContId> {
    let bytes = heap.bytes(cont_off, 16)?;
    Ok(ContId::from_bytes(
        bytes.try_into().expect("16-byte uuid"),
    ))
}

// ---------------------------------------------------------------------------
// Object record
// ---------------------------------------------------------------------------

/// Object record layout:
/// `oid(16) | sync_epoch u64 | max_write u64 | ilog(32) | dkey_root(48)`.
pub const OBJ_DF_SIZE: usize = 112;

pub const OBJ_SYNC_EPOCH: u64 = 16;
pub const OBJ_MAX_WRITE: u64 = 24;
pub const OBJ_ILOG: u64 = 32;
pub const OBJ_DKEY_ROOT: u64 = OBJ_ILOG + ILOG_ROOT_SIZE as u64;

pub fn obj_read_oid(heap: &Heap, obj_off: RawOff) -> Result<UnitOid> {
    let bytes = heap.bytes(obj_off, UNIT_OID_SIZE)?;
    Ok(UnitOid::from_bytes(
        bytes.try_into().expect("16-byte oid"),
    ))
}

pub fn obj_max_write(heap: &Heap, obj_off: RawOff) -> Result<Epoch> {
    Ok(Epoch::new(heap.read_u64(obj_off.at(OBJ_MAX_WRITE))?))
}

pub fn obj_set_max_write(heap: &mut Heap, obj_off: RawOff, epoch: Epoch) -> Result<()> {
    heap.tx_write_u64(obj_off.at(OBJ_MAX_WRITE), epoch.raw())
}

// ---------------------------------------------------------------------------
// Key record
// ---------------------------------------------------------------------------

/// Key-record header layout, followed by the key bytes:
/// `bmap u8 | pad(3) | key_len u32 | max_write epoch u64 + minor u16 |
///  pad | ilog(32) | child_root(48)`.
pub const KREC_HDR_SIZE: usize = 104;

pub const KREC_BMAP: u64 = 0;
pub const KREC_KEY_LEN: u64 = 4;
pub const KREC_MAX_WRITE: u64 = 8;
pub const KREC_MAX_WRITE_MINOR: u64 = 16;
pub const KREC_ILOG: u64 = 24;
pub const KREC_CHILD_ROOT: u64 = KREC_ILOG + ILOG_ROOT_SIZE as u64;

/// Build a fresh key-record body (header plus key bytes) for insertion.
#[must_use]
pub fn krec_body(bmap: u8, key: &[u8]) -> Vec<u8> {
    let mut body = vec![0u8; KREC_HDR_SIZE + key.len()];
    body[0] = bmap;
    body[KREC_KEY_LEN as usize..KREC_KEY_LEN as usize + 4]
        .copy_from_slice(&(key.len() as u32).to_le_bytes());
    body[KREC_HDR_SIZE..].copy_from_slice(key);
    body
}

pub fn krec_read_key(heap: &Heap, krec_off: RawOff) -> Result<Vec<u8>> {
    let len = heap.read_u32(krec_off.at(KREC_KEY_LEN))? as usize;
    heap.read_vec(krec_off.at(KREC_HDR_SIZE as u64), len)
}

pub fn krec_bmap(heap: &Heap, krec_off: RawOff) -> Result<u8> {
    heap.read_u8(krec_off.at(KREC_BMAP))
}

pub fn krec_max_write(heap: &Heap, krec_off: RawOff) -> Result<Stamp> {
    Ok(Stamp {
        epoch: Epoch::new(heap.read_u64(krec_off.at(KREC_MAX_WRITE))?),
        minor: heap.read_u16(krec_off.at(KREC_MAX_WRITE_MINOR))?,
    })
}

pub fn krec_set_max_write(heap: &mut Heap, krec_off: RawOff, stamp: Stamp) -> Result<()> {
    heap.tx_write_u64(krec_off.at(KREC_MAX_WRITE), stamp.epoch.raw())?;
    heap.tx_write_u16(krec_off.at(KREC_MAX_WRITE_MINOR), stamp.minor)
}

// ---------------------------------------------------------------------------
// Single-value record
// ---------------------------------------------------------------------------

/// Single-value record header, followed by the payload:
/// `epoch u64 | minor u16 | pad u16 | dtx_lid u32 | size u64`.
pub const SVT_HDR_SIZE: usize = 24;

/// Encoded single-value tree key: big-endian `(epoch, minor)` so bytewise
/// order is stamp order.
pub const SVT_KEY_LEN: usize = 10;

#[must_use]
pub fn svt_key(stamp: Stamp) -> [u8; SVT_KEY_LEN] {
    let mut key = [0u8; SVT_KEY_LEN];
    key[0..8].copy_from_slice(&stamp.epoch.raw().to_be_bytes());
    key[8..10].copy_from_slice(&stamp.minor.to_be_bytes());
    key
}

#[must_use]
pub fn svt_body(stamp: Stamp, dtx_lid: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = vec![0u8; SVT_HDR_SIZE + payload.len()];
    body[0..8].copy_from_slice(&stamp.epoch.raw().to_le_bytes());
    body[8..10].copy_from_slice(&stamp.minor.to_le_bytes());
    body[12..16].copy_from_slice(&dtx_lid.to_le_bytes());
    body[16..24].copy_from_slice(&(payload.len() as u64).to_le_bytes());
    body[SVT_HDR_SIZE..].copy_from_slice(payload);
    body
}

/// Decoded single-value record.
#[derive(Debug, Clone)]
pub struct SvtRec {
    pub stamp: Stamp,
    pub dtx_lid: u32,
    pub payload: Vec<u8>,
}

pub fn svt_decode(body: &[u8]) -> Result<SvtRec> {
    let stamp = Stamp {
        epoch: Epoch::new(u64::from_le_bytes(
            body[0..8].try_into().expect("8-byte slice"),
        )),
        minor: u16::from_le_bytes(body[8..10].try_into().expect("2-byte slice")),
    };
    let dtx_lid = u32::from_le_bytes(body[12..16].try_into().expect("4-byte slice"));
    let size = u64::from_le_bytes(body[16..24].try_into().expect("8-byte slice")) as usize;
    Ok(SvtRec {
        stamp,
        dtx_lid,
        payload: body[SVT_HDR_SIZE..SVT_HDR_SIZE + size].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn svt_key_orders_by_stamp() {
        let a = svt_key(Stamp::new(Epoch::new(0x100), 2));
        let b = svt_key(Stamp::new(Epoch::new(0x100), 3));
        let c = svt_key(Stamp::new(Epoch::new(0x200), 0));
        assert!(a < b && b < c);
    }

    #[test]
    fn krec_body_carries_key() {
        let body = krec_body(0b0110, b"akey-1");
        assert_eq!(body[0], 0b0110);
        assert_eq!(&body[KREC_HDR_SIZE..], b"akey-1");
        assert_eq!(body.len(), KREC_HDR_SIZE + 6);
    }

    #[test]
    fn svt_body_round_trips() {
        let stamp = Stamp::new(Epoch::new(42), 7);
        let body = svt_body(stamp, 3, b"hello");
        let rec = svt_decode(&body).unwrap();
        assert_eq!(rec.stamp, stamp);
        assert_eq!(rec.dtx_lid, 3);
        assert_eq!(rec.payload, b"hello");
    }
}
