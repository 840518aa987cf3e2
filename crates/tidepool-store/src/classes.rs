//! Tree-class registrations for the object layer.
//!
//! Four classes: the container index, the object index, the shared
//! dkey/akey class, and the single-value tree. The extent-tree class comes
//! from its own crate. Record bodies embed their own keys, so equal hashed
//! keys always tie-break on the stored bytes.

use std::cmp::Ordering;

use tidepool_btree::{BtrClass, ClassRegistry, HKEY_MAX};
use tidepool_error::Result;
use tidepool_heap::Heap;
use tidepool_types::RawOff;

use crate::layout::{
    krec_read_key, CONT_DF_SIZE, KREC_HDR_SIZE, OBJ_DF_SIZE, SVT_HDR_SIZE, SVT_KEY_LEN,
};

/// Container index class.
pub const CONT_CLASS: u16 = 100;
/// Object index class.
pub const OBJ_CLASS: u16 = 101;
/// dkey/akey class.
pub const KEY_CLASS: u16 = 102;
/// Single-value tree class.
pub const SVT_CLASS: u16 = 103;

// --- fixed-size records keyed by their leading bytes (container, object) --

fn fixed_rec_alloc(heap: &mut Heap, val: &[u8]) -> Result<RawOff> {
    let off = heap.tx_alloc_auto(val.len() as u64, 0)?;
    heap.tx_write(off, val)?;
    Ok(off)
}

fn cont_rec_alloc(heap: &mut Heap, _key: &[u8], val: &[u8]) -> Result<RawOff> {
    fixed_rec_alloc(heap, val)
}

fn rec_free(heap: &mut Heap, off: RawOff) -> Result<()> {
    heap.tx_free(off)
}

fn cont_rec_fetch(heap: &Heap, off: RawOff) -> Result<(Vec<u8>, Vec<u8>)> {
    let body = heap.read_vec(off, CONT_DF_SIZE)?;
    Ok((body[0..16].to_vec(), body))
}

fn cont_key_cmp(heap: &Heap, off: RawOff, probe: &[u8]) -> Result<Ordering> {
    Ok(heap.bytes(off, 16)?.cmp(probe))
}

fn obj_rec_fetch(heap: &Heap, off: RawOff) -> Result<(Vec<u8>, Vec<u8>)> {
    let body = heap.read_vec(off, OBJ_DF_SIZE)?;
    Ok((body[0..16].to_vec(), body))
}

// --- key records: header plus trailing key bytes --------------------------

fn krec_rec_alloc(heap: &mut Heap, _key: &[u8], val: &[u8]) -> Result<RawOff> {
    fixed_rec_alloc(heap, val)
}

fn krec_rec_fetch(heap: &Heap, off: RawOff) -> Result<(Vec<u8>, Vec<u8>)> {
    let key = krec_read_key(heap, off)?;
    let body = heap.read_vec(off, KREC_HDR_SIZE + key.len())?;
    Ok((key, body))
}

fn krec_key_cmp(heap: &Heap, off: RawOff, probe: &[u8]) -> Result<Ordering> {
    Ok(krec_read_key(heap, off)?.as_slice().cmp(probe))
}

// --- single-value records: keyed directly by the big-endian stamp ---------

fn svt_hkey_gen(key: &[u8], out: &mut [u8; HKEY_MAX]) {
    out.fill(0);
    out[0..key.len().min(SVT_KEY_LEN)].copy_from_slice(&key[..key.len().min(SVT_KEY_LEN)]);
}

fn svt_hkey_cmp(a: &[u8; HKEY_MAX], b: &[u8; HKEY_MAX]) -> Ordering {
    a[..SVT_KEY_LEN].cmp(&b[..SVT_KEY_LEN])
}

fn svt_key_decode(hkey: &[u8]) -> Vec<u8> {
    hkey[..SVT_KEY_LEN].to_vec()
}

fn svt_key_encode(key: &[u8]) -> Vec<u8> {
    key.to_vec()
}

fn svt_rec_fetch(heap: &Heap, off: RawOff) -> Result<(Vec<u8>, Vec<u8>)> {
    let head = heap.read_vec(off, SVT_HDR_SIZE)?;
    let size = u64::from_le_bytes(head[16..24].try_into().expect("8-byte slice")) as usize;
    let body = heap.read_vec(off, SVT_HDR_SIZE + size)?;
    // Key = big-endian stamp from the little-endian header fields.
    let mut key = vec![0u8; SVT_KEY_LEN];
    let epoch = u64::from_le_bytes(head[0..8].try_into().expect("8-byte slice"));
    let minor = u16::from_le_bytes(head[8..10].try_into().expect("2-byte slice"));
    key[0..8].copy_from_slice(&epoch.to_be_bytes());
    key[8..10].copy_from_slice(&minor.to_be_bytes());
    Ok((key, body))
}

/// Register the object-layer classes into `registry`.
pub fn register_classes(registry: &ClassRegistry) -> Result<()> {
    registry.register(BtrClass {
        id: CONT_CLASS,
        name: "container-index",
        hkey_gen: None,
        hkey_cmp: None,
        key_cmp: Some(cont_key_cmp),
        key_encode: None,
        key_decode: None,
        rec_alloc: cont_rec_alloc,
        rec_free,
        rec_fetch: cont_rec_fetch,
        rec_update: None,
        rec_stat: None,
        rec_string: None,
        check_availability: None,
        node_alloc: None,
    })?;
    registry.register(BtrClass {
        id: OBJ_CLASS,
        name: "object-index",
        rec_fetch: obj_rec_fetch,
        ..registry.get(CONT_CLASS)?
    })?;
    registry.register(BtrClass {
        id: KEY_CLASS,
        name: "key-index",
        key_cmp: Some(krec_key_cmp),
        rec_alloc: krec_rec_alloc,
        rec_fetch: krec_rec_fetch,
        ..registry.get(CONT_CLASS)?
    })?;
    registry.register(BtrClass {
        id: SVT_CLASS,
        name: "single-value",
        hkey_gen: Some(svt_hkey_gen),
        hkey_cmp: Some(svt_hkey_cmp),
        key_cmp: None,
        key_encode: Some(svt_key_encode),
        key_decode: Some(svt_key_decode),
        rec_alloc: cont_rec_alloc,
        rec_free,
        rec_fetch: svt_rec_fetch,
        rec_update: None,
        rec_stat: None,
        rec_string: None,
        check_availability: None,
        node_alloc: None,
    })?;
    tidepool_evtree::register_class(registry)?;
    Ok(())
}
