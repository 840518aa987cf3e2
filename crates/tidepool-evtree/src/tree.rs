//! The extent tree and its visibility engine.

use std::cmp::Ordering;

use tidepool_btree::{feats, Anchor, Btree, BtrClass, ClassRegistry, Probe, ProbeOpc};
use tidepool_error::{Result, StoreError};
use tidepool_heap::Heap;
use tidepool_types::{Epoch, Extent, RawOff, Stamp};
use tracing::trace;

use crate::entry::{EvtEntry, EVT_ENTRY_SIZE};

/// Registered class id of the extent tree.
pub const EVT_CLASS_ID: u16 = 301;

/// Encoded direct-key length: `lo(8) | epoch(8) | minor(2)`, big-endian so
/// bytewise order is numeric order.
const KEY_LEN: usize = 18;

fn encode_key(ext_lo: u64, stamp: Stamp) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    key[0..8].copy_from_slice(&ext_lo.to_be_bytes());
    key[8..16].copy_from_slice(&stamp.epoch.raw().to_be_bytes());
    key[16..18].copy_from_slice(&stamp.minor.to_be_bytes());
    key
}

fn evt_hkey_gen(key: &[u8], out: &mut [u8; tidepool_btree::HKEY_MAX]) {
    out.fill(0);
    out[0..key.len().min(KEY_LEN)].copy_from_slice(&key[..key.len().min(KEY_LEN)]);
}

fn evt_hkey_cmp(
    a: &[u8; tidepool_btree::HKEY_MAX],
    b: &[u8; tidepool_btree::HKEY_MAX],
) -> Ordering {
    a[..KEY_LEN].cmp(&b[..KEY_LEN])
}

fn evt_key_decode(hkey: &[u8]) -> Vec<u8> {
    hkey[..KEY_LEN].to_vec()
}

fn evt_key_encode(key: &[u8]) -> Vec<u8> {
    key.to_vec()
}

fn evt_rec_alloc(heap: &mut Heap, _key: &[u8], val: &[u8]) -> Result<RawOff> {
    let off = heap.tx_alloc_auto(val.len() as u64, u64::from(EVT_CLASS_ID))?;
    heap.tx_write(off, val)?;
    Ok(off)
}

fn evt_rec_free(heap: &mut Heap, off: RawOff) -> Result<()> {
    heap.tx_free(off)
}

fn evt_rec_fetch(heap: &Heap, off: RawOff) -> Result<(Vec<u8>, Vec<u8>)> {
    let head = heap.read_vec(off, EVT_ENTRY_SIZE)?;
    let entry = EvtEntry::decode(&head)?;
    let len = EVT_ENTRY_SIZE + entry.ext.len() as usize;
    let body = heap.read_vec(off, len)?;
    Ok((encode_key(entry.ext.lo, entry.stamp).to_vec(), body))
}

/// Register the extent-tree class. Idempotent callers should register once
/// from runtime init.
pub fn register_class(registry: &ClassRegistry) -> Result<()> {
    registry.register(BtrClass {
        id: EVT_CLASS_ID,
        name: "evtree",
        hkey_gen: Some(evt_hkey_gen),
        hkey_cmp: Some(evt_hkey_cmp),
        key_cmp: None,
        key_encode: Some(evt_key_encode),
        key_decode: Some(evt_key_decode),
        rec_alloc: evt_rec_alloc,
        rec_free: evt_rec_free,
        rec_fetch: evt_rec_fetch,
        rec_update: None,
        rec_stat: None,
        rec_string: None,
        check_availability: None,
        node_alloc: None,
    })
}

/// Visibility tag of one entry under a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Youngest data for at least every byte of its range.
    Visible,
    /// A later extent fully contains it.
    Covered,
    /// A later extent overlaps a strict subset of it.
    Partial,
    /// Masked by a punch stamp.
    Punched,
}

/// Query filter: byte range, epoch window, and the masking punch stamp.
#[derive(Debug, Clone, Copy)]
pub struct Filter {
    pub ext: Extent,
    pub epoch_lo: Epoch,
    pub epoch_hi: Epoch,
    pub punch: Stamp,
}

impl Filter {
    /// Plain read filter at `epoch` with no punch mask.
    #[must_use]
    pub fn at(ext: Extent, epoch: Epoch) -> Filter {
        Filter {
            ext,
            epoch_lo: Epoch::ZERO,
            epoch_hi: epoch,
            punch: Stamp::ZERO,
        }
    }

    fn in_window(&self, stamp: Stamp) -> bool {
        self.epoch_lo <= stamp.epoch && stamp.epoch <= self.epoch_hi
    }

    fn punched(&self, stamp: Stamp) -> bool {
        self.punch != Stamp::ZERO && stamp < self.punch
    }
}

/// Iterator behaviour flags.
pub mod iter_flags {
    /// Only visible entries.
    pub const SKIP_HOLES: u32 = 1 << 0;
    /// Walk in descending range order.
    pub const REVERSE: u32 = 1 << 1;
    /// Include punched entries for reclamation.
    pub const FOR_PURGE: u32 = 1 << 2;
    /// Include covered entries for discard.
    pub const FOR_DISCARD: u32 = 1 << 3;
    /// Everything, for shard migration.
    pub const FOR_MIGRATION: u32 = 1 << 4;
}

/// An entry with its tag and record offset.
#[derive(Debug, Clone, Copy)]
pub struct TaggedEntry {
    pub entry: EvtEntry,
    pub rec_off: RawOff,
    pub tag: Visibility,
}

/// A visible sub-range attributed to one entry.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub ext: Extent,
    pub entry: EvtEntry,
    pub rec_off: RawOff,
}

/// The extent tree: a direct-key tree ordered by `(lo, epoch, minor)`.
#[derive(Clone, Copy)]
pub struct Evtree {
    inner: Btree,
}

impl Evtree {
    /// Initialize an empty extent tree at `root_off` inside an active
    /// transaction.
    pub fn create(
        heap: &mut Heap,
        registry: &ClassRegistry,
        root_off: RawOff,
        order: u8,
    ) -> Result<Evtree> {
        let inner = Btree::create(
            heap,
            registry,
            root_off,
            EVT_CLASS_ID,
            feats::DIRECT_KEY,
            order,
        )?;
        Ok(Evtree { inner })
    }

    pub fn open(heap: &Heap, registry: &ClassRegistry, root_off: RawOff) -> Result<Evtree> {
        Ok(Evtree {
            inner: Btree::open(heap, registry, root_off)?,
        })
    }

    #[must_use]
    pub fn root_off(&self) -> RawOff {
        self.inner.root_off()
    }

    pub fn is_empty(&self, heap: &Heap) -> Result<bool> {
        self.inner.is_empty(heap)
    }

    /// Every entry in range order, with record offsets.
    fn scan(&self, heap: &Heap) -> Result<Vec<(EvtEntry, RawOff)>> {
        let mut out = Vec::new();
        let mut iter = self.inner.iter_prepare();
        if !iter.probe(heap, ProbeOpc::First, Probe::None)? {
            return Ok(out);
        }
        loop {
            let (_, body, rec_off, _) = iter.fetch(heap, tidepool_btree::intent::DEFAULT)?;
            out.push((EvtEntry::decode(&body)?, rec_off));
            if !iter.next(heap)? {
                break;
            }
        }
        Ok(out)
    }

    /// Write `data` covering `ext` at `stamp`.
    ///
    /// Overlapping extents carrying the same stamp are merged into one
    /// entry; the incoming bytes win where ranges overlap.
    pub fn insert(
        &self,
        heap: &mut Heap,
        ext: Extent,
        stamp: Stamp,
        version: u32,
        data: &[u8],
    ) -> Result<()> {
        if data.len() as u64 != ext.len() {
            return Err(StoreError::invalid(format!(
                "extent [{}, {}] wants {} bytes, got {}",
                ext.lo,
                ext.hi,
                ext.len(),
                data.len()
            )));
        }

        // Find same-stamp overlapping siblings.
        let mut merged_ext = ext;
        let mut victims: Vec<(EvtEntry, RawOff)> = Vec::new();
        for (entry, rec_off) in self.scan(heap)? {
            if entry.stamp == stamp && entry.ext.overlaps(&ext) {
                merged_ext.lo = merged_ext.lo.min(entry.ext.lo);
                merged_ext.hi = merged_ext.hi.max(entry.ext.hi);
                victims.push((entry, rec_off));
            }
        }

        let payload = if victims.is_empty() {
            data.to_vec()
        } else {
            // Assemble the union: older same-stamp bytes first, the new
            // write on top.
            let mut buf = vec![0u8; merged_ext.len() as usize];
            for (entry, rec_off) in &victims {
                let bytes = self.read_payload(heap, *rec_off, entry.ext)?;
                let at = (entry.ext.lo - merged_ext.lo) as usize;
                buf[at..at + bytes.len()].copy_from_slice(&bytes);
            }
            let at = (ext.lo - merged_ext.lo) as usize;
            buf[at..at + data.len()].copy_from_slice(data);
            for (entry, _) in &victims {
                self.inner
                    .delete(heap, &encode_key(entry.ext.lo, entry.stamp))?;
            }
            trace!(
                merged = victims.len(),
                lo = merged_ext.lo,
                hi = merged_ext.hi,
                "merged same-stamp extents"
            );
            buf
        };

        let entry = EvtEntry {
            ext: merged_ext,
            stamp,
            version,
            csum: crc32fast::hash(&payload),
            bio_addr: EVT_ENTRY_SIZE as u64,
        };
        let mut body = Vec::with_capacity(EVT_ENTRY_SIZE + payload.len());
        body.extend_from_slice(&entry.encode());
        body.extend_from_slice(&payload);
        self.inner
            .insert(heap, &encode_key(merged_ext.lo, stamp), &body)
    }

    /// Payload bytes of `want` (a sub-range of the entry at `rec_off`),
    /// CRC-verified against the stored checksum.
    pub fn read_payload(&self, heap: &Heap, rec_off: RawOff, want: Extent) -> Result<Vec<u8>> {
        let head = heap.read_vec(rec_off, EVT_ENTRY_SIZE)?;
        let entry = EvtEntry::decode(&head)?;
        if !entry.ext.contains(&want) {
            return Err(StoreError::invalid(format!(
                "read [{}, {}] outside entry [{}, {}]",
                want.lo, want.hi, entry.ext.lo, entry.ext.hi
            )));
        }
        let payload = heap.read_vec(rec_off.at(entry.bio_addr), entry.ext.len() as usize)?;
        if crc32fast::hash(&payload) != entry.csum {
            return Err(StoreError::corrupt(format!(
                "extent [{}, {}] payload checksum mismatch",
                entry.ext.lo, entry.ext.hi
            )));
        }
        let at = (want.lo - entry.ext.lo) as usize;
        Ok(payload[at..at + want.len() as usize].to_vec())
    }

    /// Classify every overlapping entry under `filter`.
    pub fn query(&self, heap: &Heap, filter: &Filter) -> Result<Vec<TaggedEntry>> {
        let mut overlapping: Vec<(EvtEntry, RawOff)> = self
            .scan(heap)?
            .into_iter()
            .filter(|(e, _)| e.ext.overlaps(&filter.ext) && filter.in_window(e.stamp))
            .collect();
        overlapping.sort_by(|a, b| (a.0.ext.lo, a.0.stamp).cmp(&(b.0.ext.lo, b.0.stamp)));

        let mut tagged = Vec::with_capacity(overlapping.len());
        for &(entry, rec_off) in &overlapping {
            let tag = if filter.punched(entry.stamp) {
                Visibility::Punched
            } else {
                let mut tag = Visibility::Visible;
                for &(other, _) in &overlapping {
                    if other.stamp <= entry.stamp || filter.punched(other.stamp) {
                        continue;
                    }
                    if other.ext.contains(&entry.ext) {
                        tag = Visibility::Covered;
                        break;
                    }
                    if other.ext.overlaps(&entry.ext) {
                        tag = Visibility::Partial;
                    }
                }
                tag
            };
            tagged.push(TaggedEntry {
                entry,
                rec_off,
                tag,
            });
        }
        Ok(tagged)
    }

    /// Iterate entries under `filter`, honouring the behaviour flags.
    pub fn iterate(&self, heap: &Heap, filter: &Filter, flags: u32) -> Result<Vec<TaggedEntry>> {
        let mut tagged = self.query(heap, filter)?;
        if flags & iter_flags::FOR_MIGRATION == 0 {
            tagged.retain(|t| match t.tag {
                Visibility::Visible | Visibility::Partial => true,
                Visibility::Punched => flags & iter_flags::FOR_PURGE != 0,
                Visibility::Covered => {
                    flags & (iter_flags::FOR_DISCARD | iter_flags::FOR_PURGE) != 0
                }
            });
        }
        if flags & iter_flags::SKIP_HOLES != 0 {
            tagged.retain(|t| t.tag == Visibility::Visible || t.tag == Visibility::Partial);
        }
        if flags & iter_flags::REVERSE != 0 {
            tagged.reverse();
        }
        Ok(tagged)
    }

    /// Resolve the visible byte ranges of `filter.ext`: for every byte the
    /// youngest in-window, unpunched extent wins.
    pub fn visible_segments(&self, heap: &Heap, filter: &Filter) -> Result<Vec<Segment>> {
        let mut entries: Vec<(EvtEntry, RawOff)> = self
            .scan(heap)?
            .into_iter()
            .filter(|(e, _)| {
                e.ext.overlaps(&filter.ext) && filter.in_window(e.stamp) && !filter.punched(e.stamp)
            })
            .collect();
        // Youngest stamp first.
        entries.sort_by(|a, b| b.0.stamp.cmp(&a.0.stamp));

        let mut covered: Vec<Extent> = Vec::new();
        let mut segments = Vec::new();
        for (entry, rec_off) in entries {
            let Some(within) = entry.ext.intersect(&filter.ext) else {
                continue;
            };
            for piece in subtract(within, &covered) {
                segments.push(Segment {
                    ext: piece,
                    entry,
                    rec_off,
                });
            }
            insert_union(&mut covered, within);
        }
        segments.sort_by_key(|s| s.ext.lo);
        Ok(segments)
    }

    /// Delete up to `credits` entries for the garbage collector. Returns
    /// `true` when the tree is empty.
    pub fn drain(&self, heap: &mut Heap, credits: &mut u32) -> Result<bool> {
        self.inner.drain(heap, credits)
    }

    /// Free everything.
    pub fn destroy(&self, heap: &mut Heap) -> Result<()> {
        self.inner.destroy(heap)
    }

    /// Serializable anchor for the entry starting at `(lo, stamp)`.
    pub fn entry_anchor(&self, ext_lo: u64, stamp: Stamp) -> Result<Anchor> {
        self.inner.key_to_anchor(&encode_key(ext_lo, stamp))
    }
}

/// Pieces of `ext` not covered by any extent in `cover` (sorted, disjoint).
fn subtract(ext: Extent, cover: &[Extent]) -> Vec<Extent> {
    let mut pieces = vec![ext];
    for c in cover {
        let mut next = Vec::new();
        for p in pieces {
            if !p.overlaps(c) {
                next.push(p);
                continue;
            }
            if p.lo < c.lo {
                next.push(Extent::new(p.lo, c.lo - 1));
            }
            if p.hi > c.hi {
                next.push(Extent::new(c.hi + 1, p.hi));
            }
        }
        pieces = next;
    }
    pieces
}

/// Insert `ext` into a sorted disjoint union, merging overlaps and
/// adjacency.
fn insert_union(cover: &mut Vec<Extent>, ext: Extent) {
    let mut merged = ext;
    cover.retain(|c| {
        let touches = c.overlaps(&merged)
            || c.hi.wrapping_add(1) == merged.lo
            || merged.hi.wrapping_add(1) == c.lo;
        if touches {
            merged.lo = merged.lo.min(c.lo);
            merged.hi = merged.hi.max(c.hi);
        }
        !touches
    });
    let at = cover.partition_point(|c| c.lo < merged.lo);
    cover.insert(at, merged);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_encoding_orders_numerically() {
        let a = encode_key(100, Stamp::new(Epoch::new(5), 0));
        let b = encode_key(100, Stamp::new(Epoch::new(6), 0));
        let c = encode_key(101, Stamp::new(Epoch::new(1), 0));
        assert!(a < b);
        assert!(b < c);
        // A large lo must sort above a small one despite little-endian
        // host order.
        let small = encode_key(0xff, Stamp::ZERO);
        let big = encode_key(0x1_0000, Stamp::ZERO);
        assert!(small < big);
    }

    #[test]
    fn subtract_carves_holes() {
        let pieces = subtract(
            Extent::new(0, 99),
            &[Extent::new(10, 19), Extent::new(50, 99)],
        );
        assert_eq!(
            pieces,
            vec![Extent::new(0, 9), Extent::new(20, 49)]
        );
    }

    #[test]
    fn union_merges_adjacent() {
        let mut cover = Vec::new();
        insert_union(&mut cover, Extent::new(0, 9));
        insert_union(&mut cover, Extent::new(10, 19));
        insert_union(&mut cover, Extent::new(30, 39));
        assert_eq!(cover, vec![Extent::new(0, 19), Extent::new(30, 39)]);
        insert_union(&mut cover, Extent::new(15, 31));
        assert_eq!(cover, vec![Extent::new(0, 39)]);
    }
}
