//! Multi-tier garbage collection.
//!
//! Punched keys, objects and containers queue into per-tier bins of
//! fixed-size bags. A reclamation slice walks the tiers lowest first:
//! drain an item's children into the child tier's bin, free the item once
//! empty (one credit), climb a tier when a bin runs dry, and drop back to
//! the lowest tier whenever new child work appears. Draining an akey
//! consumes the caller's credits; the higher tiers run on their own fixed
//! budgets so one fat object cannot starve the slice.

use tidepool_btree::Btree;
use tidepool_error::{Result, StoreError};
use tidepool_evtree::Evtree;
use tidepool_heap::Heap;
use tidepool_ilog::Ilog;
use tidepool_types::{krec, RawOff};
use tracing::{debug, trace};

use tidepool_btree::ClassRegistry;

use crate::layout::{
    cont_bin_off, pool_bin_off, CONT_DTX_TABLE, CONT_OBJ_ROOT, KREC_CHILD_ROOT, KREC_ILOG,
    OBJ_DKEY_ROOT, OBJ_ILOG,
};
use crate::pool::Pool;

/// Minimum credits for one slice.
pub const GC_CREDS_MIN: u32 = 1;
/// Credits per slice in slack mode.
pub const GC_CREDS_SLACK: u32 = 8;
/// Credits per slice in tight mode.
pub const GC_CREDS_TIGHT: u32 = 32;
/// Maximum credits for one slice.
pub const GC_CREDS_MAX: u32 = 4096;

/// Items per bag; a bag stays within one 4 KiB allocation.
pub const GC_BAG_ITEMS: u16 = 250;

/// Fixed drain budgets per tier; the akey tier (0) spends caller credits.
const TIER_DRAIN_CREDS: [u32; 4] = [0, 32, 8, 1];

const BAG_HDR_SIZE: u64 = 16;
const ITEM_SIZE: u64 = 16;

/// Reclamation tiers, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcTier {
    Akey = 0,
    Dkey = 1,
    Obj = 2,
    Cont = 3,
}

/// Cumulative reclamation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub conts: u64,
    pub objs: u64,
    pub dkeys: u64,
    pub akeys: u64,
    pub singvs: u64,
    pub extents: u64,
}

/// Cooperative hooks for one slice: the yield check between items (a
/// negative return aborts the drain) and the storage-backend flush run
/// after the slice.
#[derive(Default)]
pub struct GcHooks<'a> {
    pub yield_fn: Option<&'a mut dyn FnMut() -> i32>,
    pub flush_fn: Option<&'a mut dyn FnMut(u32) -> u32>,
}

impl GcHooks<'_> {
    /// No hooks; never yields.
    #[must_use]
    pub fn none() -> Self {
        GcHooks::default()
    }
}

// ---------------------------------------------------------------------------
// Bins and bags
// ---------------------------------------------------------------------------
//
// Bin: `bag_first u64 | bag_last u64 | bag_size u16 | bag_nr u16 | pad`.
// Bag: `item_first u16 | item_last u16 | item_nr u16 | pad u16 | next u64`
// followed by `bag_size` items of `{addr u64, args u64}` in a circular
// FIFO.

pub(crate) fn bin_init(heap: &mut Heap, bin_off: RawOff) -> Result<()> {
    let mut buf = [0u8; 24];
    buf[16..18].copy_from_slice(&GC_BAG_ITEMS.to_le_bytes());
    heap.tx_write(bin_off, &buf)
}

fn bag_alloc(heap: &mut Heap, bag_size: u16) -> Result<RawOff> {
    let bytes = BAG_HDR_SIZE + u64::from(bag_size) * ITEM_SIZE;
    let off = heap.tx_alloc_auto(bytes, 0)?;
    heap.tx_write(off, &[0u8; BAG_HDR_SIZE as usize])?;
    Ok(off)
}

/// Queue `addr` for reclamation on `bin_off`. Must run inside the caller's
/// transaction.
pub(crate) fn bin_add_item(
    heap: &mut Heap,
    bin_off: RawOff,
    addr: RawOff,
    args: u64,
) -> Result<()> {
    let bag_size = heap.read_u16(bin_off.at(16))?;
    let mut last = RawOff::new(heap.read_u64(bin_off.at(8))?);

    let needs_bag = if last.is_null() {
        true
    } else {
        heap.read_u16(last.at(4))? >= bag_size
    };
    if needs_bag {
        let bag = bag_alloc(heap, bag_size)?;
        if last.is_null() {
            heap.tx_write_u64(bin_off, bag.get())?;
        } else {
            heap.tx_write_u64(last.at(8), bag.get())?;
        }
        heap.tx_write_u64(bin_off.at(8), bag.get())?;
        let nr = heap.read_u16(bin_off.at(18))?;
        heap.tx_write_u16(bin_off.at(18), nr + 1)?;
        last = bag;
    }

    let item_last = heap.read_u16(last.at(2))?;
    let item_nr = heap.read_u16(last.at(4))?;
    let slot = last.at(BAG_HDR_SIZE + u64::from(item_last) * ITEM_SIZE);
    heap.tx_write_u64(slot, addr.get())?;
    heap.tx_write_u64(slot.at(8), args)?;
    heap.tx_write_u16(last.at(2), (item_last + 1) % bag_size)?;
    heap.tx_write_u16(last.at(4), item_nr + 1)?;
    trace!(bin = %bin_off, addr = %addr, "queued item for reclamation");
    Ok(())
}

/// The oldest queued item, if any.
fn bin_first_item(heap: &Heap, bin_off: RawOff) -> Result<Option<(RawOff, u64)>> {
    let first = RawOff::new(heap.read_u64(bin_off)?);
    if first.is_null() {
        return Ok(None);
    }
    let item_nr = heap.read_u16(first.at(4))?;
    if item_nr == 0 {
        return Ok(None);
    }
    let item_first = heap.read_u16(first)?;
    let slot = first.at(BAG_HDR_SIZE + u64::from(item_first) * ITEM_SIZE);
    let addr = heap.read_u64(slot)?;
    let args = heap.read_u64(slot.at(8))?;
    Ok(Some((RawOff::new(addr), args)))
}

/// Pop the oldest item, releasing its bag when it empties.
fn bin_pop_first(heap: &mut Heap, bin_off: RawOff) -> Result<()> {
    let bag_size = heap.read_u16(bin_off.at(16))?;
    let first = RawOff::new(heap.read_u64(bin_off)?);
    if first.is_null() {
        return Err(StoreError::invalid("pop from an empty reclamation bin"));
    }
    let item_first = heap.read_u16(first)?;
    let item_nr = heap.read_u16(first.at(4))?;
    if item_nr <= 1 {
        // Bag drained: unlink and free it.
        let next = heap.read_u64(first.at(8))?;
        heap.tx_write_u64(bin_off, next)?;
        if next == 0 {
            heap.tx_write_u64(bin_off.at(8), 0)?;
        }
        let nr = heap.read_u16(bin_off.at(18))?;
        heap.tx_write_u16(bin_off.at(18), nr.saturating_sub(1))?;
        heap.tx_free(first)?;
        return Ok(());
    }
    heap.tx_write_u16(first, (item_first + 1) % bag_size)?;
    heap.tx_write_u16(first.at(4), item_nr - 1)?;
    Ok(())
}

/// Chain every bag of `from` onto the tail of `to`, leaving `from` empty.
pub(crate) fn bin_migrate(heap: &mut Heap, from: RawOff, to: RawOff) -> Result<()> {
    let from_first = heap.read_u64(from)?;
    if from_first == 0 {
        return Ok(());
    }
    let from_last = heap.read_u64(from.at(8))?;
    let from_nr = heap.read_u16(from.at(18))?;

    let to_last = heap.read_u64(to.at(8))?;
    if to_last == 0 {
        heap.tx_write_u64(to, from_first)?;
    } else {
        heap.tx_write_u64(RawOff::new(to_last).at(8), from_first)?;
    }
    heap.tx_write_u64(to.at(8), from_last)?;
    let to_nr = heap.read_u16(to.at(18))?;
    heap.tx_write_u16(to.at(18), to_nr + from_nr)?;

    heap.tx_write_u64(from, 0)?;
    heap.tx_write_u64(from.at(8), 0)?;
    heap.tx_write_u16(from.at(18), 0)?;
    Ok(())
}

fn bins_all_empty(heap: &Heap, bins: &[RawOff]) -> Result<bool> {
    for &bin in bins {
        if bin_first_item(heap, bin)?.is_some() {
            return Ok(false);
        }
    }
    Ok(true)
}

// ---------------------------------------------------------------------------
// Draining
// ---------------------------------------------------------------------------

/// Drain one item's children into the child bin. Returns `true` when the
/// item has no children left.
fn drain_item(
    heap: &mut Heap,
    registry: &ClassRegistry,
    stats: &mut GcStats,
    tier: usize,
    addr: RawOff,
    credits: &mut u32,
    child_bin: Option<RawOff>,
) -> Result<bool> {
    match tier {
        0 => {
            // akey: drain the value index on the caller's credits.
            let bmap = heap.read_u8(addr)?;
            let before = *credits;
            let empty = if bmap & krec::EVT != 0 {
                let evt = Evtree::open(heap, registry, addr.at(KREC_CHILD_ROOT))?;
                let empty = evt.drain(heap, credits)?;
                stats.extents += u64::from(before - *credits);
                empty
            } else {
                let svt = Btree::open(heap, registry, addr.at(KREC_CHILD_ROOT))?;
                let empty = svt.drain(heap, credits)?;
                stats.singvs += u64::from(before - *credits);
                empty
            };
            Ok(empty)
        }
        1 | 2 | 3 => {
            let root = match tier {
                1 => addr.at(KREC_CHILD_ROOT),
                2 => addr.at(OBJ_DKEY_ROOT),
                _ => addr.at(CONT_OBJ_ROOT),
            };
            let bin = child_bin.expect("non-akey tiers have a child bin");
            let tree = Btree::open(heap, registry, root)?;
            let mut budget = TIER_DRAIN_CREDS[tier];
            tree.drain_retain(heap, &mut budget, &mut |heap, rec_off| {
                bin_add_item(heap, bin, rec_off, 0)
            })
        }
        _ => Err(StoreError::invalid("unknown reclamation tier")),
    }
}

/// Release a fully drained item.
fn free_item(
    heap: &mut Heap,
    stats: &mut GcStats,
    tier: usize,
    addr: RawOff,
) -> Result<()> {
    match tier {
        0 => {
            Ilog::open(addr.at(KREC_ILOG)).destroy(heap)?;
            heap.tx_free(addr)?;
            stats.akeys += 1;
        }
        1 => {
            Ilog::open(addr.at(KREC_ILOG)).destroy(heap)?;
            heap.tx_free(addr)?;
            stats.dkeys += 1;
        }
        2 => {
            Ilog::open(addr.at(OBJ_ILOG)).destroy(heap)?;
            heap.tx_free(addr)?;
            stats.objs += 1;
        }
        3 => {
            // Residual bags move up to the pool bins so the container's
            // region can be released.
            for tier in 0..3 {
                bin_migrate(heap, cont_bin_off(addr, tier), pool_bin_off(tier))?;
            }
            free_dtx_tables(heap, addr.at(CONT_DTX_TABLE))?;
            heap.tx_free(addr)?;
            stats.conts += 1;
        }
        _ => return Err(StoreError::invalid("unknown reclamation tier")),
    }
    Ok(())
}

/// Free the active and committed transaction-table chains of a container.
fn free_dtx_tables(heap: &mut Heap, table_root: RawOff) -> Result<()> {
    for head in [table_root, table_root.at(16)] {
        let mut blob = RawOff::new(heap.read_u64(head)?);
        while !blob.is_null() {
            let next = RawOff::new(heap.read_u64(blob.at(16))?);
            heap.tx_free(blob)?;
            blob = next;
        }
    }
    Ok(())
}

/// Run the drain loop over one ordered set of bins, lowest tier first.
/// Returns `true` when every bin emptied.
fn reclaim_binset(
    heap: &mut Heap,
    registry: &ClassRegistry,
    stats: &mut GcStats,
    bins: &[RawOff],
    credits: &mut u32,
    hooks: &mut GcHooks<'_>,
) -> Result<bool> {
    let mut tier = 0usize;
    while *credits > 0 {
        if let Some(yield_fn) = hooks.yield_fn.as_mut() {
            if yield_fn() < 0 {
                trace!("yield hook aborted the drain");
                return bins_all_empty(heap, bins);
            }
        }

        let Some((addr, _args)) = bin_first_item(heap, bins[tier])? else {
            if tier + 1 == bins.len() {
                return Ok(true);
            }
            tier += 1;
            continue;
        };

        let child_bin = if tier > 0 { Some(bins[tier - 1]) } else { None };
        let empty = drain_item(heap, registry, stats, tier, addr, credits, child_bin)?;
        if empty && *credits > 0 {
            free_item(heap, stats, tier, addr)?;
            bin_pop_first(heap, bins[tier])?;
            *credits -= 1;
        }
        // New child work may have appeared; always restart at the lowest
        // tier.
        tier = 0;
    }
    bins_all_empty(heap, bins)
}

/// Run one reclamation slice over the pool. Returns `true` when no queued
/// work remains anywhere.
pub fn gc_reclaim_pool(
    pool: &mut Pool,
    credits: &mut u32,
    hooks: &mut GcHooks<'_>,
) -> Result<bool> {
    let mut creds = (*credits).clamp(GC_CREDS_MIN, GC_CREDS_MAX);
    let spent_target = creds;

    pool.heap.tx_begin()?;
    let outcome: Result<bool> = (|| {
        let mut all_empty = true;
        while creds > 0 {
            // Containers with queued work drain first, round-robin.
            if let Some(cont_off) = pool.gc_pending.pop_front() {
                let bins = [
                    cont_bin_off(cont_off, 0),
                    cont_bin_off(cont_off, 1),
                    cont_bin_off(cont_off, 2),
                ];
                let empty = reclaim_binset(
                    &mut pool.heap,
                    &pool.registry,
                    &mut pool.gc_stats,
                    &bins,
                    &mut creds,
                    hooks,
                )?;
                if !empty {
                    // Out of credits: back of the queue, another container
                    // gets the next slice.
                    pool.gc_pending.push_back(cont_off);
                    all_empty = false;
                    break;
                }
                continue;
            }

            let bins = [
                pool_bin_off(0),
                pool_bin_off(1),
                pool_bin_off(2),
                pool_bin_off(3),
            ];
            all_empty = reclaim_binset(
                &mut pool.heap,
                &pool.registry,
                &mut pool.gc_stats,
                &bins,
                &mut creds,
                hooks,
            )?;
            break;
        }
        Ok(all_empty && pool.gc_pending.is_empty())
    })();

    let all_empty = match outcome {
        Ok(done) => {
            pool.heap.tx_commit()?;
            done
        }
        Err(err) => {
            pool.heap.tx_abort()?;
            return Err(err);
        }
    };

    if let Some(flush) = hooks.flush_fn.as_mut() {
        let flushed = flush(u32::MAX);
        trace!(flushed, "flushed freed extents to the storage backend");
    }
    debug!(
        spent = spent_target - creds,
        remaining = creds,
        all_empty,
        "reclamation slice finished"
    );
    *credits = creds;
    Ok(all_empty)
}
