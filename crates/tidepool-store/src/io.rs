//! Update, fetch, punch and aggregation paths.
//!
//! Every mutation runs inside one heap transaction. Visibility flows
//! through the incarnation logs at each level (object, dkey, akey) with
//! the container's transaction cache resolving in-doubt records; value
//! reads then go through the single-value tree or the extent tree under
//! the akey.

use tidepool_btree::{feats, Btree, Probe, ProbeOpc};
use tidepool_error::{Result, StoreError};
use tidepool_evtree::{Evtree, Filter};
use tidepool_heap::Heap;
use tidepool_ilog::{DtxRecState, DtxResolver, Ilog, IlogKind, IlogRec};
use tidepool_types::{krec, DtxId, Epoch, EpochRange, Extent, RawOff, Stamp, UnitOid};
use tracing::trace;

use crate::classes::{KEY_CLASS, SVT_CLASS};
use crate::layout::{
    cont_bin_off, krec_bmap, krec_body, krec_max_write, krec_set_max_write, obj_set_max_write,
    svt_body, svt_decode, svt_key, CONT_NEWEST_AGG, CONT_NOBJS, CONT_OBJ_ROOT, KREC_CHILD_ROOT,
    KREC_ILOG, OBJ_DF_SIZE, OBJ_DKEY_ROOT, OBJ_ILOG,
};
use crate::object::obj_flags;
use crate::pool::{ContHandle, Pool};

const KEY_TREE_ORDER: u8 = 16;
const SVT_TREE_ORDER: u8 = 8;
const EVT_TREE_ORDER: u8 = 8;

/// A value to write under an akey.
#[derive(Debug, Clone)]
pub enum Value {
    /// Whole-value overwrite per epoch.
    Single(Vec<u8>),
    /// Byte-range write into an array value.
    Extent(Extent, Vec<u8>),
}

/// Punch behaviour flags.
pub mod punch_flags {
    /// Replay mode: never propagate the punch to emptied ancestors.
    pub const REPLAY_PC: u32 = 1 << 0;
}

/// Counters from one aggregation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggStats {
    pub akeys_queued: u64,
    pub dkeys_queued: u64,
    pub objs_queued: u64,
}

impl Pool {
    // -----------------------------------------------------------------------
    // Update
    // -----------------------------------------------------------------------

    /// Write `value` at `(oid, dkey, akey, stamp)`, creating the whole
    /// chain as needed. With `dtx` set the write is marked in doubt until
    /// the transaction settles.
    pub fn update(
        &mut self,
        cont: &mut ContHandle,
        oid: UnitOid,
        dkey: &[u8],
        akey: &[u8],
        stamp: Stamp,
        value: &Value,
        dtx: Option<&DtxId>,
    ) -> Result<()> {
        cont.dtx.check_epoch(stamp.epoch)?;
        let lid = match dtx {
            Some(id) => cont.dtx.lid_of(id).ok_or(StoreError::NoHandle)?,
            None => 0,
        };

        self.heap.tx_begin()?;
        let outcome = self.update_inner(cont, oid, dkey, akey, stamp, value, lid);
        match outcome {
            Ok((tracked, value_fields)) => {
                self.heap.tx_commit()?;
                if let Some(id) = dtx {
                    for (root, rec_stamp) in tracked {
                        cont.dtx.track_record(id, root, rec_stamp)?;
                    }
                    for field in value_fields {
                        cont.dtx.track_value(id, field)?;
                    }
                }
                Ok(())
            }
            Err(err) => {
                self.heap.tx_abort()?;
                Err(err)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn update_inner(
        &mut self,
        cont: &mut ContHandle,
        oid: UnitOid,
        dkey: &[u8],
        akey: &[u8],
        stamp: Stamp,
        value: &Value,
        lid: u32,
    ) -> Result<(Vec<(RawOff, Stamp)>, Vec<RawOff>)> {
        let mut tracked = Vec::new();
        let mut value_fields = Vec::new();
        let obj_off = self.ensure_object(cont, oid)?;
        let handle = self
            .obj_cache
            .hold(cont.id, oid, obj_off, obj_flags::CREATE)?;

        let outcome: Result<(Vec<(RawOff, Stamp)>, Vec<RawOff>)> = (|| {
            // Object-level incarnation.
            let obj_ilog = Ilog::open(obj_off.at(OBJ_ILOG));
            if self.ensure_incarnation(&cont.dtx, &obj_ilog, stamp, lid, false)? {
                tracked.push((obj_off.at(OBJ_ILOG), stamp));
            }

            // dkey level.
            let dkey_tree = Btree::open(&self.heap, &self.registry, obj_off.at(OBJ_DKEY_ROOT))?;
            let dkey_off = self.ensure_krec(&dkey_tree, dkey, krec::DKEY | krec::BTR)?;
            let dkey_ilog = Ilog::open(dkey_off.at(KREC_ILOG));
            if self.ensure_incarnation(&cont.dtx, &dkey_ilog, stamp, lid, false)? {
                tracked.push((dkey_off.at(KREC_ILOG), stamp));
            }

            // akey level, with the value-kind bit.
            let value_bit = match value {
                Value::Single(_) => krec::BTR,
                Value::Extent(..) => krec::EVT,
            };
            let akey_tree = Btree::open(&self.heap, &self.registry, dkey_off.at(KREC_CHILD_ROOT))?;
            let akey_off = self.ensure_krec(&akey_tree, akey, value_bit)?;
            let bmap = krec_bmap(&self.heap, akey_off)?;
            if bmap & value_bit == 0 {
                return Err(StoreError::invalid(
                    "akey holds the other value kind (single vs array)",
                ));
            }

            // Write-write conflict: a stamp at or below the newest write on
            // this akey must restart with a fresh epoch.
            let newest = krec_max_write(&self.heap, akey_off)?;
            if stamp <= newest {
                trace!(?stamp, ?newest, "write conflict on akey");
                return Err(StoreError::TxRestart);
            }

            let akey_ilog = Ilog::open(akey_off.at(KREC_ILOG));
            if self.ensure_incarnation(&cont.dtx, &akey_ilog, stamp, lid, true)? {
                tracked.push((akey_off.at(KREC_ILOG), stamp));
            }

            // The value itself.
            match value {
                Value::Single(payload) => {
                    let svt =
                        Btree::open(&self.heap, &self.registry, akey_off.at(KREC_CHILD_ROOT))?;
                    svt.insert(
                        &mut self.heap,
                        &svt_key(stamp),
                        &svt_body(stamp, lid, payload),
                    )?;
                    if lid != 0 {
                        let (_, _, rec_off) = svt.lookup(&self.heap, &svt_key(stamp))?;
                        // The in-doubt mark inside the value body, settled
                        // when the transaction does.
                        value_fields.push(rec_off.at(12));
                    }
                }
                Value::Extent(ext, payload) => {
                    let evt =
                        Evtree::open(&self.heap, &self.registry, akey_off.at(KREC_CHILD_ROOT))?;
                    evt.insert(&mut self.heap, *ext, stamp, 1, payload)?;
                }
            }

            // Stamp the write path for later conflict checks.
            krec_set_max_write(&mut self.heap, akey_off, stamp)?;
            let dkey_newest = krec_max_write(&self.heap, dkey_off)?;
            if stamp > dkey_newest {
                krec_set_max_write(&mut self.heap, dkey_off, stamp)?;
            }
            obj_set_max_write(&mut self.heap, obj_off, stamp.epoch)?;
            Ok((tracked, value_fields))
        })();

        self.obj_cache.release(cont.id, handle, false);
        outcome
    }

    /// Find or create the object record.
    fn ensure_object(&mut self, cont: &mut ContHandle, oid: UnitOid) -> Result<RawOff> {
        let obj_tree = Btree::open(
            &self.heap,
            &self.registry,
            cont.cont_off.at(CONT_OBJ_ROOT),
        )?;
        match obj_tree.lookup(&self.heap, &oid.to_bytes()) {
            Ok((_, _, off)) => Ok(off),
            Err(StoreError::NotFound) => {
                let mut body = vec![0u8; OBJ_DF_SIZE];
                body[0..16].copy_from_slice(&oid.to_bytes());
                obj_tree.insert(&mut self.heap, &oid.to_bytes(), &body)?;
                let (_, _, off) = obj_tree.lookup(&self.heap, &oid.to_bytes())?;
                Ilog::create(&mut self.heap, off.at(OBJ_ILOG))?;
                Btree::create(
                    &mut self.heap,
                    &self.registry,
                    off.at(OBJ_DKEY_ROOT),
                    KEY_CLASS,
                    feats::EMBED_FIRST,
                    KEY_TREE_ORDER,
                )?;
                let nobjs = self.heap.read_u64(cont.cont_off.at(CONT_NOBJS))?;
                self.heap
                    .tx_write_u64(cont.cont_off.at(CONT_NOBJS), nobjs + 1)?;
                Ok(off)
            }
            Err(err) => Err(err),
        }
    }

    /// Find or create a key record with its incarnation log and child
    /// index. A dkey gets an akey tree below it, an akey gets a
    /// single-value tree or an extent tree by its value bit.
    fn ensure_krec(&mut self, tree: &Btree, key: &[u8], bmap: u8) -> Result<RawOff> {
        match tree.lookup(&self.heap, key) {
            Ok((_, _, off)) => Ok(off),
            Err(StoreError::NotFound) => {
                tree.insert(&mut self.heap, key, &krec_body(bmap, key))?;
                let (_, _, off) = tree.lookup(&self.heap, key)?;
                Ilog::create(&mut self.heap, off.at(KREC_ILOG))?;
                if bmap & krec::EVT != 0 {
                    Evtree::create(
                        &mut self.heap,
                        &self.registry,
                        off.at(KREC_CHILD_ROOT),
                        EVT_TREE_ORDER,
                    )?;
                } else if bmap & krec::DKEY != 0 {
                    Btree::create(
                        &mut self.heap,
                        &self.registry,
                        off.at(KREC_CHILD_ROOT),
                        KEY_CLASS,
                        feats::EMBED_FIRST,
                        KEY_TREE_ORDER,
                    )?;
                } else {
                    Btree::create(
                        &mut self.heap,
                        &self.registry,
                        off.at(KREC_CHILD_ROOT),
                        SVT_CLASS,
                        feats::DIRECT_KEY,
                        SVT_TREE_ORDER,
                    )?;
                }
                Ok(off)
            }
            Err(err) => Err(err),
        }
    }

    /// Keep a level's incarnation log current for a write at `stamp`.
    /// Returns `true` when a record was appended (and should be tracked by
    /// the transaction).
    fn ensure_incarnation(
        &mut self,
        resolver: &impl DtxResolver,
        ilog: &Ilog,
        stamp: Stamp,
        lid: u32,
        record_updates: bool,
    ) -> Result<bool> {
        let fetch = ilog.fetch(&self.heap, stamp.epoch, stamp.epoch, resolver)?;
        if fetch.create_epoch.is_none() {
            ilog.append(&mut self.heap, IlogRec::new(stamp, IlogKind::Create, lid))?;
            return Ok(true);
        }
        if record_updates {
            let head_is_older = ilog
                .records(&self.heap)?
                .last()
                .is_some_and(|head| head.stamp < stamp);
            if head_is_older {
                ilog.append(&mut self.heap, IlogRec::new(stamp, IlogKind::Update, lid))?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    // -----------------------------------------------------------------------
    // Fetch
    // -----------------------------------------------------------------------

    /// Read the value at `(oid, dkey, akey)` visible at `epoch`. For array
    /// values `ext` selects the byte range (holes read as zero). A missing
    /// or punched-away record reports `NotFound`; an in-doubt record inside
    /// the uncertainty window reports `TxRestart`.
    pub fn fetch(
        &mut self,
        cont: &mut ContHandle,
        oid: UnitOid,
        dkey: &[u8],
        akey: &[u8],
        epoch: Epoch,
        ext: Option<Extent>,
    ) -> Result<Vec<u8>> {
        // Reads below the aggregation watermark see collapsed history and
        // must restart, same as updates.
        cont.dtx.check_epoch(epoch)?;
        let bound = epoch;
        let obj_tree = Btree::open(
            &self.heap,
            &self.registry,
            cont.cont_off.at(CONT_OBJ_ROOT),
        )?;
        let (_, _, obj_off) = obj_tree.lookup(&self.heap, &oid.to_bytes())?;

        let mut punch =
            self.level_visibility(&cont.dtx, &Ilog::open(obj_off.at(OBJ_ILOG)), epoch, bound)?;

        let dkey_tree = Btree::open(&self.heap, &self.registry, obj_off.at(OBJ_DKEY_ROOT))?;
        let (_, _, dkey_off) = dkey_tree.lookup(&self.heap, dkey)?;
        if let Some(p) = self.level_visibility(
            &cont.dtx,
            &Ilog::open(dkey_off.at(KREC_ILOG)),
            epoch,
            bound,
        )? {
            punch = punch.max(Some(p));
        }

        let akey_tree = Btree::open(&self.heap, &self.registry, dkey_off.at(KREC_CHILD_ROOT))?;
        let (_, _, akey_off) = akey_tree.lookup(&self.heap, akey)?;
        if let Some(p) = self.level_visibility(
            &cont.dtx,
            &Ilog::open(akey_off.at(KREC_ILOG)),
            epoch,
            bound,
        )? {
            punch = punch.max(Some(p));
        }

        let bmap = krec_bmap(&self.heap, akey_off)?;
        if bmap & krec::EVT != 0 {
            let ext = ext.ok_or_else(|| {
                StoreError::invalid("array akey needs an extent to fetch")
            })?;
            let evt = Evtree::open(&self.heap, &self.registry, akey_off.at(KREC_CHILD_ROOT))?;
            let filter = Filter {
                ext,
                epoch_lo: Epoch::ZERO,
                epoch_hi: epoch,
                punch: punch.unwrap_or(Stamp::ZERO),
            };
            let segments = evt.visible_segments(&self.heap, &filter)?;
            let mut out = vec![0u8; ext.len() as usize];
            for seg in segments {
                let bytes = evt.read_payload(&self.heap, seg.rec_off, seg.ext)?;
                let at = (seg.ext.lo - ext.lo) as usize;
                out[at..at + bytes.len()].copy_from_slice(&bytes);
            }
            Ok(out)
        } else {
            self.fetch_single(cont, akey_off, epoch, bound, punch)
        }
    }

    /// Visibility gate for one level: `NotFound` when invisible,
    /// `TxRestart` when uncertain, else the level's masking punch stamp.
    fn level_visibility(
        &self,
        resolver: &impl DtxResolver,
        ilog: &Ilog,
        epoch: Epoch,
        bound: Epoch,
    ) -> Result<Option<Stamp>> {
        let fetch = ilog.fetch(&self.heap, epoch, bound, resolver)?;
        if fetch.uncertain {
            return Err(StoreError::TxRestart);
        }
        if fetch.create_epoch.is_none() {
            return Err(StoreError::NotFound);
        }
        Ok(fetch.prior_punch)
    }

    /// Latest committed single value at or below `epoch` that survives the
    /// punch mask.
    fn fetch_single(
        &mut self,
        cont: &mut ContHandle,
        akey_off: RawOff,
        epoch: Epoch,
        bound: Epoch,
        punch: Option<Stamp>,
    ) -> Result<Vec<u8>> {
        let svt = Btree::open(&self.heap, &self.registry, akey_off.at(KREC_CHILD_ROOT))?;
        let mut iter = svt.iter_prepare();
        let probe_key = svt_key(Stamp::new(epoch, u16::MAX));
        if !iter.probe(
            &self.heap,
            ProbeOpc::Le,
            Probe::Key(&probe_key),
        )? {
            return Err(StoreError::NotFound);
        }
        loop {
            let (_, body, _, _) = iter.fetch(&self.heap, tidepool_btree::intent::DEFAULT)?;
            let rec = svt_decode(&body)?;
            let masked = punch.is_some_and(|p| rec.stamp < p);
            if !masked {
                match if rec.dtx_lid == 0 {
                    DtxRecState::Committed
                } else if rec.dtx_lid == tidepool_dtx::DTX_LID_ABORTED {
                    DtxRecState::Aborted
                } else {
                    cont.dtx.state(rec.dtx_lid)
                } {
                    DtxRecState::Committed => return Ok(rec.payload),
                    DtxRecState::Prepared => {
                        if rec.stamp.epoch <= bound {
                            return Err(StoreError::TxRestart);
                        }
                    }
                    DtxRecState::Aborted => {}
                }
            }
            if !iter.prev(&self.heap)? {
                return Err(StoreError::NotFound);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Punch
    // -----------------------------------------------------------------------

    /// Punch an object, dkey or akey at `stamp`.
    ///
    /// A key punch that empties its level propagates upward (akey → dkey →
    /// object) unless replay mode is set, restarting when a concurrent
    /// writer has stamped an ancestor more recently.
    pub fn punch(
        &mut self,
        cont: &mut ContHandle,
        oid: UnitOid,
        dkey: Option<&[u8]>,
        akey: Option<&[u8]>,
        stamp: Stamp,
        flags: u32,
    ) -> Result<()> {
        cont.dtx.check_epoch(stamp.epoch)?;
        self.heap.tx_begin()?;
        let outcome = self.punch_inner(cont, oid, dkey, akey, stamp, flags);
        match outcome {
            Ok(()) => self.heap.tx_commit(),
            Err(err) => {
                self.heap.tx_abort()?;
                Err(err)
            }
        }
    }

    fn punch_inner(
        &mut self,
        cont: &mut ContHandle,
        oid: UnitOid,
        dkey: Option<&[u8]>,
        akey: Option<&[u8]>,
        stamp: Stamp,
        flags: u32,
    ) -> Result<()> {
        let obj_tree = Btree::open(
            &self.heap,
            &self.registry,
            cont.cont_off.at(CONT_OBJ_ROOT),
        )?;
        let (_, _, obj_off) = obj_tree.lookup(&self.heap, &oid.to_bytes())?;

        let Some(dkey) = dkey else {
            // Whole-object punch: log it and drop the cache entry.
            Ilog::open(obj_off.at(OBJ_ILOG)).punch(&mut self.heap, stamp, 0)?;
            obj_set_max_write(&mut self.heap, obj_off, stamp.epoch)?;
            self.obj_cache.kill(cont.id, oid);
            return Ok(());
        };

        let dkey_tree = Btree::open(&self.heap, &self.registry, obj_off.at(OBJ_DKEY_ROOT))?;
        let (_, _, dkey_off) = dkey_tree.lookup(&self.heap, dkey)?;

        if let Some(akey) = akey {
            let akey_tree =
                Btree::open(&self.heap, &self.registry, dkey_off.at(KREC_CHILD_ROOT))?;
            let (_, _, akey_off) = akey_tree.lookup(&self.heap, akey)?;
            self.conflict_check(akey_off, stamp)?;
            Ilog::open(akey_off.at(KREC_ILOG)).punch(&mut self.heap, stamp, 0)?;
            krec_set_max_write(&mut self.heap, akey_off, stamp)?;

            if flags & punch_flags::REPLAY_PC != 0 {
                return Ok(());
            }
            // Propagate: akey level emptied -> punch the dkey; dkey level
            // emptied -> punch the object. Three levels at most.
            if !self.any_visible_sibling(cont, &akey_tree, stamp.epoch)? {
                self.conflict_check(dkey_off, stamp)?;
                Ilog::open(dkey_off.at(KREC_ILOG)).punch(&mut self.heap, stamp, 0)?;
                krec_set_max_write(&mut self.heap, dkey_off, stamp)?;
                if !self.any_visible_sibling(cont, &dkey_tree, stamp.epoch)? {
                    Ilog::open(obj_off.at(OBJ_ILOG)).punch(&mut self.heap, stamp, 0)?;
                    obj_set_max_write(&mut self.heap, obj_off, stamp.epoch)?;
                    self.obj_cache.kill(cont.id, oid);
                }
            }
            return Ok(());
        }

        // dkey punch.
        self.conflict_check(dkey_off, stamp)?;
        Ilog::open(dkey_off.at(KREC_ILOG)).punch(&mut self.heap, stamp, 0)?;
        krec_set_max_write(&mut self.heap, dkey_off, stamp)?;
        if flags & punch_flags::REPLAY_PC == 0
            && !self.any_visible_sibling(cont, &dkey_tree, stamp.epoch)?
        {
            Ilog::open(obj_off.at(OBJ_ILOG)).punch(&mut self.heap, stamp, 0)?;
            obj_set_max_write(&mut self.heap, obj_off, stamp.epoch)?;
            self.obj_cache.kill(cont.id, oid);
        }
        Ok(())
    }

    /// Restart when a concurrent writer stamped this record more recently
    /// than the caller's stamp.
    fn conflict_check(&self, krec_off: RawOff, stamp: Stamp) -> Result<()> {
        let newest = krec_max_write(&self.heap, krec_off)?;
        if newest > stamp {
            return Err(StoreError::TxRestart);
        }
        Ok(())
    }

    /// `true` when any record of `tree` is still visible at `epoch`.
    fn any_visible_sibling(
        &self,
        cont: &ContHandle,
        tree: &Btree,
        epoch: Epoch,
    ) -> Result<bool> {
        let mut iter = tree.iter_prepare();
        if !iter.probe(&self.heap, ProbeOpc::First, Probe::None)? {
            return Ok(false);
        }
        loop {
            let (_, _, krec_off, _) = iter.fetch(&self.heap, tidepool_btree::intent::CHECK)?;
            let ilog = Ilog::open(krec_off.at(KREC_ILOG));
            let fetch = ilog.fetch(&self.heap, epoch, epoch, &cont.dtx)?;
            if fetch.create_epoch.is_some() {
                return Ok(true);
            }
            if !iter.next(&self.heap)? {
                return Ok(false);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Aggregation
    // -----------------------------------------------------------------------

    /// Collapse incarnation history older than `range.lo` across the
    /// container and queue emptied keys/objects for the garbage collector.
    /// The window is clamped away from the transaction-commit window, and
    /// the lower edge becomes the container's aggregation watermark:
    /// reads and updates strictly below it restart from then on.
    pub fn aggregate(&mut self, cont: &mut ContHandle, range: EpochRange) -> Result<AggStats> {
        let guard = tidepool_dtx::DtxCache::aggregation_bound(std::time::Duration::from_secs(10));
        let range = EpochRange::new(range.lo.min(guard), range.hi.min(guard));
        let mut stats = AggStats::default();

        self.heap.tx_begin()?;
        let outcome = self.aggregate_inner(cont, range, &mut stats);
        match outcome {
            Ok(()) => {
                self.heap.tx_commit()?;
                cont.dtx.note_aggregated(range.lo);
                if stats != AggStats::default() && !self.gc_pending.contains(&cont.cont_off) {
                    self.gc_pending.push_back(cont.cont_off);
                }
                Ok(stats)
            }
            Err(err) => {
                self.heap.tx_abort()?;
                Err(err)
            }
        }
    }

    fn aggregate_inner(
        &mut self,
        cont: &mut ContHandle,
        range: EpochRange,
        stats: &mut AggStats,
    ) -> Result<()> {
        let obj_tree = Btree::open(
            &self.heap,
            &self.registry,
            cont.cont_off.at(CONT_OBJ_ROOT),
        )?;
        for (obj_key, obj_off) in self.collect_records(&obj_tree)? {
            let dkey_tree =
                Btree::open(&self.heap, &self.registry, obj_off.at(OBJ_DKEY_ROOT))?;
            for (dkey_key, dkey_off) in self.collect_records(&dkey_tree)? {
                let akey_tree =
                    Btree::open(&self.heap, &self.registry, dkey_off.at(KREC_CHILD_ROOT))?;
                for (akey_key, akey_off) in self.collect_records(&akey_tree)? {
                    let ilog = Ilog::open(akey_off.at(KREC_ILOG));
                    if ilog.aggregate(&mut self.heap, range, &cont.dtx)? {
                        let off = akey_tree.delete_retain(&mut self.heap, &akey_key)?;
                        crate::gc::bin_add_item(
                            &mut self.heap,
                            cont_bin_off(cont.cont_off, crate::gc::GcTier::Akey as usize),
                            off,
                            0,
                        )?;
                        stats.akeys_queued += 1;
                    }
                }
                let dkey_ilog = Ilog::open(dkey_off.at(KREC_ILOG));
                if akey_tree.is_empty(&self.heap)?
                    && dkey_ilog.aggregate(&mut self.heap, range, &cont.dtx)?
                {
                    let off = dkey_tree.delete_retain(&mut self.heap, &dkey_key)?;
                    crate::gc::bin_add_item(
                        &mut self.heap,
                        cont_bin_off(cont.cont_off, crate::gc::GcTier::Dkey as usize),
                        off,
                        0,
                    )?;
                    stats.dkeys_queued += 1;
                }
            }
            let obj_ilog = Ilog::open(obj_off.at(OBJ_ILOG));
            let dkey_tree =
                Btree::open(&self.heap, &self.registry, obj_off.at(OBJ_DKEY_ROOT))?;
            if dkey_tree.is_empty(&self.heap)?
                && obj_ilog.aggregate(&mut self.heap, range, &cont.dtx)?
            {
                let off = obj_tree.delete_retain(&mut self.heap, &obj_key)?;
                crate::gc::bin_add_item(
                    &mut self.heap,
                    cont_bin_off(cont.cont_off, crate::gc::GcTier::Obj as usize),
                    off,
                    0,
                )?;
                let oid = UnitOid::from_bytes(
                    obj_key.as_slice().try_into().expect("16-byte oid"),
                );
                self.obj_cache.kill(cont.id, oid);
                stats.objs_queued += 1;
            }
        }
        // Persist the watermark so a reopened container keeps rejecting
        // epochs below it.
        self.heap
            .tx_write_u64(cont.cont_off.at(CONT_NEWEST_AGG), range.lo.raw())?;
        Ok(())
    }

    fn collect_records(&self, tree: &Btree) -> Result<Vec<(Vec<u8>, RawOff)>> {
        let mut out = Vec::new();
        let mut iter = tree.iter_prepare();
        if !iter.probe(&self.heap, ProbeOpc::First, Probe::None)? {
            return Ok(out);
        }
        loop {
            let (key, _, rec_off, _) = iter.fetch(&self.heap, tidepool_btree::intent::PURGE)?;
            out.push((key, rec_off));
            if !iter.next(&self.heap)? {
                break;
            }
        }
        Ok(out)
    }
}
