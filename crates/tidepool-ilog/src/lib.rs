//! Incarnation log: the per-key append-only record of create, update and
//! punch events that drives epoch-based visibility.
//!
//! The log root is a fixed 32-byte structure embedded in its owner (object
//! or key record). One record lives inline; a log that outgrows it spills
//! into a heap array that doubles as it fills. Record stamps are strictly
//! increasing — an append at or below the head is the caller's cue to
//! restart with a fresh epoch.
//!
//! Records written by an in-flight distributed transaction carry its local
//! id; readers resolve those through a [`DtxResolver`] and report
//! `Uncertain` when a prepared record falls inside their epoch-uncertainty
//! window.

use tidepool_error::{Result, StoreError};
use tidepool_heap::Heap;
use tidepool_types::{Epoch, EpochRange, RawOff, Stamp};
use tracing::trace;

/// Serialized root size.
pub const ILOG_ROOT_SIZE: usize = 32;

/// Serialized record size.
pub const ILOG_REC_SIZE: usize = 16;

const SPILL_INITIAL_CAP: u32 = 8;

/// Record kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IlogKind {
    Create,
    Update,
    Punch,
}

impl IlogKind {
    fn to_raw(self) -> u8 {
        match self {
            IlogKind::Create => 1,
            IlogKind::Update => 2,
            IlogKind::Punch => 3,
        }
    }

    fn from_raw(raw: u8) -> Result<Self> {
        Ok(match raw {
            1 => IlogKind::Create,
            2 => IlogKind::Update,
            3 => IlogKind::Punch,
            other => {
                return Err(StoreError::corrupt(format!(
                    "unknown incarnation record kind {other}"
                )))
            }
        })
    }

    fn is_punch(self) -> bool {
        self == IlogKind::Punch
    }
}

/// One log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IlogRec {
    pub stamp: Stamp,
    pub kind: IlogKind,
    /// Local id of the writing transaction; 0 once committed.
    pub dtx_lid: u32,
}

impl IlogRec {
    #[must_use]
    pub fn new(stamp: Stamp, kind: IlogKind, dtx_lid: u32) -> Self {
        IlogRec {
            stamp,
            kind,
            dtx_lid,
        }
    }

    fn encode(&self) -> [u8; ILOG_REC_SIZE] {
        let mut buf = [0u8; ILOG_REC_SIZE];
        buf[0..8].copy_from_slice(&self.stamp.epoch.raw().to_le_bytes());
        buf[8..10].copy_from_slice(&self.stamp.minor.to_le_bytes());
        buf[10] = self.kind.to_raw();
        buf[12..16].copy_from_slice(&self.dtx_lid.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Result<IlogRec> {
        Ok(IlogRec {
            stamp: Stamp {
                epoch: Epoch::new(u64::from_le_bytes(
                    buf[0..8].try_into().expect("8-byte slice"),
                )),
                minor: u16::from_le_bytes(buf[8..10].try_into().expect("2-byte slice")),
            },
            kind: IlogKind::from_raw(buf[10])?,
            dtx_lid: u32::from_le_bytes(buf[12..16].try_into().expect("4-byte slice")),
        })
    }
}

/// Commit state of a record's writing transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtxRecState {
    Committed,
    Prepared,
    Aborted,
}

/// Resolves a record's transaction local id to its commit state.
pub trait DtxResolver {
    fn state(&self, dtx_lid: u32) -> DtxRecState;
}

/// Resolver for paths with no transaction table: everything persisted is
/// committed.
pub struct NoDtx;

impl DtxResolver for NoDtx {
    fn state(&self, _dtx_lid: u32) -> DtxRecState {
        DtxRecState::Committed
    }
}

/// Result of a visibility fetch at one epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IlogFetch {
    /// Greatest punch at or below the read epoch.
    pub prior_punch: Option<Stamp>,
    /// The creation stamp visible at the read epoch, if any.
    pub create_epoch: Option<Stamp>,
    /// Latest update at or below the read epoch and above the creation.
    pub update_epoch: Option<Stamp>,
    /// First punch above the read epoch.
    pub next_punch: Option<Stamp>,
    /// A prepared record inside the uncertainty window was skipped.
    pub uncertain: bool,
}

/// Result of an existence check over a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IlogStatus {
    Visible,
    Covered,
    Nonexistent,
    Uncertain,
}

/// Handle to one log, addressed by its root offset.
#[derive(Debug, Clone, Copy)]
pub struct Ilog {
    root_off: RawOff,
}

struct RootView {
    embedded: IlogRec,
    spill_off: RawOff,
    count: u32,
    cap: u32,
}

impl Ilog {
    /// Zero-initialize a log root inside an active transaction.
    pub fn create(heap: &mut Heap, root_off: RawOff) -> Result<Ilog> {
        heap.tx_write(root_off, &[0u8; ILOG_ROOT_SIZE])?;
        Ok(Ilog { root_off })
    }

    /// Open an existing log root.
    #[must_use]
    pub fn open(root_off: RawOff) -> Ilog {
        Ilog { root_off }
    }

    fn root(&self, heap: &Heap) -> Result<RootView> {
        let buf = heap.bytes(self.root_off, ILOG_ROOT_SIZE)?;
        let count = u32::from_le_bytes(buf[24..28].try_into().expect("4-byte slice"));
        let embedded = if count >= 1 {
            IlogRec::decode(&buf[0..ILOG_REC_SIZE])?
        } else {
            IlogRec::new(Stamp::ZERO, IlogKind::Create, 0)
        };
        Ok(RootView {
            embedded,
            spill_off: RawOff::new(u64::from_le_bytes(
                buf[16..24].try_into().expect("8-byte slice"),
            )),
            count,
            cap: u32::from_le_bytes(buf[28..32].try_into().expect("4-byte slice")),
        })
    }

    /// All records in stamp order.
    pub fn records(&self, heap: &Heap) -> Result<Vec<IlogRec>> {
        let root = self.root(heap)?;
        if root.count == 0 {
            return Ok(Vec::new());
        }
        if root.spill_off.is_null() {
            debug_assert_eq!(root.count, 1);
            return Ok(vec![root.embedded]);
        }
        let bytes = heap.read_vec(root.spill_off, root.count as usize * ILOG_REC_SIZE)?;
        bytes
            .chunks_exact(ILOG_REC_SIZE)
            .map(IlogRec::decode)
            .collect()
    }

    /// `true` when no record remains.
    pub fn is_empty(&self, heap: &Heap) -> Result<bool> {
        Ok(self.root(heap)?.count == 0)
    }

    /// Rewrite the whole log (aggregate/append slow paths).
    fn store(&self, heap: &mut Heap, records: &[IlogRec]) -> Result<()> {
        let root = self.root(heap)?;
        let mut spill_off = root.spill_off;
        let mut cap = root.cap;

        if records.len() <= 1 {
            if !spill_off.is_null() {
                heap.tx_free(spill_off)?;
                spill_off = RawOff::NULL;
                cap = 0;
            }
        } else if spill_off.is_null() || cap < records.len() as u32 {
            let new_cap = (records.len() as u32)
                .next_power_of_two()
                .max(SPILL_INITIAL_CAP);
            let new_off =
                heap.tx_alloc_auto(u64::from(new_cap) * ILOG_REC_SIZE as u64, 0)?;
            if !spill_off.is_null() {
                heap.tx_free(spill_off)?;
            }
            spill_off = new_off;
            cap = new_cap;
        }

        let mut buf = [0u8; ILOG_ROOT_SIZE];
        if let Some(first) = records.first() {
            buf[0..ILOG_REC_SIZE].copy_from_slice(&first.encode());
        }
        buf[16..24].copy_from_slice(&spill_off.get().to_le_bytes());
        buf[24..28].copy_from_slice(&(records.len() as u32).to_le_bytes());
        buf[28..32].copy_from_slice(&cap.to_le_bytes());
        heap.tx_write(self.root_off, &buf)?;

        if !spill_off.is_null() {
            let mut body = Vec::with_capacity(records.len() * ILOG_REC_SIZE);
            for rec in records {
                body.extend_from_slice(&rec.encode());
            }
            heap.tx_write(spill_off, &body)?;
        }
        Ok(())
    }

    /// Append a record. The stamp must exceed the log head; re-asserting
    /// the head record with the same kind is an idempotent no-op, anything
    /// else below the head restarts the caller.
    pub fn append(&self, heap: &mut Heap, rec: IlogRec) -> Result<()> {
        let mut records = self.records(heap)?;
        if let Some(head) = records.last() {
            if rec.stamp == head.stamp && rec.kind == head.kind {
                return Ok(());
            }
            if rec.stamp <= head.stamp {
                trace!(
                    head = ?head.stamp,
                    incoming = ?rec.stamp,
                    "append below the log head"
                );
                return Err(StoreError::TxRestart);
            }
        }
        records.push(rec);
        self.store(heap, &records)
    }

    /// Append a punch record. An epoch at or below the head restarts.
    pub fn punch(&self, heap: &mut Heap, stamp: Stamp, dtx_lid: u32) -> Result<()> {
        self.append(heap, IlogRec::new(stamp, IlogKind::Punch, dtx_lid))
    }

    /// Visibility at `epoch`, with `bound` as the epoch-uncertainty upper
    /// limit.
    pub fn fetch<R: DtxResolver>(
        &self,
        heap: &Heap,
        epoch: Epoch,
        bound: Epoch,
        resolver: &R,
    ) -> Result<IlogFetch> {
        let mut out = IlogFetch::default();
        for rec in self.records(heap)? {
            let state = if rec.dtx_lid == 0 {
                DtxRecState::Committed
            } else {
                resolver.state(rec.dtx_lid)
            };
            match state {
                DtxRecState::Aborted => continue,
                DtxRecState::Prepared => {
                    // A prepared record at or below the bound cannot be
                    // ordered against this read: it may commit at its
                    // stamp or vanish.
                    if rec.stamp.epoch <= bound {
                        out.uncertain = true;
                    }
                    continue;
                }
                DtxRecState::Committed => {}
            }

            if rec.stamp.epoch <= epoch {
                if rec.kind.is_punch() {
                    out.prior_punch = Some(rec.stamp);
                    // A punch hides everything before it.
                    out.create_epoch = None;
                    out.update_epoch = None;
                } else {
                    if out.create_epoch.is_none() {
                        out.create_epoch = Some(rec.stamp);
                    }
                    out.update_epoch = Some(rec.stamp);
                }
            } else if rec.kind.is_punch() && out.next_punch.is_none() {
                out.next_punch = Some(rec.stamp);
            }
        }
        Ok(out)
    }

    /// Existence over `[range.lo, range.hi]`.
    pub fn check<R: DtxResolver>(
        &self,
        heap: &Heap,
        range: EpochRange,
        resolver: &R,
    ) -> Result<IlogStatus> {
        let fetch = self.fetch(heap, range.hi, range.hi, resolver)?;
        if fetch.uncertain {
            return Ok(IlogStatus::Uncertain);
        }
        if let Some(create) = fetch.create_epoch {
            if create.epoch <= range.hi {
                return Ok(IlogStatus::Visible);
            }
        }
        if fetch.prior_punch.is_some() {
            return Ok(IlogStatus::Covered);
        }
        // Check for prepared records anywhere below: restart-worthy reads
        // are already reported; records above the range mean nonexistent
        // here.
        Ok(IlogStatus::Nonexistent)
    }

    /// Collapse records strictly older than `range.lo`, keeping the
    /// youngest creation still visible there. Aborted-transaction records
    /// are dropped. Returns `true` when the log emptied and the key can be
    /// reclaimed.
    pub fn aggregate<R: DtxResolver>(
        &self,
        heap: &mut Heap,
        range: EpochRange,
        resolver: &R,
    ) -> Result<bool> {
        let records = self.records(heap)?;
        let committed: Vec<IlogRec> = records
            .into_iter()
            .filter(|rec| {
                rec.dtx_lid == 0 || resolver.state(rec.dtx_lid) != DtxRecState::Aborted
            })
            .collect();

        // The youngest pre-range creation that is not punched before lo
        // must survive, or data visible inside the range would vanish.
        let visible_at_lo = {
            let mut create: Option<IlogRec> = None;
            for rec in &committed {
                if rec.stamp.epoch >= range.lo {
                    break;
                }
                if rec.kind.is_punch() {
                    create = None;
                } else {
                    create = Some(*rec);
                }
            }
            create
        };

        let mut kept: Vec<IlogRec> = Vec::new();
        if let Some(rec) = visible_at_lo {
            kept.push(rec);
        }
        kept.extend(
            committed
                .iter()
                .filter(|rec| rec.stamp.epoch >= range.lo)
                .copied(),
        );

        self.store(heap, &kept)?;
        Ok(kept.is_empty())
    }

    /// Clear a record's in-flight transaction id once its DTX commits.
    pub fn commit_dtx(&self, heap: &mut Heap, stamp: Stamp) -> Result<()> {
        let mut records = self.records(heap)?;
        for rec in &mut records {
            if rec.stamp == stamp {
                rec.dtx_lid = 0;
            }
        }
        self.store(heap, &records)
    }

    /// Drop records written by an aborted transaction.
    pub fn abort_dtx(&self, heap: &mut Heap, dtx_lid: u32) -> Result<bool> {
        let records: Vec<IlogRec> = self
            .records(heap)?
            .into_iter()
            .filter(|rec| rec.dtx_lid != dtx_lid)
            .collect();
        self.store(heap, &records)?;
        Ok(records.is_empty())
    }

    /// Free the spill array and zero the root.
    pub fn destroy(&self, heap: &mut Heap) -> Result<()> {
        let root = self.root(heap)?;
        if !root.spill_off.is_null() {
            heap.tx_free(root.spill_off)?;
        }
        heap.tx_write(self.root_off, &[0u8; ILOG_ROOT_SIZE])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidepool_heap::{Heap, HeapConfig};
    use uuid::Uuid;

    fn fixture() -> (tempfile::TempDir, Heap, Ilog) {
        let dir = tempfile::tempdir().unwrap();
        let mut heap = Heap::create(
            &dir.path().join("pool"),
            Uuid::new_v4(),
            32 * 1024 * 1024,
            HeapConfig::default(),
        )
        .unwrap();
        heap.tx_begin().unwrap();
        let root_off = heap.tx_alloc_auto(ILOG_ROOT_SIZE as u64, 0).unwrap();
        let ilog = Ilog::create(&mut heap, root_off).unwrap();
        heap.tx_commit().unwrap();
        (dir, heap, ilog)
    }

    fn stamp(e: u64, m: u16) -> Stamp {
        Stamp::new(Epoch::new(e), m)
    }

    fn append(heap: &mut Heap, ilog: &Ilog, e: u64, m: u16, kind: IlogKind) -> Result<()> {
        heap.tx_begin().unwrap();
        let out = ilog.append(heap, IlogRec::new(stamp(e, m), kind, 0));
        if out.is_ok() {
            heap.tx_commit().unwrap();
        } else {
            heap.tx_abort().unwrap();
        }
        out
    }

    #[test]
    fn stamps_are_strictly_increasing() {
        let (_dir, mut heap, ilog) = fixture();
        append(&mut heap, &ilog, 100, 0, IlogKind::Create).unwrap();
        append(&mut heap, &ilog, 100, 1, IlogKind::Update).unwrap();
        assert!(matches!(
            append(&mut heap, &ilog, 100, 1, IlogKind::Punch),
            Err(StoreError::TxRestart)
        ));
        assert!(matches!(
            append(&mut heap, &ilog, 50, 0, IlogKind::Update),
            Err(StoreError::TxRestart)
        ));

        let records = ilog.records(&heap).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.windows(2).all(|w| w[0].stamp < w[1].stamp));
    }

    #[test]
    fn same_head_append_is_idempotent() {
        let (_dir, mut heap, ilog) = fixture();
        append(&mut heap, &ilog, 100, 0, IlogKind::Create).unwrap();
        append(&mut heap, &ilog, 100, 0, IlogKind::Create).unwrap();
        assert_eq!(ilog.records(&heap).unwrap().len(), 1);
    }

    #[test]
    fn spill_grows_past_the_embedded_record() {
        let (_dir, mut heap, ilog) = fixture();
        for i in 0..50 {
            append(&mut heap, &ilog, 100 + i, 0, IlogKind::Update).unwrap();
        }
        assert_eq!(ilog.records(&heap).unwrap().len(), 50);
    }

    #[test]
    fn punch_hides_older_creates() {
        let (_dir, mut heap, ilog) = fixture();
        append(&mut heap, &ilog, 100, 0, IlogKind::Create).unwrap();
        append(&mut heap, &ilog, 200, 0, IlogKind::Punch).unwrap();

        // Before the punch: visible.
        let fetch = ilog.fetch(&heap, Epoch::new(150), Epoch::new(150), &NoDtx).unwrap();
        assert_eq!(fetch.create_epoch, Some(stamp(100, 0)));
        assert_eq!(fetch.next_punch, Some(stamp(200, 0)));

        // After the punch: gone, punch reported.
        let fetch = ilog.fetch(&heap, Epoch::new(201), Epoch::new(201), &NoDtx).unwrap();
        assert_eq!(fetch.create_epoch, None);
        assert_eq!(fetch.prior_punch, Some(stamp(200, 0)));

        assert_eq!(
            ilog.check(&heap, EpochRange::new(Epoch::ZERO, Epoch::new(150)), &NoDtx)
                .unwrap(),
            IlogStatus::Visible
        );
        assert_eq!(
            ilog.check(&heap, EpochRange::new(Epoch::ZERO, Epoch::new(300)), &NoDtx)
                .unwrap(),
            IlogStatus::Covered
        );
    }

    #[test]
    fn recreate_after_punch_is_visible() {
        let (_dir, mut heap, ilog) = fixture();
        append(&mut heap, &ilog, 100, 0, IlogKind::Create).unwrap();
        append(&mut heap, &ilog, 200, 0, IlogKind::Punch).unwrap();
        append(&mut heap, &ilog, 300, 0, IlogKind::Create).unwrap();

        let fetch = ilog.fetch(&heap, Epoch::new(350), Epoch::new(350), &NoDtx).unwrap();
        assert_eq!(fetch.create_epoch, Some(stamp(300, 0)));
        assert_eq!(fetch.prior_punch, Some(stamp(200, 0)));
    }

    struct OneInFlight {
        lid: u32,
        state: DtxRecState,
    }

    impl DtxResolver for OneInFlight {
        fn state(&self, dtx_lid: u32) -> DtxRecState {
            if dtx_lid == self.lid {
                self.state
            } else {
                DtxRecState::Committed
            }
        }
    }

    #[test]
    fn prepared_record_in_bound_window_is_uncertain() {
        let (_dir, mut heap, ilog) = fixture();
        append(&mut heap, &ilog, 100, 0, IlogKind::Create).unwrap();
        heap.tx_begin().unwrap();
        ilog.append(&mut heap, IlogRec::new(stamp(200, 0), IlogKind::Update, 7))
            .unwrap();
        heap.tx_commit().unwrap();

        let resolver = OneInFlight {
            lid: 7,
            state: DtxRecState::Prepared,
        };
        // Read at 150 with bound 250: the prepared record at 200 falls in
        // the window.
        let fetch = ilog
            .fetch(&heap, Epoch::new(150), Epoch::new(250), &resolver)
            .unwrap();
        assert!(fetch.uncertain);
        assert_eq!(
            ilog.check(&heap, EpochRange::new(Epoch::ZERO, Epoch::new(250)), &resolver)
                .unwrap(),
            IlogStatus::Uncertain
        );
        // Read at 150 with a tight bound: unaffected.
        let fetch = ilog
            .fetch(&heap, Epoch::new(150), Epoch::new(150), &resolver)
            .unwrap();
        assert!(!fetch.uncertain);
        assert_eq!(fetch.create_epoch, Some(stamp(100, 0)));
    }

    #[test]
    fn commit_clears_the_inflight_id() {
        let (_dir, mut heap, ilog) = fixture();
        heap.tx_begin().unwrap();
        ilog.append(&mut heap, IlogRec::new(stamp(100, 0), IlogKind::Create, 9))
            .unwrap();
        ilog.commit_dtx(&mut heap, stamp(100, 0)).unwrap();
        heap.tx_commit().unwrap();
        assert_eq!(ilog.records(&heap).unwrap()[0].dtx_lid, 0);
    }

    #[test]
    fn abort_drops_the_records() {
        let (_dir, mut heap, ilog) = fixture();
        heap.tx_begin().unwrap();
        ilog.append(&mut heap, IlogRec::new(stamp(100, 0), IlogKind::Create, 9))
            .unwrap();
        let empty = ilog.abort_dtx(&mut heap, 9).unwrap();
        heap.tx_commit().unwrap();
        assert!(empty);
        assert!(ilog.is_empty(&heap).unwrap());
    }

    #[test]
    fn aggregate_collapses_history_but_keeps_visible_create() {
        let (_dir, mut heap, ilog) = fixture();
        append(&mut heap, &ilog, 100, 0, IlogKind::Create).unwrap();
        append(&mut heap, &ilog, 150, 0, IlogKind::Update).unwrap();
        append(&mut heap, &ilog, 300, 0, IlogKind::Update).unwrap();

        heap.tx_begin().unwrap();
        let empty = ilog
            .aggregate(&mut heap, EpochRange::new(Epoch::new(200), Epoch::MAX), &NoDtx)
            .unwrap();
        heap.tx_commit().unwrap();
        assert!(!empty);

        let records = ilog.records(&heap).unwrap();
        // The update at 150 survives as the visible incarnation below 200;
        // the creation at 100 collapsed into it.
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].stamp, stamp(150, 0));
        assert_eq!(records[1].stamp, stamp(300, 0));

        // Reads inside the range still see the key.
        let fetch = ilog.fetch(&heap, Epoch::new(250), Epoch::new(250), &NoDtx).unwrap();
        assert_eq!(fetch.create_epoch, Some(stamp(150, 0)));
    }

    #[test]
    fn aggregate_of_fully_punched_log_empties_it() {
        let (_dir, mut heap, ilog) = fixture();
        append(&mut heap, &ilog, 100, 0, IlogKind::Create).unwrap();
        append(&mut heap, &ilog, 200, 0, IlogKind::Punch).unwrap();

        heap.tx_begin().unwrap();
        let empty = ilog
            .aggregate(&mut heap, EpochRange::new(Epoch::new(300), Epoch::MAX), &NoDtx)
            .unwrap();
        heap.tx_commit().unwrap();
        assert!(empty, "punched-away key can be reclaimed");
        assert!(ilog.is_empty(&heap).unwrap());
    }
}
