//! The active-transaction cache and its persistent tables.
//!
//! Active entries live in the sub-array LRU cache keyed by the transaction
//! id, mirrored by a persistent active table so a restarted engine can
//! resync. Commits are batched: a transaction moves to `committable` at
//! once, but the persistent flip (append to the committed table, drop the
//! active entry, clear in-doubt marks in the touched incarnation logs)
//! happens in one heap transaction when the batch reaches the count or age
//! threshold.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tidepool_common::hlc;
use tidepool_common::lru_array::{LruArray, LruCallbacks};
use tidepool_error::{Result, StoreError};
use tidepool_heap::Heap;
use tidepool_ilog::{DtxRecState, DtxResolver, Ilog};
use tidepool_types::{DtxId, Epoch, RawOff, Stamp, UnitOid, DTX_ID_SIZE};
use tracing::{debug, warn};

use crate::{DtxCollective, DtxMembership, DtxStatus};

/// Commit batch flushes at this many pending transactions.
pub const DTX_THRESHOLD_COUNT: usize = 512;

/// ... or at this batch age.
pub const DTX_THRESHOLD_AGE: Duration = Duration::from_secs(10);

/// Entries per persistent table blob.
pub const DTX_BLOB_CAP: u32 = 64;

/// Size of the persistent table root: active head/tail, committed
/// head/tail.
pub const DTX_TABLE_ROOT_SIZE: usize = 32;

const BLOB_MAGIC: u32 = 0x6474_7862;
const BLOB_HDR_SIZE: u64 = 24;
/// Active entry: dti(24) | epoch(8) | oid(16) | lid(4) | flags(4) = 56,
/// padded.
const ACT_ENT_SIZE: u64 = 64;
/// Committed entry: dti(24) | epoch(8) | commit_time(8).
const CMT_ENT_SIZE: u64 = 40;

/// Sentinel stored in a value body's local-id field when its transaction
/// aborted; readers skip such records until reclamation removes them.
pub const DTX_LID_ABORTED: u32 = u32::MAX;

/// One active transaction, the LRU payload.
#[derive(Default)]
pub struct DtxEntry {
    pub id: Option<DtxId>,
    pub status: DtxStatus,
    pub epoch: Epoch,
    pub minor: u16,
    pub oid: UnitOid,
    pub flags: u32,
    pub membership: DtxMembership,
    pub collective: Option<DtxCollective>,
    /// Incarnation-log records written under this transaction.
    pub records: Vec<(RawOff, Stamp)>,
    /// Local-id fields inside value bodies written under this transaction,
    /// zeroed on commit and poisoned on abort (local ids are reused).
    pub value_fields: Vec<RawOff>,
}

/// Availability of a record guarded by a transaction, as seen by a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtxAvailability {
    /// Committed and settled.
    AvailableClean,
    /// Committable but not yet flushed.
    AvailableDirty,
    /// Still in flight; reader must treat it as uncertain.
    InFlight,
    /// Aborted or corrupted.
    Unavailable,
}

struct PendingCommit {
    id: DtxId,
    epoch: Epoch,
    records: Vec<(RawOff, Stamp)>,
    value_fields: Vec<RawOff>,
}

/// The cache over one container's transactions.
pub struct DtxCache {
    lru: LruArray<DtxEntry>,
    /// `dti -> (lru index, lru key)`.
    index: HashMap<DtxId, (u32, u64)>,
    /// `local id -> dti` for incarnation-log resolution.
    by_lid: HashMap<u32, DtxId>,
    /// Status mirror kept in lockstep with the LRU entries, so the
    /// incarnation-log resolver can read it without promoting slots.
    status_mirror: HashMap<DtxId, DtxStatus>,
    table_root: RawOff,
    pending: Vec<PendingCommit>,
    pending_since: Option<Instant>,
    /// Epoch below which committed history has been aggregated away.
    newest_aggregated: Epoch,
}

impl DtxCache {
    /// Build the cache over a zeroed or reloadable table root.
    pub fn new(capacity: u32, table_root: RawOff) -> Result<DtxCache> {
        Ok(DtxCache {
            lru: LruArray::new(capacity, 8, 0, LruCallbacks::default())?,
            index: HashMap::new(),
            by_lid: HashMap::new(),
            status_mirror: HashMap::new(),
            table_root,
            pending: Vec::new(),
            pending_since: None,
            newest_aggregated: Epoch::ZERO,
        })
    }

    fn entry_mut(&mut self, id: &DtxId) -> Result<&mut DtxEntry> {
        let &(idx, key) = self.index.get(id).ok_or(StoreError::NoHandle)?;
        self.lru.lookup(idx, key).ok_or(StoreError::NoHandle)
    }

    fn entry(&mut self, id: &DtxId) -> Option<&DtxEntry> {
        let &(idx, key) = self.index.get(id)?;
        self.lru.peek(idx, key).map(|e| &*e)
    }

    /// Start tracking a transaction. Returns its non-zero local id, used
    /// to mark incarnation-log records in doubt.
    pub fn begin(
        &mut self,
        heap: &mut Heap,
        id: DtxId,
        epoch: Epoch,
        minor: u16,
        oid: UnitOid,
        membership: DtxMembership,
    ) -> Result<u32> {
        if self.index.contains_key(&id) {
            return Err(StoreError::Exists);
        }
        // The epoch must not fall below already-aggregated history.
        self.check_epoch(epoch)?;
        let key = id.cache_key();
        let (idx, slot) = self.lru.find_free(key)?;
        let lid = idx + 1;
        *slot = DtxEntry {
            id: Some(id),
            status: DtxStatus::Preparing,
            epoch,
            minor,
            oid,
            flags: 0,
            membership,
            collective: None,
            records: Vec::new(),
            value_fields: Vec::new(),
        };
        self.index.insert(id, (idx, key));
        self.by_lid.insert(lid, id);
        self.status_mirror.insert(id, DtxStatus::Preparing);
        self.persist_active(heap, &id, epoch, oid, lid)?;
        Ok(lid)
    }

    /// Record an incarnation-log touch so commit/abort can settle it.
    pub fn track_record(&mut self, id: &DtxId, ilog_root: RawOff, stamp: Stamp) -> Result<()> {
        self.entry_mut(id)?.records.push((ilog_root, stamp));
        Ok(())
    }

    /// Local id of a live transaction, used to mark records in doubt.
    #[must_use]
    pub fn lid_of(&self, id: &DtxId) -> Option<u32> {
        self.index.get(id).map(|&(idx, _)| idx + 1)
    }

    /// Record the local-id field of a value body written under `id`.
    pub fn track_value(&mut self, id: &DtxId, lid_field: RawOff) -> Result<()> {
        self.entry_mut(id)?.value_fields.push(lid_field);
        Ok(())
    }

    /// Local prepare: all records written, waiting for the decision.
    pub fn prepare(&mut self, id: &DtxId) -> Result<()> {
        let entry = self.entry_mut(id)?;
        if !entry.status.in_flight() {
            return Err(StoreError::invalid("prepare after the decision"));
        }
        entry.status = DtxStatus::Prepared;
        self.status_mirror.insert(*id, DtxStatus::Prepared);
        Ok(())
    }

    /// Queue a commit; the persistent flip happens with the batch.
    pub fn commit(&mut self, heap: &mut Heap, id: &DtxId) -> Result<()> {
        let entry = self.entry_mut(id)?;
        match entry.status {
            DtxStatus::Preparing | DtxStatus::Prepared => {}
            DtxStatus::Committable | DtxStatus::Committed => return Ok(()),
            _ => return Err(StoreError::invalid("commit of a decided transaction")),
        }
        entry.status = DtxStatus::Committable;
        let pending = PendingCommit {
            id: *id,
            epoch: entry.epoch,
            records: std::mem::take(&mut entry.records),
            value_fields: std::mem::take(&mut entry.value_fields),
        };
        self.status_mirror.insert(*id, DtxStatus::Committable);
        self.pending.push(pending);
        if self.pending_since.is_none() {
            self.pending_since = Some(Instant::now());
        }
        self.maybe_flush(heap)
    }

    /// Commit a batch of ids at once, then force the flush.
    pub fn commit_batch(&mut self, heap: &mut Heap, ids: &[DtxId]) -> Result<()> {
        for id in ids {
            self.commit(heap, id)?;
        }
        self.flush_committed(heap)
    }

    /// Flush when the batch crossed the count or age threshold.
    pub fn maybe_flush(&mut self, heap: &mut Heap) -> Result<()> {
        let aged = self
            .pending_since
            .is_some_and(|since| since.elapsed() >= DTX_THRESHOLD_AGE);
        if self.pending.len() >= DTX_THRESHOLD_COUNT || aged {
            self.flush_committed(heap)?;
        }
        Ok(())
    }

    /// Persist the pending batch: committed-table appends, active-table
    /// removals and in-doubt clearing, all in one heap transaction.
    pub fn flush_committed(&mut self, heap: &mut Heap) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let own_tx = !heap.in_tx();
        if own_tx {
            heap.tx_begin()?;
        }
        let outcome: Result<()> = (|| {
            let pending = std::mem::take(&mut self.pending);
            let now_ns = hlc::to_unix_nsec(hlc::now());
            for commit in &pending {
                for &(ilog_root, stamp) in &commit.records {
                    Ilog::open(ilog_root).commit_dtx(heap, stamp)?;
                }
                for &field in &commit.value_fields {
                    heap.tx_write_u32(field, 0)?;
                }
                self.append_committed(heap, &commit.id, commit.epoch, now_ns)?;
                self.remove_active(heap, &commit.id)?;
                if let Some((idx, key)) = self.index.get(&commit.id).copied() {
                    if let Some(entry) = self.lru.lookup(idx, key) {
                        entry.status = DtxStatus::Committed;
                    }
                }
                self.status_mirror.insert(commit.id, DtxStatus::Committed);
            }
            debug!(committed = pending.len(), "flushed commit batch");
            Ok(())
        })();
        if own_tx {
            match &outcome {
                Ok(()) => heap.tx_commit()?,
                Err(_) => heap.tx_abort()?,
            }
        }
        self.pending_since = None;
        outcome
    }

    /// Abort: settle records, drop the active entry, release the slot.
    pub fn abort(&mut self, heap: &mut Heap, id: &DtxId) -> Result<()> {
        let (idx, key) = *self.index.get(id).ok_or(StoreError::NoHandle)?;
        let lid = idx + 1;
        let (records, value_fields) = {
            let entry = self.lru.lookup(idx, key).ok_or(StoreError::NoHandle)?;
            if matches!(entry.status, DtxStatus::Committable | DtxStatus::Committed) {
                return Err(StoreError::invalid("abort of a committed transaction"));
            }
            entry.status = DtxStatus::Aborted;
            (
                std::mem::take(&mut entry.records),
                std::mem::take(&mut entry.value_fields),
            )
        };
        let own_tx = !heap.in_tx();
        if own_tx {
            heap.tx_begin()?;
        }
        let outcome: Result<()> = (|| {
            for &(ilog_root, _) in &records {
                Ilog::open(ilog_root).abort_dtx(heap, lid)?;
            }
            for &field in &value_fields {
                // The local id will be reused; poison the body instead.
                heap.tx_write_u32(field, DTX_LID_ABORTED)?;
            }
            self.remove_active(heap, id)
        })();
        if own_tx {
            match &outcome {
                Ok(()) => heap.tx_commit()?,
                Err(_) => heap.tx_abort()?,
            }
        }
        outcome?;
        self.index.remove(id);
        self.by_lid.remove(&lid);
        self.status_mirror.remove(id);
        self.lru.evict(idx, key);
        Ok(())
    }

    /// Current status, `NotFound` for unknown ids.
    pub fn refresh(&mut self, id: &DtxId) -> Result<DtxStatus> {
        self.entry(id)
            .map(|e| e.status)
            .ok_or(StoreError::NotFound)
    }

    /// Reader-side availability of a record guarded by `id`.
    pub fn check(&mut self, id: &DtxId, _intent: u32) -> DtxAvailability {
        match self.entry(id).map(|e| e.status) {
            None | Some(DtxStatus::Committed) => DtxAvailability::AvailableClean,
            Some(DtxStatus::Committable) | Some(DtxStatus::Committing) => {
                DtxAvailability::AvailableDirty
            }
            Some(DtxStatus::Aborted)
            | Some(DtxStatus::Aborting)
            | Some(DtxStatus::Corrupted) => DtxAvailability::Unavailable,
            Some(_) => DtxAvailability::InFlight,
        }
    }

    /// Ids of every in-flight transaction, for resync.
    #[must_use]
    pub fn in_flight(&self) -> Vec<DtxId> {
        self.status_mirror
            .iter()
            .filter(|(_, status)| status.in_flight())
            .map(|(id, _)| *id)
            .collect()
    }

    pub(crate) fn status_of(&mut self, id: &DtxId) -> Option<DtxStatus> {
        self.entry(id).map(|e| e.status)
    }

    pub(crate) fn membership_of(&mut self, id: &DtxId) -> Option<DtxMembership> {
        self.entry(id).map(|e| e.membership.clone())
    }

    pub(crate) fn set_status(&mut self, id: &DtxId, status: DtxStatus) -> Result<()> {
        self.entry_mut(id)?.status = status;
        self.status_mirror.insert(*id, status);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Aggregation bound
    // -----------------------------------------------------------------------

    /// Upper bound for committed-history aggregation: never inside
    /// `[now - (commit age + grace), now]`.
    #[must_use]
    pub fn aggregation_bound(grace: Duration) -> Epoch {
        let hold = DTX_THRESHOLD_AGE + grace;
        let now_ns = hlc::to_nsec(hlc::now());
        let floor_ns = now_ns.saturating_sub(hold.as_nanos() as u64);
        hlc::from_nsec(floor_ns)
    }

    /// Reject reads and updates below the aggregation watermark with
    /// `TxRestart`. History strictly below the watermark has been
    /// collapsed; epochs at or above it still have full records.
    pub fn check_epoch(&self, epoch: Epoch) -> Result<()> {
        if epoch < self.newest_aggregated {
            return Err(StoreError::TxRestart);
        }
        Ok(())
    }

    /// Advance the aggregation watermark after an aggregation pass (or
    /// when reopening a container, from its persisted value). Never moves
    /// backwards.
    pub fn note_aggregated(&mut self, bound: Epoch) {
        self.newest_aggregated = self.newest_aggregated.max(bound);
    }

    /// The current aggregation watermark.
    #[must_use]
    pub fn aggregated_bound(&self) -> Epoch {
        self.newest_aggregated
    }

    /// Drop committed-table entries below `bound`. Returns how many were
    /// dropped.
    pub fn aggregate_committed(&mut self, heap: &mut Heap, bound: Epoch) -> Result<usize> {
        let entries = self.committed_entries(heap)?;
        let (old, kept): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|&(_, epoch, _)| epoch < bound);
        if old.is_empty() {
            return Ok(0);
        }
        let own_tx = !heap.in_tx();
        if own_tx {
            heap.tx_begin()?;
        }
        let outcome: Result<()> = (|| {
            self.rewrite_committed(heap, &kept)?;
            Ok(())
        })();
        if own_tx {
            match &outcome {
                Ok(()) => heap.tx_commit()?,
                Err(_) => heap.tx_abort()?,
            }
        }
        outcome?;
        self.newest_aggregated = self.newest_aggregated.max(bound);
        Ok(old.len())
    }

    // -----------------------------------------------------------------------
    // Persistent tables
    // -----------------------------------------------------------------------

    fn head_off(&self, committed: bool) -> RawOff {
        if committed {
            self.table_root.at(16)
        } else {
            self.table_root
        }
    }

    fn blob_entry_size(committed: bool) -> u64 {
        if committed {
            CMT_ENT_SIZE
        } else {
            ACT_ENT_SIZE
        }
    }

    fn alloc_blob(&self, heap: &mut Heap, committed: bool) -> Result<RawOff> {
        let size = BLOB_HDR_SIZE + u64::from(DTX_BLOB_CAP) * Self::blob_entry_size(committed);
        let off = heap.tx_alloc_auto(size, 0)?;
        let mut hdr = [0u8; BLOB_HDR_SIZE as usize];
        hdr[0..4].copy_from_slice(&BLOB_MAGIC.to_le_bytes());
        hdr[4..8].copy_from_slice(&DTX_BLOB_CAP.to_le_bytes());
        // count = 0, next = 0
        heap.tx_write(off, &hdr)?;
        Ok(off)
    }

    /// Append an entry to the active or committed chain, growing it by one
    /// blob when the tail fills.
    fn append_blob_entry(
        &self,
        heap: &mut Heap,
        committed: bool,
        entry: &[u8],
    ) -> Result<()> {
        let head_off = self.head_off(committed);
        let tail_off = head_off.at(8);
        let mut tail = RawOff::new(heap.read_u64(tail_off)?);
        if tail.is_null() {
            let blob = self.alloc_blob(heap, committed)?;
            heap.tx_write_u64(head_off, blob.get())?;
            heap.tx_write_u64(tail_off, blob.get())?;
            tail = blob;
        }
        let count = heap.read_u32(tail.at(8))?;
        if count >= DTX_BLOB_CAP {
            let blob = self.alloc_blob(heap, committed)?;
            heap.tx_write_u64(tail.at(16), blob.get())?;
            heap.tx_write_u64(tail_off, blob.get())?;
            tail = blob;
        }
        let count = heap.read_u32(tail.at(8))?;
        let at = tail
            .at(BLOB_HDR_SIZE)
            .at(u64::from(count) * Self::blob_entry_size(committed));
        heap.tx_write(at, entry)?;
        heap.tx_write_u32(tail.at(8), count + 1)?;
        Ok(())
    }

    fn persist_active(
        &self,
        heap: &mut Heap,
        id: &DtxId,
        epoch: Epoch,
        oid: UnitOid,
        lid: u32,
    ) -> Result<()> {
        let mut buf = [0u8; ACT_ENT_SIZE as usize];
        buf[0..DTX_ID_SIZE].copy_from_slice(&id.to_bytes());
        buf[24..32].copy_from_slice(&epoch.raw().to_le_bytes());
        buf[32..48].copy_from_slice(&oid.to_bytes());
        buf[48..52].copy_from_slice(&lid.to_le_bytes());
        let own_tx = !heap.in_tx();
        if own_tx {
            heap.tx_begin()?;
        }
        let out = self.append_blob_entry(heap, false, &buf);
        if own_tx {
            match &out {
                Ok(()) => heap.tx_commit()?,
                Err(_) => heap.tx_abort()?,
            }
        }
        out
    }

    fn append_committed(
        &self,
        heap: &mut Heap,
        id: &DtxId,
        epoch: Epoch,
        commit_time_ns: u64,
    ) -> Result<()> {
        let mut buf = [0u8; CMT_ENT_SIZE as usize];
        buf[0..DTX_ID_SIZE].copy_from_slice(&id.to_bytes());
        buf[24..32].copy_from_slice(&epoch.raw().to_le_bytes());
        buf[32..40].copy_from_slice(&commit_time_ns.to_le_bytes());
        self.append_blob_entry(heap, true, &buf)
    }

    /// Tombstone the active entry for `id` (zeroed id bytes).
    fn remove_active(&self, heap: &mut Heap, id: &DtxId) -> Result<()> {
        let mut blob = RawOff::new(heap.read_u64(self.head_off(false))?);
        let target = id.to_bytes();
        while !blob.is_null() {
            let count = heap.read_u32(blob.at(8))?;
            for i in 0..count {
                let at = blob.at(BLOB_HDR_SIZE).at(u64::from(i) * ACT_ENT_SIZE);
                let bytes = heap.read_vec(at, DTX_ID_SIZE)?;
                if bytes == target {
                    heap.tx_write(at, &[0u8; DTX_ID_SIZE])?;
                    return Ok(());
                }
            }
            blob = RawOff::new(heap.read_u64(blob.at(16))?);
        }
        warn!(%id, "active table has no entry to remove");
        Ok(())
    }

    fn committed_entries(&self, heap: &Heap) -> Result<Vec<(DtxId, Epoch, u64)>> {
        let mut out = Vec::new();
        let mut blob = RawOff::new(heap.read_u64(self.head_off(true))?);
        while !blob.is_null() {
            let count = heap.read_u32(blob.at(8))?;
            for i in 0..count {
                let at = blob.at(BLOB_HDR_SIZE).at(u64::from(i) * CMT_ENT_SIZE);
                let bytes = heap.read_vec(at, CMT_ENT_SIZE as usize)?;
                let id = DtxId::from_bytes(bytes[0..24].try_into().expect("24-byte id"));
                let epoch = Epoch::new(u64::from_le_bytes(
                    bytes[24..32].try_into().expect("8-byte slice"),
                ));
                let time = u64::from_le_bytes(bytes[32..40].try_into().expect("8-byte slice"));
                out.push((id, epoch, time));
            }
            blob = RawOff::new(heap.read_u64(blob.at(16))?);
        }
        Ok(out)
    }

    fn rewrite_committed(&self, heap: &mut Heap, kept: &[(DtxId, Epoch, u64)]) -> Result<()> {
        // Free the old chain and rebuild it from the survivors.
        let mut blob = RawOff::new(heap.read_u64(self.head_off(true))?);
        while !blob.is_null() {
            let next = RawOff::new(heap.read_u64(blob.at(16))?);
            heap.tx_free(blob)?;
            blob = next;
        }
        heap.tx_write_u64(self.head_off(true), 0)?;
        heap.tx_write_u64(self.head_off(true).at(8), 0)?;
        for &(id, epoch, time) in kept {
            self.append_committed(heap, &id, epoch, time)?;
        }
        Ok(())
    }

    /// Re-seat active entries from the persistent table after a restart.
    /// Reloaded transactions come back `Prepared`, awaiting resync.
    pub fn reload(&mut self, heap: &Heap) -> Result<usize> {
        let mut blob = RawOff::new(heap.read_u64(self.head_off(false))?);
        let mut restored = 0;
        while !blob.is_null() {
            let count = heap.read_u32(blob.at(8))?;
            for i in 0..count {
                let at = blob.at(BLOB_HDR_SIZE).at(u64::from(i) * ACT_ENT_SIZE);
                let bytes = heap.read_vec(at, ACT_ENT_SIZE as usize)?;
                if bytes[0..DTX_ID_SIZE] == [0u8; DTX_ID_SIZE] {
                    continue; // tombstone
                }
                let id = DtxId::from_bytes(bytes[0..24].try_into().expect("24-byte id"));
                let epoch = Epoch::new(u64::from_le_bytes(
                    bytes[24..32].try_into().expect("8-byte slice"),
                ));
                let oid = UnitOid::from_bytes(bytes[32..48].try_into().expect("16-byte oid"));
                let lid = u32::from_le_bytes(bytes[48..52].try_into().expect("4-byte slice"));
                let key = id.cache_key();
                let slot = self.lru.alloc_inplace(lid - 1, key)?;
                *slot = DtxEntry {
                    id: Some(id),
                    status: DtxStatus::Prepared,
                    epoch,
                    minor: 0,
                    oid,
                    flags: 0,
                    membership: DtxMembership::default(),
                    collective: None,
                    records: Vec::new(),
                    value_fields: Vec::new(),
                };
                self.index.insert(id, (lid - 1, key));
                self.by_lid.insert(lid, id);
                self.status_mirror.insert(id, DtxStatus::Prepared);
                restored += 1;
            }
            blob = RawOff::new(heap.read_u64(blob.at(16))?);
        }
        Ok(restored)
    }
}


impl DtxResolver for DtxCache {
    fn state(&self, dtx_lid: u32) -> DtxRecState {
        let Some(id) = self.by_lid.get(&dtx_lid) else {
            // Settled and evicted: only committed records keep a stale id.
            return DtxRecState::Committed;
        };
        match self.status_mirror.get(id).copied() {
            Some(status) if status.in_flight() => DtxRecState::Prepared,
            Some(DtxStatus::Aborted | DtxStatus::Aborting | DtxStatus::Corrupted) => {
                DtxRecState::Aborted
            }
            _ => DtxRecState::Committed,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tidepool_ilog::{IlogKind, IlogRec, ILOG_ROOT_SIZE};
    use tidepool_heap::HeapConfig;
    use uuid::Uuid;

    fn fixture() -> (tempfile::TempDir, Heap, DtxCache) {
        let dir = tempfile::tempdir().unwrap();
        let mut heap = Heap::create(
            &dir.path().join("pool"),
            Uuid::new_v4(),
            32 * 1024 * 1024,
            HeapConfig::default(),
        )
        .unwrap();
        heap.tx_begin().unwrap();
        let table_root = heap.tx_alloc_auto(DTX_TABLE_ROOT_SIZE as u64, 0).unwrap();
        heap.tx_write(table_root, &[0u8; DTX_TABLE_ROOT_SIZE]).unwrap();
        heap.tx_commit().unwrap();
        let cache = DtxCache::new(64, table_root).unwrap();
        (dir, heap, cache)
    }

    fn begin_one(heap: &mut Heap, cache: &mut DtxCache) -> (DtxId, u32) {
        let id = DtxId::generate(hlc::now());
        heap.tx_begin().unwrap();
        let lid = cache
            .begin(
                heap,
                id,
                Epoch::new(hlc::now().raw()),
                0,
                UnitOid::new(7, 0, 0),
                crate::DtxMembership::default(),
            )
            .unwrap();
        heap.tx_commit().unwrap();
        (id, lid)
    }

    #[test]
    fn begin_twice_is_rejected() {
        let (_dir, mut heap, mut cache) = fixture();
        let (id, lid) = begin_one(&mut heap, &mut cache);
        assert!(lid > 0);
        heap.tx_begin().unwrap();
        let again = cache.begin(
            &mut heap,
            id,
            Epoch::new(1),
            0,
            UnitOid::new(7, 0, 0),
            crate::DtxMembership::default(),
        );
        heap.tx_abort().unwrap();
        assert!(matches!(again, Err(StoreError::Exists)));
    }

    #[test]
    fn commit_batch_clears_ilog_in_doubt_marks() {
        let (_dir, mut heap, mut cache) = fixture();
        let (id, lid) = begin_one(&mut heap, &mut cache);

        // An incarnation-log record written under this transaction.
        heap.tx_begin().unwrap();
        let ilog_root = heap.tx_alloc_auto(ILOG_ROOT_SIZE as u64, 0).unwrap();
        let ilog = Ilog::create(&mut heap, ilog_root).unwrap();
        let stamp = Stamp::new(Epoch::new(100), 0);
        ilog.append(&mut heap, IlogRec::new(stamp, IlogKind::Create, lid))
            .unwrap();
        heap.tx_commit().unwrap();
        cache.track_record(&id, ilog_root, stamp).unwrap();
        cache.prepare(&id).unwrap();

        // In flight: the resolver reports prepared.
        assert_eq!(cache.state(lid), DtxRecState::Prepared);

        cache.commit_batch(&mut heap, &[id]).unwrap();
        assert_eq!(cache.refresh(&id).unwrap(), DtxStatus::Committed);
        assert_eq!(cache.state(lid), DtxRecState::Committed);
        assert_eq!(
            ilog.records(&heap).unwrap()[0].dtx_lid,
            0,
            "commit settles the in-doubt mark"
        );
    }

    #[test]
    fn abort_drops_ilog_records_and_slot() {
        let (_dir, mut heap, mut cache) = fixture();
        let (id, lid) = begin_one(&mut heap, &mut cache);

        heap.tx_begin().unwrap();
        let ilog_root = heap.tx_alloc_auto(ILOG_ROOT_SIZE as u64, 0).unwrap();
        let ilog = Ilog::create(&mut heap, ilog_root).unwrap();
        let stamp = Stamp::new(Epoch::new(100), 0);
        ilog.append(&mut heap, IlogRec::new(stamp, IlogKind::Create, lid))
            .unwrap();
        heap.tx_commit().unwrap();
        cache.track_record(&id, ilog_root, stamp).unwrap();

        cache.abort(&mut heap, &id).unwrap();
        assert!(ilog.is_empty(&heap).unwrap(), "aborted records vanish");
        assert!(cache.refresh(&id).is_err());
        assert_eq!(cache.state(lid), DtxRecState::Committed, "stale lid settles");
    }

    #[test]
    fn reload_restores_prepared_entries() {
        let (_dir, mut heap, mut cache) = fixture();
        let (id, lid) = begin_one(&mut heap, &mut cache);
        cache.prepare(&id).unwrap();

        // A fresh cache over the same table sees the survivor.
        let table_root = cache.table_root;
        let mut fresh = DtxCache::new(64, table_root).unwrap();
        let restored = fresh.reload(&heap).unwrap();
        assert_eq!(restored, 1);
        assert_eq!(fresh.refresh(&id).unwrap(), DtxStatus::Prepared);
        assert_eq!(fresh.state(lid), DtxRecState::Prepared);

        // Committed transactions leave no active entry behind.
        cache.commit_batch(&mut heap, &[id]).unwrap();
        let mut fresh = DtxCache::new(64, table_root).unwrap();
        assert_eq!(fresh.reload(&heap).unwrap(), 0);
    }

    #[test]
    fn epoch_below_aggregation_restarts() {
        let (_dir, mut heap, mut cache) = fixture();
        let (id, _) = begin_one(&mut heap, &mut cache);
        cache.commit_batch(&mut heap, &[id]).unwrap();

        let removed = cache
            .aggregate_committed(&mut heap, Epoch::new(u64::MAX))
            .unwrap();
        assert_eq!(removed, 1);

        assert!(matches!(
            cache.check_epoch(Epoch::new(1)),
            Err(StoreError::TxRestart)
        ));
        heap.tx_begin().unwrap();
        let low = cache.begin(
            &mut heap,
            DtxId::generate(hlc::now()),
            Epoch::new(1),
            0,
            UnitOid::new(7, 0, 0),
            crate::DtxMembership::default(),
        );
        heap.tx_abort().unwrap();
        assert!(matches!(low, Err(StoreError::TxRestart)));
    }
}