//! Leader-switch resynchronization.
//!
//! When a new leader takes over it must settle every transaction the old
//! leader left prepared. The decision rules:
//!
//! - abort when at least one alive participant reports aborted;
//! - commit when every alive participant reports prepared (or already
//!   committed) and no redundancy group has lost all of its targets;
//! - otherwise the outcome is unknowable from here: mark corrupted and
//!   leave it for external intervention.

use tidepool_error::Result;
use tidepool_heap::Heap;
use tidepool_types::DtxId;
use tracing::{info, warn};

use crate::cache::DtxCache;
use crate::DtxStatus;

/// A participant's view of one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtxPeerStatus {
    Prepared,
    Committed,
    Aborted,
    Unknown,
}

/// Cluster view used during resync. The RPC transport behind it is out of
/// scope; tests drive this with fakes.
pub trait DtxPeerView {
    fn is_alive(&self, target: u32) -> bool;
    fn status(&self, target: u32, id: &DtxId) -> DtxPeerStatus;
}

/// Outcome counters of one resync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncStats {
    pub committed: usize,
    pub aborted: usize,
    pub corrupted: usize,
}

/// Settle every prepared transaction in the cache against the cluster
/// view.
pub fn resync<V: DtxPeerView>(
    cache: &mut DtxCache,
    heap: &mut Heap,
    view: &V,
) -> Result<ResyncStats> {
    let mut stats = ResyncStats::default();

    for id in cache.in_flight() {
        if cache.status_of(&id) != Some(DtxStatus::Prepared) {
            continue;
        }
        let Some(membership) = cache.membership_of(&id) else {
            continue;
        };

        let alive: Vec<u32> = membership
            .targets
            .iter()
            .copied()
            .filter(|&t| view.is_alive(t))
            .collect();

        let any_aborted = alive
            .iter()
            .any(|&t| view.status(t, &id) == DtxPeerStatus::Aborted);
        if any_aborted {
            cache.abort(heap, &id)?;
            stats.aborted += 1;
            info!(%id, "resync: aborted with the surviving participants");
            continue;
        }

        let group_lost = membership
            .groups
            .iter()
            .any(|group| group.targets.iter().all(|&t| !view.is_alive(t)));
        let all_prepared = !alive.is_empty()
            && alive.iter().all(|&t| {
                matches!(
                    view.status(t, &id),
                    DtxPeerStatus::Prepared | DtxPeerStatus::Committed
                )
            });

        if all_prepared && !group_lost {
            cache.commit(heap, &id)?;
            stats.committed += 1;
            info!(%id, "resync: committed");
        } else {
            cache.set_status(&id, DtxStatus::Corrupted)?;
            stats.corrupted += 1;
            warn!(%id, group_lost, "resync: outcome unknowable, marked corrupted");
        }
    }

    // Whatever was re-committed should land.
    cache.flush_committed(heap)?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DtxMembership, RedundancyGroup};
    use std::collections::HashMap;
    use tidepool_common::hlc;
    use tidepool_heap::{Heap, HeapConfig};
    use tidepool_types::{Epoch, UnitOid};
    use uuid::Uuid;

    struct FakeView {
        dead: Vec<u32>,
        statuses: HashMap<u32, DtxPeerStatus>,
    }

    impl DtxPeerView for FakeView {
        fn is_alive(&self, target: u32) -> bool {
            !self.dead.contains(&target)
        }

        fn status(&self, target: u32, _id: &DtxId) -> DtxPeerStatus {
            self.statuses
                .get(&target)
                .copied()
                .unwrap_or(DtxPeerStatus::Unknown)
        }
    }

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
        let table_root = heap
            .tx_alloc_auto(crate::DTX_TABLE_ROOT_SIZE as u64, 0)
            .unwrap();
        heap.tx_write(table_root, &[0u8; crate::DTX_TABLE_ROOT_SIZE])
            .unwrap();
        heap.tx_commit().unwrap();
        let cache = DtxCache::new(64, table_root).unwrap();
        (dir, heap, cache)
    }

    fn membership(targets: &[u32]) -> DtxMembership {
        DtxMembership {
            targets: targets.iter().copied().collect(),
            groups: vec![RedundancyGroup {
                targets: targets.iter().copied().collect(),
            }],
            bitmap: None,
            rank_range: None,
        }
    }

    fn begin(heap: &mut Heap, cache: &mut DtxCache, targets: &[u32]) -> DtxId {
        let id = DtxId::generate(hlc::now());
        heap.tx_begin().unwrap();
        cache
            .begin(
                heap,
                id,
                Epoch::new(hlc::now().raw()),
                0,
                UnitOid::new(1, 0, 0),
                membership(targets),
            )
            .unwrap();
        heap.tx_commit().unwrap();
        cache.prepare(&id).unwrap();
        id
    }

    #[test]
    fn all_prepared_commits() {
        let (_dir, mut heap, mut cache) = fixture();
        let id = begin(&mut heap, &mut cache, &[1, 2, 3]);
        let view = FakeView {
            dead: vec![],
            statuses: HashMap::from([
                (1, DtxPeerStatus::Prepared),
                (2, DtxPeerStatus::Prepared),
                (3, DtxPeerStatus::Committed),
            ]),
        };
        let stats = resync(&mut cache, &mut heap, &view).unwrap();
        assert_eq!(stats.committed, 1);
        assert_eq!(cache.refresh(&id).unwrap(), DtxStatus::Committed);
        // Invariant: a committed transaction reports clean availability.
        assert_eq!(
            cache.check(&id, 0),
            crate::DtxAvailability::AvailableClean
        );
    }

    #[test]
    fn one_aborted_participant_aborts() {
        let (_dir, mut heap, mut cache) = fixture();
        let id = begin(&mut heap, &mut cache, &[1, 2]);
        let view = FakeView {
            dead: vec![],
            statuses: HashMap::from([
                (1, DtxPeerStatus::Prepared),
                (2, DtxPeerStatus::Aborted),
            ]),
        };
        let stats = resync(&mut cache, &mut heap, &view).unwrap();
        assert_eq!(stats.aborted, 1);
        assert!(cache.refresh(&id).is_err(), "aborted entries are dropped");
    }

    #[test]
    fn lost_redundancy_group_marks_corrupted() {
        let (_dir, mut heap, mut cache) = fixture();
        let id = begin(&mut heap, &mut cache, &[1, 2]);
        // Every member of the only group is dead.
        let view = FakeView {
            dead: vec![1, 2],
            statuses: HashMap::new(),
        };
        let stats = resync(&mut cache, &mut heap, &view).unwrap();
        assert_eq!(stats.corrupted, 1);
        assert_eq!(cache.refresh(&id).unwrap(), DtxStatus::Corrupted);
    }

    #[test]
    fn unknown_status_marks_corrupted() {
        let (_dir, mut heap, mut cache) = fixture();
        let id = begin(&mut heap, &mut cache, &[1, 2]);
        let view = FakeView {
            dead: vec![],
            statuses: HashMap::from([(1, DtxPeerStatus::Prepared)]),
            // target 2 answers Unknown
        };
        let stats = resync(&mut cache, &mut heap, &view).unwrap();
        assert_eq!(stats.corrupted, 1);
        assert_eq!(cache.refresh(&id).unwrap(), DtxStatus::Corrupted);
    }
}
