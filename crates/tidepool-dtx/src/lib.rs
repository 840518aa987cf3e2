//! Distributed-transaction layer: identifiers, the state machine, the
//! LRU-indexed active table with batched commit, and leader resync.

mod cache;
mod resync;

pub use cache::{
    DtxAvailability, DtxCache, DtxEntry, DTX_BLOB_CAP, DTX_LID_ABORTED, DTX_TABLE_ROOT_SIZE,
    DTX_THRESHOLD_AGE, DTX_THRESHOLD_COUNT,
};
pub use resync::{resync, DtxPeerStatus, DtxPeerView};

use smallvec::SmallVec;

/// Transaction states.
///
/// ```text
/// inited → preparing → prepared → committing → committable → committed
///                    ↘ aborting → aborted
/// prepared → corrupted    (resync cannot decide)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DtxStatus {
    #[default]
    Inited,
    Preparing,
    Prepared,
    Committing,
    Committable,
    Committed,
    Aborting,
    Aborted,
    Corrupted,
}

impl DtxStatus {
    /// `true` for states where the transaction outcome is still open.
    #[must_use]
    pub fn in_flight(self) -> bool {
        matches!(
            self,
            DtxStatus::Inited | DtxStatus::Preparing | DtxStatus::Prepared
        )
    }
}

/// One redundancy group of participant targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedundancyGroup {
    pub targets: SmallVec<[u32; 4]>,
}

/// Participant membership of one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DtxMembership {
    /// Flat participant target list.
    pub targets: SmallVec<[u32; 8]>,
    /// Redundancy groups over those targets.
    pub groups: Vec<RedundancyGroup>,
    /// Optional collective target bitmap, one bit per engine-local target.
    pub bitmap: Option<Vec<u8>>,
    /// Optional contiguous rank range.
    pub rank_range: Option<(u32, u32)>,
}

/// Collective-transaction extras: leader candidates and the participant
/// list cached for the current leader epoch. Re-derivation is rare and
/// allowed to be expensive, so the cache is invalidated only on leader
/// change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DtxCollective {
    /// At most four ranked leader candidates.
    pub leader_candidates: SmallVec<[u32; 4]>,
    /// Leader epoch the cached participant list was derived under.
    pub leader_epoch: u64,
    pub cached_targets: Vec<u32>,
}

impl DtxCollective {
    /// Participants for `leader_epoch`, re-deriving through `derive` only
    /// when the leader changed.
    pub fn participants<F>(&mut self, leader_epoch: u64, derive: F) -> &[u32]
    where
        F: FnOnce() -> Vec<u32>,
    {
        if self.leader_epoch != leader_epoch || self.cached_targets.is_empty() {
            self.cached_targets = derive();
            self.leader_epoch = leader_epoch;
        }
        &self.cached_targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_classification() {
        assert!(DtxStatus::Prepared.in_flight());
        assert!(DtxStatus::Inited.in_flight());
        assert!(!DtxStatus::Committed.in_flight());
        assert!(!DtxStatus::Corrupted.in_flight());
    }

    #[test]
    fn collective_participants_cached_per_leader_epoch() {
        let mut collective = DtxCollective::default();
        let mut derivations = 0;
        let got = collective
            .participants(1, || {
                derivations += 1;
                vec![1, 2, 3]
            })
            .to_vec();
        assert_eq!(got, vec![1, 2, 3]);

        // Same leader epoch: served from the cache.
        let mut rederived = false;
        collective.participants(1, || {
            rederived = true;
            vec![]
        });
        assert!(!rederived);

        // Leader change: re-derived.
        collective.participants(2, || vec![4, 5]);
        assert_eq!(collective.cached_targets, vec![4, 5]);
    }
}
