//! Hybrid logical clock.
//!
//! Timestamps are 64-bit: the upper 46 bits carry physical time in units of
//! 1/16 ns since 2021-01-01 00:00:00 UTC, the lower 18 bits are a logical
//! counter for events sharing one physical reading. The x16 scaling trades
//! range for counter head-room, leaving the clock valid until roughly 2057;
//! [`init`] refuses to start outside that window.
//!
//! The clock state is one process-global `AtomicU64` advanced by
//! compare-and-swap. There is no constructor-time magic: engine bootstrap
//! calls [`init`] exactly once before the first timestamp is taken.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tidepool_error::{Result, StoreError};
use tidepool_types::Epoch;

/// HLC units per nanosecond.
const HLC_NSEC_UNITS: u64 = 16;

/// Clock origin: 2021-01-01 00:00:00 UTC in Unix seconds.
const HLC_START_SEC: u64 = 1_609_459_200;

/// Mask selecting the 18 logical bits.
const LOGICAL_MASK: u64 = 0x3_FFFF;

const NSEC_PER_SEC: u64 = 1_000_000_000;

static HLC: AtomicU64 = AtomicU64::new(0);

/// Maximum tolerated remote physical lead, in HLC units. Default one second.
static EPSILON: AtomicU64 = AtomicU64::new(NSEC_PER_SEC * HLC_NSEC_UNITS);

/// Physical component of the current wall clock, masked to the upper 46 bits.
fn physical_now() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before the Unix epoch");
    let secs = now.as_secs();
    debug_assert!(secs > HLC_START_SEC, "system clock before the HLC origin");
    let pt = ((secs - HLC_START_SEC) * NSEC_PER_SEC + u64::from(now.subsec_nanos()))
        .wrapping_mul(HLC_NSEC_UNITS);
    pt & !LOGICAL_MASK
}

/// Validate that the wall clock lies inside the representable window and
/// prime the global state. Must run once from engine bootstrap before any
/// other clock call.
pub fn init() -> Result<()> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| StoreError::Overflow {
            detail: "system clock before the Unix epoch".to_string(),
        })?;
    let secs = now.as_secs();
    if secs <= HLC_START_SEC {
        return Err(StoreError::Overflow {
            detail: format!("system clock {secs}s predates the clock origin {HLC_START_SEC}s"),
        });
    }
    // The physical field wraps once (now - origin) in nanoseconds exceeds
    // u64::MAX / 16. Refuse to start rather than hand out wrapped stamps.
    let elapsed_ns =
        u128::from(secs - HLC_START_SEC) * u128::from(NSEC_PER_SEC) + u128::from(now.subsec_nanos());
    if elapsed_ns > u128::from(u64::MAX / HLC_NSEC_UNITS) {
        return Err(StoreError::Overflow {
            detail: "wall clock is past the representable HLC range".to_string(),
        });
    }
    // Fold the boot reading in so the first now() is already past it.
    HLC.fetch_max(physical_now(), Ordering::SeqCst);
    Ok(())
}

/// Take a timestamp strictly greater than every previous one in this process.
pub fn now() -> Epoch {
    let pt = physical_now();
    let mut cur = HLC.load(Ordering::SeqCst);
    loop {
        let next = if (cur & !LOGICAL_MASK) < pt { pt } else { cur + 1 };
        match HLC.compare_exchange_weak(cur, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return Epoch::new(next),
            Err(observed) => cur = observed,
        }
    }
}

/// Merge a remote timestamp into the local clock, returning a stamp greater
/// than both. Fails with [`StoreError::HlcSync`] when the remote physical
/// part leads local physical time by more than the configured epsilon.
pub fn recv(msg: Epoch) -> Result<Epoch> {
    let pt = physical_now();
    let ml = msg.raw() & !LOGICAL_MASK;
    let offset = ml.saturating_sub(pt);
    if offset > EPSILON.load(Ordering::Relaxed) {
        return Err(StoreError::HlcSync {
            offset_ns: offset / HLC_NSEC_UNITS,
        });
    }

    let mut cur = HLC.load(Ordering::SeqCst);
    loop {
        let next = if (cur & !LOGICAL_MASK) < ml {
            if ml < pt {
                pt
            } else {
                msg.raw() + 1
            }
        } else if (cur & !LOGICAL_MASK) < pt {
            pt
        } else if pt <= ml {
            cur.max(msg.raw()) + 1
        } else {
            cur + 1
        };
        match HLC.compare_exchange_weak(cur, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return Ok(Epoch::new(next)),
            Err(observed) => cur = observed,
        }
    }
}

/// Nanoseconds since the clock origin represented by `hlc`.
#[must_use]
pub fn to_nsec(hlc: Epoch) -> u64 {
    hlc.raw() / HLC_NSEC_UNITS
}

/// Timestamp representing `nsec` nanoseconds since the clock origin.
#[must_use]
pub fn from_nsec(nsec: u64) -> Epoch {
    Epoch::new(nsec * HLC_NSEC_UNITS)
}

/// Unix nanoseconds represented by `hlc`.
#[must_use]
pub fn to_unix_nsec(hlc: Epoch) -> u64 {
    hlc.raw() / HLC_NSEC_UNITS + HLC_START_SEC * NSEC_PER_SEC
}

/// Timestamp for a Unix-nanosecond reading, or an error when the reading
/// falls outside the representable window.
pub fn from_unix_nsec(unix_nsec: u64) -> Result<Epoch> {
    let start = HLC_START_SEC * NSEC_PER_SEC;
    if unix_nsec < start || unix_nsec - start > u64::MAX / HLC_NSEC_UNITS {
        return Err(StoreError::Overflow {
            detail: format!("unix time {unix_nsec} ns is outside the HLC range"),
        });
    }
    Ok(Epoch::new((unix_nsec - start) * HLC_NSEC_UNITS))
}

/// Wall-clock time represented by `hlc`.
#[must_use]
pub fn to_system_time(hlc: Epoch) -> SystemTime {
    let nsec = to_nsec(hlc);
    UNIX_EPOCH + Duration::from_secs(HLC_START_SEC) + Duration::from_nanos(nsec)
}

/// Timestamp for a wall-clock reading.
pub fn from_system_time(ts: SystemTime) -> Result<Epoch> {
    let since = ts
        .duration_since(UNIX_EPOCH)
        .map_err(|_| StoreError::Overflow {
            detail: "timestamp before the Unix epoch".to_string(),
        })?;
    let nanos = u64::try_from(since.as_nanos()).map_err(|_| StoreError::Overflow {
        detail: "timestamp beyond 64-bit nanoseconds".to_string(),
    })?;
    from_unix_nsec(nanos)
}

/// Seconds elapsed between `hlc` and the current physical clock; zero when
/// `hlc` is in the future.
#[must_use]
pub fn age_secs(hlc: Epoch) -> u64 {
    let pt = physical_now();
    if pt <= hlc.raw() {
        return 0;
    }
    (pt - hlc.raw()) / HLC_NSEC_UNITS / NSEC_PER_SEC
}

/// Set the maximum tolerated clock offset, in nanoseconds. Rounded up to a
/// whole logical window so the bound always lands on a physical boundary.
pub fn epsilon_set(epsilon_ns: u64) {
    let units = (epsilon_ns.saturating_mul(HLC_NSEC_UNITS) + LOGICAL_MASK) & !LOGICAL_MASK;
    EPSILON.store(units, Ordering::Relaxed);
    tracing::info!(epsilon_ns, "set maximum system clock offset");
}

/// Current epsilon in nanoseconds.
#[must_use]
pub fn epsilon_get() -> u64 {
    EPSILON.load(Ordering::Relaxed) / HLC_NSEC_UNITS
}

/// Upper bound of the epoch-uncertainty window for a stamp: any transaction
/// prepared at or below this bound may have started before `hlc` was taken.
#[must_use]
pub fn epsilon_bound(hlc: Epoch) -> Epoch {
    Epoch::new((hlc.raw() + EPSILON.load(Ordering::Relaxed)) | LOGICAL_MASK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strictly_increasing_in_one_thread() {
        init().expect("clock in range");
        let mut prev = now();
        for _ in 0..10_000 {
            let next = now();
            assert!(next > prev, "{prev} then {next}");
            prev = next;
        }
    }

    #[test]
    fn concurrent_callers_get_distinct_stamps() {
        init().expect("clock in range");
        let handles: Vec<_> = (0..2)
            .map(|_| {
                std::thread::spawn(|| (0..1000).map(|_| now()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<Epoch> = Vec::new();
        for h in handles {
            all.extend(h.join().expect("thread"));
        }
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total, "CAS must never hand out duplicates");
    }

    #[test]
    fn nsec_round_trip() {
        let nsec = 123_456_789_012;
        assert_eq!(to_nsec(from_nsec(nsec)), nsec);
    }

    #[test]
    fn system_time_round_trip() {
        let ts = UNIX_EPOCH + Duration::from_secs(HLC_START_SEC + 1_000) + Duration::from_nanos(567);
        let hlc = from_system_time(ts).expect("in range");
        assert_eq!(to_system_time(hlc), ts);
    }

    #[test]
    fn unix_nsec_rejects_pre_origin() {
        assert!(matches!(
            from_unix_nsec(1),
            Err(StoreError::Overflow { .. })
        ));
    }

    #[test]
    fn recv_within_epsilon_advances_clock() {
        init().expect("clock in range");
        let local = now();
        let merged = recv(local).expect("own stamp is always within epsilon");
        assert!(merged > local);
    }

    #[test]
    fn recv_far_future_is_rejected() {
        init().expect("clock in range");
        // Ten seconds ahead of the physical clock, well past the 1 s default.
        let ahead = Epoch::new(physical_now() + 10 * NSEC_PER_SEC * HLC_NSEC_UNITS);
        match recv(ahead) {
            Err(StoreError::HlcSync { offset_ns }) => assert!(offset_ns > NSEC_PER_SEC),
            other => panic!("expected HlcSync, got {other:?}"),
        }
    }

    #[test]
    fn epsilon_bound_is_inclusive_of_logical_window() {
        let e = Epoch::new(0x40_0000);
        let bound = epsilon_bound(e);
        assert_eq!(bound.raw() & LOGICAL_MASK, LOGICAL_MASK);
        assert!(bound > e);
    }
}
