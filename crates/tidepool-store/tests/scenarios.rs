//! End-to-end scenarios over a real pool file: write/read, punch
//! visibility, conflict restart, reclamation propagation, transaction
//! settling and reopen persistence.

use tempfile::TempDir;
use tidepool_common::hlc;
use tidepool_dtx::{DtxMembership, DtxStatus};
use tidepool_error::StoreError;
use tidepool_store::{gc_reclaim_pool, punch_flags, ContHandle, GcHooks, Pool, Value};
use tidepool_types::{DtxId, Epoch, EpochRange, Extent, Stamp, UnitOid};
use uuid::Uuid;

const POOL_SIZE: u64 = 64 * 1024 * 1024;

struct Fixture {
    _dir: TempDir,
    pool: Pool,
    cont: ContHandle,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut pool = Pool::create(&dir.path().join("pool"), Uuid::new_v4(), POOL_SIZE)
        .expect("create pool");
    let cont_id = Uuid::new_v4();
    pool.create_container(cont_id).expect("create container");
    let cont = pool.open_container(cont_id).expect("open container");
    Fixture {
        _dir: dir,
        pool,
        cont,
    }
}

fn stamp(e: u64, m: u16) -> Stamp {
    Stamp::new(Epoch::new(e), m)
}

fn oid(n: u64) -> UnitOid {
    UnitOid::new(n, 1, 0)
}

#[test]
fn write_then_read_extent_value() {
    // Insert at epoch 100 and read it back at the same epoch.
    let mut fx = fixture();
    let ext = Extent::from_offset_len(0, 4);
    fx.pool
        .update(
            &mut fx.cont,
            oid(0x01),
            b"d",
            b"a",
            stamp(100, 0),
            &Value::Extent(ext, b"ABCD".to_vec()),
            None,
        )
        .unwrap();

    let bytes = fx
        .pool
        .fetch(&mut fx.cont, oid(0x01), b"d", b"a", Epoch::new(100), Some(ext))
        .unwrap();
    assert_eq!(bytes, b"ABCD");

    // Reads below the write epoch do not see the akey at all.
    assert!(matches!(
        fx.pool
            .fetch(&mut fx.cont, oid(0x01), b"d", b"a", Epoch::new(99), Some(ext)),
        Err(StoreError::NotFound)
    ));
    fx.pool.heap().check_integrity().unwrap();
}

#[test]
fn write_then_read_single_value() {
    let mut fx = fixture();
    fx.pool
        .update(
            &mut fx.cont,
            oid(7),
            b"dkey",
            b"attr",
            stamp(50, 0),
            &Value::Single(b"hello".to_vec()),
            None,
        )
        .unwrap();
    fx.pool
        .update(
            &mut fx.cont,
            oid(7),
            b"dkey",
            b"attr",
            stamp(80, 0),
            &Value::Single(b"world".to_vec()),
            None,
        )
        .unwrap();

    let read = |fx: &mut Fixture, epoch: u64| {
        fx.pool
            .fetch(&mut fx.cont, oid(7), b"dkey", b"attr", Epoch::new(epoch), None)
    };
    assert_eq!(read(&mut fx, 60).unwrap(), b"hello");
    assert_eq!(read(&mut fx, 100).unwrap(), b"world");
}

#[test]
fn punch_then_read_epoch_visibility() {
    // After a dkey punch at 200 the value is gone at 201 but intact at 150.
    let mut fx = fixture();
    let ext = Extent::from_offset_len(0, 4);
    fx.pool
        .update(
            &mut fx.cont,
            oid(0x01),
            b"d",
            b"a",
            stamp(100, 0),
            &Value::Extent(ext, b"ABCD".to_vec()),
            None,
        )
        .unwrap();
    fx.pool
        .punch(&mut fx.cont, oid(0x01), Some(b"d"), None, stamp(200, 0), 0)
        .unwrap();

    assert!(matches!(
        fx.pool
            .fetch(&mut fx.cont, oid(0x01), b"d", b"a", Epoch::new(201), Some(ext)),
        Err(StoreError::NotFound)
    ));
    let bytes = fx
        .pool
        .fetch(&mut fx.cont, oid(0x01), b"d", b"a", Epoch::new(150), Some(ext))
        .unwrap();
    assert_eq!(bytes, b"ABCD");
}

#[test]
fn conflicting_writers_restart_and_retry() {
    // Writer A lands (E, 1); writer B's identical stamp restarts, and the
    // retry with a higher minor succeeds.
    let mut fx = fixture();
    let e = 500;
    fx.pool
        .update(
            &mut fx.cont,
            oid(9),
            b"d",
            b"a",
            stamp(e, 1),
            &Value::Single(b"from-A".to_vec()),
            None,
        )
        .unwrap();

    let err = fx
        .pool
        .update(
            &mut fx.cont,
            oid(9),
            b"d",
            b"a",
            stamp(e, 1),
            &Value::Single(b"from-B".to_vec()),
            None,
        )
        .unwrap_err();
    assert!(err.is_restart(), "same-stamp write must restart, got {err:?}");

    fx.pool
        .update(
            &mut fx.cont,
            oid(9),
            b"d",
            b"a",
            stamp(e, 2),
            &Value::Single(b"from-B".to_vec()),
            None,
        )
        .unwrap();
    assert_eq!(
        fx.pool
            .fetch(&mut fx.cont, oid(9), b"d", b"a", Epoch::new(e), None)
            .unwrap(),
        b"from-B"
    );
}

#[test]
fn punch_propagates_and_gc_reclaims_the_chain() {
    // Punch the only akey; aggregation empties akey -> dkey -> object, and
    // a reclamation slice frees the whole chain.
    let mut fx = fixture();
    fx.pool
        .update(
            &mut fx.cont,
            oid(4),
            b"d",
            b"a",
            stamp(100, 0),
            &Value::Single(b"v".to_vec()),
            None,
        )
        .unwrap();
    fx.pool
        .punch(&mut fx.cont, oid(4), Some(b"d"), Some(b"a"), stamp(200, 0), 0)
        .unwrap();

    // The punch propagated: nothing is visible above epoch 200.
    assert!(fx
        .pool
        .fetch(&mut fx.cont, oid(4), b"d", b"a", Epoch::new(300), None)
        .is_err());

    let stats = fx
        .pool
        .aggregate(&mut fx.cont, EpochRange::new(Epoch::new(300), Epoch::MAX))
        .unwrap();
    assert_eq!(stats.akeys_queued, 1);
    assert_eq!(stats.dkeys_queued, 1);
    assert_eq!(stats.objs_queued, 1);

    let mut credits = 64;
    let done = gc_reclaim_pool(&mut fx.pool, &mut credits, &mut GcHooks::none()).unwrap();
    assert!(done, "one slice clears this tiny chain");
    assert!(credits > 0);

    let gc = fx.pool.gc_stats();
    assert_eq!(gc.akeys, 1);
    assert_eq!(gc.dkeys, 1);
    assert_eq!(gc.objs, 1);
    assert_eq!(gc.singvs, 1);

    assert!(matches!(
        fx.pool
            .fetch(&mut fx.cont, oid(4), b"d", b"a", Epoch::new(300), None),
        Err(StoreError::NotFound)
    ));
    fx.pool.heap().check_integrity().unwrap();
}

#[test]
fn gc_slice_respects_credit_budget() {
    let mut fx = fixture();
    for k in 0..20u8 {
        fx.pool
            .update(
                &mut fx.cont,
                oid(5),
                b"d",
                &[b'a', k],
                stamp(100, k as u16),
                &Value::Single(vec![k]),
                None,
            )
            .unwrap();
        fx.pool
            .punch(
                &mut fx.cont,
                oid(5),
                Some(b"d"),
                Some(&[b'a', k]),
                stamp(200 + u64::from(k), 0),
                punch_flags::REPLAY_PC,
            )
            .unwrap();
    }
    fx.pool
        .aggregate(&mut fx.cont, EpochRange::new(Epoch::new(1000), Epoch::MAX))
        .unwrap();

    // A tiny slice cannot finish 20 akeys: it must stop at its budget.
    let mut credits = 4;
    let done = gc_reclaim_pool(&mut fx.pool, &mut credits, &mut GcHooks::none()).unwrap();
    assert!(!done);
    assert_eq!(credits, 0);

    // Keep running slices until everything is reclaimed.
    let mut slices = 0;
    loop {
        let mut credits = 32;
        if gc_reclaim_pool(&mut fx.pool, &mut credits, &mut GcHooks::none()).unwrap() {
            break;
        }
        slices += 1;
        assert!(slices < 100, "reclamation must terminate");
    }
    assert_eq!(fx.pool.gc_stats().akeys, 20);
    fx.pool.heap().check_integrity().unwrap();
}

#[test]
fn gc_yield_hook_aborts_the_drain() {
    let mut fx = fixture();
    fx.pool
        .update(
            &mut fx.cont,
            oid(6),
            b"d",
            b"a",
            stamp(100, 0),
            &Value::Single(b"v".to_vec()),
            None,
        )
        .unwrap();
    fx.pool
        .punch(&mut fx.cont, oid(6), Some(b"d"), Some(b"a"), stamp(200, 0), 0)
        .unwrap();
    fx.pool
        .aggregate(&mut fx.cont, EpochRange::new(Epoch::new(300), Epoch::MAX))
        .unwrap();

    let mut yield_now = || -1;
    let mut flushed = 0u32;
    let mut flush = |max: u32| {
        flushed = max;
        0
    };
    let mut hooks = GcHooks {
        yield_fn: Some(&mut yield_now),
        flush_fn: Some(&mut flush),
    };
    let mut credits = 32;
    gc_reclaim_pool(&mut fx.pool, &mut credits, &mut hooks).unwrap();
    assert_eq!(credits, 32, "aborted slice spends nothing");
    assert_eq!(flushed, u32::MAX, "backend flush still runs after the slice");
    assert_eq!(fx.pool.gc_stats().akeys, 0);
}

#[test]
fn destroyed_container_is_fully_reclaimed() {
    let dir = tempfile::tempdir().unwrap();
    let mut pool = Pool::create(&dir.path().join("pool"), Uuid::new_v4(), POOL_SIZE).unwrap();
    let baseline = pool.heap().stats().unwrap().free_chunks;

    let cont_id = Uuid::new_v4();
    pool.create_container(cont_id).unwrap();
    let mut cont = pool.open_container(cont_id).unwrap();
    for k in 0..5u8 {
        pool.update(
            &mut cont,
            oid(u64::from(k)),
            b"d",
            b"a",
            stamp(100, k as u16),
            &Value::Single(vec![k; 32]),
            None,
        )
        .unwrap();
    }
    drop(cont);

    pool.destroy_container(cont_id).unwrap();
    assert!(pool.open_container(cont_id).is_err());

    let mut slices = 0;
    loop {
        let mut credits = 32;
        if gc_reclaim_pool(&mut pool, &mut credits, &mut GcHooks::none()).unwrap() {
            break;
        }
        slices += 1;
        assert!(slices < 1000, "container teardown must terminate");
    }
    let gc = pool.gc_stats();
    assert_eq!(gc.conts, 1);
    assert_eq!(gc.objs, 5);
    assert_eq!(
        pool.heap().stats().unwrap().free_chunks,
        baseline,
        "every chunk of the container chain came back"
    );
    pool.heap().check_integrity().unwrap();
}

#[test]
fn pool_contents_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pool");
    let cont_id = Uuid::new_v4();
    let ext = Extent::from_offset_len(0, 8);
    {
        let mut pool = Pool::create(&path, Uuid::new_v4(), POOL_SIZE).unwrap();
        pool.create_container(cont_id).unwrap();
        let mut cont = pool.open_container(cont_id).unwrap();
        pool.update(
            &mut cont,
            oid(1),
            b"dk",
            b"ak",
            stamp(100, 0),
            &Value::Extent(ext, b"DURABLE!".to_vec()),
            None,
        )
        .unwrap();
        pool.close().unwrap();
    }

    let mut pool = Pool::open(&path).unwrap();
    let mut cont = pool.open_container(cont_id).unwrap();
    let bytes = pool
        .fetch(&mut cont, oid(1), b"dk", b"ak", Epoch::new(100), Some(ext))
        .unwrap();
    assert_eq!(bytes, b"DURABLE!");
    pool.heap().check_integrity().unwrap();
}

#[test]
fn in_flight_transaction_gates_readers_until_commit() {
    let mut fx = fixture();
    hlc::init().unwrap();
    let id = DtxId::generate(hlc::now());
    let write_stamp = stamp(100, 0);

    fx.pool.heap_mut().tx_begin().unwrap();
    fx.cont
        .dtx
        .begin(
            fx.pool.heap_mut(),
            id,
            write_stamp.epoch,
            0,
            oid(2),
            DtxMembership::default(),
        )
        .unwrap();
    fx.pool.heap_mut().tx_commit().unwrap();

    fx.pool
        .update(
            &mut fx.cont,
            oid(2),
            b"d",
            b"a",
            write_stamp,
            &Value::Single(b"pending".to_vec()),
            Some(&id),
        )
        .unwrap();
    fx.cont.dtx.prepare(&id).unwrap();

    // A reader whose uncertainty window covers the prepared write must
    // restart.
    let err = fx
        .pool
        .fetch(&mut fx.cont, oid(2), b"d", b"a", Epoch::new(150), None)
        .unwrap_err();
    assert!(err.is_restart(), "expected restart, got {err:?}");

    // Commit settles everything; the same read now succeeds.
    fx.cont
        .dtx
        .commit_batch(fx.pool.heap_mut(), &[id])
        .unwrap();
    assert_eq!(fx.cont.dtx.refresh(&id).unwrap(), DtxStatus::Committed);
    let bytes = fx
        .pool
        .fetch(&mut fx.cont, oid(2), b"d", b"a", Epoch::new(150), None)
        .unwrap();
    assert_eq!(bytes, b"pending");
}

#[test]
fn aborted_transaction_leaves_no_trace() {
    let mut fx = fixture();
    hlc::init().unwrap();
    let id = DtxId::generate(hlc::now());

    fx.pool.heap_mut().tx_begin().unwrap();
    fx.cont
        .dtx
        .begin(
            fx.pool.heap_mut(),
            id,
            Epoch::new(100),
            0,
            oid(3),
            DtxMembership::default(),
        )
        .unwrap();
    fx.pool.heap_mut().tx_commit().unwrap();

    fx.pool
        .update(
            &mut fx.cont,
            oid(3),
            b"d",
            b"a",
            stamp(100, 0),
            &Value::Single(b"ghost".to_vec()),
            Some(&id),
        )
        .unwrap();

    fx.cont.dtx.abort(fx.pool.heap_mut(), &id).unwrap();

    assert!(matches!(
        fx.pool
            .fetch(&mut fx.cont, oid(3), b"d", b"a", Epoch::new(200), None),
        Err(StoreError::NotFound)
    ));
}

#[test]
fn akey_punch_without_siblings_propagates_no_further_than_the_object() {
    // Two akeys under one dkey: punching one must not punch the dkey.
    let mut fx = fixture();
    for akey in [b"a1".as_slice(), b"a2".as_slice()] {
        fx.pool
            .update(
                &mut fx.cont,
                oid(8),
                b"d",
                akey,
                stamp(100, 0),
                &Value::Single(b"v".to_vec()),
                None,
            )
            .unwrap();
    }
    fx.pool
        .punch(&mut fx.cont, oid(8), Some(b"d"), Some(b"a1"), stamp(200, 0), 0)
        .unwrap();

    // The sibling is still readable above the punch.
    assert_eq!(
        fx.pool
            .fetch(&mut fx.cont, oid(8), b"d", b"a2", Epoch::new(300), None)
            .unwrap(),
        b"v"
    );
    assert!(fx
        .pool
        .fetch(&mut fx.cont, oid(8), b"d", b"a1", Epoch::new(300), None)
        .is_err());
}

#[test]
fn epochs_below_the_aggregation_watermark_restart() {
    // History below the aggregated range is collapsed; reads and updates
    // down there must restart, and the watermark survives a reopen.
    let mut fx = fixture();
    fx.pool
        .update(
            &mut fx.cont,
            oid(11),
            b"d",
            b"a",
            stamp(100, 0),
            &Value::Single(b"old".to_vec()),
            None,
        )
        .unwrap();
    fx.pool
        .update(
            &mut fx.cont,
            oid(11),
            b"d",
            b"a",
            stamp(400, 0),
            &Value::Single(b"new".to_vec()),
            None,
        )
        .unwrap();

    fx.pool
        .aggregate(&mut fx.cont, EpochRange::new(Epoch::new(300), Epoch::MAX))
        .unwrap();

    // A read below the watermark restarts.
    let err = fx
        .pool
        .fetch(&mut fx.cont, oid(11), b"d", b"a", Epoch::new(200), None)
        .unwrap_err();
    assert!(err.is_restart(), "stale read must restart, got {err:?}");

    // So does an update.
    let err = fx
        .pool
        .update(
            &mut fx.cont,
            oid(11),
            b"d",
            b"a",
            stamp(250, 0),
            &Value::Single(b"too-old".to_vec()),
            None,
        )
        .unwrap_err();
    assert!(err.is_restart(), "stale update must restart, got {err:?}");

    // At and above the watermark everything still works.
    assert_eq!(
        fx.pool
            .fetch(&mut fx.cont, oid(11), b"d", b"a", Epoch::new(450), None)
            .unwrap(),
        b"new"
    );

    // The watermark is persisted with the container: a fresh handle keeps
    // rejecting stale epochs.
    let cont_id = fx.cont.id;
    fx.cont = fx.pool.open_container(cont_id).unwrap();
    let err = fx
        .pool
        .fetch(&mut fx.cont, oid(11), b"d", b"a", Epoch::new(200), None)
        .unwrap_err();
    assert!(
        err.is_restart(),
        "watermark must survive reopen, got {err:?}"
    );
}

#[test]
fn object_punch_hides_everything_below() {
    let mut fx = fixture();
    fx.pool
        .update(
            &mut fx.cont,
            oid(10),
            b"d",
            b"a",
            stamp(100, 0),
            &Value::Single(b"v".to_vec()),
            None,
        )
        .unwrap();
    fx.pool
        .punch(&mut fx.cont, oid(10), None, None, stamp(150, 0), 0)
        .unwrap();

    assert!(fx
        .pool
        .fetch(&mut fx.cont, oid(10), b"d", b"a", Epoch::new(200), None)
        .is_err());
    assert_eq!(
        fx.pool
            .fetch(&mut fx.cont, oid(10), b"d", b"a", Epoch::new(120), None)
            .unwrap(),
        b"v"
    );
}
