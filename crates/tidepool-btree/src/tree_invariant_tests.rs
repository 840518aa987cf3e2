//! Whole-tree invariant and behaviour tests against a real heap.

use std::cmp::Ordering;

use tempfile::TempDir;
use tidepool_error::{Result, StoreError};
use tidepool_heap::{Heap, HeapConfig};
use tidepool_types::RawOff;
use uuid::Uuid;

use crate::class::{BtrClass, ClassRegistry, RecStat};
use crate::feats;
use crate::iter::Probe;
use crate::tree::{Btree, ProbeOpc};
use crate::BTR_ROOT_SIZE;

const KV_CLASS: u16 = 77;
const UINT_CLASS: u16 = 78;

// A plain key/value record body: `klen u32 | vlen u32 | key | value`.

fn kv_rec_alloc(heap: &mut Heap, key: &[u8], val: &[u8]) -> Result<RawOff> {
    let off = heap.tx_alloc_auto((8 + key.len() + val.len()) as u64, 0)?;
    let mut body = Vec::with_capacity(8 + key.len() + val.len());
    body.extend_from_slice(&(key.len() as u32).to_le_bytes());
    body.extend_from_slice(&(val.len() as u32).to_le_bytes());
    body.extend_from_slice(key);
    body.extend_from_slice(val);
    heap.tx_write(off, &body)?;
    Ok(off)
}

fn kv_rec_free(heap: &mut Heap, off: RawOff) -> Result<()> {
    heap.tx_free(off)
}

fn kv_rec_fetch(heap: &Heap, off: RawOff) -> Result<(Vec<u8>, Vec<u8>)> {
    let klen = heap.read_u32(off)? as usize;
    let vlen = heap.read_u32(off.at(4))? as usize;
    let key = heap.read_vec(off.at(8), klen)?;
    let val = heap.read_vec(off.at(8 + klen as u64), vlen)?;
    Ok((key, val))
}

fn kv_rec_update(heap: &mut Heap, off: RawOff, val: &[u8]) -> Result<bool> {
    let klen = heap.read_u32(off)? as usize;
    let vlen = heap.read_u32(off.at(4))? as usize;
    if vlen != val.len() {
        return Ok(false);
    }
    heap.tx_write(off.at(8 + klen as u64), val)?;
    Ok(true)
}

fn kv_key_cmp(heap: &Heap, off: RawOff, probe: &[u8]) -> Result<Ordering> {
    let (key, _) = kv_rec_fetch(heap, off)?;
    Ok(key.as_slice().cmp(probe))
}

fn kv_rec_stat(heap: &Heap, off: RawOff) -> Result<RecStat> {
    let (key, val) = kv_rec_fetch(heap, off)?;
    Ok(RecStat {
        key_size: key.len() as u64,
        val_size: val.len() as u64,
    })
}

fn kv_class() -> BtrClass {
    BtrClass {
        id: KV_CLASS,
        name: "kv",
        hkey_gen: None,
        hkey_cmp: None,
        key_cmp: Some(kv_key_cmp),
        key_encode: None,
        key_decode: None,
        rec_alloc: kv_rec_alloc,
        rec_free: kv_rec_free,
        rec_fetch: kv_rec_fetch,
        rec_update: Some(kv_rec_update),
        rec_stat: Some(kv_rec_stat),
        rec_string: None,
        check_availability: None,
        node_alloc: None,
    }
}

fn uint_class() -> BtrClass {
    BtrClass {
        id: UINT_CLASS,
        ..kv_class()
    }
}

struct Fixture {
    _dir: TempDir,
    heap: Heap,
    registry: ClassRegistry,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let heap = Heap::create(
        &dir.path().join("pool"),
        Uuid::new_v4(),
        64 * 1024 * 1024,
        HeapConfig::default(),
    )
    .expect("create pool");
    let registry = ClassRegistry::new();
    registry.register(kv_class()).expect("register kv");
    registry.register(uint_class()).expect("register uint");
    Fixture {
        _dir: dir,
        heap,
        registry,
    }
}

/// Allocate space for a root structure.
fn alloc_root(heap: &mut Heap) -> RawOff {
    heap.tx_begin().unwrap();
    let off = heap.tx_alloc_auto(BTR_ROOT_SIZE as u64, 0).unwrap();
    heap.tx_commit().unwrap();
    off
}

fn make_tree(fx: &mut Fixture, tree_feats: u16, order: u8) -> Btree {
    let root_off = alloc_root(&mut fx.heap);
    fx.heap.tx_begin().unwrap();
    let tree = Btree::create(
        &mut fx.heap,
        &fx.registry,
        root_off,
        KV_CLASS,
        tree_feats,
        order,
    )
    .unwrap();
    fx.heap.tx_commit().unwrap();
    tree
}

fn put(fx: &mut Fixture, tree: &Btree, key: &[u8], val: &[u8]) {
    fx.heap.tx_begin().unwrap();
    tree.upsert(&mut fx.heap, key, val).unwrap();
    fx.heap.tx_commit().unwrap();
}

fn del(fx: &mut Fixture, tree: &Btree, key: &[u8]) -> Result<()> {
    fx.heap.tx_begin().unwrap();
    let out = tree.delete(&mut fx.heap, key);
    if out.is_ok() {
        fx.heap.tx_commit().unwrap();
    } else {
        fx.heap.tx_abort().unwrap();
    }
    out
}

/// Iterate the whole tree, asserting strictly ascending key order.
fn collect_sorted(fx: &Fixture, tree: &Btree) -> Vec<Vec<u8>> {
    let mut iter = tree.iter_prepare();
    let mut keys = Vec::new();
    if iter
        .probe(&fx.heap, ProbeOpc::First, Probe::None)
        .unwrap()
    {
        loop {
            let (key, _, _, _) = iter.fetch(&fx.heap, crate::intent::DEFAULT).unwrap();
            if let Some(prev) = keys.last() {
                assert!(prev < &key, "leaf order violated: {prev:?} !< {key:?}");
            }
            keys.push(key);
            if !iter.next(&fx.heap).unwrap() {
                break;
            }
        }
    }
    keys
}

fn key(i: usize) -> Vec<u8> {
    format!("k{i:04}").into_bytes()
}

#[test]
fn insert_lookup_delete_round_trip() {
    let mut fx = fixture();
    let tree = make_tree(&mut fx, 0, 8);

    put(&mut fx, &tree, b"alpha", b"one");
    put(&mut fx, &tree, b"beta", b"two");

    let (_, val, _) = tree.lookup(&fx.heap, b"alpha").unwrap();
    assert_eq!(val, b"one");

    del(&mut fx, &tree, b"alpha").unwrap();
    assert!(matches!(
        tree.lookup(&fx.heap, b"alpha"),
        Err(StoreError::NotFound)
    ));
    let (_, val, _) = tree.lookup(&fx.heap, b"beta").unwrap();
    assert_eq!(val, b"two");
}

#[test]
fn upsert_replaces_and_updates_in_place() {
    let mut fx = fixture();
    let tree = make_tree(&mut fx, 0, 8);

    put(&mut fx, &tree, b"key", b"val1");
    // Same length: in-place path.
    put(&mut fx, &tree, b"key", b"val2");
    assert_eq!(tree.lookup(&fx.heap, b"key").unwrap().1, b"val2");
    // Different length: free + realloc path.
    put(&mut fx, &tree, b"key", b"a-much-longer-value");
    assert_eq!(tree.lookup(&fx.heap, b"key").unwrap().1, b"a-much-longer-value");
}

#[test]
fn insert_rejects_existing_and_update_rejects_missing() {
    let mut fx = fixture();
    let tree = make_tree(&mut fx, 0, 8);
    put(&mut fx, &tree, b"key", b"val");

    fx.heap.tx_begin().unwrap();
    assert!(matches!(
        tree.insert(&mut fx.heap, b"key", b"other"),
        Err(StoreError::Exists)
    ));
    assert!(matches!(
        tree.update(&mut fx.heap, b"missing", b"x"),
        Err(StoreError::NotFound)
    ));
    fx.heap.tx_abort().unwrap();
}

#[test]
fn minimum_order_tree_survives_reverse_deletion() {
    let mut fx = fixture();
    let tree = make_tree(&mut fx, 0, 3);
    let n = 64;
    for i in 0..n {
        put(&mut fx, &tree, &key(i), b"v");
        collect_sorted(&fx, &tree);
    }
    for i in (0..n).rev() {
        del(&mut fx, &tree, &key(i)).unwrap();
        // The tree must stay well-formed after every step.
        let keys = collect_sorted(&fx, &tree);
        assert_eq!(keys.len(), i);
    }
    assert!(tree.is_empty(&fx.heap).unwrap());
    fx.heap.check_integrity().unwrap();
}

#[test]
fn large_population_iterates_sorted() {
    let mut fx = fixture();
    let tree = make_tree(&mut fx, 0, 8);
    // Insert in a scrambled order.
    for i in 0..500 {
        let scrambled = (i * 131) % 500;
        put(&mut fx, &tree, &key(scrambled), format!("v{scrambled}").as_bytes());
    }
    let keys = collect_sorted(&fx, &tree);
    assert_eq!(keys.len(), 500);
    assert_eq!(keys[0], key(0));
    assert_eq!(keys[499], key(499));
}

#[test]
fn embedded_root_holds_first_record_inline() {
    let mut fx = fixture();
    let tree = make_tree(&mut fx, feats::EMBED_FIRST, 8);

    put(&mut fx, &tree, b"only", b"record");
    let root = tree.root(&fx.heap).unwrap();
    assert_eq!(root.depth, 0, "first record lives in the root");
    assert!(root.feats & feats::EMBEDDED != 0);
    assert_eq!(tree.lookup(&fx.heap, b"only").unwrap().1, b"record");

    // Second insert promotes to a real leaf and clears the bit.
    put(&mut fx, &tree, b"second", b"rec2");
    let root = tree.root(&fx.heap).unwrap();
    assert_eq!(root.depth, 1);
    assert!(root.feats & feats::EMBEDDED == 0);
    assert_eq!(collect_sorted(&fx, &tree).len(), 2);
}

#[test]
fn embedded_root_update_and_delete() {
    let mut fx = fixture();
    let tree = make_tree(&mut fx, feats::EMBED_FIRST, 8);
    put(&mut fx, &tree, b"k", b"v1");
    put(&mut fx, &tree, b"k", b"v2");
    assert_eq!(tree.lookup(&fx.heap, b"k").unwrap().1, b"v2");
    del(&mut fx, &tree, b"k").unwrap();
    assert!(tree.is_empty(&fx.heap).unwrap());
}

#[test]
fn probe_modes_cover_gaps_and_bounds() {
    let mut fx = fixture();
    let tree = make_tree(&mut fx, 0, 4);
    for i in [10, 20, 30, 40] {
        put(&mut fx, &tree, &key(i), b"v");
    }
    let fetch_key = |iter: &crate::iter::BtrIter, fx: &Fixture| {
        iter.fetch(&fx.heap, crate::intent::DEFAULT).unwrap().0
    };

    let mut iter = tree.iter_prepare();
    assert!(iter.probe(&fx.heap, ProbeOpc::First, Probe::None).unwrap());
    assert_eq!(fetch_key(&iter, &fx), key(10));
    assert!(iter.probe(&fx.heap, ProbeOpc::Last, Probe::None).unwrap());
    assert_eq!(fetch_key(&iter, &fx), key(40));

    // Between records.
    assert!(iter
        .probe(&fx.heap, ProbeOpc::Ge, Probe::Key(&key(25)))
        .unwrap());
    assert_eq!(fetch_key(&iter, &fx), key(30));
    assert!(iter
        .probe(&fx.heap, ProbeOpc::Le, Probe::Key(&key(25)))
        .unwrap());
    assert_eq!(fetch_key(&iter, &fx), key(20));

    // On a record.
    assert!(iter
        .probe(&fx.heap, ProbeOpc::Gt, Probe::Key(&key(20)))
        .unwrap());
    assert_eq!(fetch_key(&iter, &fx), key(30));
    assert!(iter
        .probe(&fx.heap, ProbeOpc::Lt, Probe::Key(&key(20)))
        .unwrap());
    assert_eq!(fetch_key(&iter, &fx), key(10));
    assert!(iter
        .probe(&fx.heap, ProbeOpc::Eq, Probe::Key(&key(20)))
        .unwrap());
    assert_eq!(fetch_key(&iter, &fx), key(20));

    // Outside the bounds.
    assert!(!iter
        .probe(&fx.heap, ProbeOpc::Eq, Probe::Key(&key(25)))
        .unwrap());
    assert!(!iter
        .probe(&fx.heap, ProbeOpc::Gt, Probe::Key(&key(40)))
        .unwrap());
    assert!(!iter
        .probe(&fx.heap, ProbeOpc::Lt, Probe::Key(&key(10)))
        .unwrap());
}

#[test]
fn anchor_resumes_iteration_across_cursors() {
    let mut fx = fixture();
    let tree = make_tree(&mut fx, 0, 16);
    for i in 0..1000 {
        put(&mut fx, &tree, &key(i), b"v");
    }

    // Fetch the first 500 records, recording the anchor of the last one.
    let mut iter = tree.iter_prepare();
    assert!(iter.probe(&fx.heap, ProbeOpc::First, Probe::None).unwrap());
    let mut anchor = None;
    for _ in 0..500 {
        let (_, _, _, a) = iter.fetch(&fx.heap, crate::intent::DEFAULT).unwrap();
        anchor = Some(a);
        iter.next(&fx.heap).unwrap();
    }
    iter.finish();
    let anchor = anchor.expect("fetched 500 records");

    // The anchor survives serialization.
    let json = serde_json::to_string(&anchor).unwrap();
    let anchor: crate::iter::Anchor = serde_json::from_str(&json).unwrap();

    // A fresh cursor probed past the anchor lands on record 501.
    let mut iter = tree.iter_prepare();
    assert!(iter
        .probe(&fx.heap, ProbeOpc::Gt, Probe::Anchor(&anchor))
        .unwrap());
    let (k, _, _, _) = iter.fetch(&fx.heap, crate::intent::DEFAULT).unwrap();
    assert_eq!(k, key(500), "zero-based record 500 is the 501st key");
}

#[test]
fn anchor_round_trips_to_its_own_key() {
    let mut fx = fixture();
    let tree = make_tree(&mut fx, 0, 8);
    for i in 0..50 {
        put(&mut fx, &tree, &key(i), b"v");
    }
    let anchor = tree.key_to_anchor(&key(17)).unwrap();
    let mut iter = tree.iter_prepare();
    assert!(iter
        .probe(&fx.heap, ProbeOpc::Ge, Probe::Anchor(&anchor))
        .unwrap());
    let (k, _, _, _) = iter.fetch(&fx.heap, crate::intent::DEFAULT).unwrap();
    assert_eq!(k, key(17));
}

#[test]
fn uint_keys_iterate_numerically() {
    let mut fx = fixture();
    let root_off = alloc_root(&mut fx.heap);
    fx.heap.tx_begin().unwrap();
    let tree = Btree::create(
        &mut fx.heap,
        &fx.registry,
        root_off,
        UINT_CLASS,
        feats::UINT_KEY,
        5,
    )
    .unwrap();
    fx.heap.tx_commit().unwrap();

    for k in [900u64, 5, 1 << 40, 77, 0] {
        put(&mut fx, &tree, &k.to_le_bytes(), b"v");
    }
    let mut iter = tree.iter_prepare();
    assert!(iter.probe(&fx.heap, ProbeOpc::First, Probe::None).unwrap());
    let mut got = Vec::new();
    loop {
        let (k, _, _, _) = iter.fetch(&fx.heap, crate::intent::DEFAULT).unwrap();
        got.push(u64::from_le_bytes(k.try_into().expect("8-byte key")));
        if !iter.next(&fx.heap).unwrap() {
            break;
        }
    }
    assert_eq!(got, vec![0, 5, 77, 900, 1 << 40]);
}

#[test]
fn delete_via_cursor() {
    let mut fx = fixture();
    let tree = make_tree(&mut fx, 0, 4);
    for i in 0..10 {
        put(&mut fx, &tree, &key(i), b"v");
    }
    let mut iter = tree.iter_prepare();
    assert!(iter
        .probe(&fx.heap, ProbeOpc::Eq, Probe::Key(&key(4)))
        .unwrap());
    fx.heap.tx_begin().unwrap();
    iter.delete_current(&mut fx.heap).unwrap();
    fx.heap.tx_commit().unwrap();
    assert_eq!(collect_sorted(&fx, &tree).len(), 9);
    assert!(matches!(
        tree.lookup(&fx.heap, &key(4)),
        Err(StoreError::NotFound)
    ));
}

#[test]
fn drain_consumes_credits_and_empties() {
    let mut fx = fixture();
    let tree = make_tree(&mut fx, 0, 4);
    for i in 0..30 {
        put(&mut fx, &tree, &key(i), b"v");
    }

    fx.heap.tx_begin().unwrap();
    let mut credits = 10;
    let empty = tree.drain(&mut fx.heap, &mut credits).unwrap();
    fx.heap.tx_commit().unwrap();
    assert!(!empty);
    assert_eq!(credits, 0);
    assert_eq!(collect_sorted(&fx, &tree).len(), 20);

    fx.heap.tx_begin().unwrap();
    let mut credits = 100;
    let empty = tree.drain(&mut fx.heap, &mut credits).unwrap();
    fx.heap.tx_commit().unwrap();
    assert!(empty);
    assert_eq!(credits, 80, "20 remaining records each cost one credit");
    assert!(tree.is_empty(&fx.heap).unwrap());
    fx.heap.check_integrity().unwrap();
}

#[test]
fn destroy_releases_heap_space() {
    let mut fx = fixture();
    let tree = make_tree(&mut fx, 0, 8);
    let before = fx.heap.stats().unwrap().free_chunks;
    for i in 0..200 {
        put(&mut fx, &tree, &key(i), &vec![7u8; 100]);
    }
    fx.heap.tx_begin().unwrap();
    tree.destroy(&mut fx.heap).unwrap();
    fx.heap.tx_commit().unwrap();
    assert!(tree.is_empty(&fx.heap).unwrap());
    let after = fx.heap.stats().unwrap().free_chunks;
    assert_eq!(before, after, "destroy returns every chunk");
}

#[test]
fn tree_contents_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pool");
    let registry = ClassRegistry::new();
    registry.register(kv_class()).unwrap();

    let root_off = {
        let mut heap = Heap::create(
            &path,
            Uuid::new_v4(),
            64 * 1024 * 1024,
            HeapConfig::default(),
        )
        .unwrap();
        heap.tx_begin().unwrap();
        let root_off = heap.tx_alloc_auto(BTR_ROOT_SIZE as u64, 0).unwrap();
        let tree =
            Btree::create(&mut heap, &registry, root_off, KV_CLASS, 0, 8).unwrap();
        for i in 0..100 {
            tree.upsert(&mut heap, &key(i), format!("v{i}").as_bytes())
                .unwrap();
        }
        heap.tx_commit().unwrap();
        root_off
    };

    let heap = Heap::open(&path, HeapConfig::default()).unwrap();
    let tree = Btree::open(&heap, &registry, root_off).unwrap();
    for i in (0..100).step_by(13) {
        let (_, val, _) = tree.lookup(&heap, &key(i)).unwrap();
        assert_eq!(val, format!("v{i}").into_bytes());
    }
}
