//! Pool and container lifecycle.

use std::collections::VecDeque;
use std::path::Path;

use tidepool_btree::{feats, Btree, ClassRegistry};
use tidepool_dtx::{DtxCache, DTX_TABLE_ROOT_SIZE};
use tidepool_error::{Result, StoreError};
use tidepool_heap::{Heap, HeapConfig};
use tidepool_types::{ContId, Epoch, PoolId, RawOff};
use tracing::debug;

use crate::classes::{register_classes, CONT_CLASS};
use crate::gc::{bin_init, GcStats};
use crate::layout::{
    cont_bin_off, pool_bin_off, CONT_DF_SIZE, CONT_DTX_TABLE, CONT_NEWEST_AGG, CONT_OBJ_ROOT,
    POOL_CONT_NR, POOL_CONT_ROOT,
};
use crate::object::ObjCache;

const CONT_TREE_ORDER: u8 = 16;
const OBJ_TREE_ORDER: u8 = 16;
const DTX_CACHE_CAP: u32 = 1024;
const OBJ_CACHE_CAP: u32 = 128;

/// One open pool: the heap, the class registry, the volatile object cache
/// and the garbage collector's runtime state.
pub struct Pool {
    pub(crate) heap: Heap,
    pub(crate) registry: ClassRegistry,
    pub(crate) obj_cache: ObjCache,
    /// Containers with queued reclamation work, drained round-robin.
    pub(crate) gc_pending: VecDeque<RawOff>,
    pub(crate) gc_stats: GcStats,
}

/// An open container: its record offset and its transaction cache.
pub struct ContHandle {
    pub id: ContId,
    pub(crate) cont_off: RawOff,
    pub dtx: DtxCache,
}

fn runtime_registry() -> Result<ClassRegistry> {
    let registry = ClassRegistry::new();
    register_classes(&registry)?;
    Ok(registry)
}

impl Pool {
    /// Create a pool file and initialize the object-layer roots.
    pub fn create(path: &Path, pool_id: PoolId, size: u64) -> Result<Pool> {
        let mut heap = Heap::create(path, pool_id, size, HeapConfig::default())?;
        let registry = runtime_registry()?;

        heap.tx_begin()?;
        let outcome: Result<()> = (|| {
            Btree::create(
                &mut heap,
                &registry,
                RawOff::new(POOL_CONT_ROOT),
                CONT_CLASS,
                0,
                CONT_TREE_ORDER,
            )?;
            for tier in 0..4 {
                bin_init(&mut heap, pool_bin_off(tier))?;
            }
            heap.tx_write_u64(RawOff::new(POOL_CONT_NR), 0)?;
            Ok(())
        })();
        match outcome {
            Ok(()) => heap.tx_commit()?,
            Err(err) => {
                heap.tx_abort()?;
                return Err(err);
            }
        }
        debug!(%pool_id, size, "created pool");
        Ok(Pool {
            heap,
            registry,
            obj_cache: ObjCache::new(OBJ_CACHE_CAP)?,
            gc_pending: VecDeque::new(),
            gc_stats: GcStats::default(),
        })
    }

    /// Open an existing pool, replaying the redo log if needed.
    pub fn open(path: &Path) -> Result<Pool> {
        let heap = Heap::open(path, HeapConfig::default())?;
        let registry = runtime_registry()?;
        Ok(Pool {
            heap,
            registry,
            obj_cache: ObjCache::new(OBJ_CACHE_CAP)?,
            gc_pending: VecDeque::new(),
            gc_stats: GcStats::default(),
        })
    }

    /// Flush and drop the volatile state.
    pub fn close(mut self) -> Result<()> {
        self.heap.flush()
    }

    /// Remove the pool file and its redo log.
    pub fn destroy(path: &Path) -> Result<()> {
        Heap::destroy(path)
    }

    #[must_use]
    pub fn pool_id(&self) -> PoolId {
        self.heap.pool_id()
    }

    #[must_use]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    #[must_use]
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub(crate) fn cont_tree(&self) -> Result<Btree> {
        Btree::open(&self.heap, &self.registry, RawOff::new(POOL_CONT_ROOT))
    }

    /// Number of containers in the pool.
    pub fn cont_count(&self) -> Result<u64> {
        self.heap.read_u64(RawOff::new(POOL_CONT_NR))
    }

    /// Create a container.
    pub fn create_container(&mut self, id: ContId) -> Result<()> {
        let tree = self.cont_tree()?;
        if tree.lookup(&self.heap, id.as_bytes()).is_ok() {
            return Err(StoreError::Exists);
        }

        self.heap.tx_begin()?;
        let outcome: Result<()> = (|| {
            let mut body = vec![0u8; CONT_DF_SIZE];
            body[0..16].copy_from_slice(id.as_bytes());
            tree.insert(&mut self.heap, id.as_bytes(), &body)?;
            let (_, _, cont_off) = tree.lookup(&self.heap, id.as_bytes())?;

            Btree::create(
                &mut self.heap,
                &self.registry,
                cont_off.at(CONT_OBJ_ROOT),
                crate::classes::OBJ_CLASS,
                feats::EMBED_FIRST,
                OBJ_TREE_ORDER,
            )?;
            debug_assert_eq!(DTX_TABLE_ROOT_SIZE, 32);
            self.heap
                .tx_write(cont_off.at(CONT_DTX_TABLE), &[0u8; DTX_TABLE_ROOT_SIZE])?;
            for tier in 0..3 {
                bin_init(&mut self.heap, cont_bin_off(cont_off, tier))?;
            }

            let nr = self.heap.read_u64(RawOff::new(POOL_CONT_NR))?;
            self.heap.tx_write_u64(RawOff::new(POOL_CONT_NR), nr + 1)?;
            Ok(())
        })();
        match outcome {
            Ok(()) => self.heap.tx_commit()?,
            Err(err) => {
                self.heap.tx_abort()?;
                return Err(err);
            }
        }
        debug!(%id, "created container");
        Ok(())
    }

    /// Open a container, reloading any surviving prepared transactions and
    /// the aggregation watermark.
    pub fn open_container(&mut self, id: ContId) -> Result<ContHandle> {
        let tree = self.cont_tree()?;
        let (_, _, cont_off) = tree
            .lookup(&self.heap, id.as_bytes())
            .map_err(|_| StoreError::NotFound)?;
        let mut dtx = DtxCache::new(DTX_CACHE_CAP, cont_off.at(CONT_DTX_TABLE))?;
        let restored = dtx.reload(&self.heap)?;
        if restored > 0 {
            debug!(%id, restored, "reloaded prepared transactions");
        }
        dtx.note_aggregated(Epoch::new(
            self.heap.read_u64(cont_off.at(CONT_NEWEST_AGG))?,
        ));
        Ok(ContHandle { id, cont_off, dtx })
    }

    /// Unlink a container and queue its record for reclamation. Open
    /// handles to it become invalid.
    pub fn destroy_container(&mut self, id: ContId) -> Result<()> {
        let tree = self.cont_tree()?;
        self.heap.tx_begin()?;
        let outcome: Result<()> = (|| {
            let cont_off = tree.delete_retain(&mut self.heap, id.as_bytes())?;
            crate::gc::bin_add_item(
                &mut self.heap,
                pool_bin_off(crate::gc::GcTier::Cont as usize),
                cont_off,
                0,
            )?;
            let nr = self.heap.read_u64(RawOff::new(POOL_CONT_NR))?;
            self.heap
                .tx_write_u64(RawOff::new(POOL_CONT_NR), nr.saturating_sub(1))?;
            Ok(())
        })();
        match outcome {
            Ok(()) => self.heap.tx_commit()?,
            Err(err) => {
                self.heap.tx_abort()?;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Cumulative GC statistics.
    #[must_use]
    pub fn gc_stats(&self) -> GcStats {
        self.gc_stats
    }
}
