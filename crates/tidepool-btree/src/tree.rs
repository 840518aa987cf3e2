//! Tree operations: create/open, probe, upsert, delete, rebalance, drain.

use std::cmp::Ordering;

use tidepool_error::{Result, StoreError};
use tidepool_heap::Heap;
use tidepool_types::RawOff;
use tracing::trace;

use crate::class::{hkey_for_key, BtrClass, ClassRegistry};
use crate::feats;
use crate::node::{node_size, NodeBuf, Rec, Root, HKEY_MAX};

/// Probe operation codes.
///
/// `Bypass` re-uses a previously computed cursor position without a fresh
/// probe; handing it a stale cursor can corrupt the tree, exactly like
/// trusting a stale path anywhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOpc {
    First,
    Last,
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
    Bypass,
}

/// Minimum tree order.
pub const ORDER_MIN: u8 = 3;
/// Maximum tree order.
pub const ORDER_MAX: u8 = 63;

/// A B+tree handle. All persistent state lives behind `root_off` in the
/// heap; the handle itself is a cheap copy of the class table and creation
/// attributes.
#[derive(Clone, Copy)]
pub struct Btree {
    pub(crate) root_off: RawOff,
    pub(crate) class: BtrClass,
    pub(crate) feats: u16,
    pub(crate) order: u8,
}

impl Btree {
    /// Initialize an empty tree at `root_off` (inside an active heap
    /// transaction) and return its handle.
    pub fn create(
        heap: &mut Heap,
        registry: &ClassRegistry,
        root_off: RawOff,
        class_id: u16,
        tree_feats: u16,
        order: u8,
    ) -> Result<Btree> {
        if !(ORDER_MIN..=ORDER_MAX).contains(&order) {
            return Err(StoreError::invalid(format!(
                "tree order {order} outside {ORDER_MIN}..={ORDER_MAX}"
            )));
        }
        let class = registry.get(class_id)?;
        if tree_feats & feats::DIRECT_KEY != 0
            && (class.hkey_gen.is_none() || class.hkey_cmp.is_none() || class.key_decode.is_none())
        {
            return Err(StoreError::invalid(
                "direct-key class must define hkey_gen, hkey_cmp and key_decode",
            ));
        }
        if tree_feats & feats::EMBEDDED != 0 {
            return Err(StoreError::invalid("the embedded bit is tree-managed"));
        }
        let root = Root {
            class: class_id,
            feats: tree_feats,
            order,
            depth: 0,
            node_off: RawOff::NULL,
            embedded: Rec::new(RawOff::NULL, [0u8; HKEY_MAX]),
        };
        root.write(heap, root_off)?;
        Ok(Btree {
            root_off,
            class,
            feats: tree_feats,
            order,
        })
    }

    /// Open the tree rooted at `root_off`.
    pub fn open(heap: &Heap, registry: &ClassRegistry, root_off: RawOff) -> Result<Btree> {
        let root = Root::read(heap, root_off)?;
        if root.order == 0 {
            return Err(StoreError::corrupt("tree root was never initialized"));
        }
        let class = registry.get(root.class)?;
        Ok(Btree {
            root_off,
            class,
            feats: root.feats & !feats::EMBEDDED,
            order: root.order,
        })
    }

    #[must_use]
    pub fn root_off(&self) -> RawOff {
        self.root_off
    }

    pub(crate) fn root(&self, heap: &Heap) -> Result<Root> {
        Root::read(heap, self.root_off)
    }

    /// `true` when no record is reachable.
    pub fn is_empty(&self, heap: &Heap) -> Result<bool> {
        let root = self.root(heap)?;
        Ok(root.depth == 0 && root.feats & feats::EMBEDDED == 0)
    }

    // -----------------------------------------------------------------------
    // Key handling
    // -----------------------------------------------------------------------

    pub(crate) fn hkey_of(&self, key: &[u8]) -> Result<[u8; HKEY_MAX]> {
        let mut hkey = [0u8; HKEY_MAX];
        if self.feats & feats::UINT_KEY != 0 {
            if key.len() != 8 {
                return Err(StoreError::invalid("uint-key tree takes 8-byte keys"));
            }
            hkey[0..8].copy_from_slice(key);
        } else if let Some(gen) = self.class.hkey_gen {
            gen(key, &mut hkey);
        } else {
            hkey_for_key(key, &mut hkey);
        }
        Ok(hkey)
    }

    pub(crate) fn cmp_hkeys(&self, a: &[u8; HKEY_MAX], b: &[u8; HKEY_MAX]) -> Ordering {
        if self.feats & feats::UINT_KEY != 0 {
            let ka = u64::from_le_bytes(a[0..8].try_into().expect("8-byte slice"));
            let kb = u64::from_le_bytes(b[0..8].try_into().expect("8-byte slice"));
            return ka.cmp(&kb);
        }
        if let Some(cmp) = self.class.hkey_cmp {
            return cmp(a, b);
        }
        a.cmp(b)
    }

    /// Compare a leaf record against a probe, tie-breaking equal hkeys
    /// through the stored key bytes where the class supports it.
    pub(crate) fn cmp_leaf_rec(
        &self,
        heap: &Heap,
        rec: &Rec,
        key: &[u8],
        hkey: &[u8; HKEY_MAX],
    ) -> Result<Ordering> {
        let ord = self.cmp_hkeys(&rec.hkey, hkey);
        if ord != Ordering::Equal || self.feats & (feats::UINT_KEY | feats::DIRECT_KEY) != 0 {
            return Ok(ord);
        }
        match self.class.key_cmp {
            Some(cmp) => cmp(heap, rec.off, key),
            None => Ok(Ordering::Equal),
        }
    }

    /// Position of the first record `>=` the probe, plus the exact-match
    /// flag.
    pub(crate) fn leaf_search(
        &self,
        heap: &Heap,
        node: &NodeBuf,
        key: &[u8],
        hkey: &[u8; HKEY_MAX],
    ) -> Result<(usize, bool)> {
        for (i, rec) in node.recs.iter().enumerate() {
            match self.cmp_leaf_rec(heap, rec, key, hkey)? {
                Ordering::Less => {}
                Ordering::Equal => return Ok((i, true)),
                Ordering::Greater => return Ok((i, false)),
            }
        }
        Ok((node.recs.len(), false))
    }

    /// Child slot to descend into: the greatest separator `<=` the probe,
    /// defaulting to slot 0.
    pub(crate) fn child_index(&self, node: &NodeBuf, hkey: &[u8; HKEY_MAX]) -> usize {
        let mut idx = 0;
        for (i, rec) in node.recs.iter().enumerate() {
            if self.cmp_hkeys(&rec.hkey, hkey) != Ordering::Greater {
                idx = i;
            } else {
                break;
            }
        }
        idx
    }

    pub(crate) fn descend(
        &self,
        heap: &Heap,
        hkey: &[u8; HKEY_MAX],
    ) -> Result<(Vec<(NodeBuf, usize)>, NodeBuf)> {
        let root = self.root(heap)?;
        debug_assert!(root.depth > 0);
        let mut node = NodeBuf::read(heap, root.node_off, self.order)?;
        let mut path = Vec::with_capacity(usize::from(root.depth));
        while !node.leaf {
            let idx = self.child_index(&node, hkey);
            let child = node.recs[idx].off;
            path.push((node, idx));
            node = NodeBuf::read(heap, child, self.order)?;
        }
        Ok((path, node))
    }

    fn alloc_node(&self, heap: &mut Heap, leaf: bool) -> Result<NodeBuf> {
        let size = node_size(self.order);
        let off = match self.class.node_alloc {
            Some(alloc) => alloc(heap, size)?,
            None => heap.tx_alloc_auto(size as u64, u64::from(self.class.id))?,
        };
        let node = NodeBuf::fresh(off, leaf, self.order);
        node.write(heap)?;
        Ok(node)
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Insert or update.
    pub fn upsert(&self, heap: &mut Heap, key: &[u8], val: &[u8]) -> Result<()> {
        self.put(heap, key, val, true, true)
    }

    /// Insert; an existing key fails with `Exists`.
    pub fn insert(&self, heap: &mut Heap, key: &[u8], val: &[u8]) -> Result<()> {
        self.put(heap, key, val, true, false)
    }

    /// Update in place; a missing key fails with `NotFound`.
    pub fn update(&self, heap: &mut Heap, key: &[u8], val: &[u8]) -> Result<()> {
        self.put(heap, key, val, false, true)
    }

    fn put(
        &self,
        heap: &mut Heap,
        key: &[u8],
        val: &[u8],
        may_insert: bool,
        may_update: bool,
    ) -> Result<()> {
        let hkey = self.hkey_of(key)?;
        let mut root = self.root(heap)?;

        if root.depth == 0 {
            if root.feats & feats::EMBEDDED != 0 {
                let embedded = root.embedded;
                if self.cmp_leaf_rec(heap, &embedded, key, &hkey)? == Ordering::Equal {
                    if !may_update {
                        return Err(StoreError::Exists);
                    }
                    let new_off = self.replace_rec(heap, embedded.off, key, val)?;
                    if new_off != embedded.off {
                        root.embedded.off = new_off;
                        root.write(heap, self.root_off)?;
                    }
                    return Ok(());
                }
                if !may_insert {
                    return Err(StoreError::NotFound);
                }
                // Second key: promote the embedded record into a real leaf.
                let rec_off = (self.class.rec_alloc)(heap, key, val)?;
                let new_rec = Rec::new(rec_off, hkey);
                let mut leaf = self.alloc_node(heap, true)?;
                let first_less =
                    self.cmp_hkeys(&embedded.hkey, &new_rec.hkey) != Ordering::Greater;
                if first_less {
                    leaf.recs = vec![embedded, new_rec];
                } else {
                    leaf.recs = vec![new_rec, embedded];
                }
                leaf.write(heap)?;
                root.embedded = Rec::new(RawOff::NULL, [0u8; HKEY_MAX]);
                root.feats &= !feats::EMBEDDED;
                root.node_off = leaf.off;
                root.depth = 1;
                return root.write(heap, self.root_off);
            }

            if !may_insert {
                return Err(StoreError::NotFound);
            }
            let rec_off = (self.class.rec_alloc)(heap, key, val)?;
            if root.feats & feats::EMBED_FIRST != 0 {
                root.embedded = Rec::new(rec_off, hkey);
                root.feats |= feats::EMBEDDED;
                return root.write(heap, self.root_off);
            }
            let mut leaf = self.alloc_node(heap, true)?;
            leaf.recs.push(Rec::new(rec_off, hkey));
            leaf.write(heap)?;
            root.node_off = leaf.off;
            root.depth = 1;
            return root.write(heap, self.root_off);
        }

        let (path, mut leaf) = self.descend(heap, &hkey)?;
        let (pos, found) = self.leaf_search(heap, &leaf, key, &hkey)?;
        if found {
            if !may_update {
                return Err(StoreError::Exists);
            }
            let old = leaf.recs[pos].off;
            let new_off = self.replace_rec(heap, old, key, val)?;
            if new_off != old {
                leaf.recs[pos].off = new_off;
                leaf.write(heap)?;
            }
            return Ok(());
        }
        if !may_insert {
            return Err(StoreError::NotFound);
        }
        let rec_off = (self.class.rec_alloc)(heap, key, val)?;
        self.insert_at(heap, path, leaf, pos, Rec::new(rec_off, hkey))
    }

    /// Update a record body, in place when the class permits, else
    /// free-and-realloc. Returns the (possibly new) record offset.
    fn replace_rec(
        &self,
        heap: &mut Heap,
        rec_off: RawOff,
        key: &[u8],
        val: &[u8],
    ) -> Result<RawOff> {
        if let Some(update) = self.class.rec_update {
            if update(heap, rec_off, val)? {
                return Ok(rec_off);
            }
        }
        (self.class.rec_free)(heap, rec_off)?;
        (self.class.rec_alloc)(heap, key, val)
    }

    fn insert_at(
        &self,
        heap: &mut Heap,
        mut path: Vec<(NodeBuf, usize)>,
        mut node: NodeBuf,
        pos: usize,
        rec: Rec,
    ) -> Result<()> {
        node.recs.insert(pos, rec);
        if node.recs.len() <= usize::from(self.order) {
            return node.write(heap);
        }

        // Split: left keeps ceil((order+1)/2) records, the median's
        // successor seeds the right node and its first key is promoted.
        let left_n = (usize::from(self.order) + 2) / 2;
        let right_recs = node.recs.split_off(left_n);
        let mut right = self.alloc_node(heap, node.leaf)?;
        right.recs = right_recs;
        right.write(heap)?;
        node.write(heap)?;
        trace!(left = node.count(), right = right.count(), "node split");

        let sep = Rec::new(right.off, right.recs[0].hkey);
        match path.pop() {
            Some((parent, idx)) => self.insert_at(heap, path, parent, idx + 1, sep),
            None => {
                // Root split grows the tree by one level.
                let mut new_root = self.alloc_node(heap, false)?;
                new_root.recs.push(Rec::new(node.off, node.recs[0].hkey));
                new_root.recs.push(sep);
                new_root.write(heap)?;
                let mut root = self.root(heap)?;
                root.node_off = new_root.off;
                root.depth += 1;
                root.write(heap, self.root_off)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Exact-match fetch with availability filtering.
    pub fn lookup_with_intent(
        &self,
        heap: &Heap,
        key: &[u8],
        intent: u32,
    ) -> Result<(Vec<u8>, Vec<u8>, RawOff)> {
        let hkey = self.hkey_of(key)?;
        let root = self.root(heap)?;
        let rec = if root.depth == 0 {
            if root.feats & feats::EMBEDDED == 0 {
                return Err(StoreError::NotFound);
            }
            let embedded = root.embedded;
            if self.cmp_leaf_rec(heap, &embedded, key, &hkey)? != Ordering::Equal {
                return Err(StoreError::NotFound);
            }
            embedded
        } else {
            let (_, leaf) = self.descend(heap, &hkey)?;
            let (pos, found) = self.leaf_search(heap, &leaf, key, &hkey)?;
            if !found {
                return Err(StoreError::NotFound);
            }
            leaf.recs[pos]
        };
        if let Some(check) = self.class.check_availability {
            if !check(heap, rec.off, intent)? {
                return Err(StoreError::NotFound);
            }
        }
        let (key_out, val) = (self.class.rec_fetch)(heap, rec.off)?;
        Ok((key_out, val, rec.off))
    }

    /// Exact-match fetch under the default read intent.
    pub fn lookup(&self, heap: &Heap, key: &[u8]) -> Result<(Vec<u8>, Vec<u8>, RawOff)> {
        self.lookup_with_intent(heap, key, crate::intent::DEFAULT)
    }

    // -----------------------------------------------------------------------
    // Delete
    // -----------------------------------------------------------------------

    /// Remove a key and its record body.
    pub fn delete(&self, heap: &mut Heap, key: &[u8]) -> Result<()> {
        let rec_off = self.unlink(heap, key)?;
        (self.class.rec_free)(heap, rec_off)
    }

    /// Remove a key but keep its record body alive, returning the body
    /// offset. Callers that queue bodies for deferred reclamation use this
    /// instead of [`Btree::delete`].
    pub fn delete_retain(&self, heap: &mut Heap, key: &[u8]) -> Result<RawOff> {
        self.unlink(heap, key)
    }

    fn unlink(&self, heap: &mut Heap, key: &[u8]) -> Result<RawOff> {
        let hkey = self.hkey_of(key)?;
        let mut root = self.root(heap)?;

        if root.depth == 0 {
            if root.feats & feats::EMBEDDED != 0 {
                let embedded = root.embedded;
                if self.cmp_leaf_rec(heap, &embedded, key, &hkey)? == Ordering::Equal {
                    root.embedded = Rec::new(RawOff::NULL, [0u8; HKEY_MAX]);
                    root.feats &= !feats::EMBEDDED;
                    root.write(heap, self.root_off)?;
                    return Ok(embedded.off);
                }
            }
            return Err(StoreError::NotFound);
        }

        let (path, mut leaf) = self.descend(heap, &hkey)?;
        let (pos, found) = self.leaf_search(heap, &leaf, key, &hkey)?;
        if !found {
            return Err(StoreError::NotFound);
        }
        let rec_off = leaf.recs[pos].off;
        leaf.recs.remove(pos);
        self.rebalance(heap, path, leaf)?;
        Ok(rec_off)
    }

    fn rebalance(
        &self,
        heap: &mut Heap,
        mut path: Vec<(NodeBuf, usize)>,
        mut node: NodeBuf,
    ) -> Result<()> {
        let min = usize::from(self.order).div_ceil(2);

        if path.is_empty() {
            // `node` is the root node.
            let mut root = self.root(heap)?;
            if node.recs.is_empty() {
                heap.tx_free(node.off)?;
                root.node_off = RawOff::NULL;
                root.depth = 0;
                return root.write(heap, self.root_off);
            }
            if !node.leaf && node.recs.len() == 1 {
                // Collapse a single-child root.
                let child = node.recs[0].off;
                heap.tx_free(node.off)?;
                root.node_off = child;
                root.depth -= 1;
                return root.write(heap, self.root_off);
            }
            return node.write(heap);
        }

        if node.recs.is_empty() {
            // An empty non-root node is always unlinked.
            let (mut parent, idx) = path.pop().expect("non-root path");
            heap.tx_free(node.off)?;
            parent.recs.remove(idx);
            return self.rebalance(heap, path, parent);
        }

        let skip = node.leaf && self.feats & feats::SKIP_LEAF_REBAL != 0;
        if node.recs.len() >= min || skip {
            return node.write(heap);
        }

        let (mut parent, idx) = path.pop().expect("non-root path");

        // Borrow from the left sibling.
        if idx > 0 {
            let mut left = NodeBuf::read(heap, parent.recs[idx - 1].off, self.order)?;
            if left.recs.len() > min {
                let moved = left.recs.pop().expect("non-empty sibling");
                node.recs.insert(0, moved);
                left.write(heap)?;
                node.write(heap)?;
                parent.recs[idx].hkey = node.recs[0].hkey;
                return parent.write(heap);
            }
        }
        // Borrow from the right sibling.
        if idx + 1 < parent.recs.len() {
            let mut right = NodeBuf::read(heap, parent.recs[idx + 1].off, self.order)?;
            if right.recs.len() > min {
                let moved = right.recs.remove(0);
                node.recs.push(moved);
                right.write(heap)?;
                node.write(heap)?;
                parent.recs[idx + 1].hkey = right.recs[0].hkey;
                return parent.write(heap);
            }
        }

        // Merge with a sibling and shrink the parent.
        if idx > 0 {
            let mut left = NodeBuf::read(heap, parent.recs[idx - 1].off, self.order)?;
            left.recs.extend(node.recs.iter().copied());
            left.write(heap)?;
            heap.tx_free(node.off)?;
            parent.recs.remove(idx);
            self.rebalance(heap, path, parent)
        } else if idx + 1 < parent.recs.len() {
            let right = NodeBuf::read(heap, parent.recs[idx + 1].off, self.order)?;
            node.recs.extend(right.recs.iter().copied());
            node.write(heap)?;
            heap.tx_free(right.off)?;
            parent.recs.remove(idx + 1);
            self.rebalance(heap, path, parent)
        } else {
            // Only child of a one-record parent; nothing to merge with.
            node.write(heap)
        }
    }

    // -----------------------------------------------------------------------
    // Bulk teardown
    // -----------------------------------------------------------------------

    /// Free every record and node, leaving an empty root.
    pub fn destroy(&self, heap: &mut Heap) -> Result<()> {
        let mut root = self.root(heap)?;
        if root.feats & feats::EMBEDDED != 0 {
            (self.class.rec_free)(heap, root.embedded.off)?;
        } else if root.depth > 0 {
            self.free_subtree(heap, root.node_off)?;
        }
        root.embedded = Rec::new(RawOff::NULL, [0u8; HKEY_MAX]);
        root.feats &= !feats::EMBEDDED;
        root.node_off = RawOff::NULL;
        root.depth = 0;
        root.write(heap, self.root_off)
    }

    fn free_subtree(&self, heap: &mut Heap, off: RawOff) -> Result<()> {
        let node = NodeBuf::read(heap, off, self.order)?;
        for rec in &node.recs {
            if node.leaf {
                (self.class.rec_free)(heap, rec.off)?;
            } else {
                self.free_subtree(heap, rec.off)?;
            }
        }
        heap.tx_free(off)
    }

    /// Delete up to `credits` records from the front of the tree, freeing
    /// emptied nodes as it goes. Returns `true` when the tree is empty.
    /// Used by the garbage collector, which never rebalances.
    pub fn drain(&self, heap: &mut Heap, credits: &mut u32) -> Result<bool> {
        let free = self.class.rec_free;
        self.drain_impl(heap, credits, &mut |heap, off| free(heap, off))
    }

    /// As [`Btree::drain`], but record bodies are handed to `sink` instead
    /// of being freed — the path for flattening one tier's records into the
    /// next reclamation tier.
    pub fn drain_retain<F>(&self, heap: &mut Heap, credits: &mut u32, sink: &mut F) -> Result<bool>
    where
        F: FnMut(&mut Heap, RawOff) -> Result<()>,
    {
        self.drain_impl(heap, credits, sink)
    }

    fn drain_impl(
        &self,
        heap: &mut Heap,
        credits: &mut u32,
        sink: &mut dyn FnMut(&mut Heap, RawOff) -> Result<()>,
    ) -> Result<bool> {
        loop {
            if *credits == 0 {
                return self.is_empty(heap);
            }
            let mut root = self.root(heap)?;
            if root.feats & feats::EMBEDDED != 0 {
                sink(heap, root.embedded.off)?;
                root.embedded = Rec::new(RawOff::NULL, [0u8; HKEY_MAX]);
                root.feats &= !feats::EMBEDDED;
                root.write(heap, self.root_off)?;
                *credits -= 1;
                continue;
            }
            if root.depth == 0 {
                return Ok(true);
            }

            // Walk the leftmost spine.
            let mut path = Vec::new();
            let mut node = NodeBuf::read(heap, root.node_off, self.order)?;
            while !node.leaf {
                let child = node.recs[0].off;
                path.push(node);
                node = NodeBuf::read(heap, child, self.order)?;
            }
            sink(heap, node.recs[0].off)?;
            node.recs.remove(0);
            *credits -= 1;

            if !node.recs.is_empty() {
                node.write(heap)?;
                continue;
            }
            // Unlink emptied nodes up the spine.
            heap.tx_free(node.off)?;
            let mut emptied = true;
            while let Some(mut parent) = path.pop() {
                if !emptied {
                    break;
                }
                parent.recs.remove(0);
                if parent.recs.is_empty() {
                    heap.tx_free(parent.off)?;
                } else {
                    parent.write(heap)?;
                    emptied = false;
                }
            }
            if emptied {
                root.node_off = RawOff::NULL;
                root.depth = 0;
                root.write(heap, self.root_off)?;
            }
        }
    }

    /// Build a serializable cursor anchor for `key`.
    pub fn key_to_anchor(&self, key: &[u8]) -> Result<crate::iter::Anchor> {
        let hkey = self.hkey_of(key)?;
        Ok(crate::iter::Anchor {
            hkey: hkey.to_vec(),
        })
    }
}
