//! Tree cursors and serializable anchors.
//!
//! A cursor is a stack of `(node, slot)` positions. An [`Anchor`] captures
//! the fixed-width key field of the record under the cursor; because the
//! field is self-contained (inline key, hash, or class-encoded direct key),
//! an anchor survives process restarts and node splits, and re-probing it
//! lands on the same logical position.

use serde::{Deserialize, Serialize};
use tidepool_error::{Result, StoreError};
use tidepool_heap::Heap;
use tidepool_types::RawOff;

use crate::feats;
use crate::node::{NodeBuf, HKEY_MAX};
use crate::tree::{Btree, ProbeOpc};

/// Serializable cursor position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    /// The record's fixed-width key field.
    pub hkey: Vec<u8>,
}

impl Anchor {
    fn to_hkey(&self) -> Result<[u8; HKEY_MAX]> {
        if self.hkey.len() != HKEY_MAX {
            return Err(StoreError::invalid(format!(
                "anchor key field must be {HKEY_MAX} bytes, got {}",
                self.hkey.len()
            )));
        }
        let mut out = [0u8; HKEY_MAX];
        out.copy_from_slice(&self.hkey);
        Ok(out)
    }
}

/// Probe target: a caller key or a previously recorded anchor.
#[derive(Debug, Clone, Copy)]
pub enum Probe<'a> {
    Key(&'a [u8]),
    Anchor(&'a Anchor),
    /// Positionless probe, for `First`/`Last`.
    None,
}

/// A cursor over one tree.
pub struct BtrIter {
    tree: Btree,
    /// `(node_off, slot)` from the root node down to the leaf.
    stack: Vec<(RawOff, usize)>,
    on_embedded: bool,
    valid: bool,
}

impl Btree {
    /// Open a cursor. Probe it before fetching.
    #[must_use]
    pub fn iter_prepare(&self) -> BtrIter {
        BtrIter {
            tree: *self,
            stack: Vec::new(),
            on_embedded: false,
            valid: false,
        }
    }
}

impl BtrIter {
    /// Position the cursor. Returns `true` when it lands on a record.
    pub fn probe(&mut self, heap: &Heap, opc: ProbeOpc, probe: Probe<'_>) -> Result<bool> {
        match opc {
            ProbeOpc::Bypass => return Ok(self.valid),
            ProbeOpc::First => return self.descend_edge(heap, true),
            ProbeOpc::Last => return self.descend_edge(heap, false),
            _ => {}
        }

        let (hkey, key) = match probe {
            Probe::Key(key) => (self.tree.hkey_of(key)?, Some(key)),
            Probe::Anchor(anchor) => (anchor.to_hkey()?, None),
            Probe::None => {
                return Err(StoreError::invalid("keyed probe without a key or anchor"))
            }
        };

        let root = self.tree.root(heap)?;
        self.stack.clear();
        self.on_embedded = false;
        self.valid = false;

        if root.depth == 0 {
            if root.feats & feats::EMBEDDED == 0 {
                return Ok(false);
            }
            let ord = match key {
                Some(key) => self.tree.cmp_leaf_rec(heap, &root.embedded, key, &hkey)?,
                None => self.tree.cmp_hkeys(&root.embedded.hkey, &hkey),
            };
            let hit = match opc {
                ProbeOpc::Eq => ord == std::cmp::Ordering::Equal,
                ProbeOpc::Ge => ord != std::cmp::Ordering::Less,
                ProbeOpc::Gt => ord == std::cmp::Ordering::Greater,
                ProbeOpc::Le => ord != std::cmp::Ordering::Greater,
                ProbeOpc::Lt => ord == std::cmp::Ordering::Less,
                _ => unreachable!("positional opcodes handled above"),
            };
            self.on_embedded = hit;
            self.valid = hit;
            return Ok(hit);
        }

        // Walk internals recording the path, then place the leaf slot.
        let mut off = root.node_off;
        let mut node = NodeBuf::read(heap, off, self.order())?;
        while !node.leaf {
            let idx = self.tree.child_index(&node, &hkey);
            self.stack.push((off, idx));
            off = node.recs[idx].off;
            node = NodeBuf::read(heap, off, self.order())?;
        }

        let (pos, found) = match key {
            Some(key) => self.tree.leaf_search(heap, &node, key, &hkey)?,
            None => {
                let mut pos = node.recs.len();
                let mut found = false;
                for (i, rec) in node.recs.iter().enumerate() {
                    match self.tree.cmp_hkeys(&rec.hkey, &hkey) {
                        std::cmp::Ordering::Less => {}
                        std::cmp::Ordering::Equal => {
                            pos = i;
                            found = true;
                            break;
                        }
                        std::cmp::Ordering::Greater => {
                            pos = i;
                            break;
                        }
                    }
                }
                (pos, found)
            }
        };

        let count = node.recs.len();
        match opc {
            ProbeOpc::Eq => {
                if !found {
                    return Ok(false);
                }
                self.stack.push((off, pos));
                self.valid = true;
                Ok(true)
            }
            ProbeOpc::Ge | ProbeOpc::Gt => {
                let target = if found && opc == ProbeOpc::Gt {
                    pos + 1
                } else {
                    pos
                };
                if target < count {
                    self.stack.push((off, target));
                    self.valid = true;
                    return Ok(true);
                }
                // Past this leaf: step to the successor.
                self.stack.push((off, count.saturating_sub(1)));
                self.valid = true;
                self.next(heap)
            }
            ProbeOpc::Le | ProbeOpc::Lt => {
                let target = if found && opc == ProbeOpc::Le {
                    Some(pos)
                } else if pos > 0 {
                    Some(pos - 1)
                } else {
                    None
                };
                match target {
                    Some(slot) => {
                        self.stack.push((off, slot));
                        self.valid = true;
                        Ok(true)
                    }
                    None => {
                        // Before this leaf: step to the predecessor.
                        self.stack.push((off, 0));
                        self.valid = true;
                        self.prev(heap)
                    }
                }
            }
            _ => unreachable!("positional opcodes handled above"),
        }
    }

    fn order(&self) -> u8 {
        self.tree.order
    }

    fn descend_edge(&mut self, heap: &Heap, leftmost: bool) -> Result<bool> {
        let root = self.tree.root(heap)?;
        self.stack.clear();
        self.on_embedded = false;
        if root.feats & feats::EMBEDDED != 0 {
            self.on_embedded = true;
            self.valid = true;
            return Ok(true);
        }
        if root.depth == 0 {
            self.valid = false;
            return Ok(false);
        }
        let mut off = root.node_off;
        loop {
            let node = NodeBuf::read(heap, off, self.order())?;
            let idx = if leftmost { 0 } else { node.recs.len() - 1 };
            self.stack.push((off, idx));
            if node.leaf {
                break;
            }
            off = node.recs[idx].off;
        }
        self.valid = true;
        Ok(true)
    }

    /// Advance to the successor. Returns `false` when exhausted.
    pub fn next(&mut self, heap: &Heap) -> Result<bool> {
        if !self.valid {
            return Ok(false);
        }
        if self.on_embedded {
            self.valid = false;
            return Ok(false);
        }
        // Try the next slot in the leaf.
        let (leaf_off, slot) = *self.stack.last().expect("valid cursor has a leaf");
        let leaf = NodeBuf::read(heap, leaf_off, self.order())?;
        if slot + 1 < leaf.recs.len() {
            self.stack.last_mut().expect("leaf frame").1 = slot + 1;
            return Ok(true);
        }
        // Climb until a parent has a right sibling, then descend leftmost.
        self.stack.pop();
        while let Some((off, idx)) = self.stack.pop() {
            let node = NodeBuf::read(heap, off, self.order())?;
            if idx + 1 < node.recs.len() {
                self.stack.push((off, idx + 1));
                let mut child = node.recs[idx + 1].off;
                loop {
                    let n = NodeBuf::read(heap, child, self.order())?;
                    self.stack.push((child, 0));
                    if n.leaf {
                        return Ok(true);
                    }
                    child = n.recs[0].off;
                }
            }
        }
        self.valid = false;
        Ok(false)
    }

    /// Step to the predecessor. Returns `false` when exhausted.
    pub fn prev(&mut self, heap: &Heap) -> Result<bool> {
        if !self.valid {
            return Ok(false);
        }
        if self.on_embedded {
            self.valid = false;
            return Ok(false);
        }
        let (_, slot) = *self.stack.last().expect("valid cursor has a leaf");
        if slot > 0 {
            self.stack.last_mut().expect("leaf frame").1 = slot - 1;
            return Ok(true);
        }
        self.stack.pop();
        while let Some((off, idx)) = self.stack.pop() {
            if idx > 0 {
                let node = NodeBuf::read(heap, off, self.order())?;
                self.stack.push((off, idx - 1));
                let mut child = node.recs[idx - 1].off;
                loop {
                    let n = NodeBuf::read(heap, child, self.order())?;
                    self.stack.push((child, n.recs.len() - 1));
                    if n.leaf {
                        return Ok(true);
                    }
                    child = n.recs[n.recs.len() - 1].off;
                }
            }
        }
        self.valid = false;
        Ok(false)
    }

    /// Read the record under the cursor: `(key, value, record offset,
    /// anchor)`. A record hidden from `intent` by the class availability
    /// check reports `NotFound`; step the cursor and retry.
    pub fn fetch(
        &self,
        heap: &Heap,
        intent: u32,
    ) -> Result<(Vec<u8>, Vec<u8>, RawOff, Anchor)> {
        if !self.valid {
            return Err(StoreError::NoHandle);
        }
        let rec = if self.on_embedded {
            self.tree.root(heap)?.embedded
        } else {
            let (leaf_off, slot) = *self.stack.last().expect("valid cursor has a leaf");
            let leaf = NodeBuf::read(heap, leaf_off, self.order())?;
            leaf.recs[slot]
        };
        if let Some(check) = self.tree.class.check_availability {
            if !check(heap, rec.off, intent)? {
                return Err(StoreError::NotFound);
            }
        }
        let (key, val) = (self.tree.class.rec_fetch)(heap, rec.off)?;
        Ok((
            key,
            val,
            rec.off,
            Anchor {
                hkey: rec.hkey.to_vec(),
            },
        ))
    }

    /// Delete the record under the cursor. The cursor is invalidated.
    pub fn delete_current(&mut self, heap: &mut Heap) -> Result<()> {
        let (key, _, _, _) = self.fetch(heap, crate::intent::PURGE)?;
        self.valid = false;
        self.stack.clear();
        self.on_embedded = false;
        self.tree.delete(heap, &key)
    }

    /// Close the cursor.
    pub fn finish(self) {}
}
