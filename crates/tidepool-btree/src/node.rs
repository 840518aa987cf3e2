//! Node and root codecs.
//!
//! Root (48 bytes, embedded in the owning structure):
//! `class u16 | feats u16 | order u8 | depth u8 | pad u16 | node_off u64 |
//!  embedded Rec (32 B)`.
//!
//! Node: `leaf u8 | pad u8 | count u16 | pad u32 | Rec × order`.
//! A record is `off u64 | hkey [24]`; in internal nodes `off` is the child
//! node and `hkey` the subtree separator, in leaves `off` is the record
//! body.

use tidepool_error::{Result, StoreError};
use tidepool_heap::Heap;
use tidepool_types::RawOff;

/// Fixed hashed/encoded key width inside a record slot.
pub const HKEY_MAX: usize = 24;

/// Longest key stored inline (length-prefixed) in the hashed-key format.
pub const KH_INLINE_MAX: usize = 15;

/// Serialized record slot size.
pub const REC_SIZE: usize = 8 + HKEY_MAX;

/// Serialized root size.
pub const BTR_ROOT_SIZE: usize = 16 + REC_SIZE;

const NODE_HDR_SIZE: usize = 8;

/// One record slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rec {
    pub off: RawOff,
    pub hkey: [u8; HKEY_MAX],
}

impl Rec {
    #[must_use]
    pub fn new(off: RawOff, hkey: [u8; HKEY_MAX]) -> Self {
        Rec { off, hkey }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; REC_SIZE] {
        let mut buf = [0u8; REC_SIZE];
        buf[0..8].copy_from_slice(&self.off.get().to_le_bytes());
        buf[8..].copy_from_slice(&self.hkey);
        buf
    }

    #[must_use]
    pub fn decode(buf: &[u8]) -> Rec {
        let mut hkey = [0u8; HKEY_MAX];
        hkey.copy_from_slice(&buf[8..REC_SIZE]);
        Rec {
            off: RawOff::new(u64::from_le_bytes(
                buf[0..8].try_into().expect("8-byte slice"),
            )),
            hkey,
        }
    }
}

/// Decoded root.
#[derive(Debug, Clone, Copy)]
pub struct Root {
    pub class: u16,
    pub feats: u16,
    pub order: u8,
    pub depth: u8,
    pub node_off: RawOff,
    pub embedded: Rec,
}

impl Root {
    pub fn read(heap: &Heap, off: RawOff) -> Result<Root> {
        let buf = heap.bytes(off, BTR_ROOT_SIZE)?;
        Ok(Root {
            class: u16::from_le_bytes(buf[0..2].try_into().expect("2-byte slice")),
            feats: u16::from_le_bytes(buf[2..4].try_into().expect("2-byte slice")),
            order: buf[4],
            depth: buf[5],
            node_off: RawOff::new(u64::from_le_bytes(
                buf[8..16].try_into().expect("8-byte slice"),
            )),
            embedded: Rec::decode(&buf[16..16 + REC_SIZE]),
        })
    }

    pub fn write(&self, heap: &mut Heap, off: RawOff) -> Result<()> {
        let mut buf = [0u8; BTR_ROOT_SIZE];
        buf[0..2].copy_from_slice(&self.class.to_le_bytes());
        buf[2..4].copy_from_slice(&self.feats.to_le_bytes());
        buf[4] = self.order;
        buf[5] = self.depth;
        buf[8..16].copy_from_slice(&self.node_off.get().to_le_bytes());
        buf[16..16 + REC_SIZE].copy_from_slice(&self.embedded.encode());
        heap.tx_write(off, &buf)
    }
}

/// Size of one node for a given order.
#[must_use]
pub fn node_size(order: u8) -> usize {
    NODE_HDR_SIZE + usize::from(order) * REC_SIZE
}

/// Volatile copy of one node, spliced and written back as a unit.
#[derive(Debug, Clone)]
pub struct NodeBuf {
    pub off: RawOff,
    pub leaf: bool,
    pub recs: Vec<Rec>,
    order: u8,
}

impl NodeBuf {
    /// Read a node from the heap.
    pub fn read(heap: &Heap, off: RawOff, order: u8) -> Result<NodeBuf> {
        let buf = heap.bytes(off, node_size(order))?;
        let leaf = buf[0] != 0;
        let count = u16::from_le_bytes(buf[2..4].try_into().expect("2-byte slice"));
        if usize::from(count) > usize::from(order) {
            return Err(StoreError::corrupt(format!(
                "node {off} record count {count} exceeds order {order}"
            )));
        }
        let mut recs = Vec::with_capacity(usize::from(count));
        for i in 0..usize::from(count) {
            let start = NODE_HDR_SIZE + i * REC_SIZE;
            recs.push(Rec::decode(&buf[start..start + REC_SIZE]));
        }
        Ok(NodeBuf {
            off,
            leaf,
            recs,
            order,
        })
    }

    /// Create an empty volatile node bound to freshly allocated space.
    #[must_use]
    pub fn fresh(off: RawOff, leaf: bool, order: u8) -> NodeBuf {
        NodeBuf {
            off,
            leaf,
            recs: Vec::new(),
            order,
        }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.recs.len()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.recs.len() >= usize::from(self.order)
    }

    /// Write the whole node back.
    pub fn write(&self, heap: &mut Heap) -> Result<()> {
        let mut buf = vec![0u8; node_size(self.order)];
        buf[0] = u8::from(self.leaf);
        buf[2..4].copy_from_slice(&(self.recs.len() as u16).to_le_bytes());
        for (i, rec) in self.recs.iter().enumerate() {
            let start = NODE_HDR_SIZE + i * REC_SIZE;
            buf[start..start + REC_SIZE].copy_from_slice(&rec.encode());
        }
        heap.tx_write(self.off, &buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rec_round_trip() {
        let mut hkey = [0u8; HKEY_MAX];
        hkey[0] = 3;
        hkey[1..4].copy_from_slice(b"abc");
        let rec = Rec::new(RawOff::new(0x1234), hkey);
        assert_eq!(Rec::decode(&rec.encode()), rec);
    }

    #[test]
    fn node_sizes_scale_with_order() {
        assert_eq!(node_size(3), 8 + 3 * 32);
        assert_eq!(node_size(63), 8 + 63 * 32);
    }
}
