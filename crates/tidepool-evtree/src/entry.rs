//! Extent entry codec.
//!
//! On-heap record body: a 48-byte descriptor followed by the inline payload
//! bytes. `csum` protects the payload; `bio_addr` is the payload offset
//! from the record start (fixed today, kept explicit for the layout).

use tidepool_error::{Result, StoreError};
use tidepool_types::{Epoch, Extent, Stamp};

/// Serialized descriptor size.
pub const EVT_ENTRY_SIZE: usize = 48;

/// One versioned extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvtEntry {
    pub ext: Extent,
    pub stamp: Stamp,
    /// Writer pool-map version.
    pub version: u32,
    /// CRC32 of the payload bytes.
    pub csum: u32,
    /// Payload offset from the record start.
    pub bio_addr: u64,
}

impl EvtEntry {
    #[must_use]
    pub fn encode(&self) -> [u8; EVT_ENTRY_SIZE] {
        let mut buf = [0u8; EVT_ENTRY_SIZE];
        buf[0..8].copy_from_slice(&self.ext.lo.to_le_bytes());
        buf[8..16].copy_from_slice(&self.ext.hi.to_le_bytes());
        buf[16..24].copy_from_slice(&self.stamp.epoch.raw().to_le_bytes());
        buf[24..26].copy_from_slice(&self.stamp.minor.to_le_bytes());
        buf[28..32].copy_from_slice(&self.version.to_le_bytes());
        buf[32..36].copy_from_slice(&self.csum.to_le_bytes());
        buf[40..48].copy_from_slice(&self.bio_addr.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<EvtEntry> {
        if buf.len() < EVT_ENTRY_SIZE {
            return Err(StoreError::Truncated {
                expected: EVT_ENTRY_SIZE,
                actual: buf.len(),
            });
        }
        Ok(EvtEntry {
            ext: Extent {
                lo: u64::from_le_bytes(buf[0..8].try_into().expect("8-byte slice")),
                hi: u64::from_le_bytes(buf[8..16].try_into().expect("8-byte slice")),
            },
            stamp: Stamp {
                epoch: Epoch::new(u64::from_le_bytes(
                    buf[16..24].try_into().expect("8-byte slice"),
                )),
                minor: u16::from_le_bytes(buf[24..26].try_into().expect("2-byte slice")),
            },
            version: u32::from_le_bytes(buf[28..32].try_into().expect("4-byte slice")),
            csum: u32::from_le_bytes(buf[32..36].try_into().expect("4-byte slice")),
            bio_addr: u64::from_le_bytes(buf[40..48].try_into().expect("8-byte slice")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trip() {
        let entry = EvtEntry {
            ext: Extent::new(100, 299),
            stamp: Stamp::new(Epoch::new(0xdead), 3),
            version: 7,
            csum: 0x1234_5678,
            bio_addr: EVT_ENTRY_SIZE as u64,
        };
        assert_eq!(EvtEntry::decode(&entry.encode()).unwrap(), entry);
    }

    #[test]
    fn short_buffer_is_truncated() {
        assert!(matches!(
            EvtEntry::decode(&[0u8; 20]),
            Err(StoreError::Truncated { .. })
        ));
    }
}
