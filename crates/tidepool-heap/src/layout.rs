//! On-disk layout constants and header codecs.
//!
//! Byte-exact and host-native little-endian. Chunk headers pack into one
//! 64-bit word: `type(8) | flags(16) | size_idx(32) | reserved(8)`.

use tidepool_error::{Result, StoreError};
use uuid::Uuid;

/// Pool header size, offset 0.
pub const POOL_HDR_SIZE: u64 = 4096;
/// Heap header size, directly after the pool header.
pub const HEAP_HDR_SIZE: u64 = 1024;
/// Offset of the heap header.
pub const HEAP_HDR_OFF: u64 = POOL_HDR_SIZE;
/// Offset of the first zone.
pub const ZONE0_OFF: u64 = POOL_HDR_SIZE + HEAP_HDR_SIZE;

/// Chunk body size.
pub const CHUNK_SIZE: u64 = 256 * 1024;
/// Maximum chunks per zone; chosen so the header block is exactly 512 KiB.
pub const ZONE_MAX_CHUNKS: u32 = 65_528;
/// Zone header size.
pub const ZONE_HDR_SIZE: u64 = 64;
/// Zone header plus the full chunk-header array.
pub const ZONE_META_SIZE: u64 = ZONE_HDR_SIZE + ZONE_MAX_CHUNKS as u64 * 8;

/// Pool header magic.
pub const POOL_MAGIC: u32 = 0x5ca1_ab1e;
/// Heap header magic.
pub const HEAP_MAGIC: u32 = 0x4845_4150;
/// Zone header magic.
pub const ZONE_MAGIC: u32 = 0x5a4f_4e45;
/// Durable format version.
pub const POOL_VERSION: u32 = 1;

/// Offset of the store-owned root area inside the pool header. The heap
/// never interprets these bytes; the object layer keeps its container index
/// root and GC bins here.
pub const POOL_ROOT_OFF: u64 = 256;
/// Size of the store-owned root area.
pub const POOL_ROOT_SIZE: u64 = POOL_HDR_SIZE - POOL_ROOT_OFF;

/// Chunk states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    Free,
    Used,
    Run,
    RunData,
    Footer,
}

impl ChunkType {
    #[must_use]
    pub fn to_raw(self) -> u8 {
        match self {
            ChunkType::Free => 0,
            ChunkType::Used => 1,
            ChunkType::Run => 2,
            ChunkType::RunData => 3,
            ChunkType::Footer => 4,
        }
    }

    pub fn from_raw(raw: u8) -> Result<Self> {
        Ok(match raw {
            0 => ChunkType::Free,
            1 => ChunkType::Used,
            2 => ChunkType::Run,
            3 => ChunkType::RunData,
            4 => ChunkType::Footer,
            other => {
                return Err(StoreError::corrupt(format!(
                    "unknown chunk type {other:#x}"
                )))
            }
        })
    }
}

/// Chunk-header flag bits.
pub mod chunk_flags {
    /// Allocations in this chunk carry 16-byte compact headers.
    pub const COMPACT_HEADER: u16 = 0x1;
    /// Allocations in this chunk carry no header.
    pub const HEADER_NONE: u16 = 0x2;
    /// Run data start is aligned beyond the cacheline default.
    pub const ALIGNED: u16 = 0x4;
    /// Run bitmap is sized to the run instead of the fixed default.
    pub const FLEX_BITMAP: u16 = 0x8;
}

/// Decoded 8-byte chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub kind: ChunkType,
    pub flags: u16,
    pub size_idx: u32,
}

impl ChunkHeader {
    #[must_use]
    pub const fn new(kind: ChunkType, flags: u16, size_idx: u32) -> Self {
        ChunkHeader {
            kind,
            flags,
            size_idx,
        }
    }

    #[must_use]
    pub fn pack(&self) -> u64 {
        u64::from(self.kind.to_raw()) | u64::from(self.flags) << 8 | u64::from(self.size_idx) << 24
    }

    pub fn unpack(word: u64) -> Result<Self> {
        Ok(ChunkHeader {
            kind: ChunkType::from_raw((word & 0xff) as u8)?,
            flags: ((word >> 8) & 0xffff) as u16,
            size_idx: ((word >> 24) & 0xffff_ffff) as u32,
        })
    }
}

/// Decoded zone header.
#[derive(Debug, Clone, Copy)]
pub struct ZoneHeader {
    pub magic: u32,
    /// Number of chunks in this zone.
    pub size_idx: u32,
    pub flags: u64,
}

impl ZoneHeader {
    #[must_use]
    pub fn encode(&self) -> [u8; ZONE_HDR_SIZE as usize] {
        let mut buf = [0u8; ZONE_HDR_SIZE as usize];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.size_idx.to_le_bytes());
        buf[8..16].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < ZONE_HDR_SIZE as usize {
            return Err(StoreError::Truncated {
                expected: ZONE_HDR_SIZE as usize,
                actual: buf.len(),
            });
        }
        let hdr = ZoneHeader {
            magic: u32::from_le_bytes(buf[0..4].try_into().expect("4-byte slice")),
            size_idx: u32::from_le_bytes(buf[4..8].try_into().expect("4-byte slice")),
            flags: u64::from_le_bytes(buf[8..16].try_into().expect("8-byte slice")),
        };
        if hdr.magic != ZONE_MAGIC {
            return Err(StoreError::corrupt(format!(
                "bad zone magic {:#x}",
                hdr.magic
            )));
        }
        if hdr.size_idx == 0 || hdr.size_idx > ZONE_MAX_CHUNKS {
            return Err(StoreError::corrupt(format!(
                "zone chunk count {} out of range",
                hdr.size_idx
            )));
        }
        Ok(hdr)
    }
}

/// Decoded heap header.
#[derive(Debug, Clone, Copy)]
pub struct HeapHeader {
    pub magic: u32,
    pub version: u32,
    pub heap_size: u64,
    pub nzones: u32,
    pub zone_cap: u32,
}

impl HeapHeader {
    #[must_use]
    pub fn encode(&self) -> [u8; 24] {
        let mut buf = [0u8; 24];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.heap_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.nzones.to_le_bytes());
        buf[20..24].copy_from_slice(&self.zone_cap.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 24 {
            return Err(StoreError::Truncated {
                expected: 24,
                actual: buf.len(),
            });
        }
        let hdr = HeapHeader {
            magic: u32::from_le_bytes(buf[0..4].try_into().expect("4-byte slice")),
            version: u32::from_le_bytes(buf[4..8].try_into().expect("4-byte slice")),
            heap_size: u64::from_le_bytes(buf[8..16].try_into().expect("8-byte slice")),
            nzones: u32::from_le_bytes(buf[16..20].try_into().expect("4-byte slice")),
            zone_cap: u32::from_le_bytes(buf[20..24].try_into().expect("4-byte slice")),
        };
        if hdr.magic != HEAP_MAGIC {
            return Err(StoreError::corrupt(format!(
                "bad heap magic {:#x}",
                hdr.magic
            )));
        }
        Ok(hdr)
    }
}

/// Decoded pool header (the heap-owned prefix; the store root area that
/// follows is opaque here).
#[derive(Debug, Clone, Copy)]
pub struct PoolHeader {
    pub magic: u32,
    pub version: u32,
    pub compat_flags: u64,
    pub incompat_flags: u64,
    pub pool_id: Uuid,
    pub size: u64,
}

impl PoolHeader {
    #[must_use]
    pub fn encode(&self) -> [u8; 64] {
        let mut buf = [0u8; 64];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.compat_flags.to_le_bytes());
        buf[16..24].copy_from_slice(&self.incompat_flags.to_le_bytes());
        buf[24..40].copy_from_slice(self.pool_id.as_bytes());
        buf[40..48].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 64 {
            return Err(StoreError::Truncated {
                expected: 64,
                actual: buf.len(),
            });
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&buf[24..40]);
        let hdr = PoolHeader {
            magic: u32::from_le_bytes(buf[0..4].try_into().expect("4-byte slice")),
            version: u32::from_le_bytes(buf[4..8].try_into().expect("4-byte slice")),
            compat_flags: u64::from_le_bytes(buf[8..16].try_into().expect("8-byte slice")),
            incompat_flags: u64::from_le_bytes(buf[16..24].try_into().expect("8-byte slice")),
            pool_id: Uuid::from_bytes(id),
            size: u64::from_le_bytes(buf[40..48].try_into().expect("8-byte slice")),
        };
        if hdr.magic != POOL_MAGIC {
            return Err(StoreError::corrupt(format!(
                "bad pool magic {:#x}",
                hdr.magic
            )));
        }
        if hdr.version != POOL_VERSION {
            return Err(StoreError::corrupt(format!(
                "unsupported pool version {}",
                hdr.version
            )));
        }
        Ok(hdr)
    }
}
