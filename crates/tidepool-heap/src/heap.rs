//! The heap proper: zones, chunks, runs, reservations and redo-logged
//! transactions.
//!
//! Mutation model: inside a transaction every persistent write is captured
//! three ways at once — a redo entry buffered for the log, an undo copy of
//! the overwritten bytes, and an immediate update of the volatile image so
//! the transaction reads its own writes. Commit makes the redo entries
//! durable, applies them to the mapped file and flushes; abort replays the
//! undo copies into the image and the file never learns the transaction
//! existed.
//!
//! Reservations (`reserve`/`publish`/`cancel`) only touch volatile state
//! until published, which is what makes a batch of allocations and index
//! updates atomic under a single log transaction.

use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use tidepool_error::{Result, StoreError};
use tidepool_types::RawOff;
use tracing::debug;
use uuid::Uuid;

use crate::alloc_class::{AllocClass, ClassSet, HeaderType, CLASS_HUGE};
use crate::bitmap::{bit_mask, RunBitmap};
use crate::layout::{
    chunk_flags, ChunkHeader, ChunkType, HeapHeader, PoolHeader, ZoneHeader, CHUNK_SIZE,
    HEAP_HDR_OFF, HEAP_MAGIC, POOL_MAGIC, POOL_VERSION, ZONE0_OFF, ZONE_HDR_SIZE, ZONE_MAGIC,
    ZONE_MAX_CHUNKS, ZONE_META_SIZE,
};
use crate::wal::{Wal, WalEntry, WalEntryKind};

/// Behaviour knobs.
#[derive(Debug, Clone, Copy)]
pub struct HeapConfig {
    /// Emit bitmap updates as `set_bits`/`clr_bits` records. When the log
    /// substrate cannot express bitwise operations, turn this off and whole
    /// words are logged as `set` instead.
    pub wal_bitwise_ops: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        HeapConfig {
            wal_bitwise_ops: true,
        }
    }
}

#[derive(Clone, Copy)]
struct ZoneInfo {
    off: u64,
    nchunks: u32,
}

#[derive(Default)]
struct ZoneState {
    /// Free chunk spans `(first_chunk, len)`, ordered by first chunk.
    free_spans: Vec<(u32, u32)>,
    /// Runs with at least one free unit, per class id.
    run_buckets: HashMap<u8, Vec<u32>>,
}

struct TxState {
    entries: Vec<WalEntry>,
    undo: Vec<(u64, Vec<u8>)>,
    touched_zones: BTreeSet<u32>,
}

enum Act {
    AllocHuge {
        zone: u32,
        chunk: u32,
        size_idx: u32,
        class: AllocClass,
        req_size: u64,
        extra: u64,
        user_off: u64,
    },
    AllocRun {
        zone: u32,
        chunk: u32,
        unit: u32,
        class: AllocClass,
        new_run: bool,
        req_size: u64,
        extra: u64,
        user_off: u64,
    },
    Free {
        off: u64,
    },
    SetValue {
        off: u64,
        value: u64,
    },
}

/// A deferred-commit intent returned by [`Heap::reserve`],
/// [`Heap::defer_free`] or [`Heap::set_value`]. Apply with [`Heap::publish`]
/// or discard with [`Heap::cancel`].
pub struct ActionToken {
    act: Act,
}

impl ActionToken {
    /// User-data offset this token will materialize; null for frees.
    #[must_use]
    pub fn off(&self) -> RawOff {
        match &self.act {
            Act::AllocHuge { user_off, .. } | Act::AllocRun { user_off, .. } => {
                RawOff::new(*user_off)
            }
            Act::Free { .. } => RawOff::NULL,
            Act::SetValue { off, .. } => RawOff::new(*off),
        }
    }
}

/// Aggregate heap occupancy, for tests and the monitor surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    pub nzones: u32,
    pub total_chunks: u64,
    pub free_chunks: u64,
    pub used_chunks: u64,
    pub run_chunks: u64,
}

const COMPACT_SIZE_MASK: u64 = (1 << 48) - 1;

/// The persistent heap over one pool file.
pub struct Heap {
    path: PathBuf,
    file: File,
    map: MmapMut,
    image: Vec<u8>,
    wal: Wal,
    cfg: HeapConfig,
    classes: ClassSet,
    zones: Vec<ZoneInfo>,
    zstate: Vec<ZoneState>,
    /// Reserved-but-unpublished run units: `(zone, chunk) -> overlay words`.
    overlay: HashMap<(u32, u32), Vec<u64>>,
    /// Reserved-but-unpublished chunk spans `(zone, chunk, len)`.
    reserved_spans: Vec<(u32, u32, u32)>,
    tx: Option<TxState>,
}

fn wal_path(pool: &Path) -> PathBuf {
    let mut os = pool.as_os_str().to_owned();
    os.push(".wal");
    PathBuf::from(os)
}

fn apply_entry(buf: &mut [u8], entry: &WalEntry) -> Result<()> {
    let off = entry.target_off as usize;
    match entry.kind {
        WalEntryKind::Set => {
            if entry.payload.len() != 8 || off + 8 > buf.len() {
                return Err(StoreError::corrupt("set record out of bounds"));
            }
            buf[off..off + 8].copy_from_slice(&entry.payload);
        }
        WalEntryKind::SetBits | WalEntryKind::ClrBits => {
            if off + 8 > buf.len() {
                return Err(StoreError::corrupt("bit record out of bounds"));
            }
            let (start, nbits) = entry.bit_range()?;
            if start >= 64 || nbits == 0 || nbits > 64 - start {
                return Err(StoreError::corrupt("bit record with bad range"));
            }
            let mut word =
                u64::from_le_bytes(buf[off..off + 8].try_into().expect("8-byte slice"));
            let mask = bit_mask(start, nbits);
            if entry.kind == WalEntryKind::SetBits {
                word |= mask;
            } else {
                word &= !mask;
            }
            buf[off..off + 8].copy_from_slice(&word.to_le_bytes());
        }
        WalEntryKind::Persist | WalEntryKind::Commit => {}
    }
    Ok(())
}

impl Heap {
    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Create a fresh pool file of `size` bytes.
    pub fn create(path: &Path, pool_id: Uuid, size: u64, cfg: HeapConfig) -> Result<Heap> {
        let min = ZONE0_OFF + ZONE_META_SIZE + CHUNK_SIZE;
        if size < min {
            return Err(StoreError::invalid(format!(
                "pool size {size} below the {min}-byte minimum"
            )));
        }

        // Split the area after the headers into zones.
        let mut zones = Vec::new();
        let mut off = ZONE0_OFF;
        let mut remaining = size - ZONE0_OFF;
        while remaining >= ZONE_META_SIZE + CHUNK_SIZE {
            let nchunks =
                u64::min(u64::from(ZONE_MAX_CHUNKS), (remaining - ZONE_META_SIZE) / CHUNK_SIZE)
                    as u32;
            zones.push(ZoneInfo { off, nchunks });
            let zone_size = ZONE_META_SIZE + u64::from(nchunks) * CHUNK_SIZE;
            off += zone_size;
            remaining -= zone_size;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(size)?;
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let mut image = vec![0u8; size as usize];

        let pool_hdr = PoolHeader {
            magic: POOL_MAGIC,
            version: POOL_VERSION,
            compat_flags: 0,
            incompat_flags: 0,
            pool_id,
            size,
        };
        image[0..64].copy_from_slice(&pool_hdr.encode());

        let heap_hdr = HeapHeader {
            magic: HEAP_MAGIC,
            version: POOL_VERSION,
            heap_size: size - ZONE0_OFF,
            nzones: zones.len() as u32,
            zone_cap: ZONE_MAX_CHUNKS,
        };
        image[HEAP_HDR_OFF as usize..HEAP_HDR_OFF as usize + 24]
            .copy_from_slice(&heap_hdr.encode());

        for zone in &zones {
            let zh = ZoneHeader {
                magic: ZONE_MAGIC,
                size_idx: zone.nchunks,
                flags: 0,
            };
            let zo = zone.off as usize;
            image[zo..zo + ZONE_HDR_SIZE as usize].copy_from_slice(&zh.encode());
            // One free span covering the whole zone.
            let hdr = ChunkHeader::new(ChunkType::Free, 0, zone.nchunks).pack();
            let ho = (zone.off + ZONE_HDR_SIZE) as usize;
            image[ho..ho + 8].copy_from_slice(&hdr.to_le_bytes());
        }

        map.copy_from_slice(&image);
        map.flush()?;

        let wal = Wal::open(&wal_path(path))?;
        let mut heap = Heap {
            path: path.to_path_buf(),
            file,
            map,
            image,
            wal,
            cfg,
            classes: ClassSet::with_defaults(),
            zones,
            zstate: Vec::new(),
            overlay: HashMap::new(),
            reserved_spans: Vec::new(),
            tx: None,
        };
        heap.boot_scan()?;
        debug!(path = %path.display(), size, nzones = heap.zones.len(), "created pool");
        Ok(heap)
    }

    /// Open an existing pool, replaying any committed-but-unapplied redo log
    /// transactions first.
    pub fn open(path: &Path, cfg: HeapConfig) -> Result<Heap> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let mut wal = Wal::open(&wal_path(path))?;

        let committed = wal.read_committed()?;
        if !committed.is_empty() {
            debug!(
                transactions = committed.len(),
                "replaying redo log into the pool"
            );
            for tx in &committed {
                for entry in tx {
                    apply_entry(&mut map, entry)?;
                }
            }
            map.flush()?;
            wal.reset()?;
        }

        let image = map.to_vec();
        let pool_hdr = PoolHeader::decode(&image[0..64])?;
        let heap_hdr = HeapHeader::decode(
            &image[HEAP_HDR_OFF as usize..HEAP_HDR_OFF as usize + 24],
        )?;
        if pool_hdr.size != image.len() as u64 {
            return Err(StoreError::corrupt(format!(
                "pool header size {} disagrees with file size {}",
                pool_hdr.size,
                image.len()
            )));
        }

        let mut zones = Vec::new();
        let mut off = ZONE0_OFF;
        for _ in 0..heap_hdr.nzones {
            if off as usize + ZONE_HDR_SIZE as usize > image.len() {
                return Err(StoreError::corrupt("zone walks past the pool end"));
            }
            let zh = ZoneHeader::decode(&image[off as usize..(off + ZONE_HDR_SIZE) as usize])?;
            zones.push(ZoneInfo {
                off,
                nchunks: zh.size_idx,
            });
            off += ZONE_META_SIZE + u64::from(zh.size_idx) * CHUNK_SIZE;
        }
        if off > image.len() as u64 {
            return Err(StoreError::corrupt("zones overrun the pool file"));
        }

        let mut heap = Heap {
            path: path.to_path_buf(),
            file,
            map,
            image,
            wal,
            cfg,
            classes: ClassSet::with_defaults(),
            zones,
            zstate: Vec::new(),
            overlay: HashMap::new(),
            reserved_spans: Vec::new(),
            tx: None,
        };
        heap.boot_scan()?;
        Ok(heap)
    }

    /// Remove the pool file and its redo log.
    pub fn destroy(path: &Path) -> Result<()> {
        std::fs::remove_file(path)?;
        let wal = wal_path(path);
        if wal.exists() {
            std::fs::remove_file(wal)?;
        }
        Ok(())
    }

    /// Flush the mapped file.
    pub fn flush(&mut self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }

    /// Register a caller-defined allocation class.
    pub fn register_class(&mut self, class: AllocClass) -> Result<()> {
        self.classes.register(class)
    }

    /// The class table.
    #[must_use]
    pub fn classes(&self) -> &ClassSet {
        &self.classes
    }

    #[must_use]
    pub fn pool_id(&self) -> Uuid {
        PoolHeader::decode(&self.image[0..64])
            .map(|h| h.pool_id)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.image.len() as u64
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    // -----------------------------------------------------------------------
    // Boot scan
    // -----------------------------------------------------------------------

    /// Validate chunk metadata, rebuild footers and run-data continuation
    /// headers, and derive the volatile free state.
    fn boot_scan(&mut self) -> Result<()> {
        self.zstate = (0..self.zones.len()).map(|_| ZoneState::default()).collect();
        for zi in 0..self.zones.len() {
            let zone = self.zones[zi];
            let mut c = 0u32;
            while c < zone.nchunks {
                let hdr = self.chunk_hdr(zi as u32, c)?;
                let span = hdr.size_idx;
                if span == 0 || c + span > zone.nchunks {
                    return Err(StoreError::corrupt(format!(
                        "zone {zi} chunk {c}: span {span} walks past the zone"
                    )));
                }
                match hdr.kind {
                    ChunkType::Free | ChunkType::Used | ChunkType::Run => {}
                    ChunkType::RunData | ChunkType::Footer => {
                        return Err(StoreError::corrupt(format!(
                            "zone {zi} chunk {c}: dangling continuation header"
                        )))
                    }
                }
                if hdr.kind == ChunkType::Used && span > 1 {
                    // Footers are derived, never logged.
                    let footer = ChunkHeader::new(ChunkType::Footer, 0, span).pack();
                    let off = self.chunk_hdr_off(zi as u32, c + span - 1) as usize;
                    self.image[off..off + 8].copy_from_slice(&footer.to_le_bytes());
                }
                if hdr.kind == ChunkType::Run {
                    let data = ChunkHeader::new(ChunkType::RunData, hdr.flags, span).pack();
                    for d in c + 1..c + span {
                        let off = self.chunk_hdr_off(zi as u32, d) as usize;
                        self.image[off..off + 8].copy_from_slice(&data.to_le_bytes());
                    }
                }
                c += span;
            }
            self.rebuild_zone_state(zi as u32)?;
        }
        Ok(())
    }

    /// Re-derive a zone's free spans and run buckets from the image,
    /// honouring outstanding reservations.
    fn rebuild_zone_state(&mut self, zi: u32) -> Result<()> {
        let zone = self.zones[zi as usize];
        let mut state = ZoneState::default();
        let mut c = 0u32;
        while c < zone.nchunks {
            let hdr = self.chunk_hdr(zi, c)?;
            let span = hdr.size_idx.max(1);
            match hdr.kind {
                ChunkType::Free => {
                    // Merge with the previous span when adjacent.
                    if let Some(last) = state.free_spans.last_mut() {
                        if last.0 + last.1 == c {
                            last.1 += span;
                            c += span;
                            continue;
                        }
                    }
                    state.free_spans.push((c, span));
                }
                ChunkType::Run => {
                    let unit_size = self.read_u64_raw(self.chunk_off(zi, c))?;
                    if let Some(class_id) = self.class_by_unit(unit_size) {
                        if self.run_has_free(zi, c, span, hdr.flags, unit_size)? {
                            state.run_buckets.entry(class_id).or_default().push(c);
                        }
                    }
                }
                _ => {}
            }
            c += span;
        }

        // Outstanding reservations keep their chunks out of the free state.
        for &(rz, rc, rlen) in &self.reserved_spans {
            if rz != zi {
                continue;
            }
            let mut rebuilt = Vec::new();
            for &(s, l) in &state.free_spans {
                if rc >= s && rc + rlen <= s + l {
                    if rc > s {
                        rebuilt.push((s, rc - s));
                    }
                    if s + l > rc + rlen {
                        rebuilt.push((rc + rlen, s + l - (rc + rlen)));
                    }
                } else {
                    rebuilt.push((s, l));
                }
            }
            state.free_spans = rebuilt;
        }

        self.zstate[zi as usize] = state;
        Ok(())
    }

    fn class_by_unit(&self, unit_size: u64) -> Option<u8> {
        (1..=u8::MAX)
            .find(|&id| matches!(self.classes.get(id), Ok(c) if c.unit_size == unit_size))
    }

    fn run_geometry(&self, flags: u16, span: u32, unit_size: u64) -> RunBitmap {
        RunBitmap::for_run(
            unit_size,
            u64::from(span) * CHUNK_SIZE,
            flags & chunk_flags::FLEX_BITMAP != 0,
        )
    }

    fn run_has_free(&self, zi: u32, c: u32, span: u32, flags: u16, unit_size: u64) -> Result<bool> {
        let geom = self.run_geometry(flags, span, unit_size);
        let base = self.chunk_off(zi, c) + geom.bitmap_off;
        for w in 0..geom.nwords {
            let mut word = self.read_u64_raw(base + u64::from(w) * 8)?;
            if let Some(overlay) = self.overlay.get(&(zi, c)) {
                word |= overlay[w as usize];
            }
            if word != u64::MAX {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // -----------------------------------------------------------------------
    // Address arithmetic
    // -----------------------------------------------------------------------

    fn chunk_hdr_off(&self, zi: u32, c: u32) -> u64 {
        self.zones[zi as usize].off + ZONE_HDR_SIZE + u64::from(c) * 8
    }

    fn chunk_off(&self, zi: u32, c: u32) -> u64 {
        self.zones[zi as usize].off + ZONE_META_SIZE + u64::from(c) * CHUNK_SIZE
    }

    fn chunk_hdr(&self, zi: u32, c: u32) -> Result<ChunkHeader> {
        ChunkHeader::unpack(self.read_u64_raw(self.chunk_hdr_off(zi, c))?)
    }

    /// Resolve a pool offset to `(zone, chunk, offset_within_chunk)`.
    fn resolve(&self, off: u64) -> Result<(u32, u32, u64)> {
        for (zi, zone) in self.zones.iter().enumerate() {
            let data0 = zone.off + ZONE_META_SIZE;
            let data_end = data0 + u64::from(zone.nchunks) * CHUNK_SIZE;
            if off >= data0 && off < data_end {
                let delta = off - data0;
                return Ok((zi as u32, (delta / CHUNK_SIZE) as u32, delta % CHUNK_SIZE));
            }
        }
        Err(StoreError::invalid(format!(
            "offset {off:#x} is not inside any zone's chunk area"
        )))
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    fn read_u64_raw(&self, off: u64) -> Result<u64> {
        let off = off as usize;
        if off + 8 > self.image.len() {
            return Err(StoreError::Truncated {
                expected: off + 8,
                actual: self.image.len(),
            });
        }
        Ok(u64::from_le_bytes(
            self.image[off..off + 8].try_into().expect("8-byte slice"),
        ))
    }

    /// Borrow `len` bytes at `off`.
    pub fn bytes(&self, off: RawOff, len: usize) -> Result<&[u8]> {
        let start = off.get() as usize;
        if start + len > self.image.len() {
            return Err(StoreError::Truncated {
                expected: start + len,
                actual: self.image.len(),
            });
        }
        Ok(&self.image[start..start + len])
    }

    pub fn read_u64(&self, off: RawOff) -> Result<u64> {
        self.read_u64_raw(off.get())
    }

    pub fn read_u32(&self, off: RawOff) -> Result<u32> {
        let b = self.bytes(off, 4)?;
        Ok(u32::from_le_bytes(b.try_into().expect("4-byte slice")))
    }

    pub fn read_u16(&self, off: RawOff) -> Result<u16> {
        let b = self.bytes(off, 2)?;
        Ok(u16::from_le_bytes(b.try_into().expect("2-byte slice")))
    }

    pub fn read_u8(&self, off: RawOff) -> Result<u8> {
        Ok(self.bytes(off, 1)?[0])
    }

    pub fn read_vec(&self, off: RawOff, len: usize) -> Result<Vec<u8>> {
        Ok(self.bytes(off, len)?.to_vec())
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Begin a redo-logged transaction. Nested transactions are not
    /// supported; the engine is single-threaded per pool.
    pub fn tx_begin(&mut self) -> Result<()> {
        if self.tx.is_some() {
            return Err(StoreError::TxBusy);
        }
        self.tx = Some(TxState {
            entries: Vec::new(),
            undo: Vec::new(),
            touched_zones: BTreeSet::new(),
        });
        Ok(())
    }

    #[must_use]
    pub fn in_tx(&self) -> bool {
        self.tx.is_some()
    }

    fn tx_state(&mut self) -> Result<&mut TxState> {
        self.tx
            .as_mut()
            .ok_or_else(|| StoreError::invalid("no transaction is active"))
    }

    /// Commit: log, apply to the mapped file, flush, reset the log.
    pub fn tx_commit(&mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| StoreError::invalid("no transaction is active"))?;
        if !tx.entries.is_empty() {
            self.wal.append_tx(&tx.entries)?;
            for entry in &tx.entries {
                apply_entry(&mut self.map, entry)?;
            }
            self.map.flush()?;
            self.wal.reset()?;
        }
        for zi in tx.touched_zones {
            self.rebuild_zone_state(zi)?;
        }
        Ok(())
    }

    /// Commit the redo log but skip the apply and flush. Crash-injection
    /// hook for recovery tests: the next [`Heap::open`] must replay the log
    /// and converge to the same state as a full commit.
    pub fn tx_commit_log_only(&mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| StoreError::invalid("no transaction is active"))?;
        if !tx.entries.is_empty() {
            self.wal.append_tx(&tx.entries)?;
        }
        for zi in tx.touched_zones {
            self.rebuild_zone_state(zi)?;
        }
        Ok(())
    }

    /// Abort: discard the log and roll the image back.
    pub fn tx_abort(&mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| StoreError::invalid("no transaction is active"))?;
        for (off, old) in tx.undo.into_iter().rev() {
            let off = off as usize;
            self.image[off..off + old.len()].copy_from_slice(&old);
        }
        for zi in tx.touched_zones {
            self.rebuild_zone_state(zi)?;
        }
        Ok(())
    }

    /// Write arbitrary bytes at `off`, logged as word-granular `set` records.
    pub fn tx_write(&mut self, off: RawOff, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let off = off.get();
        let end = off + data.len() as u64;
        if end > self.image.len() as u64 {
            return Err(StoreError::Truncated {
                expected: end as usize,
                actual: self.image.len(),
            });
        }
        let wstart = off & !7;
        let wend = (end + 7) & !7;
        if wend > self.image.len() as u64 {
            return Err(StoreError::invalid(
                "unaligned write touching the last partial word of the pool",
            ));
        }

        // Undo covers the whole word window; redo is per word.
        let window = self.image[wstart as usize..wend as usize].to_vec();
        let mut updated = window.clone();
        let lead = (off - wstart) as usize;
        updated[lead..lead + data.len()].copy_from_slice(data);

        let tx = self.tx_state()?;
        tx.undo.push((wstart, window));
        for (i, word) in updated.chunks_exact(8).enumerate() {
            tx.entries.push(WalEntry::set_word(
                wstart + i as u64 * 8,
                word.try_into().expect("8-byte chunk"),
            ));
        }
        self.image[wstart as usize..wend as usize].copy_from_slice(&updated);
        Ok(())
    }

    pub fn tx_write_u64(&mut self, off: RawOff, value: u64) -> Result<()> {
        self.tx_write(off, &value.to_le_bytes())
    }

    pub fn tx_write_u32(&mut self, off: RawOff, value: u32) -> Result<()> {
        self.tx_write(off, &value.to_le_bytes())
    }

    pub fn tx_write_u16(&mut self, off: RawOff, value: u16) -> Result<()> {
        self.tx_write(off, &value.to_le_bytes())
    }

    pub fn tx_write_u8(&mut self, off: RawOff, value: u8) -> Result<()> {
        self.tx_write(off, &[value])
    }

    /// Set or clear a bit range inside the aligned word at `word_off`.
    pub fn tx_set_bits(
        &mut self,
        word_off: RawOff,
        start: u32,
        nbits: u32,
        set: bool,
    ) -> Result<()> {
        let off = word_off.get();
        if off % 8 != 0 {
            return Err(StoreError::invalid("bit update on an unaligned word"));
        }
        if start >= 64 || nbits == 0 || nbits > 64 - start {
            return Err(StoreError::invalid("bit range outside one word"));
        }
        let old = self.read_u64_raw(off)?;
        let mask = bit_mask(start, nbits);
        let new = if set { old | mask } else { old & !mask };

        if self.cfg.wal_bitwise_ops {
            let tx = self.tx_state()?;
            tx.undo.push((off, old.to_le_bytes().to_vec()));
            tx.entries.push(WalEntry::bits(off, start, nbits, set));
            self.image[off as usize..off as usize + 8].copy_from_slice(&new.to_le_bytes());
            Ok(())
        } else {
            self.tx_write_u64(word_off, new)
        }
    }

    /// Record a flush intent for `[off, off + len)`.
    pub fn tx_persist(&mut self, off: RawOff, len: u64) -> Result<()> {
        let entry = WalEntry::persist(off.get(), len);
        self.tx_state()?.entries.push(entry);
        Ok(())
    }

    /// Volatile-only image write, for derived metadata (footers, run-data
    /// continuation headers) that boot re-creates from logged state.
    fn volatile_write_u64(&mut self, off: u64, value: u64) {
        self.image[off as usize..off as usize + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn touch_zone(&mut self, zi: u32) -> Result<()> {
        self.tx_state()?.touched_zones.insert(zi);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reservation surface
    // -----------------------------------------------------------------------

    /// Reserve space for `size` user bytes from `class_id`. Volatile until
    /// published.
    pub fn reserve(&mut self, class_id: u8, size: u64, extra: u64) -> Result<ActionToken> {
        if size == 0 {
            return Err(StoreError::invalid("zero-byte allocation"));
        }
        let class = self.classes.get(class_id)?;
        if class_id == CLASS_HUGE {
            self.reserve_huge(class, size, extra)
        } else {
            if size > class.usable() {
                return Err(StoreError::invalid(format!(
                    "{size} bytes exceed class {class_id} unit payload"
                )));
            }
            self.reserve_run_unit(class, size, extra)
        }
    }

    fn take_free_span(&mut self, want: u32) -> Option<(u32, u32)> {
        for (zi, state) in self.zstate.iter_mut().enumerate() {
            if let Some(pos) = state.free_spans.iter().position(|&(_, len)| len >= want) {
                let (start, len) = state.free_spans[pos];
                if len == want {
                    state.free_spans.remove(pos);
                } else {
                    state.free_spans[pos] = (start + want, len - want);
                }
                self.reserved_spans.push((zi as u32, start, want));
                return Some((zi as u32, start));
            }
        }
        None
    }

    /// Locate the free span in the image that contains `[chunk, chunk+span)`.
    fn image_free_span_containing(&self, zone: u32, chunk: u32, span: u32) -> Result<(u32, u32)> {
        let nchunks = self.zones[zone as usize].nchunks;
        let mut c = 0u32;
        while c < nchunks {
            let hdr = self.chunk_hdr(zone, c)?;
            let len = hdr.size_idx.max(1);
            if hdr.kind == ChunkType::Free && c <= chunk && chunk + span <= c + len {
                return Ok((c, len));
            }
            c += len;
        }
        Err(StoreError::corrupt(format!(
            "zone {zone}: no free span covers chunks {chunk}..{}",
            chunk + span
        )))
    }

    /// Stamp `hdr` on `[chunk, chunk+span)` carved out of an image-free
    /// span, writing lead/tail free headers so the header walk stays
    /// gap-free no matter which sibling reservations are later cancelled.
    fn place_span_header(
        &mut self,
        zone: u32,
        chunk: u32,
        span: u32,
        hdr: ChunkHeader,
    ) -> Result<()> {
        let (s0, l0) = self.image_free_span_containing(zone, chunk, span)?;
        if chunk > s0 {
            let lead = ChunkHeader::new(ChunkType::Free, 0, chunk - s0).pack();
            self.tx_write_u64(RawOff::new(self.chunk_hdr_off(zone, s0)), lead)?;
        }
        self.tx_write_u64(RawOff::new(self.chunk_hdr_off(zone, chunk)), hdr.pack())?;
        let end = chunk + span;
        if s0 + l0 > end {
            let tail = ChunkHeader::new(ChunkType::Free, 0, s0 + l0 - end).pack();
            self.tx_write_u64(RawOff::new(self.chunk_hdr_off(zone, end)), tail)?;
        }
        Ok(())
    }

    fn reserve_huge(&mut self, class: AllocClass, size: u64, extra: u64) -> Result<ActionToken> {
        let hdr = class.header.size();
        let span = u32::try_from((size + hdr).div_ceil(CHUNK_SIZE)).expect("span fits u32");
        let (zone, chunk) = self
            .take_free_span(span)
            .ok_or(StoreError::NoSpace { requested: size })?;
        let user_off = self.chunk_off(zone, chunk) + hdr;
        Ok(ActionToken {
            act: Act::AllocHuge {
                zone,
                chunk,
                size_idx: span,
                class,
                req_size: size,
                extra,
                user_off,
            },
        })
    }

    fn reserve_run_unit(
        &mut self,
        class: AllocClass,
        size: u64,
        extra: u64,
    ) -> Result<ActionToken> {
        // Try a run with a free unit first.
        for zi in 0..self.zones.len() as u32 {
            let candidates: Vec<u32> = self.zstate[zi as usize]
                .run_buckets
                .get(&class.id)
                .cloned()
                .unwrap_or_default();
            for c in candidates {
                let hdr = self.chunk_hdr(zi, c)?;
                if hdr.kind != ChunkType::Run {
                    continue;
                }
                let geom = self.run_geometry(hdr.flags, hdr.size_idx, class.unit_size);
                if let Some(unit) = self.find_free_unit(zi, c, &geom)? {
                    self.overlay_mark(zi, c, &geom, unit);
                    let user_off = self.chunk_off(zi, c)
                        + geom.data_off
                        + u64::from(unit) * class.unit_size
                        + class.header.size();
                    return Ok(ActionToken {
                        act: Act::AllocRun {
                            zone: zi,
                            chunk: c,
                            unit,
                            class,
                            new_run: false,
                            req_size: size,
                            extra,
                            user_off,
                        },
                    });
                }
            }
        }

        // No run has room: reserve chunks for a new run.
        let span = class.run_size_idx();
        let (zone, chunk) = self
            .take_free_span(span)
            .ok_or(StoreError::NoSpace { requested: size })?;
        let geom = self.run_geometry(class.chunk_flags(), span, class.unit_size);
        self.overlay_mark(zone, chunk, &geom, 0);
        let user_off =
            self.chunk_off(zone, chunk) + geom.data_off + class.header.size();
        Ok(ActionToken {
            act: Act::AllocRun {
                zone,
                chunk,
                unit: 0,
                class,
                new_run: true,
                req_size: size,
                extra,
                user_off,
            },
        })
    }

    fn find_free_unit(&self, zi: u32, c: u32, geom: &RunBitmap) -> Result<Option<u32>> {
        let base = self.chunk_off(zi, c) + geom.bitmap_off;
        for w in 0..geom.nwords {
            let mut word = self.read_u64_raw(base + u64::from(w) * 8)?;
            if let Some(overlay) = self.overlay.get(&(zi, c)) {
                word |= overlay[w as usize];
            }
            if word != u64::MAX {
                let bit = w * 64 + word.trailing_ones();
                if bit < geom.nbits {
                    return Ok(Some(bit));
                }
            }
        }
        Ok(None)
    }

    fn overlay_mark(&mut self, zi: u32, c: u32, geom: &RunBitmap, unit: u32) {
        let words = self
            .overlay
            .entry((zi, c))
            .or_insert_with(|| vec![0u64; geom.nwords as usize]);
        words[(unit / 64) as usize] |= 1u64 << (unit % 64);
    }

    fn overlay_clear(&mut self, zi: u32, c: u32, unit: u32) {
        if let Some(words) = self.overlay.get_mut(&(zi, c)) {
            words[(unit / 64) as usize] &= !(1u64 << (unit % 64));
            if words.iter().all(|&w| w == 0) {
                self.overlay.remove(&(zi, c));
            }
        }
    }

    fn unreserve_span(&mut self, zi: u32, chunk: u32, len: u32) {
        self.reserved_spans
            .retain(|&(z, c, l)| !(z == zi && c == chunk && l == len));
    }

    /// Queue a free of a previously published allocation.
    #[must_use]
    pub fn defer_free(&mut self, off: RawOff) -> ActionToken {
        ActionToken {
            act: Act::Free { off: off.get() },
        }
    }

    /// Queue an 8-byte pointer/value stitch, applied with the batch.
    #[must_use]
    pub fn set_value(&mut self, off: RawOff, value: u64) -> ActionToken {
        ActionToken {
            act: Act::SetValue {
                off: off.get(),
                value,
            },
        }
    }

    /// Apply a batch of intents inside the active transaction.
    pub fn publish(&mut self, tokens: Vec<ActionToken>) -> Result<()> {
        if self.tx.is_none() {
            return Err(StoreError::invalid("publish outside a transaction"));
        }
        for token in tokens {
            self.publish_one(token)?;
        }
        Ok(())
    }

    /// Drop reservations without touching persistent state.
    pub fn cancel(&mut self, tokens: Vec<ActionToken>) -> Result<()> {
        let mut touched = BTreeSet::new();
        for token in tokens {
            match token.act {
                Act::AllocHuge {
                    zone,
                    chunk,
                    size_idx,
                    ..
                } => {
                    self.unreserve_span(zone, chunk, size_idx);
                    touched.insert(zone);
                }
                Act::AllocRun {
                    zone,
                    chunk,
                    unit,
                    new_run,
                    class,
                    ..
                } => {
                    self.overlay_clear(zone, chunk, unit);
                    if new_run {
                        self.unreserve_span(zone, chunk, class.run_size_idx());
                    }
                    touched.insert(zone);
                }
                Act::Free { .. } | Act::SetValue { .. } => {}
            }
        }
        for zi in touched {
            self.rebuild_zone_state(zi)?;
        }
        Ok(())
    }

    fn write_alloc_header(
        &mut self,
        block_off: u64,
        class: AllocClass,
        req_size: u64,
        extra: u64,
    ) -> Result<()> {
        match class.header {
            HeaderType::Legacy => {
                self.tx_write_u64(RawOff::new(block_off), req_size)?;
                self.tx_write_u64(RawOff::new(block_off + 8), extra)?;
                self.tx_write_u64(RawOff::new(block_off + 16), 0)?;
                // Bytes 24..64 are the red zone, left zeroed.
            }
            HeaderType::Compact => {
                self.tx_write_u64(RawOff::new(block_off), req_size & COMPACT_SIZE_MASK)?;
                self.tx_write_u64(RawOff::new(block_off + 8), extra)?;
            }
            HeaderType::None => {}
        }
        Ok(())
    }

    fn publish_one(&mut self, token: ActionToken) -> Result<()> {
        match token.act {
            Act::AllocHuge {
                zone,
                chunk,
                size_idx,
                class,
                req_size,
                extra,
                user_off,
            } => {
                let hdr = ChunkHeader::new(ChunkType::Used, class.chunk_flags(), size_idx);
                self.place_span_header(zone, chunk, size_idx, hdr)?;
                if size_idx > 1 {
                    let footer = ChunkHeader::new(ChunkType::Footer, 0, size_idx).pack();
                    self.volatile_write_u64(
                        self.chunk_hdr_off(zone, chunk + size_idx - 1),
                        footer,
                    );
                }
                self.write_alloc_header(self.chunk_off(zone, chunk), class, req_size, extra)?;
                self.unreserve_span(zone, chunk, size_idx);
                self.touch_zone(zone)?;
                debug_assert_eq!(user_off, self.chunk_off(zone, chunk) + class.header.size());
            }
            Act::AllocRun {
                zone,
                chunk,
                unit,
                class,
                new_run,
                req_size,
                extra,
                user_off,
            } => {
                let span = if new_run {
                    class.run_size_idx()
                } else {
                    self.chunk_hdr(zone, chunk)?.size_idx
                };
                let geom = self.run_geometry(class.chunk_flags(), span, class.unit_size);
                let run_off = self.chunk_off(zone, chunk);

                if new_run {
                    let hdr = ChunkHeader::new(ChunkType::Run, class.chunk_flags(), span);
                    self.place_span_header(zone, chunk, span, hdr)?;
                    let data = ChunkHeader::new(ChunkType::RunData, class.chunk_flags(), span);
                    for d in chunk + 1..chunk + span {
                        self.volatile_write_u64(self.chunk_hdr_off(zone, d), data.pack());
                    }
                    // Run header and a fresh bitmap with trailing bits set.
                    self.tx_write_u64(RawOff::new(run_off), class.unit_size)?;
                    self.tx_write_u64(RawOff::new(run_off + 8), class.alignment)?;
                    for (w, word) in geom.init_words().into_iter().enumerate() {
                        self.tx_write_u64(
                            RawOff::new(run_off + geom.bitmap_off + w as u64 * 8),
                            word,
                        )?;
                    }
                    self.unreserve_span(zone, chunk, span);
                    let bucket = self.zstate[zone as usize]
                        .run_buckets
                        .entry(class.id)
                        .or_default();
                    if !bucket.contains(&chunk) {
                        bucket.push(chunk);
                    }
                }

                let word_off = run_off + geom.bitmap_off + u64::from(unit / 64) * 8;
                self.tx_set_bits(RawOff::new(word_off), unit % 64, 1, true)?;
                self.overlay_clear(zone, chunk, unit);
                let block_off = run_off + geom.data_off + u64::from(unit) * class.unit_size;
                self.write_alloc_header(block_off, class, req_size, extra)?;
                self.touch_zone(zone)?;
                debug_assert_eq!(user_off, block_off + class.header.size());
            }
            Act::Free { off } => self.publish_free(off)?,
            Act::SetValue { off, value } => self.tx_write_u64(RawOff::new(off), value)?,
        }
        Ok(())
    }

    fn publish_free(&mut self, off: u64) -> Result<()> {
        let (zone, mut chunk, _delta) = self.resolve(off)?;
        let mut hdr = self.chunk_hdr(zone, chunk)?;

        // Inside a run, continuation chunks point back to the head.
        while hdr.kind == ChunkType::RunData {
            if chunk == 0 {
                return Err(StoreError::corrupt("run-data chunk with no run head"));
            }
            chunk -= 1;
            hdr = self.chunk_hdr(zone, chunk)?;
        }

        match hdr.kind {
            ChunkType::Used => self.free_chunk_span(zone, chunk, hdr.size_idx),
            ChunkType::Run => {
                let run_off = self.chunk_off(zone, chunk);
                let unit_size = self.read_u64_raw(run_off)?;
                if unit_size == 0 {
                    return Err(StoreError::corrupt("run with zero unit size"));
                }
                let geom = self.run_geometry(hdr.flags, hdr.size_idx, unit_size);
                let delta = off - run_off;
                if delta < geom.data_off {
                    return Err(StoreError::invalid("free of a run metadata address"));
                }
                let unit = (delta - geom.data_off) / unit_size;
                if unit >= u64::from(geom.nbits) {
                    return Err(StoreError::invalid("free past the last unit of a run"));
                }
                let word_off = run_off + geom.bitmap_off + (unit / 64) * 8;
                self.tx_set_bits(RawOff::new(word_off), (unit % 64) as u32, 1, false)?;

                // Last unit out frees the whole run.
                let words: Vec<u64> = (0..geom.nwords)
                    .map(|w| self.read_u64_raw(run_off + geom.bitmap_off + u64::from(w) * 8))
                    .collect::<Result<_>>()?;
                if geom.is_empty(&words) && !self.overlay.contains_key(&(zone, chunk)) {
                    self.zstate[zone as usize]
                        .run_buckets
                        .values_mut()
                        .for_each(|bucket| bucket.retain(|&c| c != chunk));
                    self.free_chunk_span(zone, chunk, hdr.size_idx)?;
                } else if let Some(class_id) = self.class_by_unit(unit_size) {
                    let bucket = self.zstate[zone as usize]
                        .run_buckets
                        .entry(class_id)
                        .or_default();
                    if !bucket.contains(&chunk) {
                        bucket.push(chunk);
                    }
                }
                self.touch_zone(zone)
            }
            ChunkType::Free => Err(StoreError::invalid("double free of a chunk span")),
            _ => Err(StoreError::corrupt("free of unexpected chunk state")),
        }
    }

    /// Return `[chunk, chunk + span)` to the free state, coalescing with
    /// the adjacent free spans found in the image so first-fit sees one
    /// block.
    fn free_chunk_span(&mut self, zone: u32, chunk: u32, span: u32) -> Result<()> {
        let nchunks = self.zones[zone as usize].nchunks;
        let mut start = chunk;
        let mut len = span;

        // Walk the header chain to the predecessor span.
        let mut c = 0u32;
        let mut prev: Option<(u32, ChunkType, u32)> = None;
        while c < chunk {
            let hdr = self.chunk_hdr(zone, c)?;
            let l = hdr.size_idx.max(1);
            prev = Some((c, hdr.kind, l));
            c += l;
        }
        if c != chunk {
            return Err(StoreError::corrupt(format!(
                "zone {zone}: span headers do not tile at chunk {chunk}"
            )));
        }
        if let Some((ps, kind, pl)) = prev {
            if kind == ChunkType::Free && ps + pl == chunk {
                start = ps;
                len += pl;
            }
        }
        let end = chunk + span;
        if end < nchunks {
            let hdr = self.chunk_hdr(zone, end)?;
            if hdr.kind == ChunkType::Free {
                len += hdr.size_idx.max(1);
            }
        }

        let free = ChunkHeader::new(ChunkType::Free, 0, len).pack();
        self.tx_write_u64(RawOff::new(self.chunk_hdr_off(zone, start)), free)?;
        self.touch_zone(zone)
    }

    // -----------------------------------------------------------------------
    // Convenience allocation inside a transaction
    // -----------------------------------------------------------------------

    /// Reserve-and-publish in one step from an explicit class.
    pub fn tx_alloc(&mut self, class_id: u8, size: u64, extra: u64) -> Result<RawOff> {
        let token = self.reserve(class_id, size, extra)?;
        let off = token.off();
        self.publish(vec![token])?;
        Ok(off)
    }

    /// Reserve-and-publish picking the class by size.
    pub fn tx_alloc_auto(&mut self, size: u64, extra: u64) -> Result<RawOff> {
        let class_id = self.classes.class_for_size(size);
        self.tx_alloc(class_id, size, extra)
    }

    /// Free in one step.
    pub fn tx_free(&mut self, off: RawOff) -> Result<()> {
        let token = self.defer_free(off);
        self.publish(vec![token])
    }

    /// User-payload capacity of a published allocation.
    pub fn usable_size(&self, off: RawOff) -> Result<u64> {
        let (zone, mut chunk, _) = self.resolve(off.get())?;
        let mut hdr = self.chunk_hdr(zone, chunk)?;
        while hdr.kind == ChunkType::RunData {
            chunk -= 1;
            hdr = self.chunk_hdr(zone, chunk)?;
        }
        match hdr.kind {
            ChunkType::Used => {
                let block_off = self.chunk_off(zone, chunk);
                if hdr.flags & chunk_flags::HEADER_NONE != 0 {
                    Ok(u64::from(hdr.size_idx) * CHUNK_SIZE)
                } else if hdr.flags & chunk_flags::COMPACT_HEADER != 0 {
                    Ok(self.read_u64_raw(block_off)? & COMPACT_SIZE_MASK)
                } else {
                    Ok(self.read_u64_raw(block_off)?)
                }
            }
            ChunkType::Run => {
                let run_off = self.chunk_off(zone, chunk);
                let unit_size = self.read_u64_raw(run_off)?;
                let hdr_size = if hdr.flags & chunk_flags::HEADER_NONE != 0 {
                    0
                } else if hdr.flags & chunk_flags::COMPACT_HEADER != 0 {
                    16
                } else {
                    64
                };
                Ok(unit_size - hdr_size)
            }
            _ => Err(StoreError::invalid("offset is not a live allocation")),
        }
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Occupancy counters derived from chunk headers.
    pub fn stats(&self) -> Result<HeapStats> {
        let mut stats = HeapStats {
            nzones: self.zones.len() as u32,
            ..HeapStats::default()
        };
        for zi in 0..self.zones.len() as u32 {
            let zone = self.zones[zi as usize];
            stats.total_chunks += u64::from(zone.nchunks);
            let mut c = 0u32;
            while c < zone.nchunks {
                let hdr = self.chunk_hdr(zi, c)?;
                let span = hdr.size_idx.max(1);
                match hdr.kind {
                    ChunkType::Free => stats.free_chunks += u64::from(span),
                    ChunkType::Used => stats.used_chunks += u64::from(span),
                    ChunkType::Run => stats.run_chunks += u64::from(span),
                    _ => {}
                }
                c += span;
            }
        }
        Ok(stats)
    }

    /// Validate the chunk-header and bitmap invariants: footers agree with
    /// headers, bitmap trailing bits are set, spans tile each zone.
    pub fn check_integrity(&self) -> Result<()> {
        for zi in 0..self.zones.len() as u32 {
            let zone = self.zones[zi as usize];
            let mut c = 0u32;
            while c < zone.nchunks {
                let hdr = self.chunk_hdr(zi, c)?;
                let span = hdr.size_idx;
                if span == 0 || c + span > zone.nchunks {
                    return Err(StoreError::corrupt(format!(
                        "zone {zi} chunk {c}: bad span {span}"
                    )));
                }
                if hdr.kind == ChunkType::Used && span > 1 {
                    let footer = self.chunk_hdr(zi, c + span - 1)?;
                    if footer.kind != ChunkType::Footer || footer.size_idx != span {
                        return Err(StoreError::corrupt(format!(
                            "zone {zi} chunk {c}: footer disagrees with header"
                        )));
                    }
                }
                if hdr.kind == ChunkType::Run {
                    let run_off = self.chunk_off(zi, c);
                    let unit_size = self.read_u64_raw(run_off)?;
                    let geom = self.run_geometry(hdr.flags, span, unit_size);
                    for w in 0..geom.nwords {
                        let word =
                            self.read_u64_raw(run_off + geom.bitmap_off + u64::from(w) * 8)?;
                        let trailing = geom.trailing_mask(w);
                        if word & trailing != trailing {
                            return Err(StoreError::corrupt(format!(
                                "zone {zi} chunk {c}: cleared trailing bitmap bit"
                            )));
                        }
                    }
                }
                c += span;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("path", &self.path)
            .field("size", &self.image.len())
            .field("nzones", &self.zones.len())
            .field("in_tx", &self.tx.is_some())
            .finish()
    }
}
