//! Allocation classes.
//!
//! A class describes how blocks of one size band are carved out: unit size,
//! units per run, data alignment, and which allocation header (if any) is
//! stamped in front of the user bytes. Class 0 is reserved for huge
//! allocations that take whole chunks.

use tidepool_error::{Result, StoreError};

use crate::bitmap::RUN_DATA_BASE_OFF;
use crate::layout::{chunk_flags, CHUNK_SIZE};

/// Class id for huge (whole-chunk) allocations.
pub const CLASS_HUGE: u8 = 0;

/// Allocation-header variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderType {
    /// 64-byte header: size, extra, flags and a red zone.
    Legacy,
    /// 16-byte header: packed size/flags word plus extra.
    Compact,
    /// No header; the block size comes from the run or chunk geometry.
    None,
}

impl HeaderType {
    #[must_use]
    pub const fn size(self) -> u64 {
        match self {
            HeaderType::Legacy => 64,
            HeaderType::Compact => 16,
            HeaderType::None => 0,
        }
    }

    /// Chunk flags advertising this header type.
    #[must_use]
    pub const fn chunk_flags(self) -> u16 {
        match self {
            HeaderType::Legacy => 0,
            HeaderType::Compact => chunk_flags::COMPACT_HEADER,
            HeaderType::None => chunk_flags::HEADER_NONE,
        }
    }
}

/// One registered allocation class.
#[derive(Debug, Clone, Copy)]
pub struct AllocClass {
    pub id: u8,
    /// Bytes per unit, header included.
    pub unit_size: u64,
    /// Units per run.
    pub nallocs: u16,
    /// Required alignment of the unit data area.
    pub alignment: u64,
    pub header: HeaderType,
    /// Extra chunk flags, e.g. [`chunk_flags::FLEX_BITMAP`].
    pub flags: u16,
}

impl AllocClass {
    /// Chunks spanned by one run of this class.
    #[must_use]
    pub fn run_size_idx(&self) -> u32 {
        let bytes = RUN_DATA_BASE_OFF + self.unit_size * u64::from(self.nallocs);
        let chunks = bytes.div_ceil(CHUNK_SIZE);
        u32::try_from(chunks).expect("run span fits u32")
    }

    /// Full chunk flags stamped on this class's run chunks.
    #[must_use]
    pub fn chunk_flags(&self) -> u16 {
        self.flags | self.header.chunk_flags()
    }

    /// Largest user payload a unit of this class can hold.
    #[must_use]
    pub fn usable(&self) -> u64 {
        self.unit_size - self.header.size()
    }
}

/// The class table. Slots are dense by id; id 0 is the built-in huge class.
pub struct ClassSet {
    classes: Vec<Option<AllocClass>>,
}

impl ClassSet {
    /// Build the default table: the huge class plus a small-object ladder.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut set = ClassSet {
            classes: vec![None; 256],
        };
        set.classes[CLASS_HUGE as usize] = Some(AllocClass {
            id: CLASS_HUGE,
            unit_size: CHUNK_SIZE,
            nallocs: 1,
            alignment: 64,
            header: HeaderType::Legacy,
            flags: 0,
        });
        let ladder: [(u8, u64, u16); 6] = [
            (1, 64, 1024),
            (2, 128, 1024),
            (3, 256, 512),
            (4, 1024, 256),
            (5, 2048, 128),
            (6, 4096, 64),
        ];
        for (id, unit_size, nallocs) in ladder {
            set.classes[id as usize] = Some(AllocClass {
                id,
                unit_size,
                nallocs,
                alignment: 64,
                header: HeaderType::Compact,
                flags: chunk_flags::FLEX_BITMAP,
            });
        }
        set
    }

    /// Register a caller-defined class. Id 0 is reserved; a live id fails
    /// with `Exists`.
    pub fn register(&mut self, class: AllocClass) -> Result<()> {
        if class.id == CLASS_HUGE {
            return Err(StoreError::invalid("class id 0 is reserved for huge"));
        }
        if class.unit_size == 0 || class.nallocs == 0 {
            return Err(StoreError::invalid("class with zero unit size or count"));
        }
        if class.unit_size <= class.header.size() {
            return Err(StoreError::invalid(
                "class unit smaller than its allocation header",
            ));
        }
        let slot = &mut self.classes[class.id as usize];
        if slot.is_some() {
            return Err(StoreError::Exists);
        }
        *slot = Some(class);
        Ok(())
    }

    pub fn get(&self, id: u8) -> Result<AllocClass> {
        self.classes[id as usize]
            .ok_or_else(|| StoreError::invalid(format!("unknown allocation class {id}")))
    }

    /// Smallest run class whose unit holds `size` user bytes, or the huge
    /// class when none does.
    #[must_use]
    pub fn class_for_size(&self, size: u64) -> u8 {
        let mut best: Option<(u64, u8)> = None;
        for class in self.classes.iter().flatten() {
            if class.id == CLASS_HUGE {
                continue;
            }
            if class.usable() >= size {
                match best {
                    Some((unit, _)) if unit <= class.unit_size => {}
                    _ => best = Some((class.unit_size, class.id)),
                }
            }
        }
        best.map_or(CLASS_HUGE, |(_, id)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_the_small_object_ladder() {
        let set = ClassSet::with_defaults();
        assert_eq!(set.get(CLASS_HUGE).unwrap().header, HeaderType::Legacy);
        assert_eq!(set.get(3).unwrap().unit_size, 256);
    }

    #[test]
    fn class_for_size_picks_smallest_fit() {
        let set = ClassSet::with_defaults();
        // 40 bytes + 16-byte compact header fits the 64-byte class.
        assert_eq!(set.class_for_size(40), 1);
        assert_eq!(set.class_for_size(100), 2);
        // Bigger than every unit: huge.
        assert_eq!(set.class_for_size(100 * 1024), CLASS_HUGE);
    }

    #[test]
    fn register_guards_ids_and_geometry() {
        let mut set = ClassSet::with_defaults();
        let class = AllocClass {
            id: 42,
            unit_size: 512,
            nallocs: 64,
            alignment: 64,
            header: HeaderType::Compact,
            flags: chunk_flags::FLEX_BITMAP,
        };
        set.register(class).unwrap();
        assert!(matches!(set.register(class), Err(StoreError::Exists)));

        let mut bad = class;
        bad.id = CLASS_HUGE;
        assert!(set.register(bad).is_err());

        let mut tiny = class;
        tiny.id = 43;
        tiny.unit_size = 8;
        assert!(set.register(tiny).is_err(), "unit below header size");
    }

    #[test]
    fn run_span_covers_all_units() {
        let set = ClassSet::with_defaults();
        let class = set.get(6).unwrap();
        let span = u64::from(class.run_size_idx()) * CHUNK_SIZE;
        assert!(span >= RUN_DATA_BASE_OFF + class.unit_size * u64::from(class.nallocs));
    }
}
