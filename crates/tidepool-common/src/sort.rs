//! Combsort and binary search over opaque, caller-indexed collections.
//!
//! The collection never crosses the API: callers hand in an ops
//! implementation that compares and swaps by index, which lets the same code
//! sort fabric target tables, rank lists and test fixtures without copies.

use std::cmp::Ordering;

use tidepool_error::{Result, StoreError};

/// Index-addressed comparison and swap callbacks.
pub trait SortOps {
    /// Compare elements at positions `a` and `b`.
    fn cmp(&self, a: usize, b: usize) -> Ordering;
    /// Swap elements at positions `a` and `b`.
    fn swap(&mut self, a: usize, b: usize);
    /// Compare the element at `idx` against a caller key.
    fn cmp_key(&self, idx: usize, key: u64) -> Ordering;
}

/// Combsort with shrink factor 10/13.
///
/// Gaps of 9 and 10 are bumped to 11, which avoids the pathological "turtle"
/// sequences of the plain shrink schedule. With `unique` set, any equal pair
/// observed during sorting fails with `InvalidArgument`; the array may be
/// left partially reordered in that case.
pub fn combsort<T: SortOps + ?Sized>(ops: &mut T, len: usize, unique: bool) -> Result<()> {
    let mut gap = len;
    let mut swapped = true;
    while gap > 1 || swapped {
        gap = gap * 10 / 13;
        if gap == 9 || gap == 10 {
            gap = 11;
        }
        if gap < 1 {
            gap = 1;
        }

        swapped = false;
        let mut i = 0;
        let mut j = gap;
        while j < len {
            let ord = ops.cmp(i, j);
            if ord == Ordering::Equal && unique {
                return Err(StoreError::invalid("duplicate key in unique array"));
            }
            if ord == Ordering::Greater {
                ops.swap(i, j);
                swapped = true;
            }
            i += 1;
            j += 1;
        }
    }
    Ok(())
}

enum FindOpc {
    Eq,
    Le,
    Ge,
}

/// Binary search over a sorted collection.
///
/// With duplicates present, every mode resolves to the first occurrence in
/// array order.
fn bin_search<T: SortOps + ?Sized>(ops: &T, len: usize, key: u64, opc: FindOpc) -> Option<usize> {
    if len == 0 {
        return None;
    }

    let mut start = 0usize;
    let mut end = len - 1;
    let mut cur = 0usize;
    let mut ord = Ordering::Equal;
    loop {
        cur = (start + end) / 2;
        ord = ops.cmp_key(cur, key);
        if ord == Ordering::Equal {
            break;
        }
        if ord == Ordering::Less {
            start = cur + 1;
        } else {
            if cur == 0 {
                break;
            }
            end = cur - 1;
        }
        if start > end {
            break;
        }
    }

    match ord {
        Ordering::Less => {
            // Element at cur is smaller than the key.
            match opc {
                FindOpc::Eq => None,
                FindOpc::Le => Some(cur),
                FindOpc::Ge => {
                    if cur == len - 1 {
                        None
                    } else {
                        Some(cur + 1)
                    }
                }
            }
        }
        Ordering::Greater => {
            // Element at cur is larger than the key.
            match opc {
                FindOpc::Eq => None,
                FindOpc::Le => {
                    if cur == 0 {
                        None
                    } else {
                        Some(cur - 1)
                    }
                }
                FindOpc::Ge => Some(cur),
            }
        }
        Ordering::Equal => {
            // Walk back to the first occurrence.
            while cur > 0 && ops.cmp_key(cur - 1, key) == Ordering::Equal {
                cur -= 1;
            }
            Some(cur)
        }
    }
}

/// Find the element equal to `key`.
pub fn find<T: SortOps + ?Sized>(ops: &T, len: usize, key: u64) -> Option<usize> {
    bin_search(ops, len, key, FindOpc::Eq)
}

/// Find the greatest element less than or equal to `key`.
pub fn find_le<T: SortOps + ?Sized>(ops: &T, len: usize, key: u64) -> Option<usize> {
    bin_search(ops, len, key, FindOpc::Le)
}

/// Find the least element greater than or equal to `key`.
pub fn find_ge<T: SortOps + ?Sized>(ops: &T, len: usize, key: u64) -> Option<usize> {
    bin_search(ops, len, key, FindOpc::Ge)
}

/// Fisher-Yates shuffle, used by test tooling to build unsorted fixtures.
pub fn shuffle<T: SortOps + ?Sized, R: rand::Rng>(ops: &mut T, len: usize, rng: &mut R) {
    for n in (1..=len).rev() {
        let i = rng.gen_range(0..n);
        if i != n - 1 {
            ops.swap(i, n - 1);
        }
    }
}

/// Ops adapter for a plain `u64` slice, shared by callers that sort simple
/// id arrays.
pub struct U64SliceOps<'a>(pub &'a mut [u64]);

impl SortOps for U64SliceOps<'_> {
    fn cmp(&self, a: usize, b: usize) -> Ordering {
        self.0[a].cmp(&self.0[b])
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.0.swap(a, b);
    }

    fn cmp_key(&self, idx: usize, key: u64) -> Ordering {
        self.0[idx].cmp(&key)
    }
}
