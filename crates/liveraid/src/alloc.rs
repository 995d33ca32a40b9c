//! Per-drive first-fit allocator over the 32-bit parity-position namespace.
//!
//! Files are placed whole, so allocations are long contiguous runs. First
//! fit reuses freed ranges after deletes while sequential appends keep
//! extending the high-water mark.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub start: u32,
    pub count: u32,
}

/// Free-space tracker for one drive.
///
/// Invariants, restored after every operation: extents are strictly sorted
/// by `start`, pairwise disjoint, never adjacent, and the last extent never
/// reaches `next_free` (that case is absorbed into `next_free`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PosAllocator {
    next_free: u32,
    extents: Vec<Extent>,
}

impl PosAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(next_free: u32, extents: Vec<Extent>) -> Self {
        let mut a = Self { next_free, extents };
        a.extents.sort_by_key(|e| e.start);
        a.absorb_tail();
        a
    }

    pub fn next_free(&self) -> u32 {
        self.next_free
    }

    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// First-fit allocation of `count` contiguous positions.
    ///
    /// `alloc(0)` probes the current high-water mark without side effects.
    pub fn alloc(&mut self, count: u32) -> Result<u32> {
        if count == 0 {
            return Ok(self.next_free);
        }
        for (i, extent) in self.extents.iter_mut().enumerate() {
            if extent.count < count {
                continue;
            }
            let start = extent.start;
            if extent.count == count {
                self.extents.remove(i);
            } else {
                extent.start += count;
                extent.count -= count;
            }
            return Ok(start);
        }
        if count > u32::MAX - self.next_free {
            return Err(Error::NamespaceExhausted);
        }
        let start = self.next_free;
        self.next_free += count;
        Ok(start)
    }

    /// Grows an existing allocation in place when it abuts `next_free`.
    pub fn try_extend(&mut self, end: u32, count: u32) -> bool {
        if end == self.next_free && count <= u32::MAX - self.next_free {
            self.next_free += count;
            true
        } else {
            false
        }
    }

    /// Returns `[start, start+count)` to the free pool, merging neighbours
    /// and absorbing a range that reaches `next_free`.
    pub fn free(&mut self, start: u32, count: u32) {
        if count == 0 {
            return;
        }
        debug_assert!(start.checked_add(count).is_some_and(|end| end <= self.next_free));
        let at = self.extents.partition_point(|e| e.start < start);
        let merge_prev = at > 0 && {
            let prev = self.extents[at - 1];
            prev.start + prev.count == start
        };
        let merge_next = at < self.extents.len() && start + count == self.extents[at].start;
        match (merge_prev, merge_next) {
            (true, true) => {
                let next_count = self.extents[at].count;
                self.extents[at - 1].count += count + next_count;
                self.extents.remove(at);
            }
            (true, false) => self.extents[at - 1].count += count,
            (false, true) => {
                self.extents[at].start = start;
                self.extents[at].count += count;
            }
            (false, false) => self.extents.insert(at, Extent { start, count }),
        }
        self.absorb_tail();
    }

    /// Carves an exact range back out of the free pool. The range must be
    /// entirely free; used to undo a `free` when a follow-up allocation
    /// fails.
    pub fn reserve(&mut self, start: u32, count: u32) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        if start >= self.next_free {
            if count > u32::MAX - start {
                return Err(Error::NamespaceExhausted);
            }
            let gap = start - self.next_free;
            if gap > 0 {
                self.extents.push(Extent { start: self.next_free, count: gap });
            }
            self.next_free = start + count;
            return Ok(());
        }
        let at = self
            .extents
            .iter()
            .position(|e| e.start <= start && start + count <= e.start + e.count)
            .ok_or_else(|| Error::Invalid("range is not free".into()))?;
        let extent = self.extents[at];
        let before = start - extent.start;
        let after = extent.start + extent.count - (start + count);
        match (before, after) {
            (0, 0) => {
                self.extents.remove(at);
            }
            (0, _) => {
                self.extents[at].start = start + count;
                self.extents[at].count = after;
            }
            (_, 0) => self.extents[at].count = before,
            (_, _) => {
                self.extents[at].count = before;
                self.extents
                    .insert(at + 1, Extent { start: start + count, count: after });
            }
        }
        Ok(())
    }

    fn absorb_tail(&mut self) {
        while let Some(last) = self.extents.last() {
            if last.start + last.count == self.next_free {
                self.next_free = last.start;
                self.extents.pop();
            } else {
                break;
            }
        }
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        for w in self.extents.windows(2) {
            assert!(w[0].start + w[0].count < w[1].start, "sorted, disjoint, non-adjacent");
        }
        for e in &self.extents {
            assert!(e.count > 0);
            assert!(e.start + e.count <= self.next_free);
        }
        if let Some(last) = self.extents.last() {
            assert_ne!(last.start + last.count, self.next_free);
        }
    }
}
