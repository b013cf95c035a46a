/// Partial-commit tracking for Mutable buffers.
///
/// A Mutable buffer has one physical copy per frame in flight, and each flush
/// only reaches the copy of the current frame. Every byte range written by a
/// commit must therefore be propagated N times (once per copy) before it can
/// be forgotten. The tracker keeps the pending ranges as an ordered,
/// non-overlapping interval set, each interval carrying how many copies still
/// have to receive it.
///
/// Overlap policy (last writer wins):
/// - A new interval starts with `remaining = N`, the highest possible count,
///   so it is always the newest write in the set.
/// - Overlapping intervals with the same count were written since the last
///   flush; they are merged with the new one.
/// - Overlapping intervals with a lower count are older writes. The newer
///   interval already reaches every copy they still owe, so the overlapped
///   part is cut out of them (trim, or split into two pieces when the new
///   interval sits strictly inside). Empty pieces are dropped.

use std::ops::Range;

/// Pending byte range of a Mutable buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialCommitInterval {
    pub base_offset: usize,
    pub num_bytes: usize,
    /// Physical copies that have not received this range yet
    pub remaining_propagations: u32,
}

impl PartialCommitInterval {
    pub fn end(&self) -> usize {
        self.base_offset + self.num_bytes
    }

    pub fn range(&self) -> Range<usize> {
        self.base_offset..self.end()
    }

    fn overlaps(&self, range: &Range<usize>) -> bool {
        self.base_offset < range.end && range.start < self.end()
    }

    fn with_range(&self, range: Range<usize>) -> Self {
        Self {
            base_offset: range.start,
            num_bytes: range.end - range.start,
            remaining_propagations: self.remaining_propagations,
        }
    }
}

/// Ordered, non-overlapping set of pending intervals for one buffer
#[derive(Debug, Clone)]
pub struct PartialCommitTracker {
    copy_count: u32,
    intervals: Vec<PartialCommitInterval>,
}

impl PartialCommitTracker {
    /// Tracker for a buffer with `copy_count` physical copies
    pub fn new(copy_count: u32) -> Self {
        debug_assert!(copy_count > 0, "a Mutable buffer needs at least one copy");
        Self {
            copy_count,
            intervals: Vec::new(),
        }
    }

    /// Pending intervals sorted by base offset
    pub fn intervals(&self) -> &[PartialCommitInterval] {
        &self.intervals
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    /// Record a write covering the whole buffer
    ///
    /// Supersedes every pending interval.
    pub fn record_full(&mut self, buffer_size: usize) {
        self.intervals.clear();
        if buffer_size > 0 {
            self.intervals.push(PartialCommitInterval {
                base_offset: 0,
                num_bytes: buffer_size,
                remaining_propagations: self.copy_count,
            });
        }
    }

    /// Record a write of `num_bytes` at `base_offset`
    pub fn record(&mut self, base_offset: usize, num_bytes: usize) {
        if num_bytes == 0 {
            return;
        }
        let newest = self.copy_count;
        let mut merged = base_offset..base_offset + num_bytes;

        // Absorb same-count overlaps. Merging can widen the range into
        // further same-count intervals, so repeat until stable.
        loop {
            let mut absorbed = false;
            self.intervals.retain(|interval| {
                if interval.remaining_propagations == newest && interval.overlaps(&merged) {
                    merged.start = merged.start.min(interval.base_offset);
                    merged.end = merged.end.max(interval.end());
                    absorbed = true;
                    false
                } else {
                    true
                }
            });
            if !absorbed {
                break;
            }
        }

        // Cut the new range out of older writes
        let mut next = Vec::with_capacity(self.intervals.len() + 2);
        for interval in self.intervals.drain(..) {
            if !interval.overlaps(&merged) {
                next.push(interval);
                continue;
            }
            if interval.base_offset < merged.start {
                next.push(interval.with_range(interval.base_offset..merged.start));
            }
            if interval.end() > merged.end {
                next.push(interval.with_range(merged.end..interval.end()));
            }
        }
        next.push(PartialCommitInterval {
            base_offset: merged.start,
            num_bytes: merged.end - merged.start,
            remaining_propagations: newest,
        });
        next.sort_by_key(|interval| interval.base_offset);
        self.intervals = next;

        debug_assert!(self.is_well_formed());
    }

    /// One copy received every pending interval
    ///
    /// Decrements all counts and drops exhausted intervals.
    pub fn complete_propagation(&mut self) {
        for interval in &mut self.intervals {
            interval.remaining_propagations -= 1;
        }
        self.intervals.retain(|interval| interval.remaining_propagations > 0);
    }

    pub fn clear(&mut self) {
        self.intervals.clear();
    }

    fn is_well_formed(&self) -> bool {
        self.intervals.iter().all(|interval| interval.num_bytes > 0)
            && self.intervals.windows(2).all(|pair| pair[0].end() <= pair[1].base_offset)
    }
}

#[cfg(test)]
#[path = "partial_commit_tests.rs"]
mod tests;
