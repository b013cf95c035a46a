/// Mutable pool: one full-size byte copy per frame in flight.
///
/// Commits write into the copy of the current write index. When the render
/// thread advances the write index, pending ranges are copied from the
/// previous slot into the new one, so the slot producers write to always
/// starts from the latest image.

use crate::allocator::BufferKey;
use crate::allocator::partial_commit::PartialCommitTracker;

pub(crate) struct MutableEntry {
    pub key: BufferKey,
    pub copies: Vec<Vec<u8>>,
    /// First commit is written to every copy
    pub seeded: bool,
    pub pending: PartialCommitTracker,
}

pub(crate) struct MutablePool {
    copy_count: u32,
    entries: Vec<MutableEntry>,
}

impl MutablePool {
    pub fn new(copy_count: u32) -> Self {
        Self {
            copy_count,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn copy_count(&self) -> u32 {
        self.copy_count
    }

    /// Reserve zeroed copies for `key`, returning the pool index
    pub fn allocate(&mut self, key: BufferKey, num_bytes: usize) -> usize {
        debug_assert!(
            self.entries.iter().all(|entry| entry.key != key),
            "buffer {:?} already allocated in the Mutable pool", key
        );
        self.entries.push(MutableEntry {
            key,
            copies: (0..self.copy_count).map(|_| vec![0u8; num_bytes]).collect(),
            seeded: false,
            pending: PartialCommitTracker::new(self.copy_count),
        });
        self.entries.len() - 1
    }

    /// Swap-and-pop removal; returns the key of the entry moved into `index`
    pub fn deallocate(&mut self, index: usize) -> Option<BufferKey> {
        self.entries.swap_remove(index);
        self.entries.get(index).map(|entry| entry.key)
    }

    #[cfg(test)]
    pub fn key(&self, index: usize) -> BufferKey {
        self.entries[index].key
    }

    /// Write the whole buffer into the current copy
    pub fn commit(&mut self, index: usize, write_index: usize, data: &[u8]) {
        let entry = &mut self.entries[index];
        if entry.seeded {
            entry.copies[write_index].copy_from_slice(data);
        } else {
            for copy in &mut entry.copies {
                copy.copy_from_slice(data);
            }
            entry.seeded = true;
        }
        entry.pending.record_full(data.len());
    }

    /// Write `data` at `base_offset` into the current copy
    pub fn commit_partial(&mut self, index: usize, write_index: usize, base_offset: usize, data: &[u8]) {
        let entry = &mut self.entries[index];
        let range = base_offset..base_offset + data.len();
        if entry.seeded {
            entry.copies[write_index][range].copy_from_slice(data);
        } else {
            for copy in &mut entry.copies {
                copy[range.clone()].copy_from_slice(data);
            }
            entry.seeded = true;
        }
        entry.pending.record(base_offset, data.len());
    }

    pub fn data(&self, index: usize, read_index: usize) -> &[u8] {
        &self.entries[index].copies[read_index]
    }

    pub fn pending(&self, index: usize) -> &PartialCommitTracker {
        &self.entries[index].pending
    }

    /// Mark the current pending intervals as received by one more copy
    ///
    /// Returns true when nothing is left to propagate.
    pub fn complete_propagation(&mut self, index: usize) -> bool {
        let pending = &mut self.entries[index].pending;
        pending.complete_propagation();
        pending.is_empty()
    }

    /// Total pending intervals across every entry
    pub fn pending_interval_count(&self) -> usize {
        self.entries.iter().map(|entry| entry.pending.len()).sum()
    }

    /// Bring copy `to` up to date with copy `from` on every pending range
    pub fn advance(&mut self, from: usize, to: usize) {
        if from == to {
            return;
        }
        for entry in &mut self.entries {
            if entry.pending.is_empty() {
                continue;
            }
            let (source, target) = if from < to {
                let (head, tail) = entry.copies.split_at_mut(to);
                (&head[from], &mut tail[0])
            } else {
                let (head, tail) = entry.copies.split_at_mut(from);
                (&tail[0], &mut head[to])
            };
            for interval in entry.pending.intervals() {
                let range = interval.range();
                target[range.clone()].copy_from_slice(&source[range]);
            }
        }
    }
}
