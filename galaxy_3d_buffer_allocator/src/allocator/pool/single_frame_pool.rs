/// SingleFrame pool: a contiguous byte arena reset at every frame boundary.
///
/// Allocations are bump-allocated from one growing `Vec<u8>`. The arena
/// doubles when full, up to the configured ceiling.

use crate::allocator::BufferKey;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub(crate) struct SingleFrameSpan {
    pub key: BufferKey,
    pub start: usize,
    pub len: usize,
}

pub(crate) struct SingleFramePool {
    data: Vec<u8>,
    used: usize,
    max_capacity: Option<usize>,
    spans: Vec<SingleFrameSpan>,
}

impl SingleFramePool {
    pub fn new(initial_capacity: usize, max_capacity: Option<usize>) -> Self {
        Self {
            data: vec![0u8; initial_capacity],
            used: 0,
            max_capacity,
            spans: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Bytes handed out since the last reset
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bump-allocate `num_bytes` zeroed bytes for `key`
    ///
    /// # Errors
    ///
    /// Returns `Error::PoolExhausted` if the arena would grow past its ceiling.
    pub fn allocate(&mut self, key: BufferKey, num_bytes: usize) -> Result<usize> {
        debug_assert!(
            self.spans.iter().all(|span| span.key != key),
            "buffer {:?} already allocated in the SingleFrame pool", key
        );
        let end = self.used + num_bytes;
        if end > self.data.len() {
            self.grow(end)?;
        }
        // Bytes from the previous frame are still there
        self.data[self.used..end].fill(0);
        self.spans.push(SingleFrameSpan {
            key,
            start: self.used,
            len: num_bytes,
        });
        self.used = end;
        Ok(self.spans.len() - 1)
    }

    fn grow(&mut self, required: usize) -> Result<()> {
        let doubled = self.data.len().saturating_mul(2).max(required);
        let new_capacity = match self.max_capacity {
            Some(limit) if required > limit => {
                return Err(Error::PoolExhausted {
                    requested: required - self.used,
                    used: self.used,
                    limit,
                });
            }
            Some(limit) => doubled.min(limit),
            None => doubled,
        };
        self.data.resize(new_capacity, 0);
        Ok(())
    }

    /// Swap-and-pop removal of the span; its bytes stay reserved until reset
    pub fn deallocate(&mut self, index: usize) -> Option<BufferKey> {
        self.spans.swap_remove(index);
        self.spans.get(index).map(|span| span.key)
    }

    #[cfg(test)]
    pub fn key(&self, index: usize) -> BufferKey {
        self.spans[index].key
    }

    /// Keys of every live span
    pub fn keys(&self) -> Vec<BufferKey> {
        self.spans.iter().map(|span| span.key).collect()
    }

    pub fn commit(&mut self, index: usize, data: &[u8]) {
        let span = self.spans[index];
        self.data[span.start..span.start + span.len].copy_from_slice(data);
    }

    pub fn data(&self, index: usize) -> &[u8] {
        let span = self.spans[index];
        &self.data[span.start..span.start + span.len]
    }

    /// Reclaim every allocation
    pub fn reset(&mut self) {
        self.spans.clear();
        self.used = 0;
    }
}
