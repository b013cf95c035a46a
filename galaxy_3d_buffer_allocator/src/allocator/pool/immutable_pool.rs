/// Immutable pool: every buffer's bytes packed into one growing `Vec<u8>`.
///
/// Spans are addressed by index. Removal swap-and-pops the span list and
/// compacts the byte array, so live spans always tile `[0, total_bytes)`.

use crate::allocator::BufferKey;

#[derive(Debug, Clone, Copy)]
pub(crate) struct ImmutableSpan {
    pub key: BufferKey,
    pub start: usize,
    pub len: usize,
}

impl ImmutableSpan {
    fn range(&self) -> std::ops::Range<usize> {
        self.start..self.start + self.len
    }
}

#[derive(Default)]
pub(crate) struct ImmutablePool {
    data: Vec<u8>,
    spans: Vec<ImmutableSpan>,
}

impl ImmutablePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Append `num_bytes` zeroed bytes for `key`, returning the pool index
    pub fn allocate(&mut self, key: BufferKey, num_bytes: usize) -> usize {
        debug_assert!(
            self.spans.iter().all(|span| span.key != key),
            "buffer {:?} already allocated in the Immutable pool", key
        );
        let start = self.data.len();
        self.data.resize(start + num_bytes, 0);
        self.spans.push(ImmutableSpan {
            key,
            start,
            len: num_bytes,
        });
        self.spans.len() - 1
    }

    /// Swap-and-pop removal; returns the key of the span moved into `index`
    pub fn deallocate(&mut self, index: usize) -> Option<BufferKey> {
        let removed = self.spans.swap_remove(index);
        self.data.drain(removed.range());
        for span in &mut self.spans {
            if span.start > removed.start {
                span.start -= removed.len;
            }
        }
        self.spans.get(index).map(|span| span.key)
    }

    pub fn commit(&mut self, index: usize, data: &[u8]) {
        let range = self.spans[index].range();
        self.data[range].copy_from_slice(data);
    }

    pub fn data(&self, index: usize) -> &[u8] {
        &self.data[self.spans[index].range()]
    }

    pub fn total_bytes(&self) -> usize {
        self.data.len()
    }

    #[cfg(test)]
    pub fn key(&self, index: usize) -> BufferKey {
        self.spans[index].key
    }

    #[cfg(test)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}
