/// Deferred deletion queue.
///
/// A deallocated buffer may still be read by device work of the frames in
/// flight, so its backend buffer is parked here, tagged with the frame it was
/// deallocated in, and physically destroyed only once
/// `frame + frames_in_flight < current_frame`.

use std::collections::VecDeque;
use crate::allocator::BufferKey;
use crate::backend::{BackendBuffer, BufferBackend};

/// Backend buffer waiting for destruction
pub(crate) struct DeferredDeletionEntry {
    pub frame: u64,
    pub key: BufferKey,
    pub buffer: Box<dyn BackendBuffer>,
}

/// Frame-tagged deletion queue
pub(crate) struct DeferredDeletionQueue {
    frames_in_flight: u32,
    entries: VecDeque<DeferredDeletionEntry>,
}

impl DeferredDeletionQueue {
    pub fn new(frames_in_flight: u32) -> Self {
        Self {
            frames_in_flight,
            entries: VecDeque::new(),
        }
    }

    /// Park a backend buffer deallocated during `frame`
    pub fn push(&mut self, frame: u64, key: BufferKey, buffer: Box<dyn BackendBuffer>) {
        self.entries.push_back(DeferredDeletionEntry { frame, key, buffer });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether an entry tagged `entry_frame` can be destroyed at `frame`
    pub fn is_expired(&self, entry_frame: u64, frame: u64) -> bool {
        entry_frame.saturating_add(self.frames_in_flight as u64) < frame
    }

    /// Remove every expired entry, oldest first
    ///
    /// Producers may push with a frame tag read just before the render thread
    /// advanced, so the whole queue is scanned rather than only its front.
    pub fn take_expired(&mut self, frame: u64) -> Vec<DeferredDeletionEntry> {
        let entries = std::mem::take(&mut self.entries);
        let mut expired = Vec::new();
        for entry in entries {
            if self.is_expired(entry.frame, frame) {
                expired.push(entry);
            } else {
                self.entries.push_back(entry);
            }
        }
        expired
    }

    /// Destroy every expired entry through `backend`, returning how many
    pub fn clear(&mut self, frame: u64, backend: &dyn BufferBackend) -> usize {
        let expired = self.take_expired(frame);
        let count = expired.len();
        for entry in expired {
            backend.destroy_buffer(entry.key, entry.buffer);
        }
        count
    }
}

#[cfg(test)]
#[path = "deferred_deletion_tests.rs"]
mod tests;
