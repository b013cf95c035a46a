/// Per-buffer bookkeeping kept by the allocator registry

use std::any::TypeId;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use slotmap::new_key_type;
use crate::backend::BackendBuffer;
use crate::buffer::{BufferParams, LifetimeType};

// ===== SLOT MAP KEY =====

new_key_type! {
    /// Generation-checked key of a buffer inside the allocator.
    ///
    /// A key becomes stale when its buffer is destroyed (or, for SingleFrame
    /// buffers, reclaimed at EndFrame); stale keys are rejected, never aliased.
    pub struct BufferKey;
}

/// Element type captured at creation and checked on every commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeFingerprint {
    pub id: TypeId,
    pub name: &'static str,
    pub size: usize,
}

impl TypeFingerprint {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
            size: std::mem::size_of::<T>(),
        }
    }

    pub fn matches<T: 'static>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }
}

/// Where a live buffer's bytes are in its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitMetadata {
    pub lifetime: LifetimeType,
    /// Index of the entry inside its pool (updated on swap-and-pop)
    pub pool_index: usize,
    pub byte_count: usize,
}

/// Shared ticket behind every facade handle
///
/// The registry keeps one clone; each external `Buffer<T>` clone adds one more.
#[derive(Debug)]
pub struct BufferTicket {
    pub(crate) key: BufferKey,
}

impl BufferTicket {
    pub fn key(&self) -> BufferKey {
        self.key
    }
}

/// Registry entry for one live buffer
pub(crate) struct BufferRecord {
    pub metadata: CommitMetadata,
    pub params: BufferParams,
    pub fingerprint: TypeFingerprint,
    pub backend_buffer: Box<dyn BackendBuffer>,
    pub ticket: Arc<BufferTicket>,
    /// Immutable buffers accept a single commit
    pub committed: AtomicBool,
}

impl BufferRecord {
    /// Number of external handles still alive (registry clone excluded)
    pub fn external_refs(&self) -> usize {
        Arc::strong_count(&self.ticket) - 1
    }
}
