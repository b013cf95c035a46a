/// Backend strategy - the device side of the buffer allocator
///
/// The allocator never touches device memory itself. A `BufferBackend` is
/// injected at construction and performs the physical create/update/destroy
/// of each buffer. The backend chooses memory types from the usage flags and
/// holds `copy_count` physical copies per buffer (one per frame in flight for
/// Mutable buffers, one otherwise).

pub mod host_memory_backend;

pub use host_memory_backend::{HostMemoryBackend, BackendCall};

use crate::allocator::BufferKey;
use crate::buffer::BufferParams;
use crate::error::Result;

/// Descriptor passed to `BufferBackend::create_buffer`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendBufferDesc {
    /// Allocator key of the buffer (stable for its whole life)
    pub key: BufferKey,
    /// Size of one physical copy in bytes
    pub size: u64,
    /// Lifetime, shape, element count and usage
    pub params: BufferParams,
    /// Number of physical copies to allocate
    pub copy_count: u32,
}

/// Backend-owned physical buffer
///
/// Implemented by backend-specific buffer types. The allocator owns the boxed
/// value until it is handed back to `BufferBackend::destroy_buffer`.
pub trait BackendBuffer: Send + Sync {
    /// Upload bytes into one physical copy
    ///
    /// # Arguments
    ///
    /// * `copy_index` - Physical copy to write (always 0 for single-copy buffers)
    /// * `offset` - Offset into the copy in bytes
    /// * `data` - Bytes to write
    fn update(&self, copy_index: u32, offset: u64, data: &[u8]) -> Result<()>;
}

/// Backend strategy trait
///
/// Selected once at startup and injected into the allocator.
pub trait BufferBackend: Send + Sync {
    /// Create the physical buffer (all copies, zero-initialized)
    fn create_buffer(&self, desc: &BackendBufferDesc) -> Result<Box<dyn BackendBuffer>>;

    /// Physically destroy a buffer
    ///
    /// Only called from the deferred deletion sweep, once the device can no
    /// longer be reading any copy.
    fn destroy_buffer(&self, key: BufferKey, buffer: Box<dyn BackendBuffer>);
}
