/// Typed buffer handle.
///
/// A `Buffer<T>` is what producers and consumers hold. It wraps the shared
/// ticket of one allocator buffer and the allocator itself, so element types
/// are checked at compile time and every clone counts as an external
/// reference. Dropping a handle never releases the buffer; `destroy` does.
///
/// SingleFrame buffers are reclaimed at EndFrame: every handle to them must be
/// dropped by then or EndFrame reports a leak.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use bytemuck::Pod;
use crate::allocator::{BufferAllocator, BufferKey, BufferTicket};
use crate::buffer::{BufferParams, BufferUsage, LifetimeType};
use crate::error::{Error, Result};
use crate::{engine_err, engine_error};

/// Commit error to report once the orphan buffer was (or failed to be) released
fn keep_commit_error(error: Error, released: Result<()>) -> Error {
    if let Err(cleanup) = released {
        engine_error!("galaxy3d::Buffer",
            "Failed to release buffer after rejected initial commit: {}", cleanup);
    }
    error
}

pub struct Buffer<T: Pod> {
    ticket: Arc<BufferTicket>,
    allocator: Arc<BufferAllocator>,
    params: BufferParams,
    size: u64,
    _element: PhantomData<fn() -> T>,
}

impl<T: Pod> Buffer<T> {
    fn allocate(allocator: &Arc<BufferAllocator>, params: BufferParams) -> Result<Self> {
        let ticket = allocator.allocate::<T>(params)?;
        Ok(Self {
            ticket,
            allocator: Arc::clone(allocator),
            params,
            size: std::mem::size_of::<T>() as u64 * params.element_count as u64,
            _element: PhantomData,
        })
    }

    /// Create a single-element buffer holding `value`
    pub fn create(
        allocator: &Arc<BufferAllocator>,
        lifetime: LifetimeType,
        usage: BufferUsage,
        value: &T,
    ) -> Result<Self> {
        let buffer = Self::create_uncommitted(allocator, lifetime, usage)?;
        buffer.commit_or_release(std::slice::from_ref(value))
    }

    /// Create a zeroed single-element buffer to be committed later
    pub fn create_uncommitted(
        allocator: &Arc<BufferAllocator>,
        lifetime: LifetimeType,
        usage: BufferUsage,
    ) -> Result<Self> {
        Self::allocate(allocator, BufferParams::constant(lifetime, usage))
    }

    /// Create an array buffer holding `data`
    pub fn create_array(
        allocator: &Arc<BufferAllocator>,
        lifetime: LifetimeType,
        usage: BufferUsage,
        data: &[T],
    ) -> Result<Self> {
        let element_count = u32::try_from(data.len()).map_err(|_| engine_err!(
            "galaxy3d::Buffer", "Array of {} elements exceeds u32::MAX", data.len()
        ))?;
        let buffer = Self::create_uncommitted_array(allocator, lifetime, usage, element_count)?;
        buffer.commit_or_release(data)
    }

    /// Create a zeroed array buffer of `element_count` elements
    pub fn create_uncommitted_array(
        allocator: &Arc<BufferAllocator>,
        lifetime: LifetimeType,
        usage: BufferUsage,
        element_count: u32,
    ) -> Result<Self> {
        Self::allocate(allocator, BufferParams::structured(lifetime, usage, element_count))
    }

    // A failed initial commit must not leave an orphan buffer behind
    fn commit_or_release(self, data: &[T]) -> Result<Self> {
        match self.allocator.commit(self.key(), data) {
            Ok(()) => Ok(self),
            Err(error) => Err(keep_commit_error(error, self.allocator.deallocate(self.key()))),
        }
    }

    // ===== COMMITS =====

    /// Overwrite a single-element buffer
    pub fn commit(&self, value: &T) -> Result<()> {
        self.allocator.commit(self.key(), std::slice::from_ref(value))
    }

    /// Overwrite every element
    pub fn commit_array(&self, data: &[T]) -> Result<()> {
        self.allocator.commit(self.key(), data)
    }

    /// Overwrite `data.len()` elements starting at `base_index`
    ///
    /// Mutable Structured buffers only.
    pub fn commit_partial(&self, data: &[T], base_index: u32) -> Result<()> {
        self.allocator.commit_partial(self.key(), data, base_index)
    }

    /// Typed copy of the current contents
    pub fn read(&self) -> Result<Vec<T>> {
        self.allocator.with_data(self.key(), |bytes| {
            let mut elements = vec![T::zeroed(); bytes.len() / std::mem::size_of::<T>()];
            bytemuck::cast_slice_mut::<T, u8>(&mut elements).copy_from_slice(bytes);
            elements
        })
    }

    /// Release the buffer
    ///
    /// Other clones of this handle become stale.
    pub fn destroy(self) -> Result<()> {
        self.allocator.deallocate(self.key())
    }

    // ===== ACCESSORS =====

    pub fn key(&self) -> BufferKey {
        self.ticket.key()
    }

    /// Total size in bytes, fixed at creation
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn params(&self) -> &BufferParams {
        &self.params
    }

    pub fn lifetime(&self) -> LifetimeType {
        self.params.lifetime
    }

    pub fn element_count(&self) -> u32 {
        self.params.element_count
    }

    /// Whether the buffer is still live in the allocator
    pub fn is_live(&self) -> Result<bool> {
        self.allocator.is_live(self.key())
    }
}

impl<T: Pod> Clone for Buffer<T> {
    fn clone(&self) -> Self {
        Self {
            ticket: Arc::clone(&self.ticket),
            allocator: Arc::clone(&self.allocator),
            params: self.params,
            size: self.size,
            _element: PhantomData,
        }
    }
}

impl<T: Pod> fmt::Debug for Buffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("key", &self.key())
            .field("element", &std::any::type_name::<T>())
            .field("params", &self.params)
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
#[path = "buffer_tests.rs"]
mod tests;
