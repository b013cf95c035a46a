/// Buffer parameters: lifetime category, data shape, element count and usage

use bitflags::bitflags;
use crate::error::Result;
use crate::engine_bail;

/// How long a buffer lives and how it may be updated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifetimeType {
    /// Permanent, rewritable, one copy per frame in flight
    Mutable,
    /// Permanent, written once
    Immutable,
    /// Valid for the frame it was created in, reclaimed at EndFrame
    SingleFrame,
}

/// Shape of the data stored in a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataShape {
    /// Exactly one element (uniform/constant block)
    Constant,
    /// Array of elements (storage/structured buffer)
    Structured,
}

bitflags! {
    /// Who reads and writes the buffer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const GPU_READ  = 1 << 0;
        const GPU_WRITE = 1 << 1;
        const CPU_READ  = 1 << 2;
        const CPU_WRITE = 1 << 3;
    }
}

impl Default for BufferUsage {
    fn default() -> Self {
        BufferUsage::GPU_READ | BufferUsage::CPU_WRITE
    }
}

/// Descriptor for a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferParams {
    pub lifetime: LifetimeType,
    pub shape: DataShape,
    pub element_count: u32,
    pub usage: BufferUsage,
}

impl BufferParams {
    /// Single-element buffer
    pub fn constant(lifetime: LifetimeType, usage: BufferUsage) -> Self {
        Self {
            lifetime,
            shape: DataShape::Constant,
            element_count: 1,
            usage,
        }
    }

    /// Array buffer of `element_count` elements
    pub fn structured(lifetime: LifetimeType, usage: BufferUsage, element_count: u32) -> Self {
        Self {
            lifetime,
            shape: DataShape::Structured,
            element_count,
            usage,
        }
    }

    /// Number of physical copies the backend must hold
    pub fn copy_count(&self, frames_in_flight: u32) -> u32 {
        match self.lifetime {
            LifetimeType::Mutable => frames_in_flight,
            LifetimeType::Immutable | LifetimeType::SingleFrame => 1,
        }
    }

    /// Whether sub-range commits are allowed
    pub fn supports_partial_commit(&self) -> bool {
        self.lifetime == LifetimeType::Mutable && self.shape == DataShape::Structured
    }

    /// Check usage and shape invariants
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidParams` if:
    /// - the element count is zero
    /// - Constant data does not have exactly one element
    /// - GPU_WRITE is requested on a non-Immutable buffer
    /// - GPU_WRITE and CPU_WRITE are both requested
    pub fn validate(&self) -> Result<()> {
        if self.element_count == 0 {
            engine_bail!("galaxy3d::BufferParams", "Buffer must have at least one element");
        }
        if self.shape == DataShape::Constant && self.element_count != 1 {
            engine_bail!("galaxy3d::BufferParams",
                "Constant data must have exactly one element (got {}), use Structured for arrays",
                self.element_count);
        }
        if self.usage.contains(BufferUsage::GPU_WRITE) {
            if self.lifetime != LifetimeType::Immutable {
                engine_bail!("galaxy3d::BufferParams",
                    "GPU_WRITE usage is only allowed on Immutable buffers (got {:?})",
                    self.lifetime);
            }
            if self.usage.contains(BufferUsage::CPU_WRITE) {
                engine_bail!("galaxy3d::BufferParams",
                    "CPU_WRITE and GPU_WRITE are mutually exclusive");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "buffer_params_tests.rs"]
mod tests;
