/*!
# Galaxy 3D Buffer Allocator

Frame-aware GPU buffer allocator for the Galaxy 3D engine.

Producer threads create and commit typed buffers at any time; once per frame
the render thread flushes the committed bytes to the device through an
injected backend. Physical buffers are never destroyed while a frame in
flight might still read them.

## Architecture

- **Buffer**: typed, reference-counted handle producers and consumers hold
- **BufferAllocator**: registry, lifetime pools, dirty tracking and frame lifecycle
- **BufferBackend**: device-side strategy (create/update/destroy of physical buffers)
- **HostMemoryBackend**: CPU-memory backend for headless runs and tests

## Lifetimes

- **Mutable**: rewritable, one physical copy per frame in flight
- **Immutable**: written once
- **SingleFrame**: bump-allocated, reclaimed at the end of the frame
*/

// Internal modules
mod error;
mod config;
pub mod log;
pub mod allocator;
pub mod backend;
pub mod buffer;

// Main galaxy3d namespace module
pub mod galaxy3d {
    // Error types
    pub use crate::error::{Error, Result};

    // Configuration
    pub use crate::config::{AllocatorConfig, DEFAULT_FRAMES_IN_FLIGHT, DEFAULT_SINGLE_FRAME_CAPACITY};

    // Allocator core
    pub use crate::allocator::{AllocatorStats, BufferAllocator};

    // Buffer facade
    pub use crate::buffer::{Buffer, BufferParams, BufferUsage, DataShape, LifetimeType};

    // Logging sub-module (types and functions, NOT macros)
    pub mod log {
        pub use crate::log::{
            Logger, LogEntry, LogSeverity, DefaultLogger,
            set_logger, reset_logger, set_min_severity, min_severity,
        };
    }

    // Backend sub-module
    pub mod backend {
        pub use crate::backend::*;
    }

    // Allocator internals exposed for key-level access
    pub mod allocator {
        pub use crate::allocator::*;
    }
}
