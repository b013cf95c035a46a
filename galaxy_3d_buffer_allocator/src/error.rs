//! Error types for the Galaxy3D buffer allocator
//!
//! Every rejected allocator operation is a caller logic error. It is logged at
//! ERROR severity (with file:line) and surfaced as one of the variants below.
//! A rejected commit never writes any bytes.

use std::fmt;

/// Result type for buffer allocator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Buffer allocator errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Backend-specific error (Vulkan, DirectX, host memory, etc.)
    BackendError(String),

    /// Buffer parameters violate a usage/shape invariant
    InvalidParams(String),

    /// Handle no longer refers to a live buffer (destroyed or reclaimed)
    StaleHandle,

    /// Committed element type differs from the type captured at creation
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// Write range does not fit inside the buffer
    OutOfBounds {
        offset: u64,
        size: u64,
        buffer_size: u64,
    },

    /// Commit not allowed for this buffer (partial commit on a non-Mutable or
    /// non-Structured buffer, second commit to an Immutable buffer, ...)
    InvalidCommit(String),

    /// Frame lifecycle call made out of order
    FrameOrder(String),

    /// SingleFrame pool cannot grow past its configured ceiling
    PoolExhausted {
        requested: usize,
        used: usize,
        limit: usize,
    },

    /// External handles to SingleFrame buffers outlived EndFrame
    SingleFrameLeak {
        count: usize,
    },

    /// Allocator construction failed (invalid configuration)
    InitializationFailed(String),

    /// Allocator already shut down
    ShutDown,

    /// An internal lock was poisoned by a panicking thread
    LockPoisoned(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BackendError(msg) => write!(f, "Backend error: {}", msg),
            Error::InvalidParams(msg) => write!(f, "Invalid buffer params: {}", msg),
            Error::StaleHandle => write!(f, "Stale buffer handle"),
            Error::TypeMismatch { expected, found } => {
                write!(f, "Type mismatch: buffer holds '{}', commit used '{}'", expected, found)
            }
            Error::OutOfBounds { offset, size, buffer_size } => write!(
                f,
                "Out of bounds: write of {} bytes at offset {} exceeds buffer size {}",
                size, offset, buffer_size
            ),
            Error::InvalidCommit(msg) => write!(f, "Invalid commit: {}", msg),
            Error::FrameOrder(msg) => write!(f, "Frame order violation: {}", msg),
            Error::PoolExhausted { requested, used, limit } => write!(
                f,
                "SingleFrame pool exhausted: {} bytes requested, {} of {} bytes used",
                requested, used, limit
            ),
            Error::SingleFrameLeak { count } => write!(
                f,
                "{} SingleFrame buffer handle(s) still referenced after EndFrame",
                count
            ),
            Error::InitializationFailed(msg) => write!(f, "Initialization failed: {}", msg),
            Error::ShutDown => write!(f, "Buffer allocator is shut down"),
            Error::LockPoisoned(what) => write!(f, "{} lock poisoned", what),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Log this error at ERROR severity and hand it back
    ///
    /// Used at every rejection site so callers get both the log line and the value.
    #[track_caller]
    pub(crate) fn logged(self, source: &str) -> Self {
        let location = std::panic::Location::caller();
        crate::log::log_detailed(
            crate::log::LogSeverity::Error,
            source,
            self.to_string(),
            location.file(),
            location.line(),
        );
        self
    }
}

// ===== ERROR MACROS =====

/// Log an ERROR and build an `Error::InvalidParams` from a format string
///
/// # Example
///
/// ```ignore
/// let err = engine_err!("galaxy3d::BufferParams", "element count {} is zero", n);
/// ```
#[macro_export]
macro_rules! engine_err {
    ($source:expr, $($arg:tt)*) => {{
        let message = format!($($arg)*);
        $crate::engine_error!($source, "{}", message);
        $crate::galaxy3d::Error::InvalidParams(message)
    }};
}

/// Log an ERROR and return early with `Error::InvalidParams`
///
/// # Example
///
/// ```ignore
/// engine_bail!("galaxy3d::BufferParams", "Constant data must have exactly one element");
/// ```
#[macro_export]
macro_rules! engine_bail {
    ($source:expr, $($arg:tt)*) => {
        return Err($crate::engine_err!($source, $($arg)*))
    };
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
