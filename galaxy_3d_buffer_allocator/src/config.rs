/// Buffer allocator configuration

use crate::error::{Error, Result};

/// Default number of frames the device may still be executing
pub const DEFAULT_FRAMES_IN_FLIGHT: u32 = 2;

/// Default starting size of the SingleFrame pool (1 MiB)
pub const DEFAULT_SINGLE_FRAME_CAPACITY: usize = 1 << 20;

/// Allocator configuration
///
/// Validated once when the allocator is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Number of overlapping frames; Mutable buffers keep one copy per frame
    pub frames_in_flight: u32,
    /// Initial byte capacity of the SingleFrame pool
    pub single_frame_initial_capacity: usize,
    /// Hard ceiling for the SingleFrame pool (None = grow without limit)
    pub single_frame_max_capacity: Option<usize>,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            single_frame_initial_capacity: DEFAULT_SINGLE_FRAME_CAPACITY,
            single_frame_max_capacity: None,
        }
    }
}

impl AllocatorConfig {
    /// Default configuration with a different frame count
    pub fn with_frames_in_flight(frames_in_flight: u32) -> Self {
        Self {
            frames_in_flight,
            ..Self::default()
        }
    }

    /// Check the configuration is usable
    ///
    /// # Errors
    ///
    /// Returns `Error::InitializationFailed` if:
    /// - `frames_in_flight` is zero
    /// - the SingleFrame ceiling is smaller than its initial capacity
    pub fn validate(&self) -> Result<()> {
        if self.frames_in_flight == 0 {
            return Err(Error::InitializationFailed(
                "frames_in_flight must be at least 1".to_string(),
            ));
        }
        if let Some(max) = self.single_frame_max_capacity {
            if max < self.single_frame_initial_capacity {
                return Err(Error::InitializationFailed(format!(
                    "single_frame_max_capacity ({}) is smaller than single_frame_initial_capacity ({})",
                    max, self.single_frame_initial_capacity
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
