//! Buffer facade and buffer parameters

mod buffer;
mod buffer_params;

pub use buffer::Buffer;
pub use buffer_params::{BufferParams, BufferUsage, DataShape, LifetimeType};
