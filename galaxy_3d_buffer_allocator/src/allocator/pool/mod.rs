//! Allocation pools, one per buffer lifetime
//!
//! Each pool is guarded by its own lock inside the allocator. Entries are
//! addressed by index; removal is swap-and-pop and reports which key moved
//! so the allocator can update that key's metadata.

mod mutable_pool;
mod immutable_pool;
mod single_frame_pool;

pub(crate) use mutable_pool::MutablePool;
pub(crate) use immutable_pool::ImmutablePool;
pub(crate) use single_frame_pool::SingleFramePool;

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
