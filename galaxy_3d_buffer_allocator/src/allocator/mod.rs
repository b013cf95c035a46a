//! Buffer allocator: registry, lifetime pools, partial-commit tracking and
//! deferred deletion.

mod buffer_allocator;
mod commit_metadata;
mod deferred_deletion;
mod partial_commit;
mod pool;

pub use buffer_allocator::{AllocatorStats, BufferAllocator};
pub use commit_metadata::{BufferKey, BufferTicket, CommitMetadata, TypeFingerprint};
pub use partial_commit::{PartialCommitInterval, PartialCommitTracker};
