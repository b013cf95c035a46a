use super::*;
use crate::backend::{BackendCall, HostMemoryBackend};
use crate::buffer::{BufferUsage, DataShape};

type Block = [u32; 4];

fn setup(frames_in_flight: u32) -> (HostMemoryBackend, BufferAllocator) {
    let backend = HostMemoryBackend::new();
    let allocator = BufferAllocator::new(
        Arc::new(backend.clone()),
        AllocatorConfig::with_frames_in_flight(frames_in_flight),
    ).unwrap();
    (backend, allocator)
}

fn constant(lifetime: LifetimeType) -> BufferParams {
    BufferParams::constant(lifetime, BufferUsage::default())
}

fn structured(lifetime: LifetimeType, element_count: u32) -> BufferParams {
    BufferParams::structured(lifetime, BufferUsage::default(), element_count)
}

fn run_frame(allocator: &BufferAllocator, frame: u64) -> usize {
    allocator.begin_frame(frame).unwrap();
    let updates = allocator.buffer_data().unwrap();
    allocator.end_frame().unwrap();
    updates
}

// ============================================================================
// Construction
// ============================================================================

#[test]
fn test_new_rejects_zero_frames_in_flight() {
    let result = BufferAllocator::new(
        Arc::new(HostMemoryBackend::new()),
        AllocatorConfig::with_frames_in_flight(0),
    );
    assert!(matches!(result, Err(Error::InitializationFailed(_))));
}

#[test]
fn test_new_allocator_is_idle() {
    let (_, allocator) = setup(2);
    assert_eq!(allocator.frames_in_flight(), 2);
    assert_eq!(allocator.current_frame().unwrap(), None);
    let stats = allocator.stats().unwrap();
    assert_eq!(stats.frame, None);
    assert_eq!(stats.mutable_buffers + stats.immutable_buffers + stats.single_frame_buffers, 0);
    assert_eq!(stats.single_frame_capacity, 1 << 20);
}

// ============================================================================
// Allocation
// ============================================================================

#[test]
fn test_allocate_creates_backend_buffer() {
    let (backend, allocator) = setup(3);
    let mutable = allocator.allocate::<Block>(constant(LifetimeType::Mutable)).unwrap();
    let immutable = allocator.allocate::<u32>(structured(LifetimeType::Immutable, 8)).unwrap();

    assert_eq!(backend.copy_count(mutable.key()), 3);
    assert_eq!(backend.copy_count(immutable.key()), 1);
    assert_eq!(backend.calls()[0], BackendCall::Create {
        key: mutable.key(),
        size: 16,
        copy_count: 3,
    });
    assert_eq!(allocator.metadata(immutable.key()).unwrap().byte_count, 32);
}

#[test]
fn test_allocate_rejects_invalid_params() {
    let (backend, allocator) = setup(2);
    let params = BufferParams {
        lifetime: LifetimeType::Mutable,
        shape: DataShape::Constant,
        element_count: 4,
        usage: BufferUsage::default(),
    };
    let result = allocator.allocate::<u32>(params);
    assert!(matches!(result, Err(Error::InvalidParams(_))));
    assert_eq!(backend.live_buffer_count(), 0);
}

#[test]
fn test_allocate_zero_sized_type_rejected() {
    let (_, allocator) = setup(2);
    let result = allocator.allocate::<()>(constant(LifetimeType::Mutable));
    assert!(matches!(result, Err(Error::InvalidParams(_))));
}

#[test]
fn test_ticket_counts_external_refs() {
    let (_, allocator) = setup(2);
    let ticket = allocator.allocate::<u32>(constant(LifetimeType::Mutable)).unwrap();
    assert_eq!(allocator.external_ref_count(ticket.key()).unwrap(), 1);
    let clone = Arc::clone(&ticket);
    assert_eq!(allocator.external_ref_count(ticket.key()).unwrap(), 2);
    drop(clone);
    assert_eq!(allocator.external_ref_count(ticket.key()).unwrap(), 1);
}

// ============================================================================
// Commits
// ============================================================================

#[test]
fn test_commit_before_first_frame_rejected() {
    let (_, allocator) = setup(2);
    let ticket = allocator.allocate::<u32>(constant(LifetimeType::Mutable)).unwrap();
    let result = allocator.commit(ticket.key(), &[1u32]);
    assert!(matches!(result, Err(Error::FrameOrder(_))));
}

#[test]
fn test_commit_type_mismatch() {
    let (_, allocator) = setup(2);
    allocator.begin_frame(0).unwrap();
    let ticket = allocator.allocate::<u32>(constant(LifetimeType::Mutable)).unwrap();
    let result = allocator.commit(ticket.key(), &[1.0f32]);
    assert!(matches!(result, Err(Error::TypeMismatch { expected: "u32", found: "f32" })));
}

#[test]
fn test_commit_length_checked() {
    let (_, allocator) = setup(2);
    allocator.begin_frame(0).unwrap();
    let ticket = allocator.allocate::<u32>(structured(LifetimeType::Mutable, 4)).unwrap();

    let result = allocator.commit(ticket.key(), &[0u32; 5]);
    assert_eq!(result, Err(Error::OutOfBounds { offset: 0, size: 20, buffer_size: 16 }));

    let result = allocator.commit(ticket.key(), &[0u32; 3]);
    assert!(matches!(result, Err(Error::InvalidCommit(_))));
    assert_eq!(allocator.stats().unwrap().dirty_buffers, 0);
}

#[test]
fn test_commit_writes_pool_bytes() {
    let (_, allocator) = setup(2);
    allocator.begin_frame(0).unwrap();
    let ticket = allocator.allocate::<u32>(structured(LifetimeType::Mutable, 2)).unwrap();
    allocator.commit(ticket.key(), &[1u32, 2]).unwrap();

    let bytes = allocator.with_data(ticket.key(), |bytes| bytes.to_vec()).unwrap();
    assert_eq!(bytes, bytemuck::cast_slice::<u32, u8>(&[1, 2]));
    assert_eq!(allocator.stats().unwrap().dirty_buffers, 1);
}

#[test]
fn test_immutable_second_commit_rejected() {
    let (_, allocator) = setup(2);
    allocator.begin_frame(0).unwrap();
    let ticket = allocator.allocate::<u32>(constant(LifetimeType::Immutable)).unwrap();
    allocator.commit(ticket.key(), &[7u32]).unwrap();

    let result = allocator.commit(ticket.key(), &[8u32]);
    assert!(matches!(result, Err(Error::InvalidCommit(_))));
    let value = allocator.with_data(ticket.key(), |bytes| bytes.to_vec()).unwrap();
    assert_eq!(value, 7u32.to_ne_bytes());
}

#[test]
fn test_partial_commit_requires_mutable_structured() {
    let (_, allocator) = setup(2);
    allocator.begin_frame(0).unwrap();
    let constant_buffer = allocator.allocate::<u32>(constant(LifetimeType::Mutable)).unwrap();
    let immutable = allocator.allocate::<u32>(structured(LifetimeType::Immutable, 4)).unwrap();
    let single_frame = allocator.allocate::<u32>(structured(LifetimeType::SingleFrame, 4)).unwrap();

    for key in [constant_buffer.key(), immutable.key(), single_frame.key()] {
        let result = allocator.commit_partial(key, &[1u32], 0);
        assert!(matches!(result, Err(Error::InvalidCommit(_))));
    }
}

#[test]
fn test_partial_commit_out_of_bounds() {
    let (_, allocator) = setup(2);
    allocator.begin_frame(0).unwrap();
    let ticket = allocator.allocate::<u32>(structured(LifetimeType::Mutable, 4)).unwrap();
    let result = allocator.commit_partial(ticket.key(), &[1u32, 2], 3);
    assert_eq!(result, Err(Error::OutOfBounds { offset: 12, size: 8, buffer_size: 16 }));
}

#[test]
fn test_partial_commit_tracks_interval() {
    let (_, allocator) = setup(2);
    allocator.begin_frame(0).unwrap();
    let ticket = allocator.allocate::<u32>(structured(LifetimeType::Mutable, 8)).unwrap();
    allocator.commit_partial(ticket.key(), &[5u32, 6], 2).unwrap();

    let stats = allocator.stats().unwrap();
    assert_eq!(stats.pending_intervals, 1);
    assert_eq!(stats.dirty_buffers, 1);
    let bytes = allocator.with_data(ticket.key(), |bytes| bytes.to_vec()).unwrap();
    assert_eq!(&bytes[8..16], bytemuck::cast_slice::<u32, u8>(&[5, 6]));
}

#[test]
fn test_empty_partial_commit_is_noop() {
    let (_, allocator) = setup(2);
    allocator.begin_frame(0).unwrap();
    let ticket = allocator.allocate::<u32>(structured(LifetimeType::Mutable, 4)).unwrap();
    allocator.commit_partial::<u32>(ticket.key(), &[], 4).unwrap();
    assert_eq!(allocator.stats().unwrap().dirty_buffers, 0);
}

// ============================================================================
// Flush
// ============================================================================

#[test]
fn test_mutable_flush_reaches_every_copy() {
    let (backend, allocator) = setup(3);
    let ticket = allocator.allocate::<Block>(constant(LifetimeType::Mutable)).unwrap();
    let key = ticket.key();
    backend.take_calls();

    allocator.begin_frame(0).unwrap();
    allocator.commit(key, &[[1u32, 2, 3, 4]]).unwrap();
    assert_eq!(allocator.buffer_data().unwrap(), 1);
    allocator.end_frame().unwrap();
    assert_eq!(run_frame(&allocator, 1), 1);
    assert_eq!(run_frame(&allocator, 2), 1);
    assert_eq!(run_frame(&allocator, 3), 0);

    let expected: Vec<u8> = bytemuck::cast_slice::<u32, u8>(&[1, 2, 3, 4]).to_vec();
    let copies: Vec<u32> = backend.calls().iter().map(|call| match call {
        BackendCall::Update { copy_index, offset, data, .. } => {
            assert_eq!(*offset, 0);
            assert_eq!(data, &expected);
            *copy_index
        }
        other => panic!("unexpected backend call {:?}", other),
    }).collect();
    assert_eq!(copies, vec![0, 1, 2]);
    assert_eq!(allocator.stats().unwrap().dirty_buffers, 0);
}

#[test]
fn test_immutable_flushes_once() {
    let (backend, allocator) = setup(2);
    allocator.begin_frame(0).unwrap();
    let ticket = allocator.allocate::<u32>(structured(LifetimeType::Immutable, 2)).unwrap();
    allocator.commit(ticket.key(), &[9u32, 10]).unwrap();
    assert_eq!(allocator.buffer_data().unwrap(), 1);
    allocator.end_frame().unwrap();
    assert_eq!(run_frame(&allocator, 1), 0);

    assert_eq!(
        backend.copy_data(ticket.key(), 0).unwrap(),
        bytemuck::cast_slice::<u32, u8>(&[9, 10])
    );
}

#[test]
fn test_flush_without_dirty_buffers_is_silent() {
    let (backend, allocator) = setup(2);
    allocator.allocate::<u32>(constant(LifetimeType::Mutable)).unwrap();
    backend.take_calls();
    assert_eq!(run_frame(&allocator, 0), 0);
    assert!(backend.calls().is_empty());
}

#[test]
fn test_flush_before_first_frame_rejected() {
    let (_, allocator) = setup(2);
    assert!(matches!(allocator.buffer_data(), Err(Error::FrameOrder(_))));
}

#[test]
fn test_backend_failure_keeps_buffer_dirty() {
    let (backend, allocator) = setup(2);
    allocator.begin_frame(0).unwrap();
    let ticket = allocator.allocate::<u32>(constant(LifetimeType::Immutable)).unwrap();
    allocator.commit(ticket.key(), &[3u32]).unwrap();

    backend.set_fail_updates(true);
    assert!(matches!(allocator.buffer_data(), Err(Error::BackendError(_))));
    assert_eq!(allocator.stats().unwrap().dirty_buffers, 1);

    // Unflushed buffers go out with the next frame
    allocator.end_frame().unwrap();
    backend.set_fail_updates(false);
    assert_eq!(run_frame(&allocator, 1), 1);
    assert_eq!(allocator.stats().unwrap().dirty_buffers, 0);
}

#[test]
fn test_flush_twice_in_one_frame_rejected() {
    let (_, allocator) = setup(2);
    allocator.begin_frame(0).unwrap();
    allocator.buffer_data().unwrap();
    assert!(matches!(allocator.buffer_data(), Err(Error::FrameOrder(_))));
    allocator.end_frame().unwrap();
    assert_eq!(run_frame(&allocator, 1), 0);
}

#[test]
fn test_flush_outside_open_frame_rejected() {
    let (_, allocator) = setup(2);
    run_frame(&allocator, 0);
    assert!(matches!(allocator.buffer_data(), Err(Error::FrameOrder(_))));
}

#[test]
fn test_rejected_second_flush_leaves_no_copy_stale() {
    let (backend, allocator) = setup(2);
    allocator.begin_frame(0).unwrap();
    let ticket = allocator.allocate::<[u8; 16]>(constant(LifetimeType::Mutable)).unwrap();
    allocator.commit(ticket.key(), &[[7u8; 16]]).unwrap();
    assert_eq!(allocator.buffer_data().unwrap(), 1);
    assert!(allocator.buffer_data().is_err());
    allocator.end_frame().unwrap();

    for frame in 1..5 {
        run_frame(&allocator, frame);
    }
    for copy in 0..2 {
        assert_eq!(backend.copy_data(ticket.key(), copy).unwrap(), vec![7u8; 16]);
    }
}

// ============================================================================
// Deallocation
// ============================================================================

#[test]
fn test_deallocate_defers_destroy() {
    let (backend, allocator) = setup(2);
    let ticket = allocator.allocate::<u32>(constant(LifetimeType::Mutable)).unwrap();
    let key = ticket.key();
    run_frame(&allocator, 0);

    allocator.begin_frame(1).unwrap();
    allocator.deallocate(key).unwrap();
    assert!(!allocator.is_live(key).unwrap());
    allocator.end_frame().unwrap();

    for frame in 2..=3 {
        run_frame(&allocator, frame);
        assert_eq!(backend.destroy_count(key), 0, "destroyed too early at frame {}", frame);
    }
    run_frame(&allocator, 4);
    assert_eq!(backend.destroy_count(key), 1);
    run_frame(&allocator, 5);
    assert_eq!(backend.destroy_count(key), 1);
}

#[test]
fn test_deallocate_twice_is_stale() {
    let (_, allocator) = setup(2);
    let ticket = allocator.allocate::<u32>(constant(LifetimeType::Mutable)).unwrap();
    allocator.deallocate(ticket.key()).unwrap();
    assert_eq!(allocator.deallocate(ticket.key()), Err(Error::StaleHandle));
    assert_eq!(allocator.stats().unwrap().pending_deletions, 1);
}

#[test]
fn test_swap_and_pop_keeps_moved_buffer_addressable() {
    let (_, allocator) = setup(2);
    allocator.begin_frame(0).unwrap();
    let first = allocator.allocate::<u32>(constant(LifetimeType::Mutable)).unwrap();
    let second = allocator.allocate::<u32>(constant(LifetimeType::Mutable)).unwrap();
    let third = allocator.allocate::<u32>(constant(LifetimeType::Mutable)).unwrap();

    allocator.deallocate(first.key()).unwrap();
    assert_eq!(allocator.metadata(third.key()).unwrap().pool_index, 0);

    allocator.commit(third.key(), &[33u32]).unwrap();
    allocator.commit(second.key(), &[22u32]).unwrap();
    assert_eq!(allocator.with_data(third.key(), |b| b.to_vec()).unwrap(), 33u32.to_ne_bytes());
    assert_eq!(allocator.with_data(second.key(), |b| b.to_vec()).unwrap(), 22u32.to_ne_bytes());
}

#[test]
fn test_deallocate_removes_from_dirty_set() {
    let (_, allocator) = setup(2);
    allocator.begin_frame(0).unwrap();
    let ticket = allocator.allocate::<u32>(constant(LifetimeType::Mutable)).unwrap();
    allocator.commit(ticket.key(), &[1u32]).unwrap();
    allocator.deallocate(ticket.key()).unwrap();
    assert_eq!(allocator.buffer_data().unwrap(), 0);
}

// ============================================================================
// SingleFrame
// ============================================================================

#[test]
fn test_single_frame_reclaimed_at_end_frame() {
    let (backend, allocator) = setup(2);
    allocator.begin_frame(5).unwrap();
    let ticket = allocator.allocate::<u32>(constant(LifetimeType::SingleFrame)).unwrap();
    let key = ticket.key();
    allocator.commit(key, &[1u32]).unwrap();
    assert_eq!(allocator.buffer_data().unwrap(), 1);
    drop(ticket);
    allocator.end_frame().unwrap();

    assert!(!allocator.is_live(key).unwrap());
    let stats = allocator.stats().unwrap();
    assert_eq!(stats.single_frame_buffers, 0);
    assert_eq!(stats.single_frame_bytes_used, 0);
    assert_eq!(stats.pending_deletions, 1);

    for frame in 6..=7 {
        run_frame(&allocator, frame);
    }
    assert_eq!(backend.destroy_count(key), 0);
    run_frame(&allocator, 8);
    assert_eq!(backend.destroy_count(key), 1);
}

#[test]
fn test_single_frame_leak_reported() {
    let (_, allocator) = setup(2);
    allocator.begin_frame(0).unwrap();
    let ticket = allocator.allocate::<u32>(constant(LifetimeType::SingleFrame)).unwrap();

    assert_eq!(allocator.end_frame(), Err(Error::SingleFrameLeak { count: 1 }));

    // Reclaimed anyway; the leaked handle is stale
    allocator.begin_frame(1).unwrap();
    assert_eq!(allocator.commit(ticket.key(), &[1u32]), Err(Error::StaleHandle));
    allocator.end_frame().unwrap();
}

#[test]
fn test_single_frame_pool_ceiling() {
    let backend = HostMemoryBackend::new();
    let config = AllocatorConfig {
        frames_in_flight: 2,
        single_frame_initial_capacity: 16,
        single_frame_max_capacity: Some(16),
    };
    let allocator = BufferAllocator::new(Arc::new(backend.clone()), config).unwrap();
    allocator.begin_frame(0).unwrap();
    let _first = allocator.allocate::<u32>(structured(LifetimeType::SingleFrame, 4)).unwrap();
    let result = allocator.allocate::<u32>(constant(LifetimeType::SingleFrame));
    assert_eq!(result.map(|_| ()), Err(Error::PoolExhausted { requested: 4, used: 16, limit: 16 }));
    assert_eq!(backend.live_buffer_count(), 1);
}

// ============================================================================
// Frame lifecycle
// ============================================================================

#[test]
fn test_begin_frame_requires_end_frame() {
    let (_, allocator) = setup(2);
    allocator.begin_frame(0).unwrap();
    assert!(matches!(allocator.begin_frame(1), Err(Error::FrameOrder(_))));
}

#[test]
fn test_begin_frame_requires_consecutive_numbers() {
    let (_, allocator) = setup(2);
    run_frame(&allocator, 4);
    assert!(matches!(allocator.begin_frame(4), Err(Error::FrameOrder(_))));
    assert!(matches!(allocator.begin_frame(2), Err(Error::FrameOrder(_))));
    assert!(matches!(allocator.begin_frame(7), Err(Error::FrameOrder(_))));
    allocator.begin_frame(5).unwrap();
    assert_eq!(allocator.write_index().unwrap(), 1);
    assert_eq!(allocator.current_frame().unwrap(), Some(5));
}

#[test]
fn test_end_frame_without_begin_frame() {
    let (_, allocator) = setup(2);
    assert!(matches!(allocator.end_frame(), Err(Error::FrameOrder(_))));
    run_frame(&allocator, 0);
    assert!(matches!(allocator.end_frame(), Err(Error::FrameOrder(_))));
}

#[test]
fn test_clear_deferred_deletions_before_first_frame() {
    let (_, allocator) = setup(2);
    assert!(matches!(allocator.clear_deferred_deletions(0), Err(Error::FrameOrder(_))));
}

// ============================================================================
// Shutdown
// ============================================================================

#[test]
fn test_shutdown_destroys_everything() {
    let (backend, allocator) = setup(2);
    allocator.begin_frame(0).unwrap();
    let live = allocator.allocate::<u32>(constant(LifetimeType::Mutable)).unwrap();
    let released = allocator.allocate::<u32>(constant(LifetimeType::Immutable)).unwrap();
    allocator.deallocate(released.key()).unwrap();

    allocator.shutdown().unwrap();
    assert_eq!(backend.live_buffer_count(), 0);
    assert_eq!(backend.destroy_count(live.key()), 1);
    assert_eq!(backend.destroy_count(released.key()), 1);
    assert!(!allocator.is_live(live.key()).unwrap());

    // Idempotent, including the implicit shutdown on drop
    allocator.shutdown().unwrap();
    drop(allocator);
    assert_eq!(backend.destroy_count(live.key()), 1);
}

#[test]
fn test_allocate_after_shutdown_rejected() {
    let (backend, allocator) = setup(2);
    allocator.shutdown().unwrap();
    assert!(matches!(
        allocator.allocate::<u32>(constant(LifetimeType::Mutable)),
        Err(Error::ShutDown)
    ));
    drop(allocator);
    assert_eq!(backend.live_buffer_count(), 0);
    assert!(backend.calls().iter().all(|call| !matches!(call, BackendCall::Create { .. })));
}

#[test]
fn test_commit_after_shutdown_rejected() {
    let (_, allocator) = setup(2);
    allocator.begin_frame(0).unwrap();
    let ticket = allocator.allocate::<u32>(structured(LifetimeType::Mutable, 4)).unwrap();
    allocator.shutdown().unwrap();
    assert_eq!(allocator.commit(ticket.key(), &[1u32, 2, 3, 4]), Err(Error::ShutDown));
    assert_eq!(allocator.commit_partial(ticket.key(), &[1u32], 2), Err(Error::ShutDown));
}

#[test]
fn test_drop_releases_backend_buffers() {
    let (backend, allocator) = setup(3);
    allocator.allocate::<Block>(constant(LifetimeType::Mutable)).unwrap();
    allocator.allocate::<u32>(structured(LifetimeType::Immutable, 16)).unwrap();
    assert_eq!(backend.live_buffer_count(), 2);
    drop(allocator);
    assert_eq!(backend.live_buffer_count(), 0);
}
