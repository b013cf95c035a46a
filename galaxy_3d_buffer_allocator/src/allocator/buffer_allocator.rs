/// Buffer allocator core.
///
/// Routes buffers to their lifetime pool, records dirty and partial-commit
/// state, flushes pool bytes to the injected backend once per frame and
/// defers physical destruction until the frames in flight are done with it.
///
/// Threading: any number of producer threads may allocate, commit and
/// deallocate concurrently. A single render thread calls `begin_frame`,
/// `buffer_data` and `end_frame`, never concurrently with each other.
/// Lock order: frame state → registry → pool → dirty set → deletion queue.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use bytemuck::Pod;
use rustc_hash::FxHashSet;
use slotmap::SlotMap;
use crate::allocator::commit_metadata::{
    BufferKey, BufferRecord, BufferTicket, CommitMetadata, TypeFingerprint,
};
use crate::allocator::deferred_deletion::DeferredDeletionQueue;
use crate::allocator::pool::{ImmutablePool, MutablePool, SingleFramePool};
use crate::backend::{BackendBufferDesc, BufferBackend};
use crate::buffer::{BufferParams, LifetimeType};
use crate::config::AllocatorConfig;
use crate::error::{Error, Result};
use crate::{engine_debug, engine_info, engine_trace, engine_warn};

const SOURCE: &str = "galaxy3d::BufferAllocator";

// ===== LOCK HELPERS =====

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &'static str) -> Result<MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| Error::LockPoisoned(what).logged(SOURCE))
}

fn read<'a, T>(rw: &'a RwLock<T>, what: &'static str) -> Result<RwLockReadGuard<'a, T>> {
    rw.read().map_err(|_| Error::LockPoisoned(what).logged(SOURCE))
}

fn write<'a, T>(rw: &'a RwLock<T>, what: &'static str) -> Result<RwLockWriteGuard<'a, T>> {
    rw.write().map_err(|_| Error::LockPoisoned(what).logged(SOURCE))
}

// ===== FRAME STATE =====

#[derive(Debug, Clone, Copy, Default)]
struct FrameState {
    /// Last frame passed to begin_frame (None before the first frame)
    current: Option<u64>,
    /// Mutable copy written this frame (`current % frames_in_flight`)
    write_index: usize,
    /// Between begin_frame and end_frame
    recording: bool,
    /// buffer_data already ran this frame
    flushed: bool,
}

// ===== STATS =====

/// Allocator statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Current frame (None before the first begin_frame)
    pub frame: Option<u64>,
    /// Live Mutable buffers
    pub mutable_buffers: usize,
    /// Live Immutable buffers
    pub immutable_buffers: usize,
    /// Live SingleFrame buffers
    pub single_frame_buffers: usize,
    /// Bytes handed out by the SingleFrame pool this frame
    pub single_frame_bytes_used: usize,
    /// Current SingleFrame pool capacity in bytes
    pub single_frame_capacity: usize,
    /// Buffers waiting for the next flush
    pub dirty_buffers: usize,
    /// Partial-commit intervals not yet propagated to every copy
    pub pending_intervals: usize,
    /// Backend buffers waiting in the deferred deletion queue
    pub pending_deletions: usize,
    /// Bytes held by the Immutable pool
    pub immutable_bytes: usize,
    /// Backend updates issued by the last buffer_data call
    pub last_flush_updates: usize,
}

// ===== BUFFER ALLOCATOR =====

/// Frame-aware GPU buffer allocator
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use galaxy_3d_buffer_allocator::galaxy3d::{AllocatorConfig, BufferAllocator};
/// use galaxy_3d_buffer_allocator::galaxy3d::backend::HostMemoryBackend;
///
/// let allocator = Arc::new(BufferAllocator::new(
///     Arc::new(HostMemoryBackend::new()),
///     AllocatorConfig::default(),
/// )?);
///
/// allocator.begin_frame(0)?;
/// // ... producers create and commit buffers ...
/// allocator.buffer_data()?;
/// allocator.end_frame()?;
/// # Ok::<(), galaxy_3d_buffer_allocator::galaxy3d::Error>(())
/// ```
pub struct BufferAllocator {
    backend: Arc<dyn BufferBackend>,
    config: AllocatorConfig,
    frame: RwLock<FrameState>,
    registry: RwLock<SlotMap<BufferKey, BufferRecord>>,
    mutable_pool: Mutex<MutablePool>,
    immutable_pool: Mutex<ImmutablePool>,
    single_frame_pool: Mutex<SingleFramePool>,
    dirty: Mutex<FxHashSet<BufferKey>>,
    deletions: Mutex<DeferredDeletionQueue>,
    last_flush_updates: AtomicUsize,
    shut_down: AtomicBool,
}

impl BufferAllocator {
    /// Create an allocator driving `backend`
    ///
    /// # Errors
    ///
    /// Returns `Error::InitializationFailed` if the configuration is invalid.
    pub fn new(backend: Arc<dyn BufferBackend>, config: AllocatorConfig) -> Result<Self> {
        config.validate().map_err(|error| error.logged(SOURCE))?;

        let frames_in_flight = config.frames_in_flight;
        let allocator = Self {
            backend,
            frame: RwLock::new(FrameState::default()),
            registry: RwLock::new(SlotMap::with_key()),
            mutable_pool: Mutex::new(MutablePool::new(frames_in_flight)),
            immutable_pool: Mutex::new(ImmutablePool::new()),
            single_frame_pool: Mutex::new(SingleFramePool::new(
                config.single_frame_initial_capacity,
                config.single_frame_max_capacity,
            )),
            dirty: Mutex::new(FxHashSet::default()),
            deletions: Mutex::new(DeferredDeletionQueue::new(frames_in_flight)),
            last_flush_updates: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
            config,
        };

        engine_info!(SOURCE, "Buffer allocator created ({} frames in flight)", frames_in_flight);
        Ok(allocator)
    }

    // ===== ACCESSORS =====

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn frames_in_flight(&self) -> u32 {
        self.config.frames_in_flight
    }

    /// Last frame passed to `begin_frame`
    pub fn current_frame(&self) -> Result<Option<u64>> {
        Ok(read(&self.frame, "frame state")?.current)
    }

    /// Mutable copy written (and flushed) this frame
    pub fn write_index(&self) -> Result<usize> {
        Ok(read(&self.frame, "frame state")?.write_index)
    }

    /// Whether `key` refers to a live buffer
    pub fn is_live(&self, key: BufferKey) -> Result<bool> {
        Ok(read(&self.registry, "registry")?.contains_key(key))
    }

    /// Pool location and size of a live buffer
    pub fn metadata(&self, key: BufferKey) -> Result<CommitMetadata> {
        let registry = read(&self.registry, "registry")?;
        let record = registry.get(key).ok_or_else(|| Error::StaleHandle.logged(SOURCE))?;
        Ok(record.metadata)
    }

    /// Number of facade handles alive for `key` (the allocator's own reference excluded)
    pub fn external_ref_count(&self, key: BufferKey) -> Result<usize> {
        let registry = read(&self.registry, "registry")?;
        let record = registry.get(key).ok_or_else(|| Error::StaleHandle.logged(SOURCE))?;
        Ok(record.external_refs())
    }

    // ===== ALLOCATION =====

    /// Register a buffer of `T` elements and reserve zeroed pool storage
    ///
    /// The backend buffer is created immediately. Returns the shared ticket
    /// the facade hands out to callers.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidParams` if the params break a usage/shape invariant
    /// - `Error::ShutDown` after `shutdown`
    /// - `Error::PoolExhausted` if the SingleFrame pool hit its ceiling
    /// - any error returned by the backend
    pub fn allocate<T: Pod>(&self, params: BufferParams) -> Result<Arc<BufferTicket>> {
        params.validate()?;
        let fingerprint = TypeFingerprint::of::<T>();
        if fingerprint.size == 0 {
            return Err(Error::InvalidParams(format!(
                "element type '{}' is zero-sized", fingerprint.name
            )).logged(SOURCE));
        }
        let byte_count = fingerprint.size
            .checked_mul(params.element_count as usize)
            .ok_or_else(|| Error::InvalidParams(format!(
                "{} elements of '{}' overflow the address space",
                params.element_count, fingerprint.name
            )).logged(SOURCE))?;

        let mut registry = write(&self.registry, "registry")?;
        self.ensure_running()?;
        let key = registry.try_insert_with_key(|key| -> Result<BufferRecord> {
            let pool_index = self.pool_allocate(params.lifetime, key, byte_count)?;
            let desc = BackendBufferDesc {
                key,
                size: byte_count as u64,
                params,
                copy_count: params.copy_count(self.config.frames_in_flight),
            };
            let backend_buffer = match self.backend.create_buffer(&desc) {
                Ok(buffer) => buffer,
                Err(error) => {
                    // Fresh entry is last in its pool, nothing moves
                    self.pool_deallocate(params.lifetime, pool_index)?;
                    return Err(error.logged(SOURCE));
                }
            };
            Ok(BufferRecord {
                metadata: CommitMetadata {
                    lifetime: params.lifetime,
                    pool_index,
                    byte_count,
                },
                params,
                fingerprint,
                backend_buffer,
                ticket: Arc::new(BufferTicket { key }),
                committed: AtomicBool::new(false),
            })
        })?;

        let ticket = Arc::clone(&registry[key].ticket);
        engine_debug!(SOURCE, "Allocated {:?} buffer {:?} ({} x '{}', {} bytes)",
            params.lifetime, key, params.element_count, fingerprint.name, byte_count);
        Ok(ticket)
    }

    /// Rejects calls made after shutdown, whose buffers nothing would release
    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::ShutDown.logged(SOURCE));
        }
        Ok(())
    }

    fn pool_allocate(&self, lifetime: LifetimeType, key: BufferKey, num_bytes: usize) -> Result<usize> {
        match lifetime {
            LifetimeType::Mutable => {
                Ok(lock(&self.mutable_pool, "Mutable pool")?.allocate(key, num_bytes))
            }
            LifetimeType::Immutable => {
                Ok(lock(&self.immutable_pool, "Immutable pool")?.allocate(key, num_bytes))
            }
            LifetimeType::SingleFrame => lock(&self.single_frame_pool, "SingleFrame pool")?
                .allocate(key, num_bytes)
                .map_err(|error| error.logged(SOURCE)),
        }
    }

    fn pool_deallocate(&self, lifetime: LifetimeType, index: usize) -> Result<Option<BufferKey>> {
        Ok(match lifetime {
            LifetimeType::Mutable => {
                lock(&self.mutable_pool, "Mutable pool")?.deallocate(index)
            }
            LifetimeType::Immutable => {
                lock(&self.immutable_pool, "Immutable pool")?.deallocate(index)
            }
            LifetimeType::SingleFrame => {
                lock(&self.single_frame_pool, "SingleFrame pool")?.deallocate(index)
            }
        })
    }

    /// Release a buffer
    ///
    /// Pool storage is freed at once (swap-and-pop); the backend buffer goes
    /// to the deferred deletion queue tagged with the current frame.
    ///
    /// # Errors
    ///
    /// Returns `Error::StaleHandle` if the buffer was already released.
    pub fn deallocate(&self, key: BufferKey) -> Result<()> {
        let frame = read(&self.frame, "frame state")?.current.unwrap_or(0);

        let mut registry = write(&self.registry, "registry")?;
        let record = registry.remove(key).ok_or_else(|| Error::StaleHandle.logged(SOURCE))?;
        let index = record.metadata.pool_index;
        if let Some(moved) = self.pool_deallocate(record.metadata.lifetime, index)? {
            registry[moved].metadata.pool_index = index;
        }
        lock(&self.dirty, "dirty set")?.remove(&key);
        lock(&self.deletions, "deletion queue")?.push(frame, key, record.backend_buffer);

        engine_debug!(SOURCE, "Deallocated {:?} buffer {:?} in frame {}",
            record.metadata.lifetime, key, frame);
        Ok(())
    }

    // ===== COMMITS =====

    /// Frame state guard held for a whole commit, so begin_frame cannot move
    /// the write index between the slot choice and the write
    fn committing_frame(&self) -> Result<RwLockReadGuard<'_, FrameState>> {
        let state = read(&self.frame, "frame state")?;
        if state.current.is_none() {
            return Err(Error::FrameOrder(
                "commit before the first begin_frame".to_string()
            ).logged(SOURCE));
        }
        Ok(state)
    }

    fn check_fingerprint<T: Pod>(record: &BufferRecord) -> Result<()> {
        if !record.fingerprint.matches::<T>() {
            return Err(Error::TypeMismatch {
                expected: record.fingerprint.name,
                found: std::any::type_name::<T>(),
            }.logged(SOURCE));
        }
        Ok(())
    }

    /// Overwrite the whole buffer
    ///
    /// `data` must hold exactly `element_count` elements of the type the
    /// buffer was created with. An empty `data` is ignored.
    ///
    /// # Errors
    ///
    /// - `Error::FrameOrder` before the first frame
    /// - `Error::ShutDown` after `shutdown`
    /// - `Error::StaleHandle` for a released buffer
    /// - `Error::TypeMismatch` if `T` is not the creation type
    /// - `Error::OutOfBounds` / `Error::InvalidCommit` on a size mismatch
    /// - `Error::InvalidCommit` on a second commit to an Immutable buffer
    pub fn commit<T: Pod>(&self, key: BufferKey, data: &[T]) -> Result<()> {
        let frame = self.committing_frame()?;
        let registry = read(&self.registry, "registry")?;
        self.ensure_running()?;
        let record = registry.get(key).ok_or_else(|| Error::StaleHandle.logged(SOURCE))?;
        Self::check_fingerprint::<T>(record)?;

        let bytes: &[u8] = bytemuck::cast_slice(data);
        let metadata = record.metadata;
        if bytes.is_empty() {
            engine_trace!(SOURCE, "Ignored empty commit to {:?}", key);
            return Ok(());
        }
        if bytes.len() > metadata.byte_count {
            return Err(Error::OutOfBounds {
                offset: 0,
                size: bytes.len() as u64,
                buffer_size: metadata.byte_count as u64,
            }.logged(SOURCE));
        }
        if bytes.len() < metadata.byte_count {
            return Err(Error::InvalidCommit(format!(
                "full commit of {} bytes to a {} byte buffer, use a partial commit",
                bytes.len(), metadata.byte_count
            )).logged(SOURCE));
        }

        match metadata.lifetime {
            LifetimeType::Mutable => {
                lock(&self.mutable_pool, "Mutable pool")?
                    .commit(metadata.pool_index, frame.write_index, bytes);
            }
            LifetimeType::Immutable => {
                if record.committed.swap(true, Ordering::AcqRel) {
                    return Err(Error::InvalidCommit(format!(
                        "Immutable buffer {:?} is already committed", key
                    )).logged(SOURCE));
                }
                lock(&self.immutable_pool, "Immutable pool")?
                    .commit(metadata.pool_index, bytes);
            }
            LifetimeType::SingleFrame => {
                lock(&self.single_frame_pool, "SingleFrame pool")?
                    .commit(metadata.pool_index, bytes);
            }
        }
        lock(&self.dirty, "dirty set")?.insert(key);

        engine_trace!(SOURCE, "Committed {} bytes to {:?}", bytes.len(), key);
        Ok(())
    }

    /// Overwrite `data.len()` elements starting at element `base_index`
    ///
    /// Only Mutable + Structured buffers accept partial commits. A partial
    /// commit covering the whole buffer behaves like `commit`.
    ///
    /// # Errors
    ///
    /// - `Error::FrameOrder` before the first frame
    /// - `Error::ShutDown` after `shutdown`
    /// - `Error::StaleHandle` for a released buffer
    /// - `Error::TypeMismatch` if `T` is not the creation type
    /// - `Error::InvalidCommit` on a non-Mutable or non-Structured buffer
    /// - `Error::OutOfBounds` if the range ends past the buffer
    pub fn commit_partial<T: Pod>(&self, key: BufferKey, data: &[T], base_index: u32) -> Result<()> {
        let frame = self.committing_frame()?;
        let registry = read(&self.registry, "registry")?;
        self.ensure_running()?;
        let record = registry.get(key).ok_or_else(|| Error::StaleHandle.logged(SOURCE))?;
        Self::check_fingerprint::<T>(record)?;

        if !record.params.supports_partial_commit() {
            return Err(Error::InvalidCommit(format!(
                "partial commit on a {:?} {:?} buffer, only Mutable Structured buffers accept them",
                record.params.lifetime, record.params.shape
            )).logged(SOURCE));
        }

        let bytes: &[u8] = bytemuck::cast_slice(data);
        let metadata = record.metadata;
        let base_offset = base_index as usize * record.fingerprint.size;
        if base_offset + bytes.len() > metadata.byte_count {
            return Err(Error::OutOfBounds {
                offset: base_offset as u64,
                size: bytes.len() as u64,
                buffer_size: metadata.byte_count as u64,
            }.logged(SOURCE));
        }
        if bytes.is_empty() {
            engine_trace!(SOURCE, "Ignored empty partial commit to {:?}", key);
            return Ok(());
        }

        {
            let mut pool = lock(&self.mutable_pool, "Mutable pool")?;
            if base_offset == 0 && bytes.len() == metadata.byte_count {
                pool.commit(metadata.pool_index, frame.write_index, bytes);
            } else {
                pool.commit_partial(metadata.pool_index, frame.write_index, base_offset, bytes);
            }
        }
        lock(&self.dirty, "dirty set")?.insert(key);

        engine_trace!(SOURCE, "Committed {} bytes at offset {} to {:?}",
            bytes.len(), base_offset, key);
        Ok(())
    }

    /// Run `f` on the bytes of the buffer's current read slot
    ///
    /// For Mutable buffers this is the copy of the current write index, which
    /// always holds the latest committed image.
    pub fn with_data<R>(&self, key: BufferKey, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let write_index = read(&self.frame, "frame state")?.write_index;
        let registry = read(&self.registry, "registry")?;
        let record = registry.get(key).ok_or_else(|| Error::StaleHandle.logged(SOURCE))?;
        let index = record.metadata.pool_index;
        Ok(match record.metadata.lifetime {
            LifetimeType::Mutable => {
                f(lock(&self.mutable_pool, "Mutable pool")?.data(index, write_index))
            }
            LifetimeType::Immutable => {
                f(lock(&self.immutable_pool, "Immutable pool")?.data(index))
            }
            LifetimeType::SingleFrame => {
                f(lock(&self.single_frame_pool, "SingleFrame pool")?.data(index))
            }
        })
    }

    // ===== FRAME LIFECYCLE =====

    /// Start frame `frame_number`
    ///
    /// Advances the Mutable write index to `frame_number % frames_in_flight`
    /// and copies every pending range from the previous slot into the new one.
    ///
    /// # Errors
    ///
    /// Returns `Error::FrameOrder` if the previous frame was not ended or if
    /// `frame_number` does not follow it. The first frame may start anywhere;
    /// after that each flush must reach the next copy in turn, so frame
    /// numbers are consecutive.
    pub fn begin_frame(&self, frame_number: u64) -> Result<()> {
        let mut frame = write(&self.frame, "frame state")?;
        if frame.recording {
            return Err(Error::FrameOrder(format!(
                "begin_frame({}) while frame {:?} is still open", frame_number, frame.current
            )).logged(SOURCE));
        }
        if let Some(previous) = frame.current {
            if previous.checked_add(1) != Some(frame_number) {
                return Err(Error::FrameOrder(format!(
                    "begin_frame({}) after frame {}, expected {}",
                    frame_number, previous, previous.wrapping_add(1)
                )).logged(SOURCE));
            }
        }

        let write_index = (frame_number % self.config.frames_in_flight as u64) as usize;
        if frame.current.is_some() {
            lock(&self.mutable_pool, "Mutable pool")?.advance(frame.write_index, write_index);
        }
        frame.current = Some(frame_number);
        frame.write_index = write_index;
        frame.recording = true;
        frame.flushed = false;

        engine_trace!(SOURCE, "Begin frame {} (write index {})", frame_number, write_index);
        Ok(())
    }

    /// Upload every dirty buffer to the backend
    ///
    /// Mutable buffers upload their pending intervals into the current copy
    /// and stay dirty until every copy has them. Immutable and SingleFrame
    /// buffers upload their whole contents once. Returns the number of
    /// backend updates issued.
    ///
    /// Runs at most once per frame: a second flush would upload to the same
    /// copy and count it twice.
    ///
    /// # Errors
    ///
    /// - `Error::FrameOrder` outside an open frame or if this frame was
    ///   already flushed
    /// - the first backend error (buffers not yet flushed stay dirty and go
    ///   out with the next frame)
    pub fn buffer_data(&self) -> Result<usize> {
        let frame = {
            let mut frame = write(&self.frame, "frame state")?;
            if !frame.recording {
                return Err(Error::FrameOrder(format!(
                    "buffer_data outside an open frame (last frame {:?})", frame.current
                )).logged(SOURCE));
            }
            if frame.flushed {
                return Err(Error::FrameOrder(format!(
                    "buffer_data called twice in frame {:?}", frame.current
                )).logged(SOURCE));
            }
            frame.flushed = true;
            *frame
        };

        // Commits landing during the flush go to a fresh set for the next one
        let dirty: Vec<BufferKey> = lock(&self.dirty, "dirty set")?.drain().collect();
        if dirty.is_empty() {
            self.last_flush_updates.store(0, Ordering::Relaxed);
            return Ok(0);
        }

        let registry = read(&self.registry, "registry")?;
        let copy_index = frame.write_index as u32;
        let mut updates = 0;
        let mut still_dirty = Vec::new();
        let mut result = Ok(());

        for (position, &key) in dirty.iter().enumerate() {
            let Some(record) = registry.get(key) else {
                continue;
            };
            let index = record.metadata.pool_index;
            let flushed = match record.metadata.lifetime {
                LifetimeType::Mutable => {
                    let mut pool = lock(&self.mutable_pool, "Mutable pool")?;
                    let data = pool.data(index, frame.write_index);
                    let uploaded = pool.pending(index).intervals().iter().try_for_each(|interval| {
                        updates += 1;
                        record.backend_buffer.update(
                            copy_index,
                            interval.base_offset as u64,
                            &data[interval.range()],
                        )
                    });
                    uploaded.map(|()| pool.complete_propagation(index))
                }
                LifetimeType::Immutable => {
                    let pool = lock(&self.immutable_pool, "Immutable pool")?;
                    updates += 1;
                    record.backend_buffer.update(0, 0, pool.data(index)).map(|()| true)
                }
                LifetimeType::SingleFrame => {
                    let pool = lock(&self.single_frame_pool, "SingleFrame pool")?;
                    updates += 1;
                    record.backend_buffer.update(0, 0, pool.data(index)).map(|()| true)
                }
            };
            match flushed {
                Ok(true) => {}
                Ok(false) => still_dirty.push(key),
                Err(error) => {
                    still_dirty.extend_from_slice(&dirty[position..]);
                    result = Err(error.logged(SOURCE));
                    break;
                }
            }
        }
        drop(registry);

        let remaining = still_dirty.len();
        lock(&self.dirty, "dirty set")?.extend(still_dirty);

        self.last_flush_updates.store(updates, Ordering::Relaxed);
        engine_trace!(SOURCE, "Flushed frame {:?}: {} backend updates, {} buffers still propagating",
            frame.current, updates, remaining);
        result.map(|()| updates)
    }

    /// Close the current frame
    ///
    /// Reclaims every SingleFrame buffer (their backend buffers go to the
    /// deferred deletion queue) and destroys expired deferred deletions.
    ///
    /// # Errors
    ///
    /// - `Error::FrameOrder` if no frame is open
    /// - `Error::SingleFrameLeak` if facade handles to reclaimed SingleFrame
    ///   buffers are still alive; the buffers are reclaimed regardless and
    ///   the leaked handles are stale from now on
    pub fn end_frame(&self) -> Result<()> {
        let mut frame = write(&self.frame, "frame state")?;
        let current = match (frame.recording, frame.current) {
            (true, Some(current)) => current,
            _ => {
                return Err(Error::FrameOrder(
                    "end_frame without a matching begin_frame".to_string()
                ).logged(SOURCE));
            }
        };

        let leaked = self.reclaim_single_frame(current)?;
        let destroyed = lock(&self.deletions, "deletion queue")?.clear(current, self.backend.as_ref());
        frame.recording = false;

        engine_trace!(SOURCE, "End frame {}: {} backend buffers destroyed", current, destroyed);
        if leaked > 0 {
            return Err(Error::SingleFrameLeak { count: leaked }.logged(SOURCE));
        }
        Ok(())
    }

    /// Remove every SingleFrame buffer, returning how many were still referenced
    fn reclaim_single_frame(&self, frame: u64) -> Result<usize> {
        let mut registry = write(&self.registry, "registry")?;
        let mut pool = lock(&self.single_frame_pool, "SingleFrame pool")?;
        let mut dirty = lock(&self.dirty, "dirty set")?;
        let mut deletions = lock(&self.deletions, "deletion queue")?;

        let mut leaked = 0;
        for key in pool.keys() {
            let Some(record) = registry.remove(key) else {
                continue;
            };
            if record.external_refs() > 0 {
                leaked += 1;
            }
            dirty.remove(&key);
            deletions.push(frame, key, record.backend_buffer);
        }
        let reclaimed = pool.len();
        pool.reset();

        if reclaimed > 0 {
            engine_trace!(SOURCE, "Reclaimed {} SingleFrame buffers", reclaimed);
        }
        Ok(leaked)
    }

    /// Destroy every deferred deletion tagged before `frame - frames_in_flight`
    ///
    /// Called by `end_frame`; exposed for renderers that sweep on their own
    /// schedule. Returns the number of backend buffers destroyed.
    ///
    /// # Errors
    ///
    /// Returns `Error::FrameOrder` before the first frame.
    pub fn clear_deferred_deletions(&self, frame: u64) -> Result<usize> {
        if read(&self.frame, "frame state")?.current.is_none() {
            return Err(Error::FrameOrder(
                "clear_deferred_deletions before the first begin_frame".to_string()
            ).logged(SOURCE));
        }
        Ok(lock(&self.deletions, "deletion queue")?.clear(frame, self.backend.as_ref()))
    }

    /// Release every buffer and destroy every backend buffer
    ///
    /// Live buffers are deallocated (a warning reports how many), then the
    /// deletion queue is drained with an unbounded frame. Idempotent; also
    /// run on drop.
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let frame = read(&self.frame, "frame state")?.current.unwrap_or(0);

        let live = {
            let mut registry = write(&self.registry, "registry")?;
            *lock(&self.mutable_pool, "Mutable pool")? = MutablePool::new(self.config.frames_in_flight);
            *lock(&self.immutable_pool, "Immutable pool")? = ImmutablePool::new();
            lock(&self.single_frame_pool, "SingleFrame pool")?.reset();
            lock(&self.dirty, "dirty set")?.clear();

            let mut deletions = lock(&self.deletions, "deletion queue")?;
            let live = registry.len();
            for (key, record) in registry.drain() {
                deletions.push(frame, key, record.backend_buffer);
            }
            live
        };
        if live > 0 {
            engine_warn!(SOURCE, "Shutdown with {} live buffers, releasing them", live);
        }

        let destroyed = lock(&self.deletions, "deletion queue")?.clear(u64::MAX, self.backend.as_ref());
        engine_info!(SOURCE, "Buffer allocator shut down ({} backend buffers destroyed)", destroyed);
        Ok(())
    }

    // ===== STATS =====

    /// Snapshot of the allocator state
    pub fn stats(&self) -> Result<AllocatorStats> {
        let frame = read(&self.frame, "frame state")?.current;
        let (mutable_buffers, pending_intervals) = {
            let pool = lock(&self.mutable_pool, "Mutable pool")?;
            (pool.len(), pool.pending_interval_count())
        };
        let (immutable_buffers, immutable_bytes) = {
            let pool = lock(&self.immutable_pool, "Immutable pool")?;
            (pool.len(), pool.total_bytes())
        };
        let (single_frame_buffers, single_frame_bytes_used, single_frame_capacity) = {
            let pool = lock(&self.single_frame_pool, "SingleFrame pool")?;
            (pool.len(), pool.used(), pool.capacity())
        };
        Ok(AllocatorStats {
            frame,
            mutable_buffers,
            immutable_buffers,
            single_frame_buffers,
            single_frame_bytes_used,
            single_frame_capacity,
            dirty_buffers: lock(&self.dirty, "dirty set")?.len(),
            pending_intervals,
            pending_deletions: lock(&self.deletions, "deletion queue")?.len(),
            immutable_bytes,
            last_flush_updates: self.last_flush_updates.load(Ordering::Relaxed),
        })
    }
}

impl Drop for BufferAllocator {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
#[path = "buffer_allocator_tests.rs"]
mod tests;
