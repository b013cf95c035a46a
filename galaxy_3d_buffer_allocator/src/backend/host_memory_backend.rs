/// Host memory backend (no GPU required)
///
/// Keeps every physical copy as a plain byte vector and records each backend
/// call. Used for headless runs and as the device stand-in in tests: the call
/// log shows exactly what a real device would have received.

use std::sync::{Arc, Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use crate::allocator::BufferKey;
use crate::backend::{BackendBuffer, BackendBufferDesc, BufferBackend};
use crate::error::{Error, Result};
use crate::engine_debug;

/// One recorded backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Create {
        key: BufferKey,
        size: u64,
        copy_count: u32,
    },
    Update {
        key: BufferKey,
        copy_index: u32,
        offset: u64,
        data: Vec<u8>,
    },
    Destroy {
        key: BufferKey,
    },
}

#[derive(Default)]
struct HostMemoryState {
    buffers: FxHashMap<BufferKey, Vec<Vec<u8>>>,
    calls: Vec<BackendCall>,
    fail_updates: bool,
}

fn lock_state(state: &Mutex<HostMemoryState>) -> Result<MutexGuard<'_, HostMemoryState>> {
    state.lock().map_err(|_| Error::LockPoisoned("HostMemoryBackend"))
}

/// Backend storing physical copies in host memory
#[derive(Clone, Default)]
pub struct HostMemoryBackend {
    state: Arc<Mutex<HostMemoryState>>,
}

impl HostMemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every call recorded so far
    pub fn calls(&self) -> Vec<BackendCall> {
        self.state_guard().calls.clone()
    }

    /// Take and clear the recorded calls
    pub fn take_calls(&self) -> Vec<BackendCall> {
        std::mem::take(&mut self.state_guard().calls)
    }

    /// Number of `Update` calls recorded so far
    pub fn update_count(&self) -> usize {
        self.state_guard().calls.iter()
            .filter(|call| matches!(call, BackendCall::Update { .. }))
            .count()
    }

    /// Number of `Destroy` calls recorded for `key`
    pub fn destroy_count(&self, key: BufferKey) -> usize {
        self.state_guard().calls.iter()
            .filter(|call| matches!(call, BackendCall::Destroy { key: k } if *k == key))
            .count()
    }

    /// Contents of one physical copy, None if the buffer does not exist
    pub fn copy_data(&self, key: BufferKey, copy_index: u32) -> Option<Vec<u8>> {
        self.state_guard().buffers.get(&key)
            .and_then(|copies| copies.get(copy_index as usize))
            .cloned()
    }

    /// Number of physical copies held for `key` (0 if destroyed)
    pub fn copy_count(&self, key: BufferKey) -> usize {
        self.state_guard().buffers.get(&key).map_or(0, |copies| copies.len())
    }

    /// Number of physically live buffers
    pub fn live_buffer_count(&self) -> usize {
        self.state_guard().buffers.len()
    }

    /// Make every following update fail with `Error::BackendError`
    pub fn set_fail_updates(&self, fail: bool) {
        self.state_guard().fail_updates = fail;
    }

    fn state_guard(&self) -> MutexGuard<'_, HostMemoryState> {
        // Inspection helpers keep working after a panicking test thread
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BufferBackend for HostMemoryBackend {
    fn create_buffer(&self, desc: &BackendBufferDesc) -> Result<Box<dyn BackendBuffer>> {
        let mut state = lock_state(&self.state)?;
        if state.buffers.contains_key(&desc.key) {
            return Err(Error::BackendError(format!(
                "buffer {:?} already exists", desc.key
            )));
        }
        let copies = (0..desc.copy_count)
            .map(|_| vec![0u8; desc.size as usize])
            .collect();
        state.buffers.insert(desc.key, copies);
        state.calls.push(BackendCall::Create {
            key: desc.key,
            size: desc.size,
            copy_count: desc.copy_count,
        });
        Ok(Box::new(HostBuffer {
            key: desc.key,
            state: Arc::clone(&self.state),
        }))
    }

    fn destroy_buffer(&self, key: BufferKey, buffer: Box<dyn BackendBuffer>) {
        drop(buffer);
        let mut state = self.state_guard();
        if state.buffers.remove(&key).is_none() {
            panic!("HostMemoryBackend: buffer {:?} destroyed twice", key);
        }
        state.calls.push(BackendCall::Destroy { key });
        engine_debug!("galaxy3d::HostMemoryBackend", "Destroyed buffer {:?}", key);
    }
}

/// Physical buffer living in host memory
struct HostBuffer {
    key: BufferKey,
    state: Arc<Mutex<HostMemoryState>>,
}

impl BackendBuffer for HostBuffer {
    fn update(&self, copy_index: u32, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = lock_state(&self.state)?;
        if state.fail_updates {
            return Err(Error::BackendError(format!(
                "update of buffer {:?} refused", self.key
            )));
        }
        let copy = state.buffers.get_mut(&self.key)
            .and_then(|copies| copies.get_mut(copy_index as usize))
            .ok_or_else(|| Error::BackendError(format!(
                "buffer {:?} has no copy {}", self.key, copy_index
            )))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > copy.len() {
            return Err(Error::OutOfBounds {
                offset,
                size: data.len() as u64,
                buffer_size: copy.len() as u64,
            });
        }
        copy[start..end].copy_from_slice(data);
        state.calls.push(BackendCall::Update {
            key: self.key,
            copy_index,
            offset,
            data: data.to_vec(),
        });
        Ok(())
    }
}

#[cfg(test)]
#[path = "host_memory_backend_tests.rs"]
mod tests;
