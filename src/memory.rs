//! Shared memory accounting: input memory references, the pinned host pool,
//! and the per-device pools.
//!
//! Pools are acquire-or-fallback gauges. A failed `try_acquire` never blocks
//! the caller; the response allocator downgrades to pageable memory instead.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

/// Where a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Cpu,
    CpuPinned,
    Gpu,
}

/// One contiguous chunk of caller-attached input data.
#[derive(Debug, Clone)]
pub struct MemoryChunk {
    pub data: Arc<[u8]>,
    pub memory_type: MemoryType,
    pub device_id: i64,
}

/// A caller-attached memory reference: an ordered list of chunks whose
/// concatenation is the tensor content. Shared, immutable once attached.
#[derive(Debug, Clone, Default)]
pub struct MemoryReference {
    chunks: Vec<MemoryChunk>,
}

impl MemoryReference {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a single-chunk host reference.
    pub fn from_bytes(data: impl Into<Arc<[u8]>>) -> Self {
        let mut reference = Self::new();
        reference.append(data, MemoryType::Cpu, 0);
        reference
    }

    pub fn append(
        &mut self,
        data: impl Into<Arc<[u8]>>,
        memory_type: MemoryType,
        device_id: i64,
    ) {
        let data = data.into();
        if !data.is_empty() {
            self.chunks.push(MemoryChunk {
                data,
                memory_type,
                device_id,
            });
        }
    }

    pub fn chunks(&self) -> &[MemoryChunk] {
        &self.chunks
    }

    pub fn total_byte_size(&self) -> u64 {
        self.chunks.iter().map(|c| c.data.len() as u64).sum()
    }

    /// Concatenate all chunks into one host buffer.
    pub fn gather(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.total_byte_size() as usize);
        for chunk in &self.chunks {
            buffer.extend_from_slice(&chunk.data);
        }
        buffer
    }
}

/// A fixed-capacity byte gauge with RAII reservations.
#[derive(Debug)]
pub struct MemoryPool {
    name: String,
    capacity: u64,
    used: Mutex<u64>,
}

impl MemoryPool {
    pub fn new(name: impl Into<String>, capacity: u64) -> Self {
        Self {
            name: name.into(),
            capacity,
            used: Mutex::new(0),
        }
    }

    /// Reserve `bytes` if the pool has room, without blocking.
    pub fn try_acquire(self: &Arc<Self>, bytes: u64) -> Option<PoolReservation> {
        let mut used = self.used.lock();
        if *used + bytes > self.capacity {
            debug!(
                pool = %self.name,
                requested = bytes,
                used = *used,
                capacity = self.capacity,
                "pool exhausted, caller falls back"
            );
            return None;
        }
        *used += bytes;
        Some(PoolReservation {
            pool: Arc::clone(self),
            bytes,
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        *self.used.lock()
    }
}

/// RAII reservation; returns its bytes to the pool on drop.
#[derive(Debug)]
pub struct PoolReservation {
    pool: Arc<MemoryPool>,
    bytes: u64,
}

impl PoolReservation {
    pub fn byte_size(&self) -> u64 {
        self.bytes
    }
}

impl Drop for PoolReservation {
    fn drop(&mut self) {
        let mut used = self.pool.used.lock();
        *used = used.saturating_sub(self.bytes);
    }
}

/// The process-wide pools shared across all backends.
#[derive(Debug)]
pub struct MemoryPools {
    pinned: Arc<MemoryPool>,
    device: HashMap<i64, Arc<MemoryPool>>,
}

impl MemoryPools {
    pub fn new(pinned_bytes: u64, device_bytes: &HashMap<i64, u64>) -> Self {
        let device = device_bytes
            .iter()
            .map(|(&id, &bytes)| {
                (
                    id,
                    Arc::new(MemoryPool::new(format!("device-{id}"), bytes)),
                )
            })
            .collect();
        Self {
            pinned: Arc::new(MemoryPool::new("pinned", pinned_bytes)),
            device,
        }
    }

    pub fn pinned(&self) -> &Arc<MemoryPool> {
        &self.pinned
    }

    pub fn device(&self, device_id: i64) -> Option<&Arc<MemoryPool>> {
        self.device.get(&device_id)
    }
}
