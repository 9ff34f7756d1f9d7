//! Inference responses and the caller-supplied output allocator.
//!
//! Output buffers are never allocated by the core itself: the caller hands
//! an allocator to the server and the backend fills whatever placement the
//! allocator actually produced. The allocator may downgrade the preferred
//! memory type (pinned to pageable, device to host); the core records and
//! reports the actual placement.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::config::DataType;
use crate::error::{Error, Result};
use crate::memory::{MemoryPools, MemoryType};

/// One allocated output buffer, with the placement the allocator actually
/// chose. `user_data` is opaque allocator state returned to it on release.
pub struct Allocation {
    buffer: Vec<u8>,
    memory_type: MemoryType,
    device_id: i64,
    user_data: Option<Box<dyn Any + Send>>,
}

impl Allocation {
    pub fn new(buffer: Vec<u8>, memory_type: MemoryType, device_id: i64) -> Self {
        Self {
            buffer,
            memory_type,
            device_id,
            user_data: None,
        }
    }

    pub fn with_user_data(mut self, user_data: Box<dyn Any + Send>) -> Self {
        self.user_data = Some(user_data);
        self
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub fn byte_size(&self) -> usize {
        self.buffer.len()
    }

    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    pub fn device_id(&self) -> i64 {
        self.device_id
    }

    /// Allocator state carried through to release.
    pub fn user_data(&self) -> Option<&(dyn Any + Send)> {
        self.user_data.as_deref()
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("byte_size", &self.buffer.len())
            .field("memory_type", &self.memory_type)
            .field("device_id", &self.device_id)
            .finish()
    }
}

/// Caller-supplied output buffer provider.
pub trait ResponseAllocator: Send + Sync {
    /// Produce a buffer of at least `byte_size` bytes for the named output
    /// tensor, preferring but not guaranteeing the given placement.
    fn allocate(
        &self,
        tensor_name: &str,
        byte_size: usize,
        preferred_memory_type: MemoryType,
        preferred_device_id: i64,
    ) -> Result<Allocation>;

    /// Called exactly once per allocation when the owning output is
    /// destroyed.
    fn release(&self, allocation: Allocation) {
        drop(allocation);
    }
}

/// Allocator backed by the shared pinned/device pools, falling back to
/// pageable host memory on exhaustion.
pub struct PoolAllocator {
    pools: Arc<MemoryPools>,
}

impl PoolAllocator {
    pub fn new(pools: Arc<MemoryPools>) -> Self {
        Self { pools }
    }
}

impl ResponseAllocator for PoolAllocator {
    fn allocate(
        &self,
        _tensor_name: &str,
        byte_size: usize,
        preferred_memory_type: MemoryType,
        preferred_device_id: i64,
    ) -> Result<Allocation> {
        let buffer = vec![0u8; byte_size];

        let reservation = match preferred_memory_type {
            MemoryType::Cpu => None,
            MemoryType::CpuPinned => self.pools.pinned().try_acquire(byte_size as u64),
            MemoryType::Gpu => self
                .pools
                .device(preferred_device_id)
                .and_then(|pool| pool.try_acquire(byte_size as u64)),
        };

        let allocation = match reservation {
            Some(reservation) => {
                Allocation::new(buffer, preferred_memory_type, preferred_device_id)
                    .with_user_data(Box::new(reservation))
            }
            // Pool exhausted or placement unknown: downgrade to pageable.
            None => Allocation::new(buffer, MemoryType::Cpu, 0),
        };

        Ok(allocation)
    }
}

/// One output tensor of a response.
pub struct Output {
    name: String,
    data_type: DataType,
    shape: Vec<i64>,
    allocator: Arc<dyn ResponseAllocator>,
    allocation: Option<Allocation>,
}

impl Output {
    /// Allocate the output buffer through the response allocator. A second
    /// allocation for the same output is `AlreadyExists`; a buffer smaller
    /// than requested violates the allocator contract and is `Internal`.
    pub fn allocate_buffer(
        &mut self,
        byte_size: usize,
        preferred_memory_type: MemoryType,
        preferred_device_id: i64,
    ) -> Result<&mut [u8]> {
        if self.allocation.is_some() {
            return Err(Error::already_exists(format!(
                "allocated buffer for output '{}' already exists",
                self.name
            )));
        }

        let allocation = self.allocator.allocate(
            &self.name,
            byte_size,
            preferred_memory_type,
            preferred_device_id,
        )?;
        if allocation.byte_size() < byte_size {
            let got = allocation.byte_size();
            self.allocator.release(allocation);
            return Err(Error::internal(format!(
                "allocator returned {} bytes for output '{}', {} requested",
                got, self.name, byte_size
            )));
        }

        Ok(self.allocation.insert(allocation).buffer_mut())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn buffer(&self) -> Option<&[u8]> {
        self.allocation.as_ref().map(|a| a.buffer())
    }

    pub fn byte_size(&self) -> usize {
        self.allocation.as_ref().map(|a| a.byte_size()).unwrap_or(0)
    }

    pub fn memory_type(&self) -> Option<MemoryType> {
        self.allocation.as_ref().map(|a| a.memory_type())
    }

    pub fn device_id(&self) -> Option<i64> {
        self.allocation.as_ref().map(|a| a.device_id())
    }
}

impl Drop for Output {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            self.allocator.release(allocation);
        }
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Output")
            .field("name", &self.name)
            .field("data_type", &self.data_type)
            .field("shape", &self.shape)
            .field("byte_size", &self.byte_size())
            .finish()
    }
}

/// A completed (or failing) inference result: the ordered outputs the
/// backend produced for one request.
pub struct InferenceResponse {
    id: String,
    model_name: String,
    model_version: i64,
    outputs: Vec<Output>,
    allocator: Arc<dyn ResponseAllocator>,
}

impl InferenceResponse {
    /// Add an output tensor; the backend allocates its buffer separately
    /// via [`Output::allocate_buffer`].
    pub fn add_output(
        &mut self,
        name: impl Into<String>,
        data_type: DataType,
        shape: Vec<i64>,
    ) -> &mut Output {
        let index = self.outputs.len();
        self.outputs.push(Output {
            name: name.into(),
            data_type,
            shape,
            allocator: Arc::clone(&self.allocator),
            allocation: None,
        });
        &mut self.outputs[index]
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn model_version(&self) -> i64 {
        self.model_version
    }

    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    pub fn output(&self, name: &str) -> Result<&Output> {
        self.outputs.iter().find(|o| o.name == name).ok_or_else(|| {
            Error::not_found(format!(
                "response for '{}' has no output '{}'",
                self.model_name, name
            ))
        })
    }
}

impl fmt::Debug for InferenceResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceResponse")
            .field("id", &self.id)
            .field("model_name", &self.model_name)
            .field("model_version", &self.model_version)
            .field("outputs", &self.outputs)
            .finish()
    }
}

/// Builds empty responses bound to one (model, version) and allocator.
#[derive(Clone)]
pub struct ResponseFactory {
    id: String,
    model_name: String,
    model_version: i64,
    allocator: Arc<dyn ResponseAllocator>,
}

impl ResponseFactory {
    pub fn new(
        id: impl Into<String>,
        model_name: impl Into<String>,
        model_version: i64,
        allocator: Arc<dyn ResponseAllocator>,
    ) -> Self {
        Self {
            id: id.into(),
            model_name: model_name.into(),
            model_version,
            allocator,
        }
    }

    pub fn create_response(&self) -> InferenceResponse {
        InferenceResponse {
            id: self.id.clone(),
            model_name: self.model_name.clone(),
            model_version: self.model_version,
            outputs: Vec::new(),
            allocator: Arc::clone(&self.allocator),
        }
    }
}

impl fmt::Debug for ResponseFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFactory")
            .field("id", &self.id)
            .field("model_name", &self.model_name)
            .field("model_version", &self.model_version)
            .finish()
    }
}
