//! Keel - core of a multi-framework inference serving runtime
//!
//! This crate implements the serving core:
//! - Versioned model repository with reference-counted load/unload
//! - Request normalization against declarative model configurations
//! - Dynamic batching with priority queues and bounded queue delay
//! - A server facade with liveness, readiness, and graceful shutdown

pub mod backend;
pub mod config;
pub mod error;
pub mod manager;
pub mod memory;
pub mod repository;
pub mod request;
pub mod response;
pub mod scheduler;
pub mod server;

pub use backend::{BackendFactory, BackendHandle, Execution, ModelExecutor};
pub use config::{
    BatchConvention, DataType, DynamicBatching, ModelConfig, Reshape, TensorConfig,
    VersionPolicy, WILDCARD_DIM,
};
pub use error::{Error, Result};
pub use manager::{
    ModelControlMode, ModelIndexEntry, ModelReadyState, ModelRepositoryManager, ModelStatus,
    SharedBackend, VersionStatus,
};
pub use memory::{MemoryPool, MemoryPools, MemoryReference, MemoryType};
pub use repository::{ModelDirectory, ModificationKey, RepositoryStore};
pub use request::{flags, InferenceRequest, Input, RequestedOutput};
pub use response::{
    Allocation, InferenceResponse, PoolAllocator, ResponseAllocator, ResponseFactory,
};
pub use scheduler::{BatcherConfig, Clock, DynamicBatcher, Scheduler, SystemClock};
pub use server::{ResponseFuture, Server, ServerOptions, ServerReadyState, ServerStatus};
