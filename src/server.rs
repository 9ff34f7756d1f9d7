//! The serving facade: liveness and readiness aggregation, request
//! admission, in-flight tracking, and graceful stop.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::backend::{BackendFactory, Execution};
use crate::error::{Error, Result};
use crate::manager::{
    ModelControlMode, ModelIndexEntry, ModelRepositoryManager, ModelStatus,
};
use crate::memory::MemoryPools;
use crate::repository::RepositoryStore;
use crate::request::InferenceRequest;
use crate::response::{InferenceResponse, PoolAllocator, ResponseAllocator, ResponseFactory};

/// Options recognized by the server.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub id: String,
    pub model_repository_paths: Vec<PathBuf>,
    pub model_control_mode: ModelControlMode,
    /// Models loaded at startup under `Explicit` control; under `None` and
    /// `Poll` every model found is a startup model.
    pub startup_models: Vec<String>,
    /// Reject on missing/invalid configuration instead of improvising.
    pub strict_model_config: bool,
    /// Ready only when every startup model is ready.
    pub strict_readiness: bool,
    pub exit_timeout: Duration,
    pub pinned_memory_pool_size: u64,
    pub cuda_memory_pool_size: HashMap<i64, u64>,
    pub min_supported_compute_capability: f64,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            id: "inference:0".to_string(),
            model_repository_paths: Vec::new(),
            model_control_mode: ModelControlMode::None,
            startup_models: Vec::new(),
            strict_model_config: true,
            strict_readiness: true,
            exit_timeout: Duration::from_secs(30),
            pinned_memory_pool_size: 256 << 20,
            cuda_memory_pool_size: HashMap::new(),
            min_supported_compute_capability: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerReadyState {
    Ready,
    Exiting,
    Stopped,
}

/// Requests admitted but not yet completed. Shutdown waits on this gauge.
#[derive(Default)]
struct Inflight {
    count: Mutex<u64>,
    cv: Condvar,
}

impl Inflight {
    fn increment(&self) {
        *self.count.lock() += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.cv.notify_all();
        }
    }

    fn count(&self) -> u64 {
        *self.count.lock()
    }

    fn wait_zero_until(&self, deadline: Instant) -> bool {
        let mut count = self.count.lock();
        while *count > 0 {
            if self.cv.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

/// Snapshot returned by [`Server::status`].
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub id: String,
    pub version: String,
    pub ready_state: ServerReadyState,
    pub uptime_ns: u64,
    pub models: std::collections::BTreeMap<String, ModelStatus>,
}

/// Resolves to the inference result once the backend completes it.
#[derive(Debug)]
pub struct ResponseFuture {
    rx: oneshot::Receiver<Result<InferenceResponse>>,
}

impl Future for ResponseFuture {
    type Output = Result<InferenceResponse>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(result) => result,
            Err(_) => Err(Error::internal("response channel closed")),
        })
    }
}

/// The inference server core.
pub struct Server {
    options: ServerOptions,
    start_time: Instant,
    ready_state: Mutex<ServerReadyState>,
    inflight: Arc<Inflight>,
    pools: Arc<MemoryPools>,
    allocator: Arc<dyn ResponseAllocator>,
    manager: Arc<ModelRepositoryManager>,
}

impl Server {
    /// Initialize: build the pools and repository manager and load the
    /// startup models. The server is live from the moment this returns
    /// until `stop` returns.
    pub fn new(options: ServerOptions, factory: Arc<dyn BackendFactory>) -> Result<Self> {
        let store = RepositoryStore::new(
            options.model_repository_paths.clone(),
            options.strict_model_config,
        )?;
        let manager = ModelRepositoryManager::new(
            store,
            factory,
            options.model_control_mode,
            &options.startup_models,
        )?;
        let pools = Arc::new(MemoryPools::new(
            options.pinned_memory_pool_size,
            &options.cuda_memory_pool_size,
        ));
        let allocator = Arc::new(PoolAllocator::new(Arc::clone(&pools)));

        info!(
            id = %options.id,
            startup_models = manager.startup_models().len(),
            "server initialized"
        );

        Ok(Self {
            options,
            start_time: Instant::now(),
            ready_state: Mutex::new(ServerReadyState::Ready),
            inflight: Arc::new(Inflight::default()),
            pools,
            allocator,
            manager: Arc::new(manager),
        })
    }

    pub fn id(&self) -> &str {
        &self.options.id
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn memory_pools(&self) -> &Arc<MemoryPools> {
        &self.pools
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn ready_state(&self) -> ServerReadyState {
        *self.ready_state.lock()
    }

    /// Liveness does not depend on model state.
    pub fn is_live(&self) -> bool {
        matches!(
            self.ready_state(),
            ServerReadyState::Ready | ServerReadyState::Exiting
        )
    }

    /// Under strict readiness, every startup model must be ready; otherwise
    /// one ready model suffices.
    pub fn is_ready(&self) -> bool {
        if self.ready_state() != ServerReadyState::Ready {
            return false;
        }
        if self.options.strict_readiness {
            self.manager
                .startup_models()
                .iter()
                .all(|name| self.manager.model_is_ready(name, -1))
        } else {
            self.manager.any_model_ready()
        }
    }

    pub fn model_is_ready(&self, name: &str, version: i64) -> bool {
        self.manager.model_is_ready(name, version)
    }

    pub fn model_ready_versions(&self, name: &str) -> Vec<i64> {
        self.manager.ready_versions(name)
    }

    /// Rescan the model repository; only valid under `Poll` control.
    pub fn poll_model_repository(&self) -> Result<()> {
        if self.options.model_control_mode != ModelControlMode::Poll {
            return Err(Error::invalid_arg(
                "repository polling is not enabled",
            ));
        }
        self.check_accepting()?;
        self.manager.poll()
    }

    /// Load (or reload) a model; only valid under `Explicit` control.
    pub fn load_model(&self, name: &str) -> Result<()> {
        if self.options.model_control_mode != ModelControlMode::Explicit {
            return Err(Error::unavailable(
                "explicit model load / unload is not allowed",
            ));
        }
        self.check_accepting()?;
        self.manager.load_model(name)
    }

    /// Unload a model; only valid under `Explicit` control.
    pub fn unload_model(&self, name: &str) -> Result<()> {
        if self.options.model_control_mode != ModelControlMode::Explicit {
            return Err(Error::unavailable(
                "explicit model load / unload is not allowed",
            ));
        }
        self.check_accepting()?;
        self.manager.unload_model(name)
    }

    /// Admit a request: resolve its backend, prepare it, and enqueue it.
    /// The returned future resolves when the backend completes the request;
    /// the in-flight gauge decrements when the completion fires, whether or
    /// not the caller awaits.
    pub fn infer_async(&self, request: InferenceRequest) -> Result<ResponseFuture> {
        self.infer_async_with_allocator(request, Arc::clone(&self.allocator))
    }

    /// `infer_async` with a caller-supplied response allocator.
    pub fn infer_async_with_allocator(
        &self,
        mut request: InferenceRequest,
        allocator: Arc<dyn ResponseAllocator>,
    ) -> Result<ResponseFuture> {
        self.check_accepting()?;

        let backend = self
            .manager
            .get_backend(request.model_name(), request.requested_version())?;
        request.prepare(&backend)?;

        let factory = ResponseFactory::new(
            request.id(),
            backend.name(),
            backend.version(),
            allocator,
        );
        let response = factory.create_response();

        self.inflight.increment();
        let (tx, rx) = oneshot::channel();
        let inflight = Arc::clone(&self.inflight);
        // The hook keeps the shared handle alive until completion: requests
        // borrow the backend from the caller's reference for their
        // lifetime.
        let keepalive = backend.clone();
        let execution = Execution::new(request, response, tx).with_completion_hook(Box::new(
            move || {
                drop(keepalive);
                inflight.decrement();
            },
        ));

        backend.enqueue(execution)?;
        Ok(ResponseFuture { rx })
    }

    /// Convenience wrapper awaiting the response future.
    pub async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse> {
        self.infer_async(request)?.await
    }

    pub fn inflight_count(&self) -> u64 {
        self.inflight.count()
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            id: self.options.id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ready_state: self.ready_state(),
            uptime_ns: self.start_time.elapsed().as_nanos() as u64,
            models: self.manager.status(),
        }
    }

    pub fn model_status(&self, name: &str) -> Result<ModelStatus> {
        self.manager.model_status(name)
    }

    pub fn repository_index(&self) -> Vec<ModelIndexEntry> {
        self.manager.index()
    }

    /// Stop accepting requests, wait up to the exit timeout for in-flight
    /// requests, then unload all models. `DeadlineExceeded` when either
    /// phase outlives the timeout; models still alive then are forced
    /// unavailable.
    pub fn stop(&self) -> Result<()> {
        {
            let mut state = self.ready_state.lock();
            match *state {
                ServerReadyState::Stopped => return Ok(()),
                ServerReadyState::Exiting => {
                    return Err(Error::unavailable("server is already exiting"))
                }
                ServerReadyState::Ready => *state = ServerReadyState::Exiting,
            }
        }

        let deadline = Instant::now() + self.options.exit_timeout;
        info!(
            timeout_secs = self.options.exit_timeout.as_secs(),
            "server exiting, waiting for in-flight requests"
        );

        let drained = self.inflight.wait_zero_until(deadline);
        if !drained {
            warn!(
                inflight = self.inflight.count(),
                "exit timeout expired with requests still in flight"
            );
        }

        let unloaded = self.manager.unload_all(deadline);

        *self.ready_state.lock() = ServerReadyState::Stopped;

        if drained && unloaded.is_ok() {
            info!("server stopped");
            Ok(())
        } else {
            Err(Error::deadline_exceeded(
                "exit timeout expired before shutdown completed",
            ))
        }
    }

    fn check_accepting(&self) -> Result<()> {
        match self.ready_state() {
            ServerReadyState::Ready => Ok(()),
            state => Err(Error::unavailable(format!(
                "server is not accepting requests ({:?})",
                state
            ))),
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.options.id)
            .field("ready_state", &self.ready_state())
            .field("inflight", &self.inflight.count())
            .finish()
    }
}
