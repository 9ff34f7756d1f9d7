//! Backend handles: one loaded (model, version) bound to its framework
//! session and its scheduler.
//!
//! The core never talks to a framework directly. A [`BackendFactory`]
//! produces a [`ModelExecutor`] for each loaded version; the handle wraps
//! the executor together with the per-model scheduler and exposes the
//! configuration accessors the normalizer needs.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::warn;

use crate::config::{ModelConfig, TensorConfig};
use crate::error::{Error, Result};
use crate::request::InferenceRequest;
use crate::response::InferenceResponse;
use crate::scheduler::{BatcherConfig, DynamicBatcher, Scheduler};

/// Called exactly once when an execution completes, on any path.
pub type CompletionHook = Box<dyn FnOnce() + Send>;

/// Completion channel plus hook; fires `Internal` if dropped unfinished.
struct Completion {
    sender: Option<oneshot::Sender<Result<InferenceResponse>>>,
    hook: Option<CompletionHook>,
}

impl Completion {
    fn send(&mut self, result: Result<InferenceResponse>) {
        if let Some(sender) = self.sender.take() {
            // The caller may have dropped the receiver; completion still
            // counts.
            let _ = sender.send(result);
        }
        if let Some(hook) = self.hook.take() {
            hook();
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.sender.is_some() || self.hook.is_some() {
            self.send(Err(Error::internal(
                "request dropped without completion",
            )));
        }
    }
}

/// A prepared request traveling through a scheduler to the backend,
/// carrying the response under construction and the completion channel.
pub struct Execution {
    request: InferenceRequest,
    response: InferenceResponse,
    completion: Completion,
}

impl Execution {
    pub fn new(
        request: InferenceRequest,
        response: InferenceResponse,
        sender: oneshot::Sender<Result<InferenceResponse>>,
    ) -> Self {
        Self {
            request,
            response,
            completion: Completion {
                sender: Some(sender),
                hook: None,
            },
        }
    }

    /// Attach a hook invoked exactly once at completion, after the result
    /// is delivered.
    pub fn with_completion_hook(mut self, hook: CompletionHook) -> Self {
        self.completion.hook = Some(hook);
        self
    }

    pub fn request(&self) -> &InferenceRequest {
        &self.request
    }

    pub fn response(&self) -> &InferenceResponse {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut InferenceResponse {
        &mut self.response
    }

    /// Deliver the per-request status: the response on success, the error
    /// otherwise.
    pub fn finish(self, status: Result<()>) {
        let Execution {
            response,
            mut completion,
            ..
        } = self;
        completion.send(status.map(|()| response));
    }
}

impl fmt::Debug for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Execution")
            .field("model", &self.request.model_name())
            .field("id", &self.request.id())
            .field("batch_size", &self.request.batch_size())
            .finish()
    }
}

/// One framework session for one loaded (model, version).
pub trait ModelExecutor: Send + Sync {
    /// Run one batch, filling each execution's response through its
    /// allocator. Returns one status per entry, in order. Entries share the
    /// model and, for batching models, identical working shapes and
    /// requested-output sets.
    fn execute(&self, batch: &mut [Execution]) -> Vec<Result<()>>;
}

/// The sole extension point for framework support.
pub trait BackendFactory: Send + Sync {
    fn create(
        &self,
        name: &str,
        version: i64,
        config: &ModelConfig,
        repository_path: &Path,
    ) -> Result<Arc<dyn ModelExecutor>>;
}

/// Invoke the executor on a formed batch and complete every entry with its
/// per-request status. A batch may complete partially: some entries OK,
/// some in error.
pub fn run_batch(executor: &dyn ModelExecutor, mut batch: Vec<Execution>) {
    let statuses = executor.execute(&mut batch);

    if statuses.len() != batch.len() {
        warn!(
            expected = batch.len(),
            got = statuses.len(),
            "backend returned a malformed status vector, failing the batch"
        );
        let err = Error::internal(format!(
            "backend returned {} statuses for a batch of {}",
            statuses.len(),
            batch.len()
        ));
        for execution in batch {
            execution.finish(Err(err.clone()));
        }
        return;
    }

    for (execution, status) in batch.into_iter().zip(statuses) {
        execution.finish(status);
    }
}

/// An opaque handle to one loaded (model, version).
pub struct BackendHandle {
    name: String,
    version: i64,
    config: ModelConfig,
    scheduler: Box<dyn Scheduler>,
}

impl BackendHandle {
    /// Build a handle with the default dynamic batching scheduler derived
    /// from the model configuration.
    pub fn new(
        name: impl Into<String>,
        version: i64,
        config: ModelConfig,
        executor: Arc<dyn ModelExecutor>,
    ) -> Self {
        let scheduler = DynamicBatcher::new(BatcherConfig::from_model(&config), executor);
        Self::with_scheduler(name, version, config, Box::new(scheduler))
    }

    /// Build a handle with a caller-supplied scheduling policy.
    pub fn with_scheduler(
        name: impl Into<String>,
        version: i64,
        config: ModelConfig,
        scheduler: Box<dyn Scheduler>,
    ) -> Self {
        Self {
            name: name.into(),
            version,
            config,
            scheduler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn max_priority_level(&self) -> u32 {
        self.config.max_priority_level()
    }

    pub fn default_priority_level(&self) -> u32 {
        self.config.default_priority_level()
    }

    pub fn input(&self, name: &str) -> Result<&TensorConfig> {
        self.config.input(name)
    }

    pub fn output(&self, name: &str) -> Result<&TensorConfig> {
        self.config.output(name)
    }

    /// Hand a prepared, immutable request to this backend's scheduler.
    pub fn enqueue(&self, execution: Execution) -> Result<()> {
        if !execution.request().is_prepared() {
            let err = Error::invalid_arg(format!(
                "request for model '{}' must be prepared before enqueue",
                self.name
            ));
            execution.finish(Err(err.clone()));
            return Err(err);
        }
        self.scheduler.enqueue(execution)
    }

    /// Stop the scheduler, draining queued requests as `Unavailable`.
    pub fn stop(&self) {
        self.scheduler.stop();
    }
}

impl fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendHandle")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("max_batch_size", &self.config.max_batch_size)
            .finish()
    }
}
