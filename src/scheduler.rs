//! Dynamic batching: per-model priority FIFO queues with bounded-latency
//! batch formation.
//!
//! One batcher per backend handle. A dedicated worker thread forms batches
//! and is the single producer of batches to the backend: it seeds each batch
//! with the oldest eligible request, greedily appends compatible requests
//! from the same priority queue, optionally waits up to the configured queue
//! delay for a preferred batch size, and hands the batch to the executor.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::backend::{run_batch, Execution, ModelExecutor};
use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::request::InferenceRequest;

/// Monotonic time source for enqueue timestamps, deadlines, and queue
/// delays.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The default wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A scheduling policy behind a uniform enqueue surface. Handles can carry
/// a different policy without changes to the request contract.
pub trait Scheduler: Send + Sync {
    /// Accept a prepared request. Never blocks beyond queue-lock
    /// acquisition.
    fn enqueue(&self, execution: Execution) -> Result<()>;

    /// Stop the worker and drain queued requests as `Unavailable`.
    fn stop(&self);
}

/// Scheduling parameters derived from the model configuration.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub model_name: String,
    pub max_batch_size: u32,
    /// Sorted ascending; reaching any of these dispatches immediately.
    pub preferred_batch_sizes: Vec<u32>,
    pub max_queue_delay: Duration,
    pub priority_levels: u32,
}

impl BatcherConfig {
    pub fn from_model(config: &ModelConfig) -> Self {
        let batching = config.dynamic_batching.clone().unwrap_or_default();
        let mut preferred = batching.preferred_batch_sizes;
        preferred.sort_unstable();
        preferred.dedup();
        Self {
            model_name: config.name.clone(),
            max_batch_size: config.max_batch_size,
            preferred_batch_sizes: preferred,
            max_queue_delay: Duration::from_micros(batching.max_queue_delay_us),
            priority_levels: batching.priority_levels,
        }
    }

    /// Non-batching models still dispatch one request at a time.
    fn effective_max_batch(&self) -> u64 {
        u64::from(self.max_batch_size.max(1))
    }

    fn queue_count(&self) -> usize {
        self.priority_levels.max(1) as usize
    }
}

struct QueuedItem {
    execution: Execution,
    batch_size: u64,
    deadline: Option<Instant>,
}

struct State {
    /// Index 0 is the highest priority level.
    queues: Vec<VecDeque<QueuedItem>>,
    stopping: bool,
}

struct Shared {
    state: Mutex<State>,
    cv: Condvar,
}

/// Batcher counters exposed for status reporting.
#[derive(Debug, Clone, Default)]
pub struct BatcherStats {
    pub queued_requests: usize,
}

/// The default scheduler: priority FIFO with bounded-delay batch formation.
pub struct DynamicBatcher {
    config: BatcherConfig,
    clock: Arc<dyn Clock>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DynamicBatcher {
    pub fn new(config: BatcherConfig, executor: Arc<dyn ModelExecutor>) -> Self {
        Self::with_clock(config, executor, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: BatcherConfig,
        executor: Arc<dyn ModelExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queues: (0..config.queue_count()).map(|_| VecDeque::new()).collect(),
                stopping: false,
            }),
            cv: Condvar::new(),
        });

        let worker = Worker {
            shared: Arc::clone(&shared),
            executor,
            clock: Arc::clone(&clock),
            config: config.clone(),
        };
        let handle = std::thread::spawn(move || worker.run());

        Self {
            config,
            clock,
            shared,
            worker: Mutex::new(Some(handle)),
        }
    }

    pub fn stats(&self) -> BatcherStats {
        let state = self.shared.state.lock();
        BatcherStats {
            queued_requests: state.queues.iter().map(|q| q.len()).sum(),
        }
    }

    /// Map a (clamped) priority to its queue; higher levels sit at lower
    /// indices and are served first.
    fn queue_index(&self, priority: u32) -> usize {
        let levels = self.config.priority_levels;
        if levels == 0 {
            return 0;
        }
        let priority = priority.clamp(1, levels);
        (levels - priority) as usize
    }
}

impl Scheduler for DynamicBatcher {
    fn enqueue(&self, execution: Execution) -> Result<()> {
        let now = self.clock.now();
        let request = execution.request();
        let deadline = match request.timeout_microseconds() {
            0 => None,
            timeout_us => Some(now + Duration::from_micros(timeout_us)),
        };
        let queue_index = self.queue_index(request.priority());
        let batch_size = u64::from(request.batch_size().max(1));

        let mut state = self.shared.state.lock();
        if state.stopping {
            drop(state);
            let err = Error::unavailable(format!(
                "model '{}' is unloading",
                self.config.model_name
            ));
            execution.finish(Err(err.clone()));
            return Err(err);
        }
        state.queues[queue_index].push_back(QueuedItem {
            execution,
            batch_size,
            deadline,
        });
        drop(state);

        self.shared.cv.notify_one();
        Ok(())
    }

    fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stopping = true;
        }
        self.shared.cv.notify_all();

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for DynamicBatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    shared: Arc<Shared>,
    executor: Arc<dyn ModelExecutor>,
    clock: Arc<dyn Clock>,
    config: BatcherConfig,
}

impl Worker {
    fn run(self) {
        loop {
            let mut expired = Vec::new();
            let batch = self.next_batch(&mut expired);

            for execution in expired {
                let err = Error::deadline_exceeded(format!(
                    "request for model '{}' timed out before dispatch",
                    self.config.model_name
                ));
                execution.finish(Err(err));
            }

            match batch {
                None => return,
                Some(batch) if batch.is_empty() => continue,
                Some(batch) => {
                    debug!(
                        model = %self.config.model_name,
                        requests = batch.len(),
                        "dispatching batch"
                    );
                    run_batch(self.executor.as_ref(), batch);
                }
            }
        }
    }

    /// Block until a batch forms or the batcher stops (`None`). Expired
    /// requests encountered along the way are moved into `expired`; an
    /// empty batch is returned so they complete promptly.
    fn next_batch(&self, expired: &mut Vec<Execution>) -> Option<Vec<Execution>> {
        let mut state = self.shared.state.lock();

        let queue_index = loop {
            Self::take_expired(&mut state, self.clock.now(), expired);
            if state.stopping {
                let drained: Vec<QueuedItem> = state
                    .queues
                    .iter_mut()
                    .flat_map(|queue| queue.drain(..))
                    .collect();
                drop(state);
                for item in drained {
                    item.execution.finish(Err(Error::unavailable(format!(
                        "model '{}' is unloading",
                        self.config.model_name
                    ))));
                }
                return None;
            }
            if !expired.is_empty() {
                return Some(Vec::new());
            }
            match state.queues.iter().position(|queue| !queue.is_empty()) {
                Some(index) => break index,
                None => self.shared.cv.wait(&mut state),
            }
        };

        // Seed with the oldest request at this priority level.
        let mut batch = Vec::new();
        let mut total: u64 = 0;
        if let Some(seed) = state.queues[queue_index].pop_front() {
            total += seed.batch_size;
            batch.push(seed);
        }
        self.fill(&mut state, queue_index, &mut batch, &mut total, expired);

        // Below the smallest preferred size: wait for more arrivals, up to
        // the queue delay, dispatching the moment a preferred size is hit.
        if let Some(target) = self.preferred_target(total) {
            let deadline = self.clock.now() + self.config.max_queue_delay;
            while total < target
                && total < self.config.effective_max_batch()
                && !state.stopping
            {
                let timed_out = self
                    .shared
                    .cv
                    .wait_until(&mut state, deadline)
                    .timed_out();
                Self::take_expired(&mut state, self.clock.now(), expired);
                self.fill(&mut state, queue_index, &mut batch, &mut total, expired);
                if timed_out {
                    break;
                }
            }
        }
        drop(state);

        // Re-check deadlines at dispatch: a request never enters a batch
        // after its deadline.
        let now = self.clock.now();
        let mut live = Vec::with_capacity(batch.len());
        for item in batch {
            match item.deadline {
                Some(deadline) if deadline <= now => expired.push(item.execution),
                _ => live.push(item.execution),
            }
        }
        Some(live)
    }

    /// Greedily append from the head of the seed's queue while the batch
    /// stays within the size limit and the head stays compatible.
    fn fill(
        &self,
        state: &mut State,
        queue_index: usize,
        batch: &mut Vec<QueuedItem>,
        total: &mut u64,
        expired: &mut Vec<Execution>,
    ) {
        if batch.is_empty() {
            return;
        }
        // The seed request defines the shapes and outputs of the batch.
        let now = self.clock.now();
        let queue = &mut state.queues[queue_index];
        loop {
            let (is_expired, fits) = match queue.front() {
                None => break,
                Some(front) => {
                    let is_expired =
                        front.deadline.map_or(false, |deadline| deadline <= now);
                    let fits = *total + front.batch_size
                        <= self.config.effective_max_batch()
                        && compatible(
                            batch[0].execution.request(),
                            front.execution.request(),
                        );
                    (is_expired, fits)
                }
            };
            if !is_expired && !fits {
                break;
            }
            let Some(item) = queue.pop_front() else {
                break;
            };
            if is_expired {
                expired.push(item.execution);
            } else {
                *total += item.batch_size;
                batch.push(item);
            }
        }
    }

    /// The smallest preferred batch size worth waiting for, if waiting is
    /// configured and the running total is still below it.
    fn preferred_target(&self, total: u64) -> Option<u64> {
        let smallest = u64::from(*self.config.preferred_batch_sizes.first()?);
        if self.config.max_queue_delay.is_zero() || total >= smallest {
            return None;
        }
        Some(smallest)
    }

    fn take_expired(state: &mut State, now: Instant, expired: &mut Vec<Execution>) {
        for queue in state.queues.iter_mut() {
            let mut index = 0;
            while index < queue.len() {
                let is_expired = queue[index]
                    .deadline
                    .map_or(false, |deadline| deadline <= now);
                if is_expired {
                    if let Some(item) = queue.remove(index) {
                        expired.push(item.execution);
                    }
                } else {
                    index += 1;
                }
            }
        }
    }
}

/// Requests can share a batch only when their requested-output sets and
/// normalized per-input shapes are identical.
fn compatible(a: &InferenceRequest, b: &InferenceRequest) -> bool {
    if a.requested_outputs() != b.requested_outputs() {
        return false;
    }
    if a.input_count() != b.input_count() {
        return false;
    }
    a.inputs()
        .zip(b.inputs())
        .all(|(x, y)| x.name() == y.name() && x.shape() == y.shape())
}
