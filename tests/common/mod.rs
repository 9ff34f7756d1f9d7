//! Shared fixtures: on-disk repositories, deterministic test executors,
//! and byte-string tensor helpers.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use keel::{
    BackendFactory, BatchConvention, DataType, DynamicBatching, Error, Execution,
    MemoryReference, MemoryType, ModelConfig, ModelExecutor, Reshape, Result, TensorConfig,
};

/// Route test logs through tracing; safe to call from every test.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();
}

pub fn tensor(name: &str, data_type: DataType, dims: &[i64]) -> TensorConfig {
    TensorConfig {
        name: name.to_string(),
        data_type,
        dims: dims.to_vec(),
        reshape: None,
        is_shape_tensor: false,
    }
}

pub fn reshaped(mut config: TensorConfig, shape: &[i64]) -> TensorConfig {
    config.reshape = Some(Reshape {
        shape: shape.to_vec(),
    });
    config
}

/// An add/sub model over int32 tensors: `OUTPUT0 = INPUT0 + INPUT1`,
/// `OUTPUT1 = INPUT0 - INPUT1`.
pub fn add_sub_config(name: &str, max_batch_size: u32, dims: &[i64]) -> ModelConfig {
    ModelConfig {
        name: name.to_string(),
        max_batch_size,
        input: vec![
            tensor("INPUT0", DataType::Int32, dims),
            tensor("INPUT1", DataType::Int32, dims),
        ],
        output: vec![
            tensor("OUTPUT0", DataType::Int32, dims),
            tensor("OUTPUT1", DataType::Int32, dims),
        ],
        ..Default::default()
    }
}

/// The string flavor of the add/sub model, over length-prefixed byte
/// strings holding decimal integers.
pub fn string_add_sub_config(name: &str, elements: i64) -> ModelConfig {
    ModelConfig {
        name: name.to_string(),
        max_batch_size: 0,
        input: vec![
            tensor("INPUT0", DataType::Bytes, &[elements]),
            tensor("INPUT1", DataType::Bytes, &[elements]),
        ],
        output: vec![
            tensor("OUTPUT0", DataType::Bytes, &[elements]),
            tensor("OUTPUT1", DataType::Bytes, &[elements]),
        ],
        ..Default::default()
    }
}

pub fn with_batching(mut config: ModelConfig, batching: DynamicBatching) -> ModelConfig {
    config.dynamic_batching = Some(batching);
    config
}

pub fn with_convention(mut config: ModelConfig, convention: BatchConvention) -> ModelConfig {
    config.batch_convention = convention;
    config
}

/// Write `<root>/<name>/config.json` plus one artifact file per version.
pub fn write_model(root: &Path, config: &ModelConfig, versions: &[i64]) {
    let model_dir = root.join(&config.name);
    std::fs::create_dir_all(&model_dir).unwrap();
    std::fs::write(
        model_dir.join("config.json"),
        serde_json::to_string_pretty(config).unwrap(),
    )
    .unwrap();
    for version in versions {
        let version_dir = model_dir.join(version.to_string());
        std::fs::create_dir_all(&version_dir).unwrap();
        std::fs::write(version_dir.join("model.bin"), b"artifact").unwrap();
    }
}

// ---------------------------------------------------------------------------
// Byte-string tensors: per element a 4-byte little-endian length + payload.

pub fn pack_strings<S: AsRef<str>>(values: &[S]) -> Vec<u8> {
    let mut buffer = Vec::new();
    for value in values {
        let bytes = value.as_ref().as_bytes();
        buffer.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        buffer.extend_from_slice(bytes);
    }
    buffer
}

pub fn unpack_strings(mut buffer: &[u8]) -> Vec<String> {
    let mut values = Vec::new();
    while buffer.len() >= 4 {
        let len = u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
        buffer = &buffer[4..];
        values.push(String::from_utf8_lossy(&buffer[..len]).to_string());
        buffer = &buffer[len..];
    }
    values
}

pub fn pack_i32(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn unpack_i32(buffer: &[u8]) -> Vec<i32> {
    buffer
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

// ---------------------------------------------------------------------------
// Test executors

fn gather_input(execution: &Execution, name: &str) -> Result<Vec<u8>> {
    let input = execution.request().input(name)?;
    Ok(input.data().map(|d| d.gather()).unwrap_or_default())
}

fn output_shape(execution: &Execution, input_name: &str, batching: bool) -> Vec<i64> {
    let request = execution.request();
    let mut shape = Vec::new();
    if batching {
        shape.push(i64::from(request.batch_size()));
    }
    if let Ok(input) = request.input(input_name) {
        shape.extend_from_slice(input.shape());
    }
    shape
}

fn wants_output(execution: &Execution, name: &str) -> bool {
    let outputs = execution.request().requested_outputs();
    outputs.is_empty() || outputs.contains_key(name)
}

/// Element-wise int32 add/sub, one response per batch entry.
pub struct AddSubExecutor {
    batching: bool,
}

impl AddSubExecutor {
    /// `batching` matches the model's `max_batch_size > 0`: output shapes
    /// then carry the batch dimension back.
    pub fn new(batching: bool) -> Self {
        Self { batching }
    }

    fn run_one(&self, execution: &mut Execution) -> Result<()> {
        let in0 = unpack_i32(&gather_input(execution, "INPUT0")?);
        let in1 = unpack_i32(&gather_input(execution, "INPUT1")?);
        if in0.len() != in1.len() {
            return Err(Error::invalid_arg("input element counts differ"));
        }

        let shape = output_shape(execution, "INPUT0", self.batching);

        let sum: Vec<i32> = in0.iter().zip(&in1).map(|(a, b)| a + b).collect();
        let diff: Vec<i32> = in0.iter().zip(&in1).map(|(a, b)| a - b).collect();

        for (name, values) in [("OUTPUT0", sum), ("OUTPUT1", diff)] {
            if !wants_output(execution, name) {
                continue;
            }
            let bytes = pack_i32(&values);
            let output =
                execution
                    .response_mut()
                    .add_output(name, DataType::Int32, shape.clone());
            let buffer = output.allocate_buffer(bytes.len(), MemoryType::CpuPinned, 0)?;
            buffer.copy_from_slice(&bytes);
        }
        Ok(())
    }
}

impl ModelExecutor for AddSubExecutor {
    fn execute(&self, batch: &mut [Execution]) -> Vec<Result<()>> {
        batch.iter_mut().map(|e| self.run_one(e)).collect()
    }
}

/// Byte-string add/sub over decimal integers.
pub struct StringAddSubExecutor;

impl StringAddSubExecutor {
    fn run_one(&self, execution: &mut Execution) -> Result<()> {
        let in0 = unpack_strings(&gather_input(execution, "INPUT0")?);
        let in1 = unpack_strings(&gather_input(execution, "INPUT1")?);
        if in0.len() != in1.len() {
            return Err(Error::invalid_arg("input element counts differ"));
        }

        let parse = |v: &String| -> Result<i64> {
            v.parse()
                .map_err(|_| Error::invalid_arg(format!("not a number: '{v}'")))
        };
        let mut sum = Vec::with_capacity(in0.len());
        let mut diff = Vec::with_capacity(in0.len());
        for (a, b) in in0.iter().zip(&in1) {
            let (a, b) = (parse(a)?, parse(b)?);
            sum.push((a + b).to_string());
            diff.push((a - b).to_string());
        }

        let shape = output_shape(execution, "INPUT0", false);
        for (name, values) in [("OUTPUT0", sum), ("OUTPUT1", diff)] {
            if !wants_output(execution, name) {
                continue;
            }
            let bytes = pack_strings(&values);
            let output =
                execution
                    .response_mut()
                    .add_output(name, DataType::Bytes, shape.clone());
            let buffer = output.allocate_buffer(bytes.len(), MemoryType::Cpu, 0)?;
            buffer.copy_from_slice(&bytes);
        }
        Ok(())
    }
}

impl ModelExecutor for StringAddSubExecutor {
    fn execute(&self, batch: &mut [Execution]) -> Vec<Result<()>> {
        batch.iter_mut().map(|e| self.run_one(e)).collect()
    }
}

/// Succeeds without producing outputs; records the request ids of every
/// dispatched batch.
#[derive(Default)]
pub struct RecordingExecutor {
    batches: Mutex<Vec<Vec<String>>>,
}

impl RecordingExecutor {
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().iter().map(|b| b.len()).collect()
    }

    pub fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().clone()
    }
}

impl ModelExecutor for RecordingExecutor {
    fn execute(&self, batch: &mut [Execution]) -> Vec<Result<()>> {
        self.batches
            .lock()
            .push(batch.iter().map(|e| e.request().id().to_string()).collect());
        batch.iter().map(|_| Ok(())).collect()
    }
}

/// Blocks inside `execute` until released (subsequent batches run without
/// blocking); holds the scheduler worker so shutdown and timeout paths can
/// be exercised deterministically. Records dispatched request ids.
#[derive(Default)]
pub struct BlockingExecutor {
    released: Mutex<bool>,
    cv: Condvar,
    batches: Mutex<Vec<Vec<String>>>,
}

impl BlockingExecutor {
    pub fn release(&self) {
        *self.released.lock() = true;
        self.cv.notify_all();
    }

    pub fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().clone()
    }
}

impl ModelExecutor for BlockingExecutor {
    fn execute(&self, batch: &mut [Execution]) -> Vec<Result<()>> {
        self.batches
            .lock()
            .push(batch.iter().map(|e| e.request().id().to_string()).collect());
        let mut released = self.released.lock();
        while !*released {
            self.cv.wait(&mut released);
        }
        batch.iter().map(|_| Ok(())).collect()
    }
}

// ---------------------------------------------------------------------------
// Backend factory

type Builder =
    dyn Fn(&str, i64, &ModelConfig) -> Result<Arc<dyn ModelExecutor>> + Send + Sync;

/// Routes factory calls to a closure so tests can vary executors (and
/// failures) per (model, version).
pub struct TestFactory {
    builder: Box<Builder>,
}

impl TestFactory {
    pub fn new(
        builder: impl Fn(&str, i64, &ModelConfig) -> Result<Arc<dyn ModelExecutor>>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            builder: Box::new(builder),
        })
    }

    /// Every (model, version) gets the same executor.
    pub fn always(executor: Arc<dyn ModelExecutor>) -> Arc<Self> {
        Self::new(move |_, _, _| Ok(Arc::clone(&executor)))
    }
}

impl BackendFactory for TestFactory {
    fn create(
        &self,
        name: &str,
        version: i64,
        config: &ModelConfig,
        _repository_path: &Path,
    ) -> Result<Arc<dyn ModelExecutor>> {
        (self.builder)(name, version, config)
    }
}

/// A generously sized allocator for direct-handle tests.
pub fn test_allocator() -> Arc<dyn keel::ResponseAllocator> {
    let pools = Arc::new(keel::MemoryPools::new(64 << 20, &Default::default()));
    Arc::new(keel::PoolAllocator::new(pools))
}

/// Prepare and enqueue a request on a handle, returning the completion
/// receiver.
pub fn enqueue_on(
    handle: &keel::BackendHandle,
    mut request: keel::InferenceRequest,
) -> tokio::sync::oneshot::Receiver<Result<keel::InferenceResponse>> {
    request.prepare(handle).unwrap();
    let factory = keel::ResponseFactory::new(
        request.id(),
        handle.name(),
        handle.version(),
        test_allocator(),
    );
    let response = factory.create_response();
    let (tx, rx) = tokio::sync::oneshot::channel();
    handle.enqueue(Execution::new(request, response, tx)).unwrap();
    rx
}

/// Build a prepared int32 input carrying `values`.
pub fn int32_input(name: &str, shape: &[i64], values: &[i32]) -> keel::Input {
    keel::Input::new(name, shape)
        .with_data_type(DataType::Int32)
        .with_data(MemoryReference::from_bytes(pack_i32(values)))
}

/// Build a byte-string input carrying `values`.
pub fn string_input<S: AsRef<str>>(name: &str, shape: &[i64], values: &[S]) -> keel::Input {
    keel::Input::new(name, shape)
        .with_data_type(DataType::Bytes)
        .with_data(MemoryReference::from_bytes(pack_strings(values)))
}
