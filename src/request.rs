//! Owned inference requests and their normalization against the model
//! configuration.
//!
//! A request is mutable while the caller assembles it: inputs and requested
//! outputs can be added and removed freely, each mutation marking the
//! request dirty. `prepare` normalizes the dirty request against the target
//! model's configuration and freezes it for the scheduler; further mutation
//! requires another `prepare`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tracing::debug;

use crate::backend::BackendHandle;
use crate::config::{self, BatchConvention, DataType, TensorConfig, WILDCARD_DIM};
use crate::error::{Error, Result};
use crate::memory::{MemoryReference, MemoryType};

/// Request flag bits.
pub mod flags {
    pub const NONE: u32 = 0;
    /// First request of a correlated sequence.
    pub const SEQUENCE_START: u32 = 1;
    /// Last request of a correlated sequence.
    pub const SEQUENCE_END: u32 = 2;
}

/// One input tensor of a request.
///
/// `original_shape` is what the caller declared; `shape` is the working
/// shape normalization derives from it (batch dimension stripped for
/// batching models, reshape applied).
#[derive(Debug, Clone)]
pub struct Input {
    name: String,
    data_type: Option<DataType>,
    original_shape: Vec<i64>,
    shape: Vec<i64>,
    batch_byte_size: u64,
    data: Option<MemoryReference>,
}

impl Input {
    pub fn new(name: impl Into<String>, shape: &[i64]) -> Self {
        Self {
            name: name.into(),
            data_type: None,
            original_shape: shape.to_vec(),
            shape: Vec::new(),
            batch_byte_size: 0,
            data: None,
        }
    }

    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = Some(data_type);
        self
    }

    pub fn with_batch_byte_size(mut self, byte_size: u64) -> Self {
        self.batch_byte_size = byte_size;
        self
    }

    pub fn with_data(mut self, data: MemoryReference) -> Self {
        self.data = Some(data);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolved from the model configuration during normalization.
    pub fn data_type(&self) -> Option<DataType> {
        self.data_type
    }

    pub fn original_shape(&self) -> &[i64] {
        &self.original_shape
    }

    /// The working shape; empty until the request is prepared.
    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn batch_byte_size(&self) -> u64 {
        self.batch_byte_size
    }

    pub fn data(&self) -> Option<&MemoryReference> {
        self.data.as_ref()
    }

    /// Append a chunk of caller-owned content.
    pub fn append_data(
        &mut self,
        bytes: impl Into<Arc<[u8]>>,
        memory_type: MemoryType,
        device_id: i64,
    ) {
        self.data
            .get_or_insert_with(MemoryReference::new)
            .append(bytes, memory_type, device_id);
    }

    /// Attach a shared memory reference; refuses to overwrite existing data.
    pub fn set_data(&mut self, data: MemoryReference) -> Result<()> {
        if self.data.is_some() {
            return Err(Error::invalid_arg(format!(
                "input '{}' already has data, can't overwrite",
                self.name
            )));
        }
        self.data = Some(data);
        Ok(())
    }

    pub fn remove_all_data(&mut self) {
        self.data = None;
    }
}

/// An output the caller asked for, with its classification count (0 means
/// raw tensor output).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedOutput {
    pub name: String,
    pub classification_count: u32,
}

/// Where a frozen input resolves from.
#[derive(Debug)]
enum InputSlot {
    Original,
    Override(Arc<Input>),
}

/// An owned inference request.
#[derive(Debug)]
pub struct InferenceRequest {
    id: String,
    correlation_id: u64,
    flags: u32,
    model_name: String,
    requested_version: i64,
    priority: u32,
    timeout_us: u64,
    batch_size: u32,
    original_inputs: BTreeMap<String, Input>,
    override_inputs: BTreeMap<String, Arc<Input>>,
    inputs: BTreeMap<String, InputSlot>,
    requested_outputs: BTreeMap<String, RequestedOutput>,
    needs_normalization: bool,
    prepared: bool,
}

impl InferenceRequest {
    /// A new request for the named model; requested version `-1` lets the
    /// model's version policy choose.
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            correlation_id: 0,
            flags: flags::NONE,
            model_name: model_name.into(),
            requested_version: -1,
            priority: 0,
            timeout_us: 0,
            batch_size: 0,
            original_inputs: BTreeMap::new(),
            override_inputs: BTreeMap::new(),
            inputs: BTreeMap::new(),
            requested_outputs: BTreeMap::new(),
            needs_normalization: true,
            prepared: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }

    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    pub fn set_correlation_id(&mut self, correlation_id: u64) {
        self.correlation_id = correlation_id;
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn set_flags(&mut self, flags: u32) {
        self.flags = flags;
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn requested_version(&self) -> i64 {
        self.requested_version
    }

    pub fn set_requested_version(&mut self, version: i64) {
        self.requested_version = version;
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: u32) {
        self.priority = priority;
    }

    pub fn timeout_microseconds(&self) -> u64 {
        self.timeout_us
    }

    pub fn set_timeout_microseconds(&mut self, timeout_us: u64) {
        self.timeout_us = timeout_us;
    }

    /// The request-level batch size. Under the leading-dimension convention
    /// this is derived during normalization; under the request-level
    /// convention the caller sets it.
    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    pub fn set_batch_size(&mut self, batch_size: u32) {
        self.batch_size = batch_size;
        self.mark_dirty();
    }

    pub fn add_original_input(&mut self, input: Input) -> Result<()> {
        let name = input.name.clone();
        if self.original_inputs.contains_key(&name) {
            return Err(Error::invalid_arg(format!(
                "input '{}' already exists in request",
                name
            )));
        }
        self.original_inputs.insert(name, input);
        self.mark_dirty();
        Ok(())
    }

    /// Mutable access to an original input; marks the request dirty.
    pub fn mutable_original_input(&mut self, name: &str) -> Result<&mut Input> {
        self.needs_normalization = true;
        self.prepared = false;
        self.original_inputs.get_mut(name).ok_or_else(|| {
            Error::invalid_arg(format!("input '{}' does not exist in request", name))
        })
    }

    pub fn remove_original_input(&mut self, name: &str) -> Result<()> {
        if self.original_inputs.remove(name).is_none() {
            return Err(Error::invalid_arg(format!(
                "input '{}' does not exist in request",
                name
            )));
        }
        self.mark_dirty();
        Ok(())
    }

    pub fn remove_all_original_inputs(&mut self) {
        self.original_inputs.clear();
        self.mark_dirty();
    }

    /// Install an override input, replacing any previous override of the
    /// same name. Overrides are injected by pipelines after `prepare` and
    /// are visible through the frozen view until the next `prepare` clears
    /// them.
    pub fn add_override_input(&mut self, input: Input) -> Arc<Input> {
        let input = Arc::new(input);
        let name = input.name.clone();
        self.override_inputs
            .insert(name.clone(), Arc::clone(&input));
        self.inputs.insert(name, InputSlot::Override(Arc::clone(&input)));
        input
    }

    pub fn add_requested_output(
        &mut self,
        name: impl Into<String>,
        classification_count: u32,
    ) -> Result<()> {
        let name = name.into();
        if self.requested_outputs.contains_key(&name) {
            return Err(Error::invalid_arg(format!(
                "output '{}' already requested",
                name
            )));
        }
        self.requested_outputs.insert(
            name.clone(),
            RequestedOutput {
                name,
                classification_count,
            },
        );
        self.mark_dirty();
        Ok(())
    }

    pub fn remove_requested_output(&mut self, name: &str) -> Result<()> {
        if self.requested_outputs.remove(name).is_none() {
            return Err(Error::invalid_arg(format!(
                "output '{}' does not exist in request",
                name
            )));
        }
        self.mark_dirty();
        Ok(())
    }

    pub fn remove_all_requested_outputs(&mut self) {
        self.requested_outputs.clear();
        self.mark_dirty();
    }

    pub fn original_inputs(&self) -> &BTreeMap<String, Input> {
        &self.original_inputs
    }

    pub fn requested_outputs(&self) -> &BTreeMap<String, RequestedOutput> {
        &self.requested_outputs
    }

    /// Look up an input through the frozen view (originals plus overrides).
    pub fn input(&self, name: &str) -> Result<&Input> {
        match self.inputs.get(name) {
            Some(InputSlot::Original) => self.original_inputs.get(name).ok_or_else(|| {
                Error::internal(format!("frozen view lost original input '{}'", name))
            }),
            Some(InputSlot::Override(input)) => Ok(input),
            None => Err(Error::invalid_arg(format!(
                "input '{}' does not exist in request",
                name
            ))),
        }
    }

    /// Iterate the frozen input view in name order.
    pub fn inputs(&self) -> impl Iterator<Item = &Input> + '_ {
        self.inputs.iter().filter_map(|(name, slot)| match slot {
            InputSlot::Original => self.original_inputs.get(name),
            InputSlot::Override(input) => Some(input.as_ref()),
        })
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn needs_normalization(&self) -> bool {
        self.needs_normalization
    }

    /// True once `prepare` succeeded with no mutation since.
    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Normalize the request against the backend's configuration and freeze
    /// it for scheduling. Idempotent: repeated calls without mutation only
    /// rebuild the frozen input view.
    pub fn prepare(&mut self, backend: &BackendHandle) -> Result<()> {
        // Overrides added during a previous execution are stale.
        self.inputs.clear();
        self.override_inputs.clear();

        if self.needs_normalization {
            match backend.config().batch_convention {
                BatchConvention::RequestLevel => self.normalize_request_level(backend)?,
                BatchConvention::LeadingDimension => {
                    self.normalize_leading_dimension(backend)?
                }
            }
            self.needs_normalization = false;
        }

        for name in self.original_inputs.keys() {
            self.inputs.insert(name.clone(), InputSlot::Original);
        }
        self.prepared = true;

        debug!(
            model = %self.model_name,
            id = %self.id,
            batch_size = self.batch_size,
            inputs = self.inputs.len(),
            "prepared request"
        );
        Ok(())
    }

    fn mark_dirty(&mut self) {
        self.needs_normalization = true;
        self.prepared = false;
    }

    fn clamp_priority(&mut self, backend: &BackendHandle) {
        if self.priority == 0 || self.priority > backend.max_priority_level() {
            self.priority = backend.default_priority_level();
        }
    }

    fn check_requested_outputs(&self, backend: &BackendHandle) -> Result<()> {
        for name in self.requested_outputs.keys() {
            backend.output(name)?;
        }
        Ok(())
    }

    fn check_input_count(&self, backend: &BackendHandle) -> Result<()> {
        let expected = backend.config().input.len();
        if self.original_inputs.len() != expected {
            return Err(Error::invalid_arg(format!(
                "expected {} inputs but got {} inputs for model '{}'",
                expected,
                self.original_inputs.len(),
                self.model_name
            )));
        }
        Ok(())
    }

    fn check_batch_bounds(&self, backend: &BackendHandle) -> Result<()> {
        if self.batch_size < 1 {
            return Err(Error::invalid_arg(format!(
                "inference request batch-size must be >= 1 for '{}'",
                self.model_name
            )));
        }
        let max_batch_size = backend.config().max_batch_size;
        if self.batch_size != 1 && self.batch_size > max_batch_size {
            return Err(Error::invalid_arg(format!(
                "inference request batch-size must be <= {} for '{}'",
                max_batch_size, self.model_name
            )));
        }
        Ok(())
    }

    /// Request-level convention: the caller supplies `batch_size` and input
    /// shapes without the batch dimension; caller-supplied byte sizes are
    /// cross-validated.
    fn normalize_request_level(&mut self, backend: &BackendHandle) -> Result<()> {
        self.clamp_priority(backend);
        self.check_batch_bounds(backend)?;
        self.check_requested_outputs(backend)?;
        self.check_input_count(backend)?;

        let model_name = self.model_name.clone();
        let max_batch_size = backend.config().max_batch_size;
        let batch_size = self.batch_size;

        for (name, input) in self.original_inputs.iter_mut() {
            let tensor = backend.input(name)?;
            input.data_type = Some(tensor.data_type);
            input.shape = input.original_shape.clone();

            if !input.shape.is_empty() {
                check_shape_against_config(&model_name, tensor, &input.shape)?;
                apply_reshape(tensor, &mut input.shape);
            } else {
                // No shape in the request: the configuration must fully
                // specify one.
                let dims = match &tensor.reshape {
                    Some(reshape) => &reshape.shape,
                    None => &tensor.dims,
                };
                for &dim in dims {
                    if dim < 0 {
                        return Err(variable_size_error(&model_name, name));
                    }
                }
                input.shape = dims.clone();
            }

            if tensor.data_type.is_fixed_size() {
                // The full tensor is [batch-size, working-shape] for
                // batching models (shape tensors excluded), or just the
                // working shape otherwise.
                let mut byte_size = config::byte_size(tensor.data_type, &input.shape)
                    .ok_or_else(|| variable_size_error(&model_name, name))?;
                if max_batch_size > 0 && !tensor.is_shape_tensor {
                    byte_size *= batch_size as u64;
                }

                if input.batch_byte_size != 0 && input.batch_byte_size != byte_size {
                    return Err(Error::invalid_arg(format!(
                        "specific batch-byte-size for input '{}' does not match expected \
                         byte-size calculated from shape and datatype for model '{}'",
                        name, model_name
                    )));
                }
                input.batch_byte_size = byte_size;
            }
            // Variable-size datatypes keep the caller-supplied byte size.
        }

        Ok(())
    }

    /// Leading-dimension convention: every input carries the batch size as
    /// its first dimension, which is stripped into the request-level batch
    /// size.
    fn normalize_leading_dimension(&mut self, backend: &BackendHandle) -> Result<()> {
        self.clamp_priority(backend);
        self.check_requested_outputs(backend)?;
        self.check_input_count(backend)?;

        let model_name = self.model_name.clone();
        let max_batch_size = backend.config().max_batch_size;

        if max_batch_size == 0 {
            // No framework batching: batch size 1, shapes kept as-is.
            self.batch_size = 1;
            for input in self.original_inputs.values_mut() {
                input.shape = input.original_shape.clone();
            }
        } else {
            // Each input must share the same leading dimension, which is
            // the batch size.
            let mut batch_size: i64 = 0;
            for (name, input) in self.original_inputs.iter_mut() {
                if input.original_shape.is_empty() {
                    return Err(Error::invalid_arg(format!(
                        "input '{}' has no shape but model requires batch dimension for '{}'",
                        name, model_name
                    )));
                }
                let leading = input.original_shape[0];
                if batch_size == 0 {
                    batch_size = leading;
                } else if leading != batch_size {
                    return Err(Error::invalid_arg(format!(
                        "input '{}' batch size does not match other inputs for '{}'",
                        name, model_name
                    )));
                }
                input.shape = input.original_shape[1..].to_vec();
            }

            if !(1..=i64::from(u32::MAX)).contains(&batch_size) {
                return Err(Error::invalid_arg(format!(
                    "inference request batch-size must be >= 1 for '{}'",
                    model_name
                )));
            }
            self.batch_size = batch_size as u32;
        }

        self.check_batch_bounds(backend)?;

        for (name, input) in self.original_inputs.iter_mut() {
            let tensor = backend.input(name)?;
            input.data_type = Some(tensor.data_type);

            check_shape_against_config(&model_name, tensor, &input.shape)?;
            apply_reshape(tensor, &mut input.shape);

            // An input with no attached content gets an empty reference.
            if input.data.is_none() {
                input.data = Some(MemoryReference::new());
            }
            input.batch_byte_size = input
                .data
                .as_ref()
                .map(|d| d.total_byte_size())
                .unwrap_or(0);
        }

        Ok(())
    }
}

fn variable_size_error(model_name: &str, input_name: &str) -> Error {
    Error::invalid_arg(format!(
        "model supports variable-size for input '{}', request must specify \
         input shape for model '{}'",
        input_name, model_name
    ))
}

fn check_shape_against_config(
    model_name: &str,
    tensor: &TensorConfig,
    shape: &[i64],
) -> Result<()> {
    if !config::compare_dims_with_wildcard(&tensor.dims, shape) {
        return Err(Error::invalid_arg(format!(
            "unexpected shape for input '{}' for model '{}'. Expected {}, got {}",
            tensor.name,
            model_name,
            config::dims_to_string(&tensor.dims),
            config::dims_to_string(shape)
        )));
    }
    // A wildcard in the configuration matches anything, including a
    // wildcard in the request; the request must still be concrete.
    if shape.iter().any(|&dim| dim < 0) {
        return Err(variable_size_error(model_name, &tensor.name));
    }
    Ok(())
}

/// Rewrite `shape` per the tensor's reshape, propagating captured wildcard
/// values in order. Wildcard counts are validated at configuration load.
fn apply_reshape(tensor: &TensorConfig, shape: &mut Vec<i64>) {
    let Some(reshape) = &tensor.reshape else {
        return;
    };

    let mut captured: VecDeque<i64> = tensor
        .dims
        .iter()
        .zip(shape.iter())
        .filter(|(&dim, _)| dim == WILDCARD_DIM)
        .map(|(_, &value)| value)
        .collect();

    shape.clear();
    for &dim in &reshape.shape {
        if dim == WILDCARD_DIM {
            match captured.pop_front() {
                Some(value) => shape.push(value),
                None => shape.push(dim),
            }
        } else {
            shape.push(dim);
        }
    }
}
