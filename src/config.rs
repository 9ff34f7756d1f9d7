//! Declarative per-model configuration.
//!
//! Every model directory carries a `config.json` describing its inputs,
//! outputs, batching limits, version policy, and scheduling preferences.
//! The configuration is immutable once a model version is loaded; the
//! request normalizer and the batcher both derive their rules from it.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Wildcard dimension: matches any concrete size in that position.
pub const WILDCARD_DIM: i64 = -1;

/// Tensor element datatypes. `Bytes` is the variable-size byte-string type
/// (serialized per element as a 4-byte little-endian length plus payload);
/// all others are fixed-size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Bool,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int8,
    Int16,
    Int32,
    Int64,
    Fp16,
    Fp32,
    Fp64,
    Bytes,
}

impl DataType {
    /// Size in bytes of one element, or `None` for the variable-size
    /// byte-string type.
    pub fn element_size(&self) -> Option<u64> {
        match self {
            Self::Bool | Self::Uint8 | Self::Int8 => Some(1),
            Self::Uint16 | Self::Int16 | Self::Fp16 => Some(2),
            Self::Uint32 | Self::Int32 | Self::Fp32 => Some(4),
            Self::Uint64 | Self::Int64 | Self::Fp64 => Some(8),
            Self::Bytes => None,
        }
    }

    pub fn is_fixed_size(&self) -> bool {
        self.element_size().is_some()
    }
}

/// A configured rewrite of a tensor's declared shape. Wildcards in the
/// reshape receive, in order, the values captured from the wildcards of the
/// declared `dims`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reshape {
    pub shape: Vec<i64>,
}

/// One input or output tensor declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorConfig {
    pub name: String,
    pub data_type: DataType,
    pub dims: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reshape: Option<Reshape>,
    #[serde(default)]
    pub is_shape_tensor: bool,
}

/// Which versions of a model are served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionPolicy {
    /// Serve the `num_versions` highest versions present.
    Latest { num_versions: u32 },
    /// Serve every version present.
    All,
    /// Serve exactly the listed versions.
    Specific { versions: Vec<i64> },
}

impl Default for VersionPolicy {
    fn default() -> Self {
        Self::Latest { num_versions: 1 }
    }
}

/// Dynamic batching preferences.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicBatching {
    /// Batch sizes that trigger immediate dispatch once reached.
    #[serde(default)]
    pub preferred_batch_sizes: Vec<u32>,
    /// Upper bound on how long the batcher waits for more arrivals, in
    /// microseconds.
    #[serde(default)]
    pub max_queue_delay_us: u64,
    /// Number of priority levels; 0 means a single unprioritized queue.
    #[serde(default)]
    pub priority_levels: u32,
    /// Priority assigned to requests that don't carry one.
    #[serde(default)]
    pub default_priority_level: u32,
}

/// How request tensors encode the batch dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchConvention {
    /// Batch size is a request-level integer; input shapes do not carry the
    /// batch dimension.
    RequestLevel,
    /// Input shapes carry the batch size as their leading dimension, which
    /// normalization strips.
    #[default]
    LeadingDimension,
}

/// The per-model configuration, as read from `config.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub name: String,
    /// 0 means the model does not support batching.
    #[serde(default)]
    pub max_batch_size: u32,
    #[serde(default)]
    pub input: Vec<TensorConfig>,
    #[serde(default)]
    pub output: Vec<TensorConfig>,
    #[serde(default)]
    pub version_policy: VersionPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_batching: Option<DynamicBatching>,
    #[serde(default)]
    pub batch_convention: BatchConvention,
}

impl ModelConfig {
    /// Look up an input tensor declaration by name.
    pub fn input(&self, name: &str) -> Result<&TensorConfig> {
        self.input.iter().find(|t| t.name == name).ok_or_else(|| {
            Error::not_found(format!(
                "unknown input '{}' for model '{}'",
                name, self.name
            ))
        })
    }

    /// Look up an output tensor declaration by name.
    pub fn output(&self, name: &str) -> Result<&TensorConfig> {
        self.output.iter().find(|t| t.name == name).ok_or_else(|| {
            Error::not_found(format!(
                "unknown output '{}' for model '{}'",
                name, self.name
            ))
        })
    }

    pub fn max_priority_level(&self) -> u32 {
        self.dynamic_batching
            .as_ref()
            .map(|d| d.priority_levels)
            .unwrap_or(0)
    }

    pub fn default_priority_level(&self) -> u32 {
        self.dynamic_batching
            .as_ref()
            .map(|d| d.default_priority_level)
            .unwrap_or(0)
    }

    /// Cross-check the configuration, reporting the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.input.is_empty() {
            return Err(Error::invalid_arg(format!(
                "model '{}' must specify at least one input",
                self.name
            )));
        }
        if self.output.is_empty() {
            return Err(Error::invalid_arg(format!(
                "model '{}' must specify at least one output",
                self.name
            )));
        }

        for (kind, tensors) in [("input", &self.input), ("output", &self.output)] {
            let mut seen = std::collections::BTreeSet::new();
            for tensor in tensors.iter() {
                if !seen.insert(tensor.name.as_str()) {
                    return Err(Error::invalid_arg(format!(
                        "duplicate {} '{}' for model '{}'",
                        kind, tensor.name, self.name
                    )));
                }
                validate_tensor(&self.name, kind, tensor)?;
            }
        }

        match &self.version_policy {
            VersionPolicy::Latest { num_versions } if *num_versions == 0 => {
                return Err(Error::invalid_arg(format!(
                    "version_policy.latest.num_versions must be >= 1 for model '{}'",
                    self.name
                )));
            }
            VersionPolicy::Specific { versions } => {
                if versions.is_empty() {
                    return Err(Error::invalid_arg(format!(
                        "version_policy.specific.versions must not be empty for model '{}'",
                        self.name
                    )));
                }
                if let Some(v) = versions.iter().find(|v| **v < 1) {
                    return Err(Error::invalid_arg(format!(
                        "version_policy.specific.versions contains invalid version {} for model '{}'",
                        v, self.name
                    )));
                }
            }
            _ => {}
        }

        if let Some(batching) = &self.dynamic_batching {
            if self.max_batch_size == 0 {
                return Err(Error::invalid_arg(format!(
                    "dynamic_batching requires max_batch_size > 0 for model '{}'",
                    self.name
                )));
            }
            for preferred in &batching.preferred_batch_sizes {
                if *preferred == 0 || *preferred > self.max_batch_size {
                    return Err(Error::invalid_arg(format!(
                        "dynamic_batching.preferred_batch_sizes entry {} must be in [1, {}] for model '{}'",
                        preferred, self.max_batch_size, self.name
                    )));
                }
            }
            if batching.default_priority_level > batching.priority_levels {
                return Err(Error::invalid_arg(format!(
                    "dynamic_batching.default_priority_level {} exceeds priority_levels {} for model '{}'",
                    batching.default_priority_level, batching.priority_levels, self.name
                )));
            }
        }

        Ok(())
    }
}

fn validate_tensor(model: &str, kind: &str, tensor: &TensorConfig) -> Result<()> {
    if tensor.dims.is_empty() {
        return Err(Error::invalid_arg(format!(
            "{} '{}' must specify dims for model '{}'",
            kind, tensor.name, model
        )));
    }
    if let Some(dim) = tensor.dims.iter().find(|d| **d < 1 && **d != WILDCARD_DIM) {
        return Err(Error::invalid_arg(format!(
            "{} '{}' has invalid dim {} for model '{}'",
            kind, tensor.name, dim, model
        )));
    }

    if let Some(reshape) = &tensor.reshape {
        if let Some(dim) = reshape
            .shape
            .iter()
            .find(|d| **d < 1 && **d != WILDCARD_DIM)
        {
            return Err(Error::invalid_arg(format!(
                "{} '{}' has invalid reshape dim {} for model '{}'",
                kind, tensor.name, dim, model
            )));
        }

        // Each wildcard in the reshape pairs, in order, with a wildcard in
        // dims; the counts must line up for the pairing to be total.
        let dims_wildcards = tensor.dims.iter().filter(|d| **d == WILDCARD_DIM).count();
        let reshape_wildcards = reshape
            .shape
            .iter()
            .filter(|d| **d == WILDCARD_DIM)
            .count();
        if dims_wildcards != reshape_wildcards {
            return Err(Error::invalid_arg(format!(
                "{} '{}' reshape has {} variable-size dims but dims has {} for model '{}'",
                kind, tensor.name, reshape_wildcards, dims_wildcards, model
            )));
        }

        if dims_wildcards == 0 {
            let from = element_count(&tensor.dims);
            let to = element_count(&reshape.shape);
            if from != to {
                return Err(Error::invalid_arg(format!(
                    "{} '{}' reshape element count does not match dims for model '{}'",
                    kind, tensor.name, model
                )));
            }
        }
    }

    Ok(())
}

/// True when `shape` matches `config_dims` element-wise, with wildcard
/// positions in `config_dims` matching any size.
pub fn compare_dims_with_wildcard(config_dims: &[i64], shape: &[i64]) -> bool {
    config_dims.len() == shape.len()
        && config_dims
            .iter()
            .zip(shape)
            .all(|(&c, &s)| c == WILDCARD_DIM || c == s)
}

/// Render a shape as `[1,2,-1]` for error messages.
pub fn dims_to_string(dims: &[i64]) -> String {
    let parts: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
    format!("[{}]", parts.join(","))
}

/// Number of elements in a fully-specified shape, or `None` if any
/// dimension is a wildcard. A zero-rank shape holds one element.
pub fn element_count(shape: &[i64]) -> Option<u64> {
    let mut count: u64 = 1;
    for &dim in shape {
        if dim < 0 {
            return None;
        }
        count = count.checked_mul(dim as u64)?;
    }
    Some(count)
}

/// Byte size of a tensor with the given datatype and fully-specified shape.
/// `None` for variable-size datatypes or wildcard shapes.
pub fn byte_size(data_type: DataType, shape: &[i64]) -> Option<u64> {
    Some(data_type.element_size()? * element_count(shape)?)
}
