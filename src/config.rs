//! Configuration for sessions, models and the host audio environment

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::InferenceBackend;
use crate::error::{Result, RtInferError};

/// Model payload: a filesystem path handed to the runtime, or the model
/// bytes embedded directly in the binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelPayload {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

/// One model entry per backend tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelData {
    pub backend: InferenceBackend,
    pub payload: ModelPayload,
    /// Named entry point inside the model file, for runtimes that support
    /// multiple callables per artifact.
    #[serde(default)]
    pub entry_point: Option<String>,
}

impl ModelData {
    pub fn from_path<P: Into<PathBuf>>(backend: InferenceBackend, path: P) -> Self {
        Self {
            backend,
            payload: ModelPayload::Path(path.into()),
            entry_point: None,
        }
    }

    pub fn from_bytes(backend: InferenceBackend, bytes: Vec<u8>) -> Self {
        Self {
            backend,
            payload: ModelPayload::Bytes(bytes),
            entry_point: None,
        }
    }

    /// Whether the payload is embedded bytes rather than a path.
    pub fn is_binary(&self) -> bool {
        matches!(self.payload, ModelPayload::Bytes(_))
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.payload {
            ModelPayload::Path(p) => Some(p),
            ModelPayload::Bytes(_) => None,
        }
    }
}

/// Input and output tensor shapes for one backend.
///
/// `backend: None` marks the entry as universal; at resolve time universal
/// entries are cloned for every backend in `model_data` that has no
/// dedicated entry of its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorShape {
    #[serde(default)]
    pub backend: Option<InferenceBackend>,
    pub input_shape: Vec<Vec<i64>>,
    pub output_shape: Vec<Vec<i64>>,
}

impl TensorShape {
    pub fn universal(input_shape: Vec<Vec<i64>>, output_shape: Vec<Vec<i64>>) -> Self {
        Self {
            backend: None,
            input_shape,
            output_shape,
        }
    }

    pub fn for_backend(
        backend: InferenceBackend,
        input_shape: Vec<Vec<i64>>,
        output_shape: Vec<Vec<i64>>,
    ) -> Self {
        Self {
            backend: Some(backend),
            input_shape,
            output_shape,
        }
    }

    /// Flat element count of input tensor `i`.
    pub fn input_size(&self, i: usize) -> usize {
        self.input_shape[i].iter().product::<i64>() as usize
    }

    /// Flat element count of output tensor `i`.
    pub fn output_size(&self, i: usize) -> usize {
        self.output_shape[i].iter().product::<i64>() as usize
    }
}

/// Stream adaptation parameters for the pre/post-processor.
///
/// A stream sample count of 0 marks the tensor as non-streaming; its
/// values are exchanged through the auxiliary scalar interface instead of
/// the ring buffers. Empty vectors are filled with defaults at resolve
/// time: one channel per tensor, stream length = flat size / channels,
/// zero internal latency.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingSpec {
    #[serde(default)]
    pub input_channels: Vec<usize>,
    #[serde(default)]
    pub input_stream_samples: Vec<usize>,
    #[serde(default)]
    pub output_channels: Vec<usize>,
    #[serde(default)]
    pub output_stream_samples: Vec<usize>,
    /// Latency already incurred inside the model, per output tensor,
    /// in samples, as asserted by the model author.
    #[serde(default)]
    pub internal_latency: Vec<usize>,
}

fn default_parallel() -> usize {
    1
}

/// Immutable per-session inference configuration.
///
/// Construct with [`InferenceConfig::new`] or load from a TOML file, then
/// hand to the handler; [`resolve`](InferenceConfig::resolve) clones
/// universal shapes per backend, fills processing-spec defaults and
/// validates the invariants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceConfig {
    pub model_data: Vec<ModelData>,
    pub tensor_shape: Vec<TensorShape>,
    #[serde(default)]
    pub processing_spec: ProcessingSpec,
    /// Worst-case latency of one forward pass, in milliseconds.
    pub max_inference_time: f32,
    /// Untimed forward passes run at model load.
    #[serde(default)]
    pub warm_up: u32,
    /// When true, backend instances are never shared across sessions.
    #[serde(default)]
    pub session_exclusive_processor: bool,
    #[serde(default = "default_parallel")]
    pub num_parallel_processors: usize,
    /// Fraction of one audio period the audio thread may block waiting
    /// for a result. `None` means the audio thread never blocks.
    #[serde(default)]
    pub wait_in_process_block: Option<f32>,
}

impl InferenceConfig {
    pub fn new(
        model_data: Vec<ModelData>,
        tensor_shape: Vec<TensorShape>,
        max_inference_time: f32,
    ) -> Self {
        Self {
            model_data,
            tensor_shape,
            processing_spec: ProcessingSpec::default(),
            max_inference_time,
            warm_up: 0,
            session_exclusive_processor: false,
            num_parallel_processors: 1,
            wait_in_process_block: None,
        }
    }

    /// Load a configuration from a TOML file and resolve it.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RtInferError::config(format!("Failed to read config file: {}", e)))?;

        let config: InferenceConfig = toml::from_str(&content)
            .map_err(|e| RtInferError::config(format!("Failed to parse config file: {}", e)))?;

        config.resolve()
    }

    /// Save the configuration to a TOML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| RtInferError::config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| RtInferError::config(format!("Failed to write config file: {}", e)))
    }

    /// Return a normalized and validated copy: universal shape entries are
    /// cloned per backend, processing-spec defaults filled in, exclusive
    /// sessions forced to a single parallel processor.
    pub fn resolve(&self) -> Result<InferenceConfig> {
        let mut resolved = self.clone();
        resolved.normalize()?;
        resolved.validate()?;
        Ok(resolved)
    }

    fn normalize(&mut self) -> Result<()> {
        if self.tensor_shape.is_empty() {
            return Err(RtInferError::shape(
                "At least one tensor shape entry is required",
            ));
        }

        // Clone the universal entry for every backend that lacks its own.
        for model in &self.model_data {
            let has_own = self
                .tensor_shape
                .iter()
                .any(|s| s.backend == Some(model.backend));
            if !has_own {
                let universal = self
                    .tensor_shape
                    .iter()
                    .find(|s| s.backend.is_none())
                    .cloned()
                    .ok_or_else(|| {
                        RtInferError::shape(format!(
                            "No tensor shape provided for backend {}",
                            model.backend
                        ))
                    })?;
                self.tensor_shape.push(TensorShape {
                    backend: Some(model.backend),
                    ..universal
                });
            }
        }

        let num_inputs = self.canonical_shape().input_shape.len();
        let num_outputs = self.canonical_shape().output_shape.len();

        let spec = &mut self.processing_spec;
        if spec.input_channels.is_empty() {
            spec.input_channels = vec![1; num_inputs];
        }
        if spec.output_channels.is_empty() {
            spec.output_channels = vec![1; num_outputs];
        }
        if spec.internal_latency.is_empty() {
            spec.internal_latency = vec![0; num_outputs];
        }

        let canonical = self
            .tensor_shape
            .iter()
            .find(|s| s.backend.is_none())
            .unwrap_or(&self.tensor_shape[0])
            .clone();
        let spec = &mut self.processing_spec;
        if spec.input_stream_samples.is_empty() {
            spec.input_stream_samples = (0..num_inputs)
                .map(|i| canonical.input_size(i) / spec.input_channels[i].max(1))
                .collect();
        }
        if spec.output_stream_samples.is_empty() {
            spec.output_stream_samples = (0..num_outputs)
                .map(|i| canonical.output_size(i) / spec.output_channels[i].max(1))
                .collect();
        }

        if self.session_exclusive_processor && self.num_parallel_processors != 1 {
            log::warn!(
                "Session-exclusive processors cannot run in parallel, \
                 forcing num_parallel_processors from {} to 1",
                self.num_parallel_processors
            );
            self.num_parallel_processors = 1;
        }
        if self.num_parallel_processors < 1 {
            log::warn!("num_parallel_processors must be at least 1, setting to 1");
            self.num_parallel_processors = 1;
        }

        Ok(())
    }

    /// Check the structural invariants. Called by [`resolve`]; callers
    /// that mutate fields directly should re-run it.
    pub fn validate(&self) -> Result<()> {
        if self.tensor_shape.is_empty() {
            return Err(RtInferError::shape(
                "At least one tensor shape entry is required",
            ));
        }

        for shape in &self.tensor_shape {
            for dims in shape.input_shape.iter().chain(shape.output_shape.iter()) {
                if dims.iter().any(|&d| d < 1) {
                    return Err(RtInferError::shape(format!(
                        "Tensor dimensions must be positive, got {:?}",
                        dims
                    )));
                }
            }
        }

        let canonical = self.canonical_shape();
        if canonical.input_shape.is_empty() || canonical.output_shape.is_empty() {
            return Err(RtInferError::shape(
                "At least one input and one output tensor are required",
            ));
        }

        let spec = &self.processing_spec;
        let num_inputs = canonical.input_shape.len();
        let num_outputs = canonical.output_shape.len();
        if spec.input_channels.len() != num_inputs
            || spec.input_stream_samples.len() != num_inputs
            || spec.output_channels.len() != num_outputs
            || spec.output_stream_samples.len() != num_outputs
            || spec.internal_latency.len() != num_outputs
        {
            return Err(RtInferError::config(
                "Processing spec lengths must match the tensor counts",
            ));
        }

        for i in 0..num_inputs {
            let size = canonical.input_size(i);
            let channels = spec.input_channels[i];
            if channels == 0 || size % channels != 0 {
                return Err(RtInferError::config(format!(
                    "Input tensor {} size {} is not divisible by {} channels",
                    i, size, channels
                )));
            }
            let stream = spec.input_stream_samples[i];
            if stream != 0 && stream != size / channels {
                return Err(RtInferError::config(format!(
                    "Input tensor {} stream length {} does not match size {} / {} channels",
                    i, stream, size, channels
                )));
            }
        }
        for i in 0..num_outputs {
            let size = canonical.output_size(i);
            let channels = spec.output_channels[i];
            if channels == 0 || size % channels != 0 {
                return Err(RtInferError::config(format!(
                    "Output tensor {} size {} is not divisible by {} channels",
                    i, size, channels
                )));
            }
            let stream = spec.output_stream_samples[i];
            if stream != 0 && stream != size / channels {
                return Err(RtInferError::config(format!(
                    "Output tensor {} stream length {} does not match size {} / {} channels",
                    i, stream, size, channels
                )));
            }
        }

        for model in &self.model_data {
            if !self
                .tensor_shape
                .iter()
                .any(|s| s.backend == Some(model.backend) || s.backend.is_none())
            {
                return Err(RtInferError::shape(format!(
                    "No tensor shape available for backend {}",
                    model.backend
                )));
            }
        }

        if self.max_inference_time <= 0.0 {
            return Err(RtInferError::config(
                "max_inference_time must be greater than 0 ms",
            ));
        }

        if let Some(wait) = self.wait_in_process_block {
            if !(0.0..=1.0).contains(&wait) {
                return Err(RtInferError::config(
                    "wait_in_process_block must be in range [0.0, 1.0]",
                ));
            }
        }

        Ok(())
    }

    /// The backend-independent shape entry: the universal one if present,
    /// otherwise the first. Slot frames and the scheduling math are sized
    /// from this entry.
    pub fn canonical_shape(&self) -> &TensorShape {
        self.tensor_shape
            .iter()
            .find(|s| s.backend.is_none())
            .unwrap_or(&self.tensor_shape[0])
    }

    /// Shape entry for a specific backend, falling back to the canonical.
    pub fn shape_for(&self, backend: InferenceBackend) -> &TensorShape {
        self.tensor_shape
            .iter()
            .find(|s| s.backend == Some(backend))
            .unwrap_or_else(|| self.canonical_shape())
    }

    pub fn model_for(&self, backend: InferenceBackend) -> Option<&ModelData> {
        self.model_data.iter().find(|m| m.backend == backend)
    }

    pub fn num_input_tensors(&self) -> usize {
        self.canonical_shape().input_shape.len()
    }

    pub fn num_output_tensors(&self) -> usize {
        self.canonical_shape().output_shape.len()
    }

    /// Flat element count of input tensor `i`.
    pub fn tensor_input_size(&self, i: usize) -> usize {
        self.canonical_shape().input_size(i)
    }

    /// Flat element count of output tensor `i`.
    pub fn tensor_output_size(&self, i: usize) -> usize {
        self.canonical_shape().output_size(i)
    }

    pub fn input_channels(&self, i: usize) -> usize {
        self.processing_spec.input_channels[i]
    }

    pub fn output_channels(&self, i: usize) -> usize {
        self.processing_spec.output_channels[i]
    }

    /// Samples per channel that advance the timeline for input tensor
    /// `i`; 0 marks a non-streaming tensor.
    pub fn stream_input_size(&self, i: usize) -> usize {
        self.processing_spec.input_stream_samples[i]
    }

    /// Samples per channel produced per inference for output tensor `i`;
    /// 0 marks a non-streaming tensor.
    pub fn stream_output_size(&self, i: usize) -> usize {
        self.processing_spec.output_stream_samples[i]
    }

    pub fn internal_latency(&self, i: usize) -> usize {
        self.processing_spec.internal_latency[i]
    }
}

/// Callback through which a host donates one of its threads for inference
/// execution. The argument is the number of pending tasks; the return
/// value reports whether the host accepted the work.
pub type SubmitTaskFn = Arc<dyn Fn(usize) -> bool + Send + Sync>;

/// Host audio system parameters a session adapts to.
///
/// `buffer_size` may be fractional when the reference tensor runs below
/// the audio rate (one host callback then advances the reference stream by
/// less than one sample).
#[derive(Clone, Default)]
pub struct HostConfig {
    pub buffer_size: f32,
    pub sample_rate: f32,
    /// When false the host promises to always call with exactly
    /// `buffer_size` samples.
    pub allow_smaller_buffers: bool,
    /// Which streaming input tensor `buffer_size` refers to.
    pub tensor_index: usize,
    /// Optional host-donated thread hook.
    pub submit_task: Option<SubmitTaskFn>,
}

impl std::fmt::Debug for HostConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostConfig")
            .field("buffer_size", &self.buffer_size)
            .field("sample_rate", &self.sample_rate)
            .field("allow_smaller_buffers", &self.allow_smaller_buffers)
            .field("tensor_index", &self.tensor_index)
            .field("submit_task", &self.submit_task.is_some())
            .finish()
    }
}

impl PartialEq for HostConfig {
    fn eq(&self, other: &Self) -> bool {
        (self.buffer_size - other.buffer_size).abs() < 1e-6
            && (self.sample_rate - other.sample_rate).abs() < 1e-6
            && self.allow_smaller_buffers == other.allow_smaller_buffers
            && self.tensor_index == other.tensor_index
    }
}

impl HostConfig {
    pub fn new(buffer_size: f32, sample_rate: f32) -> Self {
        Self {
            buffer_size,
            sample_rate,
            allow_smaller_buffers: false,
            tensor_index: 0,
            submit_task: None,
        }
    }

    pub fn with_smaller_buffers(mut self, allow: bool) -> Self {
        self.allow_smaller_buffers = allow;
        self
    }

    pub fn with_tensor_index(mut self, tensor_index: usize) -> Self {
        self.tensor_index = tensor_index;
        self
    }

    pub fn with_submit_task(mut self, submit_task: SubmitTaskFn) -> Self {
        self.submit_task = Some(submit_task);
        self
    }

    /// Per-call host sample count for tensor `i`, derived from the
    /// reference tensor's buffer size by stream-length ratio.
    pub fn relative_buffer_size(
        &self,
        config: &InferenceConfig,
        tensor_index: usize,
        input: bool,
    ) -> f32 {
        let reference = config.stream_input_size(self.tensor_index) as f32;
        let ratio = self.buffer_size / reference;
        if input {
            config.stream_input_size(tensor_index) as f32 * ratio
        } else {
            config.stream_output_size(tensor_index) as f32 * ratio
        }
    }

    /// Effective sample rate of tensor `i`'s stream.
    pub fn relative_sample_rate(
        &self,
        config: &InferenceConfig,
        tensor_index: usize,
        input: bool,
    ) -> f32 {
        let reference = config.stream_input_size(self.tensor_index) as f32;
        let ratio = self.sample_rate / reference;
        if input {
            config.stream_input_size(tensor_index) as f32 * ratio
        } else {
            config.stream_output_size(tensor_index) as f32 * ratio
        }
    }

    /// Duration of one host period in milliseconds.
    pub fn buffer_time_ms(&self) -> f32 {
        if self.sample_rate <= 0.0 {
            return 0.0;
        }
        self.buffer_size * 1000.0 / self.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_config() -> InferenceConfig {
        InferenceConfig::new(
            vec![ModelData::from_path(InferenceBackend::Onnx, "model.onnx")],
            vec![TensorShape::universal(
                vec![vec![1, 1, 2048]],
                vec![vec![1, 1, 2048]],
            )],
            5.0,
        )
    }

    #[test]
    fn test_resolve_clones_universal_shape() {
        let resolved = simple_config().resolve().unwrap();
        assert_eq!(resolved.tensor_shape.len(), 2);
        assert!(
            resolved
                .tensor_shape
                .iter()
                .any(|s| s.backend == Some(InferenceBackend::Onnx))
        );
        // Canonical stays the universal entry
        assert!(resolved.canonical_shape().backend.is_none());
    }

    #[test]
    fn test_resolve_derives_processing_spec() {
        let resolved = simple_config().resolve().unwrap();
        assert_eq!(resolved.input_channels(0), 1);
        assert_eq!(resolved.stream_input_size(0), 2048);
        assert_eq!(resolved.stream_output_size(0), 2048);
        assert_eq!(resolved.internal_latency(0), 0);
    }

    #[test]
    fn test_validate_rejects_bad_dimension() {
        let mut config = simple_config();
        config.tensor_shape[0].input_shape[0][2] = 0;
        assert!(config.resolve().is_err());
    }

    #[test]
    fn test_validate_rejects_channel_mismatch() {
        let mut config = simple_config();
        config.processing_spec.input_channels = vec![3];
        assert!(config.resolve().is_err());
    }

    #[test]
    fn test_validate_rejects_missing_backend_shape() {
        let mut config = simple_config();
        config.tensor_shape[0].backend = Some(InferenceBackend::LibTorch);
        assert!(config.resolve().is_err());
    }

    #[test]
    fn test_session_exclusive_forces_single_processor() {
        let mut config = simple_config();
        config.session_exclusive_processor = true;
        config.num_parallel_processors = 4;
        let resolved = config.resolve().unwrap();
        assert_eq!(resolved.num_parallel_processors, 1);
    }

    #[test]
    fn test_wait_fraction_range() {
        let mut config = simple_config();
        config.wait_in_process_block = Some(1.5);
        assert!(config.resolve().is_err());
        config.wait_in_process_block = Some(0.5);
        assert!(config.resolve().is_ok());
    }

    #[test]
    fn test_config_file_roundtrip() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("inference.toml");

        let config = simple_config().resolve().unwrap();
        config.save_to_file(&path).unwrap();
        assert!(path.exists());

        let loaded = InferenceConfig::from_file(&path).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_model_data_payloads() {
        let by_path = ModelData::from_path(InferenceBackend::TfLite, "net.tflite");
        assert!(!by_path.is_binary());
        assert!(by_path.path().is_some());

        let by_bytes = ModelData::from_bytes(InferenceBackend::Onnx, vec![0u8; 4]);
        assert!(by_bytes.is_binary());
        assert!(by_bytes.path().is_none());
    }

    #[test]
    fn test_relative_buffer_size() {
        use approx::assert_relative_eq;

        let mut config = simple_config();
        config.tensor_shape[0].input_shape = vec![vec![1, 1, 16], vec![1, 1, 2]];
        config.tensor_shape[0].output_shape = vec![vec![1, 1, 2048], vec![1, 1, 256]];
        let resolved = config.resolve().unwrap();

        let host = HostConfig::new(1.0, 48000.0);
        // Reference input tensor 0 has 16 stream samples per frame
        assert_relative_eq!(host.relative_buffer_size(&resolved, 1, true), 2.0 / 16.0);
        assert_relative_eq!(host.relative_buffer_size(&resolved, 0, false), 128.0);
        assert_relative_eq!(host.relative_sample_rate(&resolved, 1, false), 48000.0 * 16.0);
    }

    #[test]
    fn test_host_config_equality_ignores_callback() {
        let a = HostConfig::new(512.0, 48000.0);
        let b = HostConfig::new(512.0, 48000.0).with_submit_task(Arc::new(|_| true));
        assert_eq!(a, b);
        let c = HostConfig::new(256.0, 48000.0);
        assert_ne!(a, c);
    }
}
