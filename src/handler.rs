//! Public facade over a single inference session
//!
//! An `InferenceHandler` bundles one session with its audio-thread glue.
//! Audio data crosses the boundary as planar channel slices; `process`
//! pushes and pops in one call, while `push_data`/`pop_data` split the
//! two halves for hosts that compensate latency themselves or render
//! offline.

use std::sync::Arc;

use crate::backend::{BackendProcessor, InferenceBackend};
use crate::config::{HostConfig, InferenceConfig};
use crate::error::Result;
use crate::processing::PrePostProcessor;
use crate::scheduler::context::{Context, ContextConfig};
use crate::scheduler::manager::InferenceManager;

pub struct InferenceHandler {
    manager: InferenceManager,
}

impl InferenceHandler {
    /// Create a session on the shared process-wide context with default
    /// context settings.
    pub fn new(
        pp_processor: Arc<dyn PrePostProcessor>,
        inference_config: InferenceConfig,
    ) -> Result<Self> {
        Self::with_context_config(pp_processor, inference_config, &ContextConfig::default())
    }

    /// Create a session on the shared process-wide context.
    pub fn with_context_config(
        pp_processor: Arc<dyn PrePostProcessor>,
        inference_config: InferenceConfig,
        context_config: &ContextConfig,
    ) -> Result<Self> {
        let context = Context::instance(context_config);
        Self::with_context(context, pp_processor, inference_config, None)
    }

    /// Create a session that routes the `Custom` backend tag through a
    /// user-supplied processor.
    pub fn with_custom_processor(
        pp_processor: Arc<dyn PrePostProcessor>,
        inference_config: InferenceConfig,
        processor: Box<dyn BackendProcessor>,
        context_config: &ContextConfig,
    ) -> Result<Self> {
        let context = Context::instance(context_config);
        Self::with_context(context, pp_processor, inference_config, Some(processor))
    }

    /// Create a session on an explicitly managed context.
    pub fn with_context(
        context: Arc<Context>,
        pp_processor: Arc<dyn PrePostProcessor>,
        inference_config: InferenceConfig,
        custom_processor: Option<Box<dyn BackendProcessor>>,
    ) -> Result<Self> {
        let resolved = inference_config.resolve()?;
        let session = context.create_session(resolved, pp_processor, custom_processor)?;
        Ok(Self {
            manager: InferenceManager::new(context, session),
        })
    }

    /// Adapt the session to the host audio configuration. Must be called
    /// before any processing; recallable whenever the host reconfigures.
    pub fn prepare(&mut self, host_config: HostConfig) -> Result<()> {
        self.manager.prepare(host_config, None)
    }

    /// Like [`prepare`](Self::prepare), with per-output-tensor latency
    /// overrides (`None` keeps the computed value; non-streaming outputs
    /// must stay `None` or 0).
    pub fn prepare_with_latency(
        &mut self,
        host_config: HostConfig,
        custom_latency: &[Option<usize>],
    ) -> Result<()> {
        self.manager.prepare(host_config, Some(custom_latency))
    }

    /// Push one host block and pop the matching amount of processed
    /// audio, both for streaming tensor `tensor_index`. Returns the
    /// samples per channel actually delivered.
    pub fn process(
        &mut self,
        input: &[&[f32]],
        output: &mut [&mut [f32]],
        tensor_index: usize,
    ) -> usize {
        self.manager.push_data(input, tensor_index);
        self.manager.pop_data(output, tensor_index)
    }

    /// Push without popping. With multiple streaming inputs, push the
    /// reference tensor last.
    pub fn push_data(&mut self, input: &[&[f32]], tensor_index: usize) {
        self.manager.push_data(input, tensor_index);
    }

    /// Pop without pushing. Missing samples are delivered as silence.
    pub fn pop_data(&mut self, output: &mut [&mut [f32]], tensor_index: usize) -> usize {
        self.manager.pop_data(output, tensor_index)
    }

    pub fn set_inference_backend(&mut self, backend: InferenceBackend) {
        self.manager.set_backend(backend);
    }

    pub fn get_inference_backend(&self) -> InferenceBackend {
        self.manager.backend()
    }

    /// Reported latency of output tensor `tensor_index` in samples.
    pub fn get_latency(&self, tensor_index: usize) -> usize {
        self.manager.latency().get(tensor_index).copied().unwrap_or(0)
    }

    pub fn get_latency_vector(&self) -> Vec<usize> {
        self.manager.latency().to_vec()
    }

    /// Samples currently deliverable for `tensor_index` on `channel`.
    pub fn get_available_samples(&mut self, tensor_index: usize, channel: usize) -> usize {
        self.manager.available_samples(tensor_index, channel)
    }

    /// In non-realtime mode every pop blocks until its results exist;
    /// used for offline rendering.
    pub fn set_non_realtime(&mut self, non_realtime: bool) {
        self.manager.set_non_realtime(non_realtime);
    }

    /// Zero all buffer positions and slot states, keeping the sizing.
    pub fn reset(&mut self) {
        self.manager.reset();
    }
}
