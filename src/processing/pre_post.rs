//! Pre/post-processing between ring buffers and slot tensors
//!
//! The default implementation streams: it pops one model frame per channel
//! out of the send ring and pushes one result frame into the receive ring.
//! Overrides add receptive-field history (via `peek_past`), batch layouts
//! or per-backend tensor reshuffles. Hooks run on the audio thread while
//! it holds a claimed slot, so they must not allocate.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::backend::InferenceBackend;
use crate::buffer::{Buffer, MemoryBlock, RingBuffer};
use crate::config::InferenceConfig;

/// Atomic scalar store for non-streaming (auxiliary) tensors.
///
/// The audio thread assigns control values with `set_input` before
/// submitting the next frame; backends read them during inference with
/// `get_input` and publish auxiliary results with `set_output`.
#[derive(Debug)]
pub struct AuxTensorStore {
    inputs: Vec<MemoryBlock<AtomicU32>>,
    outputs: Vec<MemoryBlock<AtomicU32>>,
}

impl AuxTensorStore {
    /// A store with no auxiliary tensors.
    pub fn empty() -> Self {
        Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Allocate slots for every non-streaming tensor in `config`;
    /// streaming tensors get zero-length blocks.
    pub fn from_config(config: &InferenceConfig) -> Self {
        let inputs = (0..config.num_input_tensors())
            .map(|i| {
                let len = if config.stream_input_size(i) == 0 {
                    config.tensor_input_size(i)
                } else {
                    0
                };
                MemoryBlock::new(len)
            })
            .collect();
        let outputs = (0..config.num_output_tensors())
            .map(|i| {
                let len = if config.stream_output_size(i) == 0 {
                    config.tensor_output_size(i)
                } else {
                    0
                };
                MemoryBlock::new(len)
            })
            .collect();
        Self { inputs, outputs }
    }

    pub fn set_input(&self, tensor_index: usize, element: usize, value: f32) {
        match self.inputs.get(tensor_index) {
            Some(block) if element < block.len() => {
                block[element].store(value.to_bits(), Ordering::Relaxed);
            }
            _ => log::error!(
                "AuxTensorStore: set_input({}, {}) out of range",
                tensor_index,
                element
            ),
        }
    }

    pub fn get_input(&self, tensor_index: usize, element: usize) -> f32 {
        match self.inputs.get(tensor_index) {
            Some(block) if element < block.len() => {
                f32::from_bits(block[element].load(Ordering::Relaxed))
            }
            _ => {
                log::error!(
                    "AuxTensorStore: get_input({}, {}) out of range",
                    tensor_index,
                    element
                );
                0.0
            }
        }
    }

    pub fn set_output(&self, tensor_index: usize, element: usize, value: f32) {
        match self.outputs.get(tensor_index) {
            Some(block) if element < block.len() => {
                block[element].store(value.to_bits(), Ordering::Relaxed);
            }
            _ => log::error!(
                "AuxTensorStore: set_output({}, {}) out of range",
                tensor_index,
                element
            ),
        }
    }

    pub fn get_output(&self, tensor_index: usize, element: usize) -> f32 {
        match self.outputs.get(tensor_index) {
            Some(block) if element < block.len() => {
                f32::from_bits(block[element].load(Ordering::Relaxed))
            }
            _ => {
                log::error!(
                    "AuxTensorStore: get_output({}, {}) out of range",
                    tensor_index,
                    element
                );
                0.0
            }
        }
    }

    /// Length of auxiliary input tensor `i` (0 for streaming tensors).
    pub fn input_len(&self, tensor_index: usize) -> usize {
        self.inputs.get(tensor_index).map_or(0, |b| b.len())
    }

    /// Length of auxiliary output tensor `i` (0 for streaming tensors).
    pub fn output_len(&self, tensor_index: usize) -> usize {
        self.outputs.get(tensor_index).map_or(0, |b| b.len())
    }
}

fn empty_store() -> &'static AuxTensorStore {
    static EMPTY: OnceLock<AuxTensorStore> = OnceLock::new();
    EMPTY.get_or_init(AuxTensorStore::empty)
}

/// Adapter between the session's ring buffers and slot tensors.
///
/// Hooks are invoked once per streaming tensor. Non-streaming tensors
/// bypass the hooks entirely and travel through [`AuxTensorStore`].
pub trait PrePostProcessor: Send + Sync {
    /// Fill `tensor` from `ring` for streaming input tensor
    /// `tensor_index`. The default pops one frame per channel.
    fn pre_process(
        &self,
        ring: &mut RingBuffer,
        tensor: &mut Buffer,
        _tensor_index: usize,
        _backend: InferenceBackend,
    ) {
        pop_samples_from_buffer(ring, tensor);
    }

    /// Drain `tensor` into `ring` for streaming output tensor
    /// `tensor_index`. The default pushes every sample per channel.
    fn post_process(
        &self,
        tensor: &Buffer,
        ring: &mut RingBuffer,
        _tensor_index: usize,
        _backend: InferenceBackend,
    ) {
        push_samples_to_buffer(tensor, ring);
    }

    /// Scalar store for auxiliary tensors.
    fn aux(&self) -> &AuxTensorStore {
        empty_store()
    }
}

/// The default processor: plain streaming, with an auxiliary store sized
/// from the configuration.
#[derive(Debug)]
pub struct StreamingPrePostProcessor {
    aux: AuxTensorStore,
}

impl StreamingPrePostProcessor {
    pub fn new() -> Self {
        Self {
            aux: AuxTensorStore::empty(),
        }
    }

    pub fn with_config(config: &InferenceConfig) -> Self {
        Self {
            aux: AuxTensorStore::from_config(config),
        }
    }
}

impl Default for StreamingPrePostProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl PrePostProcessor for StreamingPrePostProcessor {
    fn aux(&self) -> &AuxTensorStore {
        &self.aux
    }
}

/// Pop `tensor.num_samples()` fresh samples per channel out of `ring`.
pub fn pop_samples_from_buffer(ring: &mut RingBuffer, tensor: &mut Buffer) {
    for channel in 0..tensor.num_channels() {
        for j in 0..tensor.num_samples() {
            tensor.set_sample(channel, j, ring.pop_sample(channel));
        }
    }
}

/// Pop `num_new` fresh samples per channel and prepend `num_old`
/// already-consumed samples as context, writing
/// `num_old + num_new` samples starting at `offset` in each channel.
///
/// Index layout per channel: `[offset .. offset+num_old)` holds history
/// (oldest first), `[offset+num_old .. offset+num_old+num_new)` holds the
/// fresh samples in stream order.
pub fn pop_samples_with_history(
    ring: &mut RingBuffer,
    tensor: &mut Buffer,
    num_new: usize,
    num_old: usize,
    offset: usize,
) {
    for channel in 0..tensor.num_channels() {
        for j in 0..num_new {
            tensor.set_sample(channel, offset + num_old + j, ring.pop_sample(channel));
        }
        // After popping, the fresh samples sit directly behind the read
        // position, so history starts num_new steps further back.
        for j in 0..num_old {
            let distance = num_old - j + num_new;
            tensor.set_sample(channel, offset + j, ring.peek_past(channel, distance));
        }
    }
}

/// Push every sample of `tensor` into `ring`, per channel.
pub fn push_samples_to_buffer(tensor: &Buffer, ring: &mut RingBuffer) {
    for channel in 0..tensor.num_channels() {
        for j in 0..tensor.num_samples() {
            ring.push_sample(channel, tensor.get_sample(channel, j));
        }
    }
}
