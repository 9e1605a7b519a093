//! Inference backend capability
//!
//! The scheduler treats a backend as a fixed-shape tensor transform: given
//! the prepared input frames of one slot, fill the output frames. The
//! actual tensor-runtime bindings (LibTorch, ONNX Runtime, TensorFlow
//! Lite) live outside this crate and plug in through [`BackendProcessor`]
//! and [`BackendFactory`].

mod passthrough;
pub mod pool;

pub use passthrough::PassthroughProcessor;
pub use pool::ProcessorPool;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::buffer::Buffer;
use crate::config::InferenceConfig;
use crate::error::Result;
use crate::processing::AuxTensorStore;

/// Backend tag identifying which tensor runtime serves a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum InferenceBackend {
    LibTorch,
    Onnx,
    TfLite,
    /// User-supplied processor registered at handler construction.
    Custom,
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InferenceBackend::LibTorch => write!(f, "libtorch"),
            InferenceBackend::Onnx => write!(f, "onnx"),
            InferenceBackend::TfLite => write!(f, "tflite"),
            InferenceBackend::Custom => write!(f, "custom"),
        }
    }
}

/// Synchronous fixed-shape tensor transform.
///
/// `process` is called from worker threads (or host-donated threads), one
/// call per claimed sub-instance at a time, so implementations only need
/// `&mut self` thread safety. Auxiliary (non-streaming) tensor values are
/// exchanged through the [`AuxTensorStore`] of the owning session.
pub trait BackendProcessor: Send {
    /// Load the model, allocate runtime tensors. Called once before any
    /// `process` call; warm-up passes run right after.
    fn prepare(&mut self) -> Result<()>;

    /// Transform one input frame set into one output frame set, in place.
    fn process(
        &mut self,
        inputs: &[Buffer],
        outputs: &mut [Buffer],
        aux: &AuxTensorStore,
    ) -> Result<()>;
}

/// Factory constructing backend processors for one backend tag.
pub type BackendFactory =
    Arc<dyn Fn(&InferenceConfig) -> Result<Box<dyn BackendProcessor>> + Send + Sync>;
