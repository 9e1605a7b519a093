//! rtinfer - Real-time Neural Inference Scheduler for Audio
//!
//! Bridges a pull-based host audio callback and neural-network inference
//! engines whose latency and frame sizes do not match the host's. The
//! audio thread never blocks on inference; output is bit-compatible with
//! an offline run of the same model, delayed by a deterministic,
//! pre-computed latency.

pub mod backend;
pub mod buffer;
pub mod config;
pub mod error;
pub mod handler;
pub mod processing;
pub mod scheduler;

// Re-export main public interfaces
pub use backend::{BackendFactory, BackendProcessor, InferenceBackend, PassthroughProcessor};
pub use buffer::{Buffer, MemoryBlock, RingBuffer};
pub use config::{HostConfig, InferenceConfig, ModelData, ProcessingSpec, TensorShape};
pub use error::{Result, RtInferError};
pub use handler::InferenceHandler;
pub use processing::{AuxTensorStore, PrePostProcessor, StreamingPrePostProcessor};
pub use scheduler::{Context, ContextConfig};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Library description
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Initialize logging system
pub fn init_logging(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::from_env("RUST_LOG")
        .filter_level(level)
        .try_init()
        .ok(); // Ignore if logger is already initialized
}
