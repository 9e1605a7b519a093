//! Job scheduling: sessions, workers and the process-wide context

pub mod context;
pub mod manager;
pub mod session;
pub mod worker;

pub use context::{Context, ContextConfig};
pub use manager::InferenceManager;
pub use session::{SessionElement, SessionSlot};
