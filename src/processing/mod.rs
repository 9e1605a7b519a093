//! Stream-to-tensor adaptation: the user extension point

mod pre_post;

pub use pre_post::{
    AuxTensorStore, PrePostProcessor, StreamingPrePostProcessor, pop_samples_from_buffer,
    pop_samples_with_history, push_samples_to_buffer,
};
