//! Sample storage: owning memory blocks, 2-D buffers and ring buffers

mod block;
mod ring;

pub use block::{Buffer, MemoryBlock};
pub use ring::RingBuffer;
