//! Buffers used by the stream pipeline.

pub mod ring;
pub mod scratch;

pub use ring::RingBuffer;
pub use scratch::ScratchBuffer;
