//! # cadence-audio
//!
//! Real-time playback pipeline for Cadence.
//!
//! Decoded PCM enters an [`AudioStream`], which converts it to float,
//! resamples to the device rate, remaps channels and buffers the result.
//! The [`OutputEngine`] mixes every active stream and keeps an
//! [`AudioSink`] fed. The [`PlaybackCoordinator`] drives sessions on top,
//! with gapless hand-over and crossfades between queued files.

pub mod buffer;
pub mod convert;
pub mod coordinator;
pub mod decode;
pub mod engine;
pub mod remap;
pub mod resample;
pub mod sink;
pub mod stream;

pub use coordinator::{
    CoordinatorCommand, CoordinatorConfig, CoordinatorEvent, CoordinatorHandle, DecoderFactory,
    PlaybackCoordinator, PlaybackStatus, PlayerState, QueueProvider, SessionInfo, SessionState,
};
pub use decode::{Decoder, SymphoniaDecoder};
pub use engine::{EngineConfig, OutputEngine};
pub use sink::{AudioSink, CpalSink, NullSink, SinkKind};
pub use stream::{AudioCallback, AudioStream, StreamOptions};
