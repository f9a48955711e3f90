//! Error types for Cadence.

use thiserror::Error;

use crate::types::{DataFormat, Layout};

/// Result type alias using Cadence's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Cadence.
#[derive(Error, Debug)]
pub enum Error {
    // Negotiation errors
    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(DataFormat),

    #[error("Cannot infer a channel layout for {0} channels")]
    UnsupportedLayout(usize),

    #[error("Cannot remap {from} to {to}")]
    Remap { from: Layout, to: Layout },

    #[error("Format negotiation failed: {0}")]
    Negotiation(String),

    // Driver and runtime errors
    #[error("Audio output error: {0}")]
    AudioOutput(String),

    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Resampler error: {0}")]
    Resample(String),

    #[error("Audio decode error: {0}")]
    AudioDecode(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if retrying the operation later may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::AudioOutput(_) | Self::Device(_))
    }

    /// Returns true if this error came out of format negotiation.
    pub const fn is_negotiation(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedFormat(_)
                | Self::UnsupportedLayout(_)
                | Self::Remap { .. }
                | Self::Negotiation(_)
        )
    }
}
