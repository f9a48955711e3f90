//! Core domain types for Cadence.

pub mod channel;
pub mod device;
pub mod format;

pub use channel::{Channel, Layout, StdLayout};
pub use device::{DeviceInfo, DeviceType, DEFAULT_DATA_FORMATS, DEFAULT_SAMPLE_RATES};
pub use format::{AudioFormat, DataFormat};
