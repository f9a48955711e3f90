//! Output sinks: the device side of the pipeline.
//!
//! A sink takes finished packets in its negotiated wire format and keeps a
//! small driver buffer topped up. Variants are picked at startup with
//! [`SinkKind`].

pub mod cpal;
pub mod null;

pub use self::cpal::CpalSink;
pub use self::null::NullSink;

use cadence_core::{AudioFormat, DataFormat, DeviceInfo, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Target latency of the driver buffer.
pub const BUFFER_DURATION: Duration = Duration::from_millis(200);

/// Size of one device period.
pub const PERIOD_DURATION: Duration = Duration::from_millis(50);

/// Compressed encodings offered on digital outputs.
pub const PASSTHROUGH_FORMATS: [DataFormat; 3] = [DataFormat::Ac3, DataFormat::Dts, DataFormat::Eac3];

/// Device-facing half of the output engine.
pub trait AudioSink: Send {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Open `device` with the closest match to `format`.
    ///
    /// On success the negotiated values (rate, channels, frame size, period
    /// frames) are written back into `format` and the device runs uncorked.
    fn initialize(&mut self, format: &mut AudioFormat, device: &str) -> Result<()>;

    /// Drain, stop and release the device. Safe to call when not initialized.
    fn deinitialize(&mut self);

    fn is_initialized(&self) -> bool;

    /// Queue up to `frames` frames from `data`. Returns the frames accepted.
    ///
    /// An uninitialized sink discards everything and reports it as accepted.
    fn add_packets(&mut self, data: &[u8], frames: usize) -> usize;

    /// Seconds of audio queued ahead of the speaker.
    fn delay(&mut self) -> f64;

    /// Seconds of audio the driver buffer holds when full.
    fn cache_total(&self) -> f64;

    /// Block until queued audio has played out.
    fn drain(&mut self);

    /// Suspend (`true`) or resume output. Returns the state now in effect.
    fn cork(&mut self, cork: bool) -> bool;

    /// Device volume in `[0, 1]`; 0 mutes.
    fn set_volume(&mut self, volume: f32);

    /// List devices without touching the active one.
    fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>>;
}

/// Available sink implementations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Cpal,
    Null,
}

impl SinkKind {
    /// Construct the sink.
    pub fn create(self) -> Box<dyn AudioSink> {
        match self {
            Self::Cpal => Box::new(CpalSink::new()),
            Self::Null => Box::new(NullSink::realtime()),
        }
    }
}

impl std::str::FromStr for SinkKind {
    type Err = cadence_core::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpal" => Ok(Self::Cpal),
            "null" => Ok(Self::Null),
            other => Err(cadence_core::Error::Config(format!("Unknown sink: {other}"))),
        }
    }
}

/// Frames covering `duration` at `rate`, at least one.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub(crate) fn frames_for(duration: Duration, rate: u32) -> usize {
    ((duration.as_secs_f64() * f64::from(rate)).round() as usize).max(1)
}

/// Fill in the period sizing fields of a negotiated format.
pub(crate) fn apply_period(format: &mut AudioFormat) {
    format.frames = frames_for(PERIOD_DURATION, format.sample_rate);
    format.frame_samples = format.frames * format.channel_count;
}

/// Guess passthrough support from a device name.
pub(crate) fn is_digital_output(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    ["hdmi", "iec958", "spdif", "s/pdif"]
        .iter()
        .any(|hint| name.contains(hint))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_kind_parse() {
        assert_eq!("cpal".parse::<SinkKind>().ok(), Some(SinkKind::Cpal));
        assert_eq!("NULL".parse::<SinkKind>().ok(), Some(SinkKind::Null));
        assert!("pulse".parse::<SinkKind>().is_err());
    }

    #[test]
    fn test_period_sizing() {
        let mut format = AudioFormat::new(DataFormat::Float, 48000, 2);
        apply_period(&mut format);
        assert_eq!(format.frames, 2400);
        assert_eq!(format.frame_samples, 4800);
    }

    #[test]
    fn test_digital_output_names() {
        assert!(is_digital_output("HDMI 1 (Display)"));
        assert!(is_digital_output("iec958:CARD=PCH"));
        assert!(!is_digital_output("Built-in Speakers"));
    }
}
