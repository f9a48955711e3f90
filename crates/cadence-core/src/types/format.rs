//! Sample encodings and stream formats.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use serde::{Deserialize, Serialize};
use std::fmt;

use super::Layout;

/// Sample encoding of an audio stream.
///
/// `*Ne` variants are native-endian aliases; raw variants carry compressed
/// bitstreams that are passed through to the device untouched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    U8,
    S8,
    S16Le,
    S16Be,
    S16Ne,
    /// 24-bit samples packed into 3 bytes.
    S24Le3,
    S24Be3,
    S24Ne3,
    /// 24-bit samples in the low bits of a 4 byte container.
    S24Le4,
    S24Be4,
    S24Ne4,
    S32Le,
    S32Be,
    S32Ne,
    /// 32-bit native-endian float, the pipeline's working format.
    #[default]
    Float,
    Double,
    // Passthrough bitstreams
    Ac3,
    Dts,
    Eac3,
    TrueHd,
    DtsHd,
    Lpcm,
}

impl DataFormat {
    /// All PCM encodings, in the order devices advertise them.
    pub const PCM: [Self; 16] = [
        Self::U8,
        Self::S8,
        Self::S16Le,
        Self::S16Be,
        Self::S16Ne,
        Self::S24Le3,
        Self::S24Be3,
        Self::S24Ne3,
        Self::S24Le4,
        Self::S24Be4,
        Self::S24Ne4,
        Self::S32Le,
        Self::S32Be,
        Self::S32Ne,
        Self::Float,
        Self::Double,
    ];

    /// Whether this is a compressed passthrough bitstream.
    pub const fn is_raw(self) -> bool {
        matches!(
            self,
            Self::Ac3 | Self::Dts | Self::Eac3 | Self::TrueHd | Self::DtsHd | Self::Lpcm
        )
    }

    /// Container width of one sample in bits.
    ///
    /// Passthrough bitstreams travel in 16-bit IEC 61937 carriers.
    pub const fn bits(self) -> usize {
        match self {
            Self::U8 | Self::S8 => 8,
            Self::S16Le | Self::S16Be | Self::S16Ne => 16,
            Self::S24Le3 | Self::S24Be3 | Self::S24Ne3 => 24,
            Self::S24Le4
            | Self::S24Be4
            | Self::S24Ne4
            | Self::S32Le
            | Self::S32Be
            | Self::S32Ne
            | Self::Float => 32,
            Self::Double => 64,
            Self::Ac3 | Self::Dts | Self::Eac3 | Self::TrueHd | Self::DtsHd | Self::Lpcm => 16,
        }
    }

    /// Size of one sample in bytes.
    pub const fn bytes_per_sample(self) -> usize {
        self.bits() >> 3
    }

    /// Resolve a native-endian alias to its concrete byte order.
    pub const fn resolve_native(self) -> Self {
        let little = cfg!(target_endian = "little");
        match self {
            Self::S16Ne if little => Self::S16Le,
            Self::S16Ne => Self::S16Be,
            Self::S24Ne3 if little => Self::S24Le3,
            Self::S24Ne3 => Self::S24Be3,
            Self::S24Ne4 if little => Self::S24Le4,
            Self::S24Ne4 => Self::S24Be4,
            Self::S32Ne if little => Self::S32Le,
            Self::S32Ne => Self::S32Be,
            other => other,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::U8 => "U8",
            Self::S8 => "S8",
            Self::S16Le => "S16LE",
            Self::S16Be => "S16BE",
            Self::S16Ne => "S16NE",
            Self::S24Le3 => "S24LE3",
            Self::S24Be3 => "S24BE3",
            Self::S24Ne3 => "S24NE3",
            Self::S24Le4 => "S24LE4",
            Self::S24Be4 => "S24BE4",
            Self::S24Ne4 => "S24NE4",
            Self::S32Le => "S32LE",
            Self::S32Be => "S32BE",
            Self::S32Ne => "S32NE",
            Self::Float => "FLOAT",
            Self::Double => "DOUBLE",
            Self::Ac3 => "AC3",
            Self::Dts => "DTS",
            Self::Eac3 => "EAC3",
            Self::TrueHd => "TRUEHD",
            Self::DtsHd => "DTSHD",
            Self::Lpcm => "LPCM",
        }
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Format of an audio stream or of a negotiated device output.
///
/// An empty `channel_layout` means "unspecified"; the stream guesses one from
/// `channel_count` when it is initialized.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AudioFormat {
    pub data_format: DataFormat,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Rate of the compressed bitstream for passthrough formats.
    pub encoded_rate: u32,
    pub channel_count: usize,
    pub channel_layout: Layout,
    /// Frames per device period, filled in by the sink.
    pub frames: usize,
    /// Samples per device period, filled in by the sink.
    pub frame_samples: usize,
    /// Bytes per frame.
    pub frame_size: usize,
}

impl AudioFormat {
    /// Create a PCM format with an unspecified layout.
    pub const fn new(data_format: DataFormat, sample_rate: u32, channel_count: usize) -> Self {
        Self {
            data_format,
            sample_rate,
            encoded_rate: 0,
            channel_count,
            channel_layout: Layout::empty(),
            frames: 0,
            frame_samples: 0,
            frame_size: data_format.bytes_per_sample() * channel_count,
        }
    }

    /// Create a format with an explicit channel layout.
    pub fn with_layout(data_format: DataFormat, sample_rate: u32, layout: Layout) -> Self {
        let mut format = Self::new(data_format, sample_rate, layout.len());
        format.channel_layout = layout;
        format
    }

    pub const fn is_raw(&self) -> bool {
        self.data_format.is_raw()
    }

    /// Bytes per frame as implied by the encoding and channel count.
    pub const fn pcm_frame_size(&self) -> usize {
        self.data_format.bytes_per_sample() * self.channel_count
    }

    /// Bytes of audio per second at this format.
    pub const fn bytes_per_second(&self) -> usize {
        self.frame_size * self.sample_rate as usize
    }

    /// Convert a frame count to seconds.
    #[allow(clippy::cast_precision_loss)]
    pub fn frames_to_secs(&self, frames: u64) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        frames as f64 / f64::from(self.sample_rate)
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}Hz {}ch",
            self.data_format, self.sample_rate, self.channel_count
        )?;
        if !self.channel_layout.is_empty() {
            write!(f, " [{}]", self.channel_layout)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StdLayout;

    #[test]
    fn test_bytes_per_sample() {
        assert_eq!(DataFormat::U8.bytes_per_sample(), 1);
        assert_eq!(DataFormat::S16Be.bytes_per_sample(), 2);
        assert_eq!(DataFormat::S24Le3.bytes_per_sample(), 3);
        assert_eq!(DataFormat::S24Le4.bytes_per_sample(), 4);
        assert_eq!(DataFormat::Float.bytes_per_sample(), 4);
        assert_eq!(DataFormat::Double.bytes_per_sample(), 8);
        assert_eq!(DataFormat::TrueHd.bytes_per_sample(), 2);
    }

    #[test]
    fn test_raw_formats() {
        assert!(DataFormat::Ac3.is_raw());
        assert!(DataFormat::DtsHd.is_raw());
        assert!(!DataFormat::Float.is_raw());
        assert!(DataFormat::PCM.iter().all(|f| !f.is_raw()));
    }

    #[test]
    fn test_frame_size_invariant() {
        let format = AudioFormat::new(DataFormat::S16Le, 44100, 2);
        assert_eq!(format.frame_size, 4);
        assert_eq!(format.bytes_per_second(), 176_400);

        let format = AudioFormat::with_layout(
            DataFormat::Float,
            48000,
            Layout::standard(StdLayout::Surround51),
        );
        assert_eq!(format.channel_count, 6);
        assert_eq!(format.frame_size, 24);
    }

    #[test]
    fn test_native_resolution() {
        let resolved = DataFormat::S16Ne.resolve_native();
        assert!(resolved == DataFormat::S16Le || resolved == DataFormat::S16Be);
        assert_eq!(DataFormat::Float.resolve_native(), DataFormat::Float);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&DataFormat::S24Le3).unwrap();
        assert_eq!(json, "\"s24le3\"");
        let parsed: DataFormat = serde_json::from_str("\"truehd\"").unwrap();
        assert_eq!(parsed, DataFormat::TrueHd);
    }

    proptest::proptest! {
        #[test]
        fn prop_pcm_frame_size(index in 0usize..16, channels in 1usize..=8, rate in 8000u32..192_000) {
            let data_format = DataFormat::PCM[index];
            let format = AudioFormat::new(data_format, rate, channels);
            proptest::prop_assert_eq!(format.frame_size, data_format.bytes_per_sample() * channels);
            proptest::prop_assert_eq!(format.pcm_frame_size(), format.frame_size);
        }
    }
}
