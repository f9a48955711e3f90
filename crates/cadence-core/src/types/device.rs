//! Output device descriptors produced by sink enumeration.

use serde::{Deserialize, Serialize};

use super::{DataFormat, Layout};

/// Sample rates every PCM device is assumed to accept.
pub const DEFAULT_SAMPLE_RATES: [u32; 14] = [
    5512, 8000, 11025, 16000, 22050, 32000, 44100, 48000, 64000, 88200, 96000, 176_400, 192_000,
    384_000,
];

/// Sample encodings every PCM device is assumed to accept.
pub const DEFAULT_DATA_FORMATS: [DataFormat; 14] = [
    DataFormat::U8,
    DataFormat::S16Le,
    DataFormat::S16Be,
    DataFormat::S16Ne,
    DataFormat::S24Le3,
    DataFormat::S24Be3,
    DataFormat::S24Ne3,
    DataFormat::S24Le4,
    DataFormat::S24Be4,
    DataFormat::S24Ne4,
    DataFormat::S32Be,
    DataFormat::S32Le,
    DataFormat::S32Ne,
    DataFormat::Float,
];

/// Kind of device, as far as passthrough is concerned.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Pcm,
    /// S/PDIF or HDMI link able to carry IEC 61937 bitstreams.
    Iec958,
}

impl DeviceType {
    /// Classify a device from its advertised encodings.
    ///
    /// Passthrough only works over a stereo link, so anything that is not
    /// exactly two channels stays a PCM device.
    pub fn classify(data_formats: &[DataFormat], channel_count: usize) -> Self {
        let passthrough = data_formats.iter().any(|f| f.is_raw());
        if passthrough && channel_count == 2 {
            Self::Iec958
        } else {
            Self::Pcm
        }
    }
}

/// A playback device reported by a sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Identifier passed back to `AudioSink::initialize`.
    pub device_name: String,
    /// Human-readable name.
    pub display_name: String,
    /// Extra description, prefixed with the sink name.
    pub display_name_extra: String,
    pub channels: Layout,
    pub sample_rates: Vec<u32>,
    pub data_formats: Vec<DataFormat>,
    pub device_type: DeviceType,
}

impl DeviceInfo {
    /// Build a PCM device entry with the default capability set.
    pub fn pcm(device_name: impl Into<String>, display_name: impl Into<String>, channels: Layout) -> Self {
        let display_name = display_name.into();
        Self {
            device_name: device_name.into(),
            display_name_extra: display_name.clone(),
            display_name,
            channels,
            sample_rates: DEFAULT_SAMPLE_RATES.to_vec(),
            data_formats: DEFAULT_DATA_FORMATS.to_vec(),
            device_type: DeviceType::Pcm,
        }
    }

    /// Add passthrough encodings and reclassify the device.
    pub fn add_passthrough(&mut self, formats: &[DataFormat]) {
        for format in formats.iter().filter(|f| f.is_raw()) {
            if !self.data_formats.contains(format) {
                self.data_formats.push(*format);
            }
        }
        self.device_type = DeviceType::classify(&self.data_formats, self.channels.len());
    }

    pub fn supports(&self, format: DataFormat) -> bool {
        self.data_formats.contains(&format)
    }

    pub fn supports_rate(&self, rate: u32) -> bool {
        self.sample_rates.contains(&rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StdLayout;

    #[test]
    fn test_pcm_defaults() {
        let device = DeviceInfo::pcm("hw:0", "Speakers", Layout::standard(StdLayout::Stereo));
        assert_eq!(device.device_type, DeviceType::Pcm);
        assert!(device.supports(DataFormat::Float));
        assert!(device.supports_rate(44100));
        assert!(!device.supports(DataFormat::Ac3));
    }

    #[test]
    fn test_passthrough_requires_stereo() {
        let mut stereo = DeviceInfo::pcm("hdmi:0", "HDMI", Layout::standard(StdLayout::Stereo));
        stereo.add_passthrough(&[DataFormat::Ac3, DataFormat::Dts]);
        assert_eq!(stereo.device_type, DeviceType::Iec958);
        assert!(stereo.supports(DataFormat::Dts));

        let mut surround =
            DeviceInfo::pcm("hdmi:1", "HDMI 5.1", Layout::standard(StdLayout::Surround51));
        surround.add_passthrough(&[DataFormat::Eac3]);
        assert_eq!(surround.device_type, DeviceType::Pcm);
    }

    #[test]
    fn test_classify_without_passthrough() {
        assert_eq!(
            DeviceType::classify(&DEFAULT_DATA_FORMATS, 2),
            DeviceType::Pcm
        );
    }
}
