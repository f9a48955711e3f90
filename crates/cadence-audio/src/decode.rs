//! Audio decoding using symphonia.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use crate::convert;
use cadence_core::{AudioFormat, Channel, DataFormat, Error, Layout, Result, StdLayout};
use std::fs::File;
use std::io::Cursor;
use std::path::Path;
use symphonia::core::{
    audio::{Channels, SampleBuffer, SignalSpec},
    codecs::{Decoder as CodecDecoder, DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
    io::{MediaSource, MediaSourceStream, MediaSourceStreamOptions},
    meta::{MetadataOptions, StandardTagKey, Value},
    probe::Hint,
    units::{Time, TimeBase},
};
use tracing::{debug, error, trace};

/// Source of PCM for one playback session.
pub trait Decoder: Send {
    /// Format of the blocks returned by [`Decoder::decode`].
    fn format(&self) -> AudioFormat;

    /// Length in frames, if the container reports it.
    fn total_frames(&self) -> Option<u64>;

    /// Next block of interleaved samples, or `None` at end of stream.
    fn decode(&mut self) -> Result<Option<&[u8]>>;

    /// Seek to `frame`. Returns the frame actually reached.
    fn seek(&mut self, frame: u64) -> Result<u64>;

    /// Linear track gain from the file's tags.
    fn replay_gain(&self) -> Option<f32> {
        None
    }
}

/// Speaker bits in the order symphonia interleaves them.
const CHANNEL_MAP: [(Channels, Channel); 18] = [
    (Channels::FRONT_LEFT, Channel::Fl),
    (Channels::FRONT_RIGHT, Channel::Fr),
    (Channels::FRONT_CENTRE, Channel::Fc),
    (Channels::LFE1, Channel::Lfe),
    (Channels::REAR_LEFT, Channel::Bl),
    (Channels::REAR_RIGHT, Channel::Br),
    (Channels::FRONT_LEFT_CENTRE, Channel::Flc),
    (Channels::FRONT_RIGHT_CENTRE, Channel::Frc),
    (Channels::REAR_CENTRE, Channel::Bc),
    (Channels::SIDE_LEFT, Channel::Sl),
    (Channels::SIDE_RIGHT, Channel::Sr),
    (Channels::TOP_CENTRE, Channel::Tc),
    (Channels::TOP_FRONT_LEFT, Channel::Tfl),
    (Channels::TOP_FRONT_CENTRE, Channel::Tfc),
    (Channels::TOP_FRONT_RIGHT, Channel::Tfr),
    (Channels::TOP_REAR_LEFT, Channel::Tbl),
    (Channels::TOP_REAR_CENTRE, Channel::Tbc),
    (Channels::TOP_REAR_RIGHT, Channel::Tbr),
];

fn layout_from(channels: Channels) -> Layout {
    let mut layout = Layout::empty();
    for (flag, channel) in CHANNEL_MAP {
        if channels.contains(flag) {
            layout.push(channel);
        }
    }
    layout
}

/// Parse a tag value such as "-6.48 dB" into a linear factor.
fn parse_gain(value: &str) -> Option<f32> {
    let db: f32 = value
        .trim()
        .trim_end_matches(|c: char| c.is_ascii_alphabetic())
        .trim()
        .parse()
        .ok()?;
    Some(10f32.powf(db / 20.0))
}

/// File decoder producing native-endian float frames.
pub struct SymphoniaDecoder {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn CodecDecoder>,
    track_id: u32,
    format: AudioFormat,
    time_base: Option<TimeBase>,
    total_frames: Option<u64>,
    replay_gain: Option<f32>,
    samples: Option<SampleBuffer<f32>>,
    bytes: Vec<u8>,
}

impl SymphoniaDecoder {
    /// Open a file, using its extension as a probe hint.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut hint = Hint::new();
        if let Some(extension) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(extension);
        }
        debug!("Opening {}", path.display());
        Self::from_source(Box::new(file), &hint)
    }

    /// Decode from memory.
    pub fn from_bytes(data: Vec<u8>, extension: Option<&str>) -> Result<Self> {
        let mut hint = Hint::new();
        if let Some(extension) = extension {
            hint.with_extension(extension);
        }
        Self::from_source(Box::new(Cursor::new(data)), &hint)
    }

    fn from_source(source: Box<dyn MediaSource>, hint: &Hint) -> Result<Self> {
        let mss = MediaSourceStream::new(source, MediaSourceStreamOptions::default());
        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };

        let mut probed = symphonia::default::get_probe()
            .format(hint, mss, &format_opts, &MetadataOptions::default())
            .map_err(|e| Error::AudioDecode(format!("Failed to probe format: {e}")))?;

        let mut reader = probed.format;

        // Find the first audio track
        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::AudioDecode("No audio tracks found".to_string()))?;

        let track_id = track.id;
        let params = &track.codec_params;
        let sample_rate = params
            .sample_rate
            .ok_or_else(|| Error::AudioDecode("Track has no sample rate".to_string()))?;
        let layout = match params.channels {
            Some(channels) => layout_from(channels),
            None => Layout::standard(StdLayout::Stereo),
        };
        let format = AudioFormat::with_layout(DataFormat::Float, sample_rate, layout);
        let time_base = params.time_base;
        let total_frames = params.n_frames;

        let decoder = symphonia::default::get_codecs()
            .make(params, &DecoderOptions::default())
            .map_err(|e| Error::AudioDecode(format!("Failed to create decoder: {e}")))?;

        let mut replay_gain = None;
        let mut scan = |tags: &[symphonia::core::meta::Tag]| {
            for tag in tags {
                if tag.std_key == Some(StandardTagKey::ReplayGainTrackGain) {
                    let text = match &tag.value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    replay_gain = parse_gain(&text).or(replay_gain);
                }
            }
        };
        if let Some(revision) = probed.metadata.get().as_ref().and_then(|m| m.current()) {
            scan(revision.tags());
        }
        if let Some(revision) = reader.metadata().current() {
            scan(revision.tags());
        }

        debug!(
            "Audio track: id={}, {}, {} frames, replay gain {:?}",
            track_id,
            format,
            total_frames.map_or_else(|| "unknown".to_string(), |n| n.to_string()),
            replay_gain
        );

        Ok(Self {
            reader,
            decoder,
            track_id,
            format,
            time_base,
            total_frames,
            replay_gain,
            samples: None,
            bytes: Vec::new(),
        })
    }

    fn frames_at(&self, ts: u64) -> u64 {
        match self.time_base {
            Some(tb) => {
                let time = tb.calc_time(ts);
                let secs = time.seconds as f64 + time.frac;
                (secs * f64::from(self.format.sample_rate)).round() as u64
            }
            None => ts,
        }
    }
}

impl Decoder for SymphoniaDecoder {
    fn format(&self) -> AudioFormat {
        self.format.clone()
    }

    fn total_frames(&self) -> Option<u64> {
        self.total_frames
    }

    fn decode(&mut self) -> Result<Option<&[u8]>> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(None); // End of stream
                }
                Err(SymphoniaError::ResetRequired) => {
                    debug!("Stream reset required, treating as end of stream");
                    return Ok(None);
                }
                Err(e) => {
                    return Err(Error::AudioDecode(format!("Failed to read packet: {e}")));
                }
            };

            // Skip packets for other tracks
            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec: SignalSpec = *decoded.spec();
                    let capacity = decoded.capacity() as u64;
                    let samples = self
                        .samples
                        .get_or_insert_with(|| SampleBuffer::new(capacity, spec));
                    if (samples.capacity() as u64) < capacity * spec.channels.count() as u64 {
                        *samples = SampleBuffer::new(capacity, spec);
                    }
                    samples.copy_interleaved_ref(decoded);

                    let floats = samples.samples();
                    if floats.is_empty() {
                        continue;
                    }
                    self.bytes.resize(floats.len() * 4, 0);
                    let len = convert::floats_to_bytes(floats, &mut self.bytes);
                    trace!("Decoded {} samples", floats.len());
                    return Ok(Some(&self.bytes[..len]));
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    // Log and skip corrupt frames
                    error!("Decode error (skipping): {e}");
                }
                Err(e) => {
                    return Err(Error::AudioDecode(format!("Decode failed: {e}")));
                }
            }
        }
    }

    fn seek(&mut self, frame: u64) -> Result<u64> {
        let secs = frame as f64 / f64::from(self.format.sample_rate.max(1));
        let seeked = self
            .reader
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: Time::from(secs),
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| Error::AudioDecode(format!("Seek failed: {e}")))?;

        // Reset decoder state
        self.decoder.reset();
        Ok(self.frames_at(seeked.actual_ts))
    }

    fn replay_gain(&self) -> Option<f32> {
        self.replay_gain
    }
}
