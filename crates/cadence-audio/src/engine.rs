//! Output engine: owns the sink, mixes active streams and feeds the device.
//!
//! The engine is a shared service handed around as `Arc<OutputEngine>`. It
//! negotiates the device format, creates streams bound to that format and
//! runs the pull loop, either on its own thread ([`OutputEngine::start`]) or
//! one cycle at a time through [`OutputEngine::pump`].

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use crate::buffer::ScratchBuffer;
use crate::convert;
use crate::sink::AudioSink;
use crate::stream::{AudioStream, StreamOptions};
use cadence_core::{AudioFormat, DataFormat, DeviceInfo, Error, Result};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Sleep between pull cycles when the device needs nothing.
const IDLE_SLEEP: Duration = Duration::from_millis(5);

/// What to open.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Device name; empty or "default" picks the system default.
    pub device: String,
    /// Requested format; the sink writes back what it negotiated.
    pub format: AudioFormat,
}

#[derive(Default)]
struct Mixer {
    accumulator: ScratchBuffer<f32>,
    samples: ScratchBuffer<f32>,
    stream_bytes: ScratchBuffer<u8>,
    output: ScratchBuffer<u8>,
    /// Encoded frames the sink did not take last cycle.
    pending: Vec<u8>,
    frames_mixed: u64,
}

impl Mixer {
    /// Sum `frames` frames of every PCM stream and encode the result.
    ///
    /// Returns the frames produced, which is the longest stream contribution.
    fn mix(&mut self, streams: &[Arc<AudioStream>], frames: usize, format: &AudioFormat) -> usize {
        let Self {
            accumulator,
            samples,
            stream_bytes,
            output,
            ..
        } = self;

        let channels = format.channel_count;
        let float_frame = 4 * channels;
        let acc = accumulator.ensure_capacity(frames * channels);
        acc.fill(0.0);

        let mut produced = 0;
        for stream in streams.iter().filter(|s| !s.is_raw()) {
            if stream.frame_size() != float_frame {
                trace!("Skipping stream bound to a stale format");
                continue;
            }
            let bytes = stream_bytes.ensure_capacity(frames * float_frame);
            let read = stream.get_frames(bytes);
            if read == 0 {
                continue;
            }
            let floats = samples.ensure_capacity(read / 4);
            let count = convert::bytes_to_floats(&bytes[..read], floats);
            for (sum, sample) in acc.iter_mut().zip(&floats[..count]) {
                *sum += sample;
            }
            produced = produced.max(count / channels);
        }

        if produced == 0 {
            return 0;
        }
        let Some(encode) = convert::from_float(format.data_format) else {
            return 0;
        };
        let out = output.ensure_capacity(produced * format.frame_size);
        encode(&acc[..produced * channels], out);
        produced
    }

    /// Copy one passthrough stream verbatim.
    fn pull_raw(
        &mut self,
        streams: &[Arc<AudioStream>],
        frames: usize,
        format: &AudioFormat,
    ) -> usize {
        let Some(stream) = streams
            .iter()
            .find(|s| s.is_raw() && s.data_format() == format.data_format)
        else {
            return 0;
        };
        let out = self.output.ensure_capacity(frames * format.frame_size);
        stream.get_frames(out) / format.frame_size
    }
}

/// Shared output service.
pub struct OutputEngine {
    sink: Mutex<Box<dyn AudioSink>>,
    config: Mutex<EngineConfig>,
    format: RwLock<Option<AudioFormat>>,
    generation: AtomicU64,
    streams: Mutex<Vec<Arc<AudioStream>>>,
    mixer: Mutex<Mixer>,
    running: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl OutputEngine {
    pub fn new(sink: Box<dyn AudioSink>, config: EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            sink: Mutex::new(sink),
            config: Mutex::new(config),
            format: RwLock::new(None),
            generation: AtomicU64::new(0),
            streams: Mutex::new(Vec::new()),
            mixer: Mutex::new(Mixer::default()),
            running: AtomicBool::new(false),
            thread: Mutex::new(None),
        })
    }

    /// Open the configured device and rebind existing streams to it.
    pub fn open(&self) -> Result<AudioFormat> {
        let config = self.config.lock().clone();
        let mut format = config.format.clone();

        {
            let mut sink = self.sink.lock();
            sink.initialize(&mut format, &config.device)?;
            if !format.is_raw() && convert::from_float(format.data_format).is_none() {
                sink.deinitialize();
                return Err(Error::UnsupportedFormat(format.data_format));
            }
            info!("Output open on {}: {format}", sink.name());
        }

        self.mixer.lock().pending.clear();
        *self.format.write() = Some(format.clone());
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.rebind_streams();
        Ok(format)
    }

    /// Move output to another device without dropping streams.
    pub fn switch_device(&self, device: &str) -> Result<AudioFormat> {
        info!("Switching output to '{device}'");
        self.config.lock().device = device.to_string();
        self.sink.lock().deinitialize();
        *self.format.write() = None;
        self.open()
    }

    fn rebind_streams(&self) {
        let streams = self.streams.lock().clone();
        for stream in streams {
            let rebound = self
                .stream_output_format(&stream.input_format())
                .and_then(|output| stream.initialize_remap(&output));
            if let Err(e) = rebound {
                warn!("Dropping stream after device change: {e}");
                stream.destroy();
            }
        }
        self.streams.lock().retain(|s| !s.is_destroyed());
    }

    /// Stop the pull thread and close the device.
    pub fn close(&self) {
        self.shutdown();
        self.sink.lock().deinitialize();
        *self.format.write() = None;
        debug!("Output closed");
    }

    /// Negotiated device format, if open.
    pub fn format(&self) -> Option<AudioFormat> {
        self.format.read().clone()
    }

    /// Bumped on every successful open; streams compare it to spot changes.
    pub fn format_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Output format a stream with `input` must produce.
    pub fn stream_output_format(&self, input: &AudioFormat) -> Result<AudioFormat> {
        let format = self
            .format()
            .ok_or_else(|| Error::AudioOutput("Output is not open".to_string()))?;

        if input.is_raw() {
            if !format.is_raw() || format.data_format != input.data_format {
                return Err(Error::UnsupportedFormat(input.data_format));
            }
            return Ok(format);
        }
        if format.is_raw() {
            return Err(Error::UnsupportedFormat(input.data_format));
        }
        let mut output = AudioFormat::with_layout(
            DataFormat::Float,
            format.sample_rate,
            format.channel_layout.clone(),
        );
        output.frames = format.frames;
        output.frame_samples = format.frame_samples;
        Ok(output)
    }

    /// Create a stream bound to the current device format.
    pub fn make_stream(
        &self,
        input: AudioFormat,
        options: StreamOptions,
    ) -> Result<Arc<AudioStream>> {
        let output = self.stream_output_format(&input)?;
        let stream = Arc::new(AudioStream::new(input, options));
        stream.initialize(&output)?;
        self.streams.lock().push(Arc::clone(&stream));
        Ok(stream)
    }

    /// Destroy a stream and forget it.
    pub fn free_stream(&self, stream: &Arc<AudioStream>) {
        stream.destroy();
        self.streams.lock().retain(|s| !Arc::ptr_eq(s, stream));
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().len()
    }

    /// Streams that should be pulled this cycle. Destroyed ones are retired.
    fn active_streams(&self) -> Vec<Arc<AudioStream>> {
        let mut streams = self.streams.lock();
        streams.retain(|s| {
            let keep = !s.is_destroyed();
            if !keep {
                debug!("Retiring destroyed stream");
            }
            keep
        });
        streams
            .iter()
            .filter(|s| s.is_valid() && !s.is_paused())
            .cloned()
            .collect()
    }

    /// Frames the device can take right now.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn free_frames(&self, format: &AudioFormat) -> usize {
        let mut sink = self.sink.lock();
        let free = (sink.cache_total() - sink.delay()).max(0.0);
        (free * f64::from(format.sample_rate)).round() as usize
    }

    /// Run one pull cycle. Returns the frames handed to the sink.
    pub fn pump(&self) -> usize {
        let Some(format) = self.format() else {
            return 0;
        };
        let frame_size = format.frame_size;
        if frame_size == 0 {
            return 0;
        }

        let mut mixer = self.mixer.lock();

        if !mixer.pending.is_empty() {
            let frames = mixer.pending.len() / frame_size;
            let accepted = self.sink.lock().add_packets(&mixer.pending, frames);
            mixer.pending.drain(..accepted * frame_size);
            if !mixer.pending.is_empty() {
                return accepted;
            }
        }

        let frames = self.free_frames(&format).min(format.frames.max(1));
        if frames == 0 {
            return 0;
        }

        // Stream callbacks run below; no engine lock but the mixer is held.
        let streams = self.active_streams();
        let produced = if format.is_raw() {
            mixer.pull_raw(&streams, frames, &format)
        } else {
            mixer.mix(&streams, frames, &format)
        };

        for stream in &streams {
            if stream.is_free_on_drain() && stream.is_drained() {
                debug!("Freeing drained stream");
                stream.destroy();
            }
        }

        if produced == 0 {
            return 0;
        }

        let Mixer {
            output,
            pending,
            frames_mixed,
            ..
        } = &mut *mixer;
        let bytes = produced * frame_size;
        let block = &output.as_slice()[..bytes];
        let accepted = self.sink.lock().add_packets(block, produced);
        if accepted < produced {
            pending.extend_from_slice(&block[accepted * frame_size..]);
        }
        *frames_mixed += produced as u64;
        produced
    }

    /// Frames produced by the mixer since creation.
    pub fn frames_mixed(&self) -> u64 {
        self.mixer.lock().frames_mixed
    }

    /// Run the pull loop on a dedicated thread until [`OutputEngine::shutdown`].
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let engine = Arc::downgrade(self);
        let handle = std::thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                info!("Output thread started");
                while let Some(engine) = engine.upgrade() {
                    if !engine.running.load(Ordering::Acquire) {
                        break;
                    }
                    let pushed = engine.pump();
                    drop(engine);
                    if pushed == 0 {
                        std::thread::sleep(IDLE_SLEEP);
                    }
                }
                debug!("Output thread stopped");
            })
            .map_err(|e| Error::AudioOutput(format!("Failed to spawn output thread: {e}")))?;

        *self.thread.lock() = Some(handle);
        Ok(())
    }

    /// Stop the pull thread, if running.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                warn!("Output thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Seconds between the mixer and the speaker.
    #[allow(clippy::cast_precision_loss)]
    pub fn delay(&self) -> f64 {
        let pending = self.mixer.lock().pending.len();
        let sink_delay = self.sink.lock().delay();
        let pending_delay = self
            .format()
            .filter(|f| f.bytes_per_second() > 0)
            .map_or(0.0, |f| pending as f64 / f.bytes_per_second() as f64);
        sink_delay + pending_delay
    }

    /// Seconds between a stream's producer side and the speaker.
    pub fn stream_delay(&self, stream: &AudioStream) -> f64 {
        self.delay() + stream.cache_time()
    }

    pub fn cache_total(&self) -> f64 {
        self.sink.lock().cache_total()
    }

    /// Suspend or resume the device. Returns the state in effect.
    pub fn cork(&self, cork: bool) -> bool {
        let applied = self.sink.lock().cork(cork);
        debug!("Output corked: {applied}");
        applied
    }

    /// Block until the device has played everything queued.
    pub fn drain(&self) {
        self.sink.lock().drain();
    }

    pub fn set_volume(&self, volume: f32) {
        self.sink.lock().set_volume(volume);
    }

    pub fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>> {
        self.sink.lock().enumerate_devices()
    }
}

impl Drop for OutputEngine {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for OutputEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputEngine")
            .field("format", &*self.format.read())
            .field("streams", &self.stream_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::NullSink;
    use cadence_core::{Layout, StdLayout};

    fn engine_with(format: AudioFormat) -> (Arc<OutputEngine>, NullSink) {
        let sink = NullSink::manual();
        let engine = OutputEngine::new(
            Box::new(sink.clone()),
            EngineConfig {
                device: "null".to_string(),
                format,
            },
        );
        (engine, sink)
    }

    fn float_engine() -> (Arc<OutputEngine>, NullSink) {
        let (engine, sink) = engine_with(AudioFormat::new(DataFormat::Float, 1000, 2));
        engine.open().unwrap();
        (engine, sink)
    }

    fn constant(value: f32, frames: usize) -> Vec<u8> {
        std::iter::repeat(value.to_ne_bytes())
            .take(frames * 2)
            .flatten()
            .collect()
    }

    fn float_input() -> AudioFormat {
        AudioFormat::with_layout(DataFormat::Float, 1000, Layout::standard(StdLayout::Stereo))
    }

    #[test]
    fn test_make_stream_requires_open_output() {
        let (engine, _) = engine_with(AudioFormat::new(DataFormat::Float, 1000, 2));
        assert!(engine.make_stream(float_input(), StreamOptions::default()).is_err());
        assert_eq!(engine.pump(), 0);
    }

    #[test]
    fn test_open_negotiates_and_bumps_generation() {
        let (engine, _) = engine_with(AudioFormat::new(DataFormat::S16Le, 48000, 2));
        assert_eq!(engine.format_generation(), 0);
        let format = engine.open().unwrap();
        assert_eq!(format.frame_size, 4);
        assert_eq!(format.frames, 2400);
        assert_eq!(engine.format_generation(), 1);
    }

    #[test]
    fn test_rejects_format_without_encoder() {
        let (engine, _) = engine_with(AudioFormat::new(DataFormat::S24Be3, 48000, 2));
        assert!(matches!(
            engine.open(),
            Err(Error::UnsupportedFormat(DataFormat::S24Be3))
        ));
    }

    #[test]
    fn test_streams_are_summed() {
        let (engine, sink) = float_engine();
        sink.capture();

        let a = engine.make_stream(float_input(), StreamOptions::default()).unwrap();
        let b = engine.make_stream(float_input(), StreamOptions::default()).unwrap();
        a.add_data(&constant(0.25, 50));
        b.add_data(&constant(0.5, 50));

        assert_eq!(engine.pump(), 50);
        let bytes = sink.take_captured();
        assert_eq!(bytes.len(), 50 * 8);
        let mut mixed = vec![0.0f32; 100];
        convert::bytes_to_floats(&bytes, &mut mixed);
        assert!(mixed.iter().all(|s| (s - 0.75).abs() < 1e-6));
    }

    #[test]
    fn test_paused_streams_are_skipped() {
        let (engine, _) = float_engine();
        let stream = engine
            .make_stream(
                float_input(),
                StreamOptions {
                    paused: true,
                    ..StreamOptions::default()
                },
            )
            .unwrap();
        stream.add_data(&constant(0.5, 50));
        assert_eq!(engine.pump(), 0);

        stream.resume();
        assert_eq!(engine.pump(), 50);
    }

    #[test]
    fn test_pump_respects_sink_space() {
        let (engine, sink) = float_engine();
        let stream = engine.make_stream(float_input(), StreamOptions::default()).unwrap();
        stream.add_data(&constant(0.1, 500));

        // Four periods fill the 200 ms buffer.
        for _ in 0..4 {
            assert_eq!(engine.pump(), 50);
        }
        assert_eq!(engine.pump(), 0);

        sink.advance(50);
        assert_eq!(engine.pump(), 50);
        assert_eq!(engine.frames_mixed(), 250);
    }

    #[test]
    fn test_free_on_drain() {
        let (engine, _) = float_engine();
        let stream = engine
            .make_stream(
                float_input(),
                StreamOptions {
                    free_on_drain: true,
                    ..StreamOptions::default()
                },
            )
            .unwrap();
        stream.add_data(&constant(0.1, 20));
        stream.drain();

        engine.pump();
        assert!(stream.is_destroyed());
        engine.pump();
        assert_eq!(engine.stream_count(), 0);
    }

    #[test]
    fn test_s16_device_output() {
        let (engine, sink) = engine_with(AudioFormat::new(DataFormat::S16Le, 1000, 2));
        engine.open().unwrap();
        sink.capture();

        let stream = engine.make_stream(float_input(), StreamOptions::default()).unwrap();
        stream.add_data(&constant(0.5, 10));
        assert_eq!(engine.pump(), 10);

        let bytes = sink.take_captured();
        assert_eq!(bytes.len(), 40);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 16384);
    }

    #[test]
    fn test_switch_device_rebinds_streams() {
        let (engine, _) = float_engine();
        let stream = engine.make_stream(float_input(), StreamOptions::default()).unwrap();
        stream.add_data(&constant(0.1, 100));

        engine.switch_device("null-surround").unwrap();
        assert_eq!(engine.format_generation(), 2);
        assert!(stream.is_valid());
        assert_eq!(stream.buffered_bytes(), 0);
        assert_eq!(engine.stream_count(), 1);
    }

    #[test]
    fn test_free_stream() {
        let (engine, _) = float_engine();
        let stream = engine.make_stream(float_input(), StreamOptions::default()).unwrap();
        engine.free_stream(&stream);
        assert!(stream.is_destroyed());
        assert_eq!(engine.stream_count(), 0);
    }

    #[test]
    fn test_stream_delay_includes_buffers() {
        let (engine, _) = float_engine();
        let stream = engine.make_stream(float_input(), StreamOptions::default()).unwrap();
        stream.add_data(&constant(0.1, 300));
        engine.pump();
        // 50 frames in the sink, 250 still in the stream.
        assert!((engine.stream_delay(&stream) - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_threaded_pull_loop() {
        let sink = NullSink::realtime();
        let engine = OutputEngine::new(
            Box::new(sink.clone()),
            EngineConfig {
                device: "null".to_string(),
                format: AudioFormat::new(DataFormat::Float, 8000, 2),
            },
        );
        engine.open().unwrap();
        let input = AudioFormat::with_layout(
            DataFormat::Float,
            8000,
            Layout::standard(StdLayout::Stereo),
        );
        let stream = engine.make_stream(input, StreamOptions::default()).unwrap();
        stream.add_data(&constant(0.1, 400));

        engine.start().unwrap();
        assert!(engine.is_running());
        std::thread::sleep(Duration::from_millis(100));
        engine.close();
        assert!(!engine.is_running());
        assert!(engine.frames_mixed() > 0);
    }
}
