//! Per-stream conversion chain: convert → resample → remap → ring buffer.
//!
//! The producer side (`add_data`) and the consumer side (`get_frames`) both go
//! through the stream's state mutex. Callbacks are taken out of their slot and
//! invoked with no lock held, so they may call back into the stream.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use crate::buffer::{RingBuffer, ScratchBuffer};
use crate::convert::{self, ToFloatFn};
use crate::remap::Remapper;
use crate::resample::Resampler;
use cadence_core::{AudioFormat, DataFormat, Error, Layout, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Most samples handed to the visualization callback per block.
pub const MAX_VIZ_SAMPLES: usize = 512;

/// Initial size of each scratch buffer, in elements.
const SCRATCH_INITIAL: usize = 16 * 1024;

/// Upper bound for the replay gain factor (+12 dB).
pub const MAX_REPLAY_GAIN: f32 = 4.0;

const DISABLE_POLL: Duration = Duration::from_millis(1);
const DISABLE_TIMEOUT: Duration = Duration::from_secs(2);

/// Requests more input; receives the number of frames that currently fit.
pub type DataCallback = Box<dyn FnMut(&AudioStream, usize) + Send>;
/// Fired once after `drain` when the consumer next pulls.
pub type DrainCallback = Box<dyn FnOnce(&AudioStream) + Send>;
/// Fired once when the stream is dropped.
pub type FreeCallback = Box<dyn FnOnce() + Send>;

/// Receiver of downmixed preview samples.
pub trait AudioCallback: Send + Sync {
    fn on_initialize(&self, channels: usize, sample_rate: u32, bits_per_sample: u32);
    fn on_audio_data(&self, samples: &[f32]);
}

/// Creation options for a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamOptions {
    /// Destroy the stream automatically once it has drained.
    pub free_on_drain: bool,
    /// Run the resampler even when input and output rates match.
    pub force_resample: bool,
    /// Start paused.
    pub paused: bool,
}

/// Linear gain ramp applied on the consumer side.
#[derive(Debug, Clone, Copy)]
struct Fade {
    from: f32,
    to: f32,
    total_frames: usize,
    elapsed_frames: usize,
}

impl Fade {
    #[allow(clippy::cast_precision_loss)]
    fn level(&self) -> f32 {
        if self.total_frames == 0 {
            return self.to;
        }
        let progress = self.elapsed_frames as f32 / self.total_frames as f32;
        (self.to - self.from).mul_add(progress.min(1.0), self.from)
    }

    const fn is_done(&self) -> bool {
        self.elapsed_frames >= self.total_frames
    }
}

struct StreamState {
    input: AudioFormat,
    output: AudioFormat,
    options: StreamOptions,
    valid: bool,
    deleted: bool,
    draining: bool,
    paused: bool,
    needs_convert: bool,
    needs_resample: bool,
    convert_fn: Option<ToFloatFn>,
    resampler: Option<Resampler>,
    remap: Option<Remapper>,
    viz_remap: Option<Remapper>,
    ring: Option<RingBuffer>,
    bytes_per_second: usize,
    convert_buffer: ScratchBuffer<f32>,
    remap_buffer: ScratchBuffer<f32>,
    byte_buffer: ScratchBuffer<u8>,
    viz_buffer: ScratchBuffer<f32>,
    volume: f32,
    replay_gain: f32,
    fade_level: f32,
    fade: Option<Fade>,
    audio_callback: Option<Arc<dyn AudioCallback>>,
}

impl StreamState {
    fn internal_flush(&mut self) {
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
        if let Some(ring) = self.ring.as_mut() {
            ring.reset();
        }
    }

    /// Frames the producer could add right now.
    fn acceptable_frames(&self) -> usize {
        let frame_size = self.input.frame_size.max(self.output.frame_size);
        match (&self.ring, frame_size) {
            (Some(ring), fs) if fs > 0 => ring.write_size() / fs,
            _ => 0,
        }
    }

    fn is_pcm_float_output(&self) -> bool {
        !self.input.is_raw() && self.output.data_format == DataFormat::Float
    }

    /// Remap `frames` of float input and append them to the ring buffer.
    ///
    /// Reads the resampler output when `from_resampler` is set, the convert
    /// buffer otherwise.
    fn write_remapped(&mut self, frames: usize, from_resampler: bool) -> usize {
        let Self {
            output,
            remap,
            resampler,
            convert_buffer,
            remap_buffer,
            byte_buffer,
            ring,
            ..
        } = self;
        let (Some(remap), Some(ring)) = (remap.as_ref(), ring.as_mut()) else {
            return 0;
        };

        let source: &[f32] = if from_resampler {
            resampler.as_ref().map_or(&[][..], Resampler::last_output)
        } else {
            convert_buffer.as_slice()
        };

        let out_samples = frames * output.channel_count;
        let remapped = remap_buffer.ensure_capacity(out_samples);
        let frames = remap.remap(source, remapped, frames);
        let out_samples = frames * output.channel_count;

        let bytes = byte_buffer.ensure_capacity(out_samples * 4);
        let len = convert::floats_to_bytes(&remapped[..out_samples], bytes);
        ring.write(&bytes[..len])
    }
}

/// One playback stream feeding the output engine.
pub struct AudioStream {
    state: Mutex<StreamState>,
    data_callback: Mutex<Option<DataCallback>>,
    drain_callback: Mutex<Option<DrainCallback>>,
    free_callback: Mutex<Option<FreeCallback>>,
    callbacks_disabled: AtomicBool,
    callbacks_in_flight: AtomicUsize,
}

/// Counts a callback as in flight for as long as it lives.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AudioStream {
    /// Create an uninitialized stream for input of the given format.
    ///
    /// The stream is inert until [`AudioStream::initialize`] succeeds.
    pub fn new(input: AudioFormat, options: StreamOptions) -> Self {
        Self {
            state: Mutex::new(StreamState {
                output: input.clone(),
                input,
                options,
                valid: false,
                deleted: false,
                draining: false,
                paused: options.paused,
                needs_convert: false,
                needs_resample: false,
                convert_fn: None,
                resampler: None,
                remap: None,
                viz_remap: None,
                ring: None,
                bytes_per_second: 0,
                convert_buffer: ScratchBuffer::with_len(SCRATCH_INITIAL),
                remap_buffer: ScratchBuffer::with_len(SCRATCH_INITIAL),
                byte_buffer: ScratchBuffer::with_len(SCRATCH_INITIAL),
                viz_buffer: ScratchBuffer::with_len(SCRATCH_INITIAL),
                volume: 1.0,
                replay_gain: 1.0,
                fade_level: 1.0,
                fade: None,
                audio_callback: None,
            }),
            data_callback: Mutex::new(None),
            drain_callback: Mutex::new(None),
            free_callback: Mutex::new(None),
            callbacks_disabled: AtomicBool::new(false),
            callbacks_in_flight: AtomicUsize::new(0),
        }
    }

    /// Bind the stream to a concrete output format.
    ///
    /// On error the stream is left invalid and must not be used.
    pub fn initialize(&self, output: &AudioFormat) -> Result<()> {
        let mut state = self.state.lock();
        if state.valid {
            state.internal_flush();
        }
        state.valid = false;

        let result = Self::negotiate(&mut state, output);
        match &result {
            Ok(()) => {
                state.valid = true;
                debug!(
                    "Stream initialized: {} -> {} (convert: {}, resample: {})",
                    state.input, state.output, state.needs_convert, state.needs_resample
                );
            }
            Err(e) => warn!("Stream initialization failed: {e}"),
        }
        result
    }

    fn negotiate(state: &mut StreamState, output: &AudioFormat) -> Result<()> {
        if output.sample_rate == 0 || output.frame_size == 0 {
            return Err(Error::Negotiation(format!("Unusable output format {output}")));
        }
        state.output = output.clone();
        let raw = state.input.is_raw();

        if raw {
            if state.input.data_format != output.data_format {
                return Err(Error::UnsupportedFormat(state.input.data_format));
            }
            state.input.frame_size = output.frame_size;
        } else {
            if output.data_format != DataFormat::Float {
                return Err(Error::UnsupportedFormat(output.data_format));
            }
            if state.input.channel_layout.is_empty() {
                state.input.channel_layout = Layout::guess(state.input.channel_count)
                    .ok_or(Error::UnsupportedLayout(state.input.channel_count))?;
            }
            state.input.channel_count = state.input.channel_layout.len();
            state.input.frame_size = state.input.pcm_frame_size();

            state.remap = Some(Remapper::new(
                &state.input.channel_layout,
                &output.channel_layout,
                true,
            )?);
            state.viz_remap = Some(Remapper::to_stereo(&output.channel_layout)?);
        }

        state.needs_resample = !raw
            && (state.options.force_resample || state.input.sample_rate != output.sample_rate);
        state.needs_convert = !raw && state.input.data_format != DataFormat::Float;

        state.convert_fn = None;
        if !raw {
            if state.needs_convert {
                debug!("Converting from {} to FLOAT", state.input.data_format);
            }
            state.convert_fn = Some(
                convert::to_float(state.input.data_format)
                    .ok_or(Error::UnsupportedFormat(state.input.data_format))?,
            );
        }

        state.resampler = if state.needs_resample {
            Some(Resampler::new(
                state.input.sample_rate,
                output.sample_rate,
                state.input.channel_count,
            )?)
        } else {
            None
        };

        state.bytes_per_second = output.frame_size * output.sample_rate as usize;
        state.ring = Some(RingBuffer::new(state.bytes_per_second));
        Ok(())
    }

    /// Rebuild the remap matrices after the output device changed.
    ///
    /// Falls back to a full re-initialization when the rate or encoding
    /// changed too. Buffered audio is discarded.
    pub fn initialize_remap(&self, output: &AudioFormat) -> Result<()> {
        {
            let mut state = self.state.lock();
            let same_clock = state.output.sample_rate == output.sample_rate
                && state.output.data_format == output.data_format
                && state.output.frame_size == output.frame_size;
            if state.valid && same_clock {
                if !state.input.is_raw() {
                    let remap =
                        Remapper::new(&state.input.channel_layout, &output.channel_layout, true);
                    let viz = Remapper::to_stereo(&output.channel_layout);
                    match (remap, viz) {
                        (Ok(remap), Ok(viz)) => {
                            state.remap = Some(remap);
                            state.viz_remap = Some(viz);
                        }
                        (Err(e), _) | (_, Err(e)) => {
                            state.valid = false;
                            return Err(e);
                        }
                    }
                }
                state.output = output.clone();
                state.internal_flush();
                return Ok(());
            }
        }
        self.initialize(output)
    }

    /// Push encoded input. Returns the input bytes consumed: all or nothing.
    pub fn add_data(&self, data: &[u8]) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if !state.valid || data.is_empty() || state.draining || state.deleted {
            return 0;
        }
        let Some(ring) = state.ring.as_ref() else {
            return 0;
        };
        let room = ring.write_size();

        if state.input.is_raw() {
            let frame_size = state.input.frame_size.max(1);
            if data.len() % frame_size != 0 {
                trace!(
                    "Dropping {} raw bytes: not a multiple of frame size {}",
                    data.len(),
                    frame_size
                );
                return 0;
            }
            if data.len() > room {
                trace!("Stream full: {} bytes free, {} needed", room, data.len());
                return 0;
            }
            return state.ring.as_mut().map_or(0, |ring| ring.write(data));
        }

        let in_frame_size = state.input.frame_size;
        let frames = data.len() / in_frame_size;
        if frames == 0 {
            return 0;
        }

        // Worst-case output size, checked before any state is touched.
        let out_frames_max = match state.resampler.as_ref() {
            Some(resampler) => resampler.max_output_frames(frames),
            None => frames,
        };
        if out_frames_max * state.output.frame_size > room {
            trace!(
                "Stream full: {} bytes free, up to {} needed",
                room,
                out_frames_max * state.output.frame_size
            );
            return 0;
        }

        let Some(convert_fn) = state.convert_fn else {
            return 0;
        };
        let samples = frames * state.input.channel_count;
        let converted = convert_fn(
            &data[..frames * in_frame_size],
            state.convert_buffer.ensure_capacity(samples),
        );
        if converted == 0 {
            return 0;
        }

        let (out_frames, from_resampler) = match state.resampler.as_mut() {
            Some(resampler) => {
                match resampler.process(&state.convert_buffer.as_slice()[..converted]) {
                    Ok(out) => (out.len() / state.input.channel_count, true),
                    Err(e) => {
                        warn!("Dropping block: {e}");
                        return 0;
                    }
                }
            }
            None => (frames, false),
        };

        if out_frames > 0 {
            state.write_remapped(out_frames, from_resampler);
        }
        data.len()
    }

    /// Pull converted output into `buffer`. Returns the bytes copied.
    pub fn get_frames(&self, buffer: &mut [u8]) -> usize {
        let (draining, acceptable) = {
            let state = self.state.lock();
            if !state.valid || state.deleted || state.ring.is_none() {
                return 0;
            }
            (state.draining, state.acceptable_frames())
        };

        if draining {
            self.fire_drain_callback();
        } else {
            self.fire_data_callback(acceptable);
        }

        let mut viz = [0.0f32; MAX_VIZ_SAMPLES];
        let (copied, viz_len, audio_callback) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(ring) = state.ring.as_mut() else {
                return 0;
            };
            let frame_size = state.output.frame_size.max(1);
            let whole = buffer.len().min(ring.read_size());
            let copied = ring.read(&mut buffer[..whole - whole % frame_size]);

            let mut viz_len = 0;
            let mut audio_callback = None;
            if copied > 0 && state.is_pcm_float_output() {
                let block = &mut buffer[..copied];
                if let (Some(callback), Some(viz_remap)) =
                    (state.audio_callback.as_ref(), state.viz_remap.as_ref())
                {
                    let frames = copied / state.output.frame_size;
                    let floats = state
                        .remap_buffer
                        .ensure_capacity(frames * state.output.channel_count);
                    convert::bytes_to_floats(block, floats);
                    let stereo = state.viz_buffer.ensure_capacity(frames * 2);
                    let done = viz_remap.remap(floats, stereo, frames);
                    viz_len = (done * 2).min(MAX_VIZ_SAMPLES);
                    viz[..viz_len].copy_from_slice(&stereo[..viz_len]);
                    audio_callback = Some(Arc::clone(callback));
                }
                Self::apply_gain(state, block);
            }
            (copied, viz_len, audio_callback)
        };

        if let Some(callback) = audio_callback {
            if viz_len > 0 {
                callback.on_audio_data(&viz[..viz_len]);
            }
        }
        copied
    }

    fn apply_gain(state: &mut StreamState, block: &mut [u8]) {
        let base = state.volume * state.replay_gain;
        let channels = state.output.channel_count.max(1);

        if state.fade.is_none() && (base * state.fade_level - 1.0).abs() < f32::EPSILON {
            return;
        }

        for frame in block.chunks_exact_mut(4 * channels) {
            let level = match state.fade.as_mut() {
                Some(fade) => {
                    let level = fade.level();
                    fade.elapsed_frames += 1;
                    level
                }
                None => state.fade_level,
            };
            let gain = base * level;
            for sample in frame.chunks_exact_mut(4) {
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(sample);
                let value = f32::from_ne_bytes(bytes) * gain;
                sample.copy_from_slice(&value.to_ne_bytes());
            }
        }

        if let Some(fade) = state.fade {
            if fade.is_done() {
                state.fade_level = fade.to;
                state.fade = None;
            }
        }
    }

    // The in-flight counter is raised before the flag is read, so
    // `disable_callbacks` either sees the counter or the callback sees the flag.
    fn fire_drain_callback(&self) {
        let _in_flight = InFlight::enter(&self.callbacks_in_flight);
        if self.callbacks_disabled.load(Ordering::SeqCst) {
            return;
        }
        let Some(callback) = self.drain_callback.lock().take() else {
            return;
        };
        callback(self);
    }

    fn fire_data_callback(&self, frames: usize) {
        let callback = {
            let _in_flight = InFlight::enter(&self.callbacks_in_flight);
            if self.callbacks_disabled.load(Ordering::SeqCst) {
                return;
            }
            let Some(mut callback) = self.data_callback.lock().take() else {
                return;
            };
            callback(self, frames);
            callback
        };

        let mut slot = self.data_callback.lock();
        if slot.is_none() && !self.callbacks_disabled.load(Ordering::SeqCst) {
            *slot = Some(callback);
        }
    }

    pub fn set_data_callback(&self, callback: DataCallback) {
        *self.data_callback.lock() = Some(callback);
    }

    pub fn set_drain_callback(&self, callback: DrainCallback) {
        *self.drain_callback.lock() = Some(callback);
    }

    pub fn set_free_callback(&self, callback: FreeCallback) {
        *self.free_callback.lock() = Some(callback);
    }

    /// Stop invoking data and drain callbacks.
    ///
    /// Blocks until callbacks already running have returned, then clears
    /// them. The free callback is cleared too when `free` is set.
    pub fn disable_callbacks(&self, free: bool) {
        self.callbacks_disabled.store(true, Ordering::SeqCst);

        let start = Instant::now();
        while self.is_busy() {
            if start.elapsed() > DISABLE_TIMEOUT {
                warn!("Callback still running after {:?}", DISABLE_TIMEOUT);
                break;
            }
            std::thread::sleep(DISABLE_POLL);
        }

        *self.data_callback.lock() = None;
        *self.drain_callback.lock() = None;
        if free {
            *self.free_callback.lock() = None;
        }
    }

    /// Whether a data or drain callback is currently executing.
    pub fn is_busy(&self) -> bool {
        self.callbacks_in_flight.load(Ordering::SeqCst) > 0
    }

    pub fn register_audio_callback(&self, callback: Arc<dyn AudioCallback>) {
        let sample_rate = {
            let mut state = self.state.lock();
            state.audio_callback = Some(Arc::clone(&callback));
            state.input.sample_rate
        };
        callback.on_initialize(2, sample_rate, 32);
    }

    pub fn unregister_audio_callback(&self) {
        self.state.lock().audio_callback = None;
    }

    /// Mark the stream dead. Idempotent.
    pub fn destroy(&self) {
        let mut state = self.state.lock();
        if !state.deleted {
            debug!("Destroying stream {}", state.input);
        }
        state.valid = false;
        state.deleted = true;
        state.internal_flush();
    }

    /// Discard buffered audio and reset the resampler.
    pub fn flush(&self) {
        self.state.lock().internal_flush();
    }

    /// Signal that no more input will arrive.
    ///
    /// Any input still held back by the resampler is pushed through first.
    pub fn drain(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.draining || !state.valid {
            state.draining = true;
            return;
        }

        let channels = state.input.channel_count.max(1);
        let tail = state
            .resampler
            .as_mut()
            .map(|resampler| resampler.flush().map(|out| out.len() / channels));
        match tail {
            Some(Ok(frames)) if frames > 0 => {
                let frame_size = state.output.frame_size.max(1);
                let room = state.ring.as_ref().map_or(0, RingBuffer::write_size) / frame_size;
                if frames > room {
                    trace!(
                        "Stream full: dropping {} of {} tail frames",
                        frames - room,
                        frames
                    );
                }
                if room > 0 {
                    state.write_remapped(frames.min(room), true);
                }
            }
            Some(Err(e)) => warn!("Failed to flush resampler: {e}"),
            _ => {}
        }
        state.draining = true;
    }

    pub fn pause(&self) {
        self.state.lock().paused = true;
    }

    pub fn resume(&self) {
        self.state.lock().paused = false;
    }

    /// Ramp the stream gain from `from` to `to` over `duration`.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn fade_volume(&self, from: f32, to: f32, duration: Duration) {
        let mut state = self.state.lock();
        let total_frames =
            (duration.as_secs_f64() * f64::from(state.output.sample_rate)).round() as usize;
        let from = from.clamp(0.0, 1.0);
        let to = to.clamp(0.0, 1.0);
        if total_frames == 0 {
            state.fade = None;
            state.fade_level = to;
            return;
        }
        state.fade_level = from;
        state.fade = Some(Fade {
            from,
            to,
            total_frames,
            elapsed_frames: 0,
        });
    }

    pub fn is_fading(&self) -> bool {
        self.state.lock().fade.is_some()
    }

    /// Current fade multiplier, 1.0 when no fade was ever applied.
    pub fn fade_level(&self) -> f32 {
        let state = self.state.lock();
        state.fade.as_ref().map_or(state.fade_level, Fade::level)
    }

    pub fn volume(&self) -> f32 {
        self.state.lock().volume
    }

    pub fn set_volume(&self, volume: f32) {
        self.state.lock().volume = volume.clamp(0.0, 1.0);
    }

    pub fn replay_gain(&self) -> f32 {
        self.state.lock().replay_gain
    }

    /// Set the replay gain factor, clamped to `[0, MAX_REPLAY_GAIN]`.
    pub fn set_replay_gain(&self, factor: f32) {
        self.state.lock().replay_gain = factor.clamp(0.0, MAX_REPLAY_GAIN);
    }

    /// Output/input ratio of the resampler, 1.0 when not resampling.
    pub fn resample_ratio(&self) -> f64 {
        self.state
            .lock()
            .resampler
            .as_ref()
            .map_or(1.0, Resampler::ratio)
    }

    pub fn set_resample_ratio(&self, ratio: f64) {
        let mut state = self.state.lock();
        if let Some(resampler) = state.resampler.as_mut() {
            if let Err(e) = resampler.set_ratio(ratio) {
                warn!("{e}");
            }
        }
    }

    /// Seconds of audio buffered in the ring.
    #[allow(clippy::cast_precision_loss)]
    pub fn cache_time(&self) -> f64 {
        let state = self.state.lock();
        match (&state.ring, state.deleted) {
            (Some(ring), false) if state.bytes_per_second > 0 => {
                ring.read_size() as f64 / state.bytes_per_second as f64
            }
            _ => 0.0,
        }
    }

    /// Seconds of audio the ring can hold.
    #[allow(clippy::cast_precision_loss)]
    pub fn cache_total(&self) -> f64 {
        let state = self.state.lock();
        match (&state.ring, state.deleted) {
            (Some(ring), false) if state.bytes_per_second > 0 => {
                ring.capacity() as f64 / state.bytes_per_second as f64
            }
            _ => 0.0,
        }
    }

    /// Bytes buffered in the ring.
    pub fn buffered_bytes(&self) -> usize {
        self.state.lock().ring.as_ref().map_or(0, RingBuffer::read_size)
    }

    /// Bytes the ring can still take.
    pub fn free_bytes(&self) -> usize {
        self.state.lock().ring.as_ref().map_or(0, RingBuffer::write_size)
    }

    /// Bytes per output frame.
    pub fn frame_size(&self) -> usize {
        self.state.lock().output.frame_size
    }

    /// Bytes per input frame.
    pub fn input_frame_size(&self) -> usize {
        self.state.lock().input.frame_size
    }

    pub fn input_format(&self) -> AudioFormat {
        self.state.lock().input.clone()
    }

    pub fn output_format(&self) -> AudioFormat {
        self.state.lock().output.clone()
    }

    pub fn channel_count(&self) -> usize {
        self.state.lock().input.channel_count
    }

    pub fn sample_rate(&self) -> u32 {
        self.state.lock().input.sample_rate
    }

    pub fn data_format(&self) -> DataFormat {
        self.state.lock().input.data_format
    }

    pub fn is_raw(&self) -> bool {
        self.state.lock().input.is_raw()
    }

    pub fn is_valid(&self) -> bool {
        self.state.lock().valid
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().deleted
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn is_draining(&self) -> bool {
        self.state.lock().draining
    }

    /// Draining and nothing left to play.
    pub fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.draining && state.ring.as_ref().map_or(true, RingBuffer::is_empty)
    }

    pub fn is_free_on_drain(&self) -> bool {
        self.state.lock().options.free_on_drain
    }

    pub fn set_free_on_drain(&self) {
        self.state.lock().options.free_on_drain = true;
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        {
            let state = self.state.get_mut();
            state.convert_buffer.release();
            state.remap_buffer.release();
            state.byte_buffer.release();
            state.viz_buffer.release();
            state.ring = None;
        }
        if let Some(callback) = self.free_callback.get_mut().take() {
            callback();
        }
        debug!("Stream dropped");
    }
}

impl std::fmt::Debug for AudioStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AudioStream")
            .field("input", &state.input)
            .field("output", &state.output)
            .field("valid", &state.valid)
            .field("draining", &state.draining)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::StdLayout;
    use std::sync::atomic::AtomicU32;
    use std::sync::Barrier;
    use std::thread;

    fn float_output(rate: u32) -> AudioFormat {
        AudioFormat::with_layout(DataFormat::Float, rate, Layout::standard(StdLayout::Stereo))
    }

    fn s16_stream(rate: u32) -> AudioStream {
        AudioStream::new(
            AudioFormat::new(DataFormat::S16Le, rate, 2),
            StreamOptions::default(),
        )
    }

    fn s16_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn floats(bytes: &[u8]) -> Vec<f32> {
        let mut out = vec![0.0f32; bytes.len() / 4];
        convert::bytes_to_floats(bytes, &mut out);
        out
    }

    #[test]
    fn test_uninitialized_stream_is_inert() {
        let stream = s16_stream(48000);
        assert!(!stream.is_valid());
        assert_eq!(stream.add_data(&[0u8; 64]), 0);
        let mut out = [0u8; 64];
        assert_eq!(stream.get_frames(&mut out), 0);
    }

    #[test]
    fn test_initialize_guesses_layout_and_sizes_ring() {
        let stream = s16_stream(48000);
        stream.initialize(&float_output(48000)).unwrap();
        assert!(stream.is_valid());
        assert_eq!(stream.input_format().channel_layout.len(), 2);
        assert_eq!(stream.input_frame_size(), 4);
        assert_eq!(stream.free_bytes(), 8 * 48000);
        assert!((stream.cache_total() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_initialize_fails_without_layout() {
        let stream = AudioStream::new(
            AudioFormat::new(DataFormat::S16Le, 48000, 11),
            StreamOptions::default(),
        );
        let err = stream.initialize(&float_output(48000)).unwrap_err();
        assert!(matches!(err, Error::UnsupportedLayout(11)));
        assert!(!stream.is_valid());
    }

    #[test]
    fn test_silence_round_trip() {
        let stream = s16_stream(48000);
        stream.initialize(&float_output(48000)).unwrap();

        let input = s16_bytes(&[0, 0]);
        assert_eq!(stream.add_data(&input), input.len());

        let mut out = [0xFFu8; 8];
        assert_eq!(stream.get_frames(&mut out), 8);
        assert!(floats(&out).iter().all(|s| s.abs() < 1e-6));
    }

    #[test]
    fn test_conversion_and_remap_to_float() {
        let stream = s16_stream(48000);
        stream.initialize(&float_output(48000)).unwrap();

        stream.add_data(&s16_bytes(&[16384, -16384]));
        let mut out = [0u8; 8];
        stream.get_frames(&mut out);
        let samples = floats(&out);
        assert!((samples[0] - 0.5).abs() < 1e-4);
        assert!((samples[1] + 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_add_data_all_or_nothing() {
        let stream = AudioStream::new(
            AudioFormat::new(DataFormat::Float, 1000, 2),
            StreamOptions::default(),
        );
        stream.initialize(&float_output(1000)).unwrap();
        let capacity = stream.free_bytes();
        assert_eq!(capacity, 8000);

        let block = vec![0u8; 6000];
        assert_eq!(stream.add_data(&block), 6000);
        let buffered = stream.buffered_bytes();

        // 6000 more bytes do not fit into the remaining 2000.
        assert_eq!(stream.add_data(&block), 0);
        assert_eq!(stream.buffered_bytes(), buffered);
    }

    #[test]
    fn test_add_data_rejected_while_draining() {
        let stream = s16_stream(48000);
        stream.initialize(&float_output(48000)).unwrap();
        stream.drain();
        assert_eq!(stream.add_data(&s16_bytes(&[1, 2])), 0);
    }

    #[test]
    fn test_flush_empties_buffer_and_resets_resampler() {
        let stream = s16_stream(44100);
        stream.initialize(&float_output(48000)).unwrap();
        let baseline = stream.resample_ratio();
        assert!((baseline - 48000.0 / 44100.0).abs() < 1e-9);

        stream.add_data(&s16_bytes(&[100; 2 * 4096]));
        assert!(stream.buffered_bytes() > 0);
        stream.set_resample_ratio(baseline * 1.05);

        stream.flush();
        let mut out = [0u8; 256];
        assert_eq!(stream.get_frames(&mut out), 0);
        assert!((stream.resample_ratio() - baseline).abs() < 1e-12);
    }

    #[test]
    fn test_volume_clamped() {
        let stream = s16_stream(48000);
        stream.set_volume(1.7);
        assert!((stream.volume() - 1.0).abs() < f32::EPSILON);
        stream.set_volume(-0.3);
        assert!(stream.volume().abs() < f32::EPSILON);
        stream.set_volume(0.25);
        assert!((stream.volume() - 0.25).abs() < f32::EPSILON);
    }

    #[test]
    fn test_replay_gain_clamped() {
        let stream = s16_stream(48000);
        stream.set_replay_gain(0.5);
        assert!((stream.replay_gain() - 0.5).abs() < f32::EPSILON);
        stream.set_replay_gain(-2.0);
        assert!(stream.replay_gain().abs() < f32::EPSILON);
        stream.set_replay_gain(100.0);
        assert!((stream.replay_gain() - MAX_REPLAY_GAIN).abs() < f32::EPSILON);
    }

    #[test]
    fn test_drain_callback_fires_once() {
        let stream = s16_stream(48000);
        stream.initialize(&float_output(48000)).unwrap();
        stream.add_data(&s16_bytes(&[1; 64]));

        let count = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&count);
        stream.set_drain_callback(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        stream.drain();

        let mut out = [0u8; 16];
        for _ in 0..5 {
            stream.get_frames(&mut out);
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_data_callback_can_reenter() {
        let stream = Arc::new(s16_stream(48000));
        stream.initialize(&float_output(48000)).unwrap();

        let requested = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&requested);
        stream.set_data_callback(Box::new(move |s, frames| {
            seen.store(frames, Ordering::SeqCst);
            s.add_data(&[0u8; 16]);
        }));

        let mut out = [0u8; 32];
        assert_eq!(stream.get_frames(&mut out), 32);
        assert_eq!(requested.load(Ordering::SeqCst), 48000);

        // The callback stays registered across pulls.
        assert_eq!(stream.get_frames(&mut out), 32);
    }

    #[test]
    fn test_disable_callbacks_clears_slots() {
        let stream = s16_stream(48000);
        stream.initialize(&float_output(48000)).unwrap();

        let count = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&count);
        stream.set_data_callback(Box::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        stream.disable_callbacks(true);
        assert!(!stream.is_busy());

        let mut out = [0u8; 16];
        stream.get_frames(&mut out);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_disable_callbacks_waits_for_running_callback() {
        let stream = Arc::new(s16_stream(48000));
        stream.initialize(&float_output(48000)).unwrap();

        let entered = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        let calls = Arc::new(AtomicU32::new(0));
        {
            let entered = Arc::clone(&entered);
            let release = Arc::clone(&release);
            let calls = Arc::clone(&calls);
            stream.set_data_callback(Box::new(move |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                entered.wait();
                release.wait();
            }));
        }

        let consumer = {
            let stream = Arc::clone(&stream);
            thread::spawn(move || {
                let mut out = [0u8; 16];
                stream.get_frames(&mut out);
            })
        };
        entered.wait();
        assert!(stream.is_busy());

        let returned = Arc::new(AtomicBool::new(false));
        let disabler = {
            let stream = Arc::clone(&stream);
            let returned = Arc::clone(&returned);
            thread::spawn(move || {
                stream.disable_callbacks(false);
                returned.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!returned.load(Ordering::SeqCst));

        release.wait();
        consumer.join().unwrap();
        disabler.join().unwrap();
        assert!(returned.load(Ordering::SeqCst));
        assert!(!stream.is_busy());

        // The callback is gone once disable_callbacks has returned.
        let mut out = [0u8; 16];
        stream.get_frames(&mut out);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drain_tail_keeps_whole_frames_when_full() {
        let stream = s16_stream(44100);
        stream.initialize(&float_output(48000)).unwrap();
        let capacity = stream.free_bytes();

        let block = s16_bytes(&[1000; 2 * 1000]);
        for _ in 0..100 {
            if stream.add_data(&block) == 0 {
                break;
            }
        }
        assert!(stream.free_bytes() < capacity);

        stream.drain();
        assert!(stream.is_draining());
        assert!(stream.buffered_bytes() <= capacity);
        assert_eq!(stream.buffered_bytes() % 8, 0);
    }

    #[test]
    fn test_raw_rejects_partial_frames() {
        let mut output = AudioFormat::new(DataFormat::Ac3, 48000, 2);
        output.frame_size = 4;
        let stream = AudioStream::new(
            AudioFormat::new(DataFormat::Ac3, 48000, 2),
            StreamOptions::default(),
        );
        stream.initialize(&output).unwrap();

        assert_eq!(stream.add_data(&[9u8; 6]), 0);
        assert_eq!(stream.buffered_bytes(), 0);

        let payload = [1u8, 2, 3, 4, 5, 6, 7, 8];
        assert_eq!(stream.add_data(&payload), 8);

        // Only whole frames are handed out, the rest stays buffered.
        let mut out = [0u8; 6];
        assert_eq!(stream.get_frames(&mut out), 4);
        assert_eq!(&out[..4], &payload[..4]);
        assert_eq!(stream.buffered_bytes(), 4);
    }

    #[test]
    fn test_free_callback_fires_on_drop() {
        let freed = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&freed);
        let stream = s16_stream(48000);
        stream.set_free_callback(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        stream.destroy();
        stream.destroy();
        assert!(stream.is_destroyed());
        assert_eq!(freed.load(Ordering::SeqCst), 0);
        drop(stream);
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fade_ramps_down() {
        let stream = AudioStream::new(float_output(1000), StreamOptions::default());
        stream.initialize(&float_output(1000)).unwrap();

        let ones: Vec<u8> = std::iter::repeat(1.0f32.to_ne_bytes())
            .take(2 * 100)
            .flatten()
            .collect();
        stream.add_data(&ones);
        stream.fade_volume(1.0, 0.0, Duration::from_millis(100));

        let mut out = vec![0u8; ones.len()];
        stream.get_frames(&mut out);
        let samples = floats(&out);
        assert!((samples[0] - 1.0).abs() < 1e-6);
        assert!(samples[198] < 0.05);
        let left: Vec<f32> = samples.chunks(2).map(|frame| frame[0]).collect();
        assert!(left.windows(2).all(|w| w[0] >= w[1] - 1e-6));
        assert!(!stream.is_fading());
        assert!(stream.fade_level().abs() < f32::EPSILON);
    }

    #[test]
    fn test_raw_passthrough() {
        let mut output = AudioFormat::new(DataFormat::Ac3, 48000, 2);
        output.frame_size = 4;
        let stream = AudioStream::new(
            AudioFormat::new(DataFormat::Ac3, 48000, 2),
            StreamOptions::default(),
        );
        stream.initialize(&output).unwrap();
        assert!(stream.is_raw());
        assert!((stream.resample_ratio() - 1.0).abs() < f64::EPSILON);

        let payload = [1u8, 2, 3, 4, 5, 6, 7, 8];
        assert_eq!(stream.add_data(&payload), 8);
        let mut out = [0u8; 8];
        assert_eq!(stream.get_frames(&mut out), 8);
        assert_eq!(out, payload);
    }

    struct Collector(Mutex<Vec<usize>>);

    impl AudioCallback for Collector {
        fn on_initialize(&self, channels: usize, _sample_rate: u32, bits: u32) {
            assert_eq!(channels, 2);
            assert_eq!(bits, 32);
        }

        fn on_audio_data(&self, samples: &[f32]) {
            self.0.lock().push(samples.len());
        }
    }

    #[test]
    fn test_visualization_samples_capped() {
        let stream = s16_stream(48000);
        stream.initialize(&float_output(48000)).unwrap();
        let collector = Arc::new(Collector(Mutex::new(Vec::new())));
        stream.register_audio_callback(collector.clone());

        stream.add_data(&s16_bytes(&[0; 2 * 1024]));
        let mut out = vec![0u8; 8 * 1024];
        stream.get_frames(&mut out);
        assert_eq!(collector.0.lock().as_slice(), &[MAX_VIZ_SAMPLES]);
    }
}
