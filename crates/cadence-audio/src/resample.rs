//! Streaming sample-rate conversion using rubato.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use cadence_core::{Error, Result};
use rubato::{
    Resampler as RubatoResampler, SincFixedIn, SincInterpolationParameters,
    SincInterpolationType, WindowFunction,
};
use tracing::{debug, warn};

/// Input frames consumed per rubato call.
const CHUNK_SIZE: usize = 1024;

/// How far `set_ratio` may move away from the initial ratio, either way.
const MAX_RATIO_RELATIVE: f64 = 2.0;

/// Sinc resampler accepting arbitrarily sized interleaved blocks.
///
/// Input is accumulated until a full chunk is available; leftovers are kept
/// for the next call, so output trails input by less than one chunk plus the
/// filter delay.
pub struct Resampler {
    #[allow(clippy::struct_field_names)]
    resampler: SincFixedIn<f32>,
    input_rate: u32,
    output_rate: u32,
    channels: usize,
    /// Ratio the resampler was created with.
    initial_ratio: f64,
    /// Current output/input ratio.
    ratio: f64,
    /// Set once the final partial chunk has been pushed through.
    end_of_input: bool,
    /// Deinterleaved input waiting for a full chunk.
    input_buffer: Vec<Vec<f32>>,
    /// Interleaved output of the last call.
    output: Vec<f32>,
}

impl Resampler {
    /// Create a new resampler.
    pub fn new(input_rate: u32, output_rate: u32, channels: usize) -> Result<Self> {
        if input_rate == 0 || output_rate == 0 || channels == 0 {
            return Err(Error::InvalidArgument(format!(
                "Cannot resample {input_rate}Hz -> {output_rate}Hz with {channels} channels"
            )));
        }

        let ratio = f64::from(output_rate) / f64::from(input_rate);
        let params = SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.95,
            oversampling_factor: 128,
            interpolation: SincInterpolationType::Linear,
            window: WindowFunction::BlackmanHarris2,
        };

        let resampler =
            SincFixedIn::new(ratio, MAX_RATIO_RELATIVE, params, CHUNK_SIZE, channels)
                .map_err(|e| Error::Resample(format!("Failed to create resampler: {e}")))?;

        debug!(
            "Resampler created: {}Hz -> {}Hz, {} channels",
            input_rate, output_rate, channels
        );

        Ok(Self {
            resampler,
            input_rate,
            output_rate,
            channels,
            initial_ratio: ratio,
            ratio,
            end_of_input: false,
            input_buffer: vec![Vec::with_capacity(CHUNK_SIZE * 2); channels],
            output: Vec::new(),
        })
    }

    /// Get the input sample rate.
    pub const fn input_rate(&self) -> u32 {
        self.input_rate
    }

    /// Get the output sample rate.
    pub const fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Get the number of channels.
    pub const fn channels(&self) -> usize {
        self.channels
    }

    /// Current output/input ratio.
    pub const fn ratio(&self) -> f64 {
        self.ratio
    }

    pub const fn end_of_input(&self) -> bool {
        self.end_of_input
    }

    /// Adjust the conversion ratio, e.g. to track a drifting clock.
    pub fn set_ratio(&mut self, ratio: f64) -> Result<()> {
        self.resampler
            .set_resample_ratio(ratio, false)
            .map_err(|e| Error::Resample(format!("Rejected ratio {ratio}: {e}")))?;
        self.ratio = ratio;
        Ok(())
    }

    /// Interleaved output of the most recent `process` or `flush` call.
    pub fn last_output(&self) -> &[f32] {
        &self.output
    }

    /// Input frames buffered but not yet converted.
    pub fn pending_frames(&self) -> usize {
        self.input_buffer.first().map_or(0, Vec::len)
    }

    /// Upper bound on the output frames produced by feeding `input_frames`.
    pub fn max_output_frames(&self, input_frames: usize) -> usize {
        let chunks = (self.pending_frames() + input_frames) / CHUNK_SIZE;
        chunks * self.resampler.output_frames_max()
    }

    /// Convert interleaved samples, returning whatever output is ready.
    pub fn process(&mut self, input: &[f32]) -> Result<&[f32]> {
        self.output.clear();
        self.deinterleave(input);

        while self.pending_frames() >= CHUNK_SIZE {
            let resampled = {
                let chunk: Vec<&[f32]> = self
                    .input_buffer
                    .iter()
                    .map(|ch| &ch[..CHUNK_SIZE])
                    .collect();
                self.resampler
                    .process(&chunk, None)
                    .map_err(|e| Error::Resample(format!("Resample failed: {e}")))?
            };
            self.input_buffer
                .iter_mut()
                .for_each(|ch| drop(ch.drain(..CHUNK_SIZE)));
            self.interleave(&resampled, usize::MAX);
        }

        Ok(&self.output)
    }

    /// Push the remaining partial chunk through (end of stream).
    pub fn flush(&mut self) -> Result<&[f32]> {
        self.output.clear();
        let remaining = self.pending_frames();
        if remaining > 0 {
            let resampled = self
                .resampler
                .process_partial(Some(self.input_buffer.as_slice()), None)
                .map_err(|e| Error::Resample(format!("Resample failed: {e}")))?;

            // Only take the non-padded portion
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let output_frames = (remaining as f64 * self.ratio).ceil() as usize;
            self.interleave(&resampled, output_frames);
            self.input_buffer.iter_mut().for_each(Vec::clear);
        }
        self.end_of_input = true;
        Ok(&self.output)
    }

    /// Reset the resampler state, including the ratio.
    pub fn reset(&mut self) {
        self.resampler.reset();
        if self.ratio != self.initial_ratio {
            if let Err(e) = self.resampler.set_resample_ratio(self.initial_ratio, false) {
                warn!("Failed to restore resample ratio {}: {e}", self.initial_ratio);
            }
            self.ratio = self.initial_ratio;
        }
        self.end_of_input = false;
        self.input_buffer.iter_mut().for_each(Vec::clear);
        self.output.clear();
    }

    /// Deinterleave input samples into channel buffers.
    fn deinterleave(&mut self, input: &[f32]) {
        for frame in input.chunks_exact(self.channels) {
            for (buffer, sample) in self.input_buffer.iter_mut().zip(frame) {
                buffer.push(*sample);
            }
        }
    }

    /// Append at most `max_frames` frames of channel buffers to the output.
    fn interleave(&mut self, channels: &[Vec<f32>], max_frames: usize) {
        let frames = channels.first().map_or(0, Vec::len).min(max_frames);
        self.output.reserve(frames * self.channels);

        for frame in 0..frames {
            for ch in channels {
                self.output.push(ch[frame]);
            }
        }
    }
}

impl std::fmt::Debug for Resampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resampler")
            .field("input_rate", &self.input_rate)
            .field("output_rate", &self.output_rate)
            .field("channels", &self.channels)
            .field("ratio", &self.ratio)
            .finish_non_exhaustive()
    }
}
