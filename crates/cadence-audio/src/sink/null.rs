//! Sink without hardware.
//!
//! The simulated driver buffer either plays out in real time or only when
//! [`NullSink::advance`] is called, which makes pipeline tests deterministic.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use super::{apply_period, frames_for, AudioSink, BUFFER_DURATION, PASSTHROUGH_FORMATS};
use cadence_core::{AudioFormat, DeviceInfo, Error, Layout, Result, StdLayout};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy)]
enum Clock {
    Manual,
    Realtime(Instant),
}

#[derive(Debug)]
struct NullState {
    format: Option<AudioFormat>,
    clock: Clock,
    /// Bytes queued in the simulated driver buffer.
    queued: usize,
    capacity: usize,
    corked: bool,
    volume: f32,
    frames_played: u64,
    capture: Option<Vec<u8>>,
}

impl NullState {
    /// Play out whatever the wall clock says has elapsed.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn tick(&mut self) {
        let Clock::Realtime(last) = self.clock else {
            return;
        };
        let now = Instant::now();
        self.clock = Clock::Realtime(now);
        if self.corked {
            return;
        }
        if let Some(format) = &self.format {
            let frames = (now.duration_since(last).as_secs_f64() * f64::from(format.sample_rate))
                as usize;
            self.consume(frames);
        }
    }

    fn consume(&mut self, frames: usize) -> usize {
        let Some(frame_size) = self.format.as_ref().map(|f| f.frame_size) else {
            return 0;
        };
        let bytes = (frames * frame_size).min(self.queued);
        self.queued -= bytes;
        self.frames_played += (bytes / frame_size) as u64;
        bytes / frame_size
    }

    #[allow(clippy::cast_precision_loss)]
    fn seconds(&self, bytes: usize) -> f64 {
        self.format
            .as_ref()
            .filter(|f| f.bytes_per_second() > 0)
            .map_or(0.0, |f| bytes as f64 / f.bytes_per_second() as f64)
    }
}

/// Sink that discards audio at the pace of a virtual device.
///
/// Clones share the same device, so a test can keep a handle for
/// [`NullSink::advance`] after handing the sink to the engine.
#[derive(Debug, Clone)]
pub struct NullSink {
    state: Arc<Mutex<NullState>>,
}

impl NullSink {
    fn with_clock(clock: Clock) -> Self {
        Self {
            state: Arc::new(Mutex::new(NullState {
                format: None,
                clock,
                queued: 0,
                capacity: 0,
                corked: false,
                volume: 1.0,
                frames_played: 0,
                capture: None,
            })),
        }
    }

    /// Sink whose buffer only drains on [`NullSink::advance`].
    pub fn manual() -> Self {
        Self::with_clock(Clock::Manual)
    }

    /// Sink that plays out at the negotiated sample rate.
    pub fn realtime() -> Self {
        Self::with_clock(Clock::Realtime(Instant::now()))
    }

    /// Keep a copy of every byte accepted from now on.
    pub fn capture(&self) {
        self.state.lock().capture = Some(Vec::new());
    }

    /// Take the bytes captured so far.
    pub fn take_captured(&self) -> Vec<u8> {
        self.state
            .lock()
            .capture
            .as_mut()
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Play `frames` frames from the buffer. Returns the frames played.
    ///
    /// Corking stops the manual clock too.
    pub fn advance(&self, frames: usize) -> usize {
        let mut state = self.state.lock();
        if state.corked {
            return 0;
        }
        state.consume(frames)
    }

    /// Frames played since initialization.
    pub fn frames_played(&self) -> u64 {
        self.state.lock().frames_played
    }

    /// Bytes waiting in the driver buffer.
    pub fn queued_bytes(&self) -> usize {
        self.state.lock().queued
    }

    pub fn is_corked(&self) -> bool {
        self.state.lock().corked
    }

    pub fn volume(&self) -> f32 {
        self.state.lock().volume
    }

    pub fn format(&self) -> Option<AudioFormat> {
        self.state.lock().format.clone()
    }
}

impl AudioSink for NullSink {
    fn name(&self) -> &'static str {
        "null"
    }

    fn initialize(&mut self, format: &mut AudioFormat, device: &str) -> Result<()> {
        if format.is_raw() {
            if format.encoded_rate > 0 {
                format.sample_rate = format.encoded_rate;
            }
            format.channel_count = 2;
            format.channel_layout = Layout::standard(StdLayout::Stereo);
        } else {
            if format.channel_layout.is_empty() {
                format.channel_layout = Layout::guess(format.channel_count)
                    .ok_or(Error::UnsupportedLayout(format.channel_count))?;
            }
            format.channel_count = format.channel_layout.len();
        }
        if format.sample_rate == 0 || format.channel_count == 0 {
            return Err(Error::Negotiation(format!("Cannot open {format}")));
        }
        format.frame_size = format.pcm_frame_size();
        apply_period(format);

        let mut state = self.state.lock();
        state.capacity = frames_for(BUFFER_DURATION, format.sample_rate) * format.frame_size;
        state.queued = 0;
        state.frames_played = 0;
        state.corked = false;
        state.format = Some(format.clone());
        if let Clock::Realtime(_) = state.clock {
            state.clock = Clock::Realtime(Instant::now());
        }

        debug!("Null sink opened on '{device}': {format}");
        Ok(())
    }

    fn deinitialize(&mut self) {
        self.drain();
        let mut state = self.state.lock();
        state.format = None;
        state.queued = 0;
    }

    fn is_initialized(&self) -> bool {
        self.state.lock().format.is_some()
    }

    fn add_packets(&mut self, data: &[u8], frames: usize) -> usize {
        let mut state = self.state.lock();
        state.tick();
        let Some(frame_size) = state.format.as_ref().map(|f| f.frame_size) else {
            return frames;
        };

        let writable = state.capacity - state.queued;
        let bytes = writable.min(frames * frame_size).min(data.len());
        let bytes = bytes - bytes % frame_size;
        state.queued += bytes;
        if let Some(capture) = state.capture.as_mut() {
            capture.extend_from_slice(&data[..bytes]);
        }
        bytes / frame_size
    }

    fn delay(&mut self) -> f64 {
        let mut state = self.state.lock();
        state.tick();
        state.seconds(state.queued)
    }

    fn cache_total(&self) -> f64 {
        let state = self.state.lock();
        state.seconds(state.capacity)
    }

    fn drain(&mut self) {
        let wait = {
            let mut state = self.state.lock();
            match state.clock {
                Clock::Manual => {
                    let queued = state.queued;
                    let frame_size = state.format.as_ref().map_or(1, |f| f.frame_size.max(1));
                    state.consume(queued / frame_size);
                    return;
                }
                Clock::Realtime(_) => {
                    state.tick();
                    state.seconds(state.queued)
                }
            }
        };
        std::thread::sleep(Duration::from_secs_f64(wait));
        let mut state = self.state.lock();
        state.tick();
        state.queued = 0;
    }

    fn cork(&mut self, cork: bool) -> bool {
        let mut state = self.state.lock();
        state.tick();
        state.corked = cork;
        cork
    }

    fn set_volume(&mut self, volume: f32) {
        self.state.lock().volume = volume.clamp(0.0, 1.0);
    }

    fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>> {
        let mut stereo = DeviceInfo::pcm("null", "Null output", Layout::standard(StdLayout::Stereo));
        stereo.add_passthrough(&PASSTHROUGH_FORMATS);
        let surround = DeviceInfo::pcm(
            "null-surround",
            "Null output (7.1)",
            Layout::standard(StdLayout::Surround71),
        );
        Ok(vec![stereo, surround])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::{DataFormat, DeviceType};

    fn opened() -> (NullSink, AudioFormat) {
        let mut sink = NullSink::manual();
        let mut format = AudioFormat::new(DataFormat::S16Le, 48000, 2);
        sink.initialize(&mut format, "null").unwrap();
        (sink, format)
    }

    #[test]
    fn test_uninitialized_accepts_everything() {
        let mut sink = NullSink::manual();
        assert!(!sink.is_initialized());
        assert_eq!(sink.add_packets(&[0u8; 64], 16), 16);
    }

    #[test]
    fn test_initialize_writes_back_sizing() {
        let (sink, format) = opened();
        assert_eq!(format.frame_size, 4);
        assert_eq!(format.frames, 2400);
        assert_eq!(format.channel_layout.len(), 2);
        assert!((sink.cache_total() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_add_packets_bounded_by_writable() {
        let (mut sink, format) = opened();
        let capacity_frames = 9600;
        let data = vec![0u8; (capacity_frames + 500) * format.frame_size];

        assert_eq!(sink.add_packets(&data, capacity_frames - 100), capacity_frames - 100);
        // Only 100 frames of room are left.
        assert_eq!(sink.add_packets(&data, 500), 100);
        assert_eq!(sink.add_packets(&data, 500), 0);

        assert_eq!(sink.advance(250), 250);
        assert_eq!(sink.add_packets(&data, 500), 250);
    }

    #[test]
    fn test_delay_tracks_queue() {
        let (mut sink, format) = opened();
        sink.add_packets(&vec![0u8; 4800 * format.frame_size], 4800);
        assert!((sink.delay() - 0.1).abs() < 1e-9);
        sink.advance(2400);
        assert!((sink.delay() - 0.05).abs() < 1e-9);
        assert_eq!(sink.frames_played(), 2400);
    }

    #[test]
    fn test_cork_stops_clock() {
        let (mut sink, format) = opened();
        sink.add_packets(&vec![0u8; 100 * format.frame_size], 100);
        assert!(sink.cork(true));
        assert_eq!(sink.advance(50), 0);
        assert!(!sink.cork(false));
        assert_eq!(sink.advance(50), 50);
    }

    #[test]
    fn test_drain_empties_buffer() {
        let (mut sink, format) = opened();
        sink.add_packets(&vec![0u8; 100 * format.frame_size], 100);
        sink.drain();
        assert_eq!(sink.queued_bytes(), 0);
        sink.deinitialize();
        assert!(!sink.is_initialized());
    }

    #[test]
    fn test_raw_negotiates_stereo_carrier() {
        let mut sink = NullSink::manual();
        let mut format = AudioFormat::new(DataFormat::Ac3, 48000, 6);
        format.encoded_rate = 192_000;
        sink.initialize(&mut format, "null").unwrap();
        assert_eq!(format.sample_rate, 192_000);
        assert_eq!(format.channel_count, 2);
        assert_eq!(format.frame_size, 4);
    }

    #[test]
    fn test_capture() {
        let (mut sink, _) = opened();
        sink.capture();
        sink.add_packets(&[1, 2, 3, 4, 5, 6], 1);
        assert_eq!(sink.take_captured(), vec![1, 2, 3, 4]);
        assert!(sink.take_captured().is_empty());
    }

    #[test]
    fn test_enumerate() {
        let devices = NullSink::manual().enumerate_devices().unwrap();
        assert_eq!(devices[0].device_type, DeviceType::Iec958);
        assert_eq!(devices[1].device_type, DeviceType::Pcm);
    }
}
