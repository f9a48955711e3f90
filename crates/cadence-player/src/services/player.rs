//! Player service connecting the command line to the audio pipeline.

use crate::config::PlayerConfig;
use anyhow::{Context, Result};
use cadence_audio::{
    CoordinatorEvent, CoordinatorHandle, Decoder, DecoderFactory, EngineConfig, OutputEngine,
    PlaybackCoordinator, PlayerState, SymphoniaDecoder,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How often progress is logged while playing.
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

/// Give up when nothing has started playing by then.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns the output engine and the coordinator worker.
pub struct PlayerService {
    engine: Arc<OutputEngine>,
    coordinator: CoordinatorHandle,
}

impl PlayerService {
    /// Open the configured output and start both worker threads.
    pub fn new(config: &PlayerConfig) -> Result<Self> {
        let engine = OutputEngine::new(
            config.sink.create(),
            EngineConfig {
                device: config.device.clone(),
                format: config.output_format(),
            },
        );
        let format = engine.open().context("Failed to open audio output")?;
        info!("Audio output ready: {format}");
        engine.start().context("Failed to start output thread")?;

        let open_decoder: DecoderFactory = Box::new(|path: &Path| {
            SymphoniaDecoder::open(path).map(|decoder| Box::new(decoder) as Box<dyn Decoder>)
        });
        let coordinator =
            PlaybackCoordinator::new(Arc::clone(&engine), config.coordinator(), open_decoder);
        let coordinator = CoordinatorHandle::spawn(coordinator, config.tick_interval())
            .context("Failed to start coordinator")?;

        Ok(Self {
            engine,
            coordinator,
        })
    }

    /// Play `files` in order.
    pub fn play_files(&self, files: &[PathBuf], start_paused: bool) -> Result<()> {
        let Some((first, rest)) = files.split_first() else {
            return Ok(());
        };
        self.coordinator.open_file(first)?;
        for file in rest {
            self.coordinator.queue_next_file(file)?;
        }
        if start_paused {
            self.coordinator.pause()?;
        }
        Ok(())
    }

    /// Block until playback stops, logging events and progress.
    pub fn run_until_stopped(&self) {
        let mut started = false;
        let begun = Instant::now();
        let mut last_status = begun;

        loop {
            while let Some(event) = self.coordinator.recv_event_timeout(Duration::from_millis(250)) {
                match event {
                    CoordinatorEvent::StateChanged(state) => {
                        debug!("Playback state changed: {state:?}");
                        match state {
                            PlayerState::Playing | PlayerState::Paused => started = true,
                            PlayerState::Stopped if started => {
                                info!("Playback finished");
                                return;
                            }
                            PlayerState::Stopped => {}
                        }
                    }
                    CoordinatorEvent::TrackStarted { path, .. } => {
                        info!("Now playing: {}", display_name(&path));
                    }
                    CoordinatorEvent::TrackFinished { path, .. } => {
                        debug!("Finished: {}", display_name(&path));
                    }
                    CoordinatorEvent::QueueExhausted => debug!("Queue exhausted"),
                    CoordinatorEvent::Error(message) => error!("{message}"),
                }
            }

            if last_status.elapsed() >= STATUS_INTERVAL {
                last_status = Instant::now();
                let status = self.coordinator.status();
                info!(
                    "{} / {} (cache {:.0}%)",
                    format_time(status.time_ms),
                    format_time(status.total_time_ms),
                    status.cache_level * 100.0
                );
            }

            if !started && begun.elapsed() > STARTUP_TIMEOUT {
                warn!("Nothing started playing");
                return;
            }
        }
    }

    pub fn set_volume(&self, volume: f32) -> Result<()> {
        self.coordinator.set_volume(volume).map_err(Into::into)
    }

    /// Stop playback and release the device.
    pub fn shutdown(mut self) {
        if let Err(e) = self.coordinator.close_all_streams(false) {
            warn!("{e}");
        }
        self.coordinator.shutdown();
        self.engine.close();
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |name| name.to_string_lossy().into_owned())
}

/// Format milliseconds as `m:ss`.
fn format_time(ms: u64) -> String {
    let secs = ms / 1000;
    format!("{}:{:02}", secs / 60, secs % 60)
}
