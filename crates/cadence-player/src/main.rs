//! # Cadence
//!
//! Command-line audio player with gapless playback and crossfades.

mod config;
mod services;

use anyhow::{Context, Result};
use cadence_audio::SinkKind;
use clap::Parser;
use config::PlayerConfig;
use services::player::PlayerService;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for cadence
#[derive(Parser, Debug)]
#[command(name = "cadence")]
#[command(about = "Play audio files back to back, with optional crossfades")]
#[command(version)]
struct Args {
    /// Files to play, in order
    files: Vec<PathBuf>,

    /// Config file (defaults to config.toml in the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// List output devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,

    /// Output backend: cpal or null
    #[arg(long)]
    sink: Option<SinkKind>,

    /// Output device name
    #[arg(short, long)]
    device: Option<String>,

    /// Crossfade between files, in milliseconds
    #[arg(short = 'x', long)]
    crossfade: Option<u64>,

    /// Device sample rate in Hz
    #[arg(long)]
    sample_rate: Option<u32>,

    /// Volume from 0.0 to 1.0
    #[arg(long)]
    volume: Option<f32>,

    /// Start paused
    #[arg(long)]
    paused: bool,
}

impl Args {
    fn apply(&self, config: &mut PlayerConfig) {
        if let Some(sink) = self.sink {
            config.sink = sink;
        }
        if let Some(device) = &self.device {
            config.device.clone_from(device);
        }
        if let Some(crossfade) = self.crossfade {
            config.crossfade_ms = crossfade;
        }
        if let Some(rate) = self.sample_rate {
            config.sample_rate = rate;
        }
        if self.paused {
            config.start_paused = true;
        }
    }
}

fn list_devices(config: &PlayerConfig) -> Result<()> {
    let sink = config.sink.create();
    let devices = sink
        .enumerate_devices()
        .context("Failed to enumerate devices")?;
    for device in devices {
        let formats: Vec<_> = device.data_formats.iter().map(|f| f.name()).collect();
        println!("{} ({})", device.device_name, device.display_name);
        println!("  type:     {:?}", device.device_type);
        println!("  channels: {}", device.channels);
        println!("  rates:    {:?}", device.sample_rates);
        println!("  formats:  {}", formats.join(", "));
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence=info,cadence_audio=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = PlayerConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }
    if args.list_devices {
        return list_devices(&config);
    }
    if args.files.is_empty() {
        anyhow::bail!("No files given");
    }

    info!("Starting Cadence v{}", env!("CARGO_PKG_VERSION"));

    let player = PlayerService::new(&config)?;
    if let Some(volume) = args.volume {
        player.set_volume(volume)?;
    }
    player.play_files(&args.files, config.start_paused)?;
    player.run_until_stopped();
    player.shutdown();
    Ok(())
}
