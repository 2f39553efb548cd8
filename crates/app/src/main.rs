use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use hue_tempo_core::{
    bridge, list_input_devices, AppConfig, BeatSession, DriverStats, DryRunLights, HueLight,
    HueTempoError, MicrophoneTempoSource, ScriptedTempoSource, SessionSettings, Shutdown,
    SystemClock,
};
use tracing_subscriber::EnvFilter;

fn main() -> hue_tempo_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;

    match cli.command {
        Commands::Run { light, device } => run_live(config, light, device),
        Commands::Pair => run_pair(&config),
        Commands::Devices => run_devices(),
        Commands::Simulate {
            bpm,
            every_ms,
            seconds,
        } => run_simulation(&config, bpm, every_ms, seconds),
    }
}

fn run_live(
    mut config: AppConfig,
    light: Option<String>,
    device: Option<usize>,
) -> hue_tempo_core::Result<()> {
    if let Some(light) = light {
        config.pulse.light_id = light;
    }
    if device.is_some() {
        config.audio.device = device;
    }
    tracing::info!(light = %config.pulse.light_id, device = ?config.audio.device, "starting live mode");

    let (bridge, credentials) = bridge::connect(&config.bridge)?;
    let light = HueLight::new(bridge, credentials, config.pulse.light_id.clone());
    let info = light.verify()?;
    tracing::info!(light = %info.id, name = %info.name, "driving light");

    let session = BeatSession::start(
        SessionSettings::from_config(&config),
        MicrophoneTempoSource::from_config(&config.audio),
        light,
        Arc::new(SystemClock),
    )?;
    stop_on_ctrl_c(session.shutdown())?;

    report(session.wait());
    Ok(())
}

fn run_pair(config: &AppConfig) -> hue_tempo_core::Result<()> {
    let (bridge, credentials) = bridge::connect(&config.bridge)?;
    tracing::info!(address = %credentials.address, "bridge ready");

    for light in bridge.lights(&credentials)?.values() {
        tracing::info!(
            id = %light.id,
            name = %light.name,
            on = light.on,
            reachable = light.reachable,
            "light"
        );
    }
    Ok(())
}

fn run_devices() -> hue_tempo_core::Result<()> {
    let devices = list_input_devices()?;
    if devices.is_empty() {
        tracing::warn!("no audio input devices found");
    }
    for device in devices {
        tracing::info!(
            index = device.index,
            name = %device.name,
            sample_rate = ?device.sample_rate,
            channels = ?device.channels,
            "input device"
        );
    }
    Ok(())
}

fn run_simulation(
    config: &AppConfig,
    bpm: Vec<f32>,
    every_ms: u64,
    seconds: Option<u64>,
) -> hue_tempo_core::Result<()> {
    tracing::info!(?bpm, every_ms, "starting simulation");

    let session = BeatSession::start(
        SessionSettings::from_config(config),
        ScriptedTempoSource::new(bpm, Duration::from_millis(every_ms)),
        DryRunLights::new(config.pulse.light_id.clone()),
        Arc::new(SystemClock),
    )?;
    let shutdown = session.shutdown();
    stop_on_ctrl_c(shutdown.clone())?;

    if let Some(seconds) = seconds {
        shutdown.wait_timeout(Duration::from_secs(seconds));
        shutdown.trigger();
    }

    report(session.wait());
    Ok(())
}

fn stop_on_ctrl_c(shutdown: Shutdown) -> hue_tempo_core::Result<()> {
    ctrlc::set_handler(move || shutdown.trigger())
        .map_err(|err| HueTempoError::msg(format!("cannot install Ctrl-C handler: {err}")))
}

fn report(stats: DriverStats) {
    tracing::info!(beats = stats.beats, failures = stats.failures, "session finished");
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Pulse a Hue light to the tempo of the room", long_about = None)]
struct Cli {
    /// Optional TOML configuration file.
    #[arg(short, long, global = true, default_value = "hue_tempo.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Listen to the microphone and drive the light.
    Run {
        /// Bridge id of the light to pulse.
        #[arg(short, long)]
        light: Option<String>,
        /// Index of the audio input device (see `devices`).
        #[arg(short, long)]
        device: Option<usize>,
    },
    /// Find the bridge, pair with it and list its lights.
    Pair,
    /// List audio input devices.
    Devices,
    /// Replay a fixed tempo sequence against a logging light.
    Simulate {
        /// Tempo estimates to replay, in order.
        #[arg(long, required = true, num_args = 1..)]
        bpm: Vec<f32>,
        /// Delay between estimates.
        #[arg(long, default_value_t = 5000)]
        every_ms: u64,
        /// Stop after this many seconds instead of waiting for Ctrl-C.
        #[arg(long)]
        seconds: Option<u64>,
    },
}
