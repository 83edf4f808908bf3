//! Albor TDD Station Main Application
//!
//! Runs a base station MAC engine frame by frame against simulated
//! subscriber stations and prints a telemetry summary at the end.

mod config;
mod simulation;

use anyhow::Result;
use clap::Parser;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use config::StationConfig;
use interfaces::telemetry::SeriesSummary;
use interfaces::{ChannelPhy, ChannelSink, TelemetryRecorder, TelemetrySink};
use simulation::{run_phy, PhyStats, Simulation};

/// Albor TDD/OFDMA station simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML, or TOML with a .toml extension)
    #[arg(short, long, default_value = "station.yml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Frames to run, 0 runs until Ctrl-C
    #[arg(long)]
    frames: Option<u64>,

    /// Random seed of the simulation
    #[arg(long)]
    seed: Option<u64>,

    /// Number of simulated subscriber stations
    #[arg(long)]
    subscribers: Option<u32>,

    /// Tick frames at the configured frame duration
    #[arg(long)]
    realtime: bool,
}

/// Printed at the end of a run
#[derive(Debug, Serialize)]
struct RunSummary {
    frames: u64,
    phy: PhyStats,
    burst_loss_ratio: f64,
    telemetry: BTreeMap<String, SeriesSummary>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = if Path::new(&args.config).exists() {
        StationConfig::from_file(&args.config)?
    } else {
        StationConfig::default()
    };
    if let Some(frames) = args.frames {
        config.simulation.frames = frames;
    }
    if let Some(seed) = args.seed {
        config.simulation.seed = seed;
    }
    if let Some(subscribers) = args.subscribers {
        config.simulation.subscribers = subscribers;
    }
    config.simulation.realtime |= args.realtime;
    let log_level = args.log_level.clone().unwrap_or_else(|| config.log.level.clone());

    // Initialize logging
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&log_level));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting Albor TDD station");
    if Path::new(&args.config).exists() {
        info!("Configuration file: {}", args.config);
    } else {
        warn!("Configuration file {} not found, using defaults", args.config);
    }
    config.validate()?;

    let mac_config = config.mac_config();
    let frame_duration = mac_config.frame.frame_duration;
    info!("Station configuration:");
    info!("  Station: {}", mac_config.station);
    info!("  Frame: {:?}, symbol {:?}", frame_duration, mac_config.frame.symbol_duration);
    info!("  Sub-channels: {} x {} data sub-carriers", mac_config.frame.sub_channels, mac_config.frame.data_subcarriers);
    info!("  Sub-strategy: {:?}, beamforming: {}", mac_config.sub_strategy, mac_config.grouping.beamforming);
    info!("  Subscribers: {}, seed {}", config.simulation.subscribers, config.simulation.seed);

    let (phy, phy_rx) = ChannelPhy::channel();
    let (sink, mut telemetry_rx) = ChannelSink::channel();

    let mut simulation = Simulation::new(mac_config, config.simulation.clone(), Box::new(phy), Box::new(sink))?;
    simulation.start().await?;
    info!("MAC layer initialized");

    let phy_handle = tokio::spawn(run_phy(phy_rx, simulation.links(), config.simulation.seed));

    // Collect telemetry in the background
    let stats_handle = tokio::spawn(async move {
        let mut recorder = TelemetryRecorder::new();
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                sample = telemetry_rx.recv() => match sample {
                    Some(sample) => recorder.emit(sample),
                    None => break,
                },
                _ = interval.tick() => {
                    info!("Telemetry: {} samples recorded", recorder.samples().len());
                }
            }
        }
        recorder
    });

    let frames = config.simulation.frames;
    let realtime = config.simulation.realtime;
    let mut completed = 0;
    let run = async {
        let mut ticker = tokio::time::interval(frame_duration);
        let mut frame = 0;
        while frames == 0 || frame < frames {
            if realtime {
                ticker.tick().await;
            }
            let report = simulation.step(frame).await?;
            if !report.released.is_empty() {
                warn!("Frame {}: dead stations released {:?}", frame, report.released);
            }
            frame += 1;
            completed = frame;
            // Let the PHY and telemetry tasks keep up
            tokio::task::yield_now().await;
        }
        anyhow::Ok(())
    };

    // Wait for the run to finish or a shutdown signal
    tokio::select! {
        result = run => {
            if let Err(e) = result {
                error!("Simulation stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    // Shutdown
    info!("Shutting down station after {} frames", completed);
    simulation.shutdown().await?;
    drop(simulation);

    let phy_stats = match phy_handle.await? {
        Ok(stats) => stats,
        Err(e) => {
            error!("PHY task failed: {}", e);
            PhyStats::default()
        }
    };
    let recorder = tokio::time::timeout(Duration::from_secs(5), stats_handle).await??;

    let summary = RunSummary {
        frames: completed,
        burst_loss_ratio: phy_stats.burst_loss_ratio(),
        phy: phy_stats,
        telemetry: recorder.summary(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    info!("Station shutdown complete");
    Ok(())
}
