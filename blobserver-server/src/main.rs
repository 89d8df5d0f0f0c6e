//! blobserver launcher

use anyhow::Context;
use blobserver_core::config::ServerConfig;
use blobserver_core::{shm, Transport, SHM_PREFIX};
use blobserver_server::{ControlPlane, FlowEngine, OscPublisher};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "blobserver",
    about = "Detects blobs in video sources and sends them through OSC",
    version,
    disable_version_flag = true
)]
struct Cli {
    /// Show the version of this software
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// Configuration file to load at startup
    #[arg(short = 'C', long)]
    config: Option<PathBuf>,

    /// Hide the camera window (accepted for compatibility; this build
    /// has no preview window)
    #[arg(short = 'H', long)]
    hide: bool,

    /// Output detection values to the log
    #[arg(short = 'V', long)]
    verbose: bool,

    /// Greyscale mask applied to all detectors
    #[arg(short, long)]
    mask: Option<PathBuf>,

    /// Use TCP instead of UDP for message transmission
    #[arg(short, long)]
    tcp: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if cli.verbose {
        config.verbose = true;
    }
    if cli.tcp {
        config.transport = Transport::Tcp;
    }
    if let Some(mask) = &cli.mask {
        config.mask = Some(mask.clone());
    }

    tracing_subscriber::fmt()
        .with_max_level(if config.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_target(false)
        .init();

    if cli.hide {
        info!("--hide accepted; this build has no preview window");
    }

    info!("Cleaning up stale segments in {}", config.shm_dir.display());
    if let Err(e) = shm::remove_stale_segments(&config.shm_dir, SHM_PREFIX) {
        warn!("Segment cleanup failed: {}", e);
    }

    let publisher = Arc::new(OscPublisher::new(config.transport).context("send socket")?);
    let mut engine = FlowEngine::new(publisher.clone()).with_shm_dir(config.shm_dir.clone());
    if let Some(path) = &config.mask {
        let mask = image::open(path)
            .with_context(|| format!("mask {}", path.display()))?
            .to_luma8();
        engine = engine.with_mask(mask);
    }
    let engine = Arc::new(engine);

    let control = ControlPlane::bind(
        engine.clone(),
        publisher,
        config.transport,
        config.osc_port,
    )
    .context("control plane endpoint")?;
    info!("Listening on port {} ({})", config.osc_port, config.transport);

    engine.apply_startup_flows(&config.flows);

    let capture = engine.start_capture_thread()?;
    let control_thread = control.spawn()?;

    // `quit` on stdin shuts the engine down cleanly; EOF just stops
    // the reader so a detached server keeps running.
    let stdin_engine = engine.clone();
    std::thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            let mut line = String::new();
            loop {
                line.clear();
                match stdin.read_line(&mut line) {
                    Ok(0) | Err(_) => return,
                    Ok(_) if matches!(line.trim(), "quit" | "q") => {
                        stdin_engine.shutdown();
                        return;
                    }
                    Ok(_) => {}
                }
            }
        })?;

    engine.run_loop();

    capture.join().ok();
    control_thread.join().ok();
    info!("Shutdown complete");
    Ok(())
}
