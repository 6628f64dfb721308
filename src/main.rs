//! camcalib - lens undistortion stage for a camera pipeline
//!
//! Captures frames from a V4L2 camera, removes lens distortion using pinhole
//! intrinsics and radial/tangential coefficients from the configuration,
//! applies the optional colour and sharpness adjustments, and writes the
//! corrected video to a v4l2loopback device.

mod capture;
mod command;
mod config;
mod corrector;
mod demosaic;
mod enhance;
mod error;
mod knobs;
mod output;
mod params;
mod pipeline;
mod server;
mod undistort;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::Config;
use crate::corrector::{open_calib_tool, CorrectorOptions};
use crate::knobs::{Knobs, RuntimeKnobs};
use crate::pipeline::FramePipeline;
use crate::server::AppState;

/// camcalib - pinhole lens undistortion for V4L2 cameras
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Configuration group holding the calibration parameters
    #[arg(long)]
    group: Option<String>,

    /// Module name
    #[arg(long)]
    name: Option<String>,

    /// Input video device (e.g., /dev/video0)
    #[arg(short, long)]
    input: Option<String>,

    /// Output video device (v4l2loopback, e.g., /dev/video10)
    #[arg(short, long)]
    output: Option<String>,

    /// Control server host
    #[arg(long)]
    host: Option<String>,

    /// Control server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging and per-frame timing
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// CLI values take precedence over the file
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(group) = &self.group {
            config.module.group = Some(group.clone());
        }
        if let Some(name) = &self.name {
            config.module.name = name.clone();
        }
        if let Some(input) = &self.input {
            config.video.input_device = input.clone();
        }
        if let Some(output) = &self.output {
            config.video.output_device = Some(output.clone());
        }
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if self.verbose {
            config.module.verbose = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("camcalib v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(&args.config)?;
    args.apply_overrides(&mut config);

    info!("Module: {}", config.module.name);
    info!(
        "Resolution: {}x{} @ {}fps",
        config.video.width, config.video.height, config.video.fps
    );

    let initial = Knobs::from(&config.processing);
    initial.validate().map_err(|e| {
        error!("{}", e);
        e
    })?;
    let knobs = Arc::new(RuntimeKnobs::new(initial));

    let group = config.calibration_group().map_err(|e| {
        error!("{}", e);
        e
    })?;
    let options = CorrectorOptions {
        bayer_pattern: config.processing.bayer_pattern,
        demosaic: config.processing.demosaic,
    };
    let tool = open_calib_tool(group, knobs.clone(), options)?;

    let pipeline = FramePipeline::new(tool, config.module.verbose);
    let state = Arc::new(AppState::new(
        config.module.name.clone(),
        knobs,
        pipeline.projection(),
    ));

    let video = config.video.clone();
    let pipeline_state = state.clone();
    let pipeline_handle = tokio::task::spawn_blocking(move || {
        capture::run_capture(&video, options.bayer_pattern, pipeline, pipeline_state)
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting control server at http://{}", addr);

    let server_state = state.clone();
    let server_handle = tokio::spawn(async move { server::run_server(&addr, server_state).await });

    let quit_state = state.clone();
    let quit_monitor = tokio::spawn(async move {
        while !quit_state.quit_requested() {
            tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
        }
    });

    tokio::select! {
        result = pipeline_handle => {
            match result {
                Ok(Ok(())) => info!("Capture exited normally"),
                Ok(Err(e)) => error!("Capture error: {:#}", e),
                Err(e) => error!("Capture task panicked: {}", e),
            }
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!("Server error: {:#}", e),
                Err(e) => error!("Server task panicked: {}", e),
            }
        }
        _ = quit_monitor => {
            info!("Quit requested, shutting down");
        }
    }

    Ok(())
}
