//! camsim: command-line driver for a capture session on the simulated device.
//!
//! # Usage
//!
//! Stream 120 preview requests with a still capture every 10th:
//! ```bash
//! camsim run --requests 120 --jpeg-every 10
//! ```
//!
//! Inject a scaler failure on frame 5:
//! ```bash
//! camsim run --fail-stage scaler --fail-frame 5
//! ```
//!
//! Validate a configuration file:
//! ```bash
//! camsim check-config crates/cam-bin/config/camsim.toml
//! ```

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{bail, Context, Result};
use cam_core::{
    ControlMetadata, RejectReason, SessionConfig, StageId, StreamConfig, StreamId, StreamRole,
    StreamSet,
};
use cam_driver_mock::{ErrorConfig, ErrorScenario, MockAllocator, MockDevice, MockMode};
use cam_pipeline::{BufferStatus, ChannelSink, Notify, Request, Session, SessionEvent};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const PREVIEW: StreamId = StreamId(0);
const JPEG: StreamId = StreamId(1);

#[derive(Parser)]
#[command(name = "camsim")]
#[command(about = "Capture pipeline simulator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure a session, stream requests, flush and print counters
    Run {
        /// Session configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Requests to submit
        #[arg(long, default_value_t = 60)]
        requests: u64,

        /// Add the JPEG stream to every Nth request (0 disables)
        #[arg(long, default_value_t = 0)]
        jpeg_every: u64,

        /// Exposure for still captures, nanoseconds
        #[arg(long)]
        exposure_ns: Option<u64>,

        /// Stage to fail (sensor, isp, scaler, ...)
        #[arg(long)]
        fail_stage: Option<String>,

        /// Frame the failing stage fails on
        #[arg(long, default_value_t = 0, requires = "fail_stage")]
        fail_frame: u64,

        /// Device timing
        #[arg(long, value_enum, default_value_t = Timing::Realistic)]
        timing: Timing,

        /// Seed for chaos timing
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Load and validate a configuration, then print the effective values
    CheckConfig {
        /// Session configuration file (TOML)
        config: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Timing {
    Instant,
    Realistic,
    Chaos,
}

impl From<Timing> for MockMode {
    fn from(timing: Timing) -> Self {
        match timing {
            Timing::Instant => MockMode::Instant,
            Timing::Realistic => MockMode::Realistic,
            Timing::Chaos => MockMode::Chaos,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            config,
            requests,
            jpeg_every,
            exposure_ns,
            fail_stage,
            fail_frame,
            timing,
            seed,
        } => {
            let config = SessionConfig::load(config.as_deref())?;
            let mut device = MockDevice::builder().mode(timing.into());
            if let Some(seed) = seed {
                device = device.seed(seed);
            }
            if let Some(name) = fail_stage {
                let stage = parse_stage(&name)?;
                device = device.errors(ErrorConfig::scenario(ErrorScenario::FailOnFrame {
                    stage,
                    frame: fail_frame,
                }));
            }
            let plan = RunPlan {
                requests,
                jpeg_every,
                exposure_ns,
            };
            run(config, device.build(), plan).await
        }
        Commands::CheckConfig { config } => {
            let config = SessionConfig::load(config.as_deref())?;
            print!("{}", toml::to_string_pretty(&config)?);
            println!(
                "pacing threshold: {}, frame interval: {:?}",
                config.pacing_threshold(),
                config.frame_interval()
            );
            Ok(())
        }
    }
}

fn parse_stage(name: &str) -> Result<StageId> {
    match StageId::ALL.iter().find(|s| s.as_str() == name) {
        Some(stage) => Ok(*stage),
        None => {
            let known: Vec<&str> = StageId::ALL.iter().map(|s| s.as_str()).collect();
            bail!("unknown stage '{name}', expected one of: {}", known.join(", "))
        }
    }
}

struct RunPlan {
    requests: u64,
    jpeg_every: u64,
    exposure_ns: Option<u64>,
}

/// Counters gathered from the result sink.
#[derive(Debug, Default)]
struct Tally {
    shutters: u64,
    finals: u64,
    partials: u64,
    buffers_ok: u64,
    buffers_failed: u64,
    request_errors: u64,
}

fn spawn_tally(mut rx: UnboundedReceiver<SessionEvent>) -> JoinHandle<Tally> {
    tokio::spawn(async move {
        let mut tally = Tally::default();
        while let Some(event) = rx.recv().await {
            match event {
                SessionEvent::Notify(Notify::Shutter { .. }) => tally.shutters += 1,
                SessionEvent::Notify(Notify::Error { request, code, stream }) => {
                    if stream.is_none() {
                        tally.request_errors += 1;
                    }
                    warn!(%request, ?code, ?stream, "Error notification");
                }
                SessionEvent::Result(result) => {
                    if result.is_final() {
                        tally.finals += 1;
                    } else if result.is_partial() {
                        tally.partials += 1;
                    }
                    for buffer in &result.buffers {
                        match buffer.status {
                            BufferStatus::Ok => tally.buffers_ok += 1,
                            BufferStatus::Error => tally.buffers_failed += 1,
                        }
                    }
                }
            }
        }
        tally
    })
}

async fn run(config: SessionConfig, device: MockDevice, plan: RunPlan) -> Result<()> {
    let (width, height) = (config.sensor_width, config.sensor_height);
    let (sink, rx) = ChannelSink::new();
    let tally = spawn_tally(rx);

    let session = Session::new(
        config,
        Arc::new(device),
        Arc::new(MockAllocator::new()),
        Arc::new(sink),
    )?;
    let mut streams = vec![StreamConfig::new(
        PREVIEW.0,
        StreamRole::Preview,
        width,
        height,
        8,
    )];
    if plan.jpeg_every > 0 {
        streams.push(StreamConfig::new(JPEG.0, StreamRole::Jpeg, width, height, 4));
    }
    session
        .configure(StreamSet::new(streams)?)
        .await
        .context("configure failed")?;

    let mut accepted = 0_u64;
    let mut rejected = 0_u64;
    let submit = async {
        for key in 0..plan.requests {
            let mut request = Request::new(key).with_output(PREVIEW);
            if key == 0 {
                request = request.with_settings(ControlMetadata::new());
            }
            if plan.jpeg_every > 0 && key % plan.jpeg_every == plan.jpeg_every - 1 {
                let mut still = ControlMetadata::new();
                if let Some(exposure) = plan.exposure_ns {
                    still = still.with_exposure_ns(exposure);
                }
                request = request.with_output(JPEG).with_settings(still);
            }
            match session.submit_request(request).await {
                Ok(_) => accepted += 1,
                Err(e) => {
                    rejected += 1;
                    if e.reject_reason() == Some(RejectReason::Draining) {
                        break;
                    }
                    warn!(request = key, error = %e, "Request rejected");
                }
            }
        }
    };
    tokio::select! {
        () = submit => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted, flushing"),
    }

    session.flush().await.context("flush failed")?;
    let stats = session.stats().await?;
    session.close().await?;
    drop(session);

    let tally = tokio::time::timeout(Duration::from_secs(5), tally)
        .await
        .context("result sink still referenced after close")?
        .context("result task failed")?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    println!(
        "accepted {accepted}, rejected {rejected}, shutters {}, finals {}, partials {}, \
         buffers ok {}, buffers failed {}, request errors {}",
        tally.shutters,
        tally.finals,
        tally.partials,
        tally.buffers_ok,
        tally.buffers_failed,
        tally.request_errors
    );
    Ok(())
}
