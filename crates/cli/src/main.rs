//! CLI entry point for the video compressor
//!
//! `serve` runs the job manager behind the HTTP control API; `compress`,
//! `probe` and `plan` work on a single file.

use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use video_compressor::{
    build_plan, run_server, CompressionTarget, Config, FfprobeProber, JobManager, JobState,
    MediaProber, QualityLevel,
};

/// Video compressor - probe, plan and transcode videos to a quality or size target
#[derive(Parser, Debug)]
#[command(name = "video-compressor")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the job manager and HTTP control API
    Serve {
        /// Address for the control API
        #[arg(long, default_value = "127.0.0.1:7878")]
        addr: SocketAddr,
    },
    /// Compress one file and wait for it to finish
    Compress {
        input: PathBuf,

        /// Output path (defaults to <input>_compressed.<ext>)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        target: TargetArgs,
    },
    /// Print probed metadata as JSON
    Probe { input: PathBuf },
    /// Print the encode plan for a file as JSON without encoding
    Plan {
        input: PathBuf,

        #[command(flatten)]
        target: TargetArgs,
    },
}

#[derive(Args, Debug)]
#[group(multiple = false)]
struct TargetArgs {
    /// Target output size in bytes
    #[arg(long)]
    target_size: Option<u64>,

    /// Quality level: low, medium or high
    #[arg(long)]
    quality: Option<QualityLevel>,
}

impl TargetArgs {
    fn target(&self) -> CompressionTarget {
        match (self.target_size, self.quality) {
            (Some(bytes), _) => CompressionTarget::target_size(bytes),
            (None, Some(level)) => CompressionTarget::quality(level),
            (None, None) => CompressionTarget::quality(QualityLevel::Medium),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match Config::load_or_default(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load {}: {}", cli.config.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Serve { addr } => serve(&config, addr).await,
        Command::Compress {
            input,
            output,
            target,
        } => compress(&config, input, output, target.target()).await,
        Command::Probe { input } => probe(&config, &input).await,
        Command::Plan { input, target } => plan(&config, &input, target.target()).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("{}", message);
            ExitCode::FAILURE
        }
    }
}

async fn serve(config: &Config, addr: SocketAddr) -> Result<(), String> {
    let manager = Arc::new(
        JobManager::with_ffmpeg(config)
            .await
            .map_err(|e| e.to_string())?,
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
        }
        signal.cancel();
    });

    let served = run_server(manager.clone(), addr, shutdown).await;
    manager.shutdown().await.map_err(|e| e.to_string())?;
    served.map_err(|e| e.to_string())
}

async fn compress(
    config: &Config,
    input: PathBuf,
    output: Option<PathBuf>,
    target: CompressionTarget,
) -> Result<(), String> {
    let manager = JobManager::with_ffmpeg(config)
        .await
        .map_err(|e| e.to_string())?;
    let mut updates = manager.subscribe();

    let id = manager
        .submit_with_output(input, target, output)
        .await
        .map_err(|e| e.to_string())?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let mut last_percent = None;
    let job = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                warn!("Cancelling job {}", id);
                if let Err(e) = manager.cancel(id).await {
                    warn!("Failed to cancel job {}: {}", id, e);
                }
                break manager.wait(id).await.map_err(|e| e.to_string())?;
            }
            update = updates.recv() => match update {
                Ok(job) if job.id == id => {
                    let percent = (job.progress * 100.0).floor() as u32;
                    if job.state == JobState::Running && last_percent != Some(percent) {
                        info!("{}: {}%", job.state, percent);
                        last_percent = Some(percent);
                    }
                    if job.is_terminal() {
                        break job;
                    }
                }
                Ok(_) => {}
                Err(_) => break manager.wait(id).await.map_err(|e| e.to_string())?,
            },
        }
    };

    manager.shutdown().await.map_err(|e| e.to_string())?;

    match job.state {
        JobState::Completed => {
            let output = job
                .output_path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            info!("Wrote {}", output);
            Ok(())
        }
        JobState::Cancelled => Err(format!("Job {} was cancelled", id)),
        _ => Err(job
            .error
            .map(|e| format!("Job {} failed ({}): {}", id, e.kind, e.message))
            .unwrap_or_else(|| format!("Job {} failed", id))),
    }
}

async fn probe(config: &Config, input: &Path) -> Result<(), String> {
    let prober = FfprobeProber::new(config.engine.ffprobe_path.clone());
    let media = prober.probe(input).await.map_err(|e| e.to_string())?;
    let json = serde_json::to_string_pretty(&media).map_err(|e| e.to_string())?;
    println!("{}", json);
    Ok(())
}

async fn plan(config: &Config, input: &Path, target: CompressionTarget) -> Result<(), String> {
    let prober = FfprobeProber::new(config.engine.ffprobe_path.clone());
    let media = prober.probe(input).await.map_err(|e| e.to_string())?;
    let plan = build_plan(&media, target, &config.plan).map_err(|e| e.to_string())?;
    let json = serde_json::to_string_pretty(&plan).map_err(|e| e.to_string())?;
    println!("{}", json);
    Ok(())
}
