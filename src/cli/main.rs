//! Background removal service CLI
//!
//! Drives the request dispatcher locally: one-off image requests, video jobs
//! with live progress polled from the job table, and environment diagnostics.

use super::config::CliConfigBuilder;
use crate::backends::video::FfmpegCodec;
use crate::config::ServiceConfig;
use crate::dispatcher::RequestDispatcher;
use crate::jobs::{JobId, JobState};
use crate::tracing_config::{init_cli_tracing, spans};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Poll interval of the video progress bar
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Background removal service front end
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "bgremove-service")]
pub struct Cli {
    /// Enable verbose logging (-v: DEBUG, -vv: TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Directory containing `<method>.onnx` model files
    #[arg(long, value_name = "DIR", global = true)]
    pub models_dir: Option<PathBuf>,

    /// Scratch directory for uploads and frames
    #[arg(long, value_name = "DIR", global = true)]
    pub scratch_dir: Option<PathBuf>,

    /// Directory for finished video artifacts
    #[arg(long, value_name = "DIR", global = true)]
    pub output_dir: Option<PathBuf>,

    /// Client identity used for admission
    #[arg(long, default_value = "local", global = true)]
    pub client: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Remove the background of an image and write a PNG
    Image {
        /// Input image
        input: PathBuf,
        /// Output PNG [default: <input>_nobg.png]
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Segmentation method
        #[arg(short, long, default_value = "passthrough")]
        method: String,
    },
    /// Remove the background of a video and write a transparent WebM
    Video {
        /// Input video (mp4, mov, avi, mkv, webm)
        input: PathBuf,
        /// Output file [default: <input>_nobg.webm]
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Segmentation method
        #[arg(short, long, default_value = "passthrough")]
        method: String,
        /// Frames transformed per batch
        #[arg(long)]
        batch_size: Option<usize>,
        /// Output frame rate
        #[arg(long)]
        framerate: Option<u32>,
    },
    /// List the methods this build can serve
    Methods {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check service environment variables and external tools
    CheckEnv,
}

pub async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _tracing = init_cli_tracing(cli.verbose, cli.json_logs).context("Failed to initialize tracing")?;

    match &cli.command {
        Command::CheckEnv => check_env().await,
        Command::Methods { json } => {
            let dispatcher = build_dispatcher(&cli)?;
            print_methods(&dispatcher, *json)
        },
        Command::Image {
            input,
            output,
            method,
        } => {
            let dispatcher = build_dispatcher(&cli)?;
            let output = output.clone().unwrap_or_else(|| default_output(input, "png"));
            process_image(&dispatcher, &cli.client, method, input, &output)
                .instrument(spans::session("image", method))
                .await
        },
        Command::Video {
            input,
            output,
            method,
            ..
        } => {
            let dispatcher = build_dispatcher(&cli)?;
            let output = output.clone().unwrap_or_else(|| default_output(input, "webm"));
            let result = process_video(&dispatcher, &cli.client, method, input, &output)
                .instrument(spans::session("video", method))
                .await;
            dispatcher.shutdown().await;
            result
        },
    }
}

fn build_dispatcher(cli: &Cli) -> Result<RequestDispatcher> {
    let config = CliConfigBuilder::from_cli(cli).context("Failed to build configuration")?;
    let registry = CliConfigBuilder::registry(cli.models_dir.as_deref());
    debug!(methods = ?registry.methods(), "Segmenters registered");

    let codec = Arc::new(FfmpegCodec::new(config.video.tool_timeout));
    RequestDispatcher::new(config, registry, codec).context("Failed to start dispatcher")
}

fn default_output(input: &Path, extension: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map_or_else(|| "output".to_string(), |s| s.to_string_lossy().into_owned());
    input.with_file_name(format!("{stem}_nobg.{extension}"))
}

async fn process_image(
    dispatcher: &RequestDispatcher,
    client: &str,
    method: &str,
    input: &Path,
    output: &Path,
) -> Result<()> {
    let bytes = tokio::fs::read(input)
        .await
        .with_context(|| format!("Failed to read {}", input.display()))?;

    let cancel = CancellationToken::new();
    let response = dispatcher
        .remove_background(client, method, bytes, &cancel)
        .await
        .with_context(|| format!("Failed to process {}", input.display()))?;

    tokio::fs::write(output, &response.png)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;

    info!(
        output = %output.display(),
        width = response.width,
        height = response.height,
        elapsed_ms = response.elapsed.as_millis() as u64,
        "Image written"
    );
    println!("{}", output.display());
    Ok(())
}

async fn process_video(
    dispatcher: &RequestDispatcher,
    client: &str,
    method: &str,
    input: &Path,
    output: &Path,
) -> Result<()> {
    let bytes = tokio::fs::read(input)
        .await
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let file_name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let job = dispatcher
        .submit_video(client, method, &file_name, bytes)
        .await
        .with_context(|| format!("Failed to submit {}", input.display()))?;
    info!(job_id = %job, "Video job submitted");

    let state = poll_until_done(dispatcher, job)
        .instrument(spans::video_job(&job.to_string(), input))
        .await?;

    match state {
        JobState::Completed { output: artifact } => {
            tokio::fs::copy(&artifact, output)
                .await
                .with_context(|| format!("Failed to copy artifact to {}", output.display()))?;
            println!("{}", output.display());
            Ok(())
        },
        JobState::Failed { reason } => anyhow::bail!("Video job {job} failed: {reason}"),
        other => anyhow::bail!("Video job {job} stopped in state {}", other.label()),
    }
}

/// Show job progress until it finishes; Ctrl-C cancels the job
async fn poll_until_done(dispatcher: &RequestDispatcher, job: JobId) -> Result<JobState> {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .context("Invalid progress bar template")?
            .progress_chars("#>-"),
    );

    let mut ticker = tokio::time::interval(STATUS_POLL_INTERVAL);
    let state = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!(job_id = %job, "Interrupted; cancelling job");
                dispatcher.cancel_job(job);
                break dispatcher.wait_for_job(job).await?;
            }
            _ = ticker.tick() => {
                let state = dispatcher.status(job)?;
                bar.set_message(state.label());
                if let Some(progress) = state.progress() {
                    bar.set_position(u64::from(progress));
                }
                if state.is_terminal() {
                    break state;
                }
            }
        }
    };

    if matches!(state, JobState::Completed { .. }) {
        bar.finish_with_message("done");
    } else {
        bar.abandon_with_message(state.label());
    }
    Ok(state)
}

fn print_methods(dispatcher: &RequestDispatcher, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&dispatcher.health())?);
        return Ok(());
    }
    for method in dispatcher.methods() {
        println!("{method}");
    }
    Ok(())
}

async fn check_env() -> Result<()> {
    let mut problems = 0;
    for report in ServiceConfig::env_report(|name| std::env::var(name).ok()) {
        let value = report.value.as_deref().unwrap_or("(default)");
        match &report.problem {
            Some(problem) => {
                problems += 1;
                println!("✗ {:<24} {value}  {problem}", report.name);
            },
            None => println!("✓ {:<24} {value}", report.name),
        }
    }

    let ffmpeg = FfmpegCodec::default();
    if ffmpeg.is_available().await {
        println!("✓ {:<24} found", "ffmpeg");
    } else {
        problems += 1;
        println!("✗ {:<24} not found on PATH (video jobs will fail)", "ffmpeg");
    }

    if problems > 0 {
        anyhow::bail!("{problems} environment problem(s) found");
    }
    Ok(())
}
