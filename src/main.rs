use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use clipflow::config::{init_config, DEFAULT_CONFIG_FILE};
use clipflow::{Coordinator, CoordinatorEvent, TaskId};

/// Upload a video or submit a link, then follow processing until clips are ready
#[derive(Parser, Debug)]
#[command(name = "clipflow")]
#[command(version)]
struct Args {
    /// Client configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE, env = "CLIPFLOW_CONFIG")]
    config: PathBuf,

    /// Overrides `api_base_url` from the configuration file
    #[arg(long, env = "CLIPFLOW_API_URL")]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a local video file
    Upload {
        file: PathBuf,
    },
    /// Ask the service to download a YouTube video
    Youtube {
        url: String,
        /// Stop after the download instead of starting processing
        #[arg(long)]
        no_auto_process: bool,
    },
    /// Follow an existing server task
    Watch {
        task_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = init_config(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?
        .clone();
    if let Some(api_url) = args.api_url {
        config.api_base_url = api_url;
        config.validate()?;
    }
    info!(api = %config.api_base_url, "clipflow {}", env!("CARGO_PKG_VERSION"));

    let coordinator = Coordinator::with_http(config).context("Failed to create HTTP client")?;
    let mut events = coordinator.subscribe_events();

    // 不自动处理时，传输完成即结束
    let stop_after_transfer = match args.command {
        Command::Upload { file } => {
            let video_id = coordinator.upload_file(&file).await?;
            info!(%video_id, "uploaded {}", file.display());
            !coordinator.config().auto_process
        }
        Command::Youtube { url, no_auto_process } => {
            let auto_process = coordinator.config().auto_process && !no_auto_process;
            let task_id = coordinator.submit_url_with(&url, auto_process).await?;
            info!(%task_id, "download submitted");
            !auto_process
        }
        Command::Watch { task_id } => {
            coordinator.watch_task(TaskId::new(task_id)).await?;
            false
        }
    };

    if stop_after_transfer && coordinator.snapshot().phase.is_transfer_done() {
        info!("auto processing disabled, nothing left to wait for");
        return Ok(());
    }

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                coordinator.cancel();
                info!("interrupted; the server keeps processing");
                return Ok(());
            }
            event = events.recv() => event,
        };

        match event {
            Ok(CoordinatorEvent::StateChanged { new, .. }) => {
                info!(status = %new, "{}", new.message());
            }
            Ok(CoordinatorEvent::Progress { percentage }) => {
                info!("{}%", percentage);
            }
            Ok(CoordinatorEvent::Uploaded { video_id, s3_key, filename }) => {
                info!(%video_id, %s3_key, "{} stored", filename);
            }
            Ok(CoordinatorEvent::Downloaded { video_id, task_id }) => {
                info!(%task_id, video_id = ?video_id, "download complete");
                if stop_after_transfer {
                    coordinator.cancel();
                    return Ok(());
                }
            }
            Ok(CoordinatorEvent::Redirected { from, to }) => {
                info!(%from, %to, "following processing task");
            }
            Ok(CoordinatorEvent::ConnectionIssue { failures }) => {
                warn!(failures, "trouble reaching the service, still retrying");
            }
            Ok(CoordinatorEvent::ConnectionRestored) => {
                info!("connection restored");
            }
            Ok(CoordinatorEvent::Completed { task_id, clips }) => {
                info!(%task_id, "{} clips ready", clips.len());
                for clip in clips {
                    println!("{}\t{}\t{}\t{}", clip.id, clip.duration, clip.title, clip.url);
                }
                return Ok(());
            }
            Ok(CoordinatorEvent::Failed { error }) => {
                bail!("{}: {}", error.title, error.description);
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "event receiver lagged");
            }
            Err(RecvError::Closed) => {
                let snapshot = coordinator.snapshot();
                info!(status = %snapshot.phase, progress = snapshot.progress, "event stream closed");
                return Ok(());
            }
        }
    }
}
