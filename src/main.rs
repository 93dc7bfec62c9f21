//! `yt-helper`: command-line host for the download worker supervisor.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, EnvFilter};

use yt_helper_supervisor::{
    DownloadMode, DownloadOptions, RunMode, StatusEvent, Supervisor, SupervisorConfig,
    SupervisorEvent,
};

#[derive(Parser, Debug)]
#[command(name = "yt-helper")]
#[command(about = "Run the YouTube Helper download worker under supervision")]
struct Args {
    /// Config file (defaults to the per-user supervisor.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured run mode
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Dev,
    Packaged,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print metadata for a video as JSON
    Info { url: String },

    /// Download one video and wait for it to finish
    Download {
        url: String,

        /// Output directory (defaults to the user's download folder)
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Extract audio only
        #[arg(long)]
        audio: bool,

        /// Container (video) or codec (audio), e.g. mp4, mp3
        #[arg(long)]
        format: Option<String>,

        /// best, 1080p, 720p, ...
        #[arg(long)]
        quality: Option<String>,

        /// Clip start, HH:MM:SS
        #[arg(long)]
        start: Option<String>,

        /// Clip end, HH:MM:SS
        #[arg(long)]
        end: Option<String>,
    },

    /// Keep the worker running and print events until Ctrl-C
    Serve,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn default_output_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let mut config = SupervisorConfig::load(args.config.as_deref())?;
    if let Some(mode) = args.mode {
        config.run_mode = match mode {
            ModeArg::Dev => RunMode::Dev,
            ModeArg::Packaged => RunMode::Packaged,
        };
    }

    let (supervisor, mut events) = Supervisor::new(config)?;
    supervisor
        .start()
        .await
        .context("worker failed to start")?;

    let result = match args.command {
        Command::Info { url } => {
            let info = supervisor.get_video_info(&url).await;
            info.map_err(anyhow::Error::from).and_then(|info| {
                println!("{}", serde_json::to_string_pretty(&info)?);
                Ok(())
            })
        }
        Command::Download {
            url,
            output,
            audio,
            format,
            quality,
            start,
            end,
        } => {
            let output = output.unwrap_or_else(default_output_dir);
            let mut options = DownloadOptions::new(url, output.to_string_lossy());
            options.mode = if audio {
                DownloadMode::Audio
            } else {
                DownloadMode::Video
            };
            options.format = format;
            options.quality = quality;
            options.start_time = start;
            options.end_time = end;

            run_download(&supervisor, &mut events, options).await
        }
        Command::Serve => serve(&mut events).await,
    };

    let outcome = supervisor.stop().await;
    log::info!("Worker shutdown: {:?}", outcome);
    result
}

async fn run_download(
    supervisor: &Supervisor,
    events: &mut yt_helper_supervisor::EventStream,
    options: DownloadOptions,
) -> Result<()> {
    let job_id = supervisor.start_download(options).await?;
    eprintln!("Started job {job_id}");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                supervisor.cancel_download(&job_id);
                return Err(anyhow!("interrupted"));
            }
            event = events.recv() => {
                let Some(event) = event else {
                    return Err(anyhow!("supervisor event stream closed"));
                };
                if event.job_id() != Some(job_id.as_str()) {
                    if let SupervisorEvent::Status(status) = &event {
                        log::info!("{:?}", status);
                    }
                    continue;
                }
                match event {
                    SupervisorEvent::Progress(record) => {
                        eprintln!(
                            "{:>5.1}%  {}  eta {}",
                            record.progress,
                            record.rate.as_deref().unwrap_or("-"),
                            record.eta.as_deref().unwrap_or("-"),
                        );
                    }
                    SupervisorEvent::Complete(record) => {
                        println!("{}", record.filename.as_deref().unwrap_or(&record.job_id));
                        return Ok(());
                    }
                    SupervisorEvent::Error(record) => {
                        return Err(anyhow!(
                            "download failed: {}",
                            record.error.as_deref().unwrap_or("unknown error")
                        ));
                    }
                    SupervisorEvent::Cancelled(_) => return Err(anyhow!("download cancelled")),
                    SupervisorEvent::Status(_) => {}
                }
            }
        }
    }
}

async fn serve(events: &mut yt_helper_supervisor::EventStream) -> Result<()> {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            event = events.recv() => {
                let Some(event) = event else { return Ok(()) };
                println!("{}", serde_json::to_string(&event)?);
                if let SupervisorEvent::Status(StatusEvent::Failed { message, .. }) = &event {
                    return Err(anyhow!("worker failed: {message}"));
                }
            }
        }
    }
}
