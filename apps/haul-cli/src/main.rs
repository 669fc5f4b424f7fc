mod commands;
mod config;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use config::HaulConfig;

#[derive(Parser)]
#[command(
    name = "haul",
    version,
    about = "Resumable, verified transfers to and from an object store"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ~/.config/haul/haul.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info,haul=debug", global = true)]
    log_level: String,
}

/// Per-job overrides shared by upload and download.
#[derive(clap::Args, Debug, Default)]
pub struct TransferArgs {
    /// Chunks in flight at once
    #[arg(short, long)]
    pub parallelism: Option<u32>,
    /// Bytes per second for this job
    #[arg(long)]
    pub bandwidth_cap: Option<u64>,
    /// Digest the finished object must match
    #[arg(long)]
    pub expected_digest: Option<String>,
    /// Size the caller expects, checked before any data moves
    #[arg(long, allow_hyphen_values = true)]
    pub size: Option<i64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a local file to bucket/key
    Upload {
        /// Local file
        source: String,
        /// Destination object, as bucket/key
        object: String,
        #[command(flatten)]
        args: TransferArgs,
    },
    /// Download bucket/key to a local file
    Download {
        /// Source object, as bucket/key
        object: String,
        /// Local file to create or overwrite
        destination: String,
        #[command(flatten)]
        args: TransferArgs,
    },
    /// Show one job, or every stored job
    Status {
        job: Option<String>,
    },
    /// Restart interrupted jobs; with a job id, also continue that paused job
    Resume {
        job: Option<String>,
    },
    /// Cancel a job and abort its multipart upload
    Cancel {
        job: String,
    },
    /// Start a new job that continues a failed one
    Resubmit {
        job: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    let cfg = HaulConfig::load(cli.config)?;

    match cli.command {
        Commands::Upload {
            source,
            object,
            args,
        } => commands::transfer::upload(&cfg, source, object, args).await,
        Commands::Download {
            object,
            destination,
            args,
        } => commands::transfer::download(&cfg, object, destination, args).await,
        Commands::Status { job } => commands::jobs::status(&cfg, job.as_deref()),
        Commands::Resume { job } => commands::jobs::resume(&cfg, job.as_deref()).await,
        Commands::Cancel { job } => commands::jobs::cancel(&cfg, &job).await,
        Commands::Resubmit { job } => commands::jobs::resubmit(&cfg, &job).await,
    }
}
