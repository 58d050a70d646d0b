use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ds3pool::{cli, config};

#[derive(Parser)]
#[command(name = "ds3pool")]
#[command(version, about = "DS3 client with bulk job transfers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(long, global = true)]
    config: Option<String>,

    /// Profile to use from config
    #[arg(long, global = true)]
    profile: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Disable SSL certificate verification
    #[arg(long, global = true)]
    insecure: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List buckets
    Service,

    /// List objects in a bucket
    Ls {
        bucket: String,

        /// Only keys starting with this prefix
        #[arg(long)]
        prefix: Option<String>,

        /// Page size requested from the service
        #[arg(long)]
        max_keys: Option<u32>,
    },

    /// Make bucket
    Mb { bucket: String },

    /// Remove bucket
    Rb { bucket: String },

    /// Upload one file
    Put {
        bucket: String,
        file: PathBuf,

        /// Object key (defaults to the file name)
        #[arg(long)]
        key: Option<String>,
    },

    /// Download one object
    Get {
        bucket: String,
        key: String,
        dest: PathBuf,
    },

    /// Delete one object
    Rm { bucket: String, key: String },

    /// Show object metadata
    Stat { bucket: String, key: String },

    /// Upload files with a bulk PUT job
    PutBulk {
        bucket: String,

        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Concurrent transfers (overrides config)
        #[arg(long)]
        workers: Option<usize>,

        /// Show a progress bar
        #[arg(long)]
        progress: bool,
    },

    /// Download objects with a bulk GET job
    GetBulk {
        bucket: String,

        #[arg(required = true)]
        names: Vec<String>,

        /// Output directory
        #[arg(long, default_value = ".")]
        out: PathBuf,

        /// Concurrent transfers (overrides config)
        #[arg(long)]
        workers: Option<usize>,

        /// Ask the service to hand out chunks in order
        #[arg(long)]
        in_order: bool,

        /// Show a progress bar
        #[arg(long)]
        progress: bool,
    },

    /// List jobs
    Jobs,

    /// Show one job
    Job { job_id: String },

    /// Cancel a job
    CancelJob { job_id: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Transfers are I/O bound and run concurrently on one thread
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = config::load_config(cli.config.as_deref(), cli.profile.as_deref())?;
    let mut profile = config
        .get_profile(cli.profile.as_deref())
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("No profile configured"))?;
    if cli.insecure {
        profile.insecure_tls = true;
    }
    let client = profile.client()?;
    let mut bulk = config.bulk.to_bulk_config();
    let json = cli.json;

    match cli.command {
        Commands::Service => cli::commands::cmd_service(&client, json).await?,
        Commands::Ls {
            bucket,
            prefix,
            max_keys,
        } => {
            cli::commands::cmd_ls(&client, &bucket, prefix.as_deref(), max_keys, json).await?;
        }
        Commands::Mb { bucket } => cli::commands::cmd_mb(&client, &bucket).await?,
        Commands::Rb { bucket } => cli::commands::cmd_rb(&client, &bucket).await?,
        Commands::Put { bucket, file, key } => {
            cli::commands::cmd_put(&client, &bucket, &file, key.as_deref()).await?;
        }
        Commands::Get { bucket, key, dest } => {
            cli::commands::cmd_get(&client, &bucket, &key, &dest).await?;
        }
        Commands::Rm { bucket, key } => cli::commands::cmd_rm(&client, &bucket, &key).await?,
        Commands::Stat { bucket, key } => {
            cli::commands::cmd_stat(&client, &bucket, &key, json).await?;
        }
        Commands::PutBulk {
            bucket,
            files,
            workers,
            progress,
        } => {
            if let Some(workers) = workers {
                bulk.workers = workers.max(1);
            }
            cli::commands::cmd_put_bulk(&client, bulk, &bucket, &files, progress, json).await?;
        }
        Commands::GetBulk {
            bucket,
            names,
            out,
            workers,
            in_order,
            progress,
        } => {
            if let Some(workers) = workers {
                bulk.workers = workers.max(1);
            }
            if in_order {
                bulk.chunk_ordering = ds3pool::ds3::ChunkOrdering::InOrder;
            }
            cli::commands::cmd_get_bulk(&client, bulk, &bucket, &names, &out, progress, json)
                .await?;
        }
        Commands::Jobs => cli::commands::cmd_jobs(&client, json).await?,
        Commands::Job { job_id } => cli::commands::cmd_job(&client, &job_id, json).await?,
        Commands::CancelJob { job_id } => {
            cli::commands::cmd_cancel_job(&client, &job_id).await?;
        }
    }

    Ok(())
}
