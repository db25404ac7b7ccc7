//! Command-line entry point.
//!
//! Grounded in `cli/commands.rs`'s `Cli`/`Commands` derive shape and its
//! "parse, load settings, dispatch to one `cmd_*` per arm" `run()` — kept
//! here, generalized to the pipeline's own subcommands. The teacher's
//! `console`/`indicatif` styled output is dropped (no interactive progress
//! bars or terminal colors carry over); output here is plain `println!` and
//! `tracing`, matching the ambient logging stack used everywhere else in
//! this crate.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Check if verbose mode is enabled, before `tracing_subscriber` is set up —
/// same early-args scan as the teacher's `is_verbose`, since clap itself
/// isn't invoked yet at that point in `main`.
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Parser)]
#[command(name = "legal-pipeline")]
#[command(about = "Legal document intelligence pipeline: PDF ingestion, OCR, and analytical graph construction")]
#[command(version)]
pub struct Cli {
    /// Override the configured data directory (database + object store root).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the data directory and database schema.
    Init,

    /// Manage matters (the tenancy unit for everything else).
    Matter {
        #[command(subcommand)]
        command: MatterCommands,
    },

    /// Upload and inspect case documents.
    Document {
        #[command(subcommand)]
        command: DocumentCommands,
    },

    /// Inspect ledger jobs.
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },

    /// Run the worker pool: claims queued jobs and processes them until
    /// interrupted.
    Worker {
        /// Maximum concurrent job executions (defaults to config's
        /// `worker_concurrency`).
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Recovery sweeps.
    Recover {
        #[command(subcommand)]
        command: RecoverCommands,
    },
}

#[derive(Subcommand)]
enum MatterCommands {
    /// Create a new matter.
    Create {
        /// Display name.
        #[arg(long)]
        name: String,
    },
    /// Show one matter by id.
    Show {
        /// Matter id.
        id: String,
    },
}

#[derive(Subcommand)]
enum DocumentCommands {
    /// Upload a PDF into a matter and enqueue it for processing.
    Upload {
        /// Owning matter id.
        #[arg(long)]
        matter: String,
        /// Path to the PDF file on disk.
        #[arg(long)]
        file: PathBuf,
    },
    /// Show one document's current status.
    Status {
        /// Document id.
        id: String,
    },
}

#[derive(Subcommand)]
enum JobCommands {
    /// Show one job by id.
    Show {
        /// Job id.
        id: String,
    },
}

#[derive(Subcommand)]
enum RecoverCommands {
    /// Run every sweep exactly once and report what each found, instead of
    /// enqueuing sweep jobs on their usual cadence. Useful for operator
    /// scripts and the "force-skip chunking" repair workflow in SPEC_FULL §9.
    SweepOnce,
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = crate::config::PipelineConfig::load().await;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir.to_string_lossy().into_owned();
    }

    match cli.command {
        Commands::Init => commands::init(&config).await,
        Commands::Matter { command } => match command {
            MatterCommands::Create { name } => commands::matter_create(&config, &name).await,
            MatterCommands::Show { id } => commands::matter_show(&config, &id).await,
        },
        Commands::Document { command } => match command {
            DocumentCommands::Upload { matter, file } => commands::document_upload(&config, &matter, &file).await,
            DocumentCommands::Status { id } => commands::document_status(&config, &id).await,
        },
        Commands::Job { command } => match command {
            JobCommands::Show { id } => commands::job_show(&config, &id).await,
        },
        Commands::Worker { concurrency } => commands::worker_run(&config, concurrency).await,
        Commands::Recover { command } => match command {
            RecoverCommands::SweepOnce => commands::recover_sweep_once(&config).await,
        },
    }
}
