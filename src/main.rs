use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use netqueue::config::QueueConfig;
use netqueue::queue::Queue;
use netqueue::reclaimer::Reclaimer;
use netqueue::scheduler::{AffinityRegistry, JobStatusTracker};
use netqueue::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "netqueue")]
#[command(version)]
#[command(about = "Scheduling core of a distributed job queue")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a queue core with its background reclaimer until SIGINT/SIGTERM
    Run(RunArgs),

    /// Affinity dictionary tools
    Affinity {
        #[command(subcommand)]
        command: AffinityCommands,
    },
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Queue configuration (JSON). Missing fields take their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Affinity dump loaded at start and written back on shutdown
    #[arg(long)]
    affinities: Option<PathBuf>,
}

#[derive(clap::Subcommand, Debug)]
enum AffinityCommands {
    /// List the records of an affinity dump
    Inspect {
        /// Dump file
        #[arg(long)]
        file: PathBuf,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct AffinityEntry {
    id: u32,
    token: String,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn load_config(path: Option<&Path>) -> Result<QueueConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let file = File::open(path)?;
            Ok(serde_json::from_reader(BufReader::new(file))?)
        }
        None => Ok(QueueConfig::default()),
    }
}

// =============================================================================
// Run
// =============================================================================

async fn run_queue(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args.config.as_deref())?;
    let queue = Arc::new(Queue::new(config));

    let mut loaded = 0;
    if let Some(path) = args.affinities.as_deref().filter(|p| p.exists()) {
        loaded = queue.load_affinities(&mut BufReader::new(File::open(path)?))?;
        tracing::info!(loaded, path = %path.display(), "Loaded affinity dictionary");
    }

    let shutdown = install_shutdown_handler();
    let passes = Reclaimer::for_queue(&queue)
        .spawn(queue.clone(), shutdown)
        .await?;
    tracing::info!(passes, "Reclaimer finished");

    if let Some(path) = args.affinities.as_deref() {
        match queue.save_affinities(path, loaded)? {
            Some(written) => {
                tracing::info!(written, path = %path.display(), "Wrote affinity dictionary")
            }
            None => tracing::info!(
                loaded,
                path = %path.display(),
                "Keeping affinity dictionary, no job claimed it"
            ),
        }
    }
    print!("{}", queue.print(false));
    Ok(())
}

// =============================================================================
// Affinity Commands
// =============================================================================

fn handle_affinity_inspect(
    file: &Path,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = AffinityRegistry::new();
    let count = match registry.load_from_dump(&mut BufReader::new(File::open(file)?)) {
        Ok(count) => count,
        Err(e) => {
            eprintln!("Error: {}: {}", file.display(), e);
            return Err(e.into());
        }
    };

    let entries: Vec<AffinityEntry> = registry
        .get_affinity_statistics(&JobStatusTracker::default())
        .into_iter()
        .map(|s| AffinityEntry {
            id: s.id,
            token: s.token,
        })
        .collect();

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        OutputFormat::Table => {
            if entries.is_empty() {
                println!("No affinities found.");
            } else {
                println!("{:<10} TOKEN", "ID");
                println!("{}", "-".repeat(40));
                for entry in &entries {
                    println!("{:<10} {}", entry.id, entry.token);
                }
                println!();
                println!("{} affinities", count);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging();

    match args.command {
        Commands::Run(run_args) => {
            run_queue(run_args).await?;
        }
        Commands::Affinity { command } => match command {
            AffinityCommands::Inspect { file, output } => {
                handle_affinity_inspect(&file, &output)?;
            }
        },
    }

    Ok(())
}
