//! dirsync CLI - bidirectional directory synchronization.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dirsync::{ConfigFile, SyncConfig, SyncConfigBuilder, DEFAULT_PORT};

/// dirsync - keep two directory trees in sync over TCP
#[derive(Parser)]
#[command(name = "dirsync")]
#[command(version)]
#[command(about = "Bidirectional directory synchronization, newest copy wins")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept peers and synchronize DIRECTORY with each of them in turn
    Serve {
        /// Directory to synchronize
        #[arg(required = true)]
        directory: PathBuf,

        #[command(flatten)]
        options: SessionOptions,
    },

    /// Connect to a serving peer and synchronize DIRECTORY once
    Sync {
        /// Directory to synchronize
        #[arg(required = true)]
        directory: PathBuf,

        /// Address of the serving peer
        #[arg(required = true)]
        address: String,

        #[command(flatten)]
        options: SessionOptions,
    },
}

#[derive(Args)]
struct SessionOptions {
    /// TCP port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Report unresolved conflicts as warnings
    #[arg(long)]
    strict: bool,

    /// Show verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON file overriding port, strict and verbose
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Serve { directory, options } => {
            let config = build_config(&directory, "0.0.0.0", &options)?;
            init_logging(config.verbose);
            dirsync::serve(&config)?;
        }
        Commands::Sync {
            directory,
            address,
            options,
        } => {
            let config = build_config(&directory, &address, &options)?;
            init_logging(config.verbose);
            let stats = dirsync::connect(&config)?;
            println!(
                "Synced {} ({} sent, {} received, {} skipped, {} directories created)",
                directory.display(),
                stats.files_sent,
                stats.files_received,
                stats.files_skipped,
                stats.directories_created
            );
        }
    }
    Ok(())
}

fn build_config(
    directory: &Path,
    address: &str,
    options: &SessionOptions,
) -> Result<SyncConfig, Box<dyn std::error::Error>> {
    let mut builder = SyncConfigBuilder::new(directory)
        .address(address)
        .port(options.port)
        .strict(options.strict)
        .verbose(options.verbose);

    if let Some(path) = &options.config {
        // Logging isn't up yet; an unreadable file would warn into the void.
        if !path.is_file() {
            eprintln!("Warning: config file '{}' could not be read", path.display());
        } else if let Some(file) = ConfigFile::load(path)? {
            builder = builder.overrides(&file);
        }
    }

    Ok(builder.build()?)
}

fn init_logging(verbose: bool) {
    let default = if verbose { "dirsync=debug" } else { "dirsync=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
