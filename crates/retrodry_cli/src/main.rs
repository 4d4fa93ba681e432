//! RetroDRY CLI
//!
//! Developer tools for working with RetroDRY wire data.
//!
//! # Commands
//!
//! - `key` - Parse a daton key and show its parts
//! - `dictionary` - List the datons, tables and columns of a wire data dictionary
//! - `convert` - Re-encode daton JSON as verbose or dense
//! - `diff` - Compute the diff JSON between two versions of a persiston

mod commands;

use clap::{Parser, Subcommand};
use commands::{CliError, OutputFormat};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// RetroDRY command-line developer tools.
#[derive(Parser)]
#[command(name = "retrodry")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a wire data dictionary (JSON, as returned by StartSession)
    #[arg(global = true, short, long)]
    dictionary: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a daton key and show its parts
    Key {
        /// Key text, e.g. `CustomerList|Company=Acme|_page=2`
        key: String,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// List the datons, tables and columns of the dictionary
    Dictionary {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Re-encode daton JSON
    Convert {
        /// Daton JSON file (verbose or dense)
        input: PathBuf,

        /// Write dense JSON instead of verbose
        #[arg(long)]
        dense: bool,
    },

    /// Compute the diff JSON between a pristine and a modified persiston
    Diff {
        /// Daton JSON as loaded
        pristine: PathBuf,

        /// Daton JSON after editing
        modified: PathBuf,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), CliError> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let output = match cli.command {
        Commands::Key { key, format } => commands::key::run(&key, format)?,
        Commands::Dictionary { format } => {
            let dictionary = commands::load_dictionary(cli.dictionary.as_deref())?;
            commands::dictionary::run(&dictionary, format)?
        }
        Commands::Convert { input, dense } => {
            let dictionary = commands::load_dictionary(cli.dictionary.as_deref())?;
            commands::convert::run(&dictionary, &input, dense)?
        }
        Commands::Diff { pristine, modified } => {
            let dictionary = commands::load_dictionary(cli.dictionary.as_deref())?;
            commands::diff::run(&dictionary, &pristine, &modified)?
        }
        Commands::Version => format!("RetroDRY CLI v{}", env!("CARGO_PKG_VERSION")),
    };
    println!("{output}");

    Ok(())
}
