//! CLI command implementations.

pub mod convert;
pub mod diff;
pub mod dictionary;
pub mod key;

use retrodry_core::{CoreError, DataDictionary, WireDataDictionary};
use serde_json::Value as Json;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors reported by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// The command needs `--dictionary`.
    #[error("this command needs --dictionary <path>")]
    MissingDictionary,

    /// A file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A file is not valid JSON.
    #[error("{path} is not valid JSON: {source}")]
    Json {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },

    /// Key, schema or wire format error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Output could not be encoded.
    #[error("cannot encode output: {0}")]
    Output(#[from] serde_json::Error),
}

/// Output format for listing commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// Reads a JSON file.
pub fn read_json(path: &Path) -> Result<Json, CliError> {
    let text = std::fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| CliError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads a wire data dictionary file.
pub fn load_dictionary(path: Option<&Path>) -> Result<DataDictionary, CliError> {
    let path = path.ok_or(CliError::MissingDictionary)?;
    let json = read_json(path)?;
    let wire: WireDataDictionary = serde_json::from_value(json).map_err(|source| CliError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let dictionary = DataDictionary::from_wire(&wire)?;
    debug!(path = %path.display(), datons = dictionary.len(), "dictionary loaded");
    Ok(dictionary)
}
