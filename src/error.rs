use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::identifier::Identifier;

/// Failures that abort a partition, a merge, or the whole run.
///
/// Per-item fetch failures never surface here; the worker absorbs them.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("resume identifier '{0}' is not present in the identifier list")]
    ResumePointNotFound(Identifier),
    #[error("worker count must be at least 1")]
    InvalidWorkerCount,
    #[error(
        "identifier '{id}' appears in partition {first} and partition {second}; \
         delete its row from {} and rerun with --merge-only",
        .file.display()
    )]
    DuplicateIdentifier {
        id: String,
        first: usize,
        second: usize,
        file: PathBuf,
    },
    #[error("partition file {0} has no '{1}' column")]
    MissingIdColumn(String, String),
    #[error("checkpoint writer is no longer accepting flushes")]
    WriterClosed,
    #[error("checkpoint writer thread panicked")]
    WriterPanicked,
    #[error("worker for partition {partition} panicked: {message}")]
    WorkerPanicked { partition: usize, message: String },
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T, E = HarvestError> = std::result::Result<T, E>;
