//! Error types for the partition pipeline.
//!
//! Every variant is fatal to the partition it was raised for; the partition
//! loop logs it, marks the partition failed and moves on. Only a failed
//! archive verification stops the run.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration could not be turned into working clients
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The state store could not be opened or queried at startup
    #[error("state store unavailable: {0}")]
    State(String),

    /// Listing partitions or reading processed keys failed
    #[error("catalog for source '{source_name}' unavailable: {message}")]
    Catalog {
        source_name: String,
        message: String,
    },

    /// An object of the partition could not be listed or downloaded
    #[error("fetch of {partition} failed: {message}")]
    Fetch { partition: String, message: String },

    /// Local staging or scratch files could not be prepared
    #[error("staging error at '{path}': {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Neither merge strategy produced a sorted, de-duplicated artifact
    #[error("merge failed: {0}")]
    Merge(String),

    /// Writing the archive object failed
    #[error("upload of '{path}' failed: {message}")]
    Upload { path: String, message: String },

    /// The archive object could not be confirmed through the verify client
    #[error("archive verification of '{path}' failed: {message}")]
    Verify { path: String, message: String },

    /// The processing-state row could not be written
    #[error("commit of {partition} failed: {message}")]
    Commit { partition: String, message: String },
}

impl PipelineError {
    pub fn staging(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Staging {
            path: path.into(),
            source,
        }
    }

    /// A verification failure means the writer and reader disagree about
    /// the archive, so every later partition would fail the same way.
    pub fn halts_run(&self) -> bool {
        matches!(self, Self::Verify { .. })
    }

    /// Short stage label used in reports.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "config",
            Self::State(_) => "state",
            Self::Catalog { .. } => "catalog",
            Self::Fetch { .. } => "fetch",
            Self::Staging { .. } => "staging",
            Self::Merge(_) => "merge",
            Self::Upload { .. } => "upload",
            Self::Verify { .. } => "verify",
            Self::Commit { .. } => "commit",
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
