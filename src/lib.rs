//! cdnarchive: turn daily CDN access-log partitions into resolved,
//! anonymized, de-duplicated archive objects.
//!
//! A run lists pending partitions ([`catalog`]), downloads each one
//! ([`fetch`]), classifies every file in deadline-bounded batches
//! ([`runner`], [`classify`], [`probe`]), merges the results into one
//! sorted unique file ([`merge`]) and archives it behind an independent
//! verification before recording the partition as processed ([`commit`]).

pub mod catalog;
pub mod classify;
pub mod commit;
pub mod error;
pub mod fetch;
mod init;
pub mod merge;
pub mod pipeline;
pub mod probe;
pub mod runner;
pub mod side_channel;
pub mod storage;
pub mod summary;

pub use error::{PipelineError, Result};
pub use init::{init_tracing, log_startup};
pub use pipeline::{Pipeline, RunOptions};
pub use side_channel::SideChannel;
pub use summary::{PartitionReport, PartitionStatus, RunSummary};
