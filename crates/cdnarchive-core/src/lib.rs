//! Core types and policies for the CDN log archive pipeline.
//!
//! Everything in this crate is free of object-storage and database I/O:
//! the pipeline stages in the root crate wire these pieces to real
//! backends, tests wire them to in-memory ones.

pub mod anonymize;
pub mod cache;
pub mod error;
pub mod lines;
pub mod resolver;
pub mod types;

pub use anonymize::{content_hash, Anonymizer};
pub use cache::{IdentifierCache, IdentifierStore};
pub use error::{CoreError, Result};
pub use lines::{LineOutcome, LogLines};
pub use resolver::{
    normalize_host, normalize_path, NoopUnmappedSink, Resolver, RuleResolver, UnmappedSink,
};
pub use types::{
    DateKey, EntityRef, Partition, RawLogLine, Resolution, ResolvedEntity, UnresolvedCandidate,
};
