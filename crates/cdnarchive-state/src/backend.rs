//! State store trait definition.
//!
//! [`StateStore`] covers the two relational concerns of the pipeline: the
//! per-partition processing marker that acts as the commit barrier, and the
//! durable half of the identifier cache.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use cdnarchive_core::{CoreError, DateKey, EntityRef, IdentifierStore};
use chrono::{DateTime, Utc};

use crate::error::Result;

/// Lifecycle state recorded for an archived partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStatus {
    /// Archived and independently verified.
    Downloaded,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Downloaded => "downloaded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "downloaded" => Some(Self::Downloaded),
            _ => None,
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One processing-state row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingRecord {
    pub source: String,
    pub date_key: DateKey,
    pub status: ProcessingStatus,
    pub archive_path: String,
    pub committed_at: DateTime<Utc>,
}

impl ProcessingRecord {
    pub fn downloaded(source: &str, date_key: DateKey, archive_path: &str) -> Self {
        Self {
            source: source.to_string(),
            date_key,
            status: ProcessingStatus::Downloaded,
            archive_path: archive_path.to_string(),
            committed_at: Utc::now(),
        }
    }
}

/// Storage contract for pipeline state.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn StateStore>`.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Date keys of `source` that already have a `downloaded` row.
    async fn processed_date_keys(&self, source: &str) -> Result<BTreeSet<DateKey>>;

    /// Insert the row unless one already exists for `(source, date_key)`.
    ///
    /// Returns `true` when this call wrote the row.
    async fn record_processed(&self, record: &ProcessingRecord) -> Result<bool>;

    async fn processing_record(
        &self,
        source: &str,
        date_key: DateKey,
    ) -> Result<Option<ProcessingRecord>>;

    /// Every persisted identifier-cache entry.
    async fn load_identifiers(&self) -> Result<Vec<(String, EntityRef)>>;

    /// Insert or overwrite identifier-cache entries. Returns rows affected.
    async fn upsert_identifiers(&self, entries: &[(String, EntityRef)]) -> Result<u64>;
}

/// Adapts a [`StateStore`] to the identifier cache's write-back interface.
pub struct IdentifierWriteback {
    store: Arc<dyn StateStore>,
}

impl IdentifierWriteback {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl IdentifierStore for IdentifierWriteback {
    async fn upsert_identifiers(
        &self,
        entries: &[(String, EntityRef)],
    ) -> cdnarchive_core::Result<u64> {
        self.store
            .upsert_identifiers(entries)
            .await
            .map_err(|e| CoreError::Store(e.to_string()))
    }
}
