//! Relational state for the CDN log archive pipeline.
//!
//! Provides the [`StateStore`] trait and a [`SqliteStateStore`]
//! implementation holding processing-state rows (the commit barrier) and
//! the durable identifier cache.

pub mod backend;
pub mod error;
pub mod sqlite;

pub use backend::{IdentifierWriteback, ProcessingRecord, ProcessingStatus, StateStore};
pub use error::{Result, StateError};
pub use sqlite::SqliteStateStore;
