//! Process-wide identifier cache with write-batched persistence.
//!
//! Lookups are served from memory. New entries are buffered and upserted to
//! the durable store in groups of `flush_size`; a failed group is put back
//! in the buffer, which is safe because the store merges idempotently.

use crate::error::Result;
use crate::types::EntityRef;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Durable side of the cache.
#[async_trait]
pub trait IdentifierStore: Send + Sync {
    /// Insert or overwrite every `(content_hash, entity)` pair.
    async fn upsert_identifiers(&self, entries: &[(String, EntityRef)]) -> Result<u64>;
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, EntityRef>,
    pending: Vec<(String, EntityRef)>,
}

pub struct IdentifierCache {
    state: Mutex<CacheState>,
    flush_size: usize,
    store: Option<Arc<dyn IdentifierStore>>,
}

impl IdentifierCache {
    pub fn new(flush_size: usize, store: Option<Arc<dyn IdentifierStore>>) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            flush_size: flush_size.max(1),
            store,
        }
    }

    /// Seed the cache with entries already persisted; they are not re-flushed.
    pub fn preload(&self, entries: impl IntoIterator<Item = (String, EntityRef)>) -> usize {
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.extend(entries);
        state.entries.len() - before
    }

    pub fn get(&self, key: &str) -> Option<EntityRef> {
        self.state.lock().entries.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Remember `entity` for `key`, flushing a full group to the store.
    ///
    /// Returns false when the key was already cached.
    pub async fn record(&self, key: String, entity: EntityRef) -> bool {
        let group = {
            let mut state = self.state.lock();
            if state.entries.contains_key(&key) {
                return false;
            }
            state.entries.insert(key.clone(), entity.clone());
            state.pending.push((key, entity));
            if state.pending.len() >= self.flush_size {
                Some(std::mem::take(&mut state.pending))
            } else {
                None
            }
        };

        if let Some(group) = group {
            if let Err(e) = self.write_group(group).await {
                warn!(error = %e, "Identifier cache flush failed; entries kept for retry");
            }
        }
        true
    }

    /// Write every buffered entry. Returns the number of entries written.
    pub async fn flush(&self) -> Result<usize> {
        let pending = std::mem::take(&mut self.state.lock().pending);
        if pending.is_empty() {
            return Ok(0);
        }

        let mut written = 0;
        let mut groups = pending.chunks(self.flush_size);
        while let Some(group) = groups.next() {
            if let Err(e) = self.write_group(group.to_vec()).await {
                let rest: Vec<_> = groups.flatten().cloned().collect();
                self.state.lock().pending.extend(rest);
                return Err(e);
            }
            written += group.len();
        }

        debug!(written, "Flushed identifier cache");
        Ok(written)
    }

    async fn write_group(&self, group: Vec<(String, EntityRef)>) -> Result<()> {
        let Some(store) = self.store.as_ref() else {
            return Ok(());
        };

        match store.upsert_identifiers(&group).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.state.lock().pending.extend(group);
                Err(e)
            }
        }
    }
}
