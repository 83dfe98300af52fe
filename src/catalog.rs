//! Partition discovery.
//!
//! A partition is a date-named directory under a source group's prefix. It
//! is pending when no processing-state row exists for it and it is not the
//! newest directory of its group (upstream may still be writing that one).

use std::collections::BTreeSet;

use cdnarchive_core::{DateKey, Partition};
use cdnarchive_state::StateStore;
use opendal::Operator;
use rand::seq::SliceRandom;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::storage::dir_path;

/// A configured source group with its own storage client.
#[derive(Clone)]
pub struct SourceHandle {
    pub name: String,
    pub prefix: String,
    pub operator: Operator,
}

/// Every date-named partition directory under the group's prefix.
pub async fn list_partitions(source: &SourceHandle) -> Result<BTreeSet<(DateKey, String)>> {
    let prefix = dir_path(&source.prefix);
    let entries = source
        .operator
        .list(&prefix)
        .await
        .map_err(|e| catalog_error(source, format!("listing '{prefix}': {e}")))?;

    let mut partitions = BTreeSet::new();
    for entry in entries {
        if entry.path() == prefix || !entry.metadata().mode().is_dir() {
            continue;
        }
        match DateKey::from_partition_name(entry.name()) {
            Some(key) => {
                partitions.insert((key, entry.path().to_string()));
            }
            None => debug!(source = %source.name, entry = entry.path(), "Ignoring non-partition entry"),
        }
    }
    Ok(partitions)
}

/// Pending partitions of one group, oldest first.
pub async fn pending_for_source(
    source: &SourceHandle,
    state: &dyn StateStore,
) -> Result<Vec<Partition>> {
    let listed = list_partitions(source).await?;
    let processed = state
        .processed_date_keys(&source.name)
        .await
        .map_err(|e| catalog_error(source, e.to_string()))?;

    let Some(latest) = listed.iter().map(|(key, _)| *key).max() else {
        debug!(source = %source.name, "No partitions listed");
        return Ok(Vec::new());
    };

    let pending: Vec<Partition> = listed
        .into_iter()
        .filter(|(key, _)| *key != latest && !processed.contains(key))
        .map(|(date_key, object_prefix)| Partition {
            source: source.name.clone(),
            date_key,
            object_prefix,
        })
        .collect();

    info!(
        source = %source.name,
        processed = processed.len(),
        pending = pending.len(),
        latest = %latest,
        "Catalog listed"
    );
    Ok(pending)
}

/// Pending partitions across all groups in ascending date order.
///
/// Groups are visited in random order so concurrent runs do not all hit the
/// same bucket's listing API first. Any failure aborts the whole catalog.
pub async fn pending_partitions(
    sources: &[SourceHandle],
    state: &dyn StateStore,
) -> Result<Vec<Partition>> {
    let mut order: Vec<&SourceHandle> = sources.iter().collect();
    order.shuffle(&mut rand::thread_rng());

    let mut all = Vec::new();
    for source in order {
        all.extend(pending_for_source(source, state).await?);
    }
    all.sort_by(|a, b| {
        a.date_key
            .cmp(&b.date_key)
            .then_with(|| a.source.cmp(&b.source))
    });
    Ok(all)
}

fn catalog_error(source: &SourceHandle, message: String) -> PipelineError {
    PipelineError::Catalog {
        source_name: source.name.clone(),
        message,
    }
}
