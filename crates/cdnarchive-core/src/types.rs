//! Domain types shared by every pipeline stage.

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Calendar date identifying one partition, rendered as `YYYYMMDD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DateKey(NaiveDate);

impl DateKey {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    /// Parse a partition directory name.
    ///
    /// Accepts `20240101`, `2024-01-01`, `date=2024-01-01` and `dt=20240101`,
    /// with or without a trailing `/`.
    pub fn from_partition_name(name: &str) -> Option<Self> {
        let name = name.trim_end_matches('/');
        let value = name
            .strip_prefix("date=")
            .or_else(|| name.strip_prefix("dt="))
            .unwrap_or(name);
        value.parse().ok()
    }
}

impl fmt::Display for DateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y%m%d"))
    }
}

impl FromStr for DateKey {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 8 {
            NaiveDate::parse_from_str(s, "%Y%m%d").map(Self)
        } else {
            NaiveDate::parse_from_str(s, "%Y-%m-%d").map(Self)
        }
    }
}

impl Serialize for DateKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DateKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Unit of work: every raw log object of one source group for one day.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    pub source: String,
    pub date_key: DateKey,
    /// Object-store prefix holding this partition's objects (ends with `/`).
    pub object_prefix: String,
}

impl Partition {
    /// Local staging directory for this partition under `root`.
    pub fn staging_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.source).join(self.date_key.to_string())
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, self.date_key)
    }
}

/// Business entity a request was mapped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub table: String,
    pub id: String,
}

impl EntityRef {
    pub fn new(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.id)
    }
}

/// One JSON record of a raw CDN access log.
///
/// Field names follow the common CDN log-push layout; short aliases are
/// accepted for hand-written fixtures.
#[derive(Debug, Clone, Deserialize)]
pub struct RawLogLine {
    #[serde(rename = "ClientRequestHost", alias = "host")]
    pub host: String,
    #[serde(rename = "ClientRequestPath", alias = "path")]
    pub path: String,
    #[serde(rename = "ClientIP", alias = "client_id")]
    pub client_id: String,
    #[serde(default, rename = "EdgeStartTimestamp", alias = "timestamp")]
    pub timestamp: Option<serde_json::Value>,
}

/// Resolver verdict for a single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Identified(EntityRef),
    /// Not a request for any tracked entity; dropped silently.
    Invalid,
    /// Could be an entity, but nothing cached or rule-derived says which.
    Unidentified,
}

/// The only artifact that survives into the merge stage.
///
/// Serialized as one JSON object per line; field order is fixed so equal
/// records always produce equal lines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedEntity {
    pub table: String,
    pub id: String,
    pub client: String,
    pub date: DateKey,
}

impl ResolvedEntity {
    pub fn new(entity: EntityRef, client: String, date: DateKey) -> Self {
        Self {
            table: entity.table,
            id: entity.id,
            client,
            date,
        }
    }

    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Request queued for the remote existence probe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnresolvedCandidate {
    pub host: String,
    pub path: String,
    pub server_path: String,
}
