use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info, warn};
use watchsync_models::{is_valid_rating, normalize_username, SnapshotRecord};

use crate::error::SyncError;
use crate::identity::{IdentityResolver, MatchKey};
use crate::report::{RunReport, WarningKind};

pub const SNAPSHOT_VERSION: u32 = 1;

fn default_version() -> u32 {
    SNAPSHOT_VERSION
}

/// Exported watch state of every selected user, ready to be imported elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "Utc::now")]
    pub generated_at: DateTime<Utc>,
    /// Name of the server the snapshot was exported from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub records: Vec<SnapshotRecord>,
}

/// Either a full document or just the record list.
#[derive(Deserialize)]
#[serde(untagged)]
enum SnapshotDocument {
    Document(Snapshot),
    Records(Vec<SnapshotRecord>),
}

impl Snapshot {
    pub fn new(source: Option<String>, records: Vec<SnapshotRecord>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            generated_at: Utc::now(),
            source,
            records,
        }
    }

    /// Parse and validate snapshot JSON. `path` only labels errors.
    pub fn parse(json: &str, path: &Path) -> Result<Self, SyncError> {
        let format_error = |message: String| SyncError::SnapshotFormat {
            path: path.to_path_buf(),
            message,
        };

        let document: SnapshotDocument = match serde_json::from_str(json) {
            Ok(document) => document,
            // untagged enums hide the real reason; retry for a useful message
            Err(_) => match serde_json::from_str::<Snapshot>(json) {
                Ok(snapshot) => SnapshotDocument::Document(snapshot),
                Err(e) => return Err(format_error(e.to_string())),
            },
        };
        let snapshot = match document {
            SnapshotDocument::Document(snapshot) => snapshot,
            SnapshotDocument::Records(records) => Snapshot::new(None, records),
        };
        snapshot.validate().map_err(format_error)?;
        Ok(snapshot)
    }

    fn validate(&self) -> Result<(), String> {
        if self.version != SNAPSHOT_VERSION {
            return Err(format!("unsupported version {} (expected {})", self.version, SNAPSHOT_VERSION));
        }
        for (n, record) in self.records.iter().enumerate() {
            if record.user.trim().is_empty() {
                return Err(format!("record {} has no user", n));
            }
            if let Some(rating) = record.state.user_rating {
                if !is_valid_rating(rating) {
                    return Err(format!(
                        "record {} ({}) has rating {} outside 0 to 10",
                        n, record.title, rating
                    ));
                }
            }
        }
        Ok(())
    }

    pub async fn read(path: &Path) -> Result<Self, SyncError> {
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| SyncError::SnapshotIo {
                path: path.to_path_buf(),
                source,
            })?;
        let snapshot = Self::parse(&json, path)?;
        info!("Read {} records from {:?}", snapshot.records.len(), path);
        Ok(snapshot)
    }

    /// Write pretty JSON, replacing any existing file atomically.
    pub async fn write(&self, path: &Path) -> Result<(), SyncError> {
        let io_error = |source| SyncError::SnapshotIo {
            path: path.to_path_buf(),
            source,
        };

        let json = serde_json::to_string_pretty(self).map_err(|e| SyncError::SnapshotFormat {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, json).await.map_err(io_error)?;
        tokio::fs::rename(&temp_path, path).await.map_err(io_error)?;

        info!("Wrote {} records to {:?}", self.records.len(), path);
        Ok(())
    }
}

fn sort_key(record: &SnapshotRecord) -> impl Ord + '_ {
    (
        normalize_username(&record.user),
        record.section_type,
        record.section.as_deref().unwrap_or(""),
        record.parent_title.as_deref().unwrap_or(""),
        record.parent_index,
        record.index,
        record.title.as_str(),
        record.year,
    )
}

/// Merge worker output into the final record order.
///
/// Records of one user that share an identifier key (the same title kept
/// in two sections) collapse into the one with the stronger state; import
/// applies it to every copy. Records that only have a title key are never
/// merged, since two items with the same title may be different items:
/// they are kept apart and each collision is counted as ambiguous. The
/// result is sorted by user, then section, then item, so repeated exports
/// of the same library are byte-for-byte comparable.
pub fn merge_records(
    records: Vec<SnapshotRecord>,
    resolver: &IdentityResolver,
    report: &mut RunReport,
) -> Vec<SnapshotRecord> {
    let total = records.len();
    let mut merged: Vec<SnapshotRecord> = Vec::with_capacity(total);
    let mut seen: HashMap<(String, MatchKey), usize> = HashMap::with_capacity(total);
    let mut title_only: BTreeMap<(String, String), (String, String, usize)> = BTreeMap::new();

    for record in records {
        let item = record.to_item();
        let key = resolver.resolve(&item);
        let user = normalize_username(&record.user);

        if key.is_fallback() {
            title_only
                .entry((user, key.to_string()))
                .or_insert_with(|| (record.user.clone(), item.describe(), 0))
                .2 += 1;
            merged.push(record);
            continue;
        }

        match seen.get(&(user.clone(), key.clone())) {
            Some(&idx) => {
                if record.state.precedence() > merged[idx].state.precedence() {
                    merged[idx] = record;
                }
            }
            None => {
                seen.insert((user, key), merged.len());
                merged.push(record);
            }
        }
    }

    for (user, subject, count) in title_only.into_values().filter(|(_, _, count)| *count > 1) {
        warn!("{} items of '{}' share the title {}; kept as separate records", count, user, subject);
        report.ambiguous_matches += 1;
        report.warn(
            WarningKind::MatchAmbiguous,
            Some(user.as_str()),
            Some(subject.as_str()),
            format!("{} source items share this title and have no identifier; kept separately", count),
        );
    }

    merged.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
    if merged.len() < total {
        debug!("Merged {} duplicate records", total - merged.len());
    }
    merged
}
