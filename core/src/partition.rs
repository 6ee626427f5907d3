//! Discovery of date-keyed partitions below a key prefix.
//!
//! A partition is a child prefix shaped `<prefix>partition_date=<YYYYMMDD>/` or
//! `<prefix>partitionDate=<YYYYMMDD>/`. Markers are zero-padded, so the
//! lexicographic maximum is also the most recent snapshot.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::errors::{PartitionError, Result};
use crate::store::ObjectStore;

/// Directory names recognised as partition segments, raw layer first.
pub const PARTITION_KEYS: [&str; 2] = ["partition_date", "partitionDate"];

/// Segment name of the partitions the layer transforms write.
pub const SNAPSHOT_PARTITION_KEY: &str = "partitionDate";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionMarker(String);

impl PartitionMarker {
    pub fn new(marker: impl Into<String>) -> Self {
        Self(marker.into())
    }

    /// Marker of the partition written on the day of `at`.
    pub fn for_date(at: &DateTime<Utc>) -> Self {
        Self(at.format("%Y%m%d").to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub marker: PartitionMarker,
    /// Full child prefix, ending in `/`.
    pub prefix: String,
}

/// Keys minus the superseded files of snapshot partitions.
///
/// Every file in a `partitionDate=` partition is a complete snapshot, so only
/// the newest (the key maximum) is current. Files elsewhere are all kept.
/// Order is preserved.
pub fn current_files<'k, I>(keys: I) -> Vec<&'k String>
where
    I: IntoIterator<Item = &'k String>,
{
    let keys: Vec<&String> = keys.into_iter().collect();
    let mut newest: HashMap<&str, &String> = HashMap::new();
    for &key in &keys {
        if let Some(dir) = snapshot_dir(key) {
            let entry = newest.entry(dir).or_insert(key);
            if key > *entry {
                *entry = key;
            }
        }
    }
    keys.into_iter()
        .filter(|key| match snapshot_dir(key) {
            Some(dir) => newest.get(dir) == Some(key),
            None => true,
        })
        .collect()
}

fn snapshot_dir(key: &str) -> Option<&str> {
    let (dir, _) = key.rsplit_once('/')?;
    let segment = dir.rsplit('/').next()?;
    let (name, _) = segment.split_once('=')?;
    (name == SNAPSHOT_PARTITION_KEY).then_some(dir)
}

/// Extracts the marker from a child prefix listed under `prefix`.
pub fn parse_partition_prefix(prefix: &str, child: &str) -> Option<PartitionMarker> {
    let segment = child.strip_prefix(prefix)?;
    let (key, marker) = segment.split_once('=')?;
    if !PARTITION_KEYS.contains(&key) {
        return None;
    }
    let marker = marker.trim_end_matches('/');
    if marker.is_empty() || marker.contains('/') {
        return None;
    }
    Some(PartitionMarker::new(marker))
}

pub struct PartitionLocator<'a, S> {
    store: &'a S,
}

impl<'a, S: ObjectStore> PartitionLocator<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Every partition below `prefix`, oldest first.
    pub async fn partitions(&self, container: &str, prefix: &str) -> Result<Vec<Partition>> {
        let listing = self.store.list(container, prefix, Some("/")).await?;

        let mut partitions: Vec<Partition> = listing
            .common_prefixes
            .into_iter()
            .filter_map(|child| {
                parse_partition_prefix(prefix, &child).map(|marker| Partition {
                    marker,
                    prefix: child,
                })
            })
            .collect();
        partitions.sort_by(|a, b| a.marker.cmp(&b.marker).then_with(|| a.prefix.cmp(&b.prefix)));

        debug!(
            "Found {} partitions under {}/{}",
            partitions.len(),
            container,
            prefix
        );
        Ok(partitions)
    }

    pub async fn latest_partition(&self, container: &str, prefix: &str) -> Result<Partition> {
        self.partitions(container, prefix)
            .await?
            .pop()
            .ok_or_else(|| {
                PartitionError::NotFound {
                    container: container.to_string(),
                    prefix: prefix.to_string(),
                }
                .into()
            })
    }
}
