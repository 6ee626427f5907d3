//! Row version identifiers.
//!
//! A version identifier is `"{update_type}_{md5 hex}"`. In the default
//! [`VersionMode::ContentAndTime`] mode the digest covers every column of the
//! row followed by the as-of instant, so the identifier records an ingestion
//! event. [`VersionMode::ContentOnly`] hashes the content columns alone and is
//! reproducible across runs.

use std::fmt::{Display, Write as _};

use arrow::array::{ArrayRef, StringArray};
use arrow::record_batch::RecordBatch;
use arrow::util::display::{ArrayFormatter, FormatOptions};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::schema::{VERSION_COLUMN, is_metadata_column};

pub const DEFAULT_UPDATE_TYPE: &str = "insert";

const NULL_TEXT: &str = "null";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionMode {
    #[default]
    ContentAndTime,
    ContentOnly,
}

#[derive(Debug, Clone)]
pub struct VersionStamper {
    mode: VersionMode,
    update_type: String,
}

impl Default for VersionStamper {
    fn default() -> Self {
        Self::new(VersionMode::default(), DEFAULT_UPDATE_TYPE)
    }
}

impl VersionStamper {
    pub fn new(mode: VersionMode, update_type: impl Into<String>) -> Self {
        Self {
            mode,
            update_type: update_type.into(),
        }
    }

    pub fn mode(&self) -> VersionMode {
        self.mode
    }

    pub fn update_type(&self) -> &str {
        &self.update_type
    }

    /// Identifier for one row given its values in column order.
    pub fn stamp<I, V>(&self, row_values: I, as_of: &DateTime<Utc>) -> String
    where
        I: IntoIterator<Item = V>,
        V: Display,
    {
        let mut data = String::new();
        for value in row_values {
            // writing into a String cannot fail
            let _ = write!(data, "{value}");
        }
        if self.mode == VersionMode::ContentAndTime {
            data.push_str(&format_as_of(as_of));
        }
        self.identifier(&data)
    }

    /// One identifier per row of `batch`. The `version` column itself is never hashed.
    pub fn stamp_batch(&self, batch: &RecordBatch, as_of: &DateTime<Utc>) -> Result<StringArray> {
        let schema = batch.schema();
        let options = FormatOptions::default().with_null(NULL_TEXT);
        let hashed: Vec<&ArrayRef> = schema
            .fields()
            .iter()
            .zip(batch.columns())
            .filter(|(field, _)| self.hashes_column(field.name()))
            .map(|(_, column)| column)
            .collect();
        let formatters = hashed
            .iter()
            .map(|column| ArrayFormatter::try_new(column.as_ref(), &options))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let identifiers: Vec<String> = (0..batch.num_rows())
            .map(|row| self.stamp(formatters.iter().map(|f| f.value(row)), as_of))
            .collect();
        Ok(StringArray::from(identifiers))
    }

    fn hashes_column(&self, name: &str) -> bool {
        match self.mode {
            VersionMode::ContentAndTime => name != VERSION_COLUMN,
            VersionMode::ContentOnly => !is_metadata_column(name),
        }
    }

    fn identifier(&self, data: &str) -> String {
        format!("{}_{}", self.update_type, digest(data))
    }
}

/// Reproducible digest of a row's content, independent of any instant.
pub fn content_hash<I, V>(row_values: I) -> String
where
    I: IntoIterator<Item = V>,
    V: Display,
{
    let mut data = String::new();
    for value in row_values {
        let _ = write!(data, "{value}");
    }
    digest(&data)
}

fn digest(data: &str) -> String {
    format!("{:x}", md5::compute(data.as_bytes()))
}

fn format_as_of(as_of: &DateTime<Utc>) -> String {
    as_of.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}
