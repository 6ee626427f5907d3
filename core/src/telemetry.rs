use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pipeline_core=info,bootstrap=info,runner_container=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Outcome of one layer transform run.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct TransformReport {
    pub dataset: String,
    pub partition: String,
    pub output_key: String,
    pub rows_read: usize,
    pub rows_written: usize,
    pub stamped_rows: usize,
    pub unchanged_rows: usize,
    pub superseded_rows: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub files_seen: usize,
    pub files_ingested: usize,
    pub files_skipped: usize,
    pub rows_written: usize,
    pub keys_written: Vec<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct PromotionReport {
    pub examined: usize,
    pub promoted: usize,
    pub rejected: usize,
    pub unreadable: usize,
}

impl TransformReport {
    pub fn summary(&self) -> String {
        format!(
            "{}: wrote {} rows to {} ({} read, {} stamped, {} unchanged, {} superseded)",
            self.dataset,
            self.rows_written,
            self.output_key,
            self.rows_read,
            self.stamped_rows,
            self.unchanged_rows,
            self.superseded_rows
        )
    }
}

impl IngestReport {
    pub fn summary(&self) -> String {
        format!(
            "ingested {} of {} landing files ({} skipped), {} rows in {} objects",
            self.files_ingested,
            self.files_seen,
            self.files_skipped,
            self.rows_written,
            self.keys_written.len()
        )
    }
}

impl PromotionReport {
    pub fn summary(&self) -> String {
        format!(
            "promoted {} of {} files ({} rejected, {} unreadable)",
            self.promoted, self.examined, self.rejected, self.unreadable
        )
    }
}
