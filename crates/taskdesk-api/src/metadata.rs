use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use taskdesk_core::{
    decode_section_records, ChangelogEntry, JsonObject, MetadataSection, MetadataSnapshot,
};
use taskdesk_history::SnapshotHistory;
use taskdesk_platform::{PlatformError, RpcGateway};
use time::OffsetDateTime;
use tracing::{info, warn};

/// Result of fetching one optional section.
#[derive(Debug, Clone, PartialEq)]
pub enum SectionFetch {
    Fetched(Vec<JsonObject>),
    Skipped(String),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SkippedSection {
    pub section: MetadataSection,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExtractReport {
    pub snapshot_path: PathBuf,
    pub latest_path: PathBuf,
    pub table_count: usize,
    pub sections: Vec<MetadataSection>,
    pub skipped: Vec<SkippedSection>,
    pub first_run: bool,
    pub changelog_entry: Option<ChangelogEntry>,
}

/// Fetches schema metadata through the platform's stored procedures and keeps the
/// snapshot history up to date.
pub struct MetadataTracker {
    rpc: Arc<dyn RpcGateway>,
    history: SnapshotHistory,
    schema: String,
}

impl MetadataTracker {
    #[must_use]
    pub fn new(rpc: Arc<dyn RpcGateway>, history: SnapshotHistory, schema: impl Into<String>) -> Self {
        Self { rpc, history, schema: schema.into() }
    }

    #[must_use]
    pub fn history(&self) -> &SnapshotHistory {
        &self.history
    }

    /// Call the procedure for `section` with this tracker's schema name.
    /// `Ok(None)` means the procedure returned `null`.
    ///
    /// # Errors
    /// Returns the platform failure, or a decode error when the result is not a list of objects.
    pub fn fetch_section(
        &self,
        section: MetadataSection,
    ) -> Result<Option<Vec<JsonObject>>, PlatformError> {
        let args = json!({ "schema_name": self.schema });
        let value = self.rpc.call_procedure(section.procedure(), &args)?;
        Ok(decode_section_records(section, value)?)
    }

    fn fetch_optional(&self, section: MetadataSection) -> SectionFetch {
        match self.fetch_section(section) {
            Ok(Some(records)) => SectionFetch::Fetched(records),
            Ok(None) => SectionFetch::Skipped(format!("{} returned no data", section.procedure())),
            Err(err) => SectionFetch::Skipped(err.to_string()),
        }
    }

    /// Fetch all four sections in order. Only the table listing is required.
    ///
    /// # Errors
    /// Returns an error when the table listing cannot be fetched.
    pub fn fetch_metadata(&self) -> Result<(MetadataSnapshot, Vec<SkippedSection>)> {
        let tables = self
            .fetch_section(MetadataSection::Tables)
            .with_context(|| {
                format!("failed to fetch tables via {}", MetadataSection::Tables.procedure())
            })?
            .unwrap_or_default();
        let mut snapshot = MetadataSnapshot::new(tables);
        let mut skipped = Vec::new();

        for section in MetadataSection::ALL.into_iter().filter(|section| !section.is_required()) {
            match self.fetch_optional(section) {
                SectionFetch::Fetched(records) => snapshot.set_section(section, records),
                SectionFetch::Skipped(reason) => {
                    warn!(%section, %reason, "metadata section skipped");
                    skipped.push(SkippedSection { section, reason });
                }
            }
        }
        Ok((snapshot, skipped))
    }

    /// Fetch, save, and compare against the snapshot that was current before this run.
    ///
    /// The previous `latest.json` is read before the new snapshot replaces it, so the
    /// changelog reflects the difference between consecutive runs.
    ///
    /// # Errors
    /// Returns an error when the table listing fails (nothing is written) or when any
    /// snapshot or changelog write fails.
    pub fn extract_metadata(&self, at: OffsetDateTime) -> Result<ExtractReport> {
        let (snapshot, skipped) = self.fetch_metadata()?;
        let previous = self.history.load_latest();
        let saved = self.history.save(&snapshot, at)?;
        let changelog_entry = self.history.compare_snapshots(&snapshot, previous.as_ref(), at)?;

        info!(
            tables = snapshot.tables.len(),
            skipped = skipped.len(),
            changed = changelog_entry.as_ref().map_or(0, |entry| entry.changes.len()),
            "metadata extraction finished"
        );
        Ok(ExtractReport {
            snapshot_path: saved.snapshot_path,
            latest_path: saved.latest_path,
            table_count: snapshot.tables.len(),
            sections: snapshot.present_sections(),
            skipped,
            first_run: previous.is_none(),
            changelog_entry,
        })
    }
}
