use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::Value;
use taskdesk_core::{diff_snapshots, ChangelogEntry, JsonObject, MetadataSnapshot, SectionChange};
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};
use tracing::{info, warn};

pub const DEFAULT_HISTORY_DIR: &str = "db_metadata_history";
pub const LATEST_FILE: &str = "latest.json";
pub const CHANGELOG_FILE: &str = "changelog.json";
pub const SNAPSHOT_PREFIX: &str = "db_metadata_";
const MAX_NAME_ATTEMPTS: usize = 1000;

/// Paths written by one [`SnapshotHistory::save`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedSnapshot {
    pub snapshot_path: PathBuf,
    pub latest_path: PathBuf,
}

/// Directory of metadata snapshots: one immutable file per run, a rolling
/// `latest.json`, and an append-only `changelog.json`.
#[derive(Debug, Clone)]
pub struct SnapshotHistory {
    root: PathBuf,
}

impl SnapshotHistory {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn latest_path(&self) -> PathBuf {
        self.root.join(LATEST_FILE)
    }

    #[must_use]
    pub fn changelog_path(&self) -> PathBuf {
        self.root.join(CHANGELOG_FILE)
    }

    /// Write `snapshot` under a timestamped name and as `latest.json`.
    ///
    /// The timestamped file is never overwritten: a name already taken within the same
    /// millisecond gets a `-N` suffix.
    ///
    /// # Errors
    /// Returns an error when the directory cannot be created or either file cannot be written.
    pub fn save(&self, snapshot: &MetadataSnapshot, at: OffsetDateTime) -> Result<SavedSnapshot> {
        fs::create_dir_all(&self.root).with_context(|| {
            format!("failed to create history directory {}", self.root.display())
        })?;

        let body = serde_json::to_vec_pretty(snapshot).context("failed to serialize metadata snapshot")?;
        let stem = snapshot_stem(at)?;
        let snapshot_path = self.write_new_file(&stem, &body)?;

        let latest_path = self.latest_path();
        fs::write(&latest_path, &body)
            .with_context(|| format!("failed to write {}", latest_path.display()))?;

        info!(
            snapshot = %snapshot_path.display(),
            tables = snapshot.tables.len(),
            "metadata snapshot saved"
        );
        Ok(SavedSnapshot { snapshot_path, latest_path })
    }

    fn write_new_file(&self, stem: &str, body: &[u8]) -> Result<PathBuf> {
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = if attempt == 0 {
                format!("{stem}.json")
            } else {
                format!("{stem}-{attempt}.json")
            };
            let path = self.root.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(body)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    return Ok(path);
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to create {}", path.display()));
                }
            }
        }
        bail!("no free snapshot file name for {stem} in {}", self.root.display())
    }

    /// Read `latest.json` as a raw JSON object. A missing or unreadable file, or one that
    /// is not a JSON object, means there is no prior snapshot. Section contents are kept
    /// as written so rows of any shape still take part in the comparison.
    #[must_use]
    pub fn load_latest(&self) -> Option<JsonObject> {
        let path = self.latest_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "no previous metadata snapshot");
                return None;
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "previous metadata snapshot is unreadable");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(Value::Object(previous)) => Some(previous),
            Ok(_) => {
                warn!(path = %path.display(), "previous metadata snapshot is not a JSON object");
                None
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "previous metadata snapshot is not valid JSON");
                None
            }
        }
    }

    /// Diff `current` against whatever `latest.json` holds now and record any changes.
    ///
    /// # Errors
    /// Returns an error only when the changelog cannot be written.
    pub fn compare_with_previous(
        &self,
        current: &MetadataSnapshot,
        at: OffsetDateTime,
    ) -> Result<Option<ChangelogEntry>> {
        let previous = self.load_latest();
        self.compare_snapshots(current, previous.as_ref(), at)
    }

    /// Diff `current` against an already-loaded `previous` and record any changes.
    /// `None` for `previous` is a first run and records nothing.
    ///
    /// # Errors
    /// Returns an error when a section cannot be serialized or the changelog cannot be written.
    pub fn compare_snapshots(
        &self,
        current: &MetadataSnapshot,
        previous: Option<&JsonObject>,
        at: OffsetDateTime,
    ) -> Result<Option<ChangelogEntry>> {
        let Some(previous) = previous else {
            return Ok(None);
        };
        let changes = diff_snapshots(current, previous).context("failed to diff metadata snapshots")?;
        if changes.is_empty() {
            info!("no metadata changes since previous snapshot");
            return Ok(None);
        }
        self.record_changes(changes, at).map(Some)
    }

    /// Append one entry to `changelog.json`, rewriting the whole file.
    ///
    /// # Errors
    /// Returns an error when the directory or changelog file cannot be written.
    pub fn record_changes(
        &self,
        changes: Vec<SectionChange>,
        at: OffsetDateTime,
    ) -> Result<ChangelogEntry> {
        let entry = ChangelogEntry { timestamp: at.to_offset(UtcOffset::UTC), changes };
        let mut changelog = self.load_changelog_values();
        changelog.push(serde_json::to_value(&entry).context("failed to serialize changelog entry")?);

        fs::create_dir_all(&self.root).with_context(|| {
            format!("failed to create history directory {}", self.root.display())
        })?;
        let path = self.changelog_path();
        let body = serde_json::to_vec_pretty(&changelog).context("failed to serialize changelog")?;
        fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))?;

        for change in &entry.changes {
            info!(section = %change.section, "{}", change.details);
        }
        Ok(entry)
    }

    /// Entries of `changelog.json`, oldest first. Missing or corrupt files read as empty,
    /// and entries this version cannot decode are skipped.
    #[must_use]
    pub fn load_changelog(&self) -> Vec<ChangelogEntry> {
        self.load_changelog_values()
            .into_iter()
            .filter_map(|raw| match serde_json::from_value(raw) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!(error = %err, "skipping unrecognized changelog entry");
                    None
                }
            })
            .collect()
    }

    /// Raw changelog entries. Only a missing file, a JSON syntax error, or a non-array
    /// document reads as empty; entries of any shape are kept for the rewrite.
    fn load_changelog_values(&self) -> Vec<Value> {
        let path = self.changelog_path();
        let Ok(bytes) = fs::read(&path) else {
            return Vec::new();
        };
        match serde_json::from_slice(&bytes) {
            Ok(Value::Array(entries)) => entries,
            Ok(_) => {
                warn!(path = %path.display(), "changelog is not a JSON array; starting a new one");
                Vec::new()
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "changelog is corrupt; starting a new one");
                Vec::new()
            }
        }
    }

    /// Timestamped snapshot files, oldest first.
    ///
    /// # Errors
    /// Returns an error when the directory exists but cannot be listed.
    pub fn list_snapshots(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to list {}", self.root.display()));
            }
        };

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to list {}", self.root.display()))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(SNAPSHOT_PREFIX) && name.ends_with(".json") {
                paths.push(entry.path());
            }
        }
        paths.sort();
        Ok(paths)
    }
}

impl Default for SnapshotHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_DIR)
    }
}

/// `db_metadata_<UTC ISO timestamp with ':' and '.' replaced by '-'>`.
fn snapshot_stem(at: OffsetDateTime) -> Result<String> {
    let stamp = at
        .to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]-[minute]-[second]-[subsecond digits:3]Z"
        ))
        .context("failed to format snapshot timestamp")?;
    Ok(format!("{SNAPSHOT_PREFIX}{stamp}"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use taskdesk_core::{JsonObject, MetadataSection};
    use time::macros::datetime;

    use super::*;

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{prefix}-{}", ulid::Ulid::new()))
    }

    fn object(value: Value) -> JsonObject {
        match value {
            Value::Object(object) => object,
            other => panic!("fixture must be an object, got {other}"),
        }
    }

    fn raw(snapshot: &MetadataSnapshot) -> JsonObject {
        match serde_json::to_value(snapshot) {
            Ok(Value::Object(object)) => object,
            other => panic!("snapshot should serialize to an object, got {other:?}"),
        }
    }

    fn snapshot(tables: &[&str]) -> MetadataSnapshot {
        MetadataSnapshot::new(
            tables
                .iter()
                .map(|name| object(json!({ "table_name": name, "row_estimate": 0 })))
                .collect(),
        )
    }

    // Test IDs: THIS-001
    #[test]
    fn snapshot_names_replace_separators_in_iso_timestamp() -> Result<()> {
        let stem = snapshot_stem(datetime!(2026-10-19 12:30:05.123 UTC))?;
        assert_eq!(stem, "db_metadata_2026-10-19T12-30-05-123Z");
        let shifted = snapshot_stem(datetime!(2026-10-19 14:30:05.123 +02:00))?;
        assert_eq!(shifted, stem);
        Ok(())
    }

    // Test IDs: THIS-002
    #[test]
    fn saved_snapshot_round_trips_through_latest() -> Result<()> {
        let history = SnapshotHistory::new(unique_temp_dir("taskdesk-history-roundtrip"));
        let mut original = snapshot(&["tasks", "profiles"]);
        original.set_section(MetadataSection::Policies, vec![object(json!({ "policyname": "owner" }))]);

        let saved = history.save(&original, datetime!(2026-10-19 12:30:05.123 UTC))?;
        assert!(saved.snapshot_path.exists());
        assert_eq!(history.load_latest(), Some(raw(&original)));

        let text = fs::read_to_string(&saved.latest_path)?;
        assert!(text.contains("\n  \"tables\""), "latest.json should use 2-space indent");
        fs::remove_dir_all(history.root())?;
        Ok(())
    }

    // Test IDs: THIS-003
    #[test]
    fn same_millisecond_saves_never_overwrite() -> Result<()> {
        let history = SnapshotHistory::new(unique_temp_dir("taskdesk-history-collision"));
        let at = datetime!(2026-10-19 12:30:05.123 UTC);
        let first = history.save(&snapshot(&["a"]), at)?;
        let second = history.save(&snapshot(&["a", "b"]), at)?;
        assert_ne!(first.snapshot_path, second.snapshot_path);
        assert!(second
            .snapshot_path
            .to_string_lossy()
            .ends_with("db_metadata_2026-10-19T12-30-05-123Z-1.json"));
        assert_eq!(history.list_snapshots()?.len(), 2);
        fs::remove_dir_all(history.root())?;
        Ok(())
    }

    // Test IDs: THIS-004
    #[test]
    fn first_run_records_no_changes() -> Result<()> {
        let history = SnapshotHistory::new(unique_temp_dir("taskdesk-history-first"));
        assert_eq!(history.load_latest(), None);
        let entry = history.compare_with_previous(&snapshot(&["a"]), OffsetDateTime::now_utc())?;
        assert_eq!(entry, None);
        assert!(!history.changelog_path().exists());
        Ok(())
    }

    // Test IDs: THIS-005
    #[test]
    fn changed_sections_are_appended_to_changelog() -> Result<()> {
        let history = SnapshotHistory::new(unique_temp_dir("taskdesk-history-append"));
        history.save(&snapshot(&["a"]), datetime!(2026-10-19 12:00:00 UTC))?;

        let first = history.compare_with_previous(&snapshot(&["a", "b"]), datetime!(2026-10-19 12:05:00 UTC))?;
        let first = first.unwrap_or_else(|| panic!("added table should be recorded"));
        assert_eq!(first.changes.len(), 1);
        assert_eq!(first.changes[0].section, MetadataSection::Tables);

        let unchanged = history.compare_with_previous(&snapshot(&["a"]), datetime!(2026-10-19 12:10:00 UTC))?;
        assert_eq!(unchanged, None);

        let previous = raw(&snapshot(&["a"]));
        history.compare_snapshots(&snapshot(&["c"]), Some(&previous), datetime!(2026-10-19 12:15:00 UTC))?;
        let changelog = history.load_changelog();
        assert_eq!(changelog.len(), 2);
        assert_eq!(changelog[0], first);

        let raw: Value = serde_json::from_slice(&fs::read(history.changelog_path())?)?;
        assert_eq!(raw[0]["changes"][0]["type"], "modified");
        assert_eq!(raw[0]["changes"][0]["details"], "Changes detected in tables");
        assert_eq!(raw[0]["timestamp"], "2026-10-19T12:05:00Z");
        fs::remove_dir_all(history.root())?;
        Ok(())
    }

    // Test IDs: THIS-006
    #[test]
    fn corrupt_files_read_as_absent() -> Result<()> {
        let history = SnapshotHistory::new(unique_temp_dir("taskdesk-history-corrupt"));
        fs::create_dir_all(history.root())?;
        fs::write(history.latest_path(), b"{ not json")?;
        fs::write(history.changelog_path(), b"[ truncated")?;

        assert_eq!(history.load_latest(), None);
        assert!(history.load_changelog().is_empty());

        let entry = history.record_changes(
            vec![SectionChange::modified(MetadataSection::Indexes)],
            datetime!(2026-10-19 12:00:00 UTC),
        )?;
        assert_eq!(history.load_changelog(), vec![entry]);
        fs::remove_dir_all(history.root())?;
        Ok(())
    }

    // Test IDs: THIS-007
    #[test]
    fn snapshot_listing_skips_rolling_files() -> Result<()> {
        let history = SnapshotHistory::new(unique_temp_dir("taskdesk-history-list"));
        assert!(history.list_snapshots()?.is_empty());
        history.save(&snapshot(&["a"]), datetime!(2026-10-19 12:00:00 UTC))?;
        history.save(&snapshot(&["a"]), datetime!(2026-10-18 12:00:00 UTC))?;
        history.record_changes(
            vec![SectionChange::modified(MetadataSection::Tables)],
            datetime!(2026-10-19 12:00:00 UTC),
        )?;

        let names = history
            .list_snapshots()?
            .iter()
            .filter_map(|path| path.file_name().map(|name| name.to_string_lossy().into_owned()))
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "db_metadata_2026-10-18T12-00-00-000Z.json".to_string(),
                "db_metadata_2026-10-19T12-00-00-000Z.json".to_string(),
            ]
        );
        fs::remove_dir_all(history.root())?;
        Ok(())
    }

    // Test IDs: THIS-008
    #[test]
    fn appending_keeps_entries_this_version_cannot_decode() -> Result<()> {
        let history = SnapshotHistory::new(unique_temp_dir("taskdesk-history-foreign"));
        fs::create_dir_all(history.root())?;
        let existing = json!([
            {
                "timestamp": "2026-10-18T09:00:00Z",
                "changes": [{ "section": "tables", "type": "modified", "details": "Changes detected in tables" }]
            },
            {
                "timestamp": "2026-10-18T10:00:00Z",
                "changes": [{ "section": "views", "type": "added", "details": "Changes detected in views" }]
            }
        ]);
        fs::write(history.changelog_path(), serde_json::to_vec_pretty(&existing)?)?;
        assert_eq!(history.load_changelog().len(), 1);

        history.record_changes(
            vec![SectionChange::modified(MetadataSection::Tables)],
            datetime!(2026-10-19 12:00:00 UTC),
        )?;

        let raw: Value = serde_json::from_slice(&fs::read(history.changelog_path())?)?;
        let entries = raw.as_array().map(Vec::as_slice).unwrap_or_default();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1], existing[1]);
        assert_eq!(entries[2]["timestamp"], "2026-10-19T12:00:00Z");
        assert_eq!(history.load_changelog().len(), 2);
        fs::remove_dir_all(history.root())?;
        Ok(())
    }

    // Test IDs: THIS-009
    #[test]
    fn previous_snapshot_with_foreign_rows_still_records_changes() -> Result<()> {
        let history = SnapshotHistory::new(unique_temp_dir("taskdesk-history-foreign-latest"));
        fs::create_dir_all(history.root())?;
        fs::write(history.latest_path(), br#"{ "tables": ["a", 7], "policies": [] }"#)?;

        let previous = history.load_latest().unwrap_or_else(|| panic!("object snapshot should load"));
        assert_eq!(previous.get("tables"), Some(&json!(["a", 7])));

        let entry = history.compare_with_previous(&snapshot(&["a"]), datetime!(2026-10-19 12:00:00 UTC))?;
        let entry = entry.unwrap_or_else(|| panic!("changed tables should be recorded"));
        assert_eq!(entry.changes, vec![SectionChange::modified(MetadataSection::Tables)]);

        fs::write(history.latest_path(), b"[1, 2]")?;
        assert_eq!(history.load_latest(), None);
        fs::remove_dir_all(history.root())?;
        Ok(())
    }
}
