use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use taskdesk_core::{profile_table, DatabaseStructure, JsonObject, TableProfile};
use taskdesk_platform::{PlatformError, TableGateway};
use time::OffsetDateTime;
use tracing::{info, warn};

pub const DEFAULT_INSPECT_TABLES: [&str; 2] = ["customers", "payments"];
pub const STRUCTURE_FILE: &str = "database_structure.json";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SkippedTable {
    pub table: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InspectionReport {
    pub structure: DatabaseStructure,
    pub skipped: Vec<SkippedTable>,
}

/// Profiles table contents with the project key.
pub struct DatabaseInspector {
    tables: Arc<dyn TableGateway>,
    platform_url: String,
}

impl DatabaseInspector {
    #[must_use]
    pub fn new(tables: Arc<dyn TableGateway>, platform_url: impl Into<String>) -> Self {
        Self { tables, platform_url: platform_url.into() }
    }

    /// # Errors
    /// Returns the platform failure, or a decode error when a row is not a JSON object.
    pub fn profile(&self, table: &str) -> Result<TableProfile, PlatformError> {
        let rows = self
            .tables
            .select(None, table, None)?
            .into_iter()
            .map(|row| match row {
                Value::Object(object) => Ok(object),
                other => Err(PlatformError::Decode(format!("row of {table} is not an object: {other}"))),
            })
            .collect::<Result<Vec<JsonObject>, _>>()?;
        Ok(profile_table(table, &rows))
    }

    /// Profile each table in order. Failing tables are logged and left out.
    #[must_use]
    pub fn inspect<S: AsRef<str>>(&self, table_names: &[S], at: OffsetDateTime) -> InspectionReport {
        let mut tables = Vec::new();
        let mut skipped = Vec::new();
        for name in table_names {
            let name = name.as_ref();
            match self.profile(name) {
                Ok(profile) => {
                    info!(
                        table = name,
                        total_rows = profile.total_rows,
                        columns = profile.columns.len(),
                        "table profiled"
                    );
                    tables.push(profile);
                }
                Err(err) => {
                    warn!(table = name, error = %err, "table skipped");
                    skipped.push(SkippedTable { table: name.to_string(), reason: err.to_string() });
                }
            }
        }
        InspectionReport {
            structure: DatabaseStructure { tables, timestamp: at, platform_url: self.platform_url.clone() },
            skipped,
        }
    }
}

/// Write `structure` as pretty JSON, replacing any existing file.
///
/// # Errors
/// Returns an error when serialization or the write fails.
pub fn write_structure(structure: &DatabaseStructure, path: &Path) -> Result<()> {
    let body = serde_json::to_vec_pretty(structure).context("failed to serialize database structure")?;
    fs::write(path, body).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use taskdesk_platform::fake::FakePlatform;
    use time::macros::datetime;

    use super::*;

    // Test IDs: TINS-101
    #[test]
    fn inspector_profiles_tables_and_skips_failures() -> Result<()> {
        let fake = Arc::new(
            FakePlatform::new()
                .with_rows(
                    "customers",
                    vec![
                        json!({ "id": 1, "email": "a@example.com" }),
                        json!({ "id": 2, "email": null }),
                    ],
                )
                .with_rows("payments", vec![]),
        );
        fake.fail_table(
            "invoices",
            PlatformError::Remote { status: 404, message: "relation \"invoices\" does not exist".to_string(), code: None },
        );
        let inspector = DatabaseInspector::new(fake, "https://demo.example.co");
        let report = inspector.inspect(&["customers", "payments", "invoices"], datetime!(2026-10-19 08:00:00 UTC));

        let names = report.structure.tables.iter().map(|table| table.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["customers", "payments"]);
        assert_eq!(report.structure.tables[0].total_rows, 2);
        assert!(!report.structure.tables[1].has_data);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].table, "invoices");

        let path = std::env::temp_dir().join(format!("taskdesk-structure-{}.json", ulid::Ulid::new()));
        write_structure(&report.structure, &path)?;
        let written: Value = serde_json::from_slice(&fs::read(&path)?)?;
        assert_eq!(written["platform_url"], "https://demo.example.co");
        assert_eq!(written["tables"][0]["columns"][1]["nullable"], true);
        assert_eq!(written["tables"][0]["columns"][0]["type"], "number");
        fs::remove_file(&path)?;
        Ok(())
    }
}
