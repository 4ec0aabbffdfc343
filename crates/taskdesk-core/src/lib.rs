use std::fmt::{Debug, Display, Formatter};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

pub const DASHBOARD_PATH: &str = "/dashboard";
pub const HOME_PATH: &str = "/";
pub const AUTH_CALLBACK_FAILED: &str = "auth_callback_failed";
pub const PROFILE_SAMPLE_ROWS: usize = 5;

/// One opaque row as returned by the hosted platform.
pub type JsonObject = Map<String, Value>;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    OnHold,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [Self; 5] =
        [Self::Pending, Self::InProgress, Self::Completed, Self::OnHold, Self::Cancelled];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::OnHold => "on_hold",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn is_completed(self) -> bool {
        self == Self::Completed
    }

    /// Status written by the dashboard checkbox: completed flips back to pending,
    /// every other status becomes completed.
    #[must_use]
    pub fn toggled(self) -> Self {
        if self.is_completed() {
            Self::Pending
        } else {
            Self::Completed
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Urgent,
}

impl TaskPriority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub created_by_id: Option<String>,
    #[serde(default)]
    pub assigned_to_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl Task {
    /// Decode one `tasks` row returned by the platform.
    ///
    /// Rows that only carry a `title` column are accepted; the value becomes `name`.
    ///
    /// # Errors
    /// Returns [`CoreError::Decode`] when the row is not an object or a field falls outside
    /// its domain, and [`CoreError::Validation`] when the identifier is blank.
    pub fn from_row(row: Value) -> Result<Self, CoreError> {
        let Value::Object(mut object) = row else {
            return Err(CoreError::Decode("task row MUST be a JSON object".to_string()));
        };
        if !object.contains_key("name") {
            if let Some(title) = object.remove("title") {
                object.insert("name".to_string(), title);
            }
        }

        let task: Self = serde_json::from_value(Value::Object(object))
            .map_err(|err| CoreError::Decode(format!("invalid task row: {err}")))?;
        if task.id.as_str().trim().is_empty() {
            return Err(CoreError::Validation("task id MUST be non-empty".to_string()));
        }
        Ok(task)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewTask {
    pub name: String,
}

impl NewTask {
    /// Build an insert payload from raw form input. Blank input yields `None`.
    #[must_use]
    pub fn from_input(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self { name: trimmed.to_string() })
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct StatusUpdate {
    pub status: TaskStatus,
}

/// Ordered task view held by the dashboard between requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct TaskList {
    tasks: Vec<Task>,
}

impl TaskList {
    #[must_use]
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }

    /// Decode every row, failing on the first invalid one.
    ///
    /// # Errors
    /// Returns the decode error of the first row that is not a valid task.
    pub fn from_rows(rows: Vec<Value>) -> Result<Self, CoreError> {
        let tasks = rows.into_iter().map(Task::from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(Self { tasks })
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Task] {
        &self.tasks
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|task| &task.id == id)
    }

    pub fn prepend(&mut self, task: Task) {
        self.tasks.insert(0, task);
    }

    /// Returns `false` when no task carries `id`.
    pub fn set_status(&mut self, id: &TaskId, status: TaskStatus) -> bool {
        match self.tasks.iter_mut().find(|task| &task.id == id) {
            Some(task) => {
                task.status = status;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &TaskId) -> Option<Task> {
        let index = self.tasks.iter().position(|task| &task.id == id)?;
        Some(self.tasks.remove(index))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

impl AuthUser {
    /// Decode the identity provider's user object.
    ///
    /// # Errors
    /// Returns [`CoreError::Decode`] for non-object payloads or a missing `id`.
    pub fn from_value(value: Value) -> Result<Self, CoreError> {
        let user: Self = serde_json::from_value(value)
            .map_err(|err| CoreError::Decode(format!("invalid user payload: {err}")))?;
        if user.id.trim().is_empty() {
            return Err(CoreError::Validation("user id MUST be non-empty".to_string()));
        }
        Ok(user)
    }
}

#[derive(Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Session {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub user: AuthUser,
}

impl Session {
    /// Decode a token response from the identity provider.
    ///
    /// # Errors
    /// Returns [`CoreError::Decode`] when required fields are missing and
    /// [`CoreError::Validation`] when the access token is blank.
    pub fn from_value(value: Value) -> Result<Self, CoreError> {
        let session: Self = serde_json::from_value(value)
            .map_err(|err| CoreError::Decode(format!("invalid session payload: {err}")))?;
        if session.access_token.trim().is_empty() {
            return Err(CoreError::Validation("access_token MUST be non-empty".to_string()));
        }
        Ok(session)
    }
}

impl Debug for Session {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"[redacted]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[redacted]"))
            .field("expires_at", &self.expires_at)
            .field("user", &self.user)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    SignedIn(Session),
    NoCode,
    Failed(String),
}

impl CallbackOutcome {
    #[must_use]
    pub fn redirect_path(&self) -> String {
        match self {
            Self::SignedIn(_) | Self::NoCode => DASHBOARD_PATH.to_string(),
            Self::Failed(_) => format!("{HOME_PATH}?error={AUTH_CALLBACK_FAILED}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetadataSection {
    Tables,
    Policies,
    Indexes,
    Security,
}

impl MetadataSection {
    pub const ALL: [Self; 4] = [Self::Tables, Self::Policies, Self::Indexes, Self::Security];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tables => "tables",
            Self::Policies => "policies",
            Self::Indexes => "indexes",
            Self::Security => "security",
        }
    }

    /// Remote procedure that returns this section.
    #[must_use]
    pub fn procedure(self) -> &'static str {
        match self {
            Self::Tables => "get_tables",
            Self::Policies => "get_policies",
            Self::Indexes => "get_indexes",
            Self::Security => "get_table_security",
        }
    }

    /// Only the table listing is required for a snapshot to be written.
    #[must_use]
    pub fn is_required(self) -> bool {
        self == Self::Tables
    }
}

impl Display for MetadataSection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time capture of schema metadata. Optional sections are absent when their
/// remote call failed, and absent sections are left out of the serialized form.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetadataSnapshot {
    pub tables: Vec<JsonObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policies: Option<Vec<JsonObject>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexes: Option<Vec<JsonObject>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<Vec<JsonObject>>,
}

impl MetadataSnapshot {
    #[must_use]
    pub fn new(tables: Vec<JsonObject>) -> Self {
        Self { tables, ..Self::default() }
    }

    #[must_use]
    pub fn section(&self, section: MetadataSection) -> Option<&[JsonObject]> {
        match section {
            MetadataSection::Tables => Some(&self.tables),
            MetadataSection::Policies => self.policies.as_deref(),
            MetadataSection::Indexes => self.indexes.as_deref(),
            MetadataSection::Security => self.security.as_deref(),
        }
    }

    pub fn set_section(&mut self, section: MetadataSection, records: Vec<JsonObject>) {
        match section {
            MetadataSection::Tables => self.tables = records,
            MetadataSection::Policies => self.policies = Some(records),
            MetadataSection::Indexes => self.indexes = Some(records),
            MetadataSection::Security => self.security = Some(records),
        }
    }

    #[must_use]
    pub fn present_sections(&self) -> Vec<MetadataSection> {
        MetadataSection::ALL.into_iter().filter(|section| self.section(*section).is_some()).collect()
    }
}

/// Validate a raw remote-procedure result as a sequence of records.
/// `null` means the platform returned nothing for the section.
///
/// # Errors
/// Returns [`CoreError::Decode`] when the result is not an array of JSON objects.
pub fn decode_section_records(
    section: MetadataSection,
    value: Value,
) -> Result<Option<Vec<JsonObject>>, CoreError> {
    match value {
        Value::Null => Ok(None),
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(index, item)| match item {
                Value::Object(object) => Ok(object),
                other => Err(CoreError::Decode(format!(
                    "{section} record {index} MUST be a JSON object, got {}",
                    ValueKind::of(&other).as_str()
                ))),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        other => Err(CoreError::Decode(format!(
            "{section} result MUST be an array, got {}",
            ValueKind::of(&other).as_str()
        ))),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Modified,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SectionChange {
    pub section: MetadataSection,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    pub details: String,
}

impl SectionChange {
    #[must_use]
    pub fn modified(section: MetadataSection) -> Self {
        Self {
            section,
            change_type: ChangeType::Modified,
            details: format!("Changes detected in {section}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChangelogEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub changes: Vec<SectionChange>,
}

/// Section-level comparison of a fresh snapshot against the previous one as read from disk.
///
/// `previous` is the raw JSON object, so a prior file holding rows outside the current
/// record shape still compares (and differs) instead of being discarded. Every section
/// present in `current` is serialized on both sides and compared as text; a section
/// missing from `previous` counts as modified. Sections only present in `previous` are
/// ignored. Row order is significant: the same rows returned in a different order are
/// reported as a modification.
///
/// # Errors
/// Returns [`CoreError::Encode`] when a section cannot be serialized.
pub fn diff_snapshots(
    current: &MetadataSnapshot,
    previous: &JsonObject,
) -> Result<Vec<SectionChange>, CoreError> {
    let mut changes = Vec::new();
    for section in current.present_sections() {
        let current_text = section_text(section, current.section(section))?;
        let previous_text = previous.get(section.as_str()).map(Value::to_string);
        if current_text != previous_text {
            changes.push(SectionChange::modified(section));
        }
    }
    Ok(changes)
}

fn section_text(
    section: MetadataSection,
    records: Option<&[JsonObject]>,
) -> Result<Option<String>, CoreError> {
    records
        .map(serde_json::to_string)
        .transpose()
        .map_err(|err| CoreError::Encode(format!("failed to serialize {section}: {err}")))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Null,
}

impl ValueKind {
    #[must_use]
    pub fn of(value: &Value) -> Self {
        match value {
            Value::String(_) => Self::String,
            Value::Number(_) => Self::Number,
            Value::Bool(_) => Self::Boolean,
            Value::Object(_) => Self::Object,
            Value::Array(_) => Self::Array,
            Value::Null => Self::Null,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Null => "null",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnProfile {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ValueKind,
    pub sample: Value,
    pub nullable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableProfile {
    pub name: String,
    pub total_rows: usize,
    pub columns: Vec<ColumnProfile>,
    pub sample_data: Vec<JsonObject>,
    pub has_data: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseStructure {
    pub tables: Vec<TableProfile>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub platform_url: String,
}

/// Describe a table from its rows. Columns, kinds and samples come from the first row;
/// a column is nullable when any row holds an explicit `null` for it.
#[must_use]
pub fn profile_table(name: &str, rows: &[JsonObject]) -> TableProfile {
    let columns = rows
        .first()
        .map(|first| {
            first
                .iter()
                .map(|(column, sample)| ColumnProfile {
                    name: column.clone(),
                    kind: ValueKind::of(sample),
                    sample: sample.clone(),
                    nullable: rows.iter().any(|row| row.get(column).is_some_and(Value::is_null)),
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    TableProfile {
        name: name.to_string(),
        total_rows: rows.len(),
        columns,
        sample_data: rows.iter().take(PROFILE_SAMPLE_ROWS).cloned().collect(),
        has_data: !rows.is_empty(),
    }
}
