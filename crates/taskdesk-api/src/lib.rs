use std::sync::Arc;

use serde::Serialize;
use taskdesk_core::{
    AuthUser, CallbackOutcome, NewTask, Session, StatusUpdate, Task, TaskId, TaskList, TaskStatus,
};
use taskdesk_platform::{IdentityProvider, PkcePair, PlatformError, RowOrder, TableGateway};
use tracing::{info, warn};
use url::Url;

mod inspector;
mod metadata;

pub use inspector::{
    write_structure, DatabaseInspector, InspectionReport, SkippedTable, DEFAULT_INSPECT_TABLES,
    STRUCTURE_FILE,
};
pub use metadata::{ExtractReport, MetadataTracker, SectionFetch, SkippedSection};

pub const API_CONTRACT_VERSION: &str = "api.v1";
pub const TASKS_TABLE: &str = "tasks";
pub const TASK_ORDER_COLUMN: &str = "due_date";

/// Failures surfaced to the dashboard. `Display` is the message shown to the user.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("You must be logged in to create tasks")]
    NotSignedIn,
    #[error("Failed to add task: {0}")]
    Add(String),
    #[error("{0}")]
    Load(String),
    #[error("{0}")]
    Update(String),
    #[error("{0}")]
    Delete(String),
    #[error("Task {0} is not on your dashboard")]
    UnknownTask(TaskId),
}

/// Redirect target plus the verifier the caller must keep until the callback.
#[derive(Debug, Clone)]
pub struct SignInStart {
    pub authorize_url: Url,
    pub pkce: PkcePair,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HealthStatus {
    pub api_contract_version: &'static str,
    pub status: &'static str,
}

/// Auth and task operations for one hosted project.
#[derive(Clone)]
pub struct TaskDeskApi {
    identity: Arc<dyn IdentityProvider>,
    tables: Arc<dyn TableGateway>,
}

impl TaskDeskApi {
    #[must_use]
    pub fn new(identity: Arc<dyn IdentityProvider>, tables: Arc<dyn TableGateway>) -> Self {
        Self { identity, tables }
    }

    #[must_use]
    pub fn health(&self) -> HealthStatus {
        HealthStatus { api_contract_version: API_CONTRACT_VERSION, status: "ok" }
    }

    /// Start an OAuth sign-in with a fresh PKCE pair.
    ///
    /// # Errors
    /// Returns an error when the authorize URL cannot be built.
    pub fn begin_sign_in(&self, provider: &str, redirect_to: &str) -> Result<SignInStart, PlatformError> {
        let pkce = PkcePair::generate();
        let authorize_url = self.identity.authorize_url(provider, redirect_to, pkce.challenge())?;
        info!(provider, "oauth sign-in started");
        Ok(SignInStart { authorize_url, pkce })
    }

    /// Resolve the OAuth callback. Exactly one redirect follows from the outcome.
    #[must_use]
    pub fn complete_sign_in(&self, code: Option<&str>, code_verifier: Option<&str>) -> CallbackOutcome {
        let Some(code) = code.filter(|code| !code.is_empty()) else {
            return CallbackOutcome::NoCode;
        };
        let Some(code_verifier) = code_verifier else {
            warn!("oauth callback arrived without a pending sign-in");
            return CallbackOutcome::Failed("no sign-in in progress".to_string());
        };
        match self.identity.exchange_code_for_session(code, code_verifier) {
            Ok(session) => {
                info!(user_id = %session.user.id, "oauth sign-in completed");
                CallbackOutcome::SignedIn(session)
            }
            Err(err) => {
                warn!(error = %err, "oauth code exchange failed");
                CallbackOutcome::Failed(err.to_string())
            }
        }
    }

    /// # Errors
    /// Returns transport or decode failures; an expired token is `Ok(None)`.
    pub fn current_user(&self, session: &Session) -> Result<Option<AuthUser>, PlatformError> {
        self.identity.get_user(&session.access_token)
    }

    /// # Errors
    /// Returns the platform failure when the session could not be revoked.
    pub fn sign_out(&self, session: &Session) -> Result<(), PlatformError> {
        self.identity.sign_out(&session.access_token)?;
        info!(user_id = %session.user.id, "signed out");
        Ok(())
    }

    /// Tasks visible to the signed-in user, soonest due date first.
    ///
    /// # Errors
    /// Returns [`TaskError::Load`] with the platform message, or when a row fails to decode.
    pub fn list_tasks(&self, session: &Session) -> Result<TaskList, TaskError> {
        let rows = self
            .tables
            .select(
                Some(&session.access_token),
                TASKS_TABLE,
                Some(&RowOrder::ascending(TASK_ORDER_COLUMN)),
            )
            .map_err(|err| TaskError::Load(err.to_string()))?;
        TaskList::from_rows(rows).map_err(|err| TaskError::Load(err.to_string()))
    }

    /// Insert a task named by `raw_name` and prepend it to `list`.
    /// Blank input is ignored and yields `Ok(None)`.
    ///
    /// # Errors
    /// Returns [`TaskError::NotSignedIn`] without a session and [`TaskError::Add`] when the
    /// insert is rejected.
    pub fn create_task(
        &self,
        session: Option<&Session>,
        list: &mut TaskList,
        raw_name: &str,
    ) -> Result<Option<Task>, TaskError> {
        let Some(new_task) = NewTask::from_input(raw_name) else {
            return Ok(None);
        };
        let session = session.ok_or(TaskError::NotSignedIn)?;
        let row = serde_json::to_value(&new_task).map_err(|err| TaskError::Add(err.to_string()))?;
        let created = self
            .tables
            .insert_returning(Some(&session.access_token), TASKS_TABLE, &row)
            .map_err(|err| TaskError::Add(err.to_string()))?;
        let task = Task::from_row(created).map_err(|err| TaskError::Add(err.to_string()))?;
        info!(task_id = %task.id, "task created");
        list.prepend(task.clone());
        Ok(Some(task))
    }

    /// Flip a task between completed and pending, returning the stored status.
    ///
    /// # Errors
    /// Returns [`TaskError::UnknownTask`] when `id` is not in `list` and
    /// [`TaskError::Update`] when the platform rejects the change.
    pub fn toggle_task(
        &self,
        session: &Session,
        list: &mut TaskList,
        id: &TaskId,
    ) -> Result<TaskStatus, TaskError> {
        let current = list.get(id).ok_or_else(|| TaskError::UnknownTask(id.clone()))?.status;
        let next = current.toggled();
        let patch = serde_json::to_value(StatusUpdate { status: next })
            .map_err(|err| TaskError::Update(err.to_string()))?;
        self.tables
            .update_by_id(Some(&session.access_token), TASKS_TABLE, id.as_str(), &patch)
            .map_err(|err| TaskError::Update(err.to_string()))?;
        list.set_status(id, next);
        info!(task_id = %id, status = next.as_str(), "task status updated");
        Ok(next)
    }

    /// # Errors
    /// Returns [`TaskError::Delete`] when the platform rejects the delete; `list` is then
    /// left unchanged.
    pub fn delete_task(
        &self,
        session: &Session,
        list: &mut TaskList,
        id: &TaskId,
    ) -> Result<(), TaskError> {
        self.tables
            .delete_by_id(Some(&session.access_token), TASKS_TABLE, id.as_str())
            .map_err(|err| TaskError::Delete(err.to_string()))?;
        list.remove(id);
        info!(task_id = %id, "task deleted");
        Ok(())
    }
}
