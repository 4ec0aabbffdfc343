//! In-memory platform used by tests of the layers above the HTTP client.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use serde_json::{json, Value};
use taskdesk_core::{AuthUser, Session};
use url::Url;

use crate::{IdentityProvider, PlatformError, RowOrder, RpcGateway, TableGateway};

#[derive(Debug, Default)]
struct FakeState {
    users: HashMap<String, AuthUser>,
    auth_codes: HashMap<String, Session>,
    tables: BTreeMap<String, Vec<Value>>,
    table_failures: HashMap<String, PlatformError>,
    procedures: HashMap<String, Result<Value, PlatformError>>,
    calls: Vec<String>,
    next_id: u64,
}

/// Scriptable stand-in for the hosted platform.
///
/// Table rows are plain JSON values; inserts get a `fake-<n>` id and a `pending` status
/// when the row omits them. Every gateway call is recorded in [`FakePlatform::calls`].
#[derive(Debug, Default)]
pub struct FakePlatform {
    state: Mutex<FakeState>,
}

impl FakePlatform {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_user(self, access_token: &str, user: AuthUser) -> Self {
        self.edit(|state| {
            state.users.insert(access_token.to_string(), user);
        });
        self
    }

    /// Accept `auth_code` once, issuing `session` and registering its user.
    #[must_use]
    pub fn with_auth_code(self, auth_code: &str, session: Session) -> Self {
        self.edit(|state| {
            state.users.insert(session.access_token.clone(), session.user.clone());
            state.auth_codes.insert(auth_code.to_string(), session);
        });
        self
    }

    #[must_use]
    pub fn with_rows(self, table: &str, rows: Vec<Value>) -> Self {
        self.edit(|state| {
            state.tables.insert(table.to_string(), rows);
        });
        self
    }

    #[must_use]
    pub fn with_procedure(self, name: &str, result: Result<Value, PlatformError>) -> Self {
        self.set_procedure(name, result);
        self
    }

    pub fn set_procedure(&self, name: &str, result: Result<Value, PlatformError>) {
        self.edit(|state| {
            state.procedures.insert(name.to_string(), result);
        });
    }

    /// Make every operation on `table` fail with `error` until cleared.
    pub fn fail_table(&self, table: &str, error: PlatformError) {
        self.edit(|state| {
            state.table_failures.insert(table.to_string(), error);
        });
    }

    pub fn clear_failures(&self) {
        self.edit(|state| state.table_failures.clear());
    }

    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.read(|state| state.tables.get(table).cloned().unwrap_or_default())
    }

    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.read(|state| state.calls.clone())
    }

    fn edit(&self, apply: impl FnOnce(&mut FakeState)) {
        if let Ok(mut state) = self.state.lock() {
            apply(&mut state);
        }
    }

    fn read<T: Default>(&self, view: impl FnOnce(&FakeState) -> T) -> T {
        self.state.lock().map(|state| view(&state)).unwrap_or_default()
    }

    fn lock(&self, call: String) -> Result<MutexGuard<'_, FakeState>, PlatformError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| PlatformError::Transport("fake platform state poisoned".to_string()))?;
        state.calls.push(call);
        Ok(state)
    }

    fn open_table(
        &self,
        call: String,
        access_token: Option<&str>,
        table: &str,
    ) -> Result<MutexGuard<'_, FakeState>, PlatformError> {
        let state = self.lock(call)?;
        if let Some(token) = access_token {
            if !state.users.contains_key(token) {
                return Err(PlatformError::Unauthorized);
            }
        }
        if let Some(error) = state.table_failures.get(table) {
            return Err(error.clone());
        }
        Ok(state)
    }
}

fn row_id(row: &Value) -> Option<&str> {
    row.get("id").and_then(Value::as_str)
}

fn compare_column(left: &Value, right: &Value, order: &RowOrder) -> Ordering {
    let key = |row: &Value| match row.get(&order.column) {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text.clone()),
        Some(other) => Some(other.to_string()),
    };
    match (key(left), key(right)) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) if order.ascending => a.cmp(&b),
        (Some(a), Some(b)) => b.cmp(&a),
    }
}

impl IdentityProvider for FakePlatform {
    fn authorize_url(
        &self,
        provider: &str,
        redirect_to: &str,
        code_challenge: &str,
    ) -> Result<Url, PlatformError> {
        let mut url = Url::parse("https://fake.platform.test/auth/v1/authorize")
            .map_err(|err| PlatformError::Config(err.to_string()))?;
        url.query_pairs_mut()
            .append_pair("provider", provider)
            .append_pair("redirect_to", redirect_to)
            .append_pair("code_challenge", code_challenge)
            .append_pair("code_challenge_method", crate::pkce::CHALLENGE_METHOD);
        Ok(url)
    }

    fn exchange_code_for_session(
        &self,
        auth_code: &str,
        code_verifier: &str,
    ) -> Result<Session, PlatformError> {
        let mut state = self.lock(format!("exchange {auth_code}"))?;
        if code_verifier.is_empty() {
            return Err(PlatformError::Remote {
                status: 400,
                message: "code verifier should be non-empty".to_string(),
                code: Some("validation_failed".to_string()),
            });
        }
        state.auth_codes.remove(auth_code).ok_or_else(|| PlatformError::Remote {
            status: 400,
            message: "invalid flow state, no valid flow state found".to_string(),
            code: Some("flow_state_not_found".to_string()),
        })
    }

    fn get_user(&self, access_token: &str) -> Result<Option<AuthUser>, PlatformError> {
        let state = self.lock("get_user".to_string())?;
        Ok(state.users.get(access_token).cloned())
    }

    fn sign_out(&self, access_token: &str) -> Result<(), PlatformError> {
        let mut state = self.lock("sign_out".to_string())?;
        state.users.remove(access_token);
        Ok(())
    }
}

impl TableGateway for FakePlatform {
    fn select(
        &self,
        access_token: Option<&str>,
        table: &str,
        order: Option<&RowOrder>,
    ) -> Result<Vec<Value>, PlatformError> {
        let state = self.open_table(format!("select {table}"), access_token, table)?;
        let mut rows = state.tables.get(table).cloned().unwrap_or_default();
        if let Some(order) = order {
            rows.sort_by(|left, right| compare_column(left, right, order));
        }
        Ok(rows)
    }

    fn insert_returning(
        &self,
        access_token: Option<&str>,
        table: &str,
        row: &Value,
    ) -> Result<Value, PlatformError> {
        let mut state = self.open_table(format!("insert {table}"), access_token, table)?;
        let Value::Object(fields) = row else {
            return Err(PlatformError::Remote {
                status: 400,
                message: "insert payload must be an object".to_string(),
                code: Some("PGRST102".to_string()),
            });
        };
        state.next_id += 1;
        let mut stored = fields.clone();
        let id = format!("fake-{}", state.next_id);
        stored.entry("id").or_insert_with(|| json!(id));
        stored.entry("status").or_insert_with(|| json!("pending"));
        let stored = Value::Object(stored);
        state.tables.entry(table.to_string()).or_default().push(stored.clone());
        Ok(stored)
    }

    fn update_by_id(
        &self,
        access_token: Option<&str>,
        table: &str,
        id: &str,
        patch: &Value,
    ) -> Result<(), PlatformError> {
        let mut state = self.open_table(format!("update {table} {id}"), access_token, table)?;
        let Value::Object(changes) = patch else {
            return Err(PlatformError::Decode("patch must be an object".to_string()));
        };
        let rows = state.tables.entry(table.to_string()).or_default();
        for row in rows.iter_mut().filter(|row| row_id(row) == Some(id)) {
            if let Value::Object(fields) = row {
                for (key, value) in changes {
                    fields.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(())
    }

    fn delete_by_id(
        &self,
        access_token: Option<&str>,
        table: &str,
        id: &str,
    ) -> Result<(), PlatformError> {
        let mut state = self.open_table(format!("delete {table} {id}"), access_token, table)?;
        if let Some(rows) = state.tables.get_mut(table) {
            rows.retain(|row| row_id(row) != Some(id));
        }
        Ok(())
    }
}

impl RpcGateway for FakePlatform {
    fn call_procedure(&self, name: &str, args: &Value) -> Result<Value, PlatformError> {
        let state = self.lock(format!("rpc {name} {args}"))?;
        state.procedures.get(name).cloned().unwrap_or_else(|| {
            Err(PlatformError::Remote {
                status: 404,
                message: format!("Could not find the function public.{name}"),
                code: Some("PGRST202".to_string()),
            })
        })
    }
}
