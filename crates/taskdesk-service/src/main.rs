use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Form, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::cookie::CookieJar;
use clap::Parser;
use serde::{Deserialize, Serialize};
use taskdesk_api::{HealthStatus, TaskDeskApi, TaskError, API_CONTRACT_VERSION};
use taskdesk_core::{
    CallbackOutcome, Session, Task, TaskId, TaskList, TaskStatus, DASHBOARD_PATH, HOME_PATH,
};
use taskdesk_platform::{
    PlatformClient, PlatformConfig, DEFAULT_OAUTH_PROVIDER, DEFAULT_SCHEMA, DEFAULT_TIMEOUT_SECS,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

mod pages;
mod sessions;

use sessions::{clear_session_cookie, issue_session_id, session_id, BrowserSession, SessionStore};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const CALLBACK_PATH: &str = "/auth/callback";

#[derive(Clone)]
struct ServiceState {
    api: TaskDeskApi,
    sessions: SessionStore,
    public_url: Url,
    provider: String,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

/// Failure rendered as an HTML error page.
#[derive(Debug, Clone)]
struct PageError {
    status: StatusCode,
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct HomeQuery {
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DashboardQuery {
    #[serde(default)]
    refresh: bool,
}

#[derive(Debug, Deserialize)]
struct NewTaskForm {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Parser)]
#[command(name = "taskdesk-service")]
#[command(about = "TaskDesk web application")]
struct Args {
    #[arg(long, env = "TASKDESK_PLATFORM_URL")]
    platform_url: String,
    #[arg(long, env = "TASKDESK_ANON_KEY", hide_env_values = true)]
    anon_key: String,
    #[arg(long, env = "TASKDESK_SCHEMA", default_value = DEFAULT_SCHEMA)]
    schema: String,
    #[arg(long, env = "TASKDESK_BIND", default_value = "127.0.0.1:3000")]
    bind: SocketAddr,
    #[arg(long, env = "TASKDESK_PUBLIC_URL", default_value = "http://localhost:3000")]
    public_url: Url,
    #[arg(long, env = "TASKDESK_OAUTH_PROVIDER", default_value = DEFAULT_OAUTH_PROVIDER)]
    oauth_provider: String,
    #[arg(long = "timeout", env = "TASKDESK_HTTP_TIMEOUT_SECS", default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout_secs: u64,
}

impl IntoResponse for PageError {
    fn into_response(self) -> Response {
        (self.status, Html(pages::error_page(&self.message))).into_response()
    }
}

impl PageError {
    fn upstream(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_GATEWAY, message: message.into() }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, message: message.into() }
    }
}

impl ServiceState {
    fn callback_url(&self) -> Result<Url, PageError> {
        self.public_url
            .join(CALLBACK_PATH)
            .map_err(|err| PageError::internal(format!("invalid public url: {err}")))
    }

    /// Id of a live entry for this browser, or a freshly issued one. Cookie values the
    /// store does not know are replaced rather than adopted.
    async fn claim_session_id(&self, jar: CookieJar) -> (CookieJar, String) {
        if let Some(id) = session_id(&jar) {
            if self.sessions.get(&id).await.is_some() {
                return (jar, id);
            }
        }
        issue_session_id(jar)
    }

    async fn signed_in(&self, jar: &CookieJar) -> Option<(String, Session)> {
        let id = session_id(jar)?;
        let session = self.sessions.get(&id).await?.session?;
        Some((id, session))
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

/// Run a blocking platform call off the async runtime.
async fn blocking<T, F>(work: F) -> Result<T, PageError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| PageError::internal(format!("background task failed: {err}")))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/auth/signin", post(sign_in))
        .route(CALLBACK_PATH, get(auth_callback))
        .route("/auth/signout", post(sign_out))
        .route(DASHBOARD_PATH, get(dashboard))
        .route("/tasks", post(create_task))
        .route("/tasks/:id/toggle", post(toggle_task))
        .route("/tasks/:id/delete", post(delete_task))
        .route("/ping", get(ping))
        .route("/v1/health", get(health))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("taskdesk_service=info,taskdesk_api=info,warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = PlatformConfig::new(&args.platform_url, args.anon_key)
        .context("invalid platform configuration")?
        .with_schema(args.schema)
        .with_timeout_secs(args.timeout_secs);
    let client = Arc::new(PlatformClient::new(config));
    let state = ServiceState {
        api: TaskDeskApi::new(client.clone(), client),
        sessions: SessionStore::default(),
        public_url: args.public_url,
        provider: args.oauth_provider,
    };

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    info!(bind = %args.bind, "taskdesk service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn ping() -> &'static str {
    "pong"
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthStatus>> {
    Json(envelope(state.api.health()))
}

async fn home(
    State(state): State<ServiceState>,
    jar: CookieJar,
    Query(query): Query<HomeQuery>,
) -> Html<String> {
    let seen = match session_id(&jar) {
        Some(id) => {
            state
                .sessions
                .edit(&id, |entry| {
                    (entry.session.as_ref().map(|session| session.user.clone()), entry.flash.take())
                })
                .await
        }
        None => None,
    };
    let (user, flash) = seen.unwrap_or_default();
    Html(pages::home_page(user.as_ref(), query.error.as_deref(), flash.as_deref()))
}

async fn sign_in(State(state): State<ServiceState>, jar: CookieJar) -> Result<Response, PageError> {
    let redirect_to = state.callback_url()?;
    let api = state.api.clone();
    let provider = state.provider.clone();
    let start = blocking(move || api.begin_sign_in(&provider, redirect_to.as_str()))
        .await?
        .map_err(|err| PageError::upstream(err.to_string()))?;

    let (jar, id) = state.claim_session_id(jar).await;
    let verifier = start.pkce.into_verifier();
    state.sessions.upsert(&id, |entry| entry.pending_verifier = Some(verifier)).await;
    Ok((jar, Redirect::to(start.authorize_url.as_str())).into_response())
}

async fn auth_callback(
    State(state): State<ServiceState>,
    jar: CookieJar,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, PageError> {
    if let Some(error) = query.error.as_deref() {
        warn!(error, description = query.error_description.as_deref().unwrap_or(""), "provider returned an error");
    }
    let id = session_id(&jar);
    let verifier = match id.as_deref() {
        Some(id) => state.sessions.edit(id, |entry| entry.pending_verifier.take()).await.flatten(),
        None => None,
    };

    let api = state.api.clone();
    let code = query.code;
    let outcome = blocking(move || api.complete_sign_in(code.as_deref(), verifier.as_deref())).await?;
    let target = outcome.redirect_path();
    if let (CallbackOutcome::SignedIn(session), Some(id)) = (outcome, id.as_deref()) {
        state
            .sessions
            .edit(id, |entry| {
                entry.session = Some(session);
                entry.tasks = None;
            })
            .await;
    }
    Ok(Redirect::to(&target).into_response())
}

async fn sign_out(State(state): State<ServiceState>, jar: CookieJar) -> Result<Response, PageError> {
    if let Some(id) = session_id(&jar) {
        if let Some(session) = state.sessions.remove(&id).await.and_then(|entry| entry.session) {
            let api = state.api.clone();
            if let Err(err) = blocking(move || api.sign_out(&session)).await? {
                warn!(error = %err, "platform sign-out failed; local session cleared");
            }
        }
    }
    Ok((clear_session_cookie(jar), Redirect::to(HOME_PATH)).into_response())
}

async fn dashboard(
    State(state): State<ServiceState>,
    jar: CookieJar,
    Query(query): Query<DashboardQuery>,
) -> Result<Response, PageError> {
    let Some((id, session)) = state.signed_in(&jar).await else {
        return Ok(Redirect::to(HOME_PATH).into_response());
    };

    let api = state.api.clone();
    let checked = session.clone();
    let user = blocking(move || api.current_user(&checked))
        .await?
        .map_err(|err| PageError::upstream(err.to_string()))?;
    let Some(user) = user else {
        info!("session no longer valid; signing out locally");
        state.sessions.remove(&id).await;
        return Ok((clear_session_cookie(jar), Redirect::to(HOME_PATH)).into_response());
    };

    let (cached, mut flash) = state
        .sessions
        .edit(&id, |entry| (entry.tasks.clone(), entry.flash.take()))
        .await
        .unwrap_or_default();
    let tasks = match cached {
        Some(tasks) if !query.refresh => tasks,
        _ => {
            let api = state.api.clone();
            match blocking(move || api.list_tasks(&session)).await? {
                Ok(tasks) => {
                    let stored = tasks.clone();
                    state.sessions.edit(&id, |entry| entry.tasks = Some(stored)).await;
                    tasks
                }
                Err(err) => {
                    warn!(error = %err, "failed to load tasks");
                    flash = Some(err.to_string());
                    TaskList::default()
                }
            }
        }
    };
    Ok(Html(pages::dashboard_page(&user, &tasks, flash.as_deref())).into_response())
}

/// A successful task action, replayed onto the browser's cached list.
#[derive(Debug, Clone)]
enum TaskChange {
    Created(Task),
    Status(TaskId, TaskStatus),
    Removed(TaskId),
}

impl TaskChange {
    fn apply(self, tasks: &mut TaskList) {
        match self {
            Self::Created(task) => tasks.prepend(task),
            Self::Status(id, status) => {
                tasks.set_status(&id, status);
            }
            Self::Removed(id) => {
                tasks.remove(&id);
            }
        }
    }
}

/// Outcome of a task action. `loaded` is a list fetched during the action with the
/// change already applied; it only seeds a browser that has no cached list.
#[derive(Debug, Default)]
struct Mutation {
    loaded: Option<TaskList>,
    change: Option<TaskChange>,
    error: Option<TaskError>,
}

impl Mutation {
    fn failed(error: TaskError) -> Self {
        Self { error: Some(error), ..Self::default() }
    }

    /// Apply to the entry as it is when the action finishes, so overlapping actions from
    /// one browser each land on the cached list.
    fn record(self, entry: &mut BrowserSession) {
        if let Some(current) = entry.tasks.as_mut() {
            if let Some(change) = self.change {
                change.apply(current);
            }
        } else if let Some(loaded) = self.loaded {
            entry.tasks = Some(loaded);
        }
        if let Some(error) = self.error {
            entry.flash = Some(error.to_string());
        }
    }
}

async fn mutate_tasks<F>(state: &ServiceState, jar: CookieJar, work: F) -> Result<Response, PageError>
where
    F: FnOnce(&TaskDeskApi, Option<&Session>, Option<TaskList>) -> Mutation + Send + 'static,
{
    let known = match session_id(&jar) {
        Some(id) => state.sessions.get(&id).await.map(|entry| (id, entry)),
        None => None,
    };
    let (session, cached) = known
        .as_ref()
        .map(|(_, entry)| (entry.session.clone(), entry.tasks.clone()))
        .unwrap_or_default();
    let target = if session.is_some() { DASHBOARD_PATH } else { HOME_PATH };

    let api = state.api.clone();
    let mutation = blocking(move || work(&api, session.as_ref(), cached)).await?;
    let jar = match known {
        Some((id, _)) => {
            state.sessions.edit(&id, |entry| mutation.record(entry)).await;
            jar
        }
        // A new entry is only worth creating to carry an error message to the next page.
        None if mutation.error.is_some() => {
            let (jar, id) = issue_session_id(jar);
            state.sessions.upsert(&id, |entry| mutation.record(entry)).await;
            jar
        }
        None => jar,
    };
    Ok((jar, Redirect::to(target)).into_response())
}

/// Run `action` against the cached list, loading it first when nothing is cached so id
/// lookups see the current rows. Signed-out browsers are left untouched.
fn act_on_list(
    api: &TaskDeskApi,
    session: Option<&Session>,
    cached: Option<TaskList>,
    action: impl FnOnce(&TaskDeskApi, &Session, &mut TaskList) -> Result<TaskChange, TaskError>,
) -> Mutation {
    let Some(session) = session else {
        return Mutation::default();
    };
    let fresh = cached.is_none();
    let mut tasks = match cached {
        Some(tasks) => tasks,
        None => match api.list_tasks(session) {
            Ok(tasks) => tasks,
            Err(err) => return Mutation::failed(err),
        },
    };
    let (change, error) = match action(api, session, &mut tasks) {
        Ok(change) => (Some(change), None),
        Err(err) => (None, Some(err)),
    };
    Mutation { loaded: fresh.then_some(tasks), change, error }
}

async fn create_task(
    State(state): State<ServiceState>,
    jar: CookieJar,
    Form(form): Form<NewTaskForm>,
) -> Result<Response, PageError> {
    mutate_tasks(&state, jar, move |api, session, _cached| {
        let mut scratch = TaskList::default();
        match api.create_task(session, &mut scratch, &form.name) {
            Ok(created) => Mutation { change: created.map(TaskChange::Created), ..Mutation::default() },
            Err(err) => Mutation::failed(err),
        }
    })
    .await
}

async fn toggle_task(
    State(state): State<ServiceState>,
    jar: CookieJar,
    Path(id): Path<String>,
) -> Result<Response, PageError> {
    mutate_tasks(&state, jar, move |api, session, cached| {
        act_on_list(api, session, cached, |api, session, tasks| {
            let id = TaskId::new(id);
            api.toggle_task(session, tasks, &id).map(|status| TaskChange::Status(id, status))
        })
    })
    .await
}

async fn delete_task(
    State(state): State<ServiceState>,
    jar: CookieJar,
    Path(id): Path<String>,
) -> Result<Response, PageError> {
    mutate_tasks(&state, jar, move |api, session, cached| {
        act_on_list(api, session, cached, |api, session, tasks| {
            let id = TaskId::new(id);
            api.delete_task(session, tasks, &id).map(|()| TaskChange::Removed(id))
        })
    })
    .await
}
