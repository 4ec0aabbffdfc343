use std::time::Duration;

use serde_json::{json, Value};
use taskdesk_core::{AuthUser, Session};
use tracing::debug;
use url::Url;

use crate::pkce::CHALLENGE_METHOD;
use crate::{IdentityProvider, PlatformConfig, PlatformError, RowOrder, RpcGateway, TableGateway};

const AUTH_PREFIX: [&str; 2] = ["auth", "v1"];
const REST_PREFIX: [&str; 2] = ["rest", "v1"];

/// Blocking HTTP client for the hosted platform's REST and identity endpoints.
///
/// One agent is shared by every call; it carries the configured timeout and connection pool.
#[derive(Debug, Clone)]
pub struct PlatformClient {
    agent: ureq::Agent,
    config: PlatformConfig,
}

impl PlatformClient {
    #[must_use]
    pub fn new(config: PlatformConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build();
        Self { agent, config }
    }

    #[must_use]
    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    fn endpoint(&self, prefix: [&str; 2], rest: &[&str]) -> Result<Url, PlatformError> {
        let mut url = self.config.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                PlatformError::Config(format!(
                    "platform url {} cannot carry a path",
                    self.config.base_url
                ))
            })?
            .pop_if_empty()
            .extend(prefix)
            .extend(rest);
        Ok(url)
    }

    fn table_endpoint(&self, table: &str) -> Result<Url, PlatformError> {
        self.endpoint(REST_PREFIX, &[table])
    }

    fn request(&self, method: &str, url: &Url, bearer: Option<&str>) -> ureq::Request {
        debug!(method, path = url.path(), "platform request");
        let bearer = bearer.unwrap_or(&self.config.api_key);
        self.agent
            .request(method, url.as_str())
            .set("apikey", &self.config.api_key)
            .set("Authorization", &format!("Bearer {bearer}"))
            .set("Accept", "application/json")
    }

    fn rest_request(&self, method: &str, url: &Url, bearer: Option<&str>) -> ureq::Request {
        let request = self
            .request(method, url, bearer)
            .set("Accept-Profile", &self.config.schema);
        if method == "GET" {
            request
        } else {
            request.set("Content-Profile", &self.config.schema)
        }
    }
}

impl IdentityProvider for PlatformClient {
    fn authorize_url(
        &self,
        provider: &str,
        redirect_to: &str,
        code_challenge: &str,
    ) -> Result<Url, PlatformError> {
        let mut url = self.endpoint(AUTH_PREFIX, &["authorize"])?;
        url.query_pairs_mut()
            .append_pair("provider", provider)
            .append_pair("redirect_to", redirect_to)
            .append_pair("code_challenge", code_challenge)
            .append_pair("code_challenge_method", CHALLENGE_METHOD);
        Ok(url)
    }

    fn exchange_code_for_session(
        &self,
        auth_code: &str,
        code_verifier: &str,
    ) -> Result<Session, PlatformError> {
        let mut url = self.endpoint(AUTH_PREFIX, &["token"])?;
        url.query_pairs_mut().append_pair("grant_type", "pkce");
        let body = json!({ "auth_code": auth_code, "code_verifier": code_verifier });
        let value = send(self.request("POST", &url, None), Some(&body))?;
        Ok(Session::from_value(value)?)
    }

    fn get_user(&self, access_token: &str) -> Result<Option<AuthUser>, PlatformError> {
        let url = self.endpoint(AUTH_PREFIX, &["user"])?;
        match send(self.request("GET", &url, Some(access_token)), None) {
            Ok(value) => Ok(Some(AuthUser::from_value(value)?)),
            Err(PlatformError::Unauthorized | PlatformError::Remote { status: 403, .. }) => {
                debug!("access token rejected by identity service");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn sign_out(&self, access_token: &str) -> Result<(), PlatformError> {
        let url = self.endpoint(AUTH_PREFIX, &["logout"])?;
        match send(self.request("POST", &url, Some(access_token)), None) {
            Ok(_) | Err(PlatformError::Unauthorized) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl TableGateway for PlatformClient {
    fn select(
        &self,
        access_token: Option<&str>,
        table: &str,
        order: Option<&RowOrder>,
    ) -> Result<Vec<Value>, PlatformError> {
        let mut url = self.table_endpoint(table)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("select", "*");
            if let Some(order) = order {
                query.append_pair("order", &order.to_query_value());
            }
        }
        match send(self.rest_request("GET", &url, access_token), None)? {
            Value::Array(rows) => Ok(rows),
            Value::Null => Ok(Vec::new()),
            other => Err(PlatformError::Decode(format!(
                "select on {table} MUST return an array, got {other}"
            ))),
        }
    }

    fn insert_returning(
        &self,
        access_token: Option<&str>,
        table: &str,
        row: &Value,
    ) -> Result<Value, PlatformError> {
        let url = self.table_endpoint(table)?;
        let request = self
            .rest_request("POST", &url, access_token)
            .set("Prefer", "return=representation");
        match send(request, Some(row))? {
            Value::Array(rows) => rows.into_iter().next().ok_or_else(|| {
                PlatformError::Decode(format!("insert into {table} returned no row"))
            }),
            object @ Value::Object(_) => Ok(object),
            other => Err(PlatformError::Decode(format!(
                "insert into {table} returned {other}"
            ))),
        }
    }

    fn update_by_id(
        &self,
        access_token: Option<&str>,
        table: &str,
        id: &str,
        patch: &Value,
    ) -> Result<(), PlatformError> {
        let mut url = self.table_endpoint(table)?;
        url.query_pairs_mut().append_pair("id", &format!("eq.{id}"));
        let request = self
            .rest_request("PATCH", &url, access_token)
            .set("Prefer", "return=minimal");
        send(request, Some(patch)).map(|_| ())
    }

    fn delete_by_id(
        &self,
        access_token: Option<&str>,
        table: &str,
        id: &str,
    ) -> Result<(), PlatformError> {
        let mut url = self.table_endpoint(table)?;
        url.query_pairs_mut().append_pair("id", &format!("eq.{id}"));
        send(self.rest_request("DELETE", &url, access_token), None).map(|_| ())
    }
}

impl RpcGateway for PlatformClient {
    fn call_procedure(&self, name: &str, args: &Value) -> Result<Value, PlatformError> {
        let url = self.endpoint(REST_PREFIX, &["rpc", name])?;
        send(self.rest_request("POST", &url, None), Some(args))
    }
}

fn send(request: ureq::Request, body: Option<&Value>) -> Result<Value, PlatformError> {
    let result = match body {
        Some(body) => request.send_json(body),
        None => request.call(),
    };
    match result {
        Ok(response) => read_json(response),
        Err(ureq::Error::Status(status, response)) => {
            let text = response.into_string().unwrap_or_default();
            Err(remote_error(status, &text))
        }
        Err(ureq::Error::Transport(transport)) => Err(PlatformError::Transport(transport.to_string())),
    }
}

fn read_json(response: ureq::Response) -> Result<Value, PlatformError> {
    let text = response
        .into_string()
        .map_err(|err| PlatformError::Decode(format!("failed to read response body: {err}")))?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text)
        .map_err(|err| PlatformError::Decode(format!("response body is not JSON: {err}")))
}

/// Map an error status to [`PlatformError`], keeping the platform's own message when the
/// body carries one.
fn remote_error(status: u16, body: &str) -> PlatformError {
    if status == 401 {
        return PlatformError::Unauthorized;
    }
    let parsed = serde_json::from_str::<Value>(body).ok();
    let field = |name: &str| {
        parsed.as_ref().and_then(|value| match value.get(name) {
            Some(Value::String(text)) if !text.is_empty() => Some(text.clone()),
            Some(Value::Number(number)) => Some(number.to_string()),
            _ => None,
        })
    };
    let message = ["message", "msg", "error_description", "error"]
        .into_iter()
        .find_map(field)
        .unwrap_or_else(|| format!("request failed with status {status}"));
    let code = field("code").or_else(|| field("error_code"));
    PlatformError::Remote { status, message, code }
}
