//! REST client for a PostgREST-style data API with GoTrue-style auth.

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{Connector, RemoteError, RemoteStore, Role, SelectQuery, Session, User};
use crate::entity::Fields;

/// Builds [`RestStore`] handles; every reconnect gets a fresh HTTP client.
pub struct RestConnector {
  base: Url,
  api_key: String,
  request_timeout: Duration,
  /// Survives reconnects so a signed-in user stays signed in
  session: Arc<RwLock<Option<Session>>>,
}

impl RestConnector {
  pub fn new(url: &str, api_key: String, request_timeout: Duration) -> Result<Self, RemoteError> {
    let mut base =
      Url::parse(url).map_err(|e| RemoteError::Validation(format!("invalid url {}: {}", url, e)))?;
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }
    Ok(Self {
      base,
      api_key,
      request_timeout,
      session: Arc::new(RwLock::new(None)),
    })
  }

  /// Resume a session saved by an earlier run. The user is filled in by the
  /// next session check.
  pub fn restore_session(&self, access_token: String) {
    *self.session.write() = Some(Session {
      access_token,
      user: User {
        id: String::new(),
        email: None,
        role: Role::Member,
      },
    });
  }

  pub fn access_token(&self) -> Option<String> {
    self.session.read().as_ref().map(|s| s.access_token.clone())
  }
}

#[async_trait]
impl Connector for RestConnector {
  async fn connect(&self) -> Result<Arc<dyn RemoteStore>, RemoteError> {
    let http = reqwest::Client::builder()
      .timeout(self.request_timeout)
      .build()
      .map_err(|e| RemoteError::Unexpected(format!("failed to build http client: {}", e)))?;

    let store = RestStore {
      http,
      base: self.base.clone(),
      api_key: self.api_key.clone(),
      session: self.session.clone(),
    };

    // Any answer short of a server error means the service is reachable
    let resp = store
      .request(Method::GET, "auth/v1/health")?
      .send()
      .await
      .map_err(transport_error)?;
    classify_reachability(resp.status())?;

    debug!(url = %self.base, "remote reachable");
    Ok(Arc::new(store))
  }
}

pub struct RestStore {
  http: reqwest::Client,
  base: Url,
  api_key: String,
  session: Arc<RwLock<Option<Session>>>,
}

impl RestStore {
  fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, RemoteError> {
    let url = self
      .base
      .join(path)
      .map_err(|e| RemoteError::Validation(format!("invalid path {}: {}", path, e)))?;
    let bearer = self
      .session
      .read()
      .as_ref()
      .map(|s| s.access_token.clone())
      .unwrap_or_else(|| self.api_key.clone());
    Ok(
      self
        .http
        .request(method, url)
        .header("apikey", &self.api_key)
        .bearer_auth(bearer),
    )
  }

  fn table(&self, method: Method, collection: &str) -> Result<RequestBuilder, RemoteError> {
    self.request(method, &format!("rest/v1/{}", collection))
  }
}

#[async_trait]
impl RemoteStore for RestStore {
  async fn select(&self, collection: &str, query: &SelectQuery) -> Result<Vec<Fields>, RemoteError> {
    let columns = if query.columns.is_empty() {
      "*".to_string()
    } else {
      query.columns.join(",")
    };
    let mut params: Vec<(String, String)> = vec![("select".into(), columns)];
    for (col, value) in &query.filters {
      params.push((col.clone(), format!("eq.{}", value)));
    }
    if let Some((col, desc)) = &query.order {
      let dir = if *desc { "desc" } else { "asc" };
      params.push(("order".into(), format!("{}.{}", col, dir)));
    }
    if let Some(limit) = query.limit {
      params.push(("limit".into(), limit.to_string()));
    }

    let resp = self
      .table(Method::GET, collection)?
      .query(&params)
      .send()
      .await
      .map_err(transport_error)?;
    let resp = check_status(resp).await?;
    resp
      .json::<Vec<Fields>>()
      .await
      .map_err(|e| RemoteError::Unexpected(format!("failed to parse {} rows: {}", collection, e)))
  }

  async fn insert(&self, collection: &str, row: Fields) -> Result<Fields, RemoteError> {
    let resp = self
      .table(Method::POST, collection)?
      .header("Prefer", "return=representation")
      .json(&row)
      .send()
      .await
      .map_err(transport_error)?;
    single_row(check_status(resp).await?, collection, "").await
  }

  async fn update(&self, collection: &str, id: &str, patch: Fields) -> Result<Fields, RemoteError> {
    let resp = self
      .table(Method::PATCH, collection)?
      .query(&[("id", format!("eq.{}", id))])
      .header("Prefer", "return=representation")
      .json(&patch)
      .send()
      .await
      .map_err(transport_error)?;
    single_row(check_status(resp).await?, collection, id).await
  }

  async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
    let resp = self
      .table(Method::DELETE, collection)?
      .query(&[("id", format!("eq.{}", id))])
      .header("Prefer", "return=representation")
      .send()
      .await
      .map_err(transport_error)?;
    single_row(check_status(resp).await?, collection, id).await?;
    Ok(())
  }

  async fn current_session(&self) -> Result<Option<Session>, RemoteError> {
    let Some(session) = self.session.read().clone() else {
      return Ok(None);
    };
    // Token may have expired server-side
    match self.current_user().await {
      Ok(Some(user)) => Ok(Some(Session { user, ..session })),
      Ok(None) | Err(RemoteError::Unauthorized(_)) => {
        *self.session.write() = None;
        Ok(None)
      }
      Err(e) => Err(e),
    }
  }

  async fn current_user(&self) -> Result<Option<User>, RemoteError> {
    if self.session.read().is_none() {
      return Ok(None);
    }
    let resp = self
      .request(Method::GET, "auth/v1/user")?
      .send()
      .await
      .map_err(transport_error)?;
    let resp = check_status(resp).await?;
    let user: ApiUser = resp
      .json()
      .await
      .map_err(|e| RemoteError::Unexpected(format!("failed to parse user: {}", e)))?;
    Ok(Some(user.into()))
  }

  async fn sign_in(&self, email: &str, password: &str) -> Result<Session, RemoteError> {
    let body = serde_json::json!({ "email": email, "password": password });
    let resp = self
      .request(Method::POST, "auth/v1/token?grant_type=password")?
      .json(&body)
      .send()
      .await
      .map_err(transport_error)?;
    let resp = check_status(resp).await?;
    let token: ApiToken = resp
      .json()
      .await
      .map_err(|e| RemoteError::Unexpected(format!("failed to parse token: {}", e)))?;

    let session = Session {
      access_token: token.access_token,
      user: token.user.into(),
    };
    *self.session.write() = Some(session.clone());
    Ok(session)
  }

  async fn sign_out(&self) -> Result<(), RemoteError> {
    if self.session.read().is_none() {
      return Ok(());
    }
    let resp = self
      .request(Method::POST, "auth/v1/logout")?
      .send()
      .await
      .map_err(transport_error)?;
    // The local session is gone either way
    *self.session.write() = None;
    match check_status(resp).await {
      Ok(_) | Err(RemoteError::Unauthorized(_)) => Ok(()),
      Err(e) => Err(e),
    }
  }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct ApiToken {
  access_token: String,
  user: ApiUser,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
  id: String,
  email: Option<String>,
  #[serde(default)]
  app_metadata: ApiAppMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct ApiAppMetadata {
  role: Option<String>,
}

impl From<ApiUser> for User {
  fn from(user: ApiUser) -> Self {
    let role = match user.app_metadata.role.as_deref() {
      Some(r) if r.eq_ignore_ascii_case("admin") => Role::Admin,
      _ => Role::Member,
    };
    User {
      id: user.id,
      email: user.email,
      role,
    }
  }
}

/// Error body shape shared by the data and auth APIs.
#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
  code: Option<String>,
  message: Option<String>,
  msg: Option<String>,
  error_description: Option<String>,
}

impl ApiErrorBody {
  fn text(&self) -> String {
    let message = self
      .message
      .as_deref()
      .or(self.msg.as_deref())
      .or(self.error_description.as_deref())
      .unwrap_or("no message");
    match &self.code {
      Some(code) => format!("{} ({})", message, code),
      None => message.to_string(),
    }
  }
}

// ============================================================================
// Classification
// ============================================================================

fn transport_error(e: reqwest::Error) -> RemoteError {
  if e.is_timeout() || e.is_connect() || e.is_request() {
    RemoteError::Transient(e.to_string())
  } else if e.is_decode() {
    RemoteError::Unexpected(e.to_string())
  } else {
    RemoteError::Transient(e.to_string())
  }
}

async fn check_status(resp: Response) -> Result<Response, RemoteError> {
  let status = resp.status();
  if status.is_success() {
    return Ok(resp);
  }
  let body = resp.text().await.unwrap_or_default();
  let parsed: ApiErrorBody = serde_json::from_str(&body).unwrap_or_default();
  let text = if parsed.message.is_some() || parsed.msg.is_some() || parsed.code.is_some() {
    parsed.text()
  } else {
    format!("{}: {}", status, body.trim())
  };
  Err(classify_status(status, text))
}

fn classify_status(status: StatusCode, text: String) -> RemoteError {
  if super::is_missing_relation(&text) || status == StatusCode::NOT_FOUND {
    return RemoteError::NotProvisioned(text);
  }
  match status {
    s if s.is_server_error() => RemoteError::Transient(text),
    StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => RemoteError::Transient(text),
    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Unauthorized(text),
    s if s.is_client_error() => RemoteError::Validation(text),
    _ => RemoteError::from_message(text),
  }
}

/// Outcome of the connect-time health request. Only a server error counts
/// against the connection; a missing health endpoint or a rejected key still
/// proves the service answers.
fn classify_reachability(status: StatusCode) -> Result<(), RemoteError> {
  if status.is_server_error() {
    return Err(RemoteError::Transient(format!("health check answered {}", status)));
  }
  if !status.is_success() {
    debug!(%status, "health endpoint not usable, service reachable");
  }
  Ok(())
}

/// Write endpoints answer with an array; an empty one means no row matched.
async fn single_row(resp: Response, collection: &str, id: &str) -> Result<Fields, RemoteError> {
  let rows: Vec<Value> = resp
    .json()
    .await
    .map_err(|e| RemoteError::Unexpected(format!("failed to parse {} response: {}", collection, e)))?;
  match rows.into_iter().next() {
    Some(Value::Object(row)) => Ok(row),
    Some(other) => Err(RemoteError::Unexpected(format!(
      "expected object row from {}, got {}",
      collection, other
    ))),
    None => Err(RemoteError::NotFound(format!("{} {}", collection, id))),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_server_errors_are_transient() {
    let err = classify_status(StatusCode::BAD_GATEWAY, "bad gateway".into());
    assert!(err.is_transient());
    let err = classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down".into());
    assert!(err.is_transient());
  }

  #[test]
  fn test_missing_relation_wins_over_status() {
    let err = classify_status(
      StatusCode::BAD_REQUEST,
      "relation \"public.projects\" does not exist (42P01)".into(),
    );
    assert!(matches!(err, RemoteError::NotProvisioned(_)));
  }

  #[test]
  fn test_client_errors_are_validation() {
    let err = classify_status(StatusCode::CONFLICT, "duplicate key".into());
    assert!(matches!(err, RemoteError::Validation(_)));
    let err = classify_status(StatusCode::UNAUTHORIZED, "jwt expired".into());
    assert!(matches!(err, RemoteError::Unauthorized(_)));
  }

  #[test]
  fn test_admin_role_from_app_metadata() {
    let user: ApiUser = serde_json::from_value(serde_json::json!({
      "id": "u1",
      "email": "a@b.c",
      "app_metadata": { "role": "Admin" }
    }))
    .unwrap();
    assert_eq!(User::from(user).role, Role::Admin);

    let user: ApiUser = serde_json::from_value(serde_json::json!({ "id": "u2", "email": null })).unwrap();
    assert_eq!(User::from(user).role, Role::Member);
  }

  #[test]
  fn test_connector_normalizes_base_path() {
    let c = RestConnector::new("https://example.test/base", "k".into(), Duration::from_secs(1)).unwrap();
    assert_eq!(c.base.join("rest/v1/articles").unwrap().as_str(), "https://example.test/base/rest/v1/articles");
    assert!(RestConnector::new("not a url", "k".into(), Duration::from_secs(1)).is_err());
  }

  #[test]
  fn test_restored_session_exposes_token() {
    let c = RestConnector::new("https://example.test", "k".into(), Duration::from_secs(1)).unwrap();
    assert_eq!(c.access_token(), None);
    c.restore_session("saved".into());
    assert_eq!(c.access_token().as_deref(), Some("saved"));
  }

  #[test]
  fn test_connect_only_fails_on_server_errors() {
    assert!(classify_reachability(StatusCode::OK).is_ok());
    assert!(classify_reachability(StatusCode::NOT_FOUND).is_ok());
    assert!(classify_reachability(StatusCode::UNAUTHORIZED).is_ok());
    let err = classify_reachability(StatusCode::SERVICE_UNAVAILABLE).unwrap_err();
    assert!(err.is_transient());
  }
}
