//! Contract of the remote data/auth service.
//!
//! The store never talks HTTP directly: it holds an `Arc<dyn RemoteStore>`
//! obtained from a [`Connector`], so the REST client and the in-memory test
//! double are interchangeable.

pub mod rest;

#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::entity::{Entity, Fields};

/// Failure reported by the remote service, classified by how the caller
/// should react.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
  /// Network failure, timeout, or 5xx. Worth retrying.
  #[error("transient remote failure: {0}")]
  Transient(String),
  /// The collection does not exist on the server yet
  #[error("not provisioned: {0}")]
  NotProvisioned(String),
  /// Malformed payload or constraint violation
  #[error("rejected by remote: {0}")]
  Validation(String),
  #[error("not found: {0}")]
  NotFound(String),
  #[error("unauthorized: {0}")]
  Unauthorized(String),
  #[error("unexpected remote failure: {0}")]
  Unexpected(String),
}

impl RemoteError {
  pub fn is_transient(&self) -> bool {
    matches!(self, RemoteError::Transient(_))
  }

  /// Classify a server message. "relation ... does not exist" means the
  /// backing table has not been created yet.
  pub fn from_message(message: impl Into<String>) -> Self {
    let message = message.into();
    if is_missing_relation(&message) {
      RemoteError::NotProvisioned(message)
    } else {
      RemoteError::Unexpected(message)
    }
  }
}

pub(crate) fn is_missing_relation(message: &str) -> bool {
  let lower = message.to_lowercase();
  (lower.contains("relation") && lower.contains("does not exist")) || lower.contains("42p01")
}

/// Parameters for a `select` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectQuery {
  /// Columns to return; empty means all
  pub columns: Vec<String>,
  /// Equality filters (`column = value`)
  pub filters: Vec<(String, String)>,
  /// Column to order by, descending when the flag is set
  pub order: Option<(String, bool)>,
  pub limit: Option<usize>,
}

impl SelectQuery {
  /// All columns, newest first.
  pub fn newest_first() -> Self {
    Self {
      columns: Vec::new(),
      filters: Vec::new(),
      order: Some(("created_at".to_string(), true)),
      limit: None,
    }
  }

  /// Cheapest possible read, used for keepalive probes.
  pub fn probe() -> Self {
    Self {
      columns: vec!["id".to_string()],
      filters: Vec::new(),
      order: None,
      limit: Some(1),
    }
  }
}

/// Privilege level of the signed-in user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  Member,
  Admin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
  pub id: String,
  pub email: Option<String>,
  pub role: Role,
}

impl User {
  /// Whether this user's scoped view includes `entity`.
  pub fn can_see(&self, entity: &Entity) -> bool {
    match self.role {
      Role::Admin => true,
      Role::Member => entity.owner_id.as_deref() == Some(self.id.as_str()),
    }
  }
}

/// An authenticated session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
  pub access_token: String,
  pub user: User,
}

/// Data and auth operations of the remote service.
#[async_trait]
pub trait RemoteStore: Send + Sync {
  async fn select(&self, collection: &str, query: &SelectQuery) -> Result<Vec<Fields>, RemoteError>;

  /// Insert a row; the server assigns the id and timestamps.
  async fn insert(&self, collection: &str, row: Fields) -> Result<Fields, RemoteError>;

  async fn update(&self, collection: &str, id: &str, patch: Fields) -> Result<Fields, RemoteError>;

  /// Delete by id. Deleting an id that does not exist is `NotFound`.
  async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError>;

  async fn current_session(&self) -> Result<Option<Session>, RemoteError>;

  async fn current_user(&self) -> Result<Option<User>, RemoteError>;

  async fn sign_in(&self, email: &str, password: &str) -> Result<Session, RemoteError>;

  async fn sign_out(&self) -> Result<(), RemoteError>;
}

/// Produces fresh remote handles. Called on startup and on every reconnect.
#[async_trait]
pub trait Connector: Send + Sync {
  async fn connect(&self) -> Result<Arc<dyn RemoteStore>, RemoteError>;
}

/// Pull a string out of a JSON value, accepting numbers too.
pub(crate) fn value_to_id(value: &Value) -> Option<String> {
  match value {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_missing_relation_is_not_provisioned() {
    let err = RemoteError::from_message("relation \"public.courses\" does not exist");
    assert!(matches!(err, RemoteError::NotProvisioned(_)));

    let err = RemoteError::from_message("42P01");
    assert!(matches!(err, RemoteError::NotProvisioned(_)));
  }

  #[test]
  fn test_other_messages_are_unexpected() {
    let err = RemoteError::from_message("something odd");
    assert!(matches!(err, RemoteError::Unexpected(_)));
    assert!(!err.is_transient());
  }

  #[test]
  fn test_member_sees_only_own_entities() {
    let member = User {
      id: "u1".into(),
      email: None,
      role: Role::Member,
    };
    let admin = User {
      role: Role::Admin,
      ..member.clone()
    };
    let mut theirs = crate::entity::tests::entity("x", 1);
    theirs.owner_id = Some("u2".into());
    let mine = crate::entity::tests::entity("y", 1);

    assert!(member.can_see(&mine));
    assert!(!member.can_see(&theirs));
    assert!(admin.can_see(&theirs));
  }
}
