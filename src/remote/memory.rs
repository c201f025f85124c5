//! In-memory remote used by the tests, with scripted faults.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{
  value_to_id, Connector, RemoteError, RemoteStore, Role, SelectQuery, Session, User,
};
use crate::entity::Fields;

/// What the next remote call should do instead of succeeding.
#[derive(Debug, Clone)]
pub enum Fault {
  Fail(RemoteError),
  /// Never resolve
  Hang,
  /// Answer late: the call takes effect first, then the answer waits
  Delay(Duration),
}

#[derive(Default)]
pub struct MemoryRemote {
  tables: Mutex<HashMap<String, Vec<Fields>>>,
  missing: Mutex<HashSet<String>>,
  faults: Mutex<VecDeque<Fault>>,
  calls: Mutex<HashMap<&'static str, usize>>,
  session: Mutex<Option<Session>>,
  next_id: AtomicUsize,
}

impl MemoryRemote {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// Queue a fault for the next call (any operation).
  pub fn push_fault(&self, fault: Fault) {
    self.faults.lock().push_back(fault);
  }

  /// Make a collection behave as if its table was never created.
  pub fn drop_table(&self, collection: &str) {
    self.missing.lock().insert(collection.to_string());
  }

  pub fn calls(&self, op: &str) -> usize {
    self.calls.lock().get(op).copied().unwrap_or(0)
  }

  pub fn rows(&self, collection: &str) -> Vec<Fields> {
    self.tables.lock().get(collection).cloned().unwrap_or_default()
  }

  /// Insert a row directly, bypassing faults and counters.
  pub fn seed(&self, collection: &str, mut row: Fields) -> String {
    self.stamp_new(collection, &mut row);
    let id = row.get("id").and_then(value_to_id).unwrap_or_default();
    self
      .tables
      .lock()
      .entry(collection.to_string())
      .or_default()
      .push(row);
    id
  }

  pub fn set_session(&self, session: Option<Session>) {
    *self.session.lock() = session;
  }

  fn stamp_new(&self, collection: &str, row: &mut Fields) {
    let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    let at = Utc
      .timestamp_opt(1_700_000_000 + n as i64, 0)
      .single()
      .unwrap_or_else(Utc::now)
      .to_rfc3339();
    row.insert("id".into(), Value::String(format!("{}-{}", collection, n)));
    row.insert("created_at".into(), Value::String(at.clone()));
    row.insert("updated_at".into(), Value::String(at));
  }

  /// Count the call and apply the next fault. Returns a delay the caller
  /// should wait before answering.
  async fn enter(
    &self,
    op: &'static str,
    collection: Option<&str>,
  ) -> Result<Option<Duration>, RemoteError> {
    *self.calls.lock().entry(op).or_default() += 1;
    let fault = self.faults.lock().pop_front();
    let delay = match fault {
      Some(Fault::Fail(e)) => return Err(e),
      Some(Fault::Hang) => std::future::pending::<Option<Duration>>().await,
      Some(Fault::Delay(d)) => Some(d),
      None => None,
    };
    if let Some(c) = collection {
      if self.missing.lock().contains(c) {
        return Err(RemoteError::NotProvisioned(format!(
          "relation \"public.{}\" does not exist",
          c
        )));
      }
    }
    Ok(delay)
  }

  /// Enter and wait out any delay before touching state.
  async fn enter_now(&self, op: &'static str, collection: Option<&str>) -> Result<(), RemoteError> {
    let delay = self.enter(op, collection).await?;
    settle(delay).await;
    Ok(())
  }

  fn update_row(&self, collection: &str, id: &str, patch: Fields) -> Result<Fields, RemoteError> {
    let mut tables = self.tables.lock();
    let row = tables
      .get_mut(collection)
      .and_then(|rows| rows.iter_mut().find(|r| row_id(r).as_deref() == Some(id)))
      .ok_or_else(|| RemoteError::NotFound(format!("{} {}", collection, id)))?;
    for (k, v) in patch {
      if k != "id" && k != "created_at" {
        row.insert(k, v);
      }
    }
    row.insert("updated_at".into(), Value::String(Utc::now().to_rfc3339()));
    Ok(row.clone())
  }

  fn delete_row(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
    let mut tables = self.tables.lock();
    let rows = tables.entry(collection.to_string()).or_default();
    let before = rows.len();
    rows.retain(|r| row_id(r).as_deref() != Some(id));
    if rows.len() == before {
      return Err(RemoteError::NotFound(format!("{} {}", collection, id)));
    }
    Ok(())
  }
}

async fn settle(delay: Option<Duration>) {
  if let Some(d) = delay {
    tokio::time::sleep(d).await;
  }
}

fn row_id(row: &Fields) -> Option<String> {
  row.get("id").and_then(value_to_id)
}

#[async_trait]
impl RemoteStore for MemoryRemote {
  async fn select(&self, collection: &str, query: &SelectQuery) -> Result<Vec<Fields>, RemoteError> {
    let delay = self.enter("select", Some(collection)).await?;
    let mut rows: Vec<Fields> = self
      .rows(collection)
      .into_iter()
      .filter(|row| {
        query
          .filters
          .iter()
          .all(|(col, want)| row.get(col).and_then(value_to_id).as_deref() == Some(want.as_str()))
      })
      .collect();
    if let Some((col, desc)) = &query.order {
      rows.sort_by(|a, b| {
        let a = a.get(col).and_then(Value::as_str).unwrap_or_default();
        let b = b.get(col).and_then(Value::as_str).unwrap_or_default();
        if *desc {
          b.cmp(a)
        } else {
          a.cmp(b)
        }
      });
    }
    if let Some(limit) = query.limit {
      rows.truncate(limit);
    }
    settle(delay).await;
    Ok(rows)
  }

  async fn insert(&self, collection: &str, mut row: Fields) -> Result<Fields, RemoteError> {
    let delay = self.enter("insert", Some(collection)).await?;
    self.stamp_new(collection, &mut row);
    self
      .tables
      .lock()
      .entry(collection.to_string())
      .or_default()
      .push(row.clone());
    settle(delay).await;
    Ok(row)
  }

  async fn update(&self, collection: &str, id: &str, patch: Fields) -> Result<Fields, RemoteError> {
    let delay = self.enter("update", Some(collection)).await?;
    let result = self.update_row(collection, id, patch);
    settle(delay).await;
    result
  }

  async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
    let delay = self.enter("delete", Some(collection)).await?;
    let result = self.delete_row(collection, id);
    settle(delay).await;
    result
  }

  async fn current_session(&self) -> Result<Option<Session>, RemoteError> {
    self.enter_now("session", None).await?;
    Ok(self.session.lock().clone())
  }

  async fn current_user(&self) -> Result<Option<User>, RemoteError> {
    self.enter_now("user", None).await?;
    Ok(self.session.lock().as_ref().map(|s| s.user.clone()))
  }

  async fn sign_in(&self, email: &str, password: &str) -> Result<Session, RemoteError> {
    self.enter_now("sign_in", None).await?;
    if password.is_empty() {
      return Err(RemoteError::Unauthorized("invalid login credentials".into()));
    }
    let role = if email.starts_with("admin") {
      Role::Admin
    } else {
      Role::Member
    };
    let session = Session {
      access_token: format!("token-{}", email),
      user: User {
        id: format!("user-{}", email),
        email: Some(email.to_string()),
        role,
      },
    };
    *self.session.lock() = Some(session.clone());
    Ok(session)
  }

  async fn sign_out(&self) -> Result<(), RemoteError> {
    self.enter_now("sign_out", None).await?;
    *self.session.lock() = None;
    Ok(())
  }
}

/// Connector handing out the same shared [`MemoryRemote`].
pub struct MemoryConnector {
  pub remote: Arc<MemoryRemote>,
  connects: AtomicUsize,
  failures: Mutex<VecDeque<RemoteError>>,
  delay: Duration,
}

impl MemoryConnector {
  pub fn new(remote: Arc<MemoryRemote>) -> Self {
    Self {
      remote,
      connects: AtomicUsize::new(0),
      failures: Mutex::new(VecDeque::new()),
      delay: Duration::ZERO,
    }
  }

  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  pub fn fail_next(&self, err: RemoteError) {
    self.failures.lock().push_back(err);
  }

  pub fn connects(&self) -> usize {
    self.connects.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Connector for MemoryConnector {
  async fn connect(&self) -> Result<Arc<dyn RemoteStore>, RemoteError> {
    self.connects.fetch_add(1, Ordering::SeqCst);
    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }
    if let Some(err) = self.failures.lock().pop_front() {
      return Err(err);
    }
    Ok(self.remote.clone())
  }
}
