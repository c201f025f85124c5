//! The sync store: the single writer of the cached collections.
//!
//! Every remote interaction goes through the [`ConnectionManager`]. Reads go
//! through the [`EntityCache`] staleness policy; writes are write-through: the
//! cache changes only after the remote confirmed the write.

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::cache::{CacheResult, CacheSource, EntityCache};
use crate::config::{LoadTimeoutPolicy, SyncConfig};
use crate::connection::{with_timeout, ConnectionError, ConnectionManager, ConnectionState};
use crate::entity::{Collection, Entity, EntityKind, Fields};
use crate::remote::{RemoteError, Role, SelectQuery, User};

/// Collection that records anonymous content views.
const VIEWS_COLLECTION: &str = "content_views";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
  /// Could not (re)establish a connection before a write
  #[error("connection unavailable: {0}")]
  ConnectionUnavailable(ConnectionError),
  /// Retries ran out; the store is now disconnected
  #[error("remote unreachable: {0}")]
  Disconnected(ConnectionError),
  #[error("fetching {kind}s timed out after {limit:?}")]
  FetchTimeout { kind: EntityKind, limit: Duration },
  #[error("rejected: {0}")]
  Validation(String),
  #[error("not found: {0}")]
  NotFound(String),
  #[error("unauthorized: {0}")]
  Unauthorized(String),
  #[error("unexpected failure: {0}")]
  Unexpected(String),
  #[error(transparent)]
  FatalLoad(FatalLoadError),
}

/// The initial load did not finish within its deadline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("initial load did not finish within {limit:?}")]
pub struct FatalLoadError {
  pub limit: Duration,
  pub policy: LoadTimeoutPolicy,
}

/// Progress of the initial load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
  Idle,
  Loading,
  Ready,
  Failed(FatalLoadError),
}

/// Notifications for whoever renders the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
  /// A collection was refetched or mutated
  CollectionChanged(EntityKind),
  /// Signed in, signed out, or the session expired
  ActorChanged(Option<User>),
  FatalLoad(FatalLoadError),
}

/// Outcome of a load that finished in time. Kinds that failed without any
/// cached data are listed in `failed`.
#[derive(Debug, Default)]
pub struct LoadReport {
  pub loaded: Vec<EntityKind>,
  pub failed: Vec<(EntityKind, SyncError)>,
}

/// Decrements the in-flight counter even when the fetch is abandoned.
struct Busy<'a>(&'a AtomicUsize);

impl<'a> Busy<'a> {
  fn enter(counter: &'a AtomicUsize) -> Self {
    counter.fetch_add(1, Ordering::SeqCst);
    Self(counter)
  }
}

impl Drop for Busy<'_> {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

pub struct SyncStore {
  conn: Arc<ConnectionManager>,
  cache: EntityCache,
  config: SyncConfig,
  actor: RwLock<Option<User>>,
  in_flight: AtomicUsize,
  load_state: RwLock<LoadState>,
  events: mpsc::UnboundedSender<StoreEvent>,
  /// Identifies this client session for view deduplication
  session_id: String,
  viewed: Mutex<HashSet<(EntityKind, String)>>,
}

impl SyncStore {
  pub fn new(
    conn: Arc<ConnectionManager>,
    config: SyncConfig,
    session_id: String,
  ) -> (Self, mpsc::UnboundedReceiver<StoreEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let store = Self {
      conn,
      cache: EntityCache::new(config.stale_after()),
      config,
      actor: RwLock::new(None),
      in_flight: AtomicUsize::new(0),
      load_state: RwLock::new(LoadState::Idle),
      events: tx,
      session_id,
      viewed: Mutex::new(HashSet::new()),
    };
    (store, rx)
  }

  // ==========================================================================
  // Read side
  // ==========================================================================

  /// Current collection of a kind; empty until first loaded.
  pub fn collection(&self, kind: EntityKind) -> Collection {
    self.cache.collection(kind).unwrap_or_default()
  }

  /// The collection as seen by the signed-in user: everything for admins,
  /// own entities for members, nothing when signed out.
  pub fn visible(&self, kind: EntityKind) -> Collection {
    let all = self.collection(kind);
    match self.actor() {
      Some(user) if user.role == Role::Admin => all,
      Some(user) => all.filter(|e| user.can_see(e)),
      None => Collection::empty(),
    }
  }

  pub fn actor(&self) -> Option<User> {
    self.actor.read().clone()
  }

  pub fn is_loading(&self) -> bool {
    self.in_flight.load(Ordering::SeqCst) > 0
  }

  pub fn load_state(&self) -> LoadState {
    self.load_state.read().clone()
  }

  pub fn connection_state(&self) -> ConnectionState {
    self.conn.state()
  }

  pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
    self.conn.subscribe()
  }

  pub(crate) fn connection(&self) -> &ConnectionManager {
    &self.conn
  }

  fn emit(&self, event: StoreEvent) {
    // Ignore send errors - receiver may have been dropped
    let _ = self.events.send(event);
  }

  // ==========================================================================
  // Fetching
  // ==========================================================================

  /// Get a collection, refetching when stale or when `force` is set.
  pub async fn refresh(
    &self,
    kind: EntityKind,
    force: bool,
  ) -> Result<CacheResult<Collection>, SyncError> {
    let _busy = Busy::enter(&self.in_flight);
    let result = self
      .cache
      .get_or_fetch(kind, force, || self.fetch_remote(kind))
      .await?;
    if result.source == CacheSource::Network {
      self.emit(StoreEvent::CollectionChanged(kind));
    }
    Ok(result)
  }

  /// Refresh every tracked kind concurrently; one slow kind does not hold
  /// up the others.
  pub async fn refresh_all(
    &self,
    force: bool,
  ) -> Vec<(EntityKind, Result<CacheResult<Collection>, SyncError>)> {
    let kinds = self.config.kinds.clone();
    let results = join_all(kinds.iter().map(|&kind| self.refresh(kind, force))).await;
    kinds.into_iter().zip(results).collect()
  }

  /// Refetch a kind and return the signed-in user's view of it.
  pub async fn refresh_owned(&self, kind: EntityKind) -> Result<Collection, SyncError> {
    self.refresh(kind, true).await?;
    Ok(self.visible(kind))
  }

  /// Refetch the owned views of every tracked kind. Failures keep the
  /// previous data.
  pub async fn refresh_owned_all(&self) {
    for (kind, result) in self.refresh_all(true).await {
      if let Err(e) = result {
        warn!(%kind, error = %e, "owned refresh failed");
      }
    }
  }

  async fn fetch_remote(&self, kind: EntityKind) -> Result<Collection, SyncError> {
    let operation = format!("select {}", kind.collection());
    let fetch = self.conn.execute(&operation, |remote| async move {
      let query = SelectQuery::newest_first();
      remote.select(kind.collection(), &query).await
    });

    let limit = self.config.fetch_timeout();
    let rows = match with_timeout(fetch, limit).await {
      Ok(Ok(rows)) => rows,
      Ok(Err(ConnectionError::Rejected(RemoteError::NotProvisioned(msg)))) => {
        info!(%kind, message = %msg, "collection not provisioned yet, treating as empty");
        return Ok(Collection::empty());
      }
      Ok(Err(e)) => return Err(self.surface(&operation, e)),
      Err(_) => {
        self.conn.mark_disconnected();
        return Err(SyncError::FetchTimeout { kind, limit });
      }
    };

    let entities = rows
      .into_iter()
      .map(Entity::from_row)
      .collect::<Result<Vec<_>, _>>()
      .map_err(|e| {
        error!(%kind, error = %e, "failed to decode rows");
        SyncError::Unexpected(format!("failed to decode {} rows: {}", kind, e))
      })?;
    debug!(%kind, count = entities.len(), "fetched collection");
    Ok(Collection::from_entities(entities))
  }

  // ==========================================================================
  // Initial load
  // ==========================================================================

  /// Load every tracked kind within the load deadline.
  ///
  /// If the deadline passes, or a kind with nothing cached times out, the
  /// store enters `LoadState::Failed` and emits exactly one
  /// `StoreEvent::FatalLoad`.
  pub async fn load(&self) -> Result<LoadReport, SyncError> {
    *self.load_state.write() = LoadState::Loading;
    let limit = self.config.load_timeout();

    let results = match with_timeout(self.refresh_all(false), limit).await {
      Ok(results) => results,
      Err(_) => return Err(self.fail_load(limit)),
    };

    let mut report = LoadReport::default();
    for (kind, result) in results {
      match result {
        Ok(_) => report.loaded.push(kind),
        Err(e) => {
          warn!(%kind, error = %e, "failed to load collection");
          report.failed.push((kind, e));
        }
      }
    }
    // Kinds with cached data fall back to it, so a timeout here means a kind
    // has nothing to show
    if report
      .failed
      .iter()
      .any(|(_, e)| matches!(e, SyncError::FetchTimeout { .. }))
    {
      return Err(self.fail_load(limit));
    }
    *self.load_state.write() = LoadState::Ready;
    Ok(report)
  }

  fn fail_load(&self, limit: Duration) -> SyncError {
    let err = FatalLoadError {
      limit,
      policy: self.config.on_load_timeout,
    };
    error!(?limit, policy = ?err.policy, "initial load timed out");
    *self.load_state.write() = LoadState::Failed(err.clone());
    self.emit(StoreEvent::FatalLoad(err.clone()));
    SyncError::FatalLoad(err)
  }

  /// Initial load with the configured fallback.
  ///
  /// `Reload` discards all cached state and loads again, at most
  /// `max_reloads` times. `Prompt` asks `confirm` before each retry.
  pub async fn start<F>(&self, mut confirm: F) -> Result<LoadReport, SyncError>
  where
    F: FnMut(&FatalLoadError) -> bool,
  {
    let mut reloads = 0;
    loop {
      match self.load().await {
        Err(SyncError::FatalLoad(err)) => {
          let retry = match err.policy {
            LoadTimeoutPolicy::Reload => reloads < self.config.max_reloads,
            LoadTimeoutPolicy::Prompt => confirm(&err),
          };
          if !retry {
            return Err(SyncError::FatalLoad(err));
          }
          reloads += 1;
          info!(attempt = reloads, "restarting from a clean state");
          self.reset();
        }
        other => return other,
      }
    }
  }

  /// Drop all cached collections and return to `LoadState::Idle`.
  pub fn reset(&self) {
    self.cache.clear();
    self.viewed.lock().clear();
    *self.load_state.write() = LoadState::Idle;
  }

  // ==========================================================================
  // Mutations
  // ==========================================================================

  /// Make sure the connection is up before a write, reconnecting if needed.
  pub async fn ensure_connection(&self) -> Result<(), SyncError> {
    if self.conn.state() == ConnectionState::Connected {
      return Ok(());
    }
    self
      .conn
      .reconnect()
      .await
      .map_err(SyncError::ConnectionUnavailable)
  }

  /// Insert a new entity. The server assigns id and timestamps; the result
  /// is prepended to the cached collection.
  pub async fn create(&self, kind: EntityKind, payload: Fields) -> Result<Entity, SyncError> {
    self.ensure_connection().await?;

    let mut row = payload;
    if !row.contains_key("owner_id") {
      if let Some(user) = self.actor() {
        row.insert("owner_id".into(), Value::String(user.id));
      }
    }

    let operation = format!("insert {}", kind.collection());
    let created = self
      .conn
      .execute_once(&operation, |remote| {
        let row = row.clone();
        async move { remote.insert(kind.collection(), row).await }
      })
      .await
      .map_err(|e| self.surface_write(kind, &operation, e))?;

    let entity = self.decode_written(kind, created)?;
    self.cache.apply(kind, |c| c.prepend(entity.clone()));
    info!(%kind, id = %entity.id, "created");
    self.emit(StoreEvent::CollectionChanged(kind));
    Ok(entity)
  }

  /// Apply a partial update. The cached entry is replaced, or inserted if it
  /// was not cached.
  pub async fn update(
    &self,
    kind: EntityKind,
    id: &str,
    patch: Fields,
  ) -> Result<Entity, SyncError> {
    self.ensure_connection().await?;

    let operation = format!("update {} {}", kind.collection(), id);
    let updated = self
      .conn
      .execute(&operation, |remote| {
        let patch = patch.clone();
        async move { remote.update(kind.collection(), id, patch).await }
      })
      .await
      .map_err(|e| self.surface_write(kind, &operation, e))?;

    let entity = self.decode_written(kind, updated)?;
    self.cache.apply(kind, |c| c.upsert(entity.clone()));
    info!(%kind, id = %entity.id, "updated");
    self.emit(StoreEvent::CollectionChanged(kind));
    Ok(entity)
  }

  pub async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), SyncError> {
    self.ensure_connection().await?;

    let operation = format!("delete {} {}", kind.collection(), id);
    self
      .conn
      .execute_once(&operation, |remote| async move {
        remote.delete(kind.collection(), id).await
      })
      .await
      .map_err(|e| self.surface_write(kind, &operation, e))?;

    self.cache.apply(kind, |c| c.remove(id));
    info!(%kind, id, "deleted");
    self.emit(StoreEvent::CollectionChanged(kind));
    Ok(())
  }

  /// Count a view of an entity once per session. Returns whether a view was
  /// recorded.
  pub async fn record_view(&self, kind: EntityKind, id: &str) -> Result<bool, SyncError> {
    let key = (kind, id.to_string());
    if !self.viewed.lock().insert(key.clone()) {
      return Ok(false);
    }

    let mut row = Fields::new();
    row.insert("entity_kind".into(), Value::String(kind.to_string()));
    row.insert("entity_id".into(), Value::String(id.to_string()));
    row.insert("session_id".into(), Value::String(self.session_id.clone()));

    let result = self
      .conn
      .execute_once("record view", |remote| {
        let row = row.clone();
        async move { remote.insert(VIEWS_COLLECTION, row).await }
      })
      .await;

    match result {
      Ok(_) => Ok(true),
      // Already counted server-side, or view tracking not set up
      Err(ConnectionError::Rejected(RemoteError::Validation(msg)))
      | Err(ConnectionError::Rejected(RemoteError::NotProvisioned(msg))) => {
        debug!(%kind, id, message = %msg, "view not recorded");
        Ok(false)
      }
      Err(e) => {
        self.viewed.lock().remove(&key);
        Err(self.surface("record view", e))
      }
    }
  }

  // ==========================================================================
  // Authentication
  // ==========================================================================

  pub async fn sign_in(&self, email: &str, password: &str) -> Result<User, SyncError> {
    let session = self
      .conn
      .execute("sign in", |remote| async move { remote.sign_in(email, password).await })
      .await
      .map_err(|e| self.surface("sign in", e))?;
    self.set_actor(Some(session.user.clone()));
    Ok(session.user)
  }

  pub async fn sign_out(&self) -> Result<(), SyncError> {
    self
      .conn
      .execute("sign out", |remote| async move { remote.sign_out().await })
      .await
      .map_err(|e| self.surface("sign out", e))?;
    self.set_actor(None);
    Ok(())
  }

  /// Ask the remote whether the session is still valid, updating the actor
  /// to match.
  pub async fn current_session(&self) -> Result<Option<User>, SyncError> {
    let session = self
      .conn
      .execute("get session", |remote| async move { remote.current_session().await })
      .await
      .map_err(|e| self.surface("get session", e))?;
    let user = session.map(|s| s.user);
    self.set_actor(user.clone());
    Ok(user)
  }

  /// Background variant of [`current_session`](Self::current_session): a
  /// single attempt that never touches the connection state. An expired
  /// session clears the actor.
  pub async fn check_session(&self) -> Result<Option<User>, RemoteError> {
    let session = self
      .conn
      .probe(|remote| async move { remote.current_session().await })
      .await?;
    let user = session.map(|s| s.user);
    self.set_actor(user.clone());
    Ok(user)
  }

  pub async fn current_user(&self) -> Result<Option<User>, SyncError> {
    self
      .conn
      .execute("get user", |remote| async move { remote.current_user().await })
      .await
      .map_err(|e| self.surface("get user", e))
  }

  fn set_actor(&self, user: Option<User>) {
    let changed = {
      let mut actor = self.actor.write();
      let changed = *actor != user;
      *actor = user.clone();
      changed
    };
    if changed {
      self.emit(StoreEvent::ActorChanged(user));
    }
  }

  // ==========================================================================
  // Error mapping
  // ==========================================================================

  fn decode_written(&self, kind: EntityKind, row: Fields) -> Result<Entity, SyncError> {
    Entity::from_row(row).map_err(|e| {
      // The write happened, but we cannot mirror it; refetch next time
      error!(%kind, error = %e, "failed to decode written row");
      self.cache.invalidate(kind);
      SyncError::Unexpected(format!("failed to decode {} row: {}", kind, e))
    })
  }

  /// A write that gave up after reaching the remote may still have landed,
  /// so the cached collection can no longer be trusted as fresh.
  fn surface_write(&self, kind: EntityKind, operation: &str, err: ConnectionError) -> SyncError {
    if matches!(err, ConnectionError::Exhausted { .. }) {
      self.cache.invalidate(kind);
    }
    self.surface(operation, err)
  }

  fn surface(&self, operation: &str, err: ConnectionError) -> SyncError {
    match err {
      ConnectionError::Rejected(RemoteError::Validation(m)) => SyncError::Validation(m),
      ConnectionError::Rejected(RemoteError::NotFound(m)) => SyncError::NotFound(m),
      ConnectionError::Rejected(RemoteError::Unauthorized(m)) => SyncError::Unauthorized(m),
      ConnectionError::Rejected(other) => {
        error!(operation, error = %other, "unexpected remote failure");
        SyncError::Unexpected(other.to_string())
      }
      e @ (ConnectionError::Exhausted { .. } | ConnectionError::Reconnect(_)) => {
        warn!(operation, error = %e, "remote unreachable");
        SyncError::Disconnected(e)
      }
    }
  }
}
