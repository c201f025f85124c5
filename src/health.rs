//! Background keepalive and session checks.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::config::HealthConfig;
use crate::connection::ConnectionState;
use crate::entity::EntityKind;
use crate::remote::SelectQuery;
use crate::store::SyncStore;

/// Owns the two periodic background tasks. Dropping it stops them.
pub struct HealthMonitor {
  tasks: Vec<JoinHandle<()>>,
}

impl HealthMonitor {
  pub fn spawn(store: Arc<SyncStore>, config: &HealthConfig) -> Self {
    let keepalive = tokio::spawn(keepalive_loop(
      store.clone(),
      config.probe_kind,
      config.keepalive_interval(),
    ));
    let session = tokio::spawn(session_loop(store, config.session_check_interval()));
    Self {
      tasks: vec![keepalive, session],
    }
  }

  pub fn shutdown(&mut self) {
    for task in self.tasks.drain(..) {
      task.abort();
    }
  }
}

impl Drop for HealthMonitor {
  fn drop(&mut self) {
    self.shutdown();
  }
}

/// Keeps a possibly cold backend warm with a one-row read. Best effort:
/// failures are dropped and never touch the connection state.
async fn keepalive_loop(store: Arc<SyncStore>, kind: EntityKind, every: Duration) {
  let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
  loop {
    ticker.tick().await;
    let result = store
      .connection()
      .probe(|remote| async move {
        remote
          .select(kind.collection(), &SelectQuery::probe())
          .await
      })
      .await;
    match result {
      Ok(_) => debug!("keepalive ok"),
      Err(e) => debug!(error = %e, "keepalive failed"),
    }
  }
}

/// While connected, confirms the session is still valid and refreshes the
/// owned views if so. An expired session signs the store out.
async fn session_loop(store: Arc<SyncStore>, every: Duration) {
  let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
  loop {
    ticker.tick().await;
    if store.connection_state() != ConnectionState::Connected {
      continue;
    }
    match store.check_session().await {
      Ok(Some(user)) => {
        debug!(user = %user.id, "session valid, refreshing owned content");
        store.refresh_owned_all().await;
      }
      Ok(None) => debug!("no active session"),
      Err(e) => debug!(error = %e, "session check failed"),
    }
  }
}
