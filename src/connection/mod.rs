//! Connection manager: one shared remote handle, retry with backoff, and the
//! connection health state machine.

mod timeout;

pub use timeout::with_timeout;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::remote::{Connector, RemoteError, RemoteStore};

/// Health of the link to the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
  Connected,
  Connecting,
  Disconnected,
}

impl fmt::Display for ConnectionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Connected => write!(f, "connected"),
      Self::Connecting => write!(f, "connecting"),
      Self::Disconnected => write!(f, "disconnected"),
    }
  }
}

/// Retry and timeout bounds applied to every remote call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
  /// Total attempts including the first
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
  /// Deadline for a single attempt
  pub request_timeout: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay: Duration::from_millis(500),
      max_delay: Duration::from_secs(5),
      request_timeout: Duration::from_secs(10),
    }
  }
}

impl RetryPolicy {
  /// Delay before retrying after the given (1-based) failed attempt.
  pub fn backoff(&self, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    self.base_delay.saturating_mul(factor).min(self.max_delay)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
  /// Every attempt failed transiently; the state is now `Disconnected`
  #[error("{operation} failed after {attempts} attempts: {last}")]
  Exhausted {
    operation: String,
    attempts: u32,
    last: RemoteError,
  },
  /// The remote answered with a non-retryable error
  #[error(transparent)]
  Rejected(RemoteError),
  #[error("reconnect failed: {0}")]
  Reconnect(RemoteError),
}

impl ConnectionError {
  /// The remote error behind this failure.
  pub fn remote(&self) -> &RemoteError {
    match self {
      Self::Exhausted { last, .. } => last,
      Self::Rejected(e) | Self::Reconnect(e) => e,
    }
  }
}

type ReconnectFuture = Shared<BoxFuture<'static, Result<(), ConnectionError>>>;
type Handle = Arc<RwLock<Option<Arc<dyn RemoteStore>>>>;

/// Owns the remote handle and publishes [`ConnectionState`].
pub struct ConnectionManager {
  connector: Arc<dyn Connector>,
  handle: Handle,
  state: Arc<watch::Sender<ConnectionState>>,
  policy: RetryPolicy,
  /// The in-flight reconnect, tagged so only its own callers clear it
  inflight: Mutex<Option<(u64, ReconnectFuture)>>,
  reconnect_seq: AtomicU64,
}

impl ConnectionManager {
  /// Create a manager with no handle yet. State starts `Disconnected`.
  pub fn new(connector: Arc<dyn Connector>, policy: RetryPolicy) -> Self {
    let (state, _) = watch::channel(ConnectionState::Disconnected);
    Self {
      connector,
      handle: Arc::new(RwLock::new(None)),
      state: Arc::new(state),
      policy,
      inflight: Mutex::new(None),
      reconnect_seq: AtomicU64::new(0),
    }
  }

  /// Create a manager and make the first connection attempt. A failed
  /// attempt leaves the manager usable in the `Disconnected` state.
  pub async fn start(connector: Arc<dyn Connector>, policy: RetryPolicy) -> Self {
    let manager = Self::new(connector, policy);
    if let Err(e) = manager.reconnect().await {
      warn!(error = %e, "initial connection failed");
    }
    manager
  }

  pub fn state(&self) -> ConnectionState {
    *self.state.borrow()
  }

  pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
    self.state.subscribe()
  }

  pub(crate) fn mark_disconnected(&self) {
    set_state(&self.state, ConnectionState::Disconnected);
  }

  /// Run one logical remote call with timeout and retry.
  ///
  /// Transient failures are retried with backoff; when attempts run out a
  /// single `Exhausted` error is returned and the state flips to
  /// `Disconnected`. Anything else is returned as-is without retrying.
  pub async fn execute<T, F, Fut>(&self, operation: &str, op: F) -> Result<T, ConnectionError>
  where
    F: Fn(Arc<dyn RemoteStore>) -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
  {
    self.run(operation, true, op).await
  }

  /// Like [`execute`](Self::execute), for writes that must not be sent
  /// twice. Failing to obtain a handle is still retried, but once the call
  /// has reached the remote a transient failure or timeout is final: the
  /// write may have been applied.
  pub async fn execute_once<T, F, Fut>(&self, operation: &str, op: F) -> Result<T, ConnectionError>
  where
    F: Fn(Arc<dyn RemoteStore>) -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
  {
    self.run(operation, false, op).await
  }

  async fn run<T, F, Fut>(&self, operation: &str, resend: bool, op: F) -> Result<T, ConnectionError>
  where
    F: Fn(Arc<dyn RemoteStore>) -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
  {
    let mut attempt = 0;
    loop {
      attempt += 1;

      let (reached, outcome) = match self.handle_or_connect().await {
        Ok(remote) => {
          let outcome = with_timeout(op(remote), self.policy.request_timeout)
            .await
            .unwrap_or_else(|e| Err(RemoteError::Transient(e.to_string())));
          (true, outcome)
        }
        Err(e) => (false, Err(e)),
      };

      match outcome {
        Ok(value) => {
          set_state(&self.state, ConnectionState::Connected);
          return Ok(value);
        }
        Err(e) if !e.is_transient() && reached => {
          // The remote answered, so the link itself is fine
          set_state(&self.state, ConnectionState::Connected);
          return Err(ConnectionError::Rejected(e));
        }
        Err(e)
          if attempt >= self.policy.max_attempts
            || (!e.is_transient() && !reached)
            || (reached && !resend) =>
        {
          warn!(operation, attempt, error = %e, "giving up on remote call");
          set_state(&self.state, ConnectionState::Disconnected);
          return Err(ConnectionError::Exhausted {
            operation: operation.to_string(),
            attempts: attempt,
            last: e,
          });
        }
        Err(e) => {
          let delay = self.policy.backoff(attempt);
          debug!(operation, attempt, ?delay, error = %e, "remote call failed, retrying");
          tokio::time::sleep(delay).await;
        }
      }
    }
  }

  /// One timed attempt on the current handle. Never changes the
  /// connection state.
  pub async fn probe<T, F, Fut>(&self, op: F) -> Result<T, RemoteError>
  where
    F: FnOnce(Arc<dyn RemoteStore>) -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
  {
    let remote = self
      .current()
      .ok_or_else(|| RemoteError::Transient("not connected".into()))?;
    with_timeout(op(remote), self.policy.request_timeout)
      .await
      .unwrap_or_else(|e| Err(RemoteError::Transient(e.to_string())))
  }

  /// Re-establish the remote handle.
  ///
  /// Calls made while an attempt is in flight wait for that attempt instead
  /// of starting their own.
  pub async fn reconnect(&self) -> Result<(), ConnectionError> {
    let (seq, attempt) = {
      let mut slot = self.inflight.lock();
      match slot.as_ref() {
        Some((seq, fut)) => (*seq, fut.clone()),
        None => {
          let seq = self.reconnect_seq.fetch_add(1, Ordering::SeqCst) + 1;
          let fut = reconnect_once(
            self.connector.clone(),
            self.handle.clone(),
            self.state.clone(),
            self.policy.request_timeout,
          )
          .boxed()
          .shared();
          *slot = Some((seq, fut.clone()));
          (seq, fut)
        }
      }
    };

    let result = attempt.await;

    let mut slot = self.inflight.lock();
    if matches!(slot.as_ref(), Some((s, _)) if *s == seq) {
      *slot = None;
    }
    result
  }

  fn current(&self) -> Option<Arc<dyn RemoteStore>> {
    self.handle.read().clone()
  }

  async fn handle_or_connect(&self) -> Result<Arc<dyn RemoteStore>, RemoteError> {
    if let Some(remote) = self.current() {
      return Ok(remote);
    }
    self.reconnect().await.map_err(|e| e.remote().clone())?;
    self
      .current()
      .ok_or_else(|| RemoteError::Transient("not connected".into()))
  }
}

async fn reconnect_once(
  connector: Arc<dyn Connector>,
  handle: Handle,
  state: Arc<watch::Sender<ConnectionState>>,
  limit: Duration,
) -> Result<(), ConnectionError> {
  set_state(&state, ConnectionState::Connecting);
  let outcome = with_timeout(connector.connect(), limit)
    .await
    .unwrap_or_else(|e| Err(RemoteError::Transient(e.to_string())));
  match outcome {
    Ok(remote) => {
      *handle.write() = Some(remote);
      set_state(&state, ConnectionState::Connected);
      Ok(())
    }
    Err(e) => {
      warn!(error = %e, "reconnect failed");
      set_state(&state, ConnectionState::Disconnected);
      Err(ConnectionError::Reconnect(e))
    }
  }
}

fn set_state(state: &watch::Sender<ConnectionState>, next: ConnectionState) {
  let changed = state.send_if_modified(|current| {
    if *current == next {
      false
    } else {
      *current = next;
      true
    }
  });
  if changed {
    info!(state = %next, "connection state changed");
  }
}
