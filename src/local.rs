//! Local state that lives outside the remote store: display preferences,
//! unsubmitted drafts, the saved sign-in, and the view-counting session id.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::entity::EntityKind;

/// Fixed key of the draft for the "new <kind>" form.
pub fn new_entity_draft_key(kind: EntityKind) -> String {
  format!("draft:new-{}", kind)
}

/// A stored draft and when it was last saved.
#[derive(Debug, Clone)]
pub struct Draft<T> {
  pub data: T,
  pub updated_at: DateTime<Utc>,
}

/// SQLite-backed local state.
pub struct LocalState {
  conn: Mutex<Connection>,
  session_id: String,
}

impl LocalState {
  /// Open the local database at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;

    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create data directory: {}", e))?;
    }

    Self::open_at(&path)
  }

  pub fn open_at(path: &Path) -> Result<Self> {
    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open local database at {}: {}", path.display(), e))?;
    Self::with_connection(conn)
  }

  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(LOCAL_SCHEMA)
      .map_err(|e| eyre!("Failed to run local migrations: {}", e))?;
    Ok(Self {
      conn: Mutex::new(conn),
      session_id: generate_session_id(),
    })
  }

  /// Get the default database path.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("strata").join("local.db"))
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Identifier for deduplicating view counts. Stable for the lifetime of
  /// this process, never persisted.
  pub fn session_id(&self) -> &str {
    &self.session_id
  }

  pub fn dark_mode(&self) -> Result<bool> {
    let conn = self.lock()?;
    let value: Option<String> = conn
      .query_row("SELECT value FROM prefs WHERE key = 'dark_mode'", [], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| eyre!("Failed to read theme preference: {}", e))?;
    Ok(value.as_deref() == Some("1"))
  }

  pub fn set_dark_mode(&self, enabled: bool) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO prefs (key, value) VALUES ('dark_mode', ?)",
        params![if enabled { "1" } else { "0" }],
      )
      .map_err(|e| eyre!("Failed to store theme preference: {}", e))?;
    Ok(())
  }

  /// Access token of the last sign-in, if it has not been signed out.
  pub fn auth_token(&self) -> Result<Option<String>> {
    let conn = self.lock()?;
    conn
      .query_row("SELECT value FROM prefs WHERE key = 'auth_token'", [], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| eyre!("Failed to read stored session: {}", e))
  }

  pub fn set_auth_token(&self, token: Option<&str>) -> Result<()> {
    let conn = self.lock()?;
    let result = match token {
      Some(token) => conn.execute(
        "INSERT OR REPLACE INTO prefs (key, value) VALUES ('auth_token', ?)",
        params![token],
      ),
      None => conn.execute("DELETE FROM prefs WHERE key = 'auth_token'", []),
    };
    result.map_err(|e| eyre!("Failed to store session: {}", e))?;
    Ok(())
  }

  /// Save (or overwrite) the draft under `key`.
  pub fn save_draft<T: Serialize>(&self, key: &str, draft: &T) -> Result<()> {
    let data = serde_json::to_vec(draft).map_err(|e| eyre!("Failed to serialize draft: {}", e))?;
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO drafts (draft_key, data, updated_at) VALUES (?, ?, ?)",
        params![key, data, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to store draft {}: {}", key, e))?;
    Ok(())
  }

  pub fn load_draft<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Draft<T>>> {
    let conn = self.lock()?;
    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, updated_at FROM drafts WHERE draft_key = ?",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read draft {}: {}", key, e))?;

    match row {
      Some((data, updated_at)) => {
        let data: T =
          serde_json::from_slice(&data).map_err(|e| eyre!("Failed to parse draft {}: {}", key, e))?;
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
          .map_err(|e| eyre!("Failed to parse draft timestamp '{}': {}", updated_at, e))?
          .with_timezone(&Utc);
        Ok(Some(Draft { data, updated_at }))
      }
      None => Ok(None),
    }
  }

  /// Remove a draft. Returns whether one existed.
  pub fn clear_draft(&self, key: &str) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute("DELETE FROM drafts WHERE draft_key = ?", params![key])
      .map_err(|e| eyre!("Failed to clear draft {}: {}", key, e))?;
    Ok(removed > 0)
  }
}

/// Schema for local tables.
const LOCAL_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS prefs (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS drafts (
    draft_key TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

fn generate_session_id() -> String {
  static COUNTER: AtomicU64 = AtomicU64::new(0);

  let mut hasher = Sha256::new();
  hasher.update(std::process::id().to_le_bytes());
  hasher.update(
    Utc::now()
      .timestamp_nanos_opt()
      .unwrap_or_default()
      .to_le_bytes(),
  );
  hasher.update(COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
  let digest = hasher.finalize();
  hex::encode(&digest[..16])
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_dark_mode_defaults_off_and_persists() {
    let local = LocalState::open_in_memory().unwrap();
    assert!(!local.dark_mode().unwrap());
    local.set_dark_mode(true).unwrap();
    assert!(local.dark_mode().unwrap());
    local.set_dark_mode(false).unwrap();
    assert!(!local.dark_mode().unwrap());
  }

  #[test]
  fn test_auth_token_set_and_cleared() {
    let local = LocalState::open_in_memory().unwrap();
    assert_eq!(local.auth_token().unwrap(), None);
    local.set_auth_token(Some("abc")).unwrap();
    assert_eq!(local.auth_token().unwrap().as_deref(), Some("abc"));
    local.set_auth_token(None).unwrap();
    assert_eq!(local.auth_token().unwrap(), None);
  }

  #[test]
  fn test_draft_round_trip_and_clear() {
    let local = LocalState::open_in_memory().unwrap();
    let key = new_entity_draft_key(EntityKind::Course);
    assert_eq!(key, "draft:new-course");

    local.save_draft(&key, &json!({ "title": "Half done" })).unwrap();
    let draft: Draft<serde_json::Value> = local.load_draft(&key).unwrap().unwrap();
    assert_eq!(draft.data["title"], "Half done");

    assert!(local.clear_draft(&key).unwrap());
    assert!(local.load_draft::<serde_json::Value>(&key).unwrap().is_none());
    assert!(!local.clear_draft(&key).unwrap());
  }

  #[test]
  fn test_drafts_survive_reopen() {
    let dir = std::env::temp_dir().join(format!("strata-local-{}", generate_session_id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("local.db");

    {
      let local = LocalState::open_at(&path).unwrap();
      local.save_draft("draft:new-article", &json!({ "title": "kept" })).unwrap();
    }
    let local = LocalState::open_at(&path).unwrap();
    let draft: Draft<serde_json::Value> = local.load_draft("draft:new-article").unwrap().unwrap();
    assert_eq!(draft.data["title"], "kept");

    std::fs::remove_dir_all(&dir).ok();
  }

  #[test]
  fn test_session_ids_differ_per_instance() {
    let a = LocalState::open_in_memory().unwrap();
    let b = LocalState::open_in_memory().unwrap();
    assert_eq!(a.session_id().len(), 32);
    assert_ne!(a.session_id(), b.session_id());
  }
}
