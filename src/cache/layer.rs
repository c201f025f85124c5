//! Cache layer that decides between cached collections and network fetching.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::result::CacheResult;
use crate::entity::{Collection, EntityKind};

/// Cached state for one entity kind.
#[derive(Debug, Clone, Default)]
pub struct CacheEntry {
  pub collection: Option<Collection>,
  /// Set only by successful fetches; local mutations leave it alone
  pub fetched_at: Option<Instant>,
  /// Wall-clock twin of `fetched_at`, for display
  pub cached_at: Option<DateTime<Utc>>,
  /// Generation of the last write applied to this entry
  generation: u64,
}

/// Last known collection per kind plus the freshness bookkeeping.
pub struct EntityCache {
  entries: RwLock<HashMap<EntityKind, CacheEntry>>,
  /// How long before cached data is considered stale
  stale_time: Duration,
  generation: AtomicU64,
}

impl EntityCache {
  pub fn new(stale_time: Duration) -> Self {
    Self {
      entries: RwLock::new(HashMap::new()),
      stale_time,
      generation: AtomicU64::new(0),
    }
  }

  pub fn entry(&self, kind: EntityKind) -> CacheEntry {
    self.entries.read().get(&kind).cloned().unwrap_or_default()
  }

  pub fn collection(&self, kind: EntityKind) -> Option<Collection> {
    self.entries.read().get(&kind).and_then(|e| e.collection.clone())
  }

  /// The cached collection if it was fetched less than the stale time ago.
  pub fn fresh(&self, kind: EntityKind) -> Option<(Collection, Option<DateTime<Utc>>)> {
    let entries = self.entries.read();
    let entry = entries.get(&kind)?;
    let fetched_at = entry.fetched_at?;
    if fetched_at.elapsed() < self.stale_time {
      entry.collection.clone().map(|c| (c, entry.cached_at))
    } else {
      None
    }
  }

  /// Reserve a generation for a fetch that is about to start.
  pub fn begin_fetch(&self) -> u64 {
    self.generation.fetch_add(1, Ordering::SeqCst) + 1
  }

  /// Store a fetched collection unless something newer was written since
  /// the fetch began. Returns whether the collection was stored.
  pub fn commit_fetch(&self, kind: EntityKind, generation: u64, collection: Collection) -> bool {
    let mut entries = self.entries.write();
    let entry = entries.entry(kind).or_default();
    if generation <= entry.generation {
      debug!(%kind, generation, current = entry.generation, "discarding outdated fetch");
      return false;
    }
    entry.collection = Some(collection);
    entry.fetched_at = Some(Instant::now());
    entry.cached_at = Some(Utc::now());
    entry.generation = generation;
    true
  }

  /// Apply a confirmed remote write to the cached collection.
  ///
  /// Takes a fresh generation, so fetches that started before this write
  /// can no longer replace it.
  pub fn apply(&self, kind: EntityKind, change: impl FnOnce(&Collection) -> Collection) -> Collection {
    let generation = self.begin_fetch();
    let mut entries = self.entries.write();
    let entry = entries.entry(kind).or_default();
    let current = entry.collection.clone().unwrap_or_default();
    let next = change(&current);
    entry.collection = Some(next.clone());
    entry.generation = generation;
    next
  }

  /// Keep the collection but force the next read to refetch.
  pub fn invalidate(&self, kind: EntityKind) {
    if let Some(entry) = self.entries.write().get_mut(&kind) {
      entry.fetched_at = None;
    }
  }

  /// Forget everything, as on a fresh start.
  pub fn clear(&self) {
    self.entries.write().clear();
  }

  /// Fetch a collection with a cache-first strategy.
  ///
  /// 1. Unless forced, return a fresh cached collection immediately
  /// 2. Otherwise run the fetcher
  /// 3. On failure, return the previous collection if there is one
  /// 4. Store the result, unless a newer write landed meanwhile
  pub async fn get_or_fetch<F, Fut, E>(
    &self,
    kind: EntityKind,
    force_refresh: bool,
    fetcher: F,
  ) -> Result<CacheResult<Collection>, E>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Collection, E>>,
    E: std::fmt::Display,
  {
    if !force_refresh {
      if let Some((collection, cached_at)) = self.fresh(kind) {
        return Ok(CacheResult::from_cache(collection, cached_at));
      }
    }

    let generation = self.begin_fetch();
    match fetcher().await {
      Ok(collection) => {
        if self.commit_fetch(kind, generation, collection.clone()) {
          Ok(CacheResult::from_network(collection))
        } else {
          // A newer write won; hand out that instead
          let entry = self.entry(kind);
          Ok(CacheResult::from_cache(
            entry.collection.unwrap_or(collection),
            entry.cached_at,
          ))
        }
      }
      Err(e) => {
        let entry = self.entry(kind);
        match entry.collection {
          Some(previous) => {
            warn!(%kind, error = %e, "refresh failed, keeping previous collection");
            Ok(CacheResult::offline(previous, entry.cached_at))
          }
          None => Err(e),
        }
      }
    }
  }
}
