//! Content entities and the ordered collections the store hands out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// A JSON object row as exchanged with the remote store.
pub type Fields = serde_json::Map<String, Value>;

/// Content types tracked by the store. Each maps to one remote collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
  Article,
  Course,
  Project,
}

impl EntityKind {
  pub const ALL: [EntityKind; 3] = [EntityKind::Article, EntityKind::Course, EntityKind::Project];

  /// Remote collection (table) name
  pub fn collection(self) -> &'static str {
    match self {
      EntityKind::Article => "articles",
      EntityKind::Course => "courses",
      EntityKind::Project => "projects",
    }
  }
}

impl fmt::Display for EntityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      EntityKind::Article => "article",
      EntityKind::Course => "course",
      EntityKind::Project => "project",
    };
    f.write_str(name)
  }
}

/// One content record. Snapshots are never edited in place; every change
/// produces a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
  #[serde(deserialize_with = "deserialize_id")]
  pub id: String,
  #[serde(default)]
  pub owner_id: Option<String>,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub updated_at: Option<DateTime<Utc>>,
  /// Everything else the row carries (title, body, tags, ...)
  #[serde(flatten)]
  pub fields: Fields,
}

impl Entity {
  /// Decode a remote row.
  pub fn from_row(row: Fields) -> serde_json::Result<Self> {
    serde_json::from_value(Value::Object(row))
  }

  pub fn title(&self) -> Option<&str> {
    self.fields.get("title").and_then(Value::as_str)
  }
}

/// Identifiers are opaque strings, but some collections use integer keys.
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
  D: serde::Deserializer<'de>,
{
  match Value::deserialize(deserializer)? {
    Value::String(s) => Ok(s),
    Value::Number(n) => Ok(n.to_string()),
    other => Err(serde::de::Error::custom(format!(
      "expected string or number id, got {}",
      other
    ))),
  }
}

/// Entities of one kind, newest first, unique by id.
///
/// Cloning is cheap: the entities live behind an `Arc` and every
/// modifying method returns a new collection, leaving the old one intact.
#[derive(Debug, Clone, Default)]
pub struct Collection(Arc<Vec<Entity>>);

impl Collection {
  pub fn empty() -> Self {
    Self::default()
  }

  /// Build a collection, sorting by `created_at` descending and keeping the
  /// first occurrence of any duplicated id.
  pub fn from_entities(mut entities: Vec<Entity>) -> Self {
    let mut seen = HashSet::new();
    entities.retain(|e| seen.insert(e.id.clone()));
    entities.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Self(Arc::new(entities))
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn iter(&self) -> std::slice::Iter<'_, Entity> {
    self.0.iter()
  }

  pub fn first(&self) -> Option<&Entity> {
    self.0.first()
  }

  pub fn get(&self, id: &str) -> Option<&Entity> {
    self.0.iter().find(|e| e.id == id)
  }

  #[cfg(test)]
  pub fn contains(&self, id: &str) -> bool {
    self.get(id).is_some()
  }

  /// True when both handles point at the same snapshot.
  #[cfg(test)]
  pub fn ptr_eq(&self, other: &Collection) -> bool {
    Arc::ptr_eq(&self.0, &other.0)
  }

  /// New collection with `entity` at the front.
  pub fn prepend(&self, entity: Entity) -> Self {
    let mut entities = Vec::with_capacity(self.len() + 1);
    entities.push(entity.clone());
    entities.extend(self.0.iter().filter(|e| e.id != entity.id).cloned());
    Self(Arc::new(entities))
  }

  /// Replace the entity with the same id, or insert it at its
  /// `created_at` position when absent.
  pub fn upsert(&self, entity: Entity) -> Self {
    let mut entities: Vec<Entity> = self.0.as_ref().clone();
    if let Some(slot) = entities.iter_mut().find(|e| e.id == entity.id) {
      *slot = entity;
    } else {
      let pos = entities
        .iter()
        .position(|e| e.created_at <= entity.created_at)
        .unwrap_or(entities.len());
      entities.insert(pos, entity);
    }
    Self(Arc::new(entities))
  }

  pub fn remove(&self, id: &str) -> Self {
    Self(Arc::new(
      self.0.iter().filter(|e| e.id != id).cloned().collect(),
    ))
  }

  pub fn filter(&self, mut keep: impl FnMut(&Entity) -> bool) -> Self {
    Self(Arc::new(self.0.iter().filter(|e| keep(e)).cloned().collect()))
  }
}

impl<'a> IntoIterator for &'a Collection {
  type Item = &'a Entity;
  type IntoIter = std::slice::Iter<'a, Entity>;

  fn into_iter(self) -> Self::IntoIter {
    self.iter()
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use chrono::TimeZone;

  pub(crate) fn entity(id: &str, secs: i64) -> Entity {
    let mut fields = Fields::new();
    fields.insert("title".into(), Value::String(format!("title {}", id)));
    Entity {
      id: id.to_string(),
      owner_id: Some("u1".to_string()),
      created_at: Utc.timestamp_opt(secs, 0).unwrap(),
      updated_at: None,
      fields,
    }
  }

  #[test]
  fn test_from_entities_sorts_newest_first_and_dedupes() {
    let c = Collection::from_entities(vec![entity("a", 1), entity("b", 3), entity("a", 9)]);
    let ids: Vec<_> = c.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["b", "a"]);
  }

  #[test]
  fn test_prepend_replaces_duplicate_id() {
    let c = Collection::from_entities(vec![entity("a", 1), entity("b", 2)]);
    let c2 = c.prepend(entity("a", 5));
    let ids: Vec<_> = c2.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    // original snapshot untouched
    assert_eq!(c.first().unwrap().id, "b");
  }

  #[test]
  fn test_upsert_inserts_in_order_when_missing() {
    let c = Collection::from_entities(vec![entity("a", 10), entity("c", 1)]);
    let c2 = c.upsert(entity("b", 5));
    let ids: Vec<_> = c2.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
  }

  #[test]
  fn test_upsert_replaces_existing() {
    let c = Collection::from_entities(vec![entity("a", 10)]);
    let mut changed = entity("a", 10);
    changed.fields.insert("title".into(), Value::String("B".into()));
    let c2 = c.upsert(changed);
    assert_eq!(c2.len(), 1);
    assert_eq!(c2.first().unwrap().title(), Some("B"));
  }

  #[test]
  fn test_entity_from_row_keeps_payload_fields() {
    let row = serde_json::json!({
      "id": "42",
      "owner_id": "u9",
      "created_at": "2024-01-02T03:04:05Z",
      "title": "Hello",
      "tags": ["x"]
    });
    let Value::Object(row) = row else { unreachable!() };
    let e = Entity::from_row(row).unwrap();
    assert_eq!(e.id, "42");
    assert_eq!(e.owner_id.as_deref(), Some("u9"));
    assert_eq!(e.title(), Some("Hello"));
    assert!(e.fields.contains_key("tags"));
    assert!(!e.fields.contains_key("id"));
  }
}
