//! Document database backends.
//!
//! The [`Backend`] trait is the seam between the sync layer and the hosted
//! document store. Two implementations ship with the crate:
//! - [`MemoryBackend`]: in-process store with live listeners, used in tests
//!   and demos
//! - [`FirestoreBackend`]: Firestore REST API, with live queries implemented
//!   by polling

mod firestore;
mod memory;
mod value;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::query::QuerySpec;

pub use firestore::FirestoreBackend;
pub use memory::MemoryBackend;
pub use value::{decode_fields, encode_fields};

/// Stream of query snapshots. Each item is the complete result set at that point.
pub type SnapshotStream = BoxStream<'static, Result<Vec<Document>>>;

/// A document as read from the store.
///
/// The document id is also injected into `data` under `"id"`, so records can
/// be deserialized straight from `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
  pub id: String,
  pub data: Value,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub update_time: Option<String>,
}

impl Document {
  pub fn new(id: impl Into<String>, data: Value) -> Self {
    let id = id.into();
    let mut fields = match data {
      Value::Object(map) => map,
      Value::Null => Map::new(),
      other => {
        let mut map = Map::new();
        map.insert("value".to_string(), other);
        map
      }
    };
    fields.insert("id".to_string(), Value::String(id.clone()));

    Self {
      id,
      data: Value::Object(fields),
      update_time: None,
    }
  }

  pub fn with_update_time(mut self, update_time: impl Into<String>) -> Self {
    self.update_time = Some(update_time.into());
    self
  }

  /// Look up a field by dotted path (`"grade.score"`).
  pub fn field(&self, path: &str) -> Option<&Value> {
    path
      .split('.')
      .try_fold(&self.data, |value, segment| value.get(segment))
  }
}

/// Remove the `id` key from a record before it is written, since the id lives
/// in the document path.
pub fn strip_id(mut data: Value) -> Value {
  if let Value::Object(map) = &mut data {
    map.remove("id");
  }
  data
}

/// Operations the sync layer needs from a hosted document store.
#[async_trait]
pub trait Backend: Send + Sync {
  /// One-shot read of every document matching `query`.
  async fn get_documents(&self, query: &QuerySpec) -> Result<Vec<Document>>;

  /// One-shot read of a single document. `Ok(None)` when it does not exist.
  async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Document>>;

  /// Live subscription to `query`. The first item is the current result set.
  fn listen(&self, query: &QuerySpec) -> SnapshotStream;

  /// Create or overwrite a document.
  async fn set_document(&self, collection: &str, id: &str, data: Value) -> Result<()>;

  /// Create a document with a generated id and return the id.
  async fn add_document(&self, collection: &str, data: Value) -> Result<String>;

  /// Merge top-level fields of `patch` into an existing document.
  async fn update_document(&self, collection: &str, id: &str, patch: Value) -> Result<()>;

  async fn delete_document(&self, collection: &str, id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_document_injects_id_and_resolves_paths() {
    let doc = Document::new("s1", json!({"grade": {"score": 8}, "status": "graded"}));
    assert_eq!(doc.field("id"), Some(&json!("s1")));
    assert_eq!(doc.field("grade.score"), Some(&json!(8)));
    assert_eq!(doc.field("grade.missing"), None);
  }

  #[test]
  fn test_strip_id() {
    assert_eq!(strip_id(json!({"id": "x", "name": "n"})), json!({"name": "n"}));
  }
}
