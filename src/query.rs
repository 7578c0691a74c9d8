//! Query descriptions for document collections.
//!
//! A [`QuerySpec`] names a collection plus optional filters, ordering and a
//! limit. It is the unit of caching (see [`QueryKey::cache_hash`](crate::cache::QueryKey)) and the
//! thing a live subscription listens to.
//!
//! ```ignore
//! let query = QuerySpec::collection("assignments")
//!   .where_eq("classId", "c-101")
//!   .order_by("dueDate", Direction::Ascending)
//!   .limit(50);
//! ```

use std::cmp::Ordering;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::backend::Document;
use crate::cache::QueryKey;

/// Comparison applied by a [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
  Eq,
  NotEq,
  Lt,
  Lte,
  Gt,
  Gte,
  /// Field is an array that contains the value
  ArrayContains,
  /// Field equals one of the values in the given array
  In,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
  pub field: String,
  pub op: FilterOp,
  pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
  Ascending,
  Descending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
  pub field: String,
  pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
  pub collection: String,
  #[serde(default)]
  pub filters: Vec<Filter>,
  #[serde(default)]
  pub order_by: Vec<OrderBy>,
  #[serde(default)]
  pub limit: Option<usize>,
}

impl QuerySpec {
  /// Query every document of a collection.
  pub fn collection(name: impl Into<String>) -> Self {
    Self {
      collection: name.into(),
      filters: Vec::new(),
      order_by: Vec::new(),
      limit: None,
    }
  }

  pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
    self.filters.push(Filter {
      field: field.into(),
      op,
      value: value.into(),
    });
    self
  }

  pub fn where_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
    self.filter(field, FilterOp::Eq, value)
  }

  pub fn array_contains(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
    self.filter(field, FilterOp::ArrayContains, value)
  }

  pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
    self.order_by.push(OrderBy {
      field: field.into(),
      direction,
    });
    self
  }

  pub fn limit(mut self, limit: usize) -> Self {
    self.limit = Some(limit);
    self
  }

  /// Whether a document passes every filter of this query.
  pub fn matches(&self, doc: &Document) -> bool {
    self.filters.iter().all(|f| {
      let field = doc.field(&f.field);
      match f.op {
        FilterOp::Eq => field == Some(&f.value),
        FilterOp::NotEq => field.is_some_and(|v| v != &f.value),
        FilterOp::Lt => compare(field, &f.value) == Some(Ordering::Less),
        FilterOp::Lte => matches!(
          compare(field, &f.value),
          Some(Ordering::Less | Ordering::Equal)
        ),
        FilterOp::Gt => compare(field, &f.value) == Some(Ordering::Greater),
        FilterOp::Gte => matches!(
          compare(field, &f.value),
          Some(Ordering::Greater | Ordering::Equal)
        ),
        FilterOp::ArrayContains => field
          .and_then(Value::as_array)
          .is_some_and(|items| items.contains(&f.value)),
        FilterOp::In => f
          .value
          .as_array()
          .is_some_and(|candidates| field.is_some_and(|v| candidates.contains(v))),
      }
    })
  }

  /// Filter, order and truncate a set of documents the way the backend would.
  pub fn apply(&self, docs: impl IntoIterator<Item = Document>) -> Vec<Document> {
    let mut result: Vec<Document> = docs.into_iter().filter(|d| self.matches(d)).collect();

    if !self.order_by.is_empty() {
      result.sort_by(|a, b| {
        for order in &self.order_by {
          let ord = compare_values(a.field(&order.field), b.field(&order.field));
          let ord = match order.direction {
            Direction::Ascending => ord,
            Direction::Descending => ord.reverse(),
          };
          if ord != Ordering::Equal {
            return ord;
          }
        }
        Ordering::Equal
      });
    }

    if let Some(limit) = self.limit {
      result.truncate(limit);
    }
    result
  }
}

impl QueryKey for QuerySpec {
  fn cache_hash(&self) -> String {
    // serde_json serializes struct fields in declaration order and maps sorted,
    // so equal queries produce equal input.
    let input = serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self));

    let mut hasher = Sha256::new();
    hasher.update(normalize_collection(&self.collection).as_bytes());
    hasher.update(input.as_bytes());
    let digest = hex::encode(hasher.finalize());

    format!("{}:{}", normalize_collection(&self.collection), digest)
  }

  fn description(&self) -> String {
    let mut parts = vec![self.collection.clone()];
    for f in &self.filters {
      parts.push(format!("{} {:?} {}", f.field, f.op, f.value));
    }
    for o in &self.order_by {
      parts.push(format!("order by {} {:?}", o.field, o.direction));
    }
    if let Some(limit) = self.limit {
      parts.push(format!("limit {}", limit));
    }
    parts.join(", ")
  }
}

/// Prefix under which every cache key of a collection lives.
pub fn collection_prefix(collection: &str) -> String {
  format!("{}:", normalize_collection(collection))
}

fn normalize_collection(collection: &str) -> String {
  collection.trim().trim_matches('/').to_string()
}

fn compare(field: Option<&Value>, value: &Value) -> Option<Ordering> {
  match (field?, value) {
    (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
    (Value::String(a), Value::String(b)) => Some(compare_strings(a, b)),
    (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
    _ => None,
  }
}

/// RFC 3339 timestamps compare as instants, since their fractional seconds
/// vary in length; anything else compares lexically.
fn compare_strings(a: &str, b: &str) -> Ordering {
  match (DateTime::parse_from_rfc3339(a), DateTime::parse_from_rfc3339(b)) {
    (Ok(a), Ok(b)) => a.cmp(&b),
    _ => a.cmp(b),
  }
}

/// Total order used for sorting: missing < null < bool < number < string < other.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
  fn rank(v: Option<&Value>) -> u8 {
    match v {
      None => 0,
      Some(Value::Null) => 1,
      Some(Value::Bool(_)) => 2,
      Some(Value::Number(_)) => 3,
      Some(Value::String(_)) => 4,
      Some(_) => 5,
    }
  }

  match (a, b) {
    (Some(x), Some(y)) if rank(a) == rank(b) => {
      compare(Some(x), y).unwrap_or(Ordering::Equal)
    }
    _ => rank(a).cmp(&rank(b)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn doc(id: &str, data: Value) -> Document {
    Document::new(id, data)
  }

  #[test]
  fn test_cache_key_is_stable_and_scoped_to_collection() {
    let a = QuerySpec::collection("assignments").where_eq("classId", "c1");
    let b = QuerySpec::collection("assignments").where_eq("classId", "c1");
    let c = QuerySpec::collection("assignments").where_eq("classId", "c2");

    assert_eq!(a.cache_hash(), b.cache_hash());
    assert_ne!(a.cache_hash(), c.cache_hash());
    assert!(a.cache_hash().starts_with(&collection_prefix("assignments")));
  }

  #[test]
  fn test_filters_and_ordering() {
    let docs = vec![
      doc("a", json!({"classId": "c1", "dueDate": "2026-03-02", "score": 7})),
      doc("b", json!({"classId": "c1", "dueDate": "2026-03-01", "score": 9})),
      doc("c", json!({"classId": "c2", "dueDate": "2026-02-01", "score": 3})),
    ];

    let query = QuerySpec::collection("assignments")
      .where_eq("classId", "c1")
      .order_by("dueDate", Direction::Ascending);
    let ids: Vec<_> = query.apply(docs.clone()).into_iter().map(|d| d.id).collect();
    assert_eq!(ids, vec!["b", "a"]);

    let query = QuerySpec::collection("assignments")
      .filter("score", FilterOp::Gte, 7)
      .order_by("score", Direction::Descending)
      .limit(1);
    let ids: Vec<_> = query.apply(docs).into_iter().map(|d| d.id).collect();
    assert_eq!(ids, vec!["b"]);
  }

  #[test]
  fn test_timestamps_order_by_instant() {
    let docs = vec![
      doc("m2", json!({"sentAt": "2099-01-01T00:00:00.500Z"})),
      doc("m1", json!({"sentAt": "2099-01-01T00:00:00Z"})),
      doc("m3", json!({"sentAt": "2099-01-01T01:00:00.250+01:00"})),
    ];

    let query = QuerySpec::collection("chatMessages").order_by("sentAt", Direction::Ascending);
    let ids: Vec<_> = query.apply(docs.clone()).into_iter().map(|d| d.id).collect();
    assert_eq!(ids, vec!["m1", "m3", "m2"]);

    let query = QuerySpec::collection("chatMessages").filter(
      "sentAt",
      FilterOp::Gt,
      "2099-01-01T00:00:00.100Z",
    );
    let ids: Vec<_> = query.apply(docs).into_iter().map(|d| d.id).collect();
    assert_eq!(ids, vec!["m2", "m3"]);
  }

  #[test]
  fn test_array_contains_and_in() {
    let group = doc("g1", json!({"memberIds": ["s1", "s2"], "classId": "c1"}));

    assert!(QuerySpec::collection("groups")
      .array_contains("memberIds", "s2")
      .matches(&group));
    assert!(!QuerySpec::collection("groups")
      .array_contains("memberIds", "s9")
      .matches(&group));
    assert!(QuerySpec::collection("groups")
      .filter("classId", FilterOp::In, json!(["c0", "c1"]))
      .matches(&group));
  }

  #[test]
  fn test_id_field_is_filterable() {
    let query = QuerySpec::collection("classes").filter("id", FilterOp::In, json!(["x", "y"]));
    assert!(query.matches(&doc("x", json!({}))));
    assert!(!query.matches(&doc("z", json!({}))));
  }
}
