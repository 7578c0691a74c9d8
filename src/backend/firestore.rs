//! Firestore REST backend.
//!
//! One-shot reads use `documents:runQuery` and document GETs. Live queries
//! poll `runQuery` at a fixed interval and emit every result; change
//! detection upstream suppresses the repeats.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use super::value::{decode_fields, encode_fields, encode_value};
use super::{strip_id, Backend, Document, SnapshotStream};
use crate::config::BackendConfig;
use crate::error::{Result, SyncError};
use crate::query::{Direction, FilterOp, QuerySpec};

#[derive(Debug, Deserialize)]
struct ApiDocument {
  name: String,
  #[serde(default)]
  fields: Value,
  #[serde(rename = "updateTime")]
  update_time: Option<String>,
}

impl ApiDocument {
  fn into_document(self) -> Result<Document> {
    let id = document_id(&self.name).to_string();
    let data = decode_fields(&self.fields)?;
    let doc = Document::new(id, data);
    Ok(match self.update_time {
      Some(t) => doc.with_update_time(t),
      None => doc,
    })
  }
}

#[derive(Debug, Deserialize)]
struct RunQueryItem {
  document: Option<ApiDocument>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
  error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
  #[serde(default)]
  message: String,
  #[serde(default)]
  status: String,
}

/// Firestore REST client.
#[derive(Clone)]
pub struct FirestoreBackend {
  http: reqwest::Client,
  /// `{base}/projects/{project}/databases/{database}`
  database_url: Url,
  /// `projects/{project}/databases/{database}/documents`, used in references
  documents_name: String,
  token: Option<String>,
  poll_interval: Duration,
}

impl FirestoreBackend {
  pub fn new(config: &BackendConfig, token: Option<String>, poll_interval: Duration) -> Result<Self> {
    let mut database_url = Url::parse(&config.base_url)
      .map_err(|e| SyncError::validation(format!("Invalid backend url {}: {}", config.base_url, e)))?;
    database_url
      .path_segments_mut()
      .map_err(|_| SyncError::validation(format!("Backend url {} cannot have a path", config.base_url)))?
      .pop_if_empty()
      .extend(["projects", config.project_id.as_str(), "databases", config.database.as_str()]);

    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.request_timeout_secs))
      .build()
      .map_err(|e| SyncError::Backend(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self {
      http,
      database_url,
      documents_name: format!(
        "projects/{}/databases/{}/documents",
        config.project_id, config.database
      ),
      token,
      poll_interval,
    })
  }

  fn url(&self, segments: &[&str]) -> Url {
    let mut url = self.database_url.clone();
    if let Ok(mut path) = url.path_segments_mut() {
      path.extend(segments);
    }
    url
  }

  fn document_url(&self, collection: &str, id: &str) -> Url {
    self.url(&["documents", collection, id])
  }

  async fn send(&self, method: Method, url: Url, body: Option<Value>) -> Result<reqwest::Response> {
    tracing::trace!("{} {}", method, url);
    let mut request = self.http.request(method, url);
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }
    if let Some(body) = body {
      request = request.json(&body);
    }

    let response = request.send().await.map_err(transport_error)?;
    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, &body))
  }

  async fn run_query(&self, query: &QuerySpec) -> Result<Vec<Document>> {
    let body = structured_query(query, &self.documents_name)?;
    let response = self
      .send(Method::POST, self.url(&["documents:runQuery"]), Some(body))
      .await?;

    let items: Vec<RunQueryItem> = response.json().await.map_err(transport_error)?;
    items
      .into_iter()
      .filter_map(|item| item.document)
      .map(ApiDocument::into_document)
      .collect()
  }
}

#[async_trait]
impl Backend for FirestoreBackend {
  async fn get_documents(&self, query: &QuerySpec) -> Result<Vec<Document>> {
    self.run_query(query).await
  }

  async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Document>> {
    match self
      .send(Method::GET, self.document_url(collection, id), None)
      .await
    {
      Ok(response) => {
        let doc: ApiDocument = response.json().await.map_err(transport_error)?;
        doc.into_document().map(Some)
      }
      Err(SyncError::NotFound(_)) => Ok(None),
      Err(e) => Err(e),
    }
  }

  fn listen(&self, query: &QuerySpec) -> SnapshotStream {
    let backend = self.clone();
    let interval = self.poll_interval;

    futures::stream::unfold(
      (backend, query.clone(), true),
      move |(backend, query, first)| async move {
        if !first {
          tokio::time::sleep(interval).await;
        }
        let snapshot = backend.run_query(&query).await;
        if let Err(e) = &snapshot {
          tracing::debug!("Poll of {} failed: {}", query.collection, e);
        }
        Some((snapshot, (backend, query, false)))
      },
    )
    .boxed()
  }

  async fn set_document(&self, collection: &str, id: &str, data: Value) -> Result<()> {
    let body = json!({ "fields": encode_fields(&strip_id(data))? });
    self
      .send(Method::PATCH, self.document_url(collection, id), Some(body))
      .await?;
    Ok(())
  }

  async fn add_document(&self, collection: &str, data: Value) -> Result<String> {
    let body = json!({ "fields": encode_fields(&strip_id(data))? });
    let response = self
      .send(Method::POST, self.url(&["documents", collection]), Some(body))
      .await?;
    let doc: ApiDocument = response.json().await.map_err(transport_error)?;
    Ok(document_id(&doc.name).to_string())
  }

  async fn update_document(&self, collection: &str, id: &str, patch: Value) -> Result<()> {
    let patch = strip_id(patch);
    let Some(keys) = patch.as_object().map(|m| m.keys().cloned().collect::<Vec<_>>()) else {
      return Err(SyncError::validation("update patch must be an object"));
    };

    let mut url = self.document_url(collection, id);
    {
      let mut pairs = url.query_pairs_mut();
      for key in &keys {
        pairs.append_pair("updateMask.fieldPaths", key);
      }
      pairs.append_pair("currentDocument.exists", "true");
    }

    let body = json!({ "fields": encode_fields(&patch)? });
    self.send(Method::PATCH, url, Some(body)).await?;
    Ok(())
  }

  async fn delete_document(&self, collection: &str, id: &str) -> Result<()> {
    self
      .send(Method::DELETE, self.document_url(collection, id), None)
      .await?;
    Ok(())
  }
}

/// Last path segment of a document resource name.
fn document_id(name: &str) -> &str {
  name.rsplit('/').next().unwrap_or(name)
}

/// The document id is addressed as `__name__` in filters and ordering.
fn field_path(field: &str) -> &str {
  if field == "id" {
    "__name__"
  } else {
    field
  }
}

/// Build a `runQuery` request body.
fn structured_query(query: &QuerySpec, documents_name: &str) -> Result<Value> {
  let mut structured = json!({
    "from": [{ "collectionId": query.collection }],
  });

  let filters = query
    .filters
    .iter()
    .map(|f| {
      let value = if f.field == "id" {
        reference_value(&f.value, &query.collection, documents_name)
      } else {
        encode_value(&f.value)?
      };
      Ok::<_, SyncError>(json!({
        "fieldFilter": {
          "field": { "fieldPath": field_path(&f.field) },
          "op": filter_op(f.op),
          "value": value,
        }
      }))
    })
    .collect::<Result<Vec<_>>>()?;

  match filters.len() {
    0 => {}
    1 => structured["where"] = filters.into_iter().next().unwrap_or(Value::Null),
    _ => {
      structured["where"] = json!({
        "compositeFilter": { "op": "AND", "filters": filters }
      })
    }
  }

  if !query.order_by.is_empty() {
    structured["orderBy"] = query
      .order_by
      .iter()
      .map(|o| {
        json!({
          "field": { "fieldPath": field_path(&o.field) },
          "direction": match o.direction {
            Direction::Ascending => "ASCENDING",
            Direction::Descending => "DESCENDING",
          },
        })
      })
      .collect();
  }

  if let Some(limit) = query.limit {
    structured["limit"] = json!(limit);
  }

  Ok(json!({ "structuredQuery": structured }))
}

/// Document ids compared against `__name__` must be full references.
fn reference_value(value: &Value, collection: &str, documents_name: &str) -> Value {
  let reference = |id: &Value| {
    json!({
      "referenceValue": format!(
        "{}/{}/{}",
        documents_name,
        collection,
        id.as_str().unwrap_or_default()
      )
    })
  };

  match value {
    Value::Array(ids) => json!({
      "arrayValue": { "values": ids.iter().map(reference).collect::<Vec<_>>() }
    }),
    id => reference(id),
  }
}

fn filter_op(op: FilterOp) -> &'static str {
  match op {
    FilterOp::Eq => "EQUAL",
    FilterOp::NotEq => "NOT_EQUAL",
    FilterOp::Lt => "LESS_THAN",
    FilterOp::Lte => "LESS_THAN_OR_EQUAL",
    FilterOp::Gt => "GREATER_THAN",
    FilterOp::Gte => "GREATER_THAN_OR_EQUAL",
    FilterOp::ArrayContains => "ARRAY_CONTAINS",
    FilterOp::In => "IN",
  }
}

/// Map an HTTP error response to a [`SyncError`].
///
/// The gRPC status name in the body wins over the HTTP code when present.
fn classify_status(status: StatusCode, body: &str) -> SyncError {
  let (grpc_status, message) = match serde_json::from_str::<ApiErrorBody>(body) {
    Ok(parsed) => (parsed.error.status, parsed.error.message),
    Err(_) => (String::new(), body.trim().to_string()),
  };
  let message = if message.is_empty() {
    status.to_string()
  } else {
    format!("{} ({})", message, status)
  };

  match grpc_status.as_str() {
    "PERMISSION_DENIED" | "UNAUTHENTICATED" => return SyncError::PermissionDenied(message),
    "NOT_FOUND" => return SyncError::NotFound(message),
    "UNAVAILABLE" | "DEADLINE_EXCEEDED" | "RESOURCE_EXHAUSTED" | "ABORTED" => {
      return SyncError::Unavailable(message)
    }
    _ => {}
  }

  match status {
    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::PermissionDenied(message),
    StatusCode::NOT_FOUND => SyncError::NotFound(message),
    StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => SyncError::Unavailable(message),
    s if s.is_server_error() => SyncError::Unavailable(message),
    _ => SyncError::Backend(message),
  }
}

fn transport_error(e: reqwest::Error) -> SyncError {
  if e.is_decode() {
    SyncError::Decode(e.to_string())
  } else {
    SyncError::Unavailable(e.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn config() -> BackendConfig {
    BackendConfig {
      project_id: "school-lms".to_string(),
      ..BackendConfig::default()
    }
  }

  #[test]
  fn test_urls() {
    let backend = FirestoreBackend::new(&config(), None, Duration::from_secs(2)).unwrap();
    assert_eq!(
      backend.document_url("classes", "c 1").as_str(),
      "https://firestore.googleapis.com/v1/projects/school-lms/databases/(default)/documents/classes/c%201"
    );
    assert!(backend
      .url(&["documents:runQuery"])
      .as_str()
      .ends_with("/databases/(default)/documents:runQuery"));
  }

  #[test]
  fn test_structured_query_composite_filter() {
    let query = QuerySpec::collection("submissions")
      .where_eq("assignmentId", "a1")
      .filter("grade", FilterOp::Gte, 5)
      .order_by("submittedAt", Direction::Descending)
      .limit(10);

    let body = structured_query(&query, "projects/p/databases/(default)/documents").unwrap();
    let sq = &body["structuredQuery"];
    assert_eq!(sq["from"][0]["collectionId"], "submissions");
    assert_eq!(sq["where"]["compositeFilter"]["op"], "AND");
    assert_eq!(
      sq["where"]["compositeFilter"]["filters"][1]["fieldFilter"]["value"],
      json!({"integerValue": "5"})
    );
    assert_eq!(sq["orderBy"][0]["direction"], "DESCENDING");
    assert_eq!(sq["limit"], 10);
  }

  #[test]
  fn test_structured_query_id_filter_uses_references() {
    let query = QuerySpec::collection("classes").filter("id", FilterOp::In, json!(["c1"]));
    let body = structured_query(&query, "projects/p/databases/(default)/documents").unwrap();
    let filter = &body["structuredQuery"]["where"]["fieldFilter"];
    assert_eq!(filter["field"]["fieldPath"], "__name__");
    assert_eq!(
      filter["value"]["arrayValue"]["values"][0]["referenceValue"],
      "projects/p/databases/(default)/documents/classes/c1"
    );
  }

  #[test]
  fn test_structured_query_orders_by_document_name() {
    let query = QuerySpec::collection("classes")
      .order_by("id", Direction::Descending)
      .order_by("name", Direction::Ascending);
    let body = structured_query(&query, "projects/p/databases/(default)/documents").unwrap();
    let order = &body["structuredQuery"]["orderBy"];
    assert_eq!(order[0]["field"]["fieldPath"], "__name__");
    assert_eq!(order[0]["direction"], "DESCENDING");
    assert_eq!(order[1]["field"]["fieldPath"], "name");
  }

  #[test]
  fn test_structured_query_rejects_out_of_range_filter() {
    let query = QuerySpec::collection("submissions").where_eq("grade", u64::MAX);
    let result = structured_query(&query, "projects/p/databases/(default)/documents");
    assert!(matches!(result, Err(SyncError::Validation(_))));
  }

  #[test]
  fn test_classify_status() {
    let denied = r#"{"error": {"code": 403, "message": "Missing or insufficient permissions.", "status": "PERMISSION_DENIED"}}"#;
    assert!(classify_status(StatusCode::FORBIDDEN, denied).is_permission());
    assert!(classify_status(StatusCode::UNAUTHORIZED, "").is_permission());
    assert!(matches!(
      classify_status(StatusCode::NOT_FOUND, ""),
      SyncError::NotFound(_)
    ));
    assert!(matches!(
      classify_status(StatusCode::SERVICE_UNAVAILABLE, "down"),
      SyncError::Unavailable(_)
    ));
    assert!(matches!(
      classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
      SyncError::Unavailable(_)
    ));
    assert!(matches!(
      classify_status(StatusCode::BAD_REQUEST, "bad"),
      SyncError::Backend(_)
    ));
  }

  #[test]
  fn test_document_decoding() {
    let api: ApiDocument = serde_json::from_value(json!({
      "name": "projects/p/databases/(default)/documents/classes/c9",
      "fields": {"name": {"stringValue": "Biology"}},
      "updateTime": "2026-10-01T10:00:00Z"
    }))
    .unwrap();
    let doc = api.into_document().unwrap();
    assert_eq!(doc.id, "c9");
    assert_eq!(doc.data, json!({"id": "c9", "name": "Biology"}));
    assert_eq!(doc.update_time.as_deref(), Some("2026-10-01T10:00:00Z"));
  }
}
