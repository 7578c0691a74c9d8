//! In-process document store with live listeners.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{strip_id, Backend, Document, SnapshotStream};
use crate::error::{Result, SyncError};
use crate::query::QuerySpec;

struct Listener {
  query: QuerySpec,
  tx: mpsc::UnboundedSender<Result<Vec<Document>>>,
}

#[derive(Default)]
struct State {
  /// collection -> id -> fields (without `id`)
  collections: HashMap<String, BTreeMap<String, Value>>,
  listeners: Vec<Listener>,
  read_faults: VecDeque<SyncError>,
  next_id: u64,
  reads: u64,
  listens: u64,
}

impl State {
  fn snapshot(&self, query: &QuerySpec) -> Vec<Document> {
    let docs = self
      .collections
      .get(&query.collection)
      .into_iter()
      .flat_map(|docs| docs.iter())
      .map(|(id, data)| Document::new(id.clone(), data.clone()));
    query.apply(docs)
  }

  /// Push the current result set to every listener on `collection`.
  ///
  /// Listeners get a snapshot on every write to their collection, whether or
  /// not their result set changed.
  fn notify(&mut self, collection: &str) {
    let snapshots: Vec<Option<Vec<Document>>> = self
      .listeners
      .iter()
      .map(|l| (l.query.collection == collection).then(|| self.snapshot(&l.query)))
      .collect();

    let mut index = 0;
    self.listeners.retain(|listener| {
      let keep = match &snapshots[index] {
        Some(snapshot) => listener.tx.send(Ok(snapshot.clone())).is_ok(),
        None => !listener.tx.is_closed(),
      };
      index += 1;
      keep
    });
  }
}

/// Document store held in memory.
///
/// Cloning shares the same store. Besides the [`Backend`] operations it
/// offers fault injection (`fail_reads`, `emit_error`) and counters
/// (`read_count`, `listen_count`).
#[derive(Clone, Default)]
pub struct MemoryBackend {
  state: Arc<Mutex<State>>,
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, State>> {
    self
      .state
      .lock()
      .map_err(|e| SyncError::Backend(format!("Lock poisoned: {}", e)))
  }

  /// Insert or overwrite a document without going through the async API.
  pub fn insert(&self, collection: &str, id: &str, data: Value) -> Result<()> {
    let mut state = self.lock()?;
    state
      .collections
      .entry(collection.to_string())
      .or_default()
      .insert(id.to_string(), strip_id(data));
    state.notify(collection);
    Ok(())
  }

  /// Make the next one-shot reads fail with `errors`, in order.
  pub fn fail_reads(&self, errors: impl IntoIterator<Item = SyncError>) -> Result<()> {
    self.lock()?.read_faults.extend(errors);
    Ok(())
  }

  /// Deliver `error` to every live listener on `collection`.
  pub fn emit_error(&self, collection: &str, error: SyncError) -> Result<()> {
    let mut state = self.lock()?;
    state.listeners.retain(|l| {
      if l.query.collection == collection {
        l.tx.send(Err(error.clone())).is_ok()
      } else {
        !l.tx.is_closed()
      }
    });
    Ok(())
  }

  /// Number of one-shot reads served (failed ones included).
  pub fn read_count(&self) -> u64 {
    self.lock().map(|s| s.reads).unwrap_or_default()
  }

  /// Number of live subscriptions ever opened.
  pub fn listen_count(&self) -> u64 {
    self.lock().map(|s| s.listens).unwrap_or_default()
  }

  /// Number of listeners whose receiving side is still open.
  pub fn active_listeners(&self) -> usize {
    self
      .lock()
      .map(|s| s.listeners.iter().filter(|l| !l.tx.is_closed()).count())
      .unwrap_or_default()
  }

  fn begin_read(&self) -> Result<MutexGuard<'_, State>> {
    let mut state = self.lock()?;
    state.reads += 1;
    match state.read_faults.pop_front() {
      Some(error) => Err(error),
      None => Ok(state),
    }
  }
}

#[async_trait]
impl Backend for MemoryBackend {
  async fn get_documents(&self, query: &QuerySpec) -> Result<Vec<Document>> {
    let state = self.begin_read()?;
    Ok(state.snapshot(query))
  }

  async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Document>> {
    let state = self.begin_read()?;
    Ok(
      state
        .collections
        .get(collection)
        .and_then(|docs| docs.get(id))
        .map(|data| Document::new(id, data.clone())),
    )
  }

  fn listen(&self, query: &QuerySpec) -> SnapshotStream {
    let (tx, rx) = mpsc::unbounded_channel();

    match self.lock() {
      Ok(mut state) => {
        state.listens += 1;
        let _ = tx.send(Ok(state.snapshot(query)));
        state.listeners.push(Listener {
          query: query.clone(),
          tx,
        });
      }
      Err(e) => {
        let _ = tx.send(Err(e));
      }
    }

    futures::stream::unfold(rx, |mut rx| async move {
      rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
  }

  async fn set_document(&self, collection: &str, id: &str, data: Value) -> Result<()> {
    self.insert(collection, id, data)
  }

  async fn add_document(&self, collection: &str, data: Value) -> Result<String> {
    let id = {
      let mut state = self.lock()?;
      state.next_id += 1;
      format!("doc-{:06}", state.next_id)
    };
    self.insert(collection, &id, data)?;
    Ok(id)
  }

  async fn update_document(&self, collection: &str, id: &str, patch: Value) -> Result<()> {
    let Value::Object(patch) = strip_id(patch) else {
      return Err(SyncError::validation("update patch must be an object"));
    };

    let mut state = self.lock()?;
    let existing = state
      .collections
      .get_mut(collection)
      .and_then(|docs| docs.get_mut(id))
      .ok_or_else(|| SyncError::NotFound(format!("{}/{}", collection, id)))?;

    match existing {
      Value::Object(fields) => fields.extend(patch),
      other => *other = Value::Object(patch),
    }
    state.notify(collection);
    Ok(())
  }

  async fn delete_document(&self, collection: &str, id: &str) -> Result<()> {
    let mut state = self.lock()?;
    let removed = state
      .collections
      .get_mut(collection)
      .and_then(|docs| docs.remove(id))
      .is_some();
    if removed {
      state.notify(collection);
    }
    Ok(())
  }
}
