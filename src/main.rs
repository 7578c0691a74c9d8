use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args as ClapArgs, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use classync::backend::FirestoreBackend;
use classync::cache::{CacheLayer, CacheStorage, NoopStorage, SqliteStorage, TtlCache};
use classync::config::{Config, LogConfig};
use classync::lms::LmsClient;
use classync::query::{Direction, QuerySpec};
use classync::sync::{SyncManager, WatchOptions};

#[derive(Parser, Debug)]
#[command(name = "classync")]
#[command(about = "Cached, change-detecting access to school LMS data")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/classync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Bypass the cache for this run
  #[arg(long)]
  no_cache: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print one document as JSON
  Get { collection: String, id: String },

  /// Print every matching document, one JSON object per line
  Query(QueryArgs),

  /// Print the result set each time it changes, until interrupted
  Watch {
    #[command(flatten)]
    query: QueryArgs,

    /// Serve a fresh cached result instead of subscribing
    #[arg(long = "static")]
    is_static: bool,

    /// TTL for cached results in milliseconds
    #[arg(long)]
    ttl_ms: Option<u64>,
  },

  /// Print the grades of an assignment as CSV
  ExportGrades { assignment_id: String },
}

#[derive(ClapArgs, Debug)]
struct QueryArgs {
  collection: String,

  /// Equality filter `field=value`; the value is parsed as JSON when possible
  #[arg(short, long = "where", value_name = "FIELD=VALUE")]
  filters: Vec<String>,

  /// Sort field, `field` or `field:desc`
  #[arg(long)]
  order_by: Option<String>,

  #[arg(long)]
  limit: Option<usize>,
}

impl QueryArgs {
  fn to_query(&self) -> Result<QuerySpec> {
    let mut query = QuerySpec::collection(&self.collection);

    for filter in &self.filters {
      let (field, raw) = filter
        .split_once('=')
        .ok_or_else(|| eyre!("Invalid filter '{}', expected field=value", filter))?;
      let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
      query = query.where_eq(field.trim(), value);
    }

    if let Some(order) = &self.order_by {
      query = match order.split_once(':') {
        Some((field, "desc")) => query.order_by(field, Direction::Descending),
        Some((field, "asc")) => query.order_by(field, Direction::Ascending),
        Some((_, other)) => return Err(eyre!("Unknown sort direction '{}'", other)),
        None => query.order_by(order.as_str(), Direction::Ascending),
      };
    }

    if let Some(limit) = self.limit {
      query = query.limit(limit);
    }
    Ok(query)
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _guard = init_logging(&config.log)?;

  let backend = FirestoreBackend::new(
    &config.backend,
    Config::get_api_token(),
    config.sync.poll_interval,
  )?;
  let backend = Arc::new(backend);

  if args.no_cache {
    let sync = SyncManager::new(backend, cache_layer(NoopStorage, &config));
    run(args.command, sync, &config).await
  } else if config.sync.persistent_cache {
    let sync = SyncManager::new(backend, cache_layer(SqliteStorage::open_default()?, &config));
    run(args.command, sync, &config).await
  } else {
    let storage = TtlCache::new(config.sync.cache_capacity);
    let sync = SyncManager::new(backend, cache_layer(storage, &config));
    run(args.command, sync, &config).await
  }
}

fn cache_layer<S: CacheStorage>(storage: S, config: &Config) -> CacheLayer<S> {
  CacheLayer::new(storage)
    .with_default_ttl(config.sync.default_ttl)
    .with_retry(config.retry)
}

/// Log to a daily rolling file so stdout carries only data.
fn init_logging(config: &LogConfig) -> Result<WorkerGuard> {
  let directory = match &config.directory {
    Some(dir) => dir.clone(),
    None => dirs::data_dir()
      .ok_or_else(|| eyre!("Could not determine data directory"))?
      .join("classync")
      .join("logs"),
  };
  std::fs::create_dir_all(&directory)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;

  let file_appender = tracing_appender::rolling::daily(&directory, "classync.log");
  let (writer, guard) = tracing_appender::non_blocking(file_appender);
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

async fn run<S: CacheStorage + 'static>(
  command: Command,
  sync: SyncManager<S>,
  config: &Config,
) -> Result<()> {
  match command {
    Command::Get { collection, id } => {
      let doc = sync
        .read_one::<Value>(&collection, &id)
        .await?
        .ok_or_else(|| eyre!("{}/{} not found", collection, id))?;
      println!("{}", serde_json::to_string(&doc)?);
    }

    Command::Query(args) => {
      let query = args.to_query()?;
      let ttl = config
        .sync
        .is_static(&query.collection)
        .then_some(config.sync.default_ttl);
      let result = sync.read::<Value>(&query, ttl).await?;
      tracing::info!("{} records from {:?}", result.data.len(), result.source);
      for record in &result.data {
        println!("{}", serde_json::to_string(record)?);
      }
    }

    Command::Watch {
      query,
      is_static,
      ttl_ms,
    } => {
      let query = query.to_query()?;
      let options = if is_static {
        WatchOptions::cached(ttl_ms.map_or(config.sync.default_ttl, Duration::from_millis))
      } else {
        WatchOptions::live()
      };
      watch(&sync, query, options).await?;
    }

    Command::ExportGrades { assignment_id } => {
      let lms = LmsClient::new(sync, &config.sync);
      print!("{}", lms.export_grades_csv(&assignment_id).await?);
    }
  }

  Ok(())
}

async fn watch<S: CacheStorage + 'static>(
  sync: &SyncManager<S>,
  query: QuerySpec,
  options: WatchOptions<Value>,
) -> Result<()> {
  let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
  let subscription = sync.subscribe(query, options, move |update| {
    let _ = tx.send(update);
  });

  loop {
    tokio::select! {
      update = rx.recv() => {
        let Some(update) = update else { break };
        if let Some(e) = &update.error {
          eprintln!("subscription error ({:?}): {}", e.kind(), e);
        }
        println!("{}", serde_json::to_string(&*update.records)?);
      }
      _ = tokio::signal::ctrl_c() => break,
    }
  }

  subscription.stop();
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use classync::query::FilterOp;
  use serde_json::json;

  fn args(filters: &[&str], order_by: Option<&str>) -> QueryArgs {
    QueryArgs {
      collection: "submissions".into(),
      filters: filters.iter().map(|f| f.to_string()).collect(),
      order_by: order_by.map(String::from),
      limit: Some(5),
    }
  }

  #[test]
  fn test_filters_parse_json_values() {
    let query = args(&["assignmentId=a1", "grade=10"], Some("submittedAt:desc"))
      .to_query()
      .unwrap();
    assert_eq!(query.filters[0].value, json!("a1"));
    assert_eq!(query.filters[1].value, json!(10));
    assert_eq!(query.filters[1].op, FilterOp::Eq);
    assert_eq!(query.order_by[0].direction, Direction::Descending);
    assert_eq!(query.limit, Some(5));
  }

  #[test]
  fn test_bad_filter_and_direction_are_rejected() {
    assert!(args(&["no-equals"], None).to_query().is_err());
    assert!(args(&[], Some("name:sideways")).to_query().is_err());
  }
}
