use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

use ledger_sync::config::{hours_to_duration, Config};
use ledger_sync::entity::EntityType;
use ledger_sync::sync::Filters;
use ledger_sync::{logging, HttpRemote, SqliteStore, SyncOrchestrator};

#[derive(Parser, Debug)]
#[command(name = "ledger-sync")]
#[command(about = "Inspect and drain a local ledger sync database")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/ledger-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show connectivity and queue counts
  Status,
  /// List every queued mutation
  Queue,
  /// List records of one type for an owner
  List {
    entity: EntityType,
    owner: String,
    /// Exact match, repeatable (FIELD=VALUE)
    #[arg(long = "eq", value_name = "FIELD=VALUE")]
    equals: Vec<String>,
    /// Case-insensitive substring match, repeatable (FIELD=TEXT)
    #[arg(long, value_name = "FIELD=TEXT")]
    contains: Vec<String>,
  },
  /// Show one record
  Get { entity: EntityType, id: String },
  /// Send every due queued mutation once
  Drain,
  /// Requeue a failed mutation
  Retry { item: i64 },
  /// Drop a failed mutation and the local copy of its record
  Discard { item: i64 },
  /// Remove synced records older than the configured age
  Evict {
    #[arg(long)]
    max_age_hours: Option<u64>,
  },
}

fn split_pair(raw: &str) -> Result<(&str, &str)> {
  raw
    .split_once('=')
    .ok_or_else(|| eyre!("Expected FIELD=VALUE, got '{}'", raw))
}

fn build_filters(equals: &[String], contains: &[String]) -> Result<Filters> {
  let mut filters = Filters::new();
  for raw in equals {
    let (field, value) = split_pair(raw)?;
    // Numbers and booleans compare as such; anything else is a string
    let value = serde_json::from_str::<Value>(value).unwrap_or_else(|_| Value::String(value.to_string()));
    filters = filters.equals(field, value);
  }
  for raw in contains {
    let (field, needle) = split_pair(raw)?;
    filters = filters.contains(field, needle);
  }
  Ok(filters)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;

  let _guard = logging::init(&logging::default_log_dir()?)?;

  let store = match config.store_path() {
    Some(path) => SqliteStore::open(path)?,
    None => SqliteStore::open_default()?,
  };
  let remote = HttpRemote::new(config.remote.url.clone(), Config::api_token());
  let engine = SyncOrchestrator::new(Arc::new(store), Arc::new(remote), config.sync_options());

  match args.command {
    Command::Status => {
      let status = engine.current_status();
      println!("online:  {}", status.online);
      println!("pending: {}", status.pending_count);
      println!("failed:  {}", status.failed_count);
    }
    Command::Queue => {
      for item in engine.list_queue()? {
        println!(
          "{:>6}  {:<10} {:<8} {:<14} {:<24} retries={} {}",
          item.id,
          item.status.as_str(),
          item.operation.as_str(),
          item.entity_type,
          item.entity_id,
          item.retry_count,
          item.last_error.as_deref().unwrap_or("")
        );
      }
    }
    Command::List {
      entity,
      owner,
      equals,
      contains,
    } => {
      let filters = build_filters(&equals, &contains)?;
      let result = engine.get_list(entity, &owner, &filters).await?;
      eprintln!("{} records from {:?}", result.data.len(), result.source);
      for record in &result.data {
        println!("{}", serde_json::to_string(record)?);
      }
    }
    Command::Get { entity, id } => match engine.get_by_id(entity, &id).await? {
      Some(result) => println!("{}", serde_json::to_string_pretty(&result.data)?),
      None => return Err(eyre!("{} {} not found", entity, id)),
    },
    Command::Drain => {
      let report = engine.drain_now().await?;
      println!(
        "sent={} retried={} failed={} deferred={}",
        report.sent, report.retried, report.failed, report.deferred
      );
    }
    Command::Retry { item } => engine.retry_failed(item)?,
    Command::Discard { item } => engine.discard_failed(item)?,
    Command::Evict { max_age_hours } => {
      let age = match max_age_hours {
        Some(hours) => hours_to_duration(hours)?,
        None => config.max_age()?,
      };
      println!("removed {} records", engine.evict_older_than(age));
    }
  }

  Ok(())
}
