//! Background worker that sends queued mutations to the remote and
//! reconciles the local tiers with the server's answer.
//!
//! Items of one entity type are sent strictly in creation order; different
//! entity types drain in parallel up to `parallelism` lanes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::mutations::MutationQueue;
use super::types::{Operation, QueueItem, QueueItemPatch, QueueStatus};
use crate::cache::storage::{degrade, PersistentStore, StoreResult};
use crate::cache::VolatileCache;
use crate::entity::{is_temp_id, Entity, EntityType, PersistedRecord, SyncState};
use crate::error::RemoteError;
use crate::remote::RemoteClient;
use crate::sync::keys::{is_list_key, list_prefix, record_key};
use crate::sync::status::StatusTracker;

/// Capped exponential backoff for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
  /// Retries allowed after the first attempt before an item is failed
  pub max_retries: u32,
  pub base_backoff: Duration,
  pub max_backoff: Duration,
}

impl RetryPolicy {
  /// Delay before retry number `attempt` (1-based).
  pub fn backoff(&self, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    self
      .base_backoff
      .saturating_mul(1u32 << exp)
      .min(self.max_backoff)
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 5,
      base_backoff: Duration::from_secs(1),
      max_backoff: Duration::from_secs(60),
    }
  }
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
  pub poll_interval: Duration,
  /// Entity types drained concurrently
  pub parallelism: usize,
  pub request_timeout: Duration,
  pub retry: RetryPolicy,
}

impl Default for WorkerOptions {
  fn default() -> Self {
    Self {
      poll_interval: Duration::from_secs(30),
      parallelism: 4,
      request_timeout: Duration::from_secs(30),
      retry: RetryPolicy::default(),
    }
  }
}

/// What one pass over the queue did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub sent: usize,
  pub retried: usize,
  pub failed: usize,
  /// Items left for a later pass (backing off or behind a retry)
  pub deferred: usize,
  /// Earliest time a deferred item becomes due
  pub next_retry_at: Option<DateTime<Utc>>,
}

impl DrainReport {
  pub fn is_empty(&self) -> bool {
    self.sent == 0 && self.retried == 0 && self.failed == 0 && self.deferred == 0
  }

  fn merge(self, other: DrainReport) -> DrainReport {
    let next_retry_at = match (self.next_retry_at, other.next_retry_at) {
      (Some(a), Some(b)) => Some(a.min(b)),
      (a, b) => a.or(b),
    };
    DrainReport {
      sent: self.sent + other.sent,
      retried: self.retried + other.retried,
      failed: self.failed + other.failed,
      deferred: self.deferred + other.deferred,
      next_retry_at,
    }
  }

  fn retry_at(&mut self, at: Option<DateTime<Utc>>) {
    if let Some(at) = at {
      self.next_retry_at = Some(self.next_retry_at.map_or(at, |cur| cur.min(at)));
    }
  }
}

enum Outcome {
  Sent,
  Retry(DateTime<Utc>),
  Failed,
  Skipped,
}

/// Handle to a spawned worker task.
pub struct WorkerHandle {
  shutdown: watch::Sender<bool>,
  join: JoinHandle<()>,
}

impl WorkerHandle {
  /// Stop the worker after its current pass and wait for it to exit.
  pub async fn shutdown(self) {
    let _ = self.shutdown.send(true);
    if let Err(e) = self.join.await {
      warn!(error = %e, "queue worker task failed");
    }
  }
}

pub struct QueueWorker<S: PersistentStore, R: RemoteClient> {
  store: Arc<S>,
  remote: Arc<R>,
  volatile: Arc<VolatileCache>,
  queue: MutationQueue<S>,
  status: Arc<StatusTracker>,
  options: WorkerOptions,
  /// One pass at a time keeps per-type ordering intact
  drain_lock: Mutex<()>,
  /// Items left Processing by an earlier process have been reverted
  recovered: AtomicBool,
}

impl<S: PersistentStore, R: RemoteClient> QueueWorker<S, R> {
  pub fn new(
    store: Arc<S>,
    remote: Arc<R>,
    volatile: Arc<VolatileCache>,
    queue: MutationQueue<S>,
    status: Arc<StatusTracker>,
    options: WorkerOptions,
  ) -> Self {
    Self {
      store,
      remote,
      volatile,
      queue,
      status,
      options,
      drain_lock: Mutex::new(()),
      recovered: AtomicBool::new(false),
    }
  }

  /// Revert items a previous process left in Processing. Runs once; a
  /// failed attempt is repeated before the next pass. Must not run while a
  /// pass of this process may hold claimed items.
  pub fn recover(&self) {
    if self.recovered.load(Ordering::Acquire) {
      return;
    }
    match self.queue.recover_stale() {
      Ok(_) => self.recovered.store(true, Ordering::Release),
      Err(e) => warn!(error = %e, "could not recover interrupted queue items"),
    }
  }

  /// Start the background loop.
  pub fn spawn(self: &Arc<Self>) -> WorkerHandle {
    let (tx, rx) = watch::channel(false);
    let worker = Arc::clone(self);
    let join = tokio::spawn(async move { worker.run(rx).await });
    WorkerHandle { shutdown: tx, join }
  }

  /// Wakes on the poll timer, an online transition, an enqueue, or when a
  /// backed-off item becomes due.
  async fn run(&self, mut shutdown: watch::Receiver<bool>) {
    self.queue.refresh_status();

    let wake = self.queue.waker();
    let mut online = self.status.subscribe_online();
    let mut ticker = tokio::time::interval(self.options.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut retry_in: Option<Duration> = None;

    info!("queue worker started");
    loop {
      tokio::select! {
        res = shutdown.changed() => {
          if res.is_err() || *shutdown.borrow() {
            break;
          }
        }
        _ = ticker.tick() => {}
        _ = wake.notified() => {}
        res = online.changed() => {
          if res.is_err() {
            break;
          }
        }
        _ = sleep_or_pending(retry_in) => {}
      }

      if *shutdown.borrow() {
        break;
      }
      if !self.status.is_online() {
        debug!("offline, leaving queue alone");
        retry_in = None;
        continue;
      }

      match self.drain_once().await {
        Ok(report) => {
          if !report.is_empty() {
            debug!(?report, "queue pass finished");
          }
          retry_in = report
            .next_retry_at
            .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO));
        }
        Err(e) => {
          warn!(error = %e, "queue pass failed");
          retry_in = None;
        }
      }
    }
    info!("queue worker stopped");
  }

  /// Send every due item once.
  pub async fn drain_once(&self) -> StoreResult<DrainReport> {
    let _guard = self.drain_lock.lock().await;
    self.recover();
    let now = Utc::now();

    let mut lanes: BTreeMap<EntityType, Vec<QueueItem>> = BTreeMap::new();
    for item in self.queue.list_pending()? {
      lanes.entry(item.entity_type).or_default().push(item);
    }

    let reports: Vec<DrainReport> = stream::iter(lanes.into_values())
      .map(|items| self.drain_lane(items, now))
      .buffer_unordered(self.options.parallelism.max(1))
      .collect()
      .await;

    Ok(
      reports
        .into_iter()
        .fold(DrainReport::default(), DrainReport::merge),
    )
  }

  async fn drain_lane(&self, items: Vec<QueueItem>, now: DateTime<Utc>) -> DrainReport {
    let mut report = DrainReport::default();
    for (i, item) in items.iter().enumerate() {
      let behind = items.len() - i - 1;
      if !item.is_due(now) {
        report.deferred += behind + 1;
        report.retry_at(item.next_attempt_at);
        break;
      }
      match self.process(item).await {
        Ok(Outcome::Sent) => report.sent += 1,
        Ok(Outcome::Failed) => report.failed += 1,
        Ok(Outcome::Skipped) => {}
        Ok(Outcome::Retry(at)) => {
          report.retried += 1;
          report.deferred += behind;
          report.retry_at(Some(at));
          break;
        }
        Err(e) => {
          warn!(id = item.id, error = %e, "could not process queue item");
          report.deferred += behind + 1;
          break;
        }
      }
    }
    report
  }

  async fn process(&self, queued: &QueueItem) -> StoreResult<Outcome> {
    if !self.queue.claim(queued.id)? {
      return Ok(Outcome::Skipped);
    }
    // Re-read: an earlier create in this pass may have remapped the entity id
    let Some(item) = self.queue.get(queued.id)? else {
      return Ok(Outcome::Skipped);
    };

    if item.operation != Operation::Create && is_temp_id(&item.entity_id) {
      let reason = format!("create of {} never reached the server", item.entity_id);
      self.fail(&item, item.retry_count, reason)?;
      return Ok(Outcome::Failed);
    }

    let timeout = self.options.request_timeout;
    let result = match tokio::time::timeout(timeout, self.send(&item)).await {
      Ok(result) => result,
      Err(_) => Err(RemoteError::Transient(format!(
        "request timed out after {:?}",
        timeout
      ))),
    };

    match result {
      Ok(confirmed) => {
        self.confirm(&item, confirmed)?;
        Ok(Outcome::Sent)
      }
      Err(e) if e.is_retryable() => self.retry_later(&item, &e),
      Err(e) => {
        self.fail(&item, item.retry_count, e.to_string())?;
        Ok(Outcome::Failed)
      }
    }
  }

  async fn send(&self, item: &QueueItem) -> Result<Option<Entity>, RemoteError> {
    let data = match &item.payload {
      Value::Object(map) => map.clone(),
      Value::Null => Map::new(),
      _ => return Err(RemoteError::Rejected("payload is not an object".to_string())),
    };
    let entity_type = item.entity_type;
    match item.operation {
      Operation::Create => {
        let key = format!("{}-{}", item.entity_id, item.id);
        self
          .remote
          .create(entity_type, &data, &key)
          .await
          .map(Some)
      }
      Operation::Update => self
        .remote
        .update(entity_type, &item.entity_id, &data)
        .await
        .map(Some),
      Operation::Delete => self
        .remote
        .delete(entity_type, &item.entity_id)
        .await
        .map(|_| None),
    }
  }

  fn confirm(&self, item: &QueueItem, confirmed: Option<Entity>) -> StoreResult<()> {
    let entity_type = item.entity_type;
    self.queue.remove(item.id)?;

    match (item.operation, confirmed) {
      (Operation::Create, Some(server)) => self.confirm_create(item, server)?,
      (Operation::Update, Some(server)) => self.confirm_update(item, server)?,
      _ => {
        degrade("delete_by_id", self.store.delete_by_id(entity_type, &item.entity_id));
        self.volatile.delete(&record_key(entity_type, &item.entity_id));
      }
    }
    self.volatile.invalidate_pattern(&list_prefix(entity_type));

    info!(
      id = item.id,
      entity_type = %entity_type,
      entity_id = %item.entity_id,
      operation = item.operation.as_str(),
      "mutation confirmed"
    );
    Ok(())
  }

  fn confirm_create(&self, item: &QueueItem, server: Entity) -> StoreResult<()> {
    let entity_type = item.entity_type;
    let temp_id = item.entity_id.as_str();
    let real_id = server.id.clone();

    self.queue.remap(entity_type, temp_id, &real_id)?;
    let followers = !self.queue.items_for_entity(entity_type, &real_id)?.is_empty();

    let temp_key = record_key(entity_type, temp_id);
    let local = degrade("get_by_id", self.store.get_by_id(entity_type, temp_id))
      .flatten()
      .or_else(|| self.volatile.get_as::<PersistedRecord>(&temp_key));
    degrade("delete_by_id", self.store.delete_by_id(entity_type, temp_id));
    self.volatile.delete(&temp_key);

    let record = match local {
      // Deleted locally; the queued delete finishes the job
      None if followers => None,
      // Newer local edits are still queued, keep them
      Some(mut local) if followers => {
        local.entity.id = real_id.clone();
        Some(local)
      }
      _ => Some(PersistedRecord::synced(server)),
    };
    if let Some(record) = record {
      degrade("upsert", self.store.upsert(entity_type, &record));
      self
        .volatile
        .set_as(&record_key(entity_type, &real_id), &record, None);
    }

    // Lists of any type may hold the temp id as a reference
    self
      .volatile
      .invalidate_where(|key, value| is_list_key(key) && mentions(value, temp_id));
    debug!(temp_id, real_id = %real_id, "remapped temporary id");
    Ok(())
  }

  fn confirm_update(&self, item: &QueueItem, server: Entity) -> StoreResult<()> {
    let entity_type = item.entity_type;
    if !self
      .queue
      .items_for_entity(entity_type, &item.entity_id)?
      .is_empty()
    {
      // Later local changes win over this echo
      return Ok(());
    }
    let record = PersistedRecord::synced(server);
    degrade("upsert", self.store.upsert(entity_type, &record));
    self
      .volatile
      .set_as(&record_key(entity_type, record.id()), &record, None);
    Ok(())
  }

  fn retry_later(&self, item: &QueueItem, error: &RemoteError) -> StoreResult<Outcome> {
    let retry_count = item.retry_count + 1;
    if retry_count > self.options.retry.max_retries {
      self.fail(item, retry_count, error.to_string())?;
      return Ok(Outcome::Failed);
    }

    let delay = self.options.retry.backoff(retry_count);
    let next = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    self.queue.update(
      item.id,
      &QueueItemPatch {
        status: Some(QueueStatus::Pending),
        retry_count: Some(retry_count),
        last_error: Some(Some(error.to_string())),
        next_attempt_at: Some(Some(next)),
      },
    )?;
    info!(
      id = item.id,
      retry_count,
      delay_ms = delay.as_millis() as u64,
      error = %error,
      "mutation will be retried"
    );
    Ok(Outcome::Retry(next))
  }

  /// Terminal failure: keep the item for visibility and flag the record.
  fn fail(&self, item: &QueueItem, retry_count: u32, error: String) -> StoreResult<()> {
    let entity_type = item.entity_type;
    warn!(
      id = item.id,
      entity_type = %entity_type,
      entity_id = %item.entity_id,
      error = %error,
      "mutation failed permanently"
    );
    self.queue.update(
      item.id,
      &QueueItemPatch {
        status: Some(QueueStatus::Failed),
        retry_count: Some(retry_count),
        last_error: Some(Some(error)),
        next_attempt_at: Some(None),
      },
    )?;

    if item.operation != Operation::Delete {
      degrade(
        "set_sync_state",
        self
          .store
          .set_sync_state(entity_type, &item.entity_id, SyncState::Failed),
      );
      let key = record_key(entity_type, &item.entity_id);
      if let Some(mut record) = self.volatile.get_as::<PersistedRecord>(&key) {
        record.sync_state = SyncState::Failed;
        self.volatile.set_as(&key, &record, None);
      }
      self.volatile.invalidate_pattern(&list_prefix(entity_type));
    }
    Ok(())
  }
}

async fn sleep_or_pending(delay: Option<Duration>) {
  match delay {
    Some(delay) => tokio::time::sleep(delay).await,
    None => std::future::pending().await,
  }
}

/// Whether any string inside `value` equals `needle`.
fn mentions(value: &Value, needle: &str) -> bool {
  match value {
    Value::String(s) => s == needle,
    Value::Array(items) => items.iter().any(|v| mentions(v, needle)),
    Value::Object(map) => map.values().any(|v| mentions(v, needle)),
    _ => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_backoff_doubles_and_caps() {
    let policy = RetryPolicy {
      max_retries: 10,
      base_backoff: Duration::from_millis(100),
      max_backoff: Duration::from_secs(1),
    };
    assert_eq!(policy.backoff(1), Duration::from_millis(100));
    assert_eq!(policy.backoff(2), Duration::from_millis(200));
    assert_eq!(policy.backoff(4), Duration::from_millis(800));
    assert_eq!(policy.backoff(5), Duration::from_secs(1));
    assert_eq!(policy.backoff(40), Duration::from_secs(1));
  }

  #[test]
  fn test_report_merge_keeps_earliest_retry() {
    let now = Utc::now();
    let a = DrainReport {
      sent: 1,
      next_retry_at: Some(now + chrono::Duration::seconds(5)),
      ..Default::default()
    };
    let b = DrainReport {
      failed: 2,
      deferred: 1,
      next_retry_at: Some(now + chrono::Duration::seconds(2)),
      ..Default::default()
    };
    let merged = a.merge(b);
    assert_eq!(merged.sent, 1);
    assert_eq!(merged.failed, 2);
    assert_eq!(merged.next_retry_at, Some(now + chrono::Duration::seconds(2)));
    assert!(DrainReport::default().is_empty());
  }

  #[test]
  fn test_mentions_walks_nested_values() {
    let value = json!([{"id": "p1", "invoice_id": "tmp-1"}, {"lines": [{"ref": "tmp-2"}]}]);
    assert!(mentions(&value, "tmp-1"));
    assert!(mentions(&value, "tmp-2"));
    assert!(!mentions(&value, "tmp-3"));
  }
}
