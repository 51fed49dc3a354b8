//! Pending-mutation records and their state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::EntityType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
  Create,
  Update,
  Delete,
}

impl Operation {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Create => "create",
      Self::Update => "update",
      Self::Delete => "delete",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "create" => Some(Self::Create),
      "update" => Some(Self::Update),
      "delete" => Some(Self::Delete),
      _ => None,
    }
  }
}

/// Lifecycle of a queue item. Success removes the row, so there is no
/// "done" state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
  Pending,
  Processing,
  Failed,
}

impl QueueStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Processing => "processing",
      Self::Failed => "failed",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "pending" => Some(Self::Pending),
      "processing" => Some(Self::Processing),
      "failed" => Some(Self::Failed),
      _ => None,
    }
  }
}

/// Result of withdrawing an unconfirmed create from the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Withdrawal {
  /// These items were removed together with the local record
  Removed(Vec<QueueItem>),
  /// An item for the entity is being sent; nothing was changed
  InFlight,
  /// No queued create for the entity
  Nothing,
}

/// A mutation not yet confirmed by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
  pub id: i64,
  pub entity_type: EntityType,
  pub entity_id: String,
  pub operation: Operation,
  /// The data the caller supplied (empty for deletes)
  pub payload: Value,
  pub created_at: DateTime<Utc>,
  pub status: QueueStatus,
  pub retry_count: u32,
  pub last_error: Option<String>,
  /// Earliest time the worker may try again after a transient failure
  pub next_attempt_at: Option<DateTime<Utc>>,
}

impl QueueItem {
  /// Whether the worker may pick this item up at `now`.
  pub fn is_due(&self, now: DateTime<Utc>) -> bool {
    self.status == QueueStatus::Pending && self.next_attempt_at.map_or(true, |t| t <= now)
  }
}

/// What the orchestrator hands to the queue on a local mutation.
#[derive(Debug, Clone)]
pub struct NewQueueItem {
  pub entity_type: EntityType,
  pub entity_id: String,
  pub operation: Operation,
  pub payload: Value,
}

/// Partial update of a queue row. `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct QueueItemPatch {
  pub status: Option<QueueStatus>,
  pub retry_count: Option<u32>,
  pub last_error: Option<Option<String>>,
  pub next_attempt_at: Option<Option<DateTime<Utc>>>,
}

impl QueueItemPatch {
  pub fn status(status: QueueStatus) -> Self {
    Self {
      status: Some(status),
      ..Default::default()
    }
  }

  pub fn apply(&self, item: &mut QueueItem) {
    if let Some(status) = self.status {
      item.status = status;
    }
    if let Some(retry_count) = self.retry_count {
      item.retry_count = retry_count;
    }
    if let Some(last_error) = &self.last_error {
      item.last_error = last_error.clone();
    }
    if let Some(next_attempt_at) = self.next_attempt_at {
      item.next_attempt_at = next_attempt_at;
    }
  }
}

/// Number of queue rows in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
  pub pending: usize,
  pub processing: usize,
  pub failed: usize,
}

impl QueueCounts {
  /// Items still expected to reach the server.
  pub fn outstanding(&self) -> usize {
    self.pending + self.processing
  }
}
