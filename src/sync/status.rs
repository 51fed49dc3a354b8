//! Sync status signal for status indicators.

use tokio::sync::watch;

use crate::queue::types::QueueCounts;

/// Snapshot published whenever connectivity or the queue changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStatus {
  pub online: bool,
  /// Items still expected to reach the server (pending + processing)
  pub pending_count: usize,
  /// Items that gave up and need attention
  pub failed_count: usize,
}

/// Owns the status and connectivity channels.
///
/// Connectivity has its own channel so the queue worker wakes on online
/// transitions only, not on every count change.
pub struct StatusTracker {
  status: watch::Sender<SyncStatus>,
  online: watch::Sender<bool>,
}

impl StatusTracker {
  pub fn new(online: bool) -> Self {
    let (status, _) = watch::channel(SyncStatus {
      online,
      ..Default::default()
    });
    let (online, _) = watch::channel(online);
    Self { status, online }
  }

  pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
    self.status.subscribe()
  }

  pub fn subscribe_online(&self) -> watch::Receiver<bool> {
    self.online.subscribe()
  }

  pub fn current(&self) -> SyncStatus {
    *self.status.borrow()
  }

  pub fn is_online(&self) -> bool {
    *self.online.borrow()
  }

  /// Returns true if connectivity actually changed.
  pub fn set_online(&self, online: bool) -> bool {
    let changed = self.online.send_if_modified(|current| {
      let changed = *current != online;
      *current = online;
      changed
    });
    self.status.send_if_modified(|s| {
      let changed = s.online != online;
      s.online = online;
      changed
    });
    changed
  }

  pub fn set_counts(&self, counts: QueueCounts) {
    self.status.send_if_modified(|s| {
      let pending = counts.outstanding();
      let changed = s.pending_count != pending || s.failed_count != counts.failed;
      s.pending_count = pending;
      s.failed_count = counts.failed;
      changed
    });
  }
}

impl Default for StatusTracker {
  fn default() -> Self {
    Self::new(true)
  }
}
