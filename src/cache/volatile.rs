//! Bounded in-process cache with per-entry expiry and LRU eviction.
//!
//! Values are opaque JSON. Expiry is checked on access; there is no sweeper.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_CAPACITY: usize = 1000;
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

struct CacheEntry {
  data: Value,
  stored_at: Instant,
  ttl: Duration,
  /// Position in the access order; lower is older.
  tick: u64,
}

impl CacheEntry {
  fn is_expired(&self, now: Instant) -> bool {
    now.saturating_duration_since(self.stored_at) > self.ttl
  }
}

#[derive(Default)]
struct Inner {
  entries: HashMap<String, CacheEntry>,
  /// tick -> key, oldest access first
  order: BTreeMap<u64, String>,
  next_tick: u64,
  /// Bumped by every write or removal except `set_if_current` fills
  generation: u64,
}

impl Inner {
  fn bump(&mut self) -> u64 {
    let tick = self.next_tick;
    self.next_tick += 1;
    tick
  }

  fn remove(&mut self, key: &str) -> Option<CacheEntry> {
    let entry = self.entries.remove(key)?;
    self.order.remove(&entry.tick);
    Some(entry)
  }

  fn touch(&mut self, key: &str) {
    let tick = self.bump();
    if let Some(entry) = self.entries.get_mut(key) {
      self.order.remove(&entry.tick);
      entry.tick = tick;
      self.order.insert(tick, key.to_string());
    }
  }

  fn evict_lru(&mut self) -> Option<String> {
    let (_, key) = self.order.pop_first()?;
    self.entries.remove(&key);
    Some(key)
  }
}

/// Volatile key/value cache shared by the orchestrator and the queue worker.
///
/// Never fails: absence is the only signal.
pub struct VolatileCache {
  inner: Mutex<Inner>,
  capacity: usize,
  default_ttl: Duration,
}

impl VolatileCache {
  pub fn new(capacity: usize, default_ttl: Duration) -> Self {
    Self {
      inner: Mutex::new(Inner::default()),
      capacity,
      default_ttl,
    }
  }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Get a live value, removing it if it has expired.
  pub fn get(&self, key: &str) -> Option<Value> {
    let mut inner = self.lock();
    let expired = inner.entries.get(key)?.is_expired(Instant::now());
    if expired {
      inner.remove(key);
      return None;
    }
    inner.touch(key);
    inner.entries.get(key).map(|e| e.data.clone())
  }

  /// Typed `get`. A value that no longer deserializes is dropped.
  pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let value = self.get(key)?;
    match serde_json::from_value(value) {
      Ok(v) => Some(v),
      Err(e) => {
        debug!(key, error = %e, "dropping undecodable cache entry");
        self.delete(key);
        None
      }
    }
  }

  /// Insert or replace a value. `ttl` defaults to the cache's default.
  pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
    let mut inner = self.lock();
    inner.generation += 1;
    self.insert(&mut inner, key, value, ttl);
  }

  /// Current write generation. A value computed from data read at
  /// generation `g` is only safe to cache while the generation is still `g`.
  pub fn generation(&self) -> u64 {
    self.lock().generation
  }

  /// Fill `key` unless another write or removal happened since `generation`
  /// was read. Returns whether the value was stored.
  pub fn set_if_current<T: Serialize>(
    &self,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
    generation: u64,
  ) -> bool {
    let value = match serde_json::to_value(value) {
      Ok(v) => v,
      Err(e) => {
        debug!(key, error = %e, "skipping unserializable cache value");
        return false;
      }
    };
    let mut inner = self.lock();
    if inner.generation != generation {
      debug!(key, "not caching value read before a newer write");
      return false;
    }
    self.insert(&mut inner, key, value, ttl);
    true
  }

  fn insert(&self, inner: &mut Inner, key: &str, value: Value, ttl: Option<Duration>) {
    if self.capacity == 0 {
      return;
    }
    let tick = inner.bump();
    let entry = CacheEntry {
      data: value,
      stored_at: Instant::now(),
      ttl: ttl.unwrap_or(self.default_ttl),
      tick,
    };

    if let Some(old) = inner.entries.insert(key.to_string(), entry) {
      inner.order.remove(&old.tick);
    } else if inner.entries.len() > self.capacity {
      // The new key is the most recent, so it is never the one evicted.
      if let Some(evicted) = inner.evict_lru() {
        debug!(key = %evicted, "evicted least recently used entry");
      }
    }
    inner.order.insert(tick, key.to_string());
  }

  /// Typed `set`. Values that fail to serialize are not cached.
  pub fn set_as<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
    match serde_json::to_value(value) {
      Ok(v) => self.set(key, v, ttl),
      Err(e) => debug!(key, error = %e, "skipping unserializable cache value"),
    }
  }

  pub fn delete(&self, key: &str) -> bool {
    let mut inner = self.lock();
    inner.generation += 1;
    inner.remove(key).is_some()
  }

  /// Remove every key containing `pattern`. Returns how many were removed.
  pub fn invalidate_pattern(&self, pattern: &str) -> usize {
    self.invalidate_where(|key, _| key.contains(pattern))
  }

  /// Remove every entry for which `pred(key, value)` holds.
  pub fn invalidate_where(&self, pred: impl Fn(&str, &Value) -> bool) -> usize {
    let mut inner = self.lock();
    inner.generation += 1;
    let doomed: Vec<String> = inner
      .entries
      .iter()
      .filter(|(k, e)| pred(k, &e.data))
      .map(|(k, _)| k.clone())
      .collect();
    for key in &doomed {
      inner.remove(key);
    }
    doomed.len()
  }

  pub fn clear(&self) {
    let mut inner = self.lock();
    inner.generation += 1;
    inner.entries.clear();
    inner.order.clear();
  }
}

impl Default for VolatileCache {
  fn default() -> Self {
    Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
  }
}
