//! Scripted in-memory remote for tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;

use super::RemoteClient;
use crate::entity::{Entity, EntityType};
use crate::error::RemoteError;
use crate::sync::Filters;

#[derive(Default)]
struct MockState {
  records: BTreeMap<(EntityType, String), Entity>,
  /// Errors returned by the next mutating calls, in order
  failures: VecDeque<RemoteError>,
  offline: bool,
  next_id: u64,
  /// idempotency key -> id already created for it
  created: HashMap<String, String>,
  calls: Vec<String>,
}

pub struct MockRemote {
  state: Mutex<MockState>,
  /// When set, mutating calls wait for a permit before doing anything
  gate: Option<Semaphore>,
  delay: Duration,
}

impl MockRemote {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(MockState::default()),
      gate: None,
      delay: Duration::ZERO,
    }
  }

  /// Mutations block until `release` is called.
  pub fn gated() -> Self {
    Self {
      gate: Some(Semaphore::new(0)),
      ..Self::new()
    }
  }

  /// Every call sleeps for `delay` first.
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  pub fn release(&self, n: usize) {
    if let Some(gate) = &self.gate {
      gate.add_permits(n);
    }
  }

  pub fn seed(&self, entity_type: EntityType, id: &str, owner_id: &str, fields: Value) {
    let entity = Entity {
      id: id.to_string(),
      owner_id: owner_id.to_string(),
      fields: fields.as_object().cloned().unwrap_or_default(),
    };
    self
      .state
      .lock()
      .unwrap()
      .records
      .insert((entity_type, id.to_string()), entity);
  }

  /// The next `times` mutations fail with `error`.
  pub fn fail_next(&self, times: usize, error: RemoteError) {
    let mut state = self.state.lock().unwrap();
    for _ in 0..times {
      state.failures.push_back(error.clone());
    }
  }

  pub fn set_offline(&self, offline: bool) {
    self.state.lock().unwrap().offline = offline;
  }

  pub fn calls(&self) -> Vec<String> {
    self.state.lock().unwrap().calls.clone()
  }

  pub fn count_calls(&self, prefix: &str) -> usize {
    self
      .calls()
      .iter()
      .filter(|c| c.starts_with(prefix))
      .count()
  }

  pub fn record(&self, entity_type: EntityType, id: &str) -> Option<Entity> {
    self
      .state
      .lock()
      .unwrap()
      .records
      .get(&(entity_type, id.to_string()))
      .cloned()
  }

  async fn enter(&self, call: String, mutating: bool) -> Result<(), RemoteError> {
    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }
    if mutating {
      if let Some(gate) = &self.gate {
        gate
          .acquire()
          .await
          .map_err(|_| RemoteError::Transient("gate closed".to_string()))?
          .forget();
      }
    }
    let mut state = self.state.lock().unwrap();
    state.calls.push(call);
    if state.offline {
      return Err(RemoteError::Transient("offline".to_string()));
    }
    if mutating {
      if let Some(err) = state.failures.pop_front() {
        return Err(err);
      }
    }
    Ok(())
  }
}

#[async_trait]
impl RemoteClient for MockRemote {
  async fn list(
    &self,
    entity_type: EntityType,
    owner_id: &str,
    filters: &Filters,
  ) -> Result<Vec<Entity>, RemoteError> {
    self
      .enter(format!("list:{}:{}", entity_type, owner_id), false)
      .await?;
    let state = self.state.lock().unwrap();
    Ok(
      state
        .records
        .iter()
        .filter(|((t, _), e)| *t == entity_type && e.owner_id == owner_id && filters.matches(e))
        .map(|(_, e)| e.clone())
        .collect(),
    )
  }

  async fn get_by_id(
    &self,
    entity_type: EntityType,
    id: &str,
  ) -> Result<Option<Entity>, RemoteError> {
    self.enter(format!("get:{}:{}", entity_type, id), false).await?;
    Ok(self.record(entity_type, id))
  }

  async fn create(
    &self,
    entity_type: EntityType,
    data: &Map<String, Value>,
    idempotency_key: &str,
  ) -> Result<Entity, RemoteError> {
    self.enter(format!("create:{}", entity_type), true).await?;
    let mut state = self.state.lock().unwrap();
    if let Some(id) = state.created.get(idempotency_key).cloned() {
      if let Some(existing) = state.records.get(&(entity_type, id)) {
        return Ok(existing.clone());
      }
    }

    state.next_id += 1;
    let id = format!("{}_{}", entity_type, state.next_id);
    let mut fields = data.clone();
    let owner_id = match fields.remove("owner_id") {
      Some(Value::String(owner)) => owner,
      _ => return Err(RemoteError::Rejected("owner_id is required".to_string())),
    };
    let entity = Entity {
      id: id.clone(),
      owner_id,
      fields,
    };
    state
      .created
      .insert(idempotency_key.to_string(), id.clone());
    state.records.insert((entity_type, id), entity.clone());
    Ok(entity)
  }

  async fn update(
    &self,
    entity_type: EntityType,
    id: &str,
    data: &Map<String, Value>,
  ) -> Result<Entity, RemoteError> {
    self.enter(format!("update:{}:{}", entity_type, id), true).await?;
    let mut state = self.state.lock().unwrap();
    let entity = state
      .records
      .get_mut(&(entity_type, id.to_string()))
      .ok_or(RemoteError::NotFound)?;
    entity.merge(data);
    Ok(entity.clone())
  }

  async fn delete(&self, entity_type: EntityType, id: &str) -> Result<(), RemoteError> {
    self.enter(format!("delete:{}:{}", entity_type, id), true).await?;
    let mut state = self.state.lock().unwrap();
    state
      .records
      .remove(&(entity_type, id.to_string()))
      .map(|_| ())
      .ok_or(RemoteError::NotFound)
  }
}
