//! Typed list filters.
//!
//! Each filter targets one field with an equals, contains or range test. All
//! filters in a set must match (AND).

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{Entity, PersistedRecord};
use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FilterOp {
  Equals { value: Value },
  /// Case-insensitive substring match on strings, element match on arrays
  Contains { needle: String },
  /// Inclusive bounds on numbers or strings (ISO dates compare as strings)
  Range {
    min: Option<Value>,
    max: Option<Value>,
  },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
  pub field: String,
  #[serde(flatten)]
  pub op: FilterOp,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filters(Vec<FieldFilter>);

impl Filters {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn equals(mut self, field: &str, value: impl Into<Value>) -> Self {
    self.0.push(FieldFilter {
      field: field.to_string(),
      op: FilterOp::Equals {
        value: value.into(),
      },
    });
    self
  }

  pub fn contains(mut self, field: &str, needle: &str) -> Self {
    self.0.push(FieldFilter {
      field: field.to_string(),
      op: FilterOp::Contains {
        needle: needle.to_string(),
      },
    });
    self
  }

  pub fn range(mut self, field: &str, min: Option<Value>, max: Option<Value>) -> Self {
    self.0.push(FieldFilter {
      field: field.to_string(),
      op: FilterOp::Range { min, max },
    });
    self
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &FieldFilter> {
    self.0.iter()
  }

  /// Reject filters that can never be evaluated meaningfully.
  pub fn validate(&self) -> Result<(), SyncError> {
    for filter in &self.0 {
      let field = filter.field.as_str();
      if field.trim().is_empty() {
        return Err(SyncError::InvalidFilter("empty field name".to_string()));
      }
      match &filter.op {
        FilterOp::Equals { value } => {
          if value.is_object() || value.is_array() {
            return Err(SyncError::InvalidFilter(format!(
              "{}: equals takes a scalar value",
              field
            )));
          }
        }
        FilterOp::Contains { needle } => {
          if needle.is_empty() {
            return Err(SyncError::InvalidFilter(format!(
              "{}: contains needs a non-empty needle",
              field
            )));
          }
        }
        FilterOp::Range { min, max } => validate_range(field, min.as_ref(), max.as_ref())?,
      }
    }
    Ok(())
  }

  /// Stable text form, independent of the order filters were added in.
  pub fn canonical(&self) -> String {
    let mut parts: Vec<String> = self
      .0
      .iter()
      .map(|f| serde_json::to_string(f).unwrap_or_default())
      .collect();
    parts.sort();
    parts.join("&")
  }

  pub fn matches(&self, entity: &Entity) -> bool {
    self.0.iter().all(|f| f.matches(entity))
  }

  pub fn apply(&self, records: Vec<PersistedRecord>) -> Vec<PersistedRecord> {
    if self.is_empty() {
      return records;
    }
    records
      .into_iter()
      .filter(|r| self.matches(&r.entity))
      .collect()
  }
}

fn validate_range(field: &str, min: Option<&Value>, max: Option<&Value>) -> Result<(), SyncError> {
  let bound_ok = |v: Option<&Value>| v.map_or(true, |v| v.is_number() || v.is_string());
  if min.is_none() && max.is_none() {
    return Err(SyncError::InvalidFilter(format!(
      "{}: range needs at least one bound",
      field
    )));
  }
  if !bound_ok(min) || !bound_ok(max) {
    return Err(SyncError::InvalidFilter(format!(
      "{}: range bounds must be numbers or strings",
      field
    )));
  }
  if let (Some(lo), Some(hi)) = (min, max) {
    match compare(lo, hi) {
      Some(Ordering::Greater) => {
        return Err(SyncError::InvalidFilter(format!("{}: min is above max", field)));
      }
      None => {
        return Err(SyncError::InvalidFilter(format!(
          "{}: range bounds must have the same type",
          field
        )));
      }
      _ => {}
    }
  }
  Ok(())
}

impl FieldFilter {
  fn matches(&self, entity: &Entity) -> bool {
    let Some(actual) = entity.field(&self.field) else {
      return false;
    };
    match &self.op {
      FilterOp::Equals { value } => values_equal(&actual, value),
      FilterOp::Contains { needle } => match &actual {
        Value::String(s) => s.to_lowercase().contains(&needle.to_lowercase()),
        Value::Array(items) => items.iter().any(|v| v.as_str() == Some(needle.as_str())),
        _ => false,
      },
      FilterOp::Range { min, max } => {
        let above_min = min
          .as_ref()
          .map_or(true, |lo| matches!(compare(&actual, lo), Some(Ordering::Greater | Ordering::Equal)));
        let below_max = max
          .as_ref()
          .map_or(true, |hi| matches!(compare(&actual, hi), Some(Ordering::Less | Ordering::Equal)));
        above_min && below_max
      }
    }
  }
}

fn values_equal(a: &Value, b: &Value) -> bool {
  match (a, b) {
    (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
    _ => a == b,
  }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
  match (a, b) {
    (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
    (Value::String(x), Value::String(y)) => Some(x.as_str().cmp(y.as_str())),
    _ => None,
  }
}
