use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{Map, Value};
use url::Url;

use super::RemoteClient;
use crate::entity::{Entity, EntityType};
use crate::error::RemoteError;
use crate::sync::{FilterOp, Filters};

/// JSON/REST implementation of `RemoteClient`.
///
/// `GET/POST {base}/{table}` and `GET/PATCH/DELETE {base}/{table}/{id}`.
#[derive(Clone)]
pub struct HttpRemote {
  client: Client,
  base_url: String,
  token: Option<String>,
}

impl HttpRemote {
  /// Create a new HTTP remote pointing to the given base URL.
  pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
    Self::with_client(Client::new(), base_url, token)
  }

  /// Create a new HTTP remote with a custom reqwest client.
  pub fn with_client(client: Client, base_url: impl Into<String>, token: Option<String>) -> Self {
    Self {
      client,
      base_url: base_url.into().trim_end_matches('/').to_string(),
      token,
    }
  }

  fn collection_url(&self, entity_type: EntityType) -> Result<Url, RemoteError> {
    parse_url(&format!("{}/{}", self.base_url, entity_type.table()))
  }

  fn item_url(&self, entity_type: EntityType, id: &str) -> Result<Url, RemoteError> {
    let mut url = self.collection_url(entity_type)?;
    url
      .path_segments_mut()
      .map_err(|_| RemoteError::Rejected(format!("base url cannot hold a path: {}", self.base_url)))?
      .push(id);
    Ok(url)
  }

  fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
    match &self.token {
      Some(token) => request.bearer_auth(token),
      None => request,
    }
  }

  async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
    self
      .authorize(request)
      .send()
      .await
      .map_err(|e| RemoteError::Transient(e.to_string()))
  }
}

fn parse_url(s: &str) -> Result<Url, RemoteError> {
  Url::parse(s).map_err(|e| RemoteError::Rejected(format!("invalid url {}: {}", s, e)))
}

/// Encode filters as query parameters: `field=v`, `field__contains=v`,
/// `field__gte=v`, `field__lte=v`.
fn append_filters(url: &mut Url, filters: &Filters) {
  let mut query = url.query_pairs_mut();
  for filter in filters.iter() {
    match &filter.op {
      FilterOp::Equals { value } => {
        query.append_pair(&filter.field, &scalar_param(value));
      }
      FilterOp::Contains { needle } => {
        query.append_pair(&format!("{}__contains", filter.field), needle);
      }
      FilterOp::Range { min, max } => {
        if let Some(min) = min {
          query.append_pair(&format!("{}__gte", filter.field), &scalar_param(min));
        }
        if let Some(max) = max {
          query.append_pair(&format!("{}__lte", filter.field), &scalar_param(max));
        }
      }
    }
  }
}

fn scalar_param(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

/// Map a non-success response onto the error taxonomy.
async fn classify(response: Response) -> RemoteError {
  let status = response.status();
  let body = response.text().await.unwrap_or_default();
  match status {
    StatusCode::NOT_FOUND => RemoteError::NotFound,
    StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
      RemoteError::Rejected(format!("{}: {}", status, body))
    }
    status => RemoteError::Transient(format!("unexpected status code: {}", status)),
  }
}

async fn parse_json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
  response
    .json()
    .await
    .map_err(|e| RemoteError::Transient(format!("failed to parse response: {}", e)))
}

#[async_trait]
impl RemoteClient for HttpRemote {
  async fn list(
    &self,
    entity_type: EntityType,
    owner_id: &str,
    filters: &Filters,
  ) -> Result<Vec<Entity>, RemoteError> {
    let mut url = self.collection_url(entity_type)?;
    url.query_pairs_mut().append_pair("owner_id", owner_id);
    append_filters(&mut url, filters);

    let response = self.send(self.client.get(url)).await?;
    if response.status().is_success() {
      parse_json(response).await
    } else {
      Err(classify(response).await)
    }
  }

  async fn get_by_id(
    &self,
    entity_type: EntityType,
    id: &str,
  ) -> Result<Option<Entity>, RemoteError> {
    let url = self.item_url(entity_type, id)?;
    let response = self.send(self.client.get(url)).await?;
    match response.status() {
      StatusCode::NOT_FOUND => Ok(None),
      s if s.is_success() => parse_json(response).await.map(Some),
      _ => Err(classify(response).await),
    }
  }

  async fn create(
    &self,
    entity_type: EntityType,
    data: &Map<String, Value>,
    idempotency_key: &str,
  ) -> Result<Entity, RemoteError> {
    let url = self.collection_url(entity_type)?;
    let request = self
      .client
      .post(url)
      .header("Idempotency-Key", idempotency_key)
      .json(data);
    let response = self.send(request).await?;
    if response.status().is_success() {
      parse_json(response).await
    } else {
      Err(classify(response).await)
    }
  }

  async fn update(
    &self,
    entity_type: EntityType,
    id: &str,
    data: &Map<String, Value>,
  ) -> Result<Entity, RemoteError> {
    let url = self.item_url(entity_type, id)?;
    let response = self.send(self.client.patch(url).json(data)).await?;
    if response.status().is_success() {
      parse_json(response).await
    } else {
      Err(classify(response).await)
    }
  }

  async fn delete(&self, entity_type: EntityType, id: &str) -> Result<(), RemoteError> {
    let url = self.item_url(entity_type, id)?;
    let response = self.send(self.client.delete(url)).await?;
    if response.status().is_success() {
      Ok(())
    } else {
      Err(classify(response).await)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_item_url_escapes_id() {
    let remote = HttpRemote::new("https://api.example.com/v1/", None);
    let url = remote.item_url(EntityType::JournalEntry, "je 1/2").unwrap();
    assert_eq!(
      url.as_str(),
      "https://api.example.com/v1/journal_entries/je%201%2F2"
    );
  }

  #[test]
  fn test_filters_become_query_params() {
    let remote = HttpRemote::new("https://api.example.com", None);
    let mut url = remote.collection_url(EntityType::Invoice).unwrap();
    let filters = Filters::new()
      .equals("status", "paid")
      .contains("customer_name", "acme")
      .range("total", Some(json!(10)), None);
    append_filters(&mut url, &filters);

    assert_eq!(
      url.query(),
      Some("status=paid&customer_name__contains=acme&total__gte=10")
    );
  }
}
