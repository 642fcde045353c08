//! REST implementation of the network boundary.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{ListQuery, Remote, RemoteRecord};
use crate::cache::{CacheKey, EntityType};
use crate::config::{Config, ServerConfig};
use crate::error::{SyncError, SyncResult};

/// REST client for the field-reporting backend.
///
/// `GET <url>/<endpoint>/<id>` reads an entity, `PUT` with a JSON merge
/// patch updates it, `GET <url>/<endpoint>` lists a collection and `POST`
/// creates. Entity bodies are JSON objects carrying an `_id` and a `version`.
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  server: ServerConfig,
  token: Option<String>,
}

impl HttpRemote {
  pub fn new(config: &Config) -> color_eyre::Result<Self> {
    Self::with_token(&config.server, Config::get_api_token())
  }

  pub fn with_token(server: &ServerConfig, token: Option<String>) -> color_eyre::Result<Self> {
    // Validate early so a bad URL fails at startup, not on first request
    Url::parse(&server.url)
      .map_err(|e| color_eyre::eyre::eyre!("Invalid server url '{}': {}", server.url, e))?;

    let client = reqwest::Client::builder()
      .timeout(Duration::from_millis(server.timeout_ms))
      .build()
      .map_err(|e| color_eyre::eyre::eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self {
      client,
      server: server.clone(),
      token,
    })
  }

  fn endpoint(&self, entity_type: EntityType) -> &str {
    match entity_type {
      EntityType::User => &self.server.endpoints.user,
      EntityType::Project => &self.server.endpoints.project,
      EntityType::Report => &self.server.endpoints.report,
    }
  }

  /// Base url with `segments` appended, each escaped as one path segment.
  fn url_with(&self, key: &CacheKey, segments: &[&str]) -> SyncResult<Url> {
    let mut url = Url::parse(&self.server.url)
      .map_err(|e| SyncError::network(key, format!("invalid server url: {}", e)))?;

    url
      .path_segments_mut()
      .map_err(|_| SyncError::network(key, "server url cannot be a base"))?
      .pop_if_empty()
      .extend(segments);

    Ok(url)
  }

  /// `<url>/<endpoint>/<id>`
  pub fn entity_url(&self, key: &CacheKey) -> SyncResult<Url> {
    self.url_with(key, &[self.endpoint(key.entity_type), &key.id])
  }

  /// `<url>/<endpoint>`, or `<url>/reportes/proyecto/<id>` for one project's reports.
  pub fn collection_url(&self, query: &ListQuery) -> SyncResult<Url> {
    let key = query.key();
    let endpoint = self.endpoint(query.entity_type);
    match (&query.project_id, query.entity_type) {
      (None, _) => self.url_with(&key, &[endpoint]),
      (Some(project_id), EntityType::Report) => {
        self.url_with(&key, &[endpoint, &self.server.endpoints.reports_by_project, project_id])
      }
      (Some(_), _) => Err(SyncError::network(&key, "only reports can be listed per project")),
    }
  }

  /// `<url>/<endpoint>`, or `<url>/usuarios/registrar` for accounts.
  pub fn create_url(&self, entity_type: EntityType) -> SyncResult<Url> {
    let key = CacheKey::new(entity_type, "*");
    let endpoint = self.endpoint(entity_type);
    match entity_type {
      EntityType::User => self.url_with(&key, &[endpoint, &self.server.endpoints.user_register]),
      _ => self.url_with(&key, &[endpoint]),
    }
  }

  async fn send(
    &self,
    key: &CacheKey,
    request: reqwest::RequestBuilder,
  ) -> SyncResult<(StatusCode, Vec<u8>)> {
    let request = match &self.token {
      Some(token) => request.bearer_auth(token),
      None => request,
    };

    let response = request
      .send()
      .await
      .map_err(|e| SyncError::network(key, e.to_string()))?;

    let status = response.status();
    let body = response
      .bytes()
      .await
      .map_err(|e| SyncError::network(key, format!("failed to read body: {}", e)))?
      .to_vec();

    debug!(%key, status = status.as_u16(), bytes = body.len(), "Server responded");
    Ok((status, body))
  }
}

/// Server-assigned id of an entity body: `_id`, else `id`.
fn entity_id(payload: &Value) -> Option<String> {
  match payload.get("_id").or_else(|| payload.get("id"))? {
    Value::String(id) if !id.is_empty() => Some(id.clone()),
    Value::Number(id) => Some(id.to_string()),
    _ => None,
  }
}

fn check_status(key: &CacheKey, status: StatusCode, body: &[u8]) -> SyncResult<()> {
  match status {
    StatusCode::NOT_FOUND => Err(SyncError::not_found(key)),
    StatusCode::CONFLICT => {
      let version = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("version").and_then(Value::as_u64))
        .unwrap_or_default();
      Err(SyncError::Conflict {
        key: key.clone(),
        version,
      })
    }
    s if !s.is_success() => Err(SyncError::network(key, format!("server returned {}", s))),
    _ => Ok(()),
  }
}

fn record_from(key: &CacheKey, payload: Value) -> SyncResult<RemoteRecord> {
  if !payload.is_object() {
    return Err(SyncError::network(key, "expected a JSON object"));
  }

  let version = payload
    .get("version")
    .and_then(Value::as_u64)
    .ok_or_else(|| SyncError::network(key, "response has no integer 'version' member"))?;

  Ok(RemoteRecord::new(payload, version))
}

/// Map an HTTP response onto a record or the matching error kind.
pub(crate) fn parse_response(
  key: &CacheKey,
  status: StatusCode,
  body: &[u8],
) -> SyncResult<RemoteRecord> {
  check_status(key, status, body)?;

  let payload: Value = serde_json::from_slice(body)
    .map_err(|e| SyncError::network(key, format!("invalid JSON body: {}", e)))?;
  record_from(key, payload)
}

/// Map a creation response onto the new entity's key and record.
pub(crate) fn parse_created(
  entity_type: EntityType,
  status: StatusCode,
  body: &[u8],
) -> SyncResult<(CacheKey, RemoteRecord)> {
  let pending = CacheKey::new(entity_type, "*");
  let record = parse_response(&pending, status, body)?;
  let id = entity_id(&record.payload)
    .ok_or_else(|| SyncError::network(&pending, "created entity has no '_id' or 'id' member"))?;
  Ok((CacheKey::new(entity_type, id), record))
}

/// Map a collection response (a JSON array of entities) onto keyed records.
pub(crate) fn parse_collection(
  query: &ListQuery,
  status: StatusCode,
  body: &[u8],
) -> SyncResult<Vec<(CacheKey, RemoteRecord)>> {
  let key = query.key();
  check_status(&key, status, body)?;

  let items: Vec<Value> = serde_json::from_slice(body)
    .map_err(|e| SyncError::network(&key, format!("expected a JSON array: {}", e)))?;

  items
    .into_iter()
    .map(|payload| {
      let id = entity_id(&payload)
        .ok_or_else(|| SyncError::network(&key, "collection item has no '_id' or 'id' member"))?;
      let item_key = CacheKey::new(query.entity_type, id);
      let record = record_from(&item_key, payload)?;
      Ok((item_key, record))
    })
    .collect()
}

#[async_trait]
impl Remote for HttpRemote {
  async fn fetch_entity(&self, key: &CacheKey) -> SyncResult<RemoteRecord> {
    let url = self.entity_url(key)?;
    let (status, body) = self.send(key, self.client.get(url)).await?;
    parse_response(key, status, &body)
  }

  async fn mutate_entity(&self, key: &CacheKey, patch: &Value) -> SyncResult<RemoteRecord> {
    let url = self.entity_url(key)?;
    let (status, body) = self.send(key, self.client.put(url).json(patch)).await?;
    parse_response(key, status, &body)
  }

  async fn fetch_collection(&self, query: &ListQuery) -> SyncResult<Vec<(CacheKey, RemoteRecord)>> {
    let url = self.collection_url(query)?;
    let (status, body) = self.send(&query.key(), self.client.get(url)).await?;
    parse_collection(query, status, &body)
  }

  async fn create_entity(
    &self,
    entity_type: EntityType,
    payload: &Value,
  ) -> SyncResult<(CacheKey, RemoteRecord)> {
    let url = self.create_url(entity_type)?;
    let key = CacheKey::new(entity_type, "*");
    let (status, body) = self.send(&key, self.client.post(url).json(payload)).await?;
    parse_created(entity_type, status, &body)
  }
}
