//! REST transport for the remote store.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;

use super::remote::{ChangeFeed, RemoteResult, RemoteStore};
use super::{RemoteErrorDetail, SyncError, SyncResult};
use crate::config::RemoteConfig;
use crate::models::{EntityId, EntityKind, RawRecord};

const UPSERT_PREFERENCE: &str = "resolution=merge-duplicates,return=representation,missing=default";

/// PostgREST-style remote.
///
/// Has no live change feed; the engine relies on reconciliation instead.
#[derive(Clone)]
pub struct HttpRemoteStore {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpRemoteStore {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpRemoteStore")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl HttpRemoteStore {
    pub fn new(config: &RemoteConfig) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|error| SyncError::Remote(format!("Failed to build HTTP client: {error}")))?;
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client,
        })
    }

    fn table_url(&self, kind: EntityKind) -> String {
        format!("{}/rest/v1/{}", self.base_url, kind.table())
    }

    fn request(&self, method: Method, kind: EntityKind) -> RequestBuilder {
        self.client
            .request(method, self.table_url(kind))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Accept", "application/json")
    }

    async fn send(request: RequestBuilder) -> RemoteResult<Response> {
        let response = request.send().await.map_err(transport_error)?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(parse_api_error(status, &body))
    }

    async fn rows(response: Response) -> RemoteResult<Vec<RawRecord>> {
        response
            .json::<Vec<RawRecord>>()
            .await
            .map_err(|error| RemoteErrorDetail::new(format!("Invalid response payload: {error}")))
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn fetch_all(&self, kind: EntityKind) -> RemoteResult<Vec<RawRecord>> {
        let request = self.request(Method::GET, kind).query(&[("select", "*")]);
        Self::rows(Self::send(request).await?).await
    }

    async fn commit_batch(
        &self,
        kind: EntityKind,
        records: Vec<RawRecord>,
    ) -> RemoteResult<Vec<RawRecord>> {
        let request = self
            .request(Method::POST, kind)
            .query(&[("on_conflict", "id")])
            .header("Prefer", UPSERT_PREFERENCE)
            .json(&records);
        Self::rows(Self::send(request).await?).await
    }

    async fn delete(&self, kind: EntityKind, id: EntityId) -> RemoteResult<()> {
        let filter = format!("eq.{id}");
        let request = self
            .request(Method::DELETE, kind)
            .query(&[("id", filter.as_str())]);
        Self::send(request).await?;
        Ok(())
    }

    async fn subscribe(&self, kind: EntityKind) -> RemoteResult<ChangeFeed> {
        Err(RemoteErrorDetail::new(format!(
            "REST transport has no change feed for {kind}"
        )))
    }

    async fn unsubscribe(&self, _kind: EntityKind) {}

    async fn probe(&self) -> RemoteResult<()> {
        let request = self
            .request(Method::GET, EntityKind::User)
            .query(&[("select", "id"), ("limit", "1")]);
        Self::send(request).await?;
        Ok(())
    }

    fn supports_change_feed(&self) -> bool {
        false
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: Option<String>,
    message: Option<String>,
    error: Option<String>,
    details: Option<String>,
    hint: Option<String>,
}

/// Longest slice of a non-JSON error body kept in a diagnostic
const ERROR_BODY_CHARS: usize = 180;

fn parse_api_error(status: StatusCode, body: &str) -> RemoteErrorDetail {
    let mut detail = match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(payload) => {
            let message = payload
                .message
                .or(payload.error)
                .map(|message| message.trim().to_string())
                .filter(|message| !message.is_empty())
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            RemoteErrorDetail {
                code: payload.code,
                message,
                details: payload.details.or(payload.hint),
                status: None,
            }
        }
        Err(_) => {
            let trimmed: String = body.trim().chars().take(ERROR_BODY_CHARS).collect();
            if trimmed.is_empty() {
                RemoteErrorDetail::new(format!("HTTP {}", status.as_u16()))
            } else {
                RemoteErrorDetail::new(trimmed)
            }
        }
    };
    detail.status = Some(status.as_u16());
    detail
}

fn transport_error(error: reqwest::Error) -> RemoteErrorDetail {
    let mut detail = RemoteErrorDetail::new(format!("Request failed: {error}"));
    detail.status = error.status().map(|status| status.as_u16());
    detail
}
