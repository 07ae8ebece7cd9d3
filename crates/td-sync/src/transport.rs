//! Transports: how a client reaches the server event log.

use std::sync::Arc;

use async_trait::async_trait;

use crate::protocol::{Event, PullResult, PushResult};
use crate::server_log::EventLog;
use crate::SyncError;

/// The push/pull surface of the server, independent of where it runs.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn push(&self, project_id: &str, events: Vec<Event>) -> Result<PushResult, SyncError>;

    async fn pull(
        &self,
        project_id: &str,
        since: i64,
        limit: i64,
        exclude_device: Option<&str>,
    ) -> Result<PullResult, SyncError>;
}

// Boxed transports forward the trait so callers can pick one at runtime.
#[async_trait]
impl SyncTransport for Box<dyn SyncTransport> {
    async fn push(&self, project_id: &str, events: Vec<Event>) -> Result<PushResult, SyncError> {
        (**self).push(project_id, events).await
    }

    async fn pull(
        &self,
        project_id: &str,
        since: i64,
        limit: i64,
        exclude_device: Option<&str>,
    ) -> Result<PullResult, SyncError> {
        (**self).pull(project_id, since, limit, exclude_device).await
    }
}

// ---------------------------------------------------------------------------
// LocalTransport
// ---------------------------------------------------------------------------

/// In-process transport over a shared [`EventLog`] (same-machine sync and
/// tests).
#[derive(Clone)]
pub struct LocalTransport {
    log: Arc<EventLog>,
}

impl LocalTransport {
    pub fn new(log: Arc<EventLog>) -> Self {
        Self { log }
    }
}

#[async_trait]
impl SyncTransport for LocalTransport {
    async fn push(&self, project_id: &str, events: Vec<Event>) -> Result<PushResult, SyncError> {
        self.log.push_events(project_id, events).await
    }

    async fn pull(
        &self,
        project_id: &str,
        since: i64,
        limit: i64,
        exclude_device: Option<&str>,
    ) -> Result<PullResult, SyncError> {
        self.log.events_since(project_id, since, limit, exclude_device).await
    }
}

// ---------------------------------------------------------------------------
// HttpTransport
// ---------------------------------------------------------------------------

/// HTTP transport against a running td server (`/sync/push`, `/sync/pull`),
/// with optional bearer auth.
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
    auth_key: Option<String>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, auth_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_key,
        }
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn push(&self, _project_id: &str, events: Vec<Event>) -> Result<PushResult, SyncError> {
        let url = format!("{}/sync/push", self.base_url);
        let response = self
            .authorize(self.http.post(&url))
            .json(&serde_json::json!({ "events": events }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SyncError::Transport(format!(
                "push failed: {} from {url}",
                response.status()
            )));
        }
        Ok(response.json::<PushResult>().await?)
    }

    async fn pull(
        &self,
        _project_id: &str,
        since: i64,
        limit: i64,
        exclude_device: Option<&str>,
    ) -> Result<PullResult, SyncError> {
        let url = format!("{}/sync/pull", self.base_url);
        let mut query: Vec<(&str, String)> =
            vec![("since", since.to_string()), ("limit", limit.to_string())];
        if let Some(device) = exclude_device {
            if !device.is_empty() {
                query.push(("exclude_device", device.to_string()));
            }
        }
        let response = self.authorize(self.http.get(&url)).query(&query).send().await?;
        if !response.status().is_success() {
            return Err(SyncError::Transport(format!(
                "pull failed: {} from {url}",
                response.status()
            )));
        }
        Ok(response.json::<PullResult>().await?)
    }
}
