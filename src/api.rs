//! The platform's public comment API: URL shape, headers, payloads, and the
//! deduplicated, rate-limited client the reconciliation engine talks to.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::{ApiConfig, SearchConfig};
use crate::flight::{ConcurrencyGate, SingleFlight};
use crate::metrics::Metrics;
use crate::net::{Fetch, HttpRequest};

/// Opaque credentials recovered from the page, required for every call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    pub app_id: String,
    pub client_version: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("api: request failed with status {0}")]
    Http(u16),
    #[error("api: returned error: {0}")]
    Status(String),
    #[error("api: could not decode response: {0}")]
    Decode(String),
    #[error("api: transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    TopLevel,
    Reply,
}

impl Level {
    fn as_param(self) -> u8 {
        match self {
            Level::TopLevel => 1,
            Level::Reply => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery<'a> {
    pub level: Level,
    pub parent: Option<&'a str>,
    pub after: Option<&'a str>,
}

impl<'a> ListQuery<'a> {
    pub fn top_level(after: Option<&'a str>) -> Self {
        Self {
            level: Level::TopLevel,
            parent: None,
            after,
        }
    }

    pub fn replies(parent: &'a str, after: Option<&'a str>) -> Self {
        Self {
            level: Level::Reply,
            parent: Some(parent),
            after,
        }
    }
}

pub fn build_list_url(
    api: &ApiConfig,
    network: &NetworkConfig,
    post_key: &str,
    query: &ListQuery<'_>,
) -> String {
    let mut url = format!(
        "{}?appId={}&count={}&type=old&level={}&url={}{}&origin={}",
        api.comment_list_url,
        network.app_id,
        api.page_size,
        query.level.as_param(),
        api.post_url_base,
        post_key,
        api.origin,
    );
    if let Some(parent) = query.parent {
        url.push_str("&commentId=");
        url.push_str(parent);
    }
    if let Some(after) = query.after {
        url.push_str("&after=");
        url.push_str(after);
    }
    url
}

pub fn request_headers(api: &ApiConfig, network: &NetworkConfig) -> Vec<(String, String)> {
    vec![
        ("Accept".into(), "*/*".into()),
        ("Origin".into(), api.origin.clone()),
        ("Referer".into(), api.referer.clone()),
        ("client-version".into(), network.client_version.clone()),
    ]
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct CommentListResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub payload: Option<CommentListPayload>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct CommentListPayload {
    #[serde(default)]
    pub comments: Option<Vec<ApiComment>>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApiComment {
    #[serde(default)]
    pub comment_id: Option<String>,
    #[serde(default)]
    pub level: Option<i64>,
    #[serde(default)]
    pub parent_comment_id: Option<String>,
}

impl CommentListResponse {
    /// `None` when the payload carries no comment list at all.
    pub fn comments(&self) -> Option<&[ApiComment]> {
        self.payload
            .as_ref()
            .and_then(|payload| payload.comments.as_deref())
    }

    fn error_message(&self) -> String {
        match &self.error {
            Some(Value::String(message)) => message.clone(),
            Some(other) => other.to_string(),
            None => self.status.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct AddCommentResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub payload: Option<AddCommentPayload>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct AddCommentPayload {
    #[serde(default)]
    pub comment: Option<NewComment>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewComment {
    #[serde(default)]
    pub comment_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl AddCommentResponse {
    /// The created comment, when the call succeeded.
    pub fn created(self) -> Option<NewComment> {
        if self.status != "OK" {
            return None;
        }
        self.payload.and_then(|payload| payload.comment)
    }
}

pub type ListResult = Result<Arc<CommentListResponse>, ApiError>;

/// Comment-listing client. Identical URLs in flight share one request, and a
/// gate bounds the number of simultaneous requests.
pub struct CommentApi {
    fetch: Arc<dyn Fetch>,
    api: ApiConfig,
    network: NetworkConfig,
    flights: SingleFlight<ListResult>,
    gate: ConcurrencyGate,
    metrics: Arc<Metrics>,
}

impl CommentApi {
    pub fn new(
        fetch: Arc<dyn Fetch>,
        api: ApiConfig,
        search: &SearchConfig,
        gate_poll: std::time::Duration,
        network: NetworkConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            fetch,
            api,
            network,
            flights: SingleFlight::new(),
            gate: ConcurrencyGate::new(search.max_concurrent_requests, gate_poll),
            metrics,
        }
    }

    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }

    pub fn page_size(&self) -> usize {
        self.api.page_size
    }

    pub fn list_url(&self, post_key: &str, query: &ListQuery<'_>) -> String {
        build_list_url(&self.api, &self.network, post_key, query)
    }

    pub fn list(&self, url: &str) -> ListResult {
        let (result, shared) = self.flights.run(url, || {
            let _slot = self.gate.acquire();
            self.execute(url)
        });
        if shared {
            debug!(url, "reused pending request");
            self.metrics.duplicate_prevented();
        }
        result
    }

    fn execute(&self, url: &str) -> ListResult {
        let mut request = HttpRequest::get(url);
        request.headers = request_headers(&self.api, &self.network);
        let response = self
            .fetch
            .fetch(&request)
            .map_err(|err| ApiError::Transport(format!("{err:#}")))?;
        self.metrics.api_call(response.body.len());
        if !response.ok() {
            return Err(ApiError::Http(response.status));
        }
        let data: CommentListResponse = serde_json::from_str(&response.body)
            .map_err(|err| ApiError::Decode(err.to_string()))?;
        if data.status != "OK" {
            return Err(ApiError::Status(data.error_message()));
        }
        Ok(Arc::new(data))
    }
}
