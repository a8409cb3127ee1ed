//! Narrow interfaces to the systems the orchestrator talks to. Production
//! implementations live in `slack`, `looker` and `compute`; tests plug in
//! in-process fakes.

use std::sync::Arc;

use async_trait::async_trait;
use creditbot_contracts::{ChatMessage, ComputeResult, ReportReference};
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("{operation} request failed: {message}")]
    Transport { operation: String, message: String },
    #[error("{operation} returned HTTP {status}: {body}")]
    Status {
        operation: String,
        status: u16,
        body: String,
    },
    #[error("{operation} failed: {message}")]
    Api { operation: String, message: String },
    #[error("{operation} response could not be decoded: {message}")]
    Decode { operation: String, message: String },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("{0}")]
    InvalidReference(String),
    #[error("client setup failed: {0}")]
    Setup(String),
}

impl CollaboratorError {
    pub fn api(operation: &str, message: impl Into<String>) -> Self {
        Self::Api {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Most recent messages of the channel, oldest first.
    async fn fetch_recent(&self, limit: usize) -> Result<Vec<ChatMessage>, CollaboratorError>;
}

#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn post_reply(&self, thread_id: &str, text: &str) -> Result<(), CollaboratorError>;
    async fn send_direct(&self, operator_id: &str, text: &str) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait ReportResolver: Send + Sync {
    async fn resolve_query(&self, reference: &ReportReference) -> Result<String, CollaboratorError>;
}

#[async_trait]
pub trait ComputeEngine: Send + Sync {
    async fn compute(&self, query: &str) -> Result<ComputeResult, CollaboratorError>;
}

#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn MessageSource>,
    pub replies: Arc<dyn ReplySink>,
    pub resolver: Arc<dyn ReportResolver>,
    pub engine: Arc<dyn ComputeEngine>,
}

pub(crate) fn http_client(
    timeout_ms: u64,
    user_agent: &'static str,
) -> Result<reqwest::Client, CollaboratorError> {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        reqwest::header::USER_AGENT,
        reqwest::header::HeaderValue::from_static(user_agent),
    );
    headers.insert(
        reqwest::header::ACCEPT,
        reqwest::header::HeaderValue::from_static("application/json"),
    );
    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(std::time::Duration::from_millis(timeout_ms.max(1)))
        .build()
        .map_err(|e| CollaboratorError::Setup(e.to_string()))
}

pub(crate) async fn send(
    operation: &str,
    request: reqwest::RequestBuilder,
) -> Result<reqwest::Response, CollaboratorError> {
    let response = request
        .send()
        .await
        .map_err(|e| CollaboratorError::Transport {
            operation: operation.to_string(),
            message: e.to_string(),
        })?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(CollaboratorError::Status {
        operation: operation.to_string(),
        status: status.as_u16(),
        body: truncate_for_error(&body, 800),
    })
}

pub(crate) async fn decode_json<T: DeserializeOwned>(
    operation: &str,
    response: reqwest::Response,
) -> Result<T, CollaboratorError> {
    response
        .json::<T>()
        .await
        .map_err(|e| CollaboratorError::Decode {
            operation: operation.to_string(),
            message: e.to_string(),
        })
}

pub(crate) fn truncate_for_error(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}
