use async_trait::async_trait;
use creditbot_contracts::ComputeResult;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::collaborators::{decode_json, http_client, send, CollaboratorError, ComputeEngine};

#[derive(Debug, Deserialize)]
struct ComputeResponse {
    amount: Option<f64>,
    #[serde(default)]
    trace: Value,
    error: Option<String>,
}

/// Compute engine reached over HTTP: `POST {endpoint}` with `{"query": ...}`.
pub struct HttpComputeEngine {
    http: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpComputeEngine {
    pub fn new(
        endpoint: &str,
        token: Option<String>,
        timeout_ms: u64,
    ) -> Result<Self, CollaboratorError> {
        Ok(Self {
            http: http_client(timeout_ms, "creditbot-compute")?,
            endpoint: endpoint.to_string(),
            token,
        })
    }
}

#[async_trait]
impl ComputeEngine for HttpComputeEngine {
    async fn compute(&self, query: &str) -> Result<ComputeResult, CollaboratorError> {
        let mut request = self
            .http
            .post(&self.endpoint)
            .json(&json!({ "query": query }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let body: ComputeResponse = decode_json("compute", send("compute", request).await?).await?;
        if let Some(error) = body.error.filter(|e| !e.is_empty()) {
            return Err(CollaboratorError::api("compute", error));
        }
        let amount = body
            .amount
            .ok_or_else(|| CollaboratorError::api("compute", "response did not include an amount"))?;
        Ok(ComputeResult {
            amount,
            trace: body.trace,
        })
    }
}
