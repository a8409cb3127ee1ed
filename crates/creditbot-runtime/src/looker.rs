use async_trait::async_trait;
use creditbot_contracts::ReportReference;
use creditbot_kernel::extract_look_id;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::collaborators::{decode_json, http_client, send, CollaboratorError, ReportResolver};

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LookResponse {
    query_id: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    sql: Option<String>,
}

/// Resolves Look links to their SQL through the Looker 4.0 API.
pub struct LookerClient {
    http: reqwest::Client,
    api_url: String,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<String>>,
}

impl LookerClient {
    pub fn new(
        base_url: &str,
        client_id: &str,
        client_secret: &str,
        timeout_ms: u64,
    ) -> Result<Self, CollaboratorError> {
        Ok(Self {
            http: http_client(timeout_ms, "creditbot-looker")?,
            api_url: format!("{}/api/4.0", base_url.trim_end_matches('/')),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            token: Mutex::new(None),
        })
    }

    async fn login(&self) -> Result<String, CollaboratorError> {
        let request = self.http.post(format!("{}/login", self.api_url)).form(&[
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ]);
        let response = send("looker login", request)
            .await
            .map_err(|e| CollaboratorError::Auth(e.to_string()))?;
        let body: LoginResponse = decode_json("looker login", response).await?;
        let token = body
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| CollaboratorError::Auth("login response had no access_token".to_string()))?;
        info!("authenticated with looker");
        Ok(token)
    }

    async fn access_token(&self) -> Result<String, CollaboratorError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }
        let token = self.login().await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    // Authenticated GET; a 401 drops the cached token and retries once.
    async fn get(&self, operation: &str, path: &str) -> Result<reqwest::Response, CollaboratorError> {
        let url = format!("{}{path}", self.api_url);
        let token = self.access_token().await?;
        match send(operation, self.http.get(&url).bearer_auth(&token)).await {
            Err(err) if err.status() == Some(401) => {
                debug!(operation, "looker token rejected; re-authenticating");
                *self.token.lock().await = None;
                let token = self.access_token().await?;
                send(operation, self.http.get(&url).bearer_auth(&token)).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl ReportResolver for LookerClient {
    async fn resolve_query(&self, reference: &ReportReference) -> Result<String, CollaboratorError> {
        let look_id = extract_look_id(reference).map_err(CollaboratorError::InvalidReference)?;

        let look: LookResponse =
            decode_json("looker look", self.get("looker look", &format!("/looks/{look_id}")).await?)
                .await?;
        let query_id = match look.query_id {
            Some(Value::String(id)) if !id.is_empty() => id,
            Some(Value::Number(id)) => id.to_string(),
            _ => {
                return Err(CollaboratorError::api(
                    "looker look",
                    format!("look {look_id} has no query_id"),
                ))
            }
        };

        let query: QueryResponse = decode_json(
            "looker query",
            self.get("looker query", &format!("/queries/{query_id}")).await?,
        )
        .await?;
        if let Some(sql) = query.sql.filter(|s| !s.trim().is_empty()) {
            return Ok(sql);
        }

        let response = self
            .get("looker query sql", &format!("/queries/{query_id}/run/sql"))
            .await?;
        response.text().await.map_err(|e| CollaboratorError::Decode {
            operation: "looker query sql".to_string(),
            message: e.to_string(),
        })
    }
}
