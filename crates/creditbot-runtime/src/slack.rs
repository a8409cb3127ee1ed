//! Slack Web API adapter: channel history as the message source, thread
//! replies and operator DMs as the reply sink.

use async_trait::async_trait;
use creditbot_contracts::ChatMessage;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::collaborators::{
    decode_json, http_client, send, CollaboratorError, MessageSource, ReplySink,
};

#[derive(Debug, Deserialize)]
struct SlackAuthTestResponse {
    ok: bool,
    user_id: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SlackHistoryResponse {
    ok: bool,
    #[serde(default)]
    messages: Vec<SlackMessage>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SlackMessage {
    ts: String,
    #[serde(default)]
    text: String,
    user: Option<String>,
    bot_id: Option<String>,
    subtype: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SlackChatMessageResponse {
    ok: bool,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SlackOpenConversationResponse {
    ok: bool,
    channel: Option<SlackChannel>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SlackChannel {
    id: String,
}

#[derive(Clone)]
pub struct SlackClient {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
    channel_id: String,
}

impl SlackClient {
    pub fn new(
        api_base: &str,
        bot_token: &str,
        channel_id: &str,
        timeout_ms: u64,
    ) -> Result<Self, CollaboratorError> {
        Ok(Self {
            http: http_client(timeout_ms, "creditbot-slack")?,
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token: bot_token.trim().to_string(),
            channel_id: channel_id.to_string(),
        })
    }

    pub async fn resolve_bot_user_id(&self) -> Result<String, CollaboratorError> {
        let response: SlackAuthTestResponse = self
            .call(
                "auth.test",
                self.http
                    .post(format!("{}/auth.test", self.api_base))
                    .bearer_auth(&self.bot_token),
            )
            .await?;
        ensure_ok("auth.test", response.ok, response.error)?;
        response
            .user_id
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| CollaboratorError::api("auth.test", "response did not include user_id"))
    }

    async fn post_message(
        &self,
        channel: &str,
        text: &str,
        thread_ts: Option<&str>,
    ) -> Result<(), CollaboratorError> {
        let mut payload = json!({
            "channel": channel,
            "text": text,
            "unfurl_links": false,
            "unfurl_media": false,
        });
        if let Some(thread_ts) = thread_ts {
            payload["thread_ts"] = Value::String(thread_ts.to_string());
        }
        let response: SlackChatMessageResponse = self
            .call(
                "chat.postMessage",
                self.http
                    .post(format!("{}/chat.postMessage", self.api_base))
                    .bearer_auth(&self.bot_token)
                    .json(&payload),
            )
            .await?;
        ensure_ok("chat.postMessage", response.ok, response.error)
    }

    async fn open_direct_channel(&self, user_id: &str) -> Result<String, CollaboratorError> {
        let response: SlackOpenConversationResponse = self
            .call(
                "conversations.open",
                self.http
                    .post(format!("{}/conversations.open", self.api_base))
                    .bearer_auth(&self.bot_token)
                    .json(&json!({ "users": user_id })),
            )
            .await?;
        ensure_ok("conversations.open", response.ok, response.error)?;
        response.channel.map(|c| c.id).ok_or_else(|| {
            CollaboratorError::api("conversations.open", "response did not include a channel")
        })
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        operation: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<T, CollaboratorError> {
        let response = send(operation, request).await?;
        decode_json(operation, response).await
    }
}

#[async_trait]
impl MessageSource for SlackClient {
    async fn fetch_recent(&self, limit: usize) -> Result<Vec<ChatMessage>, CollaboratorError> {
        let response: SlackHistoryResponse = self
            .call(
                "conversations.history",
                self.http
                    .get(format!("{}/conversations.history", self.api_base))
                    .bearer_auth(&self.bot_token)
                    .query(&[
                        ("channel", self.channel_id.clone()),
                        ("limit", limit.to_string()),
                    ]),
            )
            .await?;
        ensure_ok("conversations.history", response.ok, response.error)?;

        // Slack returns newest first.
        let mut messages: Vec<ChatMessage> = response
            .messages
            .into_iter()
            .map(|m| ChatMessage {
                is_bot: m.bot_id.is_some() || m.subtype.as_deref() == Some("bot_message"),
                id: m.ts,
                text: m.text,
                author_id: m.user,
            })
            .collect();
        messages.reverse();
        debug!(channel = %self.channel_id, count = messages.len(), "fetched slack history");
        Ok(messages)
    }
}

#[async_trait]
impl ReplySink for SlackClient {
    async fn post_reply(&self, thread_id: &str, text: &str) -> Result<(), CollaboratorError> {
        self.post_message(&self.channel_id, text, Some(thread_id))
            .await
    }

    async fn send_direct(&self, operator_id: &str, text: &str) -> Result<(), CollaboratorError> {
        let channel = self.open_direct_channel(operator_id).await?;
        self.post_message(&channel, text, None).await
    }
}

fn ensure_ok(operation: &str, ok: bool, error: Option<String>) -> Result<(), CollaboratorError> {
    if ok {
        return Ok(());
    }
    Err(CollaboratorError::api(
        operation,
        error.unwrap_or_else(|| "unknown error".to_string()),
    ))
}
