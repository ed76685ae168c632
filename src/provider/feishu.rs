//! Feishu Open API client implementing the `Provider` contract.
//!
//! Feishu requires webhook handlers to return within 3 seconds, so the
//! webhook layer parses events with `parse_message_event` and hands them to
//! the coordinator in a background task; all API calls here are plain
//! tenant-token REST requests.

use crate::error::{GatewayError, Result};
use crate::provider::{
    FetchedMessage, OutboundMessage, Provider, ReactionInfo, SentMessage,
};
use crate::{ChatType, InboundEvent, Mention};

use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Feishu error code for a missing app permission.
pub const PERMISSION_DENIED_CODE: i64 = 99991672;

/// Tenant tokens live ~2h; refresh with margin.
const TOKEN_TTL: Duration = Duration::from_secs(90 * 60);

/// Feishu Open API client for one app (one gateway account).
#[derive(Clone)]
pub struct FeishuClient {
    http: reqwest::Client,
    base_url: String,
    app_id: String,
    app_secret: String,
    token: Arc<RwLock<Option<CachedToken>>>,
}

struct CachedToken {
    value: String,
    fetched_at: Instant,
}

impl FeishuClient {
    pub fn new(base_url: impl Into<String>, app_id: impl Into<String>, app_secret: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            token: Arc::new(RwLock::new(None)),
        }
    }

    /// Fetch or reuse the cached tenant access token.
    async fn tenant_token(&self) -> Result<String> {
        {
            let cached = self.token.read().await;
            if let Some(token) = cached.as_ref()
                && token.fetched_at.elapsed() < TOKEN_TTL
            {
                return Ok(token.value.clone());
            }
        }

        let url = format!(
            "{}/open-apis/auth/v3/tenant_access_token/internal",
            self.base_url
        );
        let response: serde_json::Value = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "app_id": self.app_id,
                "app_secret": self.app_secret,
            }))
            .send()
            .await
            .context("tenant token request failed")?
            .json()
            .await
            .context("tenant token response was not json")?;

        let value = response["tenant_access_token"]
            .as_str()
            .ok_or_else(|| GatewayError::Provider(format!("no tenant_access_token in: {response}")))?
            .to_string();

        let mut cached = self.token.write().await;
        *cached = Some(CachedToken {
            value: value.clone(),
            fetched_at: Instant::now(),
        });
        Ok(value)
    }

    async fn call(&self, request: reqwest::RequestBuilder) -> Result<serde_json::Value> {
        let token = self.tenant_token().await?;
        let response = request
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|error| GatewayError::Provider(format!("transport: {error}")))?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|error| GatewayError::Provider(format!("non-json response: {error}")))?;

        let code = body["code"].as_i64().unwrap_or(0);
        if code == 0 {
            return Ok(body);
        }

        let message = body["msg"].as_str().unwrap_or("unknown error").to_string();
        if code == PERMISSION_DENIED_CODE {
            return Err(GatewayError::PermissionDenied {
                code,
                grant_url: extract_grant_url(&message),
                message,
            });
        }
        Err(GatewayError::Provider(format!("code {code}: {message}")))
    }
}

/// Pull the permission-grant URL Feishu embeds in permission error messages.
fn extract_grant_url(message: &str) -> Option<String> {
    let start = message.find("https://")?;
    let tail = &message[start..];
    let end = tail
        .find(|c: char| c.is_whitespace() || c == ',' || c == ')' || c == ']')
        .unwrap_or(tail.len());
    Some(tail[..end].to_string())
}

#[async_trait]
impl Provider for FeishuClient {
    async fn add_reaction(&self, message_id: &str, emoji_type: &str) -> Result<String> {
        let url = format!(
            "{}/open-apis/im/v1/messages/{message_id}/reactions",
            self.base_url
        );
        let body = self
            .call(self.http.post(&url).json(&serde_json::json!({
                "reaction_type": { "emoji_type": emoji_type }
            })))
            .await?;
        body["data"]["reaction_id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| GatewayError::Provider("add_reaction returned no reaction_id".into()))
    }

    async fn remove_reaction(&self, message_id: &str, reaction_id: &str) -> Result<()> {
        let url = format!(
            "{}/open-apis/im/v1/messages/{message_id}/reactions/{reaction_id}",
            self.base_url
        );
        self.call(self.http.delete(&url)).await?;
        Ok(())
    }

    async fn list_reactions(
        &self,
        message_id: &str,
        emoji_type: &str,
    ) -> Result<Vec<ReactionInfo>> {
        let url = format!(
            "{}/open-apis/im/v1/messages/{message_id}/reactions",
            self.base_url
        );
        let body = self
            .call(self.http.get(&url).query(&[("reaction_type", emoji_type)]))
            .await?;

        let items = body["data"]["items"].as_array().cloned().unwrap_or_default();
        Ok(items
            .iter()
            .map(|item| ReactionInfo {
                reaction_id: item["reaction_id"].as_str().unwrap_or_default().to_string(),
                operator_type: item["operator"]["operator_type"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
            })
            .collect())
    }

    async fn send_message(&self, message: &OutboundMessage) -> Result<SentMessage> {
        let content = serde_json::json!({ "text": message.text }).to_string();

        let body = if let Some(reply_to) = &message.reply_to_message_id {
            let url = format!("{}/open-apis/im/v1/messages/{reply_to}/reply", self.base_url);
            self.call(self.http.post(&url).json(&serde_json::json!({
                "msg_type": "text",
                "content": content,
            })))
            .await?
        } else {
            let url = format!(
                "{}/open-apis/im/v1/messages?receive_id_type=chat_id",
                self.base_url
            );
            self.call(self.http.post(&url).json(&serde_json::json!({
                "receive_id": message.to,
                "msg_type": "text",
                "content": content,
            })))
            .await?
        };

        Ok(SentMessage {
            message_id: body["data"]["message_id"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            chat_id: body["data"]["chat_id"]
                .as_str()
                .unwrap_or(&message.to)
                .to_string(),
        })
    }

    async fn fetch_message(&self, message_id: &str) -> Result<Option<FetchedMessage>> {
        let url = format!("{}/open-apis/im/v1/messages/{message_id}", self.base_url);
        let body = match self.call(self.http.get(&url)).await {
            Ok(body) => body,
            Err(GatewayError::Provider(_)) => return Ok(None),
            Err(error) => return Err(error),
        };

        let Some(item) = body["data"]["items"].as_array().and_then(|items| items.first())
        else {
            return Ok(None);
        };

        let text = item["body"]["content"]
            .as_str()
            .and_then(|raw| serde_json::from_str::<TextContent>(raw).ok())
            .and_then(|content| content.text);

        Ok(Some(FetchedMessage {
            text,
            sender_open_id: item["sender"]["id"].as_str().map(String::from),
        }))
    }
}

/// The JSON body of a `text` message's `content` field.
#[derive(Debug, Deserialize)]
struct TextContent {
    text: Option<String>,
}

/// Webhook event payload, v2.0 schema.
#[derive(Debug, Deserialize)]
pub struct EventPayload {
    pub challenge: Option<String>,
    #[serde(rename = "type")]
    pub type_: Option<String>,
    pub header: Option<EventHeader>,
    pub event: Option<EventBody>,
}

#[derive(Debug, Deserialize)]
pub struct EventHeader {
    pub event_id: Option<String>,
    pub event_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventBody {
    pub sender: Option<EventSender>,
    pub message: Option<EventMessage>,
}

#[derive(Debug, Deserialize)]
pub struct EventSender {
    pub sender_id: Option<SenderId>,
}

#[derive(Debug, Deserialize)]
pub struct SenderId {
    pub open_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventMessage {
    pub message_id: Option<String>,
    pub chat_id: Option<String>,
    pub chat_type: Option<String>,
    pub create_time: Option<String>,
    pub message_type: Option<String>,
    pub content: Option<String>,
    pub root_id: Option<String>,
    pub parent_id: Option<String>,
    #[serde(default)]
    pub mentions: Vec<EventMention>,
}

#[derive(Debug, Deserialize)]
pub struct EventMention {
    pub key: Option<String>,
    pub id: Option<MentionId>,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MentionId {
    pub open_id: Option<String>,
}

/// Parse an `im.message.receive_v1` webhook payload into the canonical
/// inbound event. Returns `None` for non-message events, non-text messages,
/// and payloads missing required fields.
pub fn parse_message_event(payload: &EventPayload) -> Option<InboundEvent> {
    let event_type = payload.header.as_ref()?.event_type.as_deref()?;
    if event_type != "im.message.receive_v1" {
        return None;
    }
    let event = payload.event.as_ref()?;
    let message = event.message.as_ref()?;

    if message.message_type.as_deref() != Some("text") {
        return None;
    }

    let content = message
        .content
        .as_deref()
        .and_then(|raw| serde_json::from_str::<TextContent>(raw).ok())
        .and_then(|content| content.text)
        .unwrap_or_default();

    let chat_type = match message.chat_type.as_deref() {
        Some("group") => ChatType::Group,
        _ => ChatType::Direct,
    };

    Some(InboundEvent {
        chat_id: message.chat_id.clone()?,
        message_id: message.message_id.clone()?,
        sender_open_id: event
            .sender
            .as_ref()
            .and_then(|sender| sender.sender_id.as_ref())
            .and_then(|id| id.open_id.clone())
            .unwrap_or_default(),
        sender_name: None,
        chat_type,
        create_time_ms: message
            .create_time
            .as_deref()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_else(crate::now_ms),
        content,
        mentions: message
            .mentions
            .iter()
            .map(|mention| Mention {
                key: mention.key.clone().unwrap_or_default(),
                open_id: mention.id.as_ref().and_then(|id| id.open_id.clone()),
                name: mention.name.clone(),
            })
            .collect(),
        root_id: message.root_id.clone(),
        parent_id: message.parent_id.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_payload(json: serde_json::Value) -> EventPayload {
        serde_json::from_value(json).expect("payload should deserialize")
    }

    #[test]
    fn parses_text_message_event() {
        let payload = message_payload(serde_json::json!({
            "header": { "event_id": "ev_1", "event_type": "im.message.receive_v1" },
            "event": {
                "sender": { "sender_id": { "open_id": "ou_sender" } },
                "message": {
                    "message_id": "om_1",
                    "chat_id": "oc_1",
                    "chat_type": "group",
                    "create_time": "1700000000000",
                    "message_type": "text",
                    "content": "{\"text\":\"@_user_1 hello\"}",
                    "mentions": [
                        { "key": "@_user_1", "id": { "open_id": "ou_bot" }, "name": "bot" }
                    ]
                }
            }
        }));

        let event = parse_message_event(&payload).expect("should parse");
        assert_eq!(event.message_id, "om_1");
        assert_eq!(event.chat_id, "oc_1");
        assert_eq!(event.chat_type, ChatType::Group);
        assert_eq!(event.create_time_ms, 1_700_000_000_000);
        assert_eq!(event.content, "@_user_1 hello");
        assert_eq!(event.mentions.len(), 1);
        assert_eq!(event.mentions[0].open_id.as_deref(), Some("ou_bot"));
    }

    #[test]
    fn ignores_non_text_messages() {
        let payload = message_payload(serde_json::json!({
            "header": { "event_type": "im.message.receive_v1" },
            "event": {
                "message": {
                    "message_id": "om_1",
                    "chat_id": "oc_1",
                    "message_type": "image",
                    "content": "{}"
                }
            }
        }));
        assert!(parse_message_event(&payload).is_none());
    }

    #[test]
    fn ignores_other_event_types() {
        let payload = message_payload(serde_json::json!({
            "header": { "event_type": "im.chat.updated_v1" },
            "event": {}
        }));
        assert!(parse_message_event(&payload).is_none());
    }

    #[test]
    fn extracts_grant_url_from_permission_message() {
        let message =
            "Access denied, please grant at https://open.feishu.cn/app/cli_x/auth, then retry";
        assert_eq!(
            extract_grant_url(message).as_deref(),
            Some("https://open.feishu.cn/app/cli_x/auth")
        );
        assert_eq!(extract_grant_url("no url here"), None);
    }
}
