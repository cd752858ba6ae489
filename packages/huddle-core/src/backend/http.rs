//! reqwest implementation of the backend contract.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{CallBackend, CallRecord, MessageBackend, MessagePage, MessageRecord};
use crate::calls::{CallKind, ConnectionHealth, SignalPayload};
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::messaging::MessageKind;

/// HTTP client for the chat backend
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateMessageRequest<'a> {
    content: &'a str,
    #[serde(rename = "type")]
    kind: MessageKind,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InitiateCallRequest<'a> {
    conversation_id: &'a str,
    #[serde(rename = "type")]
    kind: CallKind,
}

#[derive(Serialize)]
struct StatusRequest {
    status: ConnectionHealth,
}

#[derive(Serialize)]
struct SignalRequest<'a> {
    to: &'a str,
    signal: &'a SignalPayload,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let base_url = config.api_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(Error::Internal("backend URL cannot be empty".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            api_token: config.api_token.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(resp: reqwest::Response, action: &str) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        tracing::debug!(action, status = status.as_u16(), "Backend request failed");
        Err(Error::Http {
            status: status.as_u16(),
            message: if body.is_empty() {
                format!("{action} failed")
            } else {
                format!("{action} failed: {body}")
            },
        })
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response, action: &str) -> Result<T> {
        let resp = Self::check(resp, action).await?;
        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl MessageBackend for HttpBackend {
    async fn fetch_messages(
        &self,
        conversation_id: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<MessagePage> {
        let mut url = self.url(&format!(
            "/conversations/{}/messages?limit={}",
            urlencoding::encode(conversation_id),
            limit
        ));
        if let Some(cursor) = cursor {
            url.push_str("&cursor=");
            url.push_str(&urlencoding::encode(cursor));
        }
        let resp = self.request(self.client.get(url)).send().await?;
        Self::decode(resp, "fetch messages").await
    }

    async fn create_message(
        &self,
        conversation_id: &str,
        content: &str,
        kind: MessageKind,
    ) -> Result<MessageRecord> {
        let url = self.url(&format!(
            "/conversations/{}/messages",
            urlencoding::encode(conversation_id)
        ));
        let resp = self
            .request(self.client.post(url))
            .json(&CreateMessageRequest { content, kind })
            .send()
            .await?;
        Self::decode(resp, "create message").await
    }

    async fn mark_message_read(&self, conversation_id: &str, message_id: &str) -> Result<()> {
        let url = self.url(&format!(
            "/conversations/{}/messages/{}/read",
            urlencoding::encode(conversation_id),
            urlencoding::encode(message_id)
        ));
        let resp = self.request(self.client.put(url)).send().await?;
        Self::check(resp, "mark read").await?;
        Ok(())
    }
}

#[async_trait]
impl CallBackend for HttpBackend {
    async fn initiate_call(&self, conversation_id: &str, kind: CallKind) -> Result<CallRecord> {
        let resp = self
            .request(self.client.post(self.url("/calls")))
            .json(&InitiateCallRequest {
                conversation_id,
                kind,
            })
            .send()
            .await?;
        Self::decode(resp, "initiate call").await
    }

    async fn end_call(&self, room_id: &str) -> Result<()> {
        let url = self.url(&format!("/calls/{}/end", urlencoding::encode(room_id)));
        let resp = self.request(self.client.post(url)).send().await?;
        Self::check(resp, "end call").await?;
        Ok(())
    }

    async fn update_connection_status(
        &self,
        room_id: &str,
        status: ConnectionHealth,
    ) -> Result<()> {
        let url = self.url(&format!("/calls/{}/status", urlencoding::encode(room_id)));
        let resp = self
            .request(self.client.put(url))
            .json(&StatusRequest { status })
            .send()
            .await?;
        Self::check(resp, "update call status").await?;
        Ok(())
    }

    async fn send_signal(
        &self,
        room_id: &str,
        to_user_id: &str,
        payload: &SignalPayload,
    ) -> Result<()> {
        let url = self.url(&format!("/calls/{}/signal", urlencoding::encode(room_id)));
        let resp = self
            .request(self.client.post(url))
            .json(&SignalRequest {
                to: to_user_id,
                signal: payload,
            })
            .send()
            .await?;
        Self::check(resp, "send signal").await?;
        Ok(())
    }

    async fn start_screen_share(&self, room_id: &str) -> Result<()> {
        let url = self.url(&format!(
            "/calls/{}/screen-share/start",
            urlencoding::encode(room_id)
        ));
        let resp = self.request(self.client.post(url)).send().await?;
        Self::check(resp, "start screen share").await?;
        Ok(())
    }

    async fn end_screen_share(&self, room_id: &str) -> Result<()> {
        let url = self.url(&format!(
            "/calls/{}/screen-share/end",
            urlencoding::encode(room_id)
        ));
        let resp = self.request(self.client.post(url)).send().await?;
        Self::check(resp, "end screen share").await?;
        Ok(())
    }
}
