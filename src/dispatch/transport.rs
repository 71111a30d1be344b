//! Outbound channel transports
//!
//! Each transport delivers one decision to one subscriber. Failures are split
//! into transient (retry with backoff) and permanent (invalid or revoked
//! endpoint, never retried).

use super::messages;
use super::subscribers::{Channel, Subscriber};
use crate::fusion_core::types::Decision;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Transient(String),
    Permanent(String),
}

impl TransportError {
    /// 400/401/403/404/410 mean the endpoint is wrong or revoked
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = format!("HTTP {}: {}", status.as_u16(), body.chars().take(200).collect::<String>());
        match status.as_u16() {
            400 | 401 | 403 | 404 | 410 => TransportError::Permanent(message),
            _ => TransportError::Transient(message),
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, TransportError::Permanent(_))
    }

    pub fn message(&self) -> &str {
        match self {
            TransportError::Transient(m) | TransportError::Permanent(m) => m,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        // Chat bot URLs embed the bot token
        let err = err.without_url();
        if err.is_builder() {
            TransportError::Permanent(format!("Invalid request: {}", err))
        } else {
            TransportError::Transient(format!("Request failed: {}", err))
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Transient(e) => write!(f, "Transient transport error: {}", e),
            TransportError::Permanent(e) => write!(f, "Permanent transport error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

#[async_trait]
pub trait Transport: Send + Sync {
    fn channel(&self) -> Channel;

    async fn send(&self, subscriber: &Subscriber, decision: &Decision) -> Result<(), TransportError>;
}

/// Transports keyed by channel
#[derive(Clone, Default)]
pub struct TransportSet {
    transports: HashMap<Channel, Arc<dyn Transport>>,
}

impl TransportSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, transport: Arc<dyn Transport>) -> Self {
        self.insert(transport);
        self
    }

    pub fn insert(&mut self, transport: Arc<dyn Transport>) {
        self.transports.insert(transport.channel(), transport);
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn Transport>> {
        self.transports.get(&channel).cloned()
    }

    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.transports.keys().copied().collect();
        channels.sort();
        channels
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}

fn http_client() -> Result<reqwest::Client, TransportError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| TransportError::Permanent(format!("HTTP client: {}", e)))
}

async fn post_json<T: Serialize + ?Sized>(
    client: &reqwest::Client,
    url: &str,
    payload: &T,
) -> Result<(), TransportError> {
    let response = client.post(url).json(payload).send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::from_status(status, &body))
}

#[derive(Debug, Serialize)]
struct PushPayload<'a> {
    subscriber_id: &'a str,
    subject: &'a str,
    body: String,
    alert_level: u8,
    decision_id: &'a str,
    event_id: &'a str,
}

/// Push notifications through a generic JSON webhook
pub struct PushWebhookTransport {
    client: reqwest::Client,
    url: String,
}

impl PushWebhookTransport {
    pub fn new(url: impl Into<String>) -> Result<Self, TransportError> {
        Ok(Self {
            client: http_client()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Transport for PushWebhookTransport {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    async fn send(&self, subscriber: &Subscriber, decision: &Decision) -> Result<(), TransportError> {
        let payload = PushPayload {
            subscriber_id: &subscriber.subscriber_id,
            subject: messages::subject(decision),
            body: messages::push_body(decision),
            alert_level: decision.alert_level.as_u8(),
            decision_id: &decision.decision_id,
            event_id: &decision.event_id,
        };
        post_json(&self.client, &self.url, &payload).await
    }
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: String,
    parse_mode: &'a str,
}

/// Telegram-style bot API; the subscriber id is the chat id
pub struct ChatBotTransport {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

impl ChatBotTransport {
    pub fn new(api_base: impl Into<String>, token: impl Into<String>) -> Result<Self, TransportError> {
        Ok(Self {
            client: http_client()?,
            api_base: api_base.into(),
            token: token.into(),
        })
    }

    pub fn send_message_url(&self) -> String {
        format!("{}/bot{}/sendMessage", self.api_base.trim_end_matches('/'), self.token)
    }

    /// Plain reply used by the command surface
    pub async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), TransportError> {
        let payload = SendMessage {
            chat_id,
            text: text.to_string(),
            parse_mode: "HTML",
        };
        post_json(&self.client, &self.send_message_url(), &payload).await
    }
}

#[async_trait]
impl Transport for ChatBotTransport {
    fn channel(&self) -> Channel {
        Channel::ChatBot
    }

    async fn send(&self, subscriber: &Subscriber, decision: &Decision) -> Result<(), TransportError> {
        self.send_text(&subscriber.subscriber_id, &messages::chat_html(decision))
            .await
    }
}

#[derive(Debug, Serialize)]
struct VoicePayload<'a> {
    subscriber_id: &'a str,
    text: &'a str,
    voice_id: &'a str,
    alert_level: u8,
    decision_id: &'a str,
}

/// Speech synthesis and call-out through a JSON webhook
pub struct VoiceTransport {
    client: reqwest::Client,
    url: String,
    voice_id: String,
}

impl VoiceTransport {
    pub fn new(url: impl Into<String>) -> Result<Self, TransportError> {
        Ok(Self {
            client: http_client()?,
            url: url.into(),
            voice_id: "Joanna".to_string(),
        })
    }

    pub fn with_voice(mut self, voice_id: impl Into<String>) -> Self {
        self.voice_id = voice_id.into();
        self
    }
}

#[async_trait]
impl Transport for VoiceTransport {
    fn channel(&self) -> Channel {
        Channel::Voice
    }

    async fn send(&self, subscriber: &Subscriber, decision: &Decision) -> Result<(), TransportError> {
        let payload = VoicePayload {
            subscriber_id: &subscriber.subscriber_id,
            text: messages::speech_text(decision),
            voice_id: &self.voice_id,
            alert_level: decision.alert_level.as_u8(),
            decision_id: &decision.decision_id,
        };
        post_json(&self.client, &self.url, &payload).await
    }
}
