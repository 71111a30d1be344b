//! Operator-facing alerts, kept apart from subscriber safety alerts
//!
//! Raised when an alert could not reach someone (delivery exhausted or
//! permanently rejected) or when a window could not be decided in time.
//! Sinks are the extension point for escalation such as a fallback channel.

use crate::fusion_core::types::AlertLevel;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorAlertKind {
    DeliveryFailed,
    WindowExpired,
    DecisionFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperatorAlert {
    pub kind: OperatorAlertKind,
    pub event_id: String,
    pub decision_id: Option<String>,
    pub subscriber_id: Option<String>,
    pub alert_level: Option<AlertLevel>,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl OperatorAlert {
    pub fn is_urgent(&self) -> bool {
        self.alert_level == Some(AlertLevel::Urgent)
    }
}

#[async_trait]
pub trait OperatorAlertSink: Send + Sync {
    async fn raise(&self, alert: OperatorAlert);
}

/// Writes operator alerts to the log
#[derive(Debug, Default)]
pub struct LogOperatorSink;

#[async_trait]
impl OperatorAlertSink for LogOperatorSink {
    async fn raise(&self, alert: OperatorAlert) {
        let json = serde_json::to_string(&alert).unwrap_or_else(|_| alert.message.clone());
        if alert.is_urgent() || alert.kind != OperatorAlertKind::DeliveryFailed {
            log::error!("🚨 OPERATOR ALERT: {}", json);
        } else {
            log::warn!("⚠️  Operator alert: {}", json);
        }
    }
}

/// Forwards operator alerts to a channel (tests, external escalation tasks)
pub struct ChannelOperatorSink {
    tx: mpsc::UnboundedSender<OperatorAlert>,
}

impl ChannelOperatorSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OperatorAlert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl OperatorAlertSink for ChannelOperatorSink {
    async fn raise(&self, alert: OperatorAlert) {
        if self.tx.send(alert).is_err() {
            log::warn!("⚠️  Operator alert receiver dropped");
        }
    }
}
