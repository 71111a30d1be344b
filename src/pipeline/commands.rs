//! Command surface for the chat front end
//!
//! The front end parses its own commands and calls these operations; every
//! reply is HTML-formatted text ready for `ChatBotTransport::send_text`.

use crate::dispatch::{Channel, SubscriberRegistry};
use crate::fusion_core::context::{format_context, ContextRetriever};
use crate::fusion_core::error::StoreError;
use crate::fusion_core::types::{system_clock, Clock};
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub const SUBSCRIBED_REPLY: &str = "✅ You are now subscribed to alerts!";
pub const UNSUBSCRIBED_REPLY: &str = "❌ You have been unsubscribed.";
pub const STATUS_SUBSCRIBED_REPLY: &str = "📢 You are currently subscribed.";
pub const STATUS_NOT_SUBSCRIBED_REPLY: &str = "🔕 You are not subscribed.";

pub const WELCOME_MESSAGE: &str = "👋 Welcome to <b>LifeWatch</b>!\n\n\
Start by tapping on the bottom left menu and choosing <b>/subscribe</b> \
to receive real-time fall alerts.\n\n\
You can also chat with me naturally, for example:\n\
• <i>How many falls happened today?</i>\n\
• <i>Show me recent alerts</i>\n\n\
I can help you with:\n\
• Counting fall incidents in a specific time period\n\
• Summarizing recent fall events\n\
• Identifying patterns in fall incidents\n\
• Explaining serious fall events (alert level ≥ 2)\n\n\
Let's keep your loved ones safe ❤️";

pub struct CommandSurface {
    registry: Arc<dyn SubscriberRegistry>,
    context: Arc<dyn ContextRetriever>,
    channel: Channel,
    recent_limit: usize,
    now_fn: Clock,
}

impl CommandSurface {
    /// Subscribers created through this surface use `channel`
    pub fn new(registry: Arc<dyn SubscriberRegistry>, context: Arc<dyn ContextRetriever>, channel: Channel) -> Self {
        Self {
            registry,
            context,
            channel,
            recent_limit: 10,
            now_fn: system_clock(),
        }
    }

    pub fn with_clock(mut self, now_fn: Clock) -> Self {
        self.now_fn = now_fn;
        self
    }

    pub fn with_recent_limit(mut self, recent_limit: usize) -> Self {
        self.recent_limit = recent_limit;
        self
    }

    pub async fn subscribe(&self, subscriber_id: &str) -> Result<String, StoreError> {
        self.registry
            .subscribe(subscriber_id, self.channel, (self.now_fn)())
            .await?;
        log::info!("➕ Subscriber {} ({}) active", subscriber_id, self.channel);
        Ok(SUBSCRIBED_REPLY.to_string())
    }

    /// Unsubscribing an unknown id is not an error for the caller
    pub async fn unsubscribe(&self, subscriber_id: &str) -> Result<String, StoreError> {
        match self.registry.unsubscribe(subscriber_id, (self.now_fn)()).await {
            Ok(_) => log::info!("➖ Subscriber {} deactivated", subscriber_id),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        Ok(UNSUBSCRIBED_REPLY.to_string())
    }

    pub async fn status(&self, subscriber_id: &str) -> Result<String, StoreError> {
        let subscribed = match self.registry.status(subscriber_id).await {
            Ok(subscriber) => subscriber.active,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e),
        };
        Ok(if subscribed {
            STATUS_SUBSCRIBED_REPLY.to_string()
        } else {
            STATUS_NOT_SUBSCRIBED_REPLY.to_string()
        })
    }

    /// Digest of decisions taken in `[from, to]`, newest first
    pub async fn query_recent_decisions(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<String, StoreError> {
        let decisions = self.context.query_decisions(from, to, self.recent_limit).await?;
        Ok(format_context(&decisions))
    }

    pub fn welcome(&self) -> &'static str {
        WELCOME_MESSAGE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use crate::dispatch::SqliteSubscriberRegistry;
    use crate::fusion_core::db::Database;
    use crate::fusion_core::decision::DecisionEngine;
    use crate::fusion_core::fusion::FusionEngine;
    use crate::fusion_core::signal_store::{SignalStore, SqliteSignalStore};
    use crate::fusion_core::types::{parse_modality_set, Modality, ModalityFinding};
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 12, hour, 0, 0).unwrap()
    }

    fn build_surface(db: Database, now: DateTime<Utc>) -> (CommandSurface, Arc<SqliteSignalStore>) {
        let store = Arc::new(SqliteSignalStore::new(
            db.clone(),
            parse_modality_set("video").unwrap(),
            Duration::seconds(45),
        ));
        let registry = Arc::new(SqliteSubscriberRegistry::new(db));
        let surface = CommandSurface::new(registry, store.clone(), Channel::ChatBot)
            .with_clock(Arc::new(move || now));
        (surface, store)
    }

    #[tokio::test]
    async fn test_subscription_round_trip() {
        let (surface, _) = build_surface(Database::open_in_memory().unwrap(), at(9));

        assert_eq!(surface.status("42").await.unwrap(), STATUS_NOT_SUBSCRIBED_REPLY);
        assert_eq!(surface.subscribe("42").await.unwrap(), SUBSCRIBED_REPLY);
        assert_eq!(surface.status("42").await.unwrap(), STATUS_SUBSCRIBED_REPLY);
        assert_eq!(surface.unsubscribe("42").await.unwrap(), UNSUBSCRIBED_REPLY);
        assert_eq!(surface.status("42").await.unwrap(), STATUS_NOT_SUBSCRIBED_REPLY);
        assert_eq!(surface.unsubscribe("never-seen").await.unwrap(), UNSUBSCRIBED_REPLY);
    }

    #[test]
    fn test_welcome_text() {
        let (surface, _) = build_surface(Database::open_in_memory().unwrap(), at(9));
        assert!(surface.welcome().contains("<b>LifeWatch</b>"));
        assert!(surface.welcome().contains("<b>/subscribe</b>"));
    }

    #[tokio::test]
    async fn test_recent_decisions_digest() {
        let db = Database::open_in_memory().unwrap();
        let (surface, store) = build_surface(db, at(12));

        assert_eq!(
            surface.query_recent_decisions(at(0), at(12)).await.unwrap(),
            "No previous events found."
        );

        // Single expected modality: the first finding completes the window
        let finding = ModalityFinding::new(Modality::Video, "evt-1", at(10)).with_indicator("fall_posture", 0.7);
        store.put_finding("evt-1", finding, at(10)).await.unwrap();
        let engine = DecisionEngine::with_defaults();
        let snapshot = store.get_window("evt-1").await.unwrap();
        let fused = FusionEngine::new().fuse(&snapshot.window, &snapshot.findings);
        store.record_decision(engine.decide(&fused, &[], at(10))).await.unwrap();

        let digest = surface.query_recent_decisions(at(0), at(12)).await.unwrap();
        assert!(digest.starts_with("Previous events:\n1. Time: 20251012-100000\n"));
        assert!(digest.contains("Alert Level: 1"));
        assert!(digest.contains("Reason: single_indicator"));

        let empty = surface.query_recent_decisions(at(11), at(12)).await.unwrap();
        assert_eq!(empty, "No previous events found.");
    }
}
