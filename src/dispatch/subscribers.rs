//! Subscriber registry: notification endpoints and their active flag
//!
//! Rows are never deleted. `unsubscribe` flips `active` off and a later
//! `subscribe` on the same id flips it back on the same row.

use crate::fusion_core::db::Database;
use crate::fusion_core::error::{StoreError, ValidationError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Channel {
    #[serde(rename = "push")]
    Push,
    #[serde(rename = "voice")]
    Voice,
    #[serde(rename = "chat-bot")]
    ChatBot,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Push => "push",
            Channel::Voice => "voice",
            Channel::ChatBot => "chat-bot",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" => Ok(Channel::Push),
            "voice" => Ok(Channel::Voice),
            "chat-bot" | "chatbot" | "chat_bot" => Ok(Channel::ChatBot),
            other => Err(ValidationError::UnknownChannel(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscriber {
    pub subscriber_id: String,
    pub channel: Channel,
    pub active: bool,
    /// ISO-8601
    pub subscribed_at: String,
}

#[async_trait]
pub trait SubscriberRegistry: Send + Sync {
    /// Upsert keyed on `subscriber_id`; always leaves the subscriber active
    async fn subscribe(
        &self,
        subscriber_id: &str,
        channel: Channel,
        now: DateTime<Utc>,
    ) -> Result<Subscriber, StoreError>;

    /// Deactivate; `StoreError::NotFound` for an unknown id
    async fn unsubscribe(&self, subscriber_id: &str, now: DateTime<Utc>) -> Result<Subscriber, StoreError>;

    async fn status(&self, subscriber_id: &str) -> Result<Subscriber, StoreError>;

    async fn list_active(&self, channel: Option<Channel>) -> Result<Vec<Subscriber>, StoreError>;
}

pub struct SqliteSubscriberRegistry {
    db: Database,
}

impl SqliteSubscriberRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

type SubscriberRow = (String, String, bool, String);

fn map_subscriber_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SubscriberRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_subscriber((subscriber_id, channel, active, subscribed_at): SubscriberRow) -> Result<Subscriber, StoreError> {
    Ok(Subscriber {
        subscriber_id,
        channel: channel.parse()?,
        active,
        subscribed_at,
    })
}

fn select_subscriber(conn: &rusqlite::Connection, subscriber_id: &str) -> Result<Subscriber, StoreError> {
    conn.query_row(
        "SELECT subscriber_id, channel, active, subscribed_at FROM subscribers WHERE subscriber_id = ?1",
        [subscriber_id],
        map_subscriber_row,
    )
    .optional()?
    .map(into_subscriber)
    .transpose()?
    .ok_or_else(|| StoreError::NotFound(subscriber_id.to_string()))
}

#[async_trait]
impl SubscriberRegistry for SqliteSubscriberRegistry {
    async fn subscribe(
        &self,
        subscriber_id: &str,
        channel: Channel,
        now: DateTime<Utc>,
    ) -> Result<Subscriber, StoreError> {
        if subscriber_id.trim().is_empty() {
            return Err(StoreError::Validation(ValidationError::Malformed(
                "subscriber_id must not be empty".to_string(),
            )));
        }
        let now = now.to_rfc3339();

        self.db.with_conn(|conn| {
            // subscribed_at is reset on reactivation, kept on a repeated subscribe
            conn.execute(
                "INSERT INTO subscribers (subscriber_id, channel, active, subscribed_at, updated_at)
                 VALUES (?1, ?2, 1, ?3, ?3)
                 ON CONFLICT(subscriber_id) DO UPDATE SET
                    channel = excluded.channel,
                    subscribed_at = CASE WHEN subscribers.active = 1
                                         THEN subscribers.subscribed_at
                                         ELSE excluded.subscribed_at END,
                    active = 1,
                    updated_at = excluded.updated_at",
                params![subscriber_id, channel.as_str(), now],
            )?;
            select_subscriber(conn, subscriber_id)
        })
    }

    async fn unsubscribe(&self, subscriber_id: &str, now: DateTime<Utc>) -> Result<Subscriber, StoreError> {
        let now = now.to_rfc3339();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE subscribers SET active = 0, updated_at = ?2 WHERE subscriber_id = ?1",
                params![subscriber_id, now],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(subscriber_id.to_string()));
            }
            select_subscriber(conn, subscriber_id)
        })
    }

    async fn status(&self, subscriber_id: &str) -> Result<Subscriber, StoreError> {
        self.db.with_conn(|conn| select_subscriber(conn, subscriber_id))
    }

    async fn list_active(&self, channel: Option<Channel>) -> Result<Vec<Subscriber>, StoreError> {
        self.db.with_conn(|conn| {
            let rows = match channel {
                Some(channel) => {
                    let mut stmt = conn.prepare(
                        "SELECT subscriber_id, channel, active, subscribed_at FROM subscribers
                         WHERE active = 1 AND channel = ?1 ORDER BY subscriber_id",
                    )?;
                    let rows = stmt
                        .query_map([channel.as_str()], map_subscriber_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT subscriber_id, channel, active, subscribed_at FROM subscribers
                         WHERE active = 1 ORDER BY subscriber_id",
                    )?;
                    let rows = stmt
                        .query_map([], map_subscriber_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                }
            };
            rows.into_iter().map(into_subscriber).collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 12, 10, 0, 0).unwrap()
    }

    fn create_test_registry() -> SqliteSubscriberRegistry {
        SqliteSubscriberRegistry::new(Database::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_subscribe_then_status() {
        let registry = create_test_registry();
        let sub = registry.subscribe("chat-42", Channel::ChatBot, t0()).await.unwrap();

        assert!(sub.active);
        assert_eq!(sub.channel, Channel::ChatBot);
        assert_eq!(sub.subscribed_at, t0().to_rfc3339());
        assert_eq!(registry.status("chat-42").await.unwrap(), sub);
    }

    #[tokio::test]
    async fn test_unsubscribe_then_resubscribe_single_record() {
        let registry = create_test_registry();
        registry.subscribe("chat-42", Channel::ChatBot, t0()).await.unwrap();

        let off = registry.unsubscribe("chat-42", t0() + Duration::minutes(1)).await.unwrap();
        assert!(!off.active);
        assert!(registry.list_active(None).await.unwrap().is_empty());

        let on = registry
            .subscribe("chat-42", Channel::ChatBot, t0() + Duration::minutes(2))
            .await
            .unwrap();
        assert!(on.active);
        assert_eq!(on.subscribed_at, (t0() + Duration::minutes(2)).to_rfc3339());

        let rows: i64 = registry
            .db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM subscribers", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn test_repeat_subscribe_keeps_original_timestamp() {
        let registry = create_test_registry();
        registry.subscribe("push-1", Channel::Push, t0()).await.unwrap();
        let again = registry
            .subscribe("push-1", Channel::Push, t0() + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(again.subscribed_at, t0().to_rfc3339());
    }

    #[tokio::test]
    async fn test_unknown_subscriber() {
        let registry = create_test_registry();
        assert!(registry.status("nobody").await.unwrap_err().is_not_found());
        assert!(registry.unsubscribe("nobody", t0()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_active_filter() {
        let registry = create_test_registry();
        registry.subscribe("a", Channel::Push, t0()).await.unwrap();
        registry.subscribe("b", Channel::Voice, t0()).await.unwrap();
        registry.subscribe("c", Channel::Push, t0()).await.unwrap();
        registry.unsubscribe("c", t0()).await.unwrap();

        let all = registry.list_active(None).await.unwrap();
        assert_eq!(all.len(), 2);

        let push = registry.list_active(Some(Channel::Push)).await.unwrap();
        assert_eq!(push.len(), 1);
        assert_eq!(push[0].subscriber_id, "a");
    }

    #[test]
    fn test_channel_parsing() {
        assert_eq!("chat-bot".parse::<Channel>().unwrap(), Channel::ChatBot);
        assert_eq!("PUSH".parse::<Channel>().unwrap(), Channel::Push);
        assert!("fax".parse::<Channel>().is_err());
        assert_eq!(serde_json::to_string(&Channel::ChatBot).unwrap(), "\"chat-bot\"");
    }
}
