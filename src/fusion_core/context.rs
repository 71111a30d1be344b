//! Historical context: recency-bounded lookup over persisted decisions

use super::db::to_millis;
use super::error::StoreError;
use super::signal_store::{DecisionRow, SqliteSignalStore, DECISION_COLUMNS};
use super::types::{AlertLevel, Decision};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy)]
pub struct ContextConfig {
    pub lookback: Duration,
    pub max_items: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            lookback: Duration::hours(1),
            max_items: 10,
        }
    }
}

#[async_trait]
pub trait ContextRetriever: Send + Sync {
    /// Decisions with `decided_at` in `[before - lookback, before)`, newest first
    async fn get_recent_context(
        &self,
        before: DateTime<Utc>,
        lookback: Duration,
        max_items: usize,
    ) -> Result<Vec<Decision>, StoreError>;

    /// Decisions with `decided_at` in `[from, to]`, newest first
    async fn query_decisions(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Decision>, StoreError>;
}

#[async_trait]
impl ContextRetriever for SqliteSignalStore {
    async fn get_recent_context(
        &self,
        before: DateTime<Utc>,
        lookback: Duration,
        max_items: usize,
    ) -> Result<Vec<Decision>, StoreError> {
        if max_items == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM decisions
             WHERE decided_at >= ?1 AND decided_at < ?2
             ORDER BY decided_at DESC
             LIMIT ?3",
            DECISION_COLUMNS
        );
        let start = to_millis(before - lookback);
        let end = to_millis(before);
        self.database()
            .with_conn(|conn| select_decisions(conn, &sql, start, end, max_items))
    }

    async fn query_decisions(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Decision>, StoreError> {
        let sql = format!(
            "SELECT {} FROM decisions
             WHERE decided_at >= ?1 AND decided_at <= ?2
             ORDER BY decided_at DESC
             LIMIT ?3",
            DECISION_COLUMNS
        );
        self.database()
            .with_conn(|conn| select_decisions(conn, &sql, to_millis(from), to_millis(to), limit))
    }
}

fn select_decisions(
    conn: &rusqlite::Connection,
    sql: &str,
    start: i64,
    end: i64,
    limit: usize,
) -> Result<Vec<Decision>, StoreError> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(rusqlite::params![start, end, limit], DecisionRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(DecisionRow::into_decision).collect()
}

/// Number of decisions at level 1 or above
pub fn count_concerning(history: &[Decision]) -> usize {
    history
        .iter()
        .filter(|d| d.alert_level >= AlertLevel::Concerning)
        .count()
}

/// Numbered plain-text digest of past decisions
pub fn format_context(decisions: &[Decision]) -> String {
    if decisions.is_empty() {
        return "No previous events found.".to_string();
    }

    let mut out = String::from("Previous events:\n");
    for (i, decision) in decisions.iter().enumerate() {
        let record = decision.to_historical_record();
        out.push_str(&format!("{}. Time: {}\n", i + 1, record.timestamp));
        out.push_str(&format!("   Alert Level: {}\n", record.alert_level));
        out.push_str(&format!("   Reason: {}\n", record.reason));
        out.push_str(&format!("   Brief: {}\n", record.brief_description));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion_core::db::Database;
    use crate::fusion_core::signal_store::SignalStore;
    use crate::fusion_core::types::parse_modality_set;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 12, 12, 0, 0).unwrap()
    }

    fn create_test_store() -> SqliteSignalStore {
        SqliteSignalStore::new(
            Database::open_in_memory().unwrap(),
            parse_modality_set("video,audio").unwrap(),
            Duration::seconds(45),
        )
    }

    fn decision(event_id: &str, level: AlertLevel, decided_at: DateTime<Utc>) -> Decision {
        let contributing = if level == AlertLevel::Normal {
            Default::default()
        } else {
            parse_modality_set("video").unwrap()
        };
        Decision {
            decision_id: Decision::decision_id_for(event_id),
            event_id: event_id.to_string(),
            alert_level: level,
            reason: "single_indicator".to_string(),
            brief_description: format!("brief {}", event_id),
            full_description: "full".to_string(),
            contributing_modalities: contributing,
            timestamp: decided_at - Duration::seconds(30),
            decided_at,
        }
    }

    #[tokio::test]
    async fn test_recent_context_window_and_order() {
        let store = create_test_store();
        // Outside lookback, inside, inside, and exactly at `before` (excluded)
        for (id, offset) in [("old", -7200), ("a", -1800), ("b", -60), ("edge", 0)] {
            store
                .record_decision(decision(id, AlertLevel::Concerning, t0() + Duration::seconds(offset)))
                .await
                .unwrap();
        }

        let recent = store
            .get_recent_context(t0(), Duration::hours(1), 10)
            .await
            .unwrap();
        let ids: Vec<_> = recent.iter().map(|d| d.event_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_recent_context_bounded_by_max_items() {
        let store = create_test_store();
        for i in 0..5 {
            store
                .record_decision(decision(
                    &format!("evt-{}", i),
                    AlertLevel::Normal,
                    t0() - Duration::minutes(10 - i),
                ))
                .await
                .unwrap();
        }

        let recent = store.get_recent_context(t0(), Duration::hours(1), 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event_id, "evt-4");
        assert!(store.get_recent_context(t0(), Duration::hours(1), 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_history_is_not_an_error() {
        let store = create_test_store();
        let recent = store.get_recent_context(t0(), Duration::hours(1), 10).await.unwrap();
        assert!(recent.is_empty());
        assert_eq!(format_context(&recent), "No previous events found.");
    }

    #[tokio::test]
    async fn test_query_decisions_inclusive_range() {
        let store = create_test_store();
        store.record_decision(decision("x", AlertLevel::Urgent, t0())).await.unwrap();

        let found = store.query_decisions(t0(), t0(), 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].alert_level, AlertLevel::Urgent);
    }

    #[test]
    fn test_count_and_format() {
        let history = vec![
            decision("a", AlertLevel::Concerning, t0()),
            decision("b", AlertLevel::Normal, t0()),
            decision("c", AlertLevel::Urgent, t0()),
        ];
        assert_eq!(count_concerning(&history), 2);

        let text = format_context(&history[..1]);
        assert!(text.starts_with("Previous events:\n1. Time: 20251012-115930\n"));
        assert!(text.contains("   Alert Level: 1\n"));
        assert!(text.contains("   Brief: brief a\n"));
    }
}
