//! Signal store: per-window findings and historical decisions
//!
//! Findings from independent perception pipelines land here keyed by
//! `(event_id, modality)`. The store owns the window state machine:
//!
//! ```text
//! OPEN --(all expected modalities | grace elapsed)--> READY --(decision)--> DECIDED
//!   \                                                    |
//!    `------------------(max window age)----------------`--> EXPIRED
//! ```
//!
//! Every transition is a conditional `UPDATE ... WHERE status = ?`, so when
//! several writers race only the one that changes a row triggers fusion.

use super::db::{from_millis, to_millis, Database};
use super::error::{StoreError, ValidationError};
use super::types::{
    join_modalities, parse_modality_set, AlertLevel, Decision, EventWindow, Modality,
    ModalityFinding, SeverityIndicator, WindowSnapshot, WindowStatus, WindowUpdate,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;

#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Validated, idempotent upsert of one finding.
    ///
    /// Creates the window on first sight. Findings for windows that are no
    /// longer OPEN are dropped without changing state.
    async fn put_finding(
        &self,
        event_id: &str,
        finding: ModalityFinding,
        now: DateTime<Utc>,
    ) -> Result<WindowUpdate, StoreError>;

    /// Open an empty window ahead of any finding (capture cycle started).
    /// Returns false if the window already exists.
    async fn open_window(&self, event_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Current window and all stored findings, or `StoreError::NotFound`
    async fn get_window(&self, event_id: &str) -> Result<WindowSnapshot, StoreError>;

    /// OPEN windows whose grace period has elapsed at `now`
    async fn due_windows(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError>;

    /// Time-based OPEN -> READY transition. Returns true for the caller that won.
    async fn mark_ready_if_due(&self, event_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Windows READY since before `ready_before` that still have no decision
    async fn stale_ready_windows(
        &self,
        ready_before: DateTime<Utc>,
    ) -> Result<Vec<EventWindow>, StoreError>;

    /// Create-if-absent insert; moves the window READY -> DECIDED in the same
    /// transaction. Returns the stored decision and whether this call created it.
    async fn record_decision(&self, decision: Decision) -> Result<(Decision, bool), StoreError>;

    async fn get_decision(&self, event_id: &str) -> Result<Option<Decision>, StoreError>;

    /// OPEN/READY -> EXPIRED. Returns true if the window changed.
    async fn expire_window(&self, event_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Decisions at or above `min_level` whose fan-out never completed,
    /// oldest first
    async fn undispatched_decisions(
        &self,
        min_level: AlertLevel,
        limit: usize,
    ) -> Result<Vec<Decision>, StoreError>;

    /// Record that every subscriber of `decision_id` reached a final state.
    /// Returns false if it was already marked.
    async fn mark_dispatched(&self, decision_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;
}

/// SQLite implementation of `SignalStore`
pub struct SqliteSignalStore {
    db: Database,
    expected_modalities: BTreeSet<Modality>,
    grace_period: Duration,
}

impl SqliteSignalStore {
    pub fn new(db: Database, expected_modalities: BTreeSet<Modality>, grace_period: Duration) -> Self {
        Self {
            db,
            expected_modalities,
            grace_period,
        }
    }

    pub(crate) fn database(&self) -> &Database {
        &self.db
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    fn load_window(conn: &Connection, event_id: &str) -> Result<Option<EventWindow>, StoreError> {
        let row: Option<(i64, String, String)> = conn
            .query_row(
                "SELECT opened_at, expected_modalities, status FROM event_windows WHERE event_id = ?1",
                [event_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((opened_at, expected, status)) = row else {
            return Ok(None);
        };

        Ok(Some(EventWindow {
            event_id: event_id.to_string(),
            opened_at: from_millis(opened_at)?,
            expected_modalities: parse_modality_set(&expected)?,
            received_modalities: Self::received_modalities(conn, event_id)?,
            status: status.parse()?,
        }))
    }

    fn received_modalities(conn: &Connection, event_id: &str) -> Result<BTreeSet<Modality>, StoreError> {
        let mut stmt = conn.prepare("SELECT modality FROM modality_findings WHERE event_id = ?1")?;
        let names = stmt
            .query_map([event_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut set = BTreeSet::new();
        for name in names {
            set.insert(name.parse::<Modality>()?);
        }
        Ok(set)
    }

    fn load_findings(conn: &Connection, event_id: &str) -> Result<Vec<ModalityFinding>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT modality, indicators_json, confidence, raw_summary, received_at
             FROM modality_findings WHERE event_id = ?1",
        )?;
        let rows = stmt
            .query_map([event_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut findings = Vec::with_capacity(rows.len());
        for (modality, indicators_json, confidence, raw_summary, received_at) in rows {
            let severity_indicators: Vec<SeverityIndicator> = serde_json::from_str(&indicators_json)?;
            findings.push(ModalityFinding {
                modality: modality.parse()?,
                event_id: event_id.to_string(),
                severity_indicators,
                confidence,
                raw_summary,
                received_at: from_millis(received_at)?,
            });
        }
        findings.sort_by_key(|f| f.modality);
        Ok(findings)
    }

    /// Compare-and-set OPEN -> READY
    fn try_mark_ready(conn: &Connection, event_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let changed = conn.execute(
            "UPDATE event_windows SET status = 'READY', ready_at = ?2, updated_at = ?2
             WHERE event_id = ?1 AND status = 'OPEN'",
            params![event_id, to_millis(now)],
        )?;
        Ok(changed == 1)
    }
}

#[async_trait]
impl SignalStore for SqliteSignalStore {
    async fn put_finding(
        &self,
        event_id: &str,
        finding: ModalityFinding,
        now: DateTime<Utc>,
    ) -> Result<WindowUpdate, StoreError> {
        // Reject before touching the database so a bad finding never opens
        // or advances a window
        finding.validate()?;
        if finding.event_id != event_id {
            return Err(ValidationError::EventIdMismatch {
                expected: event_id.to_string(),
                found: finding.event_id.clone(),
            }
            .into());
        }

        let indicators_json = serde_json::to_string(&finding.severity_indicators)?;
        let grace = self.grace_period;
        let expected = join_modalities(&self.expected_modalities);

        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;

            tx.execute(
                "INSERT INTO event_windows (event_id, opened_at, expected_modalities, status, updated_at)
                 VALUES (?1, ?2, ?3, 'OPEN', ?2)
                 ON CONFLICT(event_id) DO NOTHING",
                params![event_id, to_millis(now), expected],
            )?;

            let window = Self::load_window(&tx, event_id)?
                .ok_or_else(|| StoreError::NotFound(event_id.to_string()))?;

            if window.status != WindowStatus::Open {
                log::debug!(
                    "⏭️  Late {} finding for {} ignored (window {})",
                    finding.modality,
                    event_id,
                    window.status
                );
                tx.commit()?;
                return Ok(WindowUpdate {
                    status: window.status,
                    became_ready: false,
                });
            }

            // Last-write-wins by received_at, not by arrival order
            tx.execute(
                "INSERT INTO modality_findings (
                    event_id, modality, indicators_json, confidence, raw_summary, received_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(event_id, modality) DO UPDATE SET
                    indicators_json = excluded.indicators_json,
                    confidence = excluded.confidence,
                    raw_summary = excluded.raw_summary,
                    received_at = excluded.received_at
                 WHERE excluded.received_at >= modality_findings.received_at",
                params![
                    event_id,
                    finding.modality.as_str(),
                    indicators_json,
                    finding.confidence,
                    finding.raw_summary,
                    to_millis(finding.received_at),
                ],
            )?;

            let received = Self::received_modalities(&tx, event_id)?;
            let complete = window.expected_modalities.is_subset(&received);
            let elapsed = window.grace_elapsed(now, grace);

            let became_ready = if complete || elapsed {
                Self::try_mark_ready(&tx, event_id, now)?
            } else {
                false
            };

            tx.commit()?;

            Ok(WindowUpdate {
                status: if became_ready { WindowStatus::Ready } else { WindowStatus::Open },
                became_ready,
            })
        })
    }

    async fn open_window(&self, event_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        if event_id.trim().is_empty() {
            return Err(ValidationError::EmptyEventId.into());
        }
        let expected = join_modalities(&self.expected_modalities);
        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO event_windows (event_id, opened_at, expected_modalities, status, updated_at)
                 VALUES (?1, ?2, ?3, 'OPEN', ?2)
                 ON CONFLICT(event_id) DO NOTHING",
                params![event_id, to_millis(now), expected],
            )?;
            Ok(inserted == 1)
        })
    }

    async fn get_window(&self, event_id: &str) -> Result<WindowSnapshot, StoreError> {
        self.db.with_conn(|conn| {
            let window = Self::load_window(conn, event_id)?
                .ok_or_else(|| StoreError::NotFound(event_id.to_string()))?;
            let findings = Self::load_findings(conn, event_id)?;
            Ok(WindowSnapshot { window, findings })
        })
    }

    async fn due_windows(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let cutoff = to_millis(now - self.grace_period);
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT event_id FROM event_windows
                 WHERE status = 'OPEN' AND opened_at <= ?1
                 ORDER BY opened_at ASC",
            )?;
            let ids = stmt
                .query_map([cutoff], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    async fn mark_ready_if_due(&self, event_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let grace = self.grace_period;
        self.db.with_conn(|conn| {
            let Some(window) = Self::load_window(conn, event_id)? else {
                return Err(StoreError::NotFound(event_id.to_string()));
            };
            if window.status != WindowStatus::Open {
                return Ok(false);
            }
            if !window.is_complete() && !window.grace_elapsed(now, grace) {
                return Ok(false);
            }
            Self::try_mark_ready(conn, event_id, now)
        })
    }

    async fn stale_ready_windows(
        &self,
        ready_before: DateTime<Utc>,
    ) -> Result<Vec<EventWindow>, StoreError> {
        self.db.with_conn(|conn| {
            let ids = {
                let mut stmt = conn.prepare(
                    "SELECT w.event_id FROM event_windows w
                     LEFT JOIN decisions d ON d.event_id = w.event_id
                     WHERE w.status = 'READY' AND w.ready_at < ?1 AND d.decision_id IS NULL
                     ORDER BY w.opened_at ASC",
                )?;
                let ids = stmt
                    .query_map([to_millis(ready_before)], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                ids
            };

            let mut windows = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(window) = Self::load_window(conn, &id)? {
                    windows.push(window);
                }
            }
            Ok(windows)
        })
    }

    async fn record_decision(&self, decision: Decision) -> Result<(Decision, bool), StoreError> {
        if decision.alert_level > AlertLevel::Normal && decision.contributing_modalities.is_empty() {
            return Err(StoreError::Corrupt(format!(
                "decision {} has level {} without contributing modalities",
                decision.decision_id, decision.alert_level
            )));
        }

        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;

            let inserted = tx.execute(
                "INSERT INTO decisions (
                    decision_id, event_id, alert_level, reason, brief_description,
                    full_description, contributing_modalities, timestamp, decided_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT DO NOTHING",
                params![
                    decision.decision_id,
                    decision.event_id,
                    decision.alert_level.as_u8(),
                    decision.reason,
                    decision.brief_description,
                    decision.full_description,
                    join_modalities(&decision.contributing_modalities),
                    to_millis(decision.timestamp),
                    to_millis(decision.decided_at),
                ],
            )?;

            let created = inserted == 1;
            if created {
                tx.execute(
                    "UPDATE event_windows SET status = 'DECIDED', updated_at = ?2
                     WHERE event_id = ?1 AND status IN ('OPEN', 'READY')",
                    params![decision.event_id, to_millis(decision.decided_at)],
                )?;
            }

            let stored = select_decision(&tx, &decision.event_id)?
                .ok_or_else(|| StoreError::NotFound(decision.event_id.clone()))?;
            tx.commit()?;

            Ok((stored, created))
        })
    }

    async fn get_decision(&self, event_id: &str) -> Result<Option<Decision>, StoreError> {
        self.db.with_conn(|conn| select_decision(conn, event_id))
    }

    async fn expire_window(&self, event_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE event_windows SET status = 'EXPIRED', updated_at = ?2
                 WHERE event_id = ?1 AND status IN ('OPEN', 'READY')",
                params![event_id, to_millis(now)],
            )?;
            Ok(changed == 1)
        })
    }

    async fn undispatched_decisions(
        &self,
        min_level: AlertLevel,
        limit: usize,
    ) -> Result<Vec<Decision>, StoreError> {
        let sql = format!(
            "SELECT {} FROM decisions
             WHERE alert_level >= ?1
               AND decision_id NOT IN (SELECT decision_id FROM decision_dispatches)
             ORDER BY decided_at ASC
             LIMIT ?2",
            DECISION_COLUMNS
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![min_level.as_u8(), limit], DecisionRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(DecisionRow::into_decision).collect()
        })
    }

    async fn mark_dispatched(&self, decision_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO decision_dispatches (decision_id, dispatched_at)
                 VALUES (?1, ?2)
                 ON CONFLICT(decision_id) DO NOTHING",
                params![decision_id, to_millis(now)],
            )?;
            Ok(inserted == 1)
        })
    }
}

pub(crate) const DECISION_COLUMNS: &str = "decision_id, event_id, alert_level, reason, brief_description,
     full_description, contributing_modalities, timestamp, decided_at";

/// Raw decision row, converted outside the rusqlite row closure so JSON and
/// enum parse failures keep their own error variants
pub(crate) struct DecisionRow {
    decision_id: String,
    event_id: String,
    alert_level: u8,
    reason: String,
    brief_description: String,
    full_description: String,
    contributing_modalities: String,
    timestamp: i64,
    decided_at: i64,
}

impl DecisionRow {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            decision_id: row.get(0)?,
            event_id: row.get(1)?,
            alert_level: row.get(2)?,
            reason: row.get(3)?,
            brief_description: row.get(4)?,
            full_description: row.get(5)?,
            contributing_modalities: row.get(6)?,
            timestamp: row.get(7)?,
            decided_at: row.get(8)?,
        })
    }

    pub(crate) fn into_decision(self) -> Result<Decision, StoreError> {
        Ok(Decision {
            decision_id: self.decision_id,
            event_id: self.event_id,
            alert_level: AlertLevel::try_from(self.alert_level)?,
            reason: self.reason,
            brief_description: self.brief_description,
            full_description: self.full_description,
            contributing_modalities: parse_modality_set(&self.contributing_modalities)?,
            timestamp: from_millis(self.timestamp)?,
            decided_at: from_millis(self.decided_at)?,
        })
    }
}

fn select_decision(conn: &Connection, event_id: &str) -> Result<Option<Decision>, StoreError> {
    let sql = format!("SELECT {} FROM decisions WHERE event_id = ?1", DECISION_COLUMNS);
    conn.query_row(&sql, [event_id], DecisionRow::from_row)
        .optional()?
        .map(DecisionRow::into_decision)
        .transpose()
}
