//! Delivery ledger: one record per (decision, subscriber)
//!
//! PENDING records are the only ones that accept attempts. SENT and FAILED
//! are terminal; only an explicit `reset_failed` puts a FAILED record back
//! into PENDING with a fresh attempt budget.

use crate::fusion_core::db::{from_millis, to_millis, Database};
use crate::fusion_core::error::{StoreError, ValidationError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "PENDING",
            DeliveryStatus::Sent => "SENT",
            DeliveryStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryStatus::Pending)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(DeliveryStatus::Pending),
            "SENT" => Ok(DeliveryStatus::Sent),
            "FAILED" => Ok(DeliveryStatus::Failed),
            other => Err(ValidationError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRecord {
    pub decision_id: String,
    pub subscriber_id: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Result of one transport call as recorded in the ledger
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Sent,
    /// Transient failure, record stays PENDING
    Retry(String),
    /// Permanent failure or ceiling reached
    Failed(String),
}

#[async_trait]
pub trait DeliveryLedger: Send + Sync {
    /// Create the PENDING record if absent; returns the current record either way
    async fn begin(
        &self,
        decision_id: &str,
        subscriber_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DeliveryRecord, StoreError>;

    /// Count one attempt and apply its outcome. Records that are already
    /// terminal are returned unchanged.
    async fn record_attempt(
        &self,
        decision_id: &str,
        subscriber_id: &str,
        outcome: AttemptOutcome,
        now: DateTime<Utc>,
    ) -> Result<DeliveryRecord, StoreError>;

    async fn get(&self, decision_id: &str, subscriber_id: &str) -> Result<Option<DeliveryRecord>, StoreError>;

    async fn records_for(&self, decision_id: &str) -> Result<Vec<DeliveryRecord>, StoreError>;

    /// PENDING -> FAILED without counting an attempt (budget already spent)
    async fn mark_failed(
        &self,
        decision_id: &str,
        subscriber_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<DeliveryRecord, StoreError>;

    /// FAILED -> PENDING with attempts reset, for operator re-dispatch.
    /// Returns true if the record was reset.
    async fn reset_failed(&self, decision_id: &str, subscriber_id: &str) -> Result<bool, StoreError>;
}

pub struct SqliteDeliveryLedger {
    db: Database,
}

impl SqliteDeliveryLedger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

type DeliveryRow = (String, String, String, u32, Option<i64>, Option<String>);

const DELIVERY_COLUMNS: &str =
    "decision_id, subscriber_id, status, attempts, last_attempt_at, last_error";

fn map_delivery_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeliveryRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn into_record(row: DeliveryRow) -> Result<DeliveryRecord, StoreError> {
    let (decision_id, subscriber_id, status, attempts, last_attempt_at, last_error) = row;
    Ok(DeliveryRecord {
        decision_id,
        subscriber_id,
        status: status.parse()?,
        attempts,
        last_attempt_at: last_attempt_at.map(from_millis).transpose()?,
        last_error,
    })
}

fn select_record(
    conn: &rusqlite::Connection,
    decision_id: &str,
    subscriber_id: &str,
) -> Result<Option<DeliveryRecord>, StoreError> {
    let sql = format!(
        "SELECT {} FROM delivery_records WHERE decision_id = ?1 AND subscriber_id = ?2",
        DELIVERY_COLUMNS
    );
    conn.query_row(&sql, params![decision_id, subscriber_id], map_delivery_row)
        .optional()?
        .map(into_record)
        .transpose()
}

#[async_trait]
impl DeliveryLedger for SqliteDeliveryLedger {
    async fn begin(
        &self,
        decision_id: &str,
        subscriber_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DeliveryRecord, StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO delivery_records (decision_id, subscriber_id, status, attempts, created_at)
                 VALUES (?1, ?2, 'PENDING', 0, ?3)
                 ON CONFLICT(decision_id, subscriber_id) DO NOTHING",
                params![decision_id, subscriber_id, to_millis(now)],
            )?;
            select_record(conn, decision_id, subscriber_id)?
                .ok_or_else(|| StoreError::NotFound(format!("{}/{}", decision_id, subscriber_id)))
        })
    }

    async fn record_attempt(
        &self,
        decision_id: &str,
        subscriber_id: &str,
        outcome: AttemptOutcome,
        now: DateTime<Utc>,
    ) -> Result<DeliveryRecord, StoreError> {
        let (status, error) = match &outcome {
            AttemptOutcome::Sent => (DeliveryStatus::Sent, None),
            AttemptOutcome::Retry(e) => (DeliveryStatus::Pending, Some(e.clone())),
            AttemptOutcome::Failed(e) => (DeliveryStatus::Failed, Some(e.clone())),
        };

        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE delivery_records
                 SET status = ?3, attempts = attempts + 1, last_attempt_at = ?4,
                     last_error = COALESCE(?5, last_error)
                 WHERE decision_id = ?1 AND subscriber_id = ?2 AND status = 'PENDING'",
                params![decision_id, subscriber_id, status.as_str(), to_millis(now), error],
            )?;
            select_record(conn, decision_id, subscriber_id)?
                .ok_or_else(|| StoreError::NotFound(format!("{}/{}", decision_id, subscriber_id)))
        })
    }

    async fn get(&self, decision_id: &str, subscriber_id: &str) -> Result<Option<DeliveryRecord>, StoreError> {
        self.db
            .with_conn(|conn| select_record(conn, decision_id, subscriber_id))
    }

    async fn records_for(&self, decision_id: &str) -> Result<Vec<DeliveryRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM delivery_records WHERE decision_id = ?1 ORDER BY subscriber_id",
            DELIVERY_COLUMNS
        );
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([decision_id], map_delivery_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(into_record).collect()
        })
    }

    async fn mark_failed(
        &self,
        decision_id: &str,
        subscriber_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<DeliveryRecord, StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE delivery_records SET status = 'FAILED', last_error = ?3, last_attempt_at = ?4
                 WHERE decision_id = ?1 AND subscriber_id = ?2 AND status = 'PENDING'",
                params![decision_id, subscriber_id, error, to_millis(now)],
            )?;
            select_record(conn, decision_id, subscriber_id)?
                .ok_or_else(|| StoreError::NotFound(format!("{}/{}", decision_id, subscriber_id)))
        })
    }

    async fn reset_failed(&self, decision_id: &str, subscriber_id: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE delivery_records SET status = 'PENDING', attempts = 0
                 WHERE decision_id = ?1 AND subscriber_id = ?2 AND status = 'FAILED'",
                params![decision_id, subscriber_id],
            )?;
            Ok(changed == 1)
        })
    }
}
