//! Core data structures: findings, event windows and decisions
//!
//! These types cross every boundary in the crate. Findings arrive from the
//! perception pipelines as JSON, windows are owned by the signal store, and
//! decisions are persisted as historical records for later context reads.

use super::error::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Wall-clock source, swappable for scripted time in tests
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Perception source of a finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Video,
    Audio,
    Reasoning,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Video => "video",
            Modality::Audio => "audio",
            Modality::Reasoning => "reasoning",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Modality {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "video" => Ok(Modality::Video),
            "audio" => Ok(Modality::Audio),
            "reasoning" => Ok(Modality::Reasoning),
            other => Err(ValidationError::UnknownModality(other.to_string())),
        }
    }
}

/// Parse a comma-separated modality list ("video,audio")
pub fn parse_modality_set(s: &str) -> Result<BTreeSet<Modality>, ValidationError> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(Modality::from_str)
        .collect()
}

pub fn join_modalities(set: &BTreeSet<Modality>) -> String {
    set.iter().map(Modality::as_str).collect::<Vec<_>>().join(",")
}

/// One tagged observation inside a finding (e.g. `fall_posture` @ 0.9)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeverityIndicator {
    pub tag: String,
    pub confidence: f64,
}

impl SeverityIndicator {
    pub fn new(tag: impl Into<String>, confidence: f64) -> Self {
        Self {
            tag: tag.into(),
            confidence,
        }
    }
}

/// Structured output of one perception service for one event window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModalityFinding {
    pub modality: Modality,
    pub event_id: String,
    #[serde(default)]
    pub severity_indicators: Vec<SeverityIndicator>,
    pub confidence: f64,
    #[serde(default)]
    pub raw_summary: String,
    pub received_at: DateTime<Utc>,
}

impl ModalityFinding {
    pub fn new(modality: Modality, event_id: impl Into<String>, received_at: DateTime<Utc>) -> Self {
        Self {
            modality,
            event_id: event_id.into(),
            severity_indicators: Vec::new(),
            confidence: 1.0,
            raw_summary: String::new(),
            received_at,
        }
    }

    pub fn with_indicator(mut self, tag: impl Into<String>, confidence: f64) -> Self {
        self.severity_indicators
            .push(SeverityIndicator::new(tag, confidence));
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.raw_summary = summary.into();
        self
    }

    /// Parse a finding from the perception input JSON.
    ///
    /// Unknown modalities and missing fields surface as `ValidationError`;
    /// ranges are checked separately by `validate`.
    pub fn from_json(json: &str) -> Result<Self, ValidationError> {
        let value: serde_json::Value =
            serde_json::from_str(json).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, ValidationError> {
        if let Some(modality) = value.get("modality").and_then(|m| m.as_str()) {
            Modality::from_str(modality)?;
        }
        serde_json::from_value(value).map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    /// Structural checks only; the content of a finding is never judged here.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.event_id.trim().is_empty() {
            return Err(ValidationError::EmptyEventId);
        }
        check_confidence("finding", self.confidence)?;
        for indicator in &self.severity_indicators {
            if indicator.tag.trim().is_empty() {
                return Err(ValidationError::EmptyTag);
            }
            check_confidence(&indicator.tag, indicator.confidence)?;
        }
        Ok(())
    }
}

fn check_confidence(field: &str, value: f64) -> Result<(), ValidationError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ValidationError::ConfidenceOutOfRange {
            field: field.to_string(),
            value,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WindowStatus {
    Open,
    Ready,
    Decided,
    Expired,
}

impl WindowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowStatus::Open => "OPEN",
            WindowStatus::Ready => "READY",
            WindowStatus::Decided => "DECIDED",
            WindowStatus::Expired => "EXPIRED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WindowStatus::Decided | WindowStatus::Expired)
    }
}

impl fmt::Display for WindowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WindowStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(WindowStatus::Open),
            "READY" => Ok(WindowStatus::Ready),
            "DECIDED" => Ok(WindowStatus::Decided),
            "EXPIRED" => Ok(WindowStatus::Expired),
            other => Err(ValidationError::UnknownStatus(other.to_string())),
        }
    }
}

/// One monitoring interval correlated across all modalities
#[derive(Debug, Clone, PartialEq)]
pub struct EventWindow {
    pub event_id: String,
    pub opened_at: DateTime<Utc>,
    pub expected_modalities: BTreeSet<Modality>,
    pub received_modalities: BTreeSet<Modality>,
    pub status: WindowStatus,
}

impl EventWindow {
    pub fn missing_modalities(&self) -> BTreeSet<Modality> {
        self.expected_modalities
            .difference(&self.received_modalities)
            .copied()
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.expected_modalities.is_subset(&self.received_modalities)
    }

    pub fn grace_elapsed(&self, now: DateTime<Utc>, grace: chrono::Duration) -> bool {
        now - self.opened_at >= grace
    }
}

/// Window plus every stored finding, as returned by `get_window`
#[derive(Debug, Clone)]
pub struct WindowSnapshot {
    pub window: EventWindow,
    pub findings: Vec<ModalityFinding>,
}

/// Result of a `put_finding` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdate {
    pub status: WindowStatus,
    /// True only for the single writer that moved the window OPEN -> READY
    pub became_ready: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum AlertLevel {
    Normal = 0,
    Concerning = 1,
    Urgent = 2,
}

impl AlertLevel {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn label(&self) -> &'static str {
        match self {
            AlertLevel::Normal => "normal",
            AlertLevel::Concerning => "concerning",
            AlertLevel::Urgent => "urgent",
        }
    }
}

impl From<AlertLevel> for u8 {
    fn from(level: AlertLevel) -> Self {
        level.as_u8()
    }
}

impl TryFrom<u8> for AlertLevel {
    type Error = ValidationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AlertLevel::Normal),
            1 => Ok(AlertLevel::Concerning),
            2 => Ok(AlertLevel::Urgent),
            other => Err(ValidationError::UnknownAlertLevel(other)),
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Immutable alert verdict for one event window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id: String,
    pub event_id: String,
    pub alert_level: AlertLevel,
    pub reason: String,
    pub brief_description: String,
    pub full_description: String,
    pub contributing_modalities: BTreeSet<Modality>,
    /// When the window opened
    pub timestamp: DateTime<Utc>,
    pub decided_at: DateTime<Utc>,
}

impl Decision {
    /// Deterministic id so a second decision for the same window collides on insert
    pub fn decision_id_for(event_id: &str) -> String {
        format!("decision-{}", event_id)
    }

    pub fn to_historical_record(&self) -> HistoricalRecord {
        HistoricalRecord {
            timestamp: self.timestamp.format(HISTORICAL_TIMESTAMP_FORMAT).to_string(),
            event_id: self.event_id.clone(),
            alert_level: self.alert_level.as_u8(),
            reason: self.reason.clone(),
            brief_description: self.brief_description.clone(),
            full_description: self.full_description.clone(),
            contributing_modalities: self
                .contributing_modalities
                .iter()
                .map(|m| m.as_str().to_string())
                .collect(),
            decided_at: self.decided_at.to_rfc3339(),
        }
    }
}

pub const HISTORICAL_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Persisted decision as read by reporting and chat surfaces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalRecord {
    pub timestamp: String,
    pub event_id: String,
    pub alert_level: u8,
    pub reason: String,
    pub brief_description: String,
    pub full_description: String,
    pub contributing_modalities: Vec<String>,
    pub decided_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 12, 8, 30, 0).unwrap()
    }

    #[test]
    fn test_parse_finding_json() {
        let json = r#"{
            "modality": "video",
            "event_id": "evt-001",
            "severity_indicators": [{"tag": "fall_posture", "confidence": 0.9}],
            "confidence": 0.85,
            "raw_summary": "person lying on floor",
            "received_at": "2025-10-12T08:30:00Z"
        }"#;

        let finding = ModalityFinding::from_json(json).unwrap();
        assert_eq!(finding.modality, Modality::Video);
        assert_eq!(finding.severity_indicators.len(), 1);
        assert_eq!(finding.severity_indicators[0].tag, "fall_posture");
        assert_eq!(finding.received_at, ts());
        assert!(finding.validate().is_ok());
    }

    #[test]
    fn test_unknown_modality_rejected() {
        let json = r#"{"modality": "thermal", "event_id": "evt-001", "confidence": 0.5,
                       "received_at": "2025-10-12T08:30:00Z"}"#;

        let err = ModalityFinding::from_json(json).unwrap_err();
        assert_eq!(err, ValidationError::UnknownModality("thermal".to_string()));
    }

    #[test]
    fn test_out_of_range_confidence_rejected() {
        let finding = ModalityFinding::new(Modality::Audio, "evt-002", ts())
            .with_indicator("distress_speech", 1.4);

        match finding.validate() {
            Err(ValidationError::ConfidenceOutOfRange { field, value }) => {
                assert_eq!(field, "distress_speech");
                assert_eq!(value, 1.4);
            }
            other => panic!("expected range error, got {:?}", other),
        }

        let negative = ModalityFinding::new(Modality::Audio, "evt-002", ts()).with_confidence(-0.1);
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_empty_event_id_rejected() {
        let finding = ModalityFinding::new(Modality::Video, "  ", ts());
        assert_eq!(finding.validate(), Err(ValidationError::EmptyEventId));
    }

    #[test]
    fn test_modality_set_parsing() {
        let set = parse_modality_set("video, audio").unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(join_modalities(&set), "video,audio");
        assert!(parse_modality_set("video,smell").is_err());
        assert!(parse_modality_set("").unwrap().is_empty());
    }

    #[test]
    fn test_missing_modalities() {
        let window = EventWindow {
            event_id: "evt-003".to_string(),
            opened_at: ts(),
            expected_modalities: parse_modality_set("video,audio").unwrap(),
            received_modalities: parse_modality_set("video,reasoning").unwrap(),
            status: WindowStatus::Open,
        };

        assert!(!window.is_complete());
        assert_eq!(window.missing_modalities().into_iter().collect::<Vec<_>>(), vec![Modality::Audio]);
        assert!(window.grace_elapsed(ts() + chrono::Duration::seconds(45), chrono::Duration::seconds(45)));
        assert!(!window.grace_elapsed(ts() + chrono::Duration::seconds(44), chrono::Duration::seconds(45)));
    }

    #[test]
    fn test_historical_record_schema() {
        let decision = Decision {
            decision_id: Decision::decision_id_for("evt-004"),
            event_id: "evt-004".to_string(),
            alert_level: AlertLevel::Urgent,
            reason: "corroborated_signals".to_string(),
            brief_description: "Urgent".to_string(),
            full_description: "Urgent, details".to_string(),
            contributing_modalities: parse_modality_set("audio,video").unwrap(),
            timestamp: ts(),
            decided_at: ts() + chrono::Duration::seconds(50),
        };

        let value = serde_json::to_value(decision.to_historical_record()).unwrap();
        assert_eq!(value["timestamp"], "20251012-083000");
        assert_eq!(value["alert_level"], 2);
        assert_eq!(value["contributing_modalities"], serde_json::json!(["video", "audio"]));
        for key in [
            "timestamp",
            "event_id",
            "alert_level",
            "reason",
            "brief_description",
            "full_description",
            "contributing_modalities",
            "decided_at",
        ] {
            assert!(value.get(key).is_some(), "missing key {}", key);
        }

        // Alert level serializes as a bare integer on the decision itself too
        let decision_json = serde_json::to_value(&decision).unwrap();
        assert_eq!(decision_json["alert_level"], 2);
        assert_eq!(decision.decision_id, "decision-evt-004");
    }
}
