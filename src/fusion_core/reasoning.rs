//! Reasoning-service assessments turned into reasoning findings
//!
//! The reasoning service answers either with its structured verdict
//! (`{"alert_level": 2, "reason": ..., "brief_description": ...}`, possibly
//! wrapped in a ```json fence) or with free text. Structured verdicts map to
//! `assessed_*` tags; free text is scanned for keyword families.

use super::types::{Modality, ModalityFinding};
use chrono::{DateTime, Utc};
use serde::Deserialize;

const FALL_KEYWORDS: &[&str] = &[
    "fall",
    "fallen",
    "fell",
    "collapsed",
    "unconscious",
    "motionless",
    "lying down",
    "on floor",
];

const EMERGENCY_KEYWORDS: &[&str] = &[
    "emergency",
    "urgent",
    "critical",
    "immediate",
    "help needed",
    "medical emergency",
    "ambulance",
    "911",
];

const UNUSUAL_ACTIVITY_KEYWORDS: &[&str] = &[
    "unusual",
    "abnormal",
    "concerning",
    "worrisome",
    "strange",
    "out of ordinary",
    "not normal",
];

#[derive(Debug, Deserialize)]
struct StructuredAssessment {
    alert_level: u8,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    brief_description: String,
}

#[derive(Debug, Clone)]
pub struct KeywordAssessor {
    pub fall_confidence: f64,
    pub emergency_confidence: f64,
    pub unusual_confidence: f64,
    pub urgent_confidence: f64,
    pub concerning_confidence: f64,
}

impl Default for KeywordAssessor {
    fn default() -> Self {
        Self {
            fall_confidence: 0.75,
            emergency_confidence: 0.9,
            unusual_confidence: 0.5,
            urgent_confidence: 0.9,
            concerning_confidence: 0.65,
        }
    }
}

impl KeywordAssessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a reasoning finding for `event_id` from one assessment text.
    ///
    /// The finding is always produced; text with no matches yields a finding
    /// without indicators, which still counts as the modality reporting.
    pub fn assess(&self, event_id: &str, text: &str, received_at: DateTime<Utc>) -> ModalityFinding {
        let finding = ModalityFinding::new(Modality::Reasoning, event_id, received_at);

        if let Some(structured) = parse_structured(text) {
            let summary = if structured.brief_description.is_empty() {
                structured.reason.clone()
            } else {
                structured.brief_description.clone()
            };
            let finding = finding.with_summary(summary);
            return match structured.alert_level {
                0 => finding,
                1 => finding.with_indicator("assessed_concerning", self.concerning_confidence),
                _ => finding.with_indicator("assessed_urgent", self.urgent_confidence),
            };
        }

        let lowered = text.to_lowercase();
        let mut finding = finding.with_summary(truncate(text, 200));

        if contains_any(&lowered, FALL_KEYWORDS) {
            finding = finding.with_indicator("fall_reported", self.fall_confidence);
        }
        if contains_any(&lowered, EMERGENCY_KEYWORDS) {
            finding = finding.with_indicator("emergency_keyword", self.emergency_confidence);
        }
        if contains_any(&lowered, UNUSUAL_ACTIVITY_KEYWORDS) {
            finding = finding.with_indicator("unusual_activity", self.unusual_confidence);
        }
        finding
    }
}

fn parse_structured(text: &str) -> Option<StructuredAssessment> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end().trim_end_matches("```").trim())
        .unwrap_or(trimmed);

    if !body.starts_with('{') {
        return None;
    }
    match serde_json::from_str(body) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            log::debug!("Assessment is not a structured verdict ({}), scanning keywords", e);
            None
        }
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
