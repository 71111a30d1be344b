//! Rule-based alert decisions with configurable thresholds

use super::context::count_concerning;
use super::fusion::{FusedIndicator, FusedSignal};
use super::types::{join_modalities, AlertLevel, Decision, Modality};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

pub const DEFAULT_EMERGENCY_TAGS: &[&str] = &[
    "emergency",
    "emergency_keyword",
    "fall_posture",
    "distress_speech",
    "motionless_horizontal",
];

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionThresholds {
    pub emergency: f64,
    pub medium: f64,
    pub borderline: f64,
    pub repeated_concern_count: usize,
    pub emergency_tags: BTreeSet<String>,
}

impl Default for DecisionThresholds {
    fn default() -> Self {
        Self {
            emergency: 0.95,
            medium: 0.6,
            borderline: 0.3,
            repeated_concern_count: 3,
            emergency_tags: DEFAULT_EMERGENCY_TAGS.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl DecisionThresholds {
    pub fn is_emergency_tag(&self, tag: &str) -> bool {
        self.emergency_tags.contains(&tag.to_ascii_lowercase())
    }
}

/// Rule that produced a decision, stored as the decision `reason`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionRule {
    EmergencyIndicator,
    CorroboratedSignals,
    SingleIndicator,
    RepeatedConcern,
    NoConcern,
}

impl DecisionRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionRule::EmergencyIndicator => "emergency_indicator",
            DecisionRule::CorroboratedSignals => "corroborated_signals",
            DecisionRule::SingleIndicator => "single_indicator",
            DecisionRule::RepeatedConcern => "repeated_concern",
            DecisionRule::NoConcern => "no_concern",
        }
    }

    pub fn alert_level(&self) -> AlertLevel {
        match self {
            DecisionRule::EmergencyIndicator | DecisionRule::CorroboratedSignals => AlertLevel::Urgent,
            DecisionRule::SingleIndicator | DecisionRule::RepeatedConcern => AlertLevel::Concerning,
            DecisionRule::NoConcern => AlertLevel::Normal,
        }
    }
}

/// Outcome of rule evaluation before the descriptions are rendered
struct RuleMatch<'a> {
    rule: DecisionRule,
    contributing: BTreeSet<Modality>,
    /// Indicators cited in the brief description, strongest first
    cited: Vec<&'a FusedIndicator>,
    concerning_history: usize,
}

pub struct DecisionEngine {
    thresholds: DecisionThresholds,
}

impl DecisionEngine {
    pub fn new(thresholds: DecisionThresholds) -> Self {
        Self { thresholds }
    }

    pub fn with_defaults() -> Self {
        Self::new(DecisionThresholds::default())
    }

    pub fn thresholds(&self) -> &DecisionThresholds {
        &self.thresholds
    }

    /// Map a fused signal plus recent history to an alert level.
    ///
    /// # Rules (first match wins)
    /// 1. **emergency_indicator**: emergency-class tag at or above `emergency` -> 2
    /// 2. **corroborated_signals**: two or more modalities at or above `medium` -> 2
    /// 3. **single_indicator**: any indicator at or above `medium` -> 1;
    ///    **repeated_concern**: `repeated_concern_count` level-1+ decisions in
    ///    `history` and an indicator at or above `borderline` -> 1
    /// 4. **no_concern** -> 0
    ///
    /// An empty `history` skips the repeated-concern clause.
    pub fn decide(&self, fused: &FusedSignal, history: &[Decision], now: DateTime<Utc>) -> Decision {
        let matched = self.evaluate(fused, history);
        let level = matched.rule.alert_level();

        Decision {
            decision_id: Decision::decision_id_for(&fused.event_id),
            event_id: fused.event_id.clone(),
            alert_level: level,
            reason: matched.rule.as_str().to_string(),
            brief_description: self.brief_description(&matched),
            full_description: self.full_description(fused, &matched),
            contributing_modalities: matched.contributing,
            timestamp: fused.opened_at,
            decided_at: now,
        }
    }

    fn evaluate<'a>(&self, fused: &'a FusedSignal, history: &[Decision]) -> RuleMatch<'a> {
        let t = &self.thresholds;

        // Rule 1
        let emergencies: Vec<&FusedIndicator> = fused
            .indicators
            .iter()
            .filter(|ind| t.is_emergency_tag(&ind.tag) && ind.confidence >= t.emergency)
            .collect();
        if !emergencies.is_empty() {
            let contributing = emergencies
                .iter()
                .flat_map(|ind| ind.modalities_at_least(t.emergency))
                .collect();
            return RuleMatch {
                rule: DecisionRule::EmergencyIndicator,
                contributing,
                cited: strongest_first(emergencies),
                concerning_history: 0,
            };
        }

        let medium = fused.modalities_with_indicator_at_least(t.medium);
        let medium_cited = || {
            strongest_first(
                fused
                    .indicators
                    .iter()
                    .filter(|ind| ind.confidence >= t.medium)
                    .collect(),
            )
        };

        // Rule 2
        if medium.len() >= 2 {
            return RuleMatch {
                rule: DecisionRule::CorroboratedSignals,
                contributing: medium,
                cited: medium_cited(),
                concerning_history: 0,
            };
        }

        // Rule 3
        if !medium.is_empty() {
            return RuleMatch {
                rule: DecisionRule::SingleIndicator,
                contributing: medium,
                cited: medium_cited(),
                concerning_history: 0,
            };
        }

        let concerning_history = count_concerning(history);
        if t.repeated_concern_count > 0 && concerning_history >= t.repeated_concern_count {
            let borderline = fused.modalities_with_indicator_at_least(t.borderline);
            if !borderline.is_empty() {
                let cited = strongest_first(
                    fused
                        .indicators
                        .iter()
                        .filter(|ind| ind.confidence >= t.borderline)
                        .collect(),
                );
                return RuleMatch {
                    rule: DecisionRule::RepeatedConcern,
                    contributing: borderline,
                    cited,
                    concerning_history,
                };
            }
        }

        // Rule 4
        RuleMatch {
            rule: DecisionRule::NoConcern,
            contributing: BTreeSet::new(),
            cited: Vec::new(),
            concerning_history,
        }
    }

    fn brief_description(&self, matched: &RuleMatch<'_>) -> String {
        let lead = matched
            .cited
            .first()
            .map(|ind| format!("{} ({:.2})", ind.tag, ind.confidence))
            .unwrap_or_default();

        match matched.rule {
            DecisionRule::EmergencyIndicator => {
                format!("EMERGENCY: {} detected. Immediate attention required.", lead)
            }
            DecisionRule::CorroboratedSignals => format!(
                "URGENT: {} corroborated by {}.",
                lead,
                join_modalities(&matched.contributing)
            ),
            DecisionRule::SingleIndicator => format!(
                "Possible issue: {} from {}.",
                lead,
                join_modalities(&matched.contributing)
            ),
            DecisionRule::RepeatedConcern => format!(
                "Repeated concern: {} after {} recent alerts.",
                lead, matched.concerning_history
            ),
            DecisionRule::NoConcern => "No issues detected.".to_string(),
        }
    }

    fn full_description(&self, fused: &FusedSignal, matched: &RuleMatch<'_>) -> String {
        let t = &self.thresholds;
        let mut out = match matched.rule {
            DecisionRule::EmergencyIndicator => format!(
                "Emergency-class indicator at or above {:.2} reported by {}.",
                t.emergency,
                join_modalities(&matched.contributing)
            ),
            DecisionRule::CorroboratedSignals => format!(
                "{} modalities ({}) reported indicators at or above {:.2}.",
                matched.contributing.len(),
                join_modalities(&matched.contributing),
                t.medium
            ),
            DecisionRule::SingleIndicator => format!(
                "Indicator at or above {:.2} reported by {} without corroboration.",
                t.medium,
                join_modalities(&matched.contributing)
            ),
            DecisionRule::RepeatedConcern => format!(
                "{} concerning decisions in the lookback window; borderline indicator (>= {:.2}) from {}.",
                matched.concerning_history,
                t.borderline,
                join_modalities(&matched.contributing)
            ),
            DecisionRule::NoConcern => {
                format!("No indicator reached {:.2}.", t.medium)
            }
        };

        if fused.indicators.is_empty() {
            out.push_str(" Indicators: none.");
        } else {
            let listed: Vec<String> = fused.indicators.iter().map(describe_indicator).collect();
            out.push_str(&format!(" Indicators: {}.", listed.join("; ")));
        }

        if !fused.missing_modalities.is_empty() {
            out.push_str(&format!(
                " Missing modalities: {}.",
                join_modalities(&fused.missing_modalities)
            ));
        }
        out
    }
}

fn strongest_first(mut indicators: Vec<&FusedIndicator>) -> Vec<&FusedIndicator> {
    // Stable sort keeps fusion order between equal confidences
    indicators.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    indicators
}

fn describe_indicator(ind: &FusedIndicator) -> String {
    let sources: Vec<String> = ind
        .sources
        .iter()
        .map(|(m, c)| format!("{} {:.2}", m, c))
        .collect();
    format!("{} {:.2} [{}]", ind.tag, ind.confidence, sources.join(", "))
}
