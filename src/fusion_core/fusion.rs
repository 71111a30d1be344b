//! Fusion engine: merges per-modality findings into one indicator view

use super::types::{EventWindow, Modality, ModalityFinding};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

/// One severity tag merged across modalities
#[derive(Debug, Clone, PartialEq)]
pub struct FusedIndicator {
    pub tag: String,
    /// Highest confidence reported for this tag by any modality
    pub confidence: f64,
    pub sources: BTreeMap<Modality, f64>,
}

impl FusedIndicator {
    /// Modalities that reported this tag at or above `threshold`
    pub fn modalities_at_least(&self, threshold: f64) -> impl Iterator<Item = Modality> + '_ {
        self.sources
            .iter()
            .filter(move |(_, c)| **c >= threshold)
            .map(|(m, _)| *m)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusedSignal {
    pub event_id: String,
    pub opened_at: DateTime<Utc>,
    pub indicators: Vec<FusedIndicator>,
    pub received_modalities: BTreeSet<Modality>,
    pub missing_modalities: BTreeSet<Modality>,
}

impl FusedSignal {
    /// Modalities carrying at least one indicator at or above `threshold`
    pub fn modalities_with_indicator_at_least(&self, threshold: f64) -> BTreeSet<Modality> {
        self.indicators
            .iter()
            .flat_map(|ind| ind.modalities_at_least(threshold))
            .collect()
    }

    pub fn max_confidence(&self) -> f64 {
        self.indicators
            .iter()
            .map(|ind| ind.confidence)
            .fold(0.0, f64::max)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FusionEngine;

impl FusionEngine {
    pub fn new() -> Self {
        Self
    }

    /// Union indicators across modalities.
    ///
    /// Order is first appearance, walking modalities as video, audio,
    /// reasoning and indicators in their reported order. A repeated tag keeps
    /// the maximum confidence; a window with no findings fuses to an empty
    /// indicator list with every expected modality missing.
    pub fn fuse(&self, window: &EventWindow, findings: &[ModalityFinding]) -> FusedSignal {
        let mut ordered: Vec<&ModalityFinding> = findings
            .iter()
            .filter(|f| f.event_id == window.event_id)
            .collect();
        ordered.sort_by_key(|f| f.modality);

        let mut indicators: Vec<FusedIndicator> = Vec::new();
        let mut position: BTreeMap<String, usize> = BTreeMap::new();

        for finding in &ordered {
            for indicator in &finding.severity_indicators {
                match position.get(&indicator.tag) {
                    Some(&idx) => {
                        let fused = &mut indicators[idx];
                        fused.confidence = fused.confidence.max(indicator.confidence);
                        let source = fused.sources.entry(finding.modality).or_insert(0.0);
                        *source = source.max(indicator.confidence);
                    }
                    None => {
                        position.insert(indicator.tag.clone(), indicators.len());
                        let mut sources = BTreeMap::new();
                        sources.insert(finding.modality, indicator.confidence);
                        indicators.push(FusedIndicator {
                            tag: indicator.tag.clone(),
                            confidence: indicator.confidence,
                            sources,
                        });
                    }
                }
            }
        }

        let received_modalities: BTreeSet<Modality> = ordered.iter().map(|f| f.modality).collect();
        let missing_modalities = window
            .expected_modalities
            .difference(&received_modalities)
            .copied()
            .collect();

        FusedSignal {
            event_id: window.event_id.clone(),
            opened_at: window.opened_at,
            indicators,
            received_modalities,
            missing_modalities,
        }
    }
}
