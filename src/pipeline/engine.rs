//! Monitor Engine - window lifecycle orchestration
//!
//! Glues the signal store, context retriever, fusion engine and decision
//! engine together:
//!
//! ```text
//! ModalityFinding
//!     ↓
//! MonitorEngine::submit_finding()  ──(became_ready)──┐
//!                                                    ↓
//! MonitorEngine::sweep() ──(grace elapsed)──> finalize_window()
//!                                                    ↓
//!                              fuse → recent context → decide → record
//! ```
//!
//! The engine never dispatches; it returns the decisions it created so the
//! caller can hand each one to the dispatcher. A hand-off is only complete
//! once `mark_dispatched` is recorded, so decisions lost to a crash or a
//! failed fan-out come back through `undispatched`.

use crate::dispatch::operator::{OperatorAlert, OperatorAlertKind, OperatorAlertSink};
use crate::fusion_core::context::{ContextConfig, ContextRetriever};
use crate::fusion_core::decision::DecisionEngine;
use crate::fusion_core::error::StoreError;
use crate::fusion_core::fusion::FusionEngine;
use crate::fusion_core::signal_store::SignalStore;
use crate::fusion_core::types::{
    system_clock, AlertLevel, Clock, Decision, ModalityFinding, WindowStatus, WindowUpdate,
};
use chrono::Duration;
use std::sync::Arc;

#[derive(Debug)]
pub enum EngineError {
    Store(StoreError),
    WindowNotReady(String),
    WindowExpired(String),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        EngineError::Store(err)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Store(e) => write!(f, "{}", e),
            EngineError::WindowNotReady(id) => write!(f, "Window {} is still open", id),
            EngineError::WindowExpired(id) => write!(f, "Window {} expired before a decision", id),
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    /// Malformed input, as opposed to an infrastructure failure
    pub fn is_rejected_input(&self) -> bool {
        matches!(self, EngineError::Store(StoreError::Validation(_)))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub context: ContextConfig,
    /// READY windows older than this (by `opened_at`) are expired instead of retried
    pub max_window_age: Duration,
    /// READY windows left undecided this long are picked up by the sweep
    pub retry_ready_after: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            context: ContextConfig::default(),
            max_window_age: Duration::seconds(600),
            retry_ready_after: Duration::seconds(5),
        }
    }
}

/// Result of `submit_finding`
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub update: WindowUpdate,
    /// Present only when this call created the decision
    pub decision: Option<Decision>,
}

#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub became_ready: usize,
    pub retried: usize,
    pub expired: Vec<String>,
    /// Decisions created during this sweep
    pub decisions: Vec<Decision>,
}

pub struct MonitorEngine {
    store: Arc<dyn SignalStore>,
    context: Arc<dyn ContextRetriever>,
    fusion: FusionEngine,
    decisions: DecisionEngine,
    operator: Arc<dyn OperatorAlertSink>,
    config: EngineConfig,
    now_fn: Clock,
}

impl MonitorEngine {
    pub fn new(
        store: Arc<dyn SignalStore>,
        context: Arc<dyn ContextRetriever>,
        decisions: DecisionEngine,
        operator: Arc<dyn OperatorAlertSink>,
        config: EngineConfig,
    ) -> Self {
        Self::new_with_clock(store, context, decisions, operator, config, system_clock())
    }

    /// Create an engine with a custom clock (deterministic tests)
    pub fn new_with_clock(
        store: Arc<dyn SignalStore>,
        context: Arc<dyn ContextRetriever>,
        decisions: DecisionEngine,
        operator: Arc<dyn OperatorAlertSink>,
        config: EngineConfig,
        now_fn: Clock,
    ) -> Self {
        Self {
            store,
            context,
            fusion: FusionEngine::new(),
            decisions,
            operator,
            config,
            now_fn,
        }
    }

    pub fn store(&self) -> &Arc<dyn SignalStore> {
        &self.store
    }

    /// Recorded decisions at or above `min_level` whose fan-out never completed
    pub async fn undispatched(&self, min_level: AlertLevel, limit: usize) -> Result<Vec<Decision>, EngineError> {
        Ok(self.store.undispatched_decisions(min_level, limit).await?)
    }

    pub async fn mark_dispatched(&self, decision_id: &str) -> Result<bool, EngineError> {
        Ok(self.store.mark_dispatched(decision_id, (self.now_fn)()).await?)
    }

    /// Start an empty window so it can reach READY on elapsed time alone
    pub async fn open_window(&self, event_id: &str) -> Result<bool, EngineError> {
        Ok(self.store.open_window(event_id, (self.now_fn)()).await?)
    }

    /// Store one finding; finalize the window if this write made it READY
    pub async fn submit_finding(&self, finding: ModalityFinding) -> Result<SubmitOutcome, EngineError> {
        let event_id = finding.event_id.clone();
        let modality = finding.modality;

        let update = match self.store.put_finding(&event_id, finding, (self.now_fn)()).await {
            Ok(update) => update,
            Err(e) => {
                log::warn!("⚠️  Rejected {} finding for {}: {}", modality, event_id, e);
                return Err(e.into());
            }
        };

        log::debug!("📥 {} finding stored for {} ({})", modality, event_id, update.status);

        let decision = if update.became_ready {
            let (decision, created) = self.finalize_window(&event_id).await?;
            created.then_some(decision)
        } else {
            None
        };

        Ok(SubmitOutcome { update, decision })
    }

    /// Fuse, decide and record the decision for a READY window.
    ///
    /// Returns the stored decision and whether this call created it. A window
    /// that already has a decision returns it unchanged.
    pub async fn finalize_window(&self, event_id: &str) -> Result<(Decision, bool), EngineError> {
        if let Some(existing) = self.store.get_decision(event_id).await? {
            return Ok((existing, false));
        }

        let snapshot = self.store.get_window(event_id).await?;
        match snapshot.window.status {
            WindowStatus::Open => return Err(EngineError::WindowNotReady(event_id.to_string())),
            WindowStatus::Expired => return Err(EngineError::WindowExpired(event_id.to_string())),
            WindowStatus::Ready | WindowStatus::Decided => {}
        }

        let now = (self.now_fn)();
        let fused = self.fusion.fuse(&snapshot.window, &snapshot.findings);

        // History is advisory: a failed lookup decides without it
        let history = match self
            .context
            .get_recent_context(now, self.config.context.lookback, self.config.context.max_items)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                log::warn!("⚠️  History unavailable for {}, deciding without it: {}", event_id, e);
                Vec::new()
            }
        };

        let decision = self.decisions.decide(&fused, &history, now);
        let (stored, created) = self.store.record_decision(decision).await?;

        if created {
            log::info!(
                "🧭 Decision {} → level {} ({})",
                stored.event_id,
                stored.alert_level,
                stored.reason
            );
            log::info!("   ├─ Contributing: {:?}", stored.contributing_modalities);
            log::info!("   ├─ Missing: {:?}", fused.missing_modalities);
            log::info!("   └─ History: {} recent decisions", history.len());
        } else {
            log::debug!("Decision for {} already recorded", event_id);
        }

        Ok((stored, created))
    }

    /// Time-based pass: advance due windows, retry undecided READY windows
    /// and expire the ones past `max_window_age`.
    pub async fn sweep(&self) -> Result<SweepReport, EngineError> {
        let now = (self.now_fn)();
        let mut report = SweepReport::default();

        for event_id in self.store.due_windows(now).await? {
            if !self.store.mark_ready_if_due(&event_id, now).await? {
                continue;
            }
            report.became_ready += 1;
            match self.finalize_window(&event_id).await {
                Ok((decision, true)) => report.decisions.push(decision),
                Ok((_, false)) => {}
                Err(e) => log::error!("❌ Failed to finalize {}: {}", event_id, e),
            }
        }

        let stale = self
            .store
            .stale_ready_windows(now - self.config.retry_ready_after)
            .await?;
        for window in stale {
            if now - window.opened_at >= self.config.max_window_age {
                if self.store.expire_window(&window.event_id, now).await? {
                    self.raise_expired(&window.event_id, now).await;
                    report.expired.push(window.event_id);
                }
                continue;
            }

            report.retried += 1;
            match self.finalize_window(&window.event_id).await {
                Ok((decision, true)) => report.decisions.push(decision),
                Ok((_, false)) => {}
                Err(e) => log::error!("❌ Retry of {} failed: {}", window.event_id, e),
            }
        }

        if report.became_ready > 0 || !report.expired.is_empty() {
            log::info!(
                "🧹 Sweep: {} ready, {} retried, {} expired, {} decisions",
                report.became_ready,
                report.retried,
                report.expired.len(),
                report.decisions.len()
            );
        }
        Ok(report)
    }

    async fn raise_expired(&self, event_id: &str, now: chrono::DateTime<chrono::Utc>) {
        self.operator
            .raise(OperatorAlert {
                kind: OperatorAlertKind::WindowExpired,
                event_id: event_id.to_string(),
                decision_id: None,
                subscriber_id: None,
                alert_level: None,
                message: format!(
                    "window {} expired without a decision after {}s",
                    event_id,
                    self.config.max_window_age.num_seconds()
                ),
                raised_at: now,
            })
            .await;
    }
}
