//! Ingestion loop - findings in, decisions out to the dispatcher
//!
//! Single task owning the finding channel:
//! 1. Each finding is stored through `MonitorEngine::submit_finding`
//! 2. The sweep timer advances windows on elapsed time alone
//! 3. Level-2 decisions are dispatched immediately on their own task
//! 4. Lower decisions are batched and flushed on the batch timer
//! 5. On startup and every sweep, decisions whose fan-out never completed
//!    (crash, unflushed batch, registry failure) are routed again
//!
//! Dispatch always runs on spawned tasks so transport retries never stall
//! the channel. A decision counts as dispatched only after every subscriber
//! reached SENT or FAILED.

use super::engine::MonitorEngine;
use crate::dispatch::Dispatcher;
use crate::fusion_core::types::{AlertLevel, Decision, ModalityFinding};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Upper bound on decisions resumed per sweep
const RESUME_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct IngestionConfig {
    pub sweep_interval: Duration,
    pub batch_interval: Duration,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_millis(5000),
            batch_interval: Duration::from_millis(10000),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestionStats {
    pub findings: u64,
    pub rejected: u64,
    pub decisions: u64,
    pub dispatched_immediately: u64,
    pub dispatched_batched: u64,
    /// Recorded decisions picked up again because their fan-out never completed
    pub resumed: u64,
}

struct DispatchQueue {
    engine: Arc<MonitorEngine>,
    dispatcher: Dispatcher,
    pending: Vec<Decision>,
    in_flight: Vec<(String, JoinHandle<()>)>,
}

impl DispatchQueue {
    fn new(engine: Arc<MonitorEngine>, dispatcher: Dispatcher) -> Self {
        Self {
            engine,
            dispatcher,
            pending: Vec::new(),
            in_flight: Vec::new(),
        }
    }

    /// Route a decision; returns true if it went out immediately
    fn accept(&mut self, decision: Decision) -> bool {
        if decision.alert_level == AlertLevel::Urgent {
            self.spawn(decision);
            return true;
        }
        if decision.alert_level < self.dispatcher.config().min_dispatch_level {
            log::debug!("🔕 {} at level {} not queued", decision.decision_id, decision.alert_level);
            return false;
        }
        self.pending.push(decision);
        false
    }

    fn is_tracked(&self, decision_id: &str) -> bool {
        self.pending.iter().any(|d| d.decision_id == decision_id)
            || self.in_flight.iter().any(|(id, _)| id == decision_id)
    }

    fn flush(&mut self) -> usize {
        let batch = std::mem::take(&mut self.pending);
        let count = batch.len();
        if count > 0 {
            log::info!("📤 Flushing {} batched decisions", count);
        }
        for decision in batch {
            self.spawn(decision);
        }
        self.in_flight.retain(|(_, handle)| !handle.is_finished());
        count
    }

    fn spawn(&mut self, decision: Decision) {
        let engine = self.engine.clone();
        let dispatcher = self.dispatcher.clone();
        let decision_id = decision.decision_id.clone();
        let handle = tokio::spawn(async move {
            match dispatcher.dispatch(&decision).await {
                Ok(report) if report.dispatched => {
                    log::info!(
                        "📨 {} (level {}): {} delivered, {} failed",
                        report.decision_id,
                        report.alert_level,
                        report.delivered(),
                        report.failed()
                    );
                    if !report.is_complete() {
                        log::warn!("⚠️  {} left unfinished deliveries, will resume", report.decision_id);
                        return;
                    }
                    if let Err(e) = engine.mark_dispatched(&report.decision_id).await {
                        log::error!("❌ Failed to mark {} dispatched: {}", report.decision_id, e);
                    }
                }
                Ok(_) => {}
                Err(e) => log::error!("❌ Dispatch of {} failed, will resume: {}", decision.decision_id, e),
            }
        });
        self.in_flight.push((decision_id, handle));
    }

    /// Route recorded decisions that were never fully dispatched and are not
    /// already queued or in flight. Returns how many were picked up.
    async fn resume_undispatched(&mut self) -> usize {
        self.in_flight.retain(|(_, handle)| !handle.is_finished());
        let min_level = self.dispatcher.config().min_dispatch_level;
        let decisions = match self.engine.undispatched(min_level, RESUME_LIMIT).await {
            Ok(decisions) => decisions,
            Err(e) => {
                log::error!("❌ Failed to load undispatched decisions: {}", e);
                return 0;
            }
        };

        let mut resumed = 0;
        for decision in decisions {
            if self.is_tracked(&decision.decision_id) {
                continue;
            }
            log::info!(
                "🔁 Resuming dispatch of {} (level {})",
                decision.decision_id,
                decision.alert_level
            );
            self.accept(decision);
            resumed += 1;
        }
        resumed
    }

    async fn drain(&mut self) {
        for (_, handle) in self.in_flight.drain(..) {
            if let Err(e) = handle.await {
                log::error!("❌ Dispatch task panicked: {}", e);
            }
        }
    }
}

/// Run the ingestion loop until the finding channel closes.
///
/// Starts by resuming decisions left undispatched by a previous run. On
/// close, performs a final sweep, flushes the batch and waits for every
/// dispatch task before returning.
pub async fn start_ingestion(
    mut rx: mpsc::Receiver<ModalityFinding>,
    engine: Arc<MonitorEngine>,
    dispatcher: Dispatcher,
    config: IngestionConfig,
) -> IngestionStats {
    log::info!("🚀 Starting finding ingestion");
    log::info!("   ├─ Sweep interval: {}ms", config.sweep_interval.as_millis());
    log::info!("   ├─ Batch interval: {}ms", config.batch_interval.as_millis());
    log::info!("   └─ Waiting for findings...");

    let mut sweep_timer = interval(config.sweep_interval);
    sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut batch_timer = interval(config.batch_interval);
    batch_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut queue = DispatchQueue::new(engine.clone(), dispatcher);
    let mut stats = IngestionStats::default();

    stats.resumed += queue.resume_undispatched().await as u64;

    loop {
        tokio::select! {
            received = rx.recv() => {
                let Some(finding) = received else {
                    log::warn!("⚠️  Finding channel closed, stopping ingestion");
                    break;
                };
                stats.findings += 1;
                match engine.submit_finding(finding).await {
                    Ok(outcome) => {
                        if let Some(decision) = outcome.decision {
                            route(&mut queue, &mut stats, decision);
                        }
                    }
                    Err(e) if e.is_rejected_input() => stats.rejected += 1,
                    Err(e) => log::error!("❌ Failed to process finding: {}", e),
                }
            }

            _ = sweep_timer.tick() => {
                sweep_once(&engine, &mut queue, &mut stats).await;
                stats.resumed += queue.resume_undispatched().await as u64;
            }

            _ = batch_timer.tick() => {
                stats.dispatched_batched += queue.flush() as u64;
            }
        }
    }

    log::info!("🔄 Performing final sweep and flush...");
    sweep_once(&engine, &mut queue, &mut stats).await;
    stats.dispatched_batched += queue.flush() as u64;
    queue.drain().await;

    log::info!("✅ Ingestion stopped");
    log::info!("   ├─ Findings: {} ({} rejected)", stats.findings, stats.rejected);
    log::info!("   ├─ Decisions: {}", stats.decisions);
    log::info!("   └─ Resumed: {}", stats.resumed);
    stats
}

fn route(queue: &mut DispatchQueue, stats: &mut IngestionStats, decision: Decision) {
    stats.decisions += 1;
    if queue.accept(decision) {
        stats.dispatched_immediately += 1;
    }
}

async fn sweep_once(engine: &MonitorEngine, queue: &mut DispatchQueue, stats: &mut IngestionStats) {
    match engine.sweep().await {
        Ok(report) => {
            for decision in report.decisions {
                route(queue, stats, decision);
            }
        }
        Err(e) => log::error!("❌ Sweep failed: {}", e),
    }
}
