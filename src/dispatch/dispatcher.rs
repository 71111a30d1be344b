//! Decision fan-out with per-subscriber delivery tracking
//!
//! Every active subscriber gets its own task. A task walks its delivery
//! record from PENDING to SENT or FAILED, holding a lane permit only while a
//! transport call is in flight so backoff sleeps never occupy a slot.
//! Level-2 decisions run on their own lane with the urgent retry policy.

use super::backoff::RetryPolicy;
use super::delivery::{AttemptOutcome, DeliveryLedger, DeliveryStatus};
use super::operator::{OperatorAlert, OperatorAlertKind, OperatorAlertSink};
use super::subscribers::{Subscriber, SubscriberRegistry};
use super::transport::{TransportError, TransportSet};
use crate::fusion_core::error::StoreError;
use crate::fusion_core::types::{system_clock, AlertLevel, Clock, Decision};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    pub min_dispatch_level: AlertLevel,
    pub max_parallel: usize,
    pub normal_retry: RetryPolicy,
    pub urgent_retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            min_dispatch_level: AlertLevel::Concerning,
            max_parallel: 8,
            normal_retry: RetryPolicy::normal(),
            urgent_retry: RetryPolicy::urgent(),
        }
    }
}

#[derive(Debug)]
pub enum DispatchError {
    Store(StoreError),
}

impl From<StoreError> for DispatchError {
    fn from(err: StoreError) -> Self {
        DispatchError::Store(err)
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::Store(e) => write!(f, "Dispatch store error: {}", e),
        }
    }
}

impl std::error::Error for DispatchError {}

/// What happened to one subscriber during a dispatch call
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    Failed { attempts: u32, error: String },
    /// Record was already SENT or FAILED before this call
    AlreadyComplete(DeliveryStatus),
    /// Another task is delivering the same record
    InFlight,
    /// Ledger or task failure; the record stays as it was
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchReport {
    pub decision_id: String,
    pub alert_level: AlertLevel,
    /// False when the decision is below `min_dispatch_level`
    pub dispatched: bool,
    pub outcomes: Vec<(String, DeliveryOutcome)>,
}

impl DispatchReport {
    pub fn delivered(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, DeliveryOutcome::Delivered { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, DeliveryOutcome::Failed { .. } | DeliveryOutcome::Error(_)))
            .count()
    }

    /// Every subscriber reached SENT or FAILED; nothing is left to resume
    pub fn is_complete(&self) -> bool {
        self.dispatched
            && self.outcomes.iter().all(|(_, o)| {
                matches!(
                    o,
                    DeliveryOutcome::Delivered { .. }
                        | DeliveryOutcome::Failed { .. }
                        | DeliveryOutcome::AlreadyComplete(_)
                )
            })
    }

    pub fn outcome_for(&self, subscriber_id: &str) -> Option<&DeliveryOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == subscriber_id)
            .map(|(_, o)| o)
    }
}

/// Removes a (decision, subscriber) pair from the in-flight set on drop
struct InFlightGuard {
    key: (String, String),
    set: Arc<Mutex<HashSet<(String, String)>>>,
}

impl InFlightGuard {
    fn acquire(set: &Arc<Mutex<HashSet<(String, String)>>>, key: (String, String)) -> Option<Self> {
        let mut guard = set.lock().ok()?;
        if !guard.insert(key.clone()) {
            return None;
        }
        Some(Self {
            key,
            set: set.clone(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.set.lock() {
            guard.remove(&self.key);
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<dyn SubscriberRegistry>,
    ledger: Arc<dyn DeliveryLedger>,
    transports: TransportSet,
    operator: Arc<dyn OperatorAlertSink>,
    config: DispatchConfig,
    normal_lane: Arc<Semaphore>,
    urgent_lane: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<(String, String)>>>,
    now_fn: Clock,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<dyn SubscriberRegistry>,
        ledger: Arc<dyn DeliveryLedger>,
        transports: TransportSet,
        operator: Arc<dyn OperatorAlertSink>,
        config: DispatchConfig,
    ) -> Self {
        let lanes = config.max_parallel.max(1);
        Self {
            registry,
            ledger,
            transports,
            operator,
            config,
            normal_lane: Arc::new(Semaphore::new(lanes)),
            urgent_lane: Arc::new(Semaphore::new(lanes)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            now_fn: system_clock(),
        }
    }

    pub fn with_clock(mut self, now_fn: Clock) -> Self {
        self.now_fn = now_fn;
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    fn policy_for(&self, level: AlertLevel) -> RetryPolicy {
        if level == AlertLevel::Urgent {
            self.config.urgent_retry
        } else {
            self.config.normal_retry
        }
    }

    fn lane_for(&self, level: AlertLevel) -> Arc<Semaphore> {
        if level == AlertLevel::Urgent {
            self.urgent_lane.clone()
        } else {
            self.normal_lane.clone()
        }
    }

    /// Deliver `decision` to every active subscriber.
    ///
    /// Returns once every subscriber task has reached SENT, FAILED or been
    /// skipped. Only a failure to list subscribers is an error; per-subscriber
    /// problems are reported in the outcomes.
    pub async fn dispatch(&self, decision: &Decision) -> Result<DispatchReport, DispatchError> {
        if decision.alert_level < self.config.min_dispatch_level {
            log::debug!(
                "🔕 Decision {} at level {} below dispatch threshold",
                decision.decision_id,
                decision.alert_level
            );
            return Ok(DispatchReport {
                decision_id: decision.decision_id.clone(),
                alert_level: decision.alert_level,
                dispatched: false,
                outcomes: Vec::new(),
            });
        }

        let subscribers = self.registry.list_active(None).await?;

        log::info!(
            "📣 Dispatching {} (level {}) to {} subscribers",
            decision.decision_id,
            decision.alert_level,
            subscribers.len()
        );

        let decision = Arc::new(decision.clone());
        let mut handles = Vec::with_capacity(subscribers.len());

        for subscriber in subscribers {
            let dispatcher = self.clone();
            let decision = decision.clone();
            let subscriber_id = subscriber.subscriber_id.clone();
            let handle = tokio::spawn(async move { dispatcher.deliver(&subscriber, &decision).await });
            handles.push((subscriber_id, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (subscriber_id, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    log::error!("❌ Delivery task for {} aborted: {}", subscriber_id, e);
                    DeliveryOutcome::Error(e.to_string())
                }
            };
            outcomes.push((subscriber_id, outcome));
        }

        let report = DispatchReport {
            decision_id: decision.decision_id.clone(),
            alert_level: decision.alert_level,
            dispatched: true,
            outcomes,
        };

        log::info!(
            "✅ Dispatch {} complete: {} delivered, {} failed",
            report.decision_id,
            report.delivered(),
            report.failed()
        );
        Ok(report)
    }

    /// Operator re-dispatch: FAILED records of active subscribers go back to
    /// PENDING with a fresh budget, then the decision is dispatched again.
    pub async fn redispatch_failed(&self, decision: &Decision) -> Result<DispatchReport, DispatchError> {
        let subscribers = self.registry.list_active(None).await?;
        let mut reset = 0;
        for subscriber in &subscribers {
            if self
                .ledger
                .reset_failed(&decision.decision_id, &subscriber.subscriber_id)
                .await?
            {
                reset += 1;
            }
        }
        log::info!("🔄 Re-dispatching {}: {} failed deliveries reset", decision.decision_id, reset);

        self.dispatch(decision).await
    }

    async fn deliver(&self, subscriber: &Subscriber, decision: &Decision) -> DeliveryOutcome {
        let key = (decision.decision_id.clone(), subscriber.subscriber_id.clone());
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, key) else {
            return DeliveryOutcome::InFlight;
        };

        match self.run_delivery(subscriber, decision).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!(
                    "❌ Delivery ledger error for {} → {}: {}",
                    decision.decision_id,
                    subscriber.subscriber_id,
                    e
                );
                DeliveryOutcome::Error(e.to_string())
            }
        }
    }

    async fn run_delivery(
        &self,
        subscriber: &Subscriber,
        decision: &Decision,
    ) -> Result<DeliveryOutcome, StoreError> {
        let decision_id = decision.decision_id.as_str();
        let subscriber_id = subscriber.subscriber_id.as_str();

        let mut record = self.ledger.begin(decision_id, subscriber_id, (self.now_fn)()).await?;
        if record.status.is_terminal() {
            return Ok(DeliveryOutcome::AlreadyComplete(record.status));
        }

        let policy = self.policy_for(decision.alert_level);
        if policy.exhausted(record.attempts) {
            let error = format!("retry ceiling {} already reached", policy.ceiling);
            let record = self
                .ledger
                .mark_failed(decision_id, subscriber_id, &error, (self.now_fn)())
                .await?;
            self.raise_delivery_failed(subscriber, decision, &error).await;
            return Ok(DeliveryOutcome::Failed {
                attempts: record.attempts,
                error,
            });
        }

        let lane = self.lane_for(decision.alert_level);
        let mut backoff = policy.backoff().starting_at(record.attempts);

        loop {
            let result = {
                let _permit = lane
                    .acquire()
                    .await
                    .map_err(|_| StoreError::Corrupt("dispatch lane closed".to_string()))?;
                match self.transports.get(subscriber.channel) {
                    Some(transport) => transport.send(subscriber, decision).await,
                    None => Err(TransportError::Permanent(format!(
                        "no transport configured for channel {}",
                        subscriber.channel
                    ))),
                }
            };

            let outcome = match result {
                Ok(()) => AttemptOutcome::Sent,
                Err(TransportError::Permanent(e)) => AttemptOutcome::Failed(e),
                Err(TransportError::Transient(e)) if policy.exhausted(record.attempts + 1) => {
                    AttemptOutcome::Failed(format!("retry ceiling reached: {}", e))
                }
                Err(TransportError::Transient(e)) => AttemptOutcome::Retry(e),
            };

            record = self
                .ledger
                .record_attempt(decision_id, subscriber_id, outcome, (self.now_fn)())
                .await?;

            match record.status {
                DeliveryStatus::Sent => {
                    log::debug!(
                        "📬 {} → {} ({}) sent after {} attempt(s)",
                        decision_id,
                        subscriber_id,
                        subscriber.channel,
                        record.attempts
                    );
                    return Ok(DeliveryOutcome::Delivered {
                        attempts: record.attempts,
                    });
                }
                DeliveryStatus::Failed => {
                    let error = record.last_error.clone().unwrap_or_default();
                    self.raise_delivery_failed(subscriber, decision, &error).await;
                    return Ok(DeliveryOutcome::Failed {
                        attempts: record.attempts,
                        error,
                    });
                }
                DeliveryStatus::Pending => {
                    log::warn!(
                        "⚠️  {} → {} attempt {}/{} failed: {}",
                        decision_id,
                        subscriber_id,
                        record.attempts,
                        policy.ceiling,
                        record.last_error.as_deref().unwrap_or("unknown error")
                    );
                    if backoff.sleep().await.is_err() {
                        let error = "retry ceiling reached".to_string();
                        let record = self
                            .ledger
                            .mark_failed(decision_id, subscriber_id, &error, (self.now_fn)())
                            .await?;
                        self.raise_delivery_failed(subscriber, decision, &error).await;
                        return Ok(DeliveryOutcome::Failed {
                            attempts: record.attempts,
                            error,
                        });
                    }
                }
            }
        }
    }

    async fn raise_delivery_failed(&self, subscriber: &Subscriber, decision: &Decision, error: &str) {
        log::error!(
            "❌ Delivery of {} (level {}) to {} via {} FAILED: {}",
            decision.decision_id,
            decision.alert_level,
            subscriber.subscriber_id,
            subscriber.channel,
            error
        );
        self.operator
            .raise(OperatorAlert {
                kind: OperatorAlertKind::DeliveryFailed,
                event_id: decision.event_id.clone(),
                decision_id: Some(decision.decision_id.clone()),
                subscriber_id: Some(subscriber.subscriber_id.clone()),
                alert_level: Some(decision.alert_level),
                message: format!(
                    "{} alert for {} not delivered to {} ({}): {}",
                    decision.alert_level.label(),
                    decision.event_id,
                    subscriber.subscriber_id,
                    subscriber.channel,
                    error
                ),
                raised_at: (self.now_fn)(),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::delivery::SqliteDeliveryLedger;
    use crate::dispatch::operator::ChannelOperatorSink;
    use crate::dispatch::subscribers::{Channel, SqliteSubscriberRegistry};
    use crate::dispatch::transport::Transport;
    use crate::fusion_core::db::Database;
    use crate::fusion_core::types::parse_modality_set;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Replays scripted results, then succeeds
    struct ScriptedTransport {
        channel: Channel,
        script: Mutex<VecDeque<Result<(), TransportError>>>,
        calls: AtomicU32,
    }

    impl ScriptedTransport {
        fn new(channel: Channel, script: Vec<Result<(), TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                channel,
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn always_transient(channel: Channel, n: usize) -> Arc<Self> {
            Self::new(
                channel,
                (0..n).map(|_| Err(TransportError::Transient("503".into()))).collect(),
            )
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn channel(&self) -> Channel {
            self.channel
        }

        async fn send(&self, _subscriber: &Subscriber, _decision: &Decision) -> Result<(), TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    fn fast_config() -> DispatchConfig {
        DispatchConfig {
            min_dispatch_level: AlertLevel::Concerning,
            max_parallel: 4,
            normal_retry: RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(4), 3).without_jitter(),
            urgent_retry: RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(2), 5).without_jitter(),
        }
    }

    fn decision(level: AlertLevel) -> Decision {
        let at = Utc.with_ymd_and_hms(2025, 10, 12, 9, 0, 0).unwrap();
        Decision {
            decision_id: "decision-evt-1".to_string(),
            event_id: "evt-1".to_string(),
            alert_level: level,
            reason: "test".to_string(),
            brief_description: "brief".to_string(),
            full_description: "full".to_string(),
            contributing_modalities: if level == AlertLevel::Normal {
                Default::default()
            } else {
                parse_modality_set("video").unwrap()
            },
            timestamp: at,
            decided_at: at,
        }
    }

    struct Harness {
        dispatcher: Dispatcher,
        registry: Arc<SqliteSubscriberRegistry>,
        ledger: Arc<SqliteDeliveryLedger>,
        alerts: tokio::sync::mpsc::UnboundedReceiver<OperatorAlert>,
    }

    fn harness(transports: TransportSet) -> Harness {
        let db = Database::open_in_memory().unwrap();
        let registry = Arc::new(SqliteSubscriberRegistry::new(db.clone()));
        let ledger = Arc::new(SqliteDeliveryLedger::new(db));
        let (sink, alerts) = ChannelOperatorSink::new();
        let dispatcher = Dispatcher::new(
            registry.clone(),
            ledger.clone(),
            transports,
            Arc::new(sink),
            fast_config(),
        );
        Harness {
            dispatcher,
            registry,
            ledger,
            alerts,
        }
    }

    #[tokio::test]
    async fn test_delivers_to_every_active_subscriber() {
        let push = ScriptedTransport::new(Channel::Push, vec![]);
        let chat = ScriptedTransport::new(Channel::ChatBot, vec![]);
        let h = harness(TransportSet::new().with(push.clone()).with(chat.clone()));

        h.registry.subscribe("p1", Channel::Push, Utc::now()).await.unwrap();
        h.registry.subscribe("c1", Channel::ChatBot, Utc::now()).await.unwrap();
        h.registry.subscribe("c2", Channel::ChatBot, Utc::now()).await.unwrap();
        h.registry.unsubscribe("c2", Utc::now()).await.unwrap();

        let report = h.dispatcher.dispatch(&decision(AlertLevel::Concerning)).await.unwrap();
        assert!(report.dispatched);
        assert_eq!(report.delivered(), 2);
        assert_eq!(push.calls(), 1);
        assert_eq!(chat.calls(), 1);

        // Inactive subscriber has no record
        assert!(h.ledger.get("decision-evt-1", "c2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_below_threshold_is_silent() {
        let push = ScriptedTransport::new(Channel::Push, vec![]);
        let h = harness(TransportSet::new().with(push.clone()));
        h.registry.subscribe("p1", Channel::Push, Utc::now()).await.unwrap();

        let report = h.dispatcher.dispatch(&decision(AlertLevel::Normal)).await.unwrap();
        assert!(!report.dispatched);
        assert_eq!(push.calls(), 0);
        assert!(h.ledger.records_for("decision-evt-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let push = ScriptedTransport::always_transient(Channel::Push, 2);
        let h = harness(TransportSet::new().with(push.clone()));
        h.registry.subscribe("p1", Channel::Push, Utc::now()).await.unwrap();

        let report = h.dispatcher.dispatch(&decision(AlertLevel::Concerning)).await.unwrap();
        assert_eq!(report.outcome_for("p1"), Some(&DeliveryOutcome::Delivered { attempts: 3 }));
        assert_eq!(push.calls(), 3);
    }

    #[tokio::test]
    async fn test_attempts_bounded_by_ceiling() {
        let push = ScriptedTransport::always_transient(Channel::Push, 100);
        let mut h = harness(TransportSet::new().with(push.clone()));
        h.registry.subscribe("p1", Channel::Push, Utc::now()).await.unwrap();

        let report = h.dispatcher.dispatch(&decision(AlertLevel::Concerning)).await.unwrap();
        assert!(matches!(report.outcome_for("p1"), Some(DeliveryOutcome::Failed { attempts: 3, .. })));
        assert_eq!(push.calls(), 3);

        let record = h.ledger.get("decision-evt-1", "p1").await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.attempts, 3);

        // A repeated dispatch makes no further transport calls
        let again = h.dispatcher.dispatch(&decision(AlertLevel::Concerning)).await.unwrap();
        assert_eq!(
            again.outcome_for("p1"),
            Some(&DeliveryOutcome::AlreadyComplete(DeliveryStatus::Failed))
        );
        assert_eq!(push.calls(), 3);

        let alert = h.alerts.recv().await.unwrap();
        assert_eq!(alert.kind, OperatorAlertKind::DeliveryFailed);
        assert_eq!(alert.subscriber_id.as_deref(), Some("p1"));
    }

    #[tokio::test]
    async fn test_urgent_policy_and_operator_alert() {
        let voice = ScriptedTransport::always_transient(Channel::Voice, 100);
        let mut h = harness(TransportSet::new().with(voice.clone()));
        h.registry.subscribe("v1", Channel::Voice, Utc::now()).await.unwrap();

        let report = h.dispatcher.dispatch(&decision(AlertLevel::Urgent)).await.unwrap();
        assert!(matches!(report.outcome_for("v1"), Some(DeliveryOutcome::Failed { attempts: 5, .. })));
        assert_eq!(voice.calls(), 5);

        let alert = h.alerts.recv().await.unwrap();
        assert!(alert.is_urgent());
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let push = ScriptedTransport::new(Channel::Push, vec![Err(TransportError::Permanent("410".into()))]);
        let h = harness(TransportSet::new().with(push.clone()));
        h.registry.subscribe("p1", Channel::Push, Utc::now()).await.unwrap();

        let report = h.dispatcher.dispatch(&decision(AlertLevel::Urgent)).await.unwrap();
        assert!(matches!(report.outcome_for("p1"), Some(DeliveryOutcome::Failed { attempts: 1, .. })));
        assert_eq!(push.calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_transport_is_permanent() {
        let h = harness(TransportSet::new());
        h.registry.subscribe("c1", Channel::ChatBot, Utc::now()).await.unwrap();

        let report = h.dispatcher.dispatch(&decision(AlertLevel::Concerning)).await.unwrap();
        match report.outcome_for("c1") {
            Some(DeliveryOutcome::Failed { attempts, error }) => {
                assert_eq!(*attempts, 1);
                assert!(error.contains("no transport"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_one_failing_subscriber_does_not_block_others() {
        let push = ScriptedTransport::new(Channel::Push, vec![Err(TransportError::Permanent("404".into()))]);
        let chat = ScriptedTransport::new(Channel::ChatBot, vec![]);
        let h = harness(TransportSet::new().with(push).with(chat));
        h.registry.subscribe("p1", Channel::Push, Utc::now()).await.unwrap();
        h.registry.subscribe("c1", Channel::ChatBot, Utc::now()).await.unwrap();

        let report = h.dispatcher.dispatch(&decision(AlertLevel::Urgent)).await.unwrap();
        assert_eq!(report.delivered(), 1);
        assert_eq!(report.failed(), 1);
    }

    #[tokio::test]
    async fn test_redispatch_failed() {
        let push = ScriptedTransport::new(Channel::Push, vec![Err(TransportError::Permanent("401".into()))]);
        let h = harness(TransportSet::new().with(push.clone()));
        h.registry.subscribe("p1", Channel::Push, Utc::now()).await.unwrap();

        let d = decision(AlertLevel::Urgent);
        let first = h.dispatcher.dispatch(&d).await.unwrap();
        assert_eq!(first.failed(), 1);

        let second = h.dispatcher.redispatch_failed(&d).await.unwrap();
        assert_eq!(second.outcome_for("p1"), Some(&DeliveryOutcome::Delivered { attempts: 1 }));
        assert_eq!(push.calls(), 2);
    }
}
