//! Dispatch - Subscriber Fan-Out With Tracked Delivery
//!
//! ```text
//! Decision
//!     ↓
//! Dispatcher (min level gate, lane per urgency)
//!     ↓  one task per active subscriber
//! DeliveryLedger (PENDING → SENT | FAILED, attempts ≤ ceiling)
//!     ↓
//! Transport (push webhook | voice webhook | chat bot)
//! ```
//!
//! Delivery failures that exhaust their budget surface through an
//! `OperatorAlertSink` rather than being dropped.

pub mod backoff;
pub mod delivery;
pub mod dispatcher;
pub mod messages;
pub mod operator;
pub mod subscribers;
pub mod transport;

pub use backoff::{ExponentialBackoff, RetryPolicy};
pub use delivery::{AttemptOutcome, DeliveryLedger, DeliveryRecord, DeliveryStatus, SqliteDeliveryLedger};
pub use dispatcher::{DeliveryOutcome, DispatchConfig, DispatchError, DispatchReport, Dispatcher};
pub use operator::{
    ChannelOperatorSink, LogOperatorSink, OperatorAlert, OperatorAlertKind, OperatorAlertSink,
};
pub use subscribers::{Channel, SqliteSubscriberRegistry, Subscriber, SubscriberRegistry};
pub use transport::{
    ChatBotTransport, PushWebhookTransport, Transport, TransportError, TransportSet, VoiceTransport,
};
