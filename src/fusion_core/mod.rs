//! Fusion Core - Multi-Modality Correlation and Alert Decisions
//!
//! Perception pipelines (video, audio, reasoning) report findings for a shared
//! `event_id`. This module correlates them per event window and turns each
//! completed window into exactly one decision.
//!
//! # Architecture
//!
//! ```text
//! ModalityFinding (video | audio | reasoning)
//!     ↓
//! SignalStore (per-window upsert, OPEN → READY compare-and-set)
//!     ↓
//! FusionEngine (indicator union, max confidence, missing modalities)
//!     ↓
//! DecisionEngine (rules + ContextRetriever history)
//!     ↓
//! SignalStore::record_decision (create-if-absent, READY → DECIDED)
//! ```
//!
//! ## Schema Reference
//!
//! Tables live in `/sql/`:
//! - `event_windows` → `EventWindow`
//! - `modality_findings` → `ModalityFinding`
//! - `decisions` → `Decision` / `HistoricalRecord`

pub mod context;
pub mod db;
pub mod decision;
pub mod error;
pub mod fusion;
pub mod reasoning;
pub mod signal_store;
pub mod types;

pub use context::{count_concerning, format_context, ContextConfig, ContextRetriever};
pub use db::Database;
pub use decision::{DecisionEngine, DecisionRule, DecisionThresholds};
pub use error::{StoreError, ValidationError};
pub use fusion::{FusedIndicator, FusedSignal, FusionEngine};
pub use reasoning::KeywordAssessor;
pub use signal_store::{SignalStore, SqliteSignalStore};
pub use types::{
    join_modalities, parse_modality_set, system_clock, AlertLevel, Clock, Decision, EventWindow, HistoricalRecord, Modality,
    ModalityFinding, SeverityIndicator, WindowSnapshot, WindowStatus, WindowUpdate,
};
