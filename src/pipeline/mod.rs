//! Monitor pipeline - runtime orchestration around the fusion core
//!
//! ```text
//! FindingProducer (JSONL spool tail)
//!     ↓ mpsc
//! start_ingestion (select! over findings, sweep timer, batch timer)
//!     ↓
//! MonitorEngine (store → fuse → context → decide → record)
//!     ↓ created decisions only
//! Dispatcher (urgent immediately, the rest batched)
//! ```
//!
//! `CommandSurface` serves the chat front end from the same database.

pub mod checkpoint;
pub mod commands;
pub mod engine;
pub mod ingestion;
pub mod producer;

pub use checkpoint::{SpoolCheckpoint, SpoolCheckpointStore};
pub use commands::CommandSurface;
pub use engine::{EngineConfig, EngineError, MonitorEngine, SubmitOutcome, SweepReport};
pub use ingestion::{start_ingestion, IngestionConfig, IngestionStats};
pub use producer::{parse_spool_line, FindingProducer, ProducerError, SpoolProducer, SpoolTailReader, StartPosition};
