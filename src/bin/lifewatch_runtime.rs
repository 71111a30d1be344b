//! LifeWatch Runtime - fusion, decision and dispatch service
//!
//! This binary wires the monitor together:
//! - Opens the SQLite database and applies the schema
//! - Registers configured transports and seed subscribers
//! - Tails the finding spool written by the perception pipelines, resuming
//!   from the position saved by the previous run
//! - Runs ingestion (store, sweep, decide, dispatch) until Ctrl-C
//!
//! Usage:
//!   cargo run --release --bin lifewatch_runtime
//!
//! Environment variables (see `MonitorConfig::from_env` for the full list):
//!   LIFEWATCH_DB_PATH - SQLite database path (default: lifewatch.db)
//!   FINDING_SPOOL_PATH - JSONL spool to tail (default: spool/findings.jsonl)
//!   PUSH_WEBHOOK_URL / VOICE_WEBHOOK_URL / TELEGRAM_TOKEN - enable transports
//!   RUST_LOG - log filter (default: info)

use dotenv::dotenv;
use lifewatch::config::MonitorConfig;
use lifewatch::dispatch::{
    ChatBotTransport, Dispatcher, LogOperatorSink, OperatorAlertSink, PushWebhookTransport,
    SqliteDeliveryLedger, SqliteSubscriberRegistry, SubscriberRegistry, TransportSet, VoiceTransport,
};
use lifewatch::fusion_core::{join_modalities, Database, DecisionEngine, SqliteSignalStore};
use lifewatch::pipeline::{
    start_ingestion, FindingProducer, MonitorEngine, SpoolCheckpointStore, SpoolProducer, SpoolTailReader,
    StartPosition,
};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = MonitorConfig::from_env();

    info!("🚀 LifeWatch Runtime");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Spool: {}", config.spool_path);
    info!("   ├─ Expected modalities: {}", join_modalities(&config.expected_modalities));
    info!("   ├─ Grace period: {}s", config.grace_period_secs);
    info!(
        "   ├─ Thresholds: emergency {:.2} / medium {:.2} / borderline {:.2} / repeat {}",
        config.emergency_threshold,
        config.medium_threshold,
        config.borderline_threshold,
        config.repeated_concern_count
    );
    info!("   └─ Min dispatch level: {}", config.min_dispatch_level);

    // Database
    let db = Database::open(&config.db_path)?;
    let store = Arc::new(SqliteSignalStore::new(
        db.clone(),
        config.expected_modalities.clone(),
        config.grace_period(),
    ));
    let registry = Arc::new(SqliteSubscriberRegistry::new(db.clone()));
    let checkpoints = SpoolCheckpointStore::new(db.clone());
    let ledger = Arc::new(SqliteDeliveryLedger::new(db));
    let operator: Arc<dyn OperatorAlertSink> = Arc::new(LogOperatorSink);
    info!("✅ Stores initialized");

    // Transports
    let transports = build_transports(&config)?;
    if transports.is_empty() {
        warn!("⚠️  No transports configured, alerts will be recorded as FAILED");
    } else {
        info!("✅ Transports: {:?}", transports.channels());
    }

    for (channel, subscriber_id) in &config.seed_subscribers {
        registry.subscribe(subscriber_id, *channel, chrono::Utc::now()).await?;
        info!("   ├─ Seeded subscriber {} ({})", subscriber_id, channel);
    }

    let engine = Arc::new(MonitorEngine::new(
        store.clone(),
        store,
        DecisionEngine::new(config.thresholds()),
        operator.clone(),
        config.engine_config(),
    ));
    let dispatcher = Dispatcher::new(registry, ledger, transports, operator, config.dispatch_config());
    info!("✅ MonitorEngine and Dispatcher created");

    // Spool producer
    let spool_path = PathBuf::from(&config.spool_path);
    ensure_spool(&spool_path).await?;
    let (tx, rx) = mpsc::channel(config.channel_buffer);

    // End applies only to the first run; later runs resume from the saved checkpoint
    let mut producer = SpoolProducer::new(SpoolTailReader::new(spool_path, StartPosition::End))
        .with_checkpoints(checkpoints);
    let producer_handle = tokio::spawn(async move {
        info!("🚀 Starting {} producer", producer.name());
        if let Err(e) = producer.run(tx).await {
            error!("❌ Finding producer failed: {}", e);
        }
    });

    let mut ingestion_handle = tokio::spawn(start_ingestion(
        rx,
        engine,
        dispatcher,
        config.ingestion_config(),
    ));

    info!("✅ LifeWatch running (Ctrl-C to stop)");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("❌ Failed to listen for shutdown signal: {}", e);
            }
            info!("🛑 Shutdown requested");
            // Dropping the producer closes the channel; ingestion drains and flushes
            producer_handle.abort();
            match ingestion_handle.await {
                Ok(stats) => info!("✅ Ingestion finished: {:?}", stats),
                Err(e) => error!("❌ Ingestion task failed: {}", e),
            }
        }
        result = &mut ingestion_handle => {
            match result {
                Ok(stats) => warn!("⚠️  Ingestion stopped unexpectedly: {:?}", stats),
                Err(e) => error!("❌ Ingestion task failed: {}", e),
            }
        }
    }

    info!("✅ LifeWatch Runtime stopped");
    Ok(())
}

fn build_transports(config: &MonitorConfig) -> Result<TransportSet, Box<dyn std::error::Error>> {
    let mut transports = TransportSet::new();

    if let Some(url) = &config.push_webhook_url {
        transports.insert(Arc::new(PushWebhookTransport::new(url)?));
    }
    if let Some(url) = &config.voice_webhook_url {
        transports.insert(Arc::new(VoiceTransport::new(url)?));
    }
    if let Some(token) = &config.telegram_token {
        transports.insert(Arc::new(ChatBotTransport::new(&config.telegram_api_base, token)?));
    }
    Ok(transports)
}

/// Create the spool and its directory so the tail reader can open it
async fn ensure_spool(path: &PathBuf) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    Ok(())
}
