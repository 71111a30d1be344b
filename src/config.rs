//! Runtime configuration from environment variables
//!
//! Every key is optional. Unparseable or out-of-range values fall back to
//! the default (durations are capped instead) with a warning instead of
//! aborting startup.

use crate::dispatch::{Channel, DispatchConfig, RetryPolicy};
use crate::fusion_core::decision::{DecisionThresholds, DEFAULT_EMERGENCY_TAGS};
use crate::fusion_core::types::{parse_modality_set, AlertLevel, Modality};
use crate::fusion_core::ContextConfig;
use crate::pipeline::{EngineConfig, IngestionConfig};
use std::collections::BTreeSet;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Cap for second-valued durations (one week)
const MAX_DURATION_SECS: u64 = 7 * 24 * 3_600;
/// Cap for timer intervals (one day)
const MAX_INTERVAL_MS: u64 = 24 * 3_600 * 1_000;

/// Configuration for the monitor runtime
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// JSONL spool the perception pipelines append findings to
    pub spool_path: String,

    /// Channel buffer size for finding ingestion
    pub channel_buffer: usize,

    pub grace_period_secs: u64,
    pub sweep_interval_ms: u64,
    /// READY windows still undecided after this age are expired
    pub max_window_age_secs: u64,
    pub expected_modalities: BTreeSet<Modality>,

    pub emergency_threshold: f64,
    pub medium_threshold: f64,
    pub borderline_threshold: f64,
    pub repeated_concern_count: usize,
    pub emergency_tags: BTreeSet<String>,

    pub context_lookback_secs: u64,
    pub context_max_items: usize,

    pub min_dispatch_level: AlertLevel,
    pub dispatch_max_parallel: usize,
    pub batch_interval_ms: u64,

    pub retry_ceiling: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub urgent_retry_ceiling: u32,
    pub urgent_retry_base_ms: u64,
    pub urgent_retry_max_ms: u64,

    pub push_webhook_url: Option<String>,
    pub voice_webhook_url: Option<String>,
    pub telegram_token: Option<String>,
    pub telegram_api_base: String,

    /// Subscribers registered at startup, `channel:id` pairs
    pub seed_subscribers: Vec<(Channel, String)>,
}

impl MonitorConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables (defaults in parentheses):
    /// - `LIFEWATCH_DB_PATH` (lifewatch.db)
    /// - `FINDING_SPOOL_PATH` (spool/findings.jsonl)
    /// - `CHANNEL_BUFFER` (1000)
    /// - `GRACE_PERIOD_SECS` (45), `SWEEP_INTERVAL_MS` (5000), `MAX_WINDOW_AGE_SECS` (600)
    /// - `EXPECTED_MODALITIES` (video,audio)
    /// - `EMERGENCY_THRESHOLD` (0.95), `MEDIUM_THRESHOLD` (0.6), `BORDERLINE_THRESHOLD` (0.3)
    /// - `REPEATED_CONCERN_COUNT` (3), `EMERGENCY_TAGS` (emergency,emergency_keyword,...)
    /// - `CONTEXT_LOOKBACK_SECS` (3600), `CONTEXT_MAX_ITEMS` (10)
    /// - `MIN_DISPATCH_LEVEL` (1), `DISPATCH_MAX_PARALLEL` (8), `BATCH_INTERVAL_MS` (10000)
    /// - `RETRY_CEILING` (5), `RETRY_BASE_MS` (1000), `RETRY_MAX_MS` (60000)
    /// - `URGENT_RETRY_CEILING` (8), `URGENT_RETRY_BASE_MS` (250), `URGENT_RETRY_MAX_MS` (5000)
    /// - `PUSH_WEBHOOK_URL`, `VOICE_WEBHOOK_URL`, `TELEGRAM_TOKEN` (unset)
    /// - `TELEGRAM_API_BASE` (https://api.telegram.org)
    /// - `SEED_SUBSCRIBERS` (unset), e.g. `chat-bot:123,push:dev-1`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (tests pass a map instead of the
    /// process environment)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let expected_modalities = get("EXPECTED_MODALITIES")
            .and_then(|raw| match parse_modality_set(&raw) {
                Ok(set) if !set.is_empty() => Some(set),
                Ok(_) => None,
                Err(e) => {
                    log::warn!("⚠️  Ignoring EXPECTED_MODALITIES={}: {}", raw, e);
                    None
                }
            })
            .unwrap_or_else(|| [Modality::Video, Modality::Audio].into_iter().collect());

        let emergency_tags = get("EMERGENCY_TAGS")
            .map(|raw| {
                raw.split(',')
                    .map(|t| t.trim().to_ascii_lowercase())
                    .filter(|t| !t.is_empty())
                    .collect::<BTreeSet<_>>()
            })
            .filter(|tags| !tags.is_empty())
            .unwrap_or_else(|| DEFAULT_EMERGENCY_TAGS.iter().map(|t| t.to_string()).collect());

        let (emergency_threshold, medium_threshold, borderline_threshold) = parse_thresholds(&get);

        let min_dispatch_level = get("MIN_DISPATCH_LEVEL")
            .and_then(|raw| raw.parse::<u8>().ok())
            .and_then(|level| AlertLevel::try_from(level).ok())
            .unwrap_or(AlertLevel::Concerning);

        Self {
            db_path: get("LIFEWATCH_DB_PATH").unwrap_or_else(|| "lifewatch.db".to_string()),
            spool_path: get("FINDING_SPOOL_PATH").unwrap_or_else(|| "spool/findings.jsonl".to_string()),
            channel_buffer: parse_or(&get, "CHANNEL_BUFFER", 1_000),

            grace_period_secs: parse_capped(&get, "GRACE_PERIOD_SECS", 45, MAX_DURATION_SECS),
            sweep_interval_ms: parse_capped(&get, "SWEEP_INTERVAL_MS", 5_000, MAX_INTERVAL_MS),
            max_window_age_secs: parse_capped(&get, "MAX_WINDOW_AGE_SECS", 600, MAX_DURATION_SECS),
            expected_modalities,

            emergency_threshold,
            medium_threshold,
            borderline_threshold,
            repeated_concern_count: parse_or(&get, "REPEATED_CONCERN_COUNT", 3),
            emergency_tags,

            context_lookback_secs: parse_capped(&get, "CONTEXT_LOOKBACK_SECS", 3_600, MAX_DURATION_SECS),
            context_max_items: parse_or(&get, "CONTEXT_MAX_ITEMS", 10),

            min_dispatch_level,
            dispatch_max_parallel: parse_or(&get, "DISPATCH_MAX_PARALLEL", 8),
            batch_interval_ms: parse_capped(&get, "BATCH_INTERVAL_MS", 10_000, MAX_INTERVAL_MS),

            retry_ceiling: parse_or(&get, "RETRY_CEILING", 5),
            retry_base_ms: parse_or(&get, "RETRY_BASE_MS", 1_000),
            retry_max_ms: parse_or(&get, "RETRY_MAX_MS", 60_000),
            urgent_retry_ceiling: parse_or(&get, "URGENT_RETRY_CEILING", 8),
            urgent_retry_base_ms: parse_or(&get, "URGENT_RETRY_BASE_MS", 250),
            urgent_retry_max_ms: parse_or(&get, "URGENT_RETRY_MAX_MS", 5_000),

            push_webhook_url: get("PUSH_WEBHOOK_URL"),
            voice_webhook_url: get("VOICE_WEBHOOK_URL"),
            telegram_token: get("TELEGRAM_TOKEN"),
            telegram_api_base: get("TELEGRAM_API_BASE")
                .unwrap_or_else(|| "https://api.telegram.org".to_string()),

            seed_subscribers: get("SEED_SUBSCRIBERS")
                .map(|raw| parse_seed_subscribers(&raw))
                .unwrap_or_default(),
        }
    }

    pub fn grace_period(&self) -> chrono::Duration {
        capped_seconds(self.grace_period_secs)
    }

    pub fn max_window_age(&self) -> chrono::Duration {
        capped_seconds(self.max_window_age_secs)
    }

    pub fn thresholds(&self) -> DecisionThresholds {
        DecisionThresholds {
            emergency: self.emergency_threshold,
            medium: self.medium_threshold,
            borderline: self.borderline_threshold,
            repeated_concern_count: self.repeated_concern_count,
            emergency_tags: self.emergency_tags.clone(),
        }
    }

    pub fn context_config(&self) -> ContextConfig {
        ContextConfig {
            lookback: capped_seconds(self.context_lookback_secs),
            max_items: self.context_max_items,
        }
    }

    /// Undecided READY windows are retried once a sweep interval has passed
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            context: self.context_config(),
            max_window_age: self.max_window_age(),
            retry_ready_after: chrono::Duration::milliseconds(self.sweep_interval_ms.min(MAX_INTERVAL_MS) as i64),
        }
    }

    pub fn ingestion_config(&self) -> IngestionConfig {
        IngestionConfig {
            sweep_interval: Duration::from_millis(self.sweep_interval_ms.clamp(1, MAX_INTERVAL_MS)),
            batch_interval: Duration::from_millis(self.batch_interval_ms.clamp(1, MAX_INTERVAL_MS)),
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            min_dispatch_level: self.min_dispatch_level,
            max_parallel: self.dispatch_max_parallel,
            normal_retry: RetryPolicy::new(
                Duration::from_millis(self.retry_base_ms),
                Duration::from_millis(self.retry_max_ms),
                self.retry_ceiling,
            ),
            urgent_retry: RetryPolicy::new(
                Duration::from_millis(self.urgent_retry_base_ms),
                Duration::from_millis(self.urgent_retry_max_ms),
                self.urgent_retry_ceiling,
            ),
        }
    }
}

fn parse_or<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match get(key) {
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("⚠️  Ignoring unparseable {}={}", key, raw);
                default
            }
        },
        None => default,
    }
}

fn parse_capped(get: &impl Fn(&str) -> Option<String>, key: &str, default: u64, max: u64) -> u64 {
    let value = parse_or(get, key, default);
    if value > max {
        log::warn!("⚠️  Capping {}={} at {}", key, value, max);
        return max;
    }
    value
}

fn capped_seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

fn parse_threshold(get: &impl Fn(&str) -> Option<String>, key: &str, default: f64) -> f64 {
    let value = parse_or(get, key, default);
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        value
    } else {
        log::warn!("⚠️  Ignoring {}={}: must be within [0, 1]", key, value);
        default
    }
}

/// Returns (emergency, medium, borderline); an inverted set falls back as a whole
fn parse_thresholds(get: &impl Fn(&str) -> Option<String>) -> (f64, f64, f64) {
    let defaults = (0.95, 0.6, 0.3);
    let emergency = parse_threshold(get, "EMERGENCY_THRESHOLD", defaults.0);
    let medium = parse_threshold(get, "MEDIUM_THRESHOLD", defaults.1);
    let borderline = parse_threshold(get, "BORDERLINE_THRESHOLD", defaults.2);

    if borderline <= medium && medium <= emergency {
        (emergency, medium, borderline)
    } else {
        log::warn!(
            "⚠️  Ignoring thresholds emergency {} / medium {} / borderline {}: need borderline <= medium <= emergency",
            emergency,
            medium,
            borderline
        );
        defaults
    }
}

fn parse_seed_subscribers(raw: &str) -> Vec<(Channel, String)> {
    raw.split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            let Some((channel, id)) = entry.split_once(':') else {
                log::warn!("⚠️  Ignoring seed subscriber without channel: {}", entry);
                return None;
            };
            match channel.parse::<Channel>() {
                Ok(channel) if !id.trim().is_empty() => Some((channel, id.trim().to_string())),
                _ => {
                    log::warn!("⚠️  Ignoring seed subscriber: {}", entry);
                    None
                }
            }
        })
        .collect()
}
