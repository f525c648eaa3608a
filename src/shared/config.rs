//! Application configuration. Paths, concurrency, retry and media knobs.
//!
//! Sources, later wins: optional file from `TG_INGEST_CONFIG`, then
//! `TG_INGEST_*` environment variables (a `.env` file is loaded first).

use crate::domain::{DomainError, ProcessingThresholds};
use crate::shared::retry::{RetryConfig, RetryStrategy};
use crate::shared::zero_copy::ZeroCopyConfig;
use crate::usecases::sync_service::RenderFailurePolicy;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BATCH_SIZE: usize = 100;
/// Batches buffered ahead of the consumers (double buffering).
pub const DEFAULT_QUEUE_SIZE: usize = 2;
pub const DEFAULT_CONSUMER_WORKERS: usize = 4;
pub const DEFAULT_FLUSH_EVERY: usize = 50;

#[derive(Debug, Deserialize, Default)]
pub struct AppConfig {
    pub data_dir: Option<String>,
    /// Archive read by the JSONL source. Defaults to `{data_dir}/export`.
    pub export_dir: Option<String>,
    pub notes_dir: Option<String>,
    pub media_dir: Option<String>,
    pub ledger_path: Option<String>,

    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub queue_size: Option<usize>,
    #[serde(default)]
    pub consumer_workers: Option<usize>,
    /// Media pool size. Defaults to the CPU count.
    #[serde(default)]
    pub media_workers: Option<usize>,

    #[serde(default)]
    pub media_enabled: Option<bool>,
    #[serde(default)]
    pub resume: Option<bool>,
    /// Attempts per media task before it is marked permanently failed.
    #[serde(default)]
    pub max_attempts: Option<u32>,

    // ─────────────────────────────────────────────────────────────────────────
    // Fetch retry
    // ─────────────────────────────────────────────────────────────────────────
    #[serde(default)]
    pub fetch_retry_strategy: Option<RetryStrategy>,
    #[serde(default)]
    pub fetch_max_attempts: Option<u32>,
    #[serde(default)]
    pub fetch_base_delay_ms: Option<u64>,
    #[serde(default)]
    pub fetch_max_delay_ms: Option<u64>,

    // ─────────────────────────────────────────────────────────────────────────
    // Ledger
    // ─────────────────────────────────────────────────────────────────────────
    #[serde(default)]
    pub save_debounce_ms: Option<u64>,
    /// New ledger entries between debounced saves.
    #[serde(default)]
    pub flush_every: Option<usize>,
    #[serde(default)]
    pub render_failure_policy: Option<RenderFailurePolicy>,

    // ─────────────────────────────────────────────────────────────────────────
    // Media
    // ─────────────────────────────────────────────────────────────────────────
    pub ffmpeg_path: Option<String>,
    pub ffprobe_path: Option<String>,
    /// false = always copy, never transcode.
    #[serde(default)]
    pub processing_enabled: Option<bool>,
    #[serde(default)]
    pub zero_copy_enabled: Option<bool>,
    #[serde(default)]
    pub zero_copy_min_bytes: Option<u64>,
    #[serde(default)]
    pub zero_copy_chunk_bytes: Option<usize>,

    /// Watch mode sleep between cycles (default 600).
    #[serde(default)]
    pub watcher_cycle_secs: Option<u64>,
    #[serde(default)]
    pub shutdown_grace_secs: Option<u64>,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenv::dotenv().ok();
        let mut c = config::Config::builder();
        if let Ok(path) = std::env::var("TG_INGEST_CONFIG") {
            c = c.add_source(config::File::with_name(&path));
        }
        c = c.add_source(
            config::Environment::with_prefix("TG_INGEST")
                .prefix_separator("_")
                .try_parsing(true),
        );
        c.build()?.try_deserialize()
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), DomainError> {
        let positive = [
            ("batch_size", self.batch_size),
            ("queue_size", self.queue_size),
            ("consumer_workers", self.consumer_workers),
            ("media_workers", self.media_workers),
            ("flush_every", self.flush_every),
        ];
        for (key, value) in positive {
            if value == Some(0) {
                return Err(DomainError::Config(format!("{} must be greater than 0", key)));
            }
        }
        if self.max_attempts == Some(0) || self.fetch_max_attempts == Some(0) {
            return Err(DomainError::Config("attempt limits must be greater than 0".into()));
        }
        if let (Some(base), Some(max)) = (self.fetch_base_delay_ms, self.fetch_max_delay_ms) {
            if base > max {
                return Err(DomainError::Config(format!(
                    "fetch_base_delay_ms ({}) exceeds fetch_max_delay_ms ({})",
                    base, max
                )));
            }
        }
        if self.media_dir_or_default() == self.staging_dir() {
            return Err(DomainError::Config(format!(
                "media_dir must differ from the staging directory {}",
                self.staging_dir().display()
            )));
        }
        Ok(())
    }

    pub fn data_dir_or_default(&self) -> PathBuf {
        PathBuf::from(self.data_dir.as_deref().unwrap_or("./data"))
    }

    fn under_data_dir(&self, value: &Option<String>, default: &str) -> PathBuf {
        value
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.data_dir_or_default().join(default))
    }

    pub fn export_dir_or_default(&self) -> PathBuf {
        self.under_data_dir(&self.export_dir, "export")
    }

    pub fn notes_dir_or_default(&self) -> PathBuf {
        self.under_data_dir(&self.notes_dir, "notes")
    }

    pub fn media_dir_or_default(&self) -> PathBuf {
        self.under_data_dir(&self.media_dir, "media")
    }

    /// Raw downloads waiting for the media pool.
    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir_or_default().join("staging")
    }

    pub fn ledger_path_or_default(&self) -> PathBuf {
        self.under_data_dir(&self.ledger_path, "ledger.json")
    }

    pub fn batch_size_or_default(&self) -> usize {
        self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE)
    }

    pub fn queue_size_or_default(&self) -> usize {
        self.queue_size.unwrap_or(DEFAULT_QUEUE_SIZE)
    }

    pub fn consumer_workers_or_default(&self) -> usize {
        self.consumer_workers.unwrap_or(DEFAULT_CONSUMER_WORKERS)
    }

    pub fn media_workers_or_default(&self) -> usize {
        self.media_workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
    }

    pub fn media_enabled_or_default(&self) -> bool {
        self.media_enabled.unwrap_or(true)
    }

    pub fn resume_or_default(&self) -> bool {
        self.resume.unwrap_or(true)
    }

    pub fn max_attempts_or_default(&self) -> u32 {
        self.max_attempts.unwrap_or(3)
    }

    pub fn flush_every_or_default(&self) -> usize {
        self.flush_every.unwrap_or(DEFAULT_FLUSH_EVERY)
    }

    pub fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms.unwrap_or(500))
    }

    pub fn render_failure_policy_or_default(&self) -> RenderFailurePolicy {
        self.render_failure_policy.unwrap_or_default()
    }

    pub fn ffmpeg_path_or_default(&self) -> String {
        self.ffmpeg_path.clone().unwrap_or_else(|| "ffmpeg".into())
    }

    pub fn ffprobe_path_or_default(&self) -> String {
        self.ffprobe_path.clone().unwrap_or_else(|| "ffprobe".into())
    }

    /// Returns watcher cycle sleep in seconds. Defaults to 600 if unset.
    pub fn watcher_cycle_secs_or_default(&self) -> u64 {
        self.watcher_cycle_secs.unwrap_or(600)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs.unwrap_or(30))
    }

    /// Retry settings for page fetches and chat lookups.
    pub fn fetch_retry(&self) -> RetryConfig {
        let defaults = RetryConfig::default();
        RetryConfig {
            strategy: self.fetch_retry_strategy.unwrap_or(defaults.strategy),
            max_attempts: self.fetch_max_attempts.unwrap_or(defaults.max_attempts),
            base_delay_ms: self.fetch_base_delay_ms.unwrap_or(defaults.base_delay_ms),
            max_delay_ms: self.fetch_max_delay_ms.unwrap_or(defaults.max_delay_ms),
            ..defaults
        }
    }

    pub fn thresholds(&self) -> ProcessingThresholds {
        ProcessingThresholds {
            enabled: self.processing_enabled.unwrap_or(true),
            ..Default::default()
        }
    }

    pub fn zero_copy(&self) -> ZeroCopyConfig {
        let defaults = ZeroCopyConfig::default();
        ZeroCopyConfig {
            fast_path_enabled: self.zero_copy_enabled.unwrap_or(defaults.fast_path_enabled),
            min_fast_path_bytes: self
                .zero_copy_min_bytes
                .unwrap_or(defaults.min_fast_path_bytes),
            chunk_size: self.zero_copy_chunk_bytes.unwrap_or(defaults.chunk_size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_json(raw: &str) -> AppConfig {
        config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Json))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn paths_default_under_data_dir() {
        let cfg = from_json(r#"{"data_dir": "/srv/archive", "notes_dir": "/vault"}"#);
        assert_eq!(cfg.ledger_path_or_default(), PathBuf::from("/srv/archive/ledger.json"));
        assert_eq!(cfg.export_dir_or_default(), PathBuf::from("/srv/archive/export"));
        assert_eq!(cfg.notes_dir_or_default(), PathBuf::from("/vault"));
        assert_eq!(cfg.queue_size_or_default(), 2);
        assert!(cfg.resume_or_default());
    }

    #[test]
    fn retry_and_policy_values_are_read() {
        let cfg = from_json(
            r#"{"fetch_retry_strategy": "adaptive", "fetch_max_attempts": 7,
                "fetch_base_delay_ms": 200, "render_failure_policy": "mark_processed",
                "processing_enabled": false}"#,
        );
        let retry = cfg.fetch_retry();
        assert_eq!(retry.strategy, RetryStrategy::Adaptive);
        assert_eq!(retry.max_attempts, 7);
        assert_eq!(retry.base_delay_ms, 200);
        assert_eq!(retry.max_delay_ms, RetryConfig::default().max_delay_ms);
        assert_eq!(
            cfg.render_failure_policy_or_default(),
            RenderFailurePolicy::MarkProcessed
        );
        assert!(!cfg.thresholds().enabled);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        assert!(from_json(r#"{"batch_size": 0}"#).validate().is_err());
        assert!(
            from_json(r#"{"fetch_base_delay_ms": 5000, "fetch_max_delay_ms": 10}"#)
                .validate()
                .is_err()
        );
        assert!(
            from_json(r#"{"data_dir": "/srv", "media_dir": "/srv/staging"}"#)
                .validate()
                .is_err()
        );
        assert!(from_json("{}").validate().is_ok());
    }
}
