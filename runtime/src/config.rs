//! Runtime configuration.
//!
//! Defaults match the embed loader's built-in settings. A JSON file passed
//! with `--config` overrides them, then `UPM_*` environment variables
//! override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use upm_embed::{GestureThresholds, NamespaceSet, RuleSet, ANALYTICS_BATCH_PATH};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub intermediary: IntermediaryConfig,
    pub host: HostConfig,
    pub analytics: AnalyticsConfig,
    pub gesture: GestureConfig,
    pub maintenance: MaintenanceSettings,
}

/// Network intermediary settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntermediaryConfig {
    /// Origin that relative paths resolve against and the proxy forwards to.
    pub origin: String,
    pub cache_version: String,
    /// SQLite file. `None` means `~/.upm-embed/cache.db`.
    pub cache_db: Option<PathBuf>,
    /// Pre-populated into the static namespace on install.
    pub static_assets: Vec<String>,
    pub rules: RuleSet,
    pub offline_page: String,
    pub runtime_max_age_secs: u64,
    pub request_timeout_ms: u64,
}

impl Default for IntermediaryConfig {
    fn default() -> Self {
        Self {
            origin: "http://localhost:3000".to_string(),
            cache_version: upm_embed::DEFAULT_CACHE_VERSION.to_string(),
            cache_db: None,
            static_assets: vec![
                "/embed.js".to_string(),
                "/embed-styles.css".to_string(),
                "/immersive-embed.js".to_string(),
            ],
            rules: RuleSet::default(),
            offline_page: "/offline.html".to_string(),
            runtime_max_age_secs: 24 * 60 * 60,
            request_timeout_ms: 10_000,
        }
    }
}

impl IntermediaryConfig {
    pub fn namespaces(&self) -> NamespaceSet {
        NamespaceSet::for_version(&self.cache_version)
    }

    pub fn runtime_max_age(&self) -> Duration {
        Duration::from_secs(self.runtime_max_age_secs)
    }

    pub fn cache_db_path(&self) -> PathBuf {
        self.cache_db.clone().unwrap_or_else(default_cache_db)
    }
}

/// Embed lifecycle manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub max_embeds: usize,
    pub content_ttl_secs: u64,
    pub content_capacity: usize,
    /// Heap usage ratio above which memory is freed before a load.
    pub memory_threshold: f64,
    /// Content cache entries older than this are dropped by `free_memory`.
    pub memory_retain_secs: u64,
    pub inactive_after_secs: u64,
    pub memory_check_secs: u64,
    pub observe_debounce_ms: u64,
    pub click_debounce_ms: u64,
    pub use_workers: bool,
    pub worker_count: usize,
    pub enable_gestures: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_embeds: 50,
            content_ttl_secs: 300,
            content_capacity: 100,
            memory_threshold: 0.7,
            memory_retain_secs: 180,
            inactive_after_secs: 300,
            memory_check_secs: 30,
            observe_debounce_ms: 50,
            click_debounce_ms: 250,
            use_workers: true,
            worker_count: 1,
            enable_gestures: false,
        }
    }
}

/// Analytics batcher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// Path of the batch endpoint, relative to the origin.
    pub endpoint: String,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    /// `free_memory` flushes the queue when it holds more than this.
    pub overflow_flush: usize,
    pub page_url: String,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            endpoint: ANALYTICS_BATCH_PATH.to_string(),
            batch_size: 20,
            flush_interval_ms: 10_000,
            overflow_flush: 100,
            page_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GestureConfig {
    #[serde(flatten)]
    pub thresholds: GestureThresholds,
    /// POST recognized gestures to `/api/embeds/{id}/gesture`.
    pub forward: bool,
}

impl Default for GestureConfig {
    fn default() -> Self {
        Self {
            thresholds: GestureThresholds::default(),
            forward: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceSettings {
    pub tick_secs: u64,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self { tick_secs: 3600 }
    }
}

impl RuntimeConfig {
    /// Load from an optional JSON file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut cfg = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("reading config {}", p.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing config {}", p.display()))?
            }
            None => Self::default(),
        };
        cfg.apply_env();
        Ok(cfg)
    }

    /// Override fields from `UPM_*` environment variables.
    pub fn apply_env(&mut self) {
        let i = &mut self.intermediary;
        if let Some(origin) = read_env_string("UPM_ORIGIN") {
            i.origin = origin;
        }
        if let Some(version) = read_env_string("UPM_CACHE_VERSION") {
            i.cache_version = version;
        }
        if let Some(db) = read_env_string("UPM_CACHE_DB") {
            i.cache_db = Some(PathBuf::from(db));
        }
        i.runtime_max_age_secs = read_env_u64("UPM_RUNTIME_MAX_AGE_SECS", i.runtime_max_age_secs);
        i.request_timeout_ms = read_env_u64("UPM_REQUEST_TIMEOUT_MS", i.request_timeout_ms);

        let h = &mut self.host;
        h.max_embeds = read_env_usize("UPM_MAX_EMBEDS", h.max_embeds).max(1);
        h.worker_count = read_env_usize("UPM_WORKERS", h.worker_count);

        let a = &mut self.analytics;
        a.batch_size = read_env_usize("UPM_ANALYTICS_BATCH_SIZE", a.batch_size).max(1);
        a.flush_interval_ms = read_env_u64("UPM_ANALYTICS_FLUSH_MS", a.flush_interval_ms);

        self.maintenance.tick_secs =
            read_env_u64("UPM_MAINTENANCE_TICK_SECS", self.maintenance.tick_secs).max(1);
    }
}

pub fn default_cache_db() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".upm-embed")
        .join("cache.db")
}

fn read_env_u64(name: &str, default_value: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default_value)
}

fn read_env_usize(name: &str, default_value: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default_value)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
