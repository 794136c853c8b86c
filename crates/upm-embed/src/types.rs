//! Cache rules, namespaces, embed status values and analytics records.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Prefix shared by every versioned namespace this application owns.
pub const CACHE_PREFIX: &str = "upm-embed-";

/// Dedicated, unversioned namespace holding offline-queued telemetry.
pub const ANALYTICS_QUEUE_NAMESPACE: &str = "upm-analytics-queue";

/// Default cache version suffix.
pub const DEFAULT_CACHE_VERSION: &str = "v2";

/// Background-sync tag that replays queued analytics.
pub const ANALYTICS_SYNC_TAG: &str = "analytics-sync";

/// Periodic-sync tag that sweeps aged runtime entries.
pub const CACHE_CLEANUP_TAG: &str = "cache-cleanup";

/// Analytics batch endpoint path.
pub const ANALYTICS_BATCH_PATH: &str = "/api/embeds/analytics/batch";

/// Attribute marking an element as an embed placeholder.
pub const EMBED_ID_ATTR: &str = "data-embed-id";

/// Attribute reflecting the embed load state back onto its container.
pub const LOAD_STATE_ATTR: &str = "data-loaded";

/// Class added to containers while the page is offline.
pub const OFFLINE_CLASS: &str = "offline-mode";

/// DOM id of the container for an embed.
pub fn container_id(embed_id: &str) -> String {
    format!("upm-embed-{embed_id}")
}

/// Content endpoint path for an embed.
pub fn embed_content_path(embed_id: &str) -> String {
    format!("/embed/{embed_id}")
}

/// Gesture telemetry endpoint path for an embed.
pub fn gesture_path(embed_id: &str) -> String {
    format!("/api/embeds/{embed_id}/gesture")
}

// ── Namespaces ───────────────────────────────────────

/// Logical role of a versioned namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheRole {
    /// Pre-populated at install, written by cache-first resolution.
    Static,
    /// Written by network-first and stale-while-revalidate resolution.
    Runtime,
}

/// A named, versioned key→response store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheNamespace {
    pub role: CacheRole,
    pub version: String,
}

impl CacheNamespace {
    pub fn new(role: CacheRole, version: impl Into<String>) -> Self {
        Self {
            role,
            version: version.into(),
        }
    }

    /// Storage name: `upm-embed-v2` or `upm-embed-runtime-v2`.
    pub fn name(&self) -> String {
        match self.role {
            CacheRole::Static => format!("{CACHE_PREFIX}{}", self.version),
            CacheRole::Runtime => format!("{CACHE_PREFIX}runtime-{}", self.version),
        }
    }
}

/// The pair of namespaces that are current for one cache version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceSet {
    pub static_assets: CacheNamespace,
    pub runtime: CacheNamespace,
}

impl NamespaceSet {
    pub fn for_version(version: &str) -> Self {
        Self {
            static_assets: CacheNamespace::new(CacheRole::Static, version),
            runtime: CacheNamespace::new(CacheRole::Runtime, version),
        }
    }

    /// True when `name` carries the application prefix but is not current.
    pub fn is_stale(&self, name: &str) -> bool {
        name.starts_with(CACHE_PREFIX)
            && name != self.static_assets.name()
            && name != self.runtime.name()
    }
}

// ── Strategies and rules ─────────────────────────────

/// Request→response resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    #[default]
    #[serde(alias = "networkFirst")]
    NetworkFirst,
    #[serde(alias = "cacheFirst")]
    CacheFirst,
    #[serde(alias = "staleWhileRevalidate")]
    StaleWhileRevalidate,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetworkFirst => "network-first",
            Self::CacheFirst => "cache-first",
            Self::StaleWhileRevalidate => "stale-while-revalidate",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "network-first" | "networkFirst" => Ok(Self::NetworkFirst),
            "cache-first" | "cacheFirst" => Ok(Self::CacheFirst),
            "stale-while-revalidate" | "staleWhileRevalidate" => Ok(Self::StaleWhileRevalidate),
            other => Err(ParseError::UnknownStrategy(other.to_string())),
        }
    }
}

/// A URL substring pattern bound to a strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRule {
    pub url_pattern: String,
    pub strategy: Strategy,
}

impl CacheRule {
    pub fn new(url_pattern: impl Into<String>, strategy: Strategy) -> Self {
        Self {
            url_pattern: url_pattern.into(),
            strategy,
        }
    }

    pub fn matches(&self, url: &str) -> bool {
        url.contains(&self.url_pattern)
    }
}

/// Ordered rule list; the first matching pattern wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleSet {
    rules: Vec<CacheRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<CacheRule>) -> Self {
        Self { rules }
    }

    /// Strategy for `url`, defaulting to network-first.
    pub fn strategy_for(&self, url: &str) -> Strategy {
        self.rules
            .iter()
            .find(|rule| rule.matches(url))
            .map(|rule| rule.strategy)
            .unwrap_or_default()
    }

    pub fn rules(&self) -> &[CacheRule] {
        &self.rules
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        let table: [(Strategy, &[&str]); 3] = [
            (Strategy::NetworkFirst, &["/api/", "/embed/"]),
            (
                Strategy::CacheFirst,
                &["/static/", ".js", ".css", ".woff", ".woff2"],
            ),
            (Strategy::StaleWhileRevalidate, &[".json", "/metadata/"]),
        ];
        let rules = table
            .iter()
            .flat_map(|(strategy, patterns)| {
                patterns
                    .iter()
                    .map(move |pattern| CacheRule::new(*pattern, *strategy))
            })
            .collect();
        Self { rules }
    }
}

// ── Embed status ─────────────────────────────────────

/// Lifecycle status of an embed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedStatus {
    Unloaded,
    Loading,
    Loaded,
    Error,
}

impl EmbedStatus {
    /// Whether the record counts against the concurrency cap.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Loading | Self::Loaded)
    }

    /// Value reflected onto the container's load attribute.
    pub fn load_attr(self) -> LoadAttr {
        match self {
            Self::Unloaded => LoadAttr::False,
            Self::Loading => LoadAttr::Loading,
            Self::Loaded => LoadAttr::True,
            Self::Error => LoadAttr::Error,
        }
    }
}

/// Values of the container load attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadAttr {
    Loading,
    True,
    Error,
    False,
}

impl LoadAttr {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::True => "true",
            Self::Error => "error",
            Self::False => "false",
        }
    }
}

impl FromStr for LoadAttr {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "loading" => Ok(Self::Loading),
            "true" => Ok(Self::True),
            "error" => Ok(Self::Error),
            "false" => Ok(Self::False),
            other => Err(ParseError::UnknownLoadState(other.to_string())),
        }
    }
}

// ── Analytics ────────────────────────────────────────

/// One tracked interaction. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    #[serde(rename = "embedId")]
    pub embed_id: String,
    #[serde(rename = "event")]
    pub event_type: String,
    #[serde(rename = "data")]
    pub payload: serde_json::Value,
    pub timestamp: u64,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "page")]
    pub page_url: String,
}

/// Body of `POST /api/embeds/analytics/batch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsBatch {
    pub events: Vec<AnalyticsEvent>,
}
