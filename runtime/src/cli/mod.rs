//! CLI subcommand implementations for the `upm-embed` binary.

pub mod cache_cmd;
pub mod output;
pub mod replay_cmd;
pub mod serve;

use std::sync::Arc;

use anyhow::Context;
use upm_embed::SystemClock;

use crate::config::RuntimeConfig;
use crate::events::EventBus;
use crate::intermediary::store::CacheStorage;
use crate::intermediary::Intermediary;
use crate::net::{HttpNetwork, Network};

/// Open the cache database and build an intermediary over the real network.
pub fn open_intermediary(config: &RuntimeConfig, events: EventBus) -> anyhow::Result<Intermediary> {
    let db_path = config.intermediary.cache_db_path();
    let store = CacheStorage::open(&db_path, Arc::new(SystemClock))
        .with_context(|| format!("opening cache database {}", db_path.display()))?;
    let network: Arc<dyn Network> =
        Arc::new(HttpNetwork::new(config.intermediary.request_timeout_ms).with_retries(1));
    Intermediary::new(config.intermediary.clone(), Arc::new(store), network, events)
        .context("invalid intermediary configuration")
}
