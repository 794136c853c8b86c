//! Inspect and manage the cache namespaces.

use anyhow::{Context, Result};

use crate::cli::output::{self, Styled};
use crate::config::RuntimeConfig;
use crate::events::EventBus;

/// Print every namespace with its entry count.
pub async fn run_status(config: &RuntimeConfig) -> Result<()> {
    let intermediary = super::open_intermediary(config, EventBus::default())?;
    let status = intermediary.status().await.context("reading cache status")?;
    let total: usize = status.values().sum();

    if output::is_json() {
        output::print_json(&serde_json::json!({
            "namespaces": status,
            "total": total,
        }));
        return Ok(());
    }

    if status.is_empty() {
        println!("  No cache namespaces.");
        return Ok(());
    }
    for (name, count) in &status {
        println!("  {name:<32} {count:>6}");
    }
    println!("  {:<32} {total:>6}", "total");
    Ok(())
}

/// Delete every namespace.
pub async fn run_clear(config: &RuntimeConfig) -> Result<()> {
    let s = Styled::new();
    let intermediary = super::open_intermediary(config, EventBus::default())?;
    let removed = intermediary.clear_all().await.context("clearing caches")?;

    if output::is_json() {
        output::print_json(&serde_json::json!({ "removed": removed }));
    } else if !output::is_quiet() {
        eprintln!("  {} Deleted {removed} namespace(s).", s.ok_sym());
    }
    Ok(())
}

/// Fetch `urls` into the runtime namespace. Fails if any URL failed.
pub async fn run_warm(config: &RuntimeConfig, urls: &[String]) -> Result<()> {
    let s = Styled::new();
    let intermediary = super::open_intermediary(config, EventBus::default())?;
    let results = intermediary.cache_urls(urls).await;
    let failed = results.iter().filter(|r| !r.ok).count();

    if output::is_json() {
        output::print_json(&serde_json::json!({
            "success": failed == 0,
            "results": results,
        }));
    } else if !output::is_quiet() {
        for r in &results {
            match &r.error {
                None => eprintln!("  {} {}", s.ok_sym(), r.url),
                Some(e) => eprintln!("  {} {} ({e})", s.err_sym(), r.url),
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} URL(s) could not be cached", results.len());
    }
    Ok(())
}

/// Delete runtime entries older than the configured max age.
pub async fn run_sweep(config: &RuntimeConfig) -> Result<()> {
    let s = Styled::new();
    let intermediary = super::open_intermediary(config, EventBus::default())?;
    let removed = intermediary
        .sweep_runtime()
        .await
        .context("sweeping the runtime namespace")?;

    if output::is_json() {
        output::print_json(&serde_json::json!({
            "namespace": intermediary.namespaces().runtime.name(),
            "removed": removed,
        }));
    } else if !output::is_quiet() {
        eprintln!(
            "  {} Removed {removed} entr(ies) older than {}s.",
            s.ok_sym(),
            config.intermediary.runtime_max_age_secs
        );
    }
    Ok(())
}
