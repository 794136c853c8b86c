//! Replay queued analytics batches.

use anyhow::{Context, Result};
use upm_embed::ANALYTICS_SYNC_TAG;

use crate::cli::output::{self, Styled};
use crate::config::RuntimeConfig;
use crate::events::EventBus;

/// Fire the analytics sync trigger once.
pub async fn run(config: &RuntimeConfig) -> Result<()> {
    let s = Styled::new();
    let intermediary = super::open_intermediary(config, EventBus::default())?;
    let report = intermediary
        .sync(ANALYTICS_SYNC_TAG)
        .await
        .context("replaying queued analytics")?
        .unwrap_or_default();

    if output::is_json() {
        output::print_json(&serde_json::json!({
            "attempted": report.attempted,
            "succeeded": report.succeeded,
            "remaining": report.remaining(),
        }));
        return Ok(());
    }

    if output::is_quiet() {
        return Ok(());
    }
    if report.attempted == 0 {
        eprintln!("  {} Nothing queued.", s.ok_sym());
    } else if report.remaining() == 0 {
        eprintln!("  {} Delivered {} queued batch(es).", s.ok_sym(), report.succeeded);
    } else {
        eprintln!(
            "  {} Delivered {}/{}; {} remain queued.",
            s.warn_sym(),
            report.succeeded,
            report.attempted,
            report.remaining()
        );
    }
    Ok(())
}
