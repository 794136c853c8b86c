//! Intermediary maintenance loop.
//!
//! Runs the cache-cleanup periodic sync and replays every registered
//! background-sync tag while the proxy is serving.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use upm_embed::CACHE_CLEANUP_TAG;

use crate::config::MaintenanceSettings;
use crate::intermediary::Intermediary;

/// Totals from one maintenance tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub swept: usize,
    pub replayed: usize,
    pub delivered: usize,
}

/// Spawn background maintenance until `shutdown` is notified. A
/// notification that arrives during a tick abandons the tick.
pub fn spawn(
    intermediary: Intermediary,
    settings: MaintenanceSettings,
    shutdown: Arc<Notify>,
) -> tokio::task::JoinHandle<()> {
    let tick_every = Duration::from_secs(settings.tick_secs.max(1));
    tokio::spawn(async move {
        tracing::info!("maintenance loop started: tick={}s", tick_every.as_secs());
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + tick_every, tick_every);
        let mut tick_count: u64 = 0;

        // one waiter for the whole loop, so a notify_waiters between
        // selects is not lost
        let stop = shutdown.notified();
        tokio::pin!(stop);
        stop.as_mut().enable();

        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => {}
            }
            tick_count = tick_count.saturating_add(1);
            tokio::select! {
                _ = &mut stop => {
                    tracing::debug!("maintenance tick {tick_count} interrupted");
                    break;
                }
                report = run_tick(&intermediary) => {
                    tracing::debug!(
                        "maintenance tick {tick_count}: swept={} replayed={} delivered={}",
                        report.swept,
                        report.replayed,
                        report.delivered
                    );
                }
            }
        }
        tracing::info!("maintenance loop stopping");
    })
}

/// One maintenance pass. Failures are logged and the pass continues.
pub async fn run_tick(intermediary: &Intermediary) -> TickReport {
    let mut report = TickReport::default();

    match intermediary.periodic_sync(CACHE_CLEANUP_TAG).await {
        Ok(Some(removed)) => {
            if removed > 0 {
                tracing::info!("maintenance cache cleanup removed {removed} aged entries");
            }
            report.swept = removed;
        }
        Ok(None) => {}
        Err(e) => tracing::warn!("maintenance cache cleanup failed: {e}"),
    }

    match intermediary.sync_registered().await {
        Ok(replays) => {
            for replay in replays {
                report.replayed += replay.attempted;
                report.delivered += replay.succeeded;
            }
        }
        Err(e) => tracing::warn!("maintenance sync replay failed: {e}"),
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IntermediaryConfig;
    use crate::error::NetworkError;
    use crate::events::EventBus;
    use crate::intermediary::store::CacheStorage;
    use crate::net::{FetchRequest, FetchResponse, Network};
    use async_trait::async_trait;
    use upm_embed::ManualClock;

    struct Up;

    #[async_trait]
    impl Network for Up {
        async fn fetch(&self, _request: &FetchRequest) -> Result<FetchResponse, NetworkError> {
            Ok(FetchResponse::text(200, "ok"))
        }
    }

    async fn intermediary(clock: &ManualClock) -> Intermediary {
        let store = Arc::new(CacheStorage::open_in_memory(Arc::new(clock.clone())).unwrap());
        Intermediary::new(
            IntermediaryConfig {
                origin: "https://host.test".into(),
                static_assets: vec![],
                ..IntermediaryConfig::default()
            },
            store,
            Arc::new(Up),
            EventBus::new(16),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_tick_sweeps_and_replays() {
        let clock = ManualClock::new(0);
        let i = intermediary(&clock).await;
        let runtime = i.namespaces().runtime.name();
        i.store()
            .put(&runtime, "https://host.test/api/x", &FetchResponse::text(200, "x"))
            .await
            .unwrap();
        i.relay()
            .enqueue(&FetchRequest::post_json(
                "https://host.test/api/embeds/analytics/batch",
                r#"{"events":[]}"#,
            ))
            .await
            .unwrap();

        clock.set(86_400_001);
        let report = run_tick(&i).await;
        assert_eq!(report.swept, 1);
        assert_eq!(report.replayed, 1);
        assert_eq!(report.delivered, 1);
        assert!(i.relay().pending().await.unwrap().is_empty());
    }

    /// Holds every POST for five seconds.
    struct SlowUpstream;

    #[async_trait]
    impl Network for SlowUpstream {
        async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, NetworkError> {
            if request.method == "POST" {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok(FetchResponse::text(200, "ok"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_tick_stops_loop() {
        let clock = ManualClock::new(0);
        let store = Arc::new(CacheStorage::open_in_memory(Arc::new(clock.clone())).unwrap());
        let i = Intermediary::new(
            IntermediaryConfig {
                origin: "https://host.test".into(),
                static_assets: vec![],
                ..IntermediaryConfig::default()
            },
            store,
            Arc::new(SlowUpstream),
            EventBus::new(16),
        )
        .unwrap();
        i.relay()
            .enqueue(&FetchRequest::post_json(
                "https://host.test/api/embeds/analytics/batch",
                r#"{"events":[]}"#,
            ))
            .await
            .unwrap();

        let shutdown = Arc::new(Notify::new());
        let handle = spawn(i, MaintenanceSettings { tick_secs: 1 }, Arc::clone(&shutdown));
        // the first tick starts at 1s and is still replaying at 1.5s
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        shutdown.notify_waiters();
        let stopped = tokio::time::timeout(Duration::from_secs(60), handle).await;
        assert!(stopped.is_ok(), "maintenance loop kept running after shutdown");
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_stops_on_shutdown() {
        let clock = ManualClock::new(0);
        let i = intermediary(&clock).await;
        let shutdown = Arc::new(Notify::new());
        let handle = spawn(i, MaintenanceSettings { tick_secs: 1 }, Arc::clone(&shutdown));
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        shutdown.notify_one();
        handle.await.unwrap();
    }
}
