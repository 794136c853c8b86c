//! Run the intermediary as a local proxy.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

use crate::cli::output::{self, Styled};
use crate::config::RuntimeConfig;
use crate::events::{now_timestamp, EmbedEvent, EventBus};
use crate::intermediary::proxy::{self, ProxyState};
use crate::maintenance;
use crate::net::{HttpNetwork, Network};

/// Default proxy port.
pub const DEFAULT_PORT: u16 = 7780;

/// How long shutdown waits for the maintenance loop.
const MAINTENANCE_GRACE: Duration = Duration::from_secs(5);

/// Install and activate the intermediary, then serve until Ctrl-C.
pub async fn run(config: &RuntimeConfig, port: u16) -> Result<()> {
    let s = Styled::new();
    let events = EventBus::default();
    let intermediary = super::open_intermediary(config, events.clone())?;

    info!("starting upm-embed v{}", env!("CARGO_PKG_VERSION"));
    let report = intermediary
        .start()
        .await
        .context("installing the intermediary")?;
    if report.failed > 0 {
        warn!(
            "{} of {} static assets could not be cached",
            report.failed,
            report.cached + report.failed
        );
    }

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    let bound = listener.local_addr()?;

    let upstream: Arc<dyn Network> =
        Arc::new(HttpNetwork::new(config.intermediary.request_timeout_ms));
    let state = Arc::new(ProxyState::new(intermediary.clone(), upstream));

    let shutdown = Arc::new(Notify::new());
    let signal = Arc::clone(&shutdown);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("received shutdown signal");
        signal.notify_waiters();
    });

    let mut feed = events.subscribe();
    tokio::spawn(async move {
        loop {
            match feed.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => debug!("event {line}"),
                    Err(e) => debug!("unserializable event: {e}"),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => debug!("event feed lagged by {n}"),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let maintenance = maintenance::spawn(
        intermediary.clone(),
        config.maintenance.clone(),
        Arc::clone(&shutdown),
    );

    events.emit(EmbedEvent::RuntimeStarted {
        version: env!("CARGO_PKG_VERSION").to_string(),
        http_port: Some(bound.port()),
        timestamp: now_timestamp(),
    });
    if output::is_json() {
        output::print_json(&serde_json::json!({
            "listening": format!("http://{bound}"),
            "origin": config.intermediary.origin,
            "cached": report.cached,
            "failed": report.failed,
        }));
    } else if !output::is_quiet() {
        eprintln!(
            "  {} Proxying {} on http://{bound}",
            s.ok_sym(),
            config.intermediary.origin
        );
    }

    let result = proxy::serve(listener, state, Arc::clone(&shutdown)).await;
    shutdown.notify_waiters();
    let abort = maintenance.abort_handle();
    if tokio::time::timeout(MAINTENANCE_GRACE, maintenance).await.is_err() {
        warn!("maintenance loop did not stop in time, aborting");
        abort.abort();
    }

    if !output::is_quiet() && !output::is_json() {
        eprintln!("  {} Proxy stopped.", s.ok_sym());
    }
    result
}
