//! Analytics batcher.
//!
//! Events queue in arrival order and ship as one `{events}` batch when the
//! queue reaches the batch size, when the idle timer armed by the first
//! event since the last flush fires, when the page is hidden, when
//! connectivity returns, or on teardown. Undeliverable batches go to the
//! [`OfflineSink`].

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use serde_json::Value;
use upm_embed::{AnalyticsBatch, AnalyticsEvent, Clock};

use crate::config::AnalyticsConfig;
use crate::events::{EmbedEvent, EventBus};
use crate::net::FetchRequest;
use crate::schedule::ScheduledTask;
use crate::telemetry::transport::{deliver, OfflineSink, TelemetryTransport};

const SESSION_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// What a flush did with the queued events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was queued.
    Empty,
    Delivered(usize),
    /// Delivery failed and the batch went to the offline sink.
    Queued(usize),
    /// Delivery failed and no sink could take the batch.
    Dropped(usize),
}

/// Generate a session id of the form `sess_{epoch_ms}_{9 alphanumerics}`.
pub fn generate_session_id(now_ms: u64) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| SESSION_ALPHABET[rng.gen_range(0..SESSION_ALPHABET.len())] as char)
        .collect();
    format!("sess_{now_ms}_{suffix}")
}

struct Inner {
    queue: Mutex<Vec<AnalyticsEvent>>,
    timer: Mutex<Option<ScheduledTask>>,
    session_id: String,
    page_url: String,
    endpoint_url: String,
    batch_size: usize,
    flush_interval: Duration,
    transport: Arc<dyn TelemetryTransport>,
    sink: Option<Arc<dyn OfflineSink>>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

/// Cheaply cloneable handle to one batching session.
#[derive(Clone)]
pub struct AnalyticsBatcher {
    inner: Arc<Inner>,
}

impl AnalyticsBatcher {
    pub fn new(
        config: &AnalyticsConfig,
        endpoint_url: String,
        transport: Arc<dyn TelemetryTransport>,
        sink: Option<Arc<dyn OfflineSink>>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        let session_id = generate_session_id(clock.now_ms());
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(Vec::new()),
                timer: Mutex::new(None),
                session_id,
                page_url: config.page_url.clone(),
                endpoint_url,
                batch_size: config.batch_size.max(1),
                flush_interval: Duration::from_millis(config.flush_interval_ms),
                transport,
                sink,
                clock,
                events,
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Snapshot of the queued events.
    pub fn pending(&self) -> Vec<AnalyticsEvent> {
        self.inner
            .queue
            .lock()
            .map(|q| q.clone())
            .unwrap_or_default()
    }

    pub fn timer_armed(&self) -> bool {
        self.inner
            .timer
            .lock()
            .map(|t| t.as_ref().is_some_and(ScheduledTask::is_pending))
            .unwrap_or(false)
    }

    /// Queue one event, flushing when the batch is full.
    pub async fn track(&self, embed_id: &str, event_type: &str, payload: Value) {
        let event = AnalyticsEvent {
            embed_id: embed_id.to_string(),
            event_type: event_type.to_string(),
            payload,
            timestamp: self.inner.clock.now_ms(),
            session_id: self.inner.session_id.clone(),
            page_url: self.inner.page_url.clone(),
        };

        let len = match self.inner.queue.lock() {
            Ok(mut q) => {
                q.push(event);
                q.len()
            }
            Err(_) => return,
        };

        if len >= self.inner.batch_size {
            self.flush().await;
        } else {
            self.arm_timer();
        }
    }

    fn arm_timer(&self) {
        let Ok(mut timer) = self.inner.timer.lock() else {
            return;
        };
        if timer.is_some() {
            return;
        }
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        *timer = Some(ScheduledTask::after(self.inner.flush_interval, async move {
            if let Some(inner) = weak.upgrade() {
                AnalyticsBatcher { inner }.flush().await;
            }
        }));
    }

    fn clear_timer(&self) {
        let task = self.inner.timer.lock().ok().and_then(|mut t| t.take());
        if let Some(mut task) = task {
            task.cancel();
        }
    }

    /// Ship everything queued as one ordered batch.
    pub async fn flush(&self) -> FlushOutcome {
        let events = match self.inner.queue.lock() {
            Ok(mut q) => std::mem::take(&mut *q),
            Err(_) => Vec::new(),
        };
        self.clear_timer();

        if events.is_empty() {
            return FlushOutcome::Empty;
        }
        let count = events.len();
        let body = match serde_json::to_vec(&AnalyticsBatch { events }) {
            Ok(b) => Bytes::from(b),
            Err(e) => {
                tracing::warn!("dropping {count} analytics events: {e}");
                return FlushOutcome::Dropped(count);
            }
        };

        let outcome = match deliver(
            self.inner.transport.as_ref(),
            &self.inner.endpoint_url,
            body.clone(),
        )
        .await
        {
            Ok(()) => FlushOutcome::Delivered(count),
            Err(e) => {
                tracing::debug!("analytics delivery failed: {e}");
                self.hand_off(count, body).await
            }
        };

        self.inner.events.emit(EmbedEvent::AnalyticsFlushed {
            events: count,
            delivered: matches!(outcome, FlushOutcome::Delivered(_)),
        });
        outcome
    }

    async fn hand_off(&self, count: usize, body: Bytes) -> FlushOutcome {
        let Some(sink) = &self.inner.sink else {
            return FlushOutcome::Dropped(count);
        };
        let request = FetchRequest::post_json(self.inner.endpoint_url.clone(), body);
        match sink.enqueue(request).await {
            Ok(()) => FlushOutcome::Queued(count),
            Err(e) => {
                tracing::warn!("failed to queue {count} analytics events for sync: {e}");
                FlushOutcome::Dropped(count)
            }
        }
    }

    /// The page became hidden.
    pub async fn on_visibility_hidden(&self) -> FlushOutcome {
        self.flush().await
    }

    /// Connectivity returned.
    pub async fn on_online(&self) -> FlushOutcome {
        self.flush().await
    }

    /// Final flush; no timer survives.
    pub async fn teardown(&self) -> FlushOutcome {
        let outcome = self.flush().await;
        self.clear_timer();
        outcome
    }
}
