//! Stateful per-embed gesture tracking.
//!
//! Each attached embed keeps a live map of touches and a live map of
//! pointers. Every start, move and end runs the recognizers from
//! [`upm_embed::gesture`] against the active set (touches win when both are
//! present). Recognized gestures go to per-embed listeners, to the analytics
//! batcher when one is attached, and are forwarded fire-and-forget to the
//! gesture endpoint.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use dashmap::DashMap;
use indexmap::IndexMap;
use tokio::task::JoinHandle;
use upm_embed::gesture::{recognize, wheel_zoom};
use upm_embed::{gesture_path, Clock, Gesture, GestureKind, GestureThresholds, InputPoint, Phase};
use url::Url;

use crate::events::{EmbedEvent, EventBus};
use crate::listeners::{ListenerTable, Subscription};
use crate::net::{resolve_url, FetchRequest, Network};
use crate::telemetry::AnalyticsBatcher;

/// One contact position reported by the host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Contact {
    pub id: i64,
    pub x: f64,
    pub y: f64,
}

impl Contact {
    pub fn new(id: i64, x: f64, y: f64) -> Self {
        Self { id, x, y }
    }
}

#[derive(Debug, Default)]
struct EmbedInputs {
    touches: IndexMap<i64, InputPoint>,
    pointers: IndexMap<i64, InputPoint>,
}

impl EmbedInputs {
    fn recognize(&self, phase: Phase, now_ms: u64, thresholds: &GestureThresholds) -> Vec<Gesture> {
        let source = if self.touches.is_empty() {
            &self.pointers
        } else {
            &self.touches
        };
        let active: Vec<&InputPoint> = source.values().collect();
        recognize(&active, phase, now_ms, thresholds)
    }
}

/// Posts recognized gestures to `/api/embeds/{id}/gesture`.
#[derive(Clone)]
pub struct GestureForwarder {
    origin: Url,
    network: Arc<dyn Network>,
}

impl GestureForwarder {
    pub fn new(origin: Url, network: Arc<dyn Network>) -> Self {
        Self { origin, network }
    }

    fn spawn(&self, embed_id: &str, gesture: &Gesture) -> Option<JoinHandle<()>> {
        let url = match resolve_url(&self.origin, &gesture_path(embed_id)) {
            Ok(u) => u,
            Err(e) => {
                tracing::debug!("gesture forward skipped: {e}");
                return None;
            }
        };
        let body = match serde_json::to_vec(gesture) {
            Ok(b) => Bytes::from(b),
            Err(e) => {
                tracing::debug!("gesture forward skipped: {e}");
                return None;
            }
        };
        let request = FetchRequest::post_json(url, body);
        let network = Arc::clone(&self.network);
        Some(tokio::spawn(async move {
            match network.fetch(&request).await {
                Ok(response) if response.ok() => {}
                Ok(response) => {
                    tracing::debug!("gesture forward to {} answered {}", request.url, response.status)
                }
                Err(e) => tracing::debug!("gesture forward to {} failed: {e}", request.url),
            }
        }))
    }
}

struct Inner {
    inputs: DashMap<String, EmbedInputs>,
    listeners: ListenerTable<Gesture>,
    thresholds: GestureThresholds,
    forwarder: Option<GestureForwarder>,
    forwards: Mutex<Vec<JoinHandle<()>>>,
    batcher: Option<AnalyticsBatcher>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

/// Cheaply cloneable gesture tracker shared by every embed on the page.
#[derive(Clone)]
pub struct GestureTracker {
    inner: Arc<Inner>,
}

impl GestureTracker {
    pub fn new(
        thresholds: GestureThresholds,
        forwarder: Option<GestureForwarder>,
        batcher: Option<AnalyticsBatcher>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                inputs: DashMap::new(),
                listeners: ListenerTable::new(),
                thresholds,
                forwarder,
                forwards: Mutex::new(Vec::new()),
                batcher,
                clock,
                events,
            }),
        }
    }

    /// Start tracking input for `embed_id`.
    pub fn attach(&self, embed_id: &str) {
        self.inner
            .inputs
            .entry(embed_id.to_string())
            .or_default();
    }

    /// Stop tracking `embed_id` and drop its listeners.
    pub fn detach(&self, embed_id: &str) -> bool {
        self.inner.listeners.remove_embed(embed_id);
        self.inner.inputs.remove(embed_id).is_some()
    }

    pub fn is_attached(&self, embed_id: &str) -> bool {
        self.inner.inputs.contains_key(embed_id)
    }

    /// Number of active contacts for `embed_id`.
    pub fn active_points(&self, embed_id: &str) -> usize {
        self.inner
            .inputs
            .get(embed_id)
            .map(|i| i.touches.len() + i.pointers.len())
            .unwrap_or(0)
    }

    pub fn subscribe<F>(&self, embed_id: &str, kind: GestureKind, callback: F) -> Subscription
    where
        F: Fn(&Gesture) + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .subscribe(embed_id, kind.as_str(), callback)
    }

    // ── Touch ─────────────────────────────────

    pub async fn touch_start(&self, embed_id: &str, touches: &[Contact]) -> Vec<Gesture> {
        let now = self.inner.clock.now_ms();
        let gestures = self.update(embed_id, Phase::Start, |inputs| {
            for t in touches {
                inputs
                    .touches
                    .insert(t.id, InputPoint::new(t.id, t.x, t.y, now));
            }
        });
        self.emit(embed_id, gestures).await
    }

    pub async fn touch_move(&self, embed_id: &str, touches: &[Contact]) -> Vec<Gesture> {
        let gestures = self.update(embed_id, Phase::Move, |inputs| {
            for t in touches {
                if let Some(point) = inputs.touches.get_mut(&t.id) {
                    point.move_to(t.x, t.y);
                }
            }
        });
        self.emit(embed_id, gestures).await
    }

    /// Released contacts take part in end-phase recognition, then are removed.
    pub async fn touch_end(&self, embed_id: &str, released: &[i64]) -> Vec<Gesture> {
        let gestures = self.release(embed_id, |inputs| {
            for id in released {
                inputs.touches.shift_remove(id);
            }
        });
        self.emit(embed_id, gestures).await
    }

    pub async fn touch_cancel(&self, embed_id: &str, cancelled: &[i64]) -> Vec<Gesture> {
        self.touch_end(embed_id, cancelled).await
    }

    // ── Pointer ───────────────────────────────

    pub async fn pointer_down(
        &self,
        embed_id: &str,
        contact: Contact,
        pointer_type: &str,
    ) -> Vec<Gesture> {
        let now = self.inner.clock.now_ms();
        let gestures = self.update(embed_id, Phase::Start, |inputs| {
            inputs.pointers.insert(
                contact.id,
                InputPoint::new(contact.id, contact.x, contact.y, now)
                    .with_pointer_type(pointer_type),
            );
        });
        self.emit(embed_id, gestures).await
    }

    pub async fn pointer_move(&self, embed_id: &str, contact: Contact) -> Vec<Gesture> {
        let gestures = self.update(embed_id, Phase::Move, |inputs| {
            if let Some(point) = inputs.pointers.get_mut(&contact.id) {
                point.move_to(contact.x, contact.y);
            }
        });
        self.emit(embed_id, gestures).await
    }

    pub async fn pointer_up(&self, embed_id: &str, pointer_id: i64) -> Vec<Gesture> {
        let gestures = self.release(embed_id, |inputs| {
            inputs.pointers.shift_remove(&pointer_id);
        });
        self.emit(embed_id, gestures).await
    }

    /// Drop the pointer without running recognizers.
    pub fn pointer_cancel(&self, embed_id: &str, pointer_id: i64) {
        if let Some(mut inputs) = self.inner.inputs.get_mut(embed_id) {
            inputs.pointers.shift_remove(&pointer_id);
        }
    }

    /// Wheel input always yields a zoom step.
    pub async fn wheel(&self, embed_id: &str, delta_y: f64, x: f64, y: f64) -> Option<Gesture> {
        if !self.is_attached(embed_id) {
            return None;
        }
        let gesture = wheel_zoom(delta_y, x, y);
        self.emit(embed_id, vec![gesture]).await.into_iter().next()
    }

    /// Wait for in-flight gesture forwards.
    pub async fn settle(&self) {
        let handles: Vec<JoinHandle<()>> = self
            .inner
            .forwards
            .lock()
            .map(|mut f| f.drain(..).collect())
            .unwrap_or_default();
        for handle in handles {
            let _ = handle.await;
        }
    }

    // ── Internal ──────────────────────────────

    fn update(&self, embed_id: &str, phase: Phase, apply: impl FnOnce(&mut EmbedInputs)) -> Vec<Gesture> {
        let now = self.inner.clock.now_ms();
        let Some(mut inputs) = self.inner.inputs.get_mut(embed_id) else {
            return Vec::new();
        };
        apply(&mut inputs);
        inputs.recognize(phase, now, &self.inner.thresholds)
    }

    fn release(&self, embed_id: &str, remove: impl FnOnce(&mut EmbedInputs)) -> Vec<Gesture> {
        let now = self.inner.clock.now_ms();
        let Some(mut inputs) = self.inner.inputs.get_mut(embed_id) else {
            return Vec::new();
        };
        let gestures = inputs.recognize(Phase::End, now, &self.inner.thresholds);
        remove(&mut inputs);
        gestures
    }

    async fn emit(&self, embed_id: &str, gestures: Vec<Gesture>) -> Vec<Gesture> {
        for gesture in &gestures {
            let kind = gesture.kind();
            self.inner.listeners.emit(embed_id, kind.as_str(), gesture);
            self.inner.events.emit(EmbedEvent::GestureRecognized {
                embed_id: embed_id.to_string(),
                gesture: kind.as_str().to_string(),
            });

            if let Some(batcher) = &self.inner.batcher {
                match serde_json::to_value(gesture) {
                    Ok(payload) => batcher.track(embed_id, "gesture", payload).await,
                    Err(e) => tracing::debug!("gesture not tracked: {e}"),
                }
            }

            if let Some(handle) = self
                .inner
                .forwarder
                .as_ref()
                .and_then(|f| f.spawn(embed_id, gesture))
            {
                if let Ok(mut forwards) = self.inner.forwards.lock() {
                    forwards.retain(|h| !h.is_finished());
                    forwards.push(handle);
                }
            }
        }
        gestures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use upm_embed::{ManualClock, SwipeDirection};

    fn tracker(clock: &ManualClock) -> GestureTracker {
        GestureTracker::new(
            GestureThresholds::default(),
            None,
            None,
            Arc::new(clock.clone()),
            EventBus::new(16),
        )
    }

    #[tokio::test]
    async fn test_pointer_swipe_right() {
        let clock = ManualClock::new(0);
        let t = tracker(&clock);
        t.attach("e");
        t.pointer_down("e", Contact::new(1, 0.0, 0.0), "mouse").await;
        clock.set(100);
        t.pointer_move("e", Contact::new(1, 80.0, 5.0)).await;
        let gestures = t.pointer_up("e", 1).await;
        assert!(matches!(
            gestures.as_slice(),
            [Gesture::Swipe {
                direction: SwipeDirection::Right,
                ..
            }]
        ));
        assert_eq!(t.active_points("e"), 0);
    }

    #[tokio::test]
    async fn test_touch_tap_and_listener() {
        let clock = ManualClock::new(1_000);
        let t = tracker(&clock);
        t.attach("e");
        let taps = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&taps);
        let _sub = t.subscribe("e", GestureKind::Tap, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        t.touch_start("e", &[Contact::new(7, 10.0, 10.0)]).await;
        clock.advance(120);
        let gestures = t.touch_end("e", &[7]).await;
        assert_eq!(gestures.len(), 1);
        assert_eq!(gestures[0].kind(), GestureKind::Tap);
        assert_eq!(taps.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_long_press_on_move() {
        let clock = ManualClock::new(0);
        let t = tracker(&clock);
        t.attach("e");
        t.touch_start("e", &[Contact::new(1, 5.0, 5.0)]).await;
        clock.set(600);
        let gestures = t.touch_move("e", &[Contact::new(1, 8.0, 5.0)]).await;
        assert_eq!(gestures[0].kind(), GestureKind::LongPress);
    }

    #[tokio::test]
    async fn test_pinch_threshold() {
        let clock = ManualClock::new(0);
        let t = tracker(&clock);
        t.attach("e");
        t.touch_start("e", &[Contact::new(1, 0.0, 0.0), Contact::new(2, 100.0, 0.0)])
            .await;
        let none = t
            .touch_move("e", &[Contact::new(1, 0.0, 0.0), Contact::new(2, 105.0, 0.0)])
            .await;
        assert!(none.is_empty());

        let gestures = t
            .touch_move("e", &[Contact::new(1, 0.0, 0.0), Contact::new(2, 150.0, 0.0)])
            .await;
        let Some(Gesture::Pinch { scale, .. }) = gestures.first() else {
            panic!("expected pinch, got {gestures:?}");
        };
        assert!((scale - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_touches_take_precedence_over_pointers() {
        let clock = ManualClock::new(0);
        let t = tracker(&clock);
        t.attach("e");
        t.pointer_down("e", Contact::new(9, 0.0, 0.0), "pen").await;
        t.touch_start("e", &[Contact::new(1, 0.0, 0.0), Contact::new(2, 100.0, 0.0)])
            .await;
        clock.set(50);
        // the lone pointer would be a swipe; the two touches are evaluated instead
        t.pointer_move("e", Contact::new(9, 200.0, 0.0)).await;
        let gestures = t
            .touch_move("e", &[Contact::new(1, 0.0, 0.0), Contact::new(2, 150.0, 0.0)])
            .await;
        assert_eq!(gestures[0].kind(), GestureKind::Pinch);
    }

    #[tokio::test]
    async fn test_pointer_cancel_runs_nothing() {
        let clock = ManualClock::new(0);
        let t = tracker(&clock);
        t.attach("e");
        t.pointer_down("e", Contact::new(1, 0.0, 0.0), "touch").await;
        t.pointer_cancel("e", 1);
        assert_eq!(t.active_points("e"), 0);
        assert!(t.pointer_up("e", 1).await.is_empty());
    }

    #[tokio::test]
    async fn test_wheel_zoom_and_detach() {
        let clock = ManualClock::new(0);
        let t = tracker(&clock);
        assert_eq!(t.wheel("e", 1.0, 0.0, 0.0).await, None);
        t.attach("e");
        assert_eq!(
            t.wheel("e", -3.0, 4.0, 5.0).await,
            Some(Gesture::Zoom {
                scale: 1.1,
                center_x: 4.0,
                center_y: 5.0
            })
        );
        assert!(t.detach("e"));
        assert!(!t.detach("e"));
        assert!(t.touch_start("e", &[Contact::new(1, 0.0, 0.0)]).await.is_empty());
    }
}
