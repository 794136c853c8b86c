//! Per-embed publish/subscribe table.
//!
//! Callbacks are registered under `(embed id, event type)` and every
//! registration returns a [`Subscription`]. Dropping the subscription (or
//! calling [`Subscription::unsubscribe`]) removes the callback, so disposing
//! an embed's record is enough to detach everything it registered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;
type Slots<E> = HashMap<(String, String), Vec<(u64, Callback<E>)>>;

struct Inner<E> {
    slots: Mutex<Slots<E>>,
    next_id: AtomicU64,
}

/// Listener registry keyed by `(embed_id, event_type)`.
pub struct ListenerTable<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for ListenerTable<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: 'static> Default for ListenerTable<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: 'static> ListenerTable<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register `callback` for `(embed_id, event_type)`.
    pub fn subscribe<F>(&self, embed_id: &str, event_type: &str, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let key = (embed_id.to_string(), event_type.to_string());
        if let Ok(mut slots) = self.inner.slots.lock() {
            slots
                .entry(key.clone())
                .or_default()
                .push((id, Arc::new(callback)));
        }

        let weak: Weak<Inner<E>> = Arc::downgrade(&self.inner);
        Subscription {
            embed_id: key.0.clone(),
            event_type: key.1.clone(),
            remove: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    remove_entry(&inner, &key, id);
                }
            })),
        }
    }

    /// Deliver `event` to every callback for `(embed_id, event_type)`.
    /// Returns how many callbacks ran. Callbacks run outside the table lock,
    /// so they may subscribe or unsubscribe.
    pub fn emit(&self, embed_id: &str, event_type: &str, event: &E) -> usize {
        let callbacks: Vec<Callback<E>> = match self.inner.slots.lock() {
            Ok(slots) => slots
                .get(&(embed_id.to_string(), event_type.to_string()))
                .map(|v| v.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default(),
            Err(_) => return 0,
        };
        for cb in &callbacks {
            cb(event);
        }
        callbacks.len()
    }

    pub fn has_listeners(&self, embed_id: &str, event_type: &str) -> bool {
        self.count(embed_id, event_type) > 0
    }

    pub fn count(&self, embed_id: &str, event_type: &str) -> usize {
        self.inner
            .slots
            .lock()
            .map(|slots| {
                slots
                    .get(&(embed_id.to_string(), event_type.to_string()))
                    .map_or(0, Vec::len)
            })
            .unwrap_or(0)
    }

    /// Total registered callbacks across all keys.
    pub fn len(&self) -> usize {
        self.inner
            .slots
            .lock()
            .map(|slots| slots.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every callback registered for `embed_id`.
    pub fn remove_embed(&self, embed_id: &str) -> usize {
        let Ok(mut slots) = self.inner.slots.lock() else {
            return 0;
        };
        let mut removed = 0;
        slots.retain(|(id, _), v| {
            if id == embed_id {
                removed += v.len();
                false
            } else {
                true
            }
        });
        removed
    }
}

fn remove_entry<E>(inner: &Inner<E>, key: &(String, String), id: u64) {
    if let Ok(mut slots) = inner.slots.lock() {
        if let Some(list) = slots.get_mut(key) {
            list.retain(|(entry_id, _)| *entry_id != id);
            if list.is_empty() {
                slots.remove(key);
            }
        }
    }
}

/// Handle to one registered callback. Unsubscribes on drop.
pub struct Subscription {
    embed_id: String,
    event_type: String,
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn embed_id(&self) -> &str {
        &self.embed_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn is_active(&self) -> bool {
        self.remove.is_some()
    }

    /// Remove the callback now. Later calls are no-ops.
    pub fn unsubscribe(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("embed_id", &self.embed_id)
            .field("event_type", &self.event_type)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_reaches_matching_key_only() {
        let table: ListenerTable<u32> = ListenerTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let _sub = table.subscribe("a", "click", move |v| {
            h.fetch_add(*v as usize, Ordering::SeqCst);
        });

        assert_eq!(table.emit("a", "click", &3), 1);
        assert_eq!(table.emit("a", "view", &5), 0);
        assert_eq!(table.emit("b", "click", &7), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let table: ListenerTable<()> = ListenerTable::new();
        let sub = table.subscribe("a", "click", |_| {});
        assert!(table.has_listeners("a", "click"));
        drop(sub);
        assert!(!table.has_listeners("a", "click"));
        assert!(table.is_empty());
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let table: ListenerTable<()> = ListenerTable::new();
        let mut first = table.subscribe("a", "click", |_| {});
        let _second = table.subscribe("a", "click", |_| {});
        first.unsubscribe();
        first.unsubscribe();
        assert!(!first.is_active());
        assert_eq!(table.count("a", "click"), 1);
    }

    #[test]
    fn test_remove_embed() {
        let table: ListenerTable<()> = ListenerTable::new();
        let _a1 = table.subscribe("a", "click", |_| {});
        let _a2 = table.subscribe("a", "view", |_| {});
        let _b = table.subscribe("b", "click", |_| {});
        assert_eq!(table.remove_embed("a"), 2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_subscription_outlives_table() {
        let table: ListenerTable<()> = ListenerTable::new();
        let sub = table.subscribe("a", "click", |_| {});
        drop(table);
        drop(sub);
    }
}
