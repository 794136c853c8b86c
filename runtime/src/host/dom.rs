//! The host document seam.
//!
//! The lifecycle manager only needs a handful of container operations:
//! enumerate placeholders, replace content, reflect the load state onto the
//! container's `data-loaded` attribute, query visibility and toggle the
//! offline class. [`HeadlessHost`] keeps all of it in memory.

use std::collections::HashSet;
use std::sync::Mutex;

use indexmap::IndexMap;
use upm_embed::{LoadAttr, OFFLINE_CLASS};

pub trait EmbedHost: Send + Sync {
    /// Ids of containers carrying `data-embed-id`, in document order.
    fn placeholders(&self) -> Vec<String>;

    fn has_container(&self, embed_id: &str) -> bool;

    fn content(&self, embed_id: &str) -> Option<String>;

    fn set_content(&self, embed_id: &str, html: &str);

    /// Current `data-loaded` value, `None` when the attribute is absent.
    fn load_state(&self, embed_id: &str) -> Option<LoadAttr>;

    fn set_load_state(&self, embed_id: &str, state: LoadAttr);

    /// Whether the container intersects the viewport.
    fn is_visible(&self, embed_id: &str) -> bool;

    fn set_offline(&self, embed_id: &str, offline: bool);

    /// Whether the host delivers visibility notifications.
    fn supports_visibility(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Default)]
struct Container {
    content: String,
    load_state: Option<LoadAttr>,
    visible: bool,
    classes: HashSet<String>,
}

/// In-memory document.
#[derive(Debug)]
pub struct HeadlessHost {
    containers: Mutex<IndexMap<String, Container>>,
    visibility: bool,
}

impl Default for HeadlessHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessHost {
    pub fn new() -> Self {
        Self {
            containers: Mutex::new(IndexMap::new()),
            visibility: true,
        }
    }

    /// A host without visibility notifications; the manager falls back to iframes.
    pub fn without_visibility() -> Self {
        Self {
            visibility: false,
            ..Self::new()
        }
    }

    /// Add an empty placeholder container.
    pub fn add_placeholder(&self, embed_id: &str, visible: bool) {
        if let Ok(mut c) = self.containers.lock() {
            c.insert(
                embed_id.to_string(),
                Container {
                    visible,
                    ..Container::default()
                },
            );
        }
    }

    pub fn remove_container(&self, embed_id: &str) -> bool {
        self.containers
            .lock()
            .map(|mut c| c.shift_remove(embed_id).is_some())
            .unwrap_or(false)
    }

    pub fn set_visible(&self, embed_id: &str, visible: bool) {
        self.with(embed_id, |c| c.visible = visible);
    }

    pub fn has_class(&self, embed_id: &str, class: &str) -> bool {
        self.read(embed_id, |c| c.classes.contains(class))
            .unwrap_or(false)
    }

    fn with(&self, embed_id: &str, f: impl FnOnce(&mut Container)) {
        if let Ok(mut c) = self.containers.lock() {
            if let Some(container) = c.get_mut(embed_id) {
                f(container);
            }
        }
    }

    fn read<T>(&self, embed_id: &str, f: impl FnOnce(&Container) -> T) -> Option<T> {
        self.containers
            .lock()
            .ok()
            .and_then(|c| c.get(embed_id).map(f))
    }
}

impl EmbedHost for HeadlessHost {
    fn placeholders(&self) -> Vec<String> {
        self.containers
            .lock()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn has_container(&self, embed_id: &str) -> bool {
        self.read(embed_id, |_| ()).is_some()
    }

    fn content(&self, embed_id: &str) -> Option<String> {
        self.read(embed_id, |c| c.content.clone())
    }

    fn set_content(&self, embed_id: &str, html: &str) {
        self.with(embed_id, |c| c.content = html.to_string());
    }

    fn load_state(&self, embed_id: &str) -> Option<LoadAttr> {
        self.read(embed_id, |c| c.load_state).flatten()
    }

    fn set_load_state(&self, embed_id: &str, state: LoadAttr) {
        self.with(embed_id, |c| c.load_state = Some(state));
    }

    fn is_visible(&self, embed_id: &str) -> bool {
        self.read(embed_id, |c| c.visible).unwrap_or(false)
    }

    fn set_offline(&self, embed_id: &str, offline: bool) {
        self.with(embed_id, |c| {
            if offline {
                c.classes.insert(OFFLINE_CLASS.to_string());
            } else {
                c.classes.remove(OFFLINE_CLASS);
            }
        });
    }

    fn supports_visibility(&self) -> bool {
        self.visibility
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_container_ops() {
        let host = HeadlessHost::new();
        host.add_placeholder("a", true);
        host.add_placeholder("b", false);
        assert_eq!(host.placeholders(), vec!["a", "b"]);
        assert!(host.is_visible("a") && !host.is_visible("b"));
        assert_eq!(host.load_state("a"), None);

        host.set_load_state("a", LoadAttr::Loading);
        host.set_content("a", "<p>x</p>");
        assert_eq!(host.load_state("a"), Some(LoadAttr::Loading));
        assert_eq!(host.content("a").as_deref(), Some("<p>x</p>"));

        host.set_offline("a", true);
        assert!(host.has_class("a", OFFLINE_CLASS));
        host.set_offline("a", false);
        assert!(!host.has_class("a", OFFLINE_CLASS));

        assert!(host.remove_container("a"));
        assert!(!host.has_container("a"));
        assert_eq!(host.content("a"), None);
    }

    #[test]
    fn test_missing_container_is_ignored() {
        let host = HeadlessHost::without_visibility();
        host.set_content("nope", "x");
        assert!(!host.supports_visibility());
        assert!(!host.is_visible("nope"));
    }
}
