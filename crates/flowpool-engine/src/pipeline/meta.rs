//! Per-invocation metadata shared by every step of one pipeline run.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use flowpool_core::{Fields, WorkItem};
use serde_json::Value;

#[derive(Debug, Default)]
struct MetaInner {
    globals: Fields,
    items: HashMap<String, Fields>,
}

/// Snapshot of every item's fields, keyed by item key, plus invocation-wide
/// globals. Cloning shares the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct Meta {
    inner: Arc<RwLock<MetaInner>>,
}

impl Meta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_globals(globals: Fields) -> Self {
        Self {
            inner: Arc::new(RwLock::new(MetaInner {
                globals,
                items: HashMap::new(),
            })),
        }
    }

    #[must_use]
    pub fn with_global(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_global(name, value);
        self
    }

    pub fn set_global(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .globals
            .insert(name.into(), value.into());
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .globals
            .get(name)
            .cloned()
    }

    /// Record a fresh snapshot for each item, replacing any previous one.
    pub fn seed(&self, items: &[WorkItem]) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        for item in items {
            inner
                .items
                .insert(item.key().to_string(), item.fields().clone());
        }
    }

    /// Fold an item's current fields into its snapshot.
    pub fn update_item(&self, item: &WorkItem) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let snapshot = inner.items.entry(item.key().to_string()).or_default();
        for (name, value) in item.fields() {
            snapshot.insert(name.clone(), value.clone());
        }
    }

    pub fn snapshot(&self, key: &str) -> Option<Fields> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .items
            .get(key)
            .cloned()
    }

    /// One field of one item's snapshot.
    pub fn field(&self, key: &str, name: &str) -> Option<Value> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .items
            .get(key)
            .and_then(|fields| fields.get(name))
            .cloned()
    }

    /// `item` with any fields from its snapshot it does not carry itself.
    pub fn enrich(&self, item: WorkItem) -> WorkItem {
        let Some(snapshot) = self.snapshot(item.key()) else {
            return item;
        };
        let mut enriched = WorkItem::new(item.key()).with_status(item.status().clone());
        if let Some(shape) = item.shape() {
            enriched.set_shape(shape);
        }
        enriched.extend(snapshot);
        enriched.extend(item.fields().clone());
        enriched
    }
}
