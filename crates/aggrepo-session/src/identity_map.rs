//! Identity map of cached aggregates.
//!
//! The map guarantees at most one live instance per rendered identity key.
//! It is not synchronized itself; the owning [`Repository`] keeps it behind
//! its mutex together with the thread sessions.
//!
//! Alongside each entry the map remembers the staleness marker seen on the
//! root row the last time the aggregate was resolved.
//!
//! [`Repository`]: crate::Repository

use crate::aggregate::Aggregate;
use aggrepo_core::Value;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct IdentityMap {
    container: HashMap<String, Arc<Aggregate>>,
    markers: HashMap<String, Value>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `aggregate`, replacing any instance under the same key.
    pub fn insert(&mut self, aggregate: Arc<Aggregate>) -> Option<Arc<Aggregate>> {
        self.container
            .insert(aggregate.key_string().to_string(), aggregate)
    }

    pub fn get(&self, key: &str) -> Option<&Arc<Aggregate>> {
        self.container.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.container.contains_key(key)
    }

    /// Drop the entry and its marker.
    pub fn remove(&mut self, key: &str) -> Option<Arc<Aggregate>> {
        self.markers.remove(key);
        self.container.remove(key)
    }

    /// Drop the entry only if it is still `aggregate`.
    pub fn remove_instance(&mut self, aggregate: &Aggregate) -> bool {
        let key = aggregate.key_string();
        let same = self
            .container
            .get(key)
            .is_some_and(|cached| std::ptr::eq(Arc::as_ptr(cached), aggregate));
        if same {
            self.remove(key);
        }
        same
    }

    pub fn record_marker(&mut self, key: &str, marker: Value) {
        self.markers.insert(key.to_string(), marker);
    }

    pub fn marker(&self, key: &str) -> Option<&Value> {
        self.markers.get(key)
    }

    /// Every cached aggregate, for sweeping outside the lock.
    pub fn aggregates(&self) -> Vec<Arc<Aggregate>> {
        self.container.values().cloned().collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.container.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.container.clear();
        self.markers.clear();
    }

    pub fn len(&self) -> usize {
        self.container.len()
    }

    pub fn is_empty(&self) -> bool {
        self.container.is_empty()
    }
}
