//! Identifier-keyed registries for live resources.
//!
//! One registry per resource kind (sessions, SFTP clients, forwards,
//! download streams, streaming uploads). The creating component is the sole
//! writer of insert; the teardown path is the sole writer of remove.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A concurrent map from minted identifier to live resource.
#[derive(Debug)]
pub struct Registry<T> {
    entries: Mutex<HashMap<String, Arc<T>>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<String>, value: Arc<T>) {
        self.entries.lock().unwrap().insert(id.into(), value);
    }

    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        self.entries.lock().unwrap().get(id).cloned()
    }

    /// Remove and return the entry, if present.
    pub fn take(&self, id: &str) -> Option<Arc<T>> {
        self.entries.lock().unwrap().remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().unwrap().contains_key(id)
    }

    /// Snapshot of entries matching a predicate.
    pub fn filter(&self, pred: impl Fn(&T) -> bool) -> Vec<(String, Arc<T>)> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, v)| pred(v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
