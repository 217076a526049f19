use super::lock;
use crate::error::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Keyed singleton factory.
///
/// All workers that look up the same key get the same `Arc<T>`; the first
/// lookup constructs it. Construction happens under the registry lock, so two
/// concurrent first touches can never produce two instances.
///
/// Entries live until [`clear`](Registry::clear) or until the registry is
/// dropped. Workers still holding an `Arc` keep their instance alive either way.
#[derive(Debug)]
pub struct Registry<T> {
    name: &'static str,
    entries: Mutex<HashMap<String, Arc<T>>>,
}

impl<T> Registry<T> {
    /// Creates an empty registry. `name` only appears in log output.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the instance for `key`, constructing it with `init` if absent.
    ///
    /// If `init` fails nothing is installed and the error is returned.
    pub fn get_or_try_create<F>(&self, key: &str, init: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Result<T>,
    {
        let mut entries = lock(&self.entries);
        if let Some(existing) = entries.get(key) {
            return Ok(Arc::clone(existing));
        }

        let created = Arc::new(init()?);
        entries.insert(key.to_string(), Arc::clone(&created));
        debug!(registry = self.name, key, "created group entry");
        Ok(created)
    }

    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        lock(&self.entries).get(key).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry held by the registry.
    pub fn clear(&self) {
        let mut entries = lock(&self.entries);
        if !entries.is_empty() {
            debug!(registry = self.name, released = entries.len(), "clearing registry");
        }
        entries.clear();
    }
}
