use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;

use super::{Listing, ObjectStore};
use crate::errors::StoreError;

/// Process-local store for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), Bytes>>,
    /// `(operation, container)`; no container fails the operation everywhere.
    failing: Mutex<HashSet<(String, Option<String>)>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call of `operation` (`get`, `put` or `list`) fail
    /// as unavailable.
    pub fn fail_operation(&self, operation: &str) {
        lock(&self.failing).insert((operation.to_string(), None));
    }

    pub fn restore_operation(&self, operation: &str) {
        lock(&self.failing).remove(&(operation.to_string(), None));
    }

    /// Like [`fail_operation`](Self::fail_operation), limited to one container.
    pub fn fail_operation_on(&self, operation: &str, container: &str) {
        lock(&self.failing).insert((operation.to_string(), Some(container.to_string())));
    }

    pub fn restore_operation_on(&self, operation: &str, container: &str) {
        lock(&self.failing).remove(&(operation.to_string(), Some(container.to_string())));
    }

    /// All keys of `container`, sorted.
    pub fn keys(&self, container: &str) -> Vec<String> {
        lock(&self.objects)
            .keys()
            .filter(|(c, _)| c == container)
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub fn insert(&self, container: &str, key: &str, body: impl Into<Bytes>) {
        lock(&self.objects).insert((container.to_string(), key.to_string()), body.into());
    }

    fn check(&self, operation: &str, container: &str) -> Result<(), StoreError> {
        let failing = lock(&self.failing);
        let everywhere = (operation.to_string(), None);
        let here = (operation.to_string(), Some(container.to_string()));
        if failing.contains(&everywhere) || failing.contains(&here) {
            return Err(StoreError::Unavailable {
                operation: operation.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // a panicking test thread must not hide the store from the others
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ObjectStore for InMemoryObjectStore {
    async fn get(&self, container: &str, key: &str) -> Result<Bytes, StoreError> {
        self.check("get", container)?;
        lock(&self.objects)
            .get(&(container.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                container: container.to_string(),
                key: key.to_string(),
            })
    }

    async fn put(&self, container: &str, key: &str, body: Bytes) -> Result<(), StoreError> {
        self.check("put", container)?;
        self.insert(container, key, body);
        Ok(())
    }

    async fn list(
        &self,
        container: &str,
        prefix: &str,
        delimiter: Option<&str>,
    ) -> Result<Listing, StoreError> {
        self.check("list", container)?;
        let mut keys = BTreeSet::new();
        let mut common_prefixes = BTreeSet::new();

        for (c, key) in lock(&self.objects).keys() {
            if c != container {
                continue;
            }
            let Some(rest) = key.strip_prefix(prefix) else {
                continue;
            };
            match delimiter.filter(|d| !d.is_empty()).and_then(|d| rest.find(d).map(|i| i + d.len())) {
                Some(end) => {
                    common_prefixes.insert(format!("{prefix}{}", &rest[..end]));
                }
                None => {
                    keys.insert(key.clone());
                }
            }
        }

        Ok(Listing {
            keys: keys.into_iter().collect(),
            common_prefixes: common_prefixes.into_iter().collect(),
        })
    }
}
