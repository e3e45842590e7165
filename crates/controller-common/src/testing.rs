//! In-memory record store for unit tests
//!
//! Behaves like the API server for the operations the reconcilers use:
//! resource versions bump on every write, stale versions are rejected with
//! `StoreError::Conflict`, and a record marked for deletion disappears once
//! its last finalizer is removed.

use crate::store::{RecordStore, StoreError};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<(String, String), Value>,
    next_version: u64,
    forced_conflicts: usize,
    status_writes: usize,
}

/// In-memory `RecordStore`
#[derive(Debug)]
pub struct MemoryStore<K> {
    inner: Arc<Mutex<Inner>>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for MemoryStore<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _kind: PhantomData,
        }
    }
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            inner: Arc::default(),
            _kind: PhantomData,
        }
    }
}

/// RFC 7386 JSON merge patch
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

fn store_key(namespace: Option<&str>, name: &str) -> (String, String) {
    (namespace.unwrap_or_default().to_string(), name.to_string())
}

fn display_key(key: &(String, String)) -> String {
    if key.0.is_empty() { key.1.clone() } else { format!("{}/{}", key.0, key.1) }
}

impl<K> MemoryStore<K>
where
    K: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(inner: &mut Inner, object: &mut Value) {
        inner.next_version += 1;
        object["metadata"]["resourceVersion"] = Value::String(inner.next_version.to_string());
    }

    fn decode(object: &Value) -> Result<K, StoreError> {
        Ok(serde_json::from_value(object.clone())?)
    }

    /// Insert or replace a record, assigning a uid when it has none
    pub fn insert(&self, obj: K) -> K {
        let mut inner = self.lock();
        let mut object = serde_json::to_value(&obj).unwrap_or(Value::Null);
        let namespace = object["metadata"]["namespace"].as_str().map(str::to_string);
        let name = object["metadata"]["name"].as_str().unwrap_or_default().to_string();
        if object["metadata"]["uid"].is_null() {
            object["metadata"]["uid"] = Value::String(format!("uid-{name}"));
        }
        Self::bump(&mut inner, &mut object);
        let stored = serde_json::from_value(object.clone()).unwrap_or(obj);
        inner.objects.insert(store_key(namespace.as_deref(), &name), object);
        stored
    }

    /// Current copy of a record
    pub fn snapshot(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        let inner = self.lock();
        inner
            .objects
            .get(&store_key(namespace, name))
            .and_then(|o| serde_json::from_value(o.clone()).ok())
    }

    /// Whether the record still exists
    pub fn contains(&self, namespace: Option<&str>, name: &str) -> bool {
        self.lock().objects.contains_key(&store_key(namespace, name))
    }

    /// Mark a record for deletion, as `kubectl delete` does.
    ///
    /// Records without finalizers are removed immediately.
    pub fn mark_deleted(&self, namespace: Option<&str>, name: &str) {
        let mut inner = self.lock();
        let key = store_key(namespace, name);
        let Some(mut object) = inner.objects.remove(&key) else {
            return;
        };
        object["metadata"]["deletionTimestamp"] = Value::String("2026-01-01T00:00:00Z".to_string());
        Self::bump(&mut inner, &mut object);
        if has_finalizers(&object) {
            inner.objects.insert(key, object);
        }
    }

    /// Change a record as another writer would (bumps the version)
    pub fn modify(&self, namespace: Option<&str>, name: &str, change: impl FnOnce(&mut K)) {
        let mut inner = self.lock();
        let key = store_key(namespace, name);
        let Some(object) = inner.objects.get(&key).cloned() else {
            return;
        };
        let Ok(mut record) = serde_json::from_value::<K>(object) else {
            return;
        };
        change(&mut record);
        let Ok(mut object) = serde_json::to_value(&record) else {
            return;
        };
        Self::bump(&mut inner, &mut object);
        inner.objects.insert(key, object);
    }

    /// Reject the next `count` writes with a conflict
    pub fn inject_conflicts(&self, count: usize) {
        self.lock().forced_conflicts = count;
    }

    /// Number of status patches applied
    pub fn status_writes(&self) -> usize {
        self.lock().status_writes
    }

    fn apply(&self, namespace: Option<&str>, name: &str, patch: &Value, section: &str) -> Result<K, StoreError> {
        let mut inner = self.lock();
        let key = store_key(namespace, name);

        if inner.forced_conflicts > 0 {
            inner.forced_conflicts -= 1;
            return Err(StoreError::Conflict(display_key(&key)));
        }

        let Some(mut object) = inner.objects.get(&key).cloned() else {
            return Err(StoreError::NotFound(display_key(&key)));
        };

        let expected = patch["metadata"]["resourceVersion"].as_str();
        if let Some(expected) = expected {
            if object["metadata"]["resourceVersion"].as_str() != Some(expected) {
                return Err(StoreError::Conflict(display_key(&key)));
            }
        }

        let mut section_patch = patch.get(section).cloned().unwrap_or(Value::Null);
        if section == "metadata" {
            if let Value::Object(meta) = &mut section_patch {
                meta.remove("resourceVersion");
            }
        }
        if !section_patch.is_null() {
            merge_patch(&mut object[section], &section_patch);
        }
        if section == "status" {
            inner.status_writes += 1;
        }
        Self::bump(&mut inner, &mut object);

        let record = Self::decode(&object)?;
        if !object["metadata"]["deletionTimestamp"].is_null() && !has_finalizers(&object) {
            inner.objects.remove(&key);
        } else {
            inner.objects.insert(key, object);
        }
        Ok(record)
    }
}

fn has_finalizers(object: &Value) -> bool {
    object["metadata"]["finalizers"].as_array().is_some_and(|f| !f.is_empty())
}

#[async_trait]
impl<K> RecordStore<K> for MemoryStore<K>
where
    K: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>, StoreError> {
        let inner = self.lock();
        inner.objects.get(&store_key(namespace, name)).map(Self::decode).transpose()
    }

    async fn list(&self) -> Result<Vec<K>, StoreError> {
        let inner = self.lock();
        inner.objects.values().map(Self::decode).collect()
    }

    async fn patch_status(&self, namespace: Option<&str>, name: &str, patch: &Value) -> Result<K, StoreError> {
        self.apply(namespace, name, patch, "status")
    }

    async fn patch_metadata(&self, namespace: Option<&str>, name: &str, patch: &Value) -> Result<K, StoreError> {
        self.apply(namespace, name, patch, "metadata")
    }
}
