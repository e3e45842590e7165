//! Desired-state store seam
//!
//! Reconcilers read and write their records through `RecordStore` rather
//! than `kube::Api`, so the same logic runs against the API server in
//! production and against `testing::MemoryStore` in unit tests.
//!
//! Writes are JSON merge patches. A patch carrying
//! `metadata.resourceVersion` is only applied if the stored object still has
//! that version; otherwise the store answers `StoreError::Conflict` (409).

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by a record store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Optimistic concurrency check failed (409)
    #[error("Conflict writing {0}")]
    Conflict(String),

    /// Record does not exist (404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Any other API server error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Patch could not be built or applied
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// True for 409 responses
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    fn from_kube(error: kube::Error, key: &str) -> Self {
        match error {
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict(key.to_string()),
            kube::Error::Api(ae) if ae.code == 404 => Self::NotFound(key.to_string()),
            other => Self::Kube(other),
        }
    }
}

/// Get/list/patch access to one kind of record
#[async_trait]
pub trait RecordStore<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    /// Fetch one record; `None` when it does not exist
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>, StoreError>;

    /// List every record in scope
    async fn list(&self) -> Result<Vec<K>, StoreError>;

    /// Merge-patch the status subresource
    async fn patch_status(&self, namespace: Option<&str>, name: &str, patch: &Value) -> Result<K, StoreError>;

    /// Merge-patch the object itself (metadata: finalizers, annotations)
    async fn patch_metadata(&self, namespace: Option<&str>, name: &str, patch: &Value) -> Result<K, StoreError>;
}

/// `namespace/name` key of a record, as used in logs and backoff tracking
pub fn object_key<K: Resource>(obj: &K) -> String {
    match obj.meta().namespace.as_deref() {
        Some(ns) => format!("{}/{}", ns, obj.name_any()),
        None => obj.name_any(),
    }
}

/// Whether the record has been marked for deletion
pub fn is_deleting<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// Whether `finalizer` is present on the record
pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

fn finalizers_patch<K: Resource>(obj: &K, finalizers: &[String]) -> Value {
    json!({
        "metadata": {
            "resourceVersion": obj.resource_version(),
            "finalizers": finalizers,
        }
    })
}

/// Add `finalizer` to the record if it is missing
pub async fn add_finalizer<K>(store: &dyn RecordStore<K>, obj: &K, finalizer: &str) -> Result<K, StoreError>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    if has_finalizer(obj, finalizer) {
        return Ok(obj.clone());
    }
    let mut finalizers = obj.finalizers().to_vec();
    finalizers.push(finalizer.to_string());
    let patch = finalizers_patch(obj, &finalizers);
    store.patch_metadata(obj.namespace().as_deref(), &obj.name_any(), &patch).await
}

/// Remove `finalizer` from the record if present
pub async fn remove_finalizer<K>(store: &dyn RecordStore<K>, obj: &K, finalizer: &str) -> Result<(), StoreError>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    if !has_finalizer(obj, finalizer) {
        return Ok(());
    }
    let finalizers: Vec<String> = obj.finalizers().iter().filter(|f| *f != finalizer).cloned().collect();
    let patch = finalizers_patch(obj, &finalizers);
    match store.patch_metadata(obj.namespace().as_deref(), &obj.name_any(), &patch).await {
        Ok(_) | Err(StoreError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

type ApiFor<K> = Arc<dyn Fn(Option<&str>) -> Api<K> + Send + Sync>;

/// Record store backed by the Kubernetes API server
pub struct KubeStore<K> {
    api_for: ApiFor<K>,
    list_api: Api<K>,
}

impl<K: Clone> Clone for KubeStore<K> {
    fn clone(&self) -> Self {
        Self {
            api_for: Arc::clone(&self.api_for),
            list_api: self.list_api.clone(),
        }
    }
}

impl<K> Debug for KubeStore<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore").finish_non_exhaustive()
    }
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug + 'static,
{
    /// Store for a namespaced kind; lists cover `watch_namespace` or all namespaces
    pub fn namespaced(client: Client, watch_namespace: Option<&str>) -> Self {
        let list_api = match watch_namespace {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        };
        Self {
            api_for: Arc::new(move |ns: Option<&str>| match ns {
                Some(ns) => Api::namespaced(client.clone(), ns),
                None => Api::default_namespaced(client.clone()),
            }),
            list_api,
        }
    }
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = k8s_openapi::ClusterResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug + 'static,
{
    /// Store for a cluster-scoped kind (e.g. `Node`)
    pub fn cluster(client: Client) -> Self {
        let list_api: Api<K> = Api::all(client);
        let api = list_api.clone();
        Self {
            api_for: Arc::new(move |_ns: Option<&str>| api.clone()),
            list_api,
        }
    }
}

fn key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{ns}/{name}"),
        None => name.to_string(),
    }
}

#[async_trait]
impl<K> RecordStore<K> for KubeStore<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>, StoreError> {
        (self.api_for)(namespace)
            .get_opt(name)
            .await
            .map_err(|e| StoreError::from_kube(e, &key(namespace, name)))
    }

    async fn list(&self) -> Result<Vec<K>, StoreError> {
        let list = self.list_api.list(&Default::default()).await?;
        Ok(list.items)
    }

    async fn patch_status(&self, namespace: Option<&str>, name: &str, patch: &Value) -> Result<K, StoreError> {
        (self.api_for)(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| StoreError::from_kube(e, &key(namespace, name)))
    }

    async fn patch_metadata(&self, namespace: Option<&str>, name: &str, patch: &Value) -> Result<K, StoreError> {
        (self.api_for)(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| StoreError::from_kube(e, &key(namespace, name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Node, Service};

    fn assert_clone<T: Clone>() {}

    #[test]
    fn test_kube_store_is_clone() {
        assert_clone::<KubeStore<Service>>();
        assert_clone::<KubeStore<Node>>();
    }
}
