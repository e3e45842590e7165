//! Client provider handing out the shared mock

use super::MockCloudClient;
use crate::cloud_trait::CloudClientTrait;
use crate::error::CloudError;
use crate::provider::CloudClientProvider;
use std::sync::{Arc, Mutex, PoisonError};

/// Provider returning the same mock for every identity and recording
/// which identities were requested and invalidated
#[derive(Debug, Clone)]
pub struct MockProvider {
    client: MockCloudClient,
    requested: Arc<Mutex<Vec<Option<String>>>>,
    invalidated: Arc<Mutex<Vec<String>>>,
}

impl MockProvider {
    /// Provider around `client`
    pub fn new(client: MockCloudClient) -> Self {
        Self {
            client,
            requested: Arc::default(),
            invalidated: Arc::default(),
        }
    }

    /// The shared mock
    pub fn client(&self) -> &MockCloudClient {
        &self.client
    }

    /// Identities passed to `client_for`, in order
    pub fn requested(&self) -> Vec<Option<String>> {
        self.requested.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Identities passed to `invalidate`, in order
    pub fn invalidated(&self) -> Vec<String> {
        self.invalidated.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait::async_trait]
impl CloudClientProvider for MockProvider {
    async fn client_for(&self, identity: Option<&str>) -> Result<Arc<dyn CloudClientTrait>, CloudError> {
        self.requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(identity.map(str::to_string));
        Ok(Arc::new(self.client.clone()))
    }

    fn invalidate(&self, identity: &str) {
        self.invalidated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(identity.to_string());
    }

    fn region(&self) -> &str {
        self.client.region()
    }
}
