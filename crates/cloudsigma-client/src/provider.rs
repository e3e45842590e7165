//! Per-identity client selection
//!
//! Resources may name an end-user identity to act as. The provider hands
//! out a client authenticated as that user (bearer token from the token
//! cache) or, without an identity, the controller's own service client.

use crate::client::CloudSigmaClient;
use crate::cloud_trait::CloudClientTrait;
use crate::common::Credentials;
use crate::error::CloudError;
use crate::token::TokenCache;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Hands out clients for an optional impersonated identity
#[async_trait::async_trait]
pub trait CloudClientProvider: Send + Sync {
    /// Client acting as `identity`, or as the service account when `None`
    async fn client_for(&self, identity: Option<&str>) -> Result<Arc<dyn CloudClientTrait>, CloudError>;

    /// Forget cached credentials of `identity` after the API rejected them
    fn invalidate(&self, identity: &str);

    /// Region every client targets
    fn region(&self) -> &str;
}

/// Provider backed by the real API
pub struct ClientProvider {
    http: Client,
    base_url: String,
    region: String,
    service: Arc<CloudSigmaClient>,
    tokens: Option<Arc<TokenCache>>,
}

impl std::fmt::Debug for ClientProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientProvider")
            .field("base_url", &self.base_url)
            .field("region", &self.region)
            .field("impersonation", &self.tokens.is_some())
            .finish()
    }
}

impl ClientProvider {
    /// Provider for `region` at `base_url`.
    ///
    /// `tokens` enables impersonation; without it any identity is rejected.
    pub fn new(
        base_url: String,
        region: String,
        username: String,
        password: String,
        tokens: Option<Arc<TokenCache>>,
    ) -> Result<Self, CloudError> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;
        let service = Arc::new(CloudSigmaClient::with_http_client(
            http.clone(),
            base_url.clone(),
            region.clone(),
            Credentials::Basic { username, password },
        ));
        Ok(Self {
            http,
            base_url,
            region,
            service,
            tokens,
        })
    }

    /// The service account client
    pub fn service_client(&self) -> Arc<CloudSigmaClient> {
        self.service.clone()
    }
}

#[async_trait::async_trait]
impl CloudClientProvider for ClientProvider {
    async fn client_for(&self, identity: Option<&str>) -> Result<Arc<dyn CloudClientTrait>, CloudError> {
        let Some(user) = identity.filter(|u| !u.is_empty()) else {
            return Ok(self.service.clone());
        };

        let Some(tokens) = &self.tokens else {
            return Err(CloudError::InvalidRequest(format!(
                "identity {user} requested but impersonation is not configured"
            )));
        };

        debug!("Using impersonated client for {}", user);
        let token = tokens.get(user, &self.region).await?;
        Ok(Arc::new(CloudSigmaClient::with_http_client(
            self.http.clone(),
            self.base_url.clone(),
            self.region.clone(),
            Credentials::Bearer(token),
        )))
    }

    fn invalidate(&self, identity: &str) {
        if let Some(tokens) = &self.tokens {
            warn!("Invalidating cached token for {} in {}", identity, self.region);
            tokens.clear_one(identity, &self.region);
        }
    }

    fn region(&self) -> &str {
        &self.region
    }
}
