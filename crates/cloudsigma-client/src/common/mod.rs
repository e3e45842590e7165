//! Common utilities for the CloudSigma API client
//!
//! Provides the authenticated HTTP plumbing shared by all resource operations.

pub mod query;

use crate::error::CloudError;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use tracing::debug;

/// Page size used when walking list endpoints
pub const PAGE_SIZE: u64 = 100;

/// List response wrapper from the CloudSigma API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse<T> {
    /// Paging information
    pub meta: ListMeta,
    /// Objects on this page
    pub objects: Vec<T>,
}

/// Paging information of a list response
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct ListMeta {
    /// Page size applied by the server
    #[serde(default)]
    pub limit: u64,
    /// Offset of the first object on this page
    #[serde(default)]
    pub offset: u64,
    /// Total number of objects across all pages
    #[serde(default)]
    pub total_count: u64,
}

/// How requests are authenticated
#[derive(Clone)]
pub enum Credentials {
    /// The controller's own account (HTTP basic auth)
    Basic {
        /// Account email
        username: String,
        /// Account password
        password: String,
    },
    /// An impersonated end user (OAuth bearer token from the token exchange)
    Bearer(String),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic { username, .. } => f.debug_struct("Basic").field("username", username).finish_non_exhaustive(),
            Self::Bearer(_) => f.write_str("Bearer(..)"),
        }
    }
}

/// HTTP client wrapper with authentication
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    base_url: String,
    credentials: Credentials,
}

impl HttpClient {
    /// Create a new HTTP client wrapper
    pub fn new(client: Client, base_url: String, credentials: Credentials) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        }
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build a full URL from a path
    pub fn build_url(&self, path: &str) -> String {
        if path.starts_with("http") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("Accept", "application/json");
        match &self.credentials {
            Credentials::Basic { username, password } => request.basic_auth(username, Some(password)),
            Credentials::Bearer(token) => request.bearer_auth(token),
        }
    }

    /// Turn a non-success response into a typed error
    async fn check(response: Response, context: &str) -> Result<Response, CloudError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(CloudError::from_status(status.as_u16(), context, &body))
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, CloudError> {
        let url = self.build_url(path);
        debug!("GET {}", url);

        let response = self.authorize(self.client.get(&url)).send().await?;
        let response = Self::check(response, &format!("GET {path}")).await?;
        Ok(response.json().await?)
    }

    /// Make a POST request
    pub async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, CloudError> {
        let url = self.build_url(path);
        debug!("POST {}", url);

        let response = self.authorize(self.client.post(&url)).json(body).send().await?;
        let response = Self::check(response, &format!("POST {path}")).await?;
        Ok(response.json().await?)
    }

    /// Make a PUT request (full-resource update)
    pub async fn put<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, CloudError> {
        let url = self.build_url(path);
        debug!("PUT {} with body: {}", url, serde_json::to_string(body).unwrap_or_default());

        let response = self.authorize(self.client.put(&url)).json(body).send().await?;
        let response = Self::check(response, &format!("PUT {path}")).await?;
        Ok(response.json().await?)
    }

    /// Invoke a resource action (`POST {path}action/?do={action}`), discarding the body
    pub async fn action(&self, path: &str, action: &str) -> Result<(), CloudError> {
        let url = self.build_url(&format!("{path}action/?do={}", urlencoding::encode(action)));
        debug!("POST {}", url);

        let response = self.authorize(self.client.post(&url)).send().await?;
        Self::check(response, &format!("{action} {path}")).await?;
        Ok(())
    }

    /// Invoke a resource action that returns an object
    pub async fn action_with_body<T: DeserializeOwned>(
        &self,
        path: &str,
        action: &str,
        body: &serde_json::Value,
    ) -> Result<T, CloudError> {
        let url = self.build_url(&format!("{path}action/?do={}", urlencoding::encode(action)));
        debug!("POST {}", url);

        let response = self.authorize(self.client.post(&url)).json(body).send().await?;
        let response = Self::check(response, &format!("{action} {path}")).await?;
        Ok(response.json().await?)
    }

    /// Make a DELETE request
    pub async fn delete(&self, path: &str) -> Result<(), CloudError> {
        let url = self.build_url(path);
        debug!("DELETE {}", url);

        let response = self.authorize(self.client.delete(&url)).send().await?;
        Self::check(response, &format!("DELETE {path}")).await?;
        Ok(())
    }

    /// Fetch all pages of a list endpoint
    pub async fn fetch_all<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, CloudError> {
        let mut all_results = Vec::new();
        let mut offset = 0;

        loop {
            let page_path = query::with_params(
                path,
                &[("limit", &PAGE_SIZE.to_string()), ("offset", &offset.to_string())],
            );
            let page: ListResponse<T> = self.get(&page_path).await?;
            let fetched = page.objects.len() as u64;
            all_results.extend(page.objects);

            offset += fetched;
            if fetched == 0 || offset >= page.meta.total_count {
                break;
            }
        }

        Ok(all_results)
    }
}
