//! CloudSigma API client
//!
//! Implements the CloudSigma 2.0 REST API for servers, drives, IPs and VLANs.
//! Based on the API structure: /api/2.0/{servers,drives,ips,vlans}/

use crate::common::{Credentials, HttpClient, ListResponse};
use crate::error::CloudError;
use crate::models::*;
use crate::cloud_trait::CloudClientTrait;
use crate::update::ServerUpdate;
use reqwest::Client;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Default request timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// CloudSigma API client acting under one identity
#[derive(Debug, Clone)]
pub struct CloudSigmaClient {
    http: HttpClient,
    region: String,
}

/// Default API endpoint of a region
#[must_use]
pub fn region_api_url(region: &str) -> String {
    format!("https://{region}.cloudsigma.com/api/2.0")
}

impl CloudSigmaClient {
    /// Create a new client
    ///
    /// # Arguments
    /// * `base_url` - API base URL (e.g., "https://zrh.cloudsigma.com/api/2.0")
    /// * `region` - Region name, used for token exchange and logging
    /// * `credentials` - Basic auth for the service account, or a bearer token
    pub fn new(base_url: String, region: String, credentials: Credentials) -> Result<Self, CloudError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self::with_http_client(client, base_url, region, credentials))
    }

    /// Create a client sharing an existing connection pool
    pub fn with_http_client(client: Client, base_url: String, region: String, credentials: Credentials) -> Self {
        Self {
            http: HttpClient::new(client, base_url, credentials),
            region,
        }
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        self.http.base_url()
    }

    /// Unwrap the first object of a list-shaped response (create and clone calls)
    fn first<T>(response: ListResponse<T>, context: &str) -> Result<T, CloudError> {
        response
            .objects
            .into_iter()
            .next()
            .ok_or_else(|| CloudError::Api {
                status: 200,
                message: format!("{context}: empty response"),
            })
    }
}

#[async_trait::async_trait]
impl CloudClientTrait for CloudSigmaClient {
    fn region(&self) -> &str {
        &self.region
    }

    async fn validate_credentials(&self) -> Result<(), CloudError> {
        debug!("Validating CloudSigma credentials for region {}", self.region);
        let _: serde_json::Value = self.http.get("/profile/").await?;
        debug!("Credentials validated successfully");
        Ok(())
    }

    async fn create_server(&self, request: &CreateServerRequest) -> Result<Server, CloudError> {
        debug!("Creating server {}", request.name);
        let body = json!({ "objects": [request] });
        let response: ListResponse<Server> = self.http.post("/servers/", &body).await?;
        Self::first(response, "create server")
    }

    async fn get_server(&self, uuid: &str) -> Result<Server, CloudError> {
        self.http.get(&format!("/servers/{uuid}/")).await
    }

    async fn list_servers(&self) -> Result<Vec<Server>, CloudError> {
        self.http.fetch_all("/servers/detail/").await
    }

    async fn update_server(&self, uuid: &str, update: &ServerUpdate) -> Result<Server, CloudError> {
        let body = serde_json::to_value(update)?;
        self.http.put(&format!("/servers/{uuid}/"), &body).await
    }

    async fn start_server(&self, uuid: &str) -> Result<(), CloudError> {
        self.http.action(&format!("/servers/{uuid}/"), "start").await
    }

    async fn stop_server(&self, uuid: &str) -> Result<(), CloudError> {
        self.http.action(&format!("/servers/{uuid}/"), "stop").await
    }

    async fn delete_server(&self, uuid: &str, with_drives: bool) -> Result<(), CloudError> {
        let path = if with_drives {
            format!("/servers/{uuid}/?recurse=all_drives")
        } else {
            format!("/servers/{uuid}/")
        };
        self.http.delete(&path).await
    }

    async fn get_drive(&self, uuid: &str) -> Result<Drive, CloudError> {
        self.http.get(&format!("/drives/{uuid}/")).await
    }

    async fn list_drives(&self) -> Result<Vec<Drive>, CloudError> {
        self.http.fetch_all("/drives/detail/").await
    }

    async fn create_drive(&self, request: &CreateDriveRequest) -> Result<Drive, CloudError> {
        debug!("Creating drive {}", request.name);
        let body = json!({ "objects": [request] });
        let response: ListResponse<Drive> = self.http.post("/drives/", &body).await?;
        Self::first(response, "create drive")
    }

    async fn clone_drive(&self, source_uuid: &str, request: &CloneDriveRequest) -> Result<Drive, CloudError> {
        debug!("Cloning drive {} into {}", source_uuid, request.name);
        let body = serde_json::to_value(request)?;
        let response: ListResponse<Drive> = self
            .http
            .action_with_body(&format!("/drives/{source_uuid}/"), "clone", &body)
            .await?;
        Self::first(response, "clone drive")
    }

    async fn resize_drive(&self, uuid: &str, size: u64) -> Result<Drive, CloudError> {
        let drive = self.get_drive(uuid).await?;
        let body = json!({ "name": drive.name, "media": drive.media, "size": size });
        let response: ListResponse<Drive> = self
            .http
            .action_with_body(&format!("/drives/{uuid}/"), "resize", &body)
            .await?;
        Self::first(response, "resize drive")
    }

    async fn delete_drive(&self, uuid: &str) -> Result<(), CloudError> {
        self.http.delete(&format!("/drives/{uuid}/")).await
    }

    async fn list_ips(&self) -> Result<Vec<FloatingIp>, CloudError> {
        self.http.fetch_all("/ips/detail/").await
    }

    async fn get_ip(&self, address: &str) -> Result<FloatingIp, CloudError> {
        self.http.get(&format!("/ips/{address}/")).await
    }

    async fn update_ip_meta(&self, address: &str, meta: &BTreeMap<String, String>) -> Result<FloatingIp, CloudError> {
        let body = json!({ "meta": meta });
        self.http.put(&format!("/ips/{address}/"), &body).await
    }

    async fn list_vlans(&self) -> Result<Vec<Vlan>, CloudError> {
        self.http.fetch_all("/vlans/detail/").await
    }

    async fn get_vlan(&self, uuid: &str) -> Result<Vlan, CloudError> {
        self.http.get(&format!("/vlans/{uuid}/")).await
    }

    async fn update_vlan_meta(&self, uuid: &str, meta: &BTreeMap<String, String>) -> Result<Vlan, CloudError> {
        let body = json!({ "meta": meta });
        self.http.put(&format!("/vlans/{uuid}/"), &body).await
    }
}
