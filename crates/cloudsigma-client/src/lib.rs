//! CloudSigma REST API Client
//!
//! A Rust client library for the CloudSigma 2.0 API as used by the
//! infrastructure controllers: servers, drives, IPs and VLANs, with
//! per-identity credential selection and per-server locking for
//! full-object updates.
//!
//! # Example
//!
//! ```no_run
//! use cloudsigma_client::{CloudClientTrait, CloudSigmaClient, Credentials, region_api_url};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = CloudSigmaClient::new(
//!     region_api_url("zrh"),
//!     "zrh".to_string(),
//!     Credentials::Basic {
//!         username: "ops@example.com".to_string(),
//!         password: "secret".to_string(),
//!     },
//! )?;
//!
//! client.validate_credentials().await?;
//! for ip in client.list_ips().await? {
//!     println!("{} subscribed={}", ip.address(), ip.has_subscription());
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod common;
pub mod error;
pub mod lock;
pub mod models;
pub mod nic;
pub mod ownership;
pub mod provider;
pub mod token;
pub mod update;
#[path = "trait.rs"]
pub mod cloud_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::{CloudSigmaClient, region_api_url};
pub use cloud_trait::CloudClientTrait;
pub use common::{Credentials, HttpClient, ListResponse};
pub use error::CloudError;
pub use lock::{KeyedGuard, KeyedLocks};
pub use models::*;
pub use provider::{ClientProvider, CloudClientProvider};
pub use token::{Clock, HttpTokenSource, SystemClock, Token, TokenCache, TokenSource};
pub use update::ServerUpdate;
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockCloudClient, MockProvider};
#[cfg(any(test, feature = "test-util"))]
pub use token::ManualClock;
