//! Impersonation tokens
//!
//! An end-user identity is exchanged for a short-lived bearer token per
//! region. `TokenCache` keeps one token per `(user, region)` and refreshes it
//! shortly before it expires. Time comes from an injected [`Clock`] so
//! expiry can be tested without sleeping.

use crate::error::CloudError;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Tokens are refreshed this long before they expire
pub const REFRESH_SKEW: Duration = Duration::seconds(60);

/// A bearer token as issued, valid for `expires_in` from receipt.
///
/// Sources report a lifetime rather than an instant; the cache anchors it
/// to its own clock.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    /// Bearer token
    pub token: String,
    /// Lifetime from the moment it was received
    pub expires_in: Duration,
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token").field("expires_in", &self.expires_in).finish_non_exhaustive()
    }
}

/// A cached token and the instant, on the cache's clock, it expires
#[derive(Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Exchanges a user identity for a region-scoped token
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    /// Get a fresh token for `user` in `region`
    async fn get_token(&self, user: &str, region: &str) -> Result<Token, CloudError>;
}

/// Source of the current time
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

#[cfg(any(test, feature = "test-util"))]
impl ManualClock {
    /// Clock frozen at `start`
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Arc::new(Mutex::new(start)) }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

type CacheKey = (String, String);

/// Token cache keyed by `(user, region)`
pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    clock: Arc<dyn Clock>,
    tokens: Mutex<HashMap<CacheKey, CachedToken>>,
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache").field("cached", &self.len()).finish_non_exhaustive()
    }
}

impl TokenCache {
    /// Cache in front of `source`, using the wall clock
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self::with_clock(source, Arc::new(SystemClock))
    }

    /// Cache in front of `source` with an explicit clock
    pub fn with_clock(source: Arc<dyn TokenSource>, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            clock,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Cached token for `(user, region)`, fetching a new one when missing
    /// or within [`REFRESH_SKEW`] of expiry
    pub async fn get(&self, user: &str, region: &str) -> Result<String, CloudError> {
        let key = (user.to_string(), region.to_string());
        let now = self.clock.now();

        if let Some(token) = self.lock().get(&key) {
            if token.expires_at - REFRESH_SKEW > now {
                return Ok(token.token.clone());
            }
        }

        debug!("Fetching token for {} in {}", user, region);
        let issued = self.source.get_token(user, region).await?;
        let expires_at = self.clock.now() + issued.expires_in;
        self.lock().insert(
            key,
            CachedToken {
                token: issued.token.clone(),
                expires_at,
            },
        );
        Ok(issued.token)
    }

    /// Drop every cached token
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Drop the token of one `(user, region)`
    pub fn clear_one(&self, user: &str, region: &str) {
        self.lock().remove(&(user.to_string(), region.to_string()));
    }

    /// Number of cached tokens
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, CachedToken>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Serialize)]
struct ExchangeRequest<'a> {
    user: &'a str,
    region: &'a str,
}

#[derive(Deserialize)]
struct ExchangeResponse {
    access_token: String,
    expires_in: i64,
}

impl From<ExchangeResponse> for Token {
    fn from(body: ExchangeResponse) -> Self {
        Self {
            token: body.access_token,
            expires_in: Duration::seconds(body.expires_in),
        }
    }
}

/// Token source backed by an HTTP token-exchange service.
///
/// The controller authenticates with its own account and receives a token
/// acting as `user`.
#[derive(Debug, Clone)]
pub struct HttpTokenSource {
    client: Client,
    url: String,
    username: String,
    password: String,
}

impl HttpTokenSource {
    /// Token source posting to `url` as the service account
    pub fn new(client: Client, url: String, username: String, password: String) -> Self {
        Self {
            client,
            url,
            username,
            password,
        }
    }
}

#[async_trait::async_trait]
impl TokenSource for HttpTokenSource {
    async fn get_token(&self, user: &str, region: &str) -> Result<Token, CloudError> {
        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&ExchangeRequest { user, region })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CloudError::from_status(status.as_u16(), "token exchange", &body));
        }

        let body: ExchangeResponse = response.json().await?;
        Ok(body.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
        lifetime: Duration,
    }

    #[async_trait::async_trait]
    impl TokenSource for CountingSource {
        async fn get_token(&self, user: &str, region: &str) -> Result<Token, CloudError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Token {
                token: format!("{user}@{region}#{n}"),
                expires_in: self.lifetime,
            })
        }
    }

    fn setup(lifetime: Duration) -> (Arc<CountingSource>, ManualClock, TokenCache) {
        let clock = ManualClock::new(Utc::now());
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            lifetime,
        });
        let cache = TokenCache::with_clock(source.clone(), Arc::new(clock.clone()));
        (source, clock, cache)
    }

    #[tokio::test]
    async fn test_token_reused_until_refresh_window() {
        let (source, clock, cache) = setup(Duration::minutes(10));

        let first = cache.get("alice@example.com", "zrh").await.unwrap();
        let second = cache.get("alice@example.com", "zrh").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        // inside the refresh window
        clock.advance(Duration::minutes(9) + Duration::seconds(30));
        let third = cache.get("alice@example.com", "zrh").await.unwrap();
        assert_ne!(first, third);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_tokens_are_per_region() {
        let (source, _clock, cache) = setup(Duration::minutes(10));

        cache.get("alice@example.com", "zrh").await.unwrap();
        cache.get("alice@example.com", "sjc").await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_clear_one_and_clear() {
        let (source, _clock, cache) = setup(Duration::minutes(10));

        cache.get("alice@example.com", "zrh").await.unwrap();
        cache.get("bob@example.com", "zrh").await.unwrap();

        cache.clear_one("alice@example.com", "zrh");
        assert_eq!(cache.len(), 1);
        cache.get("bob@example.com", "zrh").await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        cache.clear();
        assert!(cache.is_empty());
        cache.get("bob@example.com", "zrh").await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exchange_lifetime_is_anchored_to_the_cache_clock() {
        let body: ExchangeResponse = serde_json::from_str(r#"{"access_token":"t","expires_in":600}"#).unwrap();
        let issued = Token::from(body);
        assert_eq!(issued.expires_in, Duration::minutes(10));

        // Far from the wall clock: an expiry computed from Utc::now() would
        // already be stale here
        let clock = ManualClock::new(Utc::now() + Duration::days(30));
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            lifetime: issued.expires_in,
        });
        let cache = TokenCache::with_clock(source.clone(), Arc::new(clock.clone()));

        cache.get("alice@example.com", "zrh").await.unwrap();
        clock.advance(Duration::minutes(5));
        cache.get("alice@example.com", "zrh").await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::minutes(5));
        cache.get("alice@example.com", "zrh").await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }
}
