//! CSRF token management.
//!
//! Maintains at most one valid token for the process: cached in memory,
//! persisted through a [`TokenStore`], and refreshed transparently when it
//! expires or the server rejects it.

pub mod store;

use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::errors::{Error, Result};
use store::{StoredToken, TokenStore};

/// Header carrying the token on mutating requests.
pub const CSRF_HEADER: &str = "X-CSRF-Token";

/// Expiry applied when the server omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    csrf_token: String,
    expires_in: Option<i64>,
}

/// Fetches, caches, and persists the CSRF token.
///
/// The in-memory slot doubles as the fetch lock: concurrent callers finding
/// an expired token wait on the same mutex, and only the first one hitting
/// the network performs the refresh.
pub struct TokenManager {
    http: reqwest::Client,
    token_url: String,
    dev_fallback: bool,
    store: Box<dyn TokenStore>,
    cached: Mutex<Option<StoredToken>>,
}

impl TokenManager {
    pub fn new(
        http: reqwest::Client,
        token_url: impl Into<String>,
        dev_fallback: bool,
        store: Box<dyn TokenStore>,
    ) -> Self {
        Self {
            http,
            token_url: token_url.into(),
            dev_fallback,
            store,
            cached: Mutex::new(None),
        }
    }

    /// Current token value, fetching a new one if the cached value is absent
    /// or expired. Never returns a token whose expiry has passed.
    pub async fn token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if token.is_fresh(Utc::now()) {
                return Ok(token.value.clone());
            }
            *cached = None;
        }

        // Durable copy from a previous session, if still fresh.
        if let Some(token) = self.store.load().await {
            let value = token.value.clone();
            *cached = Some(token);
            return Ok(value);
        }

        self.fetch_locked(&mut cached).await
    }

    /// Drop the cached token and its durable copy. Called when the server
    /// signals token invalidity.
    pub async fn invalidate(&self) {
        let mut cached = self.cached.lock().await;
        *cached = None;
        self.store.clear().await;
        debug!("CSRF token invalidated");
    }

    /// Force-fetch a new token, replacing whatever is cached.
    pub async fn refresh(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        *cached = None;
        self.fetch_locked(&mut cached).await
    }

    /// Best-effort token warm-up for application start. Failures are logged,
    /// never surfaced.
    pub async fn initialize(&self) {
        match self.token().await {
            Ok(_) => debug!("CSRF protection initialized"),
            Err(e) => debug!(error = %e, "CSRF warm-up skipped"),
        }
    }

    async fn fetch_locked(&self, cached: &mut Option<StoredToken>) -> Result<String> {
        match self.fetch_new_token().await {
            Ok(token) => {
                let value = token.value.clone();
                self.store.save(&token).await;
                *cached = Some(token);
                Ok(value)
            }
            Err(e) if self.dev_fallback => {
                // Session-local placeholder so offline development is not
                // blocked. Deliberately neither cached nor persisted: the
                // next call retries the real endpoint.
                debug!(error = %e, "token endpoint unreachable, using dev placeholder");
                Ok(format!("dev-token-{}", Utc::now().timestamp_millis()))
            }
            Err(e) => Err(e),
        }
    }

    /// Credentialed GET against the token endpoint.
    async fn fetch_new_token(&self) -> Result<StoredToken> {
        let resp = self
            .http
            .get(&self.token_url)
            .send()
            .await
            .map_err(|e| Error::TokenFetch(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            warn!(%status, "token endpoint returned non-success");
            return Err(Error::TokenFetch(format!(
                "token endpoint returned {status}"
            )));
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| Error::TokenFetch(format!("invalid token response: {e}")))?;

        let expires_in = body.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        let token = StoredToken::new(
            body.csrf_token,
            Utc::now() + ChronoDuration::seconds(expires_in),
        );

        debug!(expires_in, "fetched new CSRF token");
        Ok(token)
    }

    #[cfg(test)]
    pub(crate) async fn set_cached(&self, token: StoredToken) {
        *self.cached.lock().await = Some(token);
    }
}
