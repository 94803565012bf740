use std::path::PathBuf;
use std::time::Duration;

/// Client configuration.
///
/// Defaults match the backend's documented contract: 30 s request timeout,
/// 3 retries, 1 s base backoff doubling per attempt.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the backend, e.g. `http://localhost:8000`.
    pub base_url: String,
    /// Path of the CSRF token endpoint.
    pub token_path: String,
    /// Per-attempt request timeout.
    pub timeout: Duration,
    /// Maximum retries after the initial attempt (429 / transport errors).
    pub max_retries: u32,
    /// Base for exponential backoff: `base * 2^attempt`.
    pub base_backoff_ms: u64,
    /// Backoff cap.
    pub max_backoff_ms: u64,
    /// Random jitter added to each computed backoff. 0 keeps waits exact.
    pub jitter_ms: u64,
    /// Substitute a session-local placeholder token when the token endpoint
    /// is unreachable. Development convenience only; refused in production.
    pub dev_fallback_token: bool,
    /// Durable token storage location. `None` keeps the token in memory only.
    pub token_store_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".into(),
            token_path: "/api/csrf-token".into(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            base_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            jitter_ms: 0,
            dev_fallback_token: false,
            token_store_path: None,
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn base_backoff_ms(mut self, ms: u64) -> Self {
        self.base_backoff_ms = ms;
        self
    }

    pub fn max_backoff_ms(mut self, ms: u64) -> Self {
        self.max_backoff_ms = ms;
        self
    }

    pub fn jitter_ms(mut self, ms: u64) -> Self {
        self.jitter_ms = ms;
        self
    }

    pub fn dev_fallback_token(mut self, enabled: bool) -> Self {
        self.dev_fallback_token = enabled;
        self
    }

    pub fn token_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.token_store_path = Some(path.into());
        self
    }

    /// Full URL of the token endpoint.
    pub fn token_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.token_path)
    }
}

/// Load configuration from the environment (`INVENTO_*` variables).
///
/// Unset or unparsable values fall back to defaults. Enabling the dev
/// fallback token in production is refused outright.
pub fn load() -> anyhow::Result<ClientConfig> {
    dotenvy::dotenv().ok();

    let dev_fallback_token = std::env::var("INVENTO_DEV_FALLBACK_TOKEN")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if dev_fallback_token {
        let env_mode = std::env::var("INVENTO_ENV")
            .or_else(|_| std::env::var("RUST_ENV"))
            .unwrap_or_default();
        if env_mode == "production" {
            anyhow::bail!(
                "INVENTO_DEV_FALLBACK_TOKEN is enabled in production. \
                 The placeholder token masks backend unavailability and must \
                 never ship; unset it or switch INVENTO_ENV."
            );
        }
    }

    let defaults = ClientConfig::default();

    Ok(ClientConfig {
        base_url: std::env::var("INVENTO_API_URL").unwrap_or(defaults.base_url),
        token_path: std::env::var("INVENTO_CSRF_TOKEN_PATH").unwrap_or(defaults.token_path),
        timeout: std::env::var("INVENTO_REQUEST_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.timeout),
        max_retries: std::env::var("INVENTO_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_retries),
        base_backoff_ms: std::env::var("INVENTO_BASE_BACKOFF_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.base_backoff_ms),
        max_backoff_ms: defaults.max_backoff_ms,
        jitter_ms: std::env::var("INVENTO_BACKOFF_JITTER_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.jitter_ms),
        dev_fallback_token,
        token_store_path: std::env::var("INVENTO_TOKEN_STORE").ok().map(PathBuf::from),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.timeout, Duration::from_secs(30));
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.base_backoff_ms, 1000);
        assert!(!cfg.dev_fallback_token);
    }

    #[test]
    fn test_token_url_joins_without_double_slash() {
        let cfg = ClientConfig::new("http://localhost:8000/");
        assert_eq!(cfg.token_url(), "http://localhost:8000/api/csrf-token");
    }

    #[test]
    fn test_builder_setters() {
        let cfg = ClientConfig::new("http://api.example.com")
            .timeout(Duration::from_secs(5))
            .max_retries(1)
            .base_backoff_ms(50)
            .dev_fallback_token(true);
        assert_eq!(cfg.timeout, Duration::from_secs(5));
        assert_eq!(cfg.max_retries, 1);
        assert_eq!(cfg.base_backoff_ms, 50);
        assert!(cfg.dev_fallback_token);
    }
}
