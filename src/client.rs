//! Secure request client.
//!
//! Wraps one logical HTTP call with CSRF attachment, rate-limit backoff, and
//! bounded retry. Callers get back the transport's own response contract
//! (status + headers + body), buffered so that concurrent callers attached to
//! the same retry chain can each receive the outcome.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use rand::Rng;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::csrf::store::{FileStore, MemoryStore, TokenStore};
use crate::csrf::{TokenManager, CSRF_HEADER};
use crate::errors::{Error, Result};
use crate::notification::{LogNotifier, WaitNotifier};
use crate::rate_limit::{endpoint_key, RateLimitInfo, RateLimitTracker};

/// Buffered HTTP response. Cloneable so a shared retry chain can hand the
/// same outcome to every attached caller.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl ApiResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Deserialize the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| Error::Decode(e.to_string()))
    }

    /// Best-effort error message: the JSON body's `detail` or `message`
    /// field, else a generic fallback.
    pub fn error_detail(&self) -> String {
        serde_json::from_slice::<serde_json::Value>(&self.body)
            .ok()
            .and_then(|v| {
                v.get("detail")
                    .and_then(|d| d.as_str())
                    .or_else(|| v.get("message").and_then(|m| m.as_str()))
                    .map(String::from)
            })
            .unwrap_or_else(|| format!("Request failed with status {}", self.status.as_u16()))
    }

    /// Whether the server rejected the request's CSRF token: a 403 whose
    /// JSON `detail` mentions CSRF. Case-sensitive substring match, carried
    /// over from the backend's wire contract.
    fn is_csrf_rejection(&self) -> bool {
        self.status == StatusCode::FORBIDDEN
            && serde_json::from_slice::<serde_json::Value>(&self.body)
                .ok()
                .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(|d| d.contains("CSRF")))
                .unwrap_or(false)
    }

    fn retry_after_secs(&self) -> Option<u64> {
        self.headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }
}

/// Request body shapes the client knows how to rebuild per attempt.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(serde_json::Value),
    /// Multipart upload with a single `file` part.
    Multipart {
        file_name: String,
        bytes: Vec<u8>,
    },
}

/// Per-request options.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub body: RequestBody,
    /// CSRF attachment for mutating methods. Safe methods never attach a
    /// token regardless of this flag.
    pub require_csrf: bool,
    pub headers: HeaderMap,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            body: RequestBody::Empty,
            require_csrf: true,
            headers: HeaderMap::new(),
        }
    }
}

impl RequestOptions {
    pub fn json(value: serde_json::Value) -> Self {
        Self {
            body: RequestBody::Json(value),
            ..Self::default()
        }
    }

    pub fn require_csrf(mut self, required: bool) -> Self {
        self.require_csrf = required;
        self
    }
}

type SharedChain = Shared<BoxFuture<'static, Result<ApiResponse>>>;

/// Classification of a single attempt.
enum Step {
    /// Final outcome for the caller.
    Done(Result<ApiResponse>),
    /// Transient rejection: retry after this wait.
    Backoff(Duration),
}

struct ClientInner {
    http: reqwest::Client,
    config: ClientConfig,
    tokens: TokenManager,
    rate_limits: RateLimitTracker,
    notifier: Arc<dyn WaitNotifier>,
    /// Endpoint key → in-flight retry chain. At most one active
    /// backoff/retry sequence per endpoint; later callers attach to it.
    retry_chains: DashMap<String, SharedChain>,
}

/// CSRF- and rate-limit-aware HTTP client. Cheap to clone.
#[derive(Clone)]
pub struct SecureClient {
    inner: Arc<ClientInner>,
}

fn requires_csrf(method: &Method) -> bool {
    matches!(method.as_str(), "POST" | "PUT" | "DELETE" | "PATCH")
}

impl SecureClient {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_notifier(config, Arc::new(LogNotifier))
    }

    pub fn with_notifier(config: ClientConfig, notifier: Arc<dyn WaitNotifier>) -> Self {
        // Cookies on every request: the backend session travels with the
        // CSRF token.
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .cookie_store(true)
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build HTTP client");

        let store: Box<dyn TokenStore> = match &config.token_store_path {
            Some(path) => Box::new(FileStore::new(path)),
            None => Box::new(MemoryStore::new()),
        };

        let tokens = TokenManager::new(
            http.clone(),
            config.token_url(),
            config.dev_fallback_token,
            store,
        );

        Self {
            inner: Arc::new(ClientInner {
                http,
                config,
                tokens,
                rate_limits: RateLimitTracker::new(),
                notifier,
                retry_chains: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.inner.tokens
    }

    /// App-start warm-up: best-effort token prefetch, never fails.
    pub async fn initialize(&self) {
        self.inner.tokens.initialize().await;
    }

    /// Latest rate-limit record for an endpoint (URL or endpoint key).
    pub fn rate_limit_status(&self, endpoint: &str) -> Option<RateLimitInfo> {
        let key = self.endpoint_key_for(endpoint);
        self.inner.rate_limits.status(&key)
    }

    /// Drop all rate-limit records (logout / test isolation).
    pub fn clear_rate_limits(&self) {
        self.inner.rate_limits.clear();
    }

    /// Execute one logical request against `path` (absolute URL or path
    /// under the configured base).
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        options: RequestOptions,
    ) -> Result<ApiResponse> {
        let url = self.absolute_url(path);
        let endpoint = endpoint_key(&url);

        let delay = self.inner.rate_limits.preflight_delay(&endpoint);
        if !delay.is_zero() {
            debug!(endpoint = %endpoint, ?delay, "pre-flight rate limit wait");
            self.wait(&endpoint, delay).await;
        }

        if let Some(chain) = self.existing_chain(&endpoint) {
            debug!(endpoint = %endpoint, "attaching to in-flight retry chain");
            return chain.await;
        }

        let mut csrf_retried = false;
        match self
            .step(&method, &url, &endpoint, &options, 0, &mut csrf_retried)
            .await
        {
            Step::Done(result) => result,
            Step::Backoff(wait) => {
                self.join_retry_chain(method, url, endpoint, options, csrf_retried, wait)
                    .await
            }
        }
    }

    /// One attempt plus its classification. The bounded CSRF retry happens
    /// inline (no backoff); rate-limit and transport retries are pushed up
    /// as [`Step::Backoff`] so they run inside the endpoint's shared chain.
    async fn step(
        &self,
        method: &Method,
        url: &str,
        endpoint: &str,
        options: &RequestOptions,
        attempt: u32,
        csrf_retried: &mut bool,
    ) -> Step {
        loop {
            let attach_csrf = requires_csrf(method) && options.require_csrf;

            match self.execute_once(method, url, options, attach_csrf).await {
                Ok(resp) => {
                    self.inner.rate_limits.record_response(endpoint, resp.headers());

                    if attach_csrf && resp.is_csrf_rejection() {
                        if *csrf_retried {
                            return Step::Done(Err(Error::CsrfRejected {
                                detail: resp.error_detail(),
                            }));
                        }
                        warn!(endpoint, "CSRF token rejected, retrying with a fresh one");
                        *csrf_retried = true;
                        self.inner.tokens.invalidate().await;
                        continue;
                    }

                    if resp.status() == StatusCode::TOO_MANY_REQUESTS {
                        let wait = resp
                            .retry_after_secs()
                            .map(Duration::from_secs)
                            .unwrap_or_else(|| self.backoff(attempt));

                        if attempt >= self.inner.config.max_retries {
                            return Step::Done(Err(Error::RateLimited {
                                retry_after_secs: wait.as_secs_f64().ceil() as u64,
                            }));
                        }

                        warn!(
                            endpoint,
                            attempt = attempt + 1,
                            max_retries = self.inner.config.max_retries,
                            ?wait,
                            "rate limited, backing off"
                        );
                        return Step::Backoff(wait);
                    }

                    return Step::Done(Ok(resp));
                }
                Err(e) if e.is_transient() => {
                    if attempt >= self.inner.config.max_retries {
                        return Step::Done(Err(e));
                    }
                    let wait = self.backoff(attempt);
                    warn!(
                        endpoint,
                        attempt = attempt + 1,
                        max_retries = self.inner.config.max_retries,
                        error = %e,
                        ?wait,
                        "transport error, backing off"
                    );
                    return Step::Backoff(wait);
                }
                Err(e) => return Step::Done(Err(e)),
            }
        }
    }

    /// Run the remaining retries for this endpoint in a single shared
    /// chain. The first caller spawns the chain; anyone else arriving while
    /// it runs attaches and receives the same outcome. The chain is a
    /// detached task: abandoning a caller's future does not stop a wait
    /// that has already started.
    async fn join_retry_chain(
        &self,
        method: Method,
        url: String,
        endpoint: String,
        options: RequestOptions,
        csrf_retried: bool,
        first_wait: Duration,
    ) -> Result<ApiResponse> {
        let chain = match self.inner.retry_chains.entry(endpoint.clone()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => {
                let client = self.clone();
                let chain_endpoint = endpoint.clone();
                let task = tokio::spawn(async move {
                    let mut csrf_retried = csrf_retried;
                    let mut attempt = 0;
                    let mut wait = first_wait;
                    let result = loop {
                        client.wait(&chain_endpoint, wait).await;
                        attempt += 1;
                        match client
                            .step(&method, &url, &chain_endpoint, &options, attempt, &mut csrf_retried)
                            .await
                        {
                            Step::Done(result) => break result,
                            Step::Backoff(next_wait) => wait = next_wait,
                        }
                    };
                    client.inner.retry_chains.remove(&chain_endpoint);
                    result
                });

                let chain: SharedChain = async move {
                    match task.await {
                        Ok(result) => result,
                        Err(e) => Err(Error::Transport(format!("retry chain aborted: {e}"))),
                    }
                }
                .boxed()
                .shared();
                slot.insert(chain.clone());
                chain
            }
        };

        chain.await
    }

    /// Build and send a single HTTP attempt, buffering the response.
    async fn execute_once(
        &self,
        method: &Method,
        url: &str,
        options: &RequestOptions,
        attach_csrf: bool,
    ) -> Result<ApiResponse> {
        let mut req = self
            .inner
            .http
            .request(method.clone(), url)
            .headers(options.headers.clone());

        if attach_csrf {
            let token = self.inner.tokens.token().await?;
            req = req.header(CSRF_HEADER, token);
        }

        match &options.body {
            RequestBody::Empty => {}
            RequestBody::Json(value) => {
                req = req.json(value);
            }
            RequestBody::Multipart { file_name, bytes } => {
                let part = reqwest::multipart::Part::bytes(bytes.clone())
                    .file_name(file_name.clone());
                req = req.multipart(reqwest::multipart::Form::new().part("file", part));
            }
        }

        let started = Instant::now();
        let resp = req
            .send()
            .await
            .map_err(|e| Error::from_reqwest(e, started.elapsed().as_millis() as u64))?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp
            .bytes()
            .await
            .map_err(|e| Error::from_reqwest(e, started.elapsed().as_millis() as u64))?;

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }

    /// Exponential backoff for the given attempt: `base * 2^attempt`,
    /// capped, plus optional jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let cfg = &self.inner.config;
        let raw = cfg.base_backoff_ms as f64 * 2_f64.powi(attempt as i32);
        let capped = raw.min(cfg.max_backoff_ms as f64) as u64;
        let jitter = if cfg.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=cfg.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(capped + jitter)
    }

    /// Sleep out a wait, surfacing it to the notifier.
    async fn wait(&self, endpoint: &str, duration: Duration) {
        self.inner.notifier.wait_started(endpoint, duration);
        tokio::time::sleep(duration).await;
        self.inner.notifier.wait_finished(endpoint);
    }

    fn existing_chain(&self, endpoint: &str) -> Option<SharedChain> {
        self.inner
            .retry_chains
            .get(endpoint)
            .map(|entry| entry.value().clone())
    }

    fn absolute_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!(
                "{}/{}",
                self.inner.config.base_url.trim_end_matches('/'),
                path.trim_start_matches('/')
            )
        }
    }

    fn endpoint_key_for(&self, endpoint: &str) -> String {
        endpoint_key(&self.absolute_url(endpoint))
    }
}
