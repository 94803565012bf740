//! Per-endpoint rate-limit tracking.
//!
//! Records `X-RateLimit-*` response headers and answers one question before a
//! request goes out: is this endpoint certain to be throttled right now, and
//! if so for how long? The answer is advisory — server state may have moved
//! on — but it avoids round trips that would certainly be rejected.

use chrono::Utc;
use dashmap::DashMap;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::time::Duration;
use tracing::debug;

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";

/// Rate-limit window state for one endpoint, as last reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitInfo {
    /// Max requests allowed in the current window.
    pub limit: u32,
    /// Requests left in the current window.
    pub remaining: u32,
    /// Unix seconds at which the window resets.
    pub reset_at: u64,
    /// Server-advised wait in seconds, present on throttled responses.
    pub retry_after: Option<u64>,
}

/// In-memory map of endpoint key → latest rate-limit record.
///
/// Records are replaced wholesale from the most recent response, never
/// merged. Held only in process memory.
#[derive(Default)]
pub struct RateLimitTracker {
    records: DashMap<String, RateLimitInfo>,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the record for an endpoint from response headers.
    ///
    /// All headers are optional; absence means "no information", so the
    /// stored record is only replaced when limit, remaining, and reset are
    /// all present.
    pub fn record_response(&self, endpoint: &str, headers: &HeaderMap) {
        let limit = header_u64(headers, LIMIT_HEADER);
        let remaining = header_u64(headers, REMAINING_HEADER);
        let reset_at = header_u64(headers, RESET_HEADER);
        let retry_after = headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());

        if let (Some(limit), Some(remaining), Some(reset_at)) = (limit, remaining, reset_at) {
            debug!(endpoint, limit, remaining, reset_at, "rate limit record updated");
            self.records.insert(
                endpoint.to_string(),
                RateLimitInfo {
                    limit: limit as u32,
                    remaining: remaining as u32,
                    reset_at,
                    retry_after,
                },
            );
        }
    }

    /// How long a request to this endpoint should wait before being sent.
    /// Zero unless the stored record shows an exhausted window that has not
    /// reset yet.
    pub fn preflight_delay(&self, endpoint: &str) -> Duration {
        let Some(info) = self.records.get(endpoint) else {
            return Duration::ZERO;
        };

        if info.remaining > 0 {
            return Duration::ZERO;
        }

        let now = Utc::now().timestamp();
        let wait = info.reset_at as i64 - now;
        if wait > 0 {
            Duration::from_secs(wait as u64)
        } else {
            Duration::ZERO
        }
    }

    /// Latest record for an endpoint, if any response has carried headers
    /// for it.
    pub fn status(&self, endpoint: &str) -> Option<RateLimitInfo> {
        self.records.get(endpoint).map(|r| r.clone())
    }

    /// Drop all records (logout / test isolation).
    pub fn clear(&self) {
        self.records.clear();
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Normalized endpoint key: path plus sorted query string. Two URLs naming
/// the same resource with reordered parameters share one record. Unparsable
/// URLs fall back to the raw string.
pub fn endpoint_key(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => {
            let mut pairs: Vec<(String, String)> = parsed
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            pairs.sort();
            let query = pairs
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("&");
            format!("{}:{}", parsed.path(), query)
        }
        Err(_) => url.to_string(),
    }
}
