//! InventoScan secure API client.
//!
//! Wraps the inventory backend's HTTP API with CSRF token management,
//! per-endpoint rate-limit tracking, and bounded retry with backoff.
//!
//! ```no_run
//! use inventoscan_client::{Api, ClientConfig, SecureClient};
//!
//! # async fn run() -> inventoscan_client::Result<()> {
//! let client = SecureClient::new(ClientConfig::new("http://localhost:8000"));
//! client.initialize().await;
//!
//! let api = Api::new(client);
//! let products: serde_json::Value = api.get("/api/products").await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod client;
pub mod config;
pub mod csrf;
pub mod errors;
pub mod notification;
pub mod rate_limit;

pub use api::Api;
pub use client::{ApiResponse, RequestBody, RequestOptions, SecureClient};
pub use config::ClientConfig;
pub use csrf::TokenManager;
pub use errors::{Error, Result};
pub use notification::{LogNotifier, WaitNotifier};
pub use rate_limit::{RateLimitInfo, RateLimitTracker};
