//! Typed convenience layer over [`SecureClient`].
//!
//! JSON in, JSON out: bodies are sent with `Content-Type: application/json`,
//! 2xx responses deserialize into the caller's type, and non-2xx responses
//! become [`Error::Api`] carrying the server's `detail`/`message` text.

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::client::{ApiResponse, RequestBody, RequestOptions, SecureClient};
use crate::errors::{Error, Result};

/// Typed API handle. Cheap to clone; shares the underlying client.
#[derive(Clone)]
pub struct Api {
    client: SecureClient,
}

impl Api {
    pub fn new(client: SecureClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &SecureClient {
        &self.client
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let options = RequestOptions::default().require_csrf(false);
        let resp = self.client.send(Method::GET, path, options).await?;
        Self::into_json(resp)
    }

    pub async fn post<T: DeserializeOwned>(&self, path: &str, body: Option<Value>) -> Result<T> {
        self.send_json(Method::POST, path, body).await
    }

    pub async fn put<T: DeserializeOwned>(&self, path: &str, body: Option<Value>) -> Result<T> {
        self.send_json(Method::PUT, path, body).await
    }

    pub async fn patch<T: DeserializeOwned>(&self, path: &str, body: Option<Value>) -> Result<T> {
        self.send_json(Method::PATCH, path, body).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self
            .client
            .send(Method::DELETE, path, RequestOptions::default())
            .await?;
        Self::into_json(resp)
    }

    /// Upload a file as `multipart/form-data`. Always a mutating call, so
    /// the CSRF token is always attached — there is no override.
    pub async fn upload<T: DeserializeOwned>(
        &self,
        path: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<T> {
        let options = RequestOptions {
            body: RequestBody::Multipart {
                file_name: file_name.to_string(),
                bytes,
            },
            // uploads never skip CSRF
            require_csrf: true,
            ..RequestOptions::default()
        };
        let resp = self.client.send(Method::POST, path, options).await?;
        Self::into_json(resp)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T> {
        let options = match body {
            Some(value) => RequestOptions::json(value),
            None => RequestOptions::default(),
        };
        let resp = self.client.send(method, path, options).await?;
        Self::into_json(resp)
    }

    fn into_json<T: DeserializeOwned>(resp: ApiResponse) -> Result<T> {
        if !resp.is_success() {
            return Err(Error::Api {
                status: resp.status().as_u16(),
                detail: resp.error_detail(),
            });
        }
        resp.json()
    }
}
