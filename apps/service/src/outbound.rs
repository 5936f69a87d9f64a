//! Outbound transport to the database controller.
//!
//! The authenticated REST layer (HMAC signing, time-delta handshake) is an
//! external collaborator; this seam only carries the POST bodies. Tests
//! substitute scripted transports.

use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use url::Url;

/// Controller-facing POST transport. Any `Err` is a transport failure; an
/// `Ok` carries the controller's parsed JSON reply.
#[async_trait]
pub trait ControllerTransport: Send + Sync {
    async fn post_binary(&self, path: &str, body: Vec<u8>) -> Result<serde_json::Value>;
    async fn post_json(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value>;
}

/// Extract the `status` string of a controller reply.
pub fn reply_status(reply: &serde_json::Value) -> Option<&str> {
    reply.as_object()?.get("status")?.as_str()
}

/// reqwest-backed controller transport. The base URL follows the
/// `database_server` configuration key and may be swapped on reload.
pub struct HttpControllerTransport {
    client: reqwest::Client,
    base_url: Mutex<Option<Url>>,
}

impl HttpControllerTransport {
    pub fn new() -> Result<Self> {
        let client =
            reqwest::Client::builder().timeout(std::time::Duration::from_secs(60)).build()?;
        Ok(Self { client, base_url: Mutex::new(None) })
    }

    pub fn set_base_url(&self, base_url: Url) {
        *self.base_url.lock().expect("controller base url mutex poisoned") = Some(base_url);
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        let base = self
            .base_url
            .lock()
            .expect("controller base url mutex poisoned")
            .clone()
            .ok_or_else(|| anyhow!("database server URL is not configured"))?;
        base.join(path).map_err(|error| anyhow!("invalid controller endpoint {path}: {error}"))
    }
}

#[async_trait]
impl ControllerTransport for HttpControllerTransport {
    async fn post_binary(&self, path: &str, body: Vec<u8>) -> Result<serde_json::Value> {
        let endpoint = self.endpoint(path)?;
        let response = self
            .client
            .post(endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await?;
        Ok(response.json().await?)
    }

    async fn post_json(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let endpoint = self.endpoint(path)?;
        let response = self.client.post(endpoint).json(&body).send().await?;
        Ok(response.json().await?)
    }
}
