//! Client for posting manifests to a remote pool.
//!
//! Configuration is via environment variables:
//! - `ROSTER_ENDPOINT` - base URL (default: `http://localhost:8080`)
//! - `ROSTER_USER_AGENT` - `User-Agent` header (default: `roster/<version>`)

use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, StatusCode};
use roster_core::Manifest;
use roster_schema::{parse_slice, to_json_vec, DecodeError, EncodeError, TypeRegistry};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_ENDPOINT: &str = "http://localhost:8080";
pub const DEFAULT_USER_AGENT: &str = concat!("roster/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server replied {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("decoding reply: {0}")]
    Decode(#[from] DecodeError),
}

#[derive(Debug, Clone)]
pub struct ManifestClient {
    endpoint: String,
    user_agent: String,
    client: Client,
}

impl ManifestClient {
    pub fn from_env() -> Self {
        let endpoint = std::env::var("ROSTER_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());
        let user_agent = std::env::var("ROSTER_USER_AGENT").unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string());
        Self::new(endpoint, user_agent)
    }

    pub fn new(endpoint: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into(), user_agent: user_agent.into(), client: Client::new() }
    }

    pub fn endpoint(&self) -> &str { &self.endpoint }

    pub fn user_agent(&self) -> &str { &self.user_agent }

    /// Target URL for a manifest: `<endpoint>/<apiVersion>/<kind>`.
    pub fn url_for<S, T>(&self, manifest: &Manifest<S, T>) -> String {
        format!("{}/{}/{}", self.endpoint.trim_end_matches('/'), manifest.api_version, manifest.kind)
    }

    /// Post the manifest and decode the reply into the same payload types.
    pub async fn send<S, T>(&self, manifest: &Manifest<S, T>) -> Result<Manifest<S, T>, ClientError>
    where
        S: Serialize + DeserializeOwned + Default,
        T: Serialize + DeserializeOwned + Default,
    {
        let body = self.post(manifest).await?;
        Ok(parse_slice(&body)?)
    }

    /// Post a dynamically typed manifest and decode the reply through `registry`.
    pub async fn send_auto(&self, manifest: &Manifest, registry: &TypeRegistry) -> Result<Manifest, ClientError> {
        let body = self.post(manifest).await?;
        Ok(registry.auto_parse(&body)?)
    }

    async fn post<S: Serialize, T: Serialize>(&self, manifest: &Manifest<S, T>) -> Result<Vec<u8>, ClientError> {
        let url = self.url_for(manifest);
        let body = to_json_vec(manifest)?;
        debug!(url = %url, bytes = body.len(), "sending manifest");
        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .header(USER_AGENT, &self.user_agent)
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status { status, body });
        }
        Ok(response.bytes().await?.to_vec())
    }
}
