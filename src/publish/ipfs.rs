//! IPFS HTTP API content store.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::PublishConfig;
use crate::error::{ConfigError, PublishError};

/// Identifier and locator returned by a content-addressed store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub content_id: String,
    pub locator: String,
}

/// Content-addressed blob store.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn put(&self, file_name: &str, bytes: Vec<u8>) -> Result<StoredObject, PublishError>;
}

/// Response of `/api/v0/add`.
#[derive(Debug, Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

/// Uploads through an IPFS node's HTTP API (`/api/v0/add`).
pub struct IpfsStore {
    api_url: String,
    gateway_url: String,
    project_id: Option<String>,
    project_secret: Option<SecretString>,
    client: reqwest::Client,
}

impl IpfsStore {
    pub fn new(config: &PublishConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(config.upload_timeout)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        Ok(Self {
            api_url: config.ipfs_api_url.trim_end_matches('/').to_string(),
            gateway_url: config.ipfs_gateway_url.trim_end_matches('/').to_string(),
            project_id: config.ipfs_project_id.clone(),
            project_secret: config.ipfs_project_secret.clone(),
            client,
        })
    }

    fn locator(&self, cid: &str) -> String {
        format!("{}/ipfs/{cid}", self.gateway_url)
    }
}

#[async_trait]
impl ContentStore for IpfsStore {
    async fn put(&self, file_name: &str, bytes: Vec<u8>) -> Result<StoredObject, PublishError> {
        let size = bytes.len();
        let part = Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str("application/zip")
            .map_err(|e| PublishError::Upload(e.to_string()))?;
        let form = Form::new().part("file", part);

        let mut request = self
            .client
            .post(format!("{}/api/v0/add", self.api_url))
            .query(&[("pin", "true")])
            .multipart(form);
        if let Some(project_id) = &self.project_id {
            request = request.basic_auth(
                project_id,
                self.project_secret.as_ref().map(|s| s.expose_secret()),
            );
        }

        let response = request
            .send()
            .await
            .map_err(|e| PublishError::Upload(format!("IPFS request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PublishError::Upload(format!(
                "IPFS add returned {status}: {}",
                body.trim()
            )));
        }

        let added: AddResponse = response
            .json()
            .await
            .map_err(|e| PublishError::Upload(format!("Failed to parse IPFS response: {e}")))?;

        tracing::debug!(cid = %added.hash, size, "Uploaded artifact to IPFS");

        Ok(StoredObject {
            locator: self.locator(&added.hash),
            content_id: added.hash,
        })
    }
}
