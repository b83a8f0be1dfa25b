//! Object storage of box files, reached through the storage worker's HTTP API.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::error::{VboxError, upstream};

/// One stored object as returned by a listing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    #[serde(default)]
    pub size: u64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// All objects whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, VboxError>;
    /// Body of `key`, or `None` if no such object exists.
    async fn get(&self, key: &str) -> Result<Option<String>, VboxError>;
    /// Create or overwrite `key`.
    async fn put(&self, key: &str, body: &str) -> Result<(), VboxError>;
    /// Remove `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), VboxError>;
}

#[derive(Deserialize)]
struct Listing {
    #[serde(default)]
    objects: Vec<ObjectMeta>,
    #[serde(default)]
    truncated: bool,
}

/// Client for the storage worker.
pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpObjectStore {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, VboxError> {
        let listing: Listing = self
            .client
            .get(self.url("/api"))
            .query(&[("folderId", prefix)])
            .send()
            .await
            .map_err(|e| upstream("storage list", e))?
            .error_for_status()
            .map_err(|e| upstream("storage list", e))?
            .json()
            .await
            .map_err(|e| upstream("storage list", e))?;
        if listing.truncated {
            warn!(prefix, returned = listing.objects.len(), "storage listing truncated");
        }
        debug!(prefix, objects = listing.objects.len(), "listed objects");
        Ok(listing.objects)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, VboxError> {
        let resp = self
            .client
            .get(self.url("/api"))
            .query(&[("fileId", key)])
            .send()
            .await
            .map_err(|e| upstream("storage get", e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = resp
            .error_for_status()
            .map_err(|e| upstream("storage get", e))?
            .text()
            .await
            .map_err(|e| upstream("storage get", e))?;
        Ok(Some(body))
    }

    async fn put(&self, key: &str, body: &str) -> Result<(), VboxError> {
        self.client
            .post(self.url("/api/save"))
            .json(&json!({ "fileId": key, "data": body }))
            .send()
            .await
            .map_err(|e| upstream("storage save", e))?
            .error_for_status()
            .map_err(|e| upstream("storage save", e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), VboxError> {
        let resp = self
            .client
            .delete(self.url("/api"))
            .json(&json!({ "fileId": key }))
            .send()
            .await
            .map_err(|e| upstream("storage delete", e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        resp.error_for_status()
            .map_err(|e| upstream("storage delete", e))?;
        Ok(())
    }
}

/// Sum of object sizes under `prefix`.
pub async fn prefix_size(store: &dyn ObjectStore, prefix: &str) -> Result<u64, VboxError> {
    Ok(store.list(prefix).await?.iter().map(|o| o.size).sum())
}
