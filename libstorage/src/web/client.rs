use std::sync::Arc;

use async_trait::async_trait;
use common::{ChunkData, ChunkKey, DataInfo, ErrorMode, IndexItem, StorageLevel, codec};
use reqwest::{Client, Response, StatusCode, header};

use super::{ReadRequest, storage_path};
use crate::api::{StorageApi, StorageConnector};
use crate::error::StorageError;

/// Storage access through the HTTP tunnel of a web endpoint.
pub struct WebStorageApi {
    session_id: String,
    base_url: String,
    client: Client,
}

impl WebStorageApi {
    pub fn new(session_id: impl Into<String>, base_url: &str, client: Client) -> Self {
        Self {
            session_id: session_id.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn url(&self, key: &ChunkKey) -> String {
        format!(
            "{}{}",
            self.base_url,
            storage_path(&self.session_id, key.as_str())
        )
    }

    async fn read_body(&self, key: &ChunkKey, resp: Response) -> Result<Vec<u8>, StorageError> {
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StorageError::KeyNotFound {
                session_id: self.session_id.clone(),
                key: key.clone(),
            });
        }
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(StorageError::Remote {
                status: status.as_u16(),
                message,
            });
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

#[async_trait]
impl StorageApi for WebStorageApi {
    async fn get(
        &self,
        key: &ChunkKey,
        conditions: Option<&[IndexItem]>,
    ) -> Result<ChunkData, StorageError> {
        let resp = match conditions {
            None => self.client.get(self.url(key)).send().await?,
            Some(conditions) => {
                let body = codec::serialize(&ReadRequest {
                    conditions: Some(conditions.to_vec()),
                })?;
                self.client
                    .post(self.url(key))
                    .header(header::CONTENT_TYPE, codec::CONTENT_TYPE)
                    .body(body)
                    .send()
                    .await?
            }
        };
        let bytes = self.read_body(key, resp).await?;
        Ok(codec::deserialize(&bytes)?)
    }

    async fn put(
        &self,
        key: &ChunkKey,
        value: ChunkData,
        level: StorageLevel,
    ) -> Result<DataInfo, StorageError> {
        let body = codec::serialize(&value)?;
        let resp = self
            .client
            .put(self.url(key))
            .query(&[("level", level.as_str())])
            .header(header::CONTENT_TYPE, codec::CONTENT_TYPE)
            .body(body)
            .send()
            .await?;
        let bytes = self.read_body(key, resp).await?;
        Ok(codec::deserialize(&bytes)?)
    }

    async fn delete(&self, _key: &ChunkKey, _error: ErrorMode) -> Result<(), StorageError> {
        Err(StorageError::Unsupported("delete"))
    }

    async fn list(&self) -> Result<Vec<ChunkKey>, StorageError> {
        Err(StorageError::Unsupported("list"))
    }
}

/// Hands out tunnel clients; the node address is resolved server side.
pub struct WebConnector {
    base_url: String,
    client: Client,
}

impl WebConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: Client::new(),
        }
    }
}

impl StorageConnector for WebConnector {
    fn connect(
        &self,
        session_id: &str,
        _address: &str,
    ) -> Result<Arc<dyn StorageApi>, StorageError> {
        Ok(Arc::new(WebStorageApi::new(
            session_id,
            &self.base_url,
            self.client.clone(),
        )))
    }
}
