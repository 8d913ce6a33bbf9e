//! Tiered storage of one worker node.
//!
//! Objects are namespaced by session. The memory tier is a map; the disk tier
//! writes one bincode file per object under `<disk_root>/<session>/<key>`.
//! An object lives in exactly one tier at a time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use common::{Band, ChunkData, ChunkKey, DataInfo, IndexItem, StorageLevel, codec, tokenize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::StorageError;

#[derive(Debug, Clone, Default)]
pub struct NodeStorageConfig {
    /// Root of the disk tier; `None` disables it.
    pub disk_root: Option<PathBuf>,
}

type ObjectId = (String, ChunkKey);

pub struct NodeStorage {
    band: Band,
    config: NodeStorageConfig,
    memory: RwLock<HashMap<ObjectId, ChunkData>>,
    on_disk: RwLock<HashMap<ObjectId, u64>>,
}

impl NodeStorage {
    pub fn new(address: impl Into<String>, config: NodeStorageConfig) -> Self {
        Self {
            band: Band::new(address),
            config,
            memory: RwLock::new(HashMap::new()),
            on_disk: RwLock::new(HashMap::new()),
        }
    }

    pub fn band(&self) -> &Band {
        &self.band
    }

    pub fn address(&self) -> &str {
        &self.band.address
    }

    fn path_for(&self, root: &Path, session_id: &str, key: &ChunkKey) -> PathBuf {
        root.join(fs_safe(session_id)).join(fs_safe(key.as_str()))
    }

    fn disk_root(&self) -> Result<&Path, StorageError> {
        self.config
            .disk_root
            .as_deref()
            .ok_or(StorageError::LevelUnavailable(StorageLevel::Disk))
    }

    pub async fn put(
        &self,
        session_id: &str,
        key: &ChunkKey,
        value: ChunkData,
        level: StorageLevel,
    ) -> Result<DataInfo, StorageError> {
        let id = (session_id.to_string(), key.clone());
        let memory_size = value.nbytes();
        let store_size = match level {
            StorageLevel::Memory => {
                self.remove_from_disk(&id).await?;
                self.memory.write().await.insert(id, value);
                memory_size
            }
            StorageLevel::Disk => {
                let root = self.disk_root()?;
                let path = self.path_for(root, session_id, key);
                let bytes = codec::serialize(&value)?;
                if let Some(dir) = path.parent() {
                    fs::create_dir_all(dir).await?;
                }
                let mut f = fs::File::create(&path).await?;
                f.write_all(&bytes).await?;
                f.flush().await?;
                let size = bytes.len() as u64;
                self.memory.write().await.remove(&id);
                self.on_disk.write().await.insert(id, size);
                size
            }
            other => return Err(StorageError::LevelUnavailable(other)),
        };
        debug!(
            "Stored {} for session {} at {} on {}",
            key, session_id, level, self.band
        );
        Ok(DataInfo {
            object_id: key.to_string(),
            level,
            memory_size,
            store_size,
            band: self.band.clone(),
        })
    }

    pub async fn get(
        &self,
        session_id: &str,
        key: &ChunkKey,
        conditions: Option<&[IndexItem]>,
    ) -> Result<ChunkData, StorageError> {
        if let Some(conditions) = conditions
            && !conditions.iter().all(IndexItem::is_plain)
        {
            return Err(StorageError::InvalidConditions);
        }
        let id = (session_id.to_string(), key.clone());
        let cached = self.memory.read().await.get(&id).cloned();
        let value = match cached {
            Some(value) => value,
            None => self.read_from_disk(session_id, &id).await?,
        };
        match conditions {
            Some(conditions) => Ok(value.select(conditions)?),
            None => Ok(value),
        }
    }

    async fn read_from_disk(
        &self,
        session_id: &str,
        id: &ObjectId,
    ) -> Result<ChunkData, StorageError> {
        let not_found = || StorageError::KeyNotFound {
            session_id: session_id.to_string(),
            key: id.1.clone(),
        };
        if !self.on_disk.read().await.contains_key(id) {
            return Err(not_found());
        }
        let root = self.disk_root()?;
        match fs::read(self.path_for(root, session_id, &id.1)).await {
            Ok(buf) => Ok(codec::deserialize(&buf)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_from_disk(&self, id: &ObjectId) -> Result<bool, StorageError> {
        if self.on_disk.write().await.remove(id).is_none() {
            return Ok(false);
        }
        let root = self.disk_root()?;
        match fs::remove_file(self.path_for(root, &id.0, &id.1)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete(&self, session_id: &str, key: &ChunkKey) -> Result<(), StorageError> {
        let id = (session_id.to_string(), key.clone());
        let in_memory = self.memory.write().await.remove(&id).is_some();
        let on_disk = self.remove_from_disk(&id).await?;
        if in_memory || on_disk {
            debug!("Deleted {} of session {} on {}", key, session_id, self.band);
            Ok(())
        } else {
            Err(StorageError::KeyNotFound {
                session_id: session_id.to_string(),
                key: key.clone(),
            })
        }
    }

    /// Keys currently held for `session_id`, in no particular order.
    pub async fn keys(&self, session_id: &str) -> Vec<ChunkKey> {
        let mut keys: Vec<ChunkKey> = self
            .memory
            .read()
            .await
            .keys()
            .filter(|(s, _)| s == session_id)
            .map(|(_, k)| k.clone())
            .collect();
        keys.extend(
            self.on_disk
                .read()
                .await
                .keys()
                .filter(|(s, _)| s == session_id)
                .map(|(_, k)| k.clone()),
        );
        keys
    }

    /// Drops everything held for `session_id`, including objects no
    /// metadata points at. Returns how many objects were removed.
    pub async fn clear_session(&self, session_id: &str) -> Result<usize, StorageError> {
        let mut removed = {
            let mut memory = self.memory.write().await;
            let before = memory.len();
            memory.retain(|(s, _), _| s != session_id);
            before - memory.len()
        };
        let had_disk = {
            let mut on_disk = self.on_disk.write().await;
            let before = on_disk.len();
            on_disk.retain(|(s, _), _| s != session_id);
            removed += before - on_disk.len();
            before != on_disk.len()
        };
        if had_disk {
            let root = self.disk_root()?;
            match fs::remove_dir_all(root.join(fs_safe(session_id))).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if removed > 0 {
            debug!("Cleared {} objects of session {} on {}", removed, session_id, self.band);
        }
        Ok(removed)
    }

    pub async fn level_of(&self, session_id: &str, key: &ChunkKey) -> Option<StorageLevel> {
        let id = (session_id.to_string(), key.clone());
        if self.memory.read().await.contains_key(&id) {
            Some(StorageLevel::Memory)
        } else if self.on_disk.read().await.contains_key(&id) {
            Some(StorageLevel::Disk)
        } else {
            None
        }
    }
}

fn fs_safe(name: &str) -> String {
    if !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        name.to_string()
    } else {
        tokenize(&[name.as_bytes()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Tensor;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_memory_put_get_delete() {
        let node = NodeStorage::new("127.0.0.1:1", NodeStorageConfig::default());
        let key = ChunkKey::from("k1");
        let info = node
            .put("s1", &key, Tensor::ones(&[2, 2]).into(), StorageLevel::Memory)
            .await
            .unwrap();
        assert_eq!(info.level, StorageLevel::Memory);
        assert_eq!(info.memory_size, 32);
        assert_eq!(info.band.address, "127.0.0.1:1");

        let value = node.get("s1", &key, None).await.unwrap();
        assert_eq!(value.as_tensor().unwrap().data(), &[1.0; 4]);

        // other sessions do not see the object
        assert!(node.get("s2", &key, None).await.unwrap_err().is_not_found());

        node.delete("s1", &key).await.unwrap();
        assert!(node.delete("s1", &key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_disk_tier_round_trip_and_move() {
        let dir = tempdir().unwrap();
        let node = NodeStorage::new(
            "node-a",
            NodeStorageConfig {
                disk_root: Some(dir.path().to_path_buf()),
            },
        );
        let key = ChunkKey::from("disk-key");
        node.put("s1", &key, Tensor::full(&[3], 4.0).into(), StorageLevel::Disk)
            .await
            .unwrap();
        assert!(dir.path().join("s1").join("disk-key").exists());
        assert_eq!(node.level_of("s1", &key).await, Some(StorageLevel::Disk));

        let value = node
            .get("s1", &key, Some(&[IndexItem::range(1, 3)]))
            .await
            .unwrap();
        assert_eq!(value.as_tensor().unwrap().data(), &[4.0, 4.0]);

        // moving back to memory removes the file
        node.put("s1", &key, Tensor::full(&[3], 5.0).into(), StorageLevel::Memory)
            .await
            .unwrap();
        assert!(!dir.path().join("s1").join("disk-key").exists());
        assert_eq!(node.keys("s1").await, vec![key]);
    }

    #[tokio::test]
    async fn test_clear_session_drops_both_tiers() {
        let dir = tempdir().unwrap();
        let node = NodeStorage::new(
            "node-c",
            NodeStorageConfig {
                disk_root: Some(dir.path().to_path_buf()),
            },
        );
        node.put("gone", &ChunkKey::from("m"), Tensor::ones(&[1]).into(), StorageLevel::Memory)
            .await
            .unwrap();
        node.put("gone", &ChunkKey::from("d"), Tensor::ones(&[1]).into(), StorageLevel::Disk)
            .await
            .unwrap();
        node.put("kept", &ChunkKey::from("m"), Tensor::ones(&[1]).into(), StorageLevel::Memory)
            .await
            .unwrap();

        assert_eq!(node.clear_session("gone").await.unwrap(), 2);
        assert!(node.keys("gone").await.is_empty());
        assert!(!dir.path().join("gone").exists());
        assert_eq!(node.keys("kept").await.len(), 1);
        assert_eq!(node.clear_session("gone").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_levels_and_conditions() {
        let node = NodeStorage::new("n", NodeStorageConfig::default());
        let key = ChunkKey::from("k");
        let err = node
            .put("s", &key, ChunkData::Bytes(vec![1]), StorageLevel::Disk)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::LevelUnavailable(StorageLevel::Disk)));
        let err = node
            .put("s", &key, ChunkData::Bytes(vec![1]), StorageLevel::Gpu)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::LevelUnavailable(StorageLevel::Gpu)));

        node.put("s", &key, Tensor::ones(&[4]).into(), StorageLevel::Memory)
            .await
            .unwrap();
        let err = node
            .get("s", &key, Some(&[IndexItem::Array(vec![0, 1])]))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidConditions));
    }
}
