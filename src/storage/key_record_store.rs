use crate::protocol::SenderKeyRecord;
use crate::storage::{Database, DatabaseError};
use crate::utils::now_millis;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const SENDER_KEYS_TREE: &str = "sender_keys";

#[derive(Error, Debug)]
pub enum KeyRecordStoreError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DatabaseError),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Corrupt key record {key}: {reason}")]
    CorruptKeyRecord { key: String, reason: String },
}

/// 持久化的发送者密钥记录
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyEntity {
    pub address: String,
    pub device_id: u32,
    pub distribution_id: Uuid,
    /// 不透明的记录字节
    pub record: Vec<u8>,
    /// Unix 毫秒
    pub created_at: i64,
}

impl SenderKeyEntity {
    /// 以当前时间戳包装一条记录
    pub fn from_record(
        address: &str,
        device_id: u32,
        distribution_id: Uuid,
        record: &SenderKeyRecord,
    ) -> Result<Self, KeyRecordStoreError> {
        let bytes = record
            .serialize()
            .map_err(|e| KeyRecordStoreError::SerializationError(e.to_string()))?;

        Ok(Self {
            address: address.to_string(),
            device_id,
            distribution_id,
            record: bytes,
            created_at: now_millis(),
        })
    }
}

/// 发送者密钥记录存储
///
/// 以 (分发ID, 地址, 设备ID) 为键，写入即覆盖。
#[derive(Clone)]
pub struct KeyRecordStore {
    db: Database,
}

impl KeyRecordStore {
    pub fn new(db: &Database) -> Result<Self, KeyRecordStoreError> {
        let _ = db.tree(SENDER_KEYS_TREE)?;
        Ok(Self { db: db.clone() })
    }

    fn key(address: &str, device_id: u32, distribution_id: Uuid) -> Vec<u8> {
        format!("{}/{}/{}", distribution_id, address, device_id).into_bytes()
    }

    fn prefix(distribution_id: Uuid) -> Vec<u8> {
        format!("{}/", distribution_id).into_bytes()
    }

    pub fn get(
        &self,
        address: &str,
        device_id: u32,
        distribution_id: Uuid,
    ) -> Result<Option<SenderKeyEntity>, KeyRecordStoreError> {
        let key = Self::key(address, device_id, distribution_id);
        Ok(self.db.get_serialized(SENDER_KEYS_TREE, &key)?)
    }

    /// 插入或替换
    pub fn put(&self, entity: &SenderKeyEntity) -> Result<(), KeyRecordStoreError> {
        let key = Self::key(&entity.address, entity.device_id, entity.distribution_id);
        self.db.put_serialized(SENDER_KEYS_TREE, &key, entity)?;

        debug!(
            "Stored sender key record for {}.{} in {}",
            entity.address, entity.device_id, entity.distribution_id
        );
        Ok(())
    }

    pub fn delete(&self, address: &str, device_id: u32, distribution_id: Uuid) -> Result<(), KeyRecordStoreError> {
        let key = Self::key(address, device_id, distribution_id);
        self.db.delete(SENDER_KEYS_TREE, &key)?;
        Ok(())
    }

    /// 加载并解析记录
    ///
    /// 条目或记录字节无法解析时返回 `CorruptKeyRecord`，由调用方决定丢弃还是上报。
    pub fn load_record(
        &self,
        address: &str,
        device_id: u32,
        distribution_id: Uuid,
    ) -> Result<Option<SenderKeyRecord>, KeyRecordStoreError> {
        let corrupt = |reason: String| KeyRecordStoreError::CorruptKeyRecord {
            key: String::from_utf8_lossy(&Self::key(address, device_id, distribution_id)).into_owned(),
            reason,
        };

        let entity = match self.get(address, device_id, distribution_id) {
            Ok(Some(entity)) => entity,
            Ok(None) => return Ok(None),
            Err(KeyRecordStoreError::DatabaseError(DatabaseError::DeserializationError(e))) => {
                return Err(corrupt(e));
            }
            Err(e) => return Err(e),
        };

        SenderKeyRecord::deserialize(&entity.record)
            .map(Some)
            .map_err(|e| corrupt(e.to_string()))
    }

    /// 列出一个分发ID下的全部记录
    pub fn list(&self, distribution_id: Uuid) -> Result<Vec<SenderKeyEntity>, KeyRecordStoreError> {
        self.db
            .scan_prefix(SENDER_KEYS_TREE, &Self::prefix(distribution_id))?
            .into_iter()
            .filter_map(|(key, value)| match bincode::deserialize::<SenderKeyEntity>(&value) {
                Ok(entity) => Some(Ok(entity)),
                Err(e) => {
                    warn!("Skipping unreadable entry {}: {}", String::from_utf8_lossy(&key), e);
                    None
                }
            })
            .collect()
    }

    /// 删除一个分发ID下的全部记录（离开空间）
    pub fn delete_distribution(&self, distribution_id: Uuid) -> Result<usize, KeyRecordStoreError> {
        let entries = self.db.scan_prefix(SENDER_KEYS_TREE, &Self::prefix(distribution_id))?;
        for (key, _) in &entries {
            self.db.delete(SENDER_KEYS_TREE, key)?;
        }

        debug!("Purged {} sender key records for {}", entries.len(), distribution_id);
        Ok(entries.len())
    }

    pub fn flush(&self) -> Result<(), KeyRecordStoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// 直接写入原始字节（测试损坏记录用）
    #[cfg(test)]
    pub(crate) fn put_raw(&self, address: &str, device_id: u32, distribution_id: Uuid, bytes: &[u8]) {
        let key = Self::key(address, device_id, distribution_id);
        self.db.put(SENDER_KEYS_TREE, &key, bytes).unwrap();
    }
}
