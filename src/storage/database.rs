use sled::{Db, Tree};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database error: {0}")]
    DbError(#[from] sled::Error),

    #[error("Tree cache lock poisoned")]
    LockPoisoned,

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// 简单的键值数据库
#[derive(Clone)]
pub struct Database {
    /// sled数据库实例
    db: Arc<Db>,

    /// 打开的树
    trees: Arc<Mutex<HashMap<String, Tree>>>,
}

impl Database {
    /// 打开（或创建）磁盘上的数据库
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let db = sled::open(path)?;
        Ok(Self::from_db(db))
    }

    /// 临时数据库，关闭后删除（测试与演示使用）
    pub fn open_temporary() -> Result<Self, DatabaseError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self::from_db(db))
    }

    fn from_db(db: Db) -> Self {
        Self {
            db: Arc::new(db),
            trees: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 获取树
    pub fn tree(&self, name: &str) -> Result<Tree, DatabaseError> {
        let mut trees = self.trees.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        if let Some(tree) = trees.get(name) {
            return Ok(tree.clone());
        }

        let tree = self.db.open_tree(name)?;
        trees.insert(name.to_string(), tree.clone());
        Ok(tree)
    }

    /// 获取值
    pub fn get(&self, tree: &str, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        Ok(self.tree(tree)?.get(key)?.map(|value| value.to_vec()))
    }

    /// 设置值
    pub fn put(&self, tree: &str, key: &[u8], value: &[u8]) -> Result<(), DatabaseError> {
        self.tree(tree)?.insert(key, value)?;
        Ok(())
    }

    /// 删除值
    pub fn delete(&self, tree: &str, key: &[u8]) -> Result<(), DatabaseError> {
        self.tree(tree)?.remove(key)?;
        Ok(())
    }

    /// 按前缀扫描
    pub fn scan_prefix(&self, tree: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DatabaseError> {
        self.tree(tree)?
            .scan_prefix(prefix)
            .map(|entry| {
                let (key, value) = entry?;
                Ok((key.to_vec(), value.to_vec()))
            })
            .collect()
    }

    /// 刷新到磁盘
    pub fn flush(&self) -> Result<(), DatabaseError> {
        self.db.flush()?;
        Ok(())
    }

    /// 获取序列化的值
    pub fn get_serialized<T: serde::de::DeserializeOwned>(
        &self,
        tree: &str,
        key: &[u8],
    ) -> Result<Option<T>, DatabaseError> {
        match self.get(tree, key)? {
            Some(value) => bincode::deserialize(&value)
                .map(Some)
                .map_err(|e| DatabaseError::DeserializationError(e.to_string())),
            None => Ok(None),
        }
    }

    /// 设置序列化的值
    pub fn put_serialized<T: serde::Serialize>(&self, tree: &str, key: &[u8], value: &T) -> Result<(), DatabaseError> {
        let data = bincode::serialize(value).map_err(|e| DatabaseError::SerializationError(e.to_string()))?;
        self.put(tree, key, &data)
    }
}
