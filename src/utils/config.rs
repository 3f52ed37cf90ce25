use crate::rotation::RotationConfig;
use serde::{Deserialize, Serialize};
use std::fs::{create_dir_all, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// 密钥轮换设置（秒）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationSettings {
    /// 轮换周期
    pub interval_secs: u64,

    /// 首次运行前的延迟
    pub initial_delay_secs: u64,

    /// 失败后重试的初始退避
    pub retry_backoff_secs: u64,

    /// 退避上限
    pub max_retry_backoff_secs: u64,
}

impl Default for RotationSettings {
    fn default() -> Self {
        let defaults = RotationConfig::default();
        Self {
            interval_secs: defaults.interval.as_secs(),
            initial_delay_secs: defaults.initial_delay.as_secs(),
            retry_backoff_secs: defaults.retry_backoff.as_secs(),
            max_retry_backoff_secs: defaults.max_retry_backoff.as_secs(),
        }
    }
}

/// 应用程序配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 数据目录（密钥记录数据库）
    pub data_dir: PathBuf,

    /// 成员密钥文件（MemberKeys JSON）
    pub member_file: PathBuf,

    /// 日志级别
    pub log_level: String,

    pub rotation: RotationSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            member_file: PathBuf::from("member.json"),
            log_level: "info".to_string(),
            rotation: RotationSettings::default(),
        }
    }
}

impl Config {
    /// 从文件加载配置，文件不存在时使用默认值
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let mut content = String::new();
        File::open(path)?.read_to_string(&mut content)?;

        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;

        Ok(config)
    }

    /// 保存配置到文件
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        File::create(path)?.write_all(content.as_bytes())?;

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rotation.interval_secs == 0 {
            return Err(ConfigError::InvalidValue("rotation.interval_secs must be positive".to_string()));
        }
        if self.rotation.retry_backoff_secs > self.rotation.max_retry_backoff_secs {
            return Err(ConfigError::InvalidValue(
                "rotation.retry_backoff_secs exceeds rotation.max_retry_backoff_secs".to_string(),
            ));
        }
        Ok(())
    }

    /// 确保数据目录存在
    pub fn ensure_data_dir(&self) -> Result<(), ConfigError> {
        create_dir_all(&self.data_dir)?;
        Ok(())
    }

    /// 密钥记录数据库路径
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("key_records")
    }

    /// 成员文件路径，相对路径基于数据目录
    pub fn member_file_path(&self) -> PathBuf {
        if self.member_file.is_absolute() {
            self.member_file.clone()
        } else {
            self.data_dir.join(&self.member_file)
        }
    }

    pub fn rotation_config(&self) -> RotationConfig {
        RotationConfig {
            interval: Duration::from_secs(self.rotation.interval_secs),
            initial_delay: Duration::from_secs(self.rotation.initial_delay_secs),
            retry_backoff: Duration::from_secs(self.rotation.retry_backoff_secs),
            max_retry_backoff: Duration::from_secs(self.rotation.max_retry_backoff_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.json")).unwrap();

        assert_eq!(config.log_level, "info");
        assert_eq!(config.rotation_config(), RotationConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.rotation.interval_secs = 3600;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.rotation.interval_secs, 3600);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "log_level": "debug" }"#).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.log_level, "debug");
        assert_eq!(loaded.rotation, RotationSettings::default());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "rotation": { "interval_secs": 0 } }"#).unwrap();

        assert!(matches!(Config::load(&path), Err(ConfigError::InvalidValue(_))));
    }
}
