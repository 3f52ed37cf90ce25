mod logger;
mod config;

pub use logger::{parse_log_level, setup_logger};
pub use config::{Config, ConfigError, RotationSettings};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// 获取应用程序版本
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// 获取应用程序名称
pub fn name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

/// 当前 Unix 毫秒时间戳
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 格式化毫秒时间戳为人类可读时间
pub fn format_timestamp(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| format!("{}ms", millis))
}

/// 标准 base64 编码
pub fn encode_b64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// 标准 base64 解码
pub fn decode_b64(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_round_trip() {
        let bytes = [0u8, 1, 2, 250, 255];
        assert_eq!(decode_b64(&encode_b64(&bytes)).unwrap(), bytes);
        assert!(decode_b64("%%%").is_err());
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00");
    }
}
