use serde::{Deserialize, Serialize};
use std::fmt;

/// 每个成员在一个进程中只有一个设备
pub const DEFAULT_DEVICE_ID: u32 = 1;

/// 协议地址（用户ID + 设备ID）
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolAddress {
    pub name: String,
    pub device_id: u32,
}

impl ProtocolAddress {
    pub fn new(name: impl Into<String>, device_id: u32) -> Self {
        Self {
            name: name.into(),
            device_id,
        }
    }

    /// 使用默认设备ID创建地址
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self::new(user_id, DEFAULT_DEVICE_ID)
    }
}

impl fmt::Display for ProtocolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.device_id)
    }
}
