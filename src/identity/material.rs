use crate::crypto::KeyPair;
use crate::identity::{PreKeyRecord, SignedPreKeyRecord};
use crate::utils::{decode_b64, encode_b64, now_millis};
use log::{debug, error};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Signal 风格的注册ID只有 14 位
const MAX_REGISTRATION_ID: u32 = 16380;

#[derive(Error, Debug)]
pub enum MaterialError {
    #[error("Material unavailable: {field}: {reason}")]
    MaterialUnavailable { field: String, reason: String },

    #[error("Key generation failed: {0}")]
    GenerationFailed(String),
}

impl MaterialError {
    fn unavailable(field: &str, reason: impl fmt::Display) -> Self {
        MaterialError::MaterialUnavailable {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// 账户数据源提供的成员密钥字段（base64 编码）
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct MemberKeys {
    pub id: String,
    pub identity_key_public: Option<String>,
    pub identity_key_private: Option<String>,
    pub registration_id: Option<u32>,
    pub signed_pre_key: Option<String>,
    #[serde(default)]
    pub pre_keys: Vec<String>,
}

impl fmt::Debug for MemberKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemberKeys")
            .field("id", &self.id)
            .field("identity_key_public", &self.identity_key_public)
            .field("identity_key_private", &self.identity_key_private.as_ref().map(|_| "<redacted>"))
            .field("registration_id", &self.registration_id)
            .field("pre_keys.len", &self.pre_keys.len())
            .finish()
    }
}

/// 会话构建所需的完整密钥材料
#[derive(Debug)]
pub struct IdentityMaterial {
    pub user_id: String,
    pub identity: KeyPair,
    pub registration_id: u32,
    pub signed_pre_key: SignedPreKeyRecord,
    pub pre_keys: Vec<PreKeyRecord>,
}

/// 身份与预密钥材料管理器
pub struct IdentityMaterialManager;

impl IdentityMaterialManager {
    /// 加载成员的身份材料
    ///
    /// 任何必需字段缺失或无法解码都会返回 `MaterialUnavailable`，调用方不得用部分材料继续。
    pub fn load(member: &MemberKeys) -> Result<IdentityMaterial, MaterialError> {
        let result = Self::load_inner(member);
        if let Err(e) = &result {
            error!("Failed to load identity material for {}: {}", member.id, e);
        }
        result
    }

    fn load_inner(member: &MemberKeys) -> Result<IdentityMaterial, MaterialError> {
        if member.id.is_empty() {
            return Err(MaterialError::unavailable("id", "empty member id"));
        }

        let public = required_bytes("identity_key_public", &member.identity_key_public)?;
        let private = required_bytes("identity_key_private", &member.identity_key_private)?;
        let identity = KeyPair::from_parts(&public, &private)
            .map_err(|e| MaterialError::unavailable("identity_key", e))?;

        let registration_id = member
            .registration_id
            .ok_or_else(|| MaterialError::unavailable("registration_id", "missing"))?;

        let signed_bytes = required_bytes("signed_pre_key", &member.signed_pre_key)?;
        let signed_pre_key = SignedPreKeyRecord::deserialize(&signed_bytes)
            .map_err(|e| MaterialError::unavailable("signed_pre_key", e))?;
        signed_pre_key
            .verify(&identity)
            .map_err(|e| MaterialError::unavailable("signed_pre_key", e))?;

        let pre_keys = member
            .pre_keys
            .iter()
            .enumerate()
            .map(|(index, encoded)| {
                let field = format!("pre_keys[{}]", index);
                let bytes = decode_b64(encoded).map_err(|e| MaterialError::unavailable(&field, e))?;
                PreKeyRecord::deserialize(&bytes).map_err(|e| MaterialError::unavailable(&field, e))
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            "Loaded identity material for {} ({} pre-keys)",
            member.id,
            pre_keys.len()
        );

        Ok(IdentityMaterial {
            user_id: member.id.clone(),
            identity,
            registration_id,
            signed_pre_key,
            pre_keys,
        })
    }

    /// 为成员生成全新的身份材料（重新注册时使用）
    pub fn provision(user_id: &str, pre_key_count: u32) -> Result<MemberKeys, MaterialError> {
        let generation = |e: &dyn fmt::Display| MaterialError::GenerationFailed(e.to_string());

        let identity = KeyPair::generate().map_err(|e| generation(&e))?;
        let mut rng = rand::thread_rng();

        let registration_id = rng.gen_range(1..=MAX_REGISTRATION_ID);
        let signed_pre_key = SignedPreKeyRecord::generate(rng.gen_range(1..=0x00ff_ffff), &identity, now_millis())
            .map_err(|e| generation(&e))?;

        let first_pre_key_id: u32 = rng.gen_range(1..=0x00ff_0000);
        let pre_keys = (0..pre_key_count)
            .map(|offset| {
                PreKeyRecord::generate(first_pre_key_id + offset)
                    .and_then(|k| k.serialize())
                    .map(|bytes| encode_b64(&bytes))
                    .map_err(|e| generation(&e))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(MemberKeys {
            id: user_id.to_string(),
            identity_key_public: Some(encode_b64(&identity.public.to_bytes())),
            identity_key_private: Some(encode_b64(&identity.secret.to_bytes())),
            registration_id: Some(registration_id),
            signed_pre_key: Some(encode_b64(&signed_pre_key.serialize().map_err(|e| generation(&e))?)),
            pre_keys,
        })
    }
}

fn required_bytes(field: &str, value: &Option<String>) -> Result<Vec<u8>, MaterialError> {
    let encoded = value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| MaterialError::unavailable(field, "missing"))?;

    decode_b64(encoded).map_err(|e| MaterialError::unavailable(field, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provisioned() -> MemberKeys {
        IdentityMaterialManager::provision("alice", 3).expect("Failed to provision member")
    }

    #[test]
    fn test_load_provisioned_material() {
        let member = provisioned();
        let material = IdentityMaterialManager::load(&member).unwrap();

        assert_eq!(material.user_id, "alice");
        assert_eq!(material.pre_keys.len(), 3);
        assert_eq!(Some(material.registration_id), member.registration_id);
    }

    #[test]
    fn test_missing_field_is_unavailable() {
        let mut member = provisioned();
        member.identity_key_private = None;

        match IdentityMaterialManager::load(&member) {
            Err(MaterialError::MaterialUnavailable { field, .. }) => assert_eq!(field, "identity_key_private"),
            other => panic!("Expected MaterialUnavailable, got {:?}", other.map(|m| m.user_id)),
        }
    }

    #[test]
    fn test_bad_base64_is_unavailable() {
        let mut member = provisioned();
        member.pre_keys[1] = "not base64!!".to_string();

        match IdentityMaterialManager::load(&member) {
            Err(MaterialError::MaterialUnavailable { field, .. }) => assert_eq!(field, "pre_keys[1]"),
            other => panic!("Expected MaterialUnavailable, got {:?}", other.map(|m| m.user_id)),
        }
    }

    #[test]
    fn test_foreign_signed_pre_key_rejected() {
        let mut member = provisioned();
        let other = IdentityMaterialManager::provision("mallory", 0).unwrap();
        member.signed_pre_key = other.signed_pre_key;

        assert!(matches!(
            IdentityMaterialManager::load(&member),
            Err(MaterialError::MaterialUnavailable { .. })
        ));
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let member = provisioned();
        let private = member.identity_key_private.clone().unwrap();

        assert!(!format!("{:?}", member).contains(&private));
    }
}
