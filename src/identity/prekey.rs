use crate::crypto::signing::{self, SignatureError};
use crate::crypto::{KeyError, KeyPair};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PreKeyError {
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Signature error: {0}")]
    Signature(#[from] SignatureError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[derive(Serialize, Deserialize)]
struct EncodedKeyRecord {
    id: u32,
    timestamp: i64,
    public: Vec<u8>,
    secret: Vec<u8>,
    signature: Vec<u8>,
}

/// 一次性预密钥
#[derive(Debug)]
pub struct PreKeyRecord {
    pub id: u32,
    pub key_pair: KeyPair,
}

impl PreKeyRecord {
    pub fn generate(id: u32) -> Result<Self, PreKeyError> {
        Ok(Self {
            id,
            key_pair: KeyPair::generate()?,
        })
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PreKeyError> {
        let encoded = EncodedKeyRecord {
            id: self.id,
            timestamp: 0,
            public: self.key_pair.public.to_bytes(),
            secret: self.key_pair.secret.to_bytes(),
            signature: Vec::new(),
        };

        bincode::serialize(&encoded).map_err(|e| PreKeyError::Serialization(e.to_string()))
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, PreKeyError> {
        let encoded: EncodedKeyRecord =
            bincode::deserialize(bytes).map_err(|e| PreKeyError::Serialization(e.to_string()))?;

        Ok(Self {
            id: encoded.id,
            key_pair: KeyPair::from_parts(&encoded.public, &encoded.secret)?,
        })
    }
}

/// 由身份密钥签名的中期预密钥
#[derive(Debug)]
pub struct SignedPreKeyRecord {
    pub id: u32,
    /// 生成时间（Unix 毫秒）
    pub timestamp: i64,
    pub key_pair: KeyPair,
    pub signature: Vec<u8>,
}

impl SignedPreKeyRecord {
    /// 生成并用身份密钥签名
    pub fn generate(id: u32, identity: &KeyPair, timestamp: i64) -> Result<Self, PreKeyError> {
        let key_pair = KeyPair::generate()?;
        let signature = signing::sign_with(identity.secret.signing_key(), &key_pair.public.to_bytes());

        Ok(Self {
            id,
            timestamp,
            key_pair,
            signature: signature.to_vec(),
        })
    }

    /// 校验签名是否来自给定身份
    pub fn verify(&self, identity: &KeyPair) -> Result<(), PreKeyError> {
        signing::verify_with(
            identity.public.signing_key(),
            &self.key_pair.public.to_bytes(),
            &self.signature,
        )?;
        Ok(())
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PreKeyError> {
        let encoded = EncodedKeyRecord {
            id: self.id,
            timestamp: self.timestamp,
            public: self.key_pair.public.to_bytes(),
            secret: self.key_pair.secret.to_bytes(),
            signature: self.signature.clone(),
        };

        bincode::serialize(&encoded).map_err(|e| PreKeyError::Serialization(e.to_string()))
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, PreKeyError> {
        let encoded: EncodedKeyRecord =
            bincode::deserialize(bytes).map_err(|e| PreKeyError::Serialization(e.to_string()))?;

        Ok(Self {
            id: encoded.id,
            timestamp: encoded.timestamp,
            key_pair: KeyPair::from_parts(&encoded.public, &encoded.secret)?,
            signature: encoded.signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_pre_key_verifies_against_identity() {
        let identity = KeyPair::generate().unwrap();
        let other = KeyPair::generate().unwrap();

        let signed = SignedPreKeyRecord::generate(7, &identity, 1_700_000_000_000).unwrap();
        let restored = SignedPreKeyRecord::deserialize(&signed.serialize().unwrap()).unwrap();

        assert_eq!(restored.id, 7);
        assert!(restored.verify(&identity).is_ok());
        assert!(restored.verify(&other).is_err());
    }

    #[test]
    fn test_pre_key_serialization() {
        let record = PreKeyRecord::generate(42).unwrap();
        let restored = PreKeyRecord::deserialize(&record.serialize().unwrap()).unwrap();

        assert_eq!(restored.id, 42);
        assert_eq!(restored.key_pair.public, record.key_pair.public);
    }
}
