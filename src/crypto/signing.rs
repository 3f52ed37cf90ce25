use ed25519_dalek::{ExpandedSecretKey, PublicKey as EdPublicKey, SecretKey as EdSecretKey, Signature, Verifier};
use rand::Rng;
use thiserror::Error;

pub const SIGNATURE_LENGTH: usize = 64;

#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

/// 独立的 Ed25519 签名密钥对（用于发送者链）
pub struct SigningKeyPair {
    pub public: [u8; 32],
    pub secret: [u8; 32],
}

impl SigningKeyPair {
    /// 生成随机签名密钥对
    pub fn generate() -> Result<Self, SignatureError> {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill(&mut secret);

        let signing_key = EdSecretKey::from_bytes(&secret)
            .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
        let public = EdPublicKey::from(&signing_key).to_bytes();

        Ok(Self { public, secret })
    }
}

/// 使用原始私钥字节签名
pub fn sign(secret: &[u8], message: &[u8]) -> Result<[u8; SIGNATURE_LENGTH], SignatureError> {
    let signing_key = EdSecretKey::from_bytes(secret)
        .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;

    Ok(sign_with(&signing_key, message))
}

/// 使用 Ed25519 私钥签名
pub fn sign_with(signing_key: &EdSecretKey, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
    let expanded_key = ExpandedSecretKey::from(signing_key);
    let public_key = EdPublicKey::from(signing_key);

    expanded_key.sign(message, &public_key).to_bytes()
}

/// 使用原始公钥字节验证签名
pub fn verify(public: &[u8], message: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
    let verifying_key = EdPublicKey::from_bytes(public)
        .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;

    verify_with(&verifying_key, message, signature)
}

/// 使用 Ed25519 公钥验证签名
pub fn verify_with(verifying_key: &EdPublicKey, message: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
    if signature.len() != SIGNATURE_LENGTH {
        return Err(SignatureError::VerificationFailed("Invalid signature length".to_string()));
    }

    let sig = Signature::try_from(signature)
        .map_err(|e| SignatureError::VerificationFailed(e.to_string()))?;

    verifying_key
        .verify(message, &sig)
        .map_err(|e| SignatureError::VerificationFailed(e.to_string()))
}
