use crate::crypto::kdf::hkdf;
use crate::crypto::{KeyPair, PublicKey};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::Rng;
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

const ENVELOPE_SALT: &[u8] = b"SpaceKeysDistributionEnvelope";
const ENVELOPE_INFO: &[u8] = b"SpaceKeys-v1";

pub const IV_LENGTH: usize = 12;

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
}

/// 封装后的密文（发给单个接收者）
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedBox {
    pub ephemeral_public: [u8; 32],
    pub iv: [u8; IV_LENGTH],
    pub ciphertext: Vec<u8>,
}

/// 使用临时 X25519 密钥将数据封装给接收者
///
/// `associated_data` 绑定到认证标签上，通常是接收者ID。
pub fn seal(
    recipient: &PublicKey,
    plaintext: &[u8],
    associated_data: &[u8],
) -> Result<SealedBox, EnvelopeError> {
    let mut ephemeral_seed = [0u8; 32];
    rand::thread_rng().fill(&mut ephemeral_seed);
    let ephemeral_secret = StaticSecret::from(ephemeral_seed);
    let ephemeral_public = X25519PublicKey::from(&ephemeral_secret).to_bytes();

    let shared_secret = ephemeral_secret.diffie_hellman(recipient.encryption_key());
    let cipher = envelope_cipher(shared_secret.as_bytes(), &ephemeral_public)?;

    let mut iv = [0u8; IV_LENGTH];
    rand::thread_rng().fill(&mut iv);

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|e| EnvelopeError::EncryptionFailed(e.to_string()))?;

    Ok(SealedBox {
        ephemeral_public,
        iv,
        ciphertext,
    })
}

/// 接收者使用身份私钥打开封装
pub fn open(
    recipient: &KeyPair,
    sealed: &SealedBox,
    associated_data: &[u8],
) -> Result<Vec<u8>, EnvelopeError> {
    let ephemeral_public = X25519PublicKey::from(sealed.ephemeral_public);
    let shared_secret = recipient
        .secret
        .encryption_key()
        .diffie_hellman(&ephemeral_public);
    let cipher = envelope_cipher(shared_secret.as_bytes(), &sealed.ephemeral_public)?;

    cipher
        .decrypt(
            Nonce::from_slice(&sealed.iv),
            Payload {
                msg: &sealed.ciphertext,
                aad: associated_data,
            },
        )
        .map_err(|e| EnvelopeError::DecryptionFailed(e.to_string()))
}

fn envelope_cipher(shared_secret: &[u8; 32], ephemeral_public: &[u8; 32]) -> Result<Aes256Gcm, EnvelopeError> {
    // 临时公钥参与派生，防止不同封装之间的密钥复用
    let mut input = Vec::with_capacity(64);
    input.extend_from_slice(shared_secret);
    input.extend_from_slice(ephemeral_public);

    let key = hkdf(&input, ENVELOPE_SALT, ENVELOPE_INFO, 32);

    Aes256Gcm::new_from_slice(&key).map_err(|e| EnvelopeError::InvalidParameters(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let bob = KeyPair::generate().unwrap();
        let plaintext = b"sender key distribution";

        let sealed = seal(&bob.public, plaintext, b"bob").unwrap();
        let opened = open(&bob, &sealed, b"bob").unwrap();

        assert_eq!(plaintext, opened.as_slice());
    }

    #[test]
    fn test_wrong_recipient_fails() {
        let bob = KeyPair::generate().unwrap();
        let eve = KeyPair::generate().unwrap();

        let sealed = seal(&bob.public, b"secret", b"bob").unwrap();

        assert!(matches!(
            open(&eve, &sealed, b"bob"),
            Err(EnvelopeError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_wrong_associated_data_fails() {
        let bob = KeyPair::generate().unwrap();
        let sealed = seal(&bob.public, b"secret", b"bob").unwrap();

        assert!(open(&bob, &sealed, b"eve").is_err());
    }
}
