use ed25519_dalek::{PublicKey as EdPublicKey, SecretKey as EdSecretKey};
use rand::Rng;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Length of an encoded public or secret key (Ed25519 half + X25519 half).
pub const KEY_LENGTH: usize = 64;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Key generation failed: {0}")]
    GenerationFailed(String),

    #[error("Key deserialization failed: {0}")]
    DeserializationFailed(String),
}

/// Represents a member's public identity key.
///
/// The Ed25519 half verifies signatures (signed pre-keys), the X25519 half is
/// the target of key agreement when distributions are sealed to the member.
#[derive(Clone)]
pub struct PublicKey {
    signing_key: EdPublicKey,
    encryption_key: X25519PublicKey,
}

impl PublicKey {
    /// Returns the signing key
    pub fn signing_key(&self) -> &EdPublicKey {
        &self.signing_key
    }

    /// Returns the encryption key
    pub fn encryption_key(&self) -> &X25519PublicKey {
        &self.encryption_key
    }

    /// Encodes the key as `signing || encryption`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(KEY_LENGTH);
        buffer.extend_from_slice(self.signing_key.as_bytes());
        buffer.extend_from_slice(self.encryption_key.as_bytes());
        buffer
    }

    /// Decodes a key produced by [`PublicKey::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let (signing, encryption) = split_halves(bytes)?;

        // Ed25519 公钥必须是曲线上的有效点
        let signing_key = EdPublicKey::from_bytes(&signing)
            .map_err(|e| KeyError::DeserializationFailed(e.to_string()))?;

        Ok(Self {
            signing_key,
            encryption_key: X25519PublicKey::from(encryption),
        })
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", hex::encode(&self.signing_key.as_bytes()[0..4]))
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.signing_key.as_bytes() == other.signing_key.as_bytes()
            && self.encryption_key.as_bytes() == other.encryption_key.as_bytes()
    }
}

impl Eq for PublicKey {}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_bytes().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        PublicKey::from_bytes(&bytes).map_err(de::Error::custom)
    }
}

/// Represents a member's secret identity key.
pub struct SecretKey {
    signing_key: EdSecretKey,
    encryption_key: StaticSecret,
}

impl SecretKey {
    /// Returns the signing key
    pub fn signing_key(&self) -> &EdSecretKey {
        &self.signing_key
    }

    /// Returns the encryption key
    pub fn encryption_key(&self) -> &StaticSecret {
        &self.encryption_key
    }

    /// Encodes the key as `signing || encryption`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(KEY_LENGTH);
        buffer.extend_from_slice(self.signing_key.as_bytes());
        buffer.extend_from_slice(&self.encryption_key.to_bytes());
        buffer
    }

    /// Decodes a key produced by [`SecretKey::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let (signing, encryption) = split_halves(bytes)?;

        let signing_key = EdSecretKey::from_bytes(&signing)
            .map_err(|e| KeyError::DeserializationFailed(e.to_string()))?;

        Ok(Self {
            signing_key,
            encryption_key: StaticSecret::from(encryption),
        })
    }

    /// Clones the key through its byte encoding, `EdSecretKey` is not `Clone`
    pub fn try_clone(&self) -> Result<Self, KeyError> {
        Self::from_bytes(&self.to_bytes())
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey {{ <redacted> }}")
    }
}

/// Represents a key pair (public and secret keys).
#[derive(Debug)]
pub struct KeyPair {
    pub public: PublicKey,
    pub secret: SecretKey,
}

impl KeyPair {
    /// Generates a new random key pair
    pub fn generate() -> Result<Self, KeyError> {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill(&mut seed);

        let signing_key = EdSecretKey::from_bytes(&seed)
            .map_err(|e| KeyError::GenerationFailed(e.to_string()))?;

        // 加密密钥使用独立的随机种子
        let mut encryption_seed = [0u8; 32];
        rand::thread_rng().fill(&mut encryption_seed);

        Ok(Self::from_secret(SecretKey {
            signing_key,
            encryption_key: StaticSecret::from(encryption_seed),
        }))
    }

    /// Creates a key pair from an existing secret key
    pub fn from_secret(secret: SecretKey) -> Self {
        let signing_key = EdPublicKey::from(&secret.signing_key);
        let encryption_key = X25519PublicKey::from(&secret.encryption_key);

        Self {
            public: PublicKey {
                signing_key,
                encryption_key,
            },
            secret,
        }
    }

    /// Rebuilds a key pair from both encoded halves, rejecting mismatched halves
    pub fn from_parts(public: &[u8], secret: &[u8]) -> Result<Self, KeyError> {
        let pair = Self::from_secret(SecretKey::from_bytes(secret)?);
        let expected = PublicKey::from_bytes(public)?;

        if pair.public != expected {
            return Err(KeyError::DeserializationFailed(
                "Public key does not match secret key".to_string(),
            ));
        }

        Ok(pair)
    }

    /// X25519 key agreement with a remote public key
    pub fn agree(&self, remote: &PublicKey) -> [u8; 32] {
        *self
            .secret
            .encryption_key
            .diffie_hellman(remote.encryption_key())
            .as_bytes()
    }

    pub fn try_clone(&self) -> Result<Self, KeyError> {
        Ok(Self::from_secret(self.secret.try_clone()?))
    }
}

fn split_halves(bytes: &[u8]) -> Result<([u8; 32], [u8; 32]), KeyError> {
    if bytes.len() != KEY_LENGTH {
        return Err(KeyError::DeserializationFailed(format!(
            "Expected {} bytes, got {}",
            KEY_LENGTH,
            bytes.len()
        )));
    }

    let mut first = [0u8; 32];
    let mut second = [0u8; 32];
    first.copy_from_slice(&bytes[0..32]);
    second.copy_from_slice(&bytes[32..KEY_LENGTH]);

    Ok((first, second))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_round_trip_through_parts() {
        let keypair = KeyPair::generate().expect("Failed to generate keypair");

        let restored = KeyPair::from_parts(&keypair.public.to_bytes(), &keypair.secret.to_bytes())
            .expect("Failed to restore keypair");

        assert_eq!(restored.public, keypair.public);
    }

    #[test]
    fn test_mismatched_halves_rejected() {
        let alice = KeyPair::generate().unwrap();
        let bob = KeyPair::generate().unwrap();

        let result = KeyPair::from_parts(&alice.public.to_bytes(), &bob.secret.to_bytes());
        assert!(matches!(result, Err(KeyError::DeserializationFailed(_))));
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert!(PublicKey::from_bytes(&[7u8; 10]).is_err());
        assert!(SecretKey::from_bytes(&[7u8; 65]).is_err());
    }

    #[test]
    fn test_agreement_is_symmetric() {
        let alice = KeyPair::generate().unwrap();
        let bob = KeyPair::generate().unwrap();

        assert_eq!(alice.agree(&bob.public), bob.agree(&alice.public));
    }

    #[test]
    fn test_public_key_serde() {
        let keypair = KeyPair::generate().unwrap();

        let bytes = bincode::serialize(&keypair.public).unwrap();
        let decoded: PublicKey = bincode::deserialize(&bytes).unwrap();

        assert_eq!(decoded, keypair.public);
    }
}
