use crate::crypto::envelope::{self, SealedBox, IV_LENGTH};
use crate::crypto::{EnvelopeError, KeyPair, PublicKey};
use crate::utils::{decode_b64, encode_b64};
use serde::{Deserialize, Serialize};

/// 封装给单个接收者的分发消息（字段为 base64）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedDistribution {
    pub recipient_id: String,
    pub ephemeral_pub: String,
    pub iv: String,
    pub ciphertext: String,
}

impl EncryptedDistribution {
    /// 用接收者的身份公钥封装分发字节，接收者ID 作为关联数据
    pub fn seal_for(recipient_id: &str, recipient: &PublicKey, distribution: &[u8]) -> Result<Self, EnvelopeError> {
        let sealed = envelope::seal(recipient, distribution, recipient_id.as_bytes())?;

        Ok(Self {
            recipient_id: recipient_id.to_string(),
            ephemeral_pub: encode_b64(&sealed.ephemeral_public),
            iv: encode_b64(&sealed.iv),
            ciphertext: encode_b64(&sealed.ciphertext),
        })
    }

    /// 接收者打开封装
    pub fn open(&self, recipient: &KeyPair) -> Result<Vec<u8>, EnvelopeError> {
        let sealed = SealedBox {
            ephemeral_public: decode_fixed::<32>("ephemeral_pub", &self.ephemeral_pub)?,
            iv: decode_fixed::<IV_LENGTH>("iv", &self.iv)?,
            ciphertext: decode_b64(&self.ciphertext)
                .map_err(|e| EnvelopeError::InvalidParameters(format!("ciphertext: {}", e)))?,
        };

        envelope::open(recipient, &sealed, self.recipient_id.as_bytes())
    }
}

fn decode_fixed<const N: usize>(field: &str, encoded: &str) -> Result<[u8; N], EnvelopeError> {
    let bytes = decode_b64(encoded).map_err(|e| EnvelopeError::InvalidParameters(format!("{}: {}", field, e)))?;

    bytes
        .try_into()
        .map_err(|b: Vec<u8>| EnvelopeError::InvalidParameters(format!("{}: expected {} bytes, got {}", field, N, b.len())))
}

/// 一个成员的（已打开的）分发消息
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpaceKeyDistribution {
    pub user_id: String,
    pub key_distribution_message: Vec<u8>,
}

impl SpaceKeyDistribution {
    pub fn new(user_id: impl Into<String>, key_distribution_message: Vec<u8>) -> Self {
        Self {
            user_id: user_id.into(),
            key_distribution_message,
        }
    }
}

/// 一个成员在空间中发布的轮换结果：每个接收者一份封装
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberKeyData {
    pub member_id: String,
    /// Unix 毫秒
    pub data_updated_at: i64,
    pub distributions: Vec<EncryptedDistribution>,
}

impl MemberKeyData {
    /// 查找发给指定接收者的封装
    pub fn distribution_for(&self, recipient_id: &str) -> Option<&EncryptedDistribution> {
        self.distributions.iter().find(|d| d.recipient_id == recipient_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_for_and_open() {
        let bob = KeyPair::generate().unwrap();
        let sealed = EncryptedDistribution::seal_for("bob", &bob.public, b"distribution").unwrap();

        assert_eq!(sealed.recipient_id, "bob");
        assert_eq!(sealed.open(&bob).unwrap(), b"distribution".to_vec());
    }

    #[test]
    fn test_relabelled_recipient_fails() {
        let bob = KeyPair::generate().unwrap();
        let mut sealed = EncryptedDistribution::seal_for("bob", &bob.public, b"distribution").unwrap();
        sealed.recipient_id = "carol".to_string();

        assert!(matches!(sealed.open(&bob), Err(EnvelopeError::DecryptionFailed(_))));
    }

    #[test]
    fn test_truncated_iv_rejected() {
        let bob = KeyPair::generate().unwrap();
        let mut sealed = EncryptedDistribution::seal_for("bob", &bob.public, b"distribution").unwrap();
        sealed.iv = encode_b64(&[0u8; 4]);

        assert!(matches!(sealed.open(&bob), Err(EnvelopeError::InvalidParameters(_))));
    }

    #[test]
    fn test_distribution_for() {
        let bob = KeyPair::generate().unwrap();
        let data = MemberKeyData {
            member_id: "alice".to_string(),
            data_updated_at: 0,
            distributions: vec![EncryptedDistribution::seal_for("bob", &bob.public, b"d").unwrap()],
        };

        assert!(data.distribution_for("bob").is_some());
        assert!(data.distribution_for("carol").is_none());
    }
}
