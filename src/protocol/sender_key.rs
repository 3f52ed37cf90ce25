use crate::crypto::kdf::{hkdf, hmac_sha256};
use crate::crypto::signing::{self, SigningKeyPair, SIGNATURE_LENGTH};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// 发送者密钥消息与分发消息的版本
pub const SENDER_KEY_VERSION: u8 = 3;

/// 每条链最多缓存的跳过消息密钥
pub const MAX_MESSAGE_KEYS: usize = 2000;

/// 单次解密允许的最大前跳步数
pub const MAX_FORWARD_JUMPS: u32 = 25_000;

const MESSAGE_KEY_SEED: u8 = 0x01;
const CHAIN_KEY_SEED: u8 = 0x02;
const MESSAGE_KEY_INFO: &[u8] = b"SpaceKeysGroup";

#[derive(Error, Debug)]
pub enum SenderKeyError {
    #[error("Invalid sender key record: {0}")]
    InvalidRecord(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u8),

    #[error("No sender key state: {0}")]
    NoSenderKeyState(String),

    #[error("Duplicate or expired message: chain {chain_id} iteration {iteration}")]
    DuplicateMessage { chain_id: u32, iteration: u32 },

    #[error("Message is {0} iterations ahead of the chain")]
    TooFarAhead(u32),

    #[error("Signature verification failed: {0}")]
    InvalidSignature(String),

    #[error("Missing signing key for outbound chain")]
    NoSigningKey,

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),
}

/// 单条消息的密钥种子
#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct SenderMessageKey {
    pub(crate) iteration: u32,
    seed: [u8; 32],
}

impl SenderMessageKey {
    /// 派生 ChaCha20-Poly1305 的密钥与 nonce
    pub(crate) fn cipher_parts(&self) -> ([u8; 32], [u8; 12]) {
        let derived = hkdf(&self.seed, &[], MESSAGE_KEY_INFO, 44);

        let mut key = [0u8; 32];
        let mut nonce = [0u8; 12];
        key.copy_from_slice(&derived[0..32]);
        nonce.copy_from_slice(&derived[32..44]);

        (key, nonce)
    }
}

/// 对称链密钥
#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct SenderChainKey {
    pub(crate) iteration: u32,
    key: [u8; 32],
}

impl SenderChainKey {
    fn new(iteration: u32, key: [u8; 32]) -> Self {
        Self { iteration, key }
    }

    pub(crate) fn message_key(&self) -> SenderMessageKey {
        SenderMessageKey {
            iteration: self.iteration,
            seed: hmac_sha256(&self.key, &[MESSAGE_KEY_SEED]),
        }
    }

    pub(crate) fn next(&self) -> SenderChainKey {
        SenderChainKey {
            iteration: self.iteration.wrapping_add(1),
            key: hmac_sha256(&self.key, &[CHAIN_KEY_SEED]),
        }
    }
}

/// 一个发送者链的棘轮状态
#[derive(Clone, Serialize, Deserialize)]
pub struct SenderKeyState {
    chain_id: u32,
    pub(crate) chain_key: SenderChainKey,
    signing_public: [u8; 32],
    /// 只有自己的出站链持有签名私钥
    signing_private: Option<[u8; 32]>,
    message_keys: VecDeque<SenderMessageKey>,
}

impl SenderKeyState {
    /// 新建出站链：随机链ID、随机链密钥、新的签名密钥对
    pub(crate) fn new_outbound() -> Result<Self, SenderKeyError> {
        let signing = SigningKeyPair::generate()
            .map_err(|e| SenderKeyError::InvalidRecord(e.to_string()))?;

        let mut chain_key = [0u8; 32];
        rand::thread_rng().fill(&mut chain_key);

        // 链ID 保持在 31 位以内
        let chain_id = rand::random::<u32>() >> 1;

        Ok(Self {
            chain_id,
            chain_key: SenderChainKey::new(0, chain_key),
            signing_public: signing.public,
            signing_private: Some(signing.secret),
            message_keys: VecDeque::new(),
        })
    }

    pub(crate) fn from_distribution(message: &SenderKeyDistributionMessage) -> Self {
        Self {
            chain_id: message.chain_id,
            chain_key: SenderChainKey::new(message.iteration, message.chain_key),
            signing_public: message.signing_key,
            signing_private: None,
            message_keys: VecDeque::new(),
        }
    }

    pub fn chain_id(&self) -> u32 {
        self.chain_id
    }

    pub fn iteration(&self) -> u32 {
        self.chain_key.iteration
    }

    pub fn is_outbound(&self) -> bool {
        self.signing_private.is_some()
    }

    pub(crate) fn signing_public(&self) -> &[u8; 32] {
        &self.signing_public
    }

    pub(crate) fn signing_private(&self) -> Option<&[u8; 32]> {
        self.signing_private.as_ref()
    }

    pub(crate) fn add_message_key(&mut self, key: SenderMessageKey) {
        self.message_keys.push_back(key);
        while self.message_keys.len() > MAX_MESSAGE_KEYS {
            self.message_keys.pop_front();
        }
    }

    pub(crate) fn remove_message_key(&mut self, iteration: u32) -> Option<SenderMessageKey> {
        let index = self.message_keys.iter().position(|k| k.iteration == iteration)?;
        self.message_keys.remove(index)
    }

    /// 当前链状态对应的分发消息
    pub(crate) fn distribution(&self, distribution_id: Uuid) -> SenderKeyDistributionMessage {
        SenderKeyDistributionMessage {
            distribution_id,
            chain_id: self.chain_id,
            iteration: self.chain_key.iteration,
            chain_key: self.chain_key.key,
            signing_key: self.signing_public,
        }
    }
}

impl fmt::Debug for SenderKeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenderKeyState")
            .field("chain_id", &self.chain_id)
            .field("iteration", &self.chain_key.iteration)
            .field("outbound", &self.signing_private.is_some())
            .field("message_keys.len", &self.message_keys.len())
            .finish()
    }
}

/// 持久化的发送者密钥记录，每个 (地址, 设备, 分发ID) 只有一条
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SenderKeyRecord {
    state: SenderKeyState,
}

impl SenderKeyRecord {
    pub fn new(state: SenderKeyState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &SenderKeyState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut SenderKeyState {
        &mut self.state
    }

    /// 序列化为 `版本 || bincode`
    pub fn serialize(&self) -> Result<Vec<u8>, SenderKeyError> {
        let body = bincode::serialize(&self.state)
            .map_err(|e| SenderKeyError::InvalidRecord(e.to_string()))?;

        let mut bytes = Vec::with_capacity(1 + body.len());
        bytes.push(SENDER_KEY_VERSION);
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, SenderKeyError> {
        let (version, body) = bytes
            .split_first()
            .ok_or_else(|| SenderKeyError::InvalidRecord("Empty record".to_string()))?;

        if *version != SENDER_KEY_VERSION {
            return Err(SenderKeyError::InvalidRecord(format!("Unknown record version {}", version)));
        }

        let state = bincode::deserialize(body)
            .map_err(|e| SenderKeyError::InvalidRecord(e.to_string()))?;

        Ok(Self { state })
    }
}

#[derive(Serialize, Deserialize)]
struct DistributionBody {
    distribution_id: Uuid,
    chain_id: u32,
    iteration: u32,
    chain_key: [u8; 32],
    signing_key: [u8; 32],
}

/// 发送者密钥分发消息：出站链的当前种子
#[derive(Clone, PartialEq, Eq)]
pub struct SenderKeyDistributionMessage {
    distribution_id: Uuid,
    chain_id: u32,
    iteration: u32,
    chain_key: [u8; 32],
    signing_key: [u8; 32],
}

impl SenderKeyDistributionMessage {
    pub fn distribution_id(&self) -> Uuid {
        self.distribution_id
    }

    pub fn chain_id(&self) -> u32 {
        self.chain_id
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn encode(&self) -> Result<Vec<u8>, SenderKeyError> {
        let body = DistributionBody {
            distribution_id: self.distribution_id,
            chain_id: self.chain_id,
            iteration: self.iteration,
            chain_key: self.chain_key,
            signing_key: self.signing_key,
        };
        let body = bincode::serialize(&body)
            .map_err(|e| SenderKeyError::InvalidMessage(e.to_string()))?;

        let mut bytes = Vec::with_capacity(1 + body.len());
        bytes.push(SENDER_KEY_VERSION);
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SenderKeyError> {
        let (version, body) = bytes
            .split_first()
            .ok_or_else(|| SenderKeyError::InvalidMessage("Empty distribution message".to_string()))?;

        if *version != SENDER_KEY_VERSION {
            return Err(SenderKeyError::UnsupportedVersion(*version));
        }

        let body: DistributionBody = bincode::deserialize(body)
            .map_err(|e| SenderKeyError::InvalidMessage(e.to_string()))?;

        // 签名公钥必须可用
        ed25519_dalek::PublicKey::from_bytes(&body.signing_key)
            .map_err(|e| SenderKeyError::InvalidMessage(format!("Invalid signing key: {}", e)))?;

        Ok(Self {
            distribution_id: body.distribution_id,
            chain_id: body.chain_id,
            iteration: body.iteration,
            chain_key: body.chain_key,
            signing_key: body.signing_key,
        })
    }
}

impl fmt::Debug for SenderKeyDistributionMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenderKeyDistributionMessage")
            .field("distribution_id", &self.distribution_id)
            .field("chain_id", &self.chain_id)
            .field("iteration", &self.iteration)
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct MessageBody {
    distribution_id: Uuid,
    chain_id: u32,
    iteration: u32,
    ciphertext: Vec<u8>,
}

/// 群组密文：`版本 || bincode(正文) || 签名`
#[derive(Clone, Debug)]
pub struct SenderKeyMessage {
    pub distribution_id: Uuid,
    pub chain_id: u32,
    pub iteration: u32,
    pub ciphertext: Vec<u8>,
    signed_part: Vec<u8>,
    signature: Vec<u8>,
}

impl SenderKeyMessage {
    /// 构造并签名
    pub(crate) fn new_signed(
        distribution_id: Uuid,
        chain_id: u32,
        iteration: u32,
        ciphertext: Vec<u8>,
        signing_private: &[u8; 32],
    ) -> Result<Self, SenderKeyError> {
        let body = MessageBody {
            distribution_id,
            chain_id,
            iteration,
            ciphertext,
        };
        let encoded = bincode::serialize(&body)
            .map_err(|e| SenderKeyError::EncryptionFailed(e.to_string()))?;

        let mut signed_part = Vec::with_capacity(1 + encoded.len());
        signed_part.push(SENDER_KEY_VERSION);
        signed_part.extend_from_slice(&encoded);

        let signature = signing::sign(signing_private, &signed_part)
            .map_err(|e| SenderKeyError::EncryptionFailed(e.to_string()))?;

        Ok(Self {
            distribution_id,
            chain_id,
            iteration,
            ciphertext: body.ciphertext,
            signed_part,
            signature: signature.to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.signed_part.len() + self.signature.len());
        bytes.extend_from_slice(&self.signed_part);
        bytes.extend_from_slice(&self.signature);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SenderKeyError> {
        if bytes.len() < 1 + SIGNATURE_LENGTH {
            return Err(SenderKeyError::InvalidMessage("Message too short".to_string()));
        }

        if bytes[0] != SENDER_KEY_VERSION {
            return Err(SenderKeyError::UnsupportedVersion(bytes[0]));
        }

        let split = bytes.len() - SIGNATURE_LENGTH;
        let body: MessageBody = bincode::deserialize(&bytes[1..split])
            .map_err(|e| SenderKeyError::InvalidMessage(e.to_string()))?;

        Ok(Self {
            distribution_id: body.distribution_id,
            chain_id: body.chain_id,
            iteration: body.iteration,
            ciphertext: body.ciphertext,
            signed_part: bytes[..split].to_vec(),
            signature: bytes[split..].to_vec(),
        })
    }

    pub fn verify_signature(&self, signing_public: &[u8; 32]) -> Result<(), SenderKeyError> {
        signing::verify(signing_public, &self.signed_part, &self.signature)
            .map_err(|e| SenderKeyError::InvalidSignature(e.to_string()))
    }

    /// 认证附加数据：分发ID、链ID与迭代号
    pub(crate) fn associated_data(distribution_id: &Uuid, chain_id: u32, iteration: u32) -> Vec<u8> {
        let mut aad = Vec::with_capacity(24);
        aad.extend_from_slice(distribution_id.as_bytes());
        aad.extend_from_slice(&chain_id.to_be_bytes());
        aad.extend_from_slice(&iteration.to_be_bytes());
        aad
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_key_is_deterministic() {
        let chain = SenderChainKey::new(0, [9u8; 32]);

        assert_eq!(chain.message_key().seed, chain.message_key().seed);
        assert_eq!(chain.next().iteration, 1);
        assert_ne!(chain.next().key, chain.key);
        assert_ne!(chain.message_key().seed, chain.next().message_key().seed);
    }

    #[test]
    fn test_distribution_decode_rejects_garbage() {
        assert!(SenderKeyDistributionMessage::decode(&[]).is_err());
        assert!(matches!(
            SenderKeyDistributionMessage::decode(&[0x99, 1, 2, 3]),
            Err(SenderKeyError::UnsupportedVersion(0x99))
        ));
        assert!(matches!(
            SenderKeyDistributionMessage::decode(&[SENDER_KEY_VERSION, 1, 2]),
            Err(SenderKeyError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_distribution_encode_decode() {
        let state = SenderKeyState::new_outbound().unwrap();
        let distribution_id = Uuid::new_v4();

        let message = state.distribution(distribution_id);
        let decoded = SenderKeyDistributionMessage::decode(&message.encode().unwrap()).unwrap();

        assert_eq!(decoded, message);
        assert_eq!(decoded.chain_id(), state.chain_id());
    }

    #[test]
    fn test_record_rejects_unknown_version() {
        let record = SenderKeyRecord::new(SenderKeyState::new_outbound().unwrap());
        let mut bytes = record.serialize().unwrap();
        bytes[0] = 1;

        assert!(matches!(
            SenderKeyRecord::deserialize(&bytes),
            Err(SenderKeyError::InvalidRecord(_))
        ));
    }

    #[test]
    fn test_message_key_cache_is_bounded() {
        let mut state = SenderKeyState::new_outbound().unwrap();
        let mut chain = SenderChainKey::new(0, [1u8; 32]);

        for _ in 0..(MAX_MESSAGE_KEYS + 10) {
            state.add_message_key(chain.message_key());
            chain = chain.next();
        }

        assert_eq!(state.message_keys.len(), MAX_MESSAGE_KEYS);
        // 最旧的密钥被淘汰
        assert!(state.remove_message_key(0).is_none());
        assert!(state.remove_message_key(10).is_some());
    }
}
