use crate::crypto::KeyPair;
use crate::identity::{IdentityMaterial, PreKeyRecord, SignedPreKeyRecord};
use crate::protocol::{ProtocolAddress, SenderKeyError, SenderKeyRecord};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// 发送者密钥存储接口
pub trait SenderKeyStore {
    fn store_sender_key(
        &mut self,
        sender: &ProtocolAddress,
        distribution_id: Uuid,
        record: &SenderKeyRecord,
    ) -> Result<(), SenderKeyError>;

    fn load_sender_key(
        &mut self,
        sender: &ProtocolAddress,
        distribution_id: Uuid,
    ) -> Result<Option<SenderKeyRecord>, SenderKeyError>;

    fn remove_sender_key(
        &mut self,
        sender: &ProtocolAddress,
        distribution_id: Uuid,
    ) -> Result<(), SenderKeyError>;
}

/// 会话生命周期内的内存协议存储
///
/// 持有身份、签名预密钥、一次性预密钥以及全部发送者密钥记录。
/// 一个空间会话对应一个存储，记录按 (地址, 分发ID) 分区。
pub struct ProtocolStore {
    identity: KeyPair,
    registration_id: u32,
    signed_pre_key: SignedPreKeyRecord,
    pre_keys: BTreeMap<u32, PreKeyRecord>,
    sender_keys: HashMap<(ProtocolAddress, Uuid), SenderKeyRecord>,
}

impl ProtocolStore {
    pub fn new(material: IdentityMaterial) -> Self {
        let IdentityMaterial {
            identity,
            registration_id,
            signed_pre_key,
            pre_keys,
            ..
        } = material;

        let pre_keys = pre_keys.into_iter().map(|k| (k.id, k)).collect();

        Self {
            identity,
            registration_id,
            signed_pre_key,
            pre_keys,
            sender_keys: HashMap::new(),
        }
    }

    pub fn identity_key_pair(&self) -> &KeyPair {
        &self.identity
    }

    pub fn local_registration_id(&self) -> u32 {
        self.registration_id
    }

    pub fn signed_pre_key(&self) -> &SignedPreKeyRecord {
        &self.signed_pre_key
    }

    pub fn pre_key_count(&self) -> usize {
        self.pre_keys.len()
    }

    pub fn sender_key_count(&self) -> usize {
        self.sender_keys.len()
    }
}

impl SenderKeyStore for ProtocolStore {
    fn store_sender_key(
        &mut self,
        sender: &ProtocolAddress,
        distribution_id: Uuid,
        record: &SenderKeyRecord,
    ) -> Result<(), SenderKeyError> {
        // 同一键只保留最新记录，不做合并
        self.sender_keys
            .insert((sender.clone(), distribution_id), record.clone());
        Ok(())
    }

    fn load_sender_key(
        &mut self,
        sender: &ProtocolAddress,
        distribution_id: Uuid,
    ) -> Result<Option<SenderKeyRecord>, SenderKeyError> {
        Ok(self
            .sender_keys
            .get(&(sender.clone(), distribution_id))
            .cloned())
    }

    fn remove_sender_key(
        &mut self,
        sender: &ProtocolAddress,
        distribution_id: Uuid,
    ) -> Result<(), SenderKeyError> {
        self.sender_keys.remove(&(sender.clone(), distribution_id));
        Ok(())
    }
}
