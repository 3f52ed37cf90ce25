use crate::identity::{IdentityMaterial, IdentityMaterialManager, MaterialError, MemberKeys};
use crate::protocol::{
    create_sender_key_distribution_message, derive_distribution_id, new_sender_key_record,
    process_sender_key_distribution_message, GroupCipher, ProtocolAddress, ProtocolStore,
    SenderKeyDistributionMessage, SenderKeyError, SenderKeyRecord, SenderKeyStore,
};
use crate::space::SpaceKeyDistribution;
use crate::utils::{decode_b64, encode_b64};
use log::{debug, info, warn};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Identity material unavailable: {0}")]
    MaterialUnavailable(#[from] MaterialError),

    #[error("Malformed distribution from {user_id}: {reason}")]
    MalformedDistribution { user_id: String, reason: String },

    #[error("No session for sender {0}")]
    NoSessionForSender(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Corrupt key record: {0}")]
    CorruptKeyRecord(String),

    #[error("Session is closed")]
    SessionClosed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] SenderKeyError),
}

/// 会话生命周期
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// 身份材料已载入，出站链就绪
    Bootstrapped,
    /// 至少完成过一次成功的加解密或分发处理
    Active,
    /// 终态，拒绝所有操作
    Closed,
}

/// 对单个成员分发消息的处理决定
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DistributionDecision {
    /// 该成员还没有入站加解密器
    New,
    /// 字节与上次相同且加解密器存在，什么也不做
    Unchanged,
    /// 字节变化，丢弃旧链重新建立
    Replaced,
}

/// `create_session` 的逐成员结果
#[derive(Debug, Default)]
pub struct SessionReport {
    pub applied: Vec<(String, DistributionDecision)>,
    pub failed: Vec<(String, SessionError)>,
}

impl SessionReport {
    pub fn decision_for(&self, user_id: &str) -> Option<DistributionDecision> {
        self.applied
            .iter()
            .find(|(user, _)| user == user_id)
            .map(|(_, decision)| *decision)
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// 尚未提交的出站链
///
/// 由 [`prepare_rotation`](EncryptedSpaceSession::prepare_rotation) 生成。
/// 丢弃它不会改变会话。
#[derive(Clone)]
pub struct PendingRotation {
    record: SenderKeyRecord,
    distribution: SenderKeyDistributionMessage,
}

impl PendingRotation {
    pub fn distribution(&self) -> &SenderKeyDistributionMessage {
        &self.distribution
    }

    pub fn record(&self) -> &SenderKeyRecord {
        &self.record
    }
}

/// 一个空间的加密会话
///
/// 持有本成员的协议存储、自己的出站加解密器，以及每个对端成员的入站加解密器
/// 和最近一次处理过的分发字节。两张表只在 `&mut self` 下访问，
/// 并发访问由调用方（注册表的每空间互斥锁）串行化。
///
/// 会话从不自行持久化：调用方在加密或轮换之后读取
/// [`current_outbound_key_record`](Self::current_outbound_key_record) 并写入记录存储。
pub struct EncryptedSpaceSession {
    space_id: String,
    distribution_id: Uuid,
    own_address: ProtocolAddress,
    store: ProtocolStore,
    outbound: GroupCipher,
    inbound: HashMap<String, GroupCipher>,
    seen_distributions: HashMap<String, Vec<u8>>,
    state: SessionState,
}

impl EncryptedSpaceSession {
    /// 构建会话，分发ID 由空间ID 派生
    pub fn new(
        material: IdentityMaterial,
        persisted_outbound: Option<SenderKeyRecord>,
        space_id: &str,
    ) -> Result<Self, SessionError> {
        let distribution_id = derive_distribution_id(space_id);
        Self::with_distribution_id(material, persisted_outbound, space_id, distribution_id)
    }

    /// 从账户数据源的成员密钥构建会话
    pub fn from_member_keys(
        member: &MemberKeys,
        persisted_outbound: Option<SenderKeyRecord>,
        space_id: &str,
    ) -> Result<Self, SessionError> {
        let material = IdentityMaterialManager::load(member)?;
        Self::new(material, persisted_outbound, space_id)
    }

    /// 使用已确定的分发ID 构建会话
    ///
    /// 持久化记录的查找和会话必须使用同一个分发ID，注册表因此先派生再传入。
    pub fn with_distribution_id(
        material: IdentityMaterial,
        persisted_outbound: Option<SenderKeyRecord>,
        space_id: &str,
        distribution_id: Uuid,
    ) -> Result<Self, SessionError> {
        let own_address = ProtocolAddress::for_user(material.user_id.clone());
        let mut store = ProtocolStore::new(material);

        let restored = persisted_outbound.is_some();
        if let Some(record) = persisted_outbound {
            if !record.state().is_outbound() {
                return Err(SessionError::CorruptKeyRecord(format!(
                    "persisted record for {} has no signing key",
                    own_address
                )));
            }
            store.store_sender_key(&own_address, distribution_id, &record)?;
        }

        // 没有出站链时立即创建，保证会话可以马上加密
        let distribution = create_sender_key_distribution_message(&mut store, &own_address, distribution_id)?;

        info!(
            "Bootstrapped session for {} in space {} (distribution {}, chain {}, {})",
            own_address,
            space_id,
            distribution_id,
            distribution.chain_id(),
            if restored { "restored" } else { "fresh" }
        );

        Ok(Self {
            space_id: space_id.to_string(),
            distribution_id,
            outbound: GroupCipher::new(own_address.clone(), distribution_id),
            own_address,
            store,
            inbound: HashMap::new(),
            seen_distributions: HashMap::new(),
            state: SessionState::Bootstrapped,
        })
    }

    pub fn space_id(&self) -> &str {
        &self.space_id
    }

    pub fn distribution_id(&self) -> Uuid {
        self.distribution_id
    }

    pub fn user_id(&self) -> &str {
        &self.own_address.name
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn protocol_store(&self) -> &ProtocolStore {
        &self.store
    }

    /// 某个成员当前的入站加解密器
    pub fn inbound_cipher(&self, user_id: &str) -> Option<&GroupCipher> {
        self.inbound.get(user_id)
    }

    pub fn has_session_for(&self, user_id: &str) -> bool {
        self.inbound.contains_key(user_id)
    }

    /// 已建立入站会话的成员ID（排序）
    pub fn members(&self) -> Vec<String> {
        let mut members: Vec<String> = self.inbound.keys().cloned().collect();
        members.sort();
        members
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::SessionClosed);
        }
        Ok(())
    }

    fn activate(&mut self) {
        if self.state == SessionState::Bootstrapped {
            debug!("Session {} in space {} is now active", self.own_address, self.space_id);
            self.state = SessionState::Active;
        }
    }

    /// 当前出站记录（供调用方持久化）
    pub fn current_outbound_key_record(&mut self) -> Result<SenderKeyRecord, SessionError> {
        self.ensure_open()?;

        self.store
            .load_sender_key(&self.own_address, self.distribution_id)?
            .ok_or_else(|| SessionError::CorruptKeyRecord(format!("no outbound record for {}", self.own_address)))
    }

    /// 当前纪元需要发布的分发消息
    pub fn outbound_distribution(&mut self) -> Result<SenderKeyDistributionMessage, SessionError> {
        self.ensure_open()?;
        Ok(create_sender_key_distribution_message(
            &mut self.store,
            &self.own_address,
            self.distribution_id,
        )?)
    }

    /// 纯函数：判断一条分发消息应如何处理
    pub fn classify(&self, distribution: &SpaceKeyDistribution) -> DistributionDecision {
        let user_id = &distribution.user_id;

        match (self.inbound.contains_key(user_id), self.seen_distributions.get(user_id)) {
            (false, _) => DistributionDecision::New,
            (true, Some(seen)) if *seen == distribution.key_distribution_message => DistributionDecision::Unchanged,
            (true, _) => DistributionDecision::Replaced,
        }
    }

    /// 处理一批成员分发消息
    ///
    /// 单个成员失败不影响其他成员，失败记录在报告中。整体只会因会话关闭而失败。
    pub fn create_session(&mut self, distributions: &[SpaceKeyDistribution]) -> Result<SessionReport, SessionError> {
        self.ensure_open()?;

        let mut report = SessionReport::default();
        for distribution in distributions {
            if distribution.user_id == self.own_address.name {
                debug!("Ignoring own distribution in space {}", self.space_id);
                continue;
            }

            match self.apply_distribution(distribution) {
                Ok(decision) => report.applied.push((distribution.user_id.clone(), decision)),
                Err(e) => {
                    warn!("Skipping distribution from {} in space {}: {}", distribution.user_id, self.space_id, e);
                    report.failed.push((distribution.user_id.clone(), e));
                }
            }
        }

        self.activate();
        Ok(report)
    }

    fn apply_distribution(&mut self, distribution: &SpaceKeyDistribution) -> Result<DistributionDecision, SessionError> {
        let user_id = &distribution.user_id;
        let malformed = |reason: String| SessionError::MalformedDistribution {
            user_id: user_id.clone(),
            reason,
        };

        // 先解码：解码失败时保留该成员原有状态
        let message = SenderKeyDistributionMessage::decode(&distribution.key_distribution_message)
            .map_err(|e| malformed(e.to_string()))?;

        // 只接受本空间的分发
        if message.distribution_id() != self.distribution_id {
            return Err(malformed(format!(
                "distribution {} does not belong to space {}",
                message.distribution_id(),
                self.space_id
            )));
        }

        let decision = self.classify(distribution);
        if decision == DistributionDecision::Unchanged {
            debug!("Distribution from {} unchanged", user_id);
            return Ok(decision);
        }

        self.seen_distributions.remove(user_id);
        self.inbound.remove(user_id);

        let address = ProtocolAddress::for_user(user_id.clone());
        process_sender_key_distribution_message(&mut self.store, &address, &message)
            .map_err(|e| malformed(e.to_string()))?;

        self.seen_distributions
            .insert(user_id.clone(), distribution.key_distribution_message.clone());
        self.inbound
            .insert(user_id.clone(), GroupCipher::new(address, self.distribution_id));

        info!(
            "{:?} sender key for {} in space {} (chain {})",
            decision,
            user_id,
            self.space_id,
            message.chain_id()
        );
        Ok(decision)
    }

    /// 加密文本，返回 base64 密文
    pub fn encrypt_message(&mut self, plaintext: &str) -> Result<String, SessionError> {
        self.ensure_open()?;

        let ciphertext = self.outbound.encrypt(&mut self.store, plaintext.as_bytes())?;
        self.activate();
        Ok(encode_b64(&ciphertext))
    }

    /// 解密来自指定成员的 base64 密文
    pub fn decrypt_message(&mut self, ciphertext: &str, sender_user_id: &str) -> Result<String, SessionError> {
        self.ensure_open()?;

        let cipher = self
            .inbound
            .get(sender_user_id)
            .cloned()
            .ok_or_else(|| SessionError::NoSessionForSender(sender_user_id.to_string()))?;

        let bytes = decode_b64(ciphertext).map_err(|e| SessionError::DecryptionFailed(e.to_string()))?;
        let plaintext = cipher
            .decrypt(&mut self.store, &bytes)
            .map_err(|e| SessionError::DecryptionFailed(e.to_string()))?;

        let text = String::from_utf8(plaintext).map_err(|e| SessionError::DecryptionFailed(e.to_string()))?;
        self.activate();
        Ok(text)
    }

    /// 生成候选出站链，会话状态不变
    pub fn prepare_rotation(&self) -> Result<PendingRotation, SessionError> {
        self.ensure_open()?;

        let (record, distribution) = new_sender_key_record(self.distribution_id)?;
        debug!(
            "Prepared chain {} for {} in space {}",
            distribution.chain_id(),
            self.own_address,
            self.space_id
        );
        Ok(PendingRotation { record, distribution })
    }

    /// 提交候选链，旧出站链作废
    pub fn commit_rotation(&mut self, pending: PendingRotation) -> Result<SenderKeyDistributionMessage, SessionError> {
        self.ensure_open()?;

        self.store
            .store_sender_key(&self.own_address, self.distribution_id, &pending.record)?;
        self.outbound = GroupCipher::new(self.own_address.clone(), self.distribution_id);

        info!(
            "Rotated outbound chain for {} in space {} (chain {})",
            self.own_address,
            self.space_id,
            pending.distribution.chain_id()
        );
        Ok(pending.distribution)
    }

    /// 轮换出站链，返回新的分发消息
    pub fn rotate_outbound(&mut self) -> Result<SenderKeyDistributionMessage, SessionError> {
        let pending = self.prepare_rotation()?;
        self.commit_rotation(pending)
    }

    /// 移除离开成员的入站状态，返回该成员之前是否存在
    pub fn forget_member(&mut self, user_id: &str) -> Result<bool, SessionError> {
        self.ensure_open()?;

        self.seen_distributions.remove(user_id);
        match self.inbound.remove(user_id) {
            Some(cipher) => {
                self.store.remove_sender_key(cipher.address(), cipher.distribution_id())?;
                debug!("Forgot {} in space {}", user_id, self.space_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// 关闭会话，丢弃全部入站状态
    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            info!("Closing session for {} in space {}", self.own_address, self.space_id);
        }
        self.inbound.clear();
        self.seen_distributions.clear();
        self.state = SessionState::Closed;
    }
}
