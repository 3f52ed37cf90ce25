use crate::crypto::KeyPair;
use crate::identity::{IdentityMaterialManager, MemberKeys};
use crate::protocol::{derive_distribution_id, SenderKeyDistributionMessage, DEFAULT_DEVICE_ID};
use crate::space::{
    EncryptedDistribution, EncryptedSpaceSession, SessionError, SessionReport, SpaceKeyDistribution, SpaceServiceError,
};
use crate::storage::{KeyRecordStore, KeyRecordStoreError, SenderKeyEntity};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// 共享的空间会话，互斥锁是每个会话的串行化边界
pub type SharedSession = Arc<Mutex<EncryptedSpaceSession>>;

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<String, SharedSession>,
    /// 空间ID -> 分发ID，关闭空间后仍保留，离开空间时移除
    distribution_ids: HashMap<String, Uuid>,
}

impl RegistryState {
    fn distribution_id(&mut self, space_id: &str) -> Uuid {
        *self
            .distribution_ids
            .entry(space_id.to_string())
            .or_insert_with(|| derive_distribution_id(space_id))
    }
}

/// 空间会话注册表
///
/// 显式持有 空间ID -> 会话 的映射：打开空间时创建，关闭空间时销毁。
/// 所有会话都属于同一个本地成员。
///
/// 派生出的分发ID 在注册表生命周期内按空间ID 记住。非 UUID 的空间ID
/// 每次派生结果不同，重新打开或离开空间时必须复用同一个值才能找到已写入的记录。
pub struct SpaceSessionRegistry {
    member: MemberKeys,
    identity: KeyPair,
    records: KeyRecordStore,
    state: Mutex<RegistryState>,
}

impl SpaceSessionRegistry {
    /// 创建注册表，立即校验成员的身份材料
    pub fn new(member: MemberKeys, records: KeyRecordStore) -> Result<Self, SpaceServiceError> {
        let material = IdentityMaterialManager::load(&member).map_err(SessionError::from)?;

        Ok(Self {
            member,
            identity: material.identity,
            records,
            state: Mutex::new(RegistryState::default()),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.member.id
    }

    pub fn identity_public(&self) -> &crate::crypto::PublicKey {
        &self.identity.public
    }

    pub fn records(&self) -> &KeyRecordStore {
        &self.records
    }

    /// 空间当前使用的分发ID，首次查询时派生
    pub async fn distribution_id(&self, space_id: &str) -> Uuid {
        self.state.lock().await.distribution_id(space_id)
    }

    /// 打开空间：已打开则返回现有会话，否则从持久化记录恢复或新建
    pub async fn open_space(&self, space_id: &str) -> Result<SharedSession, SpaceServiceError> {
        let mut state = self.state.lock().await;
        if let Some(session) = state.sessions.get(space_id) {
            return Ok(session.clone());
        }

        let distribution_id = state.distribution_id(space_id);
        let persisted = match self
            .records
            .load_record(&self.member.id, DEFAULT_DEVICE_ID, distribution_id)
        {
            Err(KeyRecordStoreError::CorruptKeyRecord { key, reason }) => {
                warn!("Discarding unreadable outbound record {} for space {}: {}", key, space_id, reason);
                None
            }
            other => other?,
        };

        let material = IdentityMaterialManager::load(&self.member).map_err(SessionError::from)?;
        let mut session = match EncryptedSpaceSession::with_distribution_id(material, persisted, space_id, distribution_id) {
            Err(SessionError::CorruptKeyRecord(reason)) => {
                warn!("Discarding persisted outbound record for space {}: {}", space_id, reason);
                let material = IdentityMaterialManager::load(&self.member).map_err(SessionError::from)?;
                EncryptedSpaceSession::with_distribution_id(material, None, space_id, distribution_id)?
            }
            other => other?,
        };

        // 新建的出站链也要落盘，否则已发布的分发在重启后失效
        self.persist(&mut session)?;

        let session = Arc::new(Mutex::new(session));
        state.sessions.insert(space_id.to_string(), session.clone());
        debug!("Opened space {} ({} open)", space_id, state.sessions.len());

        Ok(session)
    }

    /// 已打开的会话
    pub async fn session(&self, space_id: &str) -> Option<SharedSession> {
        self.state.lock().await.sessions.get(space_id).cloned()
    }

    pub async fn open_spaces(&self) -> Vec<String> {
        let mut spaces: Vec<String> = self.state.lock().await.sessions.keys().cloned().collect();
        spaces.sort();
        spaces
    }

    /// 关闭空间：会话进入 Closed 并从注册表移除，持久化记录保留
    pub async fn close_space(&self, space_id: &str) -> bool {
        let removed = self.state.lock().await.sessions.remove(space_id);

        match removed {
            Some(session) => {
                session.lock().await.close();
                info!("Closed space {}", space_id);
                true
            }
            None => false,
        }
    }

    /// 离开空间：关闭会话并清除该空间的全部密钥记录
    pub async fn leave_space(&self, space_id: &str) -> Result<usize, SpaceServiceError> {
        let (removed, remembered) = {
            let mut state = self.state.lock().await;
            (state.sessions.remove(space_id), state.distribution_ids.remove(space_id))
        };

        if let Some(session) = removed {
            session.lock().await.close();
        }
        let distribution_id = remembered.unwrap_or_else(|| derive_distribution_id(space_id));

        let purged = self.records.delete_distribution(distribution_id)?;
        info!("Left space {} and purged {} key records", space_id, purged);
        Ok(purged)
    }

    /// 加密并持久化推进后的出站记录
    pub async fn encrypt(&self, space_id: &str, plaintext: &str) -> Result<String, SpaceServiceError> {
        let session = self.open_space(space_id).await?;
        let mut session = session.lock().await;

        let ciphertext = session.encrypt_message(plaintext)?;
        self.persist(&mut session)?;
        Ok(ciphertext)
    }

    pub async fn decrypt(&self, space_id: &str, ciphertext: &str, sender_user_id: &str) -> Result<String, SpaceServiceError> {
        let session = self.open_space(space_id).await?;
        let mut session = session.lock().await;
        Ok(session.decrypt_message(ciphertext, sender_user_id)?)
    }

    pub async fn apply_distributions(
        &self,
        space_id: &str,
        distributions: &[SpaceKeyDistribution],
    ) -> Result<SessionReport, SpaceServiceError> {
        let session = self.open_space(space_id).await?;
        let mut session = session.lock().await;
        Ok(session.create_session(distributions)?)
    }

    pub async fn outbound_distribution(&self, space_id: &str) -> Result<SenderKeyDistributionMessage, SpaceServiceError> {
        let session = self.open_space(space_id).await?;
        let mut session = session.lock().await;
        Ok(session.outbound_distribution()?)
    }

    /// 轮换出站链并持久化
    pub async fn rotate(&self, space_id: &str) -> Result<SenderKeyDistributionMessage, SpaceServiceError> {
        let (distribution, ()) = self.rotate_with(space_id, |_| Ok(())).await?;
        Ok(distribution)
    }

    /// 先生成候选链并交给 `prepare` 处理（如封装给各成员），成功后才持久化并切换出站链
    ///
    /// `prepare` 失败时会话和已持久化的记录都保持原样。
    pub async fn rotate_with<T, F>(
        &self,
        space_id: &str,
        prepare: F,
    ) -> Result<(SenderKeyDistributionMessage, T), SpaceServiceError>
    where
        F: FnOnce(&SenderKeyDistributionMessage) -> Result<T, SpaceServiceError>,
    {
        let session = self.open_space(space_id).await?;
        let mut session = session.lock().await;

        let pending = session.prepare_rotation()?;
        let prepared = prepare(pending.distribution())?;

        let entity = SenderKeyEntity::from_record(
            session.user_id(),
            DEFAULT_DEVICE_ID,
            session.distribution_id(),
            pending.record(),
        )?;
        self.records.put(&entity)?;

        let distribution = session.commit_rotation(pending)?;
        Ok((distribution, prepared))
    }

    pub async fn forget_member(&self, space_id: &str, user_id: &str) -> Result<bool, SpaceServiceError> {
        match self.session(space_id).await {
            Some(session) => Ok(session.lock().await.forget_member(user_id)?),
            None => Ok(false),
        }
    }

    /// 用本地身份私钥打开发给自己的封装
    pub fn open_sealed(&self, sealed: &EncryptedDistribution) -> Result<Vec<u8>, SpaceServiceError> {
        if sealed.recipient_id != self.member.id {
            return Err(SpaceServiceError::NotRecipient(sealed.recipient_id.clone()));
        }
        Ok(sealed.open(&self.identity)?)
    }

    fn persist(&self, session: &mut EncryptedSpaceSession) -> Result<(), SpaceServiceError> {
        let record = session.current_outbound_key_record()?;
        let entity = SenderKeyEntity::from_record(
            session.user_id(),
            DEFAULT_DEVICE_ID,
            session.distribution_id(),
            &record,
        )?;
        self.records.put(&entity)?;
        Ok(())
    }
}
