use crate::crypto::{EnvelopeError, PublicKey};
use crate::protocol::SenderKeyError;
use crate::space::{
    EncryptedDistribution, MemberKeyData, SessionError, SessionReport, SpaceKeyDistribution, SpaceSessionRegistry,
};
use crate::storage::KeyRecordStoreError;
use crate::utils::now_millis;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

#[derive(Error, Debug)]
pub enum SpaceServiceError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Key record store error: {0}")]
    Store(#[from] KeyRecordStoreError),

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] SenderKeyError),

    #[error("{user_id} is not a member of space {space_id}")]
    NotAMember { space_id: String, user_id: String },

    #[error("Distribution is addressed to {0}")]
    NotRecipient(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

/// 轮换任务依赖的空间密钥服务
#[async_trait]
pub trait SpaceKeyService: Send + Sync {
    /// 本地用户需要轮换密钥的空间
    async fn get_user_spaces_to_rotate_keys(&self) -> Result<Vec<String>, SpaceServiceError>;

    /// 轮换本地用户在空间中的发送者密钥并发布新的分发
    async fn rotate_sender_key(&self, space_id: &str) -> Result<(), SpaceServiceError>;
}

#[derive(Default)]
struct SpaceEntry {
    members: BTreeMap<String, PublicKey>,
    roster_version: u64,
    key_data: HashMap<String, MemberKeyData>,
}

/// 进程内的空间成员目录
///
/// 每个空间记录成员身份公钥、成员变动时递增的名册版本，以及每个成员发布的密钥数据。
#[derive(Clone, Default)]
pub struct SpaceDirectory {
    spaces: Arc<RwLock<HashMap<String, SpaceEntry>>>,
}

impl SpaceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 成员加入空间（重复加入只更新公钥）
    pub async fn join(&self, space_id: &str, user_id: &str, identity: PublicKey) {
        let mut spaces = self.spaces.write().await;
        let entry = spaces.entry(space_id.to_string()).or_default();

        if entry.members.insert(user_id.to_string(), identity).is_none() {
            entry.roster_version += 1;
            debug!("{} joined space {} (roster v{})", user_id, space_id, entry.roster_version);
        }
    }

    /// 成员离开空间，其发布的密钥数据一并删除
    pub async fn leave(&self, space_id: &str, user_id: &str) -> bool {
        let mut spaces = self.spaces.write().await;
        let Some(entry) = spaces.get_mut(space_id) else {
            return false;
        };

        entry.key_data.remove(user_id);
        if entry.members.remove(user_id).is_some() {
            entry.roster_version += 1;
            debug!("{} left space {} (roster v{})", user_id, space_id, entry.roster_version);
            true
        } else {
            false
        }
    }

    pub async fn is_member(&self, space_id: &str, user_id: &str) -> bool {
        self.spaces
            .read()
            .await
            .get(space_id)
            .map_or(false, |entry| entry.members.contains_key(user_id))
    }

    pub async fn members(&self, space_id: &str) -> Vec<(String, PublicKey)> {
        self.spaces
            .read()
            .await
            .get(space_id)
            .map(|entry| entry.members.iter().map(|(id, key)| (id.clone(), key.clone())).collect())
            .unwrap_or_default()
    }

    pub async fn roster_version(&self, space_id: &str) -> Option<u64> {
        self.spaces.read().await.get(space_id).map(|entry| entry.roster_version)
    }

    /// 用户所在的全部空间（排序）
    pub async fn spaces_for(&self, user_id: &str) -> Vec<String> {
        let mut spaces: Vec<String> = self
            .spaces
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.members.contains_key(user_id))
            .map(|(space_id, _)| space_id.clone())
            .collect();
        spaces.sort();
        spaces
    }

    /// 发布成员密钥数据，覆盖该成员之前的发布
    pub async fn publish(&self, space_id: &str, data: MemberKeyData) {
        let mut spaces = self.spaces.write().await;
        let entry = spaces.entry(space_id.to_string()).or_default();
        entry.key_data.insert(data.member_id.clone(), data);
    }

    pub async fn key_data(&self, space_id: &str) -> Vec<MemberKeyData> {
        let mut data: Vec<MemberKeyData> = self
            .spaces
            .read()
            .await
            .get(space_id)
            .map(|entry| entry.key_data.values().cloned().collect())
            .unwrap_or_default();
        data.sort_by(|a, b| a.member_id.cmp(&b.member_id));
        data
    }
}

#[derive(Clone, Copy, Debug)]
struct RotationStamp {
    rotated_at: i64,
    roster_version: u64,
}

/// 基于本地注册表和空间目录的服务实现
pub struct LocalSpaceService {
    registry: Arc<SpaceSessionRegistry>,
    directory: SpaceDirectory,
    interval: Duration,
    rotations: Mutex<HashMap<String, RotationStamp>>,
}

impl LocalSpaceService {
    pub fn new(registry: Arc<SpaceSessionRegistry>, directory: SpaceDirectory, interval: Duration) -> Self {
        Self {
            registry,
            directory,
            interval,
            rotations: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SpaceSessionRegistry> {
        &self.registry
    }

    pub fn directory(&self) -> &SpaceDirectory {
        &self.directory
    }

    /// 加入空间：登记身份公钥并打开会话
    pub async fn join_space(&self, space_id: &str) -> Result<(), SpaceServiceError> {
        self.directory
            .join(space_id, self.registry.user_id(), self.registry.identity_public().clone())
            .await;
        self.registry.open_space(space_id).await?;
        Ok(())
    }

    /// 离开空间：退出名册、关闭会话、清除记录
    pub async fn leave_space(&self, space_id: &str) -> Result<usize, SpaceServiceError> {
        self.directory.leave(space_id, self.registry.user_id()).await;
        self.rotations.lock().await.remove(space_id);
        self.registry.leave_space(space_id).await
    }

    /// 同步空间：打开发给自己的分发并交给会话处理，同时移除已离开成员的状态
    pub async fn sync_space(&self, space_id: &str) -> Result<SessionReport, SpaceServiceError> {
        let me = self.registry.user_id().to_string();
        let mut distributions = Vec::new();
        let mut envelope_failures = Vec::new();

        for data in self.directory.key_data(space_id).await {
            if data.member_id == me {
                continue;
            }

            let Some(sealed) = data.distribution_for(&me) else {
                debug!("{} has not published a distribution for {} yet", data.member_id, me);
                continue;
            };

            match self.registry.open_sealed(sealed) {
                Ok(bytes) => distributions.push(SpaceKeyDistribution::new(data.member_id.clone(), bytes)),
                Err(e) => {
                    warn!("Cannot open distribution from {} in space {}: {}", data.member_id, space_id, e);
                    envelope_failures.push((
                        data.member_id.clone(),
                        SessionError::MalformedDistribution {
                            user_id: data.member_id.clone(),
                            reason: e.to_string(),
                        },
                    ));
                }
            }
        }

        let mut report = self.registry.apply_distributions(space_id, &distributions).await?;
        report.failed.extend(envelope_failures);

        let roster: Vec<String> = self
            .directory
            .members(space_id)
            .await
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        if let Some(session) = self.registry.session(space_id).await {
            let mut session = session.lock().await;
            for member in session.members() {
                if !roster.contains(&member) {
                    session.forget_member(&member)?;
                }
            }
        }

        Ok(report)
    }

    fn sealed_for_members(
        &self,
        members: &[(String, PublicKey)],
        distribution: &[u8],
    ) -> Result<Vec<EncryptedDistribution>, SpaceServiceError> {
        members
            .iter()
            .filter(|(id, _)| id != self.registry.user_id())
            .map(|(id, key)| EncryptedDistribution::seal_for(id, key, distribution).map_err(SpaceServiceError::from))
            .collect()
    }
}

#[async_trait]
impl SpaceKeyService for LocalSpaceService {
    async fn get_user_spaces_to_rotate_keys(&self) -> Result<Vec<String>, SpaceServiceError> {
        let now = now_millis();
        let interval = i64::try_from(self.interval.as_millis()).unwrap_or(i64::MAX);
        let rotations = self.rotations.lock().await;

        let mut due = Vec::new();
        for space_id in self.directory.spaces_for(self.registry.user_id()).await {
            let roster_version = self.directory.roster_version(&space_id).await.unwrap_or_default();

            let needs_rotation = match rotations.get(&space_id) {
                None => true,
                Some(stamp) => {
                    stamp.roster_version != roster_version || now.saturating_sub(stamp.rotated_at) >= interval
                }
            };

            if needs_rotation {
                due.push(space_id);
            }
        }

        debug!("{} spaces due for key rotation", due.len());
        Ok(due)
    }

    async fn rotate_sender_key(&self, space_id: &str) -> Result<(), SpaceServiceError> {
        let me = self.registry.user_id();
        if !self.directory.is_member(space_id, me).await {
            return Err(SpaceServiceError::NotAMember {
                space_id: space_id.to_string(),
                user_id: me.to_string(),
            });
        }

        // 读取名册版本必须在取成员之前，期间的变动会在下一轮被发现
        let roster_version = self.directory.roster_version(space_id).await.unwrap_or_default();
        let members = self.directory.members(space_id).await;

        // 先封装候选链，全部成功后才切换，失败时旧链继续有效
        let (_, distributions) = self
            .registry
            .rotate_with(space_id, |distribution| {
                self.sealed_for_members(&members, &distribution.encode()?)
            })
            .await?;
        let recipients = distributions.len();

        self.directory
            .publish(
                space_id,
                MemberKeyData {
                    member_id: me.to_string(),
                    data_updated_at: now_millis(),
                    distributions,
                },
            )
            .await;

        self.rotations.lock().await.insert(
            space_id.to_string(),
            RotationStamp {
                rotated_at: now_millis(),
                roster_version,
            },
        );

        info!("Rotated sender key for space {} ({} recipients)", space_id, recipients);
        Ok(())
    }
}
