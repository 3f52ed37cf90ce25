use crate::space::SpaceKeyService;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// 密钥轮换调度配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationConfig {
    /// 轮换周期
    pub interval: Duration,

    /// 首次运行前的延迟
    pub initial_delay: Duration,

    /// 失败或条件不满足后的初始退避，之后按指数增长
    pub retry_backoff: Duration,

    /// 退避上限
    pub max_retry_backoff: Duration,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            interval: 7 * DAY,
            initial_delay: 7 * DAY,
            retry_backoff: Duration::from_secs(30),
            max_retry_backoff: Duration::from_secs(5 * 60 * 60),
        }
    }
}

impl RotationConfig {
    /// 第 `attempt` 次重试前的等待（从 0 开始）
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.retry_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_retry_backoff)
            .min(self.max_retry_backoff)
    }
}

/// 运行轮换前必须满足的设备条件
pub trait RotationConstraints: Send + Sync {
    fn network_connected(&self) -> bool;

    fn battery_not_low(&self) -> bool;

    fn satisfied(&self) -> bool {
        self.network_connected() && self.battery_not_low()
    }
}

/// 总是满足的条件（桌面和测试环境）
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysMet;

impl RotationConstraints for AlwaysMet {
    fn network_connected(&self) -> bool {
        true
    }

    fn battery_not_low(&self) -> bool {
        true
    }
}

/// 一次批量轮换的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Success { rotated: usize },
    /// 出错即中止，已轮换的空间不回滚，整批稍后重试
    Retry { rotated: usize, error: String },
    /// 设备条件不满足
    Skipped,
    Cancelled { rotated: usize },
}

/// 周期性密钥轮换调度器
pub struct KeyRotationScheduler<S: SpaceKeyService> {
    service: Arc<S>,
    config: RotationConfig,
    constraints: Arc<dyn RotationConstraints>,
}

impl<S: SpaceKeyService + 'static> KeyRotationScheduler<S> {
    pub fn new(service: Arc<S>, config: RotationConfig) -> Self {
        Self {
            service,
            config,
            constraints: Arc::new(AlwaysMet),
        }
    }

    pub fn with_constraints(mut self, constraints: impl RotationConstraints + 'static) -> Self {
        self.constraints = Arc::new(constraints);
        self
    }

    pub fn config(&self) -> &RotationConfig {
        &self.config
    }

    /// 执行一次批量轮换
    ///
    /// 只在空间之间检查取消，单个空间的轮换不会被打断。
    pub async fn run_batch(&self, cancel: &watch::Receiver<bool>) -> BatchOutcome {
        if !self.constraints.satisfied() {
            info!("Rotation constraints not met, skipping batch");
            return BatchOutcome::Skipped;
        }

        let spaces = match self.service.get_user_spaces_to_rotate_keys().await {
            Ok(spaces) => spaces,
            Err(e) => {
                warn!("Failed to list spaces for key rotation: {}", e);
                return BatchOutcome::Retry {
                    rotated: 0,
                    error: e.to_string(),
                };
            }
        };

        debug!("Rotation batch covers {} spaces", spaces.len());

        let mut rotated = 0;
        for space_id in &spaces {
            if *cancel.borrow() {
                info!("Rotation batch cancelled after {} spaces", rotated);
                return BatchOutcome::Cancelled { rotated };
            }

            if let Err(e) = self.service.rotate_sender_key(space_id).await {
                warn!("Key rotation failed for space {}: {}", space_id, e);
                return BatchOutcome::Retry {
                    rotated,
                    error: e.to_string(),
                };
            }
            rotated += 1;
        }

        info!("Rotation batch finished, {} spaces rotated", rotated);
        BatchOutcome::Success { rotated }
    }

    /// 启动后台任务
    pub fn spawn(self) -> RotationHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            info!("Key rotation task started");

            let mut attempt = 0u32;
            let mut wait = self.config.initial_delay;

            while sleep_or_shutdown(wait, &mut shutdown_rx).await {
                wait = match self.run_batch(&shutdown_rx).await {
                    BatchOutcome::Success { .. } => {
                        attempt = 0;
                        self.config.interval
                    }
                    BatchOutcome::Retry { .. } | BatchOutcome::Skipped => {
                        let backoff = self.config.backoff(attempt);
                        attempt = attempt.saturating_add(1);
                        debug!("Retrying key rotation in {:?}", backoff);
                        backoff
                    }
                    BatchOutcome::Cancelled { .. } => break,
                };
            }

            info!("Key rotation task stopped");
        });

        RotationHandle { shutdown_tx, task }
    }
}

/// 等待指定时间，期间收到关闭信号时返回 false
async fn sleep_or_shutdown(duration: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }

    let changed = tokio::select! {
        _ = tokio::time::sleep(duration) => return true,
        changed = shutdown_rx.changed() => changed,
    };

    // 发送端被丢弃同样视为关闭
    changed.is_ok() && !*shutdown_rx.borrow()
}

/// 后台轮换任务的句柄
pub struct RotationHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RotationHandle {
    /// 发出关闭信号并等待任务结束
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!("Key rotation task ended abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RotationConfig::default();

        assert_eq!(config.interval, Duration::from_secs(604_800));
        assert_eq!(config.initial_delay, config.interval);
        assert_eq!(config.retry_backoff, Duration::from_secs(30));
        assert_eq!(config.max_retry_backoff, Duration::from_secs(18_000));
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let config = RotationConfig::default();

        assert_eq!(config.backoff(0), Duration::from_secs(30));
        assert_eq!(config.backoff(1), Duration::from_secs(60));
        assert_eq!(config.backoff(3), Duration::from_secs(240));
        assert_eq!(config.backoff(20), config.max_retry_backoff);
        assert_eq!(config.backoff(u32::MAX), config.max_retry_backoff);
    }
}
