use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 分布式锁配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// 租约有效期(秒), 持有者崩溃后租约在此时间后自动失效
    pub lease_ttl_seconds: u64,
    /// 竞争时的首次等待(毫秒)
    pub initial_backoff_ms: u64,
    /// 竞争时的最大等待(毫秒)
    pub max_backoff_ms: u64,
    /// 哈希合并等内部临界区的默认获取超时(秒)
    pub default_acquire_timeout_seconds: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_ttl_seconds: 30,
            initial_backoff_ms: 10,
            max_backoff_ms: 1_000,
            default_acquire_timeout_seconds: 60,
        }
    }
}

impl LockConfig {
    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_ttl_seconds as i64)
    }

    pub fn default_acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.default_acquire_timeout_seconds)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.lease_ttl_seconds == 0 {
            return Err(anyhow::anyhow!("锁租约有效期必须大于0"));
        }
        if self.initial_backoff_ms == 0 {
            return Err(anyhow::anyhow!("锁竞争等待时间必须大于0"));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(anyhow::anyhow!("锁竞争首次等待不能大于最大等待"));
        }
        Ok(())
    }
}

/// 队列出队配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// 队列为空时的轮询间隔(毫秒)
    pub poll_interval_ms: u64,
    /// 已取出但未确认的任务在此时间(秒)后重新可见
    pub invisibility_timeout_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            invisibility_timeout_seconds: 1_800,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn invisibility_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.invisibility_timeout_seconds as i64)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("队列轮询间隔必须大于0"));
        }
        if self.invisibility_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("任务不可见超时必须大于0"));
        }
        Ok(())
    }
}

/// 过期数据清理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpirationConfig {
    pub enabled: bool,
    /// 清理间隔(秒)
    pub check_interval_seconds: u64,
}

impl Default for ExpirationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_seconds: 1_800,
        }
    }
}

impl ExpirationConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.enabled && self.check_interval_seconds == 0 {
            return Err(anyhow::anyhow!("过期清理间隔必须大于0"));
        }
        Ok(())
    }
}
