use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use super::coordination::{ExpirationConfig, LockConfig, QueueConfig};
use crate::logging::LogConfig;
use crate::retry::RetryConfig;

/// 环境变量前缀, 例如 `SCHEDULER_STORAGE__LOCK__LEASE_TTL_SECONDS=60`
pub const ENV_PREFIX: &str = "SCHEDULER_STORAGE";

/// Storage layer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub retry: RetryConfig,
    pub lock: LockConfig,
    pub queue: QueueConfig,
    pub expiration: ExpirationConfig,
    pub logging: LogConfig,
}

impl StorageConfig {
    /// Load configuration from an optional TOML file and environment variables
    ///
    /// Load order:
    /// 1. Defaults
    /// 2. Config file (TOML format), if a path is given
    /// 3. Environment variable overrides (prefix: SCHEDULER_STORAGE, separator: `__`)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: StorageConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("解析配置失败")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.retry.validate().context("重试配置无效")?;
        self.lock.validate().context("锁配置无效")?;
        self.queue.validate().context("队列配置无效")?;
        self.expiration.validate().context("过期清理配置无效")?;
        Ok(())
    }
}
