use std::future::Future;
use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use scheduler_errors::{SchedulerError, SchedulerResult, StoreResult};

/// 重试策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 最大尝试次数(包含第一次)
    pub max_attempts: u32,
    /// 首次退避时间(毫秒)
    pub initial_delay_ms: u64,
    /// 退避时间上限(毫秒)
    pub max_delay_ms: u64,
    /// 指数退避倍数
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// 计算下一次退避时间
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next = Duration::from_millis((current.as_millis() as f64 * self.backoff_multiplier) as u64);
        next.min(self.max_delay())
    }

    /// 在最坏情况下调用方可能被阻塞的累计退避时间
    pub fn total_backoff_budget(&self) -> Duration {
        let mut delay = self.initial_delay();
        let mut total = Duration::ZERO;
        for _ in 1..self.max_attempts.max(1) {
            total += delay;
            delay = self.next_delay(delay);
        }
        total
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow::anyhow!("最大重试次数必须大于0"));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(anyhow::anyhow!("退避倍数不能小于1"));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(anyhow::anyhow!("首次退避时间不能大于退避上限"));
        }
        Ok(())
    }
}

/// 带重试的存储操作执行器
///
/// 所有存储往返都经过这里。瞬时错误(限流、超时、服务不可用)按指数退避重试,
/// 非瞬时错误立即返回。被包装的操作必须可以安全重复执行。
#[derive(Debug, Clone, Default)]
pub struct RetryingExecutor {
    config: RetryConfig,
}

impl RetryingExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub async fn execute<F, Fut, T>(&self, operation: &str, mut f: F) -> SchedulerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut delay = self.config.initial_delay();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match f().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "storage operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() => {
                    if attempt >= max_attempts {
                        counter!("storage_unavailable_total", "operation" => operation.to_string())
                            .increment(1);
                        error!(operation, attempts = attempt, error = %e, "retry budget exhausted");
                        return Err(SchedulerError::StorageUnavailable {
                            operation: operation.to_string(),
                            attempts: attempt,
                            message: e.to_string(),
                        });
                    }

                    let wait = match e.retry_after_ms() {
                        Some(hint) => Duration::from_millis(hint).max(delay),
                        None => delay,
                    };
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = wait.as_millis() as u64,
                        error = %e,
                        "transient storage error, backing off"
                    );
                    counter!("storage_retries_total", "operation" => operation.to_string()).increment(1);

                    tokio::time::sleep(wait).await;
                    delay = self.config.next_delay(delay);
                }
                Err(e) => return Err(SchedulerError::Store(e)),
            }
        }
    }
}
