use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use rand::Rng;
use scheduler_core::clock::Clock;
use scheduler_core::config::LockConfig;
use scheduler_core::retry::RetryingExecutor;
use scheduler_domain::entities::{new_document_id, DocumentType, Lock, StoredDocument};
use scheduler_domain::repositories::DocumentStore;
use scheduler_errors::{SchedulerError, SchedulerResult, StoreError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 分布式锁管理器
///
/// 锁以租约文档的形式保存在存储中: 获取是条件创建, 租约过期后可以被条件替换接管,
/// 释放是按 etag 条件删除。持有者崩溃时租约到期自动失效。
#[derive(Clone)]
pub struct DistributedLockManager {
    store: Arc<dyn DocumentStore>,
    executor: RetryingExecutor,
    clock: Arc<dyn Clock>,
    config: LockConfig,
}

enum AttemptOutcome {
    Acquired(StoredDocument),
    Held { owner: String, expire_on: i64 },
    /// 读写之间租约发生了变化, 立即重试
    Contended,
}

impl DistributedLockManager {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        executor: RetryingExecutor,
        clock: Arc<dyn Clock>,
        config: LockConfig,
    ) -> Self {
        Self {
            store,
            executor,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// 在 `timeout` 内获取资源锁, 超时返回 `DistributedLockTimeout`
    pub async fn acquire(&self, resource: &str, timeout: Duration) -> SchedulerResult<DistributedLockHandle> {
        validate_resource(resource)?;

        let start = Instant::now();
        let deadline = start + timeout;
        let owner = new_document_id();
        let mut backoff_ms = self.config.initial_backoff_ms;

        loop {
            match self.attempt(resource, &owner).await? {
                AttemptOutcome::Acquired(stored) => {
                    histogram!("lock_acquire_duration_ms")
                        .record(start.elapsed().as_secs_f64() * 1000.0);
                    return Ok(self.handle(resource, owner, stored));
                }
                AttemptOutcome::Contended => continue,
                AttemptOutcome::Held {
                    owner: holder,
                    expire_on,
                } => {
                    let now = Instant::now();
                    if now >= deadline {
                        counter!("lock_timeouts_total").increment(1);
                        warn!(resource, holder = %holder, ?timeout, "distributed lock acquisition timed out");
                        return Err(SchedulerError::lock_timeout(resource));
                    }

                    // 在 rng 离开作用域之后再 await
                    let jitter = rand::rng().random_range(0..backoff_ms / 2 + 1);
                    let sleep = Duration::from_millis(backoff_ms + jitter).min(deadline - now);
                    debug!(
                        resource,
                        holder = %holder,
                        expire_on,
                        backoff_ms = sleep.as_millis() as u64,
                        "lock held, backing off"
                    );
                    tokio::time::sleep(sleep).await;
                    backoff_ms = (backoff_ms * 2).min(self.config.max_backoff_ms);
                }
            }
        }
    }

    /// 尝试一次获取, 不等待
    pub async fn try_acquire(&self, resource: &str) -> SchedulerResult<Option<DistributedLockHandle>> {
        validate_resource(resource)?;
        let owner = new_document_id();
        loop {
            match self.attempt(resource, &owner).await? {
                AttemptOutcome::Acquired(stored) => return Ok(Some(self.handle(resource, owner, stored))),
                AttemptOutcome::Held { .. } => return Ok(None),
                AttemptOutcome::Contended => continue,
            }
        }
    }

    fn lease(&self, resource: &str, owner: &str) -> Lock {
        let now = self.clock.now();
        Lock {
            id: Lock::document_id(resource),
            resource: resource.to_string(),
            owner: owner.to_string(),
            created_on: now,
            expire_on: now.timestamp() + self.config.lease_ttl().num_seconds(),
        }
    }

    async fn attempt(&self, resource: &str, owner: &str) -> SchedulerResult<AttemptOutcome> {
        let lease = self.lease(resource, owner);
        let created = self
            .executor
            .execute("lock.create", || self.store.create(lease.clone().into()))
            .await;

        match created {
            Ok(stored) => {
                debug!(resource, owner, expire_on = lease.expire_on, "lock acquired");
                return Ok(AttemptOutcome::Acquired(stored));
            }
            Err(SchedulerError::Store(StoreError::Conflict { .. })) => {}
            Err(e) => return Err(e),
        }

        let current = self
            .executor
            .execute("lock.read", || self.store.read(DocumentType::Lock, &lease.id))
            .await?;
        let Some(current) = current else {
            return Ok(AttemptOutcome::Contended);
        };
        let existing: Lock = current
            .document
            .clone()
            .try_into()
            .map_err(|_| SchedulerError::Internal(format!("锁文档类型错误: {resource}")))?;

        // 重试过的创建请求可能已经成功
        if existing.owner == owner {
            return Ok(AttemptOutcome::Acquired(current));
        }

        if !existing.is_expired(self.clock.now_epoch()) {
            return Ok(AttemptOutcome::Held {
                owner: existing.owner,
                expire_on: existing.expire_on,
            });
        }

        let replaced = self
            .executor
            .execute("lock.takeover", || {
                self.store.replace(lease.clone().into(), current.etag)
            })
            .await;
        match replaced {
            Ok(stored) => {
                info!(
                    resource,
                    owner,
                    previous_owner = %existing.owner,
                    "took over expired lock"
                );
                Ok(AttemptOutcome::Acquired(stored))
            }
            Err(SchedulerError::Store(
                StoreError::PreconditionFailed { .. } | StoreError::NotFound { .. },
            )) => Ok(AttemptOutcome::Contended),
            Err(e) => Err(e),
        }
    }

    fn handle(&self, resource: &str, owner: String, stored: StoredDocument) -> DistributedLockHandle {
        let expire_on = stored.document.expire_on().unwrap_or_default();
        DistributedLockHandle {
            store: self.store.clone(),
            executor: self.executor.clone(),
            clock: self.clock.clone(),
            lease_ttl_seconds: self.config.lease_ttl().num_seconds(),
            resource: resource.to_string(),
            owner,
            etag: stored.etag,
            expire_on,
            released: false,
        }
    }
}

fn validate_resource(resource: &str) -> SchedulerResult<()> {
    if resource.trim().is_empty() {
        return Err(SchedulerError::invalid_argument("锁资源名不能为空"));
    }
    Ok(())
}

/// 已持有的锁
///
/// 显式调用 [`release`](Self::release) 释放; 未释放就被丢弃时会尽力在后台删除租约,
/// 失败也无妨, 租约会自然过期。
pub struct DistributedLockHandle {
    store: Arc<dyn DocumentStore>,
    executor: RetryingExecutor,
    clock: Arc<dyn Clock>,
    lease_ttl_seconds: i64,
    resource: String,
    owner: String,
    etag: u64,
    expire_on: i64,
    released: bool,
}

impl std::fmt::Debug for DistributedLockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLockHandle")
            .field("resource", &self.resource)
            .field("owner", &self.owner)
            .field("etag", &self.etag)
            .field("expire_on", &self.expire_on)
            .finish()
    }
}

impl DistributedLockHandle {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// 租约到期时间(Unix 秒)
    pub fn expire_on(&self) -> i64 {
        self.expire_on
    }

    /// 延长租约, 租约已过期或已被他人接管时返回 `LockLost`
    pub async fn renew(&mut self) -> SchedulerResult<()> {
        let id = Lock::document_id(&self.resource);
        let current = self
            .executor
            .execute("lock.read", || self.store.read(DocumentType::Lock, &id))
            .await?;

        let now = self.clock.now();
        let mut lease: Lock = match current.as_ref().map(|c| c.document.clone().try_into()) {
            Some(Ok(lease)) => lease,
            _ => return Err(self.lost("lease missing")),
        };
        let etag = current.map(|c| c.etag).unwrap_or_default();
        if lease.owner != self.owner || etag != self.etag {
            return Err(self.lost("lease taken by another owner"));
        }
        if lease.is_expired(now.timestamp()) {
            return Err(self.lost("lease expired"));
        }

        lease.expire_on = now.timestamp() + self.lease_ttl_seconds;
        let renewed = self
            .executor
            .execute("lock.renew", || self.store.replace(lease.clone().into(), etag))
            .await;
        match renewed {
            Ok(stored) => {
                self.etag = stored.etag;
                self.expire_on = lease.expire_on;
                debug!(resource = %self.resource, expire_on = self.expire_on, "lock renewed");
                Ok(())
            }
            Err(SchedulerError::Store(
                StoreError::PreconditionFailed { .. } | StoreError::NotFound { .. },
            )) => Err(self.lost("lease changed during renewal")),
            Err(e) => Err(e),
        }
    }

    /// 释放锁; 租约已消失或已被他人接管时不视为错误
    pub async fn release(mut self) -> SchedulerResult<()> {
        self.released = true;
        let id = Lock::document_id(&self.resource);
        let result = self
            .executor
            .execute("lock.release", || {
                self.store.delete(DocumentType::Lock, &id, Some(self.etag))
            })
            .await;

        match result {
            Ok(true) => {
                debug!(resource = %self.resource, "lock released");
                Ok(())
            }
            Ok(false) => {
                debug!(resource = %self.resource, "lock already gone on release");
                Ok(())
            }
            Err(SchedulerError::Store(StoreError::PreconditionFailed { .. })) => {
                warn!(resource = %self.resource, "lock release skipped: lease taken by another owner");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn lost(&self, reason: &str) -> SchedulerError {
        counter!("lock_lost_total").increment(1);
        warn!(resource = %self.resource, owner = %self.owner, reason, "distributed lock lost");
        SchedulerError::lock_lost(&self.resource)
    }
}

impl Drop for DistributedLockHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let store = self.store.clone();
        let resource = self.resource.clone();
        let etag = self.etag;
        runtime.spawn(async move {
            let id = Lock::document_id(&resource);
            match store.delete(DocumentType::Lock, &id, Some(etag)).await {
                Ok(_) => debug!(resource = %resource, "lock released on drop"),
                Err(e) => debug!(resource = %resource, error = %e, "lock release on drop failed, lease will expire"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryDocumentStore;
    use chrono::Duration as ChronoDuration;
    use scheduler_core::clock::ManualClock;
    use scheduler_core::retry::RetryConfig;

    fn manager(store: Arc<InMemoryDocumentStore>, clock: ManualClock) -> DistributedLockManager {
        DistributedLockManager::new(
            store,
            RetryingExecutor::new(RetryConfig {
                max_attempts: 3,
                initial_delay_ms: 1,
                max_delay_ms: 2,
                backoff_multiplier: 2.0,
            }),
            Arc::new(clock),
            LockConfig {
                lease_ttl_seconds: 30,
                initial_backoff_ms: 5,
                max_backoff_ms: 20,
                default_acquire_timeout_seconds: 1,
            },
        )
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let locks = manager(store.clone(), ManualClock::starting_now());

        let handle = locks.acquire("recurring-job:1", Duration::from_millis(100)).await.unwrap();
        assert_eq!(handle.resource(), "recurring-job:1");
        assert_eq!(store.document_count(DocumentType::Lock).await, 1);

        handle.release().await.unwrap();
        assert_eq!(store.document_count(DocumentType::Lock).await, 0);
    }

    #[tokio::test]
    async fn test_second_acquire_times_out() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let locks = manager(store, ManualClock::starting_now());

        let _held = locks.acquire("r", Duration::from_millis(50)).await.unwrap();
        let result = locks.acquire("r", Duration::from_millis(50)).await;
        assert!(matches!(
            result,
            Err(SchedulerError::DistributedLockTimeout { resource }) if resource == "r"
        ));
        assert!(locks.try_acquire("r").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let clock = ManualClock::starting_now();
        let locks = manager(store, clock.clone());

        let mut stale = locks.acquire("r", Duration::from_millis(50)).await.unwrap();
        clock.advance(ChronoDuration::seconds(31));

        let fresh = locks.acquire("r", Duration::from_millis(50)).await.unwrap();
        assert_ne!(fresh.owner(), stale.owner());

        assert!(matches!(stale.renew().await, Err(SchedulerError::LockLost { .. })));
        // 旧持有者的释放不能删除新租约
        stale.release().await.unwrap();
        assert!(locks.try_acquire("r").await.unwrap().is_none());
        fresh.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_renew_extends_expiry() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let clock = ManualClock::starting_now();
        let locks = manager(store, clock.clone());

        let mut handle = locks.acquire("r", Duration::from_millis(50)).await.unwrap();
        let first_expiry = handle.expire_on();

        clock.advance(ChronoDuration::seconds(20));
        handle.renew().await.unwrap();
        assert_eq!(handle.expire_on(), first_expiry + 20);

        // 原本的到期时间已过, 续约后仍然持有
        clock.advance(ChronoDuration::seconds(20));
        assert!(locks.try_acquire("r").await.unwrap().is_none());
        handle.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_renew_after_expiry_is_lock_lost() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let clock = ManualClock::starting_now();
        let locks = manager(store, clock.clone());

        let mut handle = locks.acquire("r", Duration::from_millis(50)).await.unwrap();
        clock.advance(ChronoDuration::seconds(30));
        assert!(matches!(handle.renew().await, Err(SchedulerError::LockLost { .. })));
    }

    #[tokio::test]
    async fn test_empty_resource_is_rejected() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let locks = manager(store, ManualClock::starting_now());
        assert!(matches!(
            locks.acquire(" ", Duration::from_millis(10)).await,
            Err(SchedulerError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_dropped_handle_releases_in_background() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let locks = manager(store.clone(), ManualClock::starting_now());

        {
            let _handle = locks.acquire("r", Duration::from_millis(50)).await.unwrap();
        }
        let reacquired = locks.acquire("r", Duration::from_secs(1)).await.unwrap();
        reacquired.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_create_failure_is_retried() {
        let store = Arc::new(InMemoryDocumentStore::new());
        store.inject_fault(StoreError::Throttled { retry_after_ms: 1 });
        let locks = manager(store.clone(), ManualClock::starting_now());

        let handle = locks.acquire("r", Duration::from_millis(50)).await.unwrap();
        assert_eq!(store.pending_faults(), 0);
        handle.release().await.unwrap();
    }
}
