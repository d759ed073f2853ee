use std::sync::Arc;

use scheduler_core::clock::{Clock, SystemClock};
use scheduler_core::config::StorageConfig;
use scheduler_core::retry::RetryingExecutor;
use scheduler_domain::repositories::DocumentStore;
use scheduler_errors::{SchedulerError, SchedulerResult};
use tracing::info;

use crate::connection::StorageConnection;
use crate::distributed_lock::DistributedLockManager;
use crate::expiration::ExpirationManager;
use crate::hash_merge::HashRangeMerger;
use crate::projections::ReadProjections;
use crate::queue::{DocumentJobQueue, DocumentQueueProvider, QueueMonitoring, QueueProvider, QueueProviderRegistry};
use crate::script_invoker::ScriptInvoker;
use crate::server_registry::ServerRegistry;
use crate::transaction::WriteTransaction;

/// 文档存储入口
///
/// 持有显式传入的存储句柄, 配置, 时钟和队列提供者映射, 由宿主进程创建并管理生命周期。
/// 克隆开销很小, 所有克隆共享同一组组件。
#[derive(Clone)]
pub struct DocumentStorage {
    inner: Arc<StorageInner>,
}

struct StorageInner {
    store: Arc<dyn DocumentStore>,
    config: StorageConfig,
    clock: Arc<dyn Clock>,
    executor: RetryingExecutor,
    invoker: ScriptInvoker,
    locks: DistributedLockManager,
    hash_merger: HashRangeMerger,
    servers: ServerRegistry,
    projections: ReadProjections,
    queues: QueueProviderRegistry,
}

impl DocumentStorage {
    pub fn new(store: Arc<dyn DocumentStore>, config: StorageConfig) -> SchedulerResult<Self> {
        Self::builder(store, config).build()
    }

    pub fn builder(store: Arc<dyn DocumentStore>, config: StorageConfig) -> DocumentStorageBuilder {
        DocumentStorageBuilder {
            store,
            config,
            clock: Arc::new(SystemClock),
            providers: Vec::new(),
        }
    }

    pub fn connection(&self) -> StorageConnection {
        StorageConnection::new(self.clone())
    }

    pub fn write_transaction(&self) -> WriteTransaction {
        WriteTransaction::new(self.clone())
    }

    pub fn expiration_manager(&self) -> ExpirationManager {
        ExpirationManager::new(
            self.inner.invoker.clone(),
            self.inner.clock.clone(),
            self.inner.config.expiration.clone(),
        )
    }

    pub fn config(&self) -> &StorageConfig {
        &self.inner.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.inner.store
    }

    pub fn queue_registry(&self) -> &QueueProviderRegistry {
        &self.inner.queues
    }

    /// 负责该队列的提供者的监控接口
    pub fn monitoring_for(&self, queue: &str) -> Arc<dyn QueueMonitoring> {
        self.inner.queues.provider_for(queue).monitoring()
    }

    pub(crate) fn executor(&self) -> &RetryingExecutor {
        &self.inner.executor
    }

    pub(crate) fn invoker(&self) -> &ScriptInvoker {
        &self.inner.invoker
    }

    pub(crate) fn locks(&self) -> &DistributedLockManager {
        &self.inner.locks
    }

    pub(crate) fn hash_merger(&self) -> &HashRangeMerger {
        &self.inner.hash_merger
    }

    pub(crate) fn servers(&self) -> &ServerRegistry {
        &self.inner.servers
    }

    pub(crate) fn projections(&self) -> &ReadProjections {
        &self.inner.projections
    }
}

pub struct DocumentStorageBuilder {
    store: Arc<dyn DocumentStore>,
    config: StorageConfig,
    clock: Arc<dyn Clock>,
    providers: Vec<(Arc<dyn QueueProvider>, Vec<String>)>,
}

impl DocumentStorageBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// 让额外的队列提供者负责给定的队列, 其余队列使用文档队列
    pub fn queue_provider<S: Into<String>>(
        mut self,
        provider: Arc<dyn QueueProvider>,
        queues: impl IntoIterator<Item = S>,
    ) -> Self {
        self.providers
            .push((provider, queues.into_iter().map(Into::into).collect()));
        self
    }

    pub fn build(self) -> SchedulerResult<DocumentStorage> {
        self.config
            .validate()
            .map_err(|e| SchedulerError::config_error(format!("{e:#}")))?;

        let Self {
            store,
            config,
            clock,
            providers,
        } = self;

        let executor = RetryingExecutor::new(config.retry.clone());
        let invoker = ScriptInvoker::new(store.clone(), executor.clone());
        let locks = DistributedLockManager::new(
            store.clone(),
            executor.clone(),
            clock.clone(),
            config.lock.clone(),
        );
        let hash_merger = HashRangeMerger::new(
            store.clone(),
            executor.clone(),
            invoker.clone(),
            locks.clone(),
            clock.clone(),
        );
        let servers = ServerRegistry::new(store.clone(), executor.clone(), invoker.clone(), clock.clone());
        let projections = ReadProjections::new(store.clone(), executor.clone(), clock.clone());

        let document_queue = Arc::new(DocumentJobQueue::new(
            store.clone(),
            executor.clone(),
            clock.clone(),
            config.queue.clone(),
        ));
        let mut queues = QueueProviderRegistry::new(Arc::new(DocumentQueueProvider::new(document_queue)));
        for (provider, names) in providers {
            queues.register(provider, &names)?;
        }

        info!(
            max_attempts = config.retry.max_attempts,
            lease_ttl_seconds = config.lock.lease_ttl_seconds,
            invisibility_timeout_seconds = config.queue.invisibility_timeout_seconds,
            providers = queues.providers().len(),
            "document storage initialized"
        );

        Ok(DocumentStorage {
            inner: Arc::new(StorageInner {
                store,
                config,
                clock,
                executor,
                invoker,
                locks,
                hash_merger,
                servers,
                projections,
                queues,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryDocumentStore;

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = StorageConfig::default();
        config.retry.max_attempts = 0;
        let result = DocumentStorage::new(Arc::new(InMemoryDocumentStore::new()), config);
        assert!(matches!(result, Err(SchedulerError::Configuration(_))));
    }

    #[test]
    fn test_default_queue_provider() {
        let storage = DocumentStorage::new(Arc::new(InMemoryDocumentStore::new()), StorageConfig::default()).unwrap();
        let provider = storage.queue_registry().resolve_single(&["default"]).unwrap();
        assert_eq!(provider.name(), DocumentQueueProvider::NAME);
    }

    #[test]
    fn test_extra_provider_takes_its_queues() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
        let config = StorageConfig::default();
        let extra = Arc::new(DocumentQueueProvider::new(Arc::new(DocumentJobQueue::new(
            store.clone(),
            RetryingExecutor::new(config.retry.clone()),
            Arc::new(SystemClock),
            config.queue.clone(),
        ))));

        let storage = DocumentStorage::builder(store, config)
            .queue_provider(extra, ["critical"])
            .build()
            .unwrap();
        assert_eq!(storage.queue_registry().providers().len(), 2);
        assert!(matches!(
            storage.queue_registry().resolve_single(&["default", "critical"]),
            Err(SchedulerError::AmbiguousQueueProvider { .. })
        ));
    }
}
