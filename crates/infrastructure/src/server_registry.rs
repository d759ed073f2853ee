use std::sync::Arc;

use chrono::Duration;
use metrics::counter;
use scheduler_core::clock::Clock;
use scheduler_core::retry::RetryingExecutor;
use scheduler_domain::entities::{DocumentType, Server};
use scheduler_domain::repositories::{DocumentQuery, DocumentStore};
use scheduler_domain::scripts::{DeleteDocumentsArgs, HeartbeatServerArgs};
use scheduler_domain::value_objects::ServerContext;
use scheduler_errors::{SchedulerError, SchedulerResult};
use tracing::{debug, info, warn};

use crate::script_invoker::ScriptInvoker;

/// 服务器注册表
///
/// 负责服务器的上线, 心跳, 下线以及超时清理。崩溃的服务器在心跳超时后被清理,
/// 其持有的租约和队列认领随之可以被其他服务器恢复。
#[derive(Clone)]
pub struct ServerRegistry {
    store: Arc<dyn DocumentStore>,
    executor: RetryingExecutor,
    invoker: ScriptInvoker,
    clock: Arc<dyn Clock>,
}

impl ServerRegistry {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        executor: RetryingExecutor,
        invoker: ScriptInvoker,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            executor,
            invoker,
            clock,
        }
    }

    pub async fn announce(&self, server_id: &str, context: &ServerContext) -> SchedulerResult<()> {
        validate_server_id(server_id)?;

        let now = self.clock.now();
        let server = Server {
            id: Server::document_id(server_id),
            server_id: server_id.to_string(),
            workers: context.workers,
            queues: context.queues.clone(),
            created_on: now,
            last_heartbeat: now.timestamp(),
        };
        self.executor
            .execute("server.announce", || self.store.upsert(server.clone().into()))
            .await?;

        counter!("servers_announced_total").increment(1);
        info!(
            server_id,
            workers = context.workers,
            queues = ?context.queues,
            "server announced"
        );
        Ok(())
    }

    /// 更新心跳; 服务器已被移除时只记录日志
    pub async fn heartbeat(&self, server_id: &str) -> SchedulerResult<()> {
        validate_server_id(server_id)?;

        let outcome = self
            .invoker
            .invoke(HeartbeatServerArgs {
                server_document_id: Server::document_id(server_id),
                heartbeat: self.clock.now_epoch(),
            })
            .await?;

        if outcome.affected == 0 {
            warn!(server_id, "heartbeat for unknown server ignored");
        } else {
            debug!(server_id, "server heartbeat");
        }
        Ok(())
    }

    pub async fn remove_server(&self, server_id: &str) -> SchedulerResult<()> {
        validate_server_id(server_id)?;

        let id = Server::document_id(server_id);
        let removed = self
            .executor
            .execute("server.remove", || self.store.delete(DocumentType::Server, &id, None))
            .await?;
        if removed {
            info!(server_id, "server removed");
        } else {
            debug!(server_id, "server already removed");
        }
        Ok(())
    }

    /// 删除所有最近心跳不晚于 `now - timeout` 的服务器, 返回删除数量
    pub async fn remove_timed_out_servers(&self, timeout: Duration) -> SchedulerResult<u64> {
        if timeout < Duration::zero() {
            return Err(SchedulerError::invalid_argument(format!(
                "服务器超时时间不能为负数: {}s",
                timeout.num_seconds()
            )));
        }

        let cutoff = self.clock.now_epoch() - timeout.num_seconds();
        let outcome = self
            .invoker
            .invoke(DeleteDocumentsArgs {
                query: DocumentQuery::of(DocumentType::Server).heartbeat_at_or_before(cutoff),
            })
            .await?;

        if outcome.affected > 0 {
            counter!("servers_reaped_total").increment(outcome.affected);
            info!(removed = outcome.affected, cutoff, "timed out servers removed");
        }
        Ok(outcome.affected)
    }

    pub async fn servers(&self) -> SchedulerResult<Vec<Server>> {
        let query = DocumentQuery::of(DocumentType::Server);
        let mut servers: Vec<Server> = self
            .executor
            .execute("server.query", || self.store.query(&query))
            .await?
            .into_iter()
            .filter_map(|stored| Server::try_from(stored.document).ok())
            .collect();
        servers.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        Ok(servers)
    }
}

fn validate_server_id(server_id: &str) -> SchedulerResult<()> {
    if server_id.trim().is_empty() {
        return Err(SchedulerError::invalid_argument("服务器ID不能为空"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryDocumentStore;
    use scheduler_core::clock::ManualClock;
    use scheduler_core::retry::RetryConfig;

    fn registry(store: Arc<InMemoryDocumentStore>, clock: ManualClock) -> ServerRegistry {
        let executor = RetryingExecutor::new(RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            backoff_multiplier: 2.0,
        });
        let invoker = ScriptInvoker::new(store.clone(), executor.clone());
        ServerRegistry::new(store, executor, invoker, Arc::new(clock))
    }

    fn context() -> ServerContext {
        ServerContext {
            workers: 4,
            queues: vec!["default".to_string()],
        }
    }

    #[tokio::test]
    async fn test_announce_is_idempotent() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let servers = registry(store.clone(), ManualClock::starting_now());

        servers.announce("s1", &context()).await.unwrap();
        servers.announce("s1", &context()).await.unwrap();

        let listed = servers.servers().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].workers, 4);
        assert_eq!(listed[0].queues, vec!["default".to_string()]);
    }

    #[tokio::test]
    async fn test_heartbeat_updates_last_heartbeat() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let clock = ManualClock::starting_now();
        let servers = registry(store, clock.clone());
        servers.announce("s1", &context()).await.unwrap();
        let announced = servers.servers().await.unwrap()[0].last_heartbeat;

        clock.advance(Duration::seconds(15));
        servers.heartbeat("s1").await.unwrap();
        assert_eq!(servers.servers().await.unwrap()[0].last_heartbeat, announced + 15);
    }

    #[tokio::test]
    async fn test_missing_server_is_not_an_error() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let servers = registry(store, ManualClock::starting_now());

        servers.heartbeat("ghost").await.unwrap();
        servers.remove_server("ghost").await.unwrap();
        assert!(servers.servers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reap_removes_only_stale_servers() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let clock = ManualClock::starting_now();
        let servers = registry(store, clock.clone());

        servers.announce("stale", &context()).await.unwrap();
        clock.advance(Duration::seconds(20));
        servers.announce("fresh", &context()).await.unwrap();
        clock.advance(Duration::seconds(10));

        // stale 的心跳恰好等于截止时间
        assert_eq!(servers.remove_timed_out_servers(Duration::seconds(30)).await.unwrap(), 1);
        let remaining = servers.servers().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].server_id, "fresh");
    }

    #[tokio::test]
    async fn test_negative_timeout_is_rejected() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let servers = registry(store, ManualClock::starting_now());
        assert!(matches!(
            servers.remove_timed_out_servers(Duration::seconds(-1)).await,
            Err(SchedulerError::InvalidArgument(_))
        ));
    }
}
