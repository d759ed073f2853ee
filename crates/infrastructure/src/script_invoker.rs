use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use scheduler_core::retry::RetryingExecutor;
use scheduler_domain::repositories::DocumentStore;
use scheduler_domain::scripts::{ScriptArgs, ScriptCall, ScriptOutcome};
use scheduler_errors::SchedulerResult;
use tracing::{debug, warn};

/// 存储端原子脚本调用器
///
/// 所有需要"读-改-写"且不能产生竞争的操作都通过这里执行,
/// 脚本调用本身经过重试执行器, 只有瞬时失败会被重试。
#[derive(Clone)]
pub struct ScriptInvoker {
    store: Arc<dyn DocumentStore>,
    executor: RetryingExecutor,
}

impl ScriptInvoker {
    pub fn new(store: Arc<dyn DocumentStore>, executor: RetryingExecutor) -> Self {
        Self { store, executor }
    }

    pub async fn invoke<A>(&self, args: A) -> SchedulerResult<ScriptOutcome>
    where
        A: ScriptArgs + Into<ScriptCall>,
    {
        let call: ScriptCall = args.into();
        self.invoke_call(&call).await
    }

    pub async fn invoke_call(&self, call: &ScriptCall) -> SchedulerResult<ScriptOutcome> {
        let script = call.name();
        let start = Instant::now();

        let result = self
            .executor
            .execute(script, || self.store.execute_script(call))
            .await;

        histogram!("storage_script_duration_ms", "script" => script)
            .record(start.elapsed().as_secs_f64() * 1000.0);

        match &result {
            Ok(outcome) => debug!(
                script,
                version = call.version(),
                partition = %call.partition(),
                affected = outcome.affected,
                "script committed"
            ),
            Err(e) => warn!(script, partition = %call.partition(), error = %e, "script failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mockall::mock;
    use mockall::predicate::*;
    use scheduler_core::retry::RetryConfig;
    use scheduler_domain::entities::{Document, DocumentType, StoredDocument};
    use scheduler_domain::repositories::DocumentQuery;
    use scheduler_domain::scripts::HeartbeatServerArgs;
    use scheduler_errors::{SchedulerError, StoreError, StoreResult};

    mock! {
        pub Store {}

        #[async_trait]
        impl DocumentStore for Store {
            async fn read(&self, doc_type: DocumentType, id: &str) -> StoreResult<Option<StoredDocument>>;
            async fn create(&self, document: Document) -> StoreResult<StoredDocument>;
            async fn upsert(&self, document: Document) -> StoreResult<StoredDocument>;
            async fn replace(&self, document: Document, etag: u64) -> StoreResult<StoredDocument>;
            async fn delete(&self, doc_type: DocumentType, id: &str, etag: Option<u64>) -> StoreResult<bool>;
            async fn query(&self, query: &DocumentQuery) -> StoreResult<Vec<StoredDocument>>;
            async fn execute_script(&self, call: &ScriptCall) -> StoreResult<ScriptOutcome>;
        }
    }

    fn executor() -> RetryingExecutor {
        RetryingExecutor::new(RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            backoff_multiplier: 2.0,
        })
    }

    fn heartbeat() -> HeartbeatServerArgs {
        HeartbeatServerArgs {
            server_document_id: "server-doc".to_string(),
            heartbeat: 100,
        }
    }

    #[tokio::test]
    async fn test_invoke_passes_typed_call() {
        let mut store = MockStore::new();
        let expected = ScriptCall::from(heartbeat());
        store
            .expect_execute_script()
            .with(eq(expected))
            .times(1)
            .returning(|_| Ok(ScriptOutcome::affected(1)));

        let invoker = ScriptInvoker::new(Arc::new(store), executor());
        let outcome = invoker.invoke(heartbeat()).await.unwrap();
        assert_eq!(outcome.affected, 1);
    }

    #[tokio::test]
    async fn test_transient_script_failure_is_retried() {
        let mut store = MockStore::new();
        let mut seq = mockall::Sequence::new();
        store
            .expect_execute_script()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Err(StoreError::ScriptFailed {
                    script: "heartbeatServer".to_string(),
                    reason: "write conflict".to_string(),
                    transient: true,
                })
            });
        store
            .expect_execute_script()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ScriptOutcome::affected(0)));

        let invoker = ScriptInvoker::new(Arc::new(store), executor());
        let outcome = invoker.invoke(heartbeat()).await.unwrap();
        assert_eq!(outcome.affected, 0);
    }

    #[tokio::test]
    async fn test_validation_failure_is_not_retried() {
        let mut store = MockStore::new();
        store.expect_execute_script().times(1).returning(|_| {
            Err(StoreError::ScriptFailed {
                script: "heartbeatServer".to_string(),
                reason: "validation".to_string(),
                transient: false,
            })
        });

        let invoker = ScriptInvoker::new(Arc::new(store), executor());
        let result = invoker.invoke(heartbeat()).await;
        assert!(matches!(
            result,
            Err(SchedulerError::Store(StoreError::ScriptFailed { transient: false, .. }))
        ));
    }
}
