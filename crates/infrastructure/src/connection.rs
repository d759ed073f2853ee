use std::collections::HashMap;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use scheduler_domain::entities::{new_document_id, Job, Parameter, Server, State};
use scheduler_domain::scripts::SetJobParameterArgs;
use scheduler_domain::value_objects::{HashMergeOutcome, InvocationData, JobData, ServerContext, StateData};
use scheduler_errors::{SchedulerError, SchedulerResult};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::distributed_lock::DistributedLockHandle;
use crate::queue::FetchedJob;
use crate::storage::DocumentStorage;
use crate::transaction::WriteTransaction;

/// 存储连接
///
/// 任务服务器通过它读取任务数据, 出队, 加锁, 维护服务器注册以及做键值类读写。
/// 连接本身不持有可变状态, 可以在多个任务之间克隆共享。
#[derive(Clone)]
pub struct StorageConnection {
    storage: DocumentStorage,
}

impl StorageConnection {
    pub fn new(storage: DocumentStorage) -> Self {
        Self { storage }
    }

    pub fn create_write_transaction(&self) -> WriteTransaction {
        self.storage.write_transaction()
    }

    // ---- 任务 ----

    /// 创建一个在 `expire_in` 之后过期的任务, 返回任务ID
    pub async fn create_expired_job(
        &self,
        invocation: &InvocationData,
        arguments: &str,
        parameters: &[(String, Option<String>)],
        created_at: DateTime<Utc>,
        expire_in: Duration,
    ) -> SchedulerResult<String> {
        if expire_in < Duration::zero() {
            return Err(SchedulerError::invalid_argument("任务过期时间不能为负数"));
        }

        let mut job = Job {
            id: new_document_id(),
            invocation_data: invocation.serialize()?,
            arguments: arguments.to_string(),
            parameters: Vec::with_capacity(parameters.len()),
            state_id: None,
            state_name: None,
            created_on: created_at,
            expire_on: Some(created_at.timestamp() + expire_in.num_seconds()),
        };
        for (name, value) in parameters {
            job.set_parameter(name, value.clone());
        }

        let store = self.storage.store();
        self.storage
            .executor()
            .execute("job.create", || store.upsert(job.clone().into()))
            .await?;

        info!(job_id = %job.id, method = %invocation.method, "job created");
        Ok(job.id)
    }

    pub async fn job_data(&self, job_id: &str) -> SchedulerResult<Option<JobData>> {
        self.storage.projections().job_data(job_id).await
    }

    pub async fn state_data(&self, job_id: &str) -> SchedulerResult<Option<StateData>> {
        self.storage.projections().state_data(job_id).await
    }

    pub async fn state_history(&self, job_id: &str) -> SchedulerResult<Vec<State>> {
        self.storage.projections().state_history(job_id).await
    }

    /// 原子地设置任务参数; 任务不存在时只记录日志
    pub async fn set_job_parameter(&self, job_id: &str, name: &str, value: Option<&str>) -> SchedulerResult<()> {
        if name.trim().is_empty() {
            return Err(SchedulerError::invalid_argument("参数名不能为空"));
        }
        let outcome = self
            .storage
            .invoker()
            .invoke(SetJobParameterArgs {
                job_id: job_id.to_string(),
                parameter: Parameter {
                    name: name.to_string(),
                    value: value.map(str::to_string),
                },
            })
            .await?;
        if outcome.affected == 0 {
            warn!(job_id, parameter = name, "job not found, parameter ignored");
        } else {
            debug!(job_id, parameter = name, "job parameter set");
        }
        Ok(())
    }

    pub async fn job_parameter(&self, job_id: &str, name: &str) -> SchedulerResult<Option<String>> {
        self.storage.projections().job_parameter(job_id, name).await
    }

    // ---- 队列 ----

    /// 从唯一负责这些队列的提供者出队, 阻塞直到取到任务或被取消
    pub async fn fetch_next_job<S: AsRef<str>>(
        &self,
        queues: &[S],
        cancellation: &CancellationToken,
    ) -> SchedulerResult<Box<dyn FetchedJob>> {
        let provider = self.storage.queue_registry().resolve_single(queues)?;
        let names: Vec<String> = queues.iter().map(|q| q.as_ref().to_string()).collect();
        provider.job_queue().dequeue(&names, cancellation).await
    }

    // ---- 分布式锁 ----

    pub async fn acquire_distributed_lock(
        &self,
        resource: &str,
        timeout: StdDuration,
    ) -> SchedulerResult<DistributedLockHandle> {
        self.storage.locks().acquire(resource, timeout).await
    }

    // ---- 服务器 ----

    pub async fn announce_server(&self, server_id: &str, context: &ServerContext) -> SchedulerResult<()> {
        self.storage.servers().announce(server_id, context).await
    }

    pub async fn heartbeat(&self, server_id: &str) -> SchedulerResult<()> {
        self.storage.servers().heartbeat(server_id).await
    }

    pub async fn remove_server(&self, server_id: &str) -> SchedulerResult<()> {
        self.storage.servers().remove_server(server_id).await
    }

    pub async fn remove_timed_out_servers(&self, timeout: Duration) -> SchedulerResult<u64> {
        self.storage.servers().remove_timed_out_servers(timeout).await
    }

    pub async fn servers(&self) -> SchedulerResult<Vec<Server>> {
        self.storage.servers().servers().await
    }

    // ---- 哈希 ----

    pub async fn set_range_in_hash<I>(&self, key: &str, pairs: I) -> SchedulerResult<HashMergeOutcome>
    where
        I: IntoIterator<Item = (String, Option<String>)>,
    {
        self.storage.hash_merger().set_range(key, pairs).await
    }

    pub async fn all_entries_from_hash(&self, key: &str) -> SchedulerResult<HashMap<String, Option<String>>> {
        self.storage.projections().all_entries_from_hash(key).await
    }

    pub async fn value_from_hash(&self, key: &str, field: &str) -> SchedulerResult<Option<String>> {
        self.storage.projections().value_from_hash(key, field).await
    }

    pub async fn hash_count(&self, key: &str) -> SchedulerResult<usize> {
        self.storage.projections().hash_count(key).await
    }

    pub async fn hash_ttl(&self, key: &str) -> SchedulerResult<Duration> {
        self.storage.projections().hash_ttl(key).await
    }

    // ---- 计数器 ----

    pub async fn counter(&self, key: &str) -> SchedulerResult<i64> {
        self.storage.projections().counter(key).await
    }

    // ---- 集合 ----

    pub async fn all_items_from_set(&self, key: &str) -> SchedulerResult<Vec<String>> {
        self.storage.projections().all_items_from_set(key).await
    }

    pub async fn range_from_set(&self, key: &str, start: usize, end: usize) -> SchedulerResult<Vec<String>> {
        self.storage.projections().range_from_set(key, start, end).await
    }

    pub async fn first_by_lowest_score_from_set(
        &self,
        key: &str,
        from_score: f64,
        to_score: f64,
    ) -> SchedulerResult<Option<String>> {
        self.storage
            .projections()
            .first_by_lowest_score_from_set(key, from_score, to_score)
            .await
    }

    pub async fn first_by_lowest_score_from_set_count(
        &self,
        key: &str,
        from_score: f64,
        to_score: f64,
        count: usize,
    ) -> SchedulerResult<Vec<String>> {
        self.storage
            .projections()
            .first_by_lowest_score_from_set_count(key, from_score, to_score, count)
            .await
    }

    pub async fn set_count(&self, key: &str) -> SchedulerResult<usize> {
        self.storage.projections().set_count(key).await
    }

    pub async fn set_contains(&self, key: &str, value: &str) -> SchedulerResult<bool> {
        self.storage.projections().set_contains(key, value).await
    }

    pub async fn set_ttl(&self, key: &str) -> SchedulerResult<Duration> {
        self.storage.projections().set_ttl(key).await
    }

    // ---- 列表 ----

    pub async fn all_items_from_list(&self, key: &str) -> SchedulerResult<Vec<String>> {
        self.storage.projections().all_items_from_list(key).await
    }

    pub async fn range_from_list(&self, key: &str, start: usize, end: usize) -> SchedulerResult<Vec<String>> {
        self.storage.projections().range_from_list(key, start, end).await
    }

    pub async fn list_count(&self, key: &str) -> SchedulerResult<usize> {
        self.storage.projections().list_count(key).await
    }

    pub async fn list_ttl(&self, key: &str) -> SchedulerResult<Duration> {
        self.storage.projections().list_ttl(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryDocumentStore;
    use scheduler_core::clock::{Clock, ManualClock};
    use scheduler_core::config::StorageConfig;
    use std::sync::Arc;

    fn connection() -> (StorageConnection, ManualClock) {
        let clock = ManualClock::starting_now();
        let storage = DocumentStorage::builder(Arc::new(InMemoryDocumentStore::new()), StorageConfig::default())
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();
        (storage.connection(), clock)
    }

    async fn create_job(connection: &StorageConnection, clock: &ManualClock) -> String {
        connection
            .create_expired_job(
                &InvocationData::new("Reports", "Generate"),
                r#"[42]"#,
                &[("CurrentCulture".to_string(), Some("en-US".to_string()))],
                clock.now(),
                Duration::hours(1),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_load_job() {
        let (connection, clock) = connection();
        let job_id = create_job(&connection, &clock).await;

        let data = connection.job_data(&job_id).await.unwrap().unwrap();
        assert_eq!(data.invocation.unwrap().method, "Generate");
        assert_eq!(data.arguments, "[42]");
        assert!(data.load_error.is_none());
        assert_eq!(
            connection.job_parameter(&job_id, "CurrentCulture").await.unwrap(),
            Some("en-US".to_string())
        );

        clock.advance(Duration::hours(1));
        assert!(connection.job_data(&job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_job_parameter() {
        let (connection, clock) = connection();
        let job_id = create_job(&connection, &clock).await;

        connection.set_job_parameter(&job_id, "RetryCount", Some("3")).await.unwrap();
        connection.set_job_parameter(&job_id, "CurrentCulture", Some("zh-CN")).await.unwrap();
        connection.set_job_parameter("missing", "RetryCount", Some("1")).await.unwrap();

        assert_eq!(connection.job_parameter(&job_id, "RetryCount").await.unwrap(), Some("3".to_string()));
        assert_eq!(
            connection.job_parameter(&job_id, "CurrentCulture").await.unwrap(),
            Some("zh-CN".to_string())
        );
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let (connection, clock) = connection();
        let job_id = create_job(&connection, &clock).await;

        let mut tx = connection.create_write_transaction();
        tx.set_job_state(&job_id, StateData::new("Enqueued").with_data("Queue", "default"))
            .add_to_queue("default", &job_id);
        tx.commit().await.unwrap();

        let state = connection.state_data(&job_id).await.unwrap().unwrap();
        assert_eq!(state.name, "Enqueued");
        assert_eq!(state.data.get("Queue").map(String::as_str), Some("default"));

        let token = CancellationToken::new();
        let fetched = connection.fetch_next_job(&["default"], &token).await.unwrap();
        assert_eq!(fetched.job_id(), job_id);
    }

    #[tokio::test]
    async fn test_negative_expiry_is_rejected() {
        let (connection, clock) = connection();
        let result = connection
            .create_expired_job(&InvocationData::new("T", "M"), "[]", &[], clock.now(), Duration::seconds(-5))
            .await;
        assert!(matches!(result, Err(SchedulerError::InvalidArgument(_))));
    }
}
