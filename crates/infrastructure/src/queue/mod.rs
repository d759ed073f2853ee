//! 队列分发
//!
//! 队列名在启动时映射到唯一的队列提供者, 一次出队调用涉及的所有队列必须由同一个提供者负责。

mod document_queue;
mod registry;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use scheduler_errors::SchedulerResult;
use tokio_util::sync::CancellationToken;

pub use document_queue::{DocumentFetchedJob, DocumentJobQueue, DocumentQueueProvider};
pub use registry::QueueProviderRegistry;

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// 阻塞直到在任意一个队列中取到任务, 或者 `cancellation` 被触发(返回 `OperationCanceled`)
    async fn dequeue(
        &self,
        queues: &[String],
        cancellation: &CancellationToken,
    ) -> SchedulerResult<Box<dyn FetchedJob>>;

    async fn enqueue(&self, queue: &str, job_id: &str) -> SchedulerResult<()>;
}

/// 已取出的任务
///
/// 处理完成后调用 `remove_from_queue`, 放弃处理调用 `requeue`。
/// 两者都不调用时, 任务在不可见超时之后重新可以被取出。
#[async_trait]
pub trait FetchedJob: Send + Sync + Debug {
    fn job_id(&self) -> &str;

    fn queue(&self) -> &str;

    async fn remove_from_queue(&mut self) -> SchedulerResult<()>;

    async fn requeue(&mut self) -> SchedulerResult<()>;
}

/// 队列监控查询
#[async_trait]
pub trait QueueMonitoring: Send + Sync {
    async fn queues(&self) -> SchedulerResult<Vec<String>>;

    async fn enqueued_count(&self, queue: &str) -> SchedulerResult<usize>;

    async fn fetched_count(&self, queue: &str) -> SchedulerResult<usize>;

    async fn enqueued_job_ids(&self, queue: &str, from: usize, per_page: usize) -> SchedulerResult<Vec<String>>;

    async fn fetched_job_ids(&self, queue: &str, from: usize, per_page: usize) -> SchedulerResult<Vec<String>>;
}

pub trait QueueProvider: Send + Sync {
    fn name(&self) -> &str;

    fn job_queue(&self) -> Arc<dyn JobQueue>;

    fn monitoring(&self) -> Arc<dyn QueueMonitoring>;
}
