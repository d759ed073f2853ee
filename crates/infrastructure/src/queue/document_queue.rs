use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use scheduler_core::clock::Clock;
use scheduler_core::config::QueueConfig;
use scheduler_core::retry::RetryingExecutor;
use scheduler_domain::entities::{new_document_id, Document, DocumentType, QueueItem, StoredDocument};
use scheduler_domain::repositories::{DocumentQuery, DocumentStore};
use scheduler_errors::{SchedulerError, SchedulerResult, StoreError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{FetchedJob, JobQueue, QueueMonitoring, QueueProvider};

/// 基于文档存储的任务队列
///
/// 每个入队的任务是一个队列文档。取出时按 etag 条件替换, 写入取出时间和取出者;
/// 取出超过不可见超时仍未确认的任务重新可见。
pub struct DocumentJobQueue {
    store: Arc<dyn DocumentStore>,
    executor: RetryingExecutor,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
}

impl DocumentJobQueue {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        executor: RetryingExecutor,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            executor,
            clock,
            config,
        }
    }

    async fn items(&self, queue: &str) -> SchedulerResult<Vec<StoredDocument>> {
        let query = DocumentQuery::of(DocumentType::Queue).with_key(queue);
        self.executor
            .execute("queue.query", || self.store.query(&query))
            .await
    }

    /// 按入队顺序尝试认领一个可见的任务
    async fn try_fetch(&self, queues: &[String], token: &str) -> SchedulerResult<Option<DocumentFetchedJob>> {
        let now = self.clock.now_epoch();
        let invisibility = self.config.invisibility_timeout().num_seconds();

        let mut candidates: Vec<(QueueItem, u64)> = Vec::new();
        for queue in queues {
            for stored in self.items(queue).await? {
                if let Ok(item) = QueueItem::try_from(stored.document) {
                    if item.is_available(now, invisibility) {
                        candidates.push((item, stored.etag));
                    }
                }
            }
        }
        candidates.sort_by(|(a, a_etag), (b, b_etag)| {
            a.created_on.cmp(&b.created_on).then(a_etag.cmp(b_etag))
        });

        for (mut item, etag) in candidates {
            let redelivery = item.fetched_at.is_some();
            item.fetched_at = Some(now);
            item.fetched_by = Some(token.to_string());

            let claimed = self
                .executor
                .execute("queue.claim", || self.store.replace(item.clone().into(), etag))
                .await;
            let stored = match claimed {
                Ok(stored) => stored,
                Err(SchedulerError::Store(StoreError::PreconditionFailed { .. })) => {
                    // 重试前的认领请求可能已经成功
                    match self.claimed_by(&item.id, token).await? {
                        Some(stored) => stored,
                        None => continue,
                    }
                }
                Err(SchedulerError::Store(StoreError::NotFound { .. })) => continue,
                Err(e) => return Err(e),
            };

            counter!("jobs_dequeued_total", "queue" => item.queue.clone()).increment(1);
            if redelivery {
                counter!("jobs_redelivered_total", "queue" => item.queue.clone()).increment(1);
            }
            debug!(queue = %item.queue, job_id = %item.job_id, redelivery, "job fetched");

            return Ok(Some(DocumentFetchedJob {
                store: self.store.clone(),
                executor: self.executor.clone(),
                item,
                etag: stored.etag,
            }));
        }
        Ok(None)
    }

    async fn claimed_by(&self, id: &str, token: &str) -> SchedulerResult<Option<StoredDocument>> {
        let current = self
            .executor
            .execute("queue.read", || self.store.read(DocumentType::Queue, id))
            .await?;
        Ok(current.filter(|stored| match &stored.document {
            Document::Queue(item) => item.fetched_by.as_deref() == Some(token),
            _ => false,
        }))
    }

    async fn page(
        &self,
        queue: &str,
        fetched: bool,
        from: usize,
        per_page: usize,
    ) -> SchedulerResult<Vec<String>> {
        let mut items: Vec<QueueItem> = self
            .items(queue)
            .await?
            .into_iter()
            .filter_map(|stored| QueueItem::try_from(stored.document).ok())
            .filter(|item| item.fetched_at.is_some() == fetched)
            .collect();
        items.sort_by(|a, b| a.created_on.cmp(&b.created_on));
        Ok(items
            .into_iter()
            .skip(from)
            .take(per_page)
            .map(|item| item.job_id)
            .collect())
    }

    async fn count(&self, queue: &str, fetched: bool) -> SchedulerResult<usize> {
        Ok(self
            .items(queue)
            .await?
            .into_iter()
            .filter_map(|stored| QueueItem::try_from(stored.document).ok())
            .filter(|item| item.fetched_at.is_some() == fetched)
            .count())
    }
}

#[async_trait]
impl JobQueue for DocumentJobQueue {
    async fn dequeue(
        &self,
        queues: &[String],
        cancellation: &CancellationToken,
    ) -> SchedulerResult<Box<dyn FetchedJob>> {
        if queues.is_empty() {
            return Err(SchedulerError::invalid_argument("队列列表不能为空"));
        }
        let token = new_document_id();

        loop {
            if cancellation.is_cancelled() {
                debug!(?queues, "dequeue canceled");
                return Err(SchedulerError::OperationCanceled);
            }

            if let Some(fetched) = self.try_fetch(queues, &token).await? {
                return Ok(Box::new(fetched));
            }

            tokio::select! {
                _ = cancellation.cancelled() => {
                    debug!(?queues, "dequeue canceled while waiting");
                    return Err(SchedulerError::OperationCanceled);
                }
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }
    }

    async fn enqueue(&self, queue: &str, job_id: &str) -> SchedulerResult<()> {
        if queue.trim().is_empty() {
            return Err(SchedulerError::invalid_argument("队列名不能为空"));
        }
        let item = QueueItem::new(queue, job_id, self.clock.now());
        let created = self
            .executor
            .execute("queue.enqueue", || self.store.create(item.clone().into()))
            .await;
        match created {
            // 重试前的创建请求已经成功
            Ok(_) | Err(SchedulerError::Store(StoreError::Conflict { .. })) => {
                counter!("jobs_enqueued_total", "queue" => queue.to_string()).increment(1);
                debug!(queue, job_id, "job enqueued");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl QueueMonitoring for DocumentJobQueue {
    async fn queues(&self) -> SchedulerResult<Vec<String>> {
        let query = DocumentQuery::of(DocumentType::Queue);
        let items = self
            .executor
            .execute("queue.query", || self.store.query(&query))
            .await?;
        let mut names: Vec<String> = items
            .into_iter()
            .filter_map(|stored| QueueItem::try_from(stored.document).ok())
            .map(|item| item.queue)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn enqueued_count(&self, queue: &str) -> SchedulerResult<usize> {
        self.count(queue, false).await
    }

    async fn fetched_count(&self, queue: &str) -> SchedulerResult<usize> {
        self.count(queue, true).await
    }

    async fn enqueued_job_ids(&self, queue: &str, from: usize, per_page: usize) -> SchedulerResult<Vec<String>> {
        self.page(queue, false, from, per_page).await
    }

    async fn fetched_job_ids(&self, queue: &str, from: usize, per_page: usize) -> SchedulerResult<Vec<String>> {
        self.page(queue, true, from, per_page).await
    }
}

/// 从文档队列中取出的任务
pub struct DocumentFetchedJob {
    store: Arc<dyn DocumentStore>,
    executor: RetryingExecutor,
    item: QueueItem,
    etag: u64,
}

impl std::fmt::Debug for DocumentFetchedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentFetchedJob")
            .field("queue", &self.item.queue)
            .field("job_id", &self.item.job_id)
            .field("etag", &self.etag)
            .finish()
    }
}

#[async_trait]
impl FetchedJob for DocumentFetchedJob {
    fn job_id(&self) -> &str {
        &self.item.job_id
    }

    fn queue(&self) -> &str {
        &self.item.queue
    }

    async fn remove_from_queue(&mut self) -> SchedulerResult<()> {
        let result = self
            .executor
            .execute("queue.remove", || {
                self.store.delete(DocumentType::Queue, &self.item.id, Some(self.etag))
            })
            .await;
        match result {
            Ok(_) => {
                debug!(queue = %self.item.queue, job_id = %self.item.job_id, "job removed from queue");
                Ok(())
            }
            Err(SchedulerError::Store(StoreError::PreconditionFailed { .. })) => {
                warn!(
                    queue = %self.item.queue,
                    job_id = %self.item.job_id,
                    "fetch lease expired and job was claimed again, leaving it in place"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn requeue(&mut self) -> SchedulerResult<()> {
        let mut released = self.item.clone();
        released.fetched_at = None;
        released.fetched_by = None;

        let result = self
            .executor
            .execute("queue.requeue", || {
                self.store.replace(released.clone().into(), self.etag)
            })
            .await;
        match result {
            Ok(stored) => {
                self.etag = stored.etag;
                self.item = released;
                info!(queue = %self.item.queue, job_id = %self.item.job_id, "job requeued");
                Ok(())
            }
            Err(SchedulerError::Store(
                StoreError::PreconditionFailed { .. } | StoreError::NotFound { .. },
            )) => {
                warn!(queue = %self.item.queue, job_id = %self.item.job_id, "job no longer held, requeue skipped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// 默认队列提供者
pub struct DocumentQueueProvider {
    queue: Arc<DocumentJobQueue>,
}

impl DocumentQueueProvider {
    pub const NAME: &'static str = "documents";

    pub fn new(queue: Arc<DocumentJobQueue>) -> Self {
        Self { queue }
    }
}

impl QueueProvider for DocumentQueueProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn job_queue(&self) -> Arc<dyn JobQueue> {
        self.queue.clone()
    }

    fn monitoring(&self) -> Arc<dyn QueueMonitoring> {
        self.queue.clone()
    }
}
