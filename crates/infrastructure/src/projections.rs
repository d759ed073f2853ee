use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use scheduler_core::clock::Clock;
use scheduler_core::retry::RetryingExecutor;
use scheduler_domain::entities::{Counter, Document, DocumentType, HashEntry, Job, ListEntry, SetEntry, State};
use scheduler_domain::repositories::{DocumentQuery, DocumentStore};
use scheduler_domain::value_objects::{no_expiry, InvocationData, JobData, StateData};
use scheduler_errors::SchedulerResult;
use tracing::warn;

/// 只读查询
///
/// 所有查询都过滤掉已过期的文档; 键不存在时返回空集合或0, 不会报错。
#[derive(Clone)]
pub struct ReadProjections {
    store: Arc<dyn DocumentStore>,
    executor: RetryingExecutor,
    clock: Arc<dyn Clock>,
}

impl ReadProjections {
    pub fn new(store: Arc<dyn DocumentStore>, executor: RetryingExecutor, clock: Arc<dyn Clock>) -> Self {
        Self { store, executor, clock }
    }

    async fn live(&self, query: DocumentQuery) -> SchedulerResult<Vec<Document>> {
        let now = self.clock.now_epoch();
        Ok(self
            .executor
            .execute("projection.query", || self.store.query(&query))
            .await?
            .into_iter()
            .map(|stored| stored.document)
            .filter(|document| !document.is_expired(now))
            .collect())
    }

    async fn live_typed<T>(&self, query: DocumentQuery) -> SchedulerResult<Vec<T>>
    where
        T: TryFrom<Document>,
    {
        Ok(self
            .live(query)
            .await?
            .into_iter()
            .filter_map(|document| T::try_from(document).ok())
            .collect())
    }

    async fn read_live(&self, doc_type: DocumentType, id: &str) -> SchedulerResult<Option<Document>> {
        let now = self.clock.now_epoch();
        let stored = self
            .executor
            .execute("projection.read", || self.store.read(doc_type, id))
            .await?;
        Ok(stored
            .map(|s| s.document)
            .filter(|document| !document.is_expired(now)))
    }

    /// 最小的过期时间距现在的时长, 没有任何过期时间时返回 [`no_expiry`]
    async fn ttl(&self, doc_type: DocumentType, key: &str) -> SchedulerResult<Duration> {
        let now = self.clock.now_epoch();
        let earliest = self
            .live(DocumentQuery::of(doc_type).with_key(key))
            .await?
            .iter()
            .filter_map(Document::expire_on)
            .min();
        Ok(match earliest {
            Some(expire_on) => Duration::seconds(expire_on - now),
            None => no_expiry(),
        })
    }

    // ---- 任务 ----

    pub async fn job(&self, job_id: &str) -> SchedulerResult<Option<Job>> {
        Ok(self
            .read_live(DocumentType::Job, job_id)
            .await?
            .and_then(|document| Job::try_from(document).ok()))
    }

    /// 任务读模型; 调用信息无法解析时错误记录在 `load_error` 中
    pub async fn job_data(&self, job_id: &str) -> SchedulerResult<Option<JobData>> {
        let Some(job) = self.job(job_id).await? else {
            return Ok(None);
        };

        let (invocation, load_error) = match InvocationData::deserialize(&job.invocation_data) {
            Ok(invocation) => (Some(invocation), None),
            Err(e) => {
                warn!(job_id, error = %e, "failed to load job invocation data");
                (None, Some(e.to_string()))
            }
        };

        Ok(Some(JobData {
            invocation,
            arguments: job.arguments,
            state_name: job.state_name,
            created_at: job.created_on,
            load_error,
        }))
    }

    pub async fn state_data(&self, job_id: &str) -> SchedulerResult<Option<StateData>> {
        let Some(state_id) = self.job(job_id).await?.and_then(|job| job.state_id) else {
            return Ok(None);
        };
        Ok(self
            .read_live(DocumentType::State, &state_id)
            .await?
            .and_then(|document| State::try_from(document).ok())
            .map(|state| StateData {
                name: state.name,
                reason: state.reason,
                data: state.data,
            }))
    }

    /// 任务的状态历史, 按写入顺序
    pub async fn state_history(&self, job_id: &str) -> SchedulerResult<Vec<State>> {
        let mut states: Vec<State> = self
            .live_typed(DocumentQuery::of(DocumentType::State).with_key(job_id))
            .await?;
        states.sort_by(|a, b| a.created_on.cmp(&b.created_on));
        Ok(states)
    }

    pub async fn job_parameter(&self, job_id: &str, name: &str) -> SchedulerResult<Option<String>> {
        Ok(self
            .job(job_id)
            .await?
            .and_then(|job| job.parameter(name).map(str::to_string)))
    }

    // ---- 计数器 ----

    pub async fn counter(&self, key: &str) -> SchedulerResult<i64> {
        let counters: Vec<Counter> = self
            .live_typed(DocumentQuery::of(DocumentType::Counter).with_key(key))
            .await?;
        Ok(counters.iter().map(|c| c.value).sum())
    }

    // ---- 集合 ----

    /// 按创建顺序
    async fn set_entries(&self, key: &str) -> SchedulerResult<Vec<SetEntry>> {
        let mut entries: Vec<SetEntry> = self
            .live_typed(DocumentQuery::of(DocumentType::Set).with_key(key))
            .await?;
        entries.sort_by(|a, b| a.created_on.cmp(&b.created_on));
        Ok(entries)
    }

    pub async fn set_count(&self, key: &str) -> SchedulerResult<usize> {
        Ok(self.set_entries(key).await?.len())
    }

    pub async fn set_contains(&self, key: &str, value: &str) -> SchedulerResult<bool> {
        Ok(!self
            .live(DocumentQuery::of(DocumentType::Set).with_key(key).with_value(value))
            .await?
            .is_empty())
    }

    pub async fn set_ttl(&self, key: &str) -> SchedulerResult<Duration> {
        self.ttl(DocumentType::Set, key).await
    }

    pub async fn all_items_from_set(&self, key: &str) -> SchedulerResult<Vec<String>> {
        Ok(self.set_entries(key).await?.into_iter().map(|e| e.value).collect())
    }

    /// 闭区间 `[start, end]`
    pub async fn range_from_set(&self, key: &str, start: usize, end: usize) -> SchedulerResult<Vec<String>> {
        Ok(inclusive_range(self.set_entries(key).await?, start, end)
            .into_iter()
            .map(|e| e.value)
            .collect())
    }

    /// 分数在 `[from_score, to_score]` 内的值, 分数低的在前
    pub async fn first_by_lowest_score_from_set_count(
        &self,
        key: &str,
        from_score: f64,
        to_score: f64,
        count: usize,
    ) -> SchedulerResult<Vec<String>> {
        let mut entries: Vec<SetEntry> = self
            .set_entries(key)
            .await?
            .into_iter()
            .filter(|e| e.score >= from_score && e.score <= to_score)
            .collect();
        entries.sort_by(|a, b| a.score.total_cmp(&b.score));
        Ok(entries.into_iter().take(count).map(|e| e.value).collect())
    }

    pub async fn first_by_lowest_score_from_set(
        &self,
        key: &str,
        from_score: f64,
        to_score: f64,
    ) -> SchedulerResult<Option<String>> {
        Ok(self
            .first_by_lowest_score_from_set_count(key, from_score, to_score, 1)
            .await?
            .into_iter()
            .next())
    }

    // ---- 哈希 ----

    pub async fn all_entries_from_hash(&self, key: &str) -> SchedulerResult<HashMap<String, Option<String>>> {
        let entries: Vec<HashEntry> = self
            .live_typed(DocumentQuery::of(DocumentType::Hash).with_key(key))
            .await?;
        Ok(entries.into_iter().map(|e| (e.field, e.value)).collect())
    }

    pub async fn value_from_hash(&self, key: &str, field: &str) -> SchedulerResult<Option<String>> {
        let entries: Vec<HashEntry> = self
            .live_typed(DocumentQuery::of(DocumentType::Hash).with_key(key).with_field(field))
            .await?;
        Ok(entries.into_iter().next().and_then(|e| e.value))
    }

    pub async fn hash_count(&self, key: &str) -> SchedulerResult<usize> {
        Ok(self
            .live(DocumentQuery::of(DocumentType::Hash).with_key(key))
            .await?
            .len())
    }

    pub async fn hash_ttl(&self, key: &str) -> SchedulerResult<Duration> {
        self.ttl(DocumentType::Hash, key).await
    }

    // ---- 列表 ----

    /// 最新的在前
    async fn list_entries(&self, key: &str) -> SchedulerResult<Vec<ListEntry>> {
        let mut entries: Vec<ListEntry> = self
            .live_typed(DocumentQuery::of(DocumentType::List).with_key(key))
            .await?;
        // 查询结果按写入顺序返回, 先反转再稳定排序使同一时刻写入的条目也是新的在前
        entries.reverse();
        entries.sort_by(|a, b| b.created_on.cmp(&a.created_on));
        Ok(entries)
    }

    pub async fn all_items_from_list(&self, key: &str) -> SchedulerResult<Vec<String>> {
        Ok(self.list_entries(key).await?.into_iter().map(|e| e.value).collect())
    }

    /// 闭区间 `[start, end]`, 最新的在前
    pub async fn range_from_list(&self, key: &str, start: usize, end: usize) -> SchedulerResult<Vec<String>> {
        Ok(inclusive_range(self.list_entries(key).await?, start, end)
            .into_iter()
            .map(|e| e.value)
            .collect())
    }

    pub async fn list_count(&self, key: &str) -> SchedulerResult<usize> {
        Ok(self.list_entries(key).await?.len())
    }

    pub async fn list_ttl(&self, key: &str) -> SchedulerResult<Duration> {
        self.ttl(DocumentType::List, key).await
    }
}

fn inclusive_range<T>(items: Vec<T>, start: usize, end: usize) -> Vec<T> {
    if start > end {
        return Vec::new();
    }
    items
        .into_iter()
        .skip(start)
        .take(end.saturating_sub(start).saturating_add(1))
        .collect()
}
