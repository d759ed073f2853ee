use chrono::Duration;
use scheduler_domain::entities::{
    new_document_id, Counter, Document, DocumentType, Job, ListEntry, SetEntry, State,
};
use scheduler_domain::repositories::DocumentQuery;
use scheduler_domain::scripts::{DeleteDocumentsArgs, ExpireDocumentsArgs, UpsertDocumentsArgs};
use scheduler_domain::value_objects::StateData;
use scheduler_errors::{SchedulerError, SchedulerResult, StoreError};
use tracing::{debug, info, warn};

use crate::storage::DocumentStorage;

/// 事务中暂存的写命令
///
/// 需要新文档ID的命令在暂存时就生成ID, 重试时不会产生重复文档。
#[derive(Debug, Clone)]
enum Command {
    ExpireJob { job_id: String, expire_in: Option<Duration> },
    SetJobState { job_id: String, state: State },
    AddJobState { state: State },
    AddToQueue { queue: String, job_id: String },
    AddCounter { counter: Counter },
    AddToSet { entry: SetEntry },
    AddRangeToSet { key: String, entries: Vec<SetEntry> },
    RemoveFromSet { key: String, value: String },
    RemoveSet { key: String },
    InsertToList { entry: ListEntry },
    RemoveFromList { key: String, value: String },
    TrimList { key: String, keep_start: usize, keep_end: usize },
    SetRangeInHash { key: String, pairs: Vec<(String, Option<String>)> },
    RemoveHash { key: String },
    ExpireKey { doc_type: DocumentType, key: String, expire_in: Option<Duration> },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::ExpireJob { .. } => "expire_job",
            Command::SetJobState { .. } => "set_job_state",
            Command::AddJobState { .. } => "add_job_state",
            Command::AddToQueue { .. } => "add_to_queue",
            Command::AddCounter { .. } => "add_counter",
            Command::AddToSet { .. } => "add_to_set",
            Command::AddRangeToSet { .. } => "add_range_to_set",
            Command::RemoveFromSet { .. } => "remove_from_set",
            Command::RemoveSet { .. } => "remove_set",
            Command::InsertToList { .. } => "insert_to_list",
            Command::RemoveFromList { .. } => "remove_from_list",
            Command::TrimList { .. } => "trim_list",
            Command::SetRangeInHash { .. } => "set_range_in_hash",
            Command::RemoveHash { .. } => "remove_hash",
            Command::ExpireKey { .. } => "expire_key",
        }
    }
}

/// 非原子的批量写入
///
/// 命令按添加顺序在 `commit` 时依次执行, 每条命令本身可以安全重试。
/// 中途失败时已执行的命令不会回滚。
pub struct WriteTransaction {
    storage: DocumentStorage,
    commands: Vec<Command>,
}

impl WriteTransaction {
    pub fn new(storage: DocumentStorage) -> Self {
        Self {
            storage,
            commands: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    fn expire_on(&self, expire_in: Duration) -> i64 {
        self.storage.clock().now_epoch() + expire_in.num_seconds()
    }

    fn state(&self, job_id: &str, state: StateData) -> State {
        State {
            id: new_document_id(),
            job_id: job_id.to_string(),
            name: state.name,
            reason: state.reason,
            data: state.data,
            created_on: self.storage.clock().now(),
            expire_on: None,
        }
    }

    // ---- 任务 ----

    /// 任务及其全部状态在 `expire_in` 后过期
    pub fn expire_job(&mut self, job_id: &str, expire_in: Duration) -> &mut Self {
        self.commands.push(Command::ExpireJob {
            job_id: job_id.to_string(),
            expire_in: Some(expire_in),
        });
        self
    }

    pub fn persist_job(&mut self, job_id: &str) -> &mut Self {
        self.commands.push(Command::ExpireJob {
            job_id: job_id.to_string(),
            expire_in: None,
        });
        self
    }

    /// 写入新状态并把任务的当前状态指向它
    pub fn set_job_state(&mut self, job_id: &str, state: StateData) -> &mut Self {
        let state = self.state(job_id, state);
        self.commands.push(Command::SetJobState {
            job_id: job_id.to_string(),
            state,
        });
        self
    }

    /// 只追加状态历史, 不改变当前状态
    pub fn add_job_state(&mut self, job_id: &str, state: StateData) -> &mut Self {
        let state = self.state(job_id, state);
        self.commands.push(Command::AddJobState { state });
        self
    }

    pub fn add_to_queue(&mut self, queue: &str, job_id: &str) -> &mut Self {
        self.commands.push(Command::AddToQueue {
            queue: queue.to_string(),
            job_id: job_id.to_string(),
        });
        self
    }

    // ---- 计数器 ----

    fn counter(&mut self, key: &str, value: i64, expire_in: Option<Duration>) -> &mut Self {
        let counter = Counter {
            id: new_document_id(),
            key: key.to_string(),
            value,
            created_on: self.storage.clock().now(),
            expire_on: expire_in.map(|d| self.expire_on(d)),
        };
        self.commands.push(Command::AddCounter { counter });
        self
    }

    pub fn increment_counter(&mut self, key: &str) -> &mut Self {
        self.counter(key, 1, None)
    }

    pub fn increment_counter_with_expiry(&mut self, key: &str, expire_in: Duration) -> &mut Self {
        self.counter(key, 1, Some(expire_in))
    }

    pub fn decrement_counter(&mut self, key: &str) -> &mut Self {
        self.counter(key, -1, None)
    }

    pub fn decrement_counter_with_expiry(&mut self, key: &str, expire_in: Duration) -> &mut Self {
        self.counter(key, -1, Some(expire_in))
    }

    // ---- 集合 ----

    pub fn add_to_set(&mut self, key: &str, value: &str, score: f64) -> &mut Self {
        let entry = SetEntry::new(key, value, score, self.storage.clock().now());
        self.commands.push(Command::AddToSet { entry });
        self
    }

    pub fn add_range_to_set<S: AsRef<str>>(&mut self, key: &str, values: &[S]) -> &mut Self {
        let now = self.storage.clock().now();
        let entries = values
            .iter()
            .map(|value| SetEntry::new(key, value.as_ref(), 0.0, now))
            .collect();
        self.commands.push(Command::AddRangeToSet {
            key: key.to_string(),
            entries,
        });
        self
    }

    pub fn remove_from_set(&mut self, key: &str, value: &str) -> &mut Self {
        self.commands.push(Command::RemoveFromSet {
            key: key.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn remove_set(&mut self, key: &str) -> &mut Self {
        self.commands.push(Command::RemoveSet { key: key.to_string() });
        self
    }

    pub fn expire_set(&mut self, key: &str, expire_in: Duration) -> &mut Self {
        self.expire_key(DocumentType::Set, key, Some(expire_in))
    }

    pub fn persist_set(&mut self, key: &str) -> &mut Self {
        self.expire_key(DocumentType::Set, key, None)
    }

    // ---- 列表 ----

    pub fn insert_to_list(&mut self, key: &str, value: &str) -> &mut Self {
        let entry = ListEntry::new(key, value, self.storage.clock().now());
        self.commands.push(Command::InsertToList { entry });
        self
    }

    pub fn remove_from_list(&mut self, key: &str, value: &str) -> &mut Self {
        self.commands.push(Command::RemoveFromList {
            key: key.to_string(),
            value: value.to_string(),
        });
        self
    }

    /// 只保留最新在前顺序下 `[keep_start, keep_end]` 范围内的条目
    pub fn trim_list(&mut self, key: &str, keep_start: usize, keep_end: usize) -> &mut Self {
        self.commands.push(Command::TrimList {
            key: key.to_string(),
            keep_start,
            keep_end,
        });
        self
    }

    pub fn expire_list(&mut self, key: &str, expire_in: Duration) -> &mut Self {
        self.expire_key(DocumentType::List, key, Some(expire_in))
    }

    pub fn persist_list(&mut self, key: &str) -> &mut Self {
        self.expire_key(DocumentType::List, key, None)
    }

    // ---- 哈希 ----

    pub fn set_range_in_hash<I>(&mut self, key: &str, pairs: I) -> &mut Self
    where
        I: IntoIterator<Item = (String, Option<String>)>,
    {
        self.commands.push(Command::SetRangeInHash {
            key: key.to_string(),
            pairs: pairs.into_iter().collect(),
        });
        self
    }

    pub fn remove_hash(&mut self, key: &str) -> &mut Self {
        self.commands.push(Command::RemoveHash { key: key.to_string() });
        self
    }

    pub fn expire_hash(&mut self, key: &str, expire_in: Duration) -> &mut Self {
        self.expire_key(DocumentType::Hash, key, Some(expire_in))
    }

    pub fn persist_hash(&mut self, key: &str) -> &mut Self {
        self.expire_key(DocumentType::Hash, key, None)
    }

    fn expire_key(&mut self, doc_type: DocumentType, key: &str, expire_in: Option<Duration>) -> &mut Self {
        self.commands.push(Command::ExpireKey {
            doc_type,
            key: key.to_string(),
            expire_in,
        });
        self
    }

    // ---- 提交 ----

    pub async fn commit(self) -> SchedulerResult<()> {
        let total = self.commands.len();
        for (index, command) in self.commands.iter().enumerate() {
            if let Err(e) = self.apply(command).await {
                warn!(
                    command = command.name(),
                    index,
                    total,
                    error = %e,
                    "write transaction aborted"
                );
                return Err(e);
            }
        }
        debug!(commands = total, "write transaction committed");
        Ok(())
    }

    async fn apply(&self, command: &Command) -> SchedulerResult<()> {
        match command {
            Command::ExpireJob { job_id, expire_in } => {
                let expire_on = expire_in.map(|d| self.expire_on(d));
                self.expire_job_documents(job_id, expire_on).await
            }
            Command::SetJobState { job_id, state } => {
                self.upsert(state.clone().into()).await?;
                self.point_job_at_state(job_id, state).await
            }
            Command::AddJobState { state } => self.upsert(state.clone().into()).await,
            Command::AddToQueue { queue, job_id } => {
                self.storage
                    .queue_registry()
                    .provider_for(queue)
                    .job_queue()
                    .enqueue(queue, job_id)
                    .await
            }
            Command::AddCounter { counter } => self.upsert(counter.clone().into()).await,
            Command::AddToSet { entry } => self.upsert(entry.clone().into()).await,
            Command::AddRangeToSet { key, entries } => {
                if entries.is_empty() {
                    return Ok(());
                }
                self.storage
                    .invoker()
                    .invoke(UpsertDocumentsArgs {
                        partition: DocumentType::Set,
                        documents: entries.iter().cloned().map(Document::from).collect(),
                    })
                    .await?;
                debug!(key, count = entries.len(), "set range added");
                Ok(())
            }
            Command::RemoveFromSet { key, value } => {
                self.delete_where(DocumentQuery::of(DocumentType::Set).with_key(key).with_value(value))
                    .await
            }
            Command::RemoveSet { key } => self.delete_where(DocumentQuery::of(DocumentType::Set).with_key(key)).await,
            Command::InsertToList { entry } => self.upsert(entry.clone().into()).await,
            Command::RemoveFromList { key, value } => {
                self.delete_where(DocumentQuery::of(DocumentType::List).with_key(key).with_value(value))
                    .await
            }
            Command::TrimList {
                key,
                keep_start,
                keep_end,
            } => self.trim_list_entries(key, *keep_start, *keep_end).await,
            Command::SetRangeInHash { key, pairs } => {
                self.storage
                    .hash_merger()
                    .set_range(key, pairs.iter().cloned())
                    .await?;
                Ok(())
            }
            Command::RemoveHash { key } => self.delete_where(DocumentQuery::of(DocumentType::Hash).with_key(key)).await,
            Command::ExpireKey {
                doc_type,
                key,
                expire_in,
            } => {
                let expire_on = expire_in.map(|d| self.expire_on(d));
                self.restamp(DocumentQuery::of(*doc_type).with_key(key), expire_on).await
            }
        }
    }

    async fn upsert(&self, document: Document) -> SchedulerResult<()> {
        let store = self.storage.store();
        self.storage
            .executor()
            .execute("transaction.upsert", || store.upsert(document.clone()))
            .await?;
        Ok(())
    }

    async fn delete_where(&self, query: DocumentQuery) -> SchedulerResult<()> {
        let outcome = self
            .storage
            .invoker()
            .invoke(DeleteDocumentsArgs { query })
            .await?;
        debug!(removed = outcome.affected, "documents removed");
        Ok(())
    }

    /// 修改查询命中文档的过期时间, 读取和改写都在存储端脚本内完成
    async fn restamp(&self, query: DocumentQuery, expire_on: Option<i64>) -> SchedulerResult<()> {
        let doc_type = query.doc_type;
        let outcome = self
            .storage
            .invoker()
            .invoke(ExpireDocumentsArgs { query, expire_on })
            .await?;
        debug!(partition = %doc_type, ?expire_on, stamped = outcome.affected, "expiration updated");
        Ok(())
    }

    async fn expire_job_documents(&self, job_id: &str, expire_on: Option<i64>) -> SchedulerResult<()> {
        let found = self
            .update_job(job_id, |job| {
                job.expire_on = expire_on;
            })
            .await?;
        if !found {
            warn!(job_id, "job not found, expiration skipped");
            return Ok(());
        }
        self.restamp(DocumentQuery::of(DocumentType::State).with_key(job_id), expire_on)
            .await
    }

    async fn point_job_at_state(&self, job_id: &str, state: &State) -> SchedulerResult<()> {
        let found = self
            .update_job(job_id, |job| {
                job.state_id = Some(state.id.clone());
                job.state_name = Some(state.name.clone());
            })
            .await?;
        if found {
            info!(job_id, state = %state.name, "job state changed");
        } else {
            warn!(job_id, state = %state.name, "job not found, state recorded without moving current state");
        }
        Ok(())
    }

    /// 读取任务后按 etag 条件替换, 与参数脚本并发时重新读取再试
    async fn update_job<F>(&self, job_id: &str, mut mutate: F) -> SchedulerResult<bool>
    where
        F: FnMut(&mut Job),
    {
        let store = self.storage.store();
        let executor = self.storage.executor();
        loop {
            let Some(stored) = executor
                .execute("transaction.read_job", || store.read(DocumentType::Job, job_id))
                .await?
            else {
                return Ok(false);
            };
            let mut job = Job::try_from(stored.document)
                .map_err(|_| SchedulerError::Internal(format!("文档 {job_id} 不是任务")))?;
            mutate(&mut job);

            let replaced = executor
                .execute("transaction.replace_job", || {
                    store.replace(job.clone().into(), stored.etag)
                })
                .await;
            match replaced {
                Ok(_) => return Ok(true),
                Err(SchedulerError::Store(StoreError::PreconditionFailed { .. })) => {
                    debug!(job_id, "job changed concurrently, retrying update");
                }
                Err(SchedulerError::Store(StoreError::NotFound { .. })) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
    }

    async fn trim_list_entries(&self, key: &str, keep_start: usize, keep_end: usize) -> SchedulerResult<()> {
        let store = self.storage.store();
        let query = DocumentQuery::of(DocumentType::List).with_key(key);
        let mut entries: Vec<ListEntry> = self
            .storage
            .executor()
            .execute("transaction.query", || store.query(&query))
            .await?
            .into_iter()
            .filter_map(|stored| ListEntry::try_from(stored.document).ok())
            .collect();
        entries.reverse();
        entries.sort_by(|a, b| b.created_on.cmp(&a.created_on));

        let doomed: Vec<String> = entries
            .into_iter()
            .enumerate()
            .filter(|(index, _)| keep_start > keep_end || *index < keep_start || *index > keep_end)
            .map(|(_, entry)| entry.id)
            .collect();
        if doomed.is_empty() {
            return Ok(());
        }

        self.storage
            .invoker()
            .invoke(DeleteDocumentsArgs {
                query: DocumentQuery::of(DocumentType::List)
                    .with_key(key)
                    .with_ids(doomed.iter().cloned()),
            })
            .await?;
        debug!(key, removed = doomed.len(), "list trimmed");
        Ok(())
    }
}

/// 把键值对转换为 `set_range_in_hash` 的输入
pub fn hash_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Vec<(String, Option<String>)>
where
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), Some(v.into())))
        .collect()
}
