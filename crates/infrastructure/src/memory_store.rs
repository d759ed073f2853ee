use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use scheduler_domain::entities::{Document, DocumentType, Job, Server, StoredDocument};
use scheduler_domain::repositories::{DocumentQuery, DocumentStore};
use scheduler_domain::scripts::{
    DeleteDocumentsArgs, ExpireDocumentsArgs, HeartbeatServerArgs, ScriptArgs, ScriptCall, ScriptOutcome,
    SetJobParameterArgs, UpsertDocumentsArgs,
};
use scheduler_errors::{StoreError, StoreResult};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// 内存文档存储实现
///
/// 按文档类型分区保存文档, 每次写入分配新的 etag。脚本在写锁内执行,
/// 因此天然满足单分区原子性。适用于嵌入式部署和测试场景。
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    state: RwLock<StoreState>,
    /// 待注入的故障, 每次请求开始时弹出一个
    faults: Mutex<VecDeque<StoreError>>,
}

#[derive(Debug, Default)]
struct StoreState {
    partitions: HashMap<DocumentType, HashMap<String, StoredDocument>>,
    next_etag: u64,
    /// 每个文档ID被写入的次数
    write_counts: HashMap<String, u64>,
}

impl StoreState {
    fn partition(&self, doc_type: DocumentType) -> Option<&HashMap<String, StoredDocument>> {
        self.partitions.get(&doc_type)
    }

    fn get(&self, doc_type: DocumentType, id: &str) -> Option<&StoredDocument> {
        self.partition(doc_type).and_then(|p| p.get(id))
    }

    fn write(&mut self, document: Document) -> StoredDocument {
        self.next_etag += 1;
        let stored = StoredDocument {
            etag: self.next_etag,
            document,
        };
        let id = stored.document.id().to_string();
        *self.write_counts.entry(id.clone()).or_insert(0) += 1;
        self.partitions
            .entry(stored.document.doc_type())
            .or_default()
            .insert(id, stored.clone());
        stored
    }

    fn remove(&mut self, doc_type: DocumentType, id: &str) -> Option<StoredDocument> {
        self.partitions.get_mut(&doc_type).and_then(|p| p.remove(id))
    }

    fn matching_ids(&self, query: &DocumentQuery) -> Vec<String> {
        self.partition(query.doc_type)
            .map(|p| {
                p.values()
                    .filter(|stored| query.matches(&stored.document))
                    .map(|stored| stored.document.id().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        info!("Creating in-memory document store");
        Self::default()
    }

    /// 让下一次请求以指定错误失败
    pub fn inject_fault(&self, error: StoreError) {
        self.faults_guard().push_back(error);
    }

    pub fn inject_faults(&self, errors: impl IntoIterator<Item = StoreError>) {
        self.faults_guard().extend(errors);
    }

    pub fn pending_faults(&self) -> usize {
        self.faults_guard().len()
    }

    /// 某个文档ID累计被写入的次数(创建, 覆盖, 替换, 脚本写入都计数)
    pub async fn write_count(&self, id: &str) -> u64 {
        self.state
            .read()
            .await
            .write_counts
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    pub async fn total_writes(&self) -> u64 {
        self.state.read().await.write_counts.values().sum()
    }

    pub async fn document_count(&self, doc_type: DocumentType) -> usize {
        self.state
            .read()
            .await
            .partition(doc_type)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    fn faults_guard(&self) -> std::sync::MutexGuard<'_, VecDeque<StoreError>> {
        self.faults.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_fault(&self) -> StoreResult<()> {
        match self.faults_guard().pop_front() {
            Some(error) => {
                debug!(error = %error, "injected store fault");
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn run_set_job_parameter(state: &mut StoreState, args: &SetJobParameterArgs) -> StoreResult<u64> {
        let Some(stored) = state.get(DocumentType::Job, &args.job_id) else {
            return Ok(0);
        };
        let mut job: Job = stored
            .document
            .clone()
            .try_into()
            .map_err(|_| script_failed(SetJobParameterArgs::NAME, "文档类型不是任务"))?;
        job.set_parameter(&args.parameter.name, args.parameter.value.clone());
        state.write(job.into());
        Ok(1)
    }

    fn run_heartbeat_server(state: &mut StoreState, args: &HeartbeatServerArgs) -> StoreResult<u64> {
        let Some(stored) = state.get(DocumentType::Server, &args.server_document_id) else {
            return Ok(0);
        };
        let mut server: Server = stored
            .document
            .clone()
            .try_into()
            .map_err(|_| script_failed(HeartbeatServerArgs::NAME, "文档类型不是服务器"))?;
        server.last_heartbeat = args.heartbeat;
        state.write(server.into());
        Ok(1)
    }

    fn run_upsert_documents(state: &mut StoreState, args: &UpsertDocumentsArgs) -> StoreResult<u64> {
        args.validate()
            .map_err(|reason| script_failed(UpsertDocumentsArgs::NAME, &reason))?;
        for document in &args.documents {
            state.write(document.clone());
        }
        Ok(args.documents.len() as u64)
    }

    fn run_delete_documents(state: &mut StoreState, args: &DeleteDocumentsArgs) -> StoreResult<u64> {
        let ids = state.matching_ids(&args.query);
        for id in &ids {
            state.remove(args.query.doc_type, id);
        }
        Ok(ids.len() as u64)
    }

    /// 读取和改写在同一个写锁内完成, 不会覆盖其他写入者刚提交的值
    fn run_expire_documents(state: &mut StoreState, args: &ExpireDocumentsArgs) -> StoreResult<u64> {
        let mut stamped = Vec::new();
        for id in state.matching_ids(&args.query) {
            let Some(stored) = state.get(args.query.doc_type, &id) else {
                continue;
            };
            if stored.document.expire_on() == args.expire_on {
                continue;
            }
            let mut document = stored.document.clone();
            if !document.set_expire_on(args.expire_on) {
                return Err(script_failed(ExpireDocumentsArgs::NAME, "该分区的文档没有过期时间"));
            }
            stamped.push(document);
        }
        let affected = stamped.len() as u64;
        for document in stamped {
            state.write(document);
        }
        Ok(affected)
    }
}

fn script_failed(script: &str, reason: &str) -> StoreError {
    StoreError::ScriptFailed {
        script: script.to_string(),
        reason: reason.to_string(),
        transient: false,
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn read(&self, doc_type: DocumentType, id: &str) -> StoreResult<Option<StoredDocument>> {
        self.take_fault()?;
        Ok(self.state.read().await.get(doc_type, id).cloned())
    }

    async fn create(&self, document: Document) -> StoreResult<StoredDocument> {
        self.take_fault()?;
        let mut state = self.state.write().await;
        if state.get(document.doc_type(), document.id()).is_some() {
            return Err(StoreError::Conflict {
                id: document.id().to_string(),
            });
        }
        Ok(state.write(document))
    }

    async fn upsert(&self, document: Document) -> StoreResult<StoredDocument> {
        self.take_fault()?;
        Ok(self.state.write().await.write(document))
    }

    async fn replace(&self, document: Document, etag: u64) -> StoreResult<StoredDocument> {
        self.take_fault()?;
        let mut state = self.state.write().await;
        match state.get(document.doc_type(), document.id()) {
            None => Err(StoreError::NotFound {
                id: document.id().to_string(),
            }),
            Some(current) if current.etag != etag => Err(StoreError::PreconditionFailed {
                id: document.id().to_string(),
            }),
            Some(_) => Ok(state.write(document)),
        }
    }

    async fn delete(&self, doc_type: DocumentType, id: &str, etag: Option<u64>) -> StoreResult<bool> {
        self.take_fault()?;
        let mut state = self.state.write().await;
        match (state.get(doc_type, id), etag) {
            (None, _) => Ok(false),
            (Some(current), Some(expected)) if current.etag != expected => {
                Err(StoreError::PreconditionFailed { id: id.to_string() })
            }
            _ => Ok(state.remove(doc_type, id).is_some()),
        }
    }

    async fn query(&self, query: &DocumentQuery) -> StoreResult<Vec<StoredDocument>> {
        self.take_fault()?;
        let state = self.state.read().await;
        let mut documents: Vec<StoredDocument> = state
            .partition(query.doc_type)
            .map(|p| {
                p.values()
                    .filter(|stored| query.matches(&stored.document))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        documents.sort_by_key(|stored| stored.etag);
        Ok(documents)
    }

    async fn execute_script(&self, call: &ScriptCall) -> StoreResult<ScriptOutcome> {
        self.take_fault()?;
        let mut state = self.state.write().await;
        let affected = match call {
            ScriptCall::SetJobParameter(args) => Self::run_set_job_parameter(&mut state, args)?,
            ScriptCall::HeartbeatServer(args) => Self::run_heartbeat_server(&mut state, args)?,
            ScriptCall::UpsertDocuments(args) => Self::run_upsert_documents(&mut state, args)?,
            ScriptCall::DeleteDocuments(args) => Self::run_delete_documents(&mut state, args)?,
            ScriptCall::ExpireDocuments(args) => Self::run_expire_documents(&mut state, args)?,
        };
        debug!(script = call.name(), affected, "script executed");
        Ok(ScriptOutcome::affected(affected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use scheduler_domain::entities::{HashEntry, ListEntry, Parameter};

    fn job(id: &str) -> Job {
        Job {
            id: id.to_string(),
            invocation_data: "{}".to_string(),
            arguments: "[]".to_string(),
            parameters: vec![],
            state_id: None,
            state_name: None,
            created_on: Utc::now(),
            expire_on: None,
        }
    }

    #[tokio::test]
    async fn test_create_conflicts_on_existing_document() {
        let store = InMemoryDocumentStore::new();
        store.create(job("job-1").into()).await.unwrap();

        let result = store.create(job("job-1").into()).await;
        assert!(matches!(result, Err(StoreError::Conflict { id }) if id == "job-1"));
    }

    #[tokio::test]
    async fn test_replace_checks_etag() {
        let store = InMemoryDocumentStore::new();
        let stored = store.create(job("job-1").into()).await.unwrap();

        let updated = store.replace(job("job-1").into(), stored.etag).await.unwrap();
        assert!(updated.etag > stored.etag);

        let stale = store.replace(job("job-1").into(), stored.etag).await;
        assert!(matches!(stale, Err(StoreError::PreconditionFailed { .. })));

        let missing = store.replace(job("job-2").into(), 1).await;
        assert!(matches!(missing, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_delete_with_and_without_etag() {
        let store = InMemoryDocumentStore::new();
        let stored = store.create(job("job-1").into()).await.unwrap();

        let stale = store.delete(DocumentType::Job, "job-1", Some(stored.etag + 100)).await;
        assert!(matches!(stale, Err(StoreError::PreconditionFailed { .. })));

        assert!(store.delete(DocumentType::Job, "job-1", Some(stored.etag)).await.unwrap());
        assert!(!store.delete(DocumentType::Job, "job-1", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed_in_order() {
        let store = InMemoryDocumentStore::new();
        store.inject_faults([StoreError::Timeout, StoreError::Throttled { retry_after_ms: 5 }]);
        assert_eq!(store.pending_faults(), 2);

        assert!(matches!(store.read(DocumentType::Job, "x").await, Err(StoreError::Timeout)));
        assert!(matches!(
            store.read(DocumentType::Job, "x").await,
            Err(StoreError::Throttled { .. })
        ));
        assert!(store.read(DocumentType::Job, "x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_job_parameter_script() {
        let store = InMemoryDocumentStore::new();
        store.create(job("job-1").into()).await.unwrap();

        let call = ScriptCall::from(SetJobParameterArgs {
            job_id: "job-1".to_string(),
            parameter: Parameter {
                name: "RetryCount".to_string(),
                value: Some("1".to_string()),
            },
        });
        assert_eq!(store.execute_script(&call).await.unwrap().affected, 1);

        let stored = store.read(DocumentType::Job, "job-1").await.unwrap().unwrap();
        let job: Job = stored.document.try_into().unwrap();
        assert_eq!(job.parameter("RetryCount"), Some("1"));

        let missing = ScriptCall::from(SetJobParameterArgs {
            job_id: "job-404".to_string(),
            parameter: Parameter {
                name: "RetryCount".to_string(),
                value: None,
            },
        });
        assert_eq!(store.execute_script(&missing).await.unwrap().affected, 0);
    }

    #[tokio::test]
    async fn test_upsert_documents_is_all_or_nothing() {
        let store = InMemoryDocumentStore::new();
        let now = Utc::now();
        let call = ScriptCall::from(UpsertDocumentsArgs {
            partition: DocumentType::Hash,
            documents: vec![
                HashEntry::new("k", "a", Some("1".to_string()), now).into(),
                ListEntry::new("k", "x", now).into(),
            ],
        });

        let result = store.execute_script(&call).await;
        assert!(matches!(
            result,
            Err(StoreError::ScriptFailed { transient: false, .. })
        ));
        assert_eq!(store.document_count(DocumentType::Hash).await, 0);
        assert_eq!(store.total_writes().await, 0);
    }

    #[tokio::test]
    async fn test_delete_documents_by_query() {
        let store = InMemoryDocumentStore::new();
        let now = Utc::now();
        for field in ["a", "b", "c"] {
            store
                .upsert(HashEntry::new("job:1", field, None, now).into())
                .await
                .unwrap();
        }
        store
            .upsert(HashEntry::new("job:2", "a", None, now).into())
            .await
            .unwrap();

        let call = ScriptCall::from(DeleteDocumentsArgs {
            query: DocumentQuery::of(DocumentType::Hash).with_key("job:1"),
        });
        assert_eq!(store.execute_script(&call).await.unwrap().affected, 3);
        assert_eq!(store.document_count(DocumentType::Hash).await, 1);
    }

    #[tokio::test]
    async fn test_expire_documents_stamps_current_values() {
        let store = InMemoryDocumentStore::new();
        let now = Utc::now();
        store
            .upsert(HashEntry::new("job:1", "a", Some("1".to_string()), now).into())
            .await
            .unwrap();
        store
            .upsert(HashEntry::new("job:1", "a", Some("2".to_string()), now).into())
            .await
            .unwrap();

        let call = ScriptCall::from(ExpireDocumentsArgs {
            query: DocumentQuery::of(DocumentType::Hash).with_key("job:1"),
            expire_on: Some(100),
        });
        assert_eq!(store.execute_script(&call).await.unwrap().affected, 1);
        // 过期时间没有变化时不重复写入
        assert_eq!(store.execute_script(&call).await.unwrap().affected, 0);

        let id = HashEntry::new("job:1", "a", None, now).id;
        let stored = store.read(DocumentType::Hash, &id).await.unwrap().unwrap();
        let entry: HashEntry = stored.document.try_into().unwrap();
        assert_eq!(entry.value.as_deref(), Some("2"));
        assert_eq!(entry.expire_on, Some(100));
    }

    #[tokio::test]
    async fn test_expire_documents_rejects_partitions_without_expiry() {
        let store = InMemoryDocumentStore::new();
        store
            .upsert(
                Server {
                    id: Server::document_id("s1"),
                    server_id: "s1".to_string(),
                    workers: 1,
                    queues: vec![],
                    created_on: Utc::now(),
                    last_heartbeat: 0,
                }
                .into(),
            )
            .await
            .unwrap();

        let call = ScriptCall::from(ExpireDocumentsArgs {
            query: DocumentQuery::of(DocumentType::Server),
            expire_on: Some(100),
        });
        assert!(matches!(
            store.execute_script(&call).await,
            Err(StoreError::ScriptFailed { transient: false, .. })
        ));
    }
}
