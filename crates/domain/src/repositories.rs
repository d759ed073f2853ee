//! 文档存储抽象
//!
//! 描述底层文档数据库客户端需要提供的能力: 单文档读写, 基于 etag 的条件写入,
//! 按条件查询以及在单个分区内原子执行的存储端脚本。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use scheduler_errors::StoreResult;

use crate::entities::{Document, DocumentType, StoredDocument};
use crate::scripts::{ScriptCall, ScriptOutcome};

/// 文档查询条件, 所有条件之间是"与"关系
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentQuery {
    pub doc_type: DocumentType,
    pub key: Option<String>,
    pub value: Option<String>,
    pub field: Option<String>,
    pub expire_on_at_or_before: Option<i64>,
    pub last_heartbeat_at_or_before: Option<i64>,
    /// 只匹配这些文档ID
    pub ids: Option<Vec<String>>,
}

impl DocumentQuery {
    pub fn of(doc_type: DocumentType) -> Self {
        Self {
            doc_type,
            key: None,
            value: None,
            field: None,
            expire_on_at_or_before: None,
            last_heartbeat_at_or_before: None,
            ids: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn expiring_at_or_before(mut self, epoch: i64) -> Self {
        self.expire_on_at_or_before = Some(epoch);
        self
    }

    pub fn heartbeat_at_or_before(mut self, epoch: i64) -> Self {
        self.last_heartbeat_at_or_before = Some(epoch);
        self
    }

    pub fn with_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn matches(&self, document: &Document) -> bool {
        if document.doc_type() != self.doc_type {
            return false;
        }
        if let Some(key) = &self.key {
            if document.key() != Some(key.as_str()) {
                return false;
            }
        }
        if let Some(value) = &self.value {
            if document.value() != Some(value.as_str()) {
                return false;
            }
        }
        if let Some(field) = &self.field {
            if document.field() != Some(field.as_str()) {
                return false;
            }
        }
        if let Some(cutoff) = self.expire_on_at_or_before {
            if !document.expire_on().is_some_and(|e| e <= cutoff) {
                return false;
            }
        }
        if let Some(cutoff) = self.last_heartbeat_at_or_before {
            if !document.last_heartbeat().is_some_and(|h| h <= cutoff) {
                return false;
            }
        }
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == document.id()) {
                return false;
            }
        }
        true
    }
}

/// 文档存储客户端抽象
///
/// 实现只负责把请求交给存储并如实报告错误类别, 不做重试。
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn read(&self, doc_type: DocumentType, id: &str) -> StoreResult<Option<StoredDocument>>;

    /// 文档已存在时返回 `Conflict`
    async fn create(&self, document: Document) -> StoreResult<StoredDocument>;

    async fn upsert(&self, document: Document) -> StoreResult<StoredDocument>;

    /// 条件替换: 文档不存在返回 `NotFound`, etag 不匹配返回 `PreconditionFailed`
    async fn replace(&self, document: Document, etag: u64) -> StoreResult<StoredDocument>;

    /// 删除文档, 不存在时返回 `Ok(false)`; 指定 etag 且不匹配时返回 `PreconditionFailed`
    async fn delete(&self, doc_type: DocumentType, id: &str, etag: Option<u64>) -> StoreResult<bool>;

    async fn query(&self, query: &DocumentQuery) -> StoreResult<Vec<StoredDocument>>;

    async fn execute_script(&self, call: &ScriptCall) -> StoreResult<ScriptOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Counter, HashEntry, Server};
    use chrono::Utc;

    #[test]
    fn test_query_matches_key_and_field() {
        let now = Utc::now();
        let entry: Document = HashEntry::new("job:1", "a", Some("1".to_string()), now).into();

        assert!(DocumentQuery::of(DocumentType::Hash).matches(&entry));
        assert!(DocumentQuery::of(DocumentType::Hash)
            .with_key("job:1")
            .with_field("a")
            .matches(&entry));
        assert!(!DocumentQuery::of(DocumentType::Hash)
            .with_key("job:2")
            .matches(&entry));
        assert!(!DocumentQuery::of(DocumentType::Set)
            .with_key("job:1")
            .matches(&entry));
    }

    #[test]
    fn test_query_matches_id_list() {
        let now = Utc::now();
        let a = HashEntry::new("job:1", "a", None, now);
        let b: Document = HashEntry::new("job:1", "b", None, now).into();
        let query = DocumentQuery::of(DocumentType::Hash).with_key("job:1").with_ids([a.id.clone()]);

        assert!(query.matches(&a.into()));
        assert!(!query.matches(&b));
        assert!(!DocumentQuery::of(DocumentType::Hash)
            .with_ids(Vec::<String>::new())
            .matches(&b));
    }

    #[test]
    fn test_query_expiry_cutoff() {
        let counter: Document = Counter {
            id: "c".to_string(),
            key: "stats:succeeded".to_string(),
            value: 1,
            created_on: Utc::now(),
            expire_on: Some(100),
        }
        .into();

        let query = DocumentQuery::of(DocumentType::Counter);
        assert!(query.clone().expiring_at_or_before(100).matches(&counter));
        assert!(!query.expiring_at_or_before(99).matches(&counter));
    }

    #[test]
    fn test_query_heartbeat_cutoff() {
        let server: Document = Server {
            id: Server::document_id("s1"),
            server_id: "s1".to_string(),
            workers: 4,
            queues: vec!["default".to_string()],
            created_on: Utc::now(),
            last_heartbeat: 1_000,
        }
        .into();

        let query = DocumentQuery::of(DocumentType::Server);
        assert!(query.clone().heartbeat_at_or_before(1_000).matches(&server));
        assert!(!query.heartbeat_at_or_before(999).matches(&server));
    }
}
