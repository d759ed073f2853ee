use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use scheduler_core::clock::Clock;
use scheduler_core::retry::RetryingExecutor;
use scheduler_domain::entities::{Document, DocumentType, HashEntry};
use scheduler_domain::repositories::{DocumentQuery, DocumentStore};
use scheduler_domain::scripts::UpsertDocumentsArgs;
use scheduler_domain::value_objects::HashMergeOutcome;
use scheduler_errors::{SchedulerError, SchedulerResult};
use tracing::{debug, warn};

use crate::distributed_lock::DistributedLockManager;
use crate::script_invoker::ScriptInvoker;

/// 可以解析为 RFC 3339 时间的值统一保存为 Unix 秒
pub fn normalize_value(value: Option<&str>) -> Option<String> {
    value.map(|v| match DateTime::parse_from_rfc3339(v.trim()) {
        Ok(parsed) => parsed.timestamp().to_string(),
        Err(_) => v.to_string(),
    })
}

fn same_value(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.to_lowercase() == b.to_lowercase(),
        (None, None) => true,
        _ => false,
    }
}

/// 一次哈希合并需要写入的文档
#[derive(Debug, Clone, Default)]
pub struct HashMergePlan {
    pub documents: Vec<Document>,
    pub outcome: HashMergeOutcome,
}

/// 对比已有字段, 只为新增字段和值发生变化的字段生成写入
///
/// `existing` 中已过期的条目应当事先剔除, 它们会被同ID的新条目覆盖。
pub fn plan_merge<I>(key: &str, existing: &[HashEntry], incoming: I, now: DateTime<Utc>) -> HashMergePlan
where
    I: IntoIterator<Item = (String, Option<String>)>,
{
    let by_field: HashMap<&str, &HashEntry> = existing.iter().map(|e| (e.field.as_str(), e)).collect();

    // 同一个字段出现多次时以最后一次为准
    let mut staged: HashMap<String, Option<String>> = HashMap::new();
    for (field, value) in incoming {
        staged.insert(field, normalize_value(value.as_deref()));
    }

    let mut plan = HashMergePlan::default();
    for (field, value) in staged {
        match by_field.get(field.as_str()) {
            None => {
                plan.documents.push(HashEntry::new(key, &field, value, now).into());
                plan.outcome.inserted += 1;
            }
            Some(current) if !same_value(current.value.as_deref(), value.as_deref()) => {
                let mut updated = (*current).clone();
                updated.value = value;
                plan.documents.push(updated.into());
                plan.outcome.updated += 1;
            }
            Some(_) => plan.outcome.unchanged += 1,
        }
    }
    plan
}

/// 哈希批量合并
///
/// 合并在 `hash:{key}` 分布式锁内完成, 整批写入通过一次 `upsertDocuments` 脚本提交,
/// 不会出现部分字段生效的中间状态。
#[derive(Clone)]
pub struct HashRangeMerger {
    store: Arc<dyn DocumentStore>,
    executor: RetryingExecutor,
    invoker: ScriptInvoker,
    locks: DistributedLockManager,
    clock: Arc<dyn Clock>,
    lock_timeout: Duration,
}

impl HashRangeMerger {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        executor: RetryingExecutor,
        invoker: ScriptInvoker,
        locks: DistributedLockManager,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let lock_timeout = locks.config().default_acquire_timeout();
        Self {
            store,
            executor,
            invoker,
            locks,
            clock,
            lock_timeout,
        }
    }

    pub fn lock_resource(key: &str) -> String {
        format!("hash:{key}")
    }

    pub async fn set_range<I>(&self, key: &str, pairs: I) -> SchedulerResult<HashMergeOutcome>
    where
        I: IntoIterator<Item = (String, Option<String>)>,
    {
        if key.trim().is_empty() {
            return Err(SchedulerError::invalid_argument("哈希键不能为空"));
        }
        let pairs: Vec<(String, Option<String>)> = pairs.into_iter().collect();

        let lock = self
            .locks
            .acquire(&Self::lock_resource(key), self.lock_timeout)
            .await?;
        let result = self.merge(key, pairs).await;
        if let Err(e) = lock.release().await {
            warn!(key, error = %e, "failed to release hash lock, lease will expire");
        }
        result
    }

    async fn merge(&self, key: &str, pairs: Vec<(String, Option<String>)>) -> SchedulerResult<HashMergeOutcome> {
        let now = self.clock.now();
        let query = DocumentQuery::of(DocumentType::Hash).with_key(key);
        let existing: Vec<HashEntry> = self
            .executor
            .execute("hash.query", || self.store.query(&query))
            .await?
            .into_iter()
            .filter(|stored| !stored.document.is_expired(now.timestamp()))
            .filter_map(|stored| HashEntry::try_from(stored.document).ok())
            .collect();

        let plan = plan_merge(key, &existing, pairs, now);
        if plan.documents.is_empty() {
            debug!(key, unchanged = plan.outcome.unchanged, "hash already up to date");
            return Ok(plan.outcome);
        }

        self.invoker
            .invoke(UpsertDocumentsArgs {
                partition: DocumentType::Hash,
                documents: plan.documents,
            })
            .await?;

        debug!(
            key,
            inserted = plan.outcome.inserted,
            updated = plan.outcome.updated,
            unchanged = plan.outcome.unchanged,
            "hash range merged"
        );
        Ok(plan.outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryDocumentStore;
    use scheduler_core::clock::ManualClock;
    use scheduler_core::config::LockConfig;
    use scheduler_core::retry::RetryConfig;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, Option<String>)> {
        items
            .iter()
            .map(|(f, v)| (f.to_string(), Some(v.to_string())))
            .collect()
    }

    fn merger(store: Arc<InMemoryDocumentStore>) -> HashRangeMerger {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());
        let executor = RetryingExecutor::new(RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            backoff_multiplier: 2.0,
        });
        let locks = DistributedLockManager::new(
            store.clone(),
            executor.clone(),
            clock.clone(),
            LockConfig {
                default_acquire_timeout_seconds: 1,
                ..LockConfig::default()
            },
        );
        let invoker = ScriptInvoker::new(store.clone(), executor.clone());
        HashRangeMerger::new(store, executor, invoker, locks, clock)
    }

    #[test]
    fn test_normalize_timestamp_values() {
        assert_eq!(
            normalize_value(Some("2024-01-01T00:00:00Z")),
            Some("1704067200".to_string())
        );
        assert_eq!(
            normalize_value(Some("2024-01-01T08:00:00+08:00")),
            Some("1704067200".to_string())
        );
        assert_eq!(normalize_value(Some("Enqueued")), Some("Enqueued".to_string()));
        assert_eq!(normalize_value(None), None);
    }

    #[test]
    fn test_plan_skips_case_insensitive_matches() {
        let now = Utc::now();
        let existing = vec![
            HashEntry::new("k", "state", Some("Enqueued".to_string()), now),
            HashEntry::new("k", "queue", Some("default".to_string()), now),
        ];
        let plan = plan_merge(
            "k",
            &existing,
            pairs(&[("state", "ENQUEUED"), ("queue", "critical"), ("cron", "* * * * *")]),
            now,
        );
        assert_eq!(
            plan.outcome,
            HashMergeOutcome {
                inserted: 1,
                updated: 1,
                unchanged: 1
            }
        );
        assert_eq!(plan.documents.len(), 2);
    }

    #[test]
    fn test_plan_last_duplicate_wins() {
        let now = Utc::now();
        let plan = plan_merge("k", &[], pairs(&[("a", "1"), ("a", "2")]), now);
        assert_eq!(plan.outcome.inserted, 1);
        assert_eq!(plan.documents[0].value(), Some("2"));
    }

    #[tokio::test]
    async fn test_set_range_is_idempotent() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let merger = merger(store.clone());

        let first = merger.set_range("job:1", pairs(&[("a", "1"), ("b", "2")])).await.unwrap();
        assert_eq!(first.inserted, 2);
        let writes_after_first = store.total_writes().await;

        let second = merger.set_range("job:1", pairs(&[("a", "1"), ("b", "2")])).await.unwrap();
        assert_eq!(second.writes(), 0);
        assert_eq!(second.unchanged, 2);

        // 第二次只有锁文档的写入, 没有哈希写入
        let hash_a = HashEntry::new("job:1", "a", None, Utc::now()).id;
        assert_eq!(store.write_count(&hash_a).await, 1);
        assert!(store.total_writes().await > writes_after_first);
        assert_eq!(store.document_count(DocumentType::Hash).await, 2);
        assert_eq!(store.document_count(DocumentType::Lock).await, 0);
    }

    #[tokio::test]
    async fn test_empty_key_is_rejected() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let merger = merger(store);
        assert!(matches!(
            merger.set_range("", pairs(&[("a", "1")])).await,
            Err(SchedulerError::InvalidArgument(_))
        ));
    }
}
