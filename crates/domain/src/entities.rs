use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 文档类型, 同时也是存储的分区键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Job,
    State,
    Set,
    Hash,
    List,
    Counter,
    Server,
    Lock,
    Queue,
}

impl DocumentType {
    pub const ALL: [DocumentType; 9] = [
        DocumentType::Job,
        DocumentType::State,
        DocumentType::Set,
        DocumentType::Hash,
        DocumentType::List,
        DocumentType::Counter,
        DocumentType::Server,
        DocumentType::Lock,
        DocumentType::Queue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Job => "job",
            DocumentType::State => "state",
            DocumentType::Set => "set",
            DocumentType::Hash => "hash",
            DocumentType::List => "list",
            DocumentType::Counter => "counter",
            DocumentType::Server => "server",
            DocumentType::Lock => "lock",
            DocumentType::Queue => "queue",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 由若干组成部分生成稳定的文档ID
///
/// 同样的输入总是得到同样的ID, 重复写入只会覆盖而不会产生重复文档。
pub fn deterministic_id(parts: &[&str]) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, parts.join("\u{1f}").as_bytes()).to_string()
}

pub fn new_document_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// 序列化后的调用信息
    pub invocation_data: String,
    /// 序列化后的调用参数
    pub arguments: String,
    pub parameters: Vec<Parameter>,
    /// 当前状态文档ID(弱引用)
    pub state_id: Option<String>,
    pub state_name: Option<String>,
    pub created_on: DateTime<Utc>,
    pub expire_on: Option<i64>,
}

impl Job {
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .and_then(|p| p.value.as_deref())
    }

    /// 同名参数原位替换, 否则追加到末尾
    pub fn set_parameter(&mut self, name: &str, value: Option<String>) {
        match self.parameters.iter_mut().find(|p| p.name == name) {
            Some(existing) => existing.value = value,
            None => self.parameters.push(Parameter {
                name: name.to_string(),
                value,
            }),
        }
    }
}

/// 任务状态, 写入后不再修改(过期时间随任务一起调整)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub id: String,
    pub job_id: String,
    pub name: String,
    pub reason: Option<String>,
    pub data: HashMap<String, String>,
    pub created_on: DateTime<Utc>,
    pub expire_on: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetEntry {
    pub id: String,
    pub key: String,
    pub value: String,
    pub score: f64,
    pub created_on: DateTime<Utc>,
    pub expire_on: Option<i64>,
}

impl SetEntry {
    pub fn new(key: &str, value: &str, score: f64, now: DateTime<Utc>) -> Self {
        Self {
            id: deterministic_id(&[DocumentType::Set.as_str(), key, value]),
            key: key.to_string(),
            value: value.to_string(),
            score,
            created_on: now,
            expire_on: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashEntry {
    pub id: String,
    pub key: String,
    pub field: String,
    pub value: Option<String>,
    pub created_on: DateTime<Utc>,
    pub expire_on: Option<i64>,
}

impl HashEntry {
    /// ID 由 (key, field) 决定, 保证同一个哈希中字段唯一
    pub fn new(key: &str, field: &str, value: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: deterministic_id(&[DocumentType::Hash.as_str(), key, field]),
            key: key.to_string(),
            field: field.to_string(),
            value,
            created_on: now,
            expire_on: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListEntry {
    pub id: String,
    pub key: String,
    pub value: String,
    pub created_on: DateTime<Utc>,
    pub expire_on: Option<i64>,
}

impl ListEntry {
    pub fn new(key: &str, value: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: new_document_id(),
            key: key.to_string(),
            value: value.to_string(),
            created_on: now,
            expire_on: None,
        }
    }
}

/// 计数器增量记录, 逻辑值为同一 key 下所有记录之和
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    pub id: String,
    pub key: String,
    pub value: i64,
    pub created_on: DateTime<Utc>,
    pub expire_on: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub server_id: String,
    pub workers: u32,
    pub queues: Vec<String>,
    pub created_on: DateTime<Utc>,
    /// 最近一次心跳(Unix 秒)
    pub last_heartbeat: i64,
}

impl Server {
    pub fn document_id(server_id: &str) -> String {
        deterministic_id(&[server_id, DocumentType::Server.as_str()])
    }
}

/// 分布式锁租约
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    pub id: String,
    pub resource: String,
    pub owner: String,
    pub created_on: DateTime<Utc>,
    pub expire_on: i64,
}

impl Lock {
    pub fn document_id(resource: &str) -> String {
        deterministic_id(&[resource, DocumentType::Lock.as_str()])
    }

    pub fn is_expired(&self, now_epoch: i64) -> bool {
        self.expire_on <= now_epoch
    }
}

/// 队列中的任务引用
///
/// `fetched_at` 非空表示已被某个 worker 取走, 在不可见超时之前其他 worker 不能再取。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub queue: String,
    pub job_id: String,
    pub created_on: DateTime<Utc>,
    pub fetched_at: Option<i64>,
    pub fetched_by: Option<String>,
}

impl QueueItem {
    pub fn new(queue: &str, job_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: new_document_id(),
            queue: queue.to_string(),
            job_id: job_id.to_string(),
            created_on: now,
            fetched_at: None,
            fetched_by: None,
        }
    }

    /// 未被取走, 或上一次取走已超过不可见超时
    pub fn is_available(&self, now_epoch: i64, invisibility_timeout_seconds: i64) -> bool {
        match self.fetched_at {
            None => true,
            Some(fetched_at) => fetched_at + invisibility_timeout_seconds <= now_epoch,
        }
    }
}

/// 存储中的一个文档, 以 `type` 字段区分种类
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Document {
    Job(Job),
    State(State),
    Set(SetEntry),
    Hash(HashEntry),
    List(ListEntry),
    Counter(Counter),
    Server(Server),
    Lock(Lock),
    Queue(QueueItem),
}

macro_rules! document_variant {
    ($variant:ident, $ty:ty) => {
        impl From<$ty> for Document {
            fn from(value: $ty) -> Self {
                Document::$variant(value)
            }
        }

        impl TryFrom<Document> for $ty {
            type Error = Document;

            fn try_from(document: Document) -> Result<Self, Self::Error> {
                match document {
                    Document::$variant(value) => Ok(value),
                    other => Err(other),
                }
            }
        }
    };
}

document_variant!(Job, Job);
document_variant!(State, State);
document_variant!(Set, SetEntry);
document_variant!(Hash, HashEntry);
document_variant!(List, ListEntry);
document_variant!(Counter, Counter);
document_variant!(Server, Server);
document_variant!(Lock, Lock);
document_variant!(Queue, QueueItem);

impl Document {
    pub fn doc_type(&self) -> DocumentType {
        match self {
            Document::Job(_) => DocumentType::Job,
            Document::State(_) => DocumentType::State,
            Document::Set(_) => DocumentType::Set,
            Document::Hash(_) => DocumentType::Hash,
            Document::List(_) => DocumentType::List,
            Document::Counter(_) => DocumentType::Counter,
            Document::Server(_) => DocumentType::Server,
            Document::Lock(_) => DocumentType::Lock,
            Document::Queue(_) => DocumentType::Queue,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Document::Job(d) => &d.id,
            Document::State(d) => &d.id,
            Document::Set(d) => &d.id,
            Document::Hash(d) => &d.id,
            Document::List(d) => &d.id,
            Document::Counter(d) => &d.id,
            Document::Server(d) => &d.id,
            Document::Lock(d) => &d.id,
            Document::Queue(d) => &d.id,
        }
    }

    /// 查询用的分组键: 集合/哈希/列表/计数器的 key, 状态所属任务, 队列名, 锁资源名
    pub fn key(&self) -> Option<&str> {
        match self {
            Document::Set(d) => Some(&d.key),
            Document::Hash(d) => Some(&d.key),
            Document::List(d) => Some(&d.key),
            Document::Counter(d) => Some(&d.key),
            Document::State(d) => Some(&d.job_id),
            Document::Queue(d) => Some(&d.queue),
            Document::Lock(d) => Some(&d.resource),
            Document::Job(_) | Document::Server(_) => None,
        }
    }

    /// 集合/列表/哈希的值, 队列项对应的任务ID
    pub fn value(&self) -> Option<&str> {
        match self {
            Document::Set(d) => Some(&d.value),
            Document::List(d) => Some(&d.value),
            Document::Hash(d) => d.value.as_deref(),
            Document::Queue(d) => Some(&d.job_id),
            _ => None,
        }
    }

    pub fn field(&self) -> Option<&str> {
        match self {
            Document::Hash(d) => Some(&d.field),
            _ => None,
        }
    }

    pub fn expire_on(&self) -> Option<i64> {
        match self {
            Document::Job(d) => d.expire_on,
            Document::State(d) => d.expire_on,
            Document::Set(d) => d.expire_on,
            Document::Hash(d) => d.expire_on,
            Document::List(d) => d.expire_on,
            Document::Counter(d) => d.expire_on,
            Document::Lock(d) => Some(d.expire_on),
            Document::Server(_) | Document::Queue(_) => None,
        }
    }

    /// 设置或清除过期时间; 锁, 服务器和队列项没有可调整的过期时间, 返回 false
    pub fn set_expire_on(&mut self, expire_on: Option<i64>) -> bool {
        let slot = match self {
            Document::Job(d) => &mut d.expire_on,
            Document::State(d) => &mut d.expire_on,
            Document::Set(d) => &mut d.expire_on,
            Document::Hash(d) => &mut d.expire_on,
            Document::List(d) => &mut d.expire_on,
            Document::Counter(d) => &mut d.expire_on,
            Document::Lock(_) | Document::Server(_) | Document::Queue(_) => return false,
        };
        *slot = expire_on;
        true
    }

    pub fn last_heartbeat(&self) -> Option<i64> {
        match self {
            Document::Server(d) => Some(d.last_heartbeat),
            _ => None,
        }
    }

    /// 已过期的文档在读取时视为不存在
    pub fn is_expired(&self, now_epoch: i64) -> bool {
        self.expire_on().is_some_and(|expire_on| expire_on <= now_epoch)
    }
}

/// 带版本号的文档, `etag` 用于条件写入
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub etag: u64,
    pub document: Document,
}
