//! 分布式任务调度系统的文档存储协调层
//!
//! 在文档数据库之上实现任务数据, 队列分发, 分布式锁, 服务器注册和键值读写,
//! 供任务服务器通过 [`StorageConnection`] 与 [`WriteTransaction`] 使用。

pub use scheduler_core::{
    clock::{Clock, ManualClock, SystemClock},
    config::{ExpirationConfig, LockConfig, QueueConfig, StorageConfig},
    logging::{init_logging, LogConfig, LogLevel, OutputFormat},
    retry::{RetryConfig, RetryingExecutor},
};
pub use scheduler_domain::{
    entities::{Document, DocumentType, Job, Server, State, StoredDocument},
    repositories::{DocumentQuery, DocumentStore},
    scripts::{ScriptArgs, ScriptCall, ScriptOutcome},
    value_objects::{HashMergeOutcome, InvocationData, JobData, ServerContext, StateData},
};
pub use scheduler_errors::{SchedulerError, SchedulerResult, StoreError, StoreResult};
pub use scheduler_infrastructure::{
    hash_pairs, DistributedLockHandle, DocumentStorage, DocumentStorageBuilder, ExpirationManager,
    ExpirationStats, FetchedJob, InMemoryDocumentStore, JobQueue, QueueMonitoring, QueueProvider,
    QueueProviderRegistry, StorageConnection, WriteTransaction,
};
