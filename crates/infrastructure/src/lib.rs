pub mod connection;
pub mod distributed_lock;
pub mod expiration;
pub mod hash_merge;
pub mod memory_store;
pub mod projections;
pub mod queue;
pub mod script_invoker;
pub mod server_registry;
pub mod storage;
pub mod transaction;

pub use connection::StorageConnection;
pub use distributed_lock::{DistributedLockHandle, DistributedLockManager};
pub use expiration::{ExpirationManager, ExpirationStats};
pub use hash_merge::{normalize_value, plan_merge, HashMergePlan, HashRangeMerger};
pub use memory_store::InMemoryDocumentStore;
pub use projections::ReadProjections;
pub use queue::{
    DocumentFetchedJob, DocumentJobQueue, DocumentQueueProvider, FetchedJob, JobQueue, QueueMonitoring,
    QueueProvider, QueueProviderRegistry,
};
pub use script_invoker::ScriptInvoker;
pub use server_registry::ServerRegistry;
pub use storage::{DocumentStorage, DocumentStorageBuilder};
pub use transaction::{hash_pairs, WriteTransaction};
