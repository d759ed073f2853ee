pub mod app_config;
pub mod coordination;

// Re-export main types for easier imports
pub use app_config::StorageConfig;
pub use coordination::{ExpirationConfig, LockConfig, QueueConfig};
