pub mod clock;
pub mod config;
pub mod logging;
pub mod retry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::*;
pub use logging::{init_logging, LogConfig, LogLevel, OutputFormat};
pub use retry::{RetryConfig, RetryingExecutor};

pub use scheduler_errors::{SchedulerError, SchedulerResult, StoreError, StoreResult};
