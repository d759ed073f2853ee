pub mod entities;
pub mod repositories;
pub mod scripts;
pub mod value_objects;

pub use entities::*;
pub use repositories::*;
pub use scheduler_errors::{SchedulerError, SchedulerResult, StoreError, StoreResult};
pub use scripts::*;
pub use value_objects::*;
