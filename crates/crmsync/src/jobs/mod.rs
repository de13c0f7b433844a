pub mod classify;
pub mod error_codes;
pub mod model;
pub mod retry;

pub mod store;
pub use store::{QueueSettings, QueueStore, StoreError, StoreResult};

pub mod pg_store;
pub mod sqlite_store;
pub use pg_store::PgQueueStore;
pub use sqlite_store::SqliteQueueStore;

pub mod runner;
pub use runner::{BatchProcessResult, CrmSync, Dispatcher, DispatcherConfig, SyncSuccess};

pub mod maintenance;
pub use maintenance::{cutoff_days, run_maintenance, MaintenanceReport};

pub mod metrics;
pub use metrics::{ErrorStats, StatusCounts};

pub use classify::{classify, ErrorRecord, SyncFailure};
pub use error_codes::ErrorCategory;
pub use model::{DeadLetterReason, EnqueueOptions, NewSyncJob, SyncJob, SyncStatus};
