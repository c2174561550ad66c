pub mod chunk;
pub mod config;
pub mod error;
pub mod filter;
pub mod lines;
pub mod loader;
pub mod metrics;
pub mod output;
pub mod pool;
pub mod record;
pub mod refill;
pub mod resource_pool;
pub mod retry;
pub mod sources;
pub mod task;


pub use chunk::Chunk;
pub use config::{LoadMode, RunConfig};
pub use error::AppError;
pub use filter::{Generation, RemovalSets};
pub use loader::{HelperLoader, Loader, SourceLoader, StreamingLoader, load_sources};
pub use metrics::{Metrics, MetricsSnapshot};
pub use output::ResultFile;
pub use pool::{
    DrainHold, PoolEvent, PoolHandle, PoolReporter, TaskPool, TaskPoolConfig, TracingPoolReporter,
};
pub use record::{Field, Record, RecordSchema, parse_line};
pub use refill::{RefillConfig, RefillOrchestrator, RefillSummary, StopReason};
pub use resource_pool::{ResourcePool, ResourceStats};
pub use retry::{RetryPolicy, run_with_retries};
pub use task::{PoolState, TaskContext, TaskExecutor, TaskOutcome, TaskState};
