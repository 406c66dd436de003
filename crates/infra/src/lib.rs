//! Infrastructure layer: record store backends, the compilation queue, rate
//! limiting, the compiler sandbox and the worker.

pub mod config;
pub mod queue;
pub mod rate_limit;
pub mod sandbox;
pub mod store;
pub mod worker;

pub use config::{ConfigError, Settings};
pub use queue::{ArtifactLookup, CompilationQueue, QueueConfig, QueueError, QueueStats};
pub use rate_limit::{RateLimitDecision, RateLimitPolicy, RateLimiter};
pub use sandbox::{
    CompileOptions, CompileOutput, CompileRequest, Sandbox, SandboxConfig, TectonicSandbox,
};
pub use store::{InMemoryRecordStore, KeySpace, RecordStore, StoreError};
#[cfg(feature = "redis")]
pub use store::RedisRecordStore;
pub use worker::{CompilationWorker, WorkerConfig, WorkerError, WorkerHandle, WorkerStats};
