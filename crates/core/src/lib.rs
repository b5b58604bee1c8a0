pub mod clock;
pub mod config;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod metrics;
pub mod registry;
pub mod results;
pub mod store;
pub mod worker;

pub use clock::{Clock, IntervalTicker, ManualClock, ManualTicker, SystemClock, TickHandle, Ticker};
pub use config::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};
pub use domain::{
    canonical_json, ContentHash, NewStep, Priority, StepCounts, StepKey, StepRecord, StepStatus,
    TaskId, TaskRecord, TaskStatus,
};
pub use engine::{EngineSettings, QueueEngine, TaskAudit, TaskBuilder, TaskSnapshot};
pub use errors::{
    EngineError, HandlerError, RegistryError, ResultStoreError, StoreError, WorkerError,
};
pub use metrics::{EngineMetrics, StepGauges};
pub use registry::{HandlerRegistry, StepHandler};
pub use results::{FsResultStore, InMemoryResultStore, ResultStore, StoredResult};
pub use store::{InMemoryKvStore, KvStore, KvTransaction};
pub use worker::{Reaper, StepContext, StepOutcome, Worker, WorkerPool, WorkerSettings};
