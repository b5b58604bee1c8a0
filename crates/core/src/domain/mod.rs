pub mod hash;
pub mod keys;
pub mod step;
pub mod task;

pub use hash::{canonical_json, ContentHash};
pub use step::{NewStep, Priority, StepKey, StepRecord, StepStatus};
pub use task::{StepCounts, TaskId, TaskRecord, TaskStatus};
