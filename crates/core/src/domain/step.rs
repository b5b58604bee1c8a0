use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::hash::ContentHash;
use crate::domain::task::TaskId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Identity of a step: the owning task plus its per-task index.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepKey {
    pub task_id: TaskId,
    pub step_idx: u32,
}

impl StepKey {
    pub fn new(task_id: TaskId, step_idx: u32) -> Self {
        Self { task_id, step_idx }
    }
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.task_id, self.step_idx)
    }
}

/// Dequeue priority, lower values are served first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub u32);

impl Priority {
    pub const HIGHEST: Self = Self(0);
    pub const NORMAL: Self = Self(100);
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub task_id: TaskId,
    pub step_idx: u32,
    pub parent_step: Option<u32>,
    pub handler_name: String,
    pub input: Value,
    pub input_hash: ContentHash,
    pub output_hash: Option<ContentHash>,
    pub status: StepStatus,
    pub priority: Priority,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub owner_worker_id: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub lease_duration_ms: Option<u64>,
    pub error_message: Option<String>,
    pub result_location: Option<String>,
}

impl StepRecord {
    pub fn key(&self) -> StepKey {
        StepKey::new(self.task_id.clone(), self.step_idx)
    }

    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.status == StepStatus::Running && self.owner_worker_id.as_deref() == Some(worker_id)
    }

    pub(crate) fn clear_lease(&mut self) {
        self.owner_worker_id = None;
        self.lease_expires_at = None;
        self.lease_duration_ms = None;
    }
}

/// A step to be persisted by `QueueEngine::enqueue`.
#[derive(Clone, Debug, PartialEq)]
pub struct NewStep {
    pub task_id: TaskId,
    pub parent_step: Option<u32>,
    pub handler_name: String,
    pub input: Value,
    pub priority: Option<Priority>,
}

impl NewStep {
    pub fn new(task_id: TaskId, handler_name: impl Into<String>, input: Value) -> Self {
        Self { task_id, parent_step: None, handler_name: handler_name.into(), input, priority: None }
    }

    pub fn with_parent(mut self, parent_step: u32) -> Self {
        self.parent_step = Some(parent_step);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{Priority, StepKey, StepStatus};
    use crate::domain::task::TaskId;

    #[test]
    fn step_status_parse_is_case_insensitive() {
        assert_eq!(StepStatus::parse(" Running "), Some(StepStatus::Running));
        assert_eq!(StepStatus::parse("DONE"), Some(StepStatus::Done));
        assert_eq!(StepStatus::parse("queued"), None);
    }

    #[test]
    fn only_done_and_failed_are_terminal() {
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        assert!(StepStatus::Done.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
    }

    #[test]
    fn lower_priority_values_sort_first() {
        assert!(Priority::HIGHEST < Priority::NORMAL);
        assert_eq!(Priority::default(), Priority(100));
    }

    #[test]
    fn step_key_displays_task_and_index() {
        let key = StepKey::new(TaskId("abc".to_string()), 7);
        assert_eq!(key.to_string(), "abc#7");
    }
}
