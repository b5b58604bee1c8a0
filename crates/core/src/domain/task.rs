use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::step::StepStatus;
use crate::errors::EngineError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
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

/// Per-state step counts of a task.
///
/// Only the engine moves these, one step transition at a time, inside the
/// same store transaction that rewrites the step record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCounts {
    pub total_steps: u32,
    pub pending_steps: u32,
    pub running_steps: u32,
    pub done_steps: u32,
    pub failed_steps: u32,
}

impl StepCounts {
    pub fn is_consistent(&self) -> bool {
        let sum = u64::from(self.pending_steps)
            + u64::from(self.running_steps)
            + u64::from(self.done_steps)
            + u64::from(self.failed_steps);
        sum == u64::from(self.total_steps)
    }

    pub fn get(&self, status: StepStatus) -> u32 {
        match status {
            StepStatus::Pending => self.pending_steps,
            StepStatus::Running => self.running_steps,
            StepStatus::Done => self.done_steps,
            StepStatus::Failed => self.failed_steps,
        }
    }

    fn slot(&mut self, status: StepStatus) -> &mut u32 {
        match status {
            StepStatus::Pending => &mut self.pending_steps,
            StepStatus::Running => &mut self.running_steps,
            StepStatus::Done => &mut self.done_steps,
            StepStatus::Failed => &mut self.failed_steps,
        }
    }

    /// Status as seen from the counts alone.
    pub fn derive_status(&self) -> TaskStatus {
        let active = self.pending_steps + self.running_steps;
        if active > 0 {
            let started = self.running_steps > 0 || self.done_steps > 0 || self.failed_steps > 0;
            return if started { TaskStatus::Running } else { TaskStatus::Pending };
        }

        if self.total_steps == 0 {
            TaskStatus::Pending
        } else if self.failed_steps > 0 {
            TaskStatus::Failed
        } else {
            TaskStatus::Done
        }
    }

    /// Recount from a list of step statuses, used to audit stored aggregates.
    pub fn tally<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = StepStatus>,
    {
        let mut counts = Self::default();
        for status in statuses {
            counts.total_steps += 1;
            *counts.slot(status) += 1;
        }
        counts
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub name: String,
    status: TaskStatus,
    pub created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    counts: StepCounts,
    next_step_idx: u32,
}

impl TaskRecord {
    pub fn new(task_id: TaskId, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            task_id,
            name: name.into(),
            status: TaskStatus::Pending,
            created_at: now,
            started_at: None,
            finished_at: None,
            counts: StepCounts::default(),
            next_step_idx: 0,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn counts(&self) -> &StepCounts {
        &self.counts
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn next_step_idx(&self) -> u32 {
        self.next_step_idx
    }

    pub(crate) fn allocate_step_idx(&mut self) -> Result<u32, EngineError> {
        let idx = self.next_step_idx;
        self.next_step_idx = idx.checked_add(1).ok_or_else(|| {
            EngineError::InvariantViolation(format!(
                "task {} exhausted its step index space",
                self.task_id
            ))
        })?;
        Ok(idx)
    }

    pub(crate) fn record_new_step(&mut self, now: DateTime<Utc>) {
        self.counts.total_steps += 1;
        self.counts.pending_steps += 1;
        self.refresh_status(now);
    }

    pub(crate) fn record_transition(
        &mut self,
        from: StepStatus,
        to: StepStatus,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let slot = self.counts.slot(from);
        *slot = slot.checked_sub(1).ok_or_else(|| {
            EngineError::InvariantViolation(format!(
                "task {} has no {} step to move to {}",
                self.task_id,
                from.as_str(),
                to.as_str()
            ))
        })?;
        *self.counts.slot(to) += 1;

        if to == StepStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.refresh_status(now);
        Ok(())
    }

    fn refresh_status(&mut self, now: DateTime<Utc>) {
        let status = self.counts.derive_status();
        if status.is_terminal() {
            if self.finished_at.is_none() || !self.status.is_terminal() {
                self.finished_at = Some(now);
            }
        } else {
            self.finished_at = None;
        }
        self.status = status;
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{StepCounts, TaskId, TaskRecord, TaskStatus};
    use crate::domain::step::StepStatus;

    #[test]
    fn task_status_round_trips_from_storage_encoding() {
        for status in
            [TaskStatus::Pending, TaskStatus::Running, TaskStatus::Done, TaskStatus::Failed]
        {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn status_follows_step_transitions() {
        let now = Utc::now();
        let mut task = TaskRecord::new(TaskId("t-1".to_string()), "ingest", now);
        assert_eq!(task.status(), TaskStatus::Pending);

        task.record_new_step(now);
        task.record_new_step(now);
        assert_eq!(task.status(), TaskStatus::Pending);

        task.record_transition(StepStatus::Pending, StepStatus::Running, now).unwrap();
        assert_eq!(task.status(), TaskStatus::Running);
        assert_eq!(task.started_at(), Some(now));

        task.record_transition(StepStatus::Running, StepStatus::Done, now).unwrap();
        assert_eq!(task.status(), TaskStatus::Running, "one step is still pending");
        assert!(task.finished_at().is_none());

        task.record_transition(StepStatus::Pending, StepStatus::Running, now).unwrap();
        task.record_transition(StepStatus::Running, StepStatus::Failed, now).unwrap();
        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(task.finished_at(), Some(now));
        assert!(task.counts().is_consistent());
    }

    #[test]
    fn requeue_reopens_a_finished_task() {
        let now = Utc::now();
        let mut task = TaskRecord::new(TaskId("t-2".to_string()), "ingest", now);
        task.record_new_step(now);
        task.record_transition(StepStatus::Pending, StepStatus::Running, now).unwrap();
        task.record_transition(StepStatus::Running, StepStatus::Failed, now).unwrap();
        assert!(task.finished_at().is_some());

        task.record_transition(StepStatus::Failed, StepStatus::Pending, now).unwrap();
        assert_eq!(task.status(), TaskStatus::Running);
        assert!(task.finished_at().is_none());
    }

    #[test]
    fn transition_from_empty_bucket_is_rejected() {
        let now = Utc::now();
        let mut task = TaskRecord::new(TaskId("t-3".to_string()), "ingest", now);
        task.record_new_step(now);

        let result = task.record_transition(StepStatus::Running, StepStatus::Done, now);
        assert!(result.is_err());
        assert_eq!(task.counts().pending_steps, 1);
        assert!(task.counts().is_consistent());
    }

    #[test]
    fn tally_matches_incremental_counts() {
        let counts = StepCounts::tally([
            StepStatus::Done,
            StepStatus::Failed,
            StepStatus::Pending,
            StepStatus::Done,
        ]);
        assert_eq!(counts.total_steps, 4);
        assert_eq!(counts.done_steps, 2);
        assert_eq!(counts.derive_status(), TaskStatus::Running);
    }

    #[test]
    fn record_serializes_counts_flat() {
        let now = Utc::now();
        let mut task = TaskRecord::new(TaskId("t-4".to_string()), "ingest", now);
        task.record_new_step(now);

        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["total_steps"], 1);
        assert_eq!(json["pending_steps"], 1);
        assert_eq!(json["status"], "pending");

        let decoded: TaskRecord = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, task);
    }
}
