use serde::Serialize;

use crate::domain::keys::{self, TASK_PREFIX};
use crate::domain::{StepCounts, StepRecord, TaskId, TaskRecord, TaskStatus};
use crate::engine::QueueEngine;
use crate::errors::EngineError;
use crate::metrics::StepGauges;
use crate::store::scan_json;

#[derive(Clone, Debug, Serialize)]
pub struct TaskSnapshot {
    pub task: TaskRecord,
    pub steps: Vec<StepRecord>,
}

/// Stored aggregate of a task next to a recount of its step records.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TaskAudit {
    pub task_id: TaskId,
    pub stored: StepCounts,
    pub recounted: StepCounts,
    pub stored_status: TaskStatus,
    pub derived_status: TaskStatus,
}

impl TaskAudit {
    pub fn is_consistent(&self) -> bool {
        self.stored == self.recounted
            && self.stored.is_consistent()
            && self.stored_status == self.derived_status
    }
}

impl QueueEngine {
    /// Every task with its steps, read in one transaction.
    pub async fn snapshot(&self) -> Result<Vec<TaskSnapshot>, EngineError> {
        self.transact("snapshot", |tx| {
            Box::pin(async move {
                let tasks: Vec<TaskRecord> = scan_json(tx, TASK_PREFIX.as_bytes(), None).await?;
                let mut snapshots = Vec::with_capacity(tasks.len());
                for task in tasks {
                    let steps = scan_json(tx, &keys::task_steps_prefix(&task.task_id), None).await?;
                    snapshots.push(TaskSnapshot { task, steps });
                }
                Ok(snapshots)
            })
        })
        .await
    }

    pub async fn task_snapshot(&self, task_id: &TaskId) -> Result<TaskSnapshot, EngineError> {
        let task_id = task_id.clone();
        self.transact("task_snapshot", move |tx| {
            let task_id = task_id.clone();
            Box::pin(async move {
                let task: TaskRecord = crate::store::get_json(tx, &keys::task_key(&task_id))
                    .await?
                    .ok_or_else(|| EngineError::TaskNotFound(task_id.clone()))?;
                let steps = scan_json(tx, &keys::task_steps_prefix(&task_id), None).await?;
                Ok(TaskSnapshot { task, steps })
            })
        })
        .await
    }

    pub async fn audit_task(&self, task_id: &TaskId) -> Result<TaskAudit, EngineError> {
        let snapshot = self.task_snapshot(task_id).await?;
        let recounted = StepCounts::tally(snapshot.steps.iter().map(|step| step.status));
        Ok(TaskAudit {
            task_id: snapshot.task.task_id.clone(),
            stored: snapshot.task.counts().clone(),
            derived_status: recounted.derive_status(),
            recounted,
            stored_status: snapshot.task.status(),
        })
    }

    /// Step counts summed over all task aggregates.
    pub async fn step_gauges(&self) -> Result<StepGauges, EngineError> {
        let tasks = self.list_tasks().await?;
        let mut gauges = StepGauges::default();
        for task in &tasks {
            let counts = task.counts();
            gauges.queued += u64::from(counts.pending_steps);
            gauges.running += u64::from(counts.running_steps);
            gauges.done += u64::from(counts.done_steps);
            gauges.failed += u64::from(counts.failed_steps);
        }
        Ok(gauges)
    }

    /// Prometheus exposition of the engine counters plus current gauges.
    pub async fn render_metrics(&self) -> Result<String, EngineError> {
        let gauges = self.step_gauges().await?;
        Ok(self.metrics().render_prometheus(&gauges))
    }
}
