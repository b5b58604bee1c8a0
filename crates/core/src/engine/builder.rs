use serde_json::Value;

use crate::domain::{NewStep, Priority, StepKey, TaskId, TaskRecord};
use crate::engine::QueueEngine;
use crate::errors::EngineError;

/// Fluent construction of a task's initial steps.
///
/// The task record already exists when the builder is handed out, and every
/// `add_*` call commits its step before returning. Dropping the builder part
/// way through leaves the steps added so far in the queue.
pub struct TaskBuilder {
    engine: QueueEngine,
    task_id: TaskId,
    priority: Option<Priority>,
    steps: Vec<StepKey>,
}

impl TaskBuilder {
    pub(crate) fn new(engine: QueueEngine, task_id: TaskId) -> Self {
        Self { engine, task_id, priority: None, steps: Vec::new() }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Steps added through this builder, in insertion order.
    pub fn steps(&self) -> &[StepKey] {
        &self.steps
    }

    /// Priority applied to steps added after this call.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub async fn add_step(
        mut self,
        handler_name: impl Into<String>,
        input: Value,
    ) -> Result<Self, EngineError> {
        let new_step = self.new_step(handler_name.into(), input);
        let step = self.engine.enqueue(new_step).await?;
        self.steps.push(step.key());
        Ok(self)
    }

    pub async fn add_child_step(
        mut self,
        parent_step: u32,
        handler_name: impl Into<String>,
        input: Value,
    ) -> Result<Self, EngineError> {
        let parent = StepKey::new(self.task_id.clone(), parent_step);
        self.engine.get_step(&parent).await?;

        let new_step = self.new_step(handler_name.into(), input).with_parent(parent_step);
        let step = self.engine.enqueue(new_step).await?;
        self.steps.push(step.key());
        Ok(self)
    }

    pub async fn build(self) -> Result<TaskRecord, EngineError> {
        self.engine.get_task(&self.task_id).await
    }

    fn new_step(&self, handler_name: String, input: Value) -> NewStep {
        let new_step = NewStep::new(self.task_id.clone(), handler_name, input);
        match self.priority {
            Some(priority) => new_step.with_priority(priority),
            None => new_step,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use crate::domain::{Priority, StepStatus, TaskStatus};
    use crate::engine::QueueEngine;
    use crate::errors::EngineError;
    use crate::store::InMemoryKvStore;

    #[tokio::test]
    async fn builder_persists_steps_with_parent_links() {
        let engine = QueueEngine::new(Arc::new(InMemoryKvStore::new()));

        let task = engine
            .create_task("repo-scan")
            .await
            .unwrap()
            .add_step("git.list_commits", json!({"repo": "/tmp/repo"}))
            .await
            .unwrap()
            .with_priority(Priority(10))
            .add_child_step(0, "git.commit_meta", json!({"repo": "/tmp/repo", "commit": "abc"}))
            .await
            .unwrap()
            .build()
            .await
            .unwrap();

        assert_eq!(task.name, "repo-scan");
        assert_eq!(task.counts().total_steps, 2);
        assert_eq!(task.status(), TaskStatus::Pending);

        let steps = engine.list_steps(&task.task_id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].parent_step, None);
        assert_eq!(steps[0].priority, Priority::NORMAL);
        assert_eq!(steps[1].parent_step, Some(0));
        assert_eq!(steps[1].priority, Priority(10));
        assert!(steps.iter().all(|step| step.status == StepStatus::Pending));
    }

    #[tokio::test]
    async fn child_of_unknown_parent_is_rejected() {
        let engine = QueueEngine::new(Arc::new(InMemoryKvStore::new()));
        let builder = engine.create_task("orphan").await.unwrap();
        let task_id = builder.task_id().clone();

        let error = match builder.add_child_step(3, "noop", json!({})).await {
            Ok(_) => panic!("child of a missing parent must be rejected"),
            Err(error) => error,
        };
        assert!(matches!(error, EngineError::StepNotFound(ref key) if key.step_idx == 3));
        assert_eq!(engine.get_task(&task_id).await.unwrap().counts().total_steps, 0);
    }
}
