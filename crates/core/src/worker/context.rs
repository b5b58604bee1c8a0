use serde_json::Value;
use tracing::{info, warn};

use crate::domain::{ContentHash, StepKey, StepRecord, TaskId};
use crate::engine::QueueEngine;
use crate::errors::EngineError;

/// What a handler can see and do while it runs one step.
#[derive(Clone)]
pub struct StepContext {
    engine: QueueEngine,
    key: StepKey,
    worker_id: String,
    handler_name: String,
    input_hash: ContentHash,
    retry_count: u32,
}

impl StepContext {
    pub(crate) fn new(engine: QueueEngine, step: &StepRecord, worker_id: &str) -> Self {
        Self {
            engine,
            key: step.key(),
            worker_id: worker_id.to_owned(),
            handler_name: step.handler_name.clone(),
            input_hash: step.input_hash.clone(),
            retry_count: step.retry_count,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.key.task_id
    }

    pub fn step_idx(&self) -> u32 {
        self.key.step_idx
    }

    pub fn step_key(&self) -> &StepKey {
        &self.key
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn handler_name(&self) -> &str {
        &self.handler_name
    }

    pub fn input_hash(&self) -> &ContentHash {
        &self.input_hash
    }

    /// Zero on the first attempt.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn log(&self, message: &str) {
        info!(
            event_name = "handler.log",
            task_id = %self.key.task_id,
            step_idx = self.key.step_idx,
            worker_id = %self.worker_id,
            handler = %self.handler_name,
            "{message}"
        );
    }

    pub fn warn(&self, message: &str) {
        warn!(
            event_name = "handler.log",
            task_id = %self.key.task_id,
            step_idx = self.key.step_idx,
            worker_id = %self.worker_id,
            handler = %self.handler_name,
            "{message}"
        );
    }

    /// Extend the lease now, on top of the worker's periodic heartbeat.
    pub async fn heartbeat(&self) -> Result<(), EngineError> {
        self.engine.heartbeat(&self.key, &self.worker_id).await.map(|_| ())
    }

    /// Queue a child step under the same task. Fails with `LeaseLost` once
    /// this worker no longer owns the step. Spawning the same child twice
    /// returns the existing one.
    pub async fn spawn(
        &self,
        handler_name: impl Into<String>,
        input: Value,
    ) -> Result<StepKey, EngineError> {
        let child = self.engine.spawn(&self.key, &self.worker_id, handler_name, input).await?;
        Ok(child.key())
    }
}
