//! Durable queue engine.
//!
//! Every public operation is exactly one store transaction: read the
//! records it needs, apply the transition, write the step, its index entries
//! and the owning task aggregate, commit. Transactions that lose a race with
//! another writer are retried from scratch, so callers never observe
//! [`StoreError::Conflict`] unless the retry budget runs out.

mod builder;
mod diagnostics;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

pub use builder::TaskBuilder;
pub use diagnostics::{TaskAudit, TaskSnapshot};

use crate::clock::{Clock, SystemClock};
use crate::domain::keys::{self, LEASE_PREFIX, QUEUE_PREFIX, TASK_PREFIX};
use crate::domain::{
    ContentHash, NewStep, StepKey, StepRecord, StepStatus, TaskId, TaskRecord,
};
use crate::errors::{EngineError, StoreError};
use crate::metrics::EngineMetrics;
use crate::store::{get_json, put_json, scan_json, KvStore, KvTransaction};

const QUEUE_SCAN_BATCH: usize = 64;

pub(crate) type TxFuture<'t, T> = Pin<Box<dyn Future<Output = Result<T, EngineError>> + Send + 't>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineSettings {
    /// Lease used by heartbeats when a step carries no lease length of its own.
    pub default_lease: Duration,
    /// Explicit handler failures allowed to go back to pending before a step fails for good.
    pub explicit_failure_retries: u32,
    pub conflict_retry_limit: u32,
    pub conflict_backoff: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_lease: Duration::from_secs(30),
            explicit_failure_retries: 0,
            conflict_retry_limit: 32,
            conflict_backoff: Duration::from_millis(2),
        }
    }
}

#[derive(Clone)]
pub struct QueueEngine {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
    metrics: Arc<EngineMetrics>,
}

impl QueueEngine {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            settings: EngineSettings::default(),
            metrics: Arc::new(EngineMetrics::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Persist an empty task and return a builder for its steps.
    pub async fn create_task(&self, name: impl Into<String>) -> Result<TaskBuilder, EngineError> {
        let task = self.create_task_record(name).await?;
        Ok(TaskBuilder::new(self.clone(), task.task_id))
    }

    pub async fn create_task_record(&self, name: impl Into<String>) -> Result<TaskRecord, EngineError> {
        let name = name.into();
        let task_id = TaskId::generate();
        let clock = Arc::clone(&self.clock);

        let task = self
            .transact("create_task", move |tx| {
                let task = TaskRecord::new(task_id.clone(), name.clone(), clock.now());
                Box::pin(async move {
                    put_json(tx, &keys::task_key(&task.task_id), &task).await?;
                    Ok(task)
                })
            })
            .await?;

        info!(
            event_name = "engine.task.created",
            task_id = %task.task_id,
            task_name = %task.name,
            "task created"
        );
        Ok(task)
    }

    pub async fn enqueue(&self, new_step: NewStep) -> Result<StepRecord, EngineError> {
        let clock = Arc::clone(&self.clock);
        let step = self
            .transact("enqueue", move |tx| {
                let new_step = new_step.clone();
                let now = clock.now();
                Box::pin(async move {
                    let mut task = load_task(tx, &new_step.task_id).await?;
                    insert_step(tx, &mut task, new_step, now).await
                })
            })
            .await?;

        self.metrics.steps_enqueued.inc();
        debug!(
            event_name = "engine.step.enqueued",
            task_id = %step.task_id,
            step_idx = step.step_idx,
            handler = %step.handler_name,
            priority = step.priority.0,
            "step enqueued"
        );
        Ok(step)
    }

    /// Add a child of `parent` to the parent's task on behalf of the worker
    /// that holds the parent's lease. The child inherits the parent's
    /// priority. A child of the same parent with the same input hash is
    /// returned instead of being queued twice, so a re-run parent only adds
    /// the children its earlier attempts did not.
    pub async fn spawn(
        &self,
        parent: &StepKey,
        worker_id: &str,
        handler_name: impl Into<String>,
        input: Value,
    ) -> Result<StepRecord, EngineError> {
        let parent = parent.clone();
        let worker_id = worker_id.to_owned();
        let handler_name = handler_name.into();
        let clock = Arc::clone(&self.clock);

        let (step, created) = self
            .transact("spawn", move |tx| {
                let parent = parent.clone();
                let worker_id = worker_id.clone();
                let handler_name = handler_name.clone();
                let input = input.clone();
                let now = clock.now();
                Box::pin(async move {
                    let parent_step = load_owned_step(tx, &parent, &worker_id).await?;
                    let input_hash = ContentHash::of_step_input(&handler_name, &input);
                    if let Some(existing) = find_child(tx, &parent, &input_hash).await? {
                        return Ok((existing, false));
                    }

                    let mut task = load_task(tx, &parent.task_id).await?;
                    let new_step = NewStep::new(parent.task_id.clone(), handler_name, input)
                        .with_parent(parent.step_idx)
                        .with_priority(parent_step.priority);
                    Ok((insert_step(tx, &mut task, new_step, now).await?, true))
                })
            })
            .await?;

        if created {
            self.metrics.steps_enqueued.inc();
            debug!(
                event_name = "engine.step.spawned",
                task_id = %step.task_id,
                step_idx = step.step_idx,
                parent_step = ?step.parent_step,
                handler = %step.handler_name,
                "child step spawned"
            );
        } else {
            debug!(
                event_name = "engine.step.spawn_deduplicated",
                task_id = %step.task_id,
                step_idx = step.step_idx,
                parent_step = ?step.parent_step,
                handler = %step.handler_name,
                "child step already exists"
            );
        }
        Ok(step)
    }

    /// Claim the first pending step in queue order, or `None` when the queue is empty.
    pub async fn dequeue(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<StepRecord>, EngineError> {
        let worker_id = worker_id.to_owned();
        let clock = Arc::clone(&self.clock);
        let lease_ms = duration_ms(lease);

        let claimed = self
            .transact("dequeue", move |tx| {
                let worker_id = worker_id.clone();
                let now = clock.now();
                Box::pin(async move { claim_next(tx, &worker_id, lease_ms, now).await })
            })
            .await?;

        if let Some(step) = &claimed {
            self.metrics.steps_dequeued.inc();
            info!(
                event_name = "engine.step.claimed",
                task_id = %step.task_id,
                step_idx = step.step_idx,
                worker_id = step.owner_worker_id.as_deref().unwrap_or_default(),
                handler = %step.handler_name,
                retry_count = step.retry_count,
                "step claimed"
            );
        }
        Ok(claimed)
    }

    /// Refresh the lease of a step the worker still owns.
    pub async fn heartbeat(&self, key: &StepKey, worker_id: &str) -> Result<StepRecord, EngineError> {
        let key = key.clone();
        let worker_id = worker_id.to_owned();
        let clock = Arc::clone(&self.clock);
        let default_lease_ms = duration_ms(self.settings.default_lease);

        let step = self
            .transact("heartbeat", move |tx| {
                let key = key.clone();
                let worker_id = worker_id.clone();
                let now = clock.now();
                Box::pin(async move {
                    let mut step = load_owned_step(tx, &key, &worker_id).await?;
                    let lease_ms = step.lease_duration_ms.unwrap_or(default_lease_ms);
                    step.last_heartbeat = Some(now);
                    step.lease_expires_at = Some(add_ms(now, lease_ms));
                    put_json(tx, &keys::step_key(&key), &step).await?;
                    Ok(step)
                })
            })
            .await?;

        self.metrics.heartbeats.inc();
        debug!(
            event_name = "engine.step.heartbeat",
            task_id = %step.task_id,
            step_idx = step.step_idx,
            lease_expires_at = ?step.lease_expires_at,
            "lease extended"
        );
        Ok(step)
    }

    pub async fn finish(
        &self,
        key: &StepKey,
        worker_id: &str,
        output_hash: ContentHash,
        result_location: Option<String>,
    ) -> Result<StepRecord, EngineError> {
        let key = key.clone();
        let worker_id = worker_id.to_owned();
        let clock = Arc::clone(&self.clock);

        let step = self
            .transact("finish", move |tx| {
                let key = key.clone();
                let worker_id = worker_id.clone();
                let output_hash = output_hash.clone();
                let result_location = result_location.clone();
                let now = clock.now();
                Box::pin(async move {
                    let mut step = load_owned_step(tx, &key, &worker_id).await?;
                    let mut task = load_task(tx, &key.task_id).await?;

                    step.status = StepStatus::Done;
                    step.output_hash = Some(output_hash);
                    step.result_location = result_location;
                    step.finished_at = Some(now);
                    step.clear_lease();
                    tx.delete(&keys::lease_key(&key)).await?;
                    put_json(tx, &keys::step_key(&key), &step).await?;

                    task.record_transition(StepStatus::Running, StepStatus::Done, now)?;
                    put_json(tx, &keys::task_key(&task.task_id), &task).await?;
                    Ok(step)
                })
            })
            .await?;

        self.metrics.steps_finished.inc();
        self.observe_run_time(&step);
        info!(
            event_name = "engine.step.finished",
            task_id = %step.task_id,
            step_idx = step.step_idx,
            output_hash = ?step.output_hash.as_ref().map(ContentHash::as_str),
            "step finished"
        );
        Ok(step)
    }

    /// Record an explicit handler failure. The step fails for good unless the
    /// configured retry budget still allows another attempt.
    pub async fn fail(
        &self,
        key: &StepKey,
        worker_id: &str,
        error_message: impl Into<String>,
    ) -> Result<StepRecord, EngineError> {
        let key = key.clone();
        let worker_id = worker_id.to_owned();
        let error_message = error_message.into();
        let clock = Arc::clone(&self.clock);
        let retry_budget = self.settings.explicit_failure_retries;

        let step = self
            .transact("fail", move |tx| {
                let key = key.clone();
                let worker_id = worker_id.clone();
                let error_message = error_message.clone();
                let now = clock.now();
                Box::pin(async move {
                    let mut step = load_owned_step(tx, &key, &worker_id).await?;
                    let mut task = load_task(tx, &key.task_id).await?;

                    step.error_message = Some(error_message);
                    step.clear_lease();
                    tx.delete(&keys::lease_key(&key)).await?;

                    if step.retry_count < retry_budget {
                        step.retry_count += 1;
                        return_to_queue(tx, &mut task, step, StepStatus::Running, now).await
                    } else {
                        step.status = StepStatus::Failed;
                        step.finished_at = Some(now);
                        put_json(tx, &keys::step_key(&key), &step).await?;
                        task.record_transition(StepStatus::Running, StepStatus::Failed, now)?;
                        put_json(tx, &keys::task_key(&task.task_id), &task).await?;
                        Ok(step)
                    }
                })
            })
            .await?;

        if step.status == StepStatus::Failed {
            self.metrics.steps_failed.inc();
            self.observe_run_time(&step);
            warn!(
                event_name = "engine.step.failed",
                task_id = %step.task_id,
                step_idx = step.step_idx,
                retry_count = step.retry_count,
                error = step.error_message.as_deref().unwrap_or_default(),
                "step failed"
            );
        } else {
            info!(
                event_name = "engine.step.retry_scheduled",
                task_id = %step.task_id,
                step_idx = step.step_idx,
                retry_count = step.retry_count,
                error = step.error_message.as_deref().unwrap_or_default(),
                "step failed and was returned to the queue"
            );
        }
        Ok(step)
    }

    /// Return every running step whose last heartbeat is older than
    /// `threshold` to the queue. Steps in any other state are left alone.
    pub async fn reset_stale(&self, threshold: Duration) -> Result<Vec<StepKey>, EngineError> {
        let clock = Arc::clone(&self.clock);
        let threshold_ms = duration_ms(threshold);

        let reclaimed = self
            .transact("reset_stale", move |tx| {
                let now = clock.now();
                Box::pin(async move { reclaim_stale(tx, threshold_ms, now).await })
            })
            .await?;

        self.metrics.steps_reclaimed.add(reclaimed.len() as u64);
        for key in &reclaimed {
            info!(
                event_name = "engine.step.reclaimed",
                task_id = %key.task_id,
                step_idx = key.step_idx,
                "stale running step returned to pending"
            );
        }
        Ok(reclaimed)
    }

    /// Operator action: put a failed step back into the queue.
    pub async fn requeue(&self, key: &StepKey) -> Result<StepRecord, EngineError> {
        let key = key.clone();
        let clock = Arc::clone(&self.clock);

        let step = self
            .transact("requeue", move |tx| {
                let key = key.clone();
                let now = clock.now();
                Box::pin(async move {
                    let mut step = load_step(tx, &key).await?;
                    if step.status != StepStatus::Failed {
                        return Err(EngineError::InvalidTransition {
                            step: key,
                            from: step.status,
                            to: StepStatus::Pending,
                        });
                    }
                    let mut task = load_task(tx, &key.task_id).await?;
                    step.retry_count += 1;
                    step.finished_at = None;
                    return_to_queue(tx, &mut task, step, StepStatus::Failed, now).await
                })
            })
            .await?;

        info!(
            event_name = "engine.step.requeued",
            task_id = %step.task_id,
            step_idx = step.step_idx,
            retry_count = step.retry_count,
            "failed step requeued"
        );
        Ok(step)
    }

    pub async fn get_task(&self, task_id: &TaskId) -> Result<TaskRecord, EngineError> {
        let task_id = task_id.clone();
        self.transact("get_task", move |tx| {
            let task_id = task_id.clone();
            Box::pin(async move { load_task(tx, &task_id).await })
        })
        .await
    }

    pub async fn get_step(&self, key: &StepKey) -> Result<StepRecord, EngineError> {
        let key = key.clone();
        self.transact("get_step", move |tx| {
            let key = key.clone();
            Box::pin(async move { load_step(tx, &key).await })
        })
        .await
    }

    /// Steps of one task in step index order.
    pub async fn list_steps(&self, task_id: &TaskId) -> Result<Vec<StepRecord>, EngineError> {
        let task_id = task_id.clone();
        self.transact("list_steps", move |tx| {
            let task_id = task_id.clone();
            Box::pin(async move {
                load_task(tx, &task_id).await?;
                Ok(scan_json(tx, &keys::task_steps_prefix(&task_id), None).await?)
            })
        })
        .await
    }

    pub async fn list_tasks(&self) -> Result<Vec<TaskRecord>, EngineError> {
        self.transact("list_tasks", |tx| {
            Box::pin(async move { Ok(scan_json(tx, TASK_PREFIX.as_bytes(), None).await?) })
        })
        .await
    }

    /// Number of entries in the queue index.
    pub async fn queue_depth(&self) -> Result<usize, EngineError> {
        self.transact("queue_depth", |tx| {
            Box::pin(async move { Ok(tx.scan_prefix(QUEUE_PREFIX.as_bytes(), None).await?.len()) })
        })
        .await
    }

    fn observe_run_time(&self, step: &StepRecord) {
        if let (Some(started), Some(finished)) = (step.started_at, step.finished_at) {
            if let Ok(elapsed) = (finished - started).to_std() {
                self.metrics.step_duration.observe(elapsed);
            }
        }
    }

    /// Run `body` in a fresh transaction, retrying the whole attempt on conflict.
    pub(crate) async fn transact<T, F>(&self, op: &'static str, mut body: F) -> Result<T, EngineError>
    where
        T: Send,
        F: for<'t> FnMut(&'t mut dyn KvTransaction) -> TxFuture<'t, T> + Send,
    {
        let mut attempt: u32 = 0;
        loop {
            let outcome = match self.store.begin().await {
                Ok(mut tx) => {
                    let result = body(tx.as_mut()).await;
                    match result {
                        Ok(value) => tx.commit().await.map(|()| value).map_err(EngineError::from),
                        Err(error) => Err(error),
                    }
                }
                Err(error) => Err(EngineError::from(error)),
            };

            match outcome {
                Err(error) if error.is_conflict() && attempt < self.settings.conflict_retry_limit => {
                    attempt += 1;
                    self.metrics.store_conflicts.inc();
                    debug!(
                        event_name = "engine.store.conflict_retry",
                        operation = op,
                        attempt,
                        "store conflict, retrying transaction"
                    );
                    tokio::time::sleep(self.settings.conflict_backoff * attempt.min(8)).await;
                }
                Err(error) if error.is_conflict() => {
                    self.metrics.store_conflicts.inc();
                    warn!(
                        event_name = "engine.store.conflict_exhausted",
                        operation = op,
                        attempts = attempt + 1,
                        "store conflict retry budget exhausted"
                    );
                    return Err(error);
                }
                other => return other,
            }
        }
    }
}

async fn load_task(tx: &mut dyn KvTransaction, task_id: &TaskId) -> Result<TaskRecord, EngineError> {
    get_json(tx, &keys::task_key(task_id))
        .await?
        .ok_or_else(|| EngineError::TaskNotFound(task_id.clone()))
}

async fn load_step(tx: &mut dyn KvTransaction, key: &StepKey) -> Result<StepRecord, EngineError> {
    get_json(tx, &keys::step_key(key)).await?.ok_or_else(|| EngineError::StepNotFound(key.clone()))
}

async fn load_owned_step(
    tx: &mut dyn KvTransaction,
    key: &StepKey,
    worker_id: &str,
) -> Result<StepRecord, EngineError> {
    let step = load_step(tx, key).await?;
    if !step.is_owned_by(worker_id) {
        return Err(EngineError::LeaseLost { step: key.clone(), worker_id: worker_id.to_owned() });
    }
    Ok(step)
}

async fn find_child(
    tx: &mut dyn KvTransaction,
    parent: &StepKey,
    input_hash: &ContentHash,
) -> Result<Option<StepRecord>, EngineError> {
    let siblings: Vec<StepRecord> =
        scan_json(tx, &keys::task_steps_prefix(&parent.task_id), None).await?;
    Ok(siblings
        .into_iter()
        .find(|step| step.parent_step == Some(parent.step_idx) && &step.input_hash == input_hash))
}

async fn insert_step(
    tx: &mut dyn KvTransaction,
    task: &mut TaskRecord,
    new_step: NewStep,
    now: DateTime<Utc>,
) -> Result<StepRecord, EngineError> {
    let step_idx = task.allocate_step_idx()?;
    let key = StepKey::new(task.task_id.clone(), step_idx);
    let input_hash = ContentHash::of_step_input(&new_step.handler_name, &new_step.input);

    let step = StepRecord {
        task_id: key.task_id.clone(),
        step_idx,
        parent_step: new_step.parent_step,
        handler_name: new_step.handler_name,
        input: new_step.input,
        input_hash,
        output_hash: None,
        status: StepStatus::Pending,
        priority: new_step.priority.unwrap_or_default(),
        retry_count: 0,
        created_at: now,
        enqueued_at: now,
        started_at: None,
        finished_at: None,
        owner_worker_id: None,
        last_heartbeat: None,
        lease_expires_at: None,
        lease_duration_ms: None,
        error_message: None,
        result_location: None,
    };

    put_json(tx, &keys::step_key(&key), &step).await?;
    put_json(tx, &keys::queue_key(step.priority, step.enqueued_at, &key), &key).await?;
    task.record_new_step(now);
    put_json(tx, &keys::task_key(&task.task_id), &*task).await?;
    Ok(step)
}

/// Write `step` back as pending with a fresh queue entry, moving the
/// aggregate from `from` to pending.
async fn return_to_queue(
    tx: &mut dyn KvTransaction,
    task: &mut TaskRecord,
    mut step: StepRecord,
    from: StepStatus,
    now: DateTime<Utc>,
) -> Result<StepRecord, EngineError> {
    let key = step.key();
    step.status = StepStatus::Pending;
    step.enqueued_at = now;
    put_json(tx, &keys::step_key(&key), &step).await?;
    put_json(tx, &keys::queue_key(step.priority, step.enqueued_at, &key), &key).await?;
    task.record_transition(from, StepStatus::Pending, now)?;
    put_json(tx, &keys::task_key(&task.task_id), &*task).await?;
    Ok(step)
}

async fn claim_next(
    tx: &mut dyn KvTransaction,
    worker_id: &str,
    lease_ms: u64,
    now: DateTime<Utc>,
) -> Result<Option<StepRecord>, EngineError> {
    loop {
        let batch = tx.scan_prefix(QUEUE_PREFIX.as_bytes(), Some(QUEUE_SCAN_BATCH)).await?;
        let exhausted = batch.len() < QUEUE_SCAN_BATCH;

        for (queue_key, value) in batch {
            let key: StepKey = serde_json::from_slice(&value).map_err(StoreError::from)?;
            let current = get_json::<StepRecord>(tx, &keys::step_key(&key)).await?;

            let mut step = match current {
                Some(step)
                    if step.status == StepStatus::Pending
                        && keys::queue_key(step.priority, step.enqueued_at, &key) == queue_key =>
                {
                    step
                }
                _ => {
                    debug!(
                        event_name = "engine.queue.stale_entry_dropped",
                        task_id = %key.task_id,
                        step_idx = key.step_idx,
                        "dropping queue entry for a step that is no longer pending"
                    );
                    tx.delete(&queue_key).await?;
                    continue;
                }
            };

            let mut task = load_task(tx, &key.task_id).await?;
            step.status = StepStatus::Running;
            step.owner_worker_id = Some(worker_id.to_owned());
            step.started_at = Some(now);
            step.last_heartbeat = Some(now);
            step.lease_expires_at = Some(add_ms(now, lease_ms));
            step.lease_duration_ms = Some(lease_ms);

            tx.delete(&queue_key).await?;
            put_json(tx, &keys::lease_key(&key), &key).await?;
            put_json(tx, &keys::step_key(&key), &step).await?;
            task.record_transition(StepStatus::Pending, StepStatus::Running, now)?;
            put_json(tx, &keys::task_key(&task.task_id), &task).await?;
            return Ok(Some(step));
        }

        if exhausted {
            return Ok(None);
        }
    }
}

async fn reclaim_stale(
    tx: &mut dyn KvTransaction,
    threshold_ms: u64,
    now: DateTime<Utc>,
) -> Result<Vec<StepKey>, EngineError> {
    let cutoff = sub_ms(now, threshold_ms);
    let leases = tx.scan_prefix(LEASE_PREFIX.as_bytes(), None).await?;
    let mut reclaimed = Vec::new();

    for (lease_key, value) in leases {
        let key: StepKey = serde_json::from_slice(&value).map_err(StoreError::from)?;
        let step = match get_json::<StepRecord>(tx, &keys::step_key(&key)).await? {
            Some(step) if step.status == StepStatus::Running => step,
            _ => {
                tx.delete(&lease_key).await?;
                continue;
            }
        };

        let last_seen = step.last_heartbeat.or(step.started_at);
        if last_seen.is_some_and(|seen| seen >= cutoff) {
            continue;
        }

        let mut task = load_task(tx, &key.task_id).await?;
        let mut step = step;
        step.retry_count += 1;
        step.error_message = Some(format!(
            "lease expired: worker {} stopped heartbeating (last heartbeat {})",
            step.owner_worker_id.as_deref().unwrap_or("unknown"),
            last_seen.map(|at| at.to_rfc3339()).unwrap_or_else(|| "never".to_owned()),
        ));
        step.clear_lease();
        tx.delete(&lease_key).await?;
        return_to_queue(tx, &mut task, step, StepStatus::Running, now).await?;
        reclaimed.push(key);
    }

    Ok(reclaimed)
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn add_ms(at: DateTime<Utc>, ms: u64) -> DateTime<Utc> {
    let delta = chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX));
    at.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn sub_ms(at: DateTime<Utc>, ms: u64) -> DateTime<Utc> {
    let delta = chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX));
    at.checked_sub_signed(delta).unwrap_or(DateTime::<Utc>::MIN_UTC)
}
