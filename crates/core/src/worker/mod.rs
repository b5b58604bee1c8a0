//! Worker loop: claim a step, run its handler under a heartbeat, record the outcome.

mod context;
mod heartbeat;
mod reaper;

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

pub use context::StepContext;
pub use reaper::Reaper;

use crate::domain::{canonical_json, StepKey, StepRecord};
use crate::engine::{duration_ms, QueueEngine};
use crate::errors::{EngineError, WorkerError};
use crate::registry::HandlerRegistry;
use crate::results::ResultStore;
use heartbeat::HeartbeatGuard;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerSettings {
    pub lease_duration: Duration,
    pub heartbeat_interval: Duration,
    pub poll_interval_min: Duration,
    pub poll_interval_max: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
            poll_interval_min: Duration::from_millis(50),
            poll_interval_max: Duration::from_secs(2),
        }
    }
}

/// How a claimed step ended from this worker's point of view.
#[derive(Clone, Debug, PartialEq)]
pub enum StepOutcome {
    Finished(StepRecord),
    /// The handler failed. The record is `failed`, or `pending` again when
    /// the engine's retry budget allowed another attempt.
    Failed(StepRecord),
    /// The step was reclaimed before this worker could record its outcome.
    LeaseLost(StepKey),
}

#[derive(Clone)]
pub struct Worker {
    id: String,
    engine: QueueEngine,
    registry: Arc<HandlerRegistry>,
    results: Arc<dyn ResultStore>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        engine: QueueEngine,
        registry: Arc<HandlerRegistry>,
        results: Arc<dyn ResultStore>,
        settings: WorkerSettings,
    ) -> Self {
        Self { id: id.into(), engine, registry, results, settings }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claim and run at most one step. `Ok(None)` means the queue was empty.
    pub async fn run_once(&self) -> Result<Option<StepOutcome>, WorkerError> {
        let Some(step) = self.engine.dequeue(&self.id, self.settings.lease_duration).await? else {
            return Ok(None);
        };
        self.execute(step).await.map(Some)
    }

    /// Poll until `shutdown` flips to `true`. A step already running when
    /// shutdown is requested is finished first.
    ///
    /// Only a missing handler stops the loop. Store and result store errors
    /// are logged and the worker backs off before polling again; a step it
    /// had claimed is left for the reaper.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        info!(event_name = "worker.started", worker_id = %self.id, "worker started");
        let mut backoff = self.settings.poll_interval_min;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_once().await {
                Ok(Some(_)) => {
                    backoff = self.settings.poll_interval_min;
                    continue;
                }
                Ok(None) => {}
                Err(error @ WorkerError::HandlerNotRegistered { .. }) => return Err(error),
                Err(error) => {
                    warn!(
                        event_name = "worker.poll.error",
                        worker_id = %self.id,
                        error = %error,
                        retry_in_ms = duration_ms(backoff),
                        "poll failed, backing off"
                    );
                }
            }

            let delay = with_jitter(backoff);
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
            backoff = (backoff * 2)
                .min(self.settings.poll_interval_max)
                .max(self.settings.poll_interval_min);
        }

        info!(event_name = "worker.stopped", worker_id = %self.id, "worker stopped");
        Ok(())
    }

    async fn execute(&self, step: StepRecord) -> Result<StepOutcome, WorkerError> {
        let key = step.key();
        let Some(handler) = self.registry.get(&step.handler_name) else {
            error!(
                event_name = "worker.handler.not_registered",
                task_id = %key.task_id,
                step_idx = key.step_idx,
                worker_id = %self.id,
                handler = %step.handler_name,
                "claimed a step with no registered handler, leaving it for the reaper"
            );
            return Err(WorkerError::HandlerNotRegistered { handler: step.handler_name, step: key });
        };

        let _heartbeat = HeartbeatGuard::start(
            self.engine.clone(),
            key.clone(),
            self.id.clone(),
            self.settings.heartbeat_interval,
        );

        let ctx = StepContext::new(self.engine.clone(), &step, &self.id);
        let input = step.input.clone();
        let handler_task = tokio::spawn(async move { handler.run(input, ctx).await });
        let joined = AbortOnDrop(handler_task).await;

        let handler_result = match joined {
            Ok(result) => result.map_err(|error| error.to_string()),
            Err(join_error) if join_error.is_panic() => {
                Err(format!("handler panicked: {}", panic_message(join_error.into_panic())))
            }
            Err(join_error) => Err(format!("handler task aborted: {join_error}")),
        };

        let recorded = match handler_result {
            Ok(output) => {
                let bytes = canonical_json(&output).into_bytes();
                let stored = self.results.put(&bytes).await?;
                self.engine
                    .finish(&key, &self.id, stored.hash, Some(stored.location))
                    .await
                    .map(StepOutcome::Finished)
            }
            Err(message) => {
                warn!(
                    event_name = "worker.step.failed",
                    task_id = %key.task_id,
                    step_idx = key.step_idx,
                    worker_id = %self.id,
                    handler = %step.handler_name,
                    error = %message,
                    "handler failed"
                );
                self.engine.fail(&key, &self.id, message).await.map(StepOutcome::Failed)
            }
        };

        match recorded {
            Ok(outcome) => {
                if let StepOutcome::Finished(record) = &outcome {
                    info!(
                        event_name = "worker.step.finished",
                        task_id = %record.task_id,
                        step_idx = record.step_idx,
                        worker_id = %self.id,
                        "step finished"
                    );
                }
                Ok(outcome)
            }
            Err(error) => self.lease_lost_or(error, key),
        }
    }

    fn lease_lost_or(&self, error: EngineError, key: StepKey) -> Result<StepOutcome, WorkerError> {
        if !error.is_lease_lost() {
            return Err(error.into());
        }
        info!(
            event_name = "worker.step.lease_lost",
            task_id = %key.task_id,
            step_idx = key.step_idx,
            worker_id = %self.id,
            "step was reclaimed before its outcome could be recorded"
        );
        Ok(StepOutcome::LeaseLost(key))
    }
}

/// A fixed-size group of workers sharing one engine, registry and result store.
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<(String, JoinHandle<Result<(), WorkerError>>)>,
}

impl WorkerPool {
    pub fn spawn(workers: Vec<Worker>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let joins = workers
            .into_iter()
            .map(|worker| {
                let rx = shutdown_rx.clone();
                let id = worker.id().to_owned();
                (id, tokio::spawn(async move { worker.run(rx).await }))
            })
            .collect();
        Self { shutdown_tx, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop polling and wait for every worker. Returns the errors of workers
    /// that stopped on their own.
    pub async fn shutdown_and_join(self) -> Vec<(String, WorkerError)> {
        self.request_shutdown();
        let mut failures = Vec::new();
        for (id, join) in self.joins {
            match join.await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => failures.push((id, error)),
                Err(join_error) => {
                    error!(
                        event_name = "worker.pool.join_failed",
                        worker_id = %id,
                        error = %join_error,
                        "worker task did not exit cleanly"
                    );
                }
            }
        }
        failures
    }
}

/// A spawned handler task that is aborted if the worker stops waiting for it.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Future for AbortOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn with_jitter(base: Duration) -> Duration {
    let spread = u64::try_from(base.as_millis() / 4).unwrap_or(u64::MAX);
    if spread == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
