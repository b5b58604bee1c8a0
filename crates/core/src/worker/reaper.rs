use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::clock::Ticker;
use crate::domain::StepKey;
use crate::engine::{duration_ms, QueueEngine};
use crate::errors::EngineError;

/// Periodically returns steps whose workers stopped heartbeating to the queue.
pub struct Reaper {
    engine: QueueEngine,
    stale_threshold: Duration,
}

impl Reaper {
    pub fn new(engine: QueueEngine, stale_threshold: Duration) -> Self {
        Self { engine, stale_threshold }
    }

    /// One sweep.
    pub async fn sweep(&self) -> Result<Vec<StepKey>, EngineError> {
        let reclaimed = self.engine.reset_stale(self.stale_threshold).await?;
        for key in &reclaimed {
            info!(
                event_name = "reaper.step.reclaimed",
                task_id = %key.task_id,
                step_idx = key.step_idx,
                stale_threshold_ms = duration_ms(self.stale_threshold),
                "StaleStepReclaimed"
            );
        }
        Ok(reclaimed)
    }

    /// Sweep on every tick until `shutdown` flips to `true`. A failed sweep is
    /// logged and retried on the next tick.
    pub async fn run<T>(&self, mut ticker: T, mut shutdown: watch::Receiver<bool>)
    where
        T: Ticker,
    {
        info!(event_name = "reaper.started", "reaper started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            if let Err(error) = self.sweep().await {
                warn!(
                    event_name = "reaper.sweep.error",
                    error = %error,
                    "stale step sweep failed"
                );
            }
        }
        info!(event_name = "reaper.stopped", "reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;

    use super::Reaper;
    use crate::clock::{ManualClock, ManualTicker};
    use crate::domain::{NewStep, StepStatus};
    use crate::engine::QueueEngine;
    use crate::store::InMemoryKvStore;

    #[tokio::test]
    async fn run_sweeps_on_each_tick_and_stops_on_shutdown() {
        let clock = ManualClock::new(Utc::now());
        let engine = QueueEngine::new(Arc::new(InMemoryKvStore::new()))
            .with_clock(Arc::new(clock.clone()));
        let task = engine.create_task_record("reap").await.unwrap();
        engine.enqueue(NewStep::new(task.task_id.clone(), "noop", json!({}))).await.unwrap();
        let step = engine.dequeue("w-gone", Duration::from_secs(10)).await.unwrap().unwrap();

        let reaper = Reaper::new(engine.clone(), Duration::from_secs(10));
        let (ticker, ticks) = ManualTicker::new();
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let running = tokio::spawn(async move { reaper.run(ticker, shutdown_rx).await });

        clock.advance(Duration::from_secs(11));
        ticks.fire();

        let mut status = StepStatus::Running;
        for _ in 0..100 {
            status = engine.get_step(&step.key()).await.unwrap().status;
            if status == StepStatus::Pending {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(status, StepStatus::Pending);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), running).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn sweep_ignores_fresh_leases() {
        let clock = ManualClock::new(Utc::now());
        let engine = QueueEngine::new(Arc::new(InMemoryKvStore::new()))
            .with_clock(Arc::new(clock.clone()));
        let task = engine.create_task_record("fresh").await.unwrap();
        engine.enqueue(NewStep::new(task.task_id.clone(), "noop", json!({}))).await.unwrap();
        engine.dequeue("w-1", Duration::from_secs(10)).await.unwrap().unwrap();

        clock.advance(Duration::from_secs(5));
        let reaper = Reaper::new(engine, Duration::from_secs(10));
        assert!(reaper.sweep().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unbounded_threshold_sweeps_without_overflow() {
        let clock = ManualClock::new(Utc::now());
        let engine = QueueEngine::new(Arc::new(InMemoryKvStore::new()))
            .with_clock(Arc::new(clock.clone()));
        let task = engine.create_task_record("patient").await.unwrap();
        engine.enqueue(NewStep::new(task.task_id.clone(), "noop", json!({}))).await.unwrap();
        let step = engine.dequeue("w-1", Duration::from_secs(10)).await.unwrap().unwrap();

        clock.advance(Duration::from_secs(3600));
        let reaper = Reaper::new(engine.clone(), Duration::MAX);
        assert!(reaper.sweep().await.unwrap().is_empty());
        assert_eq!(engine.get_step(&step.key()).await.unwrap().status, StepStatus::Running);

        let eager = Reaper::new(engine.clone(), Duration::from_millis(1));
        assert_eq!(eager.sweep().await.unwrap(), vec![step.key()]);
    }
}
