use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::domain::StepKey;
use crate::engine::QueueEngine;

/// Background lease renewal for one claimed step. Dropping the guard stops it.
pub(crate) struct HeartbeatGuard {
    handle: JoinHandle<()>,
}

impl HeartbeatGuard {
    pub(crate) fn start(
        engine: QueueEngine,
        key: StepKey,
        worker_id: String,
        every: Duration,
    ) -> Self {
        let every = every.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + every, every);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                match engine.heartbeat(&key, &worker_id).await {
                    Ok(_) => {}
                    Err(error) if error.is_lease_lost() => {
                        info!(
                            event_name = "worker.heartbeat.lease_lost",
                            task_id = %key.task_id,
                            step_idx = key.step_idx,
                            worker_id = %worker_id,
                            "lease no longer held, heartbeat stopped"
                        );
                        return;
                    }
                    Err(error) => {
                        warn!(
                            event_name = "worker.heartbeat.error",
                            task_id = %key.task_id,
                            step_idx = key.step_idx,
                            worker_id = %worker_id,
                            error = %error,
                            "heartbeat failed, will retry on next tick"
                        );
                    }
                }
            }
        });
        Self { handle }
    }
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
