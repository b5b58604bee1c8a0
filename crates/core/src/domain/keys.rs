//! Byte key layout of the ordered store.
//!
//! Numeric components are zero-padded decimal so lexicographic order on the
//! key bytes matches numeric order.

use chrono::{DateTime, Utc};

use crate::domain::step::{Priority, StepKey};
use crate::domain::task::TaskId;

pub const TASK_PREFIX: &str = "task/";
pub const STEP_PREFIX: &str = "step/";
pub const QUEUE_PREFIX: &str = "queue/";
pub const LEASE_PREFIX: &str = "lease/";

pub fn task_key(task_id: &TaskId) -> Vec<u8> {
    format!("{TASK_PREFIX}{task_id}").into_bytes()
}

pub fn step_key(key: &StepKey) -> Vec<u8> {
    format!("{STEP_PREFIX}{}/{:010}", key.task_id, key.step_idx).into_bytes()
}

/// Prefix covering every step of one task, in step index order.
pub fn task_steps_prefix(task_id: &TaskId) -> Vec<u8> {
    format!("{STEP_PREFIX}{task_id}/").into_bytes()
}

pub fn queue_key(priority: Priority, enqueued_at: DateTime<Utc>, key: &StepKey) -> Vec<u8> {
    format!(
        "{QUEUE_PREFIX}{:010}/{:020}/{}/{:010}",
        priority.0,
        enqueued_micros(enqueued_at),
        key.task_id,
        key.step_idx
    )
    .into_bytes()
}

pub fn lease_key(key: &StepKey) -> Vec<u8> {
    format!("{LEASE_PREFIX}{}/{:010}", key.task_id, key.step_idx).into_bytes()
}

fn enqueued_micros(at: DateTime<Utc>) -> u64 {
    u64::try_from(at.timestamp_micros()).unwrap_or(0)
}
