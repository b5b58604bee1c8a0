use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use stepledger_core::{
    ContentHash, HandlerError, HandlerRegistry, InMemoryKvStore, InMemoryResultStore, ManualClock,
    NewStep, QueueEngine, Reaper, StepContext, StepOutcome, StepStatus, TaskStatus, Worker,
    WorkerSettings,
};

const LEASE: Duration = Duration::from_secs(10);

fn engine_with_clock() -> (QueueEngine, ManualClock) {
    let clock = ManualClock::new(Utc::now());
    let engine =
        QueueEngine::new(Arc::new(InMemoryKvStore::new())).with_clock(Arc::new(clock.clone()));
    (engine, clock)
}

fn worker(id: &str, engine: &QueueEngine, registry: HandlerRegistry) -> Worker {
    Worker::new(
        id,
        engine.clone(),
        Arc::new(registry),
        Arc::new(InMemoryResultStore::new()),
        WorkerSettings { lease_duration: LEASE, ..WorkerSettings::default() },
    )
}

async fn assert_counts_consistent(engine: &QueueEngine) {
    for task in engine.list_tasks().await.expect("list tasks") {
        let audit = engine.audit_task(&task.task_id).await.expect("audit task");
        assert!(audit.is_consistent(), "aggregate drift on {}: {audit:?}", task.task_id);
    }
}

#[tokio::test]
async fn single_step_task_completes() {
    let (engine, _clock) = engine_with_clock();
    let mut registry = HandlerRegistry::new();
    registry
        .register_fn("echo", |input: Value, _ctx: StepContext| async move {
            Ok::<_, HandlerError>(json!({ "echo": input }))
        })
        .expect("register echo");

    let task = engine
        .create_task("scenario-a")
        .await
        .expect("create task")
        .add_step("echo", json!({ "n": 1 }))
        .await
        .expect("add step")
        .build()
        .await
        .expect("build task");

    let outcome = worker("w-a", &engine, registry).run_once().await.expect("run once");
    let step = match outcome {
        Some(StepOutcome::Finished(step)) => step,
        other => panic!("expected a finished step, got {other:?}"),
    };

    assert_eq!(step.status, StepStatus::Done);
    assert!(step.finished_at.is_some());
    assert!(step.output_hash.is_some());

    let task = engine.get_task(&task.task_id).await.expect("get task");
    assert_eq!(task.status(), TaskStatus::Done);
    assert!(task.finished_at().is_some());
    assert_counts_consistent(&engine).await;
}

#[tokio::test]
async fn crashed_worker_step_is_reclaimed_after_lease() {
    let (engine, clock) = engine_with_clock();
    let task = engine.create_task_record("scenario-b").await.expect("create task");
    engine.enqueue(NewStep::new(task.task_id.clone(), "slow", json!({}))).await.expect("enqueue");

    let claimed = engine.dequeue("w-crashed", LEASE).await.expect("dequeue").expect("one step");
    assert_eq!(claimed.status, StepStatus::Running);

    let reaper = Reaper::new(engine.clone(), LEASE);
    clock.advance(Duration::from_secs(5));
    assert!(reaper.sweep().await.expect("early sweep").is_empty());

    clock.advance(LEASE);
    let reclaimed = reaper.sweep().await.expect("sweep");
    assert_eq!(reclaimed, vec![claimed.key()]);

    let step = engine.get_step(&claimed.key()).await.expect("get step");
    assert_eq!(step.status, StepStatus::Pending);
    assert_eq!(step.retry_count, 1);
    assert!(step.owner_worker_id.is_none());

    let again = engine.dequeue("w-rescuer", LEASE).await.expect("dequeue").expect("claimable");
    assert_eq!(again.key(), claimed.key());
    assert_eq!(again.owner_worker_id.as_deref(), Some("w-rescuer"));
    assert_counts_consistent(&engine).await;
}

#[tokio::test]
async fn handler_error_fails_step_and_task() {
    let (engine, _clock) = engine_with_clock();
    let mut registry = HandlerRegistry::new();
    registry
        .register_fn("explode", |_input: Value, _ctx: StepContext| async move {
            Err::<Value, _>(HandlerError::new("boom"))
        })
        .expect("register explode");
    registry
        .register_fn("ok", |_input: Value, _ctx: StepContext| async move {
            Ok::<_, HandlerError>(json!(true))
        })
        .expect("register ok");

    let builder = engine.create_task("scenario-c").await.expect("create task");
    let task_id = builder.task_id().clone();
    builder
        .add_step("explode", json!({}))
        .await
        .expect("add failing step")
        .add_step("ok", json!({}))
        .await
        .expect("add ok step");

    let worker = worker("w-c", &engine, registry);
    match worker.run_once().await.expect("first run") {
        Some(StepOutcome::Failed(step)) => {
            assert_eq!(step.status, StepStatus::Failed);
            assert_eq!(step.error_message.as_deref(), Some("boom"));
        }
        other => panic!("expected a failed step, got {other:?}"),
    }

    let task = engine.get_task(&task_id).await.expect("get task");
    assert_eq!(task.status(), TaskStatus::Running, "sibling still pending");

    assert!(matches!(worker.run_once().await.expect("second run"), Some(StepOutcome::Finished(_))));

    let task = engine.get_task(&task_id).await.expect("get task");
    assert_eq!(task.status(), TaskStatus::Failed);
    assert_eq!(task.counts().failed_steps, 1);
    assert_eq!(task.counts().done_steps, 1);
    assert_counts_consistent(&engine).await;
}

#[tokio::test]
async fn spawned_children_reach_independent_outcomes() {
    let (engine, _clock) = engine_with_clock();
    let mut registry = HandlerRegistry::new();
    registry
        .register_fn("fan_out", |_input: Value, ctx: StepContext| async move {
            ctx.spawn("child", json!({ "fail": false })).await?;
            ctx.spawn("child", json!({ "fail": true })).await?;
            Ok::<_, HandlerError>(json!({ "spawned": 2 }))
        })
        .expect("register fan_out");
    registry
        .register_fn("child", |input: Value, _ctx: StepContext| async move {
            if input["fail"].as_bool().unwrap_or(false) {
                Err(HandlerError::new("child refused"))
            } else {
                Ok(json!("ok"))
            }
        })
        .expect("register child");

    let task = engine
        .create_task("scenario-d")
        .await
        .expect("create task")
        .add_step("fan_out", json!({}))
        .await
        .expect("add root")
        .build()
        .await
        .expect("build");
    assert_eq!(task.counts().total_steps, 1);

    let worker = worker("w-d", &engine, registry);
    assert!(matches!(worker.run_once().await.expect("root"), Some(StepOutcome::Finished(_))));

    let task_after_spawn = engine.get_task(&task.task_id).await.expect("get task");
    assert_eq!(task_after_spawn.counts().total_steps, 3);

    while worker.run_once().await.expect("drain").is_some() {}

    let steps = engine.list_steps(&task.task_id).await.expect("list steps");
    let children: Vec<_> = steps.iter().filter(|step| step.parent_step == Some(0)).collect();
    assert_eq!(children.len(), 2);
    let statuses: HashSet<_> = children.iter().map(|step| step.status).collect();
    assert_eq!(statuses, HashSet::from([StepStatus::Done, StepStatus::Failed]));

    let task = engine.get_task(&task.task_id).await.expect("get task");
    assert_eq!(task.status(), TaskStatus::Failed);
    assert_counts_consistent(&engine).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dequeue_of_one_step_has_one_winner() {
    let (engine, _clock) = engine_with_clock();
    let task = engine.create_task_record("scenario-e").await.expect("create task");
    engine.enqueue(NewStep::new(task.task_id.clone(), "only", json!({}))).await.expect("enqueue");

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.dequeue("w-1", LEASE).await })
    };
    let second = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.dequeue("w-2", LEASE).await })
    };

    let first = first.await.expect("join").expect("dequeue");
    let second = second.await.expect("join").expect("dequeue");
    assert_eq!(
        usize::from(first.is_some()) + usize::from(second.is_some()),
        1,
        "exactly one caller should receive the step"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dequeuers_never_share_a_step() {
    let (engine, _clock) = engine_with_clock();
    let task = engine.create_task_record("fan-in").await.expect("create task");
    for n in 0..40 {
        engine
            .enqueue(NewStep::new(task.task_id.clone(), "item", json!({ "n": n })))
            .await
            .expect("enqueue");
    }

    let mut joins = Vec::new();
    for worker_idx in 0..6 {
        let engine = engine.clone();
        joins.push(tokio::spawn(async move {
            let worker_id = format!("w-{worker_idx}");
            let mut claimed = Vec::new();
            while let Some(step) = engine.dequeue(&worker_id, LEASE).await.expect("dequeue") {
                claimed.push(step.key());
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    for join in joins {
        for key in join.await.expect("join") {
            assert!(seen.insert(key.clone()), "{key} was handed out twice");
        }
    }
    assert_eq!(seen.len(), 40);
    assert_counts_consistent(&engine).await;
}

#[tokio::test]
async fn reset_stale_only_touches_stale_running_steps() {
    let (engine, clock) = engine_with_clock();
    let task = engine.create_task_record("mixed").await.expect("create task");
    for name in ["done", "failed", "running", "pending"] {
        engine.enqueue(NewStep::new(task.task_id.clone(), name, json!({}))).await.expect("enqueue");
    }

    let done = engine.dequeue("w-1", LEASE).await.expect("dequeue").expect("step 0");
    let failed = engine.dequeue("w-1", LEASE).await.expect("dequeue").expect("step 1");
    let running = engine.dequeue("w-1", LEASE).await.expect("dequeue").expect("step 2");
    engine
        .finish(&done.key(), "w-1", ContentHash::of_bytes(b"out"), None)
        .await
        .expect("finish");
    engine.fail(&failed.key(), "w-1", "nope").await.expect("fail");

    clock.advance(Duration::from_secs(60));
    let reclaimed = engine.reset_stale(LEASE).await.expect("reset stale");
    assert_eq!(reclaimed, vec![running.key()]);

    assert_eq!(engine.get_step(&done.key()).await.expect("get").status, StepStatus::Done);
    assert_eq!(engine.get_step(&failed.key()).await.expect("get").status, StepStatus::Failed);
    assert_counts_consistent(&engine).await;
}

#[tokio::test]
async fn finished_step_is_never_dequeued_again() {
    let (engine, clock) = engine_with_clock();
    let task = engine.create_task_record("once").await.expect("create task");
    engine.enqueue(NewStep::new(task.task_id.clone(), "once", json!({}))).await.expect("enqueue");

    let step = engine.dequeue("w-1", LEASE).await.expect("dequeue").expect("claimed");
    engine
        .finish(&step.key(), "w-1", ContentHash::of_bytes(b"result"), None)
        .await
        .expect("finish");

    clock.advance(Duration::from_secs(3600));
    assert!(engine.reset_stale(LEASE).await.expect("reset").is_empty());
    assert!(engine.dequeue("w-2", LEASE).await.expect("dequeue").is_none());
    assert_eq!(engine.queue_depth().await.expect("depth"), 0);
}

#[tokio::test]
async fn finish_after_reclaim_is_rejected() {
    let (engine, clock) = engine_with_clock();
    let task = engine.create_task_record("late").await.expect("create task");
    engine.enqueue(NewStep::new(task.task_id.clone(), "late", json!({}))).await.expect("enqueue");

    let step = engine.dequeue("w-slow", LEASE).await.expect("dequeue").expect("claimed");
    clock.advance(Duration::from_secs(11));
    engine.reset_stale(LEASE).await.expect("reset");
    engine.dequeue("w-fast", LEASE).await.expect("dequeue").expect("reclaimed step");

    let error = engine
        .finish(&step.key(), "w-slow", ContentHash::of_bytes(b"late"), None)
        .await
        .expect_err("stale owner must not finish");
    assert!(error.is_lease_lost());

    let current = engine.get_step(&step.key()).await.expect("get");
    assert_eq!(current.owner_worker_id.as_deref(), Some("w-fast"));
    assert_counts_consistent(&engine).await;
}

#[test]
fn input_hash_is_stable_across_key_order() {
    let first = ContentHash::of_step_input("git.commit_meta", &json!({ "sha": "abc", "repo": "/r" }));
    let second =
        ContentHash::of_step_input("git.commit_meta", &json!({ "repo": "/r", "sha": "abc" }));
    assert_eq!(first, second);
    assert!(first.as_str().starts_with("sha256:"));

    let other_handler =
        ContentHash::of_step_input("git.list_commits", &json!({ "sha": "abc", "repo": "/r" }));
    assert_ne!(first, other_handler);
}
