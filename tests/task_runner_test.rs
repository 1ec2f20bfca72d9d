//! Worker pool and task store scenarios.
//!
//! Every test uses a scripted agent with artificial latency so concurrency
//! and poll behavior are observable without a real provider.

use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use takt::agent::{AgentRunner, ScriptedRunner};
use takt::piece::Piece;
use takt::task::{
    run_with_worker_pool, PoolOutcome, TaskSeed, TaskStatus, TaskStore, UserOptions,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn one_shot_piece() -> Arc<Piece> {
    Arc::new(
        Piece::from_yaml(
            r#"
name: one-shot
max_movements: 3
initial_movement: work
movements:
  - name: work
    persona: worker
    instruction: "Do: {task}"
    rules:
      - condition: done
        next: COMPLETE
      - condition: stuck
        next: ABORT
"#,
        )
        .unwrap(),
    )
}

async fn seeded_store(dir: &tempfile::TempDir, count: usize) -> Arc<TaskStore> {
    let store = Arc::new(TaskStore::new(dir.path().join("tasks.yaml")));
    for i in 0..count {
        store
            .add_task(&format!("task-{}", i), "do the work", TaskSeed::default())
            .await
            .unwrap();
    }
    store
}

// ---------------------------------------------------------------------------
// S6: pool progress, concurrency cap, wall-clock bound
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s6_pool_runs_five_tasks_with_concurrency_two() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(&dir, 5).await;
    let runner = Arc::new(
        ScriptedRunner::new()
            .with_default("done [WORK:1]")
            .with_delay(Duration::from_millis(50)),
    );
    let agent: Arc<dyn AgentRunner> = runner.clone();

    let initial = store.claim_next_tasks(2).await.unwrap();
    let started = Instant::now();

    let outcome = run_with_worker_pool(
        store.clone(),
        initial,
        2,
        dir.path(),
        one_shot_piece(),
        agent,
        UserOptions::default(),
        30,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let elapsed = started.elapsed();

    assert_eq!(outcome, PoolOutcome { success: 5, fail: 0 });
    // 5 tasks at 50ms each over 2 slots: three waves, well under serial time
    assert!(
        elapsed < Duration::from_millis(500),
        "pool took {:?}",
        elapsed
    );
    // The concurrency cap held at every instant
    assert!(runner.max_active() <= 2, "max_active = {}", runner.max_active());

    let tasks = store.list().await.unwrap();
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));
}

#[tokio::test]
async fn pool_concurrency_cap_holds_under_load() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(&dir, 8).await;
    let runner = Arc::new(
        ScriptedRunner::new()
            .with_default("done [WORK:1]")
            .with_delay(Duration::from_millis(20)),
    );
    let agent: Arc<dyn AgentRunner> = runner.clone();

    let initial = store.claim_next_tasks(3).await.unwrap();
    run_with_worker_pool(
        store,
        initial,
        3,
        dir.path(),
        one_shot_piece(),
        agent,
        UserOptions::default(),
        10,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(runner.max_active() <= 3, "max_active = {}", runner.max_active());
}

// ---------------------------------------------------------------------------
// Poll-interval pickup of tasks added mid-run
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pool_picks_up_task_added_mid_run() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(&dir, 1).await;
    let runner = Arc::new(
        ScriptedRunner::new()
            .with_default("done [WORK:1]")
            .with_delay(Duration::from_millis(200)),
    );
    let agent: Arc<dyn AgentRunner> = runner.clone();

    let initial = store.claim_next_tasks(2).await.unwrap();
    assert_eq!(initial.len(), 1);

    // Add a second task shortly after the pool starts; only the poll timer
    // can pick it up while the first task still occupies its slot.
    let late_store = store.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        late_store
            .add_task("late-arrival", "more work", TaskSeed::default())
            .await
            .unwrap();
    });

    let outcome = run_with_worker_pool(
        store.clone(),
        initial,
        2,
        dir.path(),
        one_shot_piece(),
        agent,
        UserOptions::default(),
        25,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome, PoolOutcome { success: 2, fail: 0 });
    // Both ran concurrently, which proves the poll picked the second task
    // up before the first one finished.
    assert_eq!(runner.max_active(), 2);

    let late = store.get("late-arrival").await.unwrap().unwrap();
    assert_eq!(late.status, TaskStatus::Completed);
}

// ---------------------------------------------------------------------------
// Cancellation: no new work after the signal, started work settles
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pool_cancellation_stops_dispatch_and_settles() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(&dir, 3).await;
    let runner = Arc::new(
        ScriptedRunner::new()
            .with_default("done [WORK:1]")
            .with_delay(Duration::from_millis(150)),
    );
    let agent: Arc<dyn AgentRunner> = runner.clone();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(220)).await;
        trigger.cancel();
    });

    let initial = store.claim_next_tasks(1).await.unwrap();
    let outcome = run_with_worker_pool(
        store.clone(),
        initial,
        1,
        dir.path(),
        one_shot_piece(),
        agent,
        UserOptions::default(),
        20,
        cancel,
    )
    .await
    .unwrap();

    // First task completed before the signal; the second was cancelled
    // mid-flight; the third was never started.
    assert_eq!(outcome.success, 1);
    assert_eq!(outcome.fail, 1);

    let tasks = store.list().await.unwrap();
    let status_of = |name: &str| {
        tasks
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.status)
            .unwrap()
    };
    assert_eq!(status_of("task-0"), TaskStatus::Completed);
    assert_eq!(status_of("task-1"), TaskStatus::Failed);
    assert_eq!(status_of("task-2"), TaskStatus::Pending);

    let failed = tasks.iter().find(|t| t.name == "task-1").unwrap();
    assert!(failed
        .failure
        .as_ref()
        .unwrap()
        .error
        .as_ref()
        .unwrap()
        .contains("cancelled"));
}

// ---------------------------------------------------------------------------
// Failed tasks do not abort the pool
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pool_counts_failures_and_continues() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(&dir, 3).await;
    // Second task hits the ABORT rule; the others succeed
    let runner = Arc::new(ScriptedRunner::with_responses([
        "done [WORK:1]",
        "cannot continue [WORK:2]",
        "done [WORK:1]",
    ]));
    let agent: Arc<dyn AgentRunner> = runner.clone();

    let initial = store.claim_next_tasks(1).await.unwrap();
    let outcome = run_with_worker_pool(
        store.clone(),
        initial,
        1,
        dir.path(),
        one_shot_piece(),
        agent,
        UserOptions::default(),
        20,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome, PoolOutcome { success: 2, fail: 1 });

    let tasks = store.list().await.unwrap();
    let failed: Vec<_> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].name, "task-1");
    assert_eq!(
        failed[0].failure.as_ref().unwrap().movement.as_deref(),
        Some("work")
    );
}

// ---------------------------------------------------------------------------
// Sequential pools keep running when the store has a burst of tasks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sequential_pool_drains_in_fifo_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(&dir, 4).await;
    let runner = Arc::new(ScriptedRunner::new().with_default("done [WORK:1]"));
    let agent: Arc<dyn AgentRunner> = runner.clone();

    let initial = store.claim_next_tasks(1).await.unwrap();
    let outcome = run_with_worker_pool(
        store.clone(),
        initial,
        1,
        dir.path(),
        one_shot_piece(),
        agent,
        UserOptions::default(),
        20,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome, PoolOutcome { success: 4, fail: 0 });

    // Completion order follows creation order under a single slot
    let tasks = store.list().await.unwrap();
    let mut completed: Vec<_> = tasks
        .iter()
        .map(|t| (t.name.clone(), t.completed_at.unwrap()))
        .collect();
    completed.sort_by_key(|(_, at)| *at);
    let names: Vec<_> = completed.into_iter().map(|(name, _)| name).collect();
    assert_eq!(names, vec!["task-0", "task-1", "task-2", "task-3"]);
}
