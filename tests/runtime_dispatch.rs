//! Dispatcher, worker, and runtime-surface behavior.

mod helpers;

use helpers::{MockBioSensor, ROBOT};

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use biopatrol::config::Config;
use biopatrol::fleet::{FleetGateway, MockRobotRpc, RobotRpc};
use biopatrol::notify::{Notifier, RecordingNotifier};
use biopatrol::runtime::{PatrolRuntime, Task, TaskStatus};
use biopatrol::sensor::{MemoryScanRecorder, ScanRecorder};

struct RuntimeHarness {
    rpc: Arc<MockRobotRpc>,
    notifier: Arc<RecordingNotifier>,
    runtime: PatrolRuntime,
}

fn runtime() -> RuntimeHarness {
    let config = Config::default();
    let rpc = Arc::new(MockRobotRpc::new());
    let fleet = Arc::new(FleetGateway::new(
        Arc::clone(&rpc) as Arc<dyn RobotRpc>,
        &config.fleet,
        &config.retry,
    ));
    let notifier = Arc::new(RecordingNotifier::new());
    let runtime = PatrolRuntime::new(
        fleet,
        Arc::new(MockBioSensor::valid()),
        Arc::new(MemoryScanRecorder::new()) as Arc<dyn ScanRecorder>,
        Arc::clone(&notifier) as Arc<dyn Notifier>,
        config,
    );
    RuntimeHarness {
        rpc,
        notifier,
        runtime,
    }
}

fn task_json(task_id: &str, robot_id: Option<&str>, steps: Value) -> Task {
    let mut raw = json!({ "task_id": task_id, "steps": steps });
    if let Some(robot) = robot_id {
        raw["robot_id"] = json!(robot);
    }
    serde_json::from_value(raw).expect("task fixture must parse")
}

fn wait_steps(seconds: f64) -> Value {
    json!([{ "step_id": "w1", "action": "wait", "params": { "seconds": seconds } }])
}

/// Polls until the task reaches `expected` or the budget runs out.
async fn wait_for_status(runtime: &PatrolRuntime, task_id: &str, expected: TaskStatus) {
    for _ in 0..400 {
        if runtime.get(task_id).map(|t| t.status) == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!(
        "task {task_id} never reached {expected}, last seen {:?}",
        runtime.get(task_id).map(|t| t.status)
    );
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test(start_paused = true)]
async fn unknown_robot_fails_without_stalling_the_queue() {
    let h = runtime();
    h.runtime.register_robot(ROBOT);

    let ghost_id = h
        .runtime
        .submit(task_json("ghost-task", Some("ghost"), wait_steps(0.1)));
    wait_for_status(&h.runtime, &ghost_id, TaskStatus::Failed).await;

    let snapshot = h.runtime.get(&ghost_id).unwrap();
    assert!(snapshot.metadata["error"]
        .as_str()
        .unwrap()
        .contains("unknown robot"));
    // The engine was never involved.
    assert_eq!(snapshot.started_at, None);

    // The global queue keeps flowing.
    let ok_id = h
        .runtime
        .submit(task_json("after-ghost", Some(ROBOT), wait_steps(0.1)));
    wait_for_status(&h.runtime, &ok_id, TaskStatus::Done).await;
}

#[tokio::test(start_paused = true)]
async fn unpinned_task_lands_on_an_available_robot() {
    let h = runtime();
    h.runtime.register_robot(ROBOT);

    let task_id = h.runtime.submit(task_json("free", None, wait_steps(0.1)));
    wait_for_status(&h.runtime, &task_id, TaskStatus::Done).await;

    let snapshot = h.runtime.get(&task_id).unwrap();
    assert_eq!(snapshot.robot_id.as_deref(), Some(ROBOT));
}

#[tokio::test(start_paused = true)]
async fn per_robot_tasks_run_in_order_one_at_a_time() {
    let h = runtime();
    h.runtime.register_robot(ROBOT);

    for i in 0..3 {
        h.runtime.submit(task_json(
            &format!("ordered-{i}"),
            Some(ROBOT),
            json!([{ "step_id": "s", "action": "speak",
                     "params": { "speak_text": format!("task {i}") } }]),
        ));
    }

    for i in 0..3 {
        wait_for_status(&h.runtime, &format!("ordered-{i}"), TaskStatus::Done).await;
    }

    // The robot spoke the lines in submission order.
    let spoken: Vec<String> = h
        .rpc
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("speak"))
        .collect();
    assert_eq!(spoken, vec!["speak task 0", "speak task 1", "speak task 2"]);
}

#[tokio::test(start_paused = true)]
async fn at_most_one_task_in_progress_per_robot() {
    let h = runtime();
    h.runtime.register_robot(ROBOT);

    h.runtime
        .submit(task_json("slow-1", Some(ROBOT), wait_steps(5.0)));
    h.runtime
        .submit(task_json("slow-2", Some(ROBOT), wait_steps(5.0)));

    wait_for_status(&h.runtime, "slow-1", TaskStatus::InProgress).await;

    // While the first runs, the second must still be queued.
    for _ in 0..30 {
        let first = h.runtime.get("slow-1").unwrap().status;
        let second = h.runtime.get("slow-2").unwrap().status;
        let in_progress = [first, second]
            .iter()
            .filter(|s| **s == TaskStatus::InProgress)
            .count();
        assert!(in_progress <= 1, "both tasks in progress");
        if first == TaskStatus::Done {
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    wait_for_status(&h.runtime, "slow-2", TaskStatus::Done).await;
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn cancelling_a_running_task_is_idempotent() {
    let h = runtime();
    h.runtime.register_robot(ROBOT);

    let task_id = h.runtime.submit(task_json(
        "to-cancel",
        Some(ROBOT),
        json!([
            { "step_id": "w1", "action": "wait", "params": { "seconds": 10.0 } },
            { "step_id": "s2", "action": "speak",
              "params": { "speak_text": "never spoken" } }
        ]),
    ));
    wait_for_status(&h.runtime, &task_id, TaskStatus::InProgress).await;

    // Any number of cancels is equivalent to one.
    assert!(h.runtime.cancel(&task_id).await);
    assert!(h.runtime.cancel(&task_id).await);
    assert!(h.runtime.cancel(&task_id).await);

    wait_for_status(&h.runtime, &task_id, TaskStatus::Cancelled).await;
    let snapshot = h.runtime.get(&task_id).unwrap();
    assert_eq!(snapshot.steps[1].status, biopatrol::runtime::StepStatus::Pending);
    assert_eq!(h.rpc.call_count("speak"), 0);

    // Cancel after terminal still reports cancelled; unknown ids do not.
    assert!(h.runtime.cancel(&task_id).await);
    assert!(!h.runtime.cancel("missing").await);
}

#[tokio::test(start_paused = true)]
async fn cancel_of_a_finished_task_does_not_rewrite_history() {
    let h = runtime();
    h.runtime.register_robot(ROBOT);

    let task_id = h.runtime.submit(task_json("done", Some(ROBOT), wait_steps(0.1)));
    wait_for_status(&h.runtime, &task_id, TaskStatus::Done).await;

    assert!(!h.runtime.cancel(&task_id).await);
    assert_eq!(h.runtime.get(&task_id).unwrap().status, TaskStatus::Done);
}

#[tokio::test(start_paused = true)]
async fn task_cancelled_while_queued_never_runs_and_frees_the_robot() {
    let h = runtime();
    h.runtime.register_robot(ROBOT);

    h.runtime
        .submit(task_json("blocker", Some(ROBOT), wait_steps(5.0)));
    let queued_id = h.runtime.submit(task_json(
        "queued",
        Some(ROBOT),
        json!([{ "step_id": "s", "action": "speak",
                 "params": { "speak_text": "queued task" } }]),
    ));

    wait_for_status(&h.runtime, "blocker", TaskStatus::InProgress).await;
    assert!(h.runtime.cancel(&queued_id).await);
    wait_for_status(&h.runtime, &queued_id, TaskStatus::Cancelled).await;

    // The cancelled task is skipped entirely...
    wait_for_status(&h.runtime, "blocker", TaskStatus::Done).await;
    assert_eq!(h.rpc.call_count("speak"), 0);
    assert_eq!(h.runtime.get(&queued_id).unwrap().started_at, None);

    // ...and the robot still serves later work, including unpinned tasks.
    let next_id = h.runtime.submit(task_json("next", None, wait_steps(0.1)));
    wait_for_status(&h.runtime, &next_id, TaskStatus::Done).await;
}

// ============================================================================
// Submission surface
// ============================================================================

#[tokio::test(start_paused = true)]
async fn submit_assigns_an_id_when_missing() {
    let h = runtime();
    h.runtime.register_robot(ROBOT);

    let task = task_json("", Some(ROBOT), wait_steps(0.1));
    let task_id = h.runtime.submit(task);
    assert!(!task_id.is_empty());
    wait_for_status(&h.runtime, &task_id, TaskStatus::Done).await;

    // Every terminal task produced a summary notification.
    assert!(h
        .notifier
        .messages()
        .iter()
        .any(|m| m.contains("completed 0 of 0 beds")));
}
