//! The patrol task runtime: task model, store, dispatcher, per-robot
//! workers, step engine, and the shelf-carriage monitor.
//!
//! [`PatrolRuntime`] is the single entry point: register robots, submit
//! tasks, cancel them, query snapshots. All shared state lives inside the
//! runtime value; nothing is global.

mod dispatcher;
pub mod engine;
pub mod monitor;
pub mod store;
pub mod task;
mod worker;

pub use engine::{classify_failure, FailureAction, TaskEngine};
pub use monitor::ShelfMonitor;
pub use store::{SharedTask, TaskStore};
pub use task::{
    validate_skip_targets, CommandParseError, Step, StepCommand, StepResult, StepStatus, Task,
    TaskError, TaskStatus,
};

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::fleet::FleetGateway;
use crate::notify::Notifier;
use crate::sensor::{BioSensorClient, ScanRecorder};

/// Process-wide task runtime.
///
/// Owns the task store, the global submission queue, per-robot queues, the
/// availability channel, and the busy map. Dropping the runtime does not
/// stop spawned loops; call [`PatrolRuntime::shutdown`] for that.
pub struct PatrolRuntime {
    fleet: Arc<FleetGateway>,
    sensor: Arc<dyn BioSensorClient>,
    recorder: Arc<dyn ScanRecorder>,
    notifier: Arc<dyn Notifier>,
    config: Config,
    store: Arc<TaskStore>,
    global_tx: mpsc::UnboundedSender<SharedTask>,
    available_tx: mpsc::UnboundedSender<String>,
    robot_queues: Arc<DashMap<String, mpsc::UnboundedSender<SharedTask>>>,
    current_tasks: Arc<DashMap<String, String>>,
    shutdown: CancellationToken,
}

impl PatrolRuntime {
    /// Builds the runtime and spawns the dispatcher loop.
    #[must_use]
    pub fn new(
        fleet: Arc<FleetGateway>,
        sensor: Arc<dyn BioSensorClient>,
        recorder: Arc<dyn ScanRecorder>,
        notifier: Arc<dyn Notifier>,
        config: Config,
    ) -> Self {
        let (global_tx, global_rx) = mpsc::unbounded_channel();
        let (available_tx, available_rx) = mpsc::unbounded_channel();
        let robot_queues = Arc::new(DashMap::new());
        let current_tasks = Arc::new(DashMap::new());
        let store = Arc::new(TaskStore::new());
        let shutdown = CancellationToken::new();

        tokio::spawn(
            dispatcher::Dispatcher {
                global_rx,
                available_rx,
                available_tx: available_tx.clone(),
                robot_queues: Arc::clone(&robot_queues),
                current_tasks: Arc::clone(&current_tasks),
                store: Arc::clone(&store),
                store_config: config.store.clone(),
                shutdown: shutdown.clone(),
            }
            .run(),
        );

        Self {
            fleet,
            sensor,
            recorder,
            notifier,
            config,
            store,
            global_tx,
            available_tx,
            robot_queues,
            current_tasks,
            shutdown,
        }
    }

    /// Registers a robot: creates its queue, spawns its worker, and seeds
    /// the availability channel with it.
    pub fn register_robot(&self, robot_id: &str) {
        if self.robot_queues.contains_key(robot_id) {
            warn!(robot_id = %robot_id, "robot already registered");
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.robot_queues.insert(robot_id.to_string(), tx);

        let engine = TaskEngine::new(
            Arc::clone(&self.fleet),
            robot_id,
            Arc::clone(&self.sensor),
            Arc::clone(&self.recorder),
            Arc::clone(&self.notifier),
            self.config.clone(),
        );
        tokio::spawn(
            worker::Worker {
                robot_id: robot_id.to_string(),
                queue: rx,
                engine,
                current_tasks: Arc::clone(&self.current_tasks),
                available_tx: self.available_tx.clone(),
                shutdown: self.shutdown.clone(),
            }
            .run(),
        );

        let _ = self.available_tx.send(robot_id.to_string());
        info!(robot_id = %robot_id, "robot registered");
    }

    /// Accepts a task and enqueues it for dispatch. Returns the task id
    /// (generated when the caller supplied none). Blocks only to enqueue.
    pub fn submit(&self, mut task: Task) -> String {
        if task.task_id.is_empty() {
            task.task_id = Uuid::new_v4().to_string();
        }
        task.status = TaskStatus::Queued;

        for warning in validate_skip_targets(&task) {
            warn!(task_id = %task.task_id, %warning, "task validation");
        }

        let task_id = task.task_id.clone();
        let shared = self.store.insert(task);
        let _ = self.global_tx.send(shared);
        info!(task_id = %task_id, "task submitted");
        task_id
    }

    /// Cancels a task. Idempotent: repeated calls are equivalent to one.
    ///
    /// Returns true when the task is cancelled (now or previously), false
    /// for unknown ids or tasks already in another terminal state. The
    /// engine observes the cancellation at its next loop boundary; when the
    /// task is currently executing, the in-flight robot command is
    /// cancelled best-effort.
    pub async fn cancel(&self, task_id: &str) -> bool {
        let Some(before) = self.store.cancel(task_id) else {
            return false;
        };
        let Some(snapshot) = self.store.snapshot(task_id) else {
            return false;
        };
        if snapshot.status != TaskStatus::Cancelled {
            return false;
        }

        if before == TaskStatus::InProgress {
            if let Some(robot_id) = snapshot.robot_id {
                let executing_here = self
                    .current_tasks
                    .get(&robot_id)
                    .is_some_and(|e| e.value() == task_id);
                if executing_here {
                    let result = self.fleet.cancel_command(&robot_id).await;
                    if !result.ok {
                        debug!(
                            task_id = %task_id,
                            robot_id = %robot_id,
                            error = %result.error,
                            "cancel_command for cancelled task failed"
                        );
                    }
                }
            }
        }
        true
    }

    /// Snapshot of a task: status, steps, metadata.
    #[must_use]
    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.store.snapshot(task_id)
    }

    /// Number of tasks currently held by the store (terminal included,
    /// until eviction).
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.store.len()
    }

    /// Stops the dispatcher and all workers at their next suspension point.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        info!("runtime shutdown requested");
    }
}

impl std::fmt::Debug for PatrolRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatrolRuntime")
            .field("robots", &self.robot_queues.len())
            .field("tasks", &self.store.len())
            .field("busy", &self.current_tasks.len())
            .finish()
    }
}
