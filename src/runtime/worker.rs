//! Per-robot task worker.
//!
//! Pulls tasks off its robot's queue one at a time and hands them to the
//! engine, so at most one task is ever in progress per robot. The worker
//! marks the robot busy for the dispatcher before running and re-signals
//! availability afterwards. It re-signals even after skipping a task that
//! was cancelled while queued, so the robot's slot is never leaked.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::engine::TaskEngine;
use super::store::SharedTask;
use super::task::TaskStatus;

pub(crate) struct Worker {
    pub robot_id: String,
    pub queue: mpsc::UnboundedReceiver<SharedTask>,
    pub engine: TaskEngine,
    pub current_tasks: Arc<DashMap<String, String>>,
    pub available_tx: mpsc::UnboundedSender<String>,
    pub shutdown: CancellationToken,
}

impl Worker {
    pub async fn run(mut self) {
        info!(robot_id = %self.robot_id, "task worker started");

        loop {
            let task = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                maybe = self.queue.recv() => match maybe {
                    Some(t) => t,
                    None => break,
                },
            };

            let (task_id, status) = {
                let t = task.lock().expect("task lock poisoned");
                (t.task_id.clone(), t.status)
            };

            if status == TaskStatus::Cancelled {
                info!(
                    robot_id = %self.robot_id,
                    task_id = %task_id,
                    "skipping task cancelled while queued"
                );
                let _ = self.available_tx.send(self.robot_id.clone());
                continue;
            }

            self.current_tasks
                .insert(self.robot_id.clone(), task_id.clone());
            self.engine.run_task(task).await;
            self.current_tasks.remove(&self.robot_id);

            let _ = self.available_tx.send(self.robot_id.clone());
            info!(robot_id = %self.robot_id, task_id = %task_id, "robot released");
        }

        info!(robot_id = %self.robot_id, "task worker stopped");
    }
}
