//! Task dispatcher.
//!
//! One process-wide loop that owns the global submission queue: pinned
//! tasks go straight to their robot's queue (or fail fast when the robot is
//! unknown), unpinned tasks wait for a robot to signal availability. A busy
//! robot's signal is requeued at the tail so the next signal gets a chance.
//!
//! The dispatcher never performs blocking I/O; it only suspends on queue
//! waits. It also hosts the periodic store sweep that evicts terminal tasks
//! past their grace period.

use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::store::{SharedTask, TaskStore};
use super::task::TaskStatus;
use crate::config::StoreConfig;

pub(crate) struct Dispatcher {
    pub global_rx: mpsc::UnboundedReceiver<SharedTask>,
    pub available_rx: mpsc::UnboundedReceiver<String>,
    pub available_tx: mpsc::UnboundedSender<String>,
    pub robot_queues: Arc<DashMap<String, mpsc::UnboundedSender<SharedTask>>>,
    pub current_tasks: Arc<DashMap<String, String>>,
    pub store: Arc<TaskStore>,
    pub store_config: StoreConfig,
    pub shutdown: CancellationToken,
}

impl Dispatcher {
    pub async fn run(mut self) {
        info!("dispatcher started");

        let mut sweep = tokio::time::interval(self.store_config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                _ = sweep.tick() => {
                    self.store.evict_terminal(self.store_config.terminal_grace);
                }

                maybe = self.global_rx.recv() => {
                    match maybe {
                        Some(task) => self.route(task).await,
                        None => break,
                    }
                }
            }
        }

        info!("dispatcher stopped");
    }

    async fn route(&mut self, task: SharedTask) {
        let (task_id, pinned) = {
            let t = task.lock().expect("task lock poisoned");
            (t.task_id.clone(), t.robot_id.clone())
        };

        if let Some(robot_id) = pinned {
            match self.robot_queues.get(&robot_id) {
                Some(queue) => {
                    let _ = queue.send(task);
                    info!(task_id = %task_id, robot_id = %robot_id, "task routed to pinned robot");
                }
                None => {
                    let mut t = task.lock().expect("task lock poisoned");
                    if t.transition(TaskStatus::Failed).is_ok() {
                        t.finished_at = Some(Utc::now());
                        t.metadata.insert(
                            "error".to_string(),
                            json!(format!("unknown robot '{robot_id}'")),
                        );
                    }
                    error!(task_id = %task_id, robot_id = %robot_id, "task rejected: unknown robot");
                }
            }
            return;
        }

        // Unpinned: hand it to the first robot that is genuinely free.
        loop {
            let robot_id = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return,
                maybe = self.available_rx.recv() => match maybe {
                    Some(r) => r,
                    None => return,
                },
            };

            let busy = self.current_tasks.contains_key(&robot_id);
            let known = self.robot_queues.contains_key(&robot_id);
            if busy || !known {
                warn!(
                    task_id = %task_id,
                    robot_id = %robot_id,
                    busy,
                    "availability signal unusable, requeueing it"
                );
                if known {
                    let _ = self.available_tx.send(robot_id);
                }
                // The same signal would come straight back; give the fleet a
                // beat to change state.
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }

            {
                let mut t = task.lock().expect("task lock poisoned");
                t.robot_id = Some(robot_id.clone());
            }
            if let Some(queue) = self.robot_queues.get(&robot_id) {
                let _ = queue.send(task);
                info!(task_id = %task_id, robot_id = %robot_id, "task assigned to available robot");
            }
            return;
        }
    }
}
