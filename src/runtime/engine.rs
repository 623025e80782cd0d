//! Task engine — the per-task step state machine.
//!
//! Executes one task's steps in order against the Fleet Gateway, applying
//! the ordered failure policy:
//!
//! 1. conditional skip: a failed step with `skip_on_failure` marks its
//!    targets and the patrol continues,
//! 2. non-critical actions fail alone and the patrol continues,
//! 3. anything else fails the task.
//!
//! A shelf drop overrides all of that. The flag raised by the background
//! [`ShelfMonitor`] is observed at two deterministic points (the top of
//! each iteration, and right after a step returns) and routes into the drop
//! handler. External cancellation is observed only at iteration boundaries:
//! a step in flight is never interrupted mid-RPC, its result is recorded,
//! then the loop exits and the finalizer returns the shelf and sends the
//! robot home, best-effort.

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::monitor::ShelfMonitor;
use super::store::SharedTask;
use super::task::{Step, StepCommand, StepResult, StepStatus, TaskStatus};
use crate::config::Config;
use crate::fleet::{CommandResult, FleetGateway, Pose};
use crate::notify::Notifier;
use crate::sensor::{BioSensorClient, ScanRecorder, ScanRow};

// ============================================================================
// Failure classifier
// ============================================================================

/// What the engine does with a failed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureAction {
    /// Mark the listed steps skipped and continue with the next step.
    SkipAndContinue(Vec<String>),
    /// Log and continue; the action is tolerable on its own.
    Continue,
    /// Fail the task and stop.
    Abort,
}

/// Pure classification of a step failure, in strict priority order.
#[must_use]
pub fn classify_failure(step: &Step) -> FailureAction {
    if !step.skip_on_failure.is_empty() {
        FailureAction::SkipAndContinue(step.skip_on_failure.clone())
    } else if step.is_non_critical() {
        FailureAction::Continue
    } else {
        FailureAction::Abort
    }
}

// ============================================================================
// Engine state
// ============================================================================

#[derive(Debug, Clone)]
struct SkipReason {
    failed_step_id: String,
    error_code: i32,
    error_message: String,
    /// Operator-facing reason, also written to the skipped bed's scan row.
    details: String,
    original_error: Value,
}

#[derive(Debug, Clone, Serialize)]
struct RemainingBed {
    bed_key: String,
    location_id: String,
}

/// Executes tasks for one robot, one at a time.
pub struct TaskEngine {
    fleet: Arc<FleetGateway>,
    robot_id: String,
    sensor: Arc<dyn BioSensorClient>,
    recorder: Arc<dyn ScanRecorder>,
    notifier: Arc<dyn Notifier>,
    config: Config,

    current_task_id: String,
    /// Location of the last shelf delivery; consumed by bio_scan steps.
    target_bed: Option<String>,
    /// Shelf last successfully moved. Survives `return_shelf` so cancel
    /// cleanup can still attempt a return.
    current_shelf_id: Option<String>,
    /// Written only by the shelf monitor, observed by the step loop.
    shelf_dropped: Arc<AtomicBool>,
    monitor: Option<ShelfMonitor>,
    skipped_steps: HashSet<String>,
    skip_reasons: HashMap<String, SkipReason>,
}

impl TaskEngine {
    #[must_use]
    pub fn new(
        fleet: Arc<FleetGateway>,
        robot_id: impl Into<String>,
        sensor: Arc<dyn BioSensorClient>,
        recorder: Arc<dyn ScanRecorder>,
        notifier: Arc<dyn Notifier>,
        config: Config,
    ) -> Self {
        Self {
            fleet,
            robot_id: robot_id.into(),
            sensor,
            recorder,
            notifier,
            config,
            current_task_id: String::new(),
            target_bed: None,
            current_shelf_id: None,
            shelf_dropped: Arc::new(AtomicBool::new(false)),
            monitor: None,
            skipped_steps: HashSet::new(),
            skip_reasons: HashMap::new(),
        }
    }

    /// Runs a task to a terminal state. The finalizer (monitor stop, cancel
    /// cleanup, summary notification) runs on every exit path.
    pub async fn run_task(&mut self, task: SharedTask) {
        self.target_bed = None;
        self.current_shelf_id = None;
        self.shelf_dropped = Arc::new(AtomicBool::new(false));
        self.monitor = None;
        self.skipped_steps.clear();
        self.skip_reasons.clear();

        if let Err(e) = self.fleet.refresh_names(&self.robot_id).await {
            warn!(robot_id = %self.robot_id, error = %e, "failed to refresh name cache");
        }

        let step_count = {
            let mut t = task.lock().expect("task lock poisoned");
            if let Err(e) = t.transition(TaskStatus::InProgress) {
                // Cancelled between the worker's check and here; nothing ran.
                debug!(task_id = %t.task_id, error = %e, "task not startable");
                return;
            }
            t.started_at = Some(Utc::now());
            self.current_task_id = t.task_id.clone();
            t.steps.len()
        };
        info!(
            task_id = %self.current_task_id,
            robot_id = %self.robot_id,
            steps = step_count,
            "starting task"
        );

        self.run_steps(&task, step_count).await;
        self.finalize(&task).await;
    }

    fn status(&self, task: &SharedTask) -> TaskStatus {
        task.lock().expect("task lock poisoned").status
    }

    fn dropped(&self) -> bool {
        self.shelf_dropped.load(Ordering::SeqCst)
    }

    // ── main loop ────────────────────────────────────────────────────────

    async fn run_steps(&mut self, task: &SharedTask, step_count: usize) {
        for index in 0..step_count {
            if self.status(task) == TaskStatus::Cancelled {
                info!(
                    task_id = %self.current_task_id,
                    robot_id = %self.robot_id,
                    "task cancelled mid-execution"
                );
                break;
            }

            if self.dropped() {
                self.handle_shelf_drop(task, index, None).await;
                break;
            }

            let (step_id, action, params, skip) = {
                let t = task.lock().expect("task lock poisoned");
                let s = &t.steps[index];
                (
                    s.step_id.clone(),
                    s.action.clone(),
                    s.params.clone(),
                    self.skipped_steps.contains(&s.step_id),
                )
            };

            if skip {
                self.apply_conditional_skip(task, index).await;
                continue;
            }

            info!(
                task_id = %self.current_task_id,
                step_id = %step_id,
                action = %action,
                params = %self.format_params(&params),
                "executing step"
            );
            {
                let mut t = task.lock().expect("task lock poisoned");
                t.steps[index].status = StepStatus::Executing;
            }

            let result = self.execute_step(&action, &params).await;
            let success = result.success;
            {
                let mut t = task.lock().expect("task lock poisoned");
                let s = &mut t.steps[index];
                s.status = if success {
                    StepStatus::Success
                } else {
                    StepStatus::Fail
                };
                s.result = Some(result.clone());
            }

            // Trigger path: the drop happened while this step was in flight.
            // Takes precedence over the failure classifier.
            if self.dropped() {
                self.handle_shelf_drop(task, index, Some(index)).await;
                break;
            }

            if success {
                info!(
                    task_id = %self.current_task_id,
                    step_id = %step_id,
                    "step completed"
                );
                continue;
            }

            warn!(
                task_id = %self.current_task_id,
                step_id = %step_id,
                error_code = result.error_code,
                error = %result.error_message,
                "step failed"
            );

            let step_snapshot = task.lock().expect("task lock poisoned").steps[index].clone();
            match classify_failure(&step_snapshot) {
                FailureAction::SkipAndContinue(targets) => {
                    self.register_skips(&step_snapshot, &result, &targets);
                }
                FailureAction::Continue => {
                    warn!(
                        task_id = %self.current_task_id,
                        step_id = %step_id,
                        action = %action,
                        "non-critical step failed, continuing"
                    );
                }
                FailureAction::Abort => {
                    let mut t = task.lock().expect("task lock poisoned");
                    if let Err(e) = t.transition(TaskStatus::Failed) {
                        // Already terminal (external cancel won the race).
                        debug!(task_id = %t.task_id, error = %e, "abort transition rejected");
                    }
                    break;
                }
            }
        }
    }

    fn register_skips(&mut self, step: &Step, result: &StepResult, targets: &[String]) {
        let details = match step.action.as_str() {
            "move_shelf" | "move_to_location" => "robot could not move to bedside".to_string(),
            _ => format!("step {} failed", step.step_id),
        };
        for target in targets {
            self.skipped_steps.insert(target.clone());
            self.skip_reasons.insert(
                target.clone(),
                SkipReason {
                    failed_step_id: step.step_id.clone(),
                    error_code: result.error_code,
                    error_message: result.error_message.clone(),
                    details: details.clone(),
                    original_error: result.data.clone(),
                },
            );
        }
        info!(
            task_id = %self.current_task_id,
            step_id = %step.step_id,
            targets = ?targets,
            "conditional skip registered"
        );
    }

    async fn apply_conditional_skip(&mut self, task: &SharedTask, index: usize) {
        let (step_id, action, bed_key) = {
            let t = task.lock().expect("task lock poisoned");
            let s = &t.steps[index];
            (
                s.step_id.clone(),
                s.action.clone(),
                s.param_str("bed_key").unwrap_or_default().to_string(),
            )
        };
        let reason = self.skip_reasons.get(&step_id).cloned();
        let details = reason
            .as_ref()
            .map(|r| r.details.clone())
            .unwrap_or_else(|| "robot could not move to bedside".to_string());

        info!(
            task_id = %self.current_task_id,
            step_id = %step_id,
            reason = %details,
            "step skipped by conditional logic"
        );

        if action == "bio_scan" {
            self.recorder
                .append(ScanRow::not_available(
                    &self.current_task_id,
                    self.target_bed.clone().unwrap_or_default(),
                    bed_key,
                    &details,
                ))
                .await;
        }

        let result = StepResult::fail(
            reason.as_ref().map_or(0, |r| r.error_code),
            reason.as_ref().map_or_else(
                || "step skipped due to previous step failure".to_string(),
                |r| r.error_message.clone(),
            ),
            json!({
                "conditional_skip": true,
                "reason": details,
                "caused_by_step": reason.as_ref().map(|r| r.failed_step_id.clone()),
                "original_error": reason.map(|r| r.original_error),
            }),
        );

        let mut t = task.lock().expect("task lock poisoned");
        let s = &mut t.steps[index];
        s.status = StepStatus::Skipped;
        s.result = Some(result);
    }

    // ── action dispatch ──────────────────────────────────────────────────

    async fn execute_step(&mut self, action: &str, params: &Map<String, Value>) -> StepResult {
        let command = match StepCommand::parse(action, params) {
            Ok(c) => c,
            Err(e) => {
                error!(
                    task_id = %self.current_task_id,
                    robot_id = %self.robot_id,
                    action = %action,
                    error = %e,
                    "step rejected by command parser"
                );
                return StepResult::fail(-1, e.to_string(), json!({ "action": action }));
            }
        };

        match command {
            StepCommand::Speak { text } => {
                from_command(self.fleet.speak(&self.robot_id, &text).await)
            }
            StepCommand::MoveToPose { x, y, yaw } => {
                from_command(self.fleet.move_to_pose(&self.robot_id, x, y, yaw).await)
            }
            StepCommand::MoveToLocation { location_id } => {
                from_command(self.fleet.move_to_location(&self.robot_id, &location_id).await)
            }
            StepCommand::DockShelf => from_command(self.fleet.dock_shelf(&self.robot_id).await),
            StepCommand::UndockShelf => {
                from_command(self.fleet.undock_shelf(&self.robot_id).await)
            }
            StepCommand::MoveShelf {
                shelf_id,
                location_id,
            } => {
                // Delivery target doubles as the scan target for later
                // bio_scan steps.
                self.target_bed = Some(location_id.clone());

                let result = self
                    .fleet
                    .move_shelf(&self.robot_id, &shelf_id, &location_id)
                    .await;

                if result.ok && self.monitor.is_none() {
                    self.current_shelf_id = Some(shelf_id.clone());
                    self.shelf_dropped.store(false, Ordering::SeqCst);
                    self.monitor = Some(ShelfMonitor::spawn(
                        Arc::clone(&self.fleet),
                        self.robot_id.clone(),
                        shelf_id,
                        self.config.monitor.period,
                        Arc::clone(&self.shelf_dropped),
                    ));
                }
                from_command(result)
            }
            StepCommand::ReturnShelf { shelf_id } => {
                // The robot is about to put the shelf down on purpose; stop
                // watching first and discard any drop signal raised by the
                // handover itself.
                self.stop_monitor().await;
                self.shelf_dropped.store(false, Ordering::SeqCst);

                from_command(self.fleet.return_shelf(&self.robot_id, &shelf_id).await)
            }
            StepCommand::ReturnHome => from_command(self.fleet.return_home(&self.robot_id).await),
            StepCommand::BioScan { bed_key } => {
                let target = self.target_bed.clone().unwrap_or_default();
                match self
                    .sensor
                    .get_valid_scan_data(&target, &self.current_task_id, &bed_key)
                    .await
                {
                    Some(data) => {
                        info!(
                            task_id = %self.current_task_id,
                            bed_key = %bed_key,
                            "bio scan obtained a valid reading"
                        );
                        StepResult::ok(json!({ "bed_key": bed_key, "scan": data }))
                    }
                    None => {
                        warn!(
                            task_id = %self.current_task_id,
                            bed_key = %bed_key,
                            "bio scan got no valid data"
                        );
                        StepResult::fail(
                            -1,
                            "no valid data obtained after all retries",
                            json!({ "bed_key": bed_key }),
                        )
                    }
                }
            }
            StepCommand::Wait { seconds } => {
                tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
                StepResult::ok(json!({ "seconds": seconds }))
            }
        }
    }

    /// Resolves shelf/location ids to display names for readable logs.
    fn format_params(&self, params: &Map<String, Value>) -> String {
        params
            .iter()
            .map(|(k, v)| {
                let raw = v.as_str().map_or_else(|| v.to_string(), str::to_string);
                let display = match k.as_str() {
                    "shelf_id" => self.fleet.shelf_display(&self.robot_id, &raw),
                    "location_id" => self.fleet.location_display(&self.robot_id, &raw),
                    _ => None,
                };
                match display {
                    Some(name) => format!("{k}={raw}({name})"),
                    None => format!("{k}={raw}"),
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    async fn stop_monitor(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.stop().await;
        }
    }

    // ── shelf drop handling ──────────────────────────────────────────────

    async fn query_shelf_pose(&self, shelf_id: &str) -> Option<Pose> {
        match self.fleet.list_shelves(&self.robot_id).await {
            Ok(shelves) => shelves.into_iter().find(|s| s.id == shelf_id).map(|s| s.pose),
            Err(e) => {
                warn!(
                    robot_id = %self.robot_id,
                    shelf_id = %shelf_id,
                    error = %e,
                    "failed to look up dropped shelf pose"
                );
                None
            }
        }
    }

    fn collect_remaining_beds(
        &self,
        task: &SharedTask,
        index: usize,
        trigger: Option<usize>,
    ) -> Vec<RemainingBed> {
        let t = task.lock().expect("task lock poisoned");
        let mut remaining = Vec::new();
        let mut collected: HashSet<String> = HashSet::new();

        if let Some(ti) = trigger {
            let step = &t.steps[ti];
            // The bed whose scan was in flight when the shelf fell.
            if step.action == "bio_scan" {
                remaining.push(RemainingBed {
                    bed_key: step.param_str("bed_key").unwrap_or_default().to_string(),
                    location_id: self.target_bed.clone().unwrap_or_default(),
                });
                collected.insert(step.step_id.clone());
            }
            // Beds reachable only through the failed trigger step.
            for skip_id in &step.skip_on_failure {
                if collected.contains(skip_id) {
                    continue;
                }
                if let Some(s) = t.steps.iter().find(|s| &s.step_id == skip_id) {
                    if s.action == "bio_scan" {
                        remaining.push(RemainingBed {
                            bed_key: s.param_str("bed_key").unwrap_or_default().to_string(),
                            location_id: step
                                .param_str("location_id")
                                .unwrap_or_default()
                                .to_string(),
                        });
                        collected.insert(s.step_id.clone());
                    }
                }
            }
        }

        // Beds the patrol never reached. On the polling path the step at
        // `index` never executed, so it counts too.
        let start = if trigger.is_some() { index + 1 } else { index };
        for future in t.steps.iter().skip(start) {
            if future.action == "bio_scan"
                && matches!(future.status, StepStatus::Pending | StepStatus::Skipped)
                && !collected.contains(&future.step_id)
            {
                let location = t
                    .steps
                    .iter()
                    .find(|ms| {
                        ms.action == "move_shelf" && ms.skip_on_failure.contains(&future.step_id)
                    })
                    .and_then(|ms| ms.param_str("location_id"))
                    .unwrap_or_default()
                    .to_string();
                remaining.push(RemainingBed {
                    bed_key: future.param_str("bed_key").unwrap_or_default().to_string(),
                    location_id: location,
                });
                collected.insert(future.step_id.clone());
            }
        }

        remaining
    }

    async fn handle_shelf_drop(&mut self, task: &SharedTask, index: usize, trigger: Option<usize>) {
        self.stop_monitor().await;

        let cancel = self.fleet.cancel_command(&self.robot_id).await;
        if !cancel.ok {
            debug!(
                robot_id = %self.robot_id,
                error = %cancel.error,
                "cancel_command during drop handling failed"
            );
        }

        let source = if trigger.is_some() {
            "step execution"
        } else {
            "polling monitor"
        };
        error!(
            task_id = %self.current_task_id,
            robot_id = %self.robot_id,
            source,
            "shelf drop detected, interrupting patrol"
        );

        let shelf_id = self
            .current_shelf_id
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        let shelf_pose = self.query_shelf_pose(&shelf_id).await;
        let remaining = self.collect_remaining_beds(task, index, trigger);

        let near = self
            .target_bed
            .clone()
            .unwrap_or_else(|| "unknown location".to_string());
        self.notifier
            .notify(&format!(
                "shelf {shelf_id} dropped near {near}; manual repositioning needed"
            ))
            .await;

        for bed in &remaining {
            self.recorder
                .append(ScanRow::not_available(
                    &self.current_task_id,
                    bed.location_id.clone(),
                    bed.bed_key.clone(),
                    "shelf dropped, patrol interrupted",
                ))
                .await;
        }

        {
            let mut t = task.lock().expect("task lock poisoned");
            for step in &mut t.steps {
                if step.action == "bio_scan" && step.status == StepStatus::Pending {
                    step.status = StepStatus::Skipped;
                }
            }
            let pose_json = shelf_pose.map_or(Value::Null, |p| {
                json!({ "x": p.x, "y": p.y, "theta": p.theta })
            });
            let remaining_json = serde_json::to_value(&remaining).unwrap_or(Value::Null);
            t.metadata.insert("shelf_drop".to_string(), json!(true));
            t.metadata.insert("shelf_id".to_string(), json!(shelf_id));
            t.metadata.insert("shelf_pose".to_string(), pose_json);
            t.metadata
                .insert("remaining_beds".to_string(), remaining_json);
            t.metadata
                .insert("dropped_at".to_string(), json!(Utc::now().to_rfc3339()));
            if let Err(e) = t.transition(TaskStatus::ShelfDropped) {
                warn!(task_id = %t.task_id, error = %e, "shelf-drop transition rejected");
            }
        }

        let home = self.fleet.return_home(&self.robot_id).await;
        if home.ok {
            info!(robot_id = %self.robot_id, "robot sent home after shelf drop");
        } else {
            error!(
                robot_id = %self.robot_id,
                error = %home.error,
                "failed to send robot home after shelf drop"
            );
        }
    }

    // ── finalizer ────────────────────────────────────────────────────────

    async fn finalize(&mut self, task: &SharedTask) {
        {
            let mut t = task.lock().expect("task lock poisoned");
            if t.status == TaskStatus::InProgress {
                if let Err(e) = t.transition(TaskStatus::Done) {
                    debug!(task_id = %t.task_id, error = %e, "done transition rejected");
                }
            }
        }

        let status = self.status(task);
        if matches!(status, TaskStatus::Done | TaskStatus::Failed) {
            let m = self.fleet.metrics(&self.robot_id);
            let metrics = json!({
                "poll_count": m.poll_count,
                "avg_rtt_ms": (m.avg_rtt_ms() * 10.0).round() / 10.0,
                "poll_success_rate": (m.success_rate() * 1000.0).round() / 1000.0,
            });
            task.lock()
                .expect("task lock poisoned")
                .metadata
                .insert("metrics".to_string(), metrics);
            self.fleet.reset_metrics(&self.robot_id);
        }

        // Defense in depth: drop handling and return_shelf already stop the
        // monitor on their paths.
        self.stop_monitor().await;

        if status == TaskStatus::Cancelled {
            if let Some(shelf_id) = self.current_shelf_id.clone() {
                let returned = self.fleet.return_shelf(&self.robot_id, &shelf_id).await;
                if returned.ok {
                    info!(
                        task_id = %self.current_task_id,
                        shelf_id = %shelf_id,
                        "returned shelf after cancellation"
                    );
                } else {
                    error!(
                        task_id = %self.current_task_id,
                        shelf_id = %shelf_id,
                        error = %returned.error,
                        "cancel cleanup: return_shelf failed"
                    );
                }
                let home = self.fleet.return_home(&self.robot_id).await;
                if !home.ok {
                    error!(
                        task_id = %self.current_task_id,
                        error = %home.error,
                        "cancel cleanup: return_home failed"
                    );
                }
            }
        }

        let (task_id, ok, total, status) = {
            let mut t = task.lock().expect("task lock poisoned");
            t.finished_at = Some(Utc::now());
            let (ok, total) = t.bio_scan_counts();
            (t.task_id.clone(), ok, total, t.status)
        };
        let summary = match status {
            TaskStatus::Cancelled => {
                format!("patrol cancelled: completed {ok} of {total} beds (task {task_id})")
            }
            TaskStatus::ShelfDropped => format!(
                "patrol interrupted by shelf drop: completed {ok} of {total} beds (task {task_id})"
            ),
            TaskStatus::Failed => {
                format!("patrol failed: completed {ok} of {total} beds (task {task_id})")
            }
            _ => format!("patrol done: completed {ok} of {total} beds (task {task_id})"),
        };
        self.notifier.notify(&summary).await;

        info!(
            task_id = %task_id,
            robot_id = %self.robot_id,
            status = %status,
            beds_ok = ok,
            beds_total = total,
            "task finished"
        );
    }
}

fn from_command(result: CommandResult) -> StepResult {
    if result.ok {
        StepResult::ok(result.data)
    } else {
        StepResult::fail(result.error_code, result.error, result.data)
    }
}

// ============================================================================
// Tests
// ============================================================================
