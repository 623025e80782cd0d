//! Task and step model: lifecycle state machines, wire shape, and the
//! centralized step-command parser.
//!
//! A `Task` is an ordered, robot-targeted plan of `Step`s. Statuses move
//! through explicit state machines; terminal states are immutable. The wire
//! shape keeps `action` + `params` as raw JSON so that any task round-trips
//! structurally; typed per-action commands are produced by
//! [`StepCommand::parse`] at execution time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

// ============================================================================
// Status state machines
// ============================================================================

/// Task lifecycle status.
///
/// State machine transitions:
/// - Queued → InProgress (worker picked the task up)
/// - Queued → Cancelled (cancelled before execution)
/// - Queued → Failed (dispatcher rejected it, e.g. unknown robot)
/// - InProgress → Done / Failed / Cancelled / ShelfDropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted and waiting in a queue
    Queued,
    /// A robot worker is executing the steps
    InProgress,
    /// Every step ran to a success or skip outcome
    Done,
    /// A critical step failed (or dispatch was impossible)
    Failed,
    /// Cancelled by an external caller
    Cancelled,
    /// The robot lost its shelf carriage mid-patrol
    ShelfDropped,
}

impl TaskStatus {
    /// Returns true if this is a terminal state. Terminal states are
    /// immutable and indicate the task lifecycle has ended.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::Failed | Self::Cancelled | Self::ShelfDropped
        )
    }

    /// Checks if a transition from this status to another is valid.
    #[must_use]
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        matches!(
            (self, to),
            (TaskStatus::Queued, TaskStatus::InProgress)
                | (TaskStatus::Queued, TaskStatus::Cancelled)
                | (TaskStatus::Queued, TaskStatus::Failed)
                | (TaskStatus::InProgress, TaskStatus::Done)
                | (TaskStatus::InProgress, TaskStatus::Failed)
                | (TaskStatus::InProgress, TaskStatus::Cancelled)
                | (TaskStatus::InProgress, TaskStatus::ShelfDropped)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::ShelfDropped => write!(f, "shelf_dropped"),
        }
    }
}

/// Step execution status.
///
/// Statuses are monotone: Pending → Executing → {Success, Fail}, with
/// Pending → Skipped allowed directly for conditional skips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Executing,
    Success,
    Fail,
    Skipped,
}

impl StepStatus {
    /// Returns true once the step can no longer change state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Fail | Self::Skipped)
    }

    /// Checks the monotone step DAG.
    #[must_use]
    pub fn can_transition_to(&self, to: StepStatus) -> bool {
        matches!(
            (self, to),
            (StepStatus::Pending, StepStatus::Executing)
                | (StepStatus::Pending, StepStatus::Skipped)
                | (StepStatus::Executing, StepStatus::Success)
                | (StepStatus::Executing, StepStatus::Fail)
                | (StepStatus::Executing, StepStatus::Skipped)
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Executing => write!(f, "executing"),
            Self::Success => write!(f, "success"),
            Self::Fail => write!(f, "fail"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

// ============================================================================
// Step result
// ============================================================================

/// Outcome of one executed step.
///
/// `error_code` follows the robot's domain codes: `0` success, `-1` internal
/// failure (parse error, unknown action, transport exhaustion), positive
/// values straight from the robot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    #[serde(default)]
    pub error_code: i32,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl StepResult {
    /// A successful result carrying action-specific output.
    #[must_use]
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            error_code: 0,
            error_message: String::new(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// A failed result with a domain or internal error code.
    #[must_use]
    pub fn fail(error_code: i32, error_message: impl Into<String>, data: Value) -> Self {
        Self {
            success: false,
            error_code,
            error_message: error_message.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// Step and Task
// ============================================================================

/// A single parameterized robot or sensor action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step_id: String,
    /// Action name on the wire; parsed into a [`StepCommand`] at execution.
    pub action: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default = "default_step_status")]
    pub status: StepStatus,
    /// Step ids to mark skipped when this step fails.
    #[serde(default)]
    pub skip_on_failure: Vec<String>,
    #[serde(default)]
    pub result: Option<StepResult>,
}

fn default_step_status() -> StepStatus {
    StepStatus::Pending
}

impl Step {
    /// Returns true when a failure of this step is tolerable on its own and
    /// must not abort the task.
    #[must_use]
    pub fn is_non_critical(&self) -> bool {
        matches!(
            self.action.as_str(),
            "bio_scan" | "wait" | "speak" | "return_shelf"
        )
    }

    /// String parameter lookup, used by skip/drop bookkeeping.
    #[must_use]
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// An ordered, robot-targeted plan composed of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub task_id: String,
    /// Pin to a specific robot; `None` dispatches to the first available one.
    #[serde(default)]
    pub robot_id: Option<String>,
    #[serde(default = "default_task_status")]
    pub status: TaskStatus,
    pub steps: Vec<Step>,
    /// Engine-written context: run metrics, shelf-drop record, summary.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

fn default_task_status() -> TaskStatus {
    TaskStatus::Queued
}

impl Task {
    /// Creates a queued task for the given steps.
    #[must_use]
    pub fn new(task_id: impl Into<String>, robot_id: Option<String>, steps: Vec<Step>) -> Self {
        Self {
            task_id: task_id.into(),
            robot_id,
            status: TaskStatus::Queued,
            steps,
            metadata: Map::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Transitions the task to a new status.
    ///
    /// Returns an error if the transition is invalid or the task is already
    /// in a terminal state.
    pub fn transition(&mut self, to: TaskStatus) -> Result<(), TaskError> {
        if self.status.is_terminal() {
            return Err(TaskError::AlreadyTerminal {
                task_id: self.task_id.clone(),
                status: self.status,
            });
        }
        if !self.status.can_transition_to(to) {
            return Err(TaskError::InvalidTransition {
                task_id: self.task_id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Counts bio-scan steps: `(succeeded, total)`. Feeds the end-of-patrol
    /// summary notification.
    #[must_use]
    pub fn bio_scan_counts(&self) -> (usize, usize) {
        let bio = self.steps.iter().filter(|s| s.action == "bio_scan");
        let total = bio.clone().count();
        let ok = bio.filter(|s| s.status == StepStatus::Success).count();
        (ok, total)
    }
}

/// Errors from task state operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The task is already in a terminal state.
    #[error("task '{task_id}' is already in terminal state '{status}'")]
    AlreadyTerminal { task_id: String, status: TaskStatus },

    /// The requested transition is not in the state machine.
    #[error("invalid transition for task '{task_id}': {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
}

// ============================================================================
// Submission validation
// ============================================================================

/// Validates `skip_on_failure` references and returns human-readable
/// warnings. Unknown targets are tolerated at runtime (they never match a
/// step), so submission only warns instead of rejecting.
#[must_use]
pub fn validate_skip_targets(task: &Task) -> Vec<String> {
    let step_ids: std::collections::HashSet<&str> =
        task.steps.iter().map(|s| s.step_id.as_str()).collect();

    let mut warnings = Vec::new();
    for step in &task.steps {
        for target in &step.skip_on_failure {
            if target == &step.step_id {
                warnings.push(format!("step '{}' cannot skip itself", step.step_id));
            } else if !step_ids.contains(target.as_str()) {
                warnings.push(format!(
                    "step '{}' references unknown skip target '{}'",
                    step.step_id, target
                ));
            }
        }
    }
    warnings
}

// ============================================================================
// Typed step commands
// ============================================================================

/// Per-action request, parsed centrally from the wire `action` + `params`.
#[derive(Debug, Clone, PartialEq)]
pub enum StepCommand {
    Speak { text: String },
    MoveToPose { x: f64, y: f64, yaw: f64 },
    MoveToLocation { location_id: String },
    DockShelf,
    UndockShelf,
    MoveShelf { shelf_id: String, location_id: String },
    ReturnShelf { shelf_id: String },
    ReturnHome,
    BioScan { bed_key: String },
    Wait { seconds: f64 },
}

/// Errors from step-command parsing. These become a failing `StepResult`
/// with code `-1`, never a task-level rejection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandParseError {
    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("action '{action}' is missing parameter '{name}'")]
    MissingParam { action: String, name: String },

    #[error("action '{action}' parameter '{name}' is not a number")]
    InvalidNumber { action: String, name: String },
}

impl StepCommand {
    /// Parses a wire step into its typed command.
    pub fn parse(action: &str, params: &Map<String, Value>) -> Result<Self, CommandParseError> {
        let text = |name: &str| -> Result<String, CommandParseError> {
            match params.get(name) {
                Some(Value::String(s)) => Ok(s.clone()),
                Some(other) if !other.is_null() => Ok(other.to_string()),
                _ => Err(CommandParseError::MissingParam {
                    action: action.to_string(),
                    name: name.to_string(),
                }),
            }
        };
        // The original accepted numbers serialized as strings; keep that.
        let number = |name: &str| -> Result<f64, CommandParseError> {
            match params.get(name) {
                Some(Value::Number(n)) => {
                    n.as_f64().ok_or_else(|| CommandParseError::InvalidNumber {
                        action: action.to_string(),
                        name: name.to_string(),
                    })
                }
                Some(Value::String(s)) => {
                    s.parse().map_err(|_| CommandParseError::InvalidNumber {
                        action: action.to_string(),
                        name: name.to_string(),
                    })
                }
                Some(_) => Err(CommandParseError::InvalidNumber {
                    action: action.to_string(),
                    name: name.to_string(),
                }),
                None => Err(CommandParseError::MissingParam {
                    action: action.to_string(),
                    name: name.to_string(),
                }),
            }
        };

        match action {
            "speak" => Ok(Self::Speak {
                text: text("speak_text")?,
            }),
            "move_to_pose" => Ok(Self::MoveToPose {
                x: number("x")?,
                y: number("y")?,
                yaw: number("yaw")?,
            }),
            "move_to_location" => Ok(Self::MoveToLocation {
                location_id: text("location_id")?,
            }),
            "dock_shelf" => Ok(Self::DockShelf),
            "undock_shelf" => Ok(Self::UndockShelf),
            "move_shelf" => Ok(Self::MoveShelf {
                shelf_id: text("shelf_id")?,
                location_id: text("location_id")?,
            }),
            "return_shelf" => Ok(Self::ReturnShelf {
                shelf_id: text("shelf_id")?,
            }),
            "return_home" => Ok(Self::ReturnHome),
            "bio_scan" => Ok(Self::BioScan {
                bed_key: text("bed_key")?,
            }),
            "wait" => Ok(Self::Wait {
                seconds: match params.get("seconds") {
                    None => 1.0,
                    Some(_) => number("seconds")?,
                },
            }),
            other => Err(CommandParseError::UnknownAction(other.to_string())),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(id: &str, action: &str, params: Value) -> Step {
        Step {
            step_id: id.to_string(),
            action: action.to_string(),
            params: params.as_object().cloned().unwrap_or_default(),
            status: StepStatus::Pending,
            skip_on_failure: Vec::new(),
            result: None,
        }
    }

    #[test]
    fn task_status_terminality() {
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(TaskStatus::ShelfDropped.is_terminal());
    }

    #[test]
    fn task_status_valid_transitions() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Done));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::ShelfDropped));
    }

    #[test]
    fn task_status_invalid_transitions() {
        // Can't go backwards or skip states
        assert!(!TaskStatus::InProgress.can_transition_to(TaskStatus::Queued));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Done));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::ShelfDropped));

        // Terminal states never transition
        assert!(!TaskStatus::Done.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::InProgress));
    }

    #[test]
    fn terminal_task_is_immutable() {
        let mut task = Task::new("t1", None, vec![]);
        task.transition(TaskStatus::Cancelled).unwrap();
        let err = task.transition(TaskStatus::InProgress).unwrap_err();
        assert!(matches!(err, TaskError::AlreadyTerminal { .. }));
    }

    #[test]
    fn step_status_monotone_dag() {
        assert!(StepStatus::Pending.can_transition_to(StepStatus::Executing));
        assert!(StepStatus::Pending.can_transition_to(StepStatus::Skipped));
        assert!(StepStatus::Executing.can_transition_to(StepStatus::Success));
        assert!(StepStatus::Executing.can_transition_to(StepStatus::Fail));

        assert!(!StepStatus::Pending.can_transition_to(StepStatus::Success));
        assert!(!StepStatus::Success.can_transition_to(StepStatus::Fail));
        assert!(!StepStatus::Skipped.can_transition_to(StepStatus::Executing));
    }

    #[test]
    fn wire_shape_round_trip() {
        let raw = json!({
            "task_id": "patrol-1",
            "robot_id": "robot-a",
            "status": "queued",
            "steps": [
                { "step_id": "s1", "action": "move_shelf",
                  "params": {"shelf_id": "S_04", "location_id": "B_101-1"},
                  "skip_on_failure": ["s2"] },
                { "step_id": "s2", "action": "bio_scan",
                  "params": {"bed_key": "101-1"} },
                { "step_id": "s3", "action": "return_shelf",
                  "params": {"shelf_id": "S_04"} }
            ]
        });

        let task: Task = serde_json::from_value(raw).unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.steps.len(), 3);
        assert_eq!(task.steps[0].skip_on_failure, vec!["s2"]);
        assert_eq!(task.steps[1].status, StepStatus::Pending);

        let reparsed: Task =
            serde_json::from_value(serde_json::to_value(&task).unwrap()).unwrap();
        assert_eq!(reparsed.task_id, task.task_id);
        assert_eq!(reparsed.steps.len(), task.steps.len());
        for (a, b) in reparsed.steps.iter().zip(task.steps.iter()) {
            assert_eq!(a.step_id, b.step_id);
            assert_eq!(a.action, b.action);
            assert_eq!(a.params, b.params);
            assert_eq!(a.skip_on_failure, b.skip_on_failure);
        }
    }

    #[test]
    fn parse_typed_commands() {
        let cmd = StepCommand::parse(
            "move_shelf",
            json!({"shelf_id": "S_04", "location_id": "B_101-1"})
                .as_object()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(
            cmd,
            StepCommand::MoveShelf {
                shelf_id: "S_04".into(),
                location_id: "B_101-1".into()
            }
        );

        // Numeric params accept both JSON numbers and numeric strings
        let cmd = StepCommand::parse(
            "move_to_pose",
            json!({"x": 1.5, "y": "2.0", "yaw": 0}).as_object().unwrap(),
        )
        .unwrap();
        assert_eq!(
            cmd,
            StepCommand::MoveToPose {
                x: 1.5,
                y: 2.0,
                yaw: 0.0
            }
        );
    }

    #[test]
    fn parse_wait_defaults_to_one_second() {
        let cmd = StepCommand::parse("wait", &Map::new()).unwrap();
        assert_eq!(cmd, StepCommand::Wait { seconds: 1.0 });
    }

    #[test]
    fn parse_rejects_unknown_action_and_missing_params() {
        assert!(matches!(
            StepCommand::parse("teleport", &Map::new()),
            Err(CommandParseError::UnknownAction(_))
        ));
        assert!(matches!(
            StepCommand::parse("bio_scan", &Map::new()),
            Err(CommandParseError::MissingParam { .. })
        ));
        assert!(matches!(
            StepCommand::parse(
                "move_to_pose",
                json!({"x": "abc", "y": 0, "yaw": 0}).as_object().unwrap()
            ),
            Err(CommandParseError::InvalidNumber { .. })
        ));
    }

    #[test]
    fn validate_warns_on_unknown_and_self_targets() {
        let mut s1 = step("s1", "move_shelf", json!({}));
        s1.skip_on_failure = vec!["s1".into(), "ghost".into(), "s2".into()];
        let s2 = step("s2", "bio_scan", json!({"bed_key": "101-1"}));
        let task = Task::new("t", None, vec![s1, s2]);

        let warnings = validate_skip_targets(&task);
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("cannot skip itself"));
        assert!(warnings[1].contains("unknown skip target 'ghost'"));
    }

    #[test]
    fn non_critical_actions() {
        for action in ["bio_scan", "wait", "speak", "return_shelf"] {
            assert!(step("s", action, json!({})).is_non_critical());
        }
        for action in ["move_shelf", "move_to_location", "dock_shelf", "teleport"] {
            assert!(!step("s", action, json!({})).is_non_critical());
        }
    }

    #[test]
    fn bio_scan_counts() {
        let mut s1 = step("s1", "bio_scan", json!({"bed_key": "101-1"}));
        s1.status = StepStatus::Success;
        let s2 = step("s2", "bio_scan", json!({"bed_key": "102-1"}));
        let s3 = step("s3", "return_shelf", json!({"shelf_id": "S_04"}));
        let task = Task::new("t", None, vec![s1, s2, s3]);
        assert_eq!(task.bio_scan_counts(), (1, 2));
    }
}
