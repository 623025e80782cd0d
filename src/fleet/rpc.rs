//! Robot RPC seam.
//!
//! The vendor robot library (connection pooling, command-id tracking, raw
//! query endpoints) lives behind the [`RobotRpc`] trait. Everything above
//! this seam only sees two failure shapes: a transport error (the call never
//! produced a robot-side verdict) or a [`CommandOutcome`] whose `error_code`
//! carries the robot's domain code.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Transport errors
// ============================================================================

/// Failure of the RPC channel itself, before the robot could answer.
///
/// The first three variants are transient: the retry policy may re-issue the
/// call. Anything else is returned immediately.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("robot endpoint unavailable")]
    Unavailable,

    #[error("deadline exceeded waiting for the robot")]
    DeadlineExceeded,

    #[error("robot endpoint resource exhausted")]
    ResourceExhausted,

    #[error("rpc internal error: {0}")]
    Internal(String),
}

impl TransportError {
    /// Returns true when a retry with backoff may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable | Self::DeadlineExceeded | Self::ResourceExhausted
        )
    }
}

// ============================================================================
// Command outcome and query payloads
// ============================================================================

/// Robot-side verdict on a submitted command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub ok: bool,
    #[serde(default)]
    pub error_code: i32,
    #[serde(default)]
    pub error: String,
}

impl CommandOutcome {
    /// A clean success.
    #[must_use]
    pub fn success() -> Self {
        Self {
            ok: true,
            error_code: 0,
            error: String::new(),
        }
    }

    /// A domain failure with the robot's error code.
    #[must_use]
    pub fn failure(error_code: i32) -> Self {
        Self {
            ok: false,
            error_code,
            error: describe_error_code(error_code),
        }
    }
}

/// Map pose of the robot or a shelf.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}

/// A registered shelf with its last reported pose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shelf {
    pub id: String,
    pub name: String,
    pub pose: Pose,
}

/// A registered navigation target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: String,
    pub name: String,
}

/// Battery snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryInfo {
    pub percent: f64,
    pub charging: bool,
}

/// Current command execution state on the robot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandState {
    pub running: bool,
    /// Command id of the in-flight command, when one is running.
    #[serde(default)]
    pub command_id: Option<String>,
}

// ============================================================================
// RobotRpc trait
// ============================================================================

/// Low-level, per-robot RPC operations.
///
/// Implementations are expected to tag submitted commands with a command id
/// so that `cancel_command` reliably targets the in-flight command, and to
/// report channel failures as [`TransportError`] rather than folding them
/// into domain codes.
#[async_trait]
pub trait RobotRpc: Send + Sync {
    async fn move_to_location(
        &self,
        robot_id: &str,
        location_id: &str,
        timeout: Duration,
    ) -> Result<CommandOutcome, TransportError>;

    async fn move_shelf(
        &self,
        robot_id: &str,
        shelf_id: &str,
        location_id: &str,
        timeout: Duration,
    ) -> Result<CommandOutcome, TransportError>;

    async fn return_shelf(
        &self,
        robot_id: &str,
        shelf_id: &str,
        timeout: Duration,
    ) -> Result<CommandOutcome, TransportError>;

    async fn return_home(
        &self,
        robot_id: &str,
        timeout: Duration,
    ) -> Result<CommandOutcome, TransportError>;

    async fn dock_shelf(&self, robot_id: &str) -> Result<CommandOutcome, TransportError>;

    async fn undock_shelf(&self, robot_id: &str) -> Result<CommandOutcome, TransportError>;

    async fn move_to_pose(
        &self,
        robot_id: &str,
        x: f64,
        y: f64,
        yaw: f64,
    ) -> Result<CommandOutcome, TransportError>;

    async fn speak(&self, robot_id: &str, text: &str) -> Result<CommandOutcome, TransportError>;

    /// Cancels the in-flight command. Idempotent; a no-op succeeds.
    async fn cancel_command(&self, robot_id: &str) -> Result<CommandOutcome, TransportError>;

    /// Id of the shelf the robot currently carries; `None` means the robot
    /// is not carrying anything.
    async fn get_moving_shelf(&self, robot_id: &str) -> Result<Option<String>, TransportError>;

    async fn list_shelves(&self, robot_id: &str) -> Result<Vec<Shelf>, TransportError>;

    async fn list_locations(&self, robot_id: &str) -> Result<Vec<Location>, TransportError>;

    async fn get_pose(&self, robot_id: &str) -> Result<Pose, TransportError>;

    async fn get_battery(&self, robot_id: &str) -> Result<BatteryInfo, TransportError>;

    async fn get_command_state(&self, robot_id: &str) -> Result<CommandState, TransportError>;
}

// ============================================================================
// Domain error codes
// ============================================================================

/// Human-readable description for a robot domain error code.
///
/// Codes 10001/11005/14606 accompany interrupted moves and are deliberately
/// NOT treated as shelf-drop evidence; carriage loss is only ever inferred
/// by the shelf monitor.
#[must_use]
pub fn describe_error_code(code: i32) -> String {
    match code {
        0 => "success".to_string(),
        -1 => "internal error or exception".to_string(),
        10001 => "command interrupted".to_string(),
        11005 => "move interrupted".to_string(),
        14605 => "cannot place shelf on charging dock".to_string(),
        14606 => "not docked with shelf".to_string(),
        21051 => "robot paused".to_string(),
        21052 => "step detected".to_string(),
        other => format!("unknown error code: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(TransportError::Unavailable.is_transient());
        assert!(TransportError::DeadlineExceeded.is_transient());
        assert!(TransportError::ResourceExhausted.is_transient());
        assert!(!TransportError::Internal("boom".into()).is_transient());
    }

    #[test]
    fn error_code_descriptions() {
        assert_eq!(describe_error_code(0), "success");
        assert_eq!(describe_error_code(14606), "not docked with shelf");
        assert_eq!(describe_error_code(10001), "command interrupted");
        assert!(describe_error_code(99999).contains("99999"));
    }
}
