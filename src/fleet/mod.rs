//! Fleet Gateway — typed wrapper over the robot RPC.
//!
//! This is the single place where RPC failures surface as data: every
//! command operation returns a [`CommandResult`] and never an `Err`, so the
//! task engine only ever branches on `ok` / `error_code`. Transient
//! transport failures are retried here with exponential backoff (shelf
//! operations get one more attempt than plain moves); domain errors pass
//! through untouched.
//!
//! The gateway also owns the per-robot name resolver (`name-or-id → id`,
//! refreshed from the robot's own registries) and per-robot call metrics
//! that the engine folds into task metadata after a run.

pub mod mock;
pub mod retry;
pub mod rpc;

pub use mock::MockRobotRpc;
pub use retry::RetryPolicy;
pub use rpc::{
    describe_error_code, BatteryInfo, CommandOutcome, CommandState, Location, Pose, RobotRpc,
    Shelf, TransportError,
};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{FleetConfig, RetryConfig};

// ============================================================================
// Command result
// ============================================================================

/// Normalized result of a gateway operation.
///
/// `error_code` tiers: `0` success, `< 0` internal (transport exhaustion,
/// invalid argument), positive values are domain codes from the robot.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub ok: bool,
    pub error_code: i32,
    pub error: String,
    pub data: Value,
}

// ============================================================================
// Per-robot call metrics
// ============================================================================

/// Snapshot of RPC call metrics for one robot since the last reset.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FleetMetrics {
    pub poll_count: u64,
    pub poll_success_count: u64,
    pub poll_failure_count: u64,
    pub rtt_ms: Vec<f64>,
}

impl FleetMetrics {
    /// Mean round-trip time in milliseconds, `0.0` when no samples exist.
    #[must_use]
    pub fn avg_rtt_ms(&self) -> f64 {
        if self.rtt_ms.is_empty() {
            0.0
        } else {
            self.rtt_ms.iter().sum::<f64>() / self.rtt_ms.len() as f64
        }
    }

    /// Fraction of calls that reached the robot, `1.0` when none were made.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.poll_count == 0 {
            1.0
        } else {
            self.poll_success_count as f64 / self.poll_count as f64
        }
    }
}

#[derive(Debug, Default)]
struct NameTable {
    shelf_name_by_id: HashMap<String, String>,
    shelf_id_by_name: HashMap<String, String>,
    location_name_by_id: HashMap<String, String>,
    location_id_by_name: HashMap<String, String>,
}

// ============================================================================
// Fleet Gateway
// ============================================================================

/// Typed per-robot operations over a [`RobotRpc`] connection.
pub struct FleetGateway {
    rpc: Arc<dyn RobotRpc>,
    move_timeout: Duration,
    return_timeout: Duration,
    /// Shelf carry/return operations: one more attempt than plain moves.
    shelf_retry: RetryPolicy,
    /// Plain moves and shelf docking.
    move_retry: RetryPolicy,
    names: DashMap<String, NameTable>,
    metrics: DashMap<String, Mutex<FleetMetrics>>,
}

impl FleetGateway {
    #[must_use]
    pub fn new(rpc: Arc<dyn RobotRpc>, fleet: &FleetConfig, retry: &RetryConfig) -> Self {
        Self {
            rpc,
            move_timeout: fleet.move_timeout,
            return_timeout: fleet.return_timeout,
            shelf_retry: RetryPolicy {
                max_retries: retry.shelf_max_retries,
                base_delay: retry.base_delay,
                max_delay: retry.max_delay,
            },
            move_retry: RetryPolicy {
                max_retries: retry.move_max_retries,
                base_delay: retry.base_delay,
                max_delay: retry.max_delay,
            },
            names: DashMap::new(),
            metrics: DashMap::new(),
        }
    }

    // ── metrics ──────────────────────────────────────────────────────────

    /// Records one RPC round trip for the robot's metrics.
    async fn timed<T>(
        &self,
        robot_id: &str,
        fut: impl Future<Output = Result<T, TransportError>>,
    ) -> Result<T, TransportError> {
        let started = tokio::time::Instant::now();
        let result = fut.await;
        let rtt_ms = started.elapsed().as_secs_f64() * 1000.0;

        let entry = self
            .metrics
            .entry(robot_id.to_string())
            .or_insert_with(|| Mutex::new(FleetMetrics::default()));
        let mut m = entry.lock().expect("fleet metrics lock poisoned");
        m.poll_count += 1;
        if result.is_ok() {
            m.poll_success_count += 1;
        } else {
            m.poll_failure_count += 1;
        }
        m.rtt_ms.push(rtt_ms);
        result
    }

    /// Snapshot of call metrics for one robot.
    #[must_use]
    pub fn metrics(&self, robot_id: &str) -> FleetMetrics {
        self.metrics
            .get(robot_id)
            .map(|m| m.lock().expect("fleet metrics lock poisoned").clone())
            .unwrap_or_default()
    }

    /// Clears call metrics for one robot.
    pub fn reset_metrics(&self, robot_id: &str) {
        if let Some(m) = self.metrics.get(robot_id) {
            *m.lock().expect("fleet metrics lock poisoned") = FleetMetrics::default();
        }
    }

    // ── name resolver ────────────────────────────────────────────────────

    /// Refreshes the shelf/location name tables from the robot.
    pub async fn refresh_names(&self, robot_id: &str) -> Result<(), TransportError> {
        let shelves = self.timed(robot_id, self.rpc.list_shelves(robot_id)).await?;
        let locations = self
            .timed(robot_id, self.rpc.list_locations(robot_id))
            .await?;

        let mut table = NameTable::default();
        for s in &shelves {
            table.shelf_name_by_id.insert(s.id.clone(), s.name.clone());
            table.shelf_id_by_name.insert(s.name.clone(), s.id.clone());
        }
        for l in &locations {
            table
                .location_name_by_id
                .insert(l.id.clone(), l.name.clone());
            table
                .location_id_by_name
                .insert(l.name.clone(), l.id.clone());
        }
        self.names.insert(robot_id.to_string(), table);
        Ok(())
    }

    /// Resolves a shelf key: name match first, then id passthrough.
    #[must_use]
    pub fn resolve_shelf(&self, robot_id: &str, key: &str) -> String {
        self.names
            .get(robot_id)
            .and_then(|t| t.shelf_id_by_name.get(key).cloned())
            .unwrap_or_else(|| key.to_string())
    }

    /// Resolves a location key: name match first, then id passthrough.
    #[must_use]
    pub fn resolve_location(&self, robot_id: &str, key: &str) -> String {
        self.names
            .get(robot_id)
            .and_then(|t| t.location_id_by_name.get(key).cloned())
            .unwrap_or_else(|| key.to_string())
    }

    /// Display name for a shelf id, for readable logs.
    #[must_use]
    pub fn shelf_display(&self, robot_id: &str, id: &str) -> Option<String> {
        self.names
            .get(robot_id)
            .and_then(|t| t.shelf_name_by_id.get(id).cloned())
    }

    /// Display name for a location id, for readable logs.
    #[must_use]
    pub fn location_display(&self, robot_id: &str, id: &str) -> Option<String> {
        self.names
            .get(robot_id)
            .and_then(|t| t.location_name_by_id.get(id).cloned())
    }

    // ── command operations ───────────────────────────────────────────────

    fn normalize(outcome: Result<CommandOutcome, TransportError>, data: Value) -> CommandResult {
        match outcome {
            Ok(o) => {
                let error = if o.ok {
                    String::new()
                } else if o.error.is_empty() {
                    describe_error_code(o.error_code)
                } else {
                    o.error
                };
                CommandResult {
                    ok: o.ok,
                    error_code: o.error_code,
                    error,
                    data,
                }
            }
            Err(e) => CommandResult {
                ok: false,
                error_code: -1,
                error: e.to_string(),
                data,
            },
        }
    }

    pub async fn move_to_location(&self, robot_id: &str, location_key: &str) -> CommandResult {
        let location_id = self.resolve_location(robot_id, location_key);
        let outcome = self
            .move_retry
            .run(|| {
                self.timed(
                    robot_id,
                    self.rpc
                        .move_to_location(robot_id, &location_id, self.move_timeout),
                )
            })
            .await;
        Self::normalize(outcome, json!({ "location_id": location_id }))
    }

    pub async fn move_shelf(
        &self,
        robot_id: &str,
        shelf_key: &str,
        location_key: &str,
    ) -> CommandResult {
        let shelf_id = self.resolve_shelf(robot_id, shelf_key);
        let location_id = self.resolve_location(robot_id, location_key);
        let outcome = self
            .shelf_retry
            .run(|| {
                self.timed(
                    robot_id,
                    self.rpc
                        .move_shelf(robot_id, &shelf_id, &location_id, self.move_timeout),
                )
            })
            .await;
        Self::normalize(
            outcome,
            json!({ "shelf_id": shelf_id, "location_id": location_id }),
        )
    }

    pub async fn return_shelf(&self, robot_id: &str, shelf_key: &str) -> CommandResult {
        let shelf_id = self.resolve_shelf(robot_id, shelf_key);
        let outcome = self
            .shelf_retry
            .run(|| {
                self.timed(
                    robot_id,
                    self.rpc
                        .return_shelf(robot_id, &shelf_id, self.return_timeout),
                )
            })
            .await;
        Self::normalize(outcome, json!({ "shelf_id": shelf_id }))
    }

    pub async fn return_home(&self, robot_id: &str) -> CommandResult {
        let outcome = self
            .timed(robot_id, self.rpc.return_home(robot_id, self.return_timeout))
            .await;
        Self::normalize(outcome, json!({}))
    }

    pub async fn dock_shelf(&self, robot_id: &str) -> CommandResult {
        let outcome = self
            .move_retry
            .run(|| self.timed(robot_id, self.rpc.dock_shelf(robot_id)))
            .await;
        Self::normalize(outcome, json!({}))
    }

    pub async fn undock_shelf(&self, robot_id: &str) -> CommandResult {
        let outcome = self
            .move_retry
            .run(|| self.timed(robot_id, self.rpc.undock_shelf(robot_id)))
            .await;
        Self::normalize(outcome, json!({}))
    }

    pub async fn move_to_pose(&self, robot_id: &str, x: f64, y: f64, yaw: f64) -> CommandResult {
        let outcome = self
            .timed(robot_id, self.rpc.move_to_pose(robot_id, x, y, yaw))
            .await;
        Self::normalize(outcome, json!({ "x": x, "y": y, "yaw": yaw }))
    }

    pub async fn speak(&self, robot_id: &str, text: &str) -> CommandResult {
        let outcome = self.timed(robot_id, self.rpc.speak(robot_id, text)).await;
        Self::normalize(outcome, json!({ "speak_text": text }))
    }

    /// Idempotent cancel of the in-flight command.
    pub async fn cancel_command(&self, robot_id: &str) -> CommandResult {
        let outcome = self.timed(robot_id, self.rpc.cancel_command(robot_id)).await;
        Self::normalize(outcome, json!({}))
    }

    // ── queries ──────────────────────────────────────────────────────────

    /// Id of the shelf currently carried; `None` means not carrying.
    pub async fn moving_shelf(&self, robot_id: &str) -> Result<Option<String>, TransportError> {
        self.timed(robot_id, self.rpc.get_moving_shelf(robot_id)).await
    }

    pub async fn list_shelves(&self, robot_id: &str) -> Result<Vec<Shelf>, TransportError> {
        self.timed(robot_id, self.rpc.list_shelves(robot_id)).await
    }

    pub async fn list_locations(&self, robot_id: &str) -> Result<Vec<Location>, TransportError> {
        self.timed(robot_id, self.rpc.list_locations(robot_id)).await
    }

    pub async fn pose(&self, robot_id: &str) -> Result<Pose, TransportError> {
        self.timed(robot_id, self.rpc.get_pose(robot_id)).await
    }

    pub async fn battery(&self, robot_id: &str) -> Result<BatteryInfo, TransportError> {
        self.timed(robot_id, self.rpc.get_battery(robot_id)).await
    }

    pub async fn command_state(&self, robot_id: &str) -> Result<CommandState, TransportError> {
        self.timed(robot_id, self.rpc.get_command_state(robot_id)).await
    }
}

impl std::fmt::Debug for FleetGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetGateway")
            .field("move_timeout", &self.move_timeout)
            .field("return_timeout", &self.return_timeout)
            .field("robots_with_metrics", &self.metrics.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
