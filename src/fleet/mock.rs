//! Scriptable in-memory robot for tests.
//!
//! Every operation succeeds by default and the mock tracks shelf carriage
//! like a real robot would (a successful `move_shelf` picks the shelf up, a
//! successful `return_shelf` puts it down). Tests script failures per
//! operation, override the carriage query for drop scenarios, and observe
//! the exact call sequence.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use super::rpc::{
    BatteryInfo, CommandOutcome, CommandState, Location, Pose, RobotRpc, Shelf, TransportError,
};

type Hook = Box<dyn Fn() + Send + Sync>;

struct MockState {
    /// Scripted outcomes per operation; empty queue means success.
    outcomes: HashMap<String, VecDeque<Result<CommandOutcome, TransportError>>>,
    /// Scripted carriage answers; the last entry stays sticky.
    moving_shelf_script: VecDeque<Result<Option<String>, TransportError>>,
    /// Simulated carriage when no script is installed.
    carried: Option<String>,
    shelves: Vec<Shelf>,
    locations: Vec<Location>,
    pose: Pose,
    battery: BatteryInfo,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            outcomes: HashMap::new(),
            moving_shelf_script: VecDeque::new(),
            carried: None,
            shelves: Vec::new(),
            locations: Vec::new(),
            pose: Pose::default(),
            battery: BatteryInfo {
                percent: 100.0,
                charging: false,
            },
        }
    }
}

/// Scriptable [`RobotRpc`] implementation.
pub struct MockRobotRpc {
    state: Mutex<MockState>,
    calls: Mutex<Vec<String>>,
    hooks: Mutex<HashMap<String, Hook>>,
}

impl Default for MockRobotRpc {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRobotRpc {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            calls: Mutex::new(Vec::new()),
            hooks: Mutex::new(HashMap::new()),
        }
    }

    /// Queues an outcome for the named operation; consumed in FIFO order.
    /// Operations with an empty queue succeed.
    pub fn push_outcome(&self, op: &str, outcome: Result<CommandOutcome, TransportError>) {
        self.state
            .lock()
            .unwrap()
            .outcomes
            .entry(op.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Installs carriage-query answers. The final entry repeats forever.
    pub fn script_moving_shelf(&self, script: Vec<Result<Option<String>, TransportError>>) {
        self.state.lock().unwrap().moving_shelf_script = script.into();
    }

    pub fn set_shelves(&self, shelves: Vec<Shelf>) {
        self.state.lock().unwrap().shelves = shelves;
    }

    pub fn set_locations(&self, locations: Vec<Location>) {
        self.state.lock().unwrap().locations = locations;
    }

    /// Runs `hook` every time the named operation is invoked.
    pub fn on_call(&self, op: &str, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks
            .lock()
            .unwrap()
            .insert(op.to_string(), Box::new(hook));
    }

    /// Full call log, one `"op detail"` entry per invocation.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of invocations of the named operation.
    #[must_use]
    pub fn call_count(&self, op: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.split_whitespace().next() == Some(op))
            .count()
    }

    fn record(&self, op: &str, detail: &str) {
        if detail.is_empty() {
            self.calls.lock().unwrap().push(op.to_string());
        } else {
            self.calls.lock().unwrap().push(format!("{op} {detail}"));
        }
        if let Some(hook) = self.hooks.lock().unwrap().get(op) {
            hook();
        }
    }

    fn next_outcome(&self, op: &str) -> Result<CommandOutcome, TransportError> {
        self.state
            .lock()
            .unwrap()
            .outcomes
            .get_mut(op)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(CommandOutcome::success()))
    }

    fn command(&self, op: &str, detail: &str) -> Result<CommandOutcome, TransportError> {
        self.record(op, detail);
        self.next_outcome(op)
    }
}

#[async_trait]
impl RobotRpc for MockRobotRpc {
    async fn move_to_location(
        &self,
        _robot_id: &str,
        location_id: &str,
        _timeout: Duration,
    ) -> Result<CommandOutcome, TransportError> {
        self.command("move_to_location", location_id)
    }

    async fn move_shelf(
        &self,
        _robot_id: &str,
        shelf_id: &str,
        location_id: &str,
        _timeout: Duration,
    ) -> Result<CommandOutcome, TransportError> {
        let result = self.command("move_shelf", &format!("{shelf_id} {location_id}"));
        if matches!(result, Ok(ref o) if o.ok) {
            self.state.lock().unwrap().carried = Some(shelf_id.to_string());
        }
        result
    }

    async fn return_shelf(
        &self,
        _robot_id: &str,
        shelf_id: &str,
        _timeout: Duration,
    ) -> Result<CommandOutcome, TransportError> {
        let result = self.command("return_shelf", shelf_id);
        if matches!(result, Ok(ref o) if o.ok) {
            self.state.lock().unwrap().carried = None;
        }
        result
    }

    async fn return_home(
        &self,
        _robot_id: &str,
        _timeout: Duration,
    ) -> Result<CommandOutcome, TransportError> {
        self.command("return_home", "")
    }

    async fn dock_shelf(&self, _robot_id: &str) -> Result<CommandOutcome, TransportError> {
        self.command("dock_shelf", "")
    }

    async fn undock_shelf(&self, _robot_id: &str) -> Result<CommandOutcome, TransportError> {
        self.command("undock_shelf", "")
    }

    async fn move_to_pose(
        &self,
        _robot_id: &str,
        x: f64,
        y: f64,
        yaw: f64,
    ) -> Result<CommandOutcome, TransportError> {
        self.command("move_to_pose", &format!("{x} {y} {yaw}"))
    }

    async fn speak(&self, _robot_id: &str, text: &str) -> Result<CommandOutcome, TransportError> {
        self.command("speak", text)
    }

    async fn cancel_command(&self, _robot_id: &str) -> Result<CommandOutcome, TransportError> {
        self.command("cancel_command", "")
    }

    async fn get_moving_shelf(&self, _robot_id: &str) -> Result<Option<String>, TransportError> {
        self.record("get_moving_shelf", "");
        let mut state = self.state.lock().unwrap();
        if state.moving_shelf_script.len() > 1 {
            state.moving_shelf_script.pop_front().unwrap()
        } else if let Some(last) = state.moving_shelf_script.front() {
            last.clone()
        } else {
            Ok(state.carried.clone())
        }
    }

    async fn list_shelves(&self, _robot_id: &str) -> Result<Vec<Shelf>, TransportError> {
        self.record("list_shelves", "");
        Ok(self.state.lock().unwrap().shelves.clone())
    }

    async fn list_locations(&self, _robot_id: &str) -> Result<Vec<Location>, TransportError> {
        self.record("list_locations", "");
        Ok(self.state.lock().unwrap().locations.clone())
    }

    async fn get_pose(&self, _robot_id: &str) -> Result<Pose, TransportError> {
        self.record("get_pose", "");
        Ok(self.state.lock().unwrap().pose)
    }

    async fn get_battery(&self, _robot_id: &str) -> Result<BatteryInfo, TransportError> {
        self.record("get_battery", "");
        Ok(self.state.lock().unwrap().battery)
    }

    async fn get_command_state(&self, _robot_id: &str) -> Result<CommandState, TransportError> {
        self.record("get_command_state", "");
        Ok(CommandState {
            running: false,
            command_id: None,
        })
    }
}
