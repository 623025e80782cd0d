//! Shared test fixtures: a scriptable bio-sensor and engine wiring.

// Not every test binary uses every fixture.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use biopatrol::config::Config;
use biopatrol::fleet::{FleetGateway, MockRobotRpc, RobotRpc};
use biopatrol::notify::{Notifier, RecordingNotifier};
use biopatrol::runtime::{SharedTask, Task, TaskEngine};
use biopatrol::sensor::{BioSensorClient, MemoryScanRecorder, ScanRecorder};

pub const ROBOT: &str = "robot-a";

/// Sensor double: waits `delay`, then pops a scripted answer (the default
/// answer repeats once the script is exhausted).
pub struct MockBioSensor {
    delay: Duration,
    script: Mutex<VecDeque<Option<Value>>>,
    default: Option<Value>,
}

impl MockBioSensor {
    /// Always produces a valid reading immediately.
    pub fn valid() -> Self {
        Self {
            delay: Duration::ZERO,
            script: Mutex::new(VecDeque::new()),
            default: Some(json!({ "bpm": 72, "rpm": 16, "status": 4 })),
        }
    }

    /// Never produces a valid reading.
    pub fn failing() -> Self {
        Self {
            delay: Duration::ZERO,
            script: Mutex::new(VecDeque::new()),
            default: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl BioSensorClient for MockBioSensor {
    async fn get_valid_scan_data(
        &self,
        _target_bed: &str,
        _task_id: &str,
        _bed_name: &str,
    ) -> Option<Value> {
        tokio::time::sleep(self.delay).await;
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.default.clone())
    }
}

/// Everything a scenario needs to run one engine directly.
pub struct EngineHarness {
    pub rpc: Arc<MockRobotRpc>,
    pub fleet: Arc<FleetGateway>,
    pub recorder: Arc<MemoryScanRecorder>,
    pub notifier: Arc<RecordingNotifier>,
    pub engine: TaskEngine,
}

impl EngineHarness {
    pub fn new(sensor: MockBioSensor) -> Self {
        let config = Config::default();
        let rpc = Arc::new(MockRobotRpc::new());
        let fleet = Arc::new(FleetGateway::new(
            Arc::clone(&rpc) as Arc<dyn RobotRpc>,
            &config.fleet,
            &config.retry,
        ));
        let recorder = Arc::new(MemoryScanRecorder::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = TaskEngine::new(
            Arc::clone(&fleet),
            ROBOT,
            Arc::new(sensor),
            Arc::clone(&recorder) as Arc<dyn ScanRecorder>,
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            config,
        );
        Self {
            rpc,
            fleet,
            recorder,
            notifier,
            engine,
        }
    }
}

/// Parses a wire-shaped task and wraps it for the engine.
pub fn shared_task(raw: Value) -> SharedTask {
    let task: Task = serde_json::from_value(raw).expect("task fixture must parse");
    Arc::new(Mutex::new(task))
}

/// The canonical one-bed patrol used by several scenarios.
pub fn patrol_task() -> Value {
    json!({
        "task_id": "patrol-1",
        "robot_id": ROBOT,
        "steps": [
            { "step_id": "s1", "action": "move_shelf",
              "params": { "shelf_id": "S_04", "location_id": "B_101-1" } },
            { "step_id": "s2", "action": "bio_scan",
              "params": { "bed_key": "101-1" } },
            { "step_id": "s3", "action": "return_shelf",
              "params": { "shelf_id": "S_04" } },
            { "step_id": "s4", "action": "return_home", "params": {} }
        ]
    })
}
