//! Shelf-carriage monitor.
//!
//! Background poller owned by the engine for the duration of one
//! shelf-carrying interval. Every tick it asks the robot which shelf it is
//! carrying; a clean "nothing" answer means the shelf fell off. The monitor
//! then raises the dropped flag exactly once, best-effort cancels the
//! in-flight robot command, and exits. The engine reacts at its next
//! deterministic observation point.
//!
//! Carriage loss is only ever inferred here. Robot error codes that can
//! accompany a drop (10001, 11005, 14606) also occur on ordinary move
//! failures, so they never feed this decision.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fleet::FleetGateway;

/// Handle to a running shelf monitor. Constructed with the shelf id it
/// watches so the monitored shelf and the monitor lifecycle stay one value.
pub struct ShelfMonitor {
    shelf_id: String,
    dropped: Arc<AtomicBool>,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl ShelfMonitor {
    /// Spawns a monitor polling the robot's carriage every `period`.
    ///
    /// `dropped` is shared with the engine: the monitor is its only writer,
    /// the engine observes it at the top of each step iteration and right
    /// after a step returns.
    #[must_use]
    pub fn spawn(
        fleet: Arc<FleetGateway>,
        robot_id: String,
        shelf_id: String,
        period: Duration,
        dropped: Arc<AtomicBool>,
    ) -> Self {
        let stop = CancellationToken::new();
        let flag = Arc::clone(&dropped);
        let token = stop.clone();
        let watched = shelf_id.clone();

        let handle = tokio::spawn(async move {
            info!(robot_id = %robot_id, shelf_id = %watched, "shelf monitor started");
            loop {
                tokio::select! {
                    biased;

                    _ = token.cancelled() => break,

                    _ = tokio::time::sleep(period) => {}
                }

                match fleet.moving_shelf(&robot_id).await {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        warn!(
                            robot_id = %robot_id,
                            shelf_id = %watched,
                            "robot no longer carrying a shelf, flagging drop"
                        );
                        flag.store(true, Ordering::SeqCst);
                        let cancel = fleet.cancel_command(&robot_id).await;
                        if !cancel.ok {
                            debug!(
                                robot_id = %robot_id,
                                error = %cancel.error,
                                "cancel_command after drop failed"
                            );
                        }
                        break;
                    }
                    Err(e) => {
                        // Transient query errors never imply a drop.
                        debug!(robot_id = %robot_id, error = %e, "carriage query failed, will retry");
                    }
                }
            }
            info!(robot_id = %robot_id, shelf_id = %watched, "shelf monitor stopped");
        });

        Self {
            shelf_id,
            dropped,
            stop,
            handle,
        }
    }

    /// The shelf this monitor watches.
    #[must_use]
    pub fn shelf_id(&self) -> &str {
        &self.shelf_id
    }

    /// True once the monitor has observed carriage loss.
    #[must_use]
    pub fn dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Stops the monitor and waits for the poll loop to exit.
    pub async fn stop(self) {
        self.stop.cancel();
        let _ = self.handle.await;
    }
}

impl std::fmt::Debug for ShelfMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShelfMonitor")
            .field("shelf_id", &self.shelf_id)
            .field("dropped", &self.dropped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fleet::{MockRobotRpc, TransportError};

    fn fleet(rpc: Arc<MockRobotRpc>) -> Arc<FleetGateway> {
        let cfg = Config::default();
        Arc::new(FleetGateway::new(rpc, &cfg.fleet, &cfg.retry))
    }

    fn spawn(fleet: Arc<FleetGateway>) -> ShelfMonitor {
        ShelfMonitor::spawn(
            fleet,
            "robot-a".into(),
            "S_04".into(),
            Duration::from_secs(3),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn clean_empty_answer_raises_the_flag_and_cancels() {
        let rpc = Arc::new(MockRobotRpc::new());
        rpc.script_moving_shelf(vec![Ok(Some("S_04".into())), Ok(None)]);
        let monitor = spawn(fleet(rpc.clone()));

        // Two ticks: carrying, then empty
        tokio::time::sleep(Duration::from_secs(7)).await;

        assert!(monitor.dropped());
        assert_eq!(rpc.call_count("cancel_command"), 1);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_never_declare_a_drop() {
        let rpc = Arc::new(MockRobotRpc::new());
        rpc.script_moving_shelf(vec![Err(TransportError::Unavailable)]);
        let monitor = spawn(fleet(rpc.clone()));

        // Many failing ticks
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(!monitor.dropped());
        assert!(rpc.call_count("get_moving_shelf") >= 5);
        assert_eq!(rpc.call_count("cancel_command"), 0);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_polling_without_a_drop() {
        let rpc = Arc::new(MockRobotRpc::new());
        rpc.script_moving_shelf(vec![Ok(Some("S_04".into()))]);
        let monitor = spawn(fleet(rpc.clone()));

        tokio::time::sleep(Duration::from_secs(7)).await;
        let polls = rpc.call_count("get_moving_shelf");
        assert!(polls >= 2);

        let flag = Arc::clone(&monitor.dropped);
        monitor.stop().await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(!flag.load(Ordering::SeqCst));
        assert_eq!(rpc.call_count("get_moving_shelf"), polls);
    }
}
