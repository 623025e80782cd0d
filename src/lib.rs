//! biopatrol — task runtime for a hospital vital-signs patrol robot.
//!
//! A mobile robot carries a physiological sensor shelf between beds,
//! collects vital signs at each one, and reports anomalies. This crate is
//! the concurrent engine behind that: it accepts patrol tasks, dispatches
//! them to per-robot workers, executes each step over a command-oriented
//! robot RPC with retry and backoff, watches the one physical invariant
//! that matters (the robot still carries its shelf) in the background, and
//! degrades through a precisely ordered failure policy.
//!
//! # Architecture
//!
//! ```text
//! submit ──▶ global queue ──▶ dispatcher ──▶ per-robot queue ──▶ worker
//!                                                                  │
//!                              shelf monitor ◀── spawns ── task engine
//!                                    │                         │
//!                                    └── dropped flag ──▶ step loop ──▶ FleetGateway ──▶ RobotRpc
//! ```
//!
//! - [`runtime::PatrolRuntime`] — entry point: register robots, submit,
//!   cancel, query.
//! - [`runtime::TaskEngine`] — per-task step state machine with the
//!   three-path failure classifier and shelf-drop handling.
//! - [`fleet::FleetGateway`] — the single place RPC errors become data;
//!   retry with backoff lives beneath it.
//! - [`sensor`] / [`notify`] — seams for the bio-sensor client, the scan
//!   history, and operator notifications.
//!
//! The runtime is single-process and in-memory; it is authoritative only
//! while alive.

pub mod config;
pub mod fleet;
pub mod notify;
pub mod runtime;
pub mod sensor;

pub use config::Config;
pub use fleet::{FleetGateway, RobotRpc};
pub use runtime::{PatrolRuntime, Task, TaskEngine, TaskStatus};
