//! flowgrid readiness checks.
//!
//! A task that the cluster reports as running is not necessarily serving.
//! This crate decides when a started task is *ready*, which is what gates
//! its dependents. Readiness failures are never cluster failures: a probe
//! that errors only makes the next poll wait longer.
//!
//! # Components
//!
//! - **`checker`** — `ReadinessCheck` trait, built-in TCP/HTTP probes, `ReadinessTracker`
//! - **`monitor`** — `ReadinessMonitor` running one polling task per started task

pub mod checker;
pub mod monitor;

pub use checker::{ProbeCheck, ReadinessCheck, ReadinessOutcome, ReadinessTracker, TaskHandle, http_probe, tcp_probe};
pub use monitor::{MonitorSettings, ReadinessCallback, ReadinessMonitor};
