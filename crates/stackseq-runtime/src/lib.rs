//! # stackseq-runtime
//!
//! Health-gated startup sequencing for a resolved stack.
//!
//! Handles:
//! - **Sequencer**: one supervisor task per service, started in
//!   dependency order and gated on `started` / `healthy` conditions.
//! - **Health**: interval probes with start period, timeout, and retries.
//! - **Restart policies**: `no`, `always`, `on-failure[:N]`,
//!   `unless-stopped`.
//! - **Shutdown**: reverse dependency order with bounded grace periods.
//! - **Backends**: host processes or an in-memory simulation.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod backend;
pub mod event;
pub mod health;
pub mod sequencer;
pub mod state;
mod supervisor;

pub use backend::{BackendKind, ServiceBackend, ServiceInstance};
pub use event::{EventKind, EventLog, ServiceEvent};
pub use sequencer::{RunningStack, Sequencer, SequencerConfig, ShutdownReport};
pub use supervisor::SupervisorReport;
