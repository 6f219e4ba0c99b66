//! Service backend abstraction.
//!
//! A backend launches instances of a service; an instance can be probed,
//! awaited, and stopped. The sequencer is agnostic to how instances are
//! realised.

pub mod process;
pub mod simulated;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stackseq_common::error::{Result, StackError};
use stackseq_common::types::InstanceId;
use stackseq_compose::model::{HealthTest, ServiceDescriptor};

pub use self::process::ProcessBackend;
pub use self::simulated::{SimScript, SimulatedBackend};

/// Result of a single health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The probe succeeded.
    Passed,
    /// The probe failed, with a reason.
    Failed(String),
}

impl ProbeOutcome {
    /// Returns `true` for [`ProbeOutcome::Passed`].
    #[must_use]
    pub const fn passed(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

/// How an instance ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code, if the instance exited normally.
    pub code: Option<i32>,
    /// Terminating signal, if any.
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// A normal exit with `code`.
    #[must_use]
    pub const fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    /// Termination by `signal`.
    #[must_use]
    pub const fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// Returns `true` for a zero exit code.
    #[must_use]
    pub const fn success(self) -> bool {
        matches!(self.code, Some(0))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// How a stop request completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The instance exited within its grace period.
    Graceful,
    /// The instance was killed after the grace period elapsed.
    Forced,
}

/// A launched service instance.
#[async_trait]
pub trait ServiceInstance: Send + Sync {
    /// Identifier of this instance.
    fn id(&self) -> &InstanceId;

    /// Runs one health probe. Callers enforce the probe timeout.
    async fn probe(&self, test: &HealthTest) -> ProbeOutcome;

    /// Resolves when the instance has exited.
    async fn wait(&self) -> ExitStatus;

    /// Asks the instance to stop, forcing it after `grace`.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::Backend`] if the instance cannot be signalled.
    async fn stop(&self, grace: Duration) -> Result<StopOutcome>;
}

/// Launches service instances.
#[async_trait]
pub trait ServiceBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Launches a new instance of `service`.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::Backend`] if the instance cannot be started.
    async fn start(
        &self,
        service: &ServiceDescriptor,
        instance: InstanceId,
    ) -> Result<Box<dyn ServiceInstance>>;
}

/// Selects a backend by name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendKind {
    /// Run services as host processes.
    #[default]
    Process,
    /// Simulate services in memory.
    Simulate,
}

impl BackendKind {
    /// Creates the backend for this kind.
    ///
    /// `detached` keeps process instances alive after the stack handle is
    /// dropped.
    #[must_use]
    pub fn create(self, detached: bool) -> Arc<dyn ServiceBackend> {
        match self {
            Self::Process => Arc::new(ProcessBackend::new().detached(detached)),
            Self::Simulate => Arc::new(SimulatedBackend::from_labels()),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "process" => Ok(Self::Process),
            "simulate" => Ok(Self::Simulate),
            other => Err(StackError::Config {
                message: format!("unknown backend \"{other}\" (expected process or simulate)"),
            }),
        }
    }
}
