//! Domain primitive types used across the stackseq workspace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StackError;

/// Unique identifier for one running instance of a service.
///
/// A service that is restarted gets a fresh instance id each time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    /// Creates an instance ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random instance ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the first eight characters, for compact display.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resource limits for a service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU quota in cores (e.g. `0.5`).
    pub cpus: Option<f64>,
    /// Memory limit in bytes.
    pub memory_bytes: Option<u64>,
}

impl ResourceLimits {
    /// Returns `true` if no limit is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.cpus.is_none() && self.memory_bytes.is_none()
    }
}

/// Condition a dependency must reach before its dependent may start.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DependencyCondition {
    /// The dependency has at least entered `starting`.
    #[default]
    Started,
    /// The dependency's health check has passed.
    Healthy,
}

impl FromStr for DependencyCondition {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" | "service_started" => Ok(Self::Started),
            "healthy" | "service_healthy" => Ok(Self::Healthy),
            other => Err(StackError::Config {
                message: format!(
                    "unsupported dependency condition \"{other}\" (expected service_started or service_healthy)"
                ),
            }),
        }
    }
}

impl fmt::Display for DependencyCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::Healthy => write!(f, "healthy"),
        }
    }
}

/// What happens to a service after its instance stops or turns unhealthy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum RestartPolicy {
    /// Never restart.
    #[default]
    No,
    /// Restart after abnormal termination, optionally capped.
    OnFailure {
        /// Maximum number of restarts, unlimited when `None`.
        max_retries: Option<u32>,
    },
    /// Always restart.
    Always,
    /// Restart unless the stack is being shut down.
    UnlessStopped,
}

impl RestartPolicy {
    /// Decides whether an instance that ended should be requeued.
    ///
    /// `abnormal` is true for a non-zero exit, a crash, or an unhealthy
    /// verdict. `restarts` counts restarts already performed.
    #[must_use]
    pub fn requeues(self, abnormal: bool, restarts: u32) -> bool {
        match self {
            Self::No => false,
            Self::Always | Self::UnlessStopped => true,
            Self::OnFailure { max_retries } => {
                abnormal && max_retries.is_none_or(|max| restarts < max)
            }
        }
    }
}

impl FromStr for RestartPolicy {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no" | "" => Ok(Self::No),
            "always" => Ok(Self::Always),
            "unless-stopped" => Ok(Self::UnlessStopped),
            "on-failure" => Ok(Self::OnFailure { max_retries: None }),
            other => {
                let Some(count) = other.strip_prefix("on-failure:") else {
                    return Err(StackError::Config {
                        message: format!("unknown restart policy \"{other}\""),
                    });
                };
                let max = count.parse::<u32>().map_err(|_| StackError::Config {
                    message: format!("invalid on-failure retry count \"{count}\""),
                })?;
                Ok(Self::OnFailure {
                    max_retries: Some(max),
                })
            }
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::No => write!(f, "no"),
            Self::OnFailure { max_retries: None } => write!(f, "on-failure"),
            Self::OnFailure {
                max_retries: Some(n),
            } => write!(f, "on-failure:{n}"),
            Self::Always => write!(f, "always"),
            Self::UnlessStopped => write!(f, "unless-stopped"),
        }
    }
}

impl From<RestartPolicy> for String {
    fn from(policy: RestartPolicy) -> Self {
        policy.to_string()
    }
}

impl TryFrom<String> for RestartPolicy {
    type Error = StackError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Health of a running service instance, driven by probe outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Probes have not yet established health.
    Starting,
    /// The most recent evaluation passed.
    Healthy,
    /// Consecutive failures reached the retry count.
    Unhealthy,
    /// The instance is no longer running.
    Stopped,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Lifecycle state of a service as tracked by the startup sequencer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Queued, not yet evaluated.
    #[default]
    Pending,
    /// Blocked on one or more dependencies.
    WaitingForDeps,
    /// Instance launched, health not yet established.
    Starting,
    /// Health check passed.
    Healthy,
    /// Started and healthy (or without health check); steady state.
    Running,
    /// Health check failing.
    Unhealthy,
    /// Stop requested, waiting for the instance to exit.
    Stopping,
    /// Instance ended or was never started.
    Stopped,
}

impl ServiceState {
    /// Returns `true` if the instance currently reports healthy (the
    /// `healthy` dependency condition).
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy | Self::Running)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::WaitingForDeps => "waiting_for_deps",
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Running => "running",
            Self::Unhealthy => "unhealthy",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// A service that did not reach its required state before a deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedService {
    /// Service name.
    pub service: String,
    /// State the service was in when the deadline fired.
    pub state: ServiceState,
    /// Dependencies whose condition was still unsatisfied.
    pub waiting_on: Vec<String>,
}

impl fmt::Display for BlockedService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.waiting_on.is_empty() {
            write!(f, "{} ({})", self.service, self.state)
        } else {
            write!(
                f,
                "{} ({}, waiting on {})",
                self.service,
                self.state,
                self.waiting_on.join(", ")
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_policy_parses_all_forms() {
        assert_eq!("no".parse::<RestartPolicy>().unwrap(), RestartPolicy::No);
        assert_eq!(
            "always".parse::<RestartPolicy>().unwrap(),
            RestartPolicy::Always
        );
        assert_eq!(
            "unless-stopped".parse::<RestartPolicy>().unwrap(),
            RestartPolicy::UnlessStopped
        );
        assert_eq!(
            "on-failure".parse::<RestartPolicy>().unwrap(),
            RestartPolicy::OnFailure { max_retries: None }
        );
        assert_eq!(
            "on-failure:3".parse::<RestartPolicy>().unwrap(),
            RestartPolicy::OnFailure {
                max_retries: Some(3)
            }
        );
        assert!("sometimes".parse::<RestartPolicy>().is_err());
        assert!("on-failure:x".parse::<RestartPolicy>().is_err());
    }

    #[test]
    fn restart_policy_requeue_rules() {
        assert!(!RestartPolicy::No.requeues(true, 0));
        assert!(RestartPolicy::Always.requeues(false, 10));
        assert!(RestartPolicy::UnlessStopped.requeues(false, 0));
        let on_failure = RestartPolicy::OnFailure { max_retries: None };
        assert!(on_failure.requeues(true, 100));
        assert!(!on_failure.requeues(false, 0));
        let capped = RestartPolicy::OnFailure {
            max_retries: Some(2),
        };
        assert!(capped.requeues(true, 1));
        assert!(!capped.requeues(true, 2));
    }

    #[test]
    fn restart_policy_serializes_as_string() {
        let json = serde_json::to_string(&RestartPolicy::OnFailure {
            max_retries: Some(5),
        })
        .unwrap();
        assert_eq!(json, "\"on-failure:5\"");
        let back: RestartPolicy = serde_json::from_str("\"unless-stopped\"").unwrap();
        assert_eq!(back, RestartPolicy::UnlessStopped);
    }

    #[test]
    fn dependency_condition_accepts_compose_spelling() {
        assert_eq!(
            "service_healthy".parse::<DependencyCondition>().unwrap(),
            DependencyCondition::Healthy
        );
        assert_eq!(
            "started".parse::<DependencyCondition>().unwrap(),
            DependencyCondition::Started
        );
        assert!(
            "service_completed_successfully"
                .parse::<DependencyCondition>()
                .is_err()
        );
    }

    #[test]
    fn healthy_states() {
        assert!(!ServiceState::Starting.is_healthy());
        assert!(ServiceState::Healthy.is_healthy());
        assert!(ServiceState::Running.is_healthy());
        assert!(!ServiceState::Unhealthy.is_healthy());
        assert!(!ServiceState::Stopped.is_healthy());
    }

    #[test]
    fn dependency_conditions_order_by_strictness() {
        assert!(DependencyCondition::Started < DependencyCondition::Healthy);
    }

    #[test]
    fn instance_id_short_form() {
        let id = InstanceId::new("0123456789abcdef");
        assert_eq!(id.short(), "01234567");
        assert_eq!(InstanceId::new("abc").short(), "abc");
        assert_ne!(InstanceId::generate(), InstanceId::generate());
    }
}
