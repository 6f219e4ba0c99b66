//! Unified error type for the stackseq workspace.
//!
//! Every variant carries enough provenance (file or layer, service name)
//! for a user to locate the offending declaration without re-running
//! with extra logging.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::constants::{EXIT_CYCLE, EXIT_STARTUP_TIMEOUT, EXIT_VALIDATION};
use crate::types::BlockedService;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum StackError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A descriptor or environment file does not exist.
    #[error("file not found: {path}")]
    NotFound {
        /// Path that was requested.
        path: PathBuf,
    },

    /// A file or merged value is structurally malformed.
    #[error("parse error in {origin}{}: {message}", service_suffix(.service.as_deref()))]
    Parse {
        /// File, layer, or phase the malformed input came from.
        origin: String,
        /// Service the malformed value belongs to, if any.
        service: Option<String>,
        /// Description of the problem.
        message: String,
    },

    /// Two layers give incompatible shapes to the same field.
    #[error(
        "merge conflict in service \"{service}\" at `{field}`: {earlier} declares a {earlier_shape}, {later} declares a {later_shape}"
    )]
    MergeConflict {
        /// Service whose field conflicts.
        service: String,
        /// Dotted path of the conflicting field.
        field: String,
        /// Origin of the accumulated value.
        earlier: String,
        /// Shape of the accumulated value.
        earlier_shape: &'static str,
        /// Origin of the incoming value.
        later: String,
        /// Shape of the incoming value.
        later_shape: &'static str,
    },

    /// A required variable is absent from the environment mapping.
    #[error(
        "variable `{variable}` is not set (service \"{service}\", field `{field}`, from {origin}){}",
        message_suffix(.message.as_deref())
    )]
    MissingVariable {
        /// Name of the unresolved variable.
        variable: String,
        /// Service whose field references the variable.
        service: String,
        /// Dotted path of the field containing the marker.
        field: String,
        /// Layers that contributed the field.
        origin: String,
        /// Custom message from a `${NAME:?message}` marker.
        message: Option<String>,
    },

    /// A dependency names a service that is not defined.
    #[error("service \"{service}\" depends on undefined service \"{dependency}\" (declared in {origin})")]
    UnknownService {
        /// The dependent service.
        service: String,
        /// The missing dependency target.
        dependency: String,
        /// Layers that declared the dependency.
        origin: String,
    },

    /// The dependency graph contains a cycle.
    #[error("cyclic dependency detected: {}", .cycle.join(" -> "))]
    CyclicDependency {
        /// Services along the cycle, first element repeated at the end.
        cycle: Vec<String>,
    },

    /// A single health probe exceeded its timeout.
    #[error("health check for service \"{service}\" timed out after {timeout:?}")]
    HealthCheckTimeout {
        /// Service being probed.
        service: String,
        /// Configured probe timeout.
        timeout: Duration,
    },

    /// One or more services never reached their required state.
    #[error("startup timed out after {timeout:?}: {}", describe_blocked(.blocked))]
    StartupTimeout {
        /// Global startup timeout that elapsed.
        timeout: Duration,
        /// Services that did not settle, with what they were waiting on.
        blocked: Vec<BlockedService>,
    },

    /// The service backend failed to start, probe, or stop an instance.
    #[error("backend error for service \"{service}\": {message}")]
    Backend {
        /// Service the operation targeted.
        service: String,
        /// Description of the failure.
        message: String,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },
}

impl StackError {
    /// Process exit code for this error.
    ///
    /// Cycles and startup timeouts have dedicated codes; every other
    /// resolution failure is a validation error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::CyclicDependency { .. } => EXIT_CYCLE,
            Self::StartupTimeout { .. } => EXIT_STARTUP_TIMEOUT,
            _ => EXIT_VALIDATION,
        }
    }

    /// Builds a [`StackError::Parse`] for a whole file or phase.
    pub fn parse(origin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            origin: origin.into(),
            service: None,
            message: message.into(),
        }
    }

    /// Builds a [`StackError::Parse`] scoped to one service.
    pub fn service_parse(
        origin: impl Into<String>,
        service: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Parse {
            origin: origin.into(),
            service: Some(service.into()),
            message: message.into(),
        }
    }
}

fn service_suffix(service: Option<&str>) -> String {
    service.map_or_else(String::new, |s| format!(" (service \"{s}\")"))
}

fn message_suffix(message: Option<&str>) -> String {
    message.map_or_else(String::new, |m| format!(": {m}"))
}

fn describe_blocked(blocked: &[BlockedService]) -> String {
    blocked
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, StackError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServiceState;

    #[test]
    fn cycle_message_lists_full_path() {
        let err = StackError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "cyclic dependency detected: a -> b -> a");
        assert_eq!(err.exit_code(), EXIT_CYCLE);
    }

    #[test]
    fn startup_timeout_names_blocked_services_and_dependencies() {
        let err = StackError::StartupTimeout {
            timeout: Duration::from_secs(5),
            blocked: vec![
                BlockedService {
                    service: "web".into(),
                    state: ServiceState::WaitingForDeps,
                    waiting_on: vec!["postgres".into()],
                },
                BlockedService {
                    service: "postgres".into(),
                    state: ServiceState::Unhealthy,
                    waiting_on: Vec::new(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("web (waiting_for_deps, waiting on postgres)"), "got: {msg}");
        assert!(msg.contains("postgres (unhealthy)"), "got: {msg}");
        assert_eq!(err.exit_code(), EXIT_STARTUP_TIMEOUT);
    }

    #[test]
    fn parse_error_mentions_service_when_scoped() {
        let err = StackError::service_parse("compose.yaml (layer 0)", "web", "bad port");
        assert_eq!(
            err.to_string(),
            "parse error in compose.yaml (layer 0) (service \"web\"): bad port"
        );
        assert_eq!(err.exit_code(), EXIT_VALIDATION);
    }

    #[test]
    fn missing_variable_includes_custom_message() {
        let err = StackError::MissingVariable {
            variable: "DB_PASSWORD".into(),
            service: "db".into(),
            field: "environment.POSTGRES_PASSWORD".into(),
            origin: "compose.yaml (layer 0)".into(),
            message: Some("set it in .env".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("DB_PASSWORD"));
        assert!(msg.ends_with(": set it in .env"), "got: {msg}");
    }
}
