//! Typed model of the effective stack.
//!
//! Produced by [`crate::parser::decode_stack`] from a merged, interpolated
//! stack. Immutable once resolution finishes.

pub mod port;
pub mod volume;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Serialize, Serializer};
use stackseq_common::constants::{
    DEFAULT_HEALTHCHECK_INTERVAL, DEFAULT_HEALTHCHECK_RETRIES, DEFAULT_HEALTHCHECK_START_PERIOD,
    DEFAULT_HEALTHCHECK_TIMEOUT,
};
use stackseq_common::types::{DependencyCondition, ResourceLimits, RestartPolicy};

pub use self::port::{PortMapping, Protocol};
pub use self::volume::{VolumeKind, VolumeMount};

/// The merged, resolved set of services.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EffectiveStack {
    /// Project name, if any layer declared one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    /// Services keyed by name.
    pub services: BTreeMap<String, ServiceDescriptor>,
}

impl EffectiveStack {
    /// Looks up a service by name.
    #[must_use]
    pub fn service(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.get(name)
    }

    /// Service names in alphabetical order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }
}

/// One fully resolved service.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServiceDescriptor {
    /// Unique service name.
    #[serde(skip)]
    pub name: String,
    /// Image reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Build context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildSpec>,
    /// Command override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandSpec>,
    /// Entrypoint override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<CommandSpec>,
    /// Explicit instance name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    /// Working directory for the service process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Port mappings.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortMapping>,
    /// Mounts.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeMount>,
    /// Environment passed to the service.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    /// Free-form labels.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Dependencies and the condition each must reach.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub depends_on: BTreeMap<String, DependencyCondition>,
    /// Health check, if enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthCheck>,
    /// Resource limits.
    #[serde(skip_serializing_if = "ResourceLimits::is_empty")]
    pub resources: ResourceLimits,
    /// Restart policy.
    pub restart: RestartPolicy,
    /// Time allowed for a graceful stop before it is forced.
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_opt_duration"
    )]
    pub stop_grace_period: Option<Duration>,
    /// Keys this tool does not interpret, carried through unchanged.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_yaml::Value>,
    /// Layers that contributed each top-level field.
    #[serde(skip)]
    pub origins: BTreeMap<String, String>,
    /// Layers that declared the service.
    #[serde(skip)]
    pub declared_in: String,
}

impl ServiceDescriptor {
    /// Describes the layers that contributed `field`, falling back to the
    /// layers declaring the service.
    #[must_use]
    pub fn origin_of(&self, field: &str) -> &str {
        self.origins
            .get(field)
            .map_or(self.declared_in.as_str(), String::as_str)
    }

    /// Returns `true` if a health check gates this service.
    #[must_use]
    pub const fn has_healthcheck(&self) -> bool {
        self.healthcheck.is_some()
    }

    /// Full argument vector to launch, combining entrypoint and command.
    ///
    /// Shell-form parts run through `/bin/sh -c`.
    #[must_use]
    pub fn argv(&self) -> Vec<String> {
        let mut argv = self
            .entrypoint
            .as_ref()
            .map(CommandSpec::to_argv)
            .unwrap_or_default();
        if let Some(command) = &self.command {
            argv.extend(command.to_argv());
        }
        argv
    }
}

/// Build configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildSpec {
    /// Build context directory or URL.
    pub context: String,
    /// Alternate Dockerfile.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    /// Build arguments.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, String>,
}

/// A command in shell or exec form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CommandSpec {
    /// A single string run by a shell.
    Shell(String),
    /// An argument vector run directly.
    Exec(Vec<String>),
}

impl CommandSpec {
    /// Expands to an argument vector.
    #[must_use]
    pub fn to_argv(&self) -> Vec<String> {
        match self {
            Self::Shell(line) => vec!["/bin/sh".into(), "-c".into(), line.clone()],
            Self::Exec(args) => args.clone(),
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shell(line) => f.write_str(line),
            Self::Exec(args) => write!(f, "{}", args.join(" ")),
        }
    }
}

/// How a health probe is executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthTest {
    /// `["CMD", args...]`: run directly.
    Cmd(Vec<String>),
    /// `["CMD-SHELL", line]` or a plain string: run via a shell.
    Shell(String),
}

impl HealthTest {
    /// Expands to an argument vector.
    #[must_use]
    pub fn to_argv(&self) -> Vec<String> {
        match self {
            Self::Cmd(args) => args.clone(),
            Self::Shell(line) => vec!["/bin/sh".into(), "-c".into(), line.clone()],
        }
    }
}

impl fmt::Display for HealthTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cmd(args) => write!(f, "{}", args.join(" ")),
            Self::Shell(line) => write!(f, "sh -c {line:?}"),
        }
    }
}

/// Health check specification with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    /// Probe command.
    pub test: HealthTest,
    /// Time between probes.
    #[serde(serialize_with = "serialize_duration")]
    pub interval: Duration,
    /// Time a single probe may take.
    #[serde(serialize_with = "serialize_duration")]
    pub timeout: Duration,
    /// Consecutive failures before the service is unhealthy.
    pub retries: u32,
    /// Grace period during which failures do not count.
    #[serde(serialize_with = "serialize_duration")]
    pub start_period: Duration,
}

impl HealthCheck {
    /// A health check running `test` with default timings.
    #[must_use]
    pub const fn new(test: HealthTest) -> Self {
        Self {
            test,
            interval: DEFAULT_HEALTHCHECK_INTERVAL,
            timeout: DEFAULT_HEALTHCHECK_TIMEOUT,
            retries: DEFAULT_HEALTHCHECK_RETRIES,
            start_period: DEFAULT_HEALTHCHECK_START_PERIOD,
        }
    }
}

/// Formats a duration the way descriptors write it (`1m30s`, `500ms`).
#[must_use]
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".into();
    }
    if d.subsec_nanos() != 0 && d.as_secs() == 0 {
        let millis = d.as_millis();
        if millis > 0 && d.subsec_nanos() % 1_000_000 == 0 {
            return format!("{millis}ms");
        }
        return format!("{}us", d.as_micros());
    }
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{h}h"));
    }
    if m > 0 {
        out.push_str(&format!("{m}m"));
    }
    if s > 0 || out.is_empty() {
        out.push_str(&format!("{s}s"));
    }
    out
}

fn serialize_duration<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_duration(*d))
}

#[allow(clippy::ref_option)]
fn serialize_opt_duration<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => serialize_duration(d, s),
        None => s.serialize_none(),
    }
}
