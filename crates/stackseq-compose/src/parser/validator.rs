//! Static analysis of the decoded stack.
//!
//! Checks for missing image sources, clashing host ports, and duplicate
//! instance names before the stack is planned or started. Suspicious but
//! legal descriptors produce warnings instead of errors.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use stackseq_common::error::{Result, StackError};
use stackseq_common::types::DependencyCondition;

use crate::model::EffectiveStack;

/// A non-fatal finding about the stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    /// Service the warning concerns.
    pub service: String,
    /// Description of the finding.
    pub message: String,
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service \"{}\": {}", self.service, self.message)
    }
}

/// Validates a decoded stack for semantic correctness.
///
/// # Checks performed
///
/// 1. Every service declares an `image` or a `build` context.
/// 2. No two services publish the same host port and protocol.
/// 3. No two services share a `container_name`.
///
/// Warnings are returned for `healthy`-gated dependencies on services
/// without a health check, and for keys that are carried through
/// uninterpreted.
///
/// # Errors
///
/// Returns [`StackError::Parse`] naming the offending service and layers
/// if any check fails.
pub fn validate(stack: &EffectiveStack) -> Result<Vec<ValidationWarning>> {
    tracing::info!(services = stack.services.len(), "validating stack");
    check_image_or_build(stack)?;
    check_published_ports(stack)?;
    check_container_names(stack)?;

    let mut warnings = healthy_gate_warnings(stack);
    warnings.extend(extra_key_warnings(stack));
    for warning in &warnings {
        tracing::warn!(service = %warning.service, "{}", warning.message);
    }
    Ok(warnings)
}

fn check_image_or_build(stack: &EffectiveStack) -> Result<()> {
    for svc in stack.services.values() {
        if svc.image.is_none() && svc.build.is_none() {
            return Err(StackError::service_parse(
                svc.declared_in.clone(),
                &svc.name,
                "service declares neither `image` nor `build`",
            ));
        }
    }
    Ok(())
}

fn check_published_ports(stack: &EffectiveStack) -> Result<()> {
    let mut seen: HashMap<_, &str> = HashMap::new();
    for svc in stack.services.values() {
        for port in &svc.ports {
            let Some(binding) = port.host_binding() else {
                continue;
            };
            if let Some(owner) = seen.insert(binding, &svc.name) {
                return Err(StackError::service_parse(
                    svc.origin_of("ports"),
                    &svc.name,
                    format!(
                        "host port {} is already published by service \"{owner}\"",
                        binding.1
                    ),
                ));
            }
        }
    }
    Ok(())
}

fn check_container_names(stack: &EffectiveStack) -> Result<()> {
    let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
    for svc in stack.services.values() {
        let Some(name) = svc.container_name.as_deref() else {
            continue;
        };
        if let Some(owner) = seen.insert(name, &svc.name) {
            return Err(StackError::service_parse(
                svc.origin_of("container_name"),
                &svc.name,
                format!("container_name \"{name}\" is already used by service \"{owner}\""),
            ));
        }
    }
    Ok(())
}

fn healthy_gate_warnings(stack: &EffectiveStack) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();
    for svc in stack.services.values() {
        for (dep, condition) in &svc.depends_on {
            if *condition != DependencyCondition::Healthy {
                continue;
            }
            if stack.service(dep).is_some_and(|d| !d.has_healthcheck()) {
                warnings.push(ValidationWarning {
                    service: svc.name.clone(),
                    message: format!(
                        "waits for \"{dep}\" to be healthy, but \"{dep}\" has no health check and counts as healthy once started"
                    ),
                });
            }
        }
    }
    warnings
}

fn extra_key_warnings(stack: &EffectiveStack) -> Vec<ValidationWarning> {
    stack
        .services
        .values()
        .filter(|svc| !svc.extra.is_empty())
        .map(|svc| ValidationWarning {
            service: svc.name.clone(),
            message: format!(
                "ignoring unsupported keys: {}",
                svc.extra.keys().cloned().collect::<Vec<_>>().join(", ")
            ),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BuildSpec, HealthCheck, HealthTest, PortMapping, ServiceDescriptor};

    fn make_service(name: &str, image: Option<&str>) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.into(),
            image: image.map(Into::into),
            declared_in: "compose.yaml (layer 0)".into(),
            ..ServiceDescriptor::default()
        }
    }

    fn stack_of(services: Vec<ServiceDescriptor>) -> EffectiveStack {
        EffectiveStack {
            project_name: None,
            services: services.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }

    #[test]
    fn validate_empty_stack_succeeds() {
        let warnings = validate(&EffectiveStack::default()).expect("should validate");
        assert!(warnings.is_empty());
    }

    #[test]
    fn validate_missing_image_and_build_fails() {
        let stack = stack_of(vec![make_service("broken", None)]);
        let msg = validate(&stack).unwrap_err().to_string();
        assert!(msg.contains("neither `image` nor `build`"), "got: {msg}");
        assert!(msg.contains("broken"), "got: {msg}");
    }

    #[test]
    fn validate_build_without_image_succeeds() {
        let mut svc = make_service("api", None);
        svc.build = Some(BuildSpec {
            context: "./api".into(),
            ..BuildSpec::default()
        });
        assert!(validate(&stack_of(vec![svc])).is_ok());
    }

    #[test]
    fn validate_duplicate_host_port_fails() {
        let mut a = make_service("a", Some("img"));
        a.ports = vec![PortMapping::parse("8080:80").unwrap()];
        let mut b = make_service("b", Some("img"));
        b.ports = vec![PortMapping::parse("8080:8000").unwrap()];
        let msg = validate(&stack_of(vec![a, b])).unwrap_err().to_string();
        assert!(msg.contains("host port 8080"), "got: {msg}");
    }

    #[test]
    fn validate_same_port_different_protocol_succeeds() {
        let mut a = make_service("a", Some("img"));
        a.ports = vec![PortMapping::parse("53:53").unwrap()];
        let mut b = make_service("b", Some("img"));
        b.ports = vec![PortMapping::parse("53:53/udp").unwrap()];
        assert!(validate(&stack_of(vec![a, b])).is_ok());
    }

    #[test]
    fn validate_duplicate_container_name_fails() {
        let mut a = make_service("a", Some("img"));
        a.container_name = Some("shared".into());
        let mut b = make_service("b", Some("img"));
        b.container_name = Some("shared".into());
        assert!(validate(&stack_of(vec![a, b])).is_err());
    }

    #[test]
    fn healthy_gate_without_healthcheck_warns() {
        let mut web = make_service("web", Some("web"));
        let _ = web
            .depends_on
            .insert("postgres".into(), DependencyCondition::Healthy);
        let postgres = make_service("postgres", Some("postgres:16"));
        let warnings = validate(&stack_of(vec![web.clone(), postgres.clone()])).unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].service, "web");

        let mut checked = postgres;
        checked.healthcheck = Some(HealthCheck::new(HealthTest::Shell("pg_isready".into())));
        let warnings = validate(&stack_of(vec![web, checked])).unwrap();
        assert!(warnings.is_empty());
    }

    #[test]
    fn extra_keys_warn() {
        let mut svc = make_service("api", Some("api"));
        let _ = svc
            .extra
            .insert("privileged".into(), serde_yaml::Value::Bool(true));
        let warnings = validate(&stack_of(vec![svc])).unwrap();
        assert!(warnings[0].message.contains("privileged"));
    }
}
