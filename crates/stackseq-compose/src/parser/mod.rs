//! Typed decoding of merged service bodies.
//!
//! Turns the raw, merged and interpolated YAML of each service into a
//! [`ServiceDescriptor`], then runs static validation over the result.

pub mod duration;
pub mod env_file;
pub mod interpolate;
pub mod validator;

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use serde_yaml::{Mapping, Value};
use stackseq_common::error::{Result, StackError};
use stackseq_common::types::{DependencyCondition, ResourceLimits, RestartPolicy};

use self::duration::parse_duration;
use crate::merge::{MergedService, MergedStack, scalar_text};
use crate::model::{
    BuildSpec, CommandSpec, EffectiveStack, HealthCheck, HealthTest, PortMapping,
    ServiceDescriptor, VolumeMount,
};

/// Keys accepted and carried through without interpretation.
const PASSTHROUGH_KEYS: [&str; 11] = [
    "networks",
    "network_mode",
    "hostname",
    "user",
    "env_file",
    "expose",
    "extra_hosts",
    "logging",
    "platform",
    "profiles",
    "stop_signal",
];

/// Error context for one service being decoded.
struct Decoder<'a> {
    name: &'a str,
    merged: &'a MergedService,
}

impl Decoder<'_> {
    fn err(&self, field: &str, message: impl Into<String>) -> StackError {
        StackError::service_parse(self.merged.origin_of(field), self.name, message.into())
    }

    fn string(&self, field: &str, value: &Value) -> Result<String> {
        match value {
            Value::Mapping(_) | Value::Sequence(_) | Value::Tagged(_) => {
                Err(self.err(field, format!("`{field}` must be a scalar")))
            }
            other => scalar_text(other).ok_or_else(|| self.err(field, format!("`{field}` is empty"))),
        }
    }

    fn string_map(&self, field: &str, value: &Value) -> Result<BTreeMap<String, String>> {
        let Value::Mapping(map) = value else {
            return Err(self.err(field, format!("`{field}` must be a mapping")));
        };
        let mut out = BTreeMap::new();
        for (key, val) in map {
            let key = self.string(field, key)?;
            if val.is_null() {
                continue;
            }
            let val = self.string(&format!("{field}.{key}"), val)?;
            let _ = out.insert(key, val);
        }
        Ok(out)
    }

    fn command(&self, field: &str, value: &Value) -> Result<CommandSpec> {
        match value {
            Value::String(line) => Ok(CommandSpec::Shell(line.clone())),
            Value::Sequence(items) => items
                .iter()
                .map(|item| self.string(field, item))
                .collect::<Result<Vec<_>>>()
                .map(CommandSpec::Exec),
            _ => Err(self.err(field, format!("`{field}` must be a string or list"))),
        }
    }

    fn duration(&self, field: &str, value: &Value) -> Result<Duration> {
        let text = self.string(field, value)?;
        parse_duration(&text).ok_or_else(|| self.err(field, format!("invalid duration \"{text}\" for `{field}`")))
    }

    fn build(&self, value: &Value) -> Result<BuildSpec> {
        let Value::Mapping(map) = value else {
            return Err(self.err("build", "`build` must be a string or mapping"));
        };
        let mut spec = BuildSpec::default();
        for (key, val) in map {
            match key.as_str() {
                Some("context") => spec.context = self.string("build", val)?,
                Some("dockerfile") => spec.dockerfile = Some(self.string("build", val)?),
                Some("args") => spec.args = self.key_values("build", val)?,
                _ => {}
            }
        }
        if spec.context.is_empty() {
            spec.context = ".".into();
        }
        Ok(spec)
    }

    /// Decodes a map or a list of `KEY=VALUE` strings.
    fn key_values(&self, field: &str, value: &Value) -> Result<BTreeMap<String, String>> {
        match value {
            Value::Sequence(items) => {
                let mut out = BTreeMap::new();
                for item in items {
                    let entry = self.string(field, item)?;
                    if let Some((k, v)) = entry.split_once('=') {
                        let _ = out.insert(k.to_owned(), v.to_owned());
                    }
                }
                Ok(out)
            }
            other => self.string_map(field, other),
        }
    }

    fn depends_on(&self, value: &Value) -> Result<BTreeMap<String, DependencyCondition>> {
        let Value::Mapping(map) = value else {
            return Err(self.err("depends_on", "`depends_on` must be a list or mapping"));
        };
        let mut out = BTreeMap::new();
        for (key, spec) in map {
            let target = self.string("depends_on", key)?;
            let condition = match spec.get("condition") {
                None | Some(Value::Null) => DependencyCondition::Started,
                Some(cond) => {
                    let text = self.string("depends_on", cond)?;
                    DependencyCondition::from_str(&text)
                        .map_err(|e| self.err("depends_on", format!("{target}: {e}")))?
                }
            };
            let _ = out.insert(target, condition);
        }
        Ok(out)
    }

    fn healthcheck(&self, value: &Value) -> Result<Option<HealthCheck>> {
        let Value::Mapping(map) = value else {
            return Err(self.err("healthcheck", "`healthcheck` must be a mapping"));
        };
        if map.get("disable").and_then(Value::as_bool) == Some(true) {
            return Ok(None);
        }
        let Some(test) = map.get("test") else {
            return Err(self.err("healthcheck", "`healthcheck` requires `test`"));
        };
        let Some(test) = self.health_test(test)? else {
            return Ok(None);
        };

        let mut check = HealthCheck::new(test);
        if let Some(v) = present(map, "interval") {
            check.interval = self.duration("healthcheck.interval", v)?;
        }
        if let Some(v) = present(map, "timeout") {
            check.timeout = self.duration("healthcheck.timeout", v)?;
        }
        if let Some(v) = present(map, "start_period") {
            check.start_period = self.duration("healthcheck.start_period", v)?;
        }
        if let Some(v) = present(map, "retries") {
            let text = self.string("healthcheck.retries", v)?;
            check.retries = text
                .parse()
                .map_err(|_| self.err("healthcheck", format!("invalid retries \"{text}\"")))?;
        }
        if check.interval.is_zero() {
            return Err(self.err("healthcheck", "healthcheck interval must be positive"));
        }
        Ok(Some(check))
    }

    fn health_test(&self, value: &Value) -> Result<Option<HealthTest>> {
        let field = "healthcheck.test";
        match value {
            Value::String(line) => Ok(Some(HealthTest::Shell(line.clone()))),
            Value::Sequence(items) => {
                let args = items
                    .iter()
                    .map(|item| self.string(field, item))
                    .collect::<Result<Vec<_>>>()?;
                match args.split_first() {
                    Some((kind, _)) if kind == "NONE" => Ok(None),
                    Some((kind, rest)) if kind == "CMD" && !rest.is_empty() => {
                        Ok(Some(HealthTest::Cmd(rest.to_vec())))
                    }
                    Some((kind, rest)) if kind == "CMD-SHELL" && !rest.is_empty() => {
                        Ok(Some(HealthTest::Shell(rest.join(" "))))
                    }
                    _ => Err(self.err(
                        field,
                        "`healthcheck.test` must start with CMD, CMD-SHELL, or NONE",
                    )),
                }
            }
            _ => Err(self.err(field, "`healthcheck.test` must be a string or list")),
        }
    }

    fn resources(&self, body: &Mapping) -> Result<ResourceLimits> {
        let mut limits = ResourceLimits::default();
        if let Some(v) = present(body, "cpus") {
            limits.cpus = Some(self.cpus("cpus", v)?);
        }
        if let Some(v) = present(body, "mem_limit") {
            limits.memory_bytes = Some(self.memory("mem_limit", v)?);
        }
        let deploy_limits = body
            .get("deploy")
            .and_then(|d| d.get("resources"))
            .and_then(|r| r.get("limits"));
        if let Some(Value::Mapping(map)) = deploy_limits {
            if let Some(v) = present(map, "cpus") {
                limits.cpus = Some(self.cpus("deploy", v)?);
            }
            if let Some(v) = present(map, "memory") {
                limits.memory_bytes = Some(self.memory("deploy", v)?);
            }
        }
        Ok(limits)
    }

    fn cpus(&self, field: &str, value: &Value) -> Result<f64> {
        let text = self.string(field, value)?;
        text.parse::<f64>()
            .ok()
            .filter(|c| c.is_finite() && *c > 0.0)
            .ok_or_else(|| self.err(field, format!("invalid cpu limit \"{text}\"")))
    }

    fn memory(&self, field: &str, value: &Value) -> Result<u64> {
        let text = self.string(field, value)?;
        parse_memory(&text).ok_or_else(|| self.err(field, format!("invalid memory limit \"{text}\"")))
    }

    fn list<T>(
        &self,
        field: &str,
        value: &Value,
        decode: impl Fn(&Value) -> std::result::Result<T, String>,
    ) -> Result<Vec<T>> {
        let Value::Sequence(items) = value else {
            return Err(self.err(field, format!("`{field}` must be a list")));
        };
        items
            .iter()
            .enumerate()
            .map(|(idx, item)| decode(item).map_err(|m| self.err(field, format!("{field}[{idx}]: {m}"))))
            .collect()
    }
}

fn present<'m>(map: &'m Mapping, key: &str) -> Option<&'m Value> {
    map.get(key).filter(|v| !v.is_null())
}

/// Decodes every merged service into its typed form.
///
/// # Errors
///
/// Returns [`StackError::Parse`] naming the service and contributing
/// layers for the first field that cannot be decoded.
pub fn decode_stack(merged: &MergedStack) -> Result<EffectiveStack> {
    let mut stack = EffectiveStack {
        project_name: merged.project_name.clone(),
        services: BTreeMap::new(),
    };
    for (name, service) in &merged.services {
        let _ = stack
            .services
            .insert(name.clone(), decode_service(name, service)?);
    }
    tracing::debug!(services = stack.services.len(), "services decoded");
    Ok(stack)
}

/// Decodes one merged service.
///
/// # Errors
///
/// Returns [`StackError::Parse`] if a field has the wrong shape or an
/// invalid value.
pub fn decode_service(name: &str, merged: &MergedService) -> Result<ServiceDescriptor> {
    let d = Decoder { name, merged };
    let mut svc = ServiceDescriptor {
        name: name.to_owned(),
        declared_in: merged.origin_of(""),
        ..ServiceDescriptor::default()
    };

    for (key, value) in &merged.body {
        let Some(key) = key.as_str() else {
            return Err(d.err("", "field names must be strings"));
        };
        let _ = svc.origins.insert(key.to_owned(), merged.origin_of(key));
        if value.is_null() {
            continue;
        }
        match key {
            "image" => svc.image = Some(d.string(key, value)?),
            "build" => svc.build = Some(d.build(value)?),
            "command" => svc.command = Some(d.command(key, value)?),
            "entrypoint" => svc.entrypoint = Some(d.command(key, value)?),
            "container_name" => svc.container_name = Some(d.string(key, value)?),
            "working_dir" => svc.working_dir = Some(d.string(key, value)?),
            "ports" => svc.ports = d.list(key, value, PortMapping::from_value)?,
            "volumes" => svc.volumes = d.list(key, value, VolumeMount::from_value)?,
            "environment" => svc.environment = d.string_map(key, value)?,
            "labels" => svc.labels = d.string_map(key, value)?,
            "depends_on" => svc.depends_on = d.depends_on(value)?,
            "healthcheck" => svc.healthcheck = d.healthcheck(value)?,
            "restart" => {
                let text = d.string(key, value)?;
                svc.restart = RestartPolicy::from_str(&text).map_err(|e| d.err(key, e.to_string()))?;
            }
            "stop_grace_period" => svc.stop_grace_period = Some(d.duration(key, value)?),
            "cpus" | "mem_limit" | "deploy" => {}
            other if PASSTHROUGH_KEYS.contains(&other) || other.starts_with("x-") => {}
            other => {
                let _ = svc.extra.insert(other.to_owned(), value.clone());
            }
        }
    }
    svc.resources = d.resources(&merged.body)?;
    Ok(svc)
}

/// Parses memory sizes like `512m`, `1g`, `128MiB`, `256MB`, or plain
/// bytes.
#[must_use]
pub fn parse_memory(s: &str) -> Option<u64> {
    let s = s.trim();
    let lower = s.to_ascii_lowercase();
    let units: [(&str, u64); 11] = [
        ("gib", 1 << 30),
        ("mib", 1 << 20),
        ("kib", 1 << 10),
        ("gb", 1_000_000_000),
        ("mb", 1_000_000),
        ("kb", 1000),
        ("g", 1 << 30),
        ("m", 1 << 20),
        ("k", 1 << 10),
        ("b", 1),
        ("", 1),
    ];
    units.iter().find_map(|(suffix, multiplier)| {
        let num = lower.strip_suffix(suffix)?;
        num.trim().parse::<u64>().ok()?.checked_mul(*multiplier)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::parse_layer;
    use crate::loader::LayerOrigin;
    use crate::merge::merge_layers;

    fn decode(yaml: &str) -> Result<EffectiveStack> {
        let layer = parse_layer(yaml, LayerOrigin::new("compose.yaml", 0))?;
        decode_stack(&merge_layers(&[layer])?)
    }

    fn service(yaml: &str, name: &str) -> ServiceDescriptor {
        let stack = decode(yaml).expect("should decode");
        stack.services.get(name).cloned().expect("service exists")
    }

    #[test]
    fn decodes_full_service() {
        let svc = service(
            r#"
services:
  api:
    image: app:1.0
    command: ["uvicorn", "main:app"]
    container_name: api-1
    ports: ["8000:8000"]
    volumes: ["./src:/app/src:ro"]
    environment:
      LOG_LEVEL: info
      WORKERS: 4
    labels: [tier=backend]
    depends_on:
      postgres:
        condition: service_healthy
      redis:
    healthcheck:
      test: ["CMD", "curl", "-f", "http://localhost:8000/health"]
      interval: 10s
      retries: 5
    restart: on-failure:3
    stop_grace_period: 1m30s
"#,
            "api",
        );
        assert_eq!(svc.image.as_deref(), Some("app:1.0"));
        assert_eq!(
            svc.command,
            Some(CommandSpec::Exec(vec!["uvicorn".into(), "main:app".into()]))
        );
        assert_eq!(svc.ports[0].published, Some(8000));
        assert!(svc.volumes[0].read_only);
        assert_eq!(svc.environment.get("WORKERS").map(String::as_str), Some("4"));
        assert_eq!(svc.labels.get("tier").map(String::as_str), Some("backend"));
        assert_eq!(
            svc.depends_on.get("postgres"),
            Some(&DependencyCondition::Healthy)
        );
        assert_eq!(
            svc.depends_on.get("redis"),
            Some(&DependencyCondition::Started)
        );
        let hc = svc.healthcheck.expect("healthcheck");
        assert_eq!(hc.interval, Duration::from_secs(10));
        assert_eq!(hc.timeout, Duration::from_secs(30));
        assert_eq!(hc.retries, 5);
        assert_eq!(svc.restart, RestartPolicy::OnFailure { max_retries: Some(3) });
        assert_eq!(svc.stop_grace_period, Some(Duration::from_secs(90)));
    }

    #[test]
    fn healthcheck_forms() {
        let shell = service(
            "services:\n  db:\n    image: pg\n    healthcheck:\n      test: pg_isready -U app\n",
            "db",
        );
        assert_eq!(
            shell.healthcheck.map(|h| h.test),
            Some(HealthTest::Shell("pg_isready -U app".into()))
        );

        let cmd_shell = service(
            "services:\n  db:\n    image: pg\n    healthcheck:\n      test: [CMD-SHELL, pg_isready]\n",
            "db",
        );
        assert_eq!(
            cmd_shell.healthcheck.map(|h| h.test),
            Some(HealthTest::Shell("pg_isready".into()))
        );

        let none = service(
            "services:\n  db:\n    image: pg\n    healthcheck:\n      test: [NONE]\n",
            "db",
        );
        assert!(none.healthcheck.is_none());

        let disabled = service(
            "services:\n  db:\n    image: pg\n    healthcheck:\n      test: [CMD, x]\n      disable: true\n",
            "db",
        );
        assert!(disabled.healthcheck.is_none());
    }

    #[test]
    fn invalid_healthcheck_test_is_rejected() {
        let err = decode("services:\n  db:\n    image: pg\n    healthcheck:\n      test: [curl, x]\n")
            .unwrap_err();
        assert!(err.to_string().contains("CMD"), "got: {err}");
    }

    #[test]
    fn resource_limits_from_deploy_and_legacy_keys() {
        let svc = service(
            r"
services:
  worker:
    image: w
    mem_limit: 256m
    deploy:
      resources:
        limits:
          cpus: '0.5'
",
            "worker",
        );
        assert_eq!(svc.resources.cpus, Some(0.5));
        assert_eq!(svc.resources.memory_bytes, Some(256 * 1024 * 1024));
    }

    #[test]
    fn unknown_keys_are_carried_as_extra() {
        let svc = service(
            "services:\n  api:\n    image: a\n    privileged: true\n    hostname: api\n    x-note: hi\n",
            "api",
        );
        assert_eq!(svc.extra.len(), 1);
        assert!(svc.extra.contains_key("privileged"));
    }

    #[test]
    fn build_defaults_context() {
        let svc = service(
            "services:\n  api:\n    build:\n      dockerfile: Dockerfile.dev\n      args: [MODE=dev]\n",
            "api",
        );
        let build = svc.build.expect("build");
        assert_eq!(build.context, ".");
        assert_eq!(build.args.get("MODE").map(String::as_str), Some("dev"));
    }

    #[test]
    fn decode_errors_name_service_and_layer() {
        let err = decode("services:\n  api:\n    image: a\n    ports: [\"http\"]\n").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("api"), "got: {msg}");
        assert!(msg.contains("compose.yaml (layer 0)"), "got: {msg}");
        assert!(msg.contains("ports[0]"), "got: {msg}");
    }

    #[test]
    fn invalid_restart_and_condition_are_rejected() {
        assert!(decode("services:\n  a:\n    image: a\n    restart: sometimes\n").is_err());
        assert!(
            decode("services:\n  a:\n    image: a\n    depends_on:\n      b:\n        condition: service_completed_successfully\n  b:\n    image: b\n")
                .is_err()
        );
    }

    #[test]
    fn parse_memory_units() {
        assert_eq!(parse_memory("128MiB"), Some(128 * 1024 * 1024));
        assert_eq!(parse_memory("1GiB"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_memory("512m"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory("256MB"), Some(256_000_000));
        assert_eq!(parse_memory("1048576"), Some(1_048_576));
        assert_eq!(parse_memory("abc"), None);
    }
}
