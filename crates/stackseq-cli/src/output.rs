//! Formatted output helpers for CLI commands.
//!
//! Renders the startup plan as text, JSON, or YAML and formats byte
//! counts and states for humans.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::Serialize;
use stackseq_common::types::ServiceState;
use stackseq_compose::ResolvedStack;
use stackseq_compose::model::{ServiceDescriptor, format_duration};

/// Machine-readable plan: the effective stack plus its startup order.
#[derive(Debug, Serialize)]
pub struct PlanDocument<'a> {
    /// Project name, if a layer set one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<&'a str>,
    /// Descriptor files in precedence order.
    pub files: Vec<String>,
    /// Topological startup order.
    pub order: &'a [String],
    /// Services grouped into concurrent startup waves.
    pub waves: &'a [Vec<String>],
    /// Effective service descriptors.
    pub services: &'a BTreeMap<String, ServiceDescriptor>,
    /// Validation warnings.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl<'a> PlanDocument<'a> {
    /// Builds the document for `stack`.
    #[must_use]
    pub fn new(stack: &'a ResolvedStack) -> Self {
        Self {
            name: stack.stack.project_name.as_deref(),
            files: stack
                .files
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
            order: &stack.order,
            waves: &stack.waves,
            services: &stack.stack.services,
            warnings: stack.warnings.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Formats a byte count into a human-readable string (e.g., "128.0 MiB").
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Status marker for a service state.
#[must_use]
pub const fn state_marker(state: ServiceState) -> &'static str {
    match state {
        ServiceState::Healthy | ServiceState::Running => "●",
        ServiceState::Starting | ServiceState::Pending | ServiceState::WaitingForDeps => "◌",
        ServiceState::Unhealthy => "✗",
        ServiceState::Stopping | ServiceState::Stopped => "○",
    }
}

fn describe_service(out: &mut String, svc: &ServiceDescriptor, stack: &ResolvedStack) {
    let _ = writeln!(out, "  + {}", svc.name);
    if let Some(image) = &svc.image {
        let _ = writeln!(out, "      image: {image}");
    }
    if let Some(build) = &svc.build {
        let _ = writeln!(out, "      build: {}", build.context);
    }
    if let Some(entrypoint) = &svc.entrypoint {
        let _ = writeln!(out, "      entrypoint: {entrypoint}");
    }
    if let Some(command) = &svc.command {
        let _ = writeln!(out, "      command: {command}");
    }
    if !svc.ports.is_empty() {
        let ports: Vec<String> = svc.ports.iter().map(ToString::to_string).collect();
        let _ = writeln!(out, "      ports: {}", ports.join(", "));
    }
    if !svc.volumes.is_empty() {
        let volumes: Vec<String> = svc.volumes.iter().map(ToString::to_string).collect();
        let _ = writeln!(out, "      volumes: {}", volumes.join(", "));
    }
    let deps = stack.graph.dependencies(&svc.name);
    if !deps.is_empty() {
        let deps: Vec<String> = deps
            .iter()
            .map(|(name, cond)| format!("{name} ({cond})"))
            .collect();
        let _ = writeln!(out, "      depends on: {}", deps.join(", "));
    }
    if let Some(hc) = &svc.healthcheck {
        let _ = writeln!(
            out,
            "      healthcheck: {} (every {}, timeout {}, {} retries, start period {})",
            hc.test,
            format_duration(hc.interval),
            format_duration(hc.timeout),
            hc.retries,
            format_duration(hc.start_period)
        );
    }
    let _ = writeln!(out, "      restart: {}", svc.restart);
    if let Some(memory) = svc.resources.memory_bytes {
        let _ = writeln!(out, "      memory: {}", format_bytes(memory));
    }
    if let Some(cpus) = svc.resources.cpus {
        let _ = writeln!(out, "      cpus: {cpus}");
    }
}

/// Renders the plan as human-readable text.
#[must_use]
pub fn render_plan_text(stack: &ResolvedStack) -> String {
    let doc = PlanDocument::new(stack);
    let mut out = String::new();
    let title = doc.name.map_or_else(
        || format!("Startup plan for: {}", doc.files.join(" + ")),
        |name| format!("Startup plan for {name}: {}", doc.files.join(" + ")),
    );
    let _ = writeln!(out, "{title}");
    let _ = writeln!(out, "{}", "═".repeat(title.chars().count()));
    let _ = writeln!(out);

    for (i, wave) in doc.waves.iter().enumerate() {
        let _ = writeln!(out, "  Wave {}: {}", i + 1, wave.join(", "));
    }
    let _ = writeln!(out);

    for name in doc.order {
        if let Some(svc) = doc.services.get(name) {
            describe_service(&mut out, svc, stack);
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "  {} service(s) in {} wave(s).",
        doc.order.len(),
        doc.waves.len()
    );
    if !doc.warnings.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "  Warnings:");
        for warning in &doc.warnings {
            let _ = writeln!(out, "    {warning}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackseq_compose::loader::{LayerOrigin, parse_layer};
    use stackseq_compose::{EnvMapping, resolve_layers};

    fn stack() -> ResolvedStack {
        let yaml = "\
services:
  db:
    image: postgres:16
    mem_limit: 512m
    healthcheck:
      test: [\"CMD\", \"pg_isready\"]
      interval: 5s
  api:
    image: app:1.0
    ports: [\"8000:8000\"]
    depends_on:
      db:
        condition: service_healthy
";
        let layer = parse_layer(yaml, LayerOrigin::new("compose.yaml", 0)).expect("parse");
        resolve_layers(&[layer], &EnvMapping::new()).expect("resolve")
    }

    #[test]
    fn format_bytes_displays_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(134_217_728), "128.0 MiB");
        assert_eq!(format_bytes(2_147_483_648), "2.0 GiB");
    }

    #[test]
    fn text_plan_lists_waves_and_services() {
        let text = render_plan_text(&stack());
        assert!(text.contains("Wave 1: db"), "{text}");
        assert!(text.contains("Wave 2: api"), "{text}");
        assert!(text.contains("depends on: db (healthy)"), "{text}");
        assert!(text.contains("memory: 512.0 MiB"), "{text}");
        assert!(text.contains("2 service(s) in 2 wave(s)."), "{text}");
        assert!(text.find("+ db").unwrap() < text.find("+ api").unwrap());
    }

    #[test]
    fn json_plan_carries_order_and_services() {
        let stack = stack();
        let json = serde_json::to_value(PlanDocument::new(&stack)).expect("serialize");
        assert_eq!(json["order"], serde_json::json!(["db", "api"]));
        assert_eq!(json["services"]["api"]["image"], "app:1.0");
        assert!(json.get("warnings").is_none());
    }

    #[test]
    fn markers_distinguish_states() {
        assert_eq!(state_marker(ServiceState::Running), "●");
        assert_ne!(
            state_marker(ServiceState::Unhealthy),
            state_marker(ServiceState::Stopped)
        );
    }
}
