//! Layer merge engine.
//!
//! Folds [`Layer`]s left to right into a [`MergedStack`]. Merging works on
//! raw YAML values so that shape conflicts between layers can be reported
//! with provenance before any typed decoding happens.
//!
//! Rules, applied recursively per field:
//! - scalar over scalar: the later non-null value wins;
//! - map over map: key-wise union, later value wins per key;
//! - list over list: append (see [`ListPolicy`]), except argv-style
//!   fields which are replaced;
//! - `null` never erases an earlier value;
//! - a value tagged `!override` replaces the accumulated value, and a
//!   value tagged `!reset` removes it;
//! - any other shape combination is a [`StackError::MergeConflict`].

use std::collections::BTreeMap;

use serde_yaml::{Mapping, Sequence, Value};
use stackseq_common::error::{Result, StackError};

use crate::loader::{Layer, LayerOrigin, shape_of};

/// Fields whose list value is an argument vector, replaced wholesale.
const REPLACED_LISTS: [&str; 3] = ["command", "entrypoint", "healthcheck.test"];

/// Result of folding all layers.
#[derive(Debug, Clone, Default)]
pub struct MergedStack {
    /// Project name; the last layer declaring one wins.
    pub project_name: Option<String>,
    /// Merged services keyed by name.
    pub services: BTreeMap<String, MergedService>,
}

/// One service after merging, with per-field provenance.
#[derive(Debug, Clone, Default)]
pub struct MergedService {
    /// Merged raw service body.
    pub body: Mapping,
    /// Layers that contributed each top-level field, oldest first.
    pub provenance: BTreeMap<String, Vec<LayerOrigin>>,
    /// Layers that mention this service at all.
    pub declared_in: Vec<LayerOrigin>,
}

impl MergedService {
    /// Describes the layers that contributed `field`.
    ///
    /// Falls back to the layers declaring the service when the field was
    /// never set explicitly.
    #[must_use]
    pub fn origin_of(&self, field: &str) -> String {
        let origins = self
            .provenance
            .get(field)
            .filter(|o| !o.is_empty())
            .unwrap_or(&self.declared_in);
        if origins.is_empty() {
            return "<unknown>".into();
        }
        origins
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn merge_field(
        &mut self,
        field: &str,
        incoming: Value,
        service: &str,
        origin: &LayerOrigin,
    ) -> Result<()> {
        let earlier = self.origin_of(field);
        let ctx = MergeCtx {
            service,
            origin,
            earlier: &earlier,
        };
        let outcome = merge_entry(
            &mut self.body,
            Value::String(field.to_owned()),
            incoming,
            field,
            &ctx,
        )?;
        match outcome {
            Outcome::Unchanged => {}
            Outcome::Merged => self
                .provenance
                .entry(field.to_owned())
                .or_default()
                .push(origin.clone()),
            Outcome::Replaced => {
                let _ = self
                    .provenance
                    .insert(field.to_owned(), vec![origin.clone()]);
            }
        }
        Ok(())
    }
}

/// How list values from successive layers are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListPolicy {
    /// Append entries not already present.
    AppendUnique,
    /// Append, replacing in place any entry with the same mount target.
    AppendByTarget,
    /// The later list replaces the earlier one.
    Replace,
}

/// Returns the list policy applied at a dotted field path.
#[must_use]
pub fn list_policy(path: &str) -> ListPolicy {
    if REPLACED_LISTS.contains(&path) {
        ListPolicy::Replace
    } else if path == "volumes" {
        ListPolicy::AppendByTarget
    } else {
        ListPolicy::AppendUnique
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Directive {
    Merge,
    Override,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Unchanged,
    Merged,
    Replaced,
}

struct MergeCtx<'a> {
    service: &'a str,
    origin: &'a LayerOrigin,
    earlier: &'a str,
}

impl MergeCtx<'_> {
    fn parse_error(&self, message: String) -> StackError {
        StackError::service_parse(self.origin.to_string(), self.service, message)
    }
}

/// Folds `layers` in order into a single merged stack.
///
/// # Errors
///
/// Returns [`StackError::MergeConflict`] when two layers disagree on the
/// shape of a field, and [`StackError::Parse`] for values that cannot be
/// normalised or carry an unsupported tag.
pub fn merge_layers(layers: &[Layer]) -> Result<MergedStack> {
    let mut stack = MergedStack::default();

    for layer in layers {
        tracing::debug!(origin = %layer.origin, "merging layer");
        if let Some(name) = &layer.project_name {
            stack.project_name = Some(name.clone());
        }

        for (name, patch) in &layer.services {
            let patch = normalize_service(patch.clone(), &layer.origin, name)?;
            let service = stack.services.entry(name.clone()).or_default();
            service.declared_in.push(layer.origin.clone());

            for (key, value) in patch {
                let Value::String(field) = key else {
                    return Err(StackError::service_parse(
                        layer.origin.to_string(),
                        name,
                        "field names must be strings",
                    ));
                };
                service.merge_field(&field, value, name, &layer.origin)?;
            }
        }
    }

    tracing::info!(
        layers = layers.len(),
        services = stack.services.len(),
        "layers merged"
    );
    Ok(stack)
}

fn merge_entry(
    target: &mut Mapping,
    key: Value,
    incoming: Value,
    path: &str,
    ctx: &MergeCtx<'_>,
) -> Result<Outcome> {
    let (directive, incoming) = split_directive(incoming, path, ctx)?;
    match directive {
        Directive::Reset => {
            let _ = target.remove(&key);
            return Ok(Outcome::Replaced);
        }
        Directive::Override => {
            let value = merge_values(Value::Null, incoming, path, ctx)?;
            if value.is_null() {
                let _ = target.remove(&key);
            } else {
                let _ = target.insert(key, value);
            }
            return Ok(Outcome::Replaced);
        }
        Directive::Merge => {}
    }

    if incoming.is_null() {
        if target.contains_key(&key) {
            return Ok(Outcome::Unchanged);
        }
        let _ = target.insert(key, Value::Null);
        return Ok(Outcome::Merged);
    }
    let existing = target.remove(&key).unwrap_or(Value::Null);
    let merged = merge_values(existing, incoming, path, ctx)?;
    let _ = target.insert(key, merged);
    Ok(Outcome::Merged)
}

fn merge_values(existing: Value, incoming: Value, path: &str, ctx: &MergeCtx<'_>) -> Result<Value> {
    match (existing, incoming) {
        (existing, Value::Null) => Ok(existing),
        (Value::Null, Value::Mapping(incoming)) => {
            let mut out = Mapping::new();
            merge_mapping(&mut out, incoming, path, ctx)?;
            Ok(Value::Mapping(out))
        }
        (Value::Null, Value::Sequence(incoming)) => {
            let items = untagged_items(incoming, path, ctx)?;
            Ok(Value::Sequence(merge_sequences(Vec::new(), items, path)))
        }
        (_, Value::Tagged(tagged)) => Err(ctx.parse_error(format!(
            "unsupported tag {} at `{path}`",
            tagged.tag
        ))),
        (Value::Null, scalar) => Ok(scalar),
        (Value::Mapping(mut acc), Value::Mapping(incoming)) => {
            merge_mapping(&mut acc, incoming, path, ctx)?;
            Ok(Value::Mapping(acc))
        }
        (Value::Sequence(acc), Value::Sequence(incoming)) => {
            let items = untagged_items(incoming, path, ctx)?;
            Ok(Value::Sequence(merge_sequences(acc, items, path)))
        }
        (earlier, later) if is_scalar(&earlier) && is_scalar(&later) => Ok(later),
        (earlier, later) => Err(StackError::MergeConflict {
            service: ctx.service.to_owned(),
            field: path.to_owned(),
            earlier: ctx.earlier.to_owned(),
            earlier_shape: shape_of(&earlier),
            later: ctx.origin.to_string(),
            later_shape: shape_of(&later),
        }),
    }
}

fn merge_mapping(
    acc: &mut Mapping,
    incoming: Mapping,
    path: &str,
    ctx: &MergeCtx<'_>,
) -> Result<()> {
    for (key, value) in incoming {
        let child = format!("{path}.{}", scalar_text(&key).unwrap_or_default());
        let _ = merge_entry(acc, key, value, &child, ctx)?;
    }
    Ok(())
}

fn merge_sequences(mut acc: Sequence, incoming: Sequence, path: &str) -> Sequence {
    match list_policy(path) {
        ListPolicy::Replace => incoming,
        ListPolicy::AppendUnique => {
            for item in incoming {
                if !acc.iter().any(|existing| same_entry(existing, &item)) {
                    acc.push(item);
                }
            }
            acc
        }
        ListPolicy::AppendByTarget => {
            for item in incoming {
                let target = volume_target(&item);
                let slot = target.as_deref().and_then(|t| {
                    acc.iter()
                        .position(|existing| volume_target(existing).as_deref() == Some(t))
                });
                match slot {
                    Some(idx) => acc[idx] = item,
                    None => acc.push(item),
                }
            }
            acc
        }
    }
}

fn split_directive(value: Value, path: &str, ctx: &MergeCtx<'_>) -> Result<(Directive, Value)> {
    let Value::Tagged(tagged) = value else {
        return Ok((Directive::Merge, value));
    };
    let tag = tagged.tag.to_string();
    match tag.trim_start_matches('!') {
        "override" => Ok((Directive::Override, tagged.value)),
        "reset" => Ok((Directive::Reset, Value::Null)),
        _ => Err(ctx.parse_error(format!("unsupported tag {tag} at `{path}`"))),
    }
}

fn untagged_items(items: Sequence, path: &str, ctx: &MergeCtx<'_>) -> Result<Sequence> {
    if items.iter().any(|item| matches!(item, Value::Tagged(_))) {
        return Err(ctx.parse_error(format!(
            "tags are not allowed on list entries at `{path}`"
        )));
    }
    Ok(items)
}

const fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::Bool(_) | Value::Number(_) | Value::String(_))
}

/// Text of a scalar value; numbers and booleans are rendered.
#[must_use]
pub fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn same_entry(a: &Value, b: &Value) -> bool {
    match (scalar_text(a), scalar_text(b)) {
        (Some(a), Some(b)) => a == b,
        _ => a == b,
    }
}

/// Container-side target of a volume entry, used as its merge key.
fn volume_target(entry: &Value) -> Option<String> {
    match entry {
        Value::String(spec) => {
            let mut parts = spec.split(':');
            let first = parts.next()?;
            Some(parts.next().unwrap_or(first).to_owned())
        }
        Value::Mapping(map) => map.get("target").and_then(scalar_text),
        _ => None,
    }
}

/// Rewrites alternate syntaxes of one service patch into canonical form.
///
/// - `environment` / `labels` lists of `KEY=VALUE` become maps;
/// - `depends_on` lists become `{name: {condition: service_started}}`;
/// - a string `build` becomes `{context: ...}`.
fn normalize_service(patch: Mapping, origin: &LayerOrigin, service: &str) -> Result<Mapping> {
    let mut out = Mapping::with_capacity(patch.len());
    for (key, value) in patch {
        let field = scalar_text(&key).unwrap_or_default();
        let normalized = map_tagged(value, |inner| match field.as_str() {
            "environment" | "labels" => normalize_key_values(inner, &field, origin, service),
            "depends_on" => normalize_depends_on(inner, origin, service),
            "build" => Ok(normalize_build(inner)),
            _ => Ok(inner),
        })?;
        let _ = out.insert(key, normalized);
    }
    Ok(out)
}

fn map_tagged(value: Value, f: impl FnOnce(Value) -> Result<Value>) -> Result<Value> {
    match value {
        Value::Tagged(mut tagged) => {
            let inner = std::mem::take(&mut tagged.value);
            tagged.value = f(inner)?;
            Ok(Value::Tagged(tagged))
        }
        other => f(other),
    }
}

fn normalize_key_values(
    value: Value,
    field: &str,
    origin: &LayerOrigin,
    service: &str,
) -> Result<Value> {
    let Value::Sequence(items) = value else {
        return Ok(value);
    };
    let mut map = Mapping::with_capacity(items.len());
    for item in items {
        let Value::String(entry) = item else {
            return Err(StackError::service_parse(
                origin.to_string(),
                service,
                format!("`{field}` list entries must be KEY=VALUE strings"),
            ));
        };
        match entry.split_once('=') {
            Some((key, val)) => {
                let _ = map.insert(Value::String(key.to_owned()), Value::String(val.to_owned()));
            }
            None => {
                let _ = map.insert(Value::String(entry), Value::Null);
            }
        }
    }
    Ok(Value::Mapping(map))
}

fn normalize_depends_on(value: Value, origin: &LayerOrigin, service: &str) -> Result<Value> {
    let started = || {
        let mut cond = Mapping::new();
        let _ = cond.insert(
            Value::String("condition".into()),
            Value::String("service_started".into()),
        );
        Value::Mapping(cond)
    };
    match value {
        Value::Sequence(items) => {
            let mut map = Mapping::with_capacity(items.len());
            for item in items {
                let Value::String(name) = item else {
                    return Err(StackError::service_parse(
                        origin.to_string(),
                        service,
                        "`depends_on` list entries must be service names",
                    ));
                };
                let _ = map.insert(Value::String(name), started());
            }
            Ok(Value::Mapping(map))
        }
        Value::Mapping(entries) => {
            let mut map = Mapping::with_capacity(entries.len());
            for (name, spec) in entries {
                let spec = if spec.is_null() { started() } else { spec };
                let _ = map.insert(name, spec);
            }
            Ok(Value::Mapping(map))
        }
        other => Ok(other),
    }
}

fn normalize_build(value: Value) -> Value {
    match value {
        Value::String(context) => {
            let mut map = Mapping::new();
            let _ = map.insert(Value::String("context".into()), Value::String(context));
            Value::Mapping(map)
        }
        other => other,
    }
}
