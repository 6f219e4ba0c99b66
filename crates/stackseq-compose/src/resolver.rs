//! Variable resolution.
//!
//! Builds the environment mapping from `.env`-style files and the process
//! environment, then substitutes interpolation markers in every string of
//! the merged stack.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};
use stackseq_common::error::{Result, StackError};

use crate::merge::{MergedService, MergedStack};
use crate::parser::env_file::parse_env_file;
use crate::parser::interpolate::{InterpolationError, interpolate};

/// Variables available for interpolation.
///
/// Later sources override earlier ones: env files in the order given,
/// then the process environment if inherited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvMapping {
    vars: BTreeMap<String, String>,
    sources: Vec<PathBuf>,
}

impl EnvMapping {
    /// Creates an empty mapping.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a mapping from env files (last wins) and, optionally, the
    /// process environment on top.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::NotFound`] for a missing file and
    /// [`StackError::Parse`] for a malformed line.
    pub fn load(files: &[PathBuf], inherit_process_env: bool) -> Result<Self> {
        let mut mapping = Self::new();
        for file in files {
            mapping.load_file(file)?;
        }
        if inherit_process_env {
            mapping.extend(std::env::vars());
        }
        tracing::debug!(
            files = files.len(),
            variables = mapping.len(),
            "environment mapping built"
        );
        Ok(mapping)
    }

    /// Reads one env file, overriding existing keys.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::NotFound`] for a missing file and
    /// [`StackError::Parse`] for a malformed line.
    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StackError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                StackError::Io {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;
        let entries = parse_env_file(&content, &path.display().to_string())?;
        tracing::debug!(path = %path.display(), entries = entries.len(), "env file loaded");
        self.extend(entries);
        self.sources.push(path.to_path_buf());
        Ok(())
    }

    /// Sets a single variable.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let _ = self.vars.insert(key.into(), value.into());
    }

    /// Looks up a variable.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Number of variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Returns `true` if no variables are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Env files read so far, in order.
    #[must_use]
    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }
}

impl<K: Into<String>, V: Into<String>> Extend<(K, V)> for EnvMapping {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (k, v) in iter {
            self.set(k, v);
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvMapping {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut mapping = Self::new();
        mapping.extend(iter);
        mapping
    }
}

struct Walk<'a> {
    service: &'a str,
    merged: &'a MergedService,
    env: &'a EnvMapping,
}

impl Walk<'_> {
    fn substitute(&self, text: &str, path: &str) -> Result<String> {
        interpolate(text, |name| self.env.get(name)).map_err(|e| match e {
            InterpolationError::Malformed(message) => StackError::service_parse(
                self.merged.origin_of(top_field(path)),
                self.service,
                format!("`{path}`: {message}"),
            ),
            InterpolationError::Missing { variable, message } => StackError::MissingVariable {
                variable,
                service: self.service.to_owned(),
                field: path.to_owned(),
                origin: self.merged.origin_of(top_field(path)),
                message,
            },
        })
    }

    fn value(&self, value: Value, path: &str) -> Result<Value> {
        match value {
            Value::String(text) => Ok(Value::String(self.substitute(&text, path)?)),
            Value::Sequence(items) => items
                .into_iter()
                .enumerate()
                .map(|(idx, item)| self.value(item, &format!("{path}[{idx}]")))
                .collect::<Result<Vec<_>>>()
                .map(Value::Sequence),
            Value::Mapping(map) => self.mapping(map, path).map(Value::Mapping),
            Value::Tagged(mut tagged) => {
                let inner = std::mem::take(&mut tagged.value);
                tagged.value = self.value(inner, path)?;
                Ok(Value::Tagged(tagged))
            }
            other => Ok(other),
        }
    }

    fn mapping(&self, map: Mapping, path: &str) -> Result<Mapping> {
        let mut out = Mapping::with_capacity(map.len());
        for (key, value) in map {
            let name = key.as_str().map(str::to_owned).unwrap_or_default();
            let child = if path.is_empty() {
                name.clone()
            } else {
                format!("{path}.{name}")
            };
            if value.is_null() && is_env_map(path) {
                // Bare `KEY` entries take their value from the mapping.
                if let Some(found) = self.env.get(&name) {
                    let _ = out.insert(key, Value::String(found.to_owned()));
                }
                continue;
            }
            let value = self.value(value, &child)?;
            let _ = out.insert(key, value);
        }
        Ok(out)
    }
}

fn is_env_map(path: &str) -> bool {
    path == "environment" || path == "build.args"
}

fn top_field(path: &str) -> &str {
    let end = path.find(['.', '[']).unwrap_or(path.len());
    &path[..end]
}

/// Substitutes every interpolation marker in `stack` using `env`.
///
/// Runs once over each string. Substituted text is never rescanned.
///
/// # Errors
///
/// Returns [`StackError::MissingVariable`] for an unset variable without
/// a default, naming the variable, field path, service, and contributing
/// layers; returns [`StackError::Parse`] for a malformed marker.
pub fn resolve_variables(stack: &mut MergedStack, env: &EnvMapping) -> Result<()> {
    for (name, service) in &mut stack.services {
        let body = std::mem::take(&mut service.body);
        let walk = Walk {
            service: name,
            merged: service,
            env,
        };
        let resolved = walk.mapping(body, "")?;
        service.body = resolved;
    }
    tracing::info!(
        services = stack.services.len(),
        variables = env.len(),
        "variables resolved"
    );
    Ok(())
}
