//! Descriptor loading.
//!
//! Reads layered descriptor files into raw [`Layer`]s. Loading only checks
//! the document skeleton (top-level mapping, `services` mapping, service
//! bodies); field-level interpretation happens after the merge.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};
use stackseq_common::constants::{DEFAULT_DESCRIPTOR_FILES, DEFAULT_OVERRIDE_FILES};
use stackseq_common::error::{Result, StackError};

/// Top-level keys accepted and ignored by the resolver.
const IGNORED_TOP_LEVEL: [&str; 5] = ["version", "volumes", "networks", "secrets", "configs"];

/// Where a layer came from and its precedence rank.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LayerOrigin {
    /// Source file path.
    pub path: PathBuf,
    /// Precedence rank: 0 for the base file, increasing for overrides.
    pub rank: usize,
}

impl LayerOrigin {
    /// Creates an origin for the given path and rank.
    pub fn new(path: impl Into<PathBuf>, rank: usize) -> Self {
        Self {
            path: path.into(),
            rank,
        }
    }
}

impl fmt::Display for LayerOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (layer {})", self.path.display(), self.rank)
    }
}

/// One descriptor file's contribution to the stack.
#[derive(Debug, Clone)]
pub struct Layer {
    /// File origin and precedence rank.
    pub origin: LayerOrigin,
    /// Top-level project `name`, if declared.
    pub project_name: Option<String>,
    /// Raw service patches keyed by service name.
    pub services: BTreeMap<String, Mapping>,
}

/// Loads every file in `paths`, preserving order as precedence.
///
/// # Errors
///
/// Returns [`StackError::NotFound`] for a missing file and
/// [`StackError::Parse`] for a malformed one.
pub fn load_layers(paths: &[PathBuf]) -> Result<Vec<Layer>> {
    paths
        .iter()
        .enumerate()
        .map(|(rank, path)| load_layer(path, rank))
        .collect()
}

/// Loads a single descriptor file as the layer at `rank`.
///
/// # Errors
///
/// Returns an error if the file is missing, unreadable, or malformed.
pub fn load_layer(path: &Path, rank: usize) -> Result<Layer> {
    tracing::debug!(path = %path.display(), rank, "loading descriptor layer");
    if !path.exists() {
        return Err(StackError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let content = std::fs::read_to_string(path).map_err(|e| StackError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse_layer(&content, LayerOrigin::new(path, rank))
}

/// Parses descriptor text into a layer.
///
/// # Errors
///
/// Returns [`StackError::Parse`] if the YAML is invalid or the document
/// skeleton is not a mapping of services.
pub fn parse_layer(content: &str, origin: LayerOrigin) -> Result<Layer> {
    let mut document: Value = serde_yaml::from_str(content)
        .map_err(|e| StackError::parse(origin.to_string(), e.to_string()))?;
    document
        .apply_merge()
        .map_err(|e| StackError::parse(origin.to_string(), e.to_string()))?;

    let mut layer = Layer {
        origin,
        project_name: None,
        services: BTreeMap::new(),
    };

    let root = match document {
        Value::Null => return Ok(layer),
        Value::Mapping(map) => map,
        other => {
            return Err(StackError::parse(
                layer.origin.to_string(),
                format!("document root must be a mapping, found {}", shape_of(&other)),
            ));
        }
    };

    for (key, value) in root {
        let key = string_key(&key, &layer.origin, None)?;
        match key.as_str() {
            "services" => layer.services = parse_services(value, &layer.origin)?,
            "name" => match value {
                Value::String(name) => layer.project_name = Some(name),
                Value::Null => {}
                other => {
                    return Err(StackError::parse(
                        layer.origin.to_string(),
                        format!("`name` must be a string, found {}", shape_of(&other)),
                    ));
                }
            },
            k if k.starts_with("x-") || IGNORED_TOP_LEVEL.contains(&k) => {
                tracing::debug!(key = k, origin = %layer.origin, "ignoring top-level key");
            }
            other => {
                return Err(StackError::parse(
                    layer.origin.to_string(),
                    format!("unknown top-level key `{other}`"),
                ));
            }
        }
    }

    tracing::debug!(
        origin = %layer.origin,
        services = layer.services.len(),
        "layer parsed"
    );
    Ok(layer)
}

fn parse_services(value: Value, origin: &LayerOrigin) -> Result<BTreeMap<String, Mapping>> {
    let map = match value {
        Value::Null => return Ok(BTreeMap::new()),
        Value::Mapping(map) => map,
        other => {
            return Err(StackError::parse(
                origin.to_string(),
                format!("`services` must be a mapping, found {}", shape_of(&other)),
            ));
        }
    };

    let mut services = BTreeMap::new();
    for (key, body) in map {
        let name = string_key(&key, origin, None)?;
        let body = match body {
            Value::Null => Mapping::new(),
            Value::Mapping(body) => body,
            other => {
                return Err(StackError::service_parse(
                    origin.to_string(),
                    name,
                    format!("service body must be a mapping, found {}", shape_of(&other)),
                ));
            }
        };
        for field in body.keys() {
            let _ = string_key(field, origin, Some(&name))?;
        }
        let _ = services.insert(name, body);
    }
    Ok(services)
}

fn string_key(key: &Value, origin: &LayerOrigin, service: Option<&str>) -> Result<String> {
    match key {
        Value::String(s) => Ok(s.clone()),
        other => {
            let message = format!("keys must be strings, found {}", shape_of(other));
            Err(match service {
                Some(service) => StackError::service_parse(origin.to_string(), service, message),
                None => StackError::parse(origin.to_string(), message),
            })
        }
    }
}

/// Finds the default descriptor files in `project_dir`.
///
/// Returns the first base file found, followed by the first override
/// file found if any.
///
/// # Errors
///
/// Returns [`StackError::NotFound`] if no base descriptor exists.
pub fn discover_files(project_dir: &Path) -> Result<Vec<PathBuf>> {
    let first_existing = |names: &[&str]| {
        names
            .iter()
            .map(|name| project_dir.join(name))
            .find(|path| path.is_file())
    };

    let Some(base) = first_existing(&DEFAULT_DESCRIPTOR_FILES) else {
        return Err(StackError::NotFound {
            path: project_dir.join(DEFAULT_DESCRIPTOR_FILES[0]),
        });
    };
    let mut files = vec![base];
    if let Some(override_file) = first_existing(&DEFAULT_OVERRIDE_FILES) {
        files.push(override_file);
    }
    tracing::info!(?files, "discovered descriptor files");
    Ok(files)
}

/// Human-readable structural shape of a YAML value.
#[must_use]
pub const fn shape_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) | Value::Number(_) | Value::String(_) => "scalar",
        Value::Sequence(_) => "list",
        Value::Mapping(_) => "map",
        Value::Tagged(_) => "tagged value",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> LayerOrigin {
        LayerOrigin::new("compose.yaml", 0)
    }

    #[test]
    fn parse_empty_document() {
        let layer = parse_layer("", origin()).expect("should parse");
        assert!(layer.services.is_empty());
        assert!(layer.project_name.is_none());
    }

    #[test]
    fn parse_services_and_name() {
        let input = r"
name: shop
version: '3.9'
services:
  web:
    image: app:1.0
  cache:
x-common:
  restart: always
";
        let layer = parse_layer(input, origin()).expect("should parse");
        assert_eq!(layer.project_name.as_deref(), Some("shop"));
        assert_eq!(layer.services.len(), 2);
        assert!(layer.services["cache"].is_empty());
        assert_eq!(
            layer.services["web"].get("image"),
            Some(&Value::String("app:1.0".into()))
        );
    }

    #[test]
    fn parse_applies_merge_keys() {
        let input = r"
x-base: &base
  restart: always
services:
  worker:
    <<: *base
    image: worker:1
";
        let layer = parse_layer(input, origin()).expect("should parse");
        let worker = &layer.services["worker"];
        assert_eq!(worker.get("restart"), Some(&Value::String("always".into())));
        assert!(worker.get("<<").is_none());
    }

    #[test]
    fn parse_rejects_non_mapping_root() {
        let err = parse_layer("- a\n- b\n", origin()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("document root must be a mapping"), "got: {msg}");
        assert!(msg.contains("compose.yaml (layer 0)"), "got: {msg}");
    }

    #[test]
    fn parse_rejects_list_services() {
        let err = parse_layer("services:\n  - web\n", origin()).unwrap_err();
        assert!(err.to_string().contains("`services` must be a mapping"));
    }

    #[test]
    fn parse_rejects_scalar_service_body() {
        let err = parse_layer("services:\n  web: nginx\n", origin()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("service \"web\""), "got: {msg}");
    }

    #[test]
    fn parse_rejects_unknown_top_level_key() {
        let err = parse_layer("servcies: {}\n", origin()).unwrap_err();
        assert!(err.to_string().contains("unknown top-level key `servcies`"));
    }

    #[test]
    fn parse_rejects_invalid_yaml() {
        let err = parse_layer("services: [unclosed\n", origin()).unwrap_err();
        assert!(matches!(err, StackError::Parse { .. }));
    }

    #[test]
    fn load_missing_file_is_not_found() {
        let err = load_layer(Path::new("/nonexistent/compose.yaml"), 0).unwrap_err();
        assert!(matches!(err, StackError::NotFound { .. }));
    }

    #[test]
    fn load_layers_preserves_order_and_rank() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path().join("base.yaml");
        let prod = dir.path().join("prod.yaml");
        std::fs::write(&base, "services:\n  web:\n    image: a\n").expect("write");
        std::fs::write(&prod, "services:\n  web:\n    image: b\n").expect("write");

        let layers = load_layers(&[prod.clone(), base.clone()]).expect("should load");
        assert_eq!(layers[0].origin.path, prod);
        assert_eq!(layers[0].origin.rank, 0);
        assert_eq!(layers[1].origin.path, base);
        assert_eq!(layers[1].origin.rank, 1);
    }

    #[test]
    fn discover_prefers_compose_yaml_and_adds_override() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("docker-compose.yml"), "").expect("write");
        std::fs::write(dir.path().join("compose.yaml"), "").expect("write");
        std::fs::write(dir.path().join("docker-compose.override.yml"), "").expect("write");

        let files = discover_files(dir.path()).expect("should discover");
        assert_eq!(
            files,
            vec![
                dir.path().join("compose.yaml"),
                dir.path().join("docker-compose.override.yml")
            ]
        );
    }

    #[test]
    fn discover_without_descriptor_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = discover_files(dir.path()).unwrap_err();
        assert!(matches!(err, StackError::NotFound { .. }));
    }
}
