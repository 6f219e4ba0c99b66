//! Volume and bind mounts.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

/// Kind of mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeKind {
    /// Host path bind mount.
    Bind,
    /// Named or anonymous volume.
    Volume,
    /// In-memory filesystem.
    Tmpfs,
}

/// A mount declared by a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Mount kind.
    pub kind: VolumeKind,
    /// Host path or volume name; `None` for anonymous volumes and tmpfs.
    pub source: Option<String>,
    /// Path inside the service.
    pub target: String,
    /// Whether the mount is read-only.
    pub read_only: bool,
}

impl VolumeMount {
    /// Parses a volume entry in short (`"src:dst[:mode]"`, `"dst"`) or
    /// long (mapping) form.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the entry is malformed.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::String(spec) => Self::parse(spec),
            Value::Mapping(map) => {
                let target = map
                    .get("target")
                    .and_then(Value::as_str)
                    .ok_or_else(|| "long-form volume requires `target`".to_owned())?;
                let source = map.get("source").and_then(Value::as_str).map(str::to_owned);
                let kind = match map.get("type").and_then(Value::as_str) {
                    Some("bind") => VolumeKind::Bind,
                    Some("volume") | None => VolumeKind::Volume,
                    Some("tmpfs") => VolumeKind::Tmpfs,
                    Some(other) => return Err(format!("unsupported volume type \"{other}\"")),
                };
                if kind == VolumeKind::Bind && source.is_none() {
                    return Err(format!("bind mount for \"{target}\" requires `source`"));
                }
                Ok(Self {
                    kind,
                    source,
                    target: target.to_owned(),
                    read_only: map
                        .get("read_only")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                })
            }
            _ => Err("volume entry must be a string or mapping".to_owned()),
        }
    }

    /// Parses the short string form.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the entry is malformed.
    pub fn parse(spec: &str) -> Result<Self, String> {
        let parts: Vec<&str> = spec.split(':').collect();
        let (source, target, mode) = match parts.as_slice() {
            [target] => (None, *target, None),
            [source, target] => (Some(*source), *target, None),
            [source, target, mode] => (Some(*source), *target, Some(*mode)),
            _ => return Err(format!("invalid volume \"{spec}\"")),
        };
        if target.is_empty() || !target.starts_with('/') {
            return Err(format!(
                "volume target must be an absolute path in \"{spec}\""
            ));
        }
        let read_only = match mode {
            None => false,
            Some(mode) => {
                let opts: Vec<&str> = mode.split(',').collect();
                if let Some(bad) = opts
                    .iter()
                    .find(|o| !matches!(**o, "ro" | "rw" | "z" | "Z" | "cached" | "delegated" | "consistent"))
                {
                    return Err(format!("unsupported volume mode \"{bad}\" in \"{spec}\""));
                }
                opts.contains(&"ro")
            }
        };
        let kind = match source {
            Some(s) if is_host_path(s) => VolumeKind::Bind,
            _ => VolumeKind::Volume,
        };
        Ok(Self {
            kind,
            source: source.map(str::to_owned),
            target: target.to_owned(),
            read_only,
        })
    }
}

fn is_host_path(source: &str) -> bool {
    source.starts_with('/') || source.starts_with('.') || source.starts_with('~')
}

impl fmt::Display for VolumeMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind == VolumeKind::Tmpfs {
            write!(f, "tmpfs:{}", self.target)?;
        } else if let Some(source) = &self.source {
            write!(f, "{source}:{}", self.target)?;
        } else {
            write!(f, "{}", self.target)?;
        }
        if self.read_only {
            write!(f, ":ro")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_form_kinds() {
        let bind = VolumeMount::parse("./src:/app/src:ro").unwrap();
        assert_eq!(bind.kind, VolumeKind::Bind);
        assert!(bind.read_only);
        assert_eq!(bind.to_string(), "./src:/app/src:ro");

        let named = VolumeMount::parse("pgdata:/var/lib/postgresql/data").unwrap();
        assert_eq!(named.kind, VolumeKind::Volume);
        assert_eq!(named.source.as_deref(), Some("pgdata"));

        let anonymous = VolumeMount::parse("/cache").unwrap();
        assert!(anonymous.source.is_none());
        assert_eq!(anonymous.to_string(), "/cache");
    }

    #[test]
    fn long_form() {
        let value: Value =
            serde_yaml::from_str("{type: bind, source: /etc/nginx, target: /etc/nginx, read_only: true}")
                .unwrap();
        let mount = VolumeMount::from_value(&value).unwrap();
        assert_eq!(mount.kind, VolumeKind::Bind);
        assert!(mount.read_only);

        let tmpfs: Value = serde_yaml::from_str("{type: tmpfs, target: /run}").unwrap();
        assert_eq!(
            VolumeMount::from_value(&tmpfs).unwrap().to_string(),
            "tmpfs:/run"
        );
    }

    #[test]
    fn rejects_invalid_entries() {
        assert!(VolumeMount::parse("data:relative").is_err());
        assert!(VolumeMount::parse("a:/b:rx").is_err());
        assert!(VolumeMount::parse("a:/b:ro:extra").is_err());
        let bind_without_source: Value = serde_yaml::from_str("{type: bind, target: /x}").unwrap();
        assert!(VolumeMount::from_value(&bind_without_source).is_err());
    }
}
