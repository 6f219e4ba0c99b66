//! Published port mappings.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::merge::scalar_text;

/// Transport protocol of a port mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP (the default).
    #[default]
    Tcp,
    /// UDP.
    Udp,
}

/// A port exposed by a service, optionally published on the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    /// Host interface to bind, if restricted.
    pub host_ip: Option<String>,
    /// Host port; `None` lets the runtime pick one.
    pub published: Option<u16>,
    /// Port inside the service.
    pub target: u16,
    /// Transport protocol.
    pub protocol: Protocol,
}

impl PortMapping {
    /// Parses a port entry in short (`"8000"`, `"8080:80/udp"`,
    /// `"127.0.0.1:5432:5432"`) or long (mapping) form.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the entry is malformed.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::Mapping(map) => {
                let target = map
                    .get("target")
                    .and_then(scalar_text)
                    .ok_or_else(|| "long-form port requires `target`".to_owned())?;
                let published = map
                    .get("published")
                    .and_then(scalar_text)
                    .filter(|p| !p.is_empty())
                    .map(|p| parse_port(&p))
                    .transpose()?;
                let protocol = map
                    .get("protocol")
                    .and_then(Value::as_str)
                    .map_or(Ok(Protocol::Tcp), parse_protocol)?;
                Ok(Self {
                    host_ip: map.get("host_ip").and_then(Value::as_str).map(str::to_owned),
                    published,
                    target: parse_port(&target)?,
                    protocol,
                })
            }
            other => {
                let spec = scalar_text(other)
                    .ok_or_else(|| "port entry must be a string, number, or mapping".to_owned())?;
                Self::parse(&spec)
            }
        }
    }

    /// Parses the short string form.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the entry is malformed.
    pub fn parse(spec: &str) -> Result<Self, String> {
        let (addr, protocol) = match spec.rsplit_once('/') {
            Some((addr, proto)) => (addr, parse_protocol(proto)?),
            None => (spec, Protocol::Tcp),
        };

        let (host_ip, rest) = if let Some(bracketed) = addr.strip_prefix('[') {
            let (ip, rest) = bracketed
                .split_once("]:")
                .ok_or_else(|| format!("invalid IPv6 port mapping \"{spec}\""))?;
            (Some(ip.to_owned()), rest)
        } else {
            (None, addr)
        };

        let parts: Vec<&str> = rest.split(':').collect();
        let (host_ip, published, target) = match parts.as_slice() {
            [target] => (host_ip, None, *target),
            [published, target] => (host_ip, Some(*published), *target),
            [ip, published, target] if host_ip.is_none() => {
                (Some((*ip).to_owned()), Some(*published), *target)
            }
            _ => return Err(format!("invalid port mapping \"{spec}\"")),
        };

        Ok(Self {
            host_ip,
            published: published
                .filter(|p| !p.is_empty())
                .map(parse_port)
                .transpose()?,
            target: parse_port(target)?,
            protocol,
        })
    }

    /// Key identifying the host-side binding, if the port is published.
    #[must_use]
    pub fn host_binding(&self) -> Option<(Option<&str>, u16, Protocol)> {
        self.published
            .map(|p| (self.host_ip.as_deref(), p, self.protocol))
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ip) = &self.host_ip {
            if ip.contains(':') {
                write!(f, "[{ip}]:")?;
            } else {
                write!(f, "{ip}:")?;
            }
        }
        match self.published {
            Some(p) => write!(f, "{p}:{}", self.target)?,
            None if self.host_ip.is_some() => write!(f, ":{}", self.target)?,
            None => write!(f, "{}", self.target)?,
        }
        if self.protocol == Protocol::Udp {
            write!(f, "/udp")?;
        }
        Ok(())
    }
}

fn parse_port(text: &str) -> Result<u16, String> {
    if text.contains('-') {
        return Err(format!("port ranges are not supported: \"{text}\""));
    }
    match text.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(format!("invalid port number \"{text}\"")),
        Ok(port) => Ok(port),
    }
}

fn parse_protocol(text: &str) -> Result<Protocol, String> {
    match text {
        "tcp" => Ok(Protocol::Tcp),
        "udp" => Ok(Protocol::Udp),
        other => Err(format!("unsupported protocol \"{other}\"")),
    }
}
