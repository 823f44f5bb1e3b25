// ABOUTME: YAML manifest parser producing a validated Manifest or a ParseError
// ABOUTME: Accepts the compact string forms used by hand-written manifests as well as lists

use crate::error::{ParseError, Result, ValidationReason};
use crate::spec::{
    ContainerSpec, EnvVar, Manifest, PortMapping, Protocol, RestartPolicy, VolumeMount,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use tracing::debug;

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("container name pattern is valid"));

#[derive(Debug, Deserialize)]
struct RawManifest {
    containers: Option<Vec<RawContainer>>,
}

#[derive(Debug, Deserialize)]
struct RawContainer {
    name: Option<String>,
    image: Option<String>,
    ports: Option<RawPorts>,
    env: Option<RawEnv>,
    volumes: Option<Vec<String>>,
    command: Option<RawCommand>,
    restart: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPorts {
    Joined(String),
    List(Vec<RawPort>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPort {
    Number(u16),
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEnv {
    Map(serde_yaml::Mapping),
    List(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCommand {
    Line(String),
    Args(Vec<String>),
}

/// Decode and validate a manifest upload.
///
/// The result carries generation `0`; the reconciler stamps a real
/// generation when it accepts the manifest.
pub fn parse(bytes: &[u8]) -> Result<Manifest> {
    let source = std::str::from_utf8(bytes)
        .map_err(|e| ParseError::Syntax(format!("manifest is not valid UTF-8: {}", e)))?;

    let value: serde_yaml::Value =
        serde_yaml::from_str(source).map_err(|e| ParseError::Syntax(e.to_string()))?;

    if value.is_null() {
        return Err(ParseError::validation(
            "containers",
            ValidationReason::Missing,
        ));
    }

    let raw: RawManifest = serde_yaml::from_value(value).map_err(|e| {
        ParseError::validation("containers", ValidationReason::Invalid(e.to_string()))
    })?;

    let entries = raw
        .containers
        .ok_or_else(|| ParseError::validation("containers", ValidationReason::Missing))?;

    let mut seen = HashSet::new();
    let mut bound_ports: HashMap<(u16, Protocol), String> = HashMap::new();
    let mut containers = Vec::with_capacity(entries.len());

    for (index, entry) in entries.into_iter().enumerate() {
        let spec = validate_container(entry, index)?;

        if !seen.insert(spec.name.clone()) {
            return Err(ParseError::validation("name", ValidationReason::Duplicate)
                .in_container(spec.name));
        }

        for port in &spec.ports {
            if let Some(owner) = bound_ports.insert((port.host_port, port.protocol), spec.name.clone())
            {
                return Err(ParseError::validation(
                    "ports",
                    ValidationReason::Invalid(format!(
                        "host port {}/{} is already bound by container '{}'",
                        port.host_port, port.protocol, owner
                    )),
                )
                .in_container(spec.name));
            }
        }

        containers.push(spec);
    }

    debug!(containers = containers.len(), "Parsed manifest");
    Ok(Manifest::new(source.to_string(), containers))
}

fn validate_container(raw: RawContainer, index: usize) -> Result<ContainerSpec> {
    let entry_label = format!("#{}", index + 1);

    let name = match raw.name {
        None => {
            return Err(
                ParseError::validation("name", ValidationReason::Missing).in_container(entry_label)
            )
        }
        Some(name) if name.trim().is_empty() => {
            return Err(
                ParseError::validation("name", ValidationReason::Empty).in_container(entry_label)
            )
        }
        Some(name) => name,
    };

    if !NAME_RE.is_match(&name) {
        return Err(ParseError::validation(
            "name",
            ValidationReason::Invalid(format!(
                "'{}' must only contain letters, digits, '_' and '-'",
                name
            )),
        )
        .in_container(entry_label));
    }

    let image = match raw.image {
        None => {
            return Err(ParseError::validation("image", ValidationReason::Missing).in_container(name))
        }
        Some(image) if image.trim().is_empty() => {
            return Err(ParseError::validation("image", ValidationReason::Empty).in_container(name))
        }
        Some(image) if image.chars().any(char::is_whitespace) => {
            return Err(ParseError::validation(
                "image",
                ValidationReason::Invalid("image reference must not contain whitespace".to_string()),
            )
            .in_container(name))
        }
        Some(image) => image,
    };

    let ports = parse_ports(raw.ports).map_err(|e| e.in_container(name.as_str()))?;
    let env = parse_env(raw.env).map_err(|e| e.in_container(name.as_str()))?;
    let volumes = raw
        .volumes
        .unwrap_or_default()
        .iter()
        .map(|v| parse_volume(v))
        .collect::<Result<Vec<_>>>()
        .map_err(|e| e.in_container(name.as_str()))?;
    let command = parse_command(raw.command).map_err(|e| e.in_container(name.as_str()))?;
    let restart_policy = raw
        .restart
        .as_deref()
        .map(parse_restart_policy)
        .transpose()
        .map_err(|e| e.in_container(name.as_str()))?
        .unwrap_or_default();

    Ok(ContainerSpec {
        name,
        image,
        ports,
        env,
        restart_policy,
        volumes,
        command,
    })
}

fn invalid(field: &str, detail: String) -> ParseError {
    ParseError::validation(field, ValidationReason::Invalid(detail))
}

fn parse_ports(raw: Option<RawPorts>) -> Result<Vec<PortMapping>> {
    let items: Vec<RawPort> = match raw {
        None => return Ok(Vec::new()),
        Some(RawPorts::Joined(text)) => text
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| RawPort::Text(s.to_string()))
            .collect(),
        Some(RawPorts::List(items)) => items,
    };

    let mut ports = Vec::with_capacity(items.len());
    for item in items {
        let port = match item {
            RawPort::Number(0) => return Err(invalid("ports", "port 0 is not allowed".to_string())),
            RawPort::Number(n) => PortMapping::tcp(n, n),
            RawPort::Text(text) => parse_port(&text)?,
        };
        if ports.contains(&port) {
            return Err(invalid("ports", format!("port mapping '{}' is repeated", port)));
        }
        ports.push(port);
    }
    Ok(ports)
}

/// Parse `host:container[/protocol]`
fn parse_port(text: &str) -> Result<PortMapping> {
    let text = text.trim();
    let (mapping, protocol) = match text.split_once('/') {
        Some((mapping, proto)) => {
            let protocol = match proto.trim().to_lowercase().as_str() {
                "tcp" => Protocol::Tcp,
                "udp" => Protocol::Udp,
                other => {
                    return Err(invalid(
                        "ports",
                        format!("unsupported protocol '{}' in '{}'", other, text),
                    ))
                }
            };
            (mapping, protocol)
        }
        None => (text, Protocol::Tcp),
    };

    let (host, container) = mapping.split_once(':').ok_or_else(|| {
        invalid(
            "ports",
            format!("'{}' must use the host:container format", text),
        )
    })?;

    let host_port = parse_port_number(host, text)?;
    let container_port = parse_port_number(container, text)?;

    Ok(PortMapping {
        host_port,
        container_port,
        protocol,
    })
}

fn parse_port_number(value: &str, whole: &str) -> Result<u16> {
    match value.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(invalid(
            "ports",
            format!("'{}' is not a port number (1-65535) in '{}'", value.trim(), whole),
        )),
        Ok(port) => Ok(port),
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Null => Some(String::new()),
        _ => None,
    }
}

fn parse_env(raw: Option<RawEnv>) -> Result<Vec<EnvVar>> {
    let pairs: Vec<(String, String)> = match raw {
        None => return Ok(Vec::new()),
        Some(RawEnv::Map(map)) => {
            let mut pairs = Vec::with_capacity(map.len());
            for (key, value) in map.iter() {
                let name = scalar_to_string(key)
                    .ok_or_else(|| invalid("env", "variable names must be scalars".to_string()))?;
                let value = scalar_to_string(value).ok_or_else(|| {
                    invalid("env", format!("value of '{}' must be a scalar", name))
                })?;
                pairs.push((name, value));
            }
            pairs
        }
        Some(RawEnv::List(items)) => items
            .into_iter()
            .map(|item| match item.split_once('=') {
                Some((name, value)) => (name.to_string(), value.to_string()),
                None => (item, String::new()),
            })
            .collect(),
    };

    let mut seen = HashSet::new();
    let mut env = Vec::with_capacity(pairs.len());
    for (name, value) in pairs {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(ParseError::validation("env", ValidationReason::Empty));
        }
        if name.contains('=') || name.chars().any(char::is_whitespace) {
            return Err(invalid("env", format!("'{}' is not a valid variable name", name)));
        }
        if !seen.insert(name.clone()) {
            return Err(invalid("env", format!("variable '{}' is set twice", name)));
        }
        env.push(EnvVar { name, value });
    }
    Ok(env)
}

/// Parse `source:target[:ro|rw]`
fn parse_volume(text: &str) -> Result<VolumeMount> {
    let parts: Vec<&str> = text.trim().split(':').collect();
    let (source, target, read_only) = match parts.as_slice() {
        [source, target] => (*source, *target, false),
        [source, target, "ro"] => (*source, *target, true),
        [source, target, "rw"] => (*source, *target, false),
        [_, _, mode] => {
            return Err(invalid(
                "volumes",
                format!("unknown mode '{}' in '{}' (expected ro or rw)", mode, text),
            ))
        }
        _ => {
            return Err(invalid(
                "volumes",
                format!("'{}' must use the source:target[:mode] format", text),
            ))
        }
    };

    if source.is_empty() {
        return Err(invalid("volumes", format!("missing source in '{}'", text)));
    }
    if !target.starts_with('/') {
        return Err(invalid(
            "volumes",
            format!("target '{}' must be an absolute path", target),
        ));
    }

    Ok(VolumeMount {
        source: source.to_string(),
        target: target.to_string(),
        read_only,
    })
}

fn parse_command(raw: Option<RawCommand>) -> Result<Option<Vec<String>>> {
    let args = match raw {
        None => return Ok(None),
        Some(RawCommand::Line(line)) => shlex::split(&line).ok_or_else(|| {
            invalid(
                "command",
                format!("'{}' has an unterminated quote or escape", line),
            )
        })?,
        Some(RawCommand::Args(args)) => args,
    };

    if args.is_empty() {
        return Err(ParseError::validation("command", ValidationReason::Empty));
    }
    Ok(Some(args))
}

fn parse_restart_policy(text: &str) -> Result<RestartPolicy> {
    let text = text.trim();
    match text {
        "" | "no" => Ok(RestartPolicy::No),
        "always" => Ok(RestartPolicy::Always),
        "unless-stopped" => Ok(RestartPolicy::UnlessStopped),
        "on-failure" => Ok(RestartPolicy::OnFailure { max_retries: None }),
        other => {
            let retries = other
                .strip_prefix("on-failure:")
                .and_then(|n| n.parse::<u32>().ok())
                .ok_or_else(|| {
                    invalid(
                        "restart",
                        format!(
                            "'{}' is not one of no, always, unless-stopped, on-failure[:N]",
                            other
                        ),
                    )
                })?;
            Ok(RestartPolicy::OnFailure {
                max_retries: Some(retries),
            })
        }
    }
}
