// ABOUTME: Desired-state model: container specs, their port/env/volume parts and the manifest
// ABOUTME: Specs are immutable once a manifest generation has been accepted

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Monotonic version stamp shared by manifests and status cache entries
pub type Generation = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
}

impl PortMapping {
    pub fn tcp(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
            protocol: Protocol::Tcp,
        }
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.protocol {
            Protocol::Tcp => write!(f, "{}:{}", self.host_port, self.container_port),
            Protocol::Udp => write!(f, "{}:{}/udp", self.host_port, self.container_port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

impl VolumeMount {
    /// Bind string in `source:target:mode` form
    pub fn to_bind(&self) -> String {
        format!(
            "{}:{}:{}",
            self.source,
            self.target,
            if self.read_only { "ro" } else { "rw" }
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    No,
    Always,
    UnlessStopped,
    OnFailure { max_retries: Option<u32> },
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::No => write!(f, "no"),
            Self::Always => write!(f, "always"),
            Self::UnlessStopped => write!(f, "unless-stopped"),
            Self::OnFailure { max_retries: None } => write!(f, "on-failure"),
            Self::OnFailure {
                max_retries: Some(n),
            } => write!(f, "on-failure:{}", n),
        }
    }
}

/// Desired configuration of one container, keyed by name within a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub ports: Vec<PortMapping>,
    pub env: Vec<EnvVar>,
    pub restart_policy: RestartPolicy,
    pub volumes: Vec<VolumeMount>,
    pub command: Option<Vec<String>>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ports: Vec::new(),
            env: Vec::new(),
            restart_policy: RestartPolicy::default(),
            volumes: Vec::new(),
            command: None,
        }
    }

    /// Stable hash over everything that forces a replace when it changes:
    /// image, ports, env, volumes and command. Ordering of ports, env and
    /// volumes does not affect the result.
    pub fn fingerprint(&self) -> String {
        let mut ports: Vec<String> = self.ports.iter().map(|p| p.to_string()).collect();
        ports.sort();

        let mut env: Vec<String> = self
            .env
            .iter()
            .map(|e| format!("{}={}", e.name, e.value))
            .collect();
        env.sort();

        let mut volumes: Vec<String> = self.volumes.iter().map(|v| v.to_bind()).collect();
        volumes.sort();

        let command = self
            .command
            .as_ref()
            .map(|args| args.join("\u{1f}"))
            .unwrap_or_default();

        let mut hasher = Sha256::new();
        for part in [
            self.image.as_str(),
            &ports.join(","),
            &env.join("\u{1f}"),
            &volumes.join(","),
            &command,
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }

    /// Port mappings rendered the way the dashboard shows them
    pub fn ports_display(&self) -> String {
        self.ports
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// A validated, versioned set of container specs
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    generation: Generation,
    digest: String,
    source: String,
    containers: Vec<ContainerSpec>,
}

impl Manifest {
    pub(crate) fn new(source: String, containers: Vec<ContainerSpec>) -> Self {
        let digest = format!("{:x}", Sha256::digest(source.as_bytes()));
        Self {
            generation: 0,
            digest,
            source,
            containers,
        }
    }

    /// Stamp the generation assigned on acceptance
    pub fn with_generation(mut self, generation: Generation) -> Self {
        self.generation = generation;
        self
    }

    /// Zero until the manifest has been accepted
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// SHA-256 of the raw manifest bytes
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn containers(&self) -> &[ContainerSpec] {
        &self.containers
    }

    pub fn get(&self, name: &str) -> Option<&ContainerSpec> {
        self.containers.iter().find(|spec| spec.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.containers.iter().map(|spec| spec.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}
