// ABOUTME: Observed container model and log stream types returned by runtime adapters
// ABOUTME: Observed records are built by adapters only and reflect what the engine reported

use crate::error::RuntimeError;
use chrono::{DateTime, Utc};
use dockformer_manifest::PortMapping;
use futures::Stream;
use serde::Serialize;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Buffer between an adapter's log pump and the reader. The pump waits when
/// it is full, so a slow reader slows the engine stream instead of growing memory.
pub const LOG_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Stopped,
    Removing,
    Removed,
    Error,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Removing => "removing",
            Self::Removed => "removed",
            Self::Error => "error",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A container as reported by the runtime.
///
/// Only runtime adapters construct these; everything above the adapter
/// treats them as read-only snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservedContainer {
    id: String,
    name: String,
    image: String,
    state: ContainerState,
    ports: Vec<PortMapping>,
    created_at: DateTime<Utc>,
    fingerprint: Option<String>,
}

impl ObservedContainer {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        image: impl Into<String>,
        state: ContainerState,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            image: image.into(),
            state,
            ports: Vec::new(),
            created_at,
            fingerprint: None,
        }
    }

    pub fn with_ports(mut self, ports: Vec<PortMapping>) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: Option<String>) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    pub fn ports(&self) -> &[PortMapping] {
        &self.ports
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Fingerprint label written at creation; `None` for containers created
    /// by an older build or by hand
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    pub fn ports_display(&self) -> String {
        self.ports
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogOptions {
    pub follow: bool,
    /// Number of trailing lines to return; `None` returns everything retained
    pub tail: Option<usize>,
}

impl LogOptions {
    pub fn snapshot(tail: Option<usize>) -> Self {
        Self {
            follow: false,
            tail,
        }
    }

    pub fn follow(tail: Option<usize>) -> Self {
        Self { follow: true, tail }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogChunk {
    pub timestamp: DateTime<Utc>,
    pub stream: StreamType,
    pub data: Vec<u8>,
}

impl LogChunk {
    pub fn stdout(data: impl Into<Vec<u8>>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream: StreamType::Stdout,
            data: data.into(),
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Log output from a container.
///
/// Dropping the stream closes the channel, which makes the adapter's pump
/// task exit and release the engine connection.
pub struct OutputStream {
    receiver: mpsc::Receiver<Result<LogChunk, RuntimeError>>,
}

impl OutputStream {
    pub fn new(receiver: mpsc::Receiver<Result<LogChunk, RuntimeError>>) -> Self {
        Self { receiver }
    }

    pub async fn next_chunk(&mut self) -> Option<Result<LogChunk, RuntimeError>> {
        self.receiver.recv().await
    }
}

impl Stream for OutputStream {
    type Item = Result<LogChunk, RuntimeError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputStream").finish_non_exhaustive()
    }
}
