// ABOUTME: Runtime adapter trait and implementations for container backends
// ABOUTME: The only layer that speaks to a container engine; no retries happen here

use async_trait::async_trait;
use dockformer_manifest::ContainerSpec;

pub mod container;
pub mod docker;
pub mod error;
pub mod memory;

pub use container::{
    ContainerState, LogChunk, LogOptions, ObservedContainer, OutputStream, StreamType,
};
pub use docker::{DockerRuntime, DockerRuntimeConfig};
pub use error::{Result, RuntimeError};
pub use memory::{CallPhase, CallRecord, MemoryRuntime};

/// Label marking containers owned by DockFormer. Only labelled containers are
/// listed, so pruning never touches containers started by other tools.
pub const LABEL_MANAGED: &str = "dockformer.managed";
/// Manifest name of the container, kept even if the engine renames it
pub const LABEL_NAME: &str = "dockformer.name";
/// Fingerprint of the spec the container was created from
pub const LABEL_FINGERPRINT: &str = "dockformer.fingerprint";

/// Capability set every container backend exposes.
///
/// Calls may block for as long as the engine takes; callers bound them with
/// their own timeout. `create` is not idempotent, so the caller must not
/// create the same name twice without a `remove` in between.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Short backend name used in logs and health output
    fn name(&self) -> &'static str;

    /// Check the engine is reachable
    async fn ping(&self) -> Result<()>;

    /// All managed containers, running or not.
    ///
    /// An `Unavailable` error means the state is unknown, not that there are
    /// no containers.
    async fn list(&self) -> Result<Vec<ObservedContainer>>;

    /// Live status of a single container
    async fn inspect(&self, id: &str) -> Result<ObservedContainer>;

    /// Create (but do not start) a container for the spec
    async fn create(&self, spec: &ContainerSpec) -> Result<ObservedContainer>;

    async fn start(&self, id: &str) -> Result<()>;

    async fn stop(&self, id: &str) -> Result<()>;

    async fn restart(&self, id: &str) -> Result<()>;

    async fn remove(&self, id: &str) -> Result<()>;

    /// Open a log stream. Without `follow` the stream ends after the retained
    /// output; with `follow` it ends when the container stops or the returned
    /// stream is dropped.
    async fn logs(&self, id: &str, options: LogOptions) -> Result<OutputStream>;
}
