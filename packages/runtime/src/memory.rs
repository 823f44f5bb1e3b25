// ABOUTME: In-process container runtime that keeps containers in a map
// ABOUTME: Used for tests and engine-less demos; supports failure injection and call journalling

use crate::container::{
    ContainerState, LogChunk, LogOptions, ObservedContainer, OutputStream, LOG_CHANNEL_CAPACITY,
};
use crate::error::{Result, RuntimeError};
use crate::ContainerRuntime;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dockformer_manifest::{ContainerSpec, PortMapping};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Begin,
    End,
}

/// One entry in the call journal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub operation: &'static str,
    pub target: String,
    pub phase: CallPhase,
}

struct MemoryContainer {
    id: String,
    name: String,
    image: String,
    state: ContainerState,
    ports: Vec<PortMapping>,
    created_at: DateTime<Utc>,
    fingerprint: Option<String>,
    logs: Vec<String>,
    followers: Vec<mpsc::UnboundedSender<LogChunk>>,
}

impl MemoryContainer {
    fn observed(&self) -> ObservedContainer {
        ObservedContainer::new(
            self.id.clone(),
            self.name.clone(),
            self.image.clone(),
            self.state,
            self.created_at,
        )
        .with_ports(self.ports.clone())
        .with_fingerprint(self.fingerprint.clone())
    }

    fn push_log(&mut self, line: String) {
        let chunk = LogChunk::stdout(format!("{}\n", line));
        self.followers.retain(|tx| tx.send(chunk.clone()).is_ok());
        self.logs.push(line);
    }

    /// Dropping the senders ends every follow stream
    fn close_followers(&mut self) {
        self.followers.clear();
    }
}

#[derive(Default)]
struct MemoryState {
    containers: BTreeMap<String, MemoryContainer>,
    next_id: u64,
    failing_images: HashMap<String, String>,
    failing_operations: HashMap<&'static str, String>,
    unavailable: Option<String>,
    delay: Option<Duration>,
    journal: Vec<CallRecord>,
}

impl MemoryState {
    fn resolve(&self, id_or_name: &str) -> Option<String> {
        if self.containers.contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        self.containers
            .values()
            .find(|c| c.name == id_or_name)
            .map(|c| c.id.clone())
    }

    fn container_mut(&mut self, id_or_name: &str) -> Result<&mut MemoryContainer> {
        let id = self
            .resolve(id_or_name)
            .ok_or_else(|| RuntimeError::NotFound(id_or_name.to_string()))?;
        self.containers
            .get_mut(&id)
            .ok_or_else(|| RuntimeError::NotFound(id_or_name.to_string()))
    }
}

/// Container runtime backed by process memory.
///
/// Every call is recorded as a begin/end pair in a journal so tests can check
/// which operations overlapped.
#[derive(Clone, Default)]
pub struct MemoryRuntime {
    state: Arc<Mutex<MemoryState>>,
    open_streams: Arc<AtomicUsize>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A panic while holding the lock leaves plain data behind; keep going
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every `create` for this image fail with an operation error
    pub fn fail_image(&self, image: impl Into<String>, cause: impl Into<String>) {
        self.lock()
            .failing_images
            .insert(image.into(), cause.into());
    }

    pub fn clear_image_failure(&self, image: &str) {
        self.lock().failing_images.remove(image);
    }

    /// Make every call of one operation (e.g. "remove") fail
    pub fn fail_operation(&self, operation: &'static str, cause: impl Into<String>) {
        self.lock()
            .failing_operations
            .insert(operation, cause.into());
    }

    pub fn clear_operation_failure(&self, operation: &'static str) {
        self.lock().failing_operations.remove(operation);
    }

    /// Simulate an unreachable engine; `None` restores it
    pub fn set_unavailable(&self, cause: Option<String>) {
        self.lock().unavailable = cause;
    }

    /// Delay applied inside every call, between its begin and end records
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.lock().delay = delay;
    }

    pub fn journal(&self) -> Vec<CallRecord> {
        self.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }

    /// Operations (begin records only) issued so far, in order
    pub fn operations(&self) -> Vec<(&'static str, String)> {
        self.lock()
            .journal
            .iter()
            .filter(|r| r.phase == CallPhase::Begin)
            .map(|r| (r.operation, r.target.clone()))
            .collect()
    }

    /// Append a line to a container's output, delivering it to followers
    pub fn emit_log(&self, id_or_name: &str, line: impl Into<String>) -> Result<()> {
        let mut state = self.lock();
        state.container_mut(id_or_name)?.push_log(line.into());
        Ok(())
    }

    /// Log streams whose pump task is still alive
    pub fn open_log_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    /// Insert a container as another tool would, without the name check
    /// `create` applies. Lets tests plant duplicates under one name.
    pub fn adopt(&self, container: ObservedContainer) {
        let mut state = self.lock();
        state.containers.insert(
            container.id().to_string(),
            MemoryContainer {
                id: container.id().to_string(),
                name: container.name().to_string(),
                image: container.image().to_string(),
                state: container.state(),
                ports: container.ports().to_vec(),
                created_at: container.created_at(),
                fingerprint: container.fingerprint().map(str::to_string),
                logs: Vec::new(),
                followers: Vec::new(),
            },
        );
    }

    /// Change a container's state behind the reconciler's back
    pub fn set_state(&self, id_or_name: &str, new_state: ContainerState) -> Result<()> {
        let mut state = self.lock();
        let container = state.container_mut(id_or_name)?;
        container.state = new_state;
        if !new_state.is_running() {
            container.close_followers();
        }
        Ok(())
    }

    async fn begin(&self, operation: &'static str, target: &str) -> Result<()> {
        let delay = {
            let mut state = self.lock();
            state.journal.push(CallRecord {
                operation,
                target: target.to_string(),
                phase: CallPhase::Begin,
            });
            state.delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.lock();
        if let Some(cause) = &state.unavailable {
            return Err(RuntimeError::Unavailable(cause.clone()));
        }
        if let Some(cause) = state.failing_operations.get(operation) {
            return Err(RuntimeError::Operation(cause.clone()));
        }
        Ok(())
    }

    fn end(&self, operation: &'static str, target: &str) {
        self.lock().journal.push(CallRecord {
            operation,
            target: target.to_string(),
            phase: CallPhase::End,
        });
    }

    async fn call<T>(
        &self,
        operation: &'static str,
        target: &str,
        body: impl FnOnce(&mut MemoryState) -> Result<T>,
    ) -> Result<T> {
        let result = match self.begin(operation, target).await {
            Ok(()) => {
                let mut state = self.lock();
                body(&mut *state)
            }
            Err(e) => Err(e),
        };
        self.end(operation, target);
        result
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        match &self.lock().unavailable {
            Some(cause) => Err(RuntimeError::Unavailable(cause.clone())),
            None => Ok(()),
        }
    }

    async fn list(&self) -> Result<Vec<ObservedContainer>> {
        self.call("list", "*", |state| {
            Ok(state.containers.values().map(|c| c.observed()).collect())
        })
        .await
    }

    async fn inspect(&self, id: &str) -> Result<ObservedContainer> {
        self.call("inspect", id, |state| {
            Ok(state.container_mut(id)?.observed())
        })
        .await
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ObservedContainer> {
        self.call("create", &spec.name, |state| {
            if let Some(cause) = state.failing_images.get(&spec.image) {
                return Err(RuntimeError::Operation(format!(
                    "Failed to pull image {}: {}",
                    spec.image, cause
                )));
            }
            if state.resolve(&spec.name).is_some() {
                return Err(RuntimeError::Operation(format!(
                    "Conflict. The container name \"/{}\" is already in use",
                    spec.name
                )));
            }

            state.next_id += 1;
            let id = format!("mem{:012x}", state.next_id);
            let container = MemoryContainer {
                id: id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                state: ContainerState::Created,
                ports: spec.ports.clone(),
                created_at: Utc::now(),
                fingerprint: Some(spec.fingerprint()),
                logs: Vec::new(),
                followers: Vec::new(),
            };
            let observed = container.observed();
            state.containers.insert(id.clone(), container);
            debug!("Created in-memory container {} as {}", spec.name, id);
            Ok(observed)
        })
        .await
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.call("start", id, |state| {
            let container = state.container_mut(id)?;
            if container.state != ContainerState::Running {
                container.state = ContainerState::Running;
                let line = format!("{} started", container.name);
                container.push_log(line);
            }
            Ok(())
        })
        .await
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.call("stop", id, |state| {
            let container = state.container_mut(id)?;
            if container.state == ContainerState::Running {
                let line = format!("{} stopped", container.name);
                container.push_log(line);
            }
            container.state = ContainerState::Stopped;
            container.close_followers();
            Ok(())
        })
        .await
    }

    async fn restart(&self, id: &str) -> Result<()> {
        self.call("restart", id, |state| {
            let container = state.container_mut(id)?;
            container.state = ContainerState::Running;
            let line = format!("{} restarted", container.name);
            container.push_log(line);
            Ok(())
        })
        .await
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.call("remove", id, |state| {
            let resolved = state
                .resolve(id)
                .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
            if let Some(mut container) = state.containers.remove(&resolved) {
                container.close_followers();
            }
            Ok(())
        })
        .await
    }

    async fn logs(&self, id: &str, options: LogOptions) -> Result<OutputStream> {
        let source = self
            .call("logs", id, |state| {
                let container = state.container_mut(id)?;
                let (tx, rx) = mpsc::unbounded_channel();

                let skip = options
                    .tail
                    .map(|n| container.logs.len().saturating_sub(n))
                    .unwrap_or(0);
                for line in &container.logs[skip..] {
                    let _ = tx.send(LogChunk::stdout(format!("{}\n", line)));
                }

                if options.follow && container.state.is_running() {
                    container.followers.push(tx);
                }
                Ok(rx)
            })
            .await?;

        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let open_streams = Arc::clone(&self.open_streams);
        open_streams.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            let mut source = source;
            loop {
                let next = tokio::select! {
                    _ = tx.closed() => break,
                    next = source.recv() => next,
                };
                match next {
                    Some(chunk) => {
                        if tx.send(Ok(chunk)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            open_streams.fetch_sub(1, Ordering::SeqCst);
        });

        Ok(OutputStream::new(rx))
    }
}
