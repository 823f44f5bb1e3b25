// ABOUTME: Timeout and retry discipline around runtime adapter calls
// ABOUTME: Reads (list, logs) retry transient failures; mutations run exactly once

use crate::cache::StatusCache;
use crate::error::{ReconcileError, Result};
use dockformer_manifest::ContainerSpec;
use dockformer_runtime::{
    ContainerRuntime, LogOptions, ObservedContainer, OutputStream, Result as RuntimeResult,
    RuntimeError,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, doubling from the initial backoff
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallTimeouts {
    /// Bound for every call except create
    pub call: Duration,
    /// Bound for create, which may pull an image first
    pub create: Duration,
}

impl Default for CallTimeouts {
    fn default() -> Self {
        Self {
            call: Duration::from_secs(30),
            create: Duration::from_secs(600),
        }
    }
}

fn is_transient(err: &RuntimeError) -> bool {
    matches!(err, RuntimeError::Unavailable(_) | RuntimeError::Timeout(_))
}

/// Runtime handle shared by the reconciler and the log streamer
#[derive(Clone)]
pub(crate) struct RuntimeCalls {
    runtime: Arc<dyn ContainerRuntime>,
    timeouts: CallTimeouts,
    retry: RetryPolicy,
}

impl RuntimeCalls {
    pub(crate) fn new(
        runtime: Arc<dyn ContainerRuntime>,
        timeouts: CallTimeouts,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            runtime,
            timeouts,
            retry,
        }
    }

    pub(crate) fn runtime_name(&self) -> &'static str {
        self.runtime.name()
    }

    async fn bounded<T>(
        limit: Duration,
        call: impl Future<Output = RuntimeResult<T>>,
    ) -> RuntimeResult<T> {
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Timeout(limit)),
        }
    }

    async fn retrying<T, F, Fut>(&self, operation: &str, mut call: F) -> RuntimeResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RuntimeResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match Self::bounded(self.timeouts.call, call()).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.retry.max_attempts && is_transient(&e) => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        operation,
                        attempt,
                        ?delay,
                        error = %e,
                        "Runtime call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) async fn ping(&self) -> RuntimeResult<()> {
        Self::bounded(self.timeouts.call, self.runtime.ping()).await
    }

    pub(crate) async fn list(&self) -> RuntimeResult<Vec<ObservedContainer>> {
        self.retrying("list", || self.runtime.list()).await
    }

    pub(crate) async fn logs(&self, id: &str, options: LogOptions) -> RuntimeResult<OutputStream> {
        self.retrying("logs", || self.runtime.logs(id, options)).await
    }

    pub(crate) async fn inspect(&self, id: &str) -> RuntimeResult<ObservedContainer> {
        Self::bounded(self.timeouts.call, self.runtime.inspect(id)).await
    }

    pub(crate) async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<ObservedContainer> {
        Self::bounded(self.timeouts.create, self.runtime.create(spec)).await
    }

    pub(crate) async fn start(&self, id: &str) -> RuntimeResult<()> {
        Self::bounded(self.timeouts.call, self.runtime.start(id)).await
    }

    pub(crate) async fn stop(&self, id: &str) -> RuntimeResult<()> {
        Self::bounded(self.timeouts.call, self.runtime.stop(id)).await
    }

    pub(crate) async fn restart(&self, id: &str) -> RuntimeResult<()> {
        Self::bounded(self.timeouts.call, self.runtime.restart(id)).await
    }

    pub(crate) async fn remove(&self, id: &str) -> RuntimeResult<()> {
        Self::bounded(self.timeouts.call, self.runtime.remove(id)).await
    }

    /// Find a container by name or runtime id: cache first, then a fresh listing
    pub(crate) async fn resolve(
        &self,
        cache: &StatusCache,
        target: &str,
    ) -> Result<ObservedContainer> {
        if let Some(container) = cache.get(target).await {
            return Ok(container);
        }
        if let Some(container) = cache.find_by_id(target).await {
            return Ok(container);
        }

        let observed = self
            .list()
            .await
            .map_err(|e| ReconcileError::RuntimeUnavailable(e.to_string()))?;

        observed
            .into_iter()
            .find(|c| {
                c.name() == target
                    || c.id() == target
                    || (target.len() >= 12 && c.id().starts_with(target))
            })
            .ok_or_else(|| ReconcileError::NotFound(target.to_string()))
    }
}
