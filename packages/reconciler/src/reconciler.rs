// ABOUTME: Applies manifests to the runtime and runs user lifecycle actions
// ABOUTME: One apply at a time, always against the latest accepted generation

use crate::cache::{Stamp, StatusCache};
use crate::calls::{CallTimeouts, RetryPolicy, RuntimeCalls};
use crate::error::{ActionFailure, ApplySummary, ReconcileError, Result};
use crate::locks::NameLocks;
use crate::plan::{plan, ActionKind, Plan, ReconciliationAction, RemoveReason};
use dockformer_manifest::{ContainerSpec, Generation, Manifest};
use dockformer_runtime::{ContainerRuntime, ObservedContainer, RuntimeError};
use dockformer_storage::ManifestStore;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilerConfig {
    pub timeouts: CallTimeouts,
    pub retry: RetryPolicy,
    /// Stored generations kept after each accepted manifest
    pub manifest_history: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            timeouts: CallTimeouts::default(),
            retry: RetryPolicy::default(),
            manifest_history: 20,
        }
    }
}

pub struct Reconciler {
    calls: RuntimeCalls,
    cache: Arc<StatusCache>,
    store: Option<ManifestStore>,
    locks: NameLocks,
    apply_lock: Mutex<()>,
    latest: RwLock<Option<Arc<Manifest>>>,
    next_generation: AtomicU64,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: ReconcilerConfig) -> Self {
        Self {
            calls: RuntimeCalls::new(runtime, config.timeouts.clone(), config.retry.clone()),
            cache: Arc::new(StatusCache::new()),
            store: None,
            locks: NameLocks::new(),
            apply_lock: Mutex::new(()),
            latest: RwLock::new(None),
            next_generation: AtomicU64::new(0),
            config,
        }
    }

    /// Persist accepted manifests to `store`
    pub fn with_store(mut self, store: ManifestStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn cache(&self) -> Arc<StatusCache> {
        Arc::clone(&self.cache)
    }

    pub fn runtime_name(&self) -> &'static str {
        self.calls.runtime_name()
    }

    pub(crate) fn calls(&self) -> &RuntimeCalls {
        &self.calls
    }

    pub async fn ping(&self) -> Result<()> {
        self.calls
            .ping()
            .await
            .map_err(|e| ReconcileError::RuntimeUnavailable(e.to_string()))
    }

    pub async fn latest_manifest(&self) -> Option<Arc<Manifest>> {
        self.latest.read().await.clone()
    }

    /// Generation of the latest accepted manifest, 0 before the first one
    pub async fn current_generation(&self) -> Generation {
        self.latest
            .read()
            .await
            .as_ref()
            .map(|m| m.generation())
            .unwrap_or(0)
    }

    /// Reload the newest persisted manifest so generations keep increasing
    /// across restarts. Returns the restored generation.
    pub async fn restore(&self) -> Result<Option<Generation>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };

        let highest = store.latest_generation().await?;
        self.next_generation.fetch_max(highest, Ordering::SeqCst);

        let Some(stored) = store.load_latest().await? else {
            return Ok(None);
        };

        match stored.manifest() {
            Ok(manifest) => {
                let generation = manifest.generation();
                self.set_latest(Arc::new(manifest)).await;
                info!(
                    generation,
                    containers = stored.container_count,
                    "Restored persisted manifest"
                );
                Ok(Some(generation))
            }
            Err(e) => {
                error!(
                    generation = stored.generation,
                    "Persisted manifest could not be restored: {}", e
                );
                Ok(None)
            }
        }
    }

    async fn set_latest(&self, manifest: Arc<Manifest>) {
        let mut latest = self.latest.write().await;
        let newer = latest
            .as_ref()
            .map_or(true, |current| manifest.generation() > current.generation());
        if newer {
            *latest = Some(manifest);
        }
    }

    /// Accept a parsed manifest: stamp the next generation, persist it, and
    /// reconcile. Waits behind any apply already in flight; the pass that
    /// eventually runs uses whatever manifest is newest by then.
    pub async fn submit(&self, manifest: Manifest) -> Result<ApplySummary> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let manifest = manifest.with_generation(generation);

        if let Some(store) = &self.store {
            store.save(&manifest).await?;
            match store.prune(self.config.manifest_history).await {
                Ok(0) => {}
                Ok(pruned) => debug!(pruned, "Pruned manifest history"),
                Err(e) => warn!("Failed to prune manifest history: {}", e),
            }
        }

        info!(
            generation,
            digest = manifest.digest(),
            containers = manifest.len(),
            "Accepted manifest"
        );
        self.set_latest(Arc::new(manifest)).await;

        let _apply = self.apply_lock.lock().await;
        let mut summary = self.apply_latest().await?;
        summary.superseded = summary.generation > generation;
        Ok(summary)
    }

    /// Re-run reconciliation of the latest manifest
    pub async fn reconcile(&self) -> Result<ApplySummary> {
        let _apply = self.apply_lock.lock().await;
        self.apply_latest().await
    }

    /// Drift correction pass. Returns `None` without doing anything when an
    /// apply is already running or no manifest has been accepted.
    pub async fn drift_check(&self) -> Result<Option<ApplySummary>> {
        let Ok(_apply) = self.apply_lock.try_lock() else {
            debug!("Apply in flight, skipping drift check");
            return Ok(None);
        };
        if self.latest.read().await.is_none() {
            return Ok(None);
        }
        self.apply_latest().await.map(Some)
    }

    /// Plan the latest manifest (or `manifest`) without applying it
    pub async fn preview(&self, manifest: Option<&Manifest>) -> Result<Plan> {
        let latest = self.latest_manifest().await;
        let desired = match (manifest, latest.as_deref()) {
            (Some(m), _) => m,
            (None, Some(m)) => m,
            (None, None) => return Err(ReconcileError::NoManifest),
        };
        let observed = self.snapshot().await?;
        Ok(plan(desired, &observed.1))
    }

    /// Poll the runtime and replace the cached snapshot
    pub async fn refresh(&self) -> Result<usize> {
        let (_, observed) = self.snapshot().await?;
        Ok(observed.len())
    }

    /// List the runtime and fold the result into the cache. Failure marks the
    /// cache stale and surfaces as `RuntimeUnavailable`.
    async fn snapshot(&self) -> Result<(Stamp, Vec<ObservedContainer>)> {
        let stamp = self.cache.stamp(self.current_generation().await);
        match self.calls.list().await {
            Ok(observed) => {
                self.cache.apply_refresh(observed.clone(), stamp).await;
                Ok((stamp, observed))
            }
            Err(e) => {
                self.cache.mark_stale().await;
                Err(ReconcileError::RuntimeUnavailable(e.to_string()))
            }
        }
    }

    /// Caller holds the apply lock
    async fn apply_latest(&self) -> Result<ApplySummary> {
        let manifest = self
            .latest_manifest()
            .await
            .ok_or(ReconcileError::NoManifest)?;
        let generation = manifest.generation();

        let (_, observed) = self.snapshot().await?;
        let plan = plan(&manifest, &observed);

        let mut summary = ApplySummary::new(generation);
        summary.unchanged = plan.unchanged.clone();

        if plan.is_empty() {
            debug!(generation, "Runtime already converged");
            return Ok(summary);
        }

        info!(
            generation,
            actions = plan.actions.len(),
            creates = plan.count(ActionKind::Create),
            removes = plan.count(ActionKind::Remove),
            "Applying reconciliation plan"
        );

        // Names whose old container could not be removed; creating would collide
        let mut blocked: HashSet<String> = HashSet::new();

        for action in plan.actions {
            let name = action.name().to_string();
            let kind = action.kind();
            let _guard = self.locks.acquire(&name).await;

            match action {
                ReconciliationAction::Remove { id, reason, .. } => {
                    match self.remove_container(&name, &id, generation).await {
                        Ok(()) => {
                            info!(container = %name, ?reason, "Removed container");
                            summary.removed.push(name);
                        }
                        Err(e) => {
                            warn!(container = %name, ?reason, "Remove failed: {}", e);
                            if reason == RemoveReason::Replaced {
                                blocked.insert(name.clone());
                            }
                            summary.failed.push(ActionFailure::new(name, kind, e));
                        }
                    }
                }
                ReconciliationAction::Create { spec } => {
                    if blocked.contains(&name) {
                        summary.failed.push(ActionFailure::new(
                            name,
                            kind,
                            "skipped: the container it replaces could not be removed",
                        ));
                        continue;
                    }
                    match self.create_container(&spec, generation).await {
                        Ok(container) => {
                            info!(
                                container = %name,
                                id = container.id(),
                                image = %spec.image,
                                "Created container"
                            );
                            summary.created.push(name);
                        }
                        Err((action, e)) => {
                            warn!(container = %name, %action, "Create failed: {}", e);
                            summary.failed.push(ActionFailure::new(name, action, e));
                        }
                    }
                }
                ReconciliationAction::Start { id, .. }
                | ReconciliationAction::Stop { id, .. }
                | ReconciliationAction::Restart { id, .. } => {
                    match self.transition(&name, &id, kind, generation).await {
                        Ok(_) if kind == ActionKind::Start => summary.started.push(name),
                        Ok(_) => {}
                        Err(e) => {
                            warn!(container = %name, action = %kind, "Action failed: {}", e);
                            summary.failed.push(ActionFailure::new(name, kind, e));
                        }
                    }
                }
            }
        }

        if summary.is_success() {
            info!(
                generation,
                created = summary.created.len(),
                removed = summary.removed.len(),
                "Reconciliation complete"
            );
        } else {
            warn!(
                generation,
                failed = summary.failed.len(),
                "Reconciliation finished with failures"
            );
        }
        Ok(summary)
    }

    async fn create_container(
        &self,
        spec: &ContainerSpec,
        generation: Generation,
    ) -> std::result::Result<ObservedContainer, (ActionKind, RuntimeError)> {
        let created = self
            .calls
            .create(spec)
            .await
            .map_err(|e| (ActionKind::Create, e))?;

        if let Err(e) = self.calls.start(created.id()).await {
            // The container exists; record what the runtime reported
            let stamp = self.cache.stamp(generation);
            self.cache.put(&spec.name, created, stamp).await;
            return Err((ActionKind::Start, e));
        }

        let stamp = self.cache.stamp(generation);
        let container = self
            .calls
            .inspect(created.id())
            .await
            .map_err(|e| (ActionKind::Inspect, e))?;
        self.cache.put(&spec.name, container.clone(), stamp).await;
        Ok(container)
    }

    /// Remove by id; a container that is already gone counts as removed
    async fn remove_container(
        &self,
        name: &str,
        id: &str,
        generation: Generation,
    ) -> std::result::Result<(), RuntimeError> {
        match self.calls.remove(id).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {
                let stamp = self.cache.stamp(generation);
                self.cache.invalidate_id(name, id, stamp).await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Start, stop or restart, then cache what the runtime reports.
    /// Caller holds the name lock.
    async fn transition(
        &self,
        name: &str,
        id: &str,
        kind: ActionKind,
        generation: Generation,
    ) -> Result<ObservedContainer> {
        let outcome = match kind {
            ActionKind::Start => self.calls.start(id).await,
            ActionKind::Stop => self.calls.stop(id).await,
            ActionKind::Restart => self.calls.restart(id).await,
            other => {
                return Err(ReconcileError::Runtime {
                    name: name.to_string(),
                    action: other,
                    cause: RuntimeError::Operation(format!("{} is not a transition", other)),
                })
            }
        };

        if let Err(e) = outcome {
            if e.is_not_found() {
                let stamp = self.cache.stamp(generation);
                self.cache.invalidate_id(name, id, stamp).await;
            }
            return Err(ReconcileError::runtime(name, kind, e));
        }

        let stamp = self.cache.stamp(generation);
        let container = self
            .calls
            .inspect(id)
            .await
            .map_err(|e| ReconcileError::runtime(name, ActionKind::Inspect, e))?;
        self.cache.put(name, container.clone(), stamp).await;
        Ok(container)
    }

    /// Look up a container by name or id, falling back to a runtime listing
    /// when the cache does not know it
    pub async fn find(&self, target: &str) -> Result<ObservedContainer> {
        self.calls.resolve(&self.cache, target).await
    }

    /// Resolve a name or id and take the name lock, re-reading the id under
    /// the lock in case an apply replaced the container meanwhile
    async fn locked_target(
        &self,
        target: &str,
    ) -> Result<(crate::locks::NameGuard, ObservedContainer)> {
        let container = self.calls.resolve(&self.cache, target).await?;
        let guard = self.locks.acquire(container.name()).await;
        let current = match self.cache.get(container.name()).await {
            Some(current) => current,
            None => self.calls.resolve(&self.cache, container.name()).await?,
        };
        Ok((guard, current))
    }

    async fn lifecycle(&self, target: &str, kind: ActionKind) -> Result<ObservedContainer> {
        let (_guard, container) = self.locked_target(target).await?;
        let generation = self.current_generation().await;
        info!(container = container.name(), action = %kind, "Lifecycle request");
        self.transition(container.name(), container.id(), kind, generation)
            .await
    }

    pub async fn start(&self, target: &str) -> Result<ObservedContainer> {
        self.lifecycle(target, ActionKind::Start).await
    }

    pub async fn stop(&self, target: &str) -> Result<ObservedContainer> {
        self.lifecycle(target, ActionKind::Stop).await
    }

    pub async fn restart(&self, target: &str) -> Result<ObservedContainer> {
        self.lifecycle(target, ActionKind::Restart).await
    }

    /// Remove a container on request. The manifest is left alone, so drift
    /// correction recreates it if it is still declared. Returns the last
    /// known record of the removed container.
    pub async fn remove(&self, target: &str) -> Result<ObservedContainer> {
        let (_guard, container) = self.locked_target(target).await?;
        let generation = self.current_generation().await;
        info!(container = container.name(), "Lifecycle request: remove");

        match self.calls.remove(container.id()).await {
            Ok(()) => {
                let stamp = self.cache.stamp(generation);
                self.cache
                    .invalidate_id(container.name(), container.id(), stamp)
                    .await;
                Ok(container)
            }
            Err(e) => {
                if e.is_not_found() {
                    let stamp = self.cache.stamp(generation);
                    self.cache
                        .invalidate_id(container.name(), container.id(), stamp)
                        .await;
                }
                Err(ReconcileError::runtime(
                    container.name(),
                    ActionKind::Remove,
                    e,
                ))
            }
        }
    }
}
