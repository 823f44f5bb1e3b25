// ABOUTME: Background loops that keep the status cache fresh and correct drift
// ABOUTME: Both loops stop promptly when the supervisor is shut down

use crate::reconciler::Reconciler;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    pub refresh_interval: Duration,
    /// `None` disables drift correction
    pub drift_interval: Option<Duration>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(10),
            drift_interval: Some(Duration::from_secs(60)),
        }
    }
}

/// Handle to the running background loops
pub struct Supervisor {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// Spawn the refresh loop (first poll immediately) and, when enabled, the
    /// drift loop (first pass after one full period)
    pub fn spawn(reconciler: Arc<Reconciler>, config: SupervisorConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let mut handles = Vec::new();

        info!(
            refresh_secs = config.refresh_interval.as_secs_f64(),
            drift_secs = config.drift_interval.map(|d| d.as_secs_f64()),
            "Starting supervisor"
        );

        handles.push(tokio::spawn(refresh_loop(
            Arc::clone(&reconciler),
            config.refresh_interval,
            shutdown.subscribe(),
        )));

        if let Some(period) = config.drift_interval {
            handles.push(tokio::spawn(drift_loop(
                reconciler,
                period,
                shutdown.subscribe(),
            )));
        }

        Self { shutdown, handles }
    }

    /// Signal both loops and wait for them to finish their current pass
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Supervisor task ended abnormally: {}", e);
            }
        }
        info!("Supervisor stopped");
    }
}

async fn refresh_loop(
    reconciler: Arc<Reconciler>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut unavailable = false;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        match reconciler.refresh().await {
            Ok(count) => {
                if unavailable {
                    info!("Container runtime reachable again");
                    unavailable = false;
                }
                debug!(containers = count, "Refreshed status cache");
            }
            Err(e) => {
                // Only log the transition to keep a down daemon from flooding logs
                if !unavailable {
                    warn!("Status refresh failed, serving stale state: {}", e);
                    unavailable = true;
                }
            }
        }
    }
}

async fn drift_loop(
    reconciler: Arc<Reconciler>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        match reconciler.drift_check().await {
            Ok(Some(summary)) if summary.changed() => {
                info!(
                    generation = summary.generation,
                    created = summary.created.len(),
                    started = summary.started.len(),
                    removed = summary.removed.len(),
                    failed = summary.failed.len(),
                    "Corrected drift"
                );
            }
            Ok(_) => debug!("No drift"),
            Err(e) => warn!("Drift check failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ReconcilerConfig, RetryPolicy};
    use dockformer_runtime::{ContainerRuntime, MemoryRuntime};

    fn reconciler(runtime: &MemoryRuntime) -> Arc<Reconciler> {
        Arc::new(Reconciler::new(
            Arc::new(runtime.clone()),
            ReconcilerConfig {
                retry: RetryPolicy::none(),
                ..ReconcilerConfig::default()
            },
        ))
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_picks_up_external_changes() {
        let runtime = MemoryRuntime::new();
        let reconciler = reconciler(&runtime);
        let supervisor = Supervisor::spawn(
            Arc::clone(&reconciler),
            SupervisorConfig {
                refresh_interval: Duration::from_secs(1),
                drift_interval: None,
            },
        );
        settle().await;
        assert!(reconciler.cache().last_refresh().await.is_some());

        let spec = dockformer_manifest::parse(b"containers:\n  - name: web\n    image: nginx\n")
            .unwrap()
            .containers()[0]
            .clone();
        runtime.create(&spec).await.unwrap();
        assert!(reconciler.cache().get("web").await.is_none());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        settle().await;
        assert!(reconciler.cache().get("web").await.is_some());

        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_drift_loop_recreates_removed_container() {
        let runtime = MemoryRuntime::new();
        let reconciler = reconciler(&runtime);
        let manifest =
            dockformer_manifest::parse(b"containers:\n  - name: web\n    image: nginx\n").unwrap();
        reconciler.submit(manifest).await.unwrap();

        let id = reconciler.cache().get("web").await.unwrap().id().to_string();
        runtime.remove(&id).await.unwrap();

        let supervisor = Supervisor::spawn(
            Arc::clone(&reconciler),
            SupervisorConfig {
                refresh_interval: Duration::from_secs(60),
                drift_interval: Some(Duration::from_secs(2)),
            },
        );

        tokio::time::sleep(Duration::from_millis(2100)).await;
        settle().await;

        let listed = runtime.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_ne!(listed[0].id(), id);

        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_loops() {
        let runtime = MemoryRuntime::new();
        let reconciler = reconciler(&runtime);
        let supervisor = Supervisor::spawn(Arc::clone(&reconciler), SupervisorConfig::default());
        settle().await;
        supervisor.shutdown().await;

        runtime.clear_journal();
        tokio::time::sleep(Duration::from_secs(120)).await;
        settle().await;
        assert!(runtime.journal().is_empty());
    }
}
