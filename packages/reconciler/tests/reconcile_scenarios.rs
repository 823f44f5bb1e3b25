// ABOUTME: End-to-end reconciliation scenarios against the in-memory runtime
// ABOUTME: Covers create, prune, partial failure, per-name serialisation and superseded applies

use dockformer_manifest::Manifest;
use dockformer_reconciler::{
    ActionKind, LogStreamer, LogStreamerConfig, Reconciler, ReconcilerConfig, RetryPolicy,
};
use dockformer_runtime::{CallPhase, ContainerRuntime, ContainerState, MemoryRuntime};
use dockformer_storage::ManifestStore;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const WEB_AND_DB: &str = r#"
containers:
  - name: web
    image: nginx:latest
    ports: "8080:80"
  - name: db
    image: "postgres:14"
    env:
      POSTGRES_PASSWORD: secret
"#;

fn manifest(yaml: &str) -> Manifest {
    dockformer_manifest::parse(yaml.as_bytes()).expect("manifest should parse")
}

fn reconciler(runtime: &MemoryRuntime) -> Arc<Reconciler> {
    Arc::new(Reconciler::new(
        Arc::new(runtime.clone()),
        ReconcilerConfig {
            retry: RetryPolicy::none(),
            ..ReconcilerConfig::default()
        },
    ))
}

async fn cached_states(reconciler: &Reconciler) -> Vec<(String, ContainerState)> {
    reconciler
        .cache()
        .list()
        .await
        .iter()
        .map(|c| (c.name().to_string(), c.state()))
        .collect()
}

#[tokio::test]
async fn test_empty_runtime_gets_every_declared_container() {
    let runtime = MemoryRuntime::new();
    let reconciler = reconciler(&runtime);

    let summary = reconciler.submit(manifest(WEB_AND_DB)).await.unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.created, vec!["web", "db"]);
    assert_eq!(
        cached_states(&reconciler).await,
        vec![
            ("db".to_string(), ContainerState::Running),
            ("web".to_string(), ContainerState::Running),
        ]
    );

    let web = reconciler.cache().get("web").await.unwrap();
    assert_eq!(web.ports_display(), "8080:80");
}

#[tokio::test]
async fn test_undeclared_container_is_pruned() {
    let runtime = MemoryRuntime::new();
    let reconciler = reconciler(&runtime);
    reconciler.submit(manifest(WEB_AND_DB)).await.unwrap();

    let summary = reconciler
        .submit(manifest(
            "containers:\n  - name: web\n    image: nginx:latest\n    ports: \"8080:80\"\n",
        ))
        .await
        .unwrap();

    assert_eq!(summary.removed, vec!["db"]);
    assert_eq!(summary.unchanged, vec!["web"]);
    let names: Vec<String> = runtime
        .list()
        .await
        .unwrap()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    assert_eq!(names, vec!["web"]);
    assert!(reconciler.cache().get("db").await.is_none());
}

#[tokio::test]
async fn test_bad_image_fails_only_that_container() {
    let runtime = MemoryRuntime::new();
    runtime.fail_image("postgres:14", "manifest unknown");
    let reconciler = reconciler(&runtime);

    let summary = reconciler.submit(manifest(WEB_AND_DB)).await.unwrap();

    assert!(!summary.is_success());
    assert_eq!(summary.created, vec!["web"]);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].name, "db");
    assert_eq!(summary.failed[0].action, ActionKind::Create);
    assert!(summary.failed[0].cause.contains("manifest unknown"));

    assert!(reconciler.cache().get("db").await.is_none());
    assert!(summary.into_result().is_err());
}

#[tokio::test]
async fn test_concurrent_actions_on_one_name_never_overlap() {
    let runtime = MemoryRuntime::new();
    let reconciler = reconciler(&runtime);
    reconciler.submit(manifest(WEB_AND_DB)).await.unwrap();

    runtime.clear_journal();
    runtime.set_delay(Some(Duration::from_millis(10)));

    let mut handles = Vec::new();
    for target in ["web", "web", "db", "web", "db"] {
        let reconciler = Arc::clone(&reconciler);
        handles.push(tokio::spawn(async move {
            reconciler.restart(target).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let mut open: HashMap<String, usize> = HashMap::new();
    let mut overlapped_names = false;
    for record in runtime.journal() {
        let count = open.entry(record.target.clone()).or_default();
        match record.phase {
            CallPhase::Begin => {
                *count += 1;
                assert!(*count <= 1, "overlapping calls on {}", record.target);
            }
            CallPhase::End => *count -= 1,
        }
        if open.values().filter(|n| **n > 0).count() > 1 {
            overlapped_names = true;
        }
    }
    // Different names are free to run side by side
    assert!(overlapped_names);
}

#[tokio::test(start_paused = true)]
async fn test_submit_during_apply_converges_to_latest() {
    let runtime = MemoryRuntime::new();
    runtime.set_delay(Some(Duration::from_millis(20)));
    let reconciler = reconciler(&runtime);

    let first = {
        let reconciler = Arc::clone(&reconciler);
        tokio::spawn(async move {
            reconciler
                .submit(manifest("containers:\n  - name: web\n    image: \"nginx:1\"\n"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;

    let second = {
        let reconciler = Arc::clone(&reconciler);
        tokio::spawn(async move {
            reconciler
                .submit(manifest("containers:\n  - name: web\n    image: \"nginx:2\"\n"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;

    let third = {
        let reconciler = Arc::clone(&reconciler);
        tokio::spawn(async move {
            reconciler
                .submit(manifest("containers:\n  - name: web\n    image: \"nginx:3\"\n"))
                .await
        })
    };

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    let third = third.await.unwrap().unwrap();

    assert_eq!(first.generation, 1);
    assert!(!first.superseded);
    // The second submit waited behind the first and applied the third's manifest
    assert_eq!(second.generation, 3);
    assert!(second.superseded);
    assert_eq!(third.generation, 3);
    assert!(!third.superseded);

    let listed = runtime.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].image(), "nginx:3");
    assert_eq!(reconciler.current_generation().await, 3);
    assert_eq!(
        reconciler.cache().entry("web").await.unwrap().generation(),
        3
    );
}

#[tokio::test]
async fn test_out_of_band_container_is_pruned_by_drift_check() {
    let runtime = MemoryRuntime::new();
    let reconciler = reconciler(&runtime);
    reconciler.submit(manifest(WEB_AND_DB)).await.unwrap();

    let stray = dockformer_manifest::ContainerSpec::new("stray", "busybox");
    runtime.create(&stray).await.unwrap();
    reconciler.refresh().await.unwrap();
    assert!(reconciler.cache().get("stray").await.is_some());

    let summary = reconciler.drift_check().await.unwrap().unwrap();
    assert_eq!(summary.removed, vec!["stray"]);
    assert_eq!(summary.unchanged, vec!["web", "db"]);
    assert!(reconciler.cache().get("stray").await.is_none());
}

#[tokio::test]
async fn test_restore_resumes_generations_from_store() {
    let store = ManifestStore::in_memory().await.unwrap();
    let runtime = MemoryRuntime::new();

    {
        let reconciler = Reconciler::new(Arc::new(runtime.clone()), ReconcilerConfig::default())
            .with_store(store.clone());
        reconciler.submit(manifest(WEB_AND_DB)).await.unwrap();
        reconciler.submit(manifest(WEB_AND_DB)).await.unwrap();
    }

    let reconciler =
        Reconciler::new(Arc::new(runtime.clone()), ReconcilerConfig::default()).with_store(store);
    assert_eq!(reconciler.restore().await.unwrap(), Some(2));
    assert_eq!(reconciler.latest_manifest().await.unwrap().len(), 2);

    let summary = reconciler.submit(manifest(WEB_AND_DB)).await.unwrap();
    assert_eq!(summary.generation, 3);
    assert!(!summary.changed());
}

#[tokio::test]
async fn test_log_followers_share_one_runtime_stream() {
    let runtime = MemoryRuntime::new();
    let reconciler = reconciler(&runtime);
    reconciler.submit(manifest(WEB_AND_DB)).await.unwrap();
    let streamer = LogStreamer::new(
        &reconciler,
        LogStreamerConfig {
            default_tail: 0,
            ..LogStreamerConfig::default()
        },
    );

    let mut first = streamer.open("web", true).await.unwrap();
    let mut second = streamer.open("web", true).await.unwrap();
    assert_eq!(runtime.open_log_streams(), 1);

    runtime.emit_log("web", "GET / 200").unwrap();
    let wait = Duration::from_secs(1);
    assert_eq!(
        tokio::time::timeout(wait, first.next()).await.unwrap(),
        Some("GET / 200".to_string())
    );
    assert_eq!(
        tokio::time::timeout(wait, second.next()).await.unwrap(),
        Some("GET / 200".to_string())
    );

    drop(first);
    drop(second);
    for _ in 0..100 {
        if runtime.open_log_streams() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(runtime.open_log_streams(), 0);
    assert_eq!(streamer.active_hubs(), 0);
}
