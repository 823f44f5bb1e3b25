use crate::config::{Config, RuntimeKind};
use crate::server::{bootstrap, build_reconciler};
use dockformer_manifest::parse;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

const STACK: &str = "containers:\n  - name: web\n    image: nginx:latest\n";

fn config_for(dir: &TempDir, reconcile_on_start: bool) -> Config {
    let db_path = dir.path().join("state").join("dockformer.db");
    let mut config = Config::from_lookup(|key| match key {
        "DOCKFORMER_DB_PATH" => Some(db_path.display().to_string()),
        _ => None,
    })
    .unwrap();
    config.runtime = RuntimeKind::Memory;
    config.reconcile_on_start = reconcile_on_start;
    config
}

#[tokio::test]
async fn test_bootstrap_without_manifest_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let config = config_for(&dir, true);
    let reconciler = build_reconciler(&config).await.unwrap();

    bootstrap(&reconciler, &config).await.unwrap();
    assert_eq!(reconciler.current_generation().await, 0);
    assert!(reconciler.cache().list().await.is_empty());
}

#[tokio::test]
async fn test_bootstrap_restores_and_converges() {
    let dir = TempDir::new().unwrap();
    let config = config_for(&dir, true);

    {
        let first = build_reconciler(&config).await.unwrap();
        first.submit(parse(STACK.as_bytes()).unwrap()).await.unwrap();
    }

    // A fresh memory runtime stands in for a host that lost its containers
    let second = build_reconciler(&config).await.unwrap();
    bootstrap(&second, &config).await.unwrap();

    assert_eq!(second.current_generation().await, 1);
    let names: Vec<String> = second
        .cache()
        .list()
        .await
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    assert_eq!(names, vec!["web"]);
}

#[tokio::test]
async fn test_bootstrap_respects_disabled_startup_reconcile() {
    let dir = TempDir::new().unwrap();
    let config = config_for(&dir, false);

    {
        let first = build_reconciler(&config).await.unwrap();
        first.submit(parse(STACK.as_bytes()).unwrap()).await.unwrap();
    }

    let second = build_reconciler(&config).await.unwrap();
    bootstrap(&second, &config).await.unwrap();

    assert_eq!(second.current_generation().await, 1);
    assert!(second.cache().list().await.is_empty());
}
