// ABOUTME: Offline commands: validate a manifest file or preview its plan
// ABOUTME: Output is rendered with comfy-table and colored for terminals

use crate::config::Config;
use crate::server::build_runtime;
use anyhow::{Context, Result};
use colored::*;
use comfy_table::{
    modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, ContentArrangement, Table,
};
use dockformer_manifest::Manifest;
use dockformer_reconciler::{ActionKind, Plan, Reconciler, ReconciliationAction};
use std::path::Path;

fn new_table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.iter().map(|h| Cell::new(h)));
    table
}

pub fn read_manifest(path: &Path) -> Result<Manifest> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let manifest = dockformer_manifest::parse(&bytes)
        .with_context(|| format!("{} is not a valid manifest", path.display()))?;
    Ok(manifest)
}

pub fn containers_table(manifest: &Manifest) -> Table {
    let mut table = new_table(&["Name", "Image", "Ports", "Env", "Volumes", "Restart"]);
    for spec in manifest.containers() {
        let ports = spec.ports_display();
        table.add_row(vec![
            Cell::new(&spec.name),
            Cell::new(&spec.image),
            Cell::new(if ports.is_empty() { "-" } else { ports.as_str() }),
            Cell::new(spec.env.len()),
            Cell::new(spec.volumes.len()),
            Cell::new(&spec.restart_policy),
        ]);
    }
    table
}

fn action_detail(action: &ReconciliationAction) -> String {
    match action {
        ReconciliationAction::Create { spec } => spec.image.clone(),
        ReconciliationAction::Remove { reason, id, .. } => {
            format!("{} ({})", short_id(id), format!("{:?}", reason).to_lowercase())
        }
        ReconciliationAction::Start { id, .. }
        | ReconciliationAction::Stop { id, .. }
        | ReconciliationAction::Restart { id, .. } => short_id(id).to_string(),
    }
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

pub fn plan_table(plan: &Plan) -> Table {
    let mut table = new_table(&["#", "Action", "Container", "Detail"]);
    for (index, action) in plan.actions.iter().enumerate() {
        table.add_row(vec![
            Cell::new(index + 1),
            Cell::new(action.kind()),
            Cell::new(action.name()),
            Cell::new(action_detail(action)),
        ]);
    }
    table
}

pub fn validate(path: &Path) -> Result<()> {
    let manifest = read_manifest(path)?;

    println!("{}", format!("Manifest {} is valid", path.display()).green().bold());
    if manifest.is_empty() {
        println!("{}", "No containers declared".yellow());
        return Ok(());
    }

    println!("{}", containers_table(&manifest));
    println!(
        "Total: {} containers, digest {}",
        manifest.len().to_string().cyan(),
        &manifest.digest()[..12]
    );
    Ok(())
}

pub async fn plan(config: &Config, path: &Path) -> Result<()> {
    let manifest = read_manifest(path)?;
    let runtime = build_runtime(config)?;
    let reconciler = Reconciler::new(runtime, config.reconciler());

    let plan = reconciler
        .preview(Some(&manifest))
        .await
        .context("Failed to compute plan")?;

    if plan.is_empty() {
        println!("{}", "Nothing to do; all containers match the manifest".green());
    } else {
        println!("{}", plan_table(&plan));
        println!(
            "Plan: {} to create, {} to start, {} to remove",
            plan.count(ActionKind::Create).to_string().green(),
            plan.count(ActionKind::Start).to_string().cyan(),
            plan.count(ActionKind::Remove).to_string().red(),
        );
    }
    if !plan.unchanged.is_empty() {
        println!("Unchanged: {}", plan.unchanged.join(", ").dimmed());
    }
    Ok(())
}
