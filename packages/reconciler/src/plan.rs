// ABOUTME: Pure diff between a manifest and observed containers
// ABOUTME: Produces the ordered action list the reconciler applies

use dockformer_manifest::{ContainerSpec, Manifest};
use dockformer_runtime::{ContainerState, ObservedContainer};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Create,
    Start,
    Stop,
    Restart,
    Remove,
    Inspect,
    Logs,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Remove => "remove",
            Self::Inspect => "inspect",
            Self::Logs => "logs",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoveReason {
    /// Declared, but the running container no longer matches its spec
    Replaced,
    /// Not declared in the manifest
    Pruned,
    /// Asked for directly by a user
    Requested,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconciliationAction {
    Create {
        spec: ContainerSpec,
    },
    Start {
        name: String,
        id: String,
    },
    Stop {
        name: String,
        id: String,
    },
    Restart {
        name: String,
        id: String,
    },
    Remove {
        name: String,
        id: String,
        reason: RemoveReason,
    },
}

impl ReconciliationAction {
    pub fn name(&self) -> &str {
        match self {
            Self::Create { spec } => &spec.name,
            Self::Start { name, .. }
            | Self::Stop { name, .. }
            | Self::Restart { name, .. }
            | Self::Remove { name, .. } => name,
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Create { .. } => ActionKind::Create,
            Self::Start { .. } => ActionKind::Start,
            Self::Stop { .. } => ActionKind::Stop,
            Self::Restart { .. } => ActionKind::Restart,
            Self::Remove { .. } => ActionKind::Remove,
        }
    }
}

impl fmt::Display for ReconciliationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create { spec } => write!(f, "create {} ({})", spec.name, spec.image),
            Self::Remove { name, reason, .. } => {
                write!(f, "remove {} ({:?})", name, reason)
            }
            other => write!(f, "{} {}", other.kind(), other.name()),
        }
    }
}

/// Ordered actions plus the names that are already converged
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub actions: Vec<ReconciliationAction>,
    pub unchanged: Vec<String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn count(&self, kind: ActionKind) -> usize {
        self.actions.iter().filter(|a| a.kind() == kind).count()
    }
}

/// Whether an observed container must be recreated to match its spec.
/// Containers without a fingerprint label cannot be proven equal.
pub fn needs_replace(spec: &ContainerSpec, observed: &ObservedContainer) -> bool {
    if observed.image() != spec.image {
        return true;
    }
    match observed.fingerprint() {
        Some(fingerprint) => fingerprint != spec.fingerprint(),
        None => true,
    }
}

/// Diff desired state against observed state.
///
/// Removes come first (replaced containers in manifest order, then pruned
/// containers in observed order), followed by creates in manifest order.
/// A declared container that was created but never started gets a `Start`
/// in its manifest position.
pub fn plan(desired: &Manifest, observed: &[ObservedContainer]) -> Plan {
    let mut by_name: HashMap<&str, &ObservedContainer> = HashMap::new();
    let mut duplicates = Vec::new();
    for container in observed {
        if by_name.contains_key(container.name()) {
            duplicates.push(container);
        } else {
            by_name.insert(container.name(), container);
        }
    }

    let declared: HashSet<&str> = desired.names().collect();

    let mut replaced = Vec::new();
    let mut pruned = Vec::new();
    let mut creates = Vec::new();
    let mut unchanged = Vec::new();

    for spec in desired.containers() {
        match by_name.get(spec.name.as_str()) {
            None => creates.push(ReconciliationAction::Create { spec: spec.clone() }),
            Some(current) if needs_replace(spec, current) => {
                replaced.push(ReconciliationAction::Remove {
                    name: spec.name.clone(),
                    id: current.id().to_string(),
                    reason: RemoveReason::Replaced,
                });
                creates.push(ReconciliationAction::Create { spec: spec.clone() });
            }
            Some(current) if current.state() == ContainerState::Created => {
                creates.push(ReconciliationAction::Start {
                    name: spec.name.clone(),
                    id: current.id().to_string(),
                });
            }
            Some(_) => unchanged.push(spec.name.clone()),
        }
    }

    for container in observed {
        let is_first = by_name
            .get(container.name())
            .is_some_and(|first| first.id() == container.id());
        if is_first && !declared.contains(container.name()) {
            pruned.push(ReconciliationAction::Remove {
                name: container.name().to_string(),
                id: container.id().to_string(),
                reason: RemoveReason::Pruned,
            });
        }
    }

    for container in duplicates {
        pruned.push(ReconciliationAction::Remove {
            name: container.name().to_string(),
            id: container.id().to_string(),
            reason: RemoveReason::Pruned,
        });
    }

    let mut actions = replaced;
    actions.extend(pruned);
    actions.extend(creates);

    Plan { actions, unchanged }
}
