// ABOUTME: Process-wide snapshot of observed container state keyed by name
// ABOUTME: Writes are ordered by stamp so a slow, stale writer can never clobber a fresher one

use chrono::{DateTime, Utc};
use dockformer_manifest::Generation;
use dockformer_runtime::ObservedContainer;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

/// Ordering key for cache writes.
///
/// The manifest generation dominates; the sequence, issued when the writer
/// read the runtime, orders writers within one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Stamp {
    pub generation: Generation,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub container: ObservedContainer,
    pub stamp: Stamp,
    pub refreshed_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn generation(&self) -> Generation {
        self.stamp.generation
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Present(CacheEntry),
    /// Tombstone: keeps the stamp of the removal so older writes stay out
    Removed(Stamp),
}

impl Slot {
    fn stamp(&self) -> Stamp {
        match self {
            Self::Present(entry) => entry.stamp,
            Self::Removed(stamp) => *stamp,
        }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    slots: BTreeMap<String, Slot>,
    last_refresh: Option<DateTime<Utc>>,
    stale_since: Option<DateTime<Utc>>,
}

/// Read-mostly status store. Readers get clones; the lock is never held
/// across a runtime call.
#[derive(Debug, Default)]
pub struct StatusCache {
    state: RwLock<CacheState>,
    sequence: AtomicU64,
}

impl StatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a stamp for a writer about to read the runtime
    pub fn stamp(&self, generation: Generation) -> Stamp {
        Stamp {
            generation,
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
        }
    }

    pub async fn get(&self, name: &str) -> Option<ObservedContainer> {
        self.entry(name).await.map(|entry| entry.container)
    }

    pub async fn entry(&self, name: &str) -> Option<CacheEntry> {
        match self.state.read().await.slots.get(name) {
            Some(Slot::Present(entry)) => Some(entry.clone()),
            _ => None,
        }
    }

    /// Look up by runtime id; a unique prefix of at least 12 characters also matches
    pub async fn find_by_id(&self, id: &str) -> Option<ObservedContainer> {
        let state = self.state.read().await;
        let mut matches = state.slots.values().filter_map(|slot| match slot {
            Slot::Present(entry)
                if entry.container.id() == id
                    || (id.len() >= 12 && entry.container.id().starts_with(id)) =>
            {
                Some(entry.container.clone())
            }
            _ => None,
        });
        let first = matches.next()?;
        match matches.next() {
            Some(_) => None,
            None => Some(first),
        }
    }

    /// All present containers ordered by name
    pub async fn list(&self) -> Vec<ObservedContainer> {
        self.state
            .read()
            .await
            .slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Present(entry) => Some(entry.container.clone()),
                Slot::Removed(_) => None,
            })
            .collect()
    }

    /// Store a container; returns false when the write was older than the
    /// held entry (or tombstone) and was discarded
    pub async fn put(&self, name: &str, container: ObservedContainer, stamp: Stamp) -> bool {
        let mut state = self.state.write().await;
        Self::put_locked(&mut state, name, container, stamp)
    }

    /// Evict a name, leaving a tombstone; returns false when discarded
    pub async fn invalidate(&self, name: &str, stamp: Stamp) -> bool {
        let mut state = self.state.write().await;
        Self::invalidate_locked(&mut state, name, stamp)
    }

    /// Evict `name` only if the cached entry is the container `id`. Another
    /// container holding the name (a surviving duplicate) is left in place.
    pub async fn invalidate_id(&self, name: &str, id: &str, stamp: Stamp) -> bool {
        let mut state = self.state.write().await;
        if let Some(Slot::Present(entry)) = state.slots.get(name) {
            if entry.container.id() != id {
                debug!(
                    container = name,
                    removed = id,
                    kept = entry.container.id(),
                    "Cached entry belongs to another container"
                );
                return false;
            }
        }
        Self::invalidate_locked(&mut state, name, stamp)
    }

    /// Replace the snapshot with a full runtime listing taken under `stamp`.
    /// Names missing from the listing are evicted; fresher entries survive.
    pub async fn apply_refresh(&self, observed: Vec<ObservedContainer>, stamp: Stamp) -> usize {
        let mut state = self.state.write().await;
        let mut seen = HashSet::new();
        let mut written = 0;

        for container in observed {
            let name = container.name().to_string();
            if !seen.insert(name.clone()) {
                continue;
            }
            if Self::put_locked(&mut state, &name, container, stamp) {
                written += 1;
            }
        }

        let absent: Vec<String> = state
            .slots
            .iter()
            .filter(|(name, slot)| matches!(slot, Slot::Present(_)) && !seen.contains(*name))
            .map(|(name, _)| name.clone())
            .collect();
        for name in absent {
            Self::invalidate_locked(&mut state, &name, stamp);
        }

        state.last_refresh = Some(Utc::now());
        state.stale_since = None;
        written
    }

    /// Record that the runtime could not be reached; entries are kept
    pub async fn mark_stale(&self) {
        let mut state = self.state.write().await;
        if state.stale_since.is_none() {
            state.stale_since = Some(Utc::now());
        }
    }

    /// Set while the last refresh attempt failed
    pub async fn stale_since(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.stale_since
    }

    pub async fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.last_refresh
    }

    fn put_locked(
        state: &mut CacheState,
        name: &str,
        container: ObservedContainer,
        stamp: Stamp,
    ) -> bool {
        if let Some(held) = state.slots.get(name) {
            if stamp < held.stamp() {
                debug!(
                    container = name,
                    ?stamp,
                    held = ?held.stamp(),
                    "Discarding stale cache write"
                );
                return false;
            }
        }
        state.slots.insert(
            name.to_string(),
            Slot::Present(CacheEntry {
                container,
                stamp,
                refreshed_at: Utc::now(),
            }),
        );
        true
    }

    fn invalidate_locked(state: &mut CacheState, name: &str, stamp: Stamp) -> bool {
        if let Some(held) = state.slots.get(name) {
            if stamp < held.stamp() {
                return false;
            }
        }
        state.slots.insert(name.to_string(), Slot::Removed(stamp));
        true
    }
}
