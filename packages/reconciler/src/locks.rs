// ABOUTME: Per-container-name async mutexes
// ABOUTME: Serialises runtime calls for one name while different names proceed in parallel

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap = HashMap<String, Arc<AsyncMutex<()>>>;

#[derive(Debug, Clone, Default)]
pub struct NameLocks {
    locks: Arc<Mutex<LockMap>>,
}

impl NameLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, LockMap> {
        self.locks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait for exclusive access to `name`
    pub async fn acquire(&self, name: &str) -> NameGuard {
        let lock = {
            let mut map = self.map();
            Arc::clone(
                map.entry(name.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };

        let guard = Arc::clone(&lock).lock_owned().await;
        NameGuard {
            name: name.to_string(),
            lock,
            locks: self.clone(),
            guard: Some(guard),
        }
    }

    /// Names with a live lock entry
    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held for the duration of one name's runtime calls
#[derive(Debug)]
pub struct NameGuard {
    name: String,
    lock: Arc<AsyncMutex<()>>,
    locks: NameLocks,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for NameGuard {
    fn drop(&mut self) {
        let mut map = self.locks.map();
        // Release first so a waiter can proceed, then drop the entry if
        // nobody else holds or waits on it (map + this handle only).
        self.guard.take();
        if Arc::strong_count(&self.lock) == 2 {
            if let Some(current) = map.get(&self.name) {
                if Arc::ptr_eq(current, &self.lock) {
                    map.remove(&self.name);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_name_is_exclusive() {
        let locks = NameLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let locks = locks.clone();
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("web").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_different_names_do_not_block() {
        let locks = NameLocks::new();
        let _web = locks.acquire("web").await;
        let db = tokio::time::timeout(Duration::from_millis(100), locks.acquire("db")).await;
        assert!(db.is_ok());
    }
}
