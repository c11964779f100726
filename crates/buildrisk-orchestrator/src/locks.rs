//! Per-repository advisory locking.
//!
//! Clone, worktree creation, and log download for one `raw_repo_id` must run
//! sequentially; across repos they're independent. A single global mutex
//! would serialize everything, so each repo gets its own lock, created
//! lazily and shared by `raw_repo_id`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

#[derive(Default)]
pub struct RepoLockRegistry {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RepoLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn lock_for(&self, raw_repo_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(raw_repo_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Acquire the advisory lock for a repo. The guard's lifetime is detached
    /// from `self` via the `Arc` so callers can hold it across `.await`
    /// points in a task body without borrowing the registry.
    pub async fn acquire(&self, raw_repo_id: &str) -> RepoGuard {
        let lock = self.lock_for(raw_repo_id).await;
        RepoGuard { lock }
    }
}

pub struct RepoGuard {
    lock: Arc<Mutex<()>>,
}

impl RepoGuard {
    pub async fn held(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_repo_serializes_access() {
        let registry = Arc::new(RepoLockRegistry::new());
        let concurrent = Arc::new(AtomicU32::new(0));
        let max_concurrent = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let registry = registry.clone();
            let concurrent = concurrent.clone();
            let max_concurrent = max_concurrent.clone();
            handles.push(tokio::spawn(async move {
                let guard = registry.acquire("repo-1").await;
                let _held = guard.held().await;
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_repos_do_not_block_each_other() {
        let registry = RepoLockRegistry::new();
        let guard_a = registry.acquire("repo-a").await;
        let _held_a = guard_a.held().await;
        let guard_b = registry.acquire("repo-b").await;
        let fut = guard_b.held();
        tokio::time::timeout(Duration::from_millis(50), fut).await.expect("repo-b lock should not be blocked by repo-a");
    }
}
