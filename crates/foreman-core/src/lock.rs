//! Lock Manager (C2, spec §4.2). Named, process-local, cross-process-exclusive
//! advisory locks with scoped acquisition and guaranteed release on all exit
//! paths (including a panic unwinding through `body`, since release happens
//! in a guard's `Drop`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{Error, Result};

#[derive(Clone, Default)]
pub struct LockManager {
    locks: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
}

#[derive(Debug)]
pub struct LockGuard {
    name: String,
    _guard: OwnedMutexGuard<()>,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl LockManager {
    pub fn new() -> LockManager {
        LockManager::default()
    }

    fn entry(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock registry poisoned");
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquire the named lock, run `body`, and release on every exit path.
    /// Returns [`Error::Timeout`] if the lock is not acquired within `timeout`.
    pub async fn with_lock<F, Fut, T>(&self, name: &str, timeout: Duration, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let guard = self.acquire(name, timeout).await?;
        let result = body().await;
        drop(guard);
        Ok(result)
    }

    /// Acquire the named lock directly, for callers that need to hold it
    /// across several non-contiguous operations (e.g. the Supervisor holding
    /// `task_artifact:<task_id>` across gate execution and consensus).
    pub async fn acquire(&self, name: &str, timeout: Duration) -> Result<LockGuard> {
        let mutex = self.entry(name);
        let guard = tokio::time::timeout(timeout, mutex.lock_owned())
            .await
            .map_err(|_| Error::Timeout(format!("timed out acquiring lock {name:?}")))?;

        Ok(LockGuard {
            name: name.to_string(),
            _guard: guard,
        })
    }

    pub fn breaker_lock_name(model: crate::model::Model) -> String {
        format!("circuit_breaker:{model}")
    }

    pub fn task_artifact_lock_name(task_id: &str) -> String {
        format!("task_artifact:{task_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serializes_access_to_the_same_named_lock() {
        let manager = LockManager::new();
        let counter = Arc::new(StdMutex::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .with_lock("state_writer", Duration::from_secs(5), || async move {
                        let before = *counter.lock().unwrap();
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        *counter.lock().unwrap() = before + 1;
                    })
                    .await
                    .unwrap();
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*counter.lock().unwrap(), 8);
    }

    #[tokio::test]
    async fn distinct_names_do_not_contend() {
        let manager = LockManager::new();
        let _a = manager
            .acquire("circuit_breaker:claude", Duration::from_secs(1))
            .await
            .unwrap();
        // A different name must not time out waiting on an unrelated lock.
        let _b = manager
            .acquire("circuit_breaker:codex", Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn times_out_when_contended() {
        let manager = LockManager::new();
        let _held = manager
            .acquire("event_log", Duration::from_secs(5))
            .await
            .unwrap();

        let err = manager
            .acquire("event_log", Duration::from_millis(20))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout(_)));
    }
}
