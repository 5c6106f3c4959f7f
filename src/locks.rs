// ABOUTME: Best-effort single-holder locks built on PostgreSQL session advisory locks
// ABOUTME: Locks auto-release on a timer; re-arming a key cancels its previous timer

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_postgres::Client;

use crate::mapping::stable_hash;

/// Fallback hold time when the caller supplies no (or a zero) duration.
const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(10);

/// Cross-instance coordination via `pg_try_advisory_lock`.
///
/// Lock ids are derived from string keys with [`stable_hash`], so every
/// instance contends on the same id for the same key. Locks are session
/// scoped: they belong to this service's connection and are released either
/// by the scheduled timer or when the connection closes.
pub struct AdvisoryLocks {
    client: Arc<Client>,
    releases: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl AdvisoryLocks {
    pub fn new(client: Arc<Client>) -> Self {
        Self {
            client,
            releases: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Attempt a non-blocking advisory lock on `key` and run `on_accept`
    /// while holding it.
    ///
    /// Returns `Ok(Some(value))` when the lock was acquired and `on_accept`
    /// succeeded, `Ok(None)` when another session holds the lock, and `Err`
    /// on a database error or when `on_accept` fails (its errors are not
    /// caught here).
    ///
    /// The release is strictly time based: it fires `duration` after
    /// acquisition whether or not `on_accept` has finished, and a new
    /// acquisition of the same key cancels any earlier pending release.
    pub async fn try_lock_then<F, Fut, T>(
        &self,
        key: &str,
        duration: Option<Duration>,
        on_accept: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let lock_id = stable_hash(key);
        let row = self
            .client
            .query_one("SELECT pg_try_advisory_lock($1)", &[&lock_id])
            .await
            .with_context(|| format!("Failed to acquire advisory lock for key '{}'", key))?;
        let acquired: bool = row.get(0);

        if !acquired {
            tracing::debug!("Advisory lock '{}' ({}) held elsewhere", key, lock_id);
            return Ok(None);
        }

        tracing::debug!("Acquired advisory lock '{}' ({})", key, lock_id);
        self.schedule_release(key, lock_id, duration);

        let value = on_accept().await?;
        Ok(Some(value))
    }

    /// Cancel every pending release timer. The locks themselves die with the
    /// session connection.
    pub fn shutdown(&self) {
        let mut releases = self.releases.lock().unwrap();
        for (_, handle) in releases.drain() {
            handle.abort();
        }
    }

    fn schedule_release(&self, key: &str, lock_id: i64, duration: Option<Duration>) {
        let duration = effective_duration(duration);

        let mut releases = self.releases.lock().unwrap();
        if let Some(previous) = releases.remove(key) {
            previous.abort();
        }

        let client = self.client.clone();
        let key = key.to_string();
        let log_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            match client
                .query_one("SELECT pg_advisory_unlock($1)", &[&lock_id])
                .await
            {
                Ok(row) => {
                    let released: bool = row.get(0);
                    if !released {
                        tracing::warn!(
                            "Advisory lock '{}' ({}) was not held at release time",
                            log_key,
                            lock_id
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to release advisory lock '{}' ({}): {}",
                        log_key,
                        lock_id,
                        e
                    );
                }
            }
        });
        releases.insert(key, handle);
    }
}

impl Drop for AdvisoryLocks {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Resolve the hold time, falling back to 10 s for a missing or zero
/// duration.
fn effective_duration(duration: Option<Duration>) -> Duration {
    match duration {
        Some(d) if !d.is_zero() => d,
        _ => DEFAULT_LOCK_DURATION,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_duration_fallback() {
        assert_eq!(effective_duration(None), DEFAULT_LOCK_DURATION);
        assert_eq!(
            effective_duration(Some(Duration::ZERO)),
            DEFAULT_LOCK_DURATION
        );
        assert_eq!(
            effective_duration(Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_lock_key_is_stable() {
        // The reconcile gate depends on every instance deriving the same id.
        assert_eq!(stable_hash("pg_pubsub"), stable_hash("pg_pubsub"));
        assert!(stable_hash("pg_pubsub") >= 0);
    }
}
