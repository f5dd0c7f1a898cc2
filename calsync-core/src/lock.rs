//! Per-calendar mutual exclusion on top of session-scoped advisory locks.
//!
//! A lock lives as long as the dedicated storage session that took it. That makes it
//! safe across processes, and a crashed process releases its locks when its session
//! dies. The backend only needs a non-blocking try-lock; waiting is a poll loop with a
//! deadline so the granularity stays configurable.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::error::SyncResult;
use crate::store::CalendarKey;

/// Upper 32 bits of every calendar lock key, keeping them clear of unrelated
/// advisory locks in the same database.
const LOCK_NAMESPACE: i64 = 0x4341_4C53; // "CALS"

/// A storage backend that can open sessions holding advisory locks.
#[async_trait]
pub trait AdvisoryLocks: Send + Sync {
    /// Open a dedicated session; locks taken through it are tied to its lifetime.
    async fn open_session(&self) -> SyncResult<Box<dyn LockSession>>;
}

#[async_trait]
pub trait LockSession: Send {
    /// Non-blocking attempt. `Ok(false)` means someone else holds the key.
    async fn try_lock(&mut self, key: i64) -> SyncResult<bool>;

    async fn unlock(&mut self, key: i64) -> SyncResult<bool>;

    /// Hand the session back. When `healthy` is false the session may still hold
    /// locks and must be torn down instead of reused.
    async fn close(self: Box<Self>, healthy: bool);
}

/// Deterministic lock key for a calendar, stable across processes and builds.
pub fn lock_key(calendar_id: &CalendarKey) -> i64 {
    // 32-bit FNV-1a
    let mut hash: u32 = 0x811c_9dc5;
    for byte in calendar_id.as_str().bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    (LOCK_NAMESPACE << 32) | i64::from(hash)
}

/// A held calendar lock, bound to the session that took it.
pub struct CalendarLock {
    calendar_id: CalendarKey,
    key: i64,
    session: Box<dyn LockSession>,
}

impl CalendarLock {
    pub fn calendar_id(&self) -> &CalendarKey {
        &self.calendar_id
    }

    pub fn key(&self) -> i64 {
        self.key
    }
}

#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn AdvisoryLocks>,
    poll_interval: Duration,
}

impl LockManager {
    pub fn new(backend: Arc<dyn AdvisoryLocks>, poll_interval: Duration) -> Self {
        LockManager {
            backend,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    /// Wait up to `timeout` for the calendar's lock. `Ok(None)` means it stayed busy.
    pub async fn acquire(
        &self,
        calendar_id: &CalendarKey,
        timeout: Duration,
    ) -> SyncResult<Option<CalendarLock>> {
        let key = lock_key(calendar_id);
        let deadline = Instant::now() + timeout;
        let mut session = self.backend.open_session().await?;

        loop {
            match session.try_lock(key).await {
                Ok(true) => {
                    debug!(%calendar_id, key, "calendar lock acquired");
                    return Ok(Some(CalendarLock {
                        calendar_id: calendar_id.clone(),
                        key,
                        session,
                    }));
                }
                Ok(false) => {}
                Err(e) => {
                    session.close(false).await;
                    return Err(e);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(%calendar_id, key, "calendar lock busy, giving up");
                session.close(true).await;
                return Ok(None);
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Best-effort unlock; the session is handed back whatever happens.
    pub async fn release(&self, lock: CalendarLock) {
        let CalendarLock {
            calendar_id,
            key,
            mut session,
        } = lock;

        let healthy = match session.unlock(key).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(%calendar_id, key, "calendar lock was not held at release");
                true
            }
            Err(e) => {
                warn!(%calendar_id, key, error = %e, "failed to unlock calendar, discarding session");
                false
            }
        };

        session.close(healthy).await;
        debug!(%calendar_id, key, "calendar lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn manager(store: &Arc<MemoryStore>) -> LockManager {
        LockManager::new(store.clone(), Duration::from_millis(5))
    }

    #[test]
    fn test_lock_key_is_deterministic_and_namespaced() {
        let a = CalendarKey::new("u1", "primary");
        let b = CalendarKey::new("u2", "primary");

        assert_eq!(lock_key(&a), lock_key(&a.clone()));
        assert_ne!(lock_key(&a), lock_key(&b));
        assert_eq!(lock_key(&a) >> 32, LOCK_NAMESPACE);
        assert!(lock_key(&a) > 0);
    }

    #[tokio::test]
    async fn test_second_acquire_times_out_while_held() {
        let store = Arc::new(MemoryStore::new());
        let locks = manager(&store);
        let cal = CalendarKey::new("u1", "primary");

        let held = locks.acquire(&cal, Duration::from_millis(50)).await.unwrap();
        assert!(held.is_some());

        let busy = locks.acquire(&cal, Duration::from_millis(30)).await.unwrap();
        assert!(busy.is_none());

        locks.release(held.unwrap()).await;
        let again = locks.acquire(&cal, Duration::from_millis(30)).await.unwrap();
        assert!(again.is_some());
        locks.release(again.unwrap()).await;
        assert_eq!(store.held_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_different_calendars_do_not_contend() {
        let store = Arc::new(MemoryStore::new());
        let locks = manager(&store);

        let a = locks
            .acquire(&CalendarKey::new("u1", "a"), Duration::ZERO)
            .await
            .unwrap();
        let b = locks
            .acquire(&CalendarKey::new("u1", "b"), Duration::ZERO)
            .await
            .unwrap();

        assert!(a.is_some() && b.is_some());
        locks.release(a.unwrap()).await;
        locks.release(b.unwrap()).await;
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_once_released() {
        let store = Arc::new(MemoryStore::new());
        let locks = manager(&store);
        let cal = CalendarKey::new("u1", "primary");

        let held = locks.acquire(&cal, Duration::ZERO).await.unwrap().unwrap();

        let waiter = {
            let locks = locks.clone();
            let cal = cal.clone();
            tokio::spawn(async move { locks.acquire(&cal, Duration::from_secs(2)).await })
        };

        sleep(Duration::from_millis(20)).await;
        locks.release(held).await;

        let acquired = waiter.await.unwrap().unwrap();
        assert!(acquired.is_some());
        locks.release(acquired.unwrap()).await;
    }

    #[tokio::test]
    async fn test_failed_unlock_still_frees_session() {
        let store = Arc::new(MemoryStore::new());
        let locks = manager(&store);
        let cal = CalendarKey::new("u1", "primary");

        let held = locks.acquire(&cal, Duration::ZERO).await.unwrap().unwrap();
        store.fail_next_unlock();
        locks.release(held).await;

        // The discarded session took its lock with it.
        assert_eq!(store.held_lock_count(), 0);
        assert_eq!(store.open_session_count(), 0);
    }
}
