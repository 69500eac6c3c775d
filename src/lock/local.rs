//! In-process entity lock
//!
//! Each contended name gets a slot with its current holder and a bounded
//! FIFO queue of waiting acquirers. Uncontended names never leave a slot
//! behind: a release with nobody waiting drops the slot.
//!
//! Waiters sleep on a [`Notify`] with an absolute deadline. A release wakes
//! all of them and only the head of the queue claims the lock. A waiter whose
//! future is dropped leaves the queue and wakes the rest, so cancellation
//! cannot strand the lock.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Lock, LockConfig, LockToken};
use crate::error::LockError;
use crate::metrics::record_lock_failure;

#[derive(Debug)]
struct SlotState {
    holder: Option<u64>,
    waiters: VecDeque<u64>,
}

#[derive(Debug)]
struct Slot {
    state: Mutex<SlotState>,
    notify: Notify,
}

impl Slot {
    fn held_by(id: u64) -> Self {
        Self {
            state: Mutex::new(SlotState {
                holder: Some(id),
                waiters: VecDeque::new(),
            }),
            notify: Notify::new(),
        }
    }
}

/// Lock for writers inside one process
#[derive(Debug)]
pub struct LocalLock {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
    next_id: AtomicU64,
    max_waiters: usize,
    max_wait: Duration,
}

impl LocalLock {
    /// Create a lock allowing `max_waiters` queued acquirers per name, each
    /// waiting at most `max_wait`
    pub fn new(max_waiters: usize, max_wait: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_waiters,
            max_wait,
        }
    }

    /// Create from config
    pub fn from_config(config: &LockConfig) -> Self {
        Self::new(config.max_waiters, config.max_wait())
    }

    /// Number of names with a live slot (held or waited on)
    pub fn active_keys(&self) -> usize {
        self.slots.lock().len()
    }

    /// Number of acquirers queued on `name`
    pub fn waiting(&self, name: &str) -> usize {
        self.slots
            .lock()
            .get(name)
            .map(|slot| slot.state.lock().waiters.len())
            .unwrap_or(0)
    }

    fn token(id: u64) -> LockToken {
        LockToken::new(id.to_string())
    }
}

impl Default for LocalLock {
    fn default() -> Self {
        Self::from_config(&LockConfig::default())
    }
}

/// A queued acquirer; leaves the queue on drop unless it claimed the lock
struct Waiter<'a> {
    lock: &'a LocalLock,
    name: &'a str,
    slot: Arc<Slot>,
    id: u64,
    claimed: bool,
}

impl Waiter<'_> {
    fn try_claim(&mut self) -> bool {
        let mut state = self.slot.state.lock();
        if state.holder.is_some() || state.waiters.front() != Some(&self.id) {
            return false;
        }
        state.waiters.pop_front();
        state.holder = Some(self.id);
        drop(state);
        self.claimed = true;
        true
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.claimed {
            return;
        }
        let mut slots = self.lock.slots.lock();
        let mut state = self.slot.state.lock();
        let id = self.id;
        state.waiters.retain(|w| *w != id);

        if state.holder.is_none() {
            if state.waiters.is_empty() {
                let ours = slots
                    .get(self.name)
                    .is_some_and(|current| Arc::ptr_eq(current, &self.slot));
                drop(state);
                if ours {
                    slots.remove(self.name);
                }
            } else {
                self.slot.notify.notify_waiters();
            }
        }
    }
}

#[async_trait]
impl Lock for LocalLock {
    async fn acquire(&self, name: &str) -> Result<Option<LockToken>, LockError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let slot = {
            let mut slots = self.slots.lock();
            match slots.get(name) {
                None => {
                    slots.insert(name.to_string(), Arc::new(Slot::held_by(id)));
                    return Ok(Some(Self::token(id)));
                },
                Some(slot) => {
                    let mut state = slot.state.lock();
                    if state.holder.is_none() && state.waiters.is_empty() {
                        state.holder = Some(id);
                        return Ok(Some(Self::token(id)));
                    }
                    if state.waiters.len() >= self.max_waiters {
                        record_lock_failure("queue_full");
                        tracing::debug!(lock = name, waiters = state.waiters.len(), "Lock wait queue full");
                        return Ok(None);
                    }
                    state.waiters.push_back(id);
                    Arc::clone(slot)
                },
            }
        };

        let mut waiter = Waiter {
            lock: self,
            name,
            slot,
            id,
            claimed: false,
        };
        let deadline = Instant::now() + self.max_wait;

        let slot = Arc::clone(&waiter.slot);
        loop {
            // Registered before the check so a release in between is not missed
            let notified = slot.notify.notified();
            if waiter.try_claim() {
                return Ok(Some(Self::token(id)));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                if waiter.try_claim() {
                    return Ok(Some(Self::token(id)));
                }
                record_lock_failure("wait_timeout");
                tracing::debug!(lock = name, "Timed out waiting for lock");
                return Ok(None);
            }
        }
    }

    async fn release(&self, name: &str, token: LockToken) -> Result<(), LockError> {
        let id: u64 = token
            .as_str()
            .parse()
            .map_err(|_| LockError::NotOwner(name.to_string()))?;

        let mut slots = self.slots.lock();
        let slot = slots
            .get(name)
            .cloned()
            .ok_or_else(|| LockError::NotOwner(name.to_string()))?;
        let mut state = slot.state.lock();

        if state.holder != Some(id) {
            record_lock_failure("not_owner");
            return Err(LockError::NotOwner(name.to_string()));
        }

        state.holder = None;
        if state.waiters.is_empty() {
            drop(state);
            slots.remove(name);
        } else {
            slot.notify.notify_waiters();
        }
        Ok(())
    }

    fn delay(&self) -> Duration {
        Duration::ZERO
    }

    fn kind(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn test_uncontended_acquire_and_release() {
        let lock = LocalLock::default();

        let token = lock.acquire("e1").await.unwrap().expect("free lock");
        assert_eq!(lock.active_keys(), 1);

        lock.release("e1", token).await.unwrap();
        assert_eq!(lock.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_different_names_do_not_contend() {
        let lock = LocalLock::new(4, Duration::from_millis(10));
        let a = lock.acquire("a").await.unwrap();
        let b = lock.acquire("b").await.unwrap();
        assert!(a.is_some());
        assert!(b.is_some());
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let lock = Arc::new(LocalLock::new(4, Duration::from_secs(5)));
        let token = lock.acquire("e1").await.unwrap().unwrap();

        let contender = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move { lock.acquire("e1").await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(lock.waiting("e1"), 1);

        lock.release("e1", token).await.unwrap();
        let second = contender.await.unwrap().unwrap().expect("handed over");

        lock.release("e1", second).await.unwrap();
        assert_eq!(lock.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let lock = LocalLock::new(4, Duration::from_millis(30));
        let _held = lock.acquire("e1").await.unwrap().unwrap();

        let started = std::time::Instant::now();
        assert!(lock.acquire("e1").await.unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(lock.waiting("e1"), 0);
    }

    #[tokio::test]
    async fn test_full_queue_fails_immediately() {
        let lock = Arc::new(LocalLock::new(1, Duration::from_secs(5)));
        let token = lock.acquire("e1").await.unwrap().unwrap();

        let queued = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move { lock.acquire("e1").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        assert!(lock.acquire("e1").await.unwrap().is_none());
        assert!(started.elapsed() < Duration::from_secs(1));

        lock.release("e1", token).await.unwrap();
        let next = queued.await.unwrap().unwrap().unwrap();
        lock.release("e1", next).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_requires_ownership() {
        let lock = LocalLock::default();
        let token = lock.acquire("e1").await.unwrap().unwrap();

        let err = lock.release("e1", LockToken::new("999999")).await.unwrap_err();
        assert_eq!(err, LockError::NotOwner("e1".into()));

        let err = lock.release("other", token.clone()).await.unwrap_err();
        assert_eq!(err, LockError::NotOwner("other".into()));

        lock.release("e1", token.clone()).await.unwrap();
        assert!(lock.release("e1", token).await.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_queue() {
        let lock = Arc::new(LocalLock::new(4, Duration::from_secs(5)));
        let token = lock.acquire("e1").await.unwrap().unwrap();

        let waiter = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move { lock.acquire("e1").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(lock.waiting("e1"), 1);

        waiter.abort();
        let _ = waiter.await;
        assert_eq!(lock.waiting("e1"), 0);

        lock.release("e1", token).await.unwrap();
        assert_eq!(lock.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_waiters_are_served_in_arrival_order() {
        let lock = Arc::new(LocalLock::new(8, Duration::from_secs(5)));
        let token = lock.acquire("e1").await.unwrap().unwrap();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for i in 0..4 {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let token = lock.acquire("e1").await.unwrap().expect("handed over");
                order.lock().push(i);
                lock.release("e1", token).await.unwrap();
            }));
            // Queue position follows spawn order
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(lock.waiting("e1"), 4);

        lock.release("e1", token).await.unwrap();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
        assert_eq!(lock.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_queued_waiters_time_out_cleanly() {
        let lock = Arc::new(LocalLock::new(8, Duration::from_millis(40)));
        let token = lock.acquire("e1").await.unwrap().unwrap();

        let first = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move { lock.acquire("e1").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move { lock.acquire("e1").await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Nobody releases: both give up, neither ends up holding the lock
        assert!(first.await.unwrap().unwrap().is_none());
        assert!(second.await.unwrap().unwrap().is_none());
        assert_eq!(lock.waiting("e1"), 0);

        lock.release("e1", token).await.unwrap();
        assert_eq!(lock.active_keys(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mutual_exclusion_under_contention() {
        let lock = Arc::new(LocalLock::new(64, Duration::from_secs(10)));
        let inside = Arc::new(AtomicBool::new(false));
        let counter = Arc::new(AtomicU64::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            let counter = Arc::clone(&counter);
            tasks.push(tokio::spawn(async move {
                for _ in 0..25 {
                    let token = lock.acquire("hot").await.unwrap().expect("acquired");
                    assert!(!inside.swap(true, Ordering::SeqCst), "two holders at once");
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    inside.store(false, Ordering::SeqCst);
                    lock.release("hot", token).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 200);
        assert_eq!(lock.active_keys(), 0);
    }
}
