//! Concurrency primitives shared by every worker
//!
//! - [`GuardedMap`]: a map whose multi-step operations run under one lock
//! - [`Counter`]: atomic counter minting message, session and connection ids
//! - [`Promise`]: write-once value with blocking or non-blocking reads
//! - [`Signal`]: cancellation signal derived from a parent, with an optional deadline

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Mutex-guarded hash map.
///
/// Every check-then-act sequence must happen inside a single [`GuardedMap::with`]
/// (or a single held [`GuardedMap::lock`] guard). The lock is synchronous and
/// must never be held across an `.await`.
#[derive(Debug)]
pub struct GuardedMap<K, V> {
    inner: Mutex<HashMap<K, V>>,
}

impl<K: Eq + Hash, V> GuardedMap<K, V> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the lock; released when the guard drops
    pub fn lock(&self) -> MutexGuard<'_, HashMap<K, V>> {
        self.inner.lock()
    }

    /// Run `f` with exclusive access to the map
    pub fn with<R>(&self, f: impl FnOnce(&mut HashMap<K, V>) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.inner.lock().insert(key, value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().remove(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl<K: Eq + Hash, V: Clone> GuardedMap<K, V> {
    pub fn get_cloned(&self, key: &K) -> Option<V> {
        self.inner.lock().get(key).cloned()
    }

    /// Return the value at `key`, inserting `make()` first if absent
    pub fn get_or_insert_with(&self, key: K, make: impl FnOnce() -> V) -> V {
        self.inner.lock().entry(key).or_insert_with(make).clone()
    }
}

impl<K: Eq + Hash, V> Default for GuardedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Atomic 64-bit counter. Increments wrap; decrements saturate at zero.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new(start: u64) -> Self {
        Self {
            value: AtomicU64::new(start),
        }
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Increment and return the new value
    pub fn inc(&self) -> u64 {
        self.value.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    /// Decrement (saturating) and return the new value
    pub fn dec(&self) -> u64 {
        let previous = self
            .value
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::SeqCst);
    }
}

/// Thread-safe value awaiting a single assignment
#[derive(Debug)]
pub struct Promise<T> {
    slot: watch::Sender<Option<T>>,
}

impl<T: Clone> Promise<T> {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self { slot }
    }

    /// Assign the value. Returns false if it was already assigned.
    pub fn resolve(&self, value: T) -> bool {
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Non-blocking read; fails with [`Error::Unresolved`] before assignment
    pub fn try_get(&self) -> Result<T> {
        self.slot.borrow().clone().ok_or(Error::Unresolved)
    }

    /// Wait for the value, optionally bounded by `timeout`
    pub async fn get(&self, timeout: Option<Duration>) -> Result<T> {
        let mut rx = self.slot.subscribe();
        let wait = async {
            rx.wait_for(|slot| slot.is_some())
                .await
                .map(|slot| slot.clone())
                .map_err(|_| Error::Unresolved)
        };
        let value = match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| Error::timeout("promise was not resolved in time"))??,
            None => wait.await?,
        };
        value.ok_or(Error::Unresolved)
    }
}

impl<T: Clone> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellation signal with an optional parent and deadline.
///
/// Triggered when the parent is triggered, when [`Signal::trigger`] is called
/// on this signal (or an ancestor), or when the deadline has passed.
/// Triggering a derived signal never affects its parent.
#[derive(Debug, Clone)]
pub struct Signal {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Signal {
    /// New root signal
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Child signal with its own local trigger, inheriting the deadline
    pub fn derive(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Child signal that also fires `timeout` from now
    pub fn derive_with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            token: self.token.child_token(),
            deadline: Some(match self.deadline {
                Some(parent) => parent.min(deadline),
                None => deadline,
            }),
        }
    }

    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled() || self.is_expired()
    }

    fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the signal is triggered
    pub async fn triggered(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Run `fut` until it completes or the signal fires.
    ///
    /// Fails with [`Error::Timeout`] if the deadline fired and
    /// [`Error::Cancelled`] otherwise.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output> {
        tokio::select! {
            biased;
            _ = self.triggered() => Err(self.reason()),
            out = fut => Ok(out),
        }
    }

    fn reason(&self) -> Error {
        if !self.token.is_cancelled() && self.is_expired() {
            Error::timeout("deadline elapsed")
        } else {
            Error::Cancelled
        }
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a fallible worker. An error is logged and triggers `signal`,
/// so a fatal failure in one worker stops the whole process role.
pub fn spawn_supervised<F>(name: impl Into<String>, signal: Signal, task: F) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let name = name.into();
    tokio::spawn(async move {
        if let Err(e) = task.await {
            tracing::error!(worker = %name, error = %e, "Worker failed, triggering shutdown");
            signal.trigger();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counter() {
        let counter = Counter::new(0);
        assert_eq!(counter.inc(), 1);
        assert_eq!(counter.inc(), 2);
        assert_eq!(counter.dec(), 1);
        assert_eq!(counter.dec(), 0);
        assert_eq!(counter.dec(), 0);
        counter.set(u64::MAX);
        assert_eq!(counter.inc(), 0);
    }

    #[test]
    fn test_guarded_map_check_then_insert() {
        let map: GuardedMap<&str, u32> = GuardedMap::new();
        assert_eq!(map.get_or_insert_with("a", || 1), 1);
        assert_eq!(map.get_or_insert_with("a", || 2), 1);
        let inserted = map.with(|m| {
            if m.contains_key("b") {
                return false;
            }
            m.insert("b", 3);
            true
        });
        assert!(inserted);
        assert_eq!(map.len(), 2);
        assert_eq!(map.remove(&"a"), Some(1));
        assert!(!map.contains_key(&"a"));
    }

    #[tokio::test]
    async fn test_promise_non_blocking_before_resolve() {
        let promise: Promise<u32> = Promise::new();
        assert!(matches!(promise.try_get(), Err(Error::Unresolved)));
        assert!(promise.resolve(7));
        assert!(!promise.resolve(8));
        assert_eq!(promise.try_get().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_promise_blocking_get() {
        let promise = Arc::new(Promise::new());
        let writer = promise.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.resolve("done".to_string());
        });
        let value = promise.get(Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(value, "done");
    }

    #[tokio::test]
    async fn test_promise_timeout() {
        let promise: Promise<u8> = Promise::new();
        let result = promise.get(Some(Duration::from_millis(20))).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_derived_signal_follows_parent() {
        let parent = Signal::new();
        let child = parent.derive();
        assert!(!child.is_triggered());
        parent.trigger();
        assert!(child.is_triggered());
    }

    #[tokio::test]
    async fn test_derived_signal_does_not_trigger_parent() {
        let parent = Signal::new();
        let child = parent.derive();
        child.trigger();
        assert!(child.is_triggered());
        assert!(!parent.is_triggered());
    }

    #[tokio::test]
    async fn test_signal_deadline() {
        let parent = Signal::new();
        let timed = parent.derive_with_timeout(Duration::from_millis(20));
        assert!(!timed.is_triggered());
        timed.triggered().await;
        assert!(timed.is_triggered());
        assert!(!parent.is_triggered());
    }

    #[tokio::test]
    async fn test_guard_reports_reason() {
        let timed = Signal::new().derive_with_timeout(Duration::from_millis(10));
        let result = timed.guard(std::future::pending::<()>()).await;
        assert!(matches!(result, Err(Error::Timeout(_))));

        let cancelled = Signal::new();
        cancelled.trigger();
        let result = cancelled.guard(async { 1 }).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_supervised_failure_triggers_signal() {
        let signal = Signal::new();
        let handle = spawn_supervised("failing", signal.clone(), async {
            Err(Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "boom")))
        });
        handle.await.unwrap();
        assert!(signal.is_triggered());
    }
}
