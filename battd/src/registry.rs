//! Worker registry and SHA-1 subscription table.
//!
//! One mutex guards both maps. Every critical section is O(1)-ish and never
//! spans I/O; subscription callbacks only enqueue work onto a session's
//! mailbox, so firing them under the lock cannot block.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::session::SessionHandle;

/// Callback fired when a SHA-1 first materializes in the cache. Must not
/// block: implementations enqueue a mailbox event and return.
pub type Callback = Box<dyn FnOnce() + Send>;

/// Identifies one parked callback, so a subscriber that loses the race
/// against the matching ingest can unwind its entry instead of leaking it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionToken(u64);

#[derive(Default)]
struct Inner {
    /// platform ("linux-amd64") -> live sessions serving it.
    workers: HashMap<String, Vec<SessionHandle>>,
    /// sha1 -> callbacks awaiting its arrival in the cache.
    subs: HashMap<String, Vec<(SubscriptionToken, Callback)>>,
    next_token: u64,
}

#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under each of its advertised platforms. A session
    /// with an empty platform list lands under no keys and is unreachable
    /// for builds (observer mode).
    pub fn register(&self, session: &SessionHandle) {
        let mut inner = self.lock();
        for platform in session.platforms() {
            inner
                .workers
                .entry(platform.clone())
                .or_default()
                .push(session.clone());
        }
    }

    /// Remove a session from every platform it was registered under.
    pub fn unregister(&self, session: &SessionHandle) {
        let mut inner = self.lock();
        for platform in session.platforms() {
            if let Some(sessions) = inner.workers.get_mut(platform) {
                sessions.retain(|s| s.id() != session.id());
                if sessions.is_empty() {
                    inner.workers.remove(platform);
                }
            }
        }
    }

    /// Any live session serving `platform`. Repeated calls may return
    /// different sessions; no ordering is promised.
    pub fn worker_for(&self, platform: &str) -> Option<SessionHandle> {
        self.lock().workers.get(platform)?.last().cloned()
    }

    /// Sorted, distinct platforms with at least one live session.
    pub fn platforms(&self) -> Vec<String> {
        let inner = self.lock();
        let mut platforms: Vec<String> = inner
            .workers
            .iter()
            .filter(|(_, sessions)| !sessions.is_empty())
            .map(|(platform, _)| platform.clone())
            .collect();
        platforms.sort();
        platforms
    }

    /// Register a callback for the first cache arrival of `sha1`.
    ///
    /// Each hash is notified at most once. A caller whose cache-miss check
    /// raced the ingest must [`unsubscribe`](Self::unsubscribe) with the
    /// returned token, or its callback sits in the table forever.
    pub fn subscribe(&self, sha1: &str, callback: Callback) -> SubscriptionToken {
        let mut inner = self.lock();
        inner.next_token += 1;
        let token = SubscriptionToken(inner.next_token);
        inner
            .subs
            .entry(sha1.to_string())
            .or_default()
            .push((token, callback));
        token
    }

    /// Remove a parked callback that has not fired. A no-op if `notify`
    /// already drained it.
    pub fn unsubscribe(&self, sha1: &str, token: SubscriptionToken) {
        let mut inner = self.lock();
        let drained = match inner.subs.get_mut(sha1) {
            Some(callbacks) => {
                callbacks.retain(|(t, _)| *t != token);
                callbacks.is_empty()
            }
            None => false,
        };
        if drained {
            inner.subs.remove(sha1);
        }
    }

    /// Fire and remove every callback waiting on `sha1`. Called by the
    /// ingest path after the cache entry is fully written, still under this
    /// lock, so no reader can observe the file before its waiters drain.
    pub fn notify(&self, sha1: &str) {
        let mut inner = self.lock();
        if let Some(callbacks) = inner.subs.remove(sha1) {
            for (_, callback) in callbacks {
                callback();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self, sha1: &str) -> usize {
        self.lock().subs.get(sha1).map_or(0, Vec::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Holders never panic while holding the lock; recover anyway rather
        // than poisoning every future request.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
