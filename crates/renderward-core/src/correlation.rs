//! Request/response correlation by id
//!
//! A [`Correlator`] owns the table of outstanding requests. Each entry holds
//! the sending half of a one-slot channel; whoever removes the entry from the
//! table is the only party allowed to resolve it, which is what makes every
//! waiter see exactly one reply.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Pending<R> {
    sent_at: Instant,
    timeout: Duration,
    reply: Sender<R>,
}

/// Table of outstanding requests keyed by `K`, resolved with `R`
pub struct Correlator<K, R> {
    pending: Mutex<HashMap<K, Pending<R>>>,
}

/// Waiting side of one registered request
#[derive(Debug)]
pub struct ReplyHandle<K, R> {
    id: K,
    rx: Receiver<R>,
}

/// Outcome of a fulfilled request
#[derive(Debug, Clone, Copy)]
pub struct Delivery {
    pub round_trip: Duration,
}

impl<K, R> Default for Correlator<K, R>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, R> Correlator<K, R>
where
    K: Eq + Hash + Clone,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register `id` and get the handle its reply will arrive on
    ///
    /// A second registration under a live id replaces the first, whose waiter
    /// then sees a disconnected handle.
    pub fn register(&self, id: K, timeout: Duration) -> ReplyHandle<K, R> {
        let (tx, rx) = bounded(1);
        self.pending.lock().insert(
            id.clone(),
            Pending {
                sent_at: Instant::now(),
                timeout,
                reply: tx,
            },
        );
        ReplyHandle { id, rx }
    }

    /// Resolve `id` with `reply`; `None` if nobody is waiting for it
    pub fn fulfill(&self, id: &K, reply: R) -> Option<Delivery> {
        let entry = self.pending.lock().remove(id)?;
        let round_trip = entry.sent_at.elapsed();
        // The waiter may have given up already; the entry is gone either way.
        let _ = entry.reply.try_send(reply);
        Some(Delivery { round_trip })
    }

    /// Drop `id` without resolving it; true if it was still pending
    pub fn cancel(&self, id: &K) -> bool {
        self.pending.lock().remove(id).is_some()
    }

    /// Resolve every entry older than its timeout with `on_timeout(id)`
    ///
    /// Returns the expired ids.
    pub fn expire(&self, mut on_timeout: impl FnMut(&K) -> R) -> Vec<K> {
        let now = Instant::now();
        let expired: Vec<(K, Pending<R>)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<K> = pending
                .iter()
                .filter(|(_, p)| now.duration_since(p.sent_at) > p.timeout)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
                .collect()
        };

        expired
            .into_iter()
            .map(|(id, entry)| {
                let _ = entry.reply.try_send(on_timeout(&id));
                id
            })
            .collect()
    }

    /// Resolve everything still pending with `on_shutdown(id)`
    pub fn fail_all(&self, mut on_shutdown: impl FnMut(&K) -> R) -> usize {
        let drained: Vec<(K, Pending<R>)> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            let _ = entry.reply.try_send(on_shutdown(&id));
        }
        count
    }

    #[must_use]
    pub fn contains(&self, id: &K) -> bool {
        self.pending.lock().contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

impl<K, R> ReplyHandle<K, R>
where
    K: Eq + Hash + Clone,
{
    #[must_use]
    pub const fn id(&self) -> &K {
        &self.id
    }

    /// Block for at most `timeout`
    ///
    /// On expiry the entry is withdrawn from `correlator`. If a reply raced
    /// in between the wait and the withdrawal, that reply is returned instead,
    /// so a waiter never loses a reply that was already delivered to it.
    pub fn wait(self, correlator: &Correlator<K, R>, timeout: Duration) -> Option<R> {
        match self.rx.recv_timeout(timeout) {
            Ok(reply) => Some(reply),
            Err(RecvTimeoutError::Disconnected) => None,
            Err(RecvTimeoutError::Timeout) => {
                if correlator.cancel(&self.id) {
                    None
                } else {
                    self.rx.try_recv().ok()
                }
            }
        }
    }

    /// Take the reply if it has already arrived
    pub fn try_take(&self) -> Option<R> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fulfilled_reply_reaches_its_waiter() {
        let correlator: Correlator<u64, String> = Correlator::new();
        let handle = correlator.register(1, Duration::from_secs(5));
        let delivery = correlator.fulfill(&1, "done".into());
        assert!(delivery.is_some());
        assert_eq!(handle.wait(&correlator, Duration::from_secs(1)).as_deref(), Some("done"));
        assert!(correlator.is_empty());
    }

    #[test]
    fn unknown_id_is_ignored() {
        let correlator: Correlator<u64, u32> = Correlator::new();
        assert!(correlator.fulfill(&99, 1).is_none());
    }

    #[test]
    fn second_fulfillment_is_dropped() {
        let correlator: Correlator<u64, u32> = Correlator::new();
        let handle = correlator.register(5, Duration::from_secs(5));
        assert!(correlator.fulfill(&5, 1).is_some());
        assert!(correlator.fulfill(&5, 2).is_none());
        assert_eq!(handle.wait(&correlator, Duration::from_millis(10)), Some(1));
    }

    #[test]
    fn wait_timeout_withdraws_entry() {
        let correlator: Correlator<u64, u32> = Correlator::new();
        let handle = correlator.register(3, Duration::from_secs(60));
        let started = Instant::now();
        assert_eq!(handle.wait(&correlator, Duration::from_millis(50)), None);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(!correlator.contains(&3));
    }

    #[test]
    fn expire_resolves_only_stale_entries() {
        let correlator: Correlator<u64, &'static str> = Correlator::new();
        let stale = correlator.register(1, Duration::from_millis(1));
        let fresh = correlator.register(2, Duration::from_secs(60));
        thread::sleep(Duration::from_millis(10));

        let expired = correlator.expire(|_| "timeout");
        assert_eq!(expired, vec![1]);
        assert_eq!(stale.try_take(), Some("timeout"));
        assert_eq!(fresh.try_take(), None);
        assert!(correlator.contains(&2));
    }

    #[test]
    fn fail_all_empties_the_table() {
        let correlator: Correlator<String, String> = Correlator::new();
        let a = correlator.register("a".into(), Duration::from_secs(60));
        let b = correlator.register("b".into(), Duration::from_secs(60));
        assert_eq!(correlator.fail_all(|id| format!("{id}: shutdown")), 2);
        assert_eq!(a.try_take().as_deref(), Some("a: shutdown"));
        assert_eq!(b.try_take().as_deref(), Some("b: shutdown"));
        assert!(correlator.is_empty());
    }

    #[test]
    fn concurrent_replies_are_never_cross_delivered() {
        let correlator: Arc<Correlator<u64, u64>> = Arc::new(Correlator::new());
        let handles: Vec<_> = (0..64)
            .map(|id| correlator.register(id, Duration::from_secs(10)))
            .collect();

        let responders: Vec<_> = (0..4)
            .map(|lane| {
                let correlator = Arc::clone(&correlator);
                thread::spawn(move || {
                    for id in (0..64u64).rev().filter(|id| id % 4 == lane) {
                        correlator.fulfill(&id, id * 10);
                    }
                })
            })
            .collect();
        for responder in responders {
            responder.join().unwrap();
        }

        for handle in handles {
            let id = *handle.id();
            assert_eq!(handle.wait(&correlator, Duration::from_secs(1)), Some(id * 10));
        }
        assert!(correlator.is_empty());
    }
}
