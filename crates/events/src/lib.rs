//! In-process fan-out with one bounded mailbox per subscriber.
//!
//! `publish` never waits on a subscriber: when a mailbox is full its oldest
//! event is dropped and the subscriber is told how many it missed through a
//! [`Delivery::Lagged`] marker ahead of its next event.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Delivery<E> {
    Event(E),
    /// This many events were dropped since the last delivery.
    Lagged(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecvError {
    #[error("timed out waiting for an event")]
    Timeout,
    #[error("publisher closed")]
    Closed,
}

struct MailboxState<E> {
    queue: VecDeque<E>,
    capacity: usize,
    lagged: u64,
    dropped_total: u64,
    closed: bool,
}

struct Mailbox<E> {
    state: Mutex<MailboxState<E>>,
    ready: Condvar,
}

impl<E> Mailbox<E> {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(MailboxState {
                queue: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
                capacity,
                lagged: 0,
                dropped_total: 0,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MailboxState<E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true when the oldest event had to be dropped.
    fn push(&self, event: E) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        let dropped_oldest = if state.queue.len() >= state.capacity {
            let _ = state.queue.pop_front();
            state.lagged += 1;
            state.dropped_total += 1;
            true
        } else {
            false
        };
        state.queue.push_back(event);
        drop(state);
        self.ready.notify_one();
        dropped_oldest
    }

    fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }
}

fn take<E>(state: &mut MailboxState<E>) -> Option<Delivery<E>> {
    if state.lagged > 0 {
        let n = state.lagged;
        state.lagged = 0;
        return Some(Delivery::Lagged(n));
    }
    state.queue.pop_front().map(Delivery::Event)
}

struct Registry<E> {
    next_id: u64,
    mailboxes: HashMap<SubscriptionId, Arc<Mailbox<E>>>,
}

impl<E> Drop for Registry<E> {
    fn drop(&mut self) {
        for mailbox in self.mailboxes.values() {
            mailbox.close();
        }
    }
}

/// Cheap to clone; clones share the same subscriber set.
pub struct Publisher<E> {
    registry: Arc<Mutex<Registry<E>>>,
    capacity: usize,
}

impl<E> Clone for Publisher<E> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            capacity: self.capacity,
        }
    }
}

impl<E> Default for Publisher<E> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<E> Publisher<E> {
    /// `capacity` is the per-subscriber mailbox size (at least 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                mailboxes: HashMap::new(),
            })),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry<E>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Receives every event published from now on.
    pub fn subscribe(&self) -> Subscription<E> {
        self.subscribe_with_capacity(self.capacity)
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription<E> {
        let mailbox = Arc::new(Mailbox::new(capacity.max(1)));
        let mut registry = self.lock();
        let id = SubscriptionId(registry.next_id);
        registry.next_id += 1;
        registry.mailboxes.insert(id, Arc::clone(&mailbox));
        debug!(subscription = %id, subscribers = registry.mailboxes.len(), "subscribed");
        Subscription {
            id,
            mailbox,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Same as dropping the handle. Returns false if it was already detached.
    pub fn unsubscribe(&self, subscription: Subscription<E>) -> bool {
        let id = subscription.id;
        let removed = self.lock().mailboxes.remove(&id);
        if let Some(mailbox) = &removed {
            mailbox.close();
        }
        drop(subscription);
        removed.is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().mailboxes.len()
    }
}

impl<E: Clone> Publisher<E> {
    /// Enqueues `event` for every current subscriber and returns how many
    /// received it. Holding the registry lock across the fan-out keeps every
    /// subscriber's view in the same order; each push is O(1).
    pub fn publish(&self, event: E) -> usize {
        let registry = self.lock();
        for (id, mailbox) in &registry.mailboxes {
            if mailbox.push(event.clone()) {
                let dropped = mailbox.lock().dropped_total;
                if dropped.is_power_of_two() {
                    warn!(subscription = %id, dropped, "subscriber mailbox full, dropping oldest");
                }
            }
        }
        registry.mailboxes.len()
    }
}

/// Handle returned by [`Publisher::subscribe`]. Dropping it unsubscribes.
pub struct Subscription<E> {
    id: SubscriptionId,
    mailbox: Arc<Mailbox<E>>,
    registry: Weak<Mutex<Registry<E>>>,
}

impl<E> Subscription<E> {
    pub fn try_recv(&self) -> Option<Delivery<E>> {
        take(&mut *self.mailbox.lock())
    }

    /// Blocks until an event arrives or the publisher goes away.
    pub fn recv(&self) -> Result<Delivery<E>, RecvError> {
        let mut state = self.mailbox.lock();
        loop {
            if let Some(delivery) = take(&mut *state) {
                return Ok(delivery);
            }
            if state.closed {
                return Err(RecvError::Closed);
            }
            state = self
                .mailbox
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Delivery<E>, RecvError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.mailbox.lock();
        loop {
            if let Some(delivery) = take(&mut *state) {
                return Ok(delivery);
            }
            if state.closed {
                return Err(RecvError::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RecvError::Timeout);
            }
            state = self
                .mailbox
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Takes every buffered event. Pending lag is cleared but still counted
    /// in [`Subscription::dropped`].
    pub fn drain(&self) -> Vec<E> {
        let mut state = self.mailbox.lock();
        state.lagged = 0;
        state.queue.drain(..).collect()
    }

    /// Total events dropped for this subscriber because its mailbox was full.
    pub fn dropped(&self) -> u64 {
        self.mailbox.lock().dropped_total
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = registry.lock().unwrap_or_else(PoisonError::into_inner);
            if registry.mailboxes.remove(&self.id).is_some() {
                debug!(subscription = %self.id, "unsubscribed");
            }
        }
        self.mailbox.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn events<E: Clone>(sub: &Subscription<E>) -> Vec<Delivery<E>> {
        std::iter::from_fn(|| sub.try_recv()).collect()
    }

    #[test]
    fn late_subscriber_sees_only_later_events() {
        let publisher = Publisher::new(16);
        let early = publisher.subscribe();
        for i in 0..3 {
            publisher.publish(i);
        }
        let late = publisher.subscribe();
        for i in 3..6 {
            publisher.publish(i);
        }
        assert_eq!(
            events(&early),
            (0..6).map(Delivery::Event).collect::<Vec<_>>()
        );
        assert_eq!(
            events(&late),
            (3..6).map(Delivery::Event).collect::<Vec<_>>()
        );
    }

    #[test]
    fn full_mailbox_drops_oldest_and_reports_lag() {
        let publisher = Publisher::new(2);
        let slow = publisher.subscribe();
        let fast = publisher.subscribe_with_capacity(10);
        for i in 0..5 {
            assert_eq!(publisher.publish(i), 2);
        }
        assert_eq!(slow.dropped(), 3);
        assert_eq!(
            events(&slow),
            vec![Delivery::Lagged(3), Delivery::Event(3), Delivery::Event(4)]
        );
        assert_eq!(fast.dropped(), 0);
        assert_eq!(events(&fast).len(), 5);
        // The lag marker is delivered once.
        publisher.publish(5);
        assert_eq!(events(&slow), vec![Delivery::Event(5)]);
        assert_eq!(slow.dropped(), 3);
    }

    #[test]
    fn unsubscribe_releases_only_that_handle() {
        let publisher = Publisher::new(4);
        let a = publisher.subscribe();
        let b = publisher.subscribe();
        assert_eq!(publisher.subscriber_count(), 2);
        assert!(publisher.unsubscribe(a));
        assert_eq!(publisher.subscriber_count(), 1);
        assert_eq!(publisher.publish("x"), 1);
        assert_eq!(events(&b), vec![Delivery::Event("x")]);
    }

    #[test]
    fn dropping_handle_unsubscribes() {
        let publisher = Publisher::new(4);
        {
            let _sub = publisher.subscribe();
            assert_eq!(publisher.subscriber_count(), 1);
        }
        assert_eq!(publisher.subscriber_count(), 0);
        assert_eq!(publisher.publish(1), 0);
    }

    #[test]
    fn recv_reports_closed_when_publisher_dropped() {
        let publisher = Publisher::new(4);
        let sub = publisher.subscribe();
        publisher.publish(7);
        drop(publisher);
        assert_eq!(sub.recv(), Ok(Delivery::Event(7)));
        assert_eq!(sub.recv(), Err(RecvError::Closed));
    }

    #[test]
    fn recv_timeout_expires() {
        let publisher: Publisher<u8> = Publisher::new(4);
        let sub = publisher.subscribe();
        assert_eq!(
            sub.recv_timeout(Duration::from_millis(10)),
            Err(RecvError::Timeout)
        );
    }

    #[test]
    fn blocked_subscriber_is_woken() {
        let publisher = Publisher::new(4);
        let sub = publisher.subscribe();
        let handle = thread::spawn(move || sub.recv_timeout(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        publisher.publish(42);
        assert_eq!(handle.join().unwrap(), Ok(Delivery::Event(42)));
    }

    #[test]
    fn absent_reader_never_blocks_publish() {
        let publisher = Publisher::new(1);
        let _idle = publisher.subscribe();
        let reader = publisher.subscribe_with_capacity(10_000);
        for i in 0..10_000u32 {
            publisher.publish(i);
        }
        assert_eq!(reader.drain().len(), 10_000);
    }

    #[test]
    fn concurrent_publishers_keep_order_per_subscriber() {
        let publisher = Publisher::new(10_000);
        let a = publisher.subscribe();
        let b = publisher.subscribe();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let publisher = publisher.clone();
                thread::spawn(move || {
                    for i in 0..250u32 {
                        publisher.publish((t, i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let seen_a = a.drain();
        let seen_b = b.drain();
        assert_eq!(seen_a.len(), 1000);
        assert_eq!(seen_a, seen_b);
        for t in 0..4 {
            let per_thread: Vec<u32> = seen_a
                .iter()
                .filter(|(tt, _)| *tt == t)
                .map(|(_, i)| *i)
                .collect();
            assert_eq!(per_thread, (0..250).collect::<Vec<_>>());
        }
    }
}
