//! In-process pub/sub hub.
//!
//! Each subscriber owns a bounded channel. `publish` uses `try_send` only:
//! a full channel marks the subscriber overflowed and drops its sender, so
//! the subscriber drains what is buffered and then sees `Overflow`.

use super::{Category, Event};
use crate::core::error::{BulletinError, BulletinResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Default per-subscriber buffer.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 100;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
    overflowed: Arc<AtomicBool>,
}

#[derive(Default)]
struct Registry {
    closed: bool,
    next_id: u64,
    subscribers: HashMap<Category, Vec<Subscriber>>,
}

/// Hub counters.
#[derive(Debug, Default)]
pub struct HubStats {
    /// Events accepted by `publish`.
    pub published: AtomicU64,
    /// Individual deliveries into subscriber buffers.
    pub delivered: AtomicU64,
    /// Subscribers disconnected for falling behind.
    pub overflowed: AtomicU64,
    /// Subscribers pruned after dropping their source.
    pub pruned: AtomicU64,
}

/// Fan-out hub for state-change events.
pub struct EventHub {
    registry: Mutex<Registry>,
    buffer: usize,
    stats: HubStats,
}

impl EventHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            buffer: buffer.max(1),
            stats: HubStats::default(),
        }
    }

    pub fn buffer(&self) -> usize {
        self.buffer
    }

    pub fn stats(&self) -> &HubStats {
        &self.stats
    }

    /// Register a subscriber for one category.
    pub fn subscribe(&self, category: Category) -> BulletinResult<EventSource> {
        let mut registry = self.registry.lock();
        if registry.closed {
            return Err(BulletinError::HubClosed);
        }
        let (tx, rx) = mpsc::channel(self.buffer);
        let overflowed = Arc::new(AtomicBool::new(false));
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .subscribers
            .entry(category)
            .or_default()
            .push(Subscriber {
                id,
                tx,
                overflowed: overflowed.clone(),
            });
        tracing::debug!(category = %category, subscriber = id, "subscriber registered");
        Ok(EventSource {
            id,
            category,
            rx,
            overflowed,
        })
    }

    /// Deliver an event to every subscriber of `category` without waiting.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, category: Category, event: Event) -> BulletinResult<usize> {
        let mut registry = self.registry.lock();
        if registry.closed {
            return Err(BulletinError::HubClosed);
        }
        self.stats.published.fetch_add(1, Ordering::Relaxed);

        let Some(subscribers) = registry.subscribers.get_mut(&category) else {
            return Ok(0);
        };

        let mut delivered = 0;
        subscribers.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                sub.overflowed.store(true, Ordering::Release);
                self.stats.overflowed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    category = %category,
                    subscriber = sub.id,
                    "subscriber buffer full, disconnecting"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.pruned.fetch_add(1, Ordering::Relaxed);
                false
            }
        });
        self.stats
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        Ok(delivered)
    }

    /// Current subscribers for a category.
    ///
    /// Subscribers whose source was dropped are counted until the next publish.
    pub fn subscriber_count(&self, category: Category) -> usize {
        self.registry
            .lock()
            .subscribers
            .get(&category)
            .map_or(0, Vec::len)
    }

    /// End every subscription and reject further use.
    pub fn close(&self) {
        let mut registry = self.registry.lock();
        if registry.closed {
            return;
        }
        registry.closed = true;
        let dropped: usize = registry.subscribers.values().map(Vec::len).sum();
        registry.subscribers.clear();
        tracing::info!(subscribers = dropped, "event hub closed");
    }

    pub fn is_closed(&self) -> bool {
        self.registry.lock().closed
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

/// Receiving side of a subscription.
pub struct EventSource {
    id: u64,
    category: Category,
    rx: mpsc::Receiver<Event>,
    overflowed: Arc<AtomicBool>,
}

impl EventSource {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn category(&self) -> Category {
        self.category
    }

    fn end_reason(&self) -> BulletinError {
        if self.overflowed.load(Ordering::Acquire) {
            BulletinError::Overflow
        } else {
            BulletinError::HubClosed
        }
    }

    /// Next event, in publish order.
    ///
    /// After disconnection the remaining buffered events are still returned;
    /// then every call fails with `Overflow` or `HubClosed`.
    pub async fn next(&mut self) -> BulletinResult<Event> {
        match self.rx.recv().await {
            Some(event) => Ok(event),
            None => Err(self.end_reason()),
        }
    }

    /// Non-blocking variant of [`next`](Self::next). `None` when nothing is
    /// buffered and the subscription is still live.
    pub fn try_next(&mut self) -> Option<BulletinResult<Event>> {
        match self.rx.try_recv() {
            Ok(event) => Some(Ok(event)),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => Some(Err(self.end_reason())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let hub = EventHub::new(4);
        assert_eq!(hub.publish(Category::Desired, Event::removed("k", 1)).unwrap(), 0);
        assert_eq!(hub.stats().published.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_dropped_source_is_pruned_on_publish() {
        let hub = EventHub::new(4);
        let source = hub.subscribe(Category::Actual).unwrap();
        assert_eq!(hub.subscriber_count(Category::Actual), 1);
        drop(source);
        hub.publish(Category::Actual, Event::removed("k", 1)).unwrap();
        assert_eq!(hub.subscriber_count(Category::Actual), 0);
        assert_eq!(hub.stats().pruned.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_categories_are_isolated() {
        let hub = EventHub::new(4);
        let mut desired = hub.subscribe(Category::Desired).unwrap();
        hub.publish(Category::Actual, Event::removed("a", 1)).unwrap();
        assert!(desired.try_next().is_none());
    }
}
