// Keyed live-value registrations backing the store's watch_* operations
//
// Every key owns one watch channel carrying the full current value. A
// `Subscription` is a receiver on that channel; dropping the last one for a
// key removes the key, so a torn-down view leaves nothing behind.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use futures::Stream;
use log::debug;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

type Registry<T> = Arc<Mutex<HashMap<String, watch::Sender<T>>>>;

pub struct SubscriptionHub<T> {
    name: &'static str,
    entries: Registry<T>,
}

impl<T: Clone + Send + Sync + 'static> SubscriptionHub<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a new receiver for `key`. `current` is the freshly loaded
    /// value and replaces whatever the channel held before.
    pub fn subscribe(&self, key: &str, current: T) -> Subscription<T> {
        let mut entries = lock(&self.entries);
        let receiver = match entries.get(key) {
            Some(sender) => {
                sender.send_replace(current);
                sender.subscribe()
            }
            None => {
                let (sender, receiver) = watch::channel(current);
                entries.insert(key.to_string(), sender);
                receiver
            }
        };
        debug!("[{}] subscribed to {}", self.name, key);
        Subscription {
            receiver,
            release: Release {
                key: key.to_string(),
                entries: Arc::clone(&self.entries),
            },
        }
    }

    /// Replace the value seen by every subscriber of `key`.
    pub fn publish(&self, key: &str, value: T) {
        let mut entries = lock(&self.entries);
        if let Some(sender) = entries.get(key) {
            if sender.receiver_count() == 0 {
                entries.remove(key);
                return;
            }
            sender.send_replace(value);
        }
    }

    pub fn is_watched(&self, key: &str) -> bool {
        lock(&self.entries)
            .get(key)
            .map(|sender| sender.receiver_count() > 0)
            .unwrap_or(false)
    }

    /// Number of live subscriptions for `key`
    pub fn active(&self, key: &str) -> usize {
        lock(&self.entries)
            .get(key)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Number of keys with at least one registration
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<T>(entries: &Mutex<HashMap<String, watch::Sender<T>>>) -> std::sync::MutexGuard<'_, HashMap<String, watch::Sender<T>>> {
    // A poisoned registry only means a panicking subscriber; the map itself is intact
    entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A live view of one key. Dropping it unsubscribes.
pub struct Subscription<T> {
    // Dropped before `release`, so the release check sees the final count
    receiver: watch::Receiver<T>,
    release: Release<T>,
}

impl<T: Clone + Send + Sync + 'static> Subscription<T> {
    pub fn key(&self) -> &str {
        &self.release.key
    }

    /// The latest delivered value
    pub fn current(&self) -> T {
        self.receiver.borrow().clone()
    }

    /// Wait for the next value. Returns `None` once the store is gone.
    pub async fn changed(&mut self) -> Option<T> {
        match self.receiver.changed().await {
            Ok(()) => Some(self.receiver.borrow_and_update().clone()),
            Err(_) => None,
        }
    }

    /// Stream of values starting with the current one; unsubscribes when dropped.
    pub fn into_stream(self) -> Pin<Box<dyn Stream<Item = T> + Send>> {
        let Subscription { receiver, release } = self;
        Box::pin(GuardedStream {
            inner: WatchStream::new(receiver),
            _release: release,
        })
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

struct Release<T> {
    key: String,
    entries: Registry<T>,
}

impl<T> Drop for Release<T> {
    fn drop(&mut self) {
        let mut entries = lock(&self.entries);
        let unwatched = entries
            .get(&self.key)
            .map(|sender| sender.receiver_count() == 0)
            .unwrap_or(false);
        if unwatched {
            entries.remove(&self.key);
            debug!("released last subscription for {}", self.key);
        }
    }
}

struct GuardedStream<T> {
    inner: WatchStream<T>,
    _release: Release<T>,
}

impl<T: Clone + Send + Sync + 'static> Stream for GuardedStream<T> {
    type Item = T;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<T>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
