//! Push notification paths layered over the polled mailbox.
//!
//! Polling is the delivery floor. These paths only cut latency for consumers
//! in the same process:
//!
//! - [`ChangeFeed`]: storage-change notification carrying the old and new
//!   mailbox value, like a browser `storage` event dispatched by the writer.
//! - [`BroadcastHub`]: named channels delivering the single sent [`Message`],
//!   like a `BroadcastChannel`.
//!
//! Each notifier is called independently and is fire-and-forget. Listener
//! registrations return a [`Subscription`] that detaches on drop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use pairing_protocol::Message;

use crate::error::{PairingError, Result};

/// What the relay hands every notifier after a successful write.
#[derive(Debug, Clone)]
pub struct RelayNotice {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: String,
    pub message: Message,
}

pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;
    fn notify(&self, notice: &RelayNotice) -> Result<()>;
}

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ListenerSet<T> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
}

impl<T> Default for ListenerSet<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl<T: 'static> ListenerSet<T> {
    fn add(self: &Arc<Self>, listener: Listener<T>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push((id, listener));
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(set) = weak.upgrade() {
                if let Ok(mut listeners) = set.listeners.lock() {
                    listeners.retain(|(existing, _)| *existing != id);
                }
            }
        })
    }

    /// Calls every listener outside the lock, so a listener may unsubscribe.
    fn emit(&self, value: &T, what: &'static str) -> Result<usize> {
        let snapshot: Vec<Listener<T>> = self
            .listeners
            .lock()
            .map_err(|_| PairingError::Poisoned(what))?
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in &snapshot {
            listener(value);
        }
        Ok(snapshot.len())
    }

    fn len(&self) -> usize {
        self.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }
}

/// Detaches its listener when dropped or unsubscribed.
#[must_use = "dropping a Subscription detaches the listener"]
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Storage-change feed
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

#[derive(Clone, Default)]
pub struct ChangeFeed {
    listeners: Arc<ListenerSet<StorageChange>>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: impl Fn(&StorageChange) + Send + Sync + 'static) -> Subscription {
        self.listeners.add(Arc::new(listener))
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl Notifier for ChangeFeed {
    fn name(&self) -> &'static str {
        "change_feed"
    }

    fn notify(&self, notice: &RelayNotice) -> Result<()> {
        let change = StorageChange {
            key: notice.key.clone(),
            old_value: notice.old_value.clone(),
            new_value: Some(notice.new_value.clone()),
        };
        self.listeners.emit(&change, "change feed")?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Broadcast channels
// ═══════════════════════════════════════════════════════════════════════════════

/// Registry of named broadcast channels. Channels with the same name obtained
/// from one hub reach each other's subscribers.
#[derive(Clone, Default)]
pub struct BroadcastHub {
    channels: Arc<Mutex<HashMap<String, Arc<ListenerSet<Message>>>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self, name: &str) -> Result<BroadcastChannel> {
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| PairingError::Poisoned("broadcast hub"))?;
        let listeners = channels
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ListenerSet::default()));
        Ok(BroadcastChannel {
            name: name.to_string(),
            listeners: Arc::clone(listeners),
        })
    }
}

#[derive(Clone)]
pub struct BroadcastChannel {
    name: String,
    listeners: Arc<ListenerSet<Message>>,
}

impl BroadcastChannel {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns how many listeners received the message.
    pub fn post_message(&self, message: &Message) -> Result<usize> {
        self.listeners.emit(message, "broadcast channel")
    }

    pub fn subscribe(&self, listener: impl Fn(&Message) + Send + Sync + 'static) -> Subscription {
        self.listeners.add(Arc::new(listener))
    }
}

impl Notifier for BroadcastChannel {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    fn notify(&self, notice: &RelayNotice) -> Result<()> {
        self.post_message(&notice.message)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairing_protocol::MessageType;
    use std::sync::atomic::AtomicUsize;

    fn notice() -> RelayNotice {
        RelayNotice {
            key: "k".to_string(),
            old_value: None,
            new_value: "[]".to_string(),
            message: Message::new(MessageType::Connected, "s", 1),
        }
    }

    #[test]
    fn test_change_feed_delivers_new_value() {
        let feed = ChangeFeed::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = feed.subscribe(move |change| sink.lock().unwrap().push(change.clone()));
        feed.notify(&notice()).unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].new_value.as_deref(), Some("[]"));
    }

    #[test]
    fn test_dropping_subscription_detaches() {
        let feed = ChangeFeed::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let sub = feed.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(feed.listener_count(), 1);
        feed.notify(&notice()).unwrap();
        drop(sub);
        assert_eq!(feed.listener_count(), 0);
        feed.notify(&notice()).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_broadcast_reaches_channels_with_same_name_only() {
        let hub = BroadcastHub::new();
        let sender = hub.channel("verimezk_phone_messages").unwrap();
        let receiver = hub.channel("verimezk_phone_messages").unwrap();
        let other = hub.channel("other").unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let _a = receiver.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&hits);
        let _b = other.subscribe(move |_| {
            counter.fetch_add(100, Ordering::SeqCst);
        });

        sender.notify(&notice()).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_after_hub_dropped_is_harmless() {
        let hub = BroadcastHub::new();
        let channel = hub.channel("c").unwrap();
        let sub = channel.subscribe(|_| {});
        drop(hub);
        drop(channel);
        sub.unsubscribe();
    }
}
