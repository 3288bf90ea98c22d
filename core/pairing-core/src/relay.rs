//! Shared mailbox between the phone (producer) and the desktop (consumer).
//!
//! The mailbox is a JSON array stored under [`MAILBOX_KEY`] in a store both
//! sides can reach. Producers append, the consumer reads without removing and
//! purges by session once a message is consumed.
//!
//! # Write path
//!
//! Every `send` is a non-atomic read-modify-write:
//!
//! ```text
//! load mailbox → drop duplicate? → replace stale `connected` → append → keep last N → store → notify
//! ```
//!
//! Concurrent writers can lose updates. That is tolerated: volume is small,
//! consumption is idempotent and each session has a single phone writing.
//!
//! # Failure policy
//!
//! Nothing here returns an error. Unreadable storage reads as an empty
//! mailbox, a failed write is logged, and notifier failures are logged and
//! never affect the stored write or the other notifiers.

use std::sync::Arc;

use pairing_protocol::{mailbox_entries, Message, MessageType, MAILBOX_KEY};
use serde_json::Value;

use crate::config::PairingConfig;
use crate::notify::{Notifier, RelayNotice};
use crate::session::short_id;
use crate::storage::KeyValueStore;

/// One mailbox slot. Entries this build cannot decode are kept verbatim so a
/// write never drops another producer's messages.
struct Entry {
    raw: Value,
    message: Option<Message>,
}

impl Entry {
    fn from_raw(raw: Value) -> Self {
        let message = serde_json::from_value(raw.clone()).ok();
        Self { raw, message }
    }

    fn is(&self, session_id: &str, message_type: MessageType) -> bool {
        self.message
            .as_ref()
            .map(|m| m.session_id == session_id && m.message_type == message_type)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Stored,
    Duplicate,
    Failed,
}

pub struct MessageRelay<S> {
    store: S,
    capacity: usize,
    dedup_window_ms: u64,
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl<S: KeyValueStore> MessageRelay<S> {
    pub fn new(store: S, config: &PairingConfig) -> Self {
        Self {
            store,
            capacity: config.mailbox_capacity.max(1),
            dedup_window_ms: config.dedup_window_ms,
            notifiers: Vec::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn send(&self, message: Message) -> SendOutcome {
        let (old_value, mut entries) = self.load();

        if self.is_duplicate(&entries, &message) {
            tracing::trace!(
                message_type = %message.message_type,
                session = %short_id(&message.session_id),
                "Duplicate message skipped"
            );
            return SendOutcome::Duplicate;
        }

        if message.message_type == MessageType::Connected {
            entries.retain(|existing| !existing.is(&message.session_id, MessageType::Connected));
        }
        let raw = match serde_json::to_value(&message) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to serialize message");
                return SendOutcome::Failed;
            }
        };
        entries.push(Entry {
            raw,
            message: Some(message.clone()),
        });

        if entries.len() > self.capacity {
            let overflow = entries.len() - self.capacity;
            entries.drain(..overflow);
        }

        let new_value = match encode(&entries) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to serialize mailbox");
                return SendOutcome::Failed;
            }
        };
        if let Err(err) = self.store.set(MAILBOX_KEY, &new_value) {
            tracing::warn!(error = %err, message_type = %message.message_type, "Failed to send message");
            return SendOutcome::Failed;
        }

        tracing::debug!(
            message_type = %message.message_type,
            session = %short_id(&message.session_id),
            timestamp = message.timestamp,
            mailbox_len = entries.len(),
            "Message sent"
        );

        let notice = RelayNotice {
            key: MAILBOX_KEY.to_string(),
            old_value,
            new_value,
            message,
        };
        for notifier in &self.notifiers {
            if let Err(err) = notifier.notify(&notice) {
                tracing::debug!(notifier = notifier.name(), error = %err, "Notifier failed");
            }
        }

        SendOutcome::Stored
    }

    /// Messages for `session_id`, oldest first. When `secret_token` is given,
    /// messages carrying a different token are excluded; messages without a
    /// token pass through.
    pub fn receive(&self, session_id: &str, secret_token: Option<&str>) -> Vec<Message> {
        self.snapshot()
            .into_iter()
            .filter(|m| m.session_id == session_id)
            .filter(|m| secret_token.map(|token| m.token_matches(token)).unwrap_or(true))
            .collect()
    }

    /// Removes every message for the session.
    pub fn clear(&self, session_id: &str) {
        self.retain("clear session messages", |entry| {
            entry
                .message
                .as_ref()
                .map(|m| m.session_id != session_id)
                .unwrap_or(true)
        });
    }

    /// Removes one message type for the session, leaving the rest.
    pub fn clear_type(&self, session_id: &str, message_type: MessageType) {
        self.retain("clear message type", |entry| {
            !entry.is(session_id, message_type)
        });
    }

    /// Every decodable message across sessions, for diagnostics.
    pub fn snapshot(&self) -> Vec<Message> {
        self.load()
            .1
            .into_iter()
            .filter_map(|entry| entry.message)
            .collect()
    }

    fn is_duplicate(&self, entries: &[Entry], message: &Message) -> bool {
        // Timestamps come from other producers; any i64 pair must compare safely.
        message.message_type.is_deduplicated()
            && entries
                .iter()
                .filter_map(|entry| entry.message.as_ref())
                .any(|existing| {
                    existing.message_type == message.message_type
                        && existing.session_id == message.session_id
                        && existing.timestamp.abs_diff(message.timestamp) < self.dedup_window_ms
                })
    }

    fn load(&self) -> (Option<String>, Vec<Entry>) {
        match self.store.get(MAILBOX_KEY) {
            Ok(Some(raw)) => {
                let entries = mailbox_entries(&raw).into_iter().map(Entry::from_raw).collect();
                (Some(raw), entries)
            }
            Ok(None) => (None, Vec::new()),
            Err(err) => {
                tracing::debug!(error = %err, "Failed to read mailbox");
                (None, Vec::new())
            }
        }
    }

    fn retain(&self, context: &'static str, keep: impl Fn(&Entry) -> bool) {
        let (raw, mut entries) = self.load();
        if raw.is_none() {
            return;
        }
        let before = entries.len();
        entries.retain(|entry| keep(entry));
        if entries.len() == before {
            return;
        }

        let result = encode(&entries)
            .map_err(|e| e.to_string())
            .and_then(|value| {
                self.store
                    .set(MAILBOX_KEY, &value)
                    .map_err(|e| e.to_string())
            });
        match result {
            Ok(()) => tracing::debug!(removed = before - entries.len(), "Mailbox {}", context),
            Err(err) => tracing::warn!(error = %err, "Failed to {}", context),
        }
    }
}

fn encode(entries: &[Entry]) -> serde_json::Result<String> {
    let raw: Vec<&Value> = entries.iter().map(|entry| &entry.raw).collect();
    serde_json::to_string(&raw)
}
