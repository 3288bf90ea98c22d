//! Mailbox inspection for debugging a pairing that never connects.
//!
//! Listing prints one JSON line per message with payloads elided; images can
//! be megabytes.

use pairing_core::protocol::{Message, MAILBOX_KEY};
use pairing_core::{
    FileStore, KeyValueStore, MessageRelay, Origin, PairingConfig, PairingError, StorageConfig,
};
use serde::Serialize;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageSummary<'a> {
    #[serde(rename = "type")]
    message_type: &'a str,
    session_id: &'a str,
    timestamp: i64,
    has_token: bool,
    payload_bytes: usize,
}

impl<'a> From<&'a Message> for MessageSummary<'a> {
    fn from(message: &'a Message) -> Self {
        Self {
            message_type: message.message_type.as_str(),
            session_id: &message.session_id,
            timestamp: message.timestamp,
            has_token: message
                .secret_token
                .as_deref()
                .is_some_and(|token| !token.is_empty()),
            payload_bytes: message
                .data
                .as_ref()
                .map(|data| data.to_string().len())
                .unwrap_or(0),
        }
    }
}

pub fn run(
    storage: &StorageConfig,
    config: &PairingConfig,
    origin: &str,
    session: Option<&str>,
    clear: bool,
) -> Result<(), PairingError> {
    let origin = Origin::parse(origin)?;
    let relay = MessageRelay::new(FileStore::for_origin(storage, &origin), config);

    if clear {
        match session {
            Some(session_id) => relay.clear(session_id),
            None => relay.store().remove(MAILBOX_KEY)?,
        }
        tracing::info!(origin = %origin, "Mailbox cleared");
        return Ok(());
    }

    let messages: Vec<Message> = match session {
        Some(session_id) => relay.receive(session_id, None),
        None => relay.snapshot(),
    };
    if messages.is_empty() {
        tracing::info!(origin = %origin, "Mailbox is empty");
    }
    for message in &messages {
        let line = serde_json::to_string(&MessageSummary::from(message))
            .map_err(|source| PairingError::Json {
                context: "encode message summary".to_string(),
                source,
            })?;
        println!("{}", line);
    }
    Ok(())
}
