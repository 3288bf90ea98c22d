//! Wire types for the VeriMeZK phone-to-desktop relay.
//!
//! This crate is shared by the phone-side producers and the desktop-side
//! pairing coordinator to prevent schema drift. The desktop remains the
//! authority on token validation, but producers reuse the same types to
//! construct valid messages.
//!
//! # Wire format
//!
//! Messages are stored as a JSON array under [`MAILBOX_KEY`]:
//!
//! ```json
//! [
//!   {
//!     "type": "document_captured",
//!     "sessionId": "session_1700000000000_k3j9x0abc",
//!     "secretToken": "9f2c…",
//!     "data": { "mrzData": { … }, "imageData": "data:image/jpeg;base64,…" },
//!     "timestamp": 1700000000050
//!   }
//! ]
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Storage key of the shared mailbox.
pub const MAILBOX_KEY: &str = "verimezk_phone_messages";
/// Storage key of the per-tab desktop session.
pub const SESSION_KEY: &str = "verimezk_session";
/// Name of the cross-context broadcast channel.
pub const BROADCAST_CHANNEL: &str = "verimezk_phone_messages";
/// Path the phone opens to join a session.
pub const JOIN_PATH: &str = "/mobile";
/// Query parameter carrying the session id in a join URL.
pub const SESSION_PARAM: &str = "session";
/// Query parameter carrying the secret token in a join URL.
pub const TOKEN_PARAM: &str = "token";

pub const DEFAULT_MAILBOX_CAPACITY: usize = 50;
pub const DEFAULT_DEDUP_WINDOW_MS: u64 = 1000;

/// Elements the live validation panel treats as mandatory.
pub const REQUIRED_ELEMENTS: [&str; 5] = ["mrz", "passportNumber", "documentType", "country", "photo"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Connected,
    ValidationUpdate,
    DocumentCaptured,
    FaceCaptured,
    Error,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Connected => "connected",
            MessageType::ValidationUpdate => "validation_update",
            MessageType::DocumentCaptured => "document_captured",
            MessageType::FaceCaptured => "face_captured",
            MessageType::Error => "error",
        }
    }

    /// `connected` announcements are never de-duplicated; a fresh one replaces the stale ones.
    pub fn is_deduplicated(self) -> bool {
        self != MessageType::Connected
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of relay between the phone and the desktop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Producer wall clock, milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl Message {
    pub fn new(message_type: MessageType, session_id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            message_type,
            session_id: session_id.into(),
            secret_token: None,
            data: None,
            timestamp,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.secret_token = Some(token.into());
        self
    }

    pub fn with_data<T: Serialize>(mut self, payload: &T) -> Self {
        // Payload types in this crate always serialize; anything else is dropped.
        self.data = serde_json::to_value(payload).ok();
        self
    }

    /// Connection announcement. Producers may omit the token on this ping.
    pub fn connected(session_id: impl Into<String>, token: Option<&str>, timestamp: i64) -> Self {
        let message = Self::new(MessageType::Connected, session_id, timestamp);
        match token {
            Some(token) => message.with_token(token),
            None => message,
        }
    }

    pub fn document_captured(
        session_id: impl Into<String>,
        token: impl Into<String>,
        mrz_data: MrzData,
        image_data: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self::new(MessageType::DocumentCaptured, session_id, timestamp)
            .with_token(token)
            .with_data(&DocumentCaptured {
                mrz_data,
                image_data: image_data.into(),
            })
    }

    pub fn face_captured(
        session_id: impl Into<String>,
        token: impl Into<String>,
        face_image_data: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self::new(MessageType::FaceCaptured, session_id, timestamp)
            .with_token(token)
            .with_data(&FaceCaptured {
                face_image_data: face_image_data.into(),
            })
    }

    pub fn validation_update(
        session_id: impl Into<String>,
        token: impl Into<String>,
        validation: ValidationSnapshot,
        timestamp: i64,
    ) -> Self {
        Self::new(MessageType::ValidationUpdate, session_id, timestamp)
            .with_token(token)
            .with_data(&ValidationUpdate { validation })
    }

    pub fn error(
        session_id: impl Into<String>,
        token: impl Into<String>,
        error: CaptureError,
        timestamp: i64,
    ) -> Self {
        Self::new(MessageType::Error, session_id, timestamp)
            .with_token(token)
            .with_data(&error)
    }

    pub fn document(&self) -> Option<DocumentCaptured> {
        self.payload_as(MessageType::DocumentCaptured)
    }

    pub fn face(&self) -> Option<FaceCaptured> {
        self.payload_as(MessageType::FaceCaptured)
    }

    pub fn validation(&self) -> Option<ValidationSnapshot> {
        self.payload_as::<ValidationUpdate>(MessageType::ValidationUpdate)
            .map(|update| update.validation)
    }

    /// Error detail. Producers sometimes send a bare string instead of an object.
    pub fn error_detail(&self) -> Option<CaptureError> {
        if self.message_type != MessageType::Error {
            return None;
        }
        match self.data.as_ref()? {
            Value::String(message) => Some(CaptureError {
                message: message.clone(),
                stage: None,
            }),
            other => serde_json::from_value(other.clone()).ok(),
        }
    }

    /// Returns false when the message carries a token that differs from `expected`.
    /// Messages without a token (absent or empty) are not rejected here.
    pub fn token_matches(&self, expected: &str) -> bool {
        self.secret_token
            .as_deref()
            .filter(|token| !token.is_empty())
            .map(|token| token == expected)
            .unwrap_or(true)
    }

    fn payload_as<T: DeserializeOwned>(&self, expected: MessageType) -> Option<T> {
        if self.message_type != expected {
            return None;
        }
        serde_json::from_value(self.data.clone()?).ok()
    }
}

/// Raw entries of a serialized mailbox. A value that is not a JSON array
/// yields no entries.
pub fn mailbox_entries(raw: &str) -> Vec<Value> {
    if raw.trim().is_empty() {
        return Vec::new();
    }
    match serde_json::from_str(raw) {
        Ok(Value::Array(entries)) => entries,
        _ => Vec::new(),
    }
}

/// Decodes a serialized mailbox entry by entry, skipping entries that are
/// not messages this build understands.
pub fn parse_mailbox(raw: &str) -> Vec<Message> {
    mailbox_entries(raw)
        .into_iter()
        .filter_map(|entry| serde_json::from_value(entry).ok())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentCaptured {
    pub mrz_data: MrzData,
    pub image_data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceCaptured {
    pub face_image_data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationUpdate {
    pub validation: ValidationSnapshot,
}

/// Capture failure reported by the phone. Non-fatal; the user can retry on the phone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

/// Machine-readable zone record produced by the external MRZ parser.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MrzData {
    pub document_type: String,
    pub country_code: String,
    pub name: String,
    pub passport_number: String,
    pub nationality: String,
    pub dob: String,
    pub gender: String,
    pub expiry_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personal_number: Option<String>,
    /// Base64 passport photo.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_image_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ElementStatus {
    pub detected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Live detection status streamed from the phone while it frames the document.
/// Passed through the relay uninterpreted.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSnapshot {
    #[serde(default)]
    pub elements: BTreeMap<String, ElementStatus>,
    #[serde(default)]
    pub is_valid: bool,
}

impl ValidationSnapshot {
    pub fn detected_count(&self) -> usize {
        self.elements.values().filter(|e| e.detected).count()
    }

    /// Fraction of elements detected, 0.0 when there are none.
    pub fn progress(&self) -> f64 {
        if self.elements.is_empty() {
            return 0.0;
        }
        self.detected_count() as f64 / self.elements.len() as f64
    }

    /// Required elements present in the snapshot but not yet detected.
    pub fn missing_required(&self) -> Vec<&str> {
        REQUIRED_ELEMENTS
            .iter()
            .copied()
            .filter(|name| {
                self.elements
                    .get(*name)
                    .map(|status| !status.detected)
                    .unwrap_or(false)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_mrz() -> MrzData {
        MrzData {
            document_type: "P".to_string(),
            country_code: "UTO".to_string(),
            name: "ERIKSSON ANNA MARIA".to_string(),
            passport_number: "L898902C3".to_string(),
            nationality: "UTO".to_string(),
            dob: "740812".to_string(),
            gender: "F".to_string(),
            expiry_date: "120415".to_string(),
            personal_number: Some("ZE184226B".to_string()),
            photo_data: None,
            full_image_data: None,
        }
    }

    #[test]
    fn test_message_uses_camel_case_wire_names() {
        let message = Message::face_captured("s1", "tok", "img", 42);
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "face_captured");
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["secretToken"], "tok");
        assert_eq!(json["data"]["faceImageData"], "img");
        assert_eq!(json["timestamp"], 42);
    }

    #[test]
    fn test_connected_without_token_omits_field() {
        let message = Message::connected("s1", None, 1);
        let json = serde_json::to_string(&message).unwrap();
        assert!(!json.contains("secretToken"));
        assert!(!json.contains("data"));
    }

    #[test]
    fn test_parses_message_written_by_browser_client() {
        let raw = r#"[{"type":"document_captured","sessionId":"session_1_abc","secretToken":"t",
            "data":{"mrzData":{"documentType":"P","countryCode":"UTO","name":"A","passportNumber":"1",
            "nationality":"UTO","dob":"740812","gender":"F","expiryDate":"120415"},"imageData":"abc"},
            "timestamp":1700000000000}]"#;
        let messages = parse_mailbox(raw);
        assert_eq!(messages.len(), 1);
        let doc = messages[0].document().expect("document payload");
        assert_eq!(doc.image_data, "abc");
        assert_eq!(doc.mrz_data.personal_number, None);
    }

    #[test]
    fn test_document_accessor_round_trips_mrz() {
        let message = Message::document_captured("s", "t", sample_mrz(), "abc", 5);
        let doc = message.document().unwrap();
        assert_eq!(doc.mrz_data, sample_mrz());
        assert!(message.face().is_none());
    }

    #[test]
    fn test_malformed_payload_yields_none() {
        let mut message = Message::new(MessageType::DocumentCaptured, "s", 1);
        message.data = Some(serde_json::json!({"unexpected": true}));
        assert!(message.document().is_none());
    }

    #[test]
    fn test_error_detail_accepts_bare_string() {
        let mut message = Message::new(MessageType::Error, "s", 1);
        message.data = Some(Value::String("camera denied".to_string()));
        assert_eq!(message.error_detail().unwrap().message, "camera denied");
    }

    #[test]
    fn test_corrupt_mailbox_is_empty() {
        assert!(parse_mailbox("").is_empty());
        assert!(parse_mailbox("{not json").is_empty());
        assert!(parse_mailbox("{\"a\":1}").is_empty());
    }

    #[test]
    fn test_token_matches_is_opportunistic() {
        let untokened = Message::connected("s", None, 1);
        assert!(untokened.token_matches("anything"));
        let tokened = Message::connected("s", Some("abc"), 1);
        assert!(tokened.token_matches("abc"));
        assert!(!tokened.token_matches("xyz"));
    }

    #[test]
    fn test_empty_token_counts_as_untokened() {
        let raw = r#"{"type":"connected","sessionId":"s","secretToken":"","timestamp":1}"#;
        let message: Message = serde_json::from_str(raw).unwrap();
        assert_eq!(message.secret_token.as_deref(), Some(""));
        assert!(message.token_matches("realtoken"));
    }

    #[test]
    fn test_unknown_entries_do_not_hide_valid_ones() {
        let raw = r#"[
            {"type":"connected","sessionId":"A","timestamp":1},
            {"type":"ping","sessionId":"X","timestamp":2},
            {"sessionId":"Y"},
            {"type":"error","sessionId":"A","data":"blurry","timestamp":3}
        ]"#;
        assert_eq!(mailbox_entries(raw).len(), 4);
        let messages = parse_mailbox(raw);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].message_type, MessageType::Connected);
        assert_eq!(messages[1].message_type, MessageType::Error);
    }

    #[test]
    fn test_validation_progress_and_missing_required() {
        let mut snapshot = ValidationSnapshot::default();
        snapshot.elements.insert(
            "mrz".to_string(),
            ElementStatus {
                detected: true,
                confidence: Some(0.9),
                value: None,
            },
        );
        snapshot
            .elements
            .insert("photo".to_string(), ElementStatus::default());
        assert_eq!(snapshot.detected_count(), 1);
        assert!((snapshot.progress() - 0.5).abs() < f64::EPSILON);
        assert_eq!(snapshot.missing_required(), vec!["photo"]);
        assert_eq!(ValidationSnapshot::default().progress(), 0.0);
    }

    #[test]
    fn test_only_connected_skips_dedup() {
        assert!(!MessageType::Connected.is_deduplicated());
        assert!(MessageType::Error.is_deduplicated());
        assert!(MessageType::ValidationUpdate.is_deduplicated());
    }
}
