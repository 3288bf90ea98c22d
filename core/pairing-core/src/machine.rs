//! Desktop-side pairing state machine.
//!
//! Pure: it takes messages and returns the effects the runtime must perform,
//! so every transition is testable without threads or storage.
//!
//! ```text
//! Pairing ──connected──▶ Connected(AwaitingDocument) ──document_captured──▶ Connected(AwaitingFace)
//!    │                                                                          │
//!  cancel                                                                 face_captured
//!    ▼                                                                          ▼
//! Cancelled                                                                   Done
//! ```
//!
//! Delivery is at-least-once across three channels, so the machine must be
//! idempotent: a capture is consumed only at the step that expects it, and a
//! stray duplicate at any other step is ignored.

use std::collections::HashSet;

use pairing_protocol::{CaptureError, Message, MessageType, MrzData, ValidationSnapshot};

use crate::session::{short_id, token_hint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStep {
    AwaitingDocument,
    AwaitingFace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Pairing,
    Connected(CaptureStep),
    Done,
    Cancelled,
}

impl PairingState {
    pub fn is_connected(self) -> bool {
        matches!(self, PairingState::Connected(_) | PairingState::Done)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PairingState::Done | PairingState::Cancelled)
    }

    pub fn label(self) -> &'static str {
        match self {
            PairingState::Pairing => "pairing",
            PairingState::Connected(CaptureStep::AwaitingDocument) => "awaiting_document",
            PairingState::Connected(CaptureStep::AwaitingFace) => "awaiting_face",
            PairingState::Done => "done",
            PairingState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for PairingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Transition {
        from: PairingState,
        to: PairingState,
    },
    ForwardDocument {
        mrz_data: MrzData,
        image_data: String,
    },
    ForwardFace {
        face_image_data: String,
    },
    /// Purge every mailbox entry for the session.
    ClearMailbox,
    /// Purge stale `connected` announcements after the grace delay.
    ScheduleConnectedPurge,
    ClearSession,
    ValidationChanged(Option<ValidationSnapshot>),
    SurfaceError(CaptureError),
    TokenMismatch {
        message_type: MessageType,
    },
}

#[derive(Debug, Clone)]
pub struct PairingMachine {
    session_id: String,
    secret_token: String,
    state: PairingState,
    validation: Option<ValidationSnapshot>,
    validation_timestamp: Option<i64>,
    surfaced_errors: HashSet<i64>,
}

impl PairingMachine {
    pub fn new(session_id: impl Into<String>, secret_token: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            secret_token: secret_token.into(),
            state: PairingState::Pairing,
            validation: None,
            validation_timestamp: None,
            surfaced_errors: HashSet::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> PairingState {
        self.state
    }

    /// Latest live validation from the phone, cleared when a capture is consumed.
    pub fn validation(&self) -> Option<&ValidationSnapshot> {
        self.validation.as_ref()
    }

    /// Cancels from `Pairing` only. Returns whether the state changed.
    pub fn cancel(&mut self) -> bool {
        if self.state != PairingState::Pairing {
            return false;
        }
        self.state = PairingState::Cancelled;
        true
    }

    pub fn apply(&mut self, message: &Message) -> Vec<Effect> {
        if message.session_id != self.session_id || self.state.is_terminal() {
            return Vec::new();
        }

        if !message.token_matches(&self.secret_token) {
            tracing::warn!(
                session = %short_id(&self.session_id),
                message_type = %message.message_type,
                expected = %token_hint(&self.secret_token),
                received = %message.secret_token.as_deref().map(token_hint).unwrap_or(""),
                "Token mismatch, skipping message"
            );
            return vec![Effect::TokenMismatch {
                message_type: message.message_type,
            }];
        }

        match message.message_type {
            MessageType::Connected => self.on_connected(),
            MessageType::ValidationUpdate => self.on_validation(message),
            MessageType::DocumentCaptured => self.on_document(message),
            MessageType::FaceCaptured => self.on_face(message),
            MessageType::Error => self.on_error(message),
        }
    }

    fn on_connected(&mut self) -> Vec<Effect> {
        if self.state != PairingState::Pairing {
            return Vec::new();
        }
        let from = self.transition(PairingState::Connected(CaptureStep::AwaitingDocument));
        vec![
            Effect::Transition {
                from,
                to: self.state,
            },
            Effect::ScheduleConnectedPurge,
        ]
    }

    fn on_validation(&mut self, message: &Message) -> Vec<Effect> {
        let Some(snapshot) = message.validation() else {
            return Vec::new();
        };
        if self
            .validation_timestamp
            .map(|last| message.timestamp <= last)
            .unwrap_or(false)
        {
            return Vec::new();
        }
        self.validation_timestamp = Some(message.timestamp);
        self.validation = Some(snapshot.clone());
        vec![Effect::ValidationChanged(Some(snapshot))]
    }

    fn on_document(&mut self, message: &Message) -> Vec<Effect> {
        if self.state != PairingState::Connected(CaptureStep::AwaitingDocument) {
            return Vec::new();
        }
        let Some(document) = message.document() else {
            tracing::debug!("Ignoring document capture without payload");
            return Vec::new();
        };

        let mut effects = self.reset_validation();
        effects.push(Effect::ForwardDocument {
            mrz_data: document.mrz_data,
            image_data: document.image_data,
        });
        let from = self.transition(PairingState::Connected(CaptureStep::AwaitingFace));
        effects.push(Effect::Transition {
            from,
            to: self.state,
        });
        effects.push(Effect::ClearMailbox);
        effects
    }

    fn on_face(&mut self, message: &Message) -> Vec<Effect> {
        if self.state != PairingState::Connected(CaptureStep::AwaitingFace) {
            return Vec::new();
        }
        let Some(face) = message.face() else {
            tracing::debug!("Ignoring face capture without payload");
            return Vec::new();
        };

        let mut effects = self.reset_validation();
        effects.push(Effect::ForwardFace {
            face_image_data: face.face_image_data,
        });
        let from = self.transition(PairingState::Done);
        effects.push(Effect::Transition {
            from,
            to: self.state,
        });
        effects.push(Effect::ClearMailbox);
        effects.push(Effect::ClearSession);
        effects
    }

    fn on_error(&mut self, message: &Message) -> Vec<Effect> {
        // Polling re-reads the same error until the mailbox is purged.
        if !self.surfaced_errors.insert(message.timestamp) {
            return Vec::new();
        }
        let detail = message.error_detail().unwrap_or_else(|| CaptureError {
            message: "Phone reported an error".to_string(),
            stage: None,
        });
        tracing::error!(
            session = %short_id(&self.session_id),
            error = %detail.message,
            stage = ?detail.stage,
            "Phone error"
        );
        vec![Effect::SurfaceError(detail)]
    }

    fn reset_validation(&mut self) -> Vec<Effect> {
        match self.validation.take() {
            Some(_) => vec![Effect::ValidationChanged(None)],
            None => Vec::new(),
        }
    }

    fn transition(&mut self, to: PairingState) -> PairingState {
        let from = self.state;
        self.state = to;
        tracing::info!(
            session = %short_id(&self.session_id),
            from = %from,
            to = %to,
            "Pairing state changed"
        );
        from
    }
}
