//! Simulated phone: sends one message for a join URL into the mailbox of the
//! URL's origin.
//!
//! ## Usage
//!
//! ```bash
//! verimezk-pair phone --url "$JOIN_URL" connect
//! verimezk-pair phone --url "$JOIN_URL" document --mrz mrz.json --image passport.b64
//! verimezk-pair phone --url "$JOIN_URL" face --image face.b64
//! ```

use clap::Subcommand;
use fs_err as fs;
use pairing_core::protocol::{CaptureError, Message, MrzData, ValidationSnapshot};
use pairing_core::{
    Clock, FileStore, JoinCredentials, MessageRelay, PairingConfig, PairingError, SendOutcome,
    StorageConfig, SystemClock,
};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PhoneError {
    #[error(transparent)]
    Pairing(#[from] PairingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Message was not stored")]
    NotStored,
}

#[derive(Subcommand)]
pub enum PhoneAction {
    /// Announce the phone opened the join URL
    Connect,

    /// Send a captured passport
    Document {
        /// JSON file with the parsed MRZ fields
        #[arg(long)]
        mrz: PathBuf,

        /// File with the base64 document image (data URL or raw)
        #[arg(long)]
        image: PathBuf,
    },

    /// Send a captured face
    Face {
        #[arg(long)]
        image: PathBuf,
    },

    /// Send a live validation snapshot
    Validation {
        /// JSON file with `elements` and `isValid`
        #[arg(long)]
        file: PathBuf,
    },

    /// Report a capture failure
    Error {
        message: String,

        #[arg(long)]
        stage: Option<String>,
    },
}

pub fn run(
    storage: &StorageConfig,
    config: &PairingConfig,
    url: &str,
    action: PhoneAction,
) -> Result<(), PhoneError> {
    let credentials = JoinCredentials::from_url(url)?;
    let relay = MessageRelay::new(FileStore::for_origin(storage, &credentials.origin), config);

    let message = build_message(&credentials, action, SystemClock.now_millis())?;
    let message_type = message.message_type;

    match relay.send(message) {
        SendOutcome::Stored => {
            tracing::info!(message_type = %message_type, origin = %credentials.origin, "Sent");
            Ok(())
        }
        SendOutcome::Duplicate => {
            tracing::info!(message_type = %message_type, "Already sent within the last second");
            Ok(())
        }
        SendOutcome::Failed => Err(PhoneError::NotStored),
    }
}

fn build_message(
    credentials: &JoinCredentials,
    action: PhoneAction,
    now: i64,
) -> Result<Message, PhoneError> {
    let sid = credentials.session_id.as_str();
    let token = credentials.secret_token.as_str();

    let message = match action {
        PhoneAction::Connect => Message::connected(sid, Some(token), now),
        PhoneAction::Document { mrz, image } => {
            let mrz_data: MrzData = read_json(&mrz)?;
            Message::document_captured(sid, token, mrz_data, read_image(&image)?, now)
        }
        PhoneAction::Face { image } => Message::face_captured(sid, token, read_image(&image)?, now),
        PhoneAction::Validation { file } => {
            let snapshot: ValidationSnapshot = read_json(&file)?;
            Message::validation_update(sid, token, snapshot, now)
        }
        PhoneAction::Error { message, stage } => {
            Message::error(sid, token, CaptureError { message, stage }, now)
        }
    };
    Ok(message)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, PhoneError> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|source| PhoneError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn read_image(path: &Path) -> Result<String, PhoneError> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}
