//! Desktop side of a pairing.
//!
//! Prints the join URL on the first stdout line, then one JSON object per
//! event until the phone finishes. Logs go to stderr so stdout stays parseable.

use pairing_core::protocol::{CaptureError, MrzData, ValidationSnapshot};
use pairing_core::{
    AddressDiscovery, CaptureSink, CoordinatorOptions, FileStore, JoinCredentials, MemoryStore,
    MessageRelay, Origin, PairingConfig, PairingCoordinator, PairingError, PairingState,
    PushSources, RouteDiscovery, SessionManager, StaticDiscovery, StorageConfig, SystemClock,
};
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DesktopError {
    #[error(transparent)]
    Pairing(#[from] PairingError),

    #[error("Phone did not finish within {0}s")]
    Timeout(u64),
}

pub struct DesktopArgs {
    pub origin: String,
    pub host: Option<String>,
    pub lan_address: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum DesktopEvent<'a> {
    JoinUrl {
        url: &'a str,
        session_id: &'a str,
    },
    State {
        state: &'a str,
    },
    DocumentCaptured {
        mrz_data: &'a MrzData,
        image_bytes: usize,
    },
    FaceCaptured {
        image_bytes: usize,
    },
    Validation {
        detected: usize,
        total: usize,
        is_valid: bool,
    },
    Error {
        message: &'a str,
        stage: Option<&'a str>,
    },
}

fn emit(event: &DesktopEvent<'_>) {
    match serde_json::to_string(event) {
        Ok(line) => {
            let mut stdout = std::io::stdout().lock();
            let _ = writeln!(stdout, "{}", line);
            let _ = stdout.flush();
        }
        Err(e) => tracing::warn!(error = %e, "Failed to encode event"),
    }
}

/// Writes every capture to stdout as it arrives.
struct StdoutSink;

impl CaptureSink for StdoutSink {
    fn on_document_captured(&self, mrz_data: MrzData, image_data: String) {
        emit(&DesktopEvent::DocumentCaptured {
            mrz_data: &mrz_data,
            image_bytes: image_data.len(),
        });
    }

    fn on_face_captured(&self, face_image_data: String) {
        emit(&DesktopEvent::FaceCaptured {
            image_bytes: face_image_data.len(),
        });
    }

    fn on_validation(&self, validation: Option<&ValidationSnapshot>) {
        if let Some(snapshot) = validation {
            emit(&DesktopEvent::Validation {
                detected: snapshot.detected_count(),
                total: snapshot.elements.len(),
                is_valid: snapshot.is_valid,
            });
        }
    }

    fn on_state_change(&self, state: PairingState) {
        emit(&DesktopEvent::State {
            state: state.label(),
        });
    }

    fn on_capture_error(&self, error: &CaptureError) {
        emit(&DesktopEvent::Error {
            message: &error.message,
            stage: error.stage.as_deref(),
        });
    }
}

/// Origin a phone opening `join_url` writes under, when it is not `current`.
fn foreign_join_origin(current: &Origin, join_url: &str) -> Option<Origin> {
    let join_origin = JoinCredentials::from_url(join_url).ok()?.origin;
    (join_origin != *current).then_some(join_origin)
}

pub fn run(
    storage: &StorageConfig,
    config: PairingConfig,
    args: DesktopArgs,
) -> Result<(), DesktopError> {
    let current = Origin::parse(&args.origin)?;
    let args_origin = current.clone();

    // The session lives only as long as this process, like a browser tab.
    let sessions = Arc::new(SessionManager::new(MemoryStore::new(), SystemClock, &config));
    let mailbox = FileStore::for_origin(storage, &current);
    tracing::debug!(dir = %mailbox.dir().display(), "Using origin mailbox");
    let relay = Arc::new(MessageRelay::new(mailbox, &config));

    let discovery: Arc<dyn AddressDiscovery> = match args.lan_address {
        Some(address) => Arc::new(StaticDiscovery(Some(address))),
        None => Arc::new(RouteDiscovery::default()),
    };

    let mut handle = PairingCoordinator::start(
        sessions,
        relay,
        Arc::new(StdoutSink),
        CoordinatorOptions {
            current,
            host_override: args.host,
            discovery,
            push: PushSources::default(),
            config,
        },
    );

    if let Some(join_origin) = foreign_join_origin(&args_origin, &handle.join_url().url) {
        tracing::warn!(
            desktop = %args_origin,
            phone = %join_origin,
            "Join URL is on a different origin; a phone writing there is never seen. \
             Run desktop with --origin {} to pair locally",
            join_origin
        );
    }

    emit(&DesktopEvent::JoinUrl {
        url: &handle.join_url().url,
        session_id: &handle.session().session_id,
    });

    match handle.wait_until_finished(Duration::from_secs(args.timeout_secs)) {
        Some(state) => {
            tracing::info!(state = %state, "Pairing finished");
            Ok(())
        }
        None => {
            handle.cancel(true);
            handle.dispose();
            Err(DesktopError::Timeout(args.timeout_secs))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOIN: &str = "http://192.168.1.20:3356/mobile?session=s&token=t";

    #[test]
    fn test_loopback_desktop_with_lan_join_url_is_flagged() {
        let desktop = Origin::new("http", "localhost", Some(3356));
        assert_eq!(
            foreign_join_origin(&desktop, JOIN),
            Some(Origin::new("http", "192.168.1.20", Some(3356)))
        );
    }

    #[test]
    fn test_same_origin_join_url_is_not_flagged() {
        let desktop = Origin::new("http", "192.168.1.20", Some(3356));
        assert_eq!(foreign_join_origin(&desktop, JOIN), None);
    }
}
