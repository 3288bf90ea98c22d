use pairing_core::protocol::{
    CaptureError, ElementStatus, Message, MrzData, ValidationSnapshot, BROADCAST_CHANNEL,
};
use pairing_core::{
    BroadcastHub, CaptureSink, CaptureStep, CoordinatorOptions, FileStore, JoinCredentials,
    MemoryStore, MessageRelay, Origin, PairingConfig, PairingCoordinator, PairingHandle,
    PairingState, PushSources, SendOutcome, SessionManager, StaticDiscovery, StorageConfig,
    SystemClock,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Captures {
    documents: Mutex<Vec<(MrzData, String)>>,
    faces: Mutex<Vec<String>>,
    validations: Mutex<Vec<Option<ValidationSnapshot>>>,
    errors: Mutex<Vec<CaptureError>>,
}

impl CaptureSink for Captures {
    fn on_document_captured(&self, mrz_data: MrzData, image_data: String) {
        self.documents.lock().unwrap().push((mrz_data, image_data));
    }

    fn on_face_captured(&self, face_image_data: String) {
        self.faces.lock().unwrap().push(face_image_data);
    }

    fn on_validation(&self, validation: Option<&ValidationSnapshot>) {
        self.validations.lock().unwrap().push(validation.cloned());
    }

    fn on_capture_error(&self, error: &CaptureError) {
        self.errors.lock().unwrap().push(error.clone());
    }
}

/// One desktop context: its own session store, plus the mailbox of its origin.
struct Desktop {
    handle: PairingHandle,
    captures: Arc<Captures>,
    sessions: Arc<SessionManager<MemoryStore, SystemClock>>,
}

fn config() -> PairingConfig {
    PairingConfig {
        poll_interval_pairing_ms: 10,
        poll_interval_connected_ms: 10,
        connected_grace_ms: 20,
        ..PairingConfig::default()
    }
}

fn start_desktop(storage: &StorageConfig, current: Origin, discovered: &str) -> Desktop {
    let config = config();
    let sessions = Arc::new(SessionManager::new(MemoryStore::new(), SystemClock, &config));
    let relay = Arc::new(MessageRelay::new(
        FileStore::for_origin(storage, &current),
        &config,
    ));
    let captures = Arc::new(Captures::default());
    let handle = PairingCoordinator::start(
        Arc::clone(&sessions),
        relay,
        captures.clone(),
        CoordinatorOptions {
            current,
            host_override: None,
            discovery: Arc::new(StaticDiscovery(Some(discovered.to_string()))),
            push: PushSources::default(),
            config,
        },
    );
    Desktop {
        handle,
        captures,
        sessions,
    }
}

/// The phone side: reads the join URL and writes to its own origin's mailbox.
struct Phone {
    credentials: JoinCredentials,
    relay: MessageRelay<FileStore>,
}

impl Phone {
    fn open(storage: &StorageConfig, join_url: &str) -> Self {
        let credentials = JoinCredentials::from_url(join_url).unwrap();
        let relay = MessageRelay::new(
            FileStore::for_origin(storage, &credentials.origin),
            &config(),
        );
        Self { credentials, relay }
    }

    fn sid(&self) -> &str {
        &self.credentials.session_id
    }

    fn token(&self) -> &str {
        &self.credentials.secret_token
    }

    fn send(&self, message: Message) -> SendOutcome {
        self.relay.send(message)
    }

    fn mailbox_is_empty(&self) -> bool {
        self.relay.receive(self.sid(), None).is_empty()
    }
}

fn storage() -> (TempDir, StorageConfig) {
    let dir = TempDir::new().unwrap();
    let storage = StorageConfig::with_root(dir.path().to_path_buf());
    (dir, storage)
}

fn lan_origin() -> Origin {
    Origin::new("http", "192.168.1.20", Some(3356))
}

fn passport() -> MrzData {
    MrzData {
        document_type: "P".to_string(),
        country_code: "UTO".to_string(),
        name: "ERIKSSON ANNA MARIA".to_string(),
        passport_number: "L898902C3".to_string(),
        nationality: "UTO".to_string(),
        dob: "740812".to_string(),
        gender: "F".to_string(),
        expiry_date: "120415".to_string(),
        ..MrzData::default()
    }
}

fn wait_until(check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    check()
}

fn connect(desktop: &Desktop, phone: &Phone) {
    phone.send(Message::connected(phone.sid(), Some(phone.token()), 1_000));
    assert!(desktop
        .handle
        .wait_for(PairingState::is_connected, WAIT));
    assert!(wait_until(|| phone.mailbox_is_empty()));
}

fn awaiting_face(state: PairingState) -> bool {
    state == PairingState::Connected(CaptureStep::AwaitingFace)
}

#[test]
fn test_full_pairing_over_shared_origin() {
    let (_dir, storage) = storage();
    let desktop = start_desktop(&storage, lan_origin(), "192.168.1.20");
    let url = desktop.handle.join_url().url.clone();
    assert!(url.starts_with("http://192.168.1.20:3356/mobile?"));

    let phone = Phone::open(&storage, &url);
    assert_eq!(phone.sid(), desktop.handle.session().session_id);
    connect(&desktop, &phone);

    phone.send(Message::document_captured(
        phone.sid(),
        phone.token(),
        passport(),
        "data:image/jpeg;base64,AAAA",
        2_000,
    ));
    assert!(desktop.handle.wait_for(awaiting_face, WAIT));
    assert!(phone.mailbox_is_empty());

    phone.send(Message::face_captured(phone.sid(), phone.token(), "FACE", 3_000));
    assert_eq!(
        desktop.handle.wait_until_finished(WAIT),
        Some(PairingState::Done)
    );

    let documents = desktop.captures.documents.lock().unwrap();
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].0, passport());
    assert_eq!(documents[0].1, "data:image/jpeg;base64,AAAA");
    assert_eq!(*desktop.captures.faces.lock().unwrap(), vec!["FACE".to_string()]);
    assert!(desktop.sessions.get_session().is_none());
    assert!(phone.mailbox_is_empty());
}

#[test]
fn test_duplicate_document_is_forwarded_once() {
    let (_dir, storage) = storage();
    let desktop = start_desktop(&storage, lan_origin(), "192.168.1.20");
    let phone = Phone::open(&storage, &desktop.handle.join_url().url);
    connect(&desktop, &phone);

    let document =
        |ts| Message::document_captured(phone.sid(), phone.token(), passport(), "IMG", ts);
    assert_eq!(phone.send(document(5_000)), SendOutcome::Stored);
    // A retry half a second later is usually dropped by the relay; if the
    // mailbox was already cleared it lands, and the machine ignores it.
    phone.send(document(5_500));
    assert!(desktop.handle.wait_for(awaiting_face, WAIT));

    // A late retry outside the window always reaches the mailbox.
    assert_eq!(phone.send(document(9_000)), SendOutcome::Stored);
    thread::sleep(Duration::from_millis(100));

    assert_eq!(desktop.captures.documents.lock().unwrap().len(), 1);
    assert_eq!(desktop.handle.state(), PairingState::Connected(CaptureStep::AwaitingFace));
}

#[test]
fn test_phone_on_other_origin_never_connects() {
    let (_dir, storage) = storage();
    // Desktop opened on localhost, join URL points at the LAN address.
    let desktop = start_desktop(
        &storage,
        Origin::new("http", "localhost", Some(3356)),
        "192.168.1.20",
    );
    let url = desktop.handle.join_url().url.clone();
    assert!(url.starts_with("http://192.168.1.20:3356/mobile?"));

    let phone = Phone::open(&storage, &url);
    assert_eq!(
        phone.send(Message::connected(phone.sid(), Some(phone.token()), 1_000)),
        SendOutcome::Stored
    );

    assert!(!desktop
        .handle
        .wait_for(PairingState::is_connected, Duration::from_millis(300)));
    assert_eq!(desktop.handle.state(), PairingState::Pairing);
    assert_eq!(phone.relay.receive(phone.sid(), None).len(), 1);
}

#[test]
fn test_validation_updates_stream_and_reset_on_capture() {
    let (_dir, storage) = storage();
    let desktop = start_desktop(&storage, lan_origin(), "192.168.1.20");
    let phone = Phone::open(&storage, &desktop.handle.join_url().url);
    connect(&desktop, &phone);

    let mut elements = BTreeMap::new();
    elements.insert(
        "mrz".to_string(),
        ElementStatus {
            detected: true,
            confidence: Some(0.9),
            value: None,
        },
    );
    let snapshot = ValidationSnapshot {
        elements,
        is_valid: false,
    };
    phone.send(Message::validation_update(
        phone.sid(),
        phone.token(),
        snapshot.clone(),
        2_000,
    ));
    assert!(wait_until(|| desktop.handle.validation().is_some()));
    assert_eq!(desktop.handle.validation(), Some(snapshot.clone()));

    phone.send(Message::document_captured(
        phone.sid(),
        phone.token(),
        passport(),
        "IMG",
        3_000,
    ));
    assert!(desktop.handle.wait_for(awaiting_face, WAIT));
    assert_eq!(desktop.handle.validation(), None);
    assert_eq!(
        *desktop.captures.validations.lock().unwrap(),
        vec![Some(snapshot), None]
    );
}

#[test]
fn test_forged_token_is_ignored() {
    let (_dir, storage) = storage();
    let desktop = start_desktop(&storage, lan_origin(), "192.168.1.20");
    let phone = Phone::open(&storage, &desktop.handle.join_url().url);
    connect(&desktop, &phone);

    phone.send(Message::document_captured(
        phone.sid(),
        "not-the-token",
        passport(),
        "IMG",
        2_000,
    ));
    thread::sleep(Duration::from_millis(100));
    assert!(desktop.captures.documents.lock().unwrap().is_empty());
    assert_eq!(
        desktop.handle.state(),
        PairingState::Connected(CaptureStep::AwaitingDocument)
    );
}

#[test]
fn test_phone_error_is_surfaced_once() {
    let (_dir, storage) = storage();
    let desktop = start_desktop(&storage, lan_origin(), "192.168.1.20");
    let phone = Phone::open(&storage, &desktop.handle.join_url().url);
    connect(&desktop, &phone);

    phone.send(Message::error(
        phone.sid(),
        phone.token(),
        CaptureError {
            message: "Camera permission denied".to_string(),
            stage: Some("document".to_string()),
        },
        2_000,
    ));
    assert!(wait_until(|| desktop.handle.last_error().is_some()));
    // Several more polls see the same message.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(desktop.captures.errors.lock().unwrap().len(), 1);
}

#[test]
fn test_dispose_detaches_push_listeners() {
    let config = config();
    let hub = BroadcastHub::new();
    let channel = hub.channel(BROADCAST_CHANNEL).unwrap();
    let captures = Arc::new(Captures::default());
    let mut handle = PairingCoordinator::start(
        Arc::new(SessionManager::new(MemoryStore::new(), SystemClock, &config)),
        Arc::new(MessageRelay::new(MemoryStore::new(), &config)),
        captures.clone(),
        CoordinatorOptions {
            current: lan_origin(),
            host_override: None,
            discovery: Arc::new(StaticDiscovery(None)),
            push: PushSources {
                change_feed: None,
                broadcast: Some(channel.clone()),
            },
            config,
        },
    );

    handle.dispose();
    let sid = handle.session().session_id.clone();
    assert_eq!(
        channel
            .post_message(&Message::connected(&sid, None, 1_000))
            .unwrap(),
        0
    );
    assert_eq!(handle.state(), PairingState::Pairing);
}
