//! # pairing-core
//!
//! Pairs a desktop verifier with a phone that captures a passport and a face,
//! using nothing but a shared key-value store as the transport.
//!
//! ## Pieces
//!
//! - [`SessionManager`]: one short-lived session per desktop context, and the
//!   join URL the phone opens.
//! - [`MessageRelay`]: a bounded, de-duplicated mailbox under a single key,
//!   with optional push notifiers on top.
//! - [`PairingMachine`]: the pure state machine deciding what each message means.
//! - [`PairingCoordinator`]: the runtime driving the machine from polls and
//!   pushes, handing captures to a [`CaptureSink`].
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. The coordinator owns one worker thread.
//! - **Graceful degradation**: Unreadable or corrupt storage reads as empty.
//!   Send failures are logged, never raised to the caller.
//! - **Injected edges**: Clock, storage and address discovery are traits so
//!   every behavior runs in tests without a network or real time.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pairing_core::*;
//!
//! let config = PairingConfig::default();
//! let sessions = Arc::new(SessionManager::new(MemoryStore::new(), SystemClock, &config));
//! let relay = Arc::new(MessageRelay::new(FileStore::for_origin(&storage, &origin), &config));
//! let handle = PairingCoordinator::start(sessions, relay, sink, options);
//! println!("{}", handle.join_url().url);
//! ```

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod machine;
pub mod notify;
pub mod origin;
pub mod relay;
pub mod session;
pub mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_config, PairingConfig};
pub use coordinator::{
    CaptureSink, CoordinatorOptions, DeliverySource, PairingCoordinator, PairingHandle,
    PairingView, PushSources,
};
pub use error::{PairingError, Result};
pub use machine::{CaptureStep, Effect, PairingMachine, PairingState};
pub use notify::{
    BroadcastChannel, BroadcastHub, ChangeFeed, Notifier, RelayNotice, StorageChange,
    Subscription,
};
pub use origin::{AddressDiscovery, Origin, RouteDiscovery, StaticDiscovery};
pub use relay::{MessageRelay, SendOutcome};
pub use session::{JoinCredentials, JoinHostSource, JoinUrl, Session, SessionManager};
pub use storage::{FileStore, KeyValueStore, MemoryStore, StorageConfig};

pub use pairing_protocol as protocol;
