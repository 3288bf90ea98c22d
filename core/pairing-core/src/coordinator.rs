//! Desktop-side pairing runtime.
//!
//! [`PairingCoordinator::start`] sets up a pairing attempt and hands back a
//! [`PairingHandle`] that owns everything it started: the worker thread, its
//! poll schedule and the push-channel subscriptions. Dropping or disposing the
//! handle tears all of it down; no sink callback runs after `dispose` returns.
//!
//! # Delivery
//!
//! Messages reach the worker over one `mpsc` channel, from whichever path
//! delivers first:
//!
//! 1. storage-change feed (same process, carries the whole new mailbox)
//! 2. broadcast channel (same process, carries the single message)
//! 3. polling the mailbox (always on; the only path across processes)
//!
//! The same logical message may arrive on all three. The state machine
//! consumes each capture once, so duplicates are harmless.
//!
//! # Scheduling
//!
//! The worker waits with `recv_timeout` until the next poll or the pending
//! `connected` purge, whichever is sooner. The poll interval is recomputed
//! from the machine's current state after every poll: fast while pairing,
//! slower once connected.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use pairing_protocol::{
    parse_mailbox, CaptureError, Message, MessageType, MrzData, ValidationSnapshot, MAILBOX_KEY,
};

use crate::clock::Clock;
use crate::config::PairingConfig;
use crate::machine::{Effect, PairingMachine, PairingState};
use crate::notify::{BroadcastChannel, ChangeFeed, Subscription};
use crate::origin::{AddressDiscovery, Origin};
use crate::relay::MessageRelay;
use crate::session::{short_id, JoinUrl, Session, SessionManager};
use crate::storage::KeyValueStore;

/// Receives what the phone captured. Called only from the coordinator's worker.
pub trait CaptureSink: Send + Sync {
    fn on_document_captured(&self, mrz_data: MrzData, image_data: String);
    fn on_face_captured(&self, face_image_data: String);

    fn on_validation(&self, _validation: Option<&ValidationSnapshot>) {}
    fn on_state_change(&self, _state: PairingState) {}
    fn on_capture_error(&self, _error: &CaptureError) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverySource {
    ChangeFeed,
    Broadcast,
    Poll,
}

impl DeliverySource {
    fn as_str(self) -> &'static str {
        match self {
            DeliverySource::ChangeFeed => "change_feed",
            DeliverySource::Broadcast => "broadcast",
            DeliverySource::Poll => "poll",
        }
    }
}

/// Push paths available in this context. Both are optional.
#[derive(Clone, Default)]
pub struct PushSources {
    pub change_feed: Option<ChangeFeed>,
    pub broadcast: Option<BroadcastChannel>,
}

pub struct CoordinatorOptions {
    /// Origin the desktop runs under.
    pub current: Origin,
    pub host_override: Option<String>,
    pub discovery: Arc<dyn AddressDiscovery>,
    pub push: PushSources,
    pub config: PairingConfig,
}

/// What a UI renders while pairing.
#[derive(Debug, Clone, PartialEq)]
pub struct PairingView {
    pub state: PairingState,
    pub validation: Option<ValidationSnapshot>,
    pub last_error: Option<CaptureError>,
}

struct Shared {
    view: Mutex<PairingView>,
    changed: Condvar,
}

impl Shared {
    fn update(&self, apply: impl FnOnce(&mut PairingView)) {
        if let Ok(mut view) = self.view.lock() {
            apply(&mut view);
        }
        self.changed.notify_all();
    }

    fn snapshot(&self) -> Option<PairingView> {
        self.view.lock().ok().map(|view| view.clone())
    }
}

enum WorkerEvent {
    Delivered(DeliverySource, Vec<Message>),
    Cancel {
        clear_session: bool,
        reply: Sender<bool>,
    },
    Stop,
}

pub struct PairingCoordinator<SS, MS, C> {
    sessions: Arc<SessionManager<SS, C>>,
    relay: Arc<MessageRelay<MS>>,
    sink: Arc<dyn CaptureSink>,
    machine: PairingMachine,
    secret_token: String,
    current: Origin,
    config: PairingConfig,
    shared: Arc<Shared>,
    // Held for the worker's lifetime; dropped on exit to detach listeners.
    subscriptions: Vec<Subscription>,
    next_poll: Instant,
    purge_at: Option<Instant>,
    ticks: u64,
}

impl<SS, MS, C> PairingCoordinator<SS, MS, C>
where
    SS: KeyValueStore + 'static,
    MS: KeyValueStore + 'static,
    C: Clock + 'static,
{
    /// Reuses the live session (or creates one), computes the join URL,
    /// subscribes to the push paths and starts polling.
    pub fn start(
        sessions: Arc<SessionManager<SS, C>>,
        relay: Arc<MessageRelay<MS>>,
        sink: Arc<dyn CaptureSink>,
        options: CoordinatorOptions,
    ) -> PairingHandle {
        let session = sessions.get_or_create();
        let join_url = sessions.resolve_join_url(
            &session.session_id,
            &session.secret_token,
            options.host_override.as_deref(),
            &options.current,
            options.discovery.as_ref(),
        );
        tracing::info!(
            session = %short_id(&session.session_id),
            host = %join_url.host,
            source = ?join_url.source,
            "Pairing started"
        );

        let (tx, rx) = mpsc::channel();
        let subscriptions = subscribe_push(&options.push, &session.session_id, &tx);

        let shared = Arc::new(Shared {
            view: Mutex::new(PairingView {
                state: PairingState::Pairing,
                validation: None,
                last_error: None,
            }),
            changed: Condvar::new(),
        });

        let coordinator = PairingCoordinator {
            sessions,
            relay,
            sink,
            machine: PairingMachine::new(session.session_id.clone(), session.secret_token.clone()),
            secret_token: session.secret_token.clone(),
            current: options.current,
            config: options.config,
            shared: Arc::clone(&shared),
            subscriptions,
            next_poll: Instant::now(),
            purge_at: None,
            ticks: 0,
        };

        let worker = thread::Builder::new()
            .name("verimezk-pairing".to_string())
            .spawn(move || coordinator.run(rx));
        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::error!(error = %err, "Failed to spawn pairing worker");
                None
            }
        };

        PairingHandle {
            session,
            join_url,
            shared,
            tx,
            worker,
        }
    }

    fn run(mut self, rx: Receiver<WorkerEvent>) {
        self.poll();

        while !self.machine.state().is_terminal() {
            let now = Instant::now();
            let mut wake_at = self.next_poll;
            if let Some(purge_at) = self.purge_at {
                wake_at = wake_at.min(purge_at);
            }

            match rx.recv_timeout(wake_at.saturating_duration_since(now)) {
                Ok(WorkerEvent::Delivered(source, messages)) => self.process(source, &messages),
                Ok(WorkerEvent::Cancel {
                    clear_session,
                    reply,
                }) => {
                    let cancelled = self.cancel(clear_session);
                    let _ = reply.send(cancelled);
                }
                Ok(WorkerEvent::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            if self.machine.state().is_terminal() {
                break;
            }

            let now = Instant::now();
            if self.purge_at.map(|at| now >= at).unwrap_or(false) {
                self.purge_at = None;
                self.relay
                    .clear_type(self.machine.session_id(), MessageType::Connected);
            }
            if now >= self.next_poll {
                self.poll();
            }
        }

        self.subscriptions.clear();
        tracing::debug!(
            session = %short_id(self.machine.session_id()),
            state = %self.machine.state(),
            "Pairing worker stopped"
        );
    }

    fn poll(&mut self) {
        self.ticks += 1;
        let session_id = self.machine.session_id().to_string();
        let messages = self.relay.receive(&session_id, Some(&self.secret_token));
        tracing::trace!(attempt = self.ticks, found = messages.len(), "Poll");

        if self.config.status_log_every > 0 && self.ticks % self.config.status_log_every == 0 {
            tracing::debug!(
                session = %short_id(&session_id),
                attempt = self.ticks,
                origin = %self.current,
                state = %self.machine.state(),
                "Polling for messages"
            );
        }
        if self.config.origin_hint_every > 0
            && self.ticks % self.config.origin_hint_every == 0
            && self.machine.state() == PairingState::Pairing
            && messages.is_empty()
        {
            tracing::warn!(
                origin = %self.current,
                mailbox_len = self.relay.snapshot().len(),
                "No messages for this session yet. Storage is not shared between origins; \
                 the phone must open the same scheme, host and port as this desktop"
            );
        }

        if !messages.is_empty() {
            self.process(DeliverySource::Poll, &messages);
        }

        let interval = self.config.poll_interval(self.machine.state().is_connected());
        self.next_poll = Instant::now() + interval;
    }

    fn process(&mut self, source: DeliverySource, messages: &[Message]) {
        tracing::trace!(source = source.as_str(), count = messages.len(), "Messages delivered");
        for message in messages {
            let before = self.machine.state();
            let effects = self.machine.apply(message);
            for effect in effects {
                self.execute(source, effect);
            }
            // Published after the effects so a waiter sees the mailbox and
            // session already cleaned up.
            let after = self.machine.state();
            if after != before {
                self.shared.update(|view| view.state = after);
            }
        }
    }

    fn execute(&mut self, source: DeliverySource, effect: Effect) {
        let session_id = self.machine.session_id().to_string();
        match effect {
            Effect::Transition { to, .. } => {
                if to.is_connected() && source != DeliverySource::Poll {
                    tracing::debug!(source = source.as_str(), "Delivered by push channel");
                }
                self.sink.on_state_change(to);
            }
            Effect::ForwardDocument {
                mrz_data,
                image_data,
            } => self.sink.on_document_captured(mrz_data, image_data),
            Effect::ForwardFace { face_image_data } => self.sink.on_face_captured(face_image_data),
            Effect::ClearMailbox => self.relay.clear(&session_id),
            Effect::ScheduleConnectedPurge => {
                self.purge_at = Some(Instant::now() + self.config.connected_grace());
            }
            Effect::ClearSession => self.sessions.clear_session(),
            Effect::ValidationChanged(validation) => {
                self.sink.on_validation(validation.as_ref());
                self.shared.update(|view| view.validation = validation);
            }
            Effect::SurfaceError(error) => {
                self.sink.on_capture_error(&error);
                self.shared.update(|view| view.last_error = Some(error));
            }
            Effect::TokenMismatch { .. } => {}
        }
    }

    fn cancel(&mut self, clear_session: bool) -> bool {
        if !self.machine.cancel() {
            tracing::debug!(state = %self.machine.state(), "Cancel ignored outside pairing");
            return false;
        }
        if clear_session {
            self.relay.clear(self.machine.session_id());
            self.sessions.clear_session();
        }
        tracing::info!(session = %short_id(self.machine.session_id()), "Pairing cancelled");
        self.shared.update(|view| view.state = PairingState::Cancelled);
        self.sink.on_state_change(PairingState::Cancelled);
        true
    }
}

fn subscribe_push(
    push: &PushSources,
    session_id: &str,
    tx: &Sender<WorkerEvent>,
) -> Vec<Subscription> {
    let mut subscriptions = Vec::new();

    if let Some(feed) = &push.change_feed {
        let tx = tx.clone();
        let session_id = session_id.to_string();
        subscriptions.push(feed.subscribe(move |change| {
            if change.key != MAILBOX_KEY {
                return;
            }
            let Some(new_value) = change.new_value.as_deref() else {
                return;
            };
            let messages: Vec<Message> = parse_mailbox(new_value)
                .into_iter()
                .filter(|m| m.session_id == session_id)
                .collect();
            if !messages.is_empty() {
                let _ = tx.send(WorkerEvent::Delivered(DeliverySource::ChangeFeed, messages));
            }
        }));
    }

    if let Some(channel) = &push.broadcast {
        let tx = tx.clone();
        let session_id = session_id.to_string();
        subscriptions.push(channel.subscribe(move |message| {
            if message.session_id == session_id {
                let _ = tx.send(WorkerEvent::Delivered(
                    DeliverySource::Broadcast,
                    vec![message.clone()],
                ));
            }
        }));
    }

    if subscriptions.is_empty() {
        tracing::debug!("No push channels available, using polling only");
    }
    subscriptions
}

/// Owner of a running pairing attempt.
pub struct PairingHandle {
    session: Session,
    join_url: JoinUrl,
    shared: Arc<Shared>,
    tx: Sender<WorkerEvent>,
    worker: Option<JoinHandle<()>>,
}

impl PairingHandle {
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn join_url(&self) -> &JoinUrl {
        &self.join_url
    }

    pub fn state(&self) -> PairingState {
        self.view().map(|v| v.state).unwrap_or(PairingState::Cancelled)
    }

    pub fn validation(&self) -> Option<ValidationSnapshot> {
        self.view().and_then(|v| v.validation)
    }

    pub fn last_error(&self) -> Option<CaptureError> {
        self.view().and_then(|v| v.last_error)
    }

    pub fn view(&self) -> Option<PairingView> {
        self.shared.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map(|worker| !worker.is_finished())
            .unwrap_or(false)
    }

    /// Cancels while still pairing, then tears the worker down. Returns false
    /// (and keeps running) once the phone has connected.
    pub fn cancel(&mut self, clear_session: bool) -> bool {
        let (reply_tx, reply_rx) = mpsc::channel();
        let sent = self.tx.send(WorkerEvent::Cancel {
            clear_session,
            reply: reply_tx,
        });
        if sent.is_err() {
            return false;
        }
        let cancelled = reply_rx.recv().unwrap_or(false);
        if cancelled {
            self.dispose();
        }
        cancelled
    }

    /// Blocks until `predicate` holds for the current state or `timeout` elapses.
    pub fn wait_for(&self, predicate: impl Fn(PairingState) -> bool, timeout: Duration) -> bool {
        let Ok(view) = self.shared.view.lock() else {
            return false;
        };
        match self
            .shared
            .changed
            .wait_timeout_while(view, timeout, |view| !predicate(view.state))
        {
            Ok((view, _)) => predicate(view.state),
            Err(_) => false,
        }
    }

    /// Waits for `Done` or `Cancelled`, returning the final state if reached.
    pub fn wait_until_finished(&self, timeout: Duration) -> Option<PairingState> {
        if self.wait_for(PairingState::is_terminal, timeout) {
            Some(self.state())
        } else {
            None
        }
    }

    /// Stops the worker and detaches all listeners. Idempotent.
    pub fn dispose(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = self.tx.send(WorkerEvent::Stop);
        // A sink calling back into dispose would otherwise join itself.
        if worker.thread().id() == thread::current().id() {
            return;
        }
        if worker.join().is_err() {
            tracing::warn!("Pairing worker panicked");
        }
    }
}

impl Drop for PairingHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}
