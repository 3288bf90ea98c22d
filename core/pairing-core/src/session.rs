//! Pairing session lifecycle.
//!
//! A session is one desktop pairing attempt: an opaque id plus a 256-bit
//! secret token, valid for a fixed TTL. It lives in a per-tab store (never the
//! shared mailbox) and is read-checked for expiry on every access. Storage
//! failures degrade to "no session" so the caller simply creates a new one.
//!
//! The join URL carries both credentials to the phone:
//!
//! ```text
//! https://verify.example.com/mobile?session=session_1700000000000_k3j9x0abc&token=9f2c…
//! ```

use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use url::Url;

use pairing_protocol::{JOIN_PATH, SESSION_KEY, SESSION_PARAM, TOKEN_PARAM};

use crate::clock::Clock;
use crate::config::PairingConfig;
use crate::error::{PairingError, Result};
use crate::origin::{AddressDiscovery, Origin};
use crate::storage::KeyValueStore;

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ID_SUFFIX_LEN: usize = 9;
const TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub secret_token: String,
    pub created_at: i64,
    pub expires_at: i64,
}

impl Session {
    /// Usable while `now <= expires_at`.
    pub fn is_expired_at(&self, now_millis: i64) -> bool {
        now_millis > self.expires_at
    }

    pub fn remaining_millis(&self, now_millis: i64) -> i64 {
        (self.expires_at - now_millis).max(0)
    }
}

/// `session_<millis>_<9 base36 chars>`.
pub fn generate_session_id(now_millis: i64) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect();
    format!("session_{}_{}", now_millis, suffix)
}

/// 32 bytes from the OS RNG, lowercase hex.
pub fn generate_secret_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Shortened id for logs.
pub fn short_id(id: &str) -> &str {
    id.get(..10).unwrap_or(id)
}

/// Token prefix for logs. The full token never reaches a log line.
pub fn token_hint(token: &str) -> &str {
    token.get(..8).unwrap_or(token)
}

/// How the host of a join URL was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinHostSource {
    /// Secure, non-loopback desktop origin reused as-is (tunnels, reverse proxies).
    CurrentHost,
    /// Caller-supplied LAN address.
    Override,
    /// Address found by [`AddressDiscovery`] or the configured fallback.
    Discovered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinUrl {
    pub url: String,
    pub host: String,
    pub source: JoinHostSource,
}

/// Credentials the phone extracts from a join URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinCredentials {
    pub session_id: String,
    pub secret_token: String,
    /// Origin the phone is on, which selects the shared mailbox it writes to.
    pub origin: Origin,
}

impl JoinCredentials {
    pub fn from_url(input: &str) -> Result<Self> {
        let url = Url::parse(input).map_err(|e| PairingError::InvalidJoinUrl(e.to_string()))?;
        let origin = Origin::from_url(&url)?;

        let mut session_id = None;
        let mut secret_token = None;
        for (name, value) in url.query_pairs() {
            match name.as_ref() {
                SESSION_PARAM if !value.is_empty() => session_id = Some(value.into_owned()),
                TOKEN_PARAM if !value.is_empty() => secret_token = Some(value.into_owned()),
                _ => {}
            }
        }

        Ok(Self {
            session_id: session_id.ok_or(PairingError::MissingCredential(SESSION_PARAM))?,
            secret_token: secret_token.ok_or(PairingError::MissingCredential(TOKEN_PARAM))?,
            origin,
        })
    }
}

pub struct SessionManager<S, C> {
    store: S,
    clock: C,
    ttl_millis: i64,
    default_port: u16,
    fallback_host: String,
}

impl<S: KeyValueStore, C: Clock> SessionManager<S, C> {
    pub fn new(store: S, clock: C, config: &PairingConfig) -> Self {
        Self {
            store,
            clock,
            ttl_millis: config.session_ttl_millis(),
            default_port: config.default_port,
            fallback_host: config.fallback_host.clone(),
        }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Creates and persists a new session. A failed save is logged; the
    /// returned session is still usable for this pairing attempt.
    pub fn create_session(&self) -> Session {
        let now = self.clock.now_millis();
        let session = Session {
            session_id: generate_session_id(now),
            secret_token: generate_secret_token(),
            created_at: now,
            expires_at: now + self.ttl_millis,
        };

        match serde_json::to_string(&session) {
            Ok(content) => {
                if let Err(err) = self.store.set(SESSION_KEY, &content) {
                    tracing::warn!(error = %err, "Failed to persist pairing session");
                }
            }
            Err(err) => tracing::warn!(error = %err, "Failed to serialize pairing session"),
        }

        tracing::info!(
            session = %short_id(&session.session_id),
            expires_at = session.expires_at,
            "Pairing session created"
        );
        session
    }

    /// Returns the stored session if present, well-formed and unexpired.
    /// An expired session is removed from storage.
    pub fn get_session(&self) -> Option<Session> {
        let content = match self.store.get(SESSION_KEY) {
            Ok(Some(content)) => content,
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to read pairing session");
                return None;
            }
        };

        let session: Session = match serde_json::from_str(&content) {
            Ok(session) => session,
            Err(err) => {
                tracing::debug!(error = %err, "Ignoring malformed pairing session");
                return None;
            }
        };

        if session.is_expired_at(self.clock.now_millis()) {
            tracing::debug!(session = %short_id(&session.session_id), "Pairing session expired");
            self.clear_session();
            return None;
        }

        Some(session)
    }

    pub fn get_or_create(&self) -> Session {
        self.get_session().unwrap_or_else(|| self.create_session())
    }

    pub fn clear_session(&self) {
        if let Err(err) = self.store.remove(SESSION_KEY) {
            tracing::warn!(error = %err, "Failed to clear pairing session");
        }
    }

    pub fn build_join_url(
        &self,
        session_id: &str,
        secret_token: &str,
        host_override: Option<&str>,
        current: &Origin,
        discovery: &dyn AddressDiscovery,
    ) -> String {
        self.resolve_join_url(session_id, secret_token, host_override, current, discovery)
            .url
    }

    /// Picks the host a second device should open, in priority order:
    ///
    /// 1. Secure, non-loopback current origin: reuse its host, no port.
    /// 2. `host_override`, keeping the current scheme and port.
    /// 3. Discovered LAN address (or the current host if it is not loopback,
    ///    else the configured fallback), keeping the current scheme and port.
    pub fn resolve_join_url(
        &self,
        session_id: &str,
        secret_token: &str,
        host_override: Option<&str>,
        current: &Origin,
        discovery: &dyn AddressDiscovery,
    ) -> JoinUrl {
        let scheme = current.scheme();

        if current.is_secure() && !current.is_loopback() {
            let host = current.host().to_string();
            let url = join_url(scheme, &host, None, session_id, secret_token);
            return JoinUrl {
                url,
                host,
                source: JoinHostSource::CurrentHost,
            };
        }

        let port = Some(current.effective_port(self.default_port));

        if let Some(host) = host_override.map(str::trim).filter(|h| !h.is_empty()) {
            let url = join_url(scheme, host, port, session_id, secret_token);
            return JoinUrl {
                url,
                host: host.to_string(),
                source: JoinHostSource::Override,
            };
        }

        let host = discovery
            .discover(current)
            .or_else(|| (!current.is_loopback()).then(|| current.host().to_string()))
            .unwrap_or_else(|| self.fallback_host.clone());
        tracing::debug!(host = %host, "Join URL host discovered");
        let url = join_url(scheme, &host, port, session_id, secret_token);
        JoinUrl {
            url,
            host,
            source: JoinHostSource::Discovered,
        }
    }
}

fn join_url(
    scheme: &str,
    host: &str,
    port: Option<u16>,
    session_id: &str,
    secret_token: &str,
) -> String {
    let authority = match (host.contains(':'), port) {
        (true, Some(port)) => format!("[{}]:{}", host, port),
        (true, None) => format!("[{}]", host),
        (false, Some(port)) => format!("{}:{}", host, port),
        (false, None) => host.to_string(),
    };
    let base = format!("{}://{}{}", scheme, authority, JOIN_PATH);

    match Url::parse(&base) {
        Ok(mut url) => {
            url.query_pairs_mut()
                .append_pair(SESSION_PARAM, session_id)
                .append_pair(TOKEN_PARAM, secret_token);
            url.to_string()
        }
        Err(err) => {
            tracing::warn!(error = %err, host = %host, "Join URL host did not parse; using raw form");
            format!(
                "{}?{}={}&{}={}",
                base, SESSION_PARAM, session_id, TOKEN_PARAM, secret_token
            )
        }
    }
}
