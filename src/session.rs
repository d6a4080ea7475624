//! # Server Session Registry
//!
//! Tracks one in-flight benchmark per accepted data connection, keyed by
//! peer address and port, and reconciles the two independent event sources
//! that need a session's final statistics: the data stream's own
//! end-of-stream event and a client's `FINISH` query over the control
//! channel, which may arrive in either order.
//!
//! Per-session state machine:
//!
//! - **Receiving** — registered on accept; each read adds to the byte count.
//! - **Finished** — end-of-stream seen; the end timestamp is recorded and
//!   the data socket is parked here rather than closed, so the peer's
//!   ephemeral port cannot be reassigned before the statistics are
//!   collected. If a query was already waiting it is answered immediately
//!   and the session retires.
//! - **Awaiting-Query** — a `FINISH` arrived first; the requesting control
//!   connection's reply channel is stored on the session (at most one).
//! - **Retired** — both halves have met: the socket is dropped and the key
//!   is freed for reuse.
//!
//! A second `FINISH` for the same key while one is already pending is
//! protocol misuse and fails with the same error as an unknown key; the
//! registry only remembers one waiter.

use crate::config::SocketOptions;
use crate::protocol::{sanitize_line, SessionSnapshot};
use crate::provider::DataStream;
use chrono::Utc;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

/// Peer identity of one data connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub addr: String,
    pub port: u16,
}

impl SessionKey {
    pub fn new(addr: impl Into<String>, port: u16) -> Self {
        Self { addr: addr.into(), port }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.port)
    }
}

/// Session lookup and registration failures
#[derive(Debug, Error)]
pub enum SessionError {
    /// No session (or no free waiter slot) for this peer key
    #[error("Unknown client: {0}")]
    Unknown(SessionKey),

    /// The key is still held by a session that has not retired
    #[error("session already active for {0}")]
    KeyInUse(SessionKey),
}

struct DataSession {
    received: u64,
    start_us: i64,
    end_us: Option<i64>,
    error: Option<String>,
    options: SocketOptions,
    waiter: Option<oneshot::Sender<SessionSnapshot>>,
    // Parked after end-of-stream; dropping it on retirement closes the
    // socket and releases the peer's ephemeral port
    parked: Option<Box<dyn DataStream>>,
}

impl DataSession {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            received: self.received,
            start_us: self.start_us,
            end_us: self.end_us.unwrap_or(self.start_us),
            options: self.options.clone(),
            error: self.error.clone(),
        }
    }

    fn is_finished(&self) -> bool {
        self.end_us.is_some()
    }
}

/// Outcome of a `FINISH` lookup
pub enum QueryOutcome {
    /// The stream already finished; the session has retired
    Ready(SessionSnapshot),
    /// The stream is still in flight; resolves when it finishes
    Pending(oneshot::Receiver<SessionSnapshot>),
}

/// Registry of in-flight data sessions, one per peer key
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionKey, DataSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted data connection
    ///
    /// Fails if the key is still held by an unretired session: the peer's
    /// port must not be matched to stale state.
    pub async fn register(&self, key: SessionKey, options: SocketOptions) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&key) {
            return Err(SessionError::KeyInUse(key));
        }
        debug!("session {} opened", key);
        sessions.insert(
            key,
            DataSession {
                received: 0,
                start_us: Utc::now().timestamp_micros(),
                end_us: None,
                error: None,
                options,
                waiter: None,
                parked: None,
            },
        );
        Ok(())
    }

    /// Credit received bytes to a session
    pub async fn add_bytes(&self, key: &SessionKey, count: u64) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(key) {
            session.received += count;
        }
    }

    /// Mark a session finished after end-of-stream, parking its socket
    ///
    /// If a query is already waiting, it is answered now and the session
    /// retires immediately.
    pub async fn finish(&self, key: &SessionKey, stream: Box<dyn DataStream>) {
        self.complete(key, None, Some(stream)).await;
    }

    /// Record a read error on a session; surfaces in the eventual query reply
    pub async fn fail(&self, key: &SessionKey, error: &str, stream: Option<Box<dyn DataStream>>) {
        self.complete(key, Some(sanitize_line(error)), stream).await;
    }

    async fn complete(
        &self,
        key: &SessionKey,
        error: Option<String>,
        stream: Option<Box<dyn DataStream>>,
    ) {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(key) else {
            return;
        };
        session.end_us = Some(Utc::now().timestamp_micros());
        if error.is_some() {
            session.error = error;
        }
        session.parked = stream;

        if session.waiter.is_some() {
            // A control connection is already blocked on this session:
            // answer it and retire in one step.
            let session = sessions.remove(key).expect("session present");
            let snapshot = session.snapshot();
            debug!("session {} finished, notifying waiter and retiring", key);
            if let Some(waiter) = session.waiter {
                let _ = waiter.send(snapshot);
            }
        } else {
            debug!("session {} finished, awaiting query", key);
        }
    }

    /// Resolve a `FINISH` query for a peer key
    ///
    /// A finished session retires and answers immediately; an in-flight one
    /// stores the reply channel. A missing key, or a key whose single
    /// waiter slot is taken, fails.
    pub async fn query(&self, key: &SessionKey) -> Result<QueryOutcome, SessionError> {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(key) else {
            return Err(SessionError::Unknown(key.clone()));
        };

        if session.is_finished() {
            let session = sessions.remove(key).expect("session present");
            let snapshot = session.snapshot();
            // Dropping the parked socket closes it, freeing the peer's port
            drop(session.parked);
            debug!("session {} retired on query", key);
            return Ok(QueryOutcome::Ready(snapshot));
        }

        if session.waiter.is_some() {
            return Err(SessionError::Unknown(key.clone()));
        }

        let (tx, rx) = oneshot::channel();
        session.waiter = Some(tx);
        debug!("session {} query pending until end-of-stream", key);
        Ok(QueryOutcome::Pending(rx))
    }

    /// Number of unretired sessions
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}
