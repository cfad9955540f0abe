//! OCPP session state machine
//!
//! Tracks the lifecycle of the one connection to the central system:
//!
//! ```text
//! Disconnected ──► Connecting ──► AwaitingHandshake ──► Ready
//!      ▲               │                 │                │
//!      └───────────────┴─────────────────┴────────────────┘
//!                    (connect failure / handshake failure / transport lost)
//!
//! any state ──► Closing (terminal)
//! ```
//!
//! Only the connection driver feeds events in; everything else observes the
//! state through `state()` or a `watch` subscription.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::types::BootNotificationResponse;

/// Session state in the connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No connection, possibly waiting to reconnect
    Disconnected,
    /// Transport connect in progress
    Connecting,
    /// Connected, handshake CALL in flight
    AwaitingHandshake,
    /// Handshake accepted, ordinary calls permitted
    Ready,
    /// Shut down for good
    Closing,
}

/// Coarse status exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Ready,
    NotReady,
    Closed,
}

impl SessionState {
    pub fn status(self) -> SessionStatus {
        match self {
            SessionState::Ready => SessionStatus::Ready,
            SessionState::Closing => SessionStatus::Closed,
            _ => SessionStatus::NotReady,
        }
    }

    /// Next state for `event`, or None if the event does not apply here
    pub fn next(self, event: &SessionEvent) -> Option<SessionState> {
        use SessionEvent as E;
        use SessionState as S;

        match (self, event) {
            (S::Closing, _) => None,
            (_, E::ShutdownRequested) => Some(S::Closing),
            (S::Disconnected, E::ConnectRequested) => Some(S::Connecting),
            (S::Connecting, E::Connected) => Some(S::AwaitingHandshake),
            (S::Connecting, E::ConnectFailed) => Some(S::Disconnected),
            (S::AwaitingHandshake, E::HandshakeAccepted) => Some(S::Ready),
            (S::AwaitingHandshake, E::HandshakeFailed) => Some(S::Disconnected),
            (S::Connecting | S::AwaitingHandshake | S::Ready, E::TransportLost) => {
                Some(S::Disconnected)
            }
            _ => None,
        }
    }
}

/// Events that drive the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Start or reconnect requested
    ConnectRequested,
    /// WebSocket connected with the sub-protocol negotiated
    Connected,
    /// WebSocket connect failed
    ConnectFailed,
    /// Handshake CALL answered with the accepted status
    HandshakeAccepted,
    /// Handshake rejected, errored or timed out
    HandshakeFailed,
    /// Read/write failure or remote close
    TransportLost,
    /// Explicit shutdown
    ShutdownRequested,
}

/// Connection lifecycle owner
#[derive(Debug)]
pub struct Session {
    state_tx: watch::Sender<SessionState>,
    /// Incremented on every successful connect
    epoch: AtomicU64,
    /// Last accepted handshake result, cleared on disconnect
    registration: Mutex<Option<BootNotificationResponse>>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            state_tx,
            epoch: AtomicU64::new(0),
            registration: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn registration(&self) -> Option<BootNotificationResponse> {
        self.registration.lock().clone()
    }

    pub fn record_registration(&self, response: BootNotificationResponse) {
        *self.registration.lock() = Some(response);
    }

    /// Apply an event and return the resulting state
    pub fn handle_event(&self, event: SessionEvent) -> SessionState {
        let mut transition = None;

        self.state_tx.send_if_modified(|state| match state.next(&event) {
            Some(next) => {
                if next == SessionState::AwaitingHandshake {
                    self.epoch.fetch_add(1, Ordering::SeqCst);
                }
                transition = Some((*state, next));
                *state = next;
                true
            }
            None => false,
        });

        match transition {
            Some((from, to)) => {
                match to {
                    SessionState::AwaitingHandshake => {
                        info!("Session connected (epoch {}), awaiting handshake", self.epoch());
                    }
                    SessionState::Ready => info!("Session ready"),
                    SessionState::Disconnected => {
                        self.registration.lock().take();
                        warn!("Session disconnected ({:?} on {:?})", event, from);
                    }
                    SessionState::Closing => info!("Session closing"),
                    SessionState::Connecting => debug!("Session connecting"),
                }
                to
            }
            None => {
                let current = self.state();
                debug!("Ignoring session event {:?} in state {:?}", event, current);
                current
            }
        }
    }
}
