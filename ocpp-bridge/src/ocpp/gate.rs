//! Handshake gate
//!
//! Ordinary calls are only admitted once the session is Ready. Until then
//! they fail fast with `NotReady` instead of queueing; the single handshake
//! CALL issued by the connection driver is the only one let through while
//! the session is awaiting its handshake.

use super::messages::OcppError;
use super::session::SessionState;

/// Which path a call is dispatched on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Any caller-issued call
    Ordinary,
    /// The driver's handshake call
    Handshake,
}

/// Decide whether a call may be written in `state`
pub fn admit(state: SessionState, kind: CallKind) -> Result<(), OcppError> {
    match (state, kind) {
        (SessionState::Ready, CallKind::Ordinary) => Ok(()),
        (SessionState::AwaitingHandshake, CallKind::Handshake) => Ok(()),
        (SessionState::Closing, _) => Err(OcppError::SessionClosed),
        _ => Err(OcppError::NotReady),
    }
}
