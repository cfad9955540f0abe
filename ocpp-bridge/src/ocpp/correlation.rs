//! Outstanding CALL correlation
//!
//! Every CALL the bridge issues is registered here under its message id
//! before the frame is written. The entry then ends exactly once, by
//! whichever comes first:
//! - a matching CALLRESULT / CALLERROR (`resolve`)
//! - the deadline sweep (`expire`) or the caller's own deadline (`withdraw`)
//! - a disconnect sweep (`fail_all`)
//!
//! Removal and delivery happen under the same lock, so a late frame for an
//! id that has already been swept finds nothing and is reported as unmatched.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::messages::OcppError;

/// What a caller eventually receives for one CALL
pub type CallOutcome = Result<Value, OcppError>;

/// A CALL awaiting its outcome
struct PendingCall {
    action: String,
    issued_at: Instant,
    deadline: Instant,
    outcome_tx: oneshot::Sender<CallOutcome>,
}

impl PendingCall {
    fn deliver(self, message_id: &str, outcome: CallOutcome) {
        if self.outcome_tx.send(outcome).is_err() {
            debug!(
                correlation_id = message_id,
                action = %self.action,
                "Caller went away before its outcome arrived"
            );
        }
    }
}

/// Message id -> pending CALL
#[derive(Default)]
pub struct CorrelationTable {
    pending: Mutex<HashMap<String, PendingCall>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a CALL and get the receiving half of its outcome
    ///
    /// Fails with `DuplicateCorrelationId` if the id is still pending.
    pub fn register(
        &self,
        message_id: &str,
        action: &str,
        deadline: Instant,
    ) -> Result<oneshot::Receiver<CallOutcome>, OcppError> {
        let mut pending = self.pending.lock();

        match pending.entry(message_id.to_string()) {
            Entry::Occupied(_) => {
                warn!(correlation_id = message_id, "Refusing to reuse pending correlation id");
                Err(OcppError::DuplicateCorrelationId(message_id.to_string()))
            }
            Entry::Vacant(slot) => {
                let (outcome_tx, outcome_rx) = oneshot::channel();
                slot.insert(PendingCall {
                    action: action.to_string(),
                    issued_at: Instant::now(),
                    deadline,
                    outcome_tx,
                });
                debug!(
                    correlation_id = message_id,
                    action,
                    pending = pending.len(),
                    "Registered pending call"
                );
                Ok(outcome_rx)
            }
        }
    }

    /// Deliver the outcome for `message_id`
    ///
    /// Returns false when nothing was pending under that id (never issued, or
    /// already expired); that is logged as an unmatched response.
    pub fn resolve(&self, message_id: &str, outcome: CallOutcome) -> bool {
        let mut pending = self.pending.lock();

        match pending.remove(message_id) {
            Some(call) => {
                debug!(
                    correlation_id = message_id,
                    action = %call.action,
                    elapsed = ?call.issued_at.elapsed(),
                    "Resolved pending call"
                );
                call.deliver(message_id, outcome);
                true
            }
            None => {
                warn!(correlation_id = message_id, "Unmatched response, discarding");
                false
            }
        }
    }

    /// Drop a pending entry without delivering anything
    ///
    /// Used by the owner of the receiving half. Returns false if the entry was
    /// already resolved, in which case its outcome is waiting in the receiver.
    pub fn withdraw(&self, message_id: &str) -> bool {
        self.pending.lock().remove(message_id).is_some()
    }

    /// Resolve every entry whose deadline is at or before `now` with `Timeout`
    pub fn expire(&self, now: Instant) -> usize {
        let mut pending = self.pending.lock();

        let expired: Vec<String> = pending
            .iter()
            .filter(|(_, call)| call.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for message_id in &expired {
            if let Some(call) = pending.remove(message_id) {
                debug!(
                    correlation_id = %message_id,
                    action = %call.action,
                    "Pending call timed out"
                );
                call.deliver(message_id, Err(OcppError::Timeout));
            }
        }

        expired.len()
    }

    /// Resolve every entry with the error produced by `reason`
    pub fn fail_all(&self, reason: impl Fn() -> OcppError) -> usize {
        let drained: Vec<(String, PendingCall)> = self.pending.lock().drain().collect();
        let count = drained.len();

        for (message_id, call) in drained {
            call.deliver(&message_id, Err(reason()));
        }

        count
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.pending.lock().contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}
