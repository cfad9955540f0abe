//! Call dispatch
//!
//! `Dispatcher::call` is the one operation callers use: gate check, fresh
//! correlation id, register, hand the frame to the connection's writer, then
//! wait for the correlated outcome or the deadline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;

use super::correlation::{CallOutcome, CorrelationTable};
use super::gate::{self, CallKind};
use super::messages::{Call, OcppError, OcppMessage};
use super::session::Session;

/// Handle to the current connection's writer task
///
/// Empty while disconnected. The writer is the only thing that touches the
/// socket's sink, so each queued message goes out as one whole frame.
#[derive(Debug, Default)]
pub struct Outbox {
    tx: Mutex<Option<mpsc::Sender<OcppMessage>>>,
}

impl Outbox {
    pub fn attach(&self, tx: mpsc::Sender<OcppMessage>) {
        *self.tx.lock() = Some(tx);
    }

    pub fn detach(&self) {
        self.tx.lock().take();
    }

    pub fn sender(&self) -> Option<mpsc::Sender<OcppMessage>> {
        self.tx.lock().clone()
    }
}

/// Issues CALLs and awaits their outcomes
#[derive(Clone)]
pub struct Dispatcher {
    session: Arc<Session>,
    table: Arc<CorrelationTable>,
    outbox: Arc<Outbox>,
    sequence: Arc<AtomicU64>,
}

impl Dispatcher {
    pub fn new(session: Arc<Session>, table: Arc<CorrelationTable>, outbox: Arc<Outbox>) -> Self {
        Self {
            session,
            table,
            outbox,
            sequence: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Send a CALL and wait for its result
    ///
    /// Fails fast with `NotReady` / `SessionClosed` without touching the
    /// connection. Otherwise exactly one frame is written and the outcome is
    /// the peer's result, its error, `Timeout`, or `ConnectionLost`.
    pub async fn call(&self, action: &str, payload: Value, timeout: Duration) -> CallOutcome {
        self.dispatch(CallKind::Ordinary, action, payload, timeout).await
    }

    /// Send the handshake CALL; only admitted while awaiting the handshake
    pub(crate) async fn call_handshake(
        &self,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> CallOutcome {
        self.dispatch(CallKind::Handshake, action, payload, timeout).await
    }

    /// Queue a frame that is not correlated on our side (answers to peer CALLs)
    pub(crate) async fn send_frame(&self, message: OcppMessage) -> Result<(), OcppError> {
        let sender = self.outbox.sender().ok_or(OcppError::ConnectionLost)?;
        sender.send(message).await.map_err(|_| OcppError::ConnectionLost)
    }

    /// Correlation id unique across reconnects: `<epoch>-<sequence>`
    fn next_message_id(&self) -> String {
        format!(
            "{}-{}",
            self.session.epoch(),
            self.sequence.fetch_add(1, Ordering::Relaxed)
        )
    }

    async fn dispatch(
        &self,
        kind: CallKind,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> CallOutcome {
        gate::admit(self.session.state(), kind)?;
        let sender = self.outbox.sender().ok_or(OcppError::NotReady)?;

        let message_id = self.next_message_id();
        let deadline = Instant::now() + timeout;

        // register before writing so a fast response always finds its entry
        let outcome_rx = self.table.register(&message_id, action, deadline)?;

        let call = Call::new(message_id.clone(), action, payload);
        let written = tokio::time::timeout_at(deadline, sender.send(OcppMessage::Call(call))).await;
        // waiting callers must not keep the writer's channel open
        drop(sender);

        match written {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                self.table.withdraw(&message_id);
                return Err(OcppError::ConnectionLost);
            }
            Err(_) => {
                debug!(correlation_id = %message_id, "Outbox full until the deadline");
            }
        }

        self.await_outcome(&message_id, outcome_rx, deadline).await
    }

    async fn await_outcome(
        &self,
        message_id: &str,
        mut outcome_rx: oneshot::Receiver<CallOutcome>,
        deadline: Instant,
    ) -> CallOutcome {
        match tokio::time::timeout_at(deadline, &mut outcome_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(OcppError::ConnectionLost),
            Err(_) => {
                if self.table.withdraw(message_id) {
                    debug!(correlation_id = message_id, "Call timed out");
                    Err(OcppError::Timeout)
                } else {
                    // resolved or swept between the deadline and the withdraw
                    outcome_rx.await.unwrap_or(Err(OcppError::ConnectionLost))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::session::{SessionEvent, SessionState};
    use serde_json::json;

    struct Harness {
        session: Arc<Session>,
        table: Arc<CorrelationTable>,
        outbox: Arc<Outbox>,
        dispatcher: Dispatcher,
    }

    fn harness() -> Harness {
        let session = Arc::new(Session::new());
        let table = Arc::new(CorrelationTable::new());
        let outbox = Arc::new(Outbox::default());
        let dispatcher = Dispatcher::new(session.clone(), table.clone(), outbox.clone());
        Harness { session, table, outbox, dispatcher }
    }

    fn connect(h: &Harness) -> mpsc::Receiver<OcppMessage> {
        let (tx, rx) = mpsc::channel(8);
        h.outbox.attach(tx);
        h.session.handle_event(SessionEvent::ConnectRequested);
        h.session.handle_event(SessionEvent::Connected);
        rx
    }

    fn expect_call(message: OcppMessage) -> Call {
        match message {
            OcppMessage::Call(call) => call,
            other => panic!("Expected Call, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_not_ready_writes_nothing() {
        let h = harness();
        let mut rx = connect(&h);
        assert_eq!(h.session.state(), SessionState::AwaitingHandshake);

        let outcome = h.dispatcher.call("Heartbeat", json!({}), Duration::from_secs(1)).await;
        assert!(matches!(outcome, Err(OcppError::NotReady)));
        assert!(rx.try_recv().is_err());
        assert!(h.table.is_empty());
    }

    #[tokio::test]
    async fn test_call_is_registered_before_write_and_resolved() {
        let h = harness();
        let mut rx = connect(&h);
        h.session.handle_event(SessionEvent::HandshakeAccepted);

        let dispatcher = h.dispatcher.clone();
        let call = tokio::spawn(async move {
            dispatcher.call("Heartbeat", json!({}), Duration::from_secs(5)).await
        });

        let sent = expect_call(rx.recv().await.unwrap());
        assert_eq!(sent.action, "Heartbeat");
        assert!(sent.message_id.starts_with("1-"));
        assert!(h.table.contains(&sent.message_id));

        h.table.resolve(&sent.message_id, Ok(json!({"currentTime": "2023-05-21T15:00:00Z"})));
        let result = call.await.unwrap().unwrap();
        assert_eq!(result["currentTime"], "2023-05-21T15:00:00Z");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handshake_bypasses_gate() {
        let h = harness();
        let mut rx = connect(&h);

        let dispatcher = h.dispatcher.clone();
        let handshake = tokio::spawn(async move {
            dispatcher
                .call_handshake("BootNotification", json!({}), Duration::from_secs(5))
                .await
        });

        let sent = expect_call(rx.recv().await.unwrap());
        assert_eq!(sent.action, "BootNotification");
        h.table.resolve(&sent.message_id, Ok(json!({"status": "Accepted"})));
        assert_eq!(handshake.await.unwrap().unwrap()["status"], "Accepted");
    }

    #[tokio::test]
    async fn test_timeout_withdraws_entry() {
        let h = harness();
        let _rx = connect(&h);
        h.session.handle_event(SessionEvent::HandshakeAccepted);

        let outcome = h
            .dispatcher
            .call("Heartbeat", json!({}), Duration::from_millis(20))
            .await;
        assert!(matches!(outcome, Err(OcppError::Timeout)));
        assert!(h.table.is_empty());
    }

    #[tokio::test]
    async fn test_closed_writer_is_connection_lost() {
        let h = harness();
        let rx = connect(&h);
        h.session.handle_event(SessionEvent::HandshakeAccepted);
        drop(rx);

        let outcome = h.dispatcher.call("Heartbeat", json!({}), Duration::from_secs(1)).await;
        assert!(matches!(outcome, Err(OcppError::ConnectionLost)));
        assert!(h.table.is_empty());
    }

    #[tokio::test]
    async fn test_full_outbox_times_out_at_deadline() {
        let h = harness();
        let (tx, mut rx) = mpsc::channel(1);
        tx.try_send(OcppMessage::Call(Call::new("0-0", "Heartbeat", json!({}))))
            .unwrap();
        h.outbox.attach(tx);
        h.session.handle_event(SessionEvent::ConnectRequested);
        h.session.handle_event(SessionEvent::Connected);
        h.session.handle_event(SessionEvent::HandshakeAccepted);

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            h.dispatcher.call("Heartbeat", json!({}), Duration::from_millis(50)),
        )
        .await
        .expect("call outlived its deadline");

        assert!(matches!(outcome, Err(OcppError::Timeout)));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(h.table.is_empty());

        // only the frame queued beforehand was ever written
        assert_eq!(rx.recv().await.unwrap().message_id(), "0-0");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pending_call_does_not_hold_writer_open() {
        let h = harness();
        let mut rx = connect(&h);
        h.session.handle_event(SessionEvent::HandshakeAccepted);

        let dispatcher = h.dispatcher.clone();
        let call = tokio::spawn(async move {
            dispatcher.call("Heartbeat", json!({}), Duration::from_secs(5)).await
        });

        let sent = expect_call(rx.recv().await.unwrap());
        assert!(h.table.contains(&sent.message_id));

        h.outbox.detach();
        let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert!(matches!(closed, Ok(None)));

        h.table.fail_all(|| OcppError::ConnectionLost);
        assert!(matches!(call.await.unwrap(), Err(OcppError::ConnectionLost)));
    }

    #[test]
    fn test_message_ids_are_unique_and_epoch_prefixed() {
        let h = harness();
        h.session.handle_event(SessionEvent::ConnectRequested);
        h.session.handle_event(SessionEvent::Connected);

        let first = h.dispatcher.next_message_id();
        let second = h.dispatcher.next_message_id();
        assert_ne!(first, second);
        assert!(first.starts_with("1-"));

        h.session.handle_event(SessionEvent::TransportLost);
        h.session.handle_event(SessionEvent::ConnectRequested);
        h.session.handle_event(SessionEvent::Connected);
        assert!(h.dispatcher.next_message_id().starts_with("2-"));
    }
}
