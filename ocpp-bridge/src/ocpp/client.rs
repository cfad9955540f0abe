//! OCPP WebSocket client
//!
//! `Bridge` is the handle callers share; behind it a single driver task owns
//! the connection to the central system and handles:
//! - WebSocket connection with the OCPP sub-protocol
//! - The handshake (BootNotification) before ordinary calls are admitted
//! - Routing of results/errors to pending calls, and of central-system
//!   requests to the embedder
//! - Reconnection with exponential backoff
//! - Deadline sweeps and heartbeat maintenance

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{header, HeaderValue},
        protocol::WebSocketConfig,
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;

use super::correlation::{CallOutcome, CorrelationTable};
use super::dispatcher::{Dispatcher, Outbox};
use super::messages::*;
use super::session::{Session, SessionEvent, SessionState, SessionStatus};
use super::types::BootNotificationResponse;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Queued frames per connection
const OUTBOX_CAPACITY: usize = 64;

/// Queued central-system requests awaiting the embedder
const INCOMING_CAPACITY: usize = 64;

/// Heartbeat interval (seconds) when the central system grants 0
const DEFAULT_HEARTBEAT_INTERVAL: u64 = 300;

/// How long a graceful close waits for queued frames to flush
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Central-system request for the embedder to answer
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingRequest {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
}

impl IncomingRequest {
    /// Build the CALLRESULT answering this request
    pub fn result(&self, payload: Value) -> CallResult {
        CallResult::new(self.message_id.clone(), payload)
    }

    /// Build a CALLERROR answering this request
    pub fn error(&self, code: ErrorCode, description: impl Into<String>) -> CallError {
        CallError::new(self.message_id.clone(), code, description)
    }
}

/// Why a connection ended
enum Disconnect {
    /// Lost after the session had been Ready
    Lost,
    /// Explicit close
    Shutdown,
}

/// Handle to the bridge; clones share the one session
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Inner>,
}

struct Inner {
    config: BridgeConfig,
    session: Arc<Session>,
    table: Arc<CorrelationTable>,
    outbox: Arc<Outbox>,
    dispatcher: Dispatcher,
    incoming_tx: mpsc::Sender<IncomingRequest>,
    shutdown_tx: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Bridge {
    /// Create a bridge; the receiver yields requests initiated by the central system
    ///
    /// Nothing connects until `start` is called.
    pub fn new(config: BridgeConfig) -> (Self, mpsc::Receiver<IncomingRequest>) {
        let session = Arc::new(Session::new());
        let table = Arc::new(CorrelationTable::new());
        let outbox = Arc::new(Outbox::default());
        let dispatcher = Dispatcher::new(session.clone(), table.clone(), outbox.clone());

        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);

        let bridge = Self {
            inner: Arc::new(Inner {
                config,
                session,
                table,
                outbox,
                dispatcher,
                incoming_tx,
                shutdown_tx,
                driver: Mutex::new(None),
            }),
        };

        (bridge, incoming_rx)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Spawn the connection driver (no-op if it is already running)
    pub fn start(&self) -> Result<(), OcppError> {
        if *self.inner.shutdown_tx.borrow() || self.state() == SessionState::Closing {
            return Err(OcppError::SessionClosed);
        }

        let mut driver = self.inner.driver.lock();
        if driver.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }

        *driver = Some(tokio::spawn(self.inner.clone().run()));
        Ok(())
    }

    /// Shut the session down for good
    ///
    /// Waits for the driver to close the connection. Outstanding calls end
    /// with `ConnectionLost`; later calls fail with `SessionClosed`.
    pub async fn close(&self) {
        self.inner.shutdown_tx.send_replace(true);

        let driver = self.inner.driver.lock().take();
        if let Some(handle) = driver {
            if let Err(e) = handle.await {
                error!("Driver task failed: {}", e);
            }
        }

        self.inner.finish();
    }

    /// Send a CALL and wait up to `timeout` for its result
    pub async fn call(&self, action: &str, payload: Value, timeout: Duration) -> CallOutcome {
        self.inner.dispatcher.call(action, payload, timeout).await
    }

    /// `call` with the configured request timeout
    pub async fn request(&self, action: &str, payload: Value) -> CallOutcome {
        self.call(action, payload, self.inner.config.request_timeout).await
    }

    /// Answer a central-system request
    pub async fn respond(&self, result: CallResult) -> Result<(), OcppError> {
        self.inner.dispatcher.send_frame(OcppMessage::CallResult(result)).await
    }

    /// Answer a central-system request with an error
    pub async fn respond_error(&self, error: CallError) -> Result<(), OcppError> {
        self.inner.dispatcher.send_frame(OcppMessage::CallError(error)).await
    }

    pub fn state(&self) -> SessionState {
        self.inner.session.state()
    }

    pub fn status(&self) -> SessionStatus {
        self.state().status()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.session.subscribe()
    }

    /// Last accepted BootNotification result, if currently registered
    pub fn registration(&self) -> Option<BootNotificationResponse> {
        self.inner.session.registration()
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.table.len()
    }

    /// Wait until the session is Ready
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), OcppError> {
        let mut state_rx = self.subscribe();
        let ready = state_rx.wait_for(|state| {
            matches!(state, SessionState::Ready | SessionState::Closing)
        });

        let reached = match tokio::time::timeout(timeout, ready).await {
            Ok(Ok(state)) => *state,
            Ok(Err(_)) => SessionState::Closing,
            Err(_) => return Err(OcppError::Timeout),
        };

        match reached {
            SessionState::Ready => Ok(()),
            _ => Err(OcppError::SessionClosed),
        }
    }
}

impl Inner {
    /// Connection loop: connect, serve, back off, repeat until shutdown
    async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let sweeper = tokio::spawn(sweep_expired(self.table.clone(), self.config.expiry_tick));
        let url = build_ocpp_url(&self.config.csms_url, &self.config.station_id);

        let mut reconnect_delay = self.config.reconnect_delay;
        let mut failures = 0u32;

        while !*shutdown_rx.borrow() {
            self.session.handle_event(SessionEvent::ConnectRequested);
            info!("Connecting to central system: {}", url);

            match self.connect_and_run(&url, &mut shutdown_rx).await {
                Ok(Disconnect::Shutdown) => break,
                Ok(Disconnect::Lost) => {
                    failures = 0;
                    reconnect_delay = self.config.reconnect_delay;
                }
                Err(e) => {
                    error!("Connection error: {}", e);
                    failures += 1;
                }
            }

            self.outbox.detach();
            self.session.handle_event(SessionEvent::TransportLost);
            let swept = self.table.fail_all(|| OcppError::ConnectionLost);
            if swept > 0 {
                warn!("Resolved {} pending calls with ConnectionLost", swept);
            }

            if let Some(max) = self.config.max_reconnect_attempts {
                if failures >= max {
                    error!("Giving up after {} failed connection attempts", failures);
                    break;
                }
            }

            // Exponential backoff
            info!("Reconnecting in {:?}", reconnect_delay);
            tokio::select! {
                _ = tokio::time::sleep(reconnect_delay) => {}
                _ = shutdown_requested(&mut shutdown_rx) => break,
            }
            reconnect_delay = std::cmp::min(reconnect_delay * 2, self.config.max_reconnect_delay);
        }

        sweeper.abort();
        self.finish();
    }

    /// Enter the terminal state and release everything still pending
    fn finish(&self) {
        self.session.handle_event(SessionEvent::ShutdownRequested);
        self.outbox.detach();
        let swept = self.table.fail_all(|| OcppError::ConnectionLost);
        if swept > 0 {
            warn!("Resolved {} pending calls with ConnectionLost on close", swept);
        }
    }

    /// Open the WebSocket with the OCPP sub-protocol
    async fn connect(&self, url: &str) -> Result<WsStream, OcppError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| OcppError::Transport(e.to_string()))?;
        let protocol = HeaderValue::from_str(&self.config.subprotocol)
            .map_err(|e| OcppError::Transport(e.to_string()))?;
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, protocol);

        let ws_config = WebSocketConfig {
            max_message_size: Some(64 * 1024),
            max_frame_size: Some(16 * 1024),
            ..Default::default()
        };

        let (ws_stream, response) = connect_async_with_config(request, Some(ws_config), false)
            .await
            .map_err(|e| {
                error!("WebSocket connection failed: {}", e);
                OcppError::Transport(e.to_string())
            })?;

        // Verify subprotocol
        let accepted_protocol = response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());

        if accepted_protocol != Some(self.config.subprotocol.as_str()) {
            warn!(
                "Central system did not accept {} subprotocol, got: {:?}",
                self.config.subprotocol, accepted_protocol
            );
        }

        info!("WebSocket connected to {}", url);
        Ok(ws_stream)
    }

    /// Connect and run until disconnection
    async fn connect_and_run(
        &self,
        url: &str,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<Disconnect, OcppError> {
        let ws_stream = tokio::select! {
            result = self.connect(url) => match result {
                Ok(stream) => stream,
                Err(e) => {
                    self.session.handle_event(SessionEvent::ConnectFailed);
                    return Err(e);
                }
            },
            _ = shutdown_requested(shutdown_rx) => return Ok(Disconnect::Shutdown),
        };

        self.session.handle_event(SessionEvent::Connected);

        let (ws_tx, ws_rx) = ws_stream.split();
        let (send_tx, send_rx) = mpsc::channel(OUTBOX_CAPACITY);
        self.outbox.attach(send_tx);

        let writer = write_loop(ws_tx, send_rx);
        let reader = self.read_loop(ws_rx);
        let handshake = self.handshake();
        tokio::pin!(writer, reader, handshake);

        let handshake_result = tokio::select! {
            result = &mut handshake => result,
            _ = &mut reader => {
                self.session.handle_event(SessionEvent::TransportLost);
                return Err(OcppError::ConnectionLost);
            }
            _ = &mut writer => {
                self.session.handle_event(SessionEvent::TransportLost);
                return Err(OcppError::ConnectionLost);
            }
            _ = shutdown_requested(shutdown_rx) => {
                self.drain_and_close(writer.as_mut()).await;
                return Ok(Disconnect::Shutdown);
            }
        };

        match handshake_result {
            Ok(registration) => {
                if let Some(registration) = registration {
                    self.session.record_registration(registration);
                }
                self.session.handle_event(SessionEvent::HandshakeAccepted);
            }
            Err(e) => {
                warn!("Handshake failed: {}", e);
                self.session.handle_event(SessionEvent::HandshakeFailed);
                return Err(e);
            }
        }

        let period = self.heartbeat_period();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut reader => {
                    self.session.handle_event(SessionEvent::TransportLost);
                    return Ok(Disconnect::Lost);
                }
                _ = &mut writer => {
                    self.session.handle_event(SessionEvent::TransportLost);
                    return Ok(Disconnect::Lost);
                }
                _ = shutdown_requested(shutdown_rx) => {
                    self.drain_and_close(writer.as_mut()).await;
                    return Ok(Disconnect::Shutdown);
                }
                _ = heartbeat.tick(), if self.config.heartbeat => self.spawn_heartbeat(),
            }
        }
    }

    /// Send the handshake and check for the accepted status
    async fn handshake(&self) -> Result<Option<BootNotificationResponse>, OcppError> {
        let payload = serde_json::to_value(self.config.boot_notification())?;
        let result = self
            .dispatcher
            .call_handshake(
                &self.config.handshake_action,
                payload,
                self.config.handshake_timeout,
            )
            .await?;

        let status = result.get("status").and_then(Value::as_str).unwrap_or_default();
        if status != self.config.handshake_accepted_status {
            return Err(OcppError::HandshakeRejected(format!("status {:?}", status)));
        }

        Ok(serde_json::from_value(result).ok())
    }

    fn heartbeat_period(&self) -> Duration {
        let secs = self
            .session
            .registration()
            .map(|r| u64::from(r.interval))
            .filter(|interval| *interval > 0)
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        Duration::from_secs(secs)
    }

    fn spawn_heartbeat(&self) {
        let dispatcher = self.dispatcher.clone();
        let timeout = self.config.request_timeout;

        tokio::spawn(async move {
            match dispatcher.call(Action::Heartbeat.as_str(), json!({}), timeout).await {
                Ok(result) => debug!("Heartbeat acknowledged: {}", result),
                Err(e) => warn!("Heartbeat failed: {}", e),
            }
        });
    }

    /// Stop accepting frames, let the writer flush and send Close
    async fn drain_and_close<F>(&self, writer: Pin<&mut F>)
    where
        F: Future<Output = ()>,
    {
        self.session.handle_event(SessionEvent::ShutdownRequested);
        self.outbox.detach();
        if tokio::time::timeout(CLOSE_GRACE, writer).await.is_err() {
            warn!("Writer did not drain within {:?}", CLOSE_GRACE);
        }
    }

    async fn read_loop<S>(&self, mut stream: S)
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    debug!("Received: {}", text);
                    self.route_inbound(&text).await;
                }
                Ok(Message::Binary(_)) => {
                    warn!("Dropping malformed frame: binary message");
                }
                Ok(Message::Close(frame)) => {
                    info!("WebSocket closed by central system: {:?}", frame);
                    return;
                }
                Ok(_) => {
                    // Ping/pong are answered by tungstenite
                }
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    return;
                }
            }
        }

        info!("WebSocket stream ended");
    }

    async fn route_inbound(&self, text: &str) {
        match OcppMessage::parse(text) {
            Ok(OcppMessage::CallResult(result)) => {
                self.table.resolve(&result.message_id, Ok(result.payload));
            }
            Ok(OcppMessage::CallError(error)) => {
                let message_id = error.message_id.clone();
                self.table.resolve(&message_id, Err(error.into()));
            }
            Ok(OcppMessage::Call(call)) => {
                self.forward_incoming(IncomingRequest {
                    message_id: call.message_id,
                    action: call.action,
                    payload: call.payload,
                })
                .await;
            }
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
            }
        }
    }

    /// Hand a central-system request to the embedder, or refuse it ourselves
    async fn forward_incoming(&self, request: IncomingRequest) {
        debug!("Central system request: {} ({})", request.action, request.message_id);

        let Err(e) = self.incoming_tx.try_send(request) else {
            return;
        };

        let request = e.into_inner();
        warn!(
            "No handler accepted {} ({}), answering NotImplemented",
            request.action, request.message_id
        );
        let reply = request.error(
            ErrorCode::NotImplemented,
            format!("{} is not handled by this charge point", request.action),
        );
        if let Err(e) = self.dispatcher.send_frame(OcppMessage::CallError(reply)).await {
            warn!("Failed to answer {}: {}", request.message_id, e);
        }
    }
}

/// Single writer for one connection
async fn write_loop<S>(mut sink: S, mut outgoing: mpsc::Receiver<OcppMessage>)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(message) = outgoing.recv().await {
        let text = message.encode();
        debug!("Sending: {}", text);

        if let Err(e) = sink.send(Message::Text(text.into())).await {
            error!("Failed to send WebSocket message: {}", e);
            return;
        }
    }

    debug!("Outbox detached, closing WebSocket");
    if let Err(e) = sink.close().await {
        debug!("WebSocket close failed: {}", e);
    }
}

/// Periodic deadline sweep over the correlation table
async fn sweep_expired(table: Arc<CorrelationTable>, tick: Duration) {
    let mut ticker = tokio::time::interval(tick.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let expired = table.expire(Instant::now());
        if expired > 0 {
            debug!("Expired {} pending calls", expired);
        }
    }
}

async fn shutdown_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    // a dropped sender also counts as shutdown
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

/// Build the full OCPP WebSocket URL
pub fn build_ocpp_url(base_url: &str, station_id: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), station_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_ocpp_url() {
        let url = build_ocpp_url("ws://localhost:8180/steve/websocket/CentralSystemService", "CP001");
        assert_eq!(
            url,
            "ws://localhost:8180/steve/websocket/CentralSystemService/CP001"
        );

        let url = build_ocpp_url("ws://localhost:8180/steve/websocket/CentralSystemService/", "CP001");
        assert_eq!(
            url,
            "ws://localhost:8180/steve/websocket/CentralSystemService/CP001"
        );
    }

    #[test]
    fn test_incoming_request_replies_echo_id() {
        let request = IncomingRequest {
            message_id: "srv-7".into(),
            action: "Reset".into(),
            payload: json!({"type": "Soft"}),
        };

        let result = request.result(json!({"status": "Accepted"}));
        assert_eq!(result.message_id, "srv-7");

        let error = request.error(ErrorCode::NotSupported, "no resets");
        assert_eq!(error.message_id, "srv-7");
        assert_eq!(error.error_code, ErrorCode::NotSupported);
    }

    #[tokio::test]
    async fn test_closed_bridge_refuses_start_and_calls() {
        let (bridge, _incoming) = Bridge::new(BridgeConfig::default());
        assert_eq!(bridge.status(), SessionStatus::NotReady);

        bridge.close().await;
        assert_eq!(bridge.status(), SessionStatus::Closed);
        assert!(matches!(bridge.start(), Err(OcppError::SessionClosed)));

        let outcome = bridge.call("Heartbeat", json!({}), Duration::from_secs(1)).await;
        assert!(matches!(outcome, Err(OcppError::SessionClosed)));
        assert!(matches!(
            bridge.wait_ready(Duration::from_millis(10)).await,
            Err(OcppError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_unstarted_bridge_is_not_ready() {
        let (bridge, _incoming) = Bridge::new(BridgeConfig::default());

        let outcome = bridge.request("Heartbeat", json!({})).await;
        assert!(matches!(outcome, Err(OcppError::NotReady)));
        assert!(matches!(
            bridge.wait_ready(Duration::from_millis(10)).await,
            Err(OcppError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_central_system_gives_up() {
        let config = BridgeConfig::new("CP001", "ws://127.0.0.1:1")
            .with_reconnect(Duration::from_millis(5), Duration::from_millis(10))
            .with_max_reconnect_attempts(2);
        let (bridge, _incoming) = Bridge::new(config);
        bridge.start().unwrap();

        let mut state_rx = bridge.subscribe();
        let closed = state_rx.wait_for(|state| *state == SessionState::Closing);
        tokio::time::timeout(Duration::from_secs(5), closed)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(bridge.status(), SessionStatus::Closed);
        bridge.close().await;
    }
}
