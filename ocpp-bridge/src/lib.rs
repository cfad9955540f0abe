//! # OCPP Bridge
//!
//! Charge-point side OCPP 1.6 JSON bridge: turns the asynchronous WebSocket
//! connection to a central system into plain request/response calls.
//!
//! ## Architecture
//!
//! ```text
//!   callers (CLI, services, tests)
//!       │ call(action, payload, timeout)
//!       ▼
//! ┌─────────────────────────────────────────┐
//! │    ocpp-bridge                          │
//! │  ┌──────┐  ┌────────────┐  ┌─────────┐  │
//! │  │ Gate │─►│ Dispatcher │─►│ Writer  │──┼──► [2,id,action,payload]
//! │  └──────┘  └─────┬──────┘  └─────────┘  │
//! │                  │ register             │
//! │           ┌──────▼──────┐  ┌─────────┐  │
//! │           │ Correlation │◄─│ Reader  │◄─┼─── [3,id,payload] / [4,id,...]
//! │           │ Table       │  └─────────┘  │
//! │           └─────────────┘               │
//! │  Session: Disconnected → Connecting →   │
//! │           AwaitingHandshake → Ready     │
//! └─────────────────────────────────────────┘
//!       │ WebSocket, sub-protocol "ocpp1.6"
//!       ▼
//!   OCPP Central System
//! ```
//!
//! Every call resolves exactly once: with the peer's result, the peer's
//! error, `Timeout`, or `ConnectionLost`. Ordinary calls are refused with
//! `NotReady` until BootNotification has been accepted.
//!
//! ## Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use ocpp_bridge::{Bridge, BridgeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BridgeConfig::new(
//!         "CP001",
//!         "ws://localhost:8180/steve/websocket/CentralSystemService",
//!     );
//!
//!     let (bridge, _incoming) = Bridge::new(config);
//!     bridge.start()?;
//!     bridge.wait_ready(Duration::from_secs(30)).await?;
//!
//!     let heartbeat = bridge.heartbeat().await?;
//!     println!("Central system time: {}", heartbeat.current_time);
//!
//!     bridge.close().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod ocpp;

pub use config::{BridgeConfig, OCPP16_SUBPROTOCOL};

// Re-export key types
pub use ocpp::{
    Action, Bridge, CallError, CallOutcome, CallResult, ErrorCode, IncomingRequest, OcppError,
    OcppMessage, SessionState, SessionStatus,
};
