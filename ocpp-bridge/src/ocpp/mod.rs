//! OCPP 1.6 JSON protocol layer
//!
//! - `types`: OCPP 1.6 payloads for charge-point initiated messages
//! - `messages`: frame codec (CALL, CALLRESULT, CALLERROR) and errors
//! - `correlation`: pending calls keyed by correlation id
//! - `session`: connection lifecycle state machine
//! - `gate`: admission of calls per session state
//! - `dispatcher`: issue a call and await its outcome
//! - `client`: WebSocket connection driver and the `Bridge` handle
//! - `commands`: typed wrappers for common charge-point messages

pub mod types;
pub mod messages;
pub mod correlation;
pub mod session;
pub mod gate;
pub mod dispatcher;
pub mod client;
mod commands;

pub use types::*;
pub use messages::*;
pub use correlation::{CallOutcome, CorrelationTable};
pub use session::{Session, SessionEvent, SessionState, SessionStatus};
pub use dispatcher::Dispatcher;
pub use client::{build_ocpp_url, Bridge, IncomingRequest};
