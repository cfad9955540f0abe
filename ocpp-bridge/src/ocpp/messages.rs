//! OCPP-J 1.6 message framing
//!
//! Every frame is a JSON array carried in one WebSocket text message:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! Payloads are opaque `serde_json::Value`s; nothing here validates them
//! against the per-action schemas.

use serde_json::Value;
use thiserror::Error;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    fn from_id(id: i64) -> Option<Self> {
        match id {
            2 => Some(MessageType::Call),
            3 => Some(MessageType::CallResult),
            4 => Some(MessageType::CallError),
            _ => None,
        }
    }

    /// Number of elements a well-formed frame of this type carries
    fn arity(self) -> usize {
        match self {
            MessageType::Call => 4,
            MessageType::CallResult => 3,
            MessageType::CallError => 5,
        }
    }
}

/// OCPP 1.6 CALLERROR codes
///
/// The 1.6 spellings are kept as-is (`FormationViolation`,
/// `OccurenceConstraintViolation`). Codes outside the standard set are carried
/// verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
    Other(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::FormationViolation => "FormationViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::OccurenceConstraintViolation => "OccurenceConstraintViolation",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            ErrorCode::GenericError => "GenericError",
            ErrorCode::Other(code) => code,
        }
    }
}

impl From<&str> for ErrorCode {
    fn from(s: &str) -> Self {
        match s {
            "NotImplemented" => ErrorCode::NotImplemented,
            "NotSupported" => ErrorCode::NotSupported,
            "InternalError" => ErrorCode::InternalError,
            "ProtocolError" => ErrorCode::ProtocolError,
            "SecurityError" => ErrorCode::SecurityError,
            "FormationViolation" => ErrorCode::FormationViolation,
            "PropertyConstraintViolation" => ErrorCode::PropertyConstraintViolation,
            "OccurenceConstraintViolation" => ErrorCode::OccurenceConstraintViolation,
            "TypeConstraintViolation" => ErrorCode::TypeConstraintViolation,
            "GenericError" => ErrorCode::GenericError,
            other => ErrorCode::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Charge-point initiated OCPP 1.6 actions
///
/// Calls carry their action as a plain string, so any action can be sent;
/// this enum only names the ones the bridge builds payloads for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Authorize,
    BootNotification,
    DataTransfer,
    Heartbeat,
    MeterValues,
    StartTransaction,
    StatusNotification,
    StopTransaction,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Authorize => "Authorize",
            Action::BootNotification => "BootNotification",
            Action::DataTransfer => "DataTransfer",
            Action::Heartbeat => "Heartbeat",
            Action::MeterValues => "MeterValues",
            Action::StartTransaction => "StartTransaction",
            Action::StatusNotification => "StatusNotification",
            Action::StopTransaction => "StopTransaction",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the bridge
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Correlation id already pending: {0}")]
    DuplicateCorrelationId(String),

    #[error("OCPP error from central system: {code} - {description}")]
    Remote {
        code: ErrorCode,
        description: String,
        details: Value,
    },

    #[error("Timeout waiting for response")]
    Timeout,

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Session not ready")]
    NotReady,

    #[error("Session closed")]
    SessionClosed,

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    pub fn new(message_id: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: message_id.into(),
            action: action.into(),
            payload,
        }
    }

    fn to_value(&self) -> Value {
        serde_json::json!([
            MessageType::Call as i32,
            &self.message_id,
            &self.action,
            &self.payload
        ])
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    pub fn new(message_id: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: message_id.into(),
            payload,
        }
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, OcppError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    fn to_value(&self) -> Value {
        serde_json::json!([
            MessageType::CallResult as i32,
            &self.message_id,
            &self.payload
        ])
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    /// Create a new CALLERROR with empty details
    pub fn new(
        message_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.error_details = details;
        self
    }

    fn to_value(&self) -> Value {
        serde_json::json!([
            MessageType::CallError as i32,
            &self.message_id,
            self.error_code.as_str(),
            &self.error_description,
            &self.error_details
        ])
    }
}

impl From<CallError> for OcppError {
    fn from(error: CallError) -> Self {
        OcppError::Remote {
            code: error.error_code,
            description: error.error_description,
            details: error.error_details,
        }
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Parse one wire frame
    ///
    /// Pure; every failure is `MalformedFrame`.
    pub fn parse(text: &str) -> Result<Self, OcppError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| OcppError::MalformedFrame(format!("invalid JSON: {}", e)))?;

        let array = value
            .as_array()
            .ok_or_else(|| OcppError::MalformedFrame("frame is not an array".into()))?;

        let type_id = array
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| OcppError::MalformedFrame("missing message type id".into()))?;

        let msg_type = MessageType::from_id(type_id).ok_or_else(|| {
            OcppError::MalformedFrame(format!("unknown message type id {}", type_id))
        })?;

        if array.len() != msg_type.arity() {
            return Err(OcppError::MalformedFrame(format!(
                "{:?} frame has {} elements, expected {}",
                msg_type,
                array.len(),
                msg_type.arity()
            )));
        }

        let message_id = string_at(array, 1, "message id")?;

        match msg_type {
            MessageType::Call => Ok(OcppMessage::Call(Call {
                message_id,
                action: string_at(array, 2, "action")?,
                payload: array[3].clone(),
            })),
            MessageType::CallResult => Ok(OcppMessage::CallResult(CallResult {
                message_id,
                payload: array[2].clone(),
            })),
            MessageType::CallError => {
                let code = string_at(array, 2, "error code")?;
                Ok(OcppMessage::CallError(CallError {
                    message_id,
                    error_code: ErrorCode::from(code.as_str()),
                    error_description: string_at(array, 3, "error description")?,
                    error_details: array[4].clone(),
                }))
            }
        }
    }

    /// Get the message ID
    pub fn message_id(&self) -> &str {
        match self {
            OcppMessage::Call(c) => &c.message_id,
            OcppMessage::CallResult(r) => &r.message_id,
            OcppMessage::CallError(e) => &e.message_id,
        }
    }

    /// Serialize to the wire frame
    pub fn encode(&self) -> String {
        let value = match self {
            OcppMessage::Call(c) => c.to_value(),
            OcppMessage::CallResult(r) => r.to_value(),
            OcppMessage::CallError(e) => e.to_value(),
        };
        value.to_string()
    }
}

fn string_at(array: &[Value], index: usize, field: &str) -> Result<String, OcppError> {
    array[index]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| OcppError::MalformedFrame(format!("{} is not a string", field)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assert_malformed(text: &str) {
        match OcppMessage::parse(text) {
            Err(OcppError::MalformedFrame(_)) => {}
            other => panic!("Expected MalformedFrame for {}, got {:?}", text, other),
        }
    }

    #[test]
    fn test_call_encoding() {
        let call = OcppMessage::Call(Call::new("1-1", "Heartbeat", json!({})));
        assert_eq!(call.encode(), r#"[2,"1-1","Heartbeat",{}]"#);
    }

    #[test]
    fn test_call_error_encoding_defaults_details() {
        let error = CallError::new("srv-9", ErrorCode::NotImplemented, "no handler");
        let text = OcppMessage::CallError(error).encode();
        assert_eq!(text, r#"[4,"srv-9","NotImplemented","no handler",{}]"#);
    }

    #[test]
    fn test_call_parsing() {
        let msg = OcppMessage::parse(r#"[2, "srv-1", "Reset", {"type": "Soft"}]"#).unwrap();

        match msg {
            OcppMessage::Call(call) => {
                assert_eq!(call.message_id, "srv-1");
                assert_eq!(call.action, "Reset");
                assert_eq!(call.payload["type"], "Soft");
            }
            _ => panic!("Expected Call"),
        }
    }

    #[test]
    fn test_call_result_parsing() {
        let json = r#"[3, "msg-123", {"currentTime": "2026-01-20T12:00:00Z"}]"#;
        let msg = OcppMessage::parse(json).unwrap();

        assert_eq!(msg.message_id(), "msg-123");
        match msg {
            OcppMessage::CallResult(result) => {
                assert_eq!(result.payload["currentTime"], "2026-01-20T12:00:00Z");
            }
            _ => panic!("Expected CallResult"),
        }
    }

    #[test]
    fn test_call_error_parsing() {
        let json = r#"[4, "msg-123", "NotSupported", "desc", {"hint": 1}]"#;

        match OcppMessage::parse(json).unwrap() {
            OcppMessage::CallError(error) => {
                assert_eq!(error.message_id, "msg-123");
                assert_eq!(error.error_code, ErrorCode::NotSupported);
                assert_eq!(error.error_description, "desc");
                assert_eq!(error.error_details, json!({"hint": 1}));
            }
            _ => panic!("Expected CallError"),
        }
    }

    #[test]
    fn test_unknown_error_code_is_preserved() {
        let json = r#"[4, "m", "VendorSpecific", "", {}]"#;

        match OcppMessage::parse(json).unwrap() {
            OcppMessage::CallError(error) => {
                assert_eq!(error.error_code, ErrorCode::Other("VendorSpecific".into()));
                assert_eq!(error.error_code.to_string(), "VendorSpecific");
            }
            _ => panic!("Expected CallError"),
        }
    }

    #[test]
    fn test_malformed_frames() {
        assert_malformed("not json");
        assert_malformed(r#"{"id": 1}"#);
        assert_malformed("[]");
        assert_malformed(r#"["2", "m", "Heartbeat", {}]"#);
        assert_malformed(r#"[5, "m", {}]"#);
        assert_malformed(r#"[2, "m", "Heartbeat"]"#);
        assert_malformed(r#"[3, "m", {}, {}]"#);
        assert_malformed(r#"[3, 17, {}]"#);
        assert_malformed(r#"[2, "m", 7, {}]"#);
        // error frames need code and description
        assert_malformed(r#"[4, "m", "GenericError", {}]"#);
        assert_malformed(r#"[4, "m", null, "desc", {}]"#);
        assert_malformed(r#"[4, "m", "GenericError", null, {}]"#);
    }

    #[test]
    fn test_call_error_into_remote_error() {
        let error = CallError::new("m", ErrorCode::InternalError, "boom")
            .with_details(json!({"retry": false}));

        match OcppError::from(error) {
            OcppError::Remote { code, description, details } => {
                assert_eq!(code, ErrorCode::InternalError);
                assert_eq!(description, "boom");
                assert_eq!(details["retry"], false);
            }
            other => panic!("Expected Remote, got {:?}", other),
        }
    }
}
