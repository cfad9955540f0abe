//! Configuration for the OCPP bridge
//!
//! Identity reported in the handshake, the central-system endpoint, and the
//! timing knobs for calls, expiry and reconnection.

use std::time::Duration;

use crate::ocpp::{Action, BootNotificationRequest};

/// OCPP 1.6 JSON WebSocket sub-protocol
pub const OCPP16_SUBPROTOCOL: &str = "ocpp1.6";

/// Complete bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Central system WebSocket URL (without station ID)
    pub csms_url: String,

    /// Charge point identity (appended to URL)
    pub station_id: String,

    /// Vendor name for BootNotification
    pub vendor: String,

    /// Model name for BootNotification
    pub model: String,

    /// Serial number (optional)
    pub serial_number: Option<String>,

    /// Firmware version (optional)
    pub firmware_version: Option<String>,

    /// Sub-protocol token requested on connect
    pub subprotocol: String,

    /// Action sent as the handshake
    pub handshake_action: String,

    /// `status` value of the handshake result that opens the session
    pub handshake_accepted_status: String,

    /// Timeout for the handshake call
    pub handshake_timeout: Duration,

    /// Default timeout for calls issued without an explicit one
    pub request_timeout: Duration,

    /// How often expired calls are swept
    pub expiry_tick: Duration,

    /// Initial reconnect delay
    pub reconnect_delay: Duration,

    /// Maximum reconnect delay (exponential backoff cap)
    pub max_reconnect_delay: Duration,

    /// Consecutive failed connections before giving up (None = forever)
    pub max_reconnect_attempts: Option<u32>,

    /// Send Heartbeat at the interval granted by the handshake
    pub heartbeat: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            csms_url: "ws://localhost:8180/steve/websocket/CentralSystemService".to_string(),
            station_id: "CP001".to_string(),
            vendor: "Vendor_Y".to_string(),
            model: "Model_X".to_string(),
            serial_number: None,
            firmware_version: None,
            subprotocol: OCPP16_SUBPROTOCOL.to_string(),
            handshake_action: Action::BootNotification.to_string(),
            handshake_accepted_status: "Accepted".to_string(),
            handshake_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            expiry_tick: Duration::from_millis(100),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(300),
            max_reconnect_attempts: None,
            heartbeat: true,
        }
    }
}

impl BridgeConfig {
    /// Create config with basic parameters
    pub fn new(station_id: impl Into<String>, csms_url: impl Into<String>) -> Self {
        Self {
            csms_url: csms_url.into(),
            station_id: station_id.into(),
            ..Default::default()
        }
    }

    /// Set vendor info
    pub fn with_vendor(mut self, vendor: impl Into<String>, model: impl Into<String>) -> Self {
        self.vendor = vendor.into();
        self.model = model.into();
        self
    }

    /// Set serial number
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = Some(serial.into());
        self
    }

    /// Set firmware version
    pub fn with_firmware(mut self, version: impl Into<String>) -> Self {
        self.firmware_version = Some(version.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_expiry_tick(mut self, tick: Duration) -> Self {
        self.expiry_tick = tick;
        self
    }

    /// Set backoff bounds for reconnection
    pub fn with_reconnect(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.max_reconnect_delay = max;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = Some(attempts);
        self
    }

    /// Disable the periodic Heartbeat
    pub fn without_heartbeat(mut self) -> Self {
        self.heartbeat = false;
        self
    }

    /// BootNotification payload for this charge point
    pub fn boot_notification(&self) -> BootNotificationRequest {
        BootNotificationRequest {
            charge_point_vendor: self.vendor.clone(),
            charge_point_model: self.model.clone(),
            charge_point_serial_number: self.serial_number.clone(),
            firmware_version: self.firmware_version.clone(),
        }
    }
}
