//! Typed charge-point commands
//!
//! Thin wrappers over `Bridge::request` that build the OCPP 1.6 payload and
//! parse the result into its response type.

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use tracing::info;

use super::client::Bridge;
use super::messages::{Action, OcppError};
use super::types::*;

impl Bridge {
    async fn typed_call<Req, Resp>(&self, action: Action, request: &Req) -> Result<Resp, OcppError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_value(request)?;
        let result = self.request(action.as_str(), payload).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Send Heartbeat; returns the central system's clock
    pub async fn heartbeat(&self) -> Result<HeartbeatResponse, OcppError> {
        self.typed_call(Action::Heartbeat, &HeartbeatRequest {}).await
    }

    /// Report connector status
    pub async fn status_notification(
        &self,
        connector_id: u32,
        status: ChargePointStatus,
    ) -> Result<StatusNotificationResponse, OcppError> {
        let request = StatusNotificationRequest::new(connector_id, status);
        self.typed_call(Action::StatusNotification, &request).await
    }

    pub async fn authorize(&self, id_tag: &str) -> Result<AuthorizeResponse, OcppError> {
        let request = AuthorizeRequest {
            id_tag: id_tag.to_string(),
        };
        self.typed_call(Action::Authorize, &request).await
    }

    /// Start a transaction on `connector_id`
    pub async fn start_transaction(
        &self,
        connector_id: u32,
        id_tag: &str,
        meter_start: i32,
    ) -> Result<StartTransactionResponse, OcppError> {
        let request = StartTransactionRequest {
            connector_id,
            id_tag: id_tag.to_string(),
            meter_start,
            reservation_id: None,
            timestamp: Utc::now(),
        };
        let response: StartTransactionResponse =
            self.typed_call(Action::StartTransaction, &request).await?;
        info!(
            "Transaction {} started on connector {} ({:?})",
            response.transaction_id, connector_id, response.id_tag_info.status
        );
        Ok(response)
    }

    pub async fn stop_transaction(
        &self,
        transaction_id: i32,
        meter_stop: i32,
        reason: Option<Reason>,
    ) -> Result<StopTransactionResponse, OcppError> {
        let request = StopTransactionRequest {
            transaction_id,
            meter_stop,
            timestamp: Utc::now(),
            id_tag: None,
            reason,
        };
        let response = self.typed_call(Action::StopTransaction, &request).await?;
        info!("Transaction {} stopped", transaction_id);
        Ok(response)
    }

    /// Send sampled values for a connector
    pub async fn meter_values(
        &self,
        connector_id: u32,
        transaction_id: Option<i32>,
        sampled_value: Vec<SampledValue>,
    ) -> Result<MeterValuesResponse, OcppError> {
        let request = MeterValuesRequest {
            connector_id,
            transaction_id,
            meter_value: vec![MeterValue {
                timestamp: Utc::now(),
                sampled_value,
            }],
        };
        self.typed_call(Action::MeterValues, &request).await
    }

    pub async fn data_transfer(
        &self,
        request: &DataTransferRequest,
    ) -> Result<DataTransferResponse, OcppError> {
        self.typed_call(Action::DataTransfer, request).await
    }
}
