//! HTTP payment processor client
//!
//! JSON over HTTPS against `processor.base_url`. Status codes map onto
//! [`ProcessorError`]: 404 is `NotFound`, 408/429/5xx and network failures are
//! `Transient`, every other 4xx is `Rejected`.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use super::{
    PaymentProcessor, ProcessorError, ProcessorPayment, ProcessorRefund, ProcessorTransfer,
    RefundCommand, TransferCommand,
};
use crate::config::ProcessorConfig;

pub struct HttpProcessor {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    data: Vec<T>,
}

impl HttpProcessor {
    pub fn new(config: &ProcessorConfig) -> Result<Self, ProcessorError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| ProcessorError::Transient(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send<R: DeserializeOwned>(&self, request: RequestBuilder) -> Result<R, ProcessorError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| ProcessorError::Transient(format!("HTTP request failed: {}", e)))?;
        let response = check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| ProcessorError::Decode(format!("Failed to parse response: {}", e)))
    }
}

async fn check_status(response: Response) -> Result<Response, ProcessorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let detail = format!("{}: {}", status, body);
    Err(classify(status, detail))
}

fn classify(status: StatusCode, detail: String) -> ProcessorError {
    if status == StatusCode::NOT_FOUND {
        ProcessorError::NotFound(detail)
    } else if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        ProcessorError::Transient(detail)
    } else {
        ProcessorError::Rejected(detail)
    }
}

#[async_trait]
impl PaymentProcessor for HttpProcessor {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn create_transfer(&self, cmd: &TransferCommand) -> Result<String, ProcessorError> {
        debug!(transfer_group = %cmd.transfer_group, amount = cmd.amount, "POST /v1/transfers");
        let request = self
            .client
            .post(self.url("/v1/transfers"))
            .header("Idempotency-Key", &cmd.idempotency_key)
            .json(cmd);
        let created: CreatedObject = self.send(request).await?;
        Ok(created.id)
    }

    async fn create_refund(&self, cmd: &RefundCommand) -> Result<String, ProcessorError> {
        debug!(payment_reference = %cmd.payment_reference, amount = cmd.amount, "POST /v1/refunds");
        let request = self
            .client
            .post(self.url("/v1/refunds"))
            .header("Idempotency-Key", &cmd.idempotency_key)
            .json(cmd);
        let created: CreatedObject = self.send(request).await?;
        Ok(created.id)
    }

    async fn retrieve_payment(
        &self,
        payment_reference: &str,
    ) -> Result<ProcessorPayment, ProcessorError> {
        let request = self
            .client
            .get(self.url(&format!("/v1/payments/{}", payment_reference)));
        self.send(request).await
    }

    async fn list_transfers(
        &self,
        transfer_group: &str,
    ) -> Result<Vec<ProcessorTransfer>, ProcessorError> {
        let request = self
            .client
            .get(self.url("/v1/transfers"))
            .query(&[("transfer_group", transfer_group)]);
        let list: ListResponse<ProcessorTransfer> = self.send(request).await?;
        Ok(list.data)
    }

    async fn list_refunds(
        &self,
        payment_reference: &str,
    ) -> Result<Vec<ProcessorRefund>, ProcessorError> {
        let request = self
            .client
            .get(self.url("/v1/refunds"))
            .query(&[("payment_reference", payment_reference)]);
        let list: ListResponse<ProcessorRefund> = self.send(request).await?;
        Ok(list.data)
    }
}
