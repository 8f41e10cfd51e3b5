//! Upstream payment-processor client
//!
//! Wraps the processor's imperative "attempt charge" operation. Transport
//! hiccups are retried locally with exponential backoff; a decline is a
//! normal outcome, never an error. Each attempt carries an idempotency
//! key derived from the invoice and attempt number so a duplicate firing
//! for the same due timestamp cannot double-charge.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::{RecoveryError, RecoveryResult};
use crate::tenants::TenantConfig;
use crate::transition::ChargeOutcome;

const CHARGE_TIMEOUT: Duration = Duration::from_secs(20);
const TRANSPORT_RETRIES: usize = 3;

#[derive(Debug, Serialize)]
struct ChargeRequest<'a> {
    invoice_id: &'a str,
    idempotency_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChargeResponse {
    status: String,
    #[serde(default)]
    decline_code: Option<String>,
}

/// Client for the processor's charge API.
#[derive(Clone)]
pub struct ProcessorClient {
    client: reqwest::Client,
    base_url: String,
}

impl ProcessorClient {
    /// Build from `PROCESSOR_API_URL`.
    pub fn from_env() -> RecoveryResult<Self> {
        let base_url = std::env::var("PROCESSOR_API_URL").map_err(|_| {
            RecoveryError::Configuration("PROCESSOR_API_URL must be set".to_string())
        })?;
        Ok(Self::new(base_url))
    }

    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Attempt to charge an invoice. Idempotent per invoice+attempt pair:
    /// the processor deduplicates on the key, so the optimistic-claim
    /// guard plus this key together rule out double charges.
    pub async fn attempt_charge(
        &self,
        tenant: &TenantConfig,
        invoice_id: &str,
        attempt_number: i32,
    ) -> RecoveryResult<ChargeOutcome> {
        let idempotency_key = format!("{invoice_id}:{attempt_number}");
        let url = format!("{}/v1/charges", self.base_url);

        let strategy = ExponentialBackoff::from_millis(500)
            .map(jitter)
            .take(TRANSPORT_RETRIES);

        let response = RetryIf::spawn(
            strategy,
            || async {
                self.client
                    .post(&url)
                    .bearer_auth(&tenant.processor_api_key)
                    .header("Idempotency-Key", &idempotency_key)
                    .timeout(CHARGE_TIMEOUT)
                    .json(&ChargeRequest {
                        invoice_id,
                        idempotency_key: &idempotency_key,
                    })
                    .send()
                    .await
                    .map_err(|e| RecoveryError::Processor(e.to_string()))?
                    .error_for_status()
                    .map_err(|e| RecoveryError::Processor(e.to_string()))
            },
            // Only transport-level trouble is worth retrying here; the
            // payment retry policy lives a level up.
            |e: &RecoveryError| e.is_retriable(),
        )
        .await?;

        let body: ChargeResponse = response
            .json()
            .await
            .map_err(|e| RecoveryError::Processor(format!("malformed charge response: {e}")))?;

        match body.status.as_str() {
            "succeeded" => Ok(ChargeOutcome::Succeeded),
            "declined" | "failed" => Ok(ChargeOutcome::Declined {
                code: body
                    .decline_code
                    .unwrap_or_else(|| "generic_decline".to_string()),
            }),
            other => Err(RecoveryError::Processor(format!(
                "unexpected charge status '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let client = ProcessorClient::new("https://api.processor.test/".to_string());
        assert_eq!(client.base_url, "https://api.processor.test");
    }

    #[test]
    fn charge_response_parses_decline() {
        let body: ChargeResponse =
            serde_json::from_str(r#"{"status":"declined","decline_code":"insufficient_funds"}"#)
                .unwrap();
        assert_eq!(body.status, "declined");
        assert_eq!(body.decline_code.as_deref(), Some("insufficient_funds"));
    }

    #[test]
    fn charge_response_tolerates_missing_decline_code() {
        let body: ChargeResponse = serde_json::from_str(r#"{"status":"succeeded"}"#).unwrap();
        assert_eq!(body.status, "succeeded");
        assert!(body.decline_code.is_none());
    }
}
