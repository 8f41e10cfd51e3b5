//! Transactional email sender
//!
//! Thin client over a Resend-style HTTP API. Sending is best-effort:
//! callers record failures in the dunning history but never let them
//! block a state transition. When no API key is configured the service
//! runs disabled and every send reports `skipped`.

use std::time::Duration;

use serde::Serialize;

use crate::error::{RecoveryError, RecoveryResult};

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<&'a str>,
}

/// Email sender for dunning and preventive notices.
#[derive(Clone)]
pub struct DunningEmailService {
    client: reqwest::Client,
    api_key: String,
    from_address: String,
    api_url: String,
}

impl DunningEmailService {
    /// Build from `RESEND_API_KEY` / `EMAIL_FROM`. Missing key disables
    /// sending rather than failing startup.
    pub fn from_env() -> Self {
        let api_key = std::env::var("RESEND_API_KEY").unwrap_or_default();
        let from_address = std::env::var("EMAIL_FROM")
            .unwrap_or_else(|_| "billing@notifications.revive.dev".to_string());
        let api_url = std::env::var("EMAIL_API_URL")
            .unwrap_or_else(|_| "https://api.resend.com/emails".to_string());

        Self {
            client: reqwest::Client::new(),
            api_key,
            from_address,
            api_url,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// Send one rendered message. A slow or failing send must not block
    /// the state transition that triggered it, so the timeout is short
    /// and the caller treats errors as delivery-outcome data.
    pub async fn send(
        &self,
        to: &str,
        subject: &str,
        html: &str,
        reply_to: Option<&str>,
    ) -> RecoveryResult<()> {
        if !self.is_enabled() {
            tracing::debug!(to = %to, subject = %subject, "Email disabled - send skipped");
            return Err(RecoveryError::EmailSend("email not configured".to_string()));
        }

        let body = SendRequest {
            from: &self.from_address,
            to: [to],
            subject,
            html,
            reply_to,
        };

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .timeout(SEND_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| RecoveryError::EmailSend(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(RecoveryError::EmailSend(format!(
                "send returned {status}: {detail}"
            )));
        }

        tracing::debug!(to = %to, subject = %subject, "Email sent");
        Ok(())
    }
}
