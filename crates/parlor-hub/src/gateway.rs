//! Payment gateway client for pre-authorized sessions.
//!
//! The gateway is an opaque collaborator: the hub only captures a
//! pre-authorized payment intent for the frozen cost, or refunds it when a
//! paid session is cancelled. Dispatch is enum-based so the hub holds one
//! concrete type:
//!
//! - [`HttpGateway`] talks to a remote API over `reqwest`
//! - [`LocalGateway`] records calls in memory for development and tests

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::GatewayConfig;
use crate::error::GatewayError;

/// A payment gateway backend.
#[derive(Debug, Clone)]
pub enum PaymentGateway {
    /// Remote HTTP API.
    Http(HttpGateway),
    /// In-process recorder.
    Local(LocalGateway),
}

impl PaymentGateway {
    /// Build the backend named by `config`: HTTP when a URL is set, local
    /// otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if the HTTP client cannot be built.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, GatewayError> {
        match &config.url {
            Some(url) => Ok(Self::Http(HttpGateway::new(
                url,
                config.api_key.clone(),
                config.timeout(),
            )?)),
            None => Ok(Self::Local(LocalGateway::new())),
        }
    }

    /// Capture `amount` minor units of the intent `payment_ref`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] if the gateway is unreachable, times out or
    /// refuses the capture.
    pub async fn capture(&self, payment_ref: &str, amount: i64) -> Result<(), GatewayError> {
        match self {
            Self::Http(gateway) => gateway.capture(payment_ref, amount).await,
            Self::Local(gateway) => gateway.capture(payment_ref, amount).await,
        }
    }

    /// Refund or release the intent `payment_ref`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] if the gateway is unreachable, times out or
    /// refuses the refund.
    pub async fn refund(&self, payment_ref: &str) -> Result<(), GatewayError> {
        match self {
            Self::Http(gateway) => gateway.refund(payment_ref).await,
            Self::Local(gateway) => gateway.refund(payment_ref).await,
        }
    }

    /// Human-readable name for logging.
    pub const fn name(&self) -> &str {
        match self {
            Self::Http(_) => "http",
            Self::Local(_) => "local",
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP backend
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct CaptureRequest {
    amount: i64,
}

/// Gateway reached over HTTP.
///
/// Sends `POST {base}/payments/{ref}/capture` with `{"amount": n}` and
/// `POST {base}/payments/{ref}/refund`. Every request is bounded by the
/// client timeout.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpGateway {
    /// Create a client for the gateway at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if the TLS backend cannot be initialized.
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Config(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
        })
    }

    async fn capture(&self, payment_ref: &str, amount: i64) -> Result<(), GatewayError> {
        let url = format!("{}/payments/{payment_ref}/capture", self.base_url);
        self.post(&url, Some(&CaptureRequest { amount })).await
    }

    async fn refund(&self, payment_ref: &str) -> Result<(), GatewayError> {
        let url = format!("{}/payments/{payment_ref}/refund", self.base_url);
        self.post::<CaptureRequest>(&url, None).await
    }

    async fn post<B: Serialize + Sync>(&self, url: &str, body: Option<&B>) -> Result<(), GatewayError> {
        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout
            } else {
                GatewayError::Request(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read error body".to_owned());
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Local backend
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Ledger {
    captures: Vec<(String, i64)>,
    refunds: Vec<String>,
    declining: bool,
}

/// In-process gateway that records captures and refunds.
///
/// Clones share the same record. [`set_declining`](Self::set_declining)
/// makes every later call fail, for exercising the failure path.
#[derive(Debug, Clone, Default)]
pub struct LocalGateway {
    ledger: Arc<Mutex<Ledger>>,
}

impl LocalGateway {
    /// Create an accepting gateway with no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent calls succeed (`false`) or be declined (`true`).
    pub async fn set_declining(&self, declining: bool) {
        self.ledger.lock().await.declining = declining;
    }

    /// Captures so far, as `(payment_ref, amount)`.
    pub async fn captures(&self) -> Vec<(String, i64)> {
        self.ledger.lock().await.captures.clone()
    }

    /// Refunded payment references so far.
    pub async fn refunds(&self) -> Vec<String> {
        self.ledger.lock().await.refunds.clone()
    }

    async fn capture(&self, payment_ref: &str, amount: i64) -> Result<(), GatewayError> {
        let mut ledger = self.ledger.lock().await;
        if ledger.declining {
            return Err(GatewayError::Declined {
                operation: "capture",
                payment_ref: payment_ref.to_owned(),
            });
        }
        ledger.captures.push((payment_ref.to_owned(), amount));
        Ok(())
    }

    async fn refund(&self, payment_ref: &str) -> Result<(), GatewayError> {
        let mut ledger = self.ledger.lock().await;
        if ledger.declining {
            return Err(GatewayError::Declined {
                operation: "refund",
                payment_ref: payment_ref.to_owned(),
            });
        }
        ledger.refunds.push(payment_ref.to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_gateway_records_and_declines() {
        let local = LocalGateway::new();
        let gateway = PaymentGateway::Local(local.clone());
        assert!(gateway.capture("pi_1", 300).await.is_ok());
        assert!(gateway.refund("pi_2").await.is_ok());
        assert_eq!(local.captures().await, vec![("pi_1".to_owned(), 300)]);
        assert_eq!(local.refunds().await, vec!["pi_2".to_owned()]);

        local.set_declining(true).await;
        assert!(matches!(
            gateway.capture("pi_3", 100).await,
            Err(GatewayError::Declined { operation: "capture", .. })
        ));
        assert_eq!(local.captures().await.len(), 1);
    }

    #[test]
    fn config_without_url_selects_local() {
        let gateway = PaymentGateway::from_config(&GatewayConfig::default()).ok();
        assert_eq!(gateway.map(|g| g.name().to_owned()).as_deref(), Some("local"));
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let gateway = HttpGateway::new("https://pay.example/", None, Duration::from_secs(1)).ok();
        assert_eq!(
            gateway.map(|g| g.base_url).as_deref(),
            Some("https://pay.example")
        );
    }
}
