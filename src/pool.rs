use std::time::Duration;

use reqwest::{
    header::{HeaderMap, ACCEPT, AUTHORIZATION, USER_AGENT},
    Client as ReqwestClient, RequestBuilder, Response,
};
use tokio::time::sleep;
use tracing::*;

use crate::{
    error::PoolApiError,
    traits::PoolApi,
    types::{CompletePaymentRequest, Obligation, PendingPaymentsResponse},
};

/// This is an alias for the result type returned by the [`PoolClient`].
pub type PoolResult<T> = Result<T, PoolApiError>;

/// The maximum number of retries for a request.
const DEFAULT_MAX_RETRIES: u8 = 3;

/// Interval between retries for a request in ms.
const DEFAULT_RETRY_INTERVAL_MS: u64 = 1_000;

/// Per-call timeout when none is configured.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Identifies the disburser in the pool's access logs.
const AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// An `async` client for the pool's admin HTTP API.
#[derive(Debug, Clone)]
pub struct PoolClient {
    /// Base URL of the pool API, without a trailing slash.
    base_url: String,

    /// The underlying `async` HTTP client; carries the bearer token.
    client: ReqwestClient,

    /// The maximum number of retries for a request.
    max_retries: u8,

    /// Interval between retries for a request in ms.
    retry_interval: u64,
}

impl PoolClient {
    /// Creates a new [`PoolClient`] with bearer-token authentication.
    pub fn new(base_url: String, api_key: &str, timeout: Option<Duration>) -> PoolResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            "application/json"
                .parse()
                .map_err(|_| PoolApiError::Other("Error parsing header".to_string()))?,
        );
        headers.insert(
            AUTHORIZATION,
            format!("Bearer {api_key}")
                .parse()
                .map_err(|_| PoolApiError::Other("Error parsing header".to_string()))?,
        );
        headers.insert(
            USER_AGENT,
            AGENT
                .parse()
                .map_err(|_| PoolApiError::Other("Error parsing header".to_string()))?,
        );

        let client = ReqwestClient::builder()
            .default_headers(headers)
            .timeout(timeout.unwrap_or(DEFAULT_TIMEOUT))
            .build()
            .map_err(|e| PoolApiError::Other(format!("Could not create client: {e}")))?;

        let base_url = base_url.trim_end_matches('/').to_string();
        trace!(url = %base_url, "Created pool api client");

        Ok(Self {
            base_url,
            client,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval: DEFAULT_RETRY_INTERVAL_MS,
        })
    }

    fn pools_url(&self) -> String {
        format!("{}/api/admin/pools", self.base_url)
    }

    fn pending_url(&self, pool_id: &str) -> String {
        format!("{}/api/admin/pools/{pool_id}/payments/pending", self.base_url)
    }

    fn complete_url(&self, pool_id: &str) -> String {
        format!(
            "{}/api/admin/pools/{pool_id}/payments/complete",
            self.base_url
        )
    }

    /// Sends a request, retrying transport-level failures with a bounded
    /// budget. Any HTTP response, success or not, ends the loop.
    async fn execute(&self, build: impl Fn() -> RequestBuilder) -> PoolResult<Response> {
        let mut retries = 0;
        loop {
            match build().send().await {
                Ok(resp) => return Ok(resp),
                Err(err) => {
                    let e = if err.is_timeout() {
                        PoolApiError::Timeout
                    } else if err.is_connect() {
                        PoolApiError::Connection(err.to_string())
                    } else if err.is_status() {
                        // reqwest only reports this through error_for_status;
                        // kept for completeness
                        let code = err.status().map(|s| s.as_u16()).unwrap_or(0);
                        return Err(PoolApiError::Status(code, err.to_string()));
                    } else {
                        return Err(PoolApiError::Other(err.to_string()));
                    };
                    warn!(%e, "pool api transport error, retrying...");
                    retries += 1;
                    if retries >= self.max_retries {
                        return Err(PoolApiError::MaxRetriesExceeded(self.max_retries));
                    }
                    sleep(Duration::from_millis(self.retry_interval)).await;
                }
            }
        }
    }
}

impl PoolApi for PoolClient {
    async fn test_connection(&self) -> bool {
        let url = self.pools_url();
        match self.execute(|| self.client.get(&url)).await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(status = %resp.status(), "Pool api probe rejected");
                false
            }
            Err(e) => {
                warn!(%e, "Pool api probe failed");
                false
            }
        }
    }

    async fn get_pending(&self, pool_id: &str) -> PoolResult<Vec<Obligation>> {
        let url = self.pending_url(pool_id);
        let resp = self.execute(|| self.client.get(&url)).await?;
        if !resp.status().is_success() {
            // The pool is allowed to answer "nothing pending" this way.
            debug!(status = %resp.status(), %pool_id, "No pending payments returned");
            return Ok(Vec::new());
        }
        let pending: PendingPaymentsResponse = resp
            .json()
            .await
            .map_err(|e| PoolApiError::Parse(e.to_string()))?;
        debug!(
            pool_id = %pending.pool_id,
            count = pending.payments.len(),
            "Fetched pending payments"
        );
        Ok(pending.payments)
    }

    async fn mark_completed(
        &self,
        pool_id: &str,
        obligation_id: u64,
        transaction_id: &str,
    ) -> PoolResult<bool> {
        let url = self.complete_url(pool_id);
        let body = CompletePaymentRequest {
            payment_id: obligation_id,
            transaction_id: transaction_id.to_string(),
        };
        let resp = self.execute(|| self.client.post(&url).json(&body)).await?;
        let status = resp.status();
        if status.is_success() {
            debug!(%obligation_id, %transaction_id, "Pool acknowledged completion");
            Ok(true)
        } else {
            // 404: unknown or already completed server-side; 400: malformed.
            // Neither is fatal: the local journal stays authoritative.
            warn!(%obligation_id, %status, "Pool rejected completion acknowledgement");
            Ok(false)
        }
    }
}
