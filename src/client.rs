use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};

use base64::{engine::general_purpose, Engine};
use bitcoin::{Amount, Txid};
use reqwest::{
    header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE},
    Client as ReqwestClient,
};
use serde::{de, Serialize};
use serde_json::{json, value::Value};
use tokio::time::sleep;
use tracing::*;

use crate::{
    error::{ClientError, NodeRpcError},
    traits::{Broadcaster, Reader, Signer, Wallet},
    types::{
        CreateRawTransactionInput, GetBlockchainInfo, SignRawTransaction, TxOutput, UnspentOutput,
        ValidateAddress,
    },
};

/// This is an alias for the result type returned by the [`Client`].
pub type ClientResult<T> = Result<T, ClientError>;

/// The maximum number of retries for a request.
const DEFAULT_MAX_RETRIES: u8 = 3;

/// Interval between retries for a request in ms.
const DEFAULT_RETRY_INTERVAL_MS: u64 = 1_000;

/// Per-call timeout when none is configured.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Custom implementation to convert a value to a `Value` type.
pub fn to_value<T>(value: T) -> ClientResult<Value>
where
    T: Serialize,
{
    serde_json::to_value(value)
        .map_err(|e| ClientError::Param(format!("Error creating value: {e}")))
}

/// The authentication methods for the node.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum Auth {
    None,
    UserPass(String, String),
}

impl Auth {
    pub(crate) fn get_user_pass(self) -> (Option<String>, Option<String>) {
        match self {
            Auth::None => (None, None),
            Auth::UserPass(u, p) => (Some(u), Some(p)),
        }
    }
}

/// An `async` gateway to the chain node's JSON-RPC interface.
///
/// A current wallet may be set with [`Client::set_wallet`]; wallet-scoped
/// methods are then routed to `<url>/wallet/<name>`. Reassigning the wallet
/// is a global reset for every clone of this client and must not race
/// in-flight calls.
#[derive(Debug, Clone)]
pub struct Client {
    /// The base URL of the node's RPC server.
    url: String,

    /// The underlying `async` HTTP client.
    client: ReqwestClient,

    /// The wallet that wallet-scoped calls are routed to.
    ///
    /// With no wallet set, wallet-scoped calls go to the root path, which
    /// single-wallet nodes accept.
    wallet: Arc<RwLock<Option<String>>>,

    /// The ID of the current request.
    ///
    /// # Implementation Details
    ///
    /// Using an [`Arc`] so that [`Client`] is [`Clone`].
    id: Arc<AtomicUsize>,

    /// Whether to sign through `signrawtransactionwithwallet` (modern nodes)
    /// or the legacy `signrawtransaction` (older forks).
    wallet_signing: bool,

    /// The maximum number of retries for a request.
    max_retries: u8,

    /// Interval between retries for a request in ms.
    retry_interval: u64,
}

/// Response returned by the node's RPC server.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
struct Response<R> {
    pub result: Option<R>,
    pub error: Option<NodeRpcError>,
    pub id: u64,
}

impl Client {
    /// Creates a new [`Client`] against the given RPC URL.
    pub fn new(
        url: String,
        auth: Auth,
        timeout: Option<Duration>,
        max_retries: Option<u8>,
        retry_interval: Option<u64>,
    ) -> ClientResult<Self> {
        let content_type = "application/json"
            .parse()
            .map_err(|_| ClientError::Other("Error parsing header".to_string()))?;
        let mut headers = HeaderMap::from_iter([(CONTENT_TYPE, content_type)]);

        let (username, password) = auth.get_user_pass();
        if let (Some(username), Some(password)) = (username, password) {
            let user_pw = general_purpose::STANDARD.encode(format!("{username}:{password}"));
            let authorization = format!("Basic {user_pw}")
                .parse()
                .map_err(|_| ClientError::Other("Error parsing header".to_string()))?;
            headers.insert(AUTHORIZATION, authorization);
        }

        trace!(headers = ?headers);

        let client = ReqwestClient::builder()
            .default_headers(headers)
            .timeout(timeout.unwrap_or(DEFAULT_TIMEOUT))
            .build()
            .map_err(|e| ClientError::Other(format!("Could not create client: {e}")))?;

        let max_retries = max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        let retry_interval = retry_interval.unwrap_or(DEFAULT_RETRY_INTERVAL_MS);

        trace!(url = %url, "Created chain rpc client");

        Ok(Self {
            url,
            client,
            wallet: Arc::new(RwLock::new(None)),
            id: Arc::new(AtomicUsize::new(0)),
            wallet_signing: true,
            max_retries,
            retry_interval,
        })
    }

    /// Selects the signing RPC method; `true` (the default) uses
    /// `signrawtransactionwithwallet`, `false` the legacy
    /// `signrawtransaction` kept by pre-0.17 forks.
    pub fn with_wallet_signing(mut self, enabled: bool) -> Self {
        self.wallet_signing = enabled;
        self
    }

    /// Routes subsequent wallet-scoped calls to `name`.
    pub fn set_wallet(&self, name: Option<String>) {
        let mut wallet = self.wallet.write().expect("wallet lock poisoned");
        *wallet = name;
    }

    fn next_id(&self) -> usize {
        self.id.fetch_add(1, Ordering::AcqRel)
    }

    fn node_url(&self) -> String {
        self.url.clone()
    }

    fn wallet_url(&self) -> String {
        let wallet = self.wallet.read().expect("wallet lock poisoned");
        match wallet.as_deref() {
            Some(name) => format!("{}/wallet/{name}", self.url.trim_end_matches('/')),
            None => self.url.clone(),
        }
    }

    /// Calls a wallet-agnostic RPC method on the root path.
    async fn call<T: de::DeserializeOwned + fmt::Debug>(
        &self,
        method: &str,
        params: &[Value],
    ) -> ClientResult<T> {
        self.call_url(&self.node_url(), method, params).await
    }

    /// Calls a wallet-scoped RPC method on the current wallet's path.
    async fn wallet_call<T: de::DeserializeOwned + fmt::Debug>(
        &self,
        method: &str,
        params: &[Value],
    ) -> ClientResult<T> {
        self.call_url(&self.wallet_url(), method, params).await
    }

    async fn call_url<T: de::DeserializeOwned + fmt::Debug>(
        &self,
        url: &str,
        method: &str,
        params: &[Value],
    ) -> ClientResult<T> {
        let mut retries = 0;
        loop {
            trace!(%method, ?params, %retries, "Calling chain rpc");

            let id = self.next_id();

            let response = self
                .client
                .post(url)
                .json(&json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "method": method,
                    "params": params
                }))
                .send()
                .await;
            trace!(?response, "Response received");
            match response {
                Ok(resp) => {
                    // Check HTTP status code first before parsing body
                    let resp = match resp.error_for_status() {
                        Err(e) if e.is_status() => {
                            if let Some(status) = e.status() {
                                let reason =
                                    status.canonical_reason().unwrap_or("Unknown").to_string();
                                return Err(ClientError::Status(status.as_u16(), reason));
                            } else {
                                return Err(ClientError::Other(e.to_string()));
                            }
                        }
                        Err(e) => {
                            return Err(ClientError::Other(e.to_string()));
                        }
                        Ok(resp) => resp,
                    };

                    let raw_response = resp
                        .text()
                        .await
                        .map_err(|e| ClientError::Parse(e.to_string()))?;
                    trace!(%raw_response, "Raw response received");
                    let data: Response<T> = serde_json::from_str(&raw_response)
                        .map_err(|e| ClientError::Parse(e.to_string()))?;
                    if let Some(err) = data.error {
                        return Err(ClientError::Server(err.code, err.message));
                    }
                    return data
                        .result
                        .ok_or_else(|| ClientError::Other("Empty data received".to_string()));
                }
                Err(err) => {
                    warn!(err = %err, "Error calling chain rpc");

                    if err.is_body() {
                        // Body error is unrecoverable
                        return Err(ClientError::Body(err.to_string()));
                    } else if err.is_status() {
                        // Status error is unrecoverable
                        let e = match err.status() {
                            Some(code) => ClientError::Status(code.as_u16(), err.to_string()),
                            _ => ClientError::Other(err.to_string()),
                        };
                        return Err(e);
                    } else if err.is_decode() {
                        // Error decoding response, might be recoverable
                        let e = ClientError::MalformedResponse(err.to_string());
                        warn!(%e, "decoding error, retrying...");
                    } else if err.is_connect() {
                        // Connection error, might be recoverable
                        let e = ClientError::Connection(err.to_string());
                        warn!(%e, "connection error, retrying...");
                    } else if err.is_timeout() {
                        // Timeout error, might be recoverable
                        let e = ClientError::Timeout;
                        warn!(%e, "timeout error, retrying...");
                    } else if err.is_request() {
                        // General request error, might be recoverable
                        let e = ClientError::Request(err.to_string());
                        warn!(%e, "request error, retrying...");
                    } else if err.is_builder() {
                        // Request builder error is unrecoverable
                        return Err(ClientError::ReqBuilder(err.to_string()));
                    } else if err.is_redirect() {
                        // Redirect error is unrecoverable
                        return Err(ClientError::HttpRedirect(err.to_string()));
                    } else {
                        // Unknown error is unrecoverable
                        return Err(ClientError::Other("Unknown error".to_string()));
                    }
                }
            }
            retries += 1;
            if retries >= self.max_retries {
                return Err(ClientError::MaxRetriesExceeded(self.max_retries));
            }
            sleep(Duration::from_millis(self.retry_interval)).await;
        }
    }

    /// Gets the node's blockchain info; the connectivity probe underneath
    /// [`Reader::test_connection`].
    pub async fn get_blockchain_info(&self) -> ClientResult<GetBlockchainInfo> {
        self.call::<GetBlockchainInfo>("getblockchaininfo", &[])
            .await
    }
}

impl Reader for Client {
    async fn test_connection(&self) -> bool {
        match self.get_blockchain_info().await {
            Ok(info) => {
                debug!(chain = %info.chain, blocks = %info.blocks, "Chain node reachable");
                true
            }
            Err(e) => {
                warn!(%e, "Chain node connectivity probe failed");
                false
            }
        }
    }

    async fn get_block_count(&self) -> ClientResult<u64> {
        self.call::<u64>("getblockcount", &[]).await
    }

    async fn validate_address(&self, address: &str) -> ClientResult<bool> {
        let result = self
            .call::<ValidateAddress>("validateaddress", &[to_value(address)?])
            .await?;
        Ok(result.is_valid)
    }
}

impl Wallet for Client {
    async fn list_wallets(&self) -> ClientResult<Vec<String>> {
        self.call::<Vec<String>>("listwallets", &[]).await
    }

    async fn get_balance(&self) -> ClientResult<Amount> {
        let btc = self.wallet_call::<f64>("getbalance", &[]).await?;
        Amount::from_btc(btc).map_err(|e| ClientError::Parse(format!("bad balance {btc}: {e}")))
    }

    async fn list_unspent(&self) -> ClientResult<Vec<UnspentOutput>> {
        // minconf 0: confirmation policy is applied by the selection code.
        let resp = self
            .wallet_call::<Vec<UnspentOutput>>("listunspent", &[to_value(0u32)?])
            .await?;
        trace!(count = resp.len(), "Got unspent outputs");
        Ok(resp)
    }

    async fn get_new_address(&self) -> ClientResult<String> {
        self.wallet_call::<String>("getnewaddress", &[]).await
    }

    async fn create_raw_transaction(
        &self,
        inputs: &[CreateRawTransactionInput],
        outputs: &[TxOutput],
    ) -> ClientResult<String> {
        let raw_tx = self
            .call::<String>(
                "createrawtransaction",
                &[to_value(inputs)?, to_value(outputs)?],
            )
            .await?;
        trace!(%raw_tx, "Created raw transaction");
        Ok(raw_tx)
    }
}

impl Signer for Client {
    async fn sign_raw_transaction(&self, hex: &str) -> ClientResult<String> {
        let method = if self.wallet_signing {
            "signrawtransactionwithwallet"
        } else {
            "signrawtransaction"
        };
        trace!(%method, tx_hex = %hex, "Signing transaction");
        let signed = self
            .wallet_call::<SignRawTransaction>(method, &[to_value(hex)?])
            .await?;
        if !signed.complete {
            let errors = signed
                .errors
                .unwrap_or_default()
                .iter()
                .map(|e| e.describe())
                .collect();
            return Err(ClientError::Signing(errors));
        }
        Ok(signed.hex)
    }
}

impl Broadcaster for Client {
    async fn send_raw_transaction(&self, hex: &str) -> ClientResult<Txid> {
        trace!(txstr = %hex, "Sending raw transaction");
        let txid = self.call::<Txid>("sendrawtransaction", &[to_value(hex)?]).await?;
        trace!(?txid, "Transaction sent");
        Ok(txid)
    }
}
