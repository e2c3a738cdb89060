use std::path::PathBuf;

use bitcoin::Amount;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The error returned when the chain gateway cannot complete a call.
///
/// Transport-level failures (connection, timeout, malformed response) are
/// retried by the client up to its configured bound; everything else is
/// surfaced immediately.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ClientError {
    /// Error building the request parameters.
    #[error("param: {0}")]
    Param(String),

    /// HTTP status error from the node's web server.
    #[error("http status {0}: {1}")]
    Status(u16, String),

    /// Application-level error returned by the node.
    #[error("node rpc error {0}: {1}")]
    Server(i32, String),

    /// Error parsing the response body.
    #[error("parse: {0}")]
    Parse(String),

    /// Error reading the response body.
    #[error("body: {0}")]
    Body(String),

    /// The call did not complete within the configured timeout.
    #[error("request timed out")]
    Timeout,

    /// The connection to the node could not be established.
    #[error("connection: {0}")]
    Connection(String),

    /// General request error.
    #[error("request: {0}")]
    Request(String),

    /// Error building the HTTP request.
    #[error("request builder: {0}")]
    ReqBuilder(String),

    /// Unexpected HTTP redirect.
    #[error("http redirect: {0}")]
    HttpRedirect(String),

    /// Response could not be decoded.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The bounded retry budget was exhausted.
    #[error("exhausted {0} retries")]
    MaxRetriesExceeded(u8),

    /// The signer returned an incomplete transaction.
    #[error("signing incomplete: {}", .0.join("; "))]
    Signing(Vec<String>),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

/// Application error object embedded in the node's JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Error)]
#[error("rpc error {code}: {message}")]
pub struct NodeRpcError {
    /// The error code.
    pub code: i32,
    /// The error message.
    pub message: String,
}

/// The error returned when the pool gateway cannot complete a call.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum PoolApiError {
    /// HTTP status error from the pool API.
    #[error("pool http status {0}: {1}")]
    Status(u16, String),

    /// The call did not complete within the configured timeout.
    #[error("pool request timed out")]
    Timeout,

    /// The connection to the pool could not be established.
    #[error("pool connection: {0}")]
    Connection(String),

    /// Error parsing the response body.
    #[error("pool response parse: {0}")]
    Parse(String),

    /// The bounded retry budget was exhausted.
    #[error("pool: exhausted {0} retries")]
    MaxRetriesExceeded(u8),

    /// Anything else.
    #[error("pool: {0}")]
    Other(String),
}

/// Errors from the completion journal.
#[derive(Debug, Error)]
pub enum JournalError {
    /// Backing file could not be read or written.
    #[error("journal io: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted record could not be decoded.
    #[error("journal corrupt at line {line}: {source}")]
    Corrupt {
        line: usize,
        source: serde_json::Error,
    },

    /// A record could not be encoded.
    #[error("journal encode: {0}")]
    Encode(#[source] serde_json::Error),

    /// A second, different txid was offered for an already-completed payment.
    #[error("journal conflict for payment {id}: have {existing}, refused {new}")]
    Conflict {
        id: u64,
        existing: String,
        new: String,
    },
}

/// Errors from the pure fee/selection policy.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum PolicyError {
    /// Fee arithmetic overflowed; the fee rate is misconfigured.
    #[error("fee estimate overflow for {inputs} inputs / {outputs} outputs")]
    FeeOverflow { inputs: usize, outputs: usize },

    /// The spendable set cannot cover the required target.
    #[error(
        "insufficient funds: required {required}, available {available} across {utxo_count} utxos"
    )]
    InsufficientFunds {
        required: Amount,
        available: Amount,
        utxo_count: usize,
    },
}

/// Fatal errors of one engine invocation.
///
/// Determinate payment outcomes (invalid obligation, insufficient balance,
/// rejected broadcast) are reported per obligation in [`PaymentResult`]s;
/// this type is reserved for infrastructure failures where continuing could
/// violate the at-most-once guarantee.
///
/// [`PaymentResult`]: crate::types::PaymentResult
#[derive(Debug, Error)]
pub enum EngineError {
    /// A chain gateway call failed outside the per-broadcast recovery scope.
    #[error("chain gateway: {0}")]
    Chain(#[from] ClientError),

    /// The completion journal could not be read or written.
    #[error(transparent)]
    Journal(#[from] JournalError),

    /// The fee policy failed closed.
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// Errors of the batch drivers.
#[derive(Debug, Error)]
pub enum DriverError {
    /// A chain gateway call failed.
    #[error("chain gateway: {0}")]
    Chain(#[from] ClientError),

    /// A pool gateway call failed.
    #[error("pool gateway: {0}")]
    Pool(#[from] PoolApiError),

    /// The engine invocation failed.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Operator input could not be read.
    #[error("selector io: {0}")]
    Selector(#[from] std::io::Error),
}

/// Errors of the startup preflight; any of these aborts the process.
#[derive(Debug, Error)]
pub enum PreflightError {
    /// The pool API did not answer the connectivity probe.
    #[error("pool api unreachable at {0}")]
    PoolUnreachable(String),

    /// No wallet name is configured.
    #[error("no wallet name configured")]
    WalletNotConfigured,

    /// The chain node did not answer the connectivity probe.
    #[error("chain node unreachable at {0}")]
    ChainUnreachable(String),

    /// The configured wallet is not loaded on the node.
    #[error("wallet {configured:?} not found; node has {available:?}")]
    WalletNotFound {
        configured: String,
        available: Vec<String>,
    },

    /// A chain gateway call failed during preflight.
    #[error("chain gateway: {0}")]
    Chain(#[from] ClientError),

    /// A pool gateway call failed during preflight.
    #[error("pool gateway: {0}")]
    Pool(#[from] PoolApiError),
}

/// Error type wrapping configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No file at the given path.
    #[error("configuration file not found: {0}")]
    NotFound(PathBuf),

    /// File IO while reading the config file.
    #[error("error reading configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Parsing of the config file failed.
    #[error("error parsing configuration file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}
