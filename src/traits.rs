use std::future::Future;

use bitcoin::{Amount, Txid};

use crate::{
    client::ClientResult,
    error::PoolApiError,
    types::{CreateRawTransactionInput, Obligation, TxOutput, UnspentOutput},
};

/// Read-only node functionality that needs no wallet.
///
/// # Note
///
/// This is a fully `async` trait. The user should be responsible for
/// handling the `async` nature of the trait methods. And if implementing
/// this trait for a specific type that is not `async`, the user should
/// consider wrapping with [`tokio`](https://tokio.rs)'s
/// [`spawn_blocking`](https://docs.rs/tokio/latest/tokio/task/fn.spawn_blocking.html)
/// or any other method.
pub trait Reader {
    /// Probes the node with a wallet-agnostic info call.
    ///
    /// Returns `false` on any failure; never errors.
    fn test_connection(&self) -> impl Future<Output = bool> + Send;

    /// Gets the height of the most-work fully-validated chain.
    fn get_block_count(&self) -> impl Future<Output = ClientResult<u64>> + Send;

    /// Asks the node whether `address` is valid on its network.
    fn validate_address(&self, address: &str) -> impl Future<Output = ClientResult<bool>> + Send;
}

/// Wallet functionality of the node, scoped to the gateway's current wallet.
///
/// # Note
///
/// This is a fully `async` trait; see [`Reader`] for the implementation
/// guidance that applies to all of these traits.
pub trait Wallet {
    /// Lists all wallets loaded on the node.
    fn list_wallets(&self) -> impl Future<Output = ClientResult<Vec<String>>> + Send;

    /// Gets the spendable balance of the current wallet.
    fn get_balance(&self) -> impl Future<Output = ClientResult<Amount>> + Send;

    /// Gets all unspent transaction outputs of the current wallet,
    /// including unconfirmed ones; confirmation policy is the caller's.
    fn list_unspent(&self) -> impl Future<Output = ClientResult<Vec<UnspentOutput>>> + Send;

    /// Generates a new address under the current wallet's control.
    fn get_new_address(&self) -> impl Future<Output = ClientResult<String>> + Send;

    /// Creates an unsigned raw transaction, returned hex-encoded.
    fn create_raw_transaction(
        &self,
        inputs: &[CreateRawTransactionInput],
        outputs: &[TxOutput],
    ) -> impl Future<Output = ClientResult<String>> + Send;
}

/// Signing functionality; the node holds the keys, not this process.
pub trait Signer {
    /// Signs a raw transaction with the current wallet's keys and returns
    /// the signed hex. An incomplete signature set is an error.
    fn sign_raw_transaction(&self, hex: &str) -> impl Future<Output = ClientResult<String>> + Send;
}

/// Broadcasting functionality.
pub trait Broadcaster {
    /// Sends a fully-signed raw transaction to the network.
    ///
    /// Once this returns a [`Txid`] the node has accepted the transaction;
    /// the input is spent and the payment is authoritative.
    fn send_raw_transaction(&self, hex: &str) -> impl Future<Output = ClientResult<Txid>> + Send;
}

/// The pool's admin API surface used by the disburser.
pub trait PoolApi {
    /// Probes the pool listing endpoint.
    ///
    /// Returns `false` on any failure; never errors.
    fn test_connection(&self) -> impl Future<Output = bool> + Send;

    /// Fetches the pending payment obligations of `pool_id`, oldest first.
    ///
    /// A non-2xx response yields an empty list, not an error.
    fn get_pending(
        &self,
        pool_id: &str,
    ) -> impl Future<Output = Result<Vec<Obligation>, PoolApiError>> + Send;

    /// Tells the pool that `obligation_id` was settled by `transaction_id`.
    ///
    /// Best effort: `Ok(false)` means the server rejected the
    /// acknowledgement. The local journal stays authoritative either way.
    fn mark_completed(
        &self,
        pool_id: &str,
        obligation_id: u64,
        transaction_id: &str,
    ) -> impl Future<Output = Result<bool, PoolApiError>> + Send;
}
