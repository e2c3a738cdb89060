use bitcoin::{Amount, Txid};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{
    de::{self, Visitor},
    Deserialize, Deserializer, Serialize,
};

/// One payment obligation owed to a miner, as supplied by the pool.
///
/// Obligations are immutable inputs: the pool decides who is owed how much,
/// the disburser only settles them. The `id` identifies the obligation for
/// its entire lifetime.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Obligation {
    /// Pool-scoped unique identifier.
    pub id: u64,
    /// Destination chain address (Bech32 with the chain's own prefix).
    ///
    /// Kept textual: validity is the node's judgement via `validateaddress`.
    pub address: String,
    /// The owed amount, a whole-coin decimal with 8 fractional digits on
    /// the wire.
    #[serde(deserialize_with = "deserialize_coin_amount")]
    pub amount: Amount,
    /// When the pool enqueued the obligation (UTC).
    #[serde(rename = "createdUtc", deserialize_with = "deserialize_utc")]
    pub created_at: DateTime<Utc>,
}

/// Response of `GET /api/admin/pools/{pool_id}/payments/pending`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct PendingPaymentsResponse {
    /// The pool the payments belong to.
    #[serde(rename = "poolId")]
    pub pool_id: String,
    /// The pending obligations, oldest first.
    pub payments: Vec<Obligation>,
}

/// Body of `POST /api/admin/pools/{pool_id}/payments/complete`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CompletePaymentRequest {
    /// The obligation being acknowledged.
    #[serde(rename = "paymentId")]
    pub payment_id: u64,
    /// The txid that completed it.
    #[serde(rename = "transactionId")]
    pub transaction_id: String,
}

/// Models the result of JSON-RPC method `listunspent`: one candidate input.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct UnspentOutput {
    /// The transaction id.
    pub txid: Txid,
    /// The vout value.
    pub vout: u32,
    /// The address holding the output.
    pub address: String,
    /// The script pubkey.
    #[serde(rename = "scriptPubKey")]
    pub script_pubkey: String,
    /// The output amount in whole coins on the wire.
    #[serde(deserialize_with = "deserialize_coin_amount")]
    pub amount: Amount,
    /// The number of confirmations.
    pub confirmations: u32,
    /// Whether we have the private keys to spend this output.
    pub spendable: bool,
    /// Whether we know how to spend this output, ignoring the lack of keys.
    pub solvable: bool,
}

/// Result of JSON-RPC method `getblockchaininfo`, reduced to the fields the
/// connectivity probe needs. Derived chains vary in the rest.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct GetBlockchainInfo {
    /// Current network name (main, test, regtest, or a fork-specific name).
    pub chain: String,
    /// The current number of blocks processed in the server.
    pub blocks: u64,
}

/// Result of JSON-RPC method `validateaddress`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ValidateAddress {
    /// Whether the node considers the address valid.
    #[serde(rename = "isvalid")]
    pub is_valid: bool,
}

/// Result of JSON-RPC methods `signrawtransactionwithwallet` and
/// `signrawtransaction`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct SignRawTransaction {
    /// The signed transaction, hex-encoded.
    pub hex: String,
    /// If the transaction has a complete set of signatures.
    pub complete: bool,
    /// Script verification errors, if any.
    pub errors: Option<Vec<SignRawTransactionError>>,
}

/// One script verification error reported by the signer.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct SignRawTransactionError {
    /// The referenced, previous transaction.
    pub txid: String,
    /// The index of the output to spend and used as input.
    pub vout: u32,
    /// Verification or signing error related to the input.
    pub error: String,
}

impl SignRawTransactionError {
    /// Render for the `Signing` error variant.
    pub fn describe(&self) -> String {
        format!("{}:{}: {}", self.txid, self.vout, self.error)
    }
}

/// Models the input of JSON-RPC method `createrawtransaction`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CreateRawTransactionInput {
    pub txid: String,
    pub vout: u32,
}

/// One output of JSON-RPC method `createrawtransaction`.
///
/// The node expects outputs as single-entry `{address: amount}` objects, the
/// amount a whole-coin decimal with at most 8 fractional digits. Amounts are
/// integer satoshis internally, so the 8-digit bound is structural.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOutput {
    /// The destination address.
    pub address: String,
    /// The amount to emit.
    pub amount: Amount,
}

impl Serialize for TxOutput {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut map = serde_json::Map::new();
        let amount = serde_json::Number::from_f64(self.amount.to_btc())
            .ok_or_else(|| serde::ser::Error::custom("non-finite output amount"))?;
        map.insert(self.address.clone(), serde_json::Value::Number(amount));
        map.serialize(serializer)
    }
}

/// Terminal state of one obligation within one engine invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PaymentStatus {
    /// Broadcast and journaled within this invocation.
    Succeeded,
    /// Found in the journal before any chain work.
    AlreadyCompleted,
    /// Some value broadcast, completion pending a later invocation.
    PartiallyPaid,
    /// Nothing durable happened; the obligation stays pending.
    Failed,
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::AlreadyCompleted => "already-completed",
            PaymentStatus::PartiallyPaid => "partially-paid",
            PaymentStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Per-obligation outcome of one engine invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct PaymentResult {
    /// The obligation this outcome belongs to.
    pub obligation_id: u64,
    /// Terminal state within this invocation.
    pub status: PaymentStatus,
    /// Amount paid within this invocation (zero for `AlreadyCompleted`).
    pub completed_amount: Amount,
    /// All txids attributed to this obligation in this invocation; for
    /// `AlreadyCompleted`, the journaled txid.
    pub transaction_ids: Vec<String>,
    /// Populated iff `status == Failed`.
    pub error: Option<String>,
}

/// One fully completed obligation, as persisted by the journal.
///
/// Serialized as one self-describing JSON object per line so operators can
/// read and grep the file directly.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct JournalEntry {
    /// The completed obligation.
    #[serde(rename = "paymentId")]
    pub obligation_id: u64,
    /// The txid of the last transaction that brought it to completion.
    #[serde(rename = "transactionId")]
    pub transaction_id: String,
    /// When the entry was journaled (UTC).
    #[serde(rename = "completedAt")]
    pub completed_at: DateTime<Utc>,
}

/// Deserializes a whole-coin decimal into an [`Amount`].
///
/// The conversion happens once at the wire boundary; all arithmetic stays in
/// integer satoshis.
fn deserialize_coin_amount<'d, D>(deserializer: D) -> Result<Amount, D::Error>
where
    D: Deserializer<'d>,
{
    struct CoinVisitor;

    impl Visitor<'_> for CoinVisitor {
        type Value = Amount;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(formatter, "a whole-coin decimal amount")
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Amount::from_btc(v).map_err(|e| E::custom(format!("bad amount {v}: {e}")))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            self.visit_f64(v as f64)
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            v.parse::<f64>()
                .map_err(|e| E::custom(format!("bad amount {v}: {e}")))
                .and_then(|f| self.visit_f64(f))
        }
    }
    deserializer.deserialize_any(CoinVisitor)
}

/// Deserializes a UTC timestamp, with or without an explicit offset.
///
/// The pool serializes `createdUtc` from a UTC wall clock; some server
/// versions omit the trailing `Z`.
fn deserialize_utc<'d, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'d>,
{
    struct UtcVisitor;

    impl Visitor<'_> for UtcVisitor {
        type Value = DateTime<Utc>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(formatter, "an ISO-8601 UTC timestamp")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if let Ok(dt) = DateTime::parse_from_rfc3339(v) {
                return Ok(dt.with_timezone(&Utc));
            }
            NaiveDateTime::parse_from_str(v, "%Y-%m-%dT%H:%M:%S%.f")
                .map(|naive| naive.and_utc())
                .map_err(|e| E::custom(format!("bad timestamp {v}: {e}")))
        }
    }
    deserializer.deserialize_str(UtcVisitor)
}
