//! Types for the ledger RPC integration: log batches, confirmation levels, and the client trait.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::ledger::codec::CodecError;
use crate::store::{EntityType, WatchedFields};

/// Commitment levels understood by the ledger, weakest first.
///
/// The same scale reports how far a transaction has progressed when its status is queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitmentLevel {
    /// Seen by the connected node only
    Processed,
    /// Voted on by a supermajority of the cluster
    Confirmed,
    /// Rooted; cannot be rolled back
    Finalized,
}

impl CommitmentLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitmentLevel::Processed => "processed",
            CommitmentLevel::Confirmed => "confirmed",
            CommitmentLevel::Finalized => "finalized",
        }
    }
}

impl std::str::FromStr for CommitmentLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "processed" => Ok(CommitmentLevel::Processed),
            "confirmed" => Ok(CommitmentLevel::Confirmed),
            "finalized" => Ok(CommitmentLevel::Finalized),
            other => Err(format!("unknown commitment level '{}'", other)),
        }
    }
}

/// Log lines produced by one transaction, as delivered by the log subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct LogBatch {
    /// Transaction signature.
    pub signature: String,
    /// Slot the notification was produced at.
    pub slot: u64,
    /// Raw program log lines in execution order.
    pub logs: Vec<String>,
    /// Error marker; present when the transaction failed.
    pub err: Option<serde_json::Value>,
}

impl LogBatch {
    /// Failed transactions carry no state change worth mirroring.
    pub fn is_failed(&self) -> bool {
        self.err.is_some()
    }
}

/// Identifier of an open log subscription.
pub type SubscriptionId = u64;

/// An open log subscription. Batches arrive on `batches` until the feed drops or
/// the subscription is released with [`LedgerClient::unsubscribe`].
pub struct LogSubscription {
    pub id: SubscriptionId,
    pub batches: mpsc::Receiver<Result<LogBatch, LedgerError>>,
}

/// The authoritative ledger as seen by the sync core.
#[async_trait::async_trait]
pub trait LedgerClient: Send + Sync {
    /// Open a log subscription for transactions mentioning `program_id`.
    async fn subscribe_logs(
        &self,
        program_id: &str,
        commitment: CommitmentLevel,
    ) -> Result<LogSubscription, LedgerError>;

    /// Release a log subscription. Releasing an unknown id is not an error.
    async fn unsubscribe(&self, subscription_id: SubscriptionId) -> Result<(), LedgerError>;

    /// Current confirmation status of a transaction, `None` when the ledger has no record of it.
    async fn get_signature_status(
        &self,
        signature: &str,
    ) -> Result<Option<CommitmentLevel>, LedgerError>;

    /// Fetch the ledger's view of the watched fields of an account.
    ///
    /// Returns [`LedgerError::AccountNotFound`] when the account does not exist.
    async fn fetch_account(
        &self,
        address: &str,
        entity_type: EntityType,
    ) -> Result<WatchedFields, LedgerError>;
}

/// `logsNotification` payload.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RpcLogsResult {
    pub context: RpcContext,
    pub value: RpcLogsValue,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RpcContext {
    pub slot: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RpcLogsValue {
    pub signature: String,
    #[serde(default)]
    pub err: Option<serde_json::Value>,
    #[serde(default)]
    pub logs: Vec<String>,
}

impl From<RpcLogsResult> for LogBatch {
    fn from(result: RpcLogsResult) -> Self {
        LogBatch {
            signature: result.value.signature,
            slot: result.context.slot,
            logs: result.value.logs,
            err: result.value.err,
        }
    }
}

/// One entry of a `getSignatureStatuses` response.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RpcSignatureStatus {
    #[allow(dead_code)]
    pub slot: u64,
    #[serde(rename = "confirmationStatus")]
    pub confirmation_status: Option<CommitmentLevel>,
}

/// Error types for ledger RPC and subscription operations
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("RPC error: {0}")]
    RpcError(String),

    #[error("No data returned")]
    NoData,

    #[error("Account does not exist: {0}")]
    AccountNotFound(String),

    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Account decode error: {0}")]
    DecodeError(#[from] CodecError),

    #[error("Subscription error: {0}")]
    SubscriptionError(String),
}
