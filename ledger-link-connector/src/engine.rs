//! # Ledger Engine Contract
//!
//! The connector never encodes cells, executes transactions or signs messages on its
//! own. All of that is delegated to a ledger engine which is injected through the
//! traits in this module. The connector owns the networking (sockets) and the
//! lifecycle around the engine objects (transports and contract handles).
//!
//! Releasing an engine object is expressed with `Drop`: a transport or a contract
//! handle frees its resources when the last owner lets go of it.

use crate::clock::Clock;
use anyhow::Result;
use async_trait::async_trait;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::sync::oneshot;

/// Polling strategy recommended by a contract handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum PollingMethod {
    /// Periodic blind refresh.
    Manual,
    /// Block-id driven polling.
    Reliable,
}

/// Snapshot of an account as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct ContractState {
    pub balance: String,
    pub gen_utime: u32,
    pub gen_lt: u64,
    pub last_transaction_lt: Option<u64>,
    pub is_deployed: bool,
    pub code_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct Transaction {
    pub hash: String,
    pub lt: u64,
    pub created_at: u32,
    pub aborted: bool,
    pub exit_code: Option<i32>,
    pub in_message_hash: Option<String>,
}

/// A message that was broadcast and is awaiting inclusion or expiration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct PendingTransaction {
    pub message_hash: String,
    pub src: Option<String>,
    pub expire_at: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum TransactionsBatchType {
    Old,
    New,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct TransactionsBatchInfo {
    pub min_lt: u64,
    pub max_lt: u64,
    pub batch_type: TransactionsBatchType,
}

/// An external message signed by the caller. `body` is opaque to the connector.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct SignedMessage {
    pub hash: String,
    pub expire_at: u32,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct LatestBlock {
    pub id: String,
    pub end_lt: u64,
    pub gen_utime: u32,
}

/// Receives the outcome of one socket request.
pub trait ResponseHandler<T>: Send {
    fn on_receive(self: Box<Self>, data: T);
    fn on_error(self: Box<Self>, error: anyhow::Error);
}

impl<T: Send> ResponseHandler<T> for oneshot::Sender<Result<T>> {
    fn on_receive(self: Box<Self>, data: T) {
        // The requester may have given up already.
        let _ = self.send(Ok(data));
    }

    fn on_error(self: Box<Self>, error: anyhow::Error) {
        let _ = self.send(Err(error));
    }
}

/// A socket exchanging string payloads (graphql and jrpc kinds).
pub trait StringSender: Send + Sync {
    /// Whether the remote side is a local or otherwise trusted node.
    fn is_local(&self) -> bool;

    /// Sends one request. `requires_db` asks for the authoritative data source.
    fn send(&self, data: String, handler: Box<dyn ResponseHandler<String>>, requires_db: bool);
}

/// A socket exchanging binary payloads (binary rpc kind).
pub trait BytesSender: Send + Sync {
    fn is_local(&self) -> bool;

    fn send(&self, data: Vec<u8>, handler: Box<dyn ResponseHandler<Vec<u8>>>, requires_db: bool);
}

/// Engine callbacks for a single subscribed account.
pub trait ContractHandler: Send + Sync {
    fn on_message_sent(&self, pending: PendingTransaction, transaction: Transaction);

    fn on_message_expired(&self, pending: PendingTransaction);

    fn on_state_changed(&self, state: ContractState);

    fn on_transactions_found(&self, transactions: Vec<Transaction>, info: TransactionsBatchInfo);
}

/// Engine object tracking one account's cached state and pending messages.
///
/// Handles are not assumed to be safe for concurrent calls; the connector
/// serializes access to each of them.
#[async_trait]
pub trait ContractHandle: Send {
    fn polling_method(&self) -> PollingMethod;

    async fn refresh(&mut self) -> Result<()>;

    async fn handle_block(&mut self, block_id: &str) -> Result<()>;

    async fn send_message(&mut self, message: &SignedMessage) -> Result<()>;

    /// Executes the message against the last known state without broadcasting it.
    async fn send_message_locally(&mut self, message: &SignedMessage) -> Result<Transaction>;
}

/// A live network binding capable of issuing ledger reads and submissions.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get_full_contract_state(&self, address: &str) -> Result<Option<ContractState>>;

    async fn get_accounts_by_code_hash(&self, code_hash: &str, limit: u8) -> Result<Vec<String>>;

    async fn subscribe_to_contract(
        &self,
        address: &str,
        handler: Arc<dyn ContractHandler>,
    ) -> Result<Option<Box<dyn ContractHandle>>>;
}

/// Block primitives, available only over block-aware transports.
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn get_latest_block(&self, address: &str) -> Result<LatestBlock>;

    /// Waits for the first block after `current_block_id` that affects `address`.
    async fn wait_for_next_block(
        &self,
        current_block_id: &str,
        address: &str,
        timeout: Duration,
    ) -> Result<String>;
}

/// Transport and block source built over one graphql connection.
#[derive(Clone)]
pub struct GqlBinding {
    pub transport: Arc<dyn Transport>,
    pub blocks: Arc<dyn BlockSource>,
}

/// Builds engine transports on top of connector-owned sockets.
pub trait LedgerEngine: Send + Sync {
    fn gql_transport(&self, sender: Arc<dyn StringSender>, clock: &Clock) -> Result<GqlBinding>;

    fn jrpc_transport(&self, sender: Arc<dyn StringSender>) -> Result<Arc<dyn Transport>>;

    fn proto_transport(&self, sender: Arc<dyn BytesSender>) -> Result<Arc<dyn Transport>>;
}

/// Produces an in-process transport for the proxy connection kind.
pub trait ProxyConnectionFactory: Send + Sync {
    fn create(&self, clock: &Clock) -> Result<Arc<dyn Transport>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn oneshot_sender_acts_as_response_handler() {
        let (tx, rx) = oneshot::channel::<Result<String>>();
        let handler: Box<dyn ResponseHandler<String>> = Box::new(tx);
        handler.on_receive("pong".to_string());
        assert_eq!(rx.await.unwrap().unwrap(), "pong");

        let (tx, rx) = oneshot::channel::<Result<String>>();
        let handler: Box<dyn ResponseHandler<String>> = Box::new(tx);
        handler.on_error(anyhow::anyhow!("boom"));
        assert_eq!(rx.await.unwrap().unwrap_err().to_string(), "boom");
    }
}
