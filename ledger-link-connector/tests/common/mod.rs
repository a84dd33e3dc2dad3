//! A scriptable in-memory ledger engine for integration tests.
#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ledger_link_connector::{
    config::ConnectorConfig,
    engine::{
        BlockSource, BytesSender, ContractHandle, ContractHandler, ContractState, GqlBinding,
        LatestBlock, LedgerEngine, PendingTransaction, PollingMethod, ProxyConnectionFactory,
        SignedMessage, StringSender, Transaction, TransactionsBatchInfo, TransactionsBatchType,
        Transport,
    },
    transport::{GqlParams, JrpcParams, ProxyParams},
    Clock, ConnectionContext, ConnectionController, ConnectionDescriptor, ConnectionParams,
};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    ops::Deref,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

/// How the health probe of the next created transport behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Ok,
    Fail,
    Hang,
}

/// What happens to broadcast messages on the next refresh or handled block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Land,
    Expire,
    Reject,
    Hold,
}

#[derive(Default)]
pub struct Stats {
    pub transports_created: AtomicUsize,
    pub transports_released: AtomicUsize,
    pub state_probes: AtomicUsize,
    pub code_hash_probes: AtomicUsize,
    pub latest_block_calls: AtomicUsize,
}

impl Stats {
    pub fn created(&self) -> usize {
        self.transports_created.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.transports_released.load(Ordering::SeqCst)
    }
}

pub struct ContractScript {
    pub method: Mutex<PollingMethod>,
    pub outcome: Mutex<Outcome>,
    pub local_exit_code: Mutex<Option<i32>>,
    /// How long broadcasting a message takes.
    pub send_delay: Mutex<Option<Duration>>,
    pub refresh_failures: AtomicUsize,
    pub refreshes: AtomicUsize,
    pub local_calls: AtomicUsize,
    pub handled_blocks: Mutex<Vec<String>>,
    pub sent: Mutex<Vec<SignedMessage>>,
    pub created: AtomicUsize,
    pub released: AtomicUsize,
    pending: Mutex<Vec<SignedMessage>>,
}

impl Default for ContractScript {
    fn default() -> Self {
        Self {
            method: Mutex::new(PollingMethod::Manual),
            outcome: Mutex::new(Outcome::Land),
            local_exit_code: Mutex::new(None),
            send_delay: Mutex::new(None),
            refresh_failures: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
            local_calls: AtomicUsize::new(0),
            handled_blocks: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            created: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            pending: Mutex::new(Vec::new()),
        }
    }
}

impl ContractScript {
    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn set_method(&self, method: PollingMethod) {
        *self.method.lock() = method;
    }

    pub fn set_outcome(&self, outcome: Outcome) {
        *self.outcome.lock() = outcome;
    }
}

#[derive(Default)]
pub struct EngineState {
    pub stats: Stats,
    health: Mutex<VecDeque<Health>>,
    contracts: Mutex<HashMap<String, Arc<ContractScript>>>,
    missing: Mutex<HashSet<String>>,
    pub latest_block: AtomicU64,
    pub block_failures: AtomicUsize,
    pub waited_from: Mutex<Vec<String>>,
}

impl EngineState {
    /// Queues health probe behaviors for the next created transports. Unscripted
    /// transports are healthy.
    pub fn script_health(&self, script: &[Health]) {
        self.health.lock().extend(script.iter().copied());
    }

    pub fn contract(&self, address: &str) -> Arc<ContractScript> {
        self.contracts
            .lock()
            .entry(address.to_string())
            .or_default()
            .clone()
    }

    pub fn mark_missing(&self, address: &str) {
        self.missing.lock().insert(address.to_string());
    }

    fn next_health(&self) -> Health {
        self.health.lock().pop_front().unwrap_or(Health::Ok)
    }
}

#[derive(Default)]
pub struct FakeEngine(Arc<EngineState>);

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn proxy_descriptor(&self, id: u32) -> ConnectionDescriptor {
        ConnectionDescriptor {
            id,
            group: None,
            transport: ConnectionParams::Proxy(ProxyParams {
                factory: Arc::new(FakeProxyFactory(self.0.clone())),
            }),
        }
    }

    fn transport(&self) -> Arc<FakeTransport> {
        self.0.stats.transports_created.fetch_add(1, Ordering::SeqCst);
        Arc::new(FakeTransport {
            engine: self.0.clone(),
            health: self.0.next_health(),
        })
    }
}

impl Deref for FakeEngine {
    type Target = EngineState;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl LedgerEngine for FakeEngine {
    fn gql_transport(&self, _sender: Arc<dyn StringSender>, _clock: &Clock) -> Result<GqlBinding> {
        Ok(GqlBinding {
            transport: self.transport(),
            blocks: Arc::new(FakeBlocks(self.0.clone())),
        })
    }

    fn jrpc_transport(&self, _sender: Arc<dyn StringSender>) -> Result<Arc<dyn Transport>> {
        Ok(self.transport())
    }

    fn proto_transport(&self, _sender: Arc<dyn BytesSender>) -> Result<Arc<dyn Transport>> {
        Ok(self.transport())
    }
}

struct FakeProxyFactory(Arc<EngineState>);

impl ProxyConnectionFactory for FakeProxyFactory {
    fn create(&self, _clock: &Clock) -> Result<Arc<dyn Transport>> {
        self.0.stats.transports_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeTransport {
            engine: self.0.clone(),
            health: self.0.next_health(),
        }))
    }
}

struct FakeTransport {
    engine: Arc<EngineState>,
    health: Health,
}

impl FakeTransport {
    async fn probe(&self) -> Result<()> {
        match self.health {
            Health::Ok => Ok(()),
            Health::Fail => Err(anyhow!("node unavailable")),
            Health::Hang => std::future::pending().await,
        }
    }
}

impl Drop for FakeTransport {
    fn drop(&mut self) {
        self.engine
            .stats
            .transports_released
            .fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn get_full_contract_state(&self, _address: &str) -> Result<Option<ContractState>> {
        self.engine.stats.state_probes.fetch_add(1, Ordering::SeqCst);
        self.probe().await.map(|_| None)
    }

    async fn get_accounts_by_code_hash(&self, _code_hash: &str, _limit: u8) -> Result<Vec<String>> {
        self.engine
            .stats
            .code_hash_probes
            .fetch_add(1, Ordering::SeqCst);
        self.probe().await.map(|_| Vec::new())
    }

    async fn subscribe_to_contract(
        &self,
        address: &str,
        handler: Arc<dyn ContractHandler>,
    ) -> Result<Option<Box<dyn ContractHandle>>> {
        if self.engine.missing.lock().contains(address) {
            return Ok(None);
        }

        let script = self.engine.contract(address);
        script.created.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Box::new(FakeContract {
            address: address.to_string(),
            script,
            handler,
        })))
    }
}

struct FakeBlocks(Arc<EngineState>);

#[async_trait]
impl BlockSource for FakeBlocks {
    async fn get_latest_block(&self, _address: &str) -> Result<LatestBlock> {
        self.0.stats.latest_block_calls.fetch_add(1, Ordering::SeqCst);
        let id = self.0.latest_block.load(Ordering::SeqCst);
        Ok(LatestBlock {
            id: format!("b{id}"),
            end_lt: id,
            gen_utime: id as u32,
        })
    }

    async fn wait_for_next_block(
        &self,
        current_block_id: &str,
        _address: &str,
        _timeout: Duration,
    ) -> Result<String> {
        self.0.waited_from.lock().push(current_block_id.to_string());
        let failures = self.0.block_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.0.block_failures.store(failures - 1, Ordering::SeqCst);
            return Err(anyhow!("block stream interrupted"));
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
        let id = self.0.latest_block.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("b{id}"))
    }
}

struct FakeContract {
    address: String,
    script: Arc<ContractScript>,
    handler: Arc<dyn ContractHandler>,
}

impl FakeContract {
    fn settle(&self) {
        let outcome = *self.script.outcome.lock();
        if outcome == Outcome::Hold {
            return;
        }

        let pending: Vec<_> = self.script.pending.lock().drain(..).collect();
        for message in pending {
            let pending = PendingTransaction {
                message_hash: message.hash.clone(),
                src: None,
                expire_at: message.expire_at,
            };
            match outcome {
                Outcome::Land => {
                    let transaction = transaction_for(&message.hash, None);
                    self.handler.on_transactions_found(
                        vec![transaction.clone()],
                        TransactionsBatchInfo {
                            min_lt: transaction.lt,
                            max_lt: transaction.lt,
                            batch_type: TransactionsBatchType::New,
                        },
                    );
                    self.handler.on_message_sent(pending, transaction);
                }
                _ => self.handler.on_message_expired(pending),
            }
        }
    }
}

impl Drop for FakeContract {
    fn drop(&mut self) {
        self.script.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ContractHandle for FakeContract {
    fn polling_method(&self) -> PollingMethod {
        *self.script.method.lock()
    }

    async fn refresh(&mut self) -> Result<()> {
        let count = self.script.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        let failures = self.script.refresh_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.script.refresh_failures.store(failures - 1, Ordering::SeqCst);
            return Err(anyhow!("refresh of {} failed", self.address));
        }

        self.handler.on_state_changed(ContractState {
            balance: "1000".to_string(),
            gen_utime: count as u32,
            is_deployed: true,
            ..Default::default()
        });
        self.settle();
        Ok(())
    }

    async fn handle_block(&mut self, block_id: &str) -> Result<()> {
        self.script.handled_blocks.lock().push(block_id.to_string());
        self.settle();
        Ok(())
    }

    async fn send_message(&mut self, message: &SignedMessage) -> Result<()> {
        let delay = *self.script.send_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.script.sent.lock().push(message.clone());
        if *self.script.outcome.lock() == Outcome::Reject {
            return Err(anyhow!("message rejected by node"));
        }
        self.script.pending.lock().push(message.clone());
        Ok(())
    }

    async fn send_message_locally(&mut self, message: &SignedMessage) -> Result<Transaction> {
        self.script.local_calls.fetch_add(1, Ordering::SeqCst);
        let exit_code = *self.script.local_exit_code.lock();
        Ok(transaction_for(&message.hash, exit_code))
    }
}

pub fn transaction_for(message_hash: &str, exit_code: Option<i32>) -> Transaction {
    Transaction {
        hash: format!("tx-{message_hash}"),
        lt: 1000,
        created_at: 1_700_000_000,
        aborted: exit_code.is_some(),
        exit_code,
        in_message_hash: Some(message_hash.to_string()),
    }
}

pub fn message(hash: &str) -> SignedMessage {
    SignedMessage {
        hash: hash.to_string(),
        expire_at: 1_700_000_060,
        body: format!("boc-{hash}"),
    }
}

pub fn gql(id: u32) -> ConnectionDescriptor {
    ConnectionDescriptor {
        id,
        group: None,
        transport: ConnectionParams::Graphql(GqlParams {
            endpoints: vec!["gql.test".to_string()],
            local: false,
            latency_detection_interval_ms: None,
            max_latency_ms: None,
        }),
    }
}

pub fn local_gql(id: u32) -> ConnectionDescriptor {
    ConnectionDescriptor {
        id,
        group: None,
        transport: ConnectionParams::Graphql(GqlParams {
            endpoints: vec!["127.0.0.1".to_string()],
            local: true,
            latency_detection_interval_ms: None,
            max_latency_ms: None,
        }),
    }
}

pub fn jrpc(id: u32) -> ConnectionDescriptor {
    ConnectionDescriptor {
        id,
        group: None,
        transport: ConnectionParams::Jrpc(JrpcParams {
            endpoint: "https://jrpc.test/rpc".to_string(),
            alternative_endpoint: None,
        }),
    }
}

pub fn context(engine: &Arc<FakeEngine>) -> ConnectionContext {
    ConnectionContext::new(engine.clone(), Arc::new(ConnectorConfig::default())).unwrap()
}

pub async fn connected(engine: &Arc<FakeEngine>, descriptor: ConnectionDescriptor) -> Arc<ConnectionController> {
    let controller = ledger_link_connector::create_connection_controller(context(engine), descriptor, false)
        .await
        .unwrap();
    Arc::new(controller)
}
