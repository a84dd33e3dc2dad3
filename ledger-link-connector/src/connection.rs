//! # Connection Controller
//!
//! Owns at most one [`LiveTransport`] and arbitrates between two kinds of users:
//!
//! - **Leases** ([`ConnectionController::acquire`], [`ConnectionController::use_transport`]):
//!   any number of concurrent claims on the current transport. The first lease takes
//!   the network lock, nested ones only bump a counter, and the lock is given back
//!   when the counter returns to zero.
//! - **Switches** ([`ConnectionController::start_switching_network`]): take the same
//!   network lock exclusively, build and health-check a candidate, and only then
//!   replace (and release) the previous transport.
//!
//! A switch therefore never tears a transport down under an outstanding lease, and a
//! lease requested while a switch holds the lock waits for the switch to finish.

use crate::{
    clock::Clock,
    config::ConnectorConfig,
    engine::LedgerEngine,
    error::ConnectionError,
    transport::{
        endpoint::{HttpLatencyProbe, LatencyProbe},
        ConnectionDescriptor, LiveTransport, TransportInfo,
    },
};
use parking_lot::RwLock;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

/// Zero account of the masterchain; its state is a cheap, always valid read.
const HEALTH_PROBE_ACCOUNT: &str =
    "-1:0000000000000000000000000000000000000000000000000000000000000000";
/// Code hash scanned on local nodes, which may not index the zero account.
const LOCAL_HEALTH_PROBE_CODE_HASH: &str =
    "4e92716de61d456e58f16e4e867e3e93a7548321eace86301b51c8b80ca6239b";

/// Dependencies shared by the connection controller and the sockets it builds.
#[derive(Clone)]
pub struct ConnectionContext {
    pub engine: Arc<dyn LedgerEngine>,
    pub clock: Clock,
    pub http: reqwest::Client,
    pub config: Arc<ConnectorConfig>,
    latency_probe: Option<Arc<dyn LatencyProbe>>,
}

impl ConnectionContext {
    pub fn new(
        engine: Arc<dyn LedgerEngine>,
        config: Arc<ConnectorConfig>,
    ) -> Result<Self, ConnectionError> {
        let http = reqwest::Client::builder()
            .timeout(config.connection.request_timeout())
            .build()
            .map_err(|e| ConnectionError::Transport(e.into()))?;

        Ok(Self {
            engine,
            clock: Clock::default(),
            http,
            config,
            latency_probe: None,
        })
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the HTTP latency probe used by graphql endpoint selection.
    pub fn with_latency_probe(mut self, probe: Arc<dyn LatencyProbe>) -> Self {
        self.latency_probe = Some(probe);
        self
    }

    pub(crate) fn latency_probe(&self) -> Arc<dyn LatencyProbe> {
        match &self.latency_probe {
            Some(probe) => probe.clone(),
            None => Arc::new(HttpLatencyProbe::new(self.http.clone())),
        }
    }
}

#[derive(Default)]
struct LeaseSlot {
    count: usize,
    guard: Option<OwnedMutexGuard<()>>,
}

struct Shared {
    network: Arc<Mutex<()>>,
    current: RwLock<Option<Arc<LiveTransport>>>,
    leases: parking_lot::Mutex<LeaseSlot>,
    /// Serializes lease requesters while the first of them waits for the network lock.
    lease_gate: Mutex<()>,
    health_check: parking_lot::Mutex<Option<CancellationToken>>,
}

impl Shared {
    async fn acquire_lease(&self) {
        let _gate = self.lease_gate.lock().await;
        {
            let mut slot = self.leases.lock();
            if slot.count > 0 {
                slot.count += 1;
                tracing::trace!(leases = slot.count, "Transport lease counter increased");
                return;
            }
        }

        let guard = self.network.clone().lock_owned().await;
        let mut slot = self.leases.lock();
        slot.guard = Some(guard);
        slot.count = 1;
        tracing::trace!("Network lock taken by leases");
    }

    fn release_lease(&self) {
        let guard = {
            let mut slot = self.leases.lock();
            slot.count = slot.count.saturating_sub(1);
            if slot.count == 0 {
                slot.guard.take()
            } else {
                None
            }
        };
        if guard.is_some() {
            tracing::trace!("Network lock released by leases");
        }
    }
}

/// A claim on the transport that was current when the lease was taken.
///
/// The claim ends when the lease is dropped.
pub struct Lease {
    transport: Arc<LiveTransport>,
    shared: Arc<Shared>,
}

impl Lease {
    pub fn live_transport(&self) -> &Arc<LiveTransport> {
        &self.transport
    }
}

impl std::ops::Deref for Lease {
    type Target = LiveTransport;

    fn deref(&self) -> &Self::Target {
        &self.transport
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.shared.release_lease();
    }
}

/// Result of a committed or abandoned switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchOutcome {
    Connected(TransportInfo),
    /// A newer switch request cancelled the health check; nothing changed.
    Cancelled,
}

/// Exclusive right to replace the current transport.
///
/// Holds the network lock until [`switch`](Self::switch) completes or the handle is
/// dropped.
pub struct SwitchHandle<'a> {
    controller: &'a ConnectionController,
    descriptor: ConnectionDescriptor,
    _guard: OwnedMutexGuard<()>,
}

impl SwitchHandle<'_> {
    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    /// Connects to the reserved network and commits the new transport.
    pub async fn switch(self) -> Result<SwitchOutcome, ConnectionError> {
        self.controller.connect(&self.descriptor).await
    }
}

enum HealthCheck {
    Passed,
    Cancelled,
}

pub struct ConnectionController {
    context: ConnectionContext,
    shared: Arc<Shared>,
}

impl ConnectionController {
    pub fn new(context: ConnectionContext) -> Self {
        Self {
            context,
            shared: Arc::new(Shared {
                network: Arc::new(Mutex::new(())),
                current: RwLock::new(None),
                leases: parking_lot::Mutex::new(LeaseSlot::default()),
                lease_gate: Mutex::new(()),
                health_check: parking_lot::Mutex::new(None),
            }),
        }
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    /// Snapshot of the committed transport, if any.
    pub fn initialized_transport(&self) -> Option<TransportInfo> {
        self.shared.current.read().as_ref().map(|t| t.info())
    }

    /// Takes a lease on the current transport.
    ///
    /// Fails immediately when no transport was ever committed.
    pub async fn acquire(&self) -> Result<Lease, ConnectionError> {
        if self.shared.current.read().is_none() {
            return Err(ConnectionError::NotInitialized);
        }

        self.shared.acquire_lease().await;

        // A switch may have failed while we were waiting for the lock.
        let current = self.shared.current.read().clone();
        match current {
            Some(transport) => Ok(Lease {
                transport,
                shared: self.shared.clone(),
            }),
            None => {
                self.shared.release_lease();
                Err(ConnectionError::NotInitialized)
            }
        }
    }

    /// Runs `f` with the current transport under a lease.
    pub async fn use_transport<F, Fut, T>(&self, f: F) -> Result<T, ConnectionError>
    where
        F: FnOnce(Arc<LiveTransport>) -> Fut,
        Fut: Future<Output = T>,
    {
        let lease = self.acquire().await?;
        let output = f(lease.live_transport().clone()).await;
        drop(lease);
        Ok(output)
    }

    /// Reserves the right to become the new active transport.
    ///
    /// Cancels the health check of a candidate that is still being tested, then waits
    /// for the network lock. The lock is held by the returned handle.
    pub async fn start_switching_network(&self, descriptor: ConnectionDescriptor) -> SwitchHandle<'_> {
        let pending = self.shared.health_check.lock().take();
        if let Some(token) = pending {
            tracing::info!("Cancelling health check of the previous network switch");
            token.cancel();
        }

        let guard = self.shared.network.clone().lock_owned().await;
        SwitchHandle {
            controller: self,
            descriptor,
            _guard: guard,
        }
    }

    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<SwitchOutcome, ConnectionError> {
        let group = descriptor.group();
        tracing::info!(network = descriptor.id, %group, kind = %descriptor.kind(), "Connecting to network");

        let result = self.build_and_check(descriptor).await;
        match result {
            Ok(Some(candidate)) => {
                let info = candidate.info();
                let previous = self.shared.current.write().replace(Arc::new(candidate));
                drop(previous);
                tracing::info!(network = info.id, group = %info.group, "Transport committed");
                Ok(SwitchOutcome::Connected(info))
            }
            Ok(None) => {
                tracing::info!(network = descriptor.id, %group, "Network switch cancelled");
                Ok(SwitchOutcome::Cancelled)
            }
            Err(e) => {
                let previous = self.shared.current.write().take();
                drop(previous);
                tracing::error!(network = descriptor.id, %group, "Failed to connect: {}", e);
                Err(ConnectionError::Network {
                    id: descriptor.id,
                    group,
                    source: Box::new(e),
                })
            }
        }
    }

    /// Returns `None` if the health check was cancelled. The candidate is dropped on
    /// every path except success.
    async fn build_and_check(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Option<LiveTransport>, ConnectionError> {
        let candidate = LiveTransport::build(&self.context, descriptor)?;

        let token = CancellationToken::new();
        *self.shared.health_check.lock() = Some(token.clone());
        let checked = health_check(
            &candidate,
            &token,
            self.context.config.connection.health_check_timeout(),
        )
        .await;
        self.shared.health_check.lock().take();

        match checked? {
            HealthCheck::Passed => Ok(Some(candidate)),
            HealthCheck::Cancelled => Ok(None),
        }
    }
}

async fn health_check(
    candidate: &LiveTransport,
    token: &CancellationToken,
    timeout: Duration,
) -> Result<HealthCheck, ConnectionError> {
    let transport = candidate.transport();
    let probe = async {
        if candidate.is_local() {
            transport
                .get_accounts_by_code_hash(LOCAL_HEALTH_PROBE_CODE_HASH, 1)
                .await
                .map(|_| ())
        } else {
            transport
                .get_full_contract_state(HEALTH_PROBE_ACCOUNT)
                .await
                .map(|_| ())
        }
    };

    tokio::select! {
        _ = token.cancelled() => Ok(HealthCheck::Cancelled),
        result = tokio::time::timeout(timeout, probe) => match result {
            Ok(Ok(())) => Ok(HealthCheck::Passed),
            Ok(Err(e)) => Err(ConnectionError::Transport(e)),
            Err(_) => Err(ConnectionError::HealthCheckTimeout),
        },
    }
}

/// Connects once with a throwaway controller and releases the transport right away.
pub async fn check_connection(
    context: &ConnectionContext,
    descriptor: &ConnectionDescriptor,
) -> Result<(), ConnectionError> {
    let controller = ConnectionController::new(context.clone());
    controller.connect(descriptor).await.map(|_| ())
}

/// Creates a controller connected to `descriptor`.
///
/// With `retry` set, failed attempts are logged and repeated after the configured
/// delay until one succeeds.
pub async fn create_connection_controller(
    context: ConnectionContext,
    descriptor: ConnectionDescriptor,
    retry: bool,
) -> Result<ConnectionController, ConnectionError> {
    let retry_delay = context.config.connection.retry_delay();
    loop {
        let controller = ConnectionController::new(context.clone());
        let result = {
            let handle = controller.start_switching_network(descriptor.clone()).await;
            handle.switch().await
        };

        match result {
            Ok(_) => {
                tracing::info!(group = %descriptor.group(), "Successfully connected");
                return Ok(controller);
            }
            Err(e) if retry => {
                tracing::error!("Connection failed: {}", e);
                tokio::time::sleep(retry_delay).await;
                tracing::info!("Restarting connection process");
            }
            Err(e) => return Err(e),
        }
    }
}
