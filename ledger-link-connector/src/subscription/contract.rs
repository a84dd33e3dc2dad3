//! # Contract Subscription
//!
//! Keeps one account's contract handle fresh with a background polling loop.
//!
//! The loop follows the polling method recommended by the handle:
//!
//! - **Manual**: sleep for the polling interval, then `refresh()` the handle. The sleep
//!   can be cut short with [`ContractSubscription::skip_refresh_timer`]; a skip that
//!   arrives while nobody sleeps is kept and makes the next manual sleep return at
//!   once. Skips are ignored while the loop polls reliably.
//! - **Reliable** (block-aware transports only): chase blocks touching the account,
//!   starting from a suggested or latest block, and feed each one to `handle_block()`.
//!
//! Every call into the handle goes through a per-subscription mutex, so at most one
//! call is in flight at a time.

use crate::{
    config,
    connection::{ConnectionController, Lease},
    engine::{BlockSource, ContractHandle, ContractHandler, PollingMethod},
    error::SubscriptionError,
};
use anyhow::anyhow;
use futures::FutureExt;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{MappedMutexGuard, Mutex, MutexGuard, Notify},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct LoopState {
    method: Option<PollingMethod>,
    current_block_id: Option<String>,
    suggested_block_id: Option<String>,
}

struct Inner {
    address: String,
    contract: Mutex<Option<Box<dyn ContractHandle>>>,
    /// Declared after `contract`, so the handle is freed before the transport claim.
    lease: parking_lot::Mutex<Option<Lease>>,
    blocks: Option<Arc<dyn BlockSource>>,
    skip: Notify,
    state: parking_lot::Mutex<LoopState>,
    interval: parking_lot::Mutex<Duration>,
    polling: config::Polling,
}

struct RunningLoop {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

/// Dropping the subscription without [`stop`](ContractSubscription::stop) cancels the
/// loop; the handle and the lease are then released once the loop has exited.
pub struct ContractSubscription {
    inner: Arc<Inner>,
    running: Mutex<Option<RunningLoop>>,
}

impl ContractSubscription {
    /// Leases the current transport and asks it for a handle bound to `handler`.
    ///
    /// The lease is released again if the handle cannot be created.
    pub async fn subscribe(
        connection: &ConnectionController,
        address: &str,
        handler: Arc<dyn ContractHandler>,
        polling: &config::Polling,
    ) -> Result<Self, SubscriptionError> {
        let lease = connection.acquire().await?;

        let contract = lease
            .transport()
            .subscribe_to_contract(address, handler)
            .await
            .map_err(|source| SubscriptionError::Subscribe {
                address: address.to_string(),
                source,
            })?
            .ok_or_else(|| SubscriptionError::Subscribe {
                address: address.to_string(),
                source: anyhow!("Contract not found"),
            })?;

        let state = LoopState {
            method: Some(contract.polling_method()),
            ..Default::default()
        };

        tracing::debug!(address, "Contract subscription created");
        Ok(Self {
            inner: Arc::new(Inner {
                address: address.to_string(),
                contract: Mutex::new(Some(contract)),
                blocks: lease.block_source().cloned(),
                lease: parking_lot::Mutex::new(Some(lease)),
                skip: Notify::new(),
                state: parking_lot::Mutex::new(state),
                interval: parking_lot::Mutex::new(polling.background_interval()),
                polling: polling.clone(),
            }),
            running: Mutex::new(None),
        })
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn polling_interval(&self) -> Duration {
        *self.inner.interval.lock()
    }

    /// Takes effect from the next sleep of the manual branch.
    pub fn set_polling_interval(&self, interval: Duration) {
        *self.inner.interval.lock() = interval;
    }

    pub fn polling_method(&self) -> Option<PollingMethod> {
        self.inner.state.lock().method
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lease.lock().is_none()
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|running| !running.stop.is_cancelled())
    }

    /// Launches the polling loop.
    ///
    /// Does nothing if the loop already runs. A loop that is still winding down is
    /// awaited before the new one starts.
    pub async fn start(&self) -> Result<(), SubscriptionError> {
        if self.is_closed() {
            return Err(SubscriptionError::Closed(self.inner.address.clone()));
        }

        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            if !previous.stop.is_cancelled() {
                *running = Some(previous);
                return Ok(());
            }
            tracing::debug!(address = %self.inner.address, "Awaiting previous polling loop");
            if let Err(e) = previous.handle.await {
                tracing::error!(address = %self.inner.address, "Polling loop panicked: {}", e);
            }
        }

        let stop = CancellationToken::new();
        let handle = tokio::spawn(run(self.inner.clone(), stop.clone()));
        *running = Some(RunningLoop { stop, handle });
        tracing::debug!(address = %self.inner.address, "Polling loop started");
        Ok(())
    }

    /// Stops the loop and waits for it to exit.
    ///
    /// A block wait in flight is dropped; a call into the contract handle is always
    /// completed first.
    pub async fn pause(&self) {
        let previous = self.running.lock().await.take();
        let Some(previous) = previous else {
            return;
        };

        previous.stop.cancel();
        if let Err(e) = previous.handle.await {
            tracing::error!(address = %self.inner.address, "Polling loop panicked: {}", e);
        }

        let method = self
            .inner
            .contract
            .lock()
            .await
            .as_ref()
            .map(|contract| contract.polling_method());

        let mut state = self.inner.state.lock();
        state.method = method;
        state.current_block_id = None;
        state.suggested_block_id = None;
    }

    /// Pauses, frees the contract handle and releases the transport lease.
    ///
    /// The subscription cannot be started again afterwards.
    pub async fn stop(&self) {
        self.pause().await;
        let contract = self.inner.contract.lock().await.take();
        drop(contract);
        let lease = self.inner.lease.lock().take();
        drop(lease);
        tracing::debug!(address = %self.inner.address, "Contract subscription stopped");
    }

    /// Cuts the current manual sleep short, or the next one if nobody sleeps.
    ///
    /// Has no effect while the loop polls reliably.
    pub fn skip_refresh_timer(&self) {
        if self.inner.polls_reliably() {
            tracing::trace!(address = %self.inner.address, "Skip ignored during reliable polling");
            return;
        }
        self.inner.skip.notify_one();
    }

    /// Remembers the latest block so a switch to reliable polling starts from it.
    pub async fn prepare_reliable_polling(&self) -> Result<(), SubscriptionError> {
        let Some(blocks) = &self.inner.blocks else {
            return Ok(());
        };

        let block = blocks
            .get_latest_block(&self.inner.address)
            .await
            .map_err(SubscriptionError::PrepareReliablePolling)?;
        self.inner.state.lock().suggested_block_id = Some(block.id);
        Ok(())
    }

    /// Exclusive access to the contract handle.
    pub async fn lock_contract(
        &self,
    ) -> Result<MappedMutexGuard<'_, Box<dyn ContractHandle>>, SubscriptionError> {
        let guard = self.inner.contract.lock().await;
        MutexGuard::try_map(guard, |contract| contract.as_mut())
            .map_err(|_| SubscriptionError::Closed(self.inner.address.clone()))
    }
}

impl Drop for ContractSubscription {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.stop.cancel();
        }
    }
}

async fn run(inner: Arc<Inner>, stop: CancellationToken) {
    let mut previous_method = inner.state.lock().method;

    while !stop.is_cancelled() {
        let method = inner.state.lock().method;
        let changed = method != previous_method;
        previous_method = method;

        match (&inner.blocks, method) {
            (Some(blocks), Some(PollingMethod::Reliable)) => {
                inner.poll_reliable(blocks, changed, &stop).await
            }
            (_, Some(method)) => inner.poll_manual(method, changed, &stop).await,
            (_, None) => break,
        }
    }

    tracing::debug!(address = %inner.address, "Polling loop finished");
}

impl Inner {
    fn polls_reliably(&self) -> bool {
        self.blocks.is_some() && self.state.lock().method == Some(PollingMethod::Reliable)
    }

    async fn poll_manual(&self, method: PollingMethod, changed: bool, stop: &CancellationToken) {
        self.state.lock().current_block_id = None;

        let interval = if method == PollingMethod::Manual && !changed {
            *self.interval.lock()
        } else {
            self.polling.intensive_interval()
        };

        tracing::trace!(address = %self.address, ?interval, "Waiting for the next refresh");
        if !self.skippable_sleep(interval, stop).await {
            return;
        }

        let mut guard = self.contract.lock().await;
        let Some(contract) = guard.as_mut() else {
            return;
        };
        let refreshed = contract.refresh().await.map(|_| contract.polling_method());
        drop(guard);

        match refreshed {
            Ok(method) => self.state.lock().method = Some(method),
            Err(e) => tracing::warn!(address = %self.address, "Error during account refresh: {:#}", e),
        }
    }

    async fn poll_reliable(&self, blocks: &Arc<dyn BlockSource>, changed: bool, stop: &CancellationToken) {
        // A skip left over from the manual branch belongs to no sleep of this one.
        let _ = self.skip.notified().now_or_never();

        let current = {
            let mut state = self.state.lock();
            let suggested = state.suggested_block_id.take();
            if changed && suggested.is_some() {
                state.current_block_id = suggested;
            }
            state.current_block_id.clone()
        };

        let next = match current {
            None => {
                tracing::warn!(address = %self.address, "Starting reliable polling with unknown block");
                let latest = tokio::select! {
                    result = blocks.get_latest_block(&self.address) => result,
                    _ = stop.cancelled() => return,
                };
                latest.map(|block| {
                    self.state.lock().current_block_id = Some(block.id.clone());
                    block.id
                })
            }
            Some(current) => {
                let timeout = self.polling.next_block_timeout();
                let wait = tokio::time::timeout(
                    timeout,
                    blocks.wait_for_next_block(&current, &self.address, timeout),
                );
                tokio::select! {
                    result = wait => result.unwrap_or_else(|_| Err(anyhow!("Timed out waiting for the next block"))),
                    _ = stop.cancelled() => return,
                }
            }
        };

        let next = match next {
            Ok(next) => next,
            Err(e) => {
                tracing::error!(address = %self.address, "Failed to fetch next block: {:#}", e);
                self.retry_sleep(stop).await;
                return;
            }
        };

        let mut guard = self.contract.lock().await;
        let Some(contract) = guard.as_mut() else {
            return;
        };
        let handled = contract.handle_block(&next).await.map(|_| contract.polling_method());
        drop(guard);

        match handled {
            Ok(method) => {
                let mut state = self.state.lock();
                state.method = Some(method);
                state.current_block_id = Some(next);
            }
            Err(e) => {
                tracing::error!(address = %self.address, block = %next, "Failed to handle block: {:#}", e);
                self.retry_sleep(stop).await;
            }
        }
    }

    /// Returns `false` if the loop was stopped during the sleep.
    async fn skippable_sleep(&self, duration: Duration, stop: &CancellationToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.skip.notified() => !stop.is_cancelled(),
            _ = stop.cancelled() => false,
        }
    }

    async fn retry_sleep(&self, stop: &CancellationToken) {
        tokio::select! {
            _ = tokio::time::sleep(self.polling.reliable_retry_delay()) => {}
            _ = stop.cancelled() => {}
        }
    }
}
