//! # Subscription Controller
//!
//! Multiplexes topic subscriptions from the client and from internal callers onto a
//! single [`ContractSubscription`] per address, and tracks in-flight message sends.
//!
//! A contract subscription exists while at least one subscriber wants a topic for its
//! address or a message to that address is still pending. Topic changes are
//! serialized by one controller-wide lock; notifications and send results flow from
//! the engine callbacks through lock-free maps.

pub mod contract;
pub mod messages;
pub mod topics;

pub use contract::ContractSubscription;
pub use messages::send_with_retries;
pub use topics::{Subscriber, SubscriptionTopics, TopicsUpdate};

use crate::{
    config::ConnectorConfig,
    connection::ConnectionController,
    engine::{
        ContractHandler, ContractState, PendingTransaction, SignedMessage, Transaction,
        TransactionsBatchInfo,
    },
    error::{SendError, SubscriptionError},
};
use dashmap::DashMap;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Weak,
    },
};
use tokio::sync::{mpsc, oneshot, Mutex};

/// Notification produced for a client-subscribed address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractEvent {
    StateChanged {
        address: String,
        state: ContractState,
    },
    TransactionsFound {
        address: String,
        transactions: Vec<Transaction>,
        info: TransactionsBatchInfo,
    },
}

type SendResult = Result<Option<Transaction>, SendError>;

#[derive(Debug, Clone, Default)]
struct SubscriptionState {
    client: SubscriptionTopics,
    internal: HashMap<u32, SubscriptionTopics>,
}

impl SubscriptionState {
    fn union(&self) -> SubscriptionTopics {
        self.internal
            .values()
            .fold(self.client, |acc, topics| acc.union(*topics))
    }
}

#[derive(Default)]
struct Registry {
    subscriptions: HashMap<String, Arc<ContractSubscription>>,
    states: HashMap<String, SubscriptionState>,
}

struct Shared {
    connection: Arc<ConnectionController>,
    config: Arc<ConnectorConfig>,
    registry: Mutex<Registry>,
    /// Mirror of the client topics, read from engine callbacks.
    client_topics: DashMap<String, SubscriptionTopics>,
    pending: DashMap<String, HashMap<String, oneshot::Sender<SendResult>>>,
    notifier: mpsc::Sender<ContractEvent>,
    next_internal_id: AtomicU32,
}

#[derive(Clone)]
pub struct SubscriptionController {
    shared: Arc<Shared>,
}

impl SubscriptionController {
    /// Creates the controller together with the receiving end of its notifications.
    pub fn new(
        connection: Arc<ConnectionController>,
        config: Arc<ConnectorConfig>,
    ) -> (Self, mpsc::Receiver<ContractEvent>) {
        let (notifier, events) = mpsc::channel(config.channels.notification_buffer.max(1));
        let controller = Self {
            shared: Arc::new(Shared {
                connection,
                config,
                registry: Mutex::new(Registry::default()),
                client_topics: DashMap::new(),
                pending: DashMap::new(),
                notifier,
                next_internal_id: AtomicU32::new(1),
            }),
        };
        (controller, events)
    }

    pub fn connection(&self) -> &Arc<ConnectionController> {
        &self.shared.connection
    }

    /// Allocates an id for an internal subscriber.
    pub fn next_internal_subscriber(&self) -> Subscriber {
        Subscriber::Internal(self.shared.next_internal_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Merges `update` into the topics of `subscriber` for `address`.
    ///
    /// Returns the resulting topics of that subscriber. The contract subscription is
    /// created on first demand and torn down once no subscriber wants any topic and
    /// no send is pending.
    pub async fn subscribe_to_contract(
        &self,
        address: &str,
        update: TopicsUpdate,
        subscriber: Subscriber,
    ) -> Result<SubscriptionTopics, SubscriptionError> {
        let shared = &self.shared;
        let mut registry = shared.registry.lock().await;

        let mut state = registry.states.get(address).cloned().unwrap_or_default();
        let changed = match subscriber {
            Subscriber::Client => {
                state.client = state.client.merge(update);
                state.client
            }
            Subscriber::Internal(id) => {
                let topics = state.internal.get(&id).copied().unwrap_or_default().merge(update);
                if topics.is_empty() {
                    state.internal.remove(&id);
                } else {
                    state.internal.insert(id, topics);
                }
                topics
            }
        };

        if state.union().is_empty() {
            registry.states.remove(address);
            shared.client_topics.remove(address);
            shared.try_unsubscribe(&mut registry, address).await;
            return Ok(changed);
        }

        let existing = registry.subscriptions.get(address).cloned();
        let (subscription, is_new) = match existing {
            Some(subscription) => (subscription, false),
            None => {
                let subscription = Arc::new(shared.create_subscription(address).await?);
                registry
                    .subscriptions
                    .insert(address.to_string(), subscription.clone());
                (subscription, true)
            }
        };

        shared.client_topics.insert(address.to_string(), state.client);
        registry.states.insert(address.to_string(), state);
        tracing::debug!(address, %subscriber, ?changed, "Subscription topics updated");

        if is_new {
            subscription.start().await?;
        }

        Ok(changed)
    }

    pub async fn unsubscribe_from_contract(
        &self,
        address: &str,
        subscriber: Subscriber,
    ) -> Result<(), SubscriptionError> {
        self.subscribe_to_contract(address, TopicsUpdate::CLEAR, subscriber)
            .await
            .map(|_| ())
    }

    pub async fn unsubscribe_from_all_contracts(
        &self,
        subscriber: Subscriber,
    ) -> Result<(), SubscriptionError> {
        let addresses: Vec<String> = {
            let registry = self.shared.registry.lock().await;
            registry.subscriptions.keys().cloned().collect()
        };

        for address in addresses {
            self.unsubscribe_from_contract(&address, subscriber).await?;
        }
        Ok(())
    }

    /// Client topics per address.
    pub fn subscription_states(&self) -> HashMap<String, SubscriptionTopics> {
        self.shared
            .client_topics
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Whether a contract subscription currently exists for `address`.
    pub async fn is_subscribed(&self, address: &str) -> bool {
        self.shared
            .registry
            .lock()
            .await
            .subscriptions
            .contains_key(address)
    }

    /// Broadcasts `message` and waits until it lands or expires.
    ///
    /// Resolves to `None` if the message expired. The address stays subscribed until
    /// the outcome is known or the returned future is dropped.
    pub async fn send_message(
        &self,
        address: &str,
        message: &SignedMessage,
    ) -> Result<Option<Transaction>, SendError> {
        let outcome = self.shared.register_pending(address, &message.hash)?;
        let pending = PendingSend {
            shared: self.shared.clone(),
            address: address.to_string(),
            hash: message.hash.clone(),
            armed: true,
        };

        // The internal subscription is released by the task even if the caller stops
        // waiting halfway through.
        let dispatched = {
            let controller = self.clone();
            let target = address.to_string();
            let message = message.clone();
            tokio::spawn(async move {
                let subscriber = controller.next_internal_subscriber();
                let dispatched = controller.dispatch(&target, &message, subscriber).await;
                if let Err(e) = controller.unsubscribe_from_contract(&target, subscriber).await {
                    tracing::warn!(address = %target, %subscriber, "Failed to release internal subscription: {}", e);
                }
                dispatched
            })
            .await
            .unwrap_or_else(|e| {
                tracing::error!(address, "Message dispatch task failed: {}", e);
                Err(SendError::Cancelled)
            })
        };

        if let Err(e) = dispatched {
            tracing::warn!(address, hash = %message.hash, "Failed to send message: {}", e);
            pending.finish().await;
            return Err(e);
        }

        let result = outcome.await.unwrap_or(Err(SendError::Cancelled));
        pending.finish().await;
        result
    }

    async fn dispatch(
        &self,
        address: &str,
        message: &SignedMessage,
        subscriber: Subscriber,
    ) -> Result<(), SendError> {
        let subscription = self.momentary_subscription(address, subscriber).await?;
        subscription.prepare_reliable_polling().await?;

        let mut contract = subscription.lock_contract().await?;
        contract
            .send_message(message)
            .await
            .map_err(SendError::Rejected)?;
        drop(contract);

        subscription.skip_refresh_timer();
        Ok(())
    }

    /// Executes `message` against the last known state without broadcasting it.
    pub async fn send_message_locally(
        &self,
        address: &str,
        message: &SignedMessage,
    ) -> Result<Transaction, SendError> {
        let controller = self.clone();
        let address = address.to_string();
        let message = message.clone();

        tokio::spawn(async move {
            let subscriber = controller.next_internal_subscriber();
            let result = async {
                let subscription = controller.momentary_subscription(&address, subscriber).await?;
                let mut contract = subscription.lock_contract().await?;
                let transaction = contract.send_message_locally(&message).await;
                transaction.map_err(SendError::Rejected)
            }
            .await;

            if let Err(e) = controller.unsubscribe_from_contract(&address, subscriber).await {
                tracing::warn!(address = %address, %subscriber, "Failed to release internal subscription: {}", e);
            }
            result
        })
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Local execution task failed: {}", e);
            Err(SendError::Cancelled)
        })
    }

    async fn momentary_subscription(
        &self,
        address: &str,
        subscriber: Subscriber,
    ) -> Result<Arc<ContractSubscription>, SubscriptionError> {
        self.subscribe_to_contract(address, TopicsUpdate::state(true), subscriber)
            .await?;
        self.shared
            .registry
            .lock()
            .await
            .subscriptions
            .get(address)
            .cloned()
            .ok_or_else(|| SubscriptionError::Closed(address.to_string()))
    }
}

impl Shared {
    async fn create_subscription(
        self: &Arc<Self>,
        address: &str,
    ) -> Result<ContractSubscription, SubscriptionError> {
        let handler = Arc::new(SubscriptionHandler {
            address: address.to_string(),
            shared: Arc::downgrade(self),
            enabled: AtomicBool::new(false),
        });

        let subscription = ContractSubscription::subscribe(
            &self.connection,
            address,
            handler.clone(),
            &self.config.polling,
        )
        .await?;
        subscription.set_polling_interval(self.config.polling.default_interval());
        handler.enabled.store(true, Ordering::Release);

        Ok(subscription)
    }

    /// Stops the subscription of `address` if nobody needs it anymore.
    async fn try_unsubscribe(&self, registry: &mut Registry, address: &str) {
        if registry.states.contains_key(address) || self.has_pending(address) {
            return;
        }

        if let Some(subscription) = registry.subscriptions.remove(address) {
            tracing::debug!(address, "Dropping contract subscription");
            subscription.stop().await;
        }
    }

    async fn try_unsubscribe_locked(&self, address: &str) {
        let mut registry = self.registry.lock().await;
        self.try_unsubscribe(&mut registry, address).await;
    }

    fn register_pending(
        &self,
        address: &str,
        hash: &str,
    ) -> Result<oneshot::Receiver<SendResult>, SendError> {
        let mut requests = self.pending.entry(address.to_string()).or_default();
        if requests.contains_key(hash) {
            return Err(SendError::DuplicateMessage(hash.to_string()));
        }

        let (tx, rx) = oneshot::channel();
        requests.insert(hash.to_string(), tx);
        Ok(rx)
    }

    fn take_pending(&self, address: &str, hash: &str) -> Option<oneshot::Sender<SendResult>> {
        let removed = self
            .pending
            .get_mut(address)
            .and_then(|mut requests| requests.remove(hash));
        self.pending.remove_if(address, |_, requests| requests.is_empty());
        removed
    }

    fn has_pending(&self, address: &str) -> bool {
        self.pending
            .get(address)
            .is_some_and(|requests| !requests.is_empty())
    }

    fn resolve(self: &Arc<Self>, address: &str, hash: &str, result: SendResult) {
        let Some(sender) = self.take_pending(address, hash) else {
            tracing::debug!(address, hash, "No pending send for message");
            return;
        };

        if sender.send(result).is_err() {
            // The sender gave up waiting; nobody else will clean up after it.
            let shared = self.clone();
            let address = address.to_string();
            tokio::spawn(async move {
                shared.try_unsubscribe_locked(&address).await;
            });
        }
    }

    fn notify(&self, event: ContractEvent) {
        if let Err(e) = self.notifier.try_send(event) {
            tracing::warn!("Dropping contract notification: {}", e);
        }
    }

    fn client_wants(&self, address: &str, wanted: impl Fn(&SubscriptionTopics) -> bool) -> bool {
        self.client_topics
            .get(address)
            .is_some_and(|topics| wanted(topics.value()))
    }
}

/// Pending entry of one [`SubscriptionController::send_message`] call.
///
/// Dropping it without [`finish`](Self::finish) means the caller stopped waiting: the
/// entry is forgotten and the subscription teardown is handed to a task.
struct PendingSend {
    shared: Arc<Shared>,
    address: String,
    hash: String,
    armed: bool,
}

impl PendingSend {
    async fn finish(mut self) {
        self.armed = false;
        self.shared.take_pending(&self.address, &self.hash);
        self.shared.try_unsubscribe_locked(&self.address).await;
    }
}

impl Drop for PendingSend {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        self.shared.take_pending(&self.address, &self.hash);
        tracing::debug!(address = %self.address, hash = %self.hash, "Message send abandoned");

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let shared = self.shared.clone();
        let address = self.address.clone();
        runtime.spawn(async move {
            shared.try_unsubscribe_locked(&address).await;
        });
    }
}

struct SubscriptionHandler {
    address: String,
    shared: Weak<Shared>,
    enabled: AtomicBool,
}

impl SubscriptionHandler {
    fn shared(&self) -> Option<Arc<Shared>> {
        if !self.enabled.load(Ordering::Acquire) {
            return None;
        }
        self.shared.upgrade()
    }
}

impl ContractHandler for SubscriptionHandler {
    fn on_message_sent(&self, pending: PendingTransaction, transaction: Transaction) {
        if let Some(shared) = self.shared() {
            shared.resolve(&self.address, &pending.message_hash, Ok(Some(transaction)));
        }
    }

    fn on_message_expired(&self, pending: PendingTransaction) {
        if let Some(shared) = self.shared() {
            shared.resolve(&self.address, &pending.message_hash, Ok(None));
        }
    }

    fn on_state_changed(&self, state: ContractState) {
        if let Some(shared) = self.shared() {
            if shared.client_wants(&self.address, |topics| topics.state) {
                shared.notify(ContractEvent::StateChanged {
                    address: self.address.clone(),
                    state,
                });
            }
        }
    }

    fn on_transactions_found(&self, transactions: Vec<Transaction>, info: TransactionsBatchInfo) {
        if let Some(shared) = self.shared() {
            if shared.client_wants(&self.address, |topics| topics.transactions) {
                shared.notify(ContractEvent::TransactionsFound {
                    address: self.address.clone(),
                    transactions,
                    info,
                });
            }
        }
    }
}
