use thiserror::Error;

/// Errors raised while establishing, checking or leasing a network transport.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Connection is not initialized")]
    NotInitialized,

    #[error("No available endpoint found")]
    NoEndpointAvailable,

    #[error("Connection timeout")]
    HealthCheckTimeout,

    #[error("Failed to create connection: {0:#}")]
    Transport(#[source] anyhow::Error),

    #[error("Target preset id not found: {0}")]
    UnknownPreset(String),

    #[error("Failed to connect to network {id} ({group}): {source}")]
    Network {
        id: u32,
        group: String,
        #[source]
        source: Box<ConnectionError>,
    },
}

/// Errors raised by contract subscriptions and the subscription controller.
#[derive(Error, Debug)]
pub enum SubscriptionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Failed to subscribe to contract {address}: {source:#}")]
    Subscribe {
        address: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Contract subscription {0} is closed")]
    Closed(String),

    #[error("Failed to prepare reliable polling: {0:#}")]
    PrepareReliablePolling(#[source] anyhow::Error),
}

/// Errors surfaced to callers of the message sending paths.
#[derive(Error, Debug)]
pub enum SendError {
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error("Failed to send message: {0:#}")]
    Rejected(#[source] anyhow::Error),

    #[error("Message {0} is already being sent")]
    DuplicateMessage(String),

    #[error("Message request was dropped before it completed")]
    Cancelled,

    #[error("Message expired{}", exit_code.map(|code| format!(". Possible exit code: {code}")).unwrap_or_default())]
    Expired { exit_code: Option<i32> },

    #[error("Failed to build message: {0:#}")]
    Build(#[source] anyhow::Error),
}
