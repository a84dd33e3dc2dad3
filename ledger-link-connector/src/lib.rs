//! An asynchronous network client core for a sharded ledger.
//!
//! This crate owns the networking around an injected ledger engine: it selects
//! endpoints, builds and health-checks transports, switches networks without tearing
//! them down under active users, and keeps subscribed accounts fresh with background
//! polling loops.
//!
//! # Key Components
//!
//! *   [`connection::ConnectionController`]: owns the current transport. Hands out
//!     shared leases and performs exclusive, health-checked network switches.
//! *   [`subscription::SubscriptionController`]: multiplexes topic subscriptions and
//!     message sends onto one [`subscription::ContractSubscription`] per address, and
//!     emits [`subscription::ContractEvent`]s for client-subscribed topics.
//! *   [`transport`]: connection descriptors, the per-kind sockets and the graphql
//!     [`transport::endpoint::EndpointSelector`].
//! *   [`engine`]: the traits a ledger engine implements to plug into the connector.
pub mod clock;
/// Defines configuration structures for the connector.
pub mod config;
/// Transport ownership, leasing and network switching.
pub mod connection;
pub mod engine;
pub mod error;
/// Per-address polling loops and the controller multiplexing them.
pub mod subscription;
pub mod transport;

pub use clock::Clock;
pub use connection::{
    check_connection, create_connection_controller, ConnectionContext, ConnectionController,
};
pub use error::{ConnectionError, SendError, SubscriptionError};
pub use subscription::{send_with_retries, SubscriptionController};
pub use transport::{ConnectionDescriptor, ConnectionParams};
