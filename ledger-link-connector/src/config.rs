#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use std::time::Duration;

/// The top-level configuration for the `ledger-link-connector` library.
///
/// This struct aggregates the timeouts and cadences used by the connection and
/// subscription layers. It is typically deserialized from a configuration file
/// and handed to the [`ConnectionContext`](crate::connection::ConnectionContext)
/// and the [`SubscriptionController`](crate::subscription::SubscriptionController).
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub struct ConnectorConfig {
    #[cfg_attr(feature = "serde", serde(default))]
    pub connection: Connection,
    #[cfg_attr(feature = "serde", serde(default))]
    pub endpoints: Endpoints,
    #[cfg_attr(feature = "serde", serde(default))]
    pub polling: Polling,
    #[cfg_attr(feature = "serde", serde(default))]
    pub channels: ChannelConfig,
    #[cfg_attr(feature = "serde", serde(default))]
    pub message: MessageProperties,
}

/// Settings for establishing and health-checking transports.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "kebab-case"))]
pub struct Connection {
    /// How long a freshly built transport may take to answer its health probe.
    pub health_check_timeout_secs: u64,
    /// Delay between whole-network connect attempts when retrying.
    pub retry_delay_secs: u64,
    /// Per-request timeout of the HTTP client shared by all sockets.
    pub request_timeout_secs: u64,
}

/// Settings for the latency race run by the endpoint selector.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "kebab-case"))]
pub struct Endpoints {
    /// Number of full probing rounds before giving up.
    pub max_attempts: u32,
    /// Linear backoff step between rounds, in milliseconds.
    pub backoff_step_ms: u64,
    /// Upper bound of the backoff between rounds, in milliseconds.
    pub max_backoff_ms: u64,
}

/// Cadences of the per-account polling loop.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "kebab-case"))]
pub struct Polling {
    /// Interval applied by the subscription controller to every new subscription.
    pub default_interval_ms: u64,
    /// Interval of a bare subscription that nobody tuned.
    pub background_interval_ms: u64,
    /// Short interval used right after the polling method changed, or when the
    /// handle asks for reliable polling over a transport that cannot chase blocks.
    pub intensive_interval_ms: u64,
    /// Timeout of a single "wait for next block" call.
    pub next_block_timeout_secs: u64,
    /// Pause before retrying a failed step of the reliable branch.
    pub reliable_retry_delay_ms: u64,
}

/// Defines capacities for the channels handed out by the connector.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "kebab-case"))]
pub struct ChannelConfig {
    /// The buffer capacity of the contract notification channel.
    pub notification_buffer: usize,
}

/// Retry policy for outgoing external messages.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "kebab-case"))]
pub struct MessageProperties {
    /// Number of attempts to send a message.
    pub retry_count: u32,
    /// Message expiration timeout in seconds.
    pub timeout_secs: u32,
    /// Expiration timeout grow factor applied before each new attempt.
    pub timeout_grow_factor: f64,
}

impl MessageProperties {
    /// Clamps user supplied values into the accepted range.
    pub fn validated(&self) -> Self {
        Self {
            retry_count: self.retry_count.max(1),
            timeout_secs: self.timeout_secs.max(1),
            timeout_grow_factor: if self.timeout_grow_factor > 0.0 {
                self.timeout_grow_factor
            } else {
                1.2
            },
        }
    }
}

impl Connection {
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Endpoints {
    /// Returns the pause after the given (zero based) failed probing round.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.backoff_step_ms.saturating_mul(attempt as u64);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

impl Polling {
    pub fn default_interval(&self) -> Duration {
        Duration::from_millis(self.default_interval_ms)
    }

    pub fn background_interval(&self) -> Duration {
        Duration::from_millis(self.background_interval_ms)
    }

    pub fn intensive_interval(&self) -> Duration {
        Duration::from_millis(self.intensive_interval_ms)
    }

    pub fn next_block_timeout(&self) -> Duration {
        Duration::from_secs(self.next_block_timeout_secs)
    }

    pub fn reliable_retry_delay(&self) -> Duration {
        Duration::from_millis(self.reliable_retry_delay_ms)
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            health_check_timeout_secs: 10,
            retry_delay_secs: 5,
            request_timeout_secs: 30,
        }
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_step_ms: 100,
            max_backoff_ms: 5000,
        }
    }
}

impl Default for Polling {
    fn default() -> Self {
        Self {
            default_interval_ms: 10_000,
            background_interval_ms: 60_000,
            intensive_interval_ms: 2_000,
            next_block_timeout_secs: 60,
            reliable_retry_delay_ms: 1_000,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            notification_buffer: 256,
        }
    }
}

impl Default for MessageProperties {
    fn default() -> Self {
        Self {
            retry_count: 5,
            timeout_secs: 60,
            timeout_grow_factor: 1.2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_linearly_and_is_capped() {
        let endpoints = Endpoints::default();
        assert_eq!(endpoints.backoff(0), Duration::ZERO);
        assert_eq!(endpoints.backoff(3), Duration::from_millis(300));
        assert_eq!(endpoints.backoff(500), Duration::from_millis(5000));
    }

    #[test]
    fn message_properties_are_clamped() {
        let props = MessageProperties {
            retry_count: 0,
            timeout_secs: 0,
            timeout_grow_factor: 0.0,
        }
        .validated();
        assert_eq!(props.retry_count, 1);
        assert_eq!(props.timeout_secs, 1);
        assert_eq!(props.timeout_grow_factor, 1.2);
    }
}
